use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use super::SetOnDrop;
use crate::coroutine::GUARD_WORD;
use crate::{
    is_inside_coroutine, running_status, suspend, suspend_with, BoxError, Builder, Control,
    Coroutine, Error, Operation, Payload, Status,
};

#[derive(Debug, PartialEq)]
struct Foo(u32);

impl fmt::Display for Foo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "foo {}", self.0)
    }
}

impl std::error::Error for Foo {}

#[test]
fn smoke() {
    let hit = Rc::new(Cell::new(false));
    let hit2 = hit.clone();
    let coroutine = Coroutine::from_fn(move || hit2.set(true)).unwrap();
    assert!(!hit.get());
    assert_eq!(coroutine.status(), Status::Starting);
    coroutine.resume().unwrap();
    assert!(hit.get());
    assert_eq!(coroutine.status(), Status::Completed);
}

#[test]
fn suspend_and_resume() {
    let hit = Rc::new(Cell::new(false));
    let hit2 = hit.clone();
    let coroutine = Coroutine::new(move |c: &Control| -> crate::Result<()> {
        assert_eq!(c.status(), Status::Running);
        c.suspend()?;
        hit2.set(true);
        c.suspend()
    })
    .unwrap();
    assert_eq!(coroutine.status(), Status::Starting);
    coroutine.resume().unwrap();
    assert!(!hit.get());
    assert_eq!(coroutine.status(), Status::Sleeping);
    coroutine.resume().unwrap();
    assert!(hit.get());
    assert_eq!(coroutine.status(), Status::Sleeping);
    coroutine.resume().unwrap();
    assert_eq!(coroutine.status(), Status::Completed);
}

#[test]
fn values_cross_every_handoff() {
    let coroutine = Coroutine::new(|c: &Control| -> crate::Result<()> {
        let first: f64 = c.take_input().take()?;
        assert_eq!(first, 2.0);
        let got: i32 = c.suspend_with("x")?.take()?;
        assert_eq!(got, 42);
        Ok(())
    })
    .unwrap();

    let mut out = coroutine.resume_with(2.0f64).unwrap();
    assert_eq!(out.take::<&str>().unwrap(), "x");
    let out = coroutine.resume_with(42i32).unwrap();
    assert!(out.is_empty());
    assert_eq!(coroutine.status(), Status::Completed);
}

#[test]
fn typed_resume_and_suspend() {
    let coroutine = Coroutine::new(|c: &Control| -> crate::Result<()> {
        let n = c.suspend_as::<u8>(Payload::new(1u32))?;
        assert_eq!(n, 7);
        assert_eq!(c.suspend_opt::<u8>(Payload::new(2u32))?, None);
        Ok(())
    })
    .unwrap();

    assert_eq!(coroutine.resume_as::<u32>(Payload::empty()).unwrap(), 1);
    assert_eq!(coroutine.resume_opt::<u32>(Payload::new(7u8)).unwrap(), Some(2));
    assert_eq!(coroutine.resume_opt::<u32>(Payload::new("no")).unwrap(), None);
    assert_eq!(coroutine.status(), Status::Completed);
}

#[test]
fn wrong_payload_type_fails_in_body() {
    let coroutine = Coroutine::new(|c: &Control| -> crate::Result<()> {
        let _: i32 = c.suspend_as(Payload::empty())?;
        Ok(())
    })
    .unwrap();
    coroutine.resume().unwrap();
    match coroutine.resume_with("not a number") {
        Err(Error::Body(err)) => match err.downcast::<Error>() {
            Ok(err) => assert!(matches!(*err, Error::TypeMismatch { .. })),
            Err(err) => panic!("unexpected error {}", err),
        },
        other => panic!("unexpected result {:?}", other),
    }
}

#[test]
fn thousand_iterations() {
    let c = Rc::new(Cell::new(0));
    let c2 = c.clone();
    let coroutine = Coroutine::from_fn(move || -> crate::Result<()> {
        for i in 0..1000 {
            assert_eq!(c2.get(), i);
            c2.set(i + 1);
            suspend()?;
        }
        Ok(())
    })
    .unwrap();

    let mut r = 0;
    coroutine.resume().unwrap();
    while coroutine.status() != Status::Completed {
        r += 1;
        coroutine.resume().unwrap();
    }
    assert_eq!(r, 1000);
    assert_eq!(c.get(), 1000);
}

#[test]
fn free_functions_follow_the_running_coroutine() {
    assert!(!is_inside_coroutine());
    assert_eq!(running_status(), None);
    assert!(matches!(
        suspend(),
        Err(Error::NotInCoroutine {
            op: Operation::Suspend
        })
    ));

    #[inline(never)]
    fn deep(n: u32) -> crate::Result<()> {
        if n == 0 {
            assert!(is_inside_coroutine());
            assert_eq!(running_status(), Some(Status::Running));
            suspend_with("deep")?;
            Ok(())
        } else {
            deep(n - 1)
        }
    }

    let coroutine = Coroutine::from_fn(|| deep(20)).unwrap();
    let mut out = coroutine.resume_any(Payload::empty()).unwrap();
    assert_eq!(out.take::<&str>().unwrap(), "deep");
    assert!(!is_inside_coroutine());
    coroutine.resume().unwrap();
    assert_eq!(coroutine.status(), Status::Completed);
}

// The body can't outlive the borrows it captures.
#[test]
fn scoped_borrow() {
    let mut total = 0;
    {
        let coroutine = Coroutine::new(|c: &Control| -> crate::Result<()> {
            for i in 1..=4 {
                total += i;
                c.suspend()?;
            }
            Ok(())
        })
        .unwrap();
        while !coroutine.status().is_terminal() {
            coroutine.resume().unwrap();
        }
    }
    assert_eq!(total, 10);
}

#[test]
fn stateful() {
    #[repr(align(128))]
    struct Aligned(u8);
    let state = [41, 42, 43, 44, 45];
    let aligned = Aligned(100);
    let coroutine = Coroutine::new(move |c: &Control| -> crate::Result<()> {
        assert_eq!(&aligned as *const _ as usize % 128, 0);
        assert_eq!(aligned.0, 100);
        for i in state {
            c.suspend_with(i)?;
        }
        Ok(())
    })
    .unwrap();
    for i in state {
        assert_eq!(coroutine.resume_as::<i32>(Payload::empty()).unwrap(), i);
    }
    assert!(coroutine.resume_any(Payload::empty()).unwrap().is_empty());
}

#[test]
fn large_capture() {
    let big = [1u8; 16 * 1024];
    let coroutine = Builder::new()
        .stack_size(1024 * 1024)
        .spawn_fn(move || -> crate::Result<()> {
            assert_eq!(big[100], 1);
            suspend()?;
            assert_eq!(big.iter().map(|&b| b as usize).sum::<usize>(), 16 * 1024);
            Ok(())
        })
        .unwrap();
    coroutine.resume().unwrap();
    assert_eq!(coroutine.status(), Status::Sleeping);
    coroutine.resume().unwrap();
    assert_eq!(coroutine.status(), Status::Completed);
}

#[test]
fn large_capture_dropped_without_running() {
    let drop_count = Rc::new(Cell::new(0));
    let on_drop = SetOnDrop(drop_count.clone());
    let big = [7u64; 4096];
    let coroutine = Coroutine::from_fn(move || {
        let _on_drop = on_drop;
        assert_eq!(big[0], 7);
    })
    .unwrap();
    assert_eq!(drop_count.get(), 0);
    drop(coroutine);
    assert_eq!(drop_count.get(), 1);
}

#[test]
fn backtrace_traces_to_host() {
    #[inline(never)] // try to get this to show up in backtraces
    fn look_for_me() {
        run_test();
    }
    fn assert_contains_host() {
        let trace = backtrace::Backtrace::new();
        println!("{:?}", trace);
        assert!(trace
            .frames()
            .iter()
            .flat_map(|f| f.symbols())
            .filter_map(|s| Some(s.name()?.to_string()))
            .any(|s| s.contains("look_for_me")));
    }

    fn run_test() {
        assert_contains_host();
        let coroutine = Coroutine::new(|c: &Control| -> crate::Result<()> {
            assert_contains_host();
            c.suspend()?;
            assert_contains_host();
            Ok(())
        })
        .unwrap();
        coroutine.resume().unwrap();
        coroutine.resume().unwrap();
        assert_eq!(coroutine.status(), Status::Completed);
    }

    look_for_me();
}

#[test]
#[should_panic(expected = "foobar")]
fn panics_propagated() {
    let a = Rc::new(Cell::new(0));
    let b = SetOnDrop(a.clone());
    let coroutine = Coroutine::from_fn::<_, ()>(move || {
        let _b = b;
        panic!("foobar");
    })
    .unwrap();
    let result = panic::catch_unwind(AssertUnwindSafe(|| coroutine.resume()));
    assert!(result.is_err());
    assert_eq!(a.get(), 1);
    assert_eq!(coroutine.status(), Status::Completed);
    assert!(!is_inside_coroutine());
    panic::resume_unwind(result.unwrap_err());
}

#[test]
fn body_error_keeps_identity() {
    let coroutine = Coroutine::new(|c: &Control| -> Result<(), BoxError> {
        c.suspend()?;
        Err(Box::new(Foo(7)))
    })
    .unwrap();
    coroutine.resume().unwrap();
    let err = coroutine.resume().unwrap_err();
    assert!(!err.is_state_error());
    assert_eq!(err.to_string(), "foo 7");
    let err = err.into_body().unwrap();
    assert_eq!(*err.downcast::<Foo>().unwrap(), Foo(7));
    assert_eq!(coroutine.status(), Status::Completed);
}

#[test]
fn state_errors_leave_status_unchanged() {
    let coroutine = Coroutine::from_fn(|| ()).unwrap();
    coroutine.resume().unwrap();
    let err = coroutine.resume().unwrap_err();
    assert!(err.is_state_error());
    assert!(matches!(
        err,
        Error::State {
            op: Operation::Resume,
            status: Status::Completed
        }
    ));
    assert_eq!(coroutine.status(), Status::Completed);
    assert_eq!(err.to_string(), "cannot resume a coroutine that is completed");
}

#[test]
fn running_coroutine_rejects_abort_and_resume() {
    let slot: Rc<Cell<Option<Rc<Coroutine<'static>>>>> = Rc::new(Cell::new(None));
    let slot2 = slot.clone();
    let coroutine = Rc::new(
        Coroutine::from_fn(move || {
            let this = slot2.take().unwrap();
            assert!(matches!(
                this.abort(),
                Err(Error::State {
                    op: Operation::Abort,
                    status: Status::Running
                })
            ));
            assert!(matches!(
                this.resume(),
                Err(Error::State {
                    op: Operation::Resume,
                    status: Status::Running
                })
            ));
            assert_eq!(this.status(), Status::Running);
        })
        .unwrap(),
    );
    slot.set(Some(coroutine.clone()));
    coroutine.resume().unwrap();
    assert_eq!(coroutine.status(), Status::Completed);
}

#[test]
fn abort_before_start() {
    let a = Rc::new(Cell::new(0));
    let b = SetOnDrop(a.clone());
    let ran = Rc::new(Cell::new(false));
    let ran2 = ran.clone();
    let coroutine = Coroutine::from_fn(move || {
        let _b = b;
        ran2.set(true);
    })
    .unwrap();
    coroutine.abort().unwrap();
    assert_eq!(a.get(), 1);
    assert!(!ran.get());
    assert_eq!(coroutine.status(), Status::Completed);

    // Aborting again is a no-op.
    coroutine.abort().unwrap();
    assert!(coroutine.resume().unwrap_err().is_state_error());
    drop(coroutine);
    assert_eq!(a.get(), 1);
}

#[test]
fn abort_unwinds_once() {
    let count = Rc::new(Cell::new(0));
    let a = SetOnDrop(count.clone());
    let b = SetOnDrop(count.clone());
    let after = Rc::new(Cell::new(false));
    let after2 = after.clone();
    let coroutine = Coroutine::new(move |c: &Control| -> crate::Result<()> {
        drop(a);
        let _b = b;
        c.suspend()?;
        after2.set(true);
        Ok(())
    })
    .unwrap();
    coroutine.resume().unwrap();
    assert_eq!(count.get(), 1);
    coroutine.abort().unwrap();
    assert_eq!(count.get(), 2);
    assert!(!after.get());
    assert_eq!(coroutine.status(), Status::Completed);
    assert!(!is_inside_coroutine());
    drop(coroutine);
    assert_eq!(count.get(), 2);
}

#[test]
fn abort_completed_is_noop() {
    let coroutine = Coroutine::from_fn(|| ()).unwrap();
    coroutine.resume().unwrap();
    coroutine.abort().unwrap();
    assert_eq!(coroutine.status(), Status::Completed);
}

#[test]
fn error_raised_while_unwinding_reaches_abort() {
    let coroutine = Coroutine::new(|c: &Control| -> Result<(), BoxError> {
        let unwound = panic::catch_unwind(AssertUnwindSafe(|| c.suspend()));
        assert!(unwound.is_err());
        Err(Box::new(Foo(1)))
    })
    .unwrap();
    coroutine.resume().unwrap();
    let err = coroutine.abort().unwrap_err();
    assert_eq!(*err.into_body().unwrap().downcast::<Foo>().unwrap(), Foo(1));
    assert_eq!(coroutine.status(), Status::Completed);
}

#[test]
fn intercepted_unwind() {
    let count = Rc::new(Cell::new(0));
    let guard = SetOnDrop(count.clone());
    let coroutine = Coroutine::new(move |c: &Control| -> crate::Result<()> {
        let _guard = guard;
        let unwound = panic::catch_unwind(AssertUnwindSafe(|| c.suspend()));
        assert!(unwound.is_err());
        c.suspend()
    })
    .unwrap();
    coroutine.resume().unwrap();
    assert!(matches!(coroutine.abort(), Err(Error::UnwindIntercepted)));
    assert_eq!(coroutine.status(), Status::Sleeping);
    assert_eq!(count.get(), 0);

    // The second unwind is not caught.
    coroutine.abort().unwrap();
    assert_eq!(coroutine.status(), Status::Completed);
    assert_eq!(count.get(), 1);
}

#[test]
fn drop_aborts_suspended() {
    let count = Rc::new(Cell::new(0));
    let guard = SetOnDrop(count.clone());
    let coroutine = Coroutine::new(move |c: &Control| -> crate::Result<()> {
        let _guard = guard;
        loop {
            c.suspend()?;
        }
    })
    .unwrap();
    coroutine.resume().unwrap();
    coroutine.resume().unwrap();
    assert_eq!(count.get(), 0);
    drop(coroutine);
    assert_eq!(count.get(), 1);
}

#[test]
fn drop_discards_error_from_unwind() {
    let coroutine = Coroutine::new(|c: &Control| -> Result<(), BoxError> {
        let _ = panic::catch_unwind(AssertUnwindSafe(|| c.suspend()));
        Err("ignored".into())
    })
    .unwrap();
    coroutine.resume().unwrap();
    drop(coroutine);
}

#[test]
fn clear() {
    let count = Rc::new(Cell::new(0));
    let guard = SetOnDrop(count.clone());
    let mut coroutine = Coroutine::from_fn(move || drop(guard)).unwrap();
    assert!(coroutine.stack_size() > 0);
    coroutine.clear().unwrap();
    assert_eq!(count.get(), 1);
    assert_eq!(coroutine.status(), Status::Completed);
    assert_eq!(coroutine.stack_size(), 0);
    assert_eq!(coroutine.stack_used(), None);
    coroutine.clear().unwrap();
    coroutine.abort().unwrap();
    assert!(matches!(
        coroutine.resume(),
        Err(Error::State {
            op: Operation::Resume,
            status: Status::Completed
        })
    ));
}

#[test]
fn clear_rejects_sleeping() {
    let mut coroutine = Coroutine::new(|c: &Control| c.suspend()).unwrap();
    coroutine.resume().unwrap();
    assert!(matches!(
        coroutine.clear(),
        Err(Error::State {
            op: Operation::Clear,
            status: Status::Sleeping
        })
    ));
    assert_eq!(coroutine.status(), Status::Sleeping);
    coroutine.resume().unwrap();
    coroutine.clear().unwrap();
    assert_eq!(coroutine.stack_size(), 0);
}

#[test]
fn corrupted_guard_is_reported() {
    let coroutine = Coroutine::new(|c: &Control| c.suspend()).unwrap();
    coroutine.resume().unwrap();

    let guard = unsafe { &coroutine.header.as_ref().guard };
    guard.set(0);
    assert!(matches!(coroutine.resume(), Err(Error::StackOverflow)));
    assert!(matches!(coroutine.abort(), Err(Error::StackOverflow)));
    assert_eq!(coroutine.status(), Status::Sleeping);

    guard.set(GUARD_WORD);
    coroutine.resume().unwrap();
    assert_eq!(coroutine.status(), Status::Completed);
}

#[test]
fn control_reports_stack_size() {
    let coroutine = Coroutine::new(|c: &Control| c.suspend_with(c.stack_size()).map(drop)).unwrap();
    let size = coroutine.resume_as::<usize>(Payload::empty()).unwrap();
    assert_eq!(size, coroutine.stack_size());
    assert_eq!(size, crate::stack::DEFAULT_STACK_SIZE);
    coroutine.resume().unwrap();
}
