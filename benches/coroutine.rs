use coroplus::stack::HeapStack;
use coroplus::{Control, Coroutine, Payload};
use criterion::measurement::Measurement;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn coroutine_switch<M: Measurement + 'static>(name: &str, c: &mut Criterion<M>) {
    let identity = Coroutine::new(|control: &Control| -> coroplus::Result<()> {
        let mut input = control.take_input();
        loop {
            input = control.suspend_any(input)?;
        }
    })
    .unwrap();

    c.bench_function(name, |b| {
        b.iter(|| identity.resume_with(black_box(0usize)).unwrap())
    });

    identity.abort().unwrap();
}

fn coroutine_switch_empty<M: Measurement + 'static>(name: &str, c: &mut Criterion<M>) {
    let looping = Coroutine::from_fn(|| -> coroplus::Result<()> {
        loop {
            coroplus::suspend()?;
        }
    })
    .unwrap();

    c.bench_function(name, |b| b.iter(|| looping.resume().unwrap()));
}

fn coroutine_call<M: Measurement + 'static>(name: &str, c: &mut Criterion<M>) {
    // Don't count time spent allocating a stack.
    let mut stack = HeapStack::new(0).unwrap();

    c.bench_function(name, move |b| {
        b.iter(|| {
            let identity = Coroutine::with_stack(&mut stack, |control: &Control| {
                control.take_input();
            });
            identity.resume_any(Payload::new(black_box(0usize))).unwrap()
        })
    });
}

fn coroutine_switch_time(c: &mut Criterion) {
    coroutine_switch("coroutine_switch_time", c);
}
fn coroutine_switch_empty_time(c: &mut Criterion) {
    coroutine_switch_empty("coroutine_switch_empty_time", c);
}
fn coroutine_call_time(c: &mut Criterion) {
    coroutine_call("coroutine_call_time", c);
}

criterion_group!(
    name = time;
    config = Criterion::default();
    targets = coroutine_switch_time, coroutine_switch_empty_time, coroutine_call_time
);

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        use criterion_cycles_per_byte::CyclesPerByte;

        fn coroutine_switch_cycles(c: &mut Criterion<CyclesPerByte>) {
            coroutine_switch("coroutine_switch_cycles", c);
        }
        fn coroutine_switch_empty_cycles(c: &mut Criterion<CyclesPerByte>) {
            coroutine_switch_empty("coroutine_switch_empty_cycles", c);
        }
        fn coroutine_call_cycles(c: &mut Criterion<CyclesPerByte>) {
            coroutine_call("coroutine_call_cycles", c);
        }

        criterion_group!(
            name = cycles;
            config = Criterion::default().with_measurement(CyclesPerByte);
            targets = coroutine_switch_cycles, coroutine_switch_empty_cycles, coroutine_call_cycles
        );

        criterion_main!(cycles, time);
    } else {
        criterion_main!(time);
    }
}
