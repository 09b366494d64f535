use std::cell::Cell;

use coroplus::{Coroutine, Status};

struct Guard<'a>(&'a Cell<bool>);

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        println!("[coroutine] dropping guard");
        self.0.set(true);
    }
}

fn main() {
    let dropped = Cell::new(false);

    let coroutine = Coroutine::from_fn(|| -> coroplus::Result<()> {
        let _guard = Guard(&dropped);
        println!("[coroutine] suspending with a guard on the stack");
        coroplus::suspend()?;
        println!("[coroutine] this is never printed");
        Ok(())
    })
    .unwrap();

    assert_eq!(coroutine.status(), Status::Starting);
    coroutine.resume().unwrap();
    assert_eq!(coroutine.status(), Status::Sleeping);

    println!("[main] aborting coroutine");
    coroutine.abort().unwrap();
    assert_eq!(coroutine.status(), Status::Completed);
    println!("[main] guard dropped: {}", dropped.get());
    assert!(dropped.get());
}

#[test]
fn cleanup() {
    main()
}
