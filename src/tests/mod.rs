use std::cell::Cell;
use std::rc::Rc;

mod coroutine;

/// Counts how many times it has been dropped.
struct SetOnDrop(Rc<Cell<usize>>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.set(self.0.get() + 1);
    }
}

/// Asserts that `t` is at `expected` and advances it.
fn step(t: &Cell<usize>, expected: usize) {
    assert_eq!(t.get(), expected);
    t.set(expected + 1);
}
