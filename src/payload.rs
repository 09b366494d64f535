//! Type-erased value exchanged at every resume/suspend handoff.

use core::any::{self, Any, TypeId};
use core::fmt;

use crate::error::{Error, Result};

/// A single, optional, type-erased value.
///
/// An empty payload behaves as if it held `()`, so `take::<()>()` always
/// succeeds on it.
#[derive(Default)]
pub struct Payload(Option<Box<dyn Any>>);

impl Payload {
    /// A payload carrying nothing.
    #[inline]
    pub const fn empty() -> Self {
        Payload(None)
    }

    /// A payload carrying `val`.
    #[inline]
    pub fn new<T: 'static>(val: T) -> Self {
        Payload(Some(Box::new(val)))
    }

    /// Whether no value is carried.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// Whether the payload holds a value of type `T`.
    pub fn is<T: 'static>(&self) -> bool {
        match &self.0 {
            Some(val) => (**val).is::<T>(),
            None => TypeId::of::<T>() == TypeId::of::<()>(),
        }
    }

    /// `TypeId` of the carried value, `None` when empty.
    pub fn type_id(&self) -> Option<TypeId> {
        self.0.as_deref().map(Any::type_id)
    }

    /// Moves the value out if it is a `T`.
    ///
    /// On mismatch an [`Error::TypeMismatch`] is returned and the payload is
    /// left untouched.
    pub fn take<T: 'static>(&mut self) -> Result<T> {
        let mismatch = || Error::TypeMismatch {
            expected: any::type_name::<T>(),
        };
        match self.0.take() {
            Some(val) => match val.downcast::<T>() {
                Ok(val) => Ok(*val),
                Err(val) => {
                    self.0 = Some(val);
                    Err(mismatch())
                }
            },
            None => {
                let unit: Box<dyn Any> = Box::new(());
                unit.downcast::<T>().map(|val| *val).map_err(|_| mismatch())
            }
        }
    }

    /// Like [`Payload::take`] but gives `None` on mismatch.
    pub fn take_opt<T: 'static>(&mut self) -> Option<T> {
        self.take().ok()
    }

    /// Borrows the value if it is a `T`.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.as_deref()?.downcast_ref()
    }

    /// Mutably borrows the value if it is a `T`.
    pub fn downcast_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.0.as_deref_mut()?.downcast_mut()
    }

    /// Unwraps the boxed value.
    pub fn into_inner(self) -> Option<Box<dyn Any>> {
        self.0
    }
}

impl From<Box<dyn Any>> for Payload {
    fn from(val: Box<dyn Any>) -> Self {
        Payload(Some(val))
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(_) => f.write_str("Payload(..)"),
            None => f.write_str("Payload(empty)"),
        }
    }
}
