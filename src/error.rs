//! Errors raised while putting a value into a box.

use core::alloc::AllocError;
use core::convert::Infallible;

use thiserror::Error;

/// Failure to build a boxed value.
///
/// Whichever variant is returned, the storage taken for the value has already been handed back
/// to the strategy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConstructError<E> {
    /// The strategy could not provide storage
    #[error("memory allocation failed")]
    Alloc(#[from] AllocError),

    /// The value's constructor reported an error
    #[error("value construction failed: {0}")]
    Init(E),
}

impl<E> ConstructError<E> {
    /// Returns the constructor's error, if that is what failed.
    pub fn into_init(self) -> Option<E> {
        match self {
            ConstructError::Alloc(_) => None,
            ConstructError::Init(err) => Some(err),
        }
    }
}

impl From<ConstructError<Infallible>> for AllocError {
    fn from(err: ConstructError<Infallible>) -> Self {
        match err {
            ConstructError::Alloc(err) => err,
            ConstructError::Init(never) => match never {},
        }
    }
}
