use core::alloc::{AllocError, Layout};
use core::ptr::{self, NonNull};

/// An allocation strategy: how a [`DynOptional`](crate::DynOptional) obtains and releases
/// storage, and how it builds and tears down values in that storage.
///
/// The associated constants describe how the strategy travels with the box. They are read at
/// compile time, never per call.
///
/// SAFETY: `allocate` must return storage fitting `layout` which stays valid until it is passed
///         to `deallocate` on this strategy or on any strategy for which `equals` returns `true`.
///         `equals` must be an equivalence relation, and must always return `true` when
///         `IS_ALWAYS_EQUAL` holds. If the strategy is `Clone`, a clone must compare `equals`
///         to its source, since boxes hand their storage to clones of the strategy that built
///         it. `construct` must leave an initialized value at `place` and must not unwind.
pub unsafe trait Strategy {
    /// Whether copy assignment also copies the strategy.
    const PROPAGATE_ON_COPY_ASSIGN: bool = false;
    /// Whether move assignment also moves the strategy.
    const PROPAGATE_ON_MOVE_ASSIGN: bool = false;
    /// Whether swapping two boxes also swaps their strategies.
    const PROPAGATE_ON_SWAP: bool = false;
    /// Whether any two instances may free each other's allocations.
    const IS_ALWAYS_EQUAL: bool = false;

    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError>;

    /// SAFETY: `ptr` must come from `allocate` on a strategy equal to `self`, with `layout`.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);

    /// Moves `value` into `place`.
    /// SAFETY: `place` must be valid, aligned and uninitialized storage for a `T`.
    unsafe fn construct<T>(&self, place: NonNull<T>, value: T) {
        unsafe { ptr::write(place.as_ptr(), value) }
    }

    /// Runs the destructor of the value at `place`, leaving the storage allocated.
    /// SAFETY: `place` must hold an initialized `T` which is not used again.
    unsafe fn destroy<T>(&self, place: NonNull<T>) {
        unsafe { ptr::drop_in_place(place.as_ptr()) }
    }

    /// Whether `self` and `other` may release each other's allocations.
    fn equals(&self, other: &Self) -> bool;

    /// The strategy a freshly copied box should use.
    fn select_on_copy(&self) -> Self
    where
        Self: Clone,
    {
        self.clone()
    }
}

/// Compile-time propagation choices for strategies that take them as a type parameter.
pub trait Propagation {
    const ON_COPY_ASSIGN: bool;
    const ON_MOVE_ASSIGN: bool;
    const ON_SWAP: bool;
}

/// Marker selecting which of copy assignment, move assignment and swap carry the strategy along.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Propagate<const COPY: bool, const MOVE: bool, const SWAP: bool>;

impl<const COPY: bool, const MOVE: bool, const SWAP: bool> Propagation
    for Propagate<COPY, MOVE, SWAP>
{
    const ON_COPY_ASSIGN: bool = COPY;
    const ON_MOVE_ASSIGN: bool = MOVE;
    const ON_SWAP: bool = SWAP;
}

/// The strategy stays with its box.
pub type NoPropagation = Propagate<false, false, false>;

/// The strategy follows the value on every copy, move and swap.
pub type FullPropagation = Propagate<true, true, true>;
