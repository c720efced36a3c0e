use core::alloc::{AllocError, Allocator, Layout};
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use std::alloc::{Global, System};

use crate::traits::{NoPropagation, Propagation, Strategy};

// Stateless allocators: every instance can free every other instance's memory.

macro_rules! stateless_strategy {
    ($($alloc:ty),*) => {$(
        /// SAFETY: we forward storage requests to the underlying allocator, whose instances are
        /// interchangeable.
        unsafe impl Strategy for $alloc {
            const IS_ALWAYS_EQUAL: bool = true;

            fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
                Allocator::allocate(self, layout)
            }

            unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
                unsafe { Allocator::deallocate(self, ptr, layout) }
            }

            fn equals(&self, _other: &Self) -> bool {
                true
            }
        }
    )*}
}

stateless_strategy!(Global, System);

/// SAFETY: we forward all method impls to the borrowed strategy. Two borrows of one strategy
///         are trivially equal.
unsafe impl<S> Strategy for &S
where
    S: Strategy,
{
    const IS_ALWAYS_EQUAL: bool = S::IS_ALWAYS_EQUAL;

    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        (**self).allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { (**self).deallocate(ptr, layout) }
    }

    unsafe fn construct<T>(&self, place: NonNull<T>, value: T) {
        unsafe { (**self).construct(place, value) }
    }

    unsafe fn destroy<T>(&self, place: NonNull<T>) {
        unsafe { (**self).destroy(place) }
    }

    fn equals(&self, other: &Self) -> bool {
        ptr::eq(*self, *other) || (**self).equals(*other)
    }
}

/// Lends an [`Allocator`] to a [`DynOptional`](crate::DynOptional).
///
/// Two adapters are equal when their allocators compare equal. `P` picks which operations carry
/// the adapter along with the value.
#[derive(Clone, Copy, Debug)]
pub struct Adapter<A, P = NoPropagation> {
    allocator: A,
    _propagation: PhantomData<P>,
}

impl<A, P> Adapter<A, P> {
    /// SAFETY: whenever two allocators of type `A` compare `==`, memory from either must be
    ///         releasable through the other. Clones of `allocator` must compare `==` to it.
    pub const unsafe fn new(allocator: A) -> Self {
        Self {
            allocator,
            _propagation: PhantomData,
        }
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn into_inner(self) -> A {
        self.allocator
    }
}

/// SAFETY: storage requests go straight to the allocator, and `Adapter::new` requires equal
///         allocators to free each other's memory.
unsafe impl<A, P> Strategy for Adapter<A, P>
where
    A: Allocator + PartialEq,
    P: Propagation,
{
    const PROPAGATE_ON_COPY_ASSIGN: bool = P::ON_COPY_ASSIGN;
    const PROPAGATE_ON_MOVE_ASSIGN: bool = P::ON_MOVE_ASSIGN;
    const PROPAGATE_ON_SWAP: bool = P::ON_SWAP;

    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        self.allocator.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { self.allocator.deallocate(ptr, layout) }
    }

    fn equals(&self, other: &Self) -> bool {
        self.allocator == other.allocator
    }
}
