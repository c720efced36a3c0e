//! An instrumented strategy for tests.

use core::alloc::{AllocError, Allocator, Layout};
use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use std::alloc::Global;

use crate::traits::{NoPropagation, Propagation, Strategy};

/// Tallies of what the strategies sharing it have done.
#[derive(Debug, Default)]
pub struct Counters {
    pub allocations: Cell<usize>,
    pub deallocations: Cell<usize>,
    pub constructions: Cell<usize>,
    pub destructions: Cell<usize>,
    /// Calls to `equals`.
    pub comparisons: Cell<usize>,
    /// Makes every allocation fail while set.
    pub refuse: Cell<bool>,
}

impl Counters {
    /// Allocations not yet handed back.
    pub fn live(&self) -> usize {
        self.allocations.get() - self.deallocations.get()
    }
}

fn bump(counter: &Cell<usize>) {
    counter.set(counter.get() + 1);
}

/// Heap strategy that records its activity in [`Counters`]. Instances are equal when their ids
/// match; `generation` counts how many copy selections led to this instance.
#[derive(Clone, Debug)]
pub struct Counting<'c, P = NoPropagation> {
    pub id: u32,
    pub generation: u32,
    counters: &'c Counters,
    _propagation: PhantomData<P>,
}

/// A counting strategy that stays with its box.
pub type Sticky<'c> = Counting<'c, NoPropagation>;

impl<'c, P> Counting<'c, P> {
    pub fn new(id: u32, counters: &'c Counters) -> Self {
        Self {
            id,
            generation: 0,
            counters,
            _propagation: PhantomData,
        }
    }
}

/// SAFETY: memory comes from the global allocator, so any instance can release it.
unsafe impl<P> Strategy for Counting<'_, P>
where
    P: Propagation + Clone,
{
    const PROPAGATE_ON_COPY_ASSIGN: bool = P::ON_COPY_ASSIGN;
    const PROPAGATE_ON_MOVE_ASSIGN: bool = P::ON_MOVE_ASSIGN;
    const PROPAGATE_ON_SWAP: bool = P::ON_SWAP;

    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if self.counters.refuse.get() {
            return Err(AllocError);
        }
        bump(&self.counters.allocations);
        Allocator::allocate(&Global, layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        bump(&self.counters.deallocations);
        unsafe { Allocator::deallocate(&Global, ptr, layout) }
    }

    unsafe fn construct<T>(&self, place: NonNull<T>, value: T) {
        bump(&self.counters.constructions);
        unsafe { ptr::write(place.as_ptr(), value) }
    }

    unsafe fn destroy<T>(&self, place: NonNull<T>) {
        bump(&self.counters.destructions);
        unsafe { ptr::drop_in_place(place.as_ptr()) }
    }

    fn equals(&self, other: &Self) -> bool {
        bump(&self.counters.comparisons);
        self.id == other.id
    }

    fn select_on_copy(&self) -> Self {
        Self {
            generation: self.generation + 1,
            ..self.clone()
        }
    }
}

/// Heap strategy whose instances are all interchangeable. Records in [`Counters`] like
/// [`Counting`].
#[derive(Clone, Debug)]
pub struct Pooled<'c> {
    counters: &'c Counters,
}

impl<'c> Pooled<'c> {
    pub fn new(counters: &'c Counters) -> Self {
        Self { counters }
    }
}

/// SAFETY: memory comes from the global allocator, so any instance can release it.
unsafe impl Strategy for Pooled<'_> {
    const IS_ALWAYS_EQUAL: bool = true;

    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        bump(&self.counters.allocations);
        Allocator::allocate(&Global, layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        bump(&self.counters.deallocations);
        unsafe { Allocator::deallocate(&Global, ptr, layout) }
    }

    fn equals(&self, _other: &Self) -> bool {
        bump(&self.counters.comparisons);
        true
    }
}
