#![feature(allocator_api)]
#![forbid(unsafe_op_in_unsafe_fn)]

use core::alloc::Layout;
use core::convert::Infallible;
use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ops::{Deref, DerefMut};
use core::ptr::{self, NonNull};
use std::alloc::{handle_alloc_error, AllocError, Global};

use scopeguard::ScopeGuard;
use tracing::trace;

pub use crate::allocator::Adapter;
pub use crate::error::ConstructError;
pub use crate::traits::{FullPropagation, NoPropagation, Propagate, Propagation, Strategy};

pub mod allocator;
pub mod error;
pub mod traits;

#[cfg(test)]
mod counting;

/// An optional value kept in its own heap allocation.
///
/// The box itself is one pointer plus the strategy `S`, so it stays pointer-sized for stateless
/// strategies no matter how large `T` is. Storage and construction go through `S`, which also
/// decides whether copies, moves and swaps carry it along (see [`Strategy`]).
pub struct DynOptional<T, S: Strategy = Global> {
    strategy: S,
    /// Either empty, or the single value built by `strategy` (or a strategy equal to it).
    slot: Option<NonNull<T>>,
    _owns: PhantomData<T>,
}

const _: () = assert!(mem::size_of::<DynOptional<[u64; 32]>>() == mem::size_of::<usize>());

/// SAFETY: the box owns its value outright; nothing else points at it.
unsafe impl<T: Send, S: Strategy + Send> Send for DynOptional<T, S> {}

/// SAFETY: shared access only hands out `&T` and `&S`.
unsafe impl<T: Sync, S: Strategy + Sync> Sync for DynOptional<T, S> {}

// Drop

impl<T, S: Strategy> Drop for DynOptional<T, S> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T, S: Strategy + Default> DynOptional<T, S> {
    /// An empty box with a default strategy.
    pub fn new() -> Self {
        Self::new_in(S::default())
    }

    pub fn with_value(value: T) -> Self {
        Self::with_value_in(value, S::default())
    }

    /// Allocates, then builds the value with `init`. See [`DynOptional::try_with_in`].
    pub fn try_with<E, F>(init: F) -> Result<Self, ConstructError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        Self::try_with_in(init, S::default())
    }
}

impl<T, S: Strategy> DynOptional<T, S> {
    pub const fn new_in(strategy: S) -> Self {
        Self {
            strategy,
            slot: None,
            _owns: PhantomData,
        }
    }

    pub fn with_value_in(value: T, strategy: S) -> Self {
        match Self::try_with_value_in(value, strategy) {
            Ok(this) => this,
            Err(_) => handle_alloc_error(Layout::new::<T>()),
        }
    }

    pub fn try_with_value_in(value: T, strategy: S) -> Result<Self, AllocError> {
        let slot = Self::construct_value(&strategy, || value)?;
        Ok(Self {
            strategy,
            slot: Some(slot),
            _owns: PhantomData,
        })
    }

    /// Allocates storage from `strategy`, then builds the value with `init`.
    ///
    /// If `init` fails or panics, the storage goes back to `strategy` before the failure reaches
    /// the caller.
    pub fn try_with_in<E, F>(init: F, strategy: S) -> Result<Self, ConstructError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let slot = Self::construct_from(&strategy, init)?;
        Ok(Self {
            strategy,
            slot: Some(slot),
            _owns: PhantomData,
        })
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn is_some(&self) -> bool {
        self.slot.is_some()
    }

    pub fn is_none(&self) -> bool {
        self.slot.is_none()
    }

    pub fn get(&self) -> Option<&T> {
        // SAFETY: a filled slot always points at an initialized value owned by `self`.
        self.slot.map(|ptr| unsafe { &*ptr.as_ptr() })
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        // SAFETY: as in `get`, and `&mut self` makes the borrow unique.
        self.slot.map(|ptr| unsafe { &mut *ptr.as_ptr() })
    }

    /// SAFETY: the box must not be empty.
    pub unsafe fn get_unchecked(&self) -> &T {
        debug_assert!(self.is_some(), "get_unchecked on an empty DynOptional");
        unsafe { &*self.slot.unwrap_unchecked().as_ptr() }
    }

    /// SAFETY: the box must not be empty.
    pub unsafe fn get_unchecked_mut(&mut self) -> &mut T {
        debug_assert!(self.is_some(), "get_unchecked_mut on an empty DynOptional");
        unsafe { &mut *self.slot.unwrap_unchecked().as_ptr() }
    }

    /// Replaces the held value, if any, with `value`.
    pub fn set(&mut self, value: T) {
        if self.try_set(value).is_err() {
            handle_alloc_error(Layout::new::<T>());
        }
    }

    /// Replaces the held value, if any, with `value`. On failure the box is left untouched.
    pub fn try_set(&mut self, value: T) -> Result<(), AllocError> {
        let slot = Self::construct_value(&self.strategy, || value)?;
        self.replace_slot(Some(slot), None);
        Ok(())
    }

    /// Destroys the held value, if any, and releases its storage.
    pub fn reset(&mut self) {
        if let Some(ptr) = self.slot.take() {
            // SAFETY: the slot owned `ptr`, which was built by `self.strategy` or an equal one.
            unsafe { Self::delete_with(&self.strategy, ptr) }
        }
    }

    /// Moves the value out of its storage and releases the storage.
    pub fn into_inner(mut self) -> Option<T> {
        let ptr = self.slot.take()?;
        // SAFETY: `ptr` holds an initialized value we own; the slot no longer refers to it, so
        //         it is read exactly once before the storage goes back.
        unsafe {
            let value = ptr::read(ptr.as_ptr());
            Self::release(&self.strategy, ptr);
            Some(value)
        }
    }

    /// Exchanges the contents of two boxes.
    ///
    /// Strategies are exchanged too when `S::PROPAGATE_ON_SWAP` holds. Otherwise the two
    /// strategies must compare equal.
    ///
    /// # Panics
    ///
    /// Panics when the strategies stay put and compare unequal.
    pub fn swap(&mut self, other: &mut Self) {
        if S::PROPAGATE_ON_SWAP {
            mem::swap(&mut self.strategy, &mut other.strategy);
        } else {
            assert!(
                Self::interchangeable(&self.strategy, &other.strategy),
                "swapped DynOptionals whose strategies are unequal and do not propagate"
            );
        }
        mem::swap(&mut self.slot, &mut other.slot);
    }

    /// Whether storage from one strategy may be released through the other. Always-equal
    /// strategies are never asked.
    fn interchangeable(a: &S, b: &S) -> bool {
        S::IS_ALWAYS_EQUAL || a.equals(b)
    }

    /// Installs `slot`, adopting `strategy` when given, then destroys the displaced value with
    /// the strategy that built it.
    fn replace_slot(&mut self, slot: Option<NonNull<T>>, strategy: Option<S>) {
        let old = mem::replace(&mut self.slot, slot);
        let old_strategy = strategy.map(|strategy| {
            trace!("adopting source strategy");
            mem::replace(&mut self.strategy, strategy)
        });
        if let Some(old) = old {
            let owner = old_strategy.as_ref().unwrap_or(&self.strategy);
            // SAFETY: `old` was owned by the slot and built by `owner`.
            unsafe { Self::delete_with(owner, old) }
        }
    }

    /// Allocates storage from `strategy` and builds the value `init` returns in it.
    fn construct_from<E, F>(strategy: &S, init: F) -> Result<NonNull<T>, ConstructError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let layout = Layout::new::<T>();
        let storage = strategy.allocate(layout)?.cast::<T>();
        trace!(size = layout.size(), align = layout.align(), "allocated slot");

        // The storage goes back unless the value lands in it.
        let storage = scopeguard::guard(storage, |storage| {
            trace!("construction failed, releasing slot");
            // SAFETY: `storage` came from `strategy` with `layout` and holds no value.
            unsafe { strategy.deallocate(storage.cast(), layout) }
        });
        let value = init().map_err(ConstructError::Init)?;
        // SAFETY: `storage` is fresh, suitably aligned storage for one `T`.
        unsafe { strategy.construct(*storage, value) };
        Ok(ScopeGuard::into_inner(storage))
    }

    fn construct_value<F>(strategy: &S, make: F) -> Result<NonNull<T>, AllocError>
    where
        F: FnOnce() -> T,
    {
        Self::construct_from(strategy, || Ok::<T, Infallible>(make())).map_err(AllocError::from)
    }

    /// Moves the value at `ptr` into storage from `target`, handing the old storage back to
    /// `owner`. On failure nothing has moved.
    /// SAFETY: `ptr` must hold an initialized value built by `owner`. On success the caller
    ///         must forget `ptr`.
    unsafe fn relocate(owner: &S, target: &S, ptr: NonNull<T>) -> Result<NonNull<T>, AllocError> {
        // SAFETY: the closure runs at most once, after the new storage exists.
        let moved = Self::construct_value(target, || unsafe { ptr::read(ptr.as_ptr()) })?;
        // SAFETY: the value has left `ptr`, which `owner` allocated.
        unsafe { Self::release(owner, ptr) };
        Ok(moved)
    }

    /// SAFETY: `ptr` must hold an initialized value built by `strategy` (or an equal one) and
    ///         must not be used afterwards.
    unsafe fn delete_with(strategy: &S, ptr: NonNull<T>) {
        // The storage goes back even if the destructor unwinds.
        let _release = scopeguard::guard(ptr, |ptr| {
            // SAFETY: by the preconditions, the value is gone by the time this runs.
            unsafe { Self::release(strategy, ptr) }
        });
        unsafe { strategy.destroy(ptr) }
    }

    /// SAFETY: `ptr` must come from `strategy` (or an equal one) and hold no live value.
    unsafe fn release(strategy: &S, ptr: NonNull<T>) {
        unsafe { strategy.deallocate(ptr.cast(), Layout::new::<T>()) };
        trace!("released slot");
    }
}

impl<T, S: Strategy + Clone> DynOptional<T, S> {
    /// Moves the contents into a new box, leaving `self` empty. The new box gets a copy of the
    /// strategy. No allocation takes place.
    pub fn take(&mut self) -> Self {
        Self {
            strategy: self.strategy.clone(),
            slot: self.slot.take(),
            _owns: PhantomData,
        }
    }

    /// Moves the contents into a new box using `strategy`, leaving `self` empty.
    ///
    /// The allocation is handed over when `strategy` equals this box's strategy; otherwise the
    /// value is moved into storage from `strategy`. On failure `self` is untouched.
    pub fn try_take_in(&mut self, strategy: S) -> Result<Self, AllocError> {
        let ptr = match self.slot {
            Some(ptr) => ptr,
            None => return Ok(Self::new_in(strategy)),
        };
        let slot = if Self::interchangeable(&strategy, &self.strategy) {
            ptr
        } else {
            // SAFETY: `ptr` is our value; the slot is cleared below.
            unsafe { Self::relocate(&self.strategy, &strategy, ptr)? }
        };
        self.slot = None;
        Ok(Self {
            strategy,
            slot: Some(slot),
            _owns: PhantomData,
        })
    }

    /// Move assignment: takes the contents of `source`, leaving it empty.
    pub fn move_from(&mut self, source: &mut Self) {
        if self.try_move_from(source).is_err() {
            handle_alloc_error(Layout::new::<T>());
        }
    }

    /// Move assignment: takes the contents of `source`, leaving it empty.
    ///
    /// With equal strategies the allocation simply changes hands, and this cannot fail; for
    /// `S::IS_ALWAYS_EQUAL` strategies that is always the case. Otherwise
    /// the value moves into storage from the source's strategy if `S::PROPAGATE_ON_MOVE_ASSIGN`
    /// holds, or from this box's strategy if not. The strategy is adopted when
    /// `S::PROPAGATE_ON_MOVE_ASSIGN` holds. On failure both boxes are untouched.
    pub fn try_move_from(&mut self, source: &mut Self) -> Result<(), AllocError> {
        let ptr = match source.slot {
            Some(ptr) => ptr,
            None => {
                let adopted = S::PROPAGATE_ON_MOVE_ASSIGN.then(|| source.strategy.clone());
                self.replace_slot(None, adopted);
                return Ok(());
            }
        };

        if Self::interchangeable(&self.strategy, &source.strategy) {
            mem::swap(&mut self.slot, &mut source.slot);
            source.reset();
            if S::PROPAGATE_ON_MOVE_ASSIGN {
                self.strategy = source.strategy.clone();
            }
        } else {
            let target = if S::PROPAGATE_ON_MOVE_ASSIGN {
                &source.strategy
            } else {
                &self.strategy
            };
            // SAFETY: `ptr` is the source's value; its slot is cleared right after.
            let moved = unsafe { Self::relocate(&source.strategy, target, ptr)? };
            source.slot = None;
            let adopted = S::PROPAGATE_ON_MOVE_ASSIGN.then(|| source.strategy.clone());
            self.replace_slot(Some(moved), adopted);
        }
        Ok(())
    }
}

impl<T: Clone, S: Strategy + Clone> DynOptional<T, S> {
    /// Copies the box. The copy's strategy is chosen by [`Strategy::select_on_copy`].
    pub fn try_clone(&self) -> Result<Self, AllocError> {
        let strategy = self.strategy.select_on_copy();
        let slot = match self.get() {
            Some(value) => Some(Self::construct_value(&strategy, || value.clone())?),
            None => None,
        };
        Ok(Self {
            strategy,
            slot,
            _owns: PhantomData,
        })
    }

    /// Copy assignment.
    ///
    /// The copy is built with the source's strategy if `S::PROPAGATE_ON_COPY_ASSIGN` holds, or
    /// with this box's strategy if not, and the old value is destroyed only once the copy exists.
    /// If allocation fails or `T::clone` panics, `self` keeps its previous value and strategy.
    pub fn try_clone_from(&mut self, source: &Self) -> Result<(), AllocError> {
        let adopted = S::PROPAGATE_ON_COPY_ASSIGN.then(|| source.strategy.clone());
        let slot = match source.get() {
            Some(value) => {
                let builder = adopted.as_ref().unwrap_or(&self.strategy);
                Some(Self::construct_value(builder, || value.clone())?)
            }
            None => None,
        };
        self.replace_slot(slot, adopted);
        Ok(())
    }
}

/// Exchanges the contents of two boxes. Same as [`DynOptional::swap`].
pub fn swap<T, S: Strategy>(lhs: &mut DynOptional<T, S>, rhs: &mut DynOptional<T, S>) {
    lhs.swap(rhs);
}

// Clone

impl<T: Clone, S: Strategy + Clone> Clone for DynOptional<T, S> {
    fn clone(&self) -> Self {
        match self.try_clone() {
            Ok(copy) => copy,
            Err(_) => handle_alloc_error(Layout::new::<T>()),
        }
    }

    fn clone_from(&mut self, source: &Self) {
        if self.try_clone_from(source).is_err() {
            handle_alloc_error(Layout::new::<T>());
        }
    }
}

impl<T, S: Strategy + Default> Default for DynOptional<T, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, S: Strategy + Default> From<T> for DynOptional<T, S> {
    fn from(value: T) -> Self {
        Self::with_value(value)
    }
}

// Access

#[cold]
#[track_caller]
fn empty_deref() -> ! {
    panic!("dereferenced an empty DynOptional")
}

impl<T, S: Strategy> Deref for DynOptional<T, S> {
    type Target = T;

    /// # Panics
    ///
    /// Panics if the box is empty.
    #[track_caller]
    fn deref(&self) -> &T {
        match self.get() {
            Some(value) => value,
            None => empty_deref(),
        }
    }
}

impl<T, S: Strategy> DerefMut for DynOptional<T, S> {
    #[track_caller]
    fn deref_mut(&mut self) -> &mut T {
        match self.get_mut() {
            Some(value) => value,
            None => empty_deref(),
        }
    }
}

impl<T: fmt::Debug, S: Strategy> fmt::Debug for DynOptional<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DynOptional").field(&self.get()).finish()
    }
}

impl<T: PartialEq, S: Strategy> PartialEq for DynOptional<T, S> {
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

impl<T: Eq, S: Strategy> Eq for DynOptional<T, S> {}
