//! Aggregation.
//!
//! A composite is an outer managed object whose value owns one or more inner
//! managed objects. Each inner object is constructed with the outer as its
//! controlling object:
//!
//! - Its public operations (AddRef, Release, identity query, weak references)
//!   forward to the outer, so handles to the inner keep the whole composite
//!   alive and compare equal in identity to the outer.
//! - Its own count is driven only through the non-delegating entry points on
//!   [`Inner`], which the outer holds. Dropping the outer's value drops the
//!   `Inner`, which releases the inner object's own count.
//!
//! ```rust,ignore
//! struct Engine;
//! impl Managed for Engine {}
//!
//! struct Car {
//!     engine: Inner<Engine>,
//! }
//!
//! impl Managed for Car {
//!     fn query_capability(&self, _this: &Unknown, iid: Iid) -> Option<Unknown> {
//!         self.engine.query(iid)
//!     }
//! }
//!
//! let car = StrongHandle::new_composite(|composer| Car {
//!     engine: unsafe { composer.aggregate(Engine) },
//! });
//! let engine = StrongHandle::query_as::<Engine>(&car).unwrap();
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ops::Deref;
use std::ptr::NonNull;

use crate::handle::{StrongHandle, Unknown};
use crate::iid::Iid;
use crate::log::{self, LogBuilder, LogLevel};
use crate::object::{self, Lifecycle, Managed, ManagedBox, ObjectHeader};
use crate::slot::SlotMode;

/// Builds inner objects for a composite under construction.
///
/// Only available inside [`StrongHandle::new_composite`]. The outer object's
/// header exists at this point but its value does not, so no public
/// operation may reach the outer until construction returns.
pub struct Composer<'a> {
    outer: NonNull<ObjectHeader>,
    _marker: PhantomData<&'a ObjectHeader>,
}

impl Composer<'_> {
    /// Allocate `value` as an inner object controlled by the composite.
    ///
    /// The inner object starts with an own count of 1, held by the returned
    /// [`Inner`].
    ///
    /// # Safety
    ///
    /// The returned `Inner` must be stored in the composite's value and
    /// dropped with it, and any extra non-delegating counts must be released
    /// before then: the inner object's public operations dereference the
    /// outer. No public operation may be called on the inner object before
    /// `new_composite` returns.
    pub unsafe fn aggregate<I: Managed>(&self, value: I) -> Inner<I> {
        let block = ManagedBox::allocate(value, Some(self.outer));

        if log::would_log(LogLevel::Trace) {
            LogBuilder::new(LogLevel::Trace)
                .target("lifeline::aggregate")
                .message("inner object aggregated")
                .field_str("type", std::any::type_name::<I>())
                .field_hex("inner", block.as_ptr() as usize)
                .field_hex("outer", self.outer.as_ptr() as usize)
                .emit();
        }

        Inner { block }
    }
}

impl fmt::Debug for Composer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Composer").field("outer", &self.outer).finish()
    }
}

/// Frees the outer block if the composite's constructor unwinds.
struct UninitGuard<T: Managed>(NonNull<ManagedBox<T>>);

impl<T: Managed> Drop for UninitGuard<T> {
    fn drop(&mut self) {
        // SAFETY: the value was never written and no handle escaped.
        unsafe { ManagedBox::deallocate_uninit(self.0) };
    }
}

impl<T: Managed> StrongHandle<T> {
    /// Construct a composite: an outer object whose value is built by
    /// `build`, which may aggregate inner objects through the [`Composer`].
    ///
    /// The outer starts with a strong count of 1, like [`StrongHandle::new`].
    /// If `build` panics, inner objects already dropped by the unwind are
    /// destroyed and the outer block is freed.
    pub fn new_composite<F>(build: F) -> Self
    where
        F: FnOnce(&Composer<'_>) -> T,
    {
        let block = ManagedBox::<T>::allocate_uninit(None);
        let guard = UninitGuard(block);

        let composer = Composer {
            outer: ManagedBox::header(block),
            _marker: PhantomData,
        };
        let value = build(&composer);
        mem::forget(guard);

        // SAFETY: the block came from `allocate_uninit` and its value is
        // unwritten; the initial count moves into the handle.
        unsafe {
            ManagedBox::write_value(block, value);
            StrongHandle::from_block(block)
        }
    }
}

/// The outer's owning reference to an aggregated inner object.
///
/// Holds one non-delegating count. Derefs to the inner value.
pub struct Inner<T: Managed> {
    block: NonNull<ManagedBox<T>>,
}

// SAFETY: `Managed` requires `Send + Sync` and all count updates are atomic.
unsafe impl<T: Managed> Send for Inner<T> {}
unsafe impl<T: Managed> Sync for Inner<T> {}

impl<T: Managed> Inner<T> {
    fn header(&self) -> NonNull<ObjectHeader> {
        ManagedBox::header(self.block)
    }

    /// AddRef on the inner object's own slot. Returns the new own count.
    pub fn non_delegating_add_ref(&self) -> usize {
        // SAFETY: `self` holds an own count.
        unsafe { object::add_ref_own(self.header()) }
    }

    /// Release on the inner object's own slot. Returns the new own count.
    ///
    /// # Safety
    ///
    /// The caller must give back a count taken with
    /// [`non_delegating_add_ref`](Self::non_delegating_add_ref). Releasing
    /// the count owned by `self` destroys the inner object under it.
    pub unsafe fn non_delegating_release(&self) -> usize {
        object::release_own(self.header())
    }

    /// The inner object's own count.
    pub fn ref_count(&self) -> usize {
        // SAFETY: `self` holds an own count.
        unsafe { object::strong_count_own(self.header()) }
    }

    /// Non-delegating capability query, for the outer to forward queries
    /// the inner object answers.
    ///
    /// The inner object's own type, the weak-reference-source capability
    /// and whatever its [`Managed::query_capability`] answers are served by
    /// the inner object; the returned reference counts against the outer.
    /// The base identity capability is never answered here: it belongs to
    /// the outer.
    pub fn query(&self, iid: Iid) -> Option<Unknown> {
        // SAFETY: `self` holds an own count.
        unsafe { object::query_own(self.header(), iid) }
    }

    /// Public handle to the inner object; counts against the outer.
    pub fn to_handle(&self) -> StrongHandle<T> {
        // SAFETY: a public count on an aggregated object lands on the outer,
        // which is alive while its value holds `self`.
        unsafe {
            object::add_ref(self.header());
            StrongHandle::from_block(self.block)
        }
    }

    /// Representation of the inner object's own slot.
    pub fn slot_mode(&self) -> SlotMode {
        // SAFETY: `self` holds an own count.
        unsafe { self.header().as_ref().slot_mode() }
    }

    /// Lifecycle of the inner object.
    pub fn lifecycle(&self) -> Lifecycle {
        // SAFETY: `self` holds an own count.
        unsafe { self.header().as_ref().lifecycle() }
    }
}

impl<T: Managed> Clone for Inner<T> {
    fn clone(&self) -> Self {
        self.non_delegating_add_ref();
        Inner { block: self.block }
    }
}

impl<T: Managed> Drop for Inner<T> {
    fn drop(&mut self) {
        debug_assert!(unsafe { self.header().as_ref().is_aggregated() });
        // SAFETY: `self` owns one own count and is not used again.
        unsafe { object::release_own(self.header()) };
    }
}

impl<T: Managed> Deref for Inner<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the value lives while an own count is held.
        unsafe { ManagedBox::value(self.block) }
    }
}

impl<T: Managed + fmt::Debug> fmt::Debug for Inner<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner")
            .field("value", &**self)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}
