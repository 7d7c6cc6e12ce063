//! Weak reference proxy.
//!
//! A separately allocated block that takes over an object's strong count
//! the first time a weak reference is requested. It carries two counts:
//!
//! - `proxy_refs`: how many parties keep the proxy block alive. Starts at 2,
//!   one for the object's slot and one for the first weak handle.
//! - `source_refs`: the object's strong count, seeded from the inline count
//!   at install time.
//!
//! The `source` back-pointer is nulled immediately after the decrement that
//! drives `source_refs` to zero. Resolution never reads the object through a
//! back-pointer it has not revalidated after acquiring a strong count.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::{self, NonNull};

use crate::fail_fast::{fail_fast, FailFastReason};
use crate::object::ObjectHeader;
use crate::stats::{self, Event};
use crate::sync::{fence, spin_loop, AtomicBool, AtomicPtr, AtomicUsize, Ordering};

/// Soft limit on either proxy count; crossing it means a leak loop.
const MAX_REFCOUNT: usize = isize::MAX as usize;

pub(crate) struct WeakReferenceProxy {
    proxy_refs: AtomicUsize,
    source_refs: AtomicUsize,
    source: AtomicPtr<ObjectHeader>,
    disconnected: AtomicBool,
}

impl WeakReferenceProxy {
    /// Allocate an unpublished proxy for `source` with the seeded count.
    ///
    /// A null `source` produces a proxy that never resolves unless the
    /// object is resurrected.
    pub(crate) fn allocate(source: *mut ObjectHeader, source_refs: usize) -> NonNull<Self> {
        let layout = Layout::new::<Self>();
        // SAFETY: the layout is non-zero sized.
        let raw = unsafe { alloc::alloc(layout) } as *mut Self;
        let Some(proxy) = NonNull::new(raw) else {
            fail_fast(FailFastReason::ProxyAllocation);
        };

        // SAFETY: freshly allocated with the layout of `Self`.
        unsafe {
            proxy.as_ptr().write(WeakReferenceProxy {
                proxy_refs: AtomicUsize::new(2),
                source_refs: AtomicUsize::new(source_refs),
                source: AtomicPtr::new(source),
                disconnected: AtomicBool::new(false),
            });
        }
        proxy
    }

    /// Re-seed the strong count of a proxy that has not been published.
    ///
    /// # Safety
    ///
    /// `this` must come from [`allocate`](Self::allocate) and must not have
    /// been installed in any slot.
    pub(crate) unsafe fn reseed(this: NonNull<Self>, source_refs: usize) {
        this.as_ref().source_refs.store(source_refs, Ordering::Relaxed);
    }

    /// Free a proxy that lost the install race.
    ///
    /// # Safety
    ///
    /// `this` must come from [`allocate`](Self::allocate) and must not have
    /// been installed in any slot.
    pub(crate) unsafe fn discard(this: NonNull<Self>) {
        stats::record(Event::ProxyDiscarded);
        Self::free(this);
    }

    unsafe fn free(this: NonNull<Self>) {
        ptr::drop_in_place(this.as_ptr());
        stats::poison(this.as_ptr() as *mut u8, std::mem::size_of::<Self>());
        alloc::dealloc(this.as_ptr() as *mut u8, Layout::new::<Self>());
    }

    /// Add a proxy reference. Returns the new proxy count.
    pub(crate) fn add_ref(&self) -> usize {
        let old = self.proxy_refs.fetch_add(1, Ordering::Relaxed);
        if old > MAX_REFCOUNT {
            fail_fast(FailFastReason::CountOverflow);
        }
        old + 1
    }

    /// Drop a proxy reference, freeing the proxy on the last one.
    /// Returns the new proxy count.
    ///
    /// # Safety
    ///
    /// The caller must own one proxy reference and must not use `this`
    /// after this call.
    pub(crate) unsafe fn release(this: NonNull<Self>) -> usize {
        let old = this.as_ref().proxy_refs.fetch_sub(1, Ordering::Release);
        if old == 0 {
            fail_fast(FailFastReason::ProxyUnderflow);
        }
        if old == 1 {
            // Synchronize with every earlier release before freeing.
            fence(Ordering::Acquire);
            stats::record(Event::ProxyFreed);
            Self::free(this);
        }
        old - 1
    }

    /// Strong count increment for an object whose count lives here.
    /// Returns the new strong count.
    pub(crate) fn increment_source(&self) -> usize {
        let old = self.source_refs.fetch_add(1, Ordering::Relaxed);
        if old > MAX_REFCOUNT {
            fail_fast(FailFastReason::CountOverflow);
        }
        old + 1
    }

    /// Strong count decrement. Returns the new count, or `None` if the count
    /// was already zero.
    ///
    /// The call that reaches zero nulls the back-pointer before returning.
    pub(crate) fn decrement_source(&self) -> Option<usize> {
        // Load the count; synchronized by subsequent CAS.
        let mut current = self.source_refs.load(Ordering::Acquire);

        loop {
            if current == 0 {
                return None;
            }

            match self.source_refs.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if current == 1 {
                        self.source.store(ptr::null_mut(), Ordering::Release);
                    }
                    return Some(current - 1);
                }
                Err(actual) => {
                    // CAS failed; update the count and try again.
                    current = actual;
                    spin_loop();
                }
            }
        }
    }

    /// Restore the count to one for the duration of the final release.
    ///
    /// Release ordering publishes the nulled back-pointer to any resolver
    /// that reads the re-armed count.
    pub(crate) fn rearm_source(&self) {
        self.source_refs.fetch_add(1, Ordering::Release);
    }

    /// Detach a destroyed object: drop the re-armed count and the
    /// back-pointer.
    pub(crate) fn retire_source(&self) {
        self.source.store(ptr::null_mut(), Ordering::Release);
        self.source_refs.fetch_sub(1, Ordering::Release);
    }

    /// Speculatively take a strong count, failing if it is zero.
    pub(crate) fn try_increment_source(&self) -> bool {
        // Load the count; synchronized by subsequent CAS.
        let mut current = self.source_refs.load(Ordering::Acquire);

        loop {
            if current == 0 {
                return false;
            }
            if current > MAX_REFCOUNT {
                fail_fast(FailFastReason::CountOverflow);
            }

            match self.source_refs.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => {
                    // CAS failed; update the count and try again.
                    current = actual;
                    spin_loop();
                }
            }
        }
    }

    /// Undo a speculative increment without touching the object.
    ///
    /// Only valid once the back-pointer has been observed null, when the
    /// object's final release is already under way.
    pub(crate) fn undo_increment(&self) {
        self.source_refs.fetch_sub(1, Ordering::Release);
    }

    pub(crate) fn source(&self) -> *mut ObjectHeader {
        self.source.load(Ordering::Acquire)
    }

    /// Point the proxy back at a resurrected object.
    pub(crate) fn reconnect(&self, source: NonNull<ObjectHeader>) {
        self.disconnected.store(false, Ordering::Release);
        self.source.store(source.as_ptr(), Ordering::Release);
    }

    /// Stop resolution while the object stays alive.
    pub(crate) fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Release);
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    pub(crate) fn source_count(&self) -> usize {
        self.source_refs.load(Ordering::Acquire)
    }

    pub(crate) fn proxy_count(&self) -> usize {
        self.proxy_refs.load(Ordering::Acquire)
    }
}

impl fmt::Debug for WeakReferenceProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakReferenceProxy")
            .field("proxy_refs", &self.proxy_count())
            .field("source_refs", &self.source_count())
            .field("source", &self.source())
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::fail_fast::{catch_fail_fast, set_mode, FailFastInfo, FailFastMode};
    use std::panic::AssertUnwindSafe;

    fn expect_fail_fast<R>(f: impl FnOnce() -> R) -> FailFastInfo {
        set_mode(FailFastMode::Panic);
        catch_fail_fast(AssertUnwindSafe(f))
            .err()
            .expect("operation fails fast")
    }

    fn fake_source() -> *mut ObjectHeader {
        NonNull::<ObjectHeader>::dangling().as_ptr()
    }

    #[test]
    fn test_allocate_defaults() {
        let proxy = WeakReferenceProxy::allocate(fake_source(), 3);
        let p = unsafe { proxy.as_ref() };
        assert_eq!(p.proxy_count(), 2);
        assert_eq!(p.source_count(), 3);
        assert_eq!(p.source(), fake_source());
        assert!(!p.is_disconnected());
        unsafe { WeakReferenceProxy::discard(proxy) };
    }

    #[test]
    fn test_source_count_reaching_zero_nulls_back_pointer() {
        let proxy = WeakReferenceProxy::allocate(fake_source(), 2);
        let p = unsafe { proxy.as_ref() };

        assert_eq!(p.decrement_source(), Some(1));
        assert!(!p.source().is_null());
        assert_eq!(p.decrement_source(), Some(0));
        assert!(p.source().is_null());
        assert_eq!(p.decrement_source(), None);

        // A resolver sees zero and gives up.
        assert!(!p.try_increment_source());

        unsafe { WeakReferenceProxy::discard(proxy) };
    }

    #[test]
    fn test_try_increment_and_undo() {
        let proxy = WeakReferenceProxy::allocate(fake_source(), 1);
        let p = unsafe { proxy.as_ref() };

        assert!(p.try_increment_source());
        assert_eq!(p.source_count(), 2);
        p.undo_increment();
        assert_eq!(p.source_count(), 1);

        unsafe { WeakReferenceProxy::discard(proxy) };
    }

    #[test]
    fn test_rearm_and_retire() {
        let proxy = WeakReferenceProxy::allocate(fake_source(), 1);
        let p = unsafe { proxy.as_ref() };

        assert_eq!(p.decrement_source(), Some(0));
        p.rearm_source();
        assert_eq!(p.source_count(), 1);
        assert!(p.source().is_null());

        p.retire_source();
        assert_eq!(p.source_count(), 0);

        unsafe { WeakReferenceProxy::discard(proxy) };
    }

    #[test]
    fn test_disconnect_and_reconnect() {
        let proxy = WeakReferenceProxy::allocate(ptr::null_mut(), 1);
        let p = unsafe { proxy.as_ref() };

        p.disconnect();
        assert!(p.is_disconnected());

        let source = NonNull::<ObjectHeader>::dangling();
        p.reconnect(source);
        assert!(!p.is_disconnected());
        assert_eq!(p.source(), source.as_ptr());

        unsafe { WeakReferenceProxy::discard(proxy) };
    }

    #[test]
    fn test_release_frees_on_last_reference() {
        let proxy = WeakReferenceProxy::allocate(ptr::null_mut(), 0);
        assert_eq!(unsafe { proxy.as_ref() }.add_ref(), 3);
        unsafe {
            assert_eq!(WeakReferenceProxy::release(proxy), 2);
            assert_eq!(WeakReferenceProxy::release(proxy), 1);
            assert_eq!(WeakReferenceProxy::release(proxy), 0);
        }
    }

    #[test]
    fn test_source_count_overflow_fails_fast() {
        let proxy = WeakReferenceProxy::allocate(fake_source(), MAX_REFCOUNT + 1);
        let p = unsafe { proxy.as_ref() };

        let info = expect_fail_fast(|| p.try_increment_source());
        assert_eq!(*info.reason(), FailFastReason::CountOverflow);
        assert!(info.location().file.ends_with("proxy.rs"));
        assert_eq!(p.source_count(), MAX_REFCOUNT + 1);

        let info = expect_fail_fast(|| p.increment_source());
        assert_eq!(*info.reason(), FailFastReason::CountOverflow);

        unsafe { WeakReferenceProxy::discard(proxy) };
    }

    #[test]
    fn test_proxy_count_overflow_fails_fast() {
        let proxy = WeakReferenceProxy::allocate(fake_source(), 1);
        let p = unsafe { proxy.as_ref() };
        p.proxy_refs.store(MAX_REFCOUNT + 1, Ordering::Relaxed);

        let info = expect_fail_fast(|| p.add_ref());
        assert_eq!(*info.reason(), FailFastReason::CountOverflow);

        unsafe { WeakReferenceProxy::discard(proxy) };
    }

    #[test]
    fn test_release_past_zero_fails_fast() {
        let proxy = WeakReferenceProxy::allocate(ptr::null_mut(), 0);
        unsafe {
            assert_eq!(WeakReferenceProxy::release(proxy), 1);
            proxy.as_ref().proxy_refs.store(0, Ordering::Relaxed);
        }

        let info = expect_fail_fast(|| unsafe { WeakReferenceProxy::release(proxy) });
        assert_eq!(*info.reason(), FailFastReason::ProxyUnderflow);
        assert!(info.location().file.ends_with("proxy.rs"));

        // The block was not freed by the failed release.
        unsafe { WeakReferenceProxy::discard(proxy) };
    }
}
