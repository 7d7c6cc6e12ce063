//! Reference-count slot.
//!
//! One pointer-width word per object. In inline mode the word is the strong
//! count. Once a weak reference is requested the word is replaced, exactly
//! once, by a tagged pointer to the object's [`WeakReferenceProxy`], and the
//! proxy owns the strong count from then on.
//!
//! ```text
//!   inline:  0 | count (w-1 bits)
//!   proxy:   1 | proxy address >> 1
//! ```
//!
//! Proxies are at least word aligned, so the shifted-out low bit is always
//! zero and `word << 1` recovers the address.

use std::fmt;
use std::ptr::NonNull;

use crate::fail_fast::{fail_fast, FailFastReason};
use crate::proxy::WeakReferenceProxy;
use crate::sync::{spin_loop, AtomicUsize, Ordering};

/// Tag bit marking a proxy-encoded word.
#[cfg(target_pointer_width = "64")]
pub(crate) const PROXY_TAG: usize = 0x8000_0000_0000_0000;
/// Tag bit marking a proxy-encoded word.
#[cfg(target_pointer_width = "32")]
pub(crate) const PROXY_TAG: usize = 0x8000_0000;

/// Largest strong count representable in inline mode.
pub const INLINE_COUNT_MAX: usize = PROXY_TAG - 1;

/// Which representation a slot currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotMode {
    /// The word is the strong count.
    Inline,
    /// The word encodes a pointer to the weak reference proxy.
    ProxyEncoded,
}

/// A decoded snapshot of a slot word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotValue(usize);

impl SlotValue {
    pub(crate) const fn inline(count: usize) -> Self {
        SlotValue(count)
    }

    /// Tag a proxy pointer for storage in a slot.
    pub(crate) fn encode(proxy: NonNull<WeakReferenceProxy>) -> Self {
        let address = proxy.as_ptr() as usize;
        if address & PROXY_TAG != 0 {
            fail_fast(FailFastReason::UnencodableProxyAddress { address });
        }
        debug_assert_eq!(address & 1, 0, "proxy must be at least 2-byte aligned");
        SlotValue((address >> 1) | PROXY_TAG)
    }

    pub(crate) fn decode(self) -> SlotState {
        match self.proxy() {
            Some(proxy) => SlotState::Proxy(proxy),
            None => SlotState::Inline(self.0),
        }
    }

    pub(crate) fn mode(self) -> SlotMode {
        if self.0 & PROXY_TAG == 0 {
            SlotMode::Inline
        } else {
            SlotMode::ProxyEncoded
        }
    }

    #[cfg(test)]
    pub(crate) fn inline_count(self) -> Option<usize> {
        match self.mode() {
            SlotMode::Inline => Some(self.0),
            SlotMode::ProxyEncoded => None,
        }
    }

    /// Decode the proxy pointer, if the word is proxy-encoded.
    pub(crate) fn proxy(self) -> Option<NonNull<WeakReferenceProxy>> {
        match self.mode() {
            SlotMode::Inline => None,
            SlotMode::ProxyEncoded => NonNull::new((self.0 << 1) as *mut WeakReferenceProxy),
        }
    }

    pub(crate) fn raw(self) -> usize {
        self.0
    }
}

impl fmt::Debug for SlotValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.proxy() {
            Some(proxy) => write!(f, "Proxy({:p})", proxy),
            None => write!(f, "Inline({})", self.0),
        }
    }
}

/// A decoded slot word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    /// Inline mode with this count.
    Inline(usize),
    /// Proxy-encoded; the count lives in the proxy.
    Proxy(NonNull<WeakReferenceProxy>),
}

/// Outcome of a count step on the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotStep {
    /// The inline count was updated; carries the new count.
    Inline(usize),
    /// The slot is proxy-encoded; the step must be applied to the proxy.
    Proxy(NonNull<WeakReferenceProxy>),
}

/// The atomic tagged word at the front of every object header.
pub(crate) struct RefCountSlot {
    word: AtomicUsize,
}

impl RefCountSlot {
    pub(crate) fn new(count: usize) -> Self {
        RefCountSlot {
            word: AtomicUsize::new(SlotValue::inline(count).raw()),
        }
    }

    #[inline]
    pub(crate) fn load(&self) -> SlotValue {
        SlotValue(self.word.load(Ordering::Acquire))
    }

    pub(crate) fn mode(&self) -> SlotMode {
        self.load().mode()
    }

    /// Increment the inline count, or report the proxy that owns it.
    #[inline]
    pub(crate) fn increment(&self) -> SlotStep {
        // Load the word; synchronized by subsequent CAS.
        let mut current = self.word.load(Ordering::Acquire);

        loop {
            let value = SlotValue(current);
            if let Some(proxy) = value.proxy() {
                return SlotStep::Proxy(proxy);
            }

            if current == INLINE_COUNT_MAX {
                fail_fast(FailFastReason::CountOverflow);
            }

            // A new reference is only ever made from an existing one, so the
            // increment itself needs no ordering. The failure load acquires
            // so that a freshly installed proxy is visible when decoded.
            match self.word.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Relaxed,
                Ordering::Acquire,
            ) {
                Ok(_) => return SlotStep::Inline(current + 1),
                Err(actual) => {
                    // CAS failed; update the word and try again.
                    current = actual;
                    spin_loop();
                }
            }
        }
    }

    /// Decrement the inline count, or report the proxy that owns it.
    ///
    /// A returned `Inline(0)` means this call performed the final release.
    /// Returns `None` if the inline count was already zero.
    #[inline]
    pub(crate) fn decrement(&self) -> Option<SlotStep> {
        // Load the word; synchronized by subsequent CAS.
        let mut current = self.word.load(Ordering::Acquire);

        loop {
            let value = SlotValue(current);
            if let Some(proxy) = value.proxy() {
                return Some(SlotStep::Proxy(proxy));
            }

            if current == 0 {
                return None;
            }

            // AcqRel: writes made through this reference happen before the
            // final release observes the count reaching zero.
            match self.word.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(SlotStep::Inline(current - 1)),
                Err(actual) => {
                    // CAS failed; update the word and try again.
                    current = actual;
                    spin_loop();
                }
            }
        }
    }

    /// Replace the inline word `expected` with the encoded `proxy`.
    ///
    /// On failure returns the word actually found, which is either a
    /// different inline count or another thread's proxy.
    pub(crate) fn install(
        &self,
        expected: SlotValue,
        proxy: NonNull<WeakReferenceProxy>,
    ) -> Result<(), SlotValue> {
        debug_assert_eq!(expected.mode(), SlotMode::Inline);

        // Release publishes the proxy's initialized fields to every thread
        // that later decodes the word.
        self.word
            .compare_exchange(
                expected.raw(),
                SlotValue::encode(proxy).raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(SlotValue)
    }
}

impl fmt::Debug for RefCountSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RefCountSlot").field(&self.load()).finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::fail_fast::{catch_fail_fast, set_mode, FailFastMode};
    use std::panic::AssertUnwindSafe;

    fn dangling_proxy() -> NonNull<WeakReferenceProxy> {
        NonNull::<WeakReferenceProxy>::dangling()
    }

    #[test]
    fn test_inline_mode() {
        let value = SlotValue::inline(5);
        assert_eq!(value.mode(), SlotMode::Inline);
        assert_eq!(value.inline_count(), Some(5));
        assert_eq!(value.decode(), SlotState::Inline(5));
        assert!(value.proxy().is_none());
    }

    #[test]
    fn test_encode_decode() {
        let proxy = dangling_proxy();
        let value = SlotValue::encode(proxy);
        assert_eq!(value.mode(), SlotMode::ProxyEncoded);
        assert_eq!(value.inline_count(), None);
        assert_eq!(value.proxy(), Some(proxy));
        // The tag is the sign bit, so an encoded word reads as negative.
        assert!((value.raw() as isize) < 0);
    }

    #[test]
    fn test_increment_decrement() {
        let slot = RefCountSlot::new(1);
        assert_eq!(slot.increment(), SlotStep::Inline(2));
        assert_eq!(slot.decrement(), Some(SlotStep::Inline(1)));
        assert_eq!(slot.decrement(), Some(SlotStep::Inline(0)));
        assert_eq!(slot.decrement(), None);
    }

    #[test]
    fn test_install_once() {
        let slot = RefCountSlot::new(3);
        let expected = slot.load();
        let proxy = dangling_proxy();

        assert!(slot.install(expected, proxy).is_ok());
        assert_eq!(slot.mode(), SlotMode::ProxyEncoded);

        // A second install against the stale inline word must fail.
        let found = slot.install(expected, proxy).unwrap_err();
        assert_eq!(found.proxy(), Some(proxy));

        // Count steps are redirected to the proxy from now on.
        assert_eq!(slot.increment(), SlotStep::Proxy(proxy));
        assert_eq!(slot.decrement(), Some(SlotStep::Proxy(proxy)));
        assert_eq!(slot.load().decode(), SlotState::Proxy(proxy));
    }

    #[test]
    fn test_increment_past_inline_max_fails_fast() {
        set_mode(FailFastMode::Panic);
        let slot = RefCountSlot::new(INLINE_COUNT_MAX);

        let info = catch_fail_fast(AssertUnwindSafe(|| slot.increment()))
            .err()
            .expect("increment past the inline cap fails fast");
        assert_eq!(*info.reason(), FailFastReason::CountOverflow);
        assert!(info.location().file.ends_with("slot.rs"));

        // The word never spills into the tag bit.
        assert_eq!(slot.mode(), SlotMode::Inline);
        assert_eq!(slot.load().inline_count(), Some(INLINE_COUNT_MAX));
    }

    #[test]
    fn test_install_fails_on_stale_count() {
        let slot = RefCountSlot::new(1);
        let expected = slot.load();
        slot.increment();

        let found = slot.install(expected, dangling_proxy()).unwrap_err();
        assert_eq!(found.inline_count(), Some(2));
        assert_eq!(slot.mode(), SlotMode::Inline);
    }
}
