//! Atomic primitives used by the lifetime core.
//!
//! Under `--cfg loom` the object and proxy atomics come from `loom`, so the
//! install and resolve races can be model-checked. Process-wide counters in
//! `stats` and `log` stay on std atomics because they are `static`.

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU8, AtomicUsize, Ordering};

#[cfg(not(loom))]
pub(crate) use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU8, AtomicUsize, Ordering};

/// Spin hint for CAS retry loops.
#[inline]
pub(crate) fn spin_loop() {
    #[cfg(loom)]
    loom::thread::yield_now();

    #[cfg(not(loom))]
    std::hint::spin_loop();
}
