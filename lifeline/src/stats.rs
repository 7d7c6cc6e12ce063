//! Lifetime Statistics
//!
//! Process-wide counters for lifetime events, plus the diagnostic switches
//! that control them. Counting is off by default in release builds; enable
//! it with `LIFELINE_TRACK_STATS=1` or [`set_track_stats`].
//!
//! All counters are relaxed atomics. A [`snapshot`] taken while other
//! threads are active is not a consistent cut, only a monotone view of each
//! counter.
//!
//! # Example
//!
//! ```rust,ignore
//! use lifeline::stats;
//!
//! let before = stats::snapshot();
//! // ... create and drop objects ...
//! let after = stats::snapshot();
//! println!("objects leaked: {}", after.live_objects());
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static TRACK_STATS: AtomicBool = AtomicBool::new(cfg!(debug_assertions));

static POISON_FREED: AtomicBool = AtomicBool::new(false);

/// Byte written over freed object blocks and proxies when poisoning is on.
pub const POISON_BYTE: u8 = 0xDD;

/// A lifetime event that is counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    ObjectCreated,
    ObjectDestroyed,
    ProxyInstalled,
    ProxyDiscarded,
    ProxyFreed,
    ResolveHit,
    ResolveMiss,
    FinalRelease,
    Resurrection,
    DeferredRelease,
    Disconnect,
}

struct LifetimeCounters {
    objects_created: AtomicU64,
    objects_destroyed: AtomicU64,
    proxies_installed: AtomicU64,
    proxies_discarded: AtomicU64,
    proxies_freed: AtomicU64,
    resolves_succeeded: AtomicU64,
    resolves_failed: AtomicU64,
    final_releases: AtomicU64,
    resurrections: AtomicU64,
    deferred_releases: AtomicU64,
    disconnections: AtomicU64,
}

impl LifetimeCounters {
    const fn new() -> Self {
        Self {
            objects_created: AtomicU64::new(0),
            objects_destroyed: AtomicU64::new(0),
            proxies_installed: AtomicU64::new(0),
            proxies_discarded: AtomicU64::new(0),
            proxies_freed: AtomicU64::new(0),
            resolves_succeeded: AtomicU64::new(0),
            resolves_failed: AtomicU64::new(0),
            final_releases: AtomicU64::new(0),
            resurrections: AtomicU64::new(0),
            deferred_releases: AtomicU64::new(0),
            disconnections: AtomicU64::new(0),
        }
    }

    fn counter(&self, event: Event) -> &AtomicU64 {
        match event {
            Event::ObjectCreated => &self.objects_created,
            Event::ObjectDestroyed => &self.objects_destroyed,
            Event::ProxyInstalled => &self.proxies_installed,
            Event::ProxyDiscarded => &self.proxies_discarded,
            Event::ProxyFreed => &self.proxies_freed,
            Event::ResolveHit => &self.resolves_succeeded,
            Event::ResolveMiss => &self.resolves_failed,
            Event::FinalRelease => &self.final_releases,
            Event::Resurrection => &self.resurrections,
            Event::DeferredRelease => &self.deferred_releases,
            Event::Disconnect => &self.disconnections,
        }
    }
}

static COUNTERS: LifetimeCounters = LifetimeCounters::new();

/// Point-in-time copy of the lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifetimeStats {
    /// Managed objects allocated.
    pub objects_created: u64,
    /// Managed objects destroyed.
    pub objects_destroyed: u64,
    /// Proxies installed into a slot.
    pub proxies_installed: u64,
    /// Proxies allocated but discarded after losing the install race.
    pub proxies_discarded: u64,
    /// Installed proxies freed after their last reference.
    pub proxies_freed: u64,
    /// Resolve calls that produced a strong reference.
    pub resolves_succeeded: u64,
    /// Resolve calls that reported not found.
    pub resolves_failed: u64,
    /// Zero-count transitions that entered finalization.
    pub final_releases: u64,
    /// Objects returned from finalization to live.
    pub resurrections: u64,
    /// Finalizers queued for an owner thread.
    pub deferred_releases: u64,
    /// Weak-reference disconnections.
    pub disconnections: u64,
}

impl LifetimeStats {
    /// Objects created and not yet destroyed.
    pub fn live_objects(&self) -> u64 {
        self.objects_created.saturating_sub(self.objects_destroyed)
    }

    /// Installed proxies not yet freed.
    pub fn live_proxies(&self) -> u64 {
        self.proxies_installed.saturating_sub(self.proxies_freed)
    }
}

/// Take a snapshot of the process-wide counters.
pub fn snapshot() -> LifetimeStats {
    let c = &COUNTERS;
    LifetimeStats {
        objects_created: c.objects_created.load(Ordering::Relaxed),
        objects_destroyed: c.objects_destroyed.load(Ordering::Relaxed),
        proxies_installed: c.proxies_installed.load(Ordering::Relaxed),
        proxies_discarded: c.proxies_discarded.load(Ordering::Relaxed),
        proxies_freed: c.proxies_freed.load(Ordering::Relaxed),
        resolves_succeeded: c.resolves_succeeded.load(Ordering::Relaxed),
        resolves_failed: c.resolves_failed.load(Ordering::Relaxed),
        final_releases: c.final_releases.load(Ordering::Relaxed),
        resurrections: c.resurrections.load(Ordering::Relaxed),
        deferred_releases: c.deferred_releases.load(Ordering::Relaxed),
        disconnections: c.disconnections.load(Ordering::Relaxed),
    }
}

/// Enable or disable counting.
pub fn set_track_stats(enabled: bool) {
    TRACK_STATS.store(enabled, Ordering::Relaxed);
}

/// Whether counting is enabled.
pub fn track_stats() -> bool {
    TRACK_STATS.load(Ordering::Relaxed)
}

/// Enable or disable poisoning of freed blocks.
pub fn set_poison_freed(enabled: bool) {
    POISON_FREED.store(enabled, Ordering::Relaxed);
}

/// Whether freed blocks are poisoned.
pub fn poison_freed() -> bool {
    POISON_FREED.load(Ordering::Relaxed)
}

#[inline]
pub(crate) fn record(event: Event) {
    if track_stats() {
        COUNTERS.counter(event).fetch_add(1, Ordering::Relaxed);
    }
}

/// Overwrite a block that is about to be deallocated.
///
/// # Safety
///
/// `ptr` must be valid for writes of `len` bytes and hold no live values.
#[inline]
pub(crate) unsafe fn poison(ptr: *mut u8, len: usize) {
    if poison_freed() {
        std::ptr::write_bytes(ptr, POISON_BYTE, len);
    }
}
