//! # Lifeline
//!
//! Lock-free reference-counted object lifetimes:
//!
//! - **Strong references**: one pointer-width count per object, updated by
//!   CAS loops, no locks on any lifetime path
//! - **Weak references**: a proxy control block attached on first request,
//!   after which the object's count word permanently encodes the proxy
//! - **Final release**: an overridable hook that may destroy the object,
//!   defer destruction to another thread, or resurrect it once
//! - **Aggregation**: inner objects whose identity and public lifetime
//!   belong to a controlling outer object
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          LIFELINE                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │   Handles    │  │ Aggregation  │  │ ReleaseQueue │           │
//! │  │ (handle.rs)  │  │(aggregate.rs)│  │(affinity.rs) │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │   Objects    │  │  Count slot  │  │ Weak proxies │           │
//! │  │ (object.rs)  │  │  (slot.rs)   │  │  (proxy.rs)  │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use lifeline::{Managed, StrongHandle};
//!
//! struct Document {
//!     title: String,
//! }
//!
//! impl Managed for Document {}
//!
//! let doc = StrongHandle::new(Document { title: "notes".into() });
//! let weak = StrongHandle::downgrade(&doc);
//! assert_eq!(weak.resolve().unwrap().title, "notes");
//!
//! drop(doc);
//! assert!(weak.resolve().is_none());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod affinity;
mod aggregate;
pub mod config;
pub mod fail_fast;
mod handle;
pub mod iid;
pub mod log;
mod object;
mod proxy;
mod slot;
pub mod stats;
mod sync;

// Re-exports
pub use affinity::ReleaseQueue;
pub use aggregate::{Composer, Inner};
pub use config::{ConfigError, LifetimeConfig, LifetimeConfigBuilder};
pub use fail_fast::{FailFastInfo, FailFastMode, FailFastReason};
pub use handle::{StrongHandle, Unknown, WeakHandle, WeakReference};
pub use iid::Iid;
pub use object::{Finalizer, Lifecycle, Managed};
pub use slot::{SlotMode, INLINE_COUNT_MAX};
pub use stats::LifetimeStats;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Global configuration.
static CONFIG: std::sync::OnceLock<LifetimeConfig> = std::sync::OnceLock::new();

/// Apply a configuration process-wide.
///
/// Sets the log level, format and output stream, the fail-fast mode and
/// backtrace capture, and the diagnostics switches. Only the first call
/// takes effect; later calls return `false` and change nothing.
///
/// # Example
///
/// ```rust,ignore
/// use lifeline::{init, FailFastMode, LifetimeConfig};
///
/// let config = LifetimeConfig::builder()
///     .fail_fast_mode(FailFastMode::Panic)
///     .build()
///     .unwrap();
///
/// init(config);
/// ```
pub fn init(config: LifetimeConfig) -> bool {
    if CONFIG.set(config).is_err() {
        return false;
    }
    let Some(config) = CONFIG.get() else {
        return false;
    };

    log::set_level(config.log.level);
    log::set_format(config.log.format);
    log::set_use_stderr(config.log.use_stderr);

    fail_fast::set_mode(config.fail_fast.mode);
    fail_fast::set_capture_backtrace(config.fail_fast.capture_backtrace);

    stats::set_track_stats(config.diagnostics.track_stats);
    stats::set_poison_freed(config.diagnostics.poison_freed);

    log::LogBuilder::new(log::LogLevel::Debug)
        .target("lifeline")
        .message("configuration applied")
        .field_str("version", VERSION)
        .field_str("fail_fast", config.fail_fast.mode.as_str())
        .field_bool("track_stats", config.diagnostics.track_stats)
        .field_bool("poison_freed", config.diagnostics.poison_freed)
        .emit();
    true
}

/// Apply the configuration read from `LIFELINE_*` environment variables.
///
/// See [`LifetimeConfig::from_env`] for the full list of supported
/// variables.
pub fn init_from_env() -> bool {
    init(LifetimeConfig::from_env())
}

/// Get the applied configuration.
///
/// Returns `None` if neither `init` nor `init_from_env` has run.
pub fn config() -> Option<&'static LifetimeConfig> {
    CONFIG.get()
}
