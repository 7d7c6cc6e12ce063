//! Fail-Fast Termination
//!
//! Conditions that indicate memory corruption or a broken caller contract
//! terminate the process instead of returning an error:
//!
//! - allocation failure for an object block or a weak reference proxy
//! - a zero-count transition on an object that already left `Live`
//!   (release after final release)
//! - reference count overflow
//! - a proxy address that cannot be encoded in a reference-count slot
//!
//! Before terminating, the failure is recorded, logged at error level and
//! handed to every registered hook. In [`FailFastMode::Panic`] the process
//! is not aborted; the failure unwinds as a panic whose payload is the
//! [`FailFastInfo`], which lets test harnesses observe it with
//! [`catch_fail_fast`].
//!
//! # Example
//!
//! ```rust,ignore
//! use lifeline::fail_fast::{register_hook, FailFastInfo};
//!
//! register_hook(|info: &FailFastInfo| {
//!     eprintln!("lifetime failure: {}", info.reason());
//! });
//! ```

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::panic::{self, AssertUnwindSafe, UnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use thiserror::Error;

use crate::log::{self, LogBuilder, LogLevel};

/// Why the process is being terminated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailFastReason {
    /// The allocator returned null for an object block.
    #[error("allocation of a {size}-byte object block failed")]
    ObjectAllocation {
        /// Requested block size in bytes.
        size: usize,
    },
    /// The allocator returned null for a weak reference proxy.
    #[error("allocation of a weak reference proxy failed")]
    ProxyAllocation,
    /// A release drove the count to zero on an object that is already
    /// finalizing or destroyed.
    #[error("release after final release on `{type_name}`")]
    ReleaseAfterFinal {
        /// Type name of the managed value.
        type_name: &'static str,
    },
    /// A proxy reference count was released more often than acquired.
    #[error("weak reference proxy released more often than acquired")]
    ProxyUnderflow,
    /// A reference count would exceed its representable maximum.
    #[error("reference count overflow")]
    CountOverflow,
    /// The proxy address has its top bit set and cannot be tagged.
    #[error("proxy address {address:#x} cannot be encoded in a reference-count slot")]
    UnencodableProxyAddress {
        /// The offending address.
        address: usize,
    },
}

/// How a fail-fast condition terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum FailFastMode {
    /// Abort the process (default).
    #[default]
    Abort = 0,
    /// Unwind with a [`FailFastInfo`] payload.
    Panic = 1,
}

impl FailFastMode {
    /// Get the mode from a u8.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(FailFastMode::Abort),
            1 => Some(FailFastMode::Panic),
            _ => None,
        }
    }

    /// Parse a mode from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "abort" => Some(FailFastMode::Abort),
            "panic" | "unwind" => Some(FailFastMode::Panic),
            _ => None,
        }
    }

    /// Convert to a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailFastMode::Abort => "abort",
            FailFastMode::Panic => "panic",
        }
    }
}

/// Source location of the failing check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// File name.
    pub file: &'static str,
    /// Line number.
    pub line: u32,
    /// Column number.
    pub column: u32,
}

/// Information about a fail-fast event.
#[derive(Debug, Clone)]
pub struct FailFastInfo {
    reason: FailFastReason,
    location: Location,
    backtrace: Option<String>,
    count: u64,
    thread_name: Option<String>,
    thread_id: u64,
}

impl FailFastInfo {
    /// The failed condition.
    pub fn reason(&self) -> &FailFastReason {
        &self.reason
    }

    /// Where the condition was detected.
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Backtrace, if capture was enabled and available.
    pub fn backtrace(&self) -> Option<&str> {
        self.backtrace.as_deref()
    }

    /// Sequence number of this event in the process.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Name of the failing thread, if it has one.
    pub fn thread_name(&self) -> Option<&str> {
        self.thread_name.as_deref()
    }

    /// Numeric id of the failing thread.
    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    /// Format as a multi-line report.
    pub fn format(&self) -> String {
        let mut output = String::new();

        output.push_str(&format!("fail-fast #{}: {}\n", self.count, self.reason));
        output.push_str(&format!(
            "  at {}:{}:{}\n",
            self.location.file, self.location.line, self.location.column
        ));

        if let Some(thread) = &self.thread_name {
            output.push_str(&format!("  in thread '{}' (id: {})\n", thread, self.thread_id));
        } else {
            output.push_str(&format!("  in thread id: {}\n", self.thread_id));
        }

        if let Some(bt) = &self.backtrace {
            output.push_str("\nBacktrace:\n");
            output.push_str(bt);
        }

        output
    }
}

impl fmt::Display for FailFastInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

type Hook = Arc<dyn Fn(&FailFastInfo) + Send + Sync>;

static MODE: AtomicU8 = AtomicU8::new(FailFastMode::Abort as u8);

static CAPTURE_BACKTRACE: AtomicBool = AtomicBool::new(cfg!(debug_assertions));

static FAIL_FAST_COUNT: AtomicU64 = AtomicU64::new(0);

static HOOKS: OnceLock<Mutex<Vec<(u64, Hook)>>> = OnceLock::new();

static LAST_FAILURE: OnceLock<Mutex<Option<FailFastInfo>>> = OnceLock::new();

fn get_hooks() -> &'static Mutex<Vec<(u64, Hook)>> {
    HOOKS.get_or_init(|| Mutex::new(Vec::new()))
}

fn get_last_failure() -> &'static Mutex<Option<FailFastInfo>> {
    LAST_FAILURE.get_or_init(|| Mutex::new(None))
}

/// Set how fail-fast conditions terminate.
pub fn set_mode(mode: FailFastMode) {
    MODE.store(mode as u8, Ordering::SeqCst);
}

/// Get the current termination mode.
pub fn mode() -> FailFastMode {
    FailFastMode::from_u8(MODE.load(Ordering::SeqCst)).unwrap_or_default()
}

/// Enable or disable backtrace capture.
pub fn set_capture_backtrace(enabled: bool) {
    CAPTURE_BACKTRACE.store(enabled, Ordering::SeqCst);
}

/// Register a hook that runs before termination.
///
/// Hooks run in registration order on the failing thread. A panicking hook
/// is contained and does not prevent the remaining hooks from running.
///
/// Returns an id for [`unregister_hook`].
pub fn register_hook<F>(hook: F) -> u64
where
    F: Fn(&FailFastInfo) + Send + Sync + 'static,
{
    static HOOK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

    let hook_id = HOOK_ID_COUNTER.fetch_add(1, Ordering::SeqCst);
    get_hooks().lock().push((hook_id, Arc::new(hook)));
    hook_id
}

/// Remove a hook by id. Returns whether it was registered.
pub fn unregister_hook(hook_id: u64) -> bool {
    let mut hooks = get_hooks().lock();
    let before = hooks.len();
    hooks.retain(|(id, _)| *id != hook_id);
    hooks.len() != before
}

/// Remove all hooks.
pub fn clear_hooks() {
    get_hooks().lock().clear();
}

/// Number of fail-fast events in this process.
pub fn fail_fast_count() -> u64 {
    FAIL_FAST_COUNT.load(Ordering::SeqCst)
}

/// The most recent fail-fast event, if any.
pub fn last_failure() -> Option<FailFastInfo> {
    get_last_failure().lock().clone()
}

/// Terminate on a violated lifetime invariant.
#[cold]
#[inline(never)]
#[track_caller]
pub(crate) fn fail_fast(reason: FailFastReason) -> ! {
    let caller = std::panic::Location::caller();
    let count = FAIL_FAST_COUNT.fetch_add(1, Ordering::SeqCst) + 1;

    let backtrace = if CAPTURE_BACKTRACE.load(Ordering::Relaxed) {
        let bt = Backtrace::capture();
        match bt.status() {
            BacktraceStatus::Captured => Some(bt.to_string()),
            _ => None,
        }
    } else {
        None
    };

    let thread = std::thread::current();
    let info = FailFastInfo {
        reason,
        location: Location {
            file: caller.file(),
            line: caller.line(),
            column: caller.column(),
        },
        backtrace,
        count,
        thread_name: thread.name().map(|s| s.to_string()),
        thread_id: thread_id_as_u64(),
    };

    if log::would_log(LogLevel::Error) {
        LogBuilder::new(LogLevel::Error)
            .target("lifeline::fail_fast")
            .message(info.reason.to_string())
            .field_str("location", format!("{}:{}", caller.file(), caller.line()))
            .field_int("count", count as i64)
            .emit();
    }

    *get_last_failure().lock() = Some(info.clone());

    // Snapshot so a hook may register or clear hooks without deadlocking.
    let hooks: Vec<Hook> = get_hooks().lock().iter().map(|(_, h)| Arc::clone(h)).collect();
    for hook in hooks {
        let _ = panic::catch_unwind(AssertUnwindSafe(|| hook(&info)));
    }

    match mode() {
        FailFastMode::Abort => {
            eprintln!("{}", info.format());
            std::process::abort()
        }
        FailFastMode::Panic => panic::panic_any(info),
    }
}

/// Run `f`, returning the [`FailFastInfo`] if it fails fast in panic mode.
///
/// Panics that did not originate from a fail-fast check are resumed.
pub fn catch_fail_fast<F, R>(f: F) -> Result<R, FailFastInfo>
where
    F: FnOnce() -> R + UnwindSafe,
{
    match panic::catch_unwind(f) {
        Ok(value) => Ok(value),
        Err(payload) => match downcast_info(payload) {
            Ok(info) => Err(info),
            Err(payload) => panic::resume_unwind(payload),
        },
    }
}

fn downcast_info(payload: Box<dyn Any + Send>) -> Result<FailFastInfo, Box<dyn Any + Send>> {
    payload.downcast::<FailFastInfo>().map(|info| *info)
}

fn thread_id_as_u64() -> u64 {
    // ThreadId is opaque; its Debug output is "ThreadId(N)".
    let id_str = format!("{:?}", std::thread::current().id());
    id_str
        .trim_start_matches("ThreadId(")
        .trim_end_matches(')')
        .parse()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_reason_display() {
        let reason = FailFastReason::ReleaseAfterFinal { type_name: "Widget" };
        assert_eq!(reason.to_string(), "release after final release on `Widget`");

        let reason = FailFastReason::UnencodableProxyAddress { address: 0xff };
        assert!(reason.to_string().contains("0xff"));
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!(FailFastMode::from_str("abort"), Some(FailFastMode::Abort));
        assert_eq!(FailFastMode::from_str("PANIC"), Some(FailFastMode::Panic));
        assert_eq!(FailFastMode::from_str("unwind"), Some(FailFastMode::Panic));
        assert_eq!(FailFastMode::from_str("exit"), None);
        assert_eq!(FailFastMode::Panic.as_str(), "panic");
    }

    #[test]
    fn test_catch_fail_fast_in_panic_mode() {
        set_mode(FailFastMode::Panic);
        let before = fail_fast_count();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let id = register_hook(move |info| {
            if *info.reason() == FailFastReason::CountOverflow {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let result = catch_fail_fast(|| -> () { fail_fast(FailFastReason::CountOverflow) });
        let info = result.unwrap_err();

        assert_eq!(*info.reason(), FailFastReason::CountOverflow);
        assert!(info.location().file.ends_with("fail_fast.rs"));
        assert!(info.count() > before);
        assert!(fail_fast_count() > before);
        assert!(hits.load(Ordering::SeqCst) >= 1);
        assert!(last_failure().is_some());
        assert!(unregister_hook(id));
        assert!(!unregister_hook(id));
    }

    #[test]
    fn test_catch_fail_fast_passes_other_panics() {
        let result = panic::catch_unwind(|| catch_fail_fast(|| panic!("ordinary")));
        assert!(result.is_err());
    }

    #[test]
    fn test_catch_fail_fast_ok() {
        assert_eq!(catch_fail_fast(|| 7).unwrap(), 7);
    }

    #[test]
    fn test_info_format() {
        let info = FailFastInfo {
            reason: FailFastReason::ProxyAllocation,
            location: Location {
                file: "src/proxy.rs",
                line: 10,
                column: 5,
            },
            backtrace: None,
            count: 3,
            thread_name: Some("worker".into()),
            thread_id: 9,
        };
        let text = info.format();
        assert!(text.contains("fail-fast #3"));
        assert!(text.contains("src/proxy.rs:10:5"));
        assert!(text.contains("'worker'"));
    }
}
