//! Process-wide initialization.
//!
//! Kept in its own test binary: `init` changes global state that the other
//! suites rely on.

use lifeline::fail_fast;
use lifeline::log::{self, LogFormat, LogLevel};
use lifeline::{stats, FailFastMode, LifetimeConfig, Managed, StrongHandle};

struct Node;

impl Managed for Node {}

#[test]
fn init_applies_configuration_once() {
    assert!(lifeline::config().is_none());

    let config = LifetimeConfig::builder()
        .log_level(LogLevel::Error)
        .log_format(LogFormat::Json)
        .fail_fast_mode(FailFastMode::Panic)
        .capture_backtrace(false)
        .track_stats(true)
        .poison_freed(true)
        .build()
        .unwrap();
    assert!(lifeline::init(config.clone()));
    assert_eq!(lifeline::config(), Some(&config));

    assert_eq!(log::level(), LogLevel::Error);
    assert_eq!(log::format(), LogFormat::Json);
    assert_eq!(fail_fast::mode(), FailFastMode::Panic);
    assert!(stats::track_stats());
    assert!(stats::poison_freed());

    // A second init is ignored.
    assert!(!lifeline::init(LifetimeConfig::default()));
    assert!(!lifeline::init_from_env());
    assert_eq!(fail_fast::mode(), FailFastMode::Panic);

    // Counting is on: a create/destroy cycle shows up in the snapshot.
    let before = stats::snapshot();
    let weak = StrongHandle::downgrade(&StrongHandle::new(Node));
    assert!(weak.resolve().is_none());
    let after = stats::snapshot();
    assert_eq!(after.objects_created - before.objects_created, 1);
    assert_eq!(after.objects_destroyed - before.objects_destroyed, 1);
    assert_eq!(after.proxies_installed - before.proxies_installed, 1);
    assert_eq!(after.final_releases - before.final_releases, 1);
    assert!(after.resolves_failed > before.resolves_failed);
    drop(weak);
    assert_eq!(stats::snapshot().proxies_freed - before.proxies_freed, 1);
}
