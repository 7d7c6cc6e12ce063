//! Model-checked races.
//!
//! Run with `RUSTFLAGS="--cfg loom" cargo test --release --test loom_tests`.

#![cfg(loom)]

use loom::sync::atomic::{AtomicUsize, Ordering};
use loom::sync::Arc;
use loom::thread;

use lifeline::{Managed, SlotMode, StrongHandle};

struct Cell {
    drops: Arc<AtomicUsize>,
}

impl Managed for Cell {}

impl Drop for Cell {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

fn cell() -> (StrongHandle<Cell>, Arc<AtomicUsize>) {
    let drops = Arc::new(AtomicUsize::new(0));
    let handle = StrongHandle::new(Cell {
        drops: Arc::clone(&drops),
    });
    (handle, drops)
}

#[test]
fn concurrent_proxy_install_converges() {
    loom::model(|| {
        let (handle, _drops) = cell();
        let other = handle.clone();

        let t = thread::spawn(move || {
            let weak = StrongHandle::downgrade(&other);
            (weak, other)
        });
        let mine = StrongHandle::downgrade(&handle);
        let (theirs, other) = t.join().unwrap();

        assert!(mine.ptr_eq(&theirs));
        assert_eq!(mine.as_weak_reference().proxy_ref_count(), 3);
        assert_eq!(mine.as_weak_reference().source_ref_count(), 2);
        drop(other);
        assert_eq!(StrongHandle::strong_count(&handle), 1);
    });
}

#[test]
fn add_ref_racing_install_is_not_lost() {
    loom::model(|| {
        let (handle, drops) = cell();
        let other = handle.clone();

        let t = thread::spawn(move || {
            let extra = other.clone();
            drop(other);
            extra
        });
        let weak = StrongHandle::downgrade(&handle);
        let extra = t.join().unwrap();

        assert_eq!(StrongHandle::slot_mode(&handle), SlotMode::ProxyEncoded);
        assert_eq!(StrongHandle::strong_count(&handle), 2);
        drop(extra);
        drop(handle);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(weak.resolve().is_none());
    });
}

#[test]
fn resolve_racing_final_release() {
    loom::model(|| {
        let (handle, drops) = cell();
        let weak = StrongHandle::downgrade(&handle);

        let t = thread::spawn(move || weak.resolve().is_some());
        drop(handle);
        let _resolved = t.join().unwrap();

        // Whether or not the resolve won, the object is destroyed exactly
        // once and only after the resolved handle was released.
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn concurrent_final_release_runs_once() {
    loom::model(|| {
        let (handle, drops) = cell();
        let weak = StrongHandle::downgrade(&handle);
        let other = handle.clone();

        let t = thread::spawn(move || drop(other));
        drop(handle);
        t.join().unwrap();

        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(weak.resolve().is_none());
    });
}
