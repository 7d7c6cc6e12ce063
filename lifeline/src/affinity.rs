//! Thread-affine deferred release.
//!
//! Some objects must be destroyed on the thread that owns them. Such types
//! route their final release through a [`ReleaseQueue`] owned by that thread:
//! off-thread finalizers are queued and destroyed when the owner drains the
//! queue.
//!
//! ```rust,ignore
//! struct Window {
//!     queue: Arc<ReleaseQueue>,
//! }
//!
//! impl Managed for Window {
//!     fn on_final_release(finalizer: Finalizer<Self>) {
//!         let queue = Arc::clone(&finalizer.get().queue);
//!         queue.release_on_owner(finalizer);
//!     }
//! }
//!
//! // On the owner thread, e.g. once per event loop turn:
//! queue.drain();
//! ```

use std::fmt;
use std::mem;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::log::{self, LogBuilder, LogLevel};
use crate::object::{Finalizer, Managed};
use crate::stats::{self, Event};

/// A finalizer with its type erased.
trait DeferredDestroy: Send {
    fn destroy(self: Box<Self>);
    fn type_name(&self) -> &'static str;
}

impl<T: Managed> DeferredDestroy for Finalizer<T> {
    fn destroy(self: Box<Self>) {
        Finalizer::destroy(*self);
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

struct QueueState {
    pending: Vec<Box<dyn DeferredDestroy>>,
    accepting: bool,
}

/// Finalizers waiting to be destroyed on their owner thread.
pub struct ReleaseQueue {
    owner: ThreadId,
    state: Mutex<QueueState>,
}

impl ReleaseQueue {
    /// Create a queue owned by the calling thread.
    pub fn for_current_thread() -> Self {
        ReleaseQueue {
            owner: thread::current().id(),
            state: Mutex::new(QueueState {
                pending: Vec::new(),
                accepting: true,
            }),
        }
    }

    /// The owner thread.
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Whether the calling thread owns the queue.
    pub fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// Destroy on the owner thread.
    ///
    /// On the owner thread the object is destroyed immediately. Elsewhere it
    /// is queued; after [`shutdown`](Self::shutdown) it is destroyed on the
    /// calling thread instead.
    pub fn release_on_owner<T: Managed>(&self, finalizer: Finalizer<T>) {
        if self.is_owner_thread() {
            finalizer.destroy();
            return;
        }

        if let Err(finalizer) = self.defer(finalizer) {
            if log::would_log(LogLevel::Warn) {
                LogBuilder::new(LogLevel::Warn)
                    .target("lifeline::affinity")
                    .message("release queue shut down, destroying off owner thread")
                    .field_str("type", std::any::type_name::<T>())
                    .emit();
            }
            finalizer.destroy();
        }
    }

    /// Queue a finalizer for the owner thread.
    ///
    /// Hands the finalizer back if the queue has been shut down.
    pub fn defer<T: Managed>(&self, finalizer: Finalizer<T>) -> Result<(), Finalizer<T>> {
        let queued = {
            let mut state = self.state.lock();
            if !state.accepting {
                return Err(finalizer);
            }
            state.pending.push(Box::new(finalizer));
            state.pending.len()
        };

        stats::record(Event::DeferredRelease);
        if log::would_log(LogLevel::Debug) {
            LogBuilder::new(LogLevel::Debug)
                .target("lifeline::affinity")
                .message("final release deferred to owner thread")
                .field_str("type", std::any::type_name::<T>())
                .field_uint("queued", queued)
                .emit();
        }
        Ok(())
    }

    /// Destroy every queued object. Returns how many were destroyed.
    ///
    /// Destruction runs outside the lock, so objects that defer further
    /// releases while being destroyed are picked up in the same call.
    pub fn drain(&self) -> usize {
        debug_assert!(
            self.is_owner_thread(),
            "release queue drained off its owner thread"
        );

        let mut destroyed = 0;
        loop {
            let batch = mem::take(&mut self.state.lock().pending);
            if batch.is_empty() {
                break;
            }
            destroyed += batch.len();
            for finalizer in batch {
                if log::would_log(LogLevel::Trace) {
                    LogBuilder::new(LogLevel::Trace)
                        .target("lifeline::affinity")
                        .message("destroying deferred object")
                        .field_str("type", finalizer.type_name())
                        .emit();
                }
                finalizer.destroy();
            }
        }
        destroyed
    }

    /// Stop accepting finalizers and drain what is queued.
    pub fn shutdown(&self) -> usize {
        self.state.lock().accepting = false;
        self.drain()
    }

    /// Number of queued finalizers.
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue still accepts finalizers.
    pub fn is_accepting(&self) -> bool {
        self.state.lock().accepting
    }
}

impl Drop for ReleaseQueue {
    fn drop(&mut self) {
        let pending = mem::take(&mut self.state.get_mut().pending);
        if pending.is_empty() {
            return;
        }
        if log::would_log(LogLevel::Warn) {
            LogBuilder::new(LogLevel::Warn)
                .target("lifeline::affinity")
                .message("release queue dropped with pending objects")
                .field_uint("pending", pending.len())
                .emit();
        }
        for finalizer in pending {
            finalizer.destroy();
        }
    }
}

impl fmt::Debug for ReleaseQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ReleaseQueue")
            .field("owner", &self.owner)
            .field("pending", &state.pending.len())
            .field("accepting", &state.accepting)
            .finish()
    }
}
