//! Managed objects.
//!
//! Every managed value lives in a single heap block: an [`ObjectHeader`]
//! followed by the value. The header carries the reference-count slot, the
//! lifecycle state, the controlling outer object (for aggregated objects)
//! and a per-type vtable, so that type-erased handles can count, query and
//! finalize the object without knowing its type.
//!
//! # Lifecycle
//!
//! ```text
//!   Live ──(count reaches 0)──► Finalizing ──(destroy)──► Destroyed
//!     ▲                              │
//!     └──────(resurrect, once)───────┘
//! ```
//!
//! On the zero transition the count is re-armed to 1 and
//! [`Managed::on_final_release`] receives a [`Finalizer`] that owns that
//! count. Dropping the finalizer destroys the object. A zero transition while
//! not `Live` is a release after final release and fails fast.
//!
//! # Entry points
//!
//! The public entry points (`add_ref`, `release`, `query`,
//! `get_weak_reference`) forward to the controlling outer object when the
//! object is aggregated. The `*_own` entry points always operate on the
//! object's own slot; they back [`Inner`](crate::Inner) and the weak
//! reference machinery.

use std::alloc::{self, Layout};
use std::any::{self, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop};
use std::ptr::{self, NonNull};

use crate::fail_fast::{fail_fast, FailFastReason};
use crate::handle::{StrongHandle, Unknown, WeakReference};
use crate::iid::Iid;
use crate::log::{self, LogBuilder, LogLevel};
use crate::proxy::WeakReferenceProxy;
use crate::slot::{RefCountSlot, SlotMode, SlotState, SlotStep};
use crate::stats::{self, Event};
use crate::sync::{AtomicU8, Ordering};

const LIVE: u8 = 0;
const FINALIZING: u8 = 1;
const DESTROYED: u8 = 2;
const STATE_MASK: u8 = 0b011;
const RESURRECTED: u8 = 0b100;

/// Lifecycle state of a managed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    /// Reachable through strong references.
    Live,
    /// The count reached zero; the final-release hook owns the object.
    Finalizing,
    /// The value has been dropped.
    Destroyed,
}

impl Lifecycle {
    fn from_bits(bits: u8) -> Self {
        match bits & STATE_MASK {
            LIVE => Lifecycle::Live,
            FINALIZING => Lifecycle::Finalizing,
            _ => Lifecycle::Destroyed,
        }
    }
}

/// A value whose lifetime is managed by a reference-count slot.
///
/// Both methods have defaults; most types only need `impl Managed for T {}`.
///
/// # Example
///
/// ```rust,ignore
/// use lifeline::{Finalizer, Managed, StrongHandle};
///
/// struct Texture { id: u32 }
///
/// impl Managed for Texture {
///     fn on_final_release(finalizer: Finalizer<Self>) {
///         println!("releasing texture {}", finalizer.get().id);
///         finalizer.destroy();
///     }
/// }
///
/// let texture = StrongHandle::new(Texture { id: 7 });
/// let weak = StrongHandle::downgrade(&texture);
/// assert!(weak.resolve().is_some());
/// drop(texture);
/// assert!(weak.resolve().is_none());
/// ```
pub trait Managed: Send + Sync + Sized + 'static {
    /// Answer a capability query the core does not answer itself.
    ///
    /// The core answers [`Iid::identity`], [`Iid::weak_reference_source`] and
    /// `Iid::of::<Self>()`. `this` is a borrowed handle to this object; return
    /// `Some(this.clone())` to expose a further capability of this object, or
    /// forward to an aggregated [`Inner`](crate::Inner) with
    /// [`Inner::query`](crate::Inner::query).
    fn query_capability(&self, this: &Unknown, iid: Iid) -> Option<Unknown> {
        let _ = (this, iid);
        None
    }

    /// Called once the strong count reaches zero.
    ///
    /// The default destroys the object immediately. Overrides may defer
    /// destruction by moving the finalizer elsewhere (another thread, a
    /// [`ReleaseQueue`](crate::ReleaseQueue)), or resurrect the object once.
    fn on_final_release(finalizer: Finalizer<Self>) {
        finalizer.destroy();
    }
}

pub(crate) struct ObjectVTable {
    type_id: fn() -> TypeId,
    type_name: fn() -> &'static str,
    query_capability: unsafe fn(NonNull<ObjectHeader>, Iid) -> Option<Unknown>,
    final_release: unsafe fn(NonNull<ObjectHeader>),
}

fn vtable<T: Managed>() -> &'static ObjectVTable {
    &ObjectVTable {
        type_id: TypeId::of::<T>,
        type_name: any::type_name::<T>,
        query_capability: query_capability_thunk::<T>,
        final_release: final_release_thunk::<T>,
    }
}

unsafe fn query_capability_thunk<T: Managed>(
    header: NonNull<ObjectHeader>,
    iid: Iid,
) -> Option<Unknown> {
    let block = header.cast::<ManagedBox<T>>();
    // Borrowed view: the caller already holds a count.
    let this = ManuallyDrop::new(Unknown::from_header(header));
    T::query_capability(&*block.as_ref().value, &this, iid)
}

unsafe fn final_release_thunk<T: Managed>(header: NonNull<ObjectHeader>) {
    T::on_final_release(Finalizer::from_block(header.cast()));
}

/// Type-erased prefix of every object block.
#[repr(C)]
pub(crate) struct ObjectHeader {
    slot: RefCountSlot,
    lifecycle: AtomicU8,
    outer: Option<NonNull<ObjectHeader>>,
    vtable: &'static ObjectVTable,
}

impl ObjectHeader {
    fn new(vtable: &'static ObjectVTable, outer: Option<NonNull<ObjectHeader>>) -> Self {
        ObjectHeader {
            slot: RefCountSlot::new(1),
            lifecycle: AtomicU8::new(LIVE),
            outer,
            vtable,
        }
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_bits(self.lifecycle.load(Ordering::Acquire))
    }

    pub(crate) fn was_resurrected(&self) -> bool {
        self.lifecycle.load(Ordering::Acquire) & RESURRECTED != 0
    }

    pub(crate) fn is_aggregated(&self) -> bool {
        self.outer.is_some()
    }

    pub(crate) fn type_name(&self) -> &'static str {
        (self.vtable.type_name)()
    }

    pub(crate) fn type_id(&self) -> TypeId {
        (self.vtable.type_id)()
    }

    pub(crate) fn slot_mode(&self) -> SlotMode {
        self.slot.mode()
    }

    /// The object that owns the public count: the outer when aggregated.
    fn controlling(this: NonNull<ObjectHeader>) -> NonNull<ObjectHeader> {
        // SAFETY: callers hold a count on `this`.
        unsafe { this.as_ref().outer.unwrap_or(this) }
    }
}

/// Header and value in one allocation.
#[repr(C)]
pub(crate) struct ManagedBox<T> {
    header: ObjectHeader,
    value: ManuallyDrop<T>,
}

impl<T: Managed> ManagedBox<T> {
    /// Allocate a live object with a count of 1.
    pub(crate) fn allocate(value: T, outer: Option<NonNull<ObjectHeader>>) -> NonNull<Self> {
        let block = Self::allocate_uninit(outer);
        // SAFETY: the block is freshly allocated and its value is unwritten.
        unsafe { Self::write_value(block, value) };
        block
    }

    /// Allocate a block whose header is initialized and whose value is not.
    pub(crate) fn allocate_uninit(outer: Option<NonNull<ObjectHeader>>) -> NonNull<Self> {
        let layout = Layout::new::<Self>();
        // SAFETY: the layout is non-zero sized; it contains the header.
        let raw = unsafe { alloc::alloc(layout) } as *mut Self;
        let Some(block) = NonNull::new(raw) else {
            fail_fast(FailFastReason::ObjectAllocation { size: layout.size() });
        };

        // SAFETY: freshly allocated, so the header field is writable.
        unsafe { ptr::addr_of_mut!((*raw).header).write(ObjectHeader::new(vtable::<T>(), outer)) };
        block
    }

    /// # Safety
    ///
    /// `block` must come from [`allocate_uninit`](Self::allocate_uninit) and
    /// its value must not have been written.
    pub(crate) unsafe fn write_value(block: NonNull<Self>, value: T) {
        ptr::addr_of_mut!((*block.as_ptr()).value).write(ManuallyDrop::new(value));
        stats::record(Event::ObjectCreated);
    }

    /// Free a block whose value was never written.
    ///
    /// # Safety
    ///
    /// `block` must come from [`allocate_uninit`](Self::allocate_uninit), its
    /// value must be unwritten, and nothing may reference it afterwards.
    pub(crate) unsafe fn deallocate_uninit(block: NonNull<Self>) {
        ptr::drop_in_place(ptr::addr_of_mut!((*block.as_ptr()).header));
        alloc::dealloc(block.as_ptr() as *mut u8, Layout::new::<Self>());
    }

    pub(crate) fn header(block: NonNull<Self>) -> NonNull<ObjectHeader> {
        block.cast()
    }

    pub(crate) fn value_ptr(block: NonNull<Self>) -> *const T {
        // SAFETY: field projection within a live block; `ManuallyDrop<T>`
        // is transparent over `T`.
        unsafe { ptr::addr_of!((*block.as_ptr()).value) as *const T }
    }

    /// Recover the block from a pointer produced by [`value_ptr`](Self::value_ptr).
    ///
    /// # Safety
    ///
    /// `value` must have come from `value_ptr` on a live block of this type.
    pub(crate) unsafe fn from_value_ptr(value: *const T) -> NonNull<Self> {
        let offset = mem::offset_of!(ManagedBox<T>, value);
        NonNull::new_unchecked((value as *const u8).sub(offset) as *mut Self)
    }

    /// # Safety
    ///
    /// The block must hold a written value that has not been dropped.
    pub(crate) unsafe fn value<'a>(block: NonNull<Self>) -> &'a T {
        &*Self::value_ptr(block)
    }
}

/// Public AddRef. Returns the new strong count of the controlling object.
///
/// # Safety
///
/// The caller must hold a count on `header`.
pub(crate) unsafe fn add_ref(header: NonNull<ObjectHeader>) -> usize {
    add_ref_own(ObjectHeader::controlling(header))
}

/// Public Release. Returns the new strong count of the controlling object.
///
/// # Safety
///
/// The caller must own the count being released and must not use `header`
/// afterwards if this was the last one.
pub(crate) unsafe fn release(header: NonNull<ObjectHeader>) -> usize {
    release_own(ObjectHeader::controlling(header))
}

/// Non-delegating AddRef on the object's own slot.
///
/// # Safety
///
/// The caller must hold a count on `header`'s own slot.
pub(crate) unsafe fn add_ref_own(header: NonNull<ObjectHeader>) -> usize {
    match header.as_ref().slot.increment() {
        SlotStep::Inline(count) => count,
        SlotStep::Proxy(proxy) => proxy.as_ref().increment_source(),
    }
}

/// Non-delegating Release on the object's own slot.
///
/// # Safety
///
/// The caller must own one count on `header`'s own slot.
pub(crate) unsafe fn release_own(header: NonNull<ObjectHeader>) -> usize {
    let h = header.as_ref();
    let remaining = match h.slot.decrement() {
        Some(SlotStep::Inline(count)) => Some(count),
        Some(SlotStep::Proxy(proxy)) => proxy.as_ref().decrement_source(),
        None => None,
    };

    match remaining {
        Some(0) => {
            begin_final_release(header);
            0
        }
        Some(count) => count,
        None => fail_fast(FailFastReason::ReleaseAfterFinal {
            type_name: h.type_name(),
        }),
    }
}

/// Current strong count of the controlling object.
///
/// # Safety
///
/// The caller must hold a count on `header`.
pub(crate) unsafe fn strong_count(header: NonNull<ObjectHeader>) -> usize {
    strong_count_own(ObjectHeader::controlling(header))
}

/// Current strong count of the object's own slot.
///
/// # Safety
///
/// The caller must hold a count on `header`.
pub(crate) unsafe fn strong_count_own(header: NonNull<ObjectHeader>) -> usize {
    match header.as_ref().slot.load().decode() {
        SlotState::Inline(count) => count,
        SlotState::Proxy(proxy) => proxy.as_ref().source_count(),
    }
}

unsafe fn begin_final_release(header: NonNull<ObjectHeader>) {
    let h = header.as_ref();

    // Load the state; synchronized by subsequent CAS.
    let mut state = h.lifecycle.load(Ordering::Acquire);
    loop {
        if state & STATE_MASK != LIVE {
            fail_fast(FailFastReason::ReleaseAfterFinal {
                type_name: h.type_name(),
            });
        }

        let next = (state & RESURRECTED) | FINALIZING;
        match h
            .lifecycle
            .compare_exchange_weak(state, next, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => break,
            Err(actual) => {
                // CAS failed; update the state and try again.
                state = actual;
            }
        }
    }

    // Re-arm to 1 so the hook can hand out or drop the last count. In proxy
    // mode the back-pointer is already null, so resolvers that see the
    // re-armed count back out.
    match h.slot.increment() {
        SlotStep::Inline(_) => {}
        SlotStep::Proxy(proxy) => proxy.as_ref().rearm_source(),
    }

    stats::record(Event::FinalRelease);
    if log::would_log(LogLevel::Trace) {
        LogBuilder::new(LogLevel::Trace)
            .target("lifeline::object")
            .message("final release")
            .field_str("type", h.type_name())
            .field_hex("object", header.as_ptr() as usize)
            .field_bool("aggregated", h.is_aggregated())
            .emit();
    }

    (h.vtable.final_release)(header);
}

/// Public capability query; forwards to the controlling outer.
///
/// # Safety
///
/// The caller must hold a count on `header`.
pub(crate) unsafe fn query(header: NonNull<ObjectHeader>, iid: Iid) -> Option<Unknown> {
    query_own(ObjectHeader::controlling(header), iid)
}

/// The controlling object of `header`: its outer when aggregated.
pub(crate) fn controlling(header: NonNull<ObjectHeader>) -> NonNull<ObjectHeader> {
    ObjectHeader::controlling(header)
}

/// A new strong reference to the canonical identity.
///
/// # Safety
///
/// The caller must hold a count on `header`.
pub(crate) unsafe fn identity(header: NonNull<ObjectHeader>) -> Unknown {
    Unknown::retain(ObjectHeader::controlling(header))
}

/// Non-delegating capability query.
///
/// Identity is answered only by non-aggregated objects; an aggregated
/// object's identity is its outer's, reachable through the public path.
///
/// # Safety
///
/// The caller must hold a count on `header`.
pub(crate) unsafe fn query_own(header: NonNull<ObjectHeader>, iid: Iid) -> Option<Unknown> {
    let h = header.as_ref();

    if iid == Iid::identity() {
        return if h.is_aggregated() {
            None
        } else {
            Some(Unknown::retain(header))
        };
    }

    if iid == Iid::weak_reference_source() || iid.type_id() == h.type_id() {
        return Some(Unknown::retain(header));
    }

    (h.vtable.query_capability)(header, iid)
}

/// Public GetWeakReference; forwards to the controlling outer.
///
/// Returns a proxy with one reference owned by the caller.
///
/// # Safety
///
/// The caller must hold a count on `header`.
pub(crate) unsafe fn get_weak_reference(header: NonNull<ObjectHeader>) -> NonNull<WeakReferenceProxy> {
    get_weak_reference_own(ObjectHeader::controlling(header))
}

unsafe fn get_weak_reference_own(header: NonNull<ObjectHeader>) -> NonNull<WeakReferenceProxy> {
    let h = header.as_ref();
    let mut current = h.slot.load();
    let mut spare: Option<NonNull<WeakReferenceProxy>> = None;

    loop {
        let count = match current.decode() {
            SlotState::Proxy(proxy) => {
                if let Some(spare) = spare {
                    log_install_contention(h, header);
                    WeakReferenceProxy::discard(spare);
                }
                proxy.as_ref().add_ref();
                return proxy;
            }
            SlotState::Inline(count) => count,
        };

        // The count is unpublished until the install succeeds, so a spare
        // from a lost race can simply be re-seeded.
        let proxy = match spare.take() {
            Some(proxy) => {
                WeakReferenceProxy::reseed(proxy, count);
                proxy
            }
            None => {
                let source = match h.lifecycle() {
                    Lifecycle::Live => header.as_ptr(),
                    _ => ptr::null_mut(),
                };
                WeakReferenceProxy::allocate(source, count)
            }
        };

        match h.slot.install(current, proxy) {
            Ok(()) => {
                stats::record(Event::ProxyInstalled);
                if log::would_log(LogLevel::Debug) {
                    LogBuilder::new(LogLevel::Debug)
                        .target("lifeline::proxy")
                        .message("weak reference proxy installed")
                        .field_str("type", h.type_name())
                        .field_hex("object", header.as_ptr() as usize)
                        .field_hex("proxy", proxy.as_ptr() as usize)
                        .field_uint("seeded_count", count)
                        .emit();
                }
                return proxy;
            }
            Err(actual) => {
                spare = Some(proxy);
                current = actual;
            }
        }
    }
}

fn log_install_contention(h: &ObjectHeader, header: NonNull<ObjectHeader>) {
    if log::would_log(LogLevel::Trace) {
        LogBuilder::new(LogLevel::Trace)
            .target("lifeline::proxy")
            .message("lost proxy install race")
            .field_str("type", h.type_name())
            .field_hex("object", header.as_ptr() as usize)
            .emit();
    }
}

/// Make every weak reference to the controlling object stop resolving.
///
/// # Safety
///
/// The caller must hold a count on `header`.
pub(crate) unsafe fn disconnect(header: NonNull<ObjectHeader>) {
    let controlling = ObjectHeader::controlling(header);
    let proxy = get_weak_reference_own(controlling);
    proxy.as_ref().disconnect();
    WeakReferenceProxy::release(proxy);

    stats::record(Event::Disconnect);
    if log::would_log(LogLevel::Debug) {
        LogBuilder::new(LogLevel::Debug)
            .target("lifeline::proxy")
            .message("weak references disconnected")
            .field_str("type", controlling.as_ref().type_name())
            .field_hex("object", controlling.as_ptr() as usize)
            .emit();
    }
}

/// Resolve a weak reference into a strong reference for `iid`.
///
/// # Safety
///
/// The caller must hold a proxy reference.
pub(crate) unsafe fn resolve(proxy: &WeakReferenceProxy, iid: Iid) -> Option<Unknown> {
    let result = try_resolve(proxy, iid);
    stats::record(match result {
        Some(_) => Event::ResolveHit,
        None => Event::ResolveMiss,
    });
    result
}

unsafe fn try_resolve(proxy: &WeakReferenceProxy, iid: Iid) -> Option<Unknown> {
    // 1. Cheap rejection: source finalized, never live, or disconnected.
    let cached = NonNull::new(proxy.source())?;
    if proxy.is_disconnected() {
        return None;
    }

    // 2. Speculative strong count; fails once the count hit zero.
    if !proxy.try_increment_source() {
        return None;
    }

    // 3. Revalidate. A changed back-pointer means the source entered final
    // release after step 1 and our increment landed on the re-armed count;
    // the object must not be touched.
    if proxy.source() != cached.as_ptr() {
        proxy.undo_increment();
        return None;
    }

    // 5. Released on every path below, including a panicking query.
    let _speculative = SpeculativeCount(cached);
    if proxy.is_disconnected() {
        return None;
    }

    // 4. The query takes its own count for the returned reference.
    query(cached, iid)
}

/// Releases the resolver's speculative count on scope exit.
struct SpeculativeCount(NonNull<ObjectHeader>);

impl Drop for SpeculativeCount {
    fn drop(&mut self) {
        // SAFETY: constructed only after a validated increment on this object.
        unsafe { release_own(self.0) };
    }
}

/// Owned access to an object whose strong count reached zero.
///
/// The finalizer holds the re-armed count. Dropping it (or calling
/// [`destroy`](Self::destroy)) drops the value and frees the block. It can
/// be moved to another thread to destroy the object there, or turned back
/// into a [`StrongHandle`] once with [`resurrect`](Self::resurrect).
pub struct Finalizer<T: Managed> {
    block: NonNull<ManagedBox<T>>,
    _marker: PhantomData<T>,
}

// SAFETY: `Managed` requires `Send + Sync`, and the finalizer is the only
// owner of the object while it is finalizing.
unsafe impl<T: Managed> Send for Finalizer<T> {}
unsafe impl<T: Managed> Sync for Finalizer<T> {}

impl<T: Managed> Finalizer<T> {
    unsafe fn from_block(block: NonNull<ManagedBox<T>>) -> Self {
        Finalizer {
            block,
            _marker: PhantomData,
        }
    }

    fn header(&self) -> &ObjectHeader {
        // SAFETY: the finalizer keeps the block allocated.
        unsafe { ManagedBox::header(self.block).as_ref() }
    }

    /// The value being finalized.
    pub fn get(&self) -> &T {
        // SAFETY: the value is dropped only when the finalizer is consumed.
        unsafe { ManagedBox::value(self.block) }
    }

    /// Whether the object was resurrected before. A resurrected object
    /// cannot be resurrected again.
    pub fn was_resurrected(&self) -> bool {
        self.header().was_resurrected()
    }

    /// Whether this object is an aggregated inner object.
    pub fn is_aggregated(&self) -> bool {
        self.header().is_aggregated()
    }

    /// A weak reference requested during finalization.
    ///
    /// It does not resolve unless the object is resurrected. For an
    /// aggregated inner object the proxy is attached to the inner object
    /// itself, since its outer may already be destroyed.
    pub fn get_weak_reference(&self) -> WeakReference {
        // SAFETY: the finalizer holds the re-armed count.
        unsafe { WeakReference::from_proxy(get_weak_reference_own(ManagedBox::header(self.block))) }
    }

    /// Drop the value and free the object.
    pub fn destroy(self) {
        let this = ManuallyDrop::new(self);
        // SAFETY: the finalizer is consumed, so this runs once.
        unsafe { destroy(this.block) };
    }

    /// Return the object to `Live`, adopting the re-armed count.
    ///
    /// Fails, handing the finalizer back, if the object was already
    /// resurrected once or is an aggregated inner object (whose count is not
    /// the public one).
    pub fn resurrect(self) -> Result<StrongHandle<T>, Self> {
        let h = self.header();
        if h.was_resurrected() || h.is_aggregated() {
            return Err(self);
        }

        h.lifecycle.store(LIVE | RESURRECTED, Ordering::Release);
        let header = ManagedBox::header(self.block);
        if let SlotState::Proxy(proxy) = h.slot.load().decode() {
            // SAFETY: the object owns one proxy reference while not destroyed.
            unsafe { proxy.as_ref().reconnect(header) };
        }

        stats::record(Event::Resurrection);
        if log::would_log(LogLevel::Debug) {
            LogBuilder::new(LogLevel::Debug)
                .target("lifeline::object")
                .message("object resurrected")
                .field_str("type", h.type_name())
                .field_hex("object", header.as_ptr() as usize)
                .emit();
        }

        let this = ManuallyDrop::new(self);
        // SAFETY: the re-armed count moves into the handle.
        Ok(unsafe { StrongHandle::from_block(this.block) })
    }
}

impl<T: Managed> Drop for Finalizer<T> {
    fn drop(&mut self) {
        // SAFETY: drop runs once and the finalizer owns the object.
        unsafe { destroy(self.block) };
    }
}

impl<T: Managed> fmt::Debug for Finalizer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Finalizer")
            .field("type", &self.header().type_name())
            .field("object", &self.block)
            .field("resurrected", &self.was_resurrected())
            .finish()
    }
}

unsafe fn destroy<T: Managed>(block: NonNull<ManagedBox<T>>) {
    let header = ManagedBox::header(block);
    let h = header.as_ref();
    debug_assert_eq!(h.lifecycle(), Lifecycle::Finalizing);

    let flags = h.lifecycle.load(Ordering::Acquire) & RESURRECTED;
    h.lifecycle.store(DESTROYED | flags, Ordering::Release);

    if let SlotState::Proxy(proxy) = h.slot.load().decode() {
        proxy.as_ref().retire_source();
        WeakReferenceProxy::release(proxy);
    }

    if log::would_log(LogLevel::Trace) {
        LogBuilder::new(LogLevel::Trace)
            .target("lifeline::object")
            .message("object destroyed")
            .field_str("type", h.type_name())
            .field_hex("object", header.as_ptr() as usize)
            .emit();
    }

    ManuallyDrop::drop(&mut (*block.as_ptr()).value);
    ptr::drop_in_place(header.as_ptr());
    stats::poison(block.as_ptr() as *mut u8, mem::size_of::<ManagedBox<T>>());
    alloc::dealloc(block.as_ptr() as *mut u8, Layout::new::<ManagedBox<T>>());
    stats::record(Event::ObjectDestroyed);
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::fail_fast::{self, catch_fail_fast, FailFastMode};
    use std::sync::atomic::{AtomicUsize, Ordering as StdOrdering};
    use std::sync::{Arc, Mutex};

    struct Tracked {
        drops: Arc<AtomicUsize>,
    }

    impl Managed for Tracked {}

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, StdOrdering::SeqCst);
        }
    }

    fn tracked() -> (StrongHandle<Tracked>, Arc<AtomicUsize>) {
        let drops = Arc::new(AtomicUsize::new(0));
        let handle = StrongHandle::new(Tracked {
            drops: Arc::clone(&drops),
        });
        (handle, drops)
    }

    #[test]
    fn test_add_ref_release_counts() {
        let (handle, drops) = tracked();
        assert_eq!(StrongHandle::add_ref(&handle), 2);
        assert_eq!(unsafe { StrongHandle::release(&handle) }, 1);
        drop(handle);
        assert_eq!(drops.load(StdOrdering::SeqCst), 1);
    }

    #[test]
    fn test_final_release_in_proxy_mode() {
        let (handle, drops) = tracked();
        let weak = StrongHandle::downgrade(&handle);
        assert_eq!(StrongHandle::slot_mode(&handle), SlotMode::ProxyEncoded);
        assert_eq!(StrongHandle::add_ref(&handle), 2);
        assert_eq!(unsafe { StrongHandle::release(&handle) }, 1);

        drop(handle);
        assert_eq!(drops.load(StdOrdering::SeqCst), 1);
        assert!(weak.resolve().is_none());
        assert_eq!(weak.as_weak_reference().source_ref_count(), 0);
    }

    #[test]
    fn test_vtable_identity() {
        let (handle, _drops) = tracked();
        let header = StrongHandle::header(&handle);
        let h = unsafe { header.as_ref() };
        assert_eq!(h.type_id(), TypeId::of::<Tracked>());
        assert!(h.type_name().ends_with("Tracked"));
        assert_eq!(h.lifecycle(), Lifecycle::Live);
        assert!(!h.is_aggregated());
    }

    #[test]
    fn test_value_ptr_roundtrip() {
        let block = ManagedBox::allocate(
            Tracked {
                drops: Arc::new(AtomicUsize::new(0)),
            },
            None,
        );
        let value = ManagedBox::value_ptr(block);
        assert_eq!(unsafe { ManagedBox::<Tracked>::from_value_ptr(value) }, block);
        drop(unsafe { StrongHandle::from_block(block) });
    }

    struct Deferred {
        parked: Arc<Mutex<Option<Finalizer<Deferred>>>>,
    }

    impl Managed for Deferred {
        fn on_final_release(finalizer: Finalizer<Self>) {
            let parked = Arc::clone(&finalizer.get().parked);
            *parked.lock().unwrap() = Some(finalizer);
        }
    }

    #[test]
    fn test_deferred_destruction_and_resurrection() {
        let parked = Arc::new(Mutex::new(None));
        let handle = StrongHandle::new(Deferred {
            parked: Arc::clone(&parked),
        });
        let weak = StrongHandle::downgrade(&handle);
        drop(handle);

        let finalizer = parked.lock().unwrap().take().unwrap();
        assert!(!finalizer.was_resurrected());
        // Finalizing: weak references do not resolve.
        assert!(weak.resolve().is_none());
        assert!(!finalizer.get_weak_reference().is_alive());

        let revived = finalizer.resurrect().ok().unwrap();
        assert_eq!(StrongHandle::strong_count(&revived), 1);
        assert_eq!(StrongHandle::lifecycle(&revived), Lifecycle::Live);
        assert!(StrongHandle::was_resurrected(&revived));
        assert!(weak.resolve().is_some());

        // Second final release: resurrection is refused.
        drop(revived);
        let finalizer = parked.lock().unwrap().take().unwrap();
        assert!(finalizer.was_resurrected());
        let finalizer = finalizer.resurrect().err().unwrap();
        finalizer.destroy();
        assert!(weak.resolve().is_none());
    }

    #[test]
    fn test_weak_reference_requested_during_final_release() {
        let parked = Arc::new(Mutex::new(None));
        let handle = StrongHandle::new(Deferred {
            parked: Arc::clone(&parked),
        });
        drop(handle);

        // Inline mode until now: the proxy is installed while finalizing.
        let finalizer = parked.lock().unwrap().take().unwrap();
        let weak = finalizer.get_weak_reference();
        assert!(weak.resolve().is_none());

        let revived = finalizer.resurrect().ok().unwrap();
        let resolved = weak.resolve().expect("resurrected object resolves");
        assert!(resolved.ptr_eq(&StrongHandle::as_unknown(&revived)));
        drop(resolved);
        drop(revived);
        parked.lock().unwrap().take().unwrap().destroy();
    }

    #[test]
    fn test_release_after_final_release_fails_fast() {
        fail_fast::set_mode(FailFastMode::Panic);

        let parked = Arc::new(Mutex::new(None));
        let handle = StrongHandle::new(Deferred {
            parked: Arc::clone(&parked),
        });
        let ghost = ManuallyDrop::new(unsafe { StrongHandle::from_raw(StrongHandle::as_ptr(&handle)) });
        drop(handle);

        // The finalizer holds the re-armed count; an unpaired release drops
        // it to zero while finalizing.
        let result = catch_fail_fast(std::panic::AssertUnwindSafe(|| unsafe {
            StrongHandle::release(&ghost)
        }));
        let info = result.unwrap_err();
        assert!(matches!(
            info.reason(),
            FailFastReason::ReleaseAfterFinal { type_name } if type_name.ends_with("Deferred")
        ));

        let finalizer = parked.lock().unwrap().take().unwrap();
        finalizer.destroy();
    }
}
