//! Owning handles.
//!
//! - [`StrongHandle<T>`]: a typed strong reference. Clone is AddRef, drop is
//!   Release, both through the public (delegating) path.
//! - [`Unknown`]: an untyped strong reference, as returned by capability
//!   queries.
//! - [`WeakReference`]: an untyped weak reference, one proxy reference.
//! - [`WeakHandle<T>`]: a typed weak reference whose resolve yields a
//!   `StrongHandle<T>`.

use std::any::TypeId;
use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::ptr::NonNull;

use crate::iid::Iid;
use crate::object::{self, Lifecycle, Managed, ManagedBox, ObjectHeader};
use crate::proxy::WeakReferenceProxy;
use crate::slot::SlotMode;

/// A strong reference to a managed `T`.
pub struct StrongHandle<T: Managed> {
    block: NonNull<ManagedBox<T>>,
    _marker: PhantomData<ManagedBox<T>>,
}

// SAFETY: `Managed` requires `Send + Sync` and all count updates are atomic.
unsafe impl<T: Managed> Send for StrongHandle<T> {}
unsafe impl<T: Managed> Sync for StrongHandle<T> {}

impl<T: Managed> StrongHandle<T> {
    /// Allocate a new object with a strong count of 1.
    pub fn new(value: T) -> Self {
        // SAFETY: a fresh block carries exactly the count this handle owns.
        unsafe { Self::from_block(ManagedBox::allocate(value, None)) }
    }

    /// # Safety
    ///
    /// The caller transfers one public count on `block` to the handle.
    pub(crate) unsafe fn from_block(block: NonNull<ManagedBox<T>>) -> Self {
        StrongHandle {
            block,
            _marker: PhantomData,
        }
    }

    pub(crate) fn header(this: &Self) -> NonNull<ObjectHeader> {
        ManagedBox::header(this.block)
    }

    /// Raw AddRef. Returns the new strong count.
    ///
    /// The added count must eventually be given back with
    /// [`release`](Self::release).
    pub fn add_ref(this: &Self) -> usize {
        // SAFETY: the handle holds a count.
        unsafe { object::add_ref(Self::header(this)) }
    }

    /// Raw Release. Returns the new strong count.
    ///
    /// # Safety
    ///
    /// The caller must give back a count previously taken with
    /// [`add_ref`](Self::add_ref) or [`into_raw`](Self::into_raw). If this
    /// releases the last count, `this` dangles and must be forgotten.
    pub unsafe fn release(this: &Self) -> usize {
        object::release(Self::header(this))
    }

    /// Current strong count of the object that owns this handle's count:
    /// the controlling outer object when aggregated.
    pub fn strong_count(this: &Self) -> usize {
        // SAFETY: the handle holds a count.
        unsafe { object::strong_count(Self::header(this)) }
    }

    /// Representation of the slot holding this handle's count.
    pub fn slot_mode(this: &Self) -> SlotMode {
        // SAFETY: the handle holds a count, so the controlling object lives.
        unsafe { object::controlling(Self::header(this)).as_ref().slot_mode() }
    }

    /// Lifecycle state. `Live` for any handle obtained through the public
    /// API.
    pub fn lifecycle(this: &Self) -> Lifecycle {
        // SAFETY: the handle holds a count.
        unsafe { Self::header(this).as_ref().lifecycle() }
    }

    /// Whether the object has been resurrected once.
    pub fn was_resurrected(this: &Self) -> bool {
        // SAFETY: the handle holds a count.
        unsafe { Self::header(this).as_ref().was_resurrected() }
    }

    /// Whether the object is aggregated into a controlling outer object.
    pub fn is_aggregated(this: &Self) -> bool {
        // SAFETY: the handle holds a count.
        unsafe { Self::header(this).as_ref().is_aggregated() }
    }

    /// Get a typed weak reference.
    pub fn downgrade(this: &Self) -> WeakHandle<T> {
        WeakHandle {
            weak: Self::get_weak_reference(this),
            _marker: PhantomData,
        }
    }

    /// Get an untyped weak reference to the object's identity.
    ///
    /// The first call installs the weak reference proxy; later calls
    /// return the same proxy.
    pub fn get_weak_reference(this: &Self) -> WeakReference {
        // SAFETY: the handle holds a count; the proxy reference moves into
        // the returned handle.
        unsafe { WeakReference::from_proxy(object::get_weak_reference(Self::header(this))) }
    }

    /// Capability query through the public path.
    pub fn query(this: &Self, iid: Iid) -> Option<Unknown> {
        // SAFETY: the handle holds a count.
        unsafe { object::query(Self::header(this), iid) }
    }

    /// Typed capability query.
    pub fn query_as<U: Managed>(this: &Self) -> Option<StrongHandle<U>> {
        Self::query(this, Iid::of::<U>()).and_then(|unknown| unknown.downcast().ok())
    }

    /// The canonical identity: the controlling outer object when aggregated.
    pub fn identity(this: &Self) -> Unknown {
        // SAFETY: the handle holds a count.
        unsafe { object::identity(Self::header(this)) }
    }

    /// An untyped strong reference to this object.
    pub fn as_unknown(this: &Self) -> Unknown {
        // SAFETY: the handle holds a count.
        unsafe { Unknown::retain(Self::header(this)) }
    }

    /// Convert into an untyped strong reference, keeping the count.
    pub fn into_unknown(this: Self) -> Unknown {
        let this = ManuallyDrop::new(this);
        // SAFETY: the count moves from the handle into the `Unknown`.
        unsafe { Unknown::from_header(Self::header(&this)) }
    }

    /// Make all weak references to this object's identity stop resolving.
    ///
    /// The object stays alive. Weak references requested later are already
    /// disconnected. Resurrection reconnects.
    pub fn disconnect_weak_references(this: &Self) {
        // SAFETY: the handle holds a count.
        unsafe { object::disconnect(Self::header(this)) }
    }

    /// Whether both handles point to the same object.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.block == other.block
    }

    /// Pointer to the value.
    pub fn as_ptr(this: &Self) -> *const T {
        ManagedBox::value_ptr(this.block)
    }

    /// Consume the handle without releasing its count.
    pub fn into_raw(this: Self) -> *const T {
        let this = ManuallyDrop::new(this);
        ManagedBox::value_ptr(this.block)
    }

    /// Rebuild a handle from [`into_raw`](Self::into_raw) or
    /// [`as_ptr`](Self::as_ptr).
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live managed `T`, and the caller transfers one
    /// public count to the returned handle.
    pub unsafe fn from_raw(ptr: *const T) -> Self {
        Self::from_block(ManagedBox::from_value_ptr(ptr))
    }
}

impl<T: Managed> Clone for StrongHandle<T> {
    fn clone(&self) -> Self {
        Self::add_ref(self);
        // SAFETY: the count taken above moves into the new handle.
        unsafe { Self::from_block(self.block) }
    }
}

impl<T: Managed> Drop for StrongHandle<T> {
    fn drop(&mut self) {
        // SAFETY: the handle owns one count and is not used again.
        unsafe { object::release(Self::header(self)) };
    }
}

impl<T: Managed> Deref for StrongHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the value lives while any count is held.
        unsafe { ManagedBox::value(self.block) }
    }
}

impl<T: Managed> AsRef<T> for StrongHandle<T> {
    fn as_ref(&self) -> &T {
        self
    }
}

impl<T: Managed + fmt::Debug> fmt::Debug for StrongHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: Managed> fmt::Pointer for StrongHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&Self::as_ptr(self), f)
    }
}

/// An untyped strong reference.
pub struct Unknown {
    header: NonNull<ObjectHeader>,
}

// SAFETY: every managed type is `Send + Sync`.
unsafe impl Send for Unknown {}
unsafe impl Sync for Unknown {}

impl Unknown {
    /// # Safety
    ///
    /// The caller transfers one public count on `header`.
    pub(crate) unsafe fn from_header(header: NonNull<ObjectHeader>) -> Self {
        Unknown { header }
    }

    /// Take a new public count on `header`.
    ///
    /// # Safety
    ///
    /// The caller must hold a count on `header`.
    pub(crate) unsafe fn retain(header: NonNull<ObjectHeader>) -> Self {
        object::add_ref(header);
        Unknown { header }
    }

    /// The canonical identity.
    pub fn identity(&self) -> Unknown {
        // SAFETY: `self` holds a count.
        unsafe { object::identity(self.header) }
    }

    /// Capability query through the public path.
    pub fn query(&self, iid: Iid) -> Option<Unknown> {
        // SAFETY: `self` holds a count.
        unsafe { object::query(self.header, iid) }
    }

    /// Typed capability query.
    pub fn query_as<T: Managed>(&self) -> Option<StrongHandle<T>> {
        self.query(Iid::of::<T>()).and_then(|unknown| unknown.downcast().ok())
    }

    /// Whether the referenced object's value is a `T`.
    pub fn is<T: Managed>(&self) -> bool {
        // SAFETY: `self` holds a count.
        unsafe { self.header.as_ref().type_id() == TypeId::of::<T>() }
    }

    /// Convert into a typed handle, keeping the count.
    pub fn downcast<T: Managed>(self) -> Result<StrongHandle<T>, Unknown> {
        if !self.is::<T>() {
            return Err(self);
        }
        let this = ManuallyDrop::new(self);
        // SAFETY: the type matches and the count moves into the handle.
        Ok(unsafe { StrongHandle::from_block(this.header.cast()) })
    }

    /// Get a weak reference to the canonical identity.
    pub fn get_weak_reference(&self) -> WeakReference {
        // SAFETY: `self` holds a count.
        unsafe { WeakReference::from_proxy(object::get_weak_reference(self.header)) }
    }

    /// Current strong count of the controlling object.
    pub fn strong_count(&self) -> usize {
        // SAFETY: `self` holds a count.
        unsafe { object::strong_count(self.header) }
    }

    /// Raw AddRef. Returns the new strong count.
    pub fn add_ref(&self) -> usize {
        // SAFETY: `self` holds a count.
        unsafe { object::add_ref(self.header) }
    }

    /// Raw Release. Returns the new strong count.
    ///
    /// # Safety
    ///
    /// Same contract as [`StrongHandle::release`].
    pub unsafe fn release(&self) -> usize {
        object::release(self.header)
    }

    /// Type name of the referenced value.
    pub fn type_name(&self) -> &'static str {
        // SAFETY: `self` holds a count.
        unsafe { self.header.as_ref().type_name() }
    }

    /// Whether both reference the same object (not the same identity).
    pub fn ptr_eq(&self, other: &Unknown) -> bool {
        self.header == other.header
    }

    /// Whether both share one canonical identity.
    pub fn same_identity(&self, other: &Unknown) -> bool {
        object::controlling(self.header) == object::controlling(other.header)
    }
}

impl Clone for Unknown {
    fn clone(&self) -> Self {
        // SAFETY: `self` holds a count.
        unsafe { Unknown::retain(self.header) }
    }
}

impl Drop for Unknown {
    fn drop(&mut self) {
        // SAFETY: `self` owns one count and is not used again.
        unsafe { object::release(self.header) };
    }
}

impl fmt::Debug for Unknown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unknown")
            .field("type", &self.type_name())
            .field("object", &self.header)
            .finish()
    }
}

/// An untyped weak reference.
///
/// Holds one reference on the object's proxy, never on the object.
pub struct WeakReference {
    proxy: NonNull<WeakReferenceProxy>,
}

// SAFETY: the proxy is fully atomic and resolution yields `Send + Sync`
// references.
unsafe impl Send for WeakReference {}
unsafe impl Sync for WeakReference {}

impl WeakReference {
    /// # Safety
    ///
    /// The caller transfers one proxy reference.
    pub(crate) unsafe fn from_proxy(proxy: NonNull<WeakReferenceProxy>) -> Self {
        WeakReference { proxy }
    }

    fn proxy(&self) -> &WeakReferenceProxy {
        // SAFETY: the handle holds a proxy reference.
        unsafe { self.proxy.as_ref() }
    }

    /// Resolve to the object's identity.
    pub fn resolve(&self) -> Option<Unknown> {
        self.resolve_query(Iid::identity())
    }

    /// Resolve and query for `iid` in one step.
    ///
    /// `None` means the object is finalizing, destroyed or disconnected, or
    /// does not answer `iid`. A `None` is final for this call; an object
    /// resurrected afterwards resolves on the next call.
    pub fn resolve_query(&self, iid: Iid) -> Option<Unknown> {
        // SAFETY: the handle holds a proxy reference.
        unsafe { object::resolve(self.proxy(), iid) }
    }

    /// Resolve to a typed handle.
    pub fn resolve_as<T: Managed>(&self) -> Option<StrongHandle<T>> {
        self.resolve_query(Iid::of::<T>())
            .and_then(|unknown| unknown.downcast().ok())
    }

    /// Whether the object currently looks resolvable. Racy; a diagnostic
    /// hint, not a guarantee for a following resolve.
    pub fn is_alive(&self) -> bool {
        let proxy = self.proxy();
        !proxy.source().is_null() && !proxy.is_disconnected() && proxy.source_count() > 0
    }

    /// References on the proxy, including the object's own.
    pub fn proxy_ref_count(&self) -> usize {
        self.proxy().proxy_count()
    }

    /// Strong count as held by the proxy.
    pub fn source_ref_count(&self) -> usize {
        self.proxy().source_count()
    }

    /// Whether both share one proxy.
    pub fn ptr_eq(&self, other: &WeakReference) -> bool {
        self.proxy == other.proxy
    }
}

impl Clone for WeakReference {
    fn clone(&self) -> Self {
        self.proxy().add_ref();
        WeakReference { proxy: self.proxy }
    }
}

impl Drop for WeakReference {
    fn drop(&mut self) {
        // SAFETY: the handle owns one proxy reference and is not used again.
        unsafe { WeakReferenceProxy::release(self.proxy) };
    }
}

impl fmt::Debug for WeakReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WeakReference").field(self.proxy()).finish()
    }
}

/// A typed weak reference.
pub struct WeakHandle<T: Managed> {
    weak: WeakReference,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Managed> WeakHandle<T> {
    /// Resolve to a strong handle, or `None` once the object is gone.
    pub fn resolve(&self) -> Option<StrongHandle<T>> {
        self.weak.resolve_as::<T>()
    }

    /// The untyped weak reference.
    pub fn as_weak_reference(&self) -> &WeakReference {
        &self.weak
    }

    /// Convert into the untyped weak reference.
    pub fn into_weak_reference(self) -> WeakReference {
        self.weak
    }

    /// See [`WeakReference::is_alive`].
    pub fn is_alive(&self) -> bool {
        self.weak.is_alive()
    }

    /// Whether both share one proxy.
    pub fn ptr_eq(&self, other: &WeakHandle<T>) -> bool {
        self.weak.ptr_eq(&other.weak)
    }
}

impl<T: Managed> Clone for WeakHandle<T> {
    fn clone(&self) -> Self {
        WeakHandle {
            weak: self.weak.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Managed> fmt::Debug for WeakHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WeakHandle").field(self.weak.proxy()).finish()
    }
}
