//! Capability tokens for queries.
//!
//! An [`Iid`] names a capability an object may answer. Tokens are derived
//! from Rust types: the managed value's own type, or a marker type such as
//! [`Identity`] or [`WeakReferenceSource`] for capabilities every object
//! answers.

use std::any::{self, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Marker for the base identity capability.
///
/// Querying it yields the canonical identity of an object: the object itself,
/// or the controlling outer object when aggregated.
pub enum Identity {}

/// Marker for the weak-reference-source capability.
pub enum WeakReferenceSource {}

/// A capability token.
#[derive(Clone, Copy)]
pub struct Iid {
    id: TypeId,
    name: &'static str,
}

impl Iid {
    /// The token for type `T`.
    pub fn of<T: ?Sized + 'static>() -> Self {
        Iid {
            id: TypeId::of::<T>(),
            name: any::type_name::<T>(),
        }
    }

    /// The base identity token.
    pub fn identity() -> Self {
        Self::of::<Identity>()
    }

    /// The weak-reference-source token.
    pub fn weak_reference_source() -> Self {
        Self::of::<WeakReferenceSource>()
    }

    /// Whether this token names type `T`.
    pub fn is<T: ?Sized + 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }

    pub(crate) fn type_id(&self) -> TypeId {
        self.id
    }

    /// Type name the token was created from, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for Iid {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Iid {}

impl Hash for Iid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Iid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Iid({})", self.name)
    }
}

impl fmt::Display for Iid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}
