//! Identity types for the engine
//!
//! All identifiers are 64-bit. Allocated ids come from process-wide
//! counters; derived object ids (constructed objects) set the top bit so
//! the two spaces never collide.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_OBJECT: AtomicU64 = AtomicU64::new(1);
static NEXT_SETABLE: AtomicU64 = AtomicU64::new(1);
static NEXT_ACTION: AtomicU64 = AtomicU64::new(1);
static NEXT_UNIVERSE: AtomicU64 = AtomicU64::new(1);

/// Object identity - a node of the mutable tree
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjectId(pub u64);

impl ObjectId {
    pub const ZERO: ObjectId = ObjectId(0);

    /// Bit marking ids derived from a construction key
    pub const DERIVED: u64 = 1 << 63;

    #[inline]
    pub fn new(id: u64) -> Self {
        ObjectId(id)
    }

    /// Allocate a fresh object id
    pub fn next() -> Self {
        ObjectId(NEXT_OBJECT.fetch_add(1, Ordering::Relaxed) & !Self::DERIVED)
    }

    /// Build an id from the leading bytes of a digest
    pub fn derived(digest: [u8; 8]) -> Self {
        ObjectId(u64::from_le_bytes(digest) | Self::DERIVED)
    }

    #[inline]
    pub fn is_derived(self) -> bool {
        self.0 & Self::DERIVED != 0
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object({:016x})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Property descriptor identity
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SetableId(pub u64);

impl SetableId {
    pub fn next() -> Self {
        SetableId(NEXT_SETABLE.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for SetableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Setable({})", self.0)
    }
}

/// Action or observer identity
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ActionId(pub u64);

impl ActionId {
    pub fn next() -> Self {
        ActionId(NEXT_ACTION.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Action({})", self.0)
    }
}

/// Universe identity; every state belongs to exactly one universe
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct UniverseId(pub u64);

impl UniverseId {
    pub fn next() -> Self {
        UniverseId(NEXT_UNIVERSE.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for UniverseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Universe({})", self.0)
    }
}

impl fmt::Display for UniverseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocated_ids_are_unique() {
        let a = ObjectId::next();
        let b = ObjectId::next();
        assert_ne!(a, b);
        assert!(!a.is_derived());
    }

    #[test]
    fn test_derived_ids_do_not_collide_with_allocated() {
        let derived = ObjectId::derived([1, 0, 0, 0, 0, 0, 0, 0]);
        assert!(derived.is_derived());
        assert_ne!(derived, ObjectId::new(1));
    }

    #[test]
    fn test_debug_format() {
        assert_eq!(format!("{:?}", ObjectId::new(255)), "Object(00000000000000ff)");
        assert_eq!(format!("{:?}", ActionId(3)), "Action(3)");
    }
}
