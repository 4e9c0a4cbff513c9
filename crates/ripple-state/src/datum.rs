//! Type-erased property values

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Object-safe view of a storable value
pub trait DynValue: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn dyn_eq(&self, other: &dyn DynValue) -> bool;
    fn dyn_hash(&self, state: &mut dyn Hasher);
}

impl<T> DynValue for T
where
    T: Any + Send + Sync + fmt::Debug + Eq + Hash,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn DynValue) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .map_or(false, |other| self == other)
    }

    fn dyn_hash(&self, mut state: &mut dyn Hasher) {
        TypeId::of::<T>().hash(&mut state);
        self.hash(&mut state);
    }
}

/// Immutable, cheaply cloned property value
#[derive(Clone)]
pub struct Datum(Arc<dyn DynValue>);

impl Datum {
    pub fn new<T>(value: T) -> Self
    where
        T: Any + Send + Sync + fmt::Debug + Eq + Hash,
    {
        Datum(Arc::new(value))
    }

    /// Borrow the value as a concrete type
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        (*self.0).as_any().downcast_ref::<T>()
    }

    pub fn is<T: Any>(&self) -> bool {
        (*self.0).as_any().is::<T>()
    }

    /// Identity comparison, cheaper than equality
    #[inline]
    pub fn ptr_eq(&self, other: &Datum) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Debug rendering used in diagnostics
    pub fn describe(&self) -> String {
        format!("{:?}", self.0)
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.0.dyn_eq(&*other.0)
    }
}

impl Eq for Datum {}

impl Hash for Datum {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.dyn_hash(state);
    }
}

impl fmt::Debug for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_equality() {
        assert_eq!(Datum::new(42i64), Datum::new(42i64));
        assert_ne!(Datum::new(42i64), Datum::new(43i64));
        // Same bits, different type
        assert_ne!(Datum::new(42i64), Datum::new(42u64));
    }

    #[test]
    fn test_downcast() {
        let d = Datum::new(String::from("x"));
        assert_eq!(d.downcast_ref::<String>().map(String::as_str), Some("x"));
        assert!(d.downcast_ref::<i64>().is_none());
        assert!(d.is::<String>());
    }

    #[test]
    fn test_hash_follows_equality() {
        use std::collections::hash_map::DefaultHasher;

        let hash = |d: &Datum| {
            let mut h = DefaultHasher::new();
            d.hash(&mut h);
            h.finish()
        };
        assert_eq!(hash(&Datum::new(7u8)), hash(&Datum::new(7u8)));
    }
}
