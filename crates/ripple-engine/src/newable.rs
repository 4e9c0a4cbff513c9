//! Constructions and newables
//!
//! Objects created by observers are keyed by the construction that made
//! them: the triggering object, the observer and a reason. The object id is
//! a digest of that key, so re-deriving the same construction in another
//! run, branch or execution mode yields the same identity.

use std::fmt;
use std::sync::Arc;

use ripple_core::ObjectId;
use sha2::{Digest, Sha256};

use crate::{Mutable, MutableClass, Value};

/// One component of a construction reason
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Key {
    Int(i64),
    Str(Arc<str>),
    Object(ObjectId),
}

impl Key {
    fn digest(&self, hasher: &mut Sha256) {
        match self {
            Key::Int(v) => {
                hasher.update([0u8]);
                hasher.update(v.to_le_bytes());
            }
            Key::Str(s) => {
                hasher.update([1u8]);
                hasher.update((s.len() as u64).to_le_bytes());
                hasher.update(s.as_bytes());
            }
            Key::Object(id) => {
                hasher.update([2u8]);
                hasher.update(id.to_bytes());
            }
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(v) => write!(f, "{}", v),
            Key::Str(s) => f.write_str(s),
            Key::Object(id) => write!(f, "{}", id),
        }
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::Int(v)
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key::Str(v.into())
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Key::Str(v.into())
    }
}

impl From<ObjectId> for Key {
    fn from(v: ObjectId) -> Self {
        Key::Object(v)
    }
}

impl From<&Mutable> for Key {
    fn from(v: &Mutable) -> Self {
        Key::Object(v.id())
    }
}

impl Value for Key {}

/// Context that distinguishes constructions of one observer on one object
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct Reason(pub Vec<Key>);

impl Reason {
    pub fn new<K: Into<Key>>(parts: impl IntoIterator<Item = K>) -> Self {
        Reason(parts.into_iter().map(Into::into).collect())
    }
}

impl From<Key> for Reason {
    fn from(key: Key) -> Self {
        Reason(vec![key])
    }
}

impl From<&str> for Reason {
    fn from(v: &str) -> Self {
        Reason(vec![v.into()])
    }
}

impl From<i64> for Reason {
    fn from(v: i64) -> Self {
        Reason(vec![v.into()])
    }
}

impl From<&Mutable> for Reason {
    fn from(v: &Mutable) -> Self {
        Reason(vec![v.into()])
    }
}

impl Value for Reason {}

/// Provenance of a constructed object
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Construction {
    pub object: Mutable,
    pub feature: Arc<str>,
    pub reason: Reason,
}

impl Construction {
    fn digest(&self, domain: &[u8]) -> [u8; 8] {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        hasher.update(self.object.id().to_bytes());
        hasher.update((self.feature.len() as u64).to_le_bytes());
        hasher.update(self.feature.as_bytes());
        hasher.update((self.reason.0.len() as u64).to_le_bytes());
        for key in &self.reason.0 {
            key.digest(&mut hasher);
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        bytes
    }

    /// Identity of the object made by this construction
    pub fn derive_id(&self) -> ObjectId {
        ObjectId::derived(self.digest(b"ripple/newable"))
    }

    /// Cache slot of this construction under its triggering object
    pub(crate) fn slot(&self) -> u64 {
        u64::from_le_bytes(self.digest(b"ripple/slot")) | ObjectId::DERIVED
    }
}

impl Value for Construction {}

/// Identity data of a constructed object
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct NewableInfo {
    /// Class name; only newables of the same type are matched
    pub newable_type: Arc<str>,
    /// Explicit identity, when the domain has one
    pub identity: Option<Key>,
    /// Pairing order for unidentified newables in collections
    pub sort_key: Key,
    /// Made by an action rather than derived by an observer
    pub direct: bool,
}

/// What to construct
#[derive(Clone, Debug)]
pub struct NewableSpec {
    pub class: Arc<MutableClass>,
    pub name: Arc<str>,
    pub identity: Option<Key>,
    pub sort_key: Option<Key>,
}

impl NewableSpec {
    pub fn new(class: &Arc<MutableClass>, name: impl Into<Arc<str>>) -> Self {
        NewableSpec {
            class: class.clone(),
            name: name.into(),
            identity: None,
            sort_key: None,
        }
    }

    pub fn identity(mut self, identity: impl Into<Key>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn sort_key(mut self, sort_key: impl Into<Key>) -> Self {
        self.sort_key = Some(sort_key.into());
        self
    }

    pub(crate) fn build(self, id: ObjectId, direct: bool) -> Mutable {
        let info = NewableInfo {
            newable_type: self.class.name().into(),
            sort_key: self
                .sort_key
                .or_else(|| self.identity.clone())
                .unwrap_or(Key::Object(id)),
            identity: self.identity,
            direct,
        };
        Mutable::newable(id, &self.class, self.name, info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn construction(reason: Reason) -> Construction {
        let class = MutableClass::plain("Node");
        Construction {
            object: Mutable::with_id(ObjectId(1), &class, "owner"),
            feature: "make".into(),
            reason,
        }
    }

    #[test]
    fn test_derived_id_is_stable() {
        let a = construction(Reason::from("x"));
        let b = construction(Reason::from("x"));
        assert_eq!(a.derive_id(), b.derive_id());
        assert!(a.derive_id().is_derived());
    }

    #[test]
    fn test_derived_id_depends_on_every_part() {
        let base = construction(Reason::new(["x", "y"]));
        assert_ne!(base.derive_id(), construction(Reason::new(["y", "x"])).derive_id());
        assert_ne!(base.derive_id(), construction(Reason::new(["xy"])).derive_id());
        let mut other_feature = base.clone();
        other_feature.feature = "other".into();
        assert_ne!(base.derive_id(), other_feature.derive_id());
        assert_ne!(base.slot(), base.derive_id().0);
    }

    #[test]
    fn test_spec_defaults_sort_key() {
        let class = MutableClass::plain("Item");
        let made = NewableSpec::new(&class, "i").identity("k").build(ObjectId(9), false);
        let info = made.newable_info().cloned();
        assert_eq!(info.as_ref().map(|i| i.sort_key.clone()), Some(Key::from("k")));
        assert_eq!(info.map(|i| i.newable_type), Some(Arc::from("Item")));
    }
}
