//! Property value capabilities
//!
//! Every property value implements [`Value`]. Besides the storage bounds it
//! exposes the structural hooks the engine needs without knowing the
//! concrete type: which mutables a value references (containment, opposites,
//! orphan checks), element edits on collections of mutables (ripple-out,
//! newable matching), emptiness (mandatory checks) and an optional domain
//! merge for mergeable types.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use im::{OrdMap, OrdSet, Vector};

use crate::Mutable;

/// A storable property value
pub trait Value: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Mutables referenced by this value
    fn mutables(&self) -> Vec<Mutable> {
        Vec::new()
    }

    /// Lift a mutable into an element of this type
    fn from_mutable(_mutable: &Mutable) -> Option<Self> {
        None
    }

    /// Value with `mutable` added; `None` when the type cannot hold it
    fn insert_mutable(&self, _mutable: &Mutable) -> Option<Self> {
        None
    }

    /// Value with `mutable` removed; `None` when the type cannot drop it
    fn remove_mutable(&self, _mutable: &Mutable) -> Option<Self> {
        None
    }

    /// Value with `old` substituted by `new`
    fn replace_mutable(&self, old: &Mutable, new: &Mutable) -> Option<Self> {
        self.remove_mutable(old)?.insert_mutable(new)
    }

    /// Empty for the purpose of mandatory checks
    fn is_empty_value(&self) -> bool {
        false
    }

    /// Whether the type holds many elements
    fn is_collection() -> bool {
        false
    }

    /// The empty value of a collection type
    fn empty() -> Option<Self> {
        None
    }

    /// Three-way+ domain merge. `None` means not mergeable.
    fn merge(_base: &Self, _branches: &[&Self]) -> Option<Self> {
        None
    }
}

macro_rules! plain_value {
    ($($t:ty),* $(,)?) => {
        $(impl Value for $t {})*
    };
}

plain_value!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, bool, char, ());

impl Value for String {
    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl Value for Arc<str> {
    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl Value for &'static str {
    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl<T: Value> Value for Arc<T> {
    fn mutables(&self) -> Vec<Mutable> {
        (**self).mutables()
    }

    fn is_empty_value(&self) -> bool {
        (**self).is_empty_value()
    }
}

impl<A: Value, B: Value> Value for (A, B) {
    fn mutables(&self) -> Vec<Mutable> {
        let mut all = self.0.mutables();
        all.extend(self.1.mutables());
        all
    }
}

impl Value for Mutable {
    fn mutables(&self) -> Vec<Mutable> {
        vec![self.clone()]
    }

    fn from_mutable(mutable: &Mutable) -> Option<Self> {
        Some(mutable.clone())
    }

    fn insert_mutable(&self, mutable: &Mutable) -> Option<Self> {
        Some(mutable.clone())
    }

    fn replace_mutable(&self, old: &Mutable, new: &Mutable) -> Option<Self> {
        Some(if self == old { new.clone() } else { self.clone() })
    }
}

impl<T: Value> Value for Option<T> {
    fn mutables(&self) -> Vec<Mutable> {
        self.as_ref().map(Value::mutables).unwrap_or_default()
    }

    fn from_mutable(mutable: &Mutable) -> Option<Self> {
        T::from_mutable(mutable).map(Some)
    }

    fn insert_mutable(&self, mutable: &Mutable) -> Option<Self> {
        T::from_mutable(mutable).map(Some)
    }

    fn remove_mutable(&self, mutable: &Mutable) -> Option<Self> {
        match self {
            Some(v) if v.mutables().contains(mutable) => Some(None),
            _ => Some(self.clone()),
        }
    }

    fn replace_mutable(&self, old: &Mutable, new: &Mutable) -> Option<Self> {
        match self {
            Some(v) if v.mutables().contains(old) => T::from_mutable(new).map(Some),
            _ => Some(self.clone()),
        }
    }

    fn is_empty_value(&self) -> bool {
        self.is_none()
    }

    fn empty() -> Option<Self> {
        Some(None)
    }
}

impl<T: Value + Ord> Value for OrdSet<T> {
    fn mutables(&self) -> Vec<Mutable> {
        self.iter().flat_map(Value::mutables).collect()
    }

    fn insert_mutable(&self, mutable: &Mutable) -> Option<Self> {
        T::from_mutable(mutable).map(|e| self.update(e))
    }

    fn remove_mutable(&self, mutable: &Mutable) -> Option<Self> {
        Some(
            self.iter()
                .filter(|e| !e.mutables().contains(mutable))
                .cloned()
                .collect(),
        )
    }

    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }

    fn is_collection() -> bool {
        true
    }

    fn empty() -> Option<Self> {
        Some(OrdSet::new())
    }

    /// Additions of every branch win over removals of none; removals of any
    /// branch apply to elements no other branch added.
    fn merge(base: &Self, branches: &[&Self]) -> Option<Self> {
        let mut result = base.clone();
        for branch in branches {
            for removed in base.iter().filter(|e| !branch.contains(e)) {
                result.remove(removed);
            }
        }
        for branch in branches {
            for added in branch.iter().filter(|e| !base.contains(e)) {
                result.insert(added.clone());
            }
        }
        Some(result)
    }
}

impl<K: Value + Ord, V: Value> Value for OrdMap<K, V> {
    fn mutables(&self) -> Vec<Mutable> {
        self.iter()
            .flat_map(|(k, v)| {
                let mut all = k.mutables();
                all.extend(v.mutables());
                all
            })
            .collect()
    }

    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }

    fn is_collection() -> bool {
        true
    }

    fn empty() -> Option<Self> {
        Some(OrdMap::new())
    }

    /// Per-key merge; diverging values fall back to the value type's merge.
    fn merge(base: &Self, branches: &[&Self]) -> Option<Self> {
        let mut keys: OrdSet<K> = base.keys().cloned().collect();
        for branch in branches {
            keys.extend(branch.keys().cloned());
        }
        let mut result = OrdMap::new();
        for key in keys {
            let base_value = base.get(&key);
            let mut distinct: Vec<Option<&V>> = Vec::new();
            for branch in branches {
                let value = branch.get(&key);
                if value != base_value && !distinct.contains(&value) {
                    distinct.push(value);
                }
            }
            let merged = match distinct.as_slice() {
                [] => base_value.cloned(),
                [one] => one.cloned(),
                _ => {
                    let start = base_value.cloned().or_else(V::empty)?;
                    let values: Vec<V> = branches
                        .iter()
                        .map(|b| b.get(&key).cloned().or_else(V::empty))
                        .collect::<Option<_>>()?;
                    let refs: Vec<&V> = values.iter().collect();
                    Some(V::merge(&start, &refs)?)
                }
            };
            if let Some(value) = merged {
                if !V::empty().map_or(false, |e| e == value) {
                    result.insert(key, value);
                }
            }
        }
        Some(result)
    }
}

impl<T: Value> Value for Vector<T> {
    fn mutables(&self) -> Vec<Mutable> {
        self.iter().flat_map(Value::mutables).collect()
    }

    fn insert_mutable(&self, mutable: &Mutable) -> Option<Self> {
        let element = T::from_mutable(mutable)?;
        let mut result = self.clone();
        result.push_back(element);
        Some(result)
    }

    fn remove_mutable(&self, mutable: &Mutable) -> Option<Self> {
        Some(
            self.iter()
                .filter(|e| !e.mutables().contains(mutable))
                .cloned()
                .collect(),
        )
    }

    fn replace_mutable(&self, old: &Mutable, new: &Mutable) -> Option<Self> {
        let element = T::from_mutable(new)?;
        Some(
            self.iter()
                .map(|e| {
                    if e.mutables().contains(old) {
                        element.clone()
                    } else {
                        e.clone()
                    }
                })
                .collect(),
        )
    }

    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }

    fn is_collection() -> bool {
        true
    }

    fn empty() -> Option<Self> {
        Some(Vector::new())
    }
}

#[cfg(test)]
mod tests {
    use im::{ordmap, ordset};
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_set_merge_unions_additions_and_applies_removals() {
        let base: OrdSet<i64> = ordset![1, 2, 3];
        let left: OrdSet<i64> = ordset![1, 2, 3, 4];
        let right: OrdSet<i64> = ordset![2, 3, 5];
        let merged = OrdSet::merge(&base, &[&left, &right]).unwrap();
        assert_eq!(merged, ordset![2, 3, 4, 5]);
    }

    #[test]
    fn test_map_merge_per_key() {
        let base: OrdMap<i64, OrdSet<i64>> = ordmap! {1 => ordset![1]};
        let left = ordmap! {1 => ordset![1, 2]};
        let right = ordmap! {1 => ordset![1, 3], 2 => ordset![9]};
        let merged = OrdMap::merge(&base, &[&left, &right]).unwrap();
        assert_eq!(merged, ordmap! {1 => ordset![1, 2, 3], 2 => ordset![9]});
    }

    #[test]
    fn test_map_merge_of_scalars_conflicts() {
        let base: OrdMap<i64, i64> = ordmap! {1 => 1};
        let left = ordmap! {1 => 2};
        let right = ordmap! {1 => 3};
        assert!(OrdMap::merge(&base, &[&left, &right]).is_none());
    }

    #[test]
    fn test_option_emptiness() {
        assert!(None::<i64>.is_empty_value());
        assert!(!Some(1i64).is_empty_value());
        assert!(String::new().is_empty_value());
        assert!(!5i64.is_empty_value());
    }

    proptest! {
        #[test]
        fn prop_set_merge_ignores_branch_order(
            base in proptest::collection::btree_set(0i64..32, 0..16),
            left in proptest::collection::btree_set(0i64..32, 0..16),
            right in proptest::collection::btree_set(0i64..32, 0..16),
        ) {
            let base: OrdSet<i64> = base.into_iter().collect();
            let left: OrdSet<i64> = left.into_iter().collect();
            let right: OrdSet<i64> = right.into_iter().collect();
            let one = OrdSet::merge(&base, &[&left, &right]);
            let other = OrdSet::merge(&base, &[&right, &left]);
            prop_assert_eq!(one, other);
        }
    }
}
