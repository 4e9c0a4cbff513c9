//! Persistent state snapshots
//!
//! A [`State`] maps every live object to its non-default property values.
//! Snapshots are values: `set` and `merge` return new states and share all
//! untouched structure with the original.

use std::fmt;
use std::hash::{Hash, Hasher};

use im::OrdMap;
use ripple_core::UniverseId;

use crate::Datum;

/// Key of a top-level entry in a state
pub trait ObjectKey: Clone + Ord + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> ObjectKey for T where T: Clone + Ord + Hash + fmt::Debug + Send + Sync + 'static {}

/// Property descriptor as seen by the store
pub trait Property: Clone + Ord + Hash + fmt::Debug + Send + Sync + 'static {
    /// Value reported for absent entries; never stored
    fn default_value(&self) -> &Datum;

    /// Domain merge for mergeable value types.
    ///
    /// Returns `None` when the type has no merge function, in which case
    /// diverging branches are reported as a conflict.
    fn merge_values(&self, _base: &Datum, _branches: &[&Datum]) -> Option<Datum> {
        None
    }
}

/// Property values of one object
pub type Props<P> = OrdMap<P, Datum>;

/// Immutable snapshot of the whole model
pub struct State<O: ObjectKey, P: Property> {
    universe: UniverseId,
    pub(crate) objects: OrdMap<O, Props<P>>,
}

impl<O: ObjectKey, P: Property> Clone for State<O, P> {
    fn clone(&self) -> Self {
        State {
            universe: self.universe,
            objects: self.objects.clone(),
        }
    }
}

impl<O: ObjectKey, P: Property> State<O, P> {
    /// Empty state of a universe
    pub fn new(universe: UniverseId) -> Self {
        State {
            universe,
            objects: OrdMap::new(),
        }
    }

    pub fn universe(&self) -> UniverseId {
        self.universe
    }

    /// Number of objects with at least one non-default property
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Read a property, falling back to its default
    pub fn get(&self, object: &O, property: &P) -> Datum {
        self.objects
            .get(object)
            .and_then(|props| props.get(property))
            .cloned()
            .unwrap_or_else(|| property.default_value().clone())
    }

    /// Read two properties of the same object at once
    pub fn get_pair(&self, object: &O, a: &P, b: &P) -> (Datum, Datum) {
        match self.objects.get(object) {
            Some(props) => (
                props
                    .get(a)
                    .cloned()
                    .unwrap_or_else(|| a.default_value().clone()),
                props
                    .get(b)
                    .cloned()
                    .unwrap_or_else(|| b.default_value().clone()),
            ),
            None => (a.default_value().clone(), b.default_value().clone()),
        }
    }

    /// Whether a non-default value is stored
    pub fn contains(&self, object: &O, property: &P) -> bool {
        self.objects
            .get(object)
            .map_or(false, |props| props.contains_key(property))
    }

    /// Stored properties of an object (empty when none)
    pub fn properties(&self, object: &O) -> Props<P> {
        self.objects.get(object).cloned().unwrap_or_default()
    }

    pub fn properties_ref(&self, object: &O) -> Option<&Props<P>> {
        self.objects.get(object)
    }

    /// The stored key equal to `object`, if any
    pub fn canonical(&self, object: &O) -> Option<&O> {
        self.objects.get_key_value(object).map(|(key, _)| key)
    }

    /// Iterate over objects in key order
    pub fn objects(&self) -> impl Iterator<Item = &O> {
        self.objects.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&O, &Props<P>)> {
        self.objects.iter()
    }

    /// Copy-on-write write. Returns an identical snapshot when nothing
    /// changes; writing the default removes the entry.
    pub fn set(&self, object: &O, property: &P, value: Datum) -> Self {
        let current = self.objects.get(object);
        let is_default = value == *property.default_value();
        match current.and_then(|props| props.get(property)) {
            Some(old) if *old == value => return self.clone(),
            None if is_default => return self.clone(),
            _ => {}
        }
        let mut props = current.cloned().unwrap_or_default();
        if is_default {
            props.remove(property);
        } else {
            props.insert(property.clone(), value);
        }
        self.with_props(object, props)
    }

    /// Replace all properties of an object
    pub fn with_props(&self, object: &O, props: Props<P>) -> Self {
        let mut objects = self.objects.clone();
        if props.is_empty() {
            objects.remove(object);
        } else {
            objects.insert(object.clone(), props);
        }
        State {
            universe: self.universe,
            objects,
        }
    }

    /// Drop every property of an object
    pub fn clear(&self, object: &O) -> Self {
        if !self.objects.contains_key(object) {
            return self.clone();
        }
        self.with_props(object, Props::new())
    }
}

impl<O: ObjectKey, P: Property> PartialEq for State<O, P> {
    fn eq(&self, other: &Self) -> bool {
        self.universe == other.universe && self.objects == other.objects
    }
}

impl<O: ObjectKey, P: Property> Eq for State<O, P> {}

impl<O: ObjectKey, P: Property> Hash for State<O, P> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.universe.hash(state);
        self.objects.hash(state);
    }
}

impl<O: ObjectKey, P: Property> fmt::Debug for State<O, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "State[{}] ", self.universe)?;
        let mut map = f.debug_map();
        for (object, props) in self.objects.iter() {
            map.entry(object, props);
        }
        map.finish()
    }
}
