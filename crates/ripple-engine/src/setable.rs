//! Typed property descriptors
//!
//! [`Setable<T>`] is the typed handle user code works with; the store only
//! sees the erased [`SetableRef`]. [`Observed<T>`] adds two reverse-index
//! setables per object: observers that read the value (re-run forward when
//! it changes) and observers that write it (re-run backward).
//!
//! Engine bookkeeping (parent links, direction queues, dependency maps) is
//! stored through the same mechanism as plumbing setables, so it branches
//! and merges together with the model.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::{Arc, OnceLock, Weak};

use im::{OrdMap, OrdSet};
use ripple_core::{Direction, EngineResult, SetableId};
use ripple_state::{Datum, Property};

use crate::action::{ActionDef, ObserverIndex};
use crate::newable::Construction;
use crate::transaction::{current, LeafTx};
use crate::{Action, Mutable, Parent, State, Value};

/// Hook run after every change of a setable inside a transaction
pub type ChangedHook =
    Arc<dyn Fn(&mut LeafTx<'_>, &Mutable, &Datum, &Datum) -> EngineResult<()> + Send + Sync>;

/// What the engine does with changes of a setable
pub(crate) enum Role {
    Plain,
    Observed {
        readers: SetableRef,
        writers: SetableRef,
    },
    ObserverIndex {
        observed: Weak<SetableDef>,
    },
    Queue,
    Deps {
        observer: Weak<ActionDef>,
        direction: Direction,
    },
    Constructed {
        observer: Weak<ActionDef>,
    },
}

/// [`Value`] capabilities, monomorphized once per setable
#[derive(Clone, Copy)]
pub(crate) struct ValueOps {
    mutables: fn(&Datum) -> Vec<Mutable>,
    insert: fn(&Datum, &Mutable) -> Option<Datum>,
    remove: fn(&Datum, &Mutable) -> Option<Datum>,
    replace: fn(&Datum, &Mutable, &Mutable) -> Option<Datum>,
    is_empty: fn(&Datum) -> bool,
    merge: fn(&Datum, &[&Datum]) -> Option<Datum>,
    collection: bool,
}

impl ValueOps {
    fn of<T: Value>() -> Self {
        ValueOps {
            mutables: |d| d.downcast_ref::<T>().map(T::mutables).unwrap_or_default(),
            insert: |d, m| d.downcast_ref::<T>()?.insert_mutable(m).map(Datum::new),
            remove: |d, m| d.downcast_ref::<T>()?.remove_mutable(m).map(Datum::new),
            replace: |d, old, new| {
                d.downcast_ref::<T>()?
                    .replace_mutable(old, new)
                    .map(Datum::new)
            },
            is_empty: |d| d.downcast_ref::<T>().map_or(true, T::is_empty_value),
            merge: |base, branches| {
                let base = base.downcast_ref::<T>()?;
                let branches: Vec<&T> = branches
                    .iter()
                    .map(|b| b.downcast_ref::<T>())
                    .collect::<Option<_>>()?;
                T::merge(base, &branches).map(Datum::new)
            },
            collection: T::is_collection(),
        }
    }
}

/// Erased descriptor shared by all typed handles
pub struct SetableDef {
    id: SetableId,
    name: Arc<str>,
    default: Datum,
    mandatory: bool,
    containment: bool,
    check_consistency: bool,
    synthetic: bool,
    plumbing: bool,
    opposite: OnceLock<Weak<SetableDef>>,
    scope: Option<SetableRef>,
    hook: Option<ChangedHook>,
    pub(crate) role: Role,
    ops: ValueOps,
}

/// Property key of the engine's [`State`]. Ordered and hashed by id.
#[derive(Clone)]
pub struct SetableRef(pub(crate) Arc<SetableDef>);

impl SetableRef {
    #[inline]
    pub fn id(&self) -> SetableId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn default_datum(&self) -> &Datum {
        &self.0.default
    }

    pub fn is_mandatory(&self) -> bool {
        self.0.mandatory
    }

    pub fn is_containment(&self) -> bool {
        self.0.containment
    }

    pub fn checks_consistency(&self) -> bool {
        self.0.check_consistency && !self.0.plumbing && !self.0.synthetic
    }

    pub fn is_synthetic(&self) -> bool {
        self.0.synthetic
    }

    pub fn is_plumbing(&self) -> bool {
        self.0.plumbing
    }

    pub fn is_observed(&self) -> bool {
        matches!(self.0.role, Role::Observed { .. })
    }

    pub fn is_collection(&self) -> bool {
        self.0.ops.collection
    }

    pub fn opposite(&self) -> Option<SetableRef> {
        self.0.opposite.get()?.upgrade().map(SetableRef)
    }

    pub fn scope(&self) -> Option<&SetableRef> {
        self.0.scope.as_ref()
    }

    pub(crate) fn hook(&self) -> Option<ChangedHook> {
        self.0.hook.clone()
    }

    pub(crate) fn role(&self) -> &Role {
        &self.0.role
    }

    /// Reverse index holding the observers of this setable in `direction`
    pub(crate) fn observer_index(&self, direction: Direction) -> Option<&SetableRef> {
        match (&self.0.role, direction) {
            (Role::Observed { readers, .. }, Direction::Forward) => Some(readers),
            (Role::Observed { writers, .. }, Direction::Backward) => Some(writers),
            _ => None,
        }
    }

    pub fn mutables_of(&self, value: &Datum) -> Vec<Mutable> {
        (self.0.ops.mutables)(value)
    }

    pub(crate) fn insert_into(&self, value: &Datum, mutable: &Mutable) -> Option<Datum> {
        (self.0.ops.insert)(value, mutable)
    }

    pub(crate) fn remove_from(&self, value: &Datum, mutable: &Mutable) -> Option<Datum> {
        (self.0.ops.remove)(value, mutable)
    }

    pub(crate) fn replace_in(&self, value: &Datum, old: &Mutable, new: &Mutable) -> Option<Datum> {
        (self.0.ops.replace)(value, old, new)
    }

    pub fn is_empty_value(&self, value: &Datum) -> bool {
        (self.0.ops.is_empty)(value)
    }

    /// Whether the value type carries a domain merge
    pub(crate) fn merge_datum(&self, base: &Datum, branches: &[&Datum]) -> Option<Datum> {
        (self.0.ops.merge)(base, branches)
    }
}

impl PartialEq for SetableRef {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for SetableRef {}

impl PartialOrd for SetableRef {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SetableRef {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.id.cmp(&other.0.id)
    }
}

impl Hash for SetableRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for SetableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.name)
    }
}

impl fmt::Display for SetableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.name)
    }
}

impl Property for SetableRef {
    fn default_value(&self) -> &Datum {
        &self.0.default
    }

    fn merge_values(&self, base: &Datum, branches: &[&Datum]) -> Option<Datum> {
        self.merge_datum(base, branches)
    }
}

impl Value for SetableRef {}

impl AsRef<SetableRef> for SetableRef {
    fn as_ref(&self) -> &SetableRef {
        self
    }
}

/// Typed property descriptor
pub struct Setable<T: Value> {
    def: SetableRef,
    default: T,
    _type: PhantomData<fn() -> T>,
}

impl<T: Value> Clone for Setable<T> {
    fn clone(&self) -> Self {
        Setable {
            def: self.def.clone(),
            default: self.default.clone(),
            _type: PhantomData,
        }
    }
}

impl<T: Value> fmt::Debug for Setable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Setable({})", self.def.name())
    }
}

impl<T: Value> Setable<T> {
    /// Plain setable with default modifiers
    pub fn new(name: impl Into<Arc<str>>, default: T) -> Self {
        Self::builder(name, default).build()
    }

    pub fn builder(name: impl Into<Arc<str>>, default: T) -> SetableBuilder<T> {
        SetableBuilder {
            name: name.into(),
            default,
            mandatory: false,
            containment: false,
            check_consistency: true,
            synthetic: false,
            plumbing: false,
            symmetric: false,
            scope: None,
            hook: None,
        }
    }

    pub fn setable_ref(&self) -> &SetableRef {
        &self.def
    }

    pub fn name(&self) -> &str {
        self.def.name()
    }

    pub fn default_value(&self) -> &T {
        &self.default
    }

    pub(crate) fn from_datum(&self, datum: &Datum) -> T {
        datum
            .downcast_ref::<T>()
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    /// Read from a snapshot
    pub fn get(&self, state: &State, object: &Mutable) -> T {
        self.from_datum(&state.get(object, &self.def))
    }

    /// Raw store write, outside any transaction. No observer is triggered.
    pub fn set(&self, state: &State, object: &Mutable, value: T) -> State {
        state.set(object, &self.def, Datum::new(value))
    }

    /// Read from the state of the transaction open on this thread
    pub fn current(&self, object: &Mutable) -> EngineResult<T> {
        current::with_state(|state| self.get(state, object))
    }

    /// Link two reference setables as each other's opposite
    pub fn opposites<U: Value>(a: &Setable<T>, b: &Setable<U>) {
        let linked = a.def.0.opposite.set(Arc::downgrade(&b.def.0)).is_ok()
            && b.def.0.opposite.set(Arc::downgrade(&a.def.0)).is_ok();
        if !linked {
            tracing::warn!(a = a.name(), b = b.name(), "opposite already assigned");
        }
    }
}

impl<T: Value> AsRef<SetableRef> for Setable<T> {
    fn as_ref(&self) -> &SetableRef {
        &self.def
    }
}

/// Setable whose changes trigger dependent observers
pub struct Observed<T: Value>(Setable<T>);

impl<T: Value> Clone for Observed<T> {
    fn clone(&self) -> Self {
        Observed(self.0.clone())
    }
}

impl<T: Value> fmt::Debug for Observed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Observed({})", self.0.name())
    }
}

impl<T: Value> Observed<T> {
    pub fn new(name: impl Into<Arc<str>>, default: T) -> Self {
        Setable::builder(name, default).observed()
    }

    /// Observers depending on this setable of `object`
    pub fn observers(&self, state: &State, object: &Mutable, direction: Direction) -> ObserverIndex {
        self.def
            .observer_index(direction)
            .and_then(|index| state.get(object, index).downcast_ref::<ObserverIndex>().cloned())
            .unwrap_or_default()
    }
}

impl<T: Value> Deref for Observed<T> {
    type Target = Setable<T>;

    fn deref(&self) -> &Setable<T> {
        &self.0
    }
}

impl<T: Value> AsRef<SetableRef> for Observed<T> {
    fn as_ref(&self) -> &SetableRef {
        &self.0.def
    }
}

pub struct SetableBuilder<T: Value> {
    name: Arc<str>,
    default: T,
    mandatory: bool,
    containment: bool,
    check_consistency: bool,
    synthetic: bool,
    plumbing: bool,
    symmetric: bool,
    scope: Option<SetableRef>,
    hook: Option<ChangedHook>,
}

impl<T: Value> SetableBuilder<T> {
    /// Must be non-empty after every top-level action
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    /// Values are children of the owning object
    pub fn containment(mut self) -> Self {
        self.containment = true;
        self
    }

    pub fn no_consistency(mut self) -> Self {
        self.check_consistency = false;
        self
    }

    pub fn synthetic(mut self) -> Self {
        self.synthetic = true;
        self
    }

    pub fn plumbing(mut self) -> Self {
        self.plumbing = true;
        self
    }

    /// The setable is its own opposite
    pub fn symmetric_opposite(mut self) -> Self {
        self.symmetric = true;
        self
    }

    /// Referenced mutables must be contained in `scope` of the same object
    pub fn scope(mut self, scope: &impl AsRef<SetableRef>) -> Self {
        self.scope = Some(scope.as_ref().clone());
        self
    }

    pub fn changed<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut LeafTx<'_>, &Mutable, &Datum, &Datum) -> EngineResult<()> + Send + Sync + 'static,
    {
        self.hook = Some(Arc::new(hook));
        self
    }

    fn into_def(self, role: Role) -> SetableDef {
        SetableDef {
            id: SetableId::next(),
            name: self.name,
            default: Datum::new(self.default),
            mandatory: self.mandatory,
            containment: self.containment,
            check_consistency: self.check_consistency,
            synthetic: self.synthetic,
            plumbing: self.plumbing,
            opposite: OnceLock::new(),
            scope: self.scope,
            hook: self.hook,
            role,
            ops: ValueOps::of::<T>(),
        }
    }

    fn wrap(def: Arc<SetableDef>, symmetric: bool, default: T) -> Setable<T> {
        if symmetric {
            let _ = def.opposite.set(Arc::downgrade(&def));
        }
        Setable {
            def: SetableRef(def),
            default,
            _type: PhantomData,
        }
    }

    pub(crate) fn with_role(self, role: Role) -> Setable<T> {
        let symmetric = self.symmetric;
        let default = self.default.clone();
        Self::wrap(Arc::new(self.into_def(role)), symmetric, default)
    }

    pub fn build(self) -> Setable<T> {
        self.with_role(Role::Plain)
    }

    pub fn observed(self) -> Observed<T> {
        let symmetric = self.symmetric;
        let default = self.default.clone();
        let name = self.name.clone();
        let def = Arc::new_cyclic(|observed: &Weak<SetableDef>| {
            let index = |direction: Direction| {
                let builder = Setable::<ObserverIndex>::builder(
                    format!("{}~{}", name, direction.name()),
                    OrdMap::new(),
                )
                .plumbing();
                SetableRef(Arc::new(builder.into_def(Role::ObserverIndex {
                    observed: observed.clone(),
                })))
            };
            let readers = index(Direction::Forward);
            let writers = index(Direction::Backward);
            self.into_def(Role::Observed { readers, writers })
        });
        Observed(Self::wrap(def, symmetric, default))
    }
}

/// Direction queues of one mutable
pub(crate) struct Queues {
    pub actions: Setable<OrdSet<Action>>,
    pub children: Setable<OrdSet<Mutable>>,
}

pub(crate) fn queues(direction: Direction) -> &'static Queues {
    static QUEUES: OnceLock<[Queues; 3]> = OnceLock::new();
    let all = QUEUES.get_or_init(|| {
        Direction::ALL.map(|direction| Queues {
            actions: Setable::builder(format!("{}Actions", direction.name()), OrdSet::new())
                .plumbing()
                .with_role(Role::Queue),
            children: Setable::builder(format!("{}Children", direction.name()), OrdSet::new())
                .plumbing()
                .with_role(Role::Queue),
        })
    });
    &all[direction.index()]
}

/// Parent link of every mutable
pub(crate) fn parent_setable() -> &'static Observed<Option<Parent>> {
    static PARENT: OnceLock<Observed<Option<Parent>>> = OnceLock::new();
    PARENT.get_or_init(|| Setable::builder("parent", None).plumbing().observed())
}

/// Constructions justifying a newable ("reasons to exist")
pub(crate) fn constructions_setable() -> &'static Observed<OrdSet<Construction>> {
    static CONSTRUCTIONS: OnceLock<Observed<OrdSet<Construction>>> = OnceLock::new();
    CONSTRUCTIONS.get_or_init(|| Setable::builder("constructions", OrdSet::new()).plumbing().observed())
}

/// Set on a newable that was unified with an older equivalent
pub(crate) fn replacing_setable() -> &'static Setable<Option<Mutable>> {
    static REPLACING: OnceLock<Setable<Option<Mutable>>> = OnceLock::new();
    REPLACING.get_or_init(|| Setable::builder("replacing", None).plumbing().build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MutableClass;
    use ripple_core::UniverseId;

    #[test]
    fn test_get_falls_back_to_default() {
        let size = Setable::new("size", 3i64);
        let class = MutableClass::plain("Node");
        let node = Mutable::new(&class, "n");
        let state = State::new(UniverseId(1));
        assert_eq!(size.get(&state, &node), 3);
        let state = size.set(&state, &node, 5);
        assert_eq!(size.get(&state, &node), 5);
        // writing the default removes the entry
        let state = size.set(&state, &node, 3);
        assert!(state.is_empty());
    }

    #[test]
    fn test_observed_has_reverse_indexes() {
        let a: Observed<i64> = Observed::new("a", 0);
        let readers = a.setable_ref().observer_index(Direction::Forward).cloned();
        let writers = a.setable_ref().observer_index(Direction::Backward).cloned();
        assert!(readers.is_some() && writers.is_some());
        assert_ne!(readers, writers);
        assert!(readers.map_or(false, |r| r.is_plumbing()));
        assert!(a.setable_ref().is_observed());
    }

    #[test]
    fn test_opposites_link_both_ways() {
        let left: Setable<Option<Mutable>> = Setable::new("left", None);
        let right: Setable<OrdSet<Mutable>> = Setable::new("right", OrdSet::new());
        Setable::opposites(&left, &right);
        assert_eq!(left.setable_ref().opposite().as_ref(), Some(right.setable_ref()));
        assert_eq!(right.setable_ref().opposite().as_ref(), Some(left.setable_ref()));

        let friends: Setable<OrdSet<Mutable>> = Setable::builder("friends", OrdSet::new())
            .symmetric_opposite()
            .build();
        assert_eq!(friends.setable_ref().opposite().as_ref(), Some(friends.setable_ref()));
    }

    #[test]
    fn test_erased_ops_follow_the_value_type() {
        let children: Setable<OrdSet<Mutable>> =
            Setable::builder("children", OrdSet::new()).containment().build();
        let class = MutableClass::plain("Node");
        let child = Mutable::new(&class, "c");
        let def = children.setable_ref();
        let empty = def.default_datum().clone();
        assert!(def.is_empty_value(&empty));
        assert!(def.is_collection());
        let one = def.insert_into(&empty, &child);
        assert_eq!(one.as_ref().map(|d| def.mutables_of(d)), Some(vec![child.clone()]));
        let none = one.and_then(|d| def.remove_from(&d, &child));
        assert_eq!(none, Some(empty));
    }

    #[test]
    fn test_current_requires_open_transaction() {
        let size = Setable::new("size", 3i64);
        let class = MutableClass::plain("Node");
        let node = Mutable::new(&class, "n");
        assert_eq!(
            size.current(&node),
            Err(ripple_core::EngineError::NoCurrentTransaction)
        );
    }
}
