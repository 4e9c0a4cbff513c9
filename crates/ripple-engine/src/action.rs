//! Actions and observers
//!
//! An [`Action`] is a named body run on one mutable. An [`Observer`] is an
//! action that also owns per-instance bookkeeping setables: the properties
//! it read (forward dependencies), the properties it wrote (backward
//! dependencies), its last failure, the objects it constructed and its
//! change traces.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::{Arc, Weak};

use im::{OrdMap, OrdSet};
use ripple_core::{ActionId, Direction, EngineResult};

use crate::newable::Reason;
use crate::setable::Role;
use crate::stats::ObserverTrace;
use crate::transaction::LeafTx;
use crate::{Mutable, Setable, SetableRef, State, Value};

/// Rule body. Receives the open leaf transaction and the mutable it runs on.
pub type Body = Arc<dyn Fn(&mut LeafTx<'_>, &Mutable) -> EngineResult<()> + Send + Sync>;

/// Observers of one property of one object: observer to instance mutables
pub type ObserverIndex = OrdMap<Action, OrdSet<Mutable>>;

/// Dependencies of one observer instance: object to properties
pub type Deps = OrdMap<Mutable, OrdSet<SetableRef>>;

/// Non-fatal error left behind by an observer run
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ObserverFailure {
    pub message: String,
}

impl Value for ObserverFailure {}

pub(crate) struct ObserverParts {
    /// Indexed by `Direction::index()`: forward reads, backward writes
    pub deps: [Setable<Deps>; 2],
    pub exception: Setable<Option<ObserverFailure>>,
    pub constructed: Setable<OrdMap<Reason, Mutable>>,
    pub traces: Setable<Option<Arc<ObserverTrace>>>,
}

impl ObserverParts {
    pub fn deps(&self, direction: Direction) -> &Setable<Deps> {
        match direction {
            Direction::Backward => &self.deps[1],
            _ => &self.deps[0],
        }
    }
}

pub struct ActionDef {
    id: ActionId,
    name: Arc<str>,
    direction: Direction,
    body: Body,
    pub(crate) observer: Option<ObserverParts>,
}

/// Identity-bearing unit of work. Ordered and hashed by id.
#[derive(Clone)]
pub struct Action(pub(crate) Arc<ActionDef>);

impl Action {
    pub fn new<F>(name: impl Into<Arc<str>>, body: F) -> Self
    where
        F: Fn(&mut LeafTx<'_>, &Mutable) -> EngineResult<()> + Send + Sync + 'static,
    {
        Self::with_direction(name, Direction::Forward, body)
    }

    pub fn with_direction<F>(name: impl Into<Arc<str>>, direction: Direction, body: F) -> Self
    where
        F: Fn(&mut LeafTx<'_>, &Mutable) -> EngineResult<()> + Send + Sync + 'static,
    {
        Action(Arc::new(ActionDef {
            id: ActionId::next(),
            name: name.into(),
            direction,
            body: Arc::new(body),
            observer: None,
        }))
    }

    #[inline]
    pub fn id(&self) -> ActionId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Direction new work of this action is queued in
    pub fn direction(&self) -> Direction {
        self.0.direction
    }

    pub fn is_observer(&self) -> bool {
        self.0.observer.is_some()
    }

    pub fn as_observer(&self) -> Option<Observer> {
        self.is_observer().then(|| Observer(self.clone()))
    }

    pub(crate) fn body(&self) -> Body {
        self.0.body.clone()
    }

    pub(crate) fn parts(&self) -> Option<&ObserverParts> {
        self.0.observer.as_ref()
    }
}

impl PartialEq for Action {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Action {}

impl PartialOrd for Action {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Action {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.id.cmp(&other.0.id)
    }
}

impl Hash for Action {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.name)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.name)
    }
}

impl Value for Action {}

/// Reactive rule: re-runs whenever something it read changes
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Observer(Action);

impl Observer {
    pub fn new<F>(name: impl Into<Arc<str>>, body: F) -> Self
    where
        F: Fn(&mut LeafTx<'_>, &Mutable) -> EngineResult<()> + Send + Sync + 'static,
    {
        let name: Arc<str> = name.into();
        let def = Arc::new_cyclic(|weak: &Weak<ActionDef>| {
            let deps = [Direction::Forward, Direction::Backward].map(|direction| {
                Setable::builder(format!("{}~{}", name, direction.name()), Deps::new())
                    .plumbing()
                    .with_role(Role::Deps {
                        observer: weak.clone(),
                        direction,
                    })
            });
            let parts = ObserverParts {
                deps,
                exception: Setable::builder(format!("{}~exception", name), None)
                    .plumbing()
                    .build(),
                constructed: Setable::builder(format!("{}~constructed", name), OrdMap::new())
                    .plumbing()
                    .with_role(Role::Constructed {
                        observer: weak.clone(),
                    }),
                traces: Setable::builder(format!("{}~traces", name), None)
                    .plumbing()
                    .build(),
            };
            ActionDef {
                id: ActionId::next(),
                name: name.clone(),
                direction: Direction::Forward,
                body: Arc::new(body),
                observer: Some(parts),
            }
        });
        Observer(Action(def))
    }

    pub fn action(&self) -> &Action {
        &self.0
    }

    pub(crate) fn observer_parts(&self) -> &ObserverParts {
        match self.0.parts() {
            Some(parts) => parts,
            None => unreachable!("observer without observer parts"),
        }
    }

    /// Dependencies recorded by the last run on `mutable`
    pub fn dependencies(&self, state: &State, mutable: &Mutable, direction: Direction) -> Deps {
        self.observer_parts().deps(direction).get(state, mutable)
    }

    /// Failure left by the last run on `mutable`
    pub fn failure(&self, state: &State, mutable: &Mutable) -> Option<ObserverFailure> {
        self.observer_parts().exception.get(state, mutable)
    }

    /// Latest change trace, recorded only while the universe is debugging
    pub fn trace(&self, state: &State, mutable: &Mutable) -> Option<Arc<ObserverTrace>> {
        self.observer_parts().traces.get(state, mutable)
    }

    /// Objects constructed by the last run on `mutable`, by reason
    pub fn constructed(&self, state: &State, mutable: &Mutable) -> OrdMap<Reason, Mutable> {
        self.observer_parts().constructed.get(state, mutable)
    }

    /// Live instances: mutables on which this observer holds dependencies
    pub fn instances(&self, state: &State) -> usize {
        let [reads, writes] = &self.observer_parts().deps;
        state
            .iter()
            .filter(|(_, props)| {
                props.contains_key(reads.setable_ref()) || props.contains_key(writes.setable_ref())
            })
            .count()
    }
}

impl Deref for Observer {
    type Target = Action;

    fn deref(&self) -> &Action {
        &self.0
    }
}

impl AsRef<Action> for Observer {
    fn as_ref(&self) -> &Action {
        &self.0
    }
}

impl AsRef<Action> for Action {
    fn as_ref(&self) -> &Action {
        self
    }
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Observer({})", self.0.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actions_are_ordered_by_creation() {
        let a = Action::new("a", |_, _| Ok(()));
        let b = Action::new("b", |_, _| Ok(()));
        assert!(a < b);
        assert_eq!(a, a.clone());
        assert!(!a.is_observer());
        assert!(a.as_observer().is_none());
    }

    #[test]
    fn test_observer_owns_distinct_bookkeeping() {
        let o = Observer::new("o", |_, _| Ok(()));
        assert!(o.is_observer());
        assert_eq!(o.direction(), Direction::Forward);
        let parts = o.observer_parts();
        assert_ne!(parts.deps[0].setable_ref(), parts.deps[1].setable_ref());
        assert!(parts.deps.iter().all(|d| d.setable_ref().is_plumbing()));
        assert!(matches!(
            parts.deps(Direction::Backward).setable_ref().role(),
            Role::Deps {
                direction: Direction::Backward,
                ..
            }
        ));
        assert_eq!(o.action().as_observer(), Some(o.clone()));
    }
}
