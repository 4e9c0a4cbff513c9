//! Leaf transactions
//!
//! A [`LeafTx`] is what a rule body sees. Reads and writes go through it so
//! that observer runs can record their dependencies, and every write runs
//! the change hook that keeps the derived structure of the model in step:
//! observer indexes, parent links, opposites and trigger queues.

use im::{OrdMap, OrdSet};
use ripple_core::{Direction, EngineConfig, EngineError, EngineResult, ObjectId};
use ripple_state::Datum;
use tracing::trace;

use super::current::{self, CurrentGuard};
use super::{matching, observer, schedule, RunContext};
use crate::action::{Deps, ObserverIndex};
use crate::constant::DeriveCtx;
use crate::newable::{Construction, NewableSpec, Reason};
use crate::setable::{constructions_setable, parent_setable, Role};
use crate::{Action, Constant, Mutable, Observer, Parent, Setable, SetableRef, State, Value};

/// Bookkeeping of one observer run
pub(crate) struct ObserverRun {
    pub observer: Observer,
    pub gets: Deps,
    pub sets: Deps,
    pub constructed: OrdMap<Reason, Mutable>,
    pub changes: usize,
    /// A write was corrected by ripple-out
    pub backwards: bool,
    pub reads: Vec<String>,
    pub writes: Vec<String>,
}

impl ObserverRun {
    pub fn new(observer: Observer) -> Self {
        ObserverRun {
            observer,
            gets: Deps::new(),
            sets: Deps::new(),
            constructed: OrdMap::new(),
            changes: 0,
            backwards: false,
            reads: Vec::new(),
            writes: Vec::new(),
        }
    }
}

pub(crate) fn add_dep(deps: &mut Deps, object: &Mutable, setable: &SetableRef) {
    let mut props = deps.get(object).cloned().unwrap_or_default();
    if props.insert(setable.clone()).is_none() {
        deps.insert(object.clone(), props);
    }
}

/// Execution context of one action on one mutable
pub struct LeafTx<'a> {
    pub(crate) ctx: &'a RunContext<'a>,
    pub(crate) action: Action,
    pub(crate) mutable: Mutable,
    pub(crate) pre: State,
    pub(crate) state: State,
    pub(crate) run: Option<ObserverRun>,
    _current: CurrentGuard,
}

impl<'a> LeafTx<'a> {
    pub(crate) fn open(
        ctx: &'a RunContext<'a>,
        action: Action,
        mutable: Mutable,
        state: State,
        run: Option<ObserverRun>,
    ) -> Self {
        let guard = current::open(&state);
        LeafTx {
            ctx,
            action,
            mutable,
            pre: state.clone(),
            state,
            run,
            _current: guard,
        }
    }

    pub(crate) fn into_state(self) -> State {
        self.state
    }

    pub fn mutable(&self) -> &Mutable {
        &self.mutable
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    /// Working state, including this transaction's own writes
    pub fn state(&self) -> &State {
        &self.state
    }

    /// State when this transaction started
    pub fn pre_state(&self) -> &State {
        &self.pre
    }

    pub fn config(&self) -> &EngineConfig {
        self.ctx.config
    }

    pub fn universe(&self) -> &Mutable {
        self.ctx.universe
    }

    /// Read a property. Inside an observer the read becomes a dependency.
    pub fn get<T: Value>(&mut self, object: &Mutable, setable: &Setable<T>) -> T {
        let datum = self.get_datum(object, setable.setable_ref());
        setable.from_datum(&datum)
    }

    pub(crate) fn get_datum(&mut self, object: &Mutable, setable: &SetableRef) -> Datum {
        if setable.is_observed() {
            let debugging = self.ctx.stats.is_debugging();
            if let Some(run) = self.run.as_mut() {
                add_dep(&mut run.gets, object, setable);
                if debugging {
                    run.reads.push(format!("{}.{}", object, setable));
                }
            }
        }
        self.state.get(object, setable)
    }

    /// Read the value this transaction started with, without tracking
    pub fn pre<T: Value>(&self, object: &Mutable, setable: &Setable<T>) -> T {
        setable.get(&self.pre, object)
    }

    pub fn parent(&mut self, object: &Mutable) -> Option<Parent> {
        self.get(object, parent_setable())
    }

    pub fn set<T: Value>(&mut self, object: &Mutable, setable: &Setable<T>, value: T) -> EngineResult<()> {
        self.set_datum(object, setable.setable_ref(), Datum::new(value))
    }

    /// Read-modify-write. The read is not a dependency.
    pub fn update<T: Value>(
        &mut self,
        object: &Mutable,
        setable: &Setable<T>,
        f: impl FnOnce(T) -> T,
    ) -> EngineResult<()> {
        let value = f(setable.get(&self.state, object));
        self.set(object, setable, value)
    }

    /// Derive or read a constant against the working state
    pub fn constant<T: Value>(&self, object: &Mutable, constant: &Constant<T>) -> EngineResult<T> {
        let mut derive = DeriveCtx::new(self.ctx.constants, &self.state);
        self.ctx.constants.get(&mut derive, object, constant)
    }

    /// Queue `action` on `target` in `direction`
    pub fn trigger(&mut self, target: &Mutable, action: &Action, direction: Direction) {
        self.state = schedule(&self.state, target, action, direction);
        current::publish(&self.state);
    }

    /// Object made by an action. It lives until it is orphaned.
    pub fn construct_direct(&self, spec: NewableSpec) -> Mutable {
        spec.build(ObjectId::next(), true)
    }

    /// Object derived by this observer run for `reason`.
    ///
    /// The same construction yields the same object in every run, branch
    /// and execution mode. Outside an observer this is a direct
    /// construction.
    pub fn construct(&mut self, reason: impl Into<Reason>, spec: NewableSpec) -> EngineResult<Mutable> {
        let reason = reason.into();
        let Some(run) = self.run.as_ref() else {
            return Ok(self.construct_direct(spec));
        };
        if let Some(made) = run.constructed.get(&reason) {
            return Ok(made.clone());
        }
        let observer = run.observer.clone();
        let previous = observer.constructed(&self.pre, &self.mutable);
        let made = match previous.get(&reason) {
            Some(made) => made.clone(),
            None => {
                let construction = Construction {
                    object: self.mutable.clone(),
                    feature: observer.name().into(),
                    reason: reason.clone(),
                };
                let id = construction.derive_id();
                let datum = self.ctx.constants.memoize(self.mutable.id(), construction.slot(), || {
                    Datum::new(spec.build(id, false))
                });
                datum
                    .downcast_ref::<Mutable>()
                    .cloned()
                    .ok_or_else(|| EngineError::rule(format!("construction slot of {} holds a foreign value", id)))?
            }
        };
        if self.ctx.config.trace_matching {
            trace!(observer = observer.name(), mutable = %self.mutable, made = ?made, "constructed");
        }
        if let Some(run) = self.run.as_mut() {
            run.constructed.insert(reason, made.clone());
        }
        Ok(made)
    }

    /// Write from a rule body
    pub(crate) fn set_datum(&mut self, object: &Mutable, setable: &SetableRef, value: Datum) -> EngineResult<()> {
        let tracked = self.run.is_some() && setable.is_observed() && !setable.is_plumbing();
        let mut value = value;
        if tracked {
            if let Some(run) = self.run.as_mut() {
                add_dep(&mut run.sets, object, setable);
            }
            let old = self.state.get(object, setable);
            if old != value {
                value = matching::match_newables(self, object, setable, &old, value)?;
                value = observer::ripple_out(self, object, setable, value);
            }
        }
        let counted = self.run.is_some() && !setable.is_plumbing();
        self.write_counted(object, setable, value, counted)
    }

    /// Engine write: runs the change hook but is never tracked or corrected
    pub(crate) fn write(&mut self, object: &Mutable, setable: &SetableRef, value: Datum) -> EngineResult<()> {
        self.write_counted(object, setable, value, false)
    }

    fn write_counted(
        &mut self,
        object: &Mutable,
        setable: &SetableRef,
        value: Datum,
        counted: bool,
    ) -> EngineResult<()> {
        let old = self.state.get(object, setable);
        if old == value {
            return Ok(());
        }
        self.state = self.state.set(object, setable, value.clone());
        current::publish(&self.state);
        if counted {
            let debugging = self.ctx.stats.is_debugging();
            if let Some(run) = self.run.as_mut() {
                run.changes += 1;
                if debugging {
                    run.writes.push(format!("{}.{}={}", object, setable, value.describe()));
                }
            }
        }
        self.changed(object, setable, &old, &value)
    }

    fn changed(&mut self, object: &Mutable, setable: &SetableRef, old: &Datum, new: &Datum) -> EngineResult<()> {
        match setable.role() {
            Role::Deps { observer, direction } => {
                if let Some(def) = observer.upgrade() {
                    self.rewire(object, &Action(def), *direction, old, new)?;
                }
            }
            Role::ObserverIndex { observed, .. } => {
                let count: usize = new
                    .downcast_ref::<ObserverIndex>()
                    .map_or(0, |index| index.values().map(OrdSet::len).sum());
                let limit = self.ctx.stats.max_observers();
                if count > limit {
                    let property = observed
                        .upgrade()
                        .map(|def| SetableRef(def).name().to_string())
                        .unwrap_or_default();
                    return Err(EngineError::TooManyObservers {
                        object: format!("{:?}", object),
                        property,
                        observers: count,
                        limit,
                    });
                }
            }
            Role::Constructed { observer } => {
                if let Some(def) = observer.upgrade() {
                    self.reconstruct(object, &Action(def), old, new)?;
                }
            }
            _ => {}
        }
        if setable == parent_setable().setable_ref() {
            let activated = old.downcast_ref::<Option<Parent>>().map_or(true, Option::is_none)
                && new.downcast_ref::<Option<Parent>>().is_some_and(Option::is_some);
            if activated {
                for observer in object.class().observers() {
                    self.trigger(object, observer.action(), Direction::Forward);
                }
            }
        }
        if let Some(hook) = setable.hook() {
            hook(self, object, old, new)?;
        }
        if setable.is_containment() {
            self.contain(object, setable, old, new)?;
        }
        if let Some(opposite) = setable.opposite() {
            self.oppose(object, setable, &opposite, old, new)?;
        }
        if setable.is_observed() {
            self.notify(object, setable);
        }
        Ok(())
    }

    /// Keep the observer indexes in step with an instance's dependencies
    fn rewire(
        &mut self,
        instance: &Mutable,
        observer: &Action,
        direction: Direction,
        old: &Datum,
        new: &Datum,
    ) -> EngineResult<()> {
        let empty = Deps::new();
        let before = old.downcast_ref::<Deps>().unwrap_or(&empty);
        let after = new.downcast_ref::<Deps>().unwrap_or(&empty);
        let mut edits: Vec<(Mutable, SetableRef, bool)> = Vec::new();
        for (object, props) in after.iter() {
            let had = before.get(object);
            for prop in props.iter() {
                if !had.is_some_and(|h| h.contains(prop)) {
                    edits.push((object.clone(), prop.clone(), true));
                }
            }
        }
        for (object, props) in before.iter() {
            let has = after.get(object);
            for prop in props.iter() {
                if !has.is_some_and(|h| h.contains(prop)) {
                    edits.push((object.clone(), prop.clone(), false));
                }
            }
        }
        for (object, prop, added) in edits {
            let Some(index) = prop.observer_index(direction).cloned() else {
                continue;
            };
            let current = self
                .state
                .get(&object, &index)
                .downcast_ref::<ObserverIndex>()
                .cloned()
                .unwrap_or_default();
            let mut instances = current.get(observer).cloned().unwrap_or_default();
            if added {
                instances.insert(instance.clone());
            } else {
                instances.remove(instance);
            }
            let updated = if instances.is_empty() {
                current.without(observer)
            } else {
                current.update(observer.clone(), instances)
            };
            self.write(&object, &index, Datum::new(updated))?;
        }
        Ok(())
    }

    /// Keep the constructions of newables in step with an observer's map
    fn reconstruct(&mut self, instance: &Mutable, observer: &Action, old: &Datum, new: &Datum) -> EngineResult<()> {
        let empty = OrdMap::new();
        let before = old.downcast_ref::<OrdMap<Reason, Mutable>>().unwrap_or(&empty);
        let after = new.downcast_ref::<OrdMap<Reason, Mutable>>().unwrap_or(&empty);
        let constructions = constructions_setable();
        let construction = |reason: &Reason| Construction {
            object: instance.clone(),
            feature: observer.name().into(),
            reason: reason.clone(),
        };
        for (reason, made) in before.iter() {
            if after.get(reason) != Some(made) {
                let set = constructions.get(&self.state, made).without(&construction(reason));
                self.write(made, constructions.setable_ref(), Datum::new(set))?;
            }
        }
        for (reason, made) in after.iter() {
            if before.get(reason) != Some(made) {
                let set = constructions.get(&self.state, made).update(construction(reason));
                self.write(made, constructions.setable_ref(), Datum::new(set))?;
            }
        }
        Ok(())
    }

    /// Maintain parent links of the children held by a containment setable
    fn contain(&mut self, object: &Mutable, setable: &SetableRef, old: &Datum, new: &Datum) -> EngineResult<()> {
        let before = setable.mutables_of(old);
        let after = setable.mutables_of(new);
        let link = Parent {
            mutable: object.clone(),
            containing: setable.clone(),
        };
        let parent = parent_setable().setable_ref();
        for child in before.iter().filter(|c| !after.contains(c)) {
            if child.parent(&self.state).as_ref() == Some(&link) {
                self.write(child, parent, Datum::new(None::<Parent>))?;
            }
        }
        for child in after.iter().filter(|c| !before.contains(c)) {
            match child.parent(&self.state) {
                Some(current) if current == link => continue,
                Some(current) => {
                    // moved: drop it from where it was
                    let held = self.state.get(&current.mutable, &current.containing);
                    if let Some(value) = current.containing.remove_from(&held, child) {
                        self.write(&current.mutable, &current.containing, value)?;
                    }
                }
                None => {}
            }
            self.write(child, parent, Datum::new(Some(link.clone())))?;
        }
        Ok(())
    }

    /// Mirror reference edits into the opposite setable
    fn oppose(
        &mut self,
        object: &Mutable,
        setable: &SetableRef,
        opposite: &SetableRef,
        old: &Datum,
        new: &Datum,
    ) -> EngineResult<()> {
        let before = setable.mutables_of(old);
        let after = setable.mutables_of(new);
        for other in before.iter().filter(|r| !after.contains(r)) {
            let value = self.state.get(other, opposite);
            if opposite.mutables_of(&value).contains(object) {
                if let Some(value) = opposite.remove_from(&value, object) {
                    self.write(other, opposite, value)?;
                }
            }
        }
        for other in after.iter().filter(|r| !before.contains(r)) {
            let value = self.state.get(other, opposite);
            if !opposite.mutables_of(&value).contains(object) {
                if let Some(value) = opposite.insert_into(&value, object) {
                    self.write(other, opposite, value)?;
                }
            }
        }
        Ok(())
    }

    /// Queue the readers (forward) and writers (backward) of a changed value
    fn notify(&mut self, object: &Mutable, setable: &SetableRef) {
        for direction in [Direction::Forward, Direction::Backward] {
            let Some(index) = setable.observer_index(direction) else {
                continue;
            };
            let Some(observers) = self.state.get(object, index).downcast_ref::<ObserverIndex>().cloned() else {
                continue;
            };
            for (observer, instances) in observers.iter() {
                for instance in instances.iter() {
                    if *observer == self.action && *instance == self.mutable {
                        continue;
                    }
                    self.trigger(instance, observer, direction);
                }
            }
        }
    }

    /// Detach an orphan: drop its dependencies, constructions, children
    /// and opposite links, then its whole state
    pub(crate) fn deactivate(&mut self, orphan: &Mutable) -> EngineResult<()> {
        for observer in orphan.class().observers() {
            let parts = observer.observer_parts();
            for direction in [Direction::Forward, Direction::Backward] {
                self.write(orphan, parts.deps(direction).setable_ref(), Datum::new(Deps::new()))?;
            }
            self.write(
                orphan,
                parts.constructed.setable_ref(),
                Datum::new(OrdMap::<Reason, Mutable>::new()),
            )?;
        }
        for containing in orphan.class().containments() {
            self.write(orphan, containing, containing.default_datum().clone())?;
        }
        let linked: Vec<SetableRef> = self
            .state
            .properties(orphan)
            .into_iter()
            .filter(|(setable, _)| setable.opposite().is_some())
            .map(|(setable, _)| setable)
            .collect();
        for setable in linked {
            self.write(orphan, &setable, setable.default_datum().clone())?;
        }
        self.state = self.state.clear(orphan);
        current::publish(&self.state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MutableClass;

    #[test]
    fn test_add_dep_groups_by_object() {
        let class = MutableClass::plain("Node");
        let a = Mutable::new(&class, "a");
        let b = Mutable::new(&class, "b");
        let x = Setable::new("x", 0i64);
        let y = Setable::new("y", 0i64);
        let mut deps = Deps::new();
        add_dep(&mut deps, &a, x.setable_ref());
        add_dep(&mut deps, &a, y.setable_ref());
        add_dep(&mut deps, &a, x.setable_ref());
        add_dep(&mut deps, &b, x.setable_ref());
        assert_eq!(deps.len(), 2);
        assert_eq!(deps.get(&a).map(OrdSet::len), Some(2));
        assert_eq!(deps.get(&b).map(OrdSet::len), Some(1));
    }
}
