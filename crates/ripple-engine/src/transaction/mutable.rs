//! Mutable transactions
//!
//! Each mutable drains its scheduled queue: first its own actions, then the
//! children that have work. Every drained set is one batch. A batch runs in
//! parallel on the universe's pool, each unit on its own branch of the same
//! state; the branches are merged afterwards. Observers whose inputs were
//! changed in a sibling branch are re-queued by the merge handler. When the
//! merge conflicts, the batch is re-run serially from the same state.

use std::cell::RefCell;

use im::OrdSet;
use rayon::prelude::*;
use ripple_core::{Direction, EngineError, EngineResult};
use ripple_state::{Datum, Props, StateMergeHandler};
use tracing::{debug, trace};

use super::{observer, promote, schedule, RunContext};
use crate::action::ObserverIndex;
use crate::setable::{queues, Role};
use crate::{Action, Mutable, SetableRef, State};

/// One element of a batch
#[derive(Clone, Debug)]
enum Unit {
    Action(Action),
    /// A child and whether it must also take its backward queues
    Child(Mutable, bool),
}

/// Run everything scheduled on `mutable` and below
pub(crate) fn run_mutable(ctx: &RunContext<'_>, mutable: &Mutable, state: State, backward: bool) -> EngineResult<State> {
    let scheduled = queues(Direction::Scheduled);
    let mut state = state;
    let mut backward_children = OrdSet::new();
    if backward {
        backward_children = queues(Direction::Backward).children.get(&state, mutable);
        state = promote(&state, mutable, Direction::Backward);
    }
    loop {
        state = promote(&state, mutable, Direction::Forward);
        let actions = scheduled.actions.get(&state, mutable);
        if !actions.is_empty() {
            state = scheduled.actions.set(&state, mutable, OrdSet::new());
            let units: Vec<Unit> = actions.into_iter().map(Unit::Action).collect();
            state = run_batch(ctx, mutable, state, units)?;
            continue;
        }
        let children = scheduled.children.get(&state, mutable);
        if !children.is_empty() {
            state = scheduled.children.set(&state, mutable, OrdSet::new());
            let units: Vec<Unit> = children
                .into_iter()
                .filter(|child| child.parent(&state).is_some_and(|p| p.mutable == *mutable))
                .map(|child| {
                    let backward = backward_children.contains(&child);
                    Unit::Child(child, backward)
                })
                .collect();
            backward_children = OrdSet::new();
            state = run_batch(ctx, mutable, state, units)?;
            continue;
        }
        return Ok(state);
    }
}

fn run_unit(ctx: &RunContext<'_>, mutable: &Mutable, unit: &Unit, state: State) -> EngineResult<State> {
    match unit {
        Unit::Action(action) => observer::run_leaf(ctx, action, mutable, state),
        Unit::Child(child, backward) => run_mutable(ctx, child, state, *backward),
    }
}

fn run_serial(ctx: &RunContext<'_>, mutable: &Mutable, state: State, units: &[Unit]) -> EngineResult<State> {
    units
        .iter()
        .try_fold(state, |state, unit| run_unit(ctx, mutable, unit, state))
}

fn run_batch(ctx: &RunContext<'_>, mutable: &Mutable, state: State, units: Vec<Unit>) -> EngineResult<State> {
    if units.is_empty() {
        return Ok(state);
    }
    if ctx.config.trace_mutable {
        trace!(mutable = %mutable, units = units.len(), "running batch");
    }
    if ctx.config.run_sequential || units.len() == 1 {
        return run_serial(ctx, mutable, state, &units);
    }
    let branches: Vec<EngineResult<State>> = ctx.pool.install(|| {
        units
            .par_iter()
            .map(|unit| run_unit(ctx, mutable, unit, state.clone()))
            .collect()
    });
    let branches = branches.into_iter().collect::<EngineResult<Vec<State>>>()?;
    let handler = MergeTriggers::new(ctx.stats.max_observers());
    match state.merge(&handler, &branches) {
        Ok(merged) => handler.apply(merged),
        Err(conflict) => {
            debug!(mutable = %mutable, %conflict, "merge conflict, re-running batch serially");
            run_serial(ctx, mutable, state, &units)
        }
    }
}

/// Collects the cross-branch consequences of a merge
struct MergeTriggers {
    max_observers: usize,
    triggers: RefCell<Vec<(Mutable, Action, Direction)>>,
    errors: RefCell<Vec<EngineError>>,
}

impl MergeTriggers {
    fn new(max_observers: usize) -> Self {
        MergeTriggers {
            max_observers,
            triggers: RefCell::new(Vec::new()),
            errors: RefCell::new(Vec::new()),
        }
    }

    fn apply(self, merged: State) -> EngineResult<State> {
        if let Some(error) = self.errors.into_inner().into_iter().next() {
            return Err(error);
        }
        Ok(self
            .triggers
            .into_inner()
            .into_iter()
            .fold(merged, |state, (target, action, direction)| {
                schedule(&state, &target, &action, direction)
            }))
    }
}

fn index_of(props: &Props<SetableRef>, index: &SetableRef) -> ObserverIndex {
    props
        .get(index)
        .and_then(|datum| datum.downcast_ref::<ObserverIndex>())
        .cloned()
        .unwrap_or_default()
}

impl StateMergeHandler<Mutable, SetableRef> for MergeTriggers {
    fn handle_change(
        &self,
        object: &Mutable,
        property: &SetableRef,
        _base: &Props<SetableRef>,
        merged: &Props<SetableRef>,
        branches: &[Props<SetableRef>],
    ) {
        match property.role() {
            Role::Observed { .. } => {
                let value = |props: &Props<SetableRef>| -> Datum {
                    props
                        .get(property)
                        .cloned()
                        .unwrap_or_else(|| property.default_datum().clone())
                };
                let merged_value = value(merged);
                for direction in [Direction::Forward, Direction::Backward] {
                    let Some(index) = property.observer_index(direction) else {
                        continue;
                    };
                    for branch in branches.iter().filter(|b| value(b) != merged_value) {
                        for (observer, instances) in index_of(branch, index).iter() {
                            for instance in instances.iter() {
                                self.triggers
                                    .borrow_mut()
                                    .push((instance.clone(), observer.clone(), direction));
                            }
                        }
                    }
                }
            }
            Role::ObserverIndex { observed, .. } => {
                let count: usize = index_of(merged, property).values().map(OrdSet::len).sum();
                if count > self.max_observers {
                    let name = observed
                        .upgrade()
                        .map(|def| SetableRef(def).name().to_string())
                        .unwrap_or_default();
                    self.errors.borrow_mut().push(EngineError::TooManyObservers {
                        object: format!("{:?}", object),
                        property: name,
                        observers: count,
                        limit: self.max_observers,
                    });
                }
            }
            _ => {}
        }
    }
}
