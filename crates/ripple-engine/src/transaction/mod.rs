//! Transaction hierarchy
//!
//! - `leaf`: the context handed to rule bodies; every write goes through
//!   its change hook
//! - `observer`: observer runs, dependency bookkeeping and ripple-out
//! - `matching`: identity reconciliation of constructed objects
//! - `mutable`: the recursive scheduler over direction queues, running
//!   sibling work in parallel and merging the branches
//! - `engine`: one top-level action from pre-state to committed state

pub mod current;
mod engine;
mod leaf;
mod matching;
mod mutable;
mod observer;

pub use engine::Engine;
pub use leaf::LeafTx;
pub use matching::MatchInfo;

use im::OrdSet;
use ripple_core::{Direction, EngineConfig};

use crate::setable::queues;
use crate::{Action, ConstantState, Mutable, State, UniverseStatistics};

/// Shared, read-only context of one root pass
pub struct RunContext<'e> {
    pub(crate) config: &'e EngineConfig,
    pub(crate) universe: &'e Mutable,
    pub(crate) constants: &'e ConstantState,
    pub(crate) stats: &'e UniverseStatistics,
    pub(crate) pool: &'e rayon::ThreadPool,
    /// Start of the previous root pass; ripple-out compares against it
    pub(crate) baseline: State,
}

impl<'e> RunContext<'e> {
    pub fn config(&self) -> &EngineConfig {
        self.config
    }

    pub fn universe(&self) -> &Mutable {
        self.universe
    }

    pub fn baseline(&self) -> &State {
        &self.baseline
    }
}

/// Queue `action` on `target` and mark the path up to the root
pub(crate) fn schedule(state: &State, target: &Mutable, action: &Action, direction: Direction) -> State {
    let queue = queues(direction);
    let actions = queue.actions.get(state, target);
    let mut state = if actions.contains(action) {
        state.clone()
    } else {
        queue.actions.set(state, target, actions.update(action.clone()))
    };
    let mut child = target.clone();
    while let Some(parent) = child.parent(&state) {
        let children = queue.children.get(&state, &parent.mutable);
        if children.contains(&child) {
            break;
        }
        state = queue.children.set(&state, &parent.mutable, children.update(child.clone()));
        child = parent.mutable;
    }
    state
}

/// Move the queues of `direction` into the scheduled queues of `mutable`
pub(crate) fn promote(state: &State, mutable: &Mutable, direction: Direction) -> State {
    let from = queues(direction);
    let to = queues(Direction::Scheduled);
    let actions = from.actions.get(state, mutable);
    let children = from.children.get(state, mutable);
    if actions.is_empty() && children.is_empty() {
        return state.clone();
    }
    let state = from.actions.set(state, mutable, OrdSet::new());
    let state = from.children.set(&state, mutable, OrdSet::new());
    let scheduled = to.actions.get(&state, mutable).union(actions);
    let state = to.actions.set(&state, mutable, scheduled);
    let scheduled = to.children.get(&state, mutable).union(children);
    to.children.set(&state, mutable, scheduled)
}

/// Whether anything is queued on `mutable` in `direction`
pub(crate) fn has_work(state: &State, mutable: &Mutable, direction: Direction) -> bool {
    let queue = queues(direction);
    !queue.actions.get(state, mutable).is_empty() || !queue.children.get(state, mutable).is_empty()
}
