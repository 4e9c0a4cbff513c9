//! End-to-end checks through the universe driver
//!
//! Each check starts a universe over the reference model, feeds it actions
//! through the input channel and inspects the committed states.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use im::OrdSet;
use ripple_engine::{
    Constant, EngineConfig, EngineError, EngineResult, Mutable, MutableClass, NewableSpec, Observer, State,
};
use ripple_runtime::{Universe, UniverseOptions};

use crate::model::TestModel;

/// Start a universe of the reference model
pub fn start(model: &TestModel, config: EngineConfig) -> EngineResult<Universe> {
    Universe::start(&model.root, config, UniverseOptions::default())
}

/// Add `node` under the universe and wait for the commit
pub fn attach(universe: &Universe, model: &TestModel, node: &Mutable) -> EngineResult<State> {
    universe.put(model.add(universe.universe(), node))?;
    universe.sync()
}

/// Write `source` values one commit at a time and walk history back `steps`
/// times. Returns the `source` seen after every backward step.
pub fn walk_back(config: EngineConfig, values: &[i64], steps: usize) -> EngineResult<Vec<i64>> {
    let model = TestModel::new();
    let universe = start(&model, config)?;
    let node = model.node("walker");
    attach(&universe, &model, &node)?;
    for value in values {
        universe.apply(&node, &model.source, *value)?;
    }
    universe.sync()?;
    let mut seen = Vec::with_capacity(steps);
    for _ in 0..steps {
        universe.backward()?;
        seen.push(model.source.get(&universe.sync()?, &node));
    }
    Ok(seen)
}
