//! Observer runs
//!
//! An observer run is a leaf transaction that records what it read and
//! wrote. When the body returns, the recorded sets replace the instance's
//! dependencies, the change guardrails are applied, and writes that
//! contradict concurrent progress are corrected (ripple-out) and flagged
//! for a backward re-run.

use std::sync::Arc;

use ripple_core::{Direction, EngineError, EngineResult};
use ripple_state::Datum;
use tracing::{debug, trace};

use super::leaf::{LeafTx, ObserverRun};
use super::RunContext;
use crate::action::ObserverFailure;
use crate::stats::{ChangeVerdict, ObserverTrace};
use crate::{Action, Mutable, SetableRef, State};

/// Run `action` on `mutable` against `state`
pub(crate) fn run_leaf(ctx: &RunContext<'_>, action: &Action, mutable: &Mutable, state: State) -> EngineResult<State> {
    let observer = action.as_observer();
    if observer.is_some() && ctx.stats.is_stopped(action, mutable) {
        return Ok(state);
    }
    if ctx.config.trace_actions {
        trace!(action = action.name(), mutable = %mutable, "running");
    }
    let mut tx = LeafTx::open(ctx, action.clone(), mutable.clone(), state, observer.map(ObserverRun::new));
    let body = action.body();
    let result = body(&mut tx, mutable);
    match result {
        Ok(()) if tx.run.is_some() => finish(&mut tx, None)?,
        Err(e) if tx.run.is_some() && !e.is_fatal() => {
            debug!(observer = action.name(), mutable = %mutable, error = %e, "observer failed");
            finish(&mut tx, Some(ObserverFailure { message: e.to_string() }))?;
        }
        Ok(()) => {}
        Err(e) => return Err(e),
    }
    Ok(tx.into_state())
}

/// Store the bookkeeping of a completed observer run
fn finish(tx: &mut LeafTx<'_>, failure: Option<ObserverFailure>) -> EngineResult<()> {
    let Some(run) = tx.run.take() else {
        return Ok(());
    };
    let ctx = tx.ctx;
    let mutable = tx.mutable.clone();
    let action = tx.action.clone();
    let parts = run.observer.observer_parts();

    let trace_of = |tx: &LeafTx<'_>, run: &ObserverRun| {
        ObserverTrace {
            mutable: mutable.clone(),
            observer: action.name().into(),
            reads: run.reads.clone(),
            writes: run.writes.clone(),
            changes: run.changes,
            previous: None,
        }
        .chained(parts.traces.get(&tx.state, &mutable))
    };
    match ctx.stats.record_changes(&action, &mutable, run.changes) {
        ChangeVerdict::Ok => {}
        ChangeVerdict::Trace => {
            let trace = trace_of(&*tx, &run);
            tx.write(&mutable, parts.traces.setable_ref(), Datum::new(Some(Arc::new(trace))))?;
        }
        ChangeVerdict::Fatal => {
            let trace = trace_of(&*tx, &run);
            return Err(EngineError::TooManyChanges {
                observer: action.name().to_string(),
                mutable: mutable.to_string(),
                changes: ctx.stats.instance_changes(&action, &mutable),
                trace: trace.render(),
            });
        }
    }

    let observed: usize = run.gets.values().map(|props| props.len()).sum();
    let limit = ctx.stats.max_observed();
    if observed > limit {
        return Err(EngineError::TooManyObserved {
            observer: action.name().to_string(),
            mutable: mutable.to_string(),
            observed,
            limit,
        });
    }

    tx.write(&mutable, parts.deps(Direction::Forward).setable_ref(), Datum::new(run.gets))?;
    tx.write(&mutable, parts.deps(Direction::Backward).setable_ref(), Datum::new(run.sets))?;
    tx.write(&mutable, parts.constructed.setable_ref(), Datum::new(run.constructed))?;
    tx.write(&mutable, parts.exception.setable_ref(), Datum::new(failure))?;
    if run.backwards {
        tx.trigger(&mutable, &action, Direction::Backward);
    }
    Ok(())
}

/// Correct a write that contradicts progress made since the baseline.
///
/// - A value changed back to the baseline while others moved it away is
///   reverted to what the others made of it.
/// - A containment collection keeps children this run dropped but that
///   changed meanwhile.
/// - A mergeable value changed by others is merged with this write.
pub(crate) fn ripple_out(tx: &mut LeafTx<'_>, object: &Mutable, setable: &SetableRef, post: Datum) -> Datum {
    if setable.is_synthetic() {
        return post;
    }
    let pre = tx.pre.get(object, setable);
    let baseline = tx.ctx.baseline.get(object, setable);
    let mut result = post.clone();
    if setable.is_containment() && setable.is_collection() {
        let kept = setable.mutables_of(&result);
        for child in setable.mutables_of(&pre) {
            if !kept.contains(&child) && changed_since_baseline(tx, &child) {
                if let Some(value) = setable.insert_into(&result, &child) {
                    result = value;
                }
            }
        }
    } else if result == baseline && pre != baseline {
        result = pre.clone();
    } else if pre != baseline && result != pre {
        if let Some(merged) = setable.merge_datum(&baseline, &[&pre, &result]) {
            result = merged;
        }
    }
    if result != post {
        if let Some(run) = tx.run.as_mut() {
            run.backwards = true;
        }
        if tx.ctx.config.trace_ripple_out {
            debug!(
                object = %object,
                setable = %setable,
                wrote = %post.describe(),
                kept = %result.describe(),
                "ripple-out"
            );
        }
    }
    result
}

/// Whether a child that was contained at the baseline has model changes
fn changed_since_baseline(tx: &LeafTx<'_>, child: &Mutable) -> bool {
    if child.parent(&tx.ctx.baseline).is_none() {
        return false;
    }
    let model = |state: &State| {
        state
            .properties(child)
            .into_iter()
            .filter(|(setable, _)| !setable.is_plumbing())
            .collect::<Vec<_>>()
    };
    model(&tx.ctx.baseline) != model(&tx.state)
}
