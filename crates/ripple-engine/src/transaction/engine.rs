//! Top-level action execution
//!
//! One action runs in root passes. Each pass drains everything scheduled
//! from the universe down; another pass follows while backward work is
//! pending. When the tree is quiet, orphans are detached and cleared, which
//! may schedule more work. The result is checked for consistency before it
//! is handed back for commit.

use std::sync::Arc;

use ripple_core::{Direction, EngineConfig, EngineError, EngineResult, UniverseId};
use tracing::{debug, warn};

use super::leaf::LeafTx;
use super::mutable::run_mutable;
use super::{has_work, schedule, RunContext};
use crate::{consistency, Action, ConstantState, Mutable, State, UniverseStatistics};

/// Executes top-level actions against one universe
pub struct Engine {
    config: Arc<EngineConfig>,
    universe: Mutable,
    universe_id: UniverseId,
    constants: ConstantState,
    stats: UniverseStatistics,
    pool: rayon::ThreadPool,
    pre_actions: Vec<Action>,
    post_actions: Vec<Action>,
    clear_orphans: Action,
}

impl Engine {
    pub fn new(universe: Mutable, config: EngineConfig) -> EngineResult<Self> {
        let config = Arc::new(config);
        let mut builder = rayon::ThreadPoolBuilder::new().thread_name(|i| format!("ripple-worker-{}", i));
        if config.parallelism > 0 {
            builder = builder.num_threads(config.parallelism);
        }
        let pool = builder.build().map_err(|e| EngineError::Spawn(e.to_string()))?;
        Ok(Engine {
            constants: ConstantState::new(config.max_constant_depth, config.trace_derivation),
            stats: UniverseStatistics::new(config.clone()),
            universe_id: UniverseId::next(),
            clear_orphans: Action::new("clearOrphans", |_, _| Ok(())),
            pre_actions: Vec::new(),
            post_actions: Vec::new(),
            universe,
            config,
            pool,
        })
    }

    /// Actions settled before and after every top-level action
    pub fn with_hooks(mut self, pre_actions: Vec<Action>, post_actions: Vec<Action>) -> Self {
        self.pre_actions = pre_actions;
        self.post_actions = post_actions;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn universe(&self) -> &Mutable {
        &self.universe
    }

    pub fn constants(&self) -> &ConstantState {
        &self.constants
    }

    pub fn stats(&self) -> &UniverseStatistics {
        &self.stats
    }

    /// Empty state of this universe
    pub fn empty_state(&self) -> State {
        State::new(self.universe_id)
    }

    /// Initial commit: run the universe's observers and settle
    pub fn activate(&self, state: &State) -> EngineResult<State> {
        self.stats.start_action();
        let scheduled = self
            .universe
            .class()
            .observers()
            .iter()
            .fold(state.clone(), |s, observer| {
                schedule(&s, &self.universe, observer.action(), Direction::Forward)
            });
        let post = self.settle(state, scheduled)?;
        self.check(state, &post)?;
        Ok(post)
    }

    /// Run one action on `target` (the universe when `None`) and settle
    pub fn run_action(&self, pre: &State, action: &Action, target: Option<&Mutable>) -> EngineResult<State> {
        let run = self.stats.start_action();
        if self.config.trace_universe {
            debug!(run, action = action.name(), "action started");
        }
        let target = target.unwrap_or(&self.universe);
        let mut state = pre.clone();
        for hook in &self.pre_actions {
            state = self.settle(&state, schedule(&state, &self.universe, hook, Direction::Scheduled))?;
        }
        state = self.settle(&state, schedule(&state, target, action, Direction::Scheduled))?;
        self.check(pre, &state)?;
        for hook in &self.post_actions {
            state = self.settle(&state, schedule(&state, &self.universe, hook, Direction::Scheduled))?;
        }
        if self.config.trace_universe {
            debug!(run, changes = self.stats.total_changes(), "action settled");
        }
        Ok(state)
    }

    fn context(&self, baseline: State) -> RunContext<'_> {
        RunContext {
            config: &self.config,
            universe: &self.universe,
            constants: &self.constants,
            stats: &self.stats,
            pool: &self.pool,
            baseline,
        }
    }

    /// Root passes until nothing is pending and no orphan is left
    fn settle(&self, start: &State, scheduled: State) -> EngineResult<State> {
        let mut state = scheduled;
        let mut baseline = start.clone();
        let mut pass = 0usize;
        loop {
            let pass_start = state.clone();
            let ctx = self.context(baseline);
            state = run_mutable(&ctx, &self.universe, state, true)?;
            pass += 1;
            if self.config.trace_universe {
                debug!(pass, "root pass done");
            }
            if !has_work(&state, &self.universe, Direction::Backward) {
                let orphans = self.orphans(&state);
                if orphans.is_empty() {
                    return Ok(state);
                }
                state = self.clear(&ctx, state, &orphans)?;
            }
            baseline = pass_start;
        }
    }

    fn orphans(&self, state: &State) -> Vec<Mutable> {
        state
            .objects()
            .filter(|object| **object != self.universe && object.parent(state).is_none())
            .cloned()
            .collect()
    }

    fn clear(&self, ctx: &RunContext<'_>, state: State, orphans: &[Mutable]) -> EngineResult<State> {
        if self.config.trace_universe {
            debug!(orphans = orphans.len(), "clearing orphans");
        }
        let mut tx = LeafTx::open(ctx, self.clear_orphans.clone(), self.universe.clone(), state, None);
        for orphan in orphans {
            tx.deactivate(orphan)?;
        }
        let state = tx.into_state();
        for orphan in orphans {
            self.constants.evict(orphan.id());
        }
        Ok(state)
    }

    fn check(&self, pre: &State, post: &State) -> EngineResult<()> {
        let violations = consistency::check(&self.config, &self.universe, pre, post);
        if violations.is_empty() {
            return Ok(());
        }
        warn!(count = violations.len(), "consistency violations, rolling back");
        Err(EngineError::Consistency(violations))
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("universe", &self.universe)
            .field("universe_id", &self.universe_id)
            .field("constants", &self.constants)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MutableClass, NewableSpec, Observed, Observer, Setable};
    use im::OrdSet;
    use ripple_core::ConsistencyViolation;
    use std::sync::Arc;

    struct Model {
        universe: Mutable,
        children: Setable<OrdSet<Mutable>>,
        source: Observed<i64>,
        target: Observed<i64>,
        item: Arc<MutableClass>,
    }

    fn model() -> Model {
        let children: Setable<OrdSet<Mutable>> =
            Setable::builder("children", OrdSet::new()).containment().build();
        let source: Observed<i64> = Observed::new("source", 100);
        let target: Observed<i64> = Observed::new("target", 0);
        let copy = {
            let (source, target) = (source.clone(), target.clone());
            Observer::new("copy", move |tx, m| {
                let value = tx.get(m, &source);
                tx.set(m, &target, value)
            })
        };
        let item = MutableClass::builder("Item")
            .setable(&source)
            .setable(&target)
            .observer(&copy)
            .build();
        let root = MutableClass::builder("Root").setable(&children).build();
        Model {
            universe: Mutable::new(&root, "universe"),
            children,
            source,
            target,
            item,
        }
    }

    fn add(model: &Model, item: &Mutable) -> Action {
        let (children, item) = (model.children.clone(), item.clone());
        Action::new("add", move |tx, universe| tx.update(universe, &children, |c| c.update(item.clone())))
    }

    #[test]
    fn test_observer_follows_source() {
        let model = model();
        let engine = Engine::new(model.universe.clone(), EngineConfig::sequential()).unwrap();
        let state = engine.activate(&engine.empty_state()).unwrap();
        let item = Mutable::new(&model.item, "item");
        let state = engine.run_action(&state, &add(&model, &item), None).unwrap();
        assert_eq!(model.target.get(&state, &item), 100);

        let source = model.source.clone();
        let set = Action::new("set", move |tx, m| tx.set(m, &source, 42));
        let state = engine.run_action(&state, &set, Some(&item)).unwrap();
        assert_eq!(model.target.get(&state, &item), 42);
        assert!(!has_work(&state, &model.universe, Direction::Scheduled));
    }

    #[test]
    fn test_orphans_are_cleared() {
        let model = model();
        let engine = Engine::new(model.universe.clone(), EngineConfig::sequential()).unwrap();
        let item = Mutable::new(&model.item, "item");
        let state = engine.run_action(&engine.empty_state(), &add(&model, &item), None).unwrap();
        assert!(!state.properties(&item).is_empty());

        let children = model.children.clone();
        let remove = Action::new("remove", move |tx, universe| {
            tx.set(universe, &children, OrdSet::new())
        });
        let state = engine.run_action(&state, &remove, None).unwrap();
        assert!(state.properties(&item).is_empty());
        assert_eq!(model.target.get(&state, &item), 0);
    }

    #[test]
    fn test_conflicting_siblings_rerun_serially() {
        let model = model();
        let x = Setable::new("x", 0i64);
        let writers: Vec<Observer> = [10i64, 20]
            .into_iter()
            .map(|value| {
                let x = x.clone();
                Observer::new(format!("write{}", value), move |tx, m| tx.set(m, &x, value))
            })
            .collect();
        let pairs = MutableClass::builder("Pair")
            .setable(&x)
            .observer(&writers[0])
            .observer(&writers[1])
            .build();

        for config in [EngineConfig::sequential(), EngineConfig { parallelism: 2, ..EngineConfig::dev() }] {
            let engine = Engine::new(model.universe.clone(), config).unwrap();
            let pair = Mutable::new(&pairs, "pair");
            let state = engine.run_action(&engine.empty_state(), &add(&model, &pair), None).unwrap();
            assert_eq!(x.get(&state, &pair), 20);
        }
    }

    #[test]
    fn test_failing_observer_rolls_back() {
        let model = model();
        let failing = Observer::new("failing", |_, _| Err(EngineError::rule("no value")));
        let broken = MutableClass::builder("Broken").observer(&failing).build();
        let engine = Engine::new(model.universe.clone(), EngineConfig::sequential()).unwrap();
        let item = Mutable::new(&broken, "broken");

        match engine.run_action(&engine.empty_state(), &add(&model, &item), None) {
            Err(EngineError::Consistency(violations)) => {
                assert!(violations.iter().any(|v| matches!(
                    v,
                    ConsistencyViolation::ObserverFailed { observer, message, .. }
                        if observer == "failing" && message.contains("no value")
                )));
            }
            other => panic!("expected an observer failure, got {:?}", other.map(|s| s.len())),
        }
    }

    struct Factory {
        class: Arc<MutableClass>,
        source: Observed<i64>,
        parts: Observed<OrdSet<Mutable>>,
        part: Observed<Option<Mutable>>,
    }

    /// Observers that rebuild their parts whenever `source` changes. The
    /// construction reason follows `source`; the identity does not.
    fn factory() -> Factory {
        let source: Observed<i64> = Observed::new("source", 1);
        let parts: Observed<OrdSet<Mutable>> = Setable::builder("parts", OrdSet::new()).containment().observed();
        let part: Observed<Option<Mutable>> = Setable::builder("part", None).containment().observed();
        let pieces = MutableClass::plain("Piece");
        let many = {
            let (source, parts, pieces) = (source.clone(), parts.clone(), pieces.clone());
            Observer::new("many", move |tx, m| {
                let n = tx.get(m, &source);
                let made = tx.construct(n, NewableSpec::new(&pieces, "piece").identity("piece"))?;
                tx.set(m, &parts, OrdSet::unit(made))
            })
        };
        let single = {
            let (source, part, pieces) = (source.clone(), part.clone(), pieces.clone());
            Observer::new("single", move |tx, m| {
                let n = tx.get(m, &source);
                let made = tx.construct(n, NewableSpec::new(&pieces, "single").identity("single"))?;
                tx.set(m, &part, Some(made))
            })
        };
        let class = MutableClass::builder("Factory")
            .setable(&source)
            .setable(&parts)
            .setable(&part)
            .observer(&many)
            .observer(&single)
            .build();
        Factory {
            class,
            source,
            parts,
            part,
        }
    }

    #[test]
    fn test_rebuilt_parts_keep_their_identity() {
        let model = model();
        let factory = factory();
        let engine = Engine::new(model.universe.clone(), EngineConfig::sequential()).unwrap();
        let f = Mutable::new(&factory.class, "factory");
        let state = engine.run_action(&engine.empty_state(), &add(&model, &f), None).unwrap();
        let first = factory.parts.get(&state, &f);
        assert_eq!(first.len(), 1);
        let piece = first.iter().next().cloned().unwrap();
        let single = factory.part.get(&state, &f).unwrap();
        assert!(piece.is_newable() && single.is_newable());
        assert_eq!(piece.parent(&state).map(|p| p.mutable), Some(f.clone()));

        let source = factory.source.clone();
        let bump = Action::new("bump", move |tx, m| tx.set(m, &source, 2));
        let state = engine.run_action(&state, &bump, Some(&f)).unwrap();
        assert_eq!(factory.parts.get(&state, &f), OrdSet::unit(piece.clone()));
        assert_eq!(factory.part.get(&state, &f), Some(single.clone()));
        assert_eq!(piece.parent(&state).map(|p| p.mutable), Some(f.clone()));
        assert_eq!(single.parent(&state).map(|p| p.mutable), Some(f));
        assert_eq!(state.objects().count(), 4);
    }
}
