//! Guardrails against runaway reactive loops
//!
//! Counters are reset at the start of every top-level action. Crossing a
//! change ceiling turns the universe into debugging mode, in which every
//! observer run leaves an [`ObserverTrace`]; crossing the looser bound is
//! fatal and reports the latest trace.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use ripple_core::{ActionId, EngineConfig, ObjectId};

use crate::{Action, Mutable, Value};

/// Longest chain of traces kept, latest run included
pub const MAX_TRACE_DEPTH: usize = 8;

/// Who read and wrote what in one observer run
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ObserverTrace {
    pub mutable: Mutable,
    pub observer: Arc<str>,
    pub reads: Vec<String>,
    pub writes: Vec<String>,
    pub changes: usize,
    pub previous: Option<Arc<ObserverTrace>>,
}

impl Value for ObserverTrace {}

impl ObserverTrace {
    /// Trace of a new run, keeping a bounded chain of predecessors
    pub fn chained(mut self, previous: Option<Arc<ObserverTrace>>) -> Self {
        self.previous = previous.map(|p| Arc::new(p.truncated(MAX_TRACE_DEPTH - 2)));
        self
    }

    fn truncated(&self, depth: usize) -> ObserverTrace {
        let mut copy = self.clone();
        copy.previous = match (&self.previous, depth) {
            (_, 0) | (None, _) => None,
            (Some(p), _) => Some(Arc::new(p.truncated(depth - 1))),
        };
        copy
    }

    pub fn depth(&self) -> usize {
        1 + self.previous.as_ref().map_or(0, |p| p.depth())
    }

    /// Multi-line rendering, latest run first
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut current = Some(self);
        while let Some(trace) = current {
            let _ = writeln!(
                out,
                "  {}.{} changes={} read=[{}] wrote=[{}]",
                trace.mutable,
                trace.observer,
                trace.changes,
                trace.reads.join(", "),
                trace.writes.join(", ")
            );
            current = trace.previous.as_deref();
        }
        out
    }
}

/// Outcome of counting the changes of one observer run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeVerdict {
    Ok,
    /// Debugging: record a trace
    Trace,
    /// Looser bound exceeded
    Fatal,
}

/// Per-universe counters
pub struct UniverseStatistics {
    config: Arc<EngineConfig>,
    run_id: AtomicU64,
    total_changes: AtomicUsize,
    debugging: AtomicBool,
    instance_changes: DashMap<(ActionId, ObjectId), usize>,
    stopped: DashMap<(ActionId, ObjectId), usize>,
}

impl UniverseStatistics {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        UniverseStatistics {
            config,
            run_id: AtomicU64::new(0),
            total_changes: AtomicUsize::new(0),
            debugging: AtomicBool::new(false),
            instance_changes: DashMap::new(),
            stopped: DashMap::new(),
        }
    }

    /// Reset counters for a new top-level action
    pub fn start_action(&self) -> u64 {
        self.total_changes.store(0, Ordering::Relaxed);
        self.debugging.store(false, Ordering::Relaxed);
        self.instance_changes.clear();
        self.stopped.clear();
        self.run_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn run_id(&self) -> u64 {
        self.run_id.load(Ordering::Relaxed)
    }

    pub fn is_debugging(&self) -> bool {
        self.debugging.load(Ordering::Relaxed)
    }

    pub fn total_changes(&self) -> usize {
        self.total_changes.load(Ordering::Relaxed)
    }

    pub fn instance_changes(&self, observer: &Action, mutable: &Mutable) -> usize {
        self.instance_changes
            .get(&(observer.id(), mutable.id()))
            .map_or(0, |c| *c)
    }

    /// Stopped observers are skipped until the next top-level action
    pub fn is_stopped(&self, observer: &Action, mutable: &Mutable) -> bool {
        self.stopped.contains_key(&(observer.id(), mutable.id()))
    }

    pub fn max_observed(&self) -> usize {
        self.config.ceiling(self.config.max_nr_of_observed)
    }

    pub fn max_observers(&self) -> usize {
        self.config.ceiling(self.config.max_nr_of_observers)
    }

    /// Count the changes of one observer run and decide on escalation
    pub fn record_changes(&self, observer: &Action, mutable: &Mutable, changes: usize) -> ChangeVerdict {
        if changes == 0 {
            return if self.is_debugging() {
                ChangeVerdict::Trace
            } else {
                ChangeVerdict::Ok
            };
        }
        let key = (observer.id(), mutable.id());
        let instance = {
            let mut count = self.instance_changes.entry(key).or_insert(0);
            *count += changes;
            *count
        };
        let total = self.total_changes.fetch_add(changes, Ordering::Relaxed) + changes;
        let per_instance = self.config.ceiling(self.config.max_nr_of_changes);
        let overall = self.config.ceiling(self.config.max_total_nr_of_changes);

        if instance > per_instance.saturating_mul(2) || total > overall.saturating_add(per_instance) {
            self.stopped.insert(key, instance);
            return ChangeVerdict::Fatal;
        }
        if instance > per_instance || total > overall {
            if !self.debugging.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    observer = observer.name(),
                    mutable = %mutable,
                    instance,
                    total,
                    "change ceiling exceeded, recording observer traces"
                );
            }
            return ChangeVerdict::Trace;
        }
        if self.is_debugging() {
            ChangeVerdict::Trace
        } else {
            ChangeVerdict::Ok
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MutableClass;

    fn stats(per_instance: usize, total: usize) -> UniverseStatistics {
        UniverseStatistics::new(Arc::new(
            EngineConfig::dev().with_max_changes(per_instance, total),
        ))
    }

    #[test]
    fn test_escalation_per_instance() {
        let stats = stats(2, 100);
        let observer = Action::new("o", |_, _| Ok(()));
        let m = Mutable::new(&MutableClass::plain("M"), "m");
        stats.start_action();
        assert_eq!(stats.record_changes(&observer, &m, 2), ChangeVerdict::Ok);
        assert_eq!(stats.record_changes(&observer, &m, 1), ChangeVerdict::Trace);
        assert!(stats.is_debugging());
        assert_eq!(stats.record_changes(&observer, &m, 2), ChangeVerdict::Fatal);
        assert!(stats.is_stopped(&observer, &m));

        stats.start_action();
        assert!(!stats.is_debugging());
        assert!(!stats.is_stopped(&observer, &m));
        assert_eq!(stats.instance_changes(&observer, &m), 0);
    }

    #[test]
    fn test_escalation_total() {
        let stats = stats(10, 5);
        let class = MutableClass::plain("M");
        let observer = Action::new("o", |_, _| Ok(()));
        stats.start_action();
        for i in 0..5 {
            let m = Mutable::new(&class, format!("m{}", i));
            assert_ne!(stats.record_changes(&observer, &m, 1), ChangeVerdict::Fatal);
        }
        let m = Mutable::new(&class, "last");
        assert_eq!(stats.record_changes(&observer, &m, 1), ChangeVerdict::Trace);
        assert_eq!(stats.record_changes(&observer, &m, 10), ChangeVerdict::Fatal);
    }

    #[test]
    fn test_production_never_escalates() {
        let stats = UniverseStatistics::new(Arc::new(EngineConfig::production()));
        let observer = Action::new("o", |_, _| Ok(()));
        let m = Mutable::new(&MutableClass::plain("M"), "m");
        stats.start_action();
        assert_eq!(stats.record_changes(&observer, &m, 1_000_000), ChangeVerdict::Ok);
    }

    #[test]
    fn test_trace_chain_is_bounded() {
        let m = Mutable::new(&MutableClass::plain("M"), "m");
        let trace = |n: usize| ObserverTrace {
            mutable: m.clone(),
            observer: "o".into(),
            reads: vec![],
            writes: vec![format!("v{}", n)],
            changes: n,
            previous: None,
        };
        let mut latest: Option<Arc<ObserverTrace>> = None;
        for n in 0..20 {
            latest = Some(Arc::new(trace(n).chained(latest)));
        }
        let latest = latest.unwrap();
        assert_eq!(latest.depth(), MAX_TRACE_DEPTH);
        assert!(latest.render().starts_with("  m.o changes=19"));
    }
}
