//! Engine configuration
//!
//! One immutable record, shared by every transaction of a universe.
//! Guardrail ceilings only apply in dev mode; outside dev mode
//! [`EngineConfig::ceiling`] reports them as unbounded.

use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Engine configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Enables guardrails and extra checking
    pub dev_mode: bool,
    /// Verify that cleared orphans carry no state
    pub check_orphan_state: bool,
    /// Run every batch serially instead of branching in parallel
    pub run_sequential: bool,
    /// Worker pool size (0 = number of cores)
    pub parallelism: usize,

    pub trace_universe: bool,
    pub trace_mutable: bool,
    pub trace_actions: bool,
    pub trace_matching: bool,
    pub trace_ripple_out: bool,
    pub trace_derivation: bool,

    /// Maximum queued input messages
    pub max_in_in_queue: usize,
    /// Maximum changes within one top-level action
    pub max_total_nr_of_changes: usize,
    /// Maximum changes per observer instance within one top-level action
    pub max_nr_of_changes: usize,
    /// Maximum distinct observed properties per observer run
    pub max_nr_of_observed: usize,
    /// Maximum observers registered on one observed property of one object
    pub max_nr_of_observers: usize,
    /// Maximum retained history depth
    pub max_nr_of_history: usize,
    /// Constant derivation depth before pending derivations are unrolled
    pub max_constant_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            dev_mode: true,
            check_orphan_state: true,
            run_sequential: false,
            parallelism: 0,
            trace_universe: false,
            trace_mutable: false,
            trace_actions: false,
            trace_matching: false,
            trace_ripple_out: false,
            trace_derivation: false,
            max_in_in_queue: 100,
            max_total_nr_of_changes: 10000,
            max_nr_of_changes: 200,
            max_nr_of_observed: 1000,
            max_nr_of_observers: 1000,
            max_nr_of_history: 64,
            max_constant_depth: 256,
        }
    }
}

impl EngineConfig {
    /// Development profile: guardrails and orphan checking on
    pub fn dev() -> Self {
        Self::default()
    }

    /// Production profile: no guardrails, no orphan state verification
    pub fn production() -> Self {
        EngineConfig {
            dev_mode: false,
            check_orphan_state: false,
            ..Self::default()
        }
    }

    /// Single-threaded profile
    pub fn sequential() -> Self {
        EngineConfig {
            run_sequential: true,
            ..Self::default()
        }
    }

    pub fn with_sequential(mut self, sequential: bool) -> Self {
        self.run_sequential = sequential;
        self
    }

    pub fn with_history(mut self, depth: usize) -> Self {
        self.max_nr_of_history = depth;
        self
    }

    pub fn with_max_changes(mut self, per_instance: usize, total: usize) -> Self {
        self.max_nr_of_changes = per_instance;
        self.max_total_nr_of_changes = total;
        self
    }

    /// Effective ceiling for a guardrail limit
    #[inline]
    pub fn ceiling(&self, limit: usize) -> usize {
        if self.dev_mode {
            limit
        } else {
            usize::MAX
        }
    }

    /// Defaults overlaid with `RIPPLE_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        overlay(&mut config.dev_mode, "RIPPLE_DEV_MODE");
        overlay(&mut config.check_orphan_state, "RIPPLE_CHECK_ORPHAN_STATE");
        overlay(&mut config.run_sequential, "RIPPLE_SEQUENTIAL");
        overlay(&mut config.parallelism, "RIPPLE_PARALLELISM");
        overlay(&mut config.trace_universe, "RIPPLE_TRACE_UNIVERSE");
        overlay(&mut config.trace_mutable, "RIPPLE_TRACE_MUTABLE");
        overlay(&mut config.trace_actions, "RIPPLE_TRACE_ACTIONS");
        overlay(&mut config.trace_matching, "RIPPLE_TRACE_MATCHING");
        overlay(&mut config.trace_ripple_out, "RIPPLE_TRACE_RIPPLE_OUT");
        overlay(&mut config.trace_derivation, "RIPPLE_TRACE_DERIVATION");
        overlay(&mut config.max_in_in_queue, "RIPPLE_MAX_IN_IN_QUEUE");
        overlay(
            &mut config.max_total_nr_of_changes,
            "RIPPLE_MAX_TOTAL_NR_OF_CHANGES",
        );
        overlay(&mut config.max_nr_of_changes, "RIPPLE_MAX_NR_OF_CHANGES");
        overlay(&mut config.max_nr_of_observed, "RIPPLE_MAX_NR_OF_OBSERVED");
        overlay(&mut config.max_nr_of_observers, "RIPPLE_MAX_NR_OF_OBSERVERS");
        overlay(&mut config.max_nr_of_history, "RIPPLE_MAX_NR_OF_HISTORY");
        overlay(&mut config.max_constant_depth, "RIPPLE_MAX_CONSTANT_DEPTH");
        config
    }
}

fn overlay<T: FromStr>(field: &mut T, key: &str) {
    if let Ok(raw) = env::var(key) {
        match raw.trim().parse() {
            Ok(value) => *field = value,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring malformed config override"),
        }
    }
}
