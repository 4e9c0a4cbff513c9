//! Error types for the engine

use std::fmt;

use thiserror::Error;

/// A single failed consistency check, collected per top-level action
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsistencyViolation {
    /// A mandatory property is empty on a live object
    EmptyMandatory { object: String, property: String },
    /// A value lies outside its declared scope
    OutOfScope {
        object: String,
        property: String,
        value: String,
    },
    /// A live object references an object that has no parent
    ReferencedOrphan {
        object: String,
        property: String,
        orphan: String,
    },
    /// An observer finished its last run with an unrecovered error
    ObserverFailed {
        object: String,
        observer: String,
        message: String,
    },
    /// An orphan still carries state after orphan clearing
    OrphanState { object: String, properties: usize },
}

impl fmt::Display for ConsistencyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsistencyViolation::EmptyMandatory { object, property } => {
                write!(f, "empty mandatory {}.{}", object, property)
            }
            ConsistencyViolation::OutOfScope {
                object,
                property,
                value,
            } => write!(f, "{}.{} = {} is out of scope", object, property, value),
            ConsistencyViolation::ReferencedOrphan {
                object,
                property,
                orphan,
            } => write!(f, "{}.{} references orphan {}", object, property, orphan),
            ConsistencyViolation::ObserverFailed {
                object,
                observer,
                message,
            } => write!(f, "observer {} on {} failed: {}", observer, object, message),
            ConsistencyViolation::OrphanState { object, properties } => {
                write!(f, "orphan {} still has {} properties", object, properties)
            }
        }
    }
}

/// Core engine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    // Merge errors
    #[error("Merge conflict on {object}.{property}: base {base}, branches {values:?}")]
    MergeConflict {
        object: String,
        property: String,
        base: String,
        values: Vec<String>,
    },

    // Determinism errors
    #[error("Non-deterministic value for {key}: {first} <> {second}")]
    NonDeterministic {
        key: String,
        first: String,
        second: String,
    },

    // Consistency errors
    #[error("Consistency violations: {}", join_violations(.0))]
    Consistency(Vec<ConsistencyViolation>),

    // Runaway computation
    #[error("Too many changes by {observer} on {mutable} ({changes} changes)\n{trace}")]
    TooManyChanges {
        observer: String,
        mutable: String,
        changes: usize,
        trace: String,
    },

    #[error("Too many observed by {observer} on {mutable}: {observed} > {limit}")]
    TooManyObserved {
        observer: String,
        mutable: String,
        observed: usize,
        limit: usize,
    },

    #[error("Too many observers of {object}.{property}: {observers} > {limit}")]
    TooManyObservers {
        object: String,
        property: String,
        observers: usize,
        limit: usize,
    },

    // Derivation errors
    #[error("Circular constant derivation: {}", .chain.join(" -> "))]
    CircularConstant { chain: Vec<String> },

    #[error("Constant derivation too deep ({} pending)", .chain.len())]
    ConstantDepthOverflow { chain: Vec<String> },

    // Context errors
    #[error("No current transaction on this thread")]
    NoCurrentTransaction,

    // Rule errors
    #[error("Rule failed: {0}")]
    Rule(String),

    // Driver errors
    #[error("Universe killed")]
    Killed,

    #[error("Universe stopped")]
    Stopped,

    #[error("Universe driver disconnected")]
    Disconnected,

    #[error("Failed to spawn engine thread: {0}")]
    Spawn(String),
}

fn join_violations(violations: &[ConsistencyViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl EngineError {
    /// Build a rule failure from any displayable error
    pub fn rule(message: impl fmt::Display) -> Self {
        EngineError::Rule(message.to_string())
    }

    /// Fatal errors abort the whole universe; the others are stored on the
    /// failing observer and surface in the consistency pass.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            EngineError::Rule(_) | EngineError::Consistency(_) | EngineError::NoCurrentTransaction
        )
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
