//! Ripple Engine - Reactive, transactional computation over a mutable tree
//!
//! This crate implements:
//! - Mutables, classes and typed property descriptors (Setable / Observed)
//! - Actions and observers with read/write-set tracking
//! - The transaction hierarchy: leaf, observer and mutable transactions
//! - Parallel batch execution with merge and serial fallback
//! - Write-once derived constants with cycle detection
//! - Identity matching for objects constructed by observers
//! - Guardrails against runaway reactive loops

#![recursion_limit = "512"]

pub mod action;
pub mod consistency;
pub mod constant;
pub mod mutable;
pub mod newable;
pub mod setable;
pub mod stats;
pub mod transaction;
pub mod value;

pub use action::*;
pub use constant::*;
pub use mutable::*;
pub use newable::*;
pub use setable::*;
pub use stats::*;
pub use transaction::{Engine, LeafTx, MatchInfo, RunContext};
pub use value::*;

pub use ripple_core::*;

/// Snapshot of a universe: mutables to setable values
pub type State = ripple_state::State<Mutable, SetableRef>;
