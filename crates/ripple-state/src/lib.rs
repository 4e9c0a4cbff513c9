//! Ripple State Store - Immutable versioned snapshots of the object model
//!
//! This crate implements the persistent state store:
//! - Type-erased property values
//! - Copy-on-write get/set over a persistent ordered map
//! - Lazy, restartable object/property diffs
//! - Three-way+ merge with pluggable conflict and change handling

pub mod datum;
pub mod diff;
pub mod merge;
pub mod state;

pub use datum::*;
pub use diff::*;
pub use merge::*;
pub use state::*;
