//! Ripple Core - Fundamental types shared by every engine layer
//!
//! This crate defines:
//! - Identifiers (ObjectId, SetableId, ActionId, UniverseId)
//! - Scheduling directions
//! - The engine error taxonomy
//! - The immutable engine configuration record

pub mod config;
pub mod direction;
pub mod error;
pub mod id;

pub use config::*;
pub use direction::*;
pub use error::*;
pub use id::*;
