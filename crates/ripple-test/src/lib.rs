//! Ripple Test Harness - Reference model, scenarios and end-to-end checks
//!
//! This crate provides:
//! - A reference model (nodes copying and summing values up a tree)
//! - A seeded scenario runner comparing sequential and parallel execution
//! - End-to-end checks through the universe driver

#![recursion_limit = "512"]

pub mod integration;
pub mod model;
pub mod scenario;

pub use integration::*;
pub use model::*;
pub use scenario::*;
