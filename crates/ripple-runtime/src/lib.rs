//! Ripple Runtime - Driving a universe
//!
//! A universe owns one engine and serializes all changes through a single
//! driver thread:
//! 1. Messages arrive on a bounded input channel
//! 2. Each action runs against the latest committed state
//! 3. A settled, consistent result is committed and kept in history
//! 4. Subscribers receive the commit after it is visible
//!
//! Rejected actions are reported through `failures()`. Fatal errors stop
//! the driver and are handed to everyone waiting on it.

#![recursion_limit = "512"]

pub mod logging;
pub mod universe;

pub use logging::*;
pub use universe::*;
