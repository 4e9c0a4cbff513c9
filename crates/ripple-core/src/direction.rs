//! Scheduling directions

use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-mutable queue a unit of work waits in
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum Direction {
    /// Reactive re-run of observers whose inputs changed
    Forward,
    /// Observers whose write was forced back and must reconcile next pass
    Backward,
    /// Work currently being drained
    Scheduled,
}

impl Direction {
    pub const ALL: [Direction; 3] = [Direction::Forward, Direction::Backward, Direction::Scheduled];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Direction::Forward => 0,
            Direction::Backward => 1,
            Direction::Scheduled => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
            Direction::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
