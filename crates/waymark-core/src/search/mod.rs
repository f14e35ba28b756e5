//! Deterministic spatial search and pathfinding.
//!
//! Exploration strategies ([`expand_square`], [`spiral`], [`random_walk`])
//! drive an [`AgentControl`](crate::agent::AgentControl) through candidate
//! cells and stop at the first cell where a caller predicate holds.
//! Planners ([`pathfind`], [`bug2`]) are pure functions over an obstacle
//! predicate and never touch the agent.
//!
//! Identical inputs always enumerate identical positions in identical order.

pub mod astar;
pub mod bug2;
pub mod explore;
pub mod ring;

use serde::{Deserialize, Serialize};

use crate::geometry::Position;
use crate::sandbox::error::SandboxError;

pub use astar::{pathfind, PathResult, PathfindOptions};
pub use bug2::{bug2, compress_collinear, Bug2Options, Bug2Result, Handedness};
pub use explore::{
    expand_square, random_walk, spiral, spiral_cells, ExpandOptions, RandomWalkOptions,
    SpiralOptions,
};
pub use ring::{ring, ring_size, rings};

/// Counters accumulated while exploring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchStats {
    /// Positions reached and tested against the predicate.
    pub positions_visited: usize,
    /// Positions abandoned because navigation could not reach them.
    pub skipped: usize,
    /// Ring (Chebyshev shell) of the last position attempted.
    pub ring: u32,
    /// Euclidean distance travelled between reached positions.
    pub distance: f64,
    pub elapsed_ms: u64,
}

/// Outcome of an exploration. `found` is `None` when the area was
/// exhausted without the predicate holding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchReport {
    pub found: Option<Position>,
    pub stats: SearchStats,
}

impl SearchReport {
    pub fn is_found(&self) -> bool {
        self.found.is_some()
    }
}

/// Navigation failures that mean "this cell is unreachable" rather than
/// "the search cannot continue".
pub fn is_skippable(err: &SandboxError) -> bool {
    matches!(
        err,
        SandboxError::OperationFailed(_)
            | SandboxError::PathNotFound { .. }
            | SandboxError::Precondition(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::Capability;

    #[test]
    fn test_only_world_errors_are_skippable() {
        assert!(is_skippable(&SandboxError::OperationFailed("blocked".into())));
        assert!(is_skippable(&SandboxError::PathNotFound {
            iterations: 3,
            reason: "x".into()
        }));
        assert!(!is_skippable(&SandboxError::Disconnected("gone".into())));
        assert!(!is_skippable(&SandboxError::Timeout { limit_ms: 1 }));
        assert!(!is_skippable(&SandboxError::BudgetExceeded {
            capability: Capability::Move,
            limit: 2
        }));
    }
}
