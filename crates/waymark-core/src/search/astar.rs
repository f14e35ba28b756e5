//! A* over the 6-connected block lattice.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use serde::{Deserialize, Serialize};

use crate::geometry::{euclidean, BlockPos, Direction};
use crate::sandbox::error::{SandboxError, SandboxResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathfindOptions {
    /// Expanded nodes before giving up.
    pub max_iterations: usize,
    /// A cell within this distance of the goal counts as arrival.
    pub goal_tolerance: f64,
    /// Allow up/down moves. Disabled, the search stays on the start height.
    pub allow_vertical: bool,
}

impl Default for PathfindOptions {
    fn default() -> Self {
        Self {
            max_iterations: 10_000,
            goal_tolerance: 0.5,
            allow_vertical: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathResult {
    /// Start and end inclusive.
    pub path: Vec<BlockPos>,
    pub cost: u32,
    pub iterations: usize,
}

#[derive(Debug)]
struct OpenNode {
    f: u32,
    h: u32,
    g: u32,
    cell: BlockPos,
}

impl OpenNode {
    // Equal f prefers the smaller heuristic, then the lexicographically
    // smaller cell.
    fn key(&self) -> (u32, u32, BlockPos) {
        (self.f, self.h, self.cell)
    }
}

impl PartialEq for OpenNode {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for OpenNode {}

impl PartialOrd for OpenNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpenNode {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so BinaryHeap pops the smallest key.
        other.key().cmp(&self.key())
    }
}

fn reconstruct(came_from: &HashMap<BlockPos, BlockPos>, mut current: BlockPos) -> Vec<BlockPos> {
    let mut out = vec![current];
    while let Some(&prev) = came_from.get(&current) {
        current = prev;
        out.push(current);
    }
    out.reverse();
    out
}

/// Shortest path from `start` to `goal` avoiding cells for which
/// `is_blocked` returns `true`. The start cell itself is never tested.
///
/// Neighbors expand in the order north, east, south, west, up, down and
/// ties resolve deterministically, so a fixed obstacle map always yields
/// the same path.
pub fn pathfind<F>(
    start: BlockPos,
    goal: BlockPos,
    mut is_blocked: F,
    opts: &PathfindOptions,
) -> SandboxResult<PathResult>
where
    F: FnMut(BlockPos) -> bool,
{
    let goal_pos = goal.to_position();
    let arrived = |cell: BlockPos| euclidean(&cell.to_position(), &goal_pos) <= opts.goal_tolerance;
    let directions: &[Direction] = if opts.allow_vertical {
        &Direction::ALL
    } else {
        &Direction::HORIZONTAL
    };

    if opts.goal_tolerance < 1.0 && start != goal && is_blocked(goal) {
        return Err(SandboxError::PathNotFound {
            iterations: 0,
            reason: format!("goal {goal} is blocked"),
        });
    }

    let mut open = BinaryHeap::new();
    let mut g_score: HashMap<BlockPos, u32> = HashMap::new();
    let mut came_from: HashMap<BlockPos, BlockPos> = HashMap::new();
    let mut blocked_cache: HashMap<BlockPos, bool> = HashMap::new();

    let h0 = start.manhattan(goal);
    g_score.insert(start, 0);
    open.push(OpenNode {
        f: h0,
        h: h0,
        g: 0,
        cell: start,
    });

    let mut iterations = 0usize;
    while let Some(node) = open.pop() {
        if g_score.get(&node.cell).is_some_and(|&g| node.g > g) {
            // Stale heap entry.
            continue;
        }
        if arrived(node.cell) {
            return Ok(PathResult {
                path: reconstruct(&came_from, node.cell),
                cost: node.g,
                iterations,
            });
        }
        if iterations >= opts.max_iterations {
            return Err(SandboxError::PathNotFound {
                iterations,
                reason: "iteration cap reached".into(),
            });
        }
        iterations += 1;

        for &dir in directions {
            let next = node.cell.step(dir);
            let blocked = *blocked_cache
                .entry(next)
                .or_insert_with(|| is_blocked(next));
            if blocked {
                continue;
            }
            let tentative = node.g.saturating_add(1);
            if g_score.get(&next).is_some_and(|&g| tentative >= g) {
                continue;
            }
            g_score.insert(next, tentative);
            came_from.insert(next, node.cell);
            let h = next.manhattan(goal);
            open.push(OpenNode {
                f: tentative.saturating_add(h),
                h,
                g: tentative,
                cell: next,
            });
        }
    }

    Err(SandboxError::PathNotFound {
        iterations,
        reason: "open set exhausted".into(),
    })
}
