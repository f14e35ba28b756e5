//! Bug2 obstacle avoidance on the horizontal plane.
//!
//! The walker tracks the start-goal line, stepping to whichever neighbor
//! gets closer to the goal while staying nearest the line. When every such
//! neighbor is blocked it follows the obstacle boundary with a fixed hand
//! on the wall. It
//! leaves the boundary once it stands on the start-goal line closer to the
//! goal than the last point where it left (or hit) the line, and the cell
//! toward the goal is free.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::geometry::{distance_to_segment_xz, horizontal_distance, BlockPos, Direction, Position};
use crate::sandbox::error::{SandboxError, SandboxResult};

/// Which hand stays on the wall while following a boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Handedness {
    Left,
    #[default]
    Right,
}

impl Handedness {
    /// Turn taken when a wall appears straight ahead.
    fn away_from_wall(self, heading: Direction) -> Direction {
        match self {
            Handedness::Right => heading.turn_left(),
            Handedness::Left => heading.turn_right(),
        }
    }

    /// Boundary-following preference: wall side, straight, away, back.
    fn preference(self, heading: Direction) -> [Direction; 4] {
        match self {
            Handedness::Right => [
                heading.turn_right(),
                heading,
                heading.turn_left(),
                heading.reverse(),
            ],
            Handedness::Left => [
                heading.turn_left(),
                heading,
                heading.turn_right(),
                heading.reverse(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Bug2Options {
    pub handedness: Handedness,
    pub max_iterations: usize,
    pub goal_tolerance: f64,
    /// Maximum perpendicular distance from the start-goal segment that
    /// still counts as being on the line.
    pub line_tolerance: f64,
}

impl Default for Bug2Options {
    fn default() -> Self {
        Self {
            handedness: Handedness::Right,
            max_iterations: 2_000,
            goal_tolerance: 0.5,
            line_tolerance: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bug2Result {
    /// Waypoints with collinear intermediates removed.
    pub path: Vec<BlockPos>,
    /// Cells actually stepped through, start included.
    pub steps: usize,
    pub iterations: usize,
}

enum Mode {
    Direct,
    Boundary {
        heading: Direction,
        seen: HashSet<(BlockPos, Direction)>,
    },
}

/// Horizontal neighbors of `cur` that are closer to `goal`, nearest to the
/// start-goal segment first. Equal distances keep `Direction::HORIZONTAL`
/// order.
fn toward(cur: BlockPos, goal: BlockPos, line: (&Position, &Position)) -> Vec<Direction> {
    let here = dist(cur, goal);
    let mut dirs: Vec<(f64, Direction)> = Direction::HORIZONTAL
        .into_iter()
        .map(|d| (d, cur.step(d)))
        .filter(|(_, next)| dist(*next, goal) < here)
        .map(|(d, next)| (distance_to_segment_xz(&next.to_position(), line.0, line.1), d))
        .collect();
    dirs.sort_by(|a, b| a.0.total_cmp(&b.0));
    dirs.into_iter().map(|(_, d)| d).collect()
}

/// First direction in `dirs` whose neighbor is free.
fn first_free<F>(cur: BlockPos, dirs: &[Direction], is_blocked: &mut F) -> SandboxResult<Option<Direction>>
where
    F: FnMut(BlockPos) -> SandboxResult<bool>,
{
    for &dir in dirs {
        if !is_blocked(cur.step(dir))? {
            return Ok(Some(dir));
        }
    }
    Ok(None)
}

fn dist(a: BlockPos, b: BlockPos) -> f64 {
    horizontal_distance(&a.to_position(), &b.to_position())
}

/// Plan a route from `start` to `goal` at the start height.
pub fn bug2<F>(
    start: Position,
    goal: Position,
    mut is_blocked: F,
    opts: &Bug2Options,
) -> SandboxResult<Bug2Result>
where
    F: FnMut(BlockPos) -> SandboxResult<bool>,
{
    let s = start.floored();
    let g = {
        let g = goal.floored();
        BlockPos::new(g.x, s.y, g.z)
    };
    let (line_a, line_b) = (s.to_position(), g.to_position());
    let line = (&line_a, &line_b);

    let mut cur = s;
    let mut steps = vec![cur];
    let mut mode = Mode::Direct;
    let mut best = f64::INFINITY;

    for iteration in 0..opts.max_iterations {
        if dist(cur, g) <= opts.goal_tolerance {
            return Ok(Bug2Result {
                path: compress_collinear(&steps),
                steps: steps.len(),
                iterations: iteration,
            });
        }

        match &mut mode {
            Mode::Direct => {
                let dirs = toward(cur, g, line);
                let Some(&preferred) = dirs.first() else { continue };
                if let Some(dir) = first_free(cur, &dirs, &mut is_blocked)? {
                    cur = cur.step(dir);
                    steps.push(cur);
                    continue;
                }
                best = best.min(dist(cur, g));
                trace!(hit = %cur, "bug2 hit obstacle, following boundary");
                mode = Mode::Boundary {
                    heading: opts.handedness.away_from_wall(preferred),
                    seen: HashSet::new(),
                };
            }
            Mode::Boundary { heading, seen } => {
                let mut chosen = None;
                for dir in opts.handedness.preference(*heading) {
                    if !is_blocked(cur.step(dir))? {
                        chosen = Some(dir);
                        break;
                    }
                }
                let Some(dir) = chosen else {
                    return Err(SandboxError::PathNotFound {
                        iterations: iteration,
                        reason: format!("enclosed at {cur}"),
                    });
                };
                if !seen.insert((cur, dir)) {
                    return Err(SandboxError::PathNotFound {
                        iterations: iteration,
                        reason: "boundary loop, goal unreachable".into(),
                    });
                }
                *heading = dir;
                cur = cur.step(dir);
                steps.push(cur);

                let here = dist(cur, g);
                let on_line =
                    distance_to_segment_xz(&cur.to_position(), &line_a, &line_b) <= opts.line_tolerance;
                if on_line && here < best {
                    let dirs = toward(cur, g, line);
                    let direct_free = dirs.is_empty() || first_free(cur, &dirs, &mut is_blocked)?.is_some();
                    if direct_free {
                        best = here;
                        trace!(leave = %cur, "bug2 leaving boundary");
                        mode = Mode::Direct;
                    }
                }
            }
        }
    }

    Err(SandboxError::PathNotFound {
        iterations: opts.max_iterations,
        reason: "iteration cap reached".into(),
    })
}

/// Drop waypoints that lie on a straight run between their neighbors.
pub fn compress_collinear(path: &[BlockPos]) -> Vec<BlockPos> {
    if path.len() <= 2 {
        return path.to_vec();
    }
    let delta = |a: BlockPos, b: BlockPos| (b.x - a.x, b.y - a.y, b.z - a.z);
    let mut out = vec![path[0]];
    for w in path.windows(3) {
        if delta(w[0], w[1]) != delta(w[1], w[2]) {
            out.push(w[1]);
        }
    }
    if let Some(&last) = path.last() {
        out.push(last);
    }
    out
}
