//! Exploration strategies that move the agent cell by cell.

use std::collections::HashSet;
use std::future::Future;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::ring::ring;
use super::{is_skippable, SearchReport, SearchStats};
use crate::agent::{AgentControl, NavigateOptions};
use crate::geometry::{euclidean, BlockPos, Direction, Position};
use crate::obs;
use crate::rng::SeededRandom;
use crate::sandbox::error::SandboxResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpandOptions {
    pub radius: u32,
    pub nav: NavigateOptions,
}

impl Default for ExpandOptions {
    fn default() -> Self {
        Self {
            radius: 8,
            nav: NavigateOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpiralOptions {
    pub radius: u32,
    /// Cells advanced per spiral step. `0` behaves as `1`.
    pub step: u32,
    pub nav: NavigateOptions,
}

impl Default for SpiralOptions {
    fn default() -> Self {
        Self {
            radius: 8,
            step: 1,
            nav: NavigateOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomWalkOptions {
    pub radius: u32,
    pub max_steps: u32,
    pub min_len: u32,
    pub max_len: u32,
    /// Draws allowed per step before the walk gives up.
    pub max_redraws: u32,
    pub nav: NavigateOptions,
}

impl Default for RandomWalkOptions {
    fn default() -> Self {
        Self {
            radius: 8,
            max_steps: 64,
            min_len: 1,
            max_len: 3,
            max_redraws: 16,
            nav: NavigateOptions::default(),
        }
    }
}

/// Transient state of one exploration call.
struct SearchState {
    started: Instant,
    stats: SearchStats,
    last: Position,
}

impl SearchState {
    async fn begin(agent: &dyn AgentControl) -> SandboxResult<Self> {
        let here = agent.get_state().await?.position;
        Ok(Self {
            started: Instant::now(),
            stats: SearchStats::default(),
            last: here,
        })
    }

    /// Navigate to `target` and test it. Unreachable targets are skipped.
    async fn try_position<P, Fut>(
        &mut self,
        agent: &dyn AgentControl,
        target: Position,
        ring: u32,
        nav: &NavigateOptions,
        predicate: &mut P,
    ) -> SandboxResult<Option<Position>>
    where
        P: FnMut(Position) -> Fut,
        Fut: Future<Output = SandboxResult<bool>>,
    {
        self.stats.ring = ring;
        let reached = match agent.navigate_to(target, nav).await {
            Ok(outcome) if outcome.arrived => outcome.position,
            Ok(_) => {
                self.stats.skipped += 1;
                return Ok(None);
            }
            Err(err) if is_skippable(&err) => {
                trace!(%target, error = %err, "skipping unreachable position");
                self.stats.skipped += 1;
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        self.stats.distance += euclidean(&self.last, &reached);
        self.last = reached;
        self.stats.positions_visited += 1;

        if predicate(reached).await? {
            Ok(Some(reached))
        } else {
            Ok(None)
        }
    }

    fn finish(mut self, strategy: &str, found: Option<Position>) -> SearchReport {
        self.stats.elapsed_ms = self.started.elapsed().as_millis() as u64;
        obs::emit_search_finished(strategy, found.is_some(), &self.stats);
        SearchReport {
            found,
            stats: self.stats,
        }
    }
}

fn target_of(cell: BlockPos, center: &Position) -> Position {
    Position::new(cell.x as f64, center.y, cell.z as f64)
}

/// Visit every ring around `center` from 0 to `opts.radius`, stopping at
/// the first reached position for which `predicate` returns `true`.
pub async fn expand_square<P, Fut>(
    agent: &dyn AgentControl,
    center: Position,
    opts: &ExpandOptions,
    mut predicate: P,
) -> SandboxResult<SearchReport>
where
    P: FnMut(Position) -> Fut,
    Fut: Future<Output = SandboxResult<bool>>,
{
    let mut state = SearchState::begin(agent).await?;
    let origin = center.floored();
    for k in 0..=opts.radius {
        for cell in ring(origin, k) {
            let target = target_of(cell, &center);
            if let Some(found) = state
                .try_position(agent, target, k, &opts.nav, &mut predicate)
                .await?
            {
                return Ok(state.finish("expand_square", Some(found)));
            }
        }
    }
    Ok(state.finish("expand_square", None))
}

/// Square spiral from `center`: legs east, south, west, north of lengths
/// 1, 1, 2, 2, 3, 3, ... in units of `step`. Cells outside `radius` are
/// not emitted. Cells are produced lazily.
pub fn spiral_cells(center: BlockPos, radius: u32, step: u32) -> impl Iterator<Item = BlockPos> {
    let step = i64::from(step.max(1));
    let max_leg = 2 * (i64::from(radius) / step) + 1;
    let legs = [
        Direction::East,
        Direction::South,
        Direction::West,
        Direction::North,
    ];

    let moves = (0i64..)
        .map(move |n| (n / 2 + 1, legs[(n % 4) as usize]))
        .take_while(move |(len, _)| *len <= max_leg)
        .flat_map(|(len, dir)| std::iter::repeat(dir).take(len as usize));
    let cells = moves
        .scan((i64::from(center.x), i64::from(center.z)), move |cur, dir| {
            let (dx, _, dz) = dir.delta();
            cur.0 += i64::from(dx) * step;
            cur.1 += i64::from(dz) * step;
            Some(*cur)
        })
        .filter_map(move |(x, z)| {
            let cell = BlockPos::new(i32::try_from(x).ok()?, center.y, i32::try_from(z).ok()?);
            (cell.chebyshev(center) <= radius).then_some(cell)
        });
    std::iter::once(center).chain(cells)
}

pub async fn spiral<P, Fut>(
    agent: &dyn AgentControl,
    center: Position,
    opts: &SpiralOptions,
    mut predicate: P,
) -> SandboxResult<SearchReport>
where
    P: FnMut(Position) -> Fut,
    Fut: Future<Output = SandboxResult<bool>>,
{
    let mut state = SearchState::begin(agent).await?;
    let origin = center.floored();
    for cell in spiral_cells(origin, opts.radius, opts.step) {
        let ring = cell.chebyshev(origin);
        let target = target_of(cell, &center);
        if let Some(found) = state
            .try_position(agent, target, ring, &opts.nav, &mut predicate)
            .await?
        {
            return Ok(state.finish("spiral", Some(found)));
        }
    }
    Ok(state.finish("spiral", None))
}

/// Seeded random walk inside `opts.radius` of `center`.
///
/// Every direction and leg length comes from `rng`. Cells already visited
/// (by floored x, z) and cells outside the radius are redrawn up to
/// `opts.max_redraws` times; the walk ends early when no fresh cell can be
/// drawn. The walk continues from the last position actually reached.
pub async fn random_walk<P, Fut>(
    agent: &dyn AgentControl,
    center: Position,
    opts: &RandomWalkOptions,
    rng: &mut SeededRandom,
    mut predicate: P,
) -> SandboxResult<SearchReport>
where
    P: FnMut(Position) -> Fut,
    Fut: Future<Output = SandboxResult<bool>>,
{
    let mut state = SearchState::begin(agent).await?;
    let origin = center.floored();
    let min_len = opts.min_len.max(1) as i64;
    let max_len = (opts.max_len as i64).max(min_len);

    let mut visited: HashSet<(i32, i32)> = HashSet::new();
    visited.insert((origin.x, origin.z));
    if let Some(found) = state
        .try_position(agent, target_of(origin, &center), 0, &opts.nav, &mut predicate)
        .await?
    {
        return Ok(state.finish("random_walk", Some(found)));
    }

    let mut current = origin;
    for _ in 0..opts.max_steps {
        let mut next = None;
        for _ in 0..=opts.max_redraws {
            let Some(&dir) = rng.pick(&Direction::HORIZONTAL) else {
                break;
            };
            let len = rng.range_i64(min_len, max_len);
            let (dx, _, dz) = dir.delta();
            let shifted = |from: i32, d: i32| i32::try_from(i64::from(from) + i64::from(d) * len).ok();
            let (Some(x), Some(z)) = (shifted(current.x, dx), shifted(current.z, dz)) else {
                continue;
            };
            let candidate = BlockPos::new(x, origin.y, z);
            if candidate.chebyshev(origin) > opts.radius
                || visited.contains(&(candidate.x, candidate.z))
            {
                continue;
            }
            next = Some(candidate);
            break;
        }
        let Some(cell) = next else {
            trace!("random walk exhausted fresh cells");
            break;
        };
        visited.insert((cell.x, cell.z));

        let skipped_before = state.stats.skipped;
        let ring = cell.chebyshev(origin);
        if let Some(found) = state
            .try_position(agent, target_of(cell, &center), ring, &opts.nav, &mut predicate)
            .await?
        {
            return Ok(state.finish("random_walk", Some(found)));
        }
        if state.stats.skipped == skipped_before {
            current = cell;
        }
    }
    Ok(state.finish("random_walk", None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spiral_starts_at_center_and_goes_east_then_south() {
        let cells: Vec<_> = spiral_cells(BlockPos::new(0, 0, 0), 1, 1).collect();
        let xz: Vec<(i32, i32)> = cells.iter().map(|c| (c.x, c.z)).collect();
        assert_eq!(
            &xz[..5],
            &[(0, 0), (1, 0), (1, 1), (0, 1), (-1, 1)]
        );
        assert_eq!(cells.len(), 9);
    }

    #[test]
    fn test_spiral_covers_square_exactly_once() {
        let center = BlockPos::new(5, 2, -3);
        let cells: Vec<_> = spiral_cells(center, 3, 1).collect();
        let unique: HashSet<BlockPos> = cells.iter().copied().collect();
        assert_eq!(unique.len(), cells.len());
        assert_eq!(cells.len(), 49);
    }

    #[test]
    fn test_spiral_step_skips_cells() {
        let cells: Vec<_> = spiral_cells(BlockPos::new(0, 0, 0), 4, 2).collect();
        assert!(cells.iter().all(|c| c.x % 2 == 0 && c.z % 2 == 0));
        assert_eq!(cells.len(), 25);
    }

    #[test]
    fn test_spiral_with_huge_radius_is_lazy() {
        let first: Vec<_> = spiral_cells(BlockPos::new(0, 0, 0), u32::MAX, 1).take(3).collect();
        assert_eq!(
            first,
            vec![BlockPos::new(0, 0, 0), BlockPos::new(1, 0, 0), BlockPos::new(1, 0, 1)]
        );
    }

    #[test]
    fn test_spiral_near_the_i32_edge_drops_unrepresentable_cells() {
        let center = BlockPos::new(i32::MAX, 0, 0);
        let cells: Vec<_> = spiral_cells(center, 1, 1).collect();
        assert!(cells.iter().all(|c| c.x >= i32::MAX - 1));
        assert_eq!(cells.len(), 6);
    }
}
