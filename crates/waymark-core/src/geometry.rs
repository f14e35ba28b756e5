//! Geometry helpers over 3D world positions.
//!
//! Positions are continuous (`f64`) but every search and comparison that
//! needs identity works on the floored lattice cell ([`BlockPos`]). The
//! horizontal plane is `x`/`z`; `y` is height. North is `-z`, east is `+x`.

use serde::{Deserialize, Serialize};

/// Largest absolute coordinate accepted from scripts on any axis.
pub const COORD_LIMIT: f64 = 30_000_000.0;

/// A continuous world position.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// The lattice cell containing this position.
    pub fn floored(&self) -> BlockPos {
        BlockPos::new(
            self.x.floor() as i32,
            self.y.floor() as i32,
            self.z.floor() as i32,
        )
    }

    pub fn offset(&self, dx: f64, dy: f64, dz: f64) -> Self {
        Self::new(self.x + dx, self.y + dy, self.z + dz)
    }

    pub fn sub(&self, other: &Position) -> Self {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }

    pub fn length(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Finite and within [`COORD_LIMIT`] on every axis.
    pub fn in_world_range(&self) -> bool {
        [self.x, self.y, self.z]
            .iter()
            .all(|c| c.is_finite() && c.abs() <= COORD_LIMIT)
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.2})", self.x, self.y, self.z)
    }
}

/// An integral lattice cell. Ordering is lexicographic on `(x, y, z)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub fn to_position(self) -> Position {
        Position::new(self.x as f64, self.y as f64, self.z as f64)
    }

    /// Neighbor cell; saturates at the `i32` edge.
    pub fn step(self, dir: Direction) -> Self {
        let (dx, dy, dz) = dir.delta();
        Self::new(
            self.x.saturating_add(dx),
            self.y.saturating_add(dy),
            self.z.saturating_add(dz),
        )
    }

    pub fn manhattan(self, other: BlockPos) -> u32 {
        self.x
            .abs_diff(other.x)
            .saturating_add(self.y.abs_diff(other.y))
            .saturating_add(self.z.abs_diff(other.z))
    }

    /// Horizontal Chebyshev distance, `max(|dx|, |dz|)`.
    pub fn chebyshev(self, other: BlockPos) -> u32 {
        self.x.abs_diff(other.x).max(self.z.abs_diff(other.z))
    }
}

impl std::fmt::Display for BlockPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Lattice move directions. The declaration order is the canonical
/// neighbor-expansion order used by the search engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    North,
    East,
    South,
    West,
    Up,
    Down,
}

impl Direction {
    pub const ALL: [Direction; 6] = [
        Direction::North,
        Direction::East,
        Direction::South,
        Direction::West,
        Direction::Up,
        Direction::Down,
    ];

    pub const HORIZONTAL: [Direction; 4] = [
        Direction::North,
        Direction::East,
        Direction::South,
        Direction::West,
    ];

    pub fn delta(self) -> (i32, i32, i32) {
        match self {
            Direction::North => (0, 0, -1),
            Direction::East => (1, 0, 0),
            Direction::South => (0, 0, 1),
            Direction::West => (-1, 0, 0),
            Direction::Up => (0, 1, 0),
            Direction::Down => (0, -1, 0),
        }
    }

    /// Clockwise quarter turn in the horizontal plane. Vertical directions
    /// are returned unchanged.
    pub fn turn_right(self) -> Self {
        match self {
            Direction::North => Direction::East,
            Direction::East => Direction::South,
            Direction::South => Direction::West,
            Direction::West => Direction::North,
            other => other,
        }
    }

    pub fn turn_left(self) -> Self {
        match self {
            Direction::North => Direction::West,
            Direction::West => Direction::South,
            Direction::South => Direction::East,
            Direction::East => Direction::North,
            other => other,
        }
    }

    pub fn reverse(self) -> Self {
        match self {
            Direction::North => Direction::South,
            Direction::South => Direction::North,
            Direction::East => Direction::West,
            Direction::West => Direction::East,
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
        }
    }
}

pub fn euclidean(a: &Position, b: &Position) -> f64 {
    a.sub(b).length()
}

pub fn horizontal_distance(a: &Position, b: &Position) -> f64 {
    let dx = a.x - b.x;
    let dz = a.z - b.z;
    (dx * dx + dz * dz).sqrt()
}

pub fn manhattan(a: &Position, b: &Position) -> f64 {
    (a.x - b.x).abs() + (a.y - b.y).abs() + (a.z - b.z).abs()
}

/// Horizontal Chebyshev distance, `max(|dx|, |dz|)`.
pub fn chebyshev(a: &Position, b: &Position) -> f64 {
    (a.x - b.x).abs().max((a.z - b.z).abs())
}

/// Number of cells [`line`] returns for `a -> b`.
pub fn line_len(a: BlockPos, b: BlockPos) -> u64 {
    let steps = a.x.abs_diff(b.x).max(a.y.abs_diff(b.y)).max(a.z.abs_diff(b.z));
    steps as u64 + 1
}

/// Lattice cells along the segment `a -> b`, both ends included.
///
/// Uses uniform stepping over the dominant axis so the result is
/// gap-free along that axis and identical for identical inputs. Callers
/// holding untrusted endpoints check [`line_len`] first.
pub fn line(a: BlockPos, b: BlockPos) -> Vec<BlockPos> {
    let dx = b.x as i64 - a.x as i64;
    let dy = b.y as i64 - a.y as i64;
    let dz = b.z as i64 - a.z as i64;
    let steps = dx.abs().max(dy.abs()).max(dz.abs());
    if steps == 0 {
        return vec![a];
    }

    let at = |origin: i32, delta: i64, t: f64| (origin as i64 + (delta as f64 * t).round() as i64) as i32;
    let mut out = Vec::with_capacity(steps as usize + 1);
    for i in 0..=steps {
        let t = i as f64 / steps as f64;
        let cell = BlockPos::new(at(a.x, dx, t), at(a.y, dy, t), at(a.z, dz, t));
        if out.last() != Some(&cell) {
            out.push(cell);
        }
    }
    out
}

/// Horizontal circle of lattice cells around `center` (midpoint algorithm).
///
/// Cells are deduplicated and returned in lexicographic order. At most
/// `8 * radius` cells come back.
pub fn circle(center: BlockPos, radius: u32) -> Vec<BlockPos> {
    if radius == 0 {
        return vec![center];
    }
    let r = radius as i32;
    let mut cells = Vec::new();
    let mut x = r;
    let mut z = 0;
    let mut err = 1 - r;
    while x >= z {
        for (ox, oz) in [
            (x, z),
            (z, x),
            (-z, x),
            (-x, z),
            (-x, -z),
            (-z, -x),
            (z, -x),
            (x, -z),
        ] {
            cells.push(BlockPos::new(
                center.x.saturating_add(ox),
                center.y,
                center.z.saturating_add(oz),
            ));
        }
        z += 1;
        if err < 0 {
            err += 2 * z + 1;
        } else {
            x -= 1;
            err += 2 * (z - x) + 1;
        }
    }
    cells.sort();
    cells.dedup();
    cells
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: Position,
    pub max: Position,
}

impl BoundingBox {
    /// Smallest box containing every point, or `None` for an empty input.
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Position>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = *iter.next()?;
        let mut bbox = Self {
            min: first,
            max: first,
        };
        for p in iter {
            bbox.min.x = bbox.min.x.min(p.x);
            bbox.min.y = bbox.min.y.min(p.y);
            bbox.min.z = bbox.min.z.min(p.z);
            bbox.max.x = bbox.max.x.max(p.x);
            bbox.max.y = bbox.max.y.max(p.y);
            bbox.max.z = bbox.max.z.max(p.z);
        }
        Some(bbox)
    }
}

/// Perpendicular distance from `p` to the segment `a -> b` in the
/// horizontal plane. Degenerate segments measure to `a`.
pub fn distance_to_segment_xz(p: &Position, a: &Position, b: &Position) -> f64 {
    let abx = b.x - a.x;
    let abz = b.z - a.z;
    let len_sq = abx * abx + abz * abz;
    if len_sq == 0.0 {
        return horizontal_distance(p, a);
    }
    let t = (((p.x - a.x) * abx + (p.z - a.z) * abz) / len_sq).clamp(0.0, 1.0);
    let proj = Position::new(a.x + t * abx, p.y, a.z + t * abz);
    horizontal_distance(p, &proj)
}
