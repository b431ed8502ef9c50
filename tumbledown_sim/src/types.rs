// Core types shared across the destruction simulation.
//
// Node identifiers, the 18 directional joint slots, wall cell variants, grid
// coordinates, and a handful of `[f32; 3]` vector helpers. Everything here is
// plain data with `Serialize`/`Deserialize` so a structure can be saved and
// replayed.
//
// Node IDs are compact `u32` newtypes handed out by a single monotonic counter
// on `Structure` (see `structure.rs`). They are never reused: once a member or
// wall is destroyed, any stale ID held by a pending task or a caller simply
// fails its arena lookup. That lookup is the liveness check every resumed
// cooperative step performs.
//
// **Critical constraint: determinism.** IDs come from a counter, never from
// addresses or hashing, and every arena keyed by them is a `BTreeMap`.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Node IDs
// ---------------------------------------------------------------------------

macro_rules! node_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

node_id!(
    /// A structural beam made of voxels.
    MemberId,
    "member"
);
node_id!(
    /// One destructible segment of a member.
    VoxelId,
    "voxel"
);
node_id!(
    /// A joint holding up to 18 member slots.
    ConnectionId,
    "connection"
);
node_id!(
    /// A 2-D grid of wall cells.
    WallId,
    "wall"
);
node_id!(
    /// One destructible wall grid cell.
    CellId,
    "cell"
);
node_id!(
    /// A batched run of cells or voxels sharing one combined shape.
    ChunkId,
    "chunk"
);
node_id!(
    /// A connected set of members, joints and walls on one rigid body.
    GroupId,
    "group"
);
node_id!(
    /// A piece of debris handed to the debris pool.
    FragmentId,
    "fragment"
);
node_id!(
    /// A pooled render/physics shell that a fragment occupies.
    ShellId,
    "shell"
);

/// Ground distance assigned to members with no path to a grounded member.
pub const UNREACHABLE: u32 = u32::MAX;

// ---------------------------------------------------------------------------
// Joint slots
// ---------------------------------------------------------------------------

/// The 18 directions a member can leave a joint in: six faces and twelve
/// edge diagonals.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Slot {
    Top,
    Bottom,
    Left,
    Right,
    Front,
    Back,
    TopRight,
    TopLeft,
    BottomRight,
    BottomLeft,
    FrontRight,
    FrontLeft,
    BackRight,
    BackLeft,
    TopFront,
    TopBack,
    BottomFront,
    BottomBack,
}

impl Slot {
    pub const COUNT: usize = 18;

    pub const ALL: [Slot; Slot::COUNT] = [
        Slot::Top,
        Slot::Bottom,
        Slot::Left,
        Slot::Right,
        Slot::Front,
        Slot::Back,
        Slot::TopRight,
        Slot::TopLeft,
        Slot::BottomRight,
        Slot::BottomLeft,
        Slot::FrontRight,
        Slot::FrontLeft,
        Slot::BackRight,
        Slot::BackLeft,
        Slot::TopFront,
        Slot::TopBack,
        Slot::BottomFront,
        Slot::BottomBack,
    ];

    /// Position of this slot in a joint's slot array.
    pub fn index(self) -> usize {
        self as usize
    }

    /// The slot a member occupies at its far joint when it leaves this joint
    /// through `self`.
    pub fn opposite(self) -> Slot {
        match self {
            Slot::Top => Slot::Bottom,
            Slot::Bottom => Slot::Top,
            Slot::Left => Slot::Right,
            Slot::Right => Slot::Left,
            Slot::Front => Slot::Back,
            Slot::Back => Slot::Front,
            Slot::TopRight => Slot::BottomLeft,
            Slot::TopLeft => Slot::BottomRight,
            Slot::BottomRight => Slot::TopLeft,
            Slot::BottomLeft => Slot::TopRight,
            Slot::FrontRight => Slot::BackLeft,
            Slot::FrontLeft => Slot::BackRight,
            Slot::BackRight => Slot::FrontLeft,
            Slot::BackLeft => Slot::FrontRight,
            Slot::TopFront => Slot::BottomBack,
            Slot::TopBack => Slot::BottomFront,
            Slot::BottomFront => Slot::TopBack,
            Slot::BottomBack => Slot::TopFront,
        }
    }
}

// ---------------------------------------------------------------------------
// Wall cells
// ---------------------------------------------------------------------------

/// Which corner of a cell a triangular corner piece fills.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Corner {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

/// Variant tag of a wall cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellKind {
    Solid,
    /// Glass pane. Fragile, and does not relay support across the wall.
    Window,
    /// Half-cell at a sloped wall edge. Carries support like a solid cell but
    /// is never merged into a chunk.
    TriangularCorner(Corner),
}

impl CellKind {
    pub fn is_window(self) -> bool {
        matches!(self, CellKind::Window)
    }
}

/// Column/row position of a cell in its wall grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridPos {
    pub column: u32,
    pub row: u32,
}

impl GridPos {
    pub const fn new(column: u32, row: u32) -> Self {
        Self { column, row }
    }
}

impl fmt::Display for GridPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.column, self.row)
    }
}

// ---------------------------------------------------------------------------
// Vector helpers
// ---------------------------------------------------------------------------

pub type Vec3 = [f32; 3];

pub fn add(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

pub fn sub(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

pub fn scale(a: Vec3, s: f32) -> Vec3 {
    [a[0] * s, a[1] * s, a[2] * s]
}

pub fn lerp(a: Vec3, b: Vec3, t: f32) -> Vec3 {
    add(a, scale(sub(b, a), t))
}

pub fn distance_sq(a: Vec3, b: Vec3) -> f32 {
    let d = sub(a, b);
    d[0] * d[0] + d[1] * d[1] + d[2] * d[2]
}

/// Mean of `points`, or the origin when empty.
pub fn centroid<I: IntoIterator<Item = Vec3>>(points: I) -> Vec3 {
    let mut sum = [0.0; 3];
    let mut count = 0u32;
    for p in points {
        sum = add(sum, p);
        count += 1;
    }
    if count == 0 {
        sum
    } else {
        scale(sum, 1.0 / count as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_slot_has_an_involutive_opposite() {
        for slot in Slot::ALL {
            assert_ne!(slot.opposite(), slot);
            assert_eq!(slot.opposite().opposite(), slot);
        }
    }

    #[test]
    fn slot_indices_cover_the_array() {
        let mut seen = [false; Slot::COUNT];
        for slot in Slot::ALL {
            assert!(!seen[slot.index()]);
            seen[slot.index()] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn ids_serialize_as_plain_integers() {
        let json = serde_json::to_string(&MemberId(42)).unwrap();
        assert_eq!(json, "42");
        let mut map = std::collections::BTreeMap::new();
        map.insert(WallId(3), 1u8);
        let json = serde_json::to_string(&map).unwrap();
        let back: std::collections::BTreeMap<WallId, u8> = serde_json::from_str(&json).unwrap();
        assert_eq!(back[&WallId(3)], 1);
    }

    #[test]
    fn centroid_of_nothing_is_origin() {
        assert_eq!(centroid(std::iter::empty()), [0.0, 0.0, 0.0]);
        assert_eq!(centroid([[0.0, 0.0, 0.0], [2.0, 4.0, -2.0]]), [1.0, 2.0, -1.0]);
    }
}
