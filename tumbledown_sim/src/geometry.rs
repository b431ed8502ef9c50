// Seam to the host's geometry and physics.
//
// The core never builds meshes or colliders. It tells a `GeometryBackend`
// when pieces need geometry, when a run of pieces should be merged into one
// combined shape, when a combined shape is gone, and which pieces must not
// collide with each other. Collision queries and rigid-body integration stay
// on the host side entirely.
//
// `HeadlessGeometry` is the default: it only counts calls, which is enough
// for tests, benchmarks, and servers that run the structure without a
// renderer. The backend is transient state and is not serialized; call
// `Structure::set_geometry` after loading a save to re-attach one.

use crate::types::*;
use std::fmt;

/// A single thing with geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PieceRef {
    Voxel(VoxelId),
    Cell(CellId),
    Connection(ConnectionId),
    Chunk(ChunkId),
}

pub trait GeometryBackend: fmt::Debug {
    /// Voxels of `member` need individual geometry (initial build, or the
    /// member's combined shell was just broken open).
    fn build_member(&mut self, member: MemberId, voxels: &[VoxelId]);

    /// A wall cell needs individual geometry.
    fn build_wall_cell(&mut self, wall: WallId, cell: CellId);

    /// Merge `pieces` into the combined shape for `chunk`.
    fn combine(&mut self, chunk: ChunkId, pieces: &[PieceRef]);

    /// The combined shape for `chunk` no longer exists.
    fn release_combined(&mut self, chunk: ChunkId);

    fn ignore_collision(&mut self, a: PieceRef, b: PieceRef);
}

/// Call counters kept by `HeadlessGeometry`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GeometryStats {
    pub voxels_built: usize,
    pub cells_built: usize,
    pub combines: usize,
    pub releases: usize,
    pub ignored_pairs: usize,
}

/// No-op backend for headless runs.
#[derive(Clone, Debug, Default)]
pub struct HeadlessGeometry {
    pub stats: GeometryStats,
}

impl GeometryBackend for HeadlessGeometry {
    fn build_member(&mut self, _member: MemberId, voxels: &[VoxelId]) {
        self.stats.voxels_built += voxels.len();
    }

    fn build_wall_cell(&mut self, _wall: WallId, _cell: CellId) {
        self.stats.cells_built += 1;
    }

    fn combine(&mut self, _chunk: ChunkId, _pieces: &[PieceRef]) {
        self.stats.combines += 1;
    }

    fn release_combined(&mut self, _chunk: ChunkId) {
        self.stats.releases += 1;
    }

    fn ignore_collision(&mut self, _a: PieceRef, _b: PieceRef) {
        self.stats.ignored_pairs += 1;
    }
}

pub(crate) fn default_backend() -> Box<dyn GeometryBackend> {
    Box::new(HeadlessGeometry::default())
}
