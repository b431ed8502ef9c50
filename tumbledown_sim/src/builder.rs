// Programmatic authoring of structures.
//
// Builds the node graph the simulation runs on: groups, joints, members wired
// into joint slots, wall grids with their edge attachments, and the combined
// chunks used to keep geometry cost bounded. Authoring is the only place that
// returns errors; a rejected node never enters the arenas.
//
// Typical order:
// 1. `add_group`, then `add_connection` for every joint.
// 2. `add_member` for every beam (`MemberSpec`), marking the ones standing on
//    the ground with `.grounded()`.
// 3. `add_wall`, then `attach_cell` / `auto_attach_edges` to hang it off
//    member voxels.
// 4. Optionally `combine_member` / `combine_wall`.
// 5. `initialize_group`: ground distances, the initial load pass that sets
//    reserve capacity, geometry build and internal collision ignores.
//
// Member geometry is a straight line between the two joint positions; voxel
// `i` of `n` sits at `(i + 0.5) / n` along it.

use crate::chunk::{Chunk, ChunkKind};
use crate::connection::{Connection, ConnectionState};
use crate::geometry::PieceRef;
use crate::group::{PassKind, ground_distances};
use crate::member::{Member, MemberFlags, Voxel};
use crate::structure::Structure;
use crate::types::*;
use crate::wall::{CellAttachment, ChunkCell, Wall, WallCell, WallValidation, quadrant_chunks};
use smallvec::SmallVec;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum BuildError {
    #[error("unknown {0}")]
    UnknownGroup(GroupId),
    #[error("unknown {0}")]
    UnknownConnection(ConnectionId),
    #[error("unknown {0}")]
    UnknownMember(MemberId),
    #[error("unknown {0}")]
    UnknownWall(WallId),
    #[error("{connection} belongs to {found}, not {expected}")]
    GroupMismatch {
        connection: ConnectionId,
        expected: GroupId,
        found: GroupId,
    },
    #[error("slot {slot:?} of {connection} is already taken")]
    SlotOccupied { connection: ConnectionId, slot: Slot },
    #[error("a member needs at least one voxel")]
    NoVoxels,
    #[error("member starts and ends at {0}")]
    SameJoint(ConnectionId),
    #[error("wall layout has {found} cells, expected {expected}")]
    GridSizeMismatch { expected: usize, found: usize },
    #[error("{pos} is outside the wall grid")]
    OutOfGrid { pos: GridPos },
    #[error("{wall} has no cell at {pos}")]
    NoCell { wall: WallId, pos: GridPos },
    #[error("{member} has no live voxel at index {index}")]
    NoVoxel { member: MemberId, index: usize },
    #[error("{0} is already combined")]
    AlreadyCombined(MemberId),
}

/// Description of a beam to add.
#[derive(Clone, Debug)]
pub struct MemberSpec {
    pub start: ConnectionId,
    /// Slot the member leaves `start` through. It lands in the opposite slot
    /// at `end`.
    pub slot: Slot,
    pub end: ConnectionId,
    pub voxels: usize,
    pub mass: Option<f32>,
    pub support_capacity: Option<f32>,
    pub grounded: bool,
}

impl MemberSpec {
    pub fn new(start: ConnectionId, slot: Slot, end: ConnectionId, voxels: usize) -> Self {
        Self {
            start,
            slot,
            end,
            voxels,
            mass: None,
            support_capacity: None,
            grounded: false,
        }
    }

    pub fn grounded(mut self) -> Self {
        self.grounded = true;
        self
    }

    pub fn mass(mut self, mass: f32) -> Self {
        self.mass = Some(mass);
        self
    }

    pub fn support_capacity(mut self, capacity: f32) -> Self {
        self.support_capacity = Some(capacity);
        self
    }
}

/// Description of a wall grid to add. `layout[col + row * columns]` is the
/// cell kind at that slot, `None` for a hole.
#[derive(Clone, Debug)]
pub struct WallSpec {
    pub columns: u32,
    pub rows: u32,
    pub origin: Vec3,
    pub column_step: Vec3,
    pub row_step: Vec3,
    pub layout: Vec<Option<CellKind>>,
}

impl WallSpec {
    /// A grid with every slot a solid cell.
    pub fn solid(columns: u32, rows: u32, origin: Vec3, column_step: Vec3, row_step: Vec3) -> Self {
        Self {
            columns,
            rows,
            origin,
            column_step,
            row_step,
            layout: vec![Some(CellKind::Solid); (columns * rows) as usize],
        }
    }

    /// Replace one slot. Positions outside the grid are ignored.
    pub fn with_cell(mut self, pos: GridPos, kind: Option<CellKind>) -> Self {
        if pos.column < self.columns && pos.row < self.rows {
            self.layout[(pos.column + pos.row * self.columns) as usize] = kind;
        }
        self
    }
}

impl Structure {
    pub fn add_connection(
        &mut self,
        group: GroupId,
        position: Vec3,
    ) -> Result<ConnectionId, BuildError> {
        if !self.groups.contains_key(&group) {
            return Err(BuildError::UnknownGroup(group));
        }
        let id = ConnectionId(self.next_raw_id());
        self.connections.insert(
            id,
            Connection {
                id,
                group,
                position,
                slots: [None; Slot::COUNT],
                health: self.config.member.connection_health,
                damage: 0.0,
                state: ConnectionState::Terminal,
            },
        );
        if let Some(g) = self.groups.get_mut(&group) {
            g.connections.insert(id);
        }
        Ok(id)
    }

    fn joint_in_group(
        &self,
        connection: ConnectionId,
        group: GroupId,
    ) -> Result<&Connection, BuildError> {
        let conn = self
            .connections
            .get(&connection)
            .ok_or(BuildError::UnknownConnection(connection))?;
        if conn.group != group {
            return Err(BuildError::GroupMismatch {
                connection,
                expected: group,
                found: conn.group,
            });
        }
        Ok(conn)
    }

    pub fn add_member(&mut self, group: GroupId, spec: MemberSpec) -> Result<MemberId, BuildError> {
        if !self.groups.contains_key(&group) {
            return Err(BuildError::UnknownGroup(group));
        }
        if spec.voxels == 0 {
            return Err(BuildError::NoVoxels);
        }
        if spec.start == spec.end {
            return Err(BuildError::SameJoint(spec.start));
        }
        let end_slot = spec.slot.opposite();
        let start = self.joint_in_group(spec.start, group)?;
        if start.slots[spec.slot.index()].is_some() {
            return Err(BuildError::SlotOccupied {
                connection: spec.start,
                slot: spec.slot,
            });
        }
        let from = start.position;
        let end = self.joint_in_group(spec.end, group)?;
        if end.slots[end_slot.index()].is_some() {
            return Err(BuildError::SlotOccupied {
                connection: spec.end,
                slot: end_slot,
            });
        }
        let to = end.position;

        let id = MemberId(self.next_raw_id());
        let mut voxels = Vec::with_capacity(spec.voxels);
        for i in 0..spec.voxels {
            let v = VoxelId(self.next_raw_id());
            let t = (i as f32 + 0.5) / spec.voxels as f32;
            self.voxels.insert(
                v,
                Voxel {
                    id: v,
                    member: Some(id),
                    center: lerp(from, to, t),
                    damage: 0.0,
                },
            );
            voxels.push(Some(v));
        }

        let mass = spec.mass.unwrap_or(self.config.member.default_mass);
        let member = Member {
            id,
            group,
            mass,
            support_capacity: spec
                .support_capacity
                .unwrap_or(self.config.member.default_support_capacity),
            accumulated_load: mass,
            ground_distance: UNREACHABLE,
            flags: MemberFlags {
                grounded: spec.grounded,
                ..MemberFlags::default()
            },
            voxels,
            adjacency: SmallVec::new(),
            start: Some(spec.start),
            end: Some(spec.end),
            shell: None,
        };
        self.members.insert(id, member);
        if let Some(g) = self.groups.get_mut(&group) {
            g.members.insert(id);
            g.body.mass += mass;
        }

        let mut neighbours: BTreeSet<MemberId> = BTreeSet::new();
        for (joint, slot) in [(spec.start, spec.slot), (spec.end, end_slot)] {
            if let Some(conn) = self.connections.get_mut(&joint) {
                neighbours.extend(conn.members());
                conn.assign(slot, id);
                conn.state = if conn.member_count() >= 2 {
                    ConnectionState::Active
                } else {
                    ConnectionState::Terminal
                };
            }
        }
        for n in neighbours {
            self.link(id, n);
        }
        Ok(id)
    }

    pub fn set_grounded(&mut self, member: MemberId, grounded: bool) -> Result<(), BuildError> {
        let m = self
            .members
            .get_mut(&member)
            .ok_or(BuildError::UnknownMember(member))?;
        m.flags.grounded = grounded;
        Ok(())
    }

    pub fn add_wall(
        &mut self,
        group: Option<GroupId>,
        spec: WallSpec,
    ) -> Result<WallId, BuildError> {
        if let Some(g) = group {
            if !self.groups.contains_key(&g) {
                return Err(BuildError::UnknownGroup(g));
            }
        }
        let expected = (spec.columns * spec.rows) as usize;
        if spec.layout.len() != expected {
            return Err(BuildError::GridSizeMismatch {
                expected,
                found: spec.layout.len(),
            });
        }

        let id = WallId(self.next_raw_id());
        let mut wall = Wall {
            id,
            group,
            columns: spec.columns,
            rows: spec.rows,
            cells: vec![None; expected],
            edge_members: BTreeSet::new(),
            chunks: BTreeSet::new(),
            origin: spec.origin,
            column_step: spec.column_step,
            row_step: spec.row_step,
            validation: WallValidation::default(),
            fragment: None,
        };
        for (i, kind) in spec.layout.into_iter().enumerate() {
            let Some(kind) = kind else {
                continue;
            };
            let cell = CellId(self.next_raw_id());
            let pos = wall.pos_of(i);
            self.cells.insert(
                cell,
                WallCell {
                    id: cell,
                    wall: id,
                    pos,
                    kind,
                    damage: 0.0,
                    attachment: None,
                    is_edge: false,
                    chunk: None,
                },
            );
            wall.cells[i] = Some(cell);
        }
        let count = wall.live_count();
        self.walls.insert(id, wall);
        if let Some(g) = group.and_then(|g| self.groups.get_mut(&g)) {
            g.walls.insert(id);
            g.body.mass += self.config.wall.piece_mass * count as f32;
        }
        Ok(id)
    }

    /// Rest the cell at `pos` on voxel `voxel_index` of `member`.
    pub fn attach_cell(
        &mut self,
        wall: WallId,
        pos: GridPos,
        member: MemberId,
        voxel_index: usize,
    ) -> Result<(), BuildError> {
        let w = self.walls.get(&wall).ok_or(BuildError::UnknownWall(wall))?;
        if w.index(pos).is_none() {
            return Err(BuildError::OutOfGrid { pos });
        }
        let cell = w.cell_at(pos).ok_or(BuildError::NoCell { wall, pos })?;
        let m = self
            .members
            .get(&member)
            .ok_or(BuildError::UnknownMember(member))?;
        let voxel = m
            .voxels
            .get(voxel_index)
            .copied()
            .flatten()
            .ok_or(BuildError::NoVoxel {
                member,
                index: voxel_index,
            })?;

        if let Some(c) = self.cells.get_mut(&cell) {
            c.attachment = Some(CellAttachment { member, voxel });
            c.is_edge = true;
        }
        if let Some(w) = self.walls.get_mut(&wall) {
            w.edge_members.insert(member);
        }
        Ok(())
    }

    /// Attach every unattached border cell to the nearest voxel of the
    /// wall's group within `wall.edge_attach_distance`. Returns how many
    /// cells were attached.
    pub fn auto_attach_edges(&mut self, wall: WallId) -> Result<usize, BuildError> {
        let w = self.walls.get(&wall).ok_or(BuildError::UnknownWall(wall))?;
        let Some(group) = w.group else {
            return Ok(0);
        };
        let reach = self.config.wall.edge_attach_distance;
        let reach_sq = reach * reach;

        let candidates: Vec<(MemberId, VoxelId, Vec3)> = self
            .groups
            .get(&group)
            .map(|g| g.members.iter().copied().collect::<Vec<_>>())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| self.members.get(&m))
            .flat_map(|m| m.live_voxels().map(move |v| (m.id, v)))
            .filter_map(|(m, v)| self.voxel_world_position(v).map(|p| (m, v, p)))
            .collect();

        let mut attachments: Vec<(GridPos, MemberId, VoxelId)> = Vec::new();
        for (i, slot) in w.cells.iter().enumerate() {
            let Some(cell) = slot.and_then(|id| self.cells.get(&id)) else {
                continue;
            };
            let pos = w.pos_of(i);
            let border = pos.column == 0
                || pos.row == 0
                || pos.column + 1 == w.columns
                || pos.row + 1 == w.rows;
            if !border || cell.attachment.is_some() {
                continue;
            }
            let Some(at) = self.cell_world_position(cell.id) else {
                continue;
            };
            let mut best: Option<(f32, MemberId, VoxelId)> = None;
            for &(m, v, p) in &candidates {
                let d = distance_sq(at, p);
                if d <= reach_sq && best.is_none_or(|(bd, _, _)| d < bd) {
                    best = Some((d, m, v));
                }
            }
            if let Some((_, m, v)) = best {
                attachments.push((pos, m, v));
            }
        }

        let count = attachments.len();
        for (pos, member, voxel) in attachments {
            if let Some(cell) = self.walls.get(&wall).and_then(|w| w.cell_at(pos)) {
                if let Some(c) = self.cells.get_mut(&cell) {
                    c.attachment = Some(CellAttachment { member, voxel });
                    c.is_edge = true;
                }
            }
            if let Some(w) = self.walls.get_mut(&wall) {
                w.edge_members.insert(member);
            }
        }
        log::debug!("{wall}: auto-attached {count} border cells");
        Ok(count)
    }

    /// Merge a member's voxels into one combined shell.
    pub fn combine_member(&mut self, member: MemberId) -> Result<ChunkId, BuildError> {
        let m = self
            .members
            .get(&member)
            .ok_or(BuildError::UnknownMember(member))?;
        if m.shell.is_some() {
            return Err(BuildError::AlreadyCombined(member));
        }
        let pieces: Vec<PieceRef> = m.live_voxels().map(PieceRef::Voxel).collect();
        let chunk = ChunkId(self.next_raw_id());
        self.chunks.insert(
            chunk,
            Chunk {
                id: chunk,
                kind: ChunkKind::MemberVoxels { member },
                damage: 0.0,
                broken: false,
            },
        );
        if let Some(m) = self.members.get_mut(&member) {
            m.shell = Some(chunk);
        }
        self.geometry.combine(chunk, &pieces);
        Ok(chunk)
    }

    /// Merge a wall's loose cells into quadrant chunks. Returns how many
    /// chunks were made.
    pub fn combine_wall(&mut self, wall: WallId) -> Result<usize, BuildError> {
        let w = self.walls.get(&wall).ok_or(BuildError::UnknownWall(wall))?;
        let layout: Vec<ChunkCell> = w
            .cells
            .iter()
            .map(|slot| match slot.and_then(|id| self.cells.get(&id)) {
                Some(c) if c.chunk.is_none() => match c.kind {
                    CellKind::Solid => ChunkCell::Solid,
                    CellKind::Window => ChunkCell::Window,
                    CellKind::TriangularCorner(_) => ChunkCell::Empty,
                },
                _ => ChunkCell::Empty,
            })
            .collect();
        let groups: Vec<(bool, Vec<CellId>)> = quadrant_chunks(w.columns, w.rows, &layout)
            .into_iter()
            .map(|(window, idx)| (window, idx.into_iter().filter_map(|i| w.cells[i]).collect()))
            .collect();

        let count = groups.len();
        for (window, cells) in groups {
            let chunk = ChunkId(self.next_raw_id());
            for c in &cells {
                if let Some(cell) = self.cells.get_mut(c) {
                    cell.chunk = Some(chunk);
                }
            }
            let pieces: Vec<PieceRef> = cells.iter().copied().map(PieceRef::Cell).collect();
            self.geometry.combine(chunk, &pieces);
            self.chunks.insert(
                chunk,
                Chunk {
                    id: chunk,
                    kind: ChunkKind::WallCells {
                        wall,
                        cells,
                        window,
                    },
                    damage: 0.0,
                    broken: false,
                },
            );
            if let Some(w) = self.walls.get_mut(&wall) {
                w.chunks.insert(chunk);
            }
        }
        Ok(count)
    }

    /// Finish authoring a group: ground distances, reserve capacity, geometry.
    pub fn initialize_group(&mut self, group: GroupId) -> Result<(), BuildError> {
        if !self.groups.contains_key(&group) {
            return Err(BuildError::UnknownGroup(group));
        }
        self.prune_group_topology(group);
        let Some(g) = self.groups.get(&group) else {
            return Err(BuildError::UnknownGroup(group));
        };
        let ids = g.members.clone();
        let walls: Vec<WallId> = g.walls.iter().copied().collect();

        for (id, d) in ground_distances(&self.members, group, &ids) {
            if let Some(m) = self.members.get_mut(&id) {
                m.ground_distance = d;
            }
        }
        self.propagate(group, PassKind::Initial);

        for id in &ids {
            let Some(m) = self.members.get(id) else {
                continue;
            };
            let voxels: Vec<VoxelId> = m.live_voxels().collect();
            let joints = m.connections();
            let shell = m.shell;
            match shell {
                Some(chunk) => {
                    for &c in &joints {
                        self.geometry
                            .ignore_collision(PieceRef::Chunk(chunk), PieceRef::Connection(c));
                    }
                }
                None => {
                    self.geometry.build_member(*id, &voxels);
                    for &v in &voxels {
                        for &c in &joints {
                            self.geometry
                                .ignore_collision(PieceRef::Voxel(v), PieceRef::Connection(c));
                        }
                    }
                }
            }
        }

        for wall in walls {
            self.refresh_wall_edges(wall);
            let loose: Vec<CellId> = self
                .walls
                .get(&wall)
                .map(|w| {
                    w.live_cells()
                        .filter(|c| self.cells.get(c).is_some_and(|c| c.chunk.is_none()))
                        .collect()
                })
                .unwrap_or_default();
            for cell in loose {
                self.geometry.build_wall_cell(wall, cell);
            }
        }

        log::info!("{group} initialized with {} members", ids.len());
        Ok(())
    }
}
