// Wall grids and their support flood-fill.
//
// A `Wall` is a `columns x rows` grid of cells stored flat (`col + row *
// columns`), with `None` marking holes. Cells along the wall's border can be
// attached to a member voxel; such a cell is an "edge" while that voxel is
// alive and its member still belongs to the wall's group. The set of members
// behind live edges is `edge_members`, which group extraction uses to decide
// where a wall goes.
//
// ## Support
//
// `support_distances()` runs a multi-source BFS from the edge cells over
// 4-neighbours. A window reached from a solid cell is a one-hop bridge: it
// carries no distance of its own, and the solid cells beyond it restart at 0.
// Windows never reach other windows. A live cell is unsupported when no edge
// exists at all or when its distance exceeds `columns + rows`.
//
// `detach_unsupported_cells()` then:
// - breaks off whole any intact chunk holding an unsupported cell,
// - groups the remaining unsupported cells into 4-connected components and
//   moves each into a new free-standing wall with a tight grid.
// Free walls (no group) have no edges; they only split when their cells fall
// into several components, keeping the largest.
//
// ## Validation
//
// Requests are coalesced with `validating` / `validate_again`, and deferred
// while a staged uncombine is rebuilding part of the grid (`rebuilding`). A
// pass runs immediately, then holds the wall in `validating` for one
// interval; a request in that time triggers one more pass at the end.
//
// A wall left with at most one live cell destroys itself, ejecting the last
// cell as debris.
//
// See also: `chunk.rs` for chunk damage routing and staged uncombine,
// `group.rs` for wall migration on extraction.

use crate::chunk::ChunkKind;
use crate::debris::{FragmentKind, Lifetime};
use crate::event::{ScheduledEventKind, SimEventKind};
use crate::structure::Structure;
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

/// The member voxel a border cell rests on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellAttachment {
    pub member: MemberId,
    pub voxel: VoxelId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WallCell {
    pub id: CellId,
    pub wall: WallId,
    pub pos: GridPos,
    pub kind: CellKind,
    pub damage: f32,
    pub attachment: Option<CellAttachment>,
    pub is_edge: bool,
    /// Combined chunk this cell is merged into.
    pub chunk: Option<ChunkId>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WallValidation {
    pub validating: bool,
    pub validate_again: bool,
    /// Staged uncombines currently restoring cells of this wall.
    pub rebuilding: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Wall {
    pub id: WallId,
    /// `None` for a free-standing wall split off its parent.
    pub group: Option<GroupId>,
    pub columns: u32,
    pub rows: u32,
    pub cells: Vec<Option<CellId>>,
    pub edge_members: BTreeSet<MemberId>,
    pub chunks: BTreeSet<ChunkId>,
    /// Centre of cell (0, 0) in the group's local space, or world space for a
    /// free wall.
    pub origin: Vec3,
    pub column_step: Vec3,
    pub row_step: Vec3,
    pub validation: WallValidation,
    /// Debris handle of a free wall.
    pub fragment: Option<FragmentId>,
}

impl Wall {
    pub fn index(&self, pos: GridPos) -> Option<usize> {
        (pos.column < self.columns && pos.row < self.rows)
            .then(|| (pos.column + pos.row * self.columns) as usize)
    }

    pub fn cell_at(&self, pos: GridPos) -> Option<CellId> {
        self.index(pos).and_then(|i| self.cells[i])
    }

    pub fn pos_of(&self, index: usize) -> GridPos {
        let columns = self.columns.max(1) as usize;
        GridPos::new((index % columns) as u32, (index / columns) as u32)
    }

    pub fn live_cells(&self) -> impl Iterator<Item = CellId> + '_ {
        self.cells.iter().flatten().copied()
    }

    pub fn live_count(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }

    /// Centre of the cell at `pos`, in the same space as `origin`.
    pub fn cell_center(&self, pos: GridPos) -> Vec3 {
        add(
            self.origin,
            add(
                scale(self.column_step, pos.column as f32),
                scale(self.row_step, pos.row as f32),
            ),
        )
    }
}

// ---------------------------------------------------------------------------
// Grid algorithms
// ---------------------------------------------------------------------------

/// What the flood-fills need to know about one grid slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GridCell {
    pub live: bool,
    pub window: bool,
    pub edge: bool,
}

fn neighbours(columns: u32, rows: u32, index: usize) -> impl Iterator<Item = usize> {
    let (c, r) = (index as u32 % columns, index as u32 / columns);
    let mut out: [Option<usize>; 4] = [None; 4];
    if r + 1 < rows {
        out[0] = Some(index + columns as usize);
    }
    if r > 0 {
        out[1] = Some(index - columns as usize);
    }
    if c + 1 < columns {
        out[2] = Some(index + 1);
    }
    if c > 0 {
        out[3] = Some(index - 1);
    }
    out.into_iter().flatten()
}

/// BFS hop count from the nearest edge cell; `None` where unreached.
///
/// A reached window reports 0 and bridges the opening: the solid cells on
/// its far side count again from 0. Windows are only reached from solid
/// cells, never from another window.
pub fn support_distances(columns: u32, rows: u32, cells: &[GridCell]) -> Vec<Option<u32>> {
    let mut dist = vec![None; cells.len()];
    let mut queue = VecDeque::new();
    for (i, cell) in cells.iter().enumerate() {
        if cell.live && cell.edge {
            dist[i] = Some(0);
            queue.push_back(i);
        }
    }

    while let Some(i) = queue.pop_front() {
        let Some(d) = dist[i] else {
            continue;
        };
        let bridge = cells[i].window;
        let next = if bridge { 0 } else { d + 1 };
        for n in neighbours(columns, rows, i) {
            if !cells[n].live {
                continue;
            }
            if cells[n].window {
                if !bridge && dist[n].is_none() {
                    dist[n] = Some(0);
                    queue.push_back(n);
                }
                continue;
            }
            if dist[n].is_none_or(|old| old > next) {
                dist[n] = Some(next);
                queue.push_back(n);
            }
        }
    }

    dist
}

/// Live cells that have lost support.
pub fn unsupported_mask(columns: u32, rows: u32, cells: &[GridCell]) -> Vec<bool> {
    let any_edge = cells.iter().any(|c| c.live && c.edge);
    let cutoff = columns + rows;
    let dist = support_distances(columns, rows, cells);
    cells
        .iter()
        .zip(dist)
        .map(|(cell, d)| cell.live && (!any_edge || d.is_none_or(|d| d > cutoff)))
        .collect()
}

/// 4-connected components of the `true` slots of `mask`, each sorted, in
/// order of their lowest index.
pub fn grid_components(columns: u32, rows: u32, mask: &[bool]) -> Vec<Vec<usize>> {
    let mut seen = vec![false; mask.len()];
    let mut components = Vec::new();
    for start in 0..mask.len() {
        if !mask[start] || seen[start] {
            continue;
        }
        seen[start] = true;
        let mut component = vec![start];
        let mut queue = VecDeque::from([start]);
        while let Some(i) = queue.pop_front() {
            for n in neighbours(columns, rows, i) {
                if mask[n] && !seen[n] {
                    seen[n] = true;
                    component.push(n);
                    queue.push_back(n);
                }
            }
        }
        component.sort_unstable();
        components.push(component);
    }
    components
}

/// Slot classification for chunk layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkCell {
    Empty,
    Solid,
    Window,
}

/// Chunk layout for a wall: the grid is tiled into `columns/2 x rows/2`
/// quadrants and, inside each, solid and window cells are merged per
/// 4-connected component. Components of one cell stay loose. Walls of two
/// columns or rows or fewer are not chunked.
pub fn quadrant_chunks(columns: u32, rows: u32, cells: &[ChunkCell]) -> Vec<(bool, Vec<usize>)> {
    let mut out = Vec::new();
    if columns <= 2 || rows <= 2 {
        return out;
    }
    let (tile_w, tile_h) = (columns / 2, rows / 2);

    let mut tile_row = 0;
    while tile_row < rows {
        let mut tile_col = 0;
        while tile_col < columns {
            for window in [false, true] {
                let wanted = if window { ChunkCell::Window } else { ChunkCell::Solid };
                let mask: Vec<bool> = (0..cells.len())
                    .map(|i| {
                        let (c, r) = (i as u32 % columns, i as u32 / columns);
                        cells[i] == wanted
                            && (tile_col..tile_col + tile_w).contains(&c)
                            && (tile_row..tile_row + tile_h).contains(&r)
                    })
                    .collect();
                for component in grid_components(columns, rows, &mask) {
                    if component.len() >= 2 {
                        out.push((window, component));
                    }
                }
            }
            tile_col += tile_w;
        }
        tile_row += tile_h;
    }
    out
}

// ---------------------------------------------------------------------------
// Structure operations
// ---------------------------------------------------------------------------

impl Structure {
    pub fn cell_world_position(&self, cell: CellId) -> Option<Vec3> {
        let c = self.cells.get(&cell)?;
        let w = self.walls.get(&c.wall)?;
        Some(add(self.group_origin(w.group), w.cell_center(c.pos)))
    }

    /// The member behind an attached cell, if that attachment still holds:
    /// the voxel is alive and its current owner belongs to the wall's group.
    fn live_edge_member(&self, cell: &WallCell, group: Option<GroupId>) -> Option<MemberId> {
        let attachment = cell.attachment?;
        let owner = self.voxels.get(&attachment.voxel)?.member?;
        let member = self.members.get(&owner)?;
        (Some(member.group) == group).then_some(owner)
    }

    /// Flood-fill input for a wall, with edges evaluated live.
    fn grid_snapshot(&self, wall: &Wall) -> Vec<GridCell> {
        wall.cells
            .iter()
            .map(|slot| match slot.and_then(|id| self.cells.get(&id)) {
                Some(cell) => GridCell {
                    live: true,
                    window: cell.kind.is_window(),
                    edge: self.live_edge_member(cell, wall.group).is_some(),
                },
                None => GridCell::default(),
            })
            .collect()
    }

    /// Per-slot support of a wall: `true` for live supported cells.
    pub fn wall_support(&self, wall: WallId) -> Option<Vec<bool>> {
        let w = self.walls.get(&wall)?;
        let grid = self.grid_snapshot(w);
        let unsupported = unsupported_mask(w.columns, w.rows, &grid);
        Some(
            grid.iter()
                .zip(unsupported)
                .map(|(cell, u)| cell.live && !u)
                .collect(),
        )
    }

    /// Recompute every cell's edge flag and the wall's edge member set.
    pub(crate) fn refresh_wall_edges(&mut self, wall: WallId) {
        let Some(w) = self.walls.get(&wall) else {
            return;
        };
        let group = w.group;
        let mut edges: BTreeMap<CellId, Option<MemberId>> = BTreeMap::new();
        for id in w.live_cells() {
            if let Some(cell) = self.cells.get(&id) {
                edges.insert(id, self.live_edge_member(cell, group));
            }
        }

        let mut members = BTreeSet::new();
        for (id, member) in edges {
            if let Some(cell) = self.cells.get_mut(&id) {
                cell.is_edge = member.is_some();
                if let (Some(m), Some(att)) = (member, cell.attachment.as_mut()) {
                    att.member = m;
                    members.insert(m);
                }
            }
        }
        if let Some(w) = self.walls.get_mut(&wall) {
            w.edge_members = members;
        }
    }

    pub fn damage_cell(&mut self, cell: CellId, amount: f32) {
        let Some(c) = self.cells.get(&cell) else {
            log::warn!("damage for missing {cell}");
            return;
        };
        let wall = c.wall;
        let intact_chunk = c
            .chunk
            .filter(|ch| self.chunks.get(ch).is_some_and(|chunk| !chunk.broken));
        if let Some(chunk) = intact_chunk {
            self.damage_chunk(chunk, amount);
            return;
        }

        let health = if c.kind.is_window() {
            self.config.wall.window_health
        } else {
            self.config.wall.piece_health
        };
        let lethal = match self.cells.get_mut(&cell) {
            Some(c) => {
                c.damage = (c.damage + amount).min(f32::MAX);
                c.damage >= health
            }
            None => false,
        };
        if lethal {
            self.destroy_cell(cell);
        }
        if let Some(group) = self.walls.get(&wall).and_then(|w| w.group) {
            self.note_group_damage(group);
        }
        self.request_wall_validation(wall);
    }

    pub(crate) fn destroy_cell(&mut self, cell: CellId) {
        let Some(position) = self.cell_world_position(cell) else {
            return;
        };
        let Some(c) = self.cells.remove(&cell) else {
            return;
        };
        if let Some(w) = self.walls.get_mut(&c.wall) {
            if let Some(i) = w.index(c.pos) {
                if w.cells[i] == Some(cell) {
                    w.cells[i] = None;
                }
            }
        }
        self.emit(SimEventKind::CellDestroyed { wall: c.wall, cell });
        if c.kind.is_window() {
            self.emit(SimEventKind::WindowShatter {
                position,
                intensity: 1.0,
            });
        } else {
            self.crumble(position, 1.0);
        }
    }

    /// Ask for a support pass over `wall`.
    pub fn request_wall_validation(&mut self, wall: WallId) {
        let Some(w) = self.walls.get_mut(&wall) else {
            return;
        };
        if w.validation.validating || w.validation.rebuilding > 0 {
            w.validation.validate_again = true;
            return;
        }
        w.validation.validating = true;

        self.detach_unsupported_cells(wall);
        if self.wall_self_destruct_check(wall) {
            return;
        }
        let at = self.tick + self.config.group.validation_interval_ticks;
        self.event_queue
            .schedule(at, ScheduledEventKind::WallValidationResume { wall });
    }

    pub(crate) fn resume_wall_validation(&mut self, wall: WallId) {
        let Some(w) = self.walls.get_mut(&wall) else {
            return;
        };
        w.validation.validating = false;
        if w.validation.validate_again {
            w.validation.validate_again = false;
            self.request_wall_validation(wall);
        }
    }

    fn detach_unsupported_cells(&mut self, wall: WallId) {
        self.refresh_wall_edges(wall);
        let Some(w) = self.walls.get(&wall) else {
            return;
        };
        let (columns, rows) = (w.columns, w.rows);
        let grid = self.grid_snapshot(w);

        if w.group.is_none() {
            let live: Vec<bool> = grid.iter().map(|c| c.live).collect();
            let mut components = grid_components(columns, rows, &live);
            if components.len() <= 1 {
                return;
            }
            let mut keep = 0;
            for (i, c) in components.iter().enumerate() {
                if c.len() > components[keep].len() {
                    keep = i;
                }
            }
            components.remove(keep);
            let split: Vec<Vec<CellId>> = components
                .iter()
                .map(|c| c.iter().filter_map(|&i| w.cells[i]).collect())
                .collect();
            for cells in split {
                self.split_off_wall(wall, cells);
            }
            return;
        }

        let unsupported = unsupported_mask(columns, rows, &grid);
        let mut chunks: BTreeSet<ChunkId> = BTreeSet::new();
        let mut loose = vec![false; unsupported.len()];
        for (i, &u) in unsupported.iter().enumerate() {
            if !u {
                continue;
            }
            let chunk = w.cells[i]
                .and_then(|id| self.cells.get(&id))
                .and_then(|c| c.chunk);
            match chunk {
                Some(ch) if self.chunks.get(&ch).is_some_and(|c| !c.broken) => {
                    chunks.insert(ch);
                }
                Some(_) => {}
                None => loose[i] = true,
            }
        }
        let split: Vec<Vec<CellId>> = grid_components(columns, rows, &loose)
            .iter()
            .map(|c| c.iter().filter_map(|&i| w.cells[i]).collect())
            .collect();

        if !chunks.is_empty() || !split.is_empty() {
            log::debug!(
                "{wall}: {} unsupported chunks, {} loose components",
                chunks.len(),
                split.len()
            );
        }
        for chunk in chunks {
            self.break_off_chunk(chunk);
        }
        for cells in split {
            self.split_off_wall(wall, cells);
        }
    }

    /// Move `cells` out of `wall` into a new free-standing wall with a tight
    /// grid. Intact chunks lying wholly inside `cells` move with them. A
    /// chunk straddling the cut is broken off first, and cells of a chunk
    /// already coming apart stay behind.
    pub(crate) fn split_off_wall(&mut self, wall: WallId, cells: Vec<CellId>) -> Option<WallId> {
        let moving: BTreeSet<CellId> = cells.iter().copied().collect();
        let mut carried = BTreeSet::new();
        let mut left_behind = BTreeSet::new();
        for chunk in self.walls.get(&wall)?.chunks.clone() {
            let Some(c) = self.chunks.get(&chunk) else {
                continue;
            };
            let ChunkKind::WallCells { cells: merged, .. } = &c.kind else {
                continue;
            };
            let inside = merged.iter().filter(|id| moving.contains(id)).count();
            if inside == 0 {
                continue;
            }
            if c.broken {
                left_behind.insert(chunk);
            } else if inside == merged.len() {
                carried.insert(chunk);
            } else {
                log::debug!("{chunk} straddles the split of {wall}, breaking it off");
                left_behind.insert(chunk);
                self.break_off_chunk(chunk);
            }
        }
        let cells: Vec<CellId> = cells
            .into_iter()
            .filter(|id| {
                self.cells
                    .get(id)
                    .is_some_and(|c| c.chunk.is_none_or(|ch| !left_behind.contains(&ch)))
            })
            .collect();

        let w = self.walls.get(&wall)?;
        let positions: Vec<GridPos> = cells
            .iter()
            .filter_map(|c| self.cells.get(c))
            .map(|c| c.pos)
            .collect();
        let min_col = positions.iter().map(|p| p.column).min()?;
        let max_col = positions.iter().map(|p| p.column).max()?;
        let min_row = positions.iter().map(|p| p.row).min()?;
        let max_row = positions.iter().map(|p| p.row).max()?;
        let (columns, rows) = (max_col - min_col + 1, max_row - min_row + 1);

        let origin = add(
            self.group_origin(w.group),
            w.cell_center(GridPos::new(min_col, min_row)),
        );
        let (column_step, row_step) = (w.column_step, w.row_step);
        let world: Vec<Vec3> = cells
            .iter()
            .filter_map(|c| self.cell_world_position(*c))
            .collect();

        let new_id = WallId(self.next_raw_id());
        let mut new_wall = Wall {
            id: new_id,
            group: None,
            columns,
            rows,
            cells: vec![None; (columns * rows) as usize],
            edge_members: BTreeSet::new(),
            chunks: carried.clone(),
            origin,
            column_step,
            row_step,
            validation: WallValidation::default(),
            fragment: None,
        };
        if let Some(w) = self.walls.get_mut(&wall) {
            w.chunks.retain(|ch| !carried.contains(ch));
        }
        for chunk in &carried {
            if let Some(ChunkKind::WallCells { wall: owner, .. }) =
                self.chunks.get_mut(chunk).map(|c| &mut c.kind)
            {
                *owner = new_id;
            }
        }

        for &id in &cells {
            let Some(cell) = self.cells.get_mut(&id) else {
                continue;
            };
            if let Some(w) = self.walls.get_mut(&wall) {
                if let Some(i) = w.index(cell.pos) {
                    w.cells[i] = None;
                }
            }
            cell.pos = GridPos::new(cell.pos.column - min_col, cell.pos.row - min_row);
            cell.wall = new_id;
            cell.is_edge = false;
            cell.attachment = None;
            if let Some(i) = new_wall.index(cell.pos) {
                new_wall.cells[i] = Some(id);
            }
        }
        let count = new_wall.live_count();
        self.walls.insert(new_id, new_wall);

        let mass = self.config.wall.piece_mass * count as f32;
        let position = centroid(world);
        log::info!("{wall} lost {count} unsupported cells to {new_id}");
        self.emit(SimEventKind::WallSplit {
            wall,
            new_wall: new_id,
            cells: count,
        });
        match self.register_fragment(FragmentKind::Wall(new_id), position, mass, Lifetime::Medium) {
            Some(fragment) => {
                if let Some(w) = self.walls.get_mut(&new_id) {
                    w.fragment = Some(fragment);
                }
            }
            None => self.remove_wall_nodes(new_id),
        }
        Some(new_id)
    }

    /// Destroy a wall with at most one live cell. Returns whether it is gone.
    fn wall_self_destruct_check(&mut self, wall: WallId) -> bool {
        let Some(w) = self.walls.get(&wall) else {
            return true;
        };
        let live: Vec<CellId> = w.live_cells().take(2).collect();
        if live.len() > 1 {
            return false;
        }
        if let Some(&last) = live.first() {
            if let Some(position) = self.cell_world_position(last) {
                let mass = self.config.wall.piece_mass;
                self.register_fragment(FragmentKind::WallCell, position, mass, Lifetime::Small);
            }
        }
        log::debug!("{wall} has {} cells left, destroying", live.len());
        self.destroy_wall(wall);
        true
    }

    pub fn destroy_wall(&mut self, wall: WallId) {
        let Some(group) = self.walls.get(&wall).map(|w| w.group) else {
            return;
        };
        if let Some(g) = group.and_then(|g| self.groups.get_mut(&g)) {
            g.walls.remove(&wall);
        }
        self.remove_wall_nodes(wall);
        self.emit(SimEventKind::WallDestroyed { wall });
    }

    /// Drop a wall, its cells and chunks from the arenas.
    pub(crate) fn remove_wall_nodes(&mut self, wall: WallId) {
        let Some(w) = self.walls.remove(&wall) else {
            return;
        };
        for cell in w.cells.iter().flatten() {
            self.cells.remove(cell);
        }
        for chunk in &w.chunks {
            self.chunks.remove(chunk);
            self.geometry.release_combined(*chunk);
        }
        if let Some(fragment) = w.fragment {
            self.debris.release(fragment);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{MemberSpec, WallSpec};
    use crate::command::{SimAction, SimCommand};

    fn grid(columns: u32, rows: u32, f: impl Fn(u32, u32) -> GridCell) -> Vec<GridCell> {
        (0..columns * rows).map(|i| f(i % columns, i / columns)).collect()
    }

    const SOLID: GridCell = GridCell {
        live: true,
        window: false,
        edge: false,
    };

    #[test]
    fn wall_without_edges_is_entirely_unsupported() {
        let cells = grid(4, 3, |_, _| SOLID);
        assert!(unsupported_mask(4, 3, &cells).iter().all(|u| *u));
    }

    #[test]
    fn fully_edged_wall_is_entirely_supported() {
        let cells = grid(4, 3, |_, _| GridCell { edge: true, ..SOLID });
        assert!(unsupported_mask(4, 3, &cells).iter().all(|u| !*u));
    }

    #[test]
    fn holes_are_never_unsupported() {
        let cells = grid(3, 1, |c, _| if c == 1 { GridCell::default() } else { SOLID });
        assert_eq!(unsupported_mask(3, 1, &cells), vec![true, false, true]);
    }

    #[test]
    fn search_passes_through_a_window_row() {
        // Edge at the bottom, a window row across the middle.
        let cells = grid(3, 3, |_, r| match r {
            0 => GridCell { edge: true, ..SOLID },
            1 => GridCell { window: true, ..SOLID },
            _ => SOLID,
        });
        let dist = support_distances(3, 3, &cells);
        assert_eq!(&dist[3..6], &[Some(0), Some(0), Some(0)]);
        assert_eq!(&dist[6..9], &[Some(0), Some(0), Some(0)]);
        assert!(unsupported_mask(3, 3, &cells).iter().all(|u| !*u));
    }

    #[test]
    fn windows_do_not_reach_windows() {
        // Edge at the bottom, two window rows, solid on top.
        let cells = grid(2, 4, |_, r| match r {
            0 => GridCell { edge: true, ..SOLID },
            1 | 2 => GridCell { window: true, ..SOLID },
            _ => SOLID,
        });
        let dist = support_distances(2, 4, &cells);
        assert_eq!(&dist[2..4], &[Some(0), Some(0)]);
        assert_eq!(&dist[4..8], &[None, None, None, None]);
        let unsupported = unsupported_mask(2, 4, &cells);
        assert_eq!(&unsupported[2..4], &[false, false]);
        assert_eq!(&unsupported[4..8], &[true, true, true, true]);
    }

    #[test]
    fn window_bridge_restarts_the_count() {
        // A 1-wide column: edge, four solids, a window, then two solids.
        // Cells on both sides of the window count from 0 again.
        let cells = grid(1, 8, |_, r| match r {
            0 => GridCell { edge: true, ..SOLID },
            5 => GridCell { window: true, ..SOLID },
            _ => SOLID,
        });
        let dist: Vec<u32> = support_distances(1, 8, &cells).into_iter().flatten().collect();
        assert_eq!(dist, vec![0, 1, 2, 1, 0, 0, 0, 1]);
    }

    #[test]
    fn long_path_exceeds_the_cutoff() {
        // A serpentine corridor through a 5x5 grid; edge at (0, 0).
        let open = |c: u32, r: u32| match r {
            1 => c == 4,
            3 => c == 0,
            _ => true,
        };
        let cells = grid(5, 5, |c, r| {
            if !open(c, r) {
                GridCell::default()
            } else if (c, r) == (0, 0) {
                GridCell { edge: true, ..SOLID }
            } else {
                SOLID
            }
        });
        let dist = support_distances(5, 5, &cells);
        assert_eq!(dist[10], Some(10)); // (0, 2)
        assert_eq!(dist[15], Some(11)); // (0, 3)
        let unsupported = unsupported_mask(5, 5, &cells);
        assert!(!unsupported[10]);
        assert!(unsupported[15]);
        assert!(unsupported[20..25].iter().all(|u| *u));
    }

    #[test]
    fn components_use_four_neighbours() {
        // Diagonal cells are not connected.
        let mask = vec![true, false, false, true];
        assert_eq!(grid_components(2, 2, &mask), vec![vec![0], vec![3]]);
    }

    #[test]
    fn quadrants_split_solid_and_window_cells() {
        let mut cells = vec![ChunkCell::Solid; 16];
        cells[0] = ChunkCell::Window;
        cells[1] = ChunkCell::Window;
        let chunks = quadrant_chunks(4, 4, &cells);
        // Bottom-left quadrant: window pair + the two solid cells above it.
        assert!(chunks.contains(&(true, vec![0, 1])));
        assert!(chunks.contains(&(false, vec![4, 5])));
        assert_eq!(chunks.len(), 5);
        let covered: usize = chunks.iter().map(|(_, c)| c.len()).sum();
        assert_eq!(covered, 16);
    }

    #[test]
    fn narrow_walls_are_not_chunked() {
        assert!(quadrant_chunks(2, 5, &[ChunkCell::Solid; 10]).is_empty());
    }

    /// A 3x3 wall hanging off the right side of a grounded post.
    fn post_with_wall() -> (Structure, MemberId, WallId) {
        let mut s = Structure::new(3);
        let g = s.add_group([0.0; 3]);
        let j0 = s.add_connection(g, [0.0, 0.0, 0.0]).unwrap();
        let j1 = s.add_connection(g, [0.0, 3.0, 0.0]).unwrap();
        let post = s
            .add_member(g, MemberSpec::new(j0, Slot::Top, j1, 3).grounded())
            .unwrap();
        let wall = s
            .add_wall(
                Some(g),
                WallSpec::solid(3, 3, [1.0, 0.5, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            )
            .unwrap();
        for row in 0..3 {
            s.attach_cell(wall, GridPos::new(0, row), post, row as usize).unwrap();
        }
        s.initialize_group(g).unwrap();
        (s, post, wall)
    }

    #[test]
    fn attached_wall_is_supported() {
        let (mut s, post, wall) = post_with_wall();
        assert!(s.wall_support(wall).unwrap().iter().all(|x| *x));
        s.request_wall_validation(wall);
        assert_eq!(s.walls[&wall].live_count(), 9);
        assert!(s.walls[&wall].edge_members.contains(&post));
    }

    #[test]
    fn losing_every_edge_splits_the_wall_off() {
        let (mut s, post, wall) = post_with_wall();
        s.destroy_member(post);
        s.request_wall_validation(wall);
        // Every cell left; the original wall destroyed itself.
        assert!(!s.walls.contains_key(&wall));
        let events = s.take_events();
        let new_wall = events
            .iter()
            .find_map(|e| match e.kind {
                SimEventKind::WallSplit { wall: w, new_wall, cells } if w == wall => {
                    assert_eq!(cells, 9);
                    Some(new_wall)
                }
                _ => None,
            })
            .expect("wall should split");
        let free = &s.walls[&new_wall];
        assert_eq!(free.group, None);
        assert_eq!((free.columns, free.rows), (3, 3));
        assert!(free.fragment.is_some());
    }

    #[test]
    fn window_cells_break_at_window_health() {
        let mut s = Structure::new(3);
        let spec = WallSpec::solid(3, 1, [0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0])
            .with_cell(GridPos::new(1, 0), Some(CellKind::Window));
        let wall = s.add_wall(None, spec).unwrap();
        let pane = s.walls[&wall].cell_at(GridPos::new(1, 0)).unwrap();
        s.damage_cell(pane, 1.0);
        assert!(!s.cells.contains_key(&pane));
        let events = s.take_events();
        assert!(events.iter().any(|e| matches!(e.kind, SimEventKind::WindowShatter { .. })));
        // Two single cells are left. One splits off and the one left behind
        // takes the wall down with it.
        assert!(events.iter().any(|e| matches!(e.kind, SimEventKind::WallSplit { .. })));
        assert!(!s.walls.contains_key(&wall));
    }

    /// A free 4x4 wall combined into quadrant chunks. Knocking out the
    /// bottom-left and top-right quadrants leaves two diagonal ones, and the
    /// top-left one splits off. Returns the new wall and the chunk it took.
    fn diagonal_split() -> (Structure, WallId, WallId, ChunkId) {
        let mut s = Structure::new(8);
        let wall = s
            .add_wall(
                None,
                WallSpec::solid(4, 4, [0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            )
            .unwrap();
        assert_eq!(s.combine_wall(wall).unwrap(), 4);
        let chunk_at = |s: &Structure, column, row| {
            let cell = s.walls[&wall].cell_at(GridPos::new(column, row)).unwrap();
            s.cells[&cell].chunk.unwrap()
        };
        let hit = |chunk| SimCommand {
            tick: 1,
            action: SimAction::DamageChunk {
                chunk,
                amount: 1000.0,
            },
        };
        let top_left = chunk_at(&s, 0, 3);
        let commands = [hit(chunk_at(&s, 0, 0)), hit(chunk_at(&s, 3, 3))];
        let result = s.step(&commands, 10);

        let new_wall = result
            .events
            .iter()
            .find_map(|e| match e.kind {
                SimEventKind::WallSplit { new_wall, .. } => Some(new_wall),
                _ => None,
            })
            .expect("diagonal quadrants should split");
        (s, wall, new_wall, top_left)
    }

    #[test]
    fn free_split_carries_whole_chunks() {
        let (mut s, wall, new_wall, top_left) = diagonal_split();
        assert!(s.ownership_consistent());
        assert_eq!(s.walls[&wall].live_count(), 4);
        assert_eq!(s.walls[&wall].chunks.len(), 1);
        assert_eq!(s.walls[&new_wall].chunks, BTreeSet::from([top_left]));
        assert!(matches!(
            s.chunks[&top_left].kind,
            ChunkKind::WallCells { wall: owner, .. } if owner == new_wall
        ));

        // Uncombining the carried chunk works on the wall it now belongs to.
        let hit = SimCommand {
            tick: 11,
            action: SimAction::DamageChunk {
                chunk: top_left,
                amount: 40.0,
            },
        };
        s.step(&[hit], 20);
        assert!(!s.chunks.contains_key(&top_left));
        assert_eq!(s.walls[&new_wall].live_count(), 4);
        assert!(s.walls[&new_wall].chunks.is_empty());
        assert_eq!(s.walls[&new_wall].validation.rebuilding, 0);
        assert_eq!(s.walls[&wall].validation.rebuilding, 0);
        assert!(s.walls[&new_wall].live_cells().all(|c| s.cells[&c].damage == 10.0));
        assert!(s.ownership_consistent());
    }

    #[test]
    fn expired_split_wall_takes_its_chunks() {
        let (mut s, wall, new_wall, top_left) = diagonal_split();
        let lifetime = s.config.debris.medium_lifetime_ticks;
        s.step(&[], 10 + lifetime + 1);
        assert!(!s.walls.contains_key(&new_wall));
        assert!(!s.chunks.contains_key(&top_left));
        assert_eq!(s.walls[&wall].chunks.len(), 1);
        assert!(s.ownership_consistent());
    }

    #[test]
    fn validation_requests_coalesce() {
        let (mut s, _, wall) = post_with_wall();
        s.request_wall_validation(wall);
        assert!(s.walls[&wall].validation.validating);
        s.request_wall_validation(wall);
        assert!(s.walls[&wall].validation.validate_again);
        let interval = s.config.group.validation_interval_ticks;
        s.step(&[], interval);
        // The second pass ran and is now holding the wall again.
        assert!(!s.walls[&wall].validation.validate_again);
        s.step(&[], interval * 3);
        assert!(!s.walls[&wall].validation.validating);
    }
}
