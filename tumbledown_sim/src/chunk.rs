// Combined chunks and their damage routing.
//
// A `Chunk` stands for a run of wall cells or member voxels that the host
// renders and collides as one merged shape. Damage aimed at any piece inside
// an intact chunk lands on the chunk, which accumulates it and decides what
// to do through `route_wall_chunk()` / `route_member_chunk()`.
//
// Wall chunks consult the global uncombine throttle:
// - Budget left: uncombine. The chunk is broken and its cells are restored a
//   few per tick (`cells_per_step`) by a cooperative `UncombineStep` task,
//   each taking an equal share of the chunk's accumulated damage.
// - No budget, damage at or past `wall.piece_health`: break off whole. A
//   solid chunk detaches as one rigid fragment; a window chunk shatters
//   instead (every pane gets lethal damage, no budget consumed).
// - Otherwise the damage is absorbed and kept for the next hit.
//
// Member chunks (a member's combined shell) never touch the throttle. Past
// `member.piece_health` the hit destroys one random voxel; below it the shell
// is just broken open.
//
// While an uncombine runs, the wall's `rebuilding` counter defers wall
// validation. Each step re-checks that both wall and chunk still exist.

use crate::debris::{FragmentKind, Lifetime};
use crate::event::{ScheduledEventKind, SimEventKind};
use crate::structure::Structure;
use crate::throttle::UncombineThrottle;
use crate::types::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ChunkKind {
    WallCells {
        wall: WallId,
        cells: Vec<CellId>,
        window: bool,
    },
    MemberVoxels {
        member: MemberId,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub kind: ChunkKind,
    pub damage: f32,
    /// Set once the chunk starts coming apart; a broken chunk takes no more
    /// damage.
    pub broken: bool,
}

/// What a damaged chunk should do.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ChunkRoute {
    Uncombine { damage_per_cell: f32 },
    Detach,
    Shatter,
    Absorb,
    ExposeShell,
    DestroyRandomVoxel,
}

pub fn route_wall_chunk(
    damage: f32,
    cells: usize,
    window: bool,
    threshold: f32,
    throttle: &mut UncombineThrottle,
    now: u64,
) -> ChunkRoute {
    if throttle.try_acquire(now) {
        ChunkRoute::Uncombine {
            damage_per_cell: damage / cells.max(1) as f32,
        }
    } else if damage >= threshold {
        if window {
            ChunkRoute::Shatter
        } else {
            ChunkRoute::Detach
        }
    } else {
        ChunkRoute::Absorb
    }
}

pub fn route_member_chunk(damage: f32, piece_health: f32) -> ChunkRoute {
    if damage > piece_health {
        ChunkRoute::DestroyRandomVoxel
    } else {
        ChunkRoute::ExposeShell
    }
}

impl Structure {
    pub fn damage_chunk(&mut self, chunk: ChunkId, amount: f32) {
        let Some(c) = self.chunks.get_mut(&chunk) else {
            log::warn!("damage for missing {chunk}");
            return;
        };
        if c.broken {
            return;
        }
        c.damage = (c.damage + amount).min(f32::MAX);
        let damage = c.damage;

        match c.kind.clone() {
            ChunkKind::WallCells {
                wall,
                cells,
                window,
            } => {
                let route = route_wall_chunk(
                    damage,
                    cells.len(),
                    window,
                    self.config.wall.piece_health,
                    &mut self.throttle,
                    self.tick,
                );
                log::debug!("{chunk} took {amount} ({damage} total): {route:?}");
                match route {
                    ChunkRoute::Uncombine { damage_per_cell } => {
                        self.begin_uncombine(chunk, damage_per_cell)
                    }
                    ChunkRoute::Detach => self.detach_chunk(chunk),
                    ChunkRoute::Shatter => self.shatter_chunk(chunk),
                    _ => {}
                }
                if let Some(group) = self.walls.get(&wall).and_then(|w| w.group) {
                    self.note_group_damage(group);
                }
            }
            ChunkKind::MemberVoxels { member } => {
                let group = self.members.get(&member).map(|m| m.group);
                match route_member_chunk(damage, self.config.member.piece_health) {
                    ChunkRoute::DestroyRandomVoxel => self.destroy_random_voxel(member),
                    _ => self.expose_member(member),
                }
                if let Some(group) = group {
                    self.note_group_damage(group);
                }
            }
        }
    }

    /// Start restoring a wall chunk's cells, `damage_per_cell` each.
    fn begin_uncombine(&mut self, chunk: ChunkId, damage_per_cell: f32) {
        let Some(c) = self.chunks.get_mut(&chunk) else {
            return;
        };
        let ChunkKind::WallCells { wall, cells, .. } = &c.kind else {
            return;
        };
        c.broken = true;
        let (wall, cells) = (*wall, cells.clone());

        if let Some(w) = self.walls.get_mut(&wall) {
            w.validation.rebuilding += 1;
        }
        self.geometry.release_combined(chunk);
        self.emit(SimEventKind::ChunkUncombined {
            chunk,
            cells: cells.len(),
        });
        self.event_queue.schedule(
            self.tick,
            ScheduledEventKind::UncombineStep {
                wall,
                chunk,
                remaining: cells,
                damage_per_cell,
            },
        );
    }

    /// One step of a staged uncombine.
    pub(crate) fn uncombine_step(
        &mut self,
        wall: WallId,
        chunk: ChunkId,
        mut remaining: Vec<CellId>,
        damage_per_cell: f32,
    ) {
        if !self.walls.contains_key(&wall) {
            return;
        }
        if !self.chunks.contains_key(&chunk) {
            self.finish_uncombine(wall, chunk);
            return;
        }

        let take = (self.config.throttle.cells_per_step as usize).min(remaining.len());
        for cell in remaining.drain(..take).collect::<Vec<_>>() {
            let Some(c) = self.cells.get_mut(&cell) else {
                continue;
            };
            c.chunk = None;
            c.damage = (c.damage + damage_per_cell).min(f32::MAX);
            let health = if c.kind.is_window() {
                self.config.wall.window_health
            } else {
                self.config.wall.piece_health
            };
            let lethal = c.damage >= health;
            self.geometry.build_wall_cell(wall, cell);
            if lethal {
                self.destroy_cell(cell);
            }
        }

        if remaining.is_empty() {
            self.finish_uncombine(wall, chunk);
        } else {
            self.event_queue.schedule(
                self.tick + 1,
                ScheduledEventKind::UncombineStep {
                    wall,
                    chunk,
                    remaining,
                    damage_per_cell,
                },
            );
        }
    }

    fn finish_uncombine(&mut self, wall: WallId, chunk: ChunkId) {
        self.chunks.remove(&chunk);
        if let Some(w) = self.walls.get_mut(&wall) {
            w.chunks.remove(&chunk);
            w.validation.rebuilding = w.validation.rebuilding.saturating_sub(1);
        }
        self.request_wall_validation(wall);
    }

    /// Cheap path: the whole chunk leaves the wall as one rigid fragment.
    fn detach_chunk(&mut self, chunk: ChunkId) {
        let Some(ChunkKind::WallCells { wall, cells, .. }) =
            self.chunks.get(&chunk).map(|c| c.kind.clone())
        else {
            return;
        };
        let position = centroid(cells.iter().filter_map(|c| self.cell_world_position(*c)));

        self.chunks.remove(&chunk);
        for cell in &cells {
            let Some(c) = self.cells.remove(cell) else {
                continue;
            };
            if let Some(w) = self.walls.get_mut(&wall) {
                if let Some(i) = w.index(c.pos) {
                    if w.cells[i] == Some(*cell) {
                        w.cells[i] = None;
                    }
                }
            }
        }
        if let Some(w) = self.walls.get_mut(&wall) {
            w.chunks.remove(&chunk);
        }

        let mass = self.config.wall.piece_mass * cells.len() as f32;
        let fragment = self.register_fragment(
            FragmentKind::WallChunk { cells: cells.len() },
            position,
            mass,
            Lifetime::Medium,
        );
        log::debug!("{chunk} detached from {wall} with {} cells", cells.len());
        self.emit(SimEventKind::ChunkDetached { chunk, fragment });
        self.request_wall_validation(wall);
    }

    /// A window chunk breaking without budget: every pane gets lethal damage.
    fn shatter_chunk(&mut self, chunk: ChunkId) {
        let Some(ChunkKind::WallCells { cells, .. }) = self.chunks.get(&chunk).map(|c| &c.kind)
        else {
            return;
        };
        let count = cells.len();
        let position = centroid(cells.iter().filter_map(|c| self.cell_world_position(*c)));
        self.emit(SimEventKind::WindowShatter {
            position,
            intensity: count as f32,
        });
        self.begin_uncombine(chunk, f32::MAX);
    }

    /// An intact chunk that lost support comes off whole.
    pub(crate) fn break_off_chunk(&mut self, chunk: ChunkId) {
        let window = match self.chunks.get(&chunk).map(|c| &c.kind) {
            Some(ChunkKind::WallCells { window, .. }) => *window,
            _ => return,
        };
        if window {
            self.shatter_chunk(chunk);
        } else {
            self.detach_chunk(chunk);
        }
    }
}
