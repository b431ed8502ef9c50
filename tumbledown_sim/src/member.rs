// Members and voxels: the beams of a structure.
//
// A `Member` is a straight beam between two joints, subdivided into an ordered
// run of voxels. A voxel is the smallest destructible unit; its slot in
// `Member::voxels` becomes `None` when it breaks, so indices stay stable and
// "where along the beam" questions stay answerable.
//
// ## Damage and splitting
//
// When a voxel's damage reaches `member.piece_health` it is destroyed and the
// member reacts:
// - First break (`flags.split` unset): an interior break splits the beam. A
//   new sibling member takes every voxel after the break and the end joint;
//   the original keeps the voxels before it and the start joint. A break at
//   either end only lets go of that end's joint.
// - Later breaks: no further sibling is made. The shorter run of live voxels
//   on either side of the break falls off as a debris fragment, together with
//   the joint on that side if it has one.
// - A member with no live voxels left is destroyed.
// Any first break clears `flags.grounded`.
//
// Adjacency is symmetric and maintained incrementally: two members are
// adjacent while they share at least one live joint and the same group.
//
// ## Combined shell
//
// Members start combined into one `MemberVoxels` chunk (see `chunk.rs`). Any
// direct voxel damage breaks the shell open first ("exposing" it), after which
// voxels have individual geometry.
//
// See also: `connection.rs` for joint bookkeeping, `group.rs` for what
// happens to a member once it has lost its path to the ground.

use crate::debris::{FragmentKind, Lifetime};
use crate::event::SimEventKind;
use crate::structure::Structure;
use crate::types::*;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Voxel {
    pub id: VoxelId,
    /// `None` once the voxel has fallen off its member as debris.
    pub member: Option<MemberId>,
    /// Centre in the owning group's local space.
    pub center: Vec3,
    pub damage: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberFlags {
    /// Rests on the ground; a source for the ground-distance search.
    pub grounded: bool,
    /// Has already been split once.
    pub split: bool,
    /// Was moved into a group split off the original structure.
    pub grouped: bool,
    /// Was created as the sibling half of a split.
    pub new_split: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub group: GroupId,
    pub mass: f32,
    pub support_capacity: f32,
    pub accumulated_load: f32,
    /// Hops to the nearest grounded member, `UNREACHABLE` if none.
    pub ground_distance: u32,
    pub flags: MemberFlags,
    pub voxels: Vec<Option<VoxelId>>,
    pub adjacency: SmallVec<[MemberId; 6]>,
    pub start: Option<ConnectionId>,
    pub end: Option<ConnectionId>,
    /// Combined shell chunk while the member is still combined.
    pub shell: Option<ChunkId>,
}

impl Member {
    pub fn live_voxels(&self) -> impl Iterator<Item = VoxelId> + '_ {
        self.voxels.iter().flatten().copied()
    }

    pub fn live_count(&self) -> usize {
        self.voxels.iter().filter(|v| v.is_some()).count()
    }

    pub fn index_of(&self, voxel: VoxelId) -> Option<usize> {
        self.voxels.iter().position(|v| *v == Some(voxel))
    }

    /// The joints this member is wired to.
    pub fn connections(&self) -> SmallVec<[ConnectionId; 2]> {
        let mut out = SmallVec::new();
        out.extend(self.start);
        if self.end != self.start {
            out.extend(self.end);
        }
        out
    }
}

/// Which side of a break falls off an already-split member.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunSide {
    /// Voxels before the break (the start joint's side).
    Prefix,
    /// Voxels after the break (the end joint's side).
    Suffix,
}

/// Pick the run to detach after `voxels[index]` broke: the side with fewer
/// live voxels. A sibling made by a split hangs from its end joint, so on
/// ties it drops its prefix; an original member drops its suffix.
pub fn shorter_run(voxels: &[Option<VoxelId>], index: usize, new_split: bool) -> RunSide {
    let before = voxels[..index].iter().filter(|v| v.is_some()).count();
    let after = voxels[index + 1..].iter().filter(|v| v.is_some()).count();
    if before < after {
        RunSide::Prefix
    } else if after < before {
        RunSide::Suffix
    } else if new_split {
        RunSide::Prefix
    } else {
        RunSide::Suffix
    }
}

impl Structure {
    /// Apply damage to one voxel, breaking it open at `member.piece_health`.
    pub fn damage_voxel(&mut self, voxel: VoxelId, amount: f32) {
        let Some(v) = self.voxels.get(&voxel) else {
            log::warn!("damage for missing {voxel}");
            return;
        };
        let Some(member) = v.member.filter(|m| self.members.contains_key(m)) else {
            log::debug!("{voxel} is loose debris, ignoring damage");
            return;
        };
        let group = self.members[&member].group;

        self.expose_member(member);

        let health = self.config.member.piece_health;
        let lethal = match self.voxels.get_mut(&voxel) {
            Some(v) => {
                v.damage = (v.damage + amount).min(f32::MAX);
                v.damage >= health
            }
            None => false,
        };
        if lethal {
            self.destroy_voxel(voxel);
        }
        self.note_group_damage(group);
    }

    pub(crate) fn destroy_voxel(&mut self, voxel: VoxelId) {
        let Some(position) = self.voxel_world_position(voxel) else {
            return;
        };
        let Some(v) = self.voxels.remove(&voxel) else {
            return;
        };
        let Some(member) = v.member else {
            return;
        };
        let Some(m) = self.members.get_mut(&member) else {
            return;
        };
        let Some(index) = m.index_of(voxel) else {
            return;
        };
        m.voxels[index] = None;
        let group = m.group;
        let remaining = m.live_count();
        let already_split = m.flags.split;

        self.emit(SimEventKind::VoxelDestroyed { member, voxel });
        self.crumble(position, 1.0);

        if remaining == 0 {
            self.destroy_member(member);
        } else if !already_split {
            self.split_member(member, index);
        } else {
            self.detach_unconnected_run(member, index);
        }
        self.request_group_validation(group);
    }

    /// First break of a member at `index`.
    fn split_member(&mut self, member: MemberId, index: usize) {
        let Some(m) = self.members.get_mut(&member) else {
            return;
        };
        m.flags.split = true;
        m.flags.grounded = false;
        let last = m.voxels.len() - 1;
        let (start, end) = (m.start, m.end);

        if index == 0 {
            if let Some(c) = start {
                self.detach_member_from_connection(member, c);
            }
        } else if index == last {
            if let Some(c) = end {
                self.detach_member_from_connection(member, c);
            }
        } else {
            self.spawn_sibling(member, index);
        }
    }

    /// Cut `member` at `index`: a new member takes the voxels after it and
    /// the end joint.
    fn spawn_sibling(&mut self, member: MemberId, index: usize) {
        let sibling = MemberId(self.next_raw_id());
        let Some(m) = self.members.get_mut(&member) else {
            return;
        };
        let slots = m.voxels.len() as f32;
        let tail = m.voxels.split_off(index + 1);
        m.voxels.truncate(index);

        let per_voxel = m.mass / slots;
        let sibling_mass = per_voxel * tail.len() as f32;
        m.mass = per_voxel * index as f32;
        let end = m.end.take();

        let new_member = Member {
            id: sibling,
            group: m.group,
            mass: sibling_mass,
            support_capacity: m.support_capacity,
            accumulated_load: 0.0,
            ground_distance: m.ground_distance,
            flags: MemberFlags {
                grounded: false,
                split: true,
                grouped: m.flags.grouped,
                new_split: true,
            },
            voxels: tail,
            adjacency: SmallVec::new(),
            start: None,
            end,
            shell: None,
        };
        let group = m.group;

        for v in new_member.live_voxels() {
            if let Some(voxel) = self.voxels.get_mut(&v) {
                voxel.member = Some(sibling);
            }
        }
        self.members.insert(sibling, new_member);
        if let Some(g) = self.groups.get_mut(&group) {
            g.members.insert(sibling);
        }

        if let Some(c) = end {
            let neighbours: SmallVec<[MemberId; 8]> = match self.connections.get_mut(&c) {
                Some(conn) => {
                    conn.replace_member(member, sibling);
                    conn.members()
                }
                None => SmallVec::new(),
            };
            for n in neighbours {
                if n == sibling {
                    continue;
                }
                if !self.share_live_connection(member, n) {
                    self.unlink(member, n);
                }
                if self.members.get(&n).is_some_and(|o| o.group == group) {
                    self.link(sibling, n);
                }
            }
        }

        log::info!("{member} split at voxel {index}, tail is now {sibling}");
        self.emit(SimEventKind::MemberSplit { member, sibling });
    }

    /// Later break of an already-split member: drop the shorter side.
    fn detach_unconnected_run(&mut self, member: MemberId, index: usize) {
        let Some(m) = self.members.get(&member) else {
            return;
        };
        let side = shorter_run(&m.voxels, index, m.flags.new_split);
        let live_before = m.live_count() as f32;
        let (run_range, joint) = match side {
            RunSide::Prefix => (0..index, m.start),
            RunSide::Suffix => (index + 1..m.voxels.len(), m.end),
        };
        let run: Vec<VoxelId> = m.voxels[run_range.clone()].iter().flatten().copied().collect();
        let position = centroid(run.iter().filter_map(|v| self.voxel_world_position(*v)));

        if let Some(c) = joint {
            self.detach_member_from_connection(member, c);
        }
        if run.is_empty() {
            return;
        }
        let Some(m) = self.members.get_mut(&member) else {
            return;
        };
        for slot in &mut m.voxels[run_range] {
            *slot = None;
        }
        let per_voxel = m.mass / live_before;
        let mass = per_voxel * run.len() as f32;
        m.mass -= mass;

        for v in &run {
            if let Some(voxel) = self.voxels.get_mut(v) {
                voxel.member = None;
                voxel.center = position;
            }
        }
        let count = run.len();
        let fragment = self.register_fragment(
            FragmentKind::MemberRun { voxels: run.clone() },
            position,
            mass,
            Lifetime::Medium,
        );
        if fragment.is_none() {
            for v in &run {
                self.voxels.remove(v);
            }
        }
        log::debug!("{member} dropped {count} voxels ({side:?})");
        self.emit(SimEventKind::RunDetached {
            member,
            voxels: count,
            fragment,
        });
    }

    /// Overload damage: break one live voxel picked at random.
    pub(crate) fn destroy_random_voxel(&mut self, member: MemberId) {
        self.expose_member(member);
        let Some(m) = self.members.get(&member) else {
            return;
        };
        let live: Vec<VoxelId> = m.live_voxels().collect();
        let Some(i) = self.rng.pick_index(live.len()) else {
            return;
        };
        self.destroy_voxel(live[i]);
    }

    /// Break the combined shell of `member` so its voxels get individual
    /// geometry. No-op for a member that is already exposed.
    pub(crate) fn expose_member(&mut self, member: MemberId) {
        let Some(m) = self.members.get_mut(&member) else {
            return;
        };
        let Some(shell) = m.shell.take() else {
            return;
        };
        let voxels: Vec<VoxelId> = m.live_voxels().collect();
        self.chunks.remove(&shell);
        self.geometry.release_combined(shell);
        self.geometry.build_member(member, &voxels);
        self.emit(SimEventKind::MemberExposed { member });
    }

    /// Remove a member and every reference to it.
    pub fn destroy_member(&mut self, member: MemberId) {
        let Some(m) = self.members.remove(&member) else {
            return;
        };
        for v in m.voxels.iter().flatten() {
            self.voxels.remove(v);
        }
        if let Some(shell) = m.shell {
            self.chunks.remove(&shell);
            self.geometry.release_combined(shell);
        }
        for n in &m.adjacency {
            if let Some(other) = self.members.get_mut(n) {
                other.adjacency.retain(|a| *a != member);
            }
        }
        let joints = m.connections();
        for c in &joints {
            if let Some(conn) = self.connections.get_mut(c) {
                conn.clear_member(member);
            }
        }
        if let Some(g) = self.groups.get_mut(&m.group) {
            g.members.remove(&member);
        }

        log::debug!("{member} destroyed");
        self.emit(SimEventKind::MemberDestroyed { member });
        for c in joints {
            self.connection_check(c);
        }
        self.request_group_validation(m.group);
    }

    // -----------------------------------------------------------------------
    // Adjacency
    // -----------------------------------------------------------------------

    pub(crate) fn link(&mut self, a: MemberId, b: MemberId) {
        if a == b || !self.members.contains_key(&a) || !self.members.contains_key(&b) {
            return;
        }
        for (x, y) in [(a, b), (b, a)] {
            if let Some(m) = self.members.get_mut(&x) {
                if !m.adjacency.contains(&y) {
                    m.adjacency.push(y);
                }
            }
        }
    }

    pub(crate) fn unlink(&mut self, a: MemberId, b: MemberId) {
        for (x, y) in [(a, b), (b, a)] {
            if let Some(m) = self.members.get_mut(&x) {
                m.adjacency.retain(|n| *n != y);
            }
        }
    }

    /// Whether `a` and `b` are both wired to some joint that still exists.
    pub(crate) fn share_live_connection(&self, a: MemberId, b: MemberId) -> bool {
        let (Some(ma), Some(mb)) = (self.members.get(&a), self.members.get(&b)) else {
            return false;
        };
        let theirs = mb.connections();
        ma.connections()
            .iter()
            .any(|c| theirs.contains(c) && self.connections.contains_key(c))
    }
}
