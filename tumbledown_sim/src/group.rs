// Structural groups: ground distance, load propagation, component splitting.
//
// A `Group` is a connected set of members, joints and walls that share one
// rigid body. The original authored structure is one group standing on its
// grounded members; every piece that breaks away becomes a new, detached
// group that falls as a unit.
//
// ## Algorithms
//
// The graph algorithms are free functions over the member arena so they can
// be tested on hand-built graphs:
//
// - `ground_distances()`: multi-source BFS from every grounded member over
//   the adjacency relation, skipping members that are gone or owned by
//   another group. Unreached members get `UNREACHABLE`.
// - `propagate_loads()`: every member starts carrying its own mass. Members
//   are visited farthest-from-ground first; each splits what it carries
//   evenly over its "lower supports" (neighbours strictly closer to ground).
//   On the initial pass the shares become built-in reserve capacity instead
//   of load. A member with no lower support keeps its load.
// - `connected_components()`: plain BFS partition of a member set.
//
// ## Validation
//
// `run_group_validation()` is the pass the rest of the crate requests. For
// a grounded group it recomputes ground distances, extracts every member
// that lost its path to ground (one new group per connected piece), then
// reruns load propagation and schedules overload damage. For a detached
// group it only splits off all but the largest connected component.
//
// Requests are coalesced by `GroupValidation`: Idle -> Pending (a pass is
// queued) -> Validating (a pass is running). A request while Pending is
// absorbed; a request while Validating sets `validate_again`, and the pass
// reschedules itself one interval later. Damage also keeps a periodic pass
// going for `validation_window_ticks`.
//
// ## Extraction
//
// `extract_component()` moves members into a fresh group centred on their
// centroid, preserving world positions. Joints move only if every member
// they hold moves; otherwise they are destroyed. Walls move only if every
// live edge member they hang from moves. The new group is registered with
// the debris pool with a lifetime picked by its size.
//
// **Critical constraint: determinism.** BFS frontiers are seeded in ID
// order, and load propagation breaks distance ties by member ID.

use crate::debris::{FragmentKind, Lifetime};
use crate::event::{ScheduledEventKind, SimEventKind};
use crate::member::Member;
use crate::structure::Structure;
use crate::types::*;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RigidBody {
    /// World position of the group's local origin.
    pub origin: Vec3,
    pub mass: f32,
    pub velocity: Vec3,
    /// Kinematic bodies are held in place; the authored structure is
    /// kinematic until something breaks off it.
    pub kinematic: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationPhase {
    #[default]
    Idle,
    Pending,
    Validating,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GroupValidation {
    pub phase: ValidationPhase,
    pub validate_again: bool,
    /// Periodic passes keep running until this tick.
    pub window_ends_at: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub members: BTreeSet<MemberId>,
    pub connections: BTreeSet<ConnectionId>,
    pub walls: BTreeSet<WallId>,
    pub strength_modifier: f32,
    pub min_propagation_ticks: u64,
    pub max_propagation_ticks: u64,
    /// No longer the grounded, authored structure.
    pub is_detached: bool,
    pub body: RigidBody,
    pub validation: GroupValidation,
    /// An overload damage chain is running.
    pub overload_active: bool,
    /// Debris handle for detached groups.
    pub fragment: Option<FragmentId>,
}

impl Group {
    pub fn is_empty(&self) -> bool {
        self.members.is_empty() && self.connections.is_empty() && self.walls.is_empty()
    }
}

/// Which propagation pass is running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassKind {
    /// At authoring time: shares become reserve capacity.
    Initial,
    /// At runtime: shares become load.
    Propagation,
}

// ---------------------------------------------------------------------------
// Graph algorithms
// ---------------------------------------------------------------------------

/// Hop count from each member of `ids` to the nearest grounded member.
pub fn ground_distances(
    members: &BTreeMap<MemberId, Member>,
    group: GroupId,
    ids: &BTreeSet<MemberId>,
) -> BTreeMap<MemberId, u32> {
    let mut dist: BTreeMap<MemberId, u32> = ids.iter().map(|&id| (id, UNREACHABLE)).collect();
    let mut queue = VecDeque::new();

    for &id in ids {
        if members.get(&id).is_some_and(|m| m.flags.grounded) {
            dist.insert(id, 0);
            queue.push_back(id);
        }
    }

    while let Some(current) = queue.pop_front() {
        let Some(member) = members.get(&current) else {
            continue;
        };
        let next = dist[&current] + 1;
        for &n in &member.adjacency {
            let eligible = ids.contains(&n) && members.get(&n).is_some_and(|m| m.group == group);
            if !eligible {
                continue;
            }
            if let Some(d) = dist.get_mut(&n) {
                if *d == UNREACHABLE {
                    *d = next;
                    queue.push_back(n);
                }
            }
        }
    }

    dist
}

/// Distribute mass toward the ground. For `PassKind::Propagation` returns each
/// member's accumulated load; for `PassKind::Initial` returns the reserve
/// capacity each member receives from the members it supports.
///
/// Reads `ground_distance` from the members, so run `ground_distances()` and
/// store the result first.
pub fn propagate_loads(
    members: &BTreeMap<MemberId, Member>,
    ids: &BTreeSet<MemberId>,
    kind: PassKind,
) -> BTreeMap<MemberId, f32> {
    let mut load: BTreeMap<MemberId, f32> = BTreeMap::new();
    let mut reserve: BTreeMap<MemberId, f32> = BTreeMap::new();
    for &id in ids {
        if let Some(m) = members.get(&id) {
            load.insert(id, m.mass);
            reserve.insert(id, 0.0);
        }
    }

    let mut order: Vec<(u32, MemberId)> = ids
        .iter()
        .filter_map(|id| members.get(id))
        .filter(|m| m.ground_distance != UNREACHABLE)
        .map(|m| (m.ground_distance, m.id))
        .collect();
    order.sort_by_key(|&(d, id)| (Reverse(d), id));

    for (distance, id) in order {
        let Some(member) = members.get(&id) else {
            continue;
        };
        let supports: Vec<MemberId> = member
            .adjacency
            .iter()
            .copied()
            .filter(|n| {
                ids.contains(n)
                    && members
                        .get(n)
                        .is_some_and(|s| s.group == member.group && s.ground_distance < distance)
            })
            .collect();
        if supports.is_empty() {
            continue;
        }
        let share = load[&id] / supports.len() as f32;
        let target = match kind {
            PassKind::Initial => &mut reserve,
            PassKind::Propagation => &mut load,
        };
        for s in supports {
            *target.entry(s).or_insert(0.0) += share;
        }
    }

    match kind {
        PassKind::Initial => reserve,
        PassKind::Propagation => load,
    }
}

/// Partition `ids` into adjacency-connected components, in order of each
/// component's lowest member ID.
pub fn connected_components(
    members: &BTreeMap<MemberId, Member>,
    ids: &BTreeSet<MemberId>,
) -> Vec<Vec<MemberId>> {
    let mut visited: FxHashSet<MemberId> = FxHashSet::default();
    let mut components = Vec::new();

    for &seed in ids {
        if !visited.insert(seed) {
            continue;
        }
        let mut component = vec![seed];
        let mut queue = VecDeque::from([seed]);
        while let Some(current) = queue.pop_front() {
            let Some(member) = members.get(&current) else {
                continue;
            };
            for &n in &member.adjacency {
                if ids.contains(&n) && visited.insert(n) {
                    component.push(n);
                    queue.push_back(n);
                }
            }
        }
        component.sort();
        components.push(component);
    }

    components
}

/// Index of the component to keep: the largest, earliest on ties.
fn largest_component(components: &[Vec<MemberId>]) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None;
    for (i, c) in components.iter().enumerate() {
        if best.is_none_or(|(_, len)| c.len() > len) {
            best = Some((i, c.len()));
        }
    }
    best.map(|(i, _)| i)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Structure {
    pub fn add_group(&mut self, origin: Vec3) -> GroupId {
        let id = GroupId(self.next_raw_id());
        let group = Group {
            id,
            members: BTreeSet::new(),
            connections: BTreeSet::new(),
            walls: BTreeSet::new(),
            strength_modifier: self.config.group.strength_modifier,
            min_propagation_ticks: self.config.group.min_propagation_ticks,
            max_propagation_ticks: self.config.group.max_propagation_ticks,
            is_detached: false,
            body: RigidBody {
                origin,
                mass: 0.0,
                velocity: [0.0; 3],
                kinematic: true,
            },
            validation: GroupValidation::default(),
            overload_active: false,
            fragment: None,
        };
        self.groups.insert(id, group);
        id
    }

    /// Ask for a validation pass. Coalesces with a pass that is already
    /// queued or running.
    pub fn request_group_validation(&mut self, group: GroupId) {
        let now = self.tick;
        let Some(g) = self.groups.get_mut(&group) else {
            log::debug!("validation requested for missing {group}");
            return;
        };
        match g.validation.phase {
            ValidationPhase::Validating => g.validation.validate_again = true,
            ValidationPhase::Pending => {}
            ValidationPhase::Idle => {
                g.validation.phase = ValidationPhase::Pending;
                self.event_queue
                    .schedule(now, ScheduledEventKind::GroupValidation { group });
            }
        }
    }

    /// Record a damage event: keeps periodic validation alive for a while and
    /// requests a pass.
    pub(crate) fn note_group_damage(&mut self, group: GroupId) {
        let until = self.tick + self.config.group.validation_window_ticks;
        if let Some(g) = self.groups.get_mut(&group) {
            g.validation.window_ends_at = g.validation.window_ends_at.max(until);
        }
        self.request_group_validation(group);
    }

    pub(crate) fn run_group_validation(&mut self, group: GroupId) {
        let Some(g) = self.groups.get_mut(&group) else {
            return;
        };
        g.validation.phase = ValidationPhase::Validating;
        let detached = g.is_detached;

        self.prune_group_topology(group);
        if detached {
            self.split_detached(group);
        } else {
            self.validate_grounded(group);
        }

        let walls: Vec<WallId> = self
            .groups
            .get(&group)
            .map(|g| g.walls.iter().copied().collect())
            .unwrap_or_default();
        for wall in walls {
            self.request_wall_validation(wall);
        }
        if self.destroy_group_if_empty(group) {
            return;
        }

        let now = self.tick;
        let interval = self.config.group.validation_interval_ticks;
        let Some(g) = self.groups.get_mut(&group) else {
            return;
        };
        if g.validation.validate_again || now < g.validation.window_ends_at {
            g.validation.validate_again = false;
            g.validation.phase = ValidationPhase::Pending;
            self.event_queue
                .schedule(now + interval, ScheduledEventKind::GroupValidation { group });
        } else {
            g.validation.phase = ValidationPhase::Idle;
        }
    }

    /// Drop adjacency and slot references that point at dead members or
    /// across group boundaries.
    pub(crate) fn prune_group_topology(&mut self, group: GroupId) {
        let Some(g) = self.groups.get(&group) else {
            return;
        };
        let ids: Vec<MemberId> = g.members.iter().copied().collect();
        let joints: Vec<ConnectionId> = g.connections.iter().copied().collect();

        let mut stale: Vec<(MemberId, MemberId)> = Vec::new();
        for &id in &ids {
            let Some(m) = self.members.get(&id) else {
                continue;
            };
            for &n in &m.adjacency {
                let keep = n != id
                    && self
                        .members
                        .get(&n)
                        .is_some_and(|other| other.group == group && other.adjacency.contains(&id));
                if !keep {
                    stale.push((id, n));
                }
            }
        }
        for (a, b) in stale {
            log::debug!("pruning stale adjacency {a} -> {b}");
            self.unlink(a, b);
        }

        for c in joints {
            let dead: Vec<MemberId> = match self.connections.get(&c) {
                Some(conn) => conn
                    .members()
                    .into_iter()
                    .filter(|m| self.members.get(m).is_none_or(|mm| mm.group != group))
                    .collect(),
                None => continue,
            };
            if dead.is_empty() {
                continue;
            }
            for m in dead {
                self.detach_member_from_connection(m, c);
            }
        }

        // Drop IDs of members that no longer exist.
        let members = &self.members;
        if let Some(g) = self.groups.get_mut(&group) {
            g.members.retain(|m| members.get(m).is_some_and(|mm| mm.group == group));
        }
    }

    fn validate_grounded(&mut self, group: GroupId) {
        let Some(ids) = self.groups.get(&group).map(|g| g.members.clone()) else {
            return;
        };
        if ids.is_empty() {
            return;
        }

        let dist = ground_distances(&self.members, group, &ids);
        for (id, d) in &dist {
            if let Some(m) = self.members.get_mut(id) {
                m.ground_distance = *d;
            }
        }
        let unreachable: BTreeSet<MemberId> = dist
            .iter()
            .filter(|(_, d)| **d == UNREACHABLE)
            .map(|(id, _)| *id)
            .collect();

        if unreachable.len() == ids.len() {
            log::info!("{group} lost every path to ground");
            self.detach_whole_group(group);
            self.split_detached(group);
            return;
        }

        if !unreachable.is_empty() {
            log::debug!(
                "{group}: {} of {} members unreachable from ground",
                unreachable.len(),
                ids.len()
            );
            if let Some(g) = self.groups.get_mut(&group) {
                for id in &unreachable {
                    g.members.remove(id);
                }
            }
            for component in connected_components(&self.members, &unreachable) {
                self.extract_component(group, component);
            }
        }

        self.propagate(group, PassKind::Propagation);
    }

    /// Run one load pass over the group and apply its result.
    pub(crate) fn propagate(&mut self, group: GroupId, kind: PassKind) {
        let Some(g) = self.groups.get(&group) else {
            return;
        };
        let ids = g.members.clone();
        let strength = g.strength_modifier;
        let result = propagate_loads(&self.members, &ids, kind);

        match kind {
            PassKind::Initial => {
                for (id, reserve) in result {
                    if let Some(m) = self.members.get_mut(&id) {
                        m.support_capacity += reserve + strength;
                        m.accumulated_load = m.mass;
                    }
                }
            }
            PassKind::Propagation => {
                let mut overloaded: Vec<(u32, MemberId)> = Vec::new();
                for (id, load) in result {
                    if let Some(m) = self.members.get_mut(&id) {
                        m.accumulated_load = load;
                        if load > m.support_capacity {
                            overloaded.push((m.ground_distance, id));
                        }
                    }
                }
                if !overloaded.is_empty() {
                    overloaded.sort_by_key(|&(d, id)| (Reverse(d), id));
                    let members = overloaded.into_iter().map(|(_, id)| id).collect();
                    self.start_overload_damage(group, members);
                }
            }
        }
    }

    fn propagation_delay(&mut self, group: GroupId) -> u64 {
        let (low, high) = self
            .groups
            .get(&group)
            .map(|g| (g.min_propagation_ticks, g.max_propagation_ticks))
            .unwrap_or((
                self.config.group.min_propagation_ticks,
                self.config.group.max_propagation_ticks,
            ));
        self.rng.range_inclusive_u64(low, high)
    }

    fn start_overload_damage(&mut self, group: GroupId, members: Vec<MemberId>) {
        let Some(g) = self.groups.get_mut(&group) else {
            return;
        };
        if g.overload_active {
            return;
        }
        g.overload_active = true;
        log::debug!("{group}: {} members overloaded", members.len());
        let at = self.tick + self.propagation_delay(group);
        self.event_queue.schedule(
            at,
            ScheduledEventKind::OverloadDamage {
                group,
                members,
                next: 0,
            },
        );
    }

    /// One step of damage-over-time: the next overloaded member loses a
    /// random voxel, then the chain waits a random delay.
    pub(crate) fn overload_step(&mut self, group: GroupId, members: Vec<MemberId>, next: usize) {
        if !self.groups.contains_key(&group) {
            return;
        }
        if let Some(&id) = members.get(next) {
            let target = self.members.get(&id).filter(|m| {
                m.group == group && !m.flags.split && !m.flags.grounded && m.live_count() > 0
            });
            if let Some(m) = target {
                let intensity = if m.support_capacity > 0.0 {
                    m.accumulated_load / m.support_capacity
                } else {
                    1.0
                };
                if let Some(position) = self.member_world_position(id) {
                    self.emit(SimEventKind::MemberStress {
                        member: id,
                        position,
                        intensity,
                    });
                }
                self.destroy_random_voxel(id);
            }
        }

        if !self.groups.contains_key(&group) {
            return;
        }
        if next + 1 < members.len() {
            let at = self.tick + self.propagation_delay(group);
            self.event_queue.schedule(
                at,
                ScheduledEventKind::OverloadDamage {
                    group,
                    members,
                    next: next + 1,
                },
            );
        } else if let Some(g) = self.groups.get_mut(&group) {
            g.overload_active = false;
        }
    }

    // -----------------------------------------------------------------------
    // Splitting
    // -----------------------------------------------------------------------

    /// Turn the group itself into falling debris.
    fn detach_whole_group(&mut self, group: GroupId) {
        let Some(g) = self.groups.get_mut(&group) else {
            return;
        };
        if g.is_detached {
            return;
        }
        g.is_detached = true;
        g.body.kinematic = false;
        let size = g.members.len();
        let mass = g.body.mass;
        let origin = g.body.origin;
        let lifetime = Lifetime::for_component_size(size);

        match self.register_fragment(FragmentKind::Group(group), origin, mass, lifetime) {
            Some(fragment) => {
                if let Some(g) = self.groups.get_mut(&group) {
                    g.fragment = Some(fragment);
                }
                self.schedule_cleanup(group);
            }
            None => self.destroy_group_contents(group),
        }
    }

    /// Keep the largest connected component, extract the rest.
    pub(crate) fn split_detached(&mut self, group: GroupId) {
        let Some(ids) = self.groups.get(&group).map(|g| g.members.clone()) else {
            return;
        };
        let components = connected_components(&self.members, &ids);
        if components.len() <= 1 {
            return;
        }
        let Some(keep) = largest_component(&components) else {
            return;
        };
        log::debug!("{group} split into {} components", components.len());

        if let Some(g) = self.groups.get_mut(&group) {
            for (i, component) in components.iter().enumerate() {
                if i != keep {
                    for id in component {
                        g.members.remove(id);
                    }
                }
            }
        }
        for (i, component) in components.into_iter().enumerate() {
            if i != keep {
                self.extract_component(group, component);
            }
        }
    }

    /// Move `component` out of `source` into a new detached group.
    pub(crate) fn extract_component(
        &mut self,
        source: GroupId,
        component: Vec<MemberId>,
    ) -> Option<GroupId> {
        let src = self.groups.get(&source)?;
        let src_origin = src.body.origin;
        let src_velocity = src.body.velocity;
        let strength = src.strength_modifier;
        let (min_ticks, max_ticks) = (src.min_propagation_ticks, src.max_propagation_ticks);
        let src_walls: Vec<WallId> = src.walls.iter().copied().collect();

        let moving: BTreeSet<MemberId> = component
            .iter()
            .copied()
            .filter(|m| self.members.contains_key(m))
            .collect();
        if moving.is_empty() {
            return None;
        }

        // Edge members must be read while everything still belongs to `source`.
        let mut wall_edges: Vec<(WallId, BTreeSet<MemberId>)> = Vec::new();
        for wall in src_walls {
            self.refresh_wall_edges(wall);
            if let Some(w) = self.walls.get(&wall) {
                wall_edges.push((wall, w.edge_members.clone()));
            }
        }

        let center = centroid(moving.iter().filter_map(|&m| self.member_world_position(m)));
        let offset = sub(src_origin, center);
        let id = self.add_group(center);

        let mut mass = 0.0;
        let mut touched: BTreeSet<ConnectionId> = BTreeSet::new();
        for &m in &moving {
            let Some(member) = self.members.get_mut(&m) else {
                continue;
            };
            member.group = id;
            member.flags.grouped = true;
            mass += member.mass;
            touched.extend(member.connections());
            let voxels: Vec<VoxelId> = member.live_voxels().collect();
            for v in voxels {
                if let Some(voxel) = self.voxels.get_mut(&v) {
                    voxel.center = add(voxel.center, offset);
                }
            }
        }
        if let Some(src) = self.groups.get_mut(&source) {
            for m in &moving {
                src.members.remove(m);
            }
        }
        if let Some(g) = self.groups.get_mut(&id) {
            g.members = moving.clone();
            g.strength_modifier = strength;
            g.min_propagation_ticks = min_ticks;
            g.max_propagation_ticks = max_ticks;
            g.is_detached = true;
            g.body.mass = mass;
            g.body.velocity = src_velocity;
            g.body.kinematic = false;
        }

        for c in touched {
            let Some(conn) = self.connections.get(&c) else {
                continue;
            };
            if conn.group != source {
                continue;
            }
            if conn.members().iter().all(|m| moving.contains(m)) {
                if let Some(conn) = self.connections.get_mut(&c) {
                    conn.group = id;
                    conn.position = add(conn.position, offset);
                }
                if let Some(src) = self.groups.get_mut(&source) {
                    src.connections.remove(&c);
                }
                if let Some(g) = self.groups.get_mut(&id) {
                    g.connections.insert(c);
                }
            } else {
                self.destroy_connection(c);
            }
        }

        let mut revalidate: Vec<WallId> = Vec::new();
        for (wall, edges) in wall_edges {
            let in_new = edges.iter().filter(|m| moving.contains(m)).count();
            let in_rest = edges.len() - in_new;
            if in_new > 0 && in_rest == 0 {
                if let Some(w) = self.walls.get_mut(&wall) {
                    w.group = Some(id);
                    w.origin = add(w.origin, offset);
                }
                if let Some(src) = self.groups.get_mut(&source) {
                    src.walls.remove(&wall);
                }
                if let Some(g) = self.groups.get_mut(&id) {
                    g.walls.insert(wall);
                }
            }
            revalidate.push(wall);
        }

        self.prune_group_topology(id);
        self.prune_group_topology(source);
        for wall in revalidate {
            self.request_wall_validation(wall);
        }

        let size = moving.len();
        let lifetime = Lifetime::for_component_size(size);
        log::info!("{id} split off {source} with {size} members ({lifetime:?} debris)");
        self.emit(SimEventKind::GroupExtracted {
            source,
            group: id,
            members: size,
            lifetime,
        });
        if lifetime == Lifetime::Large {
            self.emit(SimEventKind::LargeCollapse {
                group: id,
                position: center,
                intensity: mass,
            });
        }

        match self.register_fragment(FragmentKind::Group(id), center, mass, lifetime) {
            Some(fragment) => {
                if let Some(g) = self.groups.get_mut(&id) {
                    g.fragment = Some(fragment);
                }
                self.schedule_cleanup(id);
            }
            None => self.destroy_group_contents(id),
        }
        Some(id)
    }

    // -----------------------------------------------------------------------
    // Cleanup
    // -----------------------------------------------------------------------

    fn schedule_cleanup(&mut self, group: GroupId) {
        let at = self.tick + self.config.group.cleanup_interval_ticks;
        self.event_queue
            .schedule(at, ScheduledEventKind::GroupCleanup { group });
    }

    pub(crate) fn cleanup_group(&mut self, group: GroupId) {
        if !self.groups.contains_key(&group) {
            return;
        }
        self.prune_group_topology(group);
        self.split_detached(group);
        if self.destroy_group_if_empty(group) {
            return;
        }
        self.schedule_cleanup(group);
    }

    /// Destroy `group` if it owns nothing. Returns whether it is gone.
    pub(crate) fn destroy_group_if_empty(&mut self, group: GroupId) -> bool {
        match self.groups.get(&group) {
            None => true,
            Some(g) if g.is_empty() => {
                self.destroy_group_contents(group);
                true
            }
            Some(_) => false,
        }
    }

    /// Remove a group and everything it still owns without further
    /// structural bookkeeping. Used when its debris lifetime ends.
    pub(crate) fn destroy_group_contents(&mut self, group: GroupId) {
        let Some(g) = self.groups.remove(&group) else {
            return;
        };
        for m in &g.members {
            if let Some(member) = self.members.remove(m) {
                for v in member.voxels.iter().flatten() {
                    self.voxels.remove(v);
                }
                if let Some(shell) = member.shell {
                    self.chunks.remove(&shell);
                    self.geometry.release_combined(shell);
                }
            }
        }
        for c in &g.connections {
            self.connections.remove(c);
        }
        for w in &g.walls {
            self.remove_wall_nodes(*w);
        }
        if let Some(fragment) = g.fragment {
            self.debris.release(fragment);
        }
        log::debug!("{group} destroyed");
        self.emit(SimEventKind::GroupDestroyed { group });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::MemberSpec;
    use crate::command::{SimAction, SimCommand};
    use crate::member::MemberFlags;
    use smallvec::SmallVec;

    const G: GroupId = GroupId(1);

    fn node(id: u32, mass: f32, grounded: bool, adjacency: &[u32]) -> Member {
        Member {
            id: MemberId(id),
            group: G,
            mass,
            support_capacity: 100.0,
            accumulated_load: 0.0,
            ground_distance: UNREACHABLE,
            flags: MemberFlags {
                grounded,
                ..MemberFlags::default()
            },
            voxels: Vec::new(),
            adjacency: adjacency.iter().map(|&a| MemberId(a)).collect::<SmallVec<_>>(),
            start: None,
            end: None,
            shell: None,
        }
    }

    fn arena(nodes: Vec<Member>) -> (BTreeMap<MemberId, Member>, BTreeSet<MemberId>) {
        let ids = nodes.iter().map(|m| m.id).collect();
        let map = nodes.into_iter().map(|m| (m.id, m)).collect();
        (map, ids)
    }

    fn with_distances(members: &mut BTreeMap<MemberId, Member>, ids: &BTreeSet<MemberId>) {
        let dist = ground_distances(members, G, ids);
        for (id, d) in dist {
            members.get_mut(&id).unwrap().ground_distance = d;
        }
    }

    #[test]
    fn grounded_members_are_at_distance_zero() {
        // 1(g) - 2 - 3     4 (floating)
        let (members, ids) = arena(vec![
            node(1, 10.0, true, &[2]),
            node(2, 10.0, false, &[1, 3]),
            node(3, 10.0, false, &[2]),
            node(4, 10.0, false, &[]),
        ]);
        let dist = ground_distances(&members, G, &ids);
        assert_eq!(dist[&MemberId(1)], 0);
        assert_eq!(dist[&MemberId(2)], 1);
        assert_eq!(dist[&MemberId(3)], 2);
        assert_eq!(dist[&MemberId(4)], UNREACHABLE);
    }

    #[test]
    fn search_ignores_members_of_other_groups() {
        let (mut members, ids) = arena(vec![
            node(1, 10.0, true, &[2]),
            node(2, 10.0, false, &[1, 3]),
            node(3, 10.0, false, &[2]),
        ]);
        members.get_mut(&MemberId(2)).unwrap().group = GroupId(9);
        let dist = ground_distances(&members, G, &ids);
        assert_eq!(dist[&MemberId(3)], UNREACHABLE);
    }

    #[test]
    fn chain_load_reaches_the_ground_intact() {
        // 1(g) - 2 - 3 - 4, no branching.
        let (mut members, ids) = arena(vec![
            node(1, 5.0, true, &[2]),
            node(2, 7.0, false, &[1, 3]),
            node(3, 11.0, false, &[2, 4]),
            node(4, 13.0, false, &[3]),
        ]);
        with_distances(&mut members, &ids);
        let loads = propagate_loads(&members, &ids, PassKind::Propagation);
        assert_eq!(loads[&MemberId(4)], 13.0);
        assert_eq!(loads[&MemberId(3)], 24.0);
        assert_eq!(loads[&MemberId(2)], 31.0);
        assert_eq!(loads[&MemberId(1)], 36.0);
    }

    #[test]
    fn load_splits_evenly_over_lower_supports() {
        // Lintel 3 rests on two grounded posts.
        let (mut members, ids) = arena(vec![
            node(1, 10.0, true, &[3]),
            node(2, 10.0, true, &[3]),
            node(3, 30.0, false, &[1, 2]),
        ]);
        with_distances(&mut members, &ids);
        let loads = propagate_loads(&members, &ids, PassKind::Propagation);
        assert_eq!(loads[&MemberId(1)], 25.0);
        assert_eq!(loads[&MemberId(2)], 25.0);
    }

    #[test]
    fn initial_pass_turns_shares_into_reserve() {
        let (mut members, ids) = arena(vec![
            node(1, 10.0, true, &[2]),
            node(2, 10.0, false, &[1, 3]),
            node(3, 10.0, false, &[2]),
        ]);
        with_distances(&mut members, &ids);
        let reserve = propagate_loads(&members, &ids, PassKind::Initial);
        // Each member passes on only its own mass during the initial pass.
        assert_eq!(reserve[&MemberId(1)], 10.0);
        assert_eq!(reserve[&MemberId(2)], 10.0);
        assert_eq!(reserve[&MemberId(3)], 0.0);
    }

    #[test]
    fn unsupported_member_keeps_its_own_weight() {
        let (mut members, ids) = arena(vec![node(1, 10.0, true, &[]), node(2, 4.0, false, &[])]);
        with_distances(&mut members, &ids);
        let loads = propagate_loads(&members, &ids, PassKind::Propagation);
        assert_eq!(loads[&MemberId(2)], 4.0);
        assert_eq!(loads[&MemberId(1)], 10.0);
    }

    #[test]
    fn single_component_is_not_split() {
        let (members, ids) = arena(vec![
            node(1, 1.0, false, &[2]),
            node(2, 1.0, false, &[1, 3]),
            node(3, 1.0, false, &[2]),
        ]);
        let components = connected_components(&members, &ids);
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].len(), 3);
    }

    #[test]
    fn components_partition_the_member_set() {
        let (members, ids) = arena(vec![
            node(1, 1.0, false, &[2]),
            node(2, 1.0, false, &[1]),
            node(3, 1.0, false, &[]),
            node(4, 1.0, false, &[5]),
            node(5, 1.0, false, &[4, 6]),
            node(6, 1.0, false, &[5]),
        ]);
        let components = connected_components(&members, &ids);
        assert_eq!(components.len(), 3);
        let union: BTreeSet<MemberId> = components.iter().flatten().copied().collect();
        assert_eq!(union, ids);
        assert_eq!(largest_component(&components), Some(2));
    }

    // -----------------------------------------------------------------------
    // Validation state machine
    // -----------------------------------------------------------------------

    /// A single grounded post. Validating it schedules nothing but the
    /// passes themselves.
    fn post() -> (Structure, GroupId, VoxelId) {
        let mut s = Structure::new(17);
        let g = s.add_group([0.0; 3]);
        let j0 = s.add_connection(g, [0.0; 3]).unwrap();
        let j1 = s.add_connection(g, [0.0, 4.0, 0.0]).unwrap();
        let post = s
            .add_member(g, MemberSpec::new(j0, Slot::Top, j1, 4).grounded())
            .unwrap();
        s.initialize_group(g).unwrap();
        let voxel = s.members[&post].live_voxels().next().unwrap();
        (s, g, voxel)
    }

    #[test]
    fn requests_while_pending_are_absorbed() {
        let (mut s, g, _) = post();
        assert!(s.event_queue.is_empty());
        for _ in 0..3 {
            s.request_group_validation(g);
        }
        assert_eq!(s.groups[&g].validation.phase, ValidationPhase::Pending);
        assert_eq!(s.event_queue.len(), 1);

        s.step(&[], 0);
        assert_eq!(s.groups[&g].validation.phase, ValidationPhase::Idle);
        assert!(s.event_queue.is_empty());
    }

    #[test]
    fn request_during_a_pass_runs_exactly_one_more() {
        let (mut s, g, _) = post();
        s.groups.get_mut(&g).unwrap().validation.phase = ValidationPhase::Validating;
        s.request_group_validation(g);
        s.request_group_validation(g);
        assert!(s.groups[&g].validation.validate_again);
        assert!(s.event_queue.is_empty());

        s.run_group_validation(g);
        let interval = s.config.group.validation_interval_ticks;
        assert!(!s.groups[&g].validation.validate_again);
        assert_eq!(s.groups[&g].validation.phase, ValidationPhase::Pending);
        assert_eq!(s.event_queue.len(), 1);
        assert_eq!(s.event_queue.peek_tick(), Some(interval));

        s.step(&[], interval);
        assert_eq!(s.groups[&g].validation.phase, ValidationPhase::Idle);
        assert!(s.event_queue.is_empty());
    }

    #[test]
    fn damage_window_keeps_passes_running_until_it_closes() {
        let (mut s, g, voxel) = post();
        let interval = s.config.group.validation_interval_ticks;
        let window = s.config.group.validation_window_ticks;
        assert_eq!((interval, window), (5, 5));
        let hit = |tick| SimCommand {
            tick,
            action: SimAction::DamageVoxel { voxel, amount: 1.0 },
        };

        // Hits at 11..=13 push the window out to 18. Passes run at 11
        // (requested), 16 (periodic) and 21 (periodic, window closed).
        s.step(&[hit(11), hit(12), hit(13)], 13);
        assert_eq!(s.groups[&g].validation.window_ends_at, 18);
        assert_eq!(s.groups[&g].validation.phase, ValidationPhase::Pending);
        assert_eq!(s.event_queue.len(), 1);
        assert_eq!(s.event_queue.peek_tick(), Some(16));

        s.step(&[], 16);
        assert_eq!(s.event_queue.len(), 1);
        assert_eq!(s.event_queue.peek_tick(), Some(21));

        s.step(&[], 21);
        assert_eq!(s.groups[&g].validation.phase, ValidationPhase::Idle);
        assert!(s.event_queue.is_empty());

        s.step(&[], 100);
        assert!(s.event_queue.is_empty());
        assert_eq!(s.voxels[&voxel].damage, 3.0);
    }
}
