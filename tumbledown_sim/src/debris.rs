// Debris pool: timed fragments and reusable shells.
//
// Everything that leaves the structural graph ends up here: loose voxel runs,
// detached wall chunks, ejected cells, crumble gibs, and whole extracted groups
// and split-off walls. A fragment occupies a "shell" (the render/physics
// object a host engine would spawn) and lives for one of three lifetime
// classes. When it expires the shell returns to a bounded free list and is
// handed to the next fragment instead of building a new one.
//
// Exhaustion is a degradation path, not an error:
// - With `max_active` fragments alive, a new fragment is discarded on the
//   spot (its shell is returned unused) and the caller is told so.
// - With `max_pooled` shells already free, a released shell is dropped.
// - Crumble gibs are rolled against `spawn_chance()`, which falls linearly
//   from 1 to 0 as the pool fills, so heavy destruction thins its own gibs.
//
// Expiry is driven by `FragmentExpired` events scheduled by `structure.rs`;
// the pool itself never looks at the clock.

use crate::config::DebrisConfig;
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How long a fragment stays alive before it is reclaimed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifetime {
    Small,
    Medium,
    Large,
}

impl Lifetime {
    /// Lifetime class for a group split off with `members` members:
    /// more than four is large, two to four medium, one small.
    pub fn for_component_size(members: usize) -> Self {
        if members > 4 {
            Lifetime::Large
        } else if members > 1 {
            Lifetime::Medium
        } else {
            Lifetime::Small
        }
    }

    pub fn ticks(self, config: &DebrisConfig) -> u64 {
        match self {
            Lifetime::Small => config.small_lifetime_ticks,
            Lifetime::Medium => config.medium_lifetime_ticks,
            Lifetime::Large => config.large_lifetime_ticks,
        }
    }
}

/// What a fragment stands for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FragmentKind {
    Crumble,
    /// Voxels cut off a member by a repeated split. They stay in the voxel
    /// arena, ownerless, until the fragment expires.
    MemberRun { voxels: Vec<VoxelId> },
    /// A whole chunk of cells that broke off without being uncombined.
    WallChunk { cells: usize },
    /// The last cell of a wall that self-destructed.
    WallCell,
    /// An extracted group. Expiry destroys the group and everything in it.
    Group(GroupId),
    /// A free-standing wall split off its parent. Expiry destroys the wall.
    Wall(WallId),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Fragment {
    pub id: FragmentId,
    pub shell: ShellId,
    pub kind: FragmentKind,
    pub position: Vec3,
    pub mass: f32,
    pub lifetime: Lifetime,
    pub expires_at: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DebrisPool {
    config: DebrisConfig,
    active: BTreeMap<FragmentId, Fragment>,
    free_shells: Vec<ShellId>,
    next_shell: u32,
    /// Fragments dropped because the pool was full.
    pub discarded: u64,
}

impl DebrisPool {
    pub fn new(config: &DebrisConfig) -> Self {
        Self {
            config: config.clone(),
            active: BTreeMap::new(),
            free_shells: Vec::new(),
            next_shell: 0,
            discarded: 0,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn pooled_count(&self) -> usize {
        self.free_shells.len()
    }

    pub fn get(&self, id: FragmentId) -> Option<&Fragment> {
        self.active.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fragment> {
        self.active.values()
    }

    /// Probability that an optional gib is worth spawning right now.
    pub fn spawn_chance(&self) -> f64 {
        if self.config.max_active == 0 {
            return 0.0;
        }
        let fill = self.active.len() as f64 / self.config.max_active as f64;
        (1.0 - fill).clamp(0.0, 1.0)
    }

    fn acquire_shell(&mut self) -> ShellId {
        if let Some(shell) = self.free_shells.pop() {
            return shell;
        }
        let shell = ShellId(self.next_shell);
        self.next_shell += 1;
        shell
    }

    fn return_shell(&mut self, shell: ShellId) {
        if self.free_shells.len() < self.config.max_pooled as usize {
            self.free_shells.push(shell);
        }
    }

    /// Put a fragment into a shell and start its lifetime. Returns the tick
    /// at which it expires, or `None` if the pool was full and the fragment
    /// was discarded.
    pub fn register(
        &mut self,
        id: FragmentId,
        kind: FragmentKind,
        position: Vec3,
        mass: f32,
        lifetime: Lifetime,
        now: u64,
    ) -> Option<u64> {
        if self.active.len() >= self.config.max_active as usize {
            self.discarded += 1;
            log::debug!("debris pool full, discarding {id} ({kind:?})");
            return None;
        }
        let shell = self.acquire_shell();
        let expires_at = now + lifetime.ticks(&self.config);
        self.active.insert(
            id,
            Fragment {
                id,
                shell,
                kind,
                position,
                mass,
                lifetime,
                expires_at,
            },
        );
        Some(expires_at)
    }

    /// Remove an expired fragment and recycle its shell.
    pub fn release(&mut self, id: FragmentId) -> Option<Fragment> {
        let fragment = self.active.remove(&id)?;
        self.return_shell(fragment.shell);
        Some(fragment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(max_active: u32, max_pooled: u32) -> DebrisPool {
        DebrisPool::new(&DebrisConfig {
            max_active,
            max_pooled,
            ..DebrisConfig::default()
        })
    }

    /// Register a small fragment of `kind` at `now`.
    fn spawn(pool: &mut DebrisPool, id: u32, kind: FragmentKind, now: u64) -> Option<u64> {
        pool.register(FragmentId(id), kind, [0.0; 3], 1.0, Lifetime::Small, now)
    }

    #[test]
    fn lifetime_classes_follow_component_size() {
        assert_eq!(Lifetime::for_component_size(1), Lifetime::Small);
        assert_eq!(Lifetime::for_component_size(2), Lifetime::Medium);
        assert_eq!(Lifetime::for_component_size(4), Lifetime::Medium);
        assert_eq!(Lifetime::for_component_size(5), Lifetime::Large);
    }

    #[test]
    fn full_pool_discards_new_fragments() {
        let mut pool = small_pool(2, 10);
        assert!(spawn(&mut pool, 1, FragmentKind::Crumble, 0).is_some());
        assert!(spawn(&mut pool, 2, FragmentKind::Crumble, 0).is_some());
        assert!(spawn(&mut pool, 3, FragmentKind::Crumble, 0).is_none());
        assert_eq!(pool.discarded, 1);
        assert_eq!(pool.active_count(), 2);
        assert_eq!(pool.spawn_chance(), 0.0);
    }

    #[test]
    fn released_shells_are_reused() {
        let mut pool = small_pool(10, 10);
        spawn(&mut pool, 1, FragmentKind::WallCell, 0);
        let first_shell = pool.get(FragmentId(1)).unwrap().shell;
        pool.release(FragmentId(1)).unwrap();
        assert_eq!(pool.pooled_count(), 1);

        spawn(&mut pool, 2, FragmentKind::WallCell, 5);
        assert_eq!(pool.get(FragmentId(2)).unwrap().shell, first_shell);
        assert_eq!(pool.pooled_count(), 0);
    }

    #[test]
    fn free_list_is_bounded() {
        let mut pool = small_pool(10, 1);
        for i in 0..3 {
            spawn(&mut pool, i, FragmentKind::Crumble, 0);
        }
        for i in 0..3 {
            pool.release(FragmentId(i));
        }
        assert_eq!(pool.pooled_count(), 1);
    }

    #[test]
    fn expiry_tick_uses_lifetime_class() {
        let mut pool = small_pool(10, 10);
        let config = DebrisConfig::default();
        let kind = FragmentKind::Group(GroupId(2));
        let at = pool
            .register(FragmentId(7), kind, [0.0; 3], 40.0, Lifetime::Large, 100)
            .unwrap();
        assert_eq!(at, 100 + config.large_lifetime_ticks);
    }

    #[test]
    fn spawn_chance_falls_as_pool_fills() {
        let mut pool = small_pool(4, 4);
        assert_eq!(pool.spawn_chance(), 1.0);
        spawn(&mut pool, 1, FragmentKind::Crumble, 0);
        assert!((pool.spawn_chance() - 0.75).abs() < 1e-9);
    }
}
