// Scheduled tasks and output events.
//
// The destruction core is a discrete-event simulation driven by a fixed tick.
// Anything that must happen later, or must be spread over several ticks, is
// scheduled into a priority queue ordered by `(tick, sequence)`:
//
// - `ScheduledEvent`: internal cooperative tasks. Each variant carries its
//   own resume point (`next` index, remaining cell list) so a long operation
//   is a chain of small steps rather than a suspended call stack. Every step
//   re-checks that the group/wall/chunk it targets still exists before doing
//   anything; a destroyed target silently drops the chain.
// - `SimEvent`: fire-and-forget output. Effects notifications (crumble,
//   member stress, large collapse, window shatter) carry a position and an
//   intensity for whatever plays sounds and particles. Narrative variants
//   describe topology changes for logs, tests and replays.
//
// See also: `structure.rs` for the loop that pops and dispatches these.
//
// **Critical constraint: determinism.** Two events at the same tick fire in
// the order they were scheduled; `sequence` is a monotonic counter.

use crate::debris::Lifetime;
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

// ---------------------------------------------------------------------------
// Internal scheduled events (priority queue)
// ---------------------------------------------------------------------------

/// A task step scheduled for a future tick.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub tick: u64,
    /// Tiebreaker within a tick. Lower fires first.
    pub sequence: u64,
    pub kind: ScheduledEventKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ScheduledEventKind {
    /// Run a coalesced validation pass for a group.
    GroupValidation { group: GroupId },
    /// Periodic sweep of a detached group: re-split, reap when empty.
    GroupCleanup { group: GroupId },
    /// One step of damage-over-time on overloaded members. `next` indexes
    /// into `members`, which is ordered farthest-from-ground first.
    OverloadDamage {
        group: GroupId,
        members: Vec<MemberId>,
        next: usize,
    },
    /// End of a wall's validation cooldown; reruns if a request arrived.
    WallValidationResume { wall: WallId },
    /// Restore the next batch of cells from a breaking chunk.
    UncombineStep {
        wall: WallId,
        chunk: ChunkId,
        remaining: Vec<CellId>,
        damage_per_cell: f32,
    },
    /// A timed fragment's lifetime ran out.
    FragmentExpired { fragment: FragmentId },
}

// Min-heap on (tick, sequence) over Rust's max-heap.
impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.tick == other.tick && self.sequence == other.sequence
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .tick
            .cmp(&self.tick)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Priority queue of pending task steps, earliest first.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EventQueue {
    heap: BinaryHeap<ScheduledEvent>,
    next_sequence: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, tick: u64, kind: ScheduledEventKind) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(ScheduledEvent {
            tick,
            sequence,
            kind,
        });
    }

    pub fn peek_tick(&self) -> Option<u64> {
        self.heap.peek().map(|e| e.tick)
    }

    /// Pop the next event if it is due at or before `up_to_tick`.
    pub fn pop_if_ready(&mut self, up_to_tick: u64) -> Option<ScheduledEvent> {
        if self.heap.peek().is_some_and(|e| e.tick <= up_to_tick) {
            self.heap.pop()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Output events
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimEvent {
    pub tick: u64,
    pub kind: SimEventKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SimEventKind {
    // Effects. Positions are in world space.
    Crumble {
        position: Vec3,
        intensity: f32,
    },
    MemberStress {
        member: MemberId,
        position: Vec3,
        intensity: f32,
    },
    LargeCollapse {
        group: GroupId,
        position: Vec3,
        intensity: f32,
    },
    WindowShatter {
        position: Vec3,
        intensity: f32,
    },

    // Topology.
    VoxelDestroyed {
        member: MemberId,
        voxel: VoxelId,
    },
    MemberSplit {
        member: MemberId,
        sibling: MemberId,
    },
    /// A run of voxels left a repeatedly-split member as loose debris.
    RunDetached {
        member: MemberId,
        voxels: usize,
        fragment: Option<FragmentId>,
    },
    MemberExposed {
        member: MemberId,
    },
    MemberDestroyed {
        member: MemberId,
    },
    ConnectionDemoted {
        connection: ConnectionId,
    },
    ConnectionDestroyed {
        connection: ConnectionId,
    },
    GroupExtracted {
        source: GroupId,
        group: GroupId,
        members: usize,
        lifetime: Lifetime,
    },
    GroupDestroyed {
        group: GroupId,
    },
    CellDestroyed {
        wall: WallId,
        cell: CellId,
    },
    WallSplit {
        wall: WallId,
        new_wall: WallId,
        cells: usize,
    },
    WallDestroyed {
        wall: WallId,
    },
    ChunkUncombined {
        chunk: ChunkId,
        cells: usize,
    },
    ChunkDetached {
        chunk: ChunkId,
        fragment: Option<FragmentId>,
    },
    FragmentExpired {
        fragment: FragmentId,
    },
    /// The debris pool was full and the fragment was dropped on the floor.
    FragmentDiscarded,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_pops_by_tick_then_sequence() {
        let mut queue = EventQueue::new();
        queue.schedule(30, ScheduledEventKind::GroupValidation { group: GroupId(1) });
        queue.schedule(10, ScheduledEventKind::WallValidationResume { wall: WallId(2) });
        queue.schedule(10, ScheduledEventKind::GroupCleanup { group: GroupId(3) });

        let first = queue.pop_if_ready(100).unwrap();
        assert_eq!((first.tick, first.sequence), (10, 1));
        let second = queue.pop_if_ready(100).unwrap();
        assert_eq!((second.tick, second.sequence), (10, 2));
        let third = queue.pop_if_ready(100).unwrap();
        assert_eq!(third.tick, 30);
        assert!(queue.is_empty());
    }

    #[test]
    fn future_events_stay_queued() {
        let mut queue = EventQueue::new();
        queue.schedule(8, ScheduledEventKind::FragmentExpired { fragment: FragmentId(4) });
        assert!(queue.pop_if_ready(7).is_none());
        assert_eq!(queue.peek_tick(), Some(8));
        assert!(queue.pop_if_ready(8).is_some());
    }

    #[test]
    fn pending_task_state_survives_serialization() {
        let mut queue = EventQueue::new();
        queue.schedule(
            12,
            ScheduledEventKind::UncombineStep {
                wall: WallId(1),
                chunk: ChunkId(9),
                remaining: vec![CellId(3), CellId(4)],
                damage_per_cell: 12.5,
            },
        );
        let json = serde_json::to_string(&queue).unwrap();
        let mut restored: EventQueue = serde_json::from_str(&json).unwrap();
        let event = restored.pop_if_ready(12).unwrap();
        match event.kind {
            ScheduledEventKind::UncombineStep {
                remaining,
                damage_per_cell,
                ..
            } => {
                assert_eq!(remaining, vec![CellId(3), CellId(4)]);
                assert_eq!(damage_per_cell, 12.5);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
