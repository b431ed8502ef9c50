// Joints between members.
//
// A `Connection` is a node with 18 directional slots (`Slot`), each holding
// at most one member. A member wired between joints A and B sits in slot `s`
// at A and in `s.opposite()` at B. The same member may appear in two slots of
// one joint only when both of its ends land there.
//
// Degree rules, applied by `connection_check()` after anything drops a member
// reference:
// - 0 members: the joint is destroyed.
// - 1 member:  the joint demotes to `Terminal` (a dead end that only carries
//              its one member) and the group is asked to revalidate.
// - 2 or more: `Active`.
//
// Two members that meet at a joint are adjacent. Destroying a joint unlinks
// its members pairwise unless they still meet at another live joint.

use crate::event::SimEventKind;
use crate::structure::Structure;
use crate::types::*;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Active,
    /// Exactly one member left.
    Terminal,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub group: GroupId,
    /// Position in the owning group's local space.
    pub position: Vec3,
    pub slots: [Option<MemberId>; Slot::COUNT],
    pub health: f32,
    pub damage: f32,
    pub state: ConnectionState,
}

impl Connection {
    /// Distinct members held in any slot, in slot order.
    pub fn members(&self) -> SmallVec<[MemberId; 8]> {
        let mut out: SmallVec<[MemberId; 8]> = SmallVec::new();
        for m in self.slots.iter().flatten() {
            if !out.contains(m) {
                out.push(*m);
            }
        }
        out
    }

    pub fn member_count(&self) -> usize {
        self.members().len()
    }

    pub fn contains(&self, member: MemberId) -> bool {
        self.slots.contains(&Some(member))
    }

    pub fn slot_of(&self, member: MemberId) -> Option<Slot> {
        Slot::ALL
            .into_iter()
            .find(|s| self.slots[s.index()] == Some(member))
    }

    /// Put `member` into `slot`. Returns false if the slot is taken by a
    /// different member.
    pub fn assign(&mut self, slot: Slot, member: MemberId) -> bool {
        match self.slots[slot.index()] {
            Some(existing) if existing != member => false,
            _ => {
                self.slots[slot.index()] = Some(member);
                true
            }
        }
    }

    pub fn clear_member(&mut self, member: MemberId) {
        for s in self.slots.iter_mut() {
            if *s == Some(member) {
                *s = None;
            }
        }
    }

    pub fn replace_member(&mut self, old: MemberId, new: MemberId) {
        for s in self.slots.iter_mut() {
            if *s == Some(old) {
                *s = Some(new);
            }
        }
    }
}

impl Structure {
    /// Re-evaluate a joint's degree after it lost a member.
    pub(crate) fn connection_check(&mut self, connection: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&connection) else {
            return;
        };
        let group = conn.group;
        match conn.member_count() {
            0 => {
                self.connections.remove(&connection);
                if let Some(g) = self.groups.get_mut(&group) {
                    g.connections.remove(&connection);
                }
                log::debug!("{connection} has no members left");
                self.emit(SimEventKind::ConnectionDestroyed { connection });
            }
            1 => {
                if conn.state != ConnectionState::Terminal {
                    conn.state = ConnectionState::Terminal;
                    self.emit(SimEventKind::ConnectionDemoted { connection });
                    self.request_group_validation(group);
                }
            }
            _ => conn.state = ConnectionState::Active,
        }
    }

    /// Let go of `connection` at whichever end of `member` holds it.
    pub(crate) fn detach_member_from_connection(
        &mut self,
        member: MemberId,
        connection: ConnectionId,
    ) {
        if let Some(m) = self.members.get_mut(&member) {
            if m.start == Some(connection) {
                m.start = None;
            }
            if m.end == Some(connection) {
                m.end = None;
            }
        }
        let others: SmallVec<[MemberId; 8]> = match self.connections.get_mut(&connection) {
            Some(conn) => {
                conn.clear_member(member);
                conn.members()
            }
            None => SmallVec::new(),
        };
        for other in others {
            if !self.share_live_connection(member, other) {
                self.unlink(member, other);
            }
        }
        self.connection_check(connection);
    }

    pub fn damage_connection(&mut self, connection: ConnectionId, amount: f32) {
        let Some(conn) = self.connections.get_mut(&connection) else {
            log::warn!("damage for missing {connection}");
            return;
        };
        conn.damage = (conn.damage + amount).min(f32::MAX);
        let lethal = conn.damage >= conn.health;
        let group = conn.group;
        let local = conn.position;
        let position = add(self.group_origin(Some(group)), local);
        if lethal {
            self.destroy_connection(connection);
            self.crumble(position, 1.0);
        }
        self.note_group_damage(group);
    }

    /// Remove a joint and unwire its members.
    pub(crate) fn destroy_connection(&mut self, connection: ConnectionId) {
        let Some(conn) = self.connections.remove(&connection) else {
            return;
        };
        if let Some(g) = self.groups.get_mut(&conn.group) {
            g.connections.remove(&connection);
        }
        let members = conn.members();
        for m in &members {
            if let Some(member) = self.members.get_mut(m) {
                if member.start == Some(connection) {
                    member.start = None;
                }
                if member.end == Some(connection) {
                    member.end = None;
                }
            }
        }
        for (i, &a) in members.iter().enumerate() {
            for &b in &members[i + 1..] {
                if !self.share_live_connection(a, b) {
                    self.unlink(a, b);
                }
            }
        }
        log::debug!("{connection} destroyed with {} members", members.len());
        self.emit(SimEventKind::ConnectionDestroyed { connection });
        self.request_group_validation(conn.group);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::MemberSpec;

    fn empty() -> Connection {
        Connection {
            id: ConnectionId(1),
            group: GroupId(1),
            position: [0.0; 3],
            slots: [None; Slot::COUNT],
            health: 100.0,
            damage: 0.0,
            state: ConnectionState::Active,
        }
    }

    #[test]
    fn occupied_slot_rejects_another_member() {
        let mut c = empty();
        assert!(c.assign(Slot::Top, MemberId(3)));
        assert!(c.assign(Slot::Top, MemberId(3)));
        assert!(!c.assign(Slot::Top, MemberId(4)));
        assert_eq!(c.slot_of(MemberId(3)), Some(Slot::Top));
    }

    #[test]
    fn members_are_deduplicated() {
        let mut c = empty();
        c.assign(Slot::Top, MemberId(3));
        c.assign(Slot::Bottom, MemberId(3));
        c.assign(Slot::Left, MemberId(7));
        assert_eq!(c.members().as_slice(), &[MemberId(3), MemberId(7)]);
        c.replace_member(MemberId(3), MemberId(9));
        assert!(!c.contains(MemberId(3)));
        assert_eq!(c.member_count(), 2);
        c.clear_member(MemberId(9));
        assert_eq!(c.members().as_slice(), &[MemberId(7)]);
    }

    /// Three beams meeting at one hub joint.
    fn hub() -> (Structure, ConnectionId, Vec<MemberId>) {
        let mut s = Structure::new(11);
        let g = s.add_group([0.0; 3]);
        let hub = s.add_connection(g, [0.0, 4.0, 0.0]).unwrap();
        let feet = [
            s.add_connection(g, [0.0, 0.0, 0.0]).unwrap(),
            s.add_connection(g, [-4.0, 4.0, 0.0]).unwrap(),
            s.add_connection(g, [4.0, 4.0, 0.0]).unwrap(),
        ];
        let slots = [Slot::Bottom, Slot::Left, Slot::Right];
        let mut members = Vec::new();
        for (i, (foot, slot)) in feet.into_iter().zip(slots).enumerate() {
            let mut spec = MemberSpec::new(hub, slot, foot, 3);
            if i == 0 {
                spec = spec.grounded();
            }
            members.push(s.add_member(g, spec).unwrap());
        }
        s.initialize_group(g).unwrap();
        (s, hub, members)
    }

    #[test]
    fn destroying_a_joint_unlinks_its_members() {
        let (mut s, hub, members) = hub();
        assert_eq!(s.members[&members[0]].adjacency.len(), 2);
        s.damage_connection(hub, 1_000.0);
        assert!(!s.connections.contains_key(&hub));
        for m in &members {
            assert!(s.members[m].adjacency.is_empty());
            assert!(s.members[m].start.is_none());
        }
        assert!(s.connections_consistent());
    }

    #[test]
    fn weak_damage_leaves_the_joint() {
        let (mut s, hub, _) = hub();
        s.damage_connection(hub, 40.0);
        assert_eq!(s.connections[&hub].damage, 40.0);
        assert_eq!(s.connections[&hub].state, ConnectionState::Active);
    }

    #[test]
    fn joint_with_one_member_demotes() {
        let (mut s, hub, members) = hub();
        s.destroy_member(members[1]);
        assert_eq!(s.connections[&hub].state, ConnectionState::Active);
        s.destroy_member(members[2]);
        assert_eq!(s.connections[&hub].state, ConnectionState::Terminal);
        assert!(
            s.take_events()
                .iter()
                .any(|e| e.kind == SimEventKind::ConnectionDemoted { connection: hub })
        );
        s.destroy_member(members[0]);
        assert!(!s.connections.contains_key(&hub));
    }
}
