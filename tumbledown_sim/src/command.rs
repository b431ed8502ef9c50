// Commands that mutate a structure.
//
// Everything outside the core (weapons, explosions, scripted events, a
// network peer replaying a match) changes a structure by handing
// `SimCommand`s to `Structure::step()`. Commands carry the tick they apply at,
// so a recorded command log plus the seed reproduces a whole collapse.
//
// Commands that name a node that no longer exists are dropped with a warning.
// Destruction is racy by nature: a shot fired at a voxel may land after the
// member it belonged to fell off the building.
//
// See also: `structure.rs` (`apply_command`) for the dispatch.

use crate::types::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimCommand {
    pub tick: u64,
    pub action: SimAction,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SimAction {
    /// Damage one voxel. A member still behind its combined shell has the
    /// shell broken open first.
    DamageVoxel { voxel: VoxelId, amount: f32 },
    /// Damage one wall cell. Cells inside an intact chunk pass the damage to
    /// the chunk.
    DamageCell { cell: CellId, amount: f32 },
    /// Damage a combined chunk directly.
    DamageChunk { chunk: ChunkId, amount: f32 },
    DamageConnection { connection: ConnectionId, amount: f32 },
    /// Remove a member outright, as if every voxel broke at once.
    DestroyMember { member: MemberId },
    ValidateGroup { group: GroupId },
    ValidateWall { wall: WallId },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_log_roundtrips() {
        let log = vec![
            SimCommand {
                tick: 3,
                action: SimAction::DamageVoxel {
                    voxel: VoxelId(17),
                    amount: 30.0,
                },
            },
            SimCommand {
                tick: 9,
                action: SimAction::DestroyMember {
                    member: MemberId(4),
                },
            },
        ];
        let json = serde_json::to_string(&log).unwrap();
        let restored: Vec<SimCommand> = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[1].tick, 9);
        // SimAction carries no PartialEq; compare through re-serialization.
        assert_eq!(json, serde_json::to_string(&restored).unwrap());
    }
}
