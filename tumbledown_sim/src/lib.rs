// tumbledown_sim: structural destruction core.
//
// This crate simulates the structural integrity of building-like assemblies
// made of beams ("members"), joints ("connections") and wall grids, and
// their progressive collapse as damage removes material. It decides which
// parts still stand, which break away as falling debris, and how load
// redistributes over what is left. It has no engine dependencies: geometry
// and physics are reached through the `GeometryBackend` trait, and effects
// are reported as `SimEvent`s.
//
// Module overview:
// - `structure.rs`:  `Structure`: arena owner, tick loop, command/event dispatch, save/load.
// - `group.rs`:      Groups, validation state machine, ground distance, load propagation, splitting.
// - `member.rs`:     Members and voxels; voxel damage, member split, run detach.
// - `connection.rs`: Joints with 18 directional slots; degree checks and joint damage.
// - `wall.rs`:       Wall grids, support flood-fill, wall splitting and self-destruct.
// - `chunk.rs`:      Combined chunks and their damage routing; staged uncombine.
// - `throttle.rs`:   Global sliding-window uncombine budget.
// - `debris.rs`:     Debris pool: timed fragments, pooled shells, lifetime classes.
// - `geometry.rs`:   `GeometryBackend` seam and the headless default.
// - `builder.rs`:    Programmatic authoring (`MemberSpec`, `WallSpec`, `BuildError`).
// - `command.rs`:    SimCommand / SimAction: all external mutations.
// - `event.rs`:      EventQueue (cooperative task scheduler) + output SimEvents.
// - `config.rs`:     SimConfig: every tunable number, loaded from JSON.
// - `prng`:          Re-exported from `tumbledown_prng`: xoshiro256++ PRNG with SplitMix64 seeding.
// - `types.rs`:      Node IDs, joint slots, cell kinds, vector helpers.
//
// **Critical constraint: determinism.** The simulation is a pure function:
// `(state, commands) -> (new_state, events)`. All randomness comes from a
// seeded xoshiro256++ PRNG. No `HashMap` iteration, no system time, no OS
// entropy. Use `BTreeMap` for ordered collections.

pub mod builder;
pub mod chunk;
pub mod command;
pub mod config;
pub mod connection;
pub mod debris;
pub mod event;
pub mod geometry;
pub mod group;
pub mod member;
pub use tumbledown_prng as prng;
pub mod structure;
pub mod throttle;
pub mod types;
pub mod wall;
