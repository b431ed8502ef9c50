// Data-driven simulation configuration.
//
// Every tunable number the destruction core reads lives in `SimConfig`,
// loaded from JSON. Time is expressed in simulation ticks; `tick_duration_ms`
// only documents how long a tick is for whoever drives `Structure::step()`.
// Defaults reproduce the tuning the collapse thresholds were balanced against
// (component-size debris lifetimes, the `columns + rows` wall cutoff).
//
// Parameters are grouped by the subsystem that reads them:
// - `MemberConfig`:   voxel health and default beam mass/capacity.
// - `WallConfig`:     cell health, window health, per-cell mass.
// - `GroupConfig`:    capacity bonus, overload delays, validation cadence.
// - `ThrottleConfig`: the global uncombine budget and staged-uncombine pace.
// - `DebrisConfig`:   pool sizes and lifetime classes.
//
// See also: `structure.rs`, which owns the `SimConfig`, and `throttle.rs` /
// `debris.rs` which take their sub-structs by value.
//
// **Critical constraint: determinism.** Config values feed straight into the
// simulation. Two runs only replay identically with identical configs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure to load a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Voxel and beam parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemberConfig {
    /// Damage a single voxel absorbs before it is destroyed. Also the
    /// threshold above which a hit on a combined member shell destroys a
    /// random voxel instead of just exposing the voxels.
    pub piece_health: f32,
    /// Mass given to members authored without an explicit mass.
    pub default_mass: f32,
    /// Support capacity given to members authored without an explicit one.
    pub default_support_capacity: f32,
    /// Damage a joint absorbs before it breaks.
    pub connection_health: f32,
}

impl Default for MemberConfig {
    fn default() -> Self {
        Self {
            piece_health: 100.0,
            default_mass: 10.0,
            default_support_capacity: 100.0,
            connection_health: 100.0,
        }
    }
}

/// Wall grid parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WallConfig {
    pub piece_health: f32,
    pub window_health: f32,
    /// Mass of one cell. A detached chunk weighs `piece_mass * cells`.
    pub piece_mass: f32,
    /// Max world distance between a cell centre and a voxel centre for
    /// `auto_attach_edges` to treat them as touching.
    pub edge_attach_distance: f32,
}

impl Default for WallConfig {
    fn default() -> Self {
        Self {
            piece_health: 100.0,
            window_health: 1.0,
            piece_mass: 50.0,
            edge_attach_distance: 1.0,
        }
    }
}

/// Structural group parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Flat capacity bonus every member receives on the initial pass.
    pub strength_modifier: f32,
    /// Lower bound of the random delay between overload damage steps.
    pub min_propagation_ticks: u64,
    /// Upper bound (inclusive) of the random delay between overload steps.
    pub max_propagation_ticks: u64,
    /// Delay before a coalesced re-validation or a periodic pass.
    pub validation_interval_ticks: u64,
    /// How long after the last damage event periodic validation keeps running.
    pub validation_window_ticks: u64,
    /// Interval of the sweep that splits and reaps detached groups.
    pub cleanup_interval_ticks: u64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            strength_modifier: 100.0,
            min_propagation_ticks: 50,
            max_propagation_ticks: 250,
            validation_interval_ticks: 5,
            validation_window_ticks: 5,
            cleanup_interval_ticks: 250,
        }
    }
}

/// The global uncombine rate limit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Uncombines allowed inside one sliding window. Zero disables the
    /// expensive path entirely.
    pub max_uncombines_per_window: u32,
    pub window_ticks: u64,
    /// Cells restored per tick while a staged uncombine runs.
    pub cells_per_step: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_uncombines_per_window: 5,
            window_ticks: 50,
            cells_per_step: 2,
        }
    }
}

/// Debris pool sizing and lifetimes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebrisConfig {
    pub max_active: u32,
    /// Released shells kept for reuse. Extra shells are dropped.
    pub max_pooled: u32,
    pub small_lifetime_ticks: u64,
    pub medium_lifetime_ticks: u64,
    pub large_lifetime_ticks: u64,
    /// Crumble gibs rolled for each destroyed voxel or cell.
    pub crumble_per_piece: u32,
}

impl Default for DebrisConfig {
    fn default() -> Self {
        Self {
            max_active: 500,
            max_pooled: 500,
            small_lifetime_ticks: 250,
            medium_lifetime_ticks: 500,
            large_lifetime_ticks: 10_000,
            crumble_per_piece: 3,
        }
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub tick_duration_ms: u32,
    pub member: MemberConfig,
    pub wall: WallConfig,
    pub group: GroupConfig,
    pub throttle: ThrottleConfig,
    pub debris: DebrisConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            tick_duration_ms: 20,
            member: MemberConfig::default(),
            wall: WallConfig::default(),
            group: GroupConfig::default(),
            throttle: ThrottleConfig::default(),
            debris: DebrisConfig::default(),
        }
    }
}

impl SimConfig {
    /// Parse and validate a config. Missing fields fall back to defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SimConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        fn positive(v: f32) -> bool {
            v > 0.0
        }

        if self.tick_duration_ms == 0 {
            return Err(invalid("tick_duration_ms", "must be positive"));
        }
        if !positive(self.member.piece_health) {
            return Err(invalid("member.piece_health", "must be positive"));
        }
        if !positive(self.member.connection_health) {
            return Err(invalid("member.connection_health", "must be positive"));
        }
        if !positive(self.wall.piece_health) {
            return Err(invalid("wall.piece_health", "must be positive"));
        }
        if !positive(self.wall.window_health) {
            return Err(invalid("wall.window_health", "must be positive"));
        }
        if self.group.min_propagation_ticks > self.group.max_propagation_ticks {
            return Err(invalid(
                "group.min_propagation_ticks",
                format!(
                    "{} exceeds max_propagation_ticks {}",
                    self.group.min_propagation_ticks, self.group.max_propagation_ticks
                ),
            ));
        }
        if self.group.validation_interval_ticks == 0 {
            return Err(invalid("group.validation_interval_ticks", "must be positive"));
        }
        if self.group.cleanup_interval_ticks == 0 {
            return Err(invalid("group.cleanup_interval_ticks", "must be positive"));
        }
        if self.throttle.window_ticks == 0 {
            return Err(invalid("throttle.window_ticks", "must be positive"));
        }
        if self.throttle.cells_per_step == 0 {
            return Err(invalid("throttle.cells_per_step", "must be positive"));
        }
        let d = &self.debris;
        if !(d.small_lifetime_ticks <= d.medium_lifetime_ticks
            && d.medium_lifetime_ticks <= d.large_lifetime_ticks)
        {
            return Err(invalid(
                "debris",
                "lifetimes must be ordered small <= medium <= large",
            ));
        }
        Ok(())
    }
}
