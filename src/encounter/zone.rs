//! Encounter Zones
//!
//! Zone selection happens once per encounter, at accept time. The chosen
//! zone is stored on the accepted quest and never regenerated.

use std::f64::consts::TAU;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ZoneConfig;
use crate::world::WorldConstraints;

/// Largest zone radius sampled around; larger configured radii are clamped
pub const MAX_ZONE_RADIUS: u32 = 4096;

/// Integer block coordinates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub fn offset(&self, dx: i32, dy: i32, dz: i32) -> Self {
        Self::new(
            self.x.saturating_add(dx),
            self.y.saturating_add(dy),
            self.z.saturating_add(dz),
        )
    }

    /// Squared distance on the x/z plane
    pub fn horizontal_distance_sq(&self, other: &BlockPos) -> i64 {
        let dx = self.x as i64 - other.x as i64;
        let dz = self.z as i64 - other.z as i64;
        dx.saturating_mul(dx).saturating_add(dz.saturating_mul(dz))
    }
}

impl fmt::Display for BlockPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Region an actor must enter to trigger spawning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub center: BlockPos,
    pub radius: u32,
    pub dimension: String,
}

impl Zone {
    pub fn new(center: BlockPos, radius: u32, dimension: &str) -> Self {
        Self {
            center,
            radius,
            dimension: dimension.to_string(),
        }
    }

    pub fn contains(&self, pos: &BlockPos, dimension: &str) -> bool {
        let r = self.radius as i64;
        self.dimension == dimension && self.center.horizontal_distance_sq(pos) <= r.saturating_mul(r)
    }
}

/// Pick a zone center at a random bearing and distance from the configured
/// anchor. Candidates are validated by the world; after `max_attempts`
/// rejections the fallback point is used.
pub fn select_zone<C, R>(
    constraints: &C,
    config: &ZoneConfig,
    rng: &mut R,
) -> Zone
where
    C: WorldConstraints + ?Sized,
    R: Rng + ?Sized,
{
    let min = config.min_distance.min(config.max_distance);
    let max = config.max_distance.max(min);

    for _ in 0..config.max_attempts {
        let bearing = rng.gen_range(0.0..TAU);
        let distance = rng.gen_range(min..=max) as f64;
        let candidate = config.anchor.offset(
            (distance * bearing.cos()).round() as i32,
            0,
            (distance * bearing.sin()).round() as i32,
        );

        if let Some(center) = constraints.validate_spawn_point(candidate, &config.dimension) {
            return Zone::new(center, config.trigger_radius, &config.dimension);
        }
    }

    warn!(
        "No valid encounter zone after {} attempts, using fallback {}",
        config.max_attempts, config.fallback
    );
    Zone::new(config.fallback, config.trigger_radius, &config.dimension)
}

/// Choose where a zone's resources appear: the zone center if valid,
/// otherwise a validated point inside the zone, otherwise the raw center.
pub fn find_spawn_anchor<C, R>(
    constraints: &C,
    zone: &Zone,
    attempts: u32,
    rng: &mut R,
) -> BlockPos
where
    C: WorldConstraints + ?Sized,
    R: Rng + ?Sized,
{
    if let Some(anchor) = constraints.validate_spawn_point(zone.center, &zone.dimension) {
        return anchor;
    }

    let r = zone.radius.min(MAX_ZONE_RADIUS) as i32;
    for _ in 0..attempts {
        let candidate = zone
            .center
            .offset(rng.gen_range(-r..=r), 0, rng.gen_range(-r..=r));
        if !zone.contains(&candidate, &zone.dimension) {
            continue;
        }
        if let Some(anchor) = constraints.validate_spawn_point(candidate, &zone.dimension) {
            return anchor;
        }
    }

    zone.center
}
