//! Encounter System Module
//!
//! Zone selection, per-quest runtime state and the lifecycle engine that
//! spawns, attributes and cleans up encounter resources.

pub mod lifecycle;
pub mod state;
pub mod zone;

pub use lifecycle::{
    EncounterEngine, KillProgress, ReconcileReport, ReconnectOutcome, ResourceIndex, ZoneEntry,
};
pub use state::{
    ENCOUNTER_MARKER, EncounterPhase, EncounterRuntimeState, SpawnRecord, quest_id_from_tags,
    quest_tag,
};
pub use zone::{BlockPos, MAX_ZONE_RADIUS, Zone, find_spawn_anchor, select_zone};
