//! Encounter Runtime State
//!
//! The mutable part of an accepted encounter quest, persisted with the
//! actor's quest state.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::zone::{BlockPos, Zone};
use crate::world::ResourceHandle;

/// Marker label carried by every resource spawned for an encounter
pub const ENCOUNTER_MARKER: &str = "quest_encounter";

const QUEST_TAG_PREFIX: &str = "quest:";

/// Label tying a resource to its owning quest
pub fn quest_tag(quest_id: &str) -> String {
    format!("{}{}", QUEST_TAG_PREFIX, quest_id)
}

/// Find the owning quest id among a resource's labels
pub fn quest_id_from_tags(tags: &[String]) -> Option<&str> {
    tags.iter()
        .find_map(|tag| tag.strip_prefix(QUEST_TAG_PREFIX))
        .filter(|id| !id.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncounterPhase {
    /// Waiting for the actor to reach the zone
    Pending,
    /// Resources are (or should be) alive in the world
    Spawned,
    /// Every resource has been defeated; waiting for redeem
    Complete,
}

impl EncounterPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncounterPhase::Pending => "pending",
            EncounterPhase::Spawned => "spawned",
            EncounterPhase::Complete => "complete",
        }
    }
}

/// Where and what was spawned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnRecord {
    pub dimension: String,
    pub anchor: BlockPos,
    /// Live resources; empty while the owner is offline
    #[serde(default)]
    pub handles: Vec<ResourceHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncounterRuntimeState {
    pub quest_id: String,
    pub phase: EncounterPhase,
    pub mob_kind: String,
    pub total_mobs: u32,
    #[serde(default)]
    pub zone: Option<Zone>,
    #[serde(default)]
    pub spawn: Option<SpawnRecord>,
}

impl EncounterRuntimeState {
    pub fn new(quest_id: &str, mob_kind: &str, total_mobs: u32, zone: Zone) -> Self {
        Self {
            quest_id: quest_id.to_string(),
            phase: EncounterPhase::Pending,
            mob_kind: mob_kind.to_string(),
            total_mobs,
            zone: Some(zone),
            spawn: None,
        }
    }

    pub fn is_spawned(&self) -> bool {
        self.phase == EncounterPhase::Spawned
    }

    pub fn handles(&self) -> &[ResourceHandle] {
        self.spawn.as_ref().map(|s| s.handles.as_slice()).unwrap_or(&[])
    }

    /// Repair states that cannot be acted on. A spawned encounter without a
    /// spawn record falls back to pending. Returns true if anything changed.
    pub fn normalize(&mut self) -> bool {
        if self.phase == EncounterPhase::Spawned && self.spawn.is_none() {
            warn!(
                "Encounter {} was spawned without a spawn record, resetting to pending",
                self.quest_id
            );
            self.phase = EncounterPhase::Pending;
            return true;
        }
        if self.phase == EncounterPhase::Pending && self.zone.is_none() {
            warn!("Encounter {} has no zone, it has no travel target", self.quest_id);
        }
        false
    }
}
