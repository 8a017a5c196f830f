//! Quest State Tracking
//!
//! Per-actor session state and its persisted record format, including the
//! older flat-list layout that is migrated on load.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::definition::{
    AcceptedQuest, ItemReward, Objective, ObjectiveKind, QuestDefinition, Rarity, RewardSpec,
};
use crate::encounter::{EncounterPhase, EncounterRuntimeState};

/// Current record layout version
pub const STATE_VERSION: u32 = 2;

/// Everything tracked for one actor between cycles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionQuestState {
    pub version: u32,
    /// Offerable quests; `None` marks a slot consumed by accept
    pub slots: Vec<Option<QuestDefinition>>,
    pub active: Option<AcceptedQuest>,
    pub last_refresh: DateTime<Utc>,
    pub free_reroll: bool,
    /// Paid rerolls used in the current cycle
    #[serde(default)]
    pub paid_rerolls: u32,
    #[serde(default)]
    pub completions_total: u32,
    #[serde(default)]
    pub completions_this_cycle: u32,
    /// Consecutive completions in the current cycle
    #[serde(default)]
    pub streak: u32,
    #[serde(default)]
    pub best_streak: u32,
}

impl SessionQuestState {
    /// Fresh state for a first contact: new slots and a free reroll
    pub fn new(slots: Vec<Option<QuestDefinition>>, now: DateTime<Utc>) -> Self {
        Self {
            version: STATE_VERSION,
            slots,
            active: None,
            last_refresh: now,
            free_reroll: true,
            paid_rerolls: 0,
            completions_total: 0,
            completions_this_cycle: 0,
            streak: 0,
            best_streak: 0,
        }
    }

    pub fn has_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn cycle_expired(&self, now: DateTime<Utc>, length: chrono::Duration) -> bool {
        now - self.last_refresh >= length
    }

    /// Quest id of a spawned encounter, if the active quest has one
    pub fn spawned_encounter(&self) -> Option<&str> {
        self.active
            .as_ref()
            .and_then(|q| q.encounter.as_ref())
            .filter(|e| e.phase == EncounterPhase::Spawned)
            .map(|e| e.quest_id.as_str())
    }

    /// Wipe per-cycle data. The free reroll flag is carried over untouched.
    pub fn start_cycle(&mut self, slots: Vec<Option<QuestDefinition>>, now: DateTime<Utc>) {
        self.slots = slots;
        self.active = None;
        self.paid_rerolls = 0;
        self.completions_this_cycle = 0;
        self.streak = 0;
        self.last_refresh = now;
    }

    /// Count a redeemed quest. Returns the streak value before this
    /// completion, which drives the streak bonus.
    pub fn record_completion(&mut self) -> u32 {
        let previous = self.streak;
        self.completions_total += 1;
        self.completions_this_cycle += 1;
        self.streak += 1;
        self.best_streak = self.best_streak.max(self.streak);
        previous
    }

    /// Grant the free reroll when cycle completions reach a milestone.
    /// Returns true if it was granted.
    pub fn grant_milestone_reroll(&mut self, milestone: u32) -> bool {
        if milestone == 0 || self.free_reroll {
            return false;
        }
        if self.completions_this_cycle > 0 && self.completions_this_cycle % milestone == 0 {
            self.free_reroll = true;
            return true;
        }
        false
    }
}

// ============================================================================
// Persisted Record
// ============================================================================

/// Any record layout that can be read back
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum StoredRecord {
    Current(SessionQuestState),
    Legacy(LegacyRecord),
}

/// Flat layout written by earlier releases: a list of quests with a single
/// shared progress counter
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyRecord {
    pub quests: Vec<LegacyQuest>,
    #[serde(default)]
    pub progress: u32,
    #[serde(default)]
    pub completed: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LegacyQuest {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub rarity: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default = "default_legacy_count")]
    pub count: u32,
    #[serde(default)]
    pub reward: u64,
    #[serde(default)]
    pub items: Vec<ItemReward>,
}

fn default_legacy_count() -> u32 {
    1
}

impl LegacyQuest {
    /// Convert to a current definition. Unknown objective types yield `None`.
    pub fn into_definition(self) -> Option<QuestDefinition> {
        let Some(kind) = ObjectiveKind::from_str(&self.kind) else {
            warn!("Dropping legacy quest {} with unknown type '{}'", self.id, self.kind);
            return None;
        };

        let mut targets = self.targets;
        if let Some(target) = self.target {
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
        let count = self.count.max(1);

        let objective = match kind {
            ObjectiveKind::Kill => Objective::Kill { targets, count },
            ObjectiveKind::Mine => Objective::Mine { targets, count },
            ObjectiveKind::Gather => Objective::Gather { targets, count },
            ObjectiveKind::Encounter => Objective::Encounter {
                mob_kind: targets.into_iter().next().unwrap_or_else(|| "zombie".to_string()),
                mob_count: count,
            },
        };

        let rarity = self
            .rarity
            .as_deref()
            .and_then(Rarity::from_str)
            .unwrap_or(Rarity::Common);

        Some(QuestDefinition {
            id: self.id,
            title: self.title,
            description: self.description,
            category: self.category.unwrap_or_else(|| "general".to_string()),
            rarity,
            objective,
            reward: RewardSpec {
                currency: self.reward,
                items: self.items,
            },
        })
    }
}

impl LegacyRecord {
    /// Build a current state: the first usable legacy quest becomes the
    /// active quest, and the slots are supplied fresh by the caller.
    pub fn migrate(self, slots: Vec<Option<QuestDefinition>>, now: DateTime<Utc>) -> SessionQuestState {
        let mut state = SessionQuestState::new(slots, now);
        state.completions_total = self.completed;

        let first = self.quests.into_iter().find_map(LegacyQuest::into_definition);
        if let Some(definition) = first {
            let mut quest = AcceptedQuest::new(definition, now);
            quest.progress = self.progress.min(quest.required_count());
            if let Objective::Encounter { mob_kind, mob_count } = &quest.definition.objective {
                // Legacy records never stored a zone; it is chosen on next connect
                quest.encounter = Some(EncounterRuntimeState {
                    quest_id: quest.definition.id.clone(),
                    phase: EncounterPhase::Pending,
                    mob_kind: mob_kind.clone(),
                    total_mobs: *mob_count,
                    zone: None,
                    spawn: None,
                });
            }
            state.active = Some(quest);
        }
        state
    }
}
