//! Quest Definition Structures
//!
//! Immutable quest templates produced by the generator, and the accepted
//! copy an actor works on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::encounter::EncounterRuntimeState;

/// Rarity tier of a quest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rarity {
    Common,
    Rare,
    Legendary,
    Mythic,
}

impl Rarity {
    pub const ALL: [Rarity; 4] = [Rarity::Common, Rarity::Rare, Rarity::Legendary, Rarity::Mythic];

    pub fn as_str(&self) -> &'static str {
        match self {
            Rarity::Common => "common",
            Rarity::Rare => "rare",
            Rarity::Legendary => "legendary",
            Rarity::Mythic => "mythic",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "common" => Some(Rarity::Common),
            "rare" => Some(Rarity::Rare),
            "legendary" => Some(Rarity::Legendary),
            "mythic" => Some(Rarity::Mythic),
            _ => None,
        }
    }
}

/// Objective types supported by the quest system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveKind {
    Kill,
    Mine,
    Gather,
    Encounter,
}

impl ObjectiveKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "kill" | "kill_monster" => Some(ObjectiveKind::Kill),
            "mine" | "break_block" => Some(ObjectiveKind::Mine),
            "gather" | "collect" | "collect_item" => Some(ObjectiveKind::Gather),
            "encounter" => Some(ObjectiveKind::Encounter),
            _ => None,
        }
    }
}

/// What has to be done to finish a quest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Objective {
    /// Kill entities whose type is in `targets`
    Kill { targets: Vec<String>, count: u32 },
    /// Break blocks whose id is in `targets`
    Mine { targets: Vec<String>, count: u32 },
    /// Pick up items whose id is in `targets`
    Gather { targets: Vec<String>, count: u32 },
    /// Defeat a group of spawned mobs at a selected zone
    Encounter { mob_kind: String, mob_count: u32 },
}

impl Objective {
    pub fn kind(&self) -> ObjectiveKind {
        match self {
            Objective::Kill { .. } => ObjectiveKind::Kill,
            Objective::Mine { .. } => ObjectiveKind::Mine,
            Objective::Gather { .. } => ObjectiveKind::Gather,
            Objective::Encounter { .. } => ObjectiveKind::Encounter,
        }
    }

    /// Progress needed to complete
    pub fn required_count(&self) -> u32 {
        match self {
            Objective::Kill { count, .. }
            | Objective::Mine { count, .. }
            | Objective::Gather { count, .. } => *count,
            Objective::Encounter { mob_count, .. } => *mob_count,
        }
    }

    /// Target identifiers the objective accepts
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Objective::Kill { targets, .. }
            | Objective::Mine { targets, .. }
            | Objective::Gather { targets, .. } => targets.iter().map(String::as_str).collect(),
            Objective::Encounter { mob_kind, .. } => vec![mob_kind.as_str()],
        }
    }
}

/// Item reward entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemReward {
    pub item_id: String,
    pub count: u32,
}

/// Quest rewards
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardSpec {
    /// Base SP before rarity, streak and jackpot modifiers
    pub currency: u64,
    #[serde(default)]
    pub items: Vec<ItemReward>,
}

/// An offerable quest template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestDefinition {
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub rarity: Rarity,
    pub objective: Objective,
    pub reward: RewardSpec,
}

impl QuestDefinition {
    pub fn is_encounter(&self) -> bool {
        matches!(self.objective, Objective::Encounter { .. })
    }

    pub fn required_count(&self) -> u32 {
        self.objective.required_count()
    }
}

/// A quest an actor has taken. Holds its own copy of the definition, so later
/// changes to the data pools never reach it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedQuest {
    pub definition: QuestDefinition,
    pub progress: u32,
    pub accepted_at: DateTime<Utc>,
    /// Present only for encounter objectives
    #[serde(default)]
    pub encounter: Option<EncounterRuntimeState>,
}

impl AcceptedQuest {
    pub fn new(definition: QuestDefinition, accepted_at: DateTime<Utc>) -> Self {
        Self {
            definition,
            progress: 0,
            accepted_at,
            encounter: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn required_count(&self) -> u32 {
        self.definition.required_count()
    }

    pub fn remaining(&self) -> u32 {
        self.required_count().saturating_sub(self.progress)
    }

    pub fn is_complete(&self) -> bool {
        self.progress >= self.required_count()
    }

    /// Add progress capped at the required count; returns true if newly completed
    pub fn add_progress(&mut self, amount: u32) -> bool {
        if self.is_complete() {
            return false;
        }
        self.progress = self.progress.saturating_add(amount).min(self.required_count());
        self.is_complete()
    }

    /// Whether a standard objective event advances this quest
    pub fn accepts_target(&self, kind: ObjectiveKind, target: &str) -> bool {
        self.definition.objective.kind() == kind
            && kind != ObjectiveKind::Encounter
            && self.definition.objective.targets().contains(&target)
    }
}
