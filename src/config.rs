//! Server Configuration
//!
//! Tunables for the quest cycle, economy, generator, zone selection and the
//! tick scheduler. Loaded from `config/quests.toml`; every field has a default.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::encounter::{BlockPos, MAX_ZONE_RADIUS};
use crate::error::ConfigError;
use crate::quest::Rarity;

/// Highest tick rate the host loop can schedule at millisecond resolution
pub const MAX_TICK_RATE: u32 = 1000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuestConfig {
    pub cycle: CycleConfig,
    pub economy: EconomyConfig,
    pub generator: GeneratorConfig,
    pub zone: ZoneConfig,
    pub scheduler: SchedulerConfig,
    pub server: ServerConfig,
}

impl QuestConfig {
    /// Load configuration from a TOML file, falling back to defaults when the
    /// file does not exist.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            warn!("Config file {:?} does not exist, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })?;

        info!("Loaded quest configuration from {:?}", path);
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: QuestConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.cycle.slot_count == 0 {
            return Err(ConfigError::Invalid("cycle.slot_count must be at least 1".into()));
        }
        if self.cycle.length_hours <= 0 {
            return Err(ConfigError::Invalid("cycle.length_hours must be positive".into()));
        }
        if self.generator.rarity_weights.total() == 0 {
            return Err(ConfigError::Invalid("generator.rarity_weights must not all be zero".into()));
        }
        if self.zone.min_distance > self.zone.max_distance {
            return Err(ConfigError::Invalid("zone.min_distance exceeds zone.max_distance".into()));
        }
        if !(0.0..=1.0).contains(&self.economy.jackpot_chance) {
            return Err(ConfigError::Invalid("economy.jackpot_chance must be within 0..=1".into()));
        }
        if !(1..=MAX_TICK_RATE).contains(&self.scheduler.tick_rate) {
            return Err(ConfigError::Invalid(format!(
                "scheduler.tick_rate must be within 1..={}",
                MAX_TICK_RATE
            )));
        }
        if self.zone.trigger_radius > MAX_ZONE_RADIUS {
            return Err(ConfigError::Invalid(format!(
                "zone.trigger_radius must not exceed {}",
                MAX_ZONE_RADIUS
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    pub length_hours: i64,
    pub slot_count: usize,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            length_hours: 24,
            slot_count: 3,
        }
    }
}

impl CycleConfig {
    pub fn length(&self) -> chrono::Duration {
        chrono::Duration::hours(self.length_hours)
    }
}

/// A value for each rarity tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerRarity<T> {
    pub common: T,
    pub rare: T,
    pub legendary: T,
    pub mythic: T,
}

impl<T: Copy> PerRarity<T> {
    pub fn get(&self, rarity: Rarity) -> T {
        match rarity {
            Rarity::Common => self.common,
            Rarity::Rare => self.rare,
            Rarity::Legendary => self.legendary,
            Rarity::Mythic => self.mythic,
        }
    }
}

impl PerRarity<u32> {
    pub fn total(&self) -> u32 {
        self.common + self.rare + self.legendary + self.mythic
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EconomyConfig {
    pub reroll_base_price: u64,
    pub rarity_multipliers: PerRarity<f64>,
    /// Flat SP added to the first completion of a cycle
    pub first_of_day_bonus: u64,
    /// Bonus fraction per prior completion in the same cycle
    pub streak_step: f64,
    pub streak_cap: f64,
    pub jackpot_chance: f64,
    pub jackpot_multiplier: u64,
    /// Completions per cycle that earn a free reroll
    pub free_reroll_milestone: u32,
}

impl Default for EconomyConfig {
    fn default() -> Self {
        Self {
            reroll_base_price: 100,
            rarity_multipliers: PerRarity {
                common: 1.0,
                rare: 1.5,
                legendary: 2.5,
                mythic: 4.0,
            },
            first_of_day_bonus: 25,
            streak_step: 0.10,
            streak_cap: 0.50,
            jackpot_chance: 0.02,
            jackpot_multiplier: 3,
            free_reroll_milestone: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub rarity_weights: PerRarity<u32>,
    /// Probability that a slot of this rarity becomes an encounter
    pub encounter_chance: PerRarity<f64>,
    /// Scales a pool entry's base count
    pub count_multipliers: PerRarity<u32>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            rarity_weights: PerRarity {
                common: 60,
                rare: 28,
                legendary: 10,
                mythic: 2,
            },
            encounter_chance: PerRarity {
                common: 0.0,
                rare: 0.35,
                legendary: 0.6,
                mythic: 0.0,
            },
            count_multipliers: PerRarity {
                common: 1,
                rare: 2,
                legendary: 3,
                mythic: 5,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneConfig {
    pub dimension: String,
    /// Fixed point encounter bearings are measured from
    pub anchor: BlockPos,
    pub min_distance: u32,
    pub max_distance: u32,
    pub trigger_radius: u32,
    pub max_attempts: u32,
    /// Used when every sampled center is rejected
    pub fallback: BlockPos,
    /// Horizontal jitter applied around the spawn anchor per resource
    pub spawn_spread: i32,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            dimension: "overworld".to_string(),
            anchor: BlockPos::new(0, 64, 0),
            min_distance: 150,
            max_distance: 600,
            trigger_radius: 10,
            max_attempts: 16,
            fallback: BlockPos::new(200, 64, 200),
            spawn_spread: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_rate: u32,
    pub reconcile_interval_ticks: u64,
    /// Actors further than this from their spawn anchor are not reconciled
    pub reconcile_max_distance: u32,
    pub orphan_cleanup_delay_ticks: u64,
    pub orphan_cleanup_repeat_ticks: Option<u64>,
    pub stale_sweep_interval_ticks: u64,
    pub damage_max_age_ticks: u64,
    pub zone_entry_debounce_ticks: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_rate: 20,
            reconcile_interval_ticks: 100,
            reconcile_max_distance: 128,
            orphan_cleanup_delay_ticks: 600,
            orphan_cleanup_repeat_ticks: None,
            stale_sweep_interval_ticks: 200,
            damage_max_age_ticks: 600,
            zone_entry_debounce_ticks: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub database_url: String,
    pub data_dir: String,
    pub autosave_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:2567".to_string(),
            database_url: "sqlite:quests.db?mode=rwc".to_string(),
            data_dir: "data".to_string(),
            autosave_secs: 30,
        }
    }
}
