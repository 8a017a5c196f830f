//! Quest Data Pools
//!
//! Static pools the generator draws from, loaded from TOML files under
//! `<data_dir>/quests`. Supports hot-reloading during development.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, warn};

use super::definition::{ItemReward, Rarity};
use crate::error::ConfigError;

// ============================================================================
// Raw TOML Structures
// ============================================================================

/// One pool file; every section is optional
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPoolFile {
    #[serde(default)]
    pub kill: Vec<StandardEntry>,
    #[serde(default)]
    pub mine: Vec<StandardEntry>,
    #[serde(default)]
    pub gather: Vec<StandardEntry>,
    #[serde(default)]
    pub encounter: Vec<EncounterEntry>,
}

/// A kill/mine/gather template
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StandardEntry {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    pub targets: Vec<String>,
    /// Count at common rarity; scaled per rarity by the generator
    #[serde(default = "default_count")]
    pub base_count: u32,
    #[serde(default = "default_reward")]
    pub reward: u64,
    #[serde(default)]
    pub items: Vec<RawItemReward>,
}

/// An encounter template
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EncounterEntry {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default = "default_encounter_category")]
    pub category: String,
    pub mob_kind: String,
    /// Inclusive `[min, max]` mob count
    pub mob_count: [u32; 2],
    #[serde(default = "default_reward")]
    pub reward: u64,
    #[serde(default)]
    pub items: Vec<RawItemReward>,
    /// Rarities this encounter may be offered at
    #[serde(default = "default_encounter_rarities")]
    pub rarities: Vec<Rarity>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawItemReward {
    pub id: String,
    #[serde(default = "default_item_count")]
    pub count: u32,
}

impl RawItemReward {
    pub fn resolve(&self) -> ItemReward {
        ItemReward {
            item_id: self.id.clone(),
            count: self.count,
        }
    }
}

fn default_category() -> String {
    "general".to_string()
}

fn default_encounter_category() -> String {
    "encounter".to_string()
}

fn default_count() -> u32 {
    1
}

fn default_item_count() -> u32 {
    1
}

fn default_reward() -> u64 {
    100
}

fn default_encounter_rarities() -> Vec<Rarity> {
    vec![Rarity::Rare, Rarity::Legendary]
}

// ============================================================================
// Pool
// ============================================================================

/// All templates the generator can draw from
#[derive(Debug, Clone, Default)]
pub struct QuestPool {
    pub kill: Vec<StandardEntry>,
    pub mine: Vec<StandardEntry>,
    pub gather: Vec<StandardEntry>,
    pub encounters: Vec<EncounterEntry>,
}

impl QuestPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.toml` file under `<data_dir>/quests`
    pub fn load_from_directory(data_dir: &Path) -> Result<Self, ConfigError> {
        let quest_dir = data_dir.join("quests");
        let mut pool = Self::new();

        if !quest_dir.exists() {
            warn!("Quest pool directory does not exist: {:?}", quest_dir);
            return Ok(pool);
        }

        let mut paths = Vec::new();
        collect_toml_files(&quest_dir, &mut paths)?;
        paths.sort();

        for path in paths {
            let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
            let raw: RawPoolFile = toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
            pool.merge(raw);
            info!("Loaded quest pool file {:?}", path);
        }

        pool.validate();
        info!(
            "Quest pool ready: {} kill, {} mine, {} gather, {} encounter templates",
            pool.kill.len(),
            pool.mine.len(),
            pool.gather.len(),
            pool.encounters.len()
        );
        Ok(pool)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let raw: RawPoolFile = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        let mut pool = Self::new();
        pool.merge(raw);
        pool.validate();
        Ok(pool)
    }

    fn merge(&mut self, raw: RawPoolFile) {
        self.kill.extend(raw.kill);
        self.mine.extend(raw.mine);
        self.gather.extend(raw.gather);
        self.encounters.extend(raw.encounter);
    }

    /// Drop entries that could never produce a usable quest
    fn validate(&mut self) {
        for (label, entries) in [
            ("kill", &mut self.kill),
            ("mine", &mut self.mine),
            ("gather", &mut self.gather),
        ] {
            entries.retain(|entry| {
                let usable = !entry.targets.is_empty() && entry.base_count > 0;
                if !usable {
                    warn!("Dropping {} template '{}': no targets or zero count", label, entry.id);
                }
                usable
            });
        }

        self.encounters.retain(|entry| {
            let [min, max] = entry.mob_count;
            let usable = min > 0 && min <= max;
            if !usable {
                warn!("Dropping encounter template '{}': invalid mob_count {:?}", entry.id, entry.mob_count);
            }
            usable
        });
    }

    pub fn has_standard(&self) -> bool {
        !(self.kill.is_empty() && self.mine.is_empty() && self.gather.is_empty())
    }

    /// Encounter templates offered at a rarity
    pub fn encounters_for(&self, rarity: Rarity) -> Vec<&EncounterEntry> {
        self.encounters
            .iter()
            .filter(|entry| entry.rarities.contains(&rarity))
            .collect()
    }
}

fn collect_toml_files(dir: &Path, paths: &mut Vec<PathBuf>) -> Result<(), ConfigError> {
    let entries = std::fs::read_dir(dir).map_err(|source| ConfigError::Io {
        path: dir.display().to_string(),
        source,
    })?;

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_toml_files(&path, paths)?;
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            paths.push(path);
        }
    }
    Ok(())
}

// ============================================================================
// Hot Reload
// ============================================================================

/// Events from the hot-reload watcher
#[derive(Debug)]
pub enum HotReloadEvent {
    /// The pool directory changed and was reloaded successfully
    Reloaded(QuestPool),
    /// An error occurred during reload
    Error(String),
}

/// Watch `<data_dir>/quests` and send a freshly loaded pool on every change.
pub fn start_file_watcher(
    data_dir: PathBuf,
) -> Result<tokio::sync::mpsc::Receiver<HotReloadEvent>, String> {
    use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
    use std::time::Duration;

    let (tx, rx) = tokio::sync::mpsc::channel(8);
    let quest_dir = data_dir.join("quests");
    if !quest_dir.exists() {
        return Err(format!("Quest pool directory does not exist: {:?}", quest_dir));
    }

    // notify is sync, so the watcher lives on its own thread
    std::thread::spawn(move || {
        let (notify_tx, notify_rx) = std::sync::mpsc::channel();

        let mut watcher = match RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = notify_tx.send(event);
                }
            },
            Config::default().with_poll_interval(Duration::from_secs(1)),
        ) {
            Ok(w) => w,
            Err(e) => {
                tracing::error!("Failed to create file watcher: {}", e);
                return;
            }
        };

        if let Err(e) = watcher.watch(&quest_dir, RecursiveMode::Recursive) {
            tracing::error!("Failed to watch quest pool directory: {}", e);
            return;
        }

        info!("Quest pool hot-reload watcher started for {:?}", quest_dir);

        while let Ok(event) = notify_rx.recv() {
            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                continue;
            }
            let touches_toml = event
                .paths
                .iter()
                .any(|path| path.extension().is_some_and(|ext| ext == "toml"));
            if !touches_toml {
                continue;
            }

            let message = match QuestPool::load_from_directory(&data_dir) {
                Ok(pool) => HotReloadEvent::Reloaded(pool),
                Err(e) => HotReloadEvent::Error(e.to_string()),
            };
            if tx.blocking_send(message).is_err() {
                break;
            }
        }
    });

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_pool_toml() -> &'static str {
        r#"
[[kill]]
id = "zombie_hunt"
title = "Zombie Hunt"
description = "Put down the shambling dead"
category = "combat"
targets = ["zombie", "husk"]
base_count = 8
reward = 120

[[mine]]
id = "deep_iron"
title = "Deep Iron"
description = "Bring up iron ore"
targets = ["iron_ore"]
base_count = 16

[[encounter]]
id = "raider_camp"
title = "Raider Camp"
description = "Clear out the raider camp"
mob_kind = "pillager"
mob_count = [3, 6]
reward = 300
items = [{ id = "emerald", count = 2 }]
"#
    }

    #[test]
    fn test_load_pool_directory() {
        let temp_dir = TempDir::new().unwrap();
        let quest_dir = temp_dir.path().join("quests").join("overworld");
        std::fs::create_dir_all(&quest_dir).unwrap();
        std::fs::write(quest_dir.join("pool.toml"), create_test_pool_toml()).unwrap();

        let pool = QuestPool::load_from_directory(temp_dir.path()).unwrap();
        assert_eq!(pool.kill.len(), 1);
        assert_eq!(pool.mine.len(), 1);
        assert!(pool.gather.is_empty());
        assert_eq!(pool.encounters.len(), 1);

        let mine = &pool.mine[0];
        assert_eq!(mine.category, "general");
        assert_eq!(mine.reward, 100);

        let encounter = &pool.encounters[0];
        assert_eq!(encounter.rarities, vec![Rarity::Rare, Rarity::Legendary]);
        assert_eq!(encounter.items[0].resolve().count, 2);
    }

    #[test]
    fn test_missing_directory_yields_empty_pool() {
        let temp_dir = TempDir::new().unwrap();
        let pool = QuestPool::load_from_directory(temp_dir.path()).unwrap();
        assert!(!pool.has_standard());
        assert!(pool.encounters.is_empty());
    }

    #[test]
    fn test_unusable_entries_dropped() {
        let pool = QuestPool::from_toml(
            r#"
[[gather]]
id = "nothing"
title = "Nothing"
description = "No targets"
targets = []

[[encounter]]
id = "backwards"
title = "Backwards"
description = "Bad range"
mob_kind = "zombie"
mob_count = [5, 2]
"#,
        )
        .unwrap();

        assert!(pool.gather.is_empty());
        assert!(pool.encounters.is_empty());
    }

    #[test]
    fn test_encounters_filtered_by_rarity() {
        let pool = QuestPool::from_toml(create_test_pool_toml()).unwrap();
        assert_eq!(pool.encounters_for(Rarity::Legendary).len(), 1);
        assert!(pool.encounters_for(Rarity::Common).is_empty());
    }

    #[test]
    fn test_shipped_pool_is_usable() {
        let pool = QuestPool::from_toml(include_str!("../../data/quests/pool.toml")).unwrap();
        assert!(pool.has_standard());
        assert_eq!(pool.kill.len(), 3);
        assert_eq!(pool.encounters_for(Rarity::Rare).len(), 2);
        assert_eq!(pool.encounters_for(Rarity::Legendary).len(), 2);
    }
}
