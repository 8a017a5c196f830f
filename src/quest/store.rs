//! Session Quest Store
//!
//! Loads, migrates, caches and saves each actor's quest state. While an
//! actor is cached the cached object is the only copy anyone mutates, so
//! several events in one tick all see each other's changes.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::definition::AcceptedQuest;
use super::generator::QuestGenerator;
use super::state::{STATE_VERSION, SessionQuestState, StoredRecord};
use crate::config::CycleConfig;
use crate::error::StoreError;

/// Record key holding the serialized session state
pub const STATE_KEY: &str = "quest_state";

/// Key-value persistence provided by the host. Durable, but not
/// transactional across keys.
pub trait Persistence {
    fn read(&self, actor_id: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn write(&self, actor_id: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
}

impl<T: Persistence + ?Sized> Persistence for Arc<T> {
    fn read(&self, actor_id: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).read(actor_id, key)
    }

    fn write(&self, actor_id: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        (**self).write(actor_id, key, bytes)
    }
}

/// An active quest dropped by a cycle rollover. Its world resources still
/// need releasing by whoever owns them.
#[derive(Debug, Clone)]
pub struct DiscardedQuest {
    pub actor_id: String,
    pub quest: AcceptedQuest,
}

pub struct SessionQuestStore<P: Persistence> {
    persistence: P,
    cycle: CycleConfig,
    cache: HashMap<String, SessionQuestState>,
    discarded: Vec<DiscardedQuest>,
}

impl<P: Persistence> SessionQuestStore<P> {
    pub fn new(persistence: P, cycle: CycleConfig) -> Self {
        Self {
            persistence,
            cycle,
            cache: HashMap::new(),
            discarded: Vec::new(),
        }
    }

    pub fn persistence(&self) -> &P {
        &self.persistence
    }

    /// Cached state for an actor, loading (or creating) it on a miss and
    /// applying cycle expiry either way
    pub fn get(
        &mut self,
        actor_id: &str,
        now: DateTime<Utc>,
        generator: &mut QuestGenerator,
    ) -> Result<&mut SessionQuestState, StoreError> {
        let slot_count = self.cycle.slot_count;
        let state = match self.cache.entry(actor_id.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let (state, changed) = load(&self.persistence, actor_id, now, slot_count, generator)?;
                if changed {
                    write_state(&self.persistence, actor_id, &state);
                }
                entry.insert(state)
            }
        };

        if state.cycle_expired(now, self.cycle.length()) {
            if let Some(quest) = state.active.take() {
                self.discarded.push(DiscardedQuest {
                    actor_id: actor_id.to_string(),
                    quest,
                });
            }
            state.start_cycle(generator.generate_slots(slot_count), now);
            info!("Quest cycle rolled over for {}", actor_id);
            write_state(&self.persistence, actor_id, state);
        }

        Ok(state)
    }

    /// Persist `state` verbatim and make it the cached copy
    pub fn save(&mut self, actor_id: &str, state: SessionQuestState) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&state)?;
        self.cache.insert(actor_id.to_string(), state);
        self.persistence.write(actor_id, STATE_KEY, &bytes)
    }

    /// Persist the cached copy, if any
    pub fn commit(&self, actor_id: &str) -> Result<(), StoreError> {
        let Some(state) = self.cache.get(actor_id) else {
            return Ok(());
        };
        let bytes = serde_json::to_vec(state)?;
        self.persistence.write(actor_id, STATE_KEY, &bytes)
    }

    /// Drop the cache entry. Mutations must have been saved first.
    pub fn evict(&mut self, actor_id: &str) -> Option<SessionQuestState> {
        let state = self.cache.remove(actor_id);
        if state.is_some() {
            debug!("Evicted quest state for {}", actor_id);
        }
        state
    }

    pub fn is_cached(&self, actor_id: &str) -> bool {
        self.cache.contains_key(actor_id)
    }

    pub fn cached(&self, actor_id: &str) -> Option<&SessionQuestState> {
        self.cache.get(actor_id)
    }

    pub fn cached_mut(&mut self, actor_id: &str) -> Option<&mut SessionQuestState> {
        self.cache.get_mut(actor_id)
    }

    pub fn cached_actors(&self) -> Vec<String> {
        let mut actors: Vec<String> = self.cache.keys().cloned().collect();
        actors.sort();
        actors
    }

    /// Active quests dropped by cycle rollovers since the last call
    pub fn take_discarded(&mut self) -> Vec<DiscardedQuest> {
        std::mem::take(&mut self.discarded)
    }
}

/// Read and decode an actor's record. Returns the state and whether it
/// differs from what is stored.
fn load<P: Persistence>(
    persistence: &P,
    actor_id: &str,
    now: DateTime<Utc>,
    slot_count: usize,
    generator: &mut QuestGenerator,
) -> Result<(SessionQuestState, bool), StoreError> {
    let Some(bytes) = persistence.read(actor_id, STATE_KEY)? else {
        info!("Created quest state for {}", actor_id);
        return Ok((SessionQuestState::new(generator.generate_slots(slot_count), now), true));
    };

    match serde_json::from_slice::<StoredRecord>(&bytes) {
        Ok(StoredRecord::Current(mut state)) => {
            let mut changed = state.version != STATE_VERSION;
            state.version = STATE_VERSION;

            if state.slots.len() != slot_count {
                state.slots.truncate(slot_count);
                while state.slots.len() < slot_count {
                    state.slots.push(generator.generate_quest());
                }
                changed = true;
            }
            if let Some(encounter) = state.active.as_mut().and_then(|q| q.encounter.as_mut()) {
                changed |= encounter.normalize();
            }
            Ok((state, changed))
        }
        Ok(StoredRecord::Legacy(legacy)) => {
            info!("Migrating legacy quest record for {}", actor_id);
            Ok((legacy.migrate(generator.generate_slots(slot_count), now), true))
        }
        Err(e) => {
            warn!("Malformed quest record for {}, rebuilding: {}", actor_id, e);
            Ok((SessionQuestState::new(generator.generate_slots(slot_count), now), true))
        }
    }
}

fn write_state<P: Persistence>(persistence: &P, actor_id: &str, state: &SessionQuestState) {
    let result = serde_json::to_vec(state)
        .map_err(StoreError::from)
        .and_then(|bytes| persistence.write(actor_id, STATE_KEY, &bytes));
    if let Err(e) = result {
        warn!("Failed to persist quest state for {}: {}", actor_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GeneratorConfig;
    use crate::db::MemoryKv;
    use crate::quest::QuestPool;
    use chrono::Duration;

    struct Unreadable;

    impl Persistence for Unreadable {
        fn read(&self, actor_id: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Err(StoreError::Read {
                actor: actor_id.to_string(),
                key: key.to_string(),
                reason: "backend offline".to_string(),
            })
        }

        fn write(&self, _actor_id: &str, _key: &str, _bytes: &[u8]) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn generator() -> QuestGenerator {
        let pool = QuestPool::from_toml(
            r#"
[[gather]]
id = "berries"
title = "Berry Picking"
description = "Fill the basket"
targets = ["sweet_berries"]
base_count = 8
"#,
        )
        .unwrap();
        QuestGenerator::with_seed(pool, GeneratorConfig::default(), 21)
    }

    fn store(kv: Arc<MemoryKv>) -> SessionQuestStore<Arc<MemoryKv>> {
        SessionQuestStore::new(kv, CycleConfig::default())
    }

    #[test]
    fn test_first_contact_creates_and_persists_state() {
        let kv = Arc::new(MemoryKv::new());
        let mut store = store(kv.clone());
        let mut generator = generator();

        let state = store.get("alice", Utc::now(), &mut generator).unwrap();
        assert_eq!(state.slots.len(), 3);
        assert!(state.slots.iter().all(Option::is_some));
        assert!(state.free_reroll);
        assert!(kv.read("alice", STATE_KEY).unwrap().is_some());
    }

    #[test]
    fn test_get_returns_same_cached_object() {
        let kv = Arc::new(MemoryKv::new());
        let mut store = store(kv);
        let mut generator = generator();
        let now = Utc::now();

        store.get("alice", now, &mut generator).unwrap().paid_rerolls = 2;
        store.get("alice", now, &mut generator).unwrap().paid_rerolls += 1;
        assert_eq!(store.get("alice", now, &mut generator).unwrap().paid_rerolls, 3);
    }

    #[test]
    fn test_commit_evict_and_reload() {
        let kv = Arc::new(MemoryKv::new());
        let mut store = store(kv.clone());
        let mut generator = generator();
        let now = Utc::now();

        store.get("alice", now, &mut generator).unwrap().completions_total = 7;
        store.commit("alice").unwrap();
        assert!(store.evict("alice").is_some());
        assert!(!store.is_cached("alice"));

        let state = store.get("alice", now, &mut generator).unwrap();
        assert_eq!(state.completions_total, 7);
    }

    #[test]
    fn test_cycle_expiry_keeps_unused_free_reroll() {
        let kv = Arc::new(MemoryKv::new());
        let mut store = store(kv);
        let mut generator = generator();
        let start = Utc::now();

        let state = store.get("alice", start, &mut generator).unwrap();
        let old_slots = state.slots.clone();
        state.active = Some(AcceptedQuest::new(old_slots[0].clone().unwrap(), start));
        state.slots[0] = None;
        state.paid_rerolls = 2;

        let state = store.get("alice", start + Duration::hours(24), &mut generator).unwrap();
        assert!(state.active.is_none());
        assert!(state.free_reroll);
        assert_eq!(state.paid_rerolls, 0);
        assert!(state.slots.iter().all(Option::is_some));
        assert_ne!(state.slots, old_slots);
        assert_eq!(store.take_discarded().len(), 1);
    }

    #[test]
    fn test_cycle_expiry_does_not_restore_used_free_reroll() {
        let kv = Arc::new(MemoryKv::new());
        let mut store = store(kv);
        let mut generator = generator();
        let start = Utc::now();

        store.get("alice", start, &mut generator).unwrap().free_reroll = false;
        let state = store.get("alice", start + Duration::hours(30), &mut generator).unwrap();
        assert!(!state.free_reroll);
        assert!(store.take_discarded().is_empty());
    }

    #[test]
    fn test_legacy_record_is_migrated() {
        let kv = Arc::new(MemoryKv::new());
        let legacy = br#"{"quests":[{"id":"old","type":"kill","targets":["zombie"],"count":6}],"progress":2}"#;
        kv.write("bob", STATE_KEY, legacy).unwrap();

        let mut store = store(kv.clone());
        let mut generator = generator();
        let state = store.get("bob", Utc::now(), &mut generator).unwrap();
        let active = state.active.as_ref().unwrap();
        assert_eq!(active.id(), "old");
        assert_eq!(active.progress, 2);
        assert_eq!(state.slots.len(), 3);

        // The migrated layout was written back
        let bytes = kv.read("bob", STATE_KEY).unwrap().unwrap();
        let stored: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(stored["version"], STATE_VERSION);
    }

    #[test]
    fn test_malformed_record_is_rebuilt() {
        let kv = Arc::new(MemoryKv::new());
        kv.write("carol", STATE_KEY, b"{not json").unwrap();

        let mut store = store(kv);
        let mut generator = generator();
        let state = store.get("carol", Utc::now(), &mut generator).unwrap();
        assert_eq!(state.slots.len(), 3);
        assert!(state.active.is_none());
    }

    #[test]
    fn test_read_failure_is_reported() {
        let mut store = SessionQuestStore::new(Unreadable, CycleConfig::default());
        let mut generator = generator();
        assert!(store.get("dave", Utc::now(), &mut generator).is_err());
        assert!(!store.is_cached("dave"));
    }

    #[test]
    fn test_save_replaces_cached_copy() {
        let kv = Arc::new(MemoryKv::new());
        let mut store = store(kv.clone());
        let mut generator = generator();
        let now = Utc::now();

        let mut state = store.get("erin", now, &mut generator).unwrap().clone();
        state.best_streak = 9;
        store.save("erin", state).unwrap();
        assert_eq!(store.cached("erin").unwrap().best_streak, 9);

        let bytes = kv.read("erin", STATE_KEY).unwrap().unwrap();
        let stored: SessionQuestState = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(stored.best_streak, 9);
    }
}
