//! Encounter Lifecycle Engine
//!
//! Drives an encounter through pending → spawned → complete and owns every
//! resource spawned for it. All operations are idempotent; world failures
//! are logged and left for the next reconciliation pass.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use rand::prelude::*;
use rand::rngs::StdRng;
use tracing::{debug, info, warn};

use super::state::{
    ENCOUNTER_MARKER, EncounterPhase, SpawnRecord, quest_id_from_tags, quest_tag,
};
use super::zone::{BlockPos, find_spawn_anchor};
use crate::config::ZoneConfig;
use crate::quest::AcceptedQuest;
use crate::world::{ResourceDeath, ResourceHandle, WorldHost};

// ============================================================================
// Resource Index
// ============================================================================

/// Handle → owning quest, with the reverse lookup kept in step
#[derive(Debug, Default)]
pub struct ResourceIndex {
    by_handle: HashMap<ResourceHandle, String>,
    by_quest: HashMap<String, BTreeSet<ResourceHandle>>,
}

impl ResourceIndex {
    pub fn insert(&mut self, handle: ResourceHandle, quest_id: &str) {
        if let Some(previous) = self.by_handle.insert(handle, quest_id.to_string()) {
            self.detach(&previous, handle);
        }
        self.by_quest
            .entry(quest_id.to_string())
            .or_default()
            .insert(handle);
    }

    pub fn remove(&mut self, handle: ResourceHandle) -> Option<String> {
        let quest_id = self.by_handle.remove(&handle)?;
        self.detach(&quest_id, handle);
        Some(quest_id)
    }

    fn detach(&mut self, quest_id: &str, handle: ResourceHandle) {
        if let Some(handles) = self.by_quest.get_mut(quest_id) {
            handles.remove(&handle);
            if handles.is_empty() {
                self.by_quest.remove(quest_id);
            }
        }
    }

    pub fn quest_of(&self, handle: ResourceHandle) -> Option<&str> {
        self.by_handle.get(&handle).map(String::as_str)
    }

    pub fn handles_for(&self, quest_id: &str) -> Vec<ResourceHandle> {
        self.by_quest
            .get(quest_id)
            .map(|h| h.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_handle.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_handle.clear();
        self.by_quest.clear();
    }
}

// ============================================================================
// Outcomes
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneEntry {
    /// Resources were spawned; `spawned < requested` means some spawns
    /// failed and will be repaired by reconciliation
    Spawned { requested: u32, spawned: u32 },
    /// The encounter has already left the pending phase
    NotPending(EncounterPhase),
    /// No zone is stored for the encounter
    NoZone,
    NotEncounter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillProgress {
    Progressed { progress: u32, total: u32 },
    Completed { total: u32 },
    /// Not a tracked resource of a spawned encounter
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Respawned { count: u32 },
    Completed,
    Unchanged,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub alive: u32,
    pub spawned: u32,
    /// Handles dropped because their resource vanished
    pub pruned: u32,
    /// Surplus or untracked duplicates removed
    pub despawned: u32,
    pub completed: bool,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        self.spawned > 0 || self.pruned > 0 || self.despawned > 0 || self.completed
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct EncounterEngine {
    index: ResourceIndex,
    /// quest id → owning actor
    owners: HashMap<String, String>,
    /// Resources whose despawn failed, with the quest they belonged to.
    /// Retried until they are gone.
    pending_despawn: BTreeMap<ResourceHandle, String>,
    spread: i32,
    anchor_attempts: u32,
    rng: StdRng,
}

impl EncounterEngine {
    pub fn new(config: &ZoneConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    pub fn with_seed(config: &ZoneConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &ZoneConfig, rng: StdRng) -> Self {
        Self {
            index: ResourceIndex::default(),
            owners: HashMap::new(),
            pending_despawn: BTreeMap::new(),
            spread: config.spawn_spread.max(0),
            anchor_attempts: config.max_attempts,
            rng,
        }
    }

    pub fn index(&self) -> &ResourceIndex {
        &self.index
    }

    pub fn register_owner(&mut self, quest_id: &str, actor_id: &str) {
        self.owners.insert(quest_id.to_string(), actor_id.to_string());
    }

    pub fn release_owner(&mut self, quest_id: &str) {
        self.owners.remove(quest_id);
    }

    pub fn owner_of(&self, quest_id: &str) -> Option<&str> {
        self.owners.get(quest_id).map(String::as_str)
    }

    pub fn pending_despawns(&self) -> usize {
        self.pending_despawn.len()
    }

    /// Drop a resource from the index, e.g. after a death nobody claimed
    pub fn forget_resource(&mut self, handle: ResourceHandle) {
        self.index.remove(handle);
    }

    /// Resolve the quest a dead resource belonged to, preferring the index
    /// over the labels carried by the notification
    pub fn attribute(&self, death: &ResourceDeath) -> Option<String> {
        self.index
            .quest_of(death.handle)
            .or_else(|| quest_id_from_tags(&death.tags))
            .map(str::to_string)
    }

    /// Rebuild the index from the world's tagged resources. Run at startup.
    pub fn rebuild_index<W: WorldHost + ?Sized>(&mut self, world: &W) -> usize {
        self.index.clear();
        for handle in world.list_by_tag(ENCOUNTER_MARKER) {
            if let Some(quest_id) = quest_id_from_tags(&world.tags(handle)) {
                self.index.insert(handle, quest_id);
            }
        }
        info!("Rebuilt encounter resource index: {} resources", self.index.len());
        self.index.len()
    }

    /// pending → spawned
    pub fn on_zone_entered<W: WorldHost + ?Sized>(
        &mut self,
        quest: &mut AcceptedQuest,
        world: &mut W,
    ) -> ZoneEntry {
        let remaining = quest.remaining();
        let Some(encounter) = quest.encounter.as_ref() else {
            return ZoneEntry::NotEncounter;
        };
        if encounter.phase != EncounterPhase::Pending {
            return ZoneEntry::NotPending(encounter.phase);
        }
        let Some(zone) = encounter.zone.clone() else {
            return ZoneEntry::NoZone;
        };
        let quest_id = encounter.quest_id.clone();
        let mob_kind = encounter.mob_kind.clone();

        let anchor = find_spawn_anchor(&*world, &zone, self.anchor_attempts, &mut self.rng);
        let handles = self.spawn_batch(&quest_id, &mob_kind, anchor, &zone.dimension, remaining, world);
        let spawned = handles.len() as u32;

        if let Some(encounter) = quest.encounter.as_mut() {
            encounter.spawn = Some(SpawnRecord {
                dimension: zone.dimension.clone(),
                anchor,
                handles,
            });
            encounter.phase = EncounterPhase::Spawned;
        }

        info!(
            "Encounter {} spawned {}/{} {} at {} in {}",
            quest_id, spawned, remaining, mob_kind, anchor, zone.dimension
        );

        if remaining == 0 {
            self.complete(quest, world);
        }
        ZoneEntry::Spawned {
            requested: remaining,
            spawned,
        }
    }

    /// Count a confirmed kill of one of the quest's resources
    pub fn record_kill<W: WorldHost + ?Sized>(
        &mut self,
        quest: &mut AcceptedQuest,
        handle: ResourceHandle,
        world: &mut W,
    ) -> KillProgress {
        let tracked = quest
            .encounter
            .as_ref()
            .is_some_and(|e| e.is_spawned() && e.handles().contains(&handle));
        if !tracked {
            return KillProgress::Ignored;
        }

        if let Some(spawn) = quest.encounter.as_mut().and_then(|e| e.spawn.as_mut()) {
            spawn.handles.retain(|h| *h != handle);
        }
        self.index.remove(handle);
        quest.add_progress(1);

        let total = quest.required_count();
        if quest.is_complete() {
            self.complete(quest, world);
            KillProgress::Completed { total }
        } else {
            KillProgress::Progressed {
                progress: quest.progress,
                total,
            }
        }
    }

    /// spawned → complete. Despawns anything still alive for the quest.
    fn complete<W: WorldHost + ?Sized>(&mut self, quest: &mut AcceptedQuest, world: &mut W) {
        let Some(encounter) = quest.encounter.as_mut() else {
            return;
        };
        let quest_id = encounter.quest_id.clone();
        let known = encounter.handles().to_vec();
        encounter.phase = EncounterPhase::Complete;
        if let Some(spawn) = encounter.spawn.as_mut() {
            spawn.handles.clear();
        }

        let removed = self.despawn_quest_resources(&quest_id, &known, world);
        info!("Encounter {} complete, despawned {} survivors", quest_id, removed);
    }

    /// Despawn every live resource of a spawned encounter and clear its
    /// handle list. The encounter stays spawned so reconnect can respawn.
    pub fn on_disconnect<W: WorldHost + ?Sized>(&mut self, quest: &mut AcceptedQuest, world: &mut W) -> u32 {
        let Some(encounter) = quest.encounter.as_mut() else {
            return 0;
        };
        if !encounter.is_spawned() {
            return 0;
        }
        let quest_id = encounter.quest_id.clone();
        let known = encounter.handles().to_vec();
        if let Some(spawn) = encounter.spawn.as_mut() {
            spawn.handles.clear();
        }

        let removed = self.despawn_quest_resources(&quest_id, &known, world);
        debug!("Encounter {} suspended, despawned {}", quest_id, removed);
        removed
    }

    /// Respawn the remaining resources of a spawned encounter at its anchor
    pub fn on_reconnect<W: WorldHost + ?Sized>(
        &mut self,
        quest: &mut AcceptedQuest,
        world: &mut W,
    ) -> ReconnectOutcome {
        let remaining = quest.remaining();
        let Some(encounter) = quest.encounter.as_mut() else {
            return ReconnectOutcome::Unchanged;
        };
        if encounter.normalize() || !encounter.is_spawned() {
            return ReconnectOutcome::Unchanged;
        }
        if remaining == 0 {
            self.complete(quest, world);
            return ReconnectOutcome::Completed;
        }

        let quest_id = encounter.quest_id.clone();
        let mob_kind = encounter.mob_kind.clone();
        let known = encounter.handles().to_vec();
        let Some((anchor, dimension)) = encounter
            .spawn
            .as_ref()
            .map(|s| (s.anchor, s.dimension.clone()))
        else {
            return ReconnectOutcome::Unchanged;
        };

        // Anything left over from before (e.g. after a crash) is replaced
        self.despawn_quest_resources(&quest_id, &known, world);
        let handles = self.spawn_batch(&quest_id, &mob_kind, anchor, &dimension, remaining, world);
        let count = handles.len() as u32;

        if let Some(spawn) = quest.encounter.as_mut().and_then(|e| e.spawn.as_mut()) {
            spawn.handles = handles;
        }
        info!("Encounter {} resumed with {}/{} {}", quest_id, count, remaining, mob_kind);
        ReconnectOutcome::Respawned { count }
    }

    /// Bring the live resources of a spawned encounter back in line with
    /// its remaining count without disturbing survivors
    pub fn reconcile<W: WorldHost + ?Sized>(
        &mut self,
        quest: &mut AcceptedQuest,
        world: &mut W,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let remaining = quest.remaining();
        let Some(encounter) = quest.encounter.as_ref() else {
            return report;
        };
        if !encounter.is_spawned() {
            return report;
        }
        if remaining == 0 {
            self.complete(quest, world);
            report.completed = true;
            return report;
        }
        let Some(spawn) = encounter.spawn.as_ref() else {
            return report;
        };

        let quest_id = encounter.quest_id.clone();
        let mob_kind = encounter.mob_kind.clone();
        let anchor = spawn.anchor;
        let dimension = spawn.dimension.clone();

        let mut alive = Vec::new();
        for handle in spawn.handles.iter().copied() {
            if world.is_alive(handle) {
                alive.push(handle);
            } else {
                self.index.remove(handle);
                report.pruned += 1;
            }
        }

        // Tagged for this quest but not tracked: duplicates from a failed
        // despawn or an earlier process
        for handle in world.list_by_tag(&quest_tag(&quest_id)) {
            if alive.contains(&handle) {
                continue;
            }
            match world.despawn(handle) {
                Ok(()) => {
                    self.index.remove(handle);
                    report.despawned += 1;
                }
                Err(e) => {
                    warn!("Failed to despawn stray {} of {}: {}", handle, quest_id, e);
                    self.defer_despawn(handle, &quest_id);
                }
            }
        }

        if alive.len() > remaining as usize {
            for handle in alive.split_off(remaining as usize) {
                match world.despawn(handle) {
                    Ok(()) => {
                        self.index.remove(handle);
                        report.despawned += 1;
                    }
                    Err(e) => {
                        warn!("Failed to despawn surplus {} of {}: {}", handle, quest_id, e);
                        alive.push(handle);
                    }
                }
            }
        }

        let deficit = remaining.saturating_sub(alive.len() as u32);
        if deficit > 0 {
            let fresh = self.spawn_batch(&quest_id, &mob_kind, anchor, &dimension, deficit, world);
            report.spawned = fresh.len() as u32;
            alive.extend(fresh);
        }
        report.alive = alive.len() as u32;

        if report.changed() {
            info!(
                "Reconciled encounter {}: {} alive, {} spawned, {} pruned, {} despawned",
                quest_id, report.alive, report.spawned, report.pruned, report.despawned
            );
        }
        if let Some(spawn) = quest.encounter.as_mut().and_then(|e| e.spawn.as_mut()) {
            spawn.handles = alive;
        }
        report
    }

    /// Remove every resource of a quest, whatever its phase. Used when the
    /// quest is abandoned or redeemed.
    pub fn release<W: WorldHost + ?Sized>(&mut self, quest: &mut AcceptedQuest, world: &mut W) -> u32 {
        let quest_id = quest.id().to_string();
        let known = quest
            .encounter
            .as_ref()
            .map(|e| e.handles().to_vec())
            .unwrap_or_default();
        if let Some(spawn) = quest.encounter.as_mut().and_then(|e| e.spawn.as_mut()) {
            spawn.handles.clear();
        }
        self.release_owner(&quest_id);
        self.despawn_quest_resources(&quest_id, &known, world)
    }

    /// Despawn every encounter resource whose quest is not in `claimed`.
    /// `claimed` holds the quest ids of online actors' spawned encounters.
    pub fn cleanup_orphans<W: WorldHost + ?Sized>(
        &mut self,
        claimed: &HashSet<String>,
        world: &mut W,
    ) -> u32 {
        let mut removed = 0;
        for handle in world.list_by_tag(ENCOUNTER_MARKER) {
            let quest_id = self
                .index
                .quest_of(handle)
                .map(str::to_string)
                .or_else(|| quest_id_from_tags(&world.tags(handle)).map(str::to_string));

            let orphaned = match &quest_id {
                Some(id) => !claimed.contains(id),
                None => true,
            };
            if !orphaned {
                continue;
            }

            match world.despawn(handle) {
                Ok(()) => {
                    self.index.remove(handle);
                    removed += 1;
                    info!(
                        "Despawned orphaned encounter resource {} (quest {})",
                        handle,
                        quest_id.as_deref().unwrap_or("unknown")
                    );
                }
                Err(e) => {
                    warn!("Failed to despawn orphan {}: {}", handle, e);
                    self.defer_despawn(handle, quest_id.as_deref().unwrap_or("unknown"));
                }
            }
        }
        removed
    }

    fn spawn_batch<W: WorldHost + ?Sized>(
        &mut self,
        quest_id: &str,
        kind: &str,
        anchor: BlockPos,
        dimension: &str,
        count: u32,
        world: &mut W,
    ) -> Vec<ResourceHandle> {
        let mut handles = Vec::with_capacity(count as usize);
        let label = quest_tag(quest_id);

        for _ in 0..count {
            let at = if self.spread > 0 {
                anchor.offset(
                    self.rng.gen_range(-self.spread..=self.spread),
                    0,
                    self.rng.gen_range(-self.spread..=self.spread),
                )
            } else {
                anchor
            };

            let handle = match world.spawn(kind, at, dimension) {
                Ok(handle) => handle,
                Err(e) => {
                    warn!("Spawn for encounter {} failed, retrying on reconcile: {}", quest_id, e);
                    continue;
                }
            };

            let tagged = world
                .tag(handle, ENCOUNTER_MARKER)
                .and_then(|_| world.tag(handle, &label));
            if let Err(e) = tagged {
                // An untagged resource could never be attributed or cleaned up
                warn!("Failed to tag {} for encounter {}: {}", handle, quest_id, e);
                if let Err(e) = world.despawn(handle) {
                    warn!("Failed to despawn untagged {}: {}", handle, e);
                    self.defer_despawn(handle, quest_id);
                }
                continue;
            }

            self.index.insert(handle, quest_id);
            handles.push(handle);
        }
        handles
    }

    fn despawn_quest_resources<W: WorldHost + ?Sized>(
        &mut self,
        quest_id: &str,
        known: &[ResourceHandle],
        world: &mut W,
    ) -> u32 {
        let mut targets: BTreeSet<ResourceHandle> = known.iter().copied().collect();
        targets.extend(self.index.handles_for(quest_id));
        targets.extend(world.list_by_tag(&quest_tag(quest_id)));

        let mut removed = 0;
        for handle in targets {
            if !world.is_alive(handle) {
                self.index.remove(handle);
                continue;
            }
            match world.despawn(handle) {
                Ok(()) => {
                    self.index.remove(handle);
                    removed += 1;
                }
                Err(e) => {
                    warn!("Failed to despawn {} of {}: {}", handle, quest_id, e);
                    self.defer_despawn(handle, quest_id);
                }
            }
        }
        removed
    }

    fn defer_despawn(&mut self, handle: ResourceHandle, quest_id: &str) {
        self.pending_despawn.insert(handle, quest_id.to_string());
    }

    /// Retry every despawn that failed earlier. Resources that disappeared
    /// in the meantime are dropped from the queue. Returns how many were
    /// despawned by this pass.
    pub fn retry_pending_despawns<W: WorldHost + ?Sized>(&mut self, world: &mut W) -> u32 {
        if self.pending_despawn.is_empty() {
            return 0;
        }

        let mut removed = 0;
        let pending = std::mem::take(&mut self.pending_despawn);
        for (handle, quest_id) in pending {
            if !world.is_alive(handle) {
                self.index.remove(handle);
                continue;
            }
            match world.despawn(handle) {
                Ok(()) => {
                    self.index.remove(handle);
                    removed += 1;
                }
                Err(e) => {
                    debug!("Despawn of {} ({}) still failing: {}", handle, quest_id, e);
                    self.pending_despawn.insert(handle, quest_id);
                }
            }
        }
        if removed > 0 {
            info!(
                "Despawned {} resources left over from failed despawns ({} still pending)",
                removed,
                self.pending_despawn.len()
            );
        }
        removed
    }
}
