//! Quest Service
//!
//! The entry point an event dispatcher calls into. Every handler is
//! synchronous: fetch the actor's state through the store, mutate it,
//! save it. Delayed work is left to `tick`.

use std::collections::{HashMap, HashSet};

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::QuestConfig;
use crate::encounter::{
    BlockPos, EncounterEngine, EncounterPhase, EncounterRuntimeState, KillProgress,
    ReconcileReport, ZoneEntry, select_zone,
};
use crate::error::Rejection;
use crate::quest::{
    AcceptedQuest, ItemReward, Objective, ObjectiveKind, Persistence, QuestGenerator, QuestPool,
    KvWallet, RewardOutcome, SessionQuestState, SessionQuestStore, Wallet, completion_reward,
    reroll_price,
};
use crate::scheduler::{Clock, DamageLedger, Debounce, Duty, TickScheduler};
use crate::world::{ResourceDeath, ResourceHandle, WorldHost};

// ============================================================================
// Results
// ============================================================================

/// Persisted state handed back to callers for rendering
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuestSnapshot {
    pub actor: String,
    pub state: SessionQuestState,
    pub balance: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RerollOutcome {
    pub snapshot: QuestSnapshot,
    /// 0 when the free reroll was used
    pub price: u64,
    pub free: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RedeemOutcome {
    pub snapshot: QuestSnapshot,
    pub reward: RewardOutcome,
    /// Items for the host to grant
    pub items: Vec<ItemReward>,
    pub free_reroll_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum KillOutcome {
    Counted {
        actor: String,
        quest_id: String,
        progress: u32,
        total: u32,
        completed: bool,
        /// Last actor to damage the resource, for notification only
        credited_to: Option<String>,
    },
    /// Owned by a quest, but no online owner claims the kill
    Dropped { quest_id: String },
    /// Not an encounter resource
    Untracked,
}

/// Progress events for standard objectives
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObjectiveEvent {
    EntityKilled { kind: String },
    BlockMined { block: String },
    ItemGathered { item: String, count: u32 },
}

impl ObjectiveEvent {
    fn kind(&self) -> ObjectiveKind {
        match self {
            ObjectiveEvent::EntityKilled { .. } => ObjectiveKind::Kill,
            ObjectiveEvent::BlockMined { .. } => ObjectiveKind::Mine,
            ObjectiveEvent::ItemGathered { .. } => ObjectiveKind::Gather,
        }
    }

    fn target(&self) -> &str {
        match self {
            ObjectiveEvent::EntityKilled { kind } => kind,
            ObjectiveEvent::BlockMined { block } => block,
            ObjectiveEvent::ItemGathered { item, .. } => item,
        }
    }

    fn amount(&self) -> u32 {
        match self {
            ObjectiveEvent::ItemGathered { count, .. } => *count,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub tick: u64,
    pub reconciled: usize,
    pub orphans_removed: u32,
    /// Resources removed by retrying earlier failed despawns
    pub despawns_retried: u32,
    pub stale_removed: usize,
}

/// Last known position of an online actor
#[derive(Debug, Clone, PartialEq, Eq)]
struct Presence {
    pos: BlockPos,
    dimension: String,
}

// ============================================================================
// Service
// ============================================================================

pub struct QuestService<P, W>
where
    P: Persistence + Clone,
    W: WorldHost,
{
    config: QuestConfig,
    store: SessionQuestStore<P>,
    wallet: KvWallet<P>,
    generator: QuestGenerator,
    engine: EncounterEngine,
    world: W,
    scheduler: TickScheduler,
    presence: HashMap<String, Presence>,
    damage: DamageLedger,
    zone_debounce: Debounce<String>,
    clock: Box<dyn Clock>,
    rng: StdRng,
}

impl<P, W> QuestService<P, W>
where
    P: Persistence + Clone,
    W: WorldHost,
{
    pub fn new(config: QuestConfig, pool: QuestPool, persistence: P, world: W, clock: Box<dyn Clock>) -> Self {
        let generator = QuestGenerator::new(pool, config.generator.clone());
        let engine = EncounterEngine::new(&config.zone);
        Self::assemble(config, generator, engine, persistence, world, clock, StdRng::from_entropy())
    }

    /// Deterministic variant for tests and replays
    pub fn with_seed(
        config: QuestConfig,
        pool: QuestPool,
        persistence: P,
        world: W,
        clock: Box<dyn Clock>,
        seed: u64,
    ) -> Self {
        let generator = QuestGenerator::with_seed(pool, config.generator.clone(), seed);
        let engine = EncounterEngine::with_seed(&config.zone, seed.wrapping_add(1));
        let rng = StdRng::seed_from_u64(seed.wrapping_add(2));
        Self::assemble(config, generator, engine, persistence, world, clock, rng)
    }

    fn assemble(
        config: QuestConfig,
        generator: QuestGenerator,
        engine: EncounterEngine,
        persistence: P,
        world: W,
        clock: Box<dyn Clock>,
        rng: StdRng,
    ) -> Self {
        Self {
            store: SessionQuestStore::new(persistence.clone(), config.cycle.clone()),
            wallet: KvWallet::new(persistence),
            scheduler: TickScheduler::new(&config.scheduler),
            zone_debounce: Debounce::new(config.scheduler.zone_entry_debounce_ticks),
            presence: HashMap::new(),
            damage: DamageLedger::new(),
            generator,
            engine,
            world,
            clock,
            rng,
            config,
        }
    }

    pub fn config(&self) -> &QuestConfig {
        &self.config
    }

    pub fn world(&self) -> &W {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut W {
        &mut self.world
    }

    pub fn engine(&self) -> &EncounterEngine {
        &self.engine
    }

    pub fn wallet_mut(&mut self) -> &mut KvWallet<P> {
        &mut self.wallet
    }

    pub fn current_tick(&self) -> u64 {
        self.scheduler.current_tick()
    }

    pub fn online_actors(&self) -> Vec<String> {
        self.store.cached_actors()
    }

    /// Rebuild the resource index from the world. Call once before any
    /// actor connects.
    pub fn start(&mut self) -> usize {
        let indexed = self.engine.rebuild_index(&self.world);
        info!("Quest service started with {} tracked encounter resources", indexed);
        indexed
    }

    /// Swap the generator's pool. Accepted quests keep their own copies.
    pub fn replace_pool(&mut self, pool: QuestPool) {
        self.generator.replace_pool(pool);
        info!("Quest pool replaced");
    }

    // ------------------------------------------------------------------------
    // Actor lifecycle
    // ------------------------------------------------------------------------

    pub fn on_actor_reconnected(&mut self, actor_id: &str) -> Result<QuestSnapshot, Rejection> {
        self.load(actor_id)?;
        let state = cached(&mut self.store, actor_id)?;

        if let Some(quest) = state.active.as_mut() {
            if let Some(encounter) = quest.encounter.as_mut() {
                if encounter.zone.is_none() && encounter.phase == EncounterPhase::Pending {
                    let zone = select_zone(&self.world, &self.config.zone, &mut self.rng);
                    warn!(
                        "Encounter {} for {} had no zone, selected {} r{}",
                        encounter.quest_id, actor_id, zone.center, zone.radius
                    );
                    encounter.zone = Some(zone);
                }
                self.engine.register_owner(&encounter.quest_id, actor_id);
            }
            let outcome = self.engine.on_reconnect(quest, &mut self.world);
            debug!("Reconnect of {}: {:?}", actor_id, outcome);
        }

        info!("Actor {} connected", actor_id);
        self.persist(actor_id);
        self.snapshot_of(actor_id)
    }

    /// Despawn the actor's resources, persist, then evict. Must run
    /// completely inside the disconnect handler.
    pub fn on_actor_disconnected(&mut self, actor_id: &str) -> Result<QuestSnapshot, Rejection> {
        self.load(actor_id)?;
        let state = cached(&mut self.store, actor_id)?;

        if let Some(quest) = state.active.as_mut() {
            let removed = self.engine.on_disconnect(quest, &mut self.world);
            if removed > 0 {
                info!("Despawned {} encounter resources for departing {}", removed, actor_id);
            }
            self.engine.release_owner(quest.id());
        }

        self.persist(actor_id);
        let snapshot = self.snapshot_of(actor_id);
        self.store.evict(actor_id);
        self.presence.remove(actor_id);
        self.zone_debounce.forget(&actor_id.to_string());
        info!("Actor {} disconnected", actor_id);
        snapshot
    }

    /// Disconnect everyone; used on shutdown
    pub fn disconnect_all(&mut self) -> usize {
        let actors = self.store.cached_actors();
        for actor_id in &actors {
            if let Err(e) = self.on_actor_disconnected(actor_id) {
                warn!("Failed to disconnect {} cleanly: {}", actor_id, e);
            }
        }
        actors.len()
    }

    pub fn snapshot(&mut self, actor_id: &str) -> Result<QuestSnapshot, Rejection> {
        self.load(actor_id)?;
        self.snapshot_of(actor_id)
    }

    // ------------------------------------------------------------------------
    // UI requests
    // ------------------------------------------------------------------------

    pub fn accept_slot(&mut self, actor_id: &str, index: usize) -> Result<QuestSnapshot, Rejection> {
        self.load(actor_id)?;
        let now = self.clock.now();
        let state = cached(&mut self.store, actor_id)?;

        if state.active.is_some() {
            return Err(Rejection::QuestAlreadyActive);
        }
        let slot = state.slots.get_mut(index).ok_or(Rejection::InvalidSlot { index })?;
        let definition = slot.take().ok_or(Rejection::EmptySlot { index })?;

        let mut quest = AcceptedQuest::new(definition, now);
        if let Objective::Encounter { mob_kind, mob_count } = &quest.definition.objective {
            let zone = select_zone(&self.world, &self.config.zone, &mut self.rng);
            info!(
                "Encounter {} for {}: zone {} r{} in {}",
                quest.id(),
                actor_id,
                zone.center,
                zone.radius,
                zone.dimension
            );
            quest.encounter = Some(EncounterRuntimeState::new(quest.id(), mob_kind, *mob_count, zone));
            self.engine.register_owner(quest.id(), actor_id);
        }

        info!("Actor {} accepted quest {} ({})", actor_id, quest.definition.title, quest.id());
        state.active = Some(quest);
        self.persist(actor_id);
        self.snapshot_of(actor_id)
    }

    pub fn abandon_active(&mut self, actor_id: &str) -> Result<QuestSnapshot, Rejection> {
        self.load(actor_id)?;
        let state = cached(&mut self.store, actor_id)?;

        let mut quest = state.active.take().ok_or(Rejection::NoActiveQuest)?;
        state.streak = 0;
        let removed = self.engine.release(&mut quest, &mut self.world);

        info!(
            "Actor {} abandoned quest {} ({} resources despawned)",
            actor_id,
            quest.id(),
            removed
        );
        self.persist(actor_id);
        self.snapshot_of(actor_id)
    }

    /// Replace every slot. Uses the free reroll if held, otherwise charges
    /// the escalating price.
    pub fn reroll(&mut self, actor_id: &str) -> Result<RerollOutcome, Rejection> {
        self.load(actor_id)?;
        let state = cached(&mut self.store, actor_id)?;

        let (price, free) = if state.free_reroll {
            state.free_reroll = false;
            (0, true)
        } else {
            let price = reroll_price(state.paid_rerolls, self.config.economy.reroll_base_price);
            let paid = self.wallet.withdraw(actor_id, price).map_err(|e| {
                warn!("Wallet unavailable for {}: {}", actor_id, e);
                Rejection::StoreUnavailable
            })?;
            if !paid {
                let balance = self.wallet.balance(actor_id).unwrap_or(0);
                return Err(Rejection::InsufficientFunds { price, balance });
            }
            state.paid_rerolls += 1;
            (price, false)
        };

        state.slots = self.generator.generate_slots(self.config.cycle.slot_count);
        info!(
            "Actor {} rerolled quests ({})",
            actor_id,
            if free { "free".to_string() } else { format!("{} SP", price) }
        );

        self.persist(actor_id);
        Ok(RerollOutcome {
            snapshot: self.snapshot_of(actor_id)?,
            price,
            free,
        })
    }

    /// Pay out a completed active quest and clear it
    pub fn redeem_active(&mut self, actor_id: &str) -> Result<RedeemOutcome, Rejection> {
        self.load(actor_id)?;
        let state = cached(&mut self.store, actor_id)?;

        let quest = state.active.as_ref().ok_or(Rejection::NoActiveQuest)?;
        if !quest.is_complete() {
            return Err(Rejection::NotComplete {
                progress: quest.progress,
                required: quest.required_count(),
            });
        }

        let reward = completion_reward(
            quest.definition.reward.currency,
            quest.definition.rarity,
            state.streak,
            state.completions_this_cycle == 0,
            &self.config.economy,
            &mut self.rng,
        );
        self.wallet.deposit(actor_id, reward.amount).map_err(|e| {
            warn!("Wallet unavailable for {}: {}", actor_id, e);
            Rejection::StoreUnavailable
        })?;

        let mut quest = state.active.take().ok_or(Rejection::NoActiveQuest)?;
        state.record_completion();
        let free_reroll_granted = state.grant_milestone_reroll(self.config.economy.free_reroll_milestone);
        self.engine.release(&mut quest, &mut self.world);

        info!(
            "Actor {} redeemed {} for {} SP{}{}",
            actor_id,
            quest.id(),
            reward.amount,
            if reward.first_of_day { " (first of day)" } else { "" },
            if reward.jackpot { " (jackpot)" } else { "" }
        );

        self.persist(actor_id);
        Ok(RedeemOutcome {
            snapshot: self.snapshot_of(actor_id)?,
            reward,
            items: quest.definition.reward.items,
            free_reroll_granted,
        })
    }

    // ------------------------------------------------------------------------
    // World events
    // ------------------------------------------------------------------------

    /// Attribute a resource death to its quest and count it. Attribution is
    /// by ownership, not by who dealt the final blow.
    pub fn on_resource_killed(&mut self, death: ResourceDeath) -> KillOutcome {
        let credited_to = self.damage.take(death.handle);
        let Some(quest_id) = self.engine.attribute(&death) else {
            return KillOutcome::Untracked;
        };

        let Some(actor_id) = self.engine.owner_of(&quest_id).map(str::to_string) else {
            debug!("Dropping kill of {} for unowned quest {}", death.handle, quest_id);
            self.engine.forget_resource(death.handle);
            return KillOutcome::Dropped { quest_id };
        };
        let Some(quest) = self
            .store
            .cached_mut(&actor_id)
            .and_then(|state| state.active.as_mut())
            .filter(|quest| quest.id() == quest_id)
        else {
            debug!("Dropping kill of {}: {} no longer holds quest {}", death.handle, actor_id, quest_id);
            self.engine.forget_resource(death.handle);
            return KillOutcome::Dropped { quest_id };
        };

        let (progress, total, completed) = match self.engine.record_kill(quest, death.handle, &mut self.world) {
            KillProgress::Progressed { progress, total } => (progress, total, false),
            KillProgress::Completed { total } => (total, total, true),
            KillProgress::Ignored => {
                self.engine.forget_resource(death.handle);
                return KillOutcome::Dropped { quest_id };
            }
        };

        if completed {
            info!("Actor {} completed encounter {}", actor_id, quest_id);
        }
        self.persist(&actor_id);
        KillOutcome::Counted {
            actor: actor_id,
            quest_id,
            progress,
            total,
            completed,
            credited_to,
        }
    }

    pub fn on_resource_damaged(&mut self, handle: ResourceHandle, actor_id: &str) {
        let tick = self.scheduler.current_tick();
        self.damage.record(handle, actor_id, tick);
    }

    /// The actor reached their encounter zone
    pub fn on_zone_entered(&mut self, actor_id: &str) -> Result<QuestSnapshot, Rejection> {
        self.load(actor_id)?;
        let state = cached(&mut self.store, actor_id)?;
        let quest = state.active.as_mut().ok_or(Rejection::NoActiveQuest)?;

        match self.engine.on_zone_entered(quest, &mut self.world) {
            ZoneEntry::NoZone => warn!("Encounter for {} has no zone to enter", actor_id),
            entry => debug!("Zone entry for {}: {:?}", actor_id, entry),
        }

        self.persist(actor_id);
        self.snapshot_of(actor_id)
    }

    /// Position sample from the host. Triggers zone entry when an online
    /// actor with a pending encounter stands inside its zone.
    pub fn on_actor_position(&mut self, actor_id: &str, pos: BlockPos, dimension: &str) -> Option<ZoneEntry> {
        // Only connected actors are tracked; disconnect clears the entry
        if !self.store.is_cached(actor_id) {
            return None;
        }
        self.presence.insert(
            actor_id.to_string(),
            Presence {
                pos,
                dimension: dimension.to_string(),
            },
        );

        let quest = self.store.cached_mut(actor_id)?.active.as_mut()?;
        let encounter = quest.encounter.as_ref()?;
        if encounter.phase != EncounterPhase::Pending {
            return None;
        }
        if !encounter.zone.as_ref()?.contains(&pos, dimension) {
            return None;
        }
        let tick = self.scheduler.current_tick();
        if !self.zone_debounce.allow(actor_id.to_string(), tick) {
            return None;
        }

        let entry = self.engine.on_zone_entered(quest, &mut self.world);
        self.persist(actor_id);
        Some(entry)
    }

    /// Advance a standard objective. Returns the new progress if the active
    /// quest accepted the event.
    pub fn on_objective_event(&mut self, actor_id: &str, event: &ObjectiveEvent) -> Result<Option<u32>, Rejection> {
        self.load(actor_id)?;
        let state = cached(&mut self.store, actor_id)?;
        let Some(quest) = state.active.as_mut() else {
            return Ok(None);
        };
        if !quest.accepts_target(event.kind(), event.target()) || quest.is_complete() {
            return Ok(None);
        }

        if quest.add_progress(event.amount()) {
            info!("Actor {} completed quest {}", actor_id, quest.id());
        }
        let progress = quest.progress;
        self.persist(actor_id);
        Ok(Some(progress))
    }

    // ------------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------------

    pub fn tick(&mut self) -> TickReport {
        let duties = self.scheduler.advance();
        let mut report = TickReport {
            tick: self.scheduler.current_tick(),
            ..TickReport::default()
        };

        for duty in duties {
            match duty {
                Duty::Reconcile => {
                    report.despawns_retried = self.engine.retry_pending_despawns(&mut self.world);
                    report.reconciled = self.reconcile_nearby();
                }
                Duty::OrphanCleanup => report.orphans_removed = self.cleanup_orphans(),
                Duty::StaleSweep => {
                    report.stale_removed = self
                        .damage
                        .sweep(report.tick, self.config.scheduler.damage_max_age_ticks);
                    self.zone_debounce.sweep(report.tick);
                }
            }
        }
        report
    }

    /// Reconcile encounters of online actors standing near their anchor
    fn reconcile_nearby(&mut self) -> usize {
        let max = self.config.scheduler.reconcile_max_distance as i64;
        let mut reconciled = 0;

        for actor_id in self.store.cached_actors() {
            let Some(presence) = self.presence.get(&actor_id) else {
                continue;
            };
            let Some(quest) = self.store.cached_mut(&actor_id).and_then(|s| s.active.as_mut()) else {
                continue;
            };
            let Some(spawn) = quest
                .encounter
                .as_ref()
                .filter(|e| e.is_spawned())
                .and_then(|e| e.spawn.as_ref())
            else {
                continue;
            };
            if spawn.dimension != presence.dimension
                || spawn.anchor.horizontal_distance_sq(&presence.pos) > max.saturating_mul(max)
            {
                continue;
            }

            let report = self.engine.reconcile(quest, &mut self.world);
            reconciled += 1;
            if report.changed() {
                self.persist(&actor_id);
            }
        }
        reconciled
    }

    /// Reconcile one actor's encounter regardless of distance
    pub fn reconcile_actor(&mut self, actor_id: &str) -> Option<ReconcileReport> {
        let quest = self.store.cached_mut(actor_id)?.active.as_mut()?;
        let report = self.engine.reconcile(quest, &mut self.world);
        if report.changed() {
            self.persist(actor_id);
        }
        Some(report)
    }

    /// Despawn encounter resources no online actor claims as spawned
    pub fn cleanup_orphans(&mut self) -> u32 {
        let claimed: HashSet<String> = self
            .store
            .cached_actors()
            .iter()
            .filter_map(|actor| self.store.cached(actor))
            .filter_map(|state| state.spawned_encounter().map(str::to_string))
            .collect();

        let removed = self.engine.cleanup_orphans(&claimed, &mut self.world);
        if removed > 0 {
            info!("Orphan cleanup removed {} resources", removed);
        }
        removed
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Bring the actor's state into the cache, releasing resources of any
    /// quest a cycle rollover dropped
    fn load(&mut self, actor_id: &str) -> Result<(), Rejection> {
        let now = self.clock.now();
        if let Err(e) = self.store.get(actor_id, now, &mut self.generator) {
            warn!("Quest state unavailable for {}: {}", actor_id, e);
            return Err(Rejection::StoreUnavailable);
        }

        for discarded in self.store.take_discarded() {
            let mut quest = discarded.quest;
            let removed = self.engine.release(&mut quest, &mut self.world);
            info!(
                "Cycle rollover dropped quest {} for {} ({} resources despawned)",
                quest.id(),
                discarded.actor_id,
                removed
            );
        }
        Ok(())
    }

    fn persist(&self, actor_id: &str) {
        if let Err(e) = self.store.commit(actor_id) {
            warn!("Failed to save quest state for {}: {}", actor_id, e);
        }
    }

    fn snapshot_of(&self, actor_id: &str) -> Result<QuestSnapshot, Rejection> {
        let state = self.store.cached(actor_id).ok_or(Rejection::StoreUnavailable)?;
        let balance = self.wallet.balance(actor_id).unwrap_or_else(|e| {
            warn!("Failed to read SP balance for {}: {}", actor_id, e);
            0
        });
        Ok(QuestSnapshot {
            actor: actor_id.to_string(),
            state: state.clone(),
            balance,
        })
    }
}

fn cached<'a, P: Persistence>(
    store: &'a mut SessionQuestStore<P>,
    actor_id: &str,
) -> Result<&'a mut SessionQuestState, Rejection> {
    store.cached_mut(actor_id).ok_or(Rejection::StoreUnavailable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GeneratorConfig, PerRarity, ZoneConfig};
    use crate::db::MemoryKv;
    use crate::encounter::{ENCOUNTER_MARKER, quest_tag};
    use crate::quest::{Rarity, STATE_KEY};
    use crate::scheduler::ManualClock;
    use crate::world::{SimWorld, WorldResources};
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    type TestService = QuestService<Arc<MemoryKv>, SimWorld>;

    const POOL: &str = r#"
[[kill]]
id = "zombie_hunt"
title = "Zombie Hunt"
description = "Put down the shambling dead"
targets = ["zombie", "husk"]
base_count = 3
reward = 100

[[encounter]]
id = "raider_camp"
title = "Raider Camp"
description = "Clear out the camp"
mob_kind = "pillager"
mob_count = [5, 5]
reward = 300
items = [{ id = "emerald", count = 2 }]
"#;

    fn weights(rarity: Rarity) -> PerRarity<u32> {
        let mut weights = PerRarity { common: 0, rare: 0, legendary: 0, mythic: 0 };
        match rarity {
            Rarity::Common => weights.common = 1,
            Rarity::Rare => weights.rare = 1,
            Rarity::Legendary => weights.legendary = 1,
            Rarity::Mythic => weights.mythic = 1,
        }
        weights
    }

    /// Every slot is a rare 5-mob encounter with its zone at (100, 5, -200)
    fn encounter_config() -> QuestConfig {
        let mut config = QuestConfig::default();
        config.generator = GeneratorConfig {
            rarity_weights: weights(Rarity::Rare),
            encounter_chance: PerRarity { common: 0.0, rare: 1.0, legendary: 1.0, mythic: 0.0 },
            ..GeneratorConfig::default()
        };
        config.zone = ZoneConfig {
            anchor: BlockPos::new(100, 5, -200),
            min_distance: 0,
            max_distance: 0,
            trigger_radius: 10,
            ..ZoneConfig::default()
        };
        config.economy.jackpot_chance = 0.0;
        config
    }

    fn standard_config() -> QuestConfig {
        let mut config = QuestConfig::default();
        config.generator.rarity_weights = weights(Rarity::Common);
        config.economy.jackpot_chance = 0.0;
        config
    }

    fn service_with(config: QuestConfig, kv: Arc<MemoryKv>, clock: ManualClock) -> TestService {
        let pool = QuestPool::from_toml(POOL).unwrap();
        QuestService::with_seed(config, pool, kv, SimWorld::new(), Box::new(clock), 17)
    }

    fn service(config: QuestConfig) -> TestService {
        service_with(config, Arc::new(MemoryKv::new()), ManualClock::new(Utc::now()))
    }

    fn active(service: &mut TestService, actor: &str) -> AcceptedQuest {
        service.snapshot(actor).unwrap().state.active.unwrap()
    }

    fn live_handles(service: &mut TestService, actor: &str) -> Vec<ResourceHandle> {
        active(service, actor).encounter.unwrap().handles().to_vec()
    }

    fn kill(service: &mut TestService, handle: ResourceHandle) -> KillOutcome {
        let death = service.world_mut().kill(handle).unwrap();
        service.on_resource_killed(death)
    }

    #[test]
    fn test_encounter_survives_disconnect_and_reconnect() {
        let mut service = service(encounter_config());
        service.on_actor_reconnected("alice").unwrap();
        service.accept_slot("alice", 0).unwrap();

        let quest = active(&mut service, "alice");
        let quest_id = quest.id().to_string();
        let zone = quest.encounter.as_ref().unwrap().zone.clone().unwrap();
        assert_eq!(zone.center, BlockPos::new(100, 5, -200));
        assert_eq!(zone.radius, 10);
        assert_eq!(quest.required_count(), 5);

        // Enter the zone
        let entry = service.on_actor_position("alice", BlockPos::new(104, 70, -195), "overworld");
        assert_eq!(entry, Some(ZoneEntry::Spawned { requested: 5, spawned: 5 }));
        assert_eq!(service.world().count_tagged(&quest_tag(&quest_id)), 5);

        let handles = live_handles(&mut service, "alice");
        for handle in &handles[..2] {
            assert!(matches!(kill(&mut service, *handle), KillOutcome::Counted { completed: false, .. }));
        }
        let quest = active(&mut service, "alice");
        assert_eq!(quest.progress, 2);
        assert_eq!(quest.encounter.as_ref().unwrap().phase, EncounterPhase::Spawned);

        // Disconnect clears the world
        let snapshot = service.on_actor_disconnected("alice").unwrap();
        let encounter = snapshot.state.active.unwrap().encounter.unwrap();
        assert!(encounter.handles().is_empty());
        assert_eq!(service.world().count_tagged(ENCOUNTER_MARKER), 0);

        // Reconnect respawns what is left at the recorded anchor
        service.on_actor_reconnected("alice").unwrap();
        let anchor = active(&mut service, "alice").encounter.unwrap().spawn.unwrap().anchor;
        let handles = live_handles(&mut service, "alice");
        assert_eq!(handles.len(), 3);
        assert_eq!(service.world().count_tagged(&quest_tag(&quest_id)), 3);
        for handle in &handles {
            let pos = service.world().get(*handle).unwrap().pos;
            assert!(pos.horizontal_distance_sq(&anchor) <= 2 * 4 * 4);
        }

        let mut last = KillOutcome::Untracked;
        for handle in handles {
            last = kill(&mut service, handle);
        }
        assert_eq!(
            last,
            KillOutcome::Counted {
                actor: "alice".to_string(),
                quest_id: quest_id.clone(),
                progress: 5,
                total: 5,
                completed: true,
                credited_to: None,
            }
        );
        let quest = active(&mut service, "alice");
        assert_eq!(quest.encounter.unwrap().phase, EncounterPhase::Complete);
        assert_eq!(service.world().count_tagged(&quest_tag(&quest_id)), 0);
    }

    #[test]
    fn test_redeem_pays_and_clears_encounter() {
        let mut service = service(encounter_config());
        service.on_actor_reconnected("alice").unwrap();
        service.accept_slot("alice", 1).unwrap();
        service.on_zone_entered("alice").unwrap();
        let quest_id = active(&mut service, "alice").id().to_string();
        assert_eq!(service.engine().owner_of(&quest_id), Some("alice"));

        assert_eq!(
            service.redeem_active("alice").unwrap_err(),
            Rejection::NotComplete { progress: 0, required: 5 }
        );

        for handle in live_handles(&mut service, "alice") {
            kill(&mut service, handle);
        }
        let outcome = service.redeem_active("alice").unwrap();
        // 300 * 1.5 rare multiplier + 25 first-of-day
        assert_eq!(outcome.reward.amount, 475);
        assert!(outcome.reward.first_of_day);
        assert_eq!(outcome.items, vec![ItemReward { item_id: "emerald".to_string(), count: 2 }]);
        assert_eq!(outcome.snapshot.balance, 475);
        assert!(outcome.snapshot.state.active.is_none());
        assert_eq!(outcome.snapshot.state.completions_this_cycle, 1);
        assert!(service.engine().owner_of(&quest_id).is_none());

        assert_eq!(service.redeem_active("alice").unwrap_err(), Rejection::NoActiveQuest);
    }

    #[test]
    fn test_at_most_one_active_quest() {
        let mut service = service(standard_config());
        service.accept_slot("bob", 0).unwrap();
        assert_eq!(service.accept_slot("bob", 1).unwrap_err(), Rejection::QuestAlreadyActive);
        assert_eq!(service.snapshot("bob").unwrap().state.slots.iter().filter(|s| s.is_some()).count(), 2);

        service.abandon_active("bob").unwrap();
        assert_eq!(service.accept_slot("bob", 0).unwrap_err(), Rejection::EmptySlot { index: 0 });
        assert_eq!(service.accept_slot("bob", 7).unwrap_err(), Rejection::InvalidSlot { index: 7 });
        service.accept_slot("bob", 2).unwrap();
        assert_eq!(service.abandon_active("bob").map(|_| ()), Ok(()));
        assert_eq!(service.abandon_active("bob").unwrap_err(), Rejection::NoActiveQuest);
    }

    #[test]
    fn test_reroll_free_then_escalating_price() {
        let mut service = service(standard_config());
        service.on_actor_reconnected("carol").unwrap();

        let first = service.reroll("carol").unwrap();
        assert!(first.free);
        assert_eq!(first.price, 0);

        assert_eq!(
            service.reroll("carol").unwrap_err(),
            Rejection::InsufficientFunds { price: 100, balance: 0 }
        );

        service.wallet_mut().deposit("carol", 1000).unwrap();
        let prices: Vec<u64> = (0..4).map(|_| service.reroll("carol").unwrap().price).collect();
        assert_eq!(prices, vec![100, 100, 200, 400]);
        assert_eq!(service.snapshot("carol").unwrap().balance, 200);
        assert_eq!(service.snapshot("carol").unwrap().state.paid_rerolls, 4);
    }

    #[test]
    fn test_reroll_replaces_slots() {
        let mut service = service(standard_config());
        let before = service.snapshot("dan").unwrap().state.slots;
        let after = service.reroll("dan").unwrap().snapshot.state.slots;
        assert_eq!(after.len(), 3);
        assert_ne!(before, after);
    }

    #[test]
    fn test_cycle_expiry_wipes_active_and_keeps_unused_free_reroll() {
        let clock = ManualClock::new(Utc::now());
        let mut service = service_with(encounter_config(), Arc::new(MemoryKv::new()), clock.clone());
        service.on_actor_reconnected("erin").unwrap();
        service.accept_slot("erin", 0).unwrap();
        service.on_zone_entered("erin").unwrap();
        assert_eq!(service.world().count_tagged(ENCOUNTER_MARKER), 5);

        clock.advance(Duration::hours(24));
        let state = service.snapshot("erin").unwrap().state;
        assert!(state.active.is_none());
        assert!(state.slots.iter().all(Option::is_some));
        assert!(state.free_reroll);
        // The dropped encounter's resources went with it
        assert_eq!(service.world().count_tagged(ENCOUNTER_MARKER), 0);
    }

    #[test]
    fn test_cycle_expiry_does_not_restore_used_free_reroll() {
        let clock = ManualClock::new(Utc::now());
        let mut service = service_with(standard_config(), Arc::new(MemoryKv::new()), clock.clone());
        service.reroll("frank").unwrap();
        assert!(!service.snapshot("frank").unwrap().state.free_reroll);

        clock.advance(Duration::hours(25));
        let state = service.snapshot("frank").unwrap().state;
        assert!(!state.free_reroll);
        assert_eq!(state.paid_rerolls, 0);
    }

    #[test]
    fn test_cleanup_orphans_despawns_unclaimed_resources() {
        let mut service = service(encounter_config());
        let world = service.world_mut();
        for _ in 0..2 {
            let handle = world.spawn("pillager", BlockPos::new(0, 64, 0), "overworld").unwrap();
            world.tag(handle, ENCOUNTER_MARKER).unwrap();
            world.tag(handle, &quest_tag("Q")).unwrap();
        }
        assert_eq!(service.start(), 2);

        assert_eq!(service.cleanup_orphans(), 2);
        assert_eq!(service.world().count_tagged(&quest_tag("Q")), 0);
    }

    #[test]
    fn test_orphan_cleanup_spares_online_encounters() {
        let mut service = service(encounter_config());
        service.on_actor_reconnected("gina").unwrap();
        service.accept_slot("gina", 0).unwrap();
        service.on_zone_entered("gina").unwrap();

        assert_eq!(service.cleanup_orphans(), 0);
        assert_eq!(service.world().count_tagged(ENCOUNTER_MARKER), 5);
    }

    #[test]
    fn test_orphan_cleanup_runs_from_tick_after_delay() {
        let mut config = encounter_config();
        config.scheduler.orphan_cleanup_delay_ticks = 3;
        let mut service = service(config);
        let handle = service
            .world_mut()
            .spawn("pillager", BlockPos::new(0, 64, 0), "overworld")
            .unwrap();
        service.world_mut().tag(handle, ENCOUNTER_MARKER).unwrap();

        assert_eq!(service.tick().orphans_removed, 0);
        assert_eq!(service.tick().orphans_removed, 0);
        assert_eq!(service.tick().orphans_removed, 1);
        assert!(!service.world().is_alive(handle));
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let mut service = service(encounter_config());
        service.on_actor_reconnected("hank").unwrap();
        service.accept_slot("hank", 0).unwrap();
        service.on_zone_entered("hank").unwrap();

        let handles = live_handles(&mut service, "hank");
        service.world_mut().unload(handles[0]);

        let report = service.reconcile_actor("hank").unwrap();
        assert_eq!(report.spawned, 1);
        let count = service.world().count_tagged(ENCOUNTER_MARKER);
        assert_eq!(count, 5);

        let report = service.reconcile_actor("hank").unwrap();
        assert!(!report.changed());
        assert_eq!(service.world().count_tagged(ENCOUNTER_MARKER), count);
    }

    #[test]
    fn test_tick_reconcile_bounded_by_distance() {
        let mut config = encounter_config();
        config.scheduler.reconcile_interval_ticks = 1;
        config.scheduler.reconcile_max_distance = 50;
        let mut service = service(config);
        service.on_actor_reconnected("ivy").unwrap();
        service.accept_slot("ivy", 0).unwrap();
        service.on_actor_position("ivy", BlockPos::new(100, 5, -200), "overworld");

        let handles = live_handles(&mut service, "ivy");
        service.world_mut().unload(handles[0]);

        // Far away: left alone
        service.on_actor_position("ivy", BlockPos::new(1000, 5, 1000), "overworld");
        assert_eq!(service.tick().reconciled, 0);
        assert_eq!(service.world().count_tagged(ENCOUNTER_MARKER), 4);

        // Back near the anchor: repaired
        service.on_actor_position("ivy", BlockPos::new(110, 5, -200), "overworld");
        assert_eq!(service.tick().reconciled, 1);
        assert_eq!(service.world().count_tagged(ENCOUNTER_MARKER), 5);
    }

    #[test]
    fn test_failed_disconnect_despawn_cleared_by_tick() {
        let mut config = encounter_config();
        config.scheduler.reconcile_interval_ticks = 5;
        config.scheduler.orphan_cleanup_delay_ticks = 1;
        let mut service = service(config);
        // Startup janitor has already run
        service.tick();

        service.on_actor_reconnected("rosa").unwrap();
        service.accept_slot("rosa", 0).unwrap();
        service.on_zone_entered("rosa").unwrap();

        service.world_mut().fail_next_despawns(2);
        service.on_actor_disconnected("rosa").unwrap();
        assert_eq!(service.world().count_tagged(ENCOUNTER_MARKER), 2);

        let retried: u32 = (0..10).map(|_| service.tick().despawns_retried).sum();
        assert_eq!(retried, 2);
        assert_eq!(service.world().count_tagged(ENCOUNTER_MARKER), 0);
    }

    #[test]
    fn test_failed_abandon_despawn_cleared_by_tick() {
        let mut config = encounter_config();
        config.scheduler.reconcile_interval_ticks = 5;
        let mut service = service(config);
        service.on_actor_reconnected("sam").unwrap();
        service.accept_slot("sam", 0).unwrap();
        service.on_zone_entered("sam").unwrap();

        service.world_mut().fail_next_despawns(1);
        service.abandon_active("sam").unwrap();
        assert_eq!(service.world().count_tagged(ENCOUNTER_MARKER), 1);

        for _ in 0..5 {
            service.tick();
        }
        assert_eq!(service.world().count_tagged(ENCOUNTER_MARKER), 0);
        assert_eq!(service.engine().pending_despawns(), 0);
    }

    #[test]
    fn test_failed_completion_despawn_cleared_by_tick() {
        let mut config = encounter_config();
        config.scheduler.reconcile_interval_ticks = 5;
        let mut service = service(config);
        service.on_actor_reconnected("tara").unwrap();
        service.accept_slot("tara", 0).unwrap();
        service.on_zone_entered("tara").unwrap();

        // One kill short of the total, e.g. restored from an older save
        if let Some(quest) = service.store.cached_mut("tara").and_then(|s| s.active.as_mut()) {
            quest.progress = 4;
        }

        // The four survivors refuse to despawn when the encounter completes
        let handles = live_handles(&mut service, "tara");
        service.world_mut().fail_next_despawns(4);
        let outcome = kill(&mut service, handles[0]);
        assert!(matches!(outcome, KillOutcome::Counted { completed: true, .. }));
        assert_eq!(service.world().count_tagged(ENCOUNTER_MARKER), 4);

        for _ in 0..5 {
            service.tick();
        }
        assert_eq!(service.world().count_tagged(ENCOUNTER_MARKER), 0);
    }

    #[test]
    fn test_position_of_unknown_actor_is_not_tracked() {
        let mut service = service(encounter_config());
        for n in 0..50 {
            let actor = format!("ghost-{}", n);
            assert_eq!(service.on_actor_position(&actor, BlockPos::new(100, 5, -200), "overworld"), None);
        }
        assert!(service.presence.is_empty());

        service.on_actor_reconnected("uma").unwrap();
        service.on_actor_position("uma", BlockPos::new(0, 64, 0), "overworld");
        assert_eq!(service.presence.len(), 1);
        service.on_actor_disconnected("uma").unwrap();
        assert!(service.presence.is_empty());
    }

    #[test]
    fn test_snapshot_invariant_survives_pool_replacement() {
        let mut service = service(standard_config());
        service.accept_slot("jack", 0).unwrap();
        let before = active(&mut service, "jack");

        service.replace_pool(QuestPool::from_toml(
            r#"
[[kill]]
id = "zombie_hunt"
title = "Renamed"
description = "Changed"
targets = ["creeper"]
base_count = 99
reward = 1
"#,
        ).unwrap());

        let after = active(&mut service, "jack");
        assert_eq!(before, after);
        assert_eq!(after.definition.title, "Zombie Hunt");
    }

    #[test]
    fn test_objective_events_advance_standard_quest() {
        let mut service = service(standard_config());
        service.accept_slot("kate", 0).unwrap();
        let required = active(&mut service, "kate").required_count();

        let husk = ObjectiveEvent::EntityKilled { kind: "husk".to_string() };
        let stone = ObjectiveEvent::BlockMined { block: "stone".to_string() };
        assert_eq!(service.on_objective_event("kate", &stone).unwrap(), None);
        assert_eq!(service.on_objective_event("kate", &husk).unwrap(), Some(1));

        for _ in 0..required + 2 {
            service.on_objective_event("kate", &husk).unwrap();
        }
        assert_eq!(active(&mut service, "kate").progress, required);
        assert!(service.redeem_active("kate").is_ok());
    }

    #[test]
    fn test_kill_credit_and_dropped_attribution() {
        let mut service = service(encounter_config());
        service.on_actor_reconnected("liam").unwrap();
        service.accept_slot("liam", 0).unwrap();
        service.on_zone_entered("liam").unwrap();
        let handles = live_handles(&mut service, "liam");

        service.on_resource_damaged(handles[0], "mia");
        match kill(&mut service, handles[0]) {
            KillOutcome::Counted { actor, credited_to, progress, .. } => {
                assert_eq!(actor, "liam");
                assert_eq!(credited_to.as_deref(), Some("mia"));
                assert_eq!(progress, 1);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        // A tagged resource of a quest nobody owns
        let stray = service
            .world_mut()
            .spawn("pillager", BlockPos::new(0, 64, 0), "overworld")
            .unwrap();
        service.world_mut().tag(stray, ENCOUNTER_MARKER).unwrap();
        service.world_mut().tag(stray, &quest_tag("ghost")).unwrap();
        assert_eq!(kill(&mut service, stray), KillOutcome::Dropped { quest_id: "ghost".to_string() });

        let zombie = service
            .world_mut()
            .spawn("zombie", BlockPos::new(0, 64, 0), "overworld")
            .unwrap();
        assert_eq!(kill(&mut service, zombie), KillOutcome::Untracked);
    }

    #[test]
    fn test_rapid_kills_in_one_tick_all_count() {
        let kv = Arc::new(MemoryKv::new());
        let mut service = service_with(encounter_config(), kv.clone(), ManualClock::new(Utc::now()));
        service.on_actor_reconnected("nora").unwrap();
        service.accept_slot("nora", 0).unwrap();
        service.on_zone_entered("nora").unwrap();

        for handle in live_handles(&mut service, "nora")[..4].to_vec() {
            kill(&mut service, handle);
        }

        let bytes = kv.read("nora", STATE_KEY).unwrap().unwrap();
        let stored: SessionQuestState = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(stored.active.unwrap().progress, 4);
    }

    #[test]
    fn test_state_persists_across_service_restart() {
        let kv = Arc::new(MemoryKv::new());
        let clock = ManualClock::new(Utc::now());
        let mut first = service_with(encounter_config(), kv.clone(), clock.clone());
        first.on_actor_reconnected("olga").unwrap();
        first.accept_slot("olga", 0).unwrap();
        let accepted = active(&mut first, "olga");

        let mut second = service_with(encounter_config(), kv, clock);
        let restored = second.on_actor_reconnected("olga").unwrap();
        assert_eq!(restored.state.active, Some(accepted));
    }

    #[test]
    fn test_milestone_grants_free_reroll() {
        let mut config = standard_config();
        config.economy.free_reroll_milestone = 2;
        let mut service = service(config);
        service.reroll("pam").unwrap();

        let husk = ObjectiveEvent::EntityKilled { kind: "husk".to_string() };
        let mut granted = Vec::new();
        for slot in 0..2 {
            service.accept_slot("pam", slot).unwrap();
            let required = active(&mut service, "pam").required_count();
            for _ in 0..required {
                service.on_objective_event("pam", &husk).unwrap();
            }
            granted.push(service.redeem_active("pam").unwrap().free_reroll_granted);
        }
        assert_eq!(granted, vec![false, true]);
        assert!(service.snapshot("pam").unwrap().state.free_reroll);
    }
}
