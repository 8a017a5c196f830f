//! Quest Generator
//!
//! Produces offerable quests from the static pools. Every quest is built
//! from owned copies of pool data, so nothing generated can reach back into
//! the pool.

use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::definition::{Objective, ObjectiveKind, QuestDefinition, Rarity, RewardSpec};
use super::pool::{EncounterEntry, QuestPool, StandardEntry};
use crate::config::GeneratorConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeneratorError {
    #[error("no {kind} templates available at {rarity} rarity")]
    EmptyPool { kind: &'static str, rarity: &'static str },
}

pub struct QuestGenerator {
    pool: QuestPool,
    config: GeneratorConfig,
    rng: StdRng,
}

impl QuestGenerator {
    pub fn new(pool: QuestPool, config: GeneratorConfig) -> Self {
        Self {
            pool,
            config,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(pool: QuestPool, config: GeneratorConfig, seed: u64) -> Self {
        Self {
            pool,
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn pool(&self) -> &QuestPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut QuestPool {
        &mut self.pool
    }

    /// Swap in a reloaded pool. Quests already offered or accepted keep
    /// their own copies.
    pub fn replace_pool(&mut self, pool: QuestPool) {
        self.pool = pool;
    }

    /// Fill `n` slots with fresh quests
    pub fn generate_slots(&mut self, n: usize) -> Vec<Option<QuestDefinition>> {
        (0..n).map(|_| self.generate_quest()).collect()
    }

    /// Draw a rarity and build a quest for it. Encounter draws that fail fall
    /// back to a standard quest of the same rarity; `None` only when the
    /// standard pools are empty as well.
    pub fn generate_quest(&mut self) -> Option<QuestDefinition> {
        let rarity = self.draw_rarity();

        let chance = self.config.encounter_chance.get(rarity).clamp(0.0, 1.0);
        if chance > 0.0 && self.rng.gen_bool(chance) {
            match self.generate_encounter(rarity) {
                Ok(quest) => return Some(quest),
                Err(e) => debug!("Encounter generation fell back to standard: {}", e),
            }
        }

        match self.generate_standard(rarity) {
            Ok(quest) => Some(quest),
            Err(e) => {
                warn!("Quest slot left empty: {}", e);
                None
            }
        }
    }

    fn draw_rarity(&mut self) -> Rarity {
        let weights = self.config.rarity_weights;
        match WeightedIndex::new(Rarity::ALL.iter().map(|r| weights.get(*r))) {
            Ok(dist) => Rarity::ALL[dist.sample(&mut self.rng)],
            Err(_) => Rarity::Common,
        }
    }

    pub fn generate_encounter(&mut self, rarity: Rarity) -> Result<QuestDefinition, GeneratorError> {
        let candidates = self.pool.encounters_for(rarity);
        let entry: &EncounterEntry = candidates
            .choose(&mut self.rng)
            .copied()
            .ok_or(GeneratorError::EmptyPool {
                kind: "encounter",
                rarity: rarity.as_str(),
            })?;

        let [min, max] = entry.mob_count;
        let mob_count = self.rng.gen_range(min..=max);

        Ok(QuestDefinition {
            id: Uuid::new_v4().to_string(),
            title: entry.title.clone(),
            description: entry.description.clone(),
            category: entry.category.clone(),
            rarity,
            objective: Objective::Encounter {
                mob_kind: entry.mob_kind.clone(),
                mob_count,
            },
            reward: RewardSpec {
                currency: entry.reward,
                items: entry.items.iter().map(|i| i.resolve()).collect(),
            },
        })
    }

    pub fn generate_standard(&mut self, rarity: Rarity) -> Result<QuestDefinition, GeneratorError> {
        let families: Vec<(ObjectiveKind, &Vec<StandardEntry>)> = [
            (ObjectiveKind::Kill, &self.pool.kill),
            (ObjectiveKind::Mine, &self.pool.mine),
            (ObjectiveKind::Gather, &self.pool.gather),
        ]
        .into_iter()
        .filter(|(_, entries)| !entries.is_empty())
        .collect();

        let empty = GeneratorError::EmptyPool {
            kind: "standard",
            rarity: rarity.as_str(),
        };
        let (kind, entries) = families.choose(&mut self.rng).ok_or(empty.clone())?;
        let entry = entries.choose(&mut self.rng).ok_or(empty)?;

        let count = entry
            .base_count
            .saturating_mul(self.config.count_multipliers.get(rarity).max(1));
        let targets = entry.targets.clone();
        let objective = match kind {
            ObjectiveKind::Kill => Objective::Kill { targets, count },
            ObjectiveKind::Mine => Objective::Mine { targets, count },
            ObjectiveKind::Gather => Objective::Gather { targets, count },
            ObjectiveKind::Encounter => unreachable!("encounter entries are not standard families"),
        };

        Ok(QuestDefinition {
            id: Uuid::new_v4().to_string(),
            title: entry.title.clone(),
            description: entry.description.clone(),
            category: entry.category.clone(),
            rarity,
            objective,
            reward: RewardSpec {
                currency: entry.reward,
                items: entry.items.iter().map(|i| i.resolve()).collect(),
            },
        })
    }
}
