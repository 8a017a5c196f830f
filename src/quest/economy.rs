//! Reward & Economy
//!
//! SP payouts for completed quests, the reroll price curve, and the wallet
//! that holds each actor's SP balance.

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::definition::Rarity;
use super::store::Persistence;
use crate::config::EconomyConfig;
use crate::error::StoreError;

/// Record key holding an actor's SP balance
pub const BALANCE_KEY: &str = "sp_balance";

/// Price of the next paid reroll. The first two cost the base price, then
/// each one doubles: P, P, 2P, 4P, ...
pub fn reroll_price(paid_rerolls: u32, base_price: u64) -> u64 {
    if paid_rerolls <= 1 {
        return base_price;
    }
    let doublings = (paid_rerolls - 1).min(63);
    base_price.saturating_mul(1u64 << doublings)
}

/// Computed payout plus which bonuses applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardOutcome {
    pub amount: u64,
    pub rarity_multiplier: f64,
    /// Fractional bonus from the streak, e.g. 0.2 for +20%
    pub streak_bonus: f64,
    pub first_of_day: bool,
    pub jackpot: bool,
}

/// SP payout for a completed quest.
///
/// `streak` counts completions earlier in the same cycle. The first-of-day
/// bonus is flat and added before the jackpot multiplier.
pub fn completion_reward<R: Rng + ?Sized>(
    base_amount: u64,
    rarity: Rarity,
    streak: u32,
    is_first_of_day: bool,
    config: &EconomyConfig,
    rng: &mut R,
) -> RewardOutcome {
    let rarity_multiplier = config.rarity_multipliers.get(rarity).max(0.0);
    let streak_bonus = (streak as f64 * config.streak_step).clamp(0.0, config.streak_cap.max(0.0));

    let mut amount = (base_amount as f64 * rarity_multiplier * (1.0 + streak_bonus)).round() as u64;
    if is_first_of_day {
        amount = amount.saturating_add(config.first_of_day_bonus);
    }

    let chance = config.jackpot_chance.clamp(0.0, 1.0);
    let jackpot = chance > 0.0 && rng.gen_bool(chance);
    if jackpot {
        amount = amount.saturating_mul(config.jackpot_multiplier.max(1));
    }

    RewardOutcome {
        amount,
        rarity_multiplier,
        streak_bonus,
        first_of_day: is_first_of_day,
        jackpot,
    }
}

// ============================================================================
// Wallet
// ============================================================================

/// SP balance storage
pub trait Wallet {
    fn balance(&self, actor_id: &str) -> Result<u64, StoreError>;
    /// Take `amount` if the balance covers it. Returns false otherwise.
    fn withdraw(&mut self, actor_id: &str, amount: u64) -> Result<bool, StoreError>;
    fn deposit(&mut self, actor_id: &str, amount: u64) -> Result<u64, StoreError>;
}

/// Wallet keeping balances in the persistence substrate
pub struct KvWallet<P: Persistence> {
    persistence: P,
}

impl<P: Persistence> KvWallet<P> {
    pub fn new(persistence: P) -> Self {
        Self { persistence }
    }

    fn store(&self, actor_id: &str, balance: u64) -> Result<(), StoreError> {
        self.persistence
            .write(actor_id, BALANCE_KEY, balance.to_string().as_bytes())
    }
}

impl<P: Persistence> Wallet for KvWallet<P> {
    fn balance(&self, actor_id: &str) -> Result<u64, StoreError> {
        let Some(bytes) = self.persistence.read(actor_id, BALANCE_KEY)? else {
            return Ok(0);
        };
        match std::str::from_utf8(&bytes).ok().and_then(|s| s.trim().parse().ok()) {
            Some(balance) => Ok(balance),
            None => {
                warn!("Malformed SP balance for {}, treating as 0", actor_id);
                Ok(0)
            }
        }
    }

    fn withdraw(&mut self, actor_id: &str, amount: u64) -> Result<bool, StoreError> {
        let balance = self.balance(actor_id)?;
        if balance < amount {
            return Ok(false);
        }
        self.store(actor_id, balance - amount)?;
        Ok(true)
    }

    fn deposit(&mut self, actor_id: &str, amount: u64) -> Result<u64, StoreError> {
        let balance = self.balance(actor_id)?.saturating_add(amount);
        self.store(actor_id, balance)?;
        Ok(balance)
    }
}
