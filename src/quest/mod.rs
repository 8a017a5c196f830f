//! Quest System Module
//!
//! Quest templates and pools, the generator, per-actor session state with
//! its store, and the reward economy.

pub mod definition;
pub mod economy;
pub mod generator;
pub mod pool;
pub mod state;
pub mod store;

pub use definition::{
    AcceptedQuest, ItemReward, Objective, ObjectiveKind, QuestDefinition, Rarity, RewardSpec,
};
pub use economy::{BALANCE_KEY, KvWallet, RewardOutcome, Wallet, completion_reward, reroll_price};
pub use generator::{GeneratorError, QuestGenerator};
pub use pool::{HotReloadEvent, QuestPool, start_file_watcher};
pub use state::{STATE_VERSION, SessionQuestState};
pub use store::{DiscardedQuest, Persistence, STATE_KEY, SessionQuestStore};
