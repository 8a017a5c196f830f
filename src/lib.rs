//! Quest Server
//!
//! Daily quests with slot rerolls and an SP economy, plus encounter quests
//! whose spawned mobs survive disconnects, chunk churn and crashes.

pub mod config;
pub mod db;
pub mod encounter;
pub mod error;
pub mod quest;
pub mod scheduler;
pub mod service;
pub mod world;

pub use config::QuestConfig;
pub use error::{ConfigError, Rejection, StoreError, WorldError};
pub use service::{
    KillOutcome, ObjectiveEvent, QuestService, QuestSnapshot, RedeemOutcome, RerollOutcome,
    TickReport,
};
