//! Error Types
//!
//! Validation rejections surfaced to callers, plus the internal failure types
//! of the world and persistence substrates.

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::world::ResourceHandle;

/// A request refused by validation. Never thrown past the service boundary;
/// callers receive it as a structured rejection with a reason code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("slot {index} does not exist")]
    InvalidSlot { index: usize },

    #[error("slot {index} has no quest to accept")]
    EmptySlot { index: usize },

    #[error("a quest is already active")]
    QuestAlreadyActive,

    #[error("no quest is active")]
    NoActiveQuest,

    #[error("reroll costs {price} SP but only {balance} SP is available")]
    InsufficientFunds { price: u64, balance: u64 },

    #[error("quest is not complete ({progress}/{required})")]
    NotComplete { progress: u32, required: u32 },

    #[error("quest data is temporarily unavailable")]
    StoreUnavailable,
}

impl Rejection {
    /// Stable reason code for callers
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::InvalidSlot { .. } => "invalid_slot",
            Rejection::EmptySlot { .. } => "empty_slot",
            Rejection::QuestAlreadyActive => "quest_already_active",
            Rejection::NoActiveQuest => "no_active_quest",
            Rejection::InsufficientFunds { .. } => "insufficient_funds",
            Rejection::NotComplete { .. } => "not_complete",
            Rejection::StoreUnavailable => "store_unavailable",
        }
    }
}

impl Serialize for Rejection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Rejection", 2)?;
        s.serialize_field("code", self.code())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

/// Failure of a world resource operation. Always recovered locally by
/// deferring to the next reconciliation tick.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorldError {
    #[error("failed to spawn '{kind}' in {dimension}: {reason}")]
    SpawnFailed {
        kind: String,
        dimension: String,
        reason: String,
    },

    #[error("resource {0} does not exist")]
    UnknownResource(ResourceHandle),

    #[error("world rejected operation: {0}")]
    Rejected(String),
}

/// Persistence substrate failure
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read '{key}' for {actor}: {reason}")]
    Read {
        actor: String,
        key: String,
        reason: String,
    },

    #[error("failed to write '{key}' for {actor}: {reason}")]
    Write {
        actor: String,
        key: String,
        reason: String,
    },

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Configuration loading failure
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
