//! Persistence Backends
//!
//! `MemoryKv` is the synchronous key-value store the quest core reads and
//! writes during a tick. `Database` hydrates it from SQLite at startup and
//! flushes dirty records back on the autosave loop.

use dashmap::{DashMap, DashSet};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::error::StoreError;
use crate::quest::Persistence;

type RecordKey = (String, String);

/// In-memory records keyed by (actor, key), remembering which changed
/// since the last flush
#[derive(Debug, Default)]
pub struct MemoryKv {
    records: DashMap<RecordKey, Vec<u8>>,
    dirty: DashSet<RecordKey>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert without marking dirty; used when hydrating from the database
    pub fn hydrate(&self, actor_id: &str, key: &str, bytes: Vec<u8>) {
        self.records
            .insert((actor_id.to_string(), key.to_string()), bytes);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Take the dirty records, clearing their dirty marks
    pub fn drain_dirty(&self) -> Vec<(String, String, Vec<u8>)> {
        let keys: Vec<RecordKey> = self.dirty.iter().map(|k| k.key().clone()).collect();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            self.dirty.remove(&key);
            if let Some(bytes) = self.records.get(&key) {
                out.push((key.0.clone(), key.1.clone(), bytes.value().clone()));
            }
        }
        out
    }

    pub fn mark_dirty(&self, actor_id: &str, key: &str) {
        self.dirty.insert((actor_id.to_string(), key.to_string()));
    }
}

impl Persistence for MemoryKv {
    fn read(&self, actor_id: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .records
            .get(&(actor_id.to_string(), key.to_string()))
            .map(|r| r.value().clone()))
    }

    fn write(&self, actor_id: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let record_key = (actor_id.to_string(), key.to_string());
        self.records.insert(record_key.clone(), bytes.to_vec());
        self.dirty.insert(record_key);
        Ok(())
    }
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        // Run migrations
        Self::migrate(&pool).await?;

        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quest_records (
                actor_id TEXT NOT NULL,
                record_key TEXT NOT NULL,
                payload BLOB NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY(actor_id, record_key)
            )
            "#,
        )
        .execute(pool)
        .await?;

        tracing::info!("Database migrations complete");
        Ok(())
    }

    /// Load every stored record into `kv`. Returns the number loaded.
    pub async fn load_all(&self, kv: &MemoryKv) -> Result<usize, StoreError> {
        let rows = sqlx::query("SELECT actor_id, record_key, payload FROM quest_records")
            .fetch_all(&self.pool)
            .await?;

        for row in &rows {
            let actor_id: String = row.get("actor_id");
            let record_key: String = row.get("record_key");
            let payload: Vec<u8> = row.get("payload");
            kv.hydrate(&actor_id, &record_key, payload);
        }

        tracing::info!("Loaded {} quest records from database", rows.len());
        Ok(rows.len())
    }

    /// Write dirty records from `kv`. Records that fail to save are marked
    /// dirty again for the next flush.
    pub async fn flush(&self, kv: &MemoryKv) -> Result<usize, StoreError> {
        let pending = kv.drain_dirty();
        let mut saved = 0;
        let mut first_error = None;

        for (actor_id, record_key, payload) in pending {
            let result = sqlx::query(
                r#"INSERT INTO quest_records (actor_id, record_key, payload, updated_at)
                VALUES (?, ?, ?, CURRENT_TIMESTAMP)
                ON CONFLICT(actor_id, record_key)
                DO UPDATE SET payload = excluded.payload, updated_at = CURRENT_TIMESTAMP"#,
            )
            .bind(&actor_id)
            .bind(&record_key)
            .bind(&payload)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => saved += 1,
                Err(e) => {
                    tracing::warn!("Failed to save {} for {}: {}", record_key, actor_id, e);
                    kv.mark_dirty(&actor_id, &record_key);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(saved),
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
