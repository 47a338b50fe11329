//! Message persistence.
//!
//! [`MessageStore`] is the repository seam: one backend, one set of
//! single-record operations. Expected conditions (missing id, duplicate
//! insert) are values, not errors; `StoreError` is reserved for the backend
//! actually failing. [`ReplicatedStore`] composes two backends into the
//! primary/backup pair with reconciliation and retention enforcement.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::record::MessageRecord;

pub mod memory;
pub mod replicated;
pub mod sqlite;

pub use memory::MemoryStore;
pub use replicated::{
    HardDeleteOutcome, OpOutcome, PutOutcome, ReconcileSummary, ReplicatedStore, ReplicationError,
    RetentionSummary,
};
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(String),
}

/// One backing store. Implementations must make `insert_if_absent` and the
/// conditional updates atomic per record; cross-record consistency is the
/// replication layer's job.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Stable label for logs ("primary", "backup").
    fn name(&self) -> &str;

    /// Lightweight liveness probe. No retry, no caching beyond the call.
    async fn ping(&self) -> bool;

    /// Insert keyed by id unless already present. Returns whether a row was
    /// actually written; a duplicate is a no-op, not an error.
    async fn insert_if_absent(&self, record: &MessageRecord) -> Result<bool, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<MessageRecord>, StoreError>;

    /// All records addressed to `recipient`, soft-deleted ones included.
    async fn by_recipient(&self, recipient: &str) -> Result<Vec<MessageRecord>, StoreError>;

    /// All records where `address` is the sender or the recipient (export).
    async fn by_address(&self, address: &str) -> Result<Vec<MessageRecord>, StoreError>;

    async fn ids(&self) -> Result<Vec<String>, StoreError>;

    /// Insert or overwrite the full record. Used by reconciliation.
    async fn upsert(&self, record: &MessageRecord) -> Result<(), StoreError>;

    /// Flag as soft-deleted with a retention window. Returns false when the
    /// id is not present in this store.
    async fn mark_deleted(
        &self,
        id: &str,
        deletion_time: DateTime<Utc>,
        retention_until: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Clear the soft-delete flag and any retention window.
    async fn clear_deleted(&self, id: &str) -> Result<bool, StoreError>;

    /// Set the retention window without touching the delete flag.
    async fn set_retention(&self, id: &str, until: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Physically remove the record. Returns whether anything was removed.
    async fn remove(&self, id: &str) -> Result<bool, StoreError>;

    /// Ids of soft-deleted records whose retention window ended before `now`.
    async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError>;
}
