//! SQLite-backed store via sqlx.
//!
//! WAL journal mode is configured at connection time, not inside a
//! migration; SQLite refuses to change `journal_mode` inside a transaction
//! and sqlx wraps every migration in one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::Path;

use super::{MessageStore, StoreError};
use crate::record::MessageRecord;

pub struct SqliteStore {
    name: String,
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and run pending migrations.
    pub async fn open(name: &str, db_path: &Path) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(opts).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        Ok(Self {
            name: name.to_string(),
            pool,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_record(row: &SqliteRow) -> MessageRecord {
    MessageRecord {
        id: row.get("id"),
        sender: row.get("sender"),
        recipient: row.get("recipient"),
        encrypted_key: row.get("encrypted_key"),
        iv: row.get("iv"),
        ciphertext: row.get("ciphertext"),
        timestamp: row.get("timestamp"),
        deleted: row.get("deleted"),
        deletion_time: row.get("deletion_time"),
        retention_until: row.get("retention_until"),
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> bool {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }

    async fn insert_if_absent(&self, record: &MessageRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO messages \
             (id, sender, recipient, encrypted_key, iv, ciphertext, timestamp, deleted, deletion_time, retention_until) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.sender)
        .bind(&record.recipient)
        .bind(&record.encrypted_key)
        .bind(&record.iv)
        .bind(&record.ciphertext)
        .bind(record.timestamp)
        .bind(record.deleted)
        .bind(record.deletion_time)
        .bind(record.retention_until)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: &str) -> Result<Option<MessageRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_record))
    }

    async fn by_recipient(&self, recipient: &str) -> Result<Vec<MessageRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM messages WHERE recipient = ? ORDER BY timestamp, id")
            .bind(recipient)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    async fn by_address(&self, address: &str) -> Result<Vec<MessageRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE recipient = ? OR sender = ? ORDER BY timestamp, id",
        )
        .bind(address)
        .bind(address)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    async fn ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(sqlx::query_scalar("SELECT id FROM messages")
            .fetch_all(&self.pool)
            .await?)
    }

    async fn upsert(&self, record: &MessageRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO messages \
             (id, sender, recipient, encrypted_key, iv, ciphertext, timestamp, deleted, deletion_time, retention_until) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
             timestamp = excluded.timestamp, \
             deleted = excluded.deleted, \
             deletion_time = excluded.deletion_time, \
             retention_until = excluded.retention_until",
        )
        .bind(&record.id)
        .bind(&record.sender)
        .bind(&record.recipient)
        .bind(&record.encrypted_key)
        .bind(&record.iv)
        .bind(&record.ciphertext)
        .bind(record.timestamp)
        .bind(record.deleted)
        .bind(record.deletion_time)
        .bind(record.retention_until)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_deleted(
        &self,
        id: &str,
        deletion_time: DateTime<Utc>,
        retention_until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE messages SET deleted = 1, deletion_time = ?, retention_until = ? WHERE id = ?",
        )
        .bind(deletion_time)
        .bind(retention_until)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear_deleted(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE messages SET deleted = 0, deletion_time = NULL, retention_until = NULL WHERE id = ?",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_retention(&self, id: &str, until: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE messages SET retention_until = ? WHERE id = ?")
            .bind(until)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        // Timestamp comparison happens here rather than in SQL so the text
        // encoding of the column never affects the cutoff.
        let rows = sqlx::query(
            "SELECT id, retention_until FROM messages WHERE deleted = 1 AND retention_until IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .filter(|row| {
                row.get::<Option<DateTime<Utc>>, _>("retention_until")
                    .is_some_and(|until| until < now)
            })
            .map(|row| row.get("id"))
            .collect())
    }
}
