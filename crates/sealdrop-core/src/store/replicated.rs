//! Primary/backup replication with reconciliation and retention enforcement.
//!
//! Not a consensus pair: either store serves reads and writes while the
//! other is down, and a periodic last-writer-wins reconciliation pass
//! brings them back into agreement. Content-derived ids plus
//! insert-if-absent make the realistic divergence lifecycle-only
//! (deleted here, live there), which the timestamp comparison resolves.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use super::{MessageStore, StoreError};
use crate::record::MessageRecord;

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("no reachable message store")]
    Unavailable,
}

/// Outcome of a write fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Written (or already present) in `replicas` healthy stores.
    Stored { replicas: usize },
    /// Every reachable store already held the record.
    Duplicate,
    /// No healthy store accepted the write. The message is gone; there is
    /// deliberately no buffering or retry queue.
    Lost,
}

/// Outcome of soft delete / restore / retention updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOutcome {
    Applied,
    NotFound,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardDeleteOutcome {
    Removed,
    /// Present, but a retention window is still open somewhere.
    StillRetained,
    NotFound,
    Unavailable,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileSummary {
    /// Pass skipped because a store was unhealthy.
    pub skipped: bool,
    pub examined: usize,
    /// One-sided records copied to the other store.
    pub copied: usize,
    /// One-sided records already past retention, purged at the holder.
    pub purged: usize,
    /// Two-sided lifecycle conflicts resolved last-writer-wins.
    pub resolved: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RetentionSummary {
    pub removed: usize,
}

/// Folds per-store results of a lifecycle update into one outcome:
/// applied anywhere beats not-found, and no healthy store at all is its
/// own case. Per-store failures are logged and absorbed.
#[derive(Default)]
struct LifecycleRollup {
    any_healthy: bool,
    found: bool,
}

impl LifecycleRollup {
    fn absorb(&mut self, store: &dyn MessageStore, id: &str, what: &str, result: Result<bool, StoreError>) {
        self.any_healthy = true;
        match result {
            Ok(true) => self.found = true,
            Ok(false) => info!(store = store.name(), id, "{what}: id not present here"),
            Err(e) => error!(store = store.name(), id, error = %e, "{what} failed"),
        }
    }

    fn outcome(&self) -> OpOutcome {
        if !self.any_healthy {
            OpOutcome::Unavailable
        } else if self.found {
            OpOutcome::Applied
        } else {
            OpOutcome::NotFound
        }
    }
}

pub struct ReplicatedStore {
    primary: Arc<dyn MessageStore>,
    backup: Arc<dyn MessageStore>,
    /// Signalled after every successful write so the reconcile loop runs
    /// promptly instead of waiting out its interval.
    reconcile_wake: Notify,
    /// Serializes reconciliation passes; client operations run concurrently.
    reconcile_gate: Mutex<()>,
}

impl ReplicatedStore {
    pub fn new(primary: Arc<dyn MessageStore>, backup: Arc<dyn MessageStore>) -> Self {
        Self {
            primary,
            backup,
            reconcile_wake: Notify::new(),
            reconcile_gate: Mutex::new(()),
        }
    }

    pub fn reconcile_wake(&self) -> &Notify {
        &self.reconcile_wake
    }

    pub fn primary(&self) -> &Arc<dyn MessageStore> {
        &self.primary
    }

    pub fn backup(&self) -> &Arc<dyn MessageStore> {
        &self.backup
    }

    async fn healthy_stores(&self) -> Vec<&Arc<dyn MessageStore>> {
        let mut healthy = Vec::with_capacity(2);
        for store in [&self.primary, &self.backup] {
            if store.ping().await {
                healthy.push(store);
            } else {
                warn!(store = store.name(), "store failed liveness probe");
            }
        }
        healthy
    }

    /// Insert into every healthy store, deduplicated by the content id.
    pub async fn put(&self, record: &MessageRecord) -> PutOutcome {
        let mut replicas = 0usize;
        let mut inserted_any = false;
        for store in self.healthy_stores().await {
            match store.insert_if_absent(record).await {
                Ok(true) => {
                    replicas += 1;
                    inserted_any = true;
                }
                Ok(false) => {
                    debug!(store = store.name(), id = %record.id, "duplicate insert ignored");
                    replicas += 1;
                }
                Err(e) => {
                    error!(store = store.name(), id = %record.id, error = %e, "write failed");
                }
            }
        }
        if replicas == 0 {
            error!(id = %record.id, "message lost: no healthy store accepted the write");
            return PutOutcome::Lost;
        }
        self.reconcile_wake.notify_one();
        if inserted_any {
            PutOutcome::Stored { replicas }
        } else {
            PutOutcome::Duplicate
        }
    }

    /// Read for a recipient: healthy primary first, backup only when the
    /// primary is unreachable or holds nothing. Results are never merged
    /// across stores, so a partial partition cannot produce duplicates.
    pub async fn fetch(&self, recipient: &str) -> Result<Vec<MessageRecord>, ReplicationError> {
        let mut any_healthy = false;
        for store in [&self.primary, &self.backup] {
            if !store.ping().await {
                warn!(store = store.name(), "store unhealthy, trying the other");
                continue;
            }
            any_healthy = true;
            match store.by_recipient(recipient).await {
                Ok(records) if !records.is_empty() => return Ok(records),
                Ok(_) => debug!(store = store.name(), recipient, "no records here"),
                Err(e) => error!(store = store.name(), error = %e, "read failed"),
            }
        }
        if any_healthy {
            Ok(Vec::new())
        } else {
            Err(ReplicationError::Unavailable)
        }
    }

    /// Everything sent to or by `address`, union of both reachable stores,
    /// deduplicated by id (export is a completeness operation, unlike
    /// `fetch`).
    pub async fn export(&self, address: &str) -> Result<Vec<MessageRecord>, ReplicationError> {
        let mut by_id = std::collections::BTreeMap::new();
        let mut any_healthy = false;
        for store in [&self.primary, &self.backup] {
            if !store.ping().await {
                continue;
            }
            any_healthy = true;
            match store.by_address(address).await {
                Ok(records) => {
                    for record in records {
                        by_id.entry(record.id.clone()).or_insert(record);
                    }
                }
                Err(e) => error!(store = store.name(), error = %e, "export read failed"),
            }
        }
        if !any_healthy {
            return Err(ReplicationError::Unavailable);
        }
        Ok(by_id.into_values().collect())
    }

    pub async fn soft_delete(&self, id: &str, retention_minutes: i64) -> OpOutcome {
        let now = Utc::now();
        let until = now + Duration::minutes(retention_minutes);
        let mut rollup = LifecycleRollup::default();
        for store in self.healthy_stores().await {
            rollup.absorb(
                store.as_ref(),
                id,
                "soft delete",
                store.mark_deleted(id, now, until).await,
            );
        }
        rollup.outcome()
    }

    pub async fn restore(&self, id: &str) -> OpOutcome {
        let mut rollup = LifecycleRollup::default();
        for store in self.healthy_stores().await {
            rollup.absorb(store.as_ref(), id, "restore", store.clear_deleted(id).await);
        }
        rollup.outcome()
    }

    pub async fn mark_retention(&self, id: &str, days: i64) -> OpOutcome {
        let until = Utc::now() + Duration::days(days);
        let mut rollup = LifecycleRollup::default();
        for store in self.healthy_stores().await {
            rollup.absorb(
                store.as_ref(),
                id,
                "retention update",
                store.set_retention(id, until).await,
            );
        }
        rollup.outcome()
    }

    /// Physically remove unless a retention window is still open. Success
    /// means at least one reachable store dropped the record.
    pub async fn hard_delete(&self, id: &str) -> HardDeleteOutcome {
        let now = Utc::now();
        let mut any_healthy = false;
        let mut removed = false;
        let mut retained = false;
        let mut found = false;
        for store in self.healthy_stores().await {
            any_healthy = true;
            match store.get(id).await {
                Ok(Some(record)) => {
                    found = true;
                    if record.retention_until.is_some_and(|until| until > now) {
                        info!(store = store.name(), id, "hard delete refused: still retained");
                        retained = true;
                        continue;
                    }
                    match store.remove(id).await {
                        Ok(true) => removed = true,
                        Ok(false) => debug!(store = store.name(), id, "already gone"),
                        Err(e) => error!(store = store.name(), id, error = %e, "remove failed"),
                    }
                }
                Ok(None) => debug!(store = store.name(), id, "hard delete: id not present here"),
                Err(e) => error!(store = store.name(), id, error = %e, "lookup failed"),
            }
        }
        if !any_healthy {
            HardDeleteOutcome::Unavailable
        } else if removed {
            HardDeleteOutcome::Removed
        } else if retained {
            HardDeleteOutcome::StillRetained
        } else if found {
            // Present but nothing removable and nothing retained: a remove
            // raced or failed; report it as retained-equivalent failure.
            HardDeleteOutcome::StillRetained
        } else {
            HardDeleteOutcome::NotFound
        }
    }

    /// Purge soft-deleted records whose retention window has ended.
    pub async fn enforce_retention(&self, now: DateTime<Utc>) -> RetentionSummary {
        let mut summary = RetentionSummary::default();
        for store in self.healthy_stores().await {
            let ids = match store.expired(now).await {
                Ok(ids) => ids,
                Err(e) => {
                    error!(store = store.name(), error = %e, "retention scan failed");
                    continue;
                }
            };
            for id in ids {
                match store.remove(&id).await {
                    Ok(true) => {
                        info!(store = store.name(), id = %id, "retention window elapsed, removed");
                        summary.removed += 1;
                    }
                    Ok(false) => {}
                    Err(e) => error!(store = store.name(), id = %id, error = %e, "purge failed"),
                }
            }
        }
        summary
    }

    /// One reconciliation pass. Skipped entirely unless both stores are
    /// healthy; passes are serialized against each other but race freely
    /// with client operations.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> ReconcileSummary {
        let _gate = self.reconcile_gate.lock().await;
        let mut summary = ReconcileSummary::default();

        if !self.primary.ping().await || !self.backup.ping().await {
            debug!("reconcile skipped: a store is unhealthy");
            summary.skipped = true;
            return summary;
        }

        let primary_ids = match self.primary.ids().await {
            Ok(ids) => ids,
            Err(e) => {
                error!(store = self.primary.name(), error = %e, "id listing failed");
                summary.skipped = true;
                return summary;
            }
        };
        let backup_ids = match self.backup.ids().await {
            Ok(ids) => ids,
            Err(e) => {
                error!(store = self.backup.name(), error = %e, "id listing failed");
                summary.skipped = true;
                return summary;
            }
        };

        let union: BTreeSet<String> = primary_ids.into_iter().chain(backup_ids).collect();
        summary.examined = union.len();

        for id in &union {
            if let Err(e) = self.reconcile_one(id, now, &mut summary).await {
                // A single bad record must not end the pass.
                error!(id = %id, error = %e, "reconcile step failed");
            }
        }

        info!(
            examined = summary.examined,
            copied = summary.copied,
            purged = summary.purged,
            resolved = summary.resolved,
            "reconcile pass complete"
        );
        summary
    }

    async fn reconcile_one(
        &self,
        id: &str,
        now: DateTime<Utc>,
        summary: &mut ReconcileSummary,
    ) -> Result<(), StoreError> {
        let in_primary = self.primary.get(id).await?;
        let in_backup = self.backup.get(id).await?;
        match (in_primary, in_backup) {
            (Some(record), None) => {
                self.settle_one_sided(record, &self.primary, &self.backup, now, summary)
                    .await
            }
            (None, Some(record)) => {
                self.settle_one_sided(record, &self.backup, &self.primary, now, summary)
                    .await
            }
            (Some(primary_copy), Some(backup_copy)) => {
                if !primary_copy.lifecycle_differs(&backup_copy) {
                    return Ok(());
                }
                // Last writer wins on the lifecycle timestamp; ties go to
                // the primary so repeated passes stay deterministic.
                if primary_copy.relevant_timestamp() >= backup_copy.relevant_timestamp() {
                    self.backup.upsert(&primary_copy).await?;
                } else {
                    self.primary.upsert(&backup_copy).await?;
                }
                summary.resolved += 1;
                Ok(())
            }
            // Disappeared between the id listing and the lookups: a
            // concurrent hard delete. Nothing to settle.
            (None, None) => Ok(()),
        }
    }

    /// A record only one side holds: copy it over while it is live or its
    /// retention window is still open; otherwise it already outlived its
    /// retention and is purged at the holder. The purge closes the gap
    /// where enforcement ran on one store before the record was ever
    /// replicated to the other.
    async fn settle_one_sided(
        &self,
        record: MessageRecord,
        holder: &Arc<dyn MessageStore>,
        other: &Arc<dyn MessageStore>,
        now: DateTime<Utc>,
        summary: &mut ReconcileSummary,
    ) -> Result<(), StoreError> {
        let keep = !record.deleted || record.retention_until.is_some_and(|until| until > now);
        if keep {
            other.upsert(&record).await?;
            debug!(id = %record.id, from = holder.name(), to = other.name(), "copied");
            summary.copied += 1;
        } else {
            holder.remove(&record.id).await?;
            info!(id = %record.id, store = holder.name(), "purged: past retention, never replicated");
            summary.purged += 1;
        }
        Ok(())
    }
}
