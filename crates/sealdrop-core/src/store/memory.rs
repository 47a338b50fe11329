//! In-memory store: the test double and the smallest deployment backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{MessageStore, StoreError};
use crate::record::MessageRecord;

pub struct MemoryStore {
    name: String,
    records: Mutex<HashMap<String, MessageRecord>>,
    healthy: AtomicBool,
}

impl MemoryStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            records: Mutex::new(HashMap::new()),
            healthy: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unhealthy the store fails its liveness
    /// probe and the replication layer routes around it.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn insert_if_absent(&self, record: &MessageRecord) -> Result<bool, StoreError> {
        let mut records = self.records.lock();
        if records.contains_key(&record.id) {
            return Ok(false);
        }
        records.insert(record.id.clone(), record.clone());
        Ok(true)
    }

    async fn get(&self, id: &str) -> Result<Option<MessageRecord>, StoreError> {
        Ok(self.records.lock().get(id).cloned())
    }

    async fn by_recipient(&self, recipient: &str) -> Result<Vec<MessageRecord>, StoreError> {
        let mut found: Vec<MessageRecord> = self
            .records
            .lock()
            .values()
            .filter(|r| r.recipient == recipient)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn by_address(&self, address: &str) -> Result<Vec<MessageRecord>, StoreError> {
        let mut found: Vec<MessageRecord> = self
            .records
            .lock()
            .values()
            .filter(|r| r.recipient == address || r.sender == address)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.records.lock().keys().cloned().collect())
    }

    async fn upsert(&self, record: &MessageRecord) -> Result<(), StoreError> {
        self.records
            .lock()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn mark_deleted(
        &self,
        id: &str,
        deletion_time: DateTime<Utc>,
        retention_until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.lock();
        match records.get_mut(id) {
            Some(record) => {
                record.deleted = true;
                record.deletion_time = Some(deletion_time);
                record.retention_until = Some(retention_until);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn clear_deleted(&self, id: &str) -> Result<bool, StoreError> {
        let mut records = self.records.lock();
        match records.get_mut(id) {
            Some(record) => {
                record.deleted = false;
                record.deletion_time = None;
                record.retention_until = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_retention(&self, id: &str, until: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut records = self.records.lock();
        match records.get_mut(id) {
            Some(record) => {
                record.retention_until = Some(until);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.records.lock().remove(id).is_some())
    }

    async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        Ok(self
            .records
            .lock()
            .values()
            .filter(|r| r.deleted && r.retention_until.is_some_and(|until| until < now))
            .map(|r| r.id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeParts;

    fn record(sender: &str, recipient: &str, body: u8) -> MessageRecord {
        MessageRecord::new(
            sender,
            recipient,
            &EnvelopeParts {
                encrypted_key: vec![body; 256],
                iv: vec![body; 16],
                ciphertext: vec![body; 32],
            },
        )
    }

    #[tokio::test]
    async fn insert_if_absent_dedups() {
        let store = MemoryStore::new("primary");
        let rec = record("alice@example.com", "bob@example.com", 1);
        assert!(store.insert_if_absent(&rec).await.unwrap());
        assert!(!store.insert_if_absent(&rec).await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn lifecycle_updates_report_missing_ids() {
        let store = MemoryStore::new("primary");
        let now = Utc::now();
        assert!(!store.mark_deleted("nope", now, now).await.unwrap());
        assert!(!store.clear_deleted("nope").await.unwrap());
        assert!(!store.set_retention("nope", now).await.unwrap());
        assert!(!store.remove("nope").await.unwrap());
    }

    #[tokio::test]
    async fn expired_honors_flag_and_window() {
        let store = MemoryStore::new("primary");
        let now = Utc::now();

        let live = record("a@x.com", "b@x.com", 1);
        store.insert_if_absent(&live).await.unwrap();

        let pending = record("a@x.com", "b@x.com", 2);
        store.insert_if_absent(&pending).await.unwrap();
        store
            .mark_deleted(&pending.id, now, now + chrono::Duration::minutes(10))
            .await
            .unwrap();

        let overdue = record("a@x.com", "b@x.com", 3);
        store.insert_if_absent(&overdue).await.unwrap();
        store
            .mark_deleted(&overdue.id, now, now - chrono::Duration::minutes(1))
            .await
            .unwrap();

        assert_eq!(store.expired(now).await.unwrap(), vec![overdue.id]);
    }

    #[tokio::test]
    async fn by_address_covers_both_directions() {
        let store = MemoryStore::new("primary");
        store
            .insert_if_absent(&record("alice@x.com", "bob@x.com", 1))
            .await
            .unwrap();
        store
            .insert_if_absent(&record("bob@x.com", "carol@x.com", 2))
            .await
            .unwrap();
        store
            .insert_if_absent(&record("carol@x.com", "dave@x.com", 3))
            .await
            .unwrap();

        assert_eq!(store.by_address("bob@x.com").await.unwrap().len(), 2);
        assert_eq!(store.by_recipient("bob@x.com").await.unwrap().len(), 1);
    }
}
