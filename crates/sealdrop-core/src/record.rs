//! The message record: the unit of storage and transfer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::envelope::EnvelopeParts;
use crate::wire;

/// One stored message. Content fields are immutable after creation; the
/// lifecycle fields (`deleted`, `deletion_time`, `retention_until`) are the
/// only ones mutation and reconciliation ever touch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Content-derived identifier; see [`compute_id`]. Stable across
    /// resubmission, so duplicate submissions dedup instead of piling up.
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub encrypted_key: Vec<u8>,
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub deleted: bool,
    pub deletion_time: Option<DateTime<Utc>>,
    pub retention_until: Option<DateTime<Utc>>,
}

impl MessageRecord {
    pub fn new(sender: &str, recipient: &str, parts: &EnvelopeParts) -> Self {
        Self {
            id: compute_id(recipient, sender, &parts.encrypted_key, &parts.iv, &parts.ciphertext),
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            encrypted_key: parts.encrypted_key.clone(),
            iv: parts.iv.clone(),
            ciphertext: parts.ciphertext.clone(),
            timestamp: Utc::now(),
            deleted: false,
            deletion_time: None,
            retention_until: None,
        }
    }

    /// The timestamp that orders this record during reconciliation:
    /// `deletion_time` once soft-deleted, creation time otherwise.
    pub fn relevant_timestamp(&self) -> DateTime<Utc> {
        if self.deleted {
            self.deletion_time.unwrap_or(self.timestamp)
        } else {
            self.timestamp
        }
    }

    /// Whether two copies of the same record diverge. Compares only the
    /// mutable lifecycle fields; content fields are pinned by the id.
    pub fn lifecycle_differs(&self, other: &MessageRecord) -> bool {
        self.deleted != other.deleted
            || self.deletion_time != other.deletion_time
            || self.retention_until != other.retention_until
    }

    /// Export representation: binary fields as base64, timestamps RFC 3339.
    pub fn to_export(&self) -> ExportedRecord {
        ExportedRecord {
            id: self.id.clone(),
            sender: self.sender.clone(),
            recipient: self.recipient.clone(),
            encrypted_key: wire::b64_encode(&self.encrypted_key),
            iv: wire::b64_encode(&self.iv),
            ciphertext: wire::b64_encode(&self.ciphertext),
            timestamp: self.timestamp,
            deleted: self.deleted,
            deletion_time: self.deletion_time,
            retention_until: self.retention_until,
        }
    }
}

/// What `EXPORT:` streams to the requester.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedRecord {
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub encrypted_key: String,
    pub iv: String,
    pub ciphertext: String,
    pub timestamp: DateTime<Utc>,
    pub deleted: bool,
    pub deletion_time: Option<DateTime<Utc>>,
    pub retention_until: Option<DateTime<Utc>>,
}

/// Hex SHA-256 over the length-prefixed content fields. The recipient is
/// part of the hash, so one submission fanned out to N recipients yields N
/// distinct records.
pub fn compute_id(
    recipient: &str,
    sender: &str,
    encrypted_key: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
) -> String {
    let mut hasher = Sha256::new();
    for part in [
        recipient.as_bytes(),
        sender.as_bytes(),
        encrypted_key,
        iv,
        ciphertext,
    ] {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts() -> EnvelopeParts {
        EnvelopeParts {
            encrypted_key: vec![1u8; 256],
            iv: vec![2u8; 16],
            ciphertext: vec![3u8; 48],
        }
    }

    #[test]
    fn id_is_deterministic() {
        let a = MessageRecord::new("bob@example.com", "alice@example.com", &parts());
        let b = MessageRecord::new("bob@example.com", "alice@example.com", &parts());
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn id_differs_per_recipient() {
        let a = MessageRecord::new("bob@example.com", "alice@example.com", &parts());
        let b = MessageRecord::new("bob@example.com", "carol@example.com", &parts());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn id_tracks_content() {
        let mut p = parts();
        let a = MessageRecord::new("bob@example.com", "alice@example.com", &p);
        p.ciphertext[0] ^= 1;
        let b = MessageRecord::new("bob@example.com", "alice@example.com", &p);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn relevant_timestamp_switches_on_delete() {
        let mut rec = MessageRecord::new("bob@example.com", "alice@example.com", &parts());
        assert_eq!(rec.relevant_timestamp(), rec.timestamp);
        let later = rec.timestamp + chrono::Duration::minutes(5);
        rec.deleted = true;
        rec.deletion_time = Some(later);
        assert_eq!(rec.relevant_timestamp(), later);
    }

    #[test]
    fn lifecycle_differs_ignores_content() {
        let a = MessageRecord::new("bob@example.com", "alice@example.com", &parts());
        let mut b = a.clone();
        assert!(!a.lifecycle_differs(&b));
        b.deleted = true;
        b.deletion_time = Some(Utc::now());
        assert!(a.lifecycle_differs(&b));
    }
}
