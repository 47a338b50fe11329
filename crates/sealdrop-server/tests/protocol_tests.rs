//! Protocol tests for the submission and retrieval handlers.
//!
//! Tests cover:
//!  1. Submission → stored per recipient, idempotent on resubmission
//!  2. Tampered frame → rejected, nothing stored
//!  3. Incomplete frame → missing-field rejection
//!  4. Retrieval list → count line + per-record fields
//!  5. Authentication-code enforcement and the legacy bare-address form
//!  6. Delete / undelete / retain lifecycle over the wire
//!  7. Hard delete under retention → distinct rejection
//!  8. Export → JSON document, no trailing banner
//!  9. Malformed commands
//! 10. Account-mode login preamble

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use sealdrop_core::authcode::AuthCodeKey;
use sealdrop_core::config::AuthMode;
use sealdrop_core::envelope::EnvelopeParts;
use sealdrop_core::record::MessageRecord;
use sealdrop_core::registry::UserRegistry;
use sealdrop_core::store::{MemoryStore, MessageStore, ReplicatedStore};
use sealdrop_core::wire::{self, Command};

use sealdrop_server::retrieval::handle_retrieval;
use sealdrop_server::state::{ProtocolSettings, ServerState};
use sealdrop_server::submission::handle_submission;

const TEST_KEY_HEX: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";

struct Harness {
    primary: Arc<MemoryStore>,
    backup: Arc<MemoryStore>,
    state: Arc<ServerState>,
}

fn harness() -> Harness {
    harness_with(|_| {})
}

fn harness_with(tweak: impl FnOnce(&mut ProtocolSettings)) -> Harness {
    let primary = Arc::new(MemoryStore::new("primary"));
    let backup = Arc::new(MemoryStore::new("backup"));
    let store = Arc::new(ReplicatedStore::new(primary.clone(), backup.clone()));
    let mut settings = ProtocolSettings {
        default_retention_minutes: 1,
        read_timeout: Duration::from_millis(200),
        allow_unauthenticated_retrieval: false,
        auth_mode: AuthMode::AuthCode,
    };
    tweak(&mut settings);
    let state = Arc::new(ServerState {
        auth: AuthCodeKey::from_hex(TEST_KEY_HEX).unwrap(),
        store,
        registry: Arc::new(UserRegistry::new()),
        settings,
    });
    Harness {
        primary,
        backup,
        state,
    }
}

fn auth_key() -> AuthCodeKey {
    AuthCodeKey::from_hex(TEST_KEY_HEX).unwrap()
}

fn parts(body: u8) -> EnvelopeParts {
    EnvelopeParts {
        encrypted_key: vec![body; 256],
        iv: vec![body; 16],
        ciphertext: vec![body; 48],
    }
}

async fn drive_submission(state: Arc<ServerState>, frame: &[u8]) -> String {
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let task = tokio::spawn(handle_submission(server, state));
    client.write_all(frame).await.unwrap();
    client.shutdown().await.unwrap();
    let mut out = String::new();
    client.read_to_string(&mut out).await.unwrap();
    task.await.unwrap().unwrap();
    out
}

async fn drive_retrieval(state: Arc<ServerState>, request: &[u8]) -> String {
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let task = tokio::spawn(handle_retrieval(server, state));
    client.write_all(request).await.unwrap();
    client.shutdown().await.unwrap();
    let mut out = String::new();
    client.read_to_string(&mut out).await.unwrap();
    task.await.unwrap().unwrap();
    out
}

fn signed_command(command: Command) -> Vec<u8> {
    wire::build_command(&command, &auth_key())
}

// ─── 1. Submission stores per recipient and dedups ──────────────────────────

#[tokio::test]
async fn submission_fans_out_and_is_idempotent() {
    let h = harness();
    let frame = wire::build_submission(
        "alice@example.com",
        &["bob@example.com".to_string(), "carol@example.com".to_string()],
        &parts(1),
        &auth_key(),
    );

    let out = drive_submission(h.state.clone(), &frame).await;
    assert!(out.starts_with("220 "));
    assert!(out.contains("250 OK"));
    assert_eq!(h.primary.len(), 2);
    assert_eq!(h.backup.len(), 2);

    // Same frame again: same content ids, so nothing new lands.
    let out = drive_submission(h.state.clone(), &frame).await;
    assert!(out.contains("250 OK"));
    assert_eq!(h.primary.len(), 2);
    assert_eq!(h.backup.len(), 2);
}

// ─── 2. Tampered frame rejected ─────────────────────────────────────────────

#[tokio::test]
async fn submission_tamper_is_rejected() {
    let h = harness();
    let mut frame = wire::build_submission(
        "alice@example.com",
        &["bob@example.com".to_string()],
        &parts(1),
        &auth_key(),
    );
    // Flip one byte of the sender address inside the signed payload.
    let position = frame
        .windows(6)
        .position(|window| window == b"alice@")
        .unwrap();
    frame[position] = b'e';

    let out = drive_submission(h.state.clone(), &frame).await;
    assert!(out.contains("550 HMAC verification failed"));
    assert_eq!(h.primary.len(), 0);
    assert_eq!(h.backup.len(), 0);
}

#[tokio::test]
async fn submission_without_code_is_rejected() {
    let h = harness();
    let out = drive_submission(
        h.state.clone(),
        b"From: alice@example.com\nTo: bob@example.com\n",
    )
    .await;
    assert!(out.contains("550 Missing authentication code"));
}

// ─── 3. Incomplete frame ────────────────────────────────────────────────────

#[tokio::test]
async fn submission_missing_fields_is_rejected() {
    let h = harness();
    let key = auth_key();
    let payload_lines = vec![
        "From: alice@example.com".to_string(),
        "To: bob@example.com".to_string(),
    ];
    let code = key.sign(&wire::signed_payload(&payload_lines));
    let frame = format!("{}\n{code}\n", payload_lines.join("\n"));

    let out = drive_submission(h.state.clone(), frame.as_bytes()).await;
    assert!(out.contains("550 Missing recipient or sender"));
    assert_eq!(h.primary.len(), 0);
}

// ─── 4. Retrieval list ──────────────────────────────────────────────────────

#[tokio::test]
async fn list_returns_count_and_encoded_fields() {
    let h = harness();
    let record = MessageRecord::new("alice@example.com", "bob@example.com", &parts(7));
    h.state.store.put(&record).await;

    let out = drive_retrieval(
        h.state.clone(),
        &signed_command(Command::List {
            recipient: "bob@example.com".into(),
        }),
    )
    .await;

    let mut lines = out.lines();
    assert_eq!(lines.next().unwrap(), "+OK sealdrop retrieval ready");
    assert_eq!(lines.next().unwrap(), "+OK 1 messages");

    let metadata: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
    assert_eq!(metadata["sender"], "alice@example.com");
    assert_eq!(metadata["recipient"], "bob@example.com");
    assert_eq!(metadata["id"], serde_json::json!(record.id));
    assert_eq!(metadata["deleted"], serde_json::json!(false));

    let key = wire::b64_decode_padded(lines.next().unwrap()).unwrap();
    let iv = wire::b64_decode_padded(lines.next().unwrap()).unwrap();
    let ciphertext = wire::b64_decode_padded(lines.next().unwrap()).unwrap();
    assert_eq!(key, record.encrypted_key);
    assert_eq!(iv, record.iv);
    assert_eq!(ciphertext, record.ciphertext);
}

#[tokio::test]
async fn list_with_no_records_is_negative() {
    let h = harness();
    let out = drive_retrieval(
        h.state.clone(),
        &signed_command(Command::List {
            recipient: "nobody@example.com".into(),
        }),
    )
    .await;
    assert!(out.contains("-ERR No messages for this recipient"));
}

// ─── 5. Authentication enforcement ──────────────────────────────────────────

#[tokio::test]
async fn retrieval_with_bad_code_is_rejected() {
    let h = harness();
    let out = drive_retrieval(
        h.state.clone(),
        format!("bob@example.com\n{}\n", "0".repeat(64)).as_bytes(),
    )
    .await;
    assert!(out.contains("-ERR HMAC verification failed"));
}

#[tokio::test]
async fn legacy_bare_address_requires_opt_in() {
    // Default: no code, no service.
    let h = harness();
    let out = drive_retrieval(h.state.clone(), b"bob@example.com\n").await;
    assert!(out.contains("-ERR Missing authentication code"));

    // Opted in: the bare address acts as a plain list command.
    let h = harness_with(|settings| settings.allow_unauthenticated_retrieval = true);
    let record = MessageRecord::new("alice@example.com", "bob@example.com", &parts(3));
    h.state.store.put(&record).await;
    let out = drive_retrieval(h.state.clone(), b"bob@example.com\n").await;
    assert!(out.contains("+OK 1 messages"));
}

#[tokio::test]
async fn legacy_form_never_covers_management_commands() {
    let h = harness_with(|settings| settings.allow_unauthenticated_retrieval = true);
    let out = drive_retrieval(h.state.clone(), b"DELETE:deadbeef\n").await;
    assert!(out.contains("-ERR Missing authentication code"));
}

// ─── 6. Lifecycle commands over the wire ────────────────────────────────────

#[tokio::test]
async fn delete_undelete_retain_flow() {
    let h = harness();
    let record = MessageRecord::new("alice@example.com", "bob@example.com", &parts(5));
    h.state.store.put(&record).await;

    let out = drive_retrieval(
        h.state.clone(),
        &signed_command(Command::Delete {
            id: record.id.clone(),
            minutes: Some(5),
        }),
    )
    .await;
    assert!(out.contains("+OK Message deleted"));
    let copy = h.primary.get(&record.id).await.unwrap().unwrap();
    assert!(copy.deleted);
    assert!(copy.retention_until.is_some());

    let out = drive_retrieval(
        h.state.clone(),
        &signed_command(Command::Undelete {
            id: record.id.clone(),
        }),
    )
    .await;
    assert!(out.contains("+OK Message restored"));
    let copy = h.backup.get(&record.id).await.unwrap().unwrap();
    assert!(!copy.deleted);
    assert!(copy.retention_until.is_none());

    let out = drive_retrieval(
        h.state.clone(),
        &signed_command(Command::Retain {
            id: record.id.clone(),
            days: 3,
        }),
    )
    .await;
    assert!(out.contains("+OK Retention updated"));
    let copy = h.primary.get(&record.id).await.unwrap().unwrap();
    assert!(copy.retention_until.is_some());
    assert!(!copy.deleted);
}

#[tokio::test]
async fn lifecycle_commands_on_unknown_id() {
    let h = harness();
    let out = drive_retrieval(
        h.state.clone(),
        &signed_command(Command::Delete {
            id: "unknown".into(),
            minutes: None,
        }),
    )
    .await;
    assert!(out.contains("-ERR Message not found"));
}

// ─── 7. Hard delete under retention ─────────────────────────────────────────

#[tokio::test]
async fn hard_delete_blocked_then_allowed() {
    let h = harness();
    let record = MessageRecord::new("alice@example.com", "bob@example.com", &parts(9));
    h.state.store.put(&record).await;
    h.state.store.soft_delete(&record.id, 10).await;

    let out = drive_retrieval(
        h.state.clone(),
        &signed_command(Command::HardDelete {
            id: record.id.clone(),
        }),
    )
    .await;
    assert!(out.contains("-ERR Message under retention"));
    assert!(h.primary.get(&record.id).await.unwrap().is_some());
    assert!(h.backup.get(&record.id).await.unwrap().is_some());

    // Window elapsed: the same command succeeds.
    let past = chrono::Utc::now() - chrono::Duration::minutes(1);
    h.primary.set_retention(&record.id, past).await.unwrap();
    h.backup.set_retention(&record.id, past).await.unwrap();
    let out = drive_retrieval(
        h.state.clone(),
        &signed_command(Command::HardDelete {
            id: record.id.clone(),
        }),
    )
    .await;
    assert!(out.contains("+OK Message permanently deleted"));
    assert!(h.primary.get(&record.id).await.unwrap().is_none());
}

// ─── 8. Export ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn export_streams_json_document() {
    let h = harness();
    let received = MessageRecord::new("alice@example.com", "bob@example.com", &parts(1));
    let sent = MessageRecord::new("bob@example.com", "carol@example.com", &parts(2));
    let unrelated = MessageRecord::new("dave@example.com", "erin@example.com", &parts(3));
    for record in [&received, &sent, &unrelated] {
        h.state.store.put(record).await;
    }

    let out = drive_retrieval(
        h.state.clone(),
        &signed_command(Command::Export {
            address: "bob@example.com".into(),
        }),
    )
    .await;

    // Banner line, then the bare JSON document; no trailing status line.
    let document = out
        .strip_prefix("+OK sealdrop retrieval ready\n")
        .expect("banner first");
    let exported: Vec<serde_json::Value> = serde_json::from_str(document).unwrap();
    assert_eq!(exported.len(), 2);
    for entry in &exported {
        let addresses = [
            entry["sender"].as_str().unwrap(),
            entry["recipient"].as_str().unwrap(),
        ];
        assert!(addresses.contains(&"bob@example.com"));
    }
}

// ─── 9. Malformed commands ──────────────────────────────────────────────────

#[tokio::test]
async fn malformed_commands_are_named() {
    let h = harness();
    for bad in ["FROB:x", "RETAIN:onlyid", "DELETE:x:soon"] {
        let line_code = auth_key().sign(bad.as_bytes());
        let out = drive_retrieval(
            h.state.clone(),
            format!("{bad}\n{line_code}\n").as_bytes(),
        )
        .await;
        assert!(out.contains("-ERR malformed command"), "{bad}: {out}");
    }
}

// ─── 10. Account-mode login ─────────────────────────────────────────────────

#[tokio::test]
async fn account_mode_requires_valid_login() {
    let h = harness_with(|settings| settings.auth_mode = AuthMode::Account);
    h.state
        .registry
        .register("bob@example.com", "Securepass123!")
        .unwrap();
    let record = MessageRecord::new("alice@example.com", "bob@example.com", &parts(4));
    h.state.store.put(&record).await;

    let out = drive_retrieval(
        h.state.clone(),
        b"LOGIN:bob@example.com:Securepass123!\nbob@example.com\n",
    )
    .await;
    assert!(out.contains("+OK 1 messages"));

    let out = drive_retrieval(
        h.state.clone(),
        b"LOGIN:bob@example.com:WrongPass999!\nbob@example.com\n",
    )
    .await;
    assert!(out.contains("-ERR Authentication failed"));

    // No login preamble at all.
    let out = drive_retrieval(h.state.clone(), b"bob@example.com\n").await;
    assert!(out.contains("-ERR Authentication failed"));
}

// ─── Storage outage surfaces as a store-unavailable response ────────────────

#[tokio::test]
async fn full_outage_is_surfaced() {
    let h = harness();
    h.primary.set_healthy(false);
    h.backup.set_healthy(false);

    let frame = wire::build_submission(
        "alice@example.com",
        &["bob@example.com".to_string()],
        &parts(1),
        &auth_key(),
    );
    let out = drive_submission(h.state.clone(), &frame).await;
    assert!(out.contains("451 Storage unavailable"));

    let out = drive_retrieval(
        h.state.clone(),
        &signed_command(Command::List {
            recipient: "bob@example.com".into(),
        }),
    )
    .await;
    assert!(out.contains("-ERR Storage unavailable"));
}
