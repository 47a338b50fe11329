//! Full scenario: Alice submits an encrypted message to Bob, Bob retrieves
//! and decrypts it, soft-deletes it, is refused a hard delete inside the
//! retention window, and the enforcement pass removes it once the window
//! ends.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use sealdrop_core::authcode::AuthCodeKey;
use sealdrop_core::config::AuthMode;
use sealdrop_core::envelope::{self, EnvelopeParts};
use sealdrop_core::keys::generate_keypair;
use sealdrop_core::registry::UserRegistry;
use sealdrop_core::store::{MemoryStore, MessageStore, ReplicatedStore};
use sealdrop_core::wire::{self, Command};

use sealdrop_server::retrieval::handle_retrieval;
use sealdrop_server::state::{ProtocolSettings, ServerState};
use sealdrop_server::submission::handle_submission;

const TEST_KEY_HEX: &str = "deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef";

async fn drive<F, Fut>(handler: F, request: &[u8]) -> String
where
    F: FnOnce(tokio::io::DuplexStream) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let (mut client, server) = tokio::io::duplex(256 * 1024);
    let task = tokio::spawn(handler(server));
    client.write_all(request).await.unwrap();
    client.shutdown().await.unwrap();
    let mut out = String::new();
    client.read_to_string(&mut out).await.unwrap();
    task.await.unwrap().unwrap();
    out
}

#[tokio::test]
async fn submit_retrieve_decrypt_delete_enforce() {
    let primary = Arc::new(MemoryStore::new("primary"));
    let backup = Arc::new(MemoryStore::new("backup"));
    let store = Arc::new(ReplicatedStore::new(primary.clone(), backup.clone()));
    let auth = AuthCodeKey::from_hex(TEST_KEY_HEX).unwrap();
    let state = Arc::new(ServerState {
        auth: auth.clone(),
        store: store.clone(),
        registry: Arc::new(UserRegistry::new()),
        settings: ProtocolSettings {
            default_retention_minutes: 1,
            read_timeout: Duration::from_millis(200),
            allow_unauthenticated_retrieval: false,
            auth_mode: AuthMode::AuthCode,
        },
    });

    // Alice encrypts for Bob and submits.
    let (bob_private, bob_public) = generate_keypair().unwrap();
    let plaintext = b"Hello Bob, this is Alice!";
    let parts = envelope::encrypt(plaintext, &bob_public).unwrap();
    let frame = wire::build_submission(
        "alice@example.com",
        &["bob@example.com".to_string()],
        &parts,
        &auth,
    );
    let submission_state = state.clone();
    let out = drive(
        move |stream| handle_submission(stream, submission_state),
        &frame,
    )
    .await;
    assert!(out.contains("250 OK"), "{out}");

    // Bob lists his messages and decrypts the one record.
    let list_state = state.clone();
    let out = drive(
        move |stream| handle_retrieval(stream, list_state),
        &wire::build_command(
            &Command::List {
                recipient: "bob@example.com".into(),
            },
            &auth,
        ),
    )
    .await;
    let mut lines = out.lines();
    assert_eq!(lines.next().unwrap(), "+OK sealdrop retrieval ready");
    assert_eq!(lines.next().unwrap(), "+OK 1 messages");
    let metadata: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
    let id = metadata["id"].as_str().unwrap().to_string();

    let received = EnvelopeParts {
        encrypted_key: wire::b64_decode_padded(lines.next().unwrap()).unwrap(),
        iv: wire::b64_decode_padded(lines.next().unwrap()).unwrap(),
        ciphertext: wire::b64_decode_padded(lines.next().unwrap()).unwrap(),
    };
    assert_eq!(received.encrypted_key.len(), envelope::modulus_size(&bob_private));
    assert_eq!(received.iv.len(), envelope::IV_LEN);
    let decrypted = envelope::decrypt(&received, &bob_private).unwrap();
    assert_eq!(decrypted, plaintext);

    // Bob soft-deletes with a one-minute window.
    let delete_state = state.clone();
    let out = drive(
        move |stream| handle_retrieval(stream, delete_state),
        &wire::build_command(
            &Command::Delete {
                id: id.clone(),
                minutes: Some(1),
            },
            &auth,
        ),
    )
    .await;
    assert!(out.contains("+OK Message deleted"), "{out}");

    // An immediate hard delete is refused.
    let hard_state = state.clone();
    let out = drive(
        move |stream| handle_retrieval(stream, hard_state),
        &wire::build_command(&Command::HardDelete { id: id.clone() }, &auth),
    )
    .await;
    assert!(out.contains("-ERR Message under retention"), "{out}");
    assert!(primary.get(&id).await.unwrap().is_some());

    // Window elapses; the enforcement pass removes the record everywhere.
    let past = chrono::Utc::now() - chrono::Duration::seconds(1);
    for side in [&primary, &backup] {
        let copy = side.get(&id).await.unwrap().unwrap();
        side.mark_deleted(&id, copy.deletion_time.unwrap(), past)
            .await
            .unwrap();
    }
    let summary = store.enforce_retention(chrono::Utc::now()).await;
    assert_eq!(summary.removed, 2);

    let final_state = state.clone();
    let out = drive(
        move |stream| handle_retrieval(stream, final_state),
        &wire::build_command(
            &Command::List {
                recipient: "bob@example.com".into(),
            },
            &auth,
        ),
    )
    .await;
    assert!(out.contains("-ERR No messages for this recipient"), "{out}");
}
