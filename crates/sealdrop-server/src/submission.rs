//! Submission protocol: one framed message per connection.
//!
//! Flow: ready banner, one signed frame (`From:` / `To:` / key / iv /
//! ciphertext lines, then the hex auth-code line), verify, store per
//! recipient, one status line back. The handler is generic over the stream
//! so tests drive it over an in-memory duplex pipe.

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use sealdrop_core::envelope::EnvelopeParts;
use sealdrop_core::record::MessageRecord;
use sealdrop_core::store::PutOutcome;
use sealdrop_core::wire::{self, SubmissionFrame};

use crate::state::ServerState;

pub const BANNER: &str = "220 sealdrop submission ready\n";
const OK: &str = "250 OK\n";
const REJECT_FIELDS: &str = "550 Missing recipient or sender\n";
const REJECT_AUTH: &str = "550 HMAC verification failed\n";
const REJECT_NO_CODE: &str = "550 Missing authentication code\n";
const REJECT_OVERSIZED: &str = "550 Frame too large\n";
const STORE_DOWN: &str = "451 Storage unavailable\n";

/// Submission frames are a handful of header lines; anything bigger is
/// hostile or confused.
const MAX_FRAME_LINES: usize = 64;

pub async fn handle_submission<S>(stream: S, state: Arc<ServerState>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    writer.write_all(BANNER.as_bytes()).await?;
    writer.flush().await?;

    // Collect payload lines until the bare auth-code line (or EOF).
    let mut payload_lines: Vec<String> = Vec::new();
    let mut code: Option<String> = None;
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break;
        }
        let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
        if wire::is_auth_code_line(&trimmed) {
            code = Some(trimmed);
            break;
        }
        payload_lines.push(trimmed);
        if payload_lines.len() > MAX_FRAME_LINES {
            return respond(&mut writer, REJECT_OVERSIZED).await;
        }
    }

    let Some(code) = code else {
        warn!("submission frame ended without an authentication code");
        return respond(&mut writer, REJECT_NO_CODE).await;
    };
    if !state.auth.verify(&wire::signed_payload(&payload_lines), &code) {
        warn!("submission rejected: authentication code mismatch");
        return respond(&mut writer, REJECT_AUTH).await;
    }

    let frame = SubmissionFrame::parse(&payload_lines);
    if !frame.is_complete() {
        warn!("submission rejected: incomplete frame");
        return respond(&mut writer, REJECT_FIELDS).await;
    }

    // All present after the is_complete check.
    let sender = frame.sender.unwrap_or_default();
    let parts = EnvelopeParts {
        encrypted_key: frame.encrypted_key.unwrap_or_default(),
        iv: frame.iv.unwrap_or_default(),
        ciphertext: frame.ciphertext.unwrap_or_default(),
    };

    let mut lost = 0usize;
    for recipient in &frame.recipients {
        let record = MessageRecord::new(&sender, recipient, &parts);
        match state.store.put(&record).await {
            PutOutcome::Stored { replicas } => {
                info!(recipient, id = %record.id, replicas, "message stored");
            }
            PutOutcome::Duplicate => {
                info!(recipient, id = %record.id, "duplicate submission ignored");
            }
            PutOutcome::Lost => lost += 1,
        }
    }

    if lost == frame.recipients.len() {
        return respond(&mut writer, STORE_DOWN).await;
    }
    respond(&mut writer, OK).await
}

async fn respond<W>(writer: &mut W, status: &str) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(status.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
