//! Retrieval and management protocol: one command per connection.
//!
//! Flow: ready banner, one command line plus its auth-code line, dispatch,
//! one response, close. The code line is read under a short timeout; a bare
//! address that never sends one is the legacy unauthenticated form, honored
//! only when `allow_unauthenticated_retrieval` is set. In `account` auth
//! mode a `LOGIN:<address>:<password>` preamble replaces the auth code and
//! is checked against the user registry.
//!
//! Every lower-layer failure leaves this module as a single `-ERR` line;
//! internal error types never cross the wire.

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use sealdrop_core::config::AuthMode;
use sealdrop_core::record::MessageRecord;
use sealdrop_core::store::{HardDeleteOutcome, OpOutcome};
use sealdrop_core::wire::{self, Command};

use crate::state::ServerState;

pub const BANNER: &str = "+OK sealdrop retrieval ready\n";
const REJECT_AUTH: &str = "-ERR HMAC verification failed\n";
const REJECT_NO_CODE: &str = "-ERR Missing authentication code\n";
const REJECT_LOGIN: &str = "-ERR Authentication failed\n";
const STORE_DOWN: &str = "-ERR Storage unavailable\n";
const NOT_FOUND: &str = "-ERR Message not found\n";
const UNDER_RETENTION: &str = "-ERR Message under retention\n";
const NO_MESSAGES: &str = "-ERR No messages for this recipient\n";

pub async fn handle_retrieval<S>(stream: S, state: Arc<ServerState>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    writer.write_all(BANNER.as_bytes()).await?;
    writer.flush().await?;

    let mut command_line = String::new();
    let n = reader.read_line(&mut command_line).await?;
    if n == 0 {
        return Ok(());
    }
    let command_line = command_line.trim().to_string();

    match state.settings.auth_mode {
        AuthMode::Account => {
            // LOGIN preamble instead of a per-command code.
            match Command::parse(&command_line) {
                Ok(Command::Login { address, password }) => {
                    if !state.registry.authenticate(&address, &password) {
                        warn!(address, "retrieval login rejected");
                        return respond(&mut writer, REJECT_LOGIN).await;
                    }
                    info!(address, "retrieval login accepted");
                }
                _ => return respond(&mut writer, REJECT_LOGIN).await,
            }
            let mut next = String::new();
            if reader.read_line(&mut next).await? == 0 {
                return Ok(());
            }
            let command_line = next.trim().to_string();
            return dispatch(&command_line, &mut writer, &state).await;
        }
        AuthMode::AuthCode => {
            let mut code_line = String::new();
            let code = match tokio::time::timeout(
                state.settings.read_timeout,
                reader.read_line(&mut code_line),
            )
            .await
            {
                Ok(Ok(n)) if n > 0 && !code_line.trim().is_empty() => {
                    Some(code_line.trim().to_string())
                }
                _ => None,
            };
            match code {
                Some(code) => {
                    if !state.auth.verify(command_line.as_bytes(), &code) {
                        warn!("retrieval rejected: authentication code mismatch");
                        return respond(&mut writer, REJECT_AUTH).await;
                    }
                }
                None => {
                    let legacy_list = !command_line.contains(':') && !command_line.is_empty();
                    if !(state.settings.allow_unauthenticated_retrieval && legacy_list) {
                        warn!("retrieval rejected: no authentication code");
                        return respond(&mut writer, REJECT_NO_CODE).await;
                    }
                    info!("legacy unauthenticated retrieval accepted");
                }
            }
            dispatch(&command_line, &mut writer, &state).await
        }
    }
}

async fn dispatch<W>(line: &str, writer: &mut W, state: &Arc<ServerState>) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let command = match Command::parse(line) {
        Ok(command) => command,
        Err(e) => return respond(writer, &format!("-ERR {e}\n")).await,
    };
    match command {
        Command::List { recipient } => list(&recipient, writer, state).await,
        Command::Delete { id, minutes } => {
            let minutes = minutes.unwrap_or(state.settings.default_retention_minutes);
            let outcome = state.store.soft_delete(&id, minutes).await;
            respond_op(writer, outcome, "+OK Message deleted\n").await
        }
        Command::HardDelete { id } => {
            let status = match state.store.hard_delete(&id).await {
                HardDeleteOutcome::Removed => "+OK Message permanently deleted\n",
                HardDeleteOutcome::StillRetained => UNDER_RETENTION,
                HardDeleteOutcome::NotFound => NOT_FOUND,
                HardDeleteOutcome::Unavailable => STORE_DOWN,
            };
            respond(writer, status).await
        }
        Command::Undelete { id } => {
            let outcome = state.store.restore(&id).await;
            respond_op(writer, outcome, "+OK Message restored\n").await
        }
        Command::Retain { id, days } => {
            let outcome = state.store.mark_retention(&id, days).await;
            respond_op(writer, outcome, "+OK Retention updated\n").await
        }
        Command::Export { address } => export(&address, writer, state).await,
        // LOGIN is only meaningful as the account-mode preamble.
        Command::Login { .. } => respond(writer, "-ERR malformed command: LOGIN\n").await,
    }
}

async fn list<W>(recipient: &str, writer: &mut W, state: &Arc<ServerState>) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let records = match state.store.fetch(recipient).await {
        Ok(records) => records,
        Err(e) => {
            warn!(recipient, error = %e, "list failed");
            return respond(writer, STORE_DOWN).await;
        }
    };
    if records.is_empty() {
        return respond(writer, NO_MESSAGES).await;
    }
    writer
        .write_all(format!("+OK {} messages\n", records.len()).as_bytes())
        .await?;
    for record in &records {
        writer.write_all(metadata_line(record).as_bytes()).await?;
        writer
            .write_all(format!("{}\n", wire::b64_encode(&record.encrypted_key)).as_bytes())
            .await?;
        writer
            .write_all(format!("{}\n", wire::b64_encode(&record.iv)).as_bytes())
            .await?;
        writer
            .write_all(format!("{}\n", wire::b64_encode(&record.ciphertext)).as_bytes())
            .await?;
    }
    writer.flush().await?;
    info!(recipient, count = records.len(), "messages listed");
    Ok(())
}

fn metadata_line(record: &MessageRecord) -> String {
    let metadata = serde_json::json!({
        "sender": record.sender,
        "recipient": record.recipient,
        "timestamp": record.timestamp.to_rfc3339(),
        "id": record.id,
        "deleted": record.deleted,
    });
    format!("{metadata}\n")
}

/// Stream the export document, then half-close the write side: the missing
/// trailing banner plus EOF is the end-of-data signal.
async fn export<W>(address: &str, writer: &mut W, state: &Arc<ServerState>) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let records = match state.store.export(address).await {
        Ok(records) => records,
        Err(e) => {
            warn!(address, error = %e, "export failed");
            return respond(writer, STORE_DOWN).await;
        }
    };
    let exported: Vec<_> = records.iter().map(MessageRecord::to_export).collect();
    let document = serde_json::to_vec_pretty(&exported)?;
    writer.write_all(&document).await?;
    writer.flush().await?;
    writer.shutdown().await?;
    info!(address, count = exported.len(), "export streamed");
    Ok(())
}

async fn respond_op<W>(writer: &mut W, outcome: OpOutcome, ok: &str) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let status = match outcome {
        OpOutcome::Applied => ok,
        OpOutcome::NotFound => NOT_FOUND,
        OpOutcome::Unavailable => STORE_DOWN,
    };
    respond(writer, status).await
}

async fn respond<W>(writer: &mut W, status: &str) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(status.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
