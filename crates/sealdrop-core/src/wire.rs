//! Wire framing for the submission and retrieval protocols.
//!
//! Both protocols are newline-oriented. A request is a payload followed by
//! one trailing line holding the hex authentication code:
//!
//! ```text
//! <payload line 1>\n
//! ...\n
//! <payload line N>\n
//! <hex auth code>\n
//! ```
//!
//! The code covers the payload lines joined with `\n` (no trailing
//! newline). Submission payloads are `From:` / `To:` / `Encrypted-AES-Key:`
//! / `IV:` / `Message:` header lines with base64 values; retrieval payloads
//! are a single colon-separated command line.
//!
//! Base64 values may arrive without `=` padding; they are re-padded to a
//! multiple of four before decoding.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;

use crate::authcode::AuthCodeKey;
use crate::envelope::EnvelopeParts;

pub const HEADER_FROM: &str = "From:";
pub const HEADER_TO: &str = "To:";
pub const HEADER_KEY: &str = "Encrypted-AES-Key:";
pub const HEADER_IV: &str = "IV:";
pub const HEADER_MESSAGE: &str = "Message:";

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed command: {0}")]
    Malformed(String),
}

pub fn b64_encode(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Decode base64 that may have lost its `=` padding in transit.
pub fn b64_decode_padded(data: &str) -> Option<Vec<u8>> {
    let trimmed = data.trim();
    let mut padded = trimmed.to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    BASE64.decode(padded.as_bytes()).ok()
}

/// A bare line of exactly 64 hex digits is an authentication code; header
/// lines always carry a keyword prefix and can never look like one.
pub fn is_auth_code_line(line: &str) -> bool {
    line.len() == 64 && line.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Join payload lines the way the signer saw them.
pub fn signed_payload(lines: &[String]) -> Vec<u8> {
    lines.join("\n").into_bytes()
}

// ── Retrieval commands ──────────────────────────────────────────────────────

/// One retrieval-side command. A line without a colon is the plain
/// address-list form; everything else is `KEYWORD:arg[:arg]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Plain address: list stored messages for that recipient.
    List { recipient: String },
    /// Soft delete; retention window in minutes (server default if absent).
    Delete { id: String, minutes: Option<i64> },
    HardDelete { id: String },
    Undelete { id: String },
    Retain { id: String, days: i64 },
    Export { address: String },
    /// Account-mode login preamble (legacy registry authentication).
    Login { address: String, password: String },
}

impl Command {
    pub fn parse(line: &str) -> Result<Command, WireError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(WireError::Malformed("empty command".into()));
        }
        let Some((keyword, rest)) = line.split_once(':') else {
            return Ok(Command::List {
                recipient: line.to_string(),
            });
        };
        match keyword {
            "DELETE" => match rest.split_once(':') {
                None => Ok(Command::Delete {
                    id: require_arg(rest, "message id")?,
                    minutes: None,
                }),
                Some((id, minutes)) => {
                    let minutes: i64 = minutes.parse().map_err(|_| {
                        WireError::Malformed(format!("bad retention minutes {minutes:?}"))
                    })?;
                    Ok(Command::Delete {
                        id: require_arg(id, "message id")?,
                        minutes: Some(minutes),
                    })
                }
            },
            "HARD_DELETE" => Ok(Command::HardDelete {
                id: require_arg(rest, "message id")?,
            }),
            "UNDELETE" => Ok(Command::Undelete {
                id: require_arg(rest, "message id")?,
            }),
            "RETAIN" => {
                let (id, days) = rest
                    .split_once(':')
                    .ok_or_else(|| WireError::Malformed("RETAIN needs <id>:<days>".into()))?;
                let days: i64 = days
                    .parse()
                    .map_err(|_| WireError::Malformed(format!("bad retention days {days:?}")))?;
                Ok(Command::Retain {
                    id: require_arg(id, "message id")?,
                    days,
                })
            }
            "EXPORT" => Ok(Command::Export {
                address: require_arg(rest, "address")?,
            }),
            "LOGIN" => {
                let (address, password) = rest
                    .split_once(':')
                    .ok_or_else(|| WireError::Malformed("LOGIN needs <address>:<password>".into()))?;
                Ok(Command::Login {
                    address: require_arg(address, "address")?,
                    password: password.to_string(),
                })
            }
            other => Err(WireError::Malformed(format!("unknown keyword {other:?}"))),
        }
    }

    /// The exact line a client sends for this command.
    pub fn render(&self) -> String {
        match self {
            Command::List { recipient } => recipient.clone(),
            Command::Delete { id, minutes: None } => format!("DELETE:{id}"),
            Command::Delete {
                id,
                minutes: Some(m),
            } => format!("DELETE:{id}:{m}"),
            Command::HardDelete { id } => format!("HARD_DELETE:{id}"),
            Command::Undelete { id } => format!("UNDELETE:{id}"),
            Command::Retain { id, days } => format!("RETAIN:{id}:{days}"),
            Command::Export { address } => format!("EXPORT:{address}"),
            Command::Login { address, password } => format!("LOGIN:{address}:{password}"),
        }
    }
}

fn require_arg(value: &str, what: &str) -> Result<String, WireError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(WireError::Malformed(format!("missing {what}")));
    }
    Ok(value.to_string())
}

/// `<command>\n<code>\n`, signed with the shared key.
pub fn build_command(command: &Command, key: &AuthCodeKey) -> Vec<u8> {
    let line = command.render();
    let code = key.sign(line.as_bytes());
    format!("{line}\n{code}\n").into_bytes()
}

// ── Submission frames ───────────────────────────────────────────────────────

/// Parsed (possibly incomplete) submission payload. Unknown lines are
/// ignored; absent or undecodable fields stay `None` and the handler
/// rejects the frame as a whole.
#[derive(Debug, Default)]
pub struct SubmissionFrame {
    pub sender: Option<String>,
    pub recipients: Vec<String>,
    pub encrypted_key: Option<Vec<u8>>,
    pub iv: Option<Vec<u8>>,
    pub ciphertext: Option<Vec<u8>>,
}

impl SubmissionFrame {
    pub fn parse(lines: &[String]) -> SubmissionFrame {
        let mut frame = SubmissionFrame::default();
        for line in lines {
            if let Some(rest) = line.strip_prefix(HEADER_TO) {
                frame.recipients = rest
                    .split(',')
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty())
                    .collect();
            } else if let Some(rest) = line.strip_prefix(HEADER_FROM) {
                let sender = rest.trim();
                if !sender.is_empty() {
                    frame.sender = Some(sender.to_string());
                }
            } else if let Some(rest) = line.strip_prefix(HEADER_KEY) {
                frame.encrypted_key = b64_decode_padded(rest);
            } else if let Some(rest) = line.strip_prefix(HEADER_IV) {
                frame.iv = b64_decode_padded(rest);
            } else if let Some(rest) = line.strip_prefix(HEADER_MESSAGE) {
                frame.ciphertext = b64_decode_padded(rest);
            }
        }
        frame
    }

    pub fn is_complete(&self) -> bool {
        self.sender.is_some()
            && !self.recipients.is_empty()
            && self.encrypted_key.is_some()
            && self.iv.is_some()
            && self.ciphertext.is_some()
    }
}

/// Build the full signed submission frame a client sends.
pub fn build_submission(
    sender: &str,
    recipients: &[String],
    parts: &EnvelopeParts,
    key: &AuthCodeKey,
) -> Vec<u8> {
    let payload = format!(
        "{HEADER_FROM} {sender}\n{HEADER_TO} {}\n{HEADER_KEY} {}\n{HEADER_IV} {}\n{HEADER_MESSAGE} {}",
        recipients.join(", "),
        b64_encode(&parts.encrypted_key),
        b64_encode(&parts.iv),
        b64_encode(&parts.ciphertext),
    );
    let code = key.sign(payload.as_bytes());
    format!("{payload}\n{code}\n").into_bytes()
}
