//! Sealdrop end-user client: submit encrypted messages, retrieve and
//! decrypt them, and manage their lifecycle.
//!
//! Certificate verification is explicit: pass `--ca` with the server's CA
//! bundle for strict checking, or `--insecure` to skip verification
//! entirely. There is no silent default.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::BufReader as StdBufReader;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, RootCertStore};
use tokio_rustls::TlsConnector;

use sealdrop_core::authcode::AuthCodeKey;
use sealdrop_core::envelope::{self, EnvelopeParts, IV_LEN};
use sealdrop_core::wire::{self, Command};

#[derive(Parser)]
#[command(name = "sealdrop", version, about = "Sealdrop client", long_about = None)]
struct Cli {
    /// Server host
    #[arg(long, global = true, default_value = "localhost")]
    host: String,

    /// CA bundle (PEM) for strict certificate verification
    #[arg(long, global = true)]
    ca: Option<PathBuf>,

    /// Skip certificate verification entirely
    #[arg(long, global = true)]
    insecure: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt a message and submit it
    Send {
        #[arg(long)]
        from: String,
        /// Repeat for multiple recipients
        #[arg(long, required = true)]
        to: Vec<String>,
        #[arg(long)]
        message: String,
        /// Recipient public key (SPKI PEM)
        #[arg(long)]
        public_key: PathBuf,
        #[arg(long, default_value_t = 2525)]
        port: u16,
    },
    /// Retrieve and decrypt stored messages
    Recv {
        #[arg(long)]
        address: String,
        /// Own private key (PKCS#8 PEM)
        #[arg(long)]
        private_key: PathBuf,
        #[arg(long, default_value_t = 2526)]
        port: u16,
    },
    /// Soft-delete a message with a retention window
    Delete {
        #[arg(long)]
        id: String,
        /// Retention minutes; server default when omitted
        #[arg(long)]
        minutes: Option<i64>,
        #[arg(long, default_value_t = 2526)]
        port: u16,
    },
    /// Permanently delete a message (refused inside a retention window)
    HardDelete {
        #[arg(long)]
        id: String,
        #[arg(long, default_value_t = 2526)]
        port: u16,
    },
    /// Reverse a soft delete
    Undelete {
        #[arg(long)]
        id: String,
        #[arg(long, default_value_t = 2526)]
        port: u16,
    },
    /// Extend retention on a message
    Retain {
        #[arg(long)]
        id: String,
        #[arg(long)]
        days: i64,
        #[arg(long, default_value_t = 2526)]
        port: u16,
    },
    /// Export every record involving an address to a JSON file
    Export {
        #[arg(long)]
        address: String,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = 2526)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let auth = AuthCodeKey::from_env()?;
    let endpoint = |port: u16| Endpoint {
        host: cli.host.clone(),
        port,
        tls: TlsOptions {
            ca: cli.ca.clone(),
            insecure: cli.insecure,
        },
        auth: auth.clone(),
    };

    match cli.command {
        Commands::Send {
            from,
            to,
            message,
            public_key,
            port,
        } => send(&endpoint(port), &from, &to, &message, &public_key).await,
        Commands::Recv {
            address,
            private_key,
            port,
        } => recv(&endpoint(port), &address, &private_key).await,
        Commands::Delete { id, minutes, port } => {
            manage(&endpoint(port), Command::Delete { id, minutes }).await
        }
        Commands::HardDelete { id, port } => {
            manage(&endpoint(port), Command::HardDelete { id }).await
        }
        Commands::Undelete { id, port } => {
            manage(&endpoint(port), Command::Undelete { id }).await
        }
        Commands::Retain { id, days, port } => {
            manage(&endpoint(port), Command::Retain { id, days }).await
        }
        Commands::Export { address, out, port } => {
            export(&endpoint(port), &address, &out).await
        }
    }
}

struct TlsOptions {
    ca: Option<PathBuf>,
    insecure: bool,
}

/// One server endpoint plus everything needed to talk to it.
struct Endpoint {
    host: String,
    port: u16,
    tls: TlsOptions,
    auth: AuthCodeKey,
}

async fn connect(endpoint: &Endpoint) -> Result<TlsStream<TcpStream>> {
    let Endpoint { host, port, tls, .. } = endpoint;
    let config = if tls.insecure {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth()
    } else {
        let ca = tls.ca.as_ref().ok_or_else(|| {
            anyhow!("provide --ca for strict verification, or opt out with --insecure")
        })?;
        let mut roots = RootCertStore::empty();
        let file = File::open(ca).with_context(|| format!("open CA bundle {}", ca.display()))?;
        for cert in rustls_pemfile::certs(&mut StdBufReader::new(file)) {
            roots.add(cert.with_context(|| format!("parse CA bundle {}", ca.display()))?)?;
        }
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    let connector = TlsConnector::from(Arc::new(config));
    let tcp = TcpStream::connect((host.as_str(), *port))
        .await
        .with_context(|| format!("connect {host}:{port}"))?;
    let server_name =
        ServerName::try_from(host.to_string()).map_err(|e| anyhow!("bad host name: {e}"))?;
    Ok(connector.connect(server_name, tcp).await?)
}

async fn send(
    endpoint: &Endpoint,
    from: &str,
    to: &[String],
    message: &str,
    public_key_path: &PathBuf,
) -> Result<()> {
    let public_key = envelope::load_public_key(public_key_path)?;
    let parts = envelope::encrypt(message.as_bytes(), &public_key)?;
    let frame = wire::build_submission(from, to, &parts, &endpoint.auth);

    let stream = connect(endpoint).await?;
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    expect_banner(&mut reader, "220").await?;
    writer.write_all(&frame).await?;
    writer.flush().await?;

    let mut response = String::new();
    reader.read_line(&mut response).await?;
    let response = response.trim();
    println!("{response}");
    if !response.starts_with("250") {
        bail!("submission rejected: {response}");
    }
    Ok(())
}

async fn recv(endpoint: &Endpoint, address: &str, private_key_path: &PathBuf) -> Result<()> {
    let private_key = envelope::load_private_key(private_key_path)?;

    let stream = connect(endpoint).await?;
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    expect_banner(&mut reader, "+OK").await?;
    let request = wire::build_command(
        &Command::List {
            recipient: address.to_string(),
        },
        &endpoint.auth,
    );
    writer.write_all(&request).await?;
    writer.flush().await?;

    let mut status = String::new();
    reader.read_line(&mut status).await?;
    let status = status.trim();
    if !status.starts_with("+OK") {
        println!("{status}");
        return Ok(());
    }
    let count: usize = status
        .split_whitespace()
        .nth(1)
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| anyhow!("unparseable count line: {status}"))?;

    let mut shown = 0usize;
    for _ in 0..count {
        let metadata_line = read_line(&mut reader).await?;
        let key_line = read_line(&mut reader).await?;
        let iv_line = read_line(&mut reader).await?;
        let message_line = read_line(&mut reader).await?;

        let metadata: serde_json::Value = match serde_json::from_str(&metadata_line) {
            Ok(value) => value,
            Err(e) => {
                eprintln!("skipping message with bad metadata: {e}");
                continue;
            }
        };

        let (Some(encrypted_key), Some(iv), Some(ciphertext)) = (
            wire::b64_decode_padded(&key_line),
            wire::b64_decode_padded(&iv_line),
            wire::b64_decode_padded(&message_line),
        ) else {
            eprintln!("skipping message with undecodable fields");
            continue;
        };

        // Size sanity per message; a bad one never aborts the rest.
        let modulus = envelope::modulus_size(&private_key);
        if encrypted_key.len() != modulus {
            eprintln!(
                "skipping message: encrypted key is {} bytes, expected {modulus}",
                encrypted_key.len()
            );
            continue;
        }
        if iv.len() != IV_LEN {
            eprintln!("skipping message: iv is {} bytes, expected {IV_LEN}", iv.len());
            continue;
        }

        let parts = EnvelopeParts {
            encrypted_key,
            iv,
            ciphertext,
        };
        match envelope::decrypt(&parts, &private_key) {
            Ok(plaintext) => {
                shown += 1;
                println!("--- message {shown} ---");
                println!("id:        {}", metadata["id"].as_str().unwrap_or(""));
                println!("from:      {}", metadata["sender"].as_str().unwrap_or(""));
                println!("timestamp: {}", metadata["timestamp"].as_str().unwrap_or(""));
                if metadata["deleted"].as_bool().unwrap_or(false) {
                    println!("state:     soft-deleted");
                }
                println!("{}", String::from_utf8_lossy(&plaintext));
            }
            Err(e) => eprintln!("skipping unreadable message: {e}"),
        }
    }
    println!("{shown} of {count} messages readable");
    Ok(())
}

async fn manage(endpoint: &Endpoint, command: Command) -> Result<()> {
    let stream = connect(endpoint).await?;
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    expect_banner(&mut reader, "+OK").await?;
    writer
        .write_all(&wire::build_command(&command, &endpoint.auth))
        .await?;
    writer.flush().await?;

    let mut response = String::new();
    reader.read_line(&mut response).await?;
    let response = response.trim();
    println!("{response}");
    if response.starts_with("-ERR") {
        bail!("command rejected: {response}");
    }
    Ok(())
}

async fn export(endpoint: &Endpoint, address: &str, out: &PathBuf) -> Result<()> {
    let stream = connect(endpoint).await?;
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    expect_banner(&mut reader, "+OK").await?;
    let request = wire::build_command(
        &Command::Export {
            address: address.to_string(),
        },
        &endpoint.auth,
    );
    writer.write_all(&request).await?;
    writer.flush().await?;

    // The server streams the document and half-closes; EOF is end-of-data.
    let mut document = Vec::new();
    reader.read_to_end(&mut document).await?;
    if document.starts_with(b"-ERR") {
        bail!("export rejected: {}", String::from_utf8_lossy(&document));
    }
    std::fs::write(out, &document)
        .with_context(|| format!("write export to {}", out.display()))?;
    println!("exported {} bytes to {}", document.len(), out.display());
    Ok(())
}

async fn read_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        bail!("connection closed mid-listing");
    }
    Ok(line.trim().to_string())
}

async fn expect_banner<R>(reader: &mut R, prefix: &str) -> Result<()>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut banner = String::new();
    reader.read_line(&mut banner).await?;
    if !banner.starts_with(prefix) {
        bail!("unexpected banner: {}", banner.trim());
    }
    Ok(())
}

/// Skip TLS certificate verification. Only installed when the user passes
/// `--insecure`; useful against self-signed development certificates.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}
