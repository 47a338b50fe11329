use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use sealdrop_core::authcode::AuthCodeKey;
use sealdrop_core::config::{ServerConfig, StoreEndpoint};
use sealdrop_core::keys;
use sealdrop_core::registry::UserRegistry;
use sealdrop_core::store::{MemoryStore, MessageStore, ReplicatedStore, SqliteStore};

use sealdrop_server::state::{ProtocolSettings, ServerState};
use sealdrop_server::{retrieval, submission, tasks, tls};

#[derive(Parser, Debug)]
#[command(author, version, about = "Sealdrop message server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the submission and retrieval listeners
    Run {
        #[arg(long, default_value = "sealdrop.json")]
        config: PathBuf,
    },
    /// Provision an RSA key pair for an address
    Keygen {
        address: String,
        #[arg(long, default_value = "keys")]
        key_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run_command(config).await,
        Commands::Keygen { address, key_dir } => keygen_command(&address, key_dir),
    }
}

fn keygen_command(address: &str, key_dir: PathBuf) -> Result<()> {
    let (private_path, public_path) = keys::provision(&key_dir, address)?;
    println!("Private key: {}", private_path.display());
    println!("Public key:  {}", public_path.display());
    Ok(())
}

async fn run_command(config_path: PathBuf) -> Result<()> {
    let config = ServerConfig::load(&config_path)
        .with_context(|| format!("load config {}", config_path.display()))?;

    // Shared secret: environment first, config fallback, otherwise fatal.
    let auth = match (AuthCodeKey::from_env(), &config.auth_key_hex) {
        (Ok(key), _) => key,
        (Err(_), Some(hex_key)) => AuthCodeKey::from_hex(hex_key)?,
        (Err(e), None) => return Err(e.into()),
    };

    let primary = open_store("primary", &config.stores.primary).await?;
    let backup = open_store("backup", &config.stores.backup).await?;
    let store = Arc::new(ReplicatedStore::new(primary, backup));

    let state = Arc::new(ServerState {
        auth,
        store: store.clone(),
        registry: Arc::new(UserRegistry::new()),
        settings: ProtocolSettings::from(&config),
    });

    let acceptor = tls::load_acceptor(&config.tls.cert_path, &config.tls.key_path)?;

    let (reconcile_task, reconcile_handle) =
        tasks::spawn_reconcile_loop(store.clone(), config.reconcile_interval());
    let (retention_task, retention_handle) =
        tasks::spawn_retention_loop(store.clone(), config.retention_interval());

    let submission_listener = TcpListener::bind(&config.submission_listen)
        .await
        .with_context(|| format!("bind {}", config.submission_listen))?;
    let retrieval_listener = TcpListener::bind(&config.retrieval_listen)
        .await
        .with_context(|| format!("bind {}", config.retrieval_listen))?;
    info!(
        submission = %config.submission_listen,
        retrieval = %config.retrieval_listen,
        "sealdrop server listening"
    );

    let submission_task = tokio::spawn(serve(
        submission_listener,
        acceptor.clone(),
        state.clone(),
        Role::Submission,
    ));
    let retrieval_task = tokio::spawn(serve(
        retrieval_listener,
        acceptor,
        state,
        Role::Retrieval,
    ));

    signal::ctrl_c().await?;
    info!("server stopping");
    let _ = reconcile_handle.shutdown_tx.send(true);
    let _ = retention_handle.shutdown_tx.send(true);
    submission_task.abort();
    retrieval_task.abort();
    let _ = reconcile_task.await;
    let _ = retention_task.await;
    Ok(())
}

async fn open_store(name: &str, endpoint: &StoreEndpoint) -> Result<Arc<dyn MessageStore>> {
    Ok(match endpoint {
        StoreEndpoint::Memory => Arc::new(MemoryStore::new(name)),
        StoreEndpoint::Sqlite { path } => Arc::new(
            SqliteStore::open(name, path)
                .await
                .with_context(|| format!("open {name} store at {}", path.display()))?,
        ),
    })
}

#[derive(Clone, Copy)]
enum Role {
    Submission,
    Retrieval,
}

async fn serve(listener: TcpListener, acceptor: TlsAcceptor, state: Arc<ServerState>, role: Role) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let state = state.clone();
        tokio::spawn(async move {
            let stream = match acceptor.accept(socket).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(%peer, error = %e, "TLS handshake failed");
                    return;
                }
            };
            let result = match role {
                Role::Submission => submission::handle_submission(stream, state).await,
                Role::Retrieval => retrieval::handle_retrieval(stream, state).await,
            };
            if let Err(e) = result {
                warn!(%peer, error = %e, "connection error");
            }
        });
    }
}
