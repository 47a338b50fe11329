use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

use sealdrop_balancer::{serve_class, BackendPool};
use sealdrop_core::config::BalancerConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Sealdrop connection balancer", long_about = None)]
struct Cli {
    #[arg(long, default_value = "balancer.json")]
    config: PathBuf,
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
    let config = BalancerConfig::load(&cli.config)
        .with_context(|| format!("load config {}", cli.config.display()))?;

    let submission_pool = Arc::new(BackendPool::new(
        "submission",
        config.submission_backends,
    )?);
    let retrieval_pool = Arc::new(BackendPool::new("retrieval", config.retrieval_backends)?);

    let submission_listener = TcpListener::bind(&config.submission_listen)
        .await
        .with_context(|| format!("bind {}", config.submission_listen))?;
    let retrieval_listener = TcpListener::bind(&config.retrieval_listen)
        .await
        .with_context(|| format!("bind {}", config.retrieval_listen))?;

    let submission_task = tokio::spawn(serve_class(submission_listener, submission_pool));
    let retrieval_task = tokio::spawn(serve_class(retrieval_listener, retrieval_pool));

    info!("balancer running");
    signal::ctrl_c().await?;
    info!("balancer stopping");
    submission_task.abort();
    retrieval_task.abort();
    Ok(())
}
