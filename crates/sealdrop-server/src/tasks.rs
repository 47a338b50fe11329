//! Background maintenance loops.
//!
//! Reconciliation runs once at startup, then on its interval, and early
//! whenever a write wakes it. Retention enforcement runs on its own
//! interval, independent of client activity. Both loops swallow and log
//! per-pass errors; a bad pass must never stop the schedule.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use sealdrop_core::store::ReplicatedStore;

/// Control handle for one loop. Send `true` to shut it down.
pub struct LoopHandle {
    pub shutdown_tx: watch::Sender<bool>,
}

pub fn spawn_reconcile_loop(
    store: Arc<ReplicatedStore>,
    interval: Duration,
) -> (JoinHandle<()>, LoopHandle) {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "reconcile loop started");

        // Startup pass brings a restarted store pair back in sync before
        // any client traffic depends on it.
        run_reconcile_pass(&store).await;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = store.reconcile_wake().notified() => {
                    debug!("reconcile loop woken early by a write");
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("reconcile loop shutting down");
                        return;
                    }
                }
            }
            if *shutdown_rx.borrow() {
                return;
            }
            run_reconcile_pass(&store).await;
        }
    });

    (handle, LoopHandle { shutdown_tx })
}

async fn run_reconcile_pass(store: &ReplicatedStore) {
    let summary = store.reconcile(Utc::now()).await;
    if summary.skipped {
        debug!("reconcile pass skipped");
    } else if summary.copied + summary.purged + summary.resolved > 0 {
        info!(
            copied = summary.copied,
            purged = summary.purged,
            resolved = summary.resolved,
            "stores reconciled"
        );
    }
}

pub fn spawn_retention_loop(
    store: Arc<ReplicatedStore>,
    interval: Duration,
) -> (JoinHandle<()>, LoopHandle) {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "retention loop started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("retention loop shutting down");
                        return;
                    }
                }
            }
            if *shutdown_rx.borrow() {
                return;
            }
            let summary = store.enforce_retention(Utc::now()).await;
            if summary.removed > 0 {
                info!(removed = summary.removed, "expired messages purged");
            }
        }
    });

    (handle, LoopHandle { shutdown_tx })
}
