//! Round-robin connection forwarding.
//!
//! Two protocol classes (submission, retrieval), each with its own backend
//! pool and its own atomically advanced cursor, so concurrent accepts on
//! one class never skew the other. Bytes are spliced both ways by two
//! independent copy loops that are torn down together. A backend that
//! cannot be dialed costs the client its connection; there is no
//! health-aware rerouting here.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// One protocol class and its backends.
pub struct BackendPool {
    class: String,
    backends: Vec<String>,
    cursor: AtomicUsize,
}

impl BackendPool {
    pub fn new(class: &str, backends: Vec<String>) -> anyhow::Result<Self> {
        if backends.is_empty() {
            return Err(anyhow::anyhow!("{class}: backend pool is empty"));
        }
        Ok(Self {
            class: class.to_string(),
            backends,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    /// Strict round robin: connection k goes to backend k mod M.
    pub fn next_backend(&self) -> &str {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.backends.len();
        &self.backends[index]
    }
}

/// Accept loop for one class. Runs until the listener errors out.
pub async fn serve_class(listener: TcpListener, pool: Arc<BackendPool>) {
    info!(class = pool.class(), "balancer listening");
    loop {
        let (client, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(class = pool.class(), error = %e, "accept failed");
                continue;
            }
        };
        debug!(class = pool.class(), %peer, "accepted");
        let pool = pool.clone();
        tokio::spawn(async move {
            forward(client, &pool).await;
        });
    }
}

/// Splice one client connection to the next backend of its class.
pub async fn forward(client: TcpStream, pool: &BackendPool) {
    let backend_addr = pool.next_backend().to_string();
    let backend = match TcpStream::connect(&backend_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            // No failover: the client reconnects and lands on the next
            // backend in rotation.
            warn!(class = pool.class(), backend = %backend_addr, error = %e, "backend dial failed");
            return;
        }
    };
    debug!(class = pool.class(), backend = %backend_addr, "forwarding");

    let (mut client_read, mut client_write) = client.into_split();
    let (mut backend_read, mut backend_write) = backend.into_split();

    let upstream = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut client_read, &mut backend_write).await;
        let _ = backend_write.shutdown().await;
    });
    let downstream = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut backend_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
    });

    // Both halves finish (EOF propagated as a half-close) before the pair
    // is torn down, so late bytes in either direction still arrive.
    let _ = tokio::join!(upstream, downstream);
}
