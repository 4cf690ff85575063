//! Rendezvous registry of authenticated tunnel candidates.
//!
//! A bounded FIFO: the tunnel-accepting listener enqueues connections that
//! passed the handshake, and client handlers dequeue them for pairing. Only
//! connections that passed password verification and were sent OK may enter.
//! A full registry blocks the enqueue: deliberate backpressure on the
//! accept loop, not an error.

use proxyprint_net::Conn;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum DequeueError {
    /// No candidate became available in time. Counted by the caller; the
    /// overall pairing deadline decides whether to keep waiting.
    #[error("timed out waiting for a tunnel")]
    Timeout,
    /// The registry is shutting down.
    #[error("registry closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
#[error("registry closed")]
pub struct EnqueueError;

/// Bounded queue of tunnel candidates awaiting a client pairing.
///
/// Ownership of a connection transfers into the registry on enqueue and back
/// out on dequeue.
pub struct Registry {
    tx: tokio::sync::mpsc::Sender<Arc<Conn>>,
    rx: tokio::sync::Mutex<tokio::sync::mpsc::Receiver<Arc<Conn>>>,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = tokio::sync::mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Deposits an authenticated candidate, waiting for capacity if the
    /// registry is full.
    pub async fn enqueue(&self, conn: Arc<Conn>) -> Result<(), EnqueueError> {
        self.tx.send(conn).await.map_err(|_| EnqueueError)
    }

    /// Takes the next candidate, or times out.
    pub async fn dequeue_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<Arc<Conn>, DequeueError> {
        let recv = async {
            let mut rx = self.rx.lock().await;
            rx.recv().await
        };
        match tokio::time::timeout(timeout, recv).await {
            Ok(Some(conn)) => Ok(conn),
            Ok(None) => Err(DequeueError::Closed),
            Err(_) => Err(DequeueError::Timeout),
        }
    }

    /// Closes the registry; pending and future enqueues fail. Candidates
    /// still queued are drained and handed back for closing.
    pub async fn close(&self) -> Vec<Arc<Conn>> {
        let mut rx = self.rx.lock().await;
        rx.close();
        let mut leftover = Vec::new();
        while let Ok(conn) = rx.try_recv() {
            leftover.push(conn);
        }
        leftover
    }
}
