//! Single-writer execution gate.
//!
//! Every operation that reads the job queue, decides, and then calls the
//! driver runs as one unit on the stanchion. Units run one at a time in the
//! order they were submitted, so "cancel job J" and "launch job J on this
//! offer" can never interleave.
//!
//! A unit that panics does not take the gate down: the panic is contained in
//! the unit's own task, the caller gets `None`, and the next unit runs.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};

type Unit = Pin<Box<dyn Future<Output = ()> + Send>>;

const CHANNEL_CAPACITY: usize = 1024;

/// Handle to the gate. Cloning is cheap; all clones feed the same worker.
#[derive(Debug, Clone)]
pub struct Stanchion {
    tx: mpsc::Sender<Unit>,
}

impl Stanchion {
    /// Spawn the worker on the current tokio runtime. It stops once every
    /// handle has been dropped.
    pub fn start() -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(Self::run(rx));
        Self { tx }
    }

    /// Run `unit` with exclusive access and wait for its output.
    ///
    /// Returns `None` if the unit panicked or the gate has stopped. Callers
    /// must treat `None` as "could not be confirmed", never as success.
    pub async fn call<F, Fut, T>(&self, unit: F) -> Option<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let boxed: Unit = Box::pin(async move {
            let output = unit().await;
            let _ = result_tx.send(output);
        });

        if self.tx.send(boxed).await.is_err() {
            tracing::error!("Stanchion is stopped, unit not executed");
            return None;
        }
        result_rx.await.ok()
    }

    async fn run(mut rx: mpsc::Receiver<Unit>) {
        let mut executed: u64 = 0;
        while let Some(unit) = rx.recv().await {
            executed += 1;
            // Awaiting the spawned task keeps units strictly sequential while
            // isolating panics from this loop.
            if let Err(e) = tokio::spawn(unit).await {
                if e.is_panic() {
                    tracing::error!(unit = executed, "Serialized unit panicked");
                } else {
                    tracing::warn!(unit = executed, error = %e, "Serialized unit aborted");
                }
            }
        }
        tracing::debug!(executed, "Stanchion stopped");
    }
}
