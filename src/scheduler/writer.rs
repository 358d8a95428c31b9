//! Persistence writer: the only task that writes check outcomes.

use std::sync::Arc;
use tokio::task::JoinHandle;

use super::OutcomeReceiver;
use crate::db::{save_check, save_snapshot, DbError, Outcome, Store};

/// Spawn the writer. The handle resolves to the number of outcomes saved
/// once every sender is gone and the queue is drained.
pub fn spawn_writer(store: Arc<Store>, rx: OutcomeReceiver) -> JoinHandle<usize> {
    tokio::spawn(run_writer(store, rx))
}

/// Persist outcomes in arrival order until the channel closes.
///
/// A failed write is logged with the full outcome and skipped.
pub async fn run_writer(store: Arc<Store>, mut rx: OutcomeReceiver) -> usize {
    let mut saved = 0;

    while let Some(outcome) = rx.recv().await {
        match persist(&store, &outcome) {
            Ok(()) => saved += 1,
            Err(e) => {
                let dump = serde_json::to_string(&outcome)
                    .unwrap_or_else(|_| format!("{:?}", outcome));
                tracing::error!("Failed to save outcome {}: {}", dump, e);
            }
        }
    }

    tracing::info!("Writer stopped after saving {} outcomes", saved);
    saved
}

/// Save the result and snapshot of one outcome in a single transaction.
pub fn persist(store: &Store, outcome: &Outcome) -> Result<(), DbError> {
    store.with_connection(false, |conn| {
        if let Some(res) = outcome.result() {
            save_check(conn, res)?;
        }
        if let Some(snap) = outcome.snapshot() {
            save_snapshot(conn, snap)?;
        }
        Ok(())
    })
}
