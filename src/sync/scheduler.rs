//! Pending batch sweeper
//!
//! A push whose request is cancelled mid-batch keeps the deltas it already
//! applied, but its batch never leaves `pending`. The sweeper finalizes
//! such batches once they are older than a grace period, using whatever
//! the ledger recorded for them.
//!
//! The grace period should exceed the longest push the server accepts. A
//! push still running when it is swept overwrites the swept status with
//! its own once it finishes.

use std::sync::Arc;
use std::time::Duration;

use super::clock::Clock;
use super::error::{SyncError, SyncResult};
use super::events::EventPublisher;
use super::ledger::BatchLedger;

/// Batches finalized per sweep
const SWEEP_PAGE_SIZE: usize = 100;

#[derive(Clone)]
pub struct PendingBatchSweeper {
    ledger: Arc<dyn BatchLedger>,
    clock: Arc<dyn Clock>,
    publisher: Arc<dyn EventPublisher>,
    grace: chrono::Duration,
    interval: Duration,
}

impl PendingBatchSweeper {
    pub fn new(
        ledger: Arc<dyn BatchLedger>,
        clock: Arc<dyn Clock>,
        publisher: Arc<dyn EventPublisher>,
        grace: chrono::Duration,
        interval: Duration,
    ) -> Self {
        Self {
            ledger,
            clock,
            publisher,
            grace,
            interval,
        }
    }

    /// Finalize stale pending batches, returning how many were finished
    pub async fn sweep_once(&self) -> SyncResult<usize> {
        let now = self.clock.now();
        let stale = self
            .ledger
            .list_pending_batches(now - self.grace, SWEEP_PAGE_SIZE)
            .await?;

        let mut finished = 0;
        for mut batch in stale {
            let events = batch.finalize(now)?;
            match self.ledger.finish_batch(&batch).await {
                Ok(()) => {
                    tracing::debug!(
                        batch_id = %batch.id(),
                        status = batch.status().as_str(),
                        "Finalized abandoned batch"
                    );
                    self.publisher.publish(&events);
                    finished += 1;
                }
                // Finished by its own request since we listed it
                Err(SyncError::InvalidState(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if finished > 0 {
            tracing::info!(count = finished, "Finalized abandoned batches");
        }

        Ok(finished)
    }

    /// Run `sweep_once` every interval until the task is aborted
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);

            loop {
                interval.tick().await;
                if let Err(e) = self.sweep_once().await {
                    tracing::warn!("Pending batch sweep failed: {}", e);
                }
            }
        })
    }
}
