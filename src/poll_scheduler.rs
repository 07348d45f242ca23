//! The poll scheduler: enqueues a `Poll` marker into a capacity-1 queue at a
//! fixed interval, blocking on send whenever the actor has not yet drained
//! the previous one. This is the crate's dominant backpressure mechanism.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

/// Runs until `polls_tx` is closed (the actor task has gone away), at which
/// point the scheduler has nothing left to drive and returns.
pub async fn run_poll_scheduler(polls_tx: mpsc::Sender<()>, poll_interval: Duration) {
    loop {
        if polls_tx.send(()).await.is_err() {
            debug!("poll queue closed, stopping poll scheduler");
            return;
        }
        tokio::time::sleep(poll_interval).await;
    }
}
