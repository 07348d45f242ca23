//! The combined lifecycle handle: owns the actor and poll scheduler tasks
//! and links their cancellation so completion of either tears down the
//! other.

use tokio::sync::{oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};

use crate::error::Error;

/// A handle to the consumer's background tasks.
pub struct ConsumerFiber {
    actor_abort: AbortHandle,
    scheduler_abort: AbortHandle,
    shutdown: watch::Receiver<bool>,
    completion: oneshot::Receiver<Result<(), Error>>,
}

impl ConsumerFiber {
    /// Spawns the supervising task that links `actor` and `scheduler`:
    /// whichever finishes first aborts the other, and the combined outcome
    /// is available through [`ConsumerFiber::join`].
    pub(crate) fn link(
        actor: JoinHandle<()>,
        scheduler: JoinHandle<()>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let actor_abort = actor.abort_handle();
        let scheduler_abort = scheduler.abort_handle();
        let actor_abort_for_peer = scheduler.abort_handle();
        let scheduler_abort_for_peer = actor.abort_handle();
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                result = actor => {
                    actor_abort_for_peer.abort();
                    result
                }
                result = scheduler => {
                    scheduler_abort_for_peer.abort();
                    result
                }
            };
            let mapped = match outcome {
                Ok(()) => Ok(()),
                Err(join_error) if join_error.is_panic() => {
                    Err(Error::ActorPanicked(join_error.to_string()))
                }
                // Aborted, not panicked: an ordinary consequence of the
                // other task finishing first, not a failure to report.
                Err(_) => Ok(()),
            };
            let _ = done_tx.send(mapped);
        });

        Self {
            actor_abort,
            scheduler_abort,
            shutdown,
            completion: done_rx,
        }
    }

    /// Whether the consumer has already torn down.
    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Waits for the consumer's tasks to exit, in either order, and folds
    /// a panic in either into [`Error::ActorPanicked`].
    pub async fn join(self) -> Result<(), Error> {
        self.completion
            .await
            .unwrap_or(Ok(()))
    }

    /// Aborts both background tasks.
    pub fn cancel(&self) {
        self.actor_abort.abort();
        self.scheduler_abort.abort();
    }
}
