//! Serialized execution lane for SDP-mutating work
//!
//! Every operation that reads or writes a connection's local/remote
//! description runs through one [`FifoScheduler`]. Tasks are enqueued at call
//! time and run one at a time, in call order, on a dedicated worker task.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, trace};

use crate::error::{AppError, Result};

type Job = BoxFuture<'static, ()>;

/// FIFO task scheduler
///
/// A failed or panicking task settles its own future with an error; the
/// queue keeps going. Dropping the returned future does not cancel the task.
#[derive(Clone)]
pub struct FifoScheduler {
    tx: mpsc::UnboundedSender<Job>,
}

impl FifoScheduler {
    /// Start a scheduler; must be called inside a tokio runtime
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            trace!("Scheduler lane stopped");
        });

        Self { tx }
    }

    /// Queue `task` behind everything scheduled before it
    ///
    /// The task is enqueued before this function returns, so call order is
    /// execution order even if the returned future is polled later or never.
    pub fn schedule<T, F, Fut>(&self, task: F) -> impl Future<Output = Result<T>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();

        let job: Job = Box::pin(async move {
            let outcome = match AssertUnwindSafe(task()).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!("Scheduled task panicked");
                    Err(AppError::Internal("scheduled task panicked".to_string()))
                }
            };
            // Nobody may be waiting any more (fire-and-forget callers)
            let _ = done_tx.send(outcome);
        });

        let queued = self.tx.send(job).is_ok();

        async move {
            if !queued {
                return Err(AppError::Closed);
            }
            done_rx.await.map_err(|_| AppError::Closed)?
        }
    }
}

impl Default for FifoScheduler {
    fn default() -> Self {
        Self::new()
    }
}
