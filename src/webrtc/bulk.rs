//! Bulk request dispatcher
//!
//! Coalesces same-kind requests issued within one scheduler tick into a single
//! submission. A batch opens on the first request after the dispatcher is
//! idle and is submitted on the next tick, or as soon as it reaches the
//! maximum size. Every caller of a batch receives the same aggregate result
//! and its own position within the batch.
//!
//! "One tick" is one `yield_now` of the flush task. On a current-thread
//! runtime that covers every request issued before the caller next awaits;
//! on a multi-threaded runtime another worker may run the flush early and
//! split what would have been one batch.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{AppError, Result};

/// Submission function: receives the ordered batch, returns one aggregate
pub type SubmitFn<Req, Resp> =
    Arc<dyn Fn(Vec<Req>) -> BoxFuture<'static, Result<Resp>> + Send + Sync>;

type Outcome<Resp> = std::result::Result<Arc<Resp>, Arc<AppError>>;

/// A caller's share of a submitted batch
#[derive(Debug)]
pub struct BatchSlot<Resp> {
    /// Index of the caller's item in the submitted batch
    pub position: usize,
    /// Aggregate result shared by the whole batch
    pub response: Arc<Resp>,
}

struct PendingBatch<Req, Resp> {
    id: u64,
    items: Vec<Req>,
    done: oneshot::Sender<Outcome<Resp>>,
    outcome: Shared<oneshot::Receiver<Outcome<Resp>>>,
}

struct Inner<Req, Resp> {
    name: &'static str,
    max_batch: usize,
    submit: SubmitFn<Req, Resp>,
    pending: Mutex<Option<PendingBatch<Req, Resp>>>,
    next_batch_id: AtomicU64,
}

/// Debounced batching front for one kind of request
pub struct BulkDispatcher<Req, Resp> {
    inner: Arc<Inner<Req, Resp>>,
}

impl<Req, Resp> Clone for BulkDispatcher<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Req, Resp> BulkDispatcher<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + Sync + 'static,
{
    pub fn new(name: &'static str, max_batch: usize, submit: SubmitFn<Req, Resp>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                max_batch: max_batch.max(1),
                submit,
                pending: Mutex::new(None),
                next_batch_id: AtomicU64::new(0),
            }),
        }
    }

    /// Add `item` to the open batch (opening one if needed)
    ///
    /// The item joins its batch before this function returns. A failed
    /// submission fails every caller of the batch with the same
    /// [`AppError::Batch`].
    pub fn request(&self, item: Req) -> impl Future<Output = Result<BatchSlot<Resp>>> + Send + 'static {
        self.join(item).slot()
    }

    /// Like [`request`](Self::request), but returns a handle on the batch
    /// that can be cloned and awaited independently of the caller
    pub fn join(&self, item: Req) -> BatchTicket<Resp> {
        let (position, outcome) = Inner::enqueue(&self.inner, item);
        BatchTicket { position, outcome }
    }
}

/// Membership of one item in a batch
pub struct BatchTicket<Resp> {
    position: usize,
    outcome: Shared<oneshot::Receiver<Outcome<Resp>>>,
}

impl<Resp> Clone for BatchTicket<Resp> {
    fn clone(&self) -> Self {
        Self {
            position: self.position,
            outcome: self.outcome.clone(),
        }
    }
}

impl<Resp> BatchTicket<Resp>
where
    Resp: Send + Sync + 'static,
{
    pub fn position(&self) -> usize {
        self.position
    }

    /// This item's share of the batch outcome
    pub async fn slot(self) -> Result<BatchSlot<Resp>> {
        match self.outcome.await {
            Ok(Ok(response)) => Ok(BatchSlot {
                position: self.position,
                response,
            }),
            Ok(Err(e)) => Err(AppError::Batch(e)),
            Err(_) => Err(AppError::Closed),
        }
    }

    /// Resolves once the batch has settled; `None` if it failed
    pub async fn settled(self) -> Option<Arc<Resp>> {
        match self.outcome.await {
            Ok(Ok(response)) => Some(response),
            _ => None,
        }
    }
}

impl<Req, Resp> Inner<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + Sync + 'static,
{
    fn enqueue(
        this: &Arc<Self>,
        item: Req,
    ) -> (usize, Shared<oneshot::Receiver<Outcome<Resp>>>) {
        let mut pending = this.pending.lock();

        let batch = pending.get_or_insert_with(|| {
            let id = this.next_batch_id.fetch_add(1, Ordering::Relaxed);
            let (done, rx) = oneshot::channel();
            tokio::spawn(Self::flush_after_tick(this.clone(), id));
            PendingBatch {
                id,
                items: Vec::new(),
                done,
                outcome: rx.shared(),
            }
        });

        batch.items.push(item);
        let position = batch.items.len() - 1;
        let outcome = batch.outcome.clone();

        if batch.items.len() >= this.max_batch {
            if let Some(full) = pending.take() {
                drop(pending);
                tokio::spawn(this.start(full));
            }
        }

        (position, outcome)
    }

    async fn flush_after_tick(this: Arc<Self>, id: u64) {
        tokio::task::yield_now().await;

        let batch = {
            let mut pending = this.pending.lock();
            // Otherwise already submitted by the size threshold
            if pending.as_ref().is_some_and(|batch| batch.id == id) {
                pending.take()
            } else {
                None
            }
        };

        if let Some(batch) = batch {
            this.start(batch).await;
        }
    }

    /// Call the submission function and return the future delivering its
    /// outcome
    ///
    /// Anything the submission function does before returning its future
    /// happens here, in order with other sealed batches; the rest runs when
    /// the returned future is polled.
    fn start(&self, batch: PendingBatch<Req, Resp>) -> impl Future<Output = ()> + Send + 'static {
        let PendingBatch { id, items, done, .. } = batch;
        debug!("{} batch #{} submitted with {} item(s)", self.name, id, items.len());

        let submission = (self.submit)(items);
        async move {
            let outcome = submission.await.map(Arc::new).map_err(Arc::new);
            let _ = done.send(outcome);
        }
    }
}
