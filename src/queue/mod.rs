//! Ordered, callback-consuming queue actor.
//!
//! A [`PersistentQueue`] is a cheap handle around one or two worker tasks
//! that own the storage layer. Every push and pop is a message to a
//! worker, so operations on one lane execute strictly one at a time and
//! callers never coordinate among themselves.
//!
//! Pops are consume-then-discard: the worker peeks the head items, runs
//! the caller's async consumer, and deletes the items only after the
//! consumer returns success. A failing consumer leaves the items at the
//! head for the next pop, which is what makes delivery at-least-once.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::store::QueueLayer;

/// Hard ceiling on a push round trip.
pub const PUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Hard ceiling on a pop round trip, sized for slow consumer callbacks.
pub const POP_TIMEOUT: Duration = Duration::from_secs(30);

const MAILBOX_CAPACITY: usize = 1024;

/// Outcome of a pop call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopOutcome {
    /// Nothing was buffered; the consumer was not invoked.
    Empty,
    /// The consumer ran and this many items were removed.
    Consumed(usize),
}

type ConsumerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type Consumer<T> = Box<dyn FnOnce(Vec<T>) -> ConsumerFuture + Send>;

enum Command<T> {
    Push {
        items: Vec<T>,
        reply: oneshot::Sender<Result<()>>,
    },
    Pop {
        max: usize,
        consumer: Consumer<T>,
        reply: oneshot::Sender<Result<PopOutcome>>,
    },
    Size {
        reply: oneshot::Sender<Result<u64>>,
    },
}

/// Handle to a storage-backed FIFO queue.
///
/// Cloning the handle is cheap; all clones talk to the same workers. The
/// workers exit once every handle has been dropped.
pub struct PersistentQueue<T> {
    push_tx: mpsc::Sender<Command<T>>,
    pop_tx: mpsc::Sender<Command<T>>,
}

// Not derived: the senders clone for any `T`.
impl<T> Clone for PersistentQueue<T> {
    fn clone(&self) -> Self {
        Self {
            push_tx: self.push_tx.clone(),
            pop_tx: self.pop_tx.clone(),
        }
    }
}

impl<T> PersistentQueue<T>
where
    T: Send + 'static,
{
    /// Spawns the worker task(s) for `layer` and returns a handle.
    ///
    /// Layers that tolerate concurrent reads and writes get separate push
    /// and pop lanes, so a slow pop consumer never stalls producers.
    /// Other layers share a single lane.
    pub fn spawn<L>(layer: L) -> Self
    where
        L: QueueLayer<T>,
    {
        let layer = Arc::new(layer);
        if layer.concurrent_reads_writes() {
            let (push_tx, push_rx) = mpsc::channel(MAILBOX_CAPACITY);
            let (pop_tx, pop_rx) = mpsc::channel(MAILBOX_CAPACITY);
            tokio::spawn(run_lane(Arc::clone(&layer), push_rx));
            tokio::spawn(run_lane(layer, pop_rx));
            Self { push_tx, pop_tx }
        } else {
            let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
            tokio::spawn(run_lane(layer, rx));
            Self {
                push_tx: tx.clone(),
                pop_tx: tx,
            }
        }
    }

    /// Appends items at the tail. Resolves once the items are stored
    /// (durably, for durable layers); fails after [`PUSH_TIMEOUT`].
    pub async fn push(&self, items: Vec<T>) -> Result<()> {
        let op = async {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.push_tx
                .send(Command::Push {
                    items,
                    reply: reply_tx,
                })
                .await
                .map_err(|_| anyhow!("queue worker is gone"))?;
            reply_rx
                .await
                .map_err(|_| anyhow!("queue worker dropped the reply"))?
        };
        tokio::time::timeout(PUSH_TIMEOUT, op)
            .await
            .map_err(|_| anyhow!("queue push timed out after {PUSH_TIMEOUT:?}"))?
    }

    /// Pops up to `max` head items through `consumer`.
    ///
    /// The items are removed only if the consumer returns `Ok`; on error
    /// they stay at the head and the error is returned. An empty queue
    /// reports [`PopOutcome::Empty`] without invoking the consumer.
    /// Fails after [`POP_TIMEOUT`]; on timeout the worker may still be
    /// running the consumer, and its eventual outcome is discarded.
    pub async fn pop<F, Fut>(&self, max: usize, consumer: F) -> Result<PopOutcome>
    where
        F: FnOnce(Vec<T>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let consumer: Consumer<T> = Box::new(move |items| Box::pin(consumer(items)));
        let op = async {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.pop_tx
                .send(Command::Pop {
                    max,
                    consumer,
                    reply: reply_tx,
                })
                .await
                .map_err(|_| anyhow!("queue worker is gone"))?;
            reply_rx
                .await
                .map_err(|_| anyhow!("queue worker dropped the reply"))?
        };
        tokio::time::timeout(POP_TIMEOUT, op)
            .await
            .map_err(|_| anyhow!("queue pop timed out after {POP_TIMEOUT:?}"))?
    }

    /// Pops everything currently buffered through `consumer`.
    pub async fn pop_all<F, Fut>(&self, consumer: F) -> Result<PopOutcome>
    where
        F: FnOnce(Vec<T>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.pop(usize::MAX, consumer).await
    }

    /// Number of buffered items. Routed through the pop lane so the
    /// answer reflects every previously acknowledged operation.
    pub async fn size(&self) -> Result<u64> {
        let op = async {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.pop_tx
                .send(Command::Size { reply: reply_tx })
                .await
                .map_err(|_| anyhow!("queue worker is gone"))?;
            reply_rx
                .await
                .map_err(|_| anyhow!("queue worker dropped the reply"))?
        };
        tokio::time::timeout(POP_TIMEOUT, op)
            .await
            .map_err(|_| anyhow!("queue size timed out after {POP_TIMEOUT:?}"))?
    }
}

async fn run_lane<T, L>(layer: Arc<L>, mut rx: mpsc::Receiver<Command<T>>)
where
    T: Send + 'static,
    L: QueueLayer<T>,
{
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Push { items, reply } => {
                let res = layer.push(items).context("queue append");
                let _ = reply.send(res);
            }
            Command::Pop {
                max,
                consumer,
                reply,
            } => {
                let res = pop_once(layer.as_ref(), max, consumer).await;
                let _ = reply.send(res);
            }
            Command::Size { reply } => {
                let _ = reply.send(layer.size().context("queue size"));
            }
        }
    }
    debug!("queue lane exiting, all handles dropped");
}

async fn pop_once<T, L>(layer: &L, max: usize, consumer: Consumer<T>) -> Result<PopOutcome>
where
    T: Send + 'static,
    L: QueueLayer<T>,
{
    let size = layer.size().context("queue size")?;
    if size == 0 {
        return Ok(PopOutcome::Empty);
    }
    let take = max.min(usize::try_from(size).unwrap_or(usize::MAX));
    let items = layer.peek(take).context("queue peek")?;
    if items.is_empty() {
        return Ok(PopOutcome::Empty);
    }
    let count = items.len();
    consumer(items).await.context("queue consumer")?;
    // The consumer succeeded, only now do the items leave the store.
    layer.pop(count).context("queue discard")?;
    Ok(PopOutcome::Consumed(count))
}
