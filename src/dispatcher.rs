//! Bounded worker pool for per-message processing.
//!
//! The poll loop hands items to a [`Dispatcher`] through a bounded channel and moves
//! on; a pump task takes items off the channel and runs each one on the tokio runtime
//! once one of `workers` permits is free. Slow processing therefore only ever
//! back-pressures the poller when the channel is full.
//!
//! A unit of work that fails or panics is logged and counted and never retried here:
//! redelivery is left to the queue's visibility timeout.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::{future::BoxFuture, FutureExt as _};
use tokio::{
    sync::{mpsc, Semaphore},
    task::JoinHandle,
};
use tokio_util::task::TaskTracker;

use crate::error::Error;

/// Processes one item handed over by the poll loop.
pub trait Handler<T>: Send + Sync + 'static {
    fn handle(&self, item: T) -> BoxFuture<'_, eyre::Result<()>>;
}

impl<T, F, Fut> Handler<T> for F
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = eyre::Result<()>> + Send + 'static,
{
    fn handle(&self, item: T) -> BoxFuture<'_, eyre::Result<()>> {
        Box::pin(self(item))
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of a dispatcher's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
}

impl DispatchStats {
    pub fn in_flight(&self) -> u64 {
        self.submitted
            .saturating_sub(self.completed)
            .saturating_sub(self.failed)
    }
}

pub struct Dispatcher<T> {
    sender: mpsc::Sender<T>,
    pump: JoinHandle<()>,
    tracker: TaskTracker,
    counters: Arc<Counters>,
}

#[bon::bon]
impl<T: Send + 'static> Dispatcher<T> {
    /// Starts the pool. Must be called from within a tokio runtime.
    #[builder]
    pub fn new(
        handler: Arc<dyn Handler<T>>,
        /// Maximum number of units of work running at once
        #[builder(default = 10)]
        workers: usize,
        /// Items that may wait between the poller and the pool
        #[builder(default = 1024)]
        capacity: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let tracker = TaskTracker::new();
        let counters = Arc::new(Counters::default());

        let pump = tokio::spawn(pump(
            receiver,
            handler,
            Arc::new(Semaphore::new(workers.max(1))),
            tracker.clone(),
            counters.clone(),
        ));

        Self {
            sender,
            pump,
            tracker,
            counters,
        }
    }

    /// Hands an item to the pool, waiting while the hand-off buffer is full.
    pub async fn submit(&self, item: T) -> Result<(), Error> {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.sender.send(item).await.map_err(|_| {
            self.counters.submitted.fetch_sub(1, Ordering::Relaxed);
            Error::DispatcherClosed
        })
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Stops accepting work and waits up to `timeout` for everything already submitted
    /// to finish.
    pub async fn shutdown(self, timeout: Duration) -> DispatchStats {
        let Self {
            sender,
            pump,
            tracker,
            counters,
        } = self;

        drop(sender);

        let drained = tokio::time::timeout(timeout, async {
            if let Err(e) = pump.await {
                tracing::error!("Dispatcher pump failed: {e}");
            }
            tracker.close();
            tracker.wait().await;
        })
        .await;

        let stats = DispatchStats {
            submitted: counters.submitted.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
        };

        match drained {
            Ok(()) => tracing::info!(
                completed = stats.completed,
                failed = stats.failed,
                "Dispatcher drained"
            ),
            Err(_) => tracing::warn!(
                in_flight = stats.in_flight(),
                "Dispatcher shutdown timed out with work still running"
            ),
        }

        stats
    }
}

async fn pump<T: Send + 'static>(
    mut receiver: mpsc::Receiver<T>,
    handler: Arc<dyn Handler<T>>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    counters: Arc<Counters>,
) {
    while let Some(item) = receiver.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };

        let handler = handler.clone();
        let counters = counters.clone();

        tracker.spawn(async move {
            let _permit = permit;

            match AssertUnwindSafe(handler.handle(item)).catch_unwind().await {
                Ok(Ok(())) => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!("Unit of work failed: {e:#}");
                }
                Err(_) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!("Unit of work panicked");
                }
            }
        });
    }
}
