//! Drain-and-dispatch consumer.
//!
//! Each tick pops messages from one queue until it reports empty, decodes every
//! payload and hands it to a [`Dispatcher`]. Ticks are scheduled with a fixed delay
//! measured from the end of the previous tick, so at most one drain per consumer is
//! ever running and a slow drain simply pushes the next one back.
//!
//! Throughput is sampled every `sample_every` messages and once at the end of every
//! tick that processed anything; the best and worst rates seen across ticks are kept
//! in a shared [`ThroughputStats`].

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::{
    client::QueueClient,
    config::DecodeFailurePolicy,
    dispatcher::{DispatchStats, Dispatcher},
    error::Error,
    store::QueueStore,
};

/// Running best, worst and latest dequeue rates, in messages per second.
///
/// Updated with compare-and-swap so any number of readers may observe it while the
/// consumer records.
#[derive(Debug)]
pub struct ThroughputStats {
    best: AtomicU64,
    worst: AtomicU64,
    current: AtomicU64,
    samples: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputSnapshot {
    pub best: f64,
    pub worst: f64,
    pub current: f64,
    pub samples: u64,
}

impl Default for ThroughputStats {
    fn default() -> Self {
        Self {
            best: AtomicU64::new(0f64.to_bits()),
            worst: AtomicU64::new(f64::INFINITY.to_bits()),
            current: AtomicU64::new(0f64.to_bits()),
            samples: AtomicU64::new(0),
        }
    }
}

fn update_f64(cell: &AtomicU64, rate: f64, replace: impl Fn(f64, f64) -> bool) {
    let _ = cell.fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
        replace(rate, f64::from_bits(bits)).then_some(rate.to_bits())
    });
}

impl ThroughputStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, rate: f64) -> ThroughputSnapshot {
        update_f64(&self.best, rate, |new, old| new > old);
        update_f64(&self.worst, rate, |new, old| new < old);
        self.current.store(rate.to_bits(), Ordering::Release);
        self.samples.fetch_add(1, Ordering::AcqRel);

        ThroughputSnapshot {
            best: f64::from_bits(self.best.load(Ordering::Acquire)),
            worst: f64::from_bits(self.worst.load(Ordering::Acquire)),
            current: rate,
            samples: self.samples.load(Ordering::Acquire),
        }
    }

    /// `None` until the first sample is recorded.
    pub fn snapshot(&self) -> Option<ThroughputSnapshot> {
        let samples = self.samples.load(Ordering::Acquire);
        if samples == 0 {
            return None;
        }

        Some(ThroughputSnapshot {
            best: f64::from_bits(self.best.load(Ordering::Acquire)),
            worst: f64::from_bits(self.worst.load(Ordering::Acquire)),
            current: f64::from_bits(self.current.load(Ordering::Acquire)),
            samples,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    /// Taken every `sample_every` messages while draining
    Interim,
    /// Taken once the queue reported empty
    Final,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputSample {
    pub kind: SampleKind,
    pub processed: u64,
    pub rate: f64,
    pub best: f64,
    pub worst: f64,
}

/// Outcome of a single drain tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Messages handed to the dispatcher
    pub processed: u64,
    /// Messages dropped because their payload did not decode
    pub decode_failures: u64,
    pub samples: Vec<ThroughputSample>,
}

impl DrainReport {
    /// Rate over the whole tick, if anything was processed.
    pub fn rate(&self) -> Option<f64> {
        self.samples
            .iter()
            .rev()
            .find(|s| s.kind == SampleKind::Final)
            .map(|s| s.rate)
    }

    pub fn interim_samples(&self) -> impl Iterator<Item = &ThroughputSample> {
        self.samples.iter().filter(|s| s.kind == SampleKind::Interim)
    }
}

pub struct Consumer<S, T> {
    client: QueueClient<S>,
    queue: String,
    dispatcher: Dispatcher<T>,
    stats: Arc<ThroughputStats>,
    poll_interval: Duration,
    sample_every: u64,
    decode_failure: DecodeFailurePolicy,
}

#[bon::bon]
impl<S, T> Consumer<S, T>
where
    S: QueueStore,
    T: DeserializeOwned + Send + 'static,
{
    #[builder]
    pub fn new(
        client: QueueClient<S>,
        #[builder(into)] queue: String,
        dispatcher: Dispatcher<T>,
        /// Delay between the end of one tick and the start of the next
        #[builder(default = Duration::from_secs(5))]
        poll_interval: Duration,
        #[builder(default = 1000)] sample_every: u64,
        #[builder(default)] decode_failure: DecodeFailurePolicy,
    ) -> Self {
        Self {
            client,
            queue,
            dispatcher,
            stats: Arc::new(ThroughputStats::new()),
            poll_interval,
            sample_every,
            decode_failure,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn stats(&self) -> Arc<ThroughputStats> {
        self.stats.clone()
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    /// Runs one tick: pops until the queue is empty, dispatching every message.
    ///
    /// A failure ends the tick early; everything popped before it was already
    /// dispatched.
    pub async fn drain(&self) -> Result<DrainReport, Error> {
        tracing::trace!(queue = self.queue, "Checking for messages");

        let started = Instant::now();
        let mut report = DrainReport::default();

        let result = self.drain_into(&mut report, started).await;

        if report.processed > 0 {
            let sample = self.sample(SampleKind::Final, report.processed, started);
            report.samples.push(sample);
        }

        match result {
            Ok(()) => {
                if report.processed > 0 {
                    tracing::info!(
                        queue = self.queue,
                        processed = report.processed,
                        "No more messages"
                    );
                }
                Ok(report)
            }
            Err(e) => {
                tracing::error!(
                    queue = self.queue,
                    processed = report.processed,
                    "Drain tick failed: {e}"
                );
                Err(e)
            }
        }
    }

    async fn drain_into(&self, report: &mut DrainReport, started: Instant) -> Result<(), Error> {
        while let Some(message) = self.client.pop(&self.queue).await? {
            let item = match message.decode::<T>() {
                Ok(item) => item,
                Err(source) => {
                    let err = Error::Decode {
                        queue: self.queue.clone(),
                        id: message.id,
                        source,
                    };
                    match self.decode_failure {
                        DecodeFailurePolicy::Skip => {
                            report.decode_failures += 1;
                            tracing::error!(
                                queue = self.queue,
                                id = message.id,
                                read_count = message.read_count,
                                "Dropping message: {err}"
                            );
                            continue;
                        }
                        DecodeFailurePolicy::Abort => return Err(err),
                    }
                }
            };

            self.dispatcher.submit(item).await?;
            report.processed += 1;

            if self.sample_every > 0 && report.processed % self.sample_every == 0 {
                let sample = self.sample(SampleKind::Interim, report.processed, started);
                report.samples.push(sample);
            }
        }

        Ok(())
    }

    fn sample(&self, kind: SampleKind, processed: u64, started: Instant) -> ThroughputSample {
        let elapsed = started.elapsed().as_secs_f64();
        let rate = if elapsed <= f64::EPSILON {
            processed as f64
        } else {
            processed as f64 / elapsed
        };

        let snapshot = self.stats.record(rate);

        tracing::info!(
            queue = self.queue,
            best = snapshot.best,
            worst = snapshot.worst,
            current = rate,
            processed,
            "Dequeue msg/sec"
        );

        ThroughputSample {
            kind,
            processed,
            rate,
            best: snapshot.best,
            worst: snapshot.worst,
        }
    }

    /// Drains on a fixed delay until `shutdown` is cancelled.
    ///
    /// A tick already in progress is allowed to finish; afterwards the dispatcher stops
    /// accepting work and is given `shutdown_timeout` to finish what it holds.
    pub async fn run(self, shutdown: CancellationToken, shutdown_timeout: Duration) -> DispatchStats {
        tracing::info!(
            queue = self.queue,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Consumer started"
        );

        while !shutdown.is_cancelled() {
            // failures are logged by drain and never stop the schedule
            let _ = self.drain().await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        tracing::info!(queue = self.queue, "Consumer stopping");

        self.dispatcher.shutdown(shutdown_timeout).await
    }
}
