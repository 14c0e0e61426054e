//! Queue store adapters.
//!
//! A [`QueueStore`] exposes the queue primitives a backend must provide: enqueue,
//! lease, atomic pop, delete, archive and metrics, plus the administrative create
//! and drop. Adapters do no validation of their own; the
//! [`QueueClient`](crate::client::QueueClient) checks inputs before calling them.
//!
//! Two adapters are provided:
//! - [`sqlite::SqliteQueueStore`], backed by a SQLite database through sqlx
//! - [`memory::InMemoryQueueStore`], a process-local store for tests and embedding
//!
//! Operations against a queue that was never created fail with
//! [`Error::QueueNotFound`](crate::error::Error::QueueNotFound); queues are never
//! created implicitly.

use futures_util::future::BoxFuture;

use crate::{
    config::{Delay, VisibilityTimeout},
    error::Error,
    message::{Message, MessageId, QueueMetric},
};

pub mod memory;
pub mod sqlite;

pub trait QueueStore: Send + Sync + 'static {
    /// Creates an empty queue.
    ///
    /// Fails with [`Error::QueueExists`] if a queue with that name already exists.
    fn create_queue<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<(), Error>>;

    /// Drops a queue along with its messages and archive.
    ///
    /// Returns whether the queue existed.
    fn drop_queue<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<bool, Error>>;

    /// Names of all queues, sorted.
    fn list_queues(&self) -> BoxFuture<'_, Result<Vec<String>, Error>>;

    /// Adds a message that becomes visible after `delay`.
    ///
    /// # Returns
    /// The id assigned by the store, or `None` if the store did not report one
    fn enqueue<'a>(
        &'a self,
        queue: &'a str,
        payload: &'a str,
        delay: Delay,
    ) -> BoxFuture<'a, Result<Option<MessageId>, Error>>;

    /// Adds every payload with the same delay, returning ids in payload order.
    fn enqueue_batch<'a>(
        &'a self,
        queue: &'a str,
        payloads: &'a [String],
        delay: Delay,
    ) -> BoxFuture<'a, Result<Vec<MessageId>, Error>>;

    /// Leases up to `count` visible messages for `visibility_timeout`, oldest first.
    ///
    /// Every returned message has its read count incremented and stays invisible to
    /// other readers until the lease expires.
    fn read<'a>(
        &'a self,
        queue: &'a str,
        visibility_timeout: VisibilityTimeout,
        count: usize,
    ) -> BoxFuture<'a, Result<Vec<Message>, Error>>;

    /// Leases and removes the oldest visible message in one step.
    fn pop<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<Option<Message>, Error>>;

    /// Removes a message, returning whether it existed.
    fn delete<'a>(&'a self, queue: &'a str, id: MessageId) -> BoxFuture<'a, Result<bool, Error>>;

    /// Removes every listed message that exists, returning the ids actually removed.
    fn delete_batch<'a>(
        &'a self,
        queue: &'a str,
        ids: &'a [MessageId],
    ) -> BoxFuture<'a, Result<Vec<MessageId>, Error>>;

    /// Moves a message to the queue's archive, returning whether it existed.
    fn archive<'a>(&'a self, queue: &'a str, id: MessageId) -> BoxFuture<'a, Result<bool, Error>>;

    /// Archives every listed message that exists, returning the ids actually archived.
    fn archive_batch<'a>(
        &'a self,
        queue: &'a str,
        ids: &'a [MessageId],
    ) -> BoxFuture<'a, Result<Vec<MessageId>, Error>>;

    /// Computes a fresh snapshot of the queue.
    fn metrics<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<QueueMetric, Error>>;
}

/// Keeps the ids of `requested` that appear in `found`, in request order and without
/// repeats.
pub(crate) fn retain_found(requested: &[MessageId], found: &[MessageId]) -> Vec<MessageId> {
    let mut out = Vec::with_capacity(found.len());
    for id in requested {
        if found.contains(id) && !out.contains(id) {
            out.push(*id);
        }
    }
    out
}
