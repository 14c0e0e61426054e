//! In-memory implementation of the queue store.
//!
//! Queues live in a concurrent map; each queue is guarded by its own mutex, which is
//! what makes a pop atomic. Nothing survives the process. Primarily used for testing
//! and for embedding the consumer without a database.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
};

use futures_util::future::BoxFuture;
use snafu::OptionExt;

use crate::{
    config::{Delay, VisibilityTimeout},
    error::{Error, QueueExistsSnafu, QueueNotFoundSnafu},
    message::{from_millis, now_millis, Message, MessageId, QueueMetric},
};

use super::{retain_found, QueueStore};

struct Stored {
    read_count: i64,
    enqueued_at: i64,
    visible_at: i64,
    payload: String,
}

impl Stored {
    fn to_message(&self, id: MessageId) -> Message {
        Message {
            id,
            read_count: self.read_count,
            enqueued_at: from_millis(self.enqueued_at),
            visible_at: from_millis(self.visible_at),
            payload: self.payload.clone(),
        }
    }
}

#[derive(Default)]
struct MemoryQueue {
    last_id: MessageId,
    total_messages: i64,
    messages: BTreeMap<MessageId, Stored>,
    archive: BTreeMap<MessageId, Stored>,
}

impl MemoryQueue {
    fn push(&mut self, payload: &str, delay: Delay, now: i64) -> MessageId {
        self.last_id += 1;
        self.total_messages += 1;
        self.messages.insert(
            self.last_id,
            Stored {
                read_count: 0,
                enqueued_at: now,
                visible_at: now + delay.as_millis(),
                payload: payload.to_owned(),
            },
        );
        self.last_id
    }

    fn visible(&self, now: i64) -> impl Iterator<Item = MessageId> + '_ {
        self.messages
            .iter()
            .filter(move |(_, msg)| msg.visible_at <= now)
            .map(|(id, _)| *id)
    }

    fn archive(&mut self, id: MessageId) -> bool {
        match self.messages.remove(&id) {
            Some(msg) => {
                self.archive.insert(id, msg);
                true
            }
            None => false,
        }
    }
}

/// Process-local queue store.
#[derive(Clone, Default)]
pub struct InMemoryQueueStore {
    queues: Arc<papaya::HashMap<String, Arc<Mutex<MemoryQueue>>>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store with the given queues already provisioned.
    pub fn with_queues<I, S>(queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        {
            let map = store.queues.pin();
            for queue in queues {
                map.insert(queue.into(), Arc::default());
            }
        }
        store
    }

    fn queue(&self, queue: &str) -> Result<Arc<Mutex<MemoryQueue>>, Error> {
        self.queues
            .pin()
            .get(queue)
            .cloned()
            .context(QueueNotFoundSnafu { queue })
    }

    fn with_queue<T>(&self, queue: &str, f: impl FnOnce(&mut MemoryQueue) -> T) -> Result<T, Error> {
        let queue = self.queue(queue)?;
        let mut guard = queue.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&mut guard))
    }

    /// Number of archived messages for a queue.
    pub fn archived_count(&self, queue: &str) -> Result<usize, Error> {
        self.with_queue(queue, |q| q.archive.len())
    }
}

impl QueueStore for InMemoryQueueStore {
    fn create_queue<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            match self.queues.pin().try_insert(queue.to_owned(), Arc::default()) {
                Ok(_) => Ok(()),
                Err(_) => QueueExistsSnafu { queue }.fail(),
            }
        })
    }

    fn drop_queue<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<bool, Error>> {
        Box::pin(async move { Ok(self.queues.pin().remove(queue).is_some()) })
    }

    fn list_queues(&self) -> BoxFuture<'_, Result<Vec<String>, Error>> {
        Box::pin(async move {
            let mut names: Vec<String> = self.queues.pin().keys().cloned().collect();
            names.sort();
            Ok(names)
        })
    }

    fn enqueue<'a>(
        &'a self,
        queue: &'a str,
        payload: &'a str,
        delay: Delay,
    ) -> BoxFuture<'a, Result<Option<MessageId>, Error>> {
        Box::pin(async move { self.with_queue(queue, |q| Some(q.push(payload, delay, now_millis()))) })
    }

    fn enqueue_batch<'a>(
        &'a self,
        queue: &'a str,
        payloads: &'a [String],
        delay: Delay,
    ) -> BoxFuture<'a, Result<Vec<MessageId>, Error>> {
        Box::pin(async move {
            let now = now_millis();
            self.with_queue(queue, |q| {
                payloads
                    .iter()
                    .map(|payload| q.push(payload, delay, now))
                    .collect()
            })
        })
    }

    fn read<'a>(
        &'a self,
        queue: &'a str,
        visibility_timeout: VisibilityTimeout,
        count: usize,
    ) -> BoxFuture<'a, Result<Vec<Message>, Error>> {
        Box::pin(async move {
            let now = now_millis();
            self.with_queue(queue, |q| {
                let ids: Vec<MessageId> = q.visible(now).take(count).collect();
                ids.into_iter()
                    .filter_map(|id| {
                        let msg = q.messages.get_mut(&id)?;
                        msg.read_count += 1;
                        msg.visible_at = now + visibility_timeout.as_millis();
                        Some(msg.to_message(id))
                    })
                    .collect()
            })
        })
    }

    fn pop<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<Option<Message>, Error>> {
        Box::pin(async move {
            let now = now_millis();
            self.with_queue(queue, |q| {
                let id = q.visible(now).next()?;
                let mut msg = q.messages.remove(&id)?;
                msg.read_count += 1;
                Some(msg.to_message(id))
            })
        })
    }

    fn delete<'a>(&'a self, queue: &'a str, id: MessageId) -> BoxFuture<'a, Result<bool, Error>> {
        Box::pin(async move { self.with_queue(queue, |q| q.messages.remove(&id).is_some()) })
    }

    fn delete_batch<'a>(
        &'a self,
        queue: &'a str,
        ids: &'a [MessageId],
    ) -> BoxFuture<'a, Result<Vec<MessageId>, Error>> {
        Box::pin(async move {
            let deleted = self.with_queue(queue, |q| {
                ids.iter()
                    .filter(|id| q.messages.remove(*id).is_some())
                    .copied()
                    .collect::<Vec<_>>()
            })?;
            Ok(retain_found(ids, &deleted))
        })
    }

    fn archive<'a>(&'a self, queue: &'a str, id: MessageId) -> BoxFuture<'a, Result<bool, Error>> {
        Box::pin(async move { self.with_queue(queue, |q| q.archive(id)) })
    }

    fn archive_batch<'a>(
        &'a self,
        queue: &'a str,
        ids: &'a [MessageId],
    ) -> BoxFuture<'a, Result<Vec<MessageId>, Error>> {
        Box::pin(async move {
            let archived = self.with_queue(queue, |q| {
                ids.iter()
                    .filter(|id| q.archive(**id))
                    .copied()
                    .collect::<Vec<_>>()
            })?;
            Ok(retain_found(ids, &archived))
        })
    }

    fn metrics<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<QueueMetric, Error>> {
        Box::pin(async move {
            let now = now_millis();
            self.with_queue(queue, |q| {
                let age = |at: i64| (now - at).max(0) / 1000;
                QueueMetric {
                    queue_name: queue.to_owned(),
                    queue_length: q.messages.len() as i64,
                    newest_msg_age_sec: q.messages.values().map(|m| m.enqueued_at).max().map(age),
                    oldest_msg_age_sec: q.messages.values().map(|m| m.enqueued_at).min().map(age),
                    total_messages: q.total_messages,
                    scrape_time: from_millis(now),
                }
            })
        })
    }
}
