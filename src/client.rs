//! The queue client.
//!
//! [`QueueClient`] is the public contract over a [`QueueStore`]. It validates every
//! input before the store is touched, fills in the configured default delay and
//! visibility timeout, and layers typed sends and pops over the raw JSON primitives.
//!
//! Batch delete and archive return the ids that were actually removed. A shorter
//! result than the request is not an error: the missing ids were already gone, most
//! likely deleted by another consumer after their lease expired.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use snafu::{OptionExt, ResultExt};

use crate::{
    config::{Delay, QueueConfig, VisibilityTimeout},
    error::{DecodeSnafu, EncodeSnafu, Error, MissingMessageIdSnafu},
    message::{Message, MessageId, QueueMetric},
    store::QueueStore,
};

pub struct QueueClient<S> {
    store: Arc<S>,
    config: QueueConfig,
}

impl<S> Clone for QueueClient<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
        }
    }
}

fn validate_queue_name(queue: &str) -> Result<(), Error> {
    if queue.trim().is_empty() {
        return Err(Error::invalid_parameter(
            "name of the queue must not be empty",
        ));
    }
    Ok(())
}

fn is_json(payload: &str) -> bool {
    serde_json::from_str::<serde::de::IgnoredAny>(payload).is_ok()
}

impl<S: QueueStore> QueueClient<S> {
    pub fn new(store: S, config: QueueConfig) -> Self {
        Self {
            store: Arc::new(store),
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn check_payload(&self, payload: &str) -> Result<(), Error> {
        if !self.config.check_message {
            return Ok(());
        }
        if payload.trim().is_empty() {
            return Err(Error::invalid_parameter("message should not be empty"));
        }
        if !is_json(payload) {
            return Err(Error::invalid_parameter("message should be in JSON format"));
        }
        Ok(())
    }

    pub async fn create_queue(&self, queue: &str) -> Result<(), Error> {
        validate_queue_name(queue)?;
        self.store.create_queue(queue).await?;
        tracing::info!(queue, "Created queue");
        Ok(())
    }

    /// Drops a queue and everything in it, returning whether it existed.
    pub async fn drop_queue(&self, queue: &str) -> Result<bool, Error> {
        validate_queue_name(queue)?;
        self.store.drop_queue(queue).await
    }

    /// Sends a wire-ready JSON payload.
    ///
    /// `delay` defaults to the configured delay.
    pub async fn send(
        &self,
        queue: &str,
        payload: &str,
        delay: Option<Delay>,
    ) -> Result<MessageId, Error> {
        validate_queue_name(queue)?;
        self.check_payload(payload)?;

        let delay = delay.unwrap_or(self.config.delay);
        let id = self
            .store
            .enqueue(queue, payload, delay)
            .await?
            .context(MissingMessageIdSnafu { queue })?;

        tracing::trace!(queue, id, delay = delay.seconds(), "Sent message");

        Ok(id)
    }

    /// Encodes `message` as JSON and sends it.
    pub async fn send_json<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        message: &T,
        delay: Option<Delay>,
    ) -> Result<MessageId, Error> {
        let payload = serde_json::to_string(message).context(EncodeSnafu { queue })?;
        self.send(queue, &payload, delay).await
    }

    /// Sends every payload with the same delay.
    ///
    /// The whole batch is validated before anything is sent: one bad payload rejects
    /// the batch.
    pub async fn send_batch<P: AsRef<str>>(
        &self,
        queue: &str,
        payloads: &[P],
        delay: Option<Delay>,
    ) -> Result<Vec<MessageId>, Error> {
        validate_queue_name(queue)?;
        for payload in payloads {
            self.check_payload(payload.as_ref())?;
        }

        if payloads.is_empty() {
            return Ok(Vec::new());
        }

        let payloads: Vec<String> = payloads.iter().map(|p| p.as_ref().to_owned()).collect();
        let delay = delay.unwrap_or(self.config.delay);

        let ids = self.store.enqueue_batch(queue, &payloads, delay).await?;
        if ids.len() != payloads.len() {
            return MissingMessageIdSnafu { queue }.fail();
        }

        Ok(ids)
    }

    /// Encodes every message as JSON and sends them as one batch.
    pub async fn send_batch_json<T: Serialize>(
        &self,
        queue: &str,
        messages: &[T],
        delay: Option<Delay>,
    ) -> Result<Vec<MessageId>, Error> {
        let payloads = messages
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()
            .context(EncodeSnafu { queue })?;
        self.send_batch(queue, &payloads, delay).await
    }

    /// Leases one message without removing it.
    ///
    /// Until `visibility_timeout` (default: the configured one) elapses, the message is
    /// hidden from every other read and pop.
    pub async fn read(
        &self,
        queue: &str,
        visibility_timeout: Option<VisibilityTimeout>,
    ) -> Result<Option<Message>, Error> {
        Ok(self
            .read_batch(queue, visibility_timeout, 1)
            .await?
            .into_iter()
            .next())
    }

    /// Leases up to `count` messages.
    pub async fn read_batch(
        &self,
        queue: &str,
        visibility_timeout: Option<VisibilityTimeout>,
        count: usize,
    ) -> Result<Vec<Message>, Error> {
        validate_queue_name(queue)?;
        if count == 0 {
            return Err(Error::invalid_parameter(
                "number of messages to read must be positive",
            ));
        }

        let visibility_timeout = visibility_timeout.unwrap_or(self.config.visibility_timeout);
        let mut messages = self.store.read(queue, visibility_timeout, count).await?;
        messages.truncate(count);

        Ok(messages)
    }

    /// Leases and removes the oldest visible message.
    pub async fn pop(&self, queue: &str) -> Result<Option<Message>, Error> {
        validate_queue_name(queue)?;
        self.store.pop(queue).await
    }

    /// Pops a message and decodes its payload into `T`.
    ///
    /// The message is removed even when decoding fails.
    pub async fn pop_as<T: DeserializeOwned>(&self, queue: &str) -> Result<Option<T>, Error> {
        match self.pop(queue).await? {
            Some(message) => {
                let value = message
                    .decode()
                    .context(DecodeSnafu { queue, id: message.id })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn delete(&self, queue: &str, id: MessageId) -> Result<bool, Error> {
        validate_queue_name(queue)?;
        self.store.delete(queue, id).await
    }

    /// Deletes every listed message, returning the ids that were actually deleted.
    pub async fn delete_batch(
        &self,
        queue: &str,
        ids: &[MessageId],
    ) -> Result<Vec<MessageId>, Error> {
        validate_queue_name(queue)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let deleted = self.store.delete_batch(queue, ids).await?;
        if deleted.len() != ids.len() {
            tracing::warn!(
                queue,
                requested = ids.len(),
                deleted = deleted.len(),
                "Some messages were not deleted"
            );
        }

        Ok(deleted)
    }

    pub async fn archive(&self, queue: &str, id: MessageId) -> Result<bool, Error> {
        validate_queue_name(queue)?;
        self.store.archive(queue, id).await
    }

    /// Archives every listed message, returning the ids that were actually archived.
    pub async fn archive_batch(
        &self,
        queue: &str,
        ids: &[MessageId],
    ) -> Result<Vec<MessageId>, Error> {
        validate_queue_name(queue)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let archived = self.store.archive_batch(queue, ids).await?;
        if archived.len() != ids.len() {
            tracing::warn!(
                queue,
                requested = ids.len(),
                archived = archived.len(),
                "Some messages were not archived"
            );
        }

        Ok(archived)
    }

    pub async fn list_queues(&self) -> Result<Vec<String>, Error> {
        self.store.list_queues().await
    }

    pub async fn metrics(&self, queue: &str) -> Result<QueueMetric, Error> {
        validate_queue_name(queue)?;
        self.store.metrics(queue).await
    }

    /// Metrics for every queue, in queue-name order.
    pub async fn all_metrics(&self) -> Result<Vec<QueueMetric>, Error> {
        let mut metrics = Vec::new();
        for queue in self.list_queues().await? {
            metrics.push(self.store.metrics(&queue).await?);
        }
        Ok(metrics)
    }
}
