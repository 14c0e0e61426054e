//! Message and metric types exchanged with the queue store.
//!
//! A [`Message`] is created by a send, leased (its `read_count` incremented and its
//! `visible_at` pushed forward) by every read or pop, and finally removed by a delete,
//! archive or pop. Until one of those happens the message becomes visible again once
//! its lease runs out, which is what makes delivery at-least-once.

use chrono::{DateTime, TimeZone, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Store-assigned identifier of a message, unique within its queue.
pub type MessageId = i64;

/// A message leased from a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Identifier assigned at send time
    pub id: MessageId,
    /// Number of times the message has been handed to a reader, this lease included
    pub read_count: i64,
    /// When the message was sent
    pub enqueued_at: DateTime<Utc>,
    /// When the message may be leased again
    pub visible_at: DateTime<Utc>,
    /// The serialized JSON document
    pub payload: String,
}

impl Message {
    /// Decodes the payload into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }

    /// A message leased more often than `threshold` without being removed is most
    /// likely failing every time it is processed.
    pub fn is_poison(&self, threshold: i64) -> bool {
        self.read_count > threshold
    }
}

/// Point-in-time snapshot of a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetric {
    pub queue_name: String,
    pub queue_length: i64,
    /// Age in seconds of the most recently sent message, `None` when the queue is empty
    pub newest_msg_age_sec: Option<i64>,
    /// Age in seconds of the oldest message, `None` when the queue is empty
    pub oldest_msg_age_sec: Option<i64>,
    /// Messages ever sent to the queue
    pub total_messages: i64,
    pub scrape_time: DateTime<Utc>,
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Customer {
        customer: String,
        qty: u32,
    }

    fn message(payload: &str, read_count: i64) -> Message {
        Message {
            id: 1,
            read_count,
            enqueued_at: from_millis(0),
            visible_at: from_millis(0),
            payload: payload.to_owned(),
        }
    }

    #[test]
    fn test_decode_payload() {
        let msg = message(r#"{"customer":"John","qty":100}"#, 1);
        assert_eq!(
            msg.decode::<Customer>().unwrap(),
            Customer {
                customer: "John".to_owned(),
                qty: 100
            }
        );
    }

    #[test]
    fn test_decode_shape_mismatch() {
        let msg = message(r#"{"customer":"John"}"#, 1);
        assert!(msg.decode::<Customer>().is_err());
    }

    #[test]
    fn test_poison_threshold() {
        assert!(!message("{}", 3).is_poison(3));
        assert!(message("{}", 4).is_poison(3));
    }

    #[test]
    fn test_millis_round_trip() {
        let now = now_millis();
        assert_eq!(from_millis(now).timestamp_millis(), now);
    }
}
