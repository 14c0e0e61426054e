//! Reference workload: quote requests drained from a queue and answered by an
//! emulated market.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use rand::Rng as _;
use serde::{Deserialize, Serialize};

use crate::{
    client::QueueClient,
    dispatcher::Handler,
    error::Error,
    message::QueueMetric,
    store::QueueStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MsgType {
    NewOrderSingle,
    Quote,
    ExecutionReport,
    QuoteCancel,
    QuoteReject,
    QuoteRequest,
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
    #[default]
    None,
}

/// Simplified FIX quote request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketRequest {
    pub quote_req_id: String,
    /// Currency pair, e.g. `EURUSD`
    pub symbol: String,
    /// `SP`, `SPOT` or `INDIVIDUAL`
    pub settl_type: String,
    /// `yyyymmdd`
    pub settl_date: String,
    pub quantity: u64,
    pub msg_type: MsgType,
    #[serde(default)]
    pub side: Side,
    pub transact_time: Option<DateTime<Utc>>,
    pub valid_until_time: Option<DateTime<Utc>>,
    /// `Y` or `N`
    #[serde(default)]
    pub daily_flag: Option<String>,
}

impl MarketRequest {
    pub fn quote(quote_req_id: impl Into<String>, quantity: u64, now: DateTime<Utc>) -> Self {
        Self {
            quote_req_id: quote_req_id.into(),
            symbol: "EURUSD".to_owned(),
            settl_type: "SP".to_owned(),
            settl_date: now.format("%Y%m%d").to_string(),
            quantity,
            msg_type: MsgType::Quote,
            side: Side::None,
            transact_time: Some(now),
            valid_until_time: Some(now + chrono::Duration::minutes(5)),
            daily_flag: Some("N".to_owned()),
        }
    }

    pub fn is_daily(&self) -> bool {
        self.daily_flag.as_deref() == Some("Y")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketResponse {
    pub quote_req_id: String,
    pub quantity: u64,
    pub latency_ms: u64,
}

/// Handler that pretends to route each request to a market.
///
/// Latency grows with the requested quantity; once "filled" a [`MarketResponse`] is
/// sent to the response queue, if one is configured.
pub struct MarketEmulator<S> {
    client: QueueClient<S>,
    response_queue: Option<String>,
    processed: Arc<AtomicU64>,
}

#[bon::bon]
impl<S: QueueStore> MarketEmulator<S> {
    #[builder]
    pub fn new(client: QueueClient<S>, #[builder(into)] response_queue: Option<String>) -> Self {
        Self {
            client,
            response_queue,
            processed: Arc::default(),
        }
    }

    /// Shared count of requests answered so far.
    pub fn processed(&self) -> Arc<AtomicU64> {
        self.processed.clone()
    }
}

fn latency_ms(quantity: u64) -> u64 {
    rand::thread_rng().gen_range(0..10 + quantity / 2) + 10
}

impl<S: QueueStore> Handler<MarketRequest> for MarketEmulator<S> {
    fn handle(&self, request: MarketRequest) -> BoxFuture<'_, eyre::Result<()>> {
        Box::pin(async move {
            let latency_ms = latency_ms(request.quantity);
            tokio::time::sleep(Duration::from_millis(latency_ms)).await;

            let response = MarketResponse {
                quote_req_id: request.quote_req_id,
                quantity: request.quantity,
                latency_ms,
            };

            if let Some(queue) = &self.response_queue {
                self.client.send_json(queue, &response, None).await?;
            }

            let processed = self.processed.fetch_add(1, Ordering::Relaxed) + 1;

            let sampled = rand::thread_rng().gen_range(0..100) <= 5;
            if sampled {
                tracing::info!(
                    processed,
                    quote_req_id = response.quote_req_id,
                    quantity = response.quantity,
                    latency_ms,
                    "Market response"
                );
            }

            Ok(())
        })
    }
}

/// Sends `100 * multiplier + 1` quote requests, the n-th with quantity n, and returns
/// the queue's metric afterwards.
pub async fn generate_load<S: QueueStore>(
    client: &QueueClient<S>,
    queue: &str,
    multiplier: u64,
) -> Result<QueueMetric, Error> {
    let now = Utc::now();
    let prefix = now.format("%y%m%d%H%M%S").to_string();

    for i in 0..=100 * multiplier {
        let request = MarketRequest::quote(format!("{prefix}_{i}"), i, now);
        client.send_json(queue, &request, None).await?;

        if i % 950 == 0 {
            tracing::info!(queue, loaded = i, "Loaded messages so far");
        }
    }

    client.metrics(queue).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::QueueConfig, store::memory::InMemoryQueueStore};

    fn client() -> QueueClient<InMemoryQueueStore> {
        QueueClient::new(
            InMemoryQueueStore::with_queues(["market_request", "market_response"]),
            QueueConfig::default(),
        )
    }

    #[test]
    fn test_request_wire_format() {
        let request = MarketRequest::quote("abc_1", 230, Utc::now());
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["quoteReqId"], "abc_1");
        assert_eq!(json["msgType"], "QUOTE");
        assert_eq!(json["quantity"], 230);
        assert!(!request.is_daily());

        let parsed: MarketRequest = serde_json::from_str(
            r#"{"quoteReqId":"x","symbol":"EURUSD","settlType":"SPOT","settlDate":"20230612",
                "quantity":5,"msgType":"QUOTE_REQUEST","transactTime":null,"validUntilTime":null}"#,
        )
        .unwrap();
        assert_eq!(parsed.msg_type, MsgType::QuoteRequest);
        assert_eq!(parsed.daily_flag, None);
        assert_eq!(parsed.side, Side::None);
    }

    #[test]
    fn test_latency_bounds() {
        for quantity in [0, 1, 40, 1000] {
            let ms = latency_ms(quantity);
            assert!(ms >= 10);
            assert!(ms < 20 + quantity / 2);
        }
    }

    #[tokio::test]
    async fn test_emulator_sends_response() {
        let client = client();
        let emulator = MarketEmulator::builder()
            .client(client.clone())
            .response_queue("market_response")
            .build();
        let processed = emulator.processed();

        emulator
            .handle(MarketRequest::quote("r1", 4, Utc::now()))
            .await
            .unwrap();

        assert_eq!(processed.load(Ordering::Relaxed), 1);

        let response: MarketResponse = client.pop_as("market_response").await.unwrap().unwrap();
        assert_eq!(response.quote_req_id, "r1");
        assert_eq!(response.quantity, 4);
        assert!(response.latency_ms >= 10);
    }

    #[tokio::test]
    async fn test_emulator_without_response_queue() {
        let client = client();
        let emulator = MarketEmulator::builder().client(client.clone()).build();

        emulator
            .handle(MarketRequest::quote("r1", 0, Utc::now()))
            .await
            .unwrap();

        assert_eq!(emulator.processed().load(Ordering::Relaxed), 1);
        assert!(client.pop("market_response").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_emulator_fails_on_missing_response_queue() {
        let client = QueueClient::new(
            InMemoryQueueStore::with_queues(["market_request"]),
            QueueConfig::default(),
        );
        let emulator = MarketEmulator::builder()
            .client(client)
            .response_queue("market_response")
            .build();

        assert!(emulator
            .handle(MarketRequest::quote("r1", 0, Utc::now()))
            .await
            .is_err());
        assert_eq!(emulator.processed().load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_generate_load() {
        let client = client();

        let metric = generate_load(&client, "market_request", 1).await.unwrap();
        assert_eq!(metric.queue_length, 101);
        assert_eq!(metric.total_messages, 101);

        let first: MarketRequest = client.pop_as("market_request").await.unwrap().unwrap();
        assert_eq!(first.quantity, 0);
        assert!(first.quote_req_id.ends_with("_0"));

        let second: MarketRequest = client.pop_as("market_request").await.unwrap().unwrap();
        assert_eq!(second.quantity, 1);
    }
}
