use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    SqlitePool,
};

use crate::{
    client::QueueClient,
    config::Config,
    error::Error,
    store::sqlite::SqliteQueueStore,
};

/// Owns the database pool and the queue client built on top of it.
pub struct Service {
    db: SqlitePool,
    client: QueueClient<SqliteQueueStore>,
    config: Config,
}

impl Service {
    pub async fn connect() -> eyre::Result<Self> {
        Self::connect_with(Config::default()).await
    }

    pub async fn connect_with(config: Config) -> eyre::Result<Self> {
        let opts = if let Some(path) = config.db_path() {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        } else {
            SqliteConnectOptions::new().in_memory(true)
        }
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .locking_mode(SqliteLockingMode::Normal)
        .optimize_on_close(true, None)
        .auto_vacuum(SqliteAutoVacuum::Full);

        let pool = if config.db_path().is_some() {
            SqlitePoolOptions::new().connect_with(opts).await?
        } else {
            // every connection to an in-memory database is its own database
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(opts)
                .await?
        };

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(Error::from)?;

        tracing::info!(
            db_path = config.db_path().unwrap_or(":memory:"),
            "Connected to queue store"
        );

        let client = QueueClient::new(SqliteQueueStore::new(pool.clone()), config.queue_config());

        Ok(Self {
            db: pool,
            client,
            config,
        })
    }

    /// Creates the request and response queues if they do not exist yet.
    pub async fn provision(&self) -> Result<(), Error> {
        let existing = self.client.list_queues().await?;

        let wanted = std::iter::once(self.config.request_queue.as_str())
            .chain(self.config.response_queue());

        for queue in wanted {
            if existing.iter().any(|name| name == queue) {
                tracing::debug!(queue, "Queue already provisioned");
                continue;
            }
            match self.client.create_queue(queue).await {
                Ok(()) | Err(Error::QueueExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn client(&self) -> &QueueClient<SqliteQueueStore> {
        &self.client
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of messages archived from a queue.
    pub async fn archived_count(&self, queue: &str) -> Result<i64, Error> {
        self.client.store().archived_count(queue).await
    }

    /// Closes the pool, waiting for checked-out connections to be returned.
    pub async fn close(&self) {
        self.db.close().await;
    }

    /// Logs the metrics of every queue.
    pub async fn log_metrics(&self) -> Result<(), Error> {
        for metric in self.client.all_metrics().await? {
            tracing::info!(
                queue = metric.queue_name,
                length = metric.queue_length,
                total = metric.total_messages,
                oldest_age_sec = metric.oldest_msg_age_sec,
                "Queue metrics"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_provision_is_idempotent() {
        let service = Service::connect().await.unwrap();

        service.provision().await.unwrap();
        service.provision().await.unwrap();

        let queues = service.client().list_queues().await.unwrap();
        assert_eq!(queues, vec!["market_request", "market_response"]);
    }

    #[tokio::test]
    async fn test_provision_without_response_queue() {
        let config = Config {
            request_queue: "orders".to_owned(),
            response_queue: Some(String::new()),
            ..Config::default()
        };
        let service = Service::connect_with(config).await.unwrap();
        service.provision().await.unwrap();

        assert_eq!(service.client().list_queues().await.unwrap(), vec!["orders"]);
        service.log_metrics().await.unwrap();
    }
}
