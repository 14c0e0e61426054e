use std::sync::Arc;

use config::Config;
use consumer::Consumer;
use dispatcher::{Dispatcher, Handler};
use market::{MarketEmulator, MarketRequest};
use service::Service;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod client;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod market;
pub mod message;
pub mod service;
pub mod shutdown;
pub mod store;

/// Returns a builder for the main application.
///
/// Without an explicit `config` the environment is read; without a `shutdown` token
/// SIGINT and SIGTERM stop the consumer.
#[bon::builder(finish_fn = start)]
pub async fn run(
    config: Option<Config>,
    shutdown: Option<CancellationToken>,
    #[builder(default = true)] init_tracing: bool,
) -> eyre::Result<()> {
    if init_tracing {
        #[cfg(debug_assertions)]
        FmtSubscriber::builder()
            .pretty()
            .with_env_filter(
                EnvFilter::builder()
                    .with_env_var("LEASEQ_LOG")
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env()?,
            )
            .finish()
            .try_init()?;

        #[cfg(not(debug_assertions))]
        FmtSubscriber::builder()
            .json()
            .with_env_filter(
                EnvFilter::builder()
                    .with_env_var("LEASEQ_LOG")
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env()?,
            )
            .finish()
            .try_init()?;
    }

    let config = match config {
        Some(config) => config,
        None => Config::load()?,
    };

    let service = Service::connect_with(config).await?;
    let config = service.config();

    if config.provision_queues {
        service.provision().await?;
    }

    if let Some(multiplier) = config.load_test {
        let metric =
            market::generate_load(service.client(), &config.request_queue, multiplier).await?;
        tracing::info!(
            queue = metric.queue_name,
            length = metric.queue_length,
            "Load test enqueued"
        );
    }

    let emulator: Arc<dyn Handler<MarketRequest>> = Arc::new(
        MarketEmulator::builder()
            .client(service.client().clone())
            .maybe_response_queue(config.response_queue())
            .build(),
    );

    let dispatcher = Dispatcher::builder()
        .handler(emulator)
        .workers(config.dispatch_workers)
        .capacity(config.dispatch_capacity)
        .build();

    let consumer = Consumer::builder()
        .client(service.client().clone())
        .queue(config.request_queue.as_str())
        .dispatcher(dispatcher)
        .poll_interval(config.poll_interval())
        .sample_every(config.sample_every)
        .decode_failure(config.decode_failure)
        .build();

    let shutdown = shutdown.unwrap_or_else(shutdown::install_signal_handler);

    let stats = consumer.run(shutdown, config.shutdown_timeout()).await;

    tracing::info!(
        submitted = stats.submitted,
        completed = stats.completed,
        failed = stats.failed,
        "Consumer stopped"
    );

    if let Err(e) = service.log_metrics().await {
        tracing::warn!("Failed to collect final metrics: {e}");
    }

    service.close().await;

    Ok(())
}
