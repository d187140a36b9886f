//! Reply tracker: click entry, reply correlation and downstream dispatch.
//!
//! Main entry point that wires the datastore and broker managers into the
//! HTTP server and the queue consumers, then waits for Ctrl-C.

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracker_api::ApiServer;
use tracker_core::config::AppConfig;
use tracker_core::jobs::{noop_publisher, JobPublisher};
use tracker_core::types::SinkKind;
use tracker_correlation::{CorrelationEngine, CorrelationHandler};
use tracker_dispatch::{DispatchBridge, DispatchHandler, SinkRegistry};
use tracker_ingest::ClickIngestor;
use tracker_resilience::{
    BrokerLink, ConsumerSpec, NatsConnector, NatsJobPublisher, PoolConfig, QueueConsumer, RedisConnector,
    ResilientPool,
};
use tracker_store::{RedisBackend, Store};
use tracker_watermark::WatermarkGenerator;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "reply-tracker")]
#[command(about = "Attributes channel replies to the clicks that produced them")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "REPLY_TRACKER__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "REPLY_TRACKER__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Run the reply correlation consumer
    #[arg(long, env = "REPLY_TRACKER__CORRELATION__ENABLED")]
    correlation: Option<bool>,

    /// Skip the dispatch consumers
    #[arg(long, default_value_t = false)]
    no_dispatch: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reply_tracker=info,tracker=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Reply tracker starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(enabled) = cli.correlation {
        config.correlation.enabled = enabled;
    }
    if cli.no_dispatch {
        config.dispatch.enabled = false;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        correlation = config.correlation.enabled,
        dispatch = config.dispatch.enabled,
        "Configuration loaded"
    );

    // Datastore
    let pool = Arc::new(ResilientPool::new(
        RedisConnector::new(&config.redis.url)?,
        PoolConfig::from(&config.redis),
    ));
    pool.init().await?;
    let store = Store::new(Arc::new(RedisBackend::new(pool.clone())));

    // Broker, only when something consumes or publishes jobs
    let needs_broker = config.correlation.enabled || config.dispatch.enabled;
    let link = if needs_broker {
        let link = BrokerLink::new(
            NatsConnector::new(&config.nats),
            Duration::from_millis(config.nats.reconnect_delay_ms),
        );
        if let Err(e) = link.init().await {
            error!(error = %e, "Initial broker connection failed, retrying in background");
            link.schedule_reconnect(link.generation());
        }
        Some(link)
    } else {
        info!("No consumers enabled, running click entry only");
        None
    };

    let mut consumers: Vec<JoinHandle<()>> = Vec::new();

    if let (Some(link), true) = (&link, config.correlation.enabled) {
        let publisher: Arc<dyn JobPublisher> = if config.dispatch.enabled {
            let publisher = NatsJobPublisher::new(link.clone(), &config.nats);
            if let Err(e) = publisher.ensure_stream().await {
                warn!(error = %e, "Jobs stream not ready yet, consumers will create it");
            }
            Arc::new(publisher)
        } else {
            noop_publisher()
        };
        let engine = Arc::new(CorrelationEngine::new(store.clone(), publisher, &config.correlation));
        let spec = ConsumerSpec {
            stream: config.nats.inbound_stream.clone(),
            stream_subjects: vec![config.nats.inbound_subject.clone()],
            durable: config.nats.inbound_consumer.clone(),
            filter_subject: config.nats.inbound_subject.clone(),
            prefetch: config.nats.prefetch,
            duplicate_window: Duration::from_secs(config.nats.duplicate_window_secs),
            ack_wait: Duration::from_secs(config.nats.ack_wait_secs),
        };
        consumers.push(QueueConsumer::new(link.clone(), spec, Arc::new(CorrelationHandler::new(engine))).spawn());
        info!("Reply correlation consumer started");
    }

    if let (Some(link), true) = (&link, config.dispatch.enabled) {
        let registry = SinkRegistry::with_defaults(Duration::from_millis(config.dispatch.sink_timeout_ms))?;
        let bridge = Arc::new(DispatchBridge::new(store.clone(), Arc::new(registry), &config.dispatch));
        let handler = Arc::new(DispatchHandler::new(bridge));
        let subjects: Vec<String> = SinkKind::ALL.iter().map(|k| config.nats.jobs_subject(*k)).collect();
        let ack_wait = Duration::from_secs(config.nats.ack_wait_secs)
            .max(DispatchBridge::max_handling_time(&config.dispatch));
        for kind in SinkKind::ALL {
            let spec = ConsumerSpec {
                stream: config.nats.jobs_stream.clone(),
                stream_subjects: subjects.clone(),
                durable: format!("{}-{}", config.dispatch.consumer_prefix, kind),
                filter_subject: config.nats.jobs_subject(kind),
                prefetch: config.nats.prefetch,
                duplicate_window: Duration::from_secs(config.nats.duplicate_window_secs),
                ack_wait,
            };
            consumers.push(QueueConsumer::new(link.clone(), spec, handler.clone()).spawn());
        }
        info!(ack_wait_ms = ack_wait.as_millis() as u64, "Dispatch consumers started");
    }

    let ingestor = Arc::new(ClickIngestor::new(
        store.clone(),
        WatermarkGenerator::new(
            config.watermark.min_len,
            config.watermark.max_len,
            config.watermark.max_attempts,
        ),
        &config.api,
    ));
    let api_server = ApiServer::new(config.clone(), ingestor, store);

    if let Err(e) = api_server.start_metrics() {
        error!(error = %e, "Failed to start metrics exporter");
    }

    info!("Reply tracker is ready to serve traffic");

    let served = api_server
        .start_http(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        })
        .await;

    if let Some(link) = &link {
        link.close();
    }
    for consumer in consumers {
        match tokio::time::timeout(SHUTDOWN_GRACE, consumer).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Consumer task ended abnormally"),
            Err(_) => warn!("Consumer did not stop in time"),
        }
    }
    pool.close();
    info!("Reply tracker stopped");

    served
}
