//! NATS JetStream plumbing: connector and job publisher.

use crate::broker::BrokerLink;
use crate::error::{InfraError, InfraErrorKind};
use crate::pool::Connector;
use async_nats::jetstream::{self, context::Publish};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracker_core::config::NatsConfig;
use tracker_core::jobs::JobPublisher;
use tracker_core::types::{IntegrationJob, SinkKind};
use tracker_core::{TrackerError, TrackerResult};

pub struct NatsConnector {
    url: String,
    max_reconnects: usize,
    connect_timeout: Duration,
}

impl NatsConnector {
    pub fn new(config: &NatsConfig) -> Self {
        Self {
            url: config.url.clone(),
            max_reconnects: config.max_reconnects,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
        }
    }
}

#[async_trait]
impl Connector for NatsConnector {
    type Conn = async_nats::Client;

    fn name(&self) -> &str {
        "nats"
    }

    async fn connect(&self) -> Result<async_nats::Client, InfraError> {
        info!(url = %self.url, "Connecting to NATS");
        async_nats::ConnectOptions::new()
            .max_reconnects(Some(self.max_reconnects))
            .connection_timeout(self.connect_timeout)
            .connect(&self.url)
            .await
            .map_err(|e| {
                let kind = match e.kind() {
                    async_nats::ConnectErrorKind::TimedOut => InfraErrorKind::Timeout,
                    async_nats::ConnectErrorKind::Io => InfraErrorKind::Refused,
                    _ => InfraErrorKind::Other,
                };
                InfraError::new(kind, e.to_string())
            })
    }
}

/// Stream definition shared by publishers and consumers of one stream.
pub fn stream_config(name: &str, subjects: Vec<String>, duplicate_window: Duration) -> jetstream::stream::Config {
    jetstream::stream::Config {
        name: name.to_string(),
        subjects,
        duplicate_window,
        ..Default::default()
    }
}

/// Publishes integration jobs to `<prefix>.<sink kind>` with the job's
/// idempotency key as the JetStream message id.
pub struct NatsJobPublisher {
    link: Arc<BrokerLink<NatsConnector>>,
    stream: String,
    subject_prefix: String,
    duplicate_window: Duration,
}

impl NatsJobPublisher {
    pub fn new(link: Arc<BrokerLink<NatsConnector>>, config: &NatsConfig) -> Self {
        Self {
            link,
            stream: config.jobs_stream.clone(),
            subject_prefix: config.jobs_subject_prefix.clone(),
            duplicate_window: Duration::from_secs(config.duplicate_window_secs),
        }
    }

    pub fn subject(&self, kind: SinkKind) -> String {
        format!("{}.{}", self.subject_prefix, kind.as_str())
    }

    /// Create the jobs stream if it does not exist yet.
    pub async fn ensure_stream(&self) -> Result<(), InfraError> {
        let client = self
            .link
            .connection()
            .ok_or_else(|| InfraError::new(InfraErrorKind::Closed, "broker not connected"))?;
        let subjects = SinkKind::ALL.iter().map(|k| self.subject(*k)).collect();
        jetstream::new(client)
            .get_or_create_stream(stream_config(&self.stream, subjects, self.duplicate_window))
            .await
            .map_err(|e| InfraError::new(InfraErrorKind::Other, e.to_string()))?;
        info!(stream = %self.stream, "Jobs stream ready");
        Ok(())
    }
}

#[async_trait]
impl JobPublisher for NatsJobPublisher {
    async fn publish(&self, job: &IntegrationJob) -> TrackerResult<()> {
        let generation = self.link.generation();
        let Some(client) = self.link.connection() else {
            self.link.schedule_reconnect(generation);
            return Err(TrackerError::Broker("broker not connected".into()));
        };

        let payload = serde_json::to_vec(job)?;
        let subject = self.subject(job.sink_kind);
        let publish = Publish::build()
            .payload(payload.into())
            .message_id(job.idempotency_key());

        let ack = jetstream::new(client)
            .send_publish(subject.clone(), publish)
            .await
            .map_err(|e| TrackerError::Broker(e.to_string()))?;
        let ack = ack.await.map_err(|e| TrackerError::Broker(e.to_string()))?;

        debug!(
            subject = %subject,
            key = %job.idempotency_key(),
            duplicate = ack.duplicate,
            "Job published"
        );
        metrics::counter!("jobs.published", "sink" => job.sink_kind.as_str()).increment(1);
        Ok(())
    }
}
