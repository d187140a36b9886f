//! Generic webhook sink: POSTs the delivery payload as JSON.

use super::{DeliveryPayload, Sink};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;
use tracker_core::types::SinkConfig;
use tracker_core::{TrackerError, TrackerResult};

pub struct WebhookSink {
    http_client: reqwest::Client,
}

impl WebhookSink {
    pub const PROVIDER: &'static str = "webhook";

    pub fn new(timeout: Duration) -> TrackerResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TrackerError::Config(format!("webhook http client: {e}")))?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl Sink for WebhookSink {
    fn provider(&self) -> &str {
        Self::PROVIDER
    }

    async fn deliver(&self, config: &SinkConfig, payload: &DeliveryPayload) -> TrackerResult<()> {
        if config.endpoint.is_empty() {
            return Err(TrackerError::UnsupportedConfig(format!("sink {} has no endpoint", config.id)));
        }
        let response = self
            .http_client
            .post(&config.endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|e| TrackerError::ExternalSink(format!("webhook request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TrackerError::ExternalSink(format!(
                "webhook {} answered {status}",
                config.endpoint
            )));
        }
        debug!(sink_id = %config.id, status = status.as_u16(), "Webhook delivered");
        Ok(())
    }
}
