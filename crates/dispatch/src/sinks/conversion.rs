//! Ad-platform conversion API sink. Sends one offline `lead` event per
//! correlated click; contact identifiers leave only as SHA-256 hex.

use super::{DeliveryPayload, Sink};
use async_trait::async_trait;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;
use tracker_core::types::SinkConfig;
use tracker_core::{TrackerError, TrackerResult};

pub const TOKEN_PARAM: &str = "conversion_token";
pub const PRODUCT_PARAM: &str = "product_id";

pub struct ConversionApiSink {
    http_client: reqwest::Client,
}

impl ConversionApiSink {
    pub const PROVIDER: &'static str = "conversion_api";
    /// Older sink rows name the platform instead of the protocol.
    pub const LEGACY_PROVIDER: &'static str = "pinterest";

    pub fn new(timeout: Duration) -> TrackerResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TrackerError::Config(format!("conversion http client: {e}")))?;
        Ok(Self { http_client })
    }
}

pub fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Request body for one click. Needs the bound lead.
pub fn conversion_event(config: &SinkConfig, payload: &DeliveryPayload) -> TrackerResult<serde_json::Value> {
    let lead = payload
        .lead
        .as_ref()
        .ok_or_else(|| TrackerError::NotFound(format!("lead for click {}", payload.click.id)))?;
    let click = &payload.click;
    let event_time = click.correlated_at.unwrap_or(click.created_at).timestamp();
    let phone = lead.remote_identity.split('@').next().unwrap_or_default();

    let mut external_ids = vec![sha256_hex(&lead.id.to_string())];
    external_ids.extend(
        lead.identifier_ids
            .iter()
            .filter(|id| **id != lead.id)
            .map(|id| sha256_hex(&id.to_string())),
    );

    let mut event = json!({
        "action_source": "offline",
        "event_id": format!("track_{}_user_{}_time_{}", click.id, lead.id, event_time),
        "event_name": "lead",
        "event_time": event_time,
        "user_data": {
            "client_ip_address": click.client_ip,
            "client_user_agent": click.client_user_agent,
            "external_id": external_ids,
            "ph": [sha256_hex(phone)],
        },
    });
    if let Some(product) = config.params.get(PRODUCT_PARAM) {
        event["custom_data"] = json!({ "content_ids": [product] });
    }
    Ok(json!({ "data": [event] }))
}

#[async_trait]
impl Sink for ConversionApiSink {
    fn provider(&self) -> &str {
        Self::PROVIDER
    }

    async fn deliver(&self, config: &SinkConfig, payload: &DeliveryPayload) -> TrackerResult<()> {
        let token = config
            .params
            .get(TOKEN_PARAM)
            .ok_or_else(|| TrackerError::UnsupportedConfig(format!("sink {} has no {TOKEN_PARAM}", config.id)))?;
        let body = conversion_event(config, payload)?;

        let response = self
            .http_client
            .post(&config.endpoint)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| TrackerError::ExternalSink(format!("conversion request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TrackerError::ExternalSink(format!("conversion api answered {status}")));
        }
        debug!(sink_id = %config.id, click_id = %payload.click.id, "Conversion event sent");
        Ok(())
    }
}
