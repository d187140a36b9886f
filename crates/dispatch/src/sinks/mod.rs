//! Downstream sinks. One implementation per provider, looked up by the
//! `provider` field of a stored [`SinkConfig`].

pub mod conversion;
pub mod webhook;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracker_core::types::{Campaign, Click, IntegrationJob, Lead, SinkConfig};
use tracker_core::{TrackerError, TrackerResult};

pub use conversion::ConversionApiSink;
pub use webhook::WebhookSink;

/// What a sink receives for one job.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryPayload {
    pub job: IntegrationJob,
    pub click: Click,
    pub lead: Option<Lead>,
    pub campaign: Campaign,
}

#[async_trait]
pub trait Sink: Send + Sync {
    fn provider(&self) -> &str;

    async fn deliver(&self, config: &SinkConfig, payload: &DeliveryPayload) -> TrackerResult<()>;
}

/// Provider name to sink.
#[derive(Default, Clone)]
pub struct SinkRegistry {
    sinks: HashMap<String, Arc<dyn Sink>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Webhook and conversion API sinks sharing one request timeout.
    pub fn with_defaults(timeout: Duration) -> TrackerResult<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(WebhookSink::new(timeout)?));
        let conversion: Arc<dyn Sink> = Arc::new(ConversionApiSink::new(timeout)?);
        registry.register(conversion.clone());
        registry.alias(ConversionApiSink::LEGACY_PROVIDER, conversion);
        Ok(registry)
    }

    pub fn register(&mut self, sink: Arc<dyn Sink>) {
        self.sinks.insert(sink.provider().to_string(), sink);
    }

    pub fn alias(&mut self, provider: &str, sink: Arc<dyn Sink>) {
        self.sinks.insert(provider.to_string(), sink);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn Sink>> {
        self.sinks.get(provider).cloned()
    }

    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sinks.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Sink that records deliveries in memory. Can be told to fail or stall.
pub struct RecordingSink {
    provider: String,
    deliveries: Mutex<Vec<DeliveryPayload>>,
    failures: AtomicU32,
    stall: Mutex<Option<Duration>>,
}

impl RecordingSink {
    pub fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            deliveries: Mutex::new(Vec::new()),
            failures: AtomicU32::new(0),
            stall: Mutex::new(None),
        }
    }

    pub fn deliveries(&self) -> Vec<DeliveryPayload> {
        self.deliveries.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.deliveries.lock().len()
    }

    /// Fail the next `n` deliveries with an external sink error.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Sleep this long before every delivery.
    pub fn stall_for(&self, delay: Duration) {
        *self.stall.lock() = Some(delay);
    }
}

#[async_trait]
impl Sink for RecordingSink {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn deliver(&self, _config: &SinkConfig, payload: &DeliveryPayload) -> TrackerResult<()> {
        let stall = *self.stall.lock();
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TrackerError::ExternalSink(format!("{} rejected delivery", self.provider)));
        }
        self.deliveries.lock().push(payload.clone());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use tracker_core::types::{MessageEntry, PhoneEntry, SinkKind, UtmParams};
    use tracker_watermark::Watermark;
    use uuid::Uuid;

    pub(crate) fn campaign() -> Campaign {
        Campaign {
            id: Uuid::new_v4(),
            business_id: Uuid::new_v4(),
            name: "June".into(),
            custom_url: None,
            phones: vec![PhoneEntry {
                phone: "5511999990000".into(),
                weight: 1.0,
            }],
            phone_strategy: "fixed".into(),
            messages: vec![MessageEntry {
                text: "Oi".into(),
                weight: 1.0,
            }],
            message_strategy: "fixed".into(),
            integration_enabled: true,
            conversion_enabled: false,
            integration_sink_id: None,
            conversion_sink_id: None,
        }
    }

    pub(crate) fn payload() -> DeliveryPayload {
        let campaign = campaign();
        let mut click = Click {
            id: Uuid::new_v4(),
            business_id: campaign.business_id,
            campaign_id: campaign.id,
            watermark: Watermark::from_indices(&[0, 1, 2]),
            phone: "5511999990000".into(),
            message: "Oi".into(),
            composed_message: "Oi".into(),
            utm: UtmParams::default(),
            client_ip: "203.0.113.9".into(),
            client_user_agent: "Mozilla/5.0".into(),
            created_at: Utc::now(),
            lead_id: None,
            contact_identifier_id: None,
            remote_identity: Some("5511988887777@s.whatsapp.net".into()),
            correlated_at: Some(Utc::now()),
        };
        let lead = Lead::from_click(&click, "5511988887777@s.whatsapp.net", "Ana".into());
        click.lead_id = Some(lead.id);
        DeliveryPayload {
            job: IntegrationJob::new(click.id, SinkKind::Integration),
            click,
            lead: Some(lead),
            campaign,
        }
    }

    #[test]
    fn test_default_registry_providers() {
        let registry = SinkRegistry::with_defaults(Duration::from_secs(1)).unwrap();
        assert_eq!(registry.providers(), vec!["conversion_api", "pinterest", "webhook"]);
        assert_eq!(registry.get("pinterest").unwrap().provider(), "conversion_api");
        assert!(registry.get("crm").is_none());
    }
}
