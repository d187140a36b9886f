//! Click ingestion: select, watermark, persist, redirect.

use crate::selection::{select_message, select_phone, validate_campaign};
use chrono::Utc;
use std::time::Instant;
use tracing::info;
use tracker_core::config::ApiConfig;
use tracker_core::types::{Click, RouterRef, UtmParams};
use tracker_core::{TrackerError, TrackerResult};
use tracker_store::Store;
use tracker_watermark::{embed, GenerateError, WatermarkGenerator};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ClickRequest {
    pub router: RouterRef,
    pub utm: UtmParams,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClickResponse {
    pub click_id: Uuid,
    pub redirect_url: String,
    pub composed_message: String,
}

pub struct ClickIngestor {
    store: Store,
    generator: WatermarkGenerator,
    crawler_redirect_url: String,
    crawler_agent_marker: String,
}

impl ClickIngestor {
    pub fn new(store: Store, generator: WatermarkGenerator, config: &ApiConfig) -> Self {
        Self {
            store,
            generator,
            crawler_redirect_url: config.crawler_redirect_url.clone(),
            crawler_agent_marker: config.crawler_agent_marker.clone(),
        }
    }

    pub async fn ingest(&self, request: ClickRequest) -> TrackerResult<ClickResponse> {
        let start = Instant::now();

        let client_ip = required(request.client_ip, "client ip")?;
        let user_agent = required(request.user_agent, "user agent")?;

        let campaign = self
            .store
            .campaign_by_ref(&request.router)
            .await?
            .ok_or_else(|| TrackerError::NotFound(format!("campaign {}", request.router)))?;

        validate_campaign(&campaign)?;
        let phone = select_phone(&self.store, &campaign).await?;
        let message = select_message(&self.store, &campaign).await?;

        let click_id = Uuid::new_v4();
        let watermark = self
            .generator
            .generate(&self.store, click_id)
            .await
            .map_err(|e| match e {
                GenerateError::Registry(inner) => inner,
                GenerateError::RetryExhausted { attempts } => TrackerError::RetryExhausted {
                    what: "watermark generation".into(),
                    attempts,
                },
            })?;
        let composed_message = embed(&message, &watermark);

        let click = Click {
            id: click_id,
            business_id: campaign.business_id,
            campaign_id: campaign.id,
            watermark,
            phone,
            message,
            composed_message,
            utm: request.utm,
            client_ip,
            client_user_agent: user_agent,
            created_at: Utc::now(),
            lead_id: None,
            contact_identifier_id: None,
            remote_identity: None,
            correlated_at: None,
        };
        self.store.insert_click(&click).await?;

        let crawler = !self.crawler_agent_marker.is_empty()
            && click.client_user_agent.contains(&self.crawler_agent_marker);
        let redirect_url = if crawler {
            self.crawler_redirect_url.clone()
        } else {
            whatsapp_url(&click.phone, &click.composed_message)
        };

        metrics::counter!("clicks.ingested", "crawler" => if crawler { "yes" } else { "no" }).increment(1);
        info!(
            click_id = %click.id,
            campaign_id = %campaign.id,
            watermark = %click.watermark,
            duration_ms = start.elapsed().as_millis() as u64,
            "Click ingested"
        );

        Ok(ClickResponse {
            click_id: click.id,
            redirect_url,
            composed_message: click.composed_message,
        })
    }
}

fn required(value: Option<String>, what: &str) -> TrackerResult<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| TrackerError::Validation(format!("missing {what}")))
}

/// `https://wa.me/<phone>?text=<percent-encoded text>`, spaces as `%20`.
pub fn whatsapp_url(phone: &str, text: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(text.as_bytes()).collect();
    format!("https://wa.me/{phone}?text={}", encoded.replace('+', "%20"))
}
