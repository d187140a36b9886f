//! HTTP server and metrics exporter.

use crate::rest::{self, AppState};
use axum::routing::get;
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracker_core::config::AppConfig;
use tracker_ingest::ClickIngestor;
use tracker_store::Store;

pub struct ApiServer {
    config: AppConfig,
    ingestor: Arc<ClickIngestor>,
    store: Store,
}

impl ApiServer {
    pub fn new(config: AppConfig, ingestor: Arc<ClickIngestor>, store: Store) -> Self {
        Self { config, ingestor, store }
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            ingestor: self.ingestor.clone(),
            store: self.store.clone(),
            node_id: self.config.node_id.clone(),
            start_time: Instant::now(),
        };

        Router::new()
            .route("/c/:id/process", get(rest::process_click))
            .route("/health", get(rest::health_check))
            .route("/ready", get(rest::readiness))
            .route("/live", get(rest::liveness))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve HTTP until `shutdown` resolves.
    pub async fn start_http<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(addr = %addr, "Starting HTTP server");
        serve(listener, self.router(), shutdown).await
    }

    /// Start the Prometheus exporter on its own port.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;
        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}

/// Serve `app` on an already bound listener with peer addresses attached.
pub async fn serve<F>(listener: tokio::net::TcpListener, app: Router, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracker_core::types::{Campaign, MessageEntry, PhoneEntry};
    use tracker_store::MemoryBackend;
    use tracker_watermark::{extract, WatermarkGenerator};
    use uuid::Uuid;

    async fn spawn_server() -> (String, Store, tokio::sync::oneshot::Sender<()>) {
        let store = Store::new(Arc::new(MemoryBackend::new()));
        let campaign = Campaign {
            id: Uuid::new_v4(),
            business_id: Uuid::new_v4(),
            name: "June".into(),
            custom_url: Some("june".into()),
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
            integration_enabled: false,
            conversion_enabled: false,
            integration_sink_id: None,
            conversion_sink_id: None,
        };
        store.put_campaign(&campaign).await.unwrap();

        let config = AppConfig::default();
        let ingestor = Arc::new(ClickIngestor::new(store.clone(), WatermarkGenerator::default(), &config.api));
        let server = ApiServer::new(config, ingestor, store.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let app = server.router();
        tokio::spawn(async move {
            serve(listener, app, async move {
                let _ = rx.await;
            })
            .await
            .unwrap();
        });
        (format!("http://{addr}"), store, tx)
    }

    #[tokio::test]
    async fn test_process_click_endpoint() {
        let (base, store, _shutdown) = spawn_server().await;
        let body: serde_json::Value = reqwest::Client::new()
            .get(format!("{base}/c/june/process?utm_source=ig"))
            .header("user-agent", "Mozilla/5.0")
            .header("x-forwarded-for", "203.0.113.9")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["success"], true);
        assert!(body["redirect"].as_str().unwrap().starts_with("https://wa.me/5511999990000"));
        let composed = body["composed_message"].as_str().unwrap();
        assert!(composed.starts_with("Oi"));
        assert!(body["duration"].is_u64());

        let code = extract(composed);
        let click = store.click_by_watermark(&code).await.unwrap().unwrap();
        assert_eq!(click.client_ip, "203.0.113.9");
        assert_eq!(click.utm.utm_source.as_deref(), Some("ig"));
    }

    #[tokio::test]
    async fn test_peer_address_and_unknown_campaign() {
        let (base, store, _shutdown) = spawn_server().await;
        let client = reqwest::Client::new();

        let body: serde_json::Value = client
            .get(format!("{base}/c/june/process"))
            .header("user-agent", "Mozilla/5.0")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let code = extract(body["composed_message"].as_str().unwrap());
        let click = store.click_by_watermark(&code).await.unwrap().unwrap();
        assert_eq!(click.client_ip, "127.0.0.1");

        let response = client
            .get(format!("{base}/c/nope/process"))
            .header("user-agent", "Mozilla/5.0")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 404);

        let health = client.get(format!("{base}/health")).send().await.unwrap();
        assert!(health.status().is_success());
        let ready = client.get(format!("{base}/ready")).send().await.unwrap();
        assert!(ready.status().is_success());
    }
}
