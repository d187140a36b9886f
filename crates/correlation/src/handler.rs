//! Transport adapter: maps engine results to ack / nak.

use crate::engine::{CorrelationEngine, Outcome};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracker_resilience::{Disposition, MessageHandler};

pub struct CorrelationHandler {
    engine: Arc<CorrelationEngine>,
}

impl CorrelationHandler {
    pub fn new(engine: Arc<CorrelationEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl MessageHandler for CorrelationHandler {
    fn name(&self) -> &str {
        "correlation"
    }

    async fn handle(&self, payload: &[u8]) -> Disposition {
        match self.engine.process_payload(payload).await {
            Ok(Outcome::Dropped(reason)) => {
                info!(reason = %reason, "Channel event dropped");
                Disposition::Ack
            }
            Ok(_) => Disposition::Ack,
            Err(e) if e.is_drop() => {
                warn!(error = %e, "Channel event dropped");
                Disposition::Ack
            }
            Err(e) => {
                error!(error = %e, "Correlation failed, leaving event for redelivery");
                metrics::counter!("correlation.failures").increment(1);
                Disposition::Retry
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracker_core::config::CorrelationConfig;
    use tracker_core::jobs::noop_publisher;
    use tracker_core::types::ChannelInstance;
    use tracker_store::{MemoryBackend, Store};

    async fn handler() -> (CorrelationHandler, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let store = Store::new(backend.clone());
        store
            .put_instance(&ChannelInstance {
                name: "shop-01".into(),
                business_id: Some(uuid::Uuid::new_v4()),
            })
            .await
            .unwrap();
        let engine = CorrelationEngine::new(store, noop_publisher(), &CorrelationConfig::default());
        (CorrelationHandler::new(Arc::new(engine)), backend)
    }

    fn payload(instance: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "instance": instance,
            "data": {
                "messageType": "conversation",
                "key": { "remoteJid": "r1", "fromMe": false },
                "message": { "conversation": "hello" }
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_drops_are_acknowledged() {
        let (handler, _) = handler().await;
        assert_eq!(handler.handle(b"garbage").await, Disposition::Ack);
        assert_eq!(handler.handle(&payload("unknown")).await, Disposition::Ack);
        assert_eq!(handler.handle(&payload("shop-01")).await, Disposition::Ack);
    }

    #[tokio::test]
    async fn test_infrastructure_failure_is_retried() {
        let (handler, backend) = handler().await;
        backend.fail_next_ops(1);
        assert_eq!(handler.handle(&payload("shop-01")).await, Disposition::Retry);
        assert_eq!(handler.handle(&payload("shop-01")).await, Disposition::Ack);
    }
}
