//! Job queue adapter for the dispatch bridge.

use crate::bridge::{DispatchBridge, DispatchOutcome};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, warn};
use tracker_core::types::IntegrationJob;
use tracker_resilience::{Disposition, MessageHandler};

pub struct DispatchHandler {
    bridge: Arc<DispatchBridge>,
}

impl DispatchHandler {
    pub fn new(bridge: Arc<DispatchBridge>) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl MessageHandler for DispatchHandler {
    fn name(&self) -> &str {
        "dispatch"
    }

    async fn handle(&self, payload: &[u8]) -> Disposition {
        let job: IntegrationJob = match serde_json::from_slice(payload) {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, "Malformed integration job dropped");
                return Disposition::Ack;
            }
        };
        match self.bridge.dispatch(&job).await {
            Ok(DispatchOutcome::Unsupported(reason)) => {
                warn!(key = %job.idempotency_key(), reason = %reason, "Job dropped as unsupported");
                Disposition::Ack
            }
            Ok(_) => Disposition::Ack,
            Err(e) if e.is_drop() => {
                warn!(key = %job.idempotency_key(), error = %e, "Job dropped");
                Disposition::Ack
            }
            Err(e) => {
                error!(key = %job.idempotency_key(), error = %e, "Dispatch failed, leaving job for redelivery");
                Disposition::Retry
            }
        }
    }
}
