//! Dispatch bridge: one integration job in, at most one successful
//! delivery out.
//!
//! The click, campaign and sink rows may lag behind the job that names
//! them, so a missing link is looked up again after a fixed delay before
//! the job is abandoned. Delivery failures back off exponentially; once
//! the budget is spent the error goes back to the caller so the queue's
//! own redelivery decides what happens next.
//!
//! Delivery runs under a lease on the job record. A redelivered copy that
//! finds a live lease backs off with a retryable conflict instead of
//! calling the sink a second time.

use crate::retry::RetryPolicy;
use crate::sinks::{DeliveryPayload, Sink, SinkRegistry};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tracker_core::config::DispatchConfig;
use tracker_core::types::{IntegrationJob, JobState, SinkConfig};
use tracker_core::{TrackerError, TrackerResult};
use tracker_store::{ClaimOutcome, Store};
use uuid::Uuid;

/// Slack added on top of the computed worst case for leases and ack waits.
const HANDLING_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered { attempts: u32 },
    /// Already delivered earlier. Nothing sent.
    Duplicate,
    /// A lookup link stayed missing for the whole lookup budget.
    Abandoned { missing: &'static str, attempts: u32 },
    /// Sink kind disabled on the campaign or provider unknown.
    Unsupported(String),
}

impl DispatchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Delivered { .. } => "delivered",
            Self::Duplicate => "duplicate",
            Self::Abandoned { .. } => "abandoned",
            Self::Unsupported(_) => "unsupported",
        }
    }
}

enum Lookup {
    Ready(Box<(SinkConfig, DeliveryPayload)>),
    Missing(&'static str),
    Disabled,
}

pub struct DispatchBridge {
    store: Store,
    registry: Arc<SinkRegistry>,
    lookup_attempts: u32,
    lookup_delay: Duration,
    sink_timeout: Duration,
    retry: RetryPolicy,
    claim_lease: Duration,
}

impl DispatchBridge {
    pub fn new(store: Store, registry: Arc<SinkRegistry>, config: &DispatchConfig) -> Self {
        Self {
            store,
            registry,
            lookup_attempts: config.lookup_attempts.max(1),
            lookup_delay: Duration::from_millis(config.lookup_delay_ms),
            sink_timeout: Duration::from_millis(config.sink_timeout_ms),
            retry: RetryPolicy::from(config),
            claim_lease: Self::delivery_budget(config) + HANDLING_MARGIN,
        }
    }

    /// Worst case for the delivery phase: every attempt times out and every
    /// backoff is slept.
    fn delivery_budget(config: &DispatchConfig) -> Duration {
        let retry = RetryPolicy::from(config);
        Duration::from_millis(config.sink_timeout_ms) * retry.max_attempts() + retry.total_backoff()
    }

    /// Longest a single `dispatch` call can take, with margin. The job
    /// consumers' ack wait must not be shorter than this.
    pub fn max_handling_time(config: &DispatchConfig) -> Duration {
        let lookups = Duration::from_millis(config.lookup_delay_ms) * config.lookup_attempts.max(1);
        lookups + Self::delivery_budget(config) + HANDLING_MARGIN
    }

    pub async fn dispatch(&self, job: &IntegrationJob) -> TrackerResult<DispatchOutcome> {
        let start = Instant::now();
        let outcome = self.run(job).await;
        let label = match &outcome {
            Ok(outcome) => outcome.label(),
            Err(_) => "failed",
        };
        metrics::counter!("dispatch.jobs", "sink" => job.sink_kind.as_str(), "outcome" => label).increment(1);
        metrics::histogram!("dispatch.duration_ms").record(start.elapsed().as_millis() as f64);
        outcome
    }

    async fn run(&self, job: &IntegrationJob) -> TrackerResult<DispatchOutcome> {
        if let Some(record) = self.store.job(job).await? {
            if record.state == JobState::Delivered {
                debug!(key = %job.idempotency_key(), "Job already delivered");
                return Ok(DispatchOutcome::Duplicate);
            }
        }

        let mut attempt = 0;
        let (config, payload) = loop {
            attempt += 1;
            match self.lookup(job).await? {
                Lookup::Ready(resolved) => break *resolved,
                Lookup::Disabled => {
                    warn!(key = %job.idempotency_key(), "Sink kind no longer enabled on campaign");
                    return Ok(DispatchOutcome::Unsupported(format!("{} disabled", job.sink_kind)));
                }
                Lookup::Missing(missing) if attempt >= self.lookup_attempts => {
                    error!(
                        key = %job.idempotency_key(),
                        missing,
                        attempts = attempt,
                        "Dispatch lookup never resolved, abandoning job"
                    );
                    return Ok(DispatchOutcome::Abandoned { missing, attempts: attempt });
                }
                Lookup::Missing(missing) => {
                    debug!(key = %job.idempotency_key(), missing, attempt, "Dispatch lookup incomplete, retrying");
                    tokio::time::sleep(self.lookup_delay).await;
                }
            }
        };

        let Some(sink) = self.registry.get(&config.provider) else {
            warn!(
                key = %job.idempotency_key(),
                provider = %config.provider,
                "Unsupported sink provider"
            );
            return Ok(DispatchOutcome::Unsupported(format!("provider '{}'", config.provider)));
        };

        let owner = Uuid::new_v4();
        match self.store.claim_job(job, owner, self.claim_lease).await? {
            ClaimOutcome::Acquired(_) => {}
            ClaimOutcome::AlreadyDelivered => {
                debug!(key = %job.idempotency_key(), "Job delivered while resolving");
                return Ok(DispatchOutcome::Duplicate);
            }
            ClaimOutcome::Held(held) => {
                debug!(key = %job.idempotency_key(), holder = %held.owner, "Job is being delivered elsewhere");
                return Err(TrackerError::Conflict(format!(
                    "{} claimed until {}",
                    job.idempotency_key(),
                    held.expires_at
                )));
            }
        }

        let delivered = self.deliver(job, &config, &payload, sink.as_ref()).await;
        if delivered.is_err() {
            if let Err(e) = self.store.release_job(job, owner).await {
                warn!(key = %job.idempotency_key(), error = %e, "Failed to release job claim");
            }
        }
        delivered
    }

    async fn deliver(
        &self,
        job: &IntegrationJob,
        config: &SinkConfig,
        payload: &DeliveryPayload,
        sink: &dyn Sink,
    ) -> TrackerResult<DispatchOutcome> {
        let max_attempts = self.retry.max_attempts();
        let mut last_error = String::new();
        for attempt in 0..max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry.backoff_for_attempt(attempt - 1)).await;
            }
            let result = match tokio::time::timeout(self.sink_timeout, sink.deliver(config, payload)).await {
                Ok(result) => result,
                Err(_) => Err(TrackerError::ExternalSink(format!(
                    "timed out after {}ms",
                    self.sink_timeout.as_millis()
                ))),
            };
            match result {
                Ok(()) => {
                    self.store.advance_job(job, JobState::Delivered).await?;
                    info!(
                        key = %job.idempotency_key(),
                        sink_id = %config.id,
                        provider = sink.provider(),
                        attempts = attempt + 1,
                        "Job delivered"
                    );
                    return Ok(DispatchOutcome::Delivered { attempts: attempt + 1 });
                }
                Err(e @ TrackerError::ExternalSink(_)) => {
                    warn!(key = %job.idempotency_key(), attempt = attempt + 1, error = %e, "Delivery failed");
                    last_error = e.to_string();
                }
                Err(e) => return Err(e),
            }
        }

        Err(TrackerError::ExternalSink(format!(
            "{} gave up after {max_attempts} attempts: {last_error}",
            job.idempotency_key()
        )))
    }

    async fn lookup(&self, job: &IntegrationJob) -> TrackerResult<Lookup> {
        let Some(click) = self.store.click(job.click_id).await? else {
            return Ok(Lookup::Missing("click"));
        };
        let Some(campaign) = self.store.campaign(click.campaign_id).await? else {
            return Ok(Lookup::Missing("campaign"));
        };
        if !campaign.sink_enabled(job.sink_kind) {
            return Ok(Lookup::Disabled);
        }
        let Some(sink_id) = campaign.sink_id(job.sink_kind) else {
            return Ok(Lookup::Missing("sink id"));
        };
        let Some(config) = self.store.sink(sink_id).await? else {
            return Ok(Lookup::Missing("sink"));
        };
        let lead = match click.lead_id {
            Some(lead_id) => match self.store.lead(lead_id).await? {
                Some(lead) => Some(lead),
                None => return Ok(Lookup::Missing("lead")),
            },
            None => None,
        };
        Ok(Lookup::Ready(Box::new((
            config,
            DeliveryPayload {
                job: *job,
                click,
                lead,
                campaign,
            },
        ))))
    }
}
