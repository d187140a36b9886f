//! Reply correlation.
//!
//! An inbound channel event passes a series of gates (conversation message,
//! known instance, business, watermark, click). Each gate can end processing
//! with a drop, which is acknowledged and never retried. Events that pass all
//! gates bind the click to the contact and raise downstream jobs inside one
//! optimistic transaction. Redelivery of an already-applied event finds the
//! click bound to the same contact and only republishes jobs still pending.

use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracker_core::config::CorrelationConfig;
use tracker_core::jobs::JobPublisher;
use tracker_core::types::{Campaign, Click, InboundEvent, IntegrationJob, JobRecord, JobState, Lead, SinkKind};
use tracker_core::{TrackerError, TrackerResult};
use tracker_store::Store;
use tracker_watermark::{extract, strip};
use uuid::Uuid;

/// Why an event was acknowledged without effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    NotConversation,
    FromSelf,
    UnknownInstance,
    NoBusiness,
    NoWatermark,
    UnknownWatermark,
    /// The watermark belongs to another business's click.
    BusinessMismatch,
    /// The click is already bound to a different contact.
    BoundElsewhere,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::NotConversation => "not_conversation",
            Self::FromSelf => "from_self",
            Self::UnknownInstance => "unknown_instance",
            Self::NoBusiness => "no_business",
            Self::NoWatermark => "no_watermark",
            Self::UnknownWatermark => "unknown_watermark",
            Self::BusinessMismatch => "business_mismatch",
            Self::BoundElsewhere => "bound_elsewhere",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Click bound and jobs raised by this delivery.
    Correlated {
        click_id: Uuid,
        lead_id: Uuid,
        lead_created: bool,
        jobs: Vec<IntegrationJob>,
    },
    /// The event was already applied; `republished` pending jobs were sent again.
    Replayed { click_id: Uuid, republished: usize },
    Dropped(DropReason),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Correlated { .. } => "correlated",
            Self::Replayed { .. } => "replayed",
            Self::Dropped(reason) => reason.as_str(),
        }
    }
}

/// Result of one transaction attempt.
enum Attempt {
    Done(Outcome),
    AlreadyBound,
}

pub struct CorrelationEngine {
    store: Store,
    publisher: Arc<dyn JobPublisher>,
    max_tx_attempts: u32,
}

impl CorrelationEngine {
    pub fn new(store: Store, publisher: Arc<dyn JobPublisher>, config: &CorrelationConfig) -> Self {
        Self {
            store,
            publisher,
            max_tx_attempts: config.max_tx_attempts.max(1),
        }
    }

    /// Decode a transport payload and process it. Undecodable payloads are
    /// dropped: no redelivery can fix them.
    pub async fn process_payload(&self, payload: &[u8]) -> TrackerResult<Outcome> {
        match serde_json::from_slice::<InboundEvent>(payload) {
            Ok(event) => self.process(&event).await,
            Err(e) => {
                warn!(error = %e, "Undecodable channel event");
                Ok(self.record(Outcome::Dropped(DropReason::Malformed)))
            }
        }
    }

    pub async fn process(&self, event: &InboundEvent) -> TrackerResult<Outcome> {
        let outcome = self.run(event).await?;
        Ok(self.record(outcome))
    }

    fn record(&self, outcome: Outcome) -> Outcome {
        metrics::counter!("correlation.outcomes", "outcome" => outcome.label()).increment(1);
        outcome
    }

    async fn run(&self, event: &InboundEvent) -> TrackerResult<Outcome> {
        // Received
        if !event.is_conversation() {
            return Ok(Outcome::Dropped(DropReason::NotConversation));
        }
        if event.data.key.from_me {
            return Ok(Outcome::Dropped(DropReason::FromSelf));
        }
        let remote = event.remote_identity();

        // InstanceResolved
        let Some(instance) = self.store.instance(&event.instance).await? else {
            info!(instance = %event.instance, "Channel instance not registered");
            return Ok(Outcome::Dropped(DropReason::UnknownInstance));
        };

        // BusinessResolved
        let Some(business_id) = instance.business_id else {
            info!(instance = %event.instance, "Channel instance has no business");
            return Ok(Outcome::Dropped(DropReason::NoBusiness));
        };

        // WatermarkExtracted
        let code = extract(event.text());
        if code.is_empty() {
            debug!(instance = %event.instance, "No watermark in message");
            return Ok(Outcome::Dropped(DropReason::NoWatermark));
        }

        // ClickMatched
        let Some(click) = self.store.click_by_watermark(&code).await? else {
            info!(business_id = %business_id, watermark = %code, "No click for watermark");
            return Ok(Outcome::Dropped(DropReason::UnknownWatermark));
        };
        if click.business_id != business_id {
            warn!(
                business_id = %business_id,
                click_business_id = %click.business_id,
                click_id = %click.id,
                "Watermark matched a click of another business"
            );
            return Ok(Outcome::Dropped(DropReason::BusinessMismatch));
        }
        if let Some(bound) = &click.remote_identity {
            return self.bound_click(&click, bound, remote).await;
        }

        let campaign = self.store.campaign(click.campaign_id).await?;
        if campaign.is_none() {
            warn!(click_id = %click.id, campaign_id = %click.campaign_id, "Campaign missing, no jobs will be raised");
        }
        let display_name = strip(event.data.push_name.as_deref().unwrap_or_default());

        for attempt in 1..=self.max_tx_attempts {
            match self.correlate(click.id, remote, &display_name, campaign.as_ref()).await {
                Ok(Attempt::Done(outcome)) => {
                    if let Outcome::Correlated { jobs, .. } = &outcome {
                        self.publish_jobs(jobs).await?;
                    }
                    return Ok(outcome);
                }
                Ok(Attempt::AlreadyBound) => {
                    // A concurrent delivery committed first; re-read and replay.
                    let click = self
                        .store
                        .click(click.id)
                        .await?
                        .ok_or_else(|| TrackerError::NotFound(format!("click {}", click.id)))?;
                    let bound = click.remote_identity.clone().unwrap_or_default();
                    return self.bound_click(&click, &bound, remote).await;
                }
                Err(TrackerError::Conflict(keys)) => {
                    metrics::counter!("correlation.conflicts").increment(1);
                    debug!(click_id = %click.id, attempt, keys = %keys, "Correlation transaction conflicted, re-running");
                }
                Err(e) => return Err(e),
            }
        }

        Err(TrackerError::RetryExhausted {
            what: format!("correlation transaction for click {}", click.id),
            attempts: self.max_tx_attempts,
        })
    }

    /// One run of the correlation transaction.
    async fn correlate(
        &self,
        click_id: Uuid,
        remote: &str,
        display_name: &str,
        campaign: Option<&Campaign>,
    ) -> TrackerResult<Attempt> {
        let mut tx = self.store.begin();

        let Some(mut click) = tx.click(click_id).await? else {
            tx.rollback();
            return Ok(Attempt::Done(Outcome::Dropped(DropReason::UnknownWatermark)));
        };
        if click.remote_identity.is_some() {
            tx.rollback();
            return Ok(Attempt::AlreadyBound);
        }

        click.remote_identity = Some(remote.to_string());
        click.correlated_at = Some(Utc::now());

        // LeadResolved
        let (lead, lead_created) = match tx.lead_by_identity(click.business_id, remote).await? {
            Some(mut lead) => {
                lead.record_visit(&click.client_ip, &click.client_user_agent);
                click.lead_id = Some(lead.id);
                (lead, false)
            }
            None => {
                let lead = Lead::from_click(&click, remote, display_name.to_string());
                click.lead_id = Some(lead.id);
                click.contact_identifier_id = Some(lead.id);
                (lead, true)
            }
        };
        tx.put_lead(&lead)?;

        // JobsRaised
        let mut jobs = Vec::new();
        for kind in campaign.map(Campaign::enabled_sinks).unwrap_or_default() {
            let job = IntegrationJob::new(click.id, kind);
            if tx.job(&job).await?.is_none() {
                tx.put_job(&JobRecord::pending(job))?;
            }
            jobs.push(job);
        }

        tx.put_click(&click)?;

        // Committed
        tx.commit().await?;

        info!(
            click_id = %click.id,
            lead_id = %lead.id,
            lead_created,
            jobs = jobs.len(),
            "Reply correlated"
        );
        Ok(Attempt::Done(Outcome::Correlated {
            click_id: click.id,
            lead_id: lead.id,
            lead_created,
            jobs,
        }))
    }

    /// Redelivery path for a click that already has a contact.
    async fn bound_click(&self, click: &Click, bound: &str, remote: &str) -> TrackerResult<Outcome> {
        if bound != remote {
            warn!(click_id = %click.id, "Click already bound to another contact");
            return Ok(Outcome::Dropped(DropReason::BoundElsewhere));
        }

        let mut pending = Vec::new();
        for kind in SinkKind::ALL {
            let job = IntegrationJob::new(click.id, kind);
            if let Some(record) = self.store.job(&job).await? {
                if record.state == JobState::Pending {
                    pending.push(job);
                }
            }
        }
        self.publish_jobs(&pending).await?;

        debug!(click_id = %click.id, republished = pending.len(), "Event already applied");
        Ok(Outcome::Replayed {
            click_id: click.id,
            republished: pending.len(),
        })
    }

    /// Outbox relay: publish, then mark published.
    async fn publish_jobs(&self, jobs: &[IntegrationJob]) -> TrackerResult<()> {
        for job in jobs {
            self.publisher.publish(job).await?;
            self.store.advance_job(job, JobState::Published).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracker_core::jobs::{capture_jobs, CaptureJobs};
    use tracker_core::types::{ChannelInstance, MessageEntry, PhoneEntry, UtmParams};
    use tracker_store::MemoryBackend;
    use tracker_watermark::{embed, CodeRegistry, Watermark};

    const REMOTE: &str = "5511988887777@s.whatsapp.net";

    struct Fixture {
        backend: Arc<MemoryBackend>,
        store: Store,
        jobs: Arc<CaptureJobs>,
        engine: CorrelationEngine,
        click: Click,
    }

    async fn fixture(integration: bool, conversion: bool) -> Fixture {
        fixture_with(integration, conversion, 5).await
    }

    async fn fixture_with(integration: bool, conversion: bool, max_tx_attempts: u32) -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let store = Store::new(backend.clone());
        let business_id = Uuid::new_v4();

        store
            .put_instance(&ChannelInstance {
                name: "shop-01".into(),
                business_id: Some(business_id),
            })
            .await
            .unwrap();
        store
            .put_instance(&ChannelInstance {
                name: "orphan".into(),
                business_id: None,
            })
            .await
            .unwrap();

        let campaign = Campaign {
            id: Uuid::new_v4(),
            business_id,
            name: "June".into(),
            custom_url: None,
            phones: vec![PhoneEntry {
                phone: "5511999990000".into(),
                weight: 1.0,
            }],
            phone_strategy: "fixed".into(),
            messages: vec![MessageEntry {
                text: "hi".into(),
                weight: 1.0,
            }],
            message_strategy: "fixed".into(),
            integration_enabled: integration,
            conversion_enabled: conversion,
            integration_sink_id: None,
            conversion_sink_id: None,
        };
        store.put_campaign(&campaign).await.unwrap();

        let click_id = Uuid::new_v4();
        let watermark = Watermark::from_indices(&[0, 1, 2, 3, 0]);
        assert!(store.reserve(&watermark, click_id).await.unwrap());
        let click = Click {
            id: click_id,
            business_id,
            campaign_id: campaign.id,
            composed_message: embed("hi", &watermark),
            watermark,
            phone: "5511999990000".into(),
            message: "hi".into(),
            utm: UtmParams::default(),
            client_ip: "203.0.113.7".into(),
            client_user_agent: "Mozilla/5.0".into(),
            created_at: Utc::now(),
            lead_id: None,
            contact_identifier_id: None,
            remote_identity: None,
            correlated_at: None,
        };
        store.insert_click(&click).await.unwrap();

        let jobs = capture_jobs();
        let engine = CorrelationEngine::new(
            store.clone(),
            jobs.clone(),
            &CorrelationConfig {
                enabled: true,
                max_tx_attempts,
            },
        );
        Fixture {
            backend,
            store,
            jobs,
            engine,
            click,
        }
    }

    fn event(instance: &str, text: &str) -> InboundEvent {
        serde_json::from_value(serde_json::json!({
            "instance": instance,
            "data": {
                "messageType": "conversation",
                "key": { "remoteJid": REMOTE, "fromMe": false },
                "message": { "conversation": text },
                "pushName": "Ana 🌸"
            }
        }))
        .unwrap()
    }

    fn reply(f: &Fixture) -> InboundEvent {
        event("shop-01", &format!("{}  ", f.click.composed_message))
    }

    #[tokio::test]
    async fn test_new_lead_seeded_from_click() {
        let f = fixture(false, false).await;
        let outcome = f.engine.process(&reply(&f)).await.unwrap();

        let Outcome::Correlated {
            click_id,
            lead_id,
            lead_created,
            jobs,
        } = outcome
        else {
            panic!("expected correlation, got {outcome:?}");
        };
        assert_eq!(click_id, f.click.id);
        assert!(lead_created);
        assert!(jobs.is_empty());

        let lead = f.store.lead(lead_id).await.unwrap().unwrap();
        assert_eq!(lead.remote_identity, REMOTE);
        assert_eq!(lead.display_name, "Ana");
        assert_eq!(lead.ip_history, vec!["203.0.113.7".to_string()]);
        assert_eq!(lead.user_agent_history, vec!["Mozilla/5.0".to_string()]);
        assert_eq!(lead.identifier_ids, vec![lead.id]);

        let click = f.store.click(f.click.id).await.unwrap().unwrap();
        assert_eq!(click.remote_identity.as_deref(), Some(REMOTE));
        assert_eq!(click.lead_id, Some(lead.id));
        assert_eq!(click.contact_identifier_id, Some(lead.id));
        assert!(click.correlated_at.is_some());
    }

    #[tokio::test]
    async fn test_existing_lead_gets_visit_appended() {
        let f = fixture(false, false).await;
        let mut lead = Lead::from_click(&f.click, REMOTE, "Ana".into());
        lead.ip_history = vec!["198.51.100.1".into()];
        lead.user_agent_history = vec!["old-ua".into()];
        let mut tx = f.store.begin();
        tx.put_lead(&lead).unwrap();
        tx.commit().await.unwrap();

        let outcome = f.engine.process(&reply(&f)).await.unwrap();
        assert!(matches!(outcome, Outcome::Correlated { lead_created: false, lead_id, .. } if lead_id == lead.id));

        let lead = f.store.lead(lead.id).await.unwrap().unwrap();
        assert_eq!(lead.ip_history, vec!["198.51.100.1".to_string(), "203.0.113.7".to_string()]);
        assert_eq!(lead.user_agent_history, vec!["old-ua".to_string(), "Mozilla/5.0".to_string()]);
        assert_eq!(lead.last_ip.as_deref(), Some("203.0.113.7"));
    }

    #[tokio::test]
    async fn test_redelivery_is_a_no_op() {
        let f = fixture(true, true).await;
        let event = reply(&f);

        assert!(matches!(f.engine.process(&event).await.unwrap(), Outcome::Correlated { .. }));
        assert_eq!(f.jobs.count(), 2);
        let writes = f.backend.write_count();

        let again = f.engine.process(&event).await.unwrap();
        assert_eq!(
            again,
            Outcome::Replayed {
                click_id: f.click.id,
                republished: 0
            }
        );
        assert_eq!(f.backend.write_count(), writes);
        assert_eq!(f.jobs.count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_instance_leaves_state_unchanged() {
        let f = fixture(true, false).await;
        let before = f.backend.snapshot();

        let outcome = f
            .engine
            .process(&event("nobody", &f.click.composed_message))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Dropped(DropReason::UnknownInstance));

        let outcome = f
            .engine
            .process(&event("orphan", &f.click.composed_message))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Dropped(DropReason::NoBusiness));

        assert_eq!(f.backend.snapshot(), before);
        assert_eq!(f.jobs.count(), 0);
    }

    #[tokio::test]
    async fn test_received_gate_drops_without_writes() {
        let f = fixture(false, false).await;
        let writes = f.backend.write_count();

        let mut own = reply(&f);
        own.data.key.from_me = true;
        assert_eq!(f.engine.process(&own).await.unwrap(), Outcome::Dropped(DropReason::FromSelf));

        let mut image = reply(&f);
        image.data.message_type = "imageMessage".into();
        assert_eq!(
            f.engine.process(&image).await.unwrap(),
            Outcome::Dropped(DropReason::NotConversation)
        );

        let plain = event("shop-01", "hello there");
        assert_eq!(f.engine.process(&plain).await.unwrap(), Outcome::Dropped(DropReason::NoWatermark));

        let stranger = event("shop-01", &embed("hi", &Watermark::from_indices(&[3, 3, 3])));
        assert_eq!(
            f.engine.process(&stranger).await.unwrap(),
            Outcome::Dropped(DropReason::UnknownWatermark)
        );

        assert_eq!(
            f.engine.process_payload(b"{not json").await.unwrap(),
            Outcome::Dropped(DropReason::Malformed)
        );
        assert_eq!(f.backend.write_count(), writes);
    }

    #[tokio::test]
    async fn test_click_bound_elsewhere_is_dropped() {
        let f = fixture(false, false).await;
        f.engine.process(&reply(&f)).await.unwrap();

        let mut other = reply(&f);
        other.data.key.remote_jid = "5511000000000@s.whatsapp.net".into();
        assert_eq!(
            f.engine.process(&other).await.unwrap(),
            Outcome::Dropped(DropReason::BoundElsewhere)
        );
    }

    #[tokio::test]
    async fn test_conflict_reruns_transaction() {
        let f = fixture(false, false).await;

        // Another writer touches the click between our read and commit.
        let mut touched = f.click.clone();
        touched.utm.utm_source = Some("late-write".into());
        f.backend.interfere_on_next_commit(
            &format!("click:{}", f.click.id),
            &serde_json::to_string(&touched).unwrap(),
        );

        let outcome = f.engine.process(&reply(&f)).await.unwrap();
        assert!(matches!(outcome, Outcome::Correlated { .. }));

        let click = f.store.click(f.click.id).await.unwrap().unwrap();
        assert_eq!(click.utm.utm_source.as_deref(), Some("late-write"));
        assert_eq!(click.remote_identity.as_deref(), Some(REMOTE));
    }

    #[tokio::test]
    async fn test_conflict_budget_exhaustion_is_retryable() {
        let f = fixture_with(false, false, 1).await;
        let mut touched = f.click.clone();
        touched.phone = "5511000000001".into();
        f.backend.interfere_on_next_commit(
            &format!("click:{}", f.click.id),
            &serde_json::to_string(&touched).unwrap(),
        );

        let err = f.engine.process(&reply(&f)).await.unwrap_err();
        assert!(matches!(err, TrackerError::RetryExhausted { attempts: 1, .. }));
        assert!(err.is_retryable());
        assert!(f.store.click(f.click.id).await.unwrap().unwrap().lead_id.is_none());

        // The redelivery goes through.
        assert!(matches!(f.engine.process(&reply(&f)).await.unwrap(), Outcome::Correlated { .. }));
    }

    #[tokio::test]
    async fn test_jobs_raised_once_per_enabled_sink() {
        let f = fixture(true, true).await;
        f.engine.process(&reply(&f)).await.unwrap();

        assert_eq!(f.jobs.count_kind(SinkKind::Integration), 1);
        assert_eq!(f.jobs.count_kind(SinkKind::Conversion), 1);
        for kind in SinkKind::ALL {
            let record = f.store.job(&IntegrationJob::new(f.click.id, kind)).await.unwrap().unwrap();
            assert_eq!(record.state, JobState::Published);
        }
    }

    #[tokio::test]
    async fn test_pending_jobs_republished_on_redelivery() {
        let f = fixture(true, false).await;
        f.jobs.fail_next(1);

        let err = f.engine.process(&reply(&f)).await.unwrap_err();
        assert!(err.is_retryable());
        let job = IntegrationJob::new(f.click.id, SinkKind::Integration);
        assert_eq!(f.store.job(&job).await.unwrap().unwrap().state, JobState::Pending);

        let outcome = f.engine.process(&reply(&f)).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Replayed {
                click_id: f.click.id,
                republished: 1
            }
        );
        assert_eq!(f.jobs.jobs(), vec![job]);
        assert_eq!(f.store.job(&job).await.unwrap().unwrap().state, JobState::Published);
    }

    #[tokio::test]
    async fn test_transient_datastore_failure_surfaces_for_retry() {
        let f = fixture(false, false).await;
        f.backend.fail_next_ops(1);
        let err = f.engine.process(&reply(&f)).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(f.engine.process(&reply(&f)).await.unwrap(), Outcome::Correlated { .. }));
    }
}
