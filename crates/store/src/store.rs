//! Typed JSON facade over a [`KvBackend`].

use crate::backend::KvBackend;
use crate::keys::{self, CursorKind};
use crate::tx::StoreTx;
use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;
use tracker_core::types::{
    Campaign, ChannelInstance, Click, IntegrationJob, JobClaim, JobRecord, JobState, Lead, RouterRef, SinkConfig,
};
use tracker_core::{TrackerError, TrackerResult};
use tracker_watermark::{CodeRegistry, Watermark};
use uuid::Uuid;

/// Conflict retries for the small job-state transactions.
const JOB_UPDATE_ATTEMPTS: u32 = 5;

/// Result of trying to take the delivery lease on a job.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Acquired(JobClaim),
    AlreadyDelivered,
    /// Another handler holds a live lease.
    Held(JobClaim),
}

#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn KvBackend>,
}

impl Store {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    pub fn begin(&self) -> StoreTx {
        StoreTx::new(self.backend.clone())
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> TrackerResult<Option<T>> {
        match self.backend.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> TrackerResult<()> {
        self.backend.set(key, &serde_json::to_string(value)?).await
    }

    async fn get_id(&self, key: &str) -> TrackerResult<Option<Uuid>> {
        match self.backend.get(key).await? {
            Some(raw) => Uuid::parse_str(&raw)
                .map(Some)
                .map_err(|e| TrackerError::Datastore(format!("corrupt id under {key}: {e}"))),
            None => Ok(None),
        }
    }

    // ─── Channel instances ──────────────────────────────────────────────

    pub async fn instance(&self, name: &str) -> TrackerResult<Option<ChannelInstance>> {
        self.get_json(&keys::instance(name)).await
    }

    pub async fn put_instance(&self, instance: &ChannelInstance) -> TrackerResult<()> {
        self.put_json(&keys::instance(&instance.name), instance).await
    }

    // ─── Campaigns ──────────────────────────────────────────────────────

    pub async fn campaign(&self, id: Uuid) -> TrackerResult<Option<Campaign>> {
        self.get_json(&keys::campaign(id)).await
    }

    pub async fn campaign_by_ref(&self, router: &RouterRef) -> TrackerResult<Option<Campaign>> {
        match router {
            RouterRef::Id(id) => self.campaign(*id).await,
            RouterRef::CustomUrl(_) => match self.get_id(&keys::campaign_ref(router)).await? {
                Some(id) => self.campaign(id).await,
                None => Ok(None),
            },
        }
    }

    /// Store the campaign and, when it has one, its custom-url index.
    pub async fn put_campaign(&self, campaign: &Campaign) -> TrackerResult<()> {
        self.put_json(&keys::campaign(campaign.id), campaign).await?;
        if let Some(slug) = &campaign.custom_url {
            self.backend
                .set(&keys::campaign_slug(slug), &campaign.id.to_string())
                .await?;
        }
        Ok(())
    }

    /// Advance a campaign's round-robin cursor in one atomic step.
    pub async fn advance_cursor(&self, campaign_id: Uuid, kind: CursorKind, len: usize) -> TrackerResult<usize> {
        self.backend.advance_cursor(&keys::cursor(campaign_id, kind), len).await
    }

    // ─── Clicks ─────────────────────────────────────────────────────────

    pub async fn click(&self, id: Uuid) -> TrackerResult<Option<Click>> {
        self.get_json(&keys::click(id)).await
    }

    pub async fn insert_click(&self, click: &Click) -> TrackerResult<()> {
        self.put_json(&keys::click(click.id), click).await
    }

    /// The click that reserved `code`, if any.
    pub async fn click_by_watermark(&self, code: &Watermark) -> TrackerResult<Option<Click>> {
        if code.is_empty() {
            return Ok(None);
        }
        match self.get_id(&keys::watermark(code)).await? {
            Some(id) => self.click(id).await,
            None => Ok(None),
        }
    }

    // ─── Leads ──────────────────────────────────────────────────────────

    pub async fn lead(&self, id: Uuid) -> TrackerResult<Option<Lead>> {
        self.get_json(&keys::lead(id)).await
    }

    pub async fn lead_by_identity(&self, business_id: Uuid, remote_identity: &str) -> TrackerResult<Option<Lead>> {
        match self.get_id(&keys::lead_index(business_id, remote_identity)).await? {
            Some(id) => self.lead(id).await,
            None => Ok(None),
        }
    }

    // ─── Sinks ──────────────────────────────────────────────────────────

    pub async fn sink(&self, id: Uuid) -> TrackerResult<Option<SinkConfig>> {
        self.get_json(&keys::sink(id)).await
    }

    pub async fn put_sink(&self, sink: &SinkConfig) -> TrackerResult<()> {
        self.put_json(&keys::sink(sink.id), sink).await
    }

    // ─── Job outbox ─────────────────────────────────────────────────────

    pub async fn job(&self, job: &IntegrationJob) -> TrackerResult<Option<JobRecord>> {
        self.get_json(&keys::job(job)).await
    }

    /// Move a job record forward to `state`. Never moves it back; a record
    /// already at or past `state` is returned unchanged. A missing record
    /// is created directly in `state`.
    pub async fn advance_job(&self, job: &IntegrationJob, state: JobState) -> TrackerResult<JobRecord> {
        let mut last_conflict = None;
        for _ in 0..JOB_UPDATE_ATTEMPTS {
            let mut tx = self.begin();
            let existing = tx.job(job).await?;
            if let Some(record) = existing.as_ref().filter(|r| r.state >= state) {
                let record = record.clone();
                tx.rollback();
                return Ok(record);
            }
            let mut record = existing.unwrap_or_else(|| JobRecord::pending(*job));
            record.state = state;
            record.updated_at = Utc::now();
            if state == JobState::Delivered {
                record.claim = None;
            }
            tx.put_job(&record)?;
            match tx.commit().await {
                Ok(()) => {
                    debug!(key = %job.idempotency_key(), state = ?state, "Job advanced");
                    return Ok(record);
                }
                Err(TrackerError::Conflict(detail)) => last_conflict = Some(detail),
                Err(e) => return Err(e),
            }
        }
        Err(job_update_exhausted(last_conflict))
    }

    /// Take the delivery lease on `job` for `lease`. Succeeds when nobody
    /// holds a live lease or `owner` already holds it. A missing record is
    /// created pending.
    pub async fn claim_job(
        &self,
        job: &IntegrationJob,
        owner: Uuid,
        lease: std::time::Duration,
    ) -> TrackerResult<ClaimOutcome> {
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| TrackerError::Config(format!("claim lease out of range: {e}")))?;
        let mut last_conflict = None;
        for _ in 0..JOB_UPDATE_ATTEMPTS {
            let mut tx = self.begin();
            let mut record = tx.job(job).await?.unwrap_or_else(|| JobRecord::pending(*job));
            let now = Utc::now();
            if record.state == JobState::Delivered {
                tx.rollback();
                return Ok(ClaimOutcome::AlreadyDelivered);
            }
            if let Some(held) = record.live_claim(now).filter(|c| c.owner != owner) {
                let held = *held;
                tx.rollback();
                return Ok(ClaimOutcome::Held(held));
            }
            let claim = JobClaim {
                owner,
                expires_at: now + lease,
            };
            record.claim = Some(claim);
            record.updated_at = now;
            tx.put_job(&record)?;
            match tx.commit().await {
                Ok(()) => {
                    debug!(key = %job.idempotency_key(), %owner, "Job claimed");
                    return Ok(ClaimOutcome::Acquired(claim));
                }
                Err(TrackerError::Conflict(detail)) => last_conflict = Some(detail),
                Err(e) => return Err(e),
            }
        }
        Err(job_update_exhausted(last_conflict))
    }

    /// Drop `owner`'s lease so a redelivery can try again right away.
    /// Leases held by someone else are left alone.
    pub async fn release_job(&self, job: &IntegrationJob, owner: Uuid) -> TrackerResult<()> {
        let mut last_conflict = None;
        for _ in 0..JOB_UPDATE_ATTEMPTS {
            let mut tx = self.begin();
            let Some(mut record) = tx.job(job).await? else {
                tx.rollback();
                return Ok(());
            };
            if record.claim.map(|c| c.owner) != Some(owner) {
                tx.rollback();
                return Ok(());
            }
            record.claim = None;
            record.updated_at = Utc::now();
            tx.put_job(&record)?;
            match tx.commit().await {
                Ok(()) => return Ok(()),
                Err(TrackerError::Conflict(detail)) => last_conflict = Some(detail),
                Err(e) => return Err(e),
            }
        }
        Err(job_update_exhausted(last_conflict))
    }
}

fn job_update_exhausted(last_conflict: Option<String>) -> TrackerError {
    TrackerError::RetryExhausted {
        what: format!("job update {}", last_conflict.unwrap_or_default()),
        attempts: JOB_UPDATE_ATTEMPTS,
    }
}

#[async_trait]
impl CodeRegistry for Store {
    type Error = TrackerError;

    async fn reserve(&self, code: &Watermark, owner: Uuid) -> Result<bool, TrackerError> {
        self.backend
            .set_if_absent(&keys::watermark(code), &owner.to_string())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use tracker_core::types::SinkKind;
    use tracker_watermark::WatermarkGenerator;

    fn campaign(slug: Option<&str>) -> Campaign {
        Campaign {
            id: Uuid::new_v4(),
            business_id: Uuid::new_v4(),
            name: "June".into(),
            custom_url: slug.map(str::to_string),
            phones: vec![],
            phone_strategy: "fixed".into(),
            messages: vec![],
            message_strategy: "fixed".into(),
            integration_enabled: false,
            conversion_enabled: false,
            integration_sink_id: None,
            conversion_sink_id: None,
        }
    }

    #[tokio::test]
    async fn test_campaign_lookup_by_slug_and_id() {
        let store = Store::new(Arc::new(MemoryBackend::new()));
        let campaign = campaign(Some("promo-june"));
        store.put_campaign(&campaign).await.unwrap();

        let by_slug = store
            .campaign_by_ref(&RouterRef::parse("promo-june"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_slug.id, campaign.id);
        let by_id = store.campaign_by_ref(&RouterRef::Id(campaign.id)).await.unwrap();
        assert!(by_id.is_some());
        assert!(store.campaign_by_ref(&RouterRef::parse("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_cursor_advances_are_distinct() {
        let store = Store::new(Arc::new(MemoryBackend::new()));
        let id = Uuid::new_v4();
        let mut handles = Vec::new();
        for _ in 0..9 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.advance_cursor(id, CursorKind::Phone, 3).await.unwrap()
            }));
        }
        let mut counts = [0; 3];
        for handle in handles {
            counts[handle.await.unwrap()] += 1;
        }
        assert_eq!(counts, [3, 3, 3]);
    }

    #[tokio::test]
    async fn test_store_reserves_watermarks_once() {
        let store = Store::new(Arc::new(MemoryBackend::new()));
        let code = Watermark::from_indices(&[1, 2, 3]);
        assert!(store.reserve(&code, Uuid::new_v4()).await.unwrap());
        assert!(!store.reserve(&code, Uuid::new_v4()).await.unwrap());

        let generated = WatermarkGenerator::default().generate(&store, Uuid::new_v4()).await.unwrap();
        assert_ne!(generated, code);
        assert!(store.click_by_watermark(&Watermark::empty()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_job_state_only_moves_forward() {
        let store = Store::new(Arc::new(MemoryBackend::new()));
        let job = IntegrationJob::new(Uuid::new_v4(), SinkKind::Integration);

        let record = store.advance_job(&job, JobState::Delivered).await.unwrap();
        assert_eq!(record.state, JobState::Delivered);
        let record = store.advance_job(&job, JobState::Published).await.unwrap();
        assert_eq!(record.state, JobState::Delivered);
    }

    #[tokio::test]
    async fn test_job_claim_is_exclusive_until_released() {
        let store = Store::new(Arc::new(MemoryBackend::new()));
        let job = IntegrationJob::new(Uuid::new_v4(), SinkKind::Conversion);
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let lease = std::time::Duration::from_secs(60);

        let claim = match store.claim_job(&job, first, lease).await.unwrap() {
            ClaimOutcome::Acquired(claim) => claim,
            other => panic!("expected claim, got {other:?}"),
        };
        assert_eq!(claim.owner, first);
        assert!(matches!(store.claim_job(&job, first, lease).await.unwrap(), ClaimOutcome::Acquired(_)));
        match store.claim_job(&job, second, lease).await.unwrap() {
            ClaimOutcome::Held(held) => assert_eq!(held.owner, first),
            other => panic!("expected held, got {other:?}"),
        }

        store.release_job(&job, second).await.unwrap();
        assert!(matches!(store.claim_job(&job, second, lease).await.unwrap(), ClaimOutcome::Held(_)));
        store.release_job(&job, first).await.unwrap();
        assert!(matches!(store.claim_job(&job, second, lease).await.unwrap(), ClaimOutcome::Acquired(_)));

        let record = store.advance_job(&job, JobState::Delivered).await.unwrap();
        assert!(record.claim.is_none());
        assert_eq!(store.claim_job(&job, first, lease).await.unwrap(), ClaimOutcome::AlreadyDelivered);
    }

    #[tokio::test]
    async fn test_expired_job_claim_can_be_taken_over() {
        let store = Store::new(Arc::new(MemoryBackend::new()));
        let job = IntegrationJob::new(Uuid::new_v4(), SinkKind::Integration);
        let stale = Uuid::new_v4();

        let outcome = store.claim_job(&job, stale, std::time::Duration::from_millis(1)).await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::Acquired(_)));
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let fresh = Uuid::new_v4();
        match store.claim_job(&job, fresh, std::time::Duration::from_secs(60)).await.unwrap() {
            ClaimOutcome::Acquired(claim) => assert_eq!(claim.owner, fresh),
            other => panic!("expected takeover, got {other:?}"),
        }
        let record = store.job(&job).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Pending);
    }
}
