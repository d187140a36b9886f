//! Optimistic transactions.
//!
//! Reads go through to the backend and are remembered; writes are buffered.
//! `commit` applies the buffer only if nothing that was read has changed
//! since, otherwise it fails with `Conflict` and nothing is written. Dropping
//! the transaction is a rollback.

use crate::backend::{KvBackend, ReadSet, WriteSet};
use crate::keys;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;
use tracker_core::types::{Campaign, Click, IntegrationJob, JobRecord, Lead};
use tracker_core::{TrackerError, TrackerResult};
use uuid::Uuid;

pub struct StoreTx {
    backend: Arc<dyn KvBackend>,
    reads: ReadSet,
    writes: WriteSet,
}

impl StoreTx {
    pub(crate) fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            reads: ReadSet::new(),
            writes: WriteSet::new(),
        }
    }

    async fn read_raw(&mut self, key: &str) -> TrackerResult<Option<String>> {
        if let Some(pending) = self.writes.get(key) {
            return Ok(Some(pending.clone()));
        }
        if let Some(seen) = self.reads.get(key) {
            return Ok(seen.clone());
        }
        let value = self.backend.get(key).await?;
        self.reads.insert(key.to_string(), value.clone());
        Ok(value)
    }

    async fn read_json<T: DeserializeOwned>(&mut self, key: &str) -> TrackerResult<Option<T>> {
        match self.read_raw(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn write_json<T: Serialize>(&mut self, key: String, value: &T) -> TrackerResult<()> {
        self.writes.insert(key, serde_json::to_string(value)?);
        Ok(())
    }

    pub async fn click(&mut self, id: Uuid) -> TrackerResult<Option<Click>> {
        self.read_json(&keys::click(id)).await
    }

    pub fn put_click(&mut self, click: &Click) -> TrackerResult<()> {
        self.write_json(keys::click(click.id), click)
    }

    pub async fn campaign(&mut self, id: Uuid) -> TrackerResult<Option<Campaign>> {
        self.read_json(&keys::campaign(id)).await
    }

    /// Lead of `remote_identity` within a business. The index key joins the
    /// read set, so two transactions creating the same lead conflict.
    pub async fn lead_by_identity(&mut self, business_id: Uuid, remote_identity: &str) -> TrackerResult<Option<Lead>> {
        let Some(id) = self.read_raw(&keys::lead_index(business_id, remote_identity)).await? else {
            return Ok(None);
        };
        let id = Uuid::parse_str(&id).map_err(|e| TrackerError::Datastore(format!("corrupt lead index: {e}")))?;
        self.read_json(&keys::lead(id)).await
    }

    /// Write the lead and its identity index.
    pub fn put_lead(&mut self, lead: &Lead) -> TrackerResult<()> {
        self.write_json(keys::lead(lead.id), lead)?;
        self.writes.insert(
            keys::lead_index(lead.business_id, &lead.remote_identity),
            lead.id.to_string(),
        );
        Ok(())
    }

    pub async fn job(&mut self, job: &IntegrationJob) -> TrackerResult<Option<JobRecord>> {
        self.read_json(&keys::job(job)).await
    }

    pub fn put_job(&mut self, record: &JobRecord) -> TrackerResult<()> {
        self.write_json(keys::job(&record.job), record)
    }

    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    pub async fn commit(self) -> TrackerResult<()> {
        if self.writes.is_empty() {
            return Ok(());
        }
        if self.backend.commit(&self.reads, &self.writes).await? {
            debug!(reads = self.reads.len(), writes = self.writes.len(), "Transaction committed");
            Ok(())
        } else {
            let keys: Vec<&str> = self.reads.keys().map(String::as_str).collect();
            Err(TrackerError::Conflict(keys.join(",")))
        }
    }

    pub fn rollback(self) {
        debug!(discarded = self.writes.len(), "Transaction rolled back");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::Store;
    use chrono::Utc;
    use tracker_core::types::{SinkKind, UtmParams};
    use tracker_watermark::Watermark;

    fn click() -> Click {
        Click {
            id: Uuid::new_v4(),
            business_id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
            watermark: Watermark::from_indices(&[0, 1, 2]),
            phone: "5511900000000".into(),
            message: "hi".into(),
            composed_message: "hi".into(),
            utm: UtmParams::default(),
            client_ip: "10.0.0.1".into(),
            client_user_agent: "ua".into(),
            created_at: Utc::now(),
            lead_id: None,
            contact_identifier_id: None,
            remote_identity: None,
            correlated_at: None,
        }
    }

    #[tokio::test]
    async fn test_reads_see_own_writes_and_commit() {
        let backend = Arc::new(MemoryBackend::new());
        let store = Store::new(backend.clone());
        let click = click();
        store.insert_click(&click).await.unwrap();

        let mut tx = store.begin();
        let mut bound = tx.click(click.id).await.unwrap().unwrap();
        bound.remote_identity = Some("r1".into());
        tx.put_click(&bound).unwrap();
        assert_eq!(tx.click(click.id).await.unwrap().unwrap().remote_identity.as_deref(), Some("r1"));
        tx.commit().await.unwrap();

        let stored = store.click(click.id).await.unwrap().unwrap();
        assert_eq!(stored.remote_identity.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_concurrent_change_conflicts() {
        let backend = Arc::new(MemoryBackend::new());
        let store = Store::new(backend.clone());
        let click = click();
        store.insert_click(&click).await.unwrap();

        let mut tx = store.begin();
        let mut mine = tx.click(click.id).await.unwrap().unwrap();
        mine.remote_identity = Some("r1".into());
        tx.put_click(&mine).unwrap();

        let mut theirs = click.clone();
        theirs.remote_identity = Some("r2".into());
        store.insert_click(&theirs).await.unwrap();
        let writes_before = backend.write_count();

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, TrackerError::Conflict(_)));
        assert_eq!(backend.write_count(), writes_before);
        let stored = store.click(click.id).await.unwrap().unwrap();
        assert_eq!(stored.remote_identity.as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn test_lead_creation_races_conflict() {
        let backend = Arc::new(MemoryBackend::new());
        let store = Store::new(backend.clone());
        let click = click();

        let mut first = store.begin();
        let mut second = store.begin();
        assert!(first.lead_by_identity(click.business_id, "r1").await.unwrap().is_none());
        assert!(second.lead_by_identity(click.business_id, "r1").await.unwrap().is_none());

        first.put_lead(&Lead::from_click(&click, "r1", "A".into())).unwrap();
        second.put_lead(&Lead::from_click(&click, "r1", "B".into())).unwrap();
        first.commit().await.unwrap();
        assert!(second.commit().await.is_err());

        let lead = store.lead_by_identity(click.business_id, "r1").await.unwrap().unwrap();
        assert_eq!(lead.display_name, "A");
    }

    #[tokio::test]
    async fn test_read_only_commit_writes_nothing() {
        let backend = Arc::new(MemoryBackend::new());
        let store = Store::new(backend.clone());
        let mut tx = store.begin();
        assert!(tx.job(&IntegrationJob::new(Uuid::new_v4(), SinkKind::Conversion)).await.unwrap().is_none());
        assert!(tx.is_read_only());
        tx.commit().await.unwrap();
        assert_eq!(backend.write_count(), 0);
    }
}
