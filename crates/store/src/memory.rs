//! In-process backend for tests and local runs.
//! One mutex over the whole map gives the same atomicity as the Redis scripts.

use crate::backend::{KvBackend, ReadSet, WriteSet};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracker_core::{TrackerError, TrackerResult};

#[derive(Default)]
pub struct MemoryBackend {
    data: Mutex<HashMap<String, String>>,
    writes: AtomicU64,
    failures: AtomicU32,
    interference: Mutex<Vec<(String, String)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys written since creation.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make the next `n` operations fail with a transient error.
    pub fn fail_next_ops(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Write `key` right before the next commit is checked, as if another
    /// writer got there first.
    pub fn interfere_on_next_commit(&self, key: &str, value: &str) {
        self.interference.lock().push((key.to_string(), value.to_string()));
    }

    /// Copy of every stored pair.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    fn check_fault(&self) -> TrackerResult<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TrackerError::TransientInfra("injected connection reset".into()));
        }
        Ok(())
    }

    fn count_writes(&self, n: usize) {
        self.writes.fetch_add(n as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> TrackerResult<Option<String>> {
        self.check_fault()?;
        Ok(self.data.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> TrackerResult<()> {
        self.check_fault()?;
        self.data.lock().insert(key.to_string(), value.to_string());
        self.count_writes(1);
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> TrackerResult<bool> {
        self.check_fault()?;
        let mut data = self.data.lock();
        if data.contains_key(key) {
            return Ok(false);
        }
        data.insert(key.to_string(), value.to_string());
        self.count_writes(1);
        Ok(true)
    }

    async fn advance_cursor(&self, key: &str, len: usize) -> TrackerResult<usize> {
        self.check_fault()?;
        if len == 0 {
            return Err(TrackerError::Validation("cursor over empty list".into()));
        }
        let mut data = self.data.lock();
        let current = data.get(key).and_then(|v| v.parse::<usize>().ok()).unwrap_or(0);
        let next = (current + 1) % len;
        data.insert(key.to_string(), next.to_string());
        self.count_writes(1);
        Ok(next)
    }

    async fn commit(&self, reads: &ReadSet, writes: &WriteSet) -> TrackerResult<bool> {
        self.check_fault()?;
        let mut data = self.data.lock();

        for (key, value) in self.interference.lock().drain(..) {
            data.insert(key, value);
        }

        let unchanged = reads.iter().all(|(key, seen)| data.get(key) == seen.as_ref());
        if !unchanged {
            return Ok(false);
        }
        for (key, value) in writes {
            data.insert(key.clone(), value.clone());
        }
        self.count_writes(writes.len());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commit_rejects_stale_reads() {
        let backend = MemoryBackend::new();
        backend.set("a", "1").await.unwrap();

        let reads: ReadSet = [("a".to_string(), Some("1".to_string())), ("b".to_string(), None)].into();
        let writes: WriteSet = [("b".to_string(), "2".to_string())].into();
        assert!(backend.commit(&reads, &writes).await.unwrap());
        assert_eq!(backend.get("b").await.unwrap().as_deref(), Some("2"));

        // Same read set is now stale: "b" exists.
        let writes: WriteSet = [("c".to_string(), "3".to_string())].into();
        assert!(!backend.commit(&reads, &writes).await.unwrap());
        assert_eq!(backend.get("c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cursor_wraps() {
        let backend = MemoryBackend::new();
        let picks: Vec<usize> = {
            let mut v = Vec::new();
            for _ in 0..4 {
                v.push(backend.advance_cursor("cur", 3).await.unwrap());
            }
            v
        };
        assert_eq!(picks, vec![1, 2, 0, 1]);
        assert!(backend.advance_cursor("cur", 0).await.is_err());
    }

    #[tokio::test]
    async fn test_fault_injection_is_transient_and_bounded() {
        let backend = MemoryBackend::new();
        backend.fail_next_ops(2);
        assert!(backend.get("x").await.unwrap_err().is_retryable());
        assert!(backend.set("x", "1").await.is_err());
        backend.set("x", "1").await.unwrap();
        assert_eq!(backend.write_count(), 1);
    }

    #[tokio::test]
    async fn test_set_if_absent_claims_once() {
        let backend = MemoryBackend::new();
        assert!(backend.set_if_absent("wm:012", "a").await.unwrap());
        assert!(!backend.set_if_absent("wm:012", "b").await.unwrap());
        assert_eq!(backend.get("wm:012").await.unwrap().as_deref(), Some("a"));
    }
}
