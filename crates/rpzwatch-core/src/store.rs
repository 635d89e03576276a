// # Verdict Store
//
// Latest verdict per domain plus the queue of outcomes not yet persisted.
//
// ## Ownership
//
// The scheduler is the only writer. Readers (the tracer, request handlers)
// hold cheap clones of the same handle. Persisted state is only touched by
// `flush`, which drains the queue into one batched registry write.
//
// ## Failure Behavior
//
// A failed flush puts the drained batch back at the front of the queue, so
// the next flush retries it together with anything recorded since.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::Error;
use crate::model::{PollutionUpdate, Verdict};
use crate::traits::DomainRegistry;

/// In-memory verdict cache with a pending-flush queue
#[derive(Debug, Clone, Default)]
pub struct VerdictStore {
    verdicts: Arc<RwLock<HashMap<String, Verdict>>>,
    pending: Arc<Mutex<Vec<PollutionUpdate>>>,
}

impl VerdictStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest verdict for `domain`
    pub async fn get(&self, domain: &str) -> Option<Verdict> {
        self.verdicts.read().await.get(domain).cloned()
    }

    /// Snapshot of every verdict, sorted by domain
    pub async fn get_all(&self) -> BTreeMap<String, Verdict> {
        self.verdicts
            .read()
            .await
            .iter()
            .map(|(domain, verdict)| (domain.clone(), verdict.clone()))
            .collect()
    }

    /// Overwrite the verdict of its domain and queue its pollution update
    pub async fn record(&self, verdict: Verdict) {
        let update = verdict.pollution_update();
        self.verdicts
            .write()
            .await
            .insert(verdict.domain.clone(), verdict);
        self.pending.lock().await.push(update);
    }

    /// Evict every verdict whose domain fails `keep`
    ///
    /// # Returns
    ///
    /// Number of evicted verdicts
    pub async fn retain<F>(&self, keep: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let mut guard = self.verdicts.write().await;
        let before = guard.len();
        guard.retain(|domain, _| keep(domain));
        before - guard.len()
    }

    pub async fn len(&self) -> usize {
        self.verdicts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.verdicts.read().await.is_empty()
    }

    /// Number of outcomes waiting for the next flush
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// When `domain` was last probed, if it has a verdict
    pub async fn probed_at(&self, domain: &str) -> Option<DateTime<Utc>> {
        self.verdicts.read().await.get(domain).map(|v| v.probed_at)
    }

    /// Most recent probe time across all domains
    pub async fn last_probe_at(&self) -> Option<DateTime<Utc>> {
        self.verdicts
            .read()
            .await
            .values()
            .map(|v| v.probed_at)
            .max()
    }

    /// Write all queued outcomes to `registry` in one batch
    ///
    /// # Returns
    ///
    /// - `Ok(n)`: `n` updates were written (0 when nothing was queued)
    /// - `Err(Error)`: The write failed and the batch was requeued
    pub async fn flush(&self, registry: &dyn DomainRegistry) -> Result<usize, Error> {
        let batch = std::mem::take(&mut *self.pending.lock().await);
        if batch.is_empty() {
            return Ok(0);
        }

        match registry.batch_update_pollution(&batch).await {
            Ok(()) => {
                tracing::debug!("Flushed {} pollution updates", batch.len());
                Ok(batch.len())
            }
            Err(e) => {
                let mut pending = self.pending.lock().await;
                let newer = std::mem::replace(&mut *pending, batch);
                pending.extend(newer);
                tracing::warn!("Flush failed, {} updates requeued: {}", pending.len(), e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::MemoryDomainRegistry;
    use crate::model::{BaselineSummary, DomainStatus, IpSet};
    use async_trait::async_trait;
    use chrono::Duration;

    fn verdict(domain: &str, status: DomainStatus, probed_at: DateTime<Utc>) -> Verdict {
        Verdict {
            domain: domain.to_string(),
            status,
            reasons: Vec::new(),
            baseline: BaselineSummary {
                ips: IpSet::new(),
                detail: Vec::new(),
            },
            regional: Vec::new(),
            redirect_trace: None,
            trace_status: None,
            latency_ms: Some(10),
            probed_at,
        }
    }

    struct FailingRegistry;

    #[async_trait]
    impl DomainRegistry for FailingRegistry {
        async fn get_domain(&self, _domain: &str) -> Result<Option<crate::DomainRecord>, Error> {
            Ok(None)
        }

        async fn list_records(&self) -> Result<BTreeMap<String, crate::DomainRecord>, Error> {
            Ok(BTreeMap::new())
        }

        async fn batch_update_pollution(&self, _updates: &[PollutionUpdate]) -> Result<(), Error> {
            Err(Error::lock_timeout("domains.json.lock"))
        }

        async fn auto_add_domain(&self, _hostname: &str) -> Result<bool, Error> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_record_overwrites_and_queues() {
        let store = VerdictStore::new();
        let now = Utc::now();
        store.record(verdict("a.example", DomainStatus::Clean, now)).await;
        store.record(verdict("a.example", DomainStatus::Polluted, now)).await;

        assert_eq!(store.len().await, 1);
        assert_eq!(store.get("a.example").await.unwrap().status, DomainStatus::Polluted);
        assert_eq!(store.pending_len().await, 2);
    }

    #[tokio::test]
    async fn test_retain_evicts_unlisted() {
        let store = VerdictStore::new();
        let now = Utc::now();
        store.record(verdict("a.example", DomainStatus::Clean, now)).await;
        store.record(verdict("b.example", DomainStatus::Clean, now)).await;

        let evicted = store.retain(|domain| domain == "a.example").await;
        assert_eq!(evicted, 1);
        assert!(store.get("b.example").await.is_none());
    }

    #[tokio::test]
    async fn test_flush_writes_batch() {
        let registry = MemoryDomainRegistry::with_domains(["a.example"]);
        let store = VerdictStore::new();
        let now = Utc::now();
        store.record(verdict("a.example", DomainStatus::ResolutionFailed, now)).await;

        assert_eq!(store.flush(&registry).await.unwrap(), 1);
        assert_eq!(store.pending_len().await, 0);
        let record = registry.get_domain("a.example").await.unwrap().unwrap();
        assert!(record.polluted);
        assert_eq!(record.last_probe_at, Some(now));
        assert_eq!(store.flush(&registry).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_flush_requeues_ahead_of_newer() {
        let store = VerdictStore::new();
        let earlier = Utc::now() - Duration::seconds(30);
        store.record(verdict("a.example", DomainStatus::Clean, earlier)).await;

        assert!(store.flush(&FailingRegistry).await.is_err());
        store.record(verdict("b.example", DomainStatus::Clean, Utc::now())).await;
        assert_eq!(store.pending_len().await, 2);

        let registry = MemoryDomainRegistry::with_domains(["a.example", "b.example"]);
        assert_eq!(store.flush(&registry).await.unwrap(), 2);
        let record = registry.get_domain("a.example").await.unwrap().unwrap();
        assert_eq!(record.last_probe_at, Some(earlier));
    }

    #[tokio::test]
    async fn test_last_probe_at_is_latest() {
        let store = VerdictStore::new();
        assert!(store.last_probe_at().await.is_none());

        let later = Utc::now();
        store.record(verdict("a.example", DomainStatus::Clean, later - Duration::seconds(5))).await;
        store.record(verdict("b.example", DomainStatus::Clean, later)).await;
        assert_eq!(store.last_probe_at().await, Some(later));
    }
}
