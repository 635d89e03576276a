// # Memory Domain Registry
//
// In-memory implementation of DomainRegistry.
//
// Nothing survives a restart. Used by the one-shot `check` command and by
// tests.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{AUTO_ADDED_NOTE, normalize_domain};
use crate::Error;
use crate::model::{DomainRecord, PollutionUpdate};
use crate::traits::DomainRegistry;

/// In-memory domain registry
#[derive(Debug, Clone, Default)]
pub struct MemoryDomainRegistry {
    inner: Arc<RwLock<BTreeMap<String, DomainRecord>>>,
}

impl MemoryDomainRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry listing `domains` with fresh records
    pub fn with_domains<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let map = domains
            .into_iter()
            .map(|d| (d.into(), DomainRecord::new("")))
            .collect();
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }

    /// Insert or replace a record
    pub async fn insert(&self, domain: impl Into<String>, record: DomainRecord) {
        self.inner.write().await.insert(domain.into(), record);
    }

    /// Stop monitoring a domain
    pub async fn remove(&self, domain: &str) -> Option<DomainRecord> {
        self.inner.write().await.remove(domain)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[async_trait]
impl DomainRegistry for MemoryDomainRegistry {
    async fn get_domain(&self, domain: &str) -> Result<Option<DomainRecord>, Error> {
        Ok(self.inner.read().await.get(domain).cloned())
    }

    async fn list_records(&self) -> Result<BTreeMap<String, DomainRecord>, Error> {
        Ok(self.inner.read().await.clone())
    }

    async fn batch_update_pollution(&self, updates: &[PollutionUpdate]) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        for update in updates {
            if let Some(record) = guard.get_mut(&update.domain) {
                record.apply(update);
            }
        }
        Ok(())
    }

    async fn auto_add_domain(&self, hostname: &str) -> Result<bool, Error> {
        let Some(domain) = normalize_domain(hostname) else {
            return Ok(false);
        };
        let mut guard = self.inner.write().await;
        if guard.contains_key(&domain) {
            return Ok(false);
        }
        guard.insert(domain, DomainRecord::new(AUTO_ADDED_NOTE));
        Ok(true)
    }
}
