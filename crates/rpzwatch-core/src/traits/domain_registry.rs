// # Domain Registry Trait
//
// The monitored domain list and its persisted metadata.
//
// ## Purpose
//
// The registry is an external collaborator of the probe pipeline: it owns
// the list of domains (administratively edited elsewhere) and the
// per-domain record the scheduler writes probe outcomes into.
//
// ## Implementations
//
// - File-based: `crate::domains::FileDomainRegistry` (JSON + sidecar lock)
// - In-memory: `crate::domains::MemoryDomainRegistry`

use crate::model::{DomainRecord, PollutionUpdate};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Trait for domain registry implementations
///
/// # Thread Safety
///
/// All methods must be safe to call concurrently from multiple tasks.
/// Writers in other processes may edit the same backing store; file-based
/// implementations serialise through an advisory lock.
#[async_trait]
pub trait DomainRegistry: Send + Sync {
    /// Sorted list of monitored domains
    async fn list_domains(&self) -> Result<Vec<String>, crate::Error> {
        Ok(self.list_records().await?.into_keys().collect())
    }

    /// Record of one domain
    ///
    /// # Returns
    ///
    /// - `Ok(Some(DomainRecord))`: The domain is monitored
    /// - `Ok(None)`: Unknown domain
    /// - `Err(Error)`: Storage error
    async fn get_domain(&self, domain: &str) -> Result<Option<DomainRecord>, crate::Error>;

    /// Snapshot of every record, keyed (and therefore sorted) by domain
    async fn list_records(&self) -> Result<BTreeMap<String, DomainRecord>, crate::Error>;

    /// Apply probe outcomes in one write
    ///
    /// Updates for domains no longer listed are ignored.
    async fn batch_update_pollution(&self, updates: &[PollutionUpdate])
    -> Result<(), crate::Error>;

    /// Register a hostname discovered in a redirect chain
    ///
    /// # Returns
    ///
    /// - `Ok(true)`: The domain was added
    /// - `Ok(false)`: Already present or not a valid domain
    /// - `Err(Error)`: Storage error
    async fn auto_add_domain(&self, hostname: &str) -> Result<bool, crate::Error>;
}
