// # File Domain Registry
//
// File-based implementation of DomainRegistry.
//
// ## Purpose
//
// The domain list is edited administratively (CLI import, other tooling)
// while the scheduler writes probe outcomes into the same file. Every read
// re-reads the file so such edits are observed on the next cycle; every
// write is a locked read-modify-write through `JsonFile`.
//
// ## File Format
//
// ```json
// {
//   "example.com": {
//     "reported": false,
//     "polluted": true,
//     "note": "",
//     "createdAt": "2025-01-09T12:00:00Z",
//     "lastProbeAt": "2025-01-09T12:05:00Z",
//     "traceStatus": "trace-failed"
//   }
// }
// ```

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use super::{AUTO_ADDED_NOTE, normalize_domain};
use crate::Error;
use crate::config::StorageConfig;
use crate::model::{DomainRecord, PollutionUpdate};
use crate::persist::JsonFile;
use crate::traits::DomainRegistry;

type DomainMap = BTreeMap<String, DomainRecord>;

/// Domain registry backed by a JSON object file
#[derive(Debug, Clone)]
pub struct FileDomainRegistry {
    file: JsonFile,
}

impl FileDomainRegistry {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            file: JsonFile::new(path, lock_timeout),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.domains_path.clone(), config.lock_timeout())
    }

    /// Bulk import already-normalised domain names
    ///
    /// Names already present (or repeated in `domains`) are skipped.
    ///
    /// # Returns
    ///
    /// `(added, skipped)`
    pub async fn add_domains<I, S>(&self, domains: I, note: &str) -> Result<(usize, usize), Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains: Vec<String> = domains
            .into_iter()
            .map(|d| d.as_ref().to_string())
            .collect();

        self.file
            .update(|map: &mut DomainMap| {
                let mut added = 0;
                let mut skipped = 0;
                for domain in domains {
                    if map.contains_key(&domain) {
                        skipped += 1;
                    } else {
                        map.insert(domain, DomainRecord::new(note));
                        added += 1;
                    }
                }
                ((added, skipped), added > 0)
            })
            .await
    }
}

#[async_trait]
impl DomainRegistry for FileDomainRegistry {
    async fn get_domain(&self, domain: &str) -> Result<Option<DomainRecord>, Error> {
        let map: DomainMap = self.file.load().await?;
        Ok(map.get(domain).cloned())
    }

    async fn list_records(&self) -> Result<BTreeMap<String, DomainRecord>, Error> {
        self.file.load().await
    }

    async fn batch_update_pollution(&self, updates: &[PollutionUpdate]) -> Result<(), Error> {
        if updates.is_empty() {
            return Ok(());
        }

        let applied = self
            .file
            .update(|map: &mut DomainMap| {
                let mut applied = 0;
                for update in updates {
                    match map.get_mut(&update.domain) {
                        Some(record) => {
                            record.apply(update);
                            applied += 1;
                        }
                        None => {
                            tracing::debug!(domain = %update.domain, "Domain no longer listed, dropping update");
                        }
                    }
                }
                (applied, applied > 0)
            })
            .await?;

        tracing::debug!("Applied {} of {} pollution updates", applied, updates.len());
        Ok(())
    }

    async fn auto_add_domain(&self, hostname: &str) -> Result<bool, Error> {
        let Some(domain) = normalize_domain(hostname) else {
            return Ok(false);
        };

        let added = self
            .file
            .update(|map: &mut DomainMap| {
                if map.contains_key(&domain) {
                    (false, false)
                } else {
                    map.insert(domain.clone(), DomainRecord::new(AUTO_ADDED_NOTE));
                    (true, true)
                }
            })
            .await?;

        if added {
            tracing::info!(domain = %domain, "Auto-added domain from redirect chain");
        }
        Ok(added)
    }
}
