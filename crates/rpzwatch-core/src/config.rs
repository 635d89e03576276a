//! Configuration types for rpzwatch
//!
//! Every field has a default so a partial JSON document (or none at all)
//! yields a usable configuration; the daemon overlays environment variables.

use crate::model::ResolverEndpoint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Baseline and regional resolver sets
    #[serde(default)]
    pub resolvers: ResolverSetConfig,

    /// Addresses known to host a block/warning page
    #[serde(default = "default_block_page_ips")]
    pub block_page_ips: BTreeSet<IpAddr>,

    /// Redirect tracer settings
    #[serde(default)]
    pub trace: TraceConfig,

    /// Background scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Persisted files
    #[serde(default)]
    pub storage: StorageConfig,
}

impl WatchConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self {
            resolvers: ResolverSetConfig::default(),
            block_page_ips: default_block_page_ips(),
            trace: TraceConfig::default(),
            scheduler: SchedulerConfig::default(),
            storage: StorageConfig::default(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.resolvers.validate()?;
        self.trace.validate()?;
        self.scheduler.validate()?;
        self.storage.validate()?;
        Ok(())
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolver sets and their timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverSetConfig {
    /// Resolvers outside the region under study (ground truth)
    #[serde(default = "default_baseline_resolvers")]
    pub baseline: Vec<ResolverEndpoint>,

    /// Resolvers inside the region under study
    #[serde(default = "default_regional_resolvers")]
    pub regional: Vec<ResolverEndpoint>,

    /// Per-query timeout for baseline resolvers (milliseconds)
    #[serde(default = "default_baseline_timeout_ms")]
    pub baseline_timeout_ms: u64,

    /// Per-query timeout for regional resolvers (milliseconds)
    #[serde(default = "default_regional_timeout_ms")]
    pub regional_timeout_ms: u64,

    /// Deadline for the whole resolver fan-out of one domain (seconds)
    #[serde(default = "default_probe_deadline_secs")]
    pub probe_deadline_secs: u64,
}

impl ResolverSetConfig {
    pub fn baseline_timeout(&self) -> Duration {
        Duration::from_millis(self.baseline_timeout_ms)
    }

    pub fn regional_timeout(&self) -> Duration {
        Duration::from_millis(self.regional_timeout_ms)
    }

    pub fn probe_deadline(&self) -> Duration {
        Duration::from_secs(self.probe_deadline_secs)
    }

    /// Validate the resolver configuration
    ///
    /// A and AAAA run back to back against one resolver, so a single resolver
    /// may take up to twice its per-query timeout. The overall deadline must
    /// leave room for that.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.baseline.is_empty() {
            return Err(crate::Error::config("No baseline resolvers configured"));
        }
        if self.regional.is_empty() {
            return Err(crate::Error::config("No regional resolvers configured"));
        }
        if self.baseline_timeout_ms == 0 || self.regional_timeout_ms == 0 {
            return Err(crate::Error::config("Resolver timeouts must be > 0"));
        }

        let slowest = self.baseline_timeout().max(self.regional_timeout());
        if self.probe_deadline() <= slowest * 2 {
            return Err(crate::Error::config(format!(
                "Probe deadline ({}s) must exceed twice the largest resolver timeout ({:?})",
                self.probe_deadline_secs, slowest
            )));
        }

        Ok(())
    }
}

impl Default for ResolverSetConfig {
    fn default() -> Self {
        Self {
            baseline: default_baseline_resolvers(),
            regional: default_regional_resolvers(),
            baseline_timeout_ms: default_baseline_timeout_ms(),
            regional_timeout_ms: default_regional_timeout_ms(),
            probe_deadline_secs: default_probe_deadline_secs(),
        }
    }
}

/// Redirect tracer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Whether scheduled probes follow the redirect chain
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum number of hops recorded per trace
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,

    /// Per-request timeout (seconds)
    #[serde(default = "default_trace_timeout_secs")]
    pub timeout_secs: u64,

    /// User agent sent with every hop
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl TraceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Validate the tracer configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.max_hops == 0 {
            return Err(crate::Error::config("Trace max_hops must be > 0"));
        }
        if self.timeout_secs == 0 {
            return Err(crate::Error::config("Trace timeout must be > 0"));
        }
        Ok(())
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_hops: default_max_hops(),
            timeout_secs: default_trace_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Sleep between cycles (seconds)
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,

    /// Minimum time between probes of a domain already flagged polluted (seconds)
    ///
    /// Domains known to be bad are re-checked less often to reduce load on
    /// the regional resolvers. Set to 0 to probe every domain every cycle.
    #[serde(default = "default_abnormal_probe_interval_secs")]
    pub abnormal_probe_interval_secs: u64,

    /// Maximum number of domains probed concurrently
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Capacity of the scheduler event channel
    ///
    /// When full, new events are dropped (with a warning log).
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl SchedulerConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn abnormal_probe_interval(&self) -> Duration {
        Duration::from_secs(self.abnormal_probe_interval_secs)
    }

    /// Validate the scheduler configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.max_concurrency == 0 {
            return Err(crate::Error::config("max_concurrency must be > 0"));
        }
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("event_channel_capacity must be > 0"));
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval_secs(),
            abnormal_probe_interval_secs: default_abnormal_probe_interval_secs(),
            max_concurrency: default_max_concurrency(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

/// Persisted file locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Domain metadata JSON file
    #[serde(default = "default_domains_path")]
    pub domains_path: PathBuf,

    /// Domain group mapping JSON file
    #[serde(default = "default_groups_path")]
    pub groups_path: PathBuf,

    /// Bounded wait for the sidecar file locks (milliseconds)
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl StorageConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Validate the storage configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.domains_path.as_os_str().is_empty() {
            return Err(crate::Error::config("Domains file path cannot be empty"));
        }
        if self.groups_path.as_os_str().is_empty() {
            return Err(crate::Error::config("Groups file path cannot be empty"));
        }
        if self.domains_path == self.groups_path {
            return Err(crate::Error::config(
                "Domains file and groups file must be different files",
            ));
        }
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            domains_path: default_domains_path(),
            groups_path: default_groups_path(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

fn default_baseline_resolvers() -> Vec<ResolverEndpoint> {
    vec![
        ResolverEndpoint::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), "Google DNS"),
        ResolverEndpoint::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), "Cloudflare DNS"),
    ]
}

fn default_regional_resolvers() -> Vec<ResolverEndpoint> {
    vec![
        ResolverEndpoint::new(IpAddr::V4(Ipv4Addr::new(168, 95, 1, 1)), "Chunghwa Telecom"),
        ResolverEndpoint::new(IpAddr::V4(Ipv4Addr::new(101, 101, 101, 101)), "TWNIC"),
    ]
}

fn default_block_page_ips() -> BTreeSet<IpAddr> {
    [
        Ipv4Addr::new(182, 173, 0, 181),
        Ipv4Addr::LOCALHOST,
        Ipv4Addr::UNSPECIFIED,
    ]
    .into_iter()
    .map(IpAddr::V4)
    .collect()
}

fn default_baseline_timeout_ms() -> u64 {
    3000
}

fn default_regional_timeout_ms() -> u64 {
    4000
}

fn default_probe_deadline_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_max_hops() -> usize {
    10
}

fn default_trace_timeout_secs() -> u64 {
    10
}

fn default_user_agent() -> String {
    format!("rpzwatch/{}", env!("CARGO_PKG_VERSION"))
}

fn default_probe_interval_secs() -> u64 {
    10
}

fn default_abnormal_probe_interval_secs() -> u64 {
    300
}

fn default_max_concurrency() -> usize {
    50
}

fn default_event_channel_capacity() -> usize {
    1000
}

fn default_domains_path() -> PathBuf {
    PathBuf::from("domains.json")
}

fn default_groups_path() -> PathBuf {
    PathBuf::from("domain_groups.json")
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = WatchConfig::new();
        config.validate().unwrap();
        assert_eq!(config.resolvers.baseline.len(), 2);
        assert_eq!(config.resolvers.regional.len(), 2);
        assert!(config.block_page_ips.contains(&"182.173.0.181".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: WatchConfig = serde_json::from_str("{}").unwrap();
        config.validate().unwrap();
        assert_eq!(config.trace.max_hops, 10);
        assert_eq!(config.scheduler.max_concurrency, 50);
        assert_eq!(config.block_page_ips.len(), 3);
    }

    #[test]
    fn test_deadline_must_exceed_query_timeouts() {
        let mut config = WatchConfig::new();
        config.resolvers.probe_deadline_secs = 8;
        assert!(config.validate().is_err());

        config.resolvers.probe_deadline_secs = 9;
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_empty_regional_set() {
        let mut config = WatchConfig::new();
        config.resolvers.regional.clear();
        assert!(config.validate().is_err());
    }
}
