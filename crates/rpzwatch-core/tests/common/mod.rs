//! Test doubles and common utilities for contract tests
//!
//! The doubles script every network answer so the whole pipeline (prober,
//! classifier, tracer, group registry, scheduler) runs without sockets.

#![allow(dead_code)]

use rpzwatch_core::error::Result;
use rpzwatch_core::model::{DomainRecord, PollutionUpdate};
use rpzwatch_core::traits::{DomainRegistry, FetchError, HopResponse, HttpFetcher, ResolverClient};
use rpzwatch_core::{
    DomainGroupRegistry, Error, MemoryDomainRegistry, ProbeScheduler, Prober, RedirectTracer,
    ResolverAnswer, ResolverEndpoint, SchedulerEvent, VerdictStore, WatchConfig,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use url::Url;

pub const BASELINE: &str = "8.8.8.8";
pub const REGIONAL_A: &str = "168.95.1.1";
pub const REGIONAL_B: &str = "101.101.101.101";
pub const BLOCK_PAGE: &str = "182.173.0.181";

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

pub fn ok(ips: &[&str]) -> ResolverAnswer {
    ResolverAnswer::ok(ips.iter().map(|s| ip(s)))
}

pub fn endpoint(addr: &str, label: &str) -> ResolverEndpoint {
    ResolverEndpoint::new(ip(addr), label)
}

/// A resolver client answering from a script
///
/// Lookup order: (domain, resolver) → domain default → `Error("unscripted")`.
#[derive(Default)]
pub struct ScriptedResolver {
    answers: Mutex<HashMap<(String, IpAddr), ResolverAnswer>>,
    defaults: Mutex<HashMap<String, ResolverAnswer>>,
    panicking: Mutex<HashSet<String>>,
    delay: Mutex<Duration>,
    queries: Mutex<Vec<String>>,
    query_count: AtomicUsize,
    in_flight: Mutex<HashMap<String, usize>>,
    max_domains_in_flight: AtomicUsize,
}

impl ScriptedResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the answer of one resolver for `domain`
    pub fn answer(&self, domain: &str, resolver: &str, answer: ResolverAnswer) {
        self.answers
            .lock()
            .unwrap()
            .insert((domain.to_string(), ip(resolver)), answer);
    }

    /// Script the answer of every resolver not scripted individually
    pub fn answer_all(&self, domain: &str, answer: ResolverAnswer) {
        self.defaults.lock().unwrap().insert(domain.to_string(), answer);
    }

    /// Every query for `domain` panics
    pub fn panic_on(&self, domain: &str) {
        self.panicking.lock().unwrap().insert(domain.to_string());
    }

    /// Delay every answer
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Get the number of times query() was called
    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::SeqCst)
    }

    /// Most distinct domains ever queried at the same moment
    pub fn max_domains_in_flight(&self) -> usize {
        self.max_domains_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self, domain: &str) {
        let mut in_flight = self.in_flight.lock().unwrap();
        *in_flight.entry(domain.to_string()).or_insert(0) += 1;
        self.max_domains_in_flight.fetch_max(in_flight.len(), Ordering::SeqCst);
    }

    fn leave(&self, domain: &str) {
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(count) = in_flight.get_mut(domain) {
            *count -= 1;
            if *count == 0 {
                in_flight.remove(domain);
            }
        }
    }

    /// Number of queries issued for `domain`
    pub fn queries_for(&self, domain: &str) -> usize {
        self.queries.lock().unwrap().iter().filter(|d| *d == domain).count()
    }
}

#[async_trait::async_trait]
impl ResolverClient for ScriptedResolver {
    async fn query(&self, domain: &str, resolver: &ResolverEndpoint, _timeout: Duration) -> ResolverAnswer {
        self.query_count.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(domain.to_string());

        let delay = *self.delay.lock().unwrap();
        self.enter(domain);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.leave(domain);

        if self.panicking.lock().unwrap().contains(domain) {
            panic!("scripted resolver panic for {}", domain);
        }

        let scripted = self
            .answers
            .lock()
            .unwrap()
            .get(&(domain.to_string(), resolver.address))
            .cloned();
        scripted
            .or_else(|| self.defaults.lock().unwrap().get(domain).cloned())
            .unwrap_or_else(|| ResolverAnswer::error("unscripted"))
    }
}

/// An HTTP fetcher answering from a script; unscripted URLs fail to connect
#[derive(Default)]
pub struct ScriptedFetcher {
    routes: Mutex<HashMap<String, std::result::Result<HopResponse, FetchError>>>,
    panicking: Mutex<HashSet<String>>,
    fetched: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a response for `url`
    pub fn respond(&self, url: &str, status: u16, location: Option<&str>) {
        self.routes.lock().unwrap().insert(
            url.to_string(),
            Ok(HopResponse::new(status, location.map(str::to_string))),
        );
    }

    /// Script a transport failure for `url`
    pub fn fail(&self, url: &str, error: FetchError) {
        self.routes.lock().unwrap().insert(url.to_string(), Err(error));
    }

    /// Fetching `url` panics
    pub fn panic_on(&self, url: &str) {
        self.panicking.lock().unwrap().insert(url.to_string());
    }

    /// URLs fetched so far, in order
    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl HttpFetcher for ScriptedFetcher {
    async fn fetch(&self, url: &Url) -> std::result::Result<HopResponse, FetchError> {
        self.fetched.lock().unwrap().push(url.to_string());
        if self.panicking.lock().unwrap().contains(url.as_str()) {
            panic!("scripted fetcher panic for {}", url);
        }
        self.routes
            .lock()
            .unwrap()
            .get(url.as_str())
            .cloned()
            .unwrap_or_else(|| Err(FetchError::Connect("unscripted host".to_string())))
    }
}

/// A domain registry whose batched writes can be made to fail
pub struct FlakyRegistry {
    inner: MemoryDomainRegistry,
    failures_left: Arc<AtomicUsize>,
    batch_call_count: Arc<AtomicUsize>,
    list_call_count: Arc<AtomicUsize>,
}

impl FlakyRegistry {
    pub fn with_domains(domains: &[&str]) -> Self {
        Self {
            inner: MemoryDomainRegistry::with_domains(domains.iter().copied()),
            failures_left: Arc::new(AtomicUsize::new(0)),
            batch_call_count: Arc::new(AtomicUsize::new(0)),
            list_call_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail the next `n` batch updates with a lock timeout
    pub fn fail_next_batches(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Get the number of times batch_update_pollution() was called
    pub fn batch_call_count(&self) -> usize {
        self.batch_call_count.load(Ordering::SeqCst)
    }

    /// Get the number of times list_records() was called
    pub fn list_call_count(&self) -> usize {
        self.list_call_count.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryDomainRegistry {
        &self.inner
    }

    /// Create a new FlakyRegistry that shares state and counters with an existing one
    pub fn sharing_counters_with(other: &Self) -> Self {
        Self {
            inner: other.inner.clone(),
            failures_left: Arc::clone(&other.failures_left),
            batch_call_count: Arc::clone(&other.batch_call_count),
            list_call_count: Arc::clone(&other.list_call_count),
        }
    }
}

#[async_trait::async_trait]
impl DomainRegistry for FlakyRegistry {
    async fn get_domain(&self, domain: &str) -> Result<Option<DomainRecord>> {
        self.inner.get_domain(domain).await
    }

    async fn list_records(&self) -> Result<BTreeMap<String, DomainRecord>> {
        self.list_call_count.fetch_add(1, Ordering::SeqCst);
        self.inner.list_records().await
    }

    async fn batch_update_pollution(&self, updates: &[PollutionUpdate]) -> Result<()> {
        self.batch_call_count.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::lock_timeout("domains.json.lock"));
        }
        self.inner.batch_update_pollution(updates).await
    }

    async fn auto_add_domain(&self, hostname: &str) -> Result<bool> {
        self.inner.auto_add_domain(hostname).await
    }
}

/// Configuration with short timeouts and storage inside `dir`
pub fn test_config(dir: &Path) -> WatchConfig {
    let mut config = WatchConfig::new();
    config.resolvers.baseline = vec![endpoint(BASELINE, "Google DNS")];
    config.resolvers.regional = vec![
        endpoint(REGIONAL_A, "Chunghwa Telecom"),
        endpoint(REGIONAL_B, "TWNIC"),
    ];
    config.resolvers.baseline_timeout_ms = 200;
    config.resolvers.regional_timeout_ms = 200;
    config.resolvers.probe_deadline_secs = 1;
    config.scheduler.probe_interval_secs = 1;
    config.scheduler.max_concurrency = 4;
    config.scheduler.event_channel_capacity = 100;
    config.storage.domains_path = dir.join("domains.json");
    config.storage.groups_path = dir.join("domain_groups.json");
    config.storage.lock_timeout_ms = 500;
    config
}

/// The whole pipeline wired to test doubles
pub struct Harness {
    pub dir: TempDir,
    pub config: WatchConfig,
    pub resolver: Arc<ScriptedResolver>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub registry: Arc<FlakyRegistry>,
    pub store: VerdictStore,
    pub groups: DomainGroupRegistry,
}

impl Harness {
    pub fn new(domains: &[&str]) -> Self {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let groups = DomainGroupRegistry::from_config(&config.storage);
        Self {
            dir,
            config,
            resolver: Arc::new(ScriptedResolver::new()),
            fetcher: Arc::new(ScriptedFetcher::new()),
            registry: Arc::new(FlakyRegistry::with_domains(domains)),
            store: VerdictStore::new(),
            groups,
        }
    }

    pub fn tracer(&self) -> RedirectTracer {
        RedirectTracer::new(
            self.fetcher.clone(),
            self.registry.clone(),
            self.store.clone(),
            self.config.trace.max_hops,
        )
    }

    pub fn prober(&self) -> Prober {
        Prober::new(self.resolver.clone(), &self.config).with_tracer(self.tracer())
    }

    pub fn scheduler(&self) -> (ProbeScheduler, mpsc::Receiver<SchedulerEvent>) {
        ProbeScheduler::new(
            Arc::new(self.prober()),
            self.registry.clone(),
            self.groups.clone(),
            self.store.clone(),
            &self.config,
        )
        .expect("scheduler construction succeeds")
    }

    /// Baseline answers `ips`, both regional resolvers answer the same
    pub fn resolve_everywhere(&self, domain: &str, ips: &[&str]) {
        self.resolver.answer_all(domain, ok(ips));
    }
}

/// Drain every event currently queued
pub fn drain_events(rx: &mut mpsc::Receiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
