//! Background probe scheduler
//!
//! The ProbeScheduler is responsible for:
//! - Listing monitored domains every cycle
//! - Evicting verdicts of domains no longer listed
//! - Skipping polluted domains until their re-probe interval has elapsed
//! - Probing due domains with bounded concurrency
//! - Recording verdicts, domain groups and newly discovered domains
//! - Flushing queued pollution state in one batch per cycle
//!
//! ## Architecture
//!
//! ```text
//!                    ┌──────────────────┐
//!                    │  DomainRegistry  │◄──────────── batched flush
//!                    └──────────────────┘                    │
//!                             │ list_records                 │
//!                             ▼                              │
//!                    ┌──────────────────┐            ┌──────────────┐
//!                    │  ProbeScheduler  │───record──►│ VerdictStore │
//!                    └──────────────────┘            └──────────────┘
//!                             │
//!         ┌───────────────────┼────────────────────┐
//!         ▼                   ▼                    ▼
//! ┌──────────────┐   ┌──────────────────┐   ┌─────────────┐
//! │ Prober tasks │   │ DomainGroupReg.  │   │   Events    │
//! │ (semaphore)  │   │ (record_chain)   │   │  (notify)   │
//! └──────────────┘   └──────────────────┘   └─────────────┘
//! ```
//!
//! ## Cancellation
//!
//! Shutdown abandons the probe phase of the running cycle (its tasks are
//! aborted), then attempts one final flush. A flush that has started always
//! runs to completion.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{SchedulerConfig, WatchConfig};
use crate::domains::root_domain;
use crate::error::Result;
use crate::groups::DomainGroupRegistry;
use crate::model::{DomainRecord, DomainStatus, Verdict};
use crate::probe::Prober;
use crate::store::VerdictStore;
use crate::trace::chain_domains;
use crate::traits::DomainRegistry;

/// Events emitted by the ProbeScheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// Scheduler started
    Started,

    /// A cycle began
    CycleStarted {
        cycle: u64,
        listed: usize,
        due: usize,
    },

    /// A domain was probed and its verdict recorded
    DomainProbed {
        domain: String,
        status: DomainStatus,
    },

    /// A probe task failed (panic or cancelled)
    ProbeFailed { domain: String, error: String },

    /// The batched flush failed; updates stay queued
    FlushFailed {
        pending: usize,
        /// Whether a later cycle is expected to succeed (lock contention, I/O)
        transient: bool,
        error: String,
    },

    /// A cycle finished
    CycleCompleted {
        cycle: u64,
        probed: usize,
        skipped: usize,
        flushed: usize,
    },

    /// Scheduler stopped
    Stopped { reason: String },
}

/// Counters of one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub cycle: u64,
    pub listed: usize,
    pub due: usize,
    pub probed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub evicted: usize,
    pub flushed: usize,
}

/// Per-domain scheduling state, rebuilt every cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub domain: String,
    pub polluted: bool,
    pub last_probe_at: Option<DateTime<Utc>>,
}

impl ScheduleEntry {
    /// Whether this domain waits for a later cycle
    ///
    /// Only domains flagged polluted are held back, and only until
    /// `abnormal_interval` has passed since their last probe.
    pub fn should_skip(&self, now: DateTime<Utc>, abnormal_interval: std::time::Duration) -> bool {
        if !self.polluted || abnormal_interval.is_zero() {
            return false;
        }
        let Some(last) = self.last_probe_at else {
            return false;
        };
        match chrono::Duration::from_std(abnormal_interval) {
            Ok(interval) => now.signed_duration_since(last) < interval,
            Err(_) => true,
        }
    }
}

/// Background probe scheduler
///
/// ## Lifecycle
///
/// 1. Create with [`ProbeScheduler::new()`]
/// 2. Start with [`ProbeScheduler::run()`]
/// 3. Runs until a shutdown signal is received
///
/// ## Load Resistance
///
/// - **Semaphore**: at most `max_concurrency` domains are probed at once
/// - **Bounded event channel**: events are dropped (logged) when full
/// - **Batched persistence**: one registry write per cycle
pub struct ProbeScheduler {
    prober: Arc<Prober>,
    registry: Arc<dyn DomainRegistry>,
    groups: DomainGroupRegistry,
    store: VerdictStore,
    config: SchedulerConfig,
    trace_enabled: bool,
    cycle: AtomicU64,
    event_tx: mpsc::Sender<SchedulerEvent>,
}

impl ProbeScheduler {
    /// Create a new scheduler
    ///
    /// # Returns
    ///
    /// A tuple of (scheduler, event_receiver) where event_receiver yields scheduler events
    pub fn new(
        prober: Arc<Prober>,
        registry: Arc<dyn DomainRegistry>,
        groups: DomainGroupRegistry,
        store: VerdictStore,
        config: &WatchConfig,
    ) -> Result<(Self, mpsc::Receiver<SchedulerEvent>)> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.scheduler.event_channel_capacity);

        let scheduler = Self {
            prober,
            registry,
            groups,
            store,
            config: config.scheduler.clone(),
            trace_enabled: config.trace.enabled,
            cycle: AtomicU64::new(0),
            event_tx: tx,
        };

        Ok((scheduler, rx))
    }

    /// Handle to the verdict store shared with readers
    pub fn store(&self) -> &VerdictStore {
        &self.store
    }

    /// Run until SIGINT
    pub async fn run(&self) -> Result<()> {
        self.run_internal(None).await
    }

    /// Run until `shutdown_rx` fires (or its sender is dropped)
    pub async fn run_with_shutdown(&self, shutdown_rx: oneshot::Receiver<()>) -> Result<()> {
        self.run_internal(Some(shutdown_rx)).await
    }

    async fn run_internal(&self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        self.emit_event(SchedulerEvent::Started);
        info!(
            "Probe scheduler started (interval {}s, max concurrency {})",
            self.config.probe_interval_secs, self.config.max_concurrency
        );

        let shutdown = async move {
            match shutdown_rx {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for shutdown signal: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
        };
        tokio::pin!(shutdown);

        loop {
            let cycle = self.next_cycle();
            tokio::select! {
                result = self.probe_phase(cycle) => {
                    match result {
                        Ok(summary) => {
                            // Never interrupted once started
                            self.finish_cycle(summary).await;
                        }
                        Err(e) => {
                            error!("Probe cycle {} failed: {}", cycle, e);
                        }
                    }
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received during cycle {}", cycle);
                    break;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.probe_interval()) => {}

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.emit_event(SchedulerEvent::Stopped {
            reason: "Shutdown signal".to_string(),
        });

        // Final flush before exiting
        match self.store.flush(self.registry.as_ref()).await {
            Ok(flushed) => info!("Flushed {} pending updates, scheduler stopped", flushed),
            Err(e) => {
                warn!(
                    "Final flush failed, {} updates not persisted: {}",
                    self.store.pending_len().await,
                    e
                );
            }
        }

        Ok(())
    }

    /// Run one complete cycle: probe everything due, then flush
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let cycle = self.next_cycle();
        let summary = self.probe_phase(cycle).await?;
        Ok(self.finish_cycle(summary).await)
    }

    fn next_cycle(&self) -> u64 {
        self.cycle.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Build the schedule for this cycle from the registry snapshot
    pub async fn schedule(&self, records: &BTreeMap<String, DomainRecord>) -> Vec<ScheduleEntry> {
        let mut entries = Vec::with_capacity(records.len());
        for (domain, record) in records {
            let in_memory = self.store.probed_at(domain).await;
            entries.push(ScheduleEntry {
                domain: domain.clone(),
                polluted: record.polluted,
                last_probe_at: record.last_probe_at.max(in_memory),
            });
        }
        entries
    }

    async fn probe_phase(&self, cycle: u64) -> Result<CycleSummary> {
        let records = self.registry.list_records().await?;

        let evicted = self.store.retain(|domain| records.contains_key(domain)).await;
        if evicted > 0 {
            debug!("Evicted {} verdicts of unlisted domains", evicted);
        }

        let now = Utc::now();
        let abnormal_interval = self.config.abnormal_probe_interval();
        let (due, held): (Vec<ScheduleEntry>, Vec<ScheduleEntry>) = self
            .schedule(&records)
            .await
            .into_iter()
            .partition(|entry| !entry.should_skip(now, abnormal_interval));

        self.emit_event(SchedulerEvent::CycleStarted {
            cycle,
            listed: records.len(),
            due: due.len(),
        });

        let mut summary = CycleSummary {
            cycle,
            listed: records.len(),
            due: due.len(),
            skipped: held.len(),
            evicted,
            ..Default::default()
        };

        let mut listed_roots: HashSet<String> = records.keys().map(|d| root_domain(d)).collect();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut tasks = JoinSet::new();

        for entry in due {
            let prober = self.prober.clone();
            let semaphore = semaphore.clone();
            let with_trace = self.trace_enabled;
            let domain = entry.domain;

            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return (domain, Err(e.to_string())),
                };
                let outcome = AssertUnwindSafe(prober.probe_verdict(&domain, with_trace))
                    .catch_unwind()
                    .await
                    .map_err(|panic| panic_message(panic.as_ref()));
                (domain, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(verdict))) => {
                    self.apply(verdict, &mut listed_roots).await;
                    summary.probed += 1;
                }
                Ok((domain, Err(message))) => {
                    error!(domain = %domain, "Probe task failed: {}", message);
                    self.emit_event(SchedulerEvent::ProbeFailed {
                        domain,
                        error: message,
                    });
                    summary.failed += 1;
                }
                Err(e) => {
                    error!("Probe task aborted: {}", e);
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }

    async fn finish_cycle(&self, mut summary: CycleSummary) -> CycleSummary {
        match self.store.flush(self.registry.as_ref()).await {
            Ok(flushed) => summary.flushed = flushed,
            Err(e) => {
                let pending = self.store.pending_len().await;
                if e.is_transient() {
                    warn!("Flush failed, {} updates requeued: {}", pending, e);
                } else {
                    error!("Flush failed, {} updates requeued: {}", pending, e);
                }
                self.emit_event(SchedulerEvent::FlushFailed {
                    pending,
                    transient: e.is_transient(),
                    error: e.to_string(),
                });
            }
        }

        info!(
            "Cycle {}: {} listed, {} probed, {} skipped, {} failed, {} flushed",
            summary.cycle,
            summary.listed,
            summary.probed,
            summary.skipped,
            summary.failed,
            summary.flushed
        );
        self.emit_event(SchedulerEvent::CycleCompleted {
            cycle: summary.cycle,
            probed: summary.probed,
            skipped: summary.skipped,
            flushed: summary.flushed,
        });
        summary
    }

    /// Record one verdict and what its redirect chain revealed
    async fn apply(&self, verdict: Verdict, listed_roots: &mut HashSet<String>) {
        let domain = verdict.domain.clone();
        let status = verdict.status;
        let chain = verdict
            .redirect_trace
            .as_ref()
            .map(|trace| chain_domains(&domain, trace))
            .unwrap_or_default();

        self.store.record(verdict).await;
        debug!(domain = %domain, %status, "Verdict recorded");
        self.emit_event(SchedulerEvent::DomainProbed {
            domain: domain.clone(),
            status,
        });

        if chain.len() < 2 {
            return;
        }

        if let Err(e) = self.groups.record_chain(&chain).await {
            warn!(domain = %domain, "Failed to record domain group: {}", e);
        }

        for root in chain {
            if listed_roots.contains(&root) {
                continue;
            }
            match self.registry.auto_add_domain(&root).await {
                Ok(_) => {
                    listed_roots.insert(root);
                }
                Err(e) => warn!(domain = %root, "Failed to auto-add domain: {}", e),
            }
        }
    }

    /// Emit a scheduler event, dropping it when the channel is full
    fn emit_event(&self, event: SchedulerEvent) {
        if self.event_tx.try_send(event).is_err() {
            warn!("Event channel full, dropping event. Consider increasing event_channel_capacity.");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}
