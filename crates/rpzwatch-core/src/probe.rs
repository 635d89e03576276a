//! Multi-Resolver Prober
//!
//! Queries every baseline and regional resolver for one domain at the same
//! time and assembles a [`ProbeResult`].
//!
//! - Each query runs in its own task, bounded by the timeout of its class
//! - Answers are matched back to their resolver by position, whatever the
//!   completion order
//! - A failed query task becomes an `Error` answer; its siblings are unaffected
//! - One overall deadline bounds the fan-out; when it fires, outstanding
//!   queries are aborted and an empty result without latency is returned

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::WatchConfig;
use crate::model::{ProbeResult, ResolverAnswer, ResolverEndpoint, TaggedAnswer, Verdict};
use crate::trace::RedirectTracer;
use crate::traits::ResolverClient;
use crate::verdict::Classifier;

/// Prober over fixed baseline and regional resolver sets
#[derive(Clone)]
pub struct Prober {
    resolver: Arc<dyn ResolverClient>,
    classifier: Classifier,
    tracer: Option<RedirectTracer>,
    baseline: Vec<ResolverEndpoint>,
    regional: Vec<ResolverEndpoint>,
    baseline_timeout: Duration,
    regional_timeout: Duration,
    deadline: Duration,
}

impl Prober {
    /// Create a prober without redirect tracing
    pub fn new(resolver: Arc<dyn ResolverClient>, config: &WatchConfig) -> Self {
        Self {
            resolver,
            classifier: Classifier::from_config(config),
            tracer: None,
            baseline: config.resolvers.baseline.clone(),
            regional: config.resolvers.regional.clone(),
            baseline_timeout: config.resolvers.baseline_timeout(),
            regional_timeout: config.resolvers.regional_timeout(),
            deadline: config.resolvers.probe_deadline(),
        }
    }

    /// Enable redirect tracing
    pub fn with_tracer(mut self, tracer: RedirectTracer) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Probe one domain
    ///
    /// The redirect trace only runs when `with_redirect_trace` is set and a
    /// tracer is configured. It receives the classified regional answers so
    /// it can interpret connection failures.
    pub async fn probe(&self, domain: &str, with_redirect_trace: bool) -> ProbeResult {
        let started = Instant::now();

        let handles: Vec<JoinHandle<ResolverAnswer>> = self
            .baseline
            .iter()
            .map(|endpoint| self.spawn_query(domain, endpoint, self.baseline_timeout))
            .chain(
                self.regional
                    .iter()
                    .map(|endpoint| self.spawn_query(domain, endpoint, self.regional_timeout)),
            )
            .collect();
        let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        let joined = match tokio::time::timeout(self.deadline, join_all(handles)).await {
            Ok(joined) => joined,
            Err(_) => {
                for handle in abort_handles {
                    handle.abort();
                }
                warn!(domain, "Probe deadline of {:?} exceeded", self.deadline);
                return ProbeResult::deadline_exceeded(domain);
            }
        };
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let mut answers = joined.into_iter().map(|joined| {
            joined.unwrap_or_else(|e| ResolverAnswer::error(format!("query task failed: {}", e)))
        });
        let baseline = tag(&self.baseline, &mut answers);
        let regional = tag(&self.regional, &mut answers);

        let mut result = ProbeResult::new(domain, baseline, regional, Some(latency_ms));
        debug!(domain, latency_ms, "Resolver fan-out complete");

        if with_redirect_trace {
            if let Some(tracer) = &self.tracer {
                let classified = self
                    .classifier
                    .classify_all(&result.regional, &result.baseline_ips);
                result.redirect_trace = Some(tracer.trace(domain, Some(&classified)).await);
            }
        }

        result
    }

    /// Probe one domain and aggregate the verdict
    pub async fn probe_verdict(&self, domain: &str, with_redirect_trace: bool) -> Verdict {
        let result = self.probe(domain, with_redirect_trace).await;
        self.classifier.aggregate(result)
    }

    fn spawn_query(
        &self,
        domain: &str,
        endpoint: &ResolverEndpoint,
        timeout: Duration,
    ) -> JoinHandle<ResolverAnswer> {
        let resolver = self.resolver.clone();
        let domain = domain.to_string();
        let endpoint = endpoint.clone();
        tokio::spawn(async move { resolver.query(&domain, &endpoint, timeout).await })
    }
}

fn tag(
    endpoints: &[ResolverEndpoint],
    answers: &mut impl Iterator<Item = ResolverAnswer>,
) -> Vec<TaggedAnswer> {
    endpoints
        .iter()
        .zip(answers)
        .map(|(endpoint, answer)| TaggedAnswer::new(endpoint.clone(), answer))
        .collect()
}
