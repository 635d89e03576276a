//! Redirect Tracer
//!
//! Follows the HTTP redirect chain from `https://<domain>/` one hop at a
//! time, recording every URL and status. Certificates are not validated:
//! the question is whether the origin is reachable, not whether it is
//! trusted.
//!
//! ## Connection Failures
//!
//! A host that cannot be reached is interpreted with DNS evidence for its
//! root domain:
//!
//! 1. Any regional answer classified `InjectedBlock` or `Timeout` means the
//!    failure was caused by resolution (`"resolution-failed"` hop)
//! 2. Otherwise a listed domain that is not flagged polluted has a benign
//!    empty resolution (`"blank-resolution"` hop, trace succeeds)
//! 3. Otherwise it is a plain connection failure (hop code 0)
//!
//! Evidence comes from the answers passed in when the failing host is the
//! domain under probe, and from the stored verdict of that root otherwise.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::config::TraceConfig;
use crate::domains::{root_domain, url_root_domain};
use crate::error::{Error, Result};
use crate::model::{Category, ClassifiedAnswer, Hop, HopStatus, RedirectTrace, TraceStatus};
use crate::store::VerdictStore;
use crate::traits::{DomainRegistry, FetchError, HopResponse, HttpFetcher};

/// Status codes followed as redirects
pub const REDIRECT_CODES: [u16; 5] = [301, 302, 303, 307, 308];

/// Terminal codes that count as "the origin answered"
pub const SUCCESS_CODES: [u16; 2] = [200, 404];

pub const ERROR_RESOLUTION_FAILED: &str = "resolution failed";
pub const ERROR_CONNECTION_FAILED: &str = "connection failed";
pub const ERROR_TIMEOUT: &str = "timeout";
pub const ERROR_TOO_MANY_REDIRECTS: &str = "too many redirects";
pub const ERROR_MISSING_LOCATION: &str = "redirect without Location header";

/// `HttpFetcher` backed by reqwest
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    /// Build a client that never follows redirects and accepts any certificate
    pub fn new(config: &TraceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::http(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn fetch(&self, url: &Url) -> std::result::Result<HopResponse, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(classify_error)?;

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        Ok(HopResponse::new(response.status().as_u16(), location))
    }
}

fn classify_error(err: reqwest::Error) -> FetchError {
    // Connect timeouts report both flags; timeout wins
    if err.is_timeout() {
        FetchError::Timeout
    } else if err.is_connect() {
        FetchError::Connect(err.to_string())
    } else {
        FetchError::Other(err.to_string())
    }
}

/// Redirect tracer
#[derive(Clone)]
pub struct RedirectTracer {
    fetcher: Arc<dyn HttpFetcher>,
    registry: Arc<dyn DomainRegistry>,
    store: VerdictStore,
    max_hops: usize,
}

impl RedirectTracer {
    /// # Parameters
    ///
    /// - `fetcher`: Network access for each hop
    /// - `registry`: Answers "is this root listed, and is it flagged polluted"
    /// - `store`: Latest verdicts, the DNS evidence for hosts other than the probed domain
    /// - `max_hops`: Upper bound on recorded hops
    pub fn new(
        fetcher: Arc<dyn HttpFetcher>,
        registry: Arc<dyn DomainRegistry>,
        store: VerdictStore,
        max_hops: usize,
    ) -> Self {
        Self {
            fetcher,
            registry,
            store,
            max_hops,
        }
    }

    /// Trace `https://<domain>/`
    ///
    /// `classified` are the regional answers of the probe in progress, if the
    /// caller has them.
    pub async fn trace(&self, domain: &str, classified: Option<&[ClassifiedAnswer]>) -> RedirectTrace {
        let mut trace = RedirectTrace::default();

        let mut url = match Url::parse(&format!("https://{}/", domain)) {
            Ok(url) => url,
            Err(e) => {
                fail(&mut trace, format!("invalid start URL: {}", e));
                return trace;
            }
        };

        self.follow(&mut trace, domain, &mut url, classified).await;
        finish(&mut trace);
        debug!(
            domain,
            hops = trace.chain.len(),
            success = trace.success,
            "Redirect trace finished"
        );
        trace
    }

    async fn follow(
        &self,
        trace: &mut RedirectTrace,
        domain: &str,
        url: &mut Url,
        classified: Option<&[ClassifiedAnswer]>,
    ) {
        for _ in 0..self.max_hops {
            let response = match self.fetcher.fetch(url).await {
                Ok(response) => response,
                Err(FetchError::Timeout) => {
                    trace.chain.push(Hop::new(url.as_str(), HopStatus::UNREACHABLE));
                    fail(trace, ERROR_TIMEOUT);
                    return;
                }
                Err(FetchError::Connect(message)) => {
                    debug!(url = %url, "Connection failed: {}", message);
                    self.explain_connect_failure(trace, domain, url, classified).await;
                    return;
                }
                Err(FetchError::Other(message)) => {
                    fail(trace, message);
                    return;
                }
            };

            trace.chain.push(Hop::new(url.as_str(), HopStatus::Code(response.status)));

            if !REDIRECT_CODES.contains(&response.status) {
                trace.final_url = Some(url.to_string());
                trace.final_status_code = Some(response.status);
                trace.success = SUCCESS_CODES.contains(&response.status);
                trace.trace_status = Some(TraceStatus::from_success(trace.success));
                return;
            }

            let Some(location) = response.location else {
                trace.final_url = Some(url.to_string());
                trace.final_status_code = Some(response.status);
                fail(trace, ERROR_MISSING_LOCATION);
                return;
            };

            match resolve_location(url, &location) {
                Ok(next) => *url = next,
                Err(e) => {
                    fail(trace, format!("invalid redirect location {:?}: {}", location, e));
                    return;
                }
            }
        }

        fail(trace, ERROR_TOO_MANY_REDIRECTS);
    }

    async fn explain_connect_failure(
        &self,
        trace: &mut RedirectTrace,
        domain: &str,
        url: &Url,
        classified: Option<&[ClassifiedAnswer]>,
    ) {
        let host = url.host_str().unwrap_or_default();
        let root = root_domain(host);

        let evidence: Vec<Category> = match classified {
            Some(answers) if root == root_domain(domain) => {
                answers.iter().map(|a| a.category).collect()
            }
            _ => match self.stored_verdict(&root, host).await {
                Some(verdict) => verdict.regional.iter().map(|a| a.category).collect(),
                None => Vec::new(),
            },
        };

        if evidence.iter().any(|c| c.is_dns_failure_evidence()) {
            trace.chain.push(Hop::new(url.as_str(), HopStatus::RESOLUTION_FAILED));
            fail(trace, ERROR_RESOLUTION_FAILED);
            return;
        }

        if self.listed_and_unflagged(&root, host).await {
            trace.chain.push(Hop::new(url.as_str(), HopStatus::BLANK_RESOLUTION));
            trace.final_url = Some(url.to_string());
            trace.success = true;
            trace.is_empty_resolution = true;
            trace.trace_status = Some(TraceStatus::Traced);
            return;
        }

        trace.chain.push(Hop::new(url.as_str(), HopStatus::UNREACHABLE));
        fail(trace, ERROR_CONNECTION_FAILED);
    }

    async fn stored_verdict(&self, root: &str, host: &str) -> Option<crate::model::Verdict> {
        match self.store.get(root).await {
            Some(verdict) => Some(verdict),
            None => self.store.get(host).await,
        }
    }

    async fn listed_and_unflagged(&self, root: &str, host: &str) -> bool {
        for name in [root, host] {
            match self.registry.get_domain(name).await {
                Ok(Some(record)) => return !record.polluted,
                Ok(None) => {}
                Err(e) => {
                    warn!(domain = name, "Registry lookup failed, treating as unknown: {}", e);
                    return false;
                }
            }
        }
        false
    }
}

fn fail(trace: &mut RedirectTrace, error: impl Into<String>) {
    trace.success = false;
    trace.error = Some(error.into());
    trace.trace_status = Some(TraceStatus::TraceFailed);
}

fn finish(trace: &mut RedirectTrace) {
    if trace.final_url.is_none() {
        trace.final_url = trace.chain.last().map(|hop| hop.url.clone());
    }
    trace.final_domain = trace
        .final_url
        .as_deref()
        .and_then(|u| Url::parse(u).ok())
        .and_then(|u| u.host_str().map(str::to_string));
}

/// Resolve a `Location` header against the current URL
///
/// - `//host/path` keeps the current scheme
/// - `/path` keeps the current scheme, host and port
/// - anything else must be an absolute URL
pub fn resolve_location(current: &Url, location: &str) -> std::result::Result<Url, url::ParseError> {
    let location = location.trim();
    if let Some(rest) = location.strip_prefix("//") {
        Url::parse(&format!("{}://{}", current.scheme(), rest))
    } else if location.starts_with('/') {
        current.join(location)
    } else {
        Url::parse(location)
    }
}

/// Root domains touched by a probe: the probed domain, every hop host and
/// the final host, deduplicated in order of appearance
pub fn chain_domains(domain: &str, trace: &RedirectTrace) -> Vec<String> {
    let mut roots: Vec<String> = Vec::new();
    let mut push = |root: String| {
        if !root.is_empty() && !roots.contains(&root) {
            roots.push(root);
        }
    };

    push(root_domain(domain));
    for hop in &trace.chain {
        if let Some(root) = url_root_domain(&hop.url) {
            push(root);
        }
    }
    if let Some(final_domain) = &trace.final_domain {
        push(root_domain(final_domain));
    }
    roots
}
