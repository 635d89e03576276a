//! Data model shared by the probe pipeline
//!
//! Everything here is plain data: answers produced by the resolver client,
//! the per-domain probe result, classifier output, redirect traces and the
//! records exchanged with the domain registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};

/// Deduplicated, sorted set of addresses
pub type IpSet = BTreeSet<IpAddr>;

static EMPTY_IPS: IpSet = BTreeSet::new();

fn default_dns_port() -> u16 {
    53
}

/// A nameserver the prober queries
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolverEndpoint {
    /// Nameserver address
    pub address: IpAddr,

    /// Nameserver port
    #[serde(default = "default_dns_port")]
    pub port: u16,

    /// Human readable label (e.g. "Google DNS")
    pub label: String,
}

impl ResolverEndpoint {
    /// Create an endpoint on the standard DNS port
    pub fn new(address: IpAddr, label: impl Into<String>) -> Self {
        Self {
            address,
            port: default_dns_port(),
            label: label.into(),
        }
    }

    /// Override the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Socket address to send queries to
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// Result of one resolver query (A then AAAA)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ResolverAnswer {
    /// The resolver answered; `ips` may legitimately be empty
    Ok {
        /// Union of A and AAAA records
        ips: IpSet,
    },
    /// The A query returned NXDOMAIN
    NxDomain,
    /// A query did not complete within its timeout
    Timeout,
    /// Any other resolver-level fault (SERVFAIL, REFUSED, malformed reply, socket error)
    Error {
        /// What went wrong
        message: String,
    },
}

impl ResolverAnswer {
    /// Create an `Ok` answer from any address iterator
    pub fn ok(ips: impl IntoIterator<Item = IpAddr>) -> Self {
        Self::Ok {
            ips: ips.into_iter().collect(),
        }
    }

    /// Create an `Error` answer
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Addresses carried by this answer (empty unless `Ok`)
    pub fn ips(&self) -> &IpSet {
        match self {
            Self::Ok { ips } => ips,
            _ => &EMPTY_IPS,
        }
    }
}

/// An answer attributed to the resolver that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedAnswer {
    /// Originating resolver
    #[serde(flatten)]
    pub resolver: ResolverEndpoint,

    /// What it returned
    #[serde(flatten)]
    pub answer: ResolverAnswer,
}

impl TaggedAnswer {
    pub fn new(resolver: ResolverEndpoint, answer: ResolverAnswer) -> Self {
        Self { resolver, answer }
    }
}

/// Union of the addresses of every `Ok` answer
pub fn union_ips<'a>(answers: impl IntoIterator<Item = &'a TaggedAnswer>) -> IpSet {
    answers
        .into_iter()
        .flat_map(|tagged| tagged.answer.ips().iter().copied())
        .collect()
}

/// One domain's full probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub domain: String,

    /// Baseline answers, positionally matched to the configured baseline set
    pub baseline: Vec<TaggedAnswer>,

    /// Regional answers, positionally matched to the configured regional set
    pub regional: Vec<TaggedAnswer>,

    /// Union of all `Ok` baseline answers
    #[serde(rename = "baselineIPs")]
    pub baseline_ips: IpSet,

    /// Wall time of the resolver fan-out; `None` when the overall deadline fired
    pub latency_ms: Option<u64>,

    pub redirect_trace: Option<RedirectTrace>,
}

impl ProbeResult {
    /// Assemble a result, deriving `baseline_ips` once
    pub fn new(
        domain: impl Into<String>,
        baseline: Vec<TaggedAnswer>,
        regional: Vec<TaggedAnswer>,
        latency_ms: Option<u64>,
    ) -> Self {
        let baseline_ips = union_ips(&baseline);
        Self {
            domain: domain.into(),
            baseline,
            regional,
            baseline_ips,
            latency_ms,
            redirect_trace: None,
        }
    }

    /// Result returned when the overall probe deadline expires
    pub fn deadline_exceeded(domain: impl Into<String>) -> Self {
        Self::new(domain, Vec::new(), Vec::new(), None)
    }
}

/// Classifier output for one regional answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    /// Answer is a subset of the baseline
    Normal,
    /// Answer differs from the baseline without hitting a block page
    ResolutionDifference,
    /// Answer contains a known block-page address
    Blocked,
    /// Nothing here and nothing in the baseline either
    Blank,
    /// NXDOMAIN or empty answer while the baseline has addresses
    InjectedBlock,
    Timeout,
    Error,
}

impl Category {
    /// Categories reported as pollution
    pub fn is_pollution(self) -> bool {
        matches!(self, Self::Blocked | Self::ResolutionDifference)
    }

    /// Categories reported as resolution failure
    pub fn is_resolution_failure(self) -> bool {
        matches!(self, Self::Timeout | Self::Error)
    }

    /// The resolver produced a usable answer
    pub fn reached(self) -> bool {
        matches!(self, Self::Normal | Self::Blank)
    }

    /// Evidence that a connection failure was caused by DNS rather than the origin
    pub fn is_dns_failure_evidence(self) -> bool {
        matches!(self, Self::InjectedBlock | Self::Timeout)
    }
}

/// A regional answer together with its category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedAnswer {
    #[serde(flatten)]
    pub resolver: ResolverEndpoint,

    #[serde(flatten)]
    pub answer: ResolverAnswer,

    pub category: Category,
}

/// Domain-level status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DomainStatus {
    Polluted,
    Clean,
    ResolutionFailed,
}

impl DomainStatus {
    /// Anything but `Clean`; this is what the persisted `polluted` flag records
    pub fn is_abnormal(self) -> bool {
        !matches!(self, Self::Clean)
    }
}

impl std::fmt::Display for DomainStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Polluted => "polluted",
            Self::Clean => "clean",
            Self::ResolutionFailed => "resolution-failed",
        })
    }
}

/// Outcome of the redirect trace as recorded on the verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TraceStatus {
    Traced,
    TraceFailed,
}

impl TraceStatus {
    pub fn from_success(success: bool) -> Self {
        if success { Self::Traced } else { Self::TraceFailed }
    }
}

/// Marker recorded instead of an HTTP code when DNS explains a failed hop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionMarker {
    BlankResolution,
    ResolutionFailed,
}

/// Status of one hop: an HTTP code (0 when no response arrived) or a DNS marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HopStatus {
    Code(u16),
    Resolution(ResolutionMarker),
}

impl HopStatus {
    pub const BLANK_RESOLUTION: Self = Self::Resolution(ResolutionMarker::BlankResolution);
    pub const RESOLUTION_FAILED: Self = Self::Resolution(ResolutionMarker::ResolutionFailed);
    pub const UNREACHABLE: Self = Self::Code(0);
}

/// One step of a redirect chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    pub url: String,
    pub status: HopStatus,
}

impl Hop {
    pub fn new(url: impl Into<String>, status: HopStatus) -> Self {
        Self {
            url: url.into(),
            status,
        }
    }
}

/// Result of following redirects from `https://domain`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectTrace {
    pub chain: Vec<Hop>,
    pub final_url: Option<String>,
    pub final_domain: Option<String>,
    pub final_status_code: Option<u16>,
    pub success: bool,
    pub trace_status: Option<TraceStatus>,
    pub error: Option<String>,
    pub is_empty_resolution: bool,
}

/// Baseline section of a verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineSummary {
    pub ips: IpSet,
    pub detail: Vec<TaggedAnswer>,
}

/// Domain-level judgment produced once per probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub domain: String,
    pub status: DomainStatus,

    /// De-duplicated, first occurrence wins
    pub reasons: Vec<String>,

    pub baseline: BaselineSummary,
    pub regional: Vec<ClassifiedAnswer>,
    pub redirect_trace: Option<RedirectTrace>,
    pub trace_status: Option<TraceStatus>,
    pub latency_ms: Option<u64>,
    pub probed_at: DateTime<Utc>,
}

impl Verdict {
    /// One-shot check result: the verdict plus a summary flag
    pub fn check_report(&self) -> CheckReport {
        CheckReport {
            available: self.status == DomainStatus::Clean,
            checked_at: self.probed_at,
            verdict: self.clone(),
        }
    }

    /// Update to queue for the domain registry
    pub fn pollution_update(&self) -> PollutionUpdate {
        PollutionUpdate {
            domain: self.domain.clone(),
            polluted: self.status.is_abnormal(),
            trace_status: self.trace_status,
            probed_at: self.probed_at,
        }
    }
}

/// Pending write of one domain's probe outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollutionUpdate {
    pub domain: String,
    pub polluted: bool,
    pub trace_status: Option<TraceStatus>,
    pub probed_at: DateTime<Utc>,
}

/// Persisted metadata of a monitored domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainRecord {
    #[serde(default)]
    pub reported: bool,

    #[serde(default)]
    pub polluted: bool,

    #[serde(default)]
    pub note: String,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub last_probe_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub trace_status: Option<TraceStatus>,
}

impl DomainRecord {
    /// Fresh record for a newly listed domain
    pub fn new(note: impl Into<String>) -> Self {
        Self {
            reported: false,
            polluted: false,
            note: note.into(),
            created_at: Utc::now(),
            last_probe_at: None,
            trace_status: None,
        }
    }

    /// Apply a probe outcome
    pub fn apply(&mut self, update: &PollutionUpdate) {
        self.polluted = update.polluted;
        self.trace_status = update.trace_status;
        self.last_probe_at = Some(update.probed_at);
    }
}

/// Verdict of an on-demand check, as printed by `rpzwatchd check`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckReport {
    /// The domain resolved cleanly from every regional vantage point
    pub available: bool,
    pub checked_at: DateTime<Utc>,
    #[serde(flatten)]
    pub verdict: Verdict,
}
