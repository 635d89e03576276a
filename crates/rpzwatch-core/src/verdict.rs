//! Verdict Classifier
//!
//! `classify` maps one regional answer to a [`Category`] given the baseline
//! address set; `aggregate` folds every category of a probe into one
//! domain-level [`Verdict`]. Both are pure apart from the timestamp stamped
//! on the verdict.
//!
//! ## Classification Order
//!
//! 1. `Timeout` / `Error` answers keep their failure category
//! 2. NXDOMAIN or an empty answer is `Blank` when the baseline is empty too,
//!    `InjectedBlock` otherwise
//! 3. Any known block-page address makes the answer `Blocked`, even when it
//!    also appears in the baseline
//! 4. A subset of the baseline is `Normal`
//! 5. Anything else is a `ResolutionDifference`

use chrono::{DateTime, Utc};
use std::net::IpAddr;

use crate::config::WatchConfig;
use crate::model::{
    BaselineSummary, Category, ClassifiedAnswer, DomainStatus, IpSet, ProbeResult, RedirectTrace,
    ResolverAnswer, TaggedAnswer, TraceStatus, Verdict,
};

pub const REASON_BLOCK_PAGE: &str = "polluted: block page";
pub const REASON_RESOLUTION_DIFFERENCE: &str = "polluted: resolution difference";
pub const REASON_TIMEOUT: &str = "resolution failed: timeout";
pub const REASON_ERROR: &str = "resolution failed";
pub const REASON_NO_REGIONAL_ANSWERS: &str = "resolution failed: no regional answers";

/// Classifier holding the known block-page addresses
#[derive(Debug, Clone)]
pub struct Classifier {
    block_page_ips: IpSet,
}

impl Classifier {
    pub fn new(block_page_ips: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            block_page_ips: block_page_ips.into_iter().collect(),
        }
    }

    pub fn from_config(config: &WatchConfig) -> Self {
        Self::new(config.block_page_ips.iter().copied())
    }

    /// Category of one regional answer
    pub fn classify(&self, answer: &ResolverAnswer, baseline_ips: &IpSet) -> Category {
        let ips = match answer {
            ResolverAnswer::Timeout => return Category::Timeout,
            ResolverAnswer::Error { .. } => return Category::Error,
            ResolverAnswer::NxDomain => return Self::empty_answer(baseline_ips),
            ResolverAnswer::Ok { ips } if ips.is_empty() => return Self::empty_answer(baseline_ips),
            ResolverAnswer::Ok { ips } => ips,
        };

        if !ips.is_disjoint(&self.block_page_ips) {
            Category::Blocked
        } else if ips.is_subset(baseline_ips) {
            Category::Normal
        } else {
            Category::ResolutionDifference
        }
    }

    fn empty_answer(baseline_ips: &IpSet) -> Category {
        if baseline_ips.is_empty() {
            Category::Blank
        } else {
            Category::InjectedBlock
        }
    }

    /// Classify every answer, preserving order
    pub fn classify_all(&self, answers: &[TaggedAnswer], baseline_ips: &IpSet) -> Vec<ClassifiedAnswer> {
        answers
            .iter()
            .map(|tagged| ClassifiedAnswer {
                resolver: tagged.resolver.clone(),
                answer: tagged.answer.clone(),
                category: self.classify(&tagged.answer, baseline_ips),
            })
            .collect()
    }

    /// Domain-level verdict stamped with the current time
    pub fn aggregate(&self, result: ProbeResult) -> Verdict {
        self.aggregate_at(result, Utc::now())
    }

    /// Domain-level verdict stamped with `probed_at`
    pub fn aggregate_at(&self, result: ProbeResult, probed_at: DateTime<Utc>) -> Verdict {
        let regional = self.classify_all(&result.regional, &result.baseline_ips);

        let mut reasons: Vec<String> = Vec::new();
        for answer in &regional {
            if let Some(reason) = reason_for(answer.category) {
                if !reasons.iter().any(|r| r == reason) {
                    reasons.push(reason.to_string());
                }
            }
        }

        let status = domain_status(&regional);
        if regional.is_empty() {
            reasons.push(REASON_NO_REGIONAL_ANSWERS.to_string());
        }

        let trace_status = trace_status(&result.baseline_ips, result.redirect_trace.as_ref());

        Verdict {
            domain: result.domain,
            status,
            reasons,
            baseline: BaselineSummary {
                ips: result.baseline_ips,
                detail: result.baseline,
            },
            regional,
            redirect_trace: result.redirect_trace,
            trace_status,
            latency_ms: result.latency_ms,
            probed_at,
        }
    }
}

/// Reason string reported for a category, if any
pub fn reason_for(category: Category) -> Option<&'static str> {
    match category {
        Category::Blocked => Some(REASON_BLOCK_PAGE),
        Category::ResolutionDifference => Some(REASON_RESOLUTION_DIFFERENCE),
        Category::Timeout => Some(REASON_TIMEOUT),
        Category::Error => Some(REASON_ERROR),
        Category::Normal | Category::Blank | Category::InjectedBlock => None,
    }
}

/// Aggregate status of classified regional answers
///
/// `ResolutionFailed` requires that no resolver reached a usable answer and
/// that at least one failed outright (or that there are no answers at all).
pub fn domain_status(regional: &[ClassifiedAnswer]) -> DomainStatus {
    if regional.iter().any(|a| a.category.is_pollution()) {
        return DomainStatus::Polluted;
    }

    let reached = regional.iter().any(|a| a.category.reached());
    let failed = regional.iter().any(|a| a.category.is_resolution_failure());
    if !reached && (failed || regional.is_empty()) {
        DomainStatus::ResolutionFailed
    } else {
        DomainStatus::Clean
    }
}

/// Trace status recorded on a verdict
///
/// A domain without baseline addresses has no origin to trace and counts
/// as traced.
pub fn trace_status(baseline_ips: &IpSet, trace: Option<&RedirectTrace>) -> Option<TraceStatus> {
    if baseline_ips.is_empty() {
        return Some(TraceStatus::Traced);
    }
    trace.map(|t| TraceStatus::from_success(t.success))
}
