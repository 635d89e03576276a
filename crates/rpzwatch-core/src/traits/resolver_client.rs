// # Resolver Client Trait
//
// Defines the interface for querying a single nameserver.
//
// ## Implementations
//
// - hickory-resolver, UDP with TCP fallback: `crate::resolver::HickoryResolverClient`
// - Scripted answers: contract test doubles
//
// ## Contract
//
// An implementation never returns an error value: every fault is folded
// into a `ResolverAnswer` variant so one failing resolver cannot abort the
// fan-out it is part of.

use crate::model::{ResolverAnswer, ResolverEndpoint};
use async_trait::async_trait;
use std::time::Duration;

/// Trait for resolver client implementations
///
/// # Thread Safety
///
/// Implementations must be thread-safe; the prober issues every baseline
/// and regional query concurrently through one shared client.
#[async_trait]
pub trait ResolverClient: Send + Sync {
    /// Look up the A and AAAA records of `domain` at `resolver`
    ///
    /// # Parameters
    ///
    /// - `domain`: Name to resolve
    /// - `resolver`: Nameserver to ask
    /// - `timeout`: Bound applied to each of the two queries
    ///
    /// # Returns
    ///
    /// - `Ok { ips }`: Sorted, deduplicated union of both record types (may be empty)
    /// - `NxDomain`: The A query returned NXDOMAIN; AAAA was not attempted
    /// - `Timeout`: Either query timed out
    /// - `Error { message }`: Any other fault
    async fn query(
        &self,
        domain: &str,
        resolver: &ResolverEndpoint,
        timeout: Duration,
    ) -> ResolverAnswer;
}
