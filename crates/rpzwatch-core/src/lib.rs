// # rpzwatch-core
//
// Core library for detecting DNS-level interception (RPZ rewrites, injected
// NXDOMAIN answers, block-page redirects) by comparing baseline resolvers
// against regional resolvers.
//
// ## Architecture Overview
//
// - **ResolverClient**: one A/AAAA lookup against one nameserver
// - **Prober**: concurrent fan-out over the baseline and regional resolver sets
// - **Classifier**: maps every regional answer to a `Category` and aggregates a `Verdict`
// - **RedirectTracer**: follows the HTTPS redirect chain, interpreting connection
//   failures with DNS evidence
// - **DomainGroupRegistry**: equivalence classes of domains seen in one redirect chain
// - **VerdictStore** / **ProbeScheduler**: latest verdict per domain, periodic
//   re-probing, batched persistence of pollution state
//
// ## Data Flow
//
// domain list → Prober → Classifier → RedirectTracer → DomainGroupRegistry
// → VerdictStore → batched flush to the DomainRegistry

pub mod config;
pub mod domains;
pub mod error;
pub mod groups;
pub mod model;
pub mod persist;
pub mod probe;
pub mod resolver;
pub mod scheduler;
pub mod store;
pub mod trace;
pub mod traits;
pub mod verdict;

// Re-export core types for convenience
pub use config::WatchConfig;
pub use domains::{FileDomainRegistry, MemoryDomainRegistry, normalize_domain, root_domain};
pub use error::{Error, Result};
pub use groups::DomainGroupRegistry;
pub use model::{
    Category, CheckReport, ClassifiedAnswer, DomainRecord, DomainStatus, ProbeResult,
    RedirectTrace, ResolverAnswer, ResolverEndpoint, TraceStatus, Verdict,
};
pub use probe::Prober;
pub use resolver::HickoryResolverClient;
pub use scheduler::{ProbeScheduler, SchedulerEvent};
pub use store::VerdictStore;
pub use trace::{RedirectTracer, ReqwestFetcher};
pub use traits::{DomainRegistry, HttpFetcher, ResolverClient};
pub use verdict::Classifier;
