//! Core traits for rpzwatch
//!
//! The abstract seams between the probe pipeline and the outside world.
//!
//! - [`ResolverClient`]: one lookup against one nameserver
//! - [`HttpFetcher`]: one HTTP GET with redirects disabled
//! - [`DomainRegistry`]: the monitored domain list and its persisted metadata

pub mod domain_registry;
pub mod http_fetcher;
pub mod resolver_client;

pub use domain_registry::DomainRegistry;
pub use http_fetcher::{FetchError, HopResponse, HttpFetcher};
pub use resolver_client::ResolverClient;
