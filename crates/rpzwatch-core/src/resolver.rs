// # Resolver Client
//
// Client-side A/AAAA lookups against one fixed nameserver, built on
// `hickory-resolver`.
//
// ## Resolver Setup
//
// One `TokioAsyncResolver` per (nameserver, timeout) pair, created on first
// use and reused afterwards:
// - UDP first, TCP when the reply is truncated
// - One attempt, no cache, no hosts file, no search domains
//
// ## Answer Mapping
//
// | A query          | AAAA query | answer                 |
// |------------------|------------|------------------------|
// | NXDOMAIN         | not sent   | `NxDomain`             |
// | timeout          | any        | `Timeout`              |
// | NOERROR          | NOERROR    | `Ok` (union, may be empty) |
// | NOERROR          | NXDOMAIN   | `Ok` (A records only)  |
// | other rcode/fault| any        | `Error { message }`    |

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::error::ProtoErrorKind;
use hickory_resolver::proto::op::ResponseCode;
use hickory_resolver::proto::rr::{Name, RData, RecordType};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::model::{IpSet, ResolverAnswer, ResolverEndpoint};
use crate::traits::ResolverClient;

/// Outcome of one record-type lookup
#[derive(Debug)]
enum Lookup {
    Records(Vec<IpAddr>),
    NxDomain,
    Timeout,
    Failed(String),
}

/// Resolver client querying each endpoint directly over plain DNS
#[derive(Clone, Default)]
pub struct HickoryResolverClient {
    resolvers: Arc<Mutex<HashMap<(SocketAddr, Duration), TokioAsyncResolver>>>,
}

impl std::fmt::Debug for HickoryResolverClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HickoryResolverClient").finish_non_exhaustive()
    }
}

impl HickoryResolverClient {
    pub fn new() -> Self {
        Self::default()
    }

    async fn resolver_for(&self, server: SocketAddr, timeout: Duration) -> TokioAsyncResolver {
        let mut resolvers = self.resolvers.lock().await;
        resolvers
            .entry((server, timeout))
            .or_insert_with(|| build_resolver(server, timeout))
            .clone()
    }

    async fn lookup(
        &self,
        resolver: &TokioAsyncResolver,
        name: &Name,
        record_type: RecordType,
        timeout: Duration,
    ) -> Lookup {
        match tokio::time::timeout(timeout, resolver.lookup(name.clone(), record_type)).await {
            Err(_) => Lookup::Timeout,
            Ok(Err(e)) => interpret_error(&e),
            Ok(Ok(lookup)) => Lookup::Records(
                lookup
                    .iter()
                    .filter_map(|rdata| match rdata {
                        RData::A(a) if record_type == RecordType::A => Some(IpAddr::V4(a.0)),
                        RData::AAAA(aaaa) if record_type == RecordType::AAAA => {
                            Some(IpAddr::V6(aaaa.0))
                        }
                        _ => None,
                    })
                    .collect(),
            ),
        }
    }
}

fn build_resolver(server: SocketAddr, timeout: Duration) -> TokioAsyncResolver {
    let config = ResolverConfig::from_parts(
        None,
        Vec::new(),
        NameServerConfigGroup::from_ips_clear(&[server.ip()], server.port(), true),
    );

    let mut opts = ResolverOpts::default();
    opts.timeout = timeout;
    opts.attempts = 1;
    opts.cache_size = 0;
    opts.use_hosts_file = false;
    opts.num_concurrent_reqs = 1;
    opts.preserve_intermediates = false;

    TokioAsyncResolver::tokio(config, opts)
}

fn interpret_error(err: &ResolveError) -> Lookup {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { response_code, .. } => match *response_code {
            ResponseCode::NoError => Lookup::Records(Vec::new()),
            ResponseCode::NXDomain => Lookup::NxDomain,
            code => Lookup::Failed(format!("{:?}", code)),
        },
        ResolveErrorKind::Timeout => Lookup::Timeout,
        ResolveErrorKind::Proto(proto) if matches!(proto.kind(), ProtoErrorKind::Timeout) => {
            Lookup::Timeout
        }
        _ => Lookup::Failed(err.to_string()),
    }
}

fn parse_name(domain: &str) -> Result<Name, String> {
    let trimmed = domain.trim().trim_end_matches('.');
    if trimmed.is_empty() || trimmed.contains(char::is_whitespace) {
        return Err(format!("invalid domain name: {:?}", domain));
    }
    Name::from_ascii(format!("{}.", trimmed)).map_err(|e| format!("invalid domain name {:?}: {}", domain, e))
}

#[async_trait]
impl ResolverClient for HickoryResolverClient {
    async fn query(
        &self,
        domain: &str,
        resolver: &ResolverEndpoint,
        timeout: Duration,
    ) -> ResolverAnswer {
        let name = match parse_name(domain) {
            Ok(name) => name,
            Err(message) => return ResolverAnswer::error(message),
        };
        let client = self.resolver_for(resolver.socket_addr(), timeout).await;
        let mut ips = IpSet::new();

        match self.lookup(&client, &name, RecordType::A, timeout).await {
            Lookup::Records(records) => ips.extend(records),
            Lookup::NxDomain => {
                debug!(domain, resolver = %resolver.label, "NXDOMAIN");
                return ResolverAnswer::NxDomain;
            }
            Lookup::Timeout => {
                debug!(domain, resolver = %resolver.label, "A query timed out");
                return ResolverAnswer::Timeout;
            }
            Lookup::Failed(message) => {
                debug!(domain, resolver = %resolver.label, "A query failed: {}", message);
                return ResolverAnswer::error(message);
            }
        }

        match self.lookup(&client, &name, RecordType::AAAA, timeout).await {
            Lookup::Records(records) => ips.extend(records),
            Lookup::NxDomain => {}
            Lookup::Timeout => {
                debug!(domain, resolver = %resolver.label, "AAAA query timed out");
                return ResolverAnswer::Timeout;
            }
            Lookup::Failed(message) => {
                debug!(domain, resolver = %resolver.label, "AAAA query failed: {}", message);
                return ResolverAnswer::error(message);
            }
        }

        debug!(domain, resolver = %resolver.label, "Resolved {} address(es)", ips.len());
        ResolverAnswer::Ok { ips }
    }
}
