// # rpzwatchd - DNS Interception Monitor Daemon
//
// Thin integration layer over rpzwatch-core. All probing, classification,
// tracing and persistence logic lives in the core crate.
//
// The rpzwatchd daemon is responsible for:
// 1. Reading configuration from environment variables
// 2. Initializing logging and the runtime
// 3. Wiring the resolver client, HTTP fetcher and file-backed registries
// 4. Running the probe scheduler until SIGTERM / SIGINT
//
// ## Usage
//
// ```text
// rpzwatchd                     run the scheduler
// rpzwatchd check <domain>...   probe each domain once and print its verdict as JSON
// rpzwatchd import <file>       add a domain list to the domains file
// ```
//
// ## Configuration
//
// ### Resolvers
// - `RPZWATCH_BASELINE_RESOLVERS`: Comma-separated `ip[:port]=label` entries
// - `RPZWATCH_REGIONAL_RESOLVERS`: Same format
// - `RPZWATCH_BLOCK_PAGE_IPS`: Comma-separated block-page addresses
// - `RPZWATCH_BASELINE_TIMEOUT_MS` / `RPZWATCH_REGIONAL_TIMEOUT_MS`: Per-query timeouts
// - `RPZWATCH_PROBE_DEADLINE_SECS`: Deadline for one domain's resolver fan-out
//
// ### Scheduler
// - `RPZWATCH_PROBE_INTERVAL_SECS`: Sleep between cycles
// - `RPZWATCH_ABNORMAL_PROBE_INTERVAL_SECS`: Re-probe interval of polluted domains
// - `RPZWATCH_MAX_CONCURRENCY`: Domains probed at once
//
// ### Redirect Tracer
// - `RPZWATCH_TRACE_ENABLED`: `true` / `false`
// - `RPZWATCH_MAX_REDIRECTS`: Maximum hops per trace
// - `RPZWATCH_TRACE_TIMEOUT_SECS`: Per-request timeout
//
// ### Storage
// - `RPZWATCH_DOMAINS_FILE`: Domain metadata JSON file
// - `RPZWATCH_GROUPS_FILE`: Domain group JSON file
// - `RPZWATCH_LOCK_TIMEOUT_MS`: Bounded wait for the sidecar locks
//
// ### Logging
// - `RPZWATCH_LOG_LEVEL`: trace, debug, info, warn, error
//
// ## Example
//
// ```bash
// export RPZWATCH_REGIONAL_RESOLVERS="168.95.1.1=Chunghwa Telecom,101.101.101.101=TWNIC"
// export RPZWATCH_DOMAINS_FILE=/var/lib/rpzwatch/domains.json
// export RPZWATCH_GROUPS_FILE=/var/lib/rpzwatch/domain_groups.json
//
// rpzwatchd
// ```

use anyhow::{Context, Result};
use rpzwatch_core::domains::parse_domain_list;
use rpzwatch_core::{
    DomainGroupRegistry, FileDomainRegistry, HickoryResolverClient, MemoryDomainRegistry,
    ProbeScheduler, Prober, RedirectTracer, ReqwestFetcher, ResolverEndpoint, SchedulerEvent,
    VerdictStore, WatchConfig, normalize_domain,
};
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum RpzwatchExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error, usage error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<RpzwatchExitCode> for ExitCode {
    fn from(code: RpzwatchExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// What the process was asked to do
enum Command {
    Run,
    Check(Vec<String>),
    Import(String),
}

impl Command {
    fn from_args(mut args: impl Iterator<Item = String>) -> Result<Self> {
        match args.next().as_deref() {
            None => Ok(Self::Run),
            Some("check") => {
                let domains: Vec<String> = args.collect();
                if domains.is_empty() {
                    anyhow::bail!("Usage: rpzwatchd check <domain>...");
                }
                Ok(Self::Check(domains))
            }
            Some("import") => match (args.next(), args.next()) {
                (Some(path), None) => Ok(Self::Import(path)),
                _ => anyhow::bail!("Usage: rpzwatchd import <file>"),
            },
            Some(other) => anyhow::bail!(
                "Unknown command '{}'. Commands: check <domain>..., import <file>",
                other
            ),
        }
    }
}

/// Application configuration
struct Config {
    watch: WatchConfig,
    log_level: String,
}

impl Config {
    /// Load configuration from environment variables on top of the defaults
    fn from_env() -> Result<Self> {
        let mut watch = WatchConfig::new();

        if let Some(list) = env_var("RPZWATCH_BASELINE_RESOLVERS") {
            watch.resolvers.baseline = parse_resolvers(&list)
                .context("RPZWATCH_BASELINE_RESOLVERS is invalid")?;
        }
        if let Some(list) = env_var("RPZWATCH_REGIONAL_RESOLVERS") {
            watch.resolvers.regional = parse_resolvers(&list)
                .context("RPZWATCH_REGIONAL_RESOLVERS is invalid")?;
        }
        if let Some(list) = env_var("RPZWATCH_BLOCK_PAGE_IPS") {
            watch.block_page_ips = split_list(&list)
                .map(|ip| {
                    ip.parse::<IpAddr>()
                        .with_context(|| format!("RPZWATCH_BLOCK_PAGE_IPS: invalid address '{}'", ip))
                })
                .collect::<Result<_>>()?;
        }

        set_parsed("RPZWATCH_BASELINE_TIMEOUT_MS", &mut watch.resolvers.baseline_timeout_ms)?;
        set_parsed("RPZWATCH_REGIONAL_TIMEOUT_MS", &mut watch.resolvers.regional_timeout_ms)?;
        set_parsed("RPZWATCH_PROBE_DEADLINE_SECS", &mut watch.resolvers.probe_deadline_secs)?;
        set_parsed("RPZWATCH_PROBE_INTERVAL_SECS", &mut watch.scheduler.probe_interval_secs)?;
        set_parsed(
            "RPZWATCH_ABNORMAL_PROBE_INTERVAL_SECS",
            &mut watch.scheduler.abnormal_probe_interval_secs,
        )?;
        set_parsed("RPZWATCH_MAX_CONCURRENCY", &mut watch.scheduler.max_concurrency)?;
        set_parsed("RPZWATCH_TRACE_ENABLED", &mut watch.trace.enabled)?;
        set_parsed("RPZWATCH_MAX_REDIRECTS", &mut watch.trace.max_hops)?;
        set_parsed("RPZWATCH_TRACE_TIMEOUT_SECS", &mut watch.trace.timeout_secs)?;
        set_parsed("RPZWATCH_LOCK_TIMEOUT_MS", &mut watch.storage.lock_timeout_ms)?;

        if let Some(path) = env_var("RPZWATCH_DOMAINS_FILE") {
            watch.storage.domains_path = path.into();
        }
        if let Some(path) = env_var("RPZWATCH_GROUPS_FILE") {
            watch.storage.groups_path = path.into();
        }

        Ok(Self {
            watch,
            log_level: env_var("RPZWATCH_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        self.watch.validate()?;

        for path in [&self.watch.storage.domains_path, &self.watch.storage.groups_path] {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
                && !parent.exists()
            {
                anyhow::bail!(
                    "Storage directory does not exist: {}. \
                    Create it first: mkdir -p {}",
                    parent.display(),
                    parent.display()
                );
            }
        }

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "RPZWATCH_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        Ok(())
    }
}

/// Non-empty, trimmed value of an environment variable
fn env_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Overwrite `target` with the parsed value of `name`, if set
fn set_parsed<T>(name: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = env_var(name) {
        *target = raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{} has invalid value '{}': {}", name, raw, e))?;
    }
    Ok(())
}

fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Parse comma-separated `ip[:port]=label` entries
///
/// IPv6 addresses with a port use brackets: `[2001:db8::1]:5353=label`.
fn parse_resolvers(list: &str) -> Result<Vec<ResolverEndpoint>> {
    let resolvers = split_list(list)
        .map(parse_resolver)
        .collect::<Result<Vec<_>>>()?;
    if resolvers.is_empty() {
        anyhow::bail!("resolver list is empty");
    }
    Ok(resolvers)
}

fn parse_resolver(entry: &str) -> Result<ResolverEndpoint> {
    let (address, label) = match entry.split_once('=') {
        Some((address, label)) => (address.trim(), label.trim()),
        None => (entry, entry),
    };

    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ResolverEndpoint::new(ip, label));
    }
    match address.parse::<SocketAddr>() {
        Ok(socket) => Ok(ResolverEndpoint::new(socket.ip(), label).with_port(socket.port())),
        Err(_) => anyhow::bail!("invalid resolver address '{}'", address),
    }
}

fn main() -> ExitCode {
    let command = match Command::from_args(env::args().skip(1)) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{}", e);
            return RpzwatchExitCode::ConfigError.into();
        }
    };

    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return RpzwatchExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return RpzwatchExitCode::ConfigError.into();
    }

    // Initialize tracing
    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Keep stdout for JSON output
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return RpzwatchExitCode::ConfigError.into();
    }

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return RpzwatchExitCode::RuntimeError.into();
        }
    };

    let result = rt.block_on(async {
        let outcome = match command {
            Command::Run => run_daemon(config.watch).await,
            Command::Check(domains) => run_check(config.watch, domains).await,
            Command::Import(path) => run_import(config.watch, &path).await,
        };
        if let Err(e) = outcome {
            error!("Daemon error: {:#}", e);
            RpzwatchExitCode::RuntimeError
        } else {
            RpzwatchExitCode::CleanShutdown
        }
    });

    result.into()
}

fn build_prober(
    config: &WatchConfig,
    registry: Arc<dyn rpzwatch_core::DomainRegistry>,
    store: VerdictStore,
) -> Result<Prober> {
    let fetcher = ReqwestFetcher::new(&config.trace)?;
    let tracer = RedirectTracer::new(Arc::new(fetcher), registry, store, config.trace.max_hops);
    Ok(Prober::new(Arc::new(HickoryResolverClient::new()), config).with_tracer(tracer))
}

/// Run the scheduler until a shutdown signal arrives
async fn run_daemon(config: WatchConfig) -> Result<()> {
    info!("Starting rpzwatchd daemon");
    info!(
        "{} baseline and {} regional resolver(s), domains file {}",
        config.resolvers.baseline.len(),
        config.resolvers.regional.len(),
        config.storage.domains_path.display()
    );

    let registry = Arc::new(FileDomainRegistry::from_config(&config.storage));
    let groups = DomainGroupRegistry::from_config(&config.storage);
    let store = VerdictStore::new();
    let prober = build_prober(&config, registry.clone(), store.clone())?;

    let (scheduler, event_rx) =
        ProbeScheduler::new(Arc::new(prober), registry, groups, store, &config)?;

    let events = tokio::spawn(log_events(event_rx));

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        match wait_for_shutdown().await {
            Ok(signal) => info!("Received shutdown signal: {}", signal),
            Err(e) => error!("Shutdown handler error: {}", e),
        }
        let _ = shutdown_tx.send(());
    });

    scheduler.run_with_shutdown(shutdown_rx).await?;

    // The receiver ends once the scheduler and its sender are gone
    drop(scheduler);
    if let Err(e) = events.await {
        warn!("Event logger ended abnormally: {}", e);
    }

    info!("Shutting down daemon");
    Ok(())
}

async fn log_events(mut event_rx: mpsc::Receiver<SchedulerEvent>) {
    while let Some(event) = event_rx.recv().await {
        match event {
            SchedulerEvent::DomainProbed { domain, status } if status.is_abnormal() => {
                info!(domain = %domain, %status, "Abnormal verdict");
            }
            other => debug!("Scheduler event: {:?}", other),
        }
    }
}

/// Probe each domain once and print its verdict with an availability flag
///
/// Uses an in-memory registry listing only the given domains; nothing is
/// persisted.
async fn run_check(config: WatchConfig, raw: Vec<String>) -> Result<()> {
    let mut domains = Vec::with_capacity(raw.len());
    for entry in &raw {
        match normalize_domain(entry) {
            Some(domain) => domains.push(domain),
            None => anyhow::bail!("'{}' is not a valid domain", entry),
        }
    }

    let registry = Arc::new(MemoryDomainRegistry::with_domains(domains.iter()));
    let store = VerdictStore::new();
    let prober = build_prober(&config, registry, store.clone())?;

    for domain in domains {
        let verdict = prober.probe_verdict(&domain, config.trace.enabled).await;
        store.record(verdict.clone()).await;
        println!("{}", serde_json::to_string_pretty(&verdict.check_report())?);
    }
    Ok(())
}

/// Add every valid entry of a domain list file to the domains file
async fn run_import(config: WatchConfig, path: &str) -> Result<()> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read domain list {}", path))?;
    let (domains, invalid) = parse_domain_list(&text);

    let registry = FileDomainRegistry::from_config(&config.storage);
    let (added, skipped) = registry.add_domains(&domains, "imported").await?;

    info!("Imported {} into {}", path, config.storage.domains_path.display());
    println!("added: {}, skipped: {}, invalid: {}", added, skipped, invalid);
    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
///
/// # Returns
///
/// Returns the name of the signal received.
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    let signal = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    Ok(signal)
}

/// Wait for shutdown signals (SIGINT only)
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn test_parse_resolver_entries() {
        let resolvers =
            parse_resolvers("168.95.1.1=Chunghwa Telecom, 127.0.0.1:5353=local,[::1]:53=v6, 9.9.9.9")
                .unwrap();
        assert_eq!(resolvers.len(), 4);
        assert_eq!(resolvers[0].label, "Chunghwa Telecom");
        assert_eq!(resolvers[0].port, 53);
        assert_eq!(resolvers[1].port, 5353);
        assert_eq!(resolvers[2].address, "::1".parse::<IpAddr>().unwrap());
        assert_eq!(resolvers[3].label, "9.9.9.9");
    }

    #[test]
    fn test_rejects_bad_resolver_entries() {
        assert!(parse_resolvers("not-an-ip=x").is_err());
        assert!(parse_resolvers(" , ").is_err());
    }

    #[test]
    fn test_command_parsing() {
        assert!(matches!(Command::from_args(args(&[])).unwrap(), Command::Run));
        match Command::from_args(args(&["check", "a.example", "b.example"])).unwrap() {
            Command::Check(domains) => assert_eq!(domains.len(), 2),
            _ => panic!("expected check"),
        }
        assert!(matches!(
            Command::from_args(args(&["import", "list.txt"])).unwrap(),
            Command::Import(_)
        ));
        assert!(Command::from_args(args(&["check"])).is_err());
        assert!(Command::from_args(args(&["import"])).is_err());
        assert!(Command::from_args(args(&["serve"])).is_err());
    }
}
