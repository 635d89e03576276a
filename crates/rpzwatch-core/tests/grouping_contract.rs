//! Architectural Contract Test: Domain Groups
//!
//! Domains seen together in one redirect chain belong to one group. Groups
//! are persisted and survive a restart.
//!
//! Constraints verified:
//! - A redirect a.example → b.example groups both after a scheduled probe
//!   and auto-adds b.example to the monitored list
//! - Re-probing the same chain leaves the mapping untouched
//! - Chains sharing a member merge into one group, whatever the order
//! - Group mapping and domain metadata round-trip through their files
//! - Verdicts flushed by the scheduler land in the domain file

mod common;

use common::*;
use rpzwatch_core::domains::AUTO_ADDED_NOTE;
use rpzwatch_core::model::DomainRecord;
use rpzwatch_core::traits::DomainRegistry;
use rpzwatch_core::{
    DomainGroupRegistry, FileDomainRegistry, ProbeScheduler, Prober, RedirectTracer, TraceStatus,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_redirect_chain_groups_domains() {
    let h = Harness::new(&["a.example"]);
    h.resolve_everywhere("a.example", &["5.6.7.8"]);
    h.fetcher
        .respond("https://a.example/", 301, Some("https://b.example/"));
    h.fetcher.respond("https://b.example/", 200, None);

    let (scheduler, _events) = h.scheduler();
    let summary = scheduler.run_cycle().await.unwrap();
    assert_eq!(summary.probed, 1);

    assert_eq!(h.groups.related_domains("a.example").await.unwrap(), vec!["b.example"]);
    assert_eq!(h.groups.related_domains("b.example").await.unwrap(), vec!["a.example"]);

    let added = h.registry.get_domain("b.example").await.unwrap().expect("auto-added");
    assert_eq!(added.note, AUTO_ADDED_NOTE);
    assert!(!added.polluted);
}

#[tokio::test]
async fn test_reprobing_same_chain_is_idempotent() {
    let h = Harness::new(&["a.example"]);
    h.resolve_everywhere("a.example", &["5.6.7.8"]);
    h.resolve_everywhere("b.example", &["5.6.7.9"]);
    h.fetcher
        .respond("https://a.example/", 301, Some("https://b.example/"));
    h.fetcher.respond("https://b.example/", 200, None);

    let (scheduler, _events) = h.scheduler();
    scheduler.run_cycle().await.unwrap();
    let first = h.groups.mapping().await.unwrap();

    // b.example is listed now and probed as well
    let summary = scheduler.run_cycle().await.unwrap();
    assert_eq!(summary.listed, 2);
    assert_eq!(summary.probed, 2);

    assert_eq!(h.groups.mapping().await.unwrap(), first);
    assert_eq!(h.groups.related_domains("a.example").await.unwrap(), vec!["b.example"]);
    assert_eq!(h.registry.inner().len().await, 2);
}

#[tokio::test]
async fn test_www_hosts_collapse_to_their_root() {
    let h = Harness::new(&["a.example"]);
    h.resolve_everywhere("a.example", &["5.6.7.8"]);
    h.fetcher
        .respond("https://a.example/", 301, Some("https://www.a.example/"));
    h.fetcher.respond("https://www.a.example/", 200, None);

    let (scheduler, _events) = h.scheduler();
    scheduler.run_cycle().await.unwrap();

    assert!(h.groups.mapping().await.unwrap().is_empty());
    assert_eq!(h.registry.inner().len().await, 1);
}

#[tokio::test]
async fn test_overlapping_chains_merge_in_any_order() {
    let forward_dir = tempfile::TempDir::new().unwrap();
    let reverse_dir = tempfile::TempDir::new().unwrap();
    let forward = DomainGroupRegistry::new(forward_dir.path().join("groups.json"), Duration::from_secs(1));
    let reverse = DomainGroupRegistry::new(reverse_dir.path().join("groups.json"), Duration::from_secs(1));

    let chains = [
        vec!["a.example", "b.example"],
        vec!["c.example", "d.example"],
        vec!["www.b.example", "c.example"],
    ];
    for chain in &chains {
        forward.record_chain(chain).await.unwrap();
    }
    for chain in chains.iter().rev() {
        reverse.record_chain(chain).await.unwrap();
    }

    let mapping = forward.mapping().await.unwrap();
    assert_eq!(mapping, reverse.mapping().await.unwrap());
    assert_eq!(mapping.len(), 4);
    assert_eq!(
        forward.related_domains("d.example").await.unwrap(),
        vec!["a.example", "b.example", "c.example"]
    );

    assert!(!forward.record_chain(["b.example", "d.example"]).await.unwrap());
}

#[tokio::test]
async fn test_groups_survive_restart() {
    let h = Harness::new(&[]);
    assert!(h.groups.record_chain(["x.example", "y.example"]).await.unwrap());

    let reopened = DomainGroupRegistry::from_config(&h.config.storage);
    assert_eq!(reopened.related_domains("y.example").await.unwrap(), vec!["x.example"]);
    assert!(reopened.related_domains("z.example").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_domain_metadata_survives_restart() {
    let h = Harness::new(&[]);
    let registry = FileDomainRegistry::from_config(&h.config.storage);
    let (added, skipped) = registry
        .add_domains(["a.example", "b.example", "a.example"], "imported")
        .await
        .unwrap();
    assert_eq!((added, skipped), (2, 1));

    let reopened = FileDomainRegistry::from_config(&h.config.storage);
    let records = reopened.list_records().await.unwrap();
    assert_eq!(records.keys().collect::<Vec<_>>(), vec!["a.example", "b.example"]);
    assert_eq!(records["a.example"].note, "imported");

    // Raw file is a plain object keyed by domain
    let raw = std::fs::read_to_string(&h.config.storage.domains_path).unwrap();
    let parsed: BTreeMap<String, DomainRecord> = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed.len(), 2);
}

#[tokio::test]
async fn test_scheduler_flush_lands_in_domain_file() {
    let h = Harness::new(&[]);
    let registry = Arc::new(FileDomainRegistry::from_config(&h.config.storage));
    registry.add_domains(["a.example"], "manual").await.unwrap();

    h.resolver.answer_all("a.example", ok(&[BLOCK_PAGE]));
    h.resolver.answer("a.example", BASELINE, ok(&["5.6.7.8"]));
    h.fetcher
        .respond("https://a.example/", 302, Some("https://b.example/"));
    h.fetcher.respond("https://b.example/", 200, None);

    let tracer = RedirectTracer::new(
        h.fetcher.clone(),
        registry.clone(),
        h.store.clone(),
        h.config.trace.max_hops,
    );
    let prober = Prober::new(h.resolver.clone(), &h.config).with_tracer(tracer);
    let (scheduler, _events) = ProbeScheduler::new(
        Arc::new(prober),
        registry.clone(),
        h.groups.clone(),
        h.store.clone(),
        &h.config,
    )
    .unwrap();

    let summary = scheduler.run_cycle().await.unwrap();
    assert_eq!(summary.flushed, 1);

    let reopened = FileDomainRegistry::from_config(&h.config.storage);
    let record = reopened.get_domain("a.example").await.unwrap().unwrap();
    assert!(record.polluted);
    assert_eq!(record.trace_status, Some(TraceStatus::Traced));
    assert!(record.last_probe_at.is_some());

    let added = reopened.get_domain("b.example").await.unwrap().unwrap();
    assert_eq!(added.note, AUTO_ADDED_NOTE);
    assert_eq!(h.groups.related_domains("b.example").await.unwrap(), vec!["a.example"]);
}
