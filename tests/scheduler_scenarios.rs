//! End-to-end queue scenarios, run against both store implementations.

use std::sync::Arc;

use crawlqueue::config::Settings;
use crawlqueue::connectors::simulated::SimulatedConnector;
use crawlqueue::connectors::{ChildReference, ConnectorRegistry};
use crawlqueue::models::{
    document_hash, DocumentOutcome, HopcountMode, JobDescription, JobType, QueueEntry, QueueStatus,
    RepositoryConnection,
};
use crawlqueue::scheduler::SchedulerContext;
use crawlqueue::store::{EdgeQuery, EntryQuery, MemoryStore, QueueStore, SqliteStore, StoreTxn};
use crawlqueue::QueueManager;

fn setup_test_store() -> (SqliteStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store = SqliteStore::open(&dir.path().join("queue.db")).expect("Failed to open store");
    (store, dir)
}

fn manager_for<S: QueueStore>(store: Arc<S>, process_id: &str, connection: RepositoryConnection) -> QueueManager<S> {
    let mut registry = ConnectorRegistry::new();
    registry.register_repository(Arc::new(SimulatedConnector::new("sim")));
    let settings = Settings {
        process_id: process_id.to_string(),
        ..Settings::default()
    };
    let ctx = SchedulerContext::new(settings, registry);
    ctx.add_connection(connection);
    QueueManager::new(store, Arc::new(ctx))
}

fn web() -> RepositoryConnection {
    RepositoryConnection::new("web", "sim")
}

fn entries<S: QueueStore>(manager: &QueueManager<S>) -> Vec<QueueEntry> {
    let query = EntryQuery::for_job(1);
    manager
        .store()
        .transaction(&mut |txn: &mut dyn StoreTxn| txn.query_entries(&query))
        .unwrap()
}

fn entry<S: QueueStore>(manager: &QueueManager<S>, identifier: &str) -> QueueEntry {
    let hash = document_hash(identifier);
    manager
        .store()
        .transaction(&mut |txn: &mut dyn StoreTxn| txn.load_entry(1, &hash))
        .unwrap()
        .unwrap()
}

/// Claim everything ready and report the claimed identifiers.
fn claim<S: QueueStore>(manager: &QueueManager<S>, now_ms: i64) -> Vec<String> {
    let mut claimed: Vec<String> = manager
        .get_next_documents(50, now_ms)
        .unwrap()
        .into_iter()
        .flat_map(|batch| batch.documents.into_iter().map(|d| d.document_identifier))
        .collect();
    claimed.sort();
    claimed
}

fn process<S: QueueStore>(manager: &QueueManager<S>, identifier: &str, children: &[ChildReference], now_ms: i64) {
    if !children.is_empty() {
        manager
            .add_document_references(1, identifier, children, now_ms)
            .unwrap();
    }
    manager
        .complete_documents(1, &[(document_hash(identifier), DocumentOutcome::processed("v1"))], now_ms)
        .unwrap();
}

fn host_of(identifier: &str) -> &str {
    identifier
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or_default()
}

/// Fetch alternately on both hosts, each fetch discovering one more page on
/// its host, and compare the average priority the hosts' pages received.
fn throttled_host_stays_behind<S: QueueStore>(store: Arc<S>) {
    let connection = web().with_throttle("^host-a$", 1.0);
    let manager = manager_for(store, "proc", connection);
    manager
        .create_job(JobDescription::new(1, "crawl", "web", JobType::Specified))
        .unwrap();
    manager.start_job(1, 0).unwrap();
    manager
        .add_seeds(1, &["http://host-a/0".to_string(), "http://host-b/0".to_string()], 0)
        .unwrap();

    let hosts = ["host-a", "host-b"];
    let mut fetched = 0usize;
    let mut now_ms = 0i64;
    for _ in 0..1_000 {
        if fetched == 100 {
            break;
        }
        // Long enough for the throttled host to earn another fetch.
        now_ms += 61_000;
        let wanted = hosts[fetched % 2];
        let claimed: Vec<_> = manager
            .get_next_documents(10, now_ms)
            .unwrap()
            .into_iter()
            .flat_map(|batch| batch.documents)
            .collect();

        let mut results = Vec::new();
        let mut done = false;
        for document in claimed {
            let id = document.document_identifier.clone();
            if !done && host_of(&id) == wanted {
                let child = ChildReference::new(&format!("http://{wanted}/{}", fetched + 1));
                manager.add_document_references(1, &id, &[child], now_ms).unwrap();
                results.push((document.doc_hash, DocumentOutcome::processed("v1")));
                fetched += 1;
                done = true;
            } else {
                results.push((document.doc_hash, DocumentOutcome::Abandoned));
            }
        }
        manager.complete_documents(1, &results, now_ms).unwrap();
    }
    assert_eq!(fetched, 100);

    let average = |host: &str| {
        let priorities: Vec<f64> = entries(&manager)
            .into_iter()
            .filter(|e| host_of(&e.doc_id) == host)
            .filter_map(|e| e.priority)
            .collect();
        assert_eq!(priorities.len(), 51);
        priorities.iter().sum::<f64>() / priorities.len() as f64
    };
    assert!(average("host-a") > average("host-b"));
}

fn dead_process_work_is_recovered<S: QueueStore>(store: Arc<S>) {
    let crashed = manager_for(Arc::clone(&store), "proc-a", web());
    crashed
        .create_job(JobDescription::new(1, "crawl", "web", JobType::Specified))
        .unwrap();
    crashed.start_job(1, 0).unwrap();
    crashed.claim_jobs_for_seeding(0).unwrap();
    crashed
        .add_seeds(1, &["http://h/1".to_string(), "http://h/2".to_string()], 0)
        .unwrap();
    assert_eq!(claim(&crashed, 0).len(), 2);
    crashed
        .add_document_references(1, "http://h/1", &[ChildReference::new("http://h/3").with_carrydown("acl", "x")], 1)
        .unwrap();

    let survivor = manager_for(store, "proc-b", web());
    let summary = survivor.cleanup_process_data("proc-a", 10).unwrap();
    assert_eq!(summary.entries_reset, 2);

    assert!(entries(&survivor)
        .iter()
        .all(|e| e.status == QueueStatus::Pending && e.process_id.is_none()));
    let query = EdgeQuery::for_job(1);
    let carried = survivor
        .store()
        .transaction(&mut |txn: &mut dyn StoreTxn| txn.query_carrydown(&query))
        .unwrap();
    assert!(carried.is_empty());

    survivor.prioritize_documents(10).unwrap();
    assert_eq!(claim(&survivor, 10).len(), 3);
}

fn far_documents_wait_for_a_shorter_path<S: QueueStore>(store: Arc<S>) {
    let manager = manager_for(store, "proc", web());
    let mut job = JobDescription::new(1, "crawl", "web", JobType::Specified);
    job.hopcount_mode = HopcountMode::Accurate;
    job.hop_limits.insert("link".to_string(), 1);
    manager.create_job(job).unwrap();
    manager.start_job(1, 0).unwrap();

    let link = |id: &str| ChildReference::new(id).with_link_type("link");
    manager.add_seeds(1, &["http://h/s".to_string()], 0).unwrap();
    assert_eq!(claim(&manager, 0), vec!["http://h/s"]);
    process(&manager, "http://h/s", &[link("http://h/1")], 1);
    assert_eq!(claim(&manager, 2), vec!["http://h/1"]);
    process(&manager, "http://h/1", &[link("http://h/2")], 3);

    assert_eq!(entry(&manager, "http://h/2").status, QueueStatus::HopcountExceeded);
    assert!(claim(&manager, 4).is_empty());

    // The seed now links to the far document directly.
    manager
        .requeue_documents(1, &[document_hash("http://h/s")], 5)
        .unwrap();
    assert_eq!(claim(&manager, 5), vec!["http://h/s"]);
    process(&manager, "http://h/s", &[link("http://h/1"), link("http://h/2")], 6);
    assert_eq!(claim(&manager, 7), vec!["http://h/2"]);
}

fn repeated_carrydown_is_stored_once<S: QueueStore>(store: Arc<S>) {
    let manager = manager_for(store, "proc", web());
    manager
        .create_job(JobDescription::new(1, "crawl", "web", JobType::Specified))
        .unwrap();
    manager.start_job(1, 0).unwrap();

    let child = ChildReference::new("http://h/c").with_carrydown("acl", "group-1");
    for now_ms in [1, 2] {
        manager
            .add_document_references(1, "http://h/p", &[child.clone()], now_ms)
            .unwrap();
    }
    let query = EdgeQuery::for_job(1);
    let rows = manager
        .store()
        .transaction(&mut |txn: &mut dyn StoreTxn| txn.query_carrydown(&query))
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        manager.carrydown_values(1, "http://h/c").unwrap()["acl"],
        vec!["group-1"]
    );
}

fn reverted_pass_leaves_no_trace<S: QueueStore>(store: Arc<S>) {
    let manager = manager_for(store, "proc", web());
    let mut job = JobDescription::new(1, "crawl", "web", JobType::Specified);
    job.hopcount_mode = HopcountMode::Accurate;
    job.hop_limits.insert("link".to_string(), 5);
    manager.create_job(job).unwrap();
    manager.start_job(1, 0).unwrap();

    manager.add_seeds(1, &["http://h/s".to_string()], 0).unwrap();
    claim(&manager, 0);
    process(
        &manager,
        "http://h/s",
        &[ChildReference::new("http://h/1").with_link_type("link").with_carrydown("k", "v")],
        1,
    );

    let snapshot = |manager: &QueueManager<S>| {
        let query = EdgeQuery::for_job(1);
        manager
            .store()
            .transaction(&mut |txn: &mut dyn StoreTxn| {
                let mut carried: Vec<String> = txn
                    .query_carrydown(&query)?
                    .into_iter()
                    .map(|r| format!("{}>{}:{}={}:{:?}", r.parent_hash, r.child_hash, r.data_name, r.value, r.state))
                    .collect();
                let mut links: Vec<String> = txn
                    .query_links(&query)?
                    .into_iter()
                    .map(|l| format!("{}>{}:{}:{:?}", l.parent_hash, l.child_hash, l.link_type, l.state))
                    .collect();
                let mut hops: Vec<String> = txn
                    .query_hopcounts(1)?
                    .into_iter()
                    .map(|h| format!("{}:{}={}", h.doc_hash, h.link_type, h.distance))
                    .collect();
                carried.sort();
                links.sort();
                hops.sort();
                Ok((carried, links, hops))
            })
            .unwrap()
    };
    let before = snapshot(&manager);

    manager
        .requeue_documents(1, &[document_hash("http://h/s")], 2)
        .unwrap();
    claim(&manager, 2);
    manager
        .add_document_references(
            1,
            "http://h/s",
            &[
                ChildReference::new("http://h/1").with_link_type("link").with_carrydown("k", "w"),
                ChildReference::new("http://h/2").with_link_type("link").with_carrydown("k", "v"),
            ],
            3,
        )
        .unwrap();
    assert_ne!(snapshot(&manager), before);

    manager.revert_parents(1, &["http://h/s".to_string()]).unwrap();
    assert_eq!(snapshot(&manager), before);
}

macro_rules! on_both_stores {
    ($($name:ident => $scenario:ident),* $(,)?) => {
        mod memory {
            use super::*;
            $(#[test] fn $name() { $scenario(Arc::new(MemoryStore::new())); })*
        }
        mod sqlite {
            use super::*;
            $(#[test] fn $name() {
                let (store, _dir) = setup_test_store();
                $scenario(Arc::new(store));
            })*
        }
    };
}

on_both_stores! {
    throttled_host_has_higher_average_priority => throttled_host_stays_behind,
    crash_cleanup_resets_active_entries => dead_process_work_is_recovered,
    hop_limit_excludes_until_path_shortens => far_documents_wait_for_a_shorter_path,
    carrydown_union_is_idempotent => repeated_carrydown_is_stored_once,
    add_then_revert_restores_edges => reverted_pass_leaves_no_trace,
}
