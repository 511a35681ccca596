#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::{sync::Arc, time::Duration};

use {
    codehost_common::now_ms,
    codehost_hosts::{AppState, Error, HostFilter, HostState, InMemoryHostStore, ReapReason},
    codehost_swarm::{Orchestrator, TaskState},
};

use common::{class, config, harness, harness_with, proto, sqlite_harness, user};

#[tokio::test]
async fn create_is_idempotent() {
    let h = sqlite_harness().await;
    let alice = user(1, "alice");

    let first = h.manager.new_cs(&alice, &proto(), None).await.unwrap();
    let second = h.manager.new_cs(&alice, &proto(), None).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(h.swarm.services().len(), 1);
    assert_eq!(h.swarm.create_calls(), 1);
    assert_eq!(h.store.list(&HostFilter::default()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn new_host_has_no_container_until_a_sync_sees_it_running() {
    let h = sqlite_harness().await;
    let record = h
        .manager
        .new_cs(&user(1, "alice"), &proto(), Some(&class()))
        .await
        .unwrap();

    assert_eq!(record.service_name, "alice");
    assert_eq!(record.proto_id, Some(3));
    assert_eq!(record.class_id, Some(9));
    assert_eq!(record.container_id, None);
    assert_eq!(record.state, HostState::Starting);
    assert_eq!(record.app_state, AppState::Starting);
    let port = record.public_port().unwrap();
    assert!((25_000..=25_099).contains(&port));

    h.swarm
        .schedule(&record.service_id, "node-1", TaskState::Running)
        .unwrap();
    h.probe.set_ready(true);
    let report = h.manager.sync(true).await.unwrap();
    assert_eq!(report.refreshed, vec![record.service_id.clone()]);

    let synced = h.manager.get(&record.service_id).await.unwrap().unwrap();
    assert_eq!(synced.state, HostState::Running);
    assert_eq!(synced.app_state, AppState::Ready);
    assert!(synced.container_id.is_some());
    assert_eq!(synced.node_id.as_deref(), Some("node-1"));
    assert_eq!(synced.created_at_ms, record.created_at_ms);
}

#[tokio::test]
async fn probe_is_not_consulted_before_a_task_runs() {
    let h = harness();
    let record = h.manager.new_cs(&user(1, "alice"), &proto(), None).await.unwrap();
    h.swarm
        .schedule(&record.service_id, "node-1", TaskState::Preparing)
        .unwrap();
    h.probe.set_ready(true);

    h.manager.sync(true).await.unwrap();
    let synced = h.manager.get(&record.service_id).await.unwrap().unwrap();
    assert_eq!(synced.state, HostState::Starting);
    assert_eq!(synced.app_state, AppState::Starting);
    assert_eq!(h.probe.calls(), 0);
}

#[tokio::test]
async fn mia_record_is_superseded_by_a_new_host() {
    let h = harness();
    let alice = user(1, "alice");
    let old = h.manager.new_cs(&alice, &proto(), None).await.unwrap();
    h.swarm.vanish(&old.service_id);
    h.manager.sync(false).await.unwrap();
    assert!(h.manager.get(&old.service_id).await.unwrap().unwrap().is_mia());

    let fresh = h.manager.new_cs(&alice, &proto(), None).await.unwrap();
    assert_ne!(fresh.service_id, old.service_id);
    assert!(h.manager.get(&old.service_id).await.unwrap().is_none());
    assert_eq!(
        h.store.get_by_user_id(1).await.unwrap().unwrap().service_id,
        fresh.service_id
    );
}

#[tokio::test]
async fn port_conflict_is_retried_with_fresh_ports() {
    let mut cfg = config();
    cfg.hosts.port_range.end = 25_002;
    let h = harness_with(cfg, Arc::new(InMemoryHostStore::new()));
    h.swarm.reserve_port(25_000);
    h.swarm.reserve_port(25_001);

    let record = h.manager.new_cs(&user(1, "alice"), &proto(), None).await.unwrap();
    assert_eq!(record.public_port(), Some(25_002));
    assert!(h.swarm.create_calls() <= 3);
}

#[tokio::test]
async fn ports_are_unique_across_hosts() {
    let h = harness();
    let mut ports = std::collections::BTreeSet::new();
    for (id, name) in [(1, "alice"), (2, "bob"), (3, "carol"), (4, "dave")] {
        let record = h.manager.new_cs(&user(id, name), &proto(), None).await.unwrap();
        assert!(ports.insert(record.public_port().unwrap()));
    }
}

#[tokio::test]
async fn name_conflict_adopts_the_existing_service() {
    let h = harness();
    let alice = user(1, "alice");
    let first = h.manager.new_cs(&alice, &proto(), None).await.unwrap();
    // Record lost, service still running.
    h.store.delete(&first.service_id).await.unwrap();

    let adopted = h.manager.new_cs(&alice, &proto(), None).await.unwrap();
    assert_eq!(adopted.service_id, first.service_id);
    assert_eq!(h.swarm.create_calls(), 2);
    assert_eq!(h.swarm.services().len(), 1);
}

#[tokio::test]
async fn lookalike_username_never_gets_another_users_host() {
    let h = sqlite_harness().await;
    let first = h
        .manager
        .new_cs(&user(1, "bob-smith"), &proto(), None)
        .await
        .unwrap();

    let err = h
        .manager
        .new_cs(&user(2, "Bob.Smith"), &proto(), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::NameTaken { ref service_name, owner: Some(1) } if service_name == "bob-smith"
    ));
    assert_eq!(h.swarm.create_calls(), 1);
    assert!(h.store.get_by_user_id(2).await.unwrap().is_none());
    assert_eq!(
        h.store.get_by_user_id(1).await.unwrap().unwrap().service_id,
        first.service_id
    );
}

#[tokio::test]
async fn existing_service_of_another_user_is_not_adopted() {
    let h = harness();
    let first = h.manager.new_cs(&user(1, "alice"), &proto(), None).await.unwrap();
    h.store.delete(&first.service_id).await.unwrap();

    let err = h
        .manager
        .new_cs(&user(2, "Alice"), &proto(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NameTaken { owner: Some(1), .. }));
    assert!(h.store.list(&HostFilter::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn renamed_user_keeps_a_single_host() {
    let h = harness();
    let first = h.manager.new_cs(&user(1, "alice"), &proto(), None).await.unwrap();
    let again = h.manager.new_cs(&user(1, "alice2"), &proto(), None).await.unwrap();

    assert_eq!(again.service_id, first.service_id);
    assert_eq!(h.swarm.create_calls(), 1);
    let live = h
        .store
        .list(&HostFilter {
            user_id: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(live.iter().filter(|r| !r.is_mia()).count(), 1);
}

#[tokio::test]
async fn missing_configuration_fails_before_touching_the_orchestrator() {
    let mut cfg = config();
    cfg.hosts.network = None;
    let h = harness_with(cfg, Arc::new(InMemoryHostStore::new()));

    let err = h
        .manager
        .new_cs(&user(1, "alice"), &proto(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration { key: "hosts.network" }));
    assert_eq!(h.swarm.create_calls(), 0);
}

#[tokio::test]
async fn invalid_username_is_rejected() {
    let h = harness();
    let err = h
        .manager
        .new_cs(&user(1, "!!!"), &proto(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidUsername { .. }));
}

#[tokio::test(start_paused = true)]
async fn start_and_wait_returns_once_ready() {
    let h = harness();
    h.probe.set_ready(true);

    let swarm = Arc::clone(&h.swarm);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(700)).await;
            if let Some(service) = swarm.get("alice").await.unwrap() {
                swarm.schedule(&service.id, "node-1", TaskState::Running);
                break;
            }
        }
    });

    let record = h
        .manager
        .start_and_wait(&user(1, "alice"), &proto(), None, Duration::from_secs(30))
        .await
        .unwrap();
    assert!(record.is_ready());
    assert!(record.container_id.is_some());
}

#[tokio::test(start_paused = true)]
async fn start_and_wait_times_out_distinctly() {
    let h = harness();
    let err = h
        .manager
        .start_and_wait(&user(1, "alice"), &proto(), None, Duration::from_secs(5))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::StartupTimedOut { timeout_secs: 5, .. }));
    assert_eq!(err.to_string(), "code host startup timed out");

    // The final sync still ran: the record reflects the last observation.
    let record = h.manager.get_by_username("alice").await.unwrap().unwrap();
    assert_eq!(record.state, HostState::Starting);
}

#[tokio::test(start_paused = true)]
async fn service_vanishing_during_startup_fails_the_start() {
    let h = harness();
    let swarm = Arc::clone(&h.swarm);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        swarm.vanish("alice");
    });

    let err = h
        .manager
        .start_and_wait(&user(1, "alice"), &proto(), None, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StartFailed { .. }));
    assert_eq!(err.to_string(), "failed to start code host");

    let record = h.manager.get_by_username("alice").await.unwrap().unwrap();
    assert_eq!(record.state, HostState::Mia);
    assert_eq!(record.app_state, AppState::Mia);
}

#[tokio::test]
async fn stop_keeps_the_record() {
    let h = harness();
    let record = h.manager.new_cs(&user(1, "alice"), &proto(), None).await.unwrap();

    let stopped = h.manager.stop_cs("Alice").await.unwrap().unwrap();
    assert_eq!(stopped.service_id, record.service_id);
    assert!(h.swarm.services().is_empty());
    assert!(h.manager.get(&record.service_id).await.unwrap().is_some());

    // Already gone: still fine while the record exists.
    assert!(h.manager.stop_cs("alice").await.unwrap().is_some());
    assert!(matches!(
        h.manager.stop_cs("nobody").await.unwrap_err(),
        Error::NotFound { .. }
    ));
}

#[tokio::test]
async fn restart_replaces_the_container() {
    let h = sqlite_harness().await;
    let record = h.manager.new_cs(&user(1, "alice"), &proto(), None).await.unwrap();
    h.swarm
        .schedule(&record.service_id, "node-1", TaskState::Running)
        .unwrap();
    h.probe.set_ready(true);
    h.manager.sync(true).await.unwrap();
    let before = h.manager.get(&record.service_id).await.unwrap().unwrap();
    assert!(before.is_ready());

    let restarted = h.manager.restart_cs("alice").await.unwrap();
    assert_eq!(restarted.state, HostState::Starting);
    assert_eq!(restarted.app_state, AppState::Starting);
    assert_eq!(restarted.container_id, None);
    assert_eq!(h.swarm.services().len(), 1);

    h.swarm
        .schedule(&record.service_id, "node-2", TaskState::Running)
        .unwrap();
    h.manager.sync(true).await.unwrap();
    let after = h.manager.get(&record.service_id).await.unwrap().unwrap();
    assert!(after.is_ready());
    assert_ne!(after.container_id, before.container_id);

    assert!(matches!(
        h.manager.restart_cs("nobody").await.unwrap_err(),
        Error::NotFound { .. }
    ));
}

#[tokio::test]
async fn reap_dry_run_reports_only_mia_hosts() {
    let h = sqlite_harness().await;
    let bob = h.manager.new_cs(&user(2, "bob"), &proto(), None).await.unwrap();
    let carol = h.manager.new_cs(&user(3, "carol"), &proto(), None).await.unwrap();
    h.swarm
        .schedule(&carol.service_id, "node-1", TaskState::Running)
        .unwrap();
    h.probe.set_ready(true);
    h.swarm.vanish(&bob.service_id);
    h.manager.sync(true).await.unwrap();

    let before = h.store.list(&HostFilter::default()).await.unwrap();
    let reaped = h.manager.reap(true).await.unwrap();
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].record.service_id, bob.service_id);
    assert_eq!(reaped[0].reason, ReapReason::Mia);
    assert_eq!(h.store.list(&HostFilter::default()).await.unwrap(), before);

    let reaped = h.manager.reap(false).await.unwrap();
    assert_eq!(reaped.len(), 1);
    let left = h.store.list(&HostFilter::default()).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].service_id, carol.service_id);
    assert!(left[0].is_ready());
}

#[tokio::test]
async fn quiet_hosts_are_reaped_until_they_report_activity() {
    let mut cfg = config();
    cfg.reap.idle_minutes = 30;
    let h = harness_with(cfg, Arc::new(InMemoryHostStore::new()));
    let record = h.manager.new_cs(&user(1, "alice"), &proto(), None).await.unwrap();

    let mut old = record.clone();
    old.created_at_ms = now_ms() - 2 * 60 * 60 * 1000;
    h.store.delete(&record.service_id).await.unwrap();
    h.store.upsert(&old).await.unwrap();

    let reaped = h.manager.reap(true).await.unwrap();
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].reason, ReapReason::Quiescent);

    assert!(h.manager.record_activity("alice").await.unwrap());
    assert!(h.manager.reap(true).await.unwrap().is_empty());

    // A real reap stops the live service too.
    h.store.delete(&record.service_id).await.unwrap();
    h.store.upsert(&old).await.unwrap();
    let reaped = h.manager.reap(false).await.unwrap();
    assert_eq!(reaped.len(), 1);
    assert!(h.swarm.services().is_empty());
    assert!(h.manager.get(&record.service_id).await.unwrap().is_none());
}

#[tokio::test]
async fn purge_removes_everything_managed() {
    let h = harness();
    h.manager.new_cs(&user(1, "alice"), &proto(), None).await.unwrap();
    h.manager.new_cs(&user(2, "bob"), &proto(), None).await.unwrap();

    let dry = h.manager.purge(true).await.unwrap();
    assert_eq!(dry.services.len(), 2);
    assert_eq!(dry.records.len(), 2);
    assert_eq!(h.swarm.services().len(), 2);

    let done = h.manager.purge(false).await.unwrap();
    assert_eq!(done, dry);
    assert!(h.swarm.services().is_empty());
    assert!(h.store.list(&HostFilter::default()).await.unwrap().is_empty());
}
