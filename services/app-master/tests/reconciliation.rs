//! Integration tests for the reconciliation flow.
//!
//! These drive the master's event handler directly with a mock resource
//! manager, verifying the counter laws: deficits produce exactly the right
//! number of requests, excess releases pick the newest instances, and
//! duplicate or crossing events are absorbed without drift.

use std::sync::Arc;

use roost_master::config::Config;
use roost_master::events::{Allocation, Completion, Event};
use roost_master::launcher::StaticLauncher;
use roost_master::master::{ApplicationMaster, MasterFlow};
use roost_master::rm::MockResourceManager;
use roost_master::state::AppState;
use roost_model::{
    ContainerId, PlacementPolicy, ResourceProfile, Role, RoleSet, RoleSpec,
};
use roost_placement::RoleHistory;

fn test_config() -> Config {
    Config {
        role_set_path: "roles.json".into(),
        launch_specs_path: None,
        history_path: None,
        heartbeat_interval_secs: 5,
        unanswered_warn_ticks: 12,
        anti_affinity_limit: 1,
        event_queue_depth: 64,
        log_level: "debug".to_string(),
    }
}

fn role_set(worker_desired: u32) -> RoleSet {
    RoleSet {
        roles: vec![
            RoleSpec {
                role: Role {
                    name: "master".to_string(),
                    priority: 1,
                    profile: ResourceProfile::new(2, 2048),
                    placement: PlacementPolicy::Any,
                    am_fatal: true,
                },
                desired: 0,
            },
            RoleSpec {
                role: Role {
                    name: "worker".to_string(),
                    priority: 2,
                    profile: ResourceProfile::new(1, 512),
                    placement: PlacementPolicy::Any,
                    am_fatal: false,
                },
                desired: worker_desired,
            },
        ],
    }
}

type TestMaster = ApplicationMaster<MockResourceManager>;

fn test_master(worker_desired: u32) -> (TestMaster, Arc<MockResourceManager>) {
    let config = test_config();
    let state = AppState::new(&role_set(worker_desired), RoleHistory::new(1), 12).unwrap();
    let rm = Arc::new(MockResourceManager::new());
    let launcher = Arc::new(StaticLauncher::default());
    let (master, _gateway, _snapshot) =
        ApplicationMaster::new(&config, state, Arc::clone(&rm), launcher);
    (master, rm)
}

fn alloc(id: &str, host: &str, priority: u32) -> Allocation {
    Allocation {
        container: ContainerId::new(id),
        host: host.to_string(),
        priority,
    }
}

fn done(id: &str, exit_status: i32) -> Completion {
    Completion {
        container: ContainerId::new(id),
        exit_status,
    }
}

/// Convergence law: actual + outstanding - pending_release == desired.
fn assert_converged(master: &TestMaster) {
    for (role, status) in master.state().role_status_snapshot() {
        assert_eq!(
            status.actual + status.outstanding - status.pending_release,
            status.desired,
            "role {role} diverged: {status:?}"
        );
    }
}

#[tokio::test]
async fn test_deficit_emits_exactly_two_requests() {
    // worker: desired=3, actual=1, outstanding=0 -> exactly 2 new requests.
    let (mut master, rm) = test_master(1);
    master.bootstrap().await.unwrap();
    assert_eq!(rm.request_count(), 1);

    master
        .handle_event(Event::ContainersAllocated(vec![alloc("c1", "h1", 2)]))
        .await
        .unwrap();

    master
        .handle_event(Event::Flex {
            role: "worker".to_string(),
            desired: 3,
        })
        .await
        .unwrap();

    assert_eq!(rm.request_count(), 3); // 1 initial + exactly 2 for the deficit
    let status = master.state().role_status_snapshot()["worker"];
    assert_eq!(status.actual, 1);
    assert_eq!(status.outstanding, 2);
    assert!(rm
        .requests()
        .iter()
        .all(|r| r.priority == 2 && r.profile == ResourceProfile::new(1, 512)));
    assert_converged(&master);
}

#[tokio::test]
async fn test_excess_releases_two_newest_instances() {
    // worker: desired=1, actual=3, outstanding=0 -> exactly 2 releases,
    // newest-started first.
    let (mut master, rm) = test_master(3);
    master.bootstrap().await.unwrap();

    master
        .handle_event(Event::ContainersAllocated(vec![
            alloc("c1", "h1", 2),
            alloc("c2", "h2", 2),
            alloc("c3", "h3", 2),
        ]))
        .await
        .unwrap();

    master
        .handle_event(Event::Flex {
            role: "worker".to_string(),
            desired: 1,
        })
        .await
        .unwrap();

    assert_eq!(
        rm.releases(),
        vec![ContainerId::new("c3"), ContainerId::new("c2")]
    );
    assert_converged(&master);

    // Release acknowledgements bring the counters home.
    master
        .handle_event(Event::ContainersCompleted(vec![done("c3", 0), done("c2", 0)]))
        .await
        .unwrap();

    let status = master.state().role_status_snapshot()["worker"];
    assert_eq!(status.actual, 1);
    assert_eq!(status.pending_release, 0);
    assert_converged(&master);
}

#[tokio::test]
async fn test_duplicate_completions_never_drive_counters_negative() {
    let (mut master, _rm) = test_master(2);
    master.bootstrap().await.unwrap();

    master
        .handle_event(Event::ContainersAllocated(vec![
            alloc("c1", "h1", 2),
            alloc("c2", "h2", 2),
        ]))
        .await
        .unwrap();

    // The same completion delivered three times.
    for _ in 0..3 {
        master
            .handle_event(Event::ContainersCompleted(vec![done("c1", 1)]))
            .await
            .unwrap();
    }

    let status = master.state().role_status_snapshot()["worker"];
    assert_eq!(status.actual, 1);
    assert_eq!(status.pending_release, 0);
    // Exactly one replacement was requested for the one failure.
    assert_eq!(status.outstanding, 1);
    assert_converged(&master);
}

#[tokio::test]
async fn test_grant_after_cancel_released_immediately() {
    let (mut master, rm) = test_master(1);
    master.bootstrap().await.unwrap();
    assert_eq!(rm.request_count(), 1);

    // Flex to zero before the grant arrives: the request is cancelled.
    master
        .handle_event(Event::Flex {
            role: "worker".to_string(),
            desired: 0,
        })
        .await
        .unwrap();
    assert_converged(&master);

    // The grant crosses the cancellation; it must be released, not used.
    master
        .handle_event(Event::ContainersAllocated(vec![alloc("late", "h1", 2)]))
        .await
        .unwrap();

    assert_eq!(rm.releases(), vec![ContainerId::new("late")]);
    let status = master.state().role_status_snapshot()["worker"];
    assert_eq!(status.actual, 0);
    assert_eq!(status.outstanding, 0);
    assert_converged(&master);
}

#[tokio::test]
async fn test_failed_instance_replaced_with_history_hint() {
    let (mut master, rm) = test_master(1);
    master.bootstrap().await.unwrap();

    master
        .handle_event(Event::ContainersAllocated(vec![alloc("c1", "h1", 2)]))
        .await
        .unwrap();

    // Clean exit: the role is under target again and h1 is now a known-good
    // host, so the replacement request carries it as a hint.
    master
        .handle_event(Event::ContainersCompleted(vec![done("c1", 0)]))
        .await
        .unwrap();

    assert_eq!(rm.request_count(), 2);
    let replacement = &rm.requests()[1];
    assert_eq!(replacement.host_hints, vec!["h1".to_string()]);
    assert_converged(&master);
}

#[tokio::test]
async fn test_failed_host_ranked_below_successful_one() {
    let (mut master, rm) = test_master(2);
    master.bootstrap().await.unwrap();

    master
        .handle_event(Event::ContainersAllocated(vec![
            alloc("c1", "h1", 2),
            alloc("c2", "h2", 2),
        ]))
        .await
        .unwrap();

    // h2 completes cleanly, h1 fails: both under target again afterwards.
    master
        .handle_event(Event::ContainersCompleted(vec![done("c2", 0)]))
        .await
        .unwrap();
    master
        .handle_event(Event::ContainersCompleted(vec![done("c1", 1)]))
        .await
        .unwrap();

    // The single replacement hint is the healthy host: h1's failure
    // dropped it behind h2 despite h1 being used first.
    let last = rm.requests().last().unwrap().clone();
    assert_eq!(last.host_hints, vec!["h2".to_string()]);

    // The failed host is still suggested when more hints are wanted
    // (soft decay, not exclusion).
    let worker = master.state().role_by_name("worker").unwrap().clone();
    assert_eq!(
        master.state().history().suggest_nodes(&worker, 2),
        vec!["h2".to_string(), "h1".to_string()]
    );
    assert_converged(&master);
}

#[tokio::test]
async fn test_am_fatal_role_failure_stops_master() {
    let (mut master, _rm) = test_master(0);
    master
        .handle_event(Event::Flex {
            role: "master".to_string(),
            desired: 1,
        })
        .await
        .unwrap();

    master
        .handle_event(Event::ContainersAllocated(vec![alloc("m1", "h1", 1)]))
        .await
        .unwrap();

    let flow = master
        .handle_event(Event::ContainersCompleted(vec![done("m1", 7)]))
        .await
        .unwrap();

    assert!(matches!(flow, MasterFlow::Fatal(_)));
}

#[tokio::test]
async fn test_worker_failure_is_not_fatal() {
    let (mut master, _rm) = test_master(1);
    master.bootstrap().await.unwrap();
    master
        .handle_event(Event::ContainersAllocated(vec![alloc("c1", "h1", 2)]))
        .await
        .unwrap();

    let flow = master
        .handle_event(Event::ContainersCompleted(vec![done("c1", 7)]))
        .await
        .unwrap();

    assert_eq!(flow, MasterFlow::Continue);
    assert_converged(&master);
}

#[tokio::test]
async fn test_unknown_role_flex_ignored() {
    let (mut master, rm) = test_master(1);
    master.bootstrap().await.unwrap();

    let flow = master
        .handle_event(Event::Flex {
            role: "nonexistent".to_string(),
            desired: 5,
        })
        .await
        .unwrap();

    assert_eq!(flow, MasterFlow::Continue);
    assert_eq!(rm.request_count(), 1);
    assert_converged(&master);
}
