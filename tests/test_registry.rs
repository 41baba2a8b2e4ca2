mod common;

use common::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tunnelman::error::TunnelError;
use tunnelman::pid_ledger::{PidMap, PidRecord};
use tunnelman::procs;
use tunnelman::registry::{EVENT_QUEUE_CAPACITY, TunnelRegistry};
use tunnelman::tunnel_status::TunnelStatus;

fn store(ids: &[&str]) -> Arc<MemorySpecStore> {
    let specs = ids
        .iter()
        .enumerate()
        .map(|(i, id)| local_spec(id, 8080 + i as u16))
        .collect();
    Arc::new(MemorySpecStore::new(specs))
}

async fn status(registry: &TunnelRegistry, id: &str) -> TunnelStatus {
    registry.get(id).await.unwrap().status()
}

#[tokio::test]
async fn test_start_and_stop() {
    let env = TestEnv::new();
    let registry = env.registry(store(&["web"]), SSH_OK);

    let tunnel = registry.start("web").await.unwrap();
    assert_eq!(tunnel.status(), TunnelStatus::Running);
    let pid = tunnel.state.pid.unwrap();
    assert!(procs::is_alive(pid));
    assert!(tunnel.state.started_at.is_some());
    assert_eq!(env.ledger().load().unwrap()["web"].pid, pid);

    registry.stop("web").await.unwrap();
    let tunnel = registry.get("web").await.unwrap();
    assert_eq!(tunnel.status(), TunnelStatus::Stopped);
    assert!(tunnel.state.pid.is_none());
    assert!(eventually(|| !procs::is_alive(pid)).await);
    assert!(env.ledger().load().unwrap().is_empty());
    assert!(!env.ledger().path().exists());
}

#[tokio::test]
async fn test_double_start_is_rejected() {
    let env = TestEnv::new();
    let registry = env.registry(store(&["web"]), SSH_OK);

    let pid = registry.start("web").await.unwrap().state.pid;
    let err = registry.start("web").await.unwrap_err();
    assert!(matches!(
        err,
        TunnelError::AlreadyActive {
            status: TunnelStatus::Running,
            ..
        }
    ));
    assert_eq!(registry.get("web").await.unwrap().state.pid, pid);
    registry.stop("web").await.unwrap();
}

#[tokio::test]
async fn test_second_stop_is_not_found() {
    let env = TestEnv::new();
    let registry = env.registry(store(&["web"]), SSH_OK);

    registry.start("web").await.unwrap();
    registry.stop("web").await.unwrap();
    let err = registry.stop("web").await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(status(&registry, "web").await, TunnelStatus::Stopped);

    let err = registry.stop("nope").await.unwrap_err();
    assert!(matches!(err, TunnelError::NotFound { .. }));
}

#[tokio::test]
async fn test_stop_escalates_to_sigkill() {
    let env = TestEnv::new();
    let registry = env.registry(store(&["web"]), SSH_STUBBORN);

    let pid = registry.start("web").await.unwrap().state.pid.unwrap();
    // give the shell time to install its trap
    tokio::time::sleep(Duration::from_millis(200)).await;
    let started = Instant::now();
    registry.stop("web").await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert!(eventually(|| !procs::is_alive(pid)).await);
    assert_eq!(status(&registry, "web").await, TunnelStatus::Stopped);
}

#[tokio::test]
async fn test_invalid_spec_is_rejected_before_spawning() {
    let env = TestEnv::new();
    let mut spec = local_spec("web", 8080);
    spec.dest_port = None;
    let registry = env.registry(Arc::new(MemorySpecStore::new(vec![spec])), SSH_OK);

    let err = registry.start("web").await.unwrap_err();
    assert!(matches!(err, TunnelError::Validation { .. }));
    assert_eq!(status(&registry, "web").await, TunnelStatus::Stopped);
    assert!(registry.supervisor().tracked().is_empty());
}

#[tokio::test]
async fn test_spawn_failure_moves_to_error() {
    let env = TestEnv::new();
    let store = store(&["web"]);
    let supervisor = tunnelman::supervisor::ProcessSupervisor::new(
        tunnelman::supervisor::SupervisorOptions {
            ssh_program: env.path().join("missing-ssh").to_string_lossy().to_string(),
            ..Default::default()
        },
        Arc::new(tunnelman::output::NullSink),
    );
    let registry = TunnelRegistry::new(store, env.ledger(), supervisor, fast_options()).unwrap();

    let err = registry.start("web").await.unwrap_err();
    assert!(matches!(err, TunnelError::Spawn { .. }));
    let tunnel = registry.get("web").await.unwrap();
    assert_eq!(tunnel.status(), TunnelStatus::Error);
    assert!(
        tunnel
            .state
            .last_error
            .unwrap()
            .starts_with("failed to start ssh for tunnel 'web'")
    );

    // Error is a valid starting point
    let err = registry.start("web").await.unwrap_err();
    assert!(matches!(err, TunnelError::Spawn { .. }));
}

#[tokio::test]
async fn test_start_all_reports_failures_and_spaces_starts() {
    let env = TestEnv::new();
    let mut broken = local_spec("b", 8081);
    broken.name = "Broken".to_string();
    broken.dest_port = None;
    let store = Arc::new(MemorySpecStore::new(vec![
        local_spec("a", 8080),
        broken,
        local_spec("c", 8082),
    ]));
    let registry = env.registry(store, SSH_OK);

    let started = Instant::now();
    let err = registry.start_all(None).await.unwrap_err();
    assert!(started.elapsed() >= Duration::from_millis(200));
    match err {
        TunnelError::BatchFailed { operation, failed } => {
            assert_eq!(operation, "start");
            assert_eq!(failed, vec!["Broken"]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(status(&registry, "a").await, TunnelStatus::Running);
    assert_eq!(status(&registry, "b").await, TunnelStatus::Stopped);
    assert_eq!(status(&registry, "c").await, TunnelStatus::Running);

    registry.stop_all(None).await.unwrap();
    for id in ["a", "b", "c"] {
        assert_eq!(status(&registry, id).await, TunnelStatus::Stopped);
    }
}

#[tokio::test]
async fn test_start_all_filters_by_profile() {
    let env = TestEnv::new();
    let mut prod = local_spec("db", 5432);
    prod.profile = "prod".to_string();
    let store = Arc::new(MemorySpecStore::new(vec![prod, local_spec("web", 8080)]));
    let registry = env.registry(store, SSH_OK);

    let started = registry.start_all(Some("prod")).await.unwrap();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].id(), "db");
    assert_eq!(status(&registry, "web").await, TunnelStatus::Stopped);
    assert_eq!(registry.profiles().await, vec!["default", "prod"]);

    registry.stop_all(Some("prod")).await.unwrap();
    assert_eq!(status(&registry, "db").await, TunnelStatus::Stopped);
}

#[tokio::test]
async fn test_auto_connect_skips_running_and_manual_tunnels() {
    let env = TestEnv::new();
    let mut a = local_spec("a", 8080);
    a.auto_connect = true;
    let mut b = local_spec("b", 8081);
    b.auto_connect = true;
    let store = Arc::new(MemorySpecStore::new(vec![a, b, local_spec("manual", 8082)]));
    let registry = env.registry(store, SSH_OK);

    registry.start("a").await.unwrap();
    let started = registry.auto_connect(None).await.unwrap();
    let ids: Vec<&str> = started.iter().map(|t| t.id()).collect();
    assert_eq!(ids, vec!["b"]);
    assert_eq!(status(&registry, "manual").await, TunnelStatus::Stopped);
    registry.stop_all(None).await.unwrap();
}

#[tokio::test]
async fn test_process_exit_is_detected() {
    let env = TestEnv::new();
    let registry = env.registry(store(&["web"]), SSH_FAILS);
    let mut events = registry.take_events().unwrap();
    assert!(registry.take_events().is_none());

    registry.start("web").await.unwrap();
    let mut seen = vec![];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        let done = event.new_status == TunnelStatus::Stopped;
        seen.push(event);
        if done {
            break;
        }
    }
    let transitions: Vec<(TunnelStatus, TunnelStatus)> =
        seen.iter().map(|e| (e.old_status, e.new_status)).collect();
    assert_eq!(
        transitions,
        vec![
            (TunnelStatus::Stopped, TunnelStatus::Connecting),
            (TunnelStatus::Connecting, TunnelStatus::Running),
            (TunnelStatus::Running, TunnelStatus::Stopped),
        ]
    );
    let exit_error = seen[2].error.clone().unwrap();
    assert!(exit_error.contains('3'), "{exit_error}");

    let tunnel = registry.get("web").await.unwrap();
    assert_eq!(tunnel.status(), TunnelStatus::Stopped);
    assert_eq!(tunnel.state.last_error, Some(exit_error));
    assert!(env.ledger().load().unwrap().is_empty());
    assert!(registry.supervisor().tracked().is_empty());
}

#[tokio::test]
async fn test_restart_replaces_the_process() {
    let env = TestEnv::new();
    let registry = env.registry(store(&["web"]), SSH_OK);

    let first = registry.start("web").await.unwrap().state.pid.unwrap();
    let second = registry.restart("web").await.unwrap().state.pid.unwrap();
    assert_ne!(first, second);
    assert!(eventually(|| !procs::is_alive(first)).await);
    assert_eq!(env.ledger().load().unwrap()["web"].pid, second);
    registry.stop("web").await.unwrap();

    // restarting a stopped tunnel just starts it
    registry.restart("web").await.unwrap();
    registry.stop("web").await.unwrap();
}

#[tokio::test]
async fn test_mutations_refused_while_running() {
    let env = TestEnv::new();
    let store = store(&["web"]);
    let registry = env.registry(store.clone(), SSH_OK);

    registry.start("web").await.unwrap();
    let mut changed = local_spec("web", 9090);
    changed.name = "Changed".to_string();
    assert!(matches!(
        registry.update(changed.clone()).await.unwrap_err(),
        TunnelError::Busy { .. }
    ));
    assert!(matches!(
        registry.remove("web").await.unwrap_err(),
        TunnelError::Busy { .. }
    ));
    registry.stop("web").await.unwrap();

    registry.update(changed).await.unwrap();
    assert_eq!(store.specs()[0].name, "Changed");
    registry.remove("web").await.unwrap();
    assert!(store.specs().is_empty());
    assert!(registry.get("web").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_reconcile_recovers_live_and_drops_orphans() {
    let env = TestEnv::new();
    let alive = spawn_sleeper();
    let orphan = spawn_sleeper();
    let dead = {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    };
    let started = chrono::Utc::now();
    let mut pids = PidMap::new();
    pids.insert("web".to_string(), PidRecord::new(alive, started));
    pids.insert("deleted".to_string(), PidRecord::new(orphan, started));
    pids.insert("db".to_string(), PidRecord::new(dead, started));
    env.ledger().save(&pids).unwrap();

    let registry = env.registry(store(&["web", "db"]), SSH_OK);
    let mut events = registry.take_events().unwrap();

    let web = registry.get("web").await.unwrap();
    assert_eq!(web.status(), TunnelStatus::Running);
    assert_eq!(web.state.pid, Some(alive));
    assert_eq!(status(&registry, "db").await, TunnelStatus::Stopped);
    assert!(registry.get("deleted").await.is_err());
    let recovered = events.try_recv().unwrap();
    assert_eq!(recovered.id, "web");
    assert_eq!(recovered.new_status, TunnelStatus::Running);

    let ledger = env.ledger().load().unwrap();
    assert_eq!(ledger.keys().collect::<Vec<_>>(), vec!["web"]);
    // the orphan is forgotten, not killed
    assert!(procs::is_alive(orphan));

    // not owned by this supervisor, so it is stopped by raw pid
    registry.stop("web").await.unwrap();
    assert!(eventually(|| !procs::is_alive(alive)).await);
    assert!(env.ledger().load().unwrap().is_empty());

    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(orphan as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();
}

#[tokio::test]
async fn test_refresh_notices_dead_recovered_tunnels() {
    let env = TestEnv::new();
    let pid = spawn_sleeper();
    let mut pids = PidMap::new();
    pids.insert("web".to_string(), PidRecord::new(pid, chrono::Utc::now()));
    env.ledger().save(&pids).unwrap();

    let registry = env.registry(store(&["web"]), SSH_OK);
    assert_eq!(status(&registry, "web").await, TunnelStatus::Running);
    assert!(registry.refresh().await.is_empty());

    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();
    assert!(eventually(|| !procs::is_alive(pid)).await);

    assert_eq!(registry.refresh().await, vec!["web"]);
    let tunnel = registry.get("web").await.unwrap();
    assert_eq!(tunnel.status(), TunnelStatus::Stopped);
    assert!(tunnel.state.last_error.unwrap().contains("no longer running"));
    assert!(env.ledger().load().unwrap().is_empty());
}

#[tokio::test]
async fn test_shutdown_stops_everything() {
    let env = TestEnv::new();
    let recovered = spawn_sleeper();
    let mut pids = PidMap::new();
    pids.insert("db".to_string(), PidRecord::new(recovered, chrono::Utc::now()));
    env.ledger().save(&pids).unwrap();

    let registry = env.registry(store(&["web", "api", "db"]), SSH_OK);
    let web = registry.start("web").await.unwrap().state.pid.unwrap();
    let api = registry.start("api").await.unwrap().state.pid.unwrap();

    registry.shutdown(Duration::from_secs(5)).await.unwrap();
    for id in ["web", "api", "db"] {
        assert_eq!(status(&registry, id).await, TunnelStatus::Stopped);
    }
    for pid in [web, api, recovered] {
        assert!(eventually(|| !procs::is_alive(pid)).await, "pid {pid} survived");
    }
    assert!(registry.supervisor().tracked().is_empty());
    assert!(!env.ledger().path().exists());
}

#[tokio::test]
async fn test_shutdown_reports_deadline() {
    let env = TestEnv::new();
    let registry = env.registry(store(&["web"]), SSH_STUBBORN);
    let pid = registry.start("web").await.unwrap().state.pid.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = registry
        .shutdown(Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::DeadlineExceeded { pending: 1 }));
    assert_eq!(status(&registry, "web").await, TunnelStatus::Stopped);
    // the background kill still goes through
    assert!(eventually(|| !procs::is_alive(pid)).await);
}

#[tokio::test]
async fn test_list_is_sorted_by_name() {
    let env = TestEnv::new();
    let mut zeta = local_spec("a", 8080);
    zeta.name = "Zeta".to_string();
    let mut alpha = local_spec("b", 8081);
    alpha.name = "Alpha".to_string();
    let registry = env.registry(Arc::new(MemorySpecStore::new(vec![zeta, alpha])), SSH_OK);

    let names: Vec<String> = registry.list().await.into_iter().map(|t| t.spec.name).collect();
    assert_eq!(names, vec!["Alpha", "Zeta"]);
    assert_eq!(registry.list_by_profile("default").await.len(), 2);
    assert!(registry.list_by_profile("prod").await.is_empty());
}

#[tokio::test]
async fn test_add_rejects_duplicates_and_invalid_specs() {
    let env = TestEnv::new();
    let store = store(&["web"]);
    let registry = env.registry(store.clone(), SSH_OK);

    let err = registry.add(local_spec("web", 9000)).await.unwrap_err();
    assert!(matches!(err, TunnelError::Validation { .. }));
    let mut bad = local_spec("db", 5432);
    bad.dest_port = None;
    assert!(registry.add(bad).await.is_err());
    assert_eq!(store.specs().len(), 1);

    let added = registry.add(local_spec("db", 5432)).await.unwrap();
    assert_eq!(added.status(), TunnelStatus::Stopped);
    assert_eq!(store.specs().len(), 2);
    assert!(registry.get("db").await.is_ok());
}

#[tokio::test]
async fn test_failed_save_rolls_back() {
    let env = TestEnv::new();
    let store = store(&["api", "web"]);
    let registry = env.registry(store.clone(), SSH_OK);
    store.fail_saves(true);

    let err = registry.add(local_spec("db", 5432)).await.unwrap_err();
    assert!(matches!(err, TunnelError::Persistence { .. }));
    assert!(registry.get("db").await.unwrap_err().is_not_found());

    let mut changed = registry.get("web").await.unwrap().spec;
    let port = changed.bind_port;
    changed.bind_port = Some(9090);
    assert!(registry.update(changed).await.is_err());
    assert_eq!(registry.get("web").await.unwrap().spec.bind_port, port);

    assert!(registry.remove("api").await.is_err());
    let ids: Vec<String> = registry.specs().await.into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec!["api", "web"]);

    assert!(registry.import(vec![local_spec("db", 5432)]).await.is_err());
    assert!(registry.get("db").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_import_skips_existing_ids() {
    let env = TestEnv::new();
    let store = store(&["web"]);
    let registry = env.registry(store.clone(), SSH_OK);

    let added = registry
        .import(vec![local_spec("web", 9000), local_spec("db", 5432)])
        .await
        .unwrap();
    assert_eq!(added, vec!["db"]);
    assert_eq!(store.specs().len(), 2);
    assert!(registry.import(vec![local_spec("db", 5432)]).await.unwrap().is_empty());
}

/// Reads are not held up while the configuration is being written
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reads_proceed_during_slow_save() {
    let env = TestEnv::new();
    let store = store(&["web"]);
    let registry = env.registry(store.clone(), SSH_OK);
    store.slow_saves(Duration::from_millis(1500));

    let adder = registry.clone();
    let add = tokio::spawn(async move { adder.add(local_spec("db", 5432)).await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let read = tokio::time::timeout(Duration::from_millis(500), registry.get("web")).await;
    assert!(read.is_ok(), "read blocked by the config write");
    assert!(tokio::time::timeout(Duration::from_millis(500), registry.list()).await.is_ok());

    add.await.unwrap().unwrap();
    assert!(registry.get("db").await.is_ok());
}

/// An ssh that dies at once still yields Connecting, Running, Stopped in order
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_events_stay_ordered_when_ssh_dies_immediately() {
    let env = TestEnv::new();
    let registry = env.registry(store(&["web"]), "#!/bin/sh\nexit 1\n");
    let mut events = registry.take_events().unwrap();

    for _ in 0..30 {
        registry.start("web").await.unwrap();
        let mut transitions = vec![];
        while transitions.len() < 3 {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            transitions.push((event.old_status, event.new_status));
        }
        assert_eq!(
            transitions,
            vec![
                (TunnelStatus::Stopped, TunnelStatus::Connecting),
                (TunnelStatus::Connecting, TunnelStatus::Running),
                (TunnelStatus::Running, TunnelStatus::Stopped),
            ]
        );
        assert_eq!(status(&registry, "web").await, TunnelStatus::Stopped);
    }
}

/// Events past the queue capacity are dropped without blocking the caller
#[tokio::test]
async fn test_full_event_queue_drops_instead_of_blocking() {
    let env = TestEnv::new();
    let supervisor = tunnelman::supervisor::ProcessSupervisor::new(
        tunnelman::supervisor::SupervisorOptions {
            ssh_program: env.path().join("missing-ssh").to_string_lossy().to_string(),
            ..Default::default()
        },
        Arc::new(tunnelman::output::NullSink),
    );
    let registry =
        TunnelRegistry::new(store(&["web"]), env.ledger(), supervisor, fast_options()).unwrap();
    let mut events = registry.take_events().unwrap();

    // each failed start is Connecting then Error
    for _ in 0..EVENT_QUEUE_CAPACITY / 2 {
        assert!(registry.start("web").await.is_err());
    }
    let started = Instant::now();
    let extra = tokio::time::timeout(Duration::from_secs(1), registry.start("web")).await;
    assert!(matches!(extra, Ok(Err(TunnelError::Spawn { .. }))));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(status(&registry, "web").await, TunnelStatus::Error);

    let mut received = vec![];
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    assert_eq!(received.len(), EVENT_QUEUE_CAPACITY);
    assert_eq!(
        (received[0].old_status, received[0].new_status),
        (TunnelStatus::Stopped, TunnelStatus::Connecting)
    );
}
