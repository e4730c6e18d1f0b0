//! Integration tests for the sandbox lifecycle.
//!
//! These tests drive a [`Sandbox`] through a recording mock controller and
//! check state transitions, persisted documents, exit handling and
//! concurrent callers.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test --test sandbox_tests
//! ```

mod common;

use common::{MOCK_PID, MockCalls, MockController, mock_registry, mock_sandbox, options};
use magikpod::sandbox::{
    PodSandboxState, RemoveOutcome, Sandbox, SandboxStatus, SandboxStore, StatsInfo,
};
use magikpod::{DEFAULT_STOP_TIMEOUT, Error};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tempfile::TempDir;

const NETWORK_SETTINGS: &str =
    r#"{"networks":{"eth0":{"ip_address":"10.88.0.5","global_ipv6_address":"fd00::5"}}}"#;

async fn running_sandbox(id: &str, dir: &TempDir, calls: &Arc<MockCalls>) -> Arc<Sandbox> {
    let sandbox = mock_sandbox(id, dir.path(), calls);
    sandbox.create().await.unwrap();
    sandbox.start().await.unwrap();
    sandbox
}

// =============================================================================
// Create / Start
// =============================================================================

#[tokio::test]
async fn test_new_sandbox_is_unknown_and_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = mock_sandbox("fresh", dir.path(), &calls);

    assert_eq!(sandbox.state().status().unwrap(), SandboxStatus::Unknown);
    assert!(sandbox.containers().await.is_empty());
    assert!(!sandbox.network_ready().await);
    assert!(!sandbox.state_dir().exists());
    assert!(!sandbox.root_dir().exists());
}

#[test]
fn test_new_rejects_unsafe_id() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let result = Sandbox::new(
        options("../escape", dir.path()),
        MockController::boxed("../escape", &calls),
    );
    assert!(matches!(result, Err(Error::InvalidSandboxId { .. })));
}

#[tokio::test]
async fn test_create_records_backend_and_persists() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = mock_sandbox("sb1", dir.path(), &calls);

    sandbox.create().await.unwrap();

    let snapshot = sandbox.state().snapshot().unwrap();
    assert_eq!(snapshot.status, SandboxStatus::Created);
    assert_eq!(snapshot.pid, MOCK_PID);
    assert!(snapshot.created_at > 0);
    assert_eq!(snapshot.exited_at, 0);
    assert_eq!(sandbox.task_address().await, "unix:///run/mock/sb1.sock");

    assert!(sandbox.state_path().exists());
    assert!(sandbox.metadata_path().exists());
    assert!(sandbox.network_settings_path().exists());
    assert_eq!(MockCalls::count(&calls.create), 1);
}

#[tokio::test]
async fn test_create_writes_sandbox_files() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = mock_sandbox("files", dir.path(), &calls);
    sandbox.create().await.unwrap();

    // Hostname falls back to the pod name.
    let hostname = std::fs::read_to_string(sandbox.hostname_path()).unwrap();
    assert_eq!(hostname, "files\n");

    let hosts = std::fs::read_to_string(sandbox.hosts_path()).unwrap();
    assert!(hosts.starts_with("127.0.0.1\tlocalhost"));
    assert!(hosts.contains("127.0.1.1\tfiles"));

    assert!(sandbox.resolv_path().exists());
    assert!(sandbox.shm_path().is_dir());
}

#[tokio::test]
async fn test_create_twice_is_rejected() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = mock_sandbox("twice", dir.path(), &calls);
    sandbox.create().await.unwrap();

    let err = sandbox.create().await.unwrap_err();
    assert!(err.is_precondition());
    assert_eq!(MockCalls::count(&calls.create), 1);
}

#[tokio::test]
async fn test_create_failure_leaves_nothing_behind() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    MockCalls::set(&calls.fail_create);
    let sandbox = mock_sandbox("broken", dir.path(), &calls);

    let err = sandbox.create().await.unwrap_err();
    assert!(matches!(err, Error::ControllerFailed { .. }));
    assert_eq!(sandbox.state().status().unwrap(), SandboxStatus::Unknown);
    assert!(!sandbox.state_dir().exists());
    assert!(!sandbox.root_dir().exists());
}

#[tokio::test]
async fn test_setup_failure_reports_setup_error() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    // The root base is a file, so neither setup nor cleanup can succeed.
    std::fs::write(dir.path().join("root"), b"").unwrap();
    let sandbox = mock_sandbox("unrooted", dir.path(), &calls);

    let err = sandbox.create().await.unwrap_err();
    assert!(matches!(err, Error::SetupFailed { .. }), "unexpected error: {err}");
    assert_eq!(sandbox.state().status().unwrap(), SandboxStatus::Unknown);
    assert!(!sandbox.state_dir().exists());
    assert_eq!(MockCalls::count(&calls.create), 0);
}

#[tokio::test]
async fn test_start_moves_to_running() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = running_sandbox("run", &dir, &calls).await;

    assert_eq!(sandbox.state().status().unwrap(), SandboxStatus::Running);
    assert!(sandbox.is_ready());

    let persisted = SandboxStore::new(sandbox.state_dir().to_path_buf())
        .load_state()
        .unwrap()
        .unwrap();
    assert_eq!(persisted.status, SandboxStatus::Running);
}

#[tokio::test]
async fn test_second_start_fails_and_keeps_status() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = running_sandbox("again", &dir, &calls).await;

    let err = sandbox.start().await.unwrap_err();
    assert!(err.is_precondition());
    assert_eq!(sandbox.state().status().unwrap(), SandboxStatus::Running);
    assert_eq!(MockCalls::count(&calls.start), 1);
}

#[tokio::test]
async fn test_start_before_create_is_rejected() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = mock_sandbox("early", dir.path(), &calls);

    assert!(sandbox.start().await.unwrap_err().is_precondition());
    assert_eq!(MockCalls::count(&calls.start), 0);
}

#[tokio::test]
async fn test_failed_start_stays_created() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    MockCalls::set(&calls.fail_start);
    let sandbox = mock_sandbox("nostart", dir.path(), &calls);
    sandbox.create().await.unwrap();

    assert!(sandbox.start().await.is_err());
    assert_eq!(sandbox.state().status().unwrap(), SandboxStatus::Created);
}

#[tokio::test]
async fn test_hung_controller_call_times_out() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    calls.delay_ms.store(2_000, Ordering::SeqCst);

    let mut opts = options("slow", dir.path());
    opts.controller_timeout = Some(Duration::from_millis(50));
    let sandbox = Sandbox::new(opts, MockController::boxed("slow", &calls)).unwrap();
    sandbox.create().await.unwrap();

    let err = sandbox.start().await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));
    assert_eq!(sandbox.state().status().unwrap(), SandboxStatus::Created);
}

// =============================================================================
// Stop
// =============================================================================

#[tokio::test]
async fn test_stop_uses_default_timeout() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = running_sandbox("deftimeout", &dir, &calls).await;

    sandbox.stop(None).await.unwrap();

    assert_eq!(
        *calls.stop_timeouts.lock().unwrap(),
        vec![DEFAULT_STOP_TIMEOUT]
    );
    assert_eq!(sandbox.state().status().unwrap(), SandboxStatus::Stopped);
    assert!(sandbox.state().exited_at().unwrap() > 0);
}

#[tokio::test]
async fn test_stop_with_zero_timeout_is_passed_through() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = running_sandbox("zero", &dir, &calls).await;

    sandbox.stop(Some(0)).await.unwrap();

    assert_eq!(*calls.stop_timeouts.lock().unwrap(), vec![0]);
    assert_eq!(sandbox.state().status().unwrap(), SandboxStatus::Stopped);
}

#[tokio::test]
async fn test_stop_created_sandbox() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = mock_sandbox("created", dir.path(), &calls);
    sandbox.create().await.unwrap();

    sandbox.stop(Some(1)).await.unwrap();
    assert_eq!(sandbox.state().status().unwrap(), SandboxStatus::Stopped);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = running_sandbox("idem", &dir, &calls).await;

    sandbox.stop(Some(1)).await.unwrap();
    let exited_at = sandbox.state().exited_at().unwrap();
    sandbox.stop(Some(1)).await.unwrap();

    assert_eq!(MockCalls::count(&calls.stop), 1);
    assert_eq!(sandbox.state().exited_at().unwrap(), exited_at);
}

#[tokio::test]
async fn test_stop_never_created_is_rejected() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = mock_sandbox("never", dir.path(), &calls);

    assert!(sandbox.stop(None).await.unwrap_err().is_precondition());
    assert_eq!(MockCalls::count(&calls.stop), 0);
}

#[tokio::test]
async fn test_stop_of_exited_backend_succeeds() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    MockCalls::set(&calls.stop_reports_exited);
    let sandbox = running_sandbox("gone", &dir, &calls).await;

    sandbox.stop(Some(2)).await.unwrap();
    assert_eq!(sandbox.state().status().unwrap(), SandboxStatus::Stopped);
}

// =============================================================================
// Exit Notifications
// =============================================================================

#[tokio::test]
async fn test_exit_while_running_marks_stopped() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = running_sandbox("crash", &dir, &calls).await;

    assert!(calls.fire_exit(137, 1_700_000_000_000_000_000));

    let snapshot = sandbox.state().snapshot().unwrap();
    assert_eq!(snapshot.status, SandboxStatus::Stopped);
    assert_eq!(snapshot.exit_status, 137);
    assert_eq!(snapshot.exited_at, 1_700_000_000_000_000_000);

    let persisted = SandboxStore::new(sandbox.state_dir().to_path_buf())
        .load_state()
        .unwrap()
        .unwrap();
    assert_eq!(persisted.status, SandboxStatus::Stopped);
    assert_eq!(persisted.exit_status, 137);
}

#[tokio::test]
async fn test_exit_after_stop_is_ignored() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = running_sandbox("late", &dir, &calls).await;

    sandbox.stop(Some(1)).await.unwrap();
    let before = sandbox.state().snapshot().unwrap();

    calls.fire_exit(137, 42);

    assert_eq!(sandbox.state().snapshot().unwrap(), before);
}

#[tokio::test]
async fn test_exit_during_stop_keeps_reported_status() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    MockCalls::set(&calls.exit_during_stop);
    let sandbox = running_sandbox("racing", &dir, &calls).await;

    sandbox.stop(Some(1)).await.unwrap();

    let snapshot = sandbox.state().snapshot().unwrap();
    assert_eq!(snapshot.status, SandboxStatus::Stopped);
    assert_eq!(snapshot.exit_status, 143);
}

#[tokio::test]
async fn test_duplicate_exit_keeps_first() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = running_sandbox("dup", &dir, &calls).await;

    calls.fire_exit(1, 100);
    calls.fire_exit(2, 200);

    let snapshot = sandbox.state().snapshot().unwrap();
    assert_eq!(snapshot.exit_status, 1);
    assert_eq!(snapshot.exited_at, 100);
}

#[tokio::test]
async fn test_exit_after_drop_is_not_delivered() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = running_sandbox("dropped", &dir, &calls).await;
    drop(sandbox);

    assert!(!calls.fire_exit(0, 0));
}

// =============================================================================
// Remove
// =============================================================================

#[tokio::test]
async fn test_remove_stopped_deletes_everything() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = running_sandbox("bye", &dir, &calls).await;
    sandbox.stop(Some(1)).await.unwrap();

    assert_eq!(sandbox.remove(false).await.unwrap(), RemoveOutcome::Removed);

    assert!(sandbox.is_removal_in_process());
    assert!(!sandbox.state_dir().exists());
    assert!(!sandbox.root_dir().exists());
    assert_eq!(MockCalls::count(&calls.remove), 1);
}

#[tokio::test]
async fn test_remove_created_sandbox() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = mock_sandbox("unstarted", dir.path(), &calls);
    sandbox.create().await.unwrap();

    assert_eq!(sandbox.remove(false).await.unwrap(), RemoveOutcome::Removed);
    assert!(!sandbox.state_dir().exists());
}

#[tokio::test]
async fn test_remove_running_requires_force() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = running_sandbox("busy", &dir, &calls).await;

    let err = sandbox.remove(false).await.unwrap_err();
    assert!(err.is_precondition());
    assert_eq!(sandbox.state().status().unwrap(), SandboxStatus::Running);
    assert_eq!(MockCalls::count(&calls.remove), 0);

    assert_eq!(sandbox.remove(true).await.unwrap(), RemoveOutcome::Removed);
    assert_eq!(
        *calls.stop_timeouts.lock().unwrap(),
        vec![DEFAULT_STOP_TIMEOUT]
    );
    assert_eq!(MockCalls::count(&calls.remove), 1);
}

#[tokio::test]
async fn test_remove_controller_failure_restores_status() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = running_sandbox("stuck", &dir, &calls).await;
    sandbox.stop(Some(1)).await.unwrap();

    MockCalls::set(&calls.fail_remove);
    assert!(sandbox.remove(false).await.is_err());
    assert_eq!(sandbox.state().status().unwrap(), SandboxStatus::Stopped);
    assert!(sandbox.state_path().exists());

    calls.fail_remove.store(false, Ordering::SeqCst);
    assert_eq!(sandbox.remove(false).await.unwrap(), RemoveOutcome::Removed);
}

#[tokio::test]
async fn test_rejected_remove_leaves_status_untouched() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = running_sandbox("steady", &dir, &calls).await;

    assert!(sandbox.remove(false).await.unwrap_err().is_precondition());
    assert!(!sandbox.is_removal_in_process());
    let persisted = SandboxStore::new(sandbox.state_dir().to_path_buf())
        .load_state()
        .unwrap()
        .unwrap();
    assert_eq!(persisted.status, SandboxStatus::Running);

    let unknown = mock_sandbox("never", dir.path(), &calls);
    assert!(unknown.remove(false).await.unwrap_err().is_precondition());
    assert_eq!(unknown.state().status().unwrap(), SandboxStatus::Unknown);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exit_racing_rejected_remove_is_kept() {
    let dir = TempDir::new().unwrap();

    for i in 0..200 {
        let calls = MockCalls::new();
        let sandbox = running_sandbox(&format!("race{i}"), &dir, &calls).await;

        let remove = tokio::spawn({
            let sandbox = Arc::clone(&sandbox);
            async move { sandbox.remove(false).await }
        });
        let exit = tokio::spawn({
            let calls = Arc::clone(&calls);
            async move { calls.fire_exit(9, 0) }
        });
        let removed = remove.await.unwrap();
        assert!(exit.await.unwrap());

        let snapshot = sandbox.state().snapshot().unwrap();
        assert_ne!(snapshot.exited_at, 0, "iteration {i} lost the exit");
        assert_eq!(snapshot.exit_status, 9);
        match removed {
            // The exit landed first, so the stopped sandbox was removable.
            Ok(outcome) => {
                assert_eq!(outcome, RemoveOutcome::Removed);
                assert_eq!(snapshot.status, SandboxStatus::Removing);
            }
            Err(e) => {
                assert!(e.is_precondition(), "iteration {i}: {e}");
                assert_eq!(snapshot.status, SandboxStatus::Stopped);
            }
        }
    }
}

#[tokio::test]
async fn test_retry_finishes_failed_file_removal() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = mock_sandbox("halfway", dir.path(), &calls);
    sandbox.create().await.unwrap();

    // A plain file where the root directory was makes deletion fail.
    std::fs::remove_dir_all(sandbox.root_dir()).unwrap();
    std::fs::write(sandbox.root_dir(), b"blocker").unwrap();

    let err = sandbox.remove(false).await.unwrap_err();
    assert!(err.is_persistence(), "unexpected error: {err}");
    assert!(sandbox.is_removal_in_process());

    std::fs::remove_file(sandbox.root_dir()).unwrap();
    assert_eq!(sandbox.remove(false).await.unwrap(), RemoveOutcome::Removed);
    assert!(!sandbox.root_dir().exists());
    assert!(!sandbox.state_dir().exists());
    assert_eq!(MockCalls::count(&calls.remove), 2);

    // Finished now; later callers see the removal as done.
    assert_eq!(
        sandbox.remove(false).await.unwrap(),
        RemoveOutcome::AlreadyRemoving
    );
    assert_eq!(MockCalls::count(&calls.remove), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_removes_remove_once() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = mock_sandbox("contended", dir.path(), &calls);
    sandbox.create().await.unwrap();
    calls.delay_ms.store(50, Ordering::SeqCst);

    let a = tokio::spawn({
        let sandbox = Arc::clone(&sandbox);
        async move { sandbox.remove(false).await }
    });
    let b = tokio::spawn({
        let sandbox = Arc::clone(&sandbox);
        async move { sandbox.remove(false).await }
    });
    let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());

    let mut outcomes = vec![a, b];
    outcomes.sort_by_key(|o| *o == RemoveOutcome::AlreadyRemoving);
    assert_eq!(
        outcomes,
        vec![RemoveOutcome::Removed, RemoveOutcome::AlreadyRemoving]
    );
    assert_eq!(MockCalls::count(&calls.remove), 1);
}

#[tokio::test]
async fn test_removing_blocks_lifecycle() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = mock_sandbox("final", dir.path(), &calls);
    sandbox.create().await.unwrap();
    sandbox.remove(false).await.unwrap();

    assert!(sandbox.start().await.unwrap_err().is_precondition());
    assert!(sandbox.stop(None).await.unwrap_err().is_precondition());
    assert_eq!(
        sandbox.remove(false).await.unwrap(),
        RemoveOutcome::AlreadyRemoving
    );

    // An exit landing now neither revives the sandbox nor recreates files.
    calls.fire_exit(0, 0);
    assert_eq!(sandbox.state().status().unwrap(), SandboxStatus::Removing);
    assert!(!sandbox.state_dir().exists());
}

// =============================================================================
// Containers, Labels, Network
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_container_adds() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = running_sandbox("members", &dir, &calls).await;

    let (a, b) = tokio::join!(sandbox.add_container("c1"), sandbox.add_container("c2"));
    a.unwrap();
    b.unwrap();

    assert_eq!(sandbox.containers().await, vec!["c1", "c2"]);
}

#[tokio::test]
async fn test_container_membership() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = running_sandbox("membership", &dir, &calls).await;

    sandbox.add_container("c1").await.unwrap();
    sandbox.add_container("c1").await.unwrap();
    sandbox.add_container("c2").await.unwrap();
    assert_eq!(sandbox.containers().await, vec!["c1", "c2"]);

    sandbox.remove_container("c1").await.unwrap();
    sandbox.remove_container("missing").await.unwrap();
    assert_eq!(sandbox.containers().await, vec!["c2"]);

    let replacement = vec!["c3".to_string(), "c4".to_string(), "c3".to_string()];
    sandbox.set_containers(&replacement).await.unwrap();
    assert_eq!(sandbox.containers().await, vec!["c3", "c4"]);

    assert!(sandbox.add_container("bad/id").await.is_err());
}

#[tokio::test]
async fn test_labels_are_seeded_and_persisted() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = running_sandbox("labels", &dir, &calls).await;

    assert_eq!(
        sandbox.labels().await.get("app").map(String::as_str),
        Some("labels")
    );

    sandbox.add_label("tier", "web").await.unwrap();
    sandbox.add_annotation("owner", "ops").await.unwrap();
    sandbox.remove_label("app").await.unwrap();

    let metadata = SandboxStore::new(sandbox.state_dir().to_path_buf())
        .load_metadata()
        .unwrap()
        .unwrap();
    assert_eq!(metadata.labels.get("tier").map(String::as_str), Some("web"));
    assert!(!metadata.labels.contains_key("app"));
    assert_eq!(
        metadata.annotations.get("owner").map(String::as_str),
        Some("ops")
    );
    // The creation request itself is immutable.
    assert!(sandbox.config().labels.contains_key("app"));

    assert!(sandbox.add_label("", "x").await.is_err());
}

#[tokio::test]
async fn test_network_settings_validation() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = running_sandbox("net", &dir, &calls).await;

    assert!(matches!(
        sandbox.update_network_settings("").await,
        Err(Error::InvalidInput(_))
    ));
    assert!(matches!(
        sandbox.update_network_settings("not json").await,
        Err(Error::InvalidInput(_))
    ));

    sandbox
        .update_network_settings(NETWORK_SETTINGS)
        .await
        .unwrap();
    let stored = std::fs::read_to_string(sandbox.network_settings_path()).unwrap();
    assert_eq!(stored, NETWORK_SETTINGS);
}

#[tokio::test]
async fn test_stats_are_swapped() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = mock_sandbox("stats", dir.path(), &calls);

    let first = StatsInfo {
        timestamp: 10,
        cpu_use_nanos: 500,
    };
    assert_eq!(sandbox.update_stats_info(first).await, StatsInfo::default());

    let second = StatsInfo {
        timestamp: 20,
        cpu_use_nanos: 900,
    };
    assert_eq!(sandbox.update_stats_info(second).await, first);
    assert_eq!(sandbox.stats_info().await, second);
}

// =============================================================================
// Status
// =============================================================================

#[tokio::test]
async fn test_status_snapshot() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = running_sandbox("report", &dir, &calls).await;
    sandbox
        .update_network_settings(NETWORK_SETTINGS)
        .await
        .unwrap();
    sandbox.set_network_ready(true).await.unwrap();
    sandbox.add_container("c1").await.unwrap();

    let status = sandbox.status().await.unwrap();
    assert_eq!(status.id, "report");
    assert_eq!(status.state, PodSandboxState::SandboxReady);
    assert_eq!(status.status, SandboxStatus::Running);
    assert_eq!(status.pid, MOCK_PID);
    assert_eq!(status.network.ip, "10.88.0.5");
    assert_eq!(status.network.additional_ips, vec!["fd00::5"]);
    assert!(status.network_ready);
    assert_eq!(status.containers, vec!["c1"]);
    assert_eq!(status.metadata.name, "report");

    sandbox.stop(Some(1)).await.unwrap();
    let status = sandbox.status().await.unwrap();
    assert_eq!(status.state, PodSandboxState::SandboxNotReady);
    assert!(status.exited_at >= status.created_at);
}

#[tokio::test]
async fn test_update_status_reconciles_exit() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = running_sandbox("drift", &dir, &calls).await;

    assert!(!sandbox.update_status().await.unwrap());

    *calls.reported_state.lock().unwrap() = "stopped".to_string();
    assert!(sandbox.update_status().await.unwrap());
    assert_eq!(sandbox.state().status().unwrap(), SandboxStatus::Stopped);

    // Never regressed by a stale report.
    *calls.reported_state.lock().unwrap() = "running".to_string();
    assert!(!sandbox.update_status().await.unwrap());
    assert_eq!(sandbox.state().status().unwrap(), SandboxStatus::Stopped);
}

#[tokio::test]
async fn test_update_status_never_leaves_removing() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = mock_sandbox("leaving", dir.path(), &calls);
    sandbox.create().await.unwrap();
    sandbox.remove(false).await.unwrap();

    assert!(!sandbox.update_status().await.unwrap());
    assert_eq!(sandbox.state().status().unwrap(), SandboxStatus::Removing);
}

#[tokio::test]
async fn test_update_status_with_unreachable_controller() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = running_sandbox("silent", &dir, &calls).await;
    let before = std::fs::read(sandbox.state_path()).unwrap();

    MockCalls::set(&calls.fail_status);
    assert!(matches!(
        sandbox.update_status().await,
        Err(Error::ControllerFailed { .. })
    ));

    assert_eq!(sandbox.state().status().unwrap(), SandboxStatus::Running);
    assert_eq!(std::fs::read(sandbox.state_path()).unwrap(), before);
}

// =============================================================================
// Persistence and Recovery
// =============================================================================

#[tokio::test]
async fn test_save_and_load_round_trip() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = running_sandbox("persist", &dir, &calls).await;
    sandbox.add_container("c1").await.unwrap();
    sandbox.add_container("c2").await.unwrap();
    sandbox
        .update_network_settings(NETWORK_SETTINGS)
        .await
        .unwrap();
    sandbox.set_network_ready(true).await.unwrap();
    sandbox.save().await.unwrap();
    let before = sandbox.state().snapshot().unwrap();

    let registry = mock_registry(&calls);
    let loaded = Sandbox::load(
        "persist",
        &dir.path().join("root"),
        &dir.path().join("state"),
        &registry,
        None,
    )
    .await
    .unwrap();

    assert_eq!(loaded.id(), "persist");
    assert_eq!(loaded.name(), sandbox.name());
    assert_eq!(loaded.state().snapshot().unwrap(), before);
    assert_eq!(loaded.containers().await, vec!["c1", "c2"]);
    assert_eq!(loaded.network_settings().await, NETWORK_SETTINGS);
    assert!(loaded.network_ready().await);
    assert_eq!(loaded.task_address().await, sandbox.task_address().await);
    assert_eq!(loaded.config().metadata.uid, "uid-persist");

    // Re-attached, not re-created.
    assert_eq!(MockCalls::count(&calls.recover), 1);
    assert_eq!(MockCalls::count(&calls.create), 1);
}

#[tokio::test]
async fn test_loaded_sandbox_receives_exits() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let original = running_sandbox("reattach", &dir, &calls).await;
    drop(original);

    let registry = mock_registry(&calls);
    let loaded = Sandbox::load(
        "reattach",
        &dir.path().join("root"),
        &dir.path().join("state"),
        &registry,
        None,
    )
    .await
    .unwrap();

    assert!(calls.fire_exit(9, 0));
    assert_eq!(loaded.state().status().unwrap(), SandboxStatus::Stopped);
    assert_eq!(loaded.state().exit_status().unwrap(), 9);
}

#[tokio::test]
async fn test_load_of_vanished_backend_marks_stopped() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    drop(running_sandbox("vanished", &dir, &calls).await);
    MockCalls::set(&calls.recover_reports_exited);

    let registry = mock_registry(&calls);
    let loaded = Sandbox::load(
        "vanished",
        &dir.path().join("root"),
        &dir.path().join("state"),
        &registry,
        None,
    )
    .await
    .unwrap();

    assert_eq!(loaded.state().status().unwrap(), SandboxStatus::Stopped);
    assert!(loaded.state().exited_at().unwrap() > 0);
}

#[tokio::test]
async fn test_load_stopped_sandbox_skips_recover() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = running_sandbox("idle", &dir, &calls).await;
    sandbox.stop(Some(1)).await.unwrap();
    drop(sandbox);

    let registry = mock_registry(&calls);
    let loaded = Sandbox::load(
        "idle",
        &dir.path().join("root"),
        &dir.path().join("state"),
        &registry,
        None,
    )
    .await
    .unwrap();

    assert_eq!(loaded.state().status().unwrap(), SandboxStatus::Stopped);
    assert_eq!(MockCalls::count(&calls.recover), 0);
}

#[tokio::test]
async fn test_load_without_state_document() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = running_sandbox("partial", &dir, &calls).await;
    std::fs::remove_file(sandbox.state_path()).unwrap();
    std::fs::remove_file(sandbox.network_settings_path()).unwrap();
    drop(sandbox);

    let registry = mock_registry(&calls);
    let loaded = Sandbox::load(
        "partial",
        &dir.path().join("root"),
        &dir.path().join("state"),
        &registry,
        None,
    )
    .await
    .unwrap();

    assert_eq!(loaded.state().status().unwrap(), SandboxStatus::Stopped);
    assert_eq!(loaded.network_settings().await, "");
}

#[tokio::test]
async fn test_load_missing_sandbox() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let registry = mock_registry(&calls);

    let result = Sandbox::load(
        "absent",
        &dir.path().join("root"),
        &dir.path().join("state"),
        &registry,
        None,
    )
    .await;
    assert!(matches!(result, Err(Error::SandboxNotFound(_))));
}

#[tokio::test]
async fn test_load_unknown_sandboxer() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    drop(running_sandbox("orphan", &dir, &calls).await);

    let empty = magikpod::ControllerRegistry::new();
    let result = Sandbox::load(
        "orphan",
        &dir.path().join("root"),
        &dir.path().join("state"),
        &empty,
        None,
    )
    .await;
    assert!(matches!(result, Err(Error::ControllerUnavailable { .. })));
}

#[tokio::test]
async fn test_corrupt_state_document_is_reported() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = running_sandbox("corrupt", &dir, &calls).await;
    std::fs::write(sandbox.state_path(), b"{ not json").unwrap();
    drop(sandbox);

    let registry = mock_registry(&calls);
    let err = Sandbox::load(
        "corrupt",
        &dir.path().join("root"),
        &dir.path().join("state"),
        &registry,
        None,
    )
    .await
    .unwrap_err();
    assert!(err.is_persistence());
}

// =============================================================================
// End-to-End Scenario
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_lifecycle_scenario() {
    let dir = TempDir::new().unwrap();
    let calls = MockCalls::new();
    let sandbox = mock_sandbox("s1", dir.path(), &calls);

    sandbox.create().await.unwrap();
    assert_eq!(sandbox.state().status().unwrap(), SandboxStatus::Created);

    sandbox.start().await.unwrap();
    assert_eq!(sandbox.state().status().unwrap(), SandboxStatus::Running);

    let (a, b) = tokio::join!(sandbox.add_container("c1"), sandbox.add_container("c2"));
    a.unwrap();
    b.unwrap();
    assert_eq!(sandbox.containers().await, vec!["c1", "c2"]);

    sandbox.stop(Some(5)).await.unwrap();
    assert_eq!(*calls.stop_timeouts.lock().unwrap(), vec![5]);
    assert_eq!(sandbox.state().status().unwrap(), SandboxStatus::Stopped);

    assert_eq!(sandbox.remove(false).await.unwrap(), RemoveOutcome::Removed);
    assert!(!sandbox.state_path().exists());
    assert!(!sandbox.metadata_path().exists());
    assert!(!sandbox.network_settings_path().exists());
    assert!(!sandbox.root_dir().exists());
}
