//! Shared test helpers: a recording mock controller and sandbox builders.

#![allow(dead_code)]

use async_trait::async_trait;
use magikpod::sandbox::{
    Controller, ControllerCreateParams, ControllerExitInfo, ControllerFactory, ControllerRegistry,
    ControllerSandboxInfo, ControllerSandboxStatus, ExitNotifier, Sandbox, SandboxConfig,
    SandboxOptions,
};
use magikpod::{Error, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Sandboxer name of the mock controller.
pub const MOCK_SANDBOXER: &str = "mock";

/// Pid reported by the mock backend.
pub const MOCK_PID: u32 = 4242;

/// Call log and knobs shared between a test and its mock controllers.
#[derive(Default)]
pub struct MockCalls {
    pub create: AtomicUsize,
    pub start: AtomicUsize,
    pub stop: AtomicUsize,
    pub remove: AtomicUsize,
    pub status: AtomicUsize,
    pub recover: AtomicUsize,
    pub stop_timeouts: Mutex<Vec<u32>>,
    pub notifier: Mutex<Option<ExitNotifier>>,

    pub fail_create: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_remove: AtomicBool,
    /// `status` fails as if the backend were unreachable.
    pub fail_status: AtomicBool,
    /// `stop` reports that the backend already exited.
    pub stop_reports_exited: AtomicBool,
    /// `stop` fires the exit notification before returning.
    pub exit_during_stop: AtomicBool,
    /// `recover` reports that the backend is gone.
    pub recover_reports_exited: AtomicBool,
    /// Delay inside `remove` and `start`, in milliseconds.
    pub delay_ms: AtomicU64,
    /// State string returned by `status`.
    pub reported_state: Mutex<String>,
}

impl MockCalls {
    pub fn new() -> Arc<Self> {
        let calls = Self::default();
        *calls.reported_state.lock().unwrap() = "running".to_string();
        Arc::new(calls)
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn set(flag: &AtomicBool) {
        flag.store(true, Ordering::SeqCst);
    }

    /// Fires the stored exit notifier.
    pub fn fire_exit(&self, exit_status: u32, exited_at: u64) -> bool {
        let notifier = self.notifier.lock().unwrap().clone();
        notifier.is_some_and(|n| {
            n.notify(ControllerExitInfo {
                pid: MOCK_PID,
                exit_status,
                exited_at,
            })
        })
    }

    async fn delay(&self) {
        let ms = self.delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

pub struct MockController {
    sandbox_id: String,
    calls: Arc<MockCalls>,
}

impl MockController {
    pub fn boxed(sandbox_id: &str, calls: &Arc<MockCalls>) -> Box<dyn Controller> {
        Box::new(Self {
            sandbox_id: sandbox_id.to_string(),
            calls: Arc::clone(calls),
        })
    }

    fn failure(&self, operation: &str) -> Error {
        Error::ControllerFailed {
            id: self.sandbox_id.clone(),
            operation: operation.to_string(),
            reason: "scripted failure".to_string(),
        }
    }
}

#[async_trait]
impl Controller for MockController {
    fn sandboxer(&self) -> &str {
        MOCK_SANDBOXER
    }

    async fn create(
        &self,
        params: &ControllerCreateParams,
        on_exit: ExitNotifier,
    ) -> Result<ControllerSandboxInfo> {
        self.calls.create.fetch_add(1, Ordering::SeqCst);
        if self.calls.fail_create.load(Ordering::SeqCst) {
            return Err(self.failure("create"));
        }
        *self.calls.notifier.lock().unwrap() = Some(on_exit);
        Ok(ControllerSandboxInfo {
            pid: MOCK_PID,
            task_address: format!("unix:///run/mock/{}.sock", params.sandbox_id),
            created_at: 0,
        })
    }

    async fn start(&self) -> Result<()> {
        self.calls.start.fetch_add(1, Ordering::SeqCst);
        self.calls.delay().await;
        if self.calls.fail_start.load(Ordering::SeqCst) {
            return Err(self.failure("start"));
        }
        Ok(())
    }

    async fn stop(&self, timeout_secs: u32) -> Result<()> {
        self.calls.stop.fetch_add(1, Ordering::SeqCst);
        self.calls.stop_timeouts.lock().unwrap().push(timeout_secs);
        if self.calls.exit_during_stop.load(Ordering::SeqCst) {
            self.calls.fire_exit(143, 0);
        }
        if self.calls.stop_reports_exited.load(Ordering::SeqCst) {
            return Err(Error::AlreadyExited(self.sandbox_id.clone()));
        }
        Ok(())
    }

    async fn remove(&self) -> Result<()> {
        self.calls.delay().await;
        if self.calls.fail_remove.load(Ordering::SeqCst) {
            return Err(self.failure("remove"));
        }
        self.calls.remove.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn status(&self) -> Result<ControllerSandboxStatus> {
        self.calls.status.fetch_add(1, Ordering::SeqCst);
        if self.calls.fail_status.load(Ordering::SeqCst) {
            return Err(self.failure("status"));
        }
        Ok(ControllerSandboxStatus {
            id: self.sandbox_id.clone(),
            pid: MOCK_PID,
            state: self.calls.reported_state.lock().unwrap().clone(),
            task_address: String::new(),
            created_at: 0,
            exited_at: 0,
            info: HashMap::new(),
        })
    }

    async fn recover(&self, _pid: u32, _task_address: &str, on_exit: ExitNotifier) -> Result<()> {
        self.calls.recover.fetch_add(1, Ordering::SeqCst);
        if self.calls.recover_reports_exited.load(Ordering::SeqCst) {
            return Err(Error::AlreadyExited(self.sandbox_id.clone()));
        }
        *self.calls.notifier.lock().unwrap() = Some(on_exit);
        Ok(())
    }
}

pub struct MockFactory {
    pub calls: Arc<MockCalls>,
}

impl ControllerFactory for MockFactory {
    fn sandboxer(&self) -> &str {
        MOCK_SANDBOXER
    }

    fn build(&self, sandbox_id: &str, _runtime_handler: &str) -> Result<Box<dyn Controller>> {
        Ok(MockController::boxed(sandbox_id, &self.calls))
    }
}

/// Registry with the mock factory.
pub fn mock_registry(calls: &Arc<MockCalls>) -> ControllerRegistry {
    let mut registry = ControllerRegistry::new();
    registry.register(Arc::new(MockFactory {
        calls: Arc::clone(calls),
    }));
    registry
}

/// Sandbox config with a pod name and one label.
pub fn pod_config(name: &str) -> SandboxConfig {
    let mut config = SandboxConfig::default();
    config.metadata.name = name.to_string();
    config.metadata.namespace = "default".to_string();
    config.metadata.uid = format!("uid-{name}");
    config.labels.insert("app".to_string(), name.to_string());
    config
}

/// Options for a mock sandbox rooted under `base`.
pub fn options(id: &str, base: &Path) -> SandboxOptions {
    SandboxOptions {
        id: id.to_string(),
        name: format!("{id}-name"),
        sandboxer: MOCK_SANDBOXER.to_string(),
        runtime_handler: "runc".to_string(),
        net_ns_path: format!("/var/run/netns/{id}"),
        root_base: base.join("root"),
        state_base: base.join("state"),
        config: Arc::new(pod_config(id)),
        controller_timeout: None,
    }
}

/// Builds a mock sandbox in `Unknown` status.
pub fn mock_sandbox(id: &str, base: &Path, calls: &Arc<MockCalls>) -> Arc<Sandbox> {
    Sandbox::new(options(id, base), MockController::boxed(id, calls)).unwrap()
}
