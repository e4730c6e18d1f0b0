//! Controller trait definition.
//!
//! This module defines the contract between a sandbox and the backend that
//! does the actual namespace/process work for it. A sandbox exclusively owns
//! one `Controller`, built for it by the [`ControllerFactory`] registered for
//! its sandboxer.

use super::spec::SandboxConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

// =============================================================================
// Controller Types
// =============================================================================

/// Parameters handed to [`Controller::create`].
#[derive(Debug, Clone)]
pub struct ControllerCreateParams {
    /// Sandbox identifier.
    pub sandbox_id: String,
    /// Runtime handler requested for the sandbox.
    pub runtime_handler: String,
    /// Network namespace path the backend should join (may be empty).
    pub net_ns_path: String,
    /// Sandbox root directory (hostname, hosts, resolv.conf live here).
    pub root_dir: PathBuf,
    /// Sandbox state directory.
    pub state_dir: PathBuf,
    /// Immutable creation request.
    pub config: Arc<SandboxConfig>,
}

/// What the backend reports after creating a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerSandboxInfo {
    /// Backend process id.
    pub pid: u32,
    /// Endpoint of the backend task service.
    pub task_address: String,
    /// Creation time in nanoseconds (0 = let the sandbox stamp it).
    pub created_at: u64,
}

/// Live status as reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerSandboxStatus {
    /// Sandbox identifier.
    pub id: String,
    /// Backend process id.
    pub pid: u32,
    /// Backend state string (`created`, `running`, `stopped`).
    pub state: String,
    /// Endpoint of the backend task service.
    pub task_address: String,
    /// Creation time in nanoseconds.
    pub created_at: u64,
    /// Exit time in nanoseconds (0 if still running).
    pub exited_at: u64,
    /// Backend specific details.
    pub info: HashMap<String, String>,
}

/// Exit notification payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerExitInfo {
    /// Pid of the exited backend process.
    pub pid: u32,
    /// Exit status.
    pub exit_status: u32,
    /// Exit time in nanoseconds (0 = unknown, stamped on receipt).
    pub exited_at: u64,
}

// =============================================================================
// Exit Callback
// =============================================================================

/// Receiver of backend exit notifications.
///
/// Implemented by the sandbox. Called from a task not under the caller's
/// control, possibly while a lifecycle operation on the same sandbox is in
/// flight, and possibly more than once for the same exit.
pub trait SandboxExitCallback: Send + Sync {
    fn on_sandbox_exit(&self, exit: &ControllerExitInfo);
}

/// Handle a controller uses to report backend exits.
///
/// Holds a weak reference so a controller (owned by the sandbox) never keeps
/// its sandbox alive. Notifications after the sandbox is dropped are lost.
#[derive(Clone)]
pub struct ExitNotifier {
    target: Weak<dyn SandboxExitCallback>,
}

impl ExitNotifier {
    /// Creates a notifier delivering to `target`.
    pub fn new(target: Weak<dyn SandboxExitCallback>) -> Self {
        Self { target }
    }

    /// Delivers an exit notification. Returns false if the receiver is gone.
    pub fn notify(&self, exit: ControllerExitInfo) -> bool {
        match self.target.upgrade() {
            Some(target) => {
                target.on_sandbox_exit(&exit);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for ExitNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitNotifier")
            .field("alive", &(self.target.strong_count() > 0))
            .finish()
    }
}

// =============================================================================
// Controller Trait
// =============================================================================

/// Backend driver for a single sandbox.
///
/// # Latency
///
/// The sandbox holds its write lock across these calls, so implementations
/// must return in bounded time. The sandbox additionally wraps every call in
/// a timeout and reports `Error::Timeout` when it elapses.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; `status` may be called
/// concurrently with the exit watcher the controller runs internally.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Returns the sandboxer name of this controller.
    fn sandboxer(&self) -> &str;

    /// Creates the backend sandbox.
    ///
    /// The controller keeps `on_exit` and reports the backend's termination
    /// through it exactly once.
    async fn create(
        &self,
        params: &ControllerCreateParams,
        on_exit: ExitNotifier,
    ) -> Result<ControllerSandboxInfo>;

    /// Starts a created sandbox.
    async fn start(&self) -> Result<()>;

    /// Stops the sandbox.
    ///
    /// Attempts a graceful stop first and escalates to forced termination once
    /// `timeout_secs` have elapsed. A timeout of zero still attempts the
    /// graceful path before escalating. Returns `Error::AlreadyExited` if the
    /// backend was no longer running.
    async fn stop(&self, timeout_secs: u32) -> Result<()>;

    /// Removes all backend resources.
    async fn remove(&self) -> Result<()>;

    /// Returns the live backend status.
    async fn status(&self) -> Result<ControllerSandboxStatus>;

    /// Re-attaches to a backend that survived a daemon restart.
    ///
    /// Must not re-create anything. `pid` and `task_address` are the values
    /// recorded before the restart.
    async fn recover(&self, pid: u32, task_address: &str, on_exit: ExitNotifier) -> Result<()>;
}

/// Builds per-sandbox controllers for one sandboxer.
pub trait ControllerFactory: Send + Sync {
    /// Sandboxer name this factory serves.
    fn sandboxer(&self) -> &str;

    /// Builds a controller for the sandbox.
    fn build(&self, sandbox_id: &str, runtime_handler: &str) -> Result<Box<dyn Controller>>;
}

// =============================================================================
// Registry
// =============================================================================

/// Registry of controller factories by sandboxer name.
///
/// Allows dynamic dispatch to the right backend based on the sandbox's
/// `sandboxer` field.
#[derive(Default)]
pub struct ControllerRegistry {
    factories: Vec<Arc<dyn ControllerFactory>>,
}

impl ControllerRegistry {
    /// Creates a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory, replacing any previous one for the same sandboxer.
    pub fn register(&mut self, factory: Arc<dyn ControllerFactory>) {
        self.factories
            .retain(|f| f.sandboxer() != factory.sandboxer());
        self.factories.push(factory);
    }

    /// Gets a factory by sandboxer name.
    #[must_use]
    pub fn get(&self, sandboxer: &str) -> Option<&Arc<dyn ControllerFactory>> {
        self.factories.iter().find(|f| f.sandboxer() == sandboxer)
    }

    /// Builds a controller for a sandbox.
    pub fn build(
        &self,
        sandboxer: &str,
        sandbox_id: &str,
        runtime_handler: &str,
    ) -> Result<Box<dyn Controller>> {
        let factory = self
            .get(sandboxer)
            .ok_or_else(|| Error::ControllerUnavailable {
                sandboxer: sandboxer.to_string(),
            })?;
        factory.build(sandbox_id, runtime_handler)
    }

    /// Lists all registered sandboxer names.
    #[must_use]
    pub fn sandboxers(&self) -> Vec<&str> {
        self.factories.iter().map(|f| f.sandboxer()).collect()
    }
}

impl std::fmt::Debug for ControllerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerRegistry")
            .field("sandboxers", &self.sandboxers())
            .finish()
    }
}
