//! Process controller: one pause process per sandbox.
//!
//! The reference backend. `create` spawns the configured pause command with
//! the sandbox root as working directory, a watcher task reaps it and fires
//! the exit notification. `stop` sends SIGTERM, polls until the deadline and
//! escalates to SIGKILL.
//!
//! # Recovery
//!
//! After a daemon restart the pause process is no longer our child, so it
//! cannot be reaped. `recover` re-attaches by pid and a watcher polls its
//! liveness with `kill(pid, 0)`. The exit status of such a process is not
//! observable and is reported as 0.

use crate::config::{DaemonConfig, PROCESS_SANDBOXER};
use crate::constants::{ATTACH_POLL_INTERVAL, STOP_GRACE_MARGIN, STOP_POLL_INTERVAL_MS};
use crate::error::{Error, Result};
use crate::sandbox::state::now_nanos;
use crate::sandbox::traits::{
    Controller, ControllerCreateParams, ControllerExitInfo, ControllerFactory,
    ControllerSandboxInfo, ControllerSandboxStatus, ExitNotifier,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// =============================================================================
// Signals
// =============================================================================

/// Signal sent to a pause process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    /// SIGTERM (graceful shutdown).
    Term,
    /// SIGKILL (force kill).
    Kill,
}

impl Signal {
    fn as_i32(self) -> i32 {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }
}

fn to_pid(pid: u32) -> Result<libc::pid_t> {
    libc::pid_t::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| Error::Internal(format!("invalid pid {pid}")))
}

/// Sends a signal. Returns false if the process no longer exists.
fn send_signal(pid: u32, signal: Signal) -> Result<bool> {
    let raw = to_pid(pid)?;
    // SAFETY: kill(2) has no memory safety requirements.
    let rc = unsafe { libc::kill(raw, signal.as_i32()) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(Error::Io(err))
    }
}

/// Returns true if a process with this pid exists.
fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = to_pid(pid) else {
        return false;
    };
    // SAFETY: signal 0 only performs the existence and permission check.
    let rc = unsafe { libc::kill(raw, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Shell convention: exit code, or 128 + signal number.
fn exit_code(status: std::process::ExitStatus) -> u32 {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => u32::try_from(code).unwrap_or_default(),
        (None, Some(signal)) => 128 + u32::try_from(signal).unwrap_or_default(),
        (None, None) => 0,
    }
}

// =============================================================================
// Controller
// =============================================================================

/// What the controller knows about its pause process.
#[derive(Debug, Default)]
struct PauseProcess {
    pid: u32,
    created_at: u64,
    started: bool,
    /// True if the process is our child (reaped by the watcher).
    owned: bool,
    exit: Option<ControllerExitInfo>,
}

/// Controller running the sandbox as a pause process.
pub struct ProcessController {
    sandbox_id: String,
    command: Vec<String>,
    process: Arc<RwLock<PauseProcess>>,
    watcher: RwLock<Option<JoinHandle<()>>>,
}

impl ProcessController {
    /// Creates a controller that will run `command` (program then args).
    pub fn new(sandbox_id: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            command,
            process: Arc::new(RwLock::new(PauseProcess::default())),
            watcher: RwLock::new(None),
        }
    }

    fn failed(&self, operation: &str, reason: impl Into<String>) -> Error {
        Error::ControllerFailed {
            id: self.sandbox_id.clone(),
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }

    fn snapshot(&self) -> Result<(u32, bool, bool, Option<ControllerExitInfo>)> {
        let process = self
            .process
            .read()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))?;
        Ok((process.pid, process.started, process.owned, process.exit))
    }

    fn set_watcher(&self, handle: JoinHandle<()>) -> Result<()> {
        let mut watcher = self
            .watcher
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))?;
        if let Some(previous) = watcher.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// True once the pause process is gone.
    fn exited(&self) -> Result<bool> {
        let (pid, _, owned, exit) = self.snapshot()?;
        if exit.is_some() {
            return Ok(true);
        }
        // Our own child stays a zombie until the watcher reaps it, so only
        // the watcher's record counts for it.
        Ok(!owned && !pid_alive(pid))
    }

    /// Polls until the process is gone or `deadline` passes.
    async fn wait_exit(&self, deadline: Instant) -> Result<bool> {
        loop {
            if self.exited()? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(STOP_POLL_INTERVAL_MS)).await;
        }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL.
    async fn terminate(&self, pid: u32, grace: Duration) -> Result<()> {
        if !send_signal(pid, Signal::Term)? {
            return Err(Error::AlreadyExited(self.sandbox_id.clone()));
        }
        debug!(sandbox = %self.sandbox_id, pid, "Sent SIGTERM");

        if self.wait_exit(Instant::now() + grace).await? {
            return Ok(());
        }

        warn!(sandbox = %self.sandbox_id, pid, ?grace, "Grace period elapsed, sending SIGKILL");
        if !send_signal(pid, Signal::Kill)? {
            return Ok(());
        }
        if self.wait_exit(Instant::now() + STOP_GRACE_MARGIN).await? {
            Ok(())
        } else {
            Err(self.failed("stop", format!("process {pid} survived SIGKILL")))
        }
    }
}

#[async_trait]
impl Controller for ProcessController {
    fn sandboxer(&self) -> &str {
        PROCESS_SANDBOXER
    }

    async fn create(
        &self,
        params: &ControllerCreateParams,
        on_exit: ExitNotifier,
    ) -> Result<ControllerSandboxInfo> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| self.failed("create", "empty pause command"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&params.root_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let mut child = cmd
            .spawn()
            .map_err(|e| self.failed("create", format!("failed to spawn {program}: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| self.failed("create", "process exited before its pid was read"))?;
        let created_at = now_nanos();

        {
            let mut process = self
                .process
                .write()
                .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))?;
            *process = PauseProcess {
                pid,
                created_at,
                owned: true,
                ..PauseProcess::default()
            };
        }

        let process = Arc::clone(&self.process);
        let sandbox_id = self.sandbox_id.clone();
        let handle = tokio::spawn(async move {
            let exit_status = match child.wait().await {
                Ok(status) => exit_code(status),
                Err(e) => {
                    warn!(sandbox = %sandbox_id, pid, error = %e, "Failed to wait for pause process");
                    0
                }
            };
            let exit = ControllerExitInfo {
                pid,
                exit_status,
                exited_at: now_nanos(),
            };
            if let Ok(mut process) = process.write() {
                process.exit = Some(exit);
            }
            debug!(sandbox = %sandbox_id, pid, exit_status, "Pause process exited");
            on_exit.notify(exit);
        });
        self.set_watcher(handle)?;

        info!(sandbox = %self.sandbox_id, pid, program = %program, "Pause process spawned");
        Ok(ControllerSandboxInfo {
            pid,
            task_address: String::new(),
            created_at,
        })
    }

    async fn start(&self) -> Result<()> {
        if self.exited()? {
            return Err(self.failed("start", "pause process already exited"));
        }
        let mut process = self
            .process
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))?;
        if process.pid == 0 {
            return Err(self.failed("start", "sandbox was not created"));
        }
        process.started = true;
        Ok(())
    }

    async fn stop(&self, timeout_secs: u32) -> Result<()> {
        let (pid, ..) = self.snapshot()?;
        if pid == 0 || self.exited()? {
            return Err(Error::AlreadyExited(self.sandbox_id.clone()));
        }
        self.terminate(pid, Duration::from_secs(u64::from(timeout_secs)))
            .await
    }

    async fn remove(&self) -> Result<()> {
        let (pid, ..) = self.snapshot()?;
        if pid != 0 && !self.exited()? {
            match self.terminate(pid, Duration::ZERO).await {
                Ok(()) | Err(Error::AlreadyExited(_)) => {}
                Err(e) => return Err(e),
            }
        }
        debug!(sandbox = %self.sandbox_id, pid, "Pause process removed");
        Ok(())
    }

    async fn status(&self) -> Result<ControllerSandboxStatus> {
        let (pid, started, _, exit) = self.snapshot()?;
        let exited = self.exited()?;
        let state = match (exited, started) {
            _ if pid == 0 => "unknown",
            (true, _) => "stopped",
            (false, true) => "running",
            (false, false) => "created",
        };
        let created_at = self
            .process
            .read()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))?
            .created_at;

        let mut info = HashMap::new();
        info.insert("command".to_string(), self.command.join(" "));

        Ok(ControllerSandboxStatus {
            id: self.sandbox_id.clone(),
            pid,
            state: state.to_string(),
            task_address: String::new(),
            created_at,
            exited_at: exit.map(|e| e.exited_at).unwrap_or_default(),
            info,
        })
    }

    async fn recover(&self, pid: u32, _task_address: &str, on_exit: ExitNotifier) -> Result<()> {
        if pid == 0 || !pid_alive(pid) {
            return Err(Error::AlreadyExited(self.sandbox_id.clone()));
        }

        {
            let mut process = self
                .process
                .write()
                .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))?;
            *process = PauseProcess {
                pid,
                started: true,
                ..PauseProcess::default()
            };
        }

        let process = Arc::clone(&self.process);
        let sandbox_id = self.sandbox_id.clone();
        let handle = tokio::spawn(async move {
            while pid_alive(pid) {
                tokio::time::sleep(ATTACH_POLL_INTERVAL).await;
            }
            let exit = ControllerExitInfo {
                pid,
                exit_status: 0,
                exited_at: now_nanos(),
            };
            if let Ok(mut process) = process.write() {
                process.exit = Some(exit);
            }
            debug!(sandbox = %sandbox_id, pid, "Recovered pause process exited");
            on_exit.notify(exit);
        });
        self.set_watcher(handle)?;

        info!(sandbox = %self.sandbox_id, pid, "Re-attached to pause process");
        Ok(())
    }
}

impl Drop for ProcessController {
    fn drop(&mut self) {
        // Stop watching; the process itself is left alone so it can be
        // recovered by the next daemon.
        if let Ok(mut watcher) = self.watcher.write()
            && let Some(handle) = watcher.take()
        {
            handle.abort();
        }
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Builds [`ProcessController`]s sharing one pause command.
#[derive(Debug, Clone)]
pub struct ProcessControllerFactory {
    command: Vec<String>,
}

impl ProcessControllerFactory {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    /// Uses the daemon's configured pause command.
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self::new(config.pause_command.clone())
    }
}

impl ControllerFactory for ProcessControllerFactory {
    fn sandboxer(&self) -> &str {
        PROCESS_SANDBOXER
    }

    fn build(&self, sandbox_id: &str, _runtime_handler: &str) -> Result<Box<dyn Controller>> {
        if self.command.is_empty() {
            return Err(Error::Config("pause command is empty".to_string()));
        }
        Ok(Box::new(ProcessController::new(
            sandbox_id,
            self.command.clone(),
        )))
    }
}
