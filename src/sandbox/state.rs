//! Sandbox state types.
//!
//! This module defines the runtime state types for sandboxes:
//! - `SandboxStatus`: Lifecycle status of a sandbox
//! - `SandboxState`: Status plus pid, timestamps and exit status, behind its
//!   own lock
//! - `StatsInfo`: Last known CPU usage snapshot

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_nanos() -> u64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .and_then(|n| u64::try_from(n).ok())
        .unwrap_or_default()
}

// =============================================================================
// Sandbox Status
// =============================================================================

/// Lifecycle status of a sandbox.
///
/// ```text
///   Unknown ──create──▶ Created ──start──▶ Running
///                          │                  │
///                          └──stop / exit─────┴──▶ Stopped
///                          │                          │
///                          └────────remove────────────┴──▶ Removing
/// ```
///
/// `Removing` is terminal: no operation moves a sandbox out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    /// Not created yet.
    #[default]
    Unknown,
    /// Created by the controller, not started.
    Created,
    /// Running.
    Running,
    /// Stopped (explicitly or because the backend exited).
    Stopped,
    /// Removal in progress.
    Removing,
}

impl SandboxStatus {
    /// Returns true if no operation may leave this status.
    pub fn is_terminal(self) -> bool {
        self == Self::Removing
    }

    /// Parses a controller-reported state string.
    ///
    /// Controllers report `created`, `running`, `stopped` (or `exited`);
    /// anything else maps to `Unknown`.
    pub fn from_controller_state(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "created" | "ready" => Self::Created,
            "running" => Self::Running,
            "stopped" | "exited" | "notready" => Self::Stopped,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Removing => write!(f, "removing"),
        }
    }
}

// =============================================================================
// Stats
// =============================================================================

/// Last known CPU usage snapshot of the sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsInfo {
    /// Sample time in nanoseconds since the epoch.
    pub timestamp: i64,
    /// Cumulative CPU time in nanoseconds.
    pub cpu_use_nanos: u64,
}

// =============================================================================
// Sandbox State
// =============================================================================

/// Plain copy of the state fields.
///
/// This is what the state document persists and what readers get back from
/// [`SandboxState::snapshot`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StateSnapshot {
    /// Backend process id (0 until known).
    pub pid: u32,
    /// Creation time in nanoseconds (0 until created).
    pub created_at: u64,
    /// Unused. Persisted for compatibility, never consulted.
    pub updated_at: u64,
    /// Exit time in nanoseconds (0 until exited).
    pub exited_at: u64,
    /// Exit status of the backend process.
    pub exit_status: u32,
    /// Lifecycle status.
    pub status: SandboxStatus,
}

/// Lifecycle state of one sandbox.
///
/// Guarded by its own `RwLock`, independent of the sandbox lock, so status
/// polling never waits behind a controller call. Critical sections are short
/// and never span an `.await`.
#[derive(Debug, Default)]
pub struct SandboxState {
    inner: RwLock<StateSnapshot>,
}

impl SandboxState {
    /// Creates a state in `Unknown` status.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a state from a persisted snapshot.
    pub fn from_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            inner: RwLock::new(snapshot),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StateSnapshot>> {
        self.inner
            .read()
            .map_err(|_| Error::Internal("sandbox state lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StateSnapshot>> {
        self.inner
            .write()
            .map_err(|_| Error::Internal("sandbox state lock poisoned".to_string()))
    }

    /// Returns a copy of all fields.
    pub fn snapshot(&self) -> Result<StateSnapshot> {
        Ok(*self.read()?)
    }

    pub fn pid(&self) -> Result<u32> {
        Ok(self.read()?.pid)
    }

    pub fn created_at(&self) -> Result<u64> {
        Ok(self.read()?.created_at)
    }

    pub fn updated_at(&self) -> Result<u64> {
        Ok(self.read()?.updated_at)
    }

    pub fn exited_at(&self) -> Result<u64> {
        Ok(self.read()?.exited_at)
    }

    pub fn exit_status(&self) -> Result<u32> {
        Ok(self.read()?.exit_status)
    }

    pub fn status(&self) -> Result<SandboxStatus> {
        Ok(self.read()?.status)
    }

    pub fn set_pid(&self, pid: u32) -> Result<()> {
        self.write()?.pid = pid;
        Ok(())
    }

    pub fn set_created_at(&self, time: u64) -> Result<()> {
        self.write()?.created_at = time;
        Ok(())
    }

    pub fn set_updated_at(&self, time: u64) -> Result<()> {
        self.write()?.updated_at = time;
        Ok(())
    }

    pub fn set_exited_at(&self, time: u64) -> Result<()> {
        self.write()?.exited_at = time;
        Ok(())
    }

    pub fn set_exit_status(&self, code: u32) -> Result<()> {
        self.write()?.exit_status = code;
        Ok(())
    }

    pub fn set_status(&self, status: SandboxStatus) -> Result<()> {
        self.write()?.status = status;
        Ok(())
    }

    /// Swaps the status and returns the one it replaced.
    ///
    /// The swap is unconditional. Callers inspect the returned value to find
    /// out whether they raced with another writer (a returned `Removing`
    /// means another caller is already removing the sandbox).
    pub fn update_status(&self, status: SandboxStatus) -> Result<SandboxStatus> {
        let mut guard = self.write()?;
        let previous = guard.status;
        guard.status = status;
        Ok(previous)
    }

    /// Moves to `to` only if the current status is one of `from`.
    ///
    /// Check and write happen under one lock, so a concurrent exit
    /// notification can never be overwritten. Returns the status observed
    /// before the call; the transition happened iff it is in `from`.
    pub fn compare_and_set(
        &self,
        from: &[SandboxStatus],
        to: SandboxStatus,
    ) -> Result<SandboxStatus> {
        let mut guard = self.write()?;
        let previous = guard.status;
        if from.contains(&previous) {
            guard.status = to;
        }
        Ok(previous)
    }

    /// Records a backend termination.
    ///
    /// Only the first record wins: once `exited_at` is set, later calls leave
    /// every field untouched and return `false`. A `Running` sandbox moves to
    /// `Stopped`; any other status is kept.
    pub fn record_exit(&self, pid: u32, exit_status: u32, exited_at: u64) -> Result<bool> {
        let mut guard = self.write()?;
        if guard.exited_at != 0 {
            return Ok(false);
        }
        if pid != 0 {
            guard.pid = pid;
        }
        guard.exit_status = exit_status;
        guard.exited_at = if exited_at == 0 { now_nanos() } else { exited_at };
        if guard.status == SandboxStatus::Running {
            guard.status = SandboxStatus::Stopped;
        }
        Ok(true)
    }

    /// Moves a started sandbox to `Running`.
    ///
    /// If an exit was already recorded (the backend died between the start
    /// call and this update), the sandbox goes straight to `Stopped`.
    /// Returns the resulting status.
    pub fn mark_running(&self) -> Result<SandboxStatus> {
        let mut guard = self.write()?;
        guard.status = if guard.exited_at != 0 {
            SandboxStatus::Stopped
        } else {
            SandboxStatus::Running
        };
        Ok(guard.status)
    }

    /// Marks the sandbox stopped after a completed stop or a reconciled exit.
    ///
    /// Stamps `exited_at` only if no exit was recorded yet, so an exit
    /// notification that already landed keeps its values. `Created` and
    /// `Running` move to `Stopped`; other statuses are kept. Returns true if
    /// anything changed.
    pub fn mark_stopped(&self, exited_at: u64) -> Result<bool> {
        let mut guard = self.write()?;
        let mut changed = false;
        if guard.exited_at == 0 {
            guard.exited_at = if exited_at == 0 { now_nanos() } else { exited_at };
            changed = true;
        }
        if matches!(guard.status, SandboxStatus::Created | SandboxStatus::Running) {
            guard.status = SandboxStatus::Stopped;
            changed = true;
        }
        Ok(changed)
    }
}
