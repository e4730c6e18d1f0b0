//! # Sandbox Persistence
//!
//! Each sandbox persists three JSON documents under its state directory:
//!
//! ```text
//! <state_path>/sandbox/<id>/
//! ├── sandbox_state.json      (status, pid, timestamps, exit status)
//! ├── sandbox_metadata.json   (identity, config snapshot, containers, labels)
//! └── network_settings.json   (opaque network blob, stored verbatim)
//! ```
//!
//! ## Atomic Writes
//!
//! Documents are written atomically via a temp file + rename pattern:
//! 1. Write to `<name>.tmp.<uuid>` in the same directory and fsync it
//! 2. Rename to `<name>`
//!
//! A daemon crash mid-write leaves either the previous document or the new
//! one, never a truncated file.
//!
//! ## Missing Directories
//!
//! Writes never create the state directory. It is provisioned when the
//! sandbox is created and deleted when it is removed, so a late writer (an
//! exit notification arriving after removal) fails instead of resurrecting
//! the directory.

use super::spec::SandboxConfig;
use super::state::{SandboxState, StateSnapshot};
use crate::constants::{NETWORK_SETTINGS_JSON, SANDBOX_METADATA_JSON, SANDBOX_STATE_JSON};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

// =============================================================================
// Documents
// =============================================================================

/// Contents of `sandbox_metadata.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MetadataDocument {
    pub id: String,
    pub name: String,
    pub sandboxer: String,
    pub runtime_handler: String,
    pub net_ns_path: String,
    pub task_address: String,
    pub network_ready: bool,
    pub sandbox_config: SandboxConfig,
    pub containers: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

// =============================================================================
// Atomic File Helpers
// =============================================================================

/// Writes `data` to `path` atomically.
///
/// The parent directory must exist.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let persistence_err = |e: std::io::Error| Error::Persistence {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Persistence {
            path: path.to_path_buf(),
            reason: "path has no file name".to_string(),
        })?;

    // Unique temp name so concurrent writers never share a temp file.
    let temp_path = path.with_file_name(format!("{file_name}.tmp.{}", uuid::Uuid::now_v7()));

    let write_result = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()
    })();

    if let Err(e) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(persistence_err(e));
    }

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        persistence_err(e)
    })?;

    // Best effort: make the rename itself durable.
    #[cfg(unix)]
    if let Some(parent) = path.parent()
        && let Ok(dir) = fs::File::open(parent)
    {
        let _ = dir.sync_all();
    }

    Ok(())
}

/// Reads a JSON document. Returns `Ok(None)` if the file does not exist.
fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Error::Persistence {
                path: path.to_path_buf(),
                reason: e.to_string(),
            });
        }
    };

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| Error::Persistence {
            path: path.to_path_buf(),
            reason: format!("invalid document: {e}"),
        })
}

// =============================================================================
// Store
// =============================================================================

/// Reads and writes the persisted documents of one sandbox.
///
/// ## Thread Safety
///
/// Writes of each document are serialized by a per-document mutex, and the
/// state snapshot is taken while that mutex is held. Two writers racing on
/// the state document therefore cannot publish an older snapshot over a
/// newer one.
#[derive(Debug)]
pub struct SandboxStore {
    state_dir: PathBuf,
    state_lock: Mutex<()>,
    metadata_lock: Mutex<()>,
    network_lock: Mutex<()>,
}

impl SandboxStore {
    /// Creates a store rooted at a sandbox state directory.
    pub fn new(state_dir: PathBuf) -> Self {
        Self {
            state_dir,
            state_lock: Mutex::new(()),
            metadata_lock: Mutex::new(()),
            network_lock: Mutex::new(()),
        }
    }

    /// Returns the state directory.
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join(SANDBOX_STATE_JSON)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.state_dir.join(SANDBOX_METADATA_JSON)
    }

    pub fn network_settings_path(&self) -> PathBuf {
        self.state_dir.join(NETWORK_SETTINGS_JSON)
    }

    fn lock<'a>(&self, mutex: &'a Mutex<()>) -> Result<MutexGuard<'a, ()>> {
        mutex
            .lock()
            .map_err(|_| Error::Internal("sandbox store lock poisoned".to_string()))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Persists the current state.
    pub fn save_state(&self, state: &SandboxState) -> Result<()> {
        let _guard = self.lock(&self.state_lock)?;
        let snapshot = state.snapshot()?;
        let data = serde_json::to_vec_pretty(&snapshot)?;
        write_atomic(&self.state_path(), &data)?;
        debug!(dir = %self.state_dir.display(), status = %snapshot.status, "Saved sandbox state");
        Ok(())
    }

    /// Persists the metadata document.
    pub fn save_metadata(&self, metadata: &MetadataDocument) -> Result<()> {
        let _guard = self.lock(&self.metadata_lock)?;
        let data = serde_json::to_vec_pretty(metadata)?;
        write_atomic(&self.metadata_path(), &data)?;
        debug!(dir = %self.state_dir.display(), "Saved sandbox metadata");
        Ok(())
    }

    /// Persists the network settings blob verbatim.
    pub fn save_network_settings(&self, settings: &str) -> Result<()> {
        let _guard = self.lock(&self.network_lock)?;
        write_atomic(&self.network_settings_path(), settings.as_bytes())?;
        debug!(dir = %self.state_dir.display(), "Saved network settings");
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Loads the state document, `None` if it was never written.
    pub fn load_state(&self) -> Result<Option<StateSnapshot>> {
        read_json(&self.state_path())
    }

    /// Loads the metadata document, `None` if it was never written.
    pub fn load_metadata(&self) -> Result<Option<MetadataDocument>> {
        read_json(&self.metadata_path())
    }

    /// Loads the network settings blob, `None` if it was never written.
    pub fn load_network_settings(&self) -> Result<Option<String>> {
        let path = self.network_settings_path();
        match fs::read_to_string(&path) {
            Ok(settings) => Ok(Some(settings)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Persistence {
                path,
                reason: e.to_string(),
            }),
        }
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Deletes the state directory and every document in it.
    ///
    /// Holds all document locks so no write lands mid-deletion.
    pub fn remove_all(&self) -> Result<()> {
        let _state = self.lock(&self.state_lock)?;
        let _metadata = self.lock(&self.metadata_lock)?;
        let _network = self.lock(&self.network_lock)?;

        match fs::remove_dir_all(&self.state_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Persistence {
                path: self.state_dir.clone(),
                reason: e.to_string(),
            }),
        }
    }
}
