//! Sandbox manager.
//!
//! Owns every [`Sandbox`] of the daemon, indexed by id and by name. New
//! sandboxes get a random 64 hex character id; at startup
//! [`SandboxManager::restore`] reloads every sandbox found under the state
//! base directory.

use super::instance::{RemoveOutcome, Sandbox, SandboxOptions};
use super::spec::SandboxConfig;
use super::state::SandboxStatus;
use super::traits::ControllerRegistry;
use crate::config::DaemonConfig;
use crate::constants::{MAX_SANDBOX_NAME_LEN, validate_sandbox_id};
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Request to create a sandbox.
#[derive(Debug, Clone, Default)]
pub struct CreateSandboxRequest {
    /// Sandbox name; derived from the pod metadata when empty.
    pub name: String,
    /// Sandboxer; the daemon default when `None`.
    pub sandboxer: Option<String>,
    /// Runtime handler.
    pub runtime_handler: String,
    /// Network namespace path.
    pub net_ns_path: String,
    /// Creation request.
    pub config: SandboxConfig,
}

#[derive(Debug, Default)]
struct SandboxIndex {
    by_id: HashMap<String, Arc<Sandbox>>,
    /// Name to id. Names are reserved before the sandbox is created.
    by_name: HashMap<String, String>,
}

/// Registry of live sandboxes.
pub struct SandboxManager {
    config: DaemonConfig,
    registry: Arc<ControllerRegistry>,
    index: RwLock<SandboxIndex>,
}

impl std::fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxManager")
            .field("root", &self.config.sandbox_root_base())
            .field("state", &self.config.sandbox_state_base())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Generates a random 64 hex character sandbox id.
pub fn generate_sandbox_id() -> String {
    let mut hasher = Sha256::new();
    hasher.update(uuid::Uuid::new_v4().as_bytes());
    hasher.update(chrono::Utc::now().to_rfc3339().as_bytes());
    hex::encode(hasher.finalize())
}

/// Derives the sandbox name from pod metadata:
/// `k8s_POD_<name>_<namespace>_<uid>_<attempt>`.
pub fn make_sandbox_name(config: &SandboxConfig) -> String {
    let meta = &config.metadata;
    format!(
        "k8s_POD_{}_{}_{}_{}",
        meta.name, meta.namespace, meta.uid, meta.attempt
    )
}

impl SandboxManager {
    /// Creates a manager. Nothing is loaded until [`SandboxManager::restore`].
    pub fn new(config: DaemonConfig, registry: Arc<ControllerRegistry>) -> Self {
        Self {
            config,
            registry,
            index: RwLock::new(SandboxIndex::default()),
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    fn read_index(&self) -> Result<RwLockReadGuard<'_, SandboxIndex>> {
        self.index
            .read()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))
    }

    fn write_index(&self) -> Result<RwLockWriteGuard<'_, SandboxIndex>> {
        self.index
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))
    }

    fn release_name(&self, name: &str) {
        if let Ok(mut index) = self.index.write() {
            index.by_name.remove(name);
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Creates a sandbox (status `Created`).
    ///
    /// # Errors
    ///
    /// - `Error::SandboxAlreadyExists` if the name is taken
    /// - `Error::ControllerUnavailable` if the sandboxer is not registered
    /// - Any error of [`Sandbox::create`]
    pub async fn create_sandbox(&self, request: CreateSandboxRequest) -> Result<Arc<Sandbox>> {
        request.config.validate()?;

        let name = if request.name.is_empty() {
            make_sandbox_name(&request.config)
        } else {
            request.name
        };
        if name.len() > MAX_SANDBOX_NAME_LEN {
            return Err(Error::InvalidInput(format!(
                "sandbox name exceeds maximum length of {MAX_SANDBOX_NAME_LEN}"
            )));
        }
        let sandboxer = request
            .sandboxer
            .unwrap_or_else(|| self.config.default_sandboxer.clone());

        // Reserve the name and pick an id that is not in use.
        let id = {
            let mut index = self.write_index()?;
            if index.by_name.contains_key(&name) {
                return Err(Error::SandboxAlreadyExists(name));
            }
            let mut id = generate_sandbox_id();
            while index.by_id.contains_key(&id) {
                id = generate_sandbox_id();
            }
            index.by_name.insert(name.clone(), id.clone());
            id
        };

        let built = self
            .registry
            .build(&sandboxer, &id, &request.runtime_handler)
            .and_then(|controller| {
                Sandbox::new(
                    SandboxOptions {
                        id: id.clone(),
                        name: name.clone(),
                        sandboxer: sandboxer.clone(),
                        runtime_handler: request.runtime_handler,
                        net_ns_path: request.net_ns_path,
                        root_base: self.config.sandbox_root_base(),
                        state_base: self.config.sandbox_state_base(),
                        config: Arc::new(request.config),
                        controller_timeout: Some(self.config.controller_timeout()),
                    },
                    controller,
                )
            });
        let sandbox = match built {
            Ok(sandbox) => sandbox,
            Err(e) => {
                self.release_name(&name);
                return Err(e);
            }
        };

        match sandbox.create().await {
            Ok(()) => {
                self.register(&sandbox)?;
                info!(sandbox = %id, name = %name, sandboxer = %sandboxer, "Sandbox registered");
                Ok(sandbox)
            }
            // The backend exists even though a document was not written;
            // keep the sandbox reachable so it can be removed.
            Err(e)
                if e.is_persistence()
                    && sandbox.state().status().ok() == Some(SandboxStatus::Created) =>
            {
                warn!(sandbox = %id, error = %e, "Sandbox created but not fully persisted");
                self.register(&sandbox)?;
                Err(e)
            }
            Err(e) => {
                self.release_name(&name);
                Err(e)
            }
        }
    }

    fn register(&self, sandbox: &Arc<Sandbox>) -> Result<()> {
        self.write_index()?
            .by_id
            .insert(sandbox.id().to_string(), Arc::clone(sandbox));
        Ok(())
    }

    /// Creates and starts a sandbox.
    ///
    /// If the start fails the sandbox is removed again and the start error
    /// is returned.
    pub async fn run_sandbox(&self, request: CreateSandboxRequest) -> Result<Arc<Sandbox>> {
        let sandbox = self.create_sandbox(request).await?;
        if let Err(e) = sandbox.start().await {
            warn!(sandbox = %sandbox.id(), error = %e, "Start failed, removing sandbox");
            if let Err(cleanup) = self.remove(sandbox.id(), true).await {
                warn!(sandbox = %sandbox.id(), error = %cleanup, "Cleanup after failed start failed");
            }
            return Err(e);
        }
        Ok(sandbox)
    }

    /// Stops a sandbox. `None` uses the configured stop timeout.
    pub async fn stop(&self, key: &str, timeout_secs: Option<u32>) -> Result<()> {
        let sandbox = self.get(key)?;
        sandbox
            .stop(Some(timeout_secs.unwrap_or(self.config.stop_timeout_secs)))
            .await
    }

    /// Removes a sandbox and drops it from the index.
    ///
    /// `AlreadyRemoving` is only observed after a concurrent removal has
    /// finished, so the sandbox is forgotten on either outcome.
    pub async fn remove(&self, key: &str, force: bool) -> Result<RemoveOutcome> {
        let sandbox = self.get(key)?;
        let outcome = sandbox.remove(force).await?;
        self.forget(&sandbox)?;
        Ok(outcome)
    }

    fn forget(&self, sandbox: &Sandbox) -> Result<()> {
        let mut index = self.write_index()?;
        index.by_id.remove(sandbox.id());
        if index.by_name.get(sandbox.name()).map(String::as_str) == Some(sandbox.id()) {
            index.by_name.remove(sandbox.name());
        }
        Ok(())
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Finds a sandbox by id, name or unique id prefix.
    pub fn get(&self, key: &str) -> Result<Arc<Sandbox>> {
        let index = self.read_index()?;

        if let Some(sandbox) = index.by_id.get(key) {
            return Ok(Arc::clone(sandbox));
        }
        if let Some(sandbox) = index.by_name.get(key).and_then(|id| index.by_id.get(id)) {
            return Ok(Arc::clone(sandbox));
        }

        let mut matches = index.by_id.iter().filter(|(id, _)| id.starts_with(key));
        match (matches.next(), matches.next()) {
            (Some((_, sandbox)), None) if !key.is_empty() => Ok(Arc::clone(sandbox)),
            (Some(_), Some(_)) => Err(Error::InvalidInput(format!(
                "sandbox id prefix '{key}' is ambiguous"
            ))),
            _ => Err(Error::SandboxNotFound(key.to_string())),
        }
    }

    /// Lists all sandboxes ordered by name.
    pub fn list(&self) -> Result<Vec<Arc<Sandbox>>> {
        let index = self.read_index()?;
        let mut sandboxes: Vec<_> = index.by_id.values().cloned().collect();
        sandboxes.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(sandboxes)
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Reloads every sandbox persisted under the state base directory.
    ///
    /// Sandboxes whose documents cannot be loaded are skipped with a
    /// warning. Removals interrupted by a restart are completed. Returns
    /// the number of sandboxes registered.
    pub async fn restore(&self) -> Result<usize> {
        let state_base = self.config.sandbox_state_base();
        let root_base = self.config.sandbox_root_base();

        let entries = match std::fs::read_dir(&state_base) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %state_base.display(), "No sandbox state directory");
                return Ok(0);
            }
            Err(e) => return Err(Error::Io(e)),
        };

        let mut restored = 0;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_sandbox_id(&id).is_err() {
                warn!(dir = %entry.path().display(), "Skipping directory with invalid sandbox id");
                continue;
            }

            let sandbox = match Sandbox::load(
                &id,
                &root_base,
                &state_base,
                &self.registry,
                Some(self.config.controller_timeout()),
            )
            .await
            {
                Ok(sandbox) => sandbox,
                Err(e) => {
                    warn!(sandbox = %id, error = %e, "Failed to restore sandbox, skipping");
                    continue;
                }
            };

            if sandbox.state().status()? == SandboxStatus::Removing {
                if let Err(e) = sandbox.complete_removal().await {
                    warn!(sandbox = %id, error = %e, "Failed to complete interrupted removal");
                }
                continue;
            }

            let mut index = self.write_index()?;
            if index.by_name.contains_key(sandbox.name()) {
                warn!(sandbox = %id, name = %sandbox.name(), "Duplicate sandbox name, skipping");
                continue;
            }
            index
                .by_name
                .insert(sandbox.name().to_string(), id.clone());
            index.by_id.insert(id, sandbox);
            restored += 1;
        }

        info!(count = restored, "Sandboxes restored");
        Ok(restored)
    }

    /// Reconciles every sandbox with its controller. Returns how many
    /// changed. Failures are logged and skipped.
    pub async fn reconcile_all(&self) -> Result<usize> {
        let mut changed = 0;
        for sandbox in self.list()? {
            match sandbox.update_status().await {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(sandbox = %sandbox.id(), error = %e, "Status reconciliation failed");
                }
            }
        }
        Ok(changed)
    }
}
