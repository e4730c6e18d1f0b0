//! The pod sandbox.
//!
//! A [`Sandbox`] owns one [`SandboxState`], one [`Controller`] and the
//! mutable per-sandbox fields (network settings, container membership,
//! labels, stats). It drives the lifecycle, persists the three sandbox
//! documents and receives asynchronous exit notifications from its
//! controller.
//!
//! # Locking
//!
//! ```text
//! ┌──────────────────────────────── Sandbox ───────────────────────────────┐
//! │                                                                        │
//! │  fields: tokio RwLock<SandboxFields>      state: SandboxState          │
//! │  ├─ lifecycle ops: write, held across      (own std RwLock, never      │
//! │  │  the controller call                     held across an .await)     │
//! │  ├─ mutators: write                                                    │
//! │  └─ status/accessors: read                 exit callback writes here   │
//! │                                            without touching `fields`   │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Lifecycle operations check the precondition and apply the transition
//! under the `fields` write lock, so concurrent stop/remove calls are
//! serialized. The state lock is independent: status polling and the exit
//! callback never wait on a controller call in flight. Every controller call
//! is bounded by a timeout.
//!
//! # Exit vs Stop
//!
//! An explicit stop and the exit notification are two writers of the same
//! state. Whichever records the termination first wins; the other leaves
//! `exited_at`/`exit_status` untouched.

use super::spec::{SandboxConfig, validate_label};
use super::state::{SandboxState, SandboxStatus, StateSnapshot, StatsInfo, now_nanos};
use super::status::{PodSandboxState, PodSandboxStatus, network_status_from_settings};
use super::store::{MetadataDocument, SandboxStore, write_atomic};
use super::traits::{
    Controller, ControllerCreateParams, ControllerExitInfo, ControllerRegistry,
    ControllerSandboxStatus, ExitNotifier, SandboxExitCallback,
};
use crate::constants::{
    CONTROLLER_CALL_TIMEOUT, DEFAULT_HOSTS_CONTENT, DEFAULT_STOP_TIMEOUT, HOSTNAME_FILE,
    HOSTS_FILE, MAX_CONTAINERS_PER_SANDBOX, MAX_LABELS_PER_SANDBOX, MAX_NETWORK_SETTINGS_SIZE,
    RESOLV_CONF_FILE, SHM_DIR, STOP_GRACE_MARGIN, validate_sandbox_id,
};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

/// Host resolver configuration copied into sandboxes without DNS settings.
const HOST_RESOLV_CONF: &str = "/etc/resolv.conf";

// =============================================================================
// Construction Types
// =============================================================================

/// Everything needed to construct a sandbox.
///
/// All other fields start empty: status `Unknown`, no containers,
/// `network_ready = false`.
#[derive(Debug, Clone, Default)]
pub struct SandboxOptions {
    /// Sandbox identifier (validated against the id allowlist).
    pub id: String,
    /// Sandbox name.
    pub name: String,
    /// Sandboxer (controller family) governing the sandbox.
    pub sandboxer: String,
    /// Runtime handler requested for the sandbox.
    pub runtime_handler: String,
    /// Network namespace path (may be empty).
    pub net_ns_path: String,
    /// Base directory of sandbox root dirs; the root dir is `<root_base>/<id>`.
    pub root_base: PathBuf,
    /// Base directory of sandbox state dirs; the state dir is `<state_base>/<id>`.
    pub state_base: PathBuf,
    /// Creation request snapshot.
    pub config: Arc<SandboxConfig>,
    /// Bound for controller calls other than stop (`None` = 60 seconds).
    pub controller_timeout: Option<Duration>,
}

/// Result of a remove request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// This call removed the sandbox.
    Removed,
    /// Another caller is already removing (or has removed) the sandbox.
    AlreadyRemoving,
}

/// Mutable fields guarded by the sandbox lock.
#[derive(Debug, Default)]
struct SandboxFields {
    task_address: String,
    network_ready: bool,
    network_settings: String,
    containers: Vec<String>,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    stats_info: StatsInfo,
    /// Set while a started removal has not finished (it failed part way, or
    /// was interrupted by a restart).
    removal_pending: bool,
}

// =============================================================================
// Sandbox
// =============================================================================

/// One pod sandbox.
///
/// Always handled through an `Arc<Sandbox>`: the controller reports exits
/// through a weak reference back to it.
pub struct Sandbox {
    id: String,
    name: String,
    sandboxer: String,
    runtime_handler: String,
    net_ns_path: String,
    root_dir: PathBuf,
    state_dir: PathBuf,
    config: Arc<SandboxConfig>,
    controller_timeout: Duration,
    fields: RwLock<SandboxFields>,
    state: SandboxState,
    store: SandboxStore,
    controller: Box<dyn Controller>,
    self_ref: Weak<Sandbox>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("sandboxer", &self.sandboxer)
            .field("root_dir", &self.root_dir)
            .field("state_dir", &self.state_dir)
            .field("status", &self.state.status().ok())
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Creates a sandbox in `Unknown` status. Nothing is written to disk
    /// until [`Sandbox::create`].
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidSandboxId` if the id is not safe to use as a
    /// path component.
    pub fn new(options: SandboxOptions, controller: Box<dyn Controller>) -> Result<Arc<Self>> {
        let fields = SandboxFields {
            labels: options.config.labels.clone(),
            annotations: options.config.annotations.clone(),
            ..SandboxFields::default()
        };
        Self::assemble(options, controller, fields, SandboxState::new())
    }

    fn assemble(
        options: SandboxOptions,
        controller: Box<dyn Controller>,
        fields: SandboxFields,
        state: SandboxState,
    ) -> Result<Arc<Self>> {
        validate_sandbox_id(&options.id).map_err(|reason| Error::InvalidSandboxId {
            id: options.id.clone(),
            reason: reason.to_string(),
        })?;

        let root_dir = options.root_base.join(&options.id);
        let state_dir = options.state_base.join(&options.id);
        let store = SandboxStore::new(state_dir.clone());

        Ok(Arc::new_cyclic(|self_ref| Self {
            id: options.id,
            name: options.name,
            sandboxer: options.sandboxer,
            runtime_handler: options.runtime_handler,
            net_ns_path: options.net_ns_path,
            root_dir,
            state_dir,
            config: options.config,
            controller_timeout: options.controller_timeout.unwrap_or(CONTROLLER_CALL_TIMEOUT),
            fields: RwLock::new(fields),
            state,
            store,
            controller,
            self_ref: self_ref.clone(),
        }))
    }

    // =========================================================================
    // Identity and Paths
    // =========================================================================

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sandboxer(&self) -> &str {
        &self.sandboxer
    }

    pub fn runtime_handler(&self) -> &str {
        &self.runtime_handler
    }

    pub fn net_ns_path(&self) -> &str {
        &self.net_ns_path
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Shared, immutable creation request.
    pub fn config(&self) -> Arc<SandboxConfig> {
        Arc::clone(&self.config)
    }

    /// Lifecycle state (independently locked).
    pub fn state(&self) -> &SandboxState {
        &self.state
    }

    pub fn hostname_path(&self) -> PathBuf {
        self.root_dir.join(HOSTNAME_FILE)
    }

    pub fn hosts_path(&self) -> PathBuf {
        self.root_dir.join(HOSTS_FILE)
    }

    pub fn resolv_path(&self) -> PathBuf {
        self.root_dir.join(RESOLV_CONF_FILE)
    }

    pub fn shm_path(&self) -> PathBuf {
        self.root_dir.join(SHM_DIR)
    }

    pub fn state_path(&self) -> PathBuf {
        self.store.state_path()
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.store.metadata_path()
    }

    pub fn network_settings_path(&self) -> PathBuf {
        self.store.network_settings_path()
    }

    /// True when the sandbox is running.
    pub fn is_ready(&self) -> bool {
        matches!(self.state.status(), Ok(SandboxStatus::Running))
    }

    /// True once a remove has been initiated.
    pub fn is_removal_in_process(&self) -> bool {
        matches!(self.state.status(), Ok(SandboxStatus::Removing))
    }

    // =========================================================================
    // Internal Helpers
    // =========================================================================

    fn exit_notifier(&self) -> ExitNotifier {
        let target: Weak<dyn SandboxExitCallback> = self.self_ref.clone();
        ExitNotifier::new(target)
    }

    fn invalid_state(&self, state: SandboxStatus, expected: &str) -> Error {
        Error::InvalidState {
            id: self.id.clone(),
            state: state.to_string(),
            expected: expected.to_string(),
        }
    }

    /// Runs a controller call under a deadline.
    async fn bounded<T, F>(&self, operation: &str, limit: Duration, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(sandbox = %self.id, operation, ?limit, "Controller call timed out");
                Err(Error::Timeout {
                    operation: format!("controller {operation} for sandbox {}", self.id),
                    duration: limit,
                })
            }
        }
    }

    fn metadata_document(&self, fields: &SandboxFields) -> MetadataDocument {
        MetadataDocument {
            id: self.id.clone(),
            name: self.name.clone(),
            sandboxer: self.sandboxer.clone(),
            runtime_handler: self.runtime_handler.clone(),
            net_ns_path: self.net_ns_path.clone(),
            task_address: fields.task_address.clone(),
            network_ready: fields.network_ready,
            sandbox_config: (*self.config).clone(),
            containers: fields.containers.clone(),
            labels: fields.labels.clone(),
            annotations: fields.annotations.clone(),
        }
    }

    fn save_all(&self, fields: &SandboxFields) -> Result<()> {
        self.store.save_state(&self.state)?;
        self.store.save_metadata(&self.metadata_document(fields))?;
        self.store.save_network_settings(&fields.network_settings)
    }

    // =========================================================================
    // Sandbox Files
    // =========================================================================

    /// Provisions the root and state dirs and writes hostname, hosts and
    /// resolv.conf into the root dir.
    fn setup_sandbox_files(&self) -> Result<()> {
        create_private_dir(&self.root_dir)?;
        create_private_dir(&self.state_dir)?;
        std::fs::create_dir_all(self.shm_path())?;

        let hostname = self.config.effective_hostname();
        write_atomic(&self.hostname_path(), format!("{hostname}\n").as_bytes())?;

        let mut hosts = DEFAULT_HOSTS_CONTENT.to_string();
        if !hostname.is_empty() {
            hosts.push_str(&format!("127.0.1.1\t{hostname}\n"));
        }
        write_atomic(&self.hosts_path(), hosts.as_bytes())?;

        let resolv = if self.config.dns_config.is_empty() {
            std::fs::read_to_string(HOST_RESOLV_CONF).unwrap_or_default()
        } else {
            self.config.dns_config.to_resolv_conf()
        };
        write_atomic(&self.resolv_path(), resolv.as_bytes())?;

        debug!(sandbox = %self.id, root = %self.root_dir.display(), "Sandbox files provisioned");
        Ok(())
    }

    fn remove_dirs(&self) -> Result<()> {
        self.store.remove_all()?;
        match std::fs::remove_dir_all(&self.root_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Persistence {
                path: self.root_dir.clone(),
                reason: e.to_string(),
            }),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Creates the backend sandbox.
    ///
    /// Requires `Unknown`. On success the status is `Created`, pid and task
    /// address are recorded and all three documents are written.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidState` if the sandbox was already created
    /// - `Error::SetupFailed` if the sandbox files cannot be provisioned
    /// - Controller errors (nothing is left on disk, status stays `Unknown`)
    /// - Persistence errors (the sandbox is `Created` in memory regardless)
    #[instrument(skip(self), fields(sandbox = %self.id))]
    pub async fn create(&self) -> Result<()> {
        let mut fields = self.fields.write().await;

        let status = self.state.status()?;
        if status != SandboxStatus::Unknown {
            return Err(self.invalid_state(status, "unknown"));
        }

        if let Err(e) = self.setup_sandbox_files() {
            if let Err(cleanup) = self.remove_dirs() {
                warn!(sandbox = %self.id, error = %cleanup, "Failed to clean up after setup failure");
            }
            return Err(Error::SetupFailed {
                id: self.id.clone(),
                reason: e.to_string(),
            });
        }

        let params = ControllerCreateParams {
            sandbox_id: self.id.clone(),
            runtime_handler: self.runtime_handler.clone(),
            net_ns_path: self.net_ns_path.clone(),
            root_dir: self.root_dir.clone(),
            state_dir: self.state_dir.clone(),
            config: Arc::clone(&self.config),
        };

        let info = match self
            .bounded(
                "create",
                self.controller_timeout,
                self.controller.create(&params, self.exit_notifier()),
            )
            .await
        {
            Ok(info) => info,
            Err(e) => {
                if let Err(cleanup) = self.remove_dirs() {
                    warn!(sandbox = %self.id, error = %cleanup, "Failed to clean up after create failure");
                }
                return Err(e);
            }
        };

        self.state.set_pid(info.pid)?;
        let created_at = if info.created_at == 0 {
            now_nanos()
        } else {
            info.created_at
        };
        self.state.set_created_at(created_at)?;
        self.state.set_status(SandboxStatus::Created)?;
        fields.task_address = info.task_address;

        info!(
            sandbox = %self.id,
            pid = info.pid,
            task_address = %fields.task_address,
            "Sandbox created"
        );

        self.save_all(&fields)
    }

    /// Starts a created sandbox.
    ///
    /// # Errors
    ///
    /// `Error::InvalidState` unless the status is `Created`; the status is
    /// then left unchanged.
    #[instrument(skip(self), fields(sandbox = %self.id))]
    pub async fn start(&self) -> Result<()> {
        let _fields = self.fields.write().await;

        let status = self.state.status()?;
        if status != SandboxStatus::Created {
            return Err(self.invalid_state(status, "created"));
        }

        self.bounded("start", self.controller_timeout, self.controller.start())
            .await?;

        let status = self.state.mark_running()?;
        if status == SandboxStatus::Running {
            info!(sandbox = %self.id, "Sandbox started");
        } else {
            warn!(sandbox = %self.id, "Sandbox exited while starting");
        }

        self.store.save_state(&self.state)
    }

    /// Stops the sandbox.
    ///
    /// `timeout_secs` is the graceful period handed to the controller;
    /// `None` means [`DEFAULT_STOP_TIMEOUT`]. Stopping an already stopped
    /// sandbox succeeds without calling the controller. A controller report
    /// that the backend already exited counts as success.
    #[instrument(skip(self), fields(sandbox = %self.id))]
    pub async fn stop(&self, timeout_secs: Option<u32>) -> Result<()> {
        let _fields = self.fields.write().await;
        self.stop_locked(timeout_secs.unwrap_or(DEFAULT_STOP_TIMEOUT))
            .await
    }

    /// Stop body; the caller holds the fields write lock.
    async fn stop_locked(&self, timeout_secs: u32) -> Result<()> {
        let status = self.state.status()?;
        match status {
            SandboxStatus::Stopped => {
                debug!(sandbox = %self.id, "Sandbox already stopped");
                return Ok(());
            }
            SandboxStatus::Created | SandboxStatus::Running => {}
            _ => return Err(self.invalid_state(status, "running or created")),
        }

        let limit = Duration::from_secs(u64::from(timeout_secs)) + STOP_GRACE_MARGIN;
        match self
            .bounded("stop", limit, self.controller.stop(timeout_secs))
            .await
        {
            Ok(()) => {}
            Err(Error::AlreadyExited(_)) => {
                debug!(sandbox = %self.id, "Backend already exited");
            }
            Err(e) => return Err(e),
        }

        self.state.mark_stopped(0)?;
        info!(sandbox = %self.id, timeout_secs, "Sandbox stopped");

        self.store.save_state(&self.state)
    }

    /// Removes the sandbox.
    ///
    /// Moves to `Removing` before any destructive work so a concurrent
    /// remove observes it and returns [`RemoveOutcome::AlreadyRemoving`]
    /// instead of removing twice. With `force`, a running sandbox is stopped
    /// first with the default timeout. A removal that failed part way is
    /// finished by the next call.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidState` for a running sandbox without `force`, or one
    ///   that was never created (status untouched)
    /// - Controller errors (status is restored)
    /// - Persistence errors while deleting files (status stays `Removing`,
    ///   a retry finishes the removal)
    #[instrument(skip(self), fields(sandbox = %self.id))]
    pub async fn remove(&self, force: bool) -> Result<RemoveOutcome> {
        let mut fields = self.fields.write().await;

        if force && self.state.status()? == SandboxStatus::Running {
            self.stop_locked(DEFAULT_STOP_TIMEOUT).await?;
        }

        let previous = self.state.compare_and_set(
            &[SandboxStatus::Created, SandboxStatus::Stopped],
            SandboxStatus::Removing,
        )?;
        match previous {
            SandboxStatus::Created | SandboxStatus::Stopped => {}
            SandboxStatus::Removing if fields.removal_pending => {
                debug!(sandbox = %self.id, "Resuming unfinished removal");
                self.finish_removal(&mut fields).await?;
                info!(sandbox = %self.id, "Sandbox removed");
                return Ok(RemoveOutcome::Removed);
            }
            SandboxStatus::Removing => {
                debug!(sandbox = %self.id, "Removal already in progress");
                return Ok(RemoveOutcome::AlreadyRemoving);
            }
            other => return Err(self.invalid_state(other, "created or stopped")),
        }
        fields.removal_pending = true;

        if let Err(e) = self.store.save_state(&self.state) {
            warn!(sandbox = %self.id, error = %e, "Failed to persist removing state");
        }

        if let Err(e) = self.finish_removal(&mut fields).await {
            if !e.is_persistence() {
                // Nothing was deleted; Removing is terminal for every other
                // writer, so only this call can leave it.
                self.state
                    .compare_and_set(&[SandboxStatus::Removing], previous)?;
                fields.removal_pending = false;
                if let Err(save) = self.store.save_state(&self.state) {
                    warn!(sandbox = %self.id, error = %save, "Failed to persist restored state");
                }
            }
            return Err(e);
        }

        info!(sandbox = %self.id, "Sandbox removed");
        Ok(RemoveOutcome::Removed)
    }

    /// Finishes a removal interrupted by a daemon restart.
    ///
    /// Only valid for a sandbox recovered in `Removing` status.
    #[instrument(skip(self), fields(sandbox = %self.id))]
    pub async fn complete_removal(&self) -> Result<()> {
        let mut fields = self.fields.write().await;

        let status = self.state.status()?;
        if status != SandboxStatus::Removing {
            return Err(self.invalid_state(status, "removing"));
        }
        if !fields.removal_pending {
            return Ok(());
        }

        self.finish_removal(&mut fields).await?;
        info!(sandbox = %self.id, "Interrupted removal completed");
        Ok(())
    }

    /// Removes backend resources, then every file of the sandbox. Clears
    /// the pending flag once both succeeded.
    async fn finish_removal(&self, fields: &mut SandboxFields) -> Result<()> {
        self.bounded("remove", self.controller_timeout, self.controller.remove())
            .await?;
        self.remove_dirs()?;
        fields.removal_pending = false;
        Ok(())
    }

    // =========================================================================
    // Reconciliation and Status
    // =========================================================================

    /// Re-queries the controller and corrects drifted state.
    ///
    /// Returns true if the state changed. A status that already reflects
    /// termination is never regressed, and `Removing` is never left.
    ///
    /// # Errors
    ///
    /// Controller errors (including an unreachable backend) are returned and
    /// leave the state untouched.
    #[instrument(skip(self), fields(sandbox = %self.id))]
    pub async fn update_status(&self) -> Result<bool> {
        let _fields = self.fields.write().await;

        let reported = self
            .bounded("status", self.controller_timeout, self.controller.status())
            .await?;

        let changed = self.reconcile(&reported)?;
        if changed {
            info!(
                sandbox = %self.id,
                reported = %reported.state,
                status = %self.state.status()?,
                "Sandbox status reconciled"
            );
            self.store.save_state(&self.state)?;
        }
        Ok(changed)
    }

    fn reconcile(&self, reported: &ControllerSandboxStatus) -> Result<bool> {
        let current = self.state.status()?;
        if current.is_terminal() {
            return Ok(false);
        }

        let mut changed = false;
        if reported.pid != 0 && self.state.pid()? == 0 {
            self.state.set_pid(reported.pid)?;
            changed = true;
        }

        match SandboxStatus::from_controller_state(&reported.state) {
            SandboxStatus::Stopped => {
                changed |= self.state.mark_stopped(reported.exited_at)?;
            }
            SandboxStatus::Running
                if matches!(current, SandboxStatus::Unknown | SandboxStatus::Created) =>
            {
                self.state.mark_running()?;
                changed = true;
            }
            SandboxStatus::Created if current == SandboxStatus::Unknown => {
                self.state.set_status(SandboxStatus::Created)?;
                changed = true;
            }
            _ => {}
        }
        Ok(changed)
    }

    /// Assembles a read-only status snapshot.
    pub async fn status(&self) -> Result<PodSandboxStatus> {
        let fields = self.fields.read().await;
        let state = self.state.snapshot()?;

        Ok(PodSandboxStatus {
            id: self.id.clone(),
            name: self.name.clone(),
            metadata: self.config.metadata.clone(),
            state: PodSandboxState::from(state.status),
            status: state.status,
            created_at: state.created_at,
            exited_at: state.exited_at,
            exit_status: state.exit_status,
            pid: state.pid,
            network: network_status_from_settings(&fields.network_settings),
            network_ready: fields.network_ready,
            net_ns_path: self.net_ns_path.clone(),
            namespace_options: self.config.linux.namespace_options.clone(),
            labels: fields.labels.clone(),
            annotations: fields.annotations.clone(),
            sandboxer: self.sandboxer.clone(),
            runtime_handler: self.runtime_handler.clone(),
            task_address: fields.task_address.clone(),
            containers: fields.containers.clone(),
        })
    }

    // =========================================================================
    // Field Accessors
    // =========================================================================

    pub async fn task_address(&self) -> String {
        self.fields.read().await.task_address.clone()
    }

    pub async fn network_ready(&self) -> bool {
        self.fields.read().await.network_ready
    }

    pub async fn network_settings(&self) -> String {
        self.fields.read().await.network_settings.clone()
    }

    pub async fn containers(&self) -> Vec<String> {
        self.fields.read().await.containers.clone()
    }

    pub async fn labels(&self) -> BTreeMap<String, String> {
        self.fields.read().await.labels.clone()
    }

    pub async fn annotations(&self) -> BTreeMap<String, String> {
        self.fields.read().await.annotations.clone()
    }

    pub async fn stats_info(&self) -> StatsInfo {
        self.fields.read().await.stats_info
    }

    // =========================================================================
    // Mutators
    // =========================================================================

    /// Adds or replaces an annotation and persists metadata.
    pub async fn add_annotation(&self, key: &str, value: &str) -> Result<()> {
        validate_label("annotation", key, value)?;
        let mut fields = self.fields.write().await;
        insert_bounded(&mut fields.annotations, "annotation", key, value)?;
        self.store.save_metadata(&self.metadata_document(&fields))
    }

    /// Removes an annotation and persists metadata.
    pub async fn remove_annotation(&self, key: &str) -> Result<()> {
        let mut fields = self.fields.write().await;
        if fields.annotations.remove(key).is_none() {
            return Ok(());
        }
        self.store.save_metadata(&self.metadata_document(&fields))
    }

    /// Adds or replaces a label and persists metadata.
    pub async fn add_label(&self, key: &str, value: &str) -> Result<()> {
        validate_label("label", key, value)?;
        let mut fields = self.fields.write().await;
        insert_bounded(&mut fields.labels, "label", key, value)?;
        self.store.save_metadata(&self.metadata_document(&fields))
    }

    /// Removes a label and persists metadata.
    pub async fn remove_label(&self, key: &str) -> Result<()> {
        let mut fields = self.fields.write().await;
        if fields.labels.remove(key).is_none() {
            return Ok(());
        }
        self.store.save_metadata(&self.metadata_document(&fields))
    }

    /// Appends a container id. Adding a known id is a no-op.
    pub async fn add_container(&self, container_id: &str) -> Result<()> {
        validate_container_id(container_id)?;
        let mut fields = self.fields.write().await;

        if fields.containers.iter().any(|c| c == container_id) {
            return Ok(());
        }
        if fields.containers.len() >= MAX_CONTAINERS_PER_SANDBOX {
            return Err(Error::InvalidInput(format!(
                "sandbox '{}' already has {} containers",
                self.id, MAX_CONTAINERS_PER_SANDBOX
            )));
        }

        fields.containers.push(container_id.to_string());
        debug!(sandbox = %self.id, container = %container_id, "Container attached");
        self.store.save_metadata(&self.metadata_document(&fields))
    }

    /// Removes a container id. Unknown ids are a no-op.
    pub async fn remove_container(&self, container_id: &str) -> Result<()> {
        let mut fields = self.fields.write().await;
        let before = fields.containers.len();
        fields.containers.retain(|c| c != container_id);
        if fields.containers.len() == before {
            return Ok(());
        }
        debug!(sandbox = %self.id, container = %container_id, "Container detached");
        self.store.save_metadata(&self.metadata_document(&fields))
    }

    /// Replaces the container list, dropping duplicates (first one wins).
    pub async fn set_containers(&self, containers: &[String]) -> Result<()> {
        let mut deduped: Vec<String> = Vec::with_capacity(containers.len());
        for id in containers {
            validate_container_id(id)?;
            if !deduped.contains(id) {
                deduped.push(id.clone());
            }
        }
        if deduped.len() > MAX_CONTAINERS_PER_SANDBOX {
            return Err(Error::InvalidInput(format!(
                "too many containers: {} (max {})",
                deduped.len(),
                MAX_CONTAINERS_PER_SANDBOX
            )));
        }

        let mut fields = self.fields.write().await;
        fields.containers = deduped;
        self.store.save_metadata(&self.metadata_document(&fields))
    }

    /// Replaces the network settings blob and persists it verbatim.
    ///
    /// # Errors
    ///
    /// `Error::InvalidInput` if the blob is empty, too large or not JSON.
    pub async fn update_network_settings(&self, settings: &str) -> Result<()> {
        if settings.trim().is_empty() {
            return Err(Error::InvalidInput("network settings cannot be empty".to_string()));
        }
        if settings.len() > MAX_NETWORK_SETTINGS_SIZE {
            return Err(Error::InvalidInput(format!(
                "network settings size {} exceeds limit of {}",
                settings.len(),
                MAX_NETWORK_SETTINGS_SIZE
            )));
        }
        serde_json::from_str::<serde_json::Value>(settings)
            .map_err(|e| Error::InvalidInput(format!("network settings are not JSON: {e}")))?;

        let mut fields = self.fields.write().await;
        fields.network_settings = settings.to_string();
        self.store.save_network_settings(&fields.network_settings)
    }

    /// Sets network readiness and persists metadata.
    pub async fn set_network_ready(&self, ready: bool) -> Result<()> {
        let mut fields = self.fields.write().await;
        if fields.network_ready == ready {
            return Ok(());
        }
        fields.network_ready = ready;
        info!(sandbox = %self.id, ready, "Network readiness changed");
        self.store.save_metadata(&self.metadata_document(&fields))
    }

    /// Replaces the stats snapshot and returns the previous one.
    ///
    /// Stats are not persisted.
    pub async fn update_stats_info(&self, info: StatsInfo) -> StatsInfo {
        let mut fields = self.fields.write().await;
        std::mem::replace(&mut fields.stats_info, info)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Writes all three documents.
    pub async fn save(&self) -> Result<()> {
        let fields = self.fields.read().await;
        self.save_all(&fields)
    }

    /// Writes the state document.
    pub fn save_state(&self) -> Result<()> {
        self.store.save_state(&self.state)
    }

    /// Writes the metadata document.
    pub async fn save_metadata(&self) -> Result<()> {
        let fields = self.fields.read().await;
        self.store.save_metadata(&self.metadata_document(&fields))
    }

    /// Writes the network settings document.
    pub async fn save_network_settings(&self) -> Result<()> {
        let fields = self.fields.read().await;
        self.store.save_network_settings(&fields.network_settings)
    }

    /// Reconstructs a sandbox from its persisted documents.
    ///
    /// The controller is built through `registry` from the persisted
    /// sandboxer and re-attached to the running backend (never re-created).
    /// A missing state document yields a `Stopped` sandbox; a missing
    /// network document yields empty settings.
    ///
    /// # Errors
    ///
    /// - `Error::SandboxNotFound` if no metadata document exists
    /// - `Error::Persistence` if a document is unreadable or inconsistent
    /// - `Error::ControllerUnavailable` if the sandboxer is not registered
    #[instrument(skip(root_base, state_base, registry, controller_timeout))]
    pub async fn load(
        id: &str,
        root_base: &Path,
        state_base: &Path,
        registry: &ControllerRegistry,
        controller_timeout: Option<Duration>,
    ) -> Result<Arc<Self>> {
        validate_sandbox_id(id).map_err(|reason| Error::InvalidSandboxId {
            id: id.to_string(),
            reason: reason.to_string(),
        })?;

        let store = SandboxStore::new(state_base.join(id));
        let metadata = store
            .load_metadata()?
            .ok_or_else(|| Error::SandboxNotFound(id.to_string()))?;
        if metadata.id != id {
            return Err(Error::Persistence {
                path: store.metadata_path(),
                reason: format!("document belongs to sandbox '{}'", metadata.id),
            });
        }

        let snapshot = match store.load_state()? {
            Some(snapshot) => snapshot,
            None => {
                warn!(sandbox = %id, "State document missing, assuming stopped");
                StateSnapshot {
                    status: SandboxStatus::Stopped,
                    ..StateSnapshot::default()
                }
            }
        };
        let network_settings = store.load_network_settings()?.unwrap_or_default();
        let removal_pending = snapshot.status == SandboxStatus::Removing;

        let controller = registry.build(&metadata.sandboxer, id, &metadata.runtime_handler)?;

        let options = SandboxOptions {
            id: metadata.id,
            name: metadata.name,
            sandboxer: metadata.sandboxer,
            runtime_handler: metadata.runtime_handler,
            net_ns_path: metadata.net_ns_path,
            root_base: root_base.to_path_buf(),
            state_base: state_base.to_path_buf(),
            config: Arc::new(metadata.sandbox_config),
            controller_timeout,
        };
        let fields = SandboxFields {
            task_address: metadata.task_address,
            network_ready: metadata.network_ready,
            network_settings,
            containers: metadata.containers,
            labels: metadata.labels,
            annotations: metadata.annotations,
            stats_info: StatsInfo::default(),
            removal_pending,
        };

        let sandbox = Self::assemble(
            options,
            controller,
            fields,
            SandboxState::from_snapshot(snapshot),
        )?;
        sandbox.reattach().await?;

        info!(sandbox = %sandbox.id, status = %sandbox.state.status()?, "Sandbox loaded");
        Ok(sandbox)
    }

    /// Re-attaches the controller to a backend that should still be alive.
    async fn reattach(&self) -> Result<()> {
        let fields = self.fields.write().await;
        let snapshot = self.state.snapshot()?;

        let alive = matches!(
            snapshot.status,
            SandboxStatus::Created | SandboxStatus::Running
        ) && snapshot.exited_at == 0;
        if !alive {
            return Ok(());
        }

        let result = self
            .bounded(
                "recover",
                self.controller_timeout,
                self.controller
                    .recover(snapshot.pid, &fields.task_address, self.exit_notifier()),
            )
            .await;

        match result {
            Ok(()) => {
                debug!(sandbox = %self.id, pid = snapshot.pid, "Controller re-attached");
            }
            Err(Error::AlreadyExited(_)) => {
                warn!(sandbox = %self.id, pid = snapshot.pid, "Backend gone during restart, marking stopped");
                if self.state.mark_stopped(0)?
                    && let Err(e) = self.store.save_state(&self.state)
                {
                    warn!(sandbox = %self.id, error = %e, "Failed to persist recovered state");
                }
            }
            Err(e) => {
                warn!(sandbox = %self.id, error = %e, "Failed to re-attach controller, keeping persisted status");
            }
        }
        Ok(())
    }
}

// =============================================================================
// Exit Callback
// =============================================================================

impl SandboxExitCallback for Sandbox {
    fn on_sandbox_exit(&self, exit: &ControllerExitInfo) {
        match self
            .state
            .record_exit(exit.pid, exit.exit_status, exit.exited_at)
        {
            Ok(true) => {
                info!(
                    sandbox = %self.id,
                    pid = exit.pid,
                    exit_status = exit.exit_status,
                    "Sandbox exited"
                );
                // The state dir is going away; do not race the removal.
                if self.is_removal_in_process() {
                    return;
                }
                if let Err(e) = self.store.save_state(&self.state) {
                    warn!(sandbox = %self.id, error = %e, "Failed to persist exit");
                }
            }
            Ok(false) => {
                debug!(sandbox = %self.id, pid = exit.pid, "Duplicate exit notification ignored");
            }
            Err(e) => {
                error!(sandbox = %self.id, error = %e, "Failed to record exit");
            }
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn validate_container_id(id: &str) -> Result<()> {
    validate_sandbox_id(id)
        .map_err(|reason| Error::InvalidInput(format!("container ID '{id}': {reason}")))
}

fn insert_bounded(
    map: &mut BTreeMap<String, String>,
    kind: &str,
    key: &str,
    value: &str,
) -> Result<()> {
    if !map.contains_key(key) && map.len() >= MAX_LABELS_PER_SANDBOX {
        return Err(Error::InvalidInput(format!(
            "too many {kind}s (max {MAX_LABELS_PER_SANDBOX})"
        )));
    }
    map.insert(key.to_string(), value.to_string());
    Ok(())
}

/// Creates a directory (and parents) readable only by the owner.
fn create_private_dir(path: &Path) -> Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path).map_err(|e| Error::Persistence {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
