//! # Pod Sandboxes
//!
//! A pod sandbox is the shared network/IPC/PID namespace unit grouping the
//! containers of one pod. This module holds its lifecycle core:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  SandboxManager  (id/name index, restore at startup)             │
//! │        │                                                         │
//! │        ▼                                                         │
//! │  Sandbox ───────── owns ────────▶ Box<dyn Controller>            │
//! │   │  ├─ SandboxState (own lock)        │                         │
//! │   │  └─ fields (sandbox lock)          │ on_sandbox_exit (async) │
//! │   │          ▲─────────────────────────┘                         │
//! │   ▼                                                              │
//! │  SandboxStore ─▶ sandbox_state.json                              │
//! │                  sandbox_metadata.json                           │
//! │                  network_settings.json                           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lifecycle
//!
//! | Operation | Requires | Result |
//! |-----------|----------|--------|
//! | `create` | `Unknown` | `Created` |
//! | `start` | `Created` | `Running` |
//! | `stop` | `Created`, `Running` (no-op when `Stopped`) | `Stopped` |
//! | `remove` | `Created`, `Stopped` (`Running` with force) | `Removing`, files gone |
//! | exit notification | any | `Stopped` if it was `Running` |
//!
//! ## Backends
//!
//! Backends implement [`Controller`] and are built per sandbox by the
//! [`ControllerFactory`] registered under the sandbox's sandboxer name.
//!
//! ## Example
//!
//! ```rust,ignore
//! use magikpod::sandbox::{ControllerRegistry, ProcessControllerFactory, SandboxManager};
//!
//! let mut registry = ControllerRegistry::new();
//! registry.register(Arc::new(ProcessControllerFactory::from_config(&config)));
//! let manager = SandboxManager::new(config, Arc::new(registry));
//! manager.restore().await?;
//!
//! let sandbox = manager.run_sandbox(request).await?;
//! sandbox.add_container("c1").await?;
//! manager.stop(sandbox.id(), None).await?;
//! manager.remove(sandbox.id(), false).await?;
//! ```

pub mod controllers;
mod instance;
mod manager;
mod spec;
mod state;
mod status;
mod store;
mod traits;

pub use instance::{RemoveOutcome, Sandbox, SandboxOptions};
pub use manager::{CreateSandboxRequest, SandboxManager, generate_sandbox_id, make_sandbox_name};
pub use spec::{
    DnsConfig, LinuxSandboxConfig, NamespaceMode, NamespaceOptions, PortMapping, Protocol,
    SandboxConfig, SandboxMetadata,
};
pub use state::{SandboxState, SandboxStatus, StateSnapshot, StatsInfo, now_nanos};
pub use status::{
    PodSandboxNetworkStatus, PodSandboxState, PodSandboxStatus, network_status_from_settings,
};
pub use store::{MetadataDocument, SandboxStore, write_atomic};
pub use traits::{
    Controller, ControllerCreateParams, ControllerExitInfo, ControllerFactory, ControllerRegistry,
    ControllerSandboxInfo, ControllerSandboxStatus, ExitNotifier, SandboxExitCallback,
};

#[cfg(unix)]
pub use controllers::{ProcessController, ProcessControllerFactory};
