//! # magikpod
//!
//! **Pod Sandbox Lifecycle Core**
//!
//! This crate implements the sandbox side of a container-runtime daemon: it
//! represents each pod sandbox, drives it through create/start/stop/remove,
//! delegates the namespace and process work to a pluggable backend, persists
//! enough state to survive a daemon restart, and answers concurrent status
//! queries.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            magikpod                                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                     SandboxManager                          │    │
//! │  │   create/run → get/list → stop → remove      restore()      │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │                        Sandbox                            │      │
//! │  │  Lifecycle state machine │ Dual locks │ Exit callback     │      │
//! │  └───────────────────────────┼───────────────────────────────┘      │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │                    Persistence Codec                      │      │
//! │  │  state / metadata / network documents │ Atomic writes     │      │
//! │  └───────────────────────────────────────────────────────────┘      │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                   Controllers (per sandboxer)                       │
//! │  ┌────────────────────┐  ┌──────────────────────────────────┐       │
//! │  │ ProcessController  │  │ any `impl Controller` registered │       │
//! │  │  pause process     │  │ in the ControllerRegistry        │       │
//! │  └────────────────────┘  └──────────────────────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! ```text
//!   ┌─────────┐   create   ┌─────────┐   start   ┌─────────┐
//!   │ Unknown │ ─────────► │ Created │ ────────► │ Running │
//!   └─────────┘            └────┬────┘           └────┬────┘
//!                               │ stop                │ stop / exit
//!                               │     ┌─────────┐     │
//!                               └───► │ Stopped │ ◄───┘
//!                                     └────┬────┘
//!                                          │ remove (also from Created)
//!                                          ▼
//!                                     ┌──────────┐
//!                                     │ Removing │  (terminal)
//!                                     └──────────┘
//! ```
//!
//! # Crash Safety
//!
//! Every persisted document is replaced atomically (temp file, fsync,
//! rename). Recovery tolerates missing documents and re-attaches controllers
//! to backends that survived the restart instead of re-creating them.
//!
//! # Example
//!
//! ```rust,ignore
//! use magikpod::{DaemonConfig, SandboxManager, ControllerRegistry, ProcessControllerFactory};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> magikpod::Result<()> {
//!     let config = DaemonConfig::default();
//!     let mut registry = ControllerRegistry::new();
//!     registry.register(Arc::new(ProcessControllerFactory::from_config(&config)));
//!
//!     let manager = SandboxManager::new(config, Arc::new(registry));
//!     manager.restore().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod sandbox;

// Re-exports
pub use config::{DaemonConfig, PROCESS_SANDBOXER};
pub use constants::*;
pub use error::{Error, Result};
pub use sandbox::{
    Controller, ControllerExitInfo, ControllerFactory, ControllerRegistry, CreateSandboxRequest,
    PodSandboxStatus, RemoveOutcome, Sandbox, SandboxConfig, SandboxManager, SandboxOptions,
    SandboxState, SandboxStatus,
};

#[cfg(unix)]
pub use sandbox::{ProcessController, ProcessControllerFactory};
