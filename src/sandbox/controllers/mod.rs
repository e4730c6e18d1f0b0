//! Controller implementations.
//!
//! Concrete backends reached through the [`Controller`](super::Controller)
//! trait. Each one is registered with a
//! [`ControllerRegistry`](super::ControllerRegistry) under its sandboxer name.

#[cfg(unix)]
pub mod process;

#[cfg(unix)]
pub use self::process::{ProcessController, ProcessControllerFactory};
