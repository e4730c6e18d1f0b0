//! # Sandbox Constants
//!
//! Defines file names, timeouts, and validation limits for the sandbox
//! lifecycle core. These constants are the **single source of truth** for
//! the on-disk layout and for the latency bounds applied to controller calls.
//!
//! ## Cross-References
//!
//! - [`crate::sandbox`]: Uses file names for persisted documents
//! - [`crate::config`]: Uses timeouts as configuration defaults
//! - [`crate::sandbox::controllers`]: Uses the stop poll interval

use std::time::Duration;

// =============================================================================
// Persisted Documents
// =============================================================================
//
// Every sandbox owns three JSON documents under its state directory. They are
// replaced atomically (temp file + rename) on every write.
// =============================================================================

/// Sandbox metadata document (id, name, sandboxer, config, containers).
pub const SANDBOX_METADATA_JSON: &str = "sandbox_metadata.json";

/// Sandbox state document (status, pid, timestamps, exit status).
pub const SANDBOX_STATE_JSON: &str = "sandbox_state.json";

/// Network settings document (opaque blob owned by the network plugin).
pub const NETWORK_SETTINGS_JSON: &str = "network_settings.json";

// =============================================================================
// Sandbox Files
// =============================================================================
//
// Files provisioned under the sandbox root directory at create time and
// bind-mounted into every container of the pod by the container layer.
// =============================================================================

/// Hostname file.
pub const HOSTNAME_FILE: &str = "hostname";

/// Hosts file.
pub const HOSTS_FILE: &str = "hosts";

/// Resolver configuration file.
pub const RESOLV_CONF_FILE: &str = "resolv.conf";

/// Shared memory mount point.
pub const SHM_DIR: &str = "mounts/shm";

/// Default contents of the sandbox hosts file.
pub const DEFAULT_HOSTS_CONTENT: &str = "127.0.0.1\tlocalhost\n\
::1\tlocalhost ip6-localhost ip6-loopback\n\
fe00::0\tip6-localnet\n\
ff00::0\tip6-mcastprefix\n\
ff02::1\tip6-allnodes\n\
ff02::2\tip6-allrouters\n";

// =============================================================================
// Subdirectories
// =============================================================================

/// Subdirectory of the configured root/state paths holding sandboxes.
pub const SANDBOX_SUBDIR: &str = "sandbox";

// =============================================================================
// Timeouts
// =============================================================================
//
// Controller calls may run while the sandbox write lock is held, so every
// call is bounded. A stuck backend surfaces as `Error::Timeout` instead of
// starving readers of the sandbox.
// =============================================================================

/// Default stop timeout in seconds.
///
/// **Rationale**: Keep consistent with the default values set in containerd
/// and cri-o.
pub const DEFAULT_STOP_TIMEOUT: u32 = 10;

/// Upper bound for controller calls other than stop (60 seconds).
pub const CONTROLLER_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Extra time granted to a controller stop beyond the stop deadline.
///
/// **Rationale**: The backend needs time to deliver SIGKILL and reap the
/// process after the graceful period is over.
pub const STOP_GRACE_MARGIN: Duration = Duration::from_secs(5);

/// Poll interval while waiting for a backend process to exit (milliseconds).
pub const STOP_POLL_INTERVAL_MS: u64 = 100;

/// Liveness poll interval for re-attached backend processes.
pub const ATTACH_POLL_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Limits
// =============================================================================

/// Maximum size of a sandbox config or daemon config file (1 MiB).
pub const MAX_CONFIG_SIZE: usize = 1024 * 1024;

/// Maximum size of a network settings blob (1 MiB).
pub const MAX_NETWORK_SETTINGS_SIZE: usize = 1024 * 1024;

/// Maximum number of containers tracked per sandbox.
pub const MAX_CONTAINERS_PER_SANDBOX: usize = 256;

/// Maximum number of labels (and separately annotations) per sandbox.
pub const MAX_LABELS_PER_SANDBOX: usize = 64;

/// Maximum length for label/annotation keys.
pub const MAX_LABEL_KEY_LEN: usize = 253;

/// Maximum length for label/annotation values.
pub const MAX_LABEL_VALUE_LEN: usize = 63 * 1024;

/// Maximum sandbox name length.
pub const MAX_SANDBOX_NAME_LEN: usize = 253;

// =============================================================================
// Sandbox ID Validation
// =============================================================================
//
// Sandbox ids are joined onto the root and state paths, so they are checked
// against an allowlist before any path is built.
// =============================================================================

/// Valid characters for sandbox and container IDs.
///
/// **Security**: Excludes `/`, `.`, and other characters that could be used
/// for path traversal when ids are used in filesystem paths.
pub const SANDBOX_ID_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Maximum sandbox ID length.
pub const MAX_SANDBOX_ID_LEN: usize = 128;

/// Validates a sandbox ID for safety.
///
/// # Returns
///
/// `Ok(())` if valid, `Err(reason)` with a description of the failure.
#[inline]
#[must_use = "validation result must be checked to ensure sandbox ID is safe"]
pub fn validate_sandbox_id(id: &str) -> std::result::Result<(), &'static str> {
    if id.is_empty() {
        return Err("sandbox ID cannot be empty");
    }
    if id.len() > MAX_SANDBOX_ID_LEN {
        return Err("sandbox ID exceeds maximum length");
    }
    if !id.chars().all(|c| SANDBOX_ID_VALID_CHARS.contains(c)) {
        return Err("sandbox ID contains invalid characters");
    }
    Ok(())
}
