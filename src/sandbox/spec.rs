//! Sandbox configuration types.
//!
//! [`SandboxConfig`] is the snapshot of a `RunPodSandbox` request. It mirrors
//! the CRI `PodSandboxConfig` message, is validated once when parsed, and is
//! shared read-only (`Arc<SandboxConfig>`) for the lifetime of the sandbox.
//!
//! # Supported Formats
//!
//! - **YAML**: parsed via `serde_yaml`
//! - **JSON**: also supported (YAML is a superset of JSON), and the format the
//!   config is persisted in inside `sandbox_metadata.json`

use crate::constants::{
    MAX_CONFIG_SIZE, MAX_LABEL_KEY_LEN, MAX_LABEL_VALUE_LEN, MAX_LABELS_PER_SANDBOX,
    MAX_SANDBOX_NAME_LEN,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Metadata
// =============================================================================

/// Identity of the pod the sandbox belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SandboxMetadata {
    /// Pod name.
    pub name: String,
    /// Pod UID assigned by the orchestrator.
    pub uid: String,
    /// Pod namespace.
    pub namespace: String,
    /// Attempt number of creating the sandbox.
    pub attempt: u32,
}

// =============================================================================
// DNS / Ports
// =============================================================================

/// Resolver configuration written to the sandbox `resolv.conf`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DnsConfig {
    /// Nameserver addresses.
    pub servers: Vec<String>,
    /// Search domains.
    pub searches: Vec<String>,
    /// Resolver options (e.g. `ndots:5`).
    pub options: Vec<String>,
}

impl DnsConfig {
    /// Returns true if no resolver settings are present.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty() && self.searches.is_empty() && self.options.is_empty()
    }

    /// Renders the config in `resolv.conf` syntax.
    pub fn to_resolv_conf(&self) -> String {
        let mut out = String::new();
        if !self.searches.is_empty() {
            out.push_str(&format!("search {}\n", self.searches.join(" ")));
        }
        for server in &self.servers {
            out.push_str(&format!("nameserver {server}\n"));
        }
        if !self.options.is_empty() {
            out.push_str(&format!("options {}\n", self.options.join(" ")));
        }
        out
    }
}

/// Transport protocol of a port mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// TCP.
    #[default]
    Tcp,
    /// UDP.
    Udp,
    /// SCTP.
    Sctp,
}

/// Host port mapping requested for the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PortMapping {
    /// Protocol of the mapping.
    pub protocol: Protocol,
    /// Port inside the sandbox network namespace.
    pub container_port: u16,
    /// Port on the host (0 = none).
    pub host_port: u16,
    /// Host IP to bind.
    pub host_ip: String,
}

// =============================================================================
// Linux Options
// =============================================================================

/// How a namespace is shared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NamespaceMode {
    /// Namespace is shared by every container of the pod.
    #[default]
    Pod,
    /// Each container gets its own namespace.
    Container,
    /// The host namespace is used.
    Node,
    /// The namespace of a specific target container is used.
    Target,
}

/// Namespace sharing options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NamespaceOptions {
    /// Network namespace mode.
    pub network: NamespaceMode,
    /// PID namespace mode.
    pub pid: NamespaceMode,
    /// IPC namespace mode.
    pub ipc: NamespaceMode,
}

/// Linux specific sandbox options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LinuxSandboxConfig {
    /// Parent cgroup of the sandbox.
    pub cgroup_parent: String,
    /// Sysctls applied to the sandbox.
    pub sysctls: BTreeMap<String, String>,
    /// Namespace sharing options.
    pub namespace_options: NamespaceOptions,
}

// =============================================================================
// Sandbox Config
// =============================================================================

/// Snapshot of the sandbox creation request.
///
/// Never mutated after construction. Label and annotation updates made
/// through the sandbox are tracked on the sandbox itself, seeded from here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SandboxConfig {
    /// Pod identity.
    pub metadata: SandboxMetadata,
    /// Hostname of the sandbox (defaults to the pod name).
    pub hostname: String,
    /// Directory for container logs of this pod.
    pub log_directory: String,
    /// Resolver configuration.
    pub dns_config: DnsConfig,
    /// Port mappings.
    pub port_mappings: Vec<PortMapping>,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Annotations.
    pub annotations: BTreeMap<String, String>,
    /// Linux options.
    pub linux: LinuxSandboxConfig,
}

impl SandboxConfig {
    /// Parses a sandbox config from YAML (or JSON) bytes.
    ///
    /// # Errors
    ///
    /// - Size exceeds `MAX_CONFIG_SIZE`
    /// - Parsing fails
    /// - Validation errors for names and label/annotation bounds
    pub fn from_yaml(yaml: &[u8]) -> Result<Self> {
        if yaml.len() > MAX_CONFIG_SIZE {
            return Err(Error::InvalidInput(format!(
                "sandbox config size {} exceeds limit of {}",
                yaml.len(),
                MAX_CONFIG_SIZE
            )));
        }

        let config: Self =
            serde_yaml::from_slice(yaml).map_err(|e| Error::InvalidInput(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the config.
    pub fn validate(&self) -> Result<()> {
        if self.metadata.name.len() > MAX_SANDBOX_NAME_LEN {
            return Err(Error::InvalidInput(format!(
                "pod name '{}' exceeds maximum length of {}",
                self.metadata.name, MAX_SANDBOX_NAME_LEN
            )));
        }
        validate_string_map(&self.labels, "label")?;
        validate_string_map(&self.annotations, "annotation")?;
        Ok(())
    }

    /// Hostname to write into the sandbox, falling back to the pod name.
    pub fn effective_hostname(&self) -> &str {
        if self.hostname.is_empty() {
            &self.metadata.name
        } else {
            &self.hostname
        }
    }
}

/// Validates count and key/value lengths of a label or annotation map.
pub(crate) fn validate_string_map(map: &BTreeMap<String, String>, kind: &str) -> Result<()> {
    if map.len() > MAX_LABELS_PER_SANDBOX {
        return Err(Error::InvalidInput(format!(
            "too many {}s: {} (max {})",
            kind,
            map.len(),
            MAX_LABELS_PER_SANDBOX
        )));
    }
    for (key, value) in map {
        validate_label(kind, key, value)?;
    }
    Ok(())
}

/// Validates a single label or annotation entry.
pub(crate) fn validate_label(kind: &str, key: &str, value: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidInput(format!("{kind} key cannot be empty")));
    }
    if key.len() > MAX_LABEL_KEY_LEN {
        return Err(Error::InvalidInput(format!(
            "{} key '{}' exceeds max length {}",
            kind, key, MAX_LABEL_KEY_LEN
        )));
    }
    if value.len() > MAX_LABEL_VALUE_LEN {
        return Err(Error::InvalidInput(format!(
            "{} value for '{}' exceeds max length {}",
            kind, key, MAX_LABEL_VALUE_LEN
        )));
    }
    Ok(())
}
