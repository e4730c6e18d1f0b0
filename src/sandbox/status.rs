//! Read-only status snapshot handed to the API layer.
//!
//! A [`PodSandboxStatus`] is assembled from the sandbox state, its network
//! fields and its container list. It owns copies of everything it reports
//! and never aliases mutable sandbox fields.

use super::spec::{NamespaceOptions, SandboxMetadata};
use super::state::SandboxStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Readiness as the orchestrator sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PodSandboxState {
    /// The sandbox is running.
    SandboxReady,
    /// Any other status.
    SandboxNotReady,
}

impl From<SandboxStatus> for PodSandboxState {
    fn from(status: SandboxStatus) -> Self {
        if status == SandboxStatus::Running {
            Self::SandboxReady
        } else {
            Self::SandboxNotReady
        }
    }
}

/// Network addresses of the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSandboxNetworkStatus {
    /// Primary IP (empty if unknown).
    pub ip: String,
    /// Any further IPs.
    pub additional_ips: Vec<String>,
}

/// Status snapshot of one sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSandboxStatus {
    pub id: String,
    pub name: String,
    pub metadata: SandboxMetadata,
    pub state: PodSandboxState,
    pub status: SandboxStatus,
    pub created_at: u64,
    pub exited_at: u64,
    pub exit_status: u32,
    pub pid: u32,
    pub network: PodSandboxNetworkStatus,
    pub network_ready: bool,
    pub net_ns_path: String,
    pub namespace_options: NamespaceOptions,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub sandboxer: String,
    pub runtime_handler: String,
    pub task_address: String,
    pub containers: Vec<String>,
}

/// Extracts IP addresses from a network settings blob.
///
/// The blob format belongs to the network plugin, so this is best effort:
/// it understands a top-level `networks` (or `Networks`) object whose
/// entries carry `ip_address`/`IPAddress` and optionally
/// `global_ipv6_address`/`GlobalIPv6Address`. Anything it does not
/// recognize yields no addresses. Networks are visited in name order.
pub fn network_status_from_settings(settings: &str) -> PodSandboxNetworkStatus {
    let mut ips = Vec::new();

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(settings)
        && let Some(networks) = value
            .get("networks")
            .or_else(|| value.get("Networks"))
            .and_then(|n| n.as_object())
    {
        for network in networks.values() {
            for key in [
                "ip_address",
                "IPAddress",
                "global_ipv6_address",
                "GlobalIPv6Address",
            ] {
                if let Some(ip) = network.get(key).and_then(|v| v.as_str())
                    && !ip.is_empty()
                    && !ips.iter().any(|known| known == ip)
                {
                    ips.push(ip.to_string());
                }
            }
        }
    }

    let mut ips = ips.into_iter();
    PodSandboxNetworkStatus {
        ip: ips.next().unwrap_or_default(),
        additional_ips: ips.collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_only_when_running() {
        assert_eq!(
            PodSandboxState::from(SandboxStatus::Running),
            PodSandboxState::SandboxReady
        );
        for status in [
            SandboxStatus::Unknown,
            SandboxStatus::Created,
            SandboxStatus::Stopped,
            SandboxStatus::Removing,
        ] {
            assert_eq!(PodSandboxState::from(status), PodSandboxState::SandboxNotReady);
        }
    }

    #[test]
    fn test_extracts_ips_in_network_order() {
        let blob = r#"{
            "networks": {
                "b-net": {"ip_address": "10.1.0.2"},
                "a-net": {"ip_address": "10.0.0.2", "global_ipv6_address": "fd00::2"}
            }
        }"#;
        let status = network_status_from_settings(blob);
        assert_eq!(status.ip, "10.0.0.2");
        assert_eq!(status.additional_ips, vec!["fd00::2", "10.1.0.2"]);
    }

    #[test]
    fn test_docker_style_keys() {
        let blob = r#"{"Networks": {"bridge": {"IPAddress": "172.17.0.3"}}}"#;
        assert_eq!(network_status_from_settings(blob).ip, "172.17.0.3");
    }

    #[test]
    fn test_unrecognized_blob_yields_nothing() {
        assert_eq!(
            network_status_from_settings("not json"),
            PodSandboxNetworkStatus::default()
        );
        assert_eq!(
            network_status_from_settings(r#"{"interfaces": []}"#),
            PodSandboxNetworkStatus::default()
        );
    }
}
