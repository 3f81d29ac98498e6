//! Provider domain types.
//!
//! Instance and operation structs deserialize directly from the compute
//! API's JSON representation (as printed by `gcloud --format=json`).

use serde::{Deserialize, Serialize};

/// Identifies the managed instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceRef {
    pub project: String,
    pub zone: String,
    pub name: String,
}

impl InstanceRef {
    pub fn new(project: impl Into<String>, zone: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            zone: zone.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.zone, self.name)
    }
}

/// Creation parameters for the managed instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    pub instance: InstanceRef,
    pub machine_type: String,
    pub image_family: String,
    pub image_project: String,
    pub network: String,
    pub subnet: String,
    pub tags: Vec<String>,
    pub boot_disk_size_gb: u32,
    pub boot_disk_type: String,
}

/// A compute instance as reported by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
}

impl Instance {
    /// External address of the first access config on the first interface.
    ///
    /// Later interfaces and access configs are ignored.
    pub fn external_address(&self) -> Option<&str> {
        self.network_interfaces
            .first()?
            .access_configs
            .first()?
            .nat_ip
            .as_deref()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    #[serde(rename = "networkIP", default)]
    pub network_ip: Option<String>,
    #[serde(rename = "accessConfigs", default)]
    pub access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "natIP", default)]
    pub nat_ip: Option<String>,
}

/// Where an operation lives; determines how it is polled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationScope {
    Zone(String),
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    Running,
    Done,
    #[serde(other)]
    Unknown,
}

/// Handle to a long-running provider operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub name: String,
    pub project: String,
    pub scope: OperationScope,
    pub status: OperationStatus,
    /// Error message if the operation finished unsuccessfully.
    pub error: Option<String>,
}

impl Operation {
    /// An operation that completed synchronously.
    pub fn done(name: impl Into<String>, project: impl Into<String>, scope: OperationScope) -> Self {
        Self {
            name: name.into(),
            project: project.into(),
            scope,
            status: OperationStatus::Done,
            error: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == OperationStatus::Done
    }
}

/// Ingress firewall rule allowing TCP traffic on one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub name: String,
    pub project: String,
    pub network: String,
    pub port: u16,
    pub priority: u32,
    pub source_ranges: Vec<String>,
    pub target_tags: Vec<String>,
}

/// Captured result of a local or remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code, `None` if the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_parses_compute_json() {
        let json = r#"{
            "name": "overflow-vm",
            "status": "RUNNING",
            "networkInterfaces": [{
                "networkIP": "10.128.0.7",
                "accessConfigs": [{"name": "External NAT", "natIP": "34.66.1.2"}]
            }]
        }"#;
        let instance: Instance = serde_json::from_str(json).unwrap();

        assert_eq!(instance.status.as_deref(), Some("RUNNING"));
        assert_eq!(
            instance.network_interfaces[0].network_ip.as_deref(),
            Some("10.128.0.7")
        );
        assert_eq!(instance.external_address(), Some("34.66.1.2"));
    }

    #[test]
    fn external_address_absent_without_interfaces() {
        let instance: Instance = serde_json::from_str(r#"{"name": "vm"}"#).unwrap();
        assert_eq!(instance.external_address(), None);

        let no_nat = Instance {
            name: "vm".into(),
            status: None,
            network_interfaces: vec![NetworkInterface {
                network_ip: Some("10.0.0.2".into()),
                access_configs: vec![],
            }],
        };
        assert_eq!(no_nat.external_address(), None);
    }

    #[test]
    fn external_address_takes_first() {
        let instance = Instance {
            name: "vm".into(),
            status: None,
            network_interfaces: vec![
                NetworkInterface {
                    network_ip: None,
                    access_configs: vec![
                        AccessConfig { name: None, nat_ip: Some("1.1.1.1".into()) },
                        AccessConfig { name: None, nat_ip: Some("2.2.2.2".into()) },
                    ],
                },
                NetworkInterface {
                    network_ip: None,
                    access_configs: vec![AccessConfig { name: None, nat_ip: Some("3.3.3.3".into()) }],
                },
            ],
        };
        assert_eq!(instance.external_address(), Some("1.1.1.1"));
    }

    #[test]
    fn operation_status_tolerates_unknown_values() {
        let s: OperationStatus = serde_json::from_str(r#""DONE""#).unwrap();
        assert_eq!(s, OperationStatus::Done);
        let s: OperationStatus = serde_json::from_str(r#""ABORTING""#).unwrap();
        assert_eq!(s, OperationStatus::Unknown);
    }
}
