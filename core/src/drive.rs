use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Finalizer that keeps a formatted drive from being removed until the
/// controller has unmounted it.
pub const DATA_PROTECTION_FINALIZER: &str = "direct.csi.min.io/data-protection";

/// Label carrying the (sanitized) owning node name, used for watch filtering.
pub const NODE_LABEL: &str = "direct.csi.min.io/node";

/// Filesystem type produced by the formatter.
pub const FILESYSTEM_XFS: &str = "xfs";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum DriveStatus {
    #[default]
    Available,
    InUse,
    Ready,
    Released,
    Unavailable,
    Terminating,
}

impl fmt::Display for DriveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriveStatus::Available => "Available",
            DriveStatus::InUse => "InUse",
            DriveStatus::Ready => "Ready",
            DriveStatus::Released => "Released",
            DriveStatus::Unavailable => "Unavailable",
            DriveStatus::Terminating => "Terminating",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConditionType {
    Owned,
    Mounted,
    Formatted,
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConditionType::Owned => "Owned",
            ConditionType::Mounted => "Mounted",
            ConditionType::Formatted => "Formatted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: bool,
    pub reason: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RequestedFormat {
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub mount_options: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DriveSpec {
    #[serde(default)]
    pub owned_by_controller: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_format: Option<RequestedFormat>,
}

/// Observed state of a drive. Only the reconciliation engine writes here,
/// except for the externally supplied identity fields (node, device numbers,
/// total capacity).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DriveState {
    pub node_name: String,
    #[serde(default)]
    pub drive_status: DriveStatus,
    #[serde(default)]
    pub filesystem_uuid: String,
    #[serde(default)]
    pub filesystem: String,
    #[serde(default)]
    pub mountpoint: String,
    #[serde(default)]
    pub mount_options: Vec<String>,
    #[serde(default)]
    pub total_capacity: u64,
    #[serde(default)]
    pub free_capacity: u64,
    #[serde(default)]
    pub allocated_capacity: u64,
    #[serde(default)]
    pub major_number: u32,
    #[serde(default)]
    pub minor_number: u32,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriveObject {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: DriveSpec,
    pub status: DriveState,
}

impl DriveObject {
    /// Builds a freshly discovered drive in `Available` status, labelled for
    /// its node.
    pub fn new(name: &str, node_name: &str, major: u32, minor: u32, total_capacity: u64) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(NODE_LABEL.to_string(), sanitize_label_value(node_name));
        Self {
            metadata: ObjectMeta {
                name: name.to_string(),
                labels,
                ..ObjectMeta::default()
            },
            spec: DriveSpec::default(),
            status: DriveState {
                node_name: node_name.to_string(),
                drive_status: DriveStatus::Available,
                total_capacity,
                free_capacity: total_capacity,
                major_number: major,
                minor_number: minor,
                ..DriveState::default()
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn node_name(&self) -> &str {
        &self.status.node_name
    }

    pub fn is_formatted(&self) -> bool {
        !self.status.filesystem.is_empty()
    }

    pub fn is_mounted(&self) -> bool {
        !self.status.mountpoint.is_empty()
    }

    pub fn is_deletion_requested(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn condition(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.status
            .conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }
}

/// Makes a node name usable as a label value: at most 63 characters of
/// `[A-Za-z0-9._-]`, anything else replaced by `-`.
pub fn sanitize_label_value(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .take(63)
        .collect();
    sanitized
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_drive_is_available_and_labelled() {
        let drive = DriveObject::new("d1", "node/1", 8, 16, 1 << 30);
        assert_eq!(drive.status.drive_status, DriveStatus::Available);
        assert_eq!(drive.metadata.labels.get(NODE_LABEL).map(String::as_str), Some("node-1"));
        assert!(!drive.is_formatted());
        assert!(!drive.is_mounted());
        assert!(drive.metadata.finalizers.is_empty());
    }

    #[test]
    fn test_sanitize_label_value() {
        assert_eq!(sanitize_label_value("worker-01.example.com"), "worker-01.example.com");
        assert_eq!(sanitize_label_value("_node:a_"), "node-a");
        assert_eq!(sanitize_label_value(&"x".repeat(80)).len(), 63);
    }

    #[test]
    fn test_drive_json_shape() {
        let mut drive = DriveObject::new("d1", "n1", 8, 0, 100);
        drive.spec.owned_by_controller = true;
        drive.spec.requested_format = Some(RequestedFormat {
            force: false,
            mount_options: vec!["noatime".to_string()],
        });
        let value = serde_json::to_value(&drive).unwrap();
        assert_eq!(value["spec"]["ownedByController"], true);
        assert_eq!(value["spec"]["requestedFormat"]["mountOptions"][0], "noatime");
        assert_eq!(value["status"]["driveStatus"], "Available");

        let back: DriveObject = serde_json::from_value(value).unwrap();
        assert_eq!(back, drive);
    }
}
