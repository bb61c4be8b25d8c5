//! CassandraDatacenter Custom Resource Definition
//!
//! A CassandraDatacenter is one logical datacenter of a Cassandra or DSE
//! cluster, spread across one or more racks. Each rack is backed by a
//! StatefulSet owned by the datacenter.

use std::collections::{BTreeMap, HashSet};

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    ConditionStatus, DatacenterCondition, DatacenterConditionType, NodeStatus, ProgressState,
    Rack, ServerType, StorageConfig, CLUSTER_LABEL, DATACENTER_LABEL, MANAGED_BY_LABEL,
    MANAGED_BY_VALUE, RACK_LABEL,
};

/// Name of the rack synthesized when `spec.racks` is empty
pub const DEFAULT_RACK_NAME: &str = "default";

/// Structured validation error for `CassandraDatacenterSpec`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
}

impl SpecValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "cassandra.datastax.com",
    version = "v1beta1",
    kind = "CassandraDatacenter",
    namespaced,
    status = "CassandraDatacenterStatus",
    shortname = "cassdc",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"Size","type":"integer","jsonPath":".spec.size"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Progress","type":"string","jsonPath":".status.cassandraOperatorProgress"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CassandraDatacenterSpec {
    pub cluster_name: String,

    #[serde(default)]
    pub server_type: ServerType,

    pub server_version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_image: Option<String>,

    /// Total number of database nodes across all racks
    pub size: i32,

    #[serde(default)]
    pub racks: Vec<Rack>,

    /// Park the datacenter: every rack is scaled to zero, volumes are kept
    #[serde(default)]
    pub stopped: bool,

    /// Racks whose StatefulSet is updated even if pods are not ready
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub force_upgrade_racks: Vec<String>,

    /// Pods to replace with a fresh volume
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replace_nodes: Vec<String>,

    /// Restart every node created before the request, one at a time.
    /// Cleared by the operator once recorded in the status.
    #[serde(default)]
    pub rolling_restart_requested: bool,

    #[serde(default)]
    pub storage_config: StorageConfig,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CassandraDatacenterStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<DatacenterCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cassandra_operator_progress: Option<ProgressState>,

    /// Host id of every pod that has joined the ring, keyed by pod name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_statuses: BTreeMap<String, NodeStatus>,

    /// Pods currently being replaced
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_replacements: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_server_node_started: Option<String>,

    /// Pods created before this instant still need their restart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rolling_restart: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl CassandraDatacenterSpec {
    /// Reject a datacenter before any child object is touched
    pub fn validate(&self) -> Result<(), SpecValidationError> {
        if self.cluster_name.trim().is_empty() {
            return Err(SpecValidationError::new(
                "spec.clusterName",
                "clusterName must not be empty",
            ));
        }
        if self.size < 0 {
            return Err(SpecValidationError::new(
                "spec.size",
                format!("size must not be negative, got {}", self.size),
            ));
        }
        if self.server_version.trim().is_empty() {
            return Err(SpecValidationError::new(
                "spec.serverVersion",
                "serverVersion must not be empty",
            ));
        }

        let mut seen = HashSet::new();
        for rack in &self.racks {
            if rack.name.trim().is_empty() {
                return Err(SpecValidationError::new(
                    "spec.racks",
                    "rack names must not be empty",
                ));
            }
            if !seen.insert(rack.name.as_str()) {
                return Err(SpecValidationError::new(
                    "spec.racks",
                    format!("rack {} is listed more than once", rack.name),
                ));
            }
        }

        let rack_count = self.racks.len().max(1);
        if (self.size as usize) < rack_count {
            return Err(SpecValidationError::new(
                "spec.size",
                format!(
                    "size {} cannot be smaller than the number of racks ({})",
                    self.size, rack_count
                ),
            ));
        }
        Ok(())
    }
}

impl CassandraDatacenter {
    /// The datacenter name is the resource name
    pub fn dc_name(&self) -> String {
        self.name_any()
    }

    /// Configured racks, or a single `default` rack when none are listed
    pub fn racks(&self) -> Vec<Rack> {
        if self.spec.racks.is_empty() {
            vec![Rack::new(DEFAULT_RACK_NAME)]
        } else {
            self.spec.racks.clone()
        }
    }

    pub fn server_image(&self) -> String {
        self.spec
            .server_image
            .clone()
            .unwrap_or_else(|| self.spec.server_type.default_image(&self.spec.server_version))
    }

    pub fn cluster_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (CLUSTER_LABEL.to_string(), self.spec.cluster_name.clone()),
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        ])
    }

    pub fn datacenter_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.cluster_labels();
        labels.insert(DATACENTER_LABEL.to_string(), self.dc_name());
        labels
    }

    pub fn rack_labels(&self, rack_name: &str) -> BTreeMap<String, String> {
        let mut labels = self.datacenter_labels();
        labels.insert(RACK_LABEL.to_string(), rack_name.to_string());
        labels
    }

    pub fn statefulset_name(&self, rack_name: &str) -> String {
        format!(
            "{}-{}-{}-sts",
            self.spec.cluster_name,
            self.dc_name(),
            rack_name
        )
        .to_lowercase()
    }

    pub fn pod_name(&self, rack_name: &str, ordinal: i32) -> String {
        format!("{}-{}", self.statefulset_name(rack_name), ordinal)
    }

    pub fn pdb_name(&self) -> String {
        format!("{}-pdb", self.dc_name())
    }

    pub fn conditions(&self) -> &[DatacenterCondition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    pub fn condition_status(&self, type_: DatacenterConditionType) -> ConditionStatus {
        self.conditions()
            .iter()
            .find(|c| c.type_ == type_)
            .map(|c| c.status)
            .unwrap_or_default()
    }

    pub fn is_condition_true(&self, type_: DatacenterConditionType) -> bool {
        self.condition_status(type_) == ConditionStatus::True
    }

    pub fn node_replacements(&self) -> &[String] {
        self.status
            .as_ref()
            .map(|s| s.node_replacements.as_slice())
            .unwrap_or_default()
    }

    /// Host id recorded for a pod, if it ever joined the ring
    pub fn host_id(&self, pod_name: &str) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.node_statuses.get(pod_name))
            .and_then(|n| n.host_id.as_deref())
            .filter(|id| !id.is_empty())
    }
}
