//! Shared types for the CassandraDatacenter CRD
//!
//! Label, annotation and taint values are free-form strings on the wire.
//! Internally they are parsed into the enums below and turned back into
//! strings only when written to the API server.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ============================================================================
// Wire vocabulary
// ============================================================================

pub const CLUSTER_LABEL: &str = "cassandra.datastax.com/cluster";
pub const DATACENTER_LABEL: &str = "cassandra.datastax.com/datacenter";
pub const RACK_LABEL: &str = "cassandra.datastax.com/rack";
pub const SEED_NODE_LABEL: &str = "cassandra.datastax.com/seed-node";
pub const NODE_STATE_LABEL: &str = "cassandra.datastax.com/node-state";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "cass-operator";

pub const RESOURCE_HASH_ANNOTATION: &str = "cassandra.datastax.com/resource-hash";

/// Taint placed on a host by the infrastructure ahead of a maintenance event
pub const EMM_TAINT_KEY: &str = "node.vmware.com/drain";
/// Annotation placed on a node-instance when the operator refuses an EMM
pub const EMM_FAILURE_ANNOTATION: &str = "appplatform.vmware.com/emm-failure";
pub const VOLUME_HEALTH_ANNOTATION: &str = "volumehealth.storage.kubernetes.io/health";
/// Host a volume claim was bound to by the scheduler
pub const SELECTED_NODE_ANNOTATION: &str = "volume.kubernetes.io/selected-node";

/// Name of the database container inside every node-instance
pub const CASSANDRA_CONTAINER: &str = "cassandra";
/// Claim template name; claims are named `server-data-<pod>`
pub const SERVER_DATA_VOLUME: &str = "server-data";

// ============================================================================
// Spec types
// ============================================================================

/// A named failure domain, mapped to exactly one StatefulSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Rack {
    pub name: String,
    /// Availability zone the rack's pods are pinned to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
}

impl Rack {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            zone: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    #[default]
    Cassandra,
    Dse,
}

impl ServerType {
    pub fn default_image(&self, version: &str) -> String {
        match self {
            ServerType::Cassandra => format!("k8ssandra/cass-management-api:{version}"),
            ServerType::Dse => format!("datastax/dse-mgmtapi-6_8:{version}"),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    #[serde(default = "default_storage_size")]
    pub size: String,
}

fn default_storage_size() -> String {
    "10Gi".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_class_name: None,
            size: default_storage_size(),
        }
    }
}

// ============================================================================
// Status types
// ============================================================================

/// Condition types reported on `status.conditions`
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum DatacenterConditionType {
    Ready,
    Initialized,
    ReplacingNodes,
    ScalingUp,
    ScalingDown,
    Updating,
    Stopped,
    Resuming,
    RollingRestart,
    Valid,
}

impl fmt::Display for DatacenterConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DatacenterCondition {
    #[serde(rename = "type")]
    pub type_: DatacenterConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl DatacenterCondition {
    pub fn new(type_: DatacenterConditionType, status: ConditionStatus) -> Self {
        Self {
            type_,
            status,
            reason: String::new(),
            message: String::new(),
            last_transition_time: None,
        }
    }

    pub fn with_reason(mut self, reason: &str, message: &str) -> Self {
        self.reason = reason.to_string();
        self.message = message.to_string();
        self
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ProgressState {
    Updating,
    Ready,
}

/// Per node-instance information kept in `status.nodeStatuses`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct NodeStatus {
    #[serde(rename = "hostID", default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
}

// ============================================================================
// Label and annotation values
// ============================================================================

/// Lifecycle of a node-instance as tracked by the node-state label
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    ReadyToStart,
    Starting,
    Started,
    Decommissioning,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::ReadyToStart => "Ready-to-Start",
            NodeState::Starting => "Starting",
            NodeState::Started => "Started",
            NodeState::Decommissioning => "Decommissioning",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Ready-to-Start" => Some(NodeState::ReadyToStart),
            "Starting" => Some(NodeState::Starting),
            "Started" => Some(NodeState::Started),
            "Decommissioning" => Some(NodeState::Decommissioning),
            _ => None,
        }
    }
}

/// Value of the EMM taint on a host
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum EmmTaintValue {
    /// Host goes away for good, data must be rebuilt elsewhere
    EvacuateAllData,
    /// Host comes back, volumes survive
    PlannedDowntime,
}

impl EmmTaintValue {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmmTaintValue::EvacuateAllData => "drain",
            EmmTaintValue::PlannedDowntime => "planned-downtime",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "drain" => Some(EmmTaintValue::EvacuateAllData),
            "planned-downtime" => Some(EmmTaintValue::PlannedDowntime),
            _ => None,
        }
    }
}

/// Reason written to the EMM failure annotation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmmFailure {
    GenericFailure,
    NotEnoughResources,
    TooManyExistingFailures,
}

impl EmmFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmmFailure::GenericFailure => "GenericFailure",
            EmmFailure::NotEnoughResources => "NotEnoughResources",
            EmmFailure::TooManyExistingFailures => "TooManyExistingFailures",
        }
    }
}

impl fmt::Display for EmmFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VolumeHealth {
    Inaccessible,
}

impl VolumeHealth {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "inaccessible" => Some(VolumeHealth::Inaccessible),
            _ => None,
        }
    }
}
