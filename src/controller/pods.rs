//! Read-only helpers over node-instance pods and their claims

use chrono::{Duration, Utc};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::ResourceExt;

use crate::crd::{
    NodeState, VolumeHealth, CASSANDRA_CONTAINER, NODE_STATE_LABEL, RACK_LABEL,
    SEED_NODE_LABEL, SERVER_DATA_VOLUME, VOLUME_HEALTH_ANNOTATION,
};

/// Grace period before the management API of a fresh container is called
const MGMT_API_STARTUP_SECS: i64 = 10;

pub fn node_state(pod: &Pod) -> Option<NodeState> {
    pod.labels()
        .get(NODE_STATE_LABEL)
        .and_then(|v| NodeState::parse(v))
}

pub fn rack_of(pod: &Pod) -> Option<&str> {
    pod.labels().get(RACK_LABEL).map(String::as_str)
}

pub fn is_seed(pod: &Pod) -> bool {
    pod.labels().get(SEED_NODE_LABEL).map(String::as_str) == Some("true")
}

/// The database container reports ready
pub fn is_server_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.iter().find(|c| c.name == CASSANDRA_CONTAINER))
        .map(|c| c.ready)
        .unwrap_or(false)
}

/// The database container has been running long enough for its
/// management API to answer
pub fn is_mgmt_api_running(pod: &Pod) -> bool {
    let cutoff = Utc::now() - Duration::seconds(MGMT_API_STARTUP_SECS);
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.iter().find(|c| c.name == CASSANDRA_CONTAINER))
        .and_then(|c| c.state.as_ref())
        .and_then(|state| state.running.as_ref())
        .and_then(|running| running.started_at.as_ref())
        .map(|started| started.0 < cutoff)
        .unwrap_or(false)
}

/// Ordinal suffix of a StatefulSet pod name
pub fn ordinal(pod_name: &str) -> Option<i32> {
    pod_name.rsplit_once('-').and_then(|(_, n)| n.parse().ok())
}

pub fn pod_ip(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.pod_ip.as_deref())
}

/// Host the pod is scheduled on
pub fn host_of(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref().and_then(|s| s.node_name.as_deref())
}

/// The scheduler reported the pod as unschedulable
pub fn is_unschedulable(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions.iter().any(|c| {
                c.type_ == "PodScheduled"
                    && c.status == "False"
                    && c.reason.as_deref() == Some("Unschedulable")
            })
        })
        .unwrap_or(false)
}

/// Names of the claims mounted by the pod, defaulting to the StatefulSet
/// claim template naming when the pod spec is not available.
pub fn claim_names(pod: &Pod) -> Vec<String> {
    let names: Vec<String> = pod
        .spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .map(|volumes| {
            volumes
                .iter()
                .filter_map(|v| v.persistent_volume_claim.as_ref())
                .map(|c| c.claim_name.clone())
                .collect()
        })
        .unwrap_or_default();

    if names.is_empty() {
        vec![format!("{}-{}", SERVER_DATA_VOLUME, pod.name_any())]
    } else {
        names
    }
}

pub fn is_volume_inaccessible(pvc: &PersistentVolumeClaim) -> bool {
    pvc.annotations()
        .get(VOLUME_HEALTH_ANNOTATION)
        .and_then(|v| VolumeHealth::parse(v))
        == Some(VolumeHealth::Inaccessible)
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Pod builders shared by the controller tests

    use std::collections::BTreeMap;

    use chrono::{DateTime, Duration, Utc};
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStatus, PersistentVolumeClaimVolumeSource,
        Pod, PodCondition, PodSpec, PodStatus, Volume,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    use crate::crd::{
        NodeState, CASSANDRA_CONTAINER, CLUSTER_LABEL, DATACENTER_LABEL, MANAGED_BY_LABEL,
        MANAGED_BY_VALUE, NODE_STATE_LABEL, RACK_LABEL,
    };

    pub struct PodBuilder {
        pod: Pod,
    }

    impl PodBuilder {
        pub fn new(name: &str, rack: &str) -> Self {
            let labels = BTreeMap::from([
                (CLUSTER_LABEL.to_string(), "cluster1".to_string()),
                (DATACENTER_LABEL.to_string(), "dc1".to_string()),
                (RACK_LABEL.to_string(), rack.to_string()),
                (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
            ]);
            Self {
                pod: Pod {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some("default".to_string()),
                        labels: Some(labels),
                        ..Default::default()
                    },
                    spec: Some(PodSpec {
                        volumes: Some(vec![Volume {
                            name: "server-data".to_string(),
                            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                claim_name: format!("server-data-{name}"),
                                read_only: None,
                            }),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                    status: Some(PodStatus::default()),
                },
            }
        }

        pub fn on_host(mut self, host: &str) -> Self {
            if let Some(spec) = self.pod.spec.as_mut() {
                spec.node_name = Some(host.to_string());
            }
            self
        }

        pub fn ip(mut self, ip: &str) -> Self {
            if let Some(status) = self.pod.status.as_mut() {
                status.pod_ip = Some(ip.to_string());
            }
            self
        }

        pub fn state(self, state: NodeState) -> Self {
            self.label(NODE_STATE_LABEL, state.as_str())
        }

        pub fn label(mut self, key: &str, value: &str) -> Self {
            self.pod
                .metadata
                .labels
                .get_or_insert_with(BTreeMap::new)
                .insert(key.to_string(), value.to_string());
            self
        }

        pub fn annotation(mut self, key: &str, value: &str) -> Self {
            self.pod
                .metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(key.to_string(), value.to_string());
            self
        }

        /// Container running for a minute, readiness as given
        pub fn running(mut self, ready: bool) -> Self {
            let started = Time(Utc::now() - Duration::seconds(60));
            if let Some(status) = self.pod.status.as_mut() {
                status.container_statuses = Some(vec![ContainerStatus {
                    name: CASSANDRA_CONTAINER.to_string(),
                    ready,
                    state: Some(ContainerState {
                        running: Some(ContainerStateRunning {
                            started_at: Some(started),
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]);
            }
            self
        }

        pub fn created(mut self, at: DateTime<Utc>) -> Self {
            self.pod.metadata.creation_timestamp = Some(Time(at));
            self
        }

        pub fn unschedulable(mut self) -> Self {
            if let Some(status) = self.pod.status.as_mut() {
                status.conditions = Some(vec![PodCondition {
                    type_: "PodScheduled".to_string(),
                    status: "False".to_string(),
                    reason: Some("Unschedulable".to_string()),
                    ..Default::default()
                }]);
            }
            self
        }

        pub fn build(self) -> Pod {
            self.pod
        }
    }
}
