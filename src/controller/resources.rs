//! Builders for the objects a datacenter owns
//!
//! Only the minimum needed to run one StatefulSet per rack is rendered here;
//! everything is labeled so the reconciler can find it again and carries an
//! owner reference for garbage collection.

use std::collections::BTreeMap;

use base64::Engine;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, HTTPGetAction, NodeAffinity, NodeSelector,
    NodeSelectorRequirement, NodeSelectorTerm, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PodSpec, PodTemplateSpec, Probe, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};

use crate::crd::{
    CassandraDatacenter, NodeState, Rack, CASSANDRA_CONTAINER, NODE_STATE_LABEL,
    RESOURCE_HASH_ANNOTATION, SERVER_DATA_VOLUME,
};
use crate::error::Result;

const ZONE_LABEL: &str = "topology.kubernetes.io/zone";

/// Create an OwnerReference for garbage collection
pub fn owner_reference(dc: &CassandraDatacenter) -> OwnerReference {
    OwnerReference {
        api_version: CassandraDatacenter::api_version(&()).to_string(),
        kind: CassandraDatacenter::kind(&()).to_string(),
        name: dc.name_any(),
        uid: dc.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

pub fn all_pods_service_name(dc: &CassandraDatacenter) -> String {
    format!("{}-{}-all-pods-service", dc.spec.cluster_name, dc.dc_name()).to_lowercase()
}

// ============================================================================
// StatefulSet
// ============================================================================

/// Desired StatefulSet for a rack, annotated with its content hash
pub fn build_statefulset(
    dc: &CassandraDatacenter,
    rack: &Rack,
    replicas: i32,
) -> Result<StatefulSet> {
    let labels = dc.rack_labels(&rack.name);

    let mut pod_labels = labels.clone();
    pod_labels.insert(
        NODE_STATE_LABEL.to_string(),
        NodeState::ReadyToStart.as_str().to_string(),
    );

    let affinity = rack.zone.as_ref().map(|zone| Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: ZONE_LABEL.to_string(),
                        operator: "In".to_string(),
                        values: Some(vec![zone.clone()]),
                    }]),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    });

    let mut sts = StatefulSet {
        metadata: ObjectMeta {
            name: Some(dc.statefulset_name(&rack.name)),
            namespace: dc.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(dc)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: None,
            service_name: all_pods_service_name(dc),
            pod_management_policy: Some("Parallel".to_string()),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    affinity,
                    containers: vec![build_cassandra_container(dc)],
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![build_claim_template(dc, labels)]),
            ..Default::default()
        }),
        status: None,
    };

    let hash = resource_hash(&sts)?;
    sts.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(RESOURCE_HASH_ANNOTATION.to_string(), hash);
    if let Some(spec) = sts.spec.as_mut() {
        spec.replicas = Some(replicas);
    }
    Ok(sts)
}

fn build_cassandra_container(dc: &CassandraDatacenter) -> Container {
    let port = |name: &str, port: i32| ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        ..Default::default()
    };

    Container {
        name: CASSANDRA_CONTAINER.to_string(),
        image: Some(dc.server_image()),
        ports: Some(vec![
            port("native", 9042),
            port("internode", 7000),
            port("mgmt-api-http", 8080),
        ]),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/api/v0/probes/readiness".to_string()),
                port: IntOrString::Int(8080),
                ..Default::default()
            }),
            initial_delay_seconds: Some(20),
            period_seconds: Some(10),
            ..Default::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: SERVER_DATA_VOLUME.to_string(),
            mount_path: "/var/lib/cassandra".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn build_claim_template(
    dc: &CassandraDatacenter,
    labels: BTreeMap<String, String>,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(SERVER_DATA_VOLUME.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: dc.spec.storage_config.storage_class_name.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(dc.spec.storage_config.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

/// Content hash of a StatefulSet, ignoring replicas and any previous hash.
pub fn resource_hash(sts: &StatefulSet) -> Result<String> {
    let mut subject = sts.clone();
    if let Some(annotations) = subject.metadata.annotations.as_mut() {
        annotations.remove(RESOURCE_HASH_ANNOTATION);
    }
    if let Some(spec) = subject.spec.as_mut() {
        spec.replicas = None;
    }
    subject.status = None;

    let bytes = serde_json::to_vec(&(&subject.metadata.labels, &subject.spec))?;
    let digest = Sha256::digest(&bytes);
    Ok(base64::engine::general_purpose::STANDARD.encode(digest))
}

pub fn current_hash(sts: &StatefulSet) -> Option<&str> {
    sts.annotations()
        .get(RESOURCE_HASH_ANNOTATION)
        .map(String::as_str)
}

// ============================================================================
// PodDisruptionBudget
// ============================================================================

/// One budget per datacenter allowing a single voluntary disruption
pub fn build_pdb(dc: &CassandraDatacenter) -> PodDisruptionBudget {
    let labels = dc.datacenter_labels();
    PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(dc.pdb_name()),
            namespace: dc.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(dc)]),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            selector: Some(LabelSelector {
                match_labels: Some(labels),
                ..Default::default()
            }),
            min_available: Some(IntOrString::Int((dc.spec.size - 1).max(0))),
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CassandraDatacenterSpec, ServerType, StorageConfig, RACK_LABEL};

    fn dc() -> CassandraDatacenter {
        CassandraDatacenter {
            metadata: ObjectMeta {
                name: Some("dc1".to_string()),
                namespace: Some("db".to_string()),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            spec: CassandraDatacenterSpec {
                cluster_name: "Cluster1".to_string(),
                server_type: ServerType::Cassandra,
                server_version: "4.1.5".to_string(),
                server_image: None,
                size: 6,
                racks: vec![Rack::new("r1"), Rack::new("r2")],
                stopped: false,
                force_upgrade_racks: vec![],
                replace_nodes: vec![],
                rolling_restart_requested: false,
                storage_config: StorageConfig::default(),
            },
            status: None,
        }
    }

    #[test]
    fn test_statefulset_shape() {
        let rack = Rack {
            name: "r2".to_string(),
            zone: Some("us-east-1b".to_string()),
        };
        let sts = build_statefulset(&dc(), &rack, 3).unwrap();

        assert_eq!(sts.name_any(), "cluster1-dc1-r2-sts");
        assert_eq!(sts.namespace().as_deref(), Some("db"));
        let spec = sts.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(
            spec.selector.match_labels.as_ref().unwrap().get(RACK_LABEL).map(String::as_str),
            Some("r2")
        );
        let template_labels = spec.template.metadata.as_ref().unwrap().labels.as_ref().unwrap();
        assert_eq!(
            template_labels.get(NODE_STATE_LABEL).map(String::as_str),
            Some("Ready-to-Start")
        );
        assert!(spec.template.spec.as_ref().unwrap().affinity.is_some());
        assert_eq!(sts.owner_references()[0].uid, "uid-1");
        assert!(current_hash(&sts).is_some());
    }

    #[test]
    fn test_hash_ignores_replicas() {
        let rack = Rack::new("r1");
        let three = build_statefulset(&dc(), &rack, 3).unwrap();
        let five = build_statefulset(&dc(), &rack, 5).unwrap();
        assert_eq!(current_hash(&three), current_hash(&five));
        assert_eq!(resource_hash(&three).unwrap(), current_hash(&three).unwrap());
    }

    #[test]
    fn test_hash_changes_with_image() {
        let rack = Rack::new("r1");
        let before = build_statefulset(&dc(), &rack, 3).unwrap();
        let mut upgraded = dc();
        upgraded.spec.server_version = "4.1.6".to_string();
        let after = build_statefulset(&upgraded, &rack, 3).unwrap();
        assert_ne!(current_hash(&before), current_hash(&after));
    }

    #[test]
    fn test_pdb_allows_one_disruption() {
        let pdb = build_pdb(&dc());
        assert_eq!(pdb.name_any(), "dc1-pdb");
        assert_eq!(
            pdb.spec.unwrap().min_available,
            Some(IntOrString::Int(5))
        );
    }
}
