//! In-memory fakes of the cluster capabilities, for controller tests

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Node, NodeSpec, PersistentVolumeClaim, Pod, Taint};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::ObjectMeta;
use kube::ResourceExt;

use super::context::{ReconciliationContext, Settings};
use super::mgmt_api::{CassMetadataEndpoints, EndpointState, NodeMgmt};
use super::ops::{DatacenterOps, EventType};
use super::pods::pod_ip;
use super::resources::build_statefulset;
use crate::crd::{
    CassandraDatacenter, CassandraDatacenterSpec, EmmTaintValue, Rack, ServerType, StorageConfig,
    EMM_TAINT_KEY, SERVER_DATA_VOLUME,
};
use crate::error::{Error, Result};

#[derive(Default)]
pub struct FakeCluster {
    pub statefulsets: BTreeMap<String, StatefulSet>,
    pub pods: BTreeMap<String, Pod>,
    pub pvcs: BTreeMap<String, PersistentVolumeClaim>,
    pub hosts: BTreeMap<String, Node>,
    pub pdbs: Vec<PodDisruptionBudget>,
    pub status: Option<CassandraDatacenter>,
    /// Every mutation, in call order
    pub calls: Vec<String>,
    pub events: Vec<(EventType, String)>,
}

#[derive(Default)]
pub struct FakeOps {
    pub cluster: Mutex<FakeCluster>,
}

impl FakeOps {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_statefulset(&self, sts: StatefulSet) {
        self.lock().statefulsets.insert(sts.name_any(), sts);
    }

    pub fn add_pod(&self, pod: Pod) {
        self.lock().pods.insert(pod.name_any(), pod);
    }

    pub fn add_pvc(&self, pvc: PersistentVolumeClaim) {
        self.lock().pvcs.insert(pvc.name_any(), pvc);
    }

    pub fn add_host(&self, host: Node) {
        self.lock().hosts.insert(host.name_any(), host);
    }

    pub fn remove_pod(&self, name: &str) {
        self.lock().pods.remove(name);
    }

    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.lock().pods.get(name).cloned()
    }

    pub fn pvc(&self, name: &str) -> Option<PersistentVolumeClaim> {
        self.lock().pvcs.get(name).cloned()
    }

    pub fn replicas(&self, sts_name: &str) -> Option<i32> {
        self.lock()
            .statefulsets
            .get(sts_name)
            .and_then(|s| s.spec.as_ref())
            .and_then(|s| s.replicas)
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Datacenter as of the last status write
    pub fn stored_datacenter(&self) -> Option<CassandraDatacenter> {
        self.lock().status.clone()
    }

    pub fn event_reasons(&self) -> Vec<String> {
        self.lock().events.iter().map(|(_, r)| r.clone()).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeCluster> {
        self.cluster.lock().unwrap()
    }

    fn record(&self, call: String) {
        self.lock().calls.push(call);
    }
}

fn apply_patch(target: &mut BTreeMap<String, String>, patch: &BTreeMap<String, Option<String>>) {
    for (key, value) in patch {
        match value {
            Some(v) => target.insert(key.clone(), v.clone()),
            None => target.remove(key),
        };
    }
}

fn matches(labels: &BTreeMap<String, String>, selector: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

#[async_trait]
impl DatacenterOps for FakeOps {
    async fn get_statefulset(&self, name: &str) -> Result<Option<StatefulSet>> {
        Ok(self.lock().statefulsets.get(name).cloned())
    }

    async fn create_statefulset(&self, sts: &StatefulSet) -> Result<()> {
        self.record(format!("create_statefulset {}", sts.name_any()));
        self.add_statefulset(sts.clone());
        Ok(())
    }

    async fn replace_statefulset(&self, sts: &StatefulSet) -> Result<()> {
        self.record(format!("replace_statefulset {}", sts.name_any()));
        self.add_statefulset(sts.clone());
        Ok(())
    }

    async fn patch_statefulset_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.record(format!("patch_statefulset_labels {name}"));
        if let Some(sts) = self.lock().statefulsets.get_mut(name) {
            sts.metadata.labels = Some(labels.clone());
        }
        Ok(())
    }

    async fn scale_statefulset(&self, observed: &StatefulSet, replicas: i32) -> Result<()> {
        self.record(format!("scale_statefulset {} {}", observed.name_any(), replicas));
        if let Some(spec) = self
            .lock()
            .statefulsets
            .get_mut(&observed.name_any())
            .and_then(|s| s.spec.as_mut())
        {
            spec.replicas = Some(replicas);
        }
        Ok(())
    }

    async fn list_pods(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Pod>> {
        Ok(self
            .lock()
            .pods
            .values()
            .filter(|p| matches(p.labels(), selector))
            .cloned()
            .collect())
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>> {
        Ok(self.pod(name))
    }

    async fn patch_pod_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        self.record(format!("patch_pod_labels {name}"));
        if let Some(pod) = self.lock().pods.get_mut(name) {
            apply_patch(pod.labels_mut(), labels);
        }
        Ok(())
    }

    async fn patch_pod_annotations(
        &self,
        name: &str,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        self.record(format!("patch_pod_annotations {name}"));
        if let Some(pod) = self.lock().pods.get_mut(name) {
            apply_patch(pod.annotations_mut(), annotations);
        }
        Ok(())
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        self.record(format!("delete_pod {name}"));
        self.remove_pod(name);
        Ok(())
    }

    async fn get_pvc(&self, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.lock().pvcs.get(name).cloned())
    }

    async fn list_pvcs(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        Ok(self
            .lock()
            .pvcs
            .values()
            .filter(|p| matches(p.labels(), selector))
            .cloned()
            .collect())
    }

    async fn patch_pvc_labels(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()> {
        self.record(format!("patch_pvc_labels {name}"));
        if let Some(pvc) = self.lock().pvcs.get_mut(name) {
            pvc.labels_mut().extend(labels.clone());
        }
        Ok(())
    }

    async fn delete_pvc(&self, name: &str) -> Result<()> {
        self.record(format!("delete_pvc {name}"));
        self.lock().pvcs.remove(name);
        Ok(())
    }

    async fn apply_pdb(&self, pdb: &PodDisruptionBudget) -> Result<()> {
        self.record(format!("apply_pdb {}", pdb.name_any()));
        self.lock().pdbs.push(pdb.clone());
        Ok(())
    }

    async fn replace_status(&self, dc: &CassandraDatacenter) -> Result<CassandraDatacenter> {
        self.lock().status = Some(dc.clone());
        Ok(dc.clone())
    }

    async fn clear_force_upgrade_racks(&self) -> Result<()> {
        self.record("clear_force_upgrade_racks".to_string());
        Ok(())
    }

    async fn clear_replace_nodes(&self) -> Result<()> {
        self.record("clear_replace_nodes".to_string());
        Ok(())
    }

    async fn clear_rolling_restart_request(&self) -> Result<()> {
        self.record("clear_rolling_restart_request".to_string());
        Ok(())
    }

    async fn list_hosts(&self) -> Result<Vec<Node>> {
        Ok(self.lock().hosts.values().cloned().collect())
    }

    async fn get_host(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.lock().hosts.get(name).cloned())
    }

    async fn record_event(&self, event_type: EventType, reason: &str, _message: &str) {
        self.lock().events.push((event_type, reason.to_string()));
    }
}

#[derive(Default)]
pub struct FakeMgmtState {
    /// Ring membership returned to every caller
    pub endpoints: CassMetadataEndpoints,
    pub calls: Vec<String>,
    pub fail_decommission: bool,
    pub fail_endpoints: bool,
    pub fail_drain: bool,
}

#[derive(Default)]
pub struct FakeMgmt {
    pub state: Mutex<FakeMgmtState>,
}

impl FakeMgmt {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Report a node at `ip` with the given ring status
    pub fn set_endpoint(&self, ip: &str, host_id: &str, status: &str) {
        let mut state = self.state.lock().unwrap();
        state.endpoints.entity.retain(|ep| ep.rpc_address != ip);
        state.endpoints.entity.push(EndpointState {
            host_id: host_id.to_string(),
            rpc_address: ip.to_string(),
            status: status.to_string(),
            ..Default::default()
        });
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl NodeMgmt for FakeMgmt {
    async fn decommission(&self, pod: &Pod) -> Result<()> {
        self.record(format!("decommission {}", pod.name_any()));
        if self.state.lock().unwrap().fail_decommission {
            return Err(Error::MgmtApiError {
                endpoint: "/api/v0/ops/node/decommission".to_string(),
                status: 500,
            });
        }
        Ok(())
    }

    async fn drain(&self, pod: &Pod) -> Result<()> {
        self.record(format!("drain {}", pod.name_any()));
        if self.state.lock().unwrap().fail_drain {
            return Err(Error::MgmtApiError {
                endpoint: "/api/v0/ops/node/drain".to_string(),
                status: 500,
            });
        }
        Ok(())
    }

    async fn start(&self, pod: &Pod, replace_ip: Option<&str>) -> Result<()> {
        match replace_ip {
            Some(ip) => self.record(format!("start {} replacing {}", pod.name_any(), ip)),
            None => self.record(format!("start {}", pod.name_any())),
        }
        Ok(())
    }

    async fn metadata_endpoints(&self, pod: &Pod) -> Result<CassMetadataEndpoints> {
        if pod_ip(pod).is_none() {
            return Err(Error::NoPodIp(pod.name_any()));
        }
        self.record(format!("endpoints {}", pod.name_any()));
        let state = self.state.lock().unwrap();
        if state.fail_endpoints {
            return Err(Error::MgmtApiError {
                endpoint: "/api/v0/metadata/endpoints".to_string(),
                status: 503,
            });
        }
        Ok(state.endpoints.clone())
    }
}

pub fn datacenter(size: i32, racks: &[&str]) -> CassandraDatacenter {
    CassandraDatacenter {
        metadata: ObjectMeta {
            name: Some("dc1".to_string()),
            namespace: Some("default".to_string()),
            uid: Some("uid-dc1".to_string()),
            ..Default::default()
        },
        spec: CassandraDatacenterSpec {
            cluster_name: "cluster1".to_string(),
            server_type: ServerType::Cassandra,
            server_version: "4.1.5".to_string(),
            server_image: None,
            size,
            racks: racks.iter().map(|r| Rack::new(*r)).collect(),
            stopped: false,
            force_upgrade_racks: vec![],
            replace_nodes: vec![],
            rolling_restart_requested: false,
            storage_config: StorageConfig::default(),
        },
        status: None,
    }
}

/// Workload for a rack as the API server would return it
pub fn statefulset(dc: &CassandraDatacenter, rack: &str, replicas: i32) -> StatefulSet {
    let mut sts = build_statefulset(dc, &Rack::new(rack), replicas).unwrap();
    sts.metadata.resource_version = Some("1".to_string());
    sts
}

pub fn host(name: &str, taint: Option<EmmTaintValue>) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            taints: taint.map(|value| {
                vec![Taint {
                    key: EMM_TAINT_KEY.to_string(),
                    value: Some(value.as_str().to_string()),
                    effect: "NoSchedule".to_string(),
                    time_added: None,
                }]
            }),
            ..Default::default()
        }),
        status: None,
    }
}

pub async fn load_context(
    dc: CassandraDatacenter,
    ops: &Arc<FakeOps>,
    mgmt: &Arc<FakeMgmt>,
    settings: Settings,
) -> ReconciliationContext {
    ReconciliationContext::load(dc, ops.clone(), mgmt.clone(), settings)
        .await
        .unwrap()
}

/// Data volume claim of a pod carrying the given annotations
pub fn claim(pod_name: &str, annotations: &[(&str, &str)]) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(format!("{SERVER_DATA_VOLUME}-{pod_name}")),
            annotations: Some(
                annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        ..Default::default()
    }
}
