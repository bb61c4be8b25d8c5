//! Per-pass view of one datacenter
//!
//! [`ReconciliationContext`] is loaded once at the start of a pass and
//! handed to every check. Mutations go through the injected
//! [`DatacenterOps`]; local copies are updated as they happen so later
//! checks in the same pass see them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Pod};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::conditions::{self, condition_true};
use super::emm::EmmSpi;
use super::mgmt_api::{CassMetadataEndpoints, NodeMgmt};
use super::ops::{DatacenterOps, EventType};
use super::pods::{claim_names, host_of, is_server_ready, pod_ip};
use super::topology::{calculate_rack_information, RackInformation};
use crate::crd::{
    CassandraDatacenter, CassandraDatacenterStatus, DatacenterCondition, DatacenterConditionType,
    ProgressState, SELECTED_NODE_ANNOTATION,
};
use crate::error::{Error, Result};

/// Behaviour switches from the operator configuration
#[derive(Clone, Copy, Debug, Default)]
pub struct Settings {
    pub enable_emm: bool,
    /// Surface non-success decommission responses instead of tolerating them
    pub strict_decommission: bool,
}

pub struct ReconciliationContext {
    pub dc: CassandraDatacenter,
    pub ops: Arc<dyn DatacenterOps>,
    pub mgmt: Arc<dyn NodeMgmt>,
    pub settings: Settings,
    pub desired_racks: Vec<RackInformation>,
    /// Observed workload per entry of `desired_racks`
    pub statefulsets: Vec<Option<StatefulSet>>,
    pub dc_pods: Vec<Pod>,
    pub endpoints: CassMetadataEndpoints,
}

impl ReconciliationContext {
    pub async fn load(
        dc: CassandraDatacenter,
        ops: Arc<dyn DatacenterOps>,
        mgmt: Arc<dyn NodeMgmt>,
        settings: Settings,
    ) -> Result<Self> {
        let desired_racks = calculate_rack_information(&dc);

        let mut statefulsets = Vec::with_capacity(desired_racks.len());
        for rack in &desired_racks {
            statefulsets.push(ops.get_statefulset(&dc.statefulset_name(&rack.rack_name)).await?);
        }

        let dc_pods = ops.list_pods(&dc.datacenter_labels()).await?;
        let endpoints = fetch_endpoints(mgmt.as_ref(), &dc_pods).await;

        Ok(Self {
            dc,
            ops,
            mgmt,
            settings,
            desired_racks,
            statefulsets,
            dc_pods,
            endpoints,
        })
    }

    pub fn namespace(&self) -> String {
        self.dc.namespace().unwrap_or_else(|| "default".to_string())
    }

    pub fn find_pod(&self, name: &str) -> Option<&Pod> {
        self.dc_pods.iter().find(|p| p.name_any() == name)
    }

    pub fn rack_pods(&self, rack_name: &str) -> Vec<&Pod> {
        self.dc_pods
            .iter()
            .filter(|p| super::pods::rack_of(p) == Some(rack_name))
            .collect()
    }

    /// Apply `change` to a copy of the status and write it back if it
    /// reports a modification. The write carries the observed
    /// resourceVersion, so a concurrent writer makes it fail.
    pub async fn update_status<F>(&mut self, change: F) -> Result<bool>
    where
        F: FnOnce(&mut CassandraDatacenterStatus) -> bool,
    {
        let mut candidate = self.dc.clone();
        let changed = change(candidate.status.get_or_insert_with(Default::default));
        if changed {
            self.dc = self.ops.replace_status(&candidate).await?;
        }
        Ok(changed)
    }

    pub async fn set_condition(&mut self, condition: DatacenterCondition) -> Result<bool> {
        if !conditions::would_change(self.dc.conditions(), &condition) {
            return Ok(false);
        }
        self.update_status(|status| conditions::set_condition(&mut status.conditions, condition))
            .await
    }

    pub fn is_condition_true(&self, type_: DatacenterConditionType) -> bool {
        self.dc.is_condition_true(type_)
    }

    pub async fn set_progress(&mut self, progress: ProgressState) -> Result<()> {
        self.update_status(|status| {
            if status.cassandra_operator_progress == Some(progress) {
                false
            } else {
                status.cassandra_operator_progress = Some(progress);
                true
            }
        })
        .await?;
        Ok(())
    }

    /// Patch pod labels and mirror the change in the local pod list
    pub async fn patch_pod_labels(
        &mut self,
        pod_name: &str,
        labels: BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        self.ops.patch_pod_labels(pod_name, &labels).await?;
        if let Some(pod) = self.dc_pods.iter_mut().find(|p| p.name_any() == pod_name) {
            apply_map_patch(pod.labels_mut(), labels);
        }
        Ok(())
    }

    pub async fn patch_pod_annotations(
        &mut self,
        pod_name: &str,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        self.ops.patch_pod_annotations(pod_name, &annotations).await?;
        if let Some(pod) = self.dc_pods.iter_mut().find(|p| p.name_any() == pod_name) {
            apply_map_patch(pod.annotations_mut(), annotations);
        }
        Ok(())
    }

    /// Claims of the pod's volumes that still exist
    pub async fn claims_of(&self, pod: &Pod) -> Result<Vec<PersistentVolumeClaim>> {
        let mut claims = Vec::new();
        for name in claim_names(pod) {
            if let Some(claim) = self.ops.get_pvc(&name).await? {
                claims.push(claim);
            }
        }
        Ok(claims)
    }

    pub async fn delete_pod_claims(&self, pod: &Pod) -> Result<()> {
        for claim in claim_names(pod) {
            debug!("Deleting claim {} of {}", claim, pod.name_any());
            self.ops.delete_pvc(&claim).await?;
        }
        Ok(())
    }

    /// Throw away a node-instance's volume and let its workload recreate
    /// it; node start passes the old address as the replace address.
    pub async fn start_node_replace(&mut self, pod_name: &str) -> Result<()> {
        let pod = self
            .find_pod(pod_name)
            .cloned()
            .ok_or_else(|| Error::InvariantViolation(format!("no pod {pod_name} to replace")))?;

        info!("Starting replacement of node {}", pod_name);
        let name = pod_name.to_string();
        self.update_status(|status| {
            if status.node_replacements.contains(&name) {
                false
            } else {
                status.node_replacements.push(name.clone());
                true
            }
        })
        .await?;
        self.set_condition(condition_true(DatacenterConditionType::ReplacingNodes))
            .await?;

        self.delete_pod_claims(&pod).await?;
        self.ops.delete_pod(pod_name).await?;

        self.ops
            .record_event(
                EventType::Normal,
                "ReplacingNode",
                &format!("Replacing node {pod_name}"),
            )
            .await;
        #[cfg(feature = "metrics")]
        super::metrics::inc_node_replacement(&self.namespace(), &self.dc.dc_name());
        Ok(())
    }

    /// Hosts that run a datacenter pod or hold one of its volumes
    async fn dc_host_names(&self) -> Result<BTreeSet<String>> {
        let mut names: BTreeSet<String> = self
            .dc_pods
            .iter()
            .filter_map(|p| host_of(p).map(str::to_string))
            .collect();
        for pod in &self.dc_pods {
            for claim in self.claims_of(pod).await? {
                if let Some(host) = claim.annotations().get(SELECTED_NODE_ANNOTATION) {
                    names.insert(host.clone());
                }
            }
        }
        Ok(names)
    }
}

fn apply_map_patch(target: &mut BTreeMap<String, String>, patch: BTreeMap<String, Option<String>>) {
    for (key, value) in patch {
        match value {
            Some(v) => {
                target.insert(key, v);
            }
            None => {
                target.remove(&key);
            }
        }
    }
}

/// Ring membership as seen by the first ready pod that answers
async fn fetch_endpoints(mgmt: &dyn NodeMgmt, pods: &[Pod]) -> CassMetadataEndpoints {
    let mut failures = 0;
    for pod in pods.iter().filter(|p| is_server_ready(p) && pod_ip(p).is_some()) {
        match mgmt.metadata_endpoints(pod).await {
            Ok(endpoints) => return endpoints,
            Err(e) => {
                debug!("Could not read endpoints from {}: {}", pod.name_any(), e);
                failures += 1;
            }
        }
    }
    if failures > 0 {
        warn!(
            "None of {} ready pods returned ring membership, continuing without it",
            failures
        );
    }
    CassMetadataEndpoints::default()
}

#[async_trait]
impl EmmSpi for ReconciliationContext {
    fn dc_pods(&self) -> &[Pod] {
        &self.dc_pods
    }

    fn is_bootstrapped(&self, pod: &Pod) -> bool {
        self.dc.host_id(&pod.name_any()).is_some()
    }

    fn in_progress_replacements(&self) -> &[String] {
        self.dc.node_replacements()
    }

    fn is_stopped(&self) -> bool {
        self.dc.spec.stopped
    }

    fn is_initialized(&self) -> bool {
        self.dc.is_condition_true(DatacenterConditionType::Initialized)
    }

    async fn all_hosts(&self) -> Result<Vec<Node>> {
        self.ops.list_hosts().await
    }

    async fn dc_hosts(&self) -> Result<Vec<Node>> {
        let names = self.dc_host_names().await?;
        let mut hosts = Vec::with_capacity(names.len());
        for name in &names {
            match self.ops.get_host(name).await? {
                Some(host) => hosts.push(host),
                None => warn!("Host {} referenced by datacenter {} no longer exists", name, self.dc.dc_name()),
            }
        }
        Ok(hosts)
    }

    async fn pod_claims(&self, pod: &Pod) -> Result<Vec<PersistentVolumeClaim>> {
        self.claims_of(pod).await
    }

    async fn set_pod_annotation(
        &mut self,
        pod: &Pod,
        key: &str,
        value: Option<&str>,
    ) -> Result<()> {
        self.patch_pod_annotations(
            &pod.name_any(),
            BTreeMap::from([(key.to_string(), value.map(str::to_string))]),
        )
        .await?;
        if let Some(reason) = value {
            self.ops
                .record_event(
                    EventType::Warning,
                    "EMMFailed",
                    &format!("Refused maintenance for pod {}: {}", pod.name_any(), reason),
                )
                .await;
        }
        #[cfg(feature = "metrics")]
        super::metrics::inc_emm_action(
            &self.namespace(),
            &self.dc.dc_name(),
            if value.is_some() { "fail" } else { "clear" },
        );
        Ok(())
    }

    async fn remove_pod(&mut self, pod: &Pod) -> Result<()> {
        if is_server_ready(pod) {
            if let Err(e) = self.mgmt.drain(pod).await {
                warn!("Drain of {} before removal failed: {}", pod.name_any(), e);
            }
        }
        self.ops.delete_pod(&pod.name_any()).await?;
        self.dc_pods.retain(|p| p.name_any() != pod.name_any());

        self.ops
            .record_event(
                EventType::Normal,
                "RemovedPodForMaintenance",
                &format!("Removed pod {} from host {:?}", pod.name_any(), host_of(pod)),
            )
            .await;
        #[cfg(feature = "metrics")]
        super::metrics::inc_emm_action(&self.namespace(), &self.dc.dc_name(), "remove_pod");
        Ok(())
    }

    async fn start_node_replace(&mut self, pod_name: &str) -> Result<()> {
        ReconciliationContext::start_node_replace(self, pod_name).await
    }
}
