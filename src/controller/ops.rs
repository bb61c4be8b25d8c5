//! Cluster operations the decision engine needs
//!
//! Checks never hold a `kube::Client`; they go through [`DatacenterOps`]
//! scoped to one datacenter, which keeps them runnable against in-memory
//! fakes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Event, Node, ObjectReference, PersistentVolumeClaim, Pod};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams},
    client::Client,
    Resource, ResourceExt,
};
use serde_json::json;
use tracing::{debug, warn};

use crate::crd::CassandraDatacenter;
use crate::error::{Error, Result};

const FIELD_MANAGER: &str = "cassandra-operator";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

/// Read and write access to the objects of one datacenter.
///
/// Label and annotation patches take `None` values to remove a key.
#[async_trait]
pub trait DatacenterOps: Send + Sync {
    async fn get_statefulset(&self, name: &str) -> Result<Option<StatefulSet>>;

    async fn create_statefulset(&self, sts: &StatefulSet) -> Result<()>;

    /// Replace a workload; the object's resourceVersion guards the write
    async fn replace_statefulset(&self, sts: &StatefulSet) -> Result<()>;

    async fn patch_statefulset_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Set the replica count of the observed workload
    async fn scale_statefulset(&self, observed: &StatefulSet, replicas: i32) -> Result<()>;

    async fn list_pods(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Pod>>;

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>>;

    async fn patch_pod_labels(&self, name: &str, labels: &BTreeMap<String, Option<String>>)
        -> Result<()>;

    async fn patch_pod_annotations(
        &self,
        name: &str,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<()>;

    async fn delete_pod(&self, name: &str) -> Result<()>;

    async fn get_pvc(&self, name: &str) -> Result<Option<PersistentVolumeClaim>>;

    async fn list_pvcs(&self, selector: &BTreeMap<String, String>)
        -> Result<Vec<PersistentVolumeClaim>>;

    async fn patch_pvc_labels(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()>;

    /// Delete a claim; one that is already gone is not an error
    async fn delete_pvc(&self, name: &str) -> Result<()>;

    async fn apply_pdb(&self, pdb: &PodDisruptionBudget) -> Result<()>;

    /// Write the status of `dc`, failing on a resourceVersion conflict
    async fn replace_status(&self, dc: &CassandraDatacenter) -> Result<CassandraDatacenter>;

    async fn clear_force_upgrade_racks(&self) -> Result<()>;

    async fn clear_replace_nodes(&self) -> Result<()>;

    async fn clear_rolling_restart_request(&self) -> Result<()>;

    async fn list_hosts(&self) -> Result<Vec<Node>>;

    async fn get_host(&self, name: &str) -> Result<Option<Node>>;

    /// Record an event against the datacenter. Failures are only logged.
    async fn record_event(&self, event_type: EventType, reason: &str, message: &str);
}

/// Treat a 404 as absence
fn not_found_as_none<T>(result: kube::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
        Err(e) => Err(Error::KubeError(e)),
    }
}

fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// [`DatacenterOps`] backed by the Kubernetes API
pub struct KubeDatacenterOps {
    client: Client,
    namespace: String,
    dc_name: String,
    dc_ref: ObjectReference,
}

impl KubeDatacenterOps {
    pub fn new(client: Client, dc: &CassandraDatacenter) -> Self {
        Self {
            client,
            namespace: dc.namespace().unwrap_or_else(|| "default".to_string()),
            dc_name: dc.name_any(),
            dc_ref: dc.object_ref(&()),
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn merge_patch<K>(&self, name: &str, patch: serde_json::Value) -> Result<()>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        self.api::<K>()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn emit_event(&self, event_type: EventType, reason: &str, message: &str) -> Result<()> {
        let time = Time(Utc::now());
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-event-", self.dc_name)),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            type_: Some(event_type.as_str().to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            involved_object: self.dc_ref.clone(),
            first_timestamp: Some(time.clone()),
            last_timestamp: Some(time),
            count: Some(1),
            ..Default::default()
        };

        self.api::<Event>()
            .create(&PostParams::default(), &event)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DatacenterOps for KubeDatacenterOps {
    async fn get_statefulset(&self, name: &str) -> Result<Option<StatefulSet>> {
        not_found_as_none(self.api::<StatefulSet>().get(name).await)
    }

    async fn create_statefulset(&self, sts: &StatefulSet) -> Result<()> {
        debug!("Creating StatefulSet {}", sts.name_any());
        self.api::<StatefulSet>()
            .create(&PostParams::default(), sts)
            .await?;
        Ok(())
    }

    async fn replace_statefulset(&self, sts: &StatefulSet) -> Result<()> {
        debug!("Replacing StatefulSet {}", sts.name_any());
        self.api::<StatefulSet>()
            .replace(&sts.name_any(), &PostParams::default(), sts)
            .await?;
        Ok(())
    }

    async fn patch_statefulset_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.merge_patch::<StatefulSet>(name, json!({ "metadata": { "labels": labels } }))
            .await
    }

    async fn scale_statefulset(&self, observed: &StatefulSet, replicas: i32) -> Result<()> {
        debug!("Scaling StatefulSet {} to {}", observed.name_any(), replicas);
        let patch = json!({
            "metadata": { "resourceVersion": observed.resource_version() },
            "spec": { "replicas": replicas }
        });
        self.merge_patch::<StatefulSet>(&observed.name_any(), patch).await
    }

    async fn list_pods(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Pod>> {
        let params = ListParams::default().labels(&selector_string(selector));
        Ok(self.api::<Pod>().list(&params).await?.items)
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>> {
        not_found_as_none(self.api::<Pod>().get(name).await)
    }

    async fn patch_pod_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        self.merge_patch::<Pod>(name, json!({ "metadata": { "labels": labels } }))
            .await
    }

    async fn patch_pod_annotations(
        &self,
        name: &str,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        self.merge_patch::<Pod>(name, json!({ "metadata": { "annotations": annotations } }))
            .await
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        not_found_as_none(self.api::<Pod>().delete(name, &DeleteParams::default()).await)?;
        Ok(())
    }

    async fn get_pvc(&self, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        not_found_as_none(self.api::<PersistentVolumeClaim>().get(name).await)
    }

    async fn list_pvcs(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        let params = ListParams::default().labels(&selector_string(selector));
        Ok(self.api::<PersistentVolumeClaim>().list(&params).await?.items)
    }

    async fn patch_pvc_labels(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()> {
        self.merge_patch::<PersistentVolumeClaim>(name, json!({ "metadata": { "labels": labels } }))
            .await
    }

    async fn delete_pvc(&self, name: &str) -> Result<()> {
        not_found_as_none(
            self.api::<PersistentVolumeClaim>()
                .delete(name, &DeleteParams::default())
                .await,
        )?;
        Ok(())
    }

    async fn apply_pdb(&self, pdb: &PodDisruptionBudget) -> Result<()> {
        self.api::<PodDisruptionBudget>()
            .patch(
                &pdb.name_any(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(pdb),
            )
            .await?;
        Ok(())
    }

    async fn replace_status(&self, dc: &CassandraDatacenter) -> Result<CassandraDatacenter> {
        let api: Api<CassandraDatacenter> = self.api();
        let data = serde_json::to_vec(dc)?;
        Ok(api
            .replace_status(&self.dc_name, &PostParams::default(), data)
            .await?)
    }

    async fn clear_force_upgrade_racks(&self) -> Result<()> {
        self.merge_patch::<CassandraDatacenter>(
            &self.dc_name,
            json!({ "spec": { "forceUpgradeRacks": null } }),
        )
        .await
    }

    async fn clear_replace_nodes(&self) -> Result<()> {
        self.merge_patch::<CassandraDatacenter>(
            &self.dc_name,
            json!({ "spec": { "replaceNodes": null } }),
        )
        .await
    }

    async fn clear_rolling_restart_request(&self) -> Result<()> {
        self.merge_patch::<CassandraDatacenter>(
            &self.dc_name,
            json!({ "spec": { "rollingRestartRequested": false } }),
        )
        .await
    }

    async fn list_hosts(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_host(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        not_found_as_none(api.get(name).await)
    }

    async fn record_event(&self, event_type: EventType, reason: &str, message: &str) {
        if let Err(e) = self.emit_event(event_type, reason, message).await {
            warn!("Failed to record event {} for {}: {:?}", reason, self.dc_name, e);
        }
    }
}
