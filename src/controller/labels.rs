//! Label reconciliation for workloads, pods and claims

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use kube::{Resource, ResourceExt};

use super::pods::{is_seed, is_server_ready, node_state};
use crate::crd::NodeState;

/// Every desired label is present with the desired value
pub fn has_labels(current: &BTreeMap<String, String>, desired: &BTreeMap<String, String>) -> bool {
    desired.iter().all(|(k, v)| current.get(k) == Some(v))
}

/// Current labels overlaid with the desired ones; unrelated labels survive
pub fn merge_labels(
    current: &BTreeMap<String, String>,
    desired: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = current.clone();
    merged.extend(desired.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Full label set to write back onto an object that lost some of its
/// identity labels
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelFix {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

/// Fixes for every object not carrying all of `desired`
pub fn identity_label_fixes<'a, K>(
    objects: impl IntoIterator<Item = &'a K>,
    desired: &BTreeMap<String, String>,
) -> Vec<LabelFix>
where
    K: Resource + 'a,
{
    objects
        .into_iter()
        .filter(|obj| !has_labels(obj.labels(), desired))
        .map(|obj| LabelFix {
            name: obj.name_any(),
            labels: merge_labels(obj.labels(), desired),
        })
        .collect()
}

/// A seed label flip for one pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeedLabelChange {
    pub pod_name: String,
    pub seed: bool,
}

/// Seed labels a rack should carry.
///
/// Pods are walked in name order and the first `seed_count` ready pods are
/// seeds. A pod that is still starting keeps its seed label so the first
/// node of an empty cluster is not unlabeled mid-bootstrap.
pub fn seed_label_changes(rack_pods: &[&Pod], seed_count: i32) -> Vec<SeedLabelChange> {
    let mut pods: Vec<&Pod> = rack_pods.to_vec();
    pods.sort_by_key(|p| p.name_any());

    let mut seeds = 0;
    let mut changes = Vec::new();
    for pod in pods {
        let should_be_seed = is_server_ready(pod) && seeds < seed_count;
        if should_be_seed {
            seeds += 1;
        }

        let starting = node_state(pod) == Some(NodeState::Starting);
        if should_be_seed && !is_seed(pod) {
            changes.push(SeedLabelChange {
                pod_name: pod.name_any(),
                seed: true,
            });
        } else if !should_be_seed && is_seed(pod) && !starting {
            changes.push(SeedLabelChange {
                pod_name: pod.name_any(),
                seed: false,
            });
        }
    }
    changes
}
