//! Node bookkeeping and start sequencing
//!
//! Containers come up with the database stopped; the operator starts them
//! one at a time through the management API, preferring racks that have no
//! ready node yet.

use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::conditions::{self, condition_false};
use super::context::ReconciliationContext;
use super::ops::EventType;
use super::pods::{is_mgmt_api_running, is_seed, is_server_ready, node_state, pod_ip, rack_of};
use super::result::{try_check, ReconcileResult};
use crate::crd::{
    DatacenterConditionType, NodeState, NodeStatus, NODE_STATE_LABEL, SEED_NODE_LABEL,
};
use crate::error::Result;

const NODE_START_REQUEUE_SECS: u64 = 2;
const NODE_WAIT_REQUEUE_SECS: u64 = 5;

/// Record host ids, retire finished replacements and hand requested
/// replacements to `start_node_replace`.
pub async fn check_node_statuses(ctx: &mut ReconciliationContext) -> ReconcileResult {
    let host_ids: BTreeMap<String, String> = ctx
        .dc_pods
        .iter()
        .filter_map(|pod| {
            let endpoint = pod_ip(pod).and_then(|ip| ctx.endpoints.for_address(ip))?;
            (!endpoint.host_id.is_empty()).then(|| (pod.name_any(), endpoint.host_id.clone()))
        })
        .collect();
    let finished: Vec<String> = ctx
        .dc
        .node_replacements()
        .iter()
        .filter(|name| {
            ctx.find_pod(name)
                .map(|p| {
                    p.metadata.deletion_timestamp.is_none()
                        && is_server_ready(p)
                        && node_state(p) == Some(NodeState::Started)
                })
                .unwrap_or(false)
        })
        .cloned()
        .collect();

    try_check!(
        ctx.update_status(|status| {
            let mut changed = false;
            for (pod_name, host_id) in host_ids {
                let entry = status.node_statuses.entry(pod_name).or_insert_with(NodeStatus::default);
                if entry.host_id.as_deref() != Some(host_id.as_str()) {
                    entry.host_id = Some(host_id);
                    changed = true;
                }
            }
            if !finished.is_empty() {
                status.node_replacements.retain(|name| !finished.contains(name));
                changed = true;
            }
            if status.node_replacements.is_empty()
                && conditions::is_condition_true(&status.conditions, DatacenterConditionType::ReplacingNodes)
            {
                changed |= conditions::set_condition(
                    &mut status.conditions,
                    condition_false(DatacenterConditionType::ReplacingNodes),
                );
            }
            changed
        })
        .await
    );

    let requested = ctx.dc.spec.replace_nodes.clone();
    if requested.is_empty() {
        return ReconcileResult::Continue;
    }

    for name in &requested {
        if ctx.find_pod(name).is_some() {
            try_check!(ctx.start_node_replace(name).await);
        } else {
            warn!("Ignoring replacement request for unknown pod {}", name);
        }
    }
    try_check!(ctx.ops.clear_replace_nodes().await);
    ReconcileResult::RequeueSoon(NODE_START_REQUEUE_SECS)
}

/// Advance node start-up by one step for the whole datacenter
pub async fn start_next_node(ctx: &mut ReconciliationContext) -> ReconcileResult {
    let starting: Vec<Pod> = ctx
        .dc_pods
        .iter()
        .filter(|p| node_state(p) == Some(NodeState::Starting))
        .cloned()
        .collect();

    if let Some(pod) = starting.iter().find(|p| is_server_ready(p)) {
        info!("Database on {} is up", pod.name_any());
        try_check!(label_node_state(ctx, &pod.name_any(), NodeState::Started).await);
        ctx.ops
            .record_event(
                EventType::Normal,
                "StartedCassandra",
                &format!("Started Cassandra for pod {}", pod.name_any()),
            )
            .await;
        return ReconcileResult::RequeueSoon(NODE_START_REQUEUE_SECS);
    }
    if !starting.is_empty() {
        debug!("Waiting for {} to finish starting", starting[0].name_any());
        return ReconcileResult::RequeueSoon(NODE_START_REQUEUE_SECS);
    }

    let Some(pod) = next_node_to_start(ctx).cloned() else {
        debug!("No node ready to be started yet");
        return ReconcileResult::RequeueSoon(NODE_WAIT_REQUEUE_SECS);
    };

    let has_ready_seed = ctx.dc_pods.iter().any(|p| is_seed(p) && is_server_ready(p));
    if !has_ready_seed && !is_seed(&pod) {
        info!("No seed is up yet, labeling {} as seed", pod.name_any());
        try_check!(
            ctx.patch_pod_labels(
                &pod.name_any(),
                BTreeMap::from([(SEED_NODE_LABEL.to_string(), Some("true".to_string()))]),
            )
            .await
        );
        ctx.ops
            .record_event(
                EventType::Normal,
                "LabeledPodAsSeed",
                &format!("Labeled pod a seed node {}", pod.name_any()),
            )
            .await;
    }

    try_check!(start_node(ctx, &pod).await);
    ReconcileResult::RequeueSoon(NODE_START_REQUEUE_SECS)
}

/// First startable pod, racks without any ready node first
fn next_node_to_start(ctx: &ReconciliationContext) -> Option<&Pod> {
    let startable = |p: &&Pod| {
        matches!(node_state(p), Some(NodeState::ReadyToStart) | None)
            && !is_server_ready(p)
            && is_mgmt_api_running(p)
    };

    let mut candidates: Vec<&Pod> = ctx.dc_pods.iter().filter(startable).collect();
    candidates.sort_by_key(|p| p.name_any());

    let rack_without_ready_node = |p: &&Pod| {
        let rack = rack_of(p);
        !ctx
            .dc_pods
            .iter()
            .any(|other| rack_of(other) == rack && is_server_ready(other))
    };

    candidates
        .iter()
        .copied()
        .find(|p| rack_without_ready_node(p))
        .or_else(|| candidates.first().copied())
}

async fn start_node(ctx: &mut ReconciliationContext, pod: &Pod) -> Result<()> {
    let name = pod.name_any();
    let replace_ip = if ctx.dc.node_replacements().contains(&name) {
        ctx.dc
            .host_id(&name)
            .and_then(|host_id| ctx.endpoints.address_for_host_id(host_id))
            .map(str::to_string)
    } else {
        None
    };

    match &replace_ip {
        Some(ip) => {
            ctx.ops
                .record_event(
                    EventType::Normal,
                    "StartingCassandraAndReplacingNode",
                    &format!("Starting Cassandra for pod {name} to replace node with address {ip}"),
                )
                .await
        }
        None => {
            ctx.ops
                .record_event(
                    EventType::Normal,
                    "StartingCassandra",
                    &format!("Starting Cassandra for pod {name}"),
                )
                .await
        }
    }
    ctx.mgmt.start(pod, replace_ip.as_deref()).await?;

    label_node_state(ctx, &name, NodeState::Starting).await?;
    let now = Utc::now().to_rfc3339();
    ctx.update_status(|status| {
        status.last_server_node_started = Some(now);
        true
    })
    .await?;
    Ok(())
}

async fn label_node_state(ctx: &mut ReconciliationContext, pod_name: &str, state: NodeState) -> Result<()> {
    ctx.patch_pod_labels(
        pod_name,
        BTreeMap::from([(NODE_STATE_LABEL.to_string(), Some(state.as_str().to_string()))]),
    )
    .await
}
