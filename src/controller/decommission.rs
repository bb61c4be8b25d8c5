//! Removing one node at a time from an over-sized rack
//!
//! A rack only shrinks through the database's own decommission protocol:
//! the highest-ordinal node streams its data away, and only once the ring
//! reports it as `LEFT` are its claims deleted and the workload scaled down
//! by one.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{info, warn};

use super::conditions::{condition_false, condition_true};
use super::context::ReconciliationContext;
use super::mgmt_api::CassMetadataEndpoints;
use super::ops::EventType;
use super::pods::{is_mgmt_api_running, node_state, ordinal, pod_ip, rack_of};
use super::racks::replicas;
use super::result::{try_check, ReconcileResult};
use crate::crd::{DatacenterConditionType, NodeState, ProgressState, NODE_STATE_LABEL};
use crate::error::{Error, Result};

const DECOMMISSION_STARTED_REQUEUE_SECS: u64 = 10;
const DECOMMISSION_POLL_SECS: u64 = 5;

/// Where a decommissioning node is, according to ring membership
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecommissionProgress {
    /// Still a normal ring member, the request did not take
    NotStarted,
    Leaving,
    Left,
    /// No membership entry for the node's address
    Unknown,
}

pub fn decommission_progress(pod: &Pod, endpoints: &CassMetadataEndpoints) -> DecommissionProgress {
    let Some(endpoint) = pod_ip(pod).and_then(|ip| endpoints.for_address(ip)) else {
        return DecommissionProgress::Unknown;
    };
    if endpoint.status.starts_with("LEFT") {
        DecommissionProgress::Left
    } else if endpoint.status.starts_with("LEAVING") {
        DecommissionProgress::Leaving
    } else {
        DecommissionProgress::NotStarted
    }
}

/// Ask the node to leave the ring.
///
/// The management API is known to answer a successful decommission with an
/// error status, so failures are only logged unless strict mode is on;
/// completion is confirmed through ring membership either way.
async fn call_decommission(ctx: &ReconciliationContext, pod: &Pod) -> Result<()> {
    match ctx.mgmt.decommission(pod).await {
        Ok(()) => Ok(()),
        Err(e) if ctx.settings.strict_decommission => Err(e),
        Err(e) => {
            info!(
                "Decommission call for {} returned an error, will retry if it did not start: {}",
                pod.name_any(),
                e
            );
            Ok(())
        }
    }
}

/// Begin removing the highest-ordinal node of an over-sized rack
pub async fn start_decommission(ctx: &mut ReconciliationContext, rack_index: usize) -> ReconcileResult {
    let rack_name = ctx.desired_racks[rack_index].rack_name.clone();
    let desired = ctx.desired_racks[rack_index].node_count;
    let Some(sts) = ctx.statefulsets[rack_index].clone() else {
        return ReconcileResult::Error(Error::InvariantViolation(format!(
            "no workload for rack {rack_name}"
        )));
    };
    let current = replicas(&sts);

    try_check!(
        ctx.set_condition(condition_true(DatacenterConditionType::ScalingDown))
            .await
    );
    info!(
        "Scaling down rack {} from {} to {} nodes",
        rack_name, current, desired
    );
    ctx.ops
        .record_event(
            EventType::Normal,
            "ScalingDownRack",
            &format!("Scaling down rack {rack_name}"),
        )
        .await;
    try_check!(ctx.set_progress(ProgressState::Updating).await);

    let pod_name = format!("{}-{}", sts.name_any(), current - 1);
    let Some(pod) = ctx.find_pod(&pod_name).cloned() else {
        return ReconcileResult::Error(Error::InvariantViolation(format!(
            "could not find pod {pod_name} to decommission on rack {rack_name}"
        )));
    };

    if !is_mgmt_api_running(&pod) {
        warn!(
            "Management API is not up on {}, waiting before decommissioning it",
            pod_name
        );
        return ReconcileResult::RequeueSoon(DECOMMISSION_STARTED_REQUEUE_SECS);
    }

    try_check!(call_decommission(ctx, &pod).await);

    info!("Marking {} as decommissioning", pod_name);
    try_check!(
        ctx.patch_pod_labels(
            &pod_name,
            BTreeMap::from([(
                NODE_STATE_LABEL.to_string(),
                Some(NodeState::Decommissioning.as_str().to_string()),
            )]),
        )
        .await
    );
    ctx.ops
        .record_event(
            EventType::Normal,
            "LabeledPodAsDecommissioning",
            &format!("Labeled node as decommissioning {pod_name}"),
        )
        .await;

    #[cfg(feature = "metrics")]
    super::metrics::inc_decommission_started(&ctx.namespace(), &ctx.dc.dc_name(), &rack_name);

    ReconcileResult::RequeueSoon(DECOMMISSION_STARTED_REQUEUE_SECS)
}

/// Follow up on nodes labeled `Decommissioning` while a scale-down is
/// in progress
pub async fn check_decommissioning_nodes(ctx: &mut ReconciliationContext) -> ReconcileResult {
    if !ctx.is_condition_true(DatacenterConditionType::ScalingDown) {
        return ReconcileResult::Continue;
    }

    let decommissioning = ctx
        .dc_pods
        .iter()
        .find(|p| node_state(p) == Some(NodeState::Decommissioning))
        .cloned();

    let Some(pod) = decommissioning else {
        try_check!(
            ctx.set_condition(condition_false(DatacenterConditionType::ScalingDown))
                .await
        );
        return ReconcileResult::Continue;
    };

    match decommission_progress(&pod, &ctx.endpoints) {
        DecommissionProgress::NotStarted => {
            info!("Decommission of {} has not started, trying again", pod.name_any());
            try_check!(call_decommission(ctx, &pod).await);
        }
        DecommissionProgress::Leaving => {
            info!("Node {} is decommissioning, checking again soon", pod.name_any());
        }
        DecommissionProgress::Unknown => {
            warn!(
                "No ring membership data for {}, cannot confirm decommission yet",
                pod.name_any()
            );
        }
        DecommissionProgress::Left => {
            info!("Node {} finished decommissioning", pod.name_any());
            try_check!(clean_up_after_decommission(ctx, &pod).await);
        }
    }

    ReconcileResult::RequeueSoon(DECOMMISSION_POLL_SECS)
}

/// Delete the departed node's claims, then shrink its workload by one if it
/// is still the highest ordinal.
async fn clean_up_after_decommission(ctx: &mut ReconciliationContext, pod: &Pod) -> Result<()> {
    let rack_name = rack_of(pod).unwrap_or_default().to_string();
    let sts = ctx
        .desired_racks
        .iter()
        .position(|r| r.rack_name == rack_name)
        .and_then(|idx| ctx.statefulsets[idx].clone())
        .ok_or_else(|| Error::InvariantViolation(format!("no workload for rack {rack_name}")))?;

    ctx.delete_pod_claims(pod).await?;

    let current = replicas(&sts);
    if ordinal(&pod.name_any()) == Some(current - 1) {
        info!("Scaling {} down to {}", sts.name_any(), current - 1);
        ctx.ops.scale_statefulset(&sts, current - 1).await?;
        ctx.ops
            .record_event(
                EventType::Normal,
                "DecommissionedNode",
                &format!("Node {} left the ring, rack {} scaled down", pod.name_any(), rack_name),
            )
            .await;
        #[cfg(feature = "metrics")]
        super::metrics::inc_decommission_completed(&ctx.namespace(), &ctx.dc.dc_name(), &rack_name);
    } else {
        warn!(
            "{} is no longer the highest ordinal of {}, leaving replicas at {}",
            pod.name_any(),
            sts.name_any(),
            current
        );
    }

    let name = pod.name_any();
    ctx.update_status(|status| status.node_statuses.remove(&name).is_some())
        .await?;
    Ok(())
}
