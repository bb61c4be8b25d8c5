//! Per-rack workload reconciliation
//!
//! Each rack runs through an ordered list of guards over a [`RackView`].
//! Guards are pure; each yields an optional [`RackAction`]. Blocking
//! actions end the pass, non-blocking ones (label fixes) are applied and
//! evaluation moves on. Only the first rack with a blocking finding is
//! touched in a pass.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::conditions::{condition_false, condition_true};
use super::context::ReconciliationContext;
use super::decommission::start_decommission;
use super::labels::{
    has_labels, identity_label_fixes, merge_labels, seed_label_changes, LabelFix, SeedLabelChange,
};
use super::nodes::start_next_node;
use super::ops::EventType;
use super::pods::{is_mgmt_api_running, is_server_ready, node_state};
use super::resources::{build_statefulset, current_hash};
use super::result::{try_check, ReconcileResult};
use super::topology::RackInformation;
use crate::crd::{
    CassandraDatacenter, DatacenterConditionType, NodeState, ProgressState, SEED_NODE_LABEL,
};
use crate::error::Result;

const RACK_REQUEUE_SECS: u64 = 2;
const TOO_MANY_READY_REQUEUE_SECS: u64 = 10;

/// Replica count a workload asks for
pub fn replicas(sts: &StatefulSet) -> i32 {
    sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0)
}

/// What the guards see of one rack
pub struct RackView<'a> {
    pub dc: &'a CassandraDatacenter,
    pub info: &'a RackInformation,
    pub observed: Option<&'a StatefulSet>,
    pub desired: &'a StatefulSet,
    pub pods: Vec<&'a Pod>,
    /// Pods of the workload fetched by name, whatever their labels say
    pub members: &'a [Pod],
    pub member_claims: &'a [PersistentVolumeClaim],
}

impl RackView<'_> {
    fn ready_count(&self) -> i32 {
        self.pods.iter().filter(|p| is_server_ready(p)).count() as i32
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RackAction {
    Create,
    PatchLabels(BTreeMap<String, String>),
    RestoreIdentityLabels {
        pods: Vec<LabelFix>,
        claims: Vec<LabelFix>,
    },
    ScaleUp { to: i32 },
    Park,
    Decommission,
    StartNodes,
    TooManyReady { ready: i32 },
    UpdateTemplate,
    ReconcileSeeds(Vec<SeedLabelChange>),
}

impl RackAction {
    /// Whether the pass ends after this action
    pub fn is_blocking(&self) -> bool {
        !matches!(
            self,
            RackAction::PatchLabels(_)
                | RackAction::RestoreIdentityLabels { .. }
                | RackAction::ReconcileSeeds(_)
        )
    }
}

type RackGuard = fn(&RackView<'_>) -> Option<RackAction>;

const RACK_GUARDS: &[RackGuard] = &[
    ensure_workload,
    ensure_workload_labels,
    identity_labels,
    scale_up,
    park,
    scale_down,
    await_ready,
    too_many_ready,
    template_drift,
    seed_labels,
];

fn ensure_workload(view: &RackView<'_>) -> Option<RackAction> {
    view.observed.is_none().then_some(RackAction::Create)
}

fn ensure_workload_labels(view: &RackView<'_>) -> Option<RackAction> {
    let observed = view.observed?;
    let desired = view.dc.rack_labels(&view.info.rack_name);
    if has_labels(observed.labels(), &desired) {
        None
    } else {
        Some(RackAction::PatchLabels(merge_labels(observed.labels(), &desired)))
    }
}

/// Pods and claims of the workload carry the rack's identity labels.
/// A pod that lost them drops out of the rack's pod list, so this runs
/// before anything counts ready nodes.
fn identity_labels(view: &RackView<'_>) -> Option<RackAction> {
    view.observed?;
    let desired = view.dc.rack_labels(&view.info.rack_name);
    let pods = identity_label_fixes(view.members, &desired);
    let claims = identity_label_fixes(view.member_claims, &desired);
    (!pods.is_empty() || !claims.is_empty())
        .then_some(RackAction::RestoreIdentityLabels { pods, claims })
}

fn scale_up(view: &RackView<'_>) -> Option<RackAction> {
    let observed = view.observed?;
    (replicas(observed) < view.info.node_count).then_some(RackAction::ScaleUp {
        to: view.info.node_count,
    })
}

fn park(view: &RackView<'_>) -> Option<RackAction> {
    let observed = view.observed?;
    (view.dc.spec.stopped && replicas(observed) > 0).then_some(RackAction::Park)
}

/// Never shrink a workload directly; the decommission protocol does it
fn scale_down(view: &RackView<'_>) -> Option<RackAction> {
    let observed = view.observed?;
    (replicas(observed) > view.info.node_count).then_some(RackAction::Decommission)
}

/// Short on ready nodes, or a start still has to be confirmed
fn await_ready(view: &RackView<'_>) -> Option<RackAction> {
    view.observed?;
    let starting = view
        .pods
        .iter()
        .any(|p| node_state(p) == Some(NodeState::Starting));
    (starting || view.ready_count() < view.info.node_count).then_some(RackAction::StartNodes)
}

fn too_many_ready(view: &RackView<'_>) -> Option<RackAction> {
    view.observed?;
    let ready = view.ready_count();
    (ready > view.info.node_count).then_some(RackAction::TooManyReady { ready })
}

fn template_drift(view: &RackView<'_>) -> Option<RackAction> {
    let observed = view.observed?;
    (current_hash(observed) != current_hash(view.desired)).then_some(RackAction::UpdateTemplate)
}

fn seed_labels(view: &RackView<'_>) -> Option<RackAction> {
    view.observed?;
    let changes = seed_label_changes(&view.pods, view.info.seed_count);
    (!changes.is_empty()).then_some(RackAction::ReconcileSeeds(changes))
}

/// Actions the guards yield for a rack, up to and including the first
/// blocking one
pub fn decide(view: &RackView<'_>) -> Vec<RackAction> {
    let mut actions = Vec::new();
    for guard in RACK_GUARDS {
        if let Some(action) = guard(view) {
            let blocking = action.is_blocking();
            actions.push(action);
            if blocking {
                break;
            }
        }
    }
    actions
}

/// Run the rack guards for every rack in order
pub async fn check_racks(ctx: &mut ReconciliationContext) -> ReconcileResult {
    for idx in 0..ctx.desired_racks.len() {
        let result = check_rack(ctx, idx).await;
        if result.is_completed() {
            return result;
        }
    }
    ReconcileResult::Continue
}

async fn check_rack(ctx: &mut ReconciliationContext, idx: usize) -> ReconcileResult {
    let info = ctx.desired_racks[idx].clone();
    let Some(rack) = ctx.dc.racks().into_iter().find(|r| r.name == info.rack_name) else {
        return ReconcileResult::Continue;
    };
    let desired = try_check!(build_statefulset(&ctx.dc, &rack, info.node_count));
    let (members, member_claims) = match ctx.statefulsets[idx].as_ref() {
        Some(sts) => try_check!(workload_members(ctx, sts).await),
        None => (Vec::new(), Vec::new()),
    };

    let actions = {
        let view = RackView {
            dc: &ctx.dc,
            info: &info,
            observed: ctx.statefulsets[idx].as_ref(),
            desired: &desired,
            pods: ctx.rack_pods(&info.rack_name),
            members: &members,
            member_claims: &member_claims,
        };
        decide(&view)
    };

    for action in actions {
        debug!("Rack {}: {:?}", info.rack_name, action);
        let result = execute(ctx, idx, &desired, action).await;
        if result.is_completed() {
            return result;
        }
    }
    ReconcileResult::Continue
}

/// Pods of a workload by ordinal, with their claims
async fn workload_members(
    ctx: &ReconciliationContext,
    sts: &StatefulSet,
) -> Result<(Vec<Pod>, Vec<PersistentVolumeClaim>)> {
    let mut pods = Vec::new();
    let mut claims = Vec::new();
    for ordinal in 0..replicas(sts) {
        let Some(pod) = ctx.ops.get_pod(&format!("{}-{}", sts.name_any(), ordinal)).await? else {
            continue;
        };
        claims.extend(ctx.claims_of(&pod).await?);
        pods.push(pod);
    }
    Ok((pods, claims))
}

async fn execute(
    ctx: &mut ReconciliationContext,
    idx: usize,
    desired: &StatefulSet,
    action: RackAction,
) -> ReconcileResult {
    let rack_name = ctx.desired_racks[idx].rack_name.clone();
    let observed = ctx.statefulsets[idx].clone();

    match action {
        RackAction::Create => {
            info!("Creating StatefulSet {} for rack {}", desired.name_any(), rack_name);
            try_check!(ctx.set_progress(ProgressState::Updating).await);
            try_check!(ctx.ops.create_statefulset(desired).await);
            try_check!(ctx.ops.apply_pdb(&super::resources::build_pdb(&ctx.dc)).await);
            ctx.ops
                .record_event(
                    EventType::Normal,
                    "CreatedResource",
                    &format!("Created statefulset {}", desired.name_any()),
                )
                .await;
            ReconcileResult::RequeueSoon(RACK_REQUEUE_SECS)
        }
        RackAction::PatchLabels(labels) => {
            let Some(sts) = observed else {
                return ReconcileResult::Continue;
            };
            info!("Updating labels of StatefulSet {}", sts.name_any());
            try_check!(ctx.ops.patch_statefulset_labels(&sts.name_any(), &labels).await);
            ctx.ops
                .record_event(
                    EventType::Normal,
                    "LabeledRackResource",
                    &format!("Update rack labels for StatefulSet {}", sts.name_any()),
                )
                .await;
            ReconcileResult::Continue
        }
        RackAction::RestoreIdentityLabels { pods, claims } => {
            for fix in pods {
                info!("Restoring rack labels of pod {}", fix.name);
                let labels = fix.labels.into_iter().map(|(k, v)| (k, Some(v))).collect();
                try_check!(ctx.patch_pod_labels(&fix.name, labels).await);
                ctx.ops
                    .record_event(
                        EventType::Normal,
                        "LabeledRackResource",
                        &format!("Update rack labels for Pod {}", fix.name),
                    )
                    .await;
            }
            for fix in claims {
                info!("Restoring rack labels of claim {}", fix.name);
                try_check!(ctx.ops.patch_pvc_labels(&fix.name, &fix.labels).await);
                ctx.ops
                    .record_event(
                        EventType::Normal,
                        "LabeledRackResource",
                        &format!("Update rack labels for PersistentVolumeClaim {}", fix.name),
                    )
                    .await;
            }
            ReconcileResult::Continue
        }
        RackAction::ScaleUp { to } => {
            let Some(sts) = observed else {
                return ReconcileResult::Continue;
            };
            if ctx.is_condition_true(DatacenterConditionType::Stopped) {
                try_check!(ctx.set_condition(condition_false(DatacenterConditionType::Stopped)).await);
                try_check!(ctx.set_condition(condition_true(DatacenterConditionType::Resuming)).await);
            } else {
                try_check!(ctx.set_condition(condition_true(DatacenterConditionType::ScalingUp)).await);
            }
            try_check!(ctx.set_progress(ProgressState::Updating).await);
            info!("Scaling up rack {} to {} nodes", rack_name, to);
            ctx.ops
                .record_event(
                    EventType::Normal,
                    "ScalingUpRack",
                    &format!("Scaling up rack {rack_name}"),
                )
                .await;
            try_check!(ctx.ops.scale_statefulset(&sts, to).await);
            ReconcileResult::RequeueSoon(RACK_REQUEUE_SECS)
        }
        RackAction::Park => {
            let Some(sts) = observed else {
                return ReconcileResult::Continue;
            };
            try_check!(ctx.set_condition(condition_true(DatacenterConditionType::Stopped)).await);
            try_check!(ctx.set_condition(condition_false(DatacenterConditionType::Ready)).await);
            ctx.ops
                .record_event(EventType::Normal, "StoppingDatacenter", "Stopping datacenter")
                .await;

            let running: Vec<Pod> = ctx
                .rack_pods(&rack_name)
                .into_iter()
                .filter(|p| is_mgmt_api_running(p))
                .cloned()
                .collect();
            let mut drain_errors = 0;
            for pod in &running {
                if let Err(e) = ctx.mgmt.drain(pod).await {
                    warn!("Drain of {} failed: {}", pod.name_any(), e);
                    drain_errors += 1;
                }
            }
            info!(
                "Rack {} drained: {} nodes, {} errors",
                rack_name,
                running.len(),
                drain_errors
            );

            try_check!(ctx.ops.scale_statefulset(&sts, 0).await);
            ReconcileResult::RequeueSoon(RACK_REQUEUE_SECS)
        }
        RackAction::Decommission => start_decommission(ctx, idx).await,
        RackAction::StartNodes => start_next_node(ctx).await,
        RackAction::TooManyReady { ready } => {
            warn!(
                "Rack {} has {} ready nodes but wants {}",
                rack_name, ready, ctx.desired_racks[idx].node_count
            );
            ReconcileResult::RequeueSoon(TOO_MANY_READY_REQUEUE_SECS)
        }
        RackAction::UpdateTemplate => {
            let Some(sts) = observed else {
                return ReconcileResult::Continue;
            };
            try_check!(update_template(ctx, &sts, desired).await);
            ReconcileResult::RequeueSoon(RACK_REQUEUE_SECS)
        }
        RackAction::ReconcileSeeds(changes) => {
            for change in changes {
                let value = change.seed.then(|| "true".to_string());
                try_check!(
                    ctx.patch_pod_labels(
                        &change.pod_name,
                        BTreeMap::from([(SEED_NODE_LABEL.to_string(), value)]),
                    )
                    .await
                );
            }
            ReconcileResult::Continue
        }
    }
}

/// Replace a workload's template with the desired one, keeping its
/// current replica count
pub async fn update_template(
    ctx: &mut ReconciliationContext,
    observed: &StatefulSet,
    desired: &StatefulSet,
) -> Result<()> {
    let mut updated = desired.clone();
    updated.metadata.resource_version = observed.metadata.resource_version.clone();
    if let Some(spec) = updated.spec.as_mut() {
        spec.replicas = Some(replicas(observed));
    }

    info!("Updating template of StatefulSet {}", observed.name_any());
    ctx.set_condition(condition_true(DatacenterConditionType::Updating))
        .await?;
    ctx.set_progress(ProgressState::Updating).await?;
    ctx.ops.replace_statefulset(&updated).await?;
    ctx.ops
        .record_event(
            EventType::Normal,
            "UpdatedResource",
            &format!("Updated statefulset {}", observed.name_any()),
        )
        .await;
    Ok(())
}

/// Re-apply the template of every rack listed in `forceUpgradeRacks`,
/// ready or not, then clear the list
pub async fn check_force_upgrade(ctx: &mut ReconciliationContext) -> ReconcileResult {
    let requested = ctx.dc.spec.force_upgrade_racks.clone();
    if requested.is_empty() {
        return ReconcileResult::Continue;
    }

    for idx in 0..ctx.desired_racks.len() {
        let info = ctx.desired_racks[idx].clone();
        if !requested.contains(&info.rack_name) {
            continue;
        }
        let Some(observed) = ctx.statefulsets[idx].clone() else {
            continue;
        };
        let Some(rack) = ctx.dc.racks().into_iter().find(|r| r.name == info.rack_name) else {
            continue;
        };
        info!("Force upgrading rack {}", info.rack_name);
        let desired = try_check!(build_statefulset(&ctx.dc, &rack, info.node_count));
        try_check!(update_template(ctx, &observed, &desired).await);
    }

    try_check!(ctx.ops.clear_force_upgrade_racks().await);
    ReconcileResult::Done
}
