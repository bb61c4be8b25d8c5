//! Main reconciler for CassandraDatacenter resources
//!
//! Implements the controller pattern using kube-rs runtime. Each pass loads
//! a [`ReconciliationContext`] and runs the checks of [`PIPELINE`] in order
//! until one of them completes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::{
    api::Api,
    client::Client,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        watcher::Config,
    },
    ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use super::conditions::{self, condition_false, condition_true};
use super::context::{ReconciliationContext, Settings};
use super::decommission::check_decommissioning_nodes;
use super::emm::check_emm;
use super::finalizers::{delete_datacenter_claims, CASSANDRA_DATACENTER_FINALIZER};
use super::mgmt_api::NodeMgmt;
use super::nodes::check_node_statuses;
use super::ops::{DatacenterOps, EventType, KubeDatacenterOps};
use super::pvc_health::check_pvc_health;
use super::racks::{check_force_upgrade, check_racks};
use super::resources::build_pdb;
use super::restart::check_rolling_restart;
use super::result::{try_check, ReconcileResult};
use crate::crd::{
    CassandraDatacenter, ConditionStatus, DatacenterCondition, DatacenterConditionType,
    ProgressState,
};
use crate::error::{Error, Result};

#[cfg_attr(not(feature = "metrics"), allow(dead_code))]
const CONTROLLER_NAME: &str = "cassandradatacenter";
const NOT_LEADER_REQUEUE: Duration = Duration::from_secs(5);

/// Operator-wide settings parsed from the command line
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Watch only this namespace; cluster-wide when unset
    pub watch_namespace: Option<String>,
    pub enable_emm: bool,
    pub strict_decommission: bool,
}

impl OperatorConfig {
    fn settings(&self) -> Settings {
        Settings {
            enable_emm: self.enable_emm,
            strict_decommission: self.strict_decommission,
        }
    }
}

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub config: OperatorConfig,
    pub is_leader: Arc<AtomicBool>,
    pub mgmt: Arc<dyn NodeMgmt>,
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let datacenters: Api<CassandraDatacenter> = match &state.config.watch_namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    info!("Starting CassandraDatacenter controller");

    match datacenters.list(&Default::default()).await {
        Ok(_) => info!("CassandraDatacenter CRD is available"),
        Err(e) => {
            error!(
                "CassandraDatacenter CRD not found. Please install the CRD first: {:?}",
                e
            );
            return Err(Error::ConfigError(
                "CassandraDatacenter CRD not installed".to_string(),
            ));
        }
    }

    let (statefulsets, budgets): (Api<StatefulSet>, Api<PodDisruptionBudget>) =
        match &state.config.watch_namespace {
            Some(ns) => (
                Api::namespaced(client.clone(), ns),
                Api::namespaced(client.clone(), ns),
            ),
            None => (Api::all(client.clone()), Api::all(client.clone())),
        };

    Controller::new(datacenters, Config::default())
        .owns(statefulsets, Config::default())
        .owns(budgets, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => error!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// The main reconciliation function
///
/// Called whenever a CassandraDatacenter or one of its workloads or
/// disruption budgets changes, and when a requeue timer expires.
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<CassandraDatacenter>, ctx: Arc<ControllerState>) -> Result<Action> {
    if !ctx.is_leader.load(Ordering::Relaxed) {
        debug!("Not the leader, skipping reconcile");
        return Ok(Action::requeue(NOT_LEADER_REQUEUE));
    }

    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<CassandraDatacenter> = Api::namespaced(ctx.client.clone(), &namespace);
    let started = Instant::now();

    let result = finalizer(&api, CASSANDRA_DATACENTER_FINALIZER, obj, |event| async {
        match event {
            FinalizerEvent::Apply(dc) => apply_datacenter(&ctx, &dc).await,
            FinalizerEvent::Cleanup(dc) => cleanup_datacenter(&ctx, &dc).await,
        }
    })
    .await
    .map_err(Error::from);

    #[cfg(feature = "metrics")]
    {
        super::metrics::observe_reconcile_duration_seconds(
            CONTROLLER_NAME,
            started.elapsed().as_secs_f64(),
        );
    }
    #[cfg(not(feature = "metrics"))]
    let _ = started;

    result
}

#[instrument(skip(state, dc), fields(name = %dc.name_any(), namespace = dc.namespace()))]
async fn apply_datacenter(state: &ControllerState, dc: &CassandraDatacenter) -> Result<Action> {
    let ops: Arc<dyn DatacenterOps> = Arc::new(KubeDatacenterOps::new(state.client.clone(), dc));
    let mut ctx = ReconciliationContext::load(
        dc.clone(),
        ops,
        state.mgmt.clone(),
        state.config.settings(),
    )
    .await?;

    if let Err(e) = dc.spec.validate() {
        warn!("Validation failed for {}: {}", dc.name_any(), e);
        ctx.set_condition(
            DatacenterCondition::new(DatacenterConditionType::Valid, ConditionStatus::False)
                .with_reason("InvalidSpec", &e.to_string()),
        )
        .await?;
        ctx.ops
            .record_event(EventType::Warning, "InvalidSpec", &e.to_string())
            .await;
        return Ok(Action::await_change());
    }
    ctx.set_condition(condition_true(DatacenterConditionType::Valid))
        .await?;

    let result = reconcile_pass(&mut ctx).await;
    info!("Reconcile pass for {} finished: {}", dc.name_any(), result.label());

    #[cfg(feature = "metrics")]
    super::metrics::inc_reconcile_outcome(CONTROLLER_NAME, result.label());

    Ok(result.output()?.into())
}

#[instrument(skip(state, dc), fields(name = %dc.name_any(), namespace = dc.namespace()))]
async fn cleanup_datacenter(state: &ControllerState, dc: &CassandraDatacenter) -> Result<Action> {
    info!("Cleaning up CassandraDatacenter {}", dc.name_any());
    let ops = KubeDatacenterOps::new(state.client.clone(), dc);
    let deleted = delete_datacenter_claims(&ops, dc).await?;
    info!("Deleted {} volume claims of {}", deleted, dc.name_any());
    Ok(Action::await_change())
}

/// One step of a reconcile pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Check {
    NodeStatuses,
    DecommissioningNodes,
    ForceUpgrade,
    Emm,
    PvcHealth,
    Racks,
    RollingRestart,
    DisruptionBudget,
    ClearActionConditions,
    ReadyState,
}

const PIPELINE: &[Check] = &[
    Check::NodeStatuses,
    Check::DecommissioningNodes,
    Check::ForceUpgrade,
    Check::Emm,
    Check::PvcHealth,
    Check::Racks,
    Check::RollingRestart,
    Check::DisruptionBudget,
    Check::ClearActionConditions,
    Check::ReadyState,
];

impl Check {
    async fn run(self, ctx: &mut ReconciliationContext) -> ReconcileResult {
        match self {
            Check::NodeStatuses => check_node_statuses(ctx).await,
            Check::DecommissioningNodes => check_decommissioning_nodes(ctx).await,
            Check::ForceUpgrade => check_force_upgrade(ctx).await,
            Check::Emm if ctx.settings.enable_emm => check_emm(ctx).await,
            Check::PvcHealth if ctx.settings.enable_emm => check_pvc_health(ctx).await,
            Check::Emm | Check::PvcHealth => ReconcileResult::Continue,
            Check::Racks => check_racks(ctx).await,
            Check::RollingRestart => check_rolling_restart(ctx).await,
            Check::DisruptionBudget => check_disruption_budget(ctx).await,
            Check::ClearActionConditions => clear_action_conditions(ctx).await,
            Check::ReadyState => set_ready_state(ctx).await,
        }
    }
}

/// Run the checks in order; the first completed result ends the pass
pub async fn reconcile_pass(ctx: &mut ReconciliationContext) -> ReconcileResult {
    for check in PIPELINE {
        let result = check.run(ctx).await;
        if result.is_completed() {
            debug!("Check {:?} completed the pass: {}", check, result.label());
            return result;
        }
    }
    ReconcileResult::Done
}

async fn check_disruption_budget(ctx: &mut ReconciliationContext) -> ReconcileResult {
    try_check!(ctx.ops.apply_pdb(&build_pdb(&ctx.dc)).await);
    ReconcileResult::Continue
}

const ACTION_CONDITIONS: [DatacenterConditionType; 4] = [
    DatacenterConditionType::ScalingUp,
    DatacenterConditionType::Updating,
    DatacenterConditionType::Resuming,
    DatacenterConditionType::RollingRestart,
];

async fn clear_action_conditions(ctx: &mut ReconciliationContext) -> ReconcileResult {
    let stopped = ctx.dc.spec.stopped;
    try_check!(
        ctx.update_status(|status| {
            let mut changed = false;
            for type_ in ACTION_CONDITIONS {
                if conditions::is_condition_true(&status.conditions, type_) {
                    changed |= conditions::set_condition(&mut status.conditions, condition_false(type_));
                }
            }
            if !stopped && conditions::is_condition_true(&status.conditions, DatacenterConditionType::Stopped) {
                changed |= conditions::set_condition(
                    &mut status.conditions,
                    condition_false(DatacenterConditionType::Stopped),
                );
            }
            changed
        })
        .await
    );
    ReconcileResult::Continue
}

async fn set_ready_state(ctx: &mut ReconciliationContext) -> ReconcileResult {
    let stopped = ctx.dc.spec.stopped;
    let generation = ctx.dc.metadata.generation;
    try_check!(
        ctx.update_status(|status| {
            let mut changed = false;
            if !stopped {
                changed |= conditions::set_condition(
                    &mut status.conditions,
                    condition_true(DatacenterConditionType::Initialized),
                );
            }
            let ready = if stopped {
                condition_false(DatacenterConditionType::Ready)
            } else {
                condition_true(DatacenterConditionType::Ready)
            };
            changed |= conditions::set_condition(&mut status.conditions, ready);
            if status.cassandra_operator_progress != Some(ProgressState::Ready) {
                status.cassandra_operator_progress = Some(ProgressState::Ready);
                changed = true;
            }
            if generation.is_some() && status.observed_generation != generation {
                status.observed_generation = generation;
                changed = true;
            }
            changed
        })
        .await
    );
    ReconcileResult::Continue
}

/// Error policy determines how to handle reconciliation errors
fn error_policy(dc: Arc<CassandraDatacenter>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    error!("Reconciliation error for {}: {:?}", dc.name_any(), error);

    #[cfg(feature = "metrics")]
    super::metrics::inc_reconcile_error(CONTROLLER_NAME, error.kind());

    Action::requeue(retry_after(error))
}

/// Shorter retry for retriable errors
pub(crate) fn retry_after(error: &Error) -> Duration {
    if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    }
}
