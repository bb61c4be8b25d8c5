//! Rolling restart of a datacenter
//!
//! A request on the resource is turned into a cutoff instant in the status.
//! Every pass then deletes at most one pod created before the cutoff, so the
//! workload recreates nodes one by one behind the rack checks.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{info, warn};

use super::conditions::condition_true;
use super::context::ReconciliationContext;
use super::ops::EventType;
use super::result::{try_check, ReconcileResult};
use crate::crd::DatacenterConditionType;

const RESTART_REQUEUE_SECS: u64 = 2;

pub async fn check_rolling_restart(ctx: &mut ReconciliationContext) -> ReconcileResult {
    if ctx.dc.spec.rolling_restart_requested {
        let now = Utc::now().to_rfc3339();
        info!("Rolling restart requested, restarting pods created before {}", now);
        try_check!(
            ctx.update_status(|status| {
                status.last_rolling_restart = Some(now);
                true
            })
            .await
        );
        try_check!(
            ctx.set_condition(condition_true(DatacenterConditionType::RollingRestart))
                .await
        );
        try_check!(ctx.ops.clear_rolling_restart_request().await);
    }

    let Some(cutoff) = restart_cutoff(ctx) else {
        return ReconcileResult::Continue;
    };
    let Some(pod) = next_pod_to_restart(&ctx.dc_pods, cutoff).cloned() else {
        return ReconcileResult::Continue;
    };

    let name = pod.name_any();
    ctx.ops
        .record_event(
            EventType::Normal,
            "RestartingCassandra",
            &format!("Restarting Cassandra for pod {name}"),
        )
        .await;
    if let Err(e) = ctx.mgmt.drain(&pod).await {
        warn!("Drain of {} failed before restart: {:?}", name, e);
    }
    try_check!(ctx.ops.delete_pod(&name).await);
    ReconcileResult::RequeueSoon(RESTART_REQUEUE_SECS)
}

fn restart_cutoff(ctx: &ReconciliationContext) -> Option<DateTime<Utc>> {
    let recorded = ctx.dc.status.as_ref()?.last_rolling_restart.as_deref()?;
    match DateTime::parse_from_rfc3339(recorded) {
        Ok(at) => Some(at.with_timezone(&Utc)),
        Err(e) => {
            warn!("Ignoring unreadable lastRollingRestart {:?}: {}", recorded, e);
            None
        }
    }
}

/// Lowest-named live pod created before `cutoff`
fn next_pod_to_restart(pods: &[Pod], cutoff: DateTime<Utc>) -> Option<&Pod> {
    pods.iter()
        .filter(|p| p.metadata.deletion_timestamp.is_none())
        .filter(|p| {
            p.metadata
                .creation_timestamp
                .as_ref()
                .is_some_and(|created| created.0 < cutoff)
        })
        .min_by_key(|p| p.name_any())
}
