//! Replacement of nodes whose volume went inaccessible
//!
//! One replacement per pass at most, and never while a second rack is
//! already down.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::emm::EmmSpi;
use super::pods::{is_server_ready, is_volume_inaccessible, rack_of};
use super::result::{try_check, ReconcileResult};

const PVC_REPLACE_REQUEUE_SECS: u64 = 2;

/// Racks holding a down node that joined the ring at some point
fn down_racks(spi: &dyn EmmSpi) -> BTreeSet<String> {
    spi.dc_pods()
        .iter()
        .filter(|p| !is_server_ready(p) && spi.is_bootstrapped(p))
        .filter_map(|p| rack_of(p).map(str::to_string))
        .collect()
}

async fn has_inaccessible_volume(spi: &dyn EmmSpi, pod: &Pod) -> crate::error::Result<bool> {
    Ok(spi.pod_claims(pod).await?.iter().any(is_volume_inaccessible))
}

pub async fn check_pvc_health(spi: &mut dyn EmmSpi) -> ReconcileResult {
    let down = down_racks(spi);
    if down.len() > 1 {
        debug!("{} racks are down, not replacing nodes for volume health", down.len());
        return ReconcileResult::Continue;
    }

    let pods: Vec<Pod> = spi
        .dc_pods()
        .iter()
        .filter(|p| match down.iter().next() {
            Some(rack) => rack_of(p) == Some(rack.as_str()),
            None => true,
        })
        .cloned()
        .collect();

    let mut candidates = Vec::new();
    for pod in &pods {
        if try_check!(has_inaccessible_volume(spi, pod).await) {
            candidates.push(pod.name_any());
        }
    }
    if candidates.is_empty() {
        return ReconcileResult::Continue;
    }

    if !spi.in_progress_replacements().is_empty() {
        debug!(
            "Replacement already in progress, deferring {} inaccessible volumes",
            candidates.len()
        );
        return ReconcileResult::Continue;
    }

    candidates.sort();
    let name = &candidates[0];
    warn!("Volume of {} is inaccessible", name);
    info!("Replacing {} to recover its data on a new volume", name);
    try_check!(spi.start_node_replace(name).await);
    ReconcileResult::RequeueSoon(PVC_REPLACE_REQUEUE_SECS)
}
