//! Arbitration of infrastructure maintenance (EMM) against availability
//!
//! The infrastructure announces maintenance by tainting a host with
//! `node.vmware.com/drain`. Depending on the taint value the operator either
//! moves pods off the host or refuses the operation by annotating the pods
//! on it with `appplatform.vmware.com/emm-failure`.
//!
//! All cluster access goes through [`EmmSpi`] so the decision logic runs
//! against fakes in tests. The logic itself is an ordered list of guards
//! over an [`EmmView`] snapshot; the first guard that yields an
//! [`EmmAction`] wins.
//!
//! Evacuate-all-data hosts are emptied one pod per pass because each pod
//! may need a full rebuild elsewhere. Planned-downtime hosts are emptied in
//! one go since their volumes come back with the host.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Pod};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::pods::{host_of, is_server_ready, is_unschedulable, rack_of};
use super::result::{try_check, ReconcileResult};
use crate::crd::{
    EmmFailure, EmmTaintValue, EMM_FAILURE_ANNOTATION, EMM_TAINT_KEY, SELECTED_NODE_ANNOTATION,
};
use crate::error::Result;

/// Seconds to wait after any EMM mutation
pub const EMM_REQUEUE_SECS: u64 = 2;
const NOT_ENOUGH_RESOURCES_REQUEUE_SECS: u64 = 10;

/// Capabilities the EMM and volume health checks need from the cluster
#[async_trait]
pub trait EmmSpi: Send + Sync {
    /// Pods of the datacenter as observed at the start of the pass
    fn dc_pods(&self) -> &[Pod];

    /// The pod's database node joined the ring at some point
    fn is_bootstrapped(&self, pod: &Pod) -> bool;

    fn in_progress_replacements(&self) -> &[String];

    fn is_stopped(&self) -> bool;

    fn is_initialized(&self) -> bool;

    /// Every host in the cluster
    async fn all_hosts(&self) -> Result<Vec<Node>>;

    /// Hosts running a datacenter pod or holding one of its volumes
    async fn dc_hosts(&self) -> Result<Vec<Node>>;

    async fn pod_claims(&self, pod: &Pod) -> Result<Vec<PersistentVolumeClaim>>;

    /// Set (`Some`) or remove (`None`) an annotation on a pod
    async fn set_pod_annotation(&mut self, pod: &Pod, key: &str, value: Option<&str>)
        -> Result<()>;

    async fn remove_pod(&mut self, pod: &Pod) -> Result<()>;

    /// Throw away the pod's volume and bring it back as a replacement node
    async fn start_node_replace(&mut self, pod_name: &str) -> Result<()>;
}

/// EMM taint value on a host, if any
pub fn emm_taint(node: &Node) -> Option<EmmTaintValue> {
    node.spec
        .as_ref()?
        .taints
        .as_ref()?
        .iter()
        .find(|t| t.key == EMM_TAINT_KEY && t.effect == "NoSchedule")
        .and_then(|t| t.value.as_deref())
        .and_then(EmmTaintValue::parse)
}

/// Everything the guards look at, loaded once per pass
#[derive(Clone, Debug, Default)]
pub struct EmmView {
    pub pods: Vec<Pod>,
    pub initialized: bool,
    pub stopped: bool,
    pub evacuate_hosts: BTreeSet<String>,
    pub planned_downtime_hosts: BTreeSet<String>,
    /// Hosts that are neither tainted nor unknown
    pub available_host_count: usize,
    /// Pods whose database node joined the ring at some point
    pub bootstrapped: BTreeSet<String>,
    /// Host each down pod's volume is pinned to
    pub pinned_hosts: BTreeMap<String, String>,
}

impl EmmView {
    pub async fn load(spi: &dyn EmmSpi) -> Result<Self> {
        let dc_hosts = spi.dc_hosts().await?;
        let mut evacuate_hosts = BTreeSet::new();
        let mut planned_downtime_hosts = BTreeSet::new();
        for host in &dc_hosts {
            match emm_taint(host) {
                Some(EmmTaintValue::EvacuateAllData) => {
                    evacuate_hosts.insert(host.name_any());
                }
                Some(EmmTaintValue::PlannedDowntime) => {
                    planned_downtime_hosts.insert(host.name_any());
                }
                None => {}
            }
        }

        let available_host_count = spi
            .all_hosts()
            .await?
            .iter()
            .filter(|h| {
                let name = h.name_any();
                !evacuate_hosts.contains(&name) && !planned_downtime_hosts.contains(&name)
            })
            .count();

        let pods = spi.dc_pods().to_vec();
        let bootstrapped: BTreeSet<String> = pods
            .iter()
            .filter(|p| spi.is_bootstrapped(p))
            .map(|p| p.name_any())
            .collect();

        let mut pinned_hosts = BTreeMap::new();
        for pod in pods.iter().filter(|p| {
            !is_server_ready(p) && bootstrapped.contains(&p.name_any()) && is_unschedulable(p)
        }) {
            let pinned = spi
                .pod_claims(pod)
                .await?
                .iter()
                .find_map(|c| c.annotations().get(SELECTED_NODE_ANNOTATION).cloned());
            if let Some(host) = pinned {
                pinned_hosts.insert(pod.name_any(), host);
            }
        }

        Ok(Self {
            pods,
            initialized: spi.is_initialized(),
            stopped: spi.is_stopped(),
            evacuate_hosts,
            planned_downtime_hosts,
            available_host_count,
            bootstrapped,
            pinned_hosts,
        })
    }

    pub fn tainted_hosts(&self) -> BTreeSet<String> {
        self.evacuate_hosts
            .union(&self.planned_downtime_hosts)
            .cloned()
            .collect()
    }

    fn pods_on<'a>(&'a self, hosts: &'a BTreeSet<String>) -> impl Iterator<Item = &'a Pod> + 'a {
        self.pods
            .iter()
            .filter(move |p| host_of(p).map(|h| hosts.contains(h)).unwrap_or(false))
    }

    fn failed_pods(&self) -> impl Iterator<Item = &Pod> {
        self.pods
            .iter()
            .filter(|p| p.annotations().contains_key(EMM_FAILURE_ANNOTATION))
    }

    fn down_bootstrapped_pods(&self) -> impl Iterator<Item = &Pod> {
        self.pods
            .iter()
            .filter(|p| !is_server_ready(p) && self.bootstrapped.contains(&p.name_any()))
    }

    /// Racks holding a down node that is part of the ring
    pub fn down_racks(&self) -> BTreeSet<String> {
        self.down_bootstrapped_pods()
            .filter_map(|p| rack_of(p).map(str::to_string))
            .collect()
    }

    /// The down rack when exactly one rack is down
    fn single_down_rack(&self) -> Option<String> {
        let down_racks = self.down_racks();
        if down_racks.len() == 1 {
            down_racks.into_iter().next()
        } else {
            None
        }
    }

    fn rack_hosts(&self, rack: &str) -> BTreeSet<String> {
        self.pods
            .iter()
            .filter(|p| rack_of(p) == Some(rack))
            .filter_map(|p| host_of(p).map(str::to_string))
            .collect()
    }

    /// Pods on the given hosts that do not carry a failure annotation yet
    fn fail(&self, hosts: &BTreeSet<String>, reason: EmmFailure, requeue_secs: u64) -> Option<EmmAction> {
        let pods: Vec<String> = self
            .pods_on(hosts)
            .filter(|p| !p.annotations().contains_key(EMM_FAILURE_ANNOTATION))
            .map(|p| p.name_any())
            .collect();
        if pods.is_empty() {
            None
        } else {
            Some(EmmAction::Fail {
                pods,
                reason,
                requeue_secs,
            })
        }
    }
}

/// What a guard wants done
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EmmAction {
    /// Drop failure annotations from pods whose host is no longer tainted
    ClearFailures(Vec<String>),
    /// A refused operation is still pending on a tainted host
    AwaitFailureProcessing,
    /// Stop evaluating EMM for this pass without mutating anything
    Skip,
    Fail {
        pods: Vec<String>,
        reason: EmmFailure,
        requeue_secs: u64,
    },
    RemovePods(Vec<String>),
    ReplaceNodes(Vec<String>),
}

type EmmGuard = fn(&EmmView) -> Option<EmmAction>;

const EMM_GUARDS: &[EmmGuard] = &[
    clear_stale_failures,
    await_failure_processing,
    defer_until_initialized,
    fail_without_capacity,
    fail_evacuation_when_stopped,
    fail_all_when_racks_down,
    fail_hosts_outside_down_rack,
    remove_not_ready_on_tainted_hosts,
    replace_pinned_down_pods,
    evacuate_one_pod,
    vacate_planned_downtime_host,
];

fn clear_stale_failures(view: &EmmView) -> Option<EmmAction> {
    let tainted = view.tainted_hosts();
    let pods: Vec<String> = view
        .failed_pods()
        .filter(|p| host_of(p).map(|h| !tainted.contains(h)).unwrap_or(true))
        .map(|p| p.name_any())
        .collect();
    (!pods.is_empty()).then_some(EmmAction::ClearFailures(pods))
}

fn await_failure_processing(view: &EmmView) -> Option<EmmAction> {
    let tainted = view.tainted_hosts();
    view.failed_pods()
        .any(|p| host_of(p).map(|h| tainted.contains(h)).unwrap_or(false))
        .then_some(EmmAction::AwaitFailureProcessing)
}

fn defer_until_initialized(view: &EmmView) -> Option<EmmAction> {
    (!view.initialized).then_some(EmmAction::Skip)
}

fn fail_without_capacity(view: &EmmView) -> Option<EmmAction> {
    if view.pods.len() > view.available_host_count {
        view.fail(
            &view.tainted_hosts(),
            EmmFailure::NotEnoughResources,
            NOT_ENOUGH_RESOURCES_REQUEUE_SECS,
        )
    } else {
        None
    }
}

fn fail_evacuation_when_stopped(view: &EmmView) -> Option<EmmAction> {
    if view.stopped {
        view.fail(&view.evacuate_hosts, EmmFailure::GenericFailure, EMM_REQUEUE_SECS)
    } else {
        None
    }
}

/// With more than one rack down no maintenance automation runs at all.
fn fail_all_when_racks_down(view: &EmmView) -> Option<EmmAction> {
    if view.down_racks().len() > 1 {
        view.fail(
            &view.tainted_hosts(),
            EmmFailure::TooManyExistingFailures,
            EMM_REQUEUE_SECS,
        )
        .or(Some(EmmAction::Skip))
    } else {
        None
    }
}

fn fail_hosts_outside_down_rack(view: &EmmView) -> Option<EmmAction> {
    let down_rack = view.single_down_rack()?;
    let rack_hosts = view.rack_hosts(&down_rack);
    let outside: BTreeSet<String> = view
        .tainted_hosts()
        .difference(&rack_hosts)
        .cloned()
        .collect();
    view.fail(&outside, EmmFailure::TooManyExistingFailures, EMM_REQUEUE_SECS)
}

fn remove_not_ready_on_tainted_hosts(view: &EmmView) -> Option<EmmAction> {
    let tainted = view.tainted_hosts();
    let pods: Vec<String> = view
        .pods_on(&tainted)
        .filter(|p| !is_server_ready(p))
        .map(|p| p.name_any())
        .collect();
    (!pods.is_empty()).then_some(EmmAction::RemovePods(pods))
}

/// A down pod cannot be scheduled because its volume is pinned to a host
/// being evacuated; it can only come back with a fresh volume.
fn replace_pinned_down_pods(view: &EmmView) -> Option<EmmAction> {
    view.single_down_rack()?;

    let pods: Vec<String> = view
        .down_bootstrapped_pods()
        .filter(|p| is_unschedulable(p))
        .filter(|p| {
            view.pinned_hosts
                .get(&p.name_any())
                .map(|pinned| host_of(p) != Some(pinned.as_str()) && view.evacuate_hosts.contains(pinned))
                .unwrap_or(false)
        })
        .map(|p| p.name_any())
        .collect();

    if pods.is_empty() {
        Some(EmmAction::Skip)
    } else {
        Some(EmmAction::ReplaceNodes(pods))
    }
}

fn evacuate_one_pod(view: &EmmView) -> Option<EmmAction> {
    view.pods_on(&view.evacuate_hosts)
        .min_by_key(|p| (host_of(p).map(str::to_string), p.name_any()))
        .map(|p| EmmAction::RemovePods(vec![p.name_any()]))
}

fn vacate_planned_downtime_host(view: &EmmView) -> Option<EmmAction> {
    view.planned_downtime_hosts.iter().find_map(|host| {
        let pods: Vec<String> = view
            .pods
            .iter()
            .filter(|p| host_of(p) == Some(host.as_str()))
            .map(|p| p.name_any())
            .collect();
        (!pods.is_empty()).then_some(EmmAction::RemovePods(pods))
    })
}

/// First action any guard yields for this view
pub fn decide(view: &EmmView) -> Option<EmmAction> {
    EMM_GUARDS.iter().find_map(|guard| guard(view))
}

/// Run the EMM check for one pass
pub async fn check_emm(spi: &mut dyn EmmSpi) -> ReconcileResult {
    let view = try_check!(EmmView::load(spi).await);

    let Some(action) = decide(&view) else {
        debug!("No EMM work to do");
        return ReconcileResult::Continue;
    };

    let find = |name: &str| view.pods.iter().find(|p| p.name_any() == name);

    match action {
        EmmAction::ClearFailures(names) => {
            for pod in names.iter().filter_map(|n| find(n)) {
                info!("Clearing EMM failure from {}, its host is no longer tainted", pod.name_any());
                try_check!(spi.set_pod_annotation(pod, EMM_FAILURE_ANNOTATION, None).await);
            }
            ReconcileResult::RequeueSoon(EMM_REQUEUE_SECS)
        }
        EmmAction::AwaitFailureProcessing => {
            debug!("Waiting for refused EMM operations to be withdrawn");
            ReconcileResult::RequeueSoon(EMM_REQUEUE_SECS)
        }
        EmmAction::Skip => ReconcileResult::Continue,
        EmmAction::Fail {
            pods,
            reason,
            requeue_secs,
        } => {
            for pod in pods.iter().filter_map(|n| find(n)) {
                warn!(
                    "Refusing EMM for host {:?} of pod {}: {}",
                    host_of(pod),
                    pod.name_any(),
                    reason
                );
                try_check!(
                    spi.set_pod_annotation(pod, EMM_FAILURE_ANNOTATION, Some(reason.as_str()))
                        .await
                );
            }
            ReconcileResult::RequeueSoon(requeue_secs)
        }
        EmmAction::RemovePods(names) => {
            for pod in names.iter().filter_map(|n| find(n)) {
                info!("Removing pod {} from tainted host {:?}", pod.name_any(), host_of(pod));
                try_check!(spi.remove_pod(pod).await);
            }
            ReconcileResult::RequeueSoon(EMM_REQUEUE_SECS)
        }
        EmmAction::ReplaceNodes(names) => {
            for name in &names {
                info!("Replacing {}, its volume is pinned to an evacuating host", name);
                try_check!(spi.start_node_replace(name).await);
            }
            ReconcileResult::RequeueSoon(EMM_REQUEUE_SECS)
        }
    }
}
