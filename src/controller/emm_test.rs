//! Tests for host maintenance (EMM) arbitration

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use k8s_openapi::api::core::v1::Pod;
    use kube::ResourceExt;

    use crate::controller::conditions::{condition_true, set_condition};
    use crate::controller::context::Settings;
    use crate::controller::emm::{check_emm, decide, EmmAction, EmmView};
    use crate::controller::fakes::{datacenter, host, load_context, FakeMgmt, FakeOps};
    use crate::controller::pods::test_support::PodBuilder;
    use crate::controller::result::ReconcileResult;
    use crate::crd::{
        CassandraDatacenter, CassandraDatacenterStatus, DatacenterConditionType, EmmFailure,
        EmmTaintValue, NodeStatus, EMM_FAILURE_ANNOTATION,
    };

    fn pod_name(rack: &str, ordinal: i32) -> String {
        format!("cluster1-dc1-{rack}-sts-{ordinal}")
    }

    fn up(rack: &str, ordinal: i32, host: &str) -> Pod {
        PodBuilder::new(&pod_name(rack, ordinal), rack)
            .on_host(host)
            .running(true)
            .build()
    }

    fn down(rack: &str, ordinal: i32, host: &str) -> Pod {
        PodBuilder::new(&pod_name(rack, ordinal), rack)
            .on_host(host)
            .running(false)
            .build()
    }

    /// Initialized datacenter where every given pod has joined the ring
    fn initialized_dc(racks: &[&str], pods: &[&Pod]) -> CassandraDatacenter {
        let mut dc = datacenter(pods.len() as i32, racks);
        let mut status = CassandraDatacenterStatus::default();
        set_condition(
            &mut status.conditions,
            condition_true(DatacenterConditionType::Initialized),
        );
        status.node_statuses = pods
            .iter()
            .map(|p| {
                (
                    p.name_any(),
                    NodeStatus {
                        host_id: Some(format!("host-id-{}", p.name_any())),
                    },
                )
            })
            .collect();
        dc.status = Some(status);
        dc
    }

    fn failure_of(ops: &FakeOps, pod: &str) -> Option<String> {
        ops.pod(pod)
            .and_then(|p| p.annotations().get(EMM_FAILURE_ANNOTATION).cloned())
    }

    fn seed(ops: &FakeOps, pods: &[&Pod], spare_hosts: &[&str], tainted: &[(&str, EmmTaintValue)]) {
        let mut hosts: BTreeSet<String> = pods
            .iter()
            .filter_map(|p| p.spec.as_ref().and_then(|s| s.node_name.clone()))
            .collect();
        hosts.extend(spare_hosts.iter().map(|h| h.to_string()));
        for name in hosts {
            let taint = tainted.iter().find(|(h, _)| *h == name).map(|(_, t)| *t);
            ops.add_host(host(&name, taint));
        }
        for pod in pods {
            ops.add_pod((*pod).clone());
        }
    }

    #[tokio::test]
    async fn test_no_taints_and_no_down_nodes_is_a_noop() {
        let pods = [up("r1", 0, "h1"), up("r2", 0, "h2"), up("r3", 0, "h3")];
        let refs: Vec<&Pod> = pods.iter().collect();
        let ops = FakeOps::new();
        let mgmt = FakeMgmt::new();
        seed(&ops, &refs, &[], &[]);

        let mut ctx = load_context(
            initialized_dc(&["r1", "r2", "r3"], &refs),
            &ops,
            &mgmt,
            Settings::default(),
        )
        .await;

        assert!(matches!(check_emm(&mut ctx).await, ReconcileResult::Continue));
        assert!(ops.calls().is_empty());
    }

    #[tokio::test]
    async fn test_two_down_racks_fail_every_tainted_host() {
        let pods = [
            up("r1", 0, "h1"),
            down("r1", 1, "h2"),
            up("r2", 0, "h3"),
            down("r2", 1, "h4"),
            up("r3", 0, "h5"),
            up("r3", 1, "h6"),
        ];
        let refs: Vec<&Pod> = pods.iter().collect();
        let ops = FakeOps::new();
        let mgmt = FakeMgmt::new();
        seed(
            &ops,
            &refs,
            &["spare1", "spare2"],
            &[
                ("h5", EmmTaintValue::EvacuateAllData),
                ("h6", EmmTaintValue::PlannedDowntime),
            ],
        );

        let mut ctx = load_context(
            initialized_dc(&["r1", "r2", "r3"], &refs),
            &ops,
            &mgmt,
            Settings::default(),
        )
        .await;

        let result = check_emm(&mut ctx).await;
        assert!(matches!(result, ReconcileResult::RequeueSoon(_)));

        let reason = Some(EmmFailure::TooManyExistingFailures.as_str().to_string());
        assert_eq!(failure_of(&ops, &pod_name("r3", 0)), reason);
        assert_eq!(failure_of(&ops, &pod_name("r3", 1)), reason);
        assert_eq!(failure_of(&ops, &pod_name("r1", 0)), None);
        assert!(ops.calls().iter().all(|c| !c.starts_with("delete_pod")));
        assert!(ops.event_reasons().contains(&"EMMFailed".to_string()));
    }

    #[tokio::test]
    async fn test_one_down_rack_fails_only_hosts_outside_it() {
        let pods = [
            up("r1", 0, "h-shared"),
            down("r1", 1, "h1"),
            up("r2", 0, "h-other"),
            up("r3", 0, "h3"),
        ];
        let refs: Vec<&Pod> = pods.iter().collect();
        let ops = FakeOps::new();
        let mgmt = FakeMgmt::new();
        seed(
            &ops,
            &refs,
            &["spare1", "spare2"],
            &[
                ("h-shared", EmmTaintValue::EvacuateAllData),
                ("h-other", EmmTaintValue::EvacuateAllData),
            ],
        );

        let mut ctx = load_context(
            initialized_dc(&["r1", "r2", "r3"], &refs),
            &ops,
            &mgmt,
            Settings::default(),
        )
        .await;

        let result = check_emm(&mut ctx).await;
        assert!(matches!(result, ReconcileResult::RequeueSoon(2)));
        assert_eq!(
            failure_of(&ops, &pod_name("r2", 0)),
            Some(EmmFailure::TooManyExistingFailures.as_str().to_string())
        );
        assert_eq!(failure_of(&ops, &pod_name("r1", 0)), None);
        assert!(ops.pod(&pod_name("r1", 0)).is_some());
    }

    #[tokio::test]
    async fn test_healthy_cluster_evacuates_one_pod() {
        let pods = [
            up("r1", 0, "h1"),
            up("r1", 1, "h1"),
            up("r2", 0, "h2"),
        ];
        let refs: Vec<&Pod> = pods.iter().collect();
        let ops = FakeOps::new();
        let mgmt = FakeMgmt::new();
        seed(
            &ops,
            &refs,
            &["spare1", "spare2", "spare3"],
            &[("h1", EmmTaintValue::EvacuateAllData)],
        );

        let mut ctx = load_context(
            initialized_dc(&["r1", "r2"], &refs),
            &ops,
            &mgmt,
            Settings::default(),
        )
        .await;

        assert!(matches!(check_emm(&mut ctx).await, ReconcileResult::RequeueSoon(2)));
        let deletes: Vec<String> = ops
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("delete_pod"))
            .collect();
        assert_eq!(deletes, vec![format!("delete_pod {}", pod_name("r1", 0))]);
        assert!(mgmt.calls().contains(&format!("drain {}", pod_name("r1", 0))));
    }

    fn view(pods: Vec<Pod>) -> EmmView {
        let bootstrapped = pods.iter().map(|p| p.name_any()).collect();
        EmmView {
            pods,
            initialized: true,
            available_host_count: 10,
            bootstrapped,
            ..Default::default()
        }
    }

    #[test]
    fn test_planned_downtime_vacates_whole_host() {
        let mut v = view(vec![up("r1", 0, "h1"), up("r1", 1, "h1"), up("r2", 0, "h2")]);
        v.planned_downtime_hosts.insert("h1".to_string());

        assert_eq!(
            decide(&v),
            Some(EmmAction::RemovePods(vec![pod_name("r1", 0), pod_name("r1", 1)]))
        );
    }

    #[test]
    fn test_not_enough_capacity_fails_tainted_hosts() {
        let mut v = view(vec![up("r1", 0, "h1"), up("r2", 0, "h2"), up("r3", 0, "h3")]);
        v.evacuate_hosts.insert("h1".to_string());
        v.available_host_count = 2;

        assert_eq!(
            decide(&v),
            Some(EmmAction::Fail {
                pods: vec![pod_name("r1", 0)],
                reason: EmmFailure::NotEnoughResources,
                requeue_secs: 10,
            })
        );
    }

    #[test]
    fn test_stale_failure_is_cleared_first() {
        let stale = PodBuilder::new(&pod_name("r1", 0), "r1")
            .on_host("h1")
            .running(true)
            .annotation(EMM_FAILURE_ANNOTATION, "GenericFailure")
            .build();
        let v = view(vec![stale]);
        assert_eq!(
            decide(&v),
            Some(EmmAction::ClearFailures(vec![pod_name("r1", 0)]))
        );
    }

    #[test]
    fn test_pending_failure_blocks_further_action() {
        let failed = PodBuilder::new(&pod_name("r1", 0), "r1")
            .on_host("h1")
            .running(true)
            .annotation(EMM_FAILURE_ANNOTATION, "GenericFailure")
            .build();
        let mut v = view(vec![failed, up("r2", 0, "h2")]);
        v.evacuate_hosts.insert("h1".to_string());
        v.evacuate_hosts.insert("h2".to_string());
        assert_eq!(decide(&v), Some(EmmAction::AwaitFailureProcessing));
    }

    #[test]
    fn test_uninitialized_cluster_skips() {
        let mut v = view(vec![up("r1", 0, "h1")]);
        v.initialized = false;
        v.evacuate_hosts.insert("h1".to_string());
        assert_eq!(decide(&v), Some(EmmAction::Skip));
    }

    #[test]
    fn test_stopped_cluster_refuses_evacuation() {
        let mut v = view(vec![up("r1", 0, "h1")]);
        v.stopped = true;
        v.evacuate_hosts.insert("h1".to_string());
        assert!(matches!(
            decide(&v),
            Some(EmmAction::Fail { reason: EmmFailure::GenericFailure, .. })
        ));
    }

    #[test]
    fn test_pinned_down_pod_is_replaced() {
        let pinned = PodBuilder::new(&pod_name("r1", 1), "r1")
            .running(false)
            .unschedulable()
            .build();
        let mut v = view(vec![up("r1", 0, "h1"), pinned]);
        v.evacuate_hosts.insert("h-gone".to_string());
        v.pinned_hosts = BTreeMap::from([(pod_name("r1", 1), "h-gone".to_string())]);

        assert_eq!(
            decide(&v),
            Some(EmmAction::ReplaceNodes(vec![pod_name("r1", 1)]))
        );
    }

    #[test]
    fn test_two_down_racks_never_replace_pinned_pods() {
        let pinned = PodBuilder::new(&pod_name("r1", 1), "r1")
            .running(false)
            .unschedulable()
            .build();
        let mut v = view(vec![
            up("r1", 0, "h1"),
            pinned,
            up("r2", 0, "h3"),
            down("r2", 1, "h4"),
        ]);
        v.evacuate_hosts.insert("h-gone".to_string());
        v.pinned_hosts = BTreeMap::from([(pod_name("r1", 1), "h-gone".to_string())]);
        assert_eq!(v.down_racks().len(), 2);

        assert_eq!(decide(&v), Some(EmmAction::Skip));
    }

    #[test]
    fn test_two_down_racks_with_empty_tainted_host_stop_evaluation() {
        let mut v = view(vec![
            up("r1", 0, "h1"),
            down("r1", 1, "h2"),
            down("r2", 1, "h4"),
            up("r3", 0, "h5"),
        ]);
        v.planned_downtime_hosts.insert("h-empty".to_string());

        assert_eq!(decide(&v), Some(EmmAction::Skip));
    }

    #[test]
    fn test_down_rack_without_pinned_pods_skips() {
        let v = view(vec![up("r1", 0, "h1"), down("r1", 1, "h2"), up("r2", 0, "h3")]);
        assert_eq!(decide(&v), Some(EmmAction::Skip));
    }
}
