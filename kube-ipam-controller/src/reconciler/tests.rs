use std::net::Ipv4Addr;

use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, chrono::Utc};
use kube_ipam_core::{
    error::IpamError,
    ip::addrpair::IpAddrPair,
    lease::LeaseKey,
    resources::{
        annotations::IP_ADDRESS_ANNOTATION,
        crd::v1::{
            ip::{ErrorClass, LeaseState},
            subnet::{GatewayType, Subnet, SubnetSpec, SubnetState},
        },
        SUBNET_FINALIZER,
    },
};

use crate::{
    queue::WorkKey,
    testing::{default_subnet_spec, subnet_spec, workload, Harness},
};

use super::{error::ReconcilerError, reconcile, report_failure};

fn lease_key(name: &str) -> WorkKey {
    WorkKey::Lease(LeaseKey::new("default", name))
}

fn subnet_key(name: &str) -> WorkKey {
    WorkKey::Subnet(name.to_owned())
}

fn ipv4(a: u8, b: u8, c: u8, d: u8) -> IpAddrPair {
    IpAddrPair::from(Ipv4Addr::new(a, b, c, d))
}

async fn drain(harness: &Harness) -> Vec<WorkKey> {
    let mut keys = Vec::new();

    while harness.context.queue.queued().await > 0 {
        if let Some(key) = harness.context.queue.next().await {
            harness.context.queue.done(&key).await;
            keys.push(key);
        }
    }

    keys
}

async fn ready_default_subnet(harness: &Harness, spec: SubnetSpec) {
    harness.declare_subnet("ovn-default", spec, 1).await;
    reconcile(&harness.context, &subnet_key("ovn-default"))
        .await
        .unwrap();
}

async fn published_address(harness: &Harness, name: &str) -> Option<IpAddrPair> {
    harness
        .context
        .registry
        .locate(&LeaseKey::new("default", name))
        .await
        .map(|lease| lease.address)
}

/// Leases the identity holds, summed over every registered subnet.
async fn lease_count(harness: &Harness, name: &str) -> usize {
    let key = LeaseKey::new("default", name);
    let mut count = 0;

    for declaration in harness.context.registry.declarations().await {
        count += harness
            .context
            .registry
            .leases(&declaration.name)
            .await
            .unwrap_or_default()
            .iter()
            .filter(|lease| lease.key == key)
            .count();
    }

    count
}

#[tokio::test]
async fn subnet_becomes_ready_and_protected() {
    let harness = Harness::new().await;

    ready_default_subnet(&harness, default_subnet_spec("10.16.0.0/16")).await;

    assert!(harness.context.registry.contains("ovn-default").await);

    let descriptor = harness.control_plane.subnets.lock().unwrap()["ovn-default"].clone();
    assert_eq!(descriptor.gateway, ipv4(10, 16, 0, 1));

    assert_eq!(
        harness.store.finalizers.lock().unwrap()["ovn-default"],
        vec![SUBNET_FINALIZER.to_owned()]
    );

    let status = harness.store.subnet_status("ovn-default").unwrap();
    assert_eq!(status.state, SubnetState::Ready);
    assert_eq!(status.observed_version, Some(1));
    assert_eq!(status.leased, 0);
}

#[tokio::test]
async fn workloads_get_consecutive_addresses_after_the_gateway() {
    let harness = Harness::new().await;
    ready_default_subnet(&harness, default_subnet_spec("10.16.0.0/16")).await;

    harness.declare_workload(workload("default", "a", "uid-a"), 1).await;
    harness.declare_workload(workload("default", "b", "uid-b"), 1).await;

    reconcile(&harness.context, &lease_key("a")).await.unwrap();
    reconcile(&harness.context, &lease_key("a")).await.unwrap();
    reconcile(&harness.context, &lease_key("b")).await.unwrap();

    assert_eq!(published_address(&harness, "a").await, Some(ipv4(10, 16, 0, 2)));
    assert_eq!(published_address(&harness, "b").await, Some(ipv4(10, 16, 0, 3)));

    let key = LeaseKey::new("default", "a");
    let status = harness.store.lease_status(&key).unwrap();
    assert_eq!(status.state, LeaseState::Published);
    assert_eq!(status.address, Some(ipv4(10, 16, 0, 2)));
    assert_eq!(
        harness.store.annotations.lock().unwrap()[&key][IP_ADDRESS_ANNOTATION],
        "10.16.0.2"
    );

    // the repeated reconciliation didn't publish again
    let publications = harness
        .store
        .lease_history
        .lock()
        .unwrap()
        .iter()
        .filter(|(history_key, _)| *history_key == key)
        .count();
    assert_eq!(publications, 1);
    assert_eq!(
        harness.context.leases.state(&key).await,
        Some(LeaseState::Published)
    );
}

#[tokio::test]
async fn excluded_addresses_are_skipped() {
    let harness = Harness::new().await;
    let mut spec = default_subnet_spec("10.16.0.0/16");
    spec.exclude_ips = vec!["10.16.0.2".to_owned()];
    ready_default_subnet(&harness, spec).await;

    harness.declare_workload(workload("default", "a", "uid-a"), 1).await;
    reconcile(&harness.context, &lease_key("a")).await.unwrap();

    assert_eq!(published_address(&harness, "a").await, Some(ipv4(10, 16, 0, 3)));
}

#[tokio::test]
async fn stale_lease_is_reclaimed_and_reissued() {
    let harness = Harness::new().await;
    ready_default_subnet(&harness, default_subnet_spec("10.16.0.0/16")).await;

    harness.declare_workload(workload("default", "a", "uid-1"), 1).await;
    reconcile(&harness.context, &lease_key("a")).await.unwrap();

    harness.declare_workload(workload("default", "a", "uid-2"), 2).await;
    reconcile(&harness.context, &lease_key("a")).await.unwrap();

    let key = LeaseKey::new("default", "a");
    let lease = harness.context.registry.locate(&key).await.unwrap();
    assert_eq!(lease.runtime_handle, "uid-2");
    assert_eq!(
        harness
            .store
            .lease_history
            .lock()
            .unwrap()
            .iter()
            .map(|(_, state)| *state)
            .collect::<Vec<_>>(),
        vec![LeaseState::Published, LeaseState::Stale, LeaseState::Published]
    );
}

#[tokio::test]
async fn deleted_workload_returns_its_address() {
    let harness = Harness::new().await;
    ready_default_subnet(&harness, default_subnet_spec("10.16.0.0/16")).await;

    harness.declare_workload(workload("default", "a", "uid-a"), 1).await;
    reconcile(&harness.context, &lease_key("a")).await.unwrap();
    drain(&harness).await;

    let key = LeaseKey::new("default", "a");
    harness.remove_workload(&key, 2).await;
    reconcile(&harness.context, &lease_key("a")).await.unwrap();

    assert_eq!(harness.context.registry.locate(&key).await, None);
    assert!(harness.store.lease_status(&key).is_none());
    assert!(!harness.control_plane.leases.lock().unwrap().contains_key(&key));
    assert_eq!(harness.context.leases.state(&key).await, None);
    assert!(drain(&harness).await.contains(&subnet_key("ovn-default")));

    // a second release is a no-op
    reconcile(&harness.context, &lease_key("a")).await.unwrap();
}

#[tokio::test]
async fn unbound_namespace_fails_terminally_until_a_subnet_appears() {
    let harness = Harness::new().await;
    let mut spec = subnet_spec("10.66.0.0/24");
    spec.namespaces = vec!["team-a".to_owned()];
    harness.declare_subnet("team", spec, 1).await;
    reconcile(&harness.context, &subnet_key("team")).await.unwrap();

    harness.declare_workload(workload("default", "a", "uid-a"), 1).await;
    let error = reconcile(&harness.context, &lease_key("a"))
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        ReconcilerError::Ipam(IpamError::NoSubnetBound(_))
    ));
    assert_eq!(error.class(), ErrorClass::Terminal);

    report_failure(&harness.context, &lease_key("a"), &error, 1, false).await;

    let status = harness
        .store
        .lease_status(&LeaseKey::new("default", "a"))
        .unwrap();
    assert_eq!(status.state, LeaseState::Failed);
    assert_eq!(status.error_class, Some(ErrorClass::Terminal));
    drain(&harness).await;

    ready_default_subnet(&harness, default_subnet_spec("10.16.0.0/16")).await;

    assert!(drain(&harness).await.contains(&lease_key("a")));
    reconcile(&harness.context, &lease_key("a")).await.unwrap();
    assert_eq!(published_address(&harness, "a").await, Some(ipv4(10, 16, 0, 2)));
}

#[tokio::test]
async fn exhaustion_is_retried_and_visible_as_pending() {
    let harness = Harness::new().await;
    ready_default_subnet(&harness, default_subnet_spec("192.168.0.0/30")).await;

    harness.declare_workload(workload("default", "a", "uid-a"), 1).await;
    harness.declare_workload(workload("default", "b", "uid-b"), 1).await;
    reconcile(&harness.context, &lease_key("a")).await.unwrap();

    let error = reconcile(&harness.context, &lease_key("b"))
        .await
        .unwrap_err();
    assert_eq!(error.class(), ErrorClass::Retryable);

    report_failure(&harness.context, &lease_key("b"), &error, 2, false).await;

    let status = harness
        .store
        .lease_status(&LeaseKey::new("default", "b"))
        .unwrap();
    assert_eq!(status.state, LeaseState::Pending);
    assert_eq!(status.attempts, 2);
    assert_eq!(status.error_class, Some(ErrorClass::Retryable));
}

#[tokio::test]
async fn static_request_outside_the_range_is_terminal() {
    let harness = Harness::new().await;
    ready_default_subnet(&harness, default_subnet_spec("10.16.0.0/16")).await;

    let mut request = workload("default", "a", "uid-a");
    request.static_ip = Some("10.17.0.5".to_owned());
    harness.declare_workload(request, 1).await;

    let error = reconcile(&harness.context, &lease_key("a"))
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        ReconcilerError::Ipam(IpamError::OutOfRange { .. })
    ));
    assert_eq!(error.class(), ErrorClass::Terminal);
}

#[tokio::test]
async fn control_plane_failure_is_retried_without_losing_the_address() {
    let harness = Harness::new().await;
    ready_default_subnet(&harness, default_subnet_spec("10.16.0.0/16")).await;
    harness.declare_workload(workload("default", "a", "uid-a"), 1).await;

    harness.control_plane.failures.fail_next(1);
    let error = reconcile(&harness.context, &lease_key("a"))
        .await
        .unwrap_err();

    assert!(matches!(error, ReconcilerError::ControlPlane(_)));
    assert_eq!(error.class(), ErrorClass::Retryable);

    let key = LeaseKey::new("default", "a");
    assert_eq!(
        harness.context.leases.state(&key).await,
        Some(LeaseState::Allocated)
    );

    reconcile(&harness.context, &lease_key("a")).await.unwrap();

    assert_eq!(published_address(&harness, "a").await, Some(ipv4(10, 16, 0, 2)));
    assert!(harness.control_plane.leases.lock().unwrap().contains_key(&key));
}

#[tokio::test]
async fn subnet_deletion_waits_for_its_leases() {
    let harness = Harness::new().await;
    ready_default_subnet(&harness, default_subnet_spec("10.16.0.0/16")).await;
    harness.declare_workload(workload("default", "a", "uid-a"), 1).await;
    reconcile(&harness.context, &lease_key("a")).await.unwrap();

    let mut deleted = Subnet::new("ovn-default", default_subnet_spec("10.16.0.0/16"));
    deleted.metadata.resource_version = Some("2".to_owned());
    deleted.metadata.generation = Some(1);
    deleted.metadata.deletion_timestamp = Some(Time(Utc::now()));
    deleted.metadata.finalizers = Some(vec![SUBNET_FINALIZER.to_owned(), "other/keep".to_owned()]);
    harness.context.cache.subnets.apply(deleted).await;

    let error = reconcile(&harness.context, &subnet_key("ovn-default"))
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        ReconcilerError::Ipam(IpamError::SubnetInUse { leases: 1, .. })
    ));
    assert_eq!(
        harness.store.subnet_status("ovn-default").unwrap().state,
        SubnetState::ErrorInUse
    );
    assert!(harness.context.registry.contains("ovn-default").await);

    harness
        .remove_workload(&LeaseKey::new("default", "a"), 2)
        .await;
    reconcile(&harness.context, &lease_key("a")).await.unwrap();
    assert!(drain(&harness).await.contains(&subnet_key("ovn-default")));

    reconcile(&harness.context, &subnet_key("ovn-default"))
        .await
        .unwrap();

    assert!(!harness.context.registry.contains("ovn-default").await);
    assert!(!harness
        .control_plane
        .subnets
        .lock()
        .unwrap()
        .contains_key("ovn-default"));
    assert_eq!(
        harness.store.finalizers.lock().unwrap()["ovn-default"],
        vec!["other/keep".to_owned()]
    );
}

#[tokio::test]
async fn invalid_declaration_is_reported() {
    let harness = Harness::new().await;
    let spec = SubnetSpec {
        gateway_type: GatewayType::Centralized,
        ..subnet_spec("10.16.0.0/16")
    };
    harness.declare_subnet("broken", spec, 1).await;

    let error = reconcile(&harness.context, &subnet_key("broken"))
        .await
        .unwrap_err();

    assert_eq!(error.class(), ErrorClass::Terminal);
    assert!(!harness.context.registry.contains("broken").await);
    assert_eq!(
        harness.store.subnet_status("broken").unwrap().state,
        SubnetState::ErrorInvalidSpec
    );
}

#[tokio::test]
async fn second_default_subnet_is_rejected() {
    let harness = Harness::new().await;
    ready_default_subnet(&harness, default_subnet_spec("10.16.0.0/16")).await;
    harness
        .declare_subnet("other", default_subnet_spec("10.17.0.0/16"), 1)
        .await;

    let error = reconcile(&harness.context, &subnet_key("other"))
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        ReconcilerError::Ipam(IpamError::InvalidSubnetSpec(_))
    ));
    assert_eq!(
        harness.store.subnet_status("other").unwrap().state,
        SubnetState::ErrorInvalidSpec
    );
}

#[tokio::test]
async fn private_subnet_lists_only_known_peers() {
    let harness = Harness::new().await;
    harness.declare_subnet("a", subnet_spec("10.1.0.0/24"), 1).await;
    reconcile(&harness.context, &subnet_key("a")).await.unwrap();

    let spec = SubnetSpec {
        private: true,
        allow_subnets: vec!["a".to_owned(), "ghost".to_owned()],
        ..subnet_spec("10.4.0.0/24")
    };
    harness.declare_subnet("d", spec, 1).await;
    reconcile(&harness.context, &subnet_key("d")).await.unwrap();

    assert_eq!(
        harness.control_plane.subnets.lock().unwrap()["d"].allowed_peers,
        vec!["a".to_owned()]
    );
    drain(&harness).await;

    harness
        .declare_subnet("ghost", subnet_spec("10.5.0.0/24"), 1)
        .await;
    reconcile(&harness.context, &subnet_key("ghost")).await.unwrap();
    assert!(drain(&harness).await.contains(&subnet_key("d")));

    reconcile(&harness.context, &subnet_key("d")).await.unwrap();
    assert_eq!(
        harness.control_plane.subnets.lock().unwrap()["d"].allowed_peers,
        vec!["a".to_owned(), "ghost".to_owned()]
    );
}

#[tokio::test]
async fn workload_moving_subnets_releases_the_old_lease() {
    let harness = Harness::new().await;
    harness.declare_subnet("a", subnet_spec("10.1.0.0/24"), 1).await;
    harness.declare_subnet("b", subnet_spec("10.2.0.0/24"), 1).await;
    reconcile(&harness.context, &subnet_key("a")).await.unwrap();
    reconcile(&harness.context, &subnet_key("b")).await.unwrap();

    let mut request = workload("default", "p", "uid-p");
    request.subnet = Some("a".to_owned());
    harness.declare_workload(request.clone(), 1).await;
    reconcile(&harness.context, &lease_key("p")).await.unwrap();

    request.subnet = Some("b".to_owned());
    harness.declare_workload(request, 2).await;
    reconcile(&harness.context, &lease_key("p")).await.unwrap();

    assert_eq!(published_address(&harness, "p").await, Some(ipv4(10, 2, 0, 2)));
    assert_eq!(harness.context.registry.usage("a").await.unwrap().leased, 0);
    assert_eq!(harness.context.registry.usage("b").await.unwrap().leased, 1);
}

#[tokio::test]
async fn held_lease_stays_put_when_the_namespace_is_rebound() {
    let harness = Harness::new().await;
    ready_default_subnet(&harness, default_subnet_spec("10.16.0.0/16")).await;
    harness.declare_workload(workload("default", "a", "uid-a"), 1).await;
    reconcile(&harness.context, &lease_key("a")).await.unwrap();

    let mut spec = subnet_spec("10.66.0.0/24");
    spec.namespaces = vec!["default".to_owned()];
    harness.declare_subnet("team", spec, 1).await;
    reconcile(&harness.context, &subnet_key("team")).await.unwrap();

    reconcile(&harness.context, &lease_key("a")).await.unwrap();

    assert_eq!(published_address(&harness, "a").await, Some(ipv4(10, 16, 0, 2)));
    assert_eq!(lease_count(&harness, "a").await, 1);
    assert_eq!(harness.context.registry.usage("team").await.unwrap().leased, 0);

    // new workloads follow the binding
    harness.declare_workload(workload("default", "b", "uid-b"), 1).await;
    reconcile(&harness.context, &lease_key("b")).await.unwrap();

    assert_eq!(published_address(&harness, "b").await, Some(ipv4(10, 66, 0, 2)));
    assert_eq!(lease_count(&harness, "b").await, 1);

    // the old subnet can be deleted once its last lease is gone
    harness
        .remove_workload(&LeaseKey::new("default", "a"), 2)
        .await;
    reconcile(&harness.context, &lease_key("a")).await.unwrap();

    assert_eq!(lease_count(&harness, "a").await, 0);
    assert_eq!(harness.context.registry.usage("ovn-default").await.unwrap().leased, 0);
}
