use std::{sync::Arc, time::Duration};

use futures::{Stream, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Pod, PodSpec, PodStatus};
use kube::{
    runtime::watcher::{self, watcher, Event},
    Client, ResourceExt,
};
use kube_ipam_core::{
    kubernetes::GetApi,
    lease::{LeaseKey, LeaseRequest},
    resources::{
        annotations::{
            ALLOCATED_ANNOTATION, IP_ADDRESS_ANNOTATION, LOGICAL_SWITCH_ANNOTATION,
            MAC_ADDRESS_ANNOTATION,
        },
        crd::v1::subnet::Subnet,
    },
};
use log::{debug, warn};

use crate::{cache::pod_lease_key, queue::WorkKey, reconciler::context::ReconcilerContext};

const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

pub async fn start_subnet_watcher(context: Arc<ReconcilerContext>, client: Client) {
    let events = watcher(client.global_api::<Subnet>(), watcher::Config::default());

    drive(events, "subnet", |event| handle_subnet_event(&context, event)).await
}

pub async fn start_pod_watcher(context: Arc<ReconcilerContext>, client: Client) {
    let events = watcher(client.global_api::<Pod>(), watcher::Config::default())
        .map_ok(|event| event.modify(strip_pod));

    drive(events, "pod", |event| handle_pod_event(&context, event)).await
}

async fn drive<K, S, F, Fut>(events: S, kind: &str, mut handle: F)
where
    S: Stream<Item = Result<Event<K>, watcher::Error>>,
    F: FnMut(Event<K>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut events = std::pin::pin!(events);

    while let Some(event) = events.next().await {
        match event {
            Ok(event) => handle(event).await,
            Err(error) => {
                // the watcher relists on its own once polled again
                warn!("Watching {kind} declarations failed! {error}");
                tokio::time::sleep(WATCH_RETRY_DELAY).await;
            }
        }
    }
}

/// Keeps only what a lease request is built from.
fn strip_pod(pod: &mut Pod) {
    pod.managed_fields_mut().clear();
    pod.labels_mut().clear();
    pod.finalizers_mut().clear();
    pod.owner_references_mut().clear();

    pod.spec = pod.spec.take().map(|spec| PodSpec {
        node_name: spec.node_name,
        host_network: spec.host_network,
        ..Default::default()
    });
    pod.status = pod.status.take().map(|status| PodStatus {
        phase: status.phase,
        ..Default::default()
    });
}

pub async fn handle_subnet_event(context: &ReconcilerContext, event: Event<Subnet>) {
    match event {
        Event::Applied(subnet) => {
            let name = subnet.name_any();

            if context.cache.subnets.apply(subnet).await {
                context.queue.add(WorkKey::Subnet(name)).await;
            }
        }
        Event::Deleted(subnet) => {
            context.cache.subnets.remove(&subnet).await;
            context.queue.add(WorkKey::Subnet(subnet.name_any())).await;
        }
        Event::Restarted(subnets) => {
            let current = subnets
                .iter()
                .map(|subnet| WorkKey::Subnet(subnet.name_any()))
                .collect::<Vec<_>>();
            let vanished = context.cache.subnets.replace(subnets).await;

            debug!(
                "Subnets relisted, {} present, {} gone",
                current.len(),
                vanished.len()
            );

            context
                .queue
                .add_all(vanished.into_iter().map(|reference| WorkKey::Subnet(reference.name)))
                .await;
            context.queue.add_all(current).await;
        }
    }
}

pub async fn handle_pod_event(context: &ReconcilerContext, event: Event<Pod>) {
    match event {
        Event::Applied(pod) => {
            let Some(key) = pod_key(&pod) else {
                return;
            };

            if context.cache.pods.apply(pod).await {
                context.queue.add(WorkKey::Lease(key)).await;
            }
        }
        Event::Deleted(pod) => {
            let Some(key) = pod_key(&pod) else {
                return;
            };

            context.cache.pods.remove(&pod).await;
            context.queue.add(WorkKey::Lease(key)).await;
        }
        Event::Restarted(pods) => {
            let mut current = Vec::new();

            for pod in pods.iter() {
                let Some(key) = pod_key(pod) else {
                    continue;
                };

                // pods that stopped needing an address only matter if they still hold one
                if lease_request(pod).is_some() || context.registry.locate(&key).await.is_some() {
                    current.push(WorkKey::Lease(key));
                }
            }

            let vanished = context.cache.pods.replace(pods).await;

            debug!(
                "Workloads relisted, {} to reconcile, {} gone",
                current.len(),
                vanished.len()
            );

            context
                .queue
                .add_all(
                    vanished
                        .iter()
                        .filter_map(pod_lease_key)
                        .map(WorkKey::Lease),
                )
                .await;
            context.queue.add_all(current).await;
        }
    }
}

fn pod_key(pod: &Pod) -> Option<LeaseKey> {
    Some(LeaseKey::new(
        pod.metadata.namespace.as_deref()?,
        pod.metadata.name.as_deref()?,
    ))
}

/// Lease request of a pod, `None` if it doesn't need a cluster address.
pub fn lease_request(pod: &Pod) -> Option<LeaseRequest> {
    let key = pod_key(pod)?;
    let runtime_handle = pod.metadata.uid.clone()?;

    if let Some(spec) = &pod.spec {
        if spec.host_network == Some(true) {
            return None;
        }
    }

    let finished = pod
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .is_some_and(|phase| phase == "Succeeded" || phase == "Failed");

    if finished {
        return None;
    }

    let annotations = pod.annotations();
    let hint = |name: &str| annotations.get(name).cloned();
    // the address and MAC of an allocated pod mirror its lease, they aren't requests
    let allocated = annotations
        .get(ALLOCATED_ANNOTATION)
        .is_some_and(|allocated| allocated == "true");
    let mirrored = |name: &str| match allocated {
        true => None,
        false => hint(name),
    };

    Some(LeaseRequest {
        key,
        runtime_handle,
        node: pod.spec.as_ref().and_then(|spec| spec.node_name.clone()),
        subnet: hint(LOGICAL_SWITCH_ANNOTATION),
        static_ip: mirrored(IP_ADDRESS_ANNOTATION),
        mac: mirrored(MAC_ADDRESS_ANNOTATION),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{Pod, PodSpec, PodStatus};
    use kube::{core::ObjectMeta, runtime::watcher::Event, ResourceExt};
    use kube_ipam_core::{
        lease::LeaseKey,
        resources::{
            annotations::{
                ALLOCATED_ANNOTATION, IP_ADDRESS_ANNOTATION, LOGICAL_SWITCH_ANNOTATION,
                MAC_ADDRESS_ANNOTATION,
            },
            crd::v1::subnet::{Subnet, SubnetSpec},
        },
    };

    use crate::{
        queue::WorkKey,
        reconciler::reconcile,
        testing::{default_subnet_spec, subnet_spec, Harness},
    };

    use super::{handle_pod_event, handle_subnet_event, lease_request, strip_pod};

    fn pod(name: &str, uid: &str, version: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some("default".to_owned()),
                uid: Some(uid.to_owned()),
                resource_version: Some(version.to_owned()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("node-1".to_owned()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn annotated(mut pod: Pod, annotations: &[(&str, &str)]) -> Pod {
        pod.metadata.annotations = Some(
            annotations
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect::<BTreeMap<_, _>>(),
        );
        pod
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

    async fn ready_subnet(harness: &Harness, name: &str, subnet: Subnet) {
        handle_subnet_event(&harness.context, Event::Applied(subnet)).await;
        reconcile(&harness.context, &WorkKey::Subnet(name.to_owned()))
            .await
            .unwrap();
    }

    fn versioned(name: &str, spec: SubnetSpec) -> Subnet {
        let mut subnet = Subnet::new(name, spec);
        subnet.metadata.resource_version = Some("1".to_owned());
        subnet.metadata.generation = Some(1);
        subnet
    }

    #[test]
    fn pod_maps_to_a_request() {
        let request = lease_request(&annotated(
            pod("a", "uid-a", "1"),
            &[
                (LOGICAL_SWITCH_ANNOTATION, "team"),
                (IP_ADDRESS_ANNOTATION, "10.16.0.20"),
            ],
        ))
        .unwrap();

        assert_eq!(request.key, LeaseKey::new("default", "a"));
        assert_eq!(request.runtime_handle, "uid-a");
        assert_eq!(request.node.as_deref(), Some("node-1"));
        assert_eq!(request.subnet.as_deref(), Some("team"));
        assert_eq!(request.static_ip.as_deref(), Some("10.16.0.20"));
        assert_eq!(request.mac, None);
    }

    #[test]
    fn allocated_pod_keeps_its_subnet_but_not_its_address() {
        let request = lease_request(&annotated(
            pod("a", "uid-a", "1"),
            &[
                (ALLOCATED_ANNOTATION, "true"),
                (LOGICAL_SWITCH_ANNOTATION, "team"),
                (IP_ADDRESS_ANNOTATION, "10.66.0.2"),
                (MAC_ADDRESS_ANNOTATION, "0a:00:00:00:00:01"),
            ],
        ))
        .unwrap();

        assert_eq!(request.subnet.as_deref(), Some("team"));
        assert_eq!(request.static_ip, None);
        assert_eq!(request.mac, None);
    }

    #[test]
    fn host_network_and_finished_pods_need_no_address() {
        let mut host = pod("a", "uid-a", "1");
        host.spec.as_mut().unwrap().host_network = Some(true);
        assert_eq!(lease_request(&host), None);

        let mut finished = pod("b", "uid-b", "1");
        finished.status = Some(PodStatus {
            phase: Some("Succeeded".to_owned()),
            ..Default::default()
        });
        assert_eq!(lease_request(&finished), None);

        let mut anonymous = pod("c", "uid-c", "1");
        anonymous.metadata.uid = None;
        assert_eq!(lease_request(&anonymous), None);
    }

    #[test]
    fn stripped_pod_maps_to_the_same_request() {
        let mut full = annotated(pod("a", "uid-a", "1"), &[(LOGICAL_SWITCH_ANNOTATION, "team")]);
        full.metadata.labels = Some([("app".to_owned(), "web".to_owned())].into());
        full.spec.as_mut().unwrap().service_account_name = Some("web".to_owned());

        let request = lease_request(&full);
        strip_pod(&mut full);

        assert_eq!(full.labels().len(), 0);
        assert_eq!(full.spec.as_ref().unwrap().service_account_name, None);
        assert_eq!(lease_request(&full), request);
    }

    #[tokio::test]
    async fn stale_pod_events_are_dropped() {
        let harness = Harness::new().await;
        let key = LeaseKey::new("default", "a");

        handle_pod_event(&harness.context, Event::Applied(pod("a", "uid-a", "5"))).await;
        handle_pod_event(&harness.context, Event::Applied(pod("a", "uid-old", "4"))).await;

        assert_eq!(
            harness.context.cache.workload(&key).unwrap().runtime_handle,
            "uid-a"
        );
        assert_eq!(drain(&harness).await, vec![WorkKey::Lease(key.clone())]);

        handle_pod_event(&harness.context, Event::Deleted(pod("a", "uid-a", "6"))).await;

        assert_eq!(harness.context.cache.workload(&key), None);
        assert_eq!(drain(&harness).await, vec![WorkKey::Lease(key)]);
    }

    #[tokio::test]
    async fn finished_pod_gives_up_its_request() {
        let harness = Harness::new().await;
        let key = LeaseKey::new("default", "a");

        handle_pod_event(&harness.context, Event::Applied(pod("a", "uid-a", "1"))).await;

        let mut finished = pod("a", "uid-a", "2");
        finished.status = Some(PodStatus {
            phase: Some("Failed".to_owned()),
            ..Default::default()
        });
        handle_pod_event(&harness.context, Event::Applied(finished)).await;

        assert_eq!(harness.context.cache.workload(&key), None);
        assert!(drain(&harness).await.contains(&WorkKey::Lease(key)));
    }

    #[tokio::test]
    async fn relist_queues_vanished_and_current_pods() {
        let harness = Harness::new().await;

        handle_pod_event(&harness.context, Event::Applied(pod("a", "uid-a", "1"))).await;
        drain(&harness).await;

        handle_pod_event(&harness.context, Event::Restarted(vec![pod("b", "uid-b", "2")])).await;

        let keys = drain(&harness).await;
        assert!(keys.contains(&WorkKey::Lease(LeaseKey::new("default", "a"))));
        assert!(keys.contains(&WorkKey::Lease(LeaseKey::new("default", "b"))));
        assert_eq!(
            harness
                .context
                .cache
                .workload(&LeaseKey::new("default", "a")),
            None
        );
    }

    #[tokio::test]
    async fn subnet_events_feed_the_cache() {
        let harness = Harness::new().await;
        let mut subnet = Subnet::new("ovn-default", default_subnet_spec("10.16.0.0/16"));
        subnet.metadata.resource_version = Some("3".to_owned());

        handle_subnet_event(&harness.context, Event::Applied(subnet.clone())).await;
        handle_subnet_event(&harness.context, Event::Applied(subnet.clone())).await;

        assert_eq!(
            drain(&harness).await,
            vec![WorkKey::Subnet("ovn-default".to_owned())]
        );

        handle_subnet_event(&harness.context, Event::Restarted(vec![])).await;

        assert!(harness.context.cache.subnet("ovn-default").is_none());
        assert_eq!(
            drain(&harness).await,
            vec![WorkKey::Subnet("ovn-default".to_owned())]
        );
    }

    #[tokio::test]
    async fn written_back_annotations_keep_a_single_lease() {
        let harness = Harness::new().await;
        let key = LeaseKey::new("default", "a");

        ready_subnet(
            &harness,
            "ovn-default",
            versioned("ovn-default", default_subnet_spec("10.16.0.0/16")),
        )
        .await;
        ready_subnet(&harness, "team", versioned("team", subnet_spec("10.66.0.0/24"))).await;

        let requested = annotated(pod("a", "uid-a", "1"), &[(LOGICAL_SWITCH_ANNOTATION, "team")]);
        handle_pod_event(&harness.context, Event::Applied(requested)).await;
        reconcile(&harness.context, &WorkKey::Lease(key.clone()))
            .await
            .unwrap();

        let first = harness.context.registry.locate(&key).await.unwrap();
        assert_eq!(first.subnet, "team");

        // the controller's own annotation patch comes back as a pod update
        let written = harness.store.annotations.lock().unwrap()[&key].clone();
        let mut updated = pod("a", "uid-a", "2");
        updated.metadata.annotations = Some(written);
        handle_pod_event(&harness.context, Event::Applied(updated)).await;
        reconcile(&harness.context, &WorkKey::Lease(key.clone()))
            .await
            .unwrap();

        assert_eq!(harness.context.registry.locate(&key).await, Some(first));
        assert_eq!(harness.context.registry.leases("team").await.unwrap().len(), 1);
        assert!(harness
            .context
            .registry
            .leases("ovn-default")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            harness.store.annotations.lock().unwrap()[&key][LOGICAL_SWITCH_ANNOTATION],
            "team"
        );
    }
}
