use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodSpec};
use kube::core::ObjectMeta;
use kube_ipam_core::{
    lease::{LeaseKey, LeaseRecord, LeaseRequest, LeaseRequestBuilder},
    resources::{
        annotations::{IP_ADDRESS_ANNOTATION, LOGICAL_SWITCH_ANNOTATION, MAC_ADDRESS_ANNOTATION},
        crd::v1::{
            ip::{IpSpec, IpStatus, LeaseState},
            subnet::{Subnet, SubnetSpec, SubnetStatus},
        },
    },
};

use crate::{
    control_plane::{ControlPlane, ControlPlaneError, LeaseDescriptor, SubnetDescriptor},
    reconciler::context::ReconcilerContext,
    store::{ObjectStore, StoreError},
};

/// Fails the next `n` calls made to a fake.
#[derive(Default)]
pub struct FailureInjector(AtomicU32);

impl FailureInjector {
    pub fn fail_next(&self, calls: u32) {
        self.0.store(calls, Ordering::SeqCst);
    }

    fn should_fail(&self) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[derive(Default)]
pub struct FakeObjectStore {
    pub finalizers: Mutex<HashMap<String, Vec<String>>>,
    pub subnet_statuses: Mutex<HashMap<String, SubnetStatus>>,
    pub leases: Mutex<HashMap<LeaseKey, (IpSpec, IpStatus)>>,
    pub lease_history: Mutex<Vec<(LeaseKey, LeaseState)>>,
    pub annotations: Mutex<HashMap<LeaseKey, BTreeMap<String, String>>>,
    pub recorded: Mutex<Vec<LeaseRecord>>,
    pub failures: FailureInjector,
}

#[derive(Default)]
pub struct FakeControlPlane {
    pub subnets: Mutex<HashMap<String, SubnetDescriptor>>,
    pub leases: Mutex<HashMap<LeaseKey, LeaseDescriptor>>,
    pub failures: FailureInjector,
}

impl FakeObjectStore {
    pub fn lease_status(&self, key: &LeaseKey) -> Option<IpStatus> {
        self.leases
            .lock()
            .unwrap()
            .get(key)
            .map(|(_, status)| status.clone())
    }

    pub fn subnet_status(&self, name: &str) -> Option<SubnetStatus> {
        self.subnet_statuses.lock().unwrap().get(name).cloned()
    }

    fn check(&self, name: &str) -> Result<(), StoreError> {
        match self.failures.should_fail() {
            true => Err(StoreError::Unavailable(format!("injected failure for '{name}'"))),
            false => Ok(()),
        }
    }
}

impl FakeControlPlane {
    fn check(&self, name: &str) -> Result<(), ControlPlaneError> {
        match self.failures.should_fail() {
            true => Err(ControlPlaneError::Unreachable(format!(
                "injected failure for '{name}'"
            ))),
            false => Ok(()),
        }
    }
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn set_subnet_finalizers(&self, name: &str, finalizers: Vec<String>) -> Result<(), StoreError> {
        self.check(name)?;
        self.finalizers
            .lock()
            .unwrap()
            .insert(name.to_owned(), finalizers);

        Ok(())
    }

    async fn write_subnet_status(&self, name: &str, status: &SubnetStatus) -> Result<(), StoreError> {
        self.check(name)?;
        self.subnet_statuses
            .lock()
            .unwrap()
            .insert(name.to_owned(), status.clone());

        Ok(())
    }

    async fn write_lease(&self, spec: &IpSpec, status: &IpStatus) -> Result<(), StoreError> {
        let key = spec.lease_key();

        self.check(&key.record_name())?;
        self.lease_history
            .lock()
            .unwrap()
            .push((key.clone(), status.state));
        self.leases
            .lock()
            .unwrap()
            .insert(key, (spec.clone(), status.clone()));

        Ok(())
    }

    async fn annotate_workload(
        &self,
        key: &LeaseKey,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        self.check(&key.to_string())?;
        self.annotations
            .lock()
            .unwrap()
            .insert(key.clone(), annotations.clone());

        Ok(())
    }

    async fn remove_lease(&self, key: &LeaseKey) -> Result<(), StoreError> {
        self.check(&key.record_name())?;
        self.leases.lock().unwrap().remove(key);

        Ok(())
    }

    async fn recorded_leases(&self) -> Result<Vec<LeaseRecord>, StoreError> {
        self.check("leases")?;

        Ok(self.recorded.lock().unwrap().clone())
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn apply_subnet(&self, subnet: &SubnetDescriptor) -> Result<(), ControlPlaneError> {
        self.check(&subnet.name)?;
        self.subnets
            .lock()
            .unwrap()
            .insert(subnet.name.clone(), subnet.clone());

        Ok(())
    }

    async fn remove_subnet(&self, name: &str) -> Result<(), ControlPlaneError> {
        self.check(name)?;
        self.subnets.lock().unwrap().remove(name);

        Ok(())
    }

    async fn apply_lease(&self, lease: &LeaseDescriptor) -> Result<(), ControlPlaneError> {
        self.check(&lease.key.to_string())?;
        self.leases
            .lock()
            .unwrap()
            .insert(lease.key.clone(), lease.clone());

        Ok(())
    }

    async fn remove_lease(&self, key: &LeaseKey, _subnet: &str) -> Result<(), ControlPlaneError> {
        self.check(&key.to_string())?;
        self.leases.lock().unwrap().remove(key);

        Ok(())
    }
}

pub struct Harness {
    pub context: Arc<ReconcilerContext>,
    pub store: Arc<FakeObjectStore>,
    pub control_plane: Arc<FakeControlPlane>,
}

impl Harness {
    pub async fn new() -> Self {
        let store = Arc::new(FakeObjectStore::default());
        let control_plane = Arc::new(FakeControlPlane::default());
        let context = Arc::new(ReconcilerContext::new(store.clone(), control_plane.clone()));

        context.cache.pods.replace(vec![]).await;

        Self {
            context,
            store,
            control_plane,
        }
    }

    pub async fn declare_subnet(&self, name: &str, spec: SubnetSpec, version: u64) {
        let mut subnet = Subnet::new(name, spec);
        subnet.metadata.resource_version = Some(version.to_string());
        subnet.metadata.generation = Some(version as i64);

        self.context.cache.subnets.apply(subnet).await;
    }

    pub async fn declare_workload(&self, request: LeaseRequest, version: u64) {
        self.context
            .cache
            .pods
            .apply(workload_pod(&request, version))
            .await;
    }

    pub async fn remove_workload(&self, key: &LeaseKey, version: u64) {
        let pod = Pod {
            metadata: workload_meta(key, version),
            ..Default::default()
        };

        self.context.cache.pods.remove(&pod).await;
    }
}

fn workload_meta(key: &LeaseKey, version: u64) -> ObjectMeta {
    ObjectMeta {
        name: Some(key.name.clone()),
        namespace: Some(key.namespace.clone()),
        resource_version: Some(version.to_string()),
        ..Default::default()
    }
}

/// Pod that maps back to `request`, its hints carried as annotations.
pub fn workload_pod(request: &LeaseRequest, version: u64) -> Pod {
    let annotations = [
        (LOGICAL_SWITCH_ANNOTATION, &request.subnet),
        (IP_ADDRESS_ANNOTATION, &request.static_ip),
        (MAC_ADDRESS_ANNOTATION, &request.mac),
    ]
    .into_iter()
    .filter_map(|(name, value)| Some((name.to_owned(), value.clone()?)))
    .collect::<BTreeMap<_, _>>();

    Pod {
        metadata: ObjectMeta {
            uid: Some(request.runtime_handle.clone()),
            annotations: Some(annotations),
            ..workload_meta(&request.key, version)
        },
        spec: Some(PodSpec {
            node_name: request.node.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn subnet_spec(cidr: &str) -> SubnetSpec {
    SubnetSpec {
        cidr_block: cidr.to_owned(),
        ..Default::default()
    }
}

pub fn default_subnet_spec(cidr: &str) -> SubnetSpec {
    SubnetSpec {
        default: true,
        ..subnet_spec(cidr)
    }
}

pub fn workload(namespace: &str, name: &str, uid: &str) -> LeaseRequest {
    LeaseRequestBuilder::default()
        .key(LeaseKey::new(namespace, name))
        .runtime_handle(uid)
        .node("node-1")
        .build()
        .unwrap()
}
