use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use k8s_openapi::api::core::v1::Pod;
use kube::{
    runtime::{
        reflector::{self, store::Writer, ObjectRef, Store},
        watcher::Event,
    },
    Resource, ResourceExt,
};
use kube_ipam_core::{
    helpers::version_token,
    lease::{LeaseKey, LeaseRequest},
    resources::crd::v1::subnet::Subnet,
};
use log::trace;
use tokio::sync::Mutex;

use crate::watch::lease_request;

/// Reflector store that only takes updates newer than what it holds. A zero
/// version is treated as unknown and always accepted.
pub struct VersionedCache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store: Store<K>,
    writer: Mutex<Writer<K>>,
    synced: AtomicBool,
}

/// Every declaration the reconcilers work from.
#[derive(Default)]
pub struct DeclarationCache {
    pub subnets: VersionedCache<Subnet>,
    pub pods: VersionedCache<Pod>,
}

impl<K> Default for VersionedCache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    fn default() -> Self {
        let (store, writer) = reflector::store();

        Self {
            store,
            writer: Mutex::new(writer),
            synced: AtomicBool::new(false),
        }
    }
}

impl<K> VersionedCache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    /// Stores the object, returns false if it was discarded as stale.
    pub async fn apply(&self, object: K) -> bool {
        let mut writer = self.writer.lock().await;
        let reference = ObjectRef::from_obj(&object);
        let version = version_token(&object);

        if let Some(current) = self.store.get(&reference) {
            let current = version_token(current.as_ref());

            if version != 0 && current >= version {
                trace!("Discarding {reference} version {version}, {current} is cached");
                return false;
            }
        }

        writer.apply_watcher_event(&Event::Applied(object));
        true
    }

    /// Removes the object unless a newer version is cached.
    pub async fn remove(&self, object: &K) -> bool {
        let mut writer = self.writer.lock().await;
        let reference = ObjectRef::from_obj(object);
        let version = version_token(object);

        match self.store.get(&reference) {
            Some(current) if version != 0 && version_token(current.as_ref()) > version => false,
            Some(_) => {
                writer.apply_watcher_event(&Event::Deleted(object.clone()));
                true
            }
            None => false,
        }
    }

    /// Replaces the whole store after a relist, returning the objects that are gone.
    pub async fn replace(&self, objects: Vec<K>) -> Vec<ObjectRef<K>> {
        let mut writer = self.writer.lock().await;
        let relisted = objects.iter().map(ObjectRef::from_obj).collect::<HashSet<_>>();
        let vanished = self
            .store
            .state()
            .iter()
            .map(|object| ObjectRef::from_obj(object.as_ref()))
            .filter(|reference| !relisted.contains(reference))
            .collect();

        writer.apply_watcher_event(&Event::Restarted(objects));
        self.synced.store(true, Ordering::SeqCst);

        vanished
    }

    pub fn get(&self, reference: &ObjectRef<K>) -> Option<Arc<K>> {
        self.store.get(reference)
    }

    pub fn state(&self) -> Vec<Arc<K>> {
        self.store.state()
    }

    /// Whether a full listing has been observed at least once.
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

impl DeclarationCache {
    pub fn subnet(&self, name: &str) -> Option<Arc<Subnet>> {
        self.subnets.get(&ObjectRef::new(name))
    }

    pub fn subnet_names(&self) -> Vec<String> {
        self.subnets
            .state()
            .iter()
            .map(|subnet| subnet.name_any())
            .collect()
    }

    /// Lease request of the cached workload, `None` if it's gone or needs no address.
    pub fn workload(&self, key: &LeaseKey) -> Option<LeaseRequest> {
        let pod = self
            .pods
            .get(&ObjectRef::new(&key.name).within(&key.namespace))?;

        lease_request(&pod)
    }

    pub fn workload_keys(&self) -> Vec<LeaseKey> {
        self.pods
            .state()
            .iter()
            .filter_map(|pod| lease_request(pod))
            .map(|request| request.key)
            .collect()
    }

    pub fn workloads_synced(&self) -> bool {
        self.pods.is_synced()
    }
}

pub fn pod_lease_key(reference: &ObjectRef<Pod>) -> Option<LeaseKey> {
    Some(LeaseKey::new(reference.namespace.as_deref()?, &reference.name))
}
