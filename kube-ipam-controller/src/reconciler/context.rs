use std::sync::Arc;

use kube_ipam_core::registry::SubnetRegistry;

use crate::{
    cache::DeclarationCache, control_plane::ControlPlane, queue::WorkQueue, store::ObjectStore,
};

use super::state::LeaseTracker;

pub struct ReconcilerContext {
    pub registry: SubnetRegistry,
    pub cache: DeclarationCache,
    pub queue: Arc<WorkQueue>,
    pub leases: LeaseTracker,
    pub store: Arc<dyn ObjectStore>,
    pub control_plane: Arc<dyn ControlPlane>,
}

impl ReconcilerContext {
    pub fn new(store: Arc<dyn ObjectStore>, control_plane: Arc<dyn ControlPlane>) -> Self {
        Self {
            registry: SubnetRegistry::new(),
            cache: DeclarationCache::default(),
            queue: Arc::new(WorkQueue::new()),
            leases: LeaseTracker::default(),
            store,
            control_plane,
        }
    }
}
