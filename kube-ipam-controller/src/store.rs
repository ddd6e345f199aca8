use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{DeleteParams, ListParams, PatchParams},
    Client,
};
use kube_ipam_core::{
    kubernetes::{
        is_conflict,
        operations::{
            annotate_resource, apply_cluster_resource, apply_cluster_resource_status,
            set_cluster_resource_finalizers, try_remove_cluster_resource,
        },
        GetApi,
    },
    lease::{LeaseKey, LeaseRecord},
    resources::crd::v1::{
        ip::{IpSpec, IpStatus, IP},
        subnet::{Subnet, SubnetStatus},
    },
    CONTROLLER_FIELD_MANAGER,
};
use log::debug;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("'{}' was modified concurrently!", .0)]
    Conflict(String),
    #[error("Couldn't reach the object store! Reason: {}", .0)]
    KubeApiError(kube::Error),
    #[error("Object store is unavailable! Reason: {}", .0)]
    Unavailable(String),
}

/// Durable side of the reconciliation: declarations' status and lease records.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn set_subnet_finalizers(&self, name: &str, finalizers: Vec<String>) -> Result<(), StoreError>;

    async fn write_subnet_status(&self, name: &str, status: &SubnetStatus) -> Result<(), StoreError>;

    /// Creates or updates the lease record along with its status.
    async fn write_lease(&self, spec: &IpSpec, status: &IpStatus) -> Result<(), StoreError>;

    /// Exposes the lease on the workload itself.
    async fn annotate_workload(
        &self,
        key: &LeaseKey,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), StoreError>;

    /// Removing a missing record isn't an error.
    async fn remove_lease(&self, key: &LeaseKey) -> Result<(), StoreError>;

    async fn recorded_leases(&self) -> Result<Vec<LeaseRecord>, StoreError>;
}

pub struct KubeObjectStore {
    client: Client,
    patch_params: PatchParams,
}

impl KubeObjectStore {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            patch_params: PatchParams::apply(CONTROLLER_FIELD_MANAGER).force(),
        }
    }
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn set_subnet_finalizers(&self, name: &str, finalizers: Vec<String>) -> Result<(), StoreError> {
        set_cluster_resource_finalizers::<Subnet>(&self.client, name, finalizers)
            .await
            .map_err(|error| map_kube_error(name, error))
    }

    async fn write_subnet_status(&self, name: &str, status: &SubnetStatus) -> Result<(), StoreError> {
        apply_cluster_resource_status::<Subnet, SubnetStatus>(
            &self.client,
            status,
            name,
            &self.patch_params,
        )
        .await
        .map_err(|error| map_kube_error(name, error))?;

        debug!("Subnet '{name}' status is now {:?}", status.state);

        Ok(())
    }

    async fn write_lease(&self, spec: &IpSpec, status: &IpStatus) -> Result<(), StoreError> {
        let name = spec.lease_key().record_name();
        let record = IP::new(&name, spec.clone());

        apply_cluster_resource(&self.client, &record, &self.patch_params)
            .await
            .map_err(|error| map_kube_error(&name, error))?;
        apply_cluster_resource_status::<IP, IpStatus>(&self.client, status, &name, &self.patch_params)
            .await
            .map_err(|error| map_kube_error(&name, error))?;

        Ok(())
    }

    async fn annotate_workload(
        &self,
        key: &LeaseKey,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        annotate_resource::<Pod>(&self.client, &key.name, &key.namespace, annotations)
            .await
            .map_err(|error| map_kube_error(&key.to_string(), error))
    }

    async fn remove_lease(&self, key: &LeaseKey) -> Result<(), StoreError> {
        let name = key.record_name();

        try_remove_cluster_resource::<IP>(&self.client, &name, &DeleteParams::background())
            .await
            .map_err(|error| map_kube_error(&name, error))
    }

    async fn recorded_leases(&self) -> Result<Vec<LeaseRecord>, StoreError> {
        let records = self
            .client
            .global_api::<IP>()
            .list(&ListParams::default())
            .await
            .map_err(|error| map_kube_error("leases", error))?;

        Ok(records
            .items
            .iter()
            .filter_map(IP::recorded_lease)
            .collect())
    }
}

fn map_kube_error(name: &str, error: kube::Error) -> StoreError {
    if is_conflict(&error) {
        return StoreError::Conflict(name.to_owned());
    }

    match error {
        kube::Error::Api(_) => StoreError::KubeApiError(error),
        other => StoreError::Unavailable(other.to_string()),
    }
}
