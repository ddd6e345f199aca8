use kube_ipam_core::{
    helpers::version_token,
    resources::crd::v1::{
        ip::{ErrorClass, IpSpec, IpStatus, LeaseState},
        subnet::{SubnetState, SubnetStatus},
    },
};
use log::warn;

use crate::queue::WorkKey;

use self::{
    context::ReconcilerContext, error::ReconcilerError, lease::reconcile_lease,
    subnet::reconcile_subnet,
};

pub mod context;
pub mod error;
pub mod lease;
pub mod state;
pub mod subnet;

pub async fn reconcile(context: &ReconcilerContext, key: &WorkKey) -> Result<(), ReconcilerError> {
    match key {
        WorkKey::Subnet(name) => reconcile_subnet(context, name).await,
        WorkKey::Lease(lease_key) => reconcile_lease(context, lease_key).await,
    }
}

/// Makes a failure visible on the declaration. Retryable failures that still
/// have attempts left keep the request pending with its attempt count.
pub async fn report_failure(
    context: &ReconcilerContext,
    key: &WorkKey,
    error: &ReconcilerError,
    attempts: u32,
    gave_up: bool,
) {
    let class = error.class();
    let result = match key {
        WorkKey::Lease(lease_key) => {
            let spec = match context.registry.locate(lease_key).await {
                Some(lease) => IpSpec::from_lease(&lease),
                None => match context.cache.workload(lease_key) {
                    Some(request) => IpSpec::from_request(&request),
                    None => return,
                },
            };
            let state = match class {
                ErrorClass::Retryable if !gave_up => LeaseState::Pending,
                _ => LeaseState::Failed,
            };

            context.leases.transition(lease_key, state).await;
            context
                .store
                .write_lease(
                    &spec,
                    &IpStatus::with_error(state, error.to_string(), class, attempts),
                )
                .await
        }
        WorkKey::Subnet(name) => {
            // terminal subnet failures are written by the reconciler itself
            if !gave_up {
                return;
            }

            let Some(subnet) = context.cache.subnet(name) else {
                return;
            };
            let usage = context.registry.usage(name).await;
            let status = SubnetStatus::failed(
                SubnetState::Pending,
                error.to_string(),
                usage.as_ref(),
                subnet
                    .metadata
                    .generation
                    .map(|generation| generation as u64)
                    .unwrap_or_else(|| version_token(subnet.as_ref())),
            );

            context.store.write_subnet_status(name, &status).await
        }
    };

    if let Err(store_error) = result {
        warn!("Couldn't report the failure of {key}! {store_error}");
    }
}

#[cfg(test)]
mod tests;
