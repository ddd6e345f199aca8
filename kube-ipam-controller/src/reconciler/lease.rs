use kube_ipam_core::{
    error::IpamError,
    lease::{LeaseKey, LeaseRecord, LeaseRequest},
    resources::{
        annotations::get_lease_annotations,
        crd::v1::ip::{IpSpec, IpStatus, LeaseState},
    },
};
use log::{debug, info, warn};

use crate::{control_plane::LeaseDescriptor, queue::WorkKey};

use super::{context::ReconcilerContext, error::ReconcilerError};

pub async fn reconcile_lease(context: &ReconcilerContext, key: &LeaseKey) -> Result<(), ReconcilerError> {
    match context.cache.workload(key) {
        Some(request) => apply(context, &request).await,
        None => release(context, key).await,
    }
}

async fn apply(context: &ReconcilerContext, request: &LeaseRequest) -> Result<(), ReconcilerError> {
    let key = &request.key;

    if context.leases.state(key).await.is_none() {
        context.leases.transition(key, LeaseState::Pending).await;
    }

    let held = match context.registry.locate(key).await {
        Some(lease) if lease.is_stale_for(request) => {
            warn!(
                "Lease of '{key}' belongs to a previous workload instance ({}), reclaiming {}...",
                lease.runtime_handle, lease.address
            );

            withdraw(context, &lease).await?;
            context.leases.transition(key, LeaseState::Stale).await;
            context
                .store
                .write_lease(
                    &IpSpec::from_lease(&lease),
                    &IpStatus::with_state(LeaseState::Stale, Some(lease.address)),
                )
                .await?;
            context.leases.transition(key, LeaseState::Pending).await;

            None
        }
        Some(lease)
            if request
                .subnet
                .as_ref()
                .is_some_and(|subnet| *subnet != lease.subnet) =>
        {
            info!(
                "'{key}' asks for another subnet, releasing {} in '{}'...",
                lease.address, lease.subnet
            );

            withdraw(context, &lease).await?;
            context.leases.transition(key, LeaseState::Pending).await;

            None
        }
        held => held,
    };

    // a held lease stays where it is when namespace bindings change
    let subnet = match held {
        Some(lease) => lease.subnet,
        None => context.registry.resolve(request).await?,
    };
    let lease = context.registry.allocate(&subnet, request).await?;

    if context.leases.published(key).await.as_ref() == Some(&lease) {
        debug!("Lease '{key}' is up to date");
        return Ok(());
    }

    context.leases.transition(key, LeaseState::Allocated).await;
    publish(context, &lease).await?;
    context.leases.publish(&lease).await;

    info!("Published {} lease of '{key}' in '{}'!", lease.address, lease.subnet);
    context.queue.add(WorkKey::Subnet(lease.subnet.clone())).await;

    Ok(())
}

/// Hands the lease to the control plane, then persists it.
async fn publish(context: &ReconcilerContext, lease: &LeaseRecord) -> Result<(), ReconcilerError> {
    let declaration = context
        .registry
        .declaration(&lease.subnet)
        .await
        .ok_or_else(|| IpamError::UnknownSubnet(lease.subnet.clone()))?;

    context
        .control_plane
        .apply_lease(&LeaseDescriptor::new(lease, &declaration))
        .await?;
    context
        .store
        .write_lease(
            &IpSpec::from_lease(lease),
            &IpStatus::with_state(LeaseState::Published, Some(lease.address)),
        )
        .await?;
    context
        .store
        .annotate_workload(
            &lease.key,
            &get_lease_annotations(lease, &declaration.cidr, &declaration.gateway),
        )
        .await?;

    Ok(())
}

/// The workload is gone, its address goes back to the pool.
async fn release(context: &ReconcilerContext, key: &LeaseKey) -> Result<(), ReconcilerError> {
    if !context.cache.workloads_synced() {
        debug!("Workloads aren't listed yet, keeping the lease of '{key}'");
        return Ok(());
    }

    if let Some(lease) = context.registry.locate(key).await {
        withdraw(context, &lease).await?;
        info!("Released {} of '{key}' back to '{}'!", lease.address, lease.subnet);
    }

    context.store.remove_lease(key).await?;
    context.leases.transition(key, LeaseState::Released).await;
    context.leases.forget(key).await;

    Ok(())
}

/// Takes the lease out of the control plane first, so a failure there leaves
/// it allocated and the next attempt retries the whole release.
async fn withdraw(context: &ReconcilerContext, lease: &LeaseRecord) -> Result<(), ReconcilerError> {
    context
        .control_plane
        .remove_lease(&lease.key, &lease.subnet)
        .await?;
    context.registry.release(&lease.key).await;

    // a blocked deletion of the subnet may go through now
    context.queue.add(WorkKey::Subnet(lease.subnet.clone())).await;

    Ok(())
}
