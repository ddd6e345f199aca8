use std::sync::Arc;

use kube_ipam_core::{
    allocator::SubnetUsage,
    error::IpamError,
    helpers::version_token,
    policy::resolve_allow_list,
    resources::{
        crd::v1::{
            ip::LeaseState,
            subnet::{Subnet, SubnetState, SubnetStatus},
        },
        SUBNET_FINALIZER,
    },
    subnet::SubnetDeclaration,
};
use kube::ResourceExt;
use log::{info, warn};

use crate::{control_plane::SubnetDescriptor, queue::WorkKey};

use super::{context::ReconcilerContext, error::ReconcilerError};

pub async fn reconcile_subnet(context: &ReconcilerContext, name: &str) -> Result<(), ReconcilerError> {
    match context.cache.subnet(name) {
        Some(subnet) if subnet.metadata.deletion_timestamp.is_some() => {
            finalize(context, name, &subnet).await
        }
        Some(subnet) => apply(context, name, &subnet).await,
        None => withdraw(context, name).await,
    }
}

async fn apply(context: &ReconcilerContext, name: &str, subnet: &Arc<Subnet>) -> Result<(), ReconcilerError> {
    let generation = generation(subnet);

    if !subnet.finalizers().iter().any(|finalizer| finalizer == SUBNET_FINALIZER) {
        let mut finalizers = subnet.finalizers().to_vec();
        finalizers.push(SUBNET_FINALIZER.to_owned());

        context.store.set_subnet_finalizers(name, finalizers).await?;
    }

    let outcome = match SubnetDeclaration::try_from(subnet.as_ref()) {
        Ok(declaration) => context.registry.upsert(declaration).await,
        Err(error) => Err(IpamError::from(error)),
    };

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(error) => {
            warn!("Subnet '{name}' declaration was rejected: {error}");

            let usage = context.registry.usage(name).await;
            let status = SubnetStatus::failed(
                SubnetState::ErrorInvalidSpec,
                error.to_string(),
                usage.as_ref(),
                generation,
            );
            write_status(context, name, subnet, status).await?;

            return Err(error.into());
        }
    };

    let declaration = context
        .registry
        .declaration(name)
        .await
        .ok_or_else(|| IpamError::UnknownSubnet(name.to_owned()))?;
    let known = context.registry.declarations().await;
    let peers = resolve_allow_list(&declaration, known.iter());

    context
        .control_plane
        .apply_subnet(&SubnetDescriptor::new(&declaration, peers))
        .await?;

    let changed = outcome.created
        || subnet.status.as_ref().and_then(|status| status.observed_version) != Some(generation);

    write_status(
        context,
        name,
        subnet,
        SubnetStatus::ready(&outcome.usage, outcome.outside, generation),
    )
    .await?;

    if changed {
        info!("Subnet '{name}' is ready, {}!", usage_summary(&outcome.usage));
        requeue_waiting_leases(context).await;
    }

    if outcome.created {
        requeue_peers(context, name).await;
    }

    Ok(())
}

async fn finalize(context: &ReconcilerContext, name: &str, subnet: &Arc<Subnet>) -> Result<(), ReconcilerError> {
    if let Err(error) = context.registry.remove(name).await {
        if let IpamError::SubnetInUse { leases, .. } = &error {
            warn!("Subnet '{name}' deletion is blocked by {leases} leases!");

            let usage = context.registry.usage(name).await;
            let status = SubnetStatus::failed(
                SubnetState::ErrorInUse,
                error.to_string(),
                usage.as_ref(),
                generation(subnet),
            );
            write_status(context, name, subnet, status).await?;
        }

        return Err(error.into());
    }

    context.control_plane.remove_subnet(name).await?;

    let finalizers = subnet
        .finalizers()
        .iter()
        .filter(|finalizer| *finalizer != SUBNET_FINALIZER)
        .cloned()
        .collect();
    context.store.set_subnet_finalizers(name, finalizers).await?;

    info!("Subnet '{name}' was removed!");
    requeue_peers(context, name).await;

    Ok(())
}

/// The declaration is gone without passing through finalization.
async fn withdraw(context: &ReconcilerContext, name: &str) -> Result<(), ReconcilerError> {
    if context.registry.remove(name).await?.is_some() {
        context.control_plane.remove_subnet(name).await?;

        info!("Subnet '{name}' was withdrawn!");
        requeue_peers(context, name).await;
    }

    Ok(())
}

async fn write_status(
    context: &ReconcilerContext,
    name: &str,
    subnet: &Subnet,
    status: SubnetStatus,
) -> Result<(), ReconcilerError> {
    // status writes come back as watch events, unchanged status isn't written again
    if let Some(current) = &subnet.status {
        if same_status(current, &status) {
            return Ok(());
        }
    }

    context.store.write_subnet_status(name, &status).await?;

    Ok(())
}

fn same_status(current: &SubnetStatus, next: &SubnetStatus) -> bool {
    current.state == next.state
        && current.message == next.message
        && current.leased == next.leased
        && current.capacity == next.capacity
        && (current.utilization - next.utilization).abs() < 0.01
        && current.observed_version == next.observed_version
}

fn generation(subnet: &Subnet) -> u64 {
    match subnet.metadata.generation {
        Some(generation) if generation > 0 => generation as u64,
        _ => version_token(subnet),
    }
}

/// Lease requests that couldn't be served may succeed against the changed subnet.
async fn requeue_waiting_leases(context: &ReconcilerContext) {
    let waiting = context
        .leases
        .keys_in(&[LeaseState::Pending, LeaseState::Failed])
        .await;

    context
        .queue
        .add_all(waiting.into_iter().map(WorkKey::Lease))
        .await;
}

/// Subnets whose allow-list names this one resolve to a different peer set now.
async fn requeue_peers(context: &ReconcilerContext, name: &str) {
    let peers = context
        .registry
        .declarations()
        .await
        .into_iter()
        .filter(|declaration| declaration.name != name)
        .filter(|declaration| declaration.allow_subnets.iter().any(|peer| peer == name))
        .map(|declaration| WorkKey::Subnet(declaration.name));

    context.queue.add_all(peers).await;
}

fn usage_summary(usage: &SubnetUsage) -> String {
    format!(
        "{} leased of {} ({:.1}%)",
        usage.leased, usage.capacity, usage.utilization
    )
}
