use anyhow::Context;
use kube::{api::{ListParams, PatchParams}, Client, ResourceExt};
use kube_ipam_core::{
    kubernetes::{operations::create_cluster_resource_if_missing, GetApi},
    resources::crd::v1::{create_v1_crds, subnet::Subnet},
    subnet::SubnetDeclaration,
    CONTROLLER_FIELD_MANAGER,
};
use log::{info, warn};

use crate::{config::Configuration, reconciler::context::ReconcilerContext, store::StoreError};

pub async fn install_crds(client: &Client) -> anyhow::Result<()> {
    let patch_params = PatchParams::apply(CONTROLLER_FIELD_MANAGER).force();

    create_v1_crds(client, &patch_params).await
}

/// Creates the default and node subnets, existing ones are left as they are.
pub async fn create_bootstrap_subnets(client: &Client, config: &Configuration) -> anyhow::Result<()> {
    for subnet in config.bootstrap_subnets() {
        create_cluster_resource_if_missing(client, &subnet).await?;
    }

    Ok(())
}

pub async fn list_subnets(client: &Client) -> anyhow::Result<Vec<Subnet>> {
    let subnets = client
        .global_api::<Subnet>()
        .list(&ListParams::default())
        .await
        .context("Couldn't list subnets!")?;

    Ok(subnets.items)
}

#[derive(Debug, Default, PartialEq)]
pub struct RestoreSummary {
    pub subnets: usize,
    pub leases: usize,
    pub rejected_leases: usize,
}

/// Rebuilds the registry from the declared subnets and the recorded leases,
/// so addresses handed out before a restart aren't handed out twice.
pub async fn restore(
    context: &ReconcilerContext,
    subnets: &[Subnet],
) -> Result<RestoreSummary, StoreError> {
    let mut summary = RestoreSummary::default();

    for subnet in subnets {
        let declared = match SubnetDeclaration::try_from(subnet) {
            Ok(declaration) => context.registry.upsert(declaration).await.map(|_| ()),
            Err(error) => Err(error.into()),
        };

        match declared {
            Ok(()) => summary.subnets += 1,
            Err(error) => warn!("Subnet '{}' wasn't restored! {error}", subnet.name_any()),
        }
    }

    for lease in context.store.recorded_leases().await? {
        let key = lease.key.clone();
        let address = lease.address;

        match context.registry.adopt(lease).await {
            Ok(()) => summary.leases += 1,
            Err(error) => {
                warn!("Recorded lease {address} of '{key}' wasn't restored! {error}");
                summary.rejected_leases += 1;
            }
        }
    }

    info!(
        "Restored {} subnets and {} leases",
        summary.subnets, summary.leases
    );

    Ok(summary)
}
