use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{api::PatchParams, Client, CustomResourceExt};

use crate::kubernetes::operations::apply_crd;

use self::{ip::IP, subnet::Subnet};

pub mod ip;
pub mod subnet;

pub fn v1_crds() -> Vec<CustomResourceDefinition> {
    vec![Subnet::crd(), IP::crd()]
}

pub async fn create_v1_crds(client: &Client, apply_params: &PatchParams) -> anyhow::Result<()> {
    for crd in v1_crds() {
        apply_crd(client, &crd, apply_params).await?;
    }

    Ok(())
}
