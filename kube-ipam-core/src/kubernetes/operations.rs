use std::{collections::BTreeMap, fmt::Debug};

use anyhow::{anyhow, Context};
use k8s_openapi::{
    apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
    serde::{de::DeserializeOwned, Serialize},
    ClusterResourceScope, NamespaceResourceScope,
};
use kube::{
    api::{DeleteParams, Patch, PatchParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    Api, Client, Config, Resource,
};
use log::{debug, info};
use serde_json::json;

use crate::helpers::pretty_type_name;

use super::{is_not_found, GetApi};

pub async fn create_local_client(
    config_path: &Option<String>,
    context_name: &Option<String>,
) -> anyhow::Result<Client> {
    let config_options = KubeConfigOptions {
        context: context_name.to_owned(),
        ..Default::default()
    };

    let config = match config_path {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)?;
            Config::from_custom_kubeconfig(kubeconfig, &config_options).await?
        }
        None => Config::infer().await?,
    };

    let client = Client::try_from(config)?;

    Ok(client)
}

pub async fn apply_crd(
    client: &Client,
    crd: &CustomResourceDefinition,
    patch_params: &PatchParams,
) -> anyhow::Result<()> {
    let crd_name = crd
        .metadata
        .name
        .as_ref()
        .ok_or_else(|| anyhow!("CRD is missing a name!"))?;
    let crd_apiversions = crd
        .spec
        .versions
        .iter()
        .map(|version| version.name.as_str())
        .collect::<Vec<&str>>()
        .join(", ");

    info!("Applying {crd_name} ({crd_apiversions}) CRD...");

    let crd_api: Api<CustomResourceDefinition> = Api::all(client.clone());
    crd_api
        .patch(crd_name, patch_params, &Patch::Apply(crd))
        .await
        .context(format!(
            "Unable to apply {crd_name} ({crd_apiversions}) CRD!"
        ))?;

    Ok(())
}

pub async fn try_get_cluster_resource<T>(client: &Client, name: &str) -> Result<Option<T>, kube::Error>
where
    T: Resource<Scope = ClusterResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let api = client.global_api::<T>();

    api.get_opt(name).await
}

/// Creates the resource unless one with the same name exists, an existing
/// resource is left untouched.
pub async fn create_cluster_resource_if_missing<T>(
    client: &Client,
    resource: &T,
) -> anyhow::Result<bool>
where
    T: Resource<Scope = ClusterResourceScope, DynamicType = ()>
        + Serialize
        + Clone
        + DeserializeOwned
        + Debug,
{
    let resource_name = resource
        .meta()
        .name
        .as_ref()
        .ok_or_else(|| anyhow!("{} is missing a name!", pretty_type_name::<T>()))?;

    if try_get_cluster_resource::<T>(client, resource_name)
        .await?
        .is_some()
    {
        debug!(
            "'{resource_name}' {} already exists, skipping...",
            pretty_type_name::<T>()
        );
        return Ok(false);
    }

    info!(
        "Creating '{resource_name}' {} resource on the cluster...",
        pretty_type_name::<T>()
    );

    let api = client.global_api::<T>();
    api.create(&PostParams::default(), resource)
        .await
        .context(format!(
            "Unable to create '{resource_name}' {} resource!",
            pretty_type_name::<T>()
        ))?;

    Ok(true)
}

pub async fn apply_cluster_resource<T>(
    client: &Client,
    resource: &T,
    patch_params: &PatchParams,
) -> Result<T, kube::Error>
where
    T: Resource<Scope = ClusterResourceScope, DynamicType = ()>
        + Serialize
        + Clone
        + DeserializeOwned
        + Debug,
{
    let resource_name = resource.meta().name.as_deref().unwrap_or_default();
    let api = client.global_api::<T>();

    api.patch(resource_name, patch_params, &Patch::Apply(resource))
        .await
}

pub async fn apply_cluster_resource_status<T, S>(
    client: &Client,
    status: &S,
    name: &str,
    patch_params: &PatchParams,
) -> Result<T, kube::Error>
where
    T: Resource<Scope = ClusterResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug,
    S: Serialize,
{
    let api = client.global_api::<T>();
    let patch = json!({
        "apiVersion": T::api_version(&()),
        "kind": T::kind(&()),
        "status": status,
    });

    api.patch_status(name, patch_params, &Patch::Apply(&patch))
        .await
}

pub async fn set_cluster_resource_finalizers<T>(
    client: &Client,
    name: &str,
    finalizers: Vec<String>,
) -> Result<(), kube::Error>
where
    T: Resource<Scope = ClusterResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let api = client.global_api::<T>();
    let patch = json!({
        "metadata": {
            "finalizers": finalizers,
        }
    });

    match api
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        Err(error) if is_not_found(&error) => Ok(()),
        Err(error) => Err(error),
    }
}

pub async fn annotate_resource<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    annotations: &BTreeMap<String, String>,
) -> Result<(), kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = json!({
        "metadata": {
            "annotations": annotations,
        }
    });

    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    Ok(())
}

pub async fn try_remove_cluster_resource<T>(
    client: &Client,
    name: &str,
    delete_params: &DeleteParams,
) -> Result<(), kube::Error>
where
    T: Resource<Scope = ClusterResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let api = client.global_api::<T>();

    match api.delete(name, delete_params).await {
        Ok(_) => {
            info!("Removed '{name}' {}!", pretty_type_name::<T>());
            Ok(())
        }
        Err(error) if is_not_found(&error) => Ok(()),
        Err(error) => Err(error),
    }
}
