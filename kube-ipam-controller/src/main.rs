use std::{process::exit, sync::Arc};

use clap::Parser;
use config::{Configuration, LogLevel};
use control_plane::LogControlPlane;
use env_logger::Target;
use kube::Client;
use kube_ipam_core::kubernetes::operations::create_local_client;
use log::{error, info, LevelFilter};
use reconciler::context::ReconcilerContext;
use store::KubeObjectStore;

use crate::{
    bootstrap::{create_bootstrap_subnets, install_crds, list_subnets, restore},
    resync::start_resync,
    watch::{start_pod_watcher, start_subnet_watcher},
    worker::start_workers,
};

mod bootstrap;
mod cache;
mod config;
mod control_plane;
mod queue;
mod reconciler;
mod resync;
mod store;
mod watch;
mod worker;

#[cfg(test)]
mod testing;

#[tokio::main]
async fn main() {
    let config = Configuration::parse();

    configure_logging(&config);

    let client = create_client(&config).await;

    if let Err(error) = install_crds(&client).await {
        error!("Couldn't install CRDs! {error:?}");
        exit(7)
    }

    if let Err(error) = create_bootstrap_subnets(&client, &config).await {
        error!("Couldn't create bootstrap subnets! {error:?}");
        exit(8)
    }

    let context = Arc::new(ReconcilerContext::new(
        Arc::new(KubeObjectStore::new(client.clone())),
        Arc::new(LogControlPlane),
    ));

    restore_registry(&client, &context).await;

    let workers = start_workers(context.clone(), config.workers, config.retry_policy());

    info!("Controller started with {} workers", workers.len());

    tokio::select! {
        _ = start_subnet_watcher(context.clone(), client.clone()) => {},
        _ = start_pod_watcher(context.clone(), client.clone()) => {},
        _ = start_resync(context.clone(), config.resync_period()) => {},
        _ = tokio::signal::ctrl_c() => info!("Shutting down..."),
    }

    context.queue.shutdown().await;

    for worker in workers {
        if let Err(error) = worker.await {
            error!("Worker didn't stop cleanly! {error}");
        }
    }
}

async fn create_client(config: &Configuration) -> Client {
    match create_local_client(&config.kube_config, &config.kube_context).await {
        Ok(client) => client,
        Err(error) => {
            error!("Couldn't create client! {error:?}");
            exit(6)
        }
    }
}

async fn restore_registry(client: &Client, context: &ReconcilerContext) {
    let subnets = match list_subnets(client).await {
        Ok(subnets) => subnets,
        Err(error) => {
            error!("Couldn't restore subnets! {error:?}");
            exit(9)
        }
    };

    if let Err(error) = restore(context, &subnets).await {
        error!("Couldn't restore leases! {error}");
        exit(9)
    }
}

fn configure_logging(config: &Configuration) {
    let log_level = config.get_log_level();
    let mut logger = env_logger::builder();

    logger
        .format_module_path(matches!(log_level, LogLevel::Trace))
        .format_target(false)
        .target(Target::Stderr);

    if let LogLevel::Normal = log_level {
        logger.filter(Some("kube_ipam"), LevelFilter::Info);
    }

    if let LogLevel::Verbose = log_level {
        logger.filter(Some("kube_ipam"), LevelFilter::Debug);
    }

    if let LogLevel::Trace = log_level {
        logger.filter(None, LevelFilter::Trace);
    }

    logger.init();
}
