use std::sync::Arc;

use kube_ipam_core::resources::crd::v1::ip::ErrorClass;
use log::{debug, error, info, warn};
use tokio::{task::JoinHandle, time::timeout};

use crate::{
    config::RetryPolicy,
    queue::WorkKey,
    reconciler::{context::ReconcilerContext, error::ReconcilerError, reconcile, report_failure},
};

/// Spawns `count` workers draining the queue until it shuts down.
pub fn start_workers(
    context: Arc<ReconcilerContext>,
    count: usize,
    policy: RetryPolicy,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|id| {
            let context = context.clone();

            tokio::spawn(async move {
                debug!("Worker {id} started");

                while let Some(key) = context.queue.next().await {
                    process(&context, &key, &policy).await;
                    context.queue.done(&key).await;
                }

                debug!("Worker {id} stopped");
            })
        })
        .collect()
}

/// Runs a single unit of work under the deadline and decides its fate.
pub async fn process(context: &ReconcilerContext, key: &WorkKey, policy: &RetryPolicy) {
    let result = match timeout(policy.deadline, reconcile(context, key)).await {
        Ok(result) => result,
        Err(_) => Err(ReconcilerError::Timeout(policy.deadline)),
    };

    let error = match result {
        Ok(()) => {
            let failures = context.queue.failures(key).await;
            if failures > 0 {
                info!("Reconciled {key} after {failures} failed attempts");
            }

            context.queue.forget(key).await;
            return;
        }
        Err(error) => error,
    };

    match error.class() {
        ErrorClass::Terminal => {
            error!("Reconciling {key} failed! {error}");

            context.queue.forget(key).await;
            report_failure(context, key, &error, 1, false).await;
        }
        ErrorClass::Retryable => {
            let attempts = context.queue.record_failure(key).await;

            if attempts >= policy.budget {
                error!("Giving up on {key} after {attempts} attempts! {error}");

                context.queue.forget(key).await;
                report_failure(context, key, &error, attempts, true).await;
            } else {
                let delay = policy.backoff(attempts);
                warn!("Reconciling {key} failed, retrying in {delay:?}... {error}");

                report_failure(context, key, &error, attempts, false).await;
                context.queue.add_after(key.clone(), delay);
            }
        }
    }
}
