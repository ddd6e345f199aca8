use std::{collections::BTreeSet, sync::Arc, time::Duration};

use log::debug;
use tokio::time::{interval, MissedTickBehavior};

use crate::{queue::WorkKey, reconciler::context::ReconcilerContext};

/// Periodically queues every known key, so drift between the declarations,
/// the registry and the control plane is corrected without new events.
pub async fn start_resync(context: Arc<ReconcilerContext>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // the first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let keys = known_keys(&context).await;
        debug!("Resyncing {} keys...", keys.len());

        context.queue.add_all(keys).await;
    }
}

/// Declared keys, plus registry state that no declaration backs anymore.
pub async fn known_keys(context: &ReconcilerContext) -> BTreeSet<WorkKey> {
    let mut keys = BTreeSet::new();

    keys.extend(context.cache.subnet_names().into_iter().map(WorkKey::Subnet));
    keys.extend(context.cache.workload_keys().into_iter().map(WorkKey::Lease));

    for declaration in context.registry.declarations().await {
        keys.insert(WorkKey::Subnet(declaration.name.clone()));

        // orphaned leases can only be told apart once the workloads are listed
        if !context.cache.workloads_synced() {
            continue;
        }

        for lease in context
            .registry
            .leases(&declaration.name)
            .await
            .unwrap_or_default()
        {
            keys.insert(WorkKey::Lease(lease.key));
        }
    }

    keys
}
