use std::collections::HashMap;

use kube_ipam_core::{
    lease::{LeaseKey, LeaseRecord},
    resources::crd::v1::ip::LeaseState,
};
use log::debug;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq)]
struct LeaseProgress {
    state: LeaseState,
    /// lease as it was last handed to the collaborators
    published: Option<LeaseRecord>,
}

/// Where each lease request is in its lifecycle.
#[derive(Default)]
pub struct LeaseTracker {
    requests: RwLock<HashMap<LeaseKey, LeaseProgress>>,
}

impl LeaseTracker {
    pub async fn state(&self, key: &LeaseKey) -> Option<LeaseState> {
        self.requests.read().await.get(key).map(|progress| progress.state)
    }

    pub async fn transition(&self, key: &LeaseKey, state: LeaseState) {
        let mut requests = self.requests.write().await;
        let progress = requests.entry(key.clone()).or_insert(LeaseProgress {
            state: LeaseState::Pending,
            published: None,
        });

        if progress.state != state {
            debug!("Lease '{key}': {:?} -> {state:?}", progress.state);
        }

        if state != LeaseState::Published {
            progress.published = None;
        }

        progress.state = state;
    }

    pub async fn publish(&self, lease: &LeaseRecord) {
        self.transition(&lease.key, LeaseState::Published).await;

        if let Some(progress) = self.requests.write().await.get_mut(&lease.key) {
            progress.published = Some(lease.clone());
        }
    }

    pub async fn published(&self, key: &LeaseKey) -> Option<LeaseRecord> {
        self.requests
            .read()
            .await
            .get(key)
            .and_then(|progress| progress.published.clone())
    }

    pub async fn forget(&self, key: &LeaseKey) {
        self.requests.write().await.remove(key);
    }

    pub async fn keys_in(&self, states: &[LeaseState]) -> Vec<LeaseKey> {
        self.requests
            .read()
            .await
            .iter()
            .filter(|(_, progress)| states.contains(&progress.state))
            .map(|(key, _)| key.clone())
            .collect()
    }
}
