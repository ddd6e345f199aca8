use std::time::Duration;

use kube_ipam_core::{error::IpamError, resources::crd::v1::ip::ErrorClass};
use thiserror::Error;

use crate::{control_plane::ControlPlaneError, store::StoreError};

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("{}", .0)]
    Ipam(#[from] IpamError),
    #[error("Couldn't persist the state! Reason: {}", .0)]
    Store(#[from] StoreError),
    #[error("Couldn't push the desired state! Reason: {}", .0)]
    ControlPlane(#[from] ControlPlaneError),
    #[error("Reconciliation didn't finish within {:?}!", .0)]
    Timeout(Duration),
}

impl ReconcilerError {
    /// The only place errors are sorted into ones worth retrying and ones
    /// that wait for a declaration to change.
    pub fn class(&self) -> ErrorClass {
        match self {
            ReconcilerError::Ipam(IpamError::PoolExhausted { .. }) => ErrorClass::Retryable,
            ReconcilerError::Ipam(_) => ErrorClass::Terminal,
            ReconcilerError::Store(_) => ErrorClass::Retryable,
            ReconcilerError::ControlPlane(_) => ErrorClass::Retryable,
            ReconcilerError::Timeout(_) => ErrorClass::Retryable,
        }
    }
}
