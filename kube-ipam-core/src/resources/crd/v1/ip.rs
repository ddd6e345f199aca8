use std::fmt::Display;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::{
    ip::addrpair::IpAddrPair,
    lease::{LeaseKey, LeaseRecord, LeaseRequest},
};

/// Durable record of a single lease, named `<pod>.<namespace>`.
#[skip_serializing_none]
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[kube(
    group = "kubeovn.io",
    version = "v1",
    kind = "IP",
    status = "IpStatus",
    derive = "Default",
    printcolumn = r#"{"name":"Subnet", "type":"string", "jsonPath":".spec.subnet"}"#,
    printcolumn = r#"{"name":"Address", "type":"string", "jsonPath":".spec.ip_address"}"#,
    printcolumn = r#"{"name":"Node", "type":"string", "jsonPath":".spec.node_name"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#
)]
pub struct IpSpec {
    pub pod_name: String,
    pub namespace: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub mac_address: String,
    /// handle of the workload instance the lease was made for
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub subnet: String,
    pub ip_address: Option<String>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct IpStatus {
    pub state: LeaseState,
    pub address: Option<IpAddrPair>,
    /// last allocation error, cleared once the lease is published
    pub error: Option<String>,
    pub error_class: Option<ErrorClass>,
    #[serde(default)]
    pub attempts: u32,
    pub last_update: Option<DateTime<Utc>>,
}

/// Pending -> Allocated -> Published -> (Released | Stale)
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum LeaseState {
    #[default]
    Pending,
    Allocated,
    Published,
    Released,
    Stale,
    Failed,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ErrorClass {
    /// won't be retried until the declarations involved change
    Terminal,
    Retryable,
}

impl IpSpec {
    pub fn from_lease(lease: &LeaseRecord) -> Self {
        Self {
            pod_name: lease.key.name.clone(),
            namespace: lease.key.namespace.clone(),
            node_name: lease.node.clone().unwrap_or_default(),
            mac_address: lease.mac.to_string(),
            container_id: lease.runtime_handle.clone(),
            subnet: lease.subnet.clone(),
            ip_address: Some(lease.address.to_string()),
        }
    }

    /// Record of a request that hasn't got an address yet.
    pub fn from_request(request: &LeaseRequest) -> Self {
        Self {
            pod_name: request.key.name.clone(),
            namespace: request.key.namespace.clone(),
            node_name: request.node.clone().unwrap_or_default(),
            mac_address: request.mac.clone().unwrap_or_default(),
            container_id: request.runtime_handle.clone(),
            subnet: request.subnet.clone().unwrap_or_default(),
            ip_address: None,
        }
    }

    pub fn lease_key(&self) -> LeaseKey {
        LeaseKey::new(&self.namespace, &self.pod_name)
    }
}

impl IP {
    /// Lease recorded by a previous controller run, if the record holds one.
    pub fn recorded_lease(&self) -> Option<LeaseRecord> {
        let status = self.status.as_ref()?;

        if !matches!(status.state, LeaseState::Published | LeaseState::Allocated) {
            return None;
        }

        let address = match status.address {
            Some(address) => address,
            None => self.spec.ip_address.as_deref()?.parse().ok()?,
        };

        Some(LeaseRecord {
            key: self.spec.lease_key(),
            subnet: self.spec.subnet.clone(),
            address,
            mac: self.spec.mac_address.parse().ok()?,
            node: Some(self.spec.node_name.clone()).filter(|node| !node.is_empty()),
            runtime_handle: self.spec.container_id.clone(),
        })
    }
}

impl IpStatus {
    pub fn with_state(state: LeaseState, address: Option<IpAddrPair>) -> Self {
        Self {
            state,
            address,
            last_update: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn with_error(
        state: LeaseState,
        error: impl Into<String>,
        class: ErrorClass,
        attempts: u32,
    ) -> Self {
        Self {
            state,
            address: None,
            error: Some(error.into()),
            error_class: Some(class),
            attempts,
            last_update: Some(Utc::now()),
        }
    }
}

impl Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Terminal => f.write_str("terminal"),
            ErrorClass::Retryable => f.write_str("retryable"),
        }
    }
}

impl Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseState::Pending => f.write_str("lease request observed"),
            LeaseState::Allocated => f.write_str("address allocated"),
            LeaseState::Published => f.write_str("lease published"),
            LeaseState::Released => f.write_str("address returned to the pool"),
            LeaseState::Stale => f.write_str("lease belonged to a previous workload instance"),
            LeaseState::Failed => f.write_str("lease request failed"),
        }
    }
}
