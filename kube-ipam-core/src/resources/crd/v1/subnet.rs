use std::fmt::Display;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::{allocator::SubnetUsage, ip::Protocol};

#[skip_serializing_none]
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[kube(
    group = "kubeovn.io",
    version = "v1",
    kind = "Subnet",
    status = "SubnetStatus",
    derive = "Default",
    printcolumn = r#"{"name":"Protocol", "type":"string", "jsonPath":".spec.protocol"}"#,
    printcolumn = r#"{"name":"CIDR", "type":"string", "jsonPath":".spec.cidr_block"}"#,
    printcolumn = r#"{"name":"Leased", "type":"integer", "jsonPath":".status.leased"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#
)]
pub struct SubnetSpec {
    /// fallback subnet for namespaces without an explicit binding,
    /// at most one subnet can be marked as default
    #[serde(default)]
    pub default: bool,
    /// inferred from the CIDR block when unset
    pub protocol: Option<Protocol>,
    /// namespaces whose workloads draw their addresses from this subnet
    #[serde(default)]
    pub namespaces: Vec<String>,
    /// a single CIDR, or an IPv4 and IPv6 CIDR separated by a comma for dual stack subnets
    pub cidr_block: String,
    /// defaults to the first host address of the CIDR
    pub gateway: Option<String>,
    /// addresses (`10.16.0.5`) or ranges (`10.16.0.10..10.16.0.20`) that are never leased
    #[serde(default)]
    pub exclude_ips: Vec<String>,
    #[serde(default)]
    pub gateway_type: GatewayType,
    /// nodes egress traffic is funneled through, required for centralized gateways
    #[serde(default)]
    pub gateway_nodes: Vec<String>,
    #[serde(default)]
    pub nat_outgoing: bool,
    /// if set, only subnets on the allow list can reach this one
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub allow_subnets: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum GatewayType {
    #[default]
    Distributed,
    Centralized,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SubnetStatus {
    pub state: SubnetState,
    pub message: Option<String>,
    #[serde(default)]
    pub leased: u64,
    /// leasable addresses, a float to fit IPv6 ranges
    #[serde(default)]
    pub capacity: f64,
    /// percentage of the leasable range in use
    #[serde(default)]
    pub utilization: f64,
    pub observed_version: Option<u64>,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub enum SubnetState {
    #[default]
    Pending,
    Ready,
    ErrorInvalidSpec,
    ErrorInUse,
}

impl SubnetStatus {
    pub fn ready(usage: &SubnetUsage, outside: usize, observed_version: u64) -> Self {
        let message = match outside {
            0 => None,
            outside => Some(format!(
                "{outside} leases are kept outside of the declared range until released"
            )),
        };

        Self {
            state: SubnetState::Ready,
            message,
            leased: usage.leased as u64,
            capacity: usage.capacity as f64,
            utilization: usage.utilization,
            observed_version: Some(observed_version),
            last_update: Some(Utc::now()),
        }
    }

    pub fn failed(
        state: SubnetState,
        message: impl Into<String>,
        usage: Option<&SubnetUsage>,
        observed_version: u64,
    ) -> Self {
        Self {
            state,
            message: Some(message.into()),
            leased: usage.map(|usage| usage.leased as u64).unwrap_or_default(),
            capacity: usage.map(|usage| usage.capacity as f64).unwrap_or_default(),
            utilization: usage.map(|usage| usage.utilization).unwrap_or_default(),
            observed_version: Some(observed_version),
            last_update: Some(Utc::now()),
        }
    }
}

impl Display for SubnetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubnetState::Pending => f.write_str("subnet is waiting to be processed"),
            SubnetState::Ready => f.write_str("subnet is ready to lease addresses"),
            SubnetState::ErrorInvalidSpec => f.write_str("subnet declaration is invalid"),
            SubnetState::ErrorInUse => {
                f.write_str("subnet can't be removed while it holds active leases")
            }
        }
    }
}
