use std::fmt::{Display, Formatter};

use derive_builder::Builder;

use crate::{ip::addrpair::IpAddrPair, mac::MacAddress};

/// Identity a lease is keyed by: the workload's namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseKey {
    pub namespace: String,
    pub name: String,
}

impl LeaseKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Name of the cluster-scoped IP record backing this lease.
    pub fn record_name(&self) -> String {
        format!("{}.{}", self.name, self.namespace)
    }
}

impl Display for LeaseKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}/{}", self.namespace, self.name))
    }
}

/// A workload asking for an address.
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(setter(into))]
pub struct LeaseRequest {
    pub key: LeaseKey,
    /// handle of the live workload instance, changes when the workload is recreated
    pub runtime_handle: String,
    #[builder(default, setter(into, strip_option))]
    pub node: Option<String>,
    /// explicitly requested subnet, namespace binding is used otherwise
    #[builder(default, setter(into, strip_option))]
    pub subnet: Option<String>,
    /// raw static address request, validated during allocation
    #[builder(default, setter(into, strip_option))]
    pub static_ip: Option<String>,
    #[builder(default, setter(into, strip_option))]
    pub mac: Option<String>,
}

/// An address handed out to a workload, owned by its subnet's lease table.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseRecord {
    pub key: LeaseKey,
    pub subnet: String,
    pub address: IpAddrPair,
    pub mac: MacAddress,
    pub node: Option<String>,
    pub runtime_handle: String,
}

impl LeaseRecord {
    pub fn is_stale_for(&self, request: &LeaseRequest) -> bool {
        self.runtime_handle != request.runtime_handle
    }
}
