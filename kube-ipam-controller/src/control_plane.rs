use async_trait::async_trait;
use kube_ipam_core::{
    ip::{addrpair::IpAddrPair, netpair::IpNetPair},
    lease::{LeaseKey, LeaseRecord},
    mac::MacAddress,
    policy::{egress_route, nat_outgoing, EgressRoute},
    subnet::{GatewayMode, SubnetDeclaration},
};
use log::info;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("Control plane is unreachable! Reason: {}", .0)]
    Unreachable(String),
}

/// Desired state of one subnet as the virtualization control plane sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct SubnetDescriptor {
    pub name: String,
    pub cidr: IpNetPair,
    pub gateway: IpAddrPair,
    pub gateway_mode: GatewayMode,
    /// exclusion ranges, rendered the way they were declared
    pub excluded: Vec<String>,
    pub nat_outgoing: bool,
    pub private: bool,
    /// allow-list entries naming existing subnets
    pub allowed_peers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeaseDescriptor {
    pub key: LeaseKey,
    pub subnet: String,
    pub address: IpAddrPair,
    pub mac: MacAddress,
    pub node: Option<String>,
    pub egress: EgressRoute,
}

impl SubnetDescriptor {
    pub fn new(declaration: &SubnetDeclaration, allowed_peers: Vec<String>) -> Self {
        Self {
            name: declaration.name.clone(),
            cidr: declaration.cidr,
            gateway: declaration.gateway,
            gateway_mode: declaration.gateway_mode.clone(),
            excluded: declaration.exclusions_display(),
            nat_outgoing: nat_outgoing(declaration),
            private: declaration.private,
            allowed_peers,
        }
    }
}

impl LeaseDescriptor {
    pub fn new(lease: &LeaseRecord, declaration: &SubnetDeclaration) -> Self {
        Self {
            key: lease.key.clone(),
            subnet: lease.subnet.clone(),
            address: lease.address,
            mac: lease.mac,
            node: lease.node.clone(),
            egress: egress_route(declaration, lease.node.as_deref()),
        }
    }
}

/// Programs switches, routers and ACLs from the allocation decisions.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn apply_subnet(&self, subnet: &SubnetDescriptor) -> Result<(), ControlPlaneError>;

    async fn remove_subnet(&self, name: &str) -> Result<(), ControlPlaneError>;

    async fn apply_lease(&self, lease: &LeaseDescriptor) -> Result<(), ControlPlaneError>;

    async fn remove_lease(&self, key: &LeaseKey, subnet: &str) -> Result<(), ControlPlaneError>;
}

/// Control plane that only reports the desired state, for clusters where
/// the switches are programmed by another component.
pub struct LogControlPlane;

#[async_trait]
impl ControlPlane for LogControlPlane {
    async fn apply_subnet(&self, subnet: &SubnetDescriptor) -> Result<(), ControlPlaneError> {
        info!(
            "Subnet '{}': {} via {} ({}), nat: {}, private: {}, peers: [{}], excluded: [{}]",
            subnet.name,
            subnet.cidr,
            subnet.gateway,
            subnet.gateway_mode,
            subnet.nat_outgoing,
            subnet.private,
            subnet.allowed_peers.join(", "),
            subnet.excluded.join(", ")
        );

        Ok(())
    }

    async fn remove_subnet(&self, name: &str) -> Result<(), ControlPlaneError> {
        info!("Subnet '{name}' withdrawn");

        Ok(())
    }

    async fn apply_lease(&self, lease: &LeaseDescriptor) -> Result<(), ControlPlaneError> {
        info!(
            "Lease '{}': {} ({}) in '{}', egress {}",
            lease.key, lease.address, lease.mac, lease.subnet, lease.egress
        );

        Ok(())
    }

    async fn remove_lease(&self, key: &LeaseKey, subnet: &str) -> Result<(), ControlPlaneError> {
        info!("Lease '{key}' withdrawn from '{subnet}'");

        Ok(())
    }
}
