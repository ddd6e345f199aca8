use std::{
    fmt::Display,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use ipnet::{Ipv4Net, Ipv6Net};
use thiserror::Error;

use crate::{
    allocator::pool::{Ipv4Pool, Ipv6Pool},
    helpers::RequireMetadata,
    ip::{
        addrpair::{DualStackTryGet, IpAddrPair},
        exclusion::{parse_exclusion, split_families, AddressRange, ExclusionError},
        netpair::IpNetPair,
        Contains, IpPairError, Protocol,
    },
    resources::crd::v1::subnet::{GatewayType, Subnet, SubnetSpec},
};

/// A subnet declaration that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct SubnetDeclaration {
    pub name: String,
    pub default: bool,
    pub protocol: Protocol,
    pub cidr: IpNetPair,
    pub gateway: IpAddrPair,
    pub exclusions: Vec<AddressRange<IpAddr>>,
    pub gateway_mode: GatewayMode,
    pub nat_outgoing: bool,
    pub private: bool,
    pub allow_subnets: Vec<String>,
    pub namespaces: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayMode {
    /// every node routes its own workloads' traffic
    Distributed,
    /// egress funnels through the listed nodes
    Centralized { nodes: Vec<String> },
}

#[derive(Debug, Error, PartialEq)]
pub enum SubnetSpecError {
    #[error("Subnet is missing a name!")]
    MissingName,
    #[error("CIDR block '{}' couldn't be parsed!", .0)]
    InvalidCidr(String),
    #[error("Protocol {} doesn't match CIDR block '{}'!", .0, .1)]
    ProtocolMismatch(Protocol, IpNetPair),
    #[error("Gateway '{}' couldn't be parsed!", .0)]
    InvalidGateway(String),
    #[error("Gateway {} lies outside of CIDR block {}!", .0, .1)]
    GatewayOutOfRange(IpAddrPair, IpNetPair),
    #[error("Excluded addresses are invalid: {}", .0)]
    InvalidExclusion(ExclusionError),
    #[error("Excluded addresses '{}' lie outside of CIDR block {}!", .0, .1)]
    ExclusionOutOfRange(String, IpNetPair),
    #[error("{} range of the subnet has no leasable addresses left!", .0)]
    EmptyRange(Protocol),
    #[error("Centralized gateway requires at least one gateway node!")]
    MissingGatewayNodes,
    #[error("Gateway nodes can only be set for a centralized gateway!")]
    UnexpectedGatewayNodes,
    #[error("'{}' is already the default subnet!", .0)]
    DuplicateDefault(String),
    #[error("Namespace '{}' is already bound to subnet '{}'!", .0, .1)]
    NamespaceConflict(String, String),
    #[error("Subnet still holds {} leases in the {} range it would drop!", .1, .0)]
    FamilyInUse(Protocol, usize),
}

impl SubnetDeclaration {
    pub fn from_spec(name: &str, spec: &SubnetSpec) -> Result<Self, SubnetSpecError> {
        if name.is_empty() {
            return Err(SubnetSpecError::MissingName);
        }

        let cidr: IpNetPair = spec
            .cidr_block
            .parse()
            .map_err(|_: IpPairError| SubnetSpecError::InvalidCidr(spec.cidr_block.clone()))?;
        let cidr = cidr.trunc();
        let protocol = match spec.protocol {
            Some(protocol) if protocol != cidr.protocol() => {
                return Err(SubnetSpecError::ProtocolMismatch(protocol, cidr))
            }
            _ => cidr.protocol(),
        };

        let gateway = match spec.gateway.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => raw
                .parse::<IpAddrPair>()
                .map_err(|_| SubnetSpecError::InvalidGateway(raw.to_owned()))?,
            _ => cidr.default_gateways(),
        };

        if gateway.protocol() != protocol || !cidr.contains(&gateway) {
            return Err(SubnetSpecError::GatewayOutOfRange(gateway, cidr));
        }

        let mut exclusions = Vec::with_capacity(spec.exclude_ips.len());
        for raw in &spec.exclude_ips {
            let range = parse_exclusion(raw).map_err(SubnetSpecError::InvalidExclusion)?;

            if !cidr.contains_ip(&range.first) || !cidr.contains_ip(&range.last) {
                return Err(SubnetSpecError::ExclusionOutOfRange(raw.clone(), cidr));
            }

            exclusions.push(range);
        }

        let gateway_mode = match spec.gateway_type {
            GatewayType::Distributed if !spec.gateway_nodes.is_empty() => {
                return Err(SubnetSpecError::UnexpectedGatewayNodes)
            }
            GatewayType::Distributed => GatewayMode::Distributed,
            GatewayType::Centralized if spec.gateway_nodes.is_empty() => {
                return Err(SubnetSpecError::MissingGatewayNodes)
            }
            GatewayType::Centralized => GatewayMode::Centralized {
                nodes: spec.gateway_nodes.clone(),
            },
        };

        let declaration = Self {
            name: name.to_owned(),
            default: spec.default,
            protocol,
            cidr,
            gateway,
            exclusions,
            gateway_mode,
            nat_outgoing: spec.nat_outgoing,
            private: spec.private,
            allow_subnets: spec.allow_subnets.clone(),
            namespaces: spec.namespaces.clone(),
        };

        declaration.ensure_leasable()?;

        Ok(declaration)
    }

    pub fn ipv4_pool(&self) -> Option<Ipv4Pool> {
        let (range, gateway, exclusions) = self.ipv4_parts()?;

        Some(Ipv4Pool::new(range, gateway, exclusions))
    }

    pub fn ipv6_pool(&self) -> Option<Ipv6Pool> {
        let (range, gateway, exclusions) = self.ipv6_parts()?;

        Some(Ipv6Pool::new(range, gateway, exclusions))
    }

    pub fn ipv4_parts(&self) -> Option<(Ipv4Net, Ipv4Addr, Vec<AddressRange<Ipv4Addr>>)> {
        Some((
            self.cidr.try_get_ipv4()?,
            self.gateway.try_get_ipv4()?,
            split_families(&self.exclusions).0,
        ))
    }

    pub fn ipv6_parts(&self) -> Option<(Ipv6Net, Ipv6Addr, Vec<AddressRange<Ipv6Addr>>)> {
        Some((
            self.cidr.try_get_ipv6()?,
            self.gateway.try_get_ipv6()?,
            split_families(&self.exclusions).1,
        ))
    }

    pub fn exclusions_display(&self) -> Vec<String> {
        self.exclusions.iter().map(ToString::to_string).collect()
    }

    fn ensure_leasable(&self) -> Result<(), SubnetSpecError> {
        if let Some(pool) = self.ipv4_pool() {
            if pool.capacity() == 0 {
                return Err(SubnetSpecError::EmptyRange(Protocol::IPv4));
            }
        }

        if let Some(pool) = self.ipv6_pool() {
            if pool.capacity() == 0 {
                return Err(SubnetSpecError::EmptyRange(Protocol::IPv6));
            }
        }

        Ok(())
    }
}

impl TryFrom<&Subnet> for SubnetDeclaration {
    type Error = SubnetSpecError;

    fn try_from(value: &Subnet) -> Result<Self, Self::Error> {
        let name = value.require_name_or(SubnetSpecError::MissingName)?;

        Self::from_spec(name, &value.spec)
    }
}

impl Display for GatewayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayMode::Distributed => f.write_str("distributed"),
            GatewayMode::Centralized { nodes } => {
                f.write_fmt(format_args!("centralized ({})", nodes.join(", ")))
            }
        }
    }
}
