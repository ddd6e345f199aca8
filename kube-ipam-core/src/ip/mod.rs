use std::{
    fmt::{Display, Formatter},
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod addrpair;
pub mod exclusion;
pub mod netpair;

#[derive(Debug, Error)]
pub enum IpPairError {
    #[error("Couldn't parse IP address/CIDR!")]
    Invalid,
    #[error("The value contained two IPv4 addresses/CIDRs!")]
    DuplicateIpv4,
    #[error("The value contained two IPv6 addresses/CIDRs!")]
    DuplicateIpv6,
}

/// One half of a dual stack value.
pub(crate) enum Family<V4, V6> {
    V4(V4),
    V6(V6),
}

/// Parses `first[,second]` into at most one value per family, in any order.
pub(crate) fn parse_families<V4, V6>(
    raw: &str,
    parse: impl Fn(&str) -> Option<Family<V4, V6>>,
) -> Result<(Option<V4>, Option<V6>), IpPairError> {
    let mut ipv4 = None;
    let mut ipv6 = None;

    for part in raw.split(',').map(str::trim) {
        match parse(part).ok_or(IpPairError::Invalid)? {
            Family::V4(_) if ipv4.is_some() => return Err(IpPairError::DuplicateIpv4),
            Family::V6(_) if ipv6.is_some() => return Err(IpPairError::DuplicateIpv6),
            Family::V4(value) => ipv4 = Some(value),
            Family::V6(value) => ipv6 = Some(value),
        }
    }

    Ok((ipv4, ipv6))
}

/// Address family (or families) a subnet serves.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub enum Protocol {
    #[default]
    IPv4,
    IPv6,
    Dual,
}

impl Protocol {
    pub fn has_ipv4(&self) -> bool {
        matches!(self, Protocol::IPv4 | Protocol::Dual)
    }

    pub fn has_ipv6(&self) -> bool {
        matches!(self, Protocol::IPv6 | Protocol::Dual)
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::IPv4 => f.write_str("IPv4"),
            Protocol::IPv6 => f.write_str("IPv6"),
            Protocol::Dual => f.write_str("Dual"),
        }
    }
}

pub trait Contains<T> {
    fn contains(&self, other: &T) -> bool;
}

impl Contains<Ipv4Addr> for Ipv4Net {
    fn contains(&self, other: &Ipv4Addr) -> bool {
        self.contains(other)
    }
}

impl Contains<Ipv6Addr> for Ipv6Net {
    fn contains(&self, other: &Ipv6Addr) -> bool {
        self.contains(other)
    }
}

/// Address types the pool can scan, mapped onto a flat integer space.
pub trait PoolAddress: Copy + Ord + std::hash::Hash + std::fmt::Debug + std::fmt::Display + Send + Sync {
    fn to_offset(self) -> u128;
    fn from_offset(offset: u128) -> Self;
    fn into_ip(self) -> IpAddr;
}

impl PoolAddress for Ipv4Addr {
    fn to_offset(self) -> u128 {
        u32::from(self) as u128
    }

    fn from_offset(offset: u128) -> Self {
        Ipv4Addr::from(offset as u32)
    }

    fn into_ip(self) -> IpAddr {
        IpAddr::V4(self)
    }
}

impl PoolAddress for Ipv6Addr {
    fn to_offset(self) -> u128 {
        u128::from(self)
    }

    fn from_offset(offset: u128) -> Self {
        Ipv6Addr::from(offset)
    }

    fn into_ip(self) -> IpAddr {
        IpAddr::V6(self)
    }
}

/// First and last address a workload may ever receive from a network,
/// before gateway and exclusions are taken out.
pub trait HostBounds<IP>: Contains<IP> {
    fn host_bounds(&self) -> (IP, IP);
}

impl HostBounds<Ipv4Addr> for Ipv4Net {
    fn host_bounds(&self) -> (Ipv4Addr, Ipv4Addr) {
        let network = u32::from(self.network());
        let broadcast = u32::from(self.broadcast());

        match self.prefix_len() {
            32 | 31 => (network.into(), broadcast.into()),
            _ => ((network + 1).into(), (broadcast - 1).into()),
        }
    }
}

impl HostBounds<Ipv6Addr> for Ipv6Net {
    fn host_bounds(&self) -> (Ipv6Addr, Ipv6Addr) {
        let network = u128::from(self.network());
        let broadcast = u128::from(self.broadcast());

        // the subnet-router anycast address is never handed out
        match self.prefix_len() {
            128 => (network.into(), broadcast.into()),
            _ => ((network + 1).into(), broadcast.into()),
        }
    }
}

/// Gateway used when a subnet doesn't declare one: the first host address.
pub fn default_gateway(cidr: &IpNet) -> IpAddr {
    match cidr {
        IpNet::V4(net) => IpAddr::V4(net.host_bounds().0),
        IpNet::V6(net) => IpAddr::V6(net.host_bounds().0),
    }
}
