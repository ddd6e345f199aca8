use std::{
    fmt::{Display, Formatter},
    net::IpAddr,
    str::FromStr,
};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    addrpair::{DualStackTryGet, IpAddrPair},
    parse_families, Contains, Family, HostBounds, IpPairError, Protocol,
};

/// A subnet's CIDR block, dual stack subnets carry one network per family.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(untagged)]
pub enum IpNetPair {
    Ipv4v6 { netv4: Ipv4Net, netv6: Ipv6Net },
    Ipv4 { netv4: Ipv4Net },
    Ipv6 { netv6: Ipv6Net },
}

impl DualStackTryGet for IpNetPair {
    type V4 = Ipv4Net;
    type V6 = Ipv6Net;

    fn try_get_ipv4(&self) -> Option<Ipv4Net> {
        match self {
            IpNetPair::Ipv4 { netv4 } | IpNetPair::Ipv4v6 { netv4, .. } => Some(*netv4),
            IpNetPair::Ipv6 { .. } => None,
        }
    }

    fn try_get_ipv6(&self) -> Option<Ipv6Net> {
        match self {
            IpNetPair::Ipv6 { netv6 } | IpNetPair::Ipv4v6 { netv6, .. } => Some(*netv6),
            IpNetPair::Ipv4 { .. } => None,
        }
    }
}

impl IpNetPair {
    fn from_families(netv4: Option<Ipv4Net>, netv6: Option<Ipv6Net>) -> Option<Self> {
        match (netv4, netv6) {
            (Some(netv4), Some(netv6)) => Some(IpNetPair::Ipv4v6 { netv4, netv6 }),
            (Some(netv4), None) => Some(IpNetPair::Ipv4 { netv4 }),
            (None, Some(netv6)) => Some(IpNetPair::Ipv6 { netv6 }),
            (None, None) => None,
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            IpNetPair::Ipv4 { .. } => Protocol::IPv4,
            IpNetPair::Ipv6 { .. } => Protocol::IPv6,
            IpNetPair::Ipv4v6 { .. } => Protocol::Dual,
        }
    }

    /// Same networks with the host bits cleared, `10.16.3.7/16` becomes `10.16.0.0/16`.
    pub fn trunc(&self) -> Self {
        let netv4 = self.try_get_ipv4().map(|net| net.trunc());
        let netv6 = self.try_get_ipv6().map(|net| net.trunc());

        Self::from_families(netv4, netv6).unwrap_or(*self)
    }

    /// First host address of every family, the gateway a subnet gets when
    /// it doesn't name one.
    pub fn default_gateways(&self) -> IpAddrPair {
        match self {
            IpNetPair::Ipv4 { netv4 } => netv4.host_bounds().0.into(),
            IpNetPair::Ipv6 { netv6 } => netv6.host_bounds().0.into(),
            IpNetPair::Ipv4v6 { netv4, netv6 } => IpAddrPair::Ipv4v6 {
                ipv4: netv4.host_bounds().0,
                ipv6: netv6.host_bounds().0,
            },
        }
    }

    pub fn contains_ip(&self, ip: &IpAddr) -> bool {
        match ip {
            IpAddr::V4(ipv4) => self.try_get_ipv4().is_some_and(|net| net.contains(ipv4)),
            IpAddr::V6(ipv6) => self.try_get_ipv6().is_some_and(|net| net.contains(ipv6)),
        }
    }
}

/// Every family of the address has to fall into the matching network.
impl Contains<IpAddrPair> for IpNetPair {
    fn contains(&self, other: &IpAddrPair) -> bool {
        let ipv4 = other
            .try_get_ipv4()
            .map_or(true, |ipv4| self.contains_ip(&IpAddr::V4(ipv4)));
        let ipv6 = other
            .try_get_ipv6()
            .map_or(true, |ipv6| self.contains_ip(&IpAddr::V6(ipv6)));

        ipv4 && ipv6
    }
}

impl Display for IpNetPair {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display_families())
    }
}

impl FromStr for IpNetPair {
    type Err = IpPairError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (netv4, netv6) = parse_families(s, |part| match part.parse::<IpNet>().ok()? {
            IpNet::V4(netv4) => Some(Family::V4(netv4)),
            IpNet::V6(netv6) => Some(Family::V6(netv6)),
        })?;

        Self::from_families(netv4, netv6).ok_or(IpPairError::Invalid)
    }
}
