use std::{
    fmt::{Display, Formatter},
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

use itertools::Itertools;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{parse_families, Family, IpPairError, Protocol};

/// A gateway or lease address, one per family the subnet serves.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
#[serde(untagged)]
pub enum IpAddrPair {
    Ipv4v6 { ipv4: Ipv4Addr, ipv6: Ipv6Addr },
    Ipv4 { ipv4: Ipv4Addr },
    Ipv6 { ipv6: Ipv6Addr },
}

/// Access to the per-family halves of a dual stack value.
pub trait DualStackTryGet {
    type V4: Display;
    type V6: Display;

    fn try_get_ipv4(&self) -> Option<Self::V4>;
    fn try_get_ipv6(&self) -> Option<Self::V6>;

    /// Both halves, IPv4 first, comma separated.
    fn display_families(&self) -> String {
        let ipv4 = self.try_get_ipv4().map(|value| value.to_string());
        let ipv6 = self.try_get_ipv6().map(|value| value.to_string());

        ipv4.into_iter().chain(ipv6).join(",")
    }
}

impl DualStackTryGet for IpAddrPair {
    type V4 = Ipv4Addr;
    type V6 = Ipv6Addr;

    fn try_get_ipv4(&self) -> Option<Ipv4Addr> {
        match self {
            IpAddrPair::Ipv4 { ipv4 } | IpAddrPair::Ipv4v6 { ipv4, .. } => Some(*ipv4),
            IpAddrPair::Ipv6 { .. } => None,
        }
    }

    fn try_get_ipv6(&self) -> Option<Ipv6Addr> {
        match self {
            IpAddrPair::Ipv6 { ipv6 } | IpAddrPair::Ipv4v6 { ipv6, .. } => Some(*ipv6),
            IpAddrPair::Ipv4 { .. } => None,
        }
    }
}

impl IpAddrPair {
    pub fn from_families(ipv4: Option<Ipv4Addr>, ipv6: Option<Ipv6Addr>) -> Option<Self> {
        match (ipv4, ipv6) {
            (Some(ipv4), Some(ipv6)) => Some(IpAddrPair::Ipv4v6 { ipv4, ipv6 }),
            (Some(ipv4), None) => Some(IpAddrPair::Ipv4 { ipv4 }),
            (None, Some(ipv6)) => Some(IpAddrPair::Ipv6 { ipv6 }),
            (None, None) => None,
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            IpAddrPair::Ipv4 { .. } => Protocol::IPv4,
            IpAddrPair::Ipv6 { .. } => Protocol::IPv6,
            IpAddrPair::Ipv4v6 { .. } => Protocol::Dual,
        }
    }

    /// IPv4 half of a dual stack pair, the only address otherwise.
    pub fn primary(&self) -> IpAddr {
        match self {
            IpAddrPair::Ipv4v6 { ipv4, .. } | IpAddrPair::Ipv4 { ipv4 } => IpAddr::V4(*ipv4),
            IpAddrPair::Ipv6 { ipv6 } => IpAddr::V6(*ipv6),
        }
    }
}

impl Display for IpAddrPair {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display_families())
    }
}

impl FromStr for IpAddrPair {
    type Err = IpPairError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ipv4, ipv6) = parse_families(s, |part| match part.parse::<IpAddr>().ok()? {
            IpAddr::V4(ipv4) => Some(Family::V4(ipv4)),
            IpAddr::V6(ipv6) => Some(Family::V6(ipv6)),
        })?;

        Self::from_families(ipv4, ipv6).ok_or(IpPairError::Invalid)
    }
}

impl From<Ipv4Addr> for IpAddrPair {
    fn from(ipv4: Ipv4Addr) -> Self {
        IpAddrPair::Ipv4 { ipv4 }
    }
}

impl From<Ipv6Addr> for IpAddrPair {
    fn from(ipv6: Ipv6Addr) -> Self {
        IpAddrPair::Ipv6 { ipv6 }
    }
}
