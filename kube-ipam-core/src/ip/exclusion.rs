use std::{
    fmt::{Display, Formatter},
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use itertools::Itertools;
use thiserror::Error;

use super::PoolAddress;

pub const RANGE_SEPARATOR: &str = "..";

/// Inclusive run of addresses, `first..last` in declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressRange<IP> {
    pub first: IP,
    pub last: IP,
}

#[derive(Debug, Error, PartialEq)]
pub enum ExclusionError {
    #[error("'{}' is not an IP address or an address range!", .0)]
    Invalid(String),
    #[error("'{}' mixes IPv4 and IPv6 addresses!", .0)]
    MixedFamilies(String),
    #[error("'{}' ends before it starts!", .0)]
    Reversed(String),
}

impl<IP: PoolAddress> AddressRange<IP> {
    pub fn single(ip: IP) -> Self {
        Self { first: ip, last: ip }
    }

    pub fn contains(&self, ip: &IP) -> bool {
        &self.first <= ip && ip <= &self.last
    }

    pub fn size(&self) -> u128 {
        self.last.to_offset() - self.first.to_offset() + 1
    }

    /// The part of this range that lies within `[first, last]`, if any.
    pub fn clamp(&self, first: IP, last: IP) -> Option<Self> {
        let clamped = Self {
            first: self.first.max(first),
            last: self.last.min(last),
        };

        (clamped.first <= clamped.last).then_some(clamped)
    }
}

impl<IP: Display + PartialEq> Display for AddressRange<IP> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.first == self.last {
            return f.write_fmt(format_args!("{}", self.first));
        }

        f.write_fmt(format_args!("{}{RANGE_SEPARATOR}{}", self.first, self.last))
    }
}

pub fn parse_exclusion(raw: &str) -> Result<AddressRange<IpAddr>, ExclusionError> {
    let invalid = || ExclusionError::Invalid(raw.to_owned());
    let mut split = raw.trim().splitn(2, RANGE_SEPARATOR);
    let first = split
        .next()
        .ok_or_else(invalid)?
        .trim()
        .parse::<IpAddr>()
        .map_err(|_| invalid())?;
    let last = match split.next() {
        Some(last) => last.trim().parse::<IpAddr>().map_err(|_| invalid())?,
        None => first,
    };

    if first.is_ipv4() != last.is_ipv4() {
        return Err(ExclusionError::MixedFamilies(raw.to_owned()));
    }

    if last < first {
        return Err(ExclusionError::Reversed(raw.to_owned()));
    }

    Ok(AddressRange { first, last })
}

pub fn split_families(
    ranges: &[AddressRange<IpAddr>],
) -> (Vec<AddressRange<Ipv4Addr>>, Vec<AddressRange<Ipv6Addr>>) {
    let mut ipv4 = Vec::new();
    let mut ipv6 = Vec::new();

    for range in ranges {
        match (range.first, range.last) {
            (IpAddr::V4(first), IpAddr::V4(last)) => ipv4.push(AddressRange { first, last }),
            (IpAddr::V6(first), IpAddr::V6(last)) => ipv6.push(AddressRange { first, last }),
            _ => (), // rejected by parse_exclusion
        }
    }

    (ipv4, ipv6)
}

/// Sorts ranges and folds overlapping or adjacent ones together.
pub fn merge_ranges<IP: PoolAddress>(
    ranges: impl IntoIterator<Item = AddressRange<IP>>,
) -> Vec<AddressRange<IP>> {
    ranges
        .into_iter()
        .sorted_by_key(|range| range.first)
        .coalesce(|previous, next| {
            if next.first.to_offset() <= previous.last.to_offset().saturating_add(1) {
                Ok(AddressRange {
                    first: previous.first,
                    last: previous.last.max(next.last),
                })
            } else {
                Err((previous, next))
            }
        })
        .collect()
}
