use std::{
    collections::{BTreeMap, HashMap},
    fmt::Display,
    net::{Ipv4Addr, Ipv6Addr},
};

use ipnet::{Ipv4Net, Ipv6Net};
use log::debug;
use thiserror::Error;

use crate::{
    ip::{
        exclusion::{merge_ranges, AddressRange},
        HostBounds, PoolAddress,
    },
    lease::LeaseKey,
};

pub type Ipv4Pool = AddressPool<Ipv4Addr, Ipv4Net>;
pub type Ipv6Pool = AddressPool<Ipv6Addr, Ipv6Net>;

#[derive(Debug, Clone)]
pub struct AddressPool<IP, IPNet> {
    range: IPNet,
    gateway: IP,
    /// sorted, disjoint runs that are never leased, gateway included
    excluded: Vec<AddressRange<IP>>,
    leases: HashMap<LeaseKey, IP>,
    /// leased addresses in ascending order
    reserved: BTreeMap<IP, LeaseKey>,
}

#[derive(Debug, Error, PartialEq)]
pub enum PoolError<IP: Display> {
    #[error("The leasable range is exhausted!")]
    Exhausted,
    #[error("Address {} is already leased to '{}'!", .0, .1)]
    AddressConflict(IP, LeaseKey),
    #[error("Address {} is outside of the leasable range!", .0)]
    OutOfRange(IP),
    #[error("'{}' already holds address {}!", .0, .1)]
    IdentityConflict(LeaseKey, IP),
}

impl<IP, IPNet> AddressPool<IP, IPNet>
where
    IP: PoolAddress,
    IPNet: HostBounds<IP> + Copy,
{
    pub fn new(range: IPNet, gateway: IP, exclusions: Vec<AddressRange<IP>>) -> Self {
        let mut pool = Self {
            range,
            gateway,
            excluded: Vec::new(),
            leases: HashMap::new(),
            reserved: BTreeMap::new(),
        };

        pool.rebuild_exclusions(exclusions);
        pool
    }

    /// Returns the identity's lease, or leases the lowest free address.
    pub fn reserve(&mut self, key: &LeaseKey) -> Result<IP, PoolError<IP>> {
        if let Some(ip) = self.leases.get(key) {
            return Ok(*ip);
        }

        let ip = self.next_free().ok_or(PoolError::Exhausted)?;

        self.insert(key.to_owned(), ip);
        debug!("Leased {ip} to '{key}'!");

        Ok(ip)
    }

    pub fn reserve_static(&mut self, key: &LeaseKey, ip: IP) -> Result<IP, PoolError<IP>> {
        if let Some(held) = self.leases.get(key) {
            return match *held == ip {
                true => Ok(ip),
                false => Err(PoolError::IdentityConflict(key.to_owned(), *held)),
            };
        }

        if !self.is_leasable(&ip) {
            return Err(PoolError::OutOfRange(ip));
        }

        if let Some(holder) = self.reserved.get(&ip) {
            return Err(PoolError::AddressConflict(ip, holder.to_owned()));
        }

        self.insert(key.to_owned(), ip);
        debug!("Leased static {ip} to '{key}'!");

        Ok(ip)
    }

    /// Takes over a lease made before this pool existed. Range checks are
    /// skipped, the address may predate a change of the declared range.
    pub fn adopt(&mut self, key: &LeaseKey, ip: IP) -> Result<IP, PoolError<IP>> {
        if let Some(held) = self.leases.get(key) {
            return match *held == ip {
                true => Ok(ip),
                false => Err(PoolError::IdentityConflict(key.to_owned(), *held)),
            };
        }

        if let Some(holder) = self.reserved.get(&ip) {
            return Err(PoolError::AddressConflict(ip, holder.to_owned()));
        }

        self.insert(key.to_owned(), ip);
        debug!("Adopted {ip} lease of '{key}'");

        Ok(ip)
    }

    pub fn release(&mut self, key: &LeaseKey) -> Option<IP> {
        let ip = self.leases.remove(key)?;

        self.reserved.remove(&ip);
        debug!("Released {ip} held by '{key}'!");

        Some(ip)
    }

    /// Swaps the declared range, leases are kept even when they fall
    /// outside of it. Returns how many of them do.
    pub fn update_range(
        &mut self,
        range: IPNet,
        gateway: IP,
        exclusions: Vec<AddressRange<IP>>,
    ) -> usize {
        self.range = range;
        self.gateway = gateway;
        self.rebuild_exclusions(exclusions);

        self.reserved
            .keys()
            .filter(|ip| !self.is_leasable(ip))
            .count()
    }

    pub fn get(&self, key: &LeaseKey) -> Option<IP> {
        self.leases.get(key).copied()
    }

    pub fn holder(&self, ip: &IP) -> Option<&LeaseKey> {
        self.reserved.get(ip)
    }

    pub fn leases(&self) -> impl Iterator<Item = (&LeaseKey, &IP)> {
        self.leases.iter()
    }

    pub fn leased_count(&self) -> usize {
        self.leases.len()
    }

    pub fn range(&self) -> IPNet {
        self.range
    }

    pub fn gateway(&self) -> IP {
        self.gateway
    }

    pub fn excluded(&self) -> &[AddressRange<IP>] {
        &self.excluded
    }

    /// Number of addresses that can ever be leased from the current range.
    pub fn capacity(&self) -> u128 {
        let (first, last) = self.range.host_bounds();
        let hosts = last.to_offset() - first.to_offset() + 1;
        let excluded: u128 = self.excluded.iter().map(AddressRange::size).sum();

        hosts.saturating_sub(excluded)
    }

    pub fn utilization(&self) -> f64 {
        let in_range = self
            .reserved
            .keys()
            .filter(|ip| self.is_leasable(ip))
            .count();

        match self.capacity() {
            0 => 100.0,
            capacity => (in_range as f64 / capacity as f64 * 100.0).min(100.0),
        }
    }

    pub fn is_leasable(&self, ip: &IP) -> bool {
        let (first, last) = self.range.host_bounds();

        if *ip < first || *ip > last {
            return false;
        }

        let index = self.excluded.partition_point(|range| range.last < *ip);

        !self
            .excluded
            .get(index)
            .map(|range| range.contains(ip))
            .unwrap_or(false)
    }

    /// Ascending scan that jumps over excluded runs and walks the sorted
    /// lease set alongside, so the same pool state always yields the same
    /// address.
    pub fn next_free(&self) -> Option<IP> {
        let (first, last) = self.range.host_bounds();
        let last = last.to_offset();
        let mut candidate = first.to_offset();
        let mut exclusions = self
            .excluded
            .iter()
            .map(|range| (range.first.to_offset(), range.last.to_offset()))
            .peekable();
        let mut leased = self
            .reserved
            .range(first..)
            .map(|(ip, _)| ip.to_offset())
            .peekable();

        while candidate <= last {
            if let Some(&(excluded_first, excluded_last)) = exclusions.peek() {
                if excluded_last < candidate {
                    exclusions.next();
                    continue;
                }

                if excluded_first <= candidate {
                    candidate = excluded_last.checked_add(1)?;
                    exclusions.next();
                    continue;
                }
            }

            if let Some(&leased_ip) = leased.peek() {
                if leased_ip < candidate {
                    leased.next();
                    continue;
                }

                if leased_ip == candidate {
                    candidate = candidate.checked_add(1)?;
                    leased.next();
                    continue;
                }
            }

            return Some(IP::from_offset(candidate));
        }

        None
    }

    fn insert(&mut self, key: LeaseKey, ip: IP) {
        self.reserved.insert(ip, key.clone());
        self.leases.insert(key, ip);
    }

    fn rebuild_exclusions(&mut self, exclusions: Vec<AddressRange<IP>>) {
        let (first, last) = self.range.host_bounds();

        self.excluded = merge_ranges(
            exclusions
                .into_iter()
                .chain(std::iter::once(AddressRange::single(self.gateway)))
                .filter_map(|range| range.clamp(first, last)),
        );
    }
}
