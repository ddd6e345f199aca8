use std::collections::HashMap;

use log::{info, warn};

use crate::{
    error::IpamError,
    ip::{
        addrpair::{DualStackTryGet, IpAddrPair},
        PoolAddress, Protocol,
    },
    lease::{LeaseKey, LeaseRecord, LeaseRequest},
    mac::MacAddress,
    subnet::{SubnetDeclaration, SubnetSpecError},
};

use self::pool::{Ipv4Pool, Ipv6Pool, PoolError};

pub mod pool;

/// One pool per address family the subnet serves.
#[derive(Debug, Clone)]
pub enum PoolSet {
    Ipv4(Ipv4Pool),
    Ipv6(Ipv6Pool),
    Dual(Ipv4Pool, Ipv6Pool),
}

/// Everything a subnet owns: its declaration, its pools and its lease table.
#[derive(Debug, Clone)]
pub struct SubnetPools {
    declaration: SubnetDeclaration,
    pools: PoolSet,
    leases: HashMap<LeaseKey, LeaseRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubnetUsage {
    pub leased: usize,
    pub capacity: u128,
    pub utilization: f64,
}

impl PoolSet {
    pub fn new(declaration: &SubnetDeclaration) -> Result<Self, SubnetSpecError> {
        match (declaration.ipv4_pool(), declaration.ipv6_pool()) {
            (Some(ipv4), Some(ipv6)) => Ok(PoolSet::Dual(ipv4, ipv6)),
            (Some(ipv4), None) => Ok(PoolSet::Ipv4(ipv4)),
            (None, Some(ipv6)) => Ok(PoolSet::Ipv6(ipv6)),
            (None, None) => Err(SubnetSpecError::ProtocolMismatch(
                declaration.protocol,
                declaration.cidr,
            )),
        }
    }

    pub fn ipv4(&self) -> Option<&Ipv4Pool> {
        match self {
            PoolSet::Ipv4(ipv4) | PoolSet::Dual(ipv4, _) => Some(ipv4),
            PoolSet::Ipv6(_) => None,
        }
    }

    pub fn ipv6(&self) -> Option<&Ipv6Pool> {
        match self {
            PoolSet::Ipv6(ipv6) | PoolSet::Dual(_, ipv6) => Some(ipv6),
            PoolSet::Ipv4(_) => None,
        }
    }

    /// Reserves one address per family. A dual stack reservation either
    /// gets both addresses or leaves both pools as they were.
    fn reserve(
        &mut self,
        subnet: &str,
        key: &LeaseKey,
        requested: Option<IpAddrPair>,
    ) -> Result<IpAddrPair, IpamError> {
        match self {
            PoolSet::Ipv4(ipv4) => {
                let ip = match requested.as_ref().and_then(|ip| ip.try_get_ipv4()) {
                    Some(ip) => ipv4.reserve_static(key, ip),
                    None => ipv4.reserve(key),
                }
                .map_err(|error| lift(subnet, Protocol::IPv4, error))?;

                Ok(ip.into())
            }
            PoolSet::Ipv6(ipv6) => {
                let ip = match requested.as_ref().and_then(|ip| ip.try_get_ipv6()) {
                    Some(ip) => ipv6.reserve_static(key, ip),
                    None => ipv6.reserve(key),
                }
                .map_err(|error| lift(subnet, Protocol::IPv6, error))?;

                Ok(ip.into())
            }
            PoolSet::Dual(ipv4_pool, ipv6_pool) => {
                let fresh_ipv4 = ipv4_pool.get(key).is_none();
                let ipv4 = match requested.as_ref().and_then(|ip| ip.try_get_ipv4()) {
                    Some(ip) => ipv4_pool.reserve_static(key, ip),
                    None => ipv4_pool.reserve(key),
                }
                .map_err(|error| lift(subnet, Protocol::IPv4, error))?;

                let ipv6 = match requested.as_ref().and_then(|ip| ip.try_get_ipv6()) {
                    Some(ip) => ipv6_pool.reserve_static(key, ip),
                    None => ipv6_pool.reserve(key),
                };

                match ipv6 {
                    Ok(ipv6) => Ok(IpAddrPair::Ipv4v6 { ipv4, ipv6 }),
                    Err(error) => {
                        if fresh_ipv4 {
                            ipv4_pool.release(key);
                            warn!("Rolled back {ipv4} of '{key}', its IPv6 half couldn't be reserved!");
                        }

                        Err(lift(subnet, Protocol::IPv6, error))
                    }
                }
            }
        }
    }

    fn adopt(&mut self, subnet: &str, key: &LeaseKey, address: &IpAddrPair) -> Result<(), IpamError> {
        let ipv4 = address.try_get_ipv4();
        let ipv6 = address.try_get_ipv6();

        match self {
            PoolSet::Ipv4(ipv4_pool) => {
                if let Some(ip) = ipv4 {
                    ipv4_pool
                        .adopt(key, ip)
                        .map_err(|error| lift(subnet, Protocol::IPv4, error))?;
                }
            }
            PoolSet::Ipv6(ipv6_pool) => {
                if let Some(ip) = ipv6 {
                    ipv6_pool
                        .adopt(key, ip)
                        .map_err(|error| lift(subnet, Protocol::IPv6, error))?;
                }
            }
            PoolSet::Dual(ipv4_pool, ipv6_pool) => {
                let fresh_ipv4 = ipv4_pool.get(key).is_none();

                if let Some(ip) = ipv4 {
                    ipv4_pool
                        .adopt(key, ip)
                        .map_err(|error| lift(subnet, Protocol::IPv4, error))?;
                }

                if let Some(ip) = ipv6 {
                    if let Err(error) = ipv6_pool.adopt(key, ip) {
                        if fresh_ipv4 {
                            ipv4_pool.release(key);
                        }

                        return Err(lift(subnet, Protocol::IPv6, error));
                    }
                }
            }
        }

        Ok(())
    }

    fn release(&mut self, key: &LeaseKey) {
        match self {
            PoolSet::Ipv4(ipv4) => {
                ipv4.release(key);
            }
            PoolSet::Ipv6(ipv6) => {
                ipv6.release(key);
            }
            PoolSet::Dual(ipv4, ipv6) => {
                ipv4.release(key);
                ipv6.release(key);
            }
        }
    }

    /// Leasable addresses, a dual stack lease needs one of each family.
    pub fn capacity(&self) -> u128 {
        match self {
            PoolSet::Ipv4(ipv4) => ipv4.capacity(),
            PoolSet::Ipv6(ipv6) => ipv6.capacity(),
            PoolSet::Dual(ipv4, ipv6) => ipv4.capacity().min(ipv6.capacity()),
        }
    }

    pub fn utilization(&self) -> f64 {
        match self {
            PoolSet::Ipv4(ipv4) => ipv4.utilization(),
            PoolSet::Ipv6(ipv6) => ipv6.utilization(),
            PoolSet::Dual(ipv4, ipv6) => ipv4.utilization().max(ipv6.utilization()),
        }
    }
}

impl SubnetPools {
    pub fn new(declaration: SubnetDeclaration) -> Result<Self, SubnetSpecError> {
        Ok(Self {
            pools: PoolSet::new(&declaration)?,
            declaration,
            leases: HashMap::new(),
        })
    }

    pub fn declaration(&self) -> &SubnetDeclaration {
        &self.declaration
    }

    pub fn pools(&self) -> &PoolSet {
        &self.pools
    }

    /// Applies a changed declaration. Existing leases survive, even the ones
    /// the new range no longer covers. Returns how many leases that is.
    pub fn update(&mut self, declaration: SubnetDeclaration) -> Result<usize, SubnetSpecError> {
        let mut outside = 0;

        let same_families = match (&mut self.pools, declaration.ipv4_parts(), declaration.ipv6_parts()) {
            (PoolSet::Ipv4(ipv4), Some((range, gateway, exclusions)), None) => {
                outside += ipv4.update_range(range, gateway, exclusions);
                true
            }
            (PoolSet::Ipv6(ipv6), None, Some((range, gateway, exclusions))) => {
                outside += ipv6.update_range(range, gateway, exclusions);
                true
            }
            (PoolSet::Dual(ipv4, ipv6), Some(ipv4_parts), Some(ipv6_parts)) => {
                outside += ipv4.update_range(ipv4_parts.0, ipv4_parts.1, ipv4_parts.2);
                outside += ipv6.update_range(ipv6_parts.0, ipv6_parts.1, ipv6_parts.2);
                true
            }
            _ => false,
        };

        if !same_families {
            self.pools = self.migrate_families(&declaration)?;
            outside = self
                .leases
                .values()
                .filter(|lease| !self.is_leasable(&lease.address))
                .count();
        }

        if outside > 0 {
            warn!(
                "{outside} leases of subnet '{}' fall outside of its declared range, they're kept until released!",
                declaration.name
            );
        }

        self.declaration = declaration;

        Ok(outside)
    }

    /// Returns the identity's current lease or makes a new one.
    pub fn allocate(&mut self, request: &LeaseRequest) -> Result<LeaseRecord, IpamError> {
        let subnet = self.declaration.name.clone();
        let requested = match &request.static_ip {
            Some(raw) => Some(
                raw.parse::<IpAddrPair>()
                    .map_err(|_| IpamError::InvalidStaticAddress(raw.clone()))?,
            ),
            None => None,
        };

        if let Some(requested) = &requested {
            if requested.protocol() != self.declaration.protocol {
                return Err(IpamError::FamilyMismatch {
                    subnet,
                    subnet_protocol: self.declaration.protocol,
                    requested: requested.protocol(),
                });
            }
        }

        if let Some(lease) = self.leases.get_mut(&request.key) {
            if let Some(requested) = requested {
                if requested != lease.address {
                    return Err(IpamError::IdentityConflict {
                        key: request.key.clone(),
                        held: lease.address.primary(),
                    });
                }
            }

            if request.node.is_some() {
                lease.node = request.node.clone();
            }

            return Ok(lease.clone());
        }

        let mac = match &request.mac {
            Some(raw) => raw
                .parse::<MacAddress>()
                .map_err(|_| IpamError::InvalidMacAddress(raw.clone()))?,
            None => MacAddress::generate(),
        };

        let address = self.pools.reserve(&subnet, &request.key, requested)?;
        let lease = LeaseRecord {
            key: request.key.clone(),
            subnet,
            address,
            mac,
            node: request.node.clone(),
            runtime_handle: request.runtime_handle.clone(),
        };

        info!("Allocated {address} ({mac}) to '{}' in '{}'!", lease.key, lease.subnet);
        self.leases.insert(lease.key.clone(), lease.clone());

        Ok(lease)
    }

    /// Takes over a lease recorded before this controller instance started.
    pub fn adopt(&mut self, lease: LeaseRecord) -> Result<(), IpamError> {
        if let Some(existing) = self.leases.get(&lease.key) {
            if existing.address == lease.address {
                return Ok(());
            }

            return Err(IpamError::IdentityConflict {
                key: lease.key.clone(),
                held: existing.address.primary(),
            });
        }

        self.pools
            .adopt(&self.declaration.name, &lease.key, &lease.address)?;
        self.leases.insert(lease.key.clone(), lease);

        Ok(())
    }

    /// Returns the lease to the pools, a missing lease isn't an error.
    pub fn release(&mut self, key: &LeaseKey) -> Option<LeaseRecord> {
        let lease = self.leases.remove(key)?;

        self.pools.release(key);

        Some(lease)
    }

    pub fn lease(&self, key: &LeaseKey) -> Option<&LeaseRecord> {
        self.leases.get(key)
    }

    pub fn leases(&self) -> impl Iterator<Item = &LeaseRecord> {
        self.leases.values()
    }

    pub fn leased_count(&self) -> usize {
        self.leases.len()
    }

    pub fn capacity(&self) -> u128 {
        self.pools.capacity()
    }

    pub fn usage(&self) -> SubnetUsage {
        SubnetUsage {
            leased: self.leased_count(),
            capacity: self.capacity(),
            utilization: self.pools.utilization(),
        }
    }

    fn is_leasable(&self, address: &IpAddrPair) -> bool {
        let ipv4 = match (address.try_get_ipv4(), self.pools.ipv4()) {
            (Some(ip), Some(pool)) => pool.is_leasable(&ip),
            (Some(_), None) => false,
            (None, _) => true,
        };
        let ipv6 = match (address.try_get_ipv6(), self.pools.ipv6()) {
            (Some(ip), Some(pool)) => pool.is_leasable(&ip),
            (Some(_), None) => false,
            (None, _) => true,
        };

        ipv4 && ipv6
    }

    fn migrate_families(&self, declaration: &SubnetDeclaration) -> Result<PoolSet, SubnetSpecError> {
        let mut pools = PoolSet::new(declaration)?;

        for lease in self.leases.values() {
            if lease.address.try_get_ipv4().is_some() && !declaration.protocol.has_ipv4() {
                return Err(SubnetSpecError::FamilyInUse(Protocol::IPv4, self.leases.len()));
            }

            if lease.address.try_get_ipv6().is_some() && !declaration.protocol.has_ipv6() {
                return Err(SubnetSpecError::FamilyInUse(Protocol::IPv6, self.leases.len()));
            }

            pools
                .adopt(&declaration.name, &lease.key, &lease.address)
                .map_err(|_| SubnetSpecError::FamilyInUse(declaration.protocol, self.leases.len()))?;
        }

        Ok(pools)
    }
}

fn lift<IP: PoolAddress>(subnet: &str, family: Protocol, error: PoolError<IP>) -> IpamError {
    match error {
        PoolError::Exhausted => IpamError::PoolExhausted {
            subnet: subnet.to_owned(),
            family,
        },
        PoolError::AddressConflict(ip, holder) => IpamError::AddressConflict {
            address: ip.into_ip(),
            holder,
        },
        PoolError::OutOfRange(ip) => IpamError::OutOfRange {
            subnet: subnet.to_owned(),
            address: ip.into_ip(),
        },
        PoolError::IdentityConflict(key, ip) => IpamError::IdentityConflict {
            key,
            held: ip.into_ip(),
        },
    }
}
