use std::{
    collections::HashMap,
    ops::{Deref, DerefMut},
    sync::Arc,
};

use log::{debug, info};
use tokio::sync::RwLock;

use crate::{
    allocator::{SubnetPools, SubnetUsage},
    error::IpamError,
    lease::{LeaseKey, LeaseRecord, LeaseRequest},
    policy::{can_reach, Reachability},
    subnet::{SubnetDeclaration, SubnetSpecError},
};

/// Subnet pools behind their own lock, so that allocations in different
/// subnets never wait on each other.
pub struct SubnetSync(RwLock<SubnetPools>);

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    pub created: bool,
    /// leases kept although the declared range no longer covers them
    pub outside: usize,
    pub usage: SubnetUsage,
}

#[derive(Debug, Clone)]
struct SubnetBinding {
    default: bool,
    namespaces: Vec<String>,
}

#[derive(Default)]
struct RegistryIndex {
    subnets: HashMap<String, Arc<SubnetSync>>,
    bindings: HashMap<String, SubnetBinding>,
}

/// Every known subnet by name. The index lock is only held for lookups and
/// declaration changes, pool work happens under the subnet's own lock.
#[derive(Default)]
pub struct SubnetRegistry {
    index: RwLock<RegistryIndex>,
}

impl RegistryIndex {
    fn check_bindings(&self, declaration: &SubnetDeclaration) -> Result<(), SubnetSpecError> {
        for (name, binding) in self.bindings.iter() {
            if *name == declaration.name {
                continue;
            }

            if declaration.default && binding.default {
                return Err(SubnetSpecError::DuplicateDefault(name.to_owned()));
            }

            if let Some(namespace) = declaration
                .namespaces
                .iter()
                .find(|namespace| binding.namespaces.contains(namespace))
            {
                return Err(SubnetSpecError::NamespaceConflict(
                    namespace.to_owned(),
                    name.to_owned(),
                ));
            }
        }

        Ok(())
    }

    fn require(&self, name: &str) -> Result<&Arc<SubnetSync>, IpamError> {
        self.subnets
            .get(name)
            .ok_or_else(|| IpamError::UnknownSubnet(name.to_owned()))
    }

    /// Fails if the identity holds a lease in any subnet but `subnet`.
    async fn ensure_single_lease(&self, subnet: &str, key: &LeaseKey) -> Result<(), IpamError> {
        for (name, pools) in self.subnets.iter().filter(|(name, _)| name.as_str() != subnet) {
            if pools.read().await.lease(key).is_some() {
                return Err(IpamError::LeasedElsewhere {
                    key: key.to_owned(),
                    subnet: name.to_owned(),
                });
            }
        }

        Ok(())
    }
}

impl SubnetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subnet or applies a changed declaration to an existing one.
    pub async fn upsert(&self, declaration: SubnetDeclaration) -> Result<UpsertOutcome, IpamError> {
        let mut index = self.index.write().await;

        index.check_bindings(&declaration)?;

        let name = declaration.name.clone();
        let binding = SubnetBinding {
            default: declaration.default,
            namespaces: declaration.namespaces.clone(),
        };

        let outcome = match index.subnets.get(&name) {
            Some(subnet) => {
                let mut pools = subnet.write().await;
                let outside = pools.update(declaration)?;

                UpsertOutcome {
                    created: false,
                    outside,
                    usage: pools.usage(),
                }
            }
            None => {
                let pools = SubnetPools::new(declaration)?;
                let usage = pools.usage();

                index.subnets.insert(name.clone(), Arc::new(pools.into()));
                info!("Registered subnet '{name}'!");

                UpsertOutcome {
                    created: true,
                    outside: 0,
                    usage,
                }
            }
        };

        index.bindings.insert(name, binding);

        Ok(outcome)
    }

    /// Drops a subnet that holds no leases. Removing an unknown subnet is a no-op.
    pub async fn remove(&self, name: &str) -> Result<Option<SubnetDeclaration>, IpamError> {
        let mut index = self.index.write().await;

        let Some(subnet) = index.subnets.get(name) else {
            return Ok(None);
        };

        let declaration = {
            let pools = subnet.read().await;

            if pools.leased_count() > 0 {
                return Err(IpamError::SubnetInUse {
                    subnet: name.to_owned(),
                    leases: pools.leased_count(),
                });
            }

            pools.declaration().clone()
        };

        index.subnets.remove(name);
        index.bindings.remove(name);
        info!("Removed subnet '{name}'!");

        Ok(Some(declaration))
    }

    /// Picks the subnet serving a request: the explicit one if set, then the
    /// namespace binding, then the default subnet.
    pub async fn resolve(&self, request: &LeaseRequest) -> Result<String, IpamError> {
        let index = self.index.read().await;

        if let Some(subnet) = &request.subnet {
            return match index.subnets.contains_key(subnet) {
                true => Ok(subnet.to_owned()),
                false => Err(IpamError::UnknownSubnet(subnet.to_owned())),
            };
        }

        let namespace = &request.key.namespace;
        let bound = index
            .bindings
            .iter()
            .find(|(_, binding)| binding.namespaces.contains(namespace))
            .or_else(|| index.bindings.iter().find(|(_, binding)| binding.default));

        match bound {
            Some((name, _)) => Ok(name.to_owned()),
            None => Err(IpamError::NoSubnetBound(namespace.to_owned())),
        }
    }

    /// Leases an address in `name`. The index stays read locked until the
    /// subnet is, so a concurrent `remove` can't drop the pool in between.
    pub async fn allocate(&self, name: &str, request: &LeaseRequest) -> Result<LeaseRecord, IpamError> {
        let index = self.index.read().await;
        let subnet = index.require(name)?;

        index.ensure_single_lease(name, &request.key).await?;

        let mut pools = subnet.write().await;

        pools.allocate(request)
    }

    /// Re-registers a lease recorded by an earlier controller instance.
    pub async fn adopt(&self, lease: LeaseRecord) -> Result<(), IpamError> {
        let index = self.index.read().await;
        let subnet = index.require(&lease.subnet)?;

        index.ensure_single_lease(&lease.subnet, &lease.key).await?;

        let mut pools = subnet.write().await;

        debug!("Adopting {} lease of '{}'...", lease.address, lease.key);
        pools.adopt(lease)
    }

    /// Releases the identity's lease wherever it's held.
    pub async fn release(&self, key: &LeaseKey) -> Option<LeaseRecord> {
        for subnet in self.subnets().await {
            let mut pools = subnet.write().await;

            if let Some(lease) = pools.release(key) {
                return Some(lease);
            }
        }

        None
    }

    pub async fn locate(&self, key: &LeaseKey) -> Option<LeaseRecord> {
        for subnet in self.subnets().await {
            let pools = subnet.read().await;

            if let Some(lease) = pools.lease(key) {
                return Some(lease.clone());
            }
        }

        None
    }

    pub async fn leases(&self, name: &str) -> Option<Vec<LeaseRecord>> {
        let subnet = self.get(name).await?;
        let pools = subnet.read().await;

        Some(pools.leases().cloned().collect())
    }

    pub async fn declaration(&self, name: &str) -> Option<SubnetDeclaration> {
        let subnet = self.get(name).await?;
        let pools = subnet.read().await;

        Some(pools.declaration().clone())
    }

    pub async fn declarations(&self) -> Vec<SubnetDeclaration> {
        let mut declarations = Vec::new();

        for subnet in self.subnets().await {
            declarations.push(subnet.read().await.declaration().clone());
        }

        declarations
    }

    /// Reachability between two registered subnets.
    pub async fn can_reach(&self, source: &str, destination: &str) -> Result<Reachability, IpamError> {
        let source = self
            .declaration(source)
            .await
            .ok_or_else(|| IpamError::UnknownSubnet(source.to_owned()))?;
        let destination = self
            .declaration(destination)
            .await
            .ok_or_else(|| IpamError::UnknownSubnet(destination.to_owned()))?;

        Ok(can_reach(&source, &destination))
    }

    pub async fn usage(&self, name: &str) -> Option<SubnetUsage> {
        let subnet = self.get(name).await?;
        let pools = subnet.read().await;

        Some(pools.usage())
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.index.read().await.subnets.contains_key(name)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<SubnetSync>> {
        self.index.read().await.subnets.get(name).cloned()
    }

    async fn subnets(&self) -> Vec<Arc<SubnetSync>> {
        self.index.read().await.subnets.values().cloned().collect()
    }
}

impl Deref for SubnetSync {
    type Target = RwLock<SubnetPools>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SubnetSync {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<SubnetPools> for SubnetSync {
    fn from(value: SubnetPools) -> Self {
        Self(RwLock::new(value))
    }
}
