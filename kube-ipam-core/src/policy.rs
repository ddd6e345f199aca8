use std::fmt::{Display, Formatter};

use crate::subnet::{GatewayMode, SubnetDeclaration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Allow,
    Deny,
}

/// Where a workload's egress traffic leaves the cluster network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EgressRoute {
    /// through the node the workload runs on, unknown until it's scheduled
    Local(Option<String>),
    Centralized(Vec<String>),
}

/// Whether `source` may send traffic into `destination`.
pub fn can_reach(source: &SubnetDeclaration, destination: &SubnetDeclaration) -> Reachability {
    if !destination.private
        || source.name == destination.name
        || destination.allow_subnets.contains(&source.name)
    {
        return Reachability::Allow;
    }

    Reachability::Deny
}

/// NAT is decided by the subnet alone, isolation doesn't affect it.
pub fn nat_outgoing(subnet: &SubnetDeclaration) -> bool {
    subnet.nat_outgoing
}

/// Allow-list entries that name a known subnet, sorted and deduplicated.
/// Entries naming subnets that don't exist (yet) are left out.
pub fn resolve_allow_list<'a>(
    subnet: &SubnetDeclaration,
    known: impl IntoIterator<Item = &'a SubnetDeclaration>,
) -> Vec<String> {
    let known = known
        .into_iter()
        .map(|declaration| declaration.name.as_str())
        .collect::<Vec<_>>();

    let mut resolved = subnet
        .allow_subnets
        .iter()
        .filter(|name| known.contains(&name.as_str()))
        .cloned()
        .collect::<Vec<_>>();

    resolved.sort();
    resolved.dedup();
    resolved
}

pub fn egress_route(subnet: &SubnetDeclaration, node: Option<&str>) -> EgressRoute {
    match &subnet.gateway_mode {
        GatewayMode::Distributed => EgressRoute::Local(node.map(str::to_owned)),
        GatewayMode::Centralized { nodes } => EgressRoute::Centralized(nodes.clone()),
    }
}

impl Display for Reachability {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Reachability::Allow => f.write_str("allow"),
            Reachability::Deny => f.write_str("deny"),
        }
    }
}

impl Display for EgressRoute {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EgressRoute::Local(Some(node)) => f.write_fmt(format_args!("local via {node}")),
            EgressRoute::Local(None) => f.write_str("local"),
            EgressRoute::Centralized(nodes) => {
                f.write_fmt(format_args!("centralized via {}", nodes.join(",")))
            }
        }
    }
}
