use std::collections::BTreeMap;

use crate::{ip::addrpair::IpAddrPair, ip::netpair::IpNetPair, lease::LeaseRecord};

pub const LOGICAL_SWITCH_ANNOTATION: &str = "ovn.kubernetes.io/logical_switch";
pub const IP_ADDRESS_ANNOTATION: &str = "ovn.kubernetes.io/ip_address";
pub const MAC_ADDRESS_ANNOTATION: &str = "ovn.kubernetes.io/mac_address";
pub const ALLOCATED_ANNOTATION: &str = "ovn.kubernetes.io/allocated";
pub const CIDR_ANNOTATION: &str = "ovn.kubernetes.io/cidr";
pub const GATEWAY_ANNOTATION: &str = "ovn.kubernetes.io/gateway";

/// Annotations the CNI plugin reads the lease from.
pub fn get_lease_annotations(
    lease: &LeaseRecord,
    cidr: &IpNetPair,
    gateway: &IpAddrPair,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (ALLOCATED_ANNOTATION.to_owned(), "true".to_owned()),
        (IP_ADDRESS_ANNOTATION.to_owned(), lease.address.to_string()),
        (MAC_ADDRESS_ANNOTATION.to_owned(), lease.mac.to_string()),
        (CIDR_ANNOTATION.to_owned(), cidr.to_string()),
        (GATEWAY_ANNOTATION.to_owned(), gateway.to_string()),
        (LOGICAL_SWITCH_ANNOTATION.to_owned(), lease.subnet.clone()),
    ])
}
