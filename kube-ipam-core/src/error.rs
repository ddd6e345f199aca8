use std::net::IpAddr;

use thiserror::Error;

use crate::{ip::Protocol, lease::LeaseKey, subnet::SubnetSpecError};

#[derive(Debug, Error, PartialEq)]
pub enum IpamError {
    #[error("Subnet declaration is invalid! {}", .0)]
    InvalidSubnetSpec(#[from] SubnetSpecError),
    #[error("{family} range of subnet '{subnet}' is exhausted!")]
    PoolExhausted { subnet: String, family: Protocol },
    #[error("Address {address} is already leased to '{holder}'!")]
    AddressConflict { address: IpAddr, holder: LeaseKey },
    #[error("Address {address} is outside of the leasable range of subnet '{subnet}'!")]
    OutOfRange { subnet: String, address: IpAddr },
    #[error("Requested {requested} address doesn't fit {subnet_protocol} subnet '{subnet}'!")]
    FamilyMismatch {
        subnet: String,
        subnet_protocol: Protocol,
        requested: Protocol,
    },
    #[error("'{key}' already holds address {held}!")]
    IdentityConflict { key: LeaseKey, held: IpAddr },
    #[error("'{key}' already holds a lease in subnet '{subnet}'!")]
    LeasedElsewhere { key: LeaseKey, subnet: String },
    #[error("'{}' couldn't be parsed as a static address!", .0)]
    InvalidStaticAddress(String),
    #[error("'{}' couldn't be parsed as a MAC address!", .0)]
    InvalidMacAddress(String),
    #[error("Subnet '{subnet}' still holds {leases} leases!")]
    SubnetInUse { subnet: String, leases: usize },
    #[error("No subnet is bound to namespace '{}' and there's no default subnet!", .0)]
    NoSubnetBound(String),
    #[error("Subnet '{}' is not known!", .0)]
    UnknownSubnet(String),
}
