pub mod allocator;
pub mod error;
pub mod helpers;
pub mod ip;
pub mod kubernetes;
pub mod lease;
pub mod mac;
pub mod policy;
pub mod registry;
pub mod resources;
pub mod subnet;

pub const RESOURCE_GROUP: &str = "kubeovn.io";

pub const CONTROLLER_FIELD_MANAGER: &str = "kube-ipam-controller";
