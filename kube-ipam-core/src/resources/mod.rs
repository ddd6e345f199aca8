pub mod annotations;
pub mod crd;

/// Keeps a subnet around until its last lease is released.
pub const SUBNET_FINALIZER: &str = "kubeovn.io/subnet-protection";
