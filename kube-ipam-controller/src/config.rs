use std::time::Duration;

use clap::Parser;
use kube_ipam_core::resources::crd::v1::subnet::{Subnet, SubnetSpec};

pub const DEFAULT_SUBNET_NAME: &str = "ovn-default";
pub const DEFAULT_SUBNET_CIDR: &str = "10.16.0.0/16";
pub const NODE_SWITCH_NAME: &str = "join";
pub const NODE_SWITCH_CIDR: &str = "100.64.0.0/16";

#[derive(Debug, Clone, Parser)]
#[command(version, about)]
pub struct Configuration {
    /// override default kubeconfig
    #[arg(long, env = "KUBE_IPAM_KUBECONFIG")]
    pub kube_config: Option<String>,
    /// override default kubeconfig context
    #[arg(long)]
    pub kube_context: Option<String>,
    /// name of the subnet used by namespaces without an explicit binding
    #[arg(long, env = "KUBE_IPAM_DEFAULT_SUBNET", default_value = DEFAULT_SUBNET_NAME)]
    pub default_subnet: String,
    #[arg(long, env = "KUBE_IPAM_DEFAULT_CIDR", default_value = DEFAULT_SUBNET_CIDR)]
    pub default_cidr: String,
    /// defaults to the first host address of the default CIDR
    #[arg(long)]
    pub default_gateway: Option<String>,
    /// addresses or `first..last` ranges never leased from the default subnet
    #[arg(long, value_delimiter = ',')]
    pub default_exclude_ips: Vec<String>,
    /// name of the subnet connecting nodes to the cluster network
    #[arg(long, default_value = NODE_SWITCH_NAME)]
    pub node_switch: String,
    #[arg(long, default_value = NODE_SWITCH_CIDR)]
    pub node_switch_cidr: String,
    /// defaults to the first host address of the node switch CIDR
    #[arg(long)]
    pub node_switch_gateway: Option<String>,
    /// number of concurrent reconciliation workers
    #[arg(long, env = "KUBE_IPAM_WORKERS", default_value_t = 3)]
    pub workers: usize,
    /// seconds a single reconciliation may take before it's abandoned and requeued
    #[arg(long, default_value_t = 30)]
    pub deadline_secs: u64,
    /// attempts a retryable failure gets before it's reported as failed
    #[arg(long, default_value_t = 8)]
    pub retry_budget: u32,
    #[arg(long, default_value_t = 500)]
    pub backoff_base_ms: u64,
    #[arg(long, default_value_t = 60)]
    pub backoff_cap_secs: u64,
    /// seconds between full resyncs
    #[arg(long, default_value_t = 300)]
    pub resync_secs: u64,
    /// enable verbose output
    #[arg(short = 'v', long = "verbose")]
    pub verbose_logging: bool,
    /// enable trace output (more detailed than verbose, overrides it if present)
    #[arg(long = "trace")]
    pub trace_logging: bool,
}

pub enum LogLevel {
    Normal,
    Verbose,
    Trace,
}

/// Settings the workers and the queue run with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub deadline: Duration,
    pub budget: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Configuration {
    pub fn get_log_level(&self) -> LogLevel {
        if self.trace_logging {
            return LogLevel::Trace;
        }

        if self.verbose_logging {
            return LogLevel::Verbose;
        }

        LogLevel::Normal
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            deadline: Duration::from_secs(self.deadline_secs),
            budget: self.retry_budget.max(1),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_cap: Duration::from_secs(self.backoff_cap_secs),
        }
    }

    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_secs.max(1))
    }

    /// Subnets the controller creates on start unless they already exist.
    pub fn bootstrap_subnets(&self) -> Vec<Subnet> {
        vec![
            Subnet::new(
                &self.default_subnet,
                SubnetSpec {
                    default: true,
                    cidr_block: self.default_cidr.clone(),
                    gateway: self.default_gateway.clone(),
                    exclude_ips: self.default_exclude_ips.clone(),
                    ..Default::default()
                },
            ),
            Subnet::new(
                &self.node_switch,
                SubnetSpec {
                    cidr_block: self.node_switch_cidr.clone(),
                    gateway: self.node_switch_gateway.clone(),
                    ..Default::default()
                },
            ),
        ]
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(30),
            budget: 8,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the given attempt, starting at 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));

        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_cap)
    }
}
