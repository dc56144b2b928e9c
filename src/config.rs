//! Operator configuration, from command line flags or the environment

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Machine health operator - detects unhealthy machines of managed clusters
#[derive(Clone, Debug, Parser)]
#[command(name = "machine-health-operator")]
#[command(version)]
pub struct OperatorConfig {
    /// Namespace to watch; all namespaces when unset
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Address of the metrics and health endpoints
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:8080")]
    pub http_addr: SocketAddr,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Maximum number of MachineHealthChecks reconciled in parallel
    #[arg(long, env = "RECONCILE_CONCURRENCY", default_value_t = 10)]
    pub concurrency: u16,

    /// How long to wait for the initial node list of a workload cluster
    #[arg(long, env = "NODE_SYNC_TIMEOUT_SECS", default_value_t = 30)]
    pub node_sync_timeout_secs: u64,

    /// First retry delay after a failed reconciliation
    #[arg(long, env = "BACKOFF_BASE_SECS", default_value_t = 15)]
    pub backoff_base_secs: u64,

    /// Upper bound of the retry delay
    #[arg(long, env = "BACKOFF_MAX_SECS", default_value_t = 300)]
    pub backoff_max_secs: u64,

    /// Print the CustomResourceDefinitions as YAML and exit
    #[arg(long)]
    pub print_crds: bool,
}

impl OperatorConfig {
    pub fn node_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.node_sync_timeout_secs)
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_format: LogFormat::Text,
            concurrency: 10,
            node_sync_timeout_secs: 30,
            backoff_base_secs: 15,
            backoff_max_secs: 300,
            print_crds: false,
        }
    }
}
