use clap::{Parser, Subcommand};

use netpol_agent::config::AgentConfigArgs;

#[derive(Parser)]
#[command(name = "netpol-agent")]
#[command(about = "Per-node Kubernetes NetworkPolicy enforcement agent")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the reconciliation engine and HTTP server
    Run(HostArgs),

    /// Remove every chain, ip set, and jump rule the engine owns
    Cleanup,

    /// Print the resolved, validated configuration and exit
    ShowConfig(ShowConfigArgs),
}

#[derive(clap::Args)]
pub struct ShowConfigArgs {
    #[command(flatten)]
    pub host: HostArgs,

    /// Print as JSON instead of the debug-formatted struct
    #[arg(long)]
    pub json: bool,
}

#[derive(clap::Args)]
pub struct HostArgs {
    /// Name of the node this agent is running on
    #[arg(long, env = "NETPOL_NODE_NAME")]
    pub node_name: String,

    /// IP address of the node this agent is running on
    #[arg(long, env = "NETPOL_NODE_IP")]
    pub node_ip: String,

    /// CIDR this node hands out pod IPs from, if known
    #[arg(long, env = "NETPOL_POD_CIDR")]
    pub pod_cidr: Option<String>,

    /// Cluster-wide Service VIP CIDR, exempted from enforcement
    #[arg(long, env = "NETPOL_SERVICE_CLUSTER_CIDR")]
    pub service_cluster_cidr: String,

    /// Additional CIDR exempted from enforcement (repeatable)
    #[arg(long = "external-cidr", env = "NETPOL_EXTERNAL_CIDRS", value_delimiter = ',')]
    pub external_cidrs: Vec<String>,

    /// Node-port range exempted from enforcement, as "low:high"
    #[arg(long, env = "NETPOL_NODE_PORT_RANGE", default_value = "30000:32767")]
    pub node_port_range: String,

    /// Seconds between unconditional full syncs
    #[arg(long, env = "NETPOL_SYNC_PERIOD_SECS", default_value_t = 60)]
    pub sync_period_secs: u64,

    /// Expose the Prometheus /metrics endpoint
    #[arg(long, env = "NETPOL_METRICS_ENABLED", default_value_t = true)]
    pub metrics_enabled: bool,

    /// ACCEPT rather than REJECT traffic falling through to the default pod
    /// firewall chain, for a soft rollout before enforcement is trusted
    #[arg(long, env = "NETPOL_PRE_ENFORCEMENT_ACCEPT", default_value_t = false)]
    pub pre_enforcement_accept: bool,

    /// Address the health/metrics HTTP server binds
    #[arg(long, env = "NETPOL_HTTP_ADDR", default_value = "0.0.0.0:8080")]
    pub http_addr: String,
}

impl HostArgs {
    pub fn to_agent_config_args(&self) -> AgentConfigArgs {
        AgentConfigArgs {
            node_name: self.node_name.clone(),
            node_ip: self.node_ip.clone(),
            pod_cidr: self.pod_cidr.clone(),
            service_cluster_cidr: self.service_cluster_cidr.clone(),
            external_cidrs: self.external_cidrs.clone(),
            node_port_range: self.node_port_range.clone(),
            sync_period_secs: self.sync_period_secs,
            metrics_enabled: self.metrics_enabled,
            pre_enforcement_accept: self.pre_enforcement_accept,
        }
    }
}
