use std::net::IpAddr;
use std::time::Duration;

use ipnetwork::IpNetwork;

use crate::error::ConfigError;

/// An inclusive `low:high` TCP/UDP port range, as accepted on the node-port
/// CLI flag. `low` must be strictly less than `high` and both must be valid
/// 16-bit ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

impl PortRange {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let (low_s, high_s) = value.split_once(':').ok_or_else(|| ConfigError::InvalidPortRange {
            value: value.to_string(),
            reason: "expected \"low:high\"".to_string(),
        })?;

        let low: u32 = low_s.parse().map_err(|_| ConfigError::InvalidPortRange {
            value: value.to_string(),
            reason: format!("{low_s:?} is not a number"),
        })?;
        let high: u32 = high_s.parse().map_err(|_| ConfigError::InvalidPortRange {
            value: value.to_string(),
            reason: format!("{high_s:?} is not a number"),
        })?;

        if low > u16::MAX as u32 || high > u16::MAX as u32 {
            return Err(ConfigError::InvalidPortRange {
                value: value.to_string(),
                reason: format!("{high} is not a valid port (0-{})", u16::MAX),
            });
        }
        if low >= high {
            return Err(ConfigError::InvalidPortRange {
                value: value.to_string(),
                reason: format!("low ({low}) must be less than high ({high})"),
            });
        }

        Ok(PortRange {
            low: low as u16,
            high: high as u16,
        })
    }
}

/// Construction-time configuration for the reconciliation engine.
///
/// Built once via [`AgentConfig::from_args`] and never mutated afterwards;
/// every field here corresponds to one of the construction inputs in spec
/// section 6.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub node_name: String,
    pub node_ip: IpAddr,
    pub pod_cidr: Option<IpNetwork>,
    pub service_cluster_cidr: IpNetwork,
    pub external_cidrs: Vec<IpNetwork>,
    pub node_port_range: PortRange,
    pub sync_period: Duration,
    pub metrics_enabled: bool,
    pub pre_enforcement_accept: bool,
}

/// Raw, string-typed construction arguments, as they arrive from the CLI.
pub struct AgentConfigArgs {
    pub node_name: String,
    pub node_ip: String,
    pub pod_cidr: Option<String>,
    pub service_cluster_cidr: String,
    pub external_cidrs: Vec<String>,
    pub node_port_range: String,
    pub sync_period_secs: u64,
    pub metrics_enabled: bool,
    pub pre_enforcement_accept: bool,
}

impl AgentConfig {
    pub fn from_args(args: AgentConfigArgs) -> Result<Self, ConfigError> {
        let node_ip = args
            .node_ip
            .parse::<IpAddr>()
            .map_err(|source| ConfigError::InvalidNodeIp {
                value: args.node_ip.clone(),
                source,
            })?;

        let pod_cidr = args
            .pod_cidr
            .as_deref()
            .map(|v| parse_cidr("pod_cidr", v))
            .transpose()?;

        let service_cluster_cidr = parse_cidr("service_cluster_cidr", &args.service_cluster_cidr)?;

        let external_cidrs = args
            .external_cidrs
            .iter()
            .map(|v| parse_cidr("external_cidr", v))
            .collect::<Result<Vec<_>, _>>()?;

        let node_port_range = PortRange::parse(&args.node_port_range)?;

        if args.sync_period_secs == 0 {
            return Err(ConfigError::InvalidSyncPeriod {
                value: args.sync_period_secs.to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(AgentConfig {
            node_name: args.node_name,
            node_ip,
            pod_cidr,
            service_cluster_cidr,
            external_cidrs,
            node_port_range,
            sync_period: Duration::from_secs(args.sync_period_secs),
            metrics_enabled: args.metrics_enabled,
            pre_enforcement_accept: args.pre_enforcement_accept,
        })
    }
}

fn parse_cidr(field: &'static str, value: &str) -> Result<IpNetwork, ConfigError> {
    value.parse::<IpNetwork>().map_err(|source| ConfigError::InvalidCidr {
        field,
        value: value.to_string(),
        source,
    })
}
