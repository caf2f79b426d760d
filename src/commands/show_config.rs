use anyhow::{Context, Result};

use netpol_agent::config::AgentConfig;

use crate::cli::ShowConfigArgs;

/// Validates `args` the same way `run` would and prints the resolved
/// configuration, without touching the cluster or the host.
pub fn run(args: ShowConfigArgs) -> Result<()> {
    let config = AgentConfig::from_args(args.host.to_agent_config_args()).context("invalid configuration")?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&config_as_json(&config)).expect("config JSON is valid"));
    } else {
        println!("{config:#?}");
    }
    Ok(())
}

fn config_as_json(config: &AgentConfig) -> serde_json::Value {
    serde_json::json!({
        "node_name": config.node_name,
        "node_ip": config.node_ip.to_string(),
        "pod_cidr": config.pod_cidr.map(|c| c.to_string()),
        "service_cluster_cidr": config.service_cluster_cidr.to_string(),
        "external_cidrs": config.external_cidrs.iter().map(ToString::to_string).collect::<Vec<_>>(),
        "node_port_range": format!("{}:{}", config.node_port_range.low, config.node_port_range.high),
        "sync_period_secs": config.sync_period.as_secs(),
        "metrics_enabled": config.metrics_enabled,
        "pre_enforcement_accept": config.pre_enforcement_accept,
    })
}
