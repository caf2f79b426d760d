use std::collections::BTreeSet;

use anyhow::Result;

use netpol_agent::gc;
use netpol_agent::installer;
use netpol_agent::ipset::ProcessIpSet;
use netpol_agent::iptables::ProcessIpTables;

/// Removes every chain, ip set, and jump rule the engine owns, leaving the
/// host as it was before the agent ever ran. Intended for manual invocation
/// (node decommission, uninstall), never called from the sync loop.
pub async fn run() -> Result<()> {
    println!("Removing netpol-agent host state...");

    let ipt = ProcessIpTables;
    let ipset = ProcessIpSet;

    installer::uninstall(&ipt).await?;
    let report = gc::collect(&ipt, &ipt, &ipset, &BTreeSet::new(), &BTreeSet::new()).await?;

    println!("  Removed {} chain(s), {} ip set(s).", report.stale_chains.len(), report.stale_sets.len());
    println!("Cleanup complete.");
    Ok(())
}
