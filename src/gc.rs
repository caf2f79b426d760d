//! Garbage Collector: removes chains/sets with an engine prefix that the
//! just-completed sync did not re-emit.
//!
//! Simplification, documented in DESIGN.md: rather than re-dumping the whole
//! table, textually stripping stale lines, and re-restoring it (spec 4.6
//! step 5), stale chains are removed with the direct mutation primitive
//! (`flush_chain` + `delete_chain`) after their jump references are scraped
//! from the three custom top-level chains. The end state — the chain and
//! every reference to it are gone — is identical; the direct primitives are
//! simply a more literal fit for "opaque mutation primitive" than
//! reconstructing a restore buffer for a removal that bulk restore cannot
//! itself express (restore has no way to delete a chain object, only to
//! flush and repopulate one that is declared).

use std::collections::BTreeSet;

use crate::error::SyncError;
use crate::ipset::IpSetClient;
use crate::iptables::{IpTablesBulk, IpTablesMutate};
use crate::naming::{self, TOP_CHAIN_FORWARD, TOP_CHAIN_INPUT, TOP_CHAIN_OUTPUT};

const TABLE: &str = "filter";

fn parse_chain_names(dump: &str) -> BTreeSet<String> {
    dump.lines()
        .filter_map(|l| l.strip_prefix(':'))
        .filter_map(|l| l.split_whitespace().next())
        .map(|s| s.to_string())
        .collect()
}

pub struct GcReport {
    pub stale_chains: BTreeSet<String>,
    pub stale_sets: BTreeSet<String>,
}

/// Runs at the end of every full sync. `active_chains`/`active_sets` are
/// exactly what the composer emitted this cycle (plus the always-active
/// defaults it already folds in).
pub async fn collect(
    bulk: &dyn IpTablesBulk,
    mutate: &dyn IpTablesMutate,
    ipset: &dyn IpSetClient,
    active_chains: &BTreeSet<String>,
    active_sets: &BTreeSet<String>,
) -> Result<GcReport, SyncError> {
    let dump = bulk.dump_table(TABLE).await?;
    let on_host_chains = parse_chain_names(&dump);
    let stale_chains: BTreeSet<String> = on_host_chains
        .into_iter()
        .filter(|name| naming::is_engine_chain(name))
        .filter(|name| !active_chains.contains(name))
        .collect();

    let on_host_sets = ipset.list_names().await?;
    let stale_sets: BTreeSet<String> = on_host_sets
        .into_iter()
        .filter(|name| naming::is_engine_set(name))
        .filter(|name| !active_sets.contains(name))
        .collect();

    for stale_chain in &stale_chains {
        for top_chain in [TOP_CHAIN_INPUT, TOP_CHAIN_OUTPUT, TOP_CHAIN_FORWARD] {
            loop {
                let rules = mutate.list_rules(TABLE, top_chain).await?;
                let Some(referencing) = rules.iter().find(|r| r.contains(stale_chain.as_str())) else {
                    break;
                };
                mutate.delete_rule(TABLE, top_chain, referencing).await?;
            }
        }
        mutate.flush_chain(TABLE, stale_chain).await?;
        mutate.delete_chain(TABLE, stale_chain).await?;
    }

    for stale_set in &stale_sets {
        ipset.destroy(stale_set).await?;
    }

    Ok(GcReport { stale_chains, stale_sets })
}
