//! Top-Level Chain Installer: idempotently wires the three built-in chains
//! to the engine's custom chains.
//!
//! This is the one place the engine mutates a chain it does not own outright
//! (`INPUT`/`OUTPUT`/`FORWARD`), so it uses the direct single-rule mutation
//! primitive rather than the bulk restore the composer writes into its own
//! chains with. Everything inside the three custom chains themselves is
//! composer-owned and gets fully rewritten by the bulk restore every cycle.
//!
//! `FORWARD` carries traffic in both directions relative to a local pod: a
//! pod can be the packet's source (egress, including to off-cluster
//! destinations) or its destination (ingress from another node). A single
//! `-d <podCIDR>` jump only ever catches the latter, so `FORWARD` gets two
//! independently tracked jumps, forward-in (`-d <podCIDR>`) and forward-out
//! (`-s <podCIDR>`), both landing in `NETPOL-FORWARD`. `INPUT` and `OUTPUT`
//! still get exactly one jump each.

use std::collections::{BTreeSet, HashMap};

use sha2::{Digest, Sha256};

use crate::config::AgentConfig;
use crate::error::SyncError;
use crate::iptables::IpTablesMutate;
use crate::naming::{TOP_CHAIN_FORWARD, TOP_CHAIN_INPUT, TOP_CHAIN_OUTPUT};

const TABLE: &str = "filter";

#[derive(Clone, Copy)]
enum Direction {
    Src,
    Dst,
}

/// One jump the installer is responsible for placing near the top of a
/// built-in chain. `kind` is a stable identity used only for the drift
/// marker, distinct from the rule spec itself, so forward-in and
/// forward-out (whose rule specs already differ by `-s`/`-d`) never collide
/// even if the pod CIDR is unset and both qualifiers go empty.
struct JumpSpec {
    builtin: &'static str,
    custom: &'static str,
    direction: Direction,
    kind: &'static str,
}

const JUMPS: [JumpSpec; 4] = [
    JumpSpec { builtin: "INPUT", custom: TOP_CHAIN_INPUT, direction: Direction::Dst, kind: "input" },
    JumpSpec { builtin: "OUTPUT", custom: TOP_CHAIN_OUTPUT, direction: Direction::Src, kind: "output" },
    JumpSpec { builtin: "FORWARD", custom: TOP_CHAIN_FORWARD, direction: Direction::Dst, kind: "forward-in" },
    JumpSpec { builtin: "FORWARD", custom: TOP_CHAIN_FORWARD, direction: Direction::Src, kind: "forward-out" },
];

fn jump_identity_comment(kind: &str) -> String {
    let digest = Sha256::digest(format!("netpol-jump\u{0}{kind}").as_bytes());
    format!("netpol-jump-{:x}", digest).chars().take(24).collect()
}

/// The rule-spec for `jump`, scoped to the pod CIDR when known so non-pod
/// traffic never reaches engine chains at all.
fn jump_rule_spec(jump: &JumpSpec, config: &AgentConfig) -> (String, String) {
    let qualifier = match (&config.pod_cidr, jump.direction) {
        (Some(cidr), Direction::Src) => format!("-s {cidr} "),
        (Some(cidr), Direction::Dst) => format!("-d {cidr} "),
        (None, _) => String::new(),
    };
    let comment = jump_identity_comment(jump.kind);
    (format!("{qualifier}-m comment --comment {comment} -j {}", jump.custom), comment)
}

/// Idempotently ensures the custom chains exist and that every jump in
/// [`JUMPS`] sits at its expected position within its built-in chain (jumps
/// into the same builtin chain are numbered in declaration order, so
/// forward-in is expected at position 1 and forward-out at position 2). If a
/// jump is found at a later position (drifted, another actor inserted ahead
/// of it) or missing, it is deleted if present and reinserted at its
/// expected position.
///
/// Failure to create a custom chain for a reason other than it already
/// existing is reported as [`SyncError::ChainInstall`], the one variant the
/// caller treats as fatal: without the top-level jumps the engine cannot
/// uphold its authority invariant at all. Every other failure here, the
/// chain existed but listing, inserting, or deleting a jump rule failed, is
/// an ordinary host-mutation error and propagates as whatever `mutate`
/// returned, which the caller retries on the next sync.
pub async fn install(mutate: &dyn IpTablesMutate, config: &AgentConfig) -> Result<(), SyncError> {
    let mut created_chains = BTreeSet::new();
    let mut next_position: HashMap<&str, u32> = HashMap::new();

    for jump in JUMPS {
        if created_chains.insert(jump.custom) {
            mutate
                .new_chain(TABLE, jump.custom)
                .await
                .map_err(|e| SyncError::ChainInstall(format!("cannot create chain {}: {e}", jump.custom)))?;
        }

        let position = next_position.entry(jump.builtin).or_insert(1);
        let (rule_spec, comment) = jump_rule_spec(&jump, config);
        let existing = mutate.list_rules(TABLE, jump.builtin).await?;
        let current_pos = existing.iter().position(|r| r.contains(&comment));

        match current_pos {
            Some(pos) if pos as u32 + 1 == *position => {}
            Some(_) => {
                if let Some(old_rule) = existing.iter().find(|r| r.contains(&comment)) {
                    mutate.delete_rule(TABLE, jump.builtin, old_rule).await?;
                }
                mutate.insert_rule(TABLE, jump.builtin, *position, &rule_spec).await?;
            }
            None => {
                mutate.insert_rule(TABLE, jump.builtin, *position, &rule_spec).await?;
            }
        }
        *position += 1;
    }
    Ok(())
}

/// Removes every jump rule the engine ever installed into the three built-in
/// chains, by the `netpol-jump-` comment marker. Leaves the custom chains
/// themselves for the garbage collector to remove once nothing references
/// them. Used by the cleanup command, never by the normal sync loop.
pub async fn uninstall(mutate: &dyn IpTablesMutate) -> Result<(), SyncError> {
    for builtin in ["INPUT", "OUTPUT", "FORWARD"] {
        loop {
            let rules = mutate.list_rules(TABLE, builtin).await?;
            let Some(rule) = rules.iter().find(|r| r.contains("netpol-jump-")) else {
                break;
            };
            mutate.delete_rule(TABLE, builtin, rule).await?;
        }
    }
    Ok(())
}
