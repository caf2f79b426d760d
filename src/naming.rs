//! Deterministic, collision-resistant, bounded-length chain/set names.
//!
//! Every name the engine ever creates is `<fixed-prefix><16-char-token>`. The
//! token is a SHA-256 hash of a stable input string, base-32 encoded and
//! truncated to 16 characters. Staying well under the kernel's 28-byte chain
//! name limit and the 31-byte ipset name limit leaves headroom for the fixed
//! prefixes below.

use base32::Alphabet;
use sha2::{Digest, Sha256};

/// Per-local-pod firewall chain.
pub const POD_CHAIN_PREFIX: &str = "NETPOL-POD-";
/// Per-policy chain.
pub const POLICY_CHAIN_PREFIX: &str = "NETPOL-POL-";
/// Per-policy source-pod IP set (used by ingress rules).
pub const SRC_SET_PREFIX: &str = "NETPOL-SRC-";
/// Per-policy destination-pod IP set (used by egress rules).
pub const DST_SET_PREFIX: &str = "NETPOL-DST-";
/// Per-rule peer IP set, indexed by rule position within a policy.
pub const PEER_SET_PREFIX: &str = "NETPOL-PR-";

/// The three built-in-chain jump targets, entirely owned by the engine.
pub const TOP_CHAIN_INPUT: &str = "NETPOL-INPUT";
pub const TOP_CHAIN_OUTPUT: &str = "NETPOL-OUTPUT";
pub const TOP_CHAIN_FORWARD: &str = "NETPOL-FORWARD";

/// Default fallthrough chains, always present and never garbage-collected.
pub const DEFAULT_POD_FW_CHAIN: &str = "NETPOL-DEFAULT-FW";
pub const DEFAULT_INGRESS_CHAIN: &str = "NETPOL-DEFAULT-ING";
pub const DEFAULT_EGRESS_CHAIN: &str = "NETPOL-DEFAULT-EGR";

/// Set at tail of a per-policy rule when it matches; tested by the pod chain
/// to decide whether to move on to the admit mark.
pub const MARK_POLICY_MATCHED: u32 = 0x10000;
/// Set at the tail of the per-pod chain once `MARK_POLICY_MATCHED` is
/// observed; tested by the top-level custom chain to ACCEPT.
pub const MARK_ADMIT: u32 = 0x20000;

/// All fixed chain names that are never version-suffixed and always count as
/// active, regardless of what this cycle's model produced.
pub fn always_active_chains() -> [&'static str; 6] {
    [
        TOP_CHAIN_INPUT,
        TOP_CHAIN_OUTPUT,
        TOP_CHAIN_FORWARD,
        DEFAULT_POD_FW_CHAIN,
        DEFAULT_INGRESS_CHAIN,
        DEFAULT_EGRESS_CHAIN,
    ]
}

/// True if `name` carries one of the engine's reserved chain prefixes, or is
/// one of the fixed top-level/default chain names. Nothing outside this set
/// is ever read, written, or deleted by engine code (prefix-discipline
/// invariant).
pub fn is_engine_chain(name: &str) -> bool {
    name.starts_with(POD_CHAIN_PREFIX)
        || name.starts_with(POLICY_CHAIN_PREFIX)
        || always_active_chains().contains(&name)
}

/// True if `name` carries one of the engine's reserved set prefixes.
pub fn is_engine_set(name: &str) -> bool {
    name.starts_with(SRC_SET_PREFIX) || name.starts_with(DST_SET_PREFIX) || name.starts_with(PEER_SET_PREFIX)
}

fn token(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let encoded = base32::encode(Alphabet::Rfc4648 { padding: false }, &digest);
    encoded.chars().take(16).collect()
}

pub fn pod_chain_name(namespace: &str, pod_name: &str, sync_version: u64) -> String {
    format!("{POD_CHAIN_PREFIX}{}", token(&format!("{namespace}\u{0}{pod_name}\u{0}{sync_version}")))
}

pub fn policy_chain_name(namespace: &str, policy_name: &str, sync_version: u64) -> String {
    format!(
        "{POLICY_CHAIN_PREFIX}{}",
        token(&format!("{namespace}\u{0}{policy_name}\u{0}{sync_version}"))
    )
}

pub fn policy_src_set_name(namespace: &str, policy_name: &str) -> String {
    format!("{SRC_SET_PREFIX}{}", token(&format!("{namespace}\u{0}{policy_name}")))
}

pub fn policy_dst_set_name(namespace: &str, policy_name: &str) -> String {
    format!("{DST_SET_PREFIX}{}", token(&format!("{namespace}\u{0}{policy_name}")))
}

pub fn peer_set_name(namespace: &str, policy_name: &str, rule_index: usize) -> String {
    format!(
        "{PEER_SET_PREFIX}{}",
        token(&format!("{namespace}\u{0}{policy_name}\u{0}{rule_index}"))
    )
}
