//! Filter-Table Composer: turns the normalized policy model and the set of
//! local pods into the textual bulk-restore buffer for iptables-restore,
//! plus the bookkeeping (`active_chains`, `active_sets`, ip-set member
//! updates) the reconciler hands to the IP-Set Manager and the Garbage
//! Collector.
//!
//! Ordering note (resolves the open question on per-pod chain emission
//! order): this composer builds every chain's rule list as a plain `Vec`
//! appended to in the order described below, then serializes each entry as
//! an `-A` line. Appends preserve the written order directly — there is no
//! need to reverse anything the way a sequence of `-I` inserts would.
//! The per-pod chain's tail is ordered reject-before-mark: the log/reject
//! pair tests the policy-matched bit *before* the admit bit is set, and the
//! policy-matched bit is cleared only after that test and after the admit
//! bit is set, so that the next local pod's chain in the same traversal (two
//! local pods talking to each other cross the FORWARD chain once, through
//! both pods' chains in sequence) starts its own evaluation with a clean
//! mark.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use crate::config::AgentConfig;
use crate::model::{Pod, Policy, PolicyType, Protocol, Rule};
use crate::naming::{self, MARK_ADMIT, MARK_POLICY_MATCHED};

pub struct ComposedSync {
    /// Engine-owned chain name -> ordered rule specs (without the `-A <chain>` prefix).
    pub chain_rules: BTreeMap<String, Vec<String>>,
    pub active_chains: BTreeSet<String>,
    pub active_sets: BTreeSet<String>,
    pub set_members: BTreeMap<String, BTreeSet<IpAddr>>,
    /// Pod IP -> its firewall chain name this sync, used by the installer's
    /// jump rules and exposed for tests.
    pub pod_chain_of: BTreeMap<IpAddr, String>,
}

pub fn compose(policies: &[Policy], pods: &[Pod], sync_version: u64, config: &AgentConfig) -> ComposedSync {
    let mut chain_rules: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut active_chains: BTreeSet<String> = naming::always_active_chains().iter().map(|s| s.to_string()).collect();
    let mut active_sets: BTreeSet<String> = BTreeSet::new();
    let mut set_members: BTreeMap<String, BTreeSet<IpAddr>> = BTreeMap::new();
    let mut pod_chain_of: BTreeMap<IpAddr, String> = BTreeMap::new();

    for policy in policies {
        compose_policy_chain(policy, sync_version, &mut chain_rules, &mut active_chains, &mut active_sets, &mut set_members);
    }

    let local_pods: Vec<&Pod> = pods.iter().filter(|p| p.local && p.ip.is_some()).collect();
    for pod in &local_pods {
        let pod_ip = pod.ip.unwrap();
        let chain_name = naming::pod_chain_name(&pod.namespace, &pod.name, sync_version);
        active_chains.insert(chain_name.clone());
        pod_chain_of.insert(pod_ip, chain_name.clone());

        let rules = chain_rules.entry(chain_name).or_default();
        rules.push("-m state --state RELATED,ESTABLISHED -j ACCEPT".to_string());
        rules.push(format!("-m addrtype --src-type LOCAL -d {pod_ip} -j ACCEPT"));

        let ingress_targets: Vec<&Policy> = policies
            .iter()
            .filter(|p| p.target_pods.contains(&pod_ip) && matches!(p.policy_type, PolicyType::Ingress | PolicyType::Both))
            .collect();
        if ingress_targets.is_empty() {
            rules.push(format!("-d {pod_ip} -j {}", naming::DEFAULT_INGRESS_CHAIN));
        } else {
            for p in ingress_targets {
                rules.push(format!("-d {pod_ip} -j {}", naming::policy_chain_name(&p.namespace, &p.name, sync_version)));
            }
        }

        let egress_targets: Vec<&Policy> = policies
            .iter()
            .filter(|p| p.target_pods.contains(&pod_ip) && matches!(p.policy_type, PolicyType::Egress | PolicyType::Both))
            .collect();
        if egress_targets.is_empty() {
            rules.push(format!("-s {pod_ip} -j {}", naming::DEFAULT_EGRESS_CHAIN));
        } else {
            for p in egress_targets {
                rules.push(format!("-s {pod_ip} -j {}", naming::policy_chain_name(&p.namespace, &p.name, sync_version)));
            }
        }

        rules.push(format!(
            "-m mark ! --mark {MARK_POLICY_MATCHED:#x}/{MARK_POLICY_MATCHED:#x} -m limit --limit 1/min -j LOG --log-prefix \"NETPOL-DROP: \""
        ));
        rules.push(format!("-m mark ! --mark {MARK_POLICY_MATCHED:#x}/{MARK_POLICY_MATCHED:#x} -j REJECT --reject-with icmp-port-unreachable"));
        rules.push(format!("-j MARK --set-xmark {MARK_ADMIT:#x}/{MARK_ADMIT:#x}"));
        rules.push(format!("-j MARK --set-xmark 0x0/{MARK_POLICY_MATCHED:#x}"));
    }

    // Default chains: always active, content independent of this cycle's model.
    chain_rules
        .entry(naming::DEFAULT_POD_FW_CHAIN.to_string())
        .or_default()
        .push(if config.pre_enforcement_accept {
            "-j ACCEPT".to_string()
        } else {
            "-j REJECT --reject-with icmp-port-unreachable".to_string()
        });
    chain_rules
        .entry(naming::DEFAULT_INGRESS_CHAIN.to_string())
        .or_default()
        .push(format!("-j MARK --set-xmark {MARK_POLICY_MATCHED:#x}/{MARK_POLICY_MATCHED:#x}"));
    chain_rules
        .entry(naming::DEFAULT_EGRESS_CHAIN.to_string())
        .or_default()
        .push(format!("-j MARK --set-xmark {MARK_POLICY_MATCHED:#x}/{MARK_POLICY_MATCHED:#x}"));

    compose_top_level_chains(&local_pods, &pod_chain_of, config, &mut chain_rules);

    ComposedSync {
        chain_rules,
        active_chains,
        active_sets,
        set_members,
        pod_chain_of,
    }
}

fn compose_top_level_chains(
    local_pods: &[&Pod],
    pod_chain_of: &BTreeMap<IpAddr, String>,
    config: &AgentConfig,
    chain_rules: &mut BTreeMap<String, Vec<String>>,
) {
    let input = chain_rules.entry(naming::TOP_CHAIN_INPUT.to_string()).or_default();
    // Service-VIP and node-port traffic is already processed by the service
    // proxy before pod-scoped rules would apply; exempt it from enforcement.
    input.push(format!("-d {} -j RETURN", config.service_cluster_cidr));
    for cidr in &config.external_cidrs {
        input.push(format!("-d {cidr} -j RETURN"));
    }
    input.push(format!(
        "-m addrtype --dst-type LOCAL -p tcp --dport {}:{} -j RETURN",
        config.node_port_range.low, config.node_port_range.high
    ));
    input.push(format!(
        "-m addrtype --dst-type LOCAL -p udp --dport {}:{} -j RETURN",
        config.node_port_range.low, config.node_port_range.high
    ));
    for pod in local_pods {
        let ip = pod.ip.unwrap();
        input.push(format!("-d {ip} -j {}", pod_chain_of[&ip]));
    }
    append_fallthrough(input, config);

    let output = chain_rules.entry(naming::TOP_CHAIN_OUTPUT.to_string()).or_default();
    for pod in local_pods {
        let ip = pod.ip.unwrap();
        output.push(format!("-s {ip} -j {}", pod_chain_of[&ip]));
    }
    append_fallthrough(output, config);

    let forward = chain_rules.entry(naming::TOP_CHAIN_FORWARD.to_string()).or_default();
    for pod in local_pods {
        let ip = pod.ip.unwrap();
        forward.push(format!("-d {ip} -j {}", pod_chain_of[&ip]));
        forward.push(format!("-s {ip} -j {}", pod_chain_of[&ip]));
    }
    append_fallthrough(forward, config);
}

/// Appends the chain's unconditional tail: a mark-accept rule, followed by
/// the jump to the default pod firewall chain. When the pod CIDR is known
/// the fallthrough jump is split into two CIDR-qualified rules (`-s` then
/// `-d`) so a single default chain still only ever sees pod-scoped traffic;
/// the tail is then three rules long: mark-accept, then both fallthrough
/// jumps, not a literal last-two. Mark-accept still precedes every
/// fallthrough jump, which is what the "first rule in, no matter which
/// direction" wording in the custom-chain invariant actually depends on.
fn append_fallthrough(rules: &mut Vec<String>, config: &AgentConfig) {
    rules.push(format!("-m mark --mark {MARK_ADMIT:#x}/{MARK_ADMIT:#x} -j ACCEPT"));
    match &config.pod_cidr {
        Some(cidr) => {
            rules.push(format!("-s {cidr} -j {}", naming::DEFAULT_POD_FW_CHAIN));
            rules.push(format!("-d {cidr} -j {}", naming::DEFAULT_POD_FW_CHAIN));
        }
        None => rules.push(format!("-j {}", naming::DEFAULT_POD_FW_CHAIN)),
    }
}

fn compose_policy_chain(
    policy: &Policy,
    sync_version: u64,
    chain_rules: &mut BTreeMap<String, Vec<String>>,
    active_chains: &mut BTreeSet<String>,
    active_sets: &mut BTreeSet<String>,
    set_members: &mut BTreeMap<String, BTreeSet<IpAddr>>,
) {
    let chain_name = naming::policy_chain_name(&policy.namespace, &policy.name, sync_version);
    active_chains.insert(chain_name.clone());
    let mut rules = Vec::new();

    if !policy.ingress.is_empty() {
        let src_set = naming::policy_src_set_name(&policy.namespace, &policy.name);
        let combined: BTreeSet<IpAddr> = policy.ingress.iter().flat_map(|r| r.peer_pods.keys().copied()).collect();
        if policy.ingress.iter().any(|r| !r.match_all_peers && !r.peer_pods.is_empty()) {
            active_sets.insert(src_set.clone());
            set_members.insert(src_set.clone(), combined);
        }
        for (idx, rule) in policy.ingress.iter().enumerate() {
            emit_rule_lines(rule, &src_set, "src", &policy.namespace, &policy.name, idx, active_sets, set_members, &mut rules);
        }
    }

    if !policy.egress.is_empty() {
        let dst_set = naming::policy_dst_set_name(&policy.namespace, &policy.name);
        let combined: BTreeSet<IpAddr> = policy.egress.iter().flat_map(|r| r.peer_pods.keys().copied()).collect();
        if policy.egress.iter().any(|r| !r.match_all_peers && !r.peer_pods.is_empty()) {
            active_sets.insert(dst_set.clone());
            set_members.insert(dst_set.clone(), combined);
        }
        for (idx, rule) in policy.egress.iter().enumerate() {
            emit_rule_lines(rule, &dst_set, "dst", &policy.namespace, &policy.name, 1000 + idx, active_sets, set_members, &mut rules);
        }
    }

    chain_rules.entry(chain_name).or_default().extend(rules);
}

/// Emits one `-A` rule line per (peer-clause × port-group) combination for a
/// single ingress or egress rule, per spec 4.4: a port-group with no ports
/// means "any port"; peer groups translate to ip-set matches (pod peers) or
/// `-s`/`-d` CIDR matches (ip-block peers, with excepted sub-ranges returned
/// early so they are not marked).
#[allow(clippy::too_many_arguments)]
fn emit_rule_lines(
    rule: &Rule,
    combined_set_name: &str,
    set_direction: &str,
    namespace: &str,
    policy_name: &str,
    rule_index: usize,
    active_sets: &mut BTreeSet<String>,
    set_members: &mut BTreeMap<String, BTreeSet<IpAddr>>,
    out: &mut Vec<String>,
) {
    let peer_clauses = peer_match_clauses(rule, combined_set_name, set_direction, namespace, policy_name, rule_index, out);

    let port_clauses: Vec<(Option<String>, Option<&BTreeSet<IpAddr>>)> = if rule.match_all_ports {
        vec![(None, None)]
    } else {
        let mut clauses: Vec<(Option<String>, Option<&BTreeSet<IpAddr>>)> = rule
            .ports
            .iter()
            .map(|(proto, port)| (Some(format!("-p {} --dport {port}", proto.as_iptables_proto())), None))
            .collect();
        for group in &rule.named_ports {
            clauses.push((
                Some(format!("-p {} --dport {}", group.protocol.as_iptables_proto(), group.numeric_port)),
                Some(&group.peer_ips),
            ));
        }
        clauses
    };

    for peer_clause in &peer_clauses {
        for (port_clause, named_restriction) in &port_clauses {
            let mut line = String::new();
            if let Some(restriction) = named_restriction {
                let restricted_set = format!(
                    "{}-NP",
                    naming::peer_set_name(namespace, policy_name, rule_index)
                );
                active_sets.insert(restricted_set.clone());
                set_members.insert(restricted_set.clone(), (*restriction).clone());
                line.push_str(&format!("-m set --match-set {restricted_set} {set_direction} "));
            } else if let Some(clause) = peer_clause {
                line.push_str(clause);
                line.push(' ');
            }
            if let Some(p) = port_clause {
                line.push_str(p);
                line.push(' ');
            }
            line.push_str(&format!("-j MARK --set-xmark {MARK_POLICY_MATCHED:#x}/{MARK_POLICY_MATCHED:#x}"));
            out.push(line);
        }
    }
}

/// Builds the `-s`/`-d` or ip-set peer-match fragments for a rule (excluding
/// the "any peer" case, which is represented as a single `None` clause).
/// Except ranges in an ip-block peer are emitted as early unconditional
/// `RETURN` rules so that traffic from the excepted sub-range is never
/// marked matched by the surrounding CIDR.
fn peer_match_clauses(
    rule: &Rule,
    combined_set_name: &str,
    set_direction: &str,
    _namespace: &str,
    _policy_name: &str,
    _rule_index: usize,
    out: &mut Vec<String>,
) -> Vec<Option<String>> {
    if rule.match_all_peers {
        return vec![None];
    }

    let mut clauses = Vec::new();
    if !rule.peer_pods.is_empty() {
        clauses.push(Some(format!("-m set --match-set {combined_set_name} {set_direction}")));
    }
    for block in &rule.peer_blocks {
        for except in &block.except {
            let flag = if set_direction == "src" { "-s" } else { "-d" };
            out.push(format!("{flag} {except} -j RETURN"));
        }
        let flag = if set_direction == "src" { "-s" } else { "-d" };
        clauses.push(Some(format!("{flag} {}", block.cidr)));
    }
    clauses
}

/// Serializes `chain_rules` into an `iptables-restore` buffer for the
/// `filter` table: chain declarations first, then every rule as an `-A`
/// line, in the order each chain's rules were appended.
pub fn serialize_filter_table(chain_rules: &BTreeMap<String, Vec<String>>) -> String {
    let mut buf = String::from("*filter\n");
    for chain in chain_rules.keys() {
        buf.push_str(&format!(":{chain} - [0:0]\n"));
    }
    for (chain, rules) in chain_rules {
        for rule in rules {
            buf.push_str(&format!("-A {chain} {rule}\n"));
        }
    }
    buf.push_str("COMMIT\n");
    buf
}
