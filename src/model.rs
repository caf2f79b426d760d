//! Translates raw cluster objects into the engine's normalized policy model.
//!
//! Nothing here talks to the host filter subsystem; these are pure transforms
//! over the snapshot a lister hands back, over `k8s_openapi` types, with no
//! I/O, fully unit-testable without a cluster.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use ipnetwork::IpNetwork;
use k8s_openapi::api::core::v1::Pod as ApiPod;
use k8s_openapi::api::networking::v1::{
    IPBlock as ApiIpBlock, NetworkPolicy as ApiNetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPeer,
    NetworkPolicyPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

/// Layer-4 protocol, as carried by a `NetworkPolicyPort`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    fn from_api(value: Option<&str>) -> Self {
        match value {
            Some("UDP") => Protocol::Udp,
            Some("SCTP") => Protocol::Sctp,
            _ => Protocol::Tcp,
        }
    }

    pub fn as_iptables_proto(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyType {
    Ingress,
    Egress,
    Both,
}

/// A pod's declared container port: the name it can be referred to by in a
/// `NetworkPolicyPort`, the protocol, and the actual numeric port.
#[derive(Debug, Clone)]
pub struct NamedPort {
    pub name: String,
    pub protocol: Protocol,
    pub port: u16,
}

/// The subset of pod state the model builder needs: identity, labels, and the
/// named ports it exposes. Local/remote partitioning happens downstream, in
/// the composer, which is the only component that cares which pods are on
/// this node.
#[derive(Debug, Clone)]
pub struct Pod {
    pub namespace: String,
    pub name: String,
    pub ip: Option<IpAddr>,
    pub labels: BTreeMap<String, String>,
    pub named_ports: Vec<NamedPort>,
    /// True if this pod is scheduled on the node this agent is running on.
    /// Only local pods get a firewall chain; every pod, local or remote, may
    /// still appear as a peer.
    pub local: bool,
}

/// Builds a normalized [`Pod`] from the raw API object and the name of the
/// node this agent runs on.
pub fn pod_from_api(raw: &ApiPod, this_node: &str) -> Pod {
    let metadata = &raw.metadata;
    let spec = raw.spec.as_ref();
    let status = raw.status.as_ref();

    let ip = status
        .and_then(|s| s.pod_ip.as_deref())
        .and_then(|ip| ip.parse::<IpAddr>().ok());
    let local = spec.and_then(|s| s.node_name.as_deref()) == Some(this_node);
    let labels = metadata.labels.clone().unwrap_or_default().into_iter().collect();

    let mut named_ports = Vec::new();
    if let Some(spec) = spec {
        for container in &spec.containers {
            let Some(ports) = &container.ports else { continue };
            for p in ports {
                if let Some(name) = &p.name {
                    named_ports.push(NamedPort {
                        name: name.clone(),
                        protocol: Protocol::from_api(p.protocol.as_deref()),
                        port: p.container_port as u16,
                    });
                }
            }
        }
    }

    Pod {
        namespace: metadata.namespace.clone().unwrap_or_default(),
        name: metadata.name.clone().unwrap_or_default(),
        ip,
        labels,
        named_ports,
        local,
    }
}

#[derive(Debug, Clone)]
pub struct Namespace {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

/// A CIDR peer with excepted sub-ranges, as declared by an `ipBlock` peer.
#[derive(Debug, Clone)]
pub struct IpBlock {
    pub cidr: IpNetwork,
    pub except: Vec<IpNetwork>,
}

/// A named port resolved against a rule's peer pods: the numeric port that
/// `name` actually maps to for the pods in `peer_ips`, and nothing else —
/// pods exposing the same name under a different container port number fall
/// into a separate group.
#[derive(Debug, Clone)]
pub struct NamedPortGroup {
    pub protocol: Protocol,
    pub numeric_port: u16,
    pub peer_ips: BTreeSet<IpAddr>,
}

/// One ingress or egress rule of a normalized [`Policy`].
#[derive(Debug, Clone, Default)]
pub struct Rule {
    pub match_all_ports: bool,
    pub ports: Vec<(Protocol, u16)>,
    pub named_ports: Vec<NamedPortGroup>,
    pub match_all_peers: bool,
    pub peer_pods: BTreeMap<IpAddr, String>,
    pub peer_blocks: Vec<IpBlock>,
}

#[derive(Debug, Clone)]
pub struct Policy {
    pub namespace: String,
    pub name: String,
    pub target_pods: BTreeSet<IpAddr>,
    pub ingress: Vec<Rule>,
    pub egress: Vec<Rule>,
    pub policy_type: PolicyType,
}

/// Error produced while evaluating a single policy's peer/port clauses.
///
/// Per the model builder's contract, a per-rule evaluation error aborts the
/// whole sync rather than silently skipping the offending rule — a
/// half-built policy model is worse than no sync at all.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("policy {namespace}/{name}: invalid ipBlock cidr {cidr:?}: {source}")]
    InvalidCidr {
        namespace: String,
        name: String,
        cidr: String,
        #[source]
        source: ipnetwork::IpNetworkError,
    },
}

fn match_label_selector(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        for (k, v) in match_labels {
            if labels.get(k) != Some(v) {
                return false;
            }
        }
    }
    if let Some(exprs) = &selector.match_expressions {
        for expr in exprs {
            if !match_expression(expr, labels) {
                return false;
            }
        }
    }
    true
}

fn match_expression(expr: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let values: BTreeSet<&str> = expr.values.as_deref().unwrap_or(&[]).iter().map(String::as_str).collect();
    match expr.operator.as_str() {
        "In" => labels.get(&expr.key).is_some_and(|v| values.contains(v.as_str())),
        "NotIn" => !labels.get(&expr.key).is_some_and(|v| values.contains(v.as_str())),
        "Exists" => labels.contains_key(&expr.key),
        "DoesNotExist" => !labels.contains_key(&expr.key),
        _ => false,
    }
}

/// Selects pods in `namespace` matching `selector`. An empty (no
/// `matchLabels`/`matchExpressions`) selector matches every pod in the
/// namespace, per Kubernetes selector semantics.
fn select_pods_in_namespace<'a>(pods: &'a [Pod], namespace: &str, selector: &LabelSelector) -> Vec<&'a Pod> {
    pods.iter()
        .filter(|p| p.namespace == namespace && match_label_selector(selector, &p.labels))
        .collect()
}

fn select_namespaces<'a>(namespaces: &'a [Namespace], selector: &LabelSelector) -> Vec<&'a Namespace> {
    namespaces.iter().filter(|ns| match_label_selector(selector, &ns.labels)).collect()
}

/// Expands one `NetworkPolicyPeer` into the pod IPs and/or IP blocks it
/// denotes: ipBlock-only, selector-based, or (degenerately) neither selector
/// present, which defaults to "every pod in the policy's own namespace."
fn expand_peer(
    peer: &NetworkPolicyPeer,
    policy_namespace: &str,
    pods: &[Pod],
    namespaces: &[Namespace],
) -> Result<(BTreeMap<IpAddr, String>, Vec<IpBlock>), ModelError> {
    if let Some(ip_block) = &peer.ip_block {
        return Ok((BTreeMap::new(), vec![parse_ip_block(ip_block, policy_namespace, "peer")?]));
    }

    let mut peer_pods = BTreeMap::new();
    let matched_pods: Vec<&Pod> = match (&peer.namespace_selector, &peer.pod_selector) {
        (None, Some(pod_selector)) => select_pods_in_namespace(pods, policy_namespace, pod_selector)
            .into_iter()
            .chain(pods.iter().filter(|p| p.namespace != policy_namespace))
            .filter(|p| match_label_selector(pod_selector, &p.labels))
            .collect(),
        (Some(ns_selector), pod_selector) => {
            let matched_ns: BTreeSet<&str> = select_namespaces(namespaces, ns_selector).into_iter().map(|ns| ns.name.as_str()).collect();
            pods.iter()
                .filter(|p| matched_ns.contains(p.namespace.as_str()))
                .filter(|p| pod_selector.as_ref().is_none_or(|sel| match_label_selector(sel, &p.labels)))
                .collect()
        }
        (None, None) => select_pods_in_namespace(pods, policy_namespace, &LabelSelector::default()),
    };

    for pod in matched_pods {
        if let Some(ip) = pod.ip {
            peer_pods.insert(ip, pod.name.clone());
        }
    }

    Ok((peer_pods, Vec::new()))
}

fn parse_ip_block(ip_block: &ApiIpBlock, namespace: &str, name: &str) -> Result<IpBlock, ModelError> {
    let cidr = ip_block.cidr.parse::<IpNetwork>().map_err(|source| ModelError::InvalidCidr {
        namespace: namespace.to_string(),
        name: name.to_string(),
        cidr: ip_block.cidr.clone(),
        source,
    })?;
    let except = ip_block
        .except
        .clone()
        .unwrap_or_default()
        .iter()
        .map(|e| e.parse::<IpNetwork>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ModelError::InvalidCidr {
            namespace: namespace.to_string(),
            name: name.to_string(),
            cidr: ip_block.cidr.clone(),
            source,
        })?;
    Ok(IpBlock { cidr, except })
}

fn resolve_named_ports(port: &NetworkPolicyPort, name: &str, candidates: &BTreeMap<IpAddr, String>, pods: &[Pod]) -> Vec<NamedPortGroup> {
    let protocol = Protocol::from_api(port.protocol.as_deref());
    let mut groups: BTreeMap<u16, BTreeSet<IpAddr>> = BTreeMap::new();

    for (ip, pod_name) in candidates {
        let Some(pod) = pods.iter().find(|p| p.ip == Some(*ip) && &p.name == pod_name) else {
            continue;
        };
        for np in &pod.named_ports {
            if np.name == name && np.protocol == protocol {
                groups.entry(np.port).or_default().insert(*ip);
            }
        }
    }

    groups
        .into_iter()
        .map(|(numeric_port, peer_ips)| NamedPortGroup { protocol, numeric_port, peer_ips })
        .collect()
}

fn build_rule_ports(ports: &Option<Vec<NetworkPolicyPort>>, peer_pods: &BTreeMap<IpAddr, String>, pods: &[Pod]) -> (bool, Vec<(Protocol, u16)>, Vec<NamedPortGroup>) {
    let Some(ports) = ports else {
        return (true, Vec::new(), Vec::new());
    };
    if ports.is_empty() {
        return (true, Vec::new(), Vec::new());
    }

    let mut numeric = Vec::new();
    let mut named = Vec::new();
    for p in ports {
        let protocol = Protocol::from_api(p.protocol.as_deref());
        match &p.port {
            Some(IntOrString::Int(port)) => numeric.push((protocol, *port as u16)),
            Some(IntOrString::String(name)) => named.extend(resolve_named_ports(p, name, peer_pods, pods)),
            None => {}
        }
    }
    (false, numeric, named)
}

fn build_rule(
    peers: &Option<Vec<NetworkPolicyPeer>>,
    ports: &Option<Vec<NetworkPolicyPort>>,
    policy_namespace: &str,
    pods: &[Pod],
    namespaces: &[Namespace],
) -> Result<Rule, ModelError> {
    let Some(peers) = peers else {
        let (match_all_ports, numeric, named) = build_rule_ports(ports, &BTreeMap::new(), pods);
        return Ok(Rule {
            match_all_ports,
            ports: numeric,
            named_ports: named,
            match_all_peers: true,
            peer_pods: BTreeMap::new(),
            peer_blocks: Vec::new(),
        });
    };
    if peers.is_empty() {
        let (match_all_ports, numeric, named) = build_rule_ports(ports, &BTreeMap::new(), pods);
        return Ok(Rule {
            match_all_ports,
            ports: numeric,
            named_ports: named,
            match_all_peers: true,
            peer_pods: BTreeMap::new(),
            peer_blocks: Vec::new(),
        });
    }

    let mut peer_pods = BTreeMap::new();
    let mut peer_blocks = Vec::new();
    for peer in peers {
        let (pods_found, blocks_found) = expand_peer(peer, policy_namespace, pods, namespaces)?;
        peer_pods.extend(pods_found);
        peer_blocks.extend(blocks_found);
    }

    let (match_all_ports, numeric, named) = build_rule_ports(ports, &peer_pods, pods);
    Ok(Rule {
        match_all_ports,
        ports: numeric,
        named_ports: named,
        match_all_peers: false,
        peer_pods,
        peer_blocks,
    })
}

/// Builds the normalized policy set from the current lister snapshot. Target
/// pods are resolved per spec 4.2; policy type is normalized so that a spec
/// declaring neither ingress nor egress policy types is treated as
/// ingress-only.
pub fn build_policies(raw_policies: &[ApiNetworkPolicy], pods: &[Pod], namespaces: &[Namespace]) -> Result<Vec<Policy>, ModelError> {
    let mut out = Vec::with_capacity(raw_policies.len());
    for raw in raw_policies {
        let namespace = raw.metadata.namespace.clone().unwrap_or_default();
        let name = raw.metadata.name.clone().unwrap_or_default();
        let spec = match &raw.spec {
            Some(spec) => spec,
            None => continue,
        };

        let target_pods: BTreeSet<IpAddr> = select_pods_in_namespace(pods, &namespace, &spec.pod_selector)
            .into_iter()
            .filter_map(|p| p.ip)
            .collect();

        let declared_types: BTreeSet<&str> = spec
            .policy_types
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .map(String::as_str)
            .collect();
        let wants_ingress = declared_types.contains("Ingress") || (declared_types.is_empty());
        let wants_egress = declared_types.contains("Egress");
        let policy_type = match (wants_ingress, wants_egress) {
            (true, true) => PolicyType::Both,
            (false, true) => PolicyType::Egress,
            _ => PolicyType::Ingress,
        };

        let ingress = if wants_ingress {
            build_ingress_rules(spec.ingress.as_deref(), &namespace, pods, namespaces)?
        } else {
            Vec::new()
        };
        let egress = if wants_egress {
            build_egress_rules(spec.egress.as_deref(), &namespace, pods, namespaces)?
        } else {
            Vec::new()
        };

        out.push(Policy {
            namespace,
            name,
            target_pods,
            ingress,
            egress,
            policy_type,
        });
    }
    Ok(out)
}

fn build_ingress_rules(
    rules: Option<&[NetworkPolicyIngressRule]>,
    namespace: &str,
    pods: &[Pod],
    namespaces: &[Namespace],
) -> Result<Vec<Rule>, ModelError> {
    let Some(rules) = rules else { return Ok(Vec::new()) };
    rules.iter().map(|r| build_rule(&r.from, &r.ports, namespace, pods, namespaces)).collect()
}

fn build_egress_rules(
    rules: Option<&[k8s_openapi::api::networking::v1::NetworkPolicyEgressRule]>,
    namespace: &str,
    pods: &[Pod],
    namespaces: &[Namespace],
) -> Result<Vec<Rule>, ModelError> {
    let Some(rules) = rules else { return Ok(Vec::new()) };
    rules.iter().map(|r| build_rule(&r.to, &r.ports, namespace, pods, namespaces)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::networking::v1::{NetworkPolicySpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap as Map;

    fn pod(namespace: &str, name: &str, ip: &str, labels: &[(&str, &str)]) -> Pod {
        Pod {
            namespace: namespace.to_string(),
            name: name.to_string(),
            ip: Some(ip.parse().unwrap()),
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            named_ports: Vec::new(),
            local: false,
        }
    }

    fn selector(labels: &[(&str, &str)]) -> LabelSelector {
        LabelSelector {
            match_labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
            match_expressions: None,
        }
    }

    fn policy_object(namespace: &str, name: &str, spec: NetworkPolicySpec) -> ApiNetworkPolicy {
        ApiNetworkPolicy {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(spec),
            status: None,
        }
    }

    #[test]
    fn target_pods_resolved_by_pod_selector() {
        let pods = vec![
            pod("default", "web-1", "10.1.2.5", &[("app", "web")]),
            pod("default", "db-1", "10.1.2.6", &[("app", "db")]),
        ];
        let spec = NetworkPolicySpec {
            pod_selector: selector(&[("app", "web")]),
            ingress: None,
            egress: None,
            policy_types: None,
        };
        let policies = build_policies(&[policy_object("default", "allow-web", spec)], &pods, &[]).unwrap();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].target_pods.len(), 1);
        assert!(policies[0].target_pods.contains(&"10.1.2.5".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn policy_type_defaults_to_ingress_when_unspecified() {
        let spec = NetworkPolicySpec {
            pod_selector: LabelSelector::default(),
            ingress: None,
            egress: None,
            policy_types: None,
        };
        let policies = build_policies(&[policy_object("default", "p", spec)], &[], &[]).unwrap();
        assert_eq!(policies[0].policy_type, PolicyType::Ingress);
    }

    #[test]
    fn ingress_rule_expands_pod_selector_peer_in_same_namespace() {
        let pods = vec![
            pod("default", "web-1", "10.1.2.5", &[("app", "web")]),
            pod("default", "client-1", "10.1.5.7", &[("app", "client")]),
        ];
        let spec = NetworkPolicySpec {
            pod_selector: selector(&[("app", "web")]),
            ingress: Some(vec![NetworkPolicyIngressRule {
                from: Some(vec![NetworkPolicyPeer {
                    pod_selector: Some(selector(&[("app", "client")])),
                    namespace_selector: None,
                    ip_block: None,
                }]),
                ports: Some(vec![NetworkPolicyPort {
                    protocol: Some("TCP".to_string()),
                    port: Some(IntOrString::Int(80)),
                    end_port: None,
                }]),
            }]),
            egress: None,
            policy_types: Some(vec!["Ingress".to_string()]),
        };
        let policies = build_policies(&[policy_object("default", "allow-web", spec)], &pods, &[]).unwrap();
        let rule = &policies[0].ingress[0];
        assert_eq!(rule.ports, vec![(Protocol::Tcp, 80)]);
        assert_eq!(rule.peer_pods.len(), 1);
        assert!(rule.peer_pods.contains_key(&"10.1.5.7".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn empty_from_list_means_match_all_peers() {
        let pods = vec![pod("default", "web-1", "10.1.2.5", &[("app", "web")])];
        let spec = NetworkPolicySpec {
            pod_selector: selector(&[("app", "web")]),
            ingress: Some(vec![NetworkPolicyIngressRule { from: None, ports: None }]),
            egress: None,
            policy_types: None,
        };
        let policies = build_policies(&[policy_object("default", "p", spec)], &pods, &[]).unwrap();
        assert!(policies[0].ingress[0].match_all_peers);
        assert!(policies[0].ingress[0].match_all_ports);
    }

    #[test]
    fn ip_block_peer_is_retained_with_excepts() {
        let spec = NetworkPolicySpec {
            pod_selector: LabelSelector::default(),
            ingress: Some(vec![NetworkPolicyIngressRule {
                from: Some(vec![NetworkPolicyPeer {
                    pod_selector: None,
                    namespace_selector: None,
                    ip_block: Some(ApiIpBlock {
                        cidr: "10.0.0.0/8".to_string(),
                        except: Some(vec!["10.1.0.0/16".to_string()]),
                    }),
                }]),
                ports: None,
            }]),
            egress: None,
            policy_types: None,
        };
        let policies = build_policies(&[policy_object("default", "p", spec)], &[], &[]).unwrap();
        let rule = &policies[0].ingress[0];
        assert_eq!(rule.peer_blocks.len(), 1);
        assert_eq!(rule.peer_blocks[0].except.len(), 1);
    }

    #[test]
    fn label_selector_match_expressions_in_operator() {
        let sel = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "tier".to_string(),
                operator: "In".to_string(),
                values: Some(vec!["frontend".to_string(), "backend".to_string()]),
            }]),
        };
        let mut labels = Map::new();
        labels.insert("tier".to_string(), "frontend".to_string());
        assert!(match_label_selector(&sel, &labels));
        labels.insert("tier".to_string(), "database".to_string());
        assert!(!match_label_selector(&sel, &labels));
    }
}
