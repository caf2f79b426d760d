//! End-to-end reconciler scenarios against fake host clients and fake
//! listers (no kernel, no cluster): a pod with no matching policy falling
//! back to the default deny, a policy's allow rule showing up as an ip set
//! and a chain jump, a peer IP change updating set membership without
//! growing the rule count, a policy deletion reverting a pod to the default
//! chain, active-set closure surviving churn, and config validation
//! rejecting a malformed node-port range.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex as StdMutex};

use k8s_openapi::api::networking::v1::{
    NetworkPolicy as ApiNetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use netpol_agent::config::{AgentConfig, AgentConfigArgs};
use netpol_agent::ipset::FakeIpSet;
use netpol_agent::iptables::{FakeIpTables, IpTablesBulk};
use netpol_agent::listers::{NamespaceLister, PodLister, PolicyLister};
use netpol_agent::model::{Namespace, Pod};
use netpol_agent::naming;
use netpol_agent::reconcile::Reconciler;

struct FakePods(StdMutex<Vec<Pod>>);
impl PodLister for FakePods {
    fn list(&self) -> Vec<Pod> {
        self.0.lock().unwrap().clone()
    }
}

struct FakeNamespaces(Vec<Namespace>);
impl NamespaceLister for FakeNamespaces {
    fn list(&self) -> Vec<Namespace> {
        self.0.clone()
    }
}

struct FakePolicies(StdMutex<Vec<ApiNetworkPolicy>>);
impl PolicyLister for FakePolicies {
    fn list(&self) -> Vec<ApiNetworkPolicy> {
        self.0.lock().unwrap().clone()
    }
}

fn test_config() -> AgentConfig {
    AgentConfig::from_args(AgentConfigArgs {
        node_name: "node-a".to_string(),
        node_ip: "10.0.0.5".to_string(),
        pod_cidr: Some("10.1.2.0/24".to_string()),
        service_cluster_cidr: "10.96.0.0/12".to_string(),
        external_cidrs: vec![],
        node_port_range: "30000:32767".to_string(),
        sync_period_secs: 3600,
        metrics_enabled: false,
        pre_enforcement_accept: false,
    })
    .unwrap()
}

fn local_pod(namespace: &str, name: &str, ip: &str, labels: &[(&str, &str)]) -> Pod {
    Pod {
        namespace: namespace.to_string(),
        name: name.to_string(),
        ip: Some(ip.parse().unwrap()),
        labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<BTreeMap<_, _>>(),
        named_ports: Vec::new(),
        local: true,
    }
}

fn remote_pod(namespace: &str, name: &str, ip: &str, labels: &[(&str, &str)]) -> Pod {
    let mut pod = local_pod(namespace, name, ip, labels);
    pod.local = false;
    pod
}

fn selector(labels: &[(&str, &str)]) -> LabelSelector {
    LabelSelector {
        match_labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
        match_expressions: None,
    }
}

fn allow_web_policy(namespace: &str, name: &str) -> ApiNetworkPolicy {
    ApiNetworkPolicy {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(NetworkPolicySpec {
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
        }),
        status: None,
    }
}

/// Composer-owned chains (per-pod, per-policy, and the three custom
/// top-level chains) only ever exist inside the bulk-restore buffer, never
/// in the fake's direct-mutation `chains` map (that map is reserved for the
/// installer's builtin-chain jump rule). Pulls `-A <chain> ...` lines back
/// out of the last restored buffer.
fn rules_of(dump: &str, chain: &str) -> Vec<String> {
    let prefix = format!("-A {chain} ");
    dump.lines().filter_map(|l| l.strip_prefix(prefix.as_str())).map(|s| s.to_string()).collect()
}

struct Harness {
    reconciler: Arc<Reconciler>,
    pods: Arc<FakePods>,
    policies: Arc<FakePolicies>,
    ipt: Arc<FakeIpTables>,
    ipset: Arc<FakeIpSet>,
}

fn build(pods: Vec<Pod>, policies: Vec<ApiNetworkPolicy>) -> Harness {
    let ipt = Arc::new(FakeIpTables::new());
    let ipset = Arc::new(FakeIpSet::new());
    let pods = Arc::new(FakePods(StdMutex::new(pods)));
    let policies = Arc::new(FakePolicies(StdMutex::new(policies)));
    let reconciler = Reconciler::new(
        test_config(),
        pods.clone(),
        Arc::new(FakeNamespaces(Vec::new())),
        policies.clone(),
        ipt.clone(),
        ipt.clone(),
        ipset.clone(),
    );
    Harness { reconciler, pods, policies, ipt, ipset }
}

/// S1: one local pod, no policies — its chain rejects at the tail and the
/// forward chain jumps to it before the default fallthrough.
#[tokio::test]
async fn s1_local_pod_no_policies_rejects_by_default() {
    let h = build(vec![local_pod("default", "web-1", "10.1.2.5", &[("app", "web")])], vec![]);
    h.reconciler.full_sync().await.unwrap();

    let dump = h.ipt.dump_table("filter").await.unwrap();
    let pod_ip: IpAddr = "10.1.2.5".parse().unwrap();
    let forward = rules_of(&dump, naming::TOP_CHAIN_FORWARD);
    let jump = forward.iter().find(|r| r.contains(&pod_ip.to_string())).expect("jump to pod chain present");
    let chain_name: String = jump.rsplit("-j ").next().unwrap().to_string();
    assert!(chain_name.starts_with(naming::POD_CHAIN_PREFIX));

    let pod_rules = rules_of(&dump, &chain_name);
    assert!(pod_rules.iter().any(|r| r.contains("REJECT")));
}

/// S2: a policy targeting the pod plus a remote peer pod produces an ip set
/// containing exactly the peer and a per-pod jump to the policy chain ahead
/// of the default-ingress fallthrough.
#[tokio::test]
async fn s2_policy_creates_ip_set_and_policy_chain_jump() {
    let pods = vec![
        local_pod("default", "web-1", "10.1.2.5", &[("app", "web")]),
        remote_pod("default", "client-1", "10.1.5.7", &[("app", "client")]),
    ];
    let h = build(pods, vec![allow_web_policy("default", "allow-web")]);
    h.reconciler.full_sync().await.unwrap();

    let src_set = naming::policy_src_set_name("default", "allow-web");
    let members = h.ipset.members_of(&src_set).expect("policy source set created");
    assert_eq!(members, ["10.1.5.7".parse::<IpAddr>().unwrap()].into());

    let dump = h.ipt.dump_table("filter").await.unwrap();
    let pod_ip: IpAddr = "10.1.2.5".parse().unwrap();
    let forward = rules_of(&dump, naming::TOP_CHAIN_FORWARD);
    let jump = forward.iter().find(|r| r.contains(&pod_ip.to_string())).unwrap();
    assert!(!jump.contains(naming::DEFAULT_INGRESS_CHAIN), "should jump to the policy chain, not the default");
}

/// S3: the peer pod's IP changes; the ip set updates in place (same name),
/// and the number of engine-owned chains does not grow.
#[tokio::test]
async fn s3_peer_ip_change_updates_set_without_growing_chain_count() {
    let pods = vec![
        local_pod("default", "web-1", "10.1.2.5", &[("app", "web")]),
        remote_pod("default", "client-1", "10.1.5.7", &[("app", "client")]),
    ];
    let h = build(pods, vec![allow_web_policy("default", "allow-web")]);
    h.reconciler.full_sync().await.unwrap();

    let src_set = naming::policy_src_set_name("default", "allow-web");
    let chain_count_before = h.ipt.dump_table("filter").await.unwrap().lines().filter(|l| l.starts_with(':')).count();

    *h.pods.0.lock().unwrap() = vec![
        local_pod("default", "web-1", "10.1.2.5", &[("app", "web")]),
        remote_pod("default", "client-1", "10.1.5.8", &[("app", "client")]),
    ];
    h.reconciler.full_sync().await.unwrap();

    let members = h.ipset.members_of(&src_set).expect("same set name survives the sync");
    assert_eq!(members, ["10.1.5.8".parse::<IpAddr>().unwrap()].into());
    let chain_count_after = h.ipt.dump_table("filter").await.unwrap().lines().filter(|l| l.starts_with(':')).count();
    assert_eq!(chain_count_before, chain_count_after);
}

/// S4: deleting the policy removes its chain and source-pod set, and the
/// pod's chain falls back to the default-ingress jump.
#[tokio::test]
async fn s4_policy_deletion_falls_back_to_default_ingress() {
    let pods = vec![
        local_pod("default", "web-1", "10.1.2.5", &[("app", "web")]),
        remote_pod("default", "client-1", "10.1.5.7", &[("app", "client")]),
    ];
    let h = build(pods, vec![allow_web_policy("default", "allow-web")]);
    h.reconciler.full_sync().await.unwrap();

    let src_set = naming::policy_src_set_name("default", "allow-web");
    assert!(h.ipset.members_of(&src_set).is_some());

    h.policies.0.lock().unwrap().clear();
    h.reconciler.full_sync().await.unwrap();

    assert!(h.ipset.members_of(&src_set).is_none(), "stale policy set must be destroyed");
    let dump = h.ipt.dump_table("filter").await.unwrap();
    let pod_ip: IpAddr = "10.1.2.5".parse().unwrap();
    let forward = rules_of(&dump, naming::TOP_CHAIN_FORWARD);
    let jump = forward.iter().find(|r| r.contains(&pod_ip.to_string())).unwrap();
    assert!(jump.contains(naming::DEFAULT_INGRESS_CHAIN));
}

/// Invariant 2 (active closure): after any full sync, every engine-prefixed
/// chain on the host is either active this cycle or a default chain.
#[tokio::test]
async fn active_closure_holds_after_churn() {
    let pods = vec![local_pod("default", "web-1", "10.1.2.5", &[("app", "web")])];
    let h = build(pods, vec![allow_web_policy("default", "allow-web")]);
    h.reconciler.full_sync().await.unwrap();

    // No peer pod matches, and the policy disappears next cycle.
    h.policies.0.lock().unwrap().clear();
    h.reconciler.full_sync().await.unwrap();

    let dump = h.ipt.dump_table("filter").await.unwrap();
    let defaults = naming::always_active_chains();
    for chain in dump.lines().filter_map(|l| l.strip_prefix(':')).filter_map(|l| l.split_whitespace().next()) {
        if naming::is_engine_chain(chain) {
            assert!(defaults.contains(&chain) || chain.starts_with(naming::POD_CHAIN_PREFIX), "leftover stale chain {chain}");
        }
    }
}

/// Invariant 5 / at-least-once-before-events: event handlers are no-ops
/// until the first full sync has completed.
#[tokio::test]
async fn event_handlers_noop_before_first_sync() {
    use netpol_agent::listers::PodChange;

    let h = build(vec![local_pod("default", "web-1", "10.1.2.5", &[])], vec![]);
    assert!(!h.reconciler.is_ready());
    h.reconciler.handle_pod_change(PodChange::Added(local_pod("default", "web-2", "10.1.2.6", &[]))).await;
    assert!(h.ipt.restore_history().is_empty());
}

/// S5: invalid node-port ranges must fail construction.
#[test]
fn s5_invalid_node_port_ranges_rejected() {
    fn args(node_port_range: &str) -> AgentConfigArgs {
        AgentConfigArgs {
            node_name: "node-a".to_string(),
            node_ip: "10.0.0.5".to_string(),
            pod_cidr: None,
            service_cluster_cidr: "10.96.0.0/12".to_string(),
            external_cidrs: vec![],
            node_port_range: node_port_range.to_string(),
            sync_period_secs: 60,
            metrics_enabled: false,
            pre_enforcement_accept: false,
        }
    }

    assert!(AgentConfig::from_args(args("80:65536")).is_err(), "65536 is not a valid port");
    assert!(AgentConfig::from_args(args("30000:30000")).is_err(), "low must be < high");
}
