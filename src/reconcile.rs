//! Reconciler / Event Loop: coalesces events and ticks into full-sync
//! requests, serializes execution, and gates event processing on at least
//! one completed full sync.
//!
//! The coalescing slot is a `tokio::sync::mpsc::channel` of capacity 1: a
//! `try_send` that finds the slot occupied returns `Full` and is dropped —
//! a full sync already pending will observe the same or newer state.
//! `request_sync` never blocks, so callers (event handlers, the ticker)
//! never stall waiting on the reconciler.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::composer::{self, ComposedSync};
use crate::config::AgentConfig;
use crate::error::SyncError;
use crate::gc;
use crate::installer;
use crate::ipset::{IpSetClient, IpSetType};
use crate::iptables::{IpTablesBulk, IpTablesMutate};
use crate::listers::{pod_change_is_significant, NamespaceChange, NamespaceLister, PodChange, PodLister, PolicyChange, PolicyLister};
use crate::metrics;
use crate::model;

const TABLE: &str = "filter";

pub struct Reconciler {
    config: AgentConfig,
    pods: Arc<dyn PodLister>,
    namespaces: Arc<dyn NamespaceLister>,
    policies: Arc<dyn PolicyLister>,
    bulk: Arc<dyn IpTablesBulk>,
    mutate: Arc<dyn IpTablesMutate>,
    ipset: Arc<dyn IpSetClient>,
    sync_mutex: Mutex<()>,
    ready: Arc<AtomicBool>,
    sync_version: AtomicU64,
    request_tx: mpsc::Sender<()>,
    request_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AgentConfig,
        pods: Arc<dyn PodLister>,
        namespaces: Arc<dyn NamespaceLister>,
        policies: Arc<dyn PolicyLister>,
        bulk: Arc<dyn IpTablesBulk>,
        mutate: Arc<dyn IpTablesMutate>,
        ipset: Arc<dyn IpSetClient>,
    ) -> Arc<Self> {
        let (request_tx, request_rx) = mpsc::channel(1);
        Arc::new(Self {
            config,
            pods,
            namespaces,
            policies,
            bulk,
            mutate,
            ipset,
            sync_mutex: Mutex::new(()),
            ready: Arc::new(AtomicBool::new(false)),
            sync_version: AtomicU64::new(0),
            request_tx,
            request_rx: Mutex::new(Some(request_rx)),
        })
    }

    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        self.ready.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Never blocks: a pending request already in the slot makes this a
    /// no-op (spec invariant 8, "coalescing").
    pub fn request_sync(&self) {
        let _ = self.request_tx.try_send(());
    }

    pub async fn handle_pod_change(&self, change: PodChange) {
        if !self.is_ready() {
            return;
        }
        let significant = match &change {
            PodChange::Added(_) | PodChange::Deleted(_) => true,
            PodChange::Updated { old, new } => pod_change_is_significant(old, new),
        };
        if significant {
            self.request_sync();
        }
    }

    pub async fn handle_namespace_change(&self, _change: NamespaceChange) {
        if self.is_ready() {
            self.request_sync();
        }
    }

    pub async fn handle_policy_change(&self, _change: PolicyChange) {
        if self.is_ready() {
            self.request_sync();
        }
    }

    /// Runs the ticker and the sync-request consumer until `shutdown` fires.
    /// The first full sync always runs immediately, before the ticker's
    /// first tick, so `readyForUpdates` flips as early as possible.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut rx = self.request_rx.lock().await.take().expect("run() called once");
        let mut ticker = interval(self.config.sync_period);
        ticker.tick().await; // first tick fires immediately

        if let Err(e) = self.full_sync().await {
            Self::handle_sync_error(e, "initial_full_sync_failed");
        }

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("reconciler_shutdown");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.full_sync().await {
                        Self::handle_sync_error(e, "periodic_full_sync_failed");
                    }
                }
                Some(()) = rx.recv() => {
                    if let Err(e) = self.full_sync().await {
                        Self::handle_sync_error(e, "requested_full_sync_failed");
                    }
                }
            }
        }
    }

    /// Every `SyncError` except `ChainInstall` is logged and left for the
    /// next tick/event to retry, including host-mutation failures raised
    /// while installing jump rules (transient iptables spawn/lock failures,
    /// not the chain-creation failure itself). `ChainInstall` specifically
    /// means a custom chain could not be created for a reason other than it
    /// already existing, and no amount of retrying fixes that, so it alone is
    /// fatal and the process exits rather than limping along unenforced.
    fn handle_sync_error(err: SyncError, context: &'static str) {
        error!(error = %err, context, "full_sync_failed");
        if matches!(err, SyncError::ChainInstall(_)) {
            error!("top_level_chain_install_impossible_exiting");
            std::process::exit(1);
        }
    }

    /// One complete reconciliation pass. Ordering is fixed: install
    /// top-level chains, build the model, compose, refresh ip sets, restore
    /// the filter table, then garbage-collect. A failure at
    /// any step aborts the sync without touching host state beyond what the
    /// (atomic) restore already applied.
    pub async fn full_sync(&self) -> Result<(), SyncError> {
        let _guard = self.sync_mutex.lock().await;
        let start = Instant::now();
        metrics::SYNC_TOTAL.inc();
        info!("full_sync_heartbeat");

        let result = self.full_sync_inner().await;

        metrics::SYNC_DURATION_SECONDS.observe(start.elapsed().as_secs_f64());
        match &result {
            Ok(()) => {
                self.ready.store(true, Ordering::Release);
            }
            Err(e) => {
                metrics::SYNC_ERRORS_TOTAL.inc();
                warn!(error = %e, "full_sync_failed");
            }
        }
        result
    }

    async fn full_sync_inner(&self) -> Result<(), SyncError> {
        // `install` itself distinguishes "cannot create the custom chain" (fatal,
        // surfaces as `SyncError::ChainInstall`) from ordinary jump-rule mutation
        // failures (retryable, surfaces as whatever `mutate` returned), so its
        // error is propagated as-is rather than collapsed into one variant here.
        installer::install(self.mutate.as_ref(), &self.config).await?;

        let pods = self.pods.list();
        let namespaces = self.namespaces.list();
        let raw_policies = self.policies.list();

        metrics::PODS_TRACKED.set(pods.len() as i64);
        metrics::POLICIES_TRACKED.set(raw_policies.len() as i64);

        let policies = model::build_policies(&raw_policies, &pods, &namespaces).map_err(|e| SyncError::ModelBuild(e.to_string()))?;

        let sync_version = self.sync_version.fetch_add(1, Ordering::SeqCst);
        let composed: ComposedSync = composer::compose(&policies, &pods, sync_version, &self.config);

        for (name, members) in &composed.set_members {
            self.ipset.refresh(name, IpSetType::HashIp, members).await?;
        }

        let buffer = composer::serialize_filter_table(&composed.chain_rules);
        self.bulk.restore_table(TABLE, &buffer).await?;

        let report = gc::collect(
            self.bulk.as_ref(),
            self.mutate.as_ref(),
            self.ipset.as_ref(),
            &composed.active_chains,
            &composed.active_sets,
        )
        .await?;

        metrics::ACTIVE_CHAINS.set(composed.active_chains.len() as i64);
        metrics::ACTIVE_IPSETS.set(composed.active_sets.len() as i64);
        metrics::STALE_CHAINS_COLLECTED_TOTAL.inc_by(report.stale_chains.len() as u64);
        metrics::STALE_IPSETS_COLLECTED_TOTAL.inc_by(report.stale_sets.len() as u64);

        Ok(())
    }

    /// Removes every engine-prefixed chain/set and the engine's jump rules
    /// from the built-in chains, leaving the host as it was before the
    /// engine ran. Runs outside the normal sync loop.
    pub async fn cleanup(&self) -> Result<(), SyncError> {
        installer::uninstall(self.mutate.as_ref()).await?;
        let empty_chains = Default::default();
        let empty_sets = Default::default();
        gc::collect(self.bulk.as_ref(), self.mutate.as_ref(), self.ipset.as_ref(), &empty_chains, &empty_sets)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfigArgs;
    use crate::ipset::FakeIpSet;
    use crate::iptables::FakeIpTables;
    use crate::model::{Namespace, Pod};
    use k8s_openapi::api::networking::v1::NetworkPolicy as ApiNetworkPolicy;
    use std::sync::Mutex as StdMutex;

    struct FakePods(Vec<Pod>);
    impl PodLister for FakePods {
        fn list(&self) -> Vec<Pod> {
            self.0.clone()
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
            metrics_enabled: true,
            pre_enforcement_accept: false,
        })
        .unwrap()
    }

    fn local_pod(ip: &str) -> Pod {
        Pod {
            namespace: "default".to_string(),
            name: "web-1".to_string(),
            ip: Some(ip.parse().unwrap()),
            labels: Default::default(),
            named_ports: Vec::new(),
            local: true,
        }
    }

    fn build_reconciler(pods: Vec<Pod>) -> (Arc<Reconciler>, Arc<FakeIpTables>, Arc<FakeIpSet>) {
        let ipt = Arc::new(FakeIpTables::new());
        let ipset = Arc::new(FakeIpSet::new());
        let reconciler = Reconciler::new(
            test_config(),
            Arc::new(FakePods(pods)),
            Arc::new(FakeNamespaces(Vec::new())),
            Arc::new(FakePolicies(StdMutex::new(Vec::new()))),
            ipt.clone(),
            ipt.clone(),
            ipset.clone(),
        );
        (reconciler, ipt, ipset)
    }

    #[tokio::test]
    async fn full_sync_flips_ready_flag() {
        let (reconciler, _ipt, _ipset) = build_reconciler(vec![local_pod("10.1.2.5")]);
        assert!(!reconciler.is_ready());
        reconciler.full_sync().await.unwrap();
        assert!(reconciler.is_ready());
    }

    #[tokio::test]
    async fn full_sync_installs_jump_and_restores_filter_table() {
        let (reconciler, ipt, _ipset) = build_reconciler(vec![local_pod("10.1.2.5")]);
        reconciler.full_sync().await.unwrap();
        assert_eq!(ipt.rules_in("FORWARD").len(), 2, "forward-in and forward-out jumps");
        assert_eq!(ipt.restore_history().len(), 1);
    }

    #[tokio::test]
    async fn event_handlers_are_noops_before_first_sync() {
        let (reconciler, ipt, _ipset) = build_reconciler(vec![local_pod("10.1.2.5")]);
        reconciler
            .handle_pod_change(PodChange::Added(local_pod("10.1.2.6")))
            .await;
        // request_sync would have queued a sync request; since we never
        // drained the channel, assert indirectly via readiness staying false
        // and no restore having happened yet.
        assert!(!reconciler.is_ready());
        assert!(ipt.restore_history().is_empty());
    }

    #[tokio::test]
    async fn idempotent_full_sync_keeps_active_chain_count_stable() {
        let (reconciler, ipt, _ipset) = build_reconciler(vec![local_pod("10.1.2.5")]);
        reconciler.full_sync().await.unwrap();
        let first_forward_len = ipt.rules_in("FORWARD").len();
        reconciler.full_sync().await.unwrap();
        assert_eq!(ipt.rules_in("FORWARD").len(), first_forward_len);
    }

    /// Invariant 8 / S6: a burst of N > 1 sync requests while the slot is
    /// already occupied collapses into at most one additional pending
    /// request, never N.
    #[tokio::test]
    async fn burst_of_requests_coalesces_to_one_pending_slot() {
        let (reconciler, _ipt, _ipset) = build_reconciler(vec![local_pod("10.1.2.5")]);

        for _ in 0..1000 {
            reconciler.request_sync();
        }

        let mut rx = reconciler.request_rx.lock().await.take().expect("slot not yet drained");
        let mut drained = 0;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        assert_eq!(drained, 1, "1000 requests into a capacity-1 slot must coalesce to exactly one pending sync");
    }
}
