use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use kube::Client;
use tokio::signal;
use tracing::info;

use netpol_agent::config::AgentConfig;
use netpol_agent::http;
use netpol_agent::ipset::ProcessIpSet;
use netpol_agent::iptables::ProcessIpTables;
use netpol_agent::k8s::{run_watchers, KubeListers};
use netpol_agent::reconcile::Reconciler;

use crate::cli::HostArgs;

pub async fn run(args: HostArgs) -> Result<()> {
    let config = AgentConfig::from_args(args.to_agent_config_args()).context("invalid configuration")?;
    let http_addr: SocketAddr = args.http_addr.parse().context("invalid --http-addr")?;

    println!("Starting netpol-agent...\n");
    info!(node = %config.node_name, "agent_starting");

    let client = Client::try_default().await.context("failed to connect to Kubernetes cluster")?;
    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("cannot reach cluster: {e}. Is the cluster running?");
        }
    }

    if config.metrics_enabled {
        netpol_agent::metrics::init();
    }

    let listers = KubeListers::new();
    let ipt = Arc::new(ProcessIpTables);
    let ipset = Arc::new(ProcessIpSet);

    let reconciler = Reconciler::new(
        config.clone(),
        Arc::new(listers.clone()),
        Arc::new(listers.clone()),
        Arc::new(listers.clone()),
        ipt.clone(),
        ipt.clone(),
        ipset,
    );

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let watch_client = client.clone();
    let watch_node = config.node_name.clone();
    let watch_reconciler = reconciler.clone();
    let watch_shutdown = shutdown_tx.subscribe();
    let watch_listers = listers.clone();
    let watch_handle = tokio::spawn(async move {
        run_watchers(watch_client, watch_node, &watch_listers, watch_reconciler, watch_shutdown).await;
    });

    let reconcile_shutdown = shutdown_tx.subscribe();
    let reconcile_handle = tokio::spawn(reconciler.clone().run(reconcile_shutdown));

    let ready = reconciler.ready_flag();
    let router = http::build_router(ready);
    let http_shutdown = shutdown_tx.subscribe();
    let listener = tokio::net::TcpListener::bind(http_addr).await.context("failed to bind HTTP server")?;

    println!("  HTTP server ................. http://{http_addr}");
    println!();
    println!("  Available endpoints:");
    println!("    GET /healthz .............. Liveness probe (always 200 OK)");
    println!("    GET /readyz ............... Readiness probe (503 until first sync, then 200)");
    println!("    GET /metrics .............. Prometheus metrics scrape endpoint");
    println!();
    println!("netpol-agent running. Press Ctrl+C to stop.\n");
    info!(addr = %http_addr, "http_server_started");

    let http_handle = tokio::spawn(async move {
        let mut http_shutdown = http_shutdown;
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.recv().await;
            })
            .await
    });

    signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown_signal_received");
    println!("\nShutdown signal received. Stopping netpol-agent...");

    let _ = shutdown_tx.send(());
    let _ = watch_handle.await;
    let _ = reconcile_handle.await;
    let _ = http_handle.await;

    info!("agent_stopped");
    println!("netpol-agent stopped.");
    Ok(())
}
