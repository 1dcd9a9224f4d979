//! Cluster edge: fleet monitor plus host-routed reverse proxy.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cluster_edge::cluster::OverviewHub;
use cluster_edge::collector::{RemoteStatsCollector, SessionPool, SshConnector};
use cluster_edge::config::{Cli, EdgeConfig};
use cluster_edge::health::{start_health_server, HealthState};
use cluster_edge::monitor::{ClusterMonitor, CollectionKind, NodeStatus};
use cluster_edge::proxy::{
    serve, CircuitBreaker, Forwarder, Gateway, LoadBalancer, RequestStats, Router,
};
use cluster_edge::store::{run_route_sync, RouteTable, SnapshotStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = EdgeConfig::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    tracing::info!(config = %cli.config.display(), "cluster-edge starting");

    let store = SnapshotStore::open(&config.storage.snapshot_dir)
        .await
        .with_context(|| {
            format!(
                "opening snapshot directory {}",
                config.storage.snapshot_dir.display()
            )
        })?;
    let hub = Arc::new(OverviewHub::warm(store.clone()).await);
    let table = Arc::new(RouteTable::new());
    table.apply_overview(&hub.current());
    tracing::info!(routes = table.route_count(), "routing table warmed");

    let breaker = Arc::new(CircuitBreaker::new(config.breaker_settings()));
    let balancer = Arc::new(LoadBalancer::new(Arc::clone(&breaker)));
    let router = Router::new(Arc::clone(&table), Arc::clone(&balancer));
    let forwarder = Forwarder::new(Arc::clone(&breaker), config.forwarder_settings());
    let stats = Arc::new(RequestStats::new());
    let gateway = Arc::new(Gateway::new(router, forwarder, Arc::clone(&stats)));

    let proxy_listener = TcpListener::bind(config.proxy.listen)
        .await
        .with_context(|| format!("binding proxy listener {}", config.proxy.listen))?;
    let health_listener = TcpListener::bind(config.health.listen)
        .await
        .with_context(|| format!("binding health listener {}", config.health.listen))?;

    let pool = Arc::new(SessionPool::new(
        SshConnector::new(config.ssh_settings()),
        config.pool_settings(),
    ));
    let collector = Arc::new(RemoteStatsCollector::new(Arc::clone(&pool)));
    let status = Arc::new(NodeStatus::new());

    let shutdown = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    for kind in [CollectionKind::Machine, CollectionKind::Container] {
        let monitor = Arc::new(ClusterMonitor::new(
            kind,
            Arc::clone(&collector),
            Arc::clone(&hub),
            store.clone(),
            Arc::clone(&status),
            config.monitor_settings(),
        ));
        tasks.push(tokio::spawn(monitor.run(shutdown.clone())));
    }

    tasks.push(tokio::spawn(run_route_sync(
        hub.subscribe(),
        Arc::clone(&table),
        Arc::clone(&balancer),
        shutdown.clone(),
    )));
    tasks.push(Arc::clone(&pool).spawn_idle_sweeper(shutdown.clone()));

    let health_state = HealthState {
        table: Arc::clone(&table),
        stats,
    };
    let health_shutdown = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = start_health_server(health_listener, health_state, health_shutdown).await {
            tracing::error!(error = %e, "health server stopped");
        }
    }));

    let proxy_shutdown = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = serve(proxy_listener, gateway, proxy_shutdown).await {
            tracing::error!(error = %e, "proxy server stopped");
        }
    }));

    tracing::info!(
        proxy = %config.proxy.listen,
        health = %config.health.listen,
        "cluster-edge running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested");

    shutdown.cancel();
    pool.shutdown();
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "background task ended abnormally");
        }
    }

    tracing::info!("cluster-edge stopped");
    Ok(())
}
