//! Periodic collection cycles.
//!
//! One [`ClusterMonitor`] runs per [`CollectionKind`]. A cycle reads the
//! membership document, queries every node concurrently, persists the
//! usable results and hands them to the [`OverviewHub`]. A cycle with no
//! usable result leaves the last good snapshot untouched.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::cluster::{Admin, ClusterSetup, Member, NodeSnapshot, OverviewHub};
use crate::collector::NodeCollector;
use crate::store::{SnapshotStore, CONTAINER_SNAPSHOT, MACHINE_SNAPSHOT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    Machine,
    Container,
}

impl CollectionKind {
    fn snapshot_key(self) -> &'static str {
        match self {
            CollectionKind::Machine => MACHINE_SNAPSHOT,
            CollectionKind::Container => CONTAINER_SNAPSHOT,
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionKind::Machine => f.write_str("machine"),
            CollectionKind::Container => f.write_str("container"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every node answered.
    Success { collected: usize },
    /// Some nodes answered; their results were persisted.
    PartialFailure { collected: usize, failed: usize },
    /// Nothing was persisted.
    TotalFailure { reason: String },
    /// Another cycle of the same kind was still running.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub membership_file: PathBuf,
    pub success_interval: Duration,
    pub error_interval: Duration,
}

/// Last known reachability per host, written by the machine loop.
#[derive(Debug, Default)]
pub struct NodeStatus {
    up: DashMap<String, bool>,
}

impl NodeStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, host: &str, up: bool) {
        self.up.insert(host.to_string(), up);
    }

    /// True only for hosts that failed their latest check. Unknown hosts are not down.
    pub fn is_down(&self, host: &str) -> bool {
        self.up.get(host).map(|up| !*up).unwrap_or(false)
    }
}

enum NodeResult {
    Usable(NodeSnapshot),
    Placeholder(NodeSnapshot),
    Failed,
}

pub struct ClusterMonitor<N: NodeCollector> {
    kind: CollectionKind,
    collector: Arc<N>,
    hub: Arc<OverviewHub>,
    store: SnapshotStore,
    status: Arc<NodeStatus>,
    settings: MonitorSettings,
    cycle: Mutex<()>,
}

impl<N: NodeCollector> ClusterMonitor<N> {
    pub fn new(
        kind: CollectionKind,
        collector: Arc<N>,
        hub: Arc<OverviewHub>,
        store: SnapshotStore,
        status: Arc<NodeStatus>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            kind,
            collector,
            hub,
            store,
            status,
            settings,
            cycle: Mutex::new(()),
        }
    }

    pub fn kind(&self) -> CollectionKind {
        self.kind
    }

    /// Runs one collection cycle unless one is already in progress.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let Ok(_cycle) = self.cycle.try_lock() else {
            tracing::debug!(kind = %self.kind, "cycle already running, skipping tick");
            return CycleOutcome::Skipped;
        };

        let setup = match ClusterSetup::load(&self.settings.membership_file).await {
            Ok(setup) => setup,
            Err(e) => {
                tracing::warn!(kind = %self.kind, error = %e, "cluster membership unavailable");
                return CycleOutcome::TotalFailure {
                    reason: e.to_string(),
                };
            }
        };

        let results = join_all(
            setup
                .members
                .iter()
                .map(|member| self.collect(member, &setup.admin)),
        )
        .await;

        let mut nodes = Vec::with_capacity(results.len());
        let mut collected = 0;
        let mut failed = 0;
        for result in results {
            match result {
                NodeResult::Usable(node) => {
                    collected += 1;
                    nodes.push(node);
                }
                NodeResult::Placeholder(node) => {
                    failed += 1;
                    nodes.push(node);
                }
                NodeResult::Failed => failed += 1,
            }
        }

        if collected == 0 {
            tracing::warn!(kind = %self.kind, failed, "no node answered, keeping last snapshot");
            return CycleOutcome::TotalFailure {
                reason: format!("none of {failed} nodes answered"),
            };
        }

        if let Err(e) = self.store.write(self.kind.snapshot_key(), &nodes).await {
            tracing::error!(kind = %self.kind, error = %e, "failed to persist snapshot");
            return CycleOutcome::TotalFailure {
                reason: e.to_string(),
            };
        }

        match self.kind {
            CollectionKind::Machine => self.hub.update_machines(nodes).await,
            CollectionKind::Container => self.hub.update_containers(nodes).await,
        };

        if failed == 0 {
            tracing::info!(kind = %self.kind, collected, failed, "collection cycle complete");
            CycleOutcome::Success { collected }
        } else {
            tracing::warn!(kind = %self.kind, collected, failed, "collection cycle partially failed");
            CycleOutcome::PartialFailure { collected, failed }
        }
    }

    async fn collect(&self, member: &Member, admin: &Admin) -> NodeResult {
        let host = member.hostname.as_str();
        match self.kind {
            CollectionKind::Machine => {
                let stats = self.collector.machine_stats(host, admin).await;
                self.status.mark(host, stats.is_some());
                match stats {
                    Some(stats) => {
                        NodeResult::Usable(NodeSnapshot::with_machine(host, member.role, stats))
                    }
                    None => NodeResult::Failed,
                }
            }
            CollectionKind::Container => {
                if self.status.is_down(host) {
                    tracing::debug!(host = %host, "host down, skipping container collection");
                    return NodeResult::Placeholder(NodeSnapshot::with_containers(
                        host,
                        member.role,
                        Vec::new(),
                    ));
                }
                match self.collector.container_stats(host, admin).await {
                    Some(containers) => NodeResult::Usable(NodeSnapshot::with_containers(
                        host,
                        member.role,
                        containers,
                    )),
                    None => NodeResult::Failed,
                }
            }
        }
    }

    /// Repeats cycles until `shutdown` fires, backing off after total failures.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(kind = %self.kind, "monitor loop started");
        loop {
            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                outcome = self.run_cycle() => outcome,
            };
            let delay = match outcome {
                CycleOutcome::TotalFailure { .. } => self.settings.error_interval,
                _ => self.settings.success_interval,
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        tracing::info!(kind = %self.kind, "monitor loop stopped");
    }
}
