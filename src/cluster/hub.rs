//! Owner of the latest snapshot halves and the published overview.
//!
//! Machine and container data arrive from two independent monitor loops.
//! Each update replaces one half, recomputes the overview from both, persists
//! it and publishes it on a single-slot `watch` channel.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::{watch, Mutex};

use super::{aggregate, ContainerStats, MachineStats, NodeSnapshot, Overview, Role};
use crate::store::{SnapshotStore, CONTAINER_SNAPSHOT, MACHINE_SNAPSHOT, OVERVIEW_SNAPSHOT};

#[derive(Default)]
struct Halves {
    machines: Vec<NodeSnapshot>,
    containers: Vec<NodeSnapshot>,
}

pub struct OverviewHub {
    halves: Mutex<Halves>,
    publisher: watch::Sender<Arc<Overview>>,
    store: SnapshotStore,
}

impl OverviewHub {
    /// Creates a hub with no data.
    pub fn new(store: SnapshotStore) -> Self {
        let (publisher, _) = watch::channel(Arc::new(Overview::default()));
        Self {
            halves: Mutex::new(Halves::default()),
            publisher,
            store,
        }
    }

    /// Creates a hub primed from the persisted snapshots.
    ///
    /// Unreadable documents are logged and treated as absent. A missing half
    /// is rebuilt from the persisted overview so the first single-sided
    /// update does not erase what the overview already serves.
    pub async fn warm(store: SnapshotStore) -> Self {
        let machines: Option<Vec<NodeSnapshot>> = read_logged(&store, MACHINE_SNAPSHOT).await;
        let containers: Option<Vec<NodeSnapshot>> = read_logged(&store, CONTAINER_SNAPSHOT).await;
        let persisted: Option<Overview> = read_logged(&store, OVERVIEW_SNAPSHOT).await;

        let machines = machines.unwrap_or_else(|| {
            persisted.as_ref().map(machines_from).unwrap_or_default()
        });
        let containers = containers.unwrap_or_else(|| {
            persisted.as_ref().map(containers_from).unwrap_or_default()
        });
        let overview = persisted.unwrap_or_else(|| aggregate(&machines, &containers));
        tracing::info!(
            machines = overview.machines.len(),
            services = overview.services.len(),
            "overview warmed from snapshots"
        );

        let (publisher, _) = watch::channel(Arc::new(overview));
        Self {
            halves: Mutex::new(Halves {
                machines,
                containers,
            }),
            publisher,
            store,
        }
    }

    /// Receiver that always holds the latest overview.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Overview>> {
        self.publisher.subscribe()
    }

    pub fn current(&self) -> Arc<Overview> {
        Arc::clone(&self.publisher.borrow())
    }

    /// Replaces the machine half, keeping the container half.
    pub async fn update_machines(&self, nodes: Vec<NodeSnapshot>) -> Arc<Overview> {
        let mut halves = self.halves.lock().await;
        halves.machines = nodes;
        self.publish(&halves).await
    }

    /// Replaces the container half, keeping the machine half.
    pub async fn update_containers(&self, nodes: Vec<NodeSnapshot>) -> Arc<Overview> {
        let mut halves = self.halves.lock().await;
        halves.containers = nodes;
        self.publish(&halves).await
    }

    // Called with the halves lock held so publications stay ordered.
    async fn publish(&self, halves: &Halves) -> Arc<Overview> {
        let overview = Arc::new(aggregate(&halves.machines, &halves.containers));
        if let Err(e) = self.store.write(OVERVIEW_SNAPSHOT, overview.as_ref()).await {
            tracing::error!(error = %e, "failed to persist overview");
        }
        self.publisher.send_replace(Arc::clone(&overview));
        overview
    }
}

async fn read_logged<T: DeserializeOwned>(store: &SnapshotStore, key: &str) -> Option<T> {
    match store.read(key).await {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(key, error = %e, "snapshot unreadable, ignoring it");
            None
        }
    }
}

/// Machine half recovered from an overview. Roles and disk usage are not
/// part of the overview and come back as defaults.
fn machines_from(overview: &Overview) -> Vec<NodeSnapshot> {
    overview
        .machines
        .iter()
        .map(|machine| {
            NodeSnapshot::with_machine(
                machine.hostname.as_str(),
                Role::Worker,
                MachineStats {
                    cpu: machine.cpu,
                    memory: machine.memory,
                    disk: 0.0,
                },
            )
        })
        .collect()
}

/// Container half recovered from an overview, one node per host.
fn containers_from(overview: &Overview) -> Vec<NodeSnapshot> {
    let mut hosts: BTreeMap<&str, Vec<ContainerStats>> = BTreeMap::new();
    for service in &overview.services {
        for stat in &service.host_stats {
            hosts.entry(stat.host.as_str()).or_default().push(ContainerStats {
                name: service.name.clone(),
                cpu: stat.cpu,
                memory: stat.memory,
                disk: String::new(),
                external_port: service.external_port.clone(),
            });
        }
    }
    hosts
        .into_iter()
        .map(|(host, containers)| NodeSnapshot::with_containers(host, Role::Worker, containers))
        .collect()
}
