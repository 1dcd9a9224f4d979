//! Per-node telemetry snapshots produced by the collector each cycle.

use serde::{Deserialize, Serialize};

use super::Role;

/// Host-level resource usage, in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineStats {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
}

/// One running container on one node.
///
/// `name` is the service identity; `(node, name)` is unique.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    pub name: String,
    pub cpu: f64,
    pub memory: f64,
    pub disk: String,
    pub external_port: String,
}

/// Everything collected from one node in one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub hostname: String,
    pub role: Role,
    #[serde(default)]
    pub machine_stats: MachineStats,
    #[serde(default)]
    pub containers: Vec<ContainerStats>,
}

impl NodeSnapshot {
    /// Snapshot carrying only machine stats.
    pub fn with_machine(hostname: impl Into<String>, role: Role, stats: MachineStats) -> Self {
        Self {
            hostname: hostname.into(),
            role,
            machine_stats: stats,
            containers: Vec::new(),
        }
    }

    /// Snapshot carrying only container stats.
    pub fn with_containers(
        hostname: impl Into<String>,
        role: Role,
        containers: Vec<ContainerStats>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            role,
            machine_stats: MachineStats::default(),
            containers,
        }
    }
}
