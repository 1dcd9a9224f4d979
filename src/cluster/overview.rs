//! Aggregated, read-optimized view of the cluster.
//!
//! [`aggregate`] is a pure function of the latest machine snapshots and the
//! latest container snapshots. Its output is deterministic: services are
//! ordered by name and each service's hosts are ordered least-loaded first,
//! which the routing table turns directly into endpoint order.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::NodeSnapshot;

/// Host-level usage shown in the overview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub hostname: String,
    pub cpu: f64,
    pub memory: f64,
}

/// Load of one replica of a service on one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostStat {
    pub host: String,
    pub cpu: f64,
    pub memory: f64,
}

/// A named workload and every host currently running it.
///
/// `replicas == host_stats.len()` and is never zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub replicas: usize,
    pub external_port: String,
    pub host_stats: Vec<HostStat>,
}

/// Machines plus services, rebuilt and swapped as a unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Overview {
    pub machines: Vec<Machine>,
    pub services: Vec<Service>,
}

impl Overview {
    /// Returns the service with the given name, if present.
    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name == name)
    }
}

/// Builds an [`Overview`] from machine and container snapshots.
pub fn aggregate(machines: &[NodeSnapshot], containers: &[NodeSnapshot]) -> Overview {
    let machines = machines
        .iter()
        .map(|node| Machine {
            hostname: node.hostname.clone(),
            cpu: node.machine_stats.cpu,
            memory: node.machine_stats.memory,
        })
        .collect();

    // name -> [(host, port, cpu, memory)]
    let mut groups: BTreeMap<&str, Vec<(&str, &str, f64, f64)>> = BTreeMap::new();
    for node in containers {
        for container in &node.containers {
            groups.entry(container.name.as_str()).or_default().push((
                node.hostname.as_str(),
                container.external_port.as_str(),
                container.cpu,
                container.memory,
            ));
        }
    }

    let services = groups
        .into_iter()
        .filter(|(_, members)| !members.is_empty())
        .map(|(name, mut members)| {
            members.sort_by(|a, b| compare_load((a.2, a.3, a.0), (b.2, b.3, b.0)));
            let external_port = members
                .iter()
                .map(|m| m.1)
                .find(|port| !port.is_empty())
                .unwrap_or_default()
                .to_string();
            let host_stats: Vec<HostStat> = members
                .iter()
                .map(|&(host, _, cpu, memory)| HostStat {
                    host: host.to_string(),
                    cpu,
                    memory,
                })
                .collect();
            Service {
                name: name.to_string(),
                replicas: host_stats.len(),
                external_port,
                host_stats,
            }
        })
        .collect();

    Overview { machines, services }
}

/// Ascending by cpu, then memory; hostname breaks exact ties.
fn compare_load(a: (f64, f64, &str), b: (f64, f64, &str)) -> Ordering {
    a.0.total_cmp(&b.0)
        .then_with(|| a.1.total_cmp(&b.1))
        .then_with(|| a.2.cmp(b.2))
}
