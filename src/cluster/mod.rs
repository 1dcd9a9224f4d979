//! Cluster data model.
//!
//! Membership input, per-node telemetry snapshots, and the aggregated
//! overview that drives routing.

mod hub;
mod membership;
mod node;
mod overview;

pub use hub::OverviewHub;
pub use membership::{Admin, ClusterSetup, Member, MembershipError, Role};
pub use node::{ContainerStats, MachineStats, NodeSnapshot};
pub use overview::{aggregate, HostStat, Machine, Overview, Service};
