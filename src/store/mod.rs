//! Storage for cluster snapshots and the live routing table.
//!
//! Snapshots are persisted as JSON documents; the routing table is an
//! in-memory copy-on-write map rebuilt from each published overview.

mod route_store;
mod route_sync;
mod snapshot_store;

pub use route_store::{RouteTable, Routes};
pub use route_sync::run_route_sync;
pub use snapshot_store::{
    SnapshotError, SnapshotStore, CONTAINER_SNAPSHOT, MACHINE_SNAPSHOT, OVERVIEW_SNAPSHOT,
};
