//! Edge for a small self-hosted container cluster.
//!
//! A background monitor collects machine and container statistics from
//! every node over SSH and folds them into a cluster overview. The overview
//! drives a host-based routing table used by a reverse proxy that balances
//! requests round-robin across healthy replicas behind per-endpoint circuit
//! breakers.

pub mod cluster;
pub mod collector;
pub mod config;
pub mod health;
pub mod monitor;
pub mod proxy;
pub mod store;
