//! Resolution of an incoming host to a concrete endpoint.
//!
//! The request host, lowercased and without its port, must equal a service
//! domain in the current routing table. The matching endpoint list is handed
//! to the load balancer.

use std::sync::Arc;

use super::upstream::{LoadBalancer, SelectError, Selected};
use crate::store::RouteTable;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("no route for host {0}")]
    NotFound(String),
    #[error("route for {0} has no endpoints")]
    NoEndpoints(String),
    #[error("all endpoints for {0} are unavailable")]
    Unavailable(String),
}

/// Routes incoming hosts to endpoints.
///
/// Reads a fresh routing snapshot per call, so a concurrent table swap is
/// seen either entirely or not at all.
pub struct Router {
    table: Arc<RouteTable>,
    balancer: Arc<LoadBalancer>,
}

impl Router {
    pub fn new(table: Arc<RouteTable>, balancer: Arc<LoadBalancer>) -> Self {
        Self { table, balancer }
    }

    pub fn resolve(&self, host: &str) -> Result<Selected, RouteError> {
        let domain = normalize_hostname(host);
        let routes = self.table.snapshot();
        let endpoints = routes
            .get(&domain)
            .ok_or_else(|| RouteError::NotFound(domain.clone()))?;

        self.balancer
            .next(&domain, endpoints)
            .map_err(|e| match e {
                SelectError::NoEndpoints => RouteError::NoEndpoints(domain),
                SelectError::AllUnavailable => RouteError::Unavailable(domain),
            })
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }
}

/// Normalizes a hostname: lowercase and strip port.
pub fn normalize_hostname(host: &str) -> String {
    let host = host.trim();
    let bare = match host.strip_prefix('[') {
        // [::1]:8080
        Some(rest) => rest.split(']').next().unwrap_or(rest),
        None => host.split(':').next().unwrap_or(host),
    };
    bare.trim_end_matches('.').to_lowercase()
}
