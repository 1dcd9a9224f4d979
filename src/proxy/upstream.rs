//! Round-robin endpoint selection with circuit-breaker awareness.
//!
//! Each domain keeps a persistent cursor into its endpoint list. Selection
//! starts at the cursor and walks the list at most once, skipping endpoints
//! whose circuit is Open and HalfOpen endpoints whose trial slot is taken.
//! When the endpoint list changes length the cursor restarts at the front,
//! which is the least-loaded host after a fresh aggregation.

use std::sync::Arc;

use dashmap::DashMap;

use super::breaker::{CircuitBreaker, CircuitState};
use crate::store::Routes;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectError {
    #[error("no endpoints configured")]
    NoEndpoints,
    #[error("every endpoint has an open circuit")]
    AllUnavailable,
}

/// Endpoint chosen for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selected {
    pub endpoint: String,
    /// Holds the HalfOpen trial slot; the outcome must be recorded or released.
    pub trial: bool,
}

#[derive(Debug, Default)]
struct Cursor {
    next: usize,
    len: usize,
}

pub struct LoadBalancer {
    cursors: DashMap<String, Cursor>,
    breaker: Arc<CircuitBreaker>,
}

impl LoadBalancer {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            cursors: DashMap::new(),
            breaker,
        }
    }

    /// Selects the next endpoint for `domain`.
    pub fn next(&self, domain: &str, endpoints: &[String]) -> Result<Selected, SelectError> {
        if endpoints.is_empty() {
            return Err(SelectError::NoEndpoints);
        }

        let len = endpoints.len();
        let mut cursor = self.cursors.entry(domain.to_string()).or_default();
        if cursor.len != len {
            cursor.len = len;
            cursor.next = 0;
        }

        for offset in 0..len {
            let idx = (cursor.next + offset) % len;
            let endpoint = &endpoints[idx];
            let trial = match self.breaker.state(endpoint) {
                CircuitState::Closed => false,
                CircuitState::HalfOpen if self.breaker.try_begin_trial(endpoint) => {
                    tracing::info!(domain = %domain, endpoint = %endpoint, "sending trial request");
                    true
                }
                CircuitState::HalfOpen | CircuitState::Open => continue,
            };
            cursor.next = (idx + 1) % len;
            return Ok(Selected {
                endpoint: endpoint.clone(),
                trial,
            });
        }

        tracing::warn!(domain = %domain, endpoints = len, "no endpoint available");
        Err(SelectError::AllUnavailable)
    }

    /// Forgets cursors and circuits that `routes` no longer mentions.
    pub fn prune(&self, routes: &Routes) {
        let before = self.cursors.len();
        self.cursors.retain(|domain, _| routes.get(domain).is_some());
        let cursors = before.saturating_sub(self.cursors.len());

        let live = routes.endpoints();
        let circuits = self.breaker.retain_endpoints(|endpoint| live.contains(endpoint));
        if cursors + circuits > 0 {
            tracing::debug!(cursors, circuits, "pruned state of removed routes");
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}
