//! Keeps the routing table in step with published overviews.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::RouteTable;
use crate::cluster::Overview;
use crate::proxy::LoadBalancer;

/// Applies the current overview, then every newly published one, until
/// the channel closes or `shutdown` fires.
///
/// After each swap the balancer drops state kept for routes that are gone.
pub async fn run_route_sync(
    mut overviews: watch::Receiver<Arc<Overview>>,
    table: Arc<RouteTable>,
    balancer: Arc<LoadBalancer>,
    shutdown: CancellationToken,
) {
    loop {
        let overview = Arc::clone(&overviews.borrow_and_update());
        if table.apply_overview(&overview) {
            tracing::info!(
                version = table.version(),
                routes = table.route_count(),
                "routing table replaced"
            );
            balancer.prune(&table.snapshot());
        } else {
            tracing::debug!("routing table unchanged");
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = overviews.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}
