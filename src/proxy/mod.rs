//! Request path of the edge: routing, load balancing, circuit breaking and
//! forwarding.

mod breaker;
mod forwarder;
mod gateway;
mod router;
mod stats;
mod upstream;

pub use breaker::{BreakerSettings, CircuitBreaker, CircuitState, Clock, SystemClock};
pub use forwarder::{outbound_uri, ForwardError, Forwarder, ForwarderSettings};
pub use gateway::{extract_host_for_routing, serve, Gateway, ProxyBody};
pub use router::{normalize_hostname, RouteError, Router};
pub use stats::RequestStats;
pub use upstream::{LoadBalancer, SelectError, Selected};
