//! HTTP health server.
//!
//! `/healthz` answers as long as the process runs. `/readyz` succeeds once
//! the routing table holds at least one route. `/stats` reports the request
//! rate and routing table state as JSON.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::proxy::RequestStats;
use crate::store::RouteTable;

/// Shared state read by the health endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub table: Arc<RouteTable>,
    pub stats: Arc<RequestStats>,
}

#[derive(Debug, Serialize)]
struct StatsReport {
    timestamp: u64,
    requests_per_second: f64,
    route_count: usize,
    routes_version: u64,
}

/// Handles health check requests.
pub async fn health_handler<B>(
    state: HealthState,
    req: Request<B>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/healthz" => text(StatusCode::OK, "ok"),
        "/readyz" if state.table.route_count() > 0 => text(StatusCode::OK, "ok"),
        "/readyz" => text(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
        "/stats" => stats_response(&state),
        _ => text(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

fn stats_response(state: &HealthState) -> Response<Full<Bytes>> {
    let report = StatsReport {
        timestamp: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
        requests_per_second: state.stats.requests_per_second(),
        route_count: state.table.route_count(),
        routes_version: state.table.version(),
    };
    match serde_json::to_vec(&report) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to encode stats");
            text(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

/// Serves health requests on `listener` until `shutdown` fires.
pub async fn start_health_server(
    listener: TcpListener,
    state: HealthState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "health accept failed");
                    continue;
                }
            },
        };
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| health_handler(state.clone(), req));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %e, "health connection error");
            }
        });
    }
}
