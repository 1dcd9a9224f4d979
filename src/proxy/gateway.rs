//! Inbound HTTP surface of the edge.
//!
//! Resolves each request's host through the [`Router`], forwards it with the
//! [`Forwarder`] and maps routing or forwarding errors to fixed-text
//! responses.

use std::convert::Infallible;
use std::error::Error as StdError;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use http::header::HOST;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::forwarder::{ForwardError, Forwarder};
use super::router::{RouteError, Router};
use super::stats::RequestStats;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub struct Gateway<B = Incoming> {
    router: Router,
    forwarder: Forwarder<B>,
    stats: Arc<RequestStats>,
}

impl<B> Gateway<B>
where
    B: Body + Send + Unpin + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    pub fn new(router: Router, forwarder: Forwarder<B>, stats: Arc<RequestStats>) -> Self {
        Self {
            router,
            forwarder,
            stats,
        }
    }

    /// Proxies one request. Never fails; errors become 400/404/502/503/504.
    pub async fn handle(&self, req: Request<B>) -> Response<ProxyBody> {
        self.stats.record();

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let host = extract_host_for_routing(
            req.headers().get(HOST).and_then(|v| v.to_str().ok()),
            req.uri().authority().map(|a| a.as_str()),
        );

        let (response, backend) = match self.router.resolve(&host) {
            Ok(selected) => {
                let response = match self.forwarder.forward(&selected, req).await {
                    Ok(response) => response.map(|body| body.boxed()),
                    Err(e) => {
                        tracing::warn!(
                            host = %host,
                            endpoint = %selected.endpoint,
                            error = %e,
                            "forwarding failed"
                        );
                        forward_error_response(&e)
                    }
                };
                (response, Some(selected.endpoint))
            }
            Err(e) => {
                tracing::debug!(host = %host, error = %e, "request not routed");
                (route_error_response(&e), None)
            }
        };

        tracing::info!(
            method = %method,
            path = %path,
            host = %host,
            status = response.status().as_u16(),
            backend = backend.as_deref().unwrap_or("-"),
            "request completed"
        );
        response
    }
}

fn route_error_response(e: &RouteError) -> Response<ProxyBody> {
    match e {
        RouteError::NotFound(_) | RouteError::NoEndpoints(_) => {
            plain(StatusCode::NOT_FOUND, "no route")
        }
        RouteError::Unavailable(_) => plain(StatusCode::SERVICE_UNAVAILABLE, "service unavailable"),
    }
}

fn forward_error_response(e: &ForwardError) -> Response<ProxyBody> {
    match e {
        ForwardError::Timeout(_) => plain(StatusCode::GATEWAY_TIMEOUT, "gateway timeout"),
        ForwardError::Transport(_) | ForwardError::InvalidEndpoint(_) => {
            plain(StatusCode::BAD_GATEWAY, "bad gateway")
        }
        ForwardError::ClientAborted(_) => plain(StatusCode::BAD_REQUEST, "bad request"),
    }
}

fn plain(status: StatusCode, text: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(
        Full::new(Bytes::from_static(text.as_bytes()))
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = status;
    response
}

/// Extracts the host for routing from request headers.
///
/// The Host header wins over the URI authority. The port is left for the
/// router to strip. Returns an empty string if neither is present.
pub fn extract_host_for_routing(host_header: Option<&str>, authority: Option<&str>) -> String {
    host_header.or(authority).unwrap_or("").trim().to_string()
}

/// Accepts connections on `listener` until `shutdown` fires.
///
/// In-flight connections finish on their own; a client that disconnects
/// drops its request future, which cancels the forward.
pub async fn serve(
    listener: TcpListener,
    gateway: Arc<Gateway>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };
        let gateway = Arc::clone(&gateway);

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let gateway = Arc::clone(&gateway);
                async move { Ok::<_, Infallible>(gateway.handle(req).await) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                tracing::debug!(peer = %peer, error = %e, "proxy connection error");
            }
        });
    }
}
