//! Forwards one request to a selected endpoint and reports the outcome to
//! the circuit breaker.
//!
//! The request timeout covers connecting, sending the request head and
//! receiving the response head. Bodies stream in both directions without
//! buffering and are not subject to the timeout.

use std::error::Error as StdError;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::header::{HOST, TRANSFER_ENCODING};
use http::uri::{PathAndQuery, Uri};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use super::breaker::CircuitBreaker;
use super::upstream::Selected;

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("endpoint did not answer within {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid endpoint {0}")]
    InvalidEndpoint(String),
    #[error("client request body failed: {0}")]
    ClientAborted(String),
}

#[derive(Debug, Clone, Copy)]
pub struct ForwarderSettings {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

/// Breaker bookkeeping for one forwarding attempt.
///
/// Dropping an unsettled attempt means the caller went away; only the
/// HalfOpen trial slot is returned, nothing is recorded.
struct Attempt<'a> {
    breaker: &'a CircuitBreaker,
    endpoint: &'a str,
    trial: bool,
    settled: bool,
}

impl<'a> Attempt<'a> {
    fn new(breaker: &'a CircuitBreaker, selected: &'a Selected) -> Self {
        Self {
            breaker,
            endpoint: &selected.endpoint,
            trial: selected.trial,
            settled: false,
        }
    }

    fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.endpoint);
    }

    fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.endpoint);
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            tracing::debug!(endpoint = %self.endpoint, "trial request cancelled by client");
            self.breaker.release_trial(self.endpoint);
        }
    }
}

/// Inbound body that notes when the client side of the stream fails.
///
/// An upload cut short by the client surfaces from the outbound client as
/// an ordinary request error; the flag keeps it off the endpoint's record.
struct ClientBody<B> {
    inner: B,
    failed: Arc<AtomicBool>,
}

impl<B> Body for ClientBody<B>
where
    B: Body + Unpin,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let polled = Pin::new(&mut self.inner).poll_frame(cx);
        if let Poll::Ready(Some(Err(_))) = &polled {
            self.failed.store(true, Ordering::Release);
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

pub struct Forwarder<B = Incoming> {
    client: Client<HttpConnector, ClientBody<B>>,
    breaker: Arc<CircuitBreaker>,
    timeout: Duration,
}

impl<B> Forwarder<B>
where
    B: Body + Send + Unpin + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    pub fn new(breaker: Arc<CircuitBreaker>, settings: ForwarderSettings) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(settings.connect_timeout));
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self {
            client,
            breaker,
            timeout: settings.request_timeout,
        }
    }

    /// Sends `req` to the selected endpoint.
    ///
    /// Destination 5xx responses are returned as-is but count as failures.
    pub async fn forward(
        &self,
        selected: &Selected,
        req: Request<B>,
    ) -> Result<Response<Incoming>, ForwardError> {
        let attempt = Attempt::new(&self.breaker, selected);

        let (mut parts, body) = req.into_parts();
        parts.uri = match outbound_uri(&selected.endpoint, &parts.uri) {
            Ok(uri) => uri,
            Err(e) => {
                attempt.failure();
                return Err(e);
            }
        };
        parts.headers.remove(HOST);
        parts.headers.remove(TRANSFER_ENCODING);
        let client_failed = Arc::new(AtomicBool::new(false));
        let body = ClientBody {
            inner: body,
            failed: Arc::clone(&client_failed),
        };
        let outbound = Request::from_parts(parts, body);

        match tokio::time::timeout(self.timeout, self.client.request(outbound)).await {
            Err(_) => {
                attempt.failure();
                Err(ForwardError::Timeout(self.timeout))
            }
            Ok(Err(e)) if client_failed.load(Ordering::Acquire) => {
                drop(attempt);
                Err(ForwardError::ClientAborted(error_chain(&e)))
            }
            Ok(Err(e)) => {
                attempt.failure();
                Err(ForwardError::Transport(error_chain(&e)))
            }
            Ok(Ok(mut response)) => {
                if response.status().is_server_error() {
                    attempt.failure();
                } else {
                    attempt.success();
                }
                response.headers_mut().remove(TRANSFER_ENCODING);
                Ok(response)
            }
        }
    }
}

/// `http://{endpoint}` followed by the original path and query.
pub fn outbound_uri(endpoint: &str, original: &Uri) -> Result<Uri, ForwardError> {
    let path_and_query = original
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    Uri::builder()
        .scheme("http")
        .authority(endpoint)
        .path_and_query(path_and_query)
        .build()
        .map_err(|_| ForwardError::InvalidEndpoint(endpoint.to_string()))
}

fn error_chain(e: &(dyn StdError + 'static)) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::proxy::breaker::tests::{breaker_with, ManualClock};
    use crate::proxy::breaker::{BreakerSettings, CircuitState};
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::future::Future;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    /// Serves `handler` on an ephemeral local port.
    pub(crate) async fn spawn_backend<F, Fut>(handler: F) -> SocketAddr
    where
        F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = handler.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let handler = handler.clone();
                        async move { Ok::<_, Infallible>(handler(req).await) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        addr
    }

    /// Address with nothing listening on it.
    pub(crate) async fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    pub(crate) fn text(status: u16, body: &str) -> Response<Full<Bytes>> {
        Response::builder()
            .status(status)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    fn forwarder(breaker: Arc<CircuitBreaker>, timeout: Duration) -> Forwarder<Full<Bytes>> {
        Forwarder::new(
            breaker,
            ForwarderSettings {
                request_timeout: timeout,
                connect_timeout: Duration::from_secs(1),
            },
        )
    }

    fn get(path: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .uri(path)
            .header(HOST, "web")
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    fn selected(addr: SocketAddr, trial: bool) -> Selected {
        Selected {
            endpoint: addr.to_string(),
            trial,
        }
    }

    // ========== Phase 1: URI Construction ==========

    #[test]
    fn test_outbound_uri_preserves_path_and_query() {
        let original: Uri = "/api/items?page=2&sort=asc".parse().unwrap();
        let uri = outbound_uri("10.0.0.1:8080", &original).unwrap();
        assert_eq!(uri.to_string(), "http://10.0.0.1:8080/api/items?page=2&sort=asc");
    }

    #[test]
    fn test_outbound_uri_replaces_authority() {
        let original: Uri = "http://web.example.com/x".parse().unwrap();
        let uri = outbound_uri("10.0.0.1:8080", &original).unwrap();
        assert_eq!(uri.to_string(), "http://10.0.0.1:8080/x");
    }

    #[test]
    fn test_outbound_uri_invalid_endpoint() {
        let original: Uri = "/".parse().unwrap();
        assert!(matches!(
            outbound_uri("bad host:80", &original),
            Err(ForwardError::InvalidEndpoint(_))
        ));
    }

    // ========== Phase 2: Forwarding ==========

    #[tokio::test]
    async fn test_forward_relays_response() {
        let addr = spawn_backend(|req: Request<Incoming>| async move {
            let host = req
                .headers()
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            text(200, &format!("{} {}", req.uri(), host))
        })
        .await;
        let breaker = Arc::new(CircuitBreaker::new(BreakerSettings::default()));
        let fwd = forwarder(Arc::clone(&breaker), Duration::from_secs(5));

        let response = fwd.forward(&selected(addr, false), get("/echo?x=1")).await.unwrap();
        assert_eq!(response.status(), 200);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, format!("/echo?x=1 {addr}"));
    }

    #[tokio::test]
    async fn test_server_error_relayed_and_recorded() {
        let addr = spawn_backend(|_req: Request<Incoming>| async { text(500, "boom") }).await;
        let breaker = Arc::new(CircuitBreaker::new(BreakerSettings::default()));
        let fwd = forwarder(Arc::clone(&breaker), Duration::from_secs(5));

        let response = fwd.forward(&selected(addr, false), get("/")).await.unwrap();
        assert_eq!(response.status(), 500);
        assert_eq!(breaker.failure_count(&addr.to_string()), 1);
    }

    #[tokio::test]
    async fn test_client_error_is_success() {
        let addr = spawn_backend(|_req: Request<Incoming>| async { text(404, "nope") }).await;
        let breaker = Arc::new(CircuitBreaker::new(BreakerSettings::default()));
        breaker.record_failure(&addr.to_string());
        let fwd = forwarder(Arc::clone(&breaker), Duration::from_secs(5));

        let response = fwd.forward(&selected(addr, false), get("/")).await.unwrap();
        assert_eq!(response.status(), 404);
        assert_eq!(breaker.failure_count(&addr.to_string()), 0);
    }

    // ========== Phase 3: Failures ==========

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let addr = closed_port().await;
        let breaker = Arc::new(CircuitBreaker::new(BreakerSettings::default()));
        let fwd = forwarder(Arc::clone(&breaker), Duration::from_secs(5));

        let result = fwd.forward(&selected(addr, false), get("/")).await;
        assert!(matches!(result, Err(ForwardError::Transport(_))));
        assert_eq!(breaker.failure_count(&addr.to_string()), 1);
    }

    #[tokio::test]
    async fn test_slow_endpoint_times_out() {
        let addr = spawn_backend(|_req: Request<Incoming>| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            text(200, "late")
        })
        .await;
        let breaker = Arc::new(CircuitBreaker::new(BreakerSettings::default()));
        let fwd = forwarder(Arc::clone(&breaker), Duration::from_millis(100));

        let result = fwd.forward(&selected(addr, false), get("/")).await;
        assert!(matches!(result, Err(ForwardError::Timeout(_))));
        assert_eq!(breaker.failure_count(&addr.to_string()), 1);
    }

    type FailingBody = http_body_util::StreamBody<
        futures::stream::Iter<std::vec::IntoIter<Result<Frame<Bytes>, std::io::Error>>>,
    >;

    /// Body that yields one chunk and then fails, like a client that hangs up mid-upload.
    fn broken_upload() -> Request<FailingBody> {
        let frames = vec![
            Ok(Frame::data(Bytes::from_static(b"hello"))),
            Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "client gone")),
        ];
        Request::builder()
            .method("POST")
            .uri("/upload")
            .body(http_body_util::StreamBody::new(futures::stream::iter(frames)))
            .unwrap()
    }

    #[tokio::test]
    async fn test_client_body_error_not_recorded() {
        let addr = spawn_backend(|req: Request<Incoming>| async move {
            let _ = req.into_body().collect().await;
            text(200, "ok")
        })
        .await;
        let endpoint = addr.to_string();
        let breaker = Arc::new(CircuitBreaker::new(BreakerSettings::default()));
        let fwd: Forwarder<FailingBody> = Forwarder::new(
            Arc::clone(&breaker),
            ForwarderSettings {
                request_timeout: Duration::from_secs(5),
                connect_timeout: Duration::from_secs(1),
            },
        );

        for _ in 0..5 {
            let result = fwd.forward(&selected(addr, false), broken_upload()).await;
            assert!(matches!(result, Err(ForwardError::ClientAborted(_))));
        }
        assert_eq!(breaker.failure_count(&endpoint), 0);
        assert_eq!(breaker.state(&endpoint), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_client_body_error_releases_trial() {
        let addr = spawn_backend(|req: Request<Incoming>| async move {
            let _ = req.into_body().collect().await;
            text(200, "ok")
        })
        .await;
        let endpoint = addr.to_string();
        let clock = ManualClock::new();
        let breaker = Arc::new(breaker_with(&clock));
        half_open(&clock, &breaker, &endpoint).await;
        let fwd: Forwarder<FailingBody> = Forwarder::new(
            Arc::clone(&breaker),
            ForwarderSettings {
                request_timeout: Duration::from_secs(5),
                connect_timeout: Duration::from_secs(1),
            },
        );

        let result = fwd.forward(&selected(addr, true), broken_upload()).await;
        assert!(matches!(result, Err(ForwardError::ClientAborted(_))));
        assert_eq!(breaker.failure_count(&endpoint), 3);
        assert!(breaker.try_begin_trial(&endpoint));
    }

    // ========== Phase 4: HalfOpen trials ==========

    async fn half_open(clock: &Arc<ManualClock>, breaker: &CircuitBreaker, endpoint: &str) {
        for _ in 0..3 {
            breaker.record_failure(endpoint);
        }
        clock.advance(Duration::from_secs(30));
        assert!(breaker.try_begin_trial(endpoint));
    }

    #[tokio::test]
    async fn test_trial_success_closes_circuit() {
        let addr = spawn_backend(|_req: Request<Incoming>| async { text(200, "ok") }).await;
        let clock = ManualClock::new();
        let breaker = Arc::new(breaker_with(&clock));
        half_open(&clock, &breaker, &addr.to_string()).await;
        let fwd = forwarder(Arc::clone(&breaker), Duration::from_secs(5));

        fwd.forward(&selected(addr, true), get("/")).await.unwrap();
        assert_eq!(breaker.state(&addr.to_string()), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_cancelled_trial_released_without_failure() {
        let addr = spawn_backend(|_req: Request<Incoming>| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            text(200, "late")
        })
        .await;
        let endpoint = addr.to_string();
        let clock = ManualClock::new();
        let breaker = Arc::new(breaker_with(&clock));
        half_open(&clock, &breaker, &endpoint).await;
        let fwd = Arc::new(forwarder(Arc::clone(&breaker), Duration::from_secs(10)));

        let task = tokio::spawn({
            let fwd = Arc::clone(&fwd);
            async move { fwd.forward(&selected(addr, true), get("/")).await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();
        let _ = task.await;

        assert_eq!(breaker.failure_count(&endpoint), 3);
        assert_eq!(breaker.state(&endpoint), CircuitState::HalfOpen);
        assert!(breaker.try_begin_trial(&endpoint));
    }
}
