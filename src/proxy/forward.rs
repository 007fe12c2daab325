//! Forwarding engine
//!
//! Picks an upstream through the active selector, establishes the transport
//! (CONNECT tunnel or proxied HTTP request), retries with a fresh selection
//! on dial failure, and reports every outcome to the usage tracker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use http::request::Parts;
use hyper::body::{Body, Incoming};
use hyper::client::conn::http1;
use hyper::header::{HeaderValue, HOST, PROXY_AUTHORIZATION};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::error::{GyreError, Result};
use crate::models::{RequestOutcome, RotationSettings, Upstream};
use crate::proxy::rotation::{SwappableSelector, UpstreamSelector};
use crate::proxy::tracker::UsageTracker;
use crate::proxy::{dial, tunnel};

/// Response body handed back to the listener: either a streamed upstream
/// body or a short generated one.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> ProxyBody {
    full_body(Bytes::new())
}

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 10;
const POOL_MAX_IDLE_TOTAL: usize = 100;

/// Engine knobs derived from the rotation settings
#[derive(Clone)]
pub struct EngineConfig {
    pub fallback: bool,
    pub fallback_max_retries: u32,
    /// Retries on the same upstream within one attempt
    pub retries: u32,
    /// Per-attempt deadline, covering dial and response headers
    pub timeout: Duration,
    pub follow_redirect: bool,
}

impl EngineConfig {
    pub fn from_rotation(settings: &RotationSettings) -> Self {
        Self {
            fallback: settings.fallback,
            fallback_max_retries: settings.fallback_max_retries.max(1) as u32,
            retries: settings.retries.max(0) as u32,
            timeout: Duration::from_secs(settings.timeout.max(1) as u64),
            follow_redirect: settings.follow_redirect,
        }
    }

    /// Upstream-switching attempts; at least one selection is always made
    pub fn attempts(&self) -> u32 {
        if self.fallback {
            self.fallback_max_retries.max(1)
        } else {
            1
        }
    }
}

struct IdleSender {
    sender: http1::SendRequest<Full<Bytes>>,
    idle_since: Instant,
}

/// Keep-alive pool of outbound HTTP/1.1 connections, keyed by upstream
/// address. Senders still draining a response body simply fail the
/// readiness probe and are discarded.
#[derive(Default)]
struct OutboundPool {
    idle: DashMap<String, Vec<IdleSender>>,
}

impl OutboundPool {
    fn checkout(&self, addr: &str) -> Option<http1::SendRequest<Full<Bytes>>> {
        let mut entry = self.idle.get_mut(addr)?;
        while let Some(idle) = entry.pop() {
            if idle.idle_since.elapsed() < POOL_IDLE_TIMEOUT
                && !idle.sender.is_closed()
                && idle.sender.is_ready()
            {
                return Some(idle.sender);
            }
        }
        None
    }

    fn checkin(&self, addr: &str, sender: http1::SendRequest<Full<Bytes>>) {
        if sender.is_closed() {
            return;
        }
        if self.total_idle() >= POOL_MAX_IDLE_TOTAL {
            return;
        }

        let mut entry = self.idle.entry(addr.to_string()).or_default();
        if entry.len() >= POOL_MAX_IDLE_PER_HOST {
            return;
        }
        entry.push(IdleSender {
            sender,
            idle_since: Instant::now(),
        });
    }

    fn total_idle(&self) -> usize {
        self.idle.iter().map(|entry| entry.len()).sum()
    }
}

/// The forwarding engine
pub struct ForwardingEngine {
    selector: Arc<SwappableSelector>,
    tracker: Arc<UsageTracker>,
    config: RwLock<EngineConfig>,
    pool: OutboundPool,
}

impl ForwardingEngine {
    pub fn new(
        selector: Arc<SwappableSelector>,
        tracker: Arc<UsageTracker>,
        config: EngineConfig,
    ) -> Self {
        Self {
            selector,
            tracker,
            config: RwLock::new(config),
            pool: OutboundPool::default(),
        }
    }

    /// Apply new rotation settings during reload
    pub fn update_config(&self, settings: &RotationSettings) {
        *self.config.write() = EngineConfig::from_rotation(settings);
    }

    fn config(&self) -> EngineConfig {
        self.config.read().clone()
    }

    /// Select an upstream for the next attempt
    ///
    /// An exhausted rate-limited pool aborts the whole request immediately;
    /// retrying cannot help before the window moves.
    async fn select_upstream(&self) -> Result<Arc<Upstream>> {
        self.selector.select().await
    }

    /// Handle a CONNECT request: establish a tunnel through an upstream,
    /// answer 200, then splice bytes after the client upgrade completes.
    #[instrument(skip(self, req), fields(target = %req.uri()))]
    pub async fn handle_connect<B>(&self, mut req: Request<B>) -> Result<Response<ProxyBody>>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        let authority = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| req.uri().to_string());
        let (target_host, target_port) = dial::parse_authority(&authority)?;

        let config = self.config();
        let attempts = config.attempts();
        let mut last_err = None;

        for attempt in 1..=attempts {
            let upstream = match self.select_upstream().await {
                Ok(upstream) => upstream,
                Err(e @ GyreError::AllRateLimited { .. }) => return Err(e),
                Err(e) => {
                    last_err = Some(e);
                    break;
                }
            };

            let started = Instant::now();
            let dialed = timeout(
                config.timeout,
                self.dial_with_retries(&upstream, &target_host, target_port, config.retries),
            )
            .await
            .unwrap_or(Err(GyreError::Timeout));

            match dialed {
                Ok(server_conn) => {
                    debug!(
                        upstream = %upstream.address,
                        target = %authority,
                        attempt,
                        "CONNECT tunnel established"
                    );

                    let upgrade = hyper::upgrade::on(&mut req);
                    let tracker = self.tracker.clone();
                    let upstream_id = upstream.id;

                    tokio::spawn(async move {
                        match upgrade.await {
                            Ok(upgraded) => {
                                let client = TokioIo::new(upgraded);
                                if let Err(e) = tunnel::splice(client, server_conn).await {
                                    debug!(upstream_id, error = %e, "tunnel ended with error");
                                }
                            }
                            Err(e) => {
                                warn!(upstream_id, error = %e, "client upgrade failed");
                            }
                        }
                        // The upstream accepted the CONNECT, so the attempt
                        // counts as a success regardless of how the transfer
                        // ended.
                        let latency = started.elapsed().as_millis() as i32;
                        tracker.record_detached(upstream_id, RequestOutcome::ok(latency, Some(200)));
                    });

                    return Ok(Response::builder()
                        .status(StatusCode::OK)
                        .body(empty_body())
                        .unwrap());
                }
                Err(e) => {
                    warn!(
                        upstream = %upstream.address,
                        target = %authority,
                        attempt,
                        attempts,
                        error = %e,
                        "CONNECT attempt failed"
                    );
                    let latency = started.elapsed().as_millis() as i32;
                    self.tracker
                        .record_detached(upstream.id, RequestOutcome::failed(latency, e.to_string()));
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or(GyreError::Exhausted { attempts }))
    }

    /// Handle a proxied HTTP request: forward through an upstream and stream
    /// the response back. Redirects pass through verbatim.
    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    pub async fn handle_http<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        let (mut parts, body) = req.into_parts();
        let (target_host, target_port) = dial::parse_target(&parts.uri)?;

        // Buffered so the same request can be replayed on another upstream.
        let body_bytes = body
            .collect()
            .await
            .map_err(|e| GyreError::InvalidRequest(format!("failed to read request body: {}", e)))?
            .to_bytes();

        strip_hop_by_hop(&mut parts.headers);

        let config = self.config();
        let attempts = config.attempts();
        let mut last_err = None;

        for attempt in 1..=attempts {
            let upstream = match self.select_upstream().await {
                Ok(upstream) => upstream,
                Err(e @ GyreError::AllRateLimited { .. }) => return Err(e),
                Err(e) => {
                    last_err = Some(e);
                    break;
                }
            };

            let started = Instant::now();
            let sent = timeout(
                config.timeout,
                self.send_with_retries(
                    &upstream,
                    &parts,
                    body_bytes.clone(),
                    &target_host,
                    target_port,
                    config.retries,
                ),
            )
            .await
            .unwrap_or(Err(GyreError::Timeout));

            match sent {
                Ok(response) => {
                    let latency = started.elapsed().as_millis() as i32;
                    let status = response.status();

                    debug!(
                        upstream = %upstream.address,
                        status = status.as_u16(),
                        attempt,
                        latency_ms = latency,
                        "forwarded HTTP request"
                    );

                    let outcome = if status.as_u16() < 400 {
                        RequestOutcome::ok(latency, Some(status.as_u16() as i32))
                    } else {
                        let mut outcome =
                            RequestOutcome::failed(latency, format!("upstream status {}", status));
                        outcome.status_code = Some(status.as_u16() as i32);
                        outcome
                    };
                    self.tracker.record_detached(upstream.id, outcome);

                    return Ok(response.map(|body| body.boxed()));
                }
                Err(e) => {
                    warn!(
                        upstream = %upstream.address,
                        attempt,
                        attempts,
                        error = %e,
                        "HTTP attempt failed"
                    );
                    let latency = started.elapsed().as_millis() as i32;
                    self.tracker
                        .record_detached(upstream.id, RequestOutcome::failed(latency, e.to_string()));
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or(GyreError::Exhausted { attempts }))
    }

    /// Dial the same upstream up to `retries + 1` times
    async fn dial_with_retries(
        &self,
        upstream: &Upstream,
        target_host: &str,
        target_port: u16,
        retries: u32,
    ) -> Result<TcpStream> {
        let mut last_err = None;
        for _ in 0..=retries {
            match dial::open_tunnel(upstream, target_host, target_port).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| GyreError::UpstreamConnectFailed("dial failed".into())))
    }

    /// Send one HTTP request through the same upstream, retrying on a fresh
    /// connection up to `retries` extra times
    async fn send_with_retries(
        &self,
        upstream: &Upstream,
        parts: &Parts,
        body: Bytes,
        target_host: &str,
        target_port: u16,
        retries: u32,
    ) -> Result<Response<Incoming>> {
        let mut last_err = None;
        for _ in 0..=retries {
            match self
                .send_once(upstream, parts, body.clone(), target_host, target_port)
                .await
            {
                Ok(response) => return Ok(response),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| GyreError::UpstreamConnectFailed("send failed".into())))
    }

    async fn send_once(
        &self,
        upstream: &Upstream,
        parts: &Parts,
        body: Bytes,
        target_host: &str,
        target_port: u16,
    ) -> Result<Response<Incoming>> {
        let mut sender = match self.pool.checkout(&upstream.address) {
            Some(sender) => sender,
            None => self.open_connection(upstream).await?,
        };

        let request = build_outbound_request(upstream, parts, body, target_host, target_port)?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| GyreError::UpstreamConnectFailed(format!("request failed: {}", e)))?;

        self.pool.checkin(&upstream.address, sender);
        Ok(response)
    }

    async fn open_connection(
        &self,
        upstream: &Upstream,
    ) -> Result<http1::SendRequest<Full<Bytes>>> {
        let stream = TcpStream::connect(&upstream.address).await.map_err(|e| {
            GyreError::UpstreamConnectFailed(format!(
                "TCP connect to {} failed: {}",
                upstream.address, e
            ))
        })?;

        let io = TokioIo::new(stream);
        let (sender, conn) = http1::handshake(io)
            .await
            .map_err(|e| GyreError::UpstreamConnectFailed(format!("handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("outbound connection ended: {}", e);
            }
        });

        Ok(sender)
    }
}

/// Build the absolute-form request sent to the upstream proxy
fn build_outbound_request(
    upstream: &Upstream,
    parts: &Parts,
    body: Bytes,
    target_host: &str,
    target_port: u16,
) -> Result<Request<Full<Bytes>>> {
    let scheme = parts.uri.scheme_str().unwrap_or("http");
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let default_port = matches!(
        (scheme, target_port),
        ("http", 80) | ("https", 443)
    );
    let uri_str = if default_port {
        format!("{}://{}{}", scheme, target_host, path_and_query)
    } else {
        format!(
            "{}://{}{}",
            scheme,
            dial::format_authority(target_host, target_port),
            path_and_query
        )
    };

    let mut builder = Request::builder().method(parts.method.clone()).uri(&uri_str);

    for (name, value) in &parts.headers {
        builder = builder.header(name, value);
    }

    let mut request = builder
        .body(Full::new(body))
        .map_err(|e| GyreError::InvalidRequest(format!("failed to build request: {}", e)))?;

    if !request.headers().contains_key(HOST) {
        let host_value = if default_port {
            target_host.to_string()
        } else {
            dial::format_authority(target_host, target_port)
        };
        request.headers_mut().insert(
            HOST,
            HeaderValue::from_str(&host_value)
                .map_err(|e| GyreError::InvalidRequest(format!("invalid host header: {}", e)))?,
        );
    }

    if let Some(credentials) = upstream.basic_credentials() {
        request.headers_mut().insert(
            PROXY_AUTHORIZATION,
            HeaderValue::from_str(&credentials)
                .map_err(|e| GyreError::Internal(format!("invalid credentials header: {}", e)))?,
        );
    }

    Ok(request)
}

/// Drop hop-by-hop headers before forwarding
fn strip_hop_by_hop(headers: &mut hyper::HeaderMap) {
    const HOP_BY_HOP: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "proxy-connection",
        "te",
        "trailer",
        "trailers",
        "transfer-encoding",
        "upgrade",
    ];

    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::rotation::{build_selector, testutil::test_upstream};
    use crate::repository::memory::{MemoryRequestLog, MemoryUpstreamStore};

    use http_body_util::Empty;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn engine_with(
        upstreams: Vec<crate::models::Upstream>,
        method: &str,
        settings: &mut RotationSettings,
    ) -> (
        Arc<ForwardingEngine>,
        Arc<MemoryUpstreamStore>,
        Arc<MemoryRequestLog>,
    ) {
        settings.method = method.to_string();
        let store = Arc::new(MemoryUpstreamStore::with_upstreams(upstreams));
        let log = Arc::new(MemoryRequestLog::default());
        let selector = build_selector(store.clone(), log.clone(), settings);
        let swap = Arc::new(SwappableSelector::new(selector));
        let tracker = Arc::new(UsageTracker::new(store.clone(), log.clone()));
        let engine = Arc::new(ForwardingEngine::new(
            swap,
            tracker,
            EngineConfig::from_rotation(settings),
        ));
        (engine, store, log)
    }

    /// Minimal upstream proxy that answers any request with 200 "hello"
    /// and hands the received head to the caller.
    async fn spawn_http_upstream() -> (std::net::SocketAddr, tokio::sync::oneshot::Receiver<String>)
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (head_tx, head_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let _ = head_tx.send(String::from_utf8_lossy(&buf[..n]).to_string());
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();
        });

        (addr, head_rx)
    }

    fn get_request(uri: &str) -> Request<Empty<Bytes>> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Empty::new())
            .unwrap()
    }

    #[test]
    fn test_engine_config_attempts() {
        let mut settings = RotationSettings::default();
        settings.fallback = true;
        settings.fallback_max_retries = 3;
        assert_eq!(EngineConfig::from_rotation(&settings).attempts(), 3);

        settings.fallback = false;
        assert_eq!(EngineConfig::from_rotation(&settings).attempts(), 1);

        settings.fallback = true;
        settings.fallback_max_retries = 0;
        assert_eq!(EngineConfig::from_rotation(&settings).attempts(), 1);
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("proxy-authorization", HeaderValue::from_static("Basic xyz"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("te", HeaderValue::from_static("trailers"));
        headers.insert("accept", HeaderValue::from_static("*/*"));
        headers.insert("x-custom", HeaderValue::from_static("kept"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 2);
        assert!(headers.contains_key("accept"));
        assert!(headers.contains_key("x-custom"));
    }

    #[test]
    fn test_build_outbound_request_sets_host_and_credentials() {
        let mut upstream = test_upstream(1, "10.0.0.1:3128");
        upstream.username = Some("user".to_string());
        upstream.password = Some("pass".to_string());

        let (parts, _) = get_request("http://example.com/v1?x=1").into_parts();
        let request =
            build_outbound_request(&upstream, &parts, Bytes::new(), "example.com", 80).unwrap();

        assert_eq!(request.uri().to_string(), "http://example.com/v1?x=1");
        assert_eq!(request.headers().get(HOST).unwrap(), "example.com");
        assert!(request
            .headers()
            .get(PROXY_AUTHORIZATION)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("Basic "));
    }

    #[test]
    fn test_build_outbound_request_keeps_explicit_port_and_host() {
        let upstream = test_upstream(1, "10.0.0.1:3128");

        let mut req = get_request("http://example.com:8080/v1");
        req.headers_mut()
            .insert(HOST, HeaderValue::from_static("override.example"));
        let (parts, _) = req.into_parts();

        let request =
            build_outbound_request(&upstream, &parts, Bytes::new(), "example.com", 8080).unwrap();

        assert_eq!(request.uri().to_string(), "http://example.com:8080/v1");
        // An existing Host header wins; the engine only fills the gap.
        assert_eq!(request.headers().get(HOST).unwrap(), "override.example");
    }

    #[tokio::test]
    async fn test_handle_http_forwards_through_upstream() {
        let (upstream_addr, head_rx) = spawn_http_upstream().await;

        let mut upstream = test_upstream(1, upstream_addr.to_string().as_str());
        upstream.username = Some("user".to_string());
        upstream.password = Some("pass".to_string());

        let mut settings = RotationSettings::default();
        let (engine, store, log) = engine_with(vec![upstream], "round-robin", &mut settings);
        engine.selector.refresh().await.unwrap();

        let response = engine
            .handle_http(get_request("http://example.com/v1/status?x=1"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello");

        let head = head_rx.await.unwrap();
        assert!(head.starts_with("GET http://example.com/v1/status?x=1 HTTP/1.1"));
        assert!(head.contains("proxy-authorization: Basic ")
            || head.contains("Proxy-Authorization: Basic "));

        // Outcome recorded against the chosen upstream.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(log.len(), 1);
        let recorded = store.get(1).unwrap();
        assert_eq!(recorded.requests, 1);
        assert_eq!(recorded.successful_requests, 1);
    }

    #[tokio::test]
    async fn test_handle_http_falls_back_across_upstreams() {
        // Three ports; after sorting by address the first two refuse
        // connections and the last one serves.
        let mut listeners = Vec::new();
        for _ in 0..3 {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap().to_string();
            listeners.push((addr, listener));
        }
        listeners.sort_by(|a, b| a.0.cmp(&b.0));

        let (dead_a, l1) = listeners.remove(0);
        let (dead_b, l2) = listeners.remove(0);
        let (live, live_listener) = listeners.remove(0);
        drop(l1);
        drop(l2);

        tokio::spawn(async move {
            let (mut stream, _) = live_listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
        });

        let mut settings = RotationSettings {
            fallback: true,
            fallback_max_retries: 3,
            retries: 0,
            ..RotationSettings::default()
        };
        let (engine, store, _log) = engine_with(
            vec![
                test_upstream(1, &dead_a),
                test_upstream(2, &dead_b),
                test_upstream(3, &live),
            ],
            "round-robin",
            &mut settings,
        );
        engine.selector.refresh().await.unwrap();

        let response = engine
            .handle_http(get_request("http://example.com/"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Two dial failures and one success, each against a distinct upstream.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let totals: Vec<(i64, i64, i64)> = (1..=3)
            .map(|id| {
                let u = store.get(id).unwrap();
                (u.requests, u.successful_requests, u.failed_requests)
            })
            .collect();
        assert_eq!(totals[0], (1, 0, 1));
        assert_eq!(totals[1], (1, 0, 1));
        assert_eq!(totals[2], (1, 1, 0));
    }

    #[tokio::test]
    async fn test_handle_http_exhausts_and_reports_last_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut settings = RotationSettings {
            fallback: true,
            fallback_max_retries: 2,
            retries: 0,
            ..RotationSettings::default()
        };
        let (engine, _store, _log) =
            engine_with(vec![test_upstream(1, &dead)], "round-robin", &mut settings);
        engine.selector.refresh().await.unwrap();

        let err = engine
            .handle_http(get_request("http://example.com/"))
            .await
            .unwrap_err();
        assert!(matches!(err, GyreError::UpstreamConnectFailed(_)));
    }

    #[tokio::test]
    async fn test_handle_http_propagates_empty_pool() {
        let mut settings = RotationSettings::default();
        let (engine, _store, _log) = engine_with(vec![], "round-robin", &mut settings);
        engine.selector.refresh().await.unwrap();

        let err = engine
            .handle_http(get_request("http://example.com/"))
            .await
            .unwrap_err();
        assert!(matches!(err, GyreError::NoUpstreams));
    }

    #[tokio::test]
    async fn test_handle_http_propagates_all_rate_limited_without_retry() {
        let log_store = Arc::new(MemoryRequestLog::default());
        log_store.push_success(1);
        log_store.push_success(1);

        let store = Arc::new(MemoryUpstreamStore::with_upstreams(vec![test_upstream(
            1,
            "127.0.0.1:1",
        )]));

        let mut settings = RotationSettings::default();
        settings.method = "rate-limited".to_string();
        settings.rate_limited.max_requests_per_minute = 2;
        settings.rate_limited.window_seconds = 60;

        let selector = build_selector(store.clone(), log_store.clone(), &settings);
        selector.refresh().await.unwrap();
        let swap = Arc::new(SwappableSelector::new(selector));
        let tracker = Arc::new(UsageTracker::new(store, log_store));
        let engine =
            ForwardingEngine::new(swap, tracker, EngineConfig::from_rotation(&settings));

        let err = engine
            .handle_http(get_request("http://example.com/"))
            .await
            .unwrap_err();
        match err {
            GyreError::AllRateLimited {
                max_requests,
                window_secs,
            } => {
                assert_eq!(max_requests, 2);
                assert_eq!(window_secs, 60);
            }
            other => panic!("expected AllRateLimited, got {}", other),
        }
    }

    #[tokio::test]
    async fn test_settings_reload_updates_engine_config() {
        let mut settings = RotationSettings::default();
        let (engine, _store, _log) = engine_with(vec![], "round-robin", &mut settings);
        assert!(engine.config().fallback);

        let reloaded = RotationSettings {
            fallback: false,
            timeout: 5,
            ..RotationSettings::default()
        };
        engine.update_config(&reloaded);

        let config = engine.config();
        assert!(!config.fallback);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.attempts(), 1);
    }
}
