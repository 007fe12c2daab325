//! Proxy server: listener, request routing, background maintenance
//!
//! Every client connection runs as its own task. Requests pass through the
//! middleware chain (client authentication, then the per-client rate limit)
//! before classification: CONNECT tunnels, the passthrough prefix, the
//! health endpoint, or plain proxied HTTP.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Body;
use hyper::header::{CONTENT_TYPE, PROXY_AUTHENTICATE, RETRY_AFTER};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ListenerConfig, PassthroughConfig};
use crate::error::{GyreError, Result};
use crate::proxy::forward::{full_body, EngineConfig, ForwardingEngine, ProxyBody};
use crate::proxy::middleware::{ClientRateLimiter, ProxyAuth};
use crate::proxy::rewrite::PassthroughRewriter;
use crate::proxy::rotation::{build_selector, SwappableSelector, UpstreamSelector};
use crate::proxy::tracker::UsageTracker;
use crate::repository::{RequestLogStore, SettingsStore, UpstreamStore};

/// Candidate sets go stale against the inventory at most this long
const REFRESH_INTERVAL: Duration = Duration::from_secs(30);
/// Idle limiter buckets are swept on this cadence
const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// The public-facing proxy server
pub struct ProxyServer {
    config: ListenerConfig,
    router: RequestRouter,
    selector: Arc<SwappableSelector>,
    engine: Arc<ForwardingEngine>,
    auth: Arc<ProxyAuth>,
    limiter: Arc<ClientRateLimiter>,
    upstream_store: Arc<dyn UpstreamStore>,
    request_log: Arc<dyn RequestLogStore>,
    settings_store: Arc<dyn SettingsStore>,
}

impl ProxyServer {
    /// Wire up selector, engine, tracker and middleware from stored settings
    ///
    /// A failing initial refresh is not fatal: the server starts and answers
    /// 502 until upstreams exist and the periodic refresh succeeds.
    pub async fn build(
        config: ListenerConfig,
        passthrough: Option<PassthroughConfig>,
        upstream_store: Arc<dyn UpstreamStore>,
        request_log: Arc<dyn RequestLogStore>,
        settings_store: Arc<dyn SettingsStore>,
    ) -> Result<Self> {
        let settings = settings_store.load().await?;

        let selector = build_selector(
            upstream_store.clone(),
            request_log.clone(),
            &settings.rotation,
        );
        match selector.refresh().await {
            Ok(()) => info!(
                method = %selector.method(),
                count = selector.candidate_count(),
                "selector ready"
            ),
            Err(e) => warn!(
                error = %e,
                "initial upstream load failed; serving 502 until a refresh succeeds"
            ),
        }
        let selector = Arc::new(SwappableSelector::new(selector));

        let tracker = Arc::new(UsageTracker::new(
            upstream_store.clone(),
            request_log.clone(),
        ));
        let engine = Arc::new(ForwardingEngine::new(
            selector.clone(),
            tracker,
            EngineConfig::from_rotation(&settings.rotation),
        ));

        let auth = Arc::new(ProxyAuth::new(&settings.authentication));
        let limiter = Arc::new(ClientRateLimiter::new(&settings.rate_limit));
        let rewriter = passthrough
            .as_ref()
            .map(PassthroughRewriter::new)
            .transpose()?
            .map(Arc::new);

        let router = RequestRouter {
            engine: engine.clone(),
            auth: auth.clone(),
            limiter: limiter.clone(),
            rewriter,
            selector: selector.clone(),
        };

        Ok(Self {
            config,
            router,
            selector,
            engine,
            auth,
            limiter,
            upstream_store,
            request_log,
            settings_store,
        })
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|_| {
                GyreError::InvalidConfig(format!(
                    "invalid listener address {}:{}",
                    self.config.host, self.config.port
                ))
            })?;

        let listener = TcpListener::bind(addr).await?;
        info!("proxy listener on {}", addr);

        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already-bound listener
    #[instrument(skip_all)]
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.spawn_background_tasks(shutdown.clone());

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, client_addr)) => {
                            let router = self.router.clone();
                            connections.spawn(async move {
                                if let Err(e) =
                                    handle_connection(stream, client_addr, router).await
                                {
                                    debug!(client = %client_addr, "connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            // Accept errors surface FD exhaustion back-pressure.
                            error!("accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("proxy server shutting down");
                        break;
                    }
                }
            }

            while connections.try_join_next().is_some() {}
        }

        drop(listener);

        // Drain in-flight connections within the configured deadline.
        let drain = Duration::from_secs(self.config.drain_secs);
        let draining = async {
            while connections.join_next().await.is_some() {}
        };
        if timeout(drain, draining).await.is_err() {
            warn!(
                remaining = connections.len(),
                "drain deadline reached, aborting remaining connections"
            );
            connections.shutdown().await;
        }

        Ok(())
    }

    /// Re-read settings and apply them: middleware in place, the selector by
    /// building and refreshing a replacement, then swapping atomically.
    pub async fn reload_settings(&self) -> Result<()> {
        let settings = self.settings_store.load().await?;

        self.auth.update_settings(&settings.authentication);
        self.limiter.update_settings(&settings.rate_limit);
        self.engine.update_config(&settings.rotation);

        let next = build_selector(
            self.upstream_store.clone(),
            self.request_log.clone(),
            &settings.rotation,
        );
        next.refresh().await?;
        self.selector.replace(next);

        info!(
            method = %self.selector.method(),
            count = self.selector.candidate_count(),
            "settings reloaded"
        );
        Ok(())
    }

    fn spawn_background_tasks(&self, shutdown: watch::Receiver<bool>) {
        let selector = self.selector.clone();
        let mut refresh_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = interval(REFRESH_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match selector.refresh().await {
                            Ok(()) => debug!(
                                count = selector.candidate_count(),
                                "candidate set refreshed"
                            ),
                            Err(e) => warn!(error = %e, "failed to refresh candidate set"),
                        }
                    }
                    changed = refresh_shutdown.changed() => {
                        if changed.is_err() || *refresh_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        let limiter = self.limiter.clone();
        let mut cleanup_shutdown = shutdown;
        tokio::spawn(async move {
            let mut ticker = interval(CLEANUP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        limiter.cleanup();
                        debug!(
                            clients = limiter.client_count(),
                            "cleaned up client limiter buckets"
                        );
                    }
                    changed = cleanup_shutdown.changed() => {
                        if changed.is_err() || *cleanup_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    #[cfg(test)]
    fn router(&self) -> RequestRouter {
        self.router.clone()
    }
}

async fn handle_connection(
    stream: TcpStream,
    client_addr: SocketAddr,
    router: RequestRouter,
) -> Result<()> {
    let io = TokioIo::new(stream);
    let client_ip = client_addr.ip().to_string();

    let service = service_fn(move |req| {
        let router = router.clone();
        let client_ip = client_ip.clone();
        async move { Ok::<_, Infallible>(router.route(req, &client_ip).await) }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await
        .map_err(|e| GyreError::Http(e.to_string()))?;

    Ok(())
}

/// Everything one connection needs to answer requests
#[derive(Clone)]
struct RequestRouter {
    engine: Arc<ForwardingEngine>,
    auth: Arc<ProxyAuth>,
    limiter: Arc<ClientRateLimiter>,
    rewriter: Option<Arc<PassthroughRewriter>>,
    selector: Arc<SwappableSelector>,
}

impl RequestRouter {
    async fn route<B>(&self, req: Request<B>, client_ip: &str) -> Response<ProxyBody>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        // Operational endpoint, answered without engaging the rotation path.
        if req.method() == Method::GET
            && req.uri().authority().is_none()
            && req.uri().path() == "/health"
        {
            return self.health_response();
        }

        // The passthrough prefix is public: no client authentication, but the
        // per-client limit still applies.
        if let Some(rewriter) = &self.rewriter {
            if rewriter.matches(req.uri().path()) {
                if let Err(e) = self.limiter.check(client_ip) {
                    return error_response(&e);
                }
                let rewritten = match rewriter.rewrite(req) {
                    Ok(rewritten) => rewritten,
                    Err(e) => return error_response(&e),
                };
                return self
                    .engine
                    .handle_http(rewritten)
                    .await
                    .unwrap_or_else(|e| error_response(&e));
            }
        }

        if let Err(e) = self.auth.validate(&req) {
            return error_response(&e);
        }
        if let Err(e) = self.limiter.check(client_ip) {
            return error_response(&e);
        }

        if req.method() == Method::CONNECT {
            self.engine
                .handle_connect(req)
                .await
                .unwrap_or_else(|e| error_response(&e))
        } else {
            self.engine
                .handle_http(req)
                .await
                .unwrap_or_else(|e| error_response(&e))
        }
    }

    fn health_response(&self) -> Response<ProxyBody> {
        let body = serde_json::json!({
            "status": "ok",
            "rotation": self.selector.method().as_str(),
            "upstreams": self.selector.candidate_count(),
        });

        Response::builder()
            .status(hyper::StatusCode::OK)
            .header(CONTENT_TYPE, "application/json")
            .body(full_body(body.to_string()))
            .unwrap()
    }
}

/// Map an error onto the client-facing response
fn error_response(err: &GyreError) -> Response<ProxyBody> {
    let status = err.status_code();
    let mut builder = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8");

    if let Some(retry_after) = err.retry_after_secs() {
        builder = builder.header(RETRY_AFTER, retry_after.to_string());
    }
    if matches!(err, GyreError::AuthenticationFailed) {
        builder = builder.header(PROXY_AUTHENTICATE, "Basic realm=\"proxy\"");
    }

    builder.body(full_body(err.to_string())).unwrap()
}
