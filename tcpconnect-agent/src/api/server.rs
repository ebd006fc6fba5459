//! HTTP listener setup and lifecycle.
//!
//! The agent exposes two independent listeners: one for Prometheus scrapes
//! and one for orchestrator probes. [`ExposureCoordinator`] starts them
//! together and drains them against a single shared deadline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::Request;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{Span, debug, error, info, warn};

use crate::api::routes;
use crate::metrics::{HealthState, MetricsRegistry};

/// Default metrics listener address.
pub const DEFAULT_METRICS_ADDRESS: &str = "0.0.0.0:9090";
/// Default health listener address.
pub const DEFAULT_HEALTH_ADDRESS: &str = "0.0.0.0:8080";

/// Grace given to an already-started listener when its sibling fails to bind.
const BIND_ROLLBACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Bound on tearing down connections once the deadline has passed.
const FORCE_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Probe paths hit every few seconds by the orchestrator; never traced.
const UNTRACED_PATHS: [&str; 2] = ["/readiness", "/liveness"];

/// Errors from the HTTP listeners.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("{listener} listener failed to bind {address}: {source}")]
    Bind {
        listener: &'static str,
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{listener} listener already started")]
    AlreadyStarted { listener: &'static str },

    #[error("{listener} listener did not drain before the shutdown deadline")]
    ShutdownTimeout { listener: &'static str },

    #[error("{listener} listener task failed: {source}")]
    Join {
        listener: &'static str,
        #[source]
        source: JoinError,
    },
}

/// Listener addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Metrics listener bind address
    pub metrics_address: String,
    /// Health listener bind address
    pub health_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            metrics_address: DEFAULT_METRICS_ADDRESS.to_string(),
            health_address: DEFAULT_HEALTH_ADDRESS.to_string(),
        }
    }
}

/// Lifecycle of a single listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

/// One named HTTP listener with its own serve task.
pub struct HttpListener {
    name: &'static str,
    address: String,
    router: Mutex<Option<Router>>,
    state: Mutex<ListenerState>,
    cancel_token: CancellationToken,
    force_close: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl HttpListener {
    /// Create a listener; nothing is bound until [`start`](Self::start).
    pub fn new(name: &'static str, address: impl Into<String>, router: Router) -> Self {
        Self {
            name,
            address: address.into(),
            router: Mutex::new(Some(with_tracing(router))),
            state: Mutex::new(ListenerState::Created),
            cancel_token: CancellationToken::new(),
            force_close: CancellationToken::new(),
            task: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> ListenerState {
        *self.state.lock()
    }

    /// Address actually bound, available once running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Bind the socket and spawn the accept loop.
    ///
    /// Returns as soon as the socket is bound. Accept and connection errors
    /// after this point are only logged.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let Some(router) = self.router.lock().take() else {
            return Err(ServerError::AlreadyStarted {
                listener: self.name,
            });
        };

        let bind_error = |source| ServerError::Bind {
            listener: self.name,
            address: self.address.clone(),
            source,
        };

        let listener = TcpListener::bind(self.address.as_str())
            .await
            .map_err(bind_error)?;
        let addr = listener.local_addr().map_err(bind_error)?;

        *self.local_addr.lock() = Some(addr);
        *self.state.lock() = ListenerState::Running;

        info!(listener = self.name, "Listening on http://{}", addr);

        let handle = tokio::spawn(serve_connections(
            self.name,
            listener,
            router,
            self.cancel_token.clone(),
            self.force_close.clone(),
        ));
        *self.task.lock() = Some(handle);

        Ok(addr)
    }

    /// Stop accepting connections and wait for in-flight requests until
    /// `deadline`.
    ///
    /// A listener that misses the deadline has every open connection
    /// aborted before this returns, so no handler outlives the call. The
    /// listener is `Stopped` afterwards in every case.
    pub async fn shutdown_by(&self, deadline: Instant) -> Result<(), ServerError> {
        {
            let mut state = self.state.lock();
            match *state {
                ListenerState::Stopped => return Ok(()),
                ListenerState::Created => {
                    self.router.lock().take();
                    *state = ListenerState::Stopped;
                    return Ok(());
                }
                ListenerState::Running | ListenerState::ShuttingDown => {
                    *state = ListenerState::ShuttingDown;
                }
            }
        }

        self.cancel_token.cancel();

        let task = self.task.lock().take();
        let result = match task {
            Some(mut handle) => match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(source)) => Err(ServerError::Join {
                    listener: self.name,
                    source,
                }),
                Err(_) => {
                    warn!(
                        listener = self.name,
                        "Shutdown deadline exceeded, closing open connections"
                    );
                    self.force_close.cancel();
                    if tokio::time::timeout(FORCE_CLOSE_TIMEOUT, &mut handle)
                        .await
                        .is_err()
                    {
                        handle.abort();
                        let _ = handle.await;
                    }
                    Err(ServerError::ShutdownTimeout {
                        listener: self.name,
                    })
                }
            },
            None => Ok(()),
        };

        *self.state.lock() = ListenerState::Stopped;
        if result.is_ok() {
            info!(listener = self.name, "Listener stopped");
        }
        result
    }
}

/// Accept loop owning every connection task.
///
/// `shutdown` stops accepting and asks open connections to finish their
/// current request. `force_close` aborts whatever is still running; the
/// loop returns only once every connection task is gone.
async fn serve_connections(
    name: &'static str,
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
    force_close: CancellationToken,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(listener = name, %peer, "Accepted connection");
                    connections.spawn(serve_connection(
                        name,
                        stream,
                        router.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!(listener = name, error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                log_connection_exit(name, joined);
            }
        }
    }

    drop(listener);
    debug!(
        listener = name,
        open = connections.len(),
        "Listener shutting down..."
    );

    loop {
        tokio::select! {
            _ = force_close.cancelled() => {
                connections.abort_all();
                while connections.join_next().await.is_some() {}
                break;
            }
            joined = connections.join_next() => match joined {
                Some(joined) => log_connection_exit(name, joined),
                None => break,
            },
        }
    }
}

/// Serve one HTTP/1 connection until it closes or shutdown is requested,
/// then let the in-flight request finish.
async fn serve_connection(
    name: &'static str,
    stream: TcpStream,
    router: Router,
    shutdown: CancellationToken,
) {
    let conn = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), TowerToHyperService::new(router));
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(e) = result {
        debug!(listener = name, error = %e, "Connection closed with error");
    }
}

fn log_connection_exit(name: &'static str, joined: Result<(), JoinError>) {
    if let Err(e) = joined
        && e.is_panic()
    {
        error!(listener = name, error = %e, "Connection task panicked");
    }
}

/// Attach the request trace layer, skipping probe paths.
fn with_tracing(router: Router) -> Router {
    router.layer(
        TraceLayer::new_for_http()
            .make_span_with(|req: &Request| {
                if UNTRACED_PATHS.contains(&req.uri().path()) {
                    Span::none()
                } else {
                    let mut make_span =
                        tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::DEBUG);
                    use tower_http::trace::MakeSpan;
                    make_span.make_span(req)
                }
            })
            .on_request(|req: &Request, span: &Span| {
                if span.is_disabled() {
                    return;
                }
                let mut on_request =
                    tower_http::trace::DefaultOnRequest::new().level(tracing::Level::DEBUG);
                use tower_http::trace::OnRequest;
                on_request.on_request(req, span);
            })
            .on_response(
                |res: &axum::http::Response<_>, latency: Duration, span: &Span| {
                    if span.is_disabled() {
                        return;
                    }
                    let on_response =
                        tower_http::trace::DefaultOnResponse::new().level(tracing::Level::DEBUG);
                    use tower_http::trace::OnResponse;
                    on_response.on_response(res, latency, span);
                },
            )
            .on_failure(
                |class: tower_http::classify::ServerErrorsFailureClass,
                 latency: Duration,
                 span: &Span| {
                    if span.is_disabled() {
                        return;
                    }
                    let mut on_failure =
                        tower_http::trace::DefaultOnFailure::new().level(tracing::Level::ERROR);
                    use tower_http::trace::OnFailure;
                    on_failure.on_failure(class, latency, span);
                },
            ),
    )
}

/// Owns the metrics and health listeners.
pub struct ExposureCoordinator {
    metrics: HttpListener,
    health: HttpListener,
}

impl ExposureCoordinator {
    /// Build both listeners from the shared registry and health state.
    pub fn new(
        config: &ServerConfig,
        registry: Arc<MetricsRegistry>,
        health: Arc<HealthState>,
    ) -> Self {
        Self::from_listeners(
            HttpListener::new(
                "metrics",
                config.metrics_address.clone(),
                routes::create_metrics_router(registry),
            ),
            HttpListener::new(
                "health",
                config.health_address.clone(),
                routes::create_health_router(health),
            ),
        )
    }

    pub fn from_listeners(metrics: HttpListener, health: HttpListener) -> Self {
        Self { metrics, health }
    }

    /// Bind both listeners concurrently and spawn their serve loops.
    ///
    /// If either bind fails the other listener is stopped again and the
    /// bind error is returned.
    pub async fn start(&self) -> Result<(), ServerError> {
        let (metrics, health) = tokio::join!(self.metrics.start(), self.health.start());

        match (metrics, health) {
            (Ok(_), Ok(_)) => Ok(()),
            (Err(e), _) | (_, Err(e)) => {
                let deadline = Instant::now() + BIND_ROLLBACK_TIMEOUT;
                let (m, h) = tokio::join!(
                    self.metrics.shutdown_by(deadline),
                    self.health.shutdown_by(deadline)
                );
                if let Err(rollback) = m.and(h) {
                    warn!(error = %rollback, "Failed to stop listener after bind failure");
                }
                Err(e)
            }
        }
    }

    /// Drain both listeners concurrently against one deadline.
    ///
    /// Both listeners are always awaited; the first error is returned.
    pub async fn shutdown(&self, deadline: Instant) -> Result<(), ServerError> {
        let (metrics, health) = tokio::join!(
            self.metrics.shutdown_by(deadline),
            self.health.shutdown_by(deadline)
        );
        metrics.and(health)
    }

    /// `(metrics, health)` listener states.
    pub fn states(&self) -> (ListenerState, ListenerState) {
        (self.metrics.state(), self.health.state())
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics.local_addr()
    }

    pub fn health_addr(&self) -> Option<SocketAddr> {
        self.health.local_addr()
    }
}
