//! The edge server — listeners, request pipeline, config snapshot plumbing
//!
//! Request path (reversed):
//!
//! ```text
//! Application backend
//! └── serve_request (mount resolving, HTTP→HTTPS redirect, IP filtering, prefix strip)
//!     └── handle_request (body buffering, metrics capture)
//!         ├── listener :443
//!         └── listener :80
//! ```
//!
//! A single supervisor task owns discovery polling and snapshot publishing;
//! request tasks only ever do one atomic load of the current table.

pub mod ip_filter;
pub mod metrics;
pub mod tls;

use crate::backend::{text_response, BackendFactory, HttpRequest, HttpResponse, RequestContext};
use crate::config::{Application, Backend, ConfigAccessor, Frontend};
use crate::discovery::Discovery;
use crate::error::{EdgeError, Result};
use crate::routing::RoutingTable;
use crate::turbocharger::manifest_handler::ManifestHandler;
use arc_swap::ArcSwap;
use bytes::Bytes;
use http::header::{HOST, LOCATION};
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use ip_filter::IpRules;
use metrics::EdgeMetrics;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tls::CertificateProvider;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Env var that synthesizes a metrics app at the given path
pub const METRICS_ENDPOINT_ENV: &str = "METRICS_ENDPOINT";

const DISCOVERY_READ_TIMEOUT: Duration = Duration::from_secs(15);
const SYNC_INTERVAL: Duration = Duration::from_secs(10);
/// Slowloris mitigation on all listeners
const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(60);

/// Sentinel timestamp for "never updated"
fn year2000() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(946_684_800)
}

/// The one live routing snapshot. Readers get a consistent table with a
/// single atomic load; only the sync supervisor stores.
pub struct AtomicConfig {
    inner: ArcSwap<RoutingTable>,
}

impl AtomicConfig {
    pub fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(RoutingTable::empty(year2000())),
        }
    }

    pub fn load(&self) -> Arc<RoutingTable> {
        self.inner.load_full()
    }

    pub fn store(&self, table: Arc<RoutingTable>) {
        self.inner.store(table);
    }
}

impl Default for AtomicConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigAccessor for AtomicConfig {
    fn apps(&self) -> Vec<Application> {
        self.load().apps().to_vec()
    }

    fn last_updated(&self) -> SystemTime {
        self.load().timestamp()
    }
}

/// Everything a request task needs, shared behind one Arc
struct SharedState {
    current_config: Arc<AtomicConfig>,
    metrics: Arc<EdgeMetrics>,
    ip_rules: IpRules,
}

pub struct ServeOptions {
    pub listen_http: Option<SocketAddr>,
    pub listen_https: Option<SocketAddr>,
    pub listen_metrics: Option<SocketAddr>,
    pub cert_provider: Option<Arc<dyn CertificateProvider>>,
    /// Root for per-app response caches and turbocharger tiers
    pub cache_root: PathBuf,
    pub ip_rules_file: PathBuf,
}

/// Run the edge router until a shutdown signal or a supervised task failure.
/// A task failure is returned as an error (the process should exit non-zero).
pub async fn serve(discovery: Arc<dyn Discovery>, options: ServeOptions) -> Result<()> {
    let metrics = Arc::new(EdgeMetrics::new());
    let current_config = Arc::new(AtomicConfig::new());

    let turbo = if crate::turbocharger::middleware_config_available() {
        let storage = crate::turbocharger::storage_from_config()?;
        Some(Arc::new(ManifestHandler::new(
            storage,
            &options.cache_root.join("turbocharger"),
        )?))
    } else {
        None
    };
    tracing::info!(activated = turbo.is_some(), "turbocharger middleware");

    let accessor: Arc<dyn ConfigAccessor> = current_config.clone();
    let mut factory = BackendFactory::new(accessor, metrics.clone(), turbo, options.cache_root.clone());

    // initial sync, so the listeners don't start by dealing out 404s.
    // failure is not fatal: we serve from the empty table and let the
    // periodic sync catch up.
    match sync_apps_from_discovery(discovery.as_ref(), &mut factory).await {
        Ok(table) => current_config.store(Arc::new(table)),
        Err(e) => tracing::error!(error = %e, "initial sync failed"),
    }

    let ip_rules = IpRules::load(&options.ip_rules_file)?;

    let state = Arc::new(SharedState {
        current_config: current_config.clone(),
        metrics: metrics.clone(),
        ip_rules,
    });

    let (config_tx, mut config_rx) = mpsc::channel::<Arc<RoutingTable>>(1);

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    if let Some(addr) = options.listen_http {
        tasks.spawn(run_listener(addr, None, state.clone()));
    }

    if let Some(addr) = options.listen_https {
        let provider = options.cert_provider.clone().ok_or_else(|| {
            EdgeError::Tls("HTTPS listener requires a certificate provider".to_string())
        })?;
        let acceptor = tls::build_tls_acceptor(provider);
        tasks.spawn(run_listener(addr, Some(acceptor), state.clone()));
    }

    if let Some(addr) = options.listen_metrics {
        tasks.spawn(run_metrics_listener(addr, metrics.clone()));
    }

    tasks.spawn(scheduled_sync(discovery, factory, config_tx));

    loop {
        tokio::select! {
            Some(finished) = tasks.join_next() => {
                return match finished {
                    Ok(Ok(())) => Err(EdgeError::Other("supervised task exited unexpectedly".to_string())),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(EdgeError::Other(format!("supervised task panicked: {}", e))),
                };
            }
            Some(table) = config_rx.recv() => {
                state.current_config.store(table);
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                tasks.shutdown().await;
                return Ok(());
            }
        }
    }
}

/// One discovery read + table build
async fn sync_apps_from_discovery(
    discovery: &dyn Discovery,
    factory: &mut BackendFactory,
) -> Result<RoutingTable> {
    let mut apps = tokio::time::timeout(DISCOVERY_READ_TIMEOUT, discovery.read_applications())
        .await
        .map_err(|_| EdgeError::Discovery("read_applications timed out".to_string()))??;

    // Prometheus autodiscovers targets by IP, so the metrics app is
    // hostname-independent; the random-looking path doubles as an auth
    // token in the URL
    if let Ok(endpoint) = std::env::var(METRICS_ENDPOINT_ENV) {
        if !endpoint.is_empty() {
            apps.push(Application::simple(
                "prom-metrics",
                Frontend::path_prefix(endpoint).with_allow_insecure_http(),
                Backend::prom_metrics(),
            ));
        }
    }

    tracing::info!(apps = apps.len(), "discovered app(s)");

    RoutingTable::build(apps, factory, SystemTime::now())
}

/// Periodic re-sync. Offers snapshots non-blockingly: if the supervisor went
/// away, blocking here would wedge the loop forever, so full-channel
/// snapshots are logged and dropped.
async fn scheduled_sync(
    discovery: Arc<dyn Discovery>,
    mut factory: BackendFactory,
    config_updated: mpsc::Sender<Arc<RoutingTable>>,
) -> Result<()> {
    let mut ticker = tokio::time::interval(SYNC_INTERVAL);
    ticker.tick().await; // the immediate first tick; initial sync already ran

    loop {
        ticker.tick().await;

        match sync_apps_from_discovery(discovery.as_ref(), &mut factory).await {
            Ok(table) => {
                if config_updated.try_send(Arc::new(table)).is_err() {
                    tracing::error!("config_updated channel full; dropping snapshot");
                }
            }
            Err(e) => {
                // previous snapshot stays in place; retry on next tick
                tracing::error!(error = %e, "sync_apps_from_discovery");
            }
        }
    }
}

async fn run_listener(
    addr: SocketAddr,
    acceptor: Option<tokio_rustls::TlsAcceptor>,
    state: Arc<SharedState>,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| EdgeError::Other(format!("bind {}: {}", addr, e)))?;

    tracing::info!(address = %addr, tls = acceptor.is_some(), "listener started");

    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!(error = %e, "accept failed");
                continue;
            }
        };

        let state = state.clone();
        let acceptor = acceptor.clone();

        tokio::spawn(async move {
            match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        let io = TokioIo::new(tls_stream);
                        let _ = http1::Builder::new()
                            .timer(TokioTimer::new())
                            .header_read_timeout(READ_HEADER_TIMEOUT)
                            .serve_connection(
                                io,
                                service_fn(move |req| {
                                    handle_request(req, remote, true, state.clone())
                                }),
                            )
                            .with_upgrades()
                            .await;
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "TLS handshake failed");
                    }
                },
                None => {
                    let io = TokioIo::new(stream);
                    let _ = http1::Builder::new()
                        .timer(TokioTimer::new())
                        .header_read_timeout(READ_HEADER_TIMEOUT)
                        .serve_connection(
                            io,
                            service_fn(move |req| handle_request(req, remote, false, state.clone())),
                        )
                        .with_upgrades()
                        .await;
                }
            }
        });
    }
}

/// Standalone metrics listener (`/metrics`)
async fn run_metrics_listener(addr: SocketAddr, metrics: Arc<EdgeMetrics>) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| EdgeError::Other(format!("bind {}: {}", addr, e)))?;

    tracing::info!(address = %addr, "metrics listener started");

    loop {
        let (stream, _remote) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!(error = %e, "accept failed");
                continue;
            }
        };

        let metrics = metrics.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let _ = http1::Builder::new()
                .timer(TokioTimer::new())
                .header_read_timeout(READ_HEADER_TIMEOUT)
                .serve_connection(
                    io,
                    service_fn(move |req: hyper::Request<Incoming>| {
                        let metrics = metrics.clone();
                        async move {
                            let response = if req.uri().path() == "/metrics" {
                                http::Response::builder()
                                    .status(StatusCode::OK)
                                    .header(http::header::CONTENT_TYPE, "text/plain; version=0.0.4")
                                    .body(Full::new(Bytes::from(metrics.render_prometheus())))
                                    .expect("static response")
                            } else {
                                text_response(StatusCode::NOT_FOUND, "404 page not found")
                            };
                            Ok::<_, hyper::Error>(response)
                        }
                    }),
                )
                .await;
        });
    }
}

/// Shared handler for both HTTPS and HTTP: buffers the body, dispatches,
/// and captures metrics by observing the final response — it never
/// interposes on the body path.
async fn handle_request(
    req: hyper::Request<Incoming>,
    remote: SocketAddr,
    secure: bool,
    state: Arc<SharedState>,
) -> std::result::Result<HttpResponse, hyper::Error> {
    let (parts, body) = req.into_parts();

    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    };

    let req = http::Request::from_parts(parts, body_bytes);
    let method = req.method().as_str().to_string();

    let started = Instant::now();
    let (response, app_id) = serve_request(req, remote, secure, &state).await;

    state.metrics.record_request(
        app_id.as_deref().unwrap_or("appNotFound"),
        response.status().as_u16(),
        &method,
        started.elapsed().as_secs_f64(),
    );

    Ok(response)
}

/// Resolve and dispatch one request. Returns the app id that matched (the
/// request may still have been blocked by HTTPS-only or IP rules).
async fn serve_request(
    req: HttpRequest,
    remote: SocketAddr,
    secure: bool,
    state: &SharedState,
) -> (HttpResponse, Option<String>) {
    let host_header = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()));

    let Some(host_header) = host_header else {
        return (
            text_response(StatusCode::BAD_REQUEST, "failed to parse hostname header: missing"),
            None,
        );
    };

    let hostname = match split_host_port(&host_header) {
        Ok((hostname, _port)) => hostname,
        Err(e) => {
            return (
                text_response(
                    StatusCode::BAD_REQUEST,
                    &format!("failed to parse hostname header: {}", e),
                ),
                None,
            );
        }
    };

    // latest config, one atomic load
    let table = state.current_config.load();

    let Some(mount) = table.resolve(&hostname, req.uri().path()) else {
        return (
            text_response(
                StatusCode::NOT_FOUND,
                &format!("no website for hostname: {}", hostname),
            ),
            None,
        );
    };

    let app_id = mount.app.id.clone();

    // important that this is done before prefix stripping
    if !secure && !mount.allow_insecure_http {
        return (redirect_to_https(&host_header, req.uri()), Some(app_id));
    }

    // TODO: respect x-forwarded-for, but only when configured as trusted
    if let Err(reason) = state.ip_rules.check(remote.ip(), &app_id) {
        return (text_response(StatusCode::FORBIDDEN, &reason), Some(app_id));
    }

    let req = if mount.strip_prefix {
        strip_mount_prefix(req, &mount.prefix)
    } else {
        req
    };

    let ctx = RequestContext {
        client_ip: remote.ip(),
        secure,
    };

    let response = mount.backend.handle(req, &ctx).await;

    (response, Some(app_id))
}

/// `net::SplitHostPort` semantics, but tolerating a missing port
fn split_host_port(host_header: &str) -> Result<(String, String)> {
    // bracketed IPv6: "[::1]:443" or "[::1]"
    if let Some(rest) = host_header.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| EdgeError::Client(format!("unclosed bracket in host: {}", host_header)))?;
        let port = after.strip_prefix(':').unwrap_or("");
        return Ok((host.to_string(), port.to_string()));
    }

    match host_header.rsplit_once(':') {
        // more than one colon without brackets means a bare IPv6 address
        Some((host, _)) if host.contains(':') => Ok((host_header.to_string(), String::new())),
        Some((host, port)) => Ok((host.to_string(), port.to_string())),
        None => Ok((host_header.to_string(), String::new())),
    }
}

/// Come back when you have TLS
fn redirect_to_https(host: &str, uri: &http::Uri) -> HttpResponse {
    let mut target = format!("https://{}{}", host, uri.path());
    if let Some(query) = uri.query() {
        target.push('?');
        target.push_str(query);
    }

    http::Response::builder()
        .status(StatusCode::TEMPORARY_REDIRECT)
        .header(LOCATION, target)
        .body(Full::new(Bytes::new()))
        .expect("static response")
}

/// path=/files/foobar.txt stripPrefix=/files/ => "/foobar.txt"
fn strip_mount_prefix(req: HttpRequest, prefix: &str) -> HttpRequest {
    let (mut parts, body) = req.into_parts();

    let path = parts.uri.path().to_string();
    let rest = path
        .strip_prefix(prefix)
        .or_else(|| path.strip_prefix(prefix.trim_end_matches('/')))
        .unwrap_or(&path);

    let new_path = if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{}", rest)
    };

    let path_and_query = match parts.uri.query() {
        Some(query) => format!("{}?{}", new_path, query),
        None => new_path,
    };

    if let Ok(uri) = path_and_query.parse() {
        parts.uri = uri;
    }

    http::Request::from_parts(parts, body)
}
