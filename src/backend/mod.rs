//! Backend handlers — materialization and composition
//!
//! A [`Handler`] produces a response once a request has been routed. The
//! [`BackendFactory`] turns backend configs into handler instances and keeps
//! one cache entry per app, keyed by config fingerprint, so reloads reuse
//! handlers (and their outbound connection pools / disk-cache handles)
//! whenever the config hasn't changed.

mod admin;
mod auth;
mod prom_metrics;
mod redirect;
mod response_cache;
mod reverse_proxy;
mod static_site;

pub use admin::AdminBackend;
pub use auth::AuthBackend;
pub use prom_metrics::PromMetricsBackend;
pub use redirect::RedirectBackend;
pub use response_cache::ResponseCache;
pub use reverse_proxy::ReverseProxyBackend;
pub use static_site::StaticSiteBackend;

use crate::config::{
    Backend, BackendKind, BackendOptsReverseProxy, BackendOptsS3StaticWebsite, ConfigAccessor,
};
use crate::error::{EdgeError, Result};
use crate::server::metrics::EdgeMetrics;
use crate::turbocharger::manifest_handler::ManifestHandler;
use crate::turbocharger::middleware::TurboMiddleware;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::StatusCode;
use http_body_util::Full;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Buffered request as it flows through the pipeline
pub type HttpRequest = http::Request<Bytes>;
/// Response with a buffered body
pub type HttpResponse = http::Response<Full<Bytes>>;

/// Per-request context the pipeline established before dispatch
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub client_ip: std::net::IpAddr,
    /// Whether the request arrived over TLS
    pub secure: bool,
}

/// A routed request handler. Handlers write a response exactly once; failures
/// they can't express as a response are logged, not propagated.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: HttpRequest, ctx: &RequestContext) -> HttpResponse;
}

impl std::fmt::Debug for dyn Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Handler")
    }
}

/// Plain-text response, the way the pipeline reports its own errors
pub fn text_response(status: StatusCode, message: &str) -> HttpResponse {
    http::Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(message.to_string())))
        .expect("static response")
}

pub fn empty_response(status: StatusCode) -> HttpResponse {
    http::Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .expect("static response")
}

struct CacheEntry {
    fingerprint: Vec<u8>,
    handler: Arc<dyn Handler>,
}

/// Materializes handlers from backend configs.
///
/// At most one entry per app id: when a rebuild sees a changed fingerprint
/// the old handler drops out of the cache, so its owned resources become
/// collectible as soon as the routing table is swapped. Only the sync
/// supervisor calls this (single-threaded), so no locking.
pub struct BackendFactory {
    accessor: Arc<dyn ConfigAccessor>,
    metrics: Arc<EdgeMetrics>,
    /// Shared manifest handler when TURBOCHARGER_STORE is configured
    turbo: Option<Arc<ManifestHandler>>,
    /// Root for per-app reverse-proxy response caches
    cache_root: PathBuf,
    per_app: HashMap<String, CacheEntry>,
}

impl BackendFactory {
    pub fn new(
        accessor: Arc<dyn ConfigAccessor>,
        metrics: Arc<EdgeMetrics>,
        turbo: Option<Arc<ManifestHandler>>,
        cache_root: PathBuf,
    ) -> Self {
        Self {
            accessor,
            metrics,
            turbo,
            cache_root,
            per_app: HashMap::new(),
        }
    }

    pub fn make_backend(&mut self, app_id: &str, backend: &Backend) -> Result<Arc<dyn Handler>> {
        let fingerprint = backend.fingerprint()?;

        if let Some(entry) = self.per_app.get(app_id) {
            if entry.fingerprint == fingerprint {
                return Ok(entry.handler.clone());
            }
        }

        let handler = self.make_backend_internal(app_id, backend)?;
        self.per_app.insert(
            app_id.to_string(),
            CacheEntry {
                fingerprint,
                handler: handler.clone(),
            },
        );

        Ok(handler)
    }

    fn make_backend_internal(&self, app_id: &str, backend: &Backend) -> Result<Arc<dyn Handler>> {
        match backend.kind {
            BackendKind::ReverseProxy => {
                let opts = required(&backend.reverse_proxy_opts, backend.kind)?;
                let proxy: Arc<dyn Handler> =
                    Arc::new(ReverseProxyBackend::new(app_id, opts.clone(), &self.cache_root)?);

                // origins get the chance to opt subtrees into CAS serving
                Ok(match &self.turbo {
                    Some(manifest_handler) => {
                        Arc::new(TurboMiddleware::new(proxy, manifest_handler.clone()))
                    }
                    None => proxy,
                })
            }
            BackendKind::S3StaticWebsite => {
                let opts = required(&backend.s3_static_website_opts, backend.kind)?;
                let proxy_opts = s3_website_as_reverse_proxy(app_id, opts);
                Ok(Arc::new(ReverseProxyBackend::new(
                    app_id,
                    proxy_opts,
                    &self.cache_root,
                )?))
            }
            BackendKind::Redirect => {
                let opts = required(&backend.redirect_opts, backend.kind)?;
                Ok(Arc::new(RedirectBackend::new(&opts.to)))
            }
            BackendKind::AuthV0 => {
                let opts = required(&backend.auth_v0_opts, backend.kind)?;
                let authorized = self
                    .make_backend_internal(app_id, &opts.authorized_backend)
                    .map_err(|e| EdgeError::Config(format!("authorized_backend: {}", e)))?;
                Ok(Arc::new(AuthBackend::new(&opts.bearer_token, authorized)))
            }
            BackendKind::EdgerouterAdmin => Ok(Arc::new(AdminBackend::new(self.accessor.clone()))),
            BackendKind::PromMetrics => Ok(Arc::new(PromMetricsBackend::new(self.metrics.clone()))),
            BackendKind::Turbocharger => {
                let opts = required(&backend.turbocharger_opts, backend.kind)?;
                let manifest_handler = self.turbo.clone().ok_or_else(|| {
                    EdgeError::Config(format!(
                        "turbocharger backend requires {} to be configured",
                        crate::turbocharger::STORE_ENV
                    ))
                })?;
                Ok(Arc::new(StaticSiteBackend::new(opts.manifest, manifest_handler)))
            }
            BackendKind::AwsLambda | BackendKind::AuthSso => Err(EdgeError::Config(format!(
                "backend kind {} requires an external integration not present in this build",
                backend.kind
            ))),
        }
    }
}

fn required<'a, T>(opts: &'a Option<T>, kind: BackendKind) -> Result<&'a T> {
    opts.as_ref()
        .ok_or_else(|| EdgeError::Config(format!("backend kind {} is missing its options payload", kind)))
}

/// The deprecated S3-website kind is a reverse proxy in disguise: proxy the
/// versioned bucket prefix with response caching, directory index documents
/// and query-string stripping.
fn s3_website_as_reverse_proxy(
    app_id: &str,
    opts: &BackendOptsS3StaticWebsite,
) -> BackendOptsReverseProxy {
    let origin = format!(
        "https://s3.{}.amazonaws.com/{}/sites/{}/{}",
        opts.region_id, opts.bucket_name, app_id, opts.deployed_version
    );

    BackendOptsReverseProxy {
        origins: vec![origin],
        tls_config: None,
        caching: true,
        pass_host_header: false,
        index_document: "index.html".to_string(),
        remove_query_string: true,
        headers_to_origin: std::collections::BTreeMap::new(),
    }
}

#[cfg(test)]
pub(crate) fn factory_for_tests() -> BackendFactory {
    use std::time::SystemTime;

    struct NullAccessor;
    impl ConfigAccessor for NullAccessor {
        fn apps(&self) -> Vec<crate::config::Application> {
            Vec::new()
        }
        fn last_updated(&self) -> SystemTime {
            SystemTime::UNIX_EPOCH
        }
    }

    BackendFactory::new(
        Arc::new(NullAccessor),
        Arc::new(EdgeMetrics::new()),
        None,
        std::env::temp_dir().join("trellis-test-cache"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backend;

    // --- Factory cache idempotence ---

    #[test]
    fn test_same_config_reuses_handler_instance() {
        let mut factory = factory_for_tests();
        let backend = Backend::redirect("https://example.com/");

        let first = factory.make_backend("app", &backend).unwrap();
        let second = factory.make_backend("app", &backend).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_changed_config_rebuilds_handler() {
        let mut factory = factory_for_tests();

        let first = factory
            .make_backend("app", &Backend::redirect("https://example.com/"))
            .unwrap();
        let second = factory
            .make_backend("app", &Backend::redirect("https://example.org/"))
            .unwrap();

        assert!(!Arc::ptr_eq(&first, &second));

        // the cache now only references the new instance
        let third = factory
            .make_backend("app", &Backend::redirect("https://example.org/"))
            .unwrap();
        assert!(Arc::ptr_eq(&second, &third));
    }

    #[test]
    fn test_cache_is_per_app_id() {
        let mut factory = factory_for_tests();
        let backend = Backend::redirect("https://example.com/");

        let a = factory.make_backend("app-a", &backend).unwrap();
        let b = factory.make_backend("app-b", &backend).unwrap();

        // same config but different apps get their own instances
        assert!(!Arc::ptr_eq(&a, &b));
    }

    // --- Kind dispatch ---

    #[test]
    fn test_auth_wraps_inner_backend() {
        let mut factory = factory_for_tests();
        let backend = Backend::auth_v0("token", Backend::redirect("https://example.com/"));
        assert!(factory.make_backend("authed", &backend).is_ok());
    }

    #[test]
    fn test_turbocharger_requires_store_config() {
        let mut factory = factory_for_tests(); // no store configured
        let backend = Backend::turbocharger(crate::turbocharger::ObjectId::from_content(b"m"));
        let err = factory.make_backend("site", &backend).unwrap_err();
        assert!(err.to_string().contains("TURBOCHARGER_STORE"));
    }

    #[test]
    fn test_external_integration_kinds_fail_build() {
        let mut factory = factory_for_tests();

        let mut lambda = Backend::redirect("ignored");
        lambda.kind = BackendKind::AwsLambda;
        lambda.aws_lambda_opts = Some(crate::config::BackendOptsAwsLambda {
            function_name: "fn".into(),
            region_id: "eu-central-1".into(),
        });

        let err = factory.make_backend("lambda", &lambda).unwrap_err();
        assert!(err.to_string().contains("external integration"));
    }

    #[test]
    fn test_s3_website_delegation() {
        let opts = BackendOptsS3StaticWebsite {
            bucket_name: "myorg-websites".into(),
            region_id: "us-east-1".into(),
            deployed_version: "2023-01-11".into(),
            not_found_page: String::new(),
        };

        let proxy_opts = s3_website_as_reverse_proxy("joonasfi-blog", &opts);
        assert_eq!(
            proxy_opts.origins,
            vec!["https://s3.us-east-1.amazonaws.com/myorg-websites/sites/joonasfi-blog/2023-01-11"]
        );
        assert!(proxy_opts.caching);
        assert!(proxy_opts.remove_query_string);
        assert_eq!(proxy_opts.index_document, "index.html");
    }

    // --- Response helpers ---

    #[test]
    fn test_text_response() {
        let response = text_response(StatusCode::NOT_FOUND, "no website for hostname: x");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
    }

    #[test]
    fn test_empty_response() {
        let response = empty_response(StatusCode::NOT_MODIFIED);
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    }
}
