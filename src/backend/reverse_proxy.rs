//! Reverse proxy backend — the workhorse behind most app kinds
//!
//! Forwards traffic to a set of origins, picking one uniformly at random per
//! request. Handles the outbound rewrites (scheme/host/path, index document,
//! query stripping, forced headers), optional outbound-TLS overrides and an
//! optional per-app disk response cache.

use super::response_cache::ResponseCache;
use super::{text_response, Handler, HttpRequest, HttpResponse, RequestContext};
use crate::config::BackendOptsReverseProxy;
use crate::error::{EdgeError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HOST, IF_NONE_MATCH};
use http::{Method, StatusCode};
use http_body_util::Full;
use rand::Rng;
use reqwest::Url;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

pub struct ReverseProxyBackend {
    origins: Vec<Url>,
    client: reqwest::Client,
    cache: Option<ResponseCache>,
    opts: BackendOptsReverseProxy,
}

impl ReverseProxyBackend {
    pub fn new(app_id: &str, opts: BackendOptsReverseProxy, cache_root: &Path) -> Result<Self> {
        let mut origins = parse_origin_urls(&opts.origins)?;

        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(100);

        if let Some(tls) = &opts.tls_config {
            if tls.insecure_skip_verify {
                builder = builder.danger_accept_invalid_certs(true);
            }

            // server-name override: connect to the configured IP but speak
            // TLS (SNI + cert verification) under the given name
            if !tls.server_name.is_empty() {
                for origin in &mut origins {
                    let Some(ip) = origin.host_str().and_then(|h| h.parse::<IpAddr>().ok()) else {
                        continue;
                    };
                    let port = origin.port_or_known_default().unwrap_or(443);
                    builder = builder.resolve(&tls.server_name, SocketAddr::new(ip, port));
                    origin
                        .set_host(Some(&tls.server_name))
                        .map_err(|e| EdgeError::Config(format!("server_name: {}", e)))?;
                }
            }
        }

        let client = builder
            .build()
            .map_err(|e| EdgeError::Config(format!("reverse proxy client: {}", e)))?;

        let cache = if opts.caching {
            Some(ResponseCache::new(&cache_root.join(app_id))?)
        } else {
            None
        };

        Ok(Self {
            origins,
            client,
            cache,
            opts,
        })
    }

    async fn forward(&self, req: HttpRequest) -> Result<HttpResponse> {
        let origin = &self.origins[rand::thread_rng().gen_range(0..self.origins.len())];
        let url = build_outbound_url(origin, &req, &self.opts)?;
        let url_str = url.as_str().to_string();

        // response cache applies to plain GETs only; conditional requests
        // are the client's business, not ours to answer from disk
        let client_conditional = req.headers().contains_key(IF_NONE_MATCH);
        let use_cache = self.cache.is_some() && req.method() == Method::GET && !client_conditional;

        let mut stale = None;
        if use_cache {
            let cache = self.cache.as_ref().expect("checked above");
            if let Some(entry) = cache.lookup(&url_str).await {
                if entry.is_fresh(unix_now()) {
                    return cached_entry_response(&entry);
                }
                stale = Some(entry);
            }
        }

        let mut outbound = self.client.request(req.method().clone(), url);

        for (key, value) in req.headers() {
            if is_hop_by_hop(key.as_str()) || key == HOST {
                continue;
            }
            outbound = outbound.header(key.clone(), value.clone());
        }

        // sometimes the origin should see the hostname from the browser's
        // address bar; otherwise reqwest derives Host from the URL
        if self.opts.pass_host_header {
            if let Some(host) = req.headers().get(HOST) {
                outbound = outbound.header(HOST, host.clone());
            }
        }

        for (key, value) in &self.opts.headers_to_origin {
            outbound = outbound.header(key.as_str(), value.as_str());
        }

        if let Some(entry) = &stale {
            if let Some(etag) = &entry.etag {
                outbound = outbound.header(IF_NONE_MATCH, etag.as_str());
            }
        }

        let response = outbound.body(req.into_body()).send().await?;

        let status = response.status();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter(|(key, _)| !is_hop_by_hop(key.as_str()))
            .filter_map(|(key, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (key.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?;

        if let (Some(cache), Some(entry)) = (&self.cache, &stale) {
            if status == StatusCode::NOT_MODIFIED {
                cache.refresh(&url_str).await;
                return cached_entry_response(entry);
            }
        }

        if use_cache && status == StatusCode::OK {
            let cache = self.cache.as_ref().expect("checked above");
            cache.maybe_store(&url_str, status.as_u16(), &headers, &body).await;
        }

        let mut builder = http::Response::builder().status(status);
        for (key, value) in &headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        builder
            .body(Full::new(body))
            .map_err(|e| EdgeError::Other(e.to_string()))
    }
}

#[async_trait]
impl Handler for ReverseProxyBackend {
    async fn handle(&self, req: HttpRequest, _ctx: &RequestContext) -> HttpResponse {
        match self.forward(req).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, "proxy error");
                text_response(StatusCode::BAD_GATEWAY, &format!("bad gateway: {}", e))
            }
        }
    }
}

fn parse_origin_urls(origins: &[String]) -> Result<Vec<Url>> {
    if origins.is_empty() {
        return Err(EdgeError::Config("empty origin list".to_string()));
    }

    origins
        .iter()
        .map(|raw| {
            Url::parse(raw).map_err(|e| EdgeError::Config(format!("origin {}: {}", raw, e)))
        })
        .collect()
}

/// Rewrite the request URL onto the chosen origin
fn build_outbound_url(origin: &Url, req: &HttpRequest, opts: &BackendOptsReverseProxy) -> Result<Url> {
    let mut url = origin.clone();

    // "/foo/" => "/foo/index.html" (if configured)
    let index_suffix = if !opts.index_document.is_empty() && req.uri().path().ends_with('/') {
        opts.index_document.as_str()
    } else {
        ""
    };

    // origin's path is "normally" empty but can carry a prefix
    let base = origin.path().trim_end_matches('/');
    url.set_path(&format!("{}{}{}", base, req.uri().path(), index_suffix));

    // varying the query is a cache miss; for known-static content someone
    // malicious could flood the origin that way
    if opts.remove_query_string {
        url.set_query(None);
    } else {
        url.set_query(req.uri().query());
    }

    Ok(url)
}

fn cached_entry_response(entry: &super::response_cache::CachedEntry) -> Result<HttpResponse> {
    let mut builder = http::Response::builder().status(entry.status);
    for (key, value) in &entry.headers {
        builder = builder.header(key.as_str(), value.as_str());
    }
    builder
        // marker for debugging which responses came from the disk cache
        .header("x-from-cache", "1")
        .body(Full::new(Bytes::from(entry.body.clone())))
        .map_err(|e| EdgeError::Other(e.to_string()))
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Headers that belong to one hop, never forwarded in either direction
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
