//! Turbocharger middleware — lazy discovery of CAS-served subtrees
//!
//! Sits in front of a reverse-proxied origin. The origin opts a subtree of
//! itself (e.g. `/static`) into CAS serving by sending a response header:
//!
//! ```text
//! turbocharger: /static <manifestID-b64url>
//! ```
//!
//! Once attached, requests under the prefix are served by the manifest
//! handler instead of the origin. Attachments are revalidated lazily: the
//! first request after the validity window fires one background HEAD to the
//! prefix, which either refreshes the attachment or detaches it. Detaching
//! matters — a deploy without turbocharging would otherwise keep being
//! served from a stale manifest whose files may no longer exist.

use super::manifest_handler::ManifestHandler;
use super::ObjectId;
use crate::backend::{Handler, HttpRequest, HttpResponse, RequestContext};
use crate::error::{EdgeError, Result};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::HOST;
use http::{Method, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Response header by which an origin advertises a turbocharged subtree
pub const ADVERTISEMENT_HEADER: &str = "turbocharger";

/// Accepted staleness window. Origin sees roughly one ping per window under
/// load, zero when idle.
const VALIDITY_PERIOD: Duration = Duration::from_secs(5);

/// An origin's subtree at a specific version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subtree {
    /// Usually something like `/static`
    pub prefix: String,
    pub manifest_id: ObjectId,
}

impl Subtree {
    pub fn parse(serialized: &str) -> Result<Self> {
        let (prefix, manifest) = serialized
            .split_once(' ')
            .ok_or_else(|| EdgeError::Client(format!("malformed advertisement: {}", serialized)))?;

        if !prefix.starts_with('/') {
            return Err(EdgeError::Client(format!(
                "advertisement prefix must begin with '/': {}",
                prefix
            )));
        }

        Ok(Self {
            prefix: prefix.to_string(),
            manifest_id: manifest.parse()?,
        })
    }

    pub fn header_value(&self) -> String {
        format!("{} {}", self.prefix, self.manifest_id)
    }
}

/// One discovery result, valid for one staleness window
struct DiscoveredSubtree {
    subtree: Subtree,
    /// Absolute URL pinged on expiry (path = prefix: file paths don't
    /// survive deploys, the prefix does)
    ping_url: String,
    ping_host: String,
    ping_secure: bool,
    valid_until: Instant,
    /// One-shot: only the first stale request triggers a ping
    ping_fired: AtomicBool,
}

struct Inner {
    /// The full web application — minimize requests to it
    origin: Arc<dyn Handler>,
    manifest_handler: Arc<ManifestHandler>,
    discovered: ArcSwapOption<DiscoveredSubtree>,
    validity: Duration,
}

/// Middleware wrapping an origin handler with subtree autodiscovery
pub struct TurboMiddleware {
    inner: Arc<Inner>,
}

impl TurboMiddleware {
    pub fn new(origin: Arc<dyn Handler>, manifest_handler: Arc<ManifestHandler>) -> Self {
        Self::with_validity(origin, manifest_handler, VALIDITY_PERIOD)
    }

    pub fn with_validity(
        origin: Arc<dyn Handler>,
        manifest_handler: Arc<ManifestHandler>,
        validity: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                origin,
                manifest_handler,
                discovered: ArcSwapOption::empty(),
                validity,
            }),
        }
    }
}

#[async_trait]
impl Handler for TurboMiddleware {
    async fn handle(&self, req: HttpRequest, ctx: &RequestContext) -> HttpResponse {
        let discovered = self.inner.discovered.load_full();

        if let Some(discovered) = discovered {
            if req.uri().path().starts_with(&discovered.subtree.prefix) {
                maybe_trigger_ping(&self.inner, &discovered);

                let stripped = strip_prefix_request(req, &discovered.subtree.prefix);
                return self
                    .inner
                    .manifest_handler
                    .serve_from_manifest(discovered.subtree.manifest_id, &stripped)
                    .await;
            }
        }

        // remember what we need for the ping URL before the request is consumed
        let host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let secure = ctx.secure;

        let response = self.inner.origin.handle(req, ctx).await;

        // after the first autodiscovery we stop hitting origin URLs that
        // carry the advertisement (except through the ping path)
        if let Some(header) = response
            .headers()
            .get(ADVERTISEMENT_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            check_for_advertisement(&self.inner, header, &host, secure);
        }

        response
    }
}

fn check_for_advertisement(inner: &Arc<Inner>, header: &str, host: &str, secure: bool) {
    let subtree = match Subtree::parse(header) {
        Ok(subtree) => subtree,
        Err(e) => {
            tracing::error!(error = %e, "advertisement parse failed");
            return;
        }
    };

    match inner.discovered.load_full() {
        Some(existing) => {
            if existing.subtree == subtree {
                tracing::debug!("pre-attach race detected (not dangerous)");
            } else {
                // conflicting advertisements could be a misconfigured origin
                detach(
                    inner,
                    &format!(
                        "got multiple conflicting advertisements in pre-attach state: {} vs. {}",
                        existing.subtree.header_value(),
                        subtree.header_value()
                    ),
                );
            }
        }
        None => {
            let attached = attach(inner, subtree, host, secure);
            tracing::info!(
                advertisement = header,
                ping_url = %attached.ping_url,
                "attached turbocharger"
            );
        }
    }
}

fn attach(inner: &Arc<Inner>, subtree: Subtree, host: &str, secure: bool) -> Arc<DiscoveredSubtree> {
    let scheme = if secure { "https" } else { "http" };

    let discovered = Arc::new(DiscoveredSubtree {
        ping_url: format!("{}://{}{}", scheme, host, subtree.prefix),
        ping_host: host.to_string(),
        ping_secure: secure,
        subtree,
        valid_until: Instant::now() + inner.validity,
        ping_fired: AtomicBool::new(false),
    });

    inner.discovered.store(Some(discovered.clone()));

    discovered
}

fn detach(inner: &Arc<Inner>, reason: &str) {
    inner.discovered.store(None);
    tracing::error!(reason, "detached turbocharger");
}

/// When the validity window has passed, serve from the (stale) attachment
/// anyway and let at most one background ping refresh or detach it —
/// expired requests must never block on revalidation.
fn maybe_trigger_ping(inner: &Arc<Inner>, stale: &Arc<DiscoveredSubtree>) {
    if Instant::now() < stale.valid_until {
        return;
    }

    if stale.ping_fired.swap(true, Ordering::SeqCst) {
        return;
    }

    let inner = inner.clone();
    let stale = stale.clone();
    tokio::spawn(async move {
        if let Err(e) = ping_check(&inner, &stale).await {
            detach(&inner, &e.to_string());
        }
    });
}

async fn ping_check(inner: &Arc<Inner>, stale: &Arc<DiscoveredSubtree>) -> Result<()> {
    let ping = http::Request::builder()
        .method(Method::HEAD)
        .uri(stale.subtree.prefix.clone())
        .header(HOST, stale.ping_host.clone())
        .body(Bytes::new())
        .map_err(|e| EdgeError::Other(e.to_string()))?;

    let ctx = RequestContext {
        client_ip: std::net::IpAddr::from([127, 0, 0, 1]),
        secure: stale.ping_secure,
    };

    let response = inner.origin.handle(ping, &ctx).await;

    if response.status() != StatusCode::OK {
        return Err(EdgeError::Upstream(format!(
            "ping request failed: {}",
            response.status().as_u16()
        )));
    }

    let header = response
        .headers()
        .get(ADVERTISEMENT_HEADER)
        .and_then(|v| v.to_str().ok())
        // if we're pinging, turbocharger existed before. gone means detach
        .ok_or_else(|| EdgeError::Other("turbocharger header went missing".to_string()))?;

    let subtree = Subtree::parse(header)?;

    // always create a new discovery result, even when the advertisement is
    // unchanged: this pushes valid_until forward and re-arms the one-shot
    let reloaded = attach(inner, subtree, &stale.ping_host, stale.ping_secure);

    if stale.subtree != reloaded.subtree {
        tracing::info!(
            from = %stale.subtree.header_value(),
            to = %reloaded.subtree.header_value(),
            "turbocharger reload"
        );
    }

    Ok(())
}

/// Origin-side integration: stamps the advertisement header onto every
/// response of the wrapped handler, opting its subtree into CAS serving by
/// whatever edge fronts it. Applications embedding this crate use it on
/// their static-file handler.
pub struct Advertiser {
    header_value: String,
    inner: Arc<dyn Handler>,
}

impl Advertiser {
    pub fn new(subtree: Subtree, inner: Arc<dyn Handler>) -> Self {
        Self {
            header_value: subtree.header_value(),
            inner,
        }
    }
}

#[async_trait]
impl Handler for Advertiser {
    async fn handle(&self, req: HttpRequest, ctx: &RequestContext) -> HttpResponse {
        let mut response = self.inner.handle(req, ctx).await;

        if let Ok(value) = self.header_value.parse() {
            response.headers_mut().insert(ADVERTISEMENT_HEADER, value);
        }

        response
    }
}

/// `/static/main.js` with prefix `/static` becomes `/main.js`
fn strip_prefix_request(req: HttpRequest, prefix: &str) -> HttpRequest {
    let (mut parts, body) = req.into_parts();

    let path = parts.uri.path();
    let remainder = path.strip_prefix(prefix).unwrap_or(path);
    let new_path = if remainder.starts_with('/') {
        remainder.to_string()
    } else {
        format!("/{}", remainder)
    };

    if let Ok(uri) = new_path.parse() {
        parts.uri = uri;
    }

    http::Request::from_parts(parts, body)
}

#[cfg(test)]
mod tests {
    use super::super::deploy::{DeploymentManager, FileToDeploy};
    use super::super::store::testing::MemoryStore;
    use super::super::{CasPair, ManifestMetadata};
    use super::*;
    use crate::backend::text_response;
    use http_body_util::BodyExt;
    use std::sync::Mutex;

    /// Scripted origin: records requests, optionally advertises a subtree
    struct ScriptedOrigin {
        advertisement: Mutex<Option<String>>,
        requests: Mutex<Vec<(Method, String)>>,
    }

    impl ScriptedOrigin {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                advertisement: Mutex::new(None),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn advertise(&self, value: Option<&str>) {
            *self.advertisement.lock().unwrap() = value.map(String::from);
        }

        fn requests(&self) -> Vec<(Method, String)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Handler for ScriptedOrigin {
        async fn handle(&self, req: HttpRequest, _ctx: &RequestContext) -> HttpResponse {
            self.requests
                .lock()
                .unwrap()
                .push((req.method().clone(), req.uri().path().to_string()));

            let mut response = text_response(StatusCode::OK, "from origin");
            if let Some(value) = self.advertisement.lock().unwrap().as_deref() {
                response
                    .headers_mut()
                    .insert(ADVERTISEMENT_HEADER, value.parse().unwrap());
            }
            response
        }
    }

    struct Setup {
        origin: Arc<ScriptedOrigin>,
        middleware: TurboMiddleware,
    }

    async fn deploy(pair: &CasPair, files: Vec<(&str, &[u8])>) -> ObjectId {
        let deployer = DeploymentManager::new(pair.clone());
        let files = files
            .into_iter()
            .map(|(path, content)| FileToDeploy {
                path: path.to_string(),
                content: Bytes::copy_from_slice(content),
            })
            .collect();
        let metadata = ManifestMetadata {
            project: "app".to_string(),
            deployed: "2023-01-02T03:04:05Z".to_string(),
        };
        deployer.deploy(metadata, files).await.unwrap().id
    }

    async fn setup() -> (Setup, ObjectId, ObjectId) {
        let pair = CasPair {
            files: Arc::new(MemoryStore::new()),
            manifests: Arc::new(MemoryStore::new()),
        };

        let m1 = deploy(&pair, vec![("/main.js", b"version one")]).await;
        let m2 = deploy(&pair, vec![("/main.js", b"version two")]).await;

        let manifest_handler = Arc::new(ManifestHandler::with_caches(
            pair,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
        ));

        let origin = ScriptedOrigin::new();
        let middleware = TurboMiddleware::new(origin.clone(), manifest_handler);

        (Setup { origin, middleware }, m1, m2)
    }

    fn ctx() -> RequestContext {
        RequestContext {
            client_ip: std::net::IpAddr::from([10, 0, 0, 1]),
            secure: true,
        }
    }

    fn get(path: &str) -> HttpRequest {
        http::Request::builder()
            .uri(path)
            .header(HOST, "app.example.com")
            .body(Bytes::new())
            .unwrap()
    }

    async fn body_of(response: HttpResponse) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    /// Let spawned ping tasks run to completion (paused clock auto-advances)
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_and_serve_subtree() {
        let (setup, m1, _m2) = setup().await;

        // no attachment yet: everything goes to origin
        let response = setup.middleware.handle(get("/page"), &ctx()).await;
        assert_eq!(body_of(response).await, Bytes::from_static(b"from origin"));

        // origin starts advertising; the next origin response attaches
        setup
            .origin
            .advertise(Some(&format!("/static {}", m1)));
        setup.middleware.handle(get("/page"), &ctx()).await;

        // now /static/... is served from CAS, prefix stripped
        let response = setup.middleware.handle(get("/static/main.js"), &ctx()).await;
        assert_eq!(body_of(response).await, Bytes::from_static(b"version one"));

        // other paths still reach the origin
        setup.middleware.handle(get("/other"), &ctx()).await;
        let origin_paths: Vec<String> = setup.origin.requests().iter().map(|(_, p)| p.clone()).collect();
        assert_eq!(origin_paths, vec!["/page", "/page", "/other"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_pings_once_and_reloads() {
        let (setup, m1, m2) = setup().await;

        setup.origin.advertise(Some(&format!("/static {}", m1)));
        setup.middleware.handle(get("/page"), &ctx()).await;

        // move past the validity window; origin now advertises version two
        tokio::time::advance(Duration::from_secs(6)).await;
        setup.origin.advertise(Some(&format!("/static {}", m2)));

        // stale attachment still serves, and triggers exactly one ping
        // even under several expired requests
        for _ in 0..3 {
            let response = setup.middleware.handle(get("/static/main.js"), &ctx()).await;
            assert_eq!(response.status(), StatusCode::OK);
        }
        settle().await;

        let heads: Vec<_> = setup
            .origin
            .requests()
            .into_iter()
            .filter(|(m, _)| *m == Method::HEAD)
            .collect();
        assert_eq!(heads, vec![(Method::HEAD, "/static".to_string())]);

        // attachment flipped to the new manifest
        let response = setup.middleware.handle(get("/static/main.js"), &ctx()).await;
        assert_eq!(body_of(response).await, Bytes::from_static(b"version two"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_header_on_ping_detaches() {
        let (setup, m1, _m2) = setup().await;

        setup.origin.advertise(Some(&format!("/static {}", m1)));
        setup.middleware.handle(get("/page"), &ctx()).await;

        tokio::time::advance(Duration::from_secs(6)).await;
        setup.origin.advertise(None); // new deploy without turbocharger

        setup.middleware.handle(get("/static/main.js"), &ctx()).await;
        settle().await;

        // detached: subtree requests now go to the origin
        let response = setup.middleware.handle(get("/static/main.js"), &ctx()).await;
        assert_eq!(body_of(response).await, Bytes::from_static(b"from origin"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflicting_advertisement_detaches() {
        let (setup, m1, m2) = setup().await;

        setup.origin.advertise(Some(&format!("/static {}", m1)));
        setup.middleware.handle(get("/page"), &ctx()).await;

        // a conflicting advertisement from a non-subtree path detaches
        setup.origin.advertise(Some(&format!("/assets {}", m2)));
        setup.middleware.handle(get("/page"), &ctx()).await;

        let response = setup.middleware.handle(get("/static/main.js"), &ctx()).await;
        assert_eq!(body_of(response).await, Bytes::from_static(b"from origin"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_advertiser_origin_primes_middleware() {
        let (setup, m1, _m2) = setup().await;

        // an origin wrapped in the app-side Advertiser re-primes the edge
        // on its first response, no scripting involved
        let advertised = Advertiser::new(
            Subtree {
                prefix: "/static".to_string(),
                manifest_id: m1,
            },
            setup.origin.clone(),
        );

        let response = advertised.handle(get("/landing"), &ctx()).await;
        let header = response
            .headers()
            .get(ADVERTISEMENT_HEADER)
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(header, format!("/static {}", m1));
        assert_eq!(Subtree::parse(header).unwrap().manifest_id, m1);
    }

    #[test]
    fn test_subtree_parse() {
        let id = ObjectId::from_content(b"x");
        let parsed = Subtree::parse(&format!("/static {}", id)).unwrap();
        assert_eq!(parsed.prefix, "/static");
        assert_eq!(parsed.manifest_id, id);
        assert_eq!(parsed.header_value(), format!("/static {}", id));
    }

    #[test]
    fn test_subtree_parse_rejects_garbage() {
        assert!(Subtree::parse("no-space-here").is_err());
        assert!(Subtree::parse("missing-slash abc").is_err());
        assert!(Subtree::parse("/prefix not-an-object-id").is_err());
    }

    #[test]
    fn test_strip_prefix_request() {
        let req = http::Request::builder()
            .uri("/static/js/app.js")
            .body(Bytes::new())
            .unwrap();
        let stripped = strip_prefix_request(req, "/static");
        assert_eq!(stripped.uri().path(), "/js/app.js");

        let req = http::Request::builder().uri("/static").body(Bytes::new()).unwrap();
        let stripped = strip_prefix_request(req, "/static");
        assert_eq!(stripped.uri().path(), "/");
    }
}
