//! Content consumption — serves files from a known manifest ID
//!
//! Tier order per request: in-RAM optimized manifests, gzipped disk cache,
//! uncompressed disk cache, remote origin. A file object lives in exactly
//! one of the two disk tiers: text-like extensions are stored pre-compressed
//! so compressed delivery costs no CPU, everything else is stored as-is.

use super::store::FileStore;
use super::{Cas, CasError, CasPair, Manifest, ObjectId, PathEntry};
use crate::backend::{empty_response, text_response, HttpRequest, HttpResponse};
use crate::error::{EdgeError, Result};
use crate::sync::MutexMap;
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE, ETAG, IF_NONE_MATCH};
use http::StatusCode;
use http_body_util::Full;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

/// Extensions worth pre-compressing into the gzipped tier.
/// Pure function of the path, so tier placement is stable across restarts.
fn is_expected_to_compress_well(path: &str) -> bool {
    matches!(
        extension(path),
        "js" | "map" | "css" | "html" | "json" | "xml" | "svg" | "txt"
    )
}

fn extension(path: &str) -> &str {
    Path::new(path).extension().and_then(|e| e.to_str()).unwrap_or("")
}

/// Pre-computed path lookup for one immutable manifest
struct OptimizedManifest {
    files: HashMap<String, PathEntry>,
}

impl From<Manifest> for OptimizedManifest {
    fn from(manifest: Manifest) -> Self {
        let files = manifest
            .files
            .into_iter()
            .map(|entry| (entry.path.clone(), entry))
            .collect();
        Self { files }
    }
}

/// Serves `(manifest ID, request path)` pairs from the fastest available
/// tier, with single-flight origin fetches under concurrent demand.
pub struct ManifestHandler {
    /// The origin we act as the cache for — minimize requests to it
    origin: CasPair,
    file_download_locks: MutexMap,
    manifest_download_locks: MutexMap,

    /// Holds gzipped copies of compressible objects
    cache_gzipped: Arc<dyn Cas>,
    /// Holds everything else (images, video) — also caches manifests
    cache_uncompressed: Arc<dyn Cas>,

    /// RAM cache answering "which files does this site version have".
    /// Manifests are immutable, so entries live for the process lifetime.
    cached_manifests: StdMutex<HashMap<ObjectId, Arc<OptimizedManifest>>>,
}

impl ManifestHandler {
    /// Handler with disk cache tiers under `<cache_root>/gzipped` and
    /// `<cache_root>/uncompressed`
    pub fn new(origin: CasPair, cache_root: &Path) -> Result<Self> {
        let gzipped = FileStore::new(cache_root.join("gzipped"))
            .map_err(|e| EdgeError::Cache(format!("turbocharger: {}", e)))?;
        let uncompressed = FileStore::new(cache_root.join("uncompressed"))
            .map_err(|e| EdgeError::Cache(format!("turbocharger: {}", e)))?;

        Ok(Self::with_caches(origin, Arc::new(gzipped), Arc::new(uncompressed)))
    }

    pub fn with_caches(
        origin: CasPair,
        cache_gzipped: Arc<dyn Cas>,
        cache_uncompressed: Arc<dyn Cas>,
    ) -> Self {
        Self {
            origin,
            file_download_locks: MutexMap::new(),
            manifest_download_locks: MutexMap::new(),
            cache_gzipped,
            cache_uncompressed,
            cached_manifests: StdMutex::new(HashMap::new()),
        }
    }

    /// Serve one request against one manifest
    pub async fn serve_from_manifest(&self, manifest_id: ObjectId, req: &HttpRequest) -> HttpResponse {
        let manifest = match self.resolve_manifest(manifest_id).await {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::error!(manifest = %manifest_id, error = %e, "manifest resolution failed");
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
            }
        };

        // all 404s are gated here: below this point every file is expected
        // to exist in cache or origin
        let (file, status) = match manifest.files.get(req.uri().path()) {
            Some(file) => (file.clone(), StatusCode::OK),
            None => match manifest.files.get("/404.html") {
                Some(custom) => (custom.clone(), StatusCode::NOT_FOUND),
                None => return text_response(StatusCode::NOT_FOUND, "404 page not found"),
            },
        };

        let if_none_match = req
            .headers()
            .get(IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if if_none_match == file.content_id.etag_uncompressed()
            || if_none_match == file.content_id.etag_gzipped()
        {
            return empty_response(StatusCode::NOT_MODIFIED);
        }

        let gzip_ok = client_supports_gzip(req);

        // the expected 99.99 % happy path
        match self.serve_from_cache(&file, status, gzip_ok).await {
            Ok(Some(response)) => return response,
            Ok(None) => {} // missed both tiers
            Err(e) => {
                tracing::error!(path = %file.path, error = %e, "serving from cache failed");
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
            }
        }

        match self.hydrate_cache_from_origin_and_serve(&file, status, gzip_ok).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(path = %file.path, error = %e, "origin hydration failed");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }

    /// Try both disk tiers. `Ok(None)` means a clean double miss.
    /// Cache read errors other than not-found are logged and treated as a
    /// miss, so a broken disk degrades to origin traffic instead of 500s.
    async fn serve_from_cache(
        &self,
        file: &PathEntry,
        status: StatusCode,
        gzip_ok: bool,
    ) -> Result<Option<HttpResponse>> {
        match self.cache_gzipped.get_object(file.content_id).await {
            Ok(gzipped) => {
                let response = if gzip_ok {
                    // pre-compressed delivery: pipe through unchanged
                    file_response(file, status)
                        .header(CONTENT_ENCODING, "gzip")
                        .header(ETAG, file.content_id.etag_gzipped())
                        .body(Full::new(gzipped))
                        .expect("static response")
                } else {
                    let plain = gunzip(&gzipped)?;
                    file_response(file, status)
                        .header(ETAG, file.content_id.etag_uncompressed())
                        .body(Full::new(Bytes::from(plain)))
                        .expect("static response")
                };
                return Ok(Some(response));
            }
            Err(CasError::NotFound) => {}
            Err(e) => tracing::error!(error = %e, "cache_gzipped"),
        }

        match self.cache_uncompressed.get_object(file.content_id).await {
            Ok(uncompressed) => {
                // uncompressible data (images, video); never re-compress
                let response = file_response(file, status)
                    .header(ETAG, file.content_id.etag_uncompressed())
                    .body(Full::new(uncompressed))
                    .expect("static response");
                Ok(Some(response))
            }
            Err(CasError::NotFound) => Ok(None),
            Err(e) => {
                tracing::error!(error = %e, "cache_uncompressed");
                Ok(None)
            }
        }
    }

    /// Relatively rare path: fetch from origin into the right tier, then
    /// serve from cache like everyone else.
    ///
    /// The per-content lock keeps N simultaneous first-requests from turning
    /// into N origin downloads: the try-lock winner hydrates, losers park on
    /// the lock and then read the cache the winner filled.
    async fn hydrate_cache_from_origin_and_serve(
        &self,
        file: &PathEntry,
        status: StatusCode,
        gzip_ok: bool,
    ) -> Result<HttpResponse> {
        let key = file.content_id.to_string();

        match self.file_download_locks.try_lock(&key) {
            Some(_winner) => {
                // we're responsible for hydrating the cache
                let content = match self.origin.files.get_object(file.content_id).await {
                    Ok(content) => content,
                    Err(CasError::NotFound) => {
                        // the manifest is trusted; a missing referenced
                        // object is an origin-side integrity failure
                        return Err(EdgeError::Other(format!(
                            "origin is missing object {} referenced by manifest",
                            file.content_id
                        )));
                    }
                    Err(e) => return Err(EdgeError::Upstream(e.to_string())),
                };

                if is_expected_to_compress_well(&file.path) {
                    let gzipped = gzip(&content)?;
                    self.cache_gzipped
                        .insert_object(file.content_id, Bytes::from(gzipped), "application/gzip")
                        .await
                        .map_err(|e| EdgeError::Cache(e.to_string()))?;
                } else {
                    self.cache_uncompressed
                        .insert_object(file.content_id, content, &content_type(&file.path))
                        .await
                        .map_err(|e| EdgeError::Cache(e.to_string()))?;
                }
            }
            None => {
                // wasn't first, so wait for the winner's hydration to finish
                drop(self.file_download_locks.lock(&key).await);
            }
        }

        match self.serve_from_cache(file, status, gzip_ok).await? {
            Some(response) => Ok(response),
            None => Err(EdgeError::Cache("cache hydration failed".to_string())),
        }
    }

    /// Find the file list for one site version, memoizing the optimized form.
    ///
    /// A per-manifest lock prevents competing downloads; a losing caller
    /// waits for the lock and retries from the RAM cache so it sees the
    /// winner's result.
    async fn resolve_manifest(&self, manifest_id: ObjectId) -> Result<Arc<OptimizedManifest>> {
        let key = manifest_id.to_string();

        loop {
            // RAM check and lock acquisition happen under the same mutex,
            // so a winner's memoization is visible before its lock releases
            let producer_guard = {
                let cached = self.cached_manifests.lock().expect("manifest cache poisoned");
                if let Some(manifest) = cached.get(&manifest_id) {
                    return Ok(manifest.clone());
                }
                self.manifest_download_locks.try_lock(&key)
            };

            let _guard = match producer_guard {
                Some(guard) => guard,
                None => {
                    // someone else is downloading this manifest; wait until
                    // they have a result, then re-check the RAM cache
                    drop(self.manifest_download_locks.lock(&key).await);
                    continue;
                }
            };

            // sole producer for this manifest below this line

            let manifest_bytes = match self.cache_uncompressed.get_object(manifest_id).await {
                // covers edge-router restarts without access to origin
                Ok(bytes) => bytes,
                Err(e) => {
                    if !matches!(e, CasError::NotFound) {
                        tracing::error!(error = %e, "resolve_manifest cache_uncompressed");
                    }

                    let bytes = self
                        .origin
                        .manifests
                        .get_object(manifest_id)
                        .await
                        .map_err(|e| EdgeError::Other(format!("manifest {}: {}", manifest_id, e)))?;

                    if let Err(e) = self
                        .cache_uncompressed
                        .insert_object(manifest_id, bytes.clone(), "application/json")
                        .await
                    {
                        tracing::error!(error = %e, "resolve_manifest cache hydration");
                    }

                    bytes
                }
            };

            let manifest = Manifest::decode(&manifest_bytes)?;
            let optimized = Arc::new(OptimizedManifest::from(manifest));

            self.cached_manifests
                .lock()
                .expect("manifest cache poisoned")
                .insert(manifest_id, optimized.clone());

            return Ok(optimized);
        }
    }
}

fn file_response(file: &PathEntry, status: StatusCode) -> http::response::Builder {
    http::Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type(&file.path))
}

/// Content type from the extension via the MIME database, with the
/// octet-stream fallback. Text types get an explicit charset.
pub(crate) fn content_type(path: &str) -> String {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    if mime.type_() == mime_guess::mime::TEXT {
        format!("{}; charset=utf-8", mime.essence_str())
    } else {
        mime.essence_str().to_string()
    }
}

fn client_supports_gzip(req: &HttpRequest) -> bool {
    req.headers()
        .get(ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("gzip"))
        .unwrap_or(false)
}

fn gzip(content: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content)?;
    Ok(encoder.finish()?)
}

fn gunzip(content: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(content);
    let mut plain = Vec::new();
    decoder.read_to_end(&mut plain)?;
    Ok(plain)
}
