//! Turbocharger — content-addressed static file serving
//!
//! Websites are deployed as a set of immutable objects (keyed by the SHA-256
//! of their bytes) plus a manifest mapping paths to object IDs. The edge
//! serves them from a two-tier local cache in front of a remote store, so the
//! origin sees a handful of requests per deploy instead of one per visitor.

pub mod deploy;
pub mod manifest_handler;
pub mod middleware;
pub mod store;

use crate::error::{EdgeError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Environment variable selecting the remote CAS backend.
/// Setting it also enables the turbocharger middleware on reverse proxies.
pub const STORE_ENV: &str = "TURBOCHARGER_STORE";

/// Identity of one stored object: SHA-256 of its content.
/// Wire form is base64 URL without padding, exactly 43 characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId([u8; 32]);

/// Serialized length of an ObjectId (43 base64 chars for 32 bytes)
const OBJECT_ID_STR_LEN: usize = 43;

impl ObjectId {
    /// Compute the ID of a piece of content
    pub fn from_content(content: &[u8]) -> Self {
        let digest = Sha256::digest(content);
        let mut id = [0u8; 32];
        id.copy_from_slice(&digest);
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// ETag for responses delivered without Content-Encoding
    pub fn etag_uncompressed(&self) -> String {
        format!("\"{}\"", self)
    }

    /// ETag for responses delivered with `Content-Encoding: gzip`.
    /// The two forms must differ: an entity tag identifies the encoded body.
    pub fn etag_gzipped(&self) -> String {
        format!("\"{}-gz\"", self)
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl std::fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectId({})", self)
    }
}

impl FromStr for ObjectId {
    type Err = EdgeError;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != OBJECT_ID_STR_LEN {
            return Err(EdgeError::Validation(format!(
                "invalid length for ObjectId; got {}",
                s.len()
            )));
        }

        let decoded = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|e| EdgeError::Validation(format!("ObjectId: {}", e)))?;

        let mut id = [0u8; 32];
        id.copy_from_slice(&decoded);
        Ok(Self(id))
    }
}

impl Serialize for ObjectId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Gives a piece of content a name. Deduplication falls out of the same
/// content ID simply having multiple paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathEntry {
    pub path: String,
    #[serde(rename = "id")]
    pub content_id: ObjectId,
}

/// Metadata not used for serving; exists so deployments can later be
/// enumerated and pruned per project / deploy time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub project: String,
    /// RFC 3339 deploy timestamp
    pub deployed: String,
}

/// One website deploy: the list of named files it contains
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub metadata: ManifestMetadata,
    pub files: Vec<PathEntry>,
}

impl Manifest {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| EdgeError::Other(format!("decode manifest: {}", e)))
    }
}

/// CAS operation failure
#[derive(Debug, Error)]
pub enum CasError {
    /// Expected on the hot path; triggers hydration, never surfaces as 500
    #[error("object not found")]
    NotFound,
    #[error("{0}")]
    Other(String),
}

/// A content-addressed store: S3, a filesystem, or similar.
///
/// `insert_object` must be idempotent (no-op when the object already exists)
/// and atomic (readers only ever observe complete objects).
#[async_trait]
pub trait Cas: Send + Sync {
    async fn get_object(&self, id: ObjectId) -> std::result::Result<Bytes, CasError>;

    async fn insert_object(
        &self,
        id: ObjectId,
        content: Bytes,
        content_type: &str,
    ) -> std::result::Result<(), CasError>;
}

impl std::fmt::Debug for dyn Cas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Cas")
    }
}

/// Separate stores for files and manifests, so deployments can be enumerated
/// (for future pruning) without scanning file objects.
#[derive(Clone, Debug)]
pub struct CasPair {
    pub files: Arc<dyn Cas>,
    pub manifests: Arc<dyn Cas>,
}

/// Whether the remote store (and thus the middleware) is configured
pub fn middleware_config_available() -> bool {
    std::env::var(STORE_ENV).map(|v| !v.is_empty()).unwrap_or(false)
}

/// Build the remote CAS pair from `TURBOCHARGER_STORE`.
///
/// `file:///path` keeps both stores on the local filesystem.
/// `s3://region/bucket` is reserved for an object-store integration that is
/// not part of this build.
pub fn storage_from_config() -> Result<CasPair> {
    let conf = std::env::var(STORE_ENV)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| EdgeError::Config(format!("ENV not specified: {}", STORE_ENV)))?;

    storage_from_url(&conf)
}

pub fn storage_from_url(url: &str) -> Result<CasPair> {
    if let Some(path) = url.strip_prefix("file://") {
        let root = PathBuf::from(path);
        return Ok(CasPair {
            files: Arc::new(store::FileStore::new(root.join("files"))?),
            manifests: Arc::new(store::FileStore::new(root.join("manifests"))?),
        });
    }

    if url.starts_with("s3://") {
        return Err(EdgeError::Config(
            "s3:// store scheme is reserved and not available in this build".to_string(),
        ));
    }

    Err(EdgeError::Config(format!("unsupported store URL: {}", url)))
}
