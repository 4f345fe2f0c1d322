//! Disk-backed response cache for reverse-proxy backends
//!
//! One directory per app (owner-only permissions), one JSON envelope per
//! cached URL. Honors the subset of HTTP caching semantics that matters for
//! fronting static-ish origins: `Cache-Control: max-age` freshness,
//! `no-store`/`private` opt-outs, and ETag revalidation — a 304 from origin
//! refreshes the stored entry instead of re-downloading the body.

use crate::error::{EdgeError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedEntry {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,
    pub stored_at_unix: u64,
    pub max_age_secs: u64,
    pub etag: Option<String>,
}

impl CachedEntry {
    pub fn is_fresh(&self, now_unix: u64) -> bool {
        now_unix < self.stored_at_unix + self.max_age_secs
    }
}

mod body_base64 {
    use super::*;
    use serde::Deserializer;

    pub fn serialize<S: serde::Serializer>(body: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&URL_SAFE_NO_PAD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        URL_SAFE_NO_PAD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

pub struct ResponseCache {
    dir: PathBuf,
}

impl ResponseCache {
    /// Cache rooted at `dir`, created with owner-only permissions
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| EdgeError::Cache(format!("response cache {}: {}", dir.display(), e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
                .map_err(|e| EdgeError::Cache(e.to_string()))?;
        }

        Ok(Self { dir: dir.to_path_buf() })
    }

    pub async fn lookup(&self, url: &str) -> Option<CachedEntry> {
        let raw = match tokio::fs::read(self.entry_path(url)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::error!(error = %e, "response cache read");
                return None;
            }
        };

        match serde_json::from_slice(&raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::error!(error = %e, "response cache entry corrupt");
                None
            }
        }
    }

    /// Store a response if its Cache-Control allows it. Anything uncacheable
    /// is silently skipped.
    pub async fn maybe_store(&self, url: &str, status: u16, headers: &[(String, String)], body: &[u8]) {
        if status != 200 {
            return;
        }

        let cache_control = header_value(headers, "cache-control").unwrap_or_default();
        let Some(max_age_secs) = cacheable_max_age(&cache_control) else {
            return;
        };

        let entry = CachedEntry {
            status,
            headers: headers.to_vec(),
            body: body.to_vec(),
            stored_at_unix: now_unix(),
            max_age_secs,
            etag: header_value(headers, "etag"),
        };

        let serialized = match serde_json::to_vec(&entry) {
            Ok(serialized) => serialized,
            Err(e) => {
                tracing::error!(error = %e, "response cache encode");
                return;
            }
        };

        if let Err(e) = tokio::fs::write(self.entry_path(url), serialized).await {
            tracing::error!(error = %e, "response cache write");
        }
    }

    /// Push freshness forward after a 304 revalidation
    pub async fn refresh(&self, url: &str) {
        if let Some(mut entry) = self.lookup(url).await {
            entry.stored_at_unix = now_unix();
            if let Ok(serialized) = serde_json::to_vec(&entry) {
                let _ = tokio::fs::write(self.entry_path(url), serialized).await;
            }
        }
    }

    fn entry_path(&self, url: &str) -> PathBuf {
        let digest = Sha256::digest(url.as_bytes());
        self.dir.join(URL_SAFE_NO_PAD.encode(digest))
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn header_value(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.clone())
}

/// `Some(max_age)` if the response may be stored, `None` otherwise
fn cacheable_max_age(cache_control: &str) -> Option<u64> {
    let directives: Vec<&str> = cache_control.split(',').map(|d| d.trim()).collect();

    if directives
        .iter()
        .any(|d| d.eq_ignore_ascii_case("no-store") || d.eq_ignore_ascii_case("private"))
    {
        return None;
    }

    directives.iter().find_map(|d| {
        d.strip_prefix("max-age=")
            .or_else(|| d.strip_prefix("MAX-AGE="))
            .and_then(|v| v.parse().ok())
            .filter(|&secs| secs > 0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> (tempfile::TempDir, ResponseCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(&dir.path().join("app")).unwrap();
        (dir, cache)
    }

    fn ok_headers(cache_control: &str) -> Vec<(String, String)> {
        vec![
            ("content-type".to_string(), "text/css".to_string()),
            ("cache-control".to_string(), cache_control.to_string()),
            ("etag".to_string(), "\"abc\"".to_string()),
        ]
    }

    #[tokio::test]
    async fn test_store_and_lookup() {
        let (_dir, cache) = cache();
        cache
            .maybe_store("https://o/style.css", 200, &ok_headers("max-age=60"), b"body{}")
            .await;

        let entry = cache.lookup("https://o/style.css").await.unwrap();
        assert_eq!(entry.status, 200);
        assert_eq!(entry.body, b"body{}");
        assert_eq!(entry.etag.as_deref(), Some("\"abc\""));
        assert!(entry.is_fresh(now_unix()));
    }

    #[tokio::test]
    async fn test_lookup_miss() {
        let (_dir, cache) = cache();
        assert!(cache.lookup("https://o/missing").await.is_none());
    }

    #[tokio::test]
    async fn test_no_store_not_cached() {
        let (_dir, cache) = cache();
        cache
            .maybe_store("https://o/a", 200, &ok_headers("no-store"), b"x")
            .await;
        assert!(cache.lookup("https://o/a").await.is_none());
    }

    #[tokio::test]
    async fn test_private_not_cached() {
        let (_dir, cache) = cache();
        cache
            .maybe_store("https://o/a", 200, &ok_headers("private, max-age=60"), b"x")
            .await;
        assert!(cache.lookup("https://o/a").await.is_none());
    }

    #[tokio::test]
    async fn test_missing_cache_control_not_cached() {
        let (_dir, cache) = cache();
        cache
            .maybe_store(
                "https://o/a",
                200,
                &[("content-type".to_string(), "text/css".to_string())],
                b"x",
            )
            .await;
        assert!(cache.lookup("https://o/a").await.is_none());
    }

    #[tokio::test]
    async fn test_non_200_not_cached() {
        let (_dir, cache) = cache();
        cache
            .maybe_store("https://o/a", 404, &ok_headers("max-age=60"), b"x")
            .await;
        assert!(cache.lookup("https://o/a").await.is_none());
    }

    #[tokio::test]
    async fn test_refresh_extends_freshness() {
        let (_dir, cache) = cache();
        cache
            .maybe_store("https://o/a", 200, &ok_headers("max-age=60"), b"x")
            .await;

        // age the entry artificially past its lifetime
        let mut entry = cache.lookup("https://o/a").await.unwrap();
        entry.stored_at_unix -= 120;
        let serialized = serde_json::to_vec(&entry).unwrap();
        tokio::fs::write(cache.entry_path("https://o/a"), serialized).await.unwrap();

        assert!(!cache.lookup("https://o/a").await.unwrap().is_fresh(now_unix()));

        cache.refresh("https://o/a").await;
        assert!(cache.lookup("https://o/a").await.unwrap().is_fresh(now_unix()));
    }

    #[cfg(unix)]
    #[test]
    fn test_directory_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app");
        ResponseCache::new(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_cacheable_max_age_parsing() {
        assert_eq!(cacheable_max_age("max-age=300"), Some(300));
        assert_eq!(cacheable_max_age("public, max-age=300"), Some(300));
        assert_eq!(cacheable_max_age("no-store, max-age=300"), None);
        assert_eq!(cacheable_max_age("max-age=0"), None);
        assert_eq!(cacheable_max_age(""), None);
        assert_eq!(cacheable_max_age("no-cache"), None);
    }
}
