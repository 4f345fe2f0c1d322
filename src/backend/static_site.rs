//! An entire static website hosted in the turbocharger CAS
//!
//! Doesn't do much more than bind one immutable manifest ID to the backend.
//! When a different site version gets deployed that's a config-level change:
//! the backend factory sees a new fingerprint and makes a new instance.

use super::{Handler, HttpRequest, HttpResponse, RequestContext};
use crate::turbocharger::manifest_handler::ManifestHandler;
use crate::turbocharger::ObjectId;
use async_trait::async_trait;
use std::sync::Arc;

pub struct StaticSiteBackend {
    manifest_id: ObjectId,
    manifest_handler: Arc<ManifestHandler>,
}

impl StaticSiteBackend {
    pub fn new(manifest_id: ObjectId, manifest_handler: Arc<ManifestHandler>) -> Self {
        Self {
            manifest_id,
            manifest_handler,
        }
    }
}

#[async_trait]
impl Handler for StaticSiteBackend {
    async fn handle(&self, req: HttpRequest, _ctx: &RequestContext) -> HttpResponse {
        // "/foo/" => "/foo/index.html"
        let req = if req.uri().path().ends_with('/') {
            rewrite_path(req, |path| format!("{}index.html", path))
        } else {
            req
        };

        self.manifest_handler.serve_from_manifest(self.manifest_id, &req).await
    }
}

fn rewrite_path(req: HttpRequest, rewrite: impl Fn(&str) -> String) -> HttpRequest {
    let (mut parts, body) = req.into_parts();
    let new_path = rewrite(parts.uri.path());
    if let Ok(uri) = new_path.parse() {
        parts.uri = uri;
    }
    http::Request::from_parts(parts, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turbocharger::deploy::{DeploymentManager, FileToDeploy};
    use crate::turbocharger::store::testing::MemoryStore;
    use crate::turbocharger::{CasPair, ManifestMetadata};
    use bytes::Bytes;
    use http::StatusCode;
    use http_body_util::BodyExt;

    async fn site_backend() -> StaticSiteBackend {
        let pair = CasPair {
            files: Arc::new(MemoryStore::new()),
            manifests: Arc::new(MemoryStore::new()),
        };

        let deployed = DeploymentManager::new(pair.clone())
            .deploy(
                ManifestMetadata {
                    project: "blog".to_string(),
                    deployed: "2023-01-02T03:04:05Z".to_string(),
                },
                vec![
                    FileToDeploy {
                        path: "/index.html".to_string(),
                        content: Bytes::from_static(b"<h1>front page</h1>"),
                    },
                    FileToDeploy {
                        path: "/posts/index.html".to_string(),
                        content: Bytes::from_static(b"<h1>posts</h1>"),
                    },
                ],
            )
            .await
            .unwrap();

        let handler = Arc::new(ManifestHandler::with_caches(
            pair,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
        ));

        StaticSiteBackend::new(deployed.id, handler)
    }

    fn ctx() -> RequestContext {
        RequestContext {
            client_ip: std::net::IpAddr::from([127, 0, 0, 1]),
            secure: true,
        }
    }

    async fn fetch(backend: &StaticSiteBackend, path: &str) -> (StatusCode, Bytes) {
        let req = http::Request::builder().uri(path).body(Bytes::new()).unwrap();
        let response = backend.handle(req, &ctx()).await;
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body)
    }

    #[tokio::test]
    async fn test_root_serves_index_document() {
        let backend = site_backend().await;
        let (status, body) = fetch(&backend, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"<h1>front page</h1>"));
    }

    #[tokio::test]
    async fn test_directory_path_serves_its_index() {
        let backend = site_backend().await;
        let (status, body) = fetch(&backend, "/posts/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"<h1>posts</h1>"));
    }

    #[tokio::test]
    async fn test_exact_path_passes_through() {
        let backend = site_backend().await;
        let (status, _) = fetch(&backend, "/index.html").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let backend = site_backend().await;
        let (status, _) = fetch(&backend, "/nope.html").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
