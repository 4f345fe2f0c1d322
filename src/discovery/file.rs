//! Discover applications from a JSON "config" file
//!
//! File format (apps not at top level, to stay extensible):
//!
//! ```json
//! {"apps": [ {"id": "...", "frontends": [...], "backend": {...}} ]}
//! ```

use super::{Discovery, DiscoveryWriter};
use crate::config::Application;
use crate::error::{EdgeError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_FILENAME: &str = "applications.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct DiscoveryFile {
    apps: Vec<Application>,
}

pub struct FileDiscovery {
    path: PathBuf,
}

impl FileDiscovery {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `Some(discovery)` if the file exists, `None` otherwise (not an error:
    /// a missing file just means this source isn't in use)
    pub fn if_file_exists(path: &Path) -> Option<Self> {
        path.exists().then(|| Self::new(path))
    }

    async fn read_file(&self) -> Result<DiscoveryFile> {
        let raw = tokio::fs::read(&self.path).await.map_err(|e| {
            EdgeError::Discovery(format!("read {}: {}", self.path.display(), e))
        })?;

        serde_json::from_slice(&raw)
            .map_err(|e| EdgeError::Discovery(format!("parse {}: {}", self.path.display(), e)))
    }

    async fn write_file(&self, file: &DiscoveryFile) -> Result<()> {
        let serialized = serde_json::to_vec_pretty(file)?;

        // write-then-rename so concurrent readers never see a partial file
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serialized).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        Ok(())
    }
}

#[async_trait]
impl Discovery for FileDiscovery {
    async fn read_applications(&self) -> Result<Vec<Application>> {
        Ok(self.read_file().await?.apps)
    }
}

#[async_trait]
impl DiscoveryWriter for FileDiscovery {
    async fn update_application(&self, app: Application) -> Result<()> {
        app.validate()?;

        let mut file = if self.path.exists() {
            self.read_file().await?
        } else {
            DiscoveryFile::default()
        };

        match file.apps.iter_mut().find(|existing| existing.id == app.id) {
            Some(existing) => *existing = app,
            None => file.apps.push(app),
        }

        self.write_file(&file).await
    }

    async fn delete_application(&self, app: Application) -> Result<()> {
        let mut file = self.read_file().await?;

        let before = file.apps.len();
        file.apps.retain(|existing| existing.id != app.id);

        if file.apps.len() == before {
            return Err(EdgeError::Discovery(format!("app not found: {}", app.id)));
        }

        self.write_file(&file).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Backend, Frontend};

    fn app(id: &str) -> Application {
        Application::simple(
            id,
            Frontend::hostname(format!("{}.example.com", id)),
            Backend::redirect("https://elsewhere.example/"),
        )
    }

    fn discovery_in(dir: &tempfile::TempDir) -> FileDiscovery {
        FileDiscovery::new(dir.path().join(DEFAULT_FILENAME))
    }

    #[tokio::test]
    async fn test_read_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discovery_in(&dir).read_applications().await.is_err());
    }

    #[tokio::test]
    async fn test_if_file_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_FILENAME);
        assert!(FileDiscovery::if_file_exists(&path).is_none());

        std::fs::write(&path, r#"{"apps": []}"#).unwrap();
        assert!(FileDiscovery::if_file_exists(&path).is_some());
    }

    #[tokio::test]
    async fn test_update_creates_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let discovery = discovery_in(&dir);

        discovery.update_application(app("blog")).await.unwrap();
        discovery.update_application(app("wiki")).await.unwrap();

        let apps = discovery.read_applications().await.unwrap();
        let ids: Vec<_> = apps.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["blog", "wiki"]);
    }

    #[tokio::test]
    async fn test_update_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let discovery = discovery_in(&dir);

        discovery.update_application(app("blog")).await.unwrap();

        let mut changed = app("blog");
        changed.backend = Backend::redirect("https://new.example/");
        discovery.update_application(changed).await.unwrap();

        let apps = discovery.read_applications().await.unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(
            apps[0].backend.redirect_opts.as_ref().unwrap().to,
            "https://new.example/"
        );
    }

    #[tokio::test]
    async fn test_update_rejects_invalid_app() {
        let dir = tempfile::tempdir().unwrap();
        let discovery = discovery_in(&dir);

        let mut invalid = app("blog");
        invalid.id = String::new();
        assert!(discovery.update_application(invalid).await.is_err());
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let discovery = discovery_in(&dir);

        discovery.update_application(app("blog")).await.unwrap();
        discovery.delete_application(app("blog")).await.unwrap();

        assert!(discovery.read_applications().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let discovery = discovery_in(&dir);
        discovery.update_application(app("blog")).await.unwrap();

        assert!(discovery.delete_application(app("nope")).await.is_err());
    }
}
