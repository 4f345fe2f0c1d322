//! Deployment — inserting website content into the CAS
//!
//! Deploys are rare events compared to serving. Each file is stored under
//! the SHA-256 of its bytes; the resulting manifest is itself stored
//! content-addressed, so the manifest ID names the site version.

use super::manifest_handler::content_type;
use super::{CasPair, Manifest, ManifestMetadata, ObjectId, PathEntry};
use crate::error::{EdgeError, Result};
use bytes::Bytes;

/// One file of a site, ready for upload. Path begins with `/`.
pub struct FileToDeploy {
    pub path: String,
    pub content: Bytes,
}

/// Collect every file under `root` into deployable form, paths relative to
/// `root` and rooted at `/`
pub fn collect_directory(root: &std::path::Path) -> Result<Vec<FileToDeploy>> {
    fn walk(root: &std::path::Path, dir: &std::path::Path, out: &mut Vec<FileToDeploy>) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();

            if entry.file_type()?.is_dir() {
                walk(root, &path, out)?;
            } else {
                let relative = path
                    .strip_prefix(root)
                    .map_err(|e| EdgeError::Other(e.to_string()))?;
                out.push(FileToDeploy {
                    path: format!("/{}", relative.display()),
                    content: Bytes::from(std::fs::read(&path)?),
                });
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    walk(root, root, &mut files)?;
    Ok(files)
}

/// The computed outcome of a deploy
pub struct ManifestWithId {
    pub id: ObjectId,
    pub manifest: Manifest,
}

pub struct DeploymentManager {
    storages: CasPair,
}

impl DeploymentManager {
    pub fn new(storages: CasPair) -> Self {
        Self { storages }
    }

    /// Upload files and their manifest. Returns the manifest ID (found from
    /// the manifest CAS afterwards).
    pub async fn deploy(
        &self,
        metadata: ManifestMetadata,
        files: Vec<FileToDeploy>,
    ) -> Result<ManifestWithId> {
        if files.is_empty() {
            return Err(EdgeError::Validation(
                "deployment doesn't have files".to_string(),
            ));
        }

        let mut entries = Vec::with_capacity(files.len());

        for file in files {
            let content_id = ObjectId::from_content(&file.content);

            tracing::info!(path = %file.path, "uploading");

            self.storages
                .files
                .insert_object(content_id, file.content, &content_type(&file.path))
                .await
                .map_err(|e| EdgeError::Upstream(format!("upload {}: {}", file.path, e)))?;

            entries.push(PathEntry {
                path: file.path,
                content_id,
            });
        }

        // stable order, so uploading the same file set again yields the same
        // manifest ID (when metadata is also equal)
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        let manifest = Manifest {
            metadata,
            files: entries,
        };

        let serialized = serde_json::to_vec(&manifest)?;
        let manifest_id = ObjectId::from_content(&serialized);

        self.storages
            .manifests
            .insert_object(manifest_id, Bytes::from(serialized), "application/json")
            .await
            .map_err(|e| EdgeError::Upstream(format!("upload manifest: {}", e)))?;

        Ok(ManifestWithId {
            id: manifest_id,
            manifest,
        })
    }
}
