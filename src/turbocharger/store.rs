//! CAS implementations — disk store for cache tiers and the file:// remote

use super::{Cas, CasError, ObjectId};
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use std::path::{Path, PathBuf};

/// A store using the filesystem as the backing store for objects.
/// Used for the local cache tiers and the `file://` remote.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, id: ObjectId) -> PathBuf {
        self.dir.join(id.to_string())
    }
}

#[async_trait]
impl Cas for FileStore {
    async fn get_object(&self, id: ObjectId) -> Result<Bytes, CasError> {
        match tokio::fs::read(self.path(id)).await {
            Ok(content) => Ok(Bytes::from(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CasError::NotFound),
            Err(e) => Err(CasError::Other(e.to_string())),
        }
    }

    async fn insert_object(
        &self,
        id: ObjectId,
        content: Bytes,
        _content_type: &str,
    ) -> Result<(), CasError> {
        let target = self.path(id);

        // content addressing makes inserts idempotent
        if tokio::fs::try_exists(&target)
            .await
            .map_err(|e| CasError::Other(e.to_string()))?
        {
            return Ok(());
        }

        // write-then-rename, so readers only observe complete objects
        let tmp = temp_sibling(&target);
        tokio::fs::write(&tmp, &content)
            .await
            .map_err(|e| CasError::Other(e.to_string()))?;
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(|e| CasError::Other(e.to_string()))
    }
}

fn temp_sibling(target: &Path) -> PathBuf {
    let nonce: u64 = rand::thread_rng().gen();
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.tmp-{:016x}", name, nonce))
}


#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("cas")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (_dir, store) = store();
        let id = ObjectId::from_content(b"nope");
        assert!(matches!(store.get_object(id).await, Err(CasError::NotFound)));
    }

    #[tokio::test]
    async fn test_insert_then_get() {
        let (_dir, store) = store();
        let id = ObjectId::from_content(b"payload");
        store
            .insert_object(id, Bytes::from_static(b"payload"), "text/plain")
            .await
            .unwrap();

        let read = store.get_object(id).await.unwrap();
        assert_eq!(read, Bytes::from_static(b"payload"));
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let (_dir, store) = store();
        let id = ObjectId::from_content(b"payload");
        store
            .insert_object(id, Bytes::from_static(b"payload"), "text/plain")
            .await
            .unwrap();
        // second insert is a no-op, not an error
        store
            .insert_object(id, Bytes::from_static(b"payload"), "text/plain")
            .await
            .unwrap();

        assert_eq!(store.get_object(id).await.unwrap(), Bytes::from_static(b"payload"));
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let (_dir, store) = store();
        let id = ObjectId::from_content(b"x");
        store
            .insert_object(id, Bytes::from_static(b"x"), "text/plain")
            .await
            .unwrap();

        let entries: Vec<_> = std::fs::read_dir(&store.dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec![id.to_string()]);
    }
}
