//! Stored video assets that can be restreamed by name.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{RelayError, Result};

/// Source of raw asset bytes, looked up by name.
#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn fetch(&self, name: &str) -> Result<Bytes>;
}

/// Assets stored as files under one directory.
///
/// Names must be relative paths that stay inside the root.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        let contained = !name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !contained {
            return Err(RelayError::InvalidAssetName(name.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl AssetStore for DirectoryStore {
    async fn fetch(&self, name: &str) -> Result<Bytes> {
        let path = self.resolve(name)?;
        match tokio::fs::read(&path).await {
            Ok(data) => {
                tracing::debug!(name, bytes = data.len(), "asset loaded");
                Ok(Bytes::from(data))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RelayError::AssetNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("relay-assets-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn fetches_files_under_root() {
        let dir = scratch_dir();
        std::fs::create_dir_all(dir.join("clips")).unwrap();
        std::fs::write(dir.join("clips/a.h264"), b"\x00\x00\x00\x01\x67").unwrap();

        let store = DirectoryStore::new(&dir);
        let data = store.fetch("clips/a.h264").await.unwrap();
        assert_eq!(&data[..], b"\x00\x00\x00\x01\x67");

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn missing_asset_is_not_found() {
        let dir = scratch_dir();
        let store = DirectoryStore::new(&dir);
        assert!(matches!(
            store.fetch("nope.mp4").await,
            Err(RelayError::AssetNotFound(name)) if name == "nope.mp4"
        ));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn rejects_names_escaping_root() {
        let store = DirectoryStore::new(std::env::temp_dir());
        for name in ["", "../etc/passwd", "/etc/passwd", "a/../../b", "./clip.mp4"] {
            assert!(
                matches!(store.fetch(name).await, Err(RelayError::InvalidAssetName(_))),
                "{name:?} accepted"
            );
        }
    }
}
