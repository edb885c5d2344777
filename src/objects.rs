//! Object storage for uploaded files.
//!
//! Paths are relative, `/`-separated keys such as
//! `<agent_id>/<source_id>/<file_name>`. [`LocalObjectStore`] maps them under
//! a root directory and refuses keys that would resolve outside it.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::debug;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, bytes: &[u8], path: &str) -> Result<()>;

    async fn download(&self, path: &str) -> Result<Vec<u8>>;

    /// Returns `false` if nothing was stored at `path`.
    async fn delete(&self, path: &str) -> Result<bool>;
}

pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty() {
            bail!("object path must not be empty");
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => bail!("object path escapes the storage root: {}", key),
            }
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn upload(&self, bytes: &[u8], path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        tokio::fs::write(&target, bytes)
            .await
            .with_context(|| format!("Failed to write object: {}", target.display()))?;
        debug!(path, bytes = bytes.len(), "object stored");
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let target = self.resolve(path)?;
        tokio::fs::read(&target)
            .await
            .with_context(|| format!("Failed to read object: {}", target.display()))
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to delete object: {}", target.display()))
            }
        }
    }
}

/// Storage key for a file uploaded to a source.
pub fn object_key(agent_id: &str, source_id: &str, file_name: &str) -> String {
    let name = Path::new(file_name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("upload");
    format!("{}/{}/{}", agent_id, source_id, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_download_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());

        store.upload(b"hello", "agent/src/notes.txt").await.unwrap();
        assert_eq!(store.download("agent/src/notes.txt").await.unwrap(), b"hello");
        assert!(dir.path().join("agent/src/notes.txt").exists());

        assert!(store.delete("agent/src/notes.txt").await.unwrap());
        assert!(!store.delete("agent/src/notes.txt").await.unwrap());
        assert!(store.download("agent/src/notes.txt").await.is_err());
    }

    #[tokio::test]
    async fn escaping_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        for bad in ["../outside.txt", "/etc/passwd", "a/../../b", "./a", ""] {
            assert!(store.upload(b"x", bad).await.is_err(), "{}", bad);
        }
    }

    #[test]
    fn keys_keep_only_the_file_name() {
        assert_eq!(object_key("a", "s", "report.pdf"), "a/s/report.pdf");
        assert_eq!(object_key("a", "s", "../../etc/passwd"), "a/s/passwd");
        assert_eq!(object_key("a", "s", ""), "a/s/upload");
    }
}
