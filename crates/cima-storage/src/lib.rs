//! Attachment materialization, atomic file replacement and HTTP blob fetching.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use cima_core::{EntityKind, ATTACHMENT_EXTENSION};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

mod fetch;

pub use fetch::{BackoffPolicy, BlobSource, FetchError, HttpClientConfig, HttpFetcher, RetryDisposition};

pub const CRATE_NAME: &str = "cima-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn temp_sibling(path: &Path) -> anyhow::Result<PathBuf> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    Ok(parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4())))
}

/// Replace `path` with bytes written by `write`, via a temp file in the same directory
/// and a rename. On any failure the temp file is removed and `path` is left untouched.
pub fn replace_atomically<F>(path: &Path, write: F) -> anyhow::Result<()>
where
    F: FnOnce(&mut std::fs::File) -> anyhow::Result<()>,
{
    let temp_path = temp_sibling(path)?;
    let result = (|| {
        let mut file = std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        write(&mut file)?;
        file.flush()
            .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
        drop(file);
        std::fs::rename(&temp_path, path).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        })
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    result
}

/// Async counterpart of [`replace_atomically`] for an in-memory payload.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let temp_path = temp_sibling(path)?;

    let written: anyhow::Result<()> = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
        drop(file);
        fs::rename(&temp_path, path).await.with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        })
    }
    .await;

    if written.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    written
}

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("downloading {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("storing attachment at {path}: {source:#}")]
    Io {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

/// Deterministic on-disk layout for downloaded attachments.
#[derive(Debug, Clone)]
pub struct AttachmentStore {
    root: PathBuf,
}

impl AttachmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<kind dir>/<id>.pdf`, independent of the remote file name.
    pub fn path_for(&self, kind: EntityKind, id: &str) -> PathBuf {
        self.root
            .join(kind.attachment_dir())
            .join(format!("{id}.{ATTACHMENT_EXTENSION}"))
    }

    /// Download `url` and overwrite the attachment slot for `(kind, id)`.
    /// Re-fetches unconditionally; returns the local path to record on the entity.
    pub async fn materialize(
        &self,
        source: &dyn BlobSource,
        kind: EntityKind,
        id: &str,
        url: &str,
    ) -> Result<PathBuf, AttachmentError> {
        let path = self.path_for(kind, id);
        info!(%kind, record_id = id, path = %path.display(), "found attachment, downloading");

        let bytes = source
            .fetch_blob(url)
            .await
            .map_err(|source| AttachmentError::Fetch {
                url: url.to_string(),
                source,
            })?;

        let io_err = |source: anyhow::Error| AttachmentError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating attachment directory {}", parent.display()))
                .map_err(io_err)?;
        }
        write_atomic(&path, &bytes).await.map_err(io_err)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tempfile::tempdir;

    struct StaticBlobs(HashMap<String, Vec<u8>>);

    #[async_trait]
    impl BlobSource for StaticBlobs {
        async fn fetch_blob(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            self.0.get(url).cloned().ok_or_else(|| FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })
        }
    }

    fn blobs(entries: &[(&str, &[u8])]) -> StaticBlobs {
        StaticBlobs(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_vec()))
                .collect(),
        )
    }

    #[test]
    fn sha256_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn attachment_path_ignores_remote_file_name() {
        let store = AttachmentStore::new("/srv/cima");
        assert_eq!(
            store.path_for(EntityKind::Documents, "rec123"),
            PathBuf::from("/srv/cima/data/rec123.pdf")
        );
        assert_eq!(
            store.path_for(EntityKind::Events, "recE"),
            PathBuf::from("/srv/cima/events/recE.pdf")
        );
        assert_eq!(
            store.path_for(EntityKind::People, "recP"),
            PathBuf::from("/srv/cima/people/recP.pdf")
        );
    }

    #[tokio::test]
    async fn materialize_creates_directory_and_overwrites() {
        let dir = tempdir().expect("tempdir");
        let store = AttachmentStore::new(dir.path());

        let first = store
            .materialize(
                &blobs(&[("https://files.example/report-v1.pdf", b"v1")]),
                EntityKind::Documents,
                "rec123",
                "https://files.example/report-v1.pdf",
            )
            .await
            .expect("first download");
        assert_eq!(first, dir.path().join("data/rec123.pdf"));
        assert_eq!(std::fs::read(&first).unwrap(), b"v1");

        let second = store
            .materialize(
                &blobs(&[("https://files.example/other-name.pdf", b"v2")]),
                EntityKind::Documents,
                "rec123",
                "https://files.example/other-name.pdf",
            )
            .await
            .expect("second download");
        assert_eq!(first, second);
        assert_eq!(std::fs::read(&second).unwrap(), b"v2");
    }

    #[tokio::test]
    async fn failed_download_leaves_previous_file() {
        let dir = tempdir().expect("tempdir");
        let store = AttachmentStore::new(dir.path());
        let ok = blobs(&[("https://files.example/a.pdf", b"kept")]);
        let path = store
            .materialize(&ok, EntityKind::Events, "recE", "https://files.example/a.pdf")
            .await
            .expect("download");

        let err = store
            .materialize(&ok, EntityKind::Events, "recE", "https://files.example/missing.pdf")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AttachmentError::Fetch {
                source: FetchError::HttpStatus { status: 404, .. },
                ..
            }
        ));
        assert_eq!(std::fs::read(&path).unwrap(), b"kept");
    }

    #[tokio::test]
    async fn write_atomic_replaces_in_place_without_leftovers() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("recP.pdf");
        std::fs::write(&target, b"old photo").unwrap();

        write_atomic(&target, b"new photo").await.expect("write");
        assert_eq!(std::fs::read(&target).unwrap(), b"new photo");
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("recP.pdf")]);
    }

    #[test]
    fn failed_replacement_keeps_target_and_cleans_temp() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("data.parquet");
        std::fs::write(&target, b"previous").unwrap();

        let err = replace_atomically(&target, |file| {
            file.write_all(b"half")?;
            anyhow::bail!("disk full")
        })
        .unwrap_err();
        assert!(err.to_string().contains("disk full"));
        assert_eq!(std::fs::read(&target).unwrap(), b"previous");

        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
