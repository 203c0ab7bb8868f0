use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::media::extension_for_mime;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UploadOutcome {
    pub success: bool,
    pub url: Option<String>,
    pub error: Option<String>,
}

impl UploadOutcome {
    pub fn uploaded(url: impl Into<String>) -> Self {
        Self {
            success: true,
            url: Some(url.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            url: None,
            error: Some(error.into()),
        }
    }

    /// The durable URL, only when the upload really produced one.
    pub fn into_url(self) -> Option<String> {
        if !self.success {
            return None;
        }
        self.url.filter(|url| !url.trim().is_empty())
    }
}

/// Durable storage for binary payloads.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, mime: &str, destination_hint: &str) -> UploadOutcome;
}

fn content_name(bytes: &[u8], mime: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{}.{}", hex::encode(hasher.finalize()), extension_for_mime(mime))
}

fn sanitize_hint(hint: &str) -> String {
    let cleaned: String = hint
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "misc".to_string()
    } else {
        cleaned
    }
}

/// Content-addressed files under a root directory, exposed as `file://`
/// URLs.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn write(&self, bytes: &[u8], mime: &str, hint: &str) -> Result<PathBuf> {
        let dir = self.root.join(sanitize_hint(hint));
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed creating {}", dir.display()))?;
        let path = dir.join(content_name(bytes, mime));
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(path);
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed writing {}", path.display()))?;
        Ok(path)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn upload(&self, bytes: Vec<u8>, mime: &str, destination_hint: &str) -> UploadOutcome {
        match self.write(&bytes, mime, destination_hint).await {
            Ok(path) => UploadOutcome::uploaded(format!("file://{}", path.display())),
            Err(err) => {
                tracing::warn!(target: "assets", error = %format!("{err:#}"), "blob write failed");
                UploadOutcome::failed(format!("{err:#}"))
            }
        }
    }
}

/// In-process blob store. Uploads can be slowed down or made to fail.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    latency: Mutex<Option<Duration>>,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        let store = Self::default();
        *store.latency.lock().unwrap_or_else(PoisonError::into_inner) = Some(latency);
        store
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn stored(&self) -> usize {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn get(&self, url: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, bytes: Vec<u8>, mime: &str, destination_hint: &str) -> UploadOutcome {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return UploadOutcome::failed("blob store unavailable");
        }
        let url = format!(
            "mem://{}/{}",
            sanitize_hint(destination_hint),
            content_name(&bytes, mime)
        );
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.clone(), bytes);
        UploadOutcome::uploaded(url)
    }
}

#[cfg(test)]
mod tests {
    use super::{BlobStore, FsBlobStore, MemoryBlobStore, UploadOutcome};

    #[tokio::test]
    async fn fs_store_is_content_addressed() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = FsBlobStore::new(temp.path());
        let first = store
            .upload(b"pixels".to_vec(), "image/png", "messages")
            .await;
        let second = store
            .upload(b"pixels".to_vec(), "image/png", "messages")
            .await;
        assert!(first.success);
        assert_eq!(first.url, second.url);

        let url = first.into_url().expect("url");
        let path = url.trim_start_matches("file://");
        assert!(path.ends_with(".png"));
        assert_eq!(std::fs::read(path)?, b"pixels");
        Ok(())
    }

    #[tokio::test]
    async fn memory_store_can_fail() {
        let store = MemoryBlobStore::new();
        store.set_failing(true);
        let outcome = store.upload(vec![1, 2, 3], "image/png", "x").await;
        assert_eq!(outcome, UploadOutcome::failed("blob store unavailable"));
        assert_eq!(outcome.into_url(), None);

        store.set_failing(false);
        let url = store
            .upload(vec![1, 2, 3], "image/png", "x")
            .await
            .into_url()
            .expect("url");
        assert!(url.starts_with("mem://x/"));
        assert_eq!(store.get(&url), Some(vec![1, 2, 3]));
        assert_eq!(store.attempts(), 2);
    }
}
