pub mod blob;
pub mod media;

use std::sync::{Arc, Mutex, PoisonError};

use easel_contracts::events::ImageSource;
use easel_contracts::session::{ImageHistoryEntry, Message};
use easel_contracts::RequestKind;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::config::{AssetConfig, TimingConfig};
use crate::guard::SingleFlight;
use crate::store::SessionStore;

pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore, UploadOutcome};

const RESULT_HINT: &str = "results";
const LEGACY_HINT: &str = "legacy";

/// Provenance of a freshly produced asset.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultContext {
    pub prompt: String,
    pub operation: RequestKind,
    pub parent_image_id: Option<String>,
}

/// Identifiers known at registration time. The remote URL normally
/// arrives later through the background upload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RegisteredAsset {
    pub remote_url: Option<String>,
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    Completed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub status: MigrationStatus,
    pub scanned: usize,
    pub uploaded: usize,
    pub failed: usize,
}

impl MigrationReport {
    fn skipped() -> Self {
        Self {
            status: MigrationStatus::Skipped,
            scanned: 0,
            uploaded: 0,
            failed: 0,
        }
    }
}

/// Picks what the canvas should draw: normalized inline data first, then
/// a remote URL. `None` means there is nothing to draw.
pub fn resolve_for_placement(inline: Option<&str>, remote: Option<&str>) -> Option<ImageSource> {
    if let Some(data) = inline.and_then(media::normalize_inline) {
        return Some(ImageSource::Inline { data });
    }
    remote
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(|url| ImageSource::Remote {
            url: url.to_string(),
        })
}

/// Owns the inline/remote representations of produced media.
///
/// It only mutates fields of existing messages (remote URL, thumbnail,
/// inline payload); message lifetimes stay with the store.
pub struct AssetManager {
    store: Arc<SessionStore>,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    config: AssetConfig,
    timing: TimingConfig,
    uploads: Mutex<Vec<JoinHandle<()>>>,
    migration: SingleFlight,
}

impl AssetManager {
    pub fn new(
        store: Arc<SessionStore>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        config: AssetConfig,
        timing: TimingConfig,
    ) -> Self {
        Self {
            store,
            blobs,
            clock,
            config,
            timing,
            uploads: Mutex::new(Vec::new()),
            migration: SingleFlight::new("legacy-migration"),
        }
    }

    pub fn is_migrating(&self) -> bool {
        self.migration.is_running()
    }

    /// Thumbnails the payload, appends a history entry and starts the
    /// upload in the background. Returns without waiting for the upload.
    pub fn register_result(
        self: &Arc<Self>,
        message_id: &str,
        data: &str,
        context: &ResultContext,
    ) -> RegisteredAsset {
        let Some(data_url) = media::normalize_inline(data) else {
            tracing::debug!(target: "assets", message_id, "result carries no inline payload");
            return RegisteredAsset::default();
        };
        let thumbnail = match media::make_thumbnail(&data_url, self.config.thumbnail_max_dim) {
            Ok(thumbnail) => Some(thumbnail),
            Err(err) => {
                tracing::debug!(target: "assets", message_id, error = %err, "no thumbnail");
                None
            }
        };
        if let Some(thumbnail) = thumbnail.clone() {
            self.store.update_message(message_id, |message| {
                message.thumbnail = Some(thumbnail);
            });
        }
        self.store.push_history(
            message_id,
            ImageHistoryEntry {
                id: message_id.to_string(),
                prompt: context.prompt.clone(),
                operation: context.operation,
                thumbnail: thumbnail.clone(),
                url: None,
                data: Some(data_url.clone()),
                parent_image_id: context.parent_image_id.clone(),
                timestamp: self.clock.now(),
            },
        );

        let manager = Arc::clone(self);
        let id = message_id.to_string();
        let handle = tokio::spawn(async move {
            let Some(url) = manager.upload_data_url(&data_url, RESULT_HINT).await else {
                return;
            };
            manager.attach_remote_url(&id, &url);
            let demoter = Arc::clone(&manager);
            tokio::spawn(async move {
                demoter.demote(&id).await;
            });
        });
        self.track(handle);

        RegisteredAsset {
            remote_url: None,
            thumbnail,
        }
    }

    pub fn resolve_for_placement(
        &self,
        inline: Option<&str>,
        remote: Option<&str>,
    ) -> Option<ImageSource> {
        resolve_for_placement(inline, remote)
    }

    /// Drops the inline payload once a thumbnail and a remote URL exist
    /// and the payload outweighs the thumbnail. Preconditions are checked
    /// again after the grace delay.
    pub async fn demote(&self, message_id: &str) -> bool {
        let Some(message) = self.store.message(message_id) else {
            return false;
        };
        if !demotable(&message) {
            tracing::debug!(target: "assets", message_id, "demotion skipped");
            return false;
        }
        self.clock.sleep(self.timing.demote_grace()).await;
        let mut demoted = false;
        self.store.update_message(message_id, |message| {
            if demotable(message) {
                message.image_data = None;
                demoted = true;
            }
        });
        if demoted {
            tracing::debug!(target: "assets", message_id, "inline payload demoted");
        }
        demoted
    }

    /// Uploads `data` right away and returns its URL.
    pub async fn upload_data_url(&self, data: &str, destination_hint: &str) -> Option<String> {
        let (bytes, mime) = match media::decode_data_url(data) {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::debug!(target: "assets", error = %err, "payload is not uploadable");
                return None;
            }
        };
        let outcome = self.blobs.upload(bytes, &mime, destination_hint).await;
        if let Some(error) = outcome.error.as_deref() {
            tracing::warn!(target: "assets", error, "upload failed");
        }
        outcome.into_url()
    }

    /// Writes `url` into the message, its history entry and the cached
    /// image that came from it. Visible content is left alone.
    pub fn attach_remote_url(&self, message_id: &str, url: &str) {
        self.store.update_message(message_id, |message| {
            message.image_url = Some(url.to_string());
        });
        self.store.update_session_of(message_id, |session| {
            for entry in session
                .context
                .image_history
                .iter_mut()
                .filter(|entry| entry.id == message_id)
            {
                entry.url = Some(url.to_string());
            }
            if let Some(cached) = session
                .cached_image
                .as_mut()
                .filter(|cached| cached.id == message_id)
            {
                cached.url = Some(url.to_string());
            }
        });
        tracing::debug!(target: "assets", message_id, "remote url attached");
    }

    /// Waits for every background upload started so far.
    pub async fn wait_for_uploads(&self) {
        loop {
            let pending: Vec<_> = {
                let mut uploads = self.uploads.lock().unwrap_or_else(PoisonError::into_inner);
                uploads.drain(..).collect()
            };
            if pending.is_empty() {
                return;
            }
            for handle in pending {
                if let Err(err) = handle.await {
                    tracing::warn!(target: "assets", error = %err, "upload task failed");
                }
            }
        }
    }

    /// One-shot scan for oversized inline payloads without a remote URL.
    /// A concurrent call is skipped; a second call finds nothing to do.
    pub async fn migrate_legacy(&self) -> MigrationReport {
        let Some(_permit) = self.migration.try_begin() else {
            return MigrationReport::skipped();
        };
        let threshold = self.config.migration_threshold_bytes;
        let mut report = MigrationReport {
            status: MigrationStatus::Completed,
            scanned: 0,
            uploaded: 0,
            failed: 0,
        };

        for session in self.store.sessions() {
            let candidates = session
                .messages
                .iter()
                .filter(|message| message.image_url.is_none() && message.inline_len() > threshold)
                .filter_map(|message| {
                    message
                        .image_data
                        .clone()
                        .map(|data| (message.id.clone(), data))
                });
            let history = session
                .context
                .image_history
                .iter()
                .filter(|entry| {
                    entry.url.is_none()
                        && entry.data.as_ref().map_or(0, String::len) > threshold
                        && session.message(&entry.id).is_none()
                })
                .filter_map(|entry| entry.data.clone().map(|data| (entry.id.clone(), data)));
            let pending: Vec<(String, String)> = candidates.chain(history).collect();

            for (id, data) in pending {
                report.scanned += 1;
                match self.upload_data_url(&data, LEGACY_HINT).await {
                    Some(url) => {
                        report.uploaded += 1;
                        if session.message(&id).is_some() {
                            self.attach_remote_url(&id, &url);
                        } else {
                            self.backfill_history(&session.session_id, &id, &url);
                        }
                    }
                    None => report.failed += 1,
                }
            }
        }
        tracing::info!(
            target: "assets",
            scanned = report.scanned,
            uploaded = report.uploaded,
            failed = report.failed,
            "legacy migration finished"
        );
        report
    }

    fn backfill_history(&self, session_id: &str, entry_id: &str, url: &str) {
        let found = self.store.update_session(session_id, |session| {
            for entry in session
                .context
                .image_history
                .iter_mut()
                .filter(|entry| entry.id == entry_id)
            {
                entry.url = Some(url.to_string());
            }
        });
        if found.is_none() {
            tracing::debug!(target: "assets", session_id, entry_id, "history owner is gone");
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut uploads = self.uploads.lock().unwrap_or_else(PoisonError::into_inner);
        uploads.retain(|handle| !handle.is_finished());
        uploads.push(handle);
    }
}

fn demotable(message: &Message) -> bool {
    let thumbnail_len = match message.thumbnail.as_deref() {
        Some(thumbnail) if !thumbnail.is_empty() => thumbnail.len(),
        _ => return false,
    };
    let has_url = message
        .image_url
        .as_deref()
        .is_some_and(|url| !url.trim().is_empty());
    has_url && message.inline_len() > thumbnail_len
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use easel_contracts::events::{ImageSource, MemorySink};
    use easel_contracts::session::{ImageHistoryEntry, MessageDraft, Session};
    use easel_contracts::RequestKind;

    use super::media::encode_data_url;
    use super::{
        resolve_for_placement, AssetManager, MemoryBlobStore, MigrationStatus, ResultContext,
    };
    use crate::clock::TokioClock;
    use crate::config::{AssetConfig, TimingConfig};
    use crate::store::SessionStore;

    fn fixture(blobs: Arc<MemoryBlobStore>) -> (Arc<SessionStore>, Arc<AssetManager>) {
        let store = Arc::new(SessionStore::new(
            Arc::new(MemorySink::new()),
            Arc::new(TokioClock),
        ));
        let config = AssetConfig {
            migration_threshold_bytes: 16,
            ..AssetConfig::default()
        };
        let assets = Arc::new(AssetManager::new(
            store.clone(),
            blobs,
            Arc::new(TokioClock),
            config,
            TimingConfig::default(),
        ));
        (store, assets)
    }

    fn context() -> ResultContext {
        ResultContext {
            prompt: "a red cube".to_string(),
            operation: RequestKind::Generate,
            parent_image_id: None,
        }
    }

    #[test]
    fn placement_prefers_inline_then_remote() {
        let inline = encode_data_url(b"\x89PNGdata", "image/png");
        assert_eq!(
            resolve_for_placement(Some(&inline), Some("https://x/y.png")),
            Some(ImageSource::Inline {
                data: inline.clone()
            })
        );
        assert_eq!(
            resolve_for_placement(Some(""), Some("https://x/y.png")),
            Some(ImageSource::Remote {
                url: "https://x/y.png".to_string()
            })
        );
        assert_eq!(resolve_for_placement(None, Some("  ")), None);
        assert_eq!(resolve_for_placement(None, None), None);
    }

    #[tokio::test(start_paused = true)]
    async fn register_result_uploads_in_background() {
        let blobs = Arc::new(MemoryBlobStore::with_latency(Duration::from_millis(200)));
        let (store, assets) = fixture(blobs.clone());
        let message = store.add_message(MessageDraft::assistant("done"));
        let data = encode_data_url(b"\x89PNGnot-really-decodable", "image/png");
        store.update_message(&message.id, |m| m.image_data = Some(data.clone()));

        let registered = assets.register_result(&message.id, &data, &context());
        assert_eq!(registered.remote_url, None);
        assert!(store.message(&message.id).and_then(|m| m.image_url).is_none());

        assets.wait_for_uploads().await;
        let updated = store.message(&message.id).expect("message");
        assert!(updated.image_url.as_deref().is_some_and(|url| url.starts_with("mem://")));
        assert_eq!(updated.content, "done");
        let session = store.current_session().expect("session");
        assert_eq!(session.context.image_history.len(), 1);
        assert_eq!(session.context.image_history[0].url, updated.image_url);
        assert_eq!(blobs.stored(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn demote_requires_thumbnail_url_and_size_gain() {
        let (store, assets) = fixture(Arc::new(MemoryBlobStore::new()));
        let message = store.add_message(MessageDraft::assistant("done"));
        store.update_message(&message.id, |m| {
            m.image_data = Some("x".repeat(1024));
            m.thumbnail = Some("t".repeat(64));
        });
        assert!(!assets.demote(&message.id).await);

        store.update_message(&message.id, |m| m.image_url = Some("mem://r/1".to_string()));
        assert!(assets.demote(&message.id).await);
        let demoted = store.message(&message.id).expect("message");
        assert_eq!(demoted.image_data, None);
        assert_eq!(demoted.thumbnail.map(|t| t.len()), Some(64));
    }

    #[tokio::test(start_paused = true)]
    async fn legacy_migration_is_idempotent() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let (store, assets) = fixture(blobs.clone());
        let big = store.add_message(MessageDraft::assistant("old"));
        let small = store.add_message(MessageDraft::assistant("tiny"));
        let payload = encode_data_url(&[7u8; 256], "image/png");
        store.update_message(&big.id, |m| m.image_data = Some(payload.clone()));
        store.update_message(&small.id, |m| m.image_data = Some("data:,x".to_string()));

        let first = assets.migrate_legacy().await;
        assert_eq!(first.status, MigrationStatus::Completed);
        assert_eq!((first.scanned, first.uploaded), (1, 1));
        assert!(store.message(&big.id).and_then(|m| m.image_url).is_some());
        assert!(store.message(&small.id).and_then(|m| m.image_url).is_none());

        let second = assets.migrate_legacy().await;
        assert_eq!((second.scanned, second.uploaded), (0, 0));
        assert_eq!(blobs.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn history_only_sessions_are_migrated_once() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let (store, assets) = fixture(blobs.clone());
        let mut session = Session::new("archive", "Archive", Utc::now());
        session.context.image_history.push(ImageHistoryEntry {
            id: "h1".to_string(),
            prompt: "an old sketch".to_string(),
            operation: RequestKind::Generate,
            thumbnail: None,
            url: None,
            data: Some(encode_data_url(&[3u8; 256], "image/png")),
            parent_image_id: None,
            timestamp: Utc::now(),
        });
        store.hydrate(vec![session], None);

        let first = assets.migrate_legacy().await;
        assert_eq!((first.scanned, first.uploaded), (1, 1));
        let archived = store.session("archive").expect("session");
        assert!(archived.messages.is_empty());
        assert!(archived.context.image_history[0]
            .url
            .as_deref()
            .is_some_and(|url| url.starts_with("mem://")));

        let second = assets.migrate_legacy().await;
        assert_eq!((second.scanned, second.uploaded), (0, 0));
        assert_eq!(blobs.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_migration_is_skipped() {
        let blobs = Arc::new(MemoryBlobStore::with_latency(Duration::from_millis(50)));
        let (store, assets) = fixture(blobs);
        let message = store.add_message(MessageDraft::assistant("old"));
        let payload = encode_data_url(&[1u8; 128], "image/png");
        store.update_message(&message.id, |m| m.image_data = Some(payload.clone()));

        let (first, second) = tokio::join!(assets.migrate_legacy(), assets.migrate_legacy());
        assert_eq!(first.status, MigrationStatus::Completed);
        assert_eq!(second.status, MigrationStatus::Skipped);
        assert!(!assets.is_migrating());
    }
}
