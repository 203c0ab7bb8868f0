use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use easel_contracts::session::{Role, Session};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::context::EngineContext;
use crate::guard::SingleFlight;

pub const SCHEMA_VERSION: u64 = 1;

const INTERRUPTED_ERROR: &str = "Interrupted before completion.";
const INTERRUPTED_CONTENT: &str = "This generation was interrupted and did not finish.";
const UPLOAD_HINT: &str = "sessions";

/// Everything persisted for one session set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableSessionSet {
    pub schema_version: u64,
    pub current_session_id: Option<String>,
    pub sessions: Vec<Session>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReceipt {
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn load(&self, set_id: &str) -> Result<Option<DurableSessionSet>>;

    async fn save(&self, set_id: &str, set: &DurableSessionSet) -> Result<SaveReceipt>;
}

/// Durable copy of a session. Inline payloads above `inline_cap` bytes are
/// left out; the asset stays reachable only through its remote URL.
pub fn to_durable(session: &Session, inline_cap: usize) -> Session {
    let mut durable = session.clone();
    for message in &mut durable.messages {
        if message.inline_len() > inline_cap {
            if message.image_url.is_none() {
                tracing::warn!(
                    target: "persistence",
                    message_id = %message.id,
                    bytes = message.inline_len(),
                    "dropping oversized inline payload without remote copy"
                );
            }
            message.image_data = None;
        }
    }
    if let Some(cached) = durable.cached_image.as_mut() {
        if cached.data.as_ref().map_or(0, String::len) > inline_cap {
            cached.data = None;
        }
    }
    for entry in &mut durable.context.image_history {
        if entry.data.as_ref().map_or(0, String::len) > inline_cap {
            entry.data = None;
        }
    }
    durable
}

/// Loaded form of a persisted session: stale failures are dropped and
/// anything caught mid-generation becomes a terminal "aborted" message.
pub fn from_durable(mut session: Session) -> Session {
    session.messages.retain(|message| {
        if message.role == Role::Error {
            return false;
        }
        let failed = message
            .status
            .as_ref()
            .is_some_and(|status| status.is_terminal_error());
        !(message.role == Role::Assistant && failed && !message.has_renderable_media())
    });
    for message in &mut session.messages {
        let Some(status) = message.status.as_mut() else {
            continue;
        };
        if !status.is_generating {
            continue;
        }
        status.is_generating = false;
        status.progress = 0;
        status.error = Some(INTERRUPTED_ERROR.to_string());
        status.stage = Some("aborted".to_string());
        message.content = INTERRUPTED_CONTENT.to_string();
    }
    session
}

pub fn serialize_set(
    sessions: &[Session],
    current_session_id: Option<String>,
    inline_cap: usize,
) -> DurableSessionSet {
    DurableSessionSet {
        schema_version: SCHEMA_VERSION,
        current_session_id,
        sessions: sessions
            .iter()
            .map(|session| to_durable(session, inline_cap))
            .collect(),
    }
}

pub fn deserialize_set(set: DurableSessionSet) -> (Vec<Session>, Option<String>) {
    let sessions = set.sessions.into_iter().map(from_durable).collect();
    (sessions, set.current_session_id)
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredDocument {
    version: u64,
    updated_at: DateTime<Utc>,
    data: DurableSessionSet,
}

/// One pretty-printed JSON document per session set.
#[derive(Debug, Clone)]
pub struct FileSessionBackend {
    dir: PathBuf,
}

impl FileSessionBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, set_id: &str) -> PathBuf {
        let name: String = set_id
            .chars()
            .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' { ch } else { '_' })
            .collect();
        self.dir.join(format!("{name}.sessions.json"))
    }

    async fn read_document(path: &Path) -> Result<Option<StoredDocument>> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(None);
        }
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed reading {}", path.display()))?;
        let document = serde_json::from_str(&raw)
            .with_context(|| format!("invalid session document {}", path.display()))?;
        Ok(Some(document))
    }
}

#[async_trait]
impl SessionBackend for FileSessionBackend {
    async fn load(&self, set_id: &str) -> Result<Option<DurableSessionSet>> {
        let path = self.path_for(set_id);
        Ok(Self::read_document(&path).await?.map(|document| document.data))
    }

    async fn save(&self, set_id: &str, set: &DurableSessionSet) -> Result<SaveReceipt> {
        let path = self.path_for(set_id);
        let previous = Self::read_document(&path)
            .await
            .ok()
            .flatten()
            .map_or(0, |document| document.version);
        let document = StoredDocument {
            version: previous + 1,
            updated_at: Utc::now(),
            data: set.clone(),
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
        tokio::fs::write(&path, serde_json::to_string_pretty(&document)?)
            .await
            .with_context(|| format!("failed writing {}", path.display()))?;
        Ok(SaveReceipt {
            version: document.version,
            updated_at: document.updated_at,
        })
    }
}

#[derive(Debug, Default)]
pub struct MemorySessionBackend {
    documents: Mutex<BTreeMap<String, (SaveReceipt, DurableSessionSet)>>,
    saves: AtomicUsize,
}

impl MemorySessionBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn stored(&self, set_id: &str) -> Option<DurableSessionSet> {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(set_id)
            .map(|(_, set)| set.clone())
    }
}

#[async_trait]
impl SessionBackend for MemorySessionBackend {
    async fn load(&self, set_id: &str) -> Result<Option<DurableSessionSet>> {
        Ok(self.stored(set_id))
    }

    async fn save(&self, set_id: &str, set: &DurableSessionSet) -> Result<SaveReceipt> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        let mut documents = self.documents.lock().unwrap_or_else(PoisonError::into_inner);
        let version = documents
            .get(set_id)
            .map_or(0, |(receipt, _)| receipt.version)
            + 1;
        let receipt = SaveReceipt {
            version,
            updated_at: Utc::now(),
        };
        documents.insert(set_id.to_string(), (receipt.clone(), set.clone()));
        Ok(receipt)
    }
}

/// Debounced, upload-aware writer between the store and a backend.
pub struct Persister {
    ctx: Arc<EngineContext>,
    backend: Arc<dyn SessionBackend>,
    set_id: String,
    flush_guard: SingleFlight,
    hydrating: AtomicBool,
    last_receipt: Mutex<Option<SaveReceipt>>,
}

impl Persister {
    pub fn new(
        ctx: Arc<EngineContext>,
        backend: Arc<dyn SessionBackend>,
        set_id: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            backend,
            set_id: set_id.into(),
            flush_guard: SingleFlight::new("persist-flush"),
            hydrating: AtomicBool::new(false),
            last_receipt: Mutex::new(None),
        })
    }

    pub fn last_receipt(&self) -> Option<SaveReceipt> {
        self.last_receipt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_hydrating(&self) -> bool {
        self.hydrating.load(Ordering::SeqCst)
    }

    /// Loads the set into the store. Writes are suppressed meanwhile and
    /// the load itself never marks the store dirty.
    pub async fn hydrate(&self) -> Result<usize> {
        self.hydrating.store(true, Ordering::SeqCst);
        let loaded = self.backend.load(&self.set_id).await;
        let result = loaded.map(|maybe_set| {
            let Some(set) = maybe_set else {
                return 0;
            };
            if set.schema_version > SCHEMA_VERSION {
                tracing::warn!(
                    target: "persistence",
                    schema_version = set.schema_version,
                    "session set written by a newer schema"
                );
            }
            let (sessions, current) = deserialize_set(set);
            let count = sessions.len();
            self.ctx.store.hydrate(sessions, current);
            count
        });
        self.hydrating.store(false, Ordering::SeqCst);
        let count = result.with_context(|| format!("failed loading session set '{}'", self.set_id))?;
        tracing::info!(target: "persistence", set_id = %self.set_id, sessions = count, "hydrated");
        Ok(count)
    }

    /// Uploads pending inline payloads, then writes the durable form.
    /// Returns `None` when skipped: during hydration, while another flush
    /// runs, or while legacy migration outlasts the backoff.
    pub async fn flush(&self) -> Result<Option<SaveReceipt>> {
        if self.is_hydrating() {
            tracing::debug!(target: "persistence", "flush suppressed during hydration");
            return Ok(None);
        }
        let Some(_permit) = self.flush_guard.try_begin() else {
            return Ok(None);
        };
        if !self.wait_for_migration().await {
            tracing::debug!(target: "persistence", "flush deferred; migration still running");
            return Ok(None);
        }

        let set = self.serialize().await;
        let receipt = self
            .backend
            .save(&self.set_id, &set)
            .await
            .with_context(|| format!("failed saving session set '{}'", self.set_id))?;
        tracing::debug!(
            target: "persistence",
            set_id = %self.set_id,
            version = receipt.version,
            "session set saved"
        );
        *self
            .last_receipt
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(receipt.clone());
        Ok(Some(receipt))
    }

    /// Durable form of every session, after pushing any inline payload
    /// that still lacks a remote copy.
    pub async fn serialize(&self) -> DurableSessionSet {
        let ctx = &self.ctx;
        ctx.assets.wait_for_uploads().await;
        for session in ctx.store.sessions() {
            for message in &session.messages {
                if message.image_url.is_some() {
                    continue;
                }
                let Some(data) = message.image_data.as_deref() else {
                    continue;
                };
                if let Some(url) = ctx.assets.upload_data_url(data, UPLOAD_HINT).await {
                    ctx.assets.attach_remote_url(&message.id, &url);
                }
            }
        }
        let cap = ctx.config().assets.durable_inline_cap_bytes;
        serialize_set(&ctx.store.sessions(), ctx.store.current_session_id(), cap)
    }

    /// Saves once the store has been quiet for the debounce window.
    pub fn spawn_autosave(self: &Arc<Self>) -> JoinHandle<()> {
        let persister = Arc::clone(self);
        let mut revisions = persister.ctx.store.revisions();
        tokio::spawn(async move {
            let debounce = persister.ctx.config().timing.persist_debounce();
            let clock = Arc::clone(&persister.ctx.clock);
            loop {
                if revisions.changed().await.is_err() {
                    return;
                }
                loop {
                    tokio::select! {
                        changed = revisions.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = clock.sleep(debounce) => break,
                    }
                }
                if let Err(err) = persister.flush().await {
                    tracing::warn!(target: "persistence", error = %format!("{err:#}"), "autosave failed");
                }
            }
        })
    }

    async fn wait_for_migration(&self) -> bool {
        let timing = self.ctx.config().timing;
        let mut attempts = 0;
        while self.ctx.assets.is_migrating() {
            if attempts >= timing.migration_backoff_attempts {
                return false;
            }
            attempts += 1;
            self.ctx.clock.sleep(timing.migration_backoff()).await;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use easel_contracts::session::{
        GenerationStatus, Message, MessageDraft, Role, Session, StatusPatch,
    };

    use super::{
        deserialize_set, serialize_set, FileSessionBackend, MemorySessionBackend, Persister,
        SessionBackend,
    };
    use crate::context::testing::harness;
    use crate::providers::testing::{image_success, ScriptedProvider};

    fn message(id: &str, role: Role, content: &str) -> Message {
        Message {
            id: id.to_string(),
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
            image_data: None,
            image_url: None,
            thumbnail: None,
            video_url: None,
            expects_image_output: false,
            expects_video_output: false,
            status: None,
            group: None,
            operation: None,
            provider: None,
        }
    }

    fn failed() -> Option<GenerationStatus> {
        let mut status = GenerationStatus::queued();
        status.apply(&StatusPatch::failed("boom"));
        Some(status)
    }

    fn mixed_session() -> Session {
        let mut session = Session::new("s1", "Moodboard", Utc::now());
        session.messages.push(message("user", Role::User, "draw"));
        let mut ok = message("ok", Role::Assistant, "here");
        ok.image_url = Some("https://cdn/ok.png".to_string());
        ok.status = Some(GenerationStatus {
            is_generating: false,
            progress: 100,
            error: None,
            stage: Some("complete".to_string()),
        });
        session.messages.push(ok);
        session.messages.push(message("err", Role::Error, "oops"));
        let mut stale = message("stale", Role::Assistant, "Generation failed");
        stale.status = failed();
        session.messages.push(stale);
        let mut kept = message("kept", Role::Assistant, "partial");
        kept.status = failed();
        kept.image_url = Some("https://cdn/kept.png".to_string());
        session.messages.push(kept);
        let mut pending = message("pending", Role::Assistant, "Working...");
        pending.status = Some(GenerationStatus::queued());
        session.messages.push(pending);
        session
    }

    #[test]
    fn roundtrip_drops_only_stale_failures() {
        let set = serialize_set(&[mixed_session()], Some("s1".to_string()), 1024);
        let (sessions, current) = deserialize_set(set);
        assert_eq!(current.as_deref(), Some("s1"));
        let ids: Vec<_> = sessions[0].messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["user", "ok", "kept", "pending"]);

        let pending = sessions[0].message("pending").expect("pending");
        let status = pending.status.clone().expect("status");
        assert!(!status.is_generating);
        assert_eq!(status.stage.as_deref(), Some("aborted"));
        assert!(status.error.is_some());
        assert!(pending.content.contains("interrupted"));
        assert_eq!(sessions[0].message("ok"), mixed_session().message("ok"));
    }

    #[test]
    fn oversized_inline_payloads_are_left_out() {
        let mut session = Session::new("s1", "Big", Utc::now());
        let mut big = message("big", Role::Assistant, "huge");
        big.image_data = Some("x".repeat(2048));
        let mut small = message("small", Role::Assistant, "tiny");
        small.image_data = Some("y".repeat(16));
        session.messages.push(big);
        session.messages.push(small);

        let set = serialize_set(&[session], None, 1024);
        let messages = &set.sessions[0].messages;
        assert_eq!(messages[0].image_data, None);
        assert_eq!(messages[1].image_data.as_deref().map(str::len), Some(16));
    }

    #[tokio::test]
    async fn file_backend_versions_each_save() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let backend = FileSessionBackend::new(temp.path());
        assert!(backend.load("default").await?.is_none());

        let set = serialize_set(&[mixed_session()], Some("s1".to_string()), 1024);
        let first = backend.save("default", &set).await?;
        let second = backend.save("default", &set).await?;
        assert_eq!((first.version, second.version), (1, 2));
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(backend.load("default").await?, Some(set));
        assert!(backend.path_for("default").exists());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn serialize_uploads_inline_payloads_first() -> anyhow::Result<()> {
        let h = harness("gemini", ScriptedProvider::new("gemini", |_, _| image_success()));
        let message = h.ctx.store.add_message(MessageDraft {
            image_data: Some("data:image/png;base64,AAAA".to_string()),
            ..MessageDraft::assistant("legacy")
        });
        let backend = Arc::new(MemorySessionBackend::new());
        let persister = Persister::new(h.ctx.clone(), backend.clone(), "default");

        let receipt = persister.flush().await?.expect("saved");
        assert_eq!(receipt.version, 1);
        let stored = backend.stored("default").expect("stored");
        let durable = stored.sessions[0].message(&message.id).expect("message");
        assert!(durable.image_url.as_deref().is_some_and(|u| u.starts_with("mem://")));
        assert!(h.ctx.store.message(&message.id).and_then(|m| m.image_url).is_some());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn autosave_coalesces_bursts() -> anyhow::Result<()> {
        let h = harness("gemini", ScriptedProvider::new("gemini", |_, _| image_success()));
        let backend = Arc::new(MemorySessionBackend::new());
        let persister = Persister::new(h.ctx.clone(), backend.clone(), "default");
        let autosave = persister.spawn_autosave();

        for index in 0..5 {
            h.ctx.store.add_message(MessageDraft::user(format!("note {index}")));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(backend.save_count(), 1);
        let stored = backend.stored("default").expect("stored");
        assert_eq!(stored.sessions[0].messages.len(), 5);

        h.ctx.store.add_message(MessageDraft::user("later"));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(backend.save_count(), 2);
        autosave.abort();
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn hydrate_loads_without_echoing_a_save() -> anyhow::Result<()> {
        let backend = Arc::new(MemorySessionBackend::new());
        let set = serialize_set(&[mixed_session()], Some("s1".to_string()), 1024);
        backend.save("default", &set).await?;

        let h = harness("gemini", ScriptedProvider::new("gemini", |_, _| image_success()));
        let persister = Persister::new(h.ctx.clone(), backend.clone(), "default");
        let autosave = persister.spawn_autosave();

        assert_eq!(persister.hydrate().await?, 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(backend.save_count(), 1);
        let snapshot = h.ctx.store.snapshot();
        assert_eq!(snapshot.session_id.as_deref(), Some("s1"));
        assert_eq!(snapshot.messages.len(), 4);
        autosave.abort();
        Ok(())
    }
}
