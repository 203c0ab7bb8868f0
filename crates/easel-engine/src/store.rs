use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use easel_contracts::events::CanvasEventSink;
use easel_contracts::layout::placeholder_id_for;
use easel_contracts::session::{
    CachedImage, GenerationStatus, ImageHistoryEntry, Message, MessageDraft, OperationRecord,
    Session, StatusPatch,
};
use easel_contracts::RequestKind;
use indexmap::IndexMap;
use tokio::sync::watch;
use uuid::Uuid;

use crate::clock::Clock;

/// What the UI renders: the current session's messages and subject.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionSnapshot {
    pub session_id: Option<String>,
    pub name: String,
    pub messages: Vec<Message>,
    pub cached_image: Option<CachedImage>,
    pub mode: Option<RequestKind>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub session_id: String,
    pub name: String,
    pub message_count: usize,
    pub last_activity: DateTime<Utc>,
    pub is_current: bool,
}

#[derive(Debug, Default)]
struct StoreState {
    sessions: IndexMap<String, Session>,
    current: Option<String>,
}

impl StoreState {
    fn owner_of(&self, message_id: &str) -> Option<String> {
        self.sessions
            .values()
            .find(|session| session.message(message_id).is_some())
            .map(|session| session.session_id.clone())
    }

    fn snapshot(&self) -> SessionSnapshot {
        let Some(session) = self
            .current
            .as_deref()
            .and_then(|id| self.sessions.get(id))
        else {
            return SessionSnapshot::default();
        };
        SessionSnapshot {
            session_id: Some(session.session_id.clone()),
            name: session.name.clone(),
            messages: session.messages.clone(),
            cached_image: session.cached_image.clone(),
            mode: Some(session.current_mode),
        }
    }
}

/// Owns every session and message.
///
/// All mutations go through one write path that updates the durable
/// session map and republishes the reactive snapshot before returning, so
/// the two views never diverge. Messages are addressed by id across all
/// sessions, which lets a late result land in a session that is no longer
/// on screen.
pub struct SessionStore {
    state: Mutex<StoreState>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    revision_tx: watch::Sender<u64>,
    sink: Arc<dyn CanvasEventSink>,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    pub fn new(sink: Arc<dyn CanvasEventSink>, clock: Arc<dyn Clock>) -> Self {
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::default());
        let (revision_tx, _) = watch::channel(0);
        Self {
            state: Mutex::new(StoreState::default()),
            snapshot_tx,
            revision_tx,
            sink,
            clock,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Bumped on every durable change; hydration does not bump it.
    pub fn revisions(&self) -> watch::Receiver<u64> {
        self.revision_tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn create_session(&self, name: Option<&str>) -> String {
        let now = self.clock.now();
        let session_id = Uuid::new_v4().to_string();
        self.write(true, |state| {
            let name = name
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("Session {}", state.sessions.len() + 1));
            state
                .sessions
                .insert(session_id.clone(), Session::new(&session_id, name, now));
            state.current = Some(session_id.clone());
        });
        tracing::info!(target: "store", session_id = %session_id, "session created");
        session_id
    }

    /// Moves the current-session pointer and refreshes the snapshot in the
    /// same step.
    pub fn switch_session(&self, session_id: &str) -> Result<()> {
        self.write(true, |state| {
            if !state.sessions.contains_key(session_id) {
                return Err(anyhow!("unknown session '{session_id}'"));
            }
            state.current = Some(session_id.to_string());
            Ok(())
        })
    }

    pub fn rename_session(&self, session_id: &str, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(anyhow!("session name must not be empty"));
        }
        let now = self.clock.now();
        self.write(true, |state| {
            let session = state
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| anyhow!("unknown session '{session_id}'"))?;
            session.name = name.to_string();
            session.last_activity = now;
            Ok(())
        })
    }

    /// Deleting the current session moves the pointer to the most recently
    /// active survivor, or to a fresh session when none is left.
    pub fn delete_session(&self, session_id: &str) -> Result<()> {
        let now = self.clock.now();
        self.write(true, |state| {
            if state.sessions.shift_remove(session_id).is_none() {
                return Err(anyhow!("unknown session '{session_id}'"));
            }
            if state.current.as_deref() != Some(session_id) {
                return Ok(());
            }
            let next = state
                .sessions
                .values()
                .max_by_key(|session| session.last_activity)
                .map(|session| session.session_id.clone());
            let next = next.unwrap_or_else(|| {
                let fresh = Uuid::new_v4().to_string();
                state
                    .sessions
                    .insert(fresh.clone(), Session::new(&fresh, "Session 1", now));
                fresh
            });
            state.current = Some(next);
            Ok(())
        })
    }

    pub fn current_session_id(&self) -> Option<String> {
        self.read().current.clone()
    }

    pub fn current_session(&self) -> Option<Session> {
        let state = self.read();
        state
            .current
            .as_deref()
            .and_then(|id| state.sessions.get(id))
            .cloned()
    }

    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.read().sessions.get(session_id).cloned()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.read().sessions.values().cloned().collect()
    }

    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let state = self.read();
        state
            .sessions
            .values()
            .map(|session| SessionSummary {
                session_id: session.session_id.clone(),
                name: session.name.clone(),
                message_count: session.messages.len(),
                last_activity: session.last_activity,
                is_current: state.current.as_deref() == Some(session.session_id.as_str()),
            })
            .collect()
    }

    pub fn message(&self, message_id: &str) -> Option<Message> {
        self.read()
            .sessions
            .values()
            .find_map(|session| session.message(message_id).cloned())
    }

    /// Appends to the current session (creating one if needed).
    ///
    /// A draft identical in role, content and group tag to the immediately
    /// preceding message is absorbed and the existing message returned.
    pub fn add_message(&self, draft: MessageDraft) -> Message {
        let now = self.clock.now();
        let role = draft.role();
        let (message, appended) = self.write(true, |state| {
            let current = state
                .current
                .clone()
                .filter(|id| state.sessions.contains_key(id))
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let ordinal = state.sessions.len() + 1;
            state.current = Some(current.clone());
            let session = state.sessions.entry(current.clone()).or_insert_with(|| {
                Session::new(&current, format!("Session {ordinal}"), now)
            });
            if let Some(last) = session.messages.last() {
                if last.role == role && last.content == draft.content && last.group == draft.group
                {
                    return (last.clone(), false);
                }
            }
            let message = Message {
                id: Uuid::new_v4().to_string(),
                role,
                content: draft.content,
                timestamp: now,
                image_data: draft.image_data,
                image_url: draft.image_url,
                thumbnail: None,
                video_url: None,
                expects_image_output: draft.expects_image_output,
                expects_video_output: draft.expects_video_output,
                status: draft.status,
                group: draft.group,
                operation: draft.operation,
                provider: None,
            };
            session.messages.push(message.clone());
            session.last_activity = now;
            (message, true)
        });
        if !appended {
            tracing::debug!(target: "store", message_id = %message.id, "duplicate message absorbed");
        }
        message
    }

    pub fn update_message<F>(&self, message_id: &str, update: F) -> bool
    where
        F: FnOnce(&mut Message),
    {
        let now = self.clock.now();
        self.write(true, |state| {
            let Some(owner) = state.owner_of(message_id) else {
                return false;
            };
            let Some(session) = state.sessions.get_mut(&owner) else {
                return false;
            };
            let Some(message) = session.message_mut(message_id) else {
                return false;
            };
            update(message);
            session.last_activity = now;
            true
        })
    }

    /// Merges `patch` into the message's status; a progress value in the
    /// patch is forwarded to the canvas as a placeholder progress tick.
    pub fn update_message_status(
        &self,
        message_id: &str,
        patch: StatusPatch,
    ) -> Option<GenerationStatus> {
        let mut updated = None;
        let found = self.update_message(message_id, |message| {
            let status = message.status.get_or_insert_with(GenerationStatus::default);
            status.apply(&patch);
            updated = Some(status.clone());
        });
        if !found {
            tracing::debug!(target: "store", message_id, "status update for unknown message");
            return None;
        }
        if let (Some(_), Some(status)) = (patch.progress, updated.as_ref()) {
            self.sink
                .update_progress(&placeholder_id_for(message_id), status.progress);
        }
        updated
    }

    /// Applies `update` to whichever session owns `message_id`.
    pub fn update_session_of<F, R>(&self, message_id: &str, update: F) -> Option<R>
    where
        F: FnOnce(&mut Session) -> R,
    {
        let now = self.clock.now();
        self.write(true, |state| {
            let owner = state.owner_of(message_id)?;
            let session = state.sessions.get_mut(&owner)?;
            session.last_activity = now;
            Some(update(session))
        })
    }

    /// Applies `update` to the session with `session_id`, messages or not.
    pub fn update_session<F, R>(&self, session_id: &str, update: F) -> Option<R>
    where
        F: FnOnce(&mut Session) -> R,
    {
        let now = self.clock.now();
        self.write(true, |state| {
            let session = state.sessions.get_mut(session_id)?;
            session.last_activity = now;
            Some(update(session))
        })
    }

    pub fn set_cached_image(&self, message_id: &str, cached: CachedImage) -> bool {
        self.update_session_of(message_id, |session| {
            session.active_image_id = Some(cached.id.clone());
            session.cached_image = Some(cached);
        })
        .is_some()
    }

    pub fn cached_image(&self) -> Option<CachedImage> {
        self.current_session()
            .and_then(|session| session.cached_image)
    }

    pub fn push_history(&self, message_id: &str, entry: ImageHistoryEntry) -> bool {
        self.update_session_of(message_id, |session| {
            session.context.image_history.push(entry);
        })
        .is_some()
    }

    /// Logs a settled operation and advances the session's iteration state.
    pub fn record_operation(&self, record: OperationRecord) -> bool {
        let message_id = record.message_id.clone();
        self.update_session_of(&message_id, |session| {
            session.context.remember_prompt(&record.prompt);
            session.context.last_operation = Some(record.operation);
            if record.success {
                session.context.iteration_count += 1;
            }
            session.operations.push(record);
        })
        .is_some()
    }

    pub fn set_mode(&self, mode: RequestKind) {
        self.write_current(|session| session.current_mode = mode);
    }

    pub fn set_active_image(&self, image_id: Option<String>) {
        self.write_current(|session| session.active_image_id = image_id);
    }

    pub fn set_preference(&self, key: &str, value: &str) {
        self.write_current(|session| {
            session
                .context
                .preferences
                .insert(key.to_string(), value.to_string());
        });
    }

    /// Replaces the whole store with loaded sessions without marking it
    /// dirty, so a load never echoes back as a save.
    pub fn hydrate(&self, sessions: Vec<Session>, current: Option<String>) {
        self.write(false, |state| {
            state.sessions = sessions
                .into_iter()
                .map(|session| (session.session_id.clone(), session))
                .collect();
            state.current = current
                .filter(|id| state.sessions.contains_key(id))
                .or_else(|| {
                    state
                        .sessions
                        .values()
                        .max_by_key(|session| session.last_activity)
                        .map(|session| session.session_id.clone())
                });
        });
        tracing::info!(target: "store", "store hydrated");
    }

    fn write_current<F>(&self, update: F)
    where
        F: FnOnce(&mut Session),
    {
        let now = self.clock.now();
        self.write(true, |state| {
            let Some(current) = state.current.clone() else {
                return;
            };
            if let Some(session) = state.sessions.get_mut(&current) {
                update(session);
                session.last_activity = now;
            }
        });
    }

    fn write<F, R>(&self, dirty: bool, update: F) -> R
    where
        F: FnOnce(&mut StoreState) -> R,
    {
        let mut state = self.lock();
        let result = update(&mut state);
        let snapshot = state.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
        if dirty {
            self.revision_tx.send_modify(|revision| *revision += 1);
        }
        result
    }

    fn read(&self) -> MutexGuard<'_, StoreState> {
        self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use easel_contracts::events::MemorySink;
    use easel_contracts::session::{MessageDraft, Role, StatusPatch};

    use super::SessionStore;
    use crate::clock::TokioClock;

    fn store() -> (SessionStore, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        (SessionStore::new(sink.clone(), Arc::new(TokioClock)), sink)
    }

    #[test]
    fn add_message_creates_a_session_on_demand() {
        let (store, _) = store();
        assert!(store.current_session_id().is_none());
        let message = store.add_message(MessageDraft::user("hi"));
        assert_eq!(message.role, Role::User);
        let snapshot = store.snapshot();
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.session_id, store.current_session_id());
    }

    #[test]
    fn identical_consecutive_messages_are_absorbed() {
        let (store, _) = store();
        let first = store.add_message(MessageDraft::user("a red cube"));
        let second = store.add_message(MessageDraft::user("a red cube"));
        assert_eq!(first.id, second.id);
        store.add_message(MessageDraft::assistant("done"));
        store.add_message(MessageDraft::user("a red cube"));
        assert_eq!(store.snapshot().messages.len(), 3);
    }

    #[test]
    fn snapshot_follows_the_session_pointer() -> anyhow::Result<()> {
        let (store, _) = store();
        let first = store.create_session(Some("first"));
        store.add_message(MessageDraft::user("in first"));
        let second = store.create_session(Some("second"));
        assert_eq!(store.snapshot().session_id.as_deref(), Some(second.as_str()));
        assert!(store.snapshot().messages.is_empty());

        store.switch_session(&first)?;
        let snapshot = store.snapshot();
        assert_eq!(snapshot.name, "first");
        assert_eq!(snapshot.messages[0].content, "in first");
        assert!(store.switch_session("missing").is_err());
        Ok(())
    }

    #[test]
    fn updates_reach_messages_in_background_sessions() -> anyhow::Result<()> {
        let (store, _) = store();
        let first = store.create_session(None);
        let pending = store.add_message(MessageDraft::assistant("working"));
        store.create_session(None);

        assert!(store.update_message(&pending.id, |message| {
            message.content = "finished".to_string();
        }));
        assert!(store.snapshot().messages.is_empty());
        let session = store.session(&first).expect("first session");
        assert_eq!(session.messages[0].content, "finished");
        Ok(())
    }

    #[test]
    fn status_progress_emits_placeholder_tick() {
        let (store, sink) = store();
        let message = store.add_message(MessageDraft::assistant("working"));
        store.update_message_status(&message.id, StatusPatch::started(15, "preparing"));
        store.update_message_status(&message.id, StatusPatch::progress(10));
        store.update_message_status(&message.id, StatusPatch::stage("calling"));

        let placeholder = format!("ai-placeholder-{}", message.id);
        assert_eq!(sink.progress_for(&placeholder), vec![15, 15]);
        let status = store.message(&message.id).and_then(|m| m.status);
        assert_eq!(status.map(|s| s.progress), Some(15));
    }

    #[test]
    fn deleting_current_session_picks_a_survivor() -> anyhow::Result<()> {
        let (store, _) = store();
        let keep = store.create_session(Some("keep"));
        let doomed = store.create_session(Some("doomed"));
        store.delete_session(&doomed)?;
        assert_eq!(store.current_session_id(), Some(keep.clone()));

        store.delete_session(&keep)?;
        let sessions = store.list_sessions();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].is_current);
        assert!(store.delete_session("ghost").is_err());
        Ok(())
    }

    #[test]
    fn rename_rejects_blank_names() -> anyhow::Result<()> {
        let (store, _) = store();
        let id = store.create_session(None);
        store.rename_session(&id, "  Moodboard ")?;
        assert_eq!(store.snapshot().name, "Moodboard");
        assert!(store.rename_session(&id, "   ").is_err());
        Ok(())
    }

    #[test]
    fn hydrate_refreshes_snapshot_without_dirtying() {
        let (store, _) = store();
        store.add_message(MessageDraft::user("hello"));
        let sessions = store.sessions();
        let current = store.current_session_id();

        let (fresh, _) = self::store();
        let revisions = fresh.revisions();
        fresh.hydrate(sessions, current.clone());
        assert_eq!(*revisions.borrow(), 0);
        assert_eq!(fresh.snapshot().session_id, current);
        assert_eq!(fresh.snapshot().messages.len(), 1);
    }
}
