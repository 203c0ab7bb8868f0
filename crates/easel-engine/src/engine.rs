use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use easel_contracts::chat::{parse_intent, Intent, CHAT_HELP_COMMANDS};
use easel_contracts::models::ModelTier;
use easel_contracts::session::{CachedImage, MessageDraft};
use easel_contracts::RequestKind;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::assets::media::load_source;
use crate::assets::MigrationReport;
use crate::config::{parse_aspect_ratio, validate_multiplier, EngineConfig};
use crate::context::EngineContext;
use crate::coordinator::{DispatchIntent, DispatchTicket, ParallelCoordinator};
use crate::error::GenerationError;
use crate::persistence::{Persister, SaveReceipt, SessionBackend};
use crate::store::SessionSummary;

const DEFAULT_BLEND_PROMPT: &str = "Blend these images together.";

/// What a line of chat input turned into.
#[derive(Debug)]
pub enum ChatOutcome {
    Noop,
    Dispatched(DispatchTicket),
    SettingsUpdated(EngineConfig),
    SessionChanged(String),
    Sessions(Vec<SessionSummary>),
    ActiveImage(String),
    Migrated(MigrationReport),
    Help(&'static [&'static str]),
    Unknown(String),
}

pub struct Engine {
    ctx: Arc<EngineContext>,
    coordinator: ParallelCoordinator,
    persister: Option<Arc<Persister>>,
    autosave: Option<JoinHandle<()>>,
}

impl Engine {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let coordinator = ParallelCoordinator::new(Arc::clone(&ctx));
        Self {
            ctx,
            coordinator,
            persister: None,
            autosave: None,
        }
    }

    pub fn with_persistence(mut self, backend: Arc<dyn SessionBackend>, set_id: &str) -> Self {
        self.persister = Some(Persister::new(Arc::clone(&self.ctx), backend, set_id));
        self
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn coordinator(&self) -> &ParallelCoordinator {
        &self.coordinator
    }

    pub fn persister(&self) -> Option<&Arc<Persister>> {
        self.persister.as_ref()
    }

    /// Hydrates persisted sessions and starts autosave. A set that fails
    /// to load is logged and the engine starts empty.
    pub async fn start(&mut self) -> Result<()> {
        if let Some(persister) = self.persister.clone() {
            if let Err(err) = persister.hydrate().await {
                tracing::warn!(target: "persistence", error = %format!("{err:#}"), "starting with empty sessions");
            }
            self.autosave = Some(persister.spawn_autosave());
        }
        if self.ctx.store.current_session_id().is_none() {
            self.ctx.store.create_session(None);
        }
        Ok(())
    }

    /// Drains uploads and writes a final save.
    pub async fn shutdown(&mut self) -> Result<Option<SaveReceipt>> {
        self.ctx.assets.wait_for_uploads().await;
        if let Some(handle) = self.autosave.take() {
            handle.abort();
            // Joining drops the task, releasing any flush permit it held.
            let _ = handle.await;
        }
        match &self.persister {
            Some(persister) => persister.flush().await,
            None => Ok(None),
        }
    }

    pub fn dispatch(&self, intent: DispatchIntent) -> Result<DispatchTicket, GenerationError> {
        self.coordinator.dispatch(intent)
    }

    pub async fn migrate(&self) -> MigrationReport {
        self.ctx.assets.migrate_legacy().await
    }

    pub async fn handle_text(&self, text: &str) -> Result<ChatOutcome> {
        let intent = parse_intent(text);
        self.handle_intent(intent).await
    }

    pub async fn handle_intent(&self, intent: Intent) -> Result<ChatOutcome> {
        let store = &self.ctx.store;
        match intent.action.as_str() {
            "noop" => Ok(ChatOutcome::Noop),
            "help" => Ok(ChatOutcome::Help(CHAT_HELP_COMMANDS)),
            "prompt" => {
                let prompt = intent.prompt.unwrap_or_default();
                Ok(ChatOutcome::Dispatched(self.dispatch(DispatchIntent::new(prompt))?))
            }
            "generate" | "edit" | "analyze" | "chat" | "vectorize" | "video" => {
                let kind: RequestKind = intent.action.parse().map_err(|err: String| anyhow!(err))?;
                let prompt = intent.prompt.unwrap_or_default();
                let dispatch = DispatchIntent::new(prompt).with_kind(kind);
                Ok(ChatOutcome::Dispatched(self.dispatch(dispatch)?))
            }
            "blend" => {
                let mut sources = Vec::new();
                for path in string_list(&intent.command_args, "paths") {
                    sources.push(load_source(&path).await?);
                }
                let dispatch = DispatchIntent::new(DEFAULT_BLEND_PROMPT)
                    .with_kind(RequestKind::Blend)
                    .with_sources(sources);
                Ok(ChatOutcome::Dispatched(self.dispatch(dispatch)?))
            }
            "set_active_image" => {
                let path = string_arg(&intent.command_args, "path");
                if path.is_empty() {
                    bail!("Usage: /use <image path>");
                }
                self.use_image(&path).await.map(ChatOutcome::ActiveImage)
            }
            "update_settings" => self
                .apply_settings(&intent.settings_update)
                .map(ChatOutcome::SettingsUpdated),
            "set_provider" => {
                let name = string_arg(&intent.command_args, "provider");
                if self.ctx.providers.get(&name).is_none() {
                    bail!(
                        "Unknown provider '{name}'. Available: {}",
                        self.ctx.providers.names().join(", ")
                    );
                }
                store.set_preference("provider", &name);
                let config = self.ctx.update_config(|config| config.provider = name)?;
                Ok(ChatOutcome::SettingsUpdated(config))
            }
            "set_model_tier" => {
                let raw = string_arg(&intent.command_args, "tier");
                let tier: ModelTier = raw.parse().map_err(|err: String| anyhow!(err))?;
                store.set_preference("model_tier", tier.as_str());
                let config = self.ctx.update_config(|config| config.model_tier = tier)?;
                Ok(ChatOutcome::SettingsUpdated(config))
            }
            "set_aspect_ratio" => {
                let raw = string_arg(&intent.command_args, "aspect_ratio");
                if parse_aspect_ratio(&raw).is_none() {
                    bail!("Aspect ratio must look like W:H, got '{raw}'.");
                }
                store.set_preference("aspect_ratio", &raw);
                let config = self.ctx.update_config(|config| config.aspect_ratio = raw)?;
                Ok(ChatOutcome::SettingsUpdated(config))
            }
            "new_session" => {
                let name = string_arg(&intent.command_args, "name");
                let name = (!name.is_empty()).then_some(name.as_str());
                Ok(ChatOutcome::SessionChanged(store.create_session(name)))
            }
            "rename_session" => {
                let current = store
                    .current_session_id()
                    .context("No session to rename.")?;
                store.rename_session(&current, &string_arg(&intent.command_args, "name"))?;
                Ok(ChatOutcome::SessionChanged(current))
            }
            "switch_session" => {
                let session_id = string_arg(&intent.command_args, "session_id");
                store.switch_session(&session_id)?;
                Ok(ChatOutcome::SessionChanged(session_id))
            }
            "delete_session" => {
                let session_id = string_arg(&intent.command_args, "session_id");
                store.delete_session(&session_id)?;
                self.ctx.bridge.forget_session(&session_id);
                let current = store.current_session_id().unwrap_or_default();
                Ok(ChatOutcome::SessionChanged(current))
            }
            "list_sessions" => Ok(ChatOutcome::Sessions(store.list_sessions())),
            "migrate" => Ok(ChatOutcome::Migrated(self.migrate().await)),
            _ => Ok(ChatOutcome::Unknown(intent.raw)),
        }
    }

    /// Toggles and the multiplier, validated together before any is applied.
    pub fn apply_settings(&self, update: &BTreeMap<String, Value>) -> Result<EngineConfig> {
        let mut multiplier = None;
        let mut auto_download = None;
        let mut web_search = None;
        for (key, value) in update {
            match key.as_str() {
                "multiplier" => {
                    let raw = value.as_u64().context("multiplier must be a number")?;
                    let value = u32::try_from(raw).context("multiplier out of range")?;
                    validate_multiplier(value)?;
                    multiplier = Some(value);
                }
                "auto_download" => {
                    auto_download = Some(value.as_bool().context("auto_download must be on/off")?);
                }
                "web_search" => {
                    web_search = Some(value.as_bool().context("web_search must be on/off")?);
                }
                other => bail!("Unknown setting '{other}'."),
            }
        }
        self.ctx.update_config(|config| {
            if let Some(value) = multiplier {
                config.multiplier = value;
            }
            if let Some(value) = auto_download {
                config.auto_download = value;
            }
            if let Some(value) = web_search {
                config.web_search = value;
            }
        })
    }

    /// Makes a local or remote image the session's subject for later
    /// edits. Returns the id of the message carrying it.
    pub async fn use_image(&self, raw: &str) -> Result<String> {
        let source = load_source(raw).await?;
        let inline = source.starts_with("data:");
        let message = self.ctx.store.add_message(MessageDraft {
            image_data: inline.then(|| source.clone()),
            image_url: (!inline).then(|| source.clone()),
            ..MessageDraft::user(format!("Using image {raw}"))
        });
        self.ctx.store.set_cached_image(
            &message.id,
            CachedImage {
                id: message.id.clone(),
                prompt: raw.to_string(),
                bounds: None,
                layer_id: None,
                data: inline.then(|| source.clone()),
                url: (!inline).then_some(source),
            },
        );
        tracing::info!(target: "store", message_id = %message.id, "active image set");
        Ok(message.id)
    }
}

fn string_arg(args: &BTreeMap<String, Value>, key: &str) -> String {
    args.get(key)
        .and_then(Value::as_str)
        .map(|value| value.trim().to_string())
        .unwrap_or_default()
}

fn string_list(args: &BTreeMap<String, Value>, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use easel_contracts::models::ModelTier;
    use easel_contracts::RequestKind;

    use super::{ChatOutcome, Engine};
    use crate::context::testing::harness;
    use crate::persistence::MemorySessionBackend;
    use crate::providers::testing::{image_success, ScriptedProvider, TINY_PNG};

    fn engine() -> (Engine, crate::context::testing::Harness) {
        let h = harness("gemini", ScriptedProvider::new("gemini", |_, _| image_success()));
        (Engine::new(h.ctx.clone()), h)
    }

    #[tokio::test(start_paused = true)]
    async fn plain_text_dispatches_a_routed_generation() -> anyhow::Result<()> {
        let (engine, h) = engine();
        let ChatOutcome::Dispatched(ticket) = engine.handle_text("a red cube").await? else {
            panic!("expected a dispatch");
        };
        assert_eq!(ticket.kind, RequestKind::Generate);
        let outcome = ticket.settled().await;
        assert_eq!(outcome.succeeded(), 1);
        assert_eq!(h.sink.placed().len(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn settings_commands_validate_before_applying() -> anyhow::Result<()> {
        let (engine, _h) = engine();
        let ChatOutcome::SettingsUpdated(config) = engine.handle_text("/multiplier 4").await? else {
            panic!("expected settings");
        };
        assert_eq!(config.multiplier, 4);
        assert!(engine.handle_text("/multiplier 3").await.is_err());
        assert_eq!(engine.context().config().multiplier, 4);

        engine.handle_text("/tier pro").await?;
        engine.handle_text("/aspect 16:9").await?;
        engine.handle_text("/web_search off").await?;
        let config = engine.context().config();
        assert_eq!(config.model_tier, ModelTier::Pro);
        assert_eq!(config.aspect_ratio, "16:9");
        assert!(!config.web_search);

        assert!(engine.handle_text("/provider nowhere").await.is_err());
        assert!(engine.handle_text("/aspect wide").await.is_err());
        assert_eq!(engine.context().config().provider, "gemini");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn session_commands_drive_the_store() -> anyhow::Result<()> {
        let (engine, h) = engine();
        let ChatOutcome::SessionChanged(first) = engine.handle_text("/new Moodboard").await? else {
            panic!("expected a session");
        };
        let ChatOutcome::SessionChanged(second) = engine.handle_text("/new").await? else {
            panic!("expected a session");
        };
        engine.handle_text("/rename Posters").await?;
        engine.handle_text(&format!("/switch {first}")).await?;
        assert_eq!(h.ctx.store.current_session_id().as_deref(), Some(first.as_str()));

        let ChatOutcome::Sessions(list) = engine.handle_text("/sessions").await? else {
            panic!("expected a listing");
        };
        let names: Vec<_> = list.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Moodboard", "Posters"]);

        engine.handle_text(&format!("/delete {second}")).await?;
        assert_eq!(h.ctx.store.list_sessions().len(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn used_image_becomes_the_edit_subject() -> anyhow::Result<()> {
        let (engine, h) = engine();
        let ChatOutcome::ActiveImage(message_id) =
            engine.handle_text(&format!("/use {TINY_PNG}")).await?
        else {
            panic!("expected an active image");
        };
        let cached = h.ctx.store.cached_image().expect("cached");
        assert_eq!(cached.id, message_id);

        let ChatOutcome::Dispatched(ticket) = engine.handle_text("/edit make it blue").await? else {
            panic!("expected a dispatch");
        };
        assert_eq!(ticket.settled().await.succeeded(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_and_empty_input_do_nothing() -> anyhow::Result<()> {
        let (engine, h) = engine();
        assert!(matches!(engine.handle_text("   ").await?, ChatOutcome::Noop));
        assert!(matches!(engine.handle_text("/frobnicate").await?, ChatOutcome::Unknown(_)));
        assert!(engine.handle_text("/edit tweak it").await.is_err());
        assert!(h.ctx.store.snapshot().messages.is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_writes_a_final_save() -> anyhow::Result<()> {
        let h = harness("gemini", ScriptedProvider::new("gemini", |_, _| image_success()));
        let backend = Arc::new(MemorySessionBackend::new());
        let mut engine = Engine::new(h.ctx.clone()).with_persistence(backend.clone(), "default");
        engine.start().await?;

        let ChatOutcome::Dispatched(ticket) = engine.handle_text("a red cube").await? else {
            panic!("expected a dispatch");
        };
        ticket.settled().await;
        let receipt = engine.shutdown().await?.expect("saved");
        assert!(receipt.version >= 1);

        let stored = backend.stored("default").expect("stored");
        let assistant = stored.sessions[0]
            .messages
            .iter()
            .find(|m| m.expects_image_output)
            .expect("assistant");
        assert!(assistant.image_url.is_some());
        Ok(())
    }
}
