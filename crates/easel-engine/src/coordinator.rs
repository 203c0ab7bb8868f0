use std::sync::Arc;

use easel_contracts::chat::route_prompt;
use easel_contracts::layout::placeholder_id_for;
use easel_contracts::session::{GenerationStatus, MessageDraft, ParallelGroup, StatusPatch};
use easel_contracts::RequestKind;
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use crate::context::EngineContext;
use crate::error::GenerationError;
use crate::pipeline::{resolve_sources, GenerationJob, GenerationPipeline, Settlement};
use crate::placeholder::{GroupPlacement, GroupSlot};

/// What the user asked for. `kind: None` lets the prompt router decide.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DispatchIntent {
    pub prompt: String,
    pub kind: Option<RequestKind>,
    pub sources: Vec<String>,
}

impl DispatchIntent {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: RequestKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_sources(mut self, sources: Vec<String>) -> Self {
        self.sources = sources;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupOutcome {
    pub group_id: String,
    pub settlements: Vec<Settlement>,
}

impl GroupOutcome {
    pub fn succeeded(&self) -> usize {
        self.settlements.iter().filter(|s| s.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.settlements.len() - self.succeeded()
    }
}

/// Returned as soon as the cohort's messages exist; the siblings keep
/// running behind `handle`.
#[derive(Debug)]
pub struct DispatchTicket {
    pub group_id: String,
    pub kind: RequestKind,
    pub user_message_id: String,
    pub message_ids: Vec<String>,
    handle: JoinHandle<GroupOutcome>,
}

impl DispatchTicket {
    pub async fn settled(self) -> GroupOutcome {
        let group_id = self.group_id.clone();
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(target: "coordinator", group_id = %group_id, error = %err, "group task failed");
                GroupOutcome {
                    group_id,
                    settlements: Vec::new(),
                }
            }
        }
    }
}

/// Fans one intent out into `multiplier` pipeline runs for image-class
/// tools and settles them independently.
#[derive(Clone)]
pub struct ParallelCoordinator {
    ctx: Arc<EngineContext>,
    pipeline: GenerationPipeline,
}

impl ParallelCoordinator {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let pipeline = GenerationPipeline::new(Arc::clone(&ctx));
        Self { ctx, pipeline }
    }

    pub fn pipeline(&self) -> &GenerationPipeline {
        &self.pipeline
    }

    /// Validates, creates the shared user message and one assistant
    /// message per sibling, holds the cohort's row, then starts the
    /// siblings with a staggered start. Only validation errors are
    /// returned.
    ///
    /// Sources and the cached subject are resolved here, once, against the
    /// session the intent came from.
    pub fn dispatch(&self, intent: DispatchIntent) -> Result<DispatchTicket, GenerationError> {
        let ctx = &self.ctx;
        let prompt = intent.prompt.trim().to_string();
        if prompt.is_empty() && intent.sources.is_empty() {
            return Err(GenerationError::validation("Type a prompt first."));
        }
        let subject = ctx.store.cached_image();
        let kind = intent
            .kind
            .unwrap_or_else(|| route_prompt(&prompt, intent.sources.len(), subject.is_some()));
        let sources = resolve_sources(kind, &intent.sources, subject.as_ref())?;

        let config = ctx.config();
        let total = if kind.is_image_class() {
            config.multiplier.max(1)
        } else {
            1
        };
        let group_id = Uuid::new_v4().to_string();

        let user = ctx.store.add_message(MessageDraft {
            operation: Some(kind),
            ..MessageDraft::user(prompt.clone())
        });
        ctx.store.set_mode(kind);
        let session_id = ctx.store.current_session_id();

        let mut message_ids = Vec::with_capacity(total as usize);
        for index in 0..total {
            let group = (total > 1).then(|| ParallelGroup {
                group_id: group_id.clone(),
                index,
                total,
            });
            let content = if total > 1 {
                format!("Working on {kind} {} of {total}...", index + 1)
            } else {
                format!("Working on {kind}...")
            };
            let message = ctx.store.add_message(MessageDraft {
                status: Some(GenerationStatus::queued()),
                expects_image_output: kind.expects_image(),
                expects_video_output: kind.expects_video(),
                group,
                operation: Some(kind),
                ..MessageDraft::assistant(content)
            });
            message_ids.push(message.id);
        }

        let anchor = (total > 1).then(|| {
            let (width, height) = config.placeholder_size();
            ctx.bridge.hold_group(&GroupPlacement {
                group_id: group_id.clone(),
                session_id: session_id.clone(),
                kind,
                width,
                height,
                cached_bounds: subject.as_ref().and_then(|subject| subject.bounds),
                message_ids: message_ids.clone(),
            })
        });

        let jobs: Vec<GenerationJob> = (0..total)
            .zip(&message_ids)
            .map(|(index, message_id)| GenerationJob {
                message_id: message_id.clone(),
                session_id: session_id.clone(),
                kind,
                prompt: prompt.clone(),
                sources: sources.clone(),
                subject: subject.clone(),
                group: anchor.map(|anchor| GroupSlot {
                    group_id: group_id.clone(),
                    index,
                    total,
                    anchor,
                }),
            })
            .collect();
        tracing::info!(
            target: "coordinator",
            group_id = %group_id,
            kind = %kind,
            total,
            "dispatching"
        );

        let handle = tokio::spawn(self.clone().settle_all(group_id.clone(), jobs));
        Ok(DispatchTicket {
            group_id,
            kind,
            user_message_id: user.id,
            message_ids,
            handle,
        })
    }

    /// Runs every sibling to completion; one failure never cancels or
    /// blocks the others.
    async fn settle_all(self, group_id: String, jobs: Vec<GenerationJob>) -> GroupOutcome {
        let timing = self.ctx.config().timing;
        let order: Vec<String> = jobs.iter().map(|job| job.message_id.clone()).collect();
        let mut set = JoinSet::new();
        for (index, job) in jobs.into_iter().enumerate() {
            let pipeline = self.pipeline.clone();
            let clock = Arc::clone(&self.ctx.clock);
            let delay = timing.stagger(index as u32);
            set.spawn(async move {
                clock.sleep(delay).await;
                let message_id = job.message_id.clone();
                let kind = job.kind;
                pipeline.run(job).await.unwrap_or_else(|err| Settlement {
                    message_id,
                    kind,
                    model: None,
                    fallback_from: None,
                    error: Some(err),
                })
            });
        }

        let mut settlements = Vec::with_capacity(order.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(settlement) => settlements.push(settlement),
                Err(err) => {
                    tracing::warn!(target: "coordinator", group_id = %group_id, error = %err, "sibling task aborted");
                }
            }
        }
        for message_id in &order {
            if settlements.iter().any(|s| &s.message_id == message_id) {
                continue;
            }
            self.ctx.store.update_message_status(
                message_id,
                StatusPatch::failed("Generation stopped unexpectedly."),
            );
            self.ctx.bridge.remove(&placeholder_id_for(message_id));
        }
        settlements.sort_by_key(|s| order.iter().position(|id| *id == s.message_id));

        let outcome = GroupOutcome {
            group_id,
            settlements,
        };
        tracing::info!(
            target: "coordinator",
            group_id = %outcome.group_id,
            succeeded = outcome.succeeded(),
            failed = outcome.failed(),
            "group settled"
        );
        outcome
    }
}
