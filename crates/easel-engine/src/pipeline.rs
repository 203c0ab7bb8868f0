use std::sync::Arc;

use easel_contracts::events::{LayoutHints, PlaceImage};
use easel_contracts::layout::{placeholder_id_for, PlaceholderSpec, Point};
use easel_contracts::providers::{ProviderOutcome, ProviderPayload, ProviderRequest};
use easel_contracts::session::{CachedImage, OperationRecord, ProviderTrace, StatusPatch};
use easel_contracts::RequestKind;
use uuid::Uuid;

use crate::assets::{media, ResultContext};
use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::error::GenerationError;
use crate::placeholder::{GroupSlot, PlacementRequest};
use crate::progress::ProgressEstimator;
use crate::providers::{invoke, GenerationProvider};

/// One logical request bound to the assistant message it settles.
///
/// `session_id` and `subject` are captured when the request is dispatched;
/// the run never consults whichever session happens to be current later.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationJob {
    pub message_id: String,
    pub session_id: Option<String>,
    pub kind: RequestKind,
    pub prompt: String,
    pub sources: Vec<String>,
    pub subject: Option<CachedImage>,
    pub group: Option<GroupSlot>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub message_id: String,
    pub kind: RequestKind,
    pub model: Option<String>,
    pub fallback_from: Option<String>,
    pub error: Option<GenerationError>,
}

impl Settlement {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

struct Produced {
    payload: ProviderPayload,
    model: String,
    fallback_from: Option<String>,
}

/// Caller-side preconditions, checked before any placeholder or provider
/// call. Returns the sources the provider should see, falling back to the
/// cached subject for kinds that operate on an existing image.
pub fn resolve_sources(
    kind: RequestKind,
    explicit: &[String],
    cached: Option<&CachedImage>,
) -> Result<Vec<String>, GenerationError> {
    let explicit: Vec<String> = explicit
        .iter()
        .map(|source| source.trim())
        .filter(|source| !source.is_empty())
        .map(str::to_string)
        .collect();
    if kind == RequestKind::Blend && explicit.len() < 2 {
        return Err(GenerationError::validation(
            "Blend needs at least two source images.",
        ));
    }
    if kind.needs_source() && explicit.is_empty() {
        return match cached.and_then(CachedImage::source) {
            Some(source) => Ok(vec![source.to_string()]),
            None => Err(GenerationError::validation(format!(
                "Nothing to {kind}: attach an image or generate one first."
            ))),
        };
    }
    Ok(explicit)
}

/// Executes one request end to end and always settles its message.
#[derive(Clone)]
pub struct GenerationPipeline {
    ctx: Arc<EngineContext>,
    progress: ProgressEstimator,
}

impl GenerationPipeline {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let progress = ProgressEstimator::new(
            Arc::clone(&ctx.store),
            Arc::clone(&ctx.clock),
            ctx.config().timing,
        );
        Self { ctx, progress }
    }

    /// Only a `Validation` error is returned; every other failure is
    /// written into the message and reported through the settlement.
    pub async fn run(&self, job: GenerationJob) -> Result<Settlement, GenerationError> {
        let ctx = &self.ctx;
        let config = ctx.config();
        let sources = match resolve_sources(job.kind, &job.sources, job.subject.as_ref()) {
            Ok(sources) => sources,
            Err(err) => {
                self.fail(&job, err.clone());
                ctx.bridge.remove(&placeholder_id_for(&job.message_id));
                return Err(err);
            }
        };

        let _flight = ctx.enter_flight();
        ctx.store.update_message_status(
            &job.message_id,
            StatusPatch::started(config.timing.progress_start, "preparing"),
        );
        ctx.store.update_message(&job.message_id, |message| {
            message.operation = Some(job.kind);
        });

        let placeholder = job.kind.expects_visual().then(|| {
            let (width, height) = config.placeholder_size();
            ctx.bridge.reserve(&PlacementRequest {
                message_id: job.message_id.clone(),
                session_id: job.session_id.clone(),
                kind: job.kind,
                width,
                height,
                cached_bounds: job.subject.as_ref().and_then(|subject| subject.bounds),
                group: job.group.clone(),
            })
        });

        let ticker = self.progress.start(&job.message_id);
        let result = self.call_with_fallback(&config, &job, sources).await;
        drop(ticker);

        let settlement = match result {
            Ok(produced) => self.integrate(&config, &job, placeholder.as_ref(), produced),
            Err(err) => self.fail(&job, err),
        };
        ctx.bridge.remove(&placeholder_id_for(&job.message_id));
        Ok(settlement)
    }

    async fn call_with_fallback(
        &self,
        config: &EngineConfig,
        job: &GenerationJob,
        sources: Vec<String>,
    ) -> Result<Produced, GenerationError> {
        let ctx = &self.ctx;
        let provider = ctx.providers.get(&config.provider).ok_or_else(|| {
            GenerationError::Unknown(format!("Unknown provider '{}'.", config.provider))
        })?;
        let capability = job.kind.capability();
        let selection = ctx
            .models
            .resolve(&config.provider, capability, config.model_tier)
            .map_err(GenerationError::Unknown)?;
        if let Some(reason) = selection.fallback_reason.as_deref() {
            tracing::debug!(target: "pipeline", reason, "model tier substituted");
        }
        let primary = selection.model.name;

        let mut request = ProviderRequest {
            kind: job.kind,
            prompt: job.prompt.clone(),
            model: primary.clone(),
            aspect_ratio: config.aspect_ratio.clone(),
            source_images: sources,
            web_search: config.web_search,
        };
        ctx.store
            .update_message_status(&job.message_id, StatusPatch::stage("generating"));
        let first = self
            .call_with_empty_retry(config, provider.as_ref(), &job.message_id, &request)
            .await;
        let err = match first {
            Ok(payload) => {
                return Ok(Produced {
                    payload,
                    model: primary,
                    fallback_from: None,
                })
            }
            Err(err) => err,
        };

        let fallback = if err.is_quota() && job.kind.is_image_class() {
            ctx.models.registry.fallback_for(&primary, capability)
        } else {
            None
        };
        let Some(fallback) = fallback else {
            return Err(err);
        };
        tracing::warn!(
            target: "pipeline",
            message_id = %job.message_id,
            from = %primary,
            to = %fallback.name,
            "quota reached; retrying once on fallback model"
        );
        ctx.store
            .update_message_status(&job.message_id, StatusPatch::stage("fallback"));
        request.model = fallback.name.clone();
        let payload = self
            .call_with_empty_retry(config, provider.as_ref(), &job.message_id, &request)
            .await?;
        Ok(Produced {
            payload,
            model: fallback.name,
            fallback_from: Some(primary),
        })
    }

    async fn call_with_empty_retry(
        &self,
        config: &EngineConfig,
        provider: &dyn GenerationProvider,
        message_id: &str,
        request: &ProviderRequest,
    ) -> Result<ProviderPayload, GenerationError> {
        let mut retries = 0;
        loop {
            let result = match invoke(provider, request).await {
                ProviderOutcome::Success(payload) if payload.satisfies(request.kind) => Ok(payload),
                ProviderOutcome::Success(_) => Err(GenerationError::ProviderEmptyResult),
                ProviderOutcome::Failure(failure) => {
                    Err(GenerationError::from_failure(&failure, &config.quota))
                }
            };
            match result {
                Err(GenerationError::ProviderEmptyResult)
                    if retries < config.timing.empty_result_retries =>
                {
                    retries += 1;
                    tracing::debug!(target: "pipeline", message_id, retries, "empty result; retrying");
                    self.ctx
                        .store
                        .update_message_status(message_id, StatusPatch::stage("retrying"));
                    self.ctx
                        .clock
                        .sleep(config.timing.empty_result_delay())
                        .await;
                }
                other => return other,
            }
        }
    }

    fn integrate(
        &self,
        config: &EngineConfig,
        job: &GenerationJob,
        placeholder: Option<&PlaceholderSpec>,
        produced: Produced,
    ) -> Settlement {
        let ctx = &self.ctx;
        let Produced {
            payload,
            model,
            fallback_from,
        } = produced;
        let inline = payload.image_data.as_deref().and_then(media::normalize_inline);
        let remote = payload
            .image_url
            .clone()
            .or_else(|| {
                payload
                    .image_data
                    .clone()
                    .filter(|raw| media::is_remote_reference(raw))
            })
            .filter(|url| !url.trim().is_empty());
        let content = payload
            .text
            .clone()
            .filter(|text| !text.trim().is_empty())
            .unwrap_or_else(|| default_content(job.kind, &job.prompt));
        let trace = ProviderTrace {
            provider: config.provider.clone(),
            model: model.clone(),
            fallback_from: fallback_from.clone(),
        };

        ctx.store.update_message(&job.message_id, |message| {
            message.content = content;
            message.image_data = inline.clone();
            if remote.is_some() {
                message.image_url = remote.clone();
            }
            message.video_url = payload.video_url.clone();
            message.provider = Some(trace);
        });
        ctx.store
            .update_message_status(&job.message_id, StatusPatch::succeeded());

        if let Some(data) = inline.as_deref() {
            ctx.assets.register_result(
                &job.message_id,
                data,
                &ResultContext {
                    prompt: job.prompt.clone(),
                    operation: job.kind,
                    parent_image_id: job
                        .kind
                        .needs_source()
                        .then(|| job.subject.as_ref().map(|subject| subject.id.clone()))
                        .flatten(),
                },
            );
        }

        if job.kind.expects_image() {
            let source = ctx
                .assets
                .resolve_for_placement(inline.as_deref(), remote.as_deref());
            match source {
                Some(source) => {
                    let placeholder_id = placeholder.map(|spec| spec.placeholder_id.clone());
                    ctx.sink.place_image(PlaceImage {
                        file_name: file_name_for(job, inline.as_deref()),
                        source,
                        operation: job.kind,
                        layout: layout_hints(config, placeholder),
                        placeholder_id,
                    });
                    let bounds = placeholder.and_then(|spec| ctx.bridge.settle(&spec.placeholder_id));
                    ctx.store.set_cached_image(
                        &job.message_id,
                        CachedImage {
                            id: job.message_id.clone(),
                            prompt: job.prompt.clone(),
                            bounds,
                            layer_id: None,
                            data: inline.clone(),
                            url: remote.clone(),
                        },
                    );
                }
                None => {
                    tracing::warn!(target: "pipeline", message_id = %job.message_id, "result has no drawable source");
                }
            }
        }

        self.record(job, true, Some(model.clone()));
        tracing::info!(
            target: "pipeline",
            message_id = %job.message_id,
            kind = %job.kind,
            model = %model,
            "generation settled"
        );
        Settlement {
            message_id: job.message_id.clone(),
            kind: job.kind,
            model: Some(model),
            fallback_from,
            error: None,
        }
    }

    fn fail(&self, job: &GenerationJob, err: GenerationError) -> Settlement {
        let ctx = &self.ctx;
        let shown = err.user_message();
        ctx.store
            .update_message_status(&job.message_id, StatusPatch::failed(shown.clone()));
        ctx.store.update_message(&job.message_id, |message| {
            message.content = format!("Generation failed: {shown}");
        });
        self.record(job, false, None);
        tracing::warn!(
            target: "pipeline",
            message_id = %job.message_id,
            kind = %job.kind,
            error = %err,
            "generation failed"
        );
        Settlement {
            message_id: job.message_id.clone(),
            kind: job.kind,
            model: None,
            fallback_from: None,
            error: Some(err),
        }
    }

    fn record(&self, job: &GenerationJob, success: bool, model: Option<String>) {
        self.ctx.store.record_operation(OperationRecord {
            id: Uuid::new_v4().to_string(),
            operation: job.kind,
            prompt: job.prompt.clone(),
            message_id: job.message_id.clone(),
            success,
            model,
            timestamp: self.ctx.clock.now(),
        });
    }
}

fn default_content(kind: RequestKind, prompt: &str) -> String {
    let prompt = prompt.trim();
    match kind {
        RequestKind::Generate => format!("Generated an image for \"{prompt}\"."),
        RequestKind::Edit => format!("Edited the image: \"{prompt}\"."),
        RequestKind::Blend => format!("Blended the images: \"{prompt}\"."),
        RequestKind::Vectorize => "Vectorized the image.".to_string(),
        RequestKind::Video => format!("Generated a video for \"{prompt}\"."),
        RequestKind::Analyze | RequestKind::Chat => "(no reply)".to_string(),
    }
}

fn file_name_for(job: &GenerationJob, inline: Option<&str>) -> String {
    let ext = inline
        .and_then(|data| media::decode_data_url(data).ok())
        .map(|(_, mime)| media::extension_for_mime(&mime))
        .unwrap_or("png");
    let short: String = job.message_id.chars().take(8).collect();
    format!("{}-{short}.{ext}", job.kind)
}

fn layout_hints(config: &EngineConfig, placeholder: Option<&PlaceholderSpec>) -> LayoutHints {
    match placeholder {
        Some(spec) => LayoutHints {
            center: spec.center,
            width: spec.width,
            height: spec.height,
            group_id: spec.group_id.clone(),
            group_index: spec.group_index,
            group_total: spec.group_total,
        },
        None => {
            let (width, height) = config.placeholder_size();
            LayoutHints {
                center: Point::default(),
                width,
                height,
                group_id: None,
                group_index: None,
                group_total: None,
            }
        }
    }
}
