mod dryrun;
mod http;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use easel_contracts::providers::{ProviderOutcome, ProviderRequest};
use easel_contracts::RequestKind;

pub use dryrun::DryrunProvider;
pub use http::HttpControllerProvider;

/// One generation backend. Every operation answers with a tagged outcome;
/// adapters translate their wire shape at this boundary.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: &ProviderRequest) -> ProviderOutcome {
        ProviderOutcome::unsupported(request.kind, self.name())
    }

    async fn edit(&self, request: &ProviderRequest) -> ProviderOutcome {
        ProviderOutcome::unsupported(request.kind, self.name())
    }

    async fn blend(&self, request: &ProviderRequest) -> ProviderOutcome {
        ProviderOutcome::unsupported(request.kind, self.name())
    }

    async fn analyze(&self, request: &ProviderRequest) -> ProviderOutcome {
        ProviderOutcome::unsupported(request.kind, self.name())
    }

    async fn chat(&self, request: &ProviderRequest) -> ProviderOutcome {
        ProviderOutcome::unsupported(request.kind, self.name())
    }

    async fn vectorize(&self, request: &ProviderRequest) -> ProviderOutcome {
        ProviderOutcome::unsupported(request.kind, self.name())
    }

    async fn video(&self, request: &ProviderRequest) -> ProviderOutcome {
        ProviderOutcome::unsupported(request.kind, self.name())
    }
}

/// Routes a request to the provider operation matching its kind.
pub async fn invoke(provider: &dyn GenerationProvider, request: &ProviderRequest) -> ProviderOutcome {
    match request.kind {
        RequestKind::Generate => provider.generate(request).await,
        RequestKind::Edit => provider.edit(request).await,
        RequestKind::Blend => provider.blend(request).await,
        RequestKind::Analyze => provider.analyze(request).await,
        RequestKind::Chat => provider.chat(request).await,
        RequestKind::Vectorize => provider.vectorize(request).await,
        RequestKind::Video => provider.video(request).await,
    }
}

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn GenerationProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: GenerationProvider + 'static>(&mut self, provider: P) {
        self.register_shared(Arc::new(provider));
    }

    pub fn register_shared(&mut self, provider: Arc<dyn GenerationProvider>) {
        self.providers
            .insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn GenerationProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

/// Dry-run provider plus, when a controller base URL is given, one HTTP
/// adapter per controller-backed provider name.
pub fn default_provider_registry(controller_base: Option<&str>) -> ProviderRegistry {
    let mut providers = ProviderRegistry::new();
    providers.register(DryrunProvider::new());
    if let Some(base) = controller_base {
        for name in ["gemini", "openai", "flux", "recraft"] {
            providers.register(HttpControllerProvider::new(name, base));
        }
    }
    providers
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;

    use async_trait::async_trait;
    use easel_contracts::providers::{
        ProviderFailure, ProviderOutcome, ProviderPayload, ProviderRequest,
    };

    use super::GenerationProvider;

    type Script = Box<dyn Fn(&ProviderRequest, usize) -> ProviderOutcome + Send + Sync>;

    /// Answers from a closure of (request, call index) and records calls.
    pub struct ScriptedProvider {
        name: String,
        latency: Duration,
        script: Script,
        calls: Mutex<VecDeque<ProviderRequest>>,
        count: AtomicUsize,
    }

    impl ScriptedProvider {
        pub fn new<F>(name: &str, script: F) -> Self
        where
            F: Fn(&ProviderRequest, usize) -> ProviderOutcome + Send + Sync + 'static,
        {
            Self {
                name: name.to_string(),
                latency: Duration::from_millis(500),
                script: Box::new(script),
                calls: Mutex::new(VecDeque::new()),
                count: AtomicUsize::new(0),
            }
        }

        pub fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        pub fn calls(&self) -> Vec<ProviderRequest> {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .cloned()
                .collect()
        }

        pub fn call_count(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }

        async fn answer(&self, request: &ProviderRequest) -> ProviderOutcome {
            let index = self.count.fetch_add(1, Ordering::SeqCst);
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(request.clone());
            tokio::time::sleep(self.latency).await;
            (self.script)(request, index)
        }
    }

    #[async_trait]
    impl GenerationProvider for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn generate(&self, request: &ProviderRequest) -> ProviderOutcome {
            self.answer(request).await
        }

        async fn edit(&self, request: &ProviderRequest) -> ProviderOutcome {
            self.answer(request).await
        }

        async fn blend(&self, request: &ProviderRequest) -> ProviderOutcome {
            self.answer(request).await
        }

        async fn analyze(&self, request: &ProviderRequest) -> ProviderOutcome {
            self.answer(request).await
        }

        async fn chat(&self, request: &ProviderRequest) -> ProviderOutcome {
            self.answer(request).await
        }

        async fn vectorize(&self, request: &ProviderRequest) -> ProviderOutcome {
            self.answer(request).await
        }

        async fn video(&self, request: &ProviderRequest) -> ProviderOutcome {
            self.answer(request).await
        }
    }

    /// 1x1 PNG as a data URL.
    pub const TINY_PNG: &str = "data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mP8z8BQDwAEhQGAhKmMIQAAAABJRU5ErkJggg==";

    pub fn image_success() -> ProviderOutcome {
        ProviderOutcome::Success(ProviderPayload {
            text: Some("Here is your image.".to_string()),
            image_data: Some(TINY_PNG.to_string()),
            ..ProviderPayload::default()
        })
    }

    pub fn quota_failure() -> ProviderOutcome {
        ProviderOutcome::Failure(ProviderFailure::http(
            429,
            Some("RESOURCE_EXHAUSTED".to_string()),
            "Quota exceeded for model",
        ))
    }
}
