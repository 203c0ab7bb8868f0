use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;
use easel_contracts::events::CanvasEventSink;
use easel_contracts::models::ModelSelector;

use crate::assets::{AssetManager, BlobStore};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::placeholder::PlaceholderBridge;
use crate::providers::ProviderRegistry;
use crate::store::SessionStore;

/// Everything the orchestration layers share, injected rather than
/// reached for as globals.
pub struct EngineContext {
    settings: RwLock<EngineConfig>,
    pub store: Arc<SessionStore>,
    pub bridge: Arc<PlaceholderBridge>,
    pub assets: Arc<AssetManager>,
    pub providers: ProviderRegistry,
    pub models: ModelSelector,
    pub clock: Arc<dyn Clock>,
    pub sink: Arc<dyn CanvasEventSink>,
    in_flight: AtomicUsize,
}

/// Counts a request as in flight until dropped.
pub struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        sink: Arc<dyn CanvasEventSink>,
        blobs: Arc<dyn BlobStore>,
        providers: ProviderRegistry,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let store = Arc::new(SessionStore::new(Arc::clone(&sink), Arc::clone(&clock)));
        let bridge = Arc::new(PlaceholderBridge::new(
            Arc::clone(&sink),
            config.layout.clone(),
        ));
        let assets = Arc::new(AssetManager::new(
            Arc::clone(&store),
            blobs,
            Arc::clone(&clock),
            config.assets.clone(),
            config.timing.clone(),
        ));
        Arc::new(Self {
            settings: RwLock::new(config),
            store,
            bridge,
            assets,
            providers,
            models: ModelSelector::new(None),
            clock,
            sink,
            in_flight: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> EngineConfig {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Applies `update` only if the result still validates.
    pub fn update_config<F>(&self, update: F) -> Result<EngineConfig>
    where
        F: FnOnce(&mut EngineConfig),
    {
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = settings.clone();
        update(&mut next);
        next.validate()?;
        *settings = next.clone();
        Ok(next)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn enter_flight(&self) -> InFlightGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            counter: &self.in_flight,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::time::Duration;

    use easel_contracts::events::MemorySink;

    use super::EngineContext;
    use crate::assets::MemoryBlobStore;
    use crate::clock::TokioClock;
    use crate::config::{EngineConfig, TimingConfig};
    use crate::providers::testing::ScriptedProvider;
    use crate::providers::ProviderRegistry;

    pub struct Harness {
        pub ctx: Arc<EngineContext>,
        pub sink: Arc<MemorySink>,
        pub blobs: Arc<MemoryBlobStore>,
    }

    /// Context wired to in-memory collaborators with `provider` active.
    pub fn harness(provider_name: &str, provider: impl Into<Arc<ScriptedProvider>>) -> Harness {
        let sink = Arc::new(MemorySink::new());
        let blobs = Arc::new(MemoryBlobStore::with_latency(Duration::from_millis(50)));
        let mut providers = ProviderRegistry::new();
        let provider: Arc<ScriptedProvider> = provider.into();
        providers.register_shared(provider);
        let config = EngineConfig {
            provider: provider_name.to_string(),
            timing: TimingConfig {
                progress_tick_ms: 100,
                progress_duration_ms: 2_000,
                ..TimingConfig::default()
            },
            ..EngineConfig::default()
        };
        let ctx = EngineContext::new(
            config,
            sink.clone(),
            blobs.clone(),
            providers,
            Arc::new(TokioClock),
        );
        Harness { ctx, sink, blobs }
    }
}
