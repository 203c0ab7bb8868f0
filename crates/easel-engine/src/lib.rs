pub mod assets;
pub mod clock;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod guard;
pub mod persistence;
pub mod pipeline;
pub mod placeholder;
pub mod progress;
pub mod providers;
pub mod store;

pub use assets::{AssetManager, BlobStore, FsBlobStore, MemoryBlobStore};
pub use clock::{Clock, TokioClock};
pub use config::EngineConfig;
pub use context::EngineContext;
pub use coordinator::{DispatchIntent, DispatchTicket, GroupOutcome, ParallelCoordinator};
pub use engine::{ChatOutcome, Engine};
pub use error::GenerationError;
pub use persistence::{FileSessionBackend, MemorySessionBackend, Persister, SessionBackend};
pub use pipeline::{GenerationJob, GenerationPipeline, Settlement};
pub use placeholder::PlaceholderBridge;
pub use providers::{default_provider_registry, GenerationProvider, ProviderRegistry};
pub use store::{SessionSnapshot, SessionStore, SessionSummary};
