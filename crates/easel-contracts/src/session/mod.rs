mod model;
mod status;

pub use model::{
    CachedImage, ContextInfo, ImageHistoryEntry, Message, MessageDraft, OperationRecord,
    ParallelGroup, ProviderTrace, Role, Session, RECENT_PROMPT_LIMIT,
};
pub use status::{GenerationStatus, StatusPatch, PROGRESS_COMPLETE};
