use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::GenerationStatus;
use crate::layout::Rect;
use crate::request::RequestKind;

pub const RECENT_PROMPT_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Error,
}

/// Parallel-cohort tag carried by every sibling of a fanned-out request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelGroup {
    pub group_id: String,
    pub index: u32,
    pub total: u32,
}

/// Which provider/model actually produced a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderTrace {
    pub provider: String,
    pub model: String,
    pub fallback_from: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Inline payload, always normalized to a `data:` URL.
    pub image_data: Option<String>,
    pub image_url: Option<String>,
    pub thumbnail: Option<String>,
    pub video_url: Option<String>,
    pub expects_image_output: bool,
    pub expects_video_output: bool,
    pub status: Option<GenerationStatus>,
    pub group: Option<ParallelGroup>,
    pub operation: Option<RequestKind>,
    pub provider: Option<ProviderTrace>,
}

impl Message {
    pub fn is_generating(&self) -> bool {
        self.status
            .as_ref()
            .map(|status| status.is_generating)
            .unwrap_or(false)
    }

    pub fn has_renderable_media(&self) -> bool {
        [&self.image_data, &self.image_url, &self.video_url]
            .iter()
            .any(|value| value.as_deref().map(|v| !v.is_empty()).unwrap_or(false))
    }

    pub fn inline_len(&self) -> usize {
        self.image_data.as_deref().map(str::len).unwrap_or(0)
    }

    pub fn group_total(&self) -> u32 {
        self.group.as_ref().map(|group| group.total).unwrap_or(1)
    }
}

/// Caller-supplied fields for `add_message`; the store assigns id and time.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageDraft {
    pub role: Option<Role>,
    pub content: String,
    pub image_data: Option<String>,
    pub image_url: Option<String>,
    pub expects_image_output: bool,
    pub expects_video_output: bool,
    pub status: Option<GenerationStatus>,
    pub group: Option<ParallelGroup>,
    pub operation: Option<RequestKind>,
}

impl MessageDraft {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Some(Role::User),
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Some(Role::Assistant),
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            role: Some(Role::Error),
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn role(&self) -> Role {
        self.role.unwrap_or(Role::Assistant)
    }
}

/// Most recent produced image; the implicit subject of follow-up edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedImage {
    pub id: String,
    pub prompt: String,
    pub bounds: Option<Rect>,
    pub layer_id: Option<String>,
    pub data: Option<String>,
    pub url: Option<String>,
}

impl CachedImage {
    pub fn source(&self) -> Option<&str> {
        self.data
            .as_deref()
            .filter(|value| !value.is_empty())
            .or_else(|| self.url.as_deref().filter(|value| !value.is_empty()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageHistoryEntry {
    pub id: String,
    pub prompt: String,
    pub operation: RequestKind,
    pub thumbnail: Option<String>,
    pub url: Option<String>,
    pub data: Option<String>,
    pub parent_image_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: String,
    pub operation: RequestKind,
    pub prompt: String,
    pub message_id: String,
    pub success: bool,
    pub model: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContextInfo {
    pub preferences: BTreeMap<String, String>,
    pub recent_prompts: Vec<String>,
    pub image_history: Vec<ImageHistoryEntry>,
    pub iteration_count: u32,
    pub last_operation: Option<RequestKind>,
}

impl ContextInfo {
    pub fn remember_prompt(&mut self, prompt: &str) {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return;
        }
        self.recent_prompts.retain(|existing| existing != prompt);
        self.recent_prompts.push(prompt.to_string());
        if self.recent_prompts.len() > RECENT_PROMPT_LIMIT {
            let overflow = self.recent_prompts.len() - RECENT_PROMPT_LIMIT;
            self.recent_prompts.drain(..overflow);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub messages: Vec<Message>,
    pub operations: Vec<OperationRecord>,
    pub current_mode: RequestKind,
    pub active_image_id: Option<String>,
    pub cached_image: Option<CachedImage>,
    pub context: ContextInfo,
}

impl Session {
    pub fn new(session_id: impl Into<String>, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.into(),
            name: name.into(),
            start_time: now,
            last_activity: now,
            messages: Vec::new(),
            operations: Vec::new(),
            current_mode: RequestKind::Chat,
            active_image_id: None,
            cached_image: None,
            context: ContextInfo::default(),
        }
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == id)
    }

    pub fn message_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|message| message.id == id)
    }

    pub fn group_messages(&self, group_id: &str) -> Vec<&Message> {
        self.messages
            .iter()
            .filter(|message| {
                message
                    .group
                    .as_ref()
                    .map(|group| group.group_id == group_id)
                    .unwrap_or(false)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{ContextInfo, Message, Role, RECENT_PROMPT_LIMIT};

    fn bare_message() -> Message {
        Message {
            id: "m1".to_string(),
            role: Role::Assistant,
            content: String::new(),
            timestamp: Utc::now(),
            image_data: None,
            image_url: None,
            thumbnail: None,
            video_url: None,
            expects_image_output: true,
            expects_video_output: false,
            status: None,
            group: None,
            operation: None,
            provider: None,
        }
    }

    #[test]
    fn empty_media_fields_are_not_renderable() {
        let mut message = bare_message();
        assert!(!message.has_renderable_media());
        message.image_url = Some(String::new());
        assert!(!message.has_renderable_media());
        message.video_url = Some("https://cdn.example/v.mp4".to_string());
        assert!(message.has_renderable_media());
    }

    #[test]
    fn recent_prompts_dedupe_and_cap() {
        let mut context = ContextInfo::default();
        for idx in 0..(RECENT_PROMPT_LIMIT + 3) {
            context.remember_prompt(&format!("prompt {idx}"));
        }
        context.remember_prompt("prompt 5");
        assert_eq!(context.recent_prompts.len(), RECENT_PROMPT_LIMIT);
        assert_eq!(context.recent_prompts.last().map(String::as_str), Some("prompt 5"));
        assert_eq!(
            context
                .recent_prompts
                .iter()
                .filter(|prompt| prompt.as_str() == "prompt 5")
                .count(),
            1
        );
    }
}
