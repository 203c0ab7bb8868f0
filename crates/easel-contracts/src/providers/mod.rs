use serde::{Deserialize, Serialize};

use crate::request::RequestKind;

/// Shared request shape handed to every provider adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub kind: RequestKind,
    pub prompt: String,
    pub model: String,
    pub aspect_ratio: String,
    /// Inline `data:` URLs or remote URLs of the images to operate on.
    pub source_images: Vec<String>,
    pub web_search: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProviderPayload {
    pub text: Option<String>,
    /// Base64 (raw or `data:` URL) image bytes.
    pub image_data: Option<String>,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
}

impl ProviderPayload {
    pub fn has_image(&self) -> bool {
        non_empty(&self.image_data) || non_empty(&self.image_url)
    }

    pub fn has_video(&self) -> bool {
        non_empty(&self.video_url)
    }

    /// Whether the payload carries the binary output `kind` promised.
    pub fn satisfies(&self, kind: RequestKind) -> bool {
        if kind.expects_video() {
            return self.has_video();
        }
        if kind.expects_image() {
            return self.has_image();
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderFailure {
    /// HTTP status when the provider was reachable.
    pub status: Option<u16>,
    pub code: Option<String>,
    pub message: String,
    /// Set when the request never reached the provider.
    pub transport: bool,
}

impl ProviderFailure {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
            transport: true,
        }
    }

    pub fn http(status: u16, code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            code,
            message: message.into(),
            transport: false,
        }
    }

    pub fn other(code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            status: None,
            code,
            message: message.into(),
            transport: false,
        }
    }
}

/// Tagged result of one provider call, translated at the adapter boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProviderOutcome {
    Success(ProviderPayload),
    Failure(ProviderFailure),
}

impl ProviderOutcome {
    pub fn unsupported(kind: RequestKind, provider: &str) -> Self {
        ProviderOutcome::Failure(ProviderFailure::other(
            Some("unsupported_operation".to_string()),
            format!("Provider '{provider}' does not support '{kind}'."),
        ))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProviderOutcome::Success(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Network,
    Http(u16),
    QuotaOrRateLimit,
    Unknown,
}

/// Heuristics deciding whether a provider failure means "out of quota".
///
/// These are provider-specific strings, so they are data rather than code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaRules {
    pub statuses: Vec<u16>,
    pub codes: Vec<String>,
    pub message_patterns: Vec<String>,
}

impl Default for QuotaRules {
    fn default() -> Self {
        Self {
            statuses: vec![429],
            codes: ["RESOURCE_EXHAUSTED", "rate_limit_exceeded", "insufficient_quota", "429"]
                .iter()
                .map(|value| (*value).to_string())
                .collect(),
            message_patterns: ["quota", "rate limit", "resource exhausted", "too many requests"]
                .iter()
                .map(|value| (*value).to_string())
                .collect(),
        }
    }
}

impl QuotaRules {
    pub fn is_quota(&self, failure: &ProviderFailure) -> bool {
        if failure
            .status
            .map(|status| self.statuses.contains(&status))
            .unwrap_or(false)
        {
            return true;
        }
        if let Some(code) = failure.code.as_deref() {
            if self
                .codes
                .iter()
                .any(|candidate| candidate.eq_ignore_ascii_case(code.trim()))
            {
                return true;
            }
        }
        let message = failure.message.to_ascii_lowercase();
        self.message_patterns
            .iter()
            .any(|pattern| message.contains(&pattern.to_ascii_lowercase()))
    }

    pub fn classify(&self, failure: &ProviderFailure) -> FailureClass {
        if self.is_quota(failure) {
            return FailureClass::QuotaOrRateLimit;
        }
        if failure.transport {
            return FailureClass::Network;
        }
        match failure.status {
            Some(status) => FailureClass::Http(status),
            None => FailureClass::Unknown,
        }
    }
}

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().map(|v| !v.trim().is_empty()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::{FailureClass, ProviderFailure, ProviderPayload, QuotaRules};
    use crate::request::RequestKind;

    #[test]
    fn quota_is_detected_by_status_code_or_message() {
        let rules = QuotaRules::default();
        assert_eq!(
            rules.classify(&ProviderFailure::http(429, None, "slow down")),
            FailureClass::QuotaOrRateLimit
        );
        assert_eq!(
            rules.classify(&ProviderFailure::http(
                400,
                Some("resource_exhausted".to_string()),
                "bad"
            )),
            FailureClass::QuotaOrRateLimit
        );
        assert_eq!(
            rules.classify(&ProviderFailure::other(None, "Daily Quota exceeded")),
            FailureClass::QuotaOrRateLimit
        );
        assert_eq!(
            rules.classify(&ProviderFailure::transport("Rate limit hit upstream")),
            FailureClass::QuotaOrRateLimit
        );
    }

    #[test]
    fn non_quota_failures_keep_their_class() {
        let rules = QuotaRules::default();
        assert_eq!(
            rules.classify(&ProviderFailure::http(500, None, "internal")),
            FailureClass::Http(500)
        );
        assert_eq!(
            rules.classify(&ProviderFailure::transport("connection reset")),
            FailureClass::Network
        );
        assert_eq!(
            rules.classify(&ProviderFailure::other(None, "???")),
            FailureClass::Unknown
        );
    }

    #[test]
    fn empty_rules_never_match() {
        let rules = QuotaRules {
            statuses: Vec::new(),
            codes: Vec::new(),
            message_patterns: Vec::new(),
        };
        assert!(!rules.is_quota(&ProviderFailure::http(429, None, "quota")));
    }

    #[test]
    fn payload_satisfaction_depends_on_kind() {
        let text_only = ProviderPayload {
            text: Some("hello".to_string()),
            ..ProviderPayload::default()
        };
        assert!(text_only.satisfies(RequestKind::Chat));
        assert!(!text_only.satisfies(RequestKind::Generate));
        assert!(!text_only.satisfies(RequestKind::Video));

        let image = ProviderPayload {
            image_data: Some("aGVsbG8=".to_string()),
            ..ProviderPayload::default()
        };
        assert!(image.satisfies(RequestKind::Edit));
    }
}
