use std::env;
use std::time::Duration;

use async_trait::async_trait;
use easel_contracts::providers::{
    ProviderFailure, ProviderOutcome, ProviderPayload, ProviderRequest,
};
use reqwest::header::AUTHORIZATION;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::{json, Value};

use super::GenerationProvider;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct ControllerEnvelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<ControllerData>,
    #[serde(default)]
    error: Option<ControllerError>,
}

#[derive(Debug, Default, Deserialize)]
struct ControllerData {
    #[serde(default, alias = "content", alias = "message")]
    text: Option<String>,
    #[serde(default, alias = "imageData", alias = "image")]
    image_data: Option<String>,
    #[serde(default, alias = "imageUrl")]
    image_url: Option<String>,
    #[serde(default, alias = "videoUrl")]
    video_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ControllerError {
    #[serde(default)]
    code: Option<Value>,
    #[serde(default)]
    message: Option<String>,
}

/// Talks to the thin HTTP controller that fronts a provider SDK:
/// `POST {base}/{provider}/{operation}` answering
/// `{success, data, error: {code, message}}`.
#[derive(Debug, Clone)]
pub struct HttpControllerProvider {
    name: String,
    api_base: String,
    http: HttpClient,
}

impl HttpControllerProvider {
    pub fn new(name: &str, api_base: &str) -> Self {
        Self {
            name: name.to_string(),
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            http: HttpClient::new(),
        }
    }

    fn endpoint(&self, operation: &str) -> String {
        format!("{}/{}/{}", self.api_base, self.name, operation)
    }

    fn api_token() -> Option<String> {
        env::var("EASEL_CONTROLLER_TOKEN")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    async fn call(&self, request: &ProviderRequest) -> ProviderOutcome {
        let url = self.endpoint(request.kind.as_str());
        let body = json!({
            "prompt": request.prompt,
            "model": request.model,
            "aspect_ratio": request.aspect_ratio,
            "images": request.source_images,
            "web_search": request.web_search,
        });
        let mut builder = self.http.post(&url).timeout(REQUEST_TIMEOUT).json(&body);
        if let Some(token) = Self::api_token() {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        tracing::debug!(target: "pipeline", provider = %self.name, url = %url, "controller request");
        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => return ProviderOutcome::Failure(ProviderFailure::transport(err.to_string())),
        };
        let status = response.status().as_u16();
        match response.text().await {
            Ok(text) => translate_response(status, &text),
            Err(err) => ProviderOutcome::Failure(ProviderFailure::transport(err.to_string())),
        }
    }
}

/// Maps a controller reply onto the shared outcome.
pub(crate) fn translate_response(status: u16, body: &str) -> ProviderOutcome {
    let envelope = serde_json::from_str::<ControllerEnvelope>(body).ok();
    let ok_status = (200..300).contains(&status);
    match envelope {
        Some(envelope) if ok_status && envelope.success => {
            let data = envelope.data.unwrap_or_default();
            ProviderOutcome::Success(ProviderPayload {
                text: data.text,
                image_data: data.image_data,
                image_url: data.image_url,
                video_url: data.video_url,
            })
        }
        Some(envelope) => {
            let error = envelope.error.unwrap_or_default();
            let code = error.code.as_ref().and_then(code_text);
            let message = error
                .message
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| format!("controller returned HTTP {status}"));
            let failure = if ok_status {
                ProviderFailure::other(code, message)
            } else {
                ProviderFailure::http(status, code, message)
            };
            ProviderOutcome::Failure(failure)
        }
        None => {
            let snippet: String = body.chars().take(200).collect();
            let message = if snippet.trim().is_empty() {
                format!("controller returned HTTP {status} with no body")
            } else {
                snippet
            };
            if ok_status {
                ProviderOutcome::Failure(ProviderFailure::other(
                    Some("invalid_response".to_string()),
                    message,
                ))
            } else {
                ProviderOutcome::Failure(ProviderFailure::http(status, None, message))
            }
        }
    }
}

fn code_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[async_trait]
impl GenerationProvider for HttpControllerProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &ProviderRequest) -> ProviderOutcome {
        self.call(request).await
    }

    async fn edit(&self, request: &ProviderRequest) -> ProviderOutcome {
        self.call(request).await
    }

    async fn blend(&self, request: &ProviderRequest) -> ProviderOutcome {
        self.call(request).await
    }

    async fn analyze(&self, request: &ProviderRequest) -> ProviderOutcome {
        self.call(request).await
    }

    async fn chat(&self, request: &ProviderRequest) -> ProviderOutcome {
        self.call(request).await
    }

    async fn vectorize(&self, request: &ProviderRequest) -> ProviderOutcome {
        self.call(request).await
    }

    async fn video(&self, request: &ProviderRequest) -> ProviderOutcome {
        self.call(request).await
    }
}

#[cfg(test)]
mod tests {
    use easel_contracts::providers::{ProviderFailure, ProviderOutcome, QuotaRules};

    use super::{translate_response, HttpControllerProvider};

    #[test]
    fn success_envelope_becomes_payload() {
        let outcome = translate_response(
            200,
            r#"{"success":true,"data":{"imageData":"data:image/png;base64,AA==","text":"ok"}}"#,
        );
        let ProviderOutcome::Success(payload) = outcome else {
            panic!("expected success");
        };
        assert_eq!(payload.image_data.as_deref(), Some("data:image/png;base64,AA=="));
        assert_eq!(payload.text.as_deref(), Some("ok"));
    }

    #[test]
    fn error_envelope_keeps_code_for_quota_rules() {
        let outcome = translate_response(
            429,
            r#"{"success":false,"error":{"code":"RESOURCE_EXHAUSTED","message":"Quota exceeded"}}"#,
        );
        let ProviderOutcome::Failure(failure) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(failure.status, Some(429));
        assert!(QuotaRules::default().is_quota(&failure));
    }

    #[test]
    fn numeric_codes_and_garbage_bodies_are_tolerated() {
        let numeric = translate_response(200, r#"{"success":false,"error":{"code":429}}"#);
        assert_eq!(
            numeric,
            ProviderOutcome::Failure(ProviderFailure::other(
                Some("429".to_string()),
                "controller returned HTTP 200"
            ))
        );
        let garbage = translate_response(502, "<html>bad gateway</html>");
        assert_eq!(
            garbage,
            ProviderOutcome::Failure(ProviderFailure::http(502, None, "<html>bad gateway</html>"))
        );
    }

    #[test]
    fn endpoint_joins_provider_and_operation() {
        let provider = HttpControllerProvider::new("gemini", "http://localhost:8080/api/");
        assert_eq!(provider.endpoint("edit"), "http://localhost:8080/api/gemini/edit");
    }
}
