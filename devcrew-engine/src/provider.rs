//! Model provider seam and the Claude Messages API client.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::role::Role;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// One text generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub system: String,
    pub prompt: String,
    pub role: Role,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

/// Something that turns a prompt into text.
pub trait Provider: Send + Sync + 'static {
    fn generate(
        &self,
        req: &GenerateRequest,
    ) -> impl Future<Output = Result<String, ProviderError>> + Send;
}

impl<P: Provider> Provider for std::sync::Arc<P> {
    fn generate(
        &self,
        req: &GenerateRequest,
    ) -> impl Future<Output = Result<String, ProviderError>> + Send {
        (**self).generate(req)
    }
}

#[derive(Debug, Clone, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: [Message<'a>; 1],
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ContentBlock>,
    #[allow(dead_code)]
    stop_reason: Option<String>,
}

/// Claude Messages API client.
pub struct AnthropicProvider {
    api_key: String,
    model: String,
    base_url: String,
    http: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: crate::config::DEFAULT_MODEL.to_string(),
            base_url: API_URL.to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    /// Point at a different endpoint (a proxy or a local stub).
    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.to_string();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn call(&self, req: &GenerateRequest) -> Result<String, ProviderError> {
        let body = ApiRequest {
            model: &self.model,
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            system: &req.system,
            messages: [Message {
                role: "user",
                content: &req.prompt,
            }],
        };

        let resp = self
            .http
            .post(&self.base_url)
            .timeout(req.timeout)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(map_transport)?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, body));
        }

        let parsed: ApiResponse = resp.json().await.map_err(map_transport)?;
        let text = parsed
            .content
            .into_iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("");
        Ok(text)
    }
}

impl Provider for AnthropicProvider {
    async fn generate(&self, req: &GenerateRequest) -> Result<String, ProviderError> {
        tracing::debug!(role = %req.role, model = %self.model, max_tokens = req.max_tokens, "Calling Claude");
        self.call(req).await
    }
}

/// Map a non-success HTTP status to a typed provider error.
pub fn classify_status(status: u16, retry_after: Option<Duration>, body: String) -> ProviderError {
    match status {
        429 => ProviderError::RateLimited { retry_after },
        408 => ProviderError::Timeout,
        500..=599 => ProviderError::ServerError { status, body },
        _ => ProviderError::InvalidRequest(format!("{status}: {body}")),
    }
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<f64>().ok().filter(|s| *s >= 0.0).map(Duration::from_secs_f64)
}

fn map_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else if err.is_decode() {
        ProviderError::ServerError {
            status: err.status().map(|s| s.as_u16()).unwrap_or(200),
            body: err.to_string(),
        }
    } else {
        ProviderError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_typed_errors() {
        assert_eq!(
            classify_status(429, Some(Duration::from_secs(3)), String::new()),
            ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
        );
        assert_eq!(classify_status(408, None, String::new()), ProviderError::Timeout);
        assert!(matches!(
            classify_status(529, None, "overloaded".into()),
            ProviderError::ServerError { status: 529, .. }
        ));
        let bad = classify_status(400, None, "bad model".into());
        assert!(matches!(bad, ProviderError::InvalidRequest(_)));
        assert!(!bad.is_transient());
        assert!(!classify_status(401, None, String::new()).is_transient());
    }

    #[test]
    fn retry_after_accepts_seconds() {
        assert_eq!(parse_retry_after("2"), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after(" 0.5 "), Some(Duration::from_millis(500)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn response_text_blocks_are_joined() {
        let json = r#"{"content":[{"type":"text","text":"Hello "},{"type":"thinking","thinking":"x"},{"type":"text","text":"world"}],"stop_reason":"end_turn"}"#;
        let parsed: ApiResponse = serde_json::from_str(json).unwrap();
        let text: String = parsed
            .content
            .into_iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Other => None,
            })
            .collect();
        assert_eq!(text, "Hello world");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_transport_error() {
        let provider = AnthropicProvider::new("key").with_base_url("http://127.0.0.1:9/v1/messages");
        let req = GenerateRequest {
            system: "sys".into(),
            prompt: "hi".into(),
            role: Role::Worker,
            max_tokens: 10,
            temperature: 0.5,
            timeout: Duration::from_secs(2),
        };
        let err = provider.generate(&req).await.unwrap_err();
        assert!(err.is_transient(), "{err:?}");
    }
}
