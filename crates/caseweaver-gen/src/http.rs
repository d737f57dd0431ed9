//! HTTP adapter for a generic JSON completion endpoint.
//!
//! The endpoint contract is deliberately small: POST a JSON body with
//! `model`, `prompt`, `temperature`, and `max_tokens`; receive `text` plus
//! optional `model` and `usage.total_tokens`. Transport failures map onto
//! the shared error taxonomy so the retry layer can distinguish transient
//! from permanent faults.

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use caseweaver_types::{Result, WeaverError};

use crate::backend::{GenerationBackend, GenerationRequest, GenerationResponse};

pub struct HttpBackend {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    prompt: &'a str,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct CompletionReply {
    text: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<UsageReply>,
}

#[derive(Deserialize)]
struct UsageReply {
    #[serde(default)]
    total_tokens: f64,
}

impl HttpBackend {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
        }
    }

    /// Build from `CASEWEAVER_ENDPOINT`, `CASEWEAVER_MODEL`, and
    /// `CASEWEAVER_API_KEY`.
    pub fn from_env() -> Result<Self> {
        let endpoint = std::env::var("CASEWEAVER_ENDPOINT").map_err(|_| {
            WeaverError::Other("CASEWEAVER_ENDPOINT is not set".into())
        })?;
        let model = std::env::var("CASEWEAVER_MODEL").unwrap_or_else(|_| "default".into());
        let api_key = std::env::var("CASEWEAVER_API_KEY").ok();
        Ok(Self::new(endpoint, model, api_key))
    }
}

#[async_trait]
impl GenerationBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        let body = CompletionBody {
            model: &self.model,
            prompt: &request.prompt,
            temperature: request.temperature,
            max_tokens: request.max_output_tokens,
        };

        let started = Instant::now();
        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| WeaverError::BackendError {
            backend: "http".into(),
            status: 0,
            message: e.to_string(),
            retryable: true,
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(1000);
            return Err(WeaverError::RateLimited {
                backend: "http".into(),
                retry_after_ms,
            });
        }
        if !status.is_success() {
            let retryable = status.is_server_error();
            let message = response.text().await.unwrap_or_default();
            return Err(WeaverError::BackendError {
                backend: "http".into(),
                status: status.as_u16(),
                message,
                retryable,
            });
        }

        let reply: CompletionReply =
            response.json().await.map_err(|e| WeaverError::BackendError {
                backend: "http".into(),
                status: status.as_u16(),
                message: format!("malformed completion body: {e}"),
                retryable: false,
            })?;

        let latency_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(
            endpoint = %self.endpoint,
            model = %self.model,
            latency_ms,
            "completion received"
        );

        Ok(GenerationResponse {
            text: reply.text,
            model_id: reply.model.unwrap_or_else(|| self.model.clone()),
            latency_ms,
            token_cost: reply.usage.map(|u| u.total_tokens).unwrap_or(0.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_body_serializes_expected_fields() {
        let body = CompletionBody {
            model: "m",
            prompt: "p",
            temperature: 0.8,
            max_tokens: 256,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "m");
        assert_eq!(json["prompt"], "p");
        assert_eq!(json["max_tokens"], 256);
    }

    #[test]
    fn completion_reply_tolerates_missing_optionals() {
        let reply: CompletionReply = serde_json::from_str(r#"{"text": "hello"}"#).unwrap();
        assert_eq!(reply.text, "hello");
        assert!(reply.model.is_none());
        assert!(reply.usage.is_none());
    }

    #[test]
    fn from_env_requires_endpoint() {
        // Only run the negative path; a configured environment would make
        // this test order-dependent.
        if std::env::var("CASEWEAVER_ENDPOINT").is_err() {
            assert!(HttpBackend::from_env().is_err());
        }
    }
}
