//! The opaque generation capability the pipeline orchestrates.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use caseweaver_types::Result;

/// One generation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// Hint about the structured shape the caller expects, typically a
    /// schema id. Backends may ignore it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_hint: Option<String>,
}

/// The backend's answer, with its own cost and latency accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub text: String,
    pub model_id: String,
    pub latency_ms: u64,
    pub token_cost: f64,
}

/// An opaque text-generation capability. The core never depends on the
/// transport or auth details behind an implementation.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse>;
}

/// Cloneable handle to a shared backend, for passing across concurrent
/// pipeline branches.
#[derive(Clone)]
pub struct DynBackend(Arc<dyn GenerationBackend>);

impl DynBackend {
    pub fn new(backend: impl GenerationBackend + 'static) -> Self {
        Self(Arc::new(backend))
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        self.0.generate(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoBackend;

    #[async_trait]
    impl GenerationBackend for EchoBackend {
        fn name(&self) -> &str {
            "echo"
        }

        async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
            Ok(GenerationResponse {
                text: request.prompt.clone(),
                model_id: "echo-model".into(),
                latency_ms: 1,
                token_cost: request.prompt.len() as f64,
            })
        }
    }

    #[tokio::test]
    async fn dyn_backend_delegates() {
        let backend = DynBackend::new(EchoBackend);
        assert_eq!(backend.name(), "echo");
        let response = backend
            .generate(&GenerationRequest {
                prompt: "hello".into(),
                temperature: 0.5,
                max_output_tokens: 128,
                structured_hint: Some("case.v1".into()),
            })
            .await
            .unwrap();
        assert_eq!(response.text, "hello");
        assert_eq!(response.token_cost, 5.0);
    }

    #[tokio::test]
    async fn dyn_backend_clone_shares_instance() {
        let backend = DynBackend::new(EchoBackend);
        let clone = backend.clone();
        assert_eq!(backend.name(), clone.name());
    }

    #[test]
    fn request_serialization_skips_absent_hint() {
        let request = GenerationRequest {
            prompt: "p".into(),
            temperature: 0.7,
            max_output_tokens: 64,
            structured_hint: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("structured_hint"));
    }
}
