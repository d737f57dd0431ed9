//! Replay backend: canned responses for offline runs and deterministic tests.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use caseweaver_types::{Result, WeaverError};

use crate::backend::{GenerationBackend, GenerationRequest, GenerationResponse};

/// Serves a fixed sequence of responses in call order.
pub struct ReplayBackend {
    responses: Vec<String>,
    cursor: Mutex<usize>,
}

impl ReplayBackend {
    /// Load responses from every `*.txt` file in a directory, sorted by
    /// file name.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("txt"))
            .collect();
        paths.sort();
        if paths.is_empty() {
            return Err(WeaverError::Other(format!(
                "no .txt replay responses in {}",
                dir.display()
            )));
        }
        let mut responses = Vec::with_capacity(paths.len());
        for path in paths {
            responses.push(std::fs::read_to_string(path)?);
        }
        Ok(Self::from_responses(responses))
    }

    pub fn from_responses(responses: Vec<String>) -> Self {
        Self {
            responses,
            cursor: Mutex::new(0),
        }
    }

    pub fn remaining(&self) -> usize {
        let used = *self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        self.responses.len().saturating_sub(used)
    }
}

#[async_trait]
impl GenerationBackend for ReplayBackend {
    fn name(&self) -> &str {
        "replay"
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<GenerationResponse> {
        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        let Some(text) = self.responses.get(*cursor) else {
            return Err(WeaverError::BackendError {
                backend: "replay".into(),
                status: 0,
                message: format!("replay exhausted after {} responses", self.responses.len()),
                retryable: false,
            });
        };
        *cursor += 1;
        Ok(GenerationResponse {
            text: text.clone(),
            model_id: "replay".into(),
            latency_ms: 0,
            token_cost: 0.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> GenerationRequest {
        GenerationRequest {
            prompt: "p".into(),
            temperature: 0.7,
            max_output_tokens: 64,
            structured_hint: None,
        }
    }

    #[tokio::test]
    async fn serves_responses_in_order_then_errors() {
        let backend = ReplayBackend::from_responses(vec!["one".into(), "two".into()]);
        assert_eq!(backend.remaining(), 2);
        assert_eq!(backend.generate(&request()).await.unwrap().text, "one");
        assert_eq!(backend.generate(&request()).await.unwrap().text, "two");
        assert_eq!(backend.remaining(), 0);

        let err = backend.generate(&request()).await.unwrap_err();
        assert!(matches!(err, WeaverError::BackendError { retryable: false, .. }));
        assert!(err.to_string().contains("replay exhausted"));
    }

    #[tokio::test]
    async fn loads_sorted_txt_files_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("02.txt"), "second").unwrap();
        std::fs::write(dir.path().join("01.txt"), "first").unwrap();
        std::fs::write(dir.path().join("ignored.json"), "{}").unwrap();

        let backend = ReplayBackend::from_dir(dir.path()).unwrap();
        assert_eq!(backend.remaining(), 2);
        assert_eq!(backend.generate(&request()).await.unwrap().text, "first");
        assert_eq!(backend.generate(&request()).await.unwrap().text, "second");
    }

    #[test]
    fn empty_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ReplayBackend::from_dir(dir.path()).is_err());
    }
}
