use async_trait::async_trait;
use log::debug;
use serde_json::{json, Value};
use std::time::Duration;

use super::{ReasoningError, ReasoningProvider, ReasoningRequest};
use crate::config::ReasoningConfig;

/// Reasoning client for an Ollama-compatible chat endpoint. Non-streaming;
/// one request per evidence candidate, bounded by the configured timeout.
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
}

impl OllamaClient {
    /// Fails if the HTTP client cannot be built; a client without the
    /// per-call timeout would let one stuck call stall a worker forever.
    pub fn new(config: &ReasoningConfig) -> Result<Self, ReasoningError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl ReasoningProvider for OllamaClient {
    async fn complete(&self, request: &ReasoningRequest) -> Result<String, ReasoningError> {
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.prompt}
            ],
            "stream": false,
            "options": {
                "temperature": self.temperature,
                "num_predict": request.max_tokens
            }
        });

        debug!(
            "reasoning call: model={} prompt_chars={}",
            self.model,
            request.prompt.chars().count()
        );
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReasoningError::Status {
                status: status.as_u16(),
                body: super::prompt::truncate(&body, 500).to_string(),
            });
        }

        let result: Value = response.json().await?;
        let content = result["message"]["content"].as_str().unwrap_or("");
        if content.trim().is_empty() {
            return Err(ReasoningError::EmptyReply);
        }
        Ok(content.to_string())
    }
}
