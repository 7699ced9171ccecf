//! Ollama client for the optional generation and embedding services.
//!
//! The LLM is used **only** for:
//! - Relevance scoring of retrieved candidates (the `ollama` reranker)
//! - Natural-language explanations of the final ranking
//! - Query and catalog embeddings (the `ollama` embedding backend)
//!
//! Every call is bounded by the configured timeout. Failures surface as
//! [`ServiceError`] so callers can drop the source for the request.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ServiceError, ServiceResult};

/// Configuration for the Ollama client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    /// Base URL for the Ollama API.
    pub base_url: String,
    /// Model name to use.
    pub model: String,
    /// Request timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".into(),
            model: "llama3.2".into(),
            timeout_ms: 30_000,
        }
    }
}

/// A text-completion service.
pub trait TextGenerator: Send + Sync {
    /// Complete `prompt`, optionally steered by a system prompt.
    fn generate(&self, prompt: &str, system: Option<&str>) -> ServiceResult<String>;

    /// Model identifier reported in responses.
    fn model_name(&self) -> &str;
}

/// Client for the Ollama REST API.
pub struct OllamaClient {
    config: OllamaConfig,
    agent: ureq::Agent,
}

impl OllamaClient {
    /// Create a new Ollama client with the given configuration.
    pub fn new(config: OllamaConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build();
        Self { config, agent }
    }

    /// Check that the server answers on `/api/tags`.
    pub fn probe(&self) -> bool {
        let url = format!("{}/api/tags", self.config.base_url);
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(2))
            .build();
        matches!(agent.get(&url).call(), Ok(resp) if resp.status() == 200)
    }

    /// Embed a single text with `/api/embeddings`.
    pub fn embed(&self, text: &str) -> ServiceResult<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.config.model,
            "prompt": text,
        });
        let json = self.post_json("/api/embeddings", &body)?;
        let values = json["embedding"]
            .as_array()
            .ok_or_else(|| ServiceError::malformed("ollama", "missing 'embedding' field"))?;
        values
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| ServiceError::malformed("ollama", "non-numeric embedding value"))
            })
            .collect()
    }

    /// Get the model name being used.
    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn post_json(&self, path: &str, body: &serde_json::Value) -> ServiceResult<serde_json::Value> {
        let url = format!("{}{path}", self.config.base_url);
        let body_str = serde_json::to_string(body)
            .map_err(|e| ServiceError::malformed("ollama", format!("JSON serialize error: {e}")))?;

        let resp = self
            .agent
            .post(&url)
            .set("Content-Type", "application/json")
            .send_string(&body_str)
            .map_err(|e: ureq::Error| map_transport_error("ollama", self.config.timeout_ms, e))?;

        let resp_str = resp
            .into_string()
            .map_err(|e| ServiceError::malformed("ollama", e.to_string()))?;

        serde_json::from_str(&resp_str).map_err(|e| ServiceError::malformed("ollama", e.to_string()))
    }
}

impl TextGenerator for OllamaClient {
    fn generate(&self, prompt: &str, system: Option<&str>) -> ServiceResult<String> {
        let mut body = serde_json::json!({
            "model": self.config.model,
            "prompt": prompt,
            "stream": false,
            "options": { "temperature": 0.0 },
        });
        if let Some(sys) = system {
            body["system"] = serde_json::Value::String(sys.to_string());
        }

        let json = self.post_json("/api/generate", &body)?;
        json["response"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| ServiceError::malformed("ollama", "missing 'response' field"))
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

impl std::fmt::Debug for OllamaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaClient")
            .field("base_url", &self.config.base_url)
            .field("model", &self.config.model)
            .field("timeout_ms", &self.config.timeout_ms)
            .finish()
    }
}

/// Map a `ureq` failure into the service error taxonomy.
pub(crate) fn map_transport_error(service: &str, timeout_ms: u64, err: ureq::Error) -> ServiceError {
    match err {
        ureq::Error::Status(code, _) => {
            ServiceError::unavailable(service, format!("server returned status {code}"))
        }
        ureq::Error::Transport(t) => {
            let message = t.to_string();
            if message.contains("timed out") {
                ServiceError::Timeout {
                    service: service.to_string(),
                    timeout_ms,
                }
            } else {
                ServiceError::unavailable(service, message)
            }
        }
    }
}

/// Slice the outermost JSON value delimited by `open`/`close` out of free text.
///
/// Models often wrap JSON in prose or code fences.
pub fn extract_json(text: &str, open: char, close: char) -> Option<&str> {
    let trimmed = text.trim();
    let start = trimmed.find(open)?;
    let end = trimmed.rfind(close)?;
    (end > start).then(|| &trimmed[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_unreachable_is_unavailable() {
        let client = OllamaClient::new(OllamaConfig {
            base_url: "http://127.0.0.1:1".into(), // unreachable port
            timeout_ms: 500,
            ..Default::default()
        });
        assert!(!client.probe());
        let err = client.generate("hello", None).unwrap_err();
        assert_eq!(err.service(), "ollama");
    }

    #[test]
    fn extract_json_from_fenced_reply() {
        let reply = "Sure:\n```json\n{\"confidence\": 80}\n```";
        assert_eq!(extract_json(reply, '{', '}'), Some("{\"confidence\": 80}"));
        assert_eq!(extract_json("no json here", '[', ']'), None);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: OllamaConfig = toml::from_str("model = \"mistral\"").unwrap();
        assert_eq!(config.model, "mistral");
        assert_eq!(config.base_url, "http://localhost:11434");
    }
}
