use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Context;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::agent::adapter::{LlmClient, LlmReply};

/// Minimal config for an Ollama-style `POST /api/generate` endpoint.
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    /// Full endpoint URL, e.g. `http://127.0.0.1:11434/api/generate`.
    pub endpoint: String,
    pub model: String,
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

pub struct OllamaClient {
    cfg: OllamaConfig,
    client: Client,
}

impl OllamaClient {
    pub fn new(cfg: OllamaConfig) -> Self {
        Self {
            cfg,
            client: Client::new(),
        }
    }

    async fn generate_inner(&self, prompt: String, timeout_ms: u64) -> anyhow::Result<LlmReply> {
        let request = OllamaRequest {
            model: self.cfg.model.clone(),
            prompt,
            stream: false,
        };

        let res = self
            .client
            .post(&self.cfg.endpoint)
            .timeout(Duration::from_millis(timeout_ms.max(1)))
            .json(&request)
            .send()
            .await
            .context("llm request failed")?
            .error_for_status()
            .context("llm non-2xx response")?
            .json::<OllamaResponse>()
            .await
            .context("llm response decode failed")?;

        Ok(LlmReply {
            text: res.response,
            tokens_in: res.prompt_eval_count,
            tokens_out: res.eval_count,
        })
    }
}

impl LlmClient for OllamaClient {
    fn generate<'a>(
        &'a self,
        prompt: String,
        timeout_ms: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<LlmReply>> + Send + 'a>> {
        Box::pin(self.generate_inner(prompt, timeout_ms))
    }
}
