use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Clone)]
pub struct OpenRouterClient {
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        // Allow the environment variable to override the config value at runtime.
        let base_url = std::env::var("OLLAMA_BASE_URL").unwrap_or_else(|_| base_url.into());
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl OpenRouterClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Provider {
    Ollama,
    OpenRouter,
}

impl Provider {
    /// Parse a provider from its config label (case-insensitive).
    pub fn from_label(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Some(Self::Ollama),
            "openrouter" | "open_router" | "open-router" => Some(Self::OpenRouter),
            _ => None,
        }
    }
}

/// Dispatches chat and embedding requests to the configured provider.
///
/// Every failure (transport, non-2xx status, missing fields) is returned as
/// an error.  Callers decide whether that is fatal.
#[derive(Debug, Clone)]
pub struct LlmRouter {
    ollama: OllamaClient,
    openrouter: OpenRouterClient,
}

impl LlmRouter {
    pub fn new(ollama_base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            ollama: OllamaClient::new(client.clone(), ollama_base_url),
            openrouter: OpenRouterClient::new(client),
        })
    }

    /// Send a single-turn prompt.  With `json_mode` the provider is asked to
    /// constrain its reply to a JSON object.
    pub async fn chat(
        &self,
        provider: Provider,
        model: &str,
        prompt: &str,
        json_mode: bool,
    ) -> Result<String> {
        debug!(?provider, model, prompt_len = prompt.len(), json_mode, "llm chat request");
        match provider {
            Provider::Ollama => self.ollama.chat_model(model, prompt, json_mode).await,
            Provider::OpenRouter => self.openrouter.chat_model(model, prompt, json_mode).await,
        }
    }

    pub async fn embed(&self, provider: Provider, model: &str, text: &str) -> Result<Vec<f32>> {
        match provider {
            Provider::Ollama => self.ollama.embed(model, text).await,
            Provider::OpenRouter => self.openrouter.embed(model, text).await,
        }
    }
}

impl OllamaClient {
    async fn chat_model(&self, model: &str, prompt: &str, json_mode: bool) -> Result<String> {
        let endpoint = format!("{}/api/generate", self.base_url.trim_end_matches('/'));

        let mut payload = json!({
            "model": model,
            "prompt": prompt,
            "stream": false
        });
        if json_mode {
            payload["format"] = json!("json");
        }

        let response = self
            .client
            .post(endpoint)
            .json(&payload)
            .send()
            .await
            .with_context(|| {
                format!(
                    "Ollama unavailable at {}. Start Ollama and ensure model '{model}' is installed",
                    self.base_url
                )
            })?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            bail!("Ollama error ({status}): {body}");
        }

        match body.get("response").and_then(|value| value.as_str()) {
            Some(content) => Ok(content.to_string()),
            None => bail!("Ollama response missing text: {body}"),
        }
    }

    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        let endpoint = format!("{}/api/embeddings", self.base_url.trim_end_matches('/'));
        let body = json!({ "model": model, "prompt": text });
        let response = self
            .client
            .post(endpoint)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Ollama unavailable at {}", self.base_url))?;

        let status = response.status();
        let json: serde_json::Value = response.json().await?;
        if !status.is_success() {
            bail!("Ollama embedding error ({status}): {json}");
        }
        parse_ollama_embedding(&json)
    }
}

impl OpenRouterClient {
    fn api_key() -> Result<String> {
        match std::env::var("OPENROUTER_API_KEY") {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => bail!("OpenRouter key missing. Set OPENROUTER_API_KEY or switch provider to ollama."),
        }
    }

    async fn chat_model(&self, model: &str, prompt: &str, json_mode: bool) -> Result<String> {
        let api_key = Self::api_key()?;
        let mut payload = json!({
            "model": model,
            "messages": [
                {"role": "user", "content": prompt}
            ]
        });
        if json_mode {
            payload["response_format"] = json!({"type": "json_object"});
        }

        let response = self
            .client
            .post(format!("{OPENROUTER_BASE_URL}/chat/completions"))
            .bearer_auth(api_key)
            .header("X-Title", "Recollect")
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            bail!("OpenRouter error ({status}): {body}");
        }
        parse_chat_completion(&body)
    }

    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        let api_key = Self::api_key()?;
        let response = self
            .client
            .post(format!("{OPENROUTER_BASE_URL}/embeddings"))
            .bearer_auth(api_key)
            .json(&json!({ "model": model, "input": text }))
            .send()
            .await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            bail!("OpenRouter embedding error ({status}): {body}");
        }
        parse_openai_embedding(&body)
    }
}

// ── Response parsing ──────────────────────────────────────────────────────────

fn float_array(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .filter_map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

/// Ollama `/api/embeddings` shape: `{"embedding": [..]}`.
pub fn parse_ollama_embedding(body: &serde_json::Value) -> Result<Vec<f32>> {
    let embedding = body
        .get("embedding")
        .and_then(|e| e.as_array())
        .map(|values| float_array(values))
        .unwrap_or_default();
    if embedding.is_empty() {
        bail!("embedding response carried no vector: {body}");
    }
    Ok(embedding)
}

/// OpenAI-compatible shape: `{"data": [{"embedding": [..]}]}`.
pub fn parse_openai_embedding(body: &serde_json::Value) -> Result<Vec<f32>> {
    let embedding = body
        .get("data")
        .and_then(|data| data.get(0))
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .map(|values| float_array(values))
        .unwrap_or_default();
    if embedding.is_empty() {
        bail!("embedding response carried no vector: {body}");
    }
    Ok(embedding)
}

/// OpenAI-compatible chat completion: first choice's message content.
pub fn parse_chat_completion(body: &serde_json::Value) -> Result<String> {
    match body
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|content| content.as_str())
    {
        Some(content) => Ok(content.to_string()),
        None => bail!("chat completion response empty: {body}"),
    }
}

// ── Structured output extraction ──────────────────────────────────────────────

/// Extract the first valid JSON value from an LLM response.
///
/// Looks for ` ```json\n...\n` ``` ` delimiters first, then falls back to the
/// span between the first `{` and the last `}` (or the first `[` and the
/// last `]`), trying whichever opens earlier first.  Returns `None` when neither
/// strategy yields JSON that deserialises into `T`.
///
/// # Usage
///
/// ```rust
/// use recollect_llm::extract_json_output;
///
/// let raw = "Sure!\n```json\n{\"relevant_facts\":[\"Likes tea\"]}\n```";
/// let value: serde_json::Value = extract_json_output(raw).unwrap();
/// assert_eq!(value["relevant_facts"][0], "Likes tea");
/// ```
pub fn extract_json_output<T: serde::de::DeserializeOwned>(response: &str) -> Option<T> {
    // Strategy 1: fenced ```json ... ``` blocks.
    if let Some(fence_start) = response.find("```json") {
        let after_fence = &response[fence_start + "```json".len()..];
        if let Some(json_start) = after_fence.find(|c: char| !c.is_whitespace()) {
            let json_body = &after_fence[json_start..];
            if let Some(fence_end) = json_body.find("```") {
                let json_str = json_body[..fence_end].trim();
                if let Ok(val) = serde_json::from_str(json_str) {
                    return Some(val);
                }
            }
        }
    }

    // Strategy 2: bare JSON object or array, outermost span first.
    let trimmed = response.trim();
    let mut spans: Vec<(usize, usize)> = [('{', '}'), ('[', ']')]
        .into_iter()
        .filter_map(|(open, close)| {
            let start = trimmed.find(open)?;
            let end = trimmed.rfind(close)?;
            (end > start).then_some((start, end))
        })
        .collect();
    spans.sort_unstable();
    spans
        .into_iter()
        .find_map(|(start, end)| serde_json::from_str(&trimmed[start..=end]).ok())
}

// ── Tests ────────────────────────────────────────────────────────────────────
