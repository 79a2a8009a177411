use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

// ── Vector store backend ──────────────────────────────────────────────────────

/// Which vector index backs the memory store.
///
/// | Backend  | Behaviour                                                      |
/// |----------|----------------------------------------------------------------|
/// | `local`  | Embedded redb file, brute-force cosine search.  No server.     |
/// | `qdrant` | Remote Qdrant collection (requires the `qdrant` cargo feature).|
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorStoreProvider {
    #[default]
    Local,
    Qdrant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Chat provider used for fact extraction and reconciliation decisions.
    /// Recognised values: `ollama`, `openrouter`.
    pub provider: String,
    pub ollama_model: String,
    pub openrouter_model: String,
    /// Base URL for the Ollama API.  Overridden at runtime by the
    /// `OLLAMA_BASE_URL` environment variable when set.
    pub ollama_base_url: String,
    /// Provider used for embeddings.  May differ from the chat provider.
    pub embedding_provider: String,
    pub embedding_model: String,
    /// Per-request HTTP timeout.  The core never enforces its own timeouts;
    /// this is the only place one is applied.
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            ollama_model: "llama3.1:8b".to_string(),
            openrouter_model: "openai/gpt-4o-mini".to_string(),
            ollama_base_url: "http://localhost:11434".to_string(),
            embedding_provider: "ollama".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorStoreConfig {
    pub provider: VectorStoreProvider,
    /// redb file used by the `local` backend.
    pub path: String,
    /// Qdrant endpoint.  Overridden by `QDRANT_URL`.
    pub url: String,
    pub collection_name: String,
    /// Dimensionality of the embedding model output.  Used when the Qdrant
    /// collection has to be created.
    pub embedding_dims: u64,
    /// Minimum similarity a neighbour must reach to be returned by `search`.
    /// Keeps "recall everything" from turning every memory into a duplicate.
    pub score_threshold: f32,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            provider: VectorStoreProvider::Local,
            path: ".recollect/vectors.redb".to_string(),
            url: "http://localhost:6334".to_string(),
            collection_name: "memories".to_string(),
            embedding_dims: 768,
            score_threshold: 0.9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Path of the append-only history journal.  Overridden by
    /// `RECOLLECT_HISTORY_PATH`.
    pub path: String,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: ".recollect/history.redb".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Nearest neighbours fetched per extracted fact during reconciliation.
    pub search_limit: usize,
    /// Run the per-fact embed + search step concurrently.  Facts are
    /// independent until the decision step, so ordering is unaffected.
    pub parallel_fact_search: bool,
    /// Fixed UTC offset (minutes) applied when stamping `created_at` /
    /// `updated_at` on stored payloads.
    pub timezone_offset_minutes: i32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            search_limit: 5,
            parallel_fact_search: true,
            timezone_offset_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    /// When non-empty, logs are additionally written to a daily-rolling file
    /// in this directory.
    pub log_dir: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub vector_store: VectorStoreConfig,
    pub history: HistoryConfig,
    pub memory: MemoryConfig,
    pub telemetry: TelemetryConfig,
}

const KNOWN_LLM_PROVIDERS: &[&str] = &["ollama", "openrouter"];

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("OLLAMA_BASE_URL") {
            if !value.is_empty() {
                config.llm.provider = "ollama".to_string();
                config.llm.ollama_base_url = value;
            }
        }

        if let Ok(url) = env::var("QDRANT_URL") {
            if !url.is_empty() {
                config.vector_store.provider = VectorStoreProvider::Qdrant;
                config.vector_store.url = url;
            }
        }

        if let Ok(path) = env::var("RECOLLECT_HISTORY_PATH") {
            if !path.is_empty() {
                config.history.path = path;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Reject settings the memory pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        for provider in [&self.llm.provider, &self.llm.embedding_provider] {
            let known = KNOWN_LLM_PROVIDERS
                .iter()
                .any(|p| p.eq_ignore_ascii_case(provider));
            if !known {
                bail!("unsupported llm provider: {provider}");
            }
        }
        if self.memory.search_limit == 0 {
            bail!("memory.search_limit must be at least 1");
        }
        let threshold = self.vector_store.score_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            bail!("vector_store.score_threshold must lie in [0, 1], got {threshold}");
        }
        if self.vector_store.embedding_dims == 0 {
            bail!("vector_store.embedding_dims must be non-zero");
        }
        Ok(())
    }

    pub fn active_model(&self) -> &str {
        if self.llm.provider.eq_ignore_ascii_case("openrouter") {
            &self.llm.openrouter_model
        } else {
            &self.llm.ollama_model
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serialises every test that calls `load_from`, since it reads
    /// process-wide environment variables.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // ── Pipeline-critical defaults ─────────────────────────────────────────
    // The threshold and neighbour limit shape reconciliation behaviour.
    // Changing either should be a deliberate, reviewed decision.

    #[test]
    fn reconciliation_defaults() {
        let cfg = AppConfig::default();
        assert!((cfg.vector_store.score_threshold - 0.9).abs() < f32::EPSILON);
        assert_eq!(cfg.memory.search_limit, 5);
        assert!(cfg.memory.parallel_fact_search);
    }

    #[test]
    fn cosmetic_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.llm.provider, "ollama");
        assert_eq!(cfg.llm.ollama_model, "llama3.1:8b");
        assert_eq!(cfg.llm.ollama_base_url, "http://localhost:11434");
        assert_eq!(cfg.vector_store.provider, VectorStoreProvider::Local);
        assert_eq!(cfg.vector_store.collection_name, "memories");
        assert_eq!(cfg.history.path, ".recollect/history.redb");
        assert_eq!(cfg.telemetry.log_level, "info");
        assert!(cfg.telemetry.log_dir.is_empty());
    }

    // ── load_from ──────────────────────────────────────────────────────────

    #[test]
    fn load_from_missing_file_returns_defaults() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig::load_from(dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(cfg.llm.provider, "ollama");
        assert_eq!(cfg.memory.search_limit, 5);
    }

    #[test]
    fn load_from_valid_toml() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.toml");
        fs::write(
            &path,
            r#"
[llm]
provider = "openrouter"
openrouter_model = "anthropic/claude-3.5-sonnet"
embedding_model = "mxbai-embed-large"

[vector_store]
provider = "qdrant"
collection_name = "agent_memories"
embedding_dims = 1024
score_threshold = 0.75

[memory]
search_limit = 8
parallel_fact_search = false
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.llm.provider, "openrouter");
        assert_eq!(cfg.llm.openrouter_model, "anthropic/claude-3.5-sonnet");
        assert_eq!(cfg.llm.embedding_model, "mxbai-embed-large");
        assert_eq!(cfg.vector_store.provider, VectorStoreProvider::Qdrant);
        assert_eq!(cfg.vector_store.collection_name, "agent_memories");
        assert_eq!(cfg.vector_store.embedding_dims, 1024);
        assert!((cfg.vector_store.score_threshold - 0.75).abs() < f32::EPSILON);
        assert_eq!(cfg.memory.search_limit, 8);
        assert!(!cfg.memory.parallel_fact_search);
        // Unspecified sections keep their defaults.
        assert_eq!(cfg.history.path, ".recollect/history.redb");
    }

    #[test]
    fn load_from_partial_toml_fills_defaults() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(
            &path,
            r#"
[telemetry]
log_level = "debug"
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.telemetry.log_level, "debug");
        assert_eq!(cfg.llm.provider, "ollama");
        assert_eq!(cfg.vector_store.provider, VectorStoreProvider::Local);
    }

    #[test]
    fn load_from_invalid_toml_returns_error() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "this is not valid toml {{{{").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    // ── save_to + roundtrip ────────────────────────────────────────────────

    #[test]
    fn save_and_reload_roundtrip() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/config.toml");

        let mut cfg = AppConfig::default();
        cfg.llm.provider = "openrouter".to_string();
        cfg.vector_store.provider = VectorStoreProvider::Qdrant;
        cfg.memory.timezone_offset_minutes = -180;
        cfg.telemetry.log_dir = "/var/log/recollect".to_string();

        cfg.save_to(&path).unwrap();
        assert!(path.exists());

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.llm.provider, "openrouter");
        assert_eq!(loaded.vector_store.provider, VectorStoreProvider::Qdrant);
        assert_eq!(loaded.memory.timezone_offset_minutes, -180);
        assert_eq!(loaded.telemetry.log_dir, "/var/log/recollect");
    }

    #[test]
    fn save_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/c/config.toml");
        AppConfig::default().save_to(&path).unwrap();
        assert!(path.exists());
    }

    // ── validate ───────────────────────────────────────────────────────────

    #[test]
    fn default_config_is_valid() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_unknown_provider() {
        let mut cfg = AppConfig::default();
        cfg.llm.embedding_provider = "carrier-pigeon".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("carrier-pigeon"));
    }

    #[test]
    fn validate_rejects_out_of_range_threshold() {
        let mut cfg = AppConfig::default();
        cfg.vector_store.score_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_search_limit() {
        let mut cfg = AppConfig::default();
        cfg.memory.search_limit = 0;
        assert!(cfg.validate().is_err());
    }

    // ── active_model ───────────────────────────────────────────────────────

    #[test]
    fn active_model_returns_ollama_by_default() {
        assert_eq!(AppConfig::default().active_model(), "llama3.1:8b");
    }

    #[test]
    fn active_model_case_insensitive() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "OpenRouter".to_string();
        assert_eq!(cfg.active_model(), "openai/gpt-4o-mini");
    }

    // ── VectorStoreProvider serde ──────────────────────────────────────────

    #[test]
    fn vector_store_provider_serde_roundtrip() {
        for (provider, label) in [
            (VectorStoreProvider::Local, "\"local\""),
            (VectorStoreProvider::Qdrant, "\"qdrant\""),
        ] {
            let json = serde_json::to_string(&provider).unwrap();
            assert_eq!(json, label);
            let back: VectorStoreProvider = serde_json::from_str(&json).unwrap();
            assert_eq!(back, provider);
        }
    }

    // ── Env var overrides ──────────────────────────────────────────────────
    // All env-var assertions live in one test so parallel test threads never
    // observe each other's variables.

    #[test]
    fn env_overrides_apply() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("env.toml");
        fs::write(
            &path,
            r#"
[llm]
provider = "openrouter"

[history]
path = "from-file.redb"
"#,
        )
        .unwrap();

        // SAFETY: these variables are only touched by this test.
        unsafe {
            env::set_var("OLLAMA_BASE_URL", "http://custom:11434");
            env::set_var("QDRANT_URL", "http://qdrant:6334");
            env::set_var("RECOLLECT_HISTORY_PATH", "from-env.redb");
        }
        let cfg = AppConfig::load_from(&path).unwrap();
        unsafe {
            env::remove_var("OLLAMA_BASE_URL");
            env::remove_var("QDRANT_URL");
            env::remove_var("RECOLLECT_HISTORY_PATH");
        }

        assert_eq!(cfg.llm.provider, "ollama");
        assert_eq!(cfg.llm.ollama_base_url, "http://custom:11434");
        assert_eq!(cfg.vector_store.provider, VectorStoreProvider::Qdrant);
        assert_eq!(cfg.vector_store.url, "http://qdrant:6334");
        assert_eq!(cfg.history.path, "from-env.redb");
    }
}
