use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

// ── LLM config ────────────────────────────────────────────────────────────────

/// Model routing for the per-turn phase pipeline.
///
/// Each phase can run on its own model; an empty override falls back to
/// `model`.  The API is OpenAI-compatible (OpenRouter by default), so a model
/// id looks like `"anthropic/claude-3.5-sonnet"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of the OpenAI-compatible chat completions API.
    pub api_url: String,
    /// Default model id used by phases without an override.
    pub model: String,
    /// Override for the memory-fetch phase (cheap, small output).
    pub model_memory_fetch: String,
    /// Override for the narrative (writer) phase.
    pub model_narrative: String,
    /// Override for the memory-update (assistant) phase.
    pub model_assistant: String,
    /// Base URL of the embeddings endpoint.
    pub embedding_url: String,
    /// Embedding model id.
    pub embedding_model: String,
    /// Vector length the embedding model produces.
    pub embedding_dimension: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "https://openrouter.ai/api/v1".to_string(),
            model: "openai/gpt-4o-mini".to_string(),
            model_memory_fetch: String::new(),
            model_narrative: String::new(),
            model_assistant: String::new(),
            embedding_url: "http://localhost:11434".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            embedding_dimension: 768,
        }
    }
}

impl LlmConfig {
    /// API key, read from the environment only — never from the config file.
    pub fn api_key(&self) -> Option<String> {
        env::var("OPENROUTER_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
    }

    pub fn memory_fetch_model(&self) -> &str {
        fallback(&self.model_memory_fetch, &self.model)
    }

    pub fn narrative_model(&self) -> &str {
        fallback(&self.model_narrative, &self.model)
    }

    pub fn assistant_model(&self) -> &str {
        fallback(&self.model_assistant, &self.model)
    }
}

fn fallback<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() { default } else { value }
}

// ── Story config ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoryConfig {
    /// Directory holding the prompt template files.
    pub prompts_dir: String,
    /// Directory for durable session state and its rotating backups.
    pub saved_dir: String,
    /// Story-start parameter file (backstory, initial entities, ...).
    pub story_parameters_path: String,
}

impl Default for StoryConfig {
    fn default() -> Self {
        Self {
            prompts_dir: "prompts".to_string(),
            saved_dir: "saved".to_string(),
            story_parameters_path: "prompts/story/story-parameters.toml".to_string(),
        }
    }
}

// ── Image config ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// ComfyUI-compatible API base URL.
    pub api_url: String,
    /// Workflow template file with `${MODEL}` / `${PROMPT}` /
    /// `${NEGATIVE_PROMPT}` / `${SEED}` placeholders.
    pub workflow_path: String,
    /// Directory for the content-addressed image cache.
    pub cache_dir: String,
    /// Maximum number of cached image files before oldest-first cleanup.
    pub cache_size: usize,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8188".to_string(),
            workflow_path: "prompts/image-generator-workflow.json".to_string(),
            cache_dir: "saved/images".to_string(),
            cache_size: 100,
        }
    }
}

// ── Server config ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP address the line-delimited JSON transport listens on.
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3002".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub story: StoryConfig,
    pub image: ImageConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        // Env overrides take precedence over the config file.
        if let Ok(url) = env::var("OPENROUTER_API_URL") {
            if !url.is_empty() {
                config.llm.api_url = url;
            }
        }
        if let Ok(model) = env::var("OPENROUTER_MODEL") {
            if !model.is_empty() {
                config.llm.model = model;
            }
        }
        if let Ok(url) = env::var("COMFYUI_API_URL") {
            if !url.is_empty() {
                config.image.api_url = url;
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
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_models_fall_back_to_base_model() {
        let cfg = LlmConfig::default();
        assert_eq!(cfg.memory_fetch_model(), cfg.model);
        assert_eq!(cfg.narrative_model(), cfg.model);
        assert_eq!(cfg.assistant_model(), cfg.model);
    }

    #[test]
    fn phase_model_overrides_win() {
        let cfg = LlmConfig {
            model_narrative: "anthropic/claude-3.5-sonnet".to_string(),
            ..LlmConfig::default()
        };
        assert_eq!(cfg.narrative_model(), "anthropic/claude-3.5-sonnet");
        assert_eq!(cfg.memory_fetch_model(), cfg.model);
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let cfg = AppConfig::load_from("/nonexistent/fabula.toml").unwrap();
        assert_eq!(cfg.server.listen_addr, "127.0.0.1:3002");
        assert_eq!(cfg.image.cache_size, 100);
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fabula.toml");

        let mut cfg = AppConfig::default();
        cfg.llm.model = "test/model".to_string();
        cfg.story.prompts_dir = "custom-prompts".to_string();
        cfg.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.llm.model, "test/model");
        assert_eq!(loaded.story.prompts_dir, "custom-prompts");
    }

    #[test]
    fn partial_config_file_fills_missing_sections_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fabula.toml");
        fs::write(&path, "[llm]\nmodel = \"only/model\"\n").unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.llm.model, "only/model");
        assert_eq!(loaded.story.saved_dir, "saved");
    }
}
