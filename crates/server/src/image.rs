//! Image generation adapter: a ComfyUI-compatible provider behind a
//! content-addressed on-disk cache.
//!
//! Cache keys are the SHA-256 of the full generation request, so a repeated
//! prompt never re-renders; the cache is bounded and trimmed oldest-first.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use fabula_config::ImageConfig;

/// One generation request; also the cache key material.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratorOptions {
    pub model: String,
    pub prompt: String,
    pub negative_prompt: String,
}

#[async_trait]
pub trait ImageProvider: Send + Sync {
    async fn generate_image(&self, options: &GeneratorOptions) -> Result<Vec<Vec<u8>>>;
}

// ── ComfyUI provider ─────────────────────────────────────────────────────────

/// How long to poll the history endpoint before giving up on a render.
const RENDER_TIMEOUT: Duration = Duration::from_secs(120);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct ComfyProvider {
    client: reqwest::Client,
    api_url: String,
    /// Workflow JSON with `${MODEL}` / `${PROMPT}` / `${NEGATIVE_PROMPT}` /
    /// `${SEED}` placeholders.
    workflow: String,
}

impl ComfyProvider {
    pub fn new(config: &ImageConfig) -> Result<Self> {
        let workflow = std::fs::read_to_string(&config.workflow_path)
            .with_context(|| format!("reading workflow {}", config.workflow_path))?;
        Ok(Self {
            client: reqwest::Client::new(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            workflow,
        })
    }

    async fn wait_for_outputs(&self, prompt_id: &str) -> Result<serde_json::Value> {
        let url = format!("{}/history/{prompt_id}", self.api_url);
        let deadline = tokio::time::Instant::now() + RENDER_TIMEOUT;
        loop {
            if tokio::time::Instant::now() > deadline {
                bail!("image render timed out");
            }
            let history: serde_json::Value =
                self.client.get(&url).send().await?.json().await?;
            if let Some(outputs) = history.get(prompt_id).and_then(|h| h.get("outputs")) {
                if outputs.as_object().map(|o| !o.is_empty()).unwrap_or(false) {
                    return Ok(outputs.clone());
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn fetch_first_image(&self, outputs: &serde_json::Value) -> Result<Vec<u8>> {
        let meta = outputs
            .as_object()
            .and_then(|nodes| nodes.values().next())
            .and_then(|node| node.get("images"))
            .and_then(|images| images.get(0))
            .context("render produced no images")?;
        let filename = meta["filename"].as_str().unwrap_or_default();
        let subfolder = meta["subfolder"].as_str().unwrap_or_default();
        let kind = meta["type"].as_str().unwrap_or_default();
        let bytes = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[("filename", filename), ("subfolder", subfolder), ("type", kind)])
            .send()
            .await?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ImageProvider for ComfyProvider {
    async fn generate_image(&self, options: &GeneratorOptions) -> Result<Vec<Vec<u8>>> {
        // JSON-escape the prompts before splicing them into the workflow.
        let escaped_prompt = escape_for_json(&options.prompt);
        let escaped_negative = escape_for_json(&options.negative_prompt);
        let seed = Uuid::new_v4().as_u128() % u128::from(u32::MAX);
        let workflow = self
            .workflow
            .replace("${MODEL}", &options.model)
            .replace("${PROMPT}", &escaped_prompt)
            .replace("${NEGATIVE_PROMPT}", &escaped_negative)
            .replace("${SEED}", &seed.to_string());
        let workflow: serde_json::Value =
            serde_json::from_str(&workflow).context("workflow is not valid JSON")?;

        let client_id = Uuid::new_v4().to_string();
        let response: serde_json::Value = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&serde_json::json!({ "prompt": workflow, "client_id": client_id }))
            .send()
            .await?
            .json()
            .await?;
        let prompt_id = response["prompt_id"]
            .as_str()
            .context("queue response missing prompt_id")?;

        let outputs = self.wait_for_outputs(prompt_id).await?;
        Ok(vec![self.fetch_first_image(&outputs).await?])
    }
}

fn escape_for_json(text: &str) -> String {
    let quoted = serde_json::Value::String(text.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

// ── Cache wrapper ────────────────────────────────────────────────────────────

pub struct ImageGenerator {
    provider: Box<dyn ImageProvider>,
    cache_dir: PathBuf,
    cache_size: usize,
}

impl ImageGenerator {
    pub fn new(config: &ImageConfig) -> Result<Self> {
        Ok(Self::with_provider(config, Box::new(ComfyProvider::new(config)?)))
    }

    pub fn with_provider(config: &ImageConfig, provider: Box<dyn ImageProvider>) -> Self {
        Self {
            provider,
            cache_dir: PathBuf::from(&config.cache_dir),
            cache_size: config.cache_size,
        }
    }

    /// Generate (or fetch from cache) the images for a request, returning the
    /// cached file paths.
    pub async fn generate_image(&self, options: &GeneratorOptions) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(&self.cache_dir).await?;
        let hash = request_hash(options);

        let cached = self.files_with_prefix(&hash).await?;
        if !cached.is_empty() {
            return Ok(cached);
        }

        info!(prompt = %options.prompt, "new image prompt");
        let images = self.provider.generate_image(options).await?;
        let mut paths = Vec::with_capacity(images.len());
        for (index, image) in images.iter().enumerate() {
            let path = self.cache_dir.join(format!("{hash}-{index}.png"));
            fs::write(&path, image).await?;
            paths.push(path);
        }

        if let Err(fault) = self.trim_cache().await {
            warn!(%fault, "image cache cleanup failed");
        }
        Ok(paths)
    }

    /// Drop the cached files for a request so the next call re-renders.
    pub async fn clear_image(&self, options: &GeneratorOptions) -> Result<()> {
        for path in self.files_with_prefix(&request_hash(options)).await? {
            fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn files_with_prefix(&self, prefix: &str) -> Result<Vec<PathBuf>> {
        let mut matches = Vec::new();
        let mut entries = match fs::read_dir(&self.cache_dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(matches),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with(prefix) {
                matches.push(entry.path());
            }
        }
        matches.sort();
        Ok(matches)
    }

    /// Delete the oldest files until the cache fits its bound.
    async fn trim_cache(&self) -> Result<()> {
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.cache_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let modified = entry.metadata().await?.modified()?;
            files.push((modified, entry.path()));
        }
        files.sort();
        while files.len() > self.cache_size {
            let (_, path) = files.remove(0);
            fs::remove_file(path).await?;
        }
        Ok(())
    }
}

fn request_hash(options: &GeneratorOptions) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_string(options).unwrap_or_default());
    format!("{:x}", hasher.finalize())
}

// ── Tests ────────────────────────────────────────────────────────────────────
