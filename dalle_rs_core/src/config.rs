use std::path::Path;

use anyhow::Context;
use dalle_rs_common::{ModelSource, TokenSource};
use serde::Deserialize;

use crate::{pipelines::DEFAULT_MAX_TEXT_LENGTH, ModelDType};

pub const DEFAULT_GENERATOR_ID: &str = "dalle-mini/dalle-mini";
pub const DEFAULT_DECODER_ID: &str = "dalle-mini/vqgan_imagenet_f16_16384";
pub const DEFAULT_DECODER_REVISION: &str = "e93a26e7707683d349bf5d5c41c5b0ef69b677a9";
pub const DEFAULT_SCORER_ID: &str = "openai/clip-vit-base-patch32";

/// Where to load one model from.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ComponentSource {
    /// Hugging Face model ID or local directory.
    pub model_id: String,
    /// Only applicable for Hugging Face models. Defaults to `main`.
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub dtype: ModelDType,
}

impl ComponentSource {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            revision: None,
            dtype: ModelDType::Auto,
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn with_dtype(mut self, dtype: ModelDType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn source(&self) -> ModelSource {
        ModelSource::from_model_id(&self.model_id)
    }
}

fn default_generator() -> ComponentSource {
    ComponentSource::new(DEFAULT_GENERATOR_ID).with_dtype(ModelDType::F16)
}

fn default_decoder() -> ComponentSource {
    ComponentSource::new(DEFAULT_DECODER_ID).with_revision(DEFAULT_DECODER_REVISION)
}

fn default_scorer() -> Option<ComponentSource> {
    Some(ComponentSource::new(DEFAULT_SCORER_ID))
}

fn default_max_text_length() -> usize {
    DEFAULT_MAX_TEXT_LENGTH
}

fn default_token() -> String {
    "cache".to_string()
}

/// Pipeline configuration. Every field has a default, so `{}` is a valid JSON configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_generator")]
    pub generator: ComponentSource,
    #[serde(default = "default_decoder")]
    pub decoder: ComponentSource,
    /// Set to `null` to skip scoring.
    #[serde(default = "default_scorer")]
    pub scorer: Option<ComponentSource>,
    #[serde(default = "default_max_text_length")]
    pub max_text_length: usize,
    /// Normalize prompt text (whitespace, case) before tokenizing.
    #[serde(default)]
    pub normalize_text: bool,
    /// Number of devices. Detected when absent.
    #[serde(default)]
    pub devices: Option<usize>,
    /// Hugging Face token source, e.g. `cache`, `env:HF_TOKEN`, `none`.
    #[serde(default = "default_token")]
    pub token: String,
    #[serde(default)]
    pub silent: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            generator: default_generator(),
            decoder: default_decoder(),
            scorer: default_scorer(),
            max_text_length: default_max_text_length(),
            normalize_text: false,
            devices: None,
            token: default_token(),
            silent: false,
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read pipeline config {}", path.display()))?;
        Self::from_json_str(&json)
    }

    pub fn token_source(&self) -> anyhow::Result<TokenSource> {
        Ok(self.token.parse::<TokenSource>()?)
    }
}
