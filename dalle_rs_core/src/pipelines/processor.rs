use dalle_rs_common::{load_tokenizer, FileLoader, ModelSource, TokenSource};
use tokenizers::Tokenizer;
use tracing::info;

/// Default text length of the generator's encoder.
pub const DEFAULT_MAX_TEXT_LENGTH: usize = 64;

/// Prompts tokenized to a fixed `prompts x max_length` shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedBatch {
    pub input_ids: Vec<Vec<u32>>,
    pub attention_mask: Vec<Vec<u32>>,
}

impl TokenizedBatch {
    /// Number of rows (prompts).
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.first().map(|x| x.len()).unwrap_or(0)
    }
}

/// Converts prompts into the generator's fixed-shape token batch.
pub struct PromptProcessor {
    tokenizer: Tokenizer,
    max_length: usize,
    pad_id: u32,
    normalize: bool,
}

impl PromptProcessor {
    pub fn new(tokenizer: Tokenizer, max_length: usize) -> anyhow::Result<Self> {
        if max_length == 0 {
            anyhow::bail!("`max_length` must be at least 1.");
        }
        let pad_id = tokenizer
            .get_padding()
            .map(|p| p.pad_id)
            .or_else(|| tokenizer.token_to_id("<pad>"))
            .unwrap_or(0);
        Ok(Self {
            tokenizer,
            max_length,
            pad_id,
            normalize: false,
        })
    }

    /// Load the tokenizer shipped with a model.
    pub fn from_source(
        source: &ModelSource,
        revision: Option<String>,
        token: &TokenSource,
        silent: bool,
        max_length: usize,
    ) -> anyhow::Result<Self> {
        if !silent {
            info!("loading tokenizer from source: {source}.");
        }
        let loader = FileLoader::from_model_source(source, silent, token, revision)?;
        let files = loader.list_files()?;
        Self::new(load_tokenizer(&loader, &files)?, max_length)
    }

    /// Trim, collapse whitespace and lowercase prompts before tokenizing.
    pub fn with_normalization(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    pub fn with_pad_id(mut self, pad_id: u32) -> Self {
        self.pad_id = pad_id;
        self
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    fn normalize_text(text: &str) -> String {
        text.split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }

    pub fn process(&self, prompts: &[String]) -> anyhow::Result<TokenizedBatch> {
        if prompts.is_empty() {
            anyhow::bail!("At least one prompt is required.");
        }
        let prompts = if self.normalize {
            prompts.iter().map(|p| Self::normalize_text(p)).collect()
        } else {
            prompts.to_vec()
        };

        let encodings = self
            .tokenizer
            .encode_batch(prompts, true)
            .map_err(anyhow::Error::msg)?;

        let mut input_ids = Vec::with_capacity(encodings.len());
        let mut attention_mask = Vec::with_capacity(encodings.len());
        for encoding in encodings {
            let mut ids = encoding.get_ids().to_vec();
            ids.truncate(self.max_length);
            let mut mask = vec![1u32; ids.len()];
            ids.resize(self.max_length, self.pad_id);
            mask.resize(self.max_length, 0);
            input_ids.push(ids);
            attention_mask.push(mask);
        }

        Ok(TokenizedBatch {
            input_ids,
            attention_mask,
        })
    }
}
