//! Small, dependency-free model implementations used by the examples.
//!
//! - [`PaletteGenerator`] samples a grid of colour-codebook tokens around a colour picked from the
//!   prompt tokens.
//! - [`PaletteDecoder`] looks every token up in a `codebook` parameter and paints it as a square patch.
//! - [`ColorScorer`] compares the mean colour of an image with the colour words in a prompt.

use std::{str::FromStr, sync::Arc};

use dalle_rs_core::{
    HubLoader, ImageTokenDecoder, ImageTokenGenerator, ParamData, ParamStore, ParamTensor,
    PixelArray, PrngKey, SamplingParams, TextImageScorer, TokenSource, TokenizedBatch,
};
use image::RgbImage;
use rand::Rng;
use serde::Deserialize;
use tokenizers::Tokenizer;

pub const PALETTE_GENERATOR: &str = "PaletteGenerator";
pub const PALETTE_DECODER: &str = "PaletteDecoder";
pub const COLOR_SCORER: &str = "ColorScorer";

const COLORS: [(&str, [f32; 3]); 8] = [
    ("black", [0.0, 0.0, 0.0]),
    ("white", [1.0, 1.0, 1.0]),
    ("red", [0.9, 0.1, 0.1]),
    ("green", [0.1, 0.8, 0.2]),
    ("blue", [0.1, 0.2, 0.9]),
    ("yellow", [0.95, 0.9, 0.1]),
    ("orange", [1.0, 0.55, 0.0]),
    ("purple", [0.55, 0.1, 0.7]),
];

fn default_grid() -> usize {
    16
}

fn default_codebook_size() -> usize {
    COLORS.len() * 8
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaletteConfig {
    /// Image tokens per side.
    #[serde(default = "default_grid")]
    pub grid: usize,
    #[serde(default = "default_codebook_size")]
    pub codebook_size: usize,
    /// Pixels per token side.
    #[serde(default = "default_patch")]
    pub patch: usize,
}

fn default_patch() -> usize {
    4
}

impl Default for PaletteConfig {
    fn default() -> Self {
        Self {
            grid: default_grid(),
            codebook_size: default_codebook_size(),
            patch: default_patch(),
        }
    }
}

impl PaletteConfig {
    fn shades(&self) -> usize {
        (self.codebook_size / COLORS.len()).max(1)
    }

    /// Codebook entry for `shade` of the colour with index `color`.
    fn token(&self, color: usize, shade: usize) -> u32 {
        ((color % COLORS.len()) * self.shades() + shade.min(self.shades() - 1)) as u32
    }
}

/// Word-level tokenizer over the colour vocabulary.
pub fn demo_tokenizer() -> anyhow::Result<Tokenizer> {
    let vocab = ["<pad>", "<unk>"]
        .into_iter()
        .chain(COLORS.iter().map(|(name, _)| *name))
        .enumerate()
        .map(|(i, word)| format!("\"{word}\": {i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let json = format!(
        r#"{{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": {{"type": "Lowercase"}},
            "pre_tokenizer": {{"type": "Whitespace"}},
            "post_processor": null,
            "decoder": null,
            "model": {{"type": "WordLevel", "vocab": {{{vocab}}}, "unk_token": "<unk>"}}
        }}"#
    );
    Tokenizer::from_str(&json).map_err(anyhow::Error::msg)
}

/// Colour index named by a tokenizer id, if any.
fn color_of_token(id: u32) -> Option<usize> {
    let first_color = 2;
    (id as usize)
        .checked_sub(first_color)
        .filter(|c| *c < COLORS.len())
}

pub struct PaletteGenerator {
    cfg: PaletteConfig,
}

impl PaletteGenerator {
    pub fn new(cfg: PaletteConfig) -> Self {
        Self { cfg }
    }

    /// BOS sits right after the codebook.
    pub fn bos(&self) -> u32 {
        self.cfg.codebook_size as u32
    }
}

impl ImageTokenGenerator for PaletteGenerator {
    fn bos_token_id(&self) -> u32 {
        self.bos()
    }

    fn generate(
        &self,
        _params: &ParamStore,
        batch: &TokenizedBatch,
        key: PrngKey,
        sampling: &SamplingParams,
    ) -> anyhow::Result<Vec<Vec<u32>>> {
        let shades = self.cfg.shades();
        let top_k = sampling.top_k.unwrap_or(shades).clamp(1, shades);
        let temperature = sampling.temperature.unwrap_or(1.0);
        // Probability of ignoring the prompt colour for one token.
        let stray = (temperature / (1.0 + sampling.condition_scale.unwrap_or(1.0).max(0.0)))
            .clamp(0.0, 1.0);

        let row_keys = key.split_n(batch.len());
        batch
            .input_ids
            .iter()
            .zip(&batch.attention_mask)
            .zip(row_keys)
            .map(|((ids, mask), row_key)| {
                let mut rng = row_key.rng();
                let colors = ids
                    .iter()
                    .zip(mask)
                    .filter(|(_, m)| **m == 1)
                    .filter_map(|(id, _)| color_of_token(*id))
                    .collect::<Vec<_>>();

                let mut tokens = Vec::with_capacity(self.cfg.grid * self.cfg.grid + 1);
                tokens.push(self.bos());
                for _ in 0..self.cfg.grid * self.cfg.grid {
                    let color = if colors.is_empty() || rng.gen::<f32>() < stray {
                        rng.gen_range(0..COLORS.len())
                    } else {
                        colors[rng.gen_range(0..colors.len())]
                    };
                    tokens.push(self.cfg.token(color, rng.gen_range(0..top_k)));
                }
                Ok(tokens)
            })
            .collect()
    }
}

/// Codebook parameters: one RGB row per token, darker shades further along.
pub fn palette_params(cfg: &PaletteConfig) -> anyhow::Result<ParamStore> {
    let shades = cfg.shades();
    let mut values = Vec::with_capacity(cfg.codebook_size * 3);
    for token in 0..cfg.codebook_size {
        let (color, shade) = (token / shades % COLORS.len(), token % shades);
        let factor = 1.0 - 0.5 * shade as f32 / shades as f32;
        values.extend(COLORS[color].1.iter().map(|c| c * factor));
    }
    let mut params = ParamStore::new();
    params.insert(
        "codebook",
        ParamTensor::new(vec![cfg.codebook_size, 3], ParamData::F32(values))?,
    );
    Ok(params)
}

pub struct PaletteDecoder {
    cfg: PaletteConfig,
}

impl PaletteDecoder {
    pub fn new(cfg: PaletteConfig) -> Self {
        Self { cfg }
    }
}

impl ImageTokenDecoder for PaletteDecoder {
    fn decode(&self, params: &ParamStore, tokens: &[Vec<u32>]) -> anyhow::Result<Vec<PixelArray>> {
        let codebook = params.get("codebook")?;
        if codebook.shape != [self.cfg.codebook_size, 3] {
            anyhow::bail!("Unexpected codebook shape {:?}.", codebook.shape);
        }
        let codebook = codebook.data.to_f32_vec();
        let (grid, patch) = (self.cfg.grid, self.cfg.patch);
        let side = grid * patch;

        tokens
            .iter()
            .map(|seq| {
                if seq.len() != grid * grid {
                    anyhow::bail!("Expected {} tokens, got {}.", grid * grid, seq.len());
                }
                let mut data = vec![0f32; side * side * 3];
                for (i, token) in seq.iter().enumerate() {
                    let token = *token as usize;
                    if token >= self.cfg.codebook_size {
                        anyhow::bail!("Token {token} is outside the codebook.");
                    }
                    let rgb = &codebook[token * 3..token * 3 + 3];
                    let (ty, tx) = (i / grid, i % grid);
                    for y in ty * patch..(ty + 1) * patch {
                        for x in tx * patch..(tx + 1) * patch {
                            let offset = (y * side + x) * 3;
                            data[offset..offset + 3].copy_from_slice(rgb);
                        }
                    }
                }
                PixelArray::new(side, side, data)
            })
            .collect()
    }
}

/// Scores the negative distance between an image's mean colour and the mean of the prompt's colours.
pub struct ColorScorer;

fn mean_color(image: &RgbImage) -> [f32; 3] {
    let mut sum = [0f32; 3];
    for pixel in image.pixels() {
        for (s, c) in sum.iter_mut().zip(pixel.0) {
            *s += f32::from(c) / 255.0;
        }
    }
    let n = (image.width() * image.height()).max(1) as f32;
    sum.map(|s| s / n)
}

fn prompt_color(text: &str) -> Option<[f32; 3]> {
    let colors = text
        .split_whitespace()
        .filter_map(|w| {
            COLORS
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(w))
                .map(|(_, rgb)| *rgb)
        })
        .collect::<Vec<_>>();
    if colors.is_empty() {
        return None;
    }
    let mut mean = [0f32; 3];
    for rgb in &colors {
        for (m, c) in mean.iter_mut().zip(rgb) {
            *m += c / colors.len() as f32;
        }
    }
    Some(mean)
}

impl TextImageScorer for ColorScorer {
    fn logits_per_image(
        &self,
        _params: &ParamStore,
        texts: &[String],
        images: &[RgbImage],
    ) -> anyhow::Result<Vec<Vec<f32>>> {
        let targets = texts.iter().map(|t| prompt_color(t)).collect::<Vec<_>>();
        Ok(images
            .iter()
            .map(|image| {
                let mean = mean_color(image);
                targets
                    .iter()
                    .map(|target| match target {
                        Some(target) => {
                            let dist = mean
                                .iter()
                                .zip(target)
                                .map(|(a, b)| (a - b) * (a - b))
                                .sum::<f32>()
                                .sqrt();
                            100.0 * (1.0 - dist)
                        }
                        None => 0.0,
                    })
                    .collect()
            })
            .collect())
    }
}

/// Loaders able to read the palette architectures from `config.json`.
pub fn palette_loaders(
    token: TokenSource,
    silent: bool,
) -> (
    HubLoader<dyn ImageTokenGenerator>,
    HubLoader<dyn ImageTokenDecoder>,
    HubLoader<dyn TextImageScorer>,
) {
    let generator = HubLoader::<dyn ImageTokenGenerator>::new(token.clone(), silent).register(
        PALETTE_GENERATOR,
        |c| Ok(Arc::new(PaletteGenerator::new(c.config_as()?)) as Arc<dyn ImageTokenGenerator>),
    );
    let decoder = HubLoader::<dyn ImageTokenDecoder>::new(token.clone(), silent).register(
        PALETTE_DECODER,
        |c| Ok(Arc::new(PaletteDecoder::new(c.config_as()?)) as Arc<dyn ImageTokenDecoder>),
    );
    let scorer = HubLoader::<dyn TextImageScorer>::new(token, silent)
        .register(COLOR_SCORER, |_| Ok(Arc::new(ColorScorer) as Arc<dyn TextImageScorer>));
    (generator, decoder, scorer)
}
