//! Model interfaces.
//!
//! Models hold their configuration only. Weights live in a [`ParamStore`] which is passed to every
//! call, so one model value can serve every device while each device reads its own parameter replica.

use dalle_rs_common::{ParamStore, PrngKey};
use image::RgbImage;

use crate::{pipelines::TokenizedBatch, SamplingParams};

/// Text to image-token generator.
pub trait ImageTokenGenerator: Send + Sync {
    /// Token every generated sequence starts with.
    fn bos_token_id(&self) -> u32;

    /// Generate one image-token sequence per row of `batch`, starting with [`Self::bos_token_id`].
    ///
    /// `None` fields of `sampling` select the model's defaults. Output must depend only on the inputs.
    fn generate(
        &self,
        params: &ParamStore,
        batch: &TokenizedBatch,
        key: PrngKey,
        sampling: &SamplingParams,
    ) -> anyhow::Result<Vec<Vec<u32>>>;
}

/// Image-token to pixel decoder.
pub trait ImageTokenDecoder: Send + Sync {
    /// Decode one pixel array per token sequence. Values are nominally in `[0, 1]`; out of range
    /// values are clipped by the caller.
    fn decode(&self, params: &ParamStore, tokens: &[Vec<u32>]) -> anyhow::Result<Vec<PixelArray>>;
}

/// Text/image similarity model.
pub trait TextImageScorer: Send + Sync {
    /// Returns an `images x texts` matrix of similarity logits.
    fn logits_per_image(
        &self,
        params: &ParamStore,
        texts: &[String],
        images: &[RgbImage],
    ) -> anyhow::Result<Vec<Vec<f32>>>;
}

/// Decoded RGB pixels in height, width, channel order.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelArray {
    height: usize,
    width: usize,
    data: Vec<f32>,
}

impl PixelArray {
    pub const CHANNELS: usize = 3;

    pub fn new(height: usize, width: usize, data: Vec<f32>) -> anyhow::Result<Self> {
        if data.len() != height * width * Self::CHANNELS {
            anyhow::bail!(
                "Pixel array of {height}x{width}x{} needs {} values, got {}.",
                Self::CHANNELS,
                height * width * Self::CHANNELS,
                data.len()
            );
        }
        Ok(Self {
            height,
            width,
            data,
        })
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Clip to `[0, 1]` and convert to 8-bit channels. Scaled values are truncated, not rounded.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn to_rgb8(&self) -> anyhow::Result<RgbImage> {
        let raw = self
            .data
            .iter()
            .map(|v| (v.clamp(0.0, 1.0) * 255.0) as u8)
            .collect::<Vec<u8>>();
        RgbImage::from_raw(self.width as u32, self.height as u32, raw)
            .ok_or_else(|| anyhow::anyhow!("RgbImage has invalid capacity."))
    }
}
