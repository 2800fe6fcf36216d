//! Scoring generated images against their prompts and ranking them.
//!
//! Images are laid out round-major, then device-major, then prompt-minor, so the image at flat index
//! `j` was generated for prompt `j % prompt_count` and the images of prompt `i` sit at
//! `i, i + p, i + 2p, ...`.

use std::cmp::Ordering;

use dalle_rs_common::{DeviceMesh, ParamStore, Replicated};
use image::RgbImage;

use crate::models::TextImageScorer;

/// Flat index of the `position`-th image generated for `prompt`.
pub fn flat_index(prompt: usize, position: usize, prompt_count: usize) -> usize {
    position * prompt_count + prompt
}

/// Flat indices of all images generated for `prompt`, in generation order. Empty when `prompt` is
/// not below `prompt_count`.
pub fn prompt_image_indices(
    prompt: usize,
    prompt_count: usize,
    image_count: usize,
) -> impl Iterator<Item = usize> {
    let end = if prompt < prompt_count { image_count } else { prompt };
    (prompt..end).step_by(prompt_count.max(1))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankedImage {
    /// Index into the generated image list.
    pub index: usize,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptRanking {
    pub prompt: String,
    /// Best first.
    pub entries: Vec<RankedImage>,
}

/// Descending score; NaN last; ties keep generation order.
fn by_descending_score(a: &RankedImage, b: &RankedImage) -> Ordering {
    match (a.score.is_nan(), b.score.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.score.total_cmp(&a.score),
    }
}

/// Rank the images of every prompt given a `prompts x images` logits matrix.
pub fn rank(prompts: &[String], logits: &[Vec<f32>]) -> anyhow::Result<Vec<PromptRanking>> {
    if logits.len() != prompts.len() {
        anyhow::bail!(
            "Expected one row of scores per prompt ({}), got {}.",
            prompts.len(),
            logits.len()
        );
    }
    let image_count = logits.first().map(|x| x.len()).unwrap_or(0);
    if logits.iter().any(|row| row.len() != image_count) {
        anyhow::bail!("Score rows have different lengths.");
    }
    if !prompts.is_empty() && image_count % prompts.len() != 0 {
        anyhow::bail!(
            "{image_count} images cannot be evenly assigned to {} prompts.",
            prompts.len()
        );
    }

    Ok(prompts
        .iter()
        .enumerate()
        .map(|(i, prompt)| {
            let mut entries = prompt_image_indices(i, prompts.len(), image_count)
                .map(|index| RankedImage {
                    index,
                    score: logits[i][index],
                })
                .collect::<Vec<_>>();
            entries.sort_by(by_descending_score);
            PromptRanking {
                prompt: prompt.clone(),
                entries,
            }
        })
        .collect())
}

pub(crate) struct ScoreStage<'a> {
    pub mesh: &'a DeviceMesh,
    pub model: &'a dyn TextImageScorer,
    pub params: &'a Replicated<ParamStore>,
}

impl ScoreStage<'_> {
    /// Score every image against every prompt. Returns a `prompts x images` matrix.
    pub fn run(&self, prompts: &[String], images: &[RgbImage]) -> anyhow::Result<Vec<Vec<f32>>> {
        let devices = self.mesh.device_count();
        let texts = self.mesh.shard(
            prompts
                .iter()
                .cycle()
                .take(prompts.len() * devices)
                .cloned()
                .collect::<Vec<_>>(),
        )?;
        let indices = self.mesh.shard((0..images.len()).collect::<Vec<_>>())?;
        let shards = self.mesh.from_shards(
            texts
                .into_shards()
                .into_iter()
                .zip(indices.into_shards())
                .collect(),
        )?;

        let per_device = self.mesh.pmap(shards, |device, (texts, indices)| {
            let params = self
                .params
                .get(device.ordinal())
                .ok_or_else(|| anyhow::anyhow!("No scorer parameters on {device}."))?;
            let chunk = match (indices.first(), indices.last()) {
                (Some(&start), Some(&end)) => &images[start..=end],
                _ => &images[0..0],
            };
            let logits = self.model.logits_per_image(params, &texts, chunk)?;
            if logits.len() != chunk.len() || logits.iter().any(|row| row.len() != texts.len()) {
                anyhow::bail!(
                    "Scorer returned a badly shaped logits matrix on {device}, expected {}x{}.",
                    chunk.len(),
                    texts.len()
                );
            }
            Ok((indices, logits))
        })?;

        let mut scores = vec![vec![0f32; images.len()]; prompts.len()];
        for (indices, logits) in per_device.into_shards() {
            for (global, row) in indices.into_iter().zip(logits) {
                for (prompt, score) in row.into_iter().enumerate() {
                    scores[prompt][global] = score;
                }
            }
        }
        Ok(scores)
    }
}
