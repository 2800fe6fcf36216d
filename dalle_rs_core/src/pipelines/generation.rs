use dalle_rs_common::{DeviceMesh, NiceProgressBar, ParamStore, PrngKey, Replicated, Sharded};
use image::RgbImage;
use tracing::{debug, info};

use crate::{models::ImageTokenGenerator, SamplingParams};

use super::{decoding::DecodeStage, TokenizedBatch};

/// Number of generation rounds needed for `n_predictions` images per prompt.
pub fn round_count(n_predictions: usize, device_count: usize) -> usize {
    n_predictions.div_ceil(device_count.max(1))
}

/// State threaded through the generation rounds.
#[derive(Debug, Clone)]
pub struct GenerationState {
    pub key: PrngKey,
    /// Round-major, then device-major, then prompt-minor.
    pub images: Vec<RgbImage>,
}

impl GenerationState {
    pub fn new(seed: u64) -> Self {
        Self {
            key: PrngKey::new(seed),
            images: Vec::new(),
        }
    }
}

/// Drop the leading BOS token of a generated sequence.
pub(crate) fn strip_bos(mut sequence: Vec<u32>, bos: u32) -> anyhow::Result<Vec<u32>> {
    let Some(&first) = sequence.first() else {
        anyhow::bail!("Generator returned an empty sequence.");
    };
    if first != bos {
        anyhow::bail!("Expected generated sequence to start with BOS {bos}, got {first}.");
    }
    sequence.remove(0);
    Ok(sequence)
}

pub(crate) struct GenerateStage<'a> {
    pub mesh: &'a DeviceMesh,
    pub model: &'a dyn ImageTokenGenerator,
    pub params: &'a Replicated<ParamStore>,
    pub batch: &'a Replicated<TokenizedBatch>,
    pub sampling: &'a SamplingParams,
}

impl GenerateStage<'_> {
    /// Generate one batch of image tokens per device, BOS stripped.
    pub fn run(&self, key: PrngKey) -> anyhow::Result<Sharded<Vec<Vec<u32>>>> {
        let keys = self
            .mesh
            .from_shards(key.split_n(self.mesh.device_count()))?;
        let bos = self.model.bos_token_id();

        self.mesh.pmap(keys, |device, key| {
            let params = self
                .params
                .get(device.ordinal())
                .ok_or_else(|| anyhow::anyhow!("No generator parameters on {device}."))?;
            let batch = self
                .batch
                .get(device.ordinal())
                .ok_or_else(|| anyhow::anyhow!("No prompt batch on {device}."))?;

            let sequences = self.model.generate(params, batch, key, self.sampling)?;
            if sequences.len() != batch.len() {
                anyhow::bail!(
                    "Generator returned {} sequences for {} prompts on {device}.",
                    sequences.len(),
                    batch.len()
                );
            }
            sequences
                .into_iter()
                .map(|s| strip_bos(s, bos))
                .collect::<anyhow::Result<Vec<_>>>()
        })
    }
}

/// Runs generation then decoding for a number of rounds, accumulating images.
pub(crate) struct GenerationLoop<'a> {
    pub generate: GenerateStage<'a>,
    pub decode: DecodeStage<'a>,
    pub silent: bool,
}

impl GenerationLoop<'_> {
    fn round(&self, mut state: GenerationState) -> anyhow::Result<GenerationState> {
        let (key, subkey) = state.key.split();
        let tokens = self.generate.run(subkey)?;
        let images = self.decode.run(tokens)?;
        debug!("round produced {} images.", images.len());
        state.key = key;
        state.images.extend(images);
        Ok(state)
    }

    pub fn run(&self, rounds: usize, state: GenerationState) -> anyhow::Result<GenerationState> {
        if !self.silent {
            info!(
                "running {rounds} round(s) over {} device(s).",
                self.generate.mesh.device_count()
            );
        }
        NiceProgressBar::<_, 'g'>::new(0..rounds, "Generation rounds", self.silent)
            .into_iter()
            .try_fold(state, |state, _| self.round(state))
    }
}
