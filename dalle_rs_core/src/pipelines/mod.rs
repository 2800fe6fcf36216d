mod decoding;
mod generation;
mod loader;
mod processor;
mod ranking;

use std::sync::Arc;

use dalle_rs_common::{DeviceMesh, ParamStore, Replicated};
use image::RgbImage;
use tracing::info;

pub use generation::{round_count, GenerationState};
pub use loader::{HubLoader, LoadedModel, ModelConstructor, ModelLoader, ResolvedComponent};
pub use processor::{PromptProcessor, TokenizedBatch, DEFAULT_MAX_TEXT_LENGTH};
pub use ranking::{flat_index, prompt_image_indices, rank, PromptRanking, RankedImage};

use crate::{
    models::{ImageTokenDecoder, ImageTokenGenerator, TextImageScorer},
    GenerationParams, PipelineConfig,
};
use decoding::DecodeStage;
use generation::{GenerateStage, GenerationLoop};
use ranking::ScoreStage;

/// Images generated for a set of prompts.
#[derive(Debug, Clone)]
pub struct Generation {
    pub prompts: Vec<String>,
    /// Round-major, then device-major, then prompt-minor.
    pub images: Vec<RgbImage>,
    pub rounds: usize,
    pub device_count: usize,
}

impl Generation {
    /// Images generated for one prompt, in generation order. Empty for an unknown prompt.
    pub fn images_for(&self, prompt: usize) -> Vec<&RgbImage> {
        prompt_image_indices(prompt, self.prompts.len(), self.images.len())
            .map(|i| &self.images[i])
            .collect()
    }

    /// Images per prompt. At least the requested `n_predictions`.
    pub fn images_per_prompt(&self) -> usize {
        self.rounds * self.device_count
    }
}

/// Loaders for the three pipeline components.
pub struct ModelLoaders<'a> {
    pub generator: &'a dyn ModelLoader<Model = dyn ImageTokenGenerator>,
    pub decoder: &'a dyn ModelLoader<Model = dyn ImageTokenDecoder>,
    pub scorer: Option<&'a dyn ModelLoader<Model = dyn TextImageScorer>>,
}

struct Component<M: ?Sized> {
    model: Arc<M>,
    params: Replicated<ParamStore>,
}

/// Represents the models and provides methods to generate and rank images.
pub struct Pipeline {
    mesh: DeviceMesh,
    processor: PromptProcessor,
    generator: Component<dyn ImageTokenGenerator>,
    decoder: Component<dyn ImageTokenDecoder>,
    scorer: Option<Component<dyn TextImageScorer>>,
    silent: bool,
}

impl Pipeline {
    /// Build a pipeline from loaded models, replicating every parameter set across `mesh`.
    pub fn new(
        mesh: DeviceMesh,
        processor: PromptProcessor,
        generator: LoadedModel<dyn ImageTokenGenerator>,
        decoder: LoadedModel<dyn ImageTokenDecoder>,
        scorer: Option<LoadedModel<dyn TextImageScorer>>,
    ) -> Self {
        let generator = Component {
            params: mesh.replicate(generator.params),
            model: generator.model,
        };
        let decoder = Component {
            params: mesh.replicate(decoder.params),
            model: decoder.model,
        };
        let scorer = scorer.map(|scorer| Component {
            params: mesh.replicate(scorer.params),
            model: scorer.model,
        });
        Self {
            mesh,
            processor,
            generator,
            decoder,
            scorer,
            silent: false,
        }
    }

    /// Suppress progress bars and informational logs.
    pub fn with_silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    /// Load all models described by `config`.
    ///
    /// The prompt tokenizer is read from the generator's repository.
    pub fn load(config: &PipelineConfig, loaders: &ModelLoaders<'_>) -> anyhow::Result<Self> {
        let mesh = match config.devices {
            Some(devices) => DeviceMesh::new(devices)?,
            None => DeviceMesh::detect()?,
        };
        let token = config.token_source()?;

        let generator = loaders.generator.load(
            &config.generator.source(),
            config.generator.revision.clone(),
            config.generator.dtype,
        )?;
        let processor = PromptProcessor::from_source(
            &config.generator.source(),
            config.generator.revision.clone(),
            &token,
            config.silent,
            config.max_text_length,
        )?
        .with_normalization(config.normalize_text);
        let decoder = loaders.decoder.load(
            &config.decoder.source(),
            config.decoder.revision.clone(),
            config.decoder.dtype,
        )?;
        let scorer = match (&config.scorer, loaders.scorer) {
            (Some(source), Some(loader)) => Some(loader.load(
                &source.source(),
                source.revision.clone(),
                source.dtype,
            )?),
            (Some(_), None) => anyhow::bail!("A scorer is configured but no scorer loader was given."),
            (None, _) => None,
        };

        Ok(Self::new(mesh, processor, generator, decoder, scorer).with_silent(config.silent))
    }

    pub fn mesh(&self) -> &DeviceMesh {
        &self.mesh
    }

    pub fn has_scorer(&self) -> bool {
        self.scorer.is_some()
    }

    /// Generate at least `params.n_predictions` images for every prompt.
    ///
    /// All prompts are tokenized once and run together as a batch on every device.
    pub fn generate(
        &self,
        prompts: Vec<String>,
        params: &GenerationParams,
    ) -> anyhow::Result<Generation> {
        params.validate()?;
        let batch = self.mesh.replicate(self.processor.process(&prompts)?);
        let device_count = self.mesh.device_count();
        let rounds = round_count(params.n_predictions, device_count);

        let generation_loop = GenerationLoop {
            generate: GenerateStage {
                mesh: &self.mesh,
                model: self.generator.model.as_ref(),
                params: &self.generator.params,
                batch: &batch,
                sampling: &params.sampling,
            },
            decode: DecodeStage {
                mesh: &self.mesh,
                model: self.decoder.model.as_ref(),
                params: &self.decoder.params,
            },
            silent: self.silent,
        };
        let state = generation_loop.run(rounds, GenerationState::new(params.seed))?;

        if !self.silent {
            info!(
                "generated {} images for {} prompt(s).",
                state.images.len(),
                prompts.len()
            );
        }
        Ok(Generation {
            prompts,
            images: state.images,
            rounds,
            device_count,
        })
    }

    /// Score every image of `generation` against every prompt, as a `prompts x images` matrix.
    pub fn score(&self, generation: &Generation) -> anyhow::Result<Vec<Vec<f32>>> {
        let Some(scorer) = &self.scorer else {
            anyhow::bail!("This pipeline has no scorer.");
        };
        ScoreStage {
            mesh: &self.mesh,
            model: scorer.model.as_ref(),
            params: &scorer.params,
        }
        .run(&generation.prompts, &generation.images)
    }

    /// Rank the images of every prompt by descending score.
    pub fn rank(&self, generation: &Generation) -> anyhow::Result<Vec<PromptRanking>> {
        let logits = self.score(generation)?;
        let ranking = rank(&generation.prompts, &logits)?;
        if !self.silent {
            for entry in &ranking {
                if let Some(best) = entry.entries.first() {
                    info!(
                        "best image for {:?} is #{} with score {:.2}.",
                        entry.prompt, best.index, best.score
                    );
                }
            }
        }
        Ok(ranking)
    }

    /// Generate, then rank if a scorer is available.
    pub fn run(
        &self,
        prompts: Vec<String>,
        params: &GenerationParams,
    ) -> anyhow::Result<(Generation, Option<Vec<PromptRanking>>)> {
        let generation = self.generate(prompts, params)?;
        let ranking = if self.has_scorer() {
            Some(self.rank(&generation)?)
        } else {
            None
        };
        Ok((generation, ranking))
    }
}
