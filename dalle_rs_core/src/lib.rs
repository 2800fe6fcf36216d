//! Core crate for interacting with dalle_rs.
//!
//! A [`Pipeline`] wires three models together: a generator turning prompts into image tokens, a
//! decoder turning image tokens into pixels and an optional scorer ranking the images against their
//! prompts. Every model call runs data-parallel over a [`DeviceMesh`].
//!
//! ```rust,no_run
//! use std::time::Instant;
//!
//! use dalle_rs_core::{
//!     GenerationParams, HubLoader, ImageTokenDecoder, ImageTokenGenerator, ModelLoaders,
//!     Pipeline, PipelineConfig, TextImageScorer, TokenSource,
//! };
//!
//! // Register the architectures you have implementations for.
//! let generator = HubLoader::<dyn ImageTokenGenerator>::new(TokenSource::CacheToken, false);
//! let decoder = HubLoader::<dyn ImageTokenDecoder>::new(TokenSource::CacheToken, false);
//! let scorer = HubLoader::<dyn TextImageScorer>::new(TokenSource::CacheToken, false);
//!
//! let pipeline = Pipeline::load(
//!     &PipelineConfig::default(),
//!     &ModelLoaders {
//!         generator: &generator,
//!         decoder: &decoder,
//!         scorer: Some(&scorer),
//!     },
//! )?;
//!
//! let start = Instant::now();
//!
//! let (generation, ranking) = pipeline.run(
//!     vec!["sunset over a lake in the mountains".to_string()],
//!     &GenerationParams::new(42),
//! )?;
//!
//! let end = Instant::now();
//! println!("Took: {:.2}s", end.duration_since(start).as_secs_f32());
//!
//! if let Some(ranking) = ranking {
//!     let best = ranking[0].entries[0];
//!     generation.images[best.index].save("image.png")?;
//! }
//!
//! # Ok::<(), anyhow::Error>(())
//! ```

mod config;
mod models;
mod params;
mod pipelines;
mod util;

pub use config::{
    ComponentSource, PipelineConfig, DEFAULT_DECODER_ID, DEFAULT_DECODER_REVISION,
    DEFAULT_GENERATOR_ID, DEFAULT_SCORER_ID,
};
pub use dalle_rs_common::{
    DType, Device, DeviceMesh, ModelSource, ParamData, ParamStore, ParamTensor, PrngKey,
    TokenSource,
};
pub use models::{ImageTokenDecoder, ImageTokenGenerator, PixelArray, TextImageScorer};
pub use params::{
    GenerationParams, ParamsError, SamplingParams, DEFAULT_CONDITION_SCALE, DEFAULT_N_PREDICTIONS,
};
pub use pipelines::{
    flat_index, prompt_image_indices, rank, round_count, Generation, GenerationState, HubLoader,
    LoadedModel, ModelConstructor, ModelLoader, ModelLoaders, Pipeline, PromptProcessor,
    PromptRanking, RankedImage, ResolvedComponent, TokenizedBatch, DEFAULT_MAX_TEXT_LENGTH,
};
pub use util::{ModelDType, TryIntoDType};
