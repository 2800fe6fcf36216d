use std::{str::FromStr, sync::Arc};

use dalle_rs_core::{
    DeviceMesh, GenerationParams, ImageTokenDecoder, ImageTokenGenerator, LoadedModel, ParamStore,
    PixelArray, Pipeline, PrngKey, PromptProcessor, SamplingParams, TextImageScorer,
    TokenizedBatch,
};
use image::RgbImage;
use tokenizers::Tokenizer;

const BOS: u32 = 16384;

fn tokenizer() -> Tokenizer {
    let json = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"<pad>": 0, "<unk>": 1, "cat": 2, "dog": 3, "bird": 4},
            "unk_token": "<unk>"
        }
    }"#;
    Tokenizer::from_str(json).expect("valid tokenizer json")
}

/// Emits `[BOS, first prompt token, key tag]` per prompt.
struct TagGenerator {
    rows: Option<usize>,
}

fn key_tag(key: PrngKey) -> u32 {
    (key.seed() % 200) as u32 + 1
}

impl ImageTokenGenerator for TagGenerator {
    fn bos_token_id(&self) -> u32 {
        BOS
    }

    fn generate(
        &self,
        _params: &ParamStore,
        batch: &TokenizedBatch,
        key: PrngKey,
        _sampling: &SamplingParams,
    ) -> anyhow::Result<Vec<Vec<u32>>> {
        let rows = self.rows.unwrap_or(batch.len());
        Ok(batch
            .input_ids
            .iter()
            .cycle()
            .take(rows)
            .map(|ids| vec![BOS, ids[0], key_tag(key)])
            .collect())
    }
}

/// Decodes `[a, b]` into a 1x1 pixel with red `a` and green `b`.
struct TagDecoder;

fn channel(value: u32) -> f32 {
    (value as f32 + 0.5) / 255.0
}

impl ImageTokenDecoder for TagDecoder {
    fn decode(&self, _params: &ParamStore, tokens: &[Vec<u32>]) -> anyhow::Result<Vec<PixelArray>> {
        tokens
            .iter()
            .map(|t| PixelArray::new(1, 1, vec![channel(t[0]), channel(t[1]), 0.0]))
            .collect()
    }
}

/// Scores `red * 1000 + green + 0.5 * text length`.
struct TagScorer;

fn expected_score(image: &RgbImage, text: &str) -> f32 {
    let [r, g, _] = image.get_pixel(0, 0).0;
    f32::from(r) * 1000.0 + f32::from(g) + 0.5 * text.len() as f32
}

impl TextImageScorer for TagScorer {
    fn logits_per_image(
        &self,
        _params: &ParamStore,
        texts: &[String],
        images: &[RgbImage],
    ) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(images
            .iter()
            .map(|img| texts.iter().map(|t| expected_score(img, t)).collect())
            .collect())
    }
}

/// Emits sequences without the leading BOS.
struct NoBosGenerator;

impl ImageTokenGenerator for NoBosGenerator {
    fn bos_token_id(&self) -> u32 {
        BOS
    }

    fn generate(
        &self,
        _params: &ParamStore,
        batch: &TokenizedBatch,
        key: PrngKey,
        _sampling: &SamplingParams,
    ) -> anyhow::Result<Vec<Vec<u32>>> {
        Ok(batch
            .input_ids
            .iter()
            .map(|ids| vec![ids[0], key_tag(key)])
            .collect())
    }
}

/// Decodes one image fewer than it is given.
struct ShortDecoder;

impl ImageTokenDecoder for ShortDecoder {
    fn decode(&self, params: &ParamStore, tokens: &[Vec<u32>]) -> anyhow::Result<Vec<PixelArray>> {
        let mut pixels = TagDecoder.decode(params, tokens)?;
        pixels.pop();
        Ok(pixels)
    }
}

/// Returns one score per image instead of one per text.
struct NarrowScorer;

impl TextImageScorer for NarrowScorer {
    fn logits_per_image(
        &self,
        _params: &ParamStore,
        _texts: &[String],
        images: &[RgbImage],
    ) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(images.iter().map(|_| vec![0.0]).collect())
    }
}

fn loaded<M: ?Sized>(model: Arc<M>) -> LoadedModel<M> {
    LoadedModel {
        model,
        params: ParamStore::new(),
    }
}

fn pipeline(devices: usize, scorer: bool) -> anyhow::Result<Pipeline> {
    pipeline_with(devices, scorer, TagGenerator { rows: None })
}

fn pipeline_with(devices: usize, scorer: bool, generator: TagGenerator) -> anyhow::Result<Pipeline> {
    build_pipeline(
        devices,
        Arc::new(generator),
        Arc::new(TagDecoder),
        scorer.then(|| Arc::new(TagScorer) as Arc<dyn TextImageScorer>),
    )
}

fn build_pipeline(
    devices: usize,
    generator: Arc<dyn ImageTokenGenerator>,
    decoder: Arc<dyn ImageTokenDecoder>,
    scorer: Option<Arc<dyn TextImageScorer>>,
) -> anyhow::Result<Pipeline> {
    Ok(Pipeline::new(
        DeviceMesh::new(devices)?,
        PromptProcessor::new(tokenizer(), 4)?,
        loaded(generator),
        loaded(decoder),
        scorer.map(loaded),
    )
    .with_silent(true))
}

fn prompts() -> Vec<String> {
    vec!["cat".to_string(), "dog".to_string()]
}

fn params(n_predictions: usize, seed: u64) -> GenerationParams {
    GenerationParams {
        n_predictions,
        ..GenerationParams::new(seed)
    }
}

fn red(image: &RgbImage) -> u8 {
    image.get_pixel(0, 0).0[0]
}

#[test]
fn four_devices_eight_predictions_take_two_rounds() -> anyhow::Result<()> {
    let generation = pipeline(4, false)?.generate(prompts(), &params(8, 0))?;
    assert_eq!(generation.rounds, 2);
    assert_eq!(generation.images.len(), 2 * 4 * 2);
    assert_eq!(generation.images_per_prompt(), 8);
    Ok(())
}

#[test]
fn single_device_runs_one_round_per_prediction() -> anyhow::Result<()> {
    let generation = pipeline(1, false)?.generate(prompts(), &params(3, 0))?;
    assert_eq!(generation.rounds, 3);
    assert_eq!(generation.images.len(), 3 * 2);
    Ok(())
}

#[test]
fn image_count_rounds_up_to_device_multiple() -> anyhow::Result<()> {
    let generation = pipeline(4, false)?.generate(prompts(), &params(5, 0))?;
    assert_eq!(generation.rounds, 2);
    assert_eq!(generation.images.len(), 16);
    assert!(generation.images_per_prompt() >= 5);
    Ok(())
}

#[test]
fn images_are_prompt_minor() -> anyhow::Result<()> {
    let generation = pipeline(3, false)?.generate(prompts(), &params(6, 9))?;
    // "cat" is token 2 and "dog" token 3.
    for (j, image) in generation.images.iter().enumerate() {
        assert_eq!(red(image), [2, 3][j % 2], "image {j}");
    }
    assert!(generation.images_for(1).iter().all(|img| red(img) == 3));
    assert_eq!(generation.images_for(0).len(), 6);
    Ok(())
}

#[test]
fn same_seed_same_images() -> anyhow::Result<()> {
    let pipeline = pipeline(2, false)?;
    let raw = |seed| -> anyhow::Result<Vec<Vec<u8>>> {
        Ok(pipeline
            .generate(prompts(), &params(8, seed))?
            .images
            .into_iter()
            .map(|img| img.into_raw())
            .collect())
    };
    assert_eq!(raw(1234)?, raw(1234)?);
    assert_ne!(raw(1234)?, raw(4321)?);
    Ok(())
}

#[test]
fn devices_within_a_round_get_distinct_keys() -> anyhow::Result<()> {
    let generation = pipeline(4, false)?.generate(vec!["bird".to_string()], &params(4, 77))?;
    let greens = generation
        .images
        .iter()
        .map(|img| img.get_pixel(0, 0).0[1])
        .collect::<std::collections::HashSet<_>>();
    assert!(greens.len() > 1);
    Ok(())
}

#[test]
fn scores_are_assembled_per_prompt_and_image() -> anyhow::Result<()> {
    let pipeline = pipeline(2, true)?;
    let generation = pipeline.generate(prompts(), &params(4, 5))?;
    let scores = pipeline.score(&generation)?;
    assert_eq!(scores.len(), 2);
    for (i, row) in scores.iter().enumerate() {
        assert_eq!(row.len(), generation.images.len());
        for (j, score) in row.iter().enumerate() {
            assert_eq!(
                *score,
                expected_score(&generation.images[j], &generation.prompts[i])
            );
        }
    }
    Ok(())
}

#[test]
fn ranking_is_strided_and_descending() -> anyhow::Result<()> {
    let pipeline = pipeline(2, true)?;
    let (generation, ranking) = pipeline.run(prompts(), &params(6, 11))?;
    let ranking = ranking.expect("scorer is configured");
    assert_eq!(ranking.len(), 2);
    for (i, prompt) in ranking.iter().enumerate() {
        assert_eq!(prompt.prompt, generation.prompts[i]);
        assert_eq!(prompt.entries.len(), generation.images_per_prompt());
        let mut indices = prompt.entries.iter().map(|e| e.index).collect::<Vec<_>>();
        assert!(indices.iter().all(|j| j % 2 == i));
        indices.sort();
        assert_eq!(
            indices,
            (0..generation.images_per_prompt())
                .map(|k| k * 2 + i)
                .collect::<Vec<_>>()
        );
        assert!(prompt
            .entries
            .windows(2)
            .all(|w| w[0].score >= w[1].score));
    }
    Ok(())
}

#[test]
fn no_scorer_means_no_ranking() -> anyhow::Result<()> {
    let pipeline = pipeline(2, false)?;
    let (generation, ranking) = pipeline.run(prompts(), &params(2, 0))?;
    assert!(ranking.is_none());
    assert!(pipeline.rank(&generation).is_err());
    Ok(())
}

#[test]
fn generator_row_mismatch_aborts() -> anyhow::Result<()> {
    let pipeline = pipeline_with(2, false, TagGenerator { rows: Some(3) })?;
    assert!(pipeline.generate(prompts(), &params(2, 0)).is_err());
    Ok(())
}

#[test]
fn invalid_sampling_aborts_before_generation() -> anyhow::Result<()> {
    let mut params = params(2, 0);
    params.sampling.top_p = Some(0.0);
    assert!(pipeline(1, false)?.generate(prompts(), &params).is_err());
    Ok(())
}

#[test]
fn zero_predictions_yield_no_images() -> anyhow::Result<()> {
    let pipeline = pipeline(2, true)?;
    let (generation, ranking) = pipeline.run(prompts(), &params(0, 0))?;
    assert!(generation.images.is_empty());
    let ranking = ranking.expect("scorer is configured");
    assert!(ranking.iter().all(|r| r.entries.is_empty()));
    Ok(())
}

#[test]
fn unknown_prompt_has_no_images() -> anyhow::Result<()> {
    let generation = pipeline(2, false)?.generate(prompts(), &params(2, 0))?;
    assert!(generation.images_for(2).is_empty());
    assert!(generation.images_for(3).is_empty());
    assert_eq!(generation.images_for(1).len(), 2);
    Ok(())
}

#[test]
fn sequence_without_bos_aborts() -> anyhow::Result<()> {
    let pipeline = build_pipeline(2, Arc::new(NoBosGenerator), Arc::new(TagDecoder), None)?;
    let err = pipeline
        .generate(prompts(), &params(2, 0))
        .err()
        .map(|e| e.to_string())
        .unwrap_or_default();
    assert!(err.contains("BOS"), "{err}");
    Ok(())
}

#[test]
fn decoder_count_mismatch_aborts() -> anyhow::Result<()> {
    let pipeline = build_pipeline(
        2,
        Arc::new(TagGenerator { rows: None }),
        Arc::new(ShortDecoder),
        None,
    )?;
    let err = pipeline
        .generate(prompts(), &params(2, 0))
        .err()
        .map(|e| e.to_string())
        .unwrap_or_default();
    assert!(err.contains("Decoder returned 1 images for 2 sequences"), "{err}");
    Ok(())
}

#[test]
fn badly_shaped_scores_abort() -> anyhow::Result<()> {
    let pipeline = build_pipeline(
        2,
        Arc::new(TagGenerator { rows: None }),
        Arc::new(TagDecoder),
        Some(Arc::new(NarrowScorer) as Arc<dyn TextImageScorer>),
    )?;
    let generation = pipeline.generate(prompts(), &params(2, 0))?;
    let err = pipeline
        .score(&generation)
        .err()
        .map(|e| e.to_string())
        .unwrap_or_default();
    assert!(err.contains("badly shaped logits"), "{err}");
    assert!(pipeline.run(prompts(), &params(2, 0)).is_err());
    Ok(())
}
