use std::{fs, path::PathBuf, sync::Arc, time::Instant};

use dalle_rs_core::{
    DeviceMesh, GenerationParams, ImageTokenDecoder, ImageTokenGenerator, LoadedModel,
    ModelLoaders, ParamStore, Pipeline, PipelineConfig, PromptProcessor, SamplingParams,
    TextImageScorer,
};
use dalle_rs_examples::{
    demo_tokenizer, palette_loaders, palette_params, ColorScorer, PaletteConfig, PaletteDecoder,
    PaletteGenerator,
};

use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Args {
    /// Prompt to use. May be given several times.
    #[arg(short, long, required = true)]
    prompt: Vec<String>,

    /// Images to generate per prompt
    #[arg(short, long, default_value_t = 8)]
    n_predictions: usize,

    /// Random seed. Picked at random when absent.
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    top_k: Option<usize>,

    #[arg(long)]
    top_p: Option<f32>,

    #[arg(long)]
    temperature: Option<f32>,

    #[arg(long, default_value_t = 10.0)]
    condition_scale: f32,

    /// Number of devices to run on. Defaults to the detected count.
    #[arg(short, long)]
    devices: Option<usize>,

    /// JSON pipeline configuration pointing at palette model repositories
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Where to write the images
    #[arg(short, long, default_value = "palette_out")]
    out_dir: PathBuf,
}

fn in_memory_pipeline(devices: Option<usize>) -> anyhow::Result<Pipeline> {
    let cfg = PaletteConfig::default();
    let mesh = match devices {
        Some(devices) => DeviceMesh::new(devices)?,
        None => DeviceMesh::detect()?,
    };
    Ok(Pipeline::new(
        mesh,
        PromptProcessor::new(demo_tokenizer()?, 16)?,
        LoadedModel {
            model: Arc::new(PaletteGenerator::new(cfg.clone())) as Arc<dyn ImageTokenGenerator>,
            params: ParamStore::new(),
        },
        LoadedModel {
            params: palette_params(&cfg)?,
            model: Arc::new(PaletteDecoder::new(cfg)) as Arc<dyn ImageTokenDecoder>,
        },
        Some(LoadedModel {
            model: Arc::new(ColorScorer) as Arc<dyn TextImageScorer>,
            params: ParamStore::new(),
        }),
    ))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let pipeline = match &args.config {
        Some(path) => {
            let mut config = PipelineConfig::from_json_file(path)?;
            if args.devices.is_some() {
                config.devices = args.devices;
            }
            let (generator, decoder, scorer) =
                palette_loaders(config.token_source()?, config.silent);
            Pipeline::load(
                &config,
                &ModelLoaders {
                    generator: &generator,
                    decoder: &decoder,
                    scorer: Some(&scorer),
                },
            )?
        }
        None => in_memory_pipeline(args.devices)?,
    };

    let seed = args.seed.unwrap_or_else(rand::random);
    println!("Seed: {seed}");

    let params = GenerationParams {
        n_predictions: args.n_predictions,
        seed,
        sampling: SamplingParams {
            top_k: args.top_k,
            top_p: args.top_p,
            temperature: args.temperature,
            condition_scale: Some(args.condition_scale),
        },
    };

    let start = Instant::now();

    let (generation, ranking) = pipeline.run(args.prompt, &params)?;

    let end = Instant::now();
    println!("Took: {:.2}s", end.duration_since(start).as_secs_f32());

    fs::create_dir_all(&args.out_dir)?;
    match ranking {
        Some(ranking) => {
            for (i, prompt) in ranking.iter().enumerate() {
                println!("{:?}", prompt.prompt);
                for (r, entry) in prompt.entries.iter().enumerate() {
                    let path = args.out_dir.join(format!("prompt{i}_rank{r}.png"));
                    generation.images[entry.index].save(&path)?;
                    println!("  #{r}: image {} score {:.2}", entry.index, entry.score);
                }
            }
        }
        None => {
            for i in 0..generation.prompts.len() {
                for (k, image) in generation.images_for(i).into_iter().enumerate() {
                    image.save(args.out_dir.join(format!("prompt{i}_image{k}.png")))?;
                }
            }
        }
    }

    Ok(())
}
