use anyhow::Result;
use clap::Parser;
use score_gen::{
    langevin::{LangevinConfig, LangevinSampler},
    unet::{ScoreUNet, ScoreUNetConfig},
    utils::get_device,
};
use tch::nn;

#[derive(Parser)]
#[command(author, version, about = "Annealed Langevin sampling with a score UNet", long_about = None)]
struct Args {
    /// Sampler config (step size, steps per level, noise schedule).
    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    unet_config: Option<String>,

    /// Trained UNet weights; a randomly initialized network is used otherwise.
    #[arg(long)]
    weights: Option<String>,

    #[arg(long, default_value = "./langevin_final.png")]
    output: String,

    #[arg(long, default_value = "16", value_parser = clap::value_parser!(i64).range(1..))]
    n_samples: i64,

    #[arg(long, default_value = "32", value_parser = clap::value_parser!(i64).range(1..))]
    image_size: i64,

    #[arg(long, default_value = "9527")]
    seed: i64,

    /// Save intermediary snapshots next to the final image.
    #[arg(long, action)]
    intermediary_images: bool,

    /// With `--intermediary-images`, keep one snapshot out of this many.
    #[arg(long, default_value = "1")]
    save_every: usize,

    #[arg(long, action)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long, action)]
    tracing: bool,
}

fn run(args: Args) -> Result<()> {
    let Args {
        config,
        unet_config,
        weights,
        output,
        n_samples,
        image_size,
        seed,
        intermediary_images,
        save_every,
        cpu,
        tracing: _,
    } = args;
    let config = match config {
        Some(path) => LangevinConfig::from_file(path)?,
        None => LangevinConfig::default(),
    };
    let unet_config = match unet_config {
        Some(path) => ScoreUNetConfig::from_file(path)?,
        None => ScoreUNetConfig::default(),
    };
    if image_size % unet_config.resolution_multiple() != 0 {
        anyhow::bail!(
            "image size {image_size} is not a multiple of {}",
            unet_config.resolution_multiple()
        );
    }

    let device = get_device(cpu);
    tracing::info!(?device, "building score network");
    let mut vs = nn::VarStore::new(device);
    let channels = unet_config.in_channels;
    let unet = ScoreUNet::new(vs.root(), unet_config)?;
    match weights {
        Some(weights) => vs.load(weights)?,
        None => tracing::warn!("no weights given, sampling from an untrained network"),
    }

    let sampler = LangevinSampler::new(unet, config, device)?;
    let sigmas = sampler.schedule().sigmas();
    tracing::info!(sigma_max = sigmas[0], sigma_min = sampler.schedule().last(), "noise schedule");
    let save_every = intermediary_images.then_some(save_every);
    sampler.run(&output, save_every, n_samples, channels, image_size, seed)?;
    Ok(())
}

fn main() -> Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;

    let args = Args::parse();
    let _guard = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();
        None
    };
    run(args)
}
