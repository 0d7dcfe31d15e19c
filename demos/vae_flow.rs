use anyhow::Result;
use clap::Parser;
use score_gen::{
    utils::get_device,
    vae::{fit, VaeFlow, VaeFlowConfig},
};
use tch::nn;

#[derive(Parser)]
#[command(author, version, about = "Train a VAE with a planar flow on MNIST", long_about = None)]
struct Args {
    /// Base config; the flags below override its fields.
    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    n_epochs: Option<usize>,

    #[arg(long)]
    b_size: Option<i64>,

    #[arg(long)]
    lr: Option<f64>,

    #[arg(long)]
    img_size: Option<i64>,

    /// Directory holding the raw MNIST files; samples are written below it.
    #[arg(long, default_value = "data")]
    data_path: String,

    #[arg(long)]
    h_dim: Option<i64>,

    #[arg(long)]
    flow_size: Option<i64>,

    #[arg(long, num_args = 1..)]
    conv_dims: Option<Vec<i64>>,

    /// Number of images decoded from the prior after training.
    #[arg(long, default_value = "10000", value_parser = clap::value_parser!(i64).range(1..))]
    n_valid: i64,

    #[arg(long, action)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long, action)]
    tracing: bool,
}

impl Args {
    fn vae_config(&self) -> Result<VaeFlowConfig> {
        let mut cfg = match &self.config {
            Some(path) => VaeFlowConfig::from_file(path)?,
            None => VaeFlowConfig::default(),
        };
        if let Some(n_epochs) = self.n_epochs {
            cfg.train.n_epochs = n_epochs;
        }
        if let Some(b_size) = self.b_size {
            cfg.train.b_size = b_size;
        }
        if let Some(lr) = self.lr {
            cfg.train.lr = lr;
        }
        if let Some(img_size) = self.img_size {
            cfg.img_size = img_size;
        }
        if let Some(h_dim) = self.h_dim {
            cfg.hidden_dim = h_dim;
        }
        if let Some(flow_size) = self.flow_size {
            cfg.flow_size = flow_size;
        }
        if let Some(conv_dims) = &self.conv_dims {
            cfg.conv_dims = conv_dims.clone();
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn run(args: Args) -> Result<()> {
    let cfg = args.vae_config()?;
    let device = get_device(args.cpu);
    let dataset = tch::vision::mnist::load_dir(&args.data_path)?;
    tracing::info!(
        ?device,
        train = dataset.train_images.size()[0],
        test = dataset.test_images.size()[0],
        "loaded mnist"
    );

    let vs = nn::VarStore::new(device);
    let model = VaeFlow::new(vs.root(), cfg.clone())?;
    let history = fit(&vs, &model, &dataset, &cfg.train)?;
    if let Some(last) = history.last() {
        tracing::info!(train_loss = last.train_loss, test_loss = last.test_loss, "training done");
    }

    let out_dir = std::path::Path::new(&args.data_path).join("sampling").join("vae_flows");
    let n_saved = model.save_samples(args.n_valid, cfg.train.b_size, &out_dir)?;
    tracing::info!(n_saved, out_dir = %out_dir.display(), "saved samples");
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
