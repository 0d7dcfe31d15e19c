//! # Variational Auto-Encoder with a planar flow
//!
//! The encoder's Gaussian posterior is refined by a planar normalizing flow
//! before decoding, which loosens the diagonal-Gaussian restriction on the
//! approximate posterior. Trained by maximizing the flow-corrected ELBO.
use std::{f64::consts::PI, fs, path::Path};

use serde::{Deserialize, Serialize};
use tch::{nn, Device, Kind, Tensor};
use tracing::debug;

use self::{decoder::Decoder, encoder::Encoder, planar_flow::PlanarFlow};
use crate::{
    error::{Error, Result},
    utils::save_image_grid,
};

mod decoder;
mod encoder;
pub mod planar_flow;
pub mod train;

pub use self::train::{evaluate, fit, EpochStats};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainConfig {
    pub n_epochs: usize,
    pub b_size: i64,
    pub lr: f64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self { n_epochs: 10, b_size: 128, lr: 3e-4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VaeFlowConfig {
    pub in_channels: i64,
    pub img_size: i64,
    /// Dimension of the latent code.
    pub hidden_dim: i64,
    /// Number of planar flow layers.
    pub flow_size: i64,
    /// Channels of the encoder convolutions, mirrored by the decoder.
    pub conv_dims: Vec<i64>,
    pub train: TrainConfig,
}

impl Default for VaeFlowConfig {
    fn default() -> Self {
        Self {
            in_channels: 1,
            img_size: 32,
            hidden_dim: 32,
            flow_size: 64,
            conv_dims: vec![128, 256, 256, 512],
            train: TrainConfig::default(),
        }
    }
}

impl VaeFlowConfig {
    pub fn from_file<T: AsRef<std::path::Path>>(path: T) -> Result<Self> {
        let file = fs::read_to_string(path)?;
        let cfg: VaeFlowConfig = toml::from_str(&file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.conv_dims.is_empty() || self.conv_dims.iter().any(|d| *d < 1) {
            return Err(Error::InvalidConfig("conv_dims must be non-empty and positive".to_string()));
        }
        let factor = 1i64 << self.conv_dims.len();
        if self.img_size < factor || self.img_size % factor != 0 {
            return Err(Error::InvalidConfig(format!(
                "img_size {} must be a positive multiple of {factor}",
                self.img_size
            )));
        }
        if self.in_channels < 1 || self.hidden_dim < 1 || self.flow_size < 0 {
            return Err(Error::InvalidConfig(
                "in_channels and hidden_dim must be positive, flow_size non-negative".to_string(),
            ));
        }
        if self.train.b_size < 1 || !(self.train.lr > 0.) {
            return Err(Error::InvalidConfig("b_size and lr must be positive".to_string()));
        }
        Ok(())
    }
}

pub struct DiagonalGaussianDistribution {
    mean: Tensor,
    logvar: Tensor,
    std: Tensor,
}

impl DiagonalGaussianDistribution {
    pub fn new(mean: Tensor, logvar: Tensor) -> Self {
        let std = (&logvar * 0.5).exp();
        DiagonalGaussianDistribution { mean, logvar, std }
    }

    pub fn mean(&self) -> &Tensor {
        &self.mean
    }

    /// Reparameterized draw, differentiable with respect to mean and logvar.
    pub fn sample(&self) -> Tensor {
        &self.mean + &self.std * self.mean.randn_like()
    }

    /// Log-density summed over the feature dimension, `[b, d]` -> `[b]`.
    pub fn log_prob(&self, z: &Tensor) -> Tensor {
        let normalized = (z - &self.mean) / &self.std;
        let log_density = (normalized.square() + &self.logvar + (2. * PI).ln()) * -0.5;
        log_density.sum_dim_intlist(-1, false, Kind::Float)
    }

    /// Closed-form `KL(q || N(0, I))` per sample.
    pub fn kl_to_standard(&self) -> Tensor {
        let kl = (self.mean.square() + self.logvar.exp() - 1. - &self.logvar) * 0.5;
        kl.sum_dim_intlist(-1, false, Kind::Float)
    }
}

/// Log-density of the standard normal prior, `[b, d]` -> `[b]`.
pub fn standard_normal_log_prob(z: &Tensor) -> Tensor {
    ((z.square() + (2. * PI).ln()) * -0.5).sum_dim_intlist(-1, false, Kind::Float)
}

/// Reshapes flat image rows to `[b, c, s, s]`, resizes them to `img_size`
/// and maps pixel values from `[0, 1]` to `[-1, 1]`.
pub fn prepare_images(images: &Tensor, in_channels: i64, img_size: i64) -> Result<Tensor> {
    let images = match images.size().as_slice() {
        &[bsize, numel] => {
            let side = ((numel / in_channels) as f64).sqrt().round() as i64;
            if side * side * in_channels != numel {
                return Err(Error::InvalidInput(format!(
                    "{numel} values per image do not form {in_channels} square channels"
                )));
            }
            images.reshape([bsize, in_channels, side, side])
        }
        &[_, _, _, _] => images.shallow_clone(),
        size => return Err(Error::InvalidInput(format!("unexpected image batch shape {size:?}"))),
    };
    let (_, _, height, width) = images.size4()?;
    let images = if height != img_size || width != img_size {
        images.to_kind(Kind::Float).upsample_bilinear2d([img_size, img_size], false, None::<f64>, None::<f64>)
    } else {
        images.to_kind(Kind::Float)
    };
    Ok(images * 2. - 1.)
}

pub struct VaeFlowOutput {
    pub recon: Tensor,
    pub posterior: DiagonalGaussianDistribution,
    pub z0: Tensor,
    pub zk: Tensor,
    pub log_det: Tensor,
}

/// Per-batch loss terms, each a scalar averaged over the batch.
pub struct VaeFlowLoss {
    pub total: Tensor,
    pub recon: Tensor,
    pub kl: Tensor,
}

#[derive(Debug)]
pub struct VaeFlow {
    encoder: Encoder,
    decoder: Decoder,
    flow: PlanarFlow,
    device: Device,
    pub config: VaeFlowConfig,
}

impl VaeFlow {
    pub fn new(vs: nn::Path, config: VaeFlowConfig) -> Result<Self> {
        config.validate()?;
        let device = vs.device();
        let encoder = Encoder::new(
            &vs / "encoder",
            config.in_channels,
            config.img_size,
            config.hidden_dim,
            &config.conv_dims,
        );
        let decoder = Decoder::new(
            &vs / "decoder",
            config.in_channels,
            config.img_size,
            config.hidden_dim,
            &config.conv_dims,
        );
        let flow = PlanarFlow::new(&vs / "flow", config.flow_size, config.hidden_dim);
        Ok(Self { encoder, decoder, flow, device, config })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> VaeFlowOutput {
        let posterior = self.encoder.encode(xs, train);
        let z0 = posterior.sample();
        let (zk, log_det) = self.flow.forward(&z0);
        let recon = self.decoder.decode(&zk, train);
        VaeFlowOutput { recon, posterior, z0, zk, log_det }
    }

    /// Negative ELBO: squared reconstruction error plus the flow-corrected
    /// `log q0(z0) - sum log|det| - log p(zK)`.
    pub fn loss(&self, xs: &Tensor, out: &VaeFlowOutput) -> VaeFlowLoss {
        let recon = (xs - &out.recon).square().flatten(1, -1).sum_dim_intlist(-1, false, Kind::Float);
        let kl = out.posterior.log_prob(&out.z0) - &out.log_det - standard_normal_log_prob(&out.zk);
        let total = (&recon + &kl).mean(Kind::Float);
        VaeFlowLoss { total, recon: recon.mean(Kind::Float), kl: kl.mean(Kind::Float) }
    }

    /// Decodes `n` draws from the prior.
    pub fn sample(&self, n: i64, device: Device) -> Tensor {
        let noise = Tensor::randn([n, self.config.hidden_dim], (Kind::Float, device));
        self.decoder.sample(&noise)
    }

    /// Decodes `n` prior draws in chunks of at most `b_size` and writes them
    /// to `out_dir` as `0.png`, `1.png`, ... Returns the number of images.
    pub fn save_samples<T: AsRef<Path>>(&self, n: i64, b_size: i64, out_dir: T) -> Result<i64> {
        if n < 0 || b_size < 1 {
            return Err(Error::InvalidInput(format!("cannot save {n} samples in batches of {b_size}")));
        }
        let out_dir = out_dir.as_ref();
        fs::create_dir_all(out_dir)?;
        let mut start = 0;
        while start < n {
            let len = b_size.min(n - start);
            let images = self.sample(len, self.device);
            for i in 0..len {
                save_image_grid(&images.narrow(0, i, 1), out_dir.join(format!("{}.png", start + i)))?;
            }
            debug!(start, len, "saved sample chunk");
            start += len;
        }
        Ok(n)
    }
}
