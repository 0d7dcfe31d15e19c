use tch::{nn, Tensor};

use super::DiagonalGaussianDistribution;

/// Convolutional encoder producing the parameters of the approximate posterior.
#[derive(Debug)]
pub struct Encoder {
    down_blocks: Vec<(nn::Conv2D, nn::BatchNorm)>,
    fc_mu: nn::Linear,
    fc_logvar: nn::Linear,
}

impl Encoder {
    pub fn new(vs: nn::Path, in_channels: i64, img_size: i64, hidden_dim: i64, conv_dims: &[i64]) -> Self {
        let conv_cfg = nn::ConvConfig { stride: 2, padding: 1, ..Default::default() };
        let vs_down_blocks = &vs / "down_blocks";
        let mut down_blocks = vec![];
        let mut channels = in_channels;
        for (index, &out_channels) in conv_dims.iter().enumerate() {
            let vs_block = &vs_down_blocks / index;
            let conv = nn::conv2d(&vs_block / "conv", channels, out_channels, 3, conv_cfg);
            let norm = nn::batch_norm2d(&vs_block / "norm", out_channels, Default::default());
            down_blocks.push((conv, norm));
            channels = out_channels;
        }
        let reduced_size = img_size >> conv_dims.len();
        let flat_dim = channels * reduced_size * reduced_size;
        let fc_mu = nn::linear(&vs / "fc_mu", flat_dim, hidden_dim, Default::default());
        let fc_logvar = nn::linear(&vs / "fc_logvar", flat_dim, hidden_dim, Default::default());
        Self { down_blocks, fc_mu, fc_logvar }
    }

    /// `[b, c, s, s]` -> posterior over `[b, hidden_dim]`
    pub fn encode(&self, xs: &Tensor, train: bool) -> DiagonalGaussianDistribution {
        let mut xs = xs.shallow_clone();
        for (conv, norm) in self.down_blocks.iter() {
            xs = xs.apply(conv).apply_t(norm, train).leaky_relu();
        }
        let xs = xs.flatten(1, -1);
        DiagonalGaussianDistribution::new(xs.apply(&self.fc_mu), xs.apply(&self.fc_logvar))
    }
}
