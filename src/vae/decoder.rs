use tch::{nn, Tensor};

/// Mirror of the encoder: a linear layer back to the coarsest feature map,
/// then stride-2 transposed convolutions up to the image size.
#[derive(Debug)]
pub struct Decoder {
    fc: nn::Linear,
    up_blocks: Vec<(nn::ConvTranspose2D, nn::BatchNorm)>,
    conv_out: nn::Conv2D,
    top_channels: i64,
    reduced_size: i64,
}

impl Decoder {
    pub fn new(vs: nn::Path, out_channels: i64, img_size: i64, hidden_dim: i64, conv_dims: &[i64]) -> Self {
        let n_dims = conv_dims.len();
        let top_channels = conv_dims[n_dims - 1];
        let reduced_size = img_size >> n_dims;
        let fc = nn::linear(
            &vs / "fc",
            hidden_dim,
            top_channels * reduced_size * reduced_size,
            Default::default(),
        );

        let deconv_cfg =
            nn::ConvTransposeConfig { stride: 2, padding: 1, output_padding: 1, ..Default::default() };
        let vs_up_blocks = &vs / "up_blocks";
        // one up-sampling per encoder down-sampling; the last keeps the width
        let mut up_blocks = vec![];
        for (index, i) in (0..n_dims).rev().enumerate() {
            let in_channels = conv_dims[i];
            let out_channels = if i > 0 { conv_dims[i - 1] } else { conv_dims[0] };
            let vs_block = &vs_up_blocks / index;
            let deconv = nn::conv_transpose2d(&vs_block / "deconv", in_channels, out_channels, 3, deconv_cfg);
            let norm = nn::batch_norm2d(&vs_block / "norm", out_channels, Default::default());
            up_blocks.push((deconv, norm));
        }

        let conv_cfg = nn::ConvConfig { padding: 1, ..Default::default() };
        let conv_out = nn::conv2d(&vs / "conv_out", conv_dims[0], out_channels, 3, conv_cfg);
        Self { fc, up_blocks, conv_out, top_channels, reduced_size }
    }

    /// `[b, hidden_dim]` -> `[b, c, s, s]` in `[-1, 1]`
    pub fn decode(&self, zs: &Tensor, train: bool) -> Tensor {
        let mut xs = zs
            .apply(&self.fc)
            .reshape([-1, self.top_channels, self.reduced_size, self.reduced_size]);
        for (deconv, norm) in self.up_blocks.iter() {
            xs = xs.apply(deconv).apply_t(norm, train).leaky_relu();
        }
        xs.apply(&self.conv_out).tanh()
    }

    /// Decodes latent noise into images without tracking gradients.
    pub fn sample(&self, noise: &Tensor) -> Tensor {
        tch::no_grad(|| self.decode(noise, false))
    }
}
