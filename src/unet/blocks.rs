use tch::{nn::{self, Module}, Tensor};

use super::{attention::AttLayer, resnet::ResBlock};

/// Halves the spatial resolution.
#[derive(Debug)]
pub struct DownSample {
    conv: nn::Conv2D,
}

impl DownSample {
    pub fn new(vs: nn::Path, _in_channels: i64, out_channels: i64) -> Self {
        let conv_cfg = nn::ConvConfig { stride: 2, padding: 1, ..Default::default() };
        let conv = nn::conv2d(&vs / "conv", out_channels, out_channels, 3, conv_cfg);
        Self { conv }
    }
}

impl Module for DownSample {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.conv)
    }
}

/// Doubles the spatial resolution. When the block widens (`in < out`) the
/// channel count is halved on the way up.
#[derive(Debug)]
pub struct UpSample {
    conv: nn::ConvTranspose2D,
    out_channels: i64,
}

impl UpSample {
    pub fn new(vs: nn::Path, in_channels: i64, out_channels: i64) -> Self {
        let out = if in_channels < out_channels { out_channels / 2 } else { out_channels };
        let conv_cfg = nn::ConvTransposeConfig { stride: 2, padding: 1, ..Default::default() };
        let conv = nn::conv_transpose2d(&vs / "conv", out_channels, out, 4, conv_cfg);
        Self { conv, out_channels: out }
    }
}

impl Module for UpSample {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.conv)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sample {
    Down,
    Up,
}

#[derive(Debug, Clone, Copy)]
pub struct UnetBlockConfig {
    pub num_res: i64,
    pub sample: Option<Sample>,
    pub is_attn: bool,
    pub n_groups: i64,
    pub n_heads: i64,
}

impl Default for UnetBlockConfig {
    fn default() -> Self {
        Self { num_res: 2, sample: None, is_attn: false, n_groups: 32, n_heads: 1 }
    }
}

#[derive(Debug)]
enum UnetLayer {
    Res(ResBlock),
    Attn(AttLayer),
    Down(DownSample),
    Up(UpSample),
}

/// A stack of residual blocks, attention between them when enabled, and an
/// optional down or up sampler at the end.
#[derive(Debug)]
pub struct UnetBlock {
    layers: Vec<UnetLayer>,
    output_channels: i64,
    pub config: UnetBlockConfig,
}

impl UnetBlock {
    pub fn new(
        vs: nn::Path,
        in_channels: i64,
        out_channels: i64,
        n_embed: i64,
        config: UnetBlockConfig,
    ) -> Self {
        let vs_block = &vs / "block";
        let mut layers = vec![];
        let mut channels = in_channels;
        for i in 0..config.num_res {
            let res = ResBlock::new(&vs_block / layers.len(), channels, out_channels, n_embed, config.n_groups);
            layers.push(UnetLayer::Res(res));
            if config.is_attn && i != config.num_res - 1 {
                let attn = AttLayer::new(&vs_block / layers.len(), out_channels, config.n_heads);
                layers.push(UnetLayer::Attn(attn));
            }
            channels = out_channels;
        }
        let mut output_channels = out_channels;
        match config.sample {
            Some(Sample::Down) => {
                let down = DownSample::new(&vs_block / layers.len(), in_channels, out_channels);
                layers.push(UnetLayer::Down(down));
            }
            Some(Sample::Up) => {
                let up = UpSample::new(&vs_block / layers.len(), in_channels, out_channels);
                output_channels = up.out_channels;
                layers.push(UnetLayer::Up(up));
            }
            None => {}
        }
        Self { layers, output_channels, config }
    }

    /// Channel count of the first tensor returned by `forward`.
    pub fn output_channels(&self) -> i64 {
        self.output_channels
    }

    /// Returns `(down(x), x)` for a down-sampling block, the second element
    /// being the skip connection taken before down-sampling, and `(x, None)`
    /// otherwise.
    pub fn forward(&self, xs: &Tensor, t_emb: &Tensor) -> (Tensor, Option<Tensor>) {
        let mut xs = xs.shallow_clone();
        for layer in self.layers.iter() {
            xs = match layer {
                UnetLayer::Res(res) => res.forward(&xs, t_emb),
                UnetLayer::Attn(attn) => xs.apply(attn),
                UnetLayer::Down(down) => return (xs.apply(down), Some(xs)),
                UnetLayer::Up(up) => xs.apply(up),
            };
        }
        (xs, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    fn inputs(channels: i64, size: i64) -> (Tensor, Tensor) {
        let xs = Tensor::randn([2, channels, size, size], (Kind::Float, Device::Cpu));
        let t_emb = Tensor::randn([2, 16], (Kind::Float, Device::Cpu));
        (xs, t_emb)
    }

    #[test]
    fn test_down_block_returns_skip() {
        let vs = nn::VarStore::new(Device::Cpu);
        let cfg = UnetBlockConfig { sample: Some(Sample::Down), n_groups: 4, ..Default::default() };
        let block = UnetBlock::new(vs.root(), 8, 16, 16, cfg);
        let (xs, t_emb) = inputs(8, 8);
        let (down, skip) = block.forward(&xs, &t_emb);
        assert_eq!(down.size(), vec![2, 16, 4, 4]);
        assert_eq!(skip.unwrap().size(), vec![2, 16, 8, 8]);
    }

    #[test]
    fn test_attention_between_res_blocks() {
        let vs = nn::VarStore::new(Device::Cpu);
        let cfg = UnetBlockConfig { num_res: 3, is_attn: true, n_groups: 4, ..Default::default() };
        let block = UnetBlock::new(vs.root(), 8, 8, 16, cfg);
        let kinds: Vec<&str> = block
            .layers
            .iter()
            .map(|l| match l {
                UnetLayer::Res(_) => "res",
                UnetLayer::Attn(_) => "attn",
                UnetLayer::Down(_) => "down",
                UnetLayer::Up(_) => "up",
            })
            .collect();
        assert_eq!(kinds, vec!["res", "attn", "res", "attn", "res"]);
        let (xs, t_emb) = inputs(8, 4);
        let (out, skip) = block.forward(&xs, &t_emb);
        assert_eq!(out.size(), vec![2, 8, 4, 4]);
        assert!(skip.is_none());
    }

    #[test]
    fn test_up_block_doubles_resolution() {
        let vs = nn::VarStore::new(Device::Cpu);
        let cfg = UnetBlockConfig { sample: Some(Sample::Up), n_groups: 4, ..Default::default() };
        let block = UnetBlock::new(vs.root(), 24, 8, 16, cfg);
        assert_eq!(block.output_channels(), 8);
        let (xs, t_emb) = inputs(24, 4);
        let (out, skip) = block.forward(&xs, &t_emb);
        assert_eq!(out.size(), vec![2, 8, 8, 8]);
        assert!(skip.is_none());
    }

    #[test]
    fn test_up_sample_halves_channels_when_widening() {
        let vs = nn::VarStore::new(Device::Cpu);
        let up = UpSample::new(vs.root(), 8, 16);
        assert_eq!(up.out_channels, 8);
        let xs = Tensor::randn([1, 16, 3, 3], (Kind::Float, Device::Cpu));
        assert_eq!(xs.apply(&up).size(), vec![1, 8, 6, 6]);
    }
}
