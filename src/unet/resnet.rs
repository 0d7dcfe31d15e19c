//! Residual block from Wide ResNet, conditioned on an embedding vector.
use tch::{nn, Tensor};

use super::embeddings::Swish;

#[derive(Debug)]
pub struct ResBlock {
    norm1: nn::GroupNorm,
    conv1: nn::Conv2D,
    norm2: nn::GroupNorm,
    conv2: nn::Conv2D,
    emb: nn::Linear,
    shortcut: Option<nn::Conv2D>,
    act: Swish,
}

impl ResBlock {
    pub fn new(vs: nn::Path, in_channels: i64, out_channels: i64, n_embed: i64, n_groups: i64) -> Self {
        let conv_cfg = nn::ConvConfig { padding: 1, ..Default::default() };
        let norm1 = nn::group_norm(&vs / "norm1", n_groups, in_channels, Default::default());
        let conv1 = nn::conv2d(&vs / "conv1", in_channels, out_channels, 3, conv_cfg);
        let norm2 = nn::group_norm(&vs / "norm2", n_groups, out_channels, Default::default());
        let conv2 = nn::conv2d(&vs / "conv2", out_channels, out_channels, 3, conv_cfg);
        let emb = nn::linear(&vs / "emb", n_embed, out_channels, Default::default());
        let shortcut = if in_channels != out_channels {
            Some(nn::conv2d(&vs / "shortcut", in_channels, out_channels, 1, Default::default()))
        } else {
            None
        };
        Self { norm1, conv1, norm2, conv2, emb, shortcut, act: Swish }
    }

    /// `[b, c_in, w, h]`, `[b, n_embed]` -> `[b, c_out, w, h]`
    pub fn forward(&self, xs: &Tensor, t_emb: &Tensor) -> Tensor {
        let out = xs.apply(&self.norm1).apply(&self.act).apply(&self.conv1);
        let emb = t_emb.apply(&self.emb).unsqueeze(-1).unsqueeze(-1);
        let out = (out + emb).apply(&self.norm2).apply(&self.act).apply(&self.conv2);
        let shortcut = match &self.shortcut {
            Some(conv) => xs.apply(conv),
            None => xs.shallow_clone(),
        };
        out + shortcut
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn test_res_block_changes_channels() {
        let vs = nn::VarStore::new(Device::Cpu);
        let block = ResBlock::new(vs.root(), 8, 16, 32, 4);
        let xs = Tensor::randn([2, 8, 6, 6], (Kind::Float, Device::Cpu));
        let t_emb = Tensor::randn([2, 32], (Kind::Float, Device::Cpu));
        assert_eq!(block.forward(&xs, &t_emb).size(), vec![2, 16, 6, 6]);
    }

    #[test]
    fn test_res_block_identity_shortcut() {
        let vs = nn::VarStore::new(Device::Cpu);
        let block = ResBlock::new(vs.root(), 8, 8, 16, 4);
        assert!(block.shortcut.is_none());
        let xs = Tensor::randn([1, 8, 4, 4], (Kind::Float, Device::Cpu));
        let t_emb = Tensor::randn([1, 16], (Kind::Float, Device::Cpu));
        assert_eq!(block.forward(&xs, &t_emb).size(), xs.size());
    }
}
