//! 2D UNet score model
//!
//! Takes a noisy batch and the noise level of each element and returns an
//! estimate of the score, the gradient of the log-density of the noisy data.
use std::fs;

use serde::{Deserialize, Serialize};
use tch::{nn::{self, Module}, Tensor};

use super::{
    attention::AttLayer,
    blocks::{Sample, UnetBlock, UnetBlockConfig},
    embeddings::{EmbLayer, Swish},
    resnet::ResBlock,
};
use crate::{
    error::{Error, Result},
    langevin::ScoreModel,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreUNetConfig {
    pub in_channels: i64,
    pub base_channels: i64,
    /// Channel multiplier of each resolution level, from the finest.
    pub channel_mults: Vec<i64>,
    /// Whether each level uses attention between its residual blocks.
    pub attn_levels: Vec<bool>,
    pub num_res: i64,
    pub n_groups: i64,
    pub n_heads: i64,
    pub embed_scale_fact: i64,
    /// Divide the network output by sigma.
    pub scale_by_sigma: bool,
}

impl Default for ScoreUNetConfig {
    fn default() -> Self {
        Self {
            in_channels: 1,
            base_channels: 64,
            channel_mults: vec![1, 2, 2],
            attn_levels: vec![false, true, false],
            num_res: 2,
            n_groups: 32,
            n_heads: 1,
            embed_scale_fact: 4,
            scale_by_sigma: true,
        }
    }
}

impl ScoreUNetConfig {
    pub fn from_file<T: AsRef<std::path::Path>>(path: T) -> Result<Self> {
        let file = fs::read_to_string(path)?;
        let cfg: ScoreUNetConfig = toml::from_str(&file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn n_embed(&self) -> i64 {
        self.base_channels * 4
    }

    pub fn level_channels(&self) -> Vec<i64> {
        self.channel_mults.iter().map(|m| m * self.base_channels).collect()
    }

    /// Image sizes must be a multiple of this.
    pub fn resolution_multiple(&self) -> i64 {
        1 << self.channel_mults.len().saturating_sub(1)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));
        if self.channel_mults.is_empty() {
            return invalid("channel_mults is empty".to_string());
        }
        if self.channel_mults.len() != self.attn_levels.len() {
            return invalid(format!(
                "{} channel multipliers but {} attention flags",
                self.channel_mults.len(),
                self.attn_levels.len()
            ));
        }
        if self.in_channels < 1 || self.num_res < 1 || self.n_heads < 1 || self.n_groups < 1 {
            return invalid("in_channels, num_res, n_heads and n_groups must be positive".to_string());
        }
        if self.embed_scale_fact < 1 || (self.n_embed() / self.embed_scale_fact) % 2 != 0 {
            return invalid(format!(
                "embedding size {} / {} must be even",
                self.n_embed(),
                self.embed_scale_fact
            ));
        }
        let channels = std::iter::once(self.base_channels).chain(self.level_channels());
        for c in channels {
            if c < 1 || c % self.n_groups != 0 {
                return invalid(format!("{c} channels are not divisible into {} groups", self.n_groups));
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct MidBlock {
    res1: ResBlock,
    attn: AttLayer,
    res2: ResBlock,
}

impl MidBlock {
    fn new(vs: nn::Path, channels: i64, n_embed: i64, n_groups: i64, n_heads: i64) -> Self {
        let res1 = ResBlock::new(&vs / "res1", channels, channels, n_embed, n_groups);
        let attn = AttLayer::new(&vs / "attn", channels, n_heads);
        let res2 = ResBlock::new(&vs / "res2", channels, channels, n_embed, n_groups);
        Self { res1, attn, res2 }
    }

    fn forward(&self, xs: &Tensor, t_emb: &Tensor) -> Tensor {
        let xs = self.res1.forward(xs, t_emb).apply(&self.attn);
        self.res2.forward(&xs, t_emb)
    }
}

#[derive(Debug)]
pub struct ScoreUNet {
    conv_in: nn::Conv2D,
    emb: EmbLayer,
    down_blocks: Vec<UnetBlock>,
    mid_block: MidBlock,
    up_blocks: Vec<UnetBlock>,
    norm_out: nn::GroupNorm,
    conv_out: nn::Conv2D,
    act: Swish,
    pub config: ScoreUNetConfig,
}

impl ScoreUNet {
    pub fn new(vs: nn::Path, config: ScoreUNetConfig) -> Result<Self> {
        config.validate()?;
        let n_levels = config.channel_mults.len();
        let channels = config.level_channels();
        let n_embed = config.n_embed();
        let base_channels = config.base_channels;
        let conv_cfg = nn::ConvConfig { padding: 1, ..Default::default() };

        let conv_in = nn::conv2d(&vs / "conv_in", config.in_channels, base_channels, 3, conv_cfg);
        let emb = EmbLayer::new(&vs / "emb", n_embed, config.embed_scale_fact);

        let block_cfg = |sample, is_attn| UnetBlockConfig {
            num_res: config.num_res,
            sample,
            is_attn,
            n_groups: config.n_groups,
            n_heads: config.n_heads,
        };

        let vs_down = &vs / "down_blocks";
        let down_blocks = (0..n_levels)
            .map(|i| {
                let in_channels = if i > 0 { channels[i - 1] } else { base_channels };
                let sample = if i < n_levels - 1 { Some(Sample::Down) } else { None };
                let cfg = block_cfg(sample, config.attn_levels[i]);
                UnetBlock::new(&vs_down / i, in_channels, channels[i], n_embed, cfg)
            })
            .collect();

        let bl_channels = channels[n_levels - 1];
        let mid_block =
            MidBlock::new(&vs / "mid_block", bl_channels, n_embed, config.n_groups, config.n_heads);

        // up blocks run from the coarsest level back to the finest, each one
        // consuming the skip connection of the matching down block
        let vs_up = &vs / "up_blocks";
        let up_blocks = (0..n_levels)
            .rev()
            .map(|i| {
                let prev_channels = if i == n_levels - 1 { bl_channels } else { channels[i + 1] };
                let sample = if i > 0 { Some(Sample::Up) } else { None };
                let cfg = block_cfg(sample, config.attn_levels[i]);
                UnetBlock::new(&vs_up / i, prev_channels + channels[i], channels[i], n_embed, cfg)
            })
            .collect();

        let norm_out = nn::group_norm(&vs / "norm_out", config.n_groups, channels[0], Default::default());
        let conv_out = nn::conv2d(&vs / "conv_out", channels[0], config.in_channels, 3, conv_cfg);
        Ok(Self {
            conv_in,
            emb,
            down_blocks,
            mid_block,
            up_blocks,
            norm_out,
            conv_out,
            act: Swish,
            config,
        })
    }

    /// `xs`: `[b, c, w, h]`, `sigmas`: `b` noise levels in any shape.
    pub fn forward(&self, xs: &Tensor, sigmas: &Tensor) -> Tensor {
        let sigmas = sigmas.reshape([-1]).to_kind(xs.kind());
        let t_emb = sigmas.log().apply(&self.emb);

        let mut xs = xs.apply(&self.conv_in);
        let mut skips = Vec::with_capacity(self.down_blocks.len());
        for block in self.down_blocks.iter() {
            let (out, skip) = block.forward(&xs, &t_emb);
            skips.push(skip.unwrap_or_else(|| out.shallow_clone()));
            xs = out;
        }

        xs = self.mid_block.forward(&xs, &t_emb);

        for (block, skip) in self.up_blocks.iter().zip(skips.iter().rev()) {
            let (out, _) = block.forward(&Tensor::cat(&[&xs, skip], 1), &t_emb);
            xs = out;
        }

        let out = xs.apply(&self.norm_out).apply(&self.act).apply(&self.conv_out);
        if self.config.scale_by_sigma {
            out / sigmas.reshape([-1, 1, 1, 1])
        } else {
            out
        }
    }
}

impl ScoreModel for ScoreUNet {
    fn score(&self, xs: &Tensor, sigmas: &Tensor) -> Tensor {
        self.forward(xs, sigmas)
    }
}
