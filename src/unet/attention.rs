//! Self-attention over the spatial positions of a feature map.
use tch::{nn::{self, Module}, Kind, Tensor};

/// The attention width is this multiple of the channel count.
pub const ATT_DIM_FACTOR: i64 = 10;

#[derive(Debug)]
pub struct AttLayer {
    proj: nn::Linear,
    out: nn::Linear,
    n_heads: i64,
    att_dim: i64,
    scale: f64,
}

impl AttLayer {
    pub fn new(vs: nn::Path, n_channels: i64, n_heads: i64) -> Self {
        // scaled by the attention width rather than the head dimension
        let att_dim = n_channels * ATT_DIM_FACTOR;
        let scale = (att_dim as f64).powf(-0.5);
        let proj = nn::linear(&vs / "proj", n_channels, 3 * n_heads * att_dim, Default::default());
        let out = nn::linear(&vs / "out", n_heads * att_dim, n_channels, Default::default());
        Self { proj, out, n_heads, att_dim, scale }
    }
}

impl Module for AttLayer {
    /// `[b, c, w, h]` -> `[b, c, w, h]`
    fn forward(&self, xs: &Tensor) -> Tensor {
        let (b_size, c, w, h) = xs.size4().unwrap();

        // [b, c, w, h] -> [b, w * h, c]
        let xs = xs.reshape([b_size, c, -1]).permute([0, 2, 1]);

        // [b, w * h, n_heads, 3 * att_dim], split and moved to [b, n_heads, w * h, att_dim]
        let proj = xs.apply(&self.proj).reshape([b_size, -1, self.n_heads, 3 * self.att_dim]);
        let qkv: Vec<Tensor> = proj.chunk(3, -1).iter().map(|t| t.permute([0, 2, 1, 3])).collect();
        let (q, k, v) = (&qkv[0], &qkv[1], &qkv[2]);

        // [b, n_heads, i, j], normalized over the query positions i
        let scores = q.matmul(&k.transpose(-2, -1)) * self.scale;
        let weights = scores.softmax(-2, Kind::Float).to_kind(v.kind());

        // [b, n_heads, i, att_dim] -> [b, w * h, n_heads * att_dim]
        let attended = weights
            .matmul(v)
            .permute([0, 2, 1, 3])
            .reshape([b_size, -1, self.n_heads * self.att_dim]);

        let out = attended.apply(&self.out) + xs;
        out.reshape([b_size, w, h, c]).permute([0, 3, 1, 2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn test_attention_keeps_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let layer = AttLayer::new(vs.root(), 4, 2);
        assert_eq!(layer.att_dim, 40);
        let xs = Tensor::randn([2, 4, 3, 5], (Kind::Float, Device::Cpu));
        assert_eq!(xs.apply(&layer).size(), vec![2, 4, 3, 5]);
    }

    #[test]
    fn test_attention_is_residual() {
        let vs = nn::VarStore::new(Device::Cpu);
        let layer = AttLayer::new(vs.root(), 2, 1);
        tch::no_grad(|| {
            // with a zeroed output projection the layer reduces to the identity
            let _ = layer.out.ws.shallow_clone().zero_();
            if let Some(bs) = &layer.out.bs {
                let _ = bs.shallow_clone().zero_();
            }
        });
        let xs = Tensor::randn([1, 2, 4, 4], (Kind::Float, Device::Cpu));
        let ys = xs.apply(&layer);
        assert!(ys.allclose(&xs, 1e-5, 1e-6, false));
    }
}
