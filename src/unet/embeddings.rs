use tch::{nn::{self, Module}, Kind, Tensor};

/// `x * sigmoid(x)`
#[derive(Debug, Clone, Copy, Default)]
pub struct Swish;

impl Module for Swish {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs * xs.sigmoid()
    }
}

/// Sinusoidal encoding of a scalar per batch element, as in "Attention is all
/// you need":
///
/// `PE(t, i) = sin(t / 10000^(i / (n/2)))` for the first half of the
/// dimensions and `cos(...)` for the second half.
#[derive(Debug, Clone, Copy)]
pub struct PositionalEncoding {
    n_embed: i64,
}

impl PositionalEncoding {
    pub fn new(n_embed: i64) -> Self {
        Self { n_embed }
    }
}

impl Module for PositionalEncoding {
    /// `[b]` -> `[b, n_embed]`
    fn forward(&self, t: &Tensor) -> Tensor {
        let half_dim = self.n_embed / 2;
        let h = 10000f64.ln() / half_dim as f64;
        let freqs = (Tensor::arange(half_dim, (Kind::Float, t.device())) * -h).exp();
        let args = t.to_kind(Kind::Float).unsqueeze(1) * freqs.unsqueeze(0);
        Tensor::cat(&[args.sin(), args.cos()], 1)
    }
}

/// Embeds the conditioning scalar: positional encoding of size
/// `n_embed / scale_fact`, then a two-layer MLP up to `n_embed`.
#[derive(Debug)]
pub struct EmbLayer {
    emb: PositionalEncoding,
    lin1: nn::Linear,
    lin2: nn::Linear,
    act: Swish,
}

impl EmbLayer {
    pub fn new(vs: nn::Path, n_embed: i64, scale_fact: i64) -> Self {
        let n_embed_scaled = n_embed / scale_fact;
        let lin1 = nn::linear(&vs / "lin1", n_embed_scaled, n_embed, Default::default());
        let lin2 = nn::linear(&vs / "lin2", n_embed, n_embed, Default::default());
        Self { emb: PositionalEncoding::new(n_embed_scaled), lin1, lin2, act: Swish }
    }
}

impl Module for EmbLayer {
    fn forward(&self, t: &Tensor) -> Tensor {
        t.apply(&self.emb).apply(&self.lin1).apply(&self.act).apply(&self.lin2)
    }
}
