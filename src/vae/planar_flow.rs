//! Planar normalizing flow (Rezende & Mohamed, 2015).
//!
//! Each layer maps `z -> z + û tanh(wᵀz + b)` and contributes
//! `log |1 + ûᵀ ψ(z)|` to the log-determinant, with
//! `ψ(z) = (1 - tanh²(wᵀz + b)) w`.
use tch::{nn, Tensor};

#[derive(Debug)]
pub struct PlanarFlow {
    u: Tensor,
    w: Tensor,
    b: Tensor,
    len_f: i64,
}

impl PlanarFlow {
    pub fn new(vs: nn::Path, len_f: i64, h_dim: i64) -> Self {
        let init = nn::Init::Randn { mean: 0., stdev: 0.01 };
        let u = vs.var("u", &[len_f, h_dim], init);
        let w = vs.var("w", &[len_f, h_dim], init);
        let b = vs.var("b", &[len_f], nn::Init::Const(0.));
        Self { u, w, b, len_f }
    }

    pub fn len(&self) -> i64 {
        self.len_f
    }

    pub fn is_empty(&self) -> bool {
        self.len_f == 0
    }

    /// `u` of layer `k` projected so that `wᵀû >= -1`, which keeps the layer invertible.
    pub fn u_hat(&self, k: i64) -> Tensor {
        let u = self.u.get(k);
        let w = self.w.get(k);
        let wu = w.dot(&u);
        let m_wu = wu.softplus() - 1.;
        &u + (m_wu - &wu) * &w / (w.dot(&w) + 1e-8)
    }

    /// `[b, h_dim]` -> (`z_K`, sum of log-determinants `[b]`)
    pub fn forward(&self, z: &Tensor) -> (Tensor, Tensor) {
        let bsize = z.size()[0];
        let mut z = z.shallow_clone();
        let mut sum_log_det = Tensor::zeros([bsize], (z.kind(), z.device()));
        for k in 0..self.len_f {
            let w = self.w.get(k);
            let u_hat = self.u_hat(k);
            let h = (z.matmul(&w) + self.b.get(k)).tanh();
            let psi = (-h.square() + 1.).unsqueeze(1) * w.unsqueeze(0);
            let log_det = (psi.matmul(&u_hat) + 1.).abs().clamp_min(1e-8).log();
            z = &z + u_hat.unsqueeze(0) * h.unsqueeze(1);
            sum_log_det = sum_log_det + log_det;
        }
        (z, sum_log_det)
    }
}
