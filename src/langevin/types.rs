use tch::Tensor;

/// Estimates the gradient of the log-density of noisy data.
///
/// `sigmas` holds one noise level per batch element, shaped so that it
/// broadcasts against `xs` (`[batch, 1, 1, 1]` for image batches). The
/// returned tensor must have the same shape as `xs`.
pub trait ScoreModel {
    fn score(&self, xs: &Tensor, sigmas: &Tensor) -> Tensor;
}

impl<F> ScoreModel for F
where
    F: Fn(&Tensor, &Tensor) -> Tensor,
{
    fn score(&self, xs: &Tensor, sigmas: &Tensor) -> Tensor {
        self(xs, sigmas)
    }
}

/// Source of the Gaussian perturbation injected at each Langevin step.
pub trait NoiseSource {
    fn sample_like(&mut self, xs: &Tensor) -> Tensor;
}

/// Standard normal noise drawn from the global torch generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaussianNoise;

impl NoiseSource for GaussianNoise {
    fn sample_like(&mut self, xs: &Tensor) -> Tensor {
        xs.randn_like()
    }
}
