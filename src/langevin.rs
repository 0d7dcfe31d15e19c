//! # Annealed Langevin dynamics
//!
//! Draws samples from a score-based model by running a few Langevin steps at
//! each level of a decreasing noise schedule:
//!
//! `x <- x + alpha_i * score(x, sigma_i) + sqrt(2 * alpha_i) * z`,
//! with `alpha_i = eps * (sigma_i / sigma_L)^2` and `z ~ N(0, I)`.
pub mod config;
pub mod types;

use std::time::Instant;

use tch::{Device, Kind, Tensor};
use tracing::{debug, info};

pub use self::config::LangevinConfig;
pub use self::types::{GaussianNoise, NoiseSource, ScoreModel};

use crate::error::{Error, Result};
use crate::schedulers::NoiseSchedule;
use crate::utils::{output_filename, save_image_grid};

/// Step size used at noise level `sigma` when the schedule ends at `sigma_last`.
pub fn step_size(eps: f64, sigma: f64, sigma_last: f64) -> f64 {
    eps * (sigma / sigma_last).powi(2)
}

/// Runs annealed Langevin dynamics starting from `xs`.
///
/// Returns one snapshot per inner step (`sigmas.len() * n_steps_each` in
/// total), each clamped to `[-1, 1]`, detached and moved to the CPU. The
/// snapshot is taken before the update of its step. Gradient tracking is
/// disabled for the whole call.
pub fn anneal_langevin<M, N>(
    xs: &Tensor,
    score_model: &M,
    sigmas: &[f64],
    eps: f64,
    n_steps_each: usize,
    noise_source: &mut N,
) -> Result<Vec<Tensor>>
where
    M: ScoreModel + ?Sized,
    N: NoiseSource + ?Sized,
{
    let _no_grad_guard = tch::no_grad_guard();
    let bsize = match xs.size().first() {
        Some(&bsize) => bsize,
        None => return Err(Error::InvalidInput("samples must have a batch dimension".to_string())),
    };
    let sigma_last = match sigmas.last() {
        Some(&sigma) => sigma,
        None => return Ok(vec![]),
    };
    // one sigma per batch element, broadcastable against the samples
    let mut sigma_shape = vec![1i64; xs.dim()];
    sigma_shape[0] = bsize;

    let start = Instant::now();
    let mut samples = Vec::with_capacity(sigmas.len() * n_steps_each);
    let mut xs = xs.shallow_clone();
    for (level, &sigma) in sigmas.iter().enumerate() {
        let used_sigmas = Tensor::ones(sigma_shape.as_slice(), (xs.kind(), xs.device())) * sigma;
        let step = step_size(eps, sigma, sigma_last);
        debug!(level, sigma, step, "langevin level");

        for _ in 0..n_steps_each {
            samples.push(xs.clamp(-1., 1.).detach().to_device(Device::Cpu));

            let noise = noise_source.sample_like(&xs) * (2. * step).sqrt();
            let score = score_model.score(&xs, &used_sigmas);
            if score.size() != xs.size() {
                return Err(Error::ShapeMismatch { expected: xs.size(), actual: score.size() });
            }
            xs = xs.f_add(&(score * step))?.f_add(&noise)?;
        }
    }
    info!(
        levels = sigmas.len(),
        n_steps_each,
        snapshots = samples.len(),
        elapsed = ?start.elapsed(),
        "annealed langevin sampling done"
    );
    Ok(samples)
}

/// Sampling pipeline around a score model and a noise schedule.
pub struct LangevinSampler<M: ScoreModel> {
    score_model: M,
    schedule: NoiseSchedule,
    config: LangevinConfig,
    device: Device,
}

impl<M: ScoreModel> LangevinSampler<M> {
    pub fn new(score_model: M, config: LangevinConfig, device: Device) -> Result<Self> {
        if !(config.eps.is_finite() && config.eps > 0.) {
            return Err(Error::InvalidConfig(format!("eps must be positive, got {}", config.eps)));
        }
        let schedule = config.schedule.build()?;
        Ok(Self { score_model, schedule, config, device })
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    /// Uniform noise in `[-1, 1]`, the range the snapshots are clamped to.
    pub fn initial_noise(&self, shape: &[i64]) -> Tensor {
        Tensor::rand(shape, (Kind::Float, self.device)) * 2. - 1.
    }

    pub fn sample(&self, xs: &Tensor) -> Result<Vec<Tensor>> {
        self.sample_with_noise(xs, &mut GaussianNoise)
    }

    pub fn sample_with_noise<N: NoiseSource + ?Sized>(
        &self,
        xs: &Tensor,
        noise_source: &mut N,
    ) -> Result<Vec<Tensor>> {
        anneal_langevin(
            xs,
            &self.score_model,
            self.schedule.sigmas(),
            self.config.eps,
            self.config.n_steps_each,
            noise_source,
        )
    }

    /// Seeds the generator, samples `num_samples` images and writes the last
    /// snapshot to `final_image` as a grid. With `save_every = Some(k)`, every
    /// k-th snapshot is written next to it as well. Returns the last snapshot.
    pub fn run(
        &self,
        final_image: &str,
        save_every: Option<usize>,
        num_samples: i64,
        channels: i64,
        image_size: i64,
        seed: i64,
    ) -> Result<Tensor> {
        if num_samples < 1 || channels < 1 || image_size < 1 {
            return Err(Error::InvalidInput(format!(
                "cannot sample {num_samples} images of {channels}x{image_size}x{image_size}"
            )));
        }
        tch::manual_seed(seed);
        let xs = self.initial_noise(&[num_samples, channels, image_size, image_size]);
        info!(
            num_samples,
            levels = self.schedule.len(),
            n_steps_each = self.config.n_steps_each,
            "sampling"
        );
        let snapshots = self.sample(&xs)?;

        if let Some(every) = save_every.filter(|every| *every > 0) {
            for (idx, snapshot) in snapshots.iter().enumerate().filter(|(idx, _)| idx % every == 0) {
                let filename = output_filename(final_image, idx + 1);
                debug!(filename = %filename.display(), "saving snapshot");
                save_image_grid(snapshot, filename)?;
            }
        }

        let last = match snapshots.last() {
            Some(last) => last.shallow_clone(),
            None => xs.clamp(-1., 1.).to_device(Device::Cpu),
        };
        save_image_grid(&last, final_image)?;
        info!(final_image, "generated image");
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::schedulers::SigmaSchedule;

    struct ZeroNoise;

    impl NoiseSource for ZeroNoise {
        fn sample_like(&mut self, xs: &Tensor) -> Tensor {
            xs.zeros_like()
        }
    }

    struct OnesNoise;

    impl NoiseSource for OnesNoise {
        fn sample_like(&mut self, xs: &Tensor) -> Tensor {
            xs.ones_like()
        }
    }

    fn zero_score(xs: &Tensor, _sigmas: &Tensor) -> Tensor {
        xs.zeros_like()
    }

    fn batch() -> Tensor {
        Tensor::randn([3, 1, 4, 4], (Kind::Float, Device::Cpu))
    }

    fn mean(xs: &Tensor) -> f64 {
        xs.mean(Kind::Float).double_value(&[])
    }

    #[test]
    fn test_snapshot_count_and_shape() {
        let xs = batch();
        let sigmas = [1.0, 0.5, 0.25];
        let samples = anneal_langevin(&xs, &zero_score, &sigmas, 1e-3, 4, &mut GaussianNoise).unwrap();
        assert_eq!(samples.len(), 12);
        for sample in samples.iter() {
            assert_eq!(sample.size(), xs.size());
            assert_eq!(sample.device(), Device::Cpu);
        }
    }

    #[test]
    fn test_empty_schedule_or_no_steps() {
        let xs = batch();
        let samples = anneal_langevin(&xs, &zero_score, &[], 1e-3, 5, &mut GaussianNoise).unwrap();
        assert!(samples.is_empty());
        let samples = anneal_langevin(&xs, &zero_score, &[1.0, 0.1], 1e-3, 0, &mut GaussianNoise).unwrap();
        assert!(samples.is_empty());
    }

    #[test]
    fn test_snapshots_are_clamped() {
        let xs = batch() * 10.;
        let samples = anneal_langevin(&xs, &zero_score, &[1.0, 0.1], 0.5, 3, &mut GaussianNoise).unwrap();
        for sample in samples.iter() {
            assert!(sample.max().double_value(&[]) <= 1.0);
            assert!(sample.min().double_value(&[]) >= -1.0);
        }
    }

    #[test]
    fn test_zero_score_zero_noise_keeps_zero() {
        let xs = Tensor::zeros([2, 3, 4, 4], (Kind::Float, Device::Cpu));
        let samples = anneal_langevin(&xs, &zero_score, &[0.7], 6.2e-6, 1, &mut ZeroNoise).unwrap();
        assert_eq!(samples.len(), 1);
        assert!(samples[0].equal(&xs));
    }

    #[test]
    fn test_update_rule() {
        // score = 1 everywhere, no noise: x grows by the step size of each level
        let ones_score = |xs: &Tensor, _: &Tensor| -> Tensor { xs.ones_like() };
        let xs = Tensor::zeros([1, 1, 2, 2], (Kind::Float, Device::Cpu));
        let samples = anneal_langevin(&xs, &ones_score, &[2.0, 1.0], 0.1, 1, &mut ZeroNoise).unwrap();
        assert_eq!(samples.len(), 2);
        assert!(mean(&samples[0]).abs() < 1e-7);
        assert!((mean(&samples[1]) - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_noise_is_scaled_by_step_size() {
        let xs = Tensor::zeros([1, 1, 2, 2], (Kind::Float, Device::Cpu));
        // step = 0.5 so the injected noise is sqrt(2 * 0.5) = 1
        let samples = anneal_langevin(&xs, &zero_score, &[1.0], 0.5, 2, &mut OnesNoise).unwrap();
        assert!((mean(&samples[1]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_score_sees_broadcast_sigma() {
        let seen = RefCell::new(vec![]);
        let recording = |xs: &Tensor, sigmas: &Tensor| -> Tensor {
            seen.borrow_mut().push((sigmas.size(), sigmas.double_value(&[2, 0, 0, 0])));
            xs.zeros_like()
        };
        let xs = batch();
        anneal_langevin(&xs, &recording, &[0.5, 0.25], 1e-3, 2, &mut ZeroNoise).unwrap();
        let seen = seen.into_inner();
        assert_eq!(seen.len(), 4);
        for (idx, (size, sigma)) in seen.iter().enumerate() {
            assert_eq!(size, &vec![3, 1, 1, 1]);
            let expected = if idx < 2 { 0.5 } else { 0.25 };
            assert!((sigma - expected).abs() < 1e-7);
        }
    }

    #[test]
    fn test_runs_without_grad_and_restores_mode() {
        let w = Tensor::ones([1], (Kind::Float, Device::Cpu)).set_requires_grad(true);
        let model = |xs: &Tensor, _: &Tensor| -> Tensor {
            let out = xs * &w;
            assert!(!out.requires_grad());
            out.zeros_like()
        };
        anneal_langevin(&batch(), &model, &[1.0], 1e-3, 2, &mut GaussianNoise).unwrap();
        assert!((&w * 2.).requires_grad());
    }

    #[test]
    fn test_shape_mismatch_is_reported() {
        let bad = |xs: &Tensor, _: &Tensor| -> Tensor { xs.sum_dim_intlist(1, true, Kind::Float) };
        let xs = Tensor::zeros([2, 3, 4, 4], (Kind::Float, Device::Cpu));
        let err = anneal_langevin(&xs, &bad, &[1.0], 1e-3, 1, &mut ZeroNoise).unwrap_err();
        match err {
            Error::ShapeMismatch { expected, actual } => {
                assert_eq!(expected, vec![2, 3, 4, 4]);
                assert_eq!(actual, vec![2, 1, 4, 4]);
            }
            err => panic!("unexpected error {err:?}"),
        }
    }

    #[test]
    fn test_rejects_scalar_input() {
        let xs = Tensor::from_slice(&[1.0f32]).squeeze();
        assert!(anneal_langevin(&xs, &zero_score, &[1.0], 1e-3, 1, &mut ZeroNoise).is_err());
    }

    #[test]
    fn test_step_size() {
        assert_eq!(step_size(2e-5, 0.01, 0.01), 2e-5);
        let ratio = step_size(1e-3, 0.8, 0.01) / step_size(1e-3, 0.2, 0.01);
        assert!((ratio - 16.).abs() < 1e-9);
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let config = LangevinConfig {
            eps: 1e-2,
            n_steps_each: 2,
            schedule: SigmaSchedule::Geometric { sigma_begin: 1.0, sigma_end: 0.1, num_levels: 3 },
        };
        let sampler = LangevinSampler::new(zero_score, config, Device::Cpu).unwrap();
        let draw = || {
            tch::manual_seed(42);
            let xs = sampler.initial_noise(&[2, 1, 4, 4]);
            sampler.sample(&xs).unwrap()
        };
        let first = draw();
        let second = draw();
        assert_eq!(first.len(), 6);
        for (a, b) in first.iter().zip(second.iter()) {
            assert!(a.equal(b));
        }
    }

    #[test]
    fn test_sampler_rejects_bad_config() {
        let config = LangevinConfig { eps: 0., ..Default::default() };
        assert!(LangevinSampler::new(zero_score, config, Device::Cpu).is_err());
        let config = LangevinConfig {
            schedule: SigmaSchedule::Explicit { sigmas: vec![0.1, 1.0] },
            ..Default::default()
        };
        assert!(LangevinSampler::new(zero_score, config, Device::Cpu).is_err());
    }

    #[test]
    fn test_run_writes_images() {
        let config = LangevinConfig {
            eps: 1e-3,
            n_steps_each: 2,
            schedule: SigmaSchedule::Explicit { sigmas: vec![1.0, 0.5] },
        };
        let sampler = LangevinSampler::new(zero_score, config, Device::Cpu).unwrap();
        let dir = std::env::temp_dir().join(format!("score-gen-run-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let final_image = dir.join("final.png");
        let final_image = final_image.to_str().unwrap();
        let last = sampler.run(final_image, Some(2), 4, 1, 8, 7).unwrap();
        assert_eq!(last.size(), vec![4, 1, 8, 8]);
        assert!(dir.join("final.png").exists());
        assert!(dir.join("final-1.png").exists());
        assert!(dir.join("final-3.png").exists());
        assert!(!dir.join("final-2.png").exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_run_rejects_empty_or_negative_sizes() {
        let sampler = LangevinSampler::new(zero_score, LangevinConfig::default(), Device::Cpu).unwrap();
        let final_image = std::env::temp_dir().join("score-gen-never-written.png");
        let final_image = final_image.to_str().unwrap();
        assert!(matches!(sampler.run(final_image, None, -3, 1, 8, 0), Err(Error::InvalidInput(_))));
        assert!(matches!(sampler.run(final_image, None, 2, 1, 0, 0), Err(Error::InvalidInput(_))));
        assert!(matches!(sampler.run(final_image, None, 2, 0, 8, 0), Err(Error::InvalidInput(_))));
    }
}
