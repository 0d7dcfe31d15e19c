//! # Noise schedules
//!
//! A noise schedule is the ordered list of sigmas an annealed sampler walks
//! through, from the coarsest noise level to the finest.
use std::fs;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A validated, strictly decreasing sequence of positive noise levels.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseSchedule {
    sigmas: Vec<f64>,
}

impl NoiseSchedule {
    pub fn new(sigmas: Vec<f64>) -> Result<Self> {
        if sigmas.is_empty() {
            return Err(Error::InvalidConfig("noise schedule is empty".to_string()));
        }
        if let Some(sigma) = sigmas.iter().find(|s| !s.is_finite() || **s <= 0.) {
            return Err(Error::InvalidConfig(format!("sigma {sigma} is not a positive number")));
        }
        if let Some(pair) = sigmas.windows(2).find(|w| w[1] >= w[0]) {
            return Err(Error::InvalidConfig(format!(
                "sigmas must be strictly decreasing, found {} followed by {}",
                pair[0], pair[1]
            )));
        }
        Ok(Self { sigmas })
    }

    /// Log-spaced levels from `sigma_begin` down to `sigma_end`.
    pub fn geometric(sigma_begin: f64, sigma_end: f64, num_levels: usize) -> Result<Self> {
        Self::new(spaced(sigma_begin.ln(), sigma_end.ln(), num_levels).map(f64::exp).collect())
    }

    pub fn linear(sigma_begin: f64, sigma_end: f64, num_levels: usize) -> Result<Self> {
        Self::new(spaced(sigma_begin, sigma_end, num_levels).collect())
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    pub fn len(&self) -> usize {
        self.sigmas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sigmas.is_empty()
    }

    pub fn last(&self) -> f64 {
        self.sigmas[self.sigmas.len() - 1]
    }

    /// Langevin step size used at `level`.
    pub fn step_size(&self, level: usize, eps: f64) -> f64 {
        crate::langevin::step_size(eps, self.sigmas[level], self.last())
    }
}

fn spaced(begin: f64, end: f64, n: usize) -> impl Iterator<Item = f64> {
    let delta = if n > 1 { (end - begin) / (n - 1) as f64 } else { 0. };
    (0..n).map(move |i| if i + 1 == n && n > 1 { end } else { begin + delta * i as f64 })
}

/// Serializable description of a noise schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "schedule_name", content = "schedule_args")]
pub enum SigmaSchedule {
    Geometric { sigma_begin: f64, sigma_end: f64, num_levels: usize },
    Linear { sigma_begin: f64, sigma_end: f64, num_levels: usize },
    Explicit { sigmas: Vec<f64> },
}

impl Default for SigmaSchedule {
    fn default() -> Self {
        SigmaSchedule::Geometric { sigma_begin: 1.0, sigma_end: 0.01, num_levels: 10 }
    }
}

impl SigmaSchedule {
    pub fn from_file<T: AsRef<std::path::Path>>(path: T) -> Result<Self> {
        let file = fs::read_to_string(path)?;
        let cfg: SigmaSchedule = toml::from_str(&file)?;
        Ok(cfg)
    }

    pub fn build(&self) -> Result<NoiseSchedule> {
        match self {
            SigmaSchedule::Geometric { sigma_begin, sigma_end, num_levels } => {
                NoiseSchedule::geometric(*sigma_begin, *sigma_end, *num_levels)
            }
            SigmaSchedule::Linear { sigma_begin, sigma_end, num_levels } => {
                NoiseSchedule::linear(*sigma_begin, *sigma_end, *num_levels)
            }
            SigmaSchedule::Explicit { sigmas } => NoiseSchedule::new(sigmas.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_geometric_config() {
        let cfg = SigmaSchedule::from_file("src/schedulers/config.geometric.default.toml").unwrap();
        assert_eq!(cfg, SigmaSchedule::default());
        assert_eq!(cfg.build().unwrap().len(), 10);
    }

    #[test]
    fn test_geometric_endpoints() {
        let schedule = NoiseSchedule::geometric(50., 0.01, 232).unwrap();
        let sigmas = schedule.sigmas();
        assert_eq!(sigmas.len(), 232);
        assert!((sigmas[0] - 50.).abs() < 1e-9);
        assert!((schedule.last() - 0.01).abs() < 1e-12);
        // constant ratio between consecutive levels
        let r0 = sigmas[1] / sigmas[0];
        let r1 = sigmas[101] / sigmas[100];
        assert!((r0 - r1).abs() < 1e-9);
    }

    #[test]
    fn test_single_level() {
        let schedule = NoiseSchedule::geometric(0.5, 0.01, 1).unwrap();
        assert_eq!(schedule.len(), 1);
        assert!((schedule.sigmas()[0] - 0.5).abs() < 1e-12);
        assert_eq!(schedule.step_size(0, 2e-5), 2e-5);
    }

    #[test]
    fn test_linear() {
        let schedule = NoiseSchedule::linear(1., 0.25, 4).unwrap();
        assert_eq!(schedule.sigmas(), &[1., 0.75, 0.5, 0.25]);
    }

    #[test]
    fn test_rejects_invalid() {
        assert!(NoiseSchedule::new(vec![]).is_err());
        assert!(NoiseSchedule::new(vec![1., 0.]).is_err());
        assert!(NoiseSchedule::new(vec![1., -0.5]).is_err());
        assert!(NoiseSchedule::new(vec![1., 1.]).is_err());
        assert!(NoiseSchedule::new(vec![0.1, 0.5]).is_err());
        assert!(NoiseSchedule::new(vec![f64::NAN]).is_err());
        assert!(NoiseSchedule::geometric(1., 0.1, 0).is_err());
    }

    #[test]
    fn test_step_size_is_quadratic_in_sigma() {
        let schedule = NoiseSchedule::geometric(1., 0.01, 10).unwrap();
        let eps = 6.2e-6;
        for i in 0..schedule.len() {
            for j in 0..schedule.len() {
                let ratio = schedule.step_size(i, eps) / schedule.step_size(j, eps);
                let expected = (schedule.sigmas()[i] / schedule.sigmas()[j]).powi(2);
                assert!((ratio - expected).abs() <= 1e-9 * expected);
            }
        }
        assert_eq!(schedule.step_size(schedule.len() - 1, eps), eps);
    }
}
