use std::fs;

use serde::{Deserialize, Serialize};

use crate::{error::Result, schedulers::SigmaSchedule};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LangevinConfig {
    /// Step size at the last (smallest) noise level.
    pub eps: f64,
    /// Number of Langevin steps run at each noise level.
    pub n_steps_each: usize,
    pub schedule: SigmaSchedule,
}

impl Default for LangevinConfig {
    fn default() -> Self {
        Self { eps: 6.2e-6, n_steps_each: 5, schedule: SigmaSchedule::default() }
    }
}

impl LangevinConfig {
    pub fn from_file<T: AsRef<std::path::Path>>(path: T) -> Result<Self> {
        let file = fs::read_to_string(path)?;
        let cfg: LangevinConfig = toml::from_str(&file)?;
        Ok(cfg)
    }
}
