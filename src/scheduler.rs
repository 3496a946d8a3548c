//! DDIM noise scheduler.
//!
//! Denoising and inversion read α values from the same table, so both engines
//! consume the scheduler through [`NoiseScheduler`] and the inversion schedule
//! is built from the same [`DdimSchedulerConfig`] as the sampling one.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::error::Result;

/// Noise schedule capability shared by both engines.
pub trait NoiseScheduler {
    /// Inference timesteps in denoising (descending) order.
    fn timesteps(&self) -> &[usize];

    /// Cumulative α product at a training timestep.
    fn alpha_cumprod(&self, timestep: usize) -> f64;

    /// α used for the step past the end of the schedule.
    fn final_alpha_cumprod(&self) -> f64;

    fn scale_model_input(&self, sample: Tensor, timestep: usize) -> Result<Tensor>;

    /// x_t -> x_{t-1}.
    fn step(&self, noise_pred: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor>;

    /// Forward-noises a clean sample to `timestep`.
    fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: usize) -> Result<Tensor>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    Linear,
    ScaledLinear,
}

/// Deterministic (eta = 0) DDIM configuration; defaults match Stable Diffusion 1.5.
///
/// Timesteps use leading spacing and the backbone is taken to predict ε, the
/// same convention inversion relies on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DdimSchedulerConfig {
    #[serde(default = "default_train_timesteps")]
    pub num_train_timesteps: usize,
    #[serde(default = "default_beta_start")]
    pub beta_start: f64,
    #[serde(default = "default_beta_end")]
    pub beta_end: f64,
    #[serde(default = "default_beta_schedule")]
    pub beta_schedule: BetaSchedule,
    #[serde(default = "default_steps_offset")]
    pub steps_offset: usize,
    /// Use α = 1 past the end of the schedule instead of `alphas_cumprod[0]`
    #[serde(default)]
    pub set_alpha_to_one: bool,
}

fn default_train_timesteps() -> usize {
    1000
}

fn default_beta_start() -> f64 {
    0.00085
}

fn default_beta_end() -> f64 {
    0.012
}

fn default_beta_schedule() -> BetaSchedule {
    BetaSchedule::ScaledLinear
}

fn default_steps_offset() -> usize {
    1
}

impl Default for DdimSchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: default_train_timesteps(),
            beta_start: default_beta_start(),
            beta_end: default_beta_end(),
            beta_schedule: default_beta_schedule(),
            steps_offset: default_steps_offset(),
            set_alpha_to_one: false,
        }
    }
}

impl DdimSchedulerConfig {
    /// Builds a scheduler with `num_inference_steps` timesteps.
    pub fn build(&self, num_inference_steps: usize) -> Result<DdimScheduler> {
        DdimScheduler::new(self.clone(), num_inference_steps)
    }
}

#[derive(Debug, Clone)]
pub struct DdimScheduler {
    pub config: DdimSchedulerConfig,
    alphas_cumprod: Vec<f64>,
    final_alpha_cumprod: f64,
    timesteps: Vec<usize>,
    step_ratio: usize,
}

impl DdimScheduler {
    pub fn new(config: DdimSchedulerConfig, num_inference_steps: usize) -> Result<Self> {
        let n = config.num_train_timesteps;
        if num_inference_steps == 0 || num_inference_steps > n {
            return Err(ConfigError::InvalidSchedule(format!(
                "{num_inference_steps} inference steps with {n} training timesteps"
            ))
            .into());
        }

        let betas: Vec<f64> = match config.beta_schedule {
            BetaSchedule::ScaledLinear => {
                linspace(config.beta_start.sqrt(), config.beta_end.sqrt(), n)
                    .into_iter()
                    .map(|b| b * b)
                    .collect()
            }
            BetaSchedule::Linear => linspace(config.beta_start, config.beta_end, n),
        };
        let mut alphas_cumprod = Vec::with_capacity(n);
        let mut acc = 1.0;
        for beta in betas {
            acc *= 1.0 - beta;
            alphas_cumprod.push(acc);
        }
        let final_alpha_cumprod = if config.set_alpha_to_one {
            1.0
        } else {
            alphas_cumprod[0]
        };

        let step_ratio = n / num_inference_steps;
        let timesteps: Vec<usize> = (0..num_inference_steps)
            .map(|s| s * step_ratio + config.steps_offset)
            .rev()
            .collect();
        let timesteps = timesteps.into_iter().map(|t| t.min(n - 1)).collect();

        Ok(Self {
            config,
            alphas_cumprod,
            final_alpha_cumprod,
            timesteps,
            step_ratio,
        })
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    fn alpha_prev(&self, timestep: usize) -> f64 {
        match timestep.checked_sub(self.step_ratio) {
            Some(prev) => self.alphas_cumprod[prev],
            None => self.final_alpha_cumprod,
        }
    }
}

impl NoiseScheduler for DdimScheduler {
    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn alpha_cumprod(&self, timestep: usize) -> f64 {
        self.alphas_cumprod[timestep.min(self.alphas_cumprod.len() - 1)]
    }

    fn final_alpha_cumprod(&self) -> f64 {
        self.final_alpha_cumprod
    }

    fn scale_model_input(&self, sample: Tensor, _timestep: usize) -> Result<Tensor> {
        Ok(sample)
    }

    fn step(&self, noise_pred: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor> {
        let timestep = timestep.min(self.alphas_cumprod.len() - 1);
        let alpha_prod_t = self.alphas_cumprod[timestep];
        let alpha_prod_t_prev = self.alpha_prev(timestep);
        let beta_prod_t = 1.0 - alpha_prod_t;

        let pred_original_sample = ((sample - noise_pred.affine(beta_prod_t.sqrt(), 0.0)?)?
            .affine(1.0 / alpha_prod_t.sqrt(), 0.0))?;
        let direction = noise_pred.affine((1.0 - alpha_prod_t_prev).sqrt(), 0.0)?;
        Ok((pred_original_sample.affine(alpha_prod_t_prev.sqrt(), 0.0)? + direction)?)
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: usize) -> Result<Tensor> {
        let alpha = self.alpha_cumprod(timestep);
        Ok((original.affine(alpha.sqrt(), 0.0)? + noise.affine((1.0 - alpha).sqrt(), 0.0)?)?)
    }
}

fn linspace(start: f64, end: f64, steps: usize) -> Vec<f64> {
    match steps {
        0 => vec![],
        1 => vec![start],
        _ => {
            let denom = (steps - 1) as f64;
            (0..steps)
                .map(|i| start + (end - start) * i as f64 / denom)
                .collect()
        }
    }
}
