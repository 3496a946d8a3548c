//! Batched reverse diffusion over shuffled grids.
//!
//! Each step optionally reshuffles the frames into new grids, then denoises the
//! grids `batch_size` at a time with classifier-free guidance and windowed
//! ControlNet conditioning.

use candle_core::Tensor;
use tracing::{debug, info};

use crate::batch::PairedBatch;
use crate::capabilities::{ControlNet, ControlResiduals, NoiseBackbone};
use crate::config::{ConditioningScales, ConfigError, RunConfig};
use crate::conditioning::EmbeddingPair;
use crate::error::{RaveError, Result};
use crate::grid::GridDims;
use crate::scheduler::NoiseScheduler;
use crate::shuffle::{GridBatch, PermutationSource};

/// ControlNets applied together, one conditioning scale each.
pub struct ControlNetStack<'a> {
    nets: Vec<Box<dyn ControlNet + 'a>>,
    scales: Vec<f64>,
}

impl<'a> ControlNetStack<'a> {
    pub fn new(nets: Vec<Box<dyn ControlNet + 'a>>, scales: &ConditioningScales) -> Result<Self> {
        if nets.len() != scales.len() {
            return Err(ConfigError::ControlCountMismatch {
                what: "controlnets",
                expected: scales.len(),
                got: nets.len(),
            }
            .into());
        }
        Ok(Self {
            nets,
            scales: scales.as_slice().to_vec(),
        })
    }

    pub fn len(&self) -> usize {
        self.nets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    /// Residuals of every net summed elementwise; `None` for an empty stack.
    ///
    /// `controls[k]` is the conditioning batch for net `k`.
    pub fn residuals(
        &mut self,
        latents: &Tensor,
        timestep: usize,
        encoder_hidden_states: &Tensor,
        controls: &[Tensor],
    ) -> Result<Option<ControlResiduals>> {
        if controls.len() != self.nets.len() {
            return Err(RaveError::shape(format!(
                "{} conditioning batches for {} controlnets",
                controls.len(),
                self.nets.len()
            )));
        }
        let mut total: Option<ControlResiduals> = None;
        for ((net, control), &scale) in self.nets.iter_mut().zip(controls).zip(&self.scales) {
            let residuals = net
                .residuals(latents, timestep, encoder_hidden_states, control, scale)
                .map_err(RaveError::capability("controlnet"))?;
            total = Some(match total {
                None => residuals,
                Some(acc) => acc
                    .sum(&residuals)
                    .map_err(RaveError::capability("controlnet"))?,
            });
        }
        Ok(total)
    }
}

/// Step-dependent knobs of the sampling loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DenoiseSettings {
    pub guidance_scale: f64,
    pub cond_step_start: f64,
    pub controlnet_guidance_start: f64,
    pub controlnet_guidance_end: f64,
    /// Grids per backbone call
    pub batch_size: usize,
    pub shuffle: bool,
}

impl DenoiseSettings {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            guidance_scale: config.guidance_scale,
            cond_step_start: config.cond_step_start,
            controlnet_guidance_start: config.controlnet_guidance_start,
            controlnet_guidance_end: config.controlnet_guidance_end,
            batch_size: config.batch_size,
            shuffle: config.shuffle,
        }
    }

    /// Guidance scale at sampling fraction `p`; zero before `cond_step_start`.
    pub fn guidance_at(&self, p: f64) -> f64 {
        if p >= self.cond_step_start {
            self.guidance_scale
        } else {
            0.0
        }
    }

    /// Whether ControlNet residuals are applied at sampling fraction `p`.
    pub fn controls_active(&self, p: f64) -> bool {
        (self.controlnet_guidance_start..=self.controlnet_guidance_end).contains(&p)
    }
}

/// Reverse-diffusion loop over a [`GridBatch`].
pub struct Denoiser<'s, 'a> {
    pub backbone: &'s mut dyn NoiseBackbone,
    pub controlnets: &'s mut ControlNetStack<'a>,
    pub scheduler: &'s dyn NoiseScheduler,
    pub settings: DenoiseSettings,
    pub dims: GridDims,
}

impl Denoiser<'_, '_> {
    /// Runs every scheduler timestep and returns the denoised grids together
    /// with the final frame order.
    pub fn run(
        &mut self,
        mut batch: GridBatch,
        embeddings: &EmbeddingPair,
        permutations: &mut dyn PermutationSource,
    ) -> Result<GridBatch> {
        let timesteps = self.scheduler.timesteps().to_vec();
        let total = timesteps.len();
        info!(
            steps = total,
            grids = batch.grids.len(),
            shuffle = self.settings.shuffle,
            "denoising"
        );

        for (i, &t) in timesteps.iter().enumerate() {
            let p = i as f64 / total as f64;
            if self.settings.shuffle {
                batch = batch.reshuffle(self.dims, permutations)?;
            }
            let guidance = self.settings.guidance_at(p);
            let use_controls = self.settings.controls_active(p);
            debug!(step = i, timestep = t, guidance, use_controls, "denoise step");

            let parts = batch.grids.split(self.settings.batch_size)?;
            let mut denoised = Vec::with_capacity(parts.len());
            for part in parts {
                let latents = self.sub_batch_step(&part, t, guidance, use_controls, embeddings)?;
                denoised.push(PairedBatch::new(latents, part.controls)?);
            }
            batch.grids = PairedBatch::concat(&denoised)?;
        }
        Ok(batch)
    }

    fn sub_batch_step(
        &mut self,
        part: &PairedBatch,
        timestep: usize,
        guidance: f64,
        use_controls: bool,
        embeddings: &EmbeddingPair,
    ) -> Result<Tensor> {
        let n = part.len();
        let doubled = part.duplicated()?;
        let input = self
            .scheduler
            .scale_model_input(doubled.latents.clone(), timestep)?;
        let hidden = embeddings.for_guidance(n)?;

        let residuals = if use_controls {
            self.controlnets
                .residuals(&input, timestep, &hidden, &doubled.controls)?
        } else {
            None
        };
        let noise = self
            .backbone
            .predict_noise(&input, timestep, &hidden, residuals.as_ref())
            .map_err(RaveError::capability("noise backbone"))?;
        if noise.dims() != input.dims() {
            return Err(RaveError::shape(format!(
                "backbone returned {:?} for input {:?}",
                noise.dims(),
                input.dims()
            )));
        }

        let uncond = noise.narrow(0, 0, n)?;
        let noise = if guidance == 0.0 {
            uncond
        } else {
            let cond = noise.narrow(0, n, n)?;
            (&uncond + (cond - &uncond)?.affine(guidance, 0.0)?)?
        };
        self.scheduler.step(&noise, timestep, &part.latents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> DenoiseSettings {
        DenoiseSettings {
            guidance_scale: 7.5,
            cond_step_start: 0.25,
            controlnet_guidance_start: 0.2,
            controlnet_guidance_end: 0.6,
            batch_size: 2,
            shuffle: true,
        }
    }

    #[test]
    fn guidance_starts_at_cond_step() {
        let s = settings();
        assert_eq!(s.guidance_at(0.0), 0.0);
        assert_eq!(s.guidance_at(0.2), 0.0);
        assert_eq!(s.guidance_at(0.25), 7.5);
        assert_eq!(s.guidance_at(0.9), 7.5);
    }

    #[test]
    fn control_window_is_inclusive() {
        let s = settings();
        assert!(!s.controls_active(0.1));
        assert!(s.controls_active(0.2));
        assert!(s.controls_active(0.6));
        assert!(!s.controls_active(0.65));
    }

    #[test]
    fn stack_requires_one_scale_per_net() {
        let scales = ConditioningScales::new(vec![1.0]).unwrap();
        assert!(matches!(
            ControlNetStack::new(Vec::new(), &scales),
            Err(RaveError::Config(ConfigError::ControlCountMismatch { .. }))
        ));
    }
}
