//! Deterministic DDIM inversion of clean frame latents.
//!
//! Inversion runs the sampler backwards (ascending timesteps) on individual
//! frames in video order, so the starting noise of the edit is tied to the real
//! footage. Results are memoized per frame in a [`TensorStore`].

use candle_core::Tensor;
use tracing::{debug, info};

use crate::batch::PairedBatch;
use crate::cache::{self, CacheStatus, TensorStore};
use crate::capabilities::NoiseBackbone;
use crate::denoise::ControlNetStack;
use crate::error::{RaveError, Result};
use crate::scheduler::NoiseScheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InversionSettings {
    /// Frames per backbone call
    pub batch_size: usize,
    /// Feed ControlNet residuals to the backbone while inverting
    pub give_control: bool,
}

pub struct Inverter<'s, 'a> {
    pub backbone: &'s mut dyn NoiseBackbone,
    pub controlnets: &'s mut ControlNetStack<'a>,
    pub scheduler: &'s dyn NoiseScheduler,
    pub settings: InversionSettings,
}

impl Inverter<'_, '_> {
    /// Inverts per-frame latents `[N, C, h, w]` (controls `[N, C', H, W]`).
    ///
    /// `embedding` is the `[1, L, D]` inversion prompt embedding. If `store`
    /// already holds all `N` frames they are returned without touching the
    /// backbone; an empty store is filled on success; anything in between is
    /// a [`RaveError::CacheInconsistency`].
    pub fn invert(
        &mut self,
        frames: &PairedBatch,
        embedding: &Tensor,
        store: &mut dyn TensorStore,
    ) -> Result<Tensor> {
        let n = frames.len();
        let keys = cache::frame_keys(n);
        let frame_dims = &frames.latents.dims()[1..];

        if cache::cache_status(store, &keys)? == CacheStatus::Complete {
            let cached = cache::load_all(store, &keys, Some(frame_dims), frames.latents.device())?;
            info!(frames = n, location = %store.location(), "loaded inverted latents from cache");
            let latents = Tensor::stack(&cached, 0)?;
            return Ok(latents.to_dtype(frames.latents.dtype())?);
        }

        let latents = self.compute(frames, embedding)?;
        for (k, key) in keys.iter().enumerate() {
            store.save(key, &latents.get(k)?)?;
        }
        info!(frames = n, location = %store.location(), "saved inverted latents");
        Ok(latents)
    }

    fn compute(&mut self, frames: &PairedBatch, embedding: &Tensor) -> Result<Tensor> {
        let timesteps: Vec<usize> = self.scheduler.timesteps().iter().rev().copied().collect();
        info!(steps = timesteps.len(), frames = frames.len(), "ddim inversion");

        let mut current = frames.clone();
        for (i, &t) in timesteps.iter().enumerate() {
            let alpha_prod_t = self.scheduler.alpha_cumprod(t);
            let alpha_prod_t_prev = match i {
                0 => self.scheduler.final_alpha_cumprod(),
                _ => self.scheduler.alpha_cumprod(timesteps[i - 1]),
            };
            debug!(step = i, timestep = t, alpha_prod_t, alpha_prod_t_prev, "inversion step");

            let parts = current.split(self.settings.batch_size)?;
            let mut stepped = Vec::with_capacity(parts.len());
            for part in parts {
                let latents = self.step(&part, t, embedding, alpha_prod_t, alpha_prod_t_prev)?;
                stepped.push(PairedBatch::new(latents, part.controls)?);
            }
            current = PairedBatch::concat(&stepped)?;
        }
        Ok(current.latents)
    }

    fn step(
        &mut self,
        part: &PairedBatch,
        timestep: usize,
        embedding: &Tensor,
        alpha_prod_t: f64,
        alpha_prod_t_prev: f64,
    ) -> Result<Tensor> {
        let mu = alpha_prod_t.sqrt();
        let mu_prev = alpha_prod_t_prev.sqrt();
        let sigma = (1.0 - alpha_prod_t).sqrt();
        let sigma_prev = (1.0 - alpha_prod_t_prev).sqrt();

        let hidden = embedding.repeat((part.len(), 1, 1))?;
        let residuals = if self.settings.give_control {
            self.controlnets
                .residuals(&part.latents, timestep, &hidden, &part.controls)?
        } else {
            None
        };
        let eps = self
            .backbone
            .predict_noise(&part.latents, timestep, &hidden, residuals.as_ref())
            .map_err(RaveError::capability("noise backbone"))?;
        if eps.dims() != part.latents.dims() {
            return Err(RaveError::shape(format!(
                "backbone returned {:?} for input {:?}",
                eps.dims(),
                part.latents.dims()
            )));
        }

        let pred_x0 = (&part.latents - eps.affine(sigma_prev, 0.0)?)?.affine(1.0 / mu_prev, 0.0)?;
        Ok((pred_x0.affine(mu, 0.0)? + eps.affine(sigma, 0.0)?)?)
    }
}
