//! End-to-end RAVE video editing pipeline.
//!
//! ```text
//! frames ──► grids ──► VAE encode ──► DDIM inversion (or forward noise)
//!   │                                        │
//!   └─► control extractors ──► control grids ┴─► shuffled denoising ──► VAE decode
//!                                                                         │
//!                                             frames in video order ◄─────┘
//! ```
//!
//! Prepared grids and inverted latents are memoized in two [`TensorStore`]s so
//! that repeated edits of the same clip skip preprocessing and inversion.

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;
use tracing::info;

use crate::batch::PairedBatch;
use crate::cache::{self, CacheStatus, TensorStore};
use crate::capabilities::{ControlExtractor, ImagePromptEncoder, NoiseBackbone, TextEncoder, Vae};
use crate::conditioning::{ConditioningBuilder, EmbeddingPair};
use crate::config::{ConfigError, RunConfig};
use crate::denoise::{ControlNetStack, DenoiseSettings, Denoiser};
use crate::error::{RaveError, Result};
use crate::grid::{self, GridDims};
use crate::inversion::{InversionSettings, Inverter};
use crate::scheduler::{DdimSchedulerConfig, NoiseScheduler};
use crate::shuffle::{FrameOrder, GridBatch, PermutationSource, SeededPermutation};
use crate::utils::Pcg32;

// =============================================================================
// Request / Output
// =============================================================================

/// One editing job.
#[derive(Debug, Clone)]
pub struct RaveRequest {
    pub config: RunConfig,
    /// Logical frames `[3, H, W]` in `[0, 1]`, video order
    pub frames: Vec<Tensor>,
    /// Style reference image `[3, H', W']` for the image prompt
    pub reference: Tensor,
}

#[derive(Debug, Clone)]
pub struct RaveOutput {
    /// Edited frames `[3, H, W]` in `[0, 1]`, video order
    pub frames: Vec<Tensor>,
    /// `controls[k][i]` is the map of ControlNet `k` for frame `i`
    pub controls: Vec<Vec<Tensor>>,
    pub summary: RunSummary,
}

/// Timing record written next to the edited video.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub config: RunConfig,
    /// Seconds
    pub total_time: f64,
    pub total_number_of_frames: usize,
    pub sec_per_frame: f64,
}

impl RunSummary {
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Grid-packed pixels and conditioning maps of a whole clip.
#[derive(Debug, Clone)]
struct PreparedGrids {
    images: Tensor,
    controls: Vec<Tensor>,
}

// =============================================================================
// Pipeline
// =============================================================================

pub struct RavePipeline<'a> {
    pub vae: Box<dyn Vae + 'a>,
    pub backbone: Box<dyn NoiseBackbone + 'a>,
    pub controlnets: ControlNetStack<'a>,
    pub text_encoder: Box<dyn TextEncoder + 'a>,
    pub image_encoder: Box<dyn ImagePromptEncoder + 'a>,
    /// One preprocessor per ControlNet, same order
    pub extractors: Vec<Box<dyn ControlExtractor + 'a>>,
    pub scheduler_config: DdimSchedulerConfig,
    pub device: Device,
}

impl<'a> RavePipeline<'a> {
    /// Runs a request with permutations drawn from the run seed.
    pub fn run(
        &mut self,
        request: &RaveRequest,
        control_store: &mut dyn TensorStore,
        inverse_store: &mut dyn TensorStore,
    ) -> Result<RaveOutput> {
        let mut permutations = SeededPermutation::new(request.config.seed);
        self.run_with_permutations(request, control_store, inverse_store, &mut permutations)
    }

    pub fn run_with_permutations(
        &mut self,
        request: &RaveRequest,
        control_store: &mut dyn TensorStore,
        inverse_store: &mut dyn TensorStore,
        permutations: &mut dyn PermutationSource,
    ) -> Result<RaveOutput> {
        let start = Instant::now();
        let config = &request.config;
        self.check_request(request)?;
        let dims = config.grid_dims();
        info!(
            frames = config.total_frame_number(),
            grid = config.grid_size,
            samples = config.sample_size,
            controls = config.num_controls(),
            "starting rave run"
        );

        let prepared = self.prepare_grids(request, dims, control_store)?;
        let latents = self.encode(&prepared.images, config.batch_size_vae)?;

        let embeddings = ConditioningBuilder::new(&mut *self.text_encoder, &mut *self.image_encoder)
            .build(&config.positive_prompt, &config.negative_prompt, &request.reference)?;

        let scheduler = self.scheduler_config.build(config.num_inference_steps)?;
        let latents = if config.ddim_inversion {
            self.invert(config, dims, &latents, &prepared.controls, inverse_store)?
        } else {
            let noise = Pcg32::seeded(config.seed).randn_like(&latents)?;
            let t = scheduler.timesteps()[0];
            info!(timestep = t, "forward noising clean latents");
            scheduler.add_noise(&latents, &noise, t)?
        };

        let grids = PairedBatch::new(latents, prepared.controls)?;
        let batch = GridBatch::new(grids, FrameOrder::identity(config.total_frame_number()), dims)?;
        let batch = self.denoise(config, dims, batch, &embeddings, &scheduler, permutations)?;

        let decoded = self.decode(&batch.grids.latents, config.batch_size_vae)?;
        let batch = GridBatch::new(
            PairedBatch::new(decoded, batch.grids.controls)?,
            batch.order,
            dims,
        )?;
        let (frames, order) = batch.into_frames(dims)?;
        let images = order.restore(split_frames(&frames.latents)?)?;
        let controls = frames
            .controls
            .iter()
            .map(|c| order.restore(split_frames(c)?))
            .collect::<Result<Vec<_>>>()?;

        let total_time = start.elapsed().as_secs_f64();
        let total = config.total_frame_number();
        info!(total_time, frames = total, "rave run finished");
        Ok(RaveOutput {
            frames: images,
            controls,
            summary: RunSummary {
                config: config.clone(),
                total_time,
                total_number_of_frames: total,
                sec_per_frame: total_time / total as f64,
            },
        })
    }

    fn check_request(&self, request: &RaveRequest) -> Result<()> {
        let config = &request.config;
        config.validate()?;
        config.check_frame_count(request.frames.len())?;
        let expected = config.num_controls();
        if self.controlnets.len() != expected {
            return Err(ConfigError::ControlCountMismatch {
                what: "controlnets",
                expected,
                got: self.controlnets.len(),
            }
            .into());
        }
        if self.extractors.len() != expected {
            return Err(ConfigError::ControlCountMismatch {
                what: "control extractors",
                expected,
                got: self.extractors.len(),
            }
            .into());
        }
        Ok(())
    }

    /// Loads the prepared grids from `store`, or builds and saves them.
    fn prepare_grids(
        &mut self,
        request: &RaveRequest,
        dims: GridDims,
        store: &mut dyn TensorStore,
    ) -> Result<PreparedGrids> {
        let config = &request.config;
        let keys = cache::control_keys(config.num_controls());

        if cache::cache_status(store, &keys)? == CacheStatus::Complete {
            let mut loaded = cache::load_all(store, &keys, None, &self.device)?.into_iter();
            let images = loaded
                .next()
                .ok_or_else(|| RaveError::cache(store.location(), "missing img entry"))?;
            let controls: Vec<Tensor> = loaded.collect();
            for (key, t) in keys.iter().zip(std::iter::once(&images).chain(&controls)) {
                if t.rank() != 4 || t.dim(0)? != config.sample_size {
                    return Err(RaveError::cache(
                        store.location(),
                        format!(
                            "entry {key} has dims {:?}, expected {} grids",
                            t.dims(),
                            config.sample_size
                        ),
                    ));
                }
            }
            info!(location = %store.location(), "loaded prepared grids from cache");
            return Ok(PreparedGrids { images, controls });
        }

        let frames = Tensor::stack(&request.frames, 0)?.to_device(&self.device)?;
        let images = grid::pack_batch(&frames, dims)?;
        let mut controls = Vec::with_capacity(self.extractors.len());
        for extractor in self.extractors.iter_mut() {
            let maps = request
                .frames
                .iter()
                .map(|frame| {
                    extractor
                        .extract(frame)
                        .map_err(RaveError::capability("control extractor"))
                })
                .collect::<Result<Vec<_>>>()?;
            let maps = Tensor::stack(&maps, 0)?.to_device(&self.device)?;
            controls.push(grid::pack_batch(&maps, dims)?);
            info!(preprocessor = extractor.name(), "extracted control maps");
        }

        for (key, t) in keys.iter().zip(std::iter::once(&images).chain(&controls)) {
            store.save(key, t)?;
        }
        Ok(PreparedGrids { images, controls })
    }

    /// `[S, 3, gH, gW]` images in `[0, 1]` -> scaled latents.
    fn encode(&mut self, images: &Tensor, batch_size_vae: usize) -> Result<Tensor> {
        let scaling = self.vae.scaling_factor();
        let parts = split_batch(images, batch_size_vae)?
            .into_iter()
            .map(|part| {
                let latents = self
                    .vae
                    .encode(&part.affine(2.0, -1.0)?)
                    .map_err(RaveError::capability("vae"))?;
                Ok(latents.affine(scaling, 0.0)?)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&parts, 0)?)
    }

    /// Scaled latents -> images in `[0, 1]`.
    fn decode(&mut self, latents: &Tensor, batch_size_vae: usize) -> Result<Tensor> {
        let scaling = self.vae.scaling_factor();
        let parts = split_batch(latents, batch_size_vae)?
            .into_iter()
            .map(|part| {
                let images = self
                    .vae
                    .decode(&part.affine(1.0 / scaling, 0.0)?)
                    .map_err(RaveError::capability("vae"))?;
                Ok(images.affine(0.5, 0.5)?.clamp(0f32, 1f32)?)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&parts, 0)?)
    }

    /// Inverts the clean grid latents frame by frame and refolds them into grids.
    fn invert(
        &mut self,
        config: &RunConfig,
        dims: GridDims,
        latents: &Tensor,
        controls: &[Tensor],
        store: &mut dyn TensorStore,
    ) -> Result<Tensor> {
        let embedding = ConditioningBuilder::new(&mut *self.text_encoder, &mut *self.image_encoder)
            .inversion_embedding(&config.inversion_prompt)?;
        let scheduler = self.scheduler_config.build(config.num_inversion_steps)?;
        let frames = PairedBatch::new(latents.clone(), controls.to_vec())?
            .try_map(|g| grid::unpack_batch(g, dims))?;

        let mut inverter = Inverter {
            backbone: &mut *self.backbone,
            controlnets: &mut self.controlnets,
            scheduler: &scheduler,
            settings: InversionSettings {
                batch_size: config.batch_size,
                give_control: config.give_control_inversion,
            },
        };
        let inverted = inverter.invert(&frames, &embedding, store)?;
        grid::pack_batch(&inverted, dims)
    }

    fn denoise(
        &mut self,
        config: &RunConfig,
        dims: GridDims,
        batch: GridBatch,
        embeddings: &EmbeddingPair,
        scheduler: &dyn NoiseScheduler,
        permutations: &mut dyn PermutationSource,
    ) -> Result<GridBatch> {
        let mut denoiser = Denoiser {
            backbone: &mut *self.backbone,
            controlnets: &mut self.controlnets,
            scheduler,
            settings: DenoiseSettings::from_config(config),
            dims,
        };
        denoiser.run(batch, embeddings, permutations)
    }
}

fn split_batch(t: &Tensor, size: usize) -> Result<Vec<Tensor>> {
    let n = t.dim(0)?;
    (0..n)
        .step_by(size.max(1))
        .map(|start| Ok(t.narrow(0, start, size.max(1).min(n - start))?))
        .collect()
}

fn split_frames(t: &Tensor) -> Result<Vec<Tensor>> {
    (0..t.dim(0)?).map(|i| Ok(t.get(i)?)).collect()
}
