//! Candle-RAVE: grid-shuffle video editing on top of image diffusion models.
//!
//! Frames are tiled into `g × g` grids, inverted with DDIM, and denoised with
//! classifier-free guidance and several ControlNets while the frames are
//! reshuffled into new grids at every step. The backbone, VAE, ControlNets and
//! prompt encoders are supplied by the caller through [`capabilities`].

pub mod batch;
pub mod cache;
pub mod capabilities;
pub mod conditioning;
pub mod config;
pub mod denoise;
pub mod error;
pub mod grid;
pub mod inversion;
pub mod pipeline;
pub mod scheduler;
pub mod shuffle;
pub mod utils;

pub use batch::PairedBatch;
pub use cache::{CacheLayout, FsTensorStore, MemoryTensorStore, TensorStore};
pub use capabilities::{
    ControlExtractor, ControlNet, ControlResiduals, ImagePromptEncoder, NoiseBackbone,
    TextEncoder, Vae,
};
pub use conditioning::{ConditioningBuilder, EmbeddingPair};
pub use config::{ConditioningScales, ConfigError, RunConfig};
pub use denoise::{ControlNetStack, DenoiseSettings, Denoiser};
pub use error::{RaveError, Result};
pub use grid::GridDims;
pub use inversion::{InversionSettings, Inverter};
pub use pipeline::{RaveOutput, RavePipeline, RaveRequest, RunSummary};
pub use scheduler::{DdimScheduler, DdimSchedulerConfig, NoiseScheduler};
pub use shuffle::{FrameOrder, GridBatch, PermutationSource, SeededPermutation};
