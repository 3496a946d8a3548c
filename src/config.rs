//! Run configuration for a RAVE editing job.
//!
//! A [`RunConfig`] is built once per request (usually from a JSON file) and is
//! passed by reference into every stage. Nothing downstream mutates it.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::grid::GridDims;

pub const DEFAULT_POSITIVE_PROMPT: &str = "best quality, high quality, realisitic, smooth human";
pub const DEFAULT_NEGATIVE_PROMPT: &str =
    "monochrome, lowres, bad anatomy, worst quality, low quality";

/// Per-ControlNet conditioning scales, in ControlNet order.
///
/// Accepts the dash separated form used by experiment sweeps (`"1.0-0.5"`),
/// a JSON list (`[1.0, 0.5]`) or a single number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ScaleSpec", into = "Vec<f64>")]
pub struct ConditioningScales(Vec<f64>);

#[derive(Deserialize)]
#[serde(untagged)]
enum ScaleSpec {
    Single(f64),
    List(Vec<f64>),
    Text(String),
}

impl ConditioningScales {
    pub fn new(scales: Vec<f64>) -> Result<Self, ConfigError> {
        if scales.is_empty() {
            return Err(ConfigError::InvalidConditioningScale(
                "at least one scale is required".to_string(),
            ));
        }
        if let Some(bad) = scales.iter().find(|s| !s.is_finite()) {
            return Err(ConfigError::InvalidConditioningScale(format!(
                "non-finite scale {bad}"
            )));
        }
        Ok(Self(scales))
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for ConditioningScales {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let scales = s
            .split('-')
            .map(|part| {
                part.trim().parse::<f64>().map_err(|_| {
                    ConfigError::InvalidConditioningScale(format!("cannot parse {part:?} in {s:?}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(scales)
    }
}

impl TryFrom<ScaleSpec> for ConditioningScales {
    type Error = ConfigError;

    fn try_from(spec: ScaleSpec) -> Result<Self, Self::Error> {
        match spec {
            ScaleSpec::Single(v) => Self::new(vec![v]),
            ScaleSpec::List(v) => Self::new(v),
            ScaleSpec::Text(s) => s.parse(),
        }
    }
}

impl From<ConditioningScales> for Vec<f64> {
    fn from(scales: ConditioningScales) -> Self {
        scales.0
    }
}

impl Default for ConditioningScales {
    fn default() -> Self {
        Self(vec![1.0, 1.0])
    }
}

/// Everything a single editing run needs, besides the frames themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Seed for the shuffle permutations and the forward-noising noise
    #[serde(default)]
    pub seed: u64,
    /// Frames per grid side (a grid holds `grid_size²` frames)
    #[serde(default = "default_grid_size")]
    pub grid_size: usize,
    /// Number of grids in the sample
    pub sample_size: usize,
    /// Padding mode used when the video was cut into grids (only part of the cache key)
    #[serde(default = "default_pad")]
    pub pad: usize,
    /// Grids per backbone forward pass
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Grids per VAE encode/decode call
    #[serde(default = "default_batch_size_vae")]
    pub batch_size_vae: usize,
    /// Denoising steps
    #[serde(default = "default_steps")]
    pub num_inference_steps: usize,
    /// DDIM inversion steps (independent of the denoising count)
    #[serde(default = "default_steps", alias = "num_inversion_step")]
    pub num_inversion_steps: usize,
    /// Classifier-free guidance scale
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
    /// Sampling fraction from which classifier-free guidance is applied
    #[serde(default)]
    pub cond_step_start: f64,
    /// Start of the ControlNet guidance window (fraction of steps)
    #[serde(default)]
    pub controlnet_guidance_start: f64,
    /// End of the ControlNet guidance window (fraction of steps)
    #[serde(default = "default_guidance_end")]
    pub controlnet_guidance_end: f64,
    /// One conditioning scale per ControlNet
    #[serde(default)]
    pub controlnet_conditioning_scale: ConditioningScales,
    /// Text prompt used to condition the inversion pass
    #[serde(default)]
    pub inversion_prompt: String,
    #[serde(default = "default_positive_prompt")]
    pub positive_prompt: String,
    #[serde(default = "default_negative_prompt")]
    pub negative_prompt: String,
    /// Run DDIM inversion instead of forward-noising the clean latents
    #[serde(default = "default_true", alias = "is_ddim_inversion")]
    pub ddim_inversion: bool,
    /// Reshuffle frames into fresh grids before every denoising step
    #[serde(default = "default_true", alias = "is_shuffle")]
    pub shuffle: bool,
    /// Apply ControlNet residuals during inversion as well
    #[serde(default = "default_true")]
    pub give_control_inversion: bool,
    /// Dash separated preprocessor names, one per ControlNet (e.g. `depth_zoe-lineart_coarse`)
    #[serde(default)]
    pub preprocess_name: String,
    /// Source video name (cache key component)
    #[serde(default)]
    pub video_name: String,
    /// Backbone identifier (cache key component)
    #[serde(default = "default_model_id")]
    pub model_id: String,
}

fn default_grid_size() -> usize {
    3
}

fn default_pad() -> usize {
    1
}

fn default_batch_size() -> usize {
    4
}

fn default_batch_size_vae() -> usize {
    1
}

fn default_steps() -> usize {
    20
}

fn default_guidance_scale() -> f64 {
    7.5
}

fn default_guidance_end() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_positive_prompt() -> String {
    DEFAULT_POSITIVE_PROMPT.to_string()
}

fn default_negative_prompt() -> String {
    DEFAULT_NEGATIVE_PROMPT.to_string()
}

fn default_model_id() -> String {
    "None".to_string()
}

impl RunConfig {
    /// Minimal valid configuration; everything else takes its serde default.
    pub fn new(grid_size: usize, sample_size: usize) -> Result<Self, ConfigError> {
        let config = Self {
            seed: 0,
            grid_size,
            sample_size,
            pad: default_pad(),
            batch_size: default_batch_size(),
            batch_size_vae: default_batch_size_vae(),
            num_inference_steps: default_steps(),
            num_inversion_steps: default_steps(),
            guidance_scale: default_guidance_scale(),
            cond_step_start: 0.0,
            controlnet_guidance_start: 0.0,
            controlnet_guidance_end: default_guidance_end(),
            controlnet_conditioning_scale: ConditioningScales::default(),
            inversion_prompt: String::new(),
            positive_prompt: default_positive_prompt(),
            negative_prompt: default_negative_prompt(),
            ddim_inversion: true,
            shuffle: true,
            give_control_inversion: true,
            preprocess_name: String::new(),
            video_name: String::new(),
            model_id: default_model_id(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON run configuration.
    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("grid_size", self.grid_size),
            ("sample_size", self.sample_size),
            ("batch_size", self.batch_size),
            ("batch_size_vae", self.batch_size_vae),
            ("num_inference_steps", self.num_inference_steps),
            ("num_inversion_steps", self.num_inversion_steps),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroSize(name));
            }
        }

        for (name, value) in [
            ("cond_step_start", self.cond_step_start),
            ("controlnet_guidance_start", self.controlnet_guidance_start),
            ("controlnet_guidance_end", self.controlnet_guidance_end),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::FractionOutOfRange { name, value });
            }
        }
        if self.controlnet_guidance_start > self.controlnet_guidance_end {
            return Err(ConfigError::EmptyGuidanceWindow {
                start: self.controlnet_guidance_start,
                end: self.controlnet_guidance_end,
            });
        }

        let names = self.preprocessors();
        if !names.is_empty() && names.len() != self.controlnet_conditioning_scale.len() {
            return Err(ConfigError::ControlCountMismatch {
                what: "preprocessors",
                expected: self.controlnet_conditioning_scale.len(),
                got: names.len(),
            });
        }
        Ok(())
    }

    pub fn grid_dims(&self) -> GridDims {
        GridDims::square(self.grid_size)
    }

    /// Frames per grid (`grid_size²`).
    pub fn grid_frame_number(&self) -> usize {
        self.grid_size * self.grid_size
    }

    pub fn total_frame_number(&self) -> usize {
        self.grid_frame_number() * self.sample_size
    }

    /// Number of ControlNets the run is configured for.
    pub fn num_controls(&self) -> usize {
        self.controlnet_conditioning_scale.len()
    }

    pub fn preprocessors(&self) -> Vec<&str> {
        if self.preprocess_name.is_empty() {
            return Vec::new();
        }
        self.preprocess_name.split('-').collect()
    }

    /// Rejects frame lists that do not fill the configured grids exactly.
    pub fn check_frame_count(&self, frames: usize) -> Result<(), ConfigError> {
        let expected = self.total_frame_number();
        if frames != expected {
            return Err(ConfigError::FrameCountMismatch {
                expected,
                got: frames,
                grid_size: self.grid_size,
                sample_size: self.sample_size,
            });
        }
        Ok(())
    }

    /// Builder-style override of the shuffle flag.
    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_steps(mut self, inference: usize, inversion: usize) -> Self {
        self.num_inference_steps = inference;
        self.num_inversion_steps = inversion;
        self
    }

    pub fn with_guidance_scale(mut self, scale: f64) -> Self {
        self.guidance_scale = scale;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("expected {expected} frames for {grid_size}x{grid_size} grids x {sample_size} samples, \
             got {got}")]
    FrameCountMismatch {
        expected: usize,
        got: usize,
        grid_size: usize,
        sample_size: usize,
    },
    #[error("invalid controlnet conditioning scale: {0}")]
    InvalidConditioningScale(String),
    #[error("expected {expected} {what} (one per controlnet), got {got}")]
    ControlCountMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("`{0}` must be greater than zero")]
    ZeroSize(&'static str),
    #[error("`{name}` must lie in [0, 1], got {value}")]
    FractionOutOfRange { name: &'static str, value: f64 },
    #[error("invalid noise schedule: {0}")]
    InvalidSchedule(String),
    #[error("controlnet guidance window is empty: start={start} > end={end}")]
    EmptyGuidanceWindow { start: f64, end: f64 },
}
