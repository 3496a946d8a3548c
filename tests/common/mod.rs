//! Mock capabilities shared by the integration tests.
//!
//! Every mock records its calls in a shared log so a test can keep a handle
//! after the mock has been boxed into a pipeline.

#![allow(dead_code)]

use candle_core::{DType, Device, Result, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

use candle_rave::capabilities::{
    ControlExtractor, ControlNet, ControlResiduals, ImagePromptEncoder, NoiseBackbone,
    TextEncoder, Vae,
};
use candle_rave::scheduler::NoiseScheduler;
use candle_rave::shuffle::PermutationSource;

pub type Log<T> = Rc<RefCell<Vec<T>>>;

pub fn log<T>() -> Log<T> {
    Rc::new(RefCell::new(Vec::new()))
}

pub const EMBED_DIM: usize = 4;

// =============================================================================
// Backbone
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct BackboneCall {
    pub batch: usize,
    pub timestep: usize,
    pub with_residuals: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum NoiseMode {
    /// Predicts zero noise
    Zero,
    /// Predicts, for each batch item, the mean of its encoder hidden states
    EmbeddingMean,
    /// Fails every call
    Fail,
}

pub struct MockBackbone {
    pub mode: NoiseMode,
    pub calls: Log<BackboneCall>,
}

impl MockBackbone {
    pub fn new(mode: NoiseMode) -> Self {
        Self { mode, calls: log() }
    }
}

impl NoiseBackbone for MockBackbone {
    fn predict_noise(
        &mut self,
        latents: &Tensor,
        timestep: usize,
        encoder_hidden_states: &Tensor,
        residuals: Option<&ControlResiduals>,
    ) -> Result<Tensor> {
        self.calls.borrow_mut().push(BackboneCall {
            batch: latents.dim(0)?,
            timestep,
            with_residuals: residuals.is_some(),
        });
        match self.mode {
            NoiseMode::Zero => latents.zeros_like(),
            NoiseMode::EmbeddingMean => {
                let b = latents.dim(0)?;
                encoder_hidden_states
                    .mean_keepdim(2)?
                    .mean_keepdim(1)?
                    .reshape((b, 1, 1, 1))?
                    .broadcast_as(latents.shape())?
                    .contiguous()
            }
            NoiseMode::Fail => candle_core::bail!("backbone unavailable"),
        }
    }
}

// =============================================================================
// ControlNet
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ControlCall {
    pub batch: usize,
    pub control_batch: usize,
    pub scale: f64,
}

pub struct MockControlNet {
    pub calls: Log<ControlCall>,
}

impl MockControlNet {
    pub fn new() -> Self {
        Self { calls: log() }
    }
}

impl ControlNet for MockControlNet {
    fn residuals(
        &mut self,
        latents: &Tensor,
        _timestep: usize,
        _encoder_hidden_states: &Tensor,
        conditioning: &Tensor,
        conditioning_scale: f64,
    ) -> Result<ControlResiduals> {
        self.calls.borrow_mut().push(ControlCall {
            batch: latents.dim(0)?,
            control_batch: conditioning.dim(0)?,
            scale: conditioning_scale,
        });
        let r = latents.ones_like()?.affine(conditioning_scale, 0.0)?;
        Ok(ControlResiduals {
            down: vec![r.clone()],
            mid: r,
        })
    }
}

// =============================================================================
// VAE / encoders / extractors
// =============================================================================

/// Identity autoencoder: latents are the pixels themselves.
pub struct IdentityVae {
    pub scaling: f64,
    pub encode_calls: Log<usize>,
    pub decode_calls: Log<usize>,
}

impl IdentityVae {
    pub fn new(scaling: f64) -> Self {
        Self {
            scaling,
            encode_calls: log(),
            decode_calls: log(),
        }
    }
}

impl Vae for IdentityVae {
    fn scaling_factor(&self) -> f64 {
        self.scaling
    }

    fn encode(&mut self, images: &Tensor) -> Result<Tensor> {
        self.encode_calls.borrow_mut().push(images.dim(0)?);
        Ok(images.clone())
    }

    fn decode(&mut self, latents: &Tensor) -> Result<Tensor> {
        self.decode_calls.borrow_mut().push(latents.dim(0)?);
        Ok(latents.clone())
    }
}

/// Ones for every prompt except `negative`, which encodes to zeros.
pub struct MockTextEncoder {
    pub negative: String,
    pub tokens: usize,
    pub prompts: Log<String>,
}

impl MockTextEncoder {
    pub fn new(negative: &str) -> Self {
        Self {
            negative: negative.to_string(),
            tokens: 3,
            prompts: log(),
        }
    }
}

impl TextEncoder for MockTextEncoder {
    fn encode_text(&mut self, prompt: &str) -> Result<Tensor> {
        self.prompts.borrow_mut().push(prompt.to_string());
        let value = if prompt == self.negative { 0f32 } else { 1f32 };
        Tensor::full(value, (1, self.tokens, EMBED_DIM), &Device::Cpu)
    }
}

/// Encodes an image to two tokens filled with its mean pixel value.
pub struct MeanImageEncoder;

impl ImagePromptEncoder for MeanImageEncoder {
    fn encode_image_prompt(&mut self, image: &Tensor) -> Result<Tensor> {
        let mean = image.mean_all()?.to_scalar::<f32>()?;
        Tensor::full(mean, (1, 2, EMBED_DIM), image.device())
    }
}

/// Conditioning map `frame * gain`.
pub struct GainExtractor {
    pub name: String,
    pub gain: f64,
    pub calls: Log<usize>,
}

impl GainExtractor {
    pub fn new(name: &str, gain: f64) -> Self {
        Self {
            name: name.to_string(),
            gain,
            calls: log(),
        }
    }
}

impl ControlExtractor for GainExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn extract(&mut self, frame: &Tensor) -> Result<Tensor> {
        self.calls.borrow_mut().push(frame.dim(0)?);
        frame.affine(self.gain, 0.0)
    }
}

// =============================================================================
// Scheduler / permutations
// =============================================================================

/// Scheduler whose step returns the guided noise itself (or the sample
/// unchanged when `passthrough` is set).
pub struct EchoScheduler {
    pub timesteps: Vec<usize>,
    pub passthrough: bool,
}

impl NoiseScheduler for EchoScheduler {
    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn alpha_cumprod(&self, _timestep: usize) -> f64 {
        0.5
    }

    fn final_alpha_cumprod(&self) -> f64 {
        1.0
    }

    fn scale_model_input(&self, sample: Tensor, _timestep: usize) -> candle_rave::Result<Tensor> {
        Ok(sample)
    }

    fn step(
        &self,
        noise_pred: &Tensor,
        _timestep: usize,
        sample: &Tensor,
    ) -> candle_rave::Result<Tensor> {
        if self.passthrough {
            Ok(sample.clone())
        } else {
            Ok(noise_pred.clone())
        }
    }

    fn add_noise(
        &self,
        original: &Tensor,
        _noise: &Tensor,
        _timestep: usize,
    ) -> candle_rave::Result<Tensor> {
        Ok(original.clone())
    }
}

/// Replays a fixed list of permutations, cycling when exhausted.
pub struct ScriptedPermutations {
    pub script: Vec<Vec<usize>>,
    pub next: usize,
}

impl ScriptedPermutations {
    pub fn new(script: Vec<Vec<usize>>) -> Self {
        Self { script, next: 0 }
    }
}

impl PermutationSource for ScriptedPermutations {
    fn permutation(&mut self, n: usize) -> Vec<usize> {
        let perm = self.script[self.next % self.script.len()].clone();
        self.next += 1;
        assert_eq!(perm.len(), n, "scripted permutation has the wrong length");
        perm
    }
}

// =============================================================================
// Tensor helpers
// =============================================================================

/// `n` frames `[c, h, w]`, frame `i` filled with `(i + 1) / (n + 1)`.
pub fn constant_frames(n: usize, c: usize, h: usize, w: usize) -> Vec<Tensor> {
    (0..n)
        .map(|i| {
            Tensor::full((i + 1) as f32 / (n + 1) as f32, (c, h, w), &Device::Cpu).unwrap()
        })
        .collect()
}

/// Frames stacked into `[n, c, h, w]` with frame `i` filled with `i`.
pub fn indexed_frames(n: usize, c: usize, h: usize, w: usize) -> Tensor {
    Tensor::arange(0f32, n as f32, &Device::Cpu)
        .unwrap()
        .reshape((n, 1, 1, 1))
        .unwrap()
        .broadcast_as((n, c, h, w))
        .unwrap()
        .contiguous()
        .unwrap()
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_dtype(DType::F32)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

/// Mean value of each entry along the batch axis.
pub fn per_item_means(t: &Tensor) -> Vec<f32> {
    t.flatten_from(1)
        .unwrap()
        .mean(1)
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
}
