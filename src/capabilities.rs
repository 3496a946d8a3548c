//! Model capabilities the sampler drives but does not implement.
//!
//! Backbone, VAE, ControlNets, prompt encoders and preprocessors are plugged in
//! as trait objects. All calls are blocking; errors are reported with
//! `candle_core::Result` and become [`crate::RaveError::Capability`] at the call
//! site.

use candle_core::{Result, Tensor};

/// Latent autoencoder.
pub trait Vae {
    /// Fixed latent scaling constant from the backbone configuration.
    fn scaling_factor(&self) -> f64;

    /// `[B, 3, H, W]` images in `[-1, 1]` -> unscaled latent means.
    fn encode(&mut self, images: &Tensor) -> Result<Tensor>;

    /// Unscaled latents -> `[B, 3, H, W]` images in `[-1, 1]`.
    fn decode(&mut self, latents: &Tensor) -> Result<Tensor>;
}

/// Residuals a ControlNet injects into the backbone's down and mid blocks.
#[derive(Debug, Clone)]
pub struct ControlResiduals {
    pub down: Vec<Tensor>,
    pub mid: Tensor,
}

impl ControlResiduals {
    /// Elementwise sum, used to merge several ControlNets into one set.
    pub fn sum(&self, other: &ControlResiduals) -> Result<ControlResiduals> {
        if self.down.len() != other.down.len() {
            candle_core::bail!(
                "cannot merge controlnet residuals with {} and {} down blocks",
                self.down.len(),
                other.down.len()
            );
        }
        let down = self
            .down
            .iter()
            .zip(other.down.iter())
            .map(|(a, b)| a + b)
            .collect::<Result<Vec<_>>>()?;
        let mid = (&self.mid + &other.mid)?;
        Ok(ControlResiduals { down, mid })
    }
}

/// Noise-prediction network (e.g. a Stable Diffusion UNet).
pub trait NoiseBackbone {
    fn predict_noise(
        &mut self,
        latents: &Tensor,
        timestep: usize,
        encoder_hidden_states: &Tensor,
        residuals: Option<&ControlResiduals>,
    ) -> Result<Tensor>;
}

pub trait ControlNet {
    fn residuals(
        &mut self,
        latents: &Tensor,
        timestep: usize,
        encoder_hidden_states: &Tensor,
        conditioning: &Tensor,
        conditioning_scale: f64,
    ) -> Result<ControlResiduals>;
}

/// Text prompt -> `[1, L, D]` hidden states.
pub trait TextEncoder {
    fn encode_text(&mut self, prompt: &str) -> Result<Tensor>;
}

/// Reference image `[3, H, W]` -> projected `[1, K, D]` image prompt tokens.
pub trait ImagePromptEncoder {
    fn encode_image_prompt(&mut self, image: &Tensor) -> Result<Tensor>;
}

/// Per-frame conditioning-map preprocessor (depth, pose, lineart, ...).
pub trait ControlExtractor {
    fn name(&self) -> &str;

    /// `[3, H, W]` frame in `[0, 1]` -> `[C, H, W]` map in `[0, 1]`.
    fn extract(&mut self, frame: &Tensor) -> Result<Tensor>;
}
