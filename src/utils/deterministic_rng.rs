//! Seeded Gaussian noise that does not depend on the device RNG.
//!
//! candle's CPU backend cannot be seeded, so forward-noising draws its noise
//! from this PCG32 stream instead. The same seed gives the same starting
//! latents on every device.

use candle_core::{DType, Device, Result, Shape, Tensor};

const MULTIPLIER: u64 = 6364136223846793005;
/// Stream selector used for latent noise.
const NOISE_STREAM: u64 = 54;

/// PCG32 (XSH-RR) generator.
#[derive(Debug, Clone)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
    spare: Option<f32>,
}

impl Pcg32 {
    pub fn new(seed: u64, stream: u64) -> Self {
        let mut rng = Self {
            state: 0,
            inc: (stream << 1) | 1,
            spare: None,
        };
        rng.next_u32();
        rng.state = rng.state.wrapping_add(seed);
        rng.next_u32();
        rng
    }

    /// Generator on the latent-noise stream for a run seed.
    pub fn seeded(seed: u64) -> Self {
        Self::new(seed, NOISE_STREAM)
    }

    pub fn next_u32(&mut self) -> u32 {
        let old = self.state;
        self.state = old.wrapping_mul(MULTIPLIER).wrapping_add(self.inc);
        let xorshifted = (((old >> 18) ^ old) >> 27) as u32;
        xorshifted.rotate_right((old >> 59) as u32)
    }

    /// Uniform in `[0, 1)` with 24 bits of precision.
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 * (1.0 / (1u32 << 24) as f32)
    }

    /// Standard normal sample (Box-Muller, second value kept for the next call).
    pub fn next_gaussian(&mut self) -> f32 {
        if let Some(z) = self.spare.take() {
            return z;
        }
        let u1 = loop {
            let x = self.next_f32();
            if x > f32::EPSILON {
                break x;
            }
        };
        let u2 = self.next_f32();
        let mag = (-2.0 * u1.ln()).sqrt();
        let (sin, cos) = (2.0 * std::f32::consts::PI * u2).sin_cos();
        self.spare = Some(mag * sin);
        mag * cos
    }

    pub fn randn(&mut self, shape: impl Into<Shape>, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let data: Vec<f32> = (0..shape.elem_count()).map(|_| self.next_gaussian()).collect();
        Tensor::from_vec(data, shape, device)
    }

    /// Noise with the shape, dtype and device of `reference`.
    pub fn randn_like(&mut self, reference: &Tensor) -> Result<Tensor> {
        let noise = self.randn(reference.shape().clone(), reference.device())?;
        match reference.dtype() {
            DType::F32 => Ok(noise),
            dtype => noise.to_dtype(dtype),
        }
    }
}
