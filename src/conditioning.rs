//! Prompt embeddings for classifier-free guidance.

use candle_core::Tensor;
use tracing::debug;

use crate::capabilities::{ImagePromptEncoder, TextEncoder};
use crate::error::{RaveError, Result};

/// Conditional and unconditional encoder hidden states, each `[1, L, D]`.
#[derive(Debug, Clone)]
pub struct EmbeddingPair {
    pub cond: Tensor,
    pub uncond: Tensor,
}

impl EmbeddingPair {
    pub fn new(cond: Tensor, uncond: Tensor) -> Result<Self> {
        if cond.dims() != uncond.dims() {
            return Err(RaveError::shape(format!(
                "cond embedding {:?} and uncond embedding {:?} differ",
                cond.dims(),
                uncond.dims()
            )));
        }
        if cond.rank() != 3 || cond.dim(0)? != 1 {
            return Err(RaveError::shape(format!(
                "embeddings must be [1, L, D], got {:?}",
                cond.dims()
            )));
        }
        Ok(Self { cond, uncond })
    }

    /// `[2n, L, D]` hidden states for a duplicated batch of `n`: `n` copies of
    /// the unconditional embedding followed by `n` copies of the conditional one.
    pub fn for_guidance(&self, n: usize) -> Result<Tensor> {
        let uncond = self.uncond.repeat((n, 1, 1))?;
        let cond = self.cond.repeat((n, 1, 1))?;
        Ok(Tensor::cat(&[&uncond, &cond], 0)?)
    }
}

/// Builds the sampling embeddings from prompts and a style reference image.
pub struct ConditioningBuilder<'a> {
    text_encoder: &'a mut dyn TextEncoder,
    image_encoder: &'a mut dyn ImagePromptEncoder,
}

impl<'a> ConditioningBuilder<'a> {
    pub fn new(
        text_encoder: &'a mut dyn TextEncoder,
        image_encoder: &'a mut dyn ImagePromptEncoder,
    ) -> Self {
        Self {
            text_encoder,
            image_encoder,
        }
    }

    /// Text tokens followed by image-prompt tokens along the sequence axis.
    ///
    /// The unconditional image tokens come from an all-zero image shaped like
    /// the reference.
    pub fn build(
        &mut self,
        positive: &str,
        negative: &str,
        reference: &Tensor,
    ) -> Result<EmbeddingPair> {
        let text_cond = self
            .text_encoder
            .encode_text(positive)
            .map_err(RaveError::capability("text encoder"))?;
        let text_uncond = self
            .text_encoder
            .encode_text(negative)
            .map_err(RaveError::capability("text encoder"))?;

        let img_cond = self
            .image_encoder
            .encode_image_prompt(reference)
            .map_err(RaveError::capability("image prompt encoder"))?;
        let blank = reference.zeros_like()?;
        let img_uncond = self
            .image_encoder
            .encode_image_prompt(&blank)
            .map_err(RaveError::capability("image prompt encoder"))?;

        let cond = Tensor::cat(&[&text_cond, &img_cond], 1)?;
        let uncond = Tensor::cat(&[&text_uncond, &img_uncond], 1)?;
        debug!(
            text_tokens = text_cond.dim(1)?,
            image_tokens = img_cond.dim(1)?,
            "built embeddings"
        );
        EmbeddingPair::new(cond, uncond)
    }

    /// Text-only conditional embedding used by the inversion pass.
    pub fn inversion_embedding(&mut self, prompt: &str) -> Result<Tensor> {
        self.text_encoder
            .encode_text(prompt)
            .map_err(RaveError::capability("text encoder"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn guidance_batch_puts_uncond_first() -> Result<()> {
        let device = Device::Cpu;
        let cond = Tensor::ones((1, 2, 3), DType::F32, &device)?;
        let uncond = Tensor::zeros((1, 2, 3), DType::F32, &device)?;
        let pair = EmbeddingPair::new(cond, uncond)?;
        let batch = pair.for_guidance(3)?;
        assert_eq!(batch.dims(), &[6, 2, 3]);
        let per_item = batch.sum((1, 2))?.to_vec1::<f32>()?;
        assert_eq!(per_item, vec![0., 0., 0., 6., 6., 6.]);
        Ok(())
    }

    #[test]
    fn mismatched_pair_is_rejected() -> Result<()> {
        let device = Device::Cpu;
        let cond = Tensor::ones((1, 2, 3), DType::F32, &device)?;
        let uncond = Tensor::zeros((1, 4, 3), DType::F32, &device)?;
        assert!(matches!(
            EmbeddingPair::new(cond, uncond),
            Err(RaveError::Shape(_))
        ));
        Ok(())
    }
}
