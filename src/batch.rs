//! Latents travelling together with their conditioning maps.
//!
//! Every split, gather and concatenation in the sampler goes through
//! [`PairedBatch`], which applies the same operation to the latent tensor and to
//! each control tensor. Entry `k` of every tensor always belongs to the same
//! frame (or grid).

use candle_core::Tensor;

use crate::error::{RaveError, Result};

#[derive(Debug, Clone)]
pub struct PairedBatch {
    pub latents: Tensor,
    pub controls: Vec<Tensor>,
}

impl PairedBatch {
    pub fn new(latents: Tensor, controls: Vec<Tensor>) -> Result<Self> {
        let n = latents.dim(0)?;
        for (k, control) in controls.iter().enumerate() {
            let m = control.dim(0)?;
            if m != n {
                return Err(RaveError::shape(format!(
                    "control {k} carries {m} entries, latents carry {n}"
                )));
            }
        }
        Ok(Self { latents, controls })
    }

    /// Entries along the batch axis.
    pub fn len(&self) -> usize {
        self.latents.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies `f` to the latents and to every control, re-checking the pairing.
    pub fn try_map(&self, mut f: impl FnMut(&Tensor) -> Result<Tensor>) -> Result<Self> {
        let latents = f(&self.latents)?;
        let controls = self.controls.iter().map(&mut f).collect::<Result<Vec<_>>>()?;
        Self::new(latents, controls)
    }

    /// Consecutive sub-batches of at most `size` entries, in order.
    pub fn split(&self, size: usize) -> Result<Vec<Self>> {
        if size == 0 {
            return Err(RaveError::shape("sub-batch size must be non-zero"));
        }
        let n = self.len();
        (0..n)
            .step_by(size)
            .map(|start| {
                let len = size.min(n - start);
                self.try_map(|t| Ok(t.narrow(0, start, len)?))
            })
            .collect()
    }

    /// Concatenates sub-batches back along the batch axis.
    pub fn concat(parts: &[Self]) -> Result<Self> {
        let Some(first) = parts.first() else {
            return Err(RaveError::shape("cannot concatenate zero sub-batches"));
        };
        let num_controls = first.controls.len();
        if let Some(p) = parts.iter().find(|p| p.controls.len() != num_controls) {
            return Err(RaveError::shape(format!(
                "sub-batches disagree on control count: {num_controls} vs {}",
                p.controls.len()
            )));
        }
        let latents: Vec<&Tensor> = parts.iter().map(|p| &p.latents).collect();
        let latents = Tensor::cat(&latents, 0)?;
        let controls = (0..num_controls)
            .map(|k| {
                let column: Vec<&Tensor> = parts.iter().map(|p| &p.controls[k]).collect();
                Tensor::cat(&column, 0).map_err(RaveError::from)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(latents, controls)
    }

    /// Stacks each tensor twice along the batch axis for a paired
    /// unconditional/conditional forward pass.
    pub fn duplicated(&self) -> Result<Self> {
        self.try_map(|t| Ok(Tensor::cat(&[t, t], 0)?))
    }
}
