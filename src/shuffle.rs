//! Frame order bookkeeping and per-step grid reshuffling.
//!
//! Between denoising steps the frames are regrouped into fresh random grids so
//! that no frame is always denoised next to the same neighbours. [`FrameOrder`]
//! remembers which logical frame sits in which batch slot; at the end of a run
//! it puts decoded frames back into video order.

use candle_core::Tensor;
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::batch::PairedBatch;
use crate::error::{RaveError, Result};
use crate::grid::{self, GridDims};

/// Source of uniform random permutations of `0..n`.
pub trait PermutationSource {
    fn permutation(&mut self, n: usize) -> Vec<usize>;
}

/// ChaCha8-backed permutations, reproducible from a seed.
#[derive(Debug, Clone)]
pub struct SeededPermutation {
    rng: ChaCha8Rng,
}

impl SeededPermutation {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl PermutationSource for SeededPermutation {
    fn permutation(&mut self, n: usize) -> Vec<usize> {
        let mut perm: Vec<usize> = (0..n).collect();
        perm.shuffle(&mut self.rng);
        perm
    }
}

/// Slot -> logical frame index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameOrder(Vec<usize>);

impl FrameOrder {
    pub fn identity(n: usize) -> Self {
        Self((0..n).collect())
    }

    pub fn from_vec(order: Vec<usize>) -> Result<Self> {
        check_bijection(&order)?;
        Ok(Self(order))
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_bijection(&self) -> bool {
        check_bijection(&self.0).is_ok()
    }

    /// Order after gathering slots by `perm`: new slot `k` holds what old slot
    /// `perm[k]` held.
    pub fn permuted(&self, perm: &[usize]) -> Result<Self> {
        if perm.len() != self.0.len() {
            return Err(RaveError::Permutation(format!(
                "permutation of length {} applied to {} slots",
                perm.len(),
                self.0.len()
            )));
        }
        check_bijection(perm)?;
        Ok(Self(perm.iter().map(|&slot| self.0[slot]).collect()))
    }

    /// Slot currently holding each logical frame.
    pub fn positions(&self) -> Result<Vec<usize>> {
        check_bijection(&self.0)?;
        let mut positions = vec![0; self.0.len()];
        for (slot, &logical) in self.0.iter().enumerate() {
            positions[logical] = slot;
        }
        Ok(positions)
    }

    /// Reorders per-slot items into logical frame order.
    pub fn restore<T>(&self, items: Vec<T>) -> Result<Vec<T>> {
        if items.len() != self.0.len() {
            return Err(RaveError::Permutation(format!(
                "cannot restore {} items with an order over {} frames",
                items.len(),
                self.0.len()
            )));
        }
        let positions = self.positions()?;
        let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
        positions
            .into_iter()
            .map(|slot| {
                slots[slot]
                    .take()
                    .ok_or_else(|| RaveError::Permutation(format!("slot {slot} used twice")))
            })
            .collect()
    }
}

fn check_bijection(order: &[usize]) -> Result<()> {
    let mut seen = vec![false; order.len()];
    for &i in order {
        match seen.get_mut(i) {
            Some(s) if !*s => *s = true,
            Some(_) => return Err(RaveError::Permutation(format!("index {i} appears twice"))),
            None => {
                return Err(RaveError::Permutation(format!(
                    "index {i} out of range for {} frames",
                    order.len()
                )));
            }
        }
    }
    Ok(())
}

/// Grid-packed latents and controls together with the order of their frames.
#[derive(Debug, Clone)]
pub struct GridBatch {
    pub grids: PairedBatch,
    pub order: FrameOrder,
}

impl GridBatch {
    pub fn new(grids: PairedBatch, order: FrameOrder, dims: GridDims) -> Result<Self> {
        let frames = grids.len() * dims.cells();
        if frames != order.len() {
            return Err(RaveError::shape(format!(
                "{} grids of {} frames do not match an order over {} frames",
                grids.len(),
                dims.cells(),
                order.len()
            )));
        }
        Ok(Self { grids, order })
    }

    /// Regroups all frames into freshly drawn random grids.
    ///
    /// Latents and every control batch are gathered with the same permutation,
    /// and the frame order is updated to match.
    pub fn reshuffle(self, dims: GridDims, source: &mut dyn PermutationSource) -> Result<Self> {
        let n = self.order.len();
        let perm = source.permutation(n);
        let order = self.order.permuted(&perm)?;

        let device = self.grids.latents.device().clone();
        let ids: Vec<u32> = perm.iter().map(|&i| i as u32).collect();
        let ids = Tensor::from_vec(ids, n, &device)?;

        let grids = self.grids.try_map(|g| {
            let frames = grid::unpack_batch(g, dims)?;
            let gathered = frames.index_select(&ids, 0)?;
            grid::pack_batch(&gathered, dims)
        })?;
        debug!(frames = n, grids = grids.len(), "reshuffled grids");
        Ok(Self { grids, order })
    }

    /// Unpacks every grid tensor into per-slot frames `[N, C, H, W]`.
    pub fn into_frames(self, dims: GridDims) -> Result<(PairedBatch, FrameOrder)> {
        let frames = self.grids.try_map(|g| grid::unpack_batch(g, dims))?;
        Ok((frames, self.order))
    }
}
