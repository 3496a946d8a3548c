//! Reshuffling keeps latents and conditioning maps paired.

mod common;

use candle_core::Tensor;
use candle_rave::batch::PairedBatch;
use candle_rave::grid::{self, GridDims};
use candle_rave::shuffle::{FrameOrder, GridBatch, SeededPermutation};

use common::{ScriptedPermutations, indexed_frames, per_item_means};

fn grid_batch(dims: GridDims, samples: usize) -> candle_rave::Result<GridBatch> {
    let n = dims.cells() * samples;
    let latents = indexed_frames(n, 4, 2, 2);
    // control k of frame i is filled with 10 * i + k
    let controls = (0..2)
        .map(|k| -> candle_rave::Result<Tensor> {
            let c = indexed_frames(n, 3, 4, 4).affine(10.0, k as f64)?;
            grid::pack_batch(&c, dims)
        })
        .collect::<candle_rave::Result<Vec<_>>>()?;
    let grids = PairedBatch::new(grid::pack_batch(&latents, dims)?, controls)?;
    GridBatch::new(grids, FrameOrder::identity(n), dims)
}

#[test]
fn test_reshuffle_moves_controls_with_latents() -> candle_rave::Result<()> {
    let dims = GridDims::square(2);
    let mut source = SeededPermutation::new(11);
    let mut batch = grid_batch(dims, 3)?;
    for _ in 0..4 {
        batch = batch.reshuffle(dims, &mut source)?;
    }
    let (frames, order) = batch.clone().into_frames(dims)?;
    let latent_ids = per_item_means(&frames.latents);
    for (k, control) in frames.controls.iter().enumerate() {
        let control_ids = per_item_means(control);
        for (slot, (&l, &c)) in latent_ids.iter().zip(&control_ids).enumerate() {
            assert_eq!(c, 10.0 * l + k as f32, "slot {slot} lost its pairing");
        }
    }
    for (slot, &l) in latent_ids.iter().enumerate() {
        assert_eq!(l as usize, order.as_slice()[slot]);
    }
    Ok(())
}

#[test]
fn test_scripted_shuffle_then_restore() -> candle_rave::Result<()> {
    let dims = GridDims::square(1);
    let mut source = ScriptedPermutations::new(vec![vec![2, 0, 3, 1]]);
    let batch = grid_batch(dims, 4)?.reshuffle(dims, &mut source)?;
    assert_eq!(batch.order.as_slice(), &[2, 0, 3, 1]);

    let (frames, order) = batch.into_frames(dims)?;
    assert_eq!(per_item_means(&frames.latents), vec![2., 0., 3., 1.]);
    let items: Vec<Tensor> = (0..4)
        .map(|i| frames.latents.get(i))
        .collect::<candle_core::Result<_>>()?;
    let restored = order.restore(items)?;
    let ids: Vec<f32> = restored
        .iter()
        .map(|t| t.mean_all().and_then(|m| m.to_scalar::<f32>()))
        .collect::<candle_core::Result<_>>()?;
    assert_eq!(ids, vec![0., 1., 2., 3.]);
    Ok(())
}

#[test]
fn test_grid_batch_rejects_order_of_wrong_length() -> candle_rave::Result<()> {
    let dims = GridDims::square(2);
    let batch = grid_batch(dims, 2)?;
    assert!(GridBatch::new(batch.grids, FrameOrder::identity(7), dims).is_err());
    Ok(())
}
