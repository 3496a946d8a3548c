//! Grid codec: tiles frames into mosaic tensors and back.
//!
//! Frame `k` of a grid lands at row `k / cols`, column `k % cols` (row-major).
//! Latents and conditioning maps go through the same reshape/permute path, so a
//! frame's latent tile and its control tiles always occupy the same cell.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{RaveError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridDims {
    pub rows: usize,
    pub cols: usize,
}

impl GridDims {
    pub fn square(size: usize) -> Self {
        Self {
            rows: size,
            cols: size,
        }
    }

    /// Frames per grid.
    pub fn cells(&self) -> usize {
        self.rows * self.cols
    }
}

/// Tiles `rows * cols` frames `[C, H, W]` into one `[C, rows*H, cols*W]` grid.
pub fn pack(frames: &[Tensor], dims: GridDims) -> Result<Tensor> {
    if frames.is_empty() || frames.len() != dims.cells() {
        return Err(RaveError::shape(format!(
            "pack expects {} frames for a {}x{} grid, got {}",
            dims.cells(),
            dims.rows,
            dims.cols,
            frames.len()
        )));
    }
    let first = frames[0].dims();
    if first.len() != 3 {
        return Err(RaveError::shape(format!(
            "pack expects [C, H, W] frames, got {first:?}"
        )));
    }
    if let Some(odd) = frames.iter().find(|f| f.dims() != first) {
        return Err(RaveError::shape(format!(
            "pack expects frames of identical shape, got {first:?} and {:?}",
            odd.dims()
        )));
    }
    let stacked = Tensor::stack(frames, 0)?;
    Ok(pack_batch(&stacked, dims)?.squeeze(0)?)
}

/// Exact inverse of [`pack`].
pub fn unpack(grid: &Tensor, dims: GridDims) -> Result<Vec<Tensor>> {
    if grid.rank() != 3 {
        return Err(RaveError::shape(format!(
            "unpack expects a [C, H, W] grid, got {:?}",
            grid.dims()
        )));
    }
    let frames = unpack_batch(&grid.unsqueeze(0)?, dims)?;
    (0..dims.cells())
        .map(|i| frames.get(i).map_err(RaveError::from))
        .collect()
}

/// `[N, C, H, W]` frames -> `[N / cells, C, rows*H, cols*W]` grids.
///
/// Consecutive runs of `cells` frames form one grid.
pub fn pack_batch(frames: &Tensor, dims: GridDims) -> Result<Tensor> {
    let (n, c, h, w) = dims4(frames, "pack_batch")?;
    let cells = dims.cells();
    if cells == 0 || n % cells != 0 {
        return Err(RaveError::shape(format!(
            "pack_batch: {n} frames do not fill {}x{} grids",
            dims.rows, dims.cols
        )));
    }
    let s = n / cells;
    // [S, rows, cols, C, H, W] -> [S, C, rows, H, cols, W]
    let x = frames
        .reshape(vec![s, dims.rows, dims.cols, c, h, w])?
        .permute(vec![0, 3, 1, 4, 2, 5])?
        .contiguous()?;
    Ok(x.reshape((s, c, dims.rows * h, dims.cols * w))?)
}

/// `[S, C, rows*H, cols*W]` grids -> `[S * cells, C, H, W]` frames.
pub fn unpack_batch(grids: &Tensor, dims: GridDims) -> Result<Tensor> {
    let (s, c, gh, gw) = dims4(grids, "unpack_batch")?;
    if dims.rows == 0 || dims.cols == 0 || gh % dims.rows != 0 || gw % dims.cols != 0 {
        return Err(RaveError::shape(format!(
            "unpack_batch: {gh}x{gw} grid is not divisible into {}x{} cells",
            dims.rows, dims.cols
        )));
    }
    let (h, w) = (gh / dims.rows, gw / dims.cols);
    // [S, C, rows, H, cols, W] -> [S, rows, cols, C, H, W]
    let x = grids
        .reshape(vec![s, c, dims.rows, h, dims.cols, w])?
        .permute(vec![0, 2, 4, 1, 3, 5])?
        .contiguous()?;
    Ok(x.reshape((s * dims.cells(), c, h, w))?)
}

fn dims4(t: &Tensor, op: &str) -> Result<(usize, usize, usize, usize)> {
    match *t.dims() {
        [a, b, c, d] => Ok((a, b, c, d)),
        ref other => Err(RaveError::shape(format!(
            "{op} expects a rank-4 tensor, got {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, IndexOp};

    fn constant_frame(value: f32, device: &Device) -> Tensor {
        Tensor::full(value, (1, 2, 3), device).unwrap()
    }

    #[test]
    fn pack_places_frames_row_major() -> Result<()> {
        let device = Device::Cpu;
        let frames: Vec<Tensor> = (0..4).map(|k| constant_frame(k as f32, &device)).collect();
        let grid = pack(&frames, GridDims::square(2))?;
        assert_eq!(grid.dims(), &[1, 4, 6]);

        // top-left, top-right, bottom-left, bottom-right
        let corner = |r: usize, c: usize| -> f32 {
            grid.i((0, r, c)).unwrap().to_scalar::<f32>().unwrap()
        };
        assert_eq!(corner(0, 0), 0.0);
        assert_eq!(corner(0, 5), 1.0);
        assert_eq!(corner(3, 0), 2.0);
        assert_eq!(corner(3, 5), 3.0);
        Ok(())
    }

    #[test]
    fn pack_rejects_wrong_frame_count() {
        let device = Device::Cpu;
        let frames: Vec<Tensor> = (0..3).map(|k| constant_frame(k as f32, &device)).collect();
        assert!(matches!(
            pack(&frames, GridDims::square(2)),
            Err(RaveError::Shape(_))
        ));
    }

    #[test]
    fn pack_rejects_mixed_shapes() {
        let device = Device::Cpu;
        let frames = vec![
            constant_frame(0.0, &device),
            Tensor::zeros((1, 2, 4), candle_core::DType::F32, &device).unwrap(),
        ];
        let dims = GridDims { rows: 1, cols: 2 };
        assert!(matches!(pack(&frames, dims), Err(RaveError::Shape(_))));
    }

    #[test]
    fn unpack_rejects_indivisible_grid() {
        let grid = Tensor::zeros((3, 5, 6), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            unpack(&grid, GridDims::square(2)),
            Err(RaveError::Shape(_))
        ));
    }

    #[test]
    fn batch_forms_group_consecutive_frames() -> Result<()> {
        let device = Device::Cpu;
        let frames = Tensor::arange(0f32, 8f32, &device)?.reshape((8, 1, 1, 1))?;
        let grids = pack_batch(&frames, GridDims::square(2))?;
        assert_eq!(grids.dims(), &[2, 1, 2, 2]);
        assert_eq!(
            grids.flatten_all()?.to_vec1::<f32>()?,
            vec![0., 1., 2., 3., 4., 5., 6., 7.]
        );
        let back = unpack_batch(&grids, GridDims::square(2))?;
        assert_eq!(
            back.flatten_all()?.to_vec1::<f32>()?,
            frames.flatten_all()?.to_vec1::<f32>()?
        );
        Ok(())
    }
}
