//! Smooth downsampling of label and raw volumes.
//!
//! Label volumes hold `present`/`absent` codes plus a large `unknown` sentinel. Averaging blocks
//! gives soft labels between present and absent, while any block touching an unknown voxel ends
//! up above `max(present, absent)` and is reset to exactly `unknown`.

use crate::annotation::Encoding;
use crate::error::{Error, Result};
use ndarray::{ArrayD, Dimension, IxDyn, Slice};

pub const DEFAULT_FACTOR: usize = 2;

/// Makes sure a single `unknown` voxel in a block of `factor^ndim` keeps the block mean above
/// every annotated value.
pub fn check_encoding(encoding: &Encoding, factor: usize, ndim: usize) -> Result<()> {
    let margin = (factor as f64).powi(ndim as i32);
    if encoding.unknown as f64 <= margin * encoding.max_annotated() as f64 {
        return Err(Error::UnsafeEncoding { encoding: *encoding, margin });
    }
    Ok(())
}

/// Block mean over `factor` voxels along every axis. Edge blocks are zero padded, so the output
/// has `ceil(n / factor)` voxels per axis.
pub fn downscale_local_mean(data: &ArrayD<f32>, factor: usize) -> ArrayD<f32> {
    let factor = factor.max(1);
    let out_shape: Vec<usize> = data.shape().iter().map(|&n| n.div_ceil(factor)).collect();
    let mut sums = ArrayD::<f64>::zeros(IxDyn(&out_shape));
    let mut out_idx = vec![0usize; data.ndim()];
    for (idx, &v) in data.indexed_iter() {
        for (o, &i) in out_idx.iter_mut().zip(idx.slice()) {
            *o = i / factor;
        }
        sums[IxDyn(&out_idx)] += v as f64;
    }
    let block = (factor as f64).powi(data.ndim() as i32);
    sums.mapv(|s| (s / block) as f32)
}

/// Drops trailing voxels so that every axis length is a multiple of `multiple`.
pub fn trim_to_multiple(data: ArrayD<f32>, multiple: usize) -> ArrayD<f32> {
    let multiple = multiple.max(1);
    if data.shape().iter().all(|n| n % multiple == 0) {
        return data;
    }
    data.slice_each_axis(|ax| Slice::from(0..(ax.len / multiple) * multiple))
        .to_owned()
}

/// Resets everything above `max(present, absent)` to `unknown`.
pub fn quantize_unknown(data: &mut ArrayD<f32>, encoding: &Encoding) {
    let max = encoding.max_annotated() as f32;
    let unknown = encoding.unknown as f32;
    data.mapv_inplace(|v| if v > max { unknown } else { v });
}

pub fn round2(x: f64) -> f64 { (x * 100.0).round() / 100.0 }

/// `(absent, unknown)`: the summed distance to `present` over all annotated voxels (rounded to
/// two decimals) and the number of `unknown` voxels.
pub fn complement_counts(data: &ArrayD<f32>, encoding: &Encoding) -> (f64, u64) {
    let unknown = encoding.unknown as f32;
    let present = encoding.present as f64;
    let (absent, n_unknown) = data.iter().fold((0f64, 0u64), |(absent, n), &v| {
        if v == unknown {
            (absent, n + 1)
        } else {
            (absent + (present - v as f64), n)
        }
    });
    (round2(absent), n_unknown)
}

/// One coarsening step for a label volume.
pub fn smooth_labels(data: &ArrayD<f32>, encoding: &Encoding, factor: usize) -> ArrayD<f32> {
    let mut down = smooth_raw(data, factor);
    quantize_unknown(&mut down, encoding);
    down
}

/// One coarsening step for a raw volume.
pub fn smooth_raw(data: &ArrayD<f32>, factor: usize) -> ArrayD<f32> {
    trim_to_multiple(downscale_local_mean(data, factor), factor)
}
