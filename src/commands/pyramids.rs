use super::{for_each_crop, BatchOptions};
use crate::error::Result;
use crate::manifest::Manifest;
use crate::multiscale::{smooth_multiscale_labels, smooth_multiscale_raw};
use crate::pool::BatchReport;
use log::warn;

/// Smooth label pyramids `s0..s{num_scales-1}` for every crop. `s0` has to exist.
pub fn multiscale_labels(manifest: &Manifest, num_scales: usize, options: &BatchOptions) -> Result<BatchReport> {
    for_each_crop(manifest, options, "multiscale-labels", |crop| {
        smooth_multiscale_labels(&crop.path, num_scales)
    })
}

/// Raw pyramids for the `raw` group of every crop.
pub fn multiscale_raw(manifest: &Manifest, num_scales: usize, options: &BatchOptions) -> Result<BatchReport> {
    for (name, entry) in &manifest.datasets {
        if entry.raw.is_some() {
            warn!(
                "dataset {} has a dataset-level raw path, consider removing it. \
                 The `raw` group of each crop will be multiscaled.",
                name
            );
        }
    }
    for_each_crop(manifest, options, "multiscale-raw", |crop| smooth_multiscale_raw(&crop.path, num_scales))
}
