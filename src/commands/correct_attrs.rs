use super::{for_each_crop, BatchOptions};
use crate::annotation::Encoding;
use crate::attrs;
use crate::error::Result;
use crate::manifest::{CropRef, Manifest};
use crate::multiscale::label_group;
use crate::pool::BatchReport;
use crate::storage::{self, join_node, Backend, NodeKind};
use log::info;
use ndarray::ArrayD;

/// Complement counts `(absent, unknown)` of a possibly smoothed label array. Values are binarized
/// halfway between `present` and `absent`.
pub fn thresholded_counts(data: &ArrayD<f32>, encoding: &Encoding) -> (u64, u64) {
    let unknown = encoding.unknown as f32;
    let threshold = (encoding.present + encoding.absent) as f32 / 2.0;
    let num_unknown = data.iter().filter(|&&v| v == unknown).count() as u64;
    let below = data.iter().filter(|&&v| v != unknown && v <= threshold).count() as u64;
    if encoding.present > encoding.absent {
        (below, num_unknown)
    } else {
        // `below` counts present voxels, everything else that is known is absent
        (data.len() as u64 - num_unknown - below, num_unknown)
    }
}

/// Recomputes the complement counts of every level of one class group.
pub fn correct_class(backend: &dyn Backend, class: &str) -> Result<()> {
    for level in backend.children(class)? {
        let node = join_node(class, &level);
        if backend.kind(&node)? != Some(NodeKind::Array) {
            continue;
        }
        let mut level_attrs = backend.attributes(&node)?;
        let mut cellmap = attrs::cellmap(&level_attrs)?;
        let encoding = cellmap.encoding()?;
        let (absent, unknown) = thresholded_counts(&backend.read(&node)?.to_f32(), &encoding);
        cellmap.set_complement_counts(absent as f64, unknown);
        attrs::set_cellmap(&mut level_attrs, &cellmap)?;
        backend.set_attributes(&node, &level_attrs)?;
    }
    Ok(())
}

pub fn correct_crop(crop: &CropRef) -> Result<()> {
    let (backend, crop_node) = storage::open(&crop.path)?;
    let group = label_group(backend.as_ref(), &crop_node)?;
    for label in backend.cellmap(&group)?.class_names()? {
        info!("Correcting attributes in {} for {}", crop.path.display(), label);
        correct_class(backend.as_ref(), &join_node(&group, label))?;
    }
    Ok(())
}

pub fn correct_attrs(manifest: &Manifest, options: &BatchOptions) -> Result<BatchReport> {
    for_each_crop(manifest, options, "correct-attrs", correct_crop)
}
