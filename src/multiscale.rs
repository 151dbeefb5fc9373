//! Builds `s1..s{N-1}` from `s0` for the labels and raw data of a crop.

use crate::attrs;
use crate::downsample::{self, check_encoding, complement_counts, DEFAULT_FACTOR};
use crate::error::{Error, Result};
use crate::ome;
use crate::storage::{self, join_node, slab_chunks, Backend, Volume};
use itertools::Itertools;
use log::{error, info};
use std::path::Path;

pub const DEFAULT_NUM_SCALES: usize = 4;
pub const LABELS: &str = "labels";
pub const RAW: &str = "raw";

pub fn level_names(num_scales: usize) -> Vec<String> { (0..num_scales).map(|k| format!("s{}", k)).collect() }

/// The group holding the class groups of a crop: its `labels` child if there is one.
pub fn label_group(backend: &dyn Backend, crop: &str) -> Result<String> {
    let labels = join_node(crop, LABELS);
    if backend.exists(&labels)? {
        Ok(labels)
    } else {
        Ok(crop.to_string())
    }
}

/// Appends the transform of `l2`, derived from `l1`, to the multiscale metadata of `group`.
fn append_coarser_level(backend: &dyn Backend, group: &str, l1: &str, l2: &str, factor: usize) -> Result<()> {
    backend.update_attributes(group, &mut |group_attrs| {
        let doc = attrs::multiscales(group_attrs)?;
        let (scale, translation) = ome::resolve_transform(&doc, l1)?;
        let (next_scale, next_translation) = ome::coarser_transform(&scale, &translation, factor);
        let doc = ome::append_level(doc, l2, &next_scale, &next_translation);
        attrs::set_multiscales(group_attrs, &doc)
    })
}

/// Derives label level `l2` from `l1` inside the class group `group`.
pub fn derive_label_level(backend: &dyn Backend, group: &str, l1: &str, l2: &str, factor: usize) -> Result<()> {
    let src = join_node(group, l1);
    let dst = join_node(group, l2);
    let src_attrs = backend.attributes(&src)?;
    let mut cellmap = attrs::cellmap(&src_attrs)?;
    let encoding = cellmap.semantic_encoding()?;
    let ndim = backend.array_info(&src)?.shape.len();
    check_encoding(&encoding, factor, ndim)?;

    let data = backend.read(&src)?.to_f32();
    let down = downsample::smooth_labels(&data, &encoding, factor);
    let chunks = slab_chunks(down.shape());
    let (absent, unknown) = complement_counts(&down, &encoding);
    backend.write(&dst, &Volume::F32(down), &chunks)?;

    cellmap.set_complement_counts(absent, unknown);
    let mut dst_attrs = src_attrs;
    attrs::set_cellmap(&mut dst_attrs, &cellmap)?;
    backend.set_attributes(&dst, &dst_attrs)?;

    append_coarser_level(backend, group, l1, l2, factor)
}

/// Derives raw level `l2` from `l1` inside `group`.
pub fn derive_raw_level(backend: &dyn Backend, group: &str, l1: &str, l2: &str, factor: usize) -> Result<()> {
    let data = backend.read(&join_node(group, l1))?.to_f32();
    let down = downsample::smooth_raw(&data, factor);
    let chunks = slab_chunks(down.shape());
    backend.write(&join_node(group, l2), &Volume::F32(down), &chunks)?;
    append_coarser_level(backend, group, l1, l2, factor)
}

pub fn label_pyramid(backend: &dyn Backend, group: &str, num_scales: usize) -> Result<()> {
    for (l1, l2) in level_names(num_scales).iter().tuple_windows() {
        derive_label_level(backend, group, l1, l2, DEFAULT_FACTOR)?;
    }
    Ok(())
}

pub fn raw_pyramid(backend: &dyn Backend, group: &str, num_scales: usize) -> Result<()> {
    for (l1, l2) in level_names(num_scales).iter().tuple_windows() {
        derive_raw_level(backend, group, l1, l2, DEFAULT_FACTOR)?;
    }
    Ok(())
}

/// Smooth label pyramids for every class of the crop at `crop_path`.
///
/// A failing class is logged and the remaining classes are still processed.
pub fn smooth_multiscale_labels(crop_path: &Path, num_scales: usize) -> Result<()> {
    let (backend, crop) = storage::open(crop_path)?;
    let group = label_group(backend.as_ref(), &crop)?;
    let class_names = backend.cellmap(&group)?.class_names()?.to_vec();
    let mut failed = vec![];
    for label in class_names {
        info!("Processing {} for {}", crop_path.display(), label);
        if let Err(e) = label_pyramid(backend.as_ref(), &join_node(&group, &label), num_scales) {
            error!("{}: {} failed: {}", crop_path.display(), label, e);
            failed.push(label);
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        Err(Error::Storage(format!("failed labels: {}", failed.join(", "))))
    }
}

pub fn smooth_multiscale_raw(crop_path: &Path, num_scales: usize) -> Result<()> {
    let (backend, crop) = storage::open(crop_path)?;
    info!("Processing {} for raw", crop_path.display());
    raw_pyramid(backend.as_ref(), &join_node(&crop, RAW), num_scales)
}
