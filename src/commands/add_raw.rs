use super::{for_each_crop, BatchOptions};
use crate::attrs;
use crate::error::{Error, Result};
use crate::manifest::{CropRef, Manifest};
use crate::multiscale::{label_group, RAW};
use crate::ome::{self, AXIS_NAMES};
use crate::pool::BatchReport;
use crate::reader::{read_any_array, read_array, CoordArray};
use crate::storage::{self, join_node, slab_chunks};
use log::info;

const EPS: f64 = 1e-6;

/// The block of `raw` covering the voxels of `label`: start index and shape per raw axis, plus
/// the physical position of the first selected raw voxel, all in the axis order of `raw`.
///
/// Voxel centers sit at the coordinates, so the label extent reaches half a label voxel beyond
/// the first and last coordinate.
pub fn raw_selection(label: &CoordArray, raw: &CoordArray) -> Result<(Vec<usize>, Vec<usize>, Vec<f64>)> {
    let (mut start, mut shape, mut origin) = (vec![], vec![], vec![]);
    for (r, dim) in raw.dims.iter().enumerate() {
        let l = label
            .dims
            .iter()
            .position(|d| d == dim)
            .ok_or_else(|| Error::Selection(format!("raw axis {}: not an axis of the labels", dim)))?;
        let coords = &label.coords[l];
        let (first, last) = match (coords.first(), coords.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return Err(Error::Selection(format!("raw along {}: labels are empty", dim))),
        };
        let (lbl_res, raw_res) = (label.scale[l], raw.scale[r]);
        if !(lbl_res.is_finite() && lbl_res > 0.0 && raw_res.is_finite() && raw_res > 0.0) {
            return Err(Error::Selection(format!(
                "raw along {}: resolutions must be positive, got {} for labels and {} for raw",
                dim, lbl_res, raw_res
            )));
        }
        if !(first.is_finite() && last.is_finite() && raw.translation[r].is_finite()) {
            return Err(Error::Selection(format!("raw along {}: coordinates are not finite", dim)));
        }
        let start_raw = first - lbl_res / 2.0 + raw_res / 2.0;
        let end_raw = last + lbl_res / 2.0 - raw_res / 2.0;

        let index = (start_raw - raw.translation[r]) / raw_res;
        if (index - index.round()).abs() > EPS || index.round() < 0.0 {
            return Err(Error::Selection(format!("raw at {} = {}: not on the raw grid", dim, start_raw)));
        }
        let index = index.round() as usize;
        let n = ((end_raw - start_raw) / raw_res - EPS).ceil().max(0.0) as usize + 1;
        if index + n > raw.shape[r] {
            return Err(Error::Selection(format!(
                "raw along {} from {} to {}: outside of the raw volume",
                dim, start_raw, end_raw
            )));
        }
        start.push(index);
        shape.push(n);
        origin.push(start_raw);
    }
    Ok((start, shape, origin))
}

/// Crops `s0` of the dataset's raw volume to the extent of the crop's labels and stores it as
/// the crop's `raw/s0`.
pub fn add_raw(crop: &CropRef) -> Result<()> {
    let raw_path = crop
        .raw
        .as_ref()
        .ok_or_else(|| Error::Config(format!("dataset {} has no raw entry", crop.dataset)))?;
    let raw = read_any_array(&raw_path.join("s0"))?;

    let (backend, crop_node) = storage::open(&crop.path)?;
    let group = label_group(backend.as_ref(), &crop_node)?;
    let class_names = backend.cellmap(&group)?.class_names()?.to_vec();
    let reference = class_names
        .first()
        .ok_or_else(|| Error::MissingAttribute("cellmap.annotation.class_names[0]".to_string()))?;
    let label = read_array(backend.as_ref(), &join_node(&join_node(&group, reference), "s0"))?;

    let (start, shape, origin) = raw_selection(&label, &raw)?;
    let data = raw.load_region(&start, &shape)?;

    let by_axis = |values: &[f64]| -> Result<Vec<f64>> {
        AXIS_NAMES
            .iter()
            .map(|axis| {
                raw.dims
                    .iter()
                    .position(|d| d == axis)
                    .map(|i| values[i])
                    .ok_or_else(|| Error::Selection(format!("raw along {}: raw has no such axis", axis)))
            })
            .collect()
    };
    let doc = ome::append_level(ome::initialize(), "s0", &by_axis(&raw.scale)?, &by_axis(&origin)?);

    let raw_group = join_node(&crop_node, RAW);
    backend.create_group(&raw_group, true)?;
    backend.set_attributes(&raw_group, &attrs::from_multiscales(&doc)?)?;
    backend.write(&join_node(&raw_group, "s0"), &data, &slab_chunks(&shape))?;
    info!("Successfully added raw in {}", crop.id());
    Ok(())
}

pub fn add_raw_main(manifest: &Manifest, options: &BatchOptions) -> Result<BatchReport> {
    for_each_crop(manifest, options, "add-raw", add_raw)
}
