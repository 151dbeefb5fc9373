use super::{for_each_crop, BatchOptions};
use crate::error::{Error, Result};
use crate::manifest::{CropRef, Manifest};
use crate::pool::BatchReport;
use crate::storage::{self, copy_tree, join_node, Format};
use log::info;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

const MAX_CHUNK: usize = 8;

static CROP_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"crop\d+").unwrap());

/// The first `crop<digits>` in `path`.
pub fn extract_crop_name(path: &str) -> Option<&str> { CROP_NAME.find(path).map(|m| m.as_str()) }

pub fn h5_chunks(shape: &[usize]) -> Vec<usize> { shape.iter().map(|&n| n.clamp(1, MAX_CHUNK)).collect() }

pub fn destination_of(crop: &CropRef, destination: &Path) -> PathBuf {
    let path = crop.path.to_string_lossy();
    let name = extract_crop_name(&path).unwrap_or(&crop.crop);
    destination.join(&crop.dataset).join(format!("{}.h5", name))
}

/// Rewrites the crop as an HDF5 file with the same hierarchy, chunked by at most 8 per axis.
pub fn export_crop(crop: &CropRef, destination: &Path) -> Result<()> {
    info!("Exporting {}", crop.path.display());
    let (src, src_node) = storage::open(&crop.path)?;
    let dst_path = destination_of(crop, destination);
    if dst_path.exists() {
        std::fs::remove_file(&dst_path)?;
    }
    let dst = storage::create(&dst_path, Format::Hdf5)?;
    for child in src.children(&src_node)? {
        copy_tree(src.as_ref(), &join_node(&src_node, &child), dst.as_ref(), &join_node("/", &child), &h5_chunks)?;
    }
    Ok(())
}

pub fn h5_export(manifest: &Manifest, destination: &Path, options: &BatchOptions) -> Result<BatchReport> {
    if cfg!(not(feature = "hdf5")) {
        return Err(Error::BackendUnavailable(Format::Hdf5));
    }
    for (name, _) in &manifest.datasets {
        std::fs::create_dir_all(destination.join(name))?;
    }
    for_each_crop(manifest, options, "h5-export", |crop| export_crop(crop, destination))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crop_names_come_from_the_path() {
        assert_eq!(extract_crop_name("/nrs/jrc_hela-2/groundtruth.zarr/crop113/labels"), Some("crop113"));
        assert_eq!(extract_crop_name("/data/crop7/crop8"), Some("crop7"));
        assert_eq!(extract_crop_name("/data/cropped"), None);
    }

    #[test]
    fn crop_name_pattern_compiles() {
        assert_eq!(CROP_NAME.as_str(), r"crop\d+");
        assert!(CROP_NAME.is_match("crop0"));
    }

    #[test]
    fn chunks_are_capped_at_eight() {
        assert_eq!(h5_chunks(&[3, 20, 8]), vec![3, 8, 8]);
        assert_eq!(h5_chunks(&[0]), vec![1]);
    }

    #[test]
    fn file_is_named_after_the_crop() {
        let crop = CropRef {
            dataset: "jrc_hela-2".to_string(),
            crop: "roi_a".to_string(),
            path: PathBuf::from("/data/groundtruth.zarr/roi_a"),
            raw: None,
        };
        assert_eq!(destination_of(&crop, Path::new("/out")), PathBuf::from("/out/jrc_hela-2/roi_a.h5"));
        let crop = CropRef { path: PathBuf::from("/data/groundtruth.zarr/crop42"), ..crop };
        assert_eq!(destination_of(&crop, Path::new("/out")), PathBuf::from("/out/jrc_hela-2/crop42.h5"));
    }

    #[cfg(feature = "hdf5")]
    #[test]
    fn exports_hierarchy_and_attributes() {
        use crate::storage::zarr::ZarrBackend;
        use crate::storage::{Backend, Volume};
        use ndarray::{ArrayD, IxDyn};
        use serde_json::json;

        let dir = tempfile::tempdir().unwrap();
        let crop_path = dir.path().join("groundtruth.zarr/crop3");
        let src = ZarrBackend::create(&crop_path).unwrap();
        let data = ArrayD::from_shape_vec(IxDyn(&[2, 3, 10]), (0..60).map(|v| v as f32).collect()).unwrap();
        src.write("/labels/er/s0", &Volume::F32(data.clone()), &[1, 3, 10]).unwrap();
        let mut level_attrs = crate::attrs::Attributes::new();
        level_attrs.insert("cellmap".into(), json!({"annotation": {"class_names": ["er"]}}));
        src.set_attributes("/labels/er/s0", &level_attrs).unwrap();

        let crop = CropRef { dataset: "d".to_string(), crop: "crop3".to_string(), path: crop_path, raw: None };
        std::fs::create_dir_all(dir.path().join("out/d")).unwrap();
        export_crop(&crop, &dir.path().join("out")).unwrap();

        let (dst, _) = storage::open(&dir.path().join("out/d/crop3.h5")).unwrap();
        assert_eq!(dst.format(), Format::Hdf5);
        assert_eq!(dst.read("/labels/er/s0").unwrap(), Volume::F32(data));
        assert_eq!(dst.array_info("/labels/er/s0").unwrap().chunks, Some(vec![2, 3, 8]));
        assert_eq!(dst.attributes("/labels/er/s0").unwrap(), level_attrs);
    }
}
