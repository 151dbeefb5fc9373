use super::{for_each_crop, BatchOptions};
use crate::attrs;
use crate::error::Result;
use crate::manifest::{CropRef, Manifest};
use crate::multiscale::LABELS;
use crate::ome;
use crate::pool::BatchReport;
use crate::storage::{self, join_node, slab_chunks, Backend, Format, NodeKind};
use log::info;
use std::path::{Path, PathBuf};

const LEVEL: &str = "s0";

pub fn destination_of(crop: &CropRef, destination: &Path) -> PathBuf {
    destination.join(&crop.dataset).join(format!("{}.zarr", crop.crop))
}

/// Copies `s0` of every class of `crop` into `<destination>/<dataset>/<crop>.zarr/labels/`.
pub fn copy_crop(crop: &CropRef, destination: &Path) -> Result<()> {
    info!("Copying crop {}", crop.path.display());
    let (src, src_node) = storage::open(&crop.path)?;
    let dst_path = destination_of(crop, destination);
    if dst_path.exists() {
        std::fs::remove_dir_all(&dst_path)?;
    }
    let dst = storage::create(&dst_path, Format::Zarr)?;
    let labels = join_node("/", LABELS);
    dst.create_group(&labels, true)?;
    dst.set_attributes(&labels, &src.attributes(&src_node)?)?;

    for class in src.children(&src_node)? {
        let src_class = join_node(&src_node, &class);
        if src.kind(&src_class)? != Some(NodeKind::Group) {
            continue;
        }
        copy_class(src.as_ref(), &src_class, dst.as_ref(), &join_node(&labels, &class))?;
    }
    Ok(())
}

fn copy_class(src: &dyn Backend, src_class: &str, dst: &dyn Backend, dst_class: &str) -> Result<()> {
    let mut class_attrs = src.attributes(src_class)?;
    let single = ome::extract_single_level(attrs::multiscales(&class_attrs)?, LEVEL, LEVEL)?;
    attrs::set_multiscales(&mut class_attrs, &single)?;
    dst.create_group(dst_class, true)?;
    dst.set_attributes(dst_class, &class_attrs)?;

    let src_level = join_node(src_class, LEVEL);
    let dst_level = join_node(dst_class, LEVEL);
    let data = src.read(&src_level)?;
    dst.write(&dst_level, &data, &slab_chunks(data.shape()))?;
    dst.set_attributes(&dst_level, &src.attributes(&src_level)?)
}

pub fn copy_crops(manifest: &Manifest, destination: &Path, options: &BatchOptions) -> Result<BatchReport> {
    for (name, _) in &manifest.datasets {
        std::fs::create_dir_all(destination.join(name))?;
    }
    for_each_crop(manifest, options, "copy-crops", |crop| copy_crop(crop, destination))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::zarr::ZarrBackend;
    use crate::storage::Volume;
    use ndarray::{ArrayD, IxDyn};
    use serde_json::json;

    #[test]
    fn copies_only_s0_with_single_level_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let crop_path = dir.path().join("groundtruth.zarr/crop4");
        let src = ZarrBackend::create(&crop_path).unwrap();
        let mut crop_attrs = crate::attrs::Attributes::new();
        crop_attrs.insert("cellmap".into(), json!({"annotation": {"class_names": ["er"]}}));
        src.set_attributes("/", &crop_attrs).unwrap();
        src.create_group("/er", false).unwrap();
        let doc = ome::append_level(ome::initialize(), "s0", &[4.0; 3], &[0.0; 3]);
        let doc = ome::append_level(doc, "s1", &[8.0; 3], &[2.0; 3]);
        src.set_attributes("/er", &attrs::from_multiscales(&doc).unwrap()).unwrap();
        let data = ArrayD::from_shape_vec(IxDyn(&[2, 2, 2]), (0u8..8).collect()).unwrap();
        src.write("/er/s0", &Volume::U8(data.clone()), &[2, 2, 2]).unwrap();
        src.write("/er/s1", &Volume::U8(ArrayD::zeros(IxDyn(&[1, 1, 1]))), &[1, 1, 1]).unwrap();

        let crop = CropRef {
            dataset: "jrc_cos7-1a".to_string(),
            crop: "crop4".to_string(),
            path: crop_path,
            raw: None,
        };
        let out = dir.path().join("out");
        copy_crop(&crop, &out).unwrap();

        let dst = ZarrBackend::open(&out.join("jrc_cos7-1a/crop4.zarr")).unwrap();
        assert_eq!(dst.attributes("/labels").unwrap(), crop_attrs);
        assert_eq!(dst.multiscales("/labels/er").unwrap().level_names(), vec!["s0"]);
        assert_eq!(dst.read("/labels/er/s0").unwrap(), Volume::U8(data));
        assert_eq!(dst.array_info("/labels/er/s0").unwrap().chunks, Some(vec![1, 2, 2]));
        assert_eq!(dst.kind("/labels/er/s1").unwrap(), None);
    }
}
