use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::multiscale::LABELS;
use crate::reader::scale_level_of;
use crate::storage::{self, join_node, Backend};
use log::{debug, info};
use std::collections::HashSet;
use std::path::Path;

const FULL_RESOLUTION: &str = "s0";

/// Conditions a crop has to meet to stay in the manifest. `None` switches a condition off.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CropFilter {
    /// The labels have a level with exactly this scale. Size and annotation are checked at that
    /// level, otherwise at `s0`.
    pub scale: Option<Vec<f64>>,
    pub min_size: Option<Vec<usize>>,
    pub min_frac_annotated: Option<f64>,
    /// Labels that each need `min_frac_annotated` of their voxels annotated.
    pub labels: Vec<String>,
}

/// Lookups that come up empty mean the crop does not qualify.
fn unless_missing(check: Result<bool>) -> Result<bool> {
    match check {
        Err(e) if e.is_lookup() => {
            debug!("condition not met: {}", e);
            Ok(false)
        }
        other => other,
    }
}

struct CropLabels {
    backend: Box<dyn Backend>,
    group: String,
    class_names: Vec<String>,
}

impl CropLabels {
    fn open(crop_path: &Path) -> Result<Self> {
        let (backend, group) = storage::open(&crop_path.join(LABELS))?;
        let class_names = backend.cellmap(&group)?.class_names()?.to_vec();
        Ok(Self { backend, group, class_names })
    }

    fn reference(&self) -> Result<&str> {
        self.class_names
            .first()
            .map(String::as_str)
            .ok_or_else(|| Error::MissingAttribute("cellmap.annotation.class_names[0]".to_string()))
    }

    fn level(&self, label: &str, scale: Option<&[f64]>) -> Result<String> {
        match scale {
            Some(scale) => scale_level_of(self.backend.as_ref(), &join_node(&self.group, label), scale),
            None => Ok(FULL_RESOLUTION.to_string()),
        }
    }

    fn has_scale(&self, scale: &[f64]) -> Result<bool> {
        self.level(self.reference()?, Some(scale))?;
        Ok(true)
    }

    fn has_min_size(&self, min_size: &[usize], scale: Option<&[f64]>) -> Result<bool> {
        let label = self.reference()?;
        let level = self.level(label, scale)?;
        let shape = self.backend.array_info(&join_node(&join_node(&self.group, label), &level))?.shape;
        Ok(shape.iter().zip(min_size).all(|(n, min)| n >= min))
    }

    fn annotated_fraction(&self, label: &str, scale: Option<&[f64]>) -> Result<Option<f64>> {
        if !self.class_names.iter().any(|c| c == label) {
            return Ok(None);
        }
        let node = join_node(&join_node(&self.group, label), &self.level(label, scale)?);
        let n: usize = self.backend.array_info(&node)?.shape.iter().product();
        if n == 0 {
            return Ok(None);
        }
        let unknown = self
            .backend
            .cellmap(&node)?
            .annotation
            .complement_counts
            .and_then(|c| c.unknown)
            .unwrap_or(0);
        Ok(Some((n as f64 - unknown as f64) / n as f64))
    }
}

impl CropFilter {
    pub fn validate(&self) -> Result<()> {
        match self.min_frac_annotated {
            Some(f) if f > 1.0 => Err(Error::Config(format!(
                "min_frac_annotated should be a fraction but got {}, did you use percent?",
                f
            ))),
            _ => Ok(()),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.scale.is_none() && self.min_size.is_none() && self.min_frac_annotated.is_none()
    }

    /// Whether the crop at `crop_path` passes every enabled condition. Conditions are checked in
    /// order and the first failing one decides.
    pub fn keep(&self, crop_path: &Path) -> Result<bool> {
        self.validate()?;
        if self.is_disabled() {
            return Ok(true);
        }
        let labels = CropLabels::open(crop_path)?;
        let scale = self.scale.as_deref();
        if let Some(scale) = scale {
            if !unless_missing(labels.has_scale(scale))? {
                return Ok(false);
            }
        }
        if let Some(min_size) = &self.min_size {
            if !unless_missing(labels.has_min_size(min_size, scale))? {
                return Ok(false);
            }
        }
        if let Some(min_frac) = self.min_frac_annotated {
            for label in &self.labels {
                let enough = labels.annotated_fraction(label, scale).map(|f| f.is_some_and(|f| f >= min_frac));
                if !unless_missing(enough)? {
                    debug!("{}: {} is not annotated enough", crop_path.display(), label);
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

/// The manifest with only the crops that pass `filter`. Datasets without crops are removed.
pub fn filter_manifest(manifest: &Manifest, filter: &CropFilter) -> Result<Manifest> {
    filter.validate()?;
    let mut kept = HashSet::new();
    for crop in manifest.crops() {
        if filter.keep(&crop.path)? {
            kept.insert(crop.id());
        } else {
            info!("dropping {}", crop.id());
        }
    }
    let mut filtered = manifest.clone();
    filtered.retain_crops(|dataset, _, crop| kept.contains(&format!("{}/{}", dataset, crop)));
    Ok(filtered)
}

pub fn filter_yaml(manifest: &Manifest, out: &Path, filter: &CropFilter) -> Result<Manifest> {
    let filtered = filter_manifest(manifest, filter)?;
    filtered.save(out)?;
    info!(
        "kept {} of {} crops, written to {}",
        filtered.crops().len(),
        manifest.crops().len(),
        out.display()
    );
    Ok(filtered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::{self, Attributes};
    use crate::ome;
    use crate::storage::zarr::ZarrBackend;
    use crate::storage::Volume;
    use ndarray::{ArrayD, IxDyn};
    use serde_json::json;

    /// A crop with `mito` at 4nm (s0, 8³) and 8nm (s1, 4³). A quarter of s0 is unknown.
    fn crop(dir: &Path, name: &str) -> std::path::PathBuf {
        let path = dir.join("groundtruth.zarr").join(name);
        let backend = ZarrBackend::create(&path).unwrap();
        backend.create_group("/labels/mito", false).unwrap();
        let mut labels = Attributes::new();
        labels.insert("cellmap".into(), json!({"annotation": {"class_names": ["mito"]}}));
        backend.set_attributes("/labels", &labels).unwrap();
        let doc = ome::append_level(ome::initialize(), "s0", &[4.0; 3], &[0.0; 3]);
        let doc = ome::append_level(doc, "s1", &[8.0; 3], &[2.0; 3]);
        backend.set_attributes("/labels/mito", &attrs::from_multiscales(&doc).unwrap()).unwrap();
        for (level, n, unknown) in [("s0", 8, 128), ("s1", 4, 0)] {
            let node = format!("/labels/mito/{}", level);
            backend.write(&node, &Volume::U8(ArrayD::zeros(IxDyn(&[n, n, n]))), &[1, n, n]).unwrap();
            let mut level_attrs = Attributes::new();
            level_attrs.insert(
                "cellmap".into(),
                json!({"annotation": {"complement_counts": {"absent": 0, "unknown": unknown}}}),
            );
            backend.set_attributes(&node, &level_attrs).unwrap();
        }
        path
    }

    #[test]
    fn disabled_filters_keep_everything() {
        let filter = CropFilter::default();
        assert!(filter.keep(Path::new("/does/not/exist")).unwrap());
        // labels alone do nothing without a fraction
        let filter = CropFilter { labels: vec!["nope".into()], ..Default::default() };
        assert!(filter.keep(Path::new("/does/not/exist")).unwrap());
    }

    #[test]
    fn conditions_compose() {
        let dir = tempfile::tempdir().unwrap();
        let path = crop(dir.path(), "crop1");
        let keep = |filter: CropFilter| filter.keep(&path).unwrap();

        assert!(keep(CropFilter { scale: Some(vec![8.0; 3]), ..Default::default() }));
        assert!(!keep(CropFilter { scale: Some(vec![16.0; 3]), ..Default::default() }));

        // size is checked at the requested scale, s0 otherwise
        assert!(keep(CropFilter { min_size: Some(vec![8, 8, 8]), ..Default::default() }));
        assert!(!keep(CropFilter { scale: Some(vec![8.0; 3]), min_size: Some(vec![8, 8, 8]), ..Default::default() }));

        let annotated = |f: f64, scale: Option<Vec<f64>>, label: &str| CropFilter {
            scale,
            min_frac_annotated: Some(f),
            labels: vec![label.to_string()],
            ..Default::default()
        };
        assert!(keep(annotated(0.75, None, "mito")));
        assert!(!keep(annotated(0.8, None, "mito")));
        assert!(keep(annotated(1.0, Some(vec![8.0; 3]), "mito")));
        assert!(!keep(annotated(0.1, None, "er")));
    }

    #[test]
    fn percentages_are_rejected() {
        let filter = CropFilter { min_frac_annotated: Some(50.0), ..Default::default() };
        assert!(matches!(filter.keep(Path::new("/does/not/exist")), Err(Error::Config(_))));
    }

    #[test]
    fn empty_datasets_disappear_from_the_manifest() {
        let dir = tempfile::tempdir().unwrap();
        crop(dir.path(), "crop1");
        let group = dir.path().join("groundtruth.zarr");
        let yaml = format!(
            "datasets:\n  a:\n    crop_group: {g}\n    crops: [crop1]\n  b:\n    crop_group: {g}\n    crops: [crop1]\n    raw: /somewhere\n",
            g = group.display()
        );
        let manifest = Manifest::from_yaml(&yaml).unwrap();
        let filter = CropFilter { scale: Some(vec![4.0; 3]), ..Default::default() };
        assert_eq!(filter_manifest(&manifest, &filter).unwrap(), manifest);
        let filter = CropFilter { scale: Some(vec![2.0; 3]), ..Default::default() };
        assert!(filter_manifest(&manifest, &filter).unwrap().datasets.is_empty());
    }
}
