//! The data configuration YAML: datasets with their crop group, crops and optional raw volume.
//!
//! ```yaml
//! datasets:
//!   jrc_hela-2:
//!     crop_group: /nrs/cellmap/jrc_hela-2/groundtruth.zarr
//!     crops: [crop1, crop113]
//!     raw: /nrs/cellmap/jrc_hela-2/em/fibsem-uint8
//! ```
//!
//! Dataset order and keys this crate does not know about survive a load/save round trip.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};

const DATASETS: &str = "datasets";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetEntry {
    pub crop_group: PathBuf,
    #[serde(default)]
    pub crops: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<PathBuf>,
    #[serde(flatten)]
    pub extra: Mapping,
}

impl DatasetEntry {
    pub fn crop_path(&self, crop: &str) -> PathBuf { self.crop_group.join(crop) }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Manifest {
    pub datasets: Vec<(String, DatasetEntry)>,
    pub extra: Mapping,
}

/// One crop of one dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct CropRef {
    pub dataset: String,
    pub crop: String,
    pub path: PathBuf,
    pub raw: Option<PathBuf>,
}

impl CropRef {
    pub fn id(&self) -> String { format!("{}/{}", self.dataset, self.crop) }
}

impl Manifest {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut root: Mapping = serde_yaml::from_str(yaml)?;
        let datasets = root
            .remove(DATASETS)
            .ok_or_else(|| Error::Config("manifest has no `datasets` entry".to_string()))?;
        let datasets = match datasets {
            Value::Mapping(m) => m,
            Value::Null => Mapping::new(),
            _ => return Err(Error::Config("`datasets` has to be a mapping".to_string())),
        };
        let datasets = datasets
            .into_iter()
            .map(|(name, entry)| {
                let name = match name {
                    Value::String(s) => s,
                    other => serde_yaml::to_string(&other)?.trim().to_string(),
                };
                Ok((name, serde_yaml::from_value(entry)?))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { datasets, extra: root })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|_| Error::NotFound(path.to_path_buf()))?;
        Self::from_yaml(&yaml)
    }

    pub fn to_yaml(&self) -> Result<String> {
        let mut datasets = Mapping::new();
        for (name, entry) in &self.datasets {
            datasets.insert(Value::String(name.clone()), serde_yaml::to_value(entry)?);
        }
        let mut root = Mapping::new();
        root.insert(Value::String(DATASETS.to_string()), Value::Mapping(datasets));
        for (k, v) in &self.extra {
            root.insert(k.clone(), v.clone());
        }
        Ok(serde_yaml::to_string(&root)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_yaml()?)?;
        Ok(())
    }

    pub fn dataset(&self, name: &str) -> Option<&DatasetEntry> {
        self.datasets.iter().find(|(n, _)| n == name).map(|(_, e)| e)
    }

    /// All crops in manifest order.
    pub fn crops(&self) -> Vec<CropRef> {
        self.datasets
            .iter()
            .flat_map(|(dataset, entry)| {
                entry.crops.iter().map(move |crop| CropRef {
                    dataset: dataset.clone(),
                    crop: crop.clone(),
                    path: entry.crop_path(crop),
                    raw: entry.raw.clone(),
                })
            })
            .collect()
    }

    /// Keeps the crops for which `keep` holds and drops datasets left without crops.
    pub fn retain_crops(&mut self, mut keep: impl FnMut(&str, &DatasetEntry, &str) -> bool) {
        for (name, entry) in self.datasets.iter_mut() {
            let snapshot = entry.clone();
            entry.crops.retain(|crop| keep(name, &snapshot, crop));
        }
        self.datasets.retain(|(_, entry)| !entry.crops.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
datasets:
  zeta:
    crop_group: /data/zeta/groundtruth.zarr
    crops: [crop7, crop3]
    raw: /data/zeta/em/fibsem-uint8
    contrast: [0, 255]
  alpha:
    crop_group: /data/alpha/groundtruth.zarr
    crops:
      - crop1
version: 2
"#;

    #[test]
    fn order_and_unknown_keys_survive() {
        let manifest = Manifest::from_yaml(YAML).unwrap();
        let names: Vec<_> = manifest.datasets.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);

        let again = Manifest::from_yaml(&manifest.to_yaml().unwrap()).unwrap();
        assert_eq!(again, manifest);
        let zeta = again.dataset("zeta").unwrap();
        assert_eq!(zeta.raw.as_deref(), Some(Path::new("/data/zeta/em/fibsem-uint8")));
        assert!(zeta.extra.contains_key("contrast"));
        assert!(again.extra.contains_key("version"));
    }

    #[test]
    fn crops_in_manifest_order() {
        let manifest = Manifest::from_yaml(YAML).unwrap();
        let ids: Vec<_> = manifest.crops().iter().map(CropRef::id).collect();
        assert_eq!(ids, vec!["zeta/crop7", "zeta/crop3", "alpha/crop1"]);
        assert_eq!(manifest.crops()[2].path, PathBuf::from("/data/alpha/groundtruth.zarr/crop1"));
    }

    #[test]
    fn empty_datasets_are_dropped() {
        let mut manifest = Manifest::from_yaml(YAML).unwrap();
        manifest.retain_crops(|_, _, crop| crop != "crop1");
        assert_eq!(manifest.datasets.len(), 1);
        assert_eq!(manifest.datasets[0].1.crops, vec!["crop7", "crop3"]);
    }

    #[test]
    fn missing_datasets_is_a_config_error() {
        assert!(matches!(Manifest::from_yaml("foo: 1"), Err(Error::Config(_))));
    }
}
