use super::BatchOptions;
use crate::error::{Error, Result};
use crate::manifest::{DatasetEntry, Manifest};
use crate::multiscale::{LABELS, RAW};
use crate::pool::BatchReport;
use crate::reader::read_any;
use crate::storage;
use log::error;
use std::path::Path;

/// Which scale levels to open besides checking that paths exist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckLevels {
    pub labels: Vec<String>,
    pub raw: Vec<String>,
}

fn exists(path: &Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(Error::NotFound(path.to_path_buf()))
    }
}

/// The crop exists and every listed level of every class opens.
pub fn check_crop(entry: &DatasetEntry, crop: &str, levels: &[String]) -> Result<()> {
    let crop_path = entry.crop_path(crop);
    exists(&crop_path)?;
    let labels_path = if crop_path.join(LABELS).exists() { crop_path.join(LABELS) } else { crop_path };
    let (backend, node) = storage::open(&labels_path)?;
    for label in backend.cellmap(&node)?.class_names()? {
        for level in levels {
            read_any(&labels_path.join(label).join(level))?;
        }
    }
    Ok(())
}

/// The crop has a readable `raw` group with the listed levels.
pub fn check_crop_raw(entry: &DatasetEntry, crop: &str, levels: &[String]) -> Result<()> {
    let raw_path = entry.crop_path(crop).join(RAW);
    read_any(&raw_path)?;
    for level in levels {
        read_any(&raw_path.join(level))?;
    }
    Ok(())
}

/// Checks one dataset. Problems with single crops are logged and counted, the dataset fails if
/// any crop did.
pub fn check_dataset(name: &str, entry: &DatasetEntry, levels: &CheckLevels) -> Result<()> {
    if let Some(raw) = &entry.raw {
        exists(raw)?;
        for level in &levels.raw {
            read_any(&raw.join(level))?;
        }
    }
    exists(&entry.crop_group)?;
    let mut failed = 0;
    for crop in &entry.crops {
        let mut outcome = check_crop(entry, crop, &levels.labels);
        if outcome.is_ok() && entry.raw.is_none() {
            outcome = check_crop_raw(entry, crop, &levels.raw);
        }
        if let Err(e) = outcome {
            error!("{}, crop: {}", e, crop);
            failed += 1;
        }
    }
    if failed > 0 {
        return Err(Error::Storage(format!("{} of {} crops of {} failed the check", failed, entry.crops.len(), name)));
    }
    Ok(())
}

pub fn check_data_yaml(manifest: &Manifest, levels: &CheckLevels, options: &BatchOptions) -> Result<BatchReport> {
    let report = options.pool()?.run(
        "check-data-yaml",
        &manifest.datasets,
        |(name, _)| name.clone(),
        |(name, entry)| check_dataset(name, entry, levels),
    );
    report.log_summary("check-data-yaml");
    Ok(report)
}
