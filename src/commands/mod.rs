//! Batch entry points behind the `data-prep` subcommands. Each takes a loaded [`Manifest`] and
//! fans its crops (or datasets) out over a [`WorkerPool`].

pub mod add_raw;
pub mod check;
pub mod copy_crops;
pub mod correct_attrs;
pub mod filter;
pub mod h5_export;
pub mod pyramids;

use crate::error::Result;
use crate::manifest::{CropRef, Manifest};
use crate::pool::{BatchReport, WorkerPool};

/// How a batch is spread over threads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOptions {
    pub threads: Option<usize>,
    pub max_concurrency: Option<usize>,
    pub progress: bool,
}

impl BatchOptions {
    pub fn pool(&self) -> Result<WorkerPool> {
        Ok(WorkerPool::new(self.threads, self.max_concurrency)?.with_progress(self.progress))
    }
}

/// Runs `job` for every crop of the manifest.
pub fn for_each_crop<F>(manifest: &Manifest, options: &BatchOptions, what: &str, job: F) -> Result<BatchReport>
where
    F: Fn(&CropRef) -> Result<()> + Sync,
{
    let crops = manifest.crops();
    let report = options.pool()?.run(what, &crops, CropRef::id, job);
    report.log_summary(what);
    Ok(report)
}
