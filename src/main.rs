#![warn(clippy::all, rust_2018_idioms)]

use anyhow::{Context, Result};
use cellmap_prep::commands::check::CheckLevels;
use cellmap_prep::commands::filter::CropFilter;
use cellmap_prep::commands::{add_raw, check, copy_crops, correct_attrs, filter, h5_export, pyramids, BatchOptions};
use cellmap_prep::manifest::Manifest;
use cellmap_prep::multiscale::DEFAULT_NUM_SCALES;
use cellmap_prep::pool::BatchReport;
use clap::{Parser, Subcommand};
use log::{log, Level, LevelFilter};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "data-prep")]
#[command(version, about = "Prepare CellMap crops for training", long_about = None)]
struct Cli {
    /// More output (-v info, -vv debug). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Worker threads, defaults to the number of CPUs
    #[arg(long, global = true, value_name = "N")]
    threads: Option<usize>,

    /// Run at most this many crops at once
    #[arg(long, global = true, value_name = "N")]
    max_concurrency: Option<usize>,

    /// Show a progress bar
    #[arg(long, global = true)]
    progress: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Copy s0 of every label of every crop into fresh zarr containers
    CopyCrops {
        #[arg(value_name = "YAML")]
        data_yaml: PathBuf,
        #[arg(value_name = "DIR")]
        destination: PathBuf,
    },
    /// Check that everything listed in the data configuration can be read
    CheckDataYaml {
        #[arg(value_name = "YAML")]
        data_yaml: PathBuf,
        /// Label scale levels that have to exist
        #[arg(long, value_name = "LEVEL", num_args = 1..)]
        label_scalelevels: Vec<String>,
        /// Raw scale levels that have to exist
        #[arg(long, value_name = "LEVEL", num_args = 1..)]
        raw_scalelevels: Vec<String>,
    },
    /// Add smoothly downsampled scale levels to every label
    MultiscaleLabels {
        #[arg(value_name = "YAML")]
        data_yaml: PathBuf,
        #[arg(long, default_value_t = DEFAULT_NUM_SCALES)]
        num_scales: usize,
    },
    /// Crop the dataset's raw data to the extent of each crop
    AddRaw {
        #[arg(value_name = "YAML")]
        data_yaml: PathBuf,
    },
    /// Add downsampled scale levels to the raw data of every crop
    MultiscaleRaw {
        #[arg(value_name = "YAML")]
        data_yaml: PathBuf,
        #[arg(long, default_value_t = DEFAULT_NUM_SCALES)]
        num_scales: usize,
    },
    /// Export every crop as an HDF5 file
    H5Export {
        #[arg(value_name = "YAML")]
        data_yaml: PathBuf,
        #[arg(value_name = "DIR")]
        destination: PathBuf,
    },
    /// Recompute the complement counts of every label level
    CorrectAttrs {
        #[arg(value_name = "YAML")]
        data_yaml: PathBuf,
    },
    /// Write a data configuration with only the crops that meet the given conditions
    FilterYaml {
        #[arg(value_name = "YAML")]
        data_yaml: PathBuf,
        #[arg(value_name = "OUT")]
        filtered_yaml: PathBuf,
        /// Labels need a scale level with exactly this scale
        #[arg(long, num_args = 3, value_names = ["Z", "Y", "X"])]
        scale: Option<Vec<f64>>,
        /// Minimum size of the labels at that scale
        #[arg(long, num_args = 3, value_names = ["Z", "Y", "X"])]
        min_size: Option<Vec<usize>>,
        /// Minimum fraction (not percent) of annotated voxels per label
        #[arg(long, value_name = "FRACTION")]
        min_frac_annotated: Option<f64>,
        /// Labels whose annotated fraction is checked
        #[arg(long, value_name = "LABEL", num_args = 1..)]
        labels: Vec<String>,
    },
}

/// Level of the closing summary, visible without `-v`.
const SUMMARY_LEVEL: Level = Level::Warn;

fn default_level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    }
}

fn init_logging(verbose: u8) {
    env_logger::Builder::new().filter_level(default_level(verbose)).parse_default_env().init();
}

fn load(path: &Path) -> Result<Manifest> {
    Manifest::load(path).with_context(|| format!("could not load data configuration {}", path.display()))
}

fn summary(report: &BatchReport) -> String {
    if report.is_success() {
        "all done".to_string()
    } else {
        format!("all done, {} of {} jobs failed", report.failed.len(), report.total())
    }
}

fn finish(report: BatchReport) { log!(SUMMARY_LEVEL, "{}", summary(&report)); }

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let options = BatchOptions { threads: cli.threads, max_concurrency: cli.max_concurrency, progress: cli.progress };

    let report = match cli.command {
        Command::CopyCrops { data_yaml, destination } => {
            copy_crops::copy_crops(&load(&data_yaml)?, &destination, &options)?
        }
        Command::CheckDataYaml { data_yaml, label_scalelevels, raw_scalelevels } => {
            let levels = CheckLevels { labels: label_scalelevels, raw: raw_scalelevels };
            check::check_data_yaml(&load(&data_yaml)?, &levels, &options)?
        }
        Command::MultiscaleLabels { data_yaml, num_scales } => {
            pyramids::multiscale_labels(&load(&data_yaml)?, num_scales, &options)?
        }
        Command::AddRaw { data_yaml } => add_raw::add_raw_main(&load(&data_yaml)?, &options)?,
        Command::MultiscaleRaw { data_yaml, num_scales } => {
            pyramids::multiscale_raw(&load(&data_yaml)?, num_scales, &options)?
        }
        Command::H5Export { data_yaml, destination } => {
            h5_export::h5_export(&load(&data_yaml)?, &destination, &options)?
        }
        Command::CorrectAttrs { data_yaml } => correct_attrs::correct_attrs(&load(&data_yaml)?, &options)?,
        Command::FilterYaml { data_yaml, filtered_yaml, scale, min_size, min_frac_annotated, labels } => {
            let crop_filter = CropFilter { scale, min_size, min_frac_annotated, labels };
            filter::filter_yaml(&load(&data_yaml)?, &filtered_yaml, &crop_filter)
                .with_context(|| format!("could not filter {}", data_yaml.display()))?;
            BatchReport::default()
        }
    };
    finish(report);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_shows_at_default_verbosity() {
        assert!(SUMMARY_LEVEL <= default_level(0));
        assert_eq!(summary(&BatchReport { succeeded: 2, failed: vec![] }), "all done");
        let report = BatchReport { succeeded: 1, failed: vec![("jrc_hela-2/crop0".into(), "missing".into())] };
        assert_eq!(summary(&report), "all done, 1 of 2 jobs failed");
    }

    #[test]
    fn cli_parses_global_options() {
        let cli = Cli::try_parse_from(["data-prep", "-v", "--threads", "4", "add-raw", "data.yaml"]).unwrap();
        assert_eq!(cli.verbose, 1);
        assert_eq!(cli.threads, Some(4));
        assert!(matches!(cli.command, Command::AddRaw { .. }));
    }
}
