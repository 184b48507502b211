use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use dicom_study_volumes::{AssemblerConfig, Pipeline};
use log::info;

/// Reassemble per-slice DICOM studies into NIfTI volumes and label masks.
#[derive(Parser, Debug)]
#[command(author, about, version, long_about)]
struct Args {
    /// JSON file with an `AssemblerConfig`; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Series index (.parquet, .csv or .json)
    #[arg(short, long)]
    series: Option<PathBuf>,

    /// Derived segmentation index (.parquet, .csv or .json)
    #[arg(long)]
    segments: Option<PathBuf>,

    /// Root of the patient/study/series slice tree
    #[arg(short, long)]
    image_dir: Option<PathBuf>,

    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    #[arg(short, long)]
    mask_dir: Option<PathBuf>,

    /// Export every diffusion strength instead of the largest one
    #[arg(long)]
    all_strengths: bool,

    /// Merge into an existing anomaly ledger instead of resetting it
    #[arg(long)]
    keep_ledger: bool,

    /// Process studies in parallel
    #[arg(long)]
    parallel: bool,
}

impl Args {
    fn into_config(self) -> anyhow::Result<AssemblerConfig> {
        let mut config = match &self.config {
            Some(path) => AssemblerConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => AssemblerConfig::default(),
        };
        if let Some(series) = self.series {
            config.series_index = Some(series);
        }
        if let Some(segments) = self.segments {
            config.segmentation_index = Some(segments);
        }
        if let Some(image_dir) = self.image_dir {
            config.images_dir = image_dir;
        }
        if let Some(output_dir) = self.output_dir {
            config.output_dir = output_dir;
        }
        if let Some(mask_dir) = self.mask_dir {
            config.mask_dir = mask_dir;
        }
        if self.all_strengths {
            config.keep_max_strength = false;
        }
        if self.keep_ledger {
            config.reset_ledger = false;
        }
        if self.parallel {
            config.parallel_studies = true;
        }
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config()?;
    let pipeline = Pipeline::from_config(config).context("opening anomaly ledger")?;
    let summary = pipeline.run().context("reading indices")?;

    info!(
        "{} studies: {} volumes and {} masks written, {} missing",
        summary.studies, summary.volumes, summary.masks, summary.missing
    );
    Ok(())
}
