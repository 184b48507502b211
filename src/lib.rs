//! # DICOM study volumes
//!
//! This crate reassembles loose per-slice DICOM files of multi-series
//! studies into one 3D volume per sequence and writes them as NIfTI,
//! together with the label masks of any segmentation drawn on the
//! structural series.
//!
//! It builds on the dicom-rs ecosystem for reading slices and on `nifti`
//! for writing volumes. A run is driven by a series index (one row per
//! series with its sequence label) and optionally an index of derived
//! segmentation series. For every study:
//!  - slices are grouped per diffusion strength and duplicates dropped
//!  - diffusion sub-series without a readable strength are ordered by
//!    intensity
//!  - every exported sub-series is stacked along the normal of its
//!    dominant plane
//!  - ADC maps are brought to 10^-6 mm^2/s
//!  - segmentation frames are placed onto the structural volume by the
//!    SOP Instance UID they reference
//!
//! Nothing that goes wrong for a single file, series or study stops the
//! run. Every such decision is written to an anomaly ledger, and the
//! export record lists each expected output as exported or missing.
//!
//! Studies share no state apart from the ledger and the record, so they
//! can be processed on the rayon pool (`parallel_studies`).
//!
//! # Examples
//!
//! ## Running over a study tree
//!
//! Reads `series.csv`, assembles everything below `images/` and writes
//! volumes to `nii_files/<patient>/<study>/`.
//!
//! ```no_run
//! # use dicom_study_volumes::{AssemblerConfig, Pipeline};
//! # use std::path::PathBuf;
//! let config = AssemblerConfig {
//!     images_dir: PathBuf::from("images"),
//!     series_index: Some(PathBuf::from("series.csv")),
//!     ..AssemblerConfig::default()
//! };
//! let summary = Pipeline::from_config(config)
//!     .expect("should have opened the ledger")
//!     .run()
//!     .expect("should have read the series index");
//! println!("{} volumes written", summary.volumes);
//! ```
//!
//! ## Assembling a single series
//!
//! ```no_run
//! # use dicom_study_volumes::{AnomalyLedger, DicomFileReader, SliceClassifier, StudyContext, VolumeLoader};
//! # use dicom_study_volumes::enums::SequenceKind;
//! # use dicom_study_volumes::slice::list_series_files;
//! # use std::path::Path;
//! let context = StudyContext::new("patient", "study").series("series");
//! let paths = list_series_files(Path::new("images/patient/study/series"))
//!     .expect("should have listed the series directory");
//! let ledger = AnomalyLedger::in_memory();
//! let series = SliceClassifier::classify(&context, &SequenceKind::Structural, &paths, None, &DicomFileReader, &ledger);
//! let volume = VolumeLoader::load_sub_series(&series.sub_series[0], series.plane, &DicomFileReader)
//!     .expect("should have stacked the slices");
//! println!("{:?}", volume.dim());
//! ```

pub mod classifier;
pub mod config;
pub mod context;
pub mod enums;
pub mod export;
pub mod index;
pub mod ledger;
pub mod pipeline;
pub mod record;
pub mod resolver;
pub mod segmentation;
pub mod slice;
pub mod strength;
pub mod volume;
pub mod volume_loader;

#[cfg(test)]
mod test_support;

pub use classifier::SliceClassifier;
pub use config::AssemblerConfig;
pub use context::{SeriesContext, StudyContext};
pub use ledger::{AnomalyKind, AnomalyLedger};
pub use pipeline::{Pipeline, RunSummary};
pub use slice::{DicomFileReader, SliceReader};
pub use volume::Volume;
pub use volume_loader::VolumeLoader;
