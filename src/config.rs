use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::enums::StrengthExport;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("No series index configured")]
    MissingSeriesIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblerConfig {
    /// Root of the `patient/study/series/*` slice tree.
    pub images_dir: PathBuf,
    pub series_index: Option<PathBuf>,
    pub segmentation_index: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub mask_dir: PathBuf,
    pub record_path: PathBuf,
    pub ledger_path: PathBuf,
    pub reset_ledger: bool,
    /// Export one representative diffusion sub-series per series instead
    /// of all of them.
    pub keep_max_strength: bool,
    /// ADC maps whose maximum stays below this are taken to be in
    /// 10^-3 mm^2/s and scaled by 1000.
    pub adc_threshold: f32,
    pub extra_columns: Vec<String>,
    pub parallel_studies: bool,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            images_dir: PathBuf::from("."),
            series_index: None,
            segmentation_index: None,
            output_dir: PathBuf::from("nii_files"),
            mask_dir: PathBuf::from("seg_files"),
            record_path: PathBuf::from("nifti_files.json"),
            ledger_path: PathBuf::from("issues/image_loader_issues.json"),
            reset_ledger: true,
            keep_max_strength: true,
            adc_threshold: 10.0,
            extra_columns: Vec::new(),
            parallel_studies: false,
        }
    }
}

impl AssemblerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn strength_export(&self) -> StrengthExport {
        if self.keep_max_strength {
            StrengthExport::Representative
        } else {
            StrengthExport::All
        }
    }

    pub fn series_index_path(&self) -> Result<&Path, ConfigError> {
        self.series_index
            .as_deref()
            .ok_or(ConfigError::MissingSeriesIndex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");
        fs::write(
            &path,
            r#"{ "series_index": "series.csv", "keep_max_strength": false }"#,
        )
        .unwrap();

        let config = AssemblerConfig::from_file(&path).unwrap();
        assert_eq!(config.series_index_path().unwrap(), Path::new("series.csv"));
        assert_eq!(config.strength_export(), StrengthExport::All);
        assert_eq!(config.output_dir, PathBuf::from("nii_files"));
        assert_eq!(config.adc_threshold, 10.0);
    }

    #[test]
    fn missing_series_index_is_an_error() {
        let config = AssemblerConfig::default();
        assert!(matches!(
            config.series_index_path(),
            Err(ConfigError::MissingSeriesIndex)
        ));
    }
}
