//! Per-sequence export policy and NIfTI output.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use ndarray::Array3;
use nifti::writer::WriterOptions;
use nifti::NiftiHeader;
use serde_json::json;
use thiserror::Error;

use crate::classifier::ClassifiedSeries;
use crate::config::AssemblerConfig;
use crate::context::SeriesContext;
use crate::enums::{SequenceKind, StrengthExport};
use crate::ledger::{AnomalyKind, AnomalyLedger};
use crate::strength::SubSeriesKey;
use crate::volume::{Volume, VoxelGrid};

/// Rescale Type that marks an ADC map stored in 10^-3 mm^2/s.
pub const ADC_MICRO_UNIT: &str = "10^-3 mm^2/s";

/// Factor from 10^-3 mm^2/s to 10^-6 mm^2/s.
pub const ADC_SCALE: f32 = 1000.0;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("IO error writing {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("NIfTI error writing {path}: {source}")]
    Nifti {
        path: PathBuf,
        source: nifti::NiftiError,
    },
}

/// What happens to the volumes of one sequence slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SequencePolicy {
    /// Exported as assembled.
    AsIs,
    /// ADC map, normalized to 10^-6 mm^2/s.
    QuantitativeDiffusion { threshold: f32 },
    /// One file per exported strength.
    DiffusionWeighted(StrengthExport),
}

impl SequencePolicy {
    pub fn for_sequence(sequence: &SequenceKind, config: &AssemblerConfig) -> Self {
        match sequence {
            SequenceKind::Structural | SequenceKind::ContrastEnhanced | SequenceKind::Other(_) => {
                SequencePolicy::AsIs
            }
            SequenceKind::ApparentDiffusion => SequencePolicy::QuantitativeDiffusion {
                threshold: config.adc_threshold,
            },
            SequenceKind::DiffusionWeighted => {
                SequencePolicy::DiffusionWeighted(config.strength_export())
            }
        }
    }

    /// Sub-series of `series` that get a volume file, in export order.
    pub fn keys_to_export(
        &self,
        series: &ClassifiedSeries,
        tie_break: Option<SubSeriesKey>,
        ledger: &AnomalyLedger,
    ) -> Vec<SubSeriesKey> {
        match self {
            SequencePolicy::DiffusionWeighted(StrengthExport::Representative) => {
                select_representative(series, tie_break, ledger)
                    .into_iter()
                    .collect()
            }
            SequencePolicy::DiffusionWeighted(StrengthExport::All) => {
                let mut keys = non_empty_keys(series);
                keys.sort();
                keys
            }
            _ => non_empty_keys(series),
        }
    }

    /// `T2.nii.gz`, `ADC.nii.gz`, `DWI_800.nii.gz`, `DWI-1_Unknown-1.nii.gz`.
    pub fn file_name(&self, slot: &str, key: &SubSeriesKey) -> String {
        match self {
            SequencePolicy::DiffusionWeighted(_) => format!("{slot}_{key}.nii.gz"),
            _ => format!("{slot}.nii.gz"),
        }
    }

    /// Applies the sequence's unit policy in place.
    pub fn prepare(
        &self,
        volume: &mut Volume,
        rescale_type: Option<&str>,
        context: &SeriesContext,
        ledger: &AnomalyLedger,
    ) {
        if let SequencePolicy::QuantitativeDiffusion { threshold } = *self {
            normalize_adc(volume, rescale_type, threshold, context, ledger);
        }
    }
}

fn non_empty_keys(series: &ClassifiedSeries) -> Vec<SubSeriesKey> {
    series
        .sub_series
        .iter()
        .filter(|s| !s.is_empty())
        .map(|s| s.key)
        .collect()
}

/// Picks the one diffusion sub-series exported under the representative
/// policy.
///
/// A lone sub-series is used as is. When every key is a placeholder the
/// resolver's tie-break key wins, then the last key in encounter order.
/// Otherwise the largest decoded strength is taken; suffixed copies of a
/// strength are logged as `SameBValueFound`.
pub fn select_representative(
    series: &ClassifiedSeries,
    tie_break: Option<SubSeriesKey>,
    ledger: &AnomalyLedger,
) -> Option<SubSeriesKey> {
    let keys = non_empty_keys(series);
    if keys.len() <= 1 {
        return keys.first().copied();
    }

    if keys.iter().all(SubSeriesKey::is_unknown) {
        return tie_break
            .filter(|key| keys.contains(key))
            .or_else(|| keys.last().copied());
    }

    let suffixed: Vec<String> = keys
        .iter()
        .filter(|k| k.strength_value().is_some() && k.is_suffixed())
        .map(ToString::to_string)
        .collect();
    if !suffixed.is_empty() {
        ledger.record(
            AnomalyKind::SameBValueFound,
            series.context.key(),
            json!({ "keys": keys.iter().map(ToString::to_string).collect::<Vec<_>>(), "suffixed": suffixed }),
        );
    }

    keys.iter()
        .copied()
        .filter(|k| k.strength_value().is_some())
        .max_by_key(|k| (!k.is_suffixed(), k.strength_value(), std::cmp::Reverse(k.suffix)))
}

/// Scales an ADC map stored in 10^-3 mm^2/s by 1000.
///
/// The map is flagged when its Rescale Type says so or its maximum lies
/// below `threshold`; it is only scaled while its maximum does not exceed
/// `threshold`, so data already in 10^-6 mm^2/s is left alone. Returns
/// whether the data was scaled.
pub fn normalize_adc(
    volume: &mut Volume,
    rescale_type: Option<&str>,
    threshold: f32,
    context: &SeriesContext,
    ledger: &AnomalyLedger,
) -> bool {
    let tagged = rescale_type.is_some_and(|unit| unit.trim().eq_ignore_ascii_case(ADC_MICRO_UNIT));
    let max = volume.max_value();
    if !tagged && max >= threshold {
        return false;
    }

    let scaled = max <= threshold;
    if scaled {
        volume.scale(ADC_SCALE);
    }
    ledger.record(
        AnomalyKind::AdcRescaleTypeMicro,
        context.key(),
        json!({ "rescale_type": rescale_type, "max": max, "scaled": scaled }),
    );
    scaled
}

/// NIfTI-1 header carrying the grid's spacing and RAS affine.
pub fn nifti_header(grid: &VoxelGrid) -> NiftiHeader {
    let affine = grid.ras_affine();
    let row = |i: usize| affine[i].map(|v| v as f32);
    let mut header = NiftiHeader::default();
    header.pixdim[0] = 1.0;
    header.pixdim[1] = grid.spacing.0 as f32;
    header.pixdim[2] = grid.spacing.1 as f32;
    header.pixdim[3] = grid.spacing.2 as f32;
    header.srow_x = row(0);
    header.srow_y = row(1);
    header.srow_z = row(2);
    header.sform_code = 1;
    header.qform_code = 0;
    header
}

/// Creates parent directories and runs `write` with the grid's header.
fn write_with(
    path: &Path,
    grid: &VoxelGrid,
    write: impl FnOnce(&Path, &NiftiHeader) -> Result<(), nifti::NiftiError>,
) -> Result<(), ExportError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ExportError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }
    let header = nifti_header(grid);
    write(path, &header).map_err(|source| ExportError::Nifti {
        path: path.to_path_buf(),
        source,
    })?;
    info!("wrote {}", path.display());
    Ok(())
}

// NIfTI indexes voxels as (i, j, k) = (width, height, depth).

/// Writes one assembled volume as float32.
pub fn write_volume(path: &Path, volume: &Volume) -> Result<(), ExportError> {
    write_with(path, &volume.grid, |path, header| {
        WriterOptions::new(path)
            .reference_header(header)
            .write_nifti(&volume.data().view().reversed_axes())
    })
}

/// Writes a label mask as uint8 on its source volume's grid.
pub fn write_mask(path: &Path, data: &Array3<u8>, grid: &VoxelGrid) -> Result<(), ExportError> {
    write_with(path, grid, |path, header| {
        WriterOptions::new(path)
            .reference_header(header)
            .write_nifti(&data.view().reversed_axes())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{PlacedSlice, SubSeries};
    use crate::context::StudyContext;
    use crate::enums::Orientation;
    use crate::slice::SliceHeader;

    fn context() -> SeriesContext {
        StudyContext::new("p1", "st1").series("s1")
    }

    fn series(keys: &[SubSeriesKey]) -> ClassifiedSeries {
        let sub_series = keys
            .iter()
            .map(|key| {
                let mut sub = SubSeries::new(*key);
                sub.insert(PlacedSlice {
                    coordinate: 0.0,
                    header: SliceHeader::new(format!("{key}.dcm"), [0.0; 3]),
                })
                .unwrap();
                sub
            })
            .collect();
        ClassifiedSeries {
            context: context(),
            sequence: SequenceKind::DiffusionWeighted,
            plane: Orientation::Axial,
            planes_seen: vec![Orientation::Axial],
            sub_series,
            rescale_type: None,
            decoded_strengths: Vec::new(),
            raw_strengths: Vec::new(),
            rejected: Vec::new(),
        }
    }

    fn volume(values: Vec<f32>) -> Volume {
        let grid = VoxelGrid {
            dim: (1, 1, values.len()),
            spacing: (1.0, 1.0, 1.0),
            origin: [0.0; 3],
            direction: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        };
        let data = Array3::from_shape_vec((1, 1, values.len()), values).unwrap();
        Volume::new(data, grid, Orientation::Axial, Vec::new())
    }

    #[test]
    fn representative_prefers_largest_decoded_strength() {
        let series = series(&[
            SubSeriesKey::unknown(0),
            SubSeriesKey::strength(800),
            SubSeriesKey::strength(50),
            SubSeriesKey::unknown(1),
        ]);
        let ledger = AnomalyLedger::in_memory();
        assert_eq!(
            select_representative(&series, None, &ledger),
            Some(SubSeriesKey::strength(800))
        );
        assert!(ledger.snapshot().is_empty());
    }

    #[test]
    fn suffixed_strengths_are_logged_and_skipped() {
        let series = series(&[
            SubSeriesKey::strength(800),
            SubSeriesKey::strength(1400),
            SubSeriesKey::strength(1400).with_suffix(1),
        ]);
        let ledger = AnomalyLedger::in_memory();
        assert_eq!(
            select_representative(&series, None, &ledger),
            Some(SubSeriesKey::strength(1400))
        );
        assert!(ledger.contains(AnomalyKind::SameBValueFound, "p1_st1_s1"));
    }

    // The tie-break key taking precedence over the last key is carried over
    // from the reference behavior and has not been checked against known
    // strengths.
    #[test]
    fn all_placeholders_use_tie_break_then_last_key() {
        let series = series(&[
            SubSeriesKey::unknown(0),
            SubSeriesKey::unknown(1),
            SubSeriesKey::unknown(2),
        ]);
        let ledger = AnomalyLedger::in_memory();
        assert_eq!(
            select_representative(&series, Some(SubSeriesKey::unknown(0)), &ledger),
            Some(SubSeriesKey::unknown(0))
        );
        assert_eq!(
            select_representative(&series, None, &ledger),
            Some(SubSeriesKey::unknown(2))
        );
    }

    #[test]
    fn all_policy_exports_every_key_sorted() {
        let series = series(&[SubSeriesKey::unknown(0), SubSeriesKey::strength(800), SubSeriesKey::strength(50)]);
        let policy = SequencePolicy::DiffusionWeighted(StrengthExport::All);
        let ledger = AnomalyLedger::in_memory();
        assert_eq!(
            policy.keys_to_export(&series, None, &ledger),
            [SubSeriesKey::strength(50), SubSeriesKey::strength(800), SubSeriesKey::unknown(0)]
        );
        assert_eq!(policy.file_name("DWI", &SubSeriesKey::strength(800)), "DWI_800.nii.gz");
        assert_eq!(SequencePolicy::AsIs.file_name("T2-1", &SubSeriesKey::NOT_APPLICABLE), "T2-1.nii.gz");
    }

    #[test]
    fn adc_in_micro_units_is_scaled_once() {
        let ledger = AnomalyLedger::in_memory();
        let mut adc = volume(vec![0.0, 0.0015, 0.003]);
        assert!(normalize_adc(&mut adc, None, 10.0, &context(), &ledger));
        assert!((adc.max_value() - 3.0).abs() < 1e-4);
        assert!(ledger.contains(AnomalyKind::AdcRescaleTypeMicro, "p1_st1_s1"));

        let mut already = volume(vec![0.0, 1500.0, 3000.0]);
        let ledger = AnomalyLedger::in_memory();
        assert!(!normalize_adc(&mut already, None, 10.0, &context(), &ledger));
        assert_eq!(already.max_value(), 3000.0);
        assert!(ledger.snapshot().is_empty());
    }

    #[test]
    fn micro_tag_is_logged_but_large_values_kept() {
        let ledger = AnomalyLedger::in_memory();
        let mut adc = volume(vec![0.0, 2000.0]);
        assert!(!normalize_adc(&mut adc, Some("10^-3 mm^2/s"), 10.0, &context(), &ledger));
        assert_eq!(adc.max_value(), 2000.0);
        assert!(ledger.contains(AnomalyKind::AdcRescaleTypeMicro, "p1_st1_s1"));
    }

    #[test]
    fn header_carries_affine() {
        let grid = VoxelGrid {
            dim: (3, 4, 5),
            spacing: (0.5, 0.5, 3.0),
            origin: [10.0, 20.0, 30.0],
            direction: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        };
        let header = nifti_header(&grid);
        assert_eq!(header.sform_code, 1);
        assert_eq!(header.pixdim[3], 3.0);
        assert_eq!(header.srow_x, [-0.5, 0.0, 0.0, -10.0]);
        assert_eq!(header.srow_z, [0.0, 0.0, 3.0, 30.0]);
    }

    #[test]
    fn writes_compressed_volume_and_mask() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p1").join("st1").join("T2.nii.gz");
        let volume = volume(vec![1.0, 2.0, 3.0]);
        write_volume(&path, &volume).unwrap();
        assert!(fs::metadata(&path).unwrap().len() > 0);

        let mask_path = dir.path().join("seg").join("tumor.nii.gz");
        let mask = Array3::from_shape_vec((1, 1, 3), vec![0u8, 1, 1]).unwrap();
        write_mask(&mask_path, &mask, &volume.grid).unwrap();
        assert!(mask_path.is_file());
    }
}
