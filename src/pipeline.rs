//! Study → series → sub-series orchestration.
//!
//! Every study is processed independently: its series are classified,
//! placeholder strengths resolved, volumes assembled and written, and
//! segmentations registered onto their structural volume. Failures of a
//! file, series or study are logged to the ledger and the unit skipped.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use log::{info, warn};
use rayon::prelude::*;
use serde_json::json;
use thiserror::Error;

use crate::classifier::{ClassifiedSeries, SliceClassifier};
use crate::config::{AssemblerConfig, ConfigError};
use crate::context::{SeriesContext, StudyContext};
use crate::enums::{MaskKind, SequenceKind};
use crate::export::{SequencePolicy, write_mask, write_volume};
use crate::index::{IndexError, SegmentationIndex, SeriesIndex, SeriesRow, StudyEntry};
use crate::ledger::{AnomalyKind, AnomalyLedger, LedgerError};
use crate::record::{ExportRecord, MASK_SLOT, RecordEntry, StudyRecord};
use crate::resolver::StrengthResolver;
use crate::segmentation::registered_masks;
use crate::slice::{DicomFileReader, SliceReader, list_series_files};
use crate::strength::SubSeriesKey;
use crate::volume::Volume;
use crate::volume_loader::VolumeLoader;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Counts over one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub studies: usize,
    pub volumes: usize,
    pub masks: usize,
    pub missing: usize,
}

impl RunSummary {
    fn add(self, other: RunSummary) -> RunSummary {
        RunSummary {
            studies: self.studies + other.studies,
            volumes: self.volumes + other.volumes,
            masks: self.masks + other.masks,
            missing: self.missing + other.missing,
        }
    }

    fn of_study(study: &StudyRecord) -> RunSummary {
        let mut summary = RunSummary {
            studies: 1,
            ..RunSummary::default()
        };
        for (slot, entries) in study {
            for entry in entries.values() {
                match (entry.is_exported(), slot.as_str() == MASK_SLOT) {
                    (true, true) => summary.masks += 1,
                    (true, false) => summary.volumes += 1,
                    (false, _) => summary.missing += 1,
                }
            }
        }
        summary
    }
}

/// A structural volume kept around for segmentation registration.
struct StructuralVolume {
    series_uid: String,
    volume: Volume,
}

pub struct Pipeline<R = DicomFileReader> {
    config: AssemblerConfig,
    reader: R,
    ledger: AnomalyLedger,
    record: ExportRecord,
}

impl Pipeline<DicomFileReader> {
    /// Pipeline reading DICOM files, with the ledger and record at the
    /// configured paths.
    pub fn from_config(config: AssemblerConfig) -> Result<Self, PipelineError> {
        let ledger = AnomalyLedger::open(&config.ledger_path, config.reset_ledger)?;
        let record = ExportRecord::new(&config.record_path);
        Ok(Self::new(config, DicomFileReader, ledger, record))
    }
}

impl<R: SliceReader> Pipeline<R> {
    pub fn new(config: AssemblerConfig, reader: R, ledger: AnomalyLedger, record: ExportRecord) -> Self {
        Self {
            config,
            reader,
            ledger,
            record,
        }
    }

    pub fn ledger(&self) -> &AnomalyLedger {
        &self.ledger
    }

    pub fn record(&self) -> &ExportRecord {
        &self.record
    }

    /// Loads the configured indices and processes every study.
    pub fn run(&self) -> Result<RunSummary, PipelineError> {
        let series_index = SeriesIndex::load(
            self.config.series_index_path()?,
            &self.config.extra_columns,
            &self.ledger,
        )?;
        let segmentation_index = match &self.config.segmentation_index {
            Some(path) => SegmentationIndex::load(path, &self.ledger)?,
            None => SegmentationIndex::default(),
        };
        Ok(self.process(&series_index, &segmentation_index))
    }

    /// Processes every study of `series_index`, in parallel when configured.
    pub fn process(&self, series_index: &SeriesIndex, segmentation_index: &SegmentationIndex) -> RunSummary {
        let studies = series_index.studies();
        info!("processing {} studies", studies.len());

        let summary = if self.config.parallel_studies {
            studies
                .par_iter()
                .map(|study| RunSummary::of_study(&self.process_study(study, segmentation_index)))
                .reduce(RunSummary::default, RunSummary::add)
        } else {
            studies
                .iter()
                .map(|study| RunSummary::of_study(&self.process_study(study, segmentation_index)))
                .fold(RunSummary::default(), RunSummary::add)
        };

        info!(
            "done: {} studies, {} volumes, {} masks, {} missing",
            summary.studies, summary.volumes, summary.masks, summary.missing
        );
        summary
    }

    /// Assembles and writes everything of one study, then persists its
    /// record.
    pub fn process_study(&self, study: &StudyEntry, segmentation_index: &SegmentationIndex) -> StudyRecord {
        let context = &study.context;
        info!("{context}: {} series", study.series.len());

        let mut record = StudyRecord::new();
        let mut structural = Vec::new();

        for row in &study.series {
            let series_context = context.series(&row.series_uid);
            let Some(sequence) = row.sequence() else {
                self.ledger.record(
                    AnomalyKind::MissingSequenceLabel,
                    series_context.key(),
                    json!({ "user_series_type": row.sequence_label, "heuristic": row.heuristic_label }),
                );
                continue;
            };
            let slot = self.claim_slot(&series_context, &sequence, &record);
            let entries = self.process_series(&series_context, row, &sequence, &slot, &mut structural);
            record.insert(slot, entries);
        }

        for structural in &structural {
            self.register_segmentation(context, structural, segmentation_index, &mut record);
        }

        if let Err(err) = self.record.insert_study(context, record.clone()) {
            self.ledger
                .record(AnomalyKind::RecordNotWritten, context.key(), err.to_string());
        }
        info!("{context}: finished");
        record
    }

    /// `LABEL`, or `LABEL-1`, `LABEL-2`, ... when the study already has a
    /// series under that label.
    fn claim_slot(&self, context: &SeriesContext, sequence: &SequenceKind, record: &StudyRecord) -> String {
        let label = sequence.label();
        if !record.contains_key(label) {
            return label.to_string();
        }
        let slot = (1..)
            .map(|n| format!("{label}-{n}"))
            .find(|slot| !record.contains_key(slot))
            .unwrap_or_else(|| label.to_string());
        self.ledger.record(
            AnomalyKind::DuplicateSequenceLabel,
            context.key(),
            json!({ "label": label, "slot": slot }),
        );
        slot
    }

    fn process_series(
        &self,
        context: &SeriesContext,
        row: &SeriesRow,
        sequence: &SequenceKind,
        slot: &str,
        structural: &mut Vec<StructuralVolume>,
    ) -> BTreeMap<String, RecordEntry> {
        let mut entries = BTreeMap::new();
        let missing_series = |kind| {
            let mut entry = RecordEntry::missing(&context.series_uid, kind);
            entry.metadata = row.metadata.clone();
            BTreeMap::from([(SubSeriesKey::NOT_APPLICABLE.to_string(), entry)])
        };

        let dir = self.series_dir(context);
        let paths = match list_series_files(&dir) {
            Ok(paths) if !paths.is_empty() => paths,
            Ok(_) => {
                self.ledger.record(
                    AnomalyKind::FileNotFound,
                    dir.display().to_string(),
                    json!({ "series_uid": context.series_uid, "reason": "no files" }),
                );
                return missing_series(AnomalyKind::FileNotFound);
            }
            Err(err) => {
                self.ledger.record(
                    AnomalyKind::FileNotFound,
                    dir.display().to_string(),
                    json!({ "series_uid": context.series_uid, "reason": err.to_string() }),
                );
                return missing_series(AnomalyKind::FileNotFound);
            }
        };

        let classified = SliceClassifier::classify(
            context,
            sequence,
            &paths,
            row.diffusion_index.as_deref(),
            &self.reader,
            &self.ledger,
        );
        let resolution = StrengthResolver::resolve(&classified, &self.reader, &self.ledger);
        let tie_break = resolution.as_ref().and_then(|r| r.tie_break);
        let classified = match resolution {
            Some(resolution) => StrengthResolver::apply(classified, &resolution),
            None => classified,
        };

        let policy = SequencePolicy::for_sequence(sequence, &self.config);
        let keys = policy.keys_to_export(&classified, tie_break, &self.ledger);
        if keys.is_empty() {
            self.ledger.record(
                AnomalyKind::VolumeNotAssembled,
                context.key(),
                json!({ "files": paths.len(), "rejected": classified.rejected.len() }),
            );
            return missing_series(AnomalyKind::VolumeNotAssembled);
        }

        for key in keys {
            let (entry, volume) = self.export_sub_series(context, &classified, &policy, slot, key, row);
            if let (Some(volume), SequenceKind::Structural) = (volume, sequence) {
                structural.push(StructuralVolume {
                    series_uid: context.series_uid.clone(),
                    volume,
                });
            }
            entries.insert(key.to_string(), entry);
        }
        entries
    }

    /// Assembles, normalizes and writes one sub-series.
    fn export_sub_series(
        &self,
        context: &SeriesContext,
        series: &ClassifiedSeries,
        policy: &SequencePolicy,
        slot: &str,
        key: SubSeriesKey,
        row: &SeriesRow,
    ) -> (RecordEntry, Option<Volume>) {
        let describe = |mut entry: RecordEntry| {
            entry.metadata = row.metadata.clone();
            entry.plane = Some(series.plane.as_str().to_string());
            entry.planes_seen = series.planes_seen.iter().map(|p| p.as_str().to_string()).collect();
            entry.strengths = series.decoded_strengths.clone();
            entry.raw_strengths = series.raw_strengths.clone();
            entry.rescale_type = series.rescale_type.clone();
            entry
        };

        let Some(sub_series) = series.get(&key) else {
            return (describe(RecordEntry::missing(&context.series_uid, AnomalyKind::VolumeNotAssembled)), None);
        };

        let mut volume = match VolumeLoader::load_sub_series(sub_series, series.plane, &self.reader) {
            Ok(volume) => volume,
            Err(err) => {
                self.ledger.record(
                    AnomalyKind::VolumeNotAssembled,
                    format!("{}_{key}", context.key()),
                    err.to_string(),
                );
                return (describe(RecordEntry::missing(&context.series_uid, AnomalyKind::VolumeNotAssembled)), None);
            }
        };
        policy.prepare(&mut volume, series.rescale_type.as_deref(), context, &self.ledger);

        let path = self
            .study_output_dir(&context.study)
            .join(policy.file_name(slot, &key));
        let mut entry = match write_volume(&path, &volume) {
            Ok(()) => describe(RecordEntry::exported(&context.series_uid, path)),
            Err(err) => {
                self.ledger.record(
                    AnomalyKind::VolumeNotWritten,
                    format!("{}_{key}", context.key()),
                    err.to_string(),
                );
                describe(RecordEntry::missing(&context.series_uid, AnomalyKind::VolumeNotWritten))
            }
        };
        let (depth, height, width) = volume.dim();
        entry.shape = Some([depth, height, width]);
        entry.slices = depth;
        (entry, Some(volume))
    }

    fn register_segmentation(
        &self,
        study: &StudyContext,
        structural: &StructuralVolume,
        segmentation_index: &SegmentationIndex,
        record: &mut StudyRecord,
    ) {
        let Some(derived_uid) = segmentation_index.derived_for(&study.study_uid, &structural.series_uid) else {
            return;
        };
        let context = study.series(derived_uid);
        let masks_record = record.entry(MASK_SLOT.to_string()).or_default();
        let mark_missing = |record: &mut BTreeMap<String, RecordEntry>, kind| {
            record.insert(derived_uid.to_string(), RecordEntry::missing(derived_uid, kind));
        };

        let dir = self.series_dir(&context);
        let Some(file) = list_series_files(&dir).ok().and_then(|files| files.into_iter().next()) else {
            self.ledger.record(
                AnomalyKind::SegmentationFileNotFound,
                context.key(),
                json!({ "dir": dir.display().to_string(), "source_series_uid": structural.series_uid }),
            );
            mark_missing(masks_record, AnomalyKind::SegmentationFileNotFound);
            return;
        };

        let object = match self.reader.read_segmentation(&file) {
            Ok(object) => object,
            Err(err) => {
                self.ledger.record(
                    AnomalyKind::UnreadableSegmentation,
                    file.display().to_string(),
                    json!({ "series_uid": derived_uid, "error": err.to_string() }),
                );
                mark_missing(masks_record, AnomalyKind::UnreadableSegmentation);
                return;
            }
        };

        let masks = match registered_masks(&object, &structural.volume, &context, &self.ledger) {
            Ok(masks) => masks,
            Err(kind) => {
                mark_missing(masks_record, kind);
                return;
            }
        };

        let mask_dir = self.config.mask_dir.join(&study.patient_id).join(&study.study_uid).join(derived_uid);
        let mut stems = BTreeSet::new();
        for mask in masks {
            let mut stem = mask.file_stem();
            if !stems.insert(stem.clone()) {
                stem = format!("{stem}_{}", mask.code);
                stems.insert(stem.clone());
            }
            let key = if masks_record.contains_key(&stem) {
                format!("{derived_uid}/{stem}")
            } else {
                stem.clone()
            };

            let mut entry = if mask.kind == MaskKind::AllZero {
                RecordEntry::missing(derived_uid, AnomalyKind::ZeroMaskFound)
            } else if let Err(err) = mask.ensure_matches(&structural.volume) {
                self.ledger
                    .record(AnomalyKind::MaskShapeMismatch, context.key(), err.to_string());
                RecordEntry::missing(derived_uid, AnomalyKind::MaskShapeMismatch)
            } else {
                let path = mask_dir.join(format!("{stem}.nii.gz"));
                match write_mask(&path, &mask.data, &mask.grid) {
                    Ok(()) => RecordEntry::exported(derived_uid, path),
                    Err(err) => {
                        self.ledger.record(
                            AnomalyKind::VolumeNotWritten,
                            format!("{}_{stem}", context.key()),
                            err.to_string(),
                        );
                        RecordEntry::missing(derived_uid, AnomalyKind::VolumeNotWritten)
                    }
                }
            };
            let (depth, height, width) = mask.dim();
            entry.shape = Some([depth, height, width]);
            entry.slices = depth;
            entry.mask_kind = Some(mask.kind);
            masks_record.insert(key, entry);
        }

        if masks_record.is_empty() {
            warn!("{context}: segmentation produced no labels");
        }
    }

    fn series_dir(&self, context: &SeriesContext) -> PathBuf {
        self.config
            .images_dir
            .join(context.patient_id())
            .join(context.study_uid())
            .join(&context.series_uid)
    }

    fn study_output_dir(&self, study: &StudyContext) -> PathBuf {
        self.config.output_dir.join(&study.patient_id).join(&study.study_uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    use ndarray::Array3;

    use crate::index::{Record, Table};
    use crate::record::ExportStatus;
    use crate::segmentation::{FrameReference, SegmentationObject};
    use crate::test_support::{COLUMNS, MemoryReader, ROWS};

    struct Fixture {
        dir: tempfile::TempDir,
        reader: MemoryReader,
        rows: Vec<Record>,
        segmentation_rows: Vec<Record>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                reader: MemoryReader::default(),
                rows: Vec::new(),
                segmentation_rows: Vec::new(),
            }
        }

        /// Creates an empty file under `images/p1/<study>/<series>/`.
        fn file(&self, study: &str, series: &str, name: &str) -> PathBuf {
            let dir = self.dir.path().join("images").join("p1").join(study).join(series);
            fs::create_dir_all(&dir).unwrap();
            let path = dir.join(name);
            fs::write(&path, b"").unwrap();
            path
        }

        fn series(&mut self, study: &str, series: &str, label: Option<&str>) {
            let mut row = Record::from([
                ("patient_id".to_string(), "p1".to_string()),
                ("study_uid".to_string(), study.to_string()),
                ("series_uid".to_string(), series.to_string()),
            ]);
            if let Some(label) = label {
                row.insert("user_series_type".into(), label.into());
            }
            self.rows.push(row);
        }

        fn derived(&mut self, study: &str, source: &str, derived: &str) {
            self.segmentation_rows.push(Record::from([
                ("source_series_uid".to_string(), source.to_string()),
                ("study_uid".to_string(), study.to_string()),
                ("derived_series_uid".to_string(), derived.to_string()),
            ]));
        }

        fn config(&self) -> AssemblerConfig {
            let root = self.dir.path();
            AssemblerConfig {
                images_dir: root.join("images"),
                output_dir: root.join("nii"),
                mask_dir: root.join("seg"),
                record_path: root.join("nifti_files.json"),
                ..AssemblerConfig::default()
            }
        }

        fn run(&self, config: AssemblerConfig) -> (Pipeline<MemoryReader>, RunSummary) {
            let pipeline = Pipeline::new(
                config,
                self.reader.clone(),
                AnomalyLedger::in_memory(),
                ExportRecord::in_memory(),
            );
            let index =
                SeriesIndex::from_table(Table::from_records(self.rows.clone()), &[], pipeline.ledger()).unwrap();
            let segmentations = SegmentationIndex::from_table(
                Table::from_records(self.segmentation_rows.clone()),
                pipeline.ledger(),
            )
            .unwrap();
            let summary = pipeline.process(&index, &segmentations);
            (pipeline, summary)
        }
    }

    fn uid(path: &Path) -> String {
        format!("uid-{}", path.display())
    }

    fn segmentation(path: &Path, references: &[String]) -> SegmentationObject {
        SegmentationObject::new(
            path,
            BTreeMap::from([(1, "tumor".to_string())]),
            references
                .iter()
                .map(|uid| FrameReference {
                    sop_instance_uid: Some(uid.clone()),
                    segment_number: Some(1),
                })
                .collect(),
            Array3::from_elem((references.len(), ROWS, COLUMNS), 1),
        )
    }

    #[test]
    fn assembles_a_full_study() {
        let mut fx = Fixture::new();

        let mut t2 = Vec::new();
        for (i, z) in [0.0, 3.0, 6.0].into_iter().enumerate() {
            let path = fx.file("st1", "t2", &format!("t2_{i}.dcm"));
            fx.reader.add_slice(&path, [0.0, 0.0, z], i as f32 + 1.0);
            t2.push(path);
        }
        let duplicate = fx.file("st1", "t2", "t2_dup.dcm");
        fx.reader.add_slice(&duplicate, [0.0, 0.0, 3.0], 2.0);

        for (i, z) in [0.0, 3.0].into_iter().enumerate() {
            let path = fx.file("st1", "adc", &format!("adc_{i}.dcm"));
            fx.reader.add_slice(&path, [0.0, 0.0, z], 0.002);
        }

        // Two placeholder strengths and a decoded one at every position.
        for (i, z) in [0.0, 3.0, 6.0].into_iter().enumerate() {
            let b800 = fx.file("st1", "dwi", &format!("b800_{i}.dcm"));
            fx.reader.add_diffusion_slice(&b800, [0.0, 0.0, z], 5.0, Some(800));
            let low = fx.file("st1", "dwi", &format!("ua_{i}.dcm"));
            fx.reader.add_diffusion_slice(&low, [0.0, 0.0, z], 40.0, None);
            let high = fx.file("st1", "dwi", &format!("ub_{i}.dcm"));
            fx.reader.add_diffusion_slice(&high, [0.0, 0.0, z], 90.0, None);
        }

        let seg = fx.file("st1", "seg1", "seg.dcm");
        let object = segmentation(&seg, &[uid(&t2[0]), uid(&t2[2])]);
        fx.reader.add_segmentation(&seg, object);

        fx.series("st1", "t2", Some("T2AX"));
        fx.series("st1", "adc", Some("ADC"));
        fx.series("st1", "dwi", Some("DWI"));
        fx.series("st1", "gone", Some("DCE"));
        fx.series("st1", "nolabel", None);
        fx.derived("st1", "t2", "seg1");

        let config = fx.config();
        let (pipeline, summary) = fx.run(config.clone());
        let ledger = pipeline.ledger();
        let record = pipeline.record().study(&StudyContext::new("p1", "st1")).unwrap();

        let t2_entry = &record["T2"]["N/A"];
        assert!(t2_entry.is_exported());
        assert_eq!(t2_entry.shape, Some([3, ROWS, COLUMNS]));
        assert!(ledger.contains(AnomalyKind::DuplicateDetected, &duplicate.display().to_string()));
        assert!(config.output_dir.join("p1/st1/T2.nii.gz").is_file());

        assert!(record["ADC"]["N/A"].is_exported());
        assert!(ledger.contains(AnomalyKind::AdcRescaleTypeMicro, "p1_st1_adc"));

        assert_eq!(record["DWI"].keys().collect::<Vec<_>>(), ["800"]);
        assert!(config.output_dir.join("p1/st1/DWI_800.nii.gz").is_file());
        assert!(ledger.contains(AnomalyKind::UnknownBValueReordered, "p1_st1_dwi"));

        assert_eq!(
            record["DCE"]["N/A"].status,
            ExportStatus::Missing {
                reason: "FileNotFound".into()
            }
        );
        assert!(ledger.contains(AnomalyKind::MissingSequenceLabel, "p1_st1_nolabel"));

        let mask = &record[MASK_SLOT]["tumor"];
        assert!(mask.is_exported());
        assert_eq!(mask.mask_kind, Some(MaskKind::Binary));
        assert_eq!(mask.shape, t2_entry.shape);
        assert!(config.mask_dir.join("p1/st1/seg1/tumor.nii.gz").is_file());

        assert_eq!(
            summary,
            RunSummary {
                studies: 1,
                volumes: 3,
                masks: 1,
                missing: 1,
            }
        );
    }

    #[test]
    fn repeated_labels_get_numbered_slots() {
        let mut fx = Fixture::new();
        for series in ["t2a", "t2b"] {
            let path = fx.file("st1", series, "1.dcm");
            fx.reader.add_slice(&path, [0.0, 0.0, 0.0], 1.0);
            fx.series("st1", series, Some("T2"));
        }

        let config = fx.config();
        let (pipeline, _) = fx.run(config.clone());
        let record = pipeline.record().study(&StudyContext::new("p1", "st1")).unwrap();

        assert_eq!(record.keys().collect::<Vec<_>>(), ["T2", "T2-1"]);
        assert_eq!(record["T2-1"]["N/A"].series_uid, "t2b");
        assert!(pipeline.ledger().contains(AnomalyKind::DuplicateSequenceLabel, "p1_st1_t2b"));
        assert!(config.output_dir.join("p1/st1/T2-1.nii.gz").is_file());
    }

    #[test]
    fn unresolvable_segmentation_is_recorded_missing() {
        let mut fx = Fixture::new();
        let mut t2 = Vec::new();
        for (i, z) in [0.0, 1.0].into_iter().enumerate() {
            let path = fx.file("st1", "t2", &format!("{i}.dcm"));
            fx.reader.add_slice(&path, [0.0, 0.0, z], 1.0);
            t2.push(path);
        }
        let seg = fx.file("st1", "seg1", "seg.dcm");
        let object = segmentation(&seg, &[uid(&t2[0]), "uid-nowhere".to_string()]);
        fx.reader.add_segmentation(&seg, object);
        fx.series("st1", "t2", Some("T2"));
        fx.derived("st1", "t2", "seg1");

        let config = fx.config();
        let (pipeline, summary) = fx.run(config.clone());
        let record = pipeline.record().study(&StudyContext::new("p1", "st1")).unwrap();

        assert_eq!(
            record[MASK_SLOT]["seg1"].status,
            ExportStatus::Missing {
                reason: "SegmentationSliceReferenceNotFound".into()
            }
        );
        assert!(!config.mask_dir.join("p1/st1/seg1").exists());
        assert_eq!(summary.masks, 0);
        assert_eq!(summary.volumes, 1);
    }

    #[test]
    fn missing_segmentation_file_is_logged() {
        let mut fx = Fixture::new();
        let path = fx.file("st1", "t2", "1.dcm");
        fx.reader.add_slice(&path, [0.0, 0.0, 0.0], 1.0);
        fx.series("st1", "t2", Some("T2"));
        fx.derived("st1", "t2", "seg1");

        let (pipeline, _) = fx.run(fx.config());
        assert!(pipeline.ledger().contains(AnomalyKind::SegmentationFileNotFound, "p1_st1_seg1"));
    }

    #[test]
    fn parallel_and_sequential_runs_agree() {
        let mut fx = Fixture::new();
        for study in ["st1", "st2"] {
            for (i, z) in [0.0, 2.0].into_iter().enumerate() {
                for b in [50, 800] {
                    let path = fx.file(study, "dwi", &format!("b{b}_{i}.dcm"));
                    fx.reader.add_diffusion_slice(&path, [0.0, 0.0, z], 1000.0 / b as f32, Some(b));
                }
            }
            fx.series(study, "dwi", Some("DWI"));
        }

        let mut config = fx.config();
        config.keep_max_strength = false;
        let (sequential, first) = fx.run(config.clone());
        config.parallel_studies = true;
        let (parallel, second) = fx.run(config);

        assert_eq!(first, second);
        assert_eq!(first.volumes, 4);
        assert_eq!(
            sequential.record().to_json().unwrap(),
            parallel.record().to_json().unwrap()
        );
        assert_eq!(sequential.ledger().snapshot(), parallel.ledger().snapshot());

        let record = parallel.record().study(&StudyContext::new("p1", "st2")).unwrap();
        assert_eq!(record["DWI"].keys().collect::<Vec<_>>(), ["50", "800"]);
    }
}
