//! Tabular inputs: the series index (one row per series) and the
//! derived-segmentation relationship index.
//!
//! Both are read from `.parquet`, `.csv` (header row) or `.json`
//! (records-oriented array, the default `df.to_json(orient='records')`).
//! Cells are kept as text; empty cells and nulls are treated as absent, but
//! a column exists as soon as the file declares it.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};

use arrow::array::Array;
use arrow::util::display::array_value_to_string;
use log::info;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::context::StudyContext;
use crate::enums::SequenceKind;
use crate::ledger::{AnomalyKind, AnomalyLedger};

pub const PATIENT_ID: &str = "patient_id";
pub const STUDY_UID: &str = "study_uid";
pub const SERIES_UID: &str = "series_uid";
pub const SEQUENCE_LABEL: &str = "user_series_type";
pub const HEURISTIC_LABEL: &str = "catboost_series_type_heuristics";
pub const DIFFUSION_INDEX: &str = "diffusion_bvalue";

/// Columns every series index is expected to carry.
pub const DEFAULT_COLUMNS: [&str; 11] = [
    "provided_by",
    PATIENT_ID,
    STUDY_UID,
    SERIES_UID,
    SEQUENCE_LABEL,
    HEURISTIC_LABEL,
    "series_description",
    DIFFUSION_INDEX,
    "manufacturer",
    "manufacturer_model_name",
    "use_case_form",
];

const REQUIRED_COLUMNS: [&str; 4] = [PATIENT_ID, STUDY_UID, SERIES_UID, SEQUENCE_LABEL];

const SEGMENTATION_COLUMNS: [&str; 3] = ["source_series_uid", STUDY_UID, "derived_series_uid"];

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("CSV error in {path}: {source}")]
    Csv { path: PathBuf, source: csv::Error },

    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Parquet error in {path}: {source}")]
    Parquet {
        path: PathBuf,
        source: parquet::errors::ParquetError,
    },

    #[error("Arrow error in {path}: {source}")]
    Arrow {
        path: PathBuf,
        source: arrow::error::ArrowError,
    },

    #[error("{path}: expected a top-level array of records")]
    NotRecords { path: PathBuf },

    #[error("Unsupported index extension: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("Required column `{0}` is missing from the index")]
    MissingColumn(String),
}

pub type Record = BTreeMap<String, String>;

/// Records of an index file together with the columns it declares.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: BTreeSet<String>,
    pub records: Vec<Record>,
}

impl Table {
    /// Table whose columns are the keys seen in `records`.
    pub fn from_records(records: Vec<Record>) -> Self {
        let columns = records.iter().flat_map(|r| r.keys().cloned()).collect();
        Self { columns, records }
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.contains(column)
    }
}

/// Reads `.parquet`, `.csv` or `.json` records into text cells.
pub fn read_records(path: &Path) -> Result<Table, IndexError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "parquet" | "pq" => read_parquet(path),
        "csv" => read_csv(path),
        "json" => read_json(path),
        _ => Err(IndexError::UnsupportedFormat(path.to_path_buf())),
    }
}

fn read_parquet(path: &Path) -> Result<Table, IndexError> {
    let parquet_err = |source| IndexError::Parquet {
        path: path.to_path_buf(),
        source,
    };
    let arrow_err = |source| IndexError::Arrow {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(|source| IndexError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(parquet_err)?;
    let columns: Vec<String> = builder
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    let reader = builder.build().map_err(parquet_err)?;

    let mut records = Vec::new();
    for batch in reader {
        let batch = batch.map_err(arrow_err)?;
        for row in 0..batch.num_rows() {
            let mut record = Record::new();
            for (name, column) in columns.iter().zip(batch.columns()) {
                if column.is_null(row) {
                    continue;
                }
                let cell = array_value_to_string(column.as_ref(), row).map_err(arrow_err)?;
                let cell = cell.trim();
                if !cell.is_empty() {
                    record.insert(name.clone(), cell.to_string());
                }
            }
            records.push(record);
        }
    }
    Ok(Table {
        columns: columns.into_iter().collect(),
        records,
    })
}

fn read_csv(path: &Path) -> Result<Table, IndexError> {
    let csv_err = |source| IndexError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::Reader::from_path(path).map_err(csv_err)?;
    let headers: Vec<String> = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut records = Vec::new();
    for result in reader.records() {
        let row = result.map_err(csv_err)?;
        let record = headers
            .iter()
            .zip(row.iter())
            .filter(|(_, value)| !value.trim().is_empty())
            .map(|(header, value)| (header.clone(), value.trim().to_string()))
            .collect();
        records.push(record);
    }
    Ok(Table {
        columns: headers.into_iter().collect(),
        records,
    })
}

fn read_json(path: &Path) -> Result<Table, IndexError> {
    let text = std::fs::read_to_string(path).map_err(|source| IndexError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let root: JsonValue = serde_json::from_str(&text).map_err(|source| IndexError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let rows = root.as_array().ok_or_else(|| IndexError::NotRecords {
        path: path.to_path_buf(),
    })?;

    let objects: Vec<_> = rows.iter().filter_map(|row| row.as_object()).collect();
    let columns = objects.iter().flat_map(|obj| obj.keys().cloned()).collect();
    let records = objects
        .iter()
        .map(|obj| {
            obj.iter()
                .filter_map(|(key, value)| json_cell(value).map(|cell| (key.clone(), cell)))
                .collect()
        })
        .collect();
    Ok(Table { columns, records })
}

fn json_cell(value: &JsonValue) -> Option<String> {
    let cell = match value {
        JsonValue::Null => return None,
        JsonValue::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };
    (!cell.is_empty()).then_some(cell)
}

/// One series of the index.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesRow {
    pub patient_id: String,
    pub study_uid: String,
    pub series_uid: String,
    pub sequence_label: Option<String>,
    pub heuristic_label: Option<String>,
    pub diffusion_index: Option<String>,
    /// Default and selected extra columns, copied into the export record.
    pub metadata: BTreeMap<String, String>,
}

impl SeriesRow {
    /// The user label (with `T2AX` folded into `T2`), falling back to the
    /// heuristic label when the user label is empty.
    pub fn sequence(&self) -> Option<SequenceKind> {
        self.sequence_label
            .as_deref()
            .and_then(SequenceKind::from_label)
            .or_else(|| {
                self.heuristic_label
                    .as_deref()
                    .and_then(SequenceKind::from_label)
            })
    }
}

#[derive(Debug, Clone)]
pub struct StudyEntry {
    pub context: StudyContext,
    pub series: Vec<SeriesRow>,
}

#[derive(Debug, Clone, Default)]
pub struct SeriesIndex {
    rows: Vec<SeriesRow>,
}

impl SeriesIndex {
    pub fn load(
        path: &Path,
        extra_columns: &[String],
        ledger: &AnomalyLedger,
    ) -> Result<Self, IndexError> {
        let table = read_records(path)?;
        info!("read {} series rows from {}", table.records.len(), path.display());
        Self::from_table(table, extra_columns, ledger)
    }

    /// Builds the index from text records, keeping the default columns plus
    /// `extra_columns`. Absent columns are logged, absent identity columns
    /// are an error. Rows without an identity cell are logged and skipped.
    pub fn from_table(
        table: Table,
        extra_columns: &[String],
        ledger: &AnomalyLedger,
    ) -> Result<Self, IndexError> {
        if !table.records.is_empty()
            && let Some(missing) = REQUIRED_COLUMNS.iter().find(|c| !table.has_column(c))
        {
            return Err(IndexError::MissingColumn(missing.to_string()));
        }

        let mut selected: Vec<String> = Vec::new();
        for column in DEFAULT_COLUMNS {
            if table.has_column(column) {
                selected.push(column.to_string());
            } else {
                ledger.record(AnomalyKind::DefaultColumnMissing, column, "does not exist");
            }
        }
        for column in extra_columns {
            let column = column.trim();
            if DEFAULT_COLUMNS.contains(&column) {
                continue;
            }
            if table.has_column(column) {
                selected.push(column.to_string());
            } else {
                ledger.record(AnomalyKind::SelectedColumnMissing, column, "does not exist");
            }
        }

        let mut rows = Vec::with_capacity(table.records.len());
        for (number, mut record) in table.records.into_iter().enumerate() {
            let metadata = selected
                .iter()
                .filter_map(|c| record.get(c).map(|v| (c.clone(), v.clone())))
                .collect();
            let Some([patient_id, study_uid, series_uid]) =
                take_identity(&mut record, [PATIENT_ID, STUDY_UID, SERIES_UID], ("series", number), ledger)
            else {
                continue;
            };
            rows.push(SeriesRow {
                patient_id,
                study_uid,
                series_uid,
                sequence_label: record.remove(SEQUENCE_LABEL),
                heuristic_label: record.remove(HEURISTIC_LABEL),
                diffusion_index: record.remove(DIFFUSION_INDEX),
                metadata,
            });
        }

        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[SeriesRow] {
        &self.rows
    }

    /// Studies in order of first appearance, each with its series rows in
    /// index order.
    pub fn studies(&self) -> Vec<StudyEntry> {
        let mut studies: Vec<StudyEntry> = Vec::new();
        for row in &self.rows {
            let context = StudyContext::new(&row.patient_id, &row.study_uid);
            match studies.iter_mut().find(|s| s.context == context) {
                Some(study) => study.series.push(row.clone()),
                None => studies.push(StudyEntry {
                    context,
                    series: vec![row.clone()],
                }),
            }
        }
        studies
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentationRow {
    pub source_series_uid: String,
    pub study_uid: String,
    pub derived_series_uid: String,
}

#[derive(Debug, Clone, Default)]
pub struct SegmentationIndex {
    rows: Vec<SegmentationRow>,
}

impl SegmentationIndex {
    pub fn load(path: &Path, ledger: &AnomalyLedger) -> Result<Self, IndexError> {
        Self::from_table(read_records(path)?, ledger)
    }

    pub fn from_table(table: Table, ledger: &AnomalyLedger) -> Result<Self, IndexError> {
        if !table.records.is_empty()
            && let Some(missing) = SEGMENTATION_COLUMNS.iter().find(|c| !table.has_column(c))
        {
            return Err(IndexError::MissingColumn(missing.to_string()));
        }
        let rows = table
            .records
            .into_iter()
            .enumerate()
            .filter_map(|(number, mut record)| {
                let [source_series_uid, study_uid, derived_series_uid] =
                    take_identity(&mut record, SEGMENTATION_COLUMNS, ("segmentation", number), ledger)?;
                Some(SegmentationRow {
                    source_series_uid,
                    study_uid,
                    derived_series_uid,
                })
            })
            .collect();
        Ok(Self { rows })
    }

    /// Derived segmentation series of `source_series_uid`, first match wins.
    pub fn derived_for(&self, study_uid: &str, source_series_uid: &str) -> Option<&str> {
        self.rows
            .iter()
            .find(|row| row.study_uid == study_uid && row.source_series_uid == source_series_uid)
            .map(|row| row.derived_series_uid.as_str())
    }
}

/// Removes the identity cells of one row, logging `MissingIdentity` under
/// `<index> row <number>` when any of them is empty.
fn take_identity<const N: usize>(
    record: &mut Record,
    columns: [&str; N],
    (index, number): (&str, usize),
    ledger: &AnomalyLedger,
) -> Option<[String; N]> {
    let missing: Vec<&str> = columns
        .iter()
        .copied()
        .filter(|c| !record.contains_key(*c))
        .collect();
    if !missing.is_empty() {
        ledger.record(
            AnomalyKind::MissingIdentity,
            format!("{index} row {number}"),
            serde_json::json!({ "missing": missing, "row": record }),
        );
        return None;
    }
    Some(columns.map(|c| record.remove(c).unwrap_or_default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn csv_index_groups_studies_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "series.csv",
            "patient_id,study_uid,series_uid,user_series_type,catboost_series_type_heuristics,diffusion_bvalue,site\n\
             p1,st1,s1,T2AX,,,a\n\
             p1,st1,s2,,DWI,800,a\n\
             p2,st2,s3,ADC,,,b\n\
             p1,st1,s4,DCE,,,a\n",
        );
        let ledger = AnomalyLedger::in_memory();
        let index = SeriesIndex::load(&path, &["site".to_string(), "ghost".to_string()], &ledger)
            .unwrap();

        let studies = index.studies();
        assert_eq!(studies.len(), 2);
        assert_eq!(studies[0].context, StudyContext::new("p1", "st1"));
        let uids: Vec<_> = studies[0].series.iter().map(|s| s.series_uid.as_str()).collect();
        assert_eq!(uids, ["s1", "s2", "s4"]);

        assert_eq!(studies[0].series[0].sequence(), Some(SequenceKind::Structural));
        assert_eq!(studies[0].series[1].sequence(), Some(SequenceKind::DiffusionWeighted));
        assert_eq!(studies[0].series[1].diffusion_index.as_deref(), Some("800"));
        assert_eq!(studies[0].series[0].metadata["site"], "a");

        assert!(ledger.contains(AnomalyKind::SelectedColumnMissing, "ghost"));
        assert!(ledger.contains(AnomalyKind::DefaultColumnMissing, "manufacturer"));
        assert!(!ledger.contains(AnomalyKind::DefaultColumnMissing, "patient_id"));
    }

    #[test]
    fn json_records_and_missing_identity_column() {
        let dir = tempfile::tempdir().unwrap();
        let ok = write(
            dir.path(),
            "series.json",
            r#"[{"patient_id":"p","study_uid":"st","series_uid":"s","user_series_type":null,
                 "catboost_series_type_heuristics":"ADC","diffusion_bvalue":0}]"#,
        );
        let ledger = AnomalyLedger::in_memory();
        let index = SeriesIndex::load(&ok, &[], &ledger).unwrap();
        assert_eq!(index.rows()[0].sequence(), Some(SequenceKind::ApparentDiffusion));
        assert_eq!(index.rows()[0].diffusion_index.as_deref(), Some("0"));

        let bad = write(dir.path(), "bad.csv", "patient_id,series_uid\np,s\n");
        assert!(matches!(
            SeriesIndex::load(&bad, &[], &ledger),
            Err(IndexError::MissingColumn(c)) if c == "study_uid"
        ));
    }

    #[test]
    fn declared_but_empty_label_column_falls_back_to_heuristic() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "series.csv",
            "patient_id,study_uid,series_uid,user_series_type,catboost_series_type_heuristics\n\
             p,st,s1,,T2\n\
             p,st,s2,,\n",
        );
        let ledger = AnomalyLedger::in_memory();
        let index = SeriesIndex::load(&path, &[], &ledger).unwrap();
        assert_eq!(index.rows()[0].sequence(), Some(SequenceKind::Structural));
        assert_eq!(index.rows()[1].sequence(), None);
        assert!(!ledger.contains(AnomalyKind::DefaultColumnMissing, SEQUENCE_LABEL));
    }

    #[test]
    fn rows_without_identity_are_logged() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "series.csv",
            "patient_id,study_uid,series_uid,user_series_type\n\
             p,st,s1,T2\n\
             p,st,,ADC\n",
        );
        let ledger = AnomalyLedger::in_memory();
        let index = SeriesIndex::load(&path, &[], &ledger).unwrap();
        assert_eq!(index.rows().len(), 1);
        let entries = ledger.kind_entries(AnomalyKind::MissingIdentity);
        assert_eq!(entries["series row 1"]["missing"], serde_json::json!(["series_uid"]));

        let segments = Table::from_records(vec![
            Record::from([
                ("source_series_uid".to_string(), "s1".to_string()),
                (STUDY_UID.to_string(), "st".to_string()),
                ("derived_series_uid".to_string(), "seg".to_string()),
            ]),
            Record::from([
                ("source_series_uid".to_string(), "s2".to_string()),
                (STUDY_UID.to_string(), "st".to_string()),
            ]),
        ]);
        let ledger = AnomalyLedger::in_memory();
        let index = SegmentationIndex::from_table(segments, &ledger).unwrap();
        assert_eq!(index.derived_for("st", "s1"), Some("seg"));
        assert_eq!(index.derived_for("st", "s2"), None);
        assert!(ledger.contains(AnomalyKind::MissingIdentity, "segmentation row 1"));
    }

    #[test]
    fn parquet_index_keeps_declared_columns() {
        use arrow::array::{ArrayRef, Int64Array, StringArray};
        use arrow::datatypes::{DataType, Field, Schema};
        use arrow::record_batch::RecordBatch;
        use parquet::arrow::ArrowWriter;
        use std::sync::Arc;

        let schema = Arc::new(Schema::new(vec![
            Field::new(PATIENT_ID, DataType::Utf8, true),
            Field::new(STUDY_UID, DataType::Utf8, true),
            Field::new(SERIES_UID, DataType::Utf8, true),
            Field::new(SEQUENCE_LABEL, DataType::Utf8, true),
            Field::new(HEURISTIC_LABEL, DataType::Utf8, true),
            Field::new(DIFFUSION_INDEX, DataType::Int64, true),
        ]));
        let columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from(vec!["p", "p"])),
            Arc::new(StringArray::from(vec!["st", "st"])),
            Arc::new(StringArray::from(vec!["s1", "s2"])),
            Arc::new(StringArray::from(vec![None::<&str>, None])),
            Arc::new(StringArray::from(vec![Some("DWI"), Some("ADC")])),
            Arc::new(Int64Array::from(vec![Some(800), None])),
        ];
        let batch = RecordBatch::try_new(schema.clone(), columns).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("series.parquet");
        let mut writer = ArrowWriter::try_new(File::create(&path).unwrap(), schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let ledger = AnomalyLedger::in_memory();
        let index = SeriesIndex::load(&path, &[], &ledger).unwrap();
        assert_eq!(index.rows().len(), 2);
        assert_eq!(index.rows()[0].sequence(), Some(SequenceKind::DiffusionWeighted));
        assert_eq!(index.rows()[0].diffusion_index.as_deref(), Some("800"));
        assert_eq!(index.rows()[1].diffusion_index, None);
        assert!(!ledger.contains(AnomalyKind::DefaultColumnMissing, SEQUENCE_LABEL));
    }

    #[test]
    fn segmentation_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "segments.csv",
            "source_series_uid,study_uid,derived_series_uid\ns1,st1,seg1\n",
        );
        let index = SegmentationIndex::load(&path, &AnomalyLedger::in_memory()).unwrap();
        assert_eq!(index.derived_for("st1", "s1"), Some("seg1"));
        assert_eq!(index.derived_for("st2", "s1"), None);
    }
}
