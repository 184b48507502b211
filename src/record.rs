//! Record of every volume and mask the run produced or expected.
//!
//! Nested as patient → study → sequence slot → sub-series key. Masks live
//! under the [`MASK_SLOT`] slot keyed by label. The whole record is
//! rewritten after each study so an interrupted run keeps what it finished.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use thiserror::Error;

use crate::context::StudyContext;
use crate::enums::MaskKind;
use crate::ledger::{AnomalyKind, write_atomically};

/// Slot holding label masks.
pub const MASK_SLOT: &str = "SEG";

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("IO error writing record {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Could not serialize record {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExportStatus {
    Exported { path: PathBuf },
    /// Expected but not written; `reason` names the anomaly kind.
    Missing { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordEntry {
    #[serde(flatten)]
    pub status: ExportStatus,
    pub series_uid: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plane: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub planes_seen: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub strengths: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub raw_strengths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rescale_type: Option<String>,
    /// (depth, height, width)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shape: Option<[usize; 3]>,
    pub slices: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask_kind: Option<MaskKind>,
}

impl RecordEntry {
    pub fn new(series_uid: impl Into<String>, status: ExportStatus) -> Self {
        Self {
            status,
            series_uid: series_uid.into(),
            metadata: BTreeMap::new(),
            plane: None,
            planes_seen: Vec::new(),
            strengths: Vec::new(),
            raw_strengths: Vec::new(),
            rescale_type: None,
            shape: None,
            slices: 0,
            mask_kind: None,
        }
    }

    pub fn exported(series_uid: impl Into<String>, path: PathBuf) -> Self {
        Self::new(series_uid, ExportStatus::Exported { path })
    }

    pub fn missing(series_uid: impl Into<String>, reason: AnomalyKind) -> Self {
        Self::new(
            series_uid,
            ExportStatus::Missing {
                reason: reason.to_string(),
            },
        )
    }

    pub fn is_exported(&self) -> bool {
        matches!(self.status, ExportStatus::Exported { .. })
    }
}

/// Slot → sub-series key → entry, for one study.
pub type StudyRecord = BTreeMap<String, BTreeMap<String, RecordEntry>>;

type Entries = BTreeMap<String, BTreeMap<String, StudyRecord>>;

#[derive(Debug, Default)]
pub struct ExportRecord {
    path: Option<PathBuf>,
    entries: Mutex<Entries>,
}

impl ExportRecord {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            entries: Mutex::default(),
        }
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Stores the finished study and rewrites the record file.
    pub fn insert_study(&self, context: &StudyContext, study: StudyRecord) -> Result<(), RecordError> {
        let mut entries = self.lock();
        entries
            .entry(context.patient_id.clone())
            .or_default()
            .insert(context.study_uid.clone(), study);
        self.persist(&entries)
    }

    pub fn study(&self, context: &StudyContext) -> Option<StudyRecord> {
        self.lock()
            .get(&context.patient_id)
            .and_then(|studies| studies.get(&context.study_uid))
            .cloned()
    }

    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(&*self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, entries: &Entries) -> Result<(), RecordError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let text = serde_json::to_string_pretty(entries).map_err(|source| RecordError::Json {
            path: path.clone(),
            source,
        })?;
        write_atomically(path, text.as_bytes()).map_err(|source| RecordError::Io {
            path: path.clone(),
            source,
        })
    }
}
