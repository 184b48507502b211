//! Append/merge store of every non-fatal decision taken during a run.
//!
//! Entries are grouped by [`AnomalyKind`]; each kind maps a context key
//! (series uid, file path, `patient_study`, ...) to a JSON detail value.
//! Recording under an existing kind merges into it, recording under an
//! existing key of that kind replaces only that key. The ledger is the one
//! structure shared between studies, so all access goes through a mutex.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use log::{error, warn};
use serde_json::Value;
use thiserror::Error;

pub type LedgerEntries = BTreeMap<String, BTreeMap<String, Value>>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("IO error on ledger {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Ledger {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AnomalyKind {
    DefaultColumnMissing,
    SelectedColumnMissing,
    MissingIdentity,
    FileNotFound,
    UnreadableSlice,
    MissingSequenceLabel,
    MissingPosition,
    MissingOrientation,
    DuplicateSequenceLabel,
    DuplicateDetected,
    SameOriginFound,
    MissingBValue,
    MultiplePlanesFound,
    OffPlaneSlice,
    DwiMultiSeriesNotSameSliceNumber,
    UnknownBValueReordered,
    AdcRescaleTypeMicro,
    SameBValueFound,
    VolumeNotAssembled,
    VolumeNotWritten,
    SegmentationFileNotFound,
    UnreadableSegmentation,
    EncodingMismatch,
    LabelMismatch,
    UnlabeledFrame,
    OneSliceSegmentation,
    SegmentationSliceReferenceNotFound,
    MaskShapeMismatch,
    ZeroMaskFound,
    RecordNotWritten,
}

impl AnomalyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AnomalyKind::DefaultColumnMissing => "DefaultColumnMissing",
            AnomalyKind::SelectedColumnMissing => "SelectedColumnMissing",
            AnomalyKind::MissingIdentity => "MissingIdentity",
            AnomalyKind::FileNotFound => "FileNotFound",
            AnomalyKind::UnreadableSlice => "UnreadableSlice",
            AnomalyKind::MissingSequenceLabel => "MissingSequenceLabel",
            AnomalyKind::MissingPosition => "MissingPosition",
            AnomalyKind::MissingOrientation => "MissingOrientation",
            AnomalyKind::DuplicateSequenceLabel => "DuplicateSequenceLabel",
            AnomalyKind::DuplicateDetected => "DuplicateDetected",
            AnomalyKind::SameOriginFound => "SameOriginFound",
            AnomalyKind::MissingBValue => "MissingBValue",
            AnomalyKind::MultiplePlanesFound => "MultiplePlanesFound",
            AnomalyKind::OffPlaneSlice => "OffPlaneSlice",
            AnomalyKind::DwiMultiSeriesNotSameSliceNumber => "DWIMultiSeriesNotSameSliceNumber",
            AnomalyKind::UnknownBValueReordered => "UnknownBValueReordered",
            AnomalyKind::AdcRescaleTypeMicro => "ADCRescaleTypeMicro",
            AnomalyKind::SameBValueFound => "SameBValueFound",
            AnomalyKind::VolumeNotAssembled => "VolumeNotAssembled",
            AnomalyKind::VolumeNotWritten => "VolumeNotWritten",
            AnomalyKind::SegmentationFileNotFound => "SegmentationFileNotFound",
            AnomalyKind::UnreadableSegmentation => "UnreadableSegmentation",
            AnomalyKind::EncodingMismatch => "EncodingMismatch",
            AnomalyKind::LabelMismatch => "LabelMismatch",
            AnomalyKind::UnlabeledFrame => "UnlabeledFrame",
            AnomalyKind::OneSliceSegmentation => "OneSliceSegmentation",
            AnomalyKind::SegmentationSliceReferenceNotFound => {
                "SegmentationSliceReferenceNotFound"
            }
            AnomalyKind::MaskShapeMismatch => "MaskShapeMismatch",
            AnomalyKind::ZeroMaskFound => "ZeroMaskFound",
            AnomalyKind::RecordNotWritten => "RecordNotWritten",
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
pub struct AnomalyLedger {
    path: Option<PathBuf>,
    entries: Mutex<LedgerEntries>,
}

impl AnomalyLedger {
    /// Ledger that lives only for the current process.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens the ledger file at `path`. With `reset` the file is truncated
    /// to an empty mapping, otherwise existing entries are loaded and new
    /// ones merged into them.
    pub fn open(path: impl AsRef<Path>, reset: bool) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let entries = if !reset && path.exists() {
            let text = fs::read_to_string(&path).map_err(|source| LedgerError::Io {
                path: path.clone(),
                source,
            })?;
            serde_json::from_str(&text).map_err(|source| LedgerError::Json {
                path: path.clone(),
                source,
            })?
        } else {
            LedgerEntries::new()
        };
        let ledger = Self {
            path: Some(path),
            entries: Mutex::new(entries),
        };
        ledger.persist(&ledger.lock())?;
        Ok(ledger)
    }

    /// Records one anomaly and persists the ledger. A failing write is
    /// logged, never propagated.
    pub fn record(&self, kind: AnomalyKind, key: impl Into<String>, detail: impl Into<Value>) {
        let key = key.into();
        let detail = detail.into();
        warn!("{kind} [{key}]: {detail}");

        let mut entries = self.lock();
        entries
            .entry(kind.as_str().to_string())
            .or_default()
            .insert(key, detail);
        if let Err(err) = self.persist(&entries) {
            error!("could not persist anomaly ledger: {err}");
        }
    }

    pub fn contains(&self, kind: AnomalyKind, key: &str) -> bool {
        self.lock()
            .get(kind.as_str())
            .is_some_and(|entries| entries.contains_key(key))
    }

    /// Entries recorded under `kind`, keyed by context key.
    pub fn kind_entries(&self, kind: AnomalyKind) -> BTreeMap<String, Value> {
        self.lock().get(kind.as_str()).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> LedgerEntries {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerEntries> {
        // A panic while holding the lock cannot leave the map half-written.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, entries: &LedgerEntries) -> Result<(), LedgerError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let text = serde_json::to_string_pretty(entries).map_err(|source| LedgerError::Json {
            path: path.clone(),
            source,
        })?;
        write_atomically(path, text.as_bytes()).map_err(|source| LedgerError::Io {
            path: path.clone(),
            source,
        })
    }
}

/// Writes through a sibling temporary file and renames it into place so a
/// crash never leaves a truncated file behind.
pub(crate) fn write_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}
