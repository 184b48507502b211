//! Registration of DICOM SEG objects onto the structural volume they were
//! drawn on.
//!
//! Frames are matched to volume slices by the SOP Instance UID they
//! reference, never by position. Each label code gets its own mask on the
//! volume's grid.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use dicom::core::Tag;
use dicom::object::{DefaultDicomObject, InMemDicomObject};
use dicom_dictionary_std::tags;
use log::{debug, info};
use ndarray::{Array3, Zip, s};
use serde_json::json;
use thiserror::Error;

use crate::context::SeriesContext;
use crate::enums::MaskKind;
use crate::ledger::{AnomalyKind, AnomalyLedger};
use crate::slice::{SliceReadError, integer, text};
use crate::volume::{Volume, VoxelGrid};

#[derive(Debug, Error)]
pub enum SegmentationError {
    #[error("Mask {label} has shape {mask:?}, volume has {volume:?}")]
    ShapeMismatch {
        label: String,
        mask: (usize, usize, usize),
        volume: (usize, usize, usize),
    },

    #[error("Segmentation read error: {0}")]
    Read(#[from] SliceReadError),
}

/// What one frame of the segmentation object points at.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FrameReference {
    /// Referenced SOP Instance UID of the source image.
    pub sop_instance_uid: Option<String>,
    /// Referenced Segment Number.
    pub segment_number: Option<u16>,
}

/// Decoded segmentation object.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationObject {
    pub path: PathBuf,
    /// Segment Number to Segment Label, from the Segment Sequence.
    pub segments: BTreeMap<u16, String>,
    /// One entry per frame, in frame order.
    pub frames: Vec<FrameReference>,
    /// (frames, rows, columns)
    pub pixels: Array3<u8>,
}

impl SegmentationObject {
    pub fn new(
        path: impl Into<PathBuf>,
        segments: BTreeMap<u16, String>,
        frames: Vec<FrameReference>,
        pixels: Array3<u8>,
    ) -> Self {
        Self {
            path: path.into(),
            segments,
            frames,
            pixels,
        }
    }

    /// Builds the object from an opened SEG file and its decoded frames.
    pub fn from_dicom(
        path: &Path,
        obj: &DefaultDicomObject,
        pixels: Array3<u8>,
    ) -> Result<Self, SliceReadError> {
        let missing = |attribute| SliceReadError::Attribute {
            path: path.to_path_buf(),
            attribute,
        };

        let segments = obj
            .element(tags::SEGMENT_SEQUENCE)
            .ok()
            .and_then(|e| e.items())
            .ok_or_else(|| missing("SegmentSequence"))?
            .iter()
            .filter_map(|item| {
                let number = u16::try_from(integer(item, tags::SEGMENT_NUMBER)?).ok()?;
                let label = text(item, tags::SEGMENT_LABEL).unwrap_or_else(|| number.to_string());
                Some((number, label))
            })
            .collect();

        let frames: Vec<FrameReference> = obj
            .element(tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE)
            .ok()
            .and_then(|e| e.items())
            .ok_or_else(|| missing("PerFrameFunctionalGroupsSequence"))?
            .iter()
            .map(frame_reference)
            .collect();

        if frames.len() != pixels.dim().0 {
            return Err(missing("PerFrameFunctionalGroupsSequence"));
        }

        Ok(Self::new(path, segments, frames, pixels))
    }

    /// Segment numbers actually referenced by frames, ascending.
    pub fn referenced_codes(&self) -> Vec<u16> {
        self.frames
            .iter()
            .filter_map(|f| f.segment_number)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Label table keyed by the codes frames use.
    ///
    /// Matching code sets are kept. Otherwise codes are paired by ascending
    /// position: equal counts log `EncodingMismatch`, differing counts log
    /// `LabelMismatch` and pair only up to the shorter list.
    pub fn reconcile_labels(&self, context: &SeriesContext, ledger: &AnomalyLedger) -> BTreeMap<u16, String> {
        let defined: Vec<u16> = self.segments.keys().copied().collect();
        let referenced = self.referenced_codes();
        if defined == referenced {
            return self.segments.clone();
        }

        let kind = if defined.len() == referenced.len() {
            AnomalyKind::EncodingMismatch
        } else {
            AnomalyKind::LabelMismatch
        };
        let remapped: BTreeMap<u16, String> = referenced
            .iter()
            .zip(self.segments.values())
            .map(|(code, label)| (*code, label.clone()))
            .collect();

        ledger.record(
            kind,
            context.key(),
            json!({
                "file": self.path.display().to_string(),
                "defined": self.segments,
                "referenced": referenced,
                "remapped": remapped,
            }),
        );
        remapped
    }

    /// Places every frame into the mask of its label on `volume`'s grid.
    ///
    /// Fails with the logged anomaly kind when any frame references a slice
    /// that is not part of the volume or frame and volume shapes disagree.
    /// Frames whose segment has no label are logged and skipped.
    pub fn register(
        &self,
        labels: &BTreeMap<u16, String>,
        volume: &Volume,
        context: &SeriesContext,
        ledger: &AnomalyLedger,
    ) -> Result<Vec<LabelMask>, AnomalyKind> {
        let (depth, height, width) = volume.dim();
        let (frame_count, rows, columns) = self.pixels.dim();

        if frame_count == 1 {
            ledger.record(
                AnomalyKind::OneSliceSegmentation,
                context.key(),
                self.path.display().to_string(),
            );
        }

        if (rows, columns) != (height, width) {
            ledger.record(
                AnomalyKind::MaskShapeMismatch,
                context.key(),
                json!({
                    "file": self.path.display().to_string(),
                    "frame": [rows, columns],
                    "volume": [depth, height, width],
                }),
            );
            return Err(AnomalyKind::MaskShapeMismatch);
        }

        let slice_index: HashMap<&str, usize> = volume
            .slice_uids()
            .enumerate()
            .filter_map(|(i, uid)| uid.map(|uid| (uid, i)))
            .collect();

        let mut masks: BTreeMap<u16, Array3<u8>> = labels
            .keys()
            .map(|code| (*code, Array3::zeros((depth, height, width))))
            .collect();

        for (frame_index, frame) in self.frames.iter().enumerate() {
            let target = frame
                .sop_instance_uid
                .as_deref()
                .and_then(|uid| slice_index.get(uid).copied());
            let Some(target) = target else {
                ledger.record(
                    AnomalyKind::SegmentationSliceReferenceNotFound,
                    context.key(),
                    json!({
                        "file": self.path.display().to_string(),
                        "frame": frame_index,
                        "referenced_uid": frame.sop_instance_uid,
                    }),
                );
                return Err(AnomalyKind::SegmentationSliceReferenceNotFound);
            };

            let Some(mask) = frame.segment_number.and_then(|code| masks.get_mut(&code)) else {
                ledger.record(
                    AnomalyKind::UnlabeledFrame,
                    format!("{}#{frame_index}", self.path.display()),
                    json!({ "series_uid": context.series_uid, "segment_number": frame.segment_number }),
                );
                continue;
            };

            Zip::from(mask.slice_mut(s![target, .., ..]))
                .and(self.pixels.slice(s![frame_index, .., ..]))
                .for_each(|voxel, &value| *voxel = (*voxel).max(value));
        }

        debug!("{context}: registered {} frames onto {} labels", self.frames.len(), masks.len());
        Ok(masks
            .into_iter()
            .filter_map(|(code, data)| {
                let name = labels.get(&code)?.clone();
                Some(LabelMask::new(name, code, data, volume.grid.clone()))
            })
            .collect())
    }
}

fn first_item(obj: &InMemDicomObject, tag: Tag) -> Option<&InMemDicomObject> {
    obj.element(tag).ok()?.items()?.first()
}

fn frame_reference(item: &InMemDicomObject) -> FrameReference {
    let segment_number = first_item(item, tags::SEGMENT_IDENTIFICATION_SEQUENCE)
        .and_then(|id| integer(id, tags::REFERENCED_SEGMENT_NUMBER))
        .and_then(|n| u16::try_from(n).ok());

    let sop_instance_uid = first_item(item, tags::DERIVATION_IMAGE_SEQUENCE)
        .and_then(|derivation| first_item(derivation, tags::SOURCE_IMAGE_SEQUENCE))
        .and_then(|source| text(source, tags::REFERENCED_SOP_INSTANCE_UID));

    FrameReference {
        sop_instance_uid,
        segment_number,
    }
}

/// Mask of one label on the grid of its source volume.
#[derive(Debug, Clone)]
pub struct LabelMask {
    pub name: String,
    pub code: u16,
    pub data: Array3<u8>,
    pub grid: VoxelGrid,
    pub kind: MaskKind,
}

impl LabelMask {
    /// Classifies `data` on construction; binary masks are forced to 0/1.
    pub fn new(name: String, code: u16, mut data: Array3<u8>, grid: VoxelGrid) -> Self {
        let kind = classify_mask(&mut data);
        Self {
            name,
            code,
            data,
            grid,
            kind,
        }
    }

    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Fails unless the mask has exactly the volume's voxel grid shape.
    pub fn ensure_matches(&self, volume: &Volume) -> Result<(), SegmentationError> {
        if self.dim() != volume.dim() || self.grid.dim != volume.grid.dim {
            return Err(SegmentationError::ShapeMismatch {
                label: self.name.clone(),
                mask: self.dim(),
                volume: volume.dim(),
            });
        }
        Ok(())
    }

    /// Label usable as a file stem.
    pub fn file_stem(&self) -> String {
        let stem: String = self
            .name
            .trim()
            .chars()
            .map(|c| if c == '/' || c == '\\' || c.is_control() { '_' } else { c })
            .collect();
        if stem.is_empty() {
            self.code.to_string()
        } else {
            stem
        }
    }
}

/// Two distinct values make a binary mask (non-zero forced to 1), more make
/// a semantic one, zero alone an empty one.
pub fn classify_mask(data: &mut Array3<u8>) -> MaskKind {
    let values: BTreeSet<u8> = data.iter().copied().collect();
    match values.len() {
        0 => MaskKind::AllZero,
        1 if values.contains(&0) => MaskKind::AllZero,
        1 | 2 => {
            data.mapv_inplace(|v| u8::from(v != 0));
            MaskKind::Binary
        }
        _ => MaskKind::Semantic,
    }
}

/// Reconciles labels and registers `object` onto `volume`. All-zero masks
/// are logged as `ZeroMaskFound` and returned for the caller to skip.
pub fn registered_masks(
    object: &SegmentationObject,
    volume: &Volume,
    context: &SeriesContext,
    ledger: &AnomalyLedger,
) -> Result<Vec<LabelMask>, AnomalyKind> {
    let labels = object.reconcile_labels(context, ledger);
    let masks = object.register(&labels, volume, context, ledger)?;
    for mask in masks.iter().filter(|m| m.kind == MaskKind::AllZero) {
        ledger.record(
            AnomalyKind::ZeroMaskFound,
            format!("{}_{}", context.key(), mask.name),
            json!({ "file": object.path.display().to_string(), "code": mask.code }),
        );
    }
    info!("{context}: {} label masks from {}", masks.len(), object.path.display());
    Ok(masks)
}
