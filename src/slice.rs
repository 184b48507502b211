//! Per-slice metadata and the I/O seam used by every processing stage.
//!
//! Stages never open files themselves: they ask a [`SliceReader`] for a
//! slice header, its pixel data, or a segmentation object. The
//! [`DicomFileReader`] answers from DICOM files on disk.

use std::fs;
use std::path::{Path, PathBuf};

use dicom::core::VR;
use dicom::object::{DefaultDicomObject, InMemDicomObject, OpenFileOptions, open_file};
use dicom::pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder};
use dicom_dictionary_std::tags;
use ndarray::{Array2, Array3, s};
use thiserror::Error;

use crate::enums::Orientation;
use crate::segmentation::SegmentationObject;
use crate::strength::{RawStrength, StrengthSource};

#[derive(Debug, Error)]
pub enum SliceReadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),

    #[error("Pixel data error: {0}")]
    PixelData(#[from] dicom::pixeldata::Error),

    #[error("{path}: missing or malformed {attribute}")]
    Attribute {
        path: PathBuf,
        attribute: &'static str,
    },
}

/// Everything the pipeline needs to know about one slice file without
/// touching its pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceHeader {
    pub path: PathBuf,
    /// SOP Instance UID, the identity used to register segmentations.
    pub sop_instance_uid: Option<String>,
    /// Image Position (Patient) of the first voxel, in mm.
    pub position: Option<[f64; 3]>,
    /// Image Orientation (Patient): row cosine then column cosine.
    pub orientation: Option<[f64; 6]>,
    /// Row spacing, column spacing.
    pub pixel_spacing: Option<(f64, f64)>,
    pub slice_thickness: Option<f64>,
    pub rows: usize,
    pub columns: usize,
    /// Diffusion strength candidates in decode priority order.
    pub diffusion_tags: Vec<(StrengthSource, RawStrength)>,
    /// Rescale Type (0028,1054), the unit of quantitative maps.
    pub rescale_type: Option<String>,
}

impl SliceHeader {
    /// Header with identity geometry, mainly for constructing test inputs.
    pub fn new(path: impl Into<PathBuf>, position: [f64; 3]) -> Self {
        Self {
            path: path.into(),
            sop_instance_uid: None,
            position: Some(position),
            orientation: Some([1.0, 0.0, 0.0, 0.0, 1.0, 0.0]),
            pixel_spacing: Some((1.0, 1.0)),
            slice_thickness: Some(1.0),
            rows: 0,
            columns: 0,
            diffusion_tags: Vec::new(),
            rescale_type: None,
        }
    }

    pub fn plane(&self) -> Option<Orientation> {
        self.orientation
            .as_ref()
            .map(Orientation::from_direction_cosines)
    }
}

/// Source of slice headers, pixel data and segmentation objects.
pub trait SliceReader: Send + Sync {
    fn read_header(&self, path: &Path) -> Result<SliceHeader, SliceReadError>;

    /// First frame of the slice with the modality LUT applied.
    fn read_pixels(&self, path: &Path) -> Result<Array2<f32>, SliceReadError>;

    fn read_segmentation(&self, path: &Path) -> Result<SegmentationObject, SliceReadError>;
}

/// Reads DICOM Part 10 files from disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct DicomFileReader;

impl SliceReader for DicomFileReader {
    fn read_header(&self, path: &Path) -> Result<SliceHeader, SliceReadError> {
        let obj = OpenFileOptions::new()
            .read_until(tags::PIXEL_DATA)
            .open_file(path)?;
        Ok(header_from_object(path, &obj))
    }

    fn read_pixels(&self, path: &Path) -> Result<Array2<f32>, SliceReadError> {
        let obj = open_file(path)?;
        decode_first_frame(&obj)
    }

    fn read_segmentation(&self, path: &Path) -> Result<SegmentationObject, SliceReadError> {
        let obj = open_file(path)?;
        let frames = decode_all_frames(&obj)?;
        SegmentationObject::from_dicom(path, &obj, frames)
    }
}

fn header_from_object(path: &Path, obj: &InMemDicomObject) -> SliceHeader {
    let floats = |tag| {
        obj.element(tag)
            .ok()
            .and_then(|e| e.to_multi_float64().ok())
    };

    let diffusion_tags = StrengthSource::PRIORITY
        .iter()
        .filter_map(|source| {
            let element = obj.element(source.tag()).ok()?;
            let raw = match element.vr() {
                VR::UN | VR::OB | VR::OW => RawStrength::Bytes(element.to_bytes().ok()?.to_vec()),
                VR::FD | VR::FL | VR::US | VR::UL | VR::SS | VR::SL => {
                    RawStrength::Numbers(element.to_multi_float64().ok()?)
                }
                _ => RawStrength::Text(element.to_str().ok()?.into_owned()),
            };
            Some((*source, raw))
        })
        .collect();

    SliceHeader {
        path: path.to_path_buf(),
        sop_instance_uid: text(obj, tags::SOP_INSTANCE_UID),
        position: floats(tags::IMAGE_POSITION_PATIENT)
            .and_then(|v| <[f64; 3]>::try_from(v.as_slice()).ok()),
        orientation: floats(tags::IMAGE_ORIENTATION_PATIENT)
            .and_then(|v| <[f64; 6]>::try_from(v.as_slice()).ok()),
        pixel_spacing: floats(tags::PIXEL_SPACING)
            .filter(|v| v.len() >= 2)
            .map(|v| (v[0], v[1])),
        slice_thickness: obj
            .element(tags::SLICE_THICKNESS)
            .ok()
            .and_then(|e| e.to_float64().ok()),
        rows: integer(obj, tags::ROWS).unwrap_or(0),
        columns: integer(obj, tags::COLUMNS).unwrap_or(0),
        diffusion_tags,
        rescale_type: text(obj, tags::RESCALE_TYPE),
    }
}

pub(crate) fn text(obj: &InMemDicomObject, tag: dicom::core::Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_matches(|c: char| c == '\0' || c.is_whitespace()).to_string())
        .filter(|s| !s.is_empty())
}

pub(crate) fn integer(obj: &InMemDicomObject, tag: dicom::core::Tag) -> Option<usize> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_int::<u32>().ok())
        .map(|v| v as usize)
}

fn decode_first_frame(obj: &DefaultDicomObject) -> Result<Array2<f32>, SliceReadError> {
    let pixel_data = obj.decode_pixel_data()?;
    let options = ConvertOptions::new().with_modality_lut(ModalityLutOption::Default);
    let frames = pixel_data.to_ndarray_with_options::<f32>(&options)?;
    Ok(frames.slice_move(s![0, .., .., 0]))
}

fn decode_all_frames(obj: &DefaultDicomObject) -> Result<Array3<u8>, SliceReadError> {
    let pixel_data = obj.decode_pixel_data()?;
    let options = ConvertOptions::new().with_modality_lut(ModalityLutOption::None);
    let frames = pixel_data.to_ndarray_with_options::<u8>(&options)?;
    Ok(frames.slice_move(s![.., .., .., 0]))
}

/// Regular, non-hidden files of a series directory in name order.
pub fn list_series_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut paths: Vec<_> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with('.'))
        })
        .collect();
    paths.sort();
    Ok(paths)
}
