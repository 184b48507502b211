//! In-memory [`SliceReader`] for driving the pipeline without DICOM files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ndarray::Array2;

use crate::segmentation::SegmentationObject;
use crate::slice::{SliceHeader, SliceReadError, SliceReader};
use crate::strength::{RawStrength, StrengthSource};

pub(crate) const ROWS: usize = 2;
pub(crate) const COLUMNS: usize = 3;

#[derive(Default, Clone)]
pub(crate) struct MemoryReader {
    headers: HashMap<PathBuf, SliceHeader>,
    pixels: HashMap<PathBuf, Array2<f32>>,
    segmentations: HashMap<PathBuf, SegmentationObject>,
}

impl MemoryReader {
    /// Axial slice filled with `value`, SOP instance UID `uid-<path>`.
    pub(crate) fn add_slice(&mut self, path: impl AsRef<Path>, position: [f64; 3], value: f32) {
        let header = SliceHeader::new(path.as_ref(), position);
        self.add_header(header, value);
    }

    pub(crate) fn add_diffusion_slice(
        &mut self,
        path: impl AsRef<Path>,
        position: [f64; 3],
        value: f32,
        strength: Option<u32>,
    ) {
        let mut header = SliceHeader::new(path.as_ref(), position);
        header.diffusion_tags = match strength {
            Some(b) => vec![(StrengthSource::Public, RawStrength::Numbers(vec![f64::from(b)]))],
            None => vec![(StrengthSource::Siemens, RawStrength::Text("unreadable".into()))],
        };
        self.add_header(header, value);
    }

    pub(crate) fn add_header(&mut self, mut header: SliceHeader, value: f32) {
        header.rows = ROWS;
        header.columns = COLUMNS;
        if header.sop_instance_uid.is_none() {
            header.sop_instance_uid = Some(format!("uid-{}", header.path.display()));
        }
        self.pixels
            .insert(header.path.clone(), Array2::from_elem((ROWS, COLUMNS), value));
        self.headers.insert(header.path.clone(), header);
    }

    pub(crate) fn set_pixels(&mut self, path: impl AsRef<Path>, pixels: Array2<f32>) {
        self.pixels.insert(path.as_ref().to_path_buf(), pixels);
    }

    /// A path whose header cannot be read.
    pub(crate) fn add_unreadable(&mut self, path: impl AsRef<Path>) {
        self.headers.remove(path.as_ref());
    }

    pub(crate) fn add_segmentation(&mut self, path: impl AsRef<Path>, object: SegmentationObject) {
        self.segmentations.insert(path.as_ref().to_path_buf(), object);
    }
}

fn not_found(path: &Path) -> SliceReadError {
    SliceReadError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        path.display().to_string(),
    ))
}

impl SliceReader for MemoryReader {
    fn read_header(&self, path: &Path) -> Result<SliceHeader, SliceReadError> {
        self.headers.get(path).cloned().ok_or_else(|| not_found(path))
    }

    fn read_pixels(&self, path: &Path) -> Result<Array2<f32>, SliceReadError> {
        self.pixels.get(path).cloned().ok_or_else(|| not_found(path))
    }

    fn read_segmentation(&self, path: &Path) -> Result<SegmentationObject, SliceReadError> {
        self.segmentations
            .get(path)
            .cloned()
            .ok_or_else(|| not_found(path))
    }
}
