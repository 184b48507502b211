use std::fmt;

use serde::Serialize;

/// Anatomical plane of a slice, named after the patient axis its normal
/// points along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Orientation {
    Sagittal,
    Coronal,
    Axial,
}

impl Orientation {
    /// Index of the patient axis (x, y, z) the plane normal is aligned with.
    pub fn axis(self) -> usize {
        match self {
            Orientation::Sagittal => 0,
            Orientation::Coronal => 1,
            Orientation::Axial => 2,
        }
    }

    pub fn from_axis(axis: usize) -> Option<Self> {
        match axis {
            0 => Some(Orientation::Sagittal),
            1 => Some(Orientation::Coronal),
            2 => Some(Orientation::Axial),
            _ => None,
        }
    }

    /// Plane whose normal (row cosine x column cosine) has the largest
    /// absolute component.
    pub fn from_direction_cosines(cosines: &[f64; 6]) -> Self {
        let normal = cross(
            [cosines[0], cosines[1], cosines[2]],
            [cosines[3], cosines[4], cosines[5]],
        );
        let axis = normal
            .iter()
            .map(|c| c.abs())
            .enumerate()
            .fold((0, f64::MIN), |best, (i, c)| if c > best.1 { (i, c) } else { best })
            .0;
        // axis is always 0..3 here
        Self::from_axis(axis).unwrap_or(Orientation::Axial)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Orientation::Sagittal => "SAG",
            Orientation::Coronal => "COR",
            Orientation::Axial => "AX",
        }
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

/// Sequence type of a series, one variant per export policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SequenceKind {
    /// T2-weighted structural image, the grid segmentations live on.
    Structural,
    /// Apparent diffusion coefficient map.
    ApparentDiffusion,
    /// Diffusion-weighted image, possibly several strengths per series.
    DiffusionWeighted,
    /// Dynamic contrast-enhanced acquisition.
    ContrastEnhanced,
    Other(String),
}

impl SequenceKind {
    /// Parses a sequence label. `T2AX` is an alias of `T2`.
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim();
        let kind = match label {
            "" => return None,
            "T2" | "T2AX" => SequenceKind::Structural,
            "ADC" => SequenceKind::ApparentDiffusion,
            "DWI" => SequenceKind::DiffusionWeighted,
            "DCE" => SequenceKind::ContrastEnhanced,
            other => SequenceKind::Other(other.to_string()),
        };
        Some(kind)
    }

    pub fn label(&self) -> &str {
        match self {
            SequenceKind::Structural => "T2",
            SequenceKind::ApparentDiffusion => "ADC",
            SequenceKind::DiffusionWeighted => "DWI",
            SequenceKind::ContrastEnhanced => "DCE",
            SequenceKind::Other(label) => label,
        }
    }

    pub fn is_diffusion_weighted(&self) -> bool {
        matches!(self, SequenceKind::DiffusionWeighted)
    }
}

impl fmt::Display for SequenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Classification of a reconstructed label mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskKind {
    Binary,
    Semantic,
    AllZero,
}

/// How diffusion-weighted sub-series are exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrengthExport {
    /// One representative sub-series per series.
    #[default]
    Representative,
    All,
}
