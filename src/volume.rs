use crate::enums::{Orientation, cross};

use ndarray::Array3;

/// Voxel grid of a volume: array shape plus the mapping to patient space.
/// Masks registered onto a volume carry a copy of its grid.
#[derive(Debug, Clone, PartialEq)]
pub struct VoxelGrid {
    /// (depth, height, width)
    pub dim: (usize, usize, usize),
    /// Spacing along (width, height, depth) in mm.
    pub spacing: (f64, f64, f64),
    /// Patient (LPS) position of voxel (0, 0, 0).
    pub origin: [f64; 3],
    /// Unit directions of the width, height and depth axes in LPS.
    pub direction: [[f64; 3]; 3],
}

impl VoxelGrid {
    /// Voxel-to-world affine in the RAS convention NIfTI expects, row-major.
    /// Voxel index order is (width, height, depth).
    pub fn ras_affine(&self) -> [[f64; 4]; 4] {
        let spacing = [self.spacing.0, self.spacing.1, self.spacing.2];
        let mut affine = [[0.0; 4]; 4];
        for row in 0..3 {
            // LPS -> RAS flips the first two patient axes.
            let flip = if row < 2 { -1.0 } else { 1.0 };
            for (axis, direction) in self.direction.iter().enumerate() {
                affine[row][axis] = flip * direction[row] * spacing[axis];
            }
            affine[row][3] = flip * self.origin[row];
        }
        affine[3][3] = 1.0;
        affine
    }
}

/// Where one assembled slice came from.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeSlice {
    pub coordinate: f64,
    pub sop_instance_uid: Option<String>,
    pub path: std::path::PathBuf,
}

#[derive(Debug, Clone)]
pub struct Volume {
    pub data: Array3<f32>,
    pub grid: VoxelGrid,
    pub plane: Orientation,
    /// Source slices in depth order.
    pub slices: Vec<VolumeSlice>,
}

impl Volume {
    pub fn new(data: Array3<f32>, grid: VoxelGrid, plane: Orientation, slices: Vec<VolumeSlice>) -> Self {
        Self {
            data,
            grid,
            plane,
            slices,
        }
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn max_value(&self) -> f32 {
        self.data.iter().copied().fold(f32::MIN, f32::max)
    }

    pub fn scale(&mut self, factor: f32) {
        self.data.mapv_inplace(|v| v * factor);
    }

    /// SOP instance UIDs in depth order.
    pub fn slice_uids(&self) -> impl Iterator<Item = Option<&str>> {
        self.slices.iter().map(|s| s.sop_instance_uid.as_deref())
    }
}

/// Grid of a stack of slices sharing in-plane geometry.
///
/// `positions` are the LPS positions of the slices in depth order. The
/// depth direction follows the stack when there are two or more slices and
/// the plane normal otherwise.
pub(crate) fn stack_grid(
    dim: (usize, usize, usize),
    positions: &[[f64; 3]],
    orientation: [f64; 6],
    pixel_spacing: (f64, f64),
    slice_thickness: Option<f64>,
) -> VoxelGrid {
    let row = normalize([orientation[0], orientation[1], orientation[2]]);
    let column = normalize([orientation[3], orientation[4], orientation[5]]);
    let origin = positions.first().copied().unwrap_or_default();

    let (depth_direction, depth_spacing) = match (positions.first(), positions.last()) {
        (Some(first), Some(last)) if positions.len() > 1 => {
            let span = [last[0] - first[0], last[1] - first[1], last[2] - first[2]];
            let length = norm(span);
            (normalize(span), length / (positions.len() - 1) as f64)
        }
        _ => (normalize(cross(row, column)), slice_thickness.unwrap_or(1.0)),
    };

    VoxelGrid {
        dim,
        spacing: (pixel_spacing.1, pixel_spacing.0, depth_spacing),
        origin,
        direction: [row, column, depth_direction],
    }
}

fn norm(v: [f64; 3]) -> f64 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

fn normalize(v: [f64; 3]) -> [f64; 3] {
    let n = norm(v);
    if n == 0.0 {
        return v;
    }
    [v[0] / n, v[1] / n, v[2] / n]
}
