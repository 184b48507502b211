use crate::{
    classifier::SubSeries,
    enums::Orientation,
    slice::{SliceReadError, SliceReader},
    volume::{Volume, VolumeSlice, stack_grid},
};

use ndarray::{Array2, Array3, s};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("Inconsistent image dimensions")]
    InconsistentDimensions,

    #[error("Slice positions are not strictly increasing")]
    UnorderedSlices,

    #[error("{path}: {source}")]
    Slice {
        path: PathBuf,
        #[source]
        source: SliceReadError,
    },
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Stack the slices of a sub-series into a volume
    ///
    /// # Arguments
    ///
    /// * `sub_series` - Slices already ordered along the plane normal
    /// * `plane` - Dominant plane of the series
    /// * `reader` - Source of pixel data
    ///
    /// # Errors
    ///
    /// Returns error if the sub-series is empty, a slice cannot be decoded,
    /// or dimensions are inconsistent
    pub fn load_sub_series(
        sub_series: &SubSeries,
        plane: Orientation,
        reader: &dyn SliceReader,
    ) -> Result<Volume, VolumeLoaderError> {
        let slices = sub_series.slices();
        let first = slices.first().ok_or(VolumeLoaderError::NoValidImages)?;

        if slices.windows(2).any(|w| w[0].coordinate >= w[1].coordinate) {
            return Err(VolumeLoaderError::UnorderedSlices);
        }

        let images = slices
            .iter()
            .map(|slice| {
                reader
                    .read_pixels(&slice.header.path)
                    .map_err(|source| VolumeLoaderError::Slice {
                        path: slice.header.path.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::validate_dimensions(&images)?;
        let volume_array = Self::build_volume_array(&images);

        let positions: Vec<[f64; 3]> = slices
            .iter()
            .filter_map(|slice| slice.header.position)
            .collect();
        let orientation = first
            .header
            .orientation
            .unwrap_or([1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        let pixel_spacing = Self::get_spacing(sub_series);
        let grid = stack_grid(
            volume_array.dim(),
            &positions,
            orientation,
            pixel_spacing,
            first.header.slice_thickness,
        );

        let sources = slices
            .iter()
            .map(|slice| VolumeSlice {
                coordinate: slice.coordinate,
                sop_instance_uid: slice.header.sop_instance_uid.clone(),
                path: slice.header.path.clone(),
            })
            .collect();

        Ok(Volume::new(volume_array, grid, plane, sources))
    }

    fn validate_dimensions(images: &[Array2<f32>]) -> Result<(), VolumeLoaderError> {
        let first_dim = images
            .first()
            .map(Array2::dim)
            .ok_or(VolumeLoaderError::NoValidImages)?;
        if images.iter().any(|img| img.dim() != first_dim) {
            return Err(VolumeLoaderError::InconsistentDimensions);
        }
        Ok(())
    }

    fn build_volume_array(images: &[Array2<f32>]) -> Array3<f32> {
        let (height, width) = images.first().map(Array2::dim).unwrap_or((0, 0));
        let depth = images.len();
        let mut volume = Array3::<f32>::zeros((depth, height, width));

        for (i, image) in images.iter().enumerate() {
            volume.slice_mut(s![i, .., ..]).assign(image);
        }

        volume
    }

    /// In-plane spacing of the first slice that carries one, 1 mm otherwise.
    fn get_spacing(sub_series: &SubSeries) -> (f64, f64) {
        sub_series
            .slices()
            .iter()
            .find_map(|slice| slice.header.pixel_spacing)
            .unwrap_or((1.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::PlacedSlice;
    use crate::slice::SliceHeader;
    use crate::strength::SubSeriesKey;
    use crate::test_support::MemoryReader;

    fn sub_series(reader: &mut MemoryReader, slices: &[(&str, f64, f32)]) -> SubSeries {
        let mut sub = SubSeries::new(SubSeriesKey::NOT_APPLICABLE);
        for (path, z, value) in slices {
            reader.add_slice(path, [0.0, 0.0, *z], *value);
            let mut header = SliceHeader::new(*path, [0.0, 0.0, *z]);
            header.sop_instance_uid = Some(format!("uid-{path}"));
            sub.insert(PlacedSlice {
                coordinate: *z,
                header,
            })
            .unwrap();
        }
        sub
    }

    #[test]
    fn stacks_slices_in_coordinate_order() {
        let mut reader = MemoryReader::default();
        let sub = sub_series(&mut reader, &[("b", 3.0, 2.0), ("a", 0.0, 1.0), ("c", 6.0, 3.0)]);

        let volume = VolumeLoader::load_sub_series(&sub, Orientation::Axial, &reader).unwrap();
        assert_eq!(volume.dim(), (3, 2, 3));
        assert_eq!(volume.data()[[0, 0, 0]], 1.0);
        assert_eq!(volume.data()[[2, 1, 2]], 3.0);
        assert_eq!(volume.grid.spacing, (1.0, 1.0, 3.0));
        assert_eq!(
            volume.slice_uids().collect::<Vec<_>>(),
            [Some("uid-a"), Some("uid-b"), Some("uid-c")]
        );
    }

    #[test]
    fn rejects_inconsistent_dimensions() {
        let mut reader = MemoryReader::default();
        let sub = sub_series(&mut reader, &[("a", 0.0, 1.0), ("b", 1.0, 1.0)]);
        reader.set_pixels("b", Array2::zeros((4, 4)));

        let err = VolumeLoader::load_sub_series(&sub, Orientation::Axial, &reader).unwrap_err();
        assert!(matches!(err, VolumeLoaderError::InconsistentDimensions));
    }

    #[test]
    fn empty_sub_series_has_no_images() {
        let reader = MemoryReader::default();
        let sub = SubSeries::new(SubSeriesKey::NOT_APPLICABLE);
        let err = VolumeLoader::load_sub_series(&sub, Orientation::Axial, &reader).unwrap_err();
        assert!(matches!(err, VolumeLoaderError::NoValidImages));
    }

    #[test]
    fn missing_pixels_name_the_slice() {
        let sub = sub_series(&mut MemoryReader::default(), &[("a", 0.0, 1.0)]);
        let empty = MemoryReader::default();

        let err = VolumeLoader::load_sub_series(&sub, Orientation::Axial, &empty).unwrap_err();
        assert!(matches!(err, VolumeLoaderError::Slice { ref path, .. } if path == &PathBuf::from("a")));
    }
}
