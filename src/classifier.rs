//! Groups the slice files of one series into sub-series and rejects
//! duplicate acquisitions.

use std::path::PathBuf;

use log::debug;
use serde_json::json;

use crate::context::SeriesContext;
use crate::enums::{Orientation, SequenceKind};
use crate::ledger::{AnomalyKind, AnomalyLedger};
use crate::slice::{SliceHeader, SliceReader};
use crate::strength::{KeyBase, StrengthReading, SubSeriesKey, read_strength};

/// Two slices closer than this along the assembly axis (mm) occupy the
/// same position.
pub const POSITION_TOLERANCE: f64 = 1e-4;

/// A slice together with its coordinate along the assembly axis.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedSlice {
    pub coordinate: f64,
    pub header: SliceHeader,
}

/// Slices of one sub-series, kept in strictly increasing coordinate order.
#[derive(Debug, Clone, PartialEq)]
pub struct SubSeries {
    pub key: SubSeriesKey,
    slices: Vec<PlacedSlice>,
}

impl SubSeries {
    pub fn new(key: SubSeriesKey) -> Self {
        Self {
            key,
            slices: Vec::new(),
        }
    }

    pub fn slices(&self) -> &[PlacedSlice] {
        &self.slices
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn at(&self, coordinate: f64) -> Option<&PlacedSlice> {
        self.slices
            .iter()
            .find(|s| (s.coordinate - coordinate).abs() < POSITION_TOLERANCE)
    }

    pub(crate) fn at_mut(&mut self, coordinate: f64) -> Option<&mut PlacedSlice> {
        self.slices
            .iter_mut()
            .find(|s| (s.coordinate - coordinate).abs() < POSITION_TOLERANCE)
    }

    /// Inserts in coordinate order. Returns the slice back if the position
    /// is already taken.
    pub fn insert(&mut self, slice: PlacedSlice) -> Result<(), PlacedSlice> {
        if self.at(slice.coordinate).is_some() {
            return Err(slice);
        }
        let index = self
            .slices
            .partition_point(|s| s.coordinate < slice.coordinate);
        self.slices.insert(index, slice);
        Ok(())
    }

    pub fn coordinates(&self) -> impl Iterator<Item = f64> + '_ {
        self.slices.iter().map(|s| s.coordinate)
    }
}

/// Outcome of classifying one series.
#[derive(Debug, Clone)]
pub struct ClassifiedSeries {
    pub context: SeriesContext,
    pub sequence: SequenceKind,
    /// Dominant plane, whose normal is the assembly axis.
    pub plane: Orientation,
    /// Every plane observed, in encounter order.
    pub planes_seen: Vec<Orientation>,
    /// Sub-series in the order their keys were first created.
    pub sub_series: Vec<SubSeries>,
    pub rescale_type: Option<String>,
    /// Display form of every decoded key, in encounter order.
    pub decoded_strengths: Vec<String>,
    /// Raw strength values as found, for auditing the decoding.
    pub raw_strengths: Vec<String>,
    /// Files that were read but kept in no sub-series.
    pub rejected: Vec<PathBuf>,
}

impl ClassifiedSeries {
    pub fn get(&self, key: &SubSeriesKey) -> Option<&SubSeries> {
        self.sub_series.iter().find(|s| s.key == *key)
    }

    pub fn keys(&self) -> Vec<SubSeriesKey> {
        self.sub_series.iter().map(|s| s.key).collect()
    }

    fn get_or_create(&mut self, key: SubSeriesKey) -> &mut SubSeries {
        let index = match self.sub_series.iter().position(|s| s.key == key) {
            Some(index) => index,
            None => {
                self.sub_series.push(SubSeries::new(key));
                self.sub_series.len() - 1
            }
        };
        &mut self.sub_series[index]
    }
}

pub struct SliceClassifier;

impl SliceClassifier {
    /// Partitions `paths` into sub-series keyed by diffusion strength (or a
    /// single not-applicable key), ordered along the dominant plane normal.
    ///
    /// Unreadable files, off-plane slices, duplicates and unresolved
    /// collisions are logged to `ledger` and left out; nothing here aborts
    /// the series. `declared_strength` is the index's diffusion value, kept
    /// in the ledger when a slice's own strength cannot be decoded.
    pub fn classify(
        context: &SeriesContext,
        sequence: &SequenceKind,
        paths: &[PathBuf],
        declared_strength: Option<&str>,
        reader: &dyn SliceReader,
        ledger: &AnomalyLedger,
    ) -> ClassifiedSeries {
        let headers = Self::read_headers(context, paths, reader, ledger);
        let (plane, planes_seen) = Self::dominant_plane(context, &headers, ledger);

        let mut series = ClassifiedSeries {
            context: context.clone(),
            sequence: sequence.clone(),
            plane,
            planes_seen,
            sub_series: Vec::new(),
            rescale_type: None,
            decoded_strengths: Vec::new(),
            raw_strengths: Vec::new(),
            rejected: Vec::new(),
        };

        for (header, position) in headers {
            if let Some(other) = header.plane().filter(|p| *p != plane) {
                ledger.record(
                    AnomalyKind::OffPlaneSlice,
                    header.path.display().to_string(),
                    json!({
                        "series_uid": context.series_uid,
                        "plane": other.as_str(),
                        "dominant": plane.as_str(),
                    }),
                );
                series.rejected.push(header.path);
                continue;
            }
            let coordinate = position[plane.axis()];
            let base = if sequence.is_diffusion_weighted() {
                Self::strength_key(context, &header, declared_strength, &mut series, ledger)
            } else {
                KeyBase::NotApplicable
            };
            let rescale_type = header.rescale_type.clone();
            let placed = PlacedSlice { coordinate, header };

            let inserted = if sequence.is_diffusion_weighted() {
                Self::insert_diffusion(context, base, placed, &mut series, reader, ledger)
            } else {
                Self::insert_single(context, placed, &mut series, reader, ledger)
            };

            if let Some(key) = inserted {
                let key = key.to_string();
                if sequence.is_diffusion_weighted() && !series.decoded_strengths.contains(&key) {
                    series.decoded_strengths.push(key);
                }
                if series.rescale_type.is_none() {
                    series.rescale_type = rescale_type;
                }
            }
        }

        debug!(
            "{context}: {} sub-series, plane {}",
            series.sub_series.len(),
            series.plane
        );
        series
    }

    fn read_headers(
        context: &SeriesContext,
        paths: &[PathBuf],
        reader: &dyn SliceReader,
        ledger: &AnomalyLedger,
    ) -> Vec<(SliceHeader, [f64; 3])> {
        paths
            .iter()
            .filter_map(|path| {
                let key = path.display().to_string();
                let header = match reader.read_header(path) {
                    Ok(header) => header,
                    Err(err) => {
                        ledger.record(
                            AnomalyKind::UnreadableSlice,
                            key,
                            json!({ "series_uid": context.series_uid, "error": err.to_string() }),
                        );
                        return None;
                    }
                };
                let Some(position) = header.position else {
                    ledger.record(
                        AnomalyKind::MissingPosition,
                        key,
                        json!({ "series_uid": context.series_uid }),
                    );
                    return None;
                };
                Some((header, position))
            })
            .collect()
    }

    /// Most frequent plane, ties going to the first one seen. Slices
    /// without orientation count as axial.
    fn dominant_plane(
        context: &SeriesContext,
        headers: &[(SliceHeader, [f64; 3])],
        ledger: &AnomalyLedger,
    ) -> (Orientation, Vec<Orientation>) {
        let mut counts: Vec<(Orientation, usize)> = Vec::new();
        let mut missing = 0usize;
        for (header, _) in headers {
            let plane = header.plane().unwrap_or_else(|| {
                missing += 1;
                Orientation::Axial
            });
            match counts.iter_mut().find(|(p, _)| *p == plane) {
                Some((_, count)) => *count += 1,
                None => counts.push((plane, 1)),
            }
        }

        if missing > 0 {
            ledger.record(
                AnomalyKind::MissingOrientation,
                &context.series_uid,
                json!({ "slices": missing, "assumed": Orientation::Axial.as_str() }),
            );
        }

        let planes_seen: Vec<_> = counts.iter().map(|(p, _)| *p).collect();
        if planes_seen.len() > 1 {
            let names: Vec<_> = planes_seen.iter().map(|p| p.as_str()).collect();
            ledger.record(AnomalyKind::MultiplePlanesFound, &context.series_uid, json!(names));
        }

        let dominant = counts
            .iter()
            .fold(None::<(Orientation, usize)>, |best, &(plane, count)| match best {
                Some((_, best_count)) if best_count >= count => best,
                _ => Some((plane, count)),
            })
            .map(|(plane, _)| plane)
            .unwrap_or(Orientation::Axial);

        (dominant, planes_seen)
    }

    fn strength_key(
        context: &SeriesContext,
        header: &SliceHeader,
        declared_strength: Option<&str>,
        series: &mut ClassifiedSeries,
        ledger: &AnomalyLedger,
    ) -> KeyBase {
        for (_, raw) in &header.diffusion_tags {
            let raw = raw.to_string();
            if !series.raw_strengths.contains(&raw) {
                series.raw_strengths.push(raw);
            }
        }
        match read_strength(&header.diffusion_tags) {
            StrengthReading::Decoded { value, .. } => KeyBase::Strength(value),
            StrengthReading::Undecodable { tried } => {
                ledger.record(
                    AnomalyKind::MissingBValue,
                    header.path.display().to_string(),
                    json!({
                        "series_uid": context.series_uid,
                        "tried": tried,
                        "index_strength": declared_strength,
                    }),
                );
                KeyBase::Unknown
            }
        }
    }

    fn insert_single(
        context: &SeriesContext,
        placed: PlacedSlice,
        series: &mut ClassifiedSeries,
        reader: &dyn SliceReader,
        ledger: &AnomalyLedger,
    ) -> Option<SubSeriesKey> {
        let key = SubSeriesKey::NOT_APPLICABLE;
        let sub = series.get_or_create(key);
        let placed = match sub.insert(placed) {
            Ok(()) => return Some(key),
            Err(placed) => placed,
        };
        let occupant = sub.at(placed.coordinate).map(|s| s.header.path.clone());
        let path = placed.header.path.clone();
        if let Some(occupant) = occupant {
            match Self::same_pixels(context, &path, &occupant, reader, ledger) {
                Some(true) => Self::log_duplicate(context, key, &path, &occupant, ledger),
                Some(false) => ledger.record(
                    AnomalyKind::SameOriginFound,
                    path.display().to_string(),
                    json!({
                        "series_uid": context.series_uid,
                        "kept": occupant.display().to_string(),
                        "coordinate": placed.coordinate,
                        "reason": "No Duplicate Image",
                    }),
                ),
                None => {}
            }
        }
        series.rejected.push(path);
        None
    }

    /// Tries `base`, `base-1`, `base-2`, ... until the position is free or
    /// an identical image is found at it.
    fn insert_diffusion(
        context: &SeriesContext,
        base: KeyBase,
        mut placed: PlacedSlice,
        series: &mut ClassifiedSeries,
        reader: &dyn SliceReader,
        ledger: &AnomalyLedger,
    ) -> Option<SubSeriesKey> {
        let path = placed.header.path.clone();
        let mut suffix = 0;
        loop {
            let key = SubSeriesKey { base, suffix };
            let sub = series.get_or_create(key);
            placed = match sub.insert(placed) {
                Ok(()) => return Some(key),
                Err(placed) => placed,
            };
            let occupant = sub
                .at(placed.coordinate)
                .map(|s| s.header.path.clone())
                .unwrap_or_default();
            match Self::same_pixels(context, &path, &occupant, reader, ledger) {
                Some(true) => {
                    Self::log_duplicate(context, key, &path, &occupant, ledger);
                    break;
                }
                Some(false) => suffix += 1,
                None => break,
            }
        }
        series.rejected.push(path);
        None
    }

    /// `None` when either image could not be read; the failure is logged
    /// against `candidate`.
    fn same_pixels(
        context: &SeriesContext,
        candidate: &PathBuf,
        occupant: &PathBuf,
        reader: &dyn SliceReader,
        ledger: &AnomalyLedger,
    ) -> Option<bool> {
        let pixels = reader
            .read_pixels(candidate)
            .and_then(|a| reader.read_pixels(occupant).map(|b| a == b));
        match pixels {
            Ok(same) => Some(same),
            Err(err) => {
                ledger.record(
                    AnomalyKind::UnreadableSlice,
                    candidate.display().to_string(),
                    json!({
                        "series_uid": context.series_uid,
                        "compared_with": occupant.display().to_string(),
                        "error": err.to_string(),
                    }),
                );
                None
            }
        }
    }

    fn log_duplicate(
        context: &SeriesContext,
        key: SubSeriesKey,
        duplicate: &PathBuf,
        kept: &PathBuf,
        ledger: &AnomalyLedger,
    ) {
        ledger.record(
            AnomalyKind::DuplicateDetected,
            duplicate.display().to_string(),
            json!({
                "series_uid": context.series_uid,
                "sub_series": key.to_string(),
                "kept": kept.display().to_string(),
            }),
        );
    }
}
