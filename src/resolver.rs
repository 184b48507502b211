//! Orders diffusion sub-series whose strength could not be decoded.
//!
//! When a series holds two or more placeholder (`Unknown`, `Unknown-1`,
//! ...) sub-series, their partition is an accident of file order: the
//! classifier only split them because positions collided. At every
//! position the candidate images are ranked by descending
//! (maximum, mean) intensity, the assumption being that signal attenuates
//! as strength grows, and rank `i` is assigned to the `i`-th placeholder
//! slot. The heuristic is empirical; nothing verifies it against the real
//! strengths.

use std::cmp::Ordering;

use log::info;
use serde_json::json;

use crate::classifier::{ClassifiedSeries, SubSeries};
use crate::ledger::{AnomalyKind, AnomalyLedger};
use crate::slice::SliceReader;
use crate::strength::SubSeriesKey;

/// Intensity statistics of one candidate image at one position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankedSlice {
    pub from: SubSeriesKey,
    pub to: SubSeriesKey,
    pub max: f32,
    pub mean: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionAssignment {
    pub coordinate: f64,
    /// Candidates in rank order.
    pub ranked: Vec<RankedSlice>,
}

/// Key reassignment for the placeholder sub-series of one series.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Resolution {
    /// Placeholder slots receiving ranked images, in rank order.
    pub slots: Vec<SubSeriesKey>,
    /// Placeholders left out for having fewer slices than the others.
    pub excluded: Vec<SubSeriesKey>,
    /// Excluded key kept for representative selection when every
    /// sub-series is a placeholder.
    pub tie_break: Option<SubSeriesKey>,
    pub assignments: Vec<PositionAssignment>,
}

pub struct StrengthResolver;

impl StrengthResolver {
    /// Computes the reassignment without touching `series`. `None` when
    /// fewer than two placeholder sub-series exist.
    pub fn resolve(
        series: &ClassifiedSeries,
        reader: &dyn SliceReader,
        ledger: &AnomalyLedger,
    ) -> Option<Resolution> {
        let mut placeholders: Vec<&SubSeries> = series
            .sub_series
            .iter()
            .filter(|s| s.key.is_unknown())
            .collect();
        if placeholders.len() < 2 {
            return None;
        }
        placeholders.sort_by_key(|s| s.key);

        let context = &series.context;
        let ledger_key = context.key();
        let slice_len = placeholders.iter().map(|s| s.len()).max().unwrap_or(0);
        let (retained, excluded): (Vec<&SubSeries>, Vec<&SubSeries>) =
            placeholders.iter().copied().partition(|s| s.len() == slice_len);

        let tie_break = excluded
            .iter()
            .copied()
            .fold(None::<&SubSeries>, |best, s| match best {
                Some(b) if b.len() > s.len() => Some(b),
                _ => Some(s),
            })
            .map(|s| s.key);

        if !excluded.is_empty() {
            let counts: serde_json::Map<_, _> = placeholders
                .iter()
                .map(|s| (s.key.to_string(), json!(s.len())))
                .collect();
            ledger.record(
                AnomalyKind::DwiMultiSeriesNotSameSliceNumber,
                ledger_key.clone(),
                json!({
                    "slice_counts": counts,
                    "excluded": excluded.iter().map(|s| s.key.to_string()).collect::<Vec<_>>(),
                }),
            );
        }

        let slots: Vec<SubSeriesKey> = retained.iter().map(|s| s.key).collect();
        let mut assignments = Vec::new();
        let mut unranked = Vec::new();

        if let Some(first) = retained.first() {
            for coordinate in first.coordinates() {
                let candidates: Option<Vec<_>> = retained
                    .iter()
                    .map(|s| s.at(coordinate).map(|placed| (s.key, placed)))
                    .collect();
                let Some(candidates) = candidates else {
                    unranked.push(coordinate);
                    continue;
                };

                let mut stats = Vec::with_capacity(candidates.len());
                for (key, placed) in candidates {
                    match reader.read_pixels(&placed.header.path) {
                        Ok(pixels) => {
                            let max = pixels.iter().copied().fold(f32::MIN, f32::max);
                            let mean = pixels.mean().unwrap_or(0.0);
                            stats.push((key, max, mean));
                        }
                        Err(err) => {
                            ledger.record(
                                AnomalyKind::UnreadableSlice,
                                placed.header.path.display().to_string(),
                                json!({ "series_uid": context.series_uid, "error": err.to_string() }),
                            );
                            break;
                        }
                    }
                }
                if stats.len() != slots.len() {
                    unranked.push(coordinate);
                    continue;
                }

                stats.sort_by(|a, b| descending_max_then_mean((a.1, a.2), (b.1, b.2)));
                let ranked = stats
                    .into_iter()
                    .zip(&slots)
                    .map(|((from, max, mean), to)| RankedSlice {
                        from,
                        to: *to,
                        max,
                        mean,
                    })
                    .collect();
                assignments.push(PositionAssignment { coordinate, ranked });
            }
        }

        let moved = assignments
            .iter()
            .flat_map(|a| &a.ranked)
            .filter(|r| r.from != r.to)
            .count();
        info!("{context}: ranked {} positions of {} placeholder sub-series", assignments.len(), slots.len());
        ledger.record(
            AnomalyKind::UnknownBValueReordered,
            ledger_key,
            json!({
                "slots": slots.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
                "positions": assignments.len(),
                "moved_images": moved,
                "unranked_positions": unranked,
            }),
        );

        Some(Resolution {
            slots,
            excluded: excluded.iter().map(|s| s.key).collect(),
            tie_break,
            assignments,
        })
    }

    /// Moves every ranked image into its assigned slot.
    pub fn apply(mut series: ClassifiedSeries, resolution: &Resolution) -> ClassifiedSeries {
        for assignment in &resolution.assignments {
            let moves: Vec<_> = assignment
                .ranked
                .iter()
                .filter_map(|r| {
                    let placed = series.get(&r.from)?.at(assignment.coordinate)?.clone();
                    Some((r.to, placed))
                })
                .collect();
            for (to, placed) in moves {
                if let Some(slot) = series
                    .sub_series
                    .iter_mut()
                    .find(|s| s.key == to)
                    .and_then(|s| s.at_mut(assignment.coordinate))
                {
                    *slot = placed;
                }
            }
        }
        series
    }
}

fn descending_max_then_mean(a: (f32, f32), b: (f32, f32)) -> Ordering {
    b.0.total_cmp(&a.0).then(b.1.total_cmp(&a.1))
}
