//! Common spatial coverage across all matched sensor/date footprints.

use geo::{BooleanOps, BoundingRect, MultiPolygon};

use crate::error::AoiError;
use crate::grid::Bounds;
use crate::selector::SelectedScenes;

/// Union footprints within each (sensor, date) group, then intersect
/// across groups by pairwise reduction. Empty intersection means the
/// matched swaths share no ground and the AOI cannot be aligned.
pub fn resolve(selected: &SelectedScenes) -> Result<MultiPolygon<f64>, AoiError> {
    let mut groups: Vec<MultiPolygon<f64>> = Vec::new();
    for scenes in selected.scenes.values() {
        for (_, group) in scenes {
            let mut union: Option<MultiPolygon<f64>> = None;
            for scene in group {
                let footprint = MultiPolygon::new(vec![scene.footprint.clone()]);
                union = Some(match union {
                    Some(u) => u.union(&footprint),
                    None => footprint,
                });
            }
            if let Some(u) = union {
                groups.push(u);
            }
        }
    }

    let mut overlap = match groups.split_first() {
        Some((first, rest)) => {
            let mut acc = first.clone();
            for group in rest {
                acc = acc.intersection(group);
                if acc.0.is_empty() {
                    return Err(AoiError::OverlapMissing);
                }
            }
            acc
        }
        None => return Err(AoiError::OverlapMissing),
    };
    overlap.0.retain(|p| p.bounding_rect().is_some());
    if overlap.0.is_empty() {
        return Err(AoiError::OverlapMissing);
    }
    Ok(overlap)
}

/// Geographic bounding box of the overlap polygon; this seeds the
/// anchor sensor's grid build.
pub fn overlap_bounds(overlap: &MultiPolygon<f64>) -> Result<Bounds, AoiError> {
    overlap
        .bounding_rect()
        .map(Bounds::from_rect)
        .ok_or(AoiError::OverlapMissing)
}
