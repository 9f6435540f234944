//! Acceptance policies: per-class quotas (general) and the fire-mode
//! coverage gate.

use std::collections::BTreeMap;

use crate::config::SensorId;
use crate::error::ChipError;

/// Per-class accepted-chip counters, reset per AOI. A saturated class
/// rejects further candidates before any extraction work happens.
#[derive(Debug)]
pub struct ClassBalancer {
    quota: usize,
    counts: BTreeMap<u8, usize>,
}

impl ClassBalancer {
    pub fn new(quota: usize) -> ClassBalancer {
        ClassBalancer { quota, counts: BTreeMap::new() }
    }

    /// Fails once `quota` chips of the class have been accepted.
    pub fn check(&self, class: u8) -> Result<(), ChipError> {
        if self.counts.get(&class).copied().unwrap_or(0) >= self.quota {
            return Err(ChipError::ClassLimitReached { class });
        }
        Ok(())
    }

    /// Count one accepted chip. Called only after the full chip
    /// succeeded, so rejected candidates never consume quota.
    pub fn record(&mut self, class: u8) {
        *self.counts.entry(class).or_insert(0) += 1;
    }

    pub fn accepted(&self, class: u8) -> usize {
        self.counts.get(&class).copied().unwrap_or(0)
    }
}

/// Number of quarters in a covering year.
pub const QUARTERS: usize = 4;

/// Per-location fire-mode extraction outcomes, by sensor and quarter.
#[derive(Debug, Default)]
pub struct QuarterOutcomes {
    hits: BTreeMap<SensorId, [bool; QUARTERS]>,
}

impl QuarterOutcomes {
    pub fn record(&mut self, sensor: SensorId, quarter: usize, ok: bool) {
        self.hits.entry(sensor).or_default()[quarter] = ok;
    }

    pub fn hits(&self, sensor: SensorId) -> usize {
        self.hits
            .get(&sensor)
            .map(|q| q.iter().filter(|ok| **ok).count())
            .unwrap_or(0)
    }
}

/// The coverage gate: an event location counts only if every required
/// sensor has valid data in all four quarters.
#[derive(Debug)]
pub struct CoverageValidator {
    required: Vec<SensorId>,
}

impl CoverageValidator {
    pub fn new(required: Vec<SensorId>) -> CoverageValidator {
        CoverageValidator { required }
    }

    pub fn gate(&self, outcomes: &QuarterOutcomes) -> Result<(), ChipError> {
        for sensor in &self.required {
            let hits = outcomes.hits(*sensor);
            if hits < QUARTERS {
                return Err(ChipError::CoverageIncomplete { sensor: *sensor, hits });
            }
        }
        Ok(())
    }
}
