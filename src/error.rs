use thiserror::Error;

use crate::config::SensorId;

/// Coordinate transform failures. Only UTM zones and geographic
/// coordinates are supported; anything else is rejected up front.
#[derive(Debug, Error)]
pub enum CrsError {
    #[error("unsupported EPSG code {0}")]
    UnsupportedEpsg(u32),
}

/// Scene catalog failures. These are collaborator faults and are fatal
/// to the run, not to a single AOI.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog request failed after {attempts} attempts: {detail}")]
    RetriesExhausted { attempts: u32, detail: String },
    #[error("catalog returned HTTP {code}: {detail}")]
    Http { code: u16, detail: String },
    #[error("malformed scene record: {0}")]
    Malformed(String),
    #[error("catalog I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raster stack builder failures, also fatal to the run.
#[derive(Debug, Error)]
pub enum StackError {
    #[error("scene asset missing: {0}")]
    AssetMissing(String),
    #[error("raster read failed: {0}")]
    Read(String),
    #[error("invalid stack request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Crs(#[from] CrsError),
    #[error("stack I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures that abort one AOI. The run records the status and moves on.
#[derive(Debug, Error)]
pub enum AoiError {
    #[error("{sensor} scenes missing: {detail}")]
    SceneMissing { sensor: SensorId, detail: String },
    #[error("no common overlap across sensor footprints")]
    OverlapMissing,
    #[error("{sensor} stack shape mismatch: expected {expected}, got {actual}")]
    StackShapeMismatch {
        sensor: SensorId,
        expected: String,
        actual: String,
    },
    #[error("fire pre/post dates missing from AOI properties")]
    FireDatesMissing,
    #[error(transparent)]
    Projection(#[from] CrsError),
}

impl AoiError {
    /// Status string persisted in the AOI ledger.
    pub fn status(&self) -> String {
        match self {
            AoiError::SceneMissing { sensor, .. } => format!("{sensor}_scenes_missing"),
            AoiError::OverlapMissing => "overlap_missing".to_string(),
            AoiError::StackShapeMismatch { sensor, .. } => {
                format!("{sensor}_stack_shape_mismatch")
            }
            AoiError::FireDatesMissing => "fire_dates_missing".to_string(),
            AoiError::Projection(_) => "projection_failed".to_string(),
        }
    }
}

/// Failures scoped to one chip candidate. Recorded as a failure row,
/// then processing continues with the next candidate.
#[derive(Debug, Error)]
pub enum ChipError {
    #[error("{sensor} has missing values in the sampling core")]
    MissingValues { sensor: SensorId },
    #[error("land cover class {class} outside the known set")]
    WrongClassValue { class: u8 },
    #[error("land cover block is flooded vegetation")]
    FloodedVegetation,
    #[error("class {class} quota reached")]
    ClassLimitReached { class: u8 },
    #[error("{sensor} valid in {hits} of 4 quarters")]
    CoverageIncomplete { sensor: SensorId, hits: usize },
    #[error("footprint projection failed: {0}")]
    Footprint(#[from] CrsError),
    #[error("artifact write failed: {0}")]
    Write(String),
}

impl ChipError {
    /// Status string persisted in the chip metadata table.
    pub fn status(&self) -> String {
        match self {
            ChipError::MissingValues { sensor } => format!("{sensor}_missing_values"),
            ChipError::WrongClassValue { .. } => "wrong_class_value".to_string(),
            ChipError::FloodedVegetation => "flooded_vegetation".to_string(),
            ChipError::ClassLimitReached { class } => format!("land_cover_{class}_limit"),
            ChipError::CoverageIncomplete { .. } => "coverage_incomplete".to_string(),
            ChipError::Footprint(_) => "footprint_failed".to_string(),
            ChipError::Write(_) => "write_failed".to_string(),
        }
    }

    /// Sensor the failure is attributed to, where one applies.
    pub fn sensor(&self) -> Option<SensorId> {
        match self {
            ChipError::MissingValues { sensor } | ChipError::CoverageIncomplete { sensor, .. } => {
                Some(*sensor)
            }
            ChipError::WrongClassValue { .. }
            | ChipError::FloodedVegetation
            | ChipError::ClassLimitReached { .. } => Some(SensorId::LandCover),
            ChipError::Footprint(_) | ChipError::Write(_) => None,
        }
    }
}

/// Error surface of one pipeline step: either an AOI-scoped failure or a
/// fatal collaborator fault that must stop the run.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Aoi(#[from] AoiError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Stack(#[from] StackError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aoi_status_strings() {
        let e = AoiError::SceneMissing {
            sensor: SensorId::Sentinel2,
            detail: "3/4 windows matched".into(),
        };
        assert_eq!(e.status(), "sentinel_2_scenes_missing");
        assert_eq!(AoiError::OverlapMissing.status(), "overlap_missing");
        let e = AoiError::StackShapeMismatch {
            sensor: SensorId::Landsat,
            expected: "5 bands x 4 steps".into(),
            actual: "5 bands x 3 steps".into(),
        };
        assert_eq!(e.status(), "landsat_stack_shape_mismatch");
    }

    #[test]
    fn chip_status_strings() {
        assert_eq!(
            ChipError::ClassLimitReached { class: 1 }.status(),
            "land_cover_1_limit"
        );
        assert_eq!(
            ChipError::MissingValues {
                sensor: SensorId::Sentinel1
            }
            .status(),
            "sentinel_1_missing_values"
        );
        assert_eq!(ChipError::FloodedVegetation.status(), "flooded_vegetation");
    }
}
