//! Raster stack contract: realized [time, band, y, x] arrays.

use chrono::NaiveDate;
use ndarray::Array4;

use crate::catalog::SceneRecord;
use crate::config::SensorId;
use crate::error::StackError;
use crate::grid::{Bounds, GridSpec};

/// Requested bounds, either geographic (seed of the anchor grid) or
/// projected (the authoritative bbox handed to secondary sensors).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoundsSpec {
    Geographic(Bounds),
    Projected(Bounds),
}

/// How same-sensor acquisitions collapse onto the time axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalMerge {
    /// One time step per acquisition date; same-date scenes composite
    /// first-valid.
    PerDate,
    /// All dates collapse to a single median composite (static layers).
    Median,
}

/// One stack build request.
#[derive(Debug, Clone)]
pub struct StackRequest {
    pub sensor: SensorId,
    /// Date-grouped scenes, ascending by date.
    pub scenes: Vec<(NaiveDate, Vec<SceneRecord>)>,
    pub bands: Vec<String>,
    pub epsg: u32,
    pub resolution: f64,
    pub bounds: BoundsSpec,
    pub merge: TemporalMerge,
}

/// Realized multi-temporal multi-band raster. `NaN` marks missing data.
#[derive(Debug, Clone)]
pub struct RasterStack {
    pub sensor: SensorId,
    /// [time, band, y, x]; row 0 is the northernmost row.
    pub data: Array4<f32>,
    pub bands: Vec<String>,
    pub dates: Vec<NaiveDate>,
    pub grid: GridSpec,
}

impl RasterStack {
    pub fn band_index(&self, band: &str) -> Option<usize> {
        self.bands.iter().position(|b| b == band)
    }

    /// Drop one band (the cloud band after masking).
    pub fn remove_band(&mut self, band: &str) {
        if let Some(idx) = self.band_index(band) {
            let keep: Vec<usize> = (0..self.bands.len()).filter(|i| *i != idx).collect();
            self.data = self.data.select(ndarray::Axis(1), &keep);
            self.bands.remove(idx);
        }
    }

    pub fn time_steps(&self) -> usize {
        self.data.shape()[0]
    }
}

/// Raster stack collaborator. The returned stack is fully realized;
/// everything downstream depends on that barrier.
pub trait StackBuilder {
    fn build(&self, request: &StackRequest) -> Result<RasterStack, StackError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn remove_band_drops_data_and_name() {
        let mut data = Array4::<f32>::zeros((2, 3, 4, 4));
        data.index_axis_mut(ndarray::Axis(1), 1).fill(7.0);
        let mut stack = RasterStack {
            sensor: SensorId::Sentinel2,
            data,
            bands: vec!["B02".into(), "SCL".into(), "B08".into()],
            dates: vec![
                NaiveDate::from_ymd_opt(2023, 2, 10).unwrap(),
                NaiveDate::from_ymd_opt(2023, 5, 1).unwrap(),
            ],
            grid: GridSpec::snap(32633, 10.0, Bounds::new(0.0, 0.0, 40.0, 40.0)),
        };
        stack.remove_band("SCL");
        assert_eq!(stack.bands, vec!["B02", "B08"]);
        assert_eq!(stack.data.shape(), &[2, 2, 4, 4]);
        assert!(stack.data.iter().all(|v| *v == 0.0));
        assert_eq!(stack.time_steps(), 2);
    }
}
