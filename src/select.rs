//! Chip-candidate enumeration: land-cover uniformity blocks (general
//! dataset) and burn-fraction windows (fire dataset).

use geo::{Contains, MultiPolygon, Point, Polygon};
use log::info;
use ndarray::Array2;
use rayon::prelude::*;

use crate::config::ChipConfig;
use crate::crs;
use crate::error::CrsError;
use crate::grid::{chip_windows, ChipLocation, GridSpec};
use crate::stack::RasterStack;

/// One qualifying land-cover block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LandCoverCandidate {
    pub block_row: usize,
    pub block_col: usize,
    /// The single class value filling the block.
    pub class: u8,
    pub location: ChipLocation,
}

/// Partition the land-cover raster into non-overlapping sampling-size
/// blocks; a block qualifies iff its min and max class are equal and
/// non-zero. Candidates come back in row-major order.
pub fn land_cover_candidates(stack: &RasterStack, chips: &ChipConfig) -> Vec<LandCoverCandidate> {
    let sample_px = chip_windows(chips.chip_size, chips.sample_size, stack.grid.resolution).sample_px;
    let (_, _, height, width) = stack.data.dim();
    let block_rows = height / sample_px;
    let block_cols = width / sample_px;
    let layer = stack.data.index_axis(ndarray::Axis(0), 0);
    let layer = layer.index_axis(ndarray::Axis(0), 0);

    let rows: Vec<Vec<LandCoverCandidate>> = (0..block_rows)
        .into_par_iter()
        .map(|block_row| {
            let mut row = Vec::new();
            for block_col in 0..block_cols {
                let block = layer.slice(ndarray::s![
                    block_row * sample_px..(block_row + 1) * sample_px,
                    block_col * sample_px..(block_col + 1) * sample_px
                ]);
                let mut min = f32::INFINITY;
                let mut max = f32::NEG_INFINITY;
                let mut any_nan = false;
                for v in block.iter() {
                    if v.is_nan() {
                        any_nan = true;
                        break;
                    }
                    min = min.min(*v);
                    max = max.max(*v);
                }
                if any_nan || min != max || min <= 0.0 || min > 255.0 {
                    continue;
                }
                row.push(LandCoverCandidate {
                    block_row,
                    block_col,
                    class: min as u8,
                    location: ChipLocation::from_block(block_row, block_col, chips.sample_size),
                });
            }
            row
        })
        .collect();
    let candidates: Vec<LandCoverCandidate> = rows.into_iter().flatten().collect();
    info!(
        "land cover blocks {}x{} yielded {} uniform candidates",
        block_rows,
        block_cols,
        candidates.len()
    );
    candidates
}

/// Rasterize the AOI polygon onto a projected grid: 1 where the pixel
/// center falls inside the polygon, 0 elsewhere.
pub fn rasterize_aoi_mask(aoi: &Polygon<f64>, grid: &GridSpec) -> Result<Array2<f32>, CrsError> {
    let projected =
        crs::project_multi_polygon(grid.epsg, &MultiPolygon::new(vec![aoi.clone()]))?;
    let (height, width) = (grid.height, grid.width);
    let rows: Vec<Vec<f32>> = (0..height)
        .into_par_iter()
        .map(|row| {
            (0..width)
                .map(|col| {
                    let (x, y) = grid.pixel_center(row, col);
                    if projected.contains(&Point::new(x, y)) {
                        1.0
                    } else {
                        0.0
                    }
                })
                .collect()
        })
        .collect();
    Ok(Array2::from_shape_vec((height, width), rows.concat()).expect("rows match shape"))
}

/// Slide a chip-size window over the burn mask at `stride_m` (chip size
/// when unset) and keep windows whose mean is at least `burn_fraction`.
/// Locations are physical offsets, so each sensor derives its own pixel
/// window from them independently.
pub fn burn_candidates(
    mask: &Array2<f32>,
    grid: &GridSpec,
    chips: &ChipConfig,
    burn_fraction: f64,
    stride_m: Option<f64>,
) -> Vec<ChipLocation> {
    let resolution = grid.resolution;
    let chip_px = (chips.chip_size / resolution) as usize;
    let stride_px = ((stride_m.unwrap_or(chips.chip_size) / resolution) as usize).max(1);
    let pad_m = (chips.chip_size - chips.sample_size) / 2.0;
    let (height, width) = mask.dim();
    if chip_px == 0 || height < chip_px || width < chip_px {
        return Vec::new();
    }

    let mut locations = Vec::new();
    let mut y0 = 0;
    while y0 + chip_px <= height {
        let mut x0 = 0;
        while x0 + chip_px <= width {
            let window = mask.slice(ndarray::s![y0..y0 + chip_px, x0..x0 + chip_px]);
            let mean = f64::from(window.sum()) / (chip_px * chip_px) as f64;
            if mean >= burn_fraction {
                locations.push(ChipLocation {
                    off_x: x0 as f64 * resolution + pad_m,
                    off_y: y0 as f64 * resolution + pad_m,
                });
            }
            x0 += stride_px;
        }
        y0 += stride_px;
    }
    info!(
        "burn mask {}x{} yielded {} candidate windows (threshold {burn_fraction})",
        height,
        width,
        locations.len()
    );
    locations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SensorId;
    use crate::grid::Bounds;
    use chrono::NaiveDate;
    use ndarray::Array4;

    fn lc_stack(values: Array2<f32>) -> RasterStack {
        let (h, w) = values.dim();
        let data = values.into_shape_with_order((1, 1, h, w)).expect("reshape");
        RasterStack {
            sensor: SensorId::LandCover,
            data,
            bands: vec!["data".into()],
            dates: vec![NaiveDate::from_ymd_opt(2023, 1, 1).unwrap()],
            grid: GridSpec::snap(
                32633,
                10.0,
                Bounds::new(0.0, 0.0, w as f64 * 10.0, h as f64 * 10.0),
            ),
        }
    }

    fn chips() -> ChipConfig {
        // 4 px sampling core, 6 px chip at 10 m.
        ChipConfig { sample_size: 40.0, chip_size: 60.0 }
    }

    #[test]
    fn uniform_nonzero_blocks_qualify_in_row_major_order() {
        let mut values = Array2::<f32>::zeros((8, 12));
        values.slice_mut(ndarray::s![0..4, 4..8]).fill(7.0); // block (0, 1)
        values.slice_mut(ndarray::s![4..8, 0..4]).fill(1.0); // block (1, 0)
        values.slice_mut(ndarray::s![4..8, 8..12]).fill(2.0); // block (1, 2)
        values[[5, 9]] = 5.0; // mixed block no longer uniform
        let candidates = land_cover_candidates(&lc_stack(values), &chips());
        let blocks: Vec<(usize, usize, u8)> = candidates
            .iter()
            .map(|c| (c.block_row, c.block_col, c.class))
            .collect();
        assert_eq!(blocks, vec![(0, 1, 7), (1, 0, 1)]);
        assert_eq!(candidates[0].location, ChipLocation { off_x: 40.0, off_y: 0.0 });
    }

    #[test]
    fn zero_and_nan_blocks_are_rejected() {
        let mut values = Array2::<f32>::zeros((4, 8));
        values.slice_mut(ndarray::s![0..4, 4..8]).fill(2.0);
        values[[1, 6]] = f32::NAN;
        assert!(land_cover_candidates(&lc_stack(values), &chips()).is_empty());
    }

    #[test]
    fn burn_windows_threshold_on_mean() {
        let grid = GridSpec::snap(32633, 10.0, Bounds::new(0.0, 0.0, 120.0, 60.0));
        let mut mask = Array2::<f32>::zeros((6, 12));
        mask.slice_mut(ndarray::s![.., 0..3]).fill(1.0); // left window half burnt
        mask[[0, 7]] = 1.0; // right window nearly empty
        let chips = chips();
        let locations = burn_candidates(&mask, &grid, &chips, 0.30, None);
        // 6 px chip, stride 6 px: windows at x0 = 0 and 6. Only the
        // first has mean >= 0.30 (18/36 = 0.5 vs 1/36).
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0], ChipLocation { off_x: 10.0, off_y: 10.0 });
    }

    #[test]
    fn stride_overrides_window_spacing() {
        let grid = GridSpec::snap(32633, 10.0, Bounds::new(0.0, 0.0, 120.0, 60.0));
        let mask = Array2::<f32>::ones((6, 12));
        let chips = chips();
        let locations = burn_candidates(&mask, &grid, &chips, 0.30, Some(30.0));
        // x0 = 0, 3, 6 fit a 6 px window in 12 columns.
        assert_eq!(locations.len(), 3);
    }

    #[test]
    fn aoi_mask_marks_interior_pixel_centers() {
        // 40 m square AOI in the middle of an 80 m grid.
        let grid = GridSpec::snap(32633, 10.0, Bounds::new(500000.0, 4100000.0, 500080.0, 4100080.0));
        let aoi_projected = Bounds::new(500020.0, 4100020.0, 500060.0, 4100060.0);
        let ring: Vec<(f64, f64)> = aoi_projected
            .corners()
            .iter()
            .chain(std::iter::once(&aoi_projected.corners()[0]))
            .map(|(x, y)| crs::unproject(32633, *x, *y).expect("utm"))
            .collect();
        let aoi = Polygon::new(geo::LineString::from(ring), vec![]);
        let mask = rasterize_aoi_mask(&aoi, &grid).expect("mask");
        assert_eq!(mask.dim(), (8, 8));
        let burnt = mask.sum();
        assert_eq!(burnt, 16.0, "4x4 interior pixel centers inside the AOI");
        assert_eq!(mask[[0, 0]], 0.0);
        assert_eq!(mask[[3, 3]], 1.0);
    }
}
