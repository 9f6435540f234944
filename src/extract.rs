//! Chip extraction: padded-window slicing, sampling-core validation,
//! radiometric harmonization, and finalization.

use chrono::NaiveDate;
use ndarray::Array4;

use crate::config::{ChipConfig, HarmonizeConfig, LandCoverPolicyConfig, PlatformConfig, SensorId};
use crate::crs;
use crate::error::ChipError;
use crate::grid::{Bounds, ChipLocation, ChipWindows};
use crate::stack::RasterStack;

/// One finalized chip for one sensor.
#[derive(Debug, Clone)]
pub struct ExtractedChip {
    pub sensor: SensorId,
    /// [time, band, y, x], sentinel-filled and ready to cast on write.
    pub data: Array4<f32>,
    pub dates: Vec<NaiveDate>,
    pub epsg: u32,
    /// EPSG:4326 footprint of the full chip extent, as WKT.
    pub footprint_wkt: String,
    pub windows: ChipWindows,
}

/// Extract one chip covering every time step of the stack. Used by the
/// general dataset, where a single bad step fails the whole chip.
pub fn extract_chip(
    stack: &RasterStack,
    authoritative: &Bounds,
    location: &ChipLocation,
    chips: &ChipConfig,
    platform: &PlatformConfig,
) -> Result<ExtractedChip, ChipError> {
    extract_steps(stack, authoritative, location, chips, platform, None)
}

/// Extract a single time step (one quarter of a fire-mode stack). The
/// quarters of one location fail independently.
pub fn extract_quarter(
    stack: &RasterStack,
    authoritative: &Bounds,
    location: &ChipLocation,
    chips: &ChipConfig,
    platform: &PlatformConfig,
    quarter: usize,
) -> Result<ExtractedChip, ChipError> {
    extract_steps(stack, authoritative, location, chips, platform, Some(quarter))
}

fn extract_steps(
    stack: &RasterStack,
    authoritative: &Bounds,
    location: &ChipLocation,
    chips: &ChipConfig,
    platform: &PlatformConfig,
    step: Option<usize>,
) -> Result<ExtractedChip, ChipError> {
    let (window, cw) = location.window(authoritative, &stack.grid, chips.chip_size, chips.sample_size);
    let steps: Vec<usize> = match step {
        Some(t) => vec![t],
        None => (0..stack.time_steps()).collect(),
    };
    let dates: Vec<NaiveDate> = steps.iter().map(|t| stack.dates[*t]).collect();
    let bands = stack.bands.len();

    // Out-of-raster margins of the padded window stay NaN until the
    // sentinel fill; the sampling core must come entirely from data.
    let mut data = Array4::<f32>::from_elem((steps.len(), bands, cw.chip_px, cw.chip_px), f32::NAN);
    let (_, _, height, width) = stack.data.dim();
    for (out_t, t) in steps.iter().enumerate() {
        for b in 0..bands {
            for out_y in 0..cw.chip_px {
                let src_y = window.row0 + out_y as isize;
                if src_y < 0 || src_y >= height as isize {
                    continue;
                }
                for out_x in 0..cw.chip_px {
                    let src_x = window.col0 + out_x as isize;
                    if src_x < 0 || src_x >= width as isize {
                        continue;
                    }
                    data[[out_t, b, out_y, out_x]] =
                        stack.data[[*t, b, src_y as usize, src_x as usize]];
                }
            }
        }
    }

    validate_core(&data, &cw, stack.sensor)?;
    if let Some(config) = &platform.harmonize {
        harmonize(&mut data, &dates, &stack.bands, config);
    }
    data.mapv_inplace(|v| if v.is_nan() { platform.na_value } else { v });

    let chip_bounds = location.chip_bounds(authoritative, chips.chip_size, chips.sample_size);
    let footprint = crs::bounds_to_wgs84(stack.grid.epsg, &chip_bounds)?;
    Ok(ExtractedChip {
        sensor: stack.sensor,
        data,
        dates,
        epsg: stack.grid.epsg,
        footprint_wkt: crs::wkt_polygon(&footprint),
        windows: cw,
    })
}

/// The central sampling core must contain no NaN and no all-zero row
/// or column for any time step and band.
fn validate_core(data: &Array4<f32>, cw: &ChipWindows, sensor: SensorId) -> Result<(), ChipError> {
    let pad = cw.pad_px;
    let core = data.slice(ndarray::s![
        ..,
        ..,
        pad..pad + cw.sample_px,
        pad..pad + cw.sample_px
    ]);
    if core.iter().any(|v| v.is_nan()) {
        return Err(ChipError::MissingValues { sensor });
    }
    let (steps, bands, _, _) = data.dim();
    for t in 0..steps {
        for b in 0..bands {
            let plane = core.slice(ndarray::s![t, b, .., ..]);
            let zero_col = (0..cw.sample_px)
                .any(|x| (0..cw.sample_px).all(|y| plane[[y, x]] == 0.0));
            let zero_row = (0..cw.sample_px)
                .any(|y| (0..cw.sample_px).all(|x| plane[[y, x]] == 0.0));
            if zero_col || zero_row {
                return Err(ChipError::MissingValues { sensor });
            }
        }
    }
    Ok(())
}

/// Remove the processing-baseline offset from spectral bands of
/// acquisitions at or after the cutover date, keeping pre- and
/// post-cutover values numerically comparable. NaN pixels pass through.
pub fn harmonize(
    data: &mut Array4<f32>,
    dates: &[NaiveDate],
    bands: &[String],
    config: &HarmonizeConfig,
) {
    let offset = config.offset;
    for (t, date) in dates.iter().enumerate() {
        if *date < config.cutover {
            continue;
        }
        for (b, band) in bands.iter().enumerate() {
            if !config.bands.contains(band) {
                continue;
            }
            data.slice_mut(ndarray::s![t, b, .., ..])
                .mapv_inplace(|v| if v.is_nan() { v } else { v.max(offset) - offset });
        }
    }
}

/// Check the sampling core of an extracted land-cover chip against the
/// class policy and return its class.
pub fn classify_core(
    chip: &ExtractedChip,
    policy: &LandCoverPolicyConfig,
) -> Result<u8, ChipError> {
    let cw = &chip.windows;
    let core = chip.data.slice(ndarray::s![
        0,
        0,
        cw.pad_px..cw.pad_px + cw.sample_px,
        cw.pad_px..cw.pad_px + cw.sample_px
    ]);
    let mut class: Option<u8> = None;
    for v in core.iter() {
        let value = *v as u8;
        if !policy.is_known(value) {
            return Err(ChipError::WrongClassValue { class: value });
        }
        match class {
            None => class = Some(value),
            // A selection-stage uniform block stays uniform here; any
            // drift means the raster changed under us.
            Some(c) if c != value => {
                return Err(ChipError::WrongClassValue { class: value })
            }
            Some(_) => {}
        }
    }
    let class = class.ok_or(ChipError::MissingValues { sensor: SensorId::LandCover })?;
    if policy.rejected_classes.contains(&class) {
        return Err(ChipError::FloodedVegetation);
    }
    Ok(class)
}
