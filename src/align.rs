//! Drives the stack builder per sensor on the authoritative grid.

use std::collections::BTreeMap;

use log::info;

use crate::config::{CloudMaskConfig, Config, SensorId};
use crate::error::{AoiError, StepError};
use crate::grid::{adjust_bbox_to_resolution, Bounds};
use crate::selector::SelectedScenes;
use crate::stack::{BoundsSpec, RasterStack, StackBuilder, StackRequest, TemporalMerge};

/// Realized stacks for one AOI, co-registered to the anchor grid.
#[derive(Debug)]
pub struct AlignedStacks {
    pub stacks: BTreeMap<SensorId, RasterStack>,
    /// The anchor's realized projected bounds; every other grid is
    /// derived from these, never snapped independently.
    pub authoritative: Bounds,
    pub anchor_epsg: u32,
}

pub struct GridAligner<'a> {
    builder: &'a dyn StackBuilder,
    config: &'a Config,
}

impl<'a> GridAligner<'a> {
    pub fn new(builder: &'a dyn StackBuilder, config: &'a Config) -> GridAligner<'a> {
        GridAligner { builder, config }
    }

    /// Build every sensor's stack. The anchor goes first from `seed`
    /// (the overlap bbox, or a prior run's authoritative bounds); its
    /// realized grid bounds then drive all other sensors.
    pub fn align(
        &self,
        selected: &SelectedScenes,
        seed: BoundsSpec,
        sensors: &[SensorId],
        temporal_steps: usize,
    ) -> Result<AlignedStacks, StepError> {
        let anchor = SensorId::ANCHOR;
        let anchor_stack = self.build_sensor(selected, anchor, seed, temporal_steps)?;
        let authoritative = anchor_stack.grid.bounds;
        let anchor_epsg = anchor_stack.grid.epsg;
        info!(
            "sensor={anchor} grid realized epsg={anchor_epsg} size={}x{} bounds=({:.1}, {:.1}, {:.1}, {:.1})",
            anchor_stack.grid.width,
            anchor_stack.grid.height,
            authoritative.min_x,
            authoritative.min_y,
            authoritative.max_x,
            authoritative.max_y,
        );

        let mut stacks = BTreeMap::new();
        for sensor in sensors {
            if *sensor == anchor {
                continue;
            }
            let resolution = self.config.platform(*sensor).resolution;
            let bounds =
                BoundsSpec::Projected(adjust_bbox_to_resolution(authoritative, resolution));
            let expected = if SensorId::TEMPORAL.contains(sensor) { temporal_steps } else { 1 };
            let stack = self.build_sensor(selected, *sensor, bounds, expected)?;
            stacks.insert(*sensor, stack);
        }
        stacks.insert(anchor, anchor_stack);

        Ok(AlignedStacks { stacks, authoritative, anchor_epsg })
    }

    fn build_sensor(
        &self,
        selected: &SelectedScenes,
        sensor: SensorId,
        bounds: BoundsSpec,
        expected_steps: usize,
    ) -> Result<RasterStack, StepError> {
        let platform = self.config.platform(sensor);
        let scenes = selected
            .scenes
            .get(&sensor)
            .ok_or(AoiError::SceneMissing {
                sensor,
                detail: "no matched scenes for stacking".to_string(),
            })?
            .clone();
        let epsg = if platform.native_crs {
            scenes
                .first()
                .and_then(|(_, group)| group.first())
                .and_then(|s| s.epsg)
                .unwrap_or(selected.anchor_epsg)
        } else {
            selected.anchor_epsg
        };
        let merge = if SensorId::TEMPORAL.contains(&sensor) {
            TemporalMerge::PerDate
        } else {
            TemporalMerge::Median
        };
        let request = StackRequest {
            sensor,
            scenes,
            bands: platform.bands.clone(),
            epsg,
            resolution: platform.resolution,
            bounds,
            merge,
        };
        info!("sensor={sensor} stacking {} date groups", request.scenes.len());
        let mut stack = self.builder.build(&request)?;

        if stack.bands.len() != platform.bands.len() || stack.time_steps() != expected_steps {
            return Err(AoiError::StackShapeMismatch {
                sensor,
                expected: format!("{} bands x {} steps", platform.bands.len(), expected_steps),
                actual: format!("{} bands x {} steps", stack.bands.len(), stack.time_steps()),
            }
            .into());
        }

        if let Some(mask) = &platform.cloud_mask {
            apply_cloud_mask(&mut stack, mask);
            stack.remove_band(mask.band());
        }
        Ok(stack)
    }
}

/// Mask cloudy pixels to NaN across all bands, per time step.
fn apply_cloud_mask(stack: &mut RasterStack, mask: &CloudMaskConfig) {
    let Some(cloud_idx) = stack.band_index(mask.band()) else {
        return;
    };
    let (steps, bands, height, width) = stack.data.dim();
    for t in 0..steps {
        for y in 0..height {
            for x in 0..width {
                let quality = stack.data[[t, cloud_idx, y, x]];
                if quality.is_nan() {
                    continue;
                }
                let cloudy = match mask {
                    CloudMaskConfig::Scl { classes, .. } => classes.contains(&(quality as u16)),
                    CloudMaskConfig::QaBits { bits, .. } => {
                        let bitmask: u16 = bits.iter().map(|b| 1u16 << b).sum();
                        (quality as u16) & bitmask != 0
                    }
                };
                if cloudy {
                    for b in 0..bands {
                        stack.data[[t, b, y, x]] = f32::NAN;
                    }
                }
            }
        }
    }
}
