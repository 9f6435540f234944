//! The per-AOI processing loop tying selection, alignment, candidate
//! enumeration, extraction, and the run ledger together.

use anyhow::Context;
use chrono::{Datelike, NaiveDate};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use ndarray::Axis;
use thiserror::Error;

use crate::align::{AlignedStacks, GridAligner};
use crate::aoi::{AoiStatus, AreaOfInterest};
use crate::balance::{ClassBalancer, CoverageValidator, QuarterOutcomes, QUARTERS};
use crate::catalog::SceneCatalog;
use crate::config::{Config, DatasetMode, SensorId, TimeWindow, REQUIRED_WINDOWS};
use crate::error::{AoiError, ChipError, CrsError, StepError};
use crate::extract::{classify_core, extract_chip, extract_quarter, ExtractedChip};
use crate::grid::{adjust_bbox_to_resolution, Bounds, ChipLocation};
use crate::ledger::{ChipRow, RunLedger};
use crate::overlap;
use crate::select::{burn_candidates, land_cover_candidates, rasterize_aoi_mask, LandCoverCandidate};
use crate::selector::SceneSelector;
use crate::stack::{BoundsSpec, RasterStack, StackBuilder};
use crate::writer::{static_chip_name, temporal_chip_name, ChipWriter};

const PROGRESS_TEMPLATE: &str = "[{elapsed_precise}] {bar:40.cyan/blue} {pos:>3}/{len:3} {msg}";

/// Error surface of one AOI run. AOI-scoped failures transition the AOI
/// to a failed status; everything else stops the run.
#[derive(Debug, Error)]
enum RunError {
    #[error(transparent)]
    Step(#[from] StepError),
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl From<AoiError> for RunError {
    fn from(e: AoiError) -> RunError {
        RunError::Step(StepError::Aoi(e))
    }
}

impl From<CrsError> for RunError {
    fn from(e: CrsError) -> RunError {
        RunError::Step(StepError::Aoi(AoiError::Projection(e)))
    }
}

pub struct AoiProcessor<'a> {
    catalog: &'a dyn SceneCatalog,
    builder: &'a dyn StackBuilder,
    writer: &'a dyn ChipWriter,
    config: &'a Config,
}

impl<'a> AoiProcessor<'a> {
    pub fn new(
        catalog: &'a dyn SceneCatalog,
        builder: &'a dyn StackBuilder,
        writer: &'a dyn ChipWriter,
        config: &'a Config,
    ) -> AoiProcessor<'a> {
        AoiProcessor { catalog, builder, writer, config }
    }

    /// Process every pending AOI, transitioning its ledger status as it
    /// goes. AOI-scoped failures are recorded and the loop continues;
    /// catalog and stack faults abort the run.
    pub fn run(&self, ledger: &mut RunLedger) -> anyhow::Result<()> {
        let pending = ledger.pending();
        info!(
            "mode={:?} pending={} total={}",
            self.config.dataset.mode,
            pending.len(),
            ledger.aois().len()
        );
        let bar = ProgressBar::new(pending.len() as u64);
        bar.set_style(
            ProgressStyle::with_template(PROGRESS_TEMPLATE)
                .expect("progress template")
                .progress_chars("=>-"),
        );

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        for index in pending {
            bar.set_message(format!("aoi {index}"));
            ledger.mark(index, AoiStatus::Processing)?;
            let aoi = ledger.aois()[index].clone();
            match self.process_aoi(&aoi, ledger) {
                Ok(()) => {
                    ledger.mark(index, AoiStatus::Success)?;
                    succeeded += 1;
                }
                Err(RunError::Step(StepError::Aoi(e))) => {
                    warn!("aoi={index} failed: {e}");
                    ledger.mark(index, AoiStatus::Failed(e.status()))?;
                    failed += 1;
                }
                Err(RunError::Step(fatal)) => {
                    bar.abandon();
                    return Err(anyhow::Error::new(fatal))
                        .with_context(|| format!("processing aoi {index}"));
                }
                Err(RunError::Fatal(e)) => {
                    bar.abandon();
                    return Err(e.context(format!("processing aoi {index}")));
                }
            }
            bar.inc(1);
        }
        bar.finish_with_message("done");
        info!("run complete: succeeded={succeeded} failed={failed}");
        Ok(())
    }

    fn process_aoi(&self, aoi: &AreaOfInterest, ledger: &mut RunLedger) -> Result<(), RunError> {
        match self.config.dataset.mode {
            DatasetMode::General => self.process_general(aoi, ledger),
            DatasetMode::Fire => self.process_fire(aoi, ledger),
        }
    }

    fn process_general(
        &self,
        aoi: &AreaOfInterest,
        ledger: &mut RunLedger,
    ) -> Result<(), RunError> {
        let sensors = self.config.sensors(DatasetMode::General);
        let selector = SceneSelector::new(self.catalog, self.config);
        let selected = selector.select(
            &aoi.geometry,
            &self.config.sentinel_2.time_windows,
            &sensors,
            None,
        )?;
        let overlap = overlap::resolve(&selected)?;
        let seed = BoundsSpec::Geographic(overlap::overlap_bounds(&overlap)?);
        let aligner = GridAligner::new(self.builder, self.config);
        let aligned = aligner.align(&selected, seed, &sensors, REQUIRED_WINDOWS)?;

        let candidates =
            land_cover_candidates(&aligned.stacks[&SensorId::LandCover], &self.config.chips);
        let mut balancer = ClassBalancer::new(self.config.land_cover_policy.class_quota);
        let mut accepted = 0usize;
        for (ordinal, candidate) in candidates.iter().enumerate() {
            let chip_index = ledger.chip_index(aoi.index, ordinal);
            if self.general_candidate(
                &aligned,
                &sensors,
                candidate,
                chip_index,
                aoi.index,
                &mut balancer,
                ledger,
            )? {
                accepted += 1;
            }
        }
        info!(
            "aoi={} candidates={} accepted={accepted}",
            aoi.index,
            candidates.len()
        );
        Ok(())
    }

    /// One land-cover candidate end to end. Returns whether it was
    /// accepted. Chips whose artifacts all exist are counted without
    /// re-extraction and without new metadata rows.
    fn general_candidate(
        &self,
        aligned: &AlignedStacks,
        sensors: &[SensorId],
        candidate: &LandCoverCandidate,
        chip_index: u64,
        aoi_index: usize,
        balancer: &mut ClassBalancer,
        ledger: &mut RunLedger,
    ) -> Result<bool, RunError> {
        let all_exist = sensors.iter().all(|sensor| {
            self.artifact_names(*sensor, chip_index, &aligned.stacks[sensor].dates)
                .iter()
                .all(|name| self.writer.exists(name))
        });
        if all_exist {
            debug!("chip={chip_index} artifacts exist, skipping");
            balancer.record(candidate.class);
            return Ok(true);
        }

        let outcome = balancer
            .check(candidate.class)
            .and_then(|()| self.extract_general(aligned, sensors, candidate))
            .and_then(|(class, chips)| {
                for chip in &chips {
                    self.write_general(chip, chip_index)?;
                }
                Ok((class, chips))
            });
        match outcome {
            Ok((class, chips)) => {
                for chip in chips {
                    let dates = ChipRow::dates_joined(&chip.dates);
                    if ledger.has_row(chip_index, chip.sensor, &dates) {
                        continue;
                    }
                    ledger.append(ChipRow {
                        chip_index,
                        aoi_index,
                        sensor: chip.sensor.to_string(),
                        dates,
                        land_cover: Some(class),
                        footprint: Some(chip.footprint_wkt),
                        epsg: Some(chip.epsg),
                        period: String::new(),
                        status: "success".to_string(),
                    })?;
                }
                balancer.record(class);
                Ok(true)
            }
            Err(e) => {
                debug!("chip={chip_index} rejected: {e}");
                ledger.append(failure_row(chip_index, aoi_index, &e, ""))?;
                Ok(false)
            }
        }
    }

    /// Extract every sensor for one candidate, land cover first so the
    /// class policy can reject before the expensive sensors run.
    fn extract_general(
        &self,
        aligned: &AlignedStacks,
        sensors: &[SensorId],
        candidate: &LandCoverCandidate,
    ) -> Result<(u8, Vec<ExtractedChip>), ChipError> {
        let chips_cfg = &self.config.chips;
        let lc = extract_chip(
            &aligned.stacks[&SensorId::LandCover],
            &aligned.authoritative,
            &candidate.location,
            chips_cfg,
            self.config.platform(SensorId::LandCover),
        )?;
        let class = classify_core(&lc, &self.config.land_cover_policy)?;

        let mut chips = vec![lc];
        for sensor in sensors {
            if *sensor == SensorId::LandCover {
                continue;
            }
            chips.push(extract_chip(
                &aligned.stacks[sensor],
                &aligned.authoritative,
                &candidate.location,
                chips_cfg,
                self.config.platform(*sensor),
            )?);
        }
        Ok((class, chips))
    }

    fn process_fire(&self, aoi: &AreaOfInterest, ledger: &mut RunLedger) -> Result<(), RunError> {
        let fire = aoi.fire.clone().ok_or(AoiError::FireDatesMissing)?;
        let sensors = self.config.sensors(DatasetMode::Fire);
        let selector = SceneSelector::new(self.catalog, self.config);
        let aligner = GridAligner::new(self.builder, self.config);

        // Event year: the four quarters of the post-fire year.
        let event_year = fire.post_date.year();
        let selected =
            selector.select(&aoi.geometry, &quarter_windows(event_year), &sensors, None)?;
        let overlap = overlap::resolve(&selected)?;
        let seed = BoundsSpec::Geographic(overlap::overlap_bounds(&overlap)?);
        let aligned = aligner.align(&selected, seed, &sensors, QUARTERS)?;

        let anchor_grid = aligned.stacks[&SensorId::ANCHOR].grid;
        let mask = rasterize_aoi_mask(&aoi.geometry, &anchor_grid)?;
        let locations = burn_candidates(
            &mask,
            &anchor_grid,
            &self.config.chips,
            self.config.fire.burn_fraction,
            self.config.fire.stride,
        );
        let validator = CoverageValidator::new(
            sensors
                .iter()
                .copied()
                .filter(|s| self.config.platform(*s).required)
                .collect(),
        );

        let mut gated = 0usize;
        for (ordinal, location) in locations.iter().enumerate() {
            let chip_index = ledger.chip_index(aoi.index, ordinal);
            let mut outcomes = QuarterOutcomes::default();
            for sensor in &sensors {
                let stack = &aligned.stacks[sensor];
                for quarter in 0..QUARTERS {
                    let ok = self.fire_quarter(
                        stack,
                        &aligned.authoritative,
                        location,
                        chip_index,
                        aoi.index,
                        quarter,
                        "event",
                        ledger,
                    )?;
                    outcomes.record(*sensor, quarter, ok);
                }
            }
            match validator.gate(&outcomes) {
                Ok(()) => {
                    gated += 1;
                    ledger.append(summary_row(chip_index, aoi.index, event_year, "event"))?;
                }
                Err(e) => {
                    debug!("chip={chip_index} gated out: {e}");
                    ledger.append(failure_row(chip_index, aoi.index, &e, "event"))?;
                }
            }
        }
        info!(
            "aoi={} event_year={event_year} locations={} gated={gated}",
            aoi.index,
            locations.len(),
        );

        // Control years reuse the event pins and the event grid so
        // control chips sample the same swaths and the same ground.
        // The gate only decides event acceptance; every cached location
        // gets control chips.
        for back in 1..=self.config.fire.control_years {
            let year = fire.pre_date.year() - back as i32;
            let control = selector.select(
                &aoi.geometry,
                &quarter_windows(year),
                &sensors,
                Some(&selected.pins),
            )?;
            let seed = BoundsSpec::Projected(adjust_bbox_to_resolution(
                aligned.authoritative,
                self.config.platform(SensorId::ANCHOR).resolution,
            ));
            let control_stacks = aligner.align(&control, seed, &sensors, QUARTERS)?;
            for (ordinal, location) in locations.iter().enumerate() {
                let chip_index = ledger.chip_index(aoi.index, ordinal);
                for sensor in &sensors {
                    let stack = &control_stacks.stacks[sensor];
                    for quarter in 0..QUARTERS {
                        self.fire_quarter(
                            stack,
                            &control_stacks.authoritative,
                            location,
                            chip_index,
                            aoi.index,
                            quarter,
                            "control",
                            ledger,
                        )?;
                    }
                }
                ledger.append(summary_row(chip_index, aoi.index, year, "control"))?;
            }
            info!("aoi={} control_year={year} locations={}", aoi.index, locations.len());
        }
        Ok(())
    }

    /// Extract and persist one (sensor, quarter) of a fire-mode
    /// location. Quarters fail independently; the return value feeds
    /// the coverage gate.
    #[allow(clippy::too_many_arguments)]
    fn fire_quarter(
        &self,
        stack: &RasterStack,
        authoritative: &Bounds,
        location: &ChipLocation,
        chip_index: u64,
        aoi_index: usize,
        quarter: usize,
        period: &str,
        ledger: &mut RunLedger,
    ) -> Result<bool, RunError> {
        let sensor = stack.sensor;
        let platform = self.config.platform(sensor);
        let date = stack.dates[quarter];
        let name = temporal_chip_name(sensor, chip_index, quarter, date);
        if self.writer.exists(&name) {
            debug!("chip={chip_index} sensor={sensor} quarter={quarter} artifact exists, skipping");
            return Ok(true);
        }
        let outcome = extract_quarter(
            stack,
            authoritative,
            location,
            &self.config.chips,
            platform,
            quarter,
        )
        .and_then(|chip| {
            self.writer.write(&name, chip.data.index_axis(Axis(0), 0), platform.dtype)?;
            Ok(chip)
        });
        match outcome {
            Ok(chip) => {
                let dates = ChipRow::dates_joined(&chip.dates);
                if !ledger.has_row(chip_index, sensor, &dates) {
                    ledger.append(ChipRow {
                        chip_index,
                        aoi_index,
                        sensor: sensor.to_string(),
                        dates,
                        land_cover: None,
                        footprint: Some(chip.footprint_wkt),
                        epsg: Some(chip.epsg),
                        period: period.to_string(),
                        status: "success".to_string(),
                    })?;
                }
                Ok(true)
            }
            Err(e) => {
                debug!(
                    "chip={chip_index} sensor={sensor} quarter={quarter} period={period} rejected: {e}"
                );
                ledger.append(failure_row(chip_index, aoi_index, &e, period))?;
                Ok(false)
            }
        }
    }

    fn artifact_names(&self, sensor: SensorId, chip_index: u64, dates: &[NaiveDate]) -> Vec<String> {
        if SensorId::TEMPORAL.contains(&sensor) {
            dates
                .iter()
                .enumerate()
                .map(|(seq, date)| temporal_chip_name(sensor, chip_index, seq, *date))
                .collect()
        } else {
            vec![static_chip_name(sensor, chip_index)]
        }
    }

    /// Persist a general-mode chip: one artifact per acquisition for
    /// temporal sensors, a single artifact for static layers.
    fn write_general(&self, chip: &ExtractedChip, chip_index: u64) -> Result<(), ChipError> {
        let dtype = self.config.platform(chip.sensor).dtype;
        if SensorId::TEMPORAL.contains(&chip.sensor) {
            for (seq, date) in chip.dates.iter().enumerate() {
                let name = temporal_chip_name(chip.sensor, chip_index, seq, *date);
                self.writer.write(&name, chip.data.index_axis(Axis(0), seq), dtype)?;
            }
        } else {
            let name = static_chip_name(chip.sensor, chip_index);
            self.writer.write(&name, chip.data.index_axis(Axis(0), 0), dtype)?;
        }
        Ok(())
    }
}

/// Per-location summary row for one fire period. The covering year
/// stands in for the date list, which keeps the dedup key distinct
/// across periods.
fn summary_row(chip_index: u64, aoi_index: usize, year: i32, period: &str) -> ChipRow {
    ChipRow {
        chip_index,
        aoi_index,
        sensor: String::new(),
        dates: year.to_string(),
        land_cover: None,
        footprint: None,
        epsg: None,
        period: period.to_string(),
        status: "success".to_string(),
    }
}

fn failure_row(chip_index: u64, aoi_index: usize, e: &ChipError, period: &str) -> ChipRow {
    ChipRow {
        chip_index,
        aoi_index,
        sensor: e.sensor().map(|s| s.to_string()).unwrap_or_default(),
        dates: String::new(),
        land_cover: None,
        footprint: None,
        epsg: None,
        period: period.to_string(),
        status: e.status(),
    }
}

/// The four calendar quarters of a year as anchor time windows.
pub fn quarter_windows(year: i32) -> Vec<TimeWindow> {
    [(1, 1, 3, 31), (4, 1, 6, 30), (7, 1, 9, 30), (10, 1, 12, 31)]
        .iter()
        .map(|(m0, d0, m1, d1)| TimeWindow {
            start: NaiveDate::from_ymd_opt(year, *m0, *d0).expect("valid date"),
            end: NaiveDate::from_ymd_opt(year, *m1, *d1).expect("valid date"),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SceneRecord;
    use crate::config::{ChipConfig, ChipDtype};
    use crate::crs;
    use crate::error::StackError;
    use crate::grid::GridSpec;
    use crate::selector::tests::FakeCatalog;
    use crate::stack::{StackRequest, TemporalMerge};
    use ndarray::{Array4, ArrayView3};
    use std::cell::RefCell;
    use std::collections::BTreeSet;
    use std::fs;
    use std::path::Path;

    /// Builder filling every band with a plausible clear-sky value.
    struct ConstBuilder;

    impl StackBuilder for ConstBuilder {
        fn build(&self, request: &StackRequest) -> Result<RasterStack, StackError> {
            let bounds = match request.bounds {
                BoundsSpec::Projected(b) => b,
                BoundsSpec::Geographic(b) => {
                    let mut min_x = f64::INFINITY;
                    let mut min_y = f64::INFINITY;
                    let mut max_x = f64::NEG_INFINITY;
                    let mut max_y = f64::NEG_INFINITY;
                    for (lon, lat) in b.corners() {
                        let (x, y) = crs::project(request.epsg, lon, lat)?;
                        min_x = min_x.min(x);
                        min_y = min_y.min(y);
                        max_x = max_x.max(x);
                        max_y = max_y.max(y);
                    }
                    Bounds::new(min_x, min_y, max_x, max_y)
                }
            };
            let grid = GridSpec::snap(request.epsg, request.resolution, bounds);
            let steps = match request.merge {
                TemporalMerge::PerDate => request.scenes.len(),
                TemporalMerge::Median => 1,
            };
            let mut data =
                Array4::<f32>::zeros((steps, request.bands.len(), grid.height, grid.width));
            for (bi, band) in request.bands.iter().enumerate() {
                let fill = match band.as_str() {
                    "SCL" => 4.0,
                    "qa_pixel" => 0.0,
                    "data" if request.sensor == SensorId::LandCover => 7.0,
                    _ => 1500.0,
                };
                data.index_axis_mut(Axis(1), bi).fill(fill);
            }
            Ok(RasterStack {
                sensor: request.sensor,
                data,
                bands: request.bands.clone(),
                dates: request.scenes.iter().take(steps).map(|(d, _)| *d).collect(),
                grid,
            })
        }
    }

    struct MemWriter {
        names: RefCell<BTreeSet<String>>,
    }

    impl MemWriter {
        fn new() -> MemWriter {
            MemWriter { names: RefCell::new(BTreeSet::new()) }
        }
    }

    impl ChipWriter for MemWriter {
        fn exists(&self, name: &str) -> bool {
            self.names.borrow().contains(name)
        }

        fn write(&self, name: &str, _data: ArrayView3<f32>, _dtype: ChipDtype) -> Result<(), ChipError> {
            self.names.borrow_mut().insert(name.to_string());
            Ok(())
        }
    }

    const FOOTPRINT: (f64, f64, f64, f64) = (14.0, 48.0, 14.002, 48.0015);

    fn footprint() -> Bounds {
        Bounds::new(FOOTPRINT.0, FOOTPRINT.1, FOOTPRINT.2, FOOTPRINT.3)
    }

    fn scene(sensor: SensorId, dt: &str) -> SceneRecord {
        SceneRecord {
            id: format!("{sensor}-{dt}"),
            sensor,
            datetime: dt.parse().expect("datetime"),
            footprint: footprint().to_polygon(),
            epsg: Some(32633),
            cloud_cover: Some(5.0),
            tile: Some("33UVP".into()),
            relative_orbit: Some(44),
            wrs_path: Some("190".into()),
            platform: Some("landsat-8".into()),
        }
    }

    fn general_scenes() -> Vec<SceneRecord> {
        let mut scenes = Vec::new();
        for dt in ["2023-02-10T10:00:00Z", "2023-05-10T10:00:00Z", "2023-08-10T10:00:00Z", "2023-11-10T10:00:00Z"] {
            scenes.push(scene(SensorId::Sentinel2, dt));
        }
        for dt in ["2023-02-12T05:00:00Z", "2023-05-08T05:00:00Z", "2023-08-11T05:00:00Z", "2023-11-09T05:00:00Z"] {
            scenes.push(scene(SensorId::Sentinel1, dt));
            let mut s = scene(SensorId::Landsat, dt);
            s.cloud_cover = Some(3.0);
            scenes.push(s);
        }
        scenes.push(scene(SensorId::Dem, "2021-04-01T00:00:00Z"));
        scenes.push(scene(SensorId::LandCover, "2023-01-01T00:00:00Z"));
        scenes
    }

    fn fire_scenes() -> Vec<SceneRecord> {
        let mut scenes = Vec::new();
        for year in [2020, 2021] {
            for month in [2, 5, 8, 11] {
                scenes.push(scene(
                    SensorId::Sentinel2,
                    &format!("{year}-{month:02}-15T10:00:00Z"),
                ));
                scenes.push(scene(
                    SensorId::Sentinel1,
                    &format!("{year}-{month:02}-16T05:00:00Z"),
                ));
                let mut s =
                    scene(SensorId::Landsat, &format!("{year}-{month:02}-17T09:00:00Z"));
                s.cloud_cover = Some(3.0);
                scenes.push(s);
            }
        }
        scenes
    }

    fn config(mode: &str) -> Config {
        let mut config: Config =
            serde_yaml::from_str(crate::config::tests::EXAMPLE_YAML).expect("example config");
        // Pad of 30 m, one full pixel of the coarsest sensor.
        config.chips = ChipConfig { sample_size: 60.0, chip_size: 120.0 };
        if mode == "fire" {
            config.dataset.mode = DatasetMode::Fire;
        }
        config
    }

    fn write_aoi_file(dir: &Path, fire: bool) -> std::path::PathBuf {
        let (min_x, min_y, max_x, max_y) = FOOTPRINT;
        let properties = if fire {
            r#"{ "pre_date": "2021-05-01", "post_date": "2021-08-01" }"#
        } else {
            "{}"
        };
        let text = format!(
            r#"{{
                "type": "FeatureCollection",
                "features": [{{
                    "type": "Feature",
                    "geometry": {{ "type": "Polygon", "coordinates": [[[{min_x}, {min_y}], [{max_x}, {min_y}], [{max_x}, {max_y}], [{min_x}, {max_y}], [{min_x}, {min_y}]]] }},
                    "properties": {properties}
                }}]
            }}"#
        );
        let path = dir.join("aois.geojson");
        fs::write(&path, text).expect("write aois");
        path
    }

    #[test]
    fn quarter_windows_cover_the_year() {
        let windows = quarter_windows(2021);
        assert_eq!(windows.len(), 4);
        assert_eq!(windows[0].start, NaiveDate::from_ymd_opt(2021, 1, 1).unwrap());
        assert_eq!(windows[1].end, NaiveDate::from_ymd_opt(2021, 6, 30).unwrap());
        assert_eq!(windows[3].end, NaiveDate::from_ymd_opt(2021, 12, 31).unwrap());
    }

    #[test]
    fn general_run_writes_chips_and_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let aoi_path = write_aoi_file(dir.path(), false);
        let config = config("general");
        let catalog = FakeCatalog { scenes: general_scenes() };
        let writer = MemWriter::new();
        let processor = AoiProcessor::new(&catalog, &ConstBuilder, &writer, &config);

        let mut ledger = RunLedger::open(dir.path(), &aoi_path).expect("ledger");
        processor.run(&mut ledger).expect("run");
        assert_eq!(ledger.aois()[0].status, AoiStatus::Success);

        let rows = ledger.rows();
        assert!(!rows.is_empty());
        assert!(rows.iter().all(|r| r.status == "success"));
        assert!(rows.iter().all(|r| r.land_cover == Some(7)));
        // Five sensors per accepted candidate.
        assert_eq!(rows.len() % 5, 0);
        let names = writer.names.borrow();
        assert!(names.contains("land_cover_000000.npy"));
        assert!(names.contains("dem_000000.npy"));
        assert!(names.contains("sentinel_2_000000_0_20230210.npy"));
        assert!(names.contains("sentinel_2_000000_3_20231110.npy"));
        assert!(names.contains("sentinel_1_000000_1_20230508.npy"));
        assert!(names.contains("landsat_000000_2_20230811.npy"));
    }

    #[test]
    fn completed_aois_are_not_reprocessed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let aoi_path = write_aoi_file(dir.path(), false);
        let config = config("general");
        let catalog = FakeCatalog { scenes: general_scenes() };
        let writer = MemWriter::new();
        let processor = AoiProcessor::new(&catalog, &ConstBuilder, &writer, &config);

        let mut ledger = RunLedger::open(dir.path(), &aoi_path).expect("ledger");
        processor.run(&mut ledger).expect("run");
        let row_count = ledger.rows().len();
        let artifact_count = writer.names.borrow().len();
        drop(ledger);

        let mut ledger = RunLedger::open(dir.path(), &aoi_path).expect("reopen");
        assert!(ledger.pending().is_empty());
        processor.run(&mut ledger).expect("rerun");
        assert_eq!(ledger.rows().len(), row_count);
        assert_eq!(writer.names.borrow().len(), artifact_count);
    }

    #[test]
    fn missing_secondary_scenes_fail_the_aoi() {
        let dir = tempfile::tempdir().expect("tempdir");
        let aoi_path = write_aoi_file(dir.path(), false);
        let config = config("general");
        let scenes: Vec<SceneRecord> = general_scenes()
            .into_iter()
            .filter(|s| s.sensor != SensorId::Sentinel1)
            .collect();
        let catalog = FakeCatalog { scenes };
        let writer = MemWriter::new();
        let processor = AoiProcessor::new(&catalog, &ConstBuilder, &writer, &config);

        let mut ledger = RunLedger::open(dir.path(), &aoi_path).expect("ledger");
        processor.run(&mut ledger).expect("run continues past the failed AOI");
        assert_eq!(
            ledger.aois()[0].status,
            AoiStatus::Failed("sentinel_1_scenes_missing".into())
        );
        assert!(ledger.rows().is_empty());
    }

    #[test]
    fn fire_run_extracts_event_and_control_quarters() {
        let dir = tempfile::tempdir().expect("tempdir");
        let aoi_path = write_aoi_file(dir.path(), true);
        let config = config("fire");
        let catalog = FakeCatalog { scenes: fire_scenes() };
        let writer = MemWriter::new();
        let processor = AoiProcessor::new(&catalog, &ConstBuilder, &writer, &config);

        let mut ledger = RunLedger::open(dir.path(), &aoi_path).expect("ledger");
        processor.run(&mut ledger).expect("run");
        assert_eq!(ledger.aois()[0].status, AoiStatus::Success);

        let rows = ledger.rows();
        assert!(!rows.is_empty());
        assert!(rows.iter().all(|r| r.status == "success"));
        let events = rows.iter().filter(|r| r.period == "event").count();
        let controls = rows.iter().filter(|r| r.period == "control").count();
        // 3 sensors x 4 quarters plus one summary row per location and period.
        assert!(events > 0 && events % 13 == 0);
        assert_eq!(events, controls);
        let event_summaries = rows
            .iter()
            .filter(|r| r.period == "event" && r.sensor.is_empty())
            .count();
        let control_summaries = rows
            .iter()
            .filter(|r| r.period == "control" && r.sensor.is_empty())
            .count();
        assert_eq!(event_summaries * 13, events);
        assert_eq!(control_summaries, event_summaries);
        assert!(rows.iter().all(|r| r.land_cover.is_none()));
        // Event chips carry 2021 dates, control chips 2020 dates.
        assert!(rows
            .iter()
            .filter(|r| r.period == "event")
            .all(|r| r.dates.starts_with("2021")));
        assert!(rows
            .iter()
            .filter(|r| r.period == "control")
            .all(|r| r.dates.starts_with("2020")));
        let names = writer.names.borrow();
        assert!(names.contains("sentinel_2_000000_0_20210215.npy"));
        assert!(names.contains("sentinel_2_000000_0_20200215.npy"));
    }

    /// Landsat delivering NaN for its first quarter: the gate rejects
    /// every event location, control chips are still cut.
    struct FirstQuarterGapBuilder;

    impl StackBuilder for FirstQuarterGapBuilder {
        fn build(&self, request: &StackRequest) -> Result<RasterStack, StackError> {
            let mut stack = ConstBuilder.build(request)?;
            if request.sensor == SensorId::Landsat {
                for (bi, band) in request.bands.iter().enumerate() {
                    if band != "qa_pixel" {
                        stack.data.slice_mut(ndarray::s![0, bi, .., ..]).fill(f32::NAN);
                    }
                }
            }
            Ok(stack)
        }
    }

    #[test]
    fn gate_rejection_still_cuts_control_chips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let aoi_path = write_aoi_file(dir.path(), true);
        let config = config("fire");
        let catalog = FakeCatalog { scenes: fire_scenes() };
        let writer = MemWriter::new();
        let processor = AoiProcessor::new(&catalog, &FirstQuarterGapBuilder, &writer, &config);

        let mut ledger = RunLedger::open(dir.path(), &aoi_path).expect("ledger");
        processor.run(&mut ledger).expect("run");
        assert_eq!(ledger.aois()[0].status, AoiStatus::Success);

        let rows = ledger.rows();
        // The first landsat quarter fails, then the gate rejects the location.
        assert!(rows
            .iter()
            .any(|r| r.period == "event" && r.status == "landsat_missing_values"));
        assert!(rows
            .iter()
            .any(|r| r.period == "event" && r.status == "coverage_incomplete"));
        assert!(!rows
            .iter()
            .any(|r| r.period == "event" && r.sensor.is_empty() && r.status == "success"));
        // Control extraction ignores the event gate.
        assert!(rows
            .iter()
            .any(|r| r.period == "control" && r.sensor == "sentinel_2" && r.status == "success"));
        assert!(rows
            .iter()
            .any(|r| r.period == "control" && r.status == "landsat_missing_values"));
        assert!(rows
            .iter()
            .any(|r| r.period == "control" && r.sensor.is_empty() && r.status == "success"));
        let names = writer.names.borrow();
        assert!(names.contains("sentinel_1_000000_0_20200216.npy"));
        assert!(!names.contains("landsat_000000_0_20210217.npy"));
    }

    #[test]
    fn fire_mode_without_dates_fails_the_aoi() {
        let dir = tempfile::tempdir().expect("tempdir");
        let aoi_path = write_aoi_file(dir.path(), false);
        let config = config("fire");
        let catalog = FakeCatalog { scenes: fire_scenes() };
        let writer = MemWriter::new();
        let processor = AoiProcessor::new(&catalog, &ConstBuilder, &writer, &config);

        let mut ledger = RunLedger::open(dir.path(), &aoi_path).expect("ledger");
        processor.run(&mut ledger).expect("run");
        assert_eq!(
            ledger.aois()[0].status,
            AoiStatus::Failed("fire_dates_missing".into())
        );
    }
}
