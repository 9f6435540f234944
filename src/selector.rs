//! Per-sensor, per-time-window scene matching with spatial pinning.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use geo::{Area, BooleanOps, MultiPolygon, Polygon};
use log::{debug, info};

use crate::catalog::{count_unique_dates, PinValue, SceneCatalog, SceneQuery, SceneRecord, SortKey};
use crate::config::{Config, PinKind, SensorId, TimeWindow, REQUIRED_WINDOWS};
use crate::error::{AoiError, StepError};

/// Everything the rest of the AOI run needs from scene selection.
#[derive(Debug, Clone)]
pub struct SelectedScenes {
    /// Date-grouped matched scenes per sensor, ascending by date.
    pub scenes: BTreeMap<SensorId, Vec<(NaiveDate, Vec<SceneRecord>)>>,
    /// Pinning keys established for this AOI, reusable by a later
    /// control-period run.
    pub pins: BTreeMap<SensorId, PinValue>,
    /// EPSG of the anchor sensor's first matched scene.
    pub anchor_epsg: u32,
}

pub struct SceneSelector<'a> {
    catalog: &'a dyn SceneCatalog,
    config: &'a Config,
}

fn window_start(w: &TimeWindow) -> DateTime<Utc> {
    w.start.and_hms_opt(0, 0, 0).expect("midnight exists").and_utc()
}

fn window_end(w: &TimeWindow) -> DateTime<Utc> {
    w.end.and_hms_opt(23, 59, 59).expect("valid time").and_utc()
}

impl<'a> SceneSelector<'a> {
    pub fn new(catalog: &'a dyn SceneCatalog, config: &'a Config) -> SceneSelector<'a> {
        SceneSelector { catalog, config }
    }

    /// Match scenes for every sensor across all time windows. Pins in
    /// `prior_pins` are reused instead of re-established, which keeps a
    /// control-period run on the same physical swaths as its event run.
    pub fn select(
        &self,
        aoi: &Polygon<f64>,
        windows: &[TimeWindow],
        sensors: &[SensorId],
        prior_pins: Option<&BTreeMap<SensorId, PinValue>>,
    ) -> Result<SelectedScenes, StepError> {
        let mut pins: BTreeMap<SensorId, PinValue> = prior_pins.cloned().unwrap_or_default();
        let mut scenes: BTreeMap<SensorId, Vec<(NaiveDate, Vec<SceneRecord>)>> = BTreeMap::new();

        let anchor = SensorId::ANCHOR;
        let anchor_scenes = self.select_anchor(aoi, windows, &mut pins)?;
        let anchor_epsg = anchor_scenes[0].epsg.ok_or_else(|| AoiError::SceneMissing {
            sensor: anchor,
            detail: format!("anchor scene {} carries no EPSG", anchor_scenes[0].id),
        })?;

        for sensor in sensors {
            match *sensor {
                s if s == anchor => {}
                s if SensorId::TEMPORAL.contains(&s) => {
                    let groups =
                        self.select_secondary(s, aoi, windows, &anchor_scenes, &mut pins)?;
                    scenes.insert(s, groups);
                }
                s => {
                    scenes.insert(s, vec![self.select_static(s, aoi)?]);
                }
            }
        }
        scenes.insert(
            anchor,
            anchor_scenes.into_iter().map(|s| (s.date(), vec![s])).collect(),
        );

        Ok(SelectedScenes { scenes, pins, anchor_epsg })
    }

    /// Best anchor scene per window, tile-pinned after the first match.
    fn select_anchor(
        &self,
        aoi: &Polygon<f64>,
        windows: &[TimeWindow],
        pins: &mut BTreeMap<SensorId, PinValue>,
    ) -> Result<Vec<SceneRecord>, StepError> {
        let anchor = SensorId::ANCHOR;
        let platform = self.config.platform(anchor);
        let mut matched = Vec::with_capacity(windows.len());

        for (idx, window) in windows.iter().enumerate() {
            let mut query = SceneQuery::new(anchor, &platform.collection, aoi.clone());
            query.start = window_start(window);
            query.end = window_end(window);
            query.max_cloud_cover = platform.cloud_cover;
            query.max_nodata = platform.nodata_pixel_percentage;
            query.sort = SortKey::CloudCover;
            query.max_items = platform.max_items;
            query.pin = pins.get(&anchor).cloned();
            let results = self.catalog.search(&query)?;
            let Some(best) = results.into_iter().next() else {
                debug!("sensor={anchor} window={idx} matched no scenes");
                continue;
            };
            if let (Some(kind), None) = (platform.pin, pins.get(&anchor)) {
                if let Some(pin) = best.pin_value(kind) {
                    info!("sensor={anchor} pin={pin:?} established from scene {}", best.id);
                    pins.insert(anchor, pin);
                }
            }
            matched.push(best);
        }

        if matched.len() < windows.len() {
            return Err(AoiError::SceneMissing {
                sensor: anchor,
                detail: format!("{}/{} windows matched", matched.len(), windows.len()),
            }
            .into());
        }
        Ok(matched)
    }

    /// Match a secondary temporal sensor against the anchor scenes.
    fn select_secondary(
        &self,
        sensor: SensorId,
        aoi: &Polygon<f64>,
        windows: &[TimeWindow],
        anchor_scenes: &[SceneRecord],
        pins: &mut BTreeMap<SensorId, PinValue>,
    ) -> Result<Vec<(NaiveDate, Vec<SceneRecord>)>, StepError> {
        let platform = self.config.platform(sensor);

        if !pins.contains_key(&sensor) {
            if let Some(kind) = platform.pin {
                let pin =
                    self.establish_pin(sensor, kind, aoi, &windows[0], &anchor_scenes[0])?;
                if let Some(pin) = pin {
                    info!("sensor={sensor} pin={pin:?} established");
                    pins.insert(sensor, pin);
                }
            }
        }

        let mut groups: Vec<(NaiveDate, Vec<SceneRecord>)> = Vec::new();
        for (window, anchor_scene) in windows.iter().zip(anchor_scenes) {
            let (start, end) = clipped_range(anchor_scene.datetime, window, platform.delta_days);
            let mut query = SceneQuery::new(sensor, &platform.collection, aoi.clone());
            query.start = start;
            query.end = end;
            query.max_cloud_cover = platform.cloud_cover;
            query.platforms = platform.platforms.clone();
            query.pin = pins.get(&sensor).cloned();
            query.max_items = platform.max_items;
            let candidates = self.catalog.search(&query)?;
            let Some(closest) = closest_scene(&candidates, anchor_scene.datetime) else {
                debug!("sensor={sensor} window around {} matched no scenes", anchor_scene.date());
                continue;
            };
            let date = closest.date();
            // Everything on the matched date composites into one step.
            let group: Vec<SceneRecord> =
                candidates.into_iter().filter(|s| s.date() == date).collect();
            groups.push((date, group));
        }

        let all: Vec<SceneRecord> =
            groups.iter().flat_map(|(_, g)| g.iter().cloned()).collect();
        if count_unique_dates(&all) < REQUIRED_WINDOWS.min(windows.len()) {
            return Err(AoiError::SceneMissing {
                sensor,
                detail: format!(
                    "{} distinct dates across {} windows",
                    count_unique_dates(&all),
                    windows.len()
                ),
            }
            .into());
        }
        groups.sort_by_key(|(date, _)| *date);
        Ok(groups)
    }

    /// Derive the pin from the first window. Orbit pins dissolve every
    /// candidate by relative orbit and keep the orbit covering the most
    /// AOI area; other kinds take the nearest-in-time scene's key.
    fn establish_pin(
        &self,
        sensor: SensorId,
        kind: PinKind,
        aoi: &Polygon<f64>,
        window: &TimeWindow,
        anchor_scene: &SceneRecord,
    ) -> Result<Option<PinValue>, StepError> {
        let platform = self.config.platform(sensor);
        let (start, end) = clipped_range(anchor_scene.datetime, window, platform.delta_days);
        let mut query = SceneQuery::new(sensor, &platform.collection, aoi.clone());
        query.start = start;
        query.end = end;
        query.max_cloud_cover = platform.cloud_cover;
        query.platforms = platform.platforms.clone();
        query.max_items = platform.max_items;
        let candidates = self.catalog.search(&query)?;

        if kind != PinKind::Orbit {
            return Ok(closest_scene(&candidates, anchor_scene.datetime)
                .and_then(|s| s.pin_value(kind)));
        }

        let aoi_multi = MultiPolygon::new(vec![aoi.clone()]);
        let mut orbits: BTreeMap<u32, Vec<&SceneRecord>> = BTreeMap::new();
        for scene in &candidates {
            if let Some(orbit) = scene.relative_orbit {
                orbits.entry(orbit).or_default().push(scene);
            }
        }
        let mut best: Option<(u32, f64, TimeDelta)> = None;
        for (orbit, scenes) in &orbits {
            let mut dissolved: Option<MultiPolygon<f64>> = None;
            for scene in scenes {
                let footprint = MultiPolygon::new(vec![scene.footprint.clone()]);
                dissolved = Some(match dissolved {
                    Some(d) => d.union(&footprint),
                    None => footprint,
                });
            }
            let area = dissolved
                .map(|d| d.intersection(&aoi_multi).unsigned_area())
                .unwrap_or(0.0);
            let closeness = scenes
                .iter()
                .map(|s| (s.datetime - anchor_scene.datetime).abs())
                .min()
                .unwrap_or(TimeDelta::MAX);
            debug!("sensor={sensor} orbit={orbit} intersection_area={area:.6} closeness={closeness}");
            let better = match &best {
                None => true,
                Some((_, best_area, best_closeness)) => {
                    area > *best_area || (area == *best_area && closeness < *best_closeness)
                }
            };
            if better {
                best = Some((*orbit, area, closeness));
            }
        }
        Ok(best.map(|(orbit, _, _)| PinValue::Orbit(orbit)))
    }

    /// One composite group for a static annual layer.
    fn select_static(
        &self,
        sensor: SensorId,
        aoi: &Polygon<f64>,
    ) -> Result<(NaiveDate, Vec<SceneRecord>), StepError> {
        let platform = self.config.platform(sensor);
        let year = platform.year.unwrap_or(2021);
        let mut query = SceneQuery::new(sensor, &platform.collection, aoi.clone());
        query.start = NaiveDate::from_ymd_opt(year, 1, 1)
            .expect("valid date")
            .and_hms_opt(0, 0, 0)
            .expect("midnight exists")
            .and_utc();
        query.end = NaiveDate::from_ymd_opt(year, 12, 31)
            .expect("valid date")
            .and_hms_opt(23, 59, 59)
            .expect("valid time")
            .and_utc();
        let scenes = self.catalog.search(&query)?;
        if scenes.is_empty() {
            return Err(AoiError::SceneMissing {
                sensor,
                detail: format!("no scenes for year {year}"),
            }
            .into());
        }
        let date = scenes[0].date();
        Ok((date, scenes))
    }
}

/// Search range centered on the anchor acquisition, clipped to the
/// enclosing time window. Without a configured delta the whole window
/// is searched.
fn clipped_range(
    center: DateTime<Utc>,
    window: &TimeWindow,
    delta_days: Option<i64>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let (lo, hi) = (window_start(window), window_end(window));
    match delta_days {
        Some(days) => {
            let delta = TimeDelta::days(days);
            ((center - delta).max(lo), (center + delta).min(hi))
        }
        None => (lo, hi),
    }
}

fn closest_scene(scenes: &[SceneRecord], center: DateTime<Utc>) -> Option<&SceneRecord> {
    scenes.iter().min_by_key(|s| (s.datetime - center).abs())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::CatalogError;
    use crate::grid::Bounds;
    use geo::Intersects;

    /// In-memory catalog honoring the query fields the selector uses.
    pub(crate) struct FakeCatalog {
        pub scenes: Vec<SceneRecord>,
    }

    impl SceneCatalog for FakeCatalog {
        fn search(&self, query: &SceneQuery) -> Result<Vec<SceneRecord>, CatalogError> {
            let mut hits: Vec<SceneRecord> = self
                .scenes
                .iter()
                .filter(|s| s.sensor == query.sensor)
                .filter(|s| s.datetime >= query.start && s.datetime <= query.end)
                .filter(|s| s.footprint.intersects(&query.geometry))
                .filter(|s| match query.max_cloud_cover {
                    Some(max) => s.cloud_cover.map(|c| c < max).unwrap_or(false),
                    None => true,
                })
                .filter(|s| match &query.platforms {
                    Some(platforms) => {
                        s.platform.as_ref().map(|p| platforms.contains(p)).unwrap_or(false)
                    }
                    None => true,
                })
                .filter(|s| match &query.pin {
                    Some(pin) => s.matches_pin(pin),
                    None => true,
                })
                .cloned()
                .collect();
            match query.sort {
                SortKey::CloudCover => hits.sort_by(|a, b| {
                    a.cloud_cover
                        .unwrap_or(f64::MAX)
                        .partial_cmp(&b.cloud_cover.unwrap_or(f64::MAX))
                        .expect("no NaN cloud cover")
                }),
                SortKey::Datetime => hits.sort_by_key(|s| s.datetime),
            }
            if let Some(max) = query.max_items {
                hits.truncate(max);
            }
            Ok(hits)
        }
    }

    fn aoi() -> Polygon<f64> {
        Bounds::new(14.0, 48.0, 14.1, 48.1).to_polygon()
    }

    fn config() -> Config {
        serde_yaml::from_str(crate::config::tests::EXAMPLE_YAML).expect("example config")
    }

    fn scene(sensor: SensorId, dt: &str, footprint: Bounds) -> SceneRecord {
        SceneRecord {
            id: format!("{sensor}-{dt}"),
            sensor,
            datetime: dt.parse().expect("datetime"),
            footprint: footprint.to_polygon(),
            epsg: Some(32633),
            cloud_cover: Some(5.0),
            tile: Some("33UVP".into()),
            relative_orbit: None,
            wrs_path: Some("190".into()),
            platform: Some("landsat-8".into()),
        }
    }

    fn anchor_scenes() -> Vec<SceneRecord> {
        ["2023-02-10T10:00:00Z", "2023-05-10T10:00:00Z", "2023-08-10T10:00:00Z", "2023-11-10T10:00:00Z"]
            .iter()
            .map(|dt| scene(SensorId::Sentinel2, dt, Bounds::new(13.9, 47.9, 14.2, 48.2)))
            .collect()
    }

    fn secondary_scenes() -> Vec<SceneRecord> {
        let mut scenes = Vec::new();
        for dt in ["2023-02-12T05:00:00Z", "2023-05-08T05:00:00Z", "2023-08-11T05:00:00Z", "2023-11-09T05:00:00Z"] {
            let mut s = scene(SensorId::Sentinel1, dt, Bounds::new(13.9, 47.9, 14.2, 48.2));
            s.relative_orbit = Some(44);
            scenes.push(s);
            let mut s = scene(SensorId::Landsat, dt, Bounds::new(13.9, 47.9, 14.2, 48.2));
            s.cloud_cover = Some(3.0);
            scenes.push(s);
        }
        scenes
    }

    fn static_scenes() -> Vec<SceneRecord> {
        vec![
            scene(SensorId::Dem, "2021-04-01T00:00:00Z", Bounds::new(13.9, 47.9, 14.2, 48.2)),
            scene(SensorId::LandCover, "2023-01-01T00:00:00Z", Bounds::new(13.9, 47.9, 14.2, 48.2)),
        ]
    }

    #[test]
    fn matches_all_sensors_in_general_mode() {
        let mut scenes = anchor_scenes();
        scenes.extend(secondary_scenes());
        scenes.extend(static_scenes());
        let catalog = FakeCatalog { scenes };
        let config = config();
        let selector = SceneSelector::new(&catalog, &config);
        let sensors = config.sensors(crate::config::DatasetMode::General);
        let selected = selector
            .select(&aoi(), &config.sentinel_2.time_windows, &sensors, None)
            .expect("selection succeeds");
        assert_eq!(selected.anchor_epsg, 32633);
        assert_eq!(selected.scenes[&SensorId::Sentinel2].len(), 4);
        assert_eq!(selected.scenes[&SensorId::Sentinel1].len(), 4);
        assert_eq!(selected.scenes[&SensorId::Landsat].len(), 4);
        assert_eq!(selected.scenes[&SensorId::Dem].len(), 1);
        assert_eq!(selected.pins[&SensorId::Sentinel2], PinValue::Tile("33UVP".into()));
        assert_eq!(selected.pins[&SensorId::Sentinel1], PinValue::Orbit(44));
        assert_eq!(selected.pins[&SensorId::Landsat], PinValue::Path("190".into()));
    }

    #[test]
    fn missing_anchor_window_fails_the_aoi() {
        let mut scenes = anchor_scenes();
        scenes.remove(2); // no anchor scene in window 3
        scenes.extend(secondary_scenes());
        scenes.extend(static_scenes());
        let catalog = FakeCatalog { scenes };
        let config = config();
        let selector = SceneSelector::new(&catalog, &config);
        let sensors = config.sensors(crate::config::DatasetMode::General);
        let err = selector
            .select(&aoi(), &config.sentinel_2.time_windows, &sensors, None)
            .expect_err("must fail");
        match err {
            StepError::Aoi(AoiError::SceneMissing { sensor, detail }) => {
                assert_eq!(sensor, SensorId::Sentinel2);
                assert_eq!(detail, "3/4 windows matched");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn orbit_pin_prefers_largest_intersection_then_sticks() {
        let mut scenes = anchor_scenes();
        scenes.extend(static_scenes());
        // Orbit 95 covers a sliver of the AOI, orbit 44 covers it all.
        // Orbit 95 also has scenes in every window that are closer in
        // time, which must not matter once the pin is set.
        for (dt95, dt44) in [
            ("2023-02-10T11:00:00Z", "2023-02-14T05:00:00Z"),
            ("2023-05-10T11:00:00Z", "2023-05-14T05:00:00Z"),
            ("2023-08-10T11:00:00Z", "2023-08-14T05:00:00Z"),
            ("2023-11-10T11:00:00Z", "2023-11-14T05:00:00Z"),
        ] {
            let mut sliver = scene(SensorId::Sentinel1, dt95, Bounds::new(14.09, 47.9, 14.3, 48.2));
            sliver.relative_orbit = Some(95);
            scenes.push(sliver);
            let mut full = scene(SensorId::Sentinel1, dt44, Bounds::new(13.9, 47.9, 14.2, 48.2));
            full.relative_orbit = Some(44);
            scenes.push(full);
        }
        for dt in ["2023-02-12T05:00:00Z", "2023-05-08T05:00:00Z", "2023-08-11T05:00:00Z", "2023-11-09T05:00:00Z"] {
            let mut s = scene(SensorId::Landsat, dt, Bounds::new(13.9, 47.9, 14.2, 48.2));
            s.cloud_cover = Some(3.0);
            scenes.push(s);
        }
        let catalog = FakeCatalog { scenes };
        let config = config();
        let selector = SceneSelector::new(&catalog, &config);
        let sensors = config.sensors(crate::config::DatasetMode::General);
        let selected = selector
            .select(&aoi(), &config.sentinel_2.time_windows, &sensors, None)
            .expect("selection succeeds");
        assert_eq!(selected.pins[&SensorId::Sentinel1], PinValue::Orbit(44));
        for (_, group) in &selected.scenes[&SensorId::Sentinel1] {
            for s in group {
                assert_eq!(s.relative_orbit, Some(44), "scene {} off the pinned orbit", s.id);
            }
        }
    }

    #[test]
    fn prior_pins_skip_establishment() {
        let mut scenes = anchor_scenes();
        scenes.extend(static_scenes());
        // Only orbit 95 scenes exist; with a prior pin on orbit 44 the
        // selection must fail instead of drifting to another swath.
        for dt in ["2023-02-12T05:00:00Z", "2023-05-08T05:00:00Z", "2023-08-11T05:00:00Z", "2023-11-09T05:00:00Z"] {
            let mut s = scene(SensorId::Sentinel1, dt, Bounds::new(13.9, 47.9, 14.2, 48.2));
            s.relative_orbit = Some(95);
            scenes.push(s);
        }
        let catalog = FakeCatalog { scenes };
        let config = config();
        let selector = SceneSelector::new(&catalog, &config);
        let mut pins = BTreeMap::new();
        pins.insert(SensorId::Sentinel1, PinValue::Orbit(44));
        let err = selector
            .select(
                &aoi(),
                &config.sentinel_2.time_windows,
                &[SensorId::Sentinel2, SensorId::Sentinel1],
                Some(&pins),
            )
            .expect_err("pinned orbit has no scenes");
        assert!(matches!(
            err,
            StepError::Aoi(AoiError::SceneMissing { sensor: SensorId::Sentinel1, .. })
        ));
    }

    #[test]
    fn same_date_scenes_group_for_compositing() {
        let mut scenes = anchor_scenes();
        scenes.extend(static_scenes());
        for dt in ["2023-02-12T05:00:00Z", "2023-05-08T05:00:00Z", "2023-08-11T05:00:00Z", "2023-11-09T05:00:00Z"] {
            for suffix in [0, 1] {
                let mut s = scene(SensorId::Sentinel1, dt, Bounds::new(13.9, 47.9, 14.2, 48.2));
                s.id = format!("{}-{}", s.id, suffix);
                s.relative_orbit = Some(44);
                s.datetime = s.datetime + TimeDelta::minutes(suffix);
                scenes.push(s);
            }
        }
        let catalog = FakeCatalog { scenes };
        let config = config();
        let selector = SceneSelector::new(&catalog, &config);
        let selected = selector
            .select(
                &aoi(),
                &config.sentinel_2.time_windows,
                &[SensorId::Sentinel2, SensorId::Sentinel1],
                None,
            )
            .expect("selection succeeds");
        for (_, group) in &selected.scenes[&SensorId::Sentinel1] {
            assert_eq!(group.len(), 2, "both same-date scenes kept");
        }
    }
}
