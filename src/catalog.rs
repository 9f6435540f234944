//! Scene catalog contract: query shape, scene records, pinning keys.

use chrono::{DateTime, NaiveDate, Utc};
use geo::Polygon;

use crate::config::{PinKind, SensorId};
use crate::error::CatalogError;

/// Value of a spatial pinning key, fixing one physical swath for all
/// time windows of one AOI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinValue {
    /// MGRS tile id (`s2:mgrs_tile`).
    Tile(String),
    /// Relative orbit number (`sat:relative_orbit`).
    Orbit(u32),
    /// WRS path (`landsat:wrs_path`).
    Path(String),
}

impl PinValue {
    /// STAC property the pin filters on.
    pub fn property(&self) -> &'static str {
        match self {
            PinValue::Tile(_) => "s2:mgrs_tile",
            PinValue::Orbit(_) => "sat:relative_orbit",
            PinValue::Path(_) => "landsat:wrs_path",
        }
    }
}

/// One catalog scene. Footprints are EPSG:4326 polygons.
#[derive(Debug, Clone)]
pub struct SceneRecord {
    pub id: String,
    pub sensor: SensorId,
    pub datetime: DateTime<Utc>,
    pub footprint: Polygon<f64>,
    pub epsg: Option<u32>,
    pub cloud_cover: Option<f64>,
    pub tile: Option<String>,
    pub relative_orbit: Option<u32>,
    pub wrs_path: Option<String>,
    pub platform: Option<String>,
}

impl SceneRecord {
    pub fn date(&self) -> NaiveDate {
        self.datetime.date_naive()
    }

    /// The scene's value of a pin kind, if the catalog supplied it.
    pub fn pin_value(&self, kind: PinKind) -> Option<PinValue> {
        match kind {
            PinKind::Tile => self.tile.clone().map(PinValue::Tile),
            PinKind::Orbit => self.relative_orbit.map(PinValue::Orbit),
            PinKind::Path => self.wrs_path.clone().map(PinValue::Path),
        }
    }

    /// Whether the scene lies on the pinned swath.
    pub fn matches_pin(&self, pin: &PinValue) -> bool {
        match pin {
            PinValue::Tile(tile) => self.tile.as_deref() == Some(tile.as_str()),
            PinValue::Orbit(orbit) => self.relative_orbit == Some(*orbit),
            PinValue::Path(path) => self.wrs_path.as_deref() == Some(path.as_str()),
        }
    }
}

/// Result ordering requested from the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    /// Ascending `eo:cloud_cover`; least cloudy first.
    CloudCover,
    /// Ascending acquisition time.
    #[default]
    Datetime,
}

/// One catalog search.
#[derive(Debug, Clone)]
pub struct SceneQuery {
    pub sensor: SensorId,
    pub collection: String,
    /// AOI polygon the scenes must intersect, EPSG:4326.
    pub geometry: Polygon<f64>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub max_cloud_cover: Option<f64>,
    pub max_nodata: Option<f64>,
    pub platforms: Option<Vec<String>>,
    pub pin: Option<PinValue>,
    pub sort: SortKey,
    pub max_items: Option<usize>,
}

impl SceneQuery {
    pub fn new(sensor: SensorId, collection: &str, geometry: Polygon<f64>) -> SceneQuery {
        SceneQuery {
            sensor,
            collection: collection.to_string(),
            geometry,
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MAX_UTC,
            max_cloud_cover: None,
            max_nodata: None,
            platforms: None,
            pin: None,
            sort: SortKey::default(),
            max_items: None,
        }
    }
}

/// Scene search collaborator. Implementations handle transport and
/// retry; callers see an ordered record list or a fatal error.
pub trait SceneCatalog {
    fn search(&self, query: &SceneQuery) -> Result<Vec<SceneRecord>, CatalogError>;
}

/// Distinct acquisition dates in a scene list.
pub fn count_unique_dates(scenes: &[SceneRecord]) -> usize {
    let mut dates: Vec<NaiveDate> = scenes.iter().map(SceneRecord::date).collect();
    dates.sort_unstable();
    dates.dedup();
    dates.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Bounds;

    fn scene(id: &str, dt: &str) -> SceneRecord {
        SceneRecord {
            id: id.to_string(),
            sensor: SensorId::Sentinel1,
            datetime: dt.parse().expect("datetime"),
            footprint: Bounds::new(14.0, 48.0, 14.1, 48.1).to_polygon(),
            epsg: Some(32633),
            cloud_cover: None,
            tile: None,
            relative_orbit: Some(44),
            wrs_path: None,
            platform: None,
        }
    }

    #[test]
    fn unique_dates_collapse_same_day_scenes() {
        let scenes = vec![
            scene("a", "2023-02-10T05:30:00Z"),
            scene("b", "2023-02-10T17:45:00Z"),
            scene("c", "2023-05-01T05:30:00Z"),
        ];
        assert_eq!(count_unique_dates(&scenes), 2);
        assert_eq!(count_unique_dates(&[]), 0);
    }

    #[test]
    fn pin_matching_by_kind() {
        let s = scene("a", "2023-02-10T05:30:00Z");
        assert!(s.matches_pin(&PinValue::Orbit(44)));
        assert!(!s.matches_pin(&PinValue::Orbit(95)));
        assert!(!s.matches_pin(&PinValue::Tile("33UVP".into())));
        assert_eq!(s.pin_value(PinKind::Orbit), Some(PinValue::Orbit(44)));
        assert_eq!(s.pin_value(PinKind::Tile), None);
    }
}
