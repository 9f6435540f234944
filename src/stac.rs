//! STAC API implementation of the scene catalog, with bounded
//! retry/backoff on transient server errors.

use std::thread;
use std::time::Duration;

use chrono::SecondsFormat;
use geo::{LineString, Polygon};
use log::{debug, warn};
use serde_json::{json, Map, Value};

use crate::catalog::{PinValue, SceneCatalog, SceneQuery, SceneRecord, SortKey};
use crate::error::CatalogError;

const TRANSIENT: [u16; 3] = [502, 503, 504];
const MAX_BACKOFF: Duration = Duration::from_secs(60);

pub struct StacClient {
    endpoint: String,
    agent: ureq::Agent,
    max_retries: u32,
    backoff_base: Duration,
}

impl StacClient {
    pub fn new(endpoint: &str, max_retries: u32, backoff_secs: u64) -> StacClient {
        StacClient {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(120))
                .build(),
            max_retries: max_retries.max(1),
            backoff_base: Duration::from_secs(backoff_secs),
        }
    }

    fn post_search(&self, body: &Value) -> Result<Value, CatalogError> {
        let url = format!("{}/search", self.endpoint);
        let mut last_detail = String::new();
        for attempt in 1..=self.max_retries {
            match self.agent.post(&url).send_json(body.clone()) {
                Ok(response) => {
                    return response
                        .into_json()
                        .map_err(|e| CatalogError::Malformed(e.to_string()));
                }
                Err(ureq::Error::Status(code, response)) => {
                    if !TRANSIENT.contains(&code) {
                        return Err(CatalogError::Http {
                            code,
                            detail: response.into_string().unwrap_or_default(),
                        });
                    }
                    last_detail = format!("HTTP {code}");
                }
                Err(ureq::Error::Transport(e)) => {
                    last_detail = e.to_string();
                }
            }
            if attempt < self.max_retries {
                let backoff = backoff_duration(self.backoff_base, attempt);
                warn!(
                    "catalog request failed ({last_detail}), retry {attempt}/{} in {backoff:?}",
                    self.max_retries
                );
                thread::sleep(backoff);
            }
        }
        Err(CatalogError::RetriesExhausted {
            attempts: self.max_retries,
            detail: last_detail,
        })
    }
}

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at 60 s.
fn backoff_duration(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << (attempt - 1).min(16)).min(MAX_BACKOFF)
}

fn polygon_geojson(polygon: &Polygon<f64>) -> Value {
    let ring: Vec<Value> =
        polygon.exterior().0.iter().map(|c| json!([c.x, c.y])).collect();
    json!({ "type": "Polygon", "coordinates": [ring] })
}

/// Map a query to a STAC `POST /search` body.
fn build_search_body(query: &SceneQuery) -> Value {
    let mut filters = Map::new();
    if let Some(max) = query.max_cloud_cover {
        filters.insert("eo:cloud_cover".into(), json!({ "lt": max }));
    }
    if let Some(max) = query.max_nodata {
        filters.insert("s2:nodata_pixel_percentage".into(), json!({ "lt": max }));
    }
    if let Some(platforms) = &query.platforms {
        filters.insert("platform".into(), json!({ "in": platforms }));
    }
    if let Some(pin) = &query.pin {
        let value = match pin {
            PinValue::Tile(tile) => json!(tile),
            PinValue::Orbit(orbit) => json!(orbit),
            PinValue::Path(path) => json!(path),
        };
        filters.insert(pin.property().into(), json!({ "eq": value }));
    }

    let sortby = match query.sort {
        SortKey::CloudCover => json!([{ "field": "properties.eo:cloud_cover", "direction": "asc" }]),
        SortKey::Datetime => json!([{ "field": "properties.datetime", "direction": "asc" }]),
    };

    let mut body = json!({
        "collections": [&query.collection],
        "intersects": polygon_geojson(&query.geometry),
        "datetime": format!(
            "{}/{}",
            query.start.to_rfc3339_opts(SecondsFormat::Secs, true),
            query.end.to_rfc3339_opts(SecondsFormat::Secs, true)
        ),
        "sortby": sortby,
    });
    if !filters.is_empty() {
        body["query"] = Value::Object(filters);
    }
    if let Some(max) = query.max_items {
        body["limit"] = json!(max);
    }
    body
}

fn ring_from_coords(ring: &Value) -> Result<LineString<f64>, CatalogError> {
    let coords = ring
        .as_array()
        .ok_or_else(|| CatalogError::Malformed("geometry ring is not an array".into()))?
        .iter()
        .map(|pair| {
            let pair = pair
                .as_array()
                .ok_or_else(|| CatalogError::Malformed("coordinate is not an array".into()))?;
            match (pair.first().and_then(Value::as_f64), pair.get(1).and_then(Value::as_f64)) {
                (Some(x), Some(y)) => Ok((x, y)),
                _ => Err(CatalogError::Malformed("non-numeric coordinate".into())),
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(LineString::from(coords))
}

fn footprint_from_geometry(geometry: &Value) -> Result<Polygon<f64>, CatalogError> {
    let kind = geometry.get("type").and_then(Value::as_str).unwrap_or_default();
    let coordinates = geometry
        .get("coordinates")
        .ok_or_else(|| CatalogError::Malformed("geometry without coordinates".into()))?;
    let rings = match kind {
        "Polygon" => coordinates,
        "MultiPolygon" => coordinates
            .get(0)
            .ok_or_else(|| CatalogError::Malformed("empty multipolygon".into()))?,
        other => {
            return Err(CatalogError::Malformed(format!("unsupported geometry {other:?}")))
        }
    };
    let exterior = rings
        .get(0)
        .ok_or_else(|| CatalogError::Malformed("polygon without exterior ring".into()))?;
    Ok(Polygon::new(ring_from_coords(exterior)?, vec![]))
}

fn epsg_from_properties(properties: &Value) -> Option<u32> {
    if let Some(epsg) = properties.get("proj:epsg").and_then(Value::as_u64) {
        return Some(epsg as u32);
    }
    // Newer catalogs replace proj:epsg with proj:code ("EPSG:32633").
    properties
        .get("proj:code")
        .and_then(Value::as_str)
        .and_then(|code| code.rsplit(':').next())
        .and_then(|code| code.parse().ok())
}

fn parse_feature(feature: &Value, query: &SceneQuery) -> Result<SceneRecord, CatalogError> {
    let id = feature
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| CatalogError::Malformed("feature without id".into()))?
        .to_string();
    let properties = feature
        .get("properties")
        .ok_or_else(|| CatalogError::Malformed(format!("feature {id} without properties")))?;
    let datetime = properties
        .get("datetime")
        .and_then(Value::as_str)
        .ok_or_else(|| CatalogError::Malformed(format!("feature {id} without datetime")))?
        .parse()
        .map_err(|e| CatalogError::Malformed(format!("feature {id} datetime: {e}")))?;
    let geometry = feature
        .get("geometry")
        .ok_or_else(|| CatalogError::Malformed(format!("feature {id} without geometry")))?;
    Ok(SceneRecord {
        id,
        sensor: query.sensor,
        datetime,
        footprint: footprint_from_geometry(geometry)?,
        epsg: epsg_from_properties(properties),
        cloud_cover: properties.get("eo:cloud_cover").and_then(Value::as_f64),
        tile: properties
            .get("s2:mgrs_tile")
            .and_then(Value::as_str)
            .map(str::to_string),
        relative_orbit: properties
            .get("sat:relative_orbit")
            .and_then(Value::as_u64)
            .map(|v| v as u32),
        wrs_path: properties.get("landsat:wrs_path").and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }),
        platform: properties
            .get("platform")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

impl SceneCatalog for StacClient {
    fn search(&self, query: &SceneQuery) -> Result<Vec<SceneRecord>, CatalogError> {
        let body = build_search_body(query);
        debug!("stac search collection={} limit={:?}", query.collection, query.max_items);
        let response = self.post_search(&body)?;
        let features = response
            .get("features")
            .and_then(Value::as_array)
            .ok_or_else(|| CatalogError::Malformed("response without features".into()))?;
        features.iter().map(|f| parse_feature(f, query)).collect()
    }
}
