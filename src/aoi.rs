//! Area-of-interest records and their GeoJSON persistence.
//!
//! AOIs are loaded once from a FeatureCollection; the status attribute
//! is the only thing the run ever mutates, and the whole file is
//! rewritten after each transition so a relaunch sees durable state.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use geo::{LineString, Polygon};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// AOI lifecycle state. Anything that is not one of the three known
/// labels round-trips as a failure status string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AoiStatus {
    NotProcessed,
    Processing,
    Success,
    Failed(String),
}

impl AoiStatus {
    pub fn as_str(&self) -> &str {
        match self {
            AoiStatus::NotProcessed => "not_processed",
            AoiStatus::Processing => "processing",
            AoiStatus::Success => "success",
            AoiStatus::Failed(reason) => reason,
        }
    }

    pub fn parse(s: &str) -> AoiStatus {
        match s {
            "not_processed" => AoiStatus::NotProcessed,
            "processing" => AoiStatus::Processing,
            "success" => AoiStatus::Success,
            other => AoiStatus::Failed(other.to_string()),
        }
    }

    /// Completed AOIs are skipped on relaunch; a `processing` leftover
    /// from a crash is picked up again.
    pub fn is_done(&self) -> bool {
        matches!(self, AoiStatus::Success | AoiStatus::Failed(_))
    }
}

/// Wildfire metadata carried in the feature properties of fire-mode
/// AOI files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FireMeta {
    pub pre_date: NaiveDate,
    pub post_date: NaiveDate,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AreaOfInterest {
    pub index: usize,
    /// EPSG:4326 polygon.
    pub geometry: Polygon<f64>,
    pub status: AoiStatus,
    pub fire: Option<FireMeta>,
}

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    geometry: Geometry,
    #[serde(default)]
    properties: Value,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    #[serde(rename = "type")]
    kind: String,
    coordinates: Value,
}

fn ring_from_json(ring: &Value) -> Result<LineString<f64>> {
    let coords = ring
        .as_array()
        .context("ring is not an array")?
        .iter()
        .map(|pair| {
            let pair = pair.as_array().context("coordinate is not an array")?;
            let x = pair
                .first()
                .and_then(Value::as_f64)
                .context("coordinate x missing")?;
            let y = pair
                .get(1)
                .and_then(Value::as_f64)
                .context("coordinate y missing")?;
            Ok((x, y))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(LineString::from(coords))
}

fn polygon_from_json(rings: &Value) -> Result<Polygon<f64>> {
    let rings = rings.as_array().context("polygon is not an array of rings")?;
    let exterior = ring_from_json(rings.first().context("polygon has no exterior ring")?)?;
    let interiors = rings[1..]
        .iter()
        .map(ring_from_json)
        .collect::<Result<Vec<_>>>()?;
    Ok(Polygon::new(exterior, interiors))
}

impl Geometry {
    fn into_polygon(self) -> Result<Polygon<f64>> {
        match self.kind.as_str() {
            "Polygon" => polygon_from_json(&self.coordinates),
            // MultiPolygon AOIs occur in fire event files; the first
            // part carries the burn perimeter.
            "MultiPolygon" => {
                let parts = self
                    .coordinates
                    .as_array()
                    .context("multipolygon is not an array")?;
                polygon_from_json(parts.first().context("multipolygon is empty")?)
            }
            other => bail!("unsupported AOI geometry type {other:?}"),
        }
    }
}

fn polygon_to_json(poly: &Polygon<f64>) -> Value {
    let ring_json = |ring: &LineString<f64>| -> Value {
        Value::Array(ring.0.iter().map(|c| json!([c.x, c.y])).collect())
    };
    let mut rings = vec![ring_json(poly.exterior())];
    rings.extend(poly.interiors().iter().map(ring_json));
    json!({ "type": "Polygon", "coordinates": rings })
}

/// Read a FeatureCollection of AOI polygons. Missing status defaults to
/// `not_processed`; fire dates are read from `pre_date`/`post_date`
/// properties when present.
pub fn load_aois(path: &Path) -> Result<Vec<AreaOfInterest>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading AOI file {:?}", path))?;
    let fc: FeatureCollection =
        serde_json::from_str(&text).with_context(|| format!("parsing AOI file {:?}", path))?;
    let mut aois = Vec::with_capacity(fc.features.len());
    for (index, feature) in fc.features.into_iter().enumerate() {
        let geometry = feature
            .geometry
            .into_polygon()
            .with_context(|| format!("AOI feature {index}"))?;
        let status = feature
            .properties
            .get("status")
            .and_then(Value::as_str)
            .map(AoiStatus::parse)
            .unwrap_or(AoiStatus::NotProcessed);
        let fire = match (
            feature.properties.get("pre_date"),
            feature.properties.get("post_date"),
        ) {
            (Some(pre), Some(post)) => Some(FireMeta {
                pre_date: serde_json::from_value(pre.clone())
                    .with_context(|| format!("AOI feature {index} pre_date"))?,
                post_date: serde_json::from_value(post.clone())
                    .with_context(|| format!("AOI feature {index} post_date"))?,
                source: feature
                    .properties
                    .get("source")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }),
            _ => None,
        };
        aois.push(AreaOfInterest { index, geometry, status, fire });
    }
    Ok(aois)
}

/// Rewrite the whole status file. Small AOI counts make a full rewrite
/// cheaper than tracking dirty features.
pub fn save_aois(path: &Path, aois: &[AreaOfInterest]) -> Result<()> {
    let features: Vec<Value> = aois
        .iter()
        .map(|aoi| {
            let mut properties = json!({ "status": aoi.status.as_str() });
            if let Some(fire) = &aoi.fire {
                properties["pre_date"] = json!(fire.pre_date);
                properties["post_date"] = json!(fire.post_date);
                if let Some(source) = &fire.source {
                    properties["source"] = json!(source);
                }
            }
            json!({
                "type": "Feature",
                "geometry": polygon_to_json(&aoi.geometry),
                "properties": properties,
            })
        })
        .collect();
    let fc = json!({ "type": "FeatureCollection", "features": features });
    let text = serde_json::to_string_pretty(&fc)?;
    fs::write(path, text).with_context(|| format!("writing AOI status file {:?}", path))?;
    Ok(())
}
