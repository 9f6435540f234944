//! Offline scene store: a directory of per-scene `.npy` band rasters
//! plus an `index.json` of scene records. Serves both the catalog and
//! the stack-builder contracts for prefetched data and tests.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use geo::{Intersects, LineString, Polygon};
use log::debug;
use ndarray::{Array2, Array3, Array4};
use ndarray_npy::read_npy;
use serde::Deserialize;

use crate::catalog::{SceneCatalog, SceneQuery, SceneRecord, SortKey};
use crate::crs;
use crate::error::{CatalogError, StackError};
use crate::grid::{Bounds, GridSpec};
use crate::stack::{BoundsSpec, RasterStack, StackBuilder, StackRequest, TemporalMerge};

#[derive(Debug, Deserialize)]
struct StoreIndex {
    scenes: Vec<StoredScene>,
}

#[derive(Debug, Deserialize)]
struct StoredScene {
    id: String,
    collection: String,
    datetime: DateTime<Utc>,
    /// Exterior ring of the footprint, EPSG:4326.
    footprint: Vec<[f64; 2]>,
    #[serde(default)]
    epsg: Option<u32>,
    #[serde(default)]
    cloud_cover: Option<f64>,
    #[serde(default)]
    tile: Option<String>,
    #[serde(default)]
    relative_orbit: Option<u32>,
    #[serde(default)]
    wrs_path: Option<String>,
    #[serde(default)]
    platform: Option<String>,
    raster: RasterMeta,
}

/// Geometry of one stored scene raster. All bands share it.
#[derive(Debug, Deserialize)]
struct RasterMeta {
    epsg: u32,
    resolution: f64,
    /// Projected (x, y) of the raster's top-left corner.
    origin: [f64; 2],
    /// Band name to `.npy` file, relative to the store directory.
    bands: BTreeMap<String, String>,
}

impl StoredScene {
    fn footprint_polygon(&self) -> Polygon<f64> {
        let mut coords: Vec<(f64, f64)> =
            self.footprint.iter().map(|p| (p[0], p[1])).collect();
        if coords.first() != coords.last() {
            if let Some(first) = coords.first().copied() {
                coords.push(first);
            }
        }
        Polygon::new(LineString::from(coords), vec![])
    }

    fn record(&self, sensor: crate::config::SensorId) -> SceneRecord {
        SceneRecord {
            id: self.id.clone(),
            sensor,
            datetime: self.datetime,
            footprint: self.footprint_polygon(),
            epsg: self.epsg.or(Some(self.raster.epsg)),
            cloud_cover: self.cloud_cover,
            tile: self.tile.clone(),
            relative_orbit: self.relative_orbit,
            wrs_path: self.wrs_path.clone(),
            platform: self.platform.clone(),
        }
    }
}

pub struct LocalSceneStore {
    dir: PathBuf,
    scenes: Vec<StoredScene>,
    by_id: HashMap<String, usize>,
}

impl LocalSceneStore {
    pub fn open(dir: &Path) -> Result<LocalSceneStore> {
        let index_path = dir.join("index.json");
        let text = fs::read_to_string(&index_path)
            .with_context(|| format!("reading store index {:?}", index_path))?;
        let index: StoreIndex = serde_json::from_str(&text)
            .with_context(|| format!("parsing store index {:?}", index_path))?;
        let by_id = index
            .scenes
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();
        Ok(LocalSceneStore { dir: dir.to_path_buf(), scenes: index.scenes, by_id })
    }

    fn stored(&self, id: &str) -> Result<&StoredScene, StackError> {
        self.by_id
            .get(id)
            .map(|i| &self.scenes[*i])
            .ok_or_else(|| StackError::AssetMissing(format!("scene {id} not in store")))
    }

    fn read_band(&self, scene: &StoredScene, band: &str) -> Result<Array2<f32>, StackError> {
        let file = scene.raster.bands.get(band).ok_or_else(|| {
            StackError::AssetMissing(format!("scene {} has no band {band}", scene.id))
        })?;
        let path = self.dir.join(file);
        read_npy(&path).map_err(|e| StackError::Read(format!("{}: {e}", path.display())))
    }

    /// Nearest-neighbor resample of one stored band onto the target
    /// grid, writing only pixels still NaN (first-valid compositing).
    fn resample_into(
        &self,
        scene: &StoredScene,
        band: &str,
        grid: &GridSpec,
        out: &mut ndarray::ArrayViewMut2<f32>,
    ) -> Result<(), StackError> {
        let source = self.read_band(scene, band)?;
        let (src_h, src_w) = source.dim();
        let meta = &scene.raster;
        let same_crs = meta.epsg == grid.epsg;
        for y in 0..grid.height {
            for x in 0..grid.width {
                if !out[[y, x]].is_nan() {
                    continue;
                }
                let (cx, cy) = grid.pixel_center(y, x);
                let (sx, sy) = if same_crs {
                    (cx, cy)
                } else {
                    let (lon, lat) = crs::unproject(grid.epsg, cx, cy)?;
                    crs::project(meta.epsg, lon, lat)?
                };
                let col = ((sx - meta.origin[0]) / meta.resolution).floor();
                let row = ((meta.origin[1] - sy) / meta.resolution).floor();
                if col < 0.0 || row < 0.0 {
                    continue;
                }
                let (col, row) = (col as usize, row as usize);
                if row < src_h && col < src_w {
                    out[[y, x]] = source[[row, col]];
                }
            }
        }
        Ok(())
    }
}

fn realize_grid(request: &StackRequest) -> Result<GridSpec, StackError> {
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
    Ok(GridSpec::snap(request.epsg, request.resolution, bounds))
}

/// Element-wise median over per-date composites, ignoring NaN.
fn median_composite(layers: &[Array3<f32>]) -> Array3<f32> {
    let shape = layers[0].dim();
    let mut out = Array3::<f32>::from_elem(shape, f32::NAN);
    let mut values: Vec<f32> = Vec::with_capacity(layers.len());
    for b in 0..shape.0 {
        for y in 0..shape.1 {
            for x in 0..shape.2 {
                values.clear();
                for layer in layers {
                    let v = layer[[b, y, x]];
                    if !v.is_nan() {
                        values.push(v);
                    }
                }
                if values.is_empty() {
                    continue;
                }
                values.sort_by(|a, b| a.partial_cmp(b).expect("no NaN kept"));
                let mid = values.len() / 2;
                out[[b, y, x]] = if values.len() % 2 == 1 {
                    values[mid]
                } else {
                    (values[mid - 1] + values[mid]) / 2.0
                };
            }
        }
    }
    out
}

impl SceneCatalog for LocalSceneStore {
    fn search(&self, query: &SceneQuery) -> Result<Vec<SceneRecord>, CatalogError> {
        let mut hits: Vec<SceneRecord> = self
            .scenes
            .iter()
            .filter(|s| s.collection == query.collection)
            .filter(|s| s.datetime >= query.start && s.datetime <= query.end)
            .map(|s| s.record(query.sensor))
            .filter(|r| r.footprint.intersects(&query.geometry))
            .filter(|r| match query.max_cloud_cover {
                Some(max) => r.cloud_cover.map(|c| c < max).unwrap_or(false),
                None => true,
            })
            .filter(|r| match &query.platforms {
                Some(platforms) => {
                    r.platform.as_ref().map(|p| platforms.contains(p)).unwrap_or(false)
                }
                None => true,
            })
            .filter(|r| match &query.pin {
                Some(pin) => r.matches_pin(pin),
                None => true,
            })
            .collect();
        match query.sort {
            SortKey::CloudCover => hits.sort_by(|a, b| {
                a.cloud_cover
                    .unwrap_or(f64::MAX)
                    .partial_cmp(&b.cloud_cover.unwrap_or(f64::MAX))
                    .expect("cloud cover is never NaN")
            }),
            SortKey::Datetime => hits.sort_by_key(|r| r.datetime),
        }
        if let Some(max) = query.max_items {
            hits.truncate(max);
        }
        debug!(
            "store search collection={} window={}..{} hits={}",
            query.collection,
            query.start,
            query.end,
            hits.len()
        );
        Ok(hits)
    }
}

impl StackBuilder for LocalSceneStore {
    fn build(&self, request: &StackRequest) -> Result<RasterStack, StackError> {
        if request.scenes.is_empty() {
            return Err(StackError::InvalidRequest("no scenes to stack".into()));
        }
        let grid = realize_grid(request)?;

        let mut composites: Vec<Array3<f32>> = Vec::with_capacity(request.scenes.len());
        for (_, group) in &request.scenes {
            let mut layer = Array3::<f32>::from_elem(
                (request.bands.len(), grid.height, grid.width),
                f32::NAN,
            );
            for record in group {
                let stored = self.stored(&record.id)?;
                for (b, band) in request.bands.iter().enumerate() {
                    let mut view = layer.index_axis_mut(ndarray::Axis(0), b);
                    self.resample_into(stored, band, &grid, &mut view)?;
                }
            }
            composites.push(layer);
        }

        let (data, dates) = match request.merge {
            TemporalMerge::PerDate => {
                let mut data = Array4::<f32>::from_elem(
                    (composites.len(), request.bands.len(), grid.height, grid.width),
                    f32::NAN,
                );
                for (t, layer) in composites.iter().enumerate() {
                    data.index_axis_mut(ndarray::Axis(0), t).assign(layer);
                }
                (data, request.scenes.iter().map(|(d, _)| *d).collect())
            }
            TemporalMerge::Median => {
                let layer = median_composite(&composites);
                let mut data = Array4::<f32>::from_elem(
                    (1, request.bands.len(), grid.height, grid.width),
                    f32::NAN,
                );
                data.index_axis_mut(ndarray::Axis(0), 0).assign(&layer);
                (data, vec![request.scenes[0].0])
            }
        };

        Ok(RasterStack {
            sensor: request.sensor,
            data,
            bands: request.bands.clone(),
            dates,
            grid,
        })
    }
}
