use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Number of time windows (and stack time steps) every temporal sensor
/// must cover for one AOI.
pub const REQUIRED_WINDOWS: usize = 4;

/// Sensor identifiers, also used as artifact/ledger prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SensorId {
    #[serde(rename = "sentinel_2")]
    Sentinel2,
    #[serde(rename = "sentinel_1")]
    Sentinel1,
    #[serde(rename = "landsat")]
    Landsat,
    #[serde(rename = "dem")]
    Dem,
    #[serde(rename = "land_cover")]
    LandCover,
}

impl SensorId {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorId::Sentinel2 => "sentinel_2",
            SensorId::Sentinel1 => "sentinel_1",
            SensorId::Landsat => "landsat",
            SensorId::Dem => "dem",
            SensorId::LandCover => "land_cover",
        }
    }

    /// The anchor sensor drives window selection and grid alignment.
    pub const ANCHOR: SensorId = SensorId::Sentinel2;

    /// Sensors carrying one acquisition per time window.
    pub const TEMPORAL: [SensorId; 3] = [SensorId::Sentinel2, SensorId::Sentinel1, SensorId::Landsat];

    /// Static annual layers, composited to a single time step.
    pub const STATIC: [SensorId; 2] = [SensorId::Dem, SensorId::LandCover];
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which scene property pins a sensor to one physical swath.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinKind {
    Tile,
    Orbit,
    Path,
}

/// Numeric type a sensor's chips are cast to on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChipDtype {
    Int16,
    Uint8,
    #[default]
    Float32,
}

/// Dataset mode selecting the chip policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetMode {
    #[default]
    General,
    Fire,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetConfig {
    pub name: String,
    #[serde(default)]
    pub mode: DatasetMode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// GeoJSON FeatureCollection of AOI polygons.
    pub aoi_file: PathBuf,
    /// Ledger files (AOI status, chip metadata) live here.
    pub working_dir: PathBuf,
    /// Chip artifacts live here.
    pub output_dir: PathBuf,
}

/// Where scenes and rasters come from.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Prefetched scene store on disk, serving both catalog and rasters.
    Local { store: PathBuf },
    /// Remote STAC catalog for scene search, local store for rasters.
    Stac {
        endpoint: String,
        store: PathBuf,
        #[serde(default = "default_max_retries")]
        max_retries: u32,
        #[serde(default = "default_backoff_secs")]
        backoff_secs: u64,
    },
}

/// Chip geometry, both lengths in meters on the ground.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ChipConfig {
    /// Edge length of the sampling core used for validation and
    /// land-cover block statistics.
    pub sample_size: f64,
    /// Edge length of the full (padded) chip window.
    pub chip_size: f64,
}

/// Inclusive calendar date range of one anchor time window.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Cloud masking rule for a sensor's quality band.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CloudMaskConfig {
    /// Scene-classification band; listed class values are cloudy.
    Scl { band: String, classes: Vec<u16> },
    /// Quality bitmask band; any listed bit set means cloudy.
    QaBits { band: String, bits: Vec<u8> },
}

impl CloudMaskConfig {
    pub fn band(&self) -> &str {
        match self {
            CloudMaskConfig::Scl { band, .. } | CloudMaskConfig::QaBits { band, .. } => band,
        }
    }
}

/// Radiometric harmonization across a processing-baseline cutover.
#[derive(Debug, Clone, Deserialize)]
pub struct HarmonizeConfig {
    /// Acquisitions on or after this date get the offset removed.
    pub cutover: NaiveDate,
    pub offset: f32,
    /// Spectral bands the shift applies to.
    #[serde(default = "default_harmonize_bands")]
    pub bands: Vec<String>,
}

/// One sensor's typed configuration record.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    pub collection: String,
    pub bands: Vec<String>,
    /// Pixel size in meters.
    pub resolution: f64,
    /// Build this sensor's grid in its scenes' native CRS instead of the
    /// anchor EPSG.
    #[serde(default)]
    pub native_crs: bool,
    /// Maximum eo:cloud_cover percentage accepted by the scene search.
    #[serde(default)]
    pub cloud_cover: Option<f64>,
    /// Maximum nodata pixel percentage accepted by the scene search.
    #[serde(default)]
    pub nodata_pixel_percentage: Option<f64>,
    /// Platform names accepted by the scene search.
    #[serde(default)]
    pub platforms: Option<Vec<String>>,
    /// Half-width of the secondary-sensor search window around the
    /// anchor acquisition, clipped to the enclosing time window.
    #[serde(default)]
    pub delta_days: Option<i64>,
    /// Anchor time windows (general mode). Fire mode derives quarterly
    /// windows from the AOI's fire dates instead.
    #[serde(default)]
    pub time_windows: Vec<TimeWindow>,
    /// Year queried for static annual layers.
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub pin: Option<PinKind>,
    #[serde(default)]
    pub cloud_mask: Option<CloudMaskConfig>,
    /// Sentinel written in place of no-data on finalized chips.
    #[serde(default = "default_na_value")]
    pub na_value: f32,
    #[serde(default)]
    pub dtype: ChipDtype,
    #[serde(default)]
    pub harmonize: Option<HarmonizeConfig>,
    /// Required sensors gate fire-mode event locations.
    #[serde(default = "default_true")]
    pub required: bool,
    /// Scene search result cap.
    #[serde(default)]
    pub max_items: Option<usize>,
}

impl PlatformConfig {
    /// Band list with the cloud band removed, i.e. what chips carry.
    pub fn data_bands(&self) -> Vec<String> {
        match &self.cloud_mask {
            Some(mask) => self
                .bands
                .iter()
                .filter(|b| b.as_str() != mask.band())
                .cloned()
                .collect(),
            None => self.bands.clone(),
        }
    }
}

/// Land-cover acceptance policy for the general dataset.
#[derive(Debug, Clone, Deserialize)]
pub struct LandCoverPolicyConfig {
    #[serde(default = "default_allowed_classes")]
    pub allowed_classes: Vec<u8>,
    /// Classes rejected unconditionally even when homogeneous
    /// (flooded vegetation).
    #[serde(default = "default_rejected_classes")]
    pub rejected_classes: Vec<u8>,
    /// Accepted chips per class per AOI.
    #[serde(default = "default_class_quota")]
    pub class_quota: usize,
}

impl Default for LandCoverPolicyConfig {
    fn default() -> Self {
        LandCoverPolicyConfig {
            allowed_classes: default_allowed_classes(),
            rejected_classes: default_rejected_classes(),
            class_quota: default_class_quota(),
        }
    }
}

impl LandCoverPolicyConfig {
    /// Classes the layer may legally contain (allowed plus rejected);
    /// anything else is a wrong-value failure.
    pub fn is_known(&self, class: u8) -> bool {
        self.allowed_classes.contains(&class) || self.rejected_classes.contains(&class)
    }
}

/// Fire-mode selection policy.
#[derive(Debug, Clone, Deserialize)]
pub struct FireConfig {
    /// Minimum burnt fraction of a candidate window.
    #[serde(default = "default_burn_fraction")]
    pub burn_fraction: f64,
    /// Window stride in meters; chip size when absent.
    #[serde(default)]
    pub stride: Option<f64>,
    /// How many pre-fire years to extract control chips for.
    #[serde(default = "default_control_years")]
    pub control_years: usize,
}

impl Default for FireConfig {
    fn default() -> Self {
        FireConfig {
            burn_fraction: default_burn_fraction(),
            stride: None,
            control_years: default_control_years(),
        }
    }
}

/// Whole run configuration, loaded from one YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub dataset: DatasetConfig,
    pub paths: PathsConfig,
    pub source: SourceConfig,
    pub chips: ChipConfig,
    pub sentinel_2: PlatformConfig,
    pub sentinel_1: PlatformConfig,
    pub landsat: PlatformConfig,
    pub dem: PlatformConfig,
    pub land_cover: PlatformConfig,
    #[serde(default)]
    pub land_cover_policy: LandCoverPolicyConfig,
    #[serde(default)]
    pub fire: FireConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config file {:?}", path))?;
        let config: Config = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config file {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn platform(&self, sensor: SensorId) -> &PlatformConfig {
        match sensor {
            SensorId::Sentinel2 => &self.sentinel_2,
            SensorId::Sentinel1 => &self.sentinel_1,
            SensorId::Landsat => &self.landsat,
            SensorId::Dem => &self.dem,
            SensorId::LandCover => &self.land_cover,
        }
    }

    /// Sensors the given mode extracts, in extraction order.
    pub fn sensors(&self, mode: DatasetMode) -> Vec<SensorId> {
        match mode {
            DatasetMode::General => vec![
                SensorId::LandCover,
                SensorId::Dem,
                SensorId::Sentinel2,
                SensorId::Sentinel1,
                SensorId::Landsat,
            ],
            DatasetMode::Fire => SensorId::TEMPORAL.to_vec(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.chips.sample_size <= 0.0 || self.chips.chip_size < self.chips.sample_size {
            bail!(
                "chip geometry invalid: chip_size {} must be >= sample_size {} > 0",
                self.chips.chip_size,
                self.chips.sample_size
            );
        }
        for sensor in [
            SensorId::Sentinel2,
            SensorId::Sentinel1,
            SensorId::Landsat,
            SensorId::Dem,
            SensorId::LandCover,
        ] {
            let p = self.platform(sensor);
            if p.resolution <= 0.0 {
                bail!("{sensor} resolution must be positive");
            }
            if p.bands.is_empty() {
                bail!("{sensor} band list is empty");
            }
        }
        match self.dataset.mode {
            DatasetMode::General => {
                if self.sentinel_2.time_windows.len() != REQUIRED_WINDOWS {
                    bail!(
                        "general mode needs exactly {} anchor time windows, got {}",
                        REQUIRED_WINDOWS,
                        self.sentinel_2.time_windows.len()
                    );
                }
                for sensor in SensorId::STATIC {
                    if self.platform(sensor).year.is_none() {
                        bail!("{sensor} needs a year in general mode");
                    }
                }
                if self.land_cover_policy.allowed_classes.is_empty() {
                    bail!("land cover policy allows no classes");
                }
            }
            DatasetMode::Fire => {
                if !(0.0..=1.0).contains(&self.fire.burn_fraction) {
                    bail!(
                        "burn_fraction {} outside [0, 1]",
                        self.fire.burn_fraction
                    );
                }
                if self.fire.control_years == 0 {
                    bail!("fire mode needs at least one control year");
                }
            }
        }
        Ok(())
    }
}

fn default_na_value() -> f32 {
    -999.0
}

fn default_true() -> bool {
    true
}

fn default_allowed_classes() -> Vec<u8> {
    vec![1, 2, 5, 7, 8, 11]
}

fn default_rejected_classes() -> Vec<u8> {
    vec![4]
}

fn default_class_quota() -> usize {
    400
}

fn default_burn_fraction() -> f64 {
    0.30
}

fn default_control_years() -> usize {
    1
}

fn default_max_retries() -> u32 {
    10
}

fn default_backoff_secs() -> u64 {
    1
}

fn default_harmonize_bands() -> Vec<String> {
    [
        "B01", "B02", "B03", "B04", "B05", "B06", "B07", "B08", "B8A", "B09", "B10", "B11", "B12",
    ]
    .iter()
    .map(|b| b.to_string())
    .collect()
}
