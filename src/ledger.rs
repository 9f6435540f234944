//! Durable, resumable run bookkeeping: AOI status file plus the
//! append-only chip metadata table.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

use crate::aoi::{load_aois, save_aois, AoiStatus, AreaOfInterest};
use crate::config::SensorId;

pub const STATUS_FILE: &str = "aoi_status.geojson";
pub const METADATA_FILE: &str = "chip_metadata.csv";

/// One chip metadata row. General mode writes one row per sensor; fire
/// mode writes one row per (sensor, quarter) plus a gate summary row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChipRow {
    pub chip_index: u64,
    pub aoi_index: usize,
    pub sensor: String,
    /// Semicolon-joined acquisition dates, empty on failure rows.
    pub dates: String,
    pub land_cover: Option<u8>,
    pub footprint: Option<String>,
    pub epsg: Option<u32>,
    /// `""` in general mode, `event` or `control` in fire mode.
    pub period: String,
    pub status: String,
}

impl ChipRow {
    pub fn dates_joined(dates: &[chrono::NaiveDate]) -> String {
        dates.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(";")
    }
}

pub struct RunLedger {
    status_path: PathBuf,
    csv_path: PathBuf,
    aois: Vec<AreaOfInterest>,
    rows: Vec<ChipRow>,
    /// Chip indices per AOI in candidate order, so a reprocessed AOI
    /// reuses the indices its first attempt assigned.
    assigned: BTreeMap<usize, Vec<u64>>,
    next_chip_index: u64,
}

impl RunLedger {
    /// Open (or initialize) the ledger in `working_dir`. An existing
    /// status file wins over the dataset AOI file; existing metadata
    /// rows are loaded with most-recent-write dedup and the global
    /// chip index resumes past them.
    pub fn open(working_dir: &Path, aoi_file: &Path) -> Result<RunLedger> {
        fs::create_dir_all(working_dir)
            .with_context(|| format!("creating working dir {:?}", working_dir))?;
        let status_path = working_dir.join(STATUS_FILE);
        let csv_path = working_dir.join(METADATA_FILE);

        let aois = if status_path.exists() {
            info!("resuming from status file {:?}", status_path);
            load_aois(&status_path)?
        } else {
            let aois = load_aois(aoi_file)?;
            save_aois(&status_path, &aois)?;
            aois
        };

        let rows = if csv_path.exists() { load_rows(&csv_path)? } else { Vec::new() };
        let next_chip_index =
            rows.iter().map(|r| r.chip_index + 1).max().unwrap_or(0);
        let mut assigned: BTreeMap<usize, Vec<u64>> = BTreeMap::new();
        for row in &rows {
            let indices = assigned.entry(row.aoi_index).or_default();
            if !indices.contains(&row.chip_index) {
                indices.push(row.chip_index);
            }
        }
        info!(
            "ledger open: {} AOIs, {} metadata rows, next chip index {}",
            aois.len(),
            rows.len(),
            next_chip_index
        );
        Ok(RunLedger { status_path, csv_path, aois, rows, assigned, next_chip_index })
    }

    pub fn aois(&self) -> &[AreaOfInterest] {
        &self.aois
    }

    /// Indices of AOIs still to process; completed ones are skipped.
    pub fn pending(&self) -> Vec<usize> {
        self.aois
            .iter()
            .filter(|a| !a.status.is_done())
            .map(|a| a.index)
            .collect()
    }

    /// Transition one AOI and rewrite the status file.
    pub fn mark(&mut self, index: usize, status: AoiStatus) -> Result<()> {
        self.aois[index].status = status;
        save_aois(&self.status_path, &self.aois)
    }

    /// Chip index of the `ordinal`-th candidate of an AOI. Candidate
    /// enumeration is deterministic, so a rerun lands on the indices
    /// (and therefore artifact names) of the first attempt.
    pub fn chip_index(&mut self, aoi_index: usize, ordinal: usize) -> u64 {
        let indices = self.assigned.entry(aoi_index).or_default();
        if let Some(existing) = indices.get(ordinal) {
            return *existing;
        }
        let index = self.next_chip_index;
        self.next_chip_index += 1;
        indices.push(index);
        index
    }

    /// Whether a row for this (chip index, sensor, dates) was already
    /// written. Used to keep skip-by-artifact reruns row-free.
    pub fn has_row(&self, chip_index: u64, sensor: SensorId, dates: &str) -> bool {
        let sensor = sensor.to_string();
        self.rows
            .iter()
            .any(|r| r.chip_index == chip_index && r.sensor == sensor && r.dates == dates)
    }

    /// Append one row durably.
    pub fn append(&mut self, row: ChipRow) -> Result<()> {
        let existed = self.csv_path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.csv_path)
            .with_context(|| format!("opening {:?}", self.csv_path))?;
        let mut writer = csv::WriterBuilder::new().has_headers(!existed).from_writer(file);
        writer.serialize(&row).context("serializing chip metadata row")?;
        writer.flush().context("flushing chip metadata")?;
        self.rows.push(row);
        Ok(())
    }

    pub fn rows(&self) -> &[ChipRow] {
        &self.rows
    }
}

/// Read all rows, deduplicated by (chip index, sensor, dates) with the
/// most recent write winning, in first-seen order.
fn load_rows(path: &Path) -> Result<Vec<ChipRow>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("opening metadata file {:?}", path))?;
    let mut order: Vec<(u64, String, String)> = Vec::new();
    let mut latest: HashMap<(u64, String, String), ChipRow> = HashMap::new();
    for result in reader.deserialize() {
        let row: ChipRow = result.context("parsing chip metadata row")?;
        let key = (row.chip_index, row.sensor.clone(), row.dates.clone());
        if !latest.contains_key(&key) {
            order.push(key.clone());
        }
        latest.insert(key, row);
    }
    Ok(order
        .into_iter()
        .map(|key| latest.remove(&key).expect("key recorded on insert"))
        .collect())
}
