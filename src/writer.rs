//! Chip artifact persistence. Deterministic names back the
//! existence-based resume logic.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use ndarray::ArrayView3;
use ndarray_npy::write_npy;

use crate::config::{ChipDtype, SensorId};
use crate::error::ChipError;

/// Artifact name of one temporal chip acquisition. `seq` is the
/// position of the date in the chip's date list.
pub fn temporal_chip_name(sensor: SensorId, chip_index: u64, seq: usize, date: NaiveDate) -> String {
    format!("{sensor}_{chip_index:06}_{seq}_{}.npy", date.format("%Y%m%d"))
}

/// Artifact name of a static-layer chip.
pub fn static_chip_name(sensor: SensorId, chip_index: u64) -> String {
    format!("{sensor}_{chip_index:06}.npy")
}

/// Artifact persistence seam. One [band, y, x] tensor per call.
pub trait ChipWriter {
    fn exists(&self, name: &str) -> bool;
    fn write(&self, name: &str, data: ArrayView3<f32>, dtype: ChipDtype) -> Result<(), ChipError>;
}

/// Writes chips as `.npy` tensors cast to the sensor's configured
/// dtype.
pub struct NpyChipWriter {
    dir: PathBuf,
}

impl NpyChipWriter {
    pub fn new(dir: &Path) -> std::io::Result<NpyChipWriter> {
        fs::create_dir_all(dir)?;
        Ok(NpyChipWriter { dir: dir.to_path_buf() })
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl ChipWriter for NpyChipWriter {
    fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    fn write(&self, name: &str, data: ArrayView3<f32>, dtype: ChipDtype) -> Result<(), ChipError> {
        let path = self.path(name);
        let result = match dtype {
            ChipDtype::Int16 => write_npy(&path, &data.mapv(|v| v as i16)),
            ChipDtype::Uint8 => write_npy(&path, &data.mapv(|v| v as u8)),
            ChipDtype::Float32 => write_npy(&path, &data),
        };
        result.map_err(|e| ChipError::Write(format!("{}: {e}", path.display())))
    }
}
