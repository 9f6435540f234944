//! Multi-sensor satellite training-chip generation.
//!
//! The pipeline turns a GeoJSON file of AOI polygons into co-registered
//! chip tensors: scenes are matched per sensor and time window, their
//! footprints intersected, every sensor stacked onto a grid derived
//! from the Sentinel-2 anchor, and candidate chips extracted, validated
//! and persisted with durable resume bookkeeping.

pub mod align;
pub mod aoi;
pub mod balance;
pub mod catalog;
pub mod config;
pub mod crs;
pub mod error;
pub mod extract;
pub mod grid;
pub mod ledger;
pub mod overlap;
pub mod pipeline;
pub mod select;
pub mod selector;
pub mod stac;
pub mod stack;
pub mod store;
pub mod writer;

pub use config::{Config, DatasetMode, SensorId};
pub use ledger::RunLedger;
pub use pipeline::AoiProcessor;
