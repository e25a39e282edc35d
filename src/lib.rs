//! gauge-reader - analog gauge readings from live or recorded video
//!
//! Each monitored source runs its own [`pipeline::SourceRunner`]: frames are
//! preprocessed, gauges detected and tracked, OCR evidence fused per track,
//! the needle and scale geometry recovered, and the needle angle converted
//! to a value through a robust multi-line calibration. Readings and alerts
//! go to the configured [`storage`] sinks.

pub mod analysis;
pub mod capture;
pub mod config;
pub mod error;
pub mod geometry;
pub mod pipeline;
pub mod storage;
pub mod tracking;
pub mod vision;

pub use error::GaugeError;
