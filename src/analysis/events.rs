//! Alert evaluation
//!
//! Compares a reading with the region's threshold pair and emits at most one
//! alert per reading.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of a threshold violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    /// Reading fell below the minimum
    Low,
    /// Reading rose above the maximum
    High,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Low => "low",
            AlertStatus::High => "high",
        }
    }
}

/// Per-region bounds; either side may be unset
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl Threshold {
    pub fn new(min: Option<f64>, max: Option<f64>) -> Self {
        Self { min, max }
    }

    /// Violation status for `value`; the minimum check wins if both fire
    pub fn status(&self, value: f64) -> Option<AlertStatus> {
        if self.min.is_some_and(|min| value < min) {
            return Some(AlertStatus::Low);
        }
        if self.max.is_some_and(|max| value > max) {
            return Some(AlertStatus::High);
        }
        None
    }
}

/// A threshold violation for one reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub status: AlertStatus,
    pub reading: f64,
    pub timestamp: DateTime<Utc>,
}

/// Alert for a reading taken at `timestamp`, if it violates `threshold`
pub fn evaluate(threshold: &Threshold, reading: f64, timestamp: DateTime<Utc>) -> Option<AlertEvent> {
    threshold.status(reading).map(|status| AlertEvent {
        status,
        reading,
        timestamp,
    })
}
