//! Error taxonomy for the reading pipeline
//!
//! Every variant is recoverable: the source runner logs it and moves on to the
//! next region or frame. Only an explicit stop request ends a runner.

use thiserror::Error;

/// Failure reasons surfaced by capture, analysis and sinks
#[derive(Debug, Error)]
pub enum GaugeError {
    /// Capture could not be opened or a frame could not be read
    #[error("video source unavailable: {0}")]
    SourceUnavailable(String),

    /// The gauge detector found nothing in the frame
    #[error("no gauge detected in frame")]
    NoGaugeDetected,

    /// The landmark detector did not return a pivot point
    #[error("base landmark not detected")]
    MissingBase,

    /// The segmenter returned no needle instance
    #[error("needle not segmented")]
    MissingNeedle,

    /// Minimum/maximum landmarks stayed unresolved after every fallback
    #[error("landmarks unresolved after fallbacks: {0}")]
    IncompleteLandmarks(&'static str),

    /// Too few calibration samples, or no qualifying consensus line
    #[error("calibration failed: {0}")]
    CalibrationFailure(String),

    /// A model oracle call failed
    #[error("model oracle failed: {0:#}")]
    Oracle(anyhow::Error),

    /// A persistence, image or notification collaborator failed
    #[error("sink failed: {0:#}")]
    SinkFailure(anyhow::Error),
}

impl GaugeError {
    /// Expected outcomes that should not be logged above debug level
    pub fn is_expected(&self) -> bool {
        matches!(self, GaugeError::NoGaugeDetected)
    }
}
