//! QP thresholds an encoder exposes to an external quality scaler.

use crate::status::{EncoderError, EncoderResult};

/// Quantization-parameter bounds used for resolution scaling decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpThresholds {
    pub low: u32,
    pub high: u32,
}

impl QpThresholds {
    pub fn new(low: u32, high: u32) -> EncoderResult<Self> {
        if low > high {
            return Err(EncoderError::Parameter);
        }
        Ok(Self { low, high })
    }

    /// Convert from the signed form where `(-1, -1)` means "unset".
    pub fn from_raw(low: i32, high: i32) -> Option<Self> {
        if low < 0 || high < 0 {
            return None;
        }
        Self::new(low as u32, high as u32).ok()
    }
}

/// Whether an encoder takes part in QP-based resolution scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScalingSettings {
    pub enabled: bool,
    /// Absent while enabled means "scale on other criteria".
    pub thresholds: Option<QpThresholds>,
}

impl ScalingSettings {
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Scaling on, without QP thresholds.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            thresholds: None,
        }
    }

    pub fn with_thresholds(enabled: bool, thresholds: QpThresholds) -> Self {
        Self {
            enabled,
            thresholds: Some(thresholds),
        }
    }

    /// Thresholds to apply; `None` unless scaling is enabled.
    pub fn active_thresholds(&self) -> Option<QpThresholds> {
        if self.enabled {
            self.thresholds
        } else {
            None
        }
    }
}
