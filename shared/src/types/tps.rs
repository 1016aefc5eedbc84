//! Tick-rate status values
//!
//! What a status query sees: a rolling average, how healthy it is, and a
//! compact textual rendering.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Health tier of a tick rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TpsHealth {
    Healthy,
    Degraded,
    Poor,
}

impl TpsHealth {
    pub const HEALTHY_THRESHOLD: f64 = 18.0;
    pub const DEGRADED_THRESHOLD: f64 = 16.0;

    pub fn classify(tps: f64) -> Self {
        if tps >= Self::HEALTHY_THRESHOLD {
            TpsHealth::Healthy
        } else if tps >= Self::DEGRADED_THRESHOLD {
            TpsHealth::Degraded
        } else {
            TpsHealth::Poor
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Poor => "poor",
        }
    }
}

/// One rolling average as presented to an operator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TpsReading {
    /// Window length in seconds
    pub window_secs: u64,
    /// Raw average in ticks per second
    pub value: f64,
    pub health: TpsHealth,
    /// Measurement slack pushed the value above the nominal rate
    pub above_nominal: bool,
    /// Value rounded to two decimals and capped at the nominal rate
    pub display: f64,
}

impl TpsReading {
    pub fn new(window_secs: u64, value: f64, nominal: f64) -> Self {
        Self {
            window_secs,
            value,
            health: TpsHealth::classify(value),
            above_nominal: value > nominal,
            display: ((value * 100.0).round() / 100.0).min(nominal),
        }
    }
}

impl fmt::Display for TpsReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.above_nominal {
            write!(f, "*")?;
        }
        write!(f, "{}", self.display)
    }
}

/// All rolling averages at one instant, shortest window first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TpsSnapshot {
    pub readings: Vec<TpsReading>,
}

impl TpsSnapshot {
    pub fn window(&self, secs: u64) -> Option<&TpsReading> {
        self.readings.iter().find(|r| r.window_secs == secs)
    }

    /// Worst tier among all windows
    pub fn worst(&self) -> Option<TpsHealth> {
        self.readings
            .iter()
            .map(|r| r.health)
            .max_by_key(|h| match h {
                TpsHealth::Healthy => 0,
                TpsHealth::Degraded => 1,
                TpsHealth::Poor => 2,
            })
    }
}

impl fmt::Display for TpsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, reading) in self.readings.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", reading)?;
        }
        Ok(())
    }
}
