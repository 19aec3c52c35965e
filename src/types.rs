use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::ScanError;
use crate::utils::linspace;

/// Stage axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => write!(f, "X"),
            Axis::Y => write!(f, "Y"),
            Axis::Z => write!(f, "Z"),
        }
    }
}

/// Sweep settings for one stage axis, positions in millimeters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisSweep {
    pub enabled: bool,
    pub start: f64,
    pub stop: f64,
    pub points: usize,
}

impl AxisSweep {
    pub fn new(start: f64, stop: f64, points: usize) -> Self {
        Self {
            enabled: true,
            start,
            stop,
            points,
        }
    }

    /// A disabled axis that stays where it is
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            start: 0.0,
            stop: 0.0,
            points: 1,
        }
    }

    /// Positions visited along this axis; a disabled axis collapses to `[0.0]`
    pub fn positions(&self) -> Vec<f64> {
        if !self.enabled {
            return vec![0.0];
        }
        linspace(self.start, self.stop, self.points)
    }

    pub fn len(&self) -> usize {
        if self.enabled { self.points } else { 1 }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AxisSweep {
    fn default() -> Self {
        Self::new(-10.0, -90.0, 4)
    }
}

/// Geometry of a 3-axis scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    pub x: AxisSweep,
    pub y: AxisSweep,
    pub z: AxisSweep,
    /// Reverse the Z traversal on every odd X step
    pub snake: bool,
}

impl ScanConfig {
    pub fn axis(&self, axis: Axis) -> &AxisSweep {
        match axis {
            Axis::X => &self.x,
            Axis::Y => &self.y,
            Axis::Z => &self.z,
        }
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        for axis in Axis::ALL {
            let sweep = self.axis(axis);
            if sweep.enabled && sweep.points == 0 {
                return Err(ScanError::Config(format!(
                    "{axis} axis must have at least one point"
                )));
            }
        }
        Ok(())
    }

    /// Number of stage positions visited per frequency pair
    pub fn positions_per_frame(&self) -> usize {
        self.x.len() * self.y.len() * self.z.len()
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            x: AxisSweep::default(),
            y: AxisSweep::disabled(),
            z: AxisSweep::new(70.0, 90.0, 4),
            snake: true,
        }
    }
}

/// Settle delays in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanDelays {
    pub x_ms: u64,
    pub y_ms: u64,
    pub z_ms: u64,
    /// Used for every sample when Z does not move
    pub no_movement_ms: u64,
}

impl ScanDelays {
    pub fn zero() -> Self {
        Self {
            x_ms: 0,
            y_ms: 0,
            z_ms: 0,
            no_movement_ms: 0,
        }
    }

    pub fn movement(&self, axis: Axis) -> Duration {
        Duration::from_millis(match axis {
            Axis::X => self.x_ms,
            Axis::Y => self.y_ms,
            Axis::Z => self.z_ms,
        })
    }

    pub fn no_movement(&self) -> Duration {
        Duration::from_millis(self.no_movement_ms)
    }
}

impl Default for ScanDelays {
    fn default() -> Self {
        Self {
            x_ms: 100,
            y_ms: 150,
            z_ms: 200,
            no_movement_ms: 50,
        }
    }
}

/// One generator channel's frequency sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSweep {
    pub start_ghz: f64,
    pub stop_ghz: f64,
    pub points: usize,
}

impl ChannelSweep {
    pub fn fixed(freq_ghz: f64) -> Self {
        Self {
            start_ghz: freq_ghz,
            stop_ghz: freq_ghz,
            points: 1,
        }
    }
}

impl Default for ChannelSweep {
    fn default() -> Self {
        Self::fixed(0.0)
    }
}

/// Frequency plan for both generator channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FrequencySweep {
    pub channel1: ChannelSweep,
    pub channel2: ChannelSweep,
    /// Per-point power override for generator 1, in dBm
    #[serde(default)]
    pub amplitude_overrides: Vec<f64>,
}

impl FrequencySweep {
    /// Pre-flight check run before any instrument is touched
    pub fn validate(&self) -> Result<(), ScanError> {
        if self.channel1.points != self.channel2.points {
            return Err(ScanError::FrequencyPointMismatch {
                channel1: self.channel1.points,
                channel2: self.channel2.points,
            });
        }
        if self.channel1.points == 0 {
            return Err(ScanError::Config(
                "frequency sweep needs at least one point".to_string(),
            ));
        }
        Ok(())
    }

    pub fn point_count(&self) -> usize {
        self.channel1.points.min(self.channel2.points)
    }

    /// Frequency pairs in GHz, `(channel1, channel2)`
    pub fn pairs(&self) -> Vec<(f64, f64)> {
        let count = self.point_count();
        let f1 = linspace(self.channel1.start_ghz, self.channel1.stop_ghz, count);
        let f2 = linspace(self.channel2.start_ghz, self.channel2.stop_ghz, count);
        f1.into_iter().zip(f2).collect()
    }

    /// Override list padded with its last value or truncated to the point count.
    /// `None` when no override is configured.
    pub fn normalized_overrides(&self) -> Option<Vec<f64>> {
        normalize_overrides(&self.amplitude_overrides, self.point_count())
    }
}

pub fn normalize_overrides(overrides: &[f64], point_count: usize) -> Option<Vec<f64>> {
    let last = *overrides.last()?;
    let mut normalized: Vec<f64> = overrides.iter().copied().take(point_count).collect();
    normalized.resize(point_count, last);
    Some(normalized)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VnaParameter {
    AB,
    BA,
}

impl fmt::Display for VnaParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VnaParameter::AB => write!(f, "AB"),
            VnaParameter::BA => write!(f, "BA"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelFormat {
    Complex,
}

impl ChannelFormat {
    pub fn scpi(&self) -> &'static str {
        match self {
            ChannelFormat::Complex => "COMP",
        }
    }
}

/// One-time VNA setup applied at the start of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VnaSettings {
    pub parameter: VnaParameter,
    pub sweep_points: usize,
    pub power_dbm: f64,
    pub channel_format: ChannelFormat,
    pub averaging_count: u32,
    pub averaging_enabled: bool,
    pub bandwidth_hz: f64,
}

impl Default for VnaSettings {
    fn default() -> Self {
        Self {
            parameter: VnaParameter::BA,
            sweep_points: 100,
            power_dbm: -30.0,
            channel_format: ChannelFormat::Complex,
            averaging_count: 10,
            averaging_enabled: false,
            bandwidth_hz: 1000.0,
        }
    }
}

/// Real/imaginary sample arrays returned by one VNA query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trace {
    pub real: Vec<f64>,
    pub imag: Vec<f64>,
}

impl Trace {
    pub fn new(real: Vec<f64>, imag: Vec<f64>) -> Self {
        Self { real, imag }
    }

    /// Number of samples that have both a real and an imaginary part
    pub fn matched_len(&self) -> usize {
        self.real.len().min(self.imag.len())
    }
}
