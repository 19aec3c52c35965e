//! Instrument Link: the narrow interfaces the scan sequencer drives.
//!
//! Each device is a trait object so a run can mix real SCPI instruments with
//! the simulated ones in [`sim`]. Every call may fail with a connection-level
//! [`ScanError`]; the sequencer treats that as terminal for the current run.

pub mod generator;
pub mod scpi;
pub mod sim;
pub mod vna;

use crate::error::ScanError;
use crate::types::{Axis, Trace, VnaSettings};

pub use generator::ScpiGenerator;
pub use scpi::{ConnectionConfig, ScpiClient, ScpiClientBuilder};
pub use vna::ScpiVna;

/// Motorized positioning stage
pub trait Stage: Send {
    /// Move `axis` to an absolute `position`, returning once motion has settled
    fn move_axis(&mut self, axis: Axis, position: f64) -> Result<(), ScanError>;

    fn get_position(&mut self, axis: Axis) -> Result<f64, ScanError>;

    /// Halt all axes immediately
    fn emergency_stop(&mut self) -> Result<(), ScanError>;

    /// Declare the current position of `axis` as its zero
    fn set_axis_origin(&mut self, axis: Axis) -> Result<(), ScanError>;
}

/// Vector network analyzer in CW mode
pub trait Vna: Send {
    fn configure(&mut self, settings: &VnaSettings) -> Result<(), ScanError>;

    /// One complex trace. A malformed or short trace is returned as-is; the
    /// caller decides whether it is usable.
    fn get_trace(&mut self) -> Result<Trace, ScanError>;
}

pub trait SignalGenerator: Send {
    fn set_frequency_hz(&mut self, frequency_hz: f64) -> Result<(), ScanError>;

    fn set_power_dbm(&mut self, power_dbm: f64) -> Result<(), ScanError>;
}

/// The set of devices one scan run drives. Generators are optional and
/// simply not commanded when absent.
pub struct InstrumentLink {
    pub stage: Box<dyn Stage>,
    pub vna: Box<dyn Vna>,
    pub generator1: Option<Box<dyn SignalGenerator>>,
    pub generator2: Option<Box<dyn SignalGenerator>>,
}

impl InstrumentLink {
    pub fn new(stage: Box<dyn Stage>, vna: Box<dyn Vna>) -> Self {
        Self {
            stage,
            vna,
            generator1: None,
            generator2: None,
        }
    }

    pub fn with_generator1(mut self, generator: Box<dyn SignalGenerator>) -> Self {
        self.generator1 = Some(generator);
        self
    }

    pub fn with_generator2(mut self, generator: Box<dyn SignalGenerator>) -> Self {
        self.generator2 = Some(generator);
        self
    }
}
