use log::debug;

use super::scpi::{ScpiClient, ScpiTransport};
use super::SignalGenerator;
use crate::error::ScanError;

/// SCPI signal generator (`FREQ`, `POW`, `OUTP`)
pub struct ScpiGenerator<T: ScpiTransport = ScpiClient> {
    transport: T,
    name: String,
}

impl<T: ScpiTransport> ScpiGenerator<T> {
    pub fn new(name: impl Into<String>, transport: T) -> Self {
        Self {
            transport,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identify(&mut self) -> Result<String, ScanError> {
        self.transport.query("*IDN?")
    }

    pub fn set_output(&mut self, enabled: bool) -> Result<(), ScanError> {
        debug!("{}: output {}", self.name, if enabled { "on" } else { "off" });
        self.transport
            .write(if enabled { "OUTP ON" } else { "OUTP OFF" })
    }

    pub fn into_transport(self) -> T {
        self.transport
    }
}

impl<T: ScpiTransport> SignalGenerator for ScpiGenerator<T> {
    fn set_frequency_hz(&mut self, frequency_hz: f64) -> Result<(), ScanError> {
        debug!("{}: frequency {frequency_hz} Hz", self.name);
        self.transport.write(&format!("FREQ {frequency_hz}"))
    }

    fn set_power_dbm(&mut self, power_dbm: f64) -> Result<(), ScanError> {
        debug!("{}: power {power_dbm} dBm", self.name);
        self.transport.write(&format!("POW {power_dbm}"))
    }
}
