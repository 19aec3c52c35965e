use log::{debug, error, warn};
use std::thread;
use std::time::Duration;

use super::scpi::{ScpiClient, ScpiTransport};
use super::Vna;
use crate::error::ScanError;
use crate::types::{Trace, VnaSettings};

/// Model string reported by the analyzer the command set targets
pub const EXPECTED_MODEL: &str = "Rohde&Schwarz,ZVA67-4Port";

/// SCPI driver for a Rohde & Schwarz ZVA analyzer in CW mode
pub struct ScpiVna<T: ScpiTransport = ScpiClient> {
    transport: T,
    channel: u8,
    trace_name: String,
    data_attempts: u32,
    retry_pause: Duration,
}

impl<T: ScpiTransport> ScpiVna<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            channel: 1,
            trace_name: "Trc1".to_string(),
            data_attempts: 5,
            retry_pause: Duration::from_millis(50),
        }
    }

    /// Override how often an unusable data response is re-queried
    pub fn with_retry(mut self, attempts: u32, pause: Duration) -> Self {
        self.data_attempts = attempts.max(1);
        self.retry_pause = pause;
        self
    }

    pub fn identify(&mut self) -> Result<String, ScanError> {
        self.transport.query("*IDN?")
    }

    /// True when the instrument reports the expected model
    pub fn test(&mut self) -> Result<bool, ScanError> {
        Ok(self.identify()?.contains(EXPECTED_MODEL))
    }

    pub fn into_transport(self) -> T {
        self.transport
    }
}

/// Parse an interleaved `re,im,re,im,...` response. `None` when a field is
/// not a finite number or every value is zero.
fn parse_interleaved(response: &str) -> Option<Trace> {
    let values = response
        .split(',')
        .map(|field| field.trim().parse::<f64>())
        .collect::<Result<Vec<f64>, _>>()
        .ok()?;

    if values.iter().any(|v| !v.is_finite()) || values.iter().all(|v| *v == 0.0) {
        return None;
    }

    let real = values.iter().step_by(2).copied().collect();
    let imag = values.iter().skip(1).step_by(2).copied().collect();
    Some(Trace::new(real, imag))
}

impl<T: ScpiTransport> Vna for ScpiVna<T> {
    fn configure(&mut self, settings: &VnaSettings) -> Result<(), ScanError> {
        let ch = self.channel;
        let commands = [
            format!(
                "CALCulate{ch}:PARameter:DEFine {},{}",
                self.trace_name, settings.parameter
            ),
            "SWE:TYPE CW".to_string(),
            format!("SWE:POIN {}", settings.sweep_points),
            format!("SOUR:POW {}", settings.power_dbm),
            format!("CALC:FORM {}", settings.channel_format.scpi()),
            format!("SENSe{ch}:AVERage:COUNt {}", settings.averaging_count),
            format!(
                "SENSe{ch}:AVERage {}",
                if settings.averaging_enabled { "ON" } else { "OFF" }
            ),
            format!("SENS:BAND {}", settings.bandwidth_hz),
        ];
        for command in &commands {
            self.transport.write(command)?;
        }
        debug!("VNA configured: {settings:?}");
        Ok(())
    }

    fn get_trace(&mut self) -> Result<Trace, ScanError> {
        for attempt in 1..=self.data_attempts {
            let response = self.transport.query("CALC:DATA? FDAT")?;
            match parse_interleaved(&response) {
                Some(trace) => return Ok(trace),
                None => {
                    error!(
                        "Unusable VNA data (attempt {attempt}/{}): {:.40}",
                        self.data_attempts, response
                    );
                    thread::sleep(self.retry_pause);
                }
            }
        }
        warn!("No usable VNA data after {} attempts", self.data_attempts);
        Ok(Trace::default())
    }
}
