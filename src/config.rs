use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ScanError;
use crate::instrument::ConnectionConfig;
use crate::sequencer::{PreviewMode, SequencerSettings};
use crate::types::{ChannelSweep, FrequencySweep, ScanConfig, ScanDelays, VnaSettings};

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct AppConfig {
    pub instruments: InstrumentsConfig,
    pub vna: VnaSettings,
    pub scan: ScanConfig,
    pub sweep: FrequencySweep,
    pub delays: ScanDelays,
    pub sequencer: SequencerConfig,
    pub storage: StorageConfig,
    pub console: ConsoleConfig,
}

impl AppConfig {
    /// Pre-flight checks for a scan run
    pub fn validate(&self) -> Result<(), ScanError> {
        self.sweep.validate()?;
        self.scan.validate()?;
        if self.vna.sweep_points == 0 {
            return Err(ScanError::Config("vna.sweep_points must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn sequencer_settings(&self) -> SequencerSettings {
        SequencerSettings {
            vna: self.vna.clone(),
            baseline_power_dbm: self.sequencer.baseline_power_dbm,
            preview: self.sequencer.preview,
            comment: self.sequencer.comment.clone(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            instruments: InstrumentsConfig::default(),
            vna: VnaSettings::default(),
            scan: ScanConfig::default(),
            sweep: FrequencySweep {
                channel1: ChannelSweep::fixed(142.35),
                channel2: ChannelSweep::fixed(142.35),
                amplitude_overrides: Vec::new(),
            },
            delays: ScanDelays::default(),
            sequencer: SequencerConfig::default(),
            storage: StorageConfig::default(),
            console: ConsoleConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct GeneratorConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct InstrumentsConfig {
    pub vna: EndpointConfig,
    pub generator1: GeneratorConfig,
    pub generator2: GeneratorConfig,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl InstrumentsConfig {
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }
}

impl Default for InstrumentsConfig {
    fn default() -> Self {
        Self {
            vna: EndpointConfig {
                host: "169.254.106.189".to_string(),
                port: 5025,
            },
            generator1: GeneratorConfig {
                enabled: true,
                host: "169.254.106.190".to_string(),
                port: 5025,
            },
            generator2: GeneratorConfig {
                enabled: true,
                host: "169.254.106.191".to_string(),
                port: 5025,
            },
            connect_timeout_ms: 5_000,
            read_timeout_ms: 10_000,
            write_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SequencerConfig {
    pub baseline_power_dbm: f64,
    pub preview: PreviewMode,
    pub comment: String,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        let settings = SequencerSettings::default();
        Self {
            baseline_power_dbm: settings.baseline_power_dbm,
            preview: settings.preview,
            comment: settings.comment,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StorageConfig {
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./measurements"),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ConsoleConfig {
    pub verbosity: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            verbosity: "info".to_string(),
        }
    }
}

/// Defaults, then the TOML file, then `NF_SCAN` environment overrides
/// (`__` separates nested keys, e.g. `NF_SCAN_SCAN__X__POINTS=12`)
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else if Path::new("nf-scan.toml").exists() {
        builder = builder.add_source(File::with_name("nf-scan.toml"));
    }

    builder = builder.add_source(
        Environment::with_prefix("NF_SCAN")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize::<AppConfig>()
}

pub fn load_config_or_default(config_path: Option<&Path>) -> AppConfig {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::warn!("Failed to load config ({e}), using defaults");
            AppConfig::default()
        }
    }
}
