mod commands;

use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{info, warn, LevelFilter};
use nearfield_scan::{load_config, AppConfig};
use std::path::PathBuf;

/// Near-field scanner control
#[derive(Parser, Debug)]
#[command(name = "nf-scan")]
#[command(about = "Near-field scan acquisition and reference calibration", long_about = None)]
struct Args {
    /// Path to configuration file (defaults to ./nf-scan.toml when present)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a scan with the configured geometry and frequency plan
    Scan {
        /// Use simulated instruments instead of the SCPI devices
        #[arg(long)]
        simulate: bool,

        /// Comment stored with the record
        #[arg(long)]
        comment: Option<String>,
    },
    /// Push a stored record through the reference calibration
    Replay {
        /// Record file (meas_*.json)
        #[arg(required_unless_present = "demo")]
        file: Option<PathBuf>,

        /// Y row to slice each volume at (clamped)
        #[arg(long, default_value_t = 0)]
        y_index: usize,

        /// Reference point as `x,z` in axis units; repeatable
        #[arg(long = "ref", value_name = "X,Z", value_parser = commands::parse_reference)]
        references: Vec<(f64, f64)>,

        /// Replay a synthetic record instead of a file
        #[arg(long)]
        demo: bool,
    },
    /// Print record metadata
    Inspect {
        file: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Logging is not initialized yet; report a config failure afterwards
    let (config, config_error) = match load_config(args.config.as_deref()) {
        Ok(config) => (config, None),
        Err(e) => (AppConfig::default(), Some(e)),
    };
    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.console.verbosity.clone());
    initialize_logging(&log_level)?;

    info!("=== nf-scan ===");
    if let Some(e) = config_error {
        warn!("Failed to load config ({e}), using defaults");
    }
    if let Some(path) = &args.config {
        info!("Configuration: {}", path.display());
    }

    match args.command {
        Command::Scan { simulate, comment } => commands::run_scan(config, simulate, comment),
        Command::Replay {
            file,
            y_index,
            references,
            demo,
        } => commands::replay(file.as_deref(), y_index, &references, demo),
        Command::Inspect { file } => commands::inspect(&file),
    }
}

fn initialize_logging(log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{log_level}', using 'info'");
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .try_init()?;

    Ok(())
}
