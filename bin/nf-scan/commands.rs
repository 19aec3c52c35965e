use crossbeam_channel::RecvTimeoutError;
use log::{error, info, warn};
use nearfield_scan::calibration::{calibrate_record, SummaryLimits};
use nearfield_scan::config::GeneratorConfig;
use nearfield_scan::instrument::sim::SimBench;
use nearfield_scan::instrument::vna::EXPECTED_MODEL;
use nearfield_scan::utils::format_eta;
use nearfield_scan::{
    demo_frame, plot_profile, profile_along_x, y_axis_of, AppConfig, ConnectionConfig,
    InstrumentLink, MeasureRecord, Payload, PlaneField, RecordStore, RunOutcome, RunReport,
    ScanEvent, ScanWorker, ScpiClient, ScpiGenerator, ScpiVna,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// `x,z` reference coordinate
pub fn parse_reference(s: &str) -> Result<(f64, f64), String> {
    let (x, z) = s
        .split_once(',')
        .ok_or_else(|| format!("expected X,Z but got '{s}'"))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<f64>()
            .map_err(|e| format!("invalid coordinate '{v}': {e}"))
    };
    Ok((parse(x)?, parse(z)?))
}

pub fn run_scan(config: AppConfig, simulate: bool, comment: Option<String>) -> CliResult {
    config.validate()?;

    let link = setup_instruments(&config, simulate)?;
    let mut settings = config.sequencer_settings();
    if let Some(comment) = comment {
        settings.comment = comment;
    }

    let (tx, rx) = crossbeam_channel::unbounded();
    let worker = ScanWorker::new(link, settings, tx)
        .with_store(RecordStore::new(&config.storage.output_dir));
    setup_shutdown_handler(worker.cancel_flag())?;

    info!(
        "Scan: {} frequency pair(s), {} positions per frame, records in {}",
        config.sweep.point_count(),
        config.scan.positions_per_frame(),
        config.storage.output_dir.display()
    );
    worker.start(config.scan.clone(), config.sweep.clone(), config.delays.clone())?;

    let mut last_percent = None;
    loop {
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(ScanEvent::Progress(progress)) => {
                if last_percent != Some(progress.percent) {
                    last_percent = Some(progress.percent);
                    let eta = progress
                        .eta
                        .map(format_eta)
                        .unwrap_or_else(|| "--:--:--".to_string());
                    info!(
                        "Progress: {}% ({}/{}), ETA {eta}",
                        progress.percent, progress.completed, progress.total
                    );
                }
            }
            // Already written to the log by the sequencer
            Ok(ScanEvent::Log(_)) | Ok(ScanEvent::PartialFrame(_)) => {}
            Ok(ScanEvent::Finished(report)) => {
                report_finished(&report);
                break;
            }
            Err(RecvTimeoutError::Timeout) if worker.is_running() => {}
            Err(_) => break,
        }
    }

    match worker.wait()? {
        Some(RunReport {
            outcome: RunOutcome::Failed { message, .. },
            ..
        }) => Err(message.into()),
        _ => Ok(()),
    }
}

fn setup_instruments(
    config: &AppConfig,
    simulate: bool,
) -> Result<InstrumentLink, Box<dyn std::error::Error>> {
    let mut link = SimBench::new().link();
    if simulate {
        info!("Using simulated instruments");
        return Ok(link);
    }

    let instruments = &config.instruments;
    let connection = instruments.connection();

    let client = ScpiClient::builder()
        .address(&instruments.vna.host)
        .port(instruments.vna.port)
        .config(connection.clone())
        .build()?;
    let mut vna = ScpiVna::new(client);
    let idn = vna.identify()?;
    if idn.contains(EXPECTED_MODEL) {
        info!("VNA: {idn}");
    } else {
        warn!("Unexpected VNA model: {idn}");
    }
    link.vna = Box::new(vna);

    link.generator1 = connect_generator("generator 1", &instruments.generator1, &connection)?;
    link.generator2 = connect_generator("generator 2", &instruments.generator2, &connection)?;

    warn!("No stage driver available; stage motion is simulated");
    Ok(link)
}

fn connect_generator(
    name: &str,
    config: &GeneratorConfig,
    connection: &ConnectionConfig,
) -> Result<Option<Box<dyn nearfield_scan::SignalGenerator>>, Box<dyn std::error::Error>> {
    if !config.enabled {
        info!("{name}: disabled");
        return Ok(None);
    }
    let client = ScpiClient::builder()
        .address(&config.host)
        .port(config.port)
        .config(connection.clone())
        .build()?;
    let mut generator = ScpiGenerator::new(name, client);
    info!("{name}: {}", generator.identify()?);
    generator.set_output(true)?;
    Ok(Some(Box::new(generator)))
}

fn setup_shutdown_handler(cancel: Arc<AtomicBool>) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        info!("Ctrl+C received - cancelling scan...");
        cancel.store(true, Ordering::SeqCst);
    })
}

fn report_finished(report: &RunReport) {
    match &report.outcome {
        RunOutcome::Completed => info!("✓ Scan completed"),
        RunOutcome::Cancelled => info!("✓ Scan stopped by user"),
        RunOutcome::Failed { message, .. } => error!("✗ Scan failed: {message}"),
    }
    info!("Frames acquired: {}", report.record.len());
    match &report.saved_path {
        Some(path) => info!("Record saved to {}", path.display()),
        None => warn!("Record was not saved"),
    }
}

pub fn replay(
    file: Option<&Path>,
    y_index: usize,
    references: &[(f64, f64)],
    demo: bool,
) -> CliResult {
    let record = match (demo, file) {
        (true, _) => {
            let mut record = MeasureRecord::new("demo");
            record.push_frame(demo_frame(41, 3, 31));
            record
        }
        (false, Some(path)) => RecordStore::load(path)?,
        (false, None) => return Err("a record file is required unless --demo is given".into()),
    };

    let Some(first) = record.data.first() else {
        warn!("Record contains no frames");
        return Ok(());
    };
    info!(
        "Y positions available: {:?}",
        y_axis_of(Payload::Volume(first))
    );

    let outputs = calibrate_record(&record, y_index, references, &SummaryLimits::default());
    for (frame, output) in record.data.iter().zip(&outputs) {
        let summary = &output.summary;
        match &summary.reference {
            Some(reference) => info!(
                "{:.4}/{:.4} GHz: {} reference point(s), {} dropped, mean {:.2} dB / {:.3} rad",
                frame.freq1,
                frame.freq2,
                summary.count,
                summary.dropped,
                reference.amplitude_db,
                reference.phase_rad
            ),
            None => info!(
                "{:.4}/{:.4} GHz: no reference applied",
                frame.freq1, frame.freq2
            ),
        }
    }

    if let Some(plane) = outputs.first().and_then(|o| o.corrected.as_ref()) {
        let (_, nz) = plane.shape();
        if let Some(profile) = profile_along_x(plane, PlaneField::Amplitude, nz / 2) {
            plot_profile(&profile, None, None)?;
        }
    }
    Ok(())
}

pub fn inspect(file: &Path) -> CliResult {
    let record = RecordStore::load(file)?;
    info!("Record: {}", record.id);
    info!("Created: {}", record.created.format("%Y-%m-%d %H:%M:%S"));
    info!("Comment: {}", record.comment);
    info!("Frames: {}", record.len());

    for (i, frame) in record.data.iter().enumerate() {
        let (ny, nx, nz) = frame.shape();
        info!(
            "  [{i}] {:.4}/{:.4} GHz, amp1 {}, Y x X x Z = {ny} x {nx} x {nz}, {} filled, complex: {}",
            frame.freq1,
            frame.freq2,
            frame
                .amp1
                .map_or_else(|| "-".to_string(), |a| format!("{a:.1} dBm")),
            frame.filled_cells(),
            if frame.complex_real.is_some() { "yes" } else { "legacy" }
        );
    }
    Ok(())
}
