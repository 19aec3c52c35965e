//! Scan sequencer: drives generators, stage and VNA through the nested
//! frequency × Y × X × Z acquisition loops and fills one
//! [`MeasurementFrame`] per frequency pair.
//!
//! The run is cooperative: a shared flag is checked after every Y and X move
//! and after every acquired point, and a raised flag unwinds every loop level
//! of the run. Instrument faults end the run early but never reach the
//! caller; whatever was acquired is still persisted and reported through
//! [`ScanEvent::Finished`].

use crossbeam_channel::Sender;
use log::{debug, Level};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::complex::complex_mean;
use crate::error::ScanError;
use crate::instrument::InstrumentLink;
use crate::slice::{extract_xz_slice, Payload, Plane};
use crate::store::RecordStore;
use crate::tensor::{MeasureRecord, MeasurementFrame};
use crate::types::{Axis, FrequencySweep, ScanConfig, ScanDelays, VnaSettings};
use crate::utils::format_eta;

/// What a partial-frame event carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PreviewMode {
    /// The X-Z plane at the Y row being acquired
    #[default]
    Slice,
    /// A snapshot of the whole frame
    Full,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencerSettings {
    pub vna: VnaSettings,
    /// Generator 1 power held while it retunes before a power override
    pub baseline_power_dbm: f64,
    pub preview: PreviewMode,
    pub comment: String,
}

impl Default for SequencerSettings {
    fn default() -> Self {
        Self {
            vna: VnaSettings::default(),
            baseline_power_dbm: -60.0,
            preview: PreviewMode::Slice,
            comment: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub percent: u32,
    pub completed: usize,
    pub total: usize,
    /// `None` until a throughput can be measured
    pub eta: Option<Duration>,
}

impl Progress {
    /// `percent = round(100·completed/total)`, ETA from the mean throughput so far
    pub fn estimate(completed: usize, total: usize, elapsed: Duration) -> Self {
        let percent = if total == 0 {
            100
        } else {
            (100.0 * completed as f64 / total as f64).round() as u32
        };
        let secs = elapsed.as_secs_f64();
        let eta = (completed > 0 && secs > 0.0).then(|| {
            let throughput = completed as f64 / secs;
            Duration::from_secs_f64(total.saturating_sub(completed) as f64 / throughput)
        });
        Self {
            percent,
            completed,
            total,
            eta,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Preview {
    Slice(Arc<Plane>),
    Full(Arc<MeasurementFrame>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub level: Level,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Failed {
        message: String,
        /// The hardware may be in an unknown state
        instrument_fault: bool,
    },
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub record: Arc<MeasureRecord>,
    pub outcome: RunOutcome,
    pub saved_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum ScanEvent {
    Progress(Progress),
    PartialFrame(Preview),
    Log(LogEvent),
    Finished(RunReport),
}

/// Z indices for X step `x_step`: descending on odd steps in snake mode
pub fn snake_order(len: usize, x_step: usize, snake: bool) -> Vec<usize> {
    if snake && x_step % 2 == 1 {
        (0..len).rev().collect()
    } else {
        (0..len).collect()
    }
}

/// Everything derived from the configuration before the first instrument call
struct RunPlan {
    scan: ScanConfig,
    delays: ScanDelays,
    pairs: Vec<(f64, f64)>,
    overrides: Option<Vec<f64>>,
    x: Vec<f64>,
    y: Vec<f64>,
    z: Vec<f64>,
}

impl RunPlan {
    fn new(scan: &ScanConfig, sweep: &FrequencySweep, delays: &ScanDelays) -> Result<Self, ScanError> {
        sweep.validate()?;
        scan.validate()?;
        Ok(Self {
            scan: scan.clone(),
            delays: delays.clone(),
            pairs: sweep.pairs(),
            overrides: sweep.normalized_overrides(),
            x: scan.x.positions(),
            y: scan.y.positions(),
            z: scan.z.positions(),
        })
    }

    fn total_steps(&self) -> usize {
        self.pairs.len() * self.x.len() * self.y.len() * self.z.len()
    }
}

struct RunState {
    record: MeasureRecord,
    frame: Option<MeasurementFrame>,
    frame_has_data: bool,
    completed: usize,
    total: usize,
    started: Instant,
}

impl RunState {
    /// Keep the current frame only if it acquired at least one sample
    fn flush_frame(&mut self) {
        if let Some(frame) = self.frame.take() {
            if self.frame_has_data {
                self.record.push_frame(frame);
            }
        }
        self.frame_has_data = false;
    }
}

pub struct ScanSequencer {
    link: InstrumentLink,
    settings: SequencerSettings,
    cancel: Arc<AtomicBool>,
    events: Sender<ScanEvent>,
    store: Option<RecordStore>,
}

impl ScanSequencer {
    pub fn new(link: InstrumentLink, settings: SequencerSettings, events: Sender<ScanEvent>) -> Self {
        Self {
            link,
            settings,
            cancel: Arc::new(AtomicBool::new(false)),
            events,
            store: None,
        }
    }

    /// Persist every finished run through `store`
    pub fn with_store(mut self, store: RecordStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Share an externally owned cancellation flag
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn settings(&self) -> &SequencerSettings {
        &self.settings
    }

    pub fn link_mut(&mut self) -> &mut InstrumentLink {
        &mut self.link
    }

    pub fn into_link(self) -> InstrumentLink {
        self.link
    }

    /// Run one scan to completion, cancellation or failure.
    ///
    /// Only pre-flight validation errors are returned, and those are raised
    /// before any instrument is touched. Every other outcome is reported in
    /// the returned [`RunReport`] and in the final [`ScanEvent::Finished`].
    pub fn run(
        &mut self,
        scan: &ScanConfig,
        sweep: &FrequencySweep,
        delays: &ScanDelays,
    ) -> Result<RunReport, ScanError> {
        let plan = RunPlan::new(scan, sweep, delays)?;

        let mut state = RunState {
            record: MeasureRecord::new(self.settings.comment.clone()),
            frame: None,
            frame_has_data: false,
            completed: 0,
            total: plan.total_steps(),
            started: Instant::now(),
        };

        self.log(
            Level::Info,
            format!(
                "Scan {} started: {} frequency pair(s), {} x {} x {} (Y x X x Z) positions",
                state.record.id,
                plan.pairs.len(),
                plan.y.len(),
                plan.x.len(),
                plan.z.len()
            ),
        );

        let outcome = match self.execute(&plan, &mut state) {
            Ok(false) => RunOutcome::Completed,
            Ok(true) => {
                self.log(Level::Warn, "Scan cancelled".to_string());
                RunOutcome::Cancelled
            }
            Err(e) => {
                self.log(Level::Error, format!("Scan aborted: {e}"));
                RunOutcome::Failed {
                    message: e.to_string(),
                    instrument_fault: e.is_instrument_fault(),
                }
            }
        };
        state.flush_frame();

        Ok(self.finish(state.record, outcome, state.started.elapsed()))
    }

    /// Returns `Ok(true)` when the run was cancelled
    fn execute(&mut self, plan: &RunPlan, state: &mut RunState) -> Result<bool, ScanError> {
        self.link.vna.configure(&self.settings.vna)?;
        self.log_initial_positions(&plan.scan)?;

        for (i, &(f1, f2)) in plan.pairs.iter().enumerate() {
            if self.is_cancelled() {
                return Ok(true);
            }
            let amp1 = plan.overrides.as_ref().and_then(|o| o.get(i).copied());
            self.tune_generators(f1, f2, amp1)?;
            self.log(
                Level::Info,
                format!(
                    "Frequency pair {}/{}: {f1:.4} GHz / {f2:.4} GHz",
                    i + 1,
                    plan.pairs.len()
                ),
            );

            state.frame = Some(MeasurementFrame::new(
                f1,
                f2,
                amp1,
                plan.x.clone(),
                plan.y.clone(),
                plan.z.clone(),
            ));
            state.frame_has_data = false;

            let cancelled = self.sweep_positions(plan, state)?;
            state.flush_frame();
            if cancelled {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn log_initial_positions(&mut self, scan: &ScanConfig) -> Result<(), ScanError> {
        for axis in Axis::ALL {
            if scan.axis(axis).enabled {
                let position = self.link.stage.get_position(axis)?;
                self.log(Level::Info, format!("Initial {axis} position: {position:.3}"));
            }
        }
        Ok(())
    }

    fn tune_generators(&mut self, f1_ghz: f64, f2_ghz: f64, amp1: Option<f64>) -> Result<(), ScanError> {
        if let Some(generator) = self.link.generator2.as_mut() {
            generator.set_frequency_hz(f2_ghz * 1e9)?;
        }
        let baseline = self.settings.baseline_power_dbm;
        if let Some(generator) = self.link.generator1.as_mut() {
            match amp1 {
                Some(power) => {
                    // Retune at low power so the new frequency never sees the old level
                    generator.set_power_dbm(baseline)?;
                    generator.set_frequency_hz(f1_ghz * 1e9)?;
                    generator.set_power_dbm(power)?;
                }
                None => generator.set_frequency_hz(f1_ghz * 1e9)?,
            }
        }
        Ok(())
    }

    /// Returns `Ok(true)` when the run was cancelled
    fn sweep_positions(&mut self, plan: &RunPlan, state: &mut RunState) -> Result<bool, ScanError> {
        let scan = &plan.scan;

        for (y_idx, &y) in plan.y.iter().enumerate() {
            if scan.y.enabled {
                self.move_and_settle(Axis::Y, y, plan.delays.movement(Axis::Y))?;
            }
            if self.is_cancelled() {
                return Ok(true);
            }

            for (x_idx, &x) in plan.x.iter().enumerate() {
                if scan.x.enabled {
                    self.move_and_settle(Axis::X, x, plan.delays.movement(Axis::X))?;
                }
                if self.is_cancelled() {
                    return Ok(true);
                }

                for z_idx in snake_order(plan.z.len(), x_idx, scan.snake) {
                    if scan.z.enabled {
                        self.move_and_settle(Axis::Z, plan.z[z_idx], plan.delays.movement(Axis::Z))?;
                    } else {
                        settle(plan.delays.no_movement());
                    }

                    self.acquire_point(state, y_idx, x_idx, z_idx)?;
                    if self.is_cancelled() {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    fn move_and_settle(&mut self, axis: Axis, position: f64, delay: Duration) -> Result<(), ScanError> {
        self.link.stage.move_axis(axis, position)?;
        settle(delay);
        Ok(())
    }

    fn acquire_point(
        &mut self,
        state: &mut RunState,
        y_idx: usize,
        x_idx: usize,
        z_idx: usize,
    ) -> Result<(), ScanError> {
        let trace = self.link.vna.get_trace()?;
        state.completed += 1;

        let expected = self.settings.vna.sweep_points.max(1);
        let matched = trace.matched_len();
        let mean = if matched < expected {
            Err(format!("{matched} of {expected} samples"))
        } else {
            match complex_mean(&trace.real, &trace.imag) {
                Some(mean) if mean.re.is_finite() && mean.im.is_finite() => Ok(mean),
                _ => Err("non-finite samples".to_string()),
            }
        };

        match (mean, state.frame.as_mut()) {
            (Ok(mean), Some(frame)) => {
                frame.set_sample(y_idx, x_idx, z_idx, mean);
                state.frame_has_data = true;
                debug!("Sample [{y_idx}][{x_idx}][{z_idx}] = {mean}");
            }
            (Ok(_), None) => {}
            (Err(reason), _) => self.log(
                Level::Warn,
                format!("Skipping point [{y_idx}][{x_idx}][{z_idx}]: {reason}"),
            ),
        }

        let progress = Progress::estimate(state.completed, state.total, state.started.elapsed());
        self.send(ScanEvent::Progress(progress));

        if state.frame_has_data {
            if let Some(frame) = &state.frame {
                let preview = match self.settings.preview {
                    PreviewMode::Slice => {
                        Preview::Slice(Arc::new(extract_xz_slice(Payload::Volume(frame), y_idx)))
                    }
                    PreviewMode::Full => Preview::Full(Arc::new(frame.clone())),
                };
                self.send(ScanEvent::PartialFrame(preview));
            }
        }
        Ok(())
    }

    fn finish(&self, record: MeasureRecord, outcome: RunOutcome, elapsed: Duration) -> RunReport {
        let saved_path = match &self.store {
            Some(store) => match store.save(&record) {
                Ok(path) => Some(path),
                Err(e) => {
                    self.log(Level::Error, format!("Failed to save record {}: {e}", record.id));
                    None
                }
            },
            None => None,
        };

        self.log(
            Level::Info,
            format!(
                "Scan {} finished ({outcome:?}) with {} frame(s) in {}",
                record.id,
                record.len(),
                format_eta(elapsed)
            ),
        );

        let report = RunReport {
            record: Arc::new(record),
            outcome,
            saved_path,
        };
        self.send(ScanEvent::Finished(report.clone()));
        report
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn log(&self, level: Level, message: String) {
        log::log!(level, "{message}");
        self.send(ScanEvent::Log(LogEvent { level, message }));
    }

    fn send(&self, event: ScanEvent) {
        // A consumer that went away must not stop the scan
        let _ = self.events.try_send(event);
    }
}

fn settle(delay: Duration) {
    if !delay.is_zero() {
        thread::sleep(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::sim::{InstrumentCall, MockInstruments};
    use crate::types::{AxisSweep, ChannelSweep};
    use crossbeam_channel::{unbounded, Receiver};
    use num_complex::Complex64;

    fn scan_5x4() -> ScanConfig {
        ScanConfig {
            x: AxisSweep::new(0.0, 4.0, 5),
            y: AxisSweep::disabled(),
            z: AxisSweep::new(10.0, 13.0, 4),
            snake: true,
        }
    }

    fn single_pair() -> FrequencySweep {
        FrequencySweep {
            channel1: ChannelSweep::fixed(142.35),
            channel2: ChannelSweep::fixed(142.35),
            amplitude_overrides: Vec::new(),
        }
    }

    fn sequencer(link: InstrumentLink) -> (ScanSequencer, Receiver<ScanEvent>) {
        let (tx, rx) = unbounded();
        (ScanSequencer::new(link, SequencerSettings::default(), tx), rx)
    }

    #[test]
    fn test_snake_order() {
        assert_eq!(snake_order(4, 0, true), vec![0, 1, 2, 3]);
        assert_eq!(snake_order(4, 1, true), vec![3, 2, 1, 0]);
        assert_eq!(snake_order(4, 1, false), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_progress_estimate() {
        let progress = Progress::estimate(5, 20, Duration::from_secs(10));
        assert_eq!(progress.percent, 25);
        assert_eq!(progress.eta, Some(Duration::from_secs(30)));
        assert_eq!(Progress::estimate(0, 20, Duration::from_secs(1)).eta, None);
        assert_eq!(Progress::estimate(1, 3, Duration::from_secs(1)).percent, 33);
    }

    #[test]
    fn test_mismatched_frequency_counts_rejected_before_any_call() {
        let (link, log) = MockInstruments::new().build();
        let (mut seq, rx) = sequencer(link);
        let sweep = FrequencySweep {
            channel1: ChannelSweep {
                start_ghz: 100.0,
                stop_ghz: 110.0,
                points: 10,
            },
            channel2: ChannelSweep {
                start_ghz: 100.0,
                stop_ghz: 110.0,
                points: 12,
            },
            amplitude_overrides: Vec::new(),
        };

        let result = seq.run(&scan_5x4(), &sweep, &ScanDelays::zero());
        assert!(matches!(
            result,
            Err(ScanError::FrequencyPointMismatch {
                channel1: 10,
                channel2: 12
            })
        ));
        assert!(log.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_run_fills_every_cell() {
        let value = Complex64::new(0.3, 0.4);
        let (link, log) = MockInstruments::new().value(value).build();
        let (mut seq, rx) = sequencer(link);

        let report = seq.run(&scan_5x4(), &single_pair(), &ScanDelays::zero()).unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.record.len(), 1);
        let frame = &report.record.data[0];
        assert_eq!(frame.shape(), (1, 5, 4));
        assert_eq!(frame.filled_cells(), 20);
        assert_eq!(frame.sample(0, 4, 3), Some(value));
        assert_eq!(frame.y, vec![0.0]);
        assert_eq!(log.traces(), 20);

        let events: Vec<ScanEvent> = rx.try_iter().collect();
        let last_progress = events
            .iter()
            .filter_map(|e| match e {
                ScanEvent::Progress(p) => Some(*p),
                _ => None,
            })
            .last()
            .unwrap();
        assert_eq!(last_progress.percent, 100);
        assert_eq!(last_progress.completed, 20);
        assert!(matches!(events.last(), Some(ScanEvent::Finished(_))));
    }

    #[test]
    fn test_cancellation_after_three_points_stops_every_loop() {
        let flag = Arc::new(AtomicBool::new(false));
        let (link, log) = MockInstruments::new().cancel_after(3, flag.clone()).build();
        let (tx, _rx) = unbounded();
        let mut seq =
            ScanSequencer::new(link, SequencerSettings::default(), tx).with_cancel_flag(flag);

        let two_pairs = FrequencySweep {
            channel1: ChannelSweep {
                start_ghz: 140.0,
                stop_ghz: 141.0,
                points: 2,
            },
            channel2: ChannelSweep {
                start_ghz: 140.0,
                stop_ghz: 141.0,
                points: 2,
            },
            amplitude_overrides: Vec::new(),
        };
        let report = seq.run(&scan_5x4(), &two_pairs, &ScanDelays::zero()).unwrap();

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(report.record.len(), 1);
        assert_eq!(report.record.data[0].filled_cells(), 3);

        let calls = log.calls();
        let last_trace = calls
            .iter()
            .rposition(|c| *c == InstrumentCall::GetTrace)
            .unwrap();
        assert_eq!(last_trace, calls.len() - 1);
        assert_eq!(log.traces(), 3);
        assert_eq!(log.count(|c| *c == InstrumentCall::EmergencyStop), 0);
    }

    #[test]
    fn test_short_trace_is_skipped_and_run_continues() {
        let (link, log) = MockInstruments::new().short_trace(2).build();
        let (mut seq, rx) = sequencer(link);
        let report = seq.run(&scan_5x4(), &single_pair(), &ScanDelays::zero()).unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.record.data[0].filled_cells(), 19);
        assert_eq!(log.traces(), 20);
        let warnings = rx
            .try_iter()
            .filter(|e| matches!(e, ScanEvent::Log(LogEvent { level: Level::Warn, .. })))
            .count();
        assert_eq!(warnings, 1);
    }

    #[test]
    fn test_instrument_fault_keeps_partial_data() {
        let (link, _log) = MockInstruments::new().fail_on_trace(3).build();
        let (mut seq, rx) = sequencer(link);
        let report = seq.run(&scan_5x4(), &single_pair(), &ScanDelays::zero()).unwrap();

        assert!(matches!(
            report.outcome,
            RunOutcome::Failed {
                instrument_fault: true,
                ..
            }
        ));
        assert_eq!(report.record.len(), 1);
        assert_eq!(report.record.data[0].filled_cells(), 2);
        let errors = rx
            .try_iter()
            .filter(|e| matches!(e, ScanEvent::Log(LogEvent { level: Level::Error, .. })))
            .count();
        assert_eq!(errors, 1);
    }

    #[test]
    fn test_generator_one_retunes_at_baseline_power() {
        let (link, log) = MockInstruments::new().build();
        let (mut seq, _rx) = sequencer(link);
        let sweep = FrequencySweep {
            channel1: ChannelSweep {
                start_ghz: 100.0,
                stop_ghz: 101.0,
                points: 2,
            },
            channel2: ChannelSweep {
                start_ghz: 50.0,
                stop_ghz: 50.0,
                points: 2,
            },
            amplitude_overrides: vec![-10.0],
        };
        let scan = ScanConfig {
            x: AxisSweep::disabled(),
            y: AxisSweep::disabled(),
            z: AxisSweep::disabled(),
            snake: false,
        };
        seq.run(&scan, &sweep, &ScanDelays::zero()).unwrap();

        let tuning: Vec<InstrumentCall> = log
            .calls()
            .into_iter()
            .filter(|c| {
                matches!(
                    c,
                    InstrumentCall::SetFrequency { .. } | InstrumentCall::SetPower { .. }
                )
            })
            .collect();
        assert_eq!(
            tuning[..4],
            [
                InstrumentCall::SetFrequency {
                    generator: 2,
                    frequency_hz: 50e9
                },
                InstrumentCall::SetPower {
                    generator: 1,
                    power_dbm: -60.0
                },
                InstrumentCall::SetFrequency {
                    generator: 1,
                    frequency_hz: 100e9
                },
                InstrumentCall::SetPower {
                    generator: 1,
                    power_dbm: -10.0
                },
            ]
        );
        // The override list is padded with its last value
        assert_eq!(
            tuning[7],
            InstrumentCall::SetPower {
                generator: 1,
                power_dbm: -10.0
            }
        );
    }

    #[test]
    fn test_disabled_axes_never_move_and_snake_reverses_z() {
        let (link, log) = MockInstruments::new().build();
        let (mut seq, _rx) = sequencer(link);
        let scan = ScanConfig {
            x: AxisSweep::new(0.0, 1.0, 2),
            y: AxisSweep::disabled(),
            z: AxisSweep::new(0.0, 2.0, 3),
            snake: true,
        };
        seq.run(&scan, &single_pair(), &ScanDelays::zero()).unwrap();

        let z_moves: Vec<f64> = log
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                InstrumentCall::MoveAxis(Axis::Z, z) => Some(z),
                _ => None,
            })
            .collect();
        assert_eq!(z_moves, vec![0.0, 1.0, 2.0, 2.0, 1.0, 0.0]);
        assert_eq!(
            log.count(|c| matches!(c, InstrumentCall::MoveAxis(Axis::Y, _))),
            0
        );
        assert_eq!(
            log.count(|c| matches!(c, InstrumentCall::GetPosition(_))),
            2
        );
    }

    #[test]
    fn test_frame_dropped_when_no_sample_acquired() {
        let (link, _log) = MockInstruments::new().short_trace(1).build();
        let (mut seq, _rx) = sequencer(link);
        let scan = ScanConfig {
            x: AxisSweep::disabled(),
            y: AxisSweep::disabled(),
            z: AxisSweep::disabled(),
            snake: false,
        };
        let report = seq.run(&scan, &single_pair(), &ScanDelays::zero()).unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert!(report.record.is_empty());
    }

    #[test]
    fn test_finished_run_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let (link, _log) = MockInstruments::new().build();
        let (tx, _rx) = unbounded();
        let mut seq = ScanSequencer::new(link, SequencerSettings::default(), tx)
            .with_store(RecordStore::new(dir.path()));

        let report = seq.run(&scan_5x4(), &single_pair(), &ScanDelays::zero()).unwrap();
        let path = report.saved_path.unwrap();
        assert!(path.exists());
        let loaded = RecordStore::load(&path).unwrap();
        assert_eq!(loaded.data[0].filled_cells(), 20);
    }

    fn scan_3y() -> ScanConfig {
        ScanConfig {
            x: AxisSweep::new(0.0, 1.0, 2),
            y: AxisSweep::new(0.0, 2.0, 3),
            z: AxisSweep::new(5.0, 6.0, 2),
            snake: true,
        }
    }

    #[test]
    fn test_non_finite_trace_is_skipped_and_record_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let (link, _log) = MockInstruments::new().non_finite_trace(2).build();
        let (tx, rx) = unbounded();
        let mut seq = ScanSequencer::new(link, SequencerSettings::default(), tx)
            .with_store(RecordStore::new(dir.path()));

        let report = seq.run(&scan_5x4(), &single_pair(), &ScanDelays::zero()).unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.record.data[0].filled_cells(), 19);
        let warnings = rx
            .try_iter()
            .filter(|e| matches!(e, ScanEvent::Log(LogEvent { level: Level::Warn, .. })))
            .count();
        assert_eq!(warnings, 1);

        let loaded = RecordStore::load(report.saved_path.unwrap()).unwrap();
        let frame = &loaded.data[0];
        assert_eq!(frame.filled_cells(), 19);
        assert!(frame.amplitude.iter().all(|v| v.is_finite()));
        assert!(frame.phase.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_y_enabled_run_fills_volume_and_previews_current_row() {
        let (link, log) = MockInstruments::new().build();
        let (mut seq, rx) = sequencer(link);
        let report = seq.run(&scan_3y(), &single_pair(), &ScanDelays::zero()).unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        let frame = &report.record.data[0];
        assert_eq!(frame.shape(), (3, 2, 2));
        assert_eq!(frame.filled_cells(), 12);
        assert_eq!(frame.y, vec![0.0, 1.0, 2.0]);

        let y_moves: Vec<f64> = log
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                InstrumentCall::MoveAxis(Axis::Y, y) => Some(y),
                _ => None,
            })
            .collect();
        assert_eq!(y_moves, vec![0.0, 1.0, 2.0]);

        let preview_rows: Vec<(Option<usize>, Option<f64>)> = rx
            .try_iter()
            .filter_map(|e| match e {
                ScanEvent::PartialFrame(Preview::Slice(plane)) => {
                    Some((plane.y_index, plane.y_value))
                }
                _ => None,
            })
            .collect();
        let expected: Vec<(Option<usize>, Option<f64>)> = (0..3)
            .flat_map(|y| std::iter::repeat_n((Some(y), Some(y as f64)), 4))
            .collect();
        assert_eq!(preview_rows, expected);
    }

    #[test]
    fn test_full_preview_mode_sends_frame_snapshots() {
        let (link, _log) = MockInstruments::new().build();
        let (tx, rx) = unbounded();
        let settings = SequencerSettings {
            preview: PreviewMode::Full,
            ..SequencerSettings::default()
        };
        let mut seq = ScanSequencer::new(link, settings, tx);
        seq.run(&scan_3y(), &single_pair(), &ScanDelays::zero()).unwrap();

        let filled: Vec<usize> = rx
            .try_iter()
            .filter_map(|e| match e {
                ScanEvent::PartialFrame(Preview::Full(frame)) => {
                    assert_eq!(frame.shape(), (3, 2, 2));
                    Some(frame.filled_cells())
                }
                ScanEvent::PartialFrame(Preview::Slice(_)) => panic!("slice preview in full mode"),
                _ => None,
            })
            .collect();
        assert_eq!(filled, (1..=12).collect::<Vec<_>>());
    }

    #[test]
    fn test_cancellation_after_y_move_skips_the_row() {
        let flag = Arc::new(AtomicBool::new(false));
        let (link, log) = MockInstruments::new()
            .cancel_on_move(Axis::Y, 2, flag.clone())
            .build();
        let (tx, _rx) = unbounded();
        let mut seq =
            ScanSequencer::new(link, SequencerSettings::default(), tx).with_cancel_flag(flag);

        let report = seq.run(&scan_3y(), &single_pair(), &ScanDelays::zero()).unwrap();
        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(report.record.len(), 1);
        assert_eq!(report.record.data[0].shape(), (3, 2, 2));
        assert_eq!(report.record.data[0].filled_cells(), 4);
        assert_eq!(log.traces(), 4);
        assert_eq!(log.calls().last(), Some(&InstrumentCall::MoveAxis(Axis::Y, 1.0)));
    }
}
