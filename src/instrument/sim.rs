//! Simulated instruments.
//!
//! [`SimBench`] is a deterministic dry-run bench whose VNA reports the
//! synthetic near field at the stage's current position. [`MockInstruments`]
//! is a scripted link for tests: it records every call and can inject short
//! traces, faults and a cancellation after a given number of acquisitions.

use num_complex::Complex64;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::{InstrumentLink, SignalGenerator, Stage, Vna};
use crate::error::ScanError;
use crate::tensor::demo_field;
use crate::types::{Axis, Trace, VnaSettings};

fn axis_slot(axis: Axis) -> usize {
    match axis {
        Axis::X => 0,
        Axis::Y => 1,
        Axis::Z => 2,
    }
}

#[derive(Debug)]
struct BenchState {
    position: [f64; 3],
    frequency_hz: [f64; 2],
    power_dbm: [f64; 2],
    sweep_points: usize,
}

impl Default for BenchState {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            frequency_hz: [0.0; 2],
            power_dbm: [-60.0; 2],
            sweep_points: VnaSettings::default().sweep_points,
        }
    }
}

/// Simulated stage, VNA and two generators sharing one physical state
#[derive(Clone, Default)]
pub struct SimBench {
    state: Arc<Mutex<BenchState>>,
    settle: Duration,
}

impl SimBench {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extra time each simulated move blocks for
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn link(&self) -> InstrumentLink {
        InstrumentLink::new(
            Box::new(SimStage {
                state: self.state.clone(),
                settle: self.settle,
            }),
            Box::new(SimVna {
                state: self.state.clone(),
            }),
        )
        .with_generator1(Box::new(SimGenerator {
            state: self.state.clone(),
            channel: 0,
        }))
        .with_generator2(Box::new(SimGenerator {
            state: self.state.clone(),
            channel: 1,
        }))
    }

    pub fn position(&self, axis: Axis) -> f64 {
        self.state.lock().position[axis_slot(axis)]
    }

    pub fn generator_frequency_hz(&self, channel: usize) -> Option<f64> {
        self.state.lock().frequency_hz.get(channel).copied()
    }
}

struct SimStage {
    state: Arc<Mutex<BenchState>>,
    settle: Duration,
}

impl Stage for SimStage {
    fn move_axis(&mut self, axis: Axis, position: f64) -> Result<(), ScanError> {
        self.state.lock().position[axis_slot(axis)] = position;
        if !self.settle.is_zero() {
            thread::sleep(self.settle);
        }
        Ok(())
    }

    fn get_position(&mut self, axis: Axis) -> Result<f64, ScanError> {
        Ok(self.state.lock().position[axis_slot(axis)])
    }

    fn emergency_stop(&mut self) -> Result<(), ScanError> {
        Ok(())
    }

    fn set_axis_origin(&mut self, axis: Axis) -> Result<(), ScanError> {
        self.state.lock().position[axis_slot(axis)] = 0.0;
        Ok(())
    }
}

struct SimVna {
    state: Arc<Mutex<BenchState>>,
}

impl Vna for SimVna {
    fn configure(&mut self, settings: &VnaSettings) -> Result<(), ScanError> {
        self.state.lock().sweep_points = settings.sweep_points;
        Ok(())
    }

    fn get_trace(&mut self) -> Result<Trace, ScanError> {
        let state = self.state.lock();
        let [x, y, z] = state.position;
        // Y and the generator detuning rotate the field slightly
        let detune_ghz = (state.frequency_hz[0] - state.frequency_hz[1]) / 1e9;
        let gain = Complex64::from_polar(1.0 + 0.05 * (0.8 * y).cos(), 0.25 * y + 0.1 * detune_ghz);
        let value = demo_field(x, z) * gain;
        let n = state.sweep_points.max(1);
        Ok(Trace::new(vec![value.re; n], vec![value.im; n]))
    }
}

struct SimGenerator {
    state: Arc<Mutex<BenchState>>,
    channel: usize,
}

impl SignalGenerator for SimGenerator {
    fn set_frequency_hz(&mut self, frequency_hz: f64) -> Result<(), ScanError> {
        self.state.lock().frequency_hz[self.channel] = frequency_hz;
        Ok(())
    }

    fn set_power_dbm(&mut self, power_dbm: f64) -> Result<(), ScanError> {
        self.state.lock().power_dbm[self.channel] = power_dbm;
        Ok(())
    }
}

/// One recorded Instrument Link call
#[derive(Debug, Clone, PartialEq)]
pub enum InstrumentCall {
    MoveAxis(Axis, f64),
    GetPosition(Axis),
    EmergencyStop,
    SetAxisOrigin(Axis),
    Configure,
    GetTrace,
    SetFrequency { generator: u8, frequency_hz: f64 },
    SetPower { generator: u8, power_dbm: f64 },
}

struct MockState {
    calls: Vec<InstrumentCall>,
    traces_served: usize,
    sweep_points: usize,
    value: Complex64,
    short_traces: HashSet<usize>,
    non_finite_traces: HashSet<usize>,
    fail_on_trace: Option<usize>,
    cancel_after: Option<(usize, Arc<AtomicBool>)>,
    cancel_on_move: Option<(Axis, usize, Arc<AtomicBool>)>,
}

/// Shared view of everything a mock link was asked to do
#[derive(Clone)]
pub struct CallLog(Arc<Mutex<MockState>>);

impl CallLog {
    pub fn calls(&self) -> Vec<InstrumentCall> {
        self.0.lock().calls.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().calls.is_empty()
    }

    pub fn count(&self, predicate: impl Fn(&InstrumentCall) -> bool) -> usize {
        self.0.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    pub fn traces(&self) -> usize {
        self.count(|c| matches!(c, InstrumentCall::GetTrace))
    }
}

/// Builder for a scripted [`InstrumentLink`]
pub struct MockInstruments {
    value: Complex64,
    short_traces: HashSet<usize>,
    non_finite_traces: HashSet<usize>,
    fail_on_trace: Option<usize>,
    cancel_after: Option<(usize, Arc<AtomicBool>)>,
    cancel_on_move: Option<(Axis, usize, Arc<AtomicBool>)>,
    generators: u8,
}

impl Default for MockInstruments {
    fn default() -> Self {
        Self {
            value: Complex64::new(0.5, -0.25),
            short_traces: HashSet::new(),
            non_finite_traces: HashSet::new(),
            fail_on_trace: None,
            cancel_after: None,
            cancel_on_move: None,
            generators: 2,
        }
    }
}

impl MockInstruments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Complex value every full trace reports
    pub fn value(mut self, value: Complex64) -> Self {
        self.value = value;
        self
    }

    /// Make the `n`-th trace (1-based) come back without imaginary samples
    pub fn short_trace(mut self, n: usize) -> Self {
        self.short_traces.insert(n);
        self
    }

    /// Make the `n`-th trace (1-based) carry NaN real samples
    pub fn non_finite_trace(mut self, n: usize) -> Self {
        self.non_finite_traces.insert(n);
        self
    }

    /// Make the `n`-th trace request (1-based) fail with a connection fault
    pub fn fail_on_trace(mut self, n: usize) -> Self {
        self.fail_on_trace = Some(n);
        self
    }

    /// Raise `flag` as the `n`-th trace is served
    pub fn cancel_after(mut self, n: usize, flag: Arc<AtomicBool>) -> Self {
        self.cancel_after = Some((n, flag));
        self
    }

    /// Raise `flag` on the `n`-th move (1-based) of `axis`
    pub fn cancel_on_move(mut self, axis: Axis, n: usize, flag: Arc<AtomicBool>) -> Self {
        self.cancel_on_move = Some((axis, n, flag));
        self
    }

    pub fn generators(mut self, count: u8) -> Self {
        self.generators = count.min(2);
        self
    }

    pub fn build(self) -> (InstrumentLink, CallLog) {
        let shared = Arc::new(Mutex::new(MockState {
            calls: Vec::new(),
            traces_served: 0,
            sweep_points: VnaSettings::default().sweep_points,
            value: self.value,
            short_traces: self.short_traces,
            non_finite_traces: self.non_finite_traces,
            fail_on_trace: self.fail_on_trace,
            cancel_after: self.cancel_after,
            cancel_on_move: self.cancel_on_move,
        }));

        let mut link = InstrumentLink::new(
            Box::new(MockStage(shared.clone())),
            Box::new(MockVna(shared.clone())),
        );
        if self.generators >= 1 {
            link = link.with_generator1(Box::new(MockGenerator {
                shared: shared.clone(),
                generator: 1,
            }));
        }
        if self.generators >= 2 {
            link = link.with_generator2(Box::new(MockGenerator {
                shared: shared.clone(),
                generator: 2,
            }));
        }
        (link, CallLog(shared))
    }
}

struct MockStage(Arc<Mutex<MockState>>);

impl Stage for MockStage {
    fn move_axis(&mut self, axis: Axis, position: f64) -> Result<(), ScanError> {
        let mut state = self.0.lock();
        state.calls.push(InstrumentCall::MoveAxis(axis, position));
        if let Some((cancel_axis, n, flag)) = &state.cancel_on_move {
            let moves = state
                .calls
                .iter()
                .filter(|c| matches!(c, InstrumentCall::MoveAxis(a, _) if a == cancel_axis))
                .count();
            if moves == *n {
                flag.store(true, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    fn get_position(&mut self, axis: Axis) -> Result<f64, ScanError> {
        self.0.lock().calls.push(InstrumentCall::GetPosition(axis));
        Ok(0.0)
    }

    fn emergency_stop(&mut self) -> Result<(), ScanError> {
        self.0.lock().calls.push(InstrumentCall::EmergencyStop);
        Ok(())
    }

    fn set_axis_origin(&mut self, axis: Axis) -> Result<(), ScanError> {
        self.0.lock().calls.push(InstrumentCall::SetAxisOrigin(axis));
        Ok(())
    }
}

struct MockVna(Arc<Mutex<MockState>>);

impl Vna for MockVna {
    fn configure(&mut self, settings: &VnaSettings) -> Result<(), ScanError> {
        let mut state = self.0.lock();
        state.calls.push(InstrumentCall::Configure);
        state.sweep_points = settings.sweep_points;
        Ok(())
    }

    fn get_trace(&mut self) -> Result<Trace, ScanError> {
        let mut state = self.0.lock();
        state.calls.push(InstrumentCall::GetTrace);
        state.traces_served += 1;
        let n = state.traces_served;

        if state.fail_on_trace == Some(n) {
            return Err(ScanError::Connection("mock VNA disconnected".to_string()));
        }
        if let Some((after, flag)) = &state.cancel_after {
            if *after == n {
                flag.store(true, Ordering::SeqCst);
            }
        }

        let points = state.sweep_points.max(1);
        let real = vec![state.value.re; points];
        if state.short_traces.contains(&n) {
            return Ok(Trace::new(real, Vec::new()));
        }
        if state.non_finite_traces.contains(&n) {
            return Ok(Trace::new(vec![f64::NAN; points], vec![state.value.im; points]));
        }
        Ok(Trace::new(real, vec![state.value.im; points]))
    }
}

struct MockGenerator {
    shared: Arc<Mutex<MockState>>,
    generator: u8,
}

impl SignalGenerator for MockGenerator {
    fn set_frequency_hz(&mut self, frequency_hz: f64) -> Result<(), ScanError> {
        self.shared.lock().calls.push(InstrumentCall::SetFrequency {
            generator: self.generator,
            frequency_hz,
        });
        Ok(())
    }

    fn set_power_dbm(&mut self, power_dbm: f64) -> Result<(), ScanError> {
        self.shared.lock().calls.push(InstrumentCall::SetPower {
            generator: self.generator,
            power_dbm,
        });
        Ok(())
    }
}
