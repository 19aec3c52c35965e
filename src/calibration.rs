//! Coherent background subtraction on X-Z planes.
//!
//! The engine keeps a user-chosen set of reference grid cells, averages their
//! complex values and subtracts that mean from every cell of the current raw
//! plane. The same selection is reapplied to every plane pushed in, whether it
//! comes live from a running scan or from a replayed record.

use crossbeam_channel::{Sender, TrySendError};
use log::debug;
use ndarray::{Array2, Zip};
use num_complex::Complex64;
use rayon::prelude::*;
use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;

use crate::complex::{amplitude_db, phase_rad, polar_to_complex};
use crate::slice::{extract_xz_slice, Payload, Plane};
use crate::tensor::MeasureRecord;
use crate::utils::nearest_index;

/// Grid cell key `(x_index, z_index)`
pub type CellKey = (usize, usize);

/// Ordered, duplicate-free reference cells with a change counter
#[derive(Debug, Clone, Default)]
pub struct ReferenceSelection {
    points: Vec<CellKey>,
    members: HashSet<CellKey>,
    version: u64,
}

impl ReferenceSelection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `key` unless already selected. Returns whether it was added.
    pub fn push(&mut self, key: CellKey) -> bool {
        if !self.members.insert(key) {
            return false;
        }
        self.points.push(key);
        self.version += 1;
        true
    }

    pub fn pop(&mut self) -> Option<CellKey> {
        let key = self.points.pop()?;
        self.members.remove(&key);
        self.version += 1;
        Some(key)
    }

    /// Returns false when there was nothing to clear
    pub fn clear(&mut self) -> bool {
        if self.points.is_empty() {
            return false;
        }
        self.points.clear();
        self.members.clear();
        self.version += 1;
        true
    }

    pub fn points(&self) -> &[CellKey] {
        &self.points
    }

    pub fn contains(&self, key: CellKey) -> bool {
        self.members.contains(&key)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Caps on the UI-facing summary. They never affect the numeric correction.
#[derive(Debug, Clone)]
pub struct SummaryLimits {
    pub preview_points: usize,
    pub detail_points: usize,
    pub scatter_points: usize,
}

impl Default for SummaryLimits {
    fn default() -> Self {
        Self {
            preview_points: 4,
            detail_points: 30,
            scatter_points: 1200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferencePoint {
    pub x: f64,
    pub z: f64,
    pub real: f64,
    pub imag: f64,
}

/// Mean of the selected cells in rectangular and polar form
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceValue {
    pub real: f64,
    pub imag: f64,
    pub amplitude_db: f64,
    pub phase_rad: f64,
}

impl From<Complex64> for ReferenceValue {
    fn from(value: Complex64) -> Self {
        Self {
            real: value.re,
            imag: value.im,
            amplitude_db: amplitude_db(value),
            phase_rad: phase_rad(value),
        }
    }
}

/// Changes whenever the selection or the plane's axes change
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderKey {
    pub version: u64,
    pub x_len: usize,
    pub z_len: usize,
    pub x_first: f64,
    pub x_last: f64,
    pub z_first: f64,
    pub z_last: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectionSummary {
    pub preview: Vec<ReferencePoint>,
    pub detail: Vec<ReferencePoint>,
    pub detail_truncated: bool,
    pub scatter_x: Vec<f64>,
    pub scatter_z: Vec<f64>,
    /// Selected cells that fit the current plane
    pub count: usize,
    /// Selected cells outside the current plane's shape
    pub dropped: usize,
    pub version: u64,
    pub render_key: Option<RenderKey>,
    pub reference: Option<ReferenceValue>,
}

impl SelectionSummary {
    fn empty(version: u64, dropped: usize) -> Self {
        Self {
            version,
            dropped,
            ..Self::default()
        }
    }
}

/// Result of one recompute cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationOutput {
    /// `None` until a raw plane has been set
    pub corrected: Option<Plane>,
    pub summary: SelectionSummary,
}

#[derive(Debug, Clone)]
pub enum CalibrationEvent {
    SelectionChanged(SelectionSummary),
    CorrectedData(Arc<Plane>),
}

pub struct CalibrationEngine {
    raw: Option<Plane>,
    selection: ReferenceSelection,
    collection_enabled: bool,
    limits: SummaryLimits,
    event_sender: Option<Sender<CalibrationEvent>>,
}

impl Default for CalibrationEngine {
    fn default() -> Self {
        Self::new(SummaryLimits::default())
    }
}

impl CalibrationEngine {
    pub fn new(limits: SummaryLimits) -> Self {
        Self {
            raw: None,
            selection: ReferenceSelection::new(),
            collection_enabled: true,
            limits,
            event_sender: None,
        }
    }

    /// Deliver every recompute result on `sender`
    pub fn set_event_sender(&mut self, sender: Sender<CalibrationEvent>) {
        self.event_sender = Some(sender);
    }

    pub fn selection(&self) -> &ReferenceSelection {
        &self.selection
    }

    pub fn raw_data(&self) -> Option<&Plane> {
        self.raw.as_ref()
    }

    pub fn collection_enabled(&self) -> bool {
        self.collection_enabled
    }

    pub fn set_raw_data(&mut self, plane: Plane) -> CalibrationOutput {
        self.raw = Some(plane);
        self.emit()
    }

    /// Snap `(x_coord, z_coord)` to the nearest grid cell and select it.
    /// `None` when nothing changed.
    pub fn add_point(&mut self, x_coord: f64, z_coord: f64) -> Option<CalibrationOutput> {
        if !self.collection_enabled {
            return None;
        }
        let raw = self.raw.as_ref()?;
        let (rows, cols) = raw.amplitude.dim();
        let x_axis = axis_or_indices(&raw.x, rows);
        let z_axis = axis_or_indices(&raw.z, cols);

        let key = (
            nearest_index(&x_axis, x_coord)?,
            nearest_index(&z_axis, z_coord)?,
        );
        if !self.selection.push(key) {
            return None;
        }
        debug!("Reference point added at cell {key:?} ({x_coord:.3}, {z_coord:.3})");
        Some(self.emit())
    }

    pub fn remove_last_point(&mut self) -> Option<CalibrationOutput> {
        self.selection.pop()?;
        Some(self.emit())
    }

    pub fn clear_points(&mut self) -> Option<CalibrationOutput> {
        if !self.selection.clear() {
            return None;
        }
        Some(self.emit())
    }

    /// Gate for `add_point`; does not recompute
    pub fn set_collection_enabled(&mut self, enabled: bool) {
        self.collection_enabled = enabled;
    }

    fn emit(&self) -> CalibrationOutput {
        let output = self.recompute();
        if let Some(sender) = &self.event_sender {
            deliver(sender, CalibrationEvent::SelectionChanged(output.summary.clone()));
            if let Some(plane) = &output.corrected {
                deliver(sender, CalibrationEvent::CorrectedData(Arc::new(plane.clone())));
            }
        }
        output
    }

    /// Corrected plane and summary as a pure function of the raw plane and the selection
    pub fn recompute(&self) -> CalibrationOutput {
        let version = self.selection.version();
        let Some(raw) = &self.raw else {
            return CalibrationOutput {
                corrected: None,
                summary: SelectionSummary::empty(version, 0),
            };
        };
        let passthrough = |dropped| CalibrationOutput {
            corrected: Some(raw.clone()),
            summary: SelectionSummary::empty(version, dropped),
        };

        if self.selection.is_empty() {
            return passthrough(0);
        }
        let Some((real, imag)) = complex_maps(raw) else {
            return passthrough(0);
        };

        let (rows, cols) = real.dim();
        let valid: Vec<CellKey> = self
            .selection
            .points()
            .iter()
            .copied()
            .filter(|&(xi, zi)| xi < rows && zi < cols)
            .collect();
        let dropped = self.selection.len() - valid.len();
        if dropped > 0 {
            debug!("{dropped} reference cell(s) outside the {rows}x{cols} plane excluded");
        }
        if valid.is_empty() {
            return passthrough(dropped);
        }

        let selected: Vec<Complex64> = valid
            .iter()
            .map(|&idx| Complex64::new(real[idx], imag[idx]))
            .collect();
        let reference = selected.iter().sum::<Complex64>() / selected.len() as f64;

        let corrected_real = real.mapv(|v| v - reference.re);
        let corrected_imag = imag.mapv(|v| v - reference.im);
        let mut amplitude = Array2::zeros((rows, cols));
        let mut phase = Array2::zeros((rows, cols));
        Zip::from(&mut amplitude)
            .and(&mut phase)
            .and(&corrected_real)
            .and(&corrected_imag)
            .par_for_each(|a, p, &re, &im| {
                let value = Complex64::new(re, im);
                *a = amplitude_db(value);
                *p = phase_rad(value);
            });

        let x_axis = axis_or_indices(&raw.x, rows);
        let z_axis = axis_or_indices(&raw.z, cols);
        let summary = self.summarize(&valid, &selected, &x_axis, &z_axis, reference, dropped);

        let corrected = Plane {
            freq1: raw.freq1,
            freq2: raw.freq2,
            amp1: raw.amp1,
            x: raw.x.clone(),
            z: raw.z.clone(),
            amplitude,
            phase,
            complex_real: Some(corrected_real),
            complex_imag: Some(corrected_imag),
            y_index: raw.y_index,
            y_value: raw.y_value,
        };

        CalibrationOutput {
            corrected: Some(corrected),
            summary,
        }
    }

    fn summarize(
        &self,
        valid: &[CellKey],
        selected: &[Complex64],
        x_axis: &[f64],
        z_axis: &[f64],
        reference: Complex64,
        dropped: usize,
    ) -> SelectionSummary {
        let describe = |count: usize| -> Vec<ReferencePoint> {
            valid
                .iter()
                .zip(selected)
                .take(count)
                .map(|(&(xi, zi), value)| ReferencePoint {
                    x: x_axis[xi],
                    z: z_axis[zi],
                    real: value.re,
                    imag: value.im,
                })
                .collect()
        };

        let stride = if valid.len() > self.limits.scatter_points && self.limits.scatter_points > 0 {
            valid.len().div_ceil(self.limits.scatter_points)
        } else {
            1
        };
        let (scatter_x, scatter_z) = valid
            .iter()
            .step_by(stride)
            .map(|&(xi, zi)| (x_axis[xi], z_axis[zi]))
            .unzip();

        let version = self.selection.version();
        SelectionSummary {
            preview: describe(self.limits.preview_points),
            detail: describe(self.limits.detail_points),
            detail_truncated: valid.len() > self.limits.detail_points,
            scatter_x,
            scatter_z,
            count: valid.len(),
            dropped,
            version,
            render_key: Some(RenderKey {
                version,
                x_len: x_axis.len(),
                z_len: z_axis.len(),
                x_first: x_axis[0],
                x_last: x_axis[x_axis.len() - 1],
                z_first: z_axis[0],
                z_last: z_axis[z_axis.len() - 1],
            }),
            reference: Some(reference.into()),
        }
    }
}

/// Non-blocking send; the returned output is authoritative, so a full or
/// disconnected channel only loses the notification
fn deliver(sender: &Sender<CalibrationEvent>, event: CalibrationEvent) {
    match sender.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => {
            let kind = match event {
                CalibrationEvent::SelectionChanged(_) => "selection summary",
                CalibrationEvent::CorrectedData(_) => "corrected plane",
            };
            debug!("Calibration channel full, dropped {kind}");
        }
        Err(TrySendError::Disconnected(_)) => debug!("Calibration consumer gone"),
    }
}

/// Axis values, or `0..len` when the metadata does not match the grid
fn axis_or_indices(axis: &[f64], len: usize) -> Cow<'_, [f64]> {
    if axis.len() == len {
        Cow::Borrowed(axis)
    } else {
        Cow::Owned((0..len).map(|i| i as f64).collect())
    }
}

/// Complex real/imag maps of `plane`, rebuilt from amplitude/phase for
/// planes recorded without them
fn complex_maps(plane: &Plane) -> Option<(Cow<'_, Array2<f64>>, Cow<'_, Array2<f64>>)> {
    if let (Some(re), Some(im)) = (&plane.complex_real, &plane.complex_imag) {
        if re.dim() == im.dim() {
            return Some((Cow::Borrowed(re), Cow::Borrowed(im)));
        }
    }

    if plane.phase.dim() != plane.amplitude.dim() {
        return None;
    }
    let mut re = Array2::zeros(plane.amplitude.dim());
    let mut im = Array2::zeros(plane.amplitude.dim());
    Zip::from(&mut re)
        .and(&mut im)
        .and(&plane.amplitude)
        .and(&plane.phase)
        .for_each(|r, i, &amp, &ph| {
            let value = polar_to_complex(amp, ph);
            *r = value.re;
            *i = value.im;
        });
    Some((Cow::Owned(re), Cow::Owned(im)))
}

/// Apply one reference selection, given in axis coordinates, to every frame
/// of a record at `y_index`. Frames are processed in parallel, each with its
/// own engine.
pub fn calibrate_record(
    record: &MeasureRecord,
    y_index: usize,
    reference_coords: &[(f64, f64)],
    limits: &SummaryLimits,
) -> Vec<CalibrationOutput> {
    record
        .data
        .par_iter()
        .map(|frame| {
            let mut engine = CalibrationEngine::new(limits.clone());
            let mut output = engine.set_raw_data(extract_xz_slice(Payload::Volume(frame), y_index));
            for &(x, z) in reference_coords {
                if let Some(updated) = engine.add_point(x, z) {
                    output = updated;
                }
            }
            output
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::complex::wrap_phase;
    use crate::tensor::demo_frame;
    use crossbeam_channel::unbounded;
    use ndarray::array;

    fn plane_2x3() -> Plane {
        let real = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let imag = array![[0.5, -1.0, 0.0], [2.0, 1.0, -3.0]];
        Plane::from_complex(vec![-1.0, 1.0], vec![0.0, 10.0, 20.0], real, imag)
    }

    #[test]
    fn test_empty_selection_returns_raw_plane() {
        let mut engine = CalibrationEngine::default();
        let output = engine.set_raw_data(plane_2x3());
        assert_eq!(output.corrected.as_ref(), Some(&plane_2x3()));
        assert_eq!(output.summary.count, 0);
        assert!(output.summary.reference.is_none());
        assert!(output.summary.render_key.is_none());
    }

    #[test]
    fn test_without_raw_data_only_summary_is_produced() {
        let engine = CalibrationEngine::default();
        let output = engine.recompute();
        assert!(output.corrected.is_none());
        assert_eq!(output.summary.count, 0);
    }

    #[test]
    fn test_subtraction_is_a_pure_translation() {
        let mut engine = CalibrationEngine::default();
        engine.set_raw_data(plane_2x3());
        engine.add_point(-0.9, 1.0).unwrap();
        let output = engine.add_point(1.2, 19.0).unwrap();

        // mean of (1+0.5j) and (6-3j)
        let reference = Complex64::new(3.5, -1.25);
        let summary = &output.summary;
        let value = summary.reference.unwrap();
        assert_eq!((value.real, value.imag), (reference.re, reference.im));
        assert_eq!(summary.count, 2);

        let raw = plane_2x3();
        let corrected = output.corrected.unwrap();
        let raw_re = raw.complex_real.unwrap();
        let raw_im = raw.complex_imag.unwrap();
        let re = corrected.complex_real.unwrap();
        let im = corrected.complex_imag.unwrap();
        for idx in [(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)] {
            assert!((re[idx] - (raw_re[idx] - reference.re)).abs() < 1e-12);
            assert!((im[idx] - (raw_im[idx] - reference.im)).abs() < 1e-12);
            let expected = Complex64::new(re[idx], im[idx]);
            assert!((corrected.amplitude[idx] - amplitude_db(expected)).abs() < 1e-12);
            assert!((corrected.phase[idx] - wrap_phase(expected.arg())).abs() < 1e-12);
        }
    }

    #[test]
    fn test_mean_is_complex_not_magnitude() {
        // Opposite phases cancel coherently
        let real = array![[1.0, -1.0]];
        let imag = array![[0.0, 0.0]];
        let mut engine = CalibrationEngine::default();
        engine.set_raw_data(Plane::from_complex(vec![0.0], vec![0.0, 1.0], real, imag));
        engine.add_point(0.0, 0.0);
        let output = engine.add_point(0.0, 1.0).unwrap();
        let reference = output.summary.reference.unwrap();
        assert_eq!(reference.real, 0.0);
        assert_eq!(reference.imag, 0.0);
        assert!((reference.amplitude_db - -240.0).abs() < 1e-9);
    }

    #[test]
    fn test_recompute_is_idempotent() {
        let mut engine = CalibrationEngine::default();
        let frame = demo_frame(20, 3, 12);
        engine.set_raw_data(extract_xz_slice(Payload::Volume(&frame), 1));
        engine.add_point(0.0, 0.0);
        engine.add_point(10.0, -5.0);
        let first = engine.recompute();
        let second = engine.recompute();
        assert_eq!(first, second);
    }

    #[test]
    fn test_duplicate_cell_is_noop() {
        let mut engine = CalibrationEngine::default();
        engine.set_raw_data(plane_2x3());
        assert!(engine.add_point(-1.0, 0.0).is_some());
        assert!(engine.add_point(-0.8, 2.0).is_none());
        assert!(engine.selection().contains((0, 0)));
        assert_eq!(engine.selection().version(), 1);
        assert_eq!(engine.selection().len(), 1);
    }

    #[test]
    fn test_add_point_ignored_without_data_or_when_disabled() {
        let mut engine = CalibrationEngine::default();
        assert!(engine.add_point(0.0, 0.0).is_none());

        engine.set_raw_data(plane_2x3());
        engine.set_collection_enabled(false);
        assert!(engine.add_point(0.0, 0.0).is_none());
        assert!(engine.selection().is_empty());

        engine.set_collection_enabled(true);
        assert!(engine.add_point(0.0, 0.0).is_some());
    }

    #[test]
    fn test_version_increments_on_every_change() {
        let mut engine = CalibrationEngine::default();
        engine.set_raw_data(plane_2x3());
        engine.add_point(-1.0, 0.0);
        engine.add_point(1.0, 20.0);
        assert_eq!(engine.selection().version(), 2);
        engine.remove_last_point().unwrap();
        assert_eq!(engine.selection().version(), 3);
        engine.clear_points().unwrap();
        assert_eq!(engine.selection().version(), 4);
        assert!(engine.clear_points().is_none());
        assert!(engine.remove_last_point().is_none());
        assert_eq!(engine.selection().version(), 4);
    }

    #[test]
    fn test_out_of_bounds_points_silently_dropped() {
        let mut engine = CalibrationEngine::default();
        let frame = demo_frame(10, 1, 10);
        engine.set_raw_data(extract_xz_slice(Payload::Volume(&frame), 0));
        engine.add_point(25.0, 12.0); // cell (9, 9)
        engine.add_point(-25.0, -12.0); // cell (0, 0)

        // A smaller plane keeps only the (0, 0) reference
        let output = engine.set_raw_data(plane_2x3());
        assert_eq!(output.summary.count, 1);
        assert_eq!(output.summary.dropped, 1);
        let reference = output.summary.reference.unwrap();
        assert_eq!((reference.real, reference.imag), (1.0, 0.5));

        // No valid reference left behaves like an empty selection
        engine.remove_last_point();
        let output = engine.recompute();
        assert_eq!(output.corrected.as_ref(), Some(&plane_2x3()));
        assert_eq!(output.summary.count, 0);
        assert_eq!(output.summary.dropped, 1);
    }

    #[test]
    fn test_legacy_plane_reconstructed_from_polar() {
        let amplitude = array![[0.0, 20.0]];
        let phase = array![[0.0, std::f64::consts::FRAC_PI_2]];
        let mut engine = CalibrationEngine::default();
        engine.set_raw_data(Plane::from_polar(vec![0.0], vec![0.0, 1.0], amplitude, phase));
        let output = engine.add_point(0.0, 0.0).unwrap();

        let reference = output.summary.reference.unwrap();
        assert!((reference.real - 1.0).abs() < 1e-12);
        assert!(reference.imag.abs() < 1e-12);

        let corrected = output.corrected.unwrap();
        let re = corrected.complex_real.unwrap();
        let im = corrected.complex_imag.unwrap();
        // 10^(20/20)·e^(iπ/2) - 1 = -1 + 10i
        assert!((re[(0, 1)] - -1.0).abs() < 1e-9);
        assert!((im[(0, 1)] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_summary_caps_and_scatter_decimation() {
        let limits = SummaryLimits {
            preview_points: 2,
            detail_points: 5,
            scatter_points: 4,
        };
        let frame = demo_frame(10, 1, 10);
        let mut engine = CalibrationEngine::new(limits);
        engine.set_raw_data(extract_xz_slice(Payload::Volume(&frame), 0));
        let z_axis = frame.z.clone();
        let mut last = None;
        for &z in z_axis.iter().take(9) {
            last = engine.add_point(frame.x[3], z);
        }
        let summary = last.unwrap().summary;
        assert_eq!(summary.count, 9);
        assert_eq!(summary.preview.len(), 2);
        assert_eq!(summary.detail.len(), 5);
        assert!(summary.detail_truncated);
        // stride ceil(9/4) = 3 keeps cells 0, 3, 6
        assert_eq!(summary.scatter_z, vec![z_axis[0], z_axis[3], z_axis[6]]);
        assert!(summary.scatter_x.iter().all(|&x| x == frame.x[3]));
    }

    #[test]
    fn test_render_key_tracks_version_and_axes() {
        let mut engine = CalibrationEngine::default();
        engine.set_raw_data(plane_2x3());
        let first = engine.add_point(-1.0, 0.0).unwrap().summary.render_key;
        let same = engine.recompute().summary.render_key;
        assert_eq!(first, same);

        let second = engine.add_point(1.0, 0.0).unwrap().summary.render_key.unwrap();
        assert_eq!(second.version, 2);
        assert_eq!((second.x_first, second.x_last), (-1.0, 1.0));
        assert_eq!((second.z_len, second.z_last), (3, 20.0));
        assert_ne!(first, Some(second));
    }

    #[test]
    fn test_events_delivered_on_channel() {
        let (tx, rx) = unbounded();
        let mut engine = CalibrationEngine::default();
        engine.set_event_sender(tx);
        engine.set_raw_data(plane_2x3());
        engine.add_point(-1.0, 0.0);
        engine.set_collection_enabled(false);

        let events: Vec<CalibrationEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], CalibrationEvent::SelectionChanged(_)));
        assert!(matches!(events[3], CalibrationEvent::CorrectedData(_)));
    }

    #[test]
    fn test_full_channel_does_not_block_recompute() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let mut engine = CalibrationEngine::default();
        engine.set_event_sender(tx);
        engine.set_raw_data(plane_2x3());
        let output = engine.add_point(1.0, 20.0).unwrap();

        assert_eq!(output.summary.count, 1);
        assert_eq!(rx.len(), 1);
        assert!(matches!(rx.try_recv(), Ok(CalibrationEvent::SelectionChanged(_))));
    }

    #[test]
    fn test_calibrate_record_applies_selection_to_every_frame() {
        let mut record = MeasureRecord::new("replay");
        record.push_frame(demo_frame(8, 2, 6));
        record.push_frame(demo_frame(8, 2, 6));
        let outputs = calibrate_record(&record, 1, &[(0.0, 0.0)], &SummaryLimits::default());
        assert_eq!(outputs.len(), 2);
        assert!(outputs.iter().all(|o| o.summary.count == 1));
        assert_eq!(outputs[0], outputs[1]);
    }
}
