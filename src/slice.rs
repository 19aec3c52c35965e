//! X-Z plane extraction from `[Y][X][Z]` volumes.

use ndarray::{Array2, Array3, Axis as NdAxis, Zip};
use num_complex::Complex64;

use crate::complex::{amplitude_db, phase_rad};
use crate::tensor::MeasurementFrame;

/// A 2-D X-Z slice, every grid shaped `[X][Z]`
#[derive(Debug, Clone, PartialEq)]
pub struct Plane {
    pub freq1: f64,
    pub freq2: f64,
    pub amp1: Option<f64>,
    pub x: Vec<f64>,
    pub z: Vec<f64>,
    pub amplitude: Array2<f64>,
    pub phase: Array2<f64>,
    pub complex_real: Option<Array2<f64>>,
    pub complex_imag: Option<Array2<f64>>,
    /// Resolved Y index when the plane was cut from a volume
    pub y_index: Option<usize>,
    pub y_value: Option<f64>,
}

impl Plane {
    /// Plane built from amplitude/phase maps only
    pub fn from_polar(x: Vec<f64>, z: Vec<f64>, amplitude: Array2<f64>, phase: Array2<f64>) -> Self {
        Self {
            freq1: 0.0,
            freq2: 0.0,
            amp1: None,
            x,
            z,
            amplitude,
            phase,
            complex_real: None,
            complex_imag: None,
            y_index: None,
            y_value: None,
        }
    }

    /// Plane built from a complex map; amplitude and phase are derived from it
    pub fn from_complex(x: Vec<f64>, z: Vec<f64>, real: Array2<f64>, imag: Array2<f64>) -> Self {
        let mut amplitude = Array2::zeros(real.dim());
        let mut phase = Array2::zeros(real.dim());
        Zip::from(&mut amplitude)
            .and(&mut phase)
            .and(&real)
            .and(&imag)
            .for_each(|a, p, &re, &im| {
                let value = Complex64::new(re, im);
                *a = amplitude_db(value);
                *p = phase_rad(value);
            });
        Self {
            complex_real: Some(real),
            complex_imag: Some(imag),
            ..Self::from_polar(x, z, amplitude, phase)
        }
    }

    /// `(|X|, |Z|)` of the amplitude grid
    pub fn shape(&self) -> (usize, usize) {
        self.amplitude.dim()
    }
}

/// Input accepted by [`extract_xz_slice`]
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    /// Already two-dimensional, passed through unchanged
    Plane(&'a Plane),
    Volume(&'a MeasurementFrame),
}

impl<'a> From<&'a Plane> for Payload<'a> {
    fn from(plane: &'a Plane) -> Self {
        Payload::Plane(plane)
    }
}

impl<'a> From<&'a MeasurementFrame> for Payload<'a> {
    fn from(frame: &'a MeasurementFrame) -> Self {
        Payload::Volume(frame)
    }
}

/// Y coordinates of `frame`, replaced by `0..|Y|-1` when the metadata length
/// disagrees with the data
pub fn resolved_y_axis(frame: &MeasurementFrame) -> Vec<f64> {
    let y_len = frame.amplitude.len_of(NdAxis(0));
    if frame.y.len() == y_len {
        frame.y.clone()
    } else {
        (0..y_len).map(|i| i as f64).collect()
    }
}

/// Y axis a consumer should offer for selection; a plane has a single `0.0`
pub fn y_axis_of(payload: Payload<'_>) -> Vec<f64> {
    match payload {
        Payload::Plane(_) => vec![0.0],
        Payload::Volume(frame) => {
            let axis = resolved_y_axis(frame);
            if axis.is_empty() { vec![0.0] } else { axis }
        }
    }
}

/// Cut the X-Z plane at `y_index` (clamped into range) out of a volume
pub fn extract_xz_slice(payload: Payload<'_>, y_index: usize) -> Plane {
    let frame = match payload {
        Payload::Plane(plane) => return plane.clone(),
        Payload::Volume(frame) => frame,
    };

    let (y_len, x_len, z_len) = frame.shape();
    if y_len == 0 {
        return Plane::from_polar(
            frame.x.clone(),
            frame.z.clone(),
            Array2::zeros((x_len, z_len)),
            Array2::zeros((x_len, z_len)),
        );
    }

    let y_idx = y_index.min(y_len - 1);
    let y_axis = resolved_y_axis(frame);

    let cut = |grid: &Array3<f64>| grid.index_axis(NdAxis(0), y_idx).to_owned();
    let cut_matching = |grid: &Option<Array3<f64>>| {
        grid.as_ref()
            .filter(|g| g.len_of(NdAxis(0)) == y_len)
            .map(cut)
    };

    let mut complex_real = cut_matching(&frame.complex_real);
    let mut complex_imag = cut_matching(&frame.complex_imag);
    if complex_real.is_none() || complex_imag.is_none() {
        complex_real = None;
        complex_imag = None;
    }

    Plane {
        freq1: frame.freq1,
        freq2: frame.freq2,
        amp1: frame.amp1,
        x: frame.x.clone(),
        z: frame.z.clone(),
        amplitude: cut(&frame.amplitude),
        phase: cut(&frame.phase),
        complex_real,
        complex_imag,
        y_index: Some(y_idx),
        y_value: Some(y_axis[y_idx]),
    }
}
