use chrono::{DateTime, Local};
use ndarray::{Array2, Array3};
use num_complex::Complex64;
use serde::{Deserialize, Serialize, Serializer};

use crate::complex::{amplitude_db, phase_rad};
use crate::error::ScanError;
use crate::utils::linspace;

/// One frequency pair's worth of data, every grid shaped `[Y][X][Z]`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "FrameDocument")]
pub struct MeasurementFrame {
    /// Generator 1 frequency in GHz
    pub freq1: f64,
    /// Generator 2 frequency in GHz
    pub freq2: f64,
    /// Generator 1 power override in dBm, if one was applied
    pub amp1: Option<f64>,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
    pub amplitude: Array3<f64>,
    pub phase: Array3<f64>,
    /// Absent in records written before complex data was stored
    pub complex_real: Option<Array3<f64>>,
    pub complex_imag: Option<Array3<f64>>,
}

impl MeasurementFrame {
    /// Allocate a zeroed frame sized `[len(y)][len(x)][len(z)]`
    pub fn new(
        freq1: f64,
        freq2: f64,
        amp1: Option<f64>,
        x: Vec<f64>,
        y: Vec<f64>,
        z: Vec<f64>,
    ) -> Self {
        let shape = (y.len(), x.len(), z.len());
        Self {
            freq1,
            freq2,
            amp1,
            x,
            y,
            z,
            amplitude: Array3::zeros(shape),
            phase: Array3::zeros(shape),
            complex_real: Some(Array3::zeros(shape)),
            complex_imag: Some(Array3::zeros(shape)),
        }
    }

    /// `(|Y|, |X|, |Z|)` of the data grids
    pub fn shape(&self) -> (usize, usize, usize) {
        self.amplitude.dim()
    }

    /// Store one acquired point; out-of-range indices are ignored
    pub fn set_sample(&mut self, y_idx: usize, x_idx: usize, z_idx: usize, value: Complex64) {
        let idx = (y_idx, x_idx, z_idx);
        if self.amplitude.get(idx).is_none() {
            return;
        }
        let shape = self.amplitude.dim();
        self.amplitude[idx] = amplitude_db(value);
        self.phase[idx] = phase_rad(value);
        self.complex_real.get_or_insert_with(|| Array3::zeros(shape))[idx] = value.re;
        self.complex_imag.get_or_insert_with(|| Array3::zeros(shape))[idx] = value.im;
    }

    pub fn sample(&self, y_idx: usize, x_idx: usize, z_idx: usize) -> Option<Complex64> {
        let idx = (y_idx, x_idx, z_idx);
        let re = *self.complex_real.as_ref()?.get(idx)?;
        let im = *self.complex_imag.as_ref()?.get(idx)?;
        Some(Complex64::new(re, im))
    }

    /// Cells whose complex value differs from the zero default
    pub fn filled_cells(&self) -> usize {
        match (&self.complex_real, &self.complex_imag) {
            (Some(re), Some(im)) => re
                .iter()
                .zip(im.iter())
                .filter(|&(&r, &i)| r != 0.0 || i != 0.0)
                .count(),
            _ => 0,
        }
    }

    fn to_document(&self) -> FrameDocument {
        FrameDocument {
            freq_1: self.freq1,
            freq_2: self.freq2,
            amp_1: self.amp1,
            x: self.x.clone(),
            y: self.y.clone(),
            z: self.z.clone(),
            amplitude: Grid::Volume(nested(&self.amplitude)),
            phase: Grid::Volume(nested(&self.phase)),
            complex_real: self.complex_real.as_ref().map(|a| Grid::Volume(nested(a))),
            complex_imag: self.complex_imag.as_ref().map(|a| Grid::Volume(nested(a))),
        }
    }
}

impl Serialize for MeasurementFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_document().serialize(serializer)
    }
}

/// Nested-array grid as stored on disk. Older records stored 2-D `[X][Z]` maps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum Grid {
    Volume(Vec<Vec<Vec<f64>>>),
    Plane(Vec<Vec<f64>>),
}

impl Grid {
    fn into_array(self, field: &str) -> Result<Array3<f64>, ScanError> {
        let volume = match self {
            Grid::Volume(v) => v,
            Grid::Plane(p) => vec![p],
        };
        let ny = volume.len();
        let nx = volume.first().map_or(0, Vec::len);
        let nz = volume
            .first()
            .and_then(|rows| rows.first())
            .map_or(0, Vec::len);

        let mut flat = Vec::with_capacity(ny * nx * nz);
        for rows in volume {
            if rows.len() != nx {
                return Err(ScanError::InvalidResponse(format!(
                    "ragged '{field}' grid: expected {nx} rows"
                )));
            }
            for row in rows {
                if row.len() != nz {
                    return Err(ScanError::InvalidResponse(format!(
                        "ragged '{field}' grid: expected {nz} columns"
                    )));
                }
                flat.extend(row);
            }
        }

        Array3::from_shape_vec((ny, nx, nz), flat)
            .map_err(|e| ScanError::InvalidResponse(format!("'{field}' grid: {e}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FrameDocument {
    freq_1: f64,
    freq_2: f64,
    #[serde(default)]
    amp_1: Option<f64>,
    #[serde(default)]
    x: Vec<f64>,
    #[serde(default)]
    y: Vec<f64>,
    #[serde(default)]
    z: Vec<f64>,
    amplitude: Grid,
    phase: Grid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    complex_real: Option<Grid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    complex_imag: Option<Grid>,
}

impl TryFrom<FrameDocument> for MeasurementFrame {
    type Error = ScanError;

    fn try_from(doc: FrameDocument) -> Result<Self, Self::Error> {
        let amplitude = doc.amplitude.into_array("amplitude")?;
        let phase = doc.phase.into_array("phase")?;
        if phase.dim() != amplitude.dim() {
            return Err(ScanError::InvalidResponse(format!(
                "phase shape {:?} does not match amplitude shape {:?}",
                phase.dim(),
                amplitude.dim()
            )));
        }

        let complex_real = doc
            .complex_real
            .map(|g| g.into_array("complex_real"))
            .transpose()?;
        let complex_imag = doc
            .complex_imag
            .map(|g| g.into_array("complex_imag"))
            .transpose()?;

        // Complex maps are only usable as a matching pair
        let (complex_real, complex_imag) = match (complex_real, complex_imag) {
            (Some(re), Some(im)) if re.dim() == amplitude.dim() && im.dim() == amplitude.dim() => {
                (Some(re), Some(im))
            }
            _ => (None, None),
        };

        Ok(Self {
            freq1: doc.freq_1,
            freq2: doc.freq_2,
            amp1: doc.amp_1,
            x: doc.x,
            y: doc.y,
            z: doc.z,
            amplitude,
            phase,
            complex_real,
            complex_imag,
        })
    }
}

fn nested(array: &Array3<f64>) -> Vec<Vec<Vec<f64>>> {
    array
        .outer_iter()
        .map(|plane| plane.outer_iter().map(|row| row.to_vec()).collect())
        .collect()
}

/// All frames acquired during one scan run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasureRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default = "Local::now")]
    pub created: DateTime<Local>,
    #[serde(default)]
    pub comment: String,
    pub data: Vec<MeasurementFrame>,
}

impl MeasureRecord {
    pub fn new(comment: impl Into<String>) -> Self {
        let created = Local::now();
        Self {
            id: created.format("%Y-%m-%d_%H-%M-%S").to_string(),
            created,
            comment: comment.into(),
            data: Vec::new(),
        }
    }

    pub fn set_comment(&mut self, comment: impl Into<String>) {
        self.comment = comment.into();
    }

    pub fn push_frame(&mut self, frame: MeasurementFrame) {
        self.data.push(frame);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Fixed complex offset added to the synthetic field
pub fn demo_background() -> Complex64 {
    Complex64::from_polar(0.03, 1.1)
}

/// Synthetic near field at `(x, z)`: two lobes, a phase ramp and the
/// [`demo_background`] offset
pub fn demo_field(x: f64, z: f64) -> Complex64 {
    let magnitude = 0.02
        + 0.45 * (-((x - 7.0).powi(2) + (z + 3.0).powi(2)) / 95.0).exp()
        + 0.33 * (-((x + 11.0).powi(2) + (z - 4.0).powi(2)) / 120.0).exp();
    let phase = 0.17 * x - 0.19 * z + 0.75 * (x / 6.5).sin() * (z / 4.2).cos();
    Complex64::from_polar(magnitude, phase) + demo_background()
}

/// Synthetic frame built from [`demo_field`] with a per-Y complex gain
pub fn demo_frame(nx: usize, ny: usize, nz: usize) -> MeasurementFrame {
    let x = linspace(-25.0, 25.0, nx);
    let y = linspace(-4.0, 4.0, ny);
    let z = linspace(-12.0, 12.0, nz);

    let mut field = Array2::<Complex64>::zeros((nx, nz));
    for (xi, &xv) in x.iter().enumerate() {
        for (zi, &zv) in z.iter().enumerate() {
            field[(xi, zi)] = demo_field(xv, zv);
        }
    }

    let mut frame = MeasurementFrame::new(142.35, 142.35, Some(-20.0), x, y.clone(), z);
    for (yi, &yv) in y.iter().enumerate() {
        let shift = Complex64::from_polar(1.0 + 0.05 * (0.8 * yv).cos(), 0.25 * yv);
        for ((xi, zi), &value) in field.indexed_iter() {
            frame.set_sample(yi, xi, zi, value * shift);
        }
    }
    frame
}
