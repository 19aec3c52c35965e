//! Conversions between complex samples and amplitude/phase.

use num_complex::Complex64;
use std::f64::consts::PI;

/// Floor applied to magnitudes before taking the logarithm
pub const MAGNITUDE_FLOOR: f64 = 1e-12;

/// `20·log10(max(|z|, 1e-12))`
pub fn amplitude_db(z: Complex64) -> f64 {
    20.0 * z.norm().max(MAGNITUDE_FLOOR).log10()
}

/// Phase wrapped into `[-π, π]`
pub fn wrap_phase(phase: f64) -> f64 {
    let wrapped = (phase + PI).rem_euclid(2.0 * PI) - PI;
    // rem_euclid can land exactly on 2π after rounding
    wrapped.clamp(-PI, PI)
}

/// Phase of `z` in `[-π, π]`
pub fn phase_rad(z: Complex64) -> f64 {
    wrap_phase(z.im.atan2(z.re))
}

/// Rebuild a complex sample from dB amplitude and phase in radians
pub fn polar_to_complex(amplitude_db: f64, phase_rad: f64) -> Complex64 {
    Complex64::from_polar(10f64.powf(amplitude_db / 20.0), phase_rad)
}

/// Arithmetic mean over matched real/imag pairs; `None` when there are none
pub fn complex_mean(real: &[f64], imag: &[f64]) -> Option<Complex64> {
    let n = real.len().min(imag.len());
    if n == 0 {
        return None;
    }
    let sum = real
        .iter()
        .zip(imag)
        .fold(Complex64::new(0.0, 0.0), |acc, (&re, &im)| {
            acc + Complex64::new(re, im)
        });
    Some(sum / n as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amplitude_db_three_four_five() {
        let db = amplitude_db(Complex64::new(3.0, 4.0));
        assert!((db - 13.9794).abs() < 1e-3);
    }

    #[test]
    fn test_amplitude_db_floor() {
        assert!((amplitude_db(Complex64::new(0.0, 0.0)) - -240.0).abs() < 1e-9);
    }

    #[test]
    fn test_wrap_phase_range_and_periodicity() {
        for i in -50..50 {
            let phase = i as f64 * 0.37;
            let wrapped = wrap_phase(phase);
            assert!((-PI..=PI).contains(&wrapped));
            for k in -3..=3 {
                let shifted = wrap_phase(phase + 2.0 * PI * k as f64);
                assert!((shifted - wrapped).abs() < 1e-9, "{phase} k={k}");
            }
        }
    }

    #[test]
    fn test_polar_round_trip_of_a_single_value() {
        let z = polar_to_complex(-6.0, 1.2);
        assert!((amplitude_db(z) - -6.0).abs() < 1e-9);
        assert!((phase_rad(z) - 1.2).abs() < 1e-9);
    }

    #[test]
    fn test_complex_mean_ignores_unmatched_tail() {
        let mean = complex_mean(&[1.0, 3.0, 100.0], &[2.0, 4.0]).unwrap();
        assert_eq!(mean, Complex64::new(2.0, 3.0));
        assert!(complex_mean(&[], &[1.0]).is_none());
    }
}
