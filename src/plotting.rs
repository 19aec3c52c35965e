use textplots::{Chart, Plot, Shape};

use crate::slice::Plane;

/// Which map of a plane to plot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneField {
    Amplitude,
    Phase,
}

impl PlaneField {
    fn unit(self) -> &'static str {
        match self {
            PlaneField::Amplitude => "dB",
            PlaneField::Phase => "rad",
        }
    }
}

/// A 1-D cut through a plane
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub title: String,
    pub unit: &'static str,
    pub coords: Vec<f64>,
    pub values: Vec<f64>,
}

fn coord_or_index(axis: &[f64], len: usize, i: usize) -> f64 {
    if axis.len() == len { axis[i] } else { i as f64 }
}

/// Values along X at the Z index closest to `z_index` (clamped)
pub fn profile_along_x(plane: &Plane, field: PlaneField, z_index: usize) -> Option<Profile> {
    let grid = match field {
        PlaneField::Amplitude => &plane.amplitude,
        PlaneField::Phase => &plane.phase,
    };
    let (nx, nz) = grid.dim();
    if nx == 0 || nz == 0 {
        return None;
    }
    let zi = z_index.min(nz - 1);
    Some(Profile {
        title: format!(
            "{field:?} along X at Z = {:.3}",
            coord_or_index(&plane.z, nz, zi)
        ),
        unit: field.unit(),
        coords: (0..nx).map(|i| coord_or_index(&plane.x, nx, i)).collect(),
        values: grid.column(zi).to_vec(),
    })
}

/// Values along Z at the X index closest to `x_index` (clamped)
pub fn profile_along_z(plane: &Plane, field: PlaneField, x_index: usize) -> Option<Profile> {
    let grid = match field {
        PlaneField::Amplitude => &plane.amplitude,
        PlaneField::Phase => &plane.phase,
    };
    let (nx, nz) = grid.dim();
    if nx == 0 || nz == 0 {
        return None;
    }
    let xi = x_index.min(nx - 1);
    Some(Profile {
        title: format!(
            "{field:?} along Z at X = {:.3}",
            coord_or_index(&plane.x, nx, xi)
        ),
        unit: field.unit(),
        coords: (0..nz).map(|i| coord_or_index(&plane.z, nz, i)).collect(),
        values: grid.row(xi).to_vec(),
    })
}

/// Print `profile` as a terminal line chart
///
/// # Arguments
/// * `width` - Optional plot width (default: 140)
/// * `height` - Optional plot height (default: 60)
pub fn plot_profile(
    profile: &Profile,
    width: Option<usize>,
    height: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    if profile.values.is_empty() || profile.coords.len() != profile.values.len() {
        return Err("Cannot plot empty data".into());
    }

    let width = width.unwrap_or(140);
    let height = height.unwrap_or(60);

    let min_value = profile.values.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let max_value = profile.values.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    let mut x_min = profile.coords.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let mut x_max = profile.coords.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    if x_min == x_max {
        x_min -= 0.5;
        x_max += 0.5;
    }

    let points: Vec<(f32, f32)> = profile
        .coords
        .iter()
        .zip(&profile.values)
        .map(|(&c, &v)| (c as f32, v as f32))
        .collect();

    println!("{}", profile.title);
    println!(
        "{} points | Values: {:.3} to {:.3} {}",
        profile.values.len(),
        min_value,
        max_value,
        profile.unit
    );
    println!("{}", "─".repeat(width));

    Chart::new(width as u32, height as u32, x_min as f32, x_max as f32)
        .lineplot(&Shape::Lines(&points))
        .nice();

    println!("Position (mm) →");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn plane() -> Plane {
        Plane::from_polar(
            vec![-1.0, 0.0, 1.0],
            vec![10.0, 20.0],
            array![[-3.0, -4.0], [-5.0, -6.0], [-7.0, -8.0]],
            array![[0.1, 0.2], [0.3, 0.4], [0.5, 0.6]],
        )
    }

    #[test]
    fn test_profile_along_x() {
        let profile = profile_along_x(&plane(), PlaneField::Amplitude, 1).unwrap();
        assert_eq!(profile.coords, vec![-1.0, 0.0, 1.0]);
        assert_eq!(profile.values, vec![-4.0, -6.0, -8.0]);
        assert_eq!(profile.unit, "dB");
    }

    #[test]
    fn test_profile_along_z_clamps_index() {
        let profile = profile_along_z(&plane(), PlaneField::Phase, 99).unwrap();
        assert_eq!(profile.coords, vec![10.0, 20.0]);
        assert_eq!(profile.values, vec![0.5, 0.6]);
    }

    #[test]
    fn test_plot_profile() {
        let profile = profile_along_x(&plane(), PlaneField::Amplitude, 0).unwrap();
        assert!(plot_profile(&profile, Some(60), Some(20)).is_ok());
    }

    #[test]
    fn test_plot_empty_data() {
        let empty = Profile {
            title: String::new(),
            unit: "dB",
            coords: Vec::new(),
            values: Vec::new(),
        };
        assert!(plot_profile(&empty, None, None).is_err());
    }
}
