use std::time::Duration;

/// Evenly spaced values over `[start, stop]`, both ends included
///
/// A single point yields `[start]`; zero points yields an empty vector.
///
/// # Example
/// ```
/// use nearfield_scan::utils::linspace;
///
/// assert_eq!(linspace(0.0, 1.0, 3), vec![0.0, 0.5, 1.0]);
/// ```
pub fn linspace(start: f64, stop: f64, points: usize) -> Vec<f64> {
    match points {
        0 => Vec::new(),
        1 => vec![start],
        n => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { stop } else { start + step * i as f64 })
                .collect()
        }
    }
}

/// Index of the axis value closest to `value` by absolute difference.
/// Ties resolve to the lower index. `None` for an empty axis.
pub fn nearest_index(axis: &[f64], value: f64) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &v) in axis.iter().enumerate() {
        let distance = (v - value).abs();
        match best {
            Some((_, d)) if d <= distance => {}
            _ => best = Some((i, distance)),
        }
    }
    best.map(|(i, _)| i)
}

/// `HH:MM:SS`, prefixed with the day count once the duration exceeds a day
pub fn format_eta(duration: Duration) -> String {
    let total = duration.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    if days > 0 {
        format!("{days} day {hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linspace_endpoints() {
        let values = linspace(-10.0, -90.0, 5);
        assert_eq!(values.len(), 5);
        assert_eq!(values[0], -10.0);
        assert_eq!(values[4], -90.0);
        assert!((values[2] - -50.0).abs() < 1e-12);
    }

    #[test]
    fn test_linspace_single_point() {
        assert_eq!(linspace(3.0, 7.0, 1), vec![3.0]);
        assert!(linspace(3.0, 7.0, 0).is_empty());
    }

    #[test]
    fn test_nearest_index() {
        let axis = [0.0, 1.0, 2.0, 3.0];
        assert_eq!(nearest_index(&axis, 1.4), Some(1));
        assert_eq!(nearest_index(&axis, 1.6), Some(2));
        assert_eq!(nearest_index(&axis, -100.0), Some(0));
        assert_eq!(nearest_index(&axis, 100.0), Some(3));
        assert_eq!(nearest_index(&[], 1.0), None);
    }

    #[test]
    fn test_nearest_index_descending_axis() {
        let axis = [-10.0, -30.0, -50.0];
        assert_eq!(nearest_index(&axis, -33.0), Some(1));
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(Duration::from_secs(3_725)), "01:02:05");
        assert_eq!(format_eta(Duration::from_secs(90_061)), "1 day 01:01:01");
    }
}
