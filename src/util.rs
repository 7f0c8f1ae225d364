use std::{fs::create_dir_all, iter::zip, path::PathBuf};

use anyhow::{anyhow, Result};

pub fn cache_dir() -> Result<PathBuf> {
    let path = dirs::cache_dir()
        .ok_or(anyhow!("unable to locate cache dir"))?
        .join("normgrad/");

    if !path.exists() {
        create_dir_all(path.clone())?;
    }

    Ok(path)
}

/// Largest absolute elementwise difference. NaN on both sides counts as equal.
pub fn max_abs_diff(a: &[f64], b: &[f64]) -> f64 {
    assert_eq!(a.len(), b.len(), "length mismatch");
    zip(a, b)
        .map(|(a1, b1)| {
            if a1.is_nan() && b1.is_nan() {
                0.0
            } else {
                (a1 - b1).abs()
            }
        })
        .fold(0.0, |acc: f64, d| {
            if acc.is_nan() || d.is_nan() {
                f64::NAN
            } else {
                acc.max(d)
            }
        })
}

pub fn assert_aprox_eq_vec(a: Vec<f64>, b: Vec<f64>, tolerance: f64) {
    assert_eq!(a.len(), b.len(), "length mismatch");
    for (i, (a1, b1)) in zip(a, b).enumerate() {
        if a1.is_nan() {
            assert!(b1.is_nan(), "index {i}: expected {b1}, got NaN");
        } else if b1.is_nan() {
            assert!(a1.is_nan(), "index {i}: expected NaN, got {a1}");
        } else {
            assert!(
                (a1 - b1).abs() < tolerance,
                "index {i}: {a1} != {b1} (tolerance {tolerance})"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_abs_diff_ignores_matching_nans() {
        assert_eq!(max_abs_diff(&[1.0, f64::NAN], &[1.5, f64::NAN]), 0.5);
        assert!(max_abs_diff(&[1.0], &[f64::NAN]).is_nan());
    }

    #[test]
    #[should_panic(expected = "index 1")]
    fn assert_aprox_eq_vec_reports_index() {
        assert_aprox_eq_vec(vec![1.0, 2.0], vec![1.0, 2.1], 1e-3);
    }
}
