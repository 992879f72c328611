//! SNIP background estimation along the two-theta axis.
//!
//! Iterative morphological baseline estimator: intensities are compressed
//! with the LLS operator `log(log(sqrt(v + 1) + 1) + 1)`, clipped against
//! the average of window endpoints with a decreasing window
//! `p = width * (numiter - iter)`, then expanded back. NaN samples are
//! excluded from the endpoint estimate and stay NaN in the output, so masked
//! pixels never leak into the baseline.
//!
//! The estimator is a pure function of `(image, width, numiter)`: rerunning
//! it on identical input produces bit-identical output.

use nalgebra::DMatrix;

/// Convert a configured background width in degrees to pixels along the
/// two-theta axis, rounding up.
pub fn snip_width_pixels(width_deg: f64, tth_pixel_size_deg: f64) -> usize {
    (width_deg / tth_pixel_size_deg).ceil().max(1.0) as usize
}

fn lls(v: f64) -> f64 {
    ((v.max(0.0) + 1.0).sqrt() + 1.0).ln().ln_1p()
}

fn lls_inv(z: f64) -> f64 {
    let e = (z.exp() - 1.0).exp();
    (e - 1.0) * (e - 1.0) - 1.0
}

/// SNIP baseline of each row of `img` (rows are eta, columns two-theta).
///
/// Returns the estimated background; subtract it from the input to flatten.
/// NaN input samples yield NaN background samples.
pub fn snip1d(img: &DMatrix<f64>, width: usize, numiter: usize) -> DMatrix<f64> {
    let (rows, cols) = (img.nrows(), img.ncols());
    let width = width.max(1);
    let numiter = numiter.max(1);
    let mut out = DMatrix::from_element(rows, cols, f64::NAN);

    let mut z = vec![f64::NAN; cols];
    let mut b = vec![f64::NAN; cols];
    for r in 0..rows {
        // Row minimum shift keeps the LLS operator in its valid domain.
        let row_min = (0..cols)
            .map(|c| img[(r, c)])
            .filter(|v| v.is_finite())
            .fold(f64::INFINITY, f64::min);
        if !row_min.is_finite() {
            continue;
        }

        for c in 0..cols {
            let v = img[(r, c)];
            z[c] = if v.is_finite() { lls(v - row_min) } else { f64::NAN };
        }
        b.copy_from_slice(&z);

        for iter in 0..numiter {
            let p = width * (numiter - iter);
            for c in 0..cols {
                if !b[c].is_finite() {
                    continue;
                }
                let lo = c.checked_sub(p).map(|i| b[i]).unwrap_or(f64::NAN);
                let hi = b.get(c + p).copied().unwrap_or(f64::NAN);
                let clip = match (lo.is_finite(), hi.is_finite()) {
                    (true, true) => 0.5 * (lo + hi),
                    (true, false) => lo,
                    (false, true) => hi,
                    (false, false) => continue,
                };
                if clip < b[c] {
                    b[c] = clip;
                }
            }
        }

        for c in 0..cols {
            if b[c].is_finite() {
                out[(r, c)] = lls_inv(b[c]) + row_min;
            }
        }
    }
    out
}

/// Erode each row's valid run along two-theta by the footprint implied by
/// the SNIP parameters: samples within half the footprint of an invalid
/// sample (or the row edge) are marked invalid.
///
/// Returns the eroded validity array.
pub fn erode_validity(valid: &DMatrix<bool>, width: usize, numiter: usize) -> DMatrix<bool> {
    let (rows, cols) = (valid.nrows(), valid.ncols());
    let footprint = (2.25 * numiter as f64 * width as f64).ceil() as usize;
    let half = footprint / 2;
    let mut out = DMatrix::from_element(rows, cols, false);
    for r in 0..rows {
        for c in 0..cols {
            if !valid[(r, c)] {
                continue;
            }
            let lo = c.checked_sub(half);
            let hi = c + half;
            let ok = match lo {
                Some(lo) if hi < cols => (lo..=hi).all(|k| valid[(r, k)]),
                _ => false,
            };
            out[(r, c)] = ok;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peaky_row(cols: usize) -> DMatrix<f64> {
        let mut img = DMatrix::zeros(1, cols);
        for c in 0..cols {
            let x = c as f64;
            // Smooth baseline plus two sharp peaks.
            let base = 40.0 + 0.1 * x;
            let p1 = 90.0 * (-((x - 30.0) / 2.0).powi(2)).exp();
            let p2 = 60.0 * (-((x - 70.0) / 1.5).powi(2)).exp();
            img[(0, c)] = base + p1 + p2;
        }
        img
    }

    #[test]
    fn background_stays_below_peaks() {
        let img = peaky_row(128);
        let bkg = snip1d(&img, 6, 3);
        for c in 0..128 {
            assert!(bkg[(0, c)] <= img[(0, c)] + 1e-9);
        }
        // The peak tops must be mostly removed.
        let flattened = img[(0, 30)] - bkg[(0, 30)];
        assert!(flattened > 50.0, "peak survives subtraction: {}", flattened);
        // The baseline far from peaks must be mostly preserved.
        let residual = img[(0, 110)] - bkg[(0, 110)];
        assert!(residual.abs() < 5.0, "baseline overshoot: {}", residual);
    }

    #[test]
    fn rerun_is_bit_identical() {
        let img = peaky_row(96);
        let a = snip1d(&img, 5, 2);
        let b = snip1d(&img, 5, 2);
        assert_eq!(a, b);
    }

    #[test]
    fn nan_samples_stay_nan_and_do_not_poison_neighbors() {
        let mut img = peaky_row(96);
        img[(0, 40)] = f64::NAN;
        img[(0, 41)] = f64::NAN;
        let bkg = snip1d(&img, 4, 2);
        assert!(bkg[(0, 40)].is_nan());
        assert!(bkg[(0, 41)].is_nan());
        let finite = (0..96).filter(|&c| bkg[(0, c)].is_finite()).count();
        assert_eq!(finite, 94);
    }

    #[test]
    fn all_nan_row_survives() {
        let img = DMatrix::from_element(2, 16, f64::NAN);
        let bkg = snip1d(&img, 3, 2);
        assert!(bkg.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn erosion_shrinks_runs_from_both_sides() {
        let mut valid = DMatrix::from_element(1, 32, false);
        for c in 4..28 {
            valid[(0, c)] = true;
        }
        let eroded = erode_validity(&valid, 2, 1);
        // footprint = ceil(2.25*2) = 5, half = 2
        assert!(!eroded[(0, 4)]);
        assert!(!eroded[(0, 5)]);
        assert!(eroded[(0, 6)]);
        assert!(eroded[(0, 25)]);
        assert!(!eroded[(0, 26)]);
        let count_before = valid.iter().filter(|&&v| v).count();
        let count_after = eroded.iter().filter(|&&v| v).count();
        assert!(count_after < count_before);
    }
}
