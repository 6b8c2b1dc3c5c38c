//! The orbit response matrix and its regularised pseudo-inverse.
use bit_set::BitSet;
use ndarray::{Array1, Array2, Axis};

use super::Geometry;
use crate::error::SofbError;

const MAX_SWEEPS: usize = 60;
const ORTHOGONALITY_EPS: f64 = 1.0e-12;

/// Thin singular value decomposition `a = u · diag(s) · vᵀ` by one-sided
/// Jacobi rotations. `u` has the shape of `a`, `v` is square.
pub fn svd(a: &Array2<f64>) -> (Array2<f64>, Vec<f64>, Array2<f64>) {
    let (rows, cols) = a.dim();
    let mut u = a.clone();
    let mut v = Array2::<f64>::eye(cols);

    for _ in 0..MAX_SWEEPS {
        let mut rotated = false;
        for p in 0..cols {
            for q in p + 1..cols {
                let (mut alpha, mut beta, mut gamma) = (0.0, 0.0, 0.0);
                for i in 0..rows {
                    let (up, uq) = (u[[i, p]], u[[i, q]]);
                    alpha += up * up;
                    beta += uq * uq;
                    gamma += up * uq;
                }
                if gamma == 0.0 || gamma.abs() <= ORTHOGONALITY_EPS * (alpha * beta).sqrt() {
                    continue;
                }
                rotated = true;
                let zeta = (beta - alpha) / (2.0 * gamma);
                let t = zeta.signum() / (zeta.abs() + (1.0 + zeta * zeta).sqrt());
                let c = 1.0 / (1.0 + t * t).sqrt();
                let s = c * t;
                for i in 0..rows {
                    let (up, uq) = (u[[i, p]], u[[i, q]]);
                    u[[i, p]] = c * up - s * uq;
                    u[[i, q]] = s * up + c * uq;
                }
                for i in 0..cols {
                    let (vp, vq) = (v[[i, p]], v[[i, q]]);
                    v[[i, p]] = c * vp - s * vq;
                    v[[i, q]] = s * vp + c * vq;
                }
            }
        }
        if !rotated {
            break;
        }
    }

    let mut sing = Vec::with_capacity(cols);
    for mut column in u.axis_iter_mut(Axis(1)) {
        let norm = column.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm > 0.0 {
            column.mapv_inplace(|x| x / norm);
        }
        sing.push(norm);
    }
    (u, sing, v)
}

fn check_parameter(what: &'static str, value: f64) -> Result<f64, SofbError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(SofbError::InvalidParameter { what, value })
    }
}

/// Response matrix of the enabled BPMs to the enabled correctors
#[derive(Debug, Clone)]
pub struct ResponseMatrix {
    geometry: Geometry,
    matrix: Array2<f64>,
    inverse: Array2<f64>,
    sing_values: Vec<f64>,
    bpm_enable: BitSet,
    corr_enable: BitSet,
    min_sing_value: f64,
    tikhonov: f64,
}

fn full_set(len: usize) -> BitSet {
    (0..len).collect()
}

impl ResponseMatrix {
    /// A zero matrix with every BPM and corrector enabled
    pub fn new(geometry: Geometry, min_sing_value: f64, tikhonov: f64) -> Self {
        let rows = geometry.orbit_len();
        let cols = geometry.nr_correctors();
        Self {
            geometry,
            matrix: Array2::zeros((rows, cols)),
            inverse: Array2::zeros((cols, rows)),
            sing_values: Vec::new(),
            bpm_enable: full_set(rows),
            corr_enable: full_set(cols),
            min_sing_value,
            tikhonov,
        }
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn matrix(&self) -> &Array2<f64> {
        &self.matrix
    }

    /// Row-major copy, as published on the matrix channels
    pub fn flat(&self) -> Vec<f64> {
        self.matrix.iter().copied().collect()
    }

    pub fn inverse_flat(&self) -> Vec<f64> {
        self.inverse.iter().copied().collect()
    }

    /// Singular values of the enabled submatrix, largest first
    pub fn sing_values(&self) -> &[f64] {
        &self.sing_values
    }

    /// Singular values kept by the inversion
    pub fn nr_sing_values(&self) -> usize {
        self.sing_values
            .iter()
            .filter(|s| **s > self.min_sing_value && **s > 0.0)
            .count()
    }

    pub fn set_flat(&mut self, values: &[f64]) -> Result<(), SofbError> {
        let (rows, cols) = self.matrix.dim();
        if values.len() != rows * cols {
            return Err(SofbError::MatrixShape {
                expected: rows * cols,
                found: values.len(),
            });
        }
        self.set_matrix(
            Array2::from_shape_vec((rows, cols), values.to_vec()).map_err(|_| {
                SofbError::MatrixShape {
                    expected: rows * cols,
                    found: values.len(),
                }
            })?,
        )
    }

    pub fn set_matrix(&mut self, matrix: Array2<f64>) -> Result<(), SofbError> {
        if matrix.dim() != self.matrix.dim() {
            return Err(SofbError::MatrixShape {
                expected: self.matrix.len(),
                found: matrix.len(),
            });
        }
        self.matrix = matrix;
        self.recompute();
        Ok(())
    }

    fn enable_from(flags: &[bool], expected: usize, what: &'static str) -> Result<BitSet, SofbError> {
        if flags.len() != expected {
            return Err(SofbError::Length {
                what,
                expected,
                found: flags.len(),
            });
        }
        Ok(flags
            .iter()
            .enumerate()
            .filter(|(_, on)| **on)
            .map(|(idx, _)| idx)
            .collect())
    }

    /// Enable flags of the x readings followed by the y readings
    pub fn set_bpm_enable(&mut self, flags: &[bool]) -> Result<(), SofbError> {
        self.bpm_enable = Self::enable_from(flags, self.geometry.orbit_len(), "BPM enable")?;
        self.recompute();
        Ok(())
    }

    pub fn set_corr_enable(&mut self, flags: &[bool]) -> Result<(), SofbError> {
        self.corr_enable =
            Self::enable_from(flags, self.geometry.nr_correctors(), "corrector enable")?;
        self.recompute();
        Ok(())
    }

    pub fn bpm_enabled(&self, idx: usize) -> bool {
        self.bpm_enable.contains(idx)
    }

    pub fn corr_enabled(&self, idx: usize) -> bool {
        self.corr_enable.contains(idx)
    }

    /// Enabled corrector indices in ascending order
    pub fn enabled_correctors(&self) -> Vec<usize> {
        self.corr_enable.iter().collect()
    }

    pub fn set_min_sing_value(&mut self, value: f64) -> Result<(), SofbError> {
        self.min_sing_value = check_parameter("Singular value cutoff", value)?;
        self.recompute();
        Ok(())
    }

    pub fn set_tikhonov(&mut self, value: f64) -> Result<(), SofbError> {
        self.tikhonov = check_parameter("Tikhonov constant", value)?;
        self.recompute();
        Ok(())
    }

    /// Invert the enabled submatrix. Singular values at or below the minimum
    /// are dropped; the rest are damped as σ/(σ² + λ²).
    fn recompute(&mut self) {
        let rows: Vec<usize> = self.bpm_enable.iter().collect();
        let cols: Vec<usize> = self.corr_enable.iter().collect();
        let (full_rows, full_cols) = self.matrix.dim();
        self.inverse = Array2::zeros((full_cols, full_rows));
        self.sing_values.clear();
        if rows.is_empty() || cols.is_empty() {
            return;
        }

        let sub = Array2::from_shape_fn((rows.len(), cols.len()), |(i, j)| {
            self.matrix[[rows[i], cols[j]]]
        });
        let (u, sing, v) = svd(&sub);

        let lambda2 = self.tikhonov * self.tikhonov;
        let mut order: Vec<usize> = (0..sing.len()).collect();
        order.sort_by(|a, b| sing[*b].total_cmp(&sing[*a]));
        self.sing_values = order.iter().map(|k| sing[*k]).collect();

        for k in 0..sing.len() {
            let sigma = sing[k];
            if sigma <= self.min_sing_value || sigma <= 0.0 {
                continue;
            }
            let gain = sigma / (sigma * sigma + lambda2);
            for (j, col) in cols.iter().enumerate() {
                let vjk = v[[j, k]] * gain;
                if vjk == 0.0 {
                    continue;
                }
                for (i, row) in rows.iter().enumerate() {
                    self.inverse[[*col, *row]] += vjk * u[[i, k]];
                }
            }
        }
    }

    /// Kick changes that cancel `orbit` (already referenced)
    pub fn solve(&self, orbit: &[f64]) -> Result<Vec<f64>, SofbError> {
        let expected = self.geometry.orbit_len();
        if orbit.len() != expected {
            return Err(SofbError::Length {
                what: "orbit",
                expected,
                found: orbit.len(),
            });
        }
        let orbit = Array1::from(orbit.to_vec());
        Ok(self.inverse.dot(&orbit).iter().map(|x| -x).collect())
    }
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn geometry() -> Geometry {
        Geometry {
            nr_bpms: 2,
            nr_ch: 1,
            nr_cv: 1,
            has_rf: false,
        }
    }

    #[test]
    fn test_svd_reconstructs() {
        let a = array![[3.0, 1.0], [1.0, 3.0], [0.5, -0.5]];
        let (u, s, v) = svd(&a);
        let rebuilt = u.dot(&Array2::from_diag(&Array1::from(s.clone()))).dot(&v.t());
        for (x, y) in a.iter().zip(rebuilt.iter()) {
            assert!((x - y).abs() < 1e-10);
        }
        // AᵀA has eigenvalues 16 and 4.5
        let mut sorted = s.clone();
        sorted.sort_by(|a, b| b.total_cmp(a));
        assert!((sorted[0] - 4.0).abs() < 1e-9);
        assert!((sorted[1] - 4.5_f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_solve_cancels_orbit() {
        let mut rm = ResponseMatrix::new(geometry(), 1e-6, 0.0);
        // x1, x2 respond to CH; y1, y2 to CV
        rm.set_flat(&[2.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 3.0]).unwrap();
        let kick = [0.5, -0.25];
        let orbit: Vec<f64> = rm.matrix().dot(&Array1::from(kick.to_vec())).to_vec();
        let delta = rm.solve(&orbit).unwrap();
        assert!((delta[0] + 0.5).abs() < 1e-9);
        assert!((delta[1] - 0.25).abs() < 1e-9);
        assert_eq!(rm.nr_sing_values(), 2);
    }

    #[test]
    fn test_disabled_corrector_gets_no_kick() {
        let mut rm = ResponseMatrix::new(geometry(), 1e-6, 0.0);
        rm.set_flat(&[2.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 3.0]).unwrap();
        rm.set_corr_enable(&[true, false]).unwrap();
        let delta = rm.solve(&[1.0, 1.0, 1.0, 1.0]).unwrap();
        assert_eq!(delta[1], 0.0);
        assert!(delta[0] != 0.0);
        assert!(rm.set_corr_enable(&[true]).is_err());
    }

    #[test]
    fn test_truncation_and_regularisation() {
        let mut rm = ResponseMatrix::new(geometry(), 1e-6, 0.0);
        rm.set_flat(&[2.0, 0.0, 1.0, 0.0, 0.0, 1e-3, 0.0, 1e-3]).unwrap();
        assert_eq!(rm.nr_sing_values(), 2);
        rm.set_min_sing_value(0.01).unwrap();
        assert_eq!(rm.nr_sing_values(), 1);
        let delta = rm.solve(&[0.0, 0.0, 1.0, 1.0]).unwrap();
        assert_eq!(delta[1], 0.0);

        rm.set_min_sing_value(0.0).unwrap();
        rm.set_tikhonov(1.0).unwrap();
        let damped = rm.solve(&[2.0, 1.0, 0.0, 0.0]).unwrap();
        // σ² = 5: undamped gain 1/σ, damped σ/(σ²+1)
        assert!((damped[0] + 5.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_inversion_parameters_keep_the_inverse() {
        let mut rm = ResponseMatrix::new(geometry(), 1e-6, 0.0);
        rm.set_flat(&[2.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 3.0]).unwrap();
        let inverse = rm.inverse_flat();
        assert!(matches!(
            rm.set_min_sing_value(-1.0),
            Err(SofbError::InvalidParameter { .. })
        ));
        assert!(rm.set_tikhonov(f64::NAN).is_err());
        assert_eq!(rm.inverse_flat(), inverse);
        assert_eq!(rm.nr_sing_values(), 2);
    }

    #[test]
    fn test_shape_errors() {
        let mut rm = ResponseMatrix::new(geometry(), 0.0, 0.0);
        assert!(matches!(
            rm.set_flat(&[1.0; 3]),
            Err(SofbError::MatrixShape { expected: 8, found: 3 })
        ));
        assert!(rm.solve(&[0.0; 3]).is_err());
    }
}
