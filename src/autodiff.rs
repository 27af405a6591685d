//! Forward-mode automatic differentiation on top of `num-dual`.
//!
//! Residuals are written once, generically over [`num_dual::DualNum`], and
//! evaluated either with plain `f64` (reporting, balances) or with [`Dual64`]
//! to obtain exact partial derivatives for the Newton matrix.
//!
//! # Example
//!
//! ```
//! use nalgebra::DMatrix;
//! use num_dual::Dual64;
//! use rpb_capture::autodiff::compute_jacobian;
//!
//! // f(x, y) = [x^2, xy]
//! let f = |v: &[Dual64]| vec![v[0] * v[0], v[0] * v[1]];
//! let jac: DMatrix<f64> = compute_jacobian(f, &[2.0, 3.0]);
//! assert_eq!(jac[(0, 0)], 4.0);
//! assert_eq!(jac[(1, 1)], 2.0);
//! ```

use nalgebra::DMatrix;
use num_dual::Dual64;

/// Derivative of a scalar residual with respect to one unknown.
///
/// `positions` lists every argument slot bound to that unknown; all of them
/// are seeded together so repeated references differentiate correctly.
pub fn seeded_derivative<F>(f: &F, x: &[f64], positions: &[usize]) -> f64
where
    F: Fn(&[Dual64]) -> Dual64 + ?Sized,
{
    let mut args: Vec<Dual64> = x.iter().map(|&v| Dual64::from(v)).collect();
    for &p in positions {
        args[p] = Dual64::from(x[p]).derivative();
    }
    f(&args).eps
}

/// Computes the dense Jacobian of a vector residual function.
///
/// One forward sweep per column; intended for small systems written directly
/// against `Dual64`.
pub fn compute_jacobian<F>(f: F, x: &[f64]) -> DMatrix<f64>
where
    F: Fn(&[Dual64]) -> Vec<Dual64>,
{
    let n_vars = x.len();
    let mut columns: Vec<Vec<f64>> = Vec::with_capacity(n_vars);

    for j in 0..n_vars {
        let mut x_dual: Vec<Dual64> = x.iter().map(|&v| Dual64::from(v)).collect();
        x_dual[j] = Dual64::from(x[j]).derivative();
        columns.push(f(&x_dual).iter().map(|r| r.eps).collect());
    }

    let n_eqs = columns.first().map_or(0, |c| c.len());
    DMatrix::from_fn(n_eqs, n_vars, |i, j| columns[j][i])
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_dual::DualNum;

    fn toth_like<D: DualNum<f64> + Copy>(p: D) -> D {
        let bp = p * 2.0;
        bp / (bp.powf(0.5) + 1.0).powf(2.0)
    }

    #[test]
    fn test_compute_jacobian_simple() {
        let f = |vars: &[Dual64]| {
            let x = vars[0];
            let y = vars[1];
            vec![x * x, x * y]
        };

        let jac = compute_jacobian(f, &[2.0, 3.0]);

        assert_eq!(jac.nrows(), 2);
        assert_eq!(jac.ncols(), 2);
        assert!((jac[(0, 0)] - 4.0).abs() < 1e-10);
        assert!((jac[(0, 1)] - 0.0).abs() < 1e-10);
        assert!((jac[(1, 0)] - 3.0).abs() < 1e-10);
        assert!((jac[(1, 1)] - 2.0).abs() < 1e-10);
    }

    #[test]
    fn test_dual_chain_rule_matches_finite_difference() {
        let x = 0.7;
        let h = 1e-6;
        let fd = (toth_like(x + h) - toth_like(x - h)) / (2.0 * h);
        let ad = toth_like(Dual64::from(x).derivative()).eps;
        assert!((fd - ad).abs() < 1e-6);
    }

    #[test]
    fn test_seeded_derivative_repeated_slot() {
        // f(a, b) = a * b with both slots bound to the same unknown: d/dx x^2 = 2x
        let f = |v: &[Dual64]| v[0] * v[1];
        let d = seeded_derivative(&f, &[3.0, 3.0], &[0, 1]);
        assert!((d - 6.0).abs() < 1e-12);
        let d0 = seeded_derivative(&f, &[3.0, 5.0], &[0]);
        assert!((d0 - 5.0).abs() < 1e-12);
    }
}
