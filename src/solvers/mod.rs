//! Numerical solvers for the equation-oriented bed model.
//!
//! The whole discretized model is one square nonlinear system `F(x) = 0`
//! solved simultaneously with a damped Newton method:
//!
//! 1. Collect the equations of the selected blocks
//! 2. Take every free variable they reference as an unknown
//! 3. Iterate `J dx = -F` with exact (dual-number) Jacobians, keeping
//!    bounded variables strictly inside their bounds and backtracking
//!    until the residual norm decreases
//!
//! # Submodules
//!
//! - [`continuation`]: parameter sweeps that walk a model from a trivial
//!   state to the full problem, one Newton solve per point.
//!
//! # Usage Pattern
//!
//! ```
//! use rpb_capture::solvers::NewtonRaphson;
//!
//! // x^2 - 4 = 0
//! let f = |x: &[f64]| (vec![x[0] * x[0] - 4.0], vec![vec![2.0 * x[0]]]);
//! let solution = NewtonRaphson::new(1e-10, 20).solve(f, &[1.0]).unwrap();
//! assert!((solution[0] - 2.0).abs() < 1e-8);
//! ```

pub mod continuation;

use std::collections::HashMap;

use log::debug;
use nalgebra::{DMatrix, DVector};
use num_dual::Dual64;
use serde::{Deserialize, Serialize};

use crate::autodiff::{compute_jacobian, seeded_derivative};
use crate::{Model, VarId};

/// Result type for solver operations.
pub type SolverResult<T> = Result<T, SolverError>;

/// Errors that can occur during solving.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SolverError {
    /// Maximum iterations exceeded without convergence
    #[error("Maximum iterations exceeded ({iterations}, residual norm {residual_norm:.3e})")]
    MaxIterationsExceeded { iterations: usize, residual_norm: f64 },
    /// Singular Jacobian matrix encountered
    #[error("Singular Jacobian matrix at iteration {iteration}")]
    SingularJacobian { iteration: usize },
    /// Line search exhausted its backtracking budget
    #[error("Step size too small at iteration {iteration} (residual norm {residual_norm:.3e})")]
    StepSizeTooSmall { iteration: usize, residual_norm: f64 },
    /// Solution diverged
    #[error("Solution diverged at iteration {iteration} (residual norm {residual_norm:.3e})")]
    Diverged { iteration: usize, residual_norm: f64 },
    /// Residuals or Newton step contain NaN or infinity
    #[error("Non-finite residual at iteration {iteration}")]
    NonFiniteResidual { iteration: usize },
    /// Equation and unknown counts differ
    #[error("System is not square: {equations} equations, {unknowns} unknowns")]
    NotSquare { equations: usize, unknowns: usize },
    /// No variables to solve in the equation system
    #[error("No variables to solve")]
    NoVariablesToSolve,
}

impl SolverError {
    /// Newton iterations completed before the failure.
    pub fn iterations(&self) -> usize {
        match self {
            SolverError::MaxIterationsExceeded { iterations, .. } => *iterations,
            SolverError::SingularJacobian { iteration }
            | SolverError::StepSizeTooSmall { iteration, .. }
            | SolverError::Diverged { iteration, .. }
            | SolverError::NonFiniteResidual { iteration } => *iteration,
            SolverError::NotSquare { .. } | SolverError::NoVariablesToSolve => 0,
        }
    }

    /// Scaled residual norm at the failure, when one was computed.
    pub fn residual_norm(&self) -> Option<f64> {
        match self {
            SolverError::MaxIterationsExceeded { residual_norm, .. }
            | SolverError::StepSizeTooSmall { residual_norm, .. }
            | SolverError::Diverged { residual_norm, .. } => Some(*residual_norm),
            _ => None,
        }
    }
}

/// A square nonlinear system with optional simple bounds on the unknowns.
pub trait NonlinearSystem {
    /// Number of unknowns (and equations).
    fn dimension(&self) -> usize;

    /// Residual vector at `x`.
    fn residuals(&self, x: &[f64]) -> Vec<f64>;

    /// Jacobian `dF/dx` at `x`.
    fn jacobian(&self, x: &[f64]) -> DMatrix<f64>;

    /// Lower and upper bound of unknown `i`.
    fn bounds(&self, _i: usize) -> (Option<f64>, Option<f64>) {
        (None, None)
    }
}

/// Adapter for a closure returning residuals and a row-major Jacobian.
pub struct ClosureSystem<F> {
    n: usize,
    f: F,
}

impl<F> ClosureSystem<F>
where
    F: Fn(&[f64]) -> (Vec<f64>, Vec<Vec<f64>>),
{
    pub fn new(n: usize, f: F) -> Self {
        ClosureSystem { n, f }
    }
}

impl<F> NonlinearSystem for ClosureSystem<F>
where
    F: Fn(&[f64]) -> (Vec<f64>, Vec<Vec<f64>>),
{
    fn dimension(&self) -> usize {
        self.n
    }

    fn residuals(&self, x: &[f64]) -> Vec<f64> {
        (self.f)(x).0
    }

    fn jacobian(&self, x: &[f64]) -> DMatrix<f64> {
        let rows = (self.f)(x).1;
        DMatrix::from_row_slice(self.n, self.n, &rows.concat())
    }
}

/// A system written directly against dual numbers; the Jacobian comes for free.
pub struct DualSystem<F> {
    n: usize,
    f: F,
    bounds: Vec<(Option<f64>, Option<f64>)>,
}

impl<F> DualSystem<F>
where
    F: Fn(&[Dual64]) -> Vec<Dual64>,
{
    pub fn new(n: usize, f: F) -> Self {
        DualSystem { n, f, bounds: vec![(None, None); n] }
    }

    /// Attaches bounds to the unknowns.
    pub fn with_bounds(mut self, bounds: Vec<(Option<f64>, Option<f64>)>) -> Self {
        self.bounds = bounds;
        self
    }
}

impl<F> NonlinearSystem for DualSystem<F>
where
    F: Fn(&[Dual64]) -> Vec<Dual64>,
{
    fn dimension(&self) -> usize {
        self.n
    }

    fn residuals(&self, x: &[f64]) -> Vec<f64> {
        let args: Vec<Dual64> = x.iter().map(|&v| Dual64::from(v)).collect();
        (self.f)(&args).iter().map(|r| r.re).collect()
    }

    fn jacobian(&self, x: &[f64]) -> DMatrix<f64> {
        compute_jacobian(&self.f, x)
    }

    fn bounds(&self, i: usize) -> (Option<f64>, Option<f64>) {
        self.bounds.get(i).copied().unwrap_or((None, None))
    }
}

/// Newton configuration, loadable from JSON alongside a bed configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Maximum Newton iterations
    pub max_iterations: usize,
    /// Convergence tolerance on the L2 norm of the scaled residuals
    pub tolerance: f64,
    /// Fraction of the (bound-limited) Newton step tried first
    pub damping: f64,
    /// Step halvings allowed per iteration
    pub max_backtracks: usize,
    /// Relative distance initial values are pushed inside their bounds
    pub bound_push: f64,
    /// Fraction of the distance to a bound a single step may cover
    pub boundary_fraction: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            max_iterations: 100,
            tolerance: 1e-8,
            damping: 1.0,
            max_backtracks: 30,
            bound_push: 1e-8,
            boundary_fraction: 0.99,
        }
    }
}

impl SolverConfig {
    /// Creates a new solver configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum iterations.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Sets the convergence tolerance.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Sets the initial step fraction.
    pub fn with_damping(mut self, damping: f64) -> Self {
        self.damping = damping.clamp(1e-3, 1.0);
        self
    }

    /// Sets the number of step halvings allowed per iteration.
    pub fn with_max_backtracks(mut self, max_backtracks: usize) -> Self {
        self.max_backtracks = max_backtracks;
        self
    }
}

/// Newton-Raphson solver for nonlinear algebraic equations.
///
/// Solves systems of the form F(x) = 0 using
/// x_{k+1} = x_k - alpha_k J^{-1} F(x_k)
///
/// where `alpha_k` is halved until `||F||` decreases sufficiently. Each bounded
/// unknown is clipped separately so it covers at most `boundary_fraction` of
/// its remaining distance to the bound; an unknown sitting near its bound does
/// not shorten the step of the others.
#[derive(Debug, Clone)]
pub struct NewtonRaphson {
    /// Convergence tolerance
    pub tolerance: f64,
    /// Maximum number of iterations
    pub max_iterations: usize,
    /// Relaxation factor (1.0 = full Newton step)
    pub relaxation: f64,
    /// Step halvings allowed per iteration
    pub max_backtracks: usize,
    /// Relative interior push applied to the initial point
    pub bound_push: f64,
    /// Fraction-to-boundary factor
    pub boundary_fraction: f64,
}

impl Default for NewtonRaphson {
    fn default() -> Self {
        Self::from_config(&SolverConfig::default())
    }
}

impl NewtonRaphson {
    /// Creates a new Newton-Raphson solver with default settings.
    pub fn new(tolerance: f64, max_iterations: usize) -> Self {
        NewtonRaphson { tolerance, max_iterations, ..Self::default() }
    }

    /// Creates a solver with relaxation (damped Newton method).
    pub fn with_relaxation(tolerance: f64, max_iterations: usize, relaxation: f64) -> Self {
        NewtonRaphson { tolerance, max_iterations, relaxation, ..Self::default() }
    }

    pub fn from_config(config: &SolverConfig) -> Self {
        NewtonRaphson {
            tolerance: config.tolerance,
            max_iterations: config.max_iterations,
            relaxation: config.damping.clamp(1e-3, 1.0),
            max_backtracks: config.max_backtracks,
            bound_push: config.bound_push,
            boundary_fraction: config.boundary_fraction,
        }
    }

    /// Solves the nonlinear system F(x) = 0.
    ///
    /// # Arguments
    ///
    /// * `f` - Function computing residuals and Jacobian
    /// * `x0` - Initial guess
    pub fn solve<F>(&self, f: F, x0: &[f64]) -> SolverResult<Vec<f64>>
    where
        F: Fn(&[f64]) -> (Vec<f64>, Vec<Vec<f64>>),
    {
        self.solve_with_stats(f, x0).map(|(x, _)| x)
    }

    /// Solves the nonlinear system and returns solution with statistics.
    pub fn solve_with_stats<F>(&self, f: F, x0: &[f64]) -> SolverResult<(Vec<f64>, SolverStats)>
    where
        F: Fn(&[f64]) -> (Vec<f64>, Vec<Vec<f64>>),
    {
        self.solve_system(&ClosureSystem::new(x0.len(), f), x0)
    }

    /// Solves any [`NonlinearSystem`], honouring its bounds.
    pub fn solve_system<S: NonlinearSystem>(
        &self,
        system: &S,
        x0: &[f64],
    ) -> SolverResult<(Vec<f64>, SolverStats)> {
        let n = system.dimension();
        if n == 0 {
            return Err(SolverError::NoVariablesToSolve);
        }

        let bounds: Vec<(Option<f64>, Option<f64>)> = (0..n).map(|i| system.bounds(i)).collect();
        let mut x: Vec<f64> =
            x0.iter().zip(&bounds).map(|(&v, &b)| push_inside(v, b, self.bound_push)).collect();

        let mut stats = SolverStats::new();
        let mut residuals = system.residuals(&x);
        stats.function_evals += 1;
        if !residuals.iter().all(|r| r.is_finite()) {
            return Err(SolverError::NonFiniteResidual { iteration: 0 });
        }
        let mut norm = l2(&residuals);

        for iteration in 0..=self.max_iterations {
            stats.iterations = iteration;
            stats.final_residual = norm;
            if norm < self.tolerance {
                debug!("newton converged in {iteration} iterations, |F| = {norm:.3e}");
                return Ok((x, stats));
            }
            if iteration == self.max_iterations {
                break;
            }
            if iteration > 10 && norm > 1e10 {
                return Err(SolverError::Diverged { iteration, residual_norm: norm });
            }

            let jacobian = system.jacobian(&x);
            stats.jacobian_evals += 1;

            // Solve J * dx = -F
            let rhs = -DVector::from_vec(residuals.clone());
            let dx = jacobian.lu().solve(&rhs).ok_or(SolverError::SingularJacobian { iteration })?;
            if !dx.iter().all(|d| d.is_finite()) {
                return Err(SolverError::NonFiniteResidual { iteration });
            }

            let mut alpha = self.relaxation;
            let mut accepted = None;
            for _ in 0..=self.max_backtracks {
                let trial = self.bounded_step(&x, dx.as_slice(), alpha, &bounds);
                let trial_residuals = system.residuals(&trial);
                stats.function_evals += 1;
                if trial_residuals.iter().all(|r| r.is_finite()) {
                    let trial_norm = l2(&trial_residuals);
                    if trial_norm <= (1.0 - 1e-4 * alpha) * norm {
                        accepted = Some((trial, trial_residuals, trial_norm));
                        break;
                    }
                }
                alpha *= 0.5;
            }

            match accepted {
                Some((trial, trial_residuals, trial_norm)) => {
                    debug!(
                        "newton iteration {}: |F| {:.3e} -> {:.3e}",
                        iteration + 1,
                        norm,
                        trial_norm
                    );
                    x = trial;
                    residuals = trial_residuals;
                    norm = trial_norm;
                }
                None => {
                    return Err(SolverError::StepSizeTooSmall { iteration, residual_norm: norm });
                }
            }
        }

        Err(SolverError::MaxIterationsExceeded {
            iterations: self.max_iterations,
            residual_norm: norm,
        })
    }

    /// `x + alpha dx` with every bounded component held inside
    /// `boundary_fraction` of its remaining distance to the bound.
    fn bounded_step(
        &self,
        x: &[f64],
        dx: &[f64],
        alpha: f64,
        bounds: &[(Option<f64>, Option<f64>)],
    ) -> Vec<f64> {
        let tau = self.boundary_fraction;
        x.iter()
            .zip(dx)
            .zip(bounds)
            .map(|((&xi, &di), &(lower, upper))| {
                let mut step = alpha * di;
                if let Some(lb) = lower {
                    step = step.max(-tau * (xi - lb).max(0.0));
                }
                if let Some(ub) = upper {
                    step = step.min(tau * (ub - xi).max(0.0));
                }
                xi + step
            })
            .collect()
    }
}

fn push_inside(value: f64, (lower, upper): (Option<f64>, Option<f64>), push: f64) -> f64 {
    let mut v = value;
    if let (Some(lb), Some(ub)) = (lower, upper) {
        let margin = (push * lb.abs().max(1.0)).min(0.5 * (ub - lb));
        return v.clamp(lb + margin, ub - margin);
    }
    if let Some(lb) = lower {
        v = v.max(lb + push * lb.abs().max(1.0));
    }
    if let Some(ub) = upper {
        v = v.min(ub - push * ub.abs().max(1.0));
    }
    v
}

fn l2(values: &[f64]) -> f64 {
    values.iter().map(|r| r * r).sum::<f64>().sqrt()
}

/// Statistics from a solver run.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverStats {
    /// Number of iterations performed
    pub iterations: usize,
    /// Number of function evaluations
    pub function_evals: usize,
    /// Number of Jacobian evaluations
    pub jacobian_evals: usize,
    /// Final residual norm
    pub final_residual: f64,
}

impl SolverStats {
    /// Creates new solver statistics.
    pub fn new() -> Self {
        SolverStats { iterations: 0, function_evals: 0, jacobian_evals: 0, final_residual: 0.0 }
    }
}

impl Default for SolverStats {
    fn default() -> Self {
        Self::new()
    }
}

/// The equations of a set of model rows as a square system in the free
/// variables they reference.
pub(crate) struct ModelProblem<'a> {
    model: &'a Model,
    rows: Vec<usize>,
    columns: Vec<VarId>,
    base: Vec<f64>,
    bounds: Vec<(Option<f64>, Option<f64>)>,
    /// Per row: (column, argument slots bound to that column)
    patterns: Vec<Vec<(usize, Vec<usize>)>>,
}

impl<'a> ModelProblem<'a> {
    pub(crate) fn new(model: &'a Model, rows: Vec<usize>) -> SolverResult<Self> {
        let registry = model.registry();
        let equations = model.equations().equations();

        let mut column_of: HashMap<VarId, usize> = HashMap::new();
        let mut columns = Vec::new();
        let mut patterns = Vec::with_capacity(rows.len());
        for &row in &rows {
            let mut pattern: Vec<(usize, Vec<usize>)> = Vec::new();
            for (slot, &id) in equations[row].vars().iter().enumerate() {
                if registry.is_fixed(id) {
                    continue;
                }
                let column = *column_of.entry(id).or_insert_with(|| {
                    columns.push(id);
                    columns.len() - 1
                });
                match pattern.iter_mut().find(|(c, _)| *c == column) {
                    Some((_, slots)) => slots.push(slot),
                    None => pattern.push((column, vec![slot])),
                }
            }
            patterns.push(pattern);
        }

        if columns.is_empty() {
            return Err(SolverError::NoVariablesToSolve);
        }
        if columns.len() != rows.len() {
            return Err(SolverError::NotSquare { equations: rows.len(), unknowns: columns.len() });
        }

        let bounds = columns.iter().map(|&id| registry.bounds(id)).collect();
        Ok(ModelProblem { model, rows, columns, base: registry.get_all_values(), bounds, patterns })
    }

    pub(crate) fn initial_point(&self) -> Vec<f64> {
        self.columns.iter().map(|id| self.base[id.index()]).collect()
    }

    pub(crate) fn write_back(&self, x: &[f64]) {
        let registry = self.model.registry();
        for (&id, &value) in self.columns.iter().zip(x) {
            registry.set(id, value);
        }
    }

    fn full_state(&self, x: &[f64]) -> Vec<f64> {
        let mut full = self.base.clone();
        for (&id, &value) in self.columns.iter().zip(x) {
            full[id.index()] = value;
        }
        full
    }
}

impl NonlinearSystem for ModelProblem<'_> {
    fn dimension(&self) -> usize {
        self.columns.len()
    }

    fn residuals(&self, x: &[f64]) -> Vec<f64> {
        let full = self.full_state(x);
        let equations = self.model.equations().equations();
        self.rows.iter().map(|&row| equations[row].evaluate(&full)).collect()
    }

    fn jacobian(&self, x: &[f64]) -> DMatrix<f64> {
        let full = self.full_state(x);
        let equations = self.model.equations().equations();
        let n = self.columns.len();
        let mut jac = DMatrix::zeros(n, n);
        for (r, (&row, pattern)) in self.rows.iter().zip(&self.patterns).enumerate() {
            let eq = &equations[row];
            let args: Vec<f64> = eq.vars().iter().map(|id| full[id.index()]).collect();
            for (column, slots) in pattern {
                jac[(r, *column)] = eq.scale() * seeded_derivative(eq.residual_fn(), &args, slots);
            }
        }
        jac
    }

    fn bounds(&self, i: usize) -> (Option<f64>, Option<f64>) {
        self.bounds[i]
    }
}
