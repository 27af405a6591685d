//! Parameter continuation for hard nonlinear systems.
//!
//! A model is first placed at a state that solves the problem exactly for a
//! small value of a homotopy parameter. The parameter is then raised through
//! an increasing sequence of points ending at 1, and each point is solved
//! with Newton starting from the previous solution.
//!
//! A point that fails is retried halfway between the last converged value and
//! itself, up to a fixed number of halvings per point. When the halvings run
//! out the problem is restored to the last converged state and the failure is
//! reported with enough context to resume.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::{SolverError, SolverResult, SolverStats};
use crate::error::{Result, RpbError};

/// Something that can be solved repeatedly while a scalar parameter moves.
pub trait ContinuationProblem {
    /// Current value of the homotopy parameter.
    fn parameter(&self) -> f64;

    fn set_parameter(&mut self, value: f64);

    /// Snapshot of every value the solve may change.
    fn state(&self) -> Vec<f64>;

    fn restore(&mut self, state: &[f64]);

    /// Runs one Newton solve at the current parameter value.
    fn solve_step(&mut self) -> SolverResult<SolverStats>;
}

/// One converged point of a continuation run.
#[derive(Debug, Clone)]
pub struct ContinuationStep {
    pub point: f64,
    pub iterations: usize,
    pub residual_norm: f64,
    /// State the solve started from
    pub initial_guess: Vec<f64>,
    /// Converged state
    pub solution: Vec<f64>,
}

/// Record of a completed continuation run.
#[derive(Debug, Clone, Default)]
pub struct ContinuationReport {
    pub steps: Vec<ContinuationStep>,
}

impl ContinuationReport {
    pub fn total_iterations(&self) -> usize {
        self.steps.iter().map(|s| s.iterations).sum()
    }

    pub fn last_point(&self) -> Option<f64> {
        self.steps.last().map(|s| s.point)
    }
}

/// Halvings allowed between two configured points.
pub const DEFAULT_REFINEMENTS: usize = 4;

/// Sequence of homotopy points.
///
/// Serialized as the bare point list; the refinement count takes its default
/// on deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct Continuation {
    points: Vec<f64>,
    max_refinements: usize,
}

impl Default for Continuation {
    fn default() -> Self {
        Continuation {
            points: vec![1e-5, 1e-3, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0],
            max_refinements: DEFAULT_REFINEMENTS,
        }
    }
}

impl TryFrom<Vec<f64>> for Continuation {
    type Error = RpbError;

    fn try_from(points: Vec<f64>) -> Result<Self> {
        Continuation::new(points)
    }
}

impl From<Continuation> for Vec<f64> {
    fn from(c: Continuation) -> Self {
        c.points
    }
}

impl Continuation {
    /// # Errors
    ///
    /// `Configuration` unless the points are non-empty, strictly increasing,
    /// inside `(0, 1]` and end at exactly 1.
    pub fn new(points: Vec<f64>) -> Result<Self> {
        if points.is_empty() {
            return Err(RpbError::Configuration("continuation needs at least one point".into()));
        }
        if let Some(p) = points.iter().find(|p| !p.is_finite() || **p <= 0.0 || **p > 1.0) {
            return Err(RpbError::Configuration(format!(
                "continuation point {p} lies outside (0, 1]"
            )));
        }
        if points.windows(2).any(|w| w[1] <= w[0]) {
            return Err(RpbError::Configuration(
                "continuation points must be strictly increasing".into(),
            ));
        }
        if points.last() != Some(&1.0) {
            return Err(RpbError::Configuration("continuation must end at 1".into()));
        }
        Ok(Continuation { points, max_refinements: DEFAULT_REFINEMENTS })
    }

    /// Sets how many times a failing step may be halved before giving up.
    pub fn with_refinements(mut self, max_refinements: usize) -> Self {
        self.max_refinements = max_refinements;
        self
    }

    pub fn points(&self) -> &[f64] {
        &self.points
    }

    pub fn max_refinements(&self) -> usize {
        self.max_refinements
    }

    /// Walks `problem` through every point, inserting intermediate points
    /// where a step fails.
    ///
    /// The report lists every converged value in increasing order, so it
    /// holds the configured points plus any inserted ones.
    ///
    /// # Errors
    ///
    /// `InitializationDiverged` naming the last value tried. The problem is
    /// left at the last converged state with its parameter restored.
    pub fn run<P: ContinuationProblem>(&self, problem: &mut P) -> Result<ContinuationReport> {
        let mut report = ContinuationReport::default();
        let mut last_converged = None;

        for &point in &self.points {
            let mut trial = point;
            let mut refinements = 0;
            loop {
                let initial_guess = problem.state();
                let previous = problem.parameter();
                problem.set_parameter(trial);

                match problem.solve_step() {
                    Ok(stats) => {
                        debug!(
                            "continuation point {trial}: {} iterations, |F| = {:.3e}",
                            stats.iterations, stats.final_residual
                        );
                        report.steps.push(ContinuationStep {
                            point: trial,
                            iterations: stats.iterations,
                            residual_norm: stats.final_residual,
                            initial_guess,
                            solution: problem.state(),
                        });
                        last_converged = Some(trial);
                        if trial == point {
                            break;
                        }
                        trial = point;
                    }
                    Err(source) => {
                        problem.restore(&initial_guess);
                        problem.set_parameter(previous);
                        if refinements == self.max_refinements {
                            warn!("continuation failed at point {trial}: {source}");
                            return Err(diverged(trial, last_converged, initial_guess, source));
                        }
                        refinements += 1;
                        trial = 0.5 * (previous + trial);
                        debug!("continuation step failed ({source}); retrying at {trial}");
                    }
                }
            }
        }

        info!(
            "continuation finished: {} points, {} Newton iterations",
            report.steps.len(),
            report.total_iterations()
        );
        Ok(report)
    }
}

fn diverged(
    attempted: f64,
    last_converged: Option<f64>,
    state: Vec<f64>,
    source: SolverError,
) -> RpbError {
    RpbError::InitializationDiverged {
        attempted,
        last_converged,
        residual_norm: source.residual_norm().unwrap_or(f64::NAN),
        state,
        source,
    }
}
