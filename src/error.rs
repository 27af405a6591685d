//! Error taxonomy for model construction, initialization and solving.

use crate::solvers::SolverError;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, RpbError>;

/// Why a final solve stopped without converging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCondition {
    /// Iteration budget used up
    MaxIterations,
    /// Newton matrix could not be factorized
    SingularJacobian,
    /// Line search could not find an acceptable step
    StepSizeTooSmall,
    /// Residual norm blew up
    Diverged,
    /// Residuals evaluated to NaN or infinity
    NonFinite,
    /// Equation and unknown counts differ
    NotSquare,
}

impl std::fmt::Display for TerminationCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TerminationCondition::MaxIterations => "maxIterations",
            TerminationCondition::SingularJacobian => "singularJacobian",
            TerminationCondition::StepSizeTooSmall => "stepSizeTooSmall",
            TerminationCondition::Diverged => "diverged",
            TerminationCondition::NonFinite => "nonFinite",
            TerminationCondition::NotSquare => "notSquare",
        };
        f.write_str(label)
    }
}

impl From<&SolverError> for TerminationCondition {
    fn from(err: &SolverError) -> Self {
        match err {
            SolverError::MaxIterationsExceeded { .. } => TerminationCondition::MaxIterations,
            SolverError::SingularJacobian { .. } => TerminationCondition::SingularJacobian,
            SolverError::StepSizeTooSmall { .. } => TerminationCondition::StepSizeTooSmall,
            SolverError::Diverged { .. } => TerminationCondition::Diverged,
            SolverError::NonFiniteResidual { .. } => TerminationCondition::NonFinite,
            SolverError::NotSquare { .. } | SolverError::NoVariablesToSolve => {
                TerminationCondition::NotSquare
            }
        }
    }
}

/// Errors raised by the rotary packed bed model.
#[derive(Debug, thiserror::Error)]
pub enum RpbError {
    /// Malformed discretization input
    #[error("invalid grid: {0}")]
    InvalidGrid(String),

    /// Invalid mode, flow direction, or an unsolvable fixed/free split
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A continuation step failed; the model is left at the last converged point
    #[error(
        "initialization diverged at continuation point {attempted} \
         (last converged: {last_converged:?}, residual norm {residual_norm:.3e}): {source}"
    )]
    InitializationDiverged {
        /// Continuation point whose solve failed
        attempted: f64,
        /// Last point that converged, `None` if the first point failed
        last_converged: Option<f64>,
        /// Scaled residual norm when the failing solve stopped
        residual_norm: f64,
        /// Registry values at the last converged point
        state: Vec<f64>,
        /// Underlying Newton failure
        #[source]
        source: SolverError,
    },

    /// The final solve did not converge
    #[error("solve failed ({status}) after {iterations} iterations, residual norm {residual_norm:.3e}")]
    SolveFailed {
        /// Termination condition reported by the solver
        status: TerminationCondition,
        /// Newton iterations taken
        iterations: usize,
        /// Scaled residual norm when the solver stopped
        residual_norm: f64,
    },

    /// Two sides of a relation carry incompatible units
    #[error("unit mismatch on {context}: expected {expected}, found {found}")]
    UnitConsistency {
        /// Variable or equation being checked
        context: String,
        /// Unit the variable is declared with
        expected: String,
        /// Unit that was supplied
        found: String,
    },

    /// Configuration or snapshot JSON could not be parsed
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RpbError {
    /// Maps a Newton failure from a final (non-continuation) solve.
    pub fn from_solver(err: &SolverError) -> Self {
        RpbError::SolveFailed {
            status: TerminationCondition::from(err),
            iterations: err.iterations(),
            residual_norm: err.residual_norm().unwrap_or(f64::NAN),
        }
    }
}
