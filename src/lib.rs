//! # rpb-capture: Rotary Packed Bed CO2 Capture Model
//!
//! An equation-oriented steady-state model of a rotary packed bed contactor
//! in which a solid sorbent rotates between an adsorption and a desorption
//! (regeneration) zone. Each zone is a two-dimensional (axial `z`, rotational
//! `o`) gas/solid model with coupled mass, energy and momentum balances,
//! assembled as residual equations over a shared variable registry and
//! solved simultaneously with Newton's method.
//!
//! ## Example
//!
//! ```no_run
//! use rpb_capture::solvers::continuation::Continuation;
//! use rpb_capture::{Model, NewtonRaphson, Section, SectionConfig};
//!
//! let mut model = Model::new();
//! let config = SectionConfig::adsorption().with_discretization(10, 10);
//! let ads = Section::build(&mut model, "ads", &config)?;
//!
//! ads.initialize(&model, &Continuation::default(), &NewtonRaphson::default())?;
//! println!("capture = {:.3}", ads.co2_capture.get());
//! # Ok::<(), rpb_capture::RpbError>(())
//! ```
//!
//! Variables carry a role in their type, so design inputs can be fixed with
//! unit-checked quantities while state variables cannot:
//!
//! ```
//! use rpb_capture::{Quantity, UnitTag, VariableRegistry};
//! use uom::si::f64::Length;
//! use uom::si::length::meter;
//!
//! let registry = VariableRegistry::new();
//! let length = registry.create_design("ads.L", 8.0, UnitTag::Meter);
//! length.fix_at(Quantity::Length(Length::new::<meter>(6.0))).unwrap();
//! assert_eq!(length.get(), 6.0);
//! assert!(length.is_fixed());
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::rc::Rc;

use log::{info, warn};
use num_dual::Dual64;
use serde::{Deserialize, Serialize};

pub mod autodiff;
pub mod error;
pub mod grid;
pub mod models;
pub mod snapshot;
pub mod solvers;
pub mod units;

pub use error::{Result, RpbError, TerminationCondition};
pub use grid::Grid;
pub use models::rotary_packed_bed::{RotaryPackedBed, RpbConfig};
pub use models::section::{FlowDirection, Mode, Section, SectionConfig};
pub use snapshot::Snapshot;
pub use solvers::{NewtonRaphson, SolverConfig, SolverStats};
pub use units::{Quantity, UnitTag};

use solvers::{ModelProblem, SolverError, SolverResult};

/// Index of a variable in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub usize);

impl VarId {
    /// Gets the index value.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Metadata kept for every registered variable.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableInfo {
    /// Path name, e.g. `ads.y[3,4]`
    pub name: String,
    /// Role the variable was created with
    pub role: &'static str,
    pub unit: UnitTag,
    /// Fixed variables are inputs, not unknowns
    pub fixed: bool,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub doc: String,
}

/// A variable whose value lies outside its bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundViolation {
    pub name: String,
    pub value: f64,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

/// Central registry for all variable values and their metadata.
///
/// Handles ([`Var`]) and the solver share one registry, so a solve updates
/// values every unit model reads afterwards.
///
/// # Examples
///
/// ```
/// use rpb_capture::{UnitTag, VariableRegistry};
///
/// let registry = VariableRegistry::new();
/// let temp = registry.create_state("ads.Tg[0,0]", 363.0, UnitTag::Kelvin);
///
/// // Solver updates the value
/// registry.set(temp.id(), 310.0);
///
/// // Unit models read the updated value
/// assert_eq!(temp.get(), 310.0);
/// assert_eq!(registry.find("ads.Tg[0,0]"), Some(temp.id()));
/// ```
#[derive(Debug, Clone)]
pub struct VariableRegistry {
    /// Storage for all variable values
    values: Rc<RefCell<Vec<f64>>>,
    /// Names, roles, units, bounds and fixed flags
    info: Rc<RefCell<Vec<VariableInfo>>>,
    /// Path name lookup
    names: Rc<RefCell<HashMap<String, VarId>>>,
}

impl VariableRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        VariableRegistry {
            values: Rc::new(RefCell::new(Vec::new())),
            info: Rc::new(RefCell::new(Vec::new())),
            names: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    /// Registers a new variable and returns its ID.
    fn register(
        &self,
        name: &str,
        initial_value: f64,
        unit: UnitTag,
        role: &'static str,
        fixed: bool,
    ) -> VarId {
        let mut values = self.values.borrow_mut();
        let id = VarId(values.len());
        values.push(initial_value);
        self.info.borrow_mut().push(VariableInfo {
            name: name.to_string(),
            role,
            unit,
            fixed,
            lower: None,
            upper: None,
            doc: String::new(),
        });
        let mut names = self.names.borrow_mut();
        if names.contains_key(name) {
            warn!("variable name {name} registered twice; lookups return the first");
        } else {
            names.insert(name.to_string(), id);
        }
        id
    }

    /// Creates a design variable, fixed on creation.
    pub fn create_design(&self, name: &str, value: f64, unit: UnitTag) -> Var<Design> {
        let id = self.register(name, value, unit, Design::NAME, true);
        Var::from_id(id, self.clone())
    }

    /// Creates a free state variable.
    pub fn create_state(&self, name: &str, value: f64, unit: UnitTag) -> Var<State> {
        let id = self.register(name, value, unit, State::NAME, false);
        Var::from_id(id, self.clone())
    }

    /// Creates a free variable defined by one equation of its block.
    pub fn create_derived(&self, name: &str, value: f64, unit: UnitTag) -> Var<Derived> {
        let id = self.register(name, value, unit, Derived::NAME, false);
        Var::from_id(id, self.clone())
    }

    /// Gets the current value of a variable.
    pub fn get(&self, id: VarId) -> f64 {
        self.values.borrow()[id.0]
    }

    /// Sets the value of a variable.
    pub fn set(&self, id: VarId, value: f64) {
        self.values.borrow_mut()[id.0] = value;
    }

    /// Gets the role of a variable (for debugging/validation).
    pub fn get_role(&self, id: VarId) -> &'static str {
        self.info.borrow()[id.0].role
    }

    pub fn name(&self, id: VarId) -> String {
        self.info.borrow()[id.0].name.clone()
    }

    pub fn unit(&self, id: VarId) -> UnitTag {
        self.info.borrow()[id.0].unit
    }

    pub fn info(&self, id: VarId) -> VariableInfo {
        self.info.borrow()[id.0].clone()
    }

    /// Looks a variable up by path name.
    pub fn find(&self, name: &str) -> Option<VarId> {
        self.names.borrow().get(name).copied()
    }

    /// True when any variable name starts with `prefix.`.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        let dotted = format!("{prefix}.");
        self.info.borrow().iter().any(|v| v.name.starts_with(&dotted))
    }

    pub fn is_fixed(&self, id: VarId) -> bool {
        self.info.borrow()[id.0].fixed
    }

    pub fn fix(&self, id: VarId) {
        self.info.borrow_mut()[id.0].fixed = true;
    }

    pub fn unfix(&self, id: VarId) {
        self.info.borrow_mut()[id.0].fixed = false;
    }

    pub fn bounds(&self, id: VarId) -> (Option<f64>, Option<f64>) {
        let info = self.info.borrow();
        (info[id.0].lower, info[id.0].upper)
    }

    pub fn set_bounds(&self, id: VarId, lower: Option<f64>, upper: Option<f64>) {
        let mut info = self.info.borrow_mut();
        info[id.0].lower = lower;
        info[id.0].upper = upper;
    }

    pub fn set_doc(&self, id: VarId, doc: &str) {
        self.info.borrow_mut()[id.0].doc = doc.to_string();
    }

    pub fn doc(&self, id: VarId) -> String {
        self.info.borrow()[id.0].doc.clone()
    }

    /// Returns the total number of variables.
    pub fn len(&self) -> usize {
        self.values.borrow().len()
    }

    /// Returns whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.values.borrow().is_empty()
    }

    /// Gets all values as a vector (for solvers).
    pub fn get_all_values(&self) -> Vec<f64> {
        self.values.borrow().clone()
    }

    /// Sets all values from a vector (for solvers).
    ///
    /// # Errors
    ///
    /// `Configuration` when the vector length differs from the registry size.
    pub fn set_all_values(&self, values: &[f64]) -> Result<()> {
        if values.len() != self.len() {
            return Err(RpbError::Configuration(format!(
                "value vector has {} entries, registry has {}",
                values.len(),
                self.len()
            )));
        }
        self.values.borrow_mut().copy_from_slice(values);
        Ok(())
    }

    /// Current fixed flag of every variable.
    pub fn fixed_flags(&self) -> Vec<bool> {
        self.info.borrow().iter().map(|v| v.fixed).collect()
    }

    /// Restores flags captured by [`fixed_flags`](Self::fixed_flags).
    pub fn restore_fixed_flags(&self, flags: &[bool]) {
        for (info, &fixed) in self.info.borrow_mut().iter_mut().zip(flags) {
            info.fixed = fixed;
        }
    }

    /// Every variable whose value lies more than `tolerance` outside its bounds.
    pub fn bound_violations(&self, tolerance: f64) -> Vec<BoundViolation> {
        let ids: Vec<VarId> = (0..self.len()).map(VarId).collect();
        self.violations_among(&ids, tolerance)
    }

    /// Bound violations restricted to `ids`.
    pub fn violations_among(&self, ids: &[VarId], tolerance: f64) -> Vec<BoundViolation> {
        let values = self.values.borrow();
        let info = self.info.borrow();
        ids.iter()
            .map(|id| (&info[id.0], values[id.0]))
            .filter(|(info, v)| {
                !v.is_finite()
                    || info.lower.is_some_and(|lb| *v < lb - tolerance)
                    || info.upper.is_some_and(|ub| *v > ub + tolerance)
            })
            .map(|(info, value)| BoundViolation {
                name: info.name.clone(),
                value,
                lower: info.lower,
                upper: info.upper,
            })
            .collect()
    }
}

impl Default for VariableRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Marker trait for variable roles.
///
/// - **Design**: inputs a designer chooses (geometry, feed conditions); fixed
///   unless an optimization frees them
/// - **State**: discretized field values determined by the balances
/// - **Derived**: performance outputs, each defined by one equation
pub trait VariableRole {
    const NAME: &'static str;
}

/// Design variables are fixed inputs by default.
#[derive(Debug, Clone, Copy)]
pub struct Design;
impl VariableRole for Design {
    const NAME: &'static str = "Design";
}

/// State variables are unknowns of the balance equations.
#[derive(Debug, Clone, Copy)]
pub struct State;
impl VariableRole for State {
    const NAME: &'static str = "State";
}

/// Derived variables report performance figures.
#[derive(Debug, Clone, Copy)]
pub struct Derived;
impl VariableRole for Derived {
    const NAME: &'static str = "Derived";
}

/// A typed handle to a registry variable.
///
/// # Examples
///
/// ```
/// use rpb_capture::{UnitTag, VariableRegistry};
///
/// let registry = VariableRegistry::new();
/// let p_out = registry.create_design("ads.P_out", 1.01325, UnitTag::Bar);
/// p_out.unfix();
/// p_out.set_bounds(Some(0.01), Some(10.0));
/// assert!(!p_out.is_fixed());
/// assert_eq!(registry.bounds(p_out.id()), (Some(0.01), Some(10.0)));
/// ```
#[derive(Debug, Clone)]
pub struct Var<R: VariableRole> {
    /// Index into the variable registry
    id: VarId,
    /// Reference to the shared registry
    registry: VariableRegistry,
    /// Phantom data to carry the role type
    _role: PhantomData<R>,
}

impl<R: VariableRole> Var<R> {
    fn from_id(id: VarId, registry: VariableRegistry) -> Self {
        Var { id, registry, _role: PhantomData }
    }

    /// Gets the variable's ID.
    pub fn id(&self) -> VarId {
        self.id
    }

    /// Gets the current value of the variable.
    pub fn get(&self) -> f64 {
        self.registry.get(self.id)
    }

    /// Sets the value of the variable.
    pub fn set(&self, value: f64) {
        self.registry.set(self.id, value)
    }

    pub fn name(&self) -> String {
        self.registry.name(self.id)
    }

    pub fn unit(&self) -> UnitTag {
        self.registry.unit(self.id)
    }

    pub fn is_fixed(&self) -> bool {
        self.registry.is_fixed(self.id)
    }

    /// Fixes the variable at its current value.
    pub fn fix(&self) {
        self.registry.fix(self.id)
    }

    /// Sets and fixes the variable.
    pub fn fix_value(&self, value: f64) {
        self.set(value);
        self.fix();
    }

    pub fn unfix(&self) {
        self.registry.unfix(self.id)
    }

    pub fn set_bounds(&self, lower: Option<f64>, upper: Option<f64>) {
        self.registry.set_bounds(self.id, lower, upper)
    }

    pub fn set_lower(&self, lower: f64) {
        let (_, upper) = self.registry.bounds(self.id);
        self.registry.set_bounds(self.id, Some(lower), upper)
    }

    pub fn set_upper(&self, upper: f64) {
        let (lower, _) = self.registry.bounds(self.id);
        self.registry.set_bounds(self.id, lower, Some(upper))
    }

    /// Attaches a description (returned in reports).
    pub fn with_doc(self, doc: &str) -> Self {
        self.registry.set_doc(self.id, doc);
        self
    }

    /// Gets a reference to the registry (for advanced use).
    pub fn registry(&self) -> &VariableRegistry {
        &self.registry
    }
}

impl Var<Design> {
    /// Fixes the variable at a dimensioned value.
    ///
    /// # Errors
    ///
    /// `UnitConsistency` when the quantity's dimension differs from the
    /// variable's unit.
    pub fn fix_at(&self, quantity: Quantity) -> Result<()> {
        let value = quantity.to_model(self.unit(), &self.name())?;
        self.fix_value(value);
        Ok(())
    }
}

/// Physical meaning of an equation; used for reporting and block statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BalanceKind {
    Mass,
    Energy,
    Momentum,
    /// Inlet and solid-entry conditions
    Boundary,
    /// Equalities between blocks (arcs, solid loop, shared quantities)
    Linking,
    /// Defining equation of a derived variable
    Definition,
}

/// Boxed residual over the ordered variables of one equation.
pub type ResidualFn = Box<dyn Fn(&[Dual64]) -> Dual64>;

/// One residual equation `f(vars) = 0`.
///
/// The closure sees the values of `vars` in order. Residuals reported to the
/// solver are multiplied by `scale`.
pub struct ResidualFunction {
    /// Name of the residual function
    pub name: String,
    /// Block the equation belongs to
    pub block: String,
    pub kind: BalanceKind,
    vars: Vec<VarId>,
    scale: f64,
    residual: ResidualFn,
}

impl ResidualFunction {
    /// Creates a new residual function.
    ///
    /// # Examples
    ///
    /// ```
    /// use num_dual::Dual64;
    /// use rpb_capture::{BalanceKind, ResidualFunction, VarId};
    ///
    /// let eq = ResidualFunction::new("ads.vol_solids_tot_eq", "ads", BalanceKind::Definition,
    ///     vec![VarId(0), VarId(1)],
    ///     |v: &[Dual64]| v[0] - v[1] * Dual64::from(0.32));
    /// assert_eq!(eq.evaluate(&[3.2, 10.0]), 0.0);
    /// ```
    pub fn new(
        name: &str,
        block: &str,
        kind: BalanceKind,
        vars: Vec<VarId>,
        residual: impl Fn(&[Dual64]) -> Dual64 + 'static,
    ) -> Self {
        ResidualFunction {
            name: name.to_string(),
            block: block.to_string(),
            kind,
            vars,
            scale: 1.0,
            residual: Box::new(residual),
        }
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Gets the name of this residual function.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vars(&self) -> &[VarId] {
        &self.vars
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub(crate) fn residual_fn(&self) -> &dyn Fn(&[Dual64]) -> Dual64 {
        &*self.residual
    }

    /// Unscaled residual given the full registry value vector.
    pub fn raw(&self, values: &[f64]) -> f64 {
        let args: Vec<Dual64> = self.vars.iter().map(|id| Dual64::from(values[id.0])).collect();
        (self.residual)(&args).re
    }

    /// Scaled residual given the full registry value vector.
    pub fn evaluate(&self, values: &[f64]) -> f64 {
        self.scale * self.raw(values)
    }
}

impl std::fmt::Debug for ResidualFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResidualFunction")
            .field("name", &self.name)
            .field("block", &self.block)
            .field("kind", &self.kind)
            .field("vars", &self.vars)
            .field("scale", &self.scale)
            .finish()
    }
}

/// A system of residual equations.
#[derive(Debug, Default)]
pub struct EquationSystem {
    equations: Vec<ResidualFunction>,
}

impl EquationSystem {
    /// Creates a new equation system.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, equation: ResidualFunction) {
        self.equations.push(equation);
    }

    /// Gets the total number of equations.
    pub fn total_equations(&self) -> usize {
        self.equations.len()
    }

    pub fn equations(&self) -> &[ResidualFunction] {
        &self.equations
    }

    /// Number of equations of one kind in one block.
    pub fn count(&self, block: &str, kind: BalanceKind) -> usize {
        self.equations.iter().filter(|e| e.block == block && e.kind == kind).count()
    }

    /// Indices of the equations belonging to any of `blocks`.
    pub fn rows_in_blocks(&self, blocks: &[&str]) -> Vec<usize> {
        self.equations
            .iter()
            .enumerate()
            .filter(|(_, e)| blocks.contains(&e.block.as_str()))
            .map(|(i, _)| i)
            .collect()
    }

    /// Distinct block names, in insertion order.
    pub fn blocks(&self) -> Vec<String> {
        let mut blocks: Vec<String> = Vec::new();
        for eq in &self.equations {
            if !blocks.contains(&eq.block) {
                blocks.push(eq.block.clone());
            }
        }
        blocks
    }

    /// Scaled residuals of every equation.
    pub fn evaluate_residuals(&self, values: &[f64]) -> Vec<f64> {
        self.equations.iter().map(|e| e.evaluate(values)).collect()
    }
}

/// A registry plus the equations written over it.
///
/// Unit models (sections, the composite bed, feed blocks) add their
/// variables and equations to one `Model`; solves run over all of it or
/// over selected blocks.
#[derive(Debug, Default)]
pub struct Model {
    registry: VariableRegistry,
    equations: EquationSystem,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &VariableRegistry {
        &self.registry
    }

    pub fn equations(&self) -> &EquationSystem {
        &self.equations
    }

    pub fn add_equation(&mut self, equation: ResidualFunction) {
        self.equations.add(equation);
    }

    /// True when a block of this name already owns variables or equations.
    pub fn has_block(&self, name: &str) -> bool {
        self.registry.has_prefix(name) || self.equations.equations.iter().any(|e| e.block == name)
    }

    /// Free variables referenced by `rows`, each counted once.
    fn free_referenced(&self, rows: &[usize]) -> Vec<VarId> {
        let mut seen = vec![false; self.registry.len()];
        let mut free = Vec::new();
        for &row in rows {
            for &id in self.equations.equations[row].vars() {
                if !seen[id.0] && !self.registry.is_fixed(id) {
                    seen[id.0] = true;
                    free.push(id);
                }
            }
        }
        free
    }

    /// Free referenced variables minus equations, over the whole model.
    pub fn degrees_of_freedom(&self) -> isize {
        let rows: Vec<usize> = (0..self.equations.total_equations()).collect();
        self.free_referenced(&rows).len() as isize - rows.len() as isize
    }

    /// Degrees of freedom of the equations of `blocks` alone.
    pub fn degrees_of_freedom_in(&self, blocks: &[&str]) -> isize {
        let rows = self.equations.rows_in_blocks(blocks);
        self.free_referenced(&rows).len() as isize - rows.len() as isize
    }

    /// Free variables no equation references.
    pub fn unreferenced_free_variables(&self) -> Vec<String> {
        let mut referenced = vec![false; self.registry.len()];
        for eq in self.equations.equations() {
            for &id in eq.vars() {
                referenced[id.0] = true;
            }
        }
        (0..self.registry.len())
            .map(VarId)
            .filter(|&id| !referenced[id.0] && !self.registry.is_fixed(id))
            .map(|id| self.registry.name(id))
            .collect()
    }

    /// Scaled residuals of every equation at the current values.
    pub fn residuals(&self) -> Vec<f64> {
        self.equations.evaluate_residuals(&self.registry.get_all_values())
    }

    /// L2 norm of the scaled residuals.
    pub fn residual_norm(&self) -> f64 {
        self.residuals().iter().map(|r| r * r).sum::<f64>().sqrt()
    }

    /// The `n` equations with the largest scaled residuals, largest first.
    pub fn largest_residuals(&self, n: usize) -> Vec<(String, f64)> {
        let values = self.registry.get_all_values();
        let mut all: Vec<(String, f64)> = self
            .equations
            .equations()
            .iter()
            .map(|e| (e.name.clone(), e.evaluate(&values)))
            .collect();
        all.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()));
        all.truncate(n);
        all
    }

    pub fn bound_violations(&self, tolerance: f64) -> Vec<BoundViolation> {
        self.registry.bound_violations(tolerance)
    }

    /// Solves every equation of the model.
    ///
    /// # Errors
    ///
    /// `Configuration` when the fixed/free split is not square or a free
    /// variable appears in no equation; `SolveFailed` when Newton stops
    /// without converging (values are left unchanged).
    pub fn solve(&self, solver: &NewtonRaphson) -> Result<SolverStats> {
        let orphans = self.unreferenced_free_variables();
        if !orphans.is_empty() {
            return Err(RpbError::Configuration(format!(
                "free variables appear in no equation: {}",
                orphans.join(", ")
            )));
        }
        let rows: Vec<usize> = (0..self.equations.total_equations()).collect();
        let stats = self.try_solve_rows(rows, solver).map_err(|e| self.solve_error(e))?;
        info!(
            "model solved: {} equations, {} iterations, |F| = {:.3e}",
            self.equations.total_equations(),
            stats.iterations,
            stats.final_residual
        );
        Ok(stats)
    }

    /// Solves only the equations of `blocks`; variables of other blocks they
    /// reference are treated as unknowns only if free.
    pub fn solve_blocks(&self, blocks: &[&str], solver: &NewtonRaphson) -> Result<SolverStats> {
        let stats = self.try_solve_blocks(blocks, solver).map_err(|e| self.solve_error(e))?;
        info!(
            "blocks {:?} solved in {} iterations, |F| = {:.3e}",
            blocks, stats.iterations, stats.final_residual
        );
        Ok(stats)
    }

    /// Like [`solve_blocks`](Self::solve_blocks) but returns the raw Newton error.
    pub fn try_solve_blocks(
        &self,
        blocks: &[&str],
        solver: &NewtonRaphson,
    ) -> SolverResult<SolverStats> {
        self.try_solve_rows(self.equations.rows_in_blocks(blocks), solver)
    }

    fn try_solve_rows(&self, rows: Vec<usize>, solver: &NewtonRaphson) -> SolverResult<SolverStats> {
        let problem = ModelProblem::new(self, rows)?;
        let (x, stats) = solver.solve_system(&problem, &problem.initial_point())?;
        problem.write_back(&x);
        Ok(stats)
    }

    fn solve_error(&self, err: SolverError) -> RpbError {
        match err {
            SolverError::NotSquare { equations, unknowns } => RpbError::Configuration(format!(
                "{equations} equations but {unknowns} free variables \
                 ({} degrees of freedom)",
                unknowns as isize - equations as isize
            )),
            SolverError::NoVariablesToSolve => {
                RpbError::Configuration("no free variables to solve for".into())
            }
            other => {
                warn!("solve failed: {other}");
                RpbError::from_solver(&other)
            }
        }
    }
}

/// Gas state at a section boundary: flow, composition, temperature, pressure.
#[derive(Debug, Clone, PartialEq)]
pub struct GasPort {
    pub name: String,
    pub components: Vec<String>,
    /// mol/s
    pub flow: VarId,
    pub mole_fractions: Vec<VarId>,
    /// K
    pub temperature: VarId,
    /// bar
    pub pressure: VarId,
}

/// Values read from a [`GasPort`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamValues {
    pub flow: f64,
    pub mole_fractions: Vec<(String, f64)>,
    pub temperature: f64,
    pub pressure: f64,
}

impl GasPort {
    /// Creates a fixed feed block with its own port.
    ///
    /// # Errors
    ///
    /// `Configuration` when the block name is taken, the composition length
    /// differs from the component list, or the fractions do not sum to one.
    pub fn feed(
        model: &mut Model,
        name: &str,
        components: &[String],
        flow: f64,
        mole_fractions: &[f64],
        temperature: f64,
        pressure: f64,
    ) -> Result<GasPort> {
        if model.has_block(name) {
            return Err(RpbError::Configuration(format!("block {name} already exists")));
        }
        if components.len() != mole_fractions.len() {
            return Err(RpbError::Configuration(format!(
                "{} components but {} mole fractions",
                components.len(),
                mole_fractions.len()
            )));
        }
        let total: f64 = mole_fractions.iter().sum();
        if (total - 1.0).abs() > 1e-6 {
            return Err(RpbError::Configuration(format!("mole fractions sum to {total}, not 1")));
        }

        let registry = model.registry();
        let flow = registry.create_design(&format!("{name}.F"), flow, UnitTag::MolPerSecond);
        let fractions = components
            .iter()
            .zip(mole_fractions)
            .map(|(c, &y)| {
                registry.create_design(&format!("{name}.y[{c}]"), y, UnitTag::Dimensionless).id()
            })
            .collect();
        let temperature = registry.create_design(&format!("{name}.T"), temperature, UnitTag::Kelvin);
        let pressure = registry.create_design(&format!("{name}.P"), pressure, UnitTag::Bar);

        Ok(GasPort {
            name: format!("{name}.outlet"),
            components: components.to_vec(),
            flow: flow.id(),
            mole_fractions: fractions,
            temperature: temperature.id(),
            pressure: pressure.id(),
        })
    }

    /// All port variables: flow, fractions, temperature, pressure.
    pub fn vars(&self) -> Vec<VarId> {
        let mut vars = vec![self.flow];
        vars.extend(&self.mole_fractions);
        vars.push(self.temperature);
        vars.push(self.pressure);
        vars
    }

    pub fn read(&self, registry: &VariableRegistry) -> StreamValues {
        StreamValues {
            flow: registry.get(self.flow),
            mole_fractions: self
                .components
                .iter()
                .cloned()
                .zip(self.mole_fractions.iter().map(|&id| registry.get(id)))
                .collect(),
            temperature: registry.get(self.temperature),
            pressure: registry.get(self.pressure),
        }
    }
}

/// Unit models with gas ports.
pub trait HasPorts {
    /// Returns all input ports for this unit.
    fn input_ports(&self) -> Vec<GasPort>;

    /// Returns all output ports for this unit.
    fn output_ports(&self) -> Vec<GasPort>;

    /// Gets a specific input port by name.
    fn get_input_port(&self, name: &str) -> Option<GasPort> {
        self.input_ports().into_iter().find(|p| p.name == name)
    }

    /// Gets a specific output port by name.
    fn get_output_port(&self, name: &str) -> Option<GasPort> {
        self.output_ports().into_iter().find(|p| p.name == name)
    }

    /// Gets the total number of ports.
    fn port_count(&self) -> (usize, usize) {
        (self.input_ports().len(), self.output_ports().len())
    }
}

/// An equality arc between two ports.
#[derive(Debug, Clone, PartialEq)]
pub struct Arc {
    pub name: String,
    pub source: GasPort,
    pub destination: GasPort,
}

impl Arc {
    /// Copies source values onto the destination port.
    pub fn propagate(&self, registry: &VariableRegistry) {
        for (from, to) in self.source.vars().into_iter().zip(self.destination.vars()) {
            registry.set(to, registry.get(from));
        }
    }
}

/// Connects `source` to `destination` with one linking equation per port
/// variable. The destination variables are unfixed: the arc now determines
/// them.
///
/// # Errors
///
/// `Configuration` when the component lists differ; `UnitConsistency` when a
/// pair of variables carries different units.
pub fn connect(
    model: &mut Model,
    name: &str,
    source: &GasPort,
    destination: &GasPort,
) -> Result<Arc> {
    if source.components != destination.components {
        return Err(RpbError::Configuration(format!(
            "arc {name}: components {:?} do not match {:?}",
            source.components, destination.components
        )));
    }
    for (from, to) in source.vars().into_iter().zip(destination.vars()) {
        let label = format!("{}={}", model.registry().name(to), model.registry().name(from));
        link_variables(model, name, &label, from, to)?;
        model.registry().unfix(to);
    }
    Ok(Arc { name: name.to_string(), source: source.clone(), destination: destination.clone() })
}

/// Adds `target - source = 0` to `block` after checking both units agree.
pub fn link_variables(
    model: &mut Model,
    block: &str,
    label: &str,
    source: VarId,
    target: VarId,
) -> Result<()> {
    let registry = model.registry();
    units::check_same_unit(label, registry.unit(target), registry.unit(source))?;
    let scale = 1.0 / registry.get(source).abs().max(1.0);
    model.add_equation(
        ResidualFunction::new(
            &format!("{block}.{label}"),
            block,
            BalanceKind::Linking,
            vec![target, source],
            |v: &[Dual64]| v[0] - v[1],
        )
        .with_scale(scale),
    );
    Ok(())
}

/// CO2 accounting of a converged unit, mol/s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MassBalanceSummary {
    pub name: String,
    pub inflow: f64,
    pub outflow: f64,
    /// Net transfer to the solid
    pub uptake: f64,
}

impl MassBalanceSummary {
    pub fn residual(&self) -> f64 {
        self.inflow - self.outflow - self.uptake
    }

    /// Residual relative to the larger of inflow and outflow.
    pub fn relative_residual(&self) -> f64 {
        self.residual() / self.inflow.abs().max(self.outflow.abs()).max(1e-12)
    }
}

/// Energy accounting of a converged unit, W.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyBalanceSummary {
    pub name: String,
    /// Sensible heat picked up by the gas
    pub gas_sensible: f64,
    /// Sensible heat picked up by the solid
    pub solid_sensible: f64,
    /// Heat delivered by the heat-exchange fluid
    pub exchanger_duty: f64,
    /// Heat released by adsorption (negative when desorbing)
    pub adsorption_heat: f64,
}

impl EnergyBalanceSummary {
    pub fn residual(&self) -> f64 {
        self.gas_sensible + self.solid_sensible - self.exchanger_duty - self.adsorption_heat
    }

    pub fn relative_residual(&self) -> f64 {
        let scale = (self.gas_sensible.abs() + self.solid_sensible.abs())
            .max(self.exchanger_duty.abs() + self.adsorption_heat.abs())
            .max(1e-12);
        self.residual() / scale
    }
}

/// Units that can report a CO2 balance.
pub trait ConservesMass {
    fn mass_balance(&self) -> MassBalanceSummary;
}

/// Units that can report an energy balance.
pub trait ConservesEnergy {
    fn energy_balance(&self) -> EnergyBalanceSummary;
}

/// Helper function to validate a unit satisfies mass conservation at runtime.
pub fn validate_mass_conservation<U: ConservesMass>(
    unit: &U,
    tolerance: f64,
) -> std::result::Result<(), String> {
    let balance = unit.mass_balance();
    if balance.relative_residual().abs() <= tolerance {
        Ok(())
    } else {
        Err(format!(
            "Mass balance '{}' not satisfied: relative residual = {:.3e} (tolerance: {})",
            balance.name,
            balance.relative_residual(),
            tolerance
        ))
    }
}

/// Helper function to validate a unit satisfies energy conservation at runtime.
pub fn validate_energy_conservation<U: ConservesEnergy>(
    unit: &U,
    tolerance: f64,
) -> std::result::Result<(), String> {
    let balance = unit.energy_balance();
    if balance.relative_residual().abs() <= tolerance {
        Ok(())
    } else {
        Err(format!(
            "Energy balance '{}' not satisfied: relative residual = {:.3e} (tolerance: {})",
            balance.name,
            balance.relative_residual(),
            tolerance
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solvers::NewtonRaphson;
    use uom::si::f64::ThermodynamicTemperature;
    use uom::si::thermodynamic_temperature::kelvin;

    /// x + y = 3, x - y = 1
    fn linear_model() -> (Model, Var<State>, Var<State>) {
        let mut model = Model::new();
        let x = model.registry().create_state("blk.x", 0.0, UnitTag::Dimensionless);
        let y = model.registry().create_state("blk.y", 0.0, UnitTag::Dimensionless);
        model.add_equation(ResidualFunction::new(
            "blk.sum",
            "blk",
            BalanceKind::Definition,
            vec![x.id(), y.id()],
            |v: &[Dual64]| v[0] + v[1] - Dual64::from(3.0),
        ));
        model.add_equation(ResidualFunction::new(
            "blk.diff",
            "blk",
            BalanceKind::Definition,
            vec![x.id(), y.id()],
            |v: &[Dual64]| v[0] - v[1] - Dual64::from(1.0),
        ));
        (model, x, y)
    }

    #[test]
    fn test_var_ids_are_dense_indices() {
        let registry = VariableRegistry::new();
        let a = registry.create_state("ads.y[0,0]", 0.1, UnitTag::Dimensionless);
        let b = registry.create_state("ads.y[0,1]", 0.1, UnitTag::Dimensionless);
        assert_eq!(a.id().index(), 0);
        assert_eq!(b.id(), VarId(1));
        assert_eq!(registry.find("ads.y[0,1]"), Some(b.id()));
    }

    #[test]
    fn test_registry_shared_state() {
        let registry = VariableRegistry::new();
        let t = registry.create_state("ads.Tg[0,0]", 298.15, UnitTag::Kelvin);
        let clone = t.clone();
        clone.set(310.0);
        assert_eq!(t.get(), 310.0);
        assert_eq!(registry.get_role(t.id()), "State");
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());
    }

    #[test]
    fn test_design_variables_start_fixed() {
        let registry = VariableRegistry::new();
        let l = registry.create_design("ads.L", 8.0, UnitTag::Meter).with_doc("Bed length");
        assert!(l.is_fixed());
        assert_eq!(registry.doc(l.id()), "Bed length");
        l.unfix();
        assert!(!l.is_fixed());
    }

    #[test]
    fn test_fix_at_checks_units() {
        let registry = VariableRegistry::new();
        let p = registry.create_design("ads.P_in", 1.5, UnitTag::Bar);
        let t = Quantity::Temperature(ThermodynamicTemperature::new::<kelvin>(300.0));
        assert!(matches!(p.fix_at(t), Err(RpbError::UnitConsistency { .. })));
        assert_eq!(p.get(), 1.5);
    }

    #[test]
    fn test_fixed_flags_roundtrip() {
        let registry = VariableRegistry::new();
        let a = registry.create_design("a", 1.0, UnitTag::Dimensionless);
        let b = registry.create_state("b", 1.0, UnitTag::Dimensionless);
        let flags = registry.fixed_flags();
        a.unfix();
        b.fix();
        registry.restore_fixed_flags(&flags);
        assert!(a.is_fixed());
        assert!(!b.is_fixed());
    }

    #[test]
    fn test_set_all_values_length_checked() {
        let registry = VariableRegistry::new();
        registry.create_state("a", 1.0, UnitTag::Dimensionless);
        assert!(registry.set_all_values(&[1.0, 2.0]).is_err());
        registry.set_all_values(&[4.0]).unwrap();
        assert_eq!(registry.get(VarId(0)), 4.0);
    }

    #[test]
    fn test_bound_violations() {
        let registry = VariableRegistry::new();
        let v = registry.create_state("ads.vel[0,0]", 16.0, UnitTag::MeterPerSecond);
        v.set_bounds(Some(0.0), Some(15.0));
        let violations = registry.bound_violations(1e-9);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].name, "ads.vel[0,0]");
        v.set(14.0);
        assert!(registry.bound_violations(1e-9).is_empty());
    }

    #[test]
    fn test_degrees_of_freedom_and_solve() {
        let (model, x, y) = linear_model();
        assert_eq!(model.degrees_of_freedom(), 0);
        let stats = model.solve(&NewtonRaphson::new(1e-10, 20)).unwrap();
        assert!((x.get() - 2.0).abs() < 1e-10);
        assert!((y.get() - 1.0).abs() < 1e-10);
        assert!(stats.iterations <= 2);

        // A second solve starts converged
        let again = model.solve(&NewtonRaphson::new(1e-10, 20)).unwrap();
        assert_eq!(again.iterations, 0);
    }

    #[test]
    fn test_fixing_a_variable_breaks_squareness() {
        let (model, x, _) = linear_model();
        x.fix();
        assert_eq!(model.degrees_of_freedom(), -1);
        assert!(matches!(
            model.solve(&NewtonRaphson::default()),
            Err(RpbError::Configuration(_))
        ));
    }

    #[test]
    fn test_orphan_free_variable_rejected() {
        let (model, _, _) = linear_model();
        model.registry().create_state("blk.z", 0.0, UnitTag::Dimensionless);
        assert_eq!(model.unreferenced_free_variables(), vec!["blk.z".to_string()]);
        assert!(matches!(
            model.solve(&NewtonRaphson::default()),
            Err(RpbError::Configuration(_))
        ));
    }

    #[test]
    fn test_solve_blocks_only_touches_selected_rows() {
        let (mut model, x, _) = linear_model();
        let w = model.registry().create_state("other.w", 0.0, UnitTag::Dimensionless);
        let xid = x.id();
        model.add_equation(ResidualFunction::new(
            "other.w_eq",
            "other",
            BalanceKind::Definition,
            vec![w.id(), xid],
            |v: &[Dual64]| v[0] - v[1] * Dual64::from(10.0),
        ));
        assert_eq!(model.degrees_of_freedom_in(&["blk"]), 0);
        model.solve_blocks(&["blk"], &NewtonRaphson::default()).unwrap();
        assert_eq!(w.get(), 0.0);
        model.solve(&NewtonRaphson::default()).unwrap();
        assert!((w.get() - 20.0).abs() < 1e-8);
        assert_eq!(model.equations().blocks(), vec!["blk".to_string(), "other".to_string()]);
    }

    #[test]
    fn test_failed_solve_reports_status() {
        let mut model = Model::new();
        let x = model.registry().create_state("blk.x", 1.0, UnitTag::Dimensionless);
        // x^2 + 1 = 0 has no real root
        model.add_equation(ResidualFunction::new(
            "blk.none",
            "blk",
            BalanceKind::Definition,
            vec![x.id()],
            |v: &[Dual64]| v[0] * v[0] + Dual64::from(1.0),
        ));
        let err = model.solve(&NewtonRaphson::new(1e-10, 30)).unwrap_err();
        assert!(matches!(err, RpbError::SolveFailed { .. }));
        assert_eq!(x.get(), 1.0);
    }

    #[test]
    fn test_feed_and_connect() {
        let mut model = Model::new();
        let components = vec!["CO2".to_string(), "N2".to_string()];
        let feed = GasPort::feed(&mut model, "feed", &components, 10.0, &[0.1, 0.9], 300.0, 1.2)
            .unwrap();
        let sink = GasPort::feed(&mut model, "sink", &components, 0.0, &[0.5, 0.5], 0.0, 0.0)
            .unwrap();
        let arc = connect(&mut model, "feed_to_sink", &feed, &sink).unwrap();
        assert_eq!(model.degrees_of_freedom(), 0);
        assert_eq!(model.equations().count("feed_to_sink", BalanceKind::Linking), 5);

        arc.propagate(model.registry());
        assert!(model.residual_norm() < 1e-12);
        let values = sink.read(model.registry());
        assert_eq!(values.flow, 10.0);
        assert_eq!(values.mole_fractions[0], ("CO2".to_string(), 0.1));
    }

    #[test]
    fn test_connect_rejects_component_mismatch() {
        let mut model = Model::new();
        let a = GasPort::feed(&mut model, "a", &["CO2".into(), "N2".into()], 1.0, &[0.1, 0.9], 300.0, 1.0)
            .unwrap();
        let b = GasPort::feed(&mut model, "b", &["CO2".into(), "H2O".into()], 1.0, &[0.1, 0.9], 300.0, 1.0)
            .unwrap();
        assert!(matches!(connect(&mut model, "ab", &a, &b), Err(RpbError::Configuration(_))));
    }

    #[test]
    fn test_link_variables_checks_units() {
        let mut model = Model::new();
        let t = model.registry().create_state("a.T", 300.0, UnitTag::Kelvin);
        let p = model.registry().create_state("b.P", 1.0, UnitTag::Bar);
        let err = link_variables(&mut model, "link", "T=P", p.id(), t.id()).unwrap_err();
        assert!(matches!(err, RpbError::UnitConsistency { .. }));
    }

    #[test]
    fn test_feed_rejects_bad_composition() {
        let mut model = Model::new();
        let comps = vec!["CO2".to_string(), "N2".to_string()];
        assert!(GasPort::feed(&mut model, "f", &comps, 1.0, &[0.5, 0.6], 300.0, 1.0).is_err());
        assert!(GasPort::feed(&mut model, "g", &comps, 1.0, &[1.0], 300.0, 1.0).is_err());
    }

    struct Leaky;

    impl ConservesMass for Leaky {
        fn mass_balance(&self) -> MassBalanceSummary {
            MassBalanceSummary { name: "leaky".into(), inflow: 10.0, outflow: 8.0, uptake: 1.0 }
        }
    }

    #[test]
    fn test_validate_mass_conservation() {
        let err = validate_mass_conservation(&Leaky, 1e-6).unwrap_err();
        assert!(err.contains("leaky"));
        assert!((Leaky.mass_balance().relative_residual() - 0.1).abs() < 1e-12);
    }
}
