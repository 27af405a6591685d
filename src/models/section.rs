//! One adsorption or desorption zone of the rotary packed bed.
//!
//! The zone is discretized on a `(z, o)` grid: `z` is the normalized axial
//! position along the gas path and `o` the normalized angular position the
//! solid has travelled since entering the zone. The gas is quasi-steady
//! along `z` at every `o`; the solid marches along `o` over its residence
//! time `tau = theta * 60 / w_rpm`.
//!
//! Both coordinates use implicit upwind differences: along the gas flow
//! direction for the gas balances and along `+o` for the solid balances.
//! Feed, product and duty integrals use the same cells, so the discrete CO2
//! and energy balances close exactly at any converged point.
//!
//! Unknowns at each node: CO2 mole fraction `y`, gas temperature `Tg`, solid
//! temperature `Ts`, loading `q` (mol/kg), pressure `P` (bar), superficial
//! velocity `vel` (m/s) and pressure gradient `dPdz` (bar/m).

use std::f64::consts::PI;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use log::{debug, info, warn};
use num_dual::{Dual64, DualNum};
use serde::{Deserialize, Serialize};

use super::properties::{
    molar_mass, BedProperties, Ergun, GasProperties, Isotherm, LdfKinetics, MassTransfer,
    PressureDrop, TothIsotherm, R_BAR,
};
use crate::error::{Result, RpbError};
use crate::grid::Grid;
use crate::solvers::continuation::{Continuation, ContinuationProblem, ContinuationReport};
use crate::solvers::{DualSystem, NewtonRaphson, SolverResult, SolverStats};
use crate::units::{pascal_to_bar, UnitTag};
use crate::{
    BalanceKind, BoundViolation, ConservesEnergy, ConservesMass, Design, Derived,
    EnergyBalanceSummary, GasPort, HasPorts, MassBalanceSummary, Model, ResidualFunction, Var,
    VarId, VariableRegistry,
};

/// Upper bound on the total gas concentration, mol/m3.
pub const MAX_CONCENTRATION: f64 = 250.0;

/// Operating mode of a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Mode {
    Adsorption,
    Desorption,
}

impl Mode {
    /// Admissible heat-exchange fluid temperatures, K.
    pub fn exchanger_temperature_bounds(&self) -> (f64, f64) {
        match self {
            Mode::Adsorption => (298.0, 368.0),
            Mode::Desorption => (373.0, 433.0),
        }
    }
}

impl FromStr for Mode {
    type Err = RpbError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "adsorption" => Ok(Mode::Adsorption),
            "desorption" => Ok(Mode::Desorption),
            other => Err(RpbError::Configuration(format!(
                "invalid mode '{other}', expected 'adsorption' or 'desorption'"
            ))),
        }
    }
}

impl TryFrom<String> for Mode {
    type Error = RpbError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Mode> for String {
    fn from(mode: Mode) -> Self {
        mode.to_string()
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Adsorption => write!(f, "adsorption"),
            Mode::Desorption => write!(f, "desorption"),
        }
    }
}

/// Gas flow direction along `z`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum FlowDirection {
    /// Gas enters at `z = 0`
    Forward,
    /// Gas enters at `z = 1`
    Reverse,
}

impl FlowDirection {
    pub fn sign(&self) -> f64 {
        match self {
            FlowDirection::Forward => 1.0,
            FlowDirection::Reverse => -1.0,
        }
    }
}

impl TryFrom<i32> for FlowDirection {
    type Error = RpbError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            1 => Ok(FlowDirection::Forward),
            -1 => Ok(FlowDirection::Reverse),
            other => Err(RpbError::Configuration(format!(
                "invalid gas flow direction {other}, expected 1 or -1"
            ))),
        }
    }
}

impl From<FlowDirection> for i32 {
    fn from(direction: FlowDirection) -> Self {
        match direction {
            FlowDirection::Forward => 1,
            FlowDirection::Reverse => -1,
        }
    }
}

/// Construction parameters of a section.
///
/// Operating inputs are in SI units (Pa, K, mol/s, m); they are converted to
/// model units when the section is built.
///
/// # Examples
///
/// ```
/// use rpb_capture::{FlowDirection, Mode, SectionConfig};
///
/// let config = SectionConfig::from_json_str(
///     r#"{"mode": "desorption", "gas_flow_direction": -1, "nfe_z": 4}"#,
/// ).unwrap();
/// assert_eq!(config.mode, Mode::Desorption);
/// assert_eq!(config.gas_flow_direction, FlowDirection::Reverse);
///
/// assert!(SectionConfig::from_json_str(r#"{"gas_flow_direction": 2}"#).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SectionConfig {
    pub mode: Mode,
    pub gas_flow_direction: FlowDirection,
    pub has_pressure_drop: bool,
    pub nfe_z: usize,
    pub nfe_o: usize,
    /// Explicit interior axial breakpoints
    pub z_points: Vec<f64>,
    /// Explicit interior rotational breakpoints
    pub o_points: Vec<f64>,
    pub components: Vec<String>,
    pub inlet_mole_fractions: Vec<f64>,
    /// mol/s
    pub feed_flow: f64,
    /// Pa
    pub inlet_pressure: f64,
    /// Pa
    pub outlet_pressure: f64,
    /// K
    pub inlet_temperature: f64,
    /// Heat-exchange fluid temperature, K
    pub exchanger_temperature: f64,
    /// m
    pub length: f64,
    /// m
    pub diameter: f64,
    /// Fraction of a full rotation occupied by the section
    pub theta: f64,
    /// rev/min
    pub w_rpm: f64,
    /// Loading of the entering solid, mol/kg
    pub solid_inlet_loading: f64,
    /// Temperature of the entering solid, K
    pub solid_inlet_temperature: f64,
    pub bed: BedProperties,
    pub gas: GasProperties,
    pub isotherm: TothIsotherm,
    pub kinetics: LdfKinetics,
}

impl Default for SectionConfig {
    fn default() -> Self {
        Self::adsorption()
    }
}

impl SectionConfig {
    /// Flue-gas adsorption at 1.5 bar, cooled to 298 K.
    pub fn adsorption() -> Self {
        SectionConfig {
            mode: Mode::Adsorption,
            gas_flow_direction: FlowDirection::Forward,
            has_pressure_drop: true,
            nfe_z: 10,
            nfe_o: 10,
            z_points: Vec::new(),
            o_points: Vec::new(),
            components: vec!["H2O".into(), "CO2".into(), "N2".into()],
            inlet_mole_fractions: vec![0.0022, 0.09, 0.9078],
            feed_flow: 100.0,
            inlet_pressure: 1.5e5,
            outlet_pressure: 1.01325e5,
            inlet_temperature: 363.0,
            exchanger_temperature: 298.0,
            length: 8.0,
            diameter: 2.0,
            theta: 0.5,
            w_rpm: 0.002,
            solid_inlet_loading: 0.1,
            solid_inlet_temperature: 373.0,
            bed: BedProperties::default(),
            gas: GasProperties::default(),
            isotherm: TothIsotherm::default(),
            kinetics: LdfKinetics::default(),
        }
    }

    /// Steam-swept regeneration heated to 433 K, gas counter-current.
    pub fn desorption() -> Self {
        SectionConfig {
            mode: Mode::Desorption,
            gas_flow_direction: FlowDirection::Reverse,
            inlet_mole_fractions: vec![0.99899, 1e-5, 1e-3],
            feed_flow: 30.0,
            inlet_pressure: 1.015e5,
            outlet_pressure: 1.01325e5,
            inlet_temperature: 393.0,
            exchanger_temperature: 433.0,
            solid_inlet_loading: 1.0,
            solid_inlet_temperature: 330.0,
            ..Self::adsorption()
        }
    }

    /// Parses and validates a JSON configuration; missing fields take the
    /// adsorption defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SectionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_discretization(mut self, nfe_z: usize, nfe_o: usize) -> Self {
        self.nfe_z = nfe_z;
        self.nfe_o = nfe_o;
        self
    }

    pub fn with_grid_points(mut self, z_points: Vec<f64>, o_points: Vec<f64>) -> Self {
        self.z_points = z_points;
        self.o_points = o_points;
        self
    }

    pub fn with_pressure_drop(mut self, has_pressure_drop: bool) -> Self {
        self.has_pressure_drop = has_pressure_drop;
        self
    }

    pub fn with_flow_direction(mut self, direction: FlowDirection) -> Self {
        self.gas_flow_direction = direction;
        self
    }

    pub fn with_feed(mut self, flow: f64, mole_fractions: Vec<f64>) -> Self {
        self.feed_flow = flow;
        self.inlet_mole_fractions = mole_fractions;
        self
    }

    /// Inlet and outlet pressure in Pa.
    pub fn with_pressures(mut self, inlet: f64, outlet: f64) -> Self {
        self.inlet_pressure = inlet;
        self.outlet_pressure = outlet;
        self
    }

    pub fn with_inlet_temperature(mut self, temperature: f64) -> Self {
        self.inlet_temperature = temperature;
        self
    }

    pub fn with_exchanger_temperature(mut self, temperature: f64) -> Self {
        self.exchanger_temperature = temperature;
        self
    }

    pub fn with_geometry(mut self, length: f64, diameter: f64) -> Self {
        self.length = length;
        self.diameter = diameter;
        self
    }

    pub fn with_theta(mut self, theta: f64) -> Self {
        self.theta = theta;
        self
    }

    pub fn with_rotational_speed(mut self, w_rpm: f64) -> Self {
        self.w_rpm = w_rpm;
        self
    }

    pub fn with_solid_inlet(mut self, loading: f64, temperature: f64) -> Self {
        self.solid_inlet_loading = loading;
        self.solid_inlet_temperature = temperature;
        self
    }

    fn co2_index(&self) -> Result<usize> {
        self.components.iter().position(|c| c == "CO2").ok_or_else(|| {
            RpbError::Configuration("component list must contain CO2".into())
        })
    }

    /// Checks the configuration before any variable is created.
    ///
    /// # Errors
    ///
    /// `Configuration` for inconsistent compositions, unknown components or
    /// non-physical operating values; `InvalidGrid` for malformed
    /// discretization input.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(RpbError::Configuration(msg));
        Grid::new(self.nfe_z, &self.z_points)?;
        Grid::new(self.nfe_o, &self.o_points)?;
        let co2 = self.co2_index()?;
        if self.components.len() != self.inlet_mole_fractions.len() {
            return fail(format!(
                "{} components but {} inlet mole fractions",
                self.components.len(),
                self.inlet_mole_fractions.len()
            ));
        }
        if let Some(c) = self.components.iter().find(|c| molar_mass(c).is_none()) {
            return fail(format!("no molar mass known for component {c}"));
        }
        if self.inlet_mole_fractions.iter().any(|y| !(0.0..=1.0).contains(y)) {
            return fail("inlet mole fractions must lie in [0, 1]".into());
        }
        let total: f64 = self.inlet_mole_fractions.iter().sum();
        if (total - 1.0).abs() > 1e-6 {
            return fail(format!("inlet mole fractions sum to {total}, not 1"));
        }
        if self.inlet_mole_fractions[co2] <= 0.0 || self.inlet_mole_fractions[co2] >= 1.0 {
            return fail("inlet CO2 fraction must lie strictly between 0 and 1".into());
        }
        let positive = [
            ("feed_flow", self.feed_flow),
            ("inlet_pressure", self.inlet_pressure),
            ("outlet_pressure", self.outlet_pressure),
            ("inlet_temperature", self.inlet_temperature),
            ("exchanger_temperature", self.exchanger_temperature),
            ("length", self.length),
            ("diameter", self.diameter),
            ("w_rpm", self.w_rpm),
            ("solid_inlet_temperature", self.solid_inlet_temperature),
            ("particle_diameter", self.bed.particle_diameter),
            ("solid_density", self.bed.solid_density),
            ("gas heat_capacity", self.gas.heat_capacity),
        ];
        if let Some((name, value)) = positive.iter().find(|(_, v)| !(v.is_finite() && *v > 0.0)) {
            return fail(format!("{name} must be positive, got {value}"));
        }
        if !(self.theta > 0.0 && self.theta < 1.0) {
            return fail(format!("theta must lie in (0, 1), got {}", self.theta));
        }
        if !(self.bed.voidage > 0.0 && self.bed.voidage < 1.0) {
            return fail(format!("bed voidage must lie in (0, 1), got {}", self.bed.voidage));
        }
        if self.solid_inlet_loading < 0.0 {
            return fail("solid inlet loading must be non-negative".into());
        }
        Ok(())
    }
}

/// Isotherm, kinetics and pressure-drop correlations used by a section.
#[derive(Debug, Clone)]
pub struct Correlations {
    pub isotherm: Rc<dyn Isotherm>,
    pub mass_transfer: Rc<dyn MassTransfer>,
    pub pressure_drop: Rc<dyn PressureDrop>,
}

impl Correlations {
    /// Toth, LDF and Ergun with the parameters of `config`.
    pub fn from_config(config: &SectionConfig) -> Self {
        Correlations {
            isotherm: Rc::new(config.isotherm.clone()),
            mass_transfer: Rc::new(config.kinetics.clone()),
            pressure_drop: Rc::new(Ergun::from_properties(&config.bed, &config.gas)),
        }
    }
}

/// Geometry variables a section reads but may not own.
#[derive(Debug, Clone)]
pub struct SharedGeometry {
    pub length: Var<Design>,
    pub diameter: Var<Design>,
    pub w_rpm: Var<Design>,
}

impl SharedGeometry {
    /// Creates `{block}.L`, `{block}.D` and `{block}.w_rpm`, fixed.
    pub fn create(
        registry: &VariableRegistry,
        block: &str,
        length: f64,
        diameter: f64,
        w_rpm: f64,
    ) -> Self {
        let length = registry
            .create_design(&format!("{block}.L"), length, UnitTag::Meter)
            .with_doc("Bed length");
        length.set_bounds(Some(0.1), Some(40.0));
        let diameter = registry
            .create_design(&format!("{block}.D"), diameter, UnitTag::Meter)
            .with_doc("Rotor diameter");
        diameter.set_bounds(Some(0.1), Some(20.0));
        let w_rpm = registry
            .create_design(&format!("{block}.w_rpm"), w_rpm, UnitTag::RevolutionsPerMinute)
            .with_doc("Rotational speed");
        w_rpm.set_bounds(Some(1e-5), Some(2.0));
        SharedGeometry { length, diameter, w_rpm }
    }
}

/// A state field indexed by `(z, o)` node.
#[derive(Debug, Clone)]
pub struct Field {
    symbol: String,
    ids: Vec<VarId>,
    no: usize,
    registry: VariableRegistry,
}

impl Field {
    #[allow(clippy::too_many_arguments)]
    fn new(
        registry: &VariableRegistry,
        block: &str,
        symbol: &str,
        unit: UnitTag,
        (nz, no): (usize, usize),
        value: f64,
        (lower, upper): (Option<f64>, Option<f64>),
    ) -> Self {
        let mut ids = Vec::with_capacity(nz * no);
        for i in 0..nz {
            for k in 0..no {
                let var = registry.create_state(&format!("{block}.{symbol}[{i},{k}]"), value, unit);
                var.set_bounds(lower, upper);
                ids.push(var.id());
            }
        }
        Field { symbol: symbol.to_string(), ids, no, registry: registry.clone() }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn id(&self, i: usize, k: usize) -> VarId {
        self.ids[i * self.no + k]
    }

    pub fn get(&self, i: usize, k: usize) -> f64 {
        self.registry.get(self.id(i, k))
    }

    pub fn set(&self, i: usize, k: usize, value: f64) {
        self.registry.set(self.id(i, k), value)
    }

    pub fn fill(&self, value: f64) {
        for &id in &self.ids {
            self.registry.set(id, value);
        }
    }

    pub fn ids(&self) -> &[VarId] {
        &self.ids
    }
}

/// Gas molar flux, mol/(m2 s), from velocity (m/s), pressure (bar) and temperature (K).
fn molar_flux<D: DualNum<f64> + Copy>(vel: D, p: D, tg: D) -> D {
    vel * p / (tg * R_BAR)
}

/// Face area of a section, m2.
fn face_area<D: DualNum<f64> + Copy>(theta: D, diameter: D) -> D {
    theta * diameter * diameter * (PI / 4.0)
}

/// Time the solid spends in the section, s.
fn residence_time<D: DualNum<f64> + Copy>(theta: D, w_rpm: D) -> D {
    theta * 60.0 / w_rpm
}

/// Adsorption rate and gas density closures shared by the equations.
#[derive(Debug, Clone)]
struct SourceTerms {
    correlations: Correlations,
    m_co2: f64,
    /// Mean molar mass of the non-CO2 part of the feed
    m_rest: f64,
}

impl SourceTerms {
    /// LDF uptake rate, mol/(kg s).
    fn rate(&self, y: Dual64, p_bar: Dual64, ts: Dual64, q: Dual64) -> Dual64 {
        let partial = y * p_bar * 1e5 + 1e-6;
        let q_eq = self.correlations.isotherm.equilibrium_loading(partial, ts);
        self.correlations.mass_transfer.rate_constant(ts) * (q_eq - q)
    }

    /// Ergun gradient in bar/m.
    fn pressure_gradient(&self, vel: Dual64, p_bar: Dual64, tg: Dual64, y: Dual64) -> Dual64 {
        let concentration = p_bar / (tg * R_BAR);
        let molar_mass = y * self.m_co2 + (Dual64::from(1.0) - y) * self.m_rest;
        self.correlations.pressure_drop.gradient(vel, concentration * molar_mass) * 1e-5
    }
}

/// One adsorption or desorption section.
#[derive(Debug, Clone)]
pub struct Section {
    name: String,
    config: SectionConfig,
    z: Grid,
    o: Grid,
    /// Axial indices in gas flow order
    order: Vec<usize>,
    /// Normalized axial width of the cell each node closes (0 at the gas inlet)
    hz: Vec<f64>,
    co2: usize,
    registry: VariableRegistry,
    sources: SourceTerms,
    owned: Vec<VarId>,

    pub length: Var<Design>,
    pub diameter: Var<Design>,
    pub w_rpm: Var<Design>,
    pub theta: Var<Design>,
    /// Heat-exchange fluid temperature
    pub tx: Var<Design>,
    pub p_in: Var<Design>,
    pub p_out: Var<Design>,
    pub f_in: Var<Design>,
    pub tg_in: Var<Design>,
    pub y_in: Vec<Var<Design>>,
    /// Loading of the entering solid at each axial node
    pub q_in: Vec<Var<Design>>,
    pub ts_in: Vec<Var<Design>>,
    /// Continuation parameter; 1 is the physical model
    pub lambda: Var<Design>,

    pub y: Field,
    pub tg: Field,
    pub ts: Field,
    pub q: Field,
    pub p: Field,
    pub vel: Field,
    pub dpdz: Field,

    pub f_out: Var<Derived>,
    pub y_out: Vec<Var<Derived>>,
    pub tg_out: Var<Derived>,
    pub co2_capture: Var<Derived>,
    pub vol_tot: Var<Derived>,
    pub vol_solids_tot: Var<Derived>,
    pub q_ghx_tot_kw: Var<Derived>,
}

impl Section {
    /// Builds a section owning its own geometry variables.
    ///
    /// # Errors
    ///
    /// `Configuration` for an invalid configuration or a block name already
    /// in use; `InvalidGrid` for malformed discretization input.
    pub fn build(model: &mut Model, name: &str, config: &SectionConfig) -> Result<Section> {
        Self::build_with(model, name, config, None, Correlations::from_config(config))
    }

    /// Builds a section reading `geometry` when given, with custom correlations.
    pub fn build_with(
        model: &mut Model,
        name: &str,
        config: &SectionConfig,
        geometry: Option<SharedGeometry>,
        correlations: Correlations,
    ) -> Result<Section> {
        config.validate()?;
        if model.has_block(name) {
            return Err(RpbError::Configuration(format!("block {name} already exists")));
        }
        let z = Grid::new(config.nfe_z, &config.z_points)?;
        let o = Grid::new(config.nfe_o, &config.o_points)?;
        let co2 = config.co2_index()?;
        let (nz, no) = (z.len(), o.len());

        let registry = model.registry().clone();
        let first_id = registry.len();
        let geometry = match geometry {
            Some(shared) => shared,
            None => SharedGeometry::create(
                &registry,
                name,
                config.length,
                config.diameter,
                config.w_rpm,
            ),
        };

        let order: Vec<usize> = match config.gas_flow_direction {
            FlowDirection::Forward => (0..nz).collect(),
            FlowDirection::Reverse => (0..nz).rev().collect(),
        };
        let mut hz = vec![0.0; nz];
        for pair in order.windows(2) {
            hz[pair[1]] = (z.points()[pair[1]] - z.points()[pair[0]]).abs();
        }

        let m_co2 = molar_mass("CO2").unwrap_or(0.04401);
        let y_co2 = config.inlet_mole_fractions[co2];
        let m_rest = config
            .components
            .iter()
            .zip(&config.inlet_mole_fractions)
            .enumerate()
            .filter(|(j, _)| *j != co2)
            .map(|(_, (c, y))| molar_mass(c).unwrap_or(0.0) * y)
            .sum::<f64>()
            / (1.0 - y_co2);

        let design = |symbol: &str, value: f64, unit: UnitTag, doc: &str| {
            registry.create_design(&format!("{name}.{symbol}"), value, unit).with_doc(doc)
        };
        let derived = |symbol: &str, unit: UnitTag, doc: &str| {
            registry.create_derived(&format!("{name}.{symbol}"), 0.0, unit).with_doc(doc)
        };

        let theta = design("theta", config.theta, UnitTag::Dimensionless, "Section fraction of rotation");
        theta.set_bounds(Some(0.01), Some(0.99));
        let tx = design("Tx", config.exchanger_temperature, UnitTag::Kelvin, "Heat-exchange fluid temperature");
        let (tx_lo, tx_hi) = config.mode.exchanger_temperature_bounds();
        tx.set_bounds(Some(tx_lo), Some(tx_hi));
        let p_in = design("P_in", pascal_to_bar(config.inlet_pressure), UnitTag::Bar, "Inlet pressure");
        p_in.set_bounds(Some(0.01), Some(10.0));
        let p_out = design("P_out", pascal_to_bar(config.outlet_pressure), UnitTag::Bar, "Outlet pressure");
        p_out.set_bounds(Some(0.01), Some(10.0));
        p_out.unfix();
        let f_in = design("F_in", config.feed_flow, UnitTag::MolPerSecond, "Inlet molar flow");
        f_in.set_bounds(Some(0.0), None);
        let tg_in = design("Tg_in", config.inlet_temperature, UnitTag::Kelvin, "Inlet gas temperature");
        tg_in.set_bounds(Some(200.0), Some(600.0));
        let y_in: Vec<Var<Design>> = config
            .components
            .iter()
            .zip(&config.inlet_mole_fractions)
            .map(|(c, &y)| {
                let v = design(&format!("y_in[{c}]"), y, UnitTag::Dimensionless, "Inlet mole fraction");
                v.set_bounds(Some(0.0), Some(1.0));
                v
            })
            .collect();
        let q_in: Vec<Var<Design>> = (0..nz)
            .map(|i| {
                let v = design(&format!("q_in[{i}]"), config.solid_inlet_loading, UnitTag::MolPerKilogram, "Entering solid loading");
                v.set_bounds(Some(0.0), Some(10.0));
                v
            })
            .collect();
        let ts_in: Vec<Var<Design>> = (0..nz)
            .map(|i| {
                let v = design(&format!("Ts_in[{i}]"), config.solid_inlet_temperature, UnitTag::Kelvin, "Entering solid temperature");
                v.set_bounds(Some(200.0), Some(600.0));
                v
            })
            .collect();
        let lambda = design("lambda", 1.0, UnitTag::Dimensionless, "Continuation parameter");

        let shape = (nz, no);
        let temperature = (Some(200.0), Some(600.0));
        let y = Field::new(&registry, name, "y", UnitTag::Dimensionless, shape, y_co2, (Some(0.0), Some(1.0)));
        let tg = Field::new(&registry, name, "Tg", UnitTag::Kelvin, shape, config.inlet_temperature, temperature);
        let ts = Field::new(&registry, name, "Ts", UnitTag::Kelvin, shape, config.solid_inlet_temperature, temperature);
        let q = Field::new(&registry, name, "q", UnitTag::MolPerKilogram, shape, config.solid_inlet_loading, (Some(0.0), Some(10.0)));
        let p = Field::new(&registry, name, "P", UnitTag::Bar, shape, pascal_to_bar(config.inlet_pressure), (Some(0.01), Some(10.0)));
        let vel = Field::new(&registry, name, "vel", UnitTag::MeterPerSecond, shape, 0.0, (Some(0.0), Some(15.0)));
        let dpdz = Field::new(&registry, name, "dPdz", UnitTag::BarPerMeter, shape, 0.0, (Some(-5.0), Some(5.0)));

        let f_out = derived("F_out", UnitTag::MolPerSecond, "Outlet molar flow");
        f_out.set_bounds(Some(0.0), None);
        let y_out: Vec<Var<Derived>> = config
            .components
            .iter()
            .map(|c| {
                let v = derived(&format!("y_out[{c}]"), UnitTag::Dimensionless, "Outlet mole fraction");
                v.set_bounds(Some(0.0), Some(1.0));
                v
            })
            .collect();
        let tg_out = derived("Tg_out", UnitTag::Kelvin, "Outlet gas temperature");
        tg_out.set_bounds(Some(200.0), Some(600.0));
        let co2_capture = derived("CO2_capture", UnitTag::Dimensionless, "CO2 capture fraction");
        let vol_tot = derived("vol_tot", UnitTag::CubicMeter, "Section bed volume");
        vol_tot.set_bounds(Some(0.0), None);
        let vol_solids_tot = derived("vol_solids_tot", UnitTag::CubicMeter, "Section solids volume");
        vol_solids_tot.set_bounds(Some(0.0), None);
        let q_ghx_tot_kw = derived("Q_ghx_tot_kW", UnitTag::Kilowatt, "Heat from exchange fluid to gas");

        let mut owned: Vec<VarId> = (first_id..registry.len()).map(VarId).collect();
        for id in [geometry.length.id(), geometry.diameter.id(), geometry.w_rpm.id()] {
            if !owned.contains(&id) {
                owned.push(id);
            }
        }

        let section = Section {
            name: name.to_string(),
            config: config.clone(),
            z,
            o,
            order,
            hz,
            co2,
            registry,
            sources: SourceTerms { correlations, m_co2, m_rest },
            owned,
            length: geometry.length,
            diameter: geometry.diameter,
            w_rpm: geometry.w_rpm,
            theta,
            tx,
            p_in,
            p_out,
            f_in,
            tg_in,
            y_in,
            q_in,
            ts_in,
            lambda,
            y,
            tg,
            ts,
            q,
            p,
            vel,
            dpdz,
            f_out,
            y_out,
            tg_out,
            co2_capture,
            vol_tot,
            vol_solids_tot,
            q_ghx_tot_kw,
        };

        let before = model.equations().total_equations();
        section.add_gas_equations(model);
        section.add_solid_equations(model);
        section.add_performance_equations(model);
        section.set_trivial_state();

        info!(
            "section {name} ({}) built: {}x{} grid, {} variables, {} equations",
            section.config.mode,
            nz,
            no,
            section.owned.len(),
            model.equations().total_equations() - before
        );
        Ok(section)
    }

    fn nominal_flux(&self) -> f64 {
        self.config.feed_flow / face_area(self.theta.get(), self.diameter.get())
    }

    /// CO2 flux scale, mol/(m2 s): the CO2 fed with the gas or the flux that
    /// a full swing of the entering solid loading would exchange, whichever
    /// is larger. Desorption sweeps carry almost no CO2, so the solid term
    /// sets the scale there.
    fn nominal_co2_flux(&self) -> f64 {
        let bed = &self.config.bed;
        let solid = (1.0 - bed.voidage) * bed.solid_density;
        let tau = residence_time(self.theta.get(), self.w_rpm.get());
        let swing = solid * self.length.get() * self.config.solid_inlet_loading.max(0.1) / tau;
        let fed = self.nominal_flux() * self.config.inlet_mole_fractions[self.co2];
        fed.max(swing).max(1e-8)
    }

    fn inlet_node(&self) -> usize {
        self.order[0]
    }

    fn outlet_node(&self) -> usize {
        self.order[self.order.len() - 1]
    }

    /// Boundary conditions, column closures, gas balances and the
    /// pressure-gradient correlation.
    fn add_gas_equations(&self, model: &mut Model) {
        let name = self.name.as_str();
        let (nz, no) = (self.z.len(), self.o.len());
        let inlet = self.inlet_node();
        let outlet = self.outlet_node();
        let y_in = self.y_in[self.co2].id();
        let n_nom = self.nominal_flux();
        let co2_nom = self.nominal_co2_flux();
        let bed = &self.config.bed;
        let cp = self.config.gas.heat_capacity;
        let solid = (1.0 - bed.voidage) * bed.solid_density;
        let hs_as = bed.gas_solid_htc * bed.specific_surface();
        let ua = bed.hx_coefficient * bed.hx_area_density;

        for k in 0..no {
            model.add_equation(ResidualFunction::new(
                &format!("{name}.inlet_y[{k}]"),
                name,
                BalanceKind::Boundary,
                vec![self.y.id(inlet, k), y_in],
                |v: &[Dual64]| v[0] - v[1],
            ));
            model.add_equation(
                ResidualFunction::new(
                    &format!("{name}.inlet_Tg[{k}]"),
                    name,
                    BalanceKind::Boundary,
                    vec![self.tg.id(inlet, k), self.tg_in.id()],
                    |v: &[Dual64]| v[0] - v[1],
                )
                .with_scale(0.01),
            );
            model.add_equation(ResidualFunction::new(
                &format!("{name}.inlet_P[{k}]"),
                name,
                BalanceKind::Boundary,
                vec![self.p.id(inlet, k), self.p_in.id()],
                |v: &[Dual64]| v[0] - v[1],
            ));

            // Every column discharges at P_out; without pressure drop the
            // inlet velocity is uniform instead and column 0 sets P_out.
            let closure = if self.config.has_pressure_drop || k == 0 {
                vec![self.p.id(outlet, k), self.p_out.id()]
            } else {
                vec![self.vel.id(inlet, k), self.vel.id(inlet, 0)]
            };
            model.add_equation(ResidualFunction::new(
                &format!("{name}.column_closure[{k}]"),
                name,
                BalanceKind::Momentum,
                closure,
                |v: &[Dual64]| v[0] - v[1],
            ));
        }

        for pair in self.order.windows(2) {
            let (u, i) = (pair[0], pair[1]);
            let dz = self.hz[i];
            let dz_signed = self.z.points()[i] - self.z.points()[u];
            for k in 0..no {
                let gas_i = [self.vel.id(i, k), self.p.id(i, k), self.tg.id(i, k), self.y.id(i, k)];
                let gas_u = [self.vel.id(u, k), self.p.id(u, k), self.tg.id(u, k), self.y.id(u, k)];

                let mut vars = gas_i.to_vec();
                vars.extend(gas_u);
                model.add_equation(
                    ResidualFunction::new(
                        &format!("{name}.inert_balance[{i},{k}]"),
                        name,
                        BalanceKind::Mass,
                        vars.clone(),
                        |v: &[Dual64]| {
                            let one = Dual64::from(1.0);
                            molar_flux(v[0], v[1], v[2]) * (one - v[3])
                                - molar_flux(v[4], v[5], v[6]) * (one - v[7])
                        },
                    )
                    .with_scale(1.0 / n_nom),
                );

                vars.extend([self.ts.id(i, k), self.q.id(i, k), self.length.id(), self.lambda.id()]);
                let sources = self.sources.clone();
                model.add_equation(
                    ResidualFunction::new(
                        &format!("{name}.co2_balance[{i},{k}]"),
                        name,
                        BalanceKind::Mass,
                        vars,
                        move |v: &[Dual64]| {
                            let uptake = sources.rate(v[3], v[1], v[8], v[9]);
                            molar_flux(v[0], v[1], v[2]) * v[3] - molar_flux(v[4], v[5], v[6]) * v[7]
                                + v[10] * v[11] * uptake * (dz * solid)
                        },
                    )
                    .with_scale(1.0 / co2_nom),
                );

                model.add_equation(
                    ResidualFunction::new(
                        &format!("{name}.gas_energy[{i},{k}]"),
                        name,
                        BalanceKind::Energy,
                        vec![
                            gas_i[0],
                            gas_i[1],
                            gas_i[2],
                            gas_u[2],
                            self.ts.id(i, k),
                            self.tx.id(),
                            self.length.id(),
                            self.lambda.id(),
                        ],
                        move |v: &[Dual64]| {
                            let exchange = (v[4] - v[2]) * hs_as + (v[5] - v[2]) * ua;
                            molar_flux(v[0], v[1], v[2]) * (v[2] - v[3]) * cp
                                - v[6] * v[7] * exchange * dz
                        },
                    )
                    .with_scale(1.0 / (n_nom * cp)),
                );

                model.add_equation(ResidualFunction::new(
                    &format!("{name}.momentum[{i},{k}]"),
                    name,
                    BalanceKind::Momentum,
                    vec![gas_i[1], gas_u[1], self.dpdz.id(i, k), self.length.id()],
                    move |v: &[Dual64]| v[0] - v[1] - v[2] * v[3] * dz_signed,
                ));
            }
        }

        let sign = self.config.gas_flow_direction.sign();
        for i in 0..nz {
            for k in 0..no {
                let label = format!("{name}.pressure_gradient[{i},{k}]");
                let equation = if self.config.has_pressure_drop {
                    let sources = self.sources.clone();
                    ResidualFunction::new(
                        &label,
                        name,
                        BalanceKind::Momentum,
                        vec![
                            self.dpdz.id(i, k),
                            self.vel.id(i, k),
                            self.p.id(i, k),
                            self.tg.id(i, k),
                            self.y.id(i, k),
                            self.lambda.id(),
                        ],
                        move |v: &[Dual64]| {
                            v[0] + sources.pressure_gradient(v[1], v[2], v[3], v[4]) * v[5] * sign
                        },
                    )
                } else {
                    ResidualFunction::new(
                        &label,
                        name,
                        BalanceKind::Momentum,
                        vec![self.dpdz.id(i, k)],
                        |v: &[Dual64]| v[0],
                    )
                };
                model.add_equation(equation);
            }
        }
    }

    /// Solid entry conditions and the loading/temperature march along `o`.
    fn add_solid_equations(&self, model: &mut Model) {
        let name = self.name.as_str();
        let bed = &self.config.bed;
        let solid = (1.0 - bed.voidage) * bed.solid_density;
        let hs_as = bed.gas_solid_htc * bed.specific_surface();
        let cap = bed.solid_heat_capacity_per_volume();
        let adsorption_heat = -bed.heat_of_adsorption * solid;

        for i in 0..self.z.len() {
            model.add_equation(ResidualFunction::new(
                &format!("{name}.solid_inlet_q[{i}]"),
                name,
                BalanceKind::Boundary,
                vec![self.q.id(i, 0), self.q_in[i].id()],
                |v: &[Dual64]| v[0] - v[1],
            ));
            model.add_equation(
                ResidualFunction::new(
                    &format!("{name}.solid_inlet_Ts[{i}]"),
                    name,
                    BalanceKind::Boundary,
                    vec![self.ts.id(i, 0), self.ts_in[i].id()],
                    |v: &[Dual64]| v[0] - v[1],
                )
                .with_scale(0.01),
            );

            for k in 1..self.o.len() {
                let d_o = self.o.width_before(k);
                let sources = self.sources.clone();
                model.add_equation(ResidualFunction::new(
                    &format!("{name}.solid_loading[{i},{k}]"),
                    name,
                    BalanceKind::Mass,
                    vec![
                        self.q.id(i, k),
                        self.q.id(i, k - 1),
                        self.y.id(i, k),
                        self.p.id(i, k),
                        self.ts.id(i, k),
                        self.theta.id(),
                        self.w_rpm.id(),
                        self.lambda.id(),
                    ],
                    move |v: &[Dual64]| {
                        let uptake = sources.rate(v[2], v[3], v[4], v[0]);
                        v[0] - v[1] - residence_time(v[5], v[6]) * v[7] * uptake * d_o
                    },
                ));

                let sources = self.sources.clone();
                model.add_equation(
                    ResidualFunction::new(
                        &format!("{name}.solid_energy[{i},{k}]"),
                        name,
                        BalanceKind::Energy,
                        vec![
                            self.ts.id(i, k),
                            self.ts.id(i, k - 1),
                            self.tg.id(i, k),
                            self.q.id(i, k),
                            self.y.id(i, k),
                            self.p.id(i, k),
                            self.theta.id(),
                            self.w_rpm.id(),
                            self.lambda.id(),
                        ],
                        move |v: &[Dual64]| {
                            let uptake = sources.rate(v[4], v[5], v[0], v[3]);
                            let heat = (v[2] - v[0]) * hs_as + uptake * adsorption_heat;
                            (v[0] - v[1]) * cap - residence_time(v[6], v[7]) * v[8] * heat * d_o
                        },
                    )
                    .with_scale(1.0 / cap),
                );
            }
        }
    }

    /// Feed and product integrals plus the derived performance variables.
    fn add_performance_equations(&self, model: &mut Model) {
        let name = self.name.as_str();
        let inlet = self.inlet_node();
        let outlet = self.outlet_node();
        let no = self.o.len();
        let weights: Vec<f64> = (1..no).map(|k| self.o.width_before(k)).collect();
        let f_nom = self.config.feed_flow;
        let co2_nom = self.nominal_co2_flux() * face_area(self.theta.get(), self.diameter.get());
        let t_nom = self.config.inlet_temperature;
        let eps = self.config.bed.voidage;
        let ua = self.config.bed.hx_coefficient * self.config.bed.hx_area_density;
        let area_vars = [self.theta.id(), self.diameter.id()];

        // [flow, theta, D, (vel, p, tg) per column k >= 1]
        let flow_vars = |flow: VarId, node: usize| {
            let mut vars = vec![flow];
            vars.extend(area_vars);
            for k in 1..no {
                vars.extend([self.vel.id(node, k), self.p.id(node, k), self.tg.id(node, k)]);
            }
            vars
        };
        for (label, flow, node) in
            [("feed_flow", self.f_in.id(), inlet), ("outlet_flow", self.f_out.id(), outlet)]
        {
            let w = weights.clone();
            model.add_equation(
                ResidualFunction::new(
                    &format!("{name}.{label}"),
                    name,
                    BalanceKind::Definition,
                    flow_vars(flow, node),
                    move |v: &[Dual64]| {
                        let mut total = Dual64::from(0.0);
                        for (j, &wk) in w.iter().enumerate() {
                            let b = 3 + 3 * j;
                            total = total + molar_flux(v[b], v[b + 1], v[b + 2]) * wk;
                        }
                        v[0] - face_area(v[1], v[2]) * total
                    },
                )
                .with_scale(1.0 / f_nom),
            );
        }

        // [F_out, y_out or Tg_out, theta, D, (vel, p, tg, field) per column k >= 1]
        for (label, target, field, scale) in [
            ("outlet_co2", self.y_out[self.co2].id(), &self.y, 1.0 / co2_nom),
            ("outlet_temperature", self.tg_out.id(), &self.tg, 1.0 / (f_nom * t_nom)),
        ] {
            let mut vars = vec![self.f_out.id(), target];
            vars.extend(area_vars);
            for k in 1..no {
                vars.extend([
                    self.vel.id(outlet, k),
                    self.p.id(outlet, k),
                    self.tg.id(outlet, k),
                    field.id(outlet, k),
                ]);
            }
            let w = weights.clone();
            model.add_equation(
                ResidualFunction::new(
                    &format!("{name}.{label}"),
                    name,
                    BalanceKind::Definition,
                    vars,
                    move |v: &[Dual64]| {
                        let mut total = Dual64::from(0.0);
                        for (j, &wk) in w.iter().enumerate() {
                            let b = 4 + 4 * j;
                            total = total + molar_flux(v[b], v[b + 1], v[b + 2]) * v[b + 3] * wk;
                        }
                        v[0] * v[1] - face_area(v[2], v[3]) * total
                    },
                )
                .with_scale(scale),
            );
        }

        // Non-CO2 components keep their feed proportions
        for (j, component) in self.config.components.iter().enumerate() {
            if j == self.co2 {
                continue;
            }
            model.add_equation(ResidualFunction::new(
                &format!("{name}.outlet_fraction[{component}]"),
                name,
                BalanceKind::Definition,
                vec![
                    self.y_out[j].id(),
                    self.y_in[j].id(),
                    self.y_in[self.co2].id(),
                    self.y_out[self.co2].id(),
                ],
                |v: &[Dual64]| {
                    let one = Dual64::from(1.0);
                    v[0] * (one - v[2]) - v[1] * (one - v[3])
                },
            ));
        }

        model.add_equation(
            ResidualFunction::new(
                &format!("{name}.capture_definition"),
                name,
                BalanceKind::Definition,
                vec![
                    self.co2_capture.id(),
                    self.y_in[self.co2].id(),
                    self.f_in.id(),
                    self.f_out.id(),
                    self.y_out[self.co2].id(),
                ],
                |v: &[Dual64]| v[1] * v[2] * (Dual64::from(1.0) - v[0]) - v[3] * v[4],
            )
            .with_scale(1.0 / co2_nom),
        );

        let vol_nom = self.config.theta * PI / 4.0 * self.config.diameter.powi(2) * self.config.length;
        model.add_equation(
            ResidualFunction::new(
                &format!("{name}.vol_tot_definition"),
                name,
                BalanceKind::Definition,
                vec![self.vol_tot.id(), self.theta.id(), self.diameter.id(), self.length.id()],
                |v: &[Dual64]| v[0] - face_area(v[1], v[2]) * v[3],
            )
            .with_scale(1.0 / vol_nom.max(1.0)),
        );
        model.add_equation(
            ResidualFunction::new(
                &format!("{name}.vol_solids_definition"),
                name,
                BalanceKind::Definition,
                vec![self.vol_solids_tot.id(), self.vol_tot.id()],
                move |v: &[Dual64]| v[0] - v[1] * (1.0 - eps),
            )
            .with_scale(1.0 / vol_nom.max(1.0)),
        );

        // [Q, theta, D, L, lambda, Tx, Tg per (i, k) cell]
        let mut vars = vec![
            self.q_ghx_tot_kw.id(),
            self.theta.id(),
            self.diameter.id(),
            self.length.id(),
            self.lambda.id(),
            self.tx.id(),
        ];
        let mut cell_weights = Vec::new();
        for &i in &self.order[1..] {
            for (k, &wk) in (1..no).zip(&weights) {
                vars.push(self.tg.id(i, k));
                cell_weights.push(self.hz[i] * wk);
            }
        }
        let q_nom = (f_nom * self.config.gas.heat_capacity * 0.1).max(1.0);
        model.add_equation(
            ResidualFunction::new(
                &format!("{name}.heat_duty"),
                name,
                BalanceKind::Definition,
                vars,
                move |v: &[Dual64]| {
                    let mut total = Dual64::from(0.0);
                    for (j, &w) in cell_weights.iter().enumerate() {
                        total = total + (v[5] - v[6 + j]) * w;
                    }
                    v[0] - face_area(v[1], v[2]) * v[3] * v[4] * total * (ua * 1e-3)
                },
            )
            .with_scale(1.0 / q_nom),
        );
    }

    /// Places every free variable at the exact solution of the `lambda = 0`
    /// problem: uniform inlet gas, unchanged solid, no pressure gradient.
    pub fn set_trivial_state(&self) {
        let p = self.p_in.get();
        let tg = self.tg_in.get();
        let area = self.area();
        let concentration = p / (R_BAR * tg);
        let vel = self.f_in.get() / (area * concentration);

        self.y.fill(self.y_in[self.co2].get());
        self.tg.fill(tg);
        self.p.fill(p);
        self.vel.fill(vel);
        self.dpdz.fill(0.0);
        for i in 0..self.z.len() {
            for k in 0..self.o.len() {
                self.q.set(i, k, self.q_in[i].get());
                self.ts.set(i, k, self.ts_in[i].get());
            }
        }
        if !self.p_out.is_fixed() {
            self.p_out.set(p);
        }

        self.f_out.set(self.f_in.get());
        for (out, inp) in self.y_out.iter().zip(&self.y_in) {
            out.set(inp.get());
        }
        self.tg_out.set(tg);
        self.co2_capture.set(0.0);
        let volume = area * self.length.get();
        self.vol_tot.set(volume);
        self.vol_solids_tot.set(volume * (1.0 - self.config.bed.voidage));
        let ua = self.config.bed.hx_coefficient * self.config.bed.hx_area_density;
        self.q_ghx_tot_kw
            .set(volume * self.lambda.get() * ua * (self.tx.get() - tg) * 1e-3);
    }

    /// Initializes the section by continuation on `lambda`.
    ///
    /// The gas inlet and solid inlet variables are held fixed while the
    /// continuation runs. With pressure drop, a fixed `P_out` and free `F_in`
    /// are swapped for the run, `F_in` starting from the flow whose Ergun
    /// drop at inlet conditions reaches the target `P_out`. Afterwards the
    /// caller's fixed set and outlet pressure are restored and the section
    /// block is re-solved when it is square.
    ///
    /// # Errors
    ///
    /// `Configuration` when the section is not square under the
    /// initialization fixed set; `InitializationDiverged` when a point fails
    /// after its step halvings; `SolveFailed` from the final solve.
    ///
    /// After a failed continuation the state variables hold the last
    /// converged point (also carried in the error), while `lambda` is back at
    /// 1 and the caller's fixed set and outlet pressure are restored, so the
    /// section again describes the full physical problem.
    pub fn initialize(
        &self,
        model: &Model,
        continuation: &Continuation,
        solver: &NewtonRaphson,
    ) -> Result<ContinuationReport> {
        let registry = model.registry();
        let flags = registry.fixed_flags();
        let p_out_target = self.p_out.get();
        let swapped = !self.f_in.is_fixed() && self.p_out.is_fixed();

        if swapped {
            if !self.config.has_pressure_drop {
                return Err(RpbError::Configuration(format!(
                    "section {} has no pressure drop; fix F_in instead of P_out",
                    self.name
                )));
            }
            self.f_in.set(self.estimate_feed_flow(p_out_target, solver)?);
        }

        for var in self.gas_inlet_design().chain(self.q_in.iter()).chain(self.ts_in.iter()) {
            var.fix();
        }
        if swapped {
            self.p_out.unfix();
        }

        let dof = model.degrees_of_freedom_in(&[self.name.as_str()]);
        if dof != 0 {
            registry.restore_fixed_flags(&flags);
            return Err(RpbError::Configuration(format!(
                "section {} has {dof} degrees of freedom with its inlets fixed",
                self.name
            )));
        }

        info!("initializing section {} over {} continuation points", self.name, continuation.points().len());
        self.lambda.set(0.0);
        self.set_trivial_state();
        let mut homotopy = SectionHomotopy { model, section: self, solver };
        let report = continuation.run(&mut homotopy);
        registry.restore_fixed_flags(&flags);
        if swapped {
            self.p_out.set(p_out_target);
        }
        if report.is_err() {
            self.lambda.set(1.0);
        }
        let report = report?;

        if registry.fixed_flags() != flags || swapped {
            if model.degrees_of_freedom_in(&[self.name.as_str()]) == 0 {
                self.solve(model, solver)?;
            } else {
                debug!("section {} is not square on its own; final solve left to the caller", self.name);
            }
        }
        Ok(report)
    }

    /// Feed flow whose pressure drop at inlet conditions matches `p_out_target`.
    fn estimate_feed_flow(&self, p_out_target: f64, solver: &NewtonRaphson) -> Result<f64> {
        let p_in = self.p_in.get();
        let gradient = (p_in - p_out_target) / self.length.get();
        if gradient <= 0.0 {
            return Err(RpbError::Configuration(format!(
                "section {}: outlet pressure {p_out_target} bar is not below inlet pressure {p_in} bar",
                self.name
            )));
        }
        let tg = self.tg_in.get();
        let y = self.y_in[self.co2].get();
        let sources = &self.sources;
        let system = DualSystem::new(1, |v: &[Dual64]| {
            let drop = sources.pressure_gradient(
                v[0],
                Dual64::from(p_in),
                Dual64::from(tg),
                Dual64::from(y),
            );
            vec![(drop - gradient) * 1e3]
        })
        .with_bounds(vec![(Some(0.0), Some(15.0))]);

        let molar_area = self.area() * p_in / (R_BAR * tg);
        let guess = (self.f_in.get() / molar_area).clamp(0.1, 15.0);
        let (vel, _) = solver
            .solve_system(&system, &[guess])
            .map_err(|e| RpbError::from_solver(&e))?;
        debug!("section {}: feed flow estimate {:.3} mol/s", self.name, vel[0] * molar_area);
        Ok(vel[0] * molar_area)
    }

    /// Solves the equations of this section alone.
    pub fn solve(&self, model: &Model, solver: &NewtonRaphson) -> Result<SolverStats> {
        model.solve_blocks(&[self.name.as_str()], solver)
    }

    /// Fixes `F_in` and `P_in` and frees `P_out`.
    pub fn remove_pressure_drop(&self) {
        self.f_in.fix();
        self.p_in.fix();
        self.p_out.unfix();
    }

    fn gas_inlet_design(&self) -> impl Iterator<Item = &Var<Design>> {
        [&self.f_in, &self.tg_in, &self.p_in].into_iter().chain(self.y_in.iter())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &SectionConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.config.mode
    }

    pub fn z_grid(&self) -> &Grid {
        &self.z
    }

    pub fn o_grid(&self) -> &Grid {
        &self.o
    }

    pub fn components(&self) -> &[String] {
        &self.config.components
    }

    /// Every variable the section created or reads as geometry.
    pub fn variables(&self) -> &[VarId] {
        &self.owned
    }

    /// Face area at the current `theta` and `D`, m2.
    pub fn area(&self) -> f64 {
        face_area(self.theta.get(), self.diameter.get())
    }

    /// Solid residence time at the current `theta` and `w_rpm`, s.
    pub fn residence_time(&self) -> f64 {
        residence_time(self.theta.get(), self.w_rpm.get())
    }

    pub fn capture(&self) -> f64 {
        self.co2_capture.get()
    }

    /// Outlet pressure minus inlet pressure, bar.
    pub fn pressure_change(&self) -> f64 {
        self.p_out.get() - self.p_in.get()
    }

    /// Total gas concentration at a node, mol/m3.
    pub fn concentration(&self, i: usize, k: usize) -> f64 {
        self.p.get(i, k) / (R_BAR * self.tg.get(i, k))
    }

    /// Loading profile of the solid leaving the section (`o = 1`).
    pub fn solid_outlet_loading(&self) -> Vec<VarId> {
        let last = self.o.len() - 1;
        (0..self.z.len()).map(|i| self.q.id(i, last)).collect()
    }

    /// Temperature profile of the solid leaving the section (`o = 1`).
    pub fn solid_outlet_temperature(&self) -> Vec<VarId> {
        let last = self.o.len() - 1;
        (0..self.z.len()).map(|i| self.ts.id(i, last)).collect()
    }

    /// Gas inlet port: `F_in`, `y_in`, `Tg_in`, `P_in`.
    pub fn gas_inlet(&self) -> GasPort {
        GasPort {
            name: format!("{}.gas_inlet", self.name),
            components: self.config.components.clone(),
            flow: self.f_in.id(),
            mole_fractions: self.y_in.iter().map(Var::id).collect(),
            temperature: self.tg_in.id(),
            pressure: self.p_in.id(),
        }
    }

    /// Gas outlet port: `F_out`, `y_out`, `Tg_out`, `P_out`.
    pub fn gas_outlet(&self) -> GasPort {
        GasPort {
            name: format!("{}.gas_outlet", self.name),
            components: self.config.components.clone(),
            flow: self.f_out.id(),
            mole_fractions: self.y_out.iter().map(Var::id).collect(),
            temperature: self.tg_out.id(),
            pressure: self.p_out.id(),
        }
    }

    /// Variables outside their bounds, plus nodes above the concentration limit.
    pub fn bound_violations(&self, tolerance: f64) -> Vec<BoundViolation> {
        let mut violations = self.registry.violations_among(&self.owned, tolerance);
        for i in 0..self.z.len() {
            for k in 0..self.o.len() {
                let c = self.concentration(i, k);
                if c > MAX_CONCENTRATION + tolerance {
                    violations.push(BoundViolation {
                        name: format!("{}.C_tot[{i},{k}]", self.name),
                        value: c,
                        lower: None,
                        upper: Some(MAX_CONCENTRATION),
                    });
                }
            }
        }
        if !violations.is_empty() {
            warn!("section {}: {} bound violations", self.name, violations.len());
        }
        violations
    }
}

impl ConservesMass for Section {
    /// CO2 in, out and taken up by the solid, mol/s.
    fn mass_balance(&self) -> MassBalanceSummary {
        let last = self.o.len() - 1;
        let per_time = self.area() * self.length.get() / self.residence_time();
        let solid = (1.0 - self.config.bed.voidage) * self.config.bed.solid_density;
        let uptake: f64 = (0..self.z.len())
            .map(|i| self.hz[i] * (self.q.get(i, last) - self.q.get(i, 0)))
            .sum::<f64>()
            * per_time
            * solid;
        MassBalanceSummary {
            name: format!("{} CO2", self.name),
            inflow: self.f_in.get() * self.y_in[self.co2].get(),
            outflow: self.f_out.get() * self.y_out[self.co2].get(),
            uptake,
        }
    }
}

impl ConservesEnergy for Section {
    /// Heat picked up by gas and solid against exchanger duty and
    /// adsorption heat, W.
    fn energy_balance(&self) -> EnergyBalanceSummary {
        let last = self.o.len() - 1;
        let cp = self.config.gas.heat_capacity;
        let area = self.area();
        let mut gas = 0.0;
        for pair in self.order.windows(2) {
            let (u, i) = (pair[0], pair[1]);
            for k in 1..self.o.len() {
                let flux = molar_flux(self.vel.get(i, k), self.p.get(i, k), self.tg.get(i, k));
                gas += self.o.width_before(k) * flux * cp * (self.tg.get(i, k) - self.tg.get(u, k));
            }
        }
        let cap = self.config.bed.solid_heat_capacity_per_volume();
        let solid: f64 = (0..self.z.len())
            .map(|i| self.hz[i] * (self.ts.get(i, last) - self.ts.get(i, 0)))
            .sum::<f64>()
            * cap
            * area
            * self.length.get()
            / self.residence_time();
        EnergyBalanceSummary {
            name: format!("{} energy", self.name),
            gas_sensible: gas * area,
            solid_sensible: solid,
            exchanger_duty: self.q_ghx_tot_kw.get() * 1e3,
            adsorption_heat: -self.config.bed.heat_of_adsorption * self.mass_balance().uptake,
        }
    }
}

impl HasPorts for Section {
    fn input_ports(&self) -> Vec<GasPort> {
        vec![self.gas_inlet()]
    }

    fn output_ports(&self) -> Vec<GasPort> {
        vec![self.gas_outlet()]
    }
}

/// A section's equations as a family in its continuation parameter.
struct SectionHomotopy<'a> {
    model: &'a Model,
    section: &'a Section,
    solver: &'a NewtonRaphson,
}

impl ContinuationProblem for SectionHomotopy<'_> {
    fn parameter(&self) -> f64 {
        self.section.lambda.get()
    }

    fn set_parameter(&mut self, value: f64) {
        self.section.lambda.set(value);
    }

    fn state(&self) -> Vec<f64> {
        self.model.registry().get_all_values()
    }

    fn restore(&mut self, state: &[f64]) {
        if let Err(e) = self.model.registry().set_all_values(state) {
            warn!("could not restore section {}: {e}", self.section.name);
        }
    }

    fn solve_step(&mut self) -> SolverResult<SolverStats> {
        self.model.try_solve_blocks(&[self.section.name.as_str()], self.solver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn coarse() -> SectionConfig {
        SectionConfig::adsorption().with_discretization(3, 3)
    }

    #[test]
    fn test_mode_and_direction_parsing() {
        assert_eq!("adsorption".parse::<Mode>().unwrap(), Mode::Adsorption);
        assert_eq!("desorption".parse::<Mode>().unwrap(), Mode::Desorption);
        assert!(matches!("regeneration".parse::<Mode>(), Err(RpbError::Configuration(_))));
        assert_eq!(FlowDirection::try_from(-1).unwrap(), FlowDirection::Reverse);
        assert!(matches!(FlowDirection::try_from(0), Err(RpbError::Configuration(_))));
        assert_eq!(i32::from(FlowDirection::Forward), 1);
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = SectionConfig::desorption().with_discretization(4, 5);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"desorption\""));
        let parsed = SectionConfig::from_json_str(&json).unwrap();
        assert_eq!(parsed, config);
        assert!(matches!(
            SectionConfig::from_json_str(r#"{"mode": "stripping"}"#),
            Err(RpbError::Json(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_composition() {
        let config = coarse().with_feed(100.0, vec![0.5, 0.5]);
        assert!(matches!(config.validate(), Err(RpbError::Configuration(_))));
        let config = coarse().with_feed(100.0, vec![0.1, 0.1, 0.1]);
        assert!(config.validate().is_err());
        let mut config = coarse();
        config.components[2] = "Kr".into();
        assert!(config.validate().is_err());
        assert!(coarse().with_theta(1.2).validate().is_err());
    }

    #[test]
    fn test_build_is_square() {
        let mut model = Model::new();
        let section = Section::build(&mut model, "ads", &coarse()).unwrap();
        let nodes = 4 * 4;
        let ncomp = 3;
        assert_eq!(model.equations().total_equations(), 7 * nodes + 7 + ncomp);
        assert_eq!(model.degrees_of_freedom(), 0);
        assert!(model.unreferenced_free_variables().is_empty());
        assert!(section.f_in.is_fixed());
        assert!(!section.p_out.is_fixed());
        assert_eq!(model.registry().find("ads.y[3,2]"), Some(section.y.id(3, 2)));
    }

    #[test]
    fn test_duplicate_block_rejected() {
        let mut model = Model::new();
        Section::build(&mut model, "ads", &coarse()).unwrap();
        assert!(matches!(
            Section::build(&mut model, "ads", &coarse()),
            Err(RpbError::Configuration(_))
        ));
    }

    #[test]
    fn test_invalid_grid_rejected() {
        let mut model = Model::new();
        let config = coarse().with_grid_points(vec![0.6, 0.2], Vec::new());
        assert!(matches!(
            Section::build(&mut model, "ads", &config),
            Err(RpbError::InvalidGrid(_))
        ));
    }

    #[test]
    fn test_trivial_state_solves_zero_lambda() {
        for config in [coarse(), SectionConfig::desorption().with_discretization(3, 3)] {
            let mut model = Model::new();
            let section = Section::build(&mut model, "sec", &config).unwrap();
            section.lambda.set(0.0);
            section.set_trivial_state();
            assert!(model.residual_norm() < 1e-10, "norm {}", model.residual_norm());
        }
    }

    #[test]
    fn test_trivial_state_values() {
        let mut model = Model::new();
        let section = Section::build(&mut model, "ads", &coarse()).unwrap();
        let area = 0.5 * PI;
        assert_relative_eq!(section.area(), area, epsilon = 1e-12);
        assert_relative_eq!(section.vol_tot.get(), area * 8.0, epsilon = 1e-9);
        let c = 1.5 / (R_BAR * 363.0);
        assert_relative_eq!(section.vel.get(2, 2), 100.0 / (area * c), max_relative = 1e-12);
        assert_relative_eq!(section.residence_time(), 15_000.0, max_relative = 1e-12);
        assert_relative_eq!(section.p_out.get(), 1.5, epsilon = 1e-12);
    }

    #[test]
    fn test_reverse_flow_inlet_at_top() {
        let mut model = Model::new();
        let config = SectionConfig::desorption().with_discretization(3, 3);
        let section = Section::build(&mut model, "des", &config).unwrap();
        let inlet_eq = model
            .equations()
            .equations()
            .iter()
            .find(|e| e.name == "des.inlet_y[0]")
            .unwrap();
        assert_eq!(inlet_eq.vars()[0], section.y.id(3, 0));
    }

    #[test]
    fn test_remove_pressure_drop_keeps_dof() {
        let mut model = Model::new();
        let config = coarse().with_pressure_drop(false);
        let section = Section::build(&mut model, "ads", &config).unwrap();
        section.f_in.unfix();
        section.p_out.fix();
        section.remove_pressure_drop();
        assert_eq!(model.degrees_of_freedom(), 0);
        assert!(!section.p_out.is_fixed());
    }

    #[test]
    fn test_ports() {
        let mut model = Model::new();
        let section = Section::build(&mut model, "ads", &coarse()).unwrap();
        assert_eq!(section.port_count(), (1, 1));
        let inlet = section.get_input_port("ads.gas_inlet").unwrap();
        assert_eq!(inlet.flow, section.f_in.id());
        let stream = section.gas_inlet().read(model.registry());
        assert_eq!(stream.flow, 100.0);
        assert_relative_eq!(stream.pressure, 1.5, epsilon = 1e-12);
    }

    #[test]
    fn test_initialize_rejects_non_square() {
        let mut model = Model::new();
        let section = Section::build(&mut model, "ads", &coarse()).unwrap();
        section.p_out.fix();
        let flags = model.registry().fixed_flags();
        let err = section
            .initialize(&model, &Continuation::default(), &NewtonRaphson::default())
            .unwrap_err();
        assert!(matches!(err, RpbError::Configuration(_)));
        assert_eq!(model.registry().fixed_flags(), flags);
    }
}
