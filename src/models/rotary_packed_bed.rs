//! Rotary packed bed: an adsorption and a desorption section on one rotor.
//!
//! The composite owns the rotor geometry (`L`, `D`, `w_rpm`) and hands it to
//! both sections, closes the solid loop (each section's solid inlet profile
//! equals the other's solid outlet profile) and reports the combined heat
//! duty.

use std::fmt;

use log::{debug, info};
use num_dual::Dual64;
use serde::{Deserialize, Serialize};

use super::section::{Correlations, Section, SectionConfig, SharedGeometry};
use crate::error::{Result, RpbError};
use crate::solvers::continuation::Continuation;
use crate::solvers::NewtonRaphson;
use crate::units::{pascal_to_bar, UnitTag};
use crate::{
    link_variables, BalanceKind, ConservesMass, Derived, Design, GasPort, HasPorts,
    MassBalanceSummary, Model, ResidualFunction, Var, VarId, VariableRegistry,
};

/// Construction parameters of the composite bed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpbConfig {
    pub adsorption: SectionConfig,
    pub desorption: SectionConfig,
    /// m
    pub length: f64,
    /// m
    pub diameter: f64,
    /// rev/min
    pub w_rpm: f64,
    /// Sequential passes around the solid loop before the coupled solve
    pub tear_passes: usize,
}

impl Default for RpbConfig {
    fn default() -> Self {
        RpbConfig {
            adsorption: SectionConfig::adsorption(),
            desorption: SectionConfig::desorption(),
            length: 8.0,
            diameter: 2.0,
            w_rpm: 0.002,
            tear_passes: 2,
        }
    }
}

impl RpbConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: RpbConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Same grid for both sections.
    pub fn with_discretization(mut self, nfe_z: usize, nfe_o: usize) -> Self {
        self.adsorption = self.adsorption.with_discretization(nfe_z, nfe_o);
        self.desorption = self.desorption.with_discretization(nfe_z, nfe_o);
        self
    }

    pub fn with_geometry(mut self, length: f64, diameter: f64) -> Self {
        self.length = length;
        self.diameter = diameter;
        self
    }

    pub fn with_rotational_speed(mut self, w_rpm: f64) -> Self {
        self.w_rpm = w_rpm;
        self
    }

    pub fn with_thetas(mut self, adsorption: f64, desorption: f64) -> Self {
        self.adsorption.theta = adsorption;
        self.desorption.theta = desorption;
        self
    }

    pub fn with_pressure_drop(mut self, has_pressure_drop: bool) -> Self {
        self.adsorption.has_pressure_drop = has_pressure_drop;
        self.desorption.has_pressure_drop = has_pressure_drop;
        self
    }

    pub fn with_tear_passes(mut self, passes: usize) -> Self {
        self.tear_passes = passes;
        self
    }

    /// # Errors
    ///
    /// `Configuration` when the sections overlap on the rotor or the axial
    /// grids differ; the section errors, including `InvalidGrid`, when either
    /// section is invalid.
    pub fn validate(&self) -> Result<()> {
        self.adsorption.validate()?;
        self.desorption.validate()?;
        let total = self.adsorption.theta + self.desorption.theta;
        if total > 1.0 + 1e-12 {
            return Err(RpbError::Configuration(format!(
                "theta_ads + theta_des = {total} exceeds one rotation"
            )));
        }
        if self.adsorption.nfe_z != self.desorption.nfe_z
            || self.adsorption.z_points != self.desorption.z_points
        {
            return Err(RpbError::Configuration(
                "both sections need the same axial grid to close the solid loop".into(),
            ));
        }
        for (name, value) in [("length", self.length), ("diameter", self.diameter), ("w_rpm", self.w_rpm)] {
            if !(value.is_finite() && value > 0.0) {
                return Err(RpbError::Configuration(format!("{name} must be positive, got {value}")));
            }
        }
        Ok(())
    }
}

/// One line of [`SplitReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    pub name: String,
    pub value: f64,
    pub doc: String,
    pub fixed: bool,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

/// Key design and performance variables of the bed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitReport {
    pub rows: Vec<ReportRow>,
}

impl SplitReport {
    fn push(&mut self, registry: &VariableRegistry, id: VarId) {
        let info = registry.info(id);
        self.rows.push(ReportRow {
            name: info.name,
            value: registry.get(id),
            doc: info.doc,
            fixed: info.fixed,
            lower: info.lower,
            upper: info.upper,
        });
    }

    pub fn get(&self, name: &str) -> Option<&ReportRow> {
        self.rows.iter().find(|r| r.name == name)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for SplitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound = |b: Option<f64>| b.map_or_else(|| "-".to_string(), |v| format!("{v:.4}"));
        writeln!(
            f,
            "{:<28} {:>14}  {:<34} {:<6} {:>12} {:>12}",
            "Variable", "Value", "Doc", "Fixed", "Lower Bound", "Upper Bound"
        )?;
        for row in &self.rows {
            writeln!(
                f,
                "{:<28} {:>14.6}  {:<34} {:<6} {:>12} {:>12}",
                row.name,
                row.value,
                row.doc,
                row.fixed,
                bound(row.lower),
                bound(row.upper)
            )?;
        }
        Ok(())
    }
}

/// Adsorption and desorption sections sharing one rotor.
#[derive(Debug, Clone)]
pub struct RotaryPackedBed {
    name: String,
    tear_passes: usize,
    registry: VariableRegistry,
    pub length: Var<Design>,
    pub diameter: Var<Design>,
    pub w_rpm: Var<Design>,
    pub ads: Section,
    pub des: Section,
    /// Sum of both sections' exchanger duties, kW
    pub total_thermal_energy: Var<Derived>,
}

impl RotaryPackedBed {
    /// Builds both sections under `name`, closes the solid loop and adds the
    /// duty total.
    ///
    /// Both sections start with `P_in` and `P_out` fixed and `F_in` free;
    /// a section without pressure drop gets the
    /// [`remove_pressure_drop`](Section::remove_pressure_drop) fixed set.
    ///
    /// # Errors
    ///
    /// `Configuration` for an invalid configuration or a name already in use;
    /// `InvalidGrid` from the section grids.
    pub fn build(model: &mut Model, name: &str, config: &RpbConfig) -> Result<Self> {
        config.validate()?;
        for block in [name.to_string(), format!("{name}.ads"), format!("{name}.des")] {
            if model.has_block(&block) {
                return Err(RpbError::Configuration(format!("block {block} already exists")));
            }
        }
        let registry = model.registry().clone();
        let geometry =
            SharedGeometry::create(&registry, name, config.length, config.diameter, config.w_rpm);

        let mut sections = Vec::with_capacity(2);
        for (suffix, section_config) in [("ads", &config.adsorption), ("des", &config.desorption)] {
            let mut section_config = section_config.clone();
            section_config.length = config.length;
            section_config.diameter = config.diameter;
            section_config.w_rpm = config.w_rpm;
            let section = Section::build_with(
                model,
                &format!("{name}.{suffix}"),
                &section_config,
                Some(geometry.clone()),
                Correlations::from_config(&section_config),
            )?;
            if section_config.has_pressure_drop {
                section.p_out.fix_value(pascal_to_bar(section_config.outlet_pressure));
                section.f_in.unfix();
            } else {
                section.remove_pressure_drop();
            }
            sections.push(section);
        }
        let des = sections.pop().ok_or_else(|| RpbError::Configuration("missing section".into()))?;
        let ads = sections.pop().ok_or_else(|| RpbError::Configuration("missing section".into()))?;

        Self::link_solid_loop(model, name, &ads, &des)?;
        Self::link_solid_loop(model, name, &des, &ads)?;

        let total_thermal_energy = registry
            .create_derived(
                &format!("{name}.total_thermal_energy"),
                ads.q_ghx_tot_kw.get() + des.q_ghx_tot_kw.get(),
                UnitTag::Kilowatt,
            )
            .with_doc("Total heat-exchange duty");
        model.add_equation(
            ResidualFunction::new(
                &format!("{name}.total_thermal_energy_eq"),
                name,
                BalanceKind::Definition,
                vec![total_thermal_energy.id(), ads.q_ghx_tot_kw.id(), des.q_ghx_tot_kw.id()],
                |v: &[Dual64]| v[0] - v[1] - v[2],
            )
            .with_scale(1e-3),
        );

        info!(
            "rotary packed bed {name} built: {} variables, {} equations, {} degrees of freedom",
            registry.len(),
            model.equations().total_equations(),
            model.degrees_of_freedom()
        );

        Ok(RotaryPackedBed {
            name: name.to_string(),
            tear_passes: config.tear_passes,
            registry,
            length: geometry.length,
            diameter: geometry.diameter,
            w_rpm: geometry.w_rpm,
            ads,
            des,
            total_thermal_energy,
        })
    }

    /// `to` solid inlet profiles equal `from` solid outlet profiles.
    fn link_solid_loop(model: &mut Model, block: &str, from: &Section, to: &Section) -> Result<()> {
        let pairs = from
            .solid_outlet_loading()
            .into_iter()
            .zip(to.q_in.iter().map(Var::id))
            .chain(from.solid_outlet_temperature().into_iter().zip(to.ts_in.iter().map(Var::id)));
        let prefix = format!("{block}.");
        for (source, target) in pairs {
            let name = model.registry().name(target);
            let label = name.strip_prefix(&prefix).unwrap_or(&name).to_string();
            link_variables(model, block, &label, source, target)?;
            model.registry().unfix(target);
        }
        Ok(())
    }

    /// Copies `from`'s solid outlet profiles into `to`'s solid inlet variables.
    fn transfer_solid(from: &Section, to: &Section) {
        let registry = from.lambda.registry();
        for (source, target) in from.solid_outlet_loading().into_iter().zip(&to.q_in) {
            target.set(registry.get(source));
        }
        for (source, target) in from.solid_outlet_temperature().into_iter().zip(&to.ts_in) {
            target.set(registry.get(source));
        }
    }

    fn solid_inlets(&self) -> impl Iterator<Item = &Var<Design>> {
        self.ads
            .q_in
            .iter()
            .chain(&self.ads.ts_in)
            .chain(&self.des.q_in)
            .chain(&self.des.ts_in)
    }

    /// Initializes both sections, then solves the coupled bed.
    ///
    /// Each section runs its own continuation with its solid inlet held
    /// fixed (desorption starting from the converged adsorption outlet), the
    /// solid loop is iterated `tear_passes` times by successive substitution,
    /// and finally the solid inlets are released and every equation is solved
    /// together.
    ///
    /// # Errors
    ///
    /// `InitializationDiverged` from a section continuation, `SolveFailed`
    /// from a tear pass or the coupled solve. The caller's fixed set is
    /// restored in every case.
    pub fn initialize(
        &self,
        model: &Model,
        continuation: &Continuation,
        solver: &NewtonRaphson,
    ) -> Result<()> {
        let flags = self.registry.fixed_flags();
        for var in self.solid_inlets() {
            var.fix();
        }

        let staged = self.initialize_sections(model, continuation, solver);
        self.registry.restore_fixed_flags(&flags);
        staged?;

        self.total_thermal_energy
            .set(self.ads.q_ghx_tot_kw.get() + self.des.q_ghx_tot_kw.get());
        let stats = model.solve(solver)?;
        info!(
            "{} initialized: capture {:.4}, duty {:.1} kW, coupled solve {} iterations",
            self.name,
            self.ads.capture(),
            self.total_thermal_energy.get(),
            stats.iterations
        );
        Ok(())
    }

    fn initialize_sections(
        &self,
        model: &Model,
        continuation: &Continuation,
        solver: &NewtonRaphson,
    ) -> Result<()> {
        self.ads.initialize(model, continuation, solver)?;
        Self::transfer_solid(&self.ads, &self.des);
        self.des.initialize(model, continuation, solver)?;

        for pass in 0..self.tear_passes {
            Self::transfer_solid(&self.des, &self.ads);
            self.ads.solve(model, solver)?;
            Self::transfer_solid(&self.ads, &self.des);
            self.des.solve(model, solver)?;
            debug!(
                "{} tear pass {}: ads capture {:.5}, loop residual {:.3e}",
                self.name,
                pass + 1,
                self.ads.capture(),
                self.solid_loop_mismatch()
            );
        }
        Ok(())
    }

    /// Largest difference between an adsorption solid inlet and the
    /// desorption solid outlet it is linked to.
    pub fn solid_loop_mismatch(&self) -> f64 {
        let loading = self
            .des
            .solid_outlet_loading()
            .into_iter()
            .zip(&self.ads.q_in)
            .map(|(id, var)| (self.registry.get(id) - var.get()).abs());
        let temperature = self
            .des
            .solid_outlet_temperature()
            .into_iter()
            .zip(&self.ads.ts_in)
            .map(|(id, var)| (self.registry.get(id) - var.get()).abs() / 100.0);
        loading.chain(temperature).fold(0.0, f64::max)
    }

    /// Fixes `F_in` and `P_in` and frees `P_out` in both sections.
    pub fn remove_pressure_drop(&self) {
        self.ads.remove_pressure_drop();
        self.des.remove_pressure_drop();
    }

    /// Fixes (or frees) the design variables an optimization would move:
    /// `L`, `w_rpm`, the adsorption `theta`, `Tx` and `P_in`, and the
    /// desorption `P_in`, `P_out` and `Tx`.
    pub fn toggle_design_variables(&self, fix: bool) {
        let vars = [
            &self.length,
            &self.w_rpm,
            &self.ads.theta,
            &self.ads.tx,
            &self.ads.p_in,
            &self.des.p_in,
            &self.des.p_out,
            &self.des.tx,
        ];
        for var in vars {
            if fix {
                var.fix();
            } else {
                var.unfix();
            }
        }
    }

    /// Heat removed from the adsorption section, kW.
    pub fn cooling_duty_kw(&self) -> f64 {
        -self.ads.q_ghx_tot_kw.get()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ads_gas_inlet(&self) -> GasPort {
        self.ads.gas_inlet()
    }

    pub fn ads_gas_outlet(&self) -> GasPort {
        self.ads.gas_outlet()
    }

    pub fn des_gas_inlet(&self) -> GasPort {
        self.des.gas_inlet()
    }

    pub fn des_gas_outlet(&self) -> GasPort {
        self.des.gas_outlet()
    }

    /// Value, doc, fixed flag and bounds of the key variables plus the
    /// adsorption inlet and outlet compositions.
    pub fn split_report(&self) -> SplitReport {
        let mut report = SplitReport::default();
        let scalars = [
            self.length.id(),
            self.diameter.id(),
            self.w_rpm.id(),
            self.ads.theta.id(),
            self.des.theta.id(),
            self.ads.p_in.id(),
            self.ads.p_out.id(),
            self.ads.f_in.id(),
            self.ads.tg_in.id(),
            self.ads.tx.id(),
            self.des.p_in.id(),
            self.des.p_out.id(),
            self.des.f_in.id(),
            self.des.tg_in.id(),
            self.des.tx.id(),
            self.ads.co2_capture.id(),
        ];
        for id in scalars {
            report.push(&self.registry, id);
        }
        for var in &self.ads.y_in {
            report.push(&self.registry, var.id());
        }
        for var in &self.ads.y_out {
            report.push(&self.registry, var.id());
        }
        report
    }
}

impl HasPorts for RotaryPackedBed {
    fn input_ports(&self) -> Vec<GasPort> {
        vec![self.ads_gas_inlet(), self.des_gas_inlet()]
    }

    fn output_ports(&self) -> Vec<GasPort> {
        vec![self.ads_gas_outlet(), self.des_gas_outlet()]
    }
}

impl ConservesMass for RotaryPackedBed {
    /// CO2 over both gas streams; the solid term is the net loop uptake,
    /// zero when the loop is closed.
    fn mass_balance(&self) -> MassBalanceSummary {
        let ads = self.ads.mass_balance();
        let des = self.des.mass_balance();
        MassBalanceSummary {
            name: format!("{} CO2", self.name),
            inflow: ads.inflow + des.inflow,
            outflow: ads.outflow + des.outflow,
            uptake: ads.uptake + des.uptake,
        }
    }
}
