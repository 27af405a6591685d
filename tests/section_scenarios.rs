//! End-to-end solves of single adsorption and desorption sections.

use approx::assert_relative_eq;
use rpb_capture::models::section::{FlowDirection, SectionConfig};
use rpb_capture::{
    validate_energy_conservation, validate_mass_conservation, ConservesMass, Quantity,
};
use uom::si::f64::ThermodynamicTemperature;
use uom::si::thermodynamic_temperature::kelvin;

mod common;
use common::{assert_close, initialized_section, solver};

#[test]
fn test_adsorption_ten_by_ten() {
    let config = SectionConfig::adsorption().with_discretization(10, 10);
    let (model, ads, report) = initialized_section(&config, "ads");

    assert_eq!(report.last_point(), Some(1.0));
    assert_eq!(ads.lambda.get(), 1.0);
    assert!(model.residual_norm() < 1e-6);

    let capture = ads.capture();
    assert!(capture > 0.0 && capture < 1.0, "capture {capture}");
    assert!(ads.bound_violations(1e-6).is_empty());

    validate_mass_conservation(&ads, 1e-6).unwrap();
    validate_energy_conservation(&ads, 1e-6).unwrap();
    assert!(ads.mass_balance().uptake > 0.0);

    // F_in fixed, P_out follows from the pressure drop
    assert!(ads.f_in.is_fixed());
    assert!(!ads.p_out.is_fixed());
    assert!(ads.p_out.get() < ads.p_in.get());
    assert!(ads.pressure_change() < 0.0);

    // Cold exchanger fluid removes heat
    assert!(ads.q_ghx_tot_kw.get() < 0.0);
}

#[test]
fn test_resolve_of_converged_section_takes_no_iterations() {
    let config = SectionConfig::adsorption().with_discretization(6, 6);
    let (model, ads, _) = initialized_section(&config, "ads");
    let stats = ads.solve(&model, &solver()).unwrap();
    assert_eq!(stats.iterations, 0);
    let stats = model.solve(&solver()).unwrap();
    assert_eq!(stats.iterations, 0);
}

#[test]
fn test_without_pressure_drop_pressure_is_uniform() {
    let config = SectionConfig::adsorption()
        .with_discretization(6, 6)
        .with_pressure_drop(false);
    let (model, ads, _) = initialized_section(&config, "ads");
    assert!(model.residual_norm() < 1e-6);
    assert_relative_eq!(ads.p_out.get(), ads.p_in.get(), max_relative = 1e-9);
    for i in 0..ads.z_grid().len() {
        for k in 0..ads.o_grid().len() {
            assert_relative_eq!(ads.p.get(i, k), ads.p_in.get(), max_relative = 1e-9);
            assert!(ads.dpdz.get(i, k).abs() < 1e-9);
        }
    }
    validate_mass_conservation(&ads, 1e-6).unwrap();
}

#[test]
fn test_desorption_releases_co2() {
    let config = SectionConfig::desorption().with_discretization(6, 6);
    let (model, des, _) = initialized_section(&config, "des");
    assert!(model.residual_norm() < 1e-6);
    assert_eq!(des.config().gas_flow_direction, FlowDirection::Reverse);

    let balance = des.mass_balance();
    assert!(balance.uptake < 0.0);
    assert!(balance.outflow > balance.inflow);
    assert!(des.capture() < 0.0);
    validate_mass_conservation(&des, 1e-6).unwrap();
    validate_energy_conservation(&des, 1e-6).unwrap();

    // Hot exchanger fluid supplies heat
    assert!(des.q_ghx_tot_kw.get() > 0.0);

    // Gas enters at z = 1
    let inlet = des.z_grid().len() - 1;
    let y_in = des.y_in[1].get();
    for k in 0..des.o_grid().len() {
        assert!((des.y.get(inlet, k) - y_in).abs() < 1e-9);
        assert_close(des.tg.get(inlet, k), des.tg_in.get(), 1e-9, "inlet gas temperature");
    }
}

#[test]
fn test_desorption_initializes_on_default_grid() {
    let (model, des, report) = initialized_section(&SectionConfig::desorption(), "des");
    assert_eq!(report.last_point(), Some(1.0));
    assert_eq!(des.lambda.get(), 1.0);
    assert!(model.residual_norm() < 1e-6);
    assert!(des.capture() < 0.0);
    // the sweep leaves richer in CO2 than it entered
    assert!(des.y_out[1].get() > des.y_in[1].get());
}

#[test]
fn test_design_change_with_units_then_resolve() {
    let config = SectionConfig::adsorption().with_discretization(5, 5);
    let (model, ads, _) = initialized_section(&config, "ads");

    ads.tx
        .fix_at(Quantity::Temperature(ThermodynamicTemperature::new::<kelvin>(303.0)))
        .unwrap();
    assert_eq!(ads.tx.get(), 303.0);
    model.solve(&solver()).unwrap();
    assert!(model.residual_norm() < 1e-6);
    assert!(ads.capture() > 0.0 && ads.capture() < 1.0);
}

#[test]
fn test_snapshot_warm_starts_a_fresh_build() {
    let config = SectionConfig::adsorption().with_discretization(4, 4);
    let (model, _ads, _) = initialized_section(&config, "ads");
    let json = model.snapshot().to_json_string().unwrap();

    let (fresh, ads) = common::build_section(&config, "ads");
    let snapshot = rpb_capture::Snapshot::from_json_str(&json).unwrap();
    assert_eq!(fresh.load_snapshot(&snapshot).unwrap(), fresh.registry().len());
    assert!(fresh.residual_norm() < 1e-6);
    let stats = ads.solve(&fresh, &solver()).unwrap();
    assert_eq!(stats.iterations, 0);
}
