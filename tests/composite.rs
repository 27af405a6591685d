//! Coupled adsorption/desorption bed on a coarse grid.

use approx::assert_relative_eq;
use rpb_capture::solvers::continuation::Continuation;
use rpb_capture::{validate_mass_conservation, ConservesMass, HasPorts};

mod common;
use common::{build_bed, coarse_bed, solver};

#[test]
fn test_bed_without_pressure_drop_converges() {
    let (model, rpb) = build_bed(&coarse_bed());
    rpb.remove_pressure_drop();
    let flags = model.registry().fixed_flags();

    rpb.initialize(&model, &Continuation::default(), &solver()).unwrap();
    assert_eq!(model.registry().fixed_flags(), flags);
    assert!(model.residual_norm() < 1e-6);
    assert!(rpb.solid_loop_mismatch() < 1e-6);

    let capture = rpb.ads.capture();
    assert!(capture > 0.0 && capture < 1.0, "capture {capture}");
    assert_relative_eq!(
        rpb.total_thermal_energy.get(),
        rpb.ads.q_ghx_tot_kw.get() + rpb.des.q_ghx_tot_kw.get(),
        max_relative = 1e-6
    );
    assert!(rpb.cooling_duty_kw() > 0.0);

    // At a closed loop the solid returns what it picked up
    validate_mass_conservation(&rpb, 1e-6).unwrap();
    let balance = rpb.mass_balance();
    assert!(balance.uptake.abs() < 1e-4 * balance.inflow);
}

#[test]
fn test_bed_with_outlet_pressure_targets() {
    let (model, rpb) = build_bed(&coarse_bed());
    let p_out = rpb.ads.p_out.get();
    rpb.initialize(&model, &Continuation::default(), &solver()).unwrap();
    assert!(model.residual_norm() < 1e-6);
    assert_relative_eq!(rpb.ads.p_out.get(), p_out, max_relative = 1e-12);
    assert!(rpb.ads.p_out.is_fixed());
    assert!(!rpb.ads.f_in.is_fixed());
    assert!(rpb.ads.f_in.get() > 0.0);
    assert!(rpb.des.f_in.get() > 0.0);
}

#[test]
fn test_report_and_ports_after_solve() {
    let (model, rpb) = build_bed(&coarse_bed());
    rpb.remove_pressure_drop();
    rpb.initialize(&model, &Continuation::default(), &solver()).unwrap();

    let report = rpb.split_report();
    let capture = report.get("rpb.ads.CO2_capture").unwrap();
    assert_eq!(capture.value, rpb.ads.capture());
    assert!(!capture.fixed);

    let outlet = rpb.ads_gas_outlet().read(model.registry());
    let total: f64 = outlet.mole_fractions.iter().map(|(_, y)| y).sum();
    assert!((total - 1.0).abs() < 1e-6);
    assert_eq!(rpb.input_ports().len(), 2);
    assert!(rpb.get_output_port("rpb.des.gas_outlet").is_some());
}
