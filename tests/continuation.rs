//! Continuation initialization of a single section.

use rpb_capture::models::section::SectionConfig;
use rpb_capture::solvers::continuation::Continuation;
use rpb_capture::{NewtonRaphson, RpbError};

mod common;
use common::{build_section, solver};

#[test]
fn test_points_are_visited_in_order_and_chained() {
    let config = SectionConfig::adsorption().with_discretization(4, 4);
    let (model, ads) = build_section(&config, "ads");
    let continuation = Continuation::default();
    let report = ads.initialize(&model, &continuation, &solver()).unwrap();

    let points: Vec<f64> = report.steps.iter().map(|s| s.point).collect();
    assert!(points.windows(2).all(|w| w[0] < w[1]));
    for point in continuation.points() {
        assert!(points.contains(point), "configured point {point} skipped");
    }
    for pair in report.steps.windows(2) {
        assert_eq!(pair[1].initial_guess, pair[0].solution);
    }
    for step in &report.steps {
        assert!(step.residual_norm < 1e-8);
    }
}

#[test]
fn test_lambda_zero_state_is_exact() {
    let config = SectionConfig::adsorption().with_discretization(4, 4);
    let (model, ads) = build_section(&config, "ads");
    ads.lambda.set(0.0);
    ads.set_trivial_state();
    assert!(model.residual_norm() < 1e-10);
}

#[test]
fn test_failure_restores_fixed_set_and_reports_point() {
    let config = SectionConfig::adsorption().with_discretization(3, 3);
    let (model, ads) = build_section(&config, "ads");
    let flags = model.registry().fixed_flags();

    // A zero tolerance can never be met
    let hopeless = NewtonRaphson::new(0.0, 3);
    let continuation = Continuation::default().with_refinements(0);
    let err = ads.initialize(&model, &continuation, &hopeless).unwrap_err();
    match err {
        RpbError::InitializationDiverged { attempted, last_converged, state, .. } => {
            assert_eq!(attempted, 1e-5);
            assert_eq!(last_converged, None);
            assert_eq!(state.len(), model.registry().len());
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(model.registry().fixed_flags(), flags);
    assert_eq!(ads.lambda.get(), 1.0);
}

#[test]
fn test_outlet_pressure_target_is_met() {
    let config = SectionConfig::adsorption().with_discretization(4, 4);
    let (model, ads) = build_section(&config, "ads");
    ads.f_in.unfix();
    ads.p_out.fix_value(1.3);

    ads.initialize(&model, &Continuation::default(), &solver()).unwrap();
    assert!((ads.p_out.get() - 1.3).abs() < 1e-12);
    assert!(ads.p_out.is_fixed());
    assert!(!ads.f_in.is_fixed());
    assert!(ads.f_in.get() > 0.0);
    assert!(model.residual_norm() < 1e-6);
}

#[test]
fn test_outlet_pressure_above_inlet_rejected() {
    let config = SectionConfig::adsorption().with_discretization(3, 3);
    let (model, ads) = build_section(&config, "ads");
    ads.f_in.unfix();
    ads.p_out.fix_value(2.0);
    let flags = model.registry().fixed_flags();
    let err = ads.initialize(&model, &Continuation::default(), &solver()).unwrap_err();
    assert!(matches!(err, RpbError::Configuration(_)));
    assert_eq!(model.registry().fixed_flags(), flags);
}
