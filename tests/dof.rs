//! Degree-of-freedom accounting under the supported fixed sets.

use rpb_capture::models::section::SectionConfig;
use rpb_capture::{BalanceKind, RpbError};

mod common;
use common::{build_bed, build_section, coarse_bed, solver};

#[test]
fn test_default_section_is_square() {
    let config = SectionConfig::adsorption().with_discretization(4, 3);
    let (model, ads) = build_section(&config, "ads");
    assert_eq!(model.degrees_of_freedom(), 0);
    assert_eq!(model.degrees_of_freedom_in(&["ads"]), 0);
    // 7 per node plus feed, outlet flow, outlet CO2, outlet temperature,
    // two remaining outlet fractions, capture, volumes and duty
    let nodes = ads.z_grid().len() * ads.o_grid().len();
    assert_eq!(model.equations().total_equations(), 7 * nodes + 7 + 3);
    assert!(model.unreferenced_free_variables().is_empty());
}

#[test]
fn test_swapping_feed_and_outlet_pressure_keeps_square() {
    let config = SectionConfig::adsorption().with_discretization(4, 3);
    let (model, ads) = build_section(&config, "ads");
    ads.f_in.unfix();
    assert_eq!(model.degrees_of_freedom(), 1);
    ads.p_out.fix();
    assert_eq!(model.degrees_of_freedom(), 0);
}

#[test]
fn test_freeing_design_variables_adds_freedom() {
    let config = SectionConfig::adsorption().with_discretization(3, 3);
    let (model, ads) = build_section(&config, "ads");
    ads.length.unfix();
    ads.tx.unfix();
    assert_eq!(model.degrees_of_freedom(), 2);
    let err = model.solve(&solver()).unwrap_err();
    assert!(matches!(err, RpbError::Configuration(_)));
}

#[test]
fn test_boundary_and_balance_counts() {
    let config = SectionConfig::adsorption().with_discretization(3, 2);
    let (model, _ads) = build_section(&config, "ads");
    let eqs = model.equations();
    assert!(eqs.count("ads", BalanceKind::Boundary) > 0);
    assert!(eqs.count("ads", BalanceKind::Mass) > 0);
    assert!(eqs.count("ads", BalanceKind::Energy) > 0);
    assert!(eqs.count("ads", BalanceKind::Momentum) > 0);
    assert_eq!(eqs.count("ads", BalanceKind::Linking), 0);
}

#[test]
fn test_bed_is_square_in_both_fixed_sets() {
    let (model, rpb) = build_bed(&coarse_bed());
    assert_eq!(model.degrees_of_freedom(), 0);
    assert_eq!(model.degrees_of_freedom_in(&["rpb", "rpb.ads", "rpb.des"]), 0);

    rpb.remove_pressure_drop();
    assert_eq!(model.degrees_of_freedom(), 0);

    rpb.toggle_design_variables(false);
    assert!(model.degrees_of_freedom() > 0);
    rpb.toggle_design_variables(true);
    assert_eq!(model.degrees_of_freedom(), 0);
}

#[test]
fn test_pressure_drop_choice_keeps_equation_count() {
    let (with_dp, _) = build_bed(&coarse_bed());
    let (without_dp, _) = build_bed(&coarse_bed().with_pressure_drop(false));

    assert_eq!(
        with_dp.equations().total_equations(),
        without_dp.equations().total_equations()
    );
    assert_eq!(with_dp.degrees_of_freedom(), 0);
    assert_eq!(without_dp.degrees_of_freedom(), 0);
    assert_eq!(with_dp.registry().len(), without_dp.registry().len());
}
