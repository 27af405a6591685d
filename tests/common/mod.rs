//! Shared builders for the integration tests.

#![allow(dead_code)]

use rpb_capture::models::rotary_packed_bed::{RotaryPackedBed, RpbConfig};
use rpb_capture::models::section::{Section, SectionConfig};
use rpb_capture::solvers::continuation::{Continuation, ContinuationReport};
use rpb_capture::{Model, NewtonRaphson, SolverConfig};

pub fn solver() -> NewtonRaphson {
    NewtonRaphson::from_config(&SolverConfig::default().with_max_iterations(80))
}

pub fn build_section(config: &SectionConfig, name: &str) -> (Model, Section) {
    let mut model = Model::new();
    let section = Section::build(&mut model, name, config).expect("section builds");
    (model, section)
}

/// Builds and initializes one section with the default continuation.
pub fn initialized_section(
    config: &SectionConfig,
    name: &str,
) -> (Model, Section, ContinuationReport) {
    let (model, section) = build_section(config, name);
    let report = section
        .initialize(&model, &Continuation::default(), &solver())
        .expect("section initializes");
    (model, section, report)
}

pub fn coarse_bed() -> RpbConfig {
    RpbConfig::default().with_discretization(3, 3)
}

pub fn build_bed(config: &RpbConfig) -> (Model, RotaryPackedBed) {
    let mut model = Model::new();
    let rpb = RotaryPackedBed::build(&mut model, "rpb", config).expect("bed builds");
    (model, rpb)
}

/// Asserts `|a - b| <= tol * max(|a|, |b|, 1)`.
pub fn assert_close(a: f64, b: f64, tol: f64, message: &str) {
    let scale = a.abs().max(b.abs()).max(1.0);
    assert!(
        (a - b).abs() <= tol * scale,
        "{message}: {a} and {b} differ by more than {tol} (relative)"
    );
}
