//! Rotary packed bed models.
//!
//! - [`section::Section`]: one adsorption or desorption sector, discretized
//!   along the bed (`z`) and the rotation (`o`)
//! - [`rotary_packed_bed::RotaryPackedBed`]: both sectors on one rotor with
//!   the solid loop closed between them
//! - [`properties`]: isotherm, kinetics and pressure-drop correlations used
//!   by the section equations
//!
//! ## Example
//!
//! ```no_run
//! use rpb_capture::models::section::{Section, SectionConfig};
//! use rpb_capture::solvers::continuation::Continuation;
//! use rpb_capture::{Model, NewtonRaphson};
//!
//! let mut model = Model::new();
//! let config = SectionConfig::adsorption().with_discretization(6, 6);
//! let ads = Section::build(&mut model, "ads", &config)?;
//! ads.initialize(&model, &Continuation::default(), &NewtonRaphson::default())?;
//! println!("capture {:.3}", ads.capture());
//! # Ok::<(), rpb_capture::RpbError>(())
//! ```

pub mod properties;
pub mod rotary_packed_bed;
pub mod section;
