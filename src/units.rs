//! Unit tags for registry variables and conversion of dimensioned inputs.
//!
//! The numeric model works in a fixed set of units (bar, K, m, mol/s, ...).
//! Callers hand in `uom` quantities; they are converted here, once, at
//! assembly time, and the solver only ever sees raw `f64` values.

use serde::{Deserialize, Serialize};
use uom::si::angular_velocity::revolution_per_minute;
use uom::si::f64::{AngularVelocity, Length, Power, Pressure, ThermodynamicTemperature, Volume};
use uom::si::length::meter;
use uom::si::power::kilowatt;
use uom::si::pressure::bar;
use uom::si::thermodynamic_temperature::kelvin;
use uom::si::volume::cubic_meter;

use crate::error::{Result, RpbError};

/// Unit a registry variable is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitTag {
    Dimensionless,
    Bar,
    BarPerMeter,
    Kelvin,
    Meter,
    MeterPerSecond,
    MolPerSecond,
    MolPerKilogram,
    RevolutionsPerMinute,
    CubicMeter,
    Kilowatt,
}

impl UnitTag {
    /// Short symbol used in reports.
    pub fn symbol(&self) -> &'static str {
        match self {
            UnitTag::Dimensionless => "-",
            UnitTag::Bar => "bar",
            UnitTag::BarPerMeter => "bar/m",
            UnitTag::Kelvin => "K",
            UnitTag::Meter => "m",
            UnitTag::MeterPerSecond => "m/s",
            UnitTag::MolPerSecond => "mol/s",
            UnitTag::MolPerKilogram => "mol/kg",
            UnitTag::RevolutionsPerMinute => "rev/min",
            UnitTag::CubicMeter => "m^3",
            UnitTag::Kilowatt => "kW",
        }
    }
}

impl std::fmt::Display for UnitTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.symbol())
    }
}

/// A dimensioned value supplied by a caller.
///
/// Quantities `uom` knows about are carried as `uom` types; the remaining
/// model units (molar flow, loading, mole fractions) are carried with an
/// explicit tag.
#[derive(Debug, Clone, Copy)]
pub enum Quantity {
    Pressure(Pressure),
    Temperature(ThermodynamicTemperature),
    Length(Length),
    RotationalSpeed(AngularVelocity),
    Volume(Volume),
    Power(Power),
    Tagged(f64, UnitTag),
}

impl Quantity {
    /// Unit family of this quantity, expressed as the model's tag for it.
    pub fn unit(&self) -> UnitTag {
        match self {
            Quantity::Pressure(_) => UnitTag::Bar,
            Quantity::Temperature(_) => UnitTag::Kelvin,
            Quantity::Length(_) => UnitTag::Meter,
            Quantity::RotationalSpeed(_) => UnitTag::RevolutionsPerMinute,
            Quantity::Volume(_) => UnitTag::CubicMeter,
            Quantity::Power(_) => UnitTag::Kilowatt,
            Quantity::Tagged(_, tag) => *tag,
        }
    }

    /// Converts into the model value for a variable tagged `target`.
    ///
    /// # Errors
    ///
    /// `UnitConsistency` when the quantity's dimension differs from `target`.
    pub fn to_model(&self, target: UnitTag, context: &str) -> Result<f64> {
        let value = match (self, target) {
            (Quantity::Pressure(p), UnitTag::Bar) => p.get::<bar>(),
            (Quantity::Temperature(t), UnitTag::Kelvin) => t.get::<kelvin>(),
            (Quantity::Length(l), UnitTag::Meter) => l.get::<meter>(),
            (Quantity::RotationalSpeed(w), UnitTag::RevolutionsPerMinute) => {
                w.get::<revolution_per_minute>()
            }
            (Quantity::Volume(v), UnitTag::CubicMeter) => v.get::<cubic_meter>(),
            (Quantity::Power(p), UnitTag::Kilowatt) => p.get::<kilowatt>(),
            (Quantity::Tagged(v, tag), target) if *tag == target => *v,
            _ => {
                return Err(RpbError::UnitConsistency {
                    context: context.to_string(),
                    expected: target.to_string(),
                    found: self.unit().to_string(),
                });
            }
        };
        Ok(value)
    }
}

/// Pressure in Pa to model bar.
pub fn pascal_to_bar(pa: f64) -> f64 {
    use uom::si::pressure::pascal;
    Pressure::new::<pascal>(pa).get::<bar>()
}

/// Checks that both sides of an equality relation share a unit.
pub fn check_same_unit(context: &str, left: UnitTag, right: UnitTag) -> Result<()> {
    if left == right {
        Ok(())
    } else {
        Err(RpbError::UnitConsistency {
            context: context.to_string(),
            expected: left.to_string(),
            found: right.to_string(),
        })
    }
}
