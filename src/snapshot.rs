//! Saving and restoring a converged model state.
//!
//! A [`Snapshot`] maps every variable path name to its value, fixed flag,
//! bounds and unit. Loading matches by name, so a snapshot taken from one
//! build can warm-start another build of the same flowsheet.

use std::collections::BTreeMap;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::units::{check_same_unit, UnitTag};
use crate::{Model, VarId};

/// Stored state of one variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableState {
    pub value: f64,
    pub fixed: bool,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub unit: UnitTag,
}

/// Variable states keyed by path name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub variables: BTreeMap<String, VariableState>,
}

impl Snapshot {
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&VariableState> {
        self.variables.get(name)
    }
}

impl Model {
    /// Captures every registered variable.
    pub fn snapshot(&self) -> Snapshot {
        let registry = self.registry();
        let variables = (0..registry.len())
            .map(|i| {
                let info = registry.info(VarId(i));
                let state = VariableState {
                    value: registry.get(VarId(i)),
                    fixed: info.fixed,
                    lower: info.lower,
                    upper: info.upper,
                    unit: info.unit,
                };
                (info.name, state)
            })
            .collect();
        Snapshot { variables }
    }

    /// Applies `snapshot` to the variables of this model with matching names
    /// and returns how many were loaded.
    ///
    /// Names the model does not know are skipped with a warning.
    ///
    /// # Errors
    ///
    /// `UnitConsistency` when a stored unit differs from the registered one;
    /// nothing is written in that case.
    pub fn load_snapshot(&self, snapshot: &Snapshot) -> Result<usize> {
        let registry = self.registry();
        let mut matched = Vec::with_capacity(snapshot.len());
        for (name, state) in &snapshot.variables {
            match registry.find(name) {
                Some(id) => {
                    check_same_unit(name, registry.unit(id), state.unit)?;
                    matched.push((id, state));
                }
                None => warn!("snapshot variable {name} is not part of the model; skipped"),
            }
        }

        for (id, state) in &matched {
            registry.set(*id, state.value);
            registry.set_bounds(*id, state.lower, state.upper);
            if state.fixed {
                registry.fix(*id);
            } else {
                registry.unfix(*id);
            }
        }
        info!("loaded {} of {} snapshot variables", matched.len(), snapshot.len());
        Ok(matched.len())
    }
}
