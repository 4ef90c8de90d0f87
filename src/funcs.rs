//! Parameter and function scopes.
//!
//! Rate expressions and per-match weight functions are caller-supplied
//! closures; the engine only defines the scopes they evaluate against. A
//! global scope sees the parameter table, observable counts, and the clock. A
//! local scope sees one molecule's complex (or just the molecule itself when
//! complex-scoped evaluation is off).

use std::collections::HashMap;

use crate::error::SimError;
use crate::molecule::{MolId, MoleculeStore, MoleculeType};
use crate::observable::Observable;

/// Evaluation scope for observable-dependent rates and global functions.
pub struct GlobalScope<'a> {
    pub(crate) params: &'a HashMap<String, f64>,
    pub(crate) observables: &'a [Observable],
    pub(crate) time: f64,
}

impl<'a> GlobalScope<'a> {
    pub fn param(&self, name: &str) -> Result<f64, SimError> {
        self.params
            .get(name)
            .copied()
            .ok_or_else(|| SimError::LocalFunctionScope(name.to_string()))
    }

    pub fn observable(&self, name: &str) -> Result<f64, SimError> {
        self.observables
            .iter()
            .find(|o| o.name == name)
            .map(|o| o.value())
            .ok_or_else(|| SimError::LocalFunctionScope(name.to_string()))
    }

    pub fn time(&self) -> f64 {
        self.time
    }
}

/// A caller-supplied expression over the global scope.
pub type RateExpr = Box<dyn Fn(&GlobalScope) -> Result<f64, SimError>>;

/// A named global function sampled alongside the observables.
pub struct GlobalFn {
    pub name: String,
    pub expr: RateExpr,
}

/// Evaluation scope for per-match weight functions: the local context of one
/// matched molecule.
pub struct LocalScope<'a> {
    pub(crate) types: &'a [MoleculeType],
    pub(crate) store: &'a MoleculeStore,
    pub(crate) observables: &'a [Observable],
    pub(crate) members: &'a [MolId],
}

impl<'a> LocalScope<'a> {
    /// Summed match multiplicity of a molecules-observable over the scope.
    pub fn count(&self, obs_name: &str) -> Result<f64, SimError> {
        let oi = self
            .observables
            .iter()
            .position(|o| o.name == obs_name)
            .ok_or_else(|| SimError::LocalFunctionScope(obs_name.to_string()))?;
        let mut total = 0i64;
        for &m in self.members {
            let mol = self.store.molecule(m);
            let ty = &self.types[mol.type_id];
            if let Some(k) = ty.mol_obs.iter().position(|&o| o == oi) {
                total += i64::from(mol.obs_mult[k]);
            }
        }
        Ok(total as f64)
    }

    /// Number of scope molecules of one type.
    pub fn molecule_count(&self, type_name: &str) -> Result<f64, SimError> {
        let ty = self
            .types
            .iter()
            .find(|t| t.name == type_name)
            .ok_or_else(|| SimError::LocalFunctionScope(type_name.to_string()))?;
        let n = self
            .members
            .iter()
            .filter(|&&m| self.store.molecule(m).type_id == ty.id)
            .count();
        Ok(n as f64)
    }

    /// Number of molecules in scope.
    pub fn size(&self) -> usize {
        self.members.len()
    }
}

/// A caller-supplied per-match weight function.
pub type WeightFn = Box<dyn Fn(&LocalScope) -> Result<f64, SimError>>;
