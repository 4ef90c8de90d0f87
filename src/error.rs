//! Error taxonomy for the simulator.
//!
//! Failures split into two families. Rejections of a proposed firing surface as
//! *null events*: the scheduler counts them, time still advances, and no state
//! mutates. Everything else is a hard error that aborts the simulation.

use thiserror::Error;

/// All failure modes of model construction and simulation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimError {
    /// The model is inconsistent and cannot be prepared or extended.
    #[error("model validation failed: {0}")]
    ModelValidation(String),

    /// A bind targeted a site that already carries a bond.
    #[error("site {site} of molecule {uid} is already occupied")]
    SiteOccupied { uid: u64, site: usize },

    /// An unbind targeted a site with no bond.
    #[error("site {site} of molecule {uid} is not bonded")]
    SiteUnbound { uid: u64, site: usize },

    /// A population decrement would drop the lumped count below zero.
    #[error("population of molecule {uid} cannot drop below zero")]
    PopulationUnderflow { uid: u64 },

    /// A rule that forbids intra-complex binding drew two sites of one complex.
    #[error("rule {rule} rejected a bond within complex {complex}")]
    ComplexMergeForbidden { rule: String, complex: usize },

    /// The same molecule was drawn for more than one reactant slot of a firing.
    #[error("molecule {uid} was drawn for more than one reactant slot")]
    ReactantClash { uid: u64 },

    /// A weight or rate function referenced a name that is not in scope.
    #[error("function referenced unknown name: {0}")]
    LocalFunctionScope(String),

    /// Creating a molecule would exceed the per-type instance cap.
    #[error("molecule limit of {limit} reached for type {type_name}")]
    MoleculeLimit { type_name: String, limit: usize },

    /// A bookkeeping invariant was violated. Always a bug.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl SimError {
    /// True for rejections the scheduler absorbs as null events.
    pub fn is_null_event(&self) -> bool {
        matches!(
            self,
            SimError::SiteOccupied { .. }
                | SimError::SiteUnbound { .. }
                | SimError::PopulationUnderflow { .. }
                | SimError::ComplexMergeForbidden { .. }
                | SimError::ReactantClash { .. }
        )
    }

    /// Exit code a command-line wrapper should report for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            SimError::ModelValidation(_) => 1,
            _ => 2,
        }
    }
}
