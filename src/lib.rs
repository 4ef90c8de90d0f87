//! Network-free stochastic simulation of rule-based molecular models.
//!
//! Species are never enumerated up front. Molecules are typed nodes with
//! named sites; bonds connect sites into complexes; reactions are
//! pattern-matching rewrite rules fired with Gillespie timing. The engine
//! keeps all bookkeeping incremental: pattern matches live in per-rule
//! reactant lists, complexes track connectivity through merges and splits,
//! and observables update with the molecules they touch.
//!
//! The main entry point is [`Simulation`]: register molecule types, rules,
//! and observables, call [`Simulation::prepare_for_simulation`], then drive
//! the trajectory with [`Simulation::sim`] or [`Simulation::step_to`].
//! Independent replicas run in parallel through [`ensemble`].

pub mod complex;
pub mod ensemble;
pub mod error;
pub mod funcs;
pub mod molecule;
pub mod observable;
pub mod output;
pub mod pattern;
pub mod reactant;
pub mod rule;
pub mod system;
pub mod transform;

pub use complex::{Canonicalizer, Complex, ComplexRegistry, SignatureCanonicalizer};
pub use ensemble::{ensemble_mean, run_trajectories, Trajectory};
pub use error::SimError;
pub use funcs::{GlobalScope, LocalScope, RateExpr, WeightFn};
pub use molecule::{
    ComplexId, MolId, Molecule, MoleculeStore, MoleculeType, MoleculeTypeDef, TypeId,
};
pub use observable::{Observable, ObservableKind};
pub use output::{
    write_firing_log, write_index_tables, write_trace, write_trace_binary, FiringRecord,
    SampleRow,
};
pub use pattern::{MappingSet, Pattern, PatternBuilder};
pub use reactant::ReactantList;
pub use rule::{RateDef, ReactionRule, RuleDef};
pub use system::{Simulation, StepOutcome};
pub use transform::TransformDef;
