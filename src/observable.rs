//! Pattern counters kept incrementally consistent with the molecule graph.
//!
//! Molecules-observables count embeddings rooted at individual molecules and
//! store each molecule's multiplicity next to the molecule, so a local change
//! only costs a local recount. Species-observables count complexes matching a
//! pattern at least once.

use std::collections::HashSet;

use crate::complex::ComplexRegistry;
use crate::molecule::{ComplexId, MolId, MoleculeStore, MoleculeType};
use crate::pattern::Pattern;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObservableKind {
    /// Counts molecule-level matches, with multiplicity.
    Molecules,
    /// Counts distinct complexes matching at least once.
    Species,
}

/// A named pattern counter.
pub struct Observable {
    pub name: String,
    pub kind: ObservableKind,
    pub patterns: Vec<Pattern>,
    pub(crate) count: f64,
    pub(crate) matching_complexes: HashSet<ComplexId>,
}

impl Observable {
    pub fn molecules(name: &str, patterns: Vec<Pattern>) -> Self {
        Observable {
            name: name.to_string(),
            kind: ObservableKind::Molecules,
            patterns,
            count: 0.0,
            matching_complexes: HashSet::new(),
        }
    }

    pub fn species(name: &str, patterns: Vec<Pattern>) -> Self {
        Observable {
            name: name.to_string(),
            kind: ObservableKind::Species,
            patterns,
            count: 0.0,
            matching_complexes: HashSet::new(),
        }
    }

    /// Current on-the-fly value.
    pub fn value(&self) -> f64 {
        self.count
    }

    /// Root-anchored match multiplicity of one molecule across all patterns.
    pub fn multiplicity_of(&self, store: &MoleculeStore, m: MolId) -> i32 {
        self.patterns
            .iter()
            .map(|p| p.match_count_rooted(store, m) as i32)
            .sum()
    }

    /// Match-once test against a complex's membership.
    pub fn complex_matches(&self, store: &MoleculeStore, members: &[MolId]) -> bool {
        self.patterns.iter().any(|p| p.matches_within(store, members))
    }

    /// Record whether a complex currently matches (species kind only).
    pub(crate) fn note_complex(&mut self, cid: ComplexId, matched: bool) {
        let was = self.matching_complexes.contains(&cid);
        match (was, matched) {
            (false, true) => {
                self.matching_complexes.insert(cid);
                self.count += 1.0;
            }
            (true, false) => {
                self.matching_complexes.remove(&cid);
                self.count -= 1.0;
            }
            _ => {}
        }
    }

    /// Drop a freed complex id from the matching set.
    pub(crate) fn forget_complex(&mut self, cid: ComplexId) {
        if self.matching_complexes.remove(&cid) {
            self.count -= 1.0;
        }
    }

    /// Value recomputed from scratch, for consistency checking.
    pub fn recount(
        &self,
        store: &MoleculeStore,
        types: &[MoleculeType],
        complexes: &ComplexRegistry,
    ) -> f64 {
        match self.kind {
            ObservableKind::Molecules => {
                let mut total = 0i64;
                for ty in types {
                    for &m in store.live_of_type(ty.id) {
                        total += i64::from(self.multiplicity_of(store, m));
                    }
                }
                total as f64
            }
            ObservableKind::Species => complexes
                .live()
                .filter(|c| self.complex_matches(store, &c.members))
                .count() as f64,
        }
    }
}
