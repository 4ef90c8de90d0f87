//! Connected-complex tracking.
//!
//! Every live molecule belongs to exactly one complex, and a complex's
//! membership is exactly the set of molecules reachable over bond edges from
//! any member. Binds merge complexes (smaller spliced into larger), unbinds
//! split them when a breadth-first search fails to reconnect the endpoints.
//! Complex ids are recycled through a free queue.

use std::collections::{HashSet, VecDeque};

use crate::error::SimError;
use crate::molecule::{ComplexId, MolId, MoleculeStore, MoleculeType, TypeId};

/// A maximal connected set of bonded molecules.
#[derive(Clone, Debug)]
pub struct Complex {
    pub id: ComplexId,
    pub members: Vec<MolId>,
    alive: bool,
    is_canonical: bool,
    canonical_label: String,
}

impl Complex {
    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Number of member molecules of one type.
    pub fn molecule_count_of_type(&self, store: &MoleculeStore, ty: TypeId) -> usize {
        self.members
            .iter()
            .filter(|&&m| store.molecule(m).type_id == ty)
            .count()
    }
}

/// Produces a deterministic string label equal for isomorphic complexes.
///
/// The simulator treats labeling as an external concern; an exact
/// graph-isomorphism labeler can be plugged in through this trait.
pub trait Canonicalizer {
    fn label(&self, store: &MoleculeStore, types: &[MoleculeType], members: &[MolId]) -> String;
}

/// Built-in fallback labeler based on iterated neighborhood signatures.
///
/// Two refinement rounds over sorted local signatures distinguish complexes
/// that differ anywhere in their molecule types, component states, or bond
/// endpoints. It is not a full isomorphism decision procedure for pathological
/// regular graphs, which is exactly the case an external labeler exists for.
#[derive(Clone, Copy, Debug, Default)]
pub struct SignatureCanonicalizer;

impl SignatureCanonicalizer {
    fn local_signature(store: &MoleculeStore, types: &[MoleculeType], id: MolId) -> String {
        let m = store.molecule(id);
        let ty = &types[m.type_id];
        let mut sig = ty.name.clone();
        for (c, def) in ty.components.iter().enumerate() {
            sig.push('(');
            sig.push_str(&ty.class_names[def.eq_class]);
            if !def.states.is_empty() || def.is_integer {
                sig.push('~');
                match ty.state_name(c, m.states[c]) {
                    Some(name) => sig.push_str(name),
                    None => sig.push_str(&m.states[c].to_string()),
                }
            }
            if let Some(bond) = m.bonds[c] {
                let p = store.molecule(bond.partner);
                let pty = &types[p.type_id];
                sig.push('!');
                sig.push_str(&pty.name);
                sig.push('.');
                sig.push_str(&pty.class_names[pty.components[bond.partner_site].eq_class]);
            }
            sig.push(')');
        }
        sig
    }
}

impl Canonicalizer for SignatureCanonicalizer {
    fn label(&self, store: &MoleculeStore, types: &[MoleculeType], members: &[MolId]) -> String {
        let mut sigs: Vec<(MolId, String)> = members
            .iter()
            .map(|&m| (m, Self::local_signature(store, types, m)))
            .collect();
        // one refinement round: extend each signature with the sorted
        // signatures of its bonded neighbors
        let by_id: std::collections::HashMap<MolId, String> = sigs.iter().cloned().collect();
        for (id, sig) in sigs.iter_mut() {
            let mut neighbor_sigs: Vec<&str> = store
                .molecule(*id)
                .bonds
                .iter()
                .flatten()
                .filter_map(|b| by_id.get(&b.partner).map(|s| s.as_str()))
                .collect();
            neighbor_sigs.sort_unstable();
            sig.push('[');
            sig.push_str(&neighbor_sigs.join(","));
            sig.push(']');
        }
        let mut labels: Vec<String> = sigs.into_iter().map(|(_, s)| s).collect();
        labels.sort_unstable();
        labels.join("|")
    }
}

/// Dense indexed table of complexes plus a queue of reusable ids.
#[derive(Clone, Debug, Default)]
pub struct ComplexRegistry {
    complexes: Vec<Complex>,
    free_ids: VecDeque<ComplexId>,
}

impl ComplexRegistry {
    pub fn new() -> Self {
        ComplexRegistry::default()
    }

    /// Allocate (or reuse) a complex for a newborn free molecule.
    pub fn create(&mut self, store: &mut MoleculeStore, m: MolId) -> ComplexId {
        let id = match self.free_ids.pop_front() {
            Some(id) => {
                let c = &mut self.complexes[id];
                c.members.clear();
                c.members.push(m);
                c.alive = true;
                c.is_canonical = false;
                id
            }
            None => {
                let id = self.complexes.len();
                self.complexes.push(Complex {
                    id,
                    members: vec![m],
                    alive: true,
                    is_canonical: false,
                    canonical_label: String::new(),
                });
                id
            }
        };
        store.molecule_mut(m).complex_id = id;
        id
    }

    pub fn get(&self, id: ComplexId) -> &Complex {
        &self.complexes[id]
    }

    pub fn live(&self) -> impl Iterator<Item = &Complex> {
        self.complexes.iter().filter(|c| c.alive)
    }

    pub fn live_count(&self) -> usize {
        self.complexes.iter().filter(|c| c.alive).count()
    }

    /// Invalidate the cached canonical label after any touching mutation.
    pub fn touch(&mut self, id: ComplexId) {
        self.complexes[id].is_canonical = false;
    }

    /// Merge the complexes of two molecules after a bind. The smaller
    /// membership list is spliced into the larger; the emptied id is recycled.
    /// A no-op when both ends already share a complex.
    pub fn merge(&mut self, store: &mut MoleculeStore, a: MolId, b: MolId) -> ComplexId {
        let ca = store.molecule(a).complex_id;
        let cb = store.molecule(b).complex_id;
        if ca == cb {
            self.touch(ca);
            return ca;
        }
        let (keep, drop) = if self.complexes[ca].size() >= self.complexes[cb].size() {
            (ca, cb)
        } else {
            (cb, ca)
        };
        let migrated = std::mem::take(&mut self.complexes[drop].members);
        for &m in &migrated {
            store.molecule_mut(m).complex_id = keep;
        }
        self.complexes[keep].members.extend(migrated);
        self.complexes[drop].alive = false;
        self.free_ids.push_back(drop);
        self.touch(keep);
        keep
    }

    /// After the bond between `a` and `b` was removed, decide whether the
    /// complex split. Returns the id of the new fragment, if any.
    pub fn split_after_unbind(
        &mut self,
        store: &mut MoleculeStore,
        a: MolId,
        b: MolId,
    ) -> Option<ComplexId> {
        let cid = store.molecule(a).complex_id;
        self.touch(cid);
        let reachable: HashSet<MolId> =
            store.bonded_neighborhood(a, None).into_iter().collect();
        if reachable.contains(&b) {
            return None;
        }
        // b's side is a fresh complex now
        let fragment = store.bonded_neighborhood(b, None);
        let new_id = self.create(store, fragment[0]);
        for &m in &fragment[1..] {
            store.molecule_mut(m).complex_id = new_id;
        }
        self.complexes[new_id].members = fragment;
        self.complexes[cid]
            .members
            .retain(|m| reachable.contains(m));
        Some(new_id)
    }

    /// Drop a molecule from its complex ahead of its removal. Frees the
    /// complex when it empties. The molecule must already be unbonded.
    pub fn remove_member(&mut self, store: &MoleculeStore, m: MolId) -> ComplexId {
        let cid = store.molecule(m).complex_id;
        let c = &mut self.complexes[cid];
        c.members.retain(|&x| x != m);
        c.is_canonical = false;
        if c.members.is_empty() {
            c.alive = false;
            self.free_ids.push_back(cid);
        }
        cid
    }

    /// Canonical label of a complex, computed lazily and cached until the next
    /// touching mutation.
    pub fn canonical_label(
        &mut self,
        id: ComplexId,
        store: &MoleculeStore,
        types: &[MoleculeType],
        canon: &dyn Canonicalizer,
    ) -> &str {
        let needs = !self.complexes[id].is_canonical;
        if needs {
            let label = canon.label(store, types, &self.complexes[id].members);
            let c = &mut self.complexes[id];
            c.canonical_label = label;
            c.is_canonical = true;
        }
        &self.complexes[id].canonical_label
    }

    /// Verify that the complex partition equals bond reachability.
    pub fn check_partition(&self, store: &MoleculeStore, types: &[MoleculeType]) -> Result<(), SimError> {
        for ty in types {
            for &m in store.live_of_type(ty.id) {
                let cid = store.molecule(m).complex_id;
                let c = &self.complexes[cid];
                if !c.alive || !c.members.contains(&m) {
                    return Err(SimError::Internal(format!(
                        "molecule {} not listed in its complex {}",
                        store.molecule(m).unique_id,
                        cid
                    )));
                }
                let reachable: HashSet<MolId> =
                    store.bonded_neighborhood(m, None).into_iter().collect();
                let members: HashSet<MolId> = c.members.iter().copied().collect();
                if reachable != members {
                    return Err(SimError::Internal(format!(
                        "complex {} membership diverged from bond reachability",
                        cid
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::molecule::MoleculeTypeDef;

    fn two_site_setup() -> (Vec<MoleculeType>, MoleculeStore, ComplexRegistry) {
        let ty = MoleculeTypeDef::new("A")
            .site("l")
            .site("r")
            .compile(0)
            .unwrap();
        let mut store = MoleculeStore::new();
        store.register_type();
        (vec![ty], store, ComplexRegistry::new())
    }

    #[test]
    fn test_merge_splices_smaller_into_larger() {
        let (types, mut store, mut reg) = two_site_setup();
        let mols: Vec<MolId> = (0..3)
            .map(|_| {
                let m = store.create(&types[0]).unwrap();
                reg.create(&mut store, m);
                m
            })
            .collect();
        store.set_bond(mols[0], 1, mols[1], 0).unwrap();
        let pair = reg.merge(&mut store, mols[0], mols[1]);
        assert_eq!(reg.get(pair).size(), 2);
        store.set_bond(mols[1], 1, mols[2], 0).unwrap();
        let all = reg.merge(&mut store, mols[1], mols[2]);
        // the singleton migrated into the pair's complex
        assert_eq!(all, pair);
        assert_eq!(reg.get(all).size(), 3);
        assert_eq!(reg.live_count(), 1);
        for &m in &mols {
            assert_eq!(store.molecule(m).complex_id, all);
        }
    }

    #[test]
    fn test_unbind_splits_and_recycles_ids() {
        let (types, mut store, mut reg) = two_site_setup();
        let a = store.create(&types[0]).unwrap();
        let b = store.create(&types[0]).unwrap();
        reg.create(&mut store, a);
        reg.create(&mut store, b);
        store.set_bond(a, 1, b, 0).unwrap();
        let merged = reg.merge(&mut store, a, b);
        store.clear_bond(a, 1).unwrap();
        let fresh = reg.split_after_unbind(&mut store, a, b).unwrap();
        assert_ne!(store.molecule(a).complex_id, store.molecule(b).complex_id);
        assert_eq!(store.molecule(b).complex_id, fresh);
        assert_eq!(reg.get(merged).size(), 1);
        assert_eq!(reg.get(fresh).size(), 1);
        reg.check_partition(&store, &types).unwrap();
    }

    #[test]
    fn test_ring_unbind_does_not_split() {
        let (types, mut store, mut reg) = two_site_setup();
        let mols: Vec<MolId> = (0..3)
            .map(|_| {
                let m = store.create(&types[0]).unwrap();
                reg.create(&mut store, m);
                m
            })
            .collect();
        for i in 0..3 {
            store.set_bond(mols[i], 1, mols[(i + 1) % 3], 0).unwrap();
            reg.merge(&mut store, mols[i], mols[(i + 1) % 3]);
        }
        // breaking one edge of the triangle leaves everything connected
        store.clear_bond(mols[0], 1).unwrap();
        assert!(reg.split_after_unbind(&mut store, mols[0], mols[1]).is_none());
        reg.check_partition(&store, &types).unwrap();
    }

    #[test]
    fn test_canonical_label_cached_and_invalidated() {
        let (types, mut store, mut reg) = two_site_setup();
        let a = store.create(&types[0]).unwrap();
        let b = store.create(&types[0]).unwrap();
        reg.create(&mut store, a);
        reg.create(&mut store, b);
        let canon = SignatureCanonicalizer;
        let la = reg
            .canonical_label(store.molecule(a).complex_id, &store, &types, &canon)
            .to_string();
        let lb = reg
            .canonical_label(store.molecule(b).complex_id, &store, &types, &canon)
            .to_string();
        // identical free molecules share a species label
        assert_eq!(la, lb);
        store.set_bond(a, 1, b, 0).unwrap();
        let cid = reg.merge(&mut store, a, b);
        let bound = reg.canonical_label(cid, &store, &types, &canon).to_string();
        assert_ne!(bound, la);
    }
}
