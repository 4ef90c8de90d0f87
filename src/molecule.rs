//! Molecule types, molecule instances, and the arena they live in.
//!
//! Molecules reference each other (bonds) and their complexes, so everything is
//! stored in a slot arena and addressed by stable integer handles. A handle
//! stays valid while the molecule is alive; slots of removed molecules are
//! recycled through a free list.

use std::collections::{BTreeSet, HashSet, VecDeque};

use crate::error::SimError;

/// Index into the molecule-type registry.
pub type TypeId = usize;
/// Slot of a molecule in the arena.
pub type MolId = usize;
/// Slot of a complex in the complex registry.
pub type ComplexId = usize;

/// Default cap on live instances of any one molecule type.
pub const DEFAULT_MOLECULE_LIMIT: usize = 100_000;

const NO_COMPLEX: ComplexId = usize::MAX;

/// One component of a molecule type: a named site with discrete states and an
/// optional bond.
#[derive(Clone, Debug)]
pub struct ComponentDef {
    /// Expanded name. Symmetric copies of a declared site `a` become `a1`,
    /// `a2`, ... while a unique site keeps its declared name.
    pub name: String,
    /// Allowed state names. Empty for stateless and integer-valued components.
    pub states: Vec<String>,
    /// State index a fresh molecule starts in.
    pub default_state: i64,
    /// True if the component holds an unbounded integer instead of a named state.
    pub is_integer: bool,
    /// Equivalence class this component belongs to.
    pub eq_class: usize,
}

/// A (rule, reactant position) pair a molecule type can participate in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuleSlot {
    pub rule: usize,
    pub pos: usize,
}

/// Declarative description of a molecule type, consumed by
/// [`crate::Simulation::add_molecule_type`].
#[derive(Clone, Debug, Default)]
pub struct MoleculeTypeDef {
    pub name: String,
    components: Vec<(String, usize, Vec<String>, bool)>,
    population: bool,
}

impl MoleculeTypeDef {
    pub fn new(name: &str) -> Self {
        MoleculeTypeDef {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Add a single stateless binding site.
    pub fn site(mut self, name: &str) -> Self {
        self.components.push((name.to_string(), 1, Vec::new(), false));
        self
    }

    /// Add `copies` interchangeable stateless sites sharing one name.
    pub fn sites(mut self, name: &str, copies: usize) -> Self {
        self.components.push((name.to_string(), copies, Vec::new(), false));
        self
    }

    /// Add a site with named states; the first listed state is the default.
    pub fn site_with_states(mut self, name: &str, states: &[&str]) -> Self {
        let states = states.iter().map(|s| s.to_string()).collect();
        self.components.push((name.to_string(), 1, states, false));
        self
    }

    /// Add `copies` interchangeable sites with named states.
    pub fn sites_with_states(mut self, name: &str, copies: usize, states: &[&str]) -> Self {
        let states = states.iter().map(|s| s.to_string()).collect();
        self.components.push((name.to_string(), copies, states, false));
        self
    }

    /// Add an integer-valued component (counter site).
    pub fn integer_site(mut self, name: &str) -> Self {
        self.components.push((name.to_string(), 1, Vec::new(), true));
        self
    }

    /// Mark the type as a lumped population species.
    pub fn population(mut self) -> Self {
        self.population = true;
        self
    }

    pub(crate) fn compile(self, id: TypeId) -> Result<MoleculeType, SimError> {
        if self.name.is_empty() {
            return Err(SimError::ModelValidation(
                "molecule type needs a non-empty name".to_string(),
            ));
        }
        let mut components = Vec::new();
        let mut eq_classes = Vec::new();
        let mut class_names = Vec::new();
        for (name, copies, states, is_integer) in &self.components {
            if *copies == 0 {
                return Err(SimError::ModelValidation(format!(
                    "site {} of {} declared with zero copies",
                    name, self.name
                )));
            }
            if class_names.contains(name) {
                return Err(SimError::ModelValidation(format!(
                    "duplicate site name {} on type {}",
                    name, self.name
                )));
            }
            let class = eq_classes.len();
            class_names.push(name.clone());
            let mut members = Vec::new();
            for copy in 0..*copies {
                let expanded = if *copies == 1 {
                    name.clone()
                } else {
                    format!("{}{}", name, copy + 1)
                };
                members.push(components.len());
                components.push(ComponentDef {
                    name: expanded,
                    states: states.clone(),
                    default_state: 0,
                    is_integer: *is_integer,
                    eq_class: class,
                });
            }
            eq_classes.push(members);
        }
        Ok(MoleculeType {
            id,
            name: self.name,
            components,
            eq_classes,
            class_names,
            population_type: self.population,
            rxn_slots: Vec::new(),
            mol_obs: Vec::new(),
        })
    }
}

/// A registered molecule type. Immutable after registration except for the
/// bookkeeping lists filled in during preparation.
#[derive(Clone, Debug)]
pub struct MoleculeType {
    pub id: TypeId,
    pub name: String,
    pub components: Vec<ComponentDef>,
    /// Equivalence class index -> expanded component indices.
    pub eq_classes: Vec<Vec<usize>>,
    /// Declared name of each equivalence class.
    pub class_names: Vec<String>,
    pub population_type: bool,
    /// Rule slots whose templates involve this type. Filled at preparation.
    pub rxn_slots: Vec<RuleSlot>,
    /// Molecules-observables whose root pattern node has this type.
    pub mol_obs: Vec<usize>,
}

impl MoleculeType {
    /// Resolve an exact expanded component name (`a2`).
    pub fn component_index(&self, name: &str) -> Option<usize> {
        self.components.iter().position(|c| c.name == name)
    }

    /// Resolve a declared site name (`a`) to its equivalence class.
    pub fn class_index(&self, name: &str) -> Option<usize> {
        self.class_names.iter().position(|c| c == name)
    }

    /// Candidate concrete components for a site name: the whole equivalence
    /// class for a declared name, or a single component for an expanded name.
    pub fn resolve_site(&self, name: &str) -> Option<Vec<usize>> {
        if let Some(class) = self.class_index(name) {
            return Some(self.eq_classes[class].clone());
        }
        self.component_index(name).map(|c| vec![c])
    }

    /// Translate a state name on a component to its stored value.
    pub fn state_value(&self, comp: usize, state: &str) -> Result<i64, SimError> {
        let def = &self.components[comp];
        def.states
            .iter()
            .position(|s| s == state)
            .map(|v| v as i64)
            .ok_or_else(|| {
                SimError::ModelValidation(format!(
                    "type {} has no state {} on site {}",
                    self.name, state, def.name
                ))
            })
    }

    /// Name of a stored state value, if the component has named states.
    pub fn state_name(&self, comp: usize, value: i64) -> Option<&str> {
        self.components[comp]
            .states
            .get(usize::try_from(value).ok()?)
            .map(|s| s.as_str())
    }

    /// Position of a rule slot in this type's slot list.
    pub fn slot_index(&self, rule: usize, pos: usize) -> Option<usize> {
        self.rxn_slots
            .iter()
            .position(|s| s.rule == rule && s.pos == pos)
    }
}

/// One end of a bond edge, stored symmetrically on both molecules.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bond {
    pub partner: MolId,
    pub partner_site: usize,
}

/// An individual molecule instance.
#[derive(Clone, Debug)]
pub struct Molecule {
    pub type_id: TypeId,
    /// Monotone id, never reused within one simulation.
    pub unique_id: u64,
    /// Position in the type-local live list.
    pub list_id: usize,
    pub alive: bool,
    pub complex_id: ComplexId,
    /// Per-component state value.
    pub states: Vec<i64>,
    /// Per-component bond edge.
    pub bonds: Vec<Option<Bond>>,
    /// Lumped count; meaningful only for population types.
    pub population: i64,
    /// Match multiplicity per observable in the type's `mol_obs` list.
    pub obs_mult: Vec<i32>,
    /// Mapping-set ids per rule slot in the type's `rxn_slots` list. A set,
    /// not a scalar: symmetric components yield several matches of one rule.
    pub memberships: Vec<BTreeSet<usize>>,
}

impl Molecule {
    pub fn is_site_open(&self, site: usize) -> bool {
        self.bonds[site].is_none()
    }

    /// Number of bonds currently attached.
    pub fn degree(&self) -> usize {
        self.bonds.iter().filter(|b| b.is_some()).count()
    }
}

/// Arena of molecule instances with per-type live lists.
#[derive(Clone, Debug, Default)]
pub struct MoleculeStore {
    arena: Vec<Molecule>,
    free_slots: Vec<MolId>,
    live_by_type: Vec<Vec<MolId>>,
    uid_counter: u64,
    pub molecule_limit: usize,
}

impl MoleculeStore {
    pub fn new() -> Self {
        MoleculeStore {
            molecule_limit: DEFAULT_MOLECULE_LIMIT,
            ..Default::default()
        }
    }

    /// Make room for the live list of a newly registered type.
    pub(crate) fn register_type(&mut self) {
        self.live_by_type.push(Vec::new());
    }

    /// Create a fresh unbonded molecule of the given type. The caller assigns
    /// it to a complex afterwards.
    pub fn create(&mut self, ty: &MoleculeType) -> Result<MolId, SimError> {
        if self.live_by_type[ty.id].len() >= self.molecule_limit {
            return Err(SimError::MoleculeLimit {
                type_name: ty.name.clone(),
                limit: self.molecule_limit,
            });
        }
        let uid = self.uid_counter;
        self.uid_counter += 1;
        let mol = Molecule {
            type_id: ty.id,
            unique_id: uid,
            list_id: self.live_by_type[ty.id].len(),
            alive: true,
            complex_id: NO_COMPLEX,
            states: ty.components.iter().map(|c| c.default_state).collect(),
            bonds: vec![None; ty.components.len()],
            population: 0,
            obs_mult: vec![0; ty.mol_obs.len()],
            memberships: vec![BTreeSet::new(); ty.rxn_slots.len()],
        };
        let id = match self.free_slots.pop() {
            Some(slot) => {
                self.arena[slot] = mol;
                slot
            }
            None => {
                self.arena.push(mol);
                self.arena.len() - 1
            }
        };
        self.live_by_type[ty.id].push(id);
        Ok(id)
    }

    /// Retire a molecule. All bonds must already be removed.
    pub fn remove(&mut self, id: MolId) -> Result<(), SimError> {
        if self.arena[id].degree() > 0 {
            return Err(SimError::Internal(format!(
                "molecule {} removed while still bonded",
                self.arena[id].unique_id
            )));
        }
        let (ty, list_id) = (self.arena[id].type_id, self.arena[id].list_id);
        let live = &mut self.live_by_type[ty];
        live.swap_remove(list_id);
        if let Some(&moved) = live.get(list_id) {
            self.arena[moved].list_id = list_id;
        }
        self.arena[id].alive = false;
        self.arena[id].complex_id = NO_COMPLEX;
        self.free_slots.push(id);
        Ok(())
    }

    pub fn molecule(&self, id: MolId) -> &Molecule {
        &self.arena[id]
    }

    pub fn molecule_mut(&mut self, id: MolId) -> &mut Molecule {
        &mut self.arena[id]
    }

    pub fn live_of_type(&self, ty: TypeId) -> &[MolId] {
        &self.live_by_type[ty]
    }

    pub fn live_count(&self) -> usize {
        self.live_by_type.iter().map(|l| l.len()).sum()
    }

    pub fn uid_counter(&self) -> u64 {
        self.uid_counter
    }

    /// Quiet lookup of a possibly retired unique id.
    pub fn by_uid(&self, uid: u64) -> Option<MolId> {
        self.arena
            .iter()
            .position(|m| m.alive && m.unique_id == uid)
    }

    /// Create the symmetric bond edge between two open sites.
    pub fn set_bond(
        &mut self,
        a: MolId,
        a_site: usize,
        b: MolId,
        b_site: usize,
    ) -> Result<(), SimError> {
        if self.arena[a].bonds[a_site].is_some() {
            return Err(SimError::SiteOccupied {
                uid: self.arena[a].unique_id,
                site: a_site,
            });
        }
        if self.arena[b].bonds[b_site].is_some() {
            return Err(SimError::SiteOccupied {
                uid: self.arena[b].unique_id,
                site: b_site,
            });
        }
        self.arena[a].bonds[a_site] = Some(Bond {
            partner: b,
            partner_site: b_site,
        });
        self.arena[b].bonds[b_site] = Some(Bond {
            partner: a,
            partner_site: a_site,
        });
        Ok(())
    }

    /// Remove the bond at a site, returning the partner end for logging.
    pub fn clear_bond(&mut self, a: MolId, a_site: usize) -> Result<Bond, SimError> {
        let bond = self.arena[a].bonds[a_site].ok_or(SimError::SiteUnbound {
            uid: self.arena[a].unique_id,
            site: a_site,
        })?;
        self.arena[a].bonds[a_site] = None;
        self.arena[bond.partner].bonds[bond.partner_site] = None;
        Ok(bond)
    }

    pub fn set_state(&mut self, id: MolId, comp: usize, value: i64) {
        self.arena[id].states[comp] = value;
    }

    /// Breadth-first walk over bond edges, up to `limit` edges deep
    /// (`None` = unbounded). The start molecule is included; the result is
    /// deduplicated.
    pub fn bonded_neighborhood(&self, start: MolId, limit: Option<usize>) -> Vec<MolId> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut queue = VecDeque::new();
        seen.insert(start);
        queue.push_back((start, 0usize));
        while let Some((id, depth)) = queue.pop_front() {
            out.push(id);
            if let Some(max) = limit {
                if depth >= max {
                    continue;
                }
            }
            for bond in self.arena[id].bonds.iter().flatten() {
                if seen.insert(bond.partner) {
                    queue.push_back((bond.partner, depth + 1));
                }
            }
        }
        out
    }

    /// Resize per-molecule bookkeeping after the rule and observable lists of
    /// the types were (re)built during preparation.
    pub(crate) fn resize_bookkeeping(&mut self, types: &[MoleculeType]) {
        for ty in types {
            for &id in &self.live_by_type[ty.id] {
                let m = &mut self.arena[id];
                m.obs_mult = vec![0; ty.mol_obs.len()];
                m.memberships = vec![BTreeSet::new(); ty.rxn_slots.len()];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_type(id: TypeId) -> MoleculeType {
        MoleculeTypeDef::new("L")
            .site_with_states("s", &["u", "p"])
            .sites("a", 3)
            .compile(id)
            .unwrap()
    }

    #[test]
    fn test_symmetric_site_expansion() {
        let ty = simple_type(0);
        assert_eq!(ty.components.len(), 4);
        assert_eq!(ty.components[1].name, "a1");
        assert_eq!(ty.components[3].name, "a3");
        assert_eq!(ty.components[1].eq_class, ty.components[3].eq_class);
        assert_eq!(ty.resolve_site("a").unwrap(), vec![1, 2, 3]);
        assert_eq!(ty.resolve_site("a2").unwrap(), vec![2]);
        assert_eq!(ty.state_value(0, "p").unwrap(), 1);
        assert!(ty.state_value(0, "q").is_err());
    }

    #[test]
    fn test_duplicate_site_rejected() {
        let bad = MoleculeTypeDef::new("X").site("a").site("a").compile(0);
        assert!(matches!(bad, Err(SimError::ModelValidation(_))));
    }

    #[test]
    fn test_create_and_remove_recycles_slots() {
        let ty = simple_type(0);
        let mut store = MoleculeStore::new();
        store.register_type();
        let a = store.create(&ty).unwrap();
        let b = store.create(&ty).unwrap();
        assert_eq!(store.live_of_type(0), &[a, b]);
        store.remove(a).unwrap();
        assert!(!store.molecule(a).alive);
        assert_eq!(store.molecule(b).list_id, 0);
        let c = store.create(&ty).unwrap();
        // slot is recycled but the unique id is not
        assert_eq!(c, a);
        assert_eq!(store.molecule(c).unique_id, 2);
    }

    #[test]
    fn test_bond_symmetry() {
        let ty = simple_type(0);
        let mut store = MoleculeStore::new();
        store.register_type();
        let a = store.create(&ty).unwrap();
        let b = store.create(&ty).unwrap();
        store.set_bond(a, 1, b, 2).unwrap();
        assert_eq!(
            store.molecule(a).bonds[1],
            Some(Bond { partner: b, partner_site: 2 })
        );
        assert_eq!(
            store.molecule(b).bonds[2],
            Some(Bond { partner: a, partner_site: 1 })
        );
        let err = store.set_bond(a, 1, b, 3).unwrap_err();
        assert!(matches!(err, SimError::SiteOccupied { .. }));
        let removed = store.clear_bond(a, 1).unwrap();
        assert_eq!(removed.partner, b);
        assert!(store.molecule(b).is_site_open(2));
        assert!(matches!(
            store.clear_bond(a, 1),
            Err(SimError::SiteUnbound { .. })
        ));
    }

    #[test]
    fn test_neighborhood_depth_limit() {
        let ty = simple_type(0);
        let mut store = MoleculeStore::new();
        store.register_type();
        // chain m0 - m1 - m2 - m3 over the symmetric a sites
        let mols: Vec<MolId> = (0..4).map(|_| store.create(&ty).unwrap()).collect();
        for w in mols.windows(2) {
            store.set_bond(w[0], 2, w[1], 1).unwrap();
        }
        let all = store.bonded_neighborhood(mols[0], None);
        assert_eq!(all.len(), 4);
        let near = store.bonded_neighborhood(mols[0], Some(2));
        assert_eq!(near.len(), 3);
        assert!(!near.contains(&mols[3]));
    }

    #[test]
    fn test_molecule_limit() {
        let ty = simple_type(0);
        let mut store = MoleculeStore::new();
        store.molecule_limit = 2;
        store.register_type();
        store.create(&ty).unwrap();
        store.create(&ty).unwrap();
        assert!(matches!(
            store.create(&ty),
            Err(SimError::MoleculeLimit { .. })
        ));
    }
}
