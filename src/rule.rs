//! Reaction rules: reactant patterns, a rate law, a transformation set, and
//! the indexed populations of current matches.
//!
//! Rules come in four flavors sharing one object: basic mass-action rules,
//! observable-dependent rules whose base rate is an expression, weighted-rate
//! rules whose matches carry individual weights and are sampled
//! proportionally, and population rules over lumped species. Dispatch is a
//! small tagged enum rather than an inheritance tree.

use rand::rngs::StdRng;
use rand::Rng;

use crate::complex::ComplexRegistry;
use crate::error::SimError;
use crate::funcs::{LocalScope, RateExpr, WeightFn};
use crate::molecule::{MolId, MoleculeStore, MoleculeType};
use crate::observable::Observable;
use crate::pattern::Pattern;
use crate::reactant::ReactantList;
use crate::transform::{compile_transforms, TransformDef, TransformationSet};

/// Rate law of a rule under construction.
pub enum RateDef {
    /// Fixed microscopic rate constant.
    Constant(f64),
    /// Rate bound to a named system parameter.
    Param(String),
    /// Observable-dependent rate expression, re-evaluated every event.
    Expr(RateExpr),
    /// Per-match weighted rate: each match of the given reactant slot carries
    /// `weight(scope)`, and firing samples matches proportionally.
    PerMatch {
        base: f64,
        reactant: usize,
        weight: WeightFn,
    },
}

/// Declarative description of a rule, consumed by
/// [`crate::Simulation::add_reaction`].
pub struct RuleDef {
    pub name: String,
    rate: RateDef,
    reactants: Vec<Pattern>,
    transforms: Vec<TransformDef>,
    total_rate: bool,
    forbid_intra_complex: bool,
}

impl RuleDef {
    pub fn new(name: &str, rate: RateDef) -> Self {
        RuleDef {
            name: name.to_string(),
            rate,
            reactants: Vec::new(),
            transforms: Vec::new(),
            total_rate: false,
            forbid_intra_complex: false,
        }
    }

    /// Append a reactant pattern.
    pub fn reactant(mut self, pattern: Pattern) -> Self {
        self.reactants.push(pattern);
        self
    }

    /// Append a transformation.
    pub fn transform(mut self, t: TransformDef) -> Self {
        self.transforms.push(t);
        self
    }

    /// Interpret the rate as the macroscopic total rate of the rule instead
    /// of a per-collision constant.
    pub fn total_rate(mut self) -> Self {
        self.total_rate = true;
        self
    }

    /// Reject firings that would bind two sites of one complex.
    pub fn forbid_intra_complex(mut self) -> Self {
        self.forbid_intra_complex = true;
        self
    }
}

pub(crate) enum RuleKind {
    Basic,
    ObsDependent,
    Dor { reactant: usize },
    Population,
}

pub(crate) enum CompiledRate {
    Constant(f64),
    Param(String),
    Expr(RateExpr),
    PerMatch { base: f64, weight: WeightFn },
}

/// A compiled rule with its live reactant populations and propensity.
pub struct ReactionRule {
    pub name: String,
    pub id: usize,
    pub(crate) patterns: Vec<Pattern>,
    pub(crate) transforms: TransformationSet,
    pub(crate) rate: CompiledRate,
    /// Current numeric base rate; parameter- and expression-backed rules
    /// refresh this during preparation and parameter updates.
    pub(crate) base_rate: f64,
    pub(crate) total_rate: bool,
    pub(crate) lists: Vec<ReactantList>,
    pub(crate) kind: RuleKind,
    pub(crate) is_population: Vec<bool>,
    /// Falling-factorial offset per position among identical population
    /// reactants.
    pub(crate) identical_offset: Vec<usize>,
    pub(crate) a: f64,
    pub(crate) fire_count: u64,
}

impl ReactionRule {
    pub(crate) fn compile(
        def: RuleDef,
        id: usize,
        types: &[MoleculeType],
    ) -> Result<ReactionRule, SimError> {
        let RuleDef {
            name,
            rate,
            reactants,
            transforms,
            total_rate,
            forbid_intra_complex,
        } = def;
        let mut is_population = Vec::with_capacity(reactants.len());
        for p in &reactants {
            let pop = p.nodes.iter().any(|n| types[n.type_id].population_type);
            if pop && p.nodes.len() > 1 {
                return Err(SimError::ModelValidation(format!(
                    "rule {}: population species must appear as single-node reactants",
                    name
                )));
            }
            is_population.push(pop);
        }
        let (kind, rate, base_rate) = match rate {
            RateDef::Constant(v) => (
                if is_population.iter().any(|&p| p) {
                    RuleKind::Population
                } else {
                    RuleKind::Basic
                },
                CompiledRate::Constant(v),
                v,
            ),
            RateDef::Param(p) => (
                if is_population.iter().any(|&p| p) {
                    RuleKind::Population
                } else {
                    RuleKind::Basic
                },
                CompiledRate::Param(p),
                0.0,
            ),
            RateDef::Expr(e) => (RuleKind::ObsDependent, CompiledRate::Expr(e), 0.0),
            RateDef::PerMatch {
                base,
                reactant,
                weight,
            } => {
                if reactant >= reactants.len() {
                    return Err(SimError::ModelValidation(format!(
                        "rule {}: weighted reactant {} out of range",
                        name, reactant
                    )));
                }
                (
                    RuleKind::Dor { reactant },
                    CompiledRate::PerMatch { base, weight },
                    base,
                )
            }
        };
        let mut identical_offset = vec![0usize; reactants.len()];
        for pos in 0..reactants.len() {
            identical_offset[pos] = (0..pos)
                .filter(|&earlier| reactants[earlier] == reactants[pos])
                .count();
        }
        let transforms = compile_transforms(&transforms, &reactants, types, forbid_intra_complex)?;
        let lists = reactants.iter().map(|_| ReactantList::new()).collect();
        Ok(ReactionRule {
            name,
            id,
            patterns: reactants,
            transforms,
            rate,
            base_rate,
            total_rate,
            lists,
            kind,
            is_population,
            identical_offset,
            a: 0.0,
            fire_count: 0,
        })
    }

    /// Current propensity.
    pub fn propensity(&self) -> f64 {
        self.a
    }

    /// How often this rule has fired (null events excluded).
    pub fn fire_count(&self) -> u64 {
        self.fire_count
    }

    /// Number of mapping sets currently held for a reactant slot.
    pub fn reactant_count(&self, pos: usize) -> usize {
        self.lists[pos].len()
    }

    /// Reactant count entering the rate law: lumped population counts with
    /// falling-factorial correction for identical population reactants, plain
    /// list length otherwise.
    pub fn corrected_count(&self, store: &MoleculeStore, pos: usize) -> f64 {
        if self.is_population[pos] {
            let total: i64 = self.lists[pos]
                .iter()
                .map(|(_, ms)| store.molecule(ms.mols[0]).population)
                .sum();
            let corrected = total - self.identical_offset[pos] as i64;
            corrected.max(0) as f64
        } else {
            self.lists[pos].len() as f64
        }
    }

    pub(crate) fn compute_a(&self, store: &MoleculeStore) -> f64 {
        let base = self.base_rate;
        if !(base > 0.0) {
            return 0.0;
        }
        match self.kind {
            RuleKind::Dor { reactant } => {
                let mut a = base * self.lists[reactant].total_weight();
                for pos in 0..self.lists.len() {
                    if pos != reactant {
                        a *= self.corrected_count(store, pos);
                    }
                }
                a
            }
            _ if self.total_rate => {
                let occupied = (0..self.lists.len())
                    .all(|pos| self.corrected_count(store, pos) > 0.0);
                if occupied {
                    base
                } else {
                    0.0
                }
            }
            _ => {
                let mut a = base;
                for pos in 0..self.lists.len() {
                    a *= self.corrected_count(store, pos);
                }
                a
            }
        }
    }

    /// Recompute the propensity, returning the delta to fold into the total.
    pub(crate) fn update_a(&mut self, store: &MoleculeStore) -> f64 {
        let old = self.a;
        self.a = self.compute_a(store);
        self.a - old
    }

    /// Draw one mapping set per reactant slot: uniform for ordinary slots,
    /// weight-proportional for the weighted slot.
    pub(crate) fn pick(&self, rng: &mut StdRng) -> Option<Vec<(usize, usize)>> {
        let mut picks = Vec::with_capacity(self.lists.len());
        for (pos, list) in self.lists.iter().enumerate() {
            let id = match self.kind {
                RuleKind::Dor { reactant } if reactant == pos => {
                    list.pick_weighted(rng.gen::<f64>())?
                }
                _ => list.pick_uniform(rng)?,
            };
            picks.push((pos, id));
        }
        Some(picks)
    }

    /// Drop every mapping set in which `m` participates at the given slot.
    /// Returns whether the slot's population changed.
    pub(crate) fn remove_molecule(
        &mut self,
        store: &mut MoleculeStore,
        types: &[MoleculeType],
        pos: usize,
        m: MolId,
    ) -> bool {
        let slot = match types[store.molecule(m).type_id].slot_index(self.id, pos) {
            Some(s) => s,
            None => return false,
        };
        let current: Vec<usize> = store.molecule(m).memberships[slot].iter().copied().collect();
        let mut changed = false;
        for msid in current {
            match self.lists[pos].remove(msid) {
                Some(ms) => {
                    changed = true;
                    for &p in &ms.mols {
                        let pty = &types[store.molecule(p).type_id];
                        if let Some(ps) = pty.slot_index(self.id, pos) {
                            store.molecule_mut(p).memberships[ps].remove(&msid);
                        }
                    }
                }
                None => {
                    store.molecule_mut(m).memberships[slot].remove(&msid);
                }
            }
        }
        changed
    }

    /// Refresh `m`'s participation at a reactant slot: drop its stale mapping
    /// sets, re-enumerate every embedding it anchors, and register the new
    /// ones. Returns whether the slot's count or weight changed.
    pub(crate) fn try_to_add(
        &mut self,
        store: &mut MoleculeStore,
        types: &[MoleculeType],
        complexes: &ComplexRegistry,
        observables: &[Observable],
        complex_scoped: bool,
        pos: usize,
        m: MolId,
    ) -> Result<bool, SimError> {
        if !store.molecule(m).alive {
            return Ok(false);
        }
        let ty_id = store.molecule(m).type_id;
        if types[ty_id].slot_index(self.id, pos).is_none() {
            return Ok(false);
        }
        let before_len = self.lists[pos].len();
        let before_weight = self.lists[pos].total_weight();
        self.remove_molecule(store, types, pos, m);

        let mut found = Vec::new();
        for anchor in self.patterns[pos].anchors_of_type(ty_id) {
            self.patterns[pos].match_all_anchored(store, anchor, m, &mut found);
        }
        if let (RuleKind::Dor { reactant }, CompiledRate::PerMatch { weight, .. }) =
            (&self.kind, &self.rate)
        {
            if *reactant == pos {
                for ms in &mut found {
                    let root = ms.mols[0];
                    let scope_members: &[MolId] = if complex_scoped {
                        &complexes.get(store.molecule(root).complex_id).members
                    } else {
                        std::slice::from_ref(&root)
                    };
                    let scope = LocalScope {
                        types,
                        store,
                        observables,
                        members: scope_members,
                    };
                    let w = weight(&scope)?;
                    ms.weight = w;
                }
            }
        }
        let rule_id = self.id;
        for ms in found {
            let mols = ms.mols.clone();
            let msid = self.lists[pos].insert(ms);
            for &p in &mols {
                let pty = &types[store.molecule(p).type_id];
                if let Some(ps) = pty.slot_index(rule_id, pos) {
                    store.molecule_mut(p).memberships[ps].insert(msid);
                }
            }
        }
        Ok(self.lists[pos].len() != before_len
            || self.lists[pos].total_weight() != before_weight)
    }

    /// Component classes the rule's transformations modify or create, paired
    /// with the affected type. `None` stands for whole-molecule effects.
    /// Used to prune membership repair to connected rules.
    pub(crate) fn modified_signature(
        &self,
        types: &[MoleculeType],
    ) -> Vec<(usize, Option<usize>)> {
        use crate::transform::Transform;
        let mut out = Vec::new();
        let push_site = |path: &crate::transform::SitePath,
                         out: &mut Vec<(usize, Option<usize>)>| {
            let node = &self.patterns[path.reactant].nodes[path.node];
            let comp = node.sites[path.site].comps[0];
            let class = types[node.type_id].components[comp].eq_class;
            out.push((node.type_id, Some(class)));
        };
        for op in &self.transforms.ops {
            match op {
                Transform::SetState { target, .. } => push_site(target, &mut out),
                Transform::Bind { a, b } => {
                    push_site(a, &mut out);
                    push_site(b, &mut out);
                }
                Transform::Unbind { at } => push_site(at, &mut out),
                Transform::Create { type_id, bond } => {
                    out.push((*type_id, None));
                    if let Some((_, to)) = bond {
                        push_site(to, &mut out);
                    }
                }
                Transform::Destroy { reactant, node } => {
                    out.push((self.patterns[*reactant].nodes[*node].type_id, None));
                }
                Transform::IncPop { reactant, node } | Transform::DecPop { reactant, node } => {
                    out.push((self.patterns[*reactant].nodes[*node].type_id, None));
                }
            }
        }
        out
    }

    /// Whether a change matching the signature entry could affect this rule's
    /// reactant populations.
    pub(crate) fn interested_in(
        &self,
        types: &[MoleculeType],
        ty: usize,
        class: Option<usize>,
    ) -> bool {
        // weighted-rate rules read local context beyond their own constraints
        if matches!(self.kind, RuleKind::Dor { .. }) {
            return true;
        }
        for p in &self.patterns {
            for node in &p.nodes {
                if node.type_id != ty {
                    continue;
                }
                match class {
                    None => return true,
                    Some(c) => {
                        for site in &node.sites {
                            let comp = site.comps[0];
                            if types[ty].components[comp].eq_class == c {
                                return true;
                            }
                        }
                    }
                }
            }
        }
        false
    }
}
