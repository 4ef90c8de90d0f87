//! Template patterns and the matcher that embeds them into the molecule graph.
//!
//! A pattern is a small connected graph of typed nodes with per-site
//! constraints. Matching is anchored: a precomputed traversal order exists for
//! every node, so a match attempt can be rooted at whichever molecule just
//! changed. The matcher enumerates *all* distinct embeddings; with symmetric
//! components one molecule can embed the same pattern several ways, and each
//! way is a separate mapping set.

use crate::error::SimError;
use crate::molecule::{MolId, MoleculeStore, MoleculeType, TypeId};

/// Bond requirement on one pattern site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BondSpec {
    /// No requirement.
    Wild,
    /// Site must be free.
    Open,
    /// Site must carry a bond, to anyone.
    Bonded,
    /// Site must carry the bond described by the indexed pattern edge.
    Edge(usize),
}

/// State requirement on one pattern site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateSpec {
    Any,
    /// Exact state value.
    Is(i64),
    /// State must equal the state mapped for another pattern site.
    SameAs { node: usize, site: usize },
}

/// One constrained site of a pattern node.
#[derive(Clone, Debug, PartialEq)]
pub struct SiteSpec {
    /// Candidate concrete components: an equivalence class, or one component.
    pub comps: Vec<usize>,
    pub state: StateSpec,
    pub bond: BondSpec,
}

/// A typed node of a pattern.
#[derive(Clone, Debug, PartialEq)]
pub struct PatternNode {
    pub type_id: TypeId,
    pub sites: Vec<SiteSpec>,
}

/// An explicit bond between two pattern sites, addressed by
/// (node index, site-constraint index).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PatternEdge {
    pub a_node: usize,
    pub a_site: usize,
    pub b_node: usize,
    pub b_site: usize,
}

/// One successful embedding of a pattern into the molecule graph: the mapped
/// molecule per node and the mapped concrete component per site constraint,
/// plus the per-match rate weight used by weighted-rate rules.
#[derive(Clone, Debug, PartialEq)]
pub struct MappingSet {
    pub mols: Vec<MolId>,
    pub sites: Vec<usize>,
    pub weight: f64,
}

/// Traversal order used when matching anchored at a particular node:
/// `steps[k] = (node, edge used to reach it)`, with `steps[0]` the anchor.
#[derive(Clone, Debug)]
struct MatchPlan {
    steps: Vec<(usize, Option<usize>)>,
}

/// A compiled, matchable pattern.
#[derive(Clone, Debug)]
pub struct Pattern {
    pub nodes: Vec<PatternNode>,
    pub edges: Vec<PatternEdge>,
    site_offset: Vec<usize>,
    total_sites: usize,
    plans: Vec<MatchPlan>,
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.nodes == other.nodes && self.edges == other.edges
    }
}

impl Pattern {
    /// Type of the root node.
    pub fn root_type(&self) -> TypeId {
        self.nodes[0].type_id
    }

    /// Flattened index of a (node, site-constraint) pair into
    /// [`MappingSet::sites`].
    pub fn flat_site(&self, node: usize, site: usize) -> usize {
        self.site_offset[node] + site
    }

    /// Nodes a molecule of the given type could anchor a match at.
    pub fn anchors_of_type(&self, ty: TypeId) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&n| self.nodes[n].type_id == ty)
            .collect()
    }

    /// Whether any node of the pattern has the given type.
    pub fn involves_type(&self, ty: TypeId) -> bool {
        self.nodes.iter().any(|n| n.type_id == ty)
    }

    /// Enumerate all embeddings with `mols[anchor_node] = m`.
    pub fn match_all_anchored(
        &self,
        store: &MoleculeStore,
        anchor_node: usize,
        m: MolId,
        out: &mut Vec<MappingSet>,
    ) {
        let mut matcher = Matcher {
            pat: self,
            store,
            plan: &self.plans[anchor_node],
            anchor: m,
            mols: vec![None; self.nodes.len()],
            comps: vec![None; self.total_sites],
            first_only: false,
        };
        matcher.try_position(0, out);
    }

    /// Number of embeddings rooted at node 0 with `mols[0] = m`. This is the
    /// multiplicity convention observables use.
    pub fn match_count_rooted(&self, store: &MoleculeStore, m: MolId) -> usize {
        if store.molecule(m).type_id != self.root_type() {
            return 0;
        }
        let mut out = Vec::new();
        self.match_all_anchored(store, 0, m, &mut out);
        out.len()
    }

    /// Whether at least one embedding rooted at `m` exists.
    pub fn matches_molecule(&self, store: &MoleculeStore, m: MolId) -> bool {
        if store.molecule(m).type_id != self.root_type() {
            return false;
        }
        let mut out = Vec::new();
        let mut matcher = Matcher {
            pat: self,
            store,
            plan: &self.plans[0],
            anchor: m,
            mols: vec![None; self.nodes.len()],
            comps: vec![None; self.total_sites],
            first_only: true,
        };
        matcher.try_position(0, &mut out);
        !out.is_empty()
    }

    /// Whether the pattern embeds anywhere within a set of molecules
    /// (match-once semantics used by species observables).
    pub fn matches_within(&self, store: &MoleculeStore, members: &[MolId]) -> bool {
        members.iter().any(|&m| self.matches_molecule(store, m))
    }
}

struct Matcher<'a> {
    pat: &'a Pattern,
    store: &'a MoleculeStore,
    plan: &'a MatchPlan,
    anchor: MolId,
    mols: Vec<Option<MolId>>,
    comps: Vec<Option<usize>>,
    first_only: bool,
}

impl<'a> Matcher<'a> {
    fn try_position(&mut self, pos: usize, out: &mut Vec<MappingSet>) {
        if pos == self.plan.steps.len() {
            self.emit(out);
            return;
        }
        let (node, via) = self.plan.steps[pos];
        let mol = match via {
            None => self.anchor,
            Some(edge) => match self.derive(node, edge) {
                Some(m) => m,
                None => return,
            },
        };
        let m = self.store.molecule(mol);
        if !m.alive || m.type_id != self.pat.nodes[node].type_id {
            return;
        }
        if self.mols.iter().flatten().any(|&used| used == mol) {
            return;
        }
        self.mols[node] = Some(mol);
        self.try_site(pos, node, 0, out);
        self.mols[node] = None;
    }

    /// Follow the concrete bond out of the already-assigned end of `edge` to
    /// find the molecule this node must map to.
    fn derive(&self, node: usize, edge: usize) -> Option<MolId> {
        let e = self.pat.edges[edge];
        let (p_node, p_site) = if e.a_node == node {
            (e.b_node, e.b_site)
        } else {
            (e.a_node, e.a_site)
        };
        let p_mol = self.mols[p_node]?;
        let p_comp = self.comps[self.pat.flat_site(p_node, p_site)]?;
        self.store
            .molecule(p_mol)
            .bonds
            .get(p_comp)
            .copied()
            .flatten()
            .map(|b| b.partner)
    }

    fn try_site(&mut self, pos: usize, node: usize, site: usize, out: &mut Vec<MappingSet>) {
        if site == self.pat.nodes[node].sites.len() {
            self.try_position(pos + 1, out);
            return;
        }
        let flat = self.pat.flat_site(node, site);
        let candidates = self.site_candidates(node, site);
        for c in candidates {
            self.comps[flat] = Some(c);
            self.try_site(pos, node, site + 1, out);
            self.comps[flat] = None;
            if self.first_only && !out.is_empty() {
                return;
            }
        }
    }

    fn site_candidates(&self, node: usize, site: usize) -> Vec<usize> {
        let spec = &self.pat.nodes[node].sites[site];
        let mol = match self.mols[node] {
            Some(m) => m,
            None => return Vec::new(),
        };
        let m = self.store.molecule(mol);
        let offset = self.pat.site_offset[node];
        let n_sites = self.pat.nodes[node].sites.len();
        let mut candidates = Vec::new();
        'comp: for &c in &spec.comps {
            // two template sites may not claim the same concrete site
            for other in 0..n_sites {
                if other != site && self.comps[offset + other] == Some(c) {
                    continue 'comp;
                }
            }
            if let StateSpec::Is(v) = spec.state {
                if m.states[c] != v {
                    continue;
                }
            }
            match spec.bond {
                BondSpec::Wild => {}
                BondSpec::Open => {
                    if m.bonds[c].is_some() {
                        continue;
                    }
                }
                BondSpec::Bonded => {
                    if m.bonds[c].is_none() {
                        continue;
                    }
                }
                BondSpec::Edge(e) => {
                    let bond = match m.bonds[c] {
                        Some(b) => b,
                        None => continue,
                    };
                    let edge = self.pat.edges[e];
                    let (peer_node, peer_site) = if edge.a_node == node && edge.a_site == site {
                        (edge.b_node, edge.b_site)
                    } else {
                        (edge.a_node, edge.a_site)
                    };
                    match self.mols[peer_node] {
                        Some(peer_mol) => {
                            if bond.partner != peer_mol {
                                continue;
                            }
                            if let Some(peer_comp) =
                                self.comps[self.pat.flat_site(peer_node, peer_site)]
                            {
                                if bond.partner_site != peer_comp {
                                    continue;
                                }
                            }
                        }
                        None => {
                            let partner_ty = self.store.molecule(bond.partner).type_id;
                            if partner_ty != self.pat.nodes[peer_node].type_id {
                                continue;
                            }
                        }
                    }
                }
            }
            candidates.push(c);
        }
        candidates
    }

    fn emit(&self, out: &mut Vec<MappingSet>) {
        // label-equality constraints are cheapest to verify once everything
        // is assigned
        for (node, pn) in self.pat.nodes.iter().enumerate() {
            for (site, spec) in pn.sites.iter().enumerate() {
                if let StateSpec::SameAs { node: n2, site: s2 } = spec.state {
                    let v1 = self.site_state(node, site);
                    let v2 = self.site_state(n2, s2);
                    match (v1, v2) {
                        (Some(a), Some(b)) if a == b => {}
                        _ => return,
                    }
                }
            }
        }
        let mols: Vec<MolId> = match self.mols.iter().copied().collect::<Option<Vec<_>>>() {
            Some(v) => v,
            None => return,
        };
        let sites: Vec<usize> = match self.comps.iter().copied().collect::<Option<Vec<_>>>() {
            Some(v) => v,
            None => return,
        };
        out.push(MappingSet {
            mols,
            sites,
            weight: 1.0,
        });
    }

    fn site_state(&self, node: usize, site: usize) -> Option<i64> {
        let mol = self.mols[node]?;
        let comp = self.comps[self.pat.flat_site(node, site)]?;
        Some(self.store.molecule(mol).states[comp])
    }
}

enum DraftBond {
    Wild,
    Open,
    Bonded,
    Label(u32),
}

struct DraftSite {
    comps: Vec<usize>,
    state: StateSpec,
    bond: DraftBond,
}

struct DraftNode {
    type_id: TypeId,
    sites: Vec<DraftSite>,
}

/// Chainable pattern builder. Errors are recorded and surfaced by
/// [`PatternBuilder::build`], so a whole pattern reads as one expression.
pub struct PatternBuilder<'a> {
    types: &'a [MoleculeType],
    nodes: Vec<DraftNode>,
    error: Option<SimError>,
}

impl<'a> PatternBuilder<'a> {
    pub fn new(types: &'a [MoleculeType], root: &str) -> Self {
        let mut b = PatternBuilder {
            types,
            nodes: Vec::new(),
            error: None,
        };
        b.push_node(root);
        b
    }

    fn fail(&mut self, msg: String) {
        if self.error.is_none() {
            self.error = Some(SimError::ModelValidation(msg));
        }
    }

    fn push_node(&mut self, type_name: &str) {
        match self.types.iter().find(|t| t.name == type_name) {
            Some(t) => self.nodes.push(DraftNode {
                type_id: t.id,
                sites: Vec::new(),
            }),
            None => self.fail(format!("pattern references unknown type {}", type_name)),
        }
    }

    /// Add another node to the pattern; it becomes the current node.
    pub fn node(mut self, type_name: &str) -> Self {
        self.push_node(type_name);
        self
    }

    /// Constrain a site of the current node; it becomes the current site.
    /// `name` is either a declared site name (whole equivalence class) or an
    /// expanded copy name like `a2`.
    pub fn site(mut self, name: &str) -> Self {
        if self.error.is_some() {
            return self;
        }
        let ty_id = match self.nodes.last() {
            Some(n) => n.type_id,
            None => return self,
        };
        match self.types[ty_id].resolve_site(name) {
            Some(comps) => {
                if let Some(node) = self.nodes.last_mut() {
                    node.sites.push(DraftSite {
                        comps,
                        state: StateSpec::Any,
                        bond: DraftBond::Wild,
                    });
                }
            }
            None => {
                let ty = self.types[ty_id].name.clone();
                self.fail(format!("type {} has no site {}", ty, name));
            }
        }
        self
    }

    /// Require a named state on the current site.
    pub fn state(mut self, state: &str) -> Self {
        if self.error.is_some() {
            return self;
        }
        let ty_id = match self.nodes.last() {
            Some(n) => n.type_id,
            None => return self,
        };
        let comp0 = match self.nodes.last().and_then(|n| n.sites.last()) {
            Some(s) => s.comps[0],
            None => {
                self.fail("state() before any site()".to_string());
                return self;
            }
        };
        match self.types[ty_id].state_value(comp0, state) {
            Ok(v) => {
                if let Some(s) = self.nodes.last_mut().and_then(|n| n.sites.last_mut()) {
                    s.state = StateSpec::Is(v);
                }
            }
            Err(e) => {
                if self.error.is_none() {
                    self.error = Some(e);
                }
            }
        }
        self
    }

    /// Require an exact integer value on the current (integer) site.
    pub fn value(mut self, v: i64) -> Self {
        if let Some(s) = self.nodes.last_mut().and_then(|n| n.sites.last_mut()) {
            s.state = StateSpec::Is(v);
        }
        self
    }

    /// Require the current site's state to equal another mapped site's state.
    pub fn same_state_as(mut self, node: usize, site: usize) -> Self {
        if let Some(s) = self.nodes.last_mut().and_then(|n| n.sites.last_mut()) {
            s.state = StateSpec::SameAs { node, site };
        }
        self
    }

    /// Require the current site to be free.
    pub fn open(mut self) -> Self {
        if let Some(s) = self.nodes.last_mut().and_then(|n| n.sites.last_mut()) {
            s.bond = DraftBond::Open;
        }
        self
    }

    /// Require the current site to be bonded to anything.
    pub fn bonded(mut self) -> Self {
        if let Some(s) = self.nodes.last_mut().and_then(|n| n.sites.last_mut()) {
            s.bond = DraftBond::Bonded;
        }
        self
    }

    /// Mark the current site with a bond label; the two sites sharing a label
    /// become the endpoints of one pattern edge.
    pub fn bond(mut self, label: u32) -> Self {
        if let Some(s) = self.nodes.last_mut().and_then(|n| n.sites.last_mut()) {
            s.bond = DraftBond::Label(label);
        }
        self
    }

    pub fn build(self) -> Result<Pattern, SimError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        if self.nodes.is_empty() {
            return Err(SimError::ModelValidation("empty pattern".to_string()));
        }
        // first pass: materialize nodes, remembering where each bond label sits
        let mut label_sites: Vec<(u32, usize, usize)> = Vec::new();
        let mut nodes: Vec<PatternNode> = Vec::new();
        for (ni, draft) in self.nodes.iter().enumerate() {
            let mut sites = Vec::new();
            for (si, s) in draft.sites.iter().enumerate() {
                let bond = match s.bond {
                    DraftBond::Wild => BondSpec::Wild,
                    DraftBond::Open => BondSpec::Open,
                    DraftBond::Bonded => BondSpec::Bonded,
                    DraftBond::Label(l) => {
                        label_sites.push((l, ni, si));
                        BondSpec::Wild
                    }
                };
                sites.push(SiteSpec {
                    comps: s.comps.clone(),
                    state: s.state,
                    bond,
                });
            }
            nodes.push(PatternNode {
                type_id: draft.type_id,
                sites,
            });
        }
        // second pass: pair up labels into edges
        let mut edges: Vec<PatternEdge> = Vec::new();
        while let Some((label, a_node, a_site)) = label_sites.pop() {
            let partner = label_sites.iter().position(|&(l, _, _)| l == label);
            let Some(i) = partner else {
                return Err(SimError::ModelValidation(format!(
                    "bond label {} appears only once in pattern",
                    label
                )));
            };
            let (_, b_node, b_site) = label_sites.swap_remove(i);
            if label_sites.iter().any(|&(l, _, _)| l == label) {
                return Err(SimError::ModelValidation(format!(
                    "bond label {} appears more than twice in pattern",
                    label
                )));
            }
            let eid = edges.len();
            edges.push(PatternEdge {
                a_node,
                a_site,
                b_node,
                b_site,
            });
            nodes[a_node].sites[a_site].bond = BondSpec::Edge(eid);
            nodes[b_node].sites[b_site].bond = BondSpec::Edge(eid);
        }
        // label-equality references must point at existing sites
        for n in &nodes {
            for s in &n.sites {
                if let StateSpec::SameAs { node, site } = s.state {
                    if nodes.get(node).map_or(true, |p| p.sites.len() <= site) {
                        return Err(SimError::ModelValidation(
                            "label-equality constraint references a missing site".to_string(),
                        ));
                    }
                }
            }
        }
        Pattern::compile(nodes, edges)
    }
}

impl Pattern {
    fn compile(nodes: Vec<PatternNode>, edges: Vec<PatternEdge>) -> Result<Pattern, SimError> {
        let mut site_offset = Vec::with_capacity(nodes.len());
        let mut total_sites = 0;
        for n in &nodes {
            site_offset.push(total_sites);
            total_sites += n.sites.len();
        }
        // adjacency by edge id
        let mut adjacent: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        for (ei, e) in edges.iter().enumerate() {
            adjacent[e.a_node].push(ei);
            adjacent[e.b_node].push(ei);
        }
        let mut plans = Vec::with_capacity(nodes.len());
        for anchor in 0..nodes.len() {
            let mut steps: Vec<(usize, Option<usize>)> = vec![(anchor, None)];
            let mut seen = vec![false; nodes.len()];
            seen[anchor] = true;
            let mut head = 0;
            while head < steps.len() {
                let (node, _) = steps[head];
                head += 1;
                for &ei in &adjacent[node] {
                    let e = edges[ei];
                    let other = if e.a_node == node { e.b_node } else { e.a_node };
                    if !seen[other] {
                        seen[other] = true;
                        steps.push((other, Some(ei)));
                    }
                }
            }
            if steps.len() != nodes.len() {
                return Err(SimError::ModelValidation(
                    "pattern graph must be connected".to_string(),
                ));
            }
            plans.push(MatchPlan { steps });
        }
        Ok(Pattern {
            nodes,
            edges,
            site_offset,
            total_sites,
            plans,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::molecule::{MoleculeStore, MoleculeTypeDef};

    fn world() -> (Vec<MoleculeType>, MoleculeStore) {
        let types = vec![
            MoleculeTypeDef::new("T").sites("a", 3).compile(0).unwrap(),
            MoleculeTypeDef::new("L")
                .site_with_states("r", &["free", "busy"])
                .compile(1)
                .unwrap(),
        ];
        let mut store = MoleculeStore::new();
        store.register_type();
        store.register_type();
        (types, store)
    }

    #[test]
    fn test_symmetric_sites_give_multiple_matches() {
        let (types, mut store) = world();
        let t = store.create(&types[0]).unwrap();
        let p = PatternBuilder::new(&types, "T").site("a").open().build().unwrap();
        assert_eq!(p.match_count_rooted(&store, t), 3);
        // occupy one copy and two remain
        let t2 = store.create(&types[0]).unwrap();
        store.set_bond(t, 0, t2, 0).unwrap();
        assert_eq!(p.match_count_rooted(&store, t), 2);
    }

    #[test]
    fn test_state_constraint() {
        let (types, mut store) = world();
        let l = store.create(&types[1]).unwrap();
        let free = PatternBuilder::new(&types, "L")
            .site("r")
            .state("free")
            .build()
            .unwrap();
        let busy = PatternBuilder::new(&types, "L")
            .site("r")
            .state("busy")
            .build()
            .unwrap();
        assert!(free.matches_molecule(&store, l));
        assert!(!busy.matches_molecule(&store, l));
        store.set_state(l, 0, 1);
        assert!(busy.matches_molecule(&store, l));
    }

    #[test]
    fn test_bound_pair_pattern() {
        let (types, mut store) = world();
        let a = store.create(&types[1]).unwrap();
        let b = store.create(&types[1]).unwrap();
        let dimer = PatternBuilder::new(&types, "L")
            .site("r")
            .bond(1)
            .node("L")
            .site("r")
            .bond(1)
            .build()
            .unwrap();
        assert!(!dimer.matches_molecule(&store, a));
        store.set_bond(a, 0, b, 0).unwrap();
        let mut out = Vec::new();
        dimer.match_all_anchored(&store, 0, a, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].mols, vec![a, b]);
        // anchored at the second node, the same molecule maps the other way
        out.clear();
        dimer.match_all_anchored(&store, 1, a, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].mols, vec![b, a]);
    }

    #[test]
    fn test_unpaired_bond_label_is_an_error() {
        let (types, _) = world();
        let err = PatternBuilder::new(&types, "L").site("r").bond(7).build();
        assert!(matches!(err, Err(SimError::ModelValidation(_))));
    }

    #[test]
    fn test_open_vs_bonded() {
        let (types, mut store) = world();
        let a = store.create(&types[1]).unwrap();
        let b = store.create(&types[1]).unwrap();
        let open = PatternBuilder::new(&types, "L").site("r").open().build().unwrap();
        let bonded = PatternBuilder::new(&types, "L").site("r").bonded().build().unwrap();
        assert!(open.matches_molecule(&store, a));
        assert!(!bonded.matches_molecule(&store, a));
        store.set_bond(a, 0, b, 0).unwrap();
        assert!(!open.matches_molecule(&store, a));
        assert!(bonded.matches_molecule(&store, a));
    }

    #[test]
    fn test_two_sites_cannot_claim_one_component() {
        let (types, mut store) = world();
        let t = store.create(&types[0]).unwrap();
        let t2 = store.create(&types[0]).unwrap();
        let two_free = PatternBuilder::new(&types, "T")
            .site("a")
            .open()
            .site("a")
            .open()
            .build()
            .unwrap();
        // three free copies give 3 * 2 ordered assignments
        assert_eq!(two_free.match_count_rooted(&store, t), 6);
        store.set_bond(t, 0, t2, 0).unwrap();
        store.set_bond(t, 1, t2, 1).unwrap();
        // one free copy left: the two template sites would have to share it
        assert_eq!(two_free.match_count_rooted(&store, t), 0);
    }

    #[test]
    fn test_anchor_plans_cover_chain_pattern() {
        let (types, mut store) = world();
        // A(a!1).A(a!1) chain over T molecules using two of the symmetric sites
        let chain = PatternBuilder::new(&types, "T")
            .site("a")
            .bond(1)
            .node("T")
            .site("a")
            .bond(1)
            .site("a")
            .open()
            .build()
            .unwrap();
        let x = store.create(&types[0]).unwrap();
        let y = store.create(&types[0]).unwrap();
        store.set_bond(x, 2, y, 0).unwrap();
        let mut out = Vec::new();
        // anchored at the middle node
        chain.match_all_anchored(&store, 1, y, &mut out);
        assert!(!out.is_empty());
        for ms in &out {
            assert_eq!(ms.mols, vec![x, y]);
        }
    }
}
