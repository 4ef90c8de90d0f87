//! The simulation orchestrator.
//!
//! [`Simulation`] owns every registry (molecule types, molecules, complexes,
//! rules, observables, functions, parameters) and runs the stochastic loop:
//! draw an exponential waiting time from the total propensity, pick a rule by
//! cumulative propensity, pick its mapping sets, validate and apply the
//! transformation, then repair membership, observables, and propensities over
//! the touched neighborhood. Rejected firings are null events: counted, time
//! advanced, nothing mutated.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, trace};

use crate::complex::{Canonicalizer, ComplexRegistry, SignatureCanonicalizer};
use crate::error::SimError;
use crate::funcs::{GlobalFn, GlobalScope, RateExpr};
use crate::molecule::{
    Bond, ComplexId, MolId, Molecule, MoleculeStore, MoleculeType, MoleculeTypeDef, RuleSlot,
    TypeId,
};
use crate::observable::{Observable, ObservableKind};
use crate::output::{FiringRecord, SampleRow};
use crate::pattern::{MappingSet, PatternBuilder};
use crate::rule::{CompiledRate, ReactionRule, RuleDef, RuleKind};
use crate::transform::{SitePath, Transform};

/// What one scheduler step did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// A rule fired and state changed.
    Fired,
    /// The drawn firing was rejected; time advanced, nothing mutated.
    Null,
    /// The next event would land past the requested stop time.
    ReachedStop,
    /// Total propensity is zero; the state is absorbing.
    Exhausted,
    /// Cancellation or the CPU budget ended the walk.
    Stopped,
}

/// A rule-based stochastic simulation: registries, clock, and scheduler.
pub struct Simulation {
    name: String,
    types: Vec<MoleculeType>,
    store: MoleculeStore,
    complexes: ComplexRegistry,
    canonicalizer: Box<dyn Canonicalizer>,
    rules: Vec<ReactionRule>,
    observables: Vec<Observable>,
    global_fns: Vec<GlobalFn>,
    params: HashMap<String, f64>,
    connected: Vec<Vec<bool>>,
    use_connectivity: bool,
    complex_scoped_local_fns: bool,
    traversal_limit: Option<usize>,
    a_tot: f64,
    current_time: f64,
    event_count: u64,
    null_event_count: u64,
    prepared: bool,
    rng: StdRng,
    max_cpu: Option<Duration>,
    started: Option<Instant>,
    cancel: Arc<AtomicBool>,
    trace: Vec<SampleRow>,
    firing_log: Option<Vec<FiringRecord>>,
    output_global_fns: bool,
}

impl Simulation {
    /// A simulation with the default deterministic seed. Use
    /// [`Simulation::with_seed`] for independent replicas.
    pub fn new(name: &str) -> Self {
        Simulation::with_seed(name, 0)
    }

    pub fn with_seed(name: &str, seed: u64) -> Self {
        Simulation {
            name: name.to_string(),
            types: Vec::new(),
            store: MoleculeStore::new(),
            complexes: ComplexRegistry::new(),
            canonicalizer: Box::new(SignatureCanonicalizer),
            rules: Vec::new(),
            observables: Vec::new(),
            global_fns: Vec::new(),
            params: HashMap::new(),
            connected: Vec::new(),
            use_connectivity: true,
            complex_scoped_local_fns: true,
            traversal_limit: None,
            a_tot: 0.0,
            current_time: 0.0,
            event_count: 0,
            null_event_count: 0,
            prepared: false,
            rng: StdRng::seed_from_u64(seed),
            max_cpu: None,
            started: None,
            cancel: Arc::new(AtomicBool::new(false)),
            trace: Vec::new(),
            firing_log: None,
            output_global_fns: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ------------------------------------------------------------------
    // construction

    pub fn add_molecule_type(&mut self, def: MoleculeTypeDef) -> Result<TypeId, SimError> {
        if self.prepared {
            return Err(SimError::ModelValidation(
                "molecule types cannot be added after preparation".to_string(),
            ));
        }
        if self.types.iter().any(|t| t.name == def.name) {
            return Err(SimError::ModelValidation(format!(
                "duplicate molecule type {}",
                def.name
            )));
        }
        let id = self.types.len();
        let ty = def.compile(id)?;
        self.types.push(ty);
        self.store.register_type();
        Ok(id)
    }

    /// Start a pattern rooted at the named type.
    pub fn pattern(&self, root: &str) -> PatternBuilder<'_> {
        PatternBuilder::new(&self.types, root)
    }

    pub fn add_reaction(&mut self, def: RuleDef) -> Result<usize, SimError> {
        if self.prepared {
            return Err(SimError::ModelValidation(
                "rules cannot be added after preparation".to_string(),
            ));
        }
        if self.rules.iter().any(|r| r.name == def.name) {
            return Err(SimError::ModelValidation(format!(
                "duplicate rule {}",
                def.name
            )));
        }
        let id = self.rules.len();
        let rule = ReactionRule::compile(def, id, &self.types)?;
        self.rules.push(rule);
        Ok(id)
    }

    pub fn add_observable(&mut self, obs: Observable) -> Result<usize, SimError> {
        if self.prepared {
            return Err(SimError::ModelValidation(
                "observables cannot be added after preparation".to_string(),
            ));
        }
        if self.observables.iter().any(|o| o.name == obs.name) {
            return Err(SimError::ModelValidation(format!(
                "duplicate observable {}",
                obs.name
            )));
        }
        self.observables.push(obs);
        Ok(self.observables.len() - 1)
    }

    pub fn add_global_function(&mut self, name: &str, expr: RateExpr) {
        self.global_fns.push(GlobalFn {
            name: name.to_string(),
            expr,
        });
    }

    pub fn add_parameter(&mut self, name: &str, value: f64) {
        self.params.insert(name.to_string(), value);
    }

    /// Update an existing parameter; call
    /// [`Simulation::update_system_with_new_parameters`] afterwards.
    pub fn set_parameter(&mut self, name: &str, value: f64) -> Result<(), SimError> {
        match self.params.get_mut(name) {
            Some(v) => {
                *v = value;
                Ok(())
            }
            None => Err(SimError::ModelValidation(format!(
                "unknown parameter {}",
                name
            ))),
        }
    }

    pub fn set_universal_traversal_limit(&mut self, limit: Option<usize>) {
        self.traversal_limit = limit;
    }

    pub fn set_connectivity_inference(&mut self, on: bool) {
        self.use_connectivity = on;
    }

    pub fn set_complex_scoped_local_functions(&mut self, on: bool) {
        self.complex_scoped_local_fns = on;
    }

    pub fn set_molecule_limit(&mut self, limit: usize) {
        self.store.molecule_limit = limit;
    }

    pub fn set_canonicalizer(&mut self, canon: Box<dyn Canonicalizer>) {
        self.canonicalizer = canon;
    }

    pub fn set_max_cpu_time(&mut self, budget: Duration) {
        self.max_cpu = Some(budget);
    }

    /// Handle for cooperative cancellation, checked once per event.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Keep per-event firing records in memory.
    pub fn enable_firing_log(&mut self) {
        if self.firing_log.is_none() {
            self.firing_log = Some(Vec::new());
        }
    }

    /// Sample global function values alongside the observables.
    pub fn enable_global_function_output(&mut self) {
        self.output_global_fns = true;
    }

    // ------------------------------------------------------------------
    // molecules

    /// Create `count` default molecules of a type, each its own complex.
    pub fn add_molecules(&mut self, ty: TypeId, count: usize) -> Result<Vec<MolId>, SimError> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let m = self.store.create(&self.types[ty])?;
            self.complexes.create(&mut self.store, m);
            out.push(m);
        }
        if self.prepared {
            self.repair(out.clone(), None)?;
        }
        Ok(out)
    }

    /// Create one lumped-population instance holding `count`.
    pub fn add_population(&mut self, ty: TypeId, count: i64) -> Result<MolId, SimError> {
        if !self.types[ty].population_type {
            return Err(SimError::ModelValidation(format!(
                "type {} is not a population type",
                self.types[ty].name
            )));
        }
        let m = self.add_molecules(ty, 1)?[0];
        self.store.molecule_mut(m).population = count;
        if self.prepared {
            self.repair(vec![m], None)?;
        }
        Ok(m)
    }

    pub fn set_population(&mut self, m: MolId, count: i64) -> Result<(), SimError> {
        let mol = self.store.molecule(m);
        if !self.types[mol.type_id].population_type {
            return Err(SimError::ModelValidation(format!(
                "molecule {} is not a population instance",
                mol.unique_id
            )));
        }
        if count < 0 {
            return Err(SimError::PopulationUnderflow {
                uid: mol.unique_id,
            });
        }
        self.store.molecule_mut(m).population = count;
        if self.prepared {
            self.repair(vec![m], None)?;
        }
        Ok(())
    }

    /// Bond two molecules on the first open copies of the named sites.
    pub fn bind(
        &mut self,
        a: MolId,
        a_site: &str,
        b: MolId,
        b_site: &str,
    ) -> Result<(), SimError> {
        let ca = self.open_site(a, a_site)?;
        let cb = self.open_site(b, b_site)?;
        self.store.set_bond(a, ca, b, cb)?;
        self.merge_complexes(a, b);
        if self.prepared {
            self.repair(vec![a, b], None)?;
        }
        Ok(())
    }

    /// Remove the bond on the first bonded copy of the named site. Returns
    /// the partner's unique id and component for logging.
    pub fn unbind(&mut self, a: MolId, a_site: &str) -> Result<(u64, usize), SimError> {
        let mol = self.store.molecule(a);
        let ty = &self.types[mol.type_id];
        let comps = ty.resolve_site(a_site).ok_or_else(|| {
            SimError::ModelValidation(format!("type {} has no site {}", ty.name, a_site))
        })?;
        let c = comps
            .iter()
            .copied()
            .find(|&c| mol.bonds[c].is_some())
            .ok_or(SimError::SiteUnbound {
                uid: mol.unique_id,
                site: comps[0],
            })?;
        let bond = self.store.clear_bond(a, c)?;
        let partner_uid = self.store.molecule(bond.partner).unique_id;
        self.complexes
            .split_after_unbind(&mut self.store, a, bond.partner);
        if self.prepared {
            self.repair(vec![a, bond.partner], None)?;
        }
        Ok((partner_uid, bond.partner_site))
    }

    /// Set a named state on a molecule's site.
    pub fn set_state(&mut self, m: MolId, site: &str, state: &str) -> Result<(), SimError> {
        let mol = self.store.molecule(m);
        let ty = &self.types[mol.type_id];
        let comps = ty.resolve_site(site).ok_or_else(|| {
            SimError::ModelValidation(format!("type {} has no site {}", ty.name, site))
        })?;
        let value = ty.state_value(comps[0], state)?;
        self.store.set_state(m, comps[0], value);
        let cid = self.store.molecule(m).complex_id;
        self.complexes.touch(cid);
        if self.prepared {
            self.repair(vec![m], None)?;
        }
        Ok(())
    }

    fn open_site(&self, m: MolId, site: &str) -> Result<usize, SimError> {
        let mol = self.store.molecule(m);
        let ty = &self.types[mol.type_id];
        let comps = ty.resolve_site(site).ok_or_else(|| {
            SimError::ModelValidation(format!("type {} has no site {}", ty.name, site))
        })?;
        comps
            .iter()
            .copied()
            .find(|&c| mol.is_site_open(c))
            .ok_or(SimError::SiteOccupied {
                uid: mol.unique_id,
                site: comps[0],
            })
    }

    // ------------------------------------------------------------------
    // preparation

    /// Index the model and populate every bookkeeping structure. Must run
    /// once before stepping; safe to run again on an unchanged model.
    pub fn prepare_for_simulation(&mut self) -> Result<(), SimError> {
        // rebuild the per-type slot and observable lists
        for ty in &mut self.types {
            ty.rxn_slots.clear();
            ty.mol_obs.clear();
        }
        for rule in &self.rules {
            for (pos, pattern) in rule.patterns.iter().enumerate() {
                for node in &pattern.nodes {
                    let slots = &mut self.types[node.type_id].rxn_slots;
                    let slot = RuleSlot {
                        rule: rule.id,
                        pos,
                    };
                    if !slots.contains(&slot) {
                        slots.push(slot);
                    }
                }
            }
        }
        for (oi, obs) in self.observables.iter().enumerate() {
            if obs.kind == ObservableKind::Molecules {
                for pattern in &obs.patterns {
                    let list = &mut self.types[pattern.root_type()].mol_obs;
                    if !list.contains(&oi) {
                        list.push(oi);
                    }
                }
            }
        }
        self.store.resize_bookkeeping(&self.types);
        for rule in &mut self.rules {
            for list in &mut rule.lists {
                list.clear();
            }
        }
        for obs in &mut self.observables {
            obs.count = 0.0;
            obs.matching_complexes.clear();
        }

        // observables first: weighted-rate rules read them while matching
        {
            let Simulation {
                types,
                store,
                complexes,
                observables,
                ..
            } = self;
            for ty in types.iter() {
                for (k, &oi) in ty.mol_obs.iter().enumerate() {
                    let mols = store.live_of_type(ty.id).to_vec();
                    for m in mols {
                        let mult = observables[oi].multiplicity_of(store, m);
                        store.molecule_mut(m).obs_mult[k] = mult;
                        observables[oi].count += f64::from(mult);
                    }
                }
            }
            for obs in observables.iter_mut() {
                if obs.kind == ObservableKind::Species {
                    let matches: Vec<ComplexId> = complexes
                        .live()
                        .filter(|c| obs.complex_matches(store, &c.members))
                        .map(|c| c.id)
                        .collect();
                    for cid in matches {
                        obs.note_complex(cid, true);
                    }
                }
            }
        }

        self.refresh_base_rates()?;

        // populate the reactant lists
        {
            let Simulation {
                rules,
                store,
                types,
                complexes,
                observables,
                complex_scoped_local_fns,
                ..
            } = self;
            for ty in types.iter() {
                let mols = store.live_of_type(ty.id).to_vec();
                for slot in ty.rxn_slots.clone() {
                    for &m in &mols {
                        rules[slot.rule].try_to_add(
                            store,
                            types,
                            complexes,
                            observables,
                            *complex_scoped_local_fns,
                            slot.pos,
                            m,
                        )?;
                    }
                }
            }
        }

        // connected-rule inference
        let n = self.rules.len();
        let mut connected = vec![vec![false; n]; n];
        for r1 in 0..n {
            for (ty, class) in self.rules[r1].modified_signature(&self.types) {
                for (r2, row) in self.rules.iter().enumerate() {
                    if !connected[r1][r2] && row.interested_in(&self.types, ty, class) {
                        connected[r1][r2] = true;
                    }
                }
            }
        }
        self.connected = connected;

        self.recompute_a_tot();
        self.prepared = true;
        info!(
            system = %self.name,
            types = self.types.len(),
            rules = self.rules.len(),
            molecules = self.store.live_count(),
            a_tot = self.a_tot,
            "prepared for simulation"
        );
        Ok(())
    }

    fn refresh_base_rates(&mut self) -> Result<(), SimError> {
        let Simulation {
            rules,
            observables,
            params,
            current_time,
            ..
        } = self;
        for rule in rules.iter_mut() {
            let new_base = match &rule.rate {
                CompiledRate::Param(p) => Some(*params.get(p).ok_or_else(|| {
                    SimError::ModelValidation(format!(
                        "rule {} references unknown parameter {}",
                        rule.name, p
                    ))
                })?),
                CompiledRate::Expr(e) => {
                    let scope = GlobalScope {
                        params,
                        observables,
                        time: *current_time,
                    };
                    Some(e(&scope)?)
                }
                _ => None,
            };
            if let Some(b) = new_base {
                rule.base_rate = b;
            }
        }
        Ok(())
    }

    fn refresh_expr_rates(&mut self) -> Result<(), SimError> {
        let Simulation {
            rules,
            observables,
            params,
            current_time,
            ..
        } = self;
        for rule in rules.iter_mut() {
            if let CompiledRate::Expr(e) = &rule.rate {
                let scope = GlobalScope {
                    params,
                    observables,
                    time: *current_time,
                };
                let b = e(&scope)?;
                rule.base_rate = b;
            }
        }
        Ok(())
    }

    fn recompute_a_tot(&mut self) {
        self.a_tot = 0.0;
        for rule in self.rules.iter_mut() {
            rule.a = rule.compute_a(&self.store);
            self.a_tot += rule.a;
        }
    }

    /// Re-resolve parameter-bound and expression rates, then all propensities.
    pub fn update_system_with_new_parameters(&mut self) -> Result<(), SimError> {
        self.refresh_base_rates()?;
        self.recompute_a_tot();
        Ok(())
    }

    // ------------------------------------------------------------------
    // scheduler

    /// Fire (or reject) exactly one event, with no stop time.
    pub fn single_step(&mut self) -> Result<StepOutcome, SimError> {
        self.step_within(f64::INFINITY)
    }

    fn step_within(&mut self, stop: f64) -> Result<StepOutcome, SimError> {
        if !self.prepared {
            return Err(SimError::ModelValidation(
                "prepare_for_simulation must run before stepping".to_string(),
            ));
        }
        if self.cancel.load(Ordering::Relaxed) {
            return Ok(StepOutcome::Stopped);
        }
        if let (Some(budget), Some(started)) = (self.max_cpu, self.started) {
            if started.elapsed() > budget {
                return Ok(StepOutcome::Stopped);
            }
        }
        if self.a_tot <= 0.0 {
            return Ok(StepOutcome::Exhausted);
        }
        let u: f64 = 1.0 - self.rng.gen::<f64>();
        let tau = -u.ln() / self.a_tot;
        if self.current_time + tau > stop {
            return Ok(StepOutcome::ReachedStop);
        }
        let target = self.rng.gen::<f64>() * self.a_tot;
        let mut cumsum = 0.0;
        let mut ri = self.rules.len() - 1;
        for (i, rule) in self.rules.iter().enumerate() {
            cumsum += rule.a.max(0.0);
            if target <= cumsum {
                ri = i;
                break;
            }
        }
        self.current_time += tau;
        self.event_count += 1;
        match self.attempt_fire(ri) {
            Ok(()) => Ok(StepOutcome::Fired),
            Err(e) if e.is_null_event() => {
                self.null_event_count += 1;
                trace!(rule = %self.rules[ri].name, reason = %e, "null event");
                Ok(StepOutcome::Null)
            }
            Err(e) => Err(e),
        }
    }

    fn attempt_fire(&mut self, ri: usize) -> Result<(), SimError> {
        let picks = self.rules[ri].pick(&mut self.rng).ok_or_else(|| {
            SimError::Internal(format!(
                "rule {} has positive propensity but an empty reactant list",
                self.rules[ri].name
            ))
        })?;
        let mut sets: Vec<MappingSet> = Vec::with_capacity(picks.len());
        for &(pos, id) in &picks {
            let ms = self.rules[ri].lists[pos].get(id).cloned().ok_or_else(|| {
                SimError::Internal("picked mapping set vanished".to_string())
            })?;
            sets.push(ms);
        }
        // one molecule may not serve two reactant slots at once
        let mut seen = HashSet::new();
        for ms in &sets {
            for &m in &ms.mols {
                if !seen.insert(m) {
                    return Err(SimError::ReactantClash {
                        uid: self.store.molecule(m).unique_id,
                    });
                }
            }
        }
        self.validate_transforms(ri, &sets)?;
        let reactant_uids: Vec<u64> = sets
            .iter()
            .flat_map(|ms| ms.mols.iter().map(|&m| self.store.molecule(m).unique_id))
            .collect();
        let touched = self.apply_transforms(ri, &sets)?;
        self.rules[ri].fire_count += 1;
        if self.firing_log.is_some() {
            let product_uids: Vec<u64> = touched
                .iter()
                .map(|&m| self.store.molecule(m).unique_id)
                .collect();
            let record = FiringRecord {
                event_index: self.event_count,
                time: self.current_time,
                rule_id: ri,
                rule_name: self.rules[ri].name.clone(),
                reactant_uids,
                product_uids,
            };
            if let Some(log) = &mut self.firing_log {
                log.push(record);
            }
        }
        debug!(rule = %self.rules[ri].name, t = self.current_time, "fired");
        self.repair(touched, Some(ri))?;
        Ok(())
    }

    /// Reject-before-mutate: every way the transformation could fail is
    /// checked against the chosen mapping sets before anything is written.
    fn validate_transforms(&self, ri: usize, sets: &[MappingSet]) -> Result<(), SimError> {
        let rule = &self.rules[ri];
        let store = &self.store;
        let mut planned_bound: HashSet<(MolId, usize)> = HashSet::new();
        let mut planned_freed: HashSet<(MolId, usize)> = HashSet::new();
        let mut planned_creates: HashMap<TypeId, usize> = HashMap::new();
        let mut planned_dec: HashMap<MolId, i64> = HashMap::new();
        for op in &rule.transforms.ops {
            match op {
                Transform::SetState { .. } => {}
                Transform::Bind { a, b } => {
                    let (ma, ca) = mapped_site(rule, sets, a);
                    let (mb, cb) = mapped_site(rule, sets, b);
                    if ma == mb && ca == cb {
                        return Err(SimError::Internal(
                            "bind targets one site twice".to_string(),
                        ));
                    }
                    for &(m, c) in &[(ma, ca), (mb, cb)] {
                        let occupied = (store.molecule(m).bonds[c].is_some()
                            && !planned_freed.contains(&(m, c)))
                            || planned_bound.contains(&(m, c));
                        if occupied {
                            return Err(SimError::SiteOccupied {
                                uid: store.molecule(m).unique_id,
                                site: c,
                            });
                        }
                    }
                    if rule.transforms.forbid_intra_complex
                        && store.molecule(ma).complex_id == store.molecule(mb).complex_id
                    {
                        return Err(SimError::ComplexMergeForbidden {
                            rule: rule.name.clone(),
                            complex: store.molecule(ma).complex_id,
                        });
                    }
                    planned_bound.insert((ma, ca));
                    planned_bound.insert((mb, cb));
                }
                Transform::Unbind { at } => {
                    let (m, c) = mapped_site(rule, sets, at);
                    match store.molecule(m).bonds[c] {
                        Some(b) if !planned_freed.contains(&(m, c)) => {
                            planned_freed.insert((m, c));
                            planned_freed.insert((b.partner, b.partner_site));
                        }
                        _ => {
                            return Err(SimError::SiteUnbound {
                                uid: store.molecule(m).unique_id,
                                site: c,
                            })
                        }
                    }
                }
                Transform::Create { type_id, bond } => {
                    let n = planned_creates.entry(*type_id).or_insert(0);
                    *n += 1;
                    if store.live_of_type(*type_id).len() + *n > store.molecule_limit {
                        return Err(SimError::MoleculeLimit {
                            type_name: self.types[*type_id].name.clone(),
                            limit: store.molecule_limit,
                        });
                    }
                    if let Some((_, to)) = bond {
                        let (m, c) = mapped_site(rule, sets, to);
                        let occupied = (store.molecule(m).bonds[c].is_some()
                            && !planned_freed.contains(&(m, c)))
                            || planned_bound.contains(&(m, c));
                        if occupied {
                            return Err(SimError::SiteOccupied {
                                uid: store.molecule(m).unique_id,
                                site: c,
                            });
                        }
                        planned_bound.insert((m, c));
                    }
                }
                Transform::Destroy { .. } => {}
                Transform::IncPop { .. } => {}
                Transform::DecPop { reactant, node } => {
                    let m = sets[*reactant].mols[*node];
                    let d = planned_dec.entry(m).or_insert(0);
                    *d += 1;
                    if store.molecule(m).population - *d < 0 {
                        return Err(SimError::PopulationUnderflow {
                            uid: store.molecule(m).unique_id,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_transforms(
        &mut self,
        ri: usize,
        sets: &[MappingSet],
    ) -> Result<Vec<MolId>, SimError> {
        let ops = self.rules[ri].transforms.ops.clone();
        let mut touched: Vec<MolId> = sets
            .iter()
            .flat_map(|ms| ms.mols.iter().copied())
            .collect();
        for op in &ops {
            match op {
                Transform::SetState { target, value } => {
                    let (m, c) = mapped_site(&self.rules[ri], sets, target);
                    self.store.set_state(m, c, *value);
                    let cid = self.store.molecule(m).complex_id;
                    self.complexes.touch(cid);
                }
                Transform::Bind { a, b } => {
                    let (ma, ca) = mapped_site(&self.rules[ri], sets, a);
                    let (mb, cb) = mapped_site(&self.rules[ri], sets, b);
                    self.store.set_bond(ma, ca, mb, cb)?;
                    self.merge_complexes(ma, mb);
                }
                Transform::Unbind { at } => {
                    let (m, c) = mapped_site(&self.rules[ri], sets, at);
                    let bond = self.store.clear_bond(m, c)?;
                    self.complexes
                        .split_after_unbind(&mut self.store, m, bond.partner);
                    touched.push(bond.partner);
                }
                Transform::Create { type_id, bond } => {
                    let new = self.store.create(&self.types[*type_id])?;
                    self.complexes.create(&mut self.store, new);
                    touched.push(new);
                    if let Some((comp, to)) = bond {
                        let (m, c) = mapped_site(&self.rules[ri], sets, to);
                        self.store.set_bond(new, *comp, m, c)?;
                        self.merge_complexes(new, m);
                    }
                }
                Transform::Destroy { reactant, node } => {
                    let m = sets[*reactant].mols[*node];
                    self.destroy_molecule(m, &mut touched)?;
                }
                Transform::IncPop { reactant, node } => {
                    let m = sets[*reactant].mols[*node];
                    self.store.molecule_mut(m).population += 1;
                }
                Transform::DecPop { reactant, node } => {
                    let m = sets[*reactant].mols[*node];
                    self.store.molecule_mut(m).population -= 1;
                }
            }
        }
        let mut seen = HashSet::new();
        touched.retain(|&m| self.store.molecule(m).alive && seen.insert(m));
        Ok(touched)
    }

    fn merge_complexes(&mut self, a: MolId, b: MolId) {
        let ca = self.store.molecule(a).complex_id;
        let cb = self.store.molecule(b).complex_id;
        let kept = self.complexes.merge(&mut self.store, a, b);
        if ca != cb {
            let freed = if kept == ca { cb } else { ca };
            for obs in &mut self.observables {
                obs.forget_complex(freed);
            }
        }
    }

    fn destroy_molecule(
        &mut self,
        m: MolId,
        touched: &mut Vec<MolId>,
    ) -> Result<(), SimError> {
        let n_sites = self.store.molecule(m).bonds.len();
        for c in 0..n_sites {
            if self.store.molecule(m).bonds[c].is_some() {
                let bond = self.store.clear_bond(m, c)?;
                self.complexes
                    .split_after_unbind(&mut self.store, m, bond.partner);
                touched.push(bond.partner);
            }
        }
        let ty = self.store.molecule(m).type_id;
        let slots = self.types[ty].rxn_slots.clone();
        {
            let Simulation {
                rules,
                store,
                types,
                ..
            } = self;
            for slot in slots {
                rules[slot.rule].remove_molecule(store, types, slot.pos, m);
            }
        }
        {
            let Simulation {
                store,
                types,
                observables,
                ..
            } = self;
            let obs_list = types[ty].mol_obs.clone();
            for (k, oi) in obs_list.into_iter().enumerate() {
                let mult = store.molecule(m).obs_mult[k];
                observables[oi].count -= f64::from(mult);
            }
        }
        let cid = self.complexes.remove_member(&self.store, m);
        if !self.complexes.get(cid).is_alive() {
            for obs in &mut self.observables {
                obs.forget_complex(cid);
            }
        }
        self.store.remove(m)?;
        Ok(())
    }

    /// Re-establish every piece of bookkeeping around the touched molecules:
    /// observables, species matches, rule membership (pruned to rules
    /// connected to the fired one), and finally the propensities.
    fn repair(&mut self, touched: Vec<MolId>, fired: Option<usize>) -> Result<(), SimError> {
        let limit = self.traversal_limit;
        let mut affected: Vec<MolId> = Vec::new();
        let mut seen = HashSet::new();
        for &m in &touched {
            if !self.store.molecule(m).alive {
                continue;
            }
            for n in self.store.bonded_neighborhood(m, limit) {
                if seen.insert(n) {
                    affected.push(n);
                }
            }
        }
        trace!(touched = touched.len(), affected = affected.len(), "repair");

        // molecule observables
        {
            let Simulation {
                types,
                store,
                observables,
                ..
            } = self;
            for &m in &affected {
                let ty = store.molecule(m).type_id;
                let obs_list = types[ty].mol_obs.clone();
                for (k, oi) in obs_list.into_iter().enumerate() {
                    let new_mult = observables[oi].multiplicity_of(store, m);
                    let old_mult = store.molecule(m).obs_mult[k];
                    if new_mult != old_mult {
                        observables[oi].count += f64::from(new_mult - old_mult);
                        store.molecule_mut(m).obs_mult[k] = new_mult;
                    }
                }
            }
        }

        // species observables over the affected complexes
        {
            let Simulation {
                store,
                complexes,
                observables,
                ..
            } = self;
            let mut cids = HashSet::new();
            for &m in &affected {
                cids.insert(store.molecule(m).complex_id);
            }
            for obs in observables.iter_mut() {
                if obs.kind == ObservableKind::Species {
                    for &cid in &cids {
                        let c = complexes.get(cid);
                        if c.is_alive() {
                            let matched = obs.complex_matches(store, &c.members);
                            obs.note_complex(cid, matched);
                        } else {
                            obs.forget_complex(cid);
                        }
                    }
                }
            }
        }

        // rule membership
        let mut dirty: BTreeSet<usize> = BTreeSet::new();
        {
            let Simulation {
                rules,
                store,
                types,
                complexes,
                observables,
                connected,
                use_connectivity,
                complex_scoped_local_fns,
                ..
            } = self;
            for &m in &affected {
                let ty = store.molecule(m).type_id;
                let slots = types[ty].rxn_slots.clone();
                for slot in slots {
                    if *use_connectivity {
                        if let Some(f) = fired {
                            if !connected[f][slot.rule] {
                                continue;
                            }
                        }
                    }
                    rules[slot.rule].try_to_add(
                        store,
                        types,
                        complexes,
                        observables,
                        *complex_scoped_local_fns,
                        slot.pos,
                        m,
                    )?;
                    dirty.insert(slot.rule);
                }
            }
        }

        // propensities
        self.refresh_expr_rates()?;
        if let Some(f) = fired {
            dirty.insert(f);
        }
        for (i, rule) in self.rules.iter().enumerate() {
            if matches!(rule.kind, RuleKind::ObsDependent) {
                dirty.insert(i);
            }
        }
        for ri in dirty {
            let delta = self.rules[ri].update_a(&self.store);
            self.a_tot += delta;
        }
        Ok(())
    }

    fn advance_to(&mut self, stop: f64, snap: bool) -> Result<(), SimError> {
        loop {
            match self.step_within(stop)? {
                StepOutcome::Fired | StepOutcome::Null => continue,
                StepOutcome::ReachedStop => {
                    if snap {
                        self.current_time = stop;
                    }
                    break;
                }
                StepOutcome::Exhausted => {
                    if snap {
                        self.current_time = stop;
                    }
                    break;
                }
                StepOutcome::Stopped => break,
            }
        }
        Ok(())
    }

    /// Run for `duration`, recording exactly `samples` evenly spaced rows.
    /// Returns the final time.
    pub fn sim(&mut self, duration: f64, samples: u64, verbose: bool) -> Result<f64, SimError> {
        self.started = Some(Instant::now());
        let start = self.current_time;
        let n = samples.max(1);
        info!(system = %self.name, duration, samples = n, "simulation start");
        for k in 1..=n {
            // the final sample lands exactly on start + duration
            let t_sample = start + duration * (k as f64) / (n as f64);
            self.advance_to(t_sample, true)?;
            self.record_sample(t_sample)?;
            if verbose {
                if let Some(row) = self.trace.last() {
                    info!(t = row.time, events = row.events, values = ?row.values, "sample");
                }
            }
        }
        Ok(self.current_time)
    }

    /// Step events until the stop time without recording output. The clock is
    /// left at the last event, strictly before `stop`.
    pub fn step_to(&mut self, stop: f64) -> Result<f64, SimError> {
        self.started = Some(Instant::now());
        self.advance_to(stop, false)?;
        Ok(self.current_time)
    }

    /// Run without output for `duration`, then reset the clock to zero as if
    /// no time had elapsed.
    pub fn equilibrate(&mut self, duration: f64, status_reports: u32) -> Result<(), SimError> {
        self.started = Some(Instant::now());
        let start = self.current_time;
        let chunks = status_reports.max(1);
        let dt = duration / f64::from(chunks);
        for k in 1..=chunks {
            self.advance_to(start + dt * f64::from(k), true)?;
            if status_reports > 0 {
                info!(system = %self.name, t = self.current_time, "equilibration progress");
            }
        }
        self.current_time = 0.0;
        Ok(())
    }

    fn record_sample(&mut self, t: f64) -> Result<(), SimError> {
        let mut values: Vec<f64> = self.observables.iter().map(|o| o.value()).collect();
        if self.output_global_fns {
            let scope = GlobalScope {
                params: &self.params,
                observables: &self.observables,
                time: t,
            };
            for f in &self.global_fns {
                values.push((f.expr)(&scope)?);
            }
        }
        self.trace.push(SampleRow {
            time: t,
            events: self.event_count,
            values,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // dumps and lookups

    /// Write one `count\tcanonical_label` line per distinct species.
    pub fn save_species<P: AsRef<Path>>(&mut self, path: P) -> io::Result<()> {
        let mut hist: BTreeMap<String, usize> = BTreeMap::new();
        let cids: Vec<ComplexId> = self.complexes.live().map(|c| c.id).collect();
        for cid in cids {
            let Simulation {
                complexes,
                store,
                types,
                canonicalizer,
                ..
            } = self;
            let label = complexes
                .canonical_label(cid, store, types, canonicalizer.as_ref())
                .to_string();
            *hist.entry(label).or_insert(0) += 1;
        }
        let mut w = BufWriter::new(File::create(path)?);
        for (label, count) in hist {
            writeln!(w, "{}\t{}", count, label)?;
        }
        Ok(())
    }

    pub fn type_id(&self, name: &str) -> Result<TypeId, SimError> {
        self.types
            .iter()
            .position(|t| t.name == name)
            .ok_or_else(|| SimError::ModelValidation(format!("unknown molecule type {}", name)))
    }

    pub fn molecule_type(&self, name: &str) -> Option<&MoleculeType> {
        self.types.iter().find(|t| t.name == name)
    }

    /// Live molecules of a named type.
    pub fn molecules_of(&self, name: &str) -> Vec<MolId> {
        match self.type_id(name) {
            Ok(t) => self.store.live_of_type(t).to_vec(),
            Err(_) => Vec::new(),
        }
    }

    /// Live instance count of a named type.
    pub fn molecule_count(&self, name: &str) -> usize {
        self.molecules_of(name).len()
    }

    /// Summed lumped count over instances of a population type.
    pub fn population_of(&self, name: &str) -> i64 {
        self.molecules_of(name)
            .iter()
            .map(|&m| self.store.molecule(m).population)
            .sum()
    }

    pub fn observable_value(&self, name: &str) -> Option<f64> {
        self.observables
            .iter()
            .find(|o| o.name == name)
            .map(|o| o.value())
    }

    pub fn rule(&self, name: &str) -> Option<&ReactionRule> {
        self.rules.iter().find(|r| r.name == name)
    }

    /// Quiet lookup of a molecule by unique id; retired ids give `None`.
    pub fn molecule_by_uid(&self, uid: u64) -> Option<&Molecule> {
        self.store.by_uid(uid).map(|id| self.store.molecule(id))
    }

    /// Erroring lookup of a molecule by unique id.
    pub fn expect_molecule_by_uid(&self, uid: u64) -> Result<&Molecule, SimError> {
        self.molecule_by_uid(uid)
            .ok_or_else(|| SimError::Internal(format!("no live molecule with uid {}", uid)))
    }

    pub fn store(&self) -> &MoleculeStore {
        &self.store
    }

    pub fn complex_registry(&self) -> &ComplexRegistry {
        &self.complexes
    }

    pub fn current_time(&self) -> f64 {
        self.current_time
    }

    pub fn a_tot(&self) -> f64 {
        self.a_tot
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    pub fn null_event_count(&self) -> u64 {
        self.null_event_count
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn trace(&self) -> &[SampleRow] {
        &self.trace
    }

    pub fn clear_trace(&mut self) {
        self.trace.clear();
    }

    pub fn firing_records(&self) -> &[FiringRecord] {
        self.firing_log.as_deref().unwrap_or(&[])
    }

    /// Column names matching the values in each [`SampleRow`].
    pub fn sample_columns(&self) -> Vec<String> {
        let mut cols: Vec<String> = self.observables.iter().map(|o| o.name.clone()).collect();
        if self.output_global_fns {
            cols.extend(self.global_fns.iter().map(|f| f.name.clone()));
        }
        cols
    }

    pub fn molecule_type_table(&self) -> Vec<(usize, String, usize)> {
        self.types
            .iter()
            .map(|t| (t.id, t.name.clone(), self.store.live_of_type(t.id).len()))
            .collect()
    }

    pub fn rule_table(&self) -> Vec<(usize, String, u64)> {
        self.rules
            .iter()
            .map(|r| (r.id, r.name.clone(), r.fire_count))
            .collect()
    }

    // ------------------------------------------------------------------
    // consistency checking

    /// Verify every bookkeeping invariant against a fresh full computation:
    /// bond symmetry, the complex partition, reactant-list soundness and
    /// completeness, the propensity sum, and observable counts.
    pub fn check_invariants(&self) -> Result<(), SimError> {
        for ty in &self.types {
            for &m in self.store.live_of_type(ty.id) {
                let mol = self.store.molecule(m);
                for (c, bond) in mol.bonds.iter().enumerate() {
                    if let Some(b) = bond {
                        let back = self.store.molecule(b.partner).bonds[b.partner_site];
                        if back
                            != Some(Bond {
                                partner: m,
                                partner_site: c,
                            })
                        {
                            return Err(SimError::Internal(format!(
                                "asymmetric bond at molecule {} site {}",
                                mol.unique_id, c
                            )));
                        }
                    }
                }
            }
        }
        self.complexes.check_partition(&self.store, &self.types)?;
        for rule in &self.rules {
            for (pos, pattern) in rule.patterns.iter().enumerate() {
                let mut fresh: HashSet<(Vec<MolId>, Vec<usize>)> = HashSet::new();
                for &m in self.store.live_of_type(pattern.root_type()) {
                    let mut out = Vec::new();
                    pattern.match_all_anchored(&self.store, 0, m, &mut out);
                    for ms in out {
                        fresh.insert((ms.mols, ms.sites));
                    }
                }
                let stored: HashSet<(Vec<MolId>, Vec<usize>)> = rule.lists[pos]
                    .iter()
                    .map(|(_, ms)| (ms.mols.clone(), ms.sites.clone()))
                    .collect();
                if fresh != stored {
                    return Err(SimError::Internal(format!(
                        "reactant list of rule {} slot {} diverged from a fresh match",
                        rule.name, pos
                    )));
                }
                if rule.lists[pos].claimed() != rule.lists[pos].len() {
                    return Err(SimError::Internal(format!(
                        "mapping-set pool leak in rule {} slot {}",
                        rule.name, pos
                    )));
                }
            }
        }
        let sum: f64 = self.rules.iter().map(|r| r.a).sum();
        if (sum - self.a_tot).abs() > 1e-6 * sum.abs().max(1.0) {
            return Err(SimError::Internal(format!(
                "a_tot {} diverged from propensity sum {}",
                self.a_tot, sum
            )));
        }
        for obs in &self.observables {
            let full = obs.recount(&self.store, &self.types, &self.complexes);
            if (obs.value() - full).abs() > 1e-9 {
                return Err(SimError::Internal(format!(
                    "observable {} reads {} but a full scan gives {}",
                    obs.name,
                    obs.value(),
                    full
                )));
            }
        }
        Ok(())
    }
}

fn mapped_site(rule: &ReactionRule, sets: &[MappingSet], path: &SitePath) -> (MolId, usize) {
    let ms = &sets[path.reactant];
    let comp = ms.sites[rule.patterns[path.reactant].flat_site(path.node, path.site)];
    (ms.mols[path.node], comp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::RateDef;
    use crate::transform::TransformDef;

    fn decay_model(seed: u64, k: f64, n: usize) -> Simulation {
        let mut sim = Simulation::with_seed("decay", seed);
        let x = sim.add_molecule_type(MoleculeTypeDef::new("X")).unwrap();
        sim.add_molecules(x, n).unwrap();
        let px = sim.pattern("X").build().unwrap();
        sim.add_observable(Observable::molecules("X", vec![px.clone()]))
            .unwrap();
        sim.add_reaction(
            RuleDef::new("degrade", RateDef::Constant(k))
                .reactant(px)
                .transform(TransformDef::Destroy {
                    reactant: 0,
                    node: 0,
                }),
        )
        .unwrap();
        sim.prepare_for_simulation().unwrap();
        sim
    }

    fn dimer_model(seed: u64, kon: f64, koff: f64, n: usize) -> Simulation {
        let mut sim = Simulation::with_seed("dimer", seed);
        let l = sim
            .add_molecule_type(MoleculeTypeDef::new("L").site("r"))
            .unwrap();
        sim.add_molecules(l, n).unwrap();
        let free = sim.pattern("L").site("r").open().build().unwrap();
        let bound = sim
            .pattern("L")
            .site("r")
            .bond(1)
            .node("L")
            .site("r")
            .bond(1)
            .build()
            .unwrap();
        sim.add_observable(Observable::molecules("FreeL", vec![free.clone()]))
            .unwrap();
        sim.add_observable(Observable::species("Dimer", vec![bound.clone()]))
            .unwrap();
        sim.add_reaction(
            RuleDef::new("assoc", RateDef::Constant(kon))
                .reactant(free.clone())
                .reactant(free)
                .transform(TransformDef::Bind {
                    a: (0, 0, "r".to_string()),
                    b: (1, 0, "r".to_string()),
                }),
        )
        .unwrap();
        sim.add_reaction(
            RuleDef::new("dissoc", RateDef::Constant(koff))
                .reactant(bound)
                .transform(TransformDef::Unbind {
                    reactant: 0,
                    node: 0,
                    site: "r".to_string(),
                }),
        )
        .unwrap();
        sim.prepare_for_simulation().unwrap();
        sim
    }

    #[test]
    fn test_monomolecular_decay_runs_to_near_extinction() {
        let mut sim = decay_model(42, 0.5, 100);
        assert_eq!(sim.a_tot(), 50.0);
        let end = sim.sim(10.0, 10, false).unwrap();
        assert_eq!(end, 10.0);
        // 100 * exp(-5) is about 0.67; any single trajectory sits low
        let left = sim.observable_value("X").unwrap();
        assert!(left <= 10.0, "expected near-extinction, saw {}", left);
        assert_eq!(left as usize, sim.molecule_count("X"));
        sim.check_invariants().unwrap();
    }

    #[test]
    fn test_trace_rows_and_monotone_counts() {
        let mut sim = decay_model(7, 0.5, 100);
        sim.sim(10.0, 20, false).unwrap();
        assert_eq!(sim.trace().len(), 20);
        let counts: Vec<f64> = sim.trace().iter().map(|r| r.values[0]).collect();
        for w in counts.windows(2) {
            assert!(w[1] <= w[0], "decay trace must be non-increasing");
        }
    }

    #[test]
    fn test_dimerization_reaches_detailed_balance_regime() {
        let mut sim = dimer_model(3, 0.01, 1.0, 100);
        sim.sim(30.0, 30, false).unwrap();
        sim.check_invariants().unwrap();
        // average the tail of the trajectory
        let tail: Vec<f64> = sim.trace().iter().rev().take(10).map(|r| r.values[0]).collect();
        let mean_free: f64 = tail.iter().sum::<f64>() / tail.len() as f64;
        // kon * Nf * (Nf - 1) = koff * 2 * Nd with Nf + 2 Nd = 100
        // solves to Nf around 62
        assert!(
            (45.0..80.0).contains(&mean_free),
            "free count {} far from the equilibrium regime",
            mean_free
        );
        // complexes and species observable agree
        let dimers = sim.observable_value("Dimer").unwrap();
        let free = sim.observable_value("FreeL").unwrap();
        assert_eq!(free + 2.0 * dimers, 100.0);
    }

    #[test]
    fn test_symmetric_sites_count_three_ways() {
        let mut sim = Simulation::with_seed("sym", 1);
        let t = sim
            .add_molecule_type(MoleculeTypeDef::new("T").sites("a", 3))
            .unwrap();
        sim.add_molecules(t, 1).unwrap();
        let free = sim.pattern("T").site("a").open().build().unwrap();
        sim.add_reaction(
            RuleDef::new("selfbind", RateDef::Constant(1.0))
                .reactant(free.clone())
                .reactant(free)
                .transform(TransformDef::Bind {
                    a: (0, 0, "a".to_string()),
                    b: (1, 0, "a".to_string()),
                }),
        )
        .unwrap();
        sim.prepare_for_simulation().unwrap();
        let rule = sim.rule("selfbind").unwrap();
        // one symmetric molecule occupies each slot three ways, not one
        assert_eq!(rule.reactant_count(0), 3);
        assert_eq!(rule.reactant_count(1), 3);
    }

    fn chain_model(seed: u64) -> Simulation {
        let mut sim = Simulation::with_seed("chain", seed);
        let a = sim
            .add_molecule_type(
                MoleculeTypeDef::new("A").site("s").site("l").site("r"),
            )
            .unwrap();
        let mols = sim.add_molecules(a, 10).unwrap();
        for w in mols.windows(2) {
            sim.bind(w[0], "r", w[1], "l").unwrap();
        }
        let free_s = sim.pattern("A").site("s").open().build().unwrap();
        sim.add_observable(Observable::molecules("FreeS", vec![free_s.clone()]))
            .unwrap();
        sim.add_reaction(
            RuleDef::new("pair", RateDef::Constant(1.0))
                .reactant(free_s.clone())
                .reactant(free_s)
                .transform(TransformDef::Bind {
                    a: (0, 0, "s".to_string()),
                    b: (1, 0, "s".to_string()),
                })
                .forbid_intra_complex(),
        )
        .unwrap();
        sim.prepare_for_simulation().unwrap();
        sim
    }

    #[test]
    fn test_forbidden_intra_complex_binds_are_null_events() {
        let mut sim = chain_model(5);
        let a0 = sim.a_tot();
        assert_eq!(a0, 100.0);
        for _ in 0..200 {
            let outcome = sim.single_step().unwrap();
            assert_eq!(outcome, StepOutcome::Null);
        }
        assert_eq!(sim.null_event_count(), 200);
        assert_eq!(sim.event_count(), 200);
        assert_eq!(sim.a_tot(), a0);
        assert_eq!(sim.observable_value("FreeS").unwrap(), 10.0);
        assert!(sim.current_time() > 0.0);
        sim.check_invariants().unwrap();
    }

    #[test]
    fn test_interevent_times_are_exponential() {
        // the all-null chain keeps a_tot constant, so waiting times are iid
        // exponential; compare against the analytic CDF
        let mut sim = chain_model(17);
        let a_tot = sim.a_tot();
        let mut times = Vec::with_capacity(2000);
        let mut last = 0.0;
        for _ in 0..2000 {
            sim.single_step().unwrap();
            times.push(sim.current_time() - last);
            last = sim.current_time();
        }
        times.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let n = times.len() as f64;
        let mut d_stat = 0.0f64;
        for (i, &t) in times.iter().enumerate() {
            let f = 1.0 - (-a_tot * t).exp();
            let lo = i as f64 / n;
            let hi = (i + 1) as f64 / n;
            d_stat = d_stat.max((f - lo).abs()).max((f - hi).abs());
        }
        // the critical value at p = 0.01 for n = 2000 is about 0.036
        assert!(d_stat < 0.05, "KS statistic {} too large", d_stat);
    }

    fn hub_model(seed: u64) -> (Simulation, u64, u64) {
        let mut sim = Simulation::with_seed("hub", seed);
        let h = sim
            .add_molecule_type(MoleculeTypeDef::new("H").sites("b", 5))
            .unwrap();
        let p = sim
            .add_molecule_type(MoleculeTypeDef::new("P").site("b"))
            .unwrap();
        let hubs = sim.add_molecules(h, 2).unwrap();
        let cargo = sim.add_molecules(p, 6).unwrap();
        for &c in cargo.iter().take(5) {
            sim.bind(hubs[0], "b", c, "b").unwrap();
        }
        sim.bind(hubs[1], "b", cargo[5], "b").unwrap();
        let pp = sim.pattern("P").build().unwrap();
        sim.add_observable(Observable::molecules("Cargo", vec![pp]))
            .unwrap();
        let hub = sim.pattern("H").build().unwrap();
        sim.add_reaction(
            RuleDef::new("recruit", RateDef::PerMatch {
                base: 1.0,
                reactant: 0,
                weight: Box::new(|scope| scope.count("Cargo")),
            })
            .reactant(hub),
        )
        .unwrap();
        sim.enable_firing_log();
        sim.prepare_for_simulation().unwrap();
        let uid0 = sim.store().molecule(hubs[0]).unique_id;
        let uid1 = sim.store().molecule(hubs[1]).unique_id;
        (sim, uid0, uid1)
    }

    #[test]
    fn test_weighted_matches_fire_proportionally() {
        let (mut sim, heavy_uid, light_uid) = hub_model(23);
        // weights 5 and 1 sum into the propensity
        assert!((sim.a_tot() - 6.0).abs() < 1e-9);
        let n = 3000;
        for _ in 0..n {
            assert_eq!(sim.single_step().unwrap(), StepOutcome::Fired);
        }
        let heavy = sim
            .firing_records()
            .iter()
            .filter(|r| r.reactant_uids.contains(&heavy_uid))
            .count();
        let light = sim
            .firing_records()
            .iter()
            .filter(|r| r.reactant_uids.contains(&light_uid))
            .count();
        assert_eq!(heavy + light, n);
        let freq = heavy as f64 / n as f64;
        // binomial 3-sigma band around 5/6
        assert!(
            (freq - 5.0 / 6.0).abs() < 0.03,
            "heavy hub frequency {} not near 5/6",
            freq
        );
        sim.check_invariants().unwrap();
    }

    #[test]
    fn test_equilibrate_resets_clock_then_sim_samples() {
        let mut sim = decay_model(9, 0.001, 100);
        sim.equilibrate(50.0, 0).unwrap();
        assert_eq!(sim.current_time(), 0.0);
        sim.sim(10.0, 100, false).unwrap();
        assert_eq!(sim.trace().len(), 100);
        assert_eq!(sim.current_time(), 10.0);
    }

    #[test]
    fn test_bind_unbind_roundtrip_restores_state() {
        let mut sim = Simulation::with_seed("roundtrip", 2);
        let l = sim
            .add_molecule_type(
                MoleculeTypeDef::new("L").site_with_states("r", &["u", "p"]),
            )
            .unwrap();
        let mols = sim.add_molecules(l, 2).unwrap();
        let states_before: Vec<i64> = mols
            .iter()
            .map(|&m| sim.store().molecule(m).states[0])
            .collect();
        sim.bind(mols[0], "r", mols[1], "r").unwrap();
        assert_eq!(
            sim.store().molecule(mols[0]).complex_id,
            sim.store().molecule(mols[1]).complex_id
        );
        sim.unbind(mols[0], "r").unwrap();
        let states_after: Vec<i64> = mols
            .iter()
            .map(|&m| sim.store().molecule(m).states[0])
            .collect();
        assert_eq!(states_before, states_after);
        assert_ne!(
            sim.store().molecule(mols[0]).complex_id,
            sim.store().molecule(mols[1]).complex_id
        );
        assert_eq!(sim.complex_registry().live_count(), 2);
    }

    #[test]
    fn test_preparation_is_idempotent() {
        let mut sim = dimer_model(4, 0.01, 1.0, 30);
        let counts: Vec<usize> = (0..2)
            .map(|pos| sim.rule("assoc").unwrap().reactant_count(pos))
            .collect();
        let a_tot = sim.a_tot();
        sim.prepare_for_simulation().unwrap();
        for (pos, &c) in counts.iter().enumerate() {
            assert_eq!(sim.rule("assoc").unwrap().reactant_count(pos), c);
        }
        assert!((sim.a_tot() - a_tot).abs() < 1e-9);
        sim.check_invariants().unwrap();
    }

    #[test]
    fn test_parameter_update_rescales_propensity() {
        let mut sim = Simulation::with_seed("params", 6);
        let x = sim.add_molecule_type(MoleculeTypeDef::new("X")).unwrap();
        sim.add_molecules(x, 10).unwrap();
        sim.add_parameter("k_deg", 1.0);
        let px = sim.pattern("X").build().unwrap();
        sim.add_reaction(
            RuleDef::new("degrade", RateDef::Param("k_deg".to_string()))
                .reactant(px)
                .transform(TransformDef::Destroy {
                    reactant: 0,
                    node: 0,
                }),
        )
        .unwrap();
        sim.prepare_for_simulation().unwrap();
        assert_eq!(sim.a_tot(), 10.0);
        sim.set_parameter("k_deg", 3.0).unwrap();
        sim.update_system_with_new_parameters().unwrap();
        assert_eq!(sim.a_tot(), 30.0);
        assert!(sim.set_parameter("nope", 1.0).is_err());
    }

    #[test]
    fn test_observable_dependent_rate() {
        let mut sim = Simulation::with_seed("feedback", 8);
        let x = sim.add_molecule_type(MoleculeTypeDef::new("X")).unwrap();
        sim.add_molecules(x, 4).unwrap();
        let px = sim.pattern("X").build().unwrap();
        sim.add_observable(Observable::molecules("X", vec![px.clone()]))
            .unwrap();
        // total rate grows with the square of the count
        sim.add_reaction(
            RuleDef::new("autodeg", RateDef::Expr(Box::new(|s| {
                let x = s.observable("X")?;
                Ok(0.5 * x * x)
            })))
            .reactant(px)
            .transform(TransformDef::Destroy {
                reactant: 0,
                node: 0,
            })
            .total_rate(),
        )
        .unwrap();
        sim.prepare_for_simulation().unwrap();
        assert_eq!(sim.a_tot(), 8.0);
        sim.single_step().unwrap();
        // 3 molecules left, base re-evaluated to 4.5
        assert!((sim.a_tot() - 4.5).abs() < 1e-9);
        sim.check_invariants().unwrap();
    }

    #[test]
    fn test_population_rule_consumes_lumped_count() {
        let mut sim = Simulation::with_seed("pop", 12);
        let s = sim
            .add_molecule_type(MoleculeTypeDef::new("S").population())
            .unwrap();
        sim.add_population(s, 5).unwrap();
        let ps = sim.pattern("S").build().unwrap();
        sim.add_reaction(
            RuleDef::new("drain", RateDef::Constant(1.0))
                .reactant(ps)
                .transform(TransformDef::DecrementPopulation {
                    reactant: 0,
                    node: 0,
                }),
        )
        .unwrap();
        sim.prepare_for_simulation().unwrap();
        assert_eq!(sim.a_tot(), 5.0);
        let mut fired = 0;
        loop {
            match sim.single_step().unwrap() {
                StepOutcome::Fired => fired += 1,
                StepOutcome::Exhausted => break,
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(fired, 5);
        assert_eq!(sim.population_of("S"), 0);
        assert_eq!(sim.a_tot(), 0.0);
    }

    #[test]
    fn test_synthesis_grows_population_and_log_records_products() {
        let mut sim = Simulation::with_seed("synth", 21);
        let x = sim.add_molecule_type(MoleculeTypeDef::new("X")).unwrap();
        sim.add_molecules(x, 1).unwrap();
        let px = sim.pattern("X").build().unwrap();
        sim.add_observable(Observable::molecules("X", vec![px.clone()]))
            .unwrap();
        sim.add_reaction(
            RuleDef::new("duplicate", RateDef::Constant(1.0))
                .reactant(px)
                .transform(TransformDef::Create {
                    mol_type: "X".to_string(),
                }),
        )
        .unwrap();
        sim.enable_firing_log();
        sim.prepare_for_simulation().unwrap();
        for _ in 0..4 {
            assert_eq!(sim.single_step().unwrap(), StepOutcome::Fired);
        }
        assert_eq!(sim.molecule_count("X"), 5);
        assert_eq!(sim.observable_value("X").unwrap(), 5.0);
        // every record carries the template molecule and the newborn
        for rec in sim.firing_records() {
            assert_eq!(rec.reactant_uids.len(), 1);
            assert_eq!(rec.product_uids.len(), 2);
        }
        sim.check_invariants().unwrap();
    }

    #[test]
    fn test_cancellation_stops_the_walk() {
        let mut sim = decay_model(30, 0.001, 50);
        let handle = sim.cancel_handle();
        handle.store(true, Ordering::Relaxed);
        assert_eq!(sim.single_step().unwrap(), StepOutcome::Stopped);
        let t = sim.step_to(1000.0).unwrap();
        assert_eq!(t, 0.0);
    }

    #[test]
    fn test_save_species_writes_histogram() {
        let mut sim = dimer_model(14, 0.01, 1.0, 20);
        sim.step_to(5.0).unwrap();
        let path = std::env::temp_dir().join("netfree_species_test.txt");
        sim.save_species(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let mut total = 0usize;
        for line in text.lines() {
            let mut parts = line.splitn(2, '\t');
            let count: usize = parts.next().unwrap().parse().unwrap();
            assert!(parts.next().is_some());
            total += count;
        }
        assert_eq!(total, sim.complex_registry().live_count());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_expr_rate_reads_parameters_through_scope() {
        let mut sim = Simulation::with_seed("scaled", 33);
        let x = sim.add_molecule_type(MoleculeTypeDef::new("X")).unwrap();
        sim.add_molecules(x, 10).unwrap();
        sim.add_parameter("k_base", 0.25);
        let px = sim.pattern("X").build().unwrap();
        sim.add_observable(Observable::molecules("X", vec![px.clone()]))
            .unwrap();
        sim.add_reaction(
            RuleDef::new("scaled_decay", RateDef::Expr(Box::new(|s| {
                Ok(s.param("k_base")? * s.observable("X")?)
            })))
            .reactant(px)
            .transform(TransformDef::Destroy {
                reactant: 0,
                node: 0,
            })
            .total_rate(),
        )
        .unwrap();
        sim.prepare_for_simulation().unwrap();
        assert_eq!(sim.a_tot(), 2.5);
        sim.single_step().unwrap();
        // nine molecules left, expression re-read the parameter table
        assert!((sim.a_tot() - 2.25).abs() < 1e-9);
        sim.set_parameter("k_base", 1.0).unwrap();
        sim.update_system_with_new_parameters().unwrap();
        assert!((sim.a_tot() - 9.0).abs() < 1e-9);
        sim.check_invariants().unwrap();
    }

    #[test]
    fn test_weight_function_counts_molecules_in_complex() {
        let mut sim = Simulation::with_seed("hub2", 44);
        let h = sim
            .add_molecule_type(MoleculeTypeDef::new("H").sites("b", 5))
            .unwrap();
        let p = sim
            .add_molecule_type(MoleculeTypeDef::new("P").site("b"))
            .unwrap();
        let hubs = sim.add_molecules(h, 2).unwrap();
        let cargo = sim.add_molecules(p, 4).unwrap();
        for &c in cargo.iter().take(3) {
            sim.bind(hubs[0], "b", c, "b").unwrap();
        }
        sim.bind(hubs[1], "b", cargo[3], "b").unwrap();
        let hub = sim.pattern("H").build().unwrap();
        sim.add_reaction(
            RuleDef::new("recruit", RateDef::PerMatch {
                base: 2.0,
                reactant: 0,
                weight: Box::new(|scope| scope.molecule_count("P")),
            })
            .reactant(hub),
        )
        .unwrap();
        sim.prepare_for_simulation().unwrap();
        // member counts 3 and 1 at base 2.0
        assert!((sim.a_tot() - 8.0).abs() < 1e-9);
        sim.check_invariants().unwrap();
    }

    #[test]
    fn test_global_function_columns_are_sampled() {
        let mut sim = decay_model(19, 0.5, 100);
        sim.add_global_function("half_X", Box::new(|s| Ok(s.observable("X")? / 2.0)));
        sim.enable_global_function_output();
        sim.sim(1.0, 4, false).unwrap();
        assert_eq!(
            sim.sample_columns(),
            vec!["X".to_string(), "half_X".to_string()]
        );
        for row in sim.trace() {
            assert_eq!(row.values[1], row.values[0] / 2.0);
        }
    }

    #[test]
    fn test_writers_produce_tables() {
        let mut sim = decay_model(25, 0.5, 50);
        sim.enable_firing_log();
        sim.sim(1.0, 2, false).unwrap();
        let mut buf = Vec::new();
        crate::output::write_trace(&sim, &mut buf, false).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("time\tX"));
        assert_eq!(text.lines().count(), 3);
        let mut log = Vec::new();
        crate::output::write_firing_log(&sim, &mut log, false).unwrap();
        assert!(String::from_utf8(log).unwrap().lines().count() > 1);
        let mut bin = Vec::new();
        crate::output::write_trace_binary(&sim, &mut bin).unwrap();
        // two rows of time plus one column, eight bytes each
        assert_eq!(bin.len(), 2 * 2 * 8);
        let mut idx = Vec::new();
        crate::output::write_index_tables(&sim, &mut idx).unwrap();
        assert!(String::from_utf8(idx).unwrap().contains("degrade"));
    }

    #[test]
    fn test_step_to_stays_before_stop() {
        let mut sim = decay_model(11, 0.5, 100);
        let t = sim.step_to(0.5).unwrap();
        assert!(t < 0.5);
        assert!(t > 0.0);
        sim.check_invariants().unwrap();
    }
}
