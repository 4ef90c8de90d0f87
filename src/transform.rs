//! Declarative graph edits applied when a rule fires.
//!
//! A transformation set is a fixed list of edits addressed through the rule's
//! reactant patterns. Compilation resolves names to pattern site indices;
//! molecule deletions are reordered to the end so every other edit still sees
//! its targets. Validation and application live with the orchestrator, which
//! owns all the registries an edit touches.

use crate::error::SimError;
use crate::molecule::{MoleculeType, TypeId};
use crate::pattern::Pattern;

/// Declarative description of one edit, consumed by
/// [`crate::rule::RuleDef::transform`]. Sites are addressed as
/// `(reactant index, node index, site name)` against the reactant patterns.
#[derive(Clone, Debug)]
pub enum TransformDef {
    /// Set a named state on a mapped site.
    SetState {
        reactant: usize,
        node: usize,
        site: String,
        state: String,
    },
    /// Set an integer-valued component on a mapped site.
    SetInteger {
        reactant: usize,
        node: usize,
        site: String,
        value: i64,
    },
    /// Bond two mapped sites.
    Bind {
        a: (usize, usize, String),
        b: (usize, usize, String),
    },
    /// Remove the bond at a mapped site.
    Unbind {
        reactant: usize,
        node: usize,
        site: String,
    },
    /// Create a fresh molecule with default states.
    Create { mol_type: String },
    /// Create a fresh molecule born bonded to a mapped site.
    CreateBound {
        mol_type: String,
        site: String,
        to: (usize, usize, String),
    },
    /// Delete a mapped molecule (its bonds are removed first).
    Destroy { reactant: usize, node: usize },
    IncrementPopulation { reactant: usize, node: usize },
    DecrementPopulation { reactant: usize, node: usize },
}

/// A resolved pattern-site address: reactant pattern, node, site-constraint
/// index within the node.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SitePath {
    pub reactant: usize,
    pub node: usize,
    pub site: usize,
}

#[derive(Clone, Debug)]
pub(crate) enum Transform {
    SetState { target: SitePath, value: i64 },
    Bind { a: SitePath, b: SitePath },
    Unbind { at: SitePath },
    /// `bond` carries the newborn's component and the mapped site it binds.
    Create {
        type_id: TypeId,
        bond: Option<(usize, SitePath)>,
    },
    Destroy { reactant: usize, node: usize },
    IncPop { reactant: usize, node: usize },
    DecPop { reactant: usize, node: usize },
}

/// The compiled edit list of one rule.
#[derive(Clone, Debug)]
pub(crate) struct TransformationSet {
    pub ops: Vec<Transform>,
    pub forbid_intra_complex: bool,
}

fn resolve_site(
    patterns: &[Pattern],
    types: &[MoleculeType],
    reactant: usize,
    node: usize,
    site: &str,
) -> Result<SitePath, SimError> {
    let pattern = patterns.get(reactant).ok_or_else(|| {
        SimError::ModelValidation(format!("transform references missing reactant {}", reactant))
    })?;
    let pnode = pattern.nodes.get(node).ok_or_else(|| {
        SimError::ModelValidation(format!(
            "transform references missing node {} of reactant {}",
            node, reactant
        ))
    })?;
    let ty = &types[pnode.type_id];
    let wanted = ty.resolve_site(site).ok_or_else(|| {
        SimError::ModelValidation(format!("type {} has no site {}", ty.name, site))
    })?;
    // prefer the site constraint declared for exactly this name, fall back to
    // any constraint drawn from the same equivalence class
    let exact = pnode.sites.iter().position(|s| s.comps == wanted);
    let within = pnode
        .sites
        .iter()
        .position(|s| s.comps.iter().all(|c| wanted.contains(c)));
    match exact.or(within) {
        Some(idx) => Ok(SitePath {
            reactant,
            node,
            site: idx,
        }),
        None => Err(SimError::ModelValidation(format!(
            "transform targets site {} of {}, but the pattern does not constrain it",
            site, ty.name
        ))),
    }
}

fn resolve_node(
    patterns: &[Pattern],
    reactant: usize,
    node: usize,
) -> Result<(usize, usize), SimError> {
    let pattern = patterns.get(reactant).ok_or_else(|| {
        SimError::ModelValidation(format!("transform references missing reactant {}", reactant))
    })?;
    if node >= pattern.nodes.len() {
        return Err(SimError::ModelValidation(format!(
            "transform references missing node {} of reactant {}",
            node, reactant
        )));
    }
    Ok((reactant, node))
}

fn require_population(
    patterns: &[Pattern],
    types: &[MoleculeType],
    reactant: usize,
    node: usize,
) -> Result<(), SimError> {
    let ty = &types[patterns[reactant].nodes[node].type_id];
    if ty.population_type {
        Ok(())
    } else {
        Err(SimError::ModelValidation(format!(
            "population transform targets non-population type {}",
            ty.name
        )))
    }
}

fn type_by_name<'a>(types: &'a [MoleculeType], name: &str) -> Result<&'a MoleculeType, SimError> {
    types
        .iter()
        .find(|t| t.name == name)
        .ok_or_else(|| SimError::ModelValidation(format!("unknown molecule type {}", name)))
}

pub(crate) fn compile_transforms(
    defs: &[TransformDef],
    patterns: &[Pattern],
    types: &[MoleculeType],
    forbid_intra_complex: bool,
) -> Result<TransformationSet, SimError> {
    let mut ops = Vec::new();
    let mut deletes = Vec::new();
    for def in defs {
        match def {
            TransformDef::SetState {
                reactant,
                node,
                site,
                state,
            } => {
                let target = resolve_site(patterns, types, *reactant, *node, site)?;
                let ty = &types[patterns[*reactant].nodes[*node].type_id];
                let comp0 = patterns[*reactant].nodes[*node].sites[target.site].comps[0];
                let value = ty.state_value(comp0, state)?;
                ops.push(Transform::SetState { target, value });
            }
            TransformDef::SetInteger {
                reactant,
                node,
                site,
                value,
            } => {
                let target = resolve_site(patterns, types, *reactant, *node, site)?;
                ops.push(Transform::SetState {
                    target,
                    value: *value,
                });
            }
            TransformDef::Bind { a, b } => {
                let a = resolve_site(patterns, types, a.0, a.1, &a.2)?;
                let b = resolve_site(patterns, types, b.0, b.1, &b.2)?;
                ops.push(Transform::Bind { a, b });
            }
            TransformDef::Unbind {
                reactant,
                node,
                site,
            } => {
                let at = resolve_site(patterns, types, *reactant, *node, site)?;
                ops.push(Transform::Unbind { at });
            }
            TransformDef::Create { mol_type } => {
                let ty = type_by_name(types, mol_type)?;
                ops.push(Transform::Create {
                    type_id: ty.id,
                    bond: None,
                });
            }
            TransformDef::CreateBound { mol_type, site, to } => {
                let ty = type_by_name(types, mol_type)?;
                let comp = ty
                    .resolve_site(site)
                    .and_then(|c| c.first().copied())
                    .ok_or_else(|| {
                        SimError::ModelValidation(format!(
                            "type {} has no site {}",
                            ty.name, site
                        ))
                    })?;
                let to = resolve_site(patterns, types, to.0, to.1, &to.2)?;
                ops.push(Transform::Create {
                    type_id: ty.id,
                    bond: Some((comp, to)),
                });
            }
            TransformDef::Destroy { reactant, node } => {
                let (reactant, node) = resolve_node(patterns, *reactant, *node)?;
                deletes.push(Transform::Destroy { reactant, node });
            }
            TransformDef::IncrementPopulation { reactant, node } => {
                let (reactant, node) = resolve_node(patterns, *reactant, *node)?;
                require_population(patterns, types, reactant, node)?;
                ops.push(Transform::IncPop { reactant, node });
            }
            TransformDef::DecrementPopulation { reactant, node } => {
                let (reactant, node) = resolve_node(patterns, *reactant, *node)?;
                require_population(patterns, types, reactant, node)?;
                ops.push(Transform::DecPop { reactant, node });
            }
        }
    }
    // deletes run last so earlier edits still see their targets
    ops.extend(deletes);
    Ok(TransformationSet {
        ops,
        forbid_intra_complex,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::molecule::MoleculeTypeDef;
    use crate::pattern::PatternBuilder;

    fn types() -> Vec<MoleculeType> {
        vec![MoleculeTypeDef::new("L")
            .site_with_states("s", &["u", "p"])
            .sites("a", 2)
            .compile(0)
            .unwrap()]
    }

    #[test]
    fn test_deletes_move_last() {
        let types = types();
        let p = PatternBuilder::new(&types, "L").site("s").build().unwrap();
        let set = compile_transforms(
            &[
                TransformDef::Destroy {
                    reactant: 0,
                    node: 0,
                },
                TransformDef::SetState {
                    reactant: 0,
                    node: 0,
                    site: "s".to_string(),
                    state: "p".to_string(),
                },
            ],
            &[p],
            &types,
            false,
        )
        .unwrap();
        assert!(matches!(set.ops[0], Transform::SetState { .. }));
        assert!(matches!(set.ops[1], Transform::Destroy { .. }));
    }

    #[test]
    fn test_undeclared_site_is_rejected() {
        let types = types();
        let p = PatternBuilder::new(&types, "L").build().unwrap();
        let err = compile_transforms(
            &[TransformDef::SetState {
                reactant: 0,
                node: 0,
                site: "s".to_string(),
                state: "p".to_string(),
            }],
            &[p],
            &types,
            false,
        );
        assert!(matches!(err, Err(SimError::ModelValidation(_))));
    }

    #[test]
    fn test_class_name_resolves_to_declared_constraint() {
        let types = types();
        let p = PatternBuilder::new(&types, "L")
            .site("a")
            .open()
            .build()
            .unwrap();
        let set = compile_transforms(
            &[TransformDef::Bind {
                a: (0, 0, "a".to_string()),
                b: (0, 0, "a".to_string()),
            }],
            &[p.clone(), p],
            &types,
            true,
        )
        .unwrap();
        assert!(set.forbid_intra_complex);
        match set.ops[0] {
            Transform::Bind { a, b } => {
                assert_eq!(a.site, 0);
                assert_eq!(b.site, 0);
            }
            _ => panic!("expected bind"),
        }
    }

    #[test]
    fn test_unknown_state_is_rejected() {
        let types = types();
        let p = PatternBuilder::new(&types, "L").site("s").build().unwrap();
        let err = compile_transforms(
            &[TransformDef::SetState {
                reactant: 0,
                node: 0,
                site: "s".to_string(),
                state: "zzz".to_string(),
            }],
            &[p],
            &types,
            false,
        );
        assert!(matches!(err, Err(SimError::ModelValidation(_))));
    }
}
