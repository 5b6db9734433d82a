use std::sync::Arc;
use crate::core::error::{Error, ErrorKind, Result};
use crate::formula::node::Formula;

/// Resolve every deferred NOT in the tree against a concrete universe,
/// producing a new tree with no unresolved nodes.
///
/// Inside an AND, the universe of a deferred NOT is the conjunction of
/// its concrete siblings at the same level; everywhere else the ambient
/// `universe` (typically "all primary keys of the queried collection")
/// applies. This is an explicit two-pass rewrite, not a lazy evaluation
/// trick: resolving during evaluation would make the result depend on
/// evaluation order.
pub fn resolve(
    formula: &Arc<Formula>,
    universe: Option<&Arc<Formula>>,
) -> Result<Arc<Formula>> {
    let resolved = resolve_node(formula, universe)?;
    assert_resolved(&resolved)?;
    Ok(resolved)
}

fn resolve_node(formula: &Arc<Formula>, universe: Option<&Arc<Formula>>) -> Result<Arc<Formula>> {
    match formula.as_ref() {
        Formula::Empty | Formula::Leaf { .. } => Ok(formula.clone()),
        Formula::And { children } => {
            let mut concrete = Vec::new();
            let mut negated = Vec::new();
            for child in children {
                match child.as_ref() {
                    Formula::DeferredNot { negated: inner } => {
                        negated.push(resolve_node(inner, universe)?);
                    }
                    _ => concrete.push(resolve_node(child, universe)?),
                }
            }
            if negated.is_empty() {
                return Ok(Formula::and(concrete));
            }
            let local_universe = if concrete.is_empty() {
                missing_universe(universe)?
            } else {
                Formula::and(concrete.clone())
            };
            concrete.push(Formula::not(local_universe, Formula::or(negated)));
            Ok(Formula::and(concrete))
        }
        Formula::Or { children } => {
            let mut resolved = Vec::new();
            for child in children {
                match child.as_ref() {
                    // A union does not bound its members, so the complement
                    // is taken against the ambient universe.
                    Formula::DeferredNot { negated } => resolved.push(Formula::not(
                        missing_universe(universe)?,
                        resolve_node(negated, universe)?,
                    )),
                    _ => resolved.push(resolve_node(child, universe)?),
                }
            }
            Ok(Formula::or(resolved))
        }
        Formula::Not {
            universe: inner_universe,
            negated,
        } => Ok(Formula::not(
            resolve_node(inner_universe, universe)?,
            resolve_node(negated, universe)?,
        )),
        Formula::DeferredNot { negated } => Ok(Formula::not(
            missing_universe(universe)?,
            resolve_node(negated, universe)?,
        )),
        Formula::UserFilter { marker, inner } => Ok(Formula::user_filter(
            marker.clone(),
            resolve_node(inner, universe)?,
        )),
    }
}

fn missing_universe(universe: Option<&Arc<Formula>>) -> Result<Arc<Formula>> {
    universe.cloned().ok_or_else(|| {
        Error::new(
            ErrorKind::UnresolvedFormula,
            "NOT has no enclosing universe".to_string(),
        )
    })
}

/// Post-resolution check: any surviving deferred node is a translation
/// defect and must surface before evaluation starts.
pub fn assert_resolved(formula: &Arc<Formula>) -> Result<()> {
    match formula.as_ref() {
        Formula::Empty | Formula::Leaf { .. } => Ok(()),
        Formula::And { children } | Formula::Or { children } => {
            for child in children {
                assert_resolved(child)?;
            }
            Ok(())
        }
        Formula::Not { universe, negated } => {
            assert_resolved(universe)?;
            assert_resolved(negated)
        }
        Formula::DeferredNot { .. } => Err(Error::new(
            ErrorKind::UnresolvedFormula,
            "deferred NOT survived resolution".to_string(),
        )),
        Formula::UserFilter { inner, .. } => assert_resolved(inner),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::node::leaf_of;

    fn ids(formula: &Arc<Formula>) -> Vec<u32> {
        formula.compute().unwrap().iter().collect()
    }

    #[test]
    fn deferred_not_resolves_against_and_siblings() {
        let tree = Formula::and(vec![
            leaf_of(&[1, 2, 3, 4]),
            Formula::deferred_not(leaf_of(&[2, 4])),
        ]);
        let resolved = resolve(&tree, None).unwrap();
        assert_eq!(ids(&resolved), vec![1, 3]);
    }

    #[test]
    fn root_not_resolves_against_ambient_universe() {
        let universe = leaf_of(&[1, 2, 3, 4, 5]);
        let tree = Formula::deferred_not(leaf_of(&[2, 4]));
        let resolved = resolve(&tree, Some(&universe)).unwrap();
        assert_eq!(ids(&resolved), vec![1, 3, 5]);
    }

    #[test]
    fn not_without_any_universe_fails_fast() {
        let tree = Formula::deferred_not(leaf_of(&[1]));
        let err = resolve(&tree, None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnresolvedFormula);
    }

    #[test]
    fn or_level_not_uses_the_ambient_universe() {
        let universe = leaf_of(&[1, 2, 3, 4]);
        let tree = Formula::or(vec![
            leaf_of(&[1]),
            Formula::deferred_not(leaf_of(&[1, 2])),
        ]);
        let resolved = resolve(&tree, Some(&universe)).unwrap();
        assert_eq!(ids(&resolved), vec![1, 3, 4]);
    }

    #[test]
    fn multiple_deferred_nots_combine_under_one_complement() {
        let tree = Formula::and(vec![
            leaf_of(&[1, 2, 3, 4, 5, 6]),
            Formula::deferred_not(leaf_of(&[2])),
            Formula::deferred_not(leaf_of(&[4])),
        ]);
        let resolved = resolve(&tree, None).unwrap();
        assert_eq!(ids(&resolved), vec![1, 3, 5, 6]);
    }

    #[test]
    fn equivalent_trees_hash_identically_after_resolution() {
        let a = Formula::and(vec![
            leaf_of(&[1, 2, 3]),
            Formula::deferred_not(leaf_of(&[2])),
        ]);
        let b = Formula::and(vec![
            Formula::deferred_not(leaf_of(&[2])),
            leaf_of(&[1, 2, 3]),
        ]);
        let resolved_a = resolve(&a, None).unwrap();
        let resolved_b = resolve(&b, None).unwrap();
        assert_eq!(resolved_a.structural_hash(), resolved_b.structural_hash());
        assert_eq!(ids(&resolved_a), ids(&resolved_b));
    }
}
