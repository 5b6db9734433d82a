use std::sync::Arc;
use roaring::RoaringBitmap;
use crate::core::error::{Error, ErrorKind, Result};
use crate::formula::hash;
use crate::txn::producer::{DependencyRef, ProducerId};

/// Node of an immutable boolean expression tree over sorted sets of entity
/// primary keys. Formulas are value-like: children are shared through `Arc`
/// and evaluation is pure given a stable snapshot of the underlying
/// indexes, so one tree may be computed repeatedly and from many threads.
#[derive(Debug, Clone)]
pub enum Formula {
    /// Canonical empty result set.
    Empty,
    /// Concrete sorted set, usually a snapshot of one index bitmap. Keeps
    /// references to the producers it was read from for cache
    /// invalidation.
    Leaf {
        bitmap: Arc<RoaringBitmap>,
        deps: Vec<DependencyRef>,
    },
    /// Set intersection. Operand order never changes the result; it is
    /// only a short-circuit opportunity.
    And { children: Vec<Arc<Formula>> },
    /// Deduplicated set union.
    Or { children: Vec<Arc<Formula>> },
    /// `universe` minus `negated`. The universe operand is mandatory.
    Not {
        universe: Arc<Formula>,
        negated: Arc<Formula>,
    },
    /// A NOT whose universe is unknown until the surrounding tree is
    /// assembled. Exists only between translation and resolution;
    /// computing one is an error.
    DeferredNot { negated: Arc<Formula> },
    /// Marker around a user-filter subtree, so facet statistics can
    /// exclude or extend exactly this branch and re-intersect.
    UserFilter {
        marker: String,
        inner: Arc<Formula>,
    },
}

impl Formula {
    pub fn empty() -> Arc<Formula> {
        Arc::new(Formula::Empty)
    }

    pub fn leaf(bitmap: Arc<RoaringBitmap>) -> Arc<Formula> {
        Arc::new(Formula::Leaf {
            bitmap,
            deps: Vec::new(),
        })
    }

    pub fn leaf_with_dep(bitmap: Arc<RoaringBitmap>, dep: DependencyRef) -> Arc<Formula> {
        Arc::new(Formula::Leaf {
            bitmap,
            deps: vec![dep],
        })
    }

    /// Zero operands collapse to the canonical empty set, a single
    /// operand is returned as-is.
    pub fn and(mut children: Vec<Arc<Formula>>) -> Arc<Formula> {
        match children.len() {
            0 => Formula::empty(),
            1 => children.swap_remove(0),
            _ => Arc::new(Formula::And { children }),
        }
    }

    pub fn or(mut children: Vec<Arc<Formula>>) -> Arc<Formula> {
        match children.len() {
            0 => Formula::empty(),
            1 => children.swap_remove(0),
            _ => Arc::new(Formula::Or { children }),
        }
    }

    pub fn not(universe: Arc<Formula>, negated: Arc<Formula>) -> Arc<Formula> {
        Arc::new(Formula::Not { universe, negated })
    }

    pub fn deferred_not(negated: Arc<Formula>) -> Arc<Formula> {
        Arc::new(Formula::DeferredNot { negated })
    }

    pub fn user_filter(marker: impl Into<String>, inner: Arc<Formula>) -> Arc<Formula> {
        Arc::new(Formula::UserFilter {
            marker: marker.into(),
            inner,
        })
    }

    /// Evaluate to the sorted set of matching primary keys. Shared state
    /// is never mutated; AND chains intersect the cheapest operand first
    /// and short-circuit once the running intersection is empty.
    pub fn compute(&self) -> Result<Arc<RoaringBitmap>> {
        match self {
            Formula::Empty => Ok(Arc::new(RoaringBitmap::new())),
            Formula::Leaf { bitmap, .. } => Ok(bitmap.clone()),
            Formula::And { children } => {
                let mut ordered: Vec<&Arc<Formula>> = children.iter().collect();
                ordered.sort_by_key(|child| child.estimated_cardinality());
                let mut iter = ordered.into_iter();
                let mut acc = match iter.next() {
                    Some(first) => (*first.compute()?).clone(),
                    None => return Ok(Arc::new(RoaringBitmap::new())),
                };
                for child in iter {
                    if acc.is_empty() {
                        break;
                    }
                    acc &= &*child.compute()?;
                }
                Ok(Arc::new(acc))
            }
            Formula::Or { children } => {
                let mut acc = RoaringBitmap::new();
                for child in children {
                    acc |= &*child.compute()?;
                }
                Ok(Arc::new(acc))
            }
            Formula::Not { universe, negated } => {
                let mut acc = (*universe.compute()?).clone();
                acc -= &*negated.compute()?;
                Ok(Arc::new(acc))
            }
            Formula::DeferredNot { .. } => Err(Error::new(
                ErrorKind::UnresolvedFormula,
                "deferred NOT has no universe, tree was not resolved".to_string(),
            )),
            Formula::UserFilter { inner, .. } => inner.compute(),
        }
    }

    /// Upper-bound estimate used to order AND operands cheapest first.
    /// Purely a heuristic, never part of the result.
    pub fn estimated_cardinality(&self) -> u64 {
        match self {
            Formula::Empty => 0,
            Formula::Leaf { bitmap, .. } => bitmap.len(),
            Formula::And { children } => children
                .iter()
                .map(|child| child.estimated_cardinality())
                .min()
                .unwrap_or(0),
            Formula::Or { children } => children
                .iter()
                .map(|child| child.estimated_cardinality())
                .fold(0u64, u64::saturating_add),
            Formula::Not { universe, negated } => universe
                .estimated_cardinality()
                .saturating_sub(negated.estimated_cardinality()),
            Formula::DeferredNot { negated } => negated.estimated_cardinality(),
            Formula::UserFilter { inner, .. } => inner.estimated_cardinality(),
        }
    }

    /// Structural hash of this node kind and its children. Cache identity
    /// together with the dependency hash.
    pub fn structural_hash(&self) -> u64 {
        hash::structural_hash(self)
    }

    /// Producer references this formula transitively reads, deduplicated
    /// and ordered by producer id.
    pub fn dependencies(&self) -> Vec<DependencyRef> {
        let mut deps = Vec::new();
        self.collect_deps(&mut deps);
        deps.sort_by_key(|dep| dep.id());
        deps.dedup_by_key(|dep| dep.id());
        deps
    }

    /// Producer ids forming the cache-invalidation key.
    pub fn transactional_ids(&self) -> Vec<ProducerId> {
        self.dependencies().iter().map(|dep| dep.id()).collect()
    }

    fn collect_deps(&self, out: &mut Vec<DependencyRef>) {
        match self {
            Formula::Empty => {}
            Formula::Leaf { deps, .. } => out.extend(deps.iter().cloned()),
            Formula::And { children } | Formula::Or { children } => {
                for child in children {
                    child.collect_deps(out);
                }
            }
            Formula::Not { universe, negated } => {
                universe.collect_deps(out);
                negated.collect_deps(out);
            }
            Formula::DeferredNot { negated } => negated.collect_deps(out),
            Formula::UserFilter { inner, .. } => inner.collect_deps(out),
        }
    }
}

#[cfg(test)]
pub(crate) fn leaf_of(ids: &[u32]) -> Arc<Formula> {
    Formula::leaf(Arc::new(ids.iter().copied().collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(formula: &Arc<Formula>) -> Vec<u32> {
        formula.compute().unwrap().iter().collect()
    }

    #[test]
    fn and_intersects() {
        let formula = Formula::and(vec![leaf_of(&[1, 3, 5]), leaf_of(&[3, 5, 7])]);
        assert_eq!(ids(&formula), vec![3, 5]);
    }

    #[test]
    fn or_unions_without_duplicates() {
        let formula = Formula::or(vec![leaf_of(&[1, 2]), leaf_of(&[2, 3])]);
        assert_eq!(ids(&formula), vec![1, 2, 3]);
    }

    #[test]
    fn or_is_idempotent() {
        let a = leaf_of(&[4, 8]);
        let formula = Formula::or(vec![a.clone(), a]);
        assert_eq!(ids(&formula), vec![4, 8]);
    }

    #[test]
    fn empty_and_and_single_operand_collapse() {
        assert_eq!(ids(&Formula::and(vec![])), Vec::<u32>::new());
        assert!(matches!(Formula::and(vec![]).as_ref(), Formula::Empty));

        let a = leaf_of(&[1, 2]);
        let collapsed = Formula::and(vec![a.clone()]);
        assert_eq!(ids(&collapsed), ids(&a));
    }

    #[test]
    fn not_subtracts_from_universe() {
        let formula = Formula::not(leaf_of(&[1, 2, 3, 4]), leaf_of(&[2, 4]));
        assert_eq!(ids(&formula), vec![1, 3]);
    }

    #[test]
    fn deferred_not_refuses_to_compute() {
        let formula = Formula::deferred_not(leaf_of(&[1]));
        let err = formula.compute().unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnresolvedFormula);
    }

    #[test]
    fn operand_order_never_changes_the_result() {
        let a = leaf_of(&[1, 2, 3, 4, 5, 6]);
        let b = leaf_of(&[2, 4, 6]);
        let c = leaf_of(&[4, 6, 8]);

        let forward = Formula::and(vec![a.clone(), b.clone(), c.clone()]);
        let backward = Formula::and(vec![c, b, a]);
        assert_eq!(ids(&forward), ids(&backward));
        assert_eq!(ids(&forward), vec![4, 6]);
    }
}
