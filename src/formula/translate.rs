use std::sync::Arc;
use roaring::RoaringBitmap;
use serde::{Serialize, Deserialize};
use crate::core::error::{Error, ErrorKind, Result};
use crate::formula::node::Formula;
use crate::txn::producer::DependencyRef;

/// Parsed constraint tree handed over by the external query-language
/// parser. Filter semantics only; ordering and paging live elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constraint {
    And(Vec<Constraint>),
    Or(Vec<Constraint>),
    Not(Box<Constraint>),
    /// Attribute equals one canonical token.
    AttributeEquals { attribute: String, value: String },
    /// Attribute equals any of the tokens.
    AttributeInSet {
        attribute: String,
        values: Vec<String>,
    },
    /// Explicit primary-key list.
    PrimaryKeyIn(Vec<u32>),
    /// Numeric range scan. Needs a sorted index, which the bitmap algebra
    /// does not carry; translation rejects it up front.
    AttributeInRange {
        attribute: String,
        from: f64,
        to: f64,
    },
    /// User-toggled facet branch. The label identifies the facet group in
    /// impact statistics.
    UserFilter {
        label: String,
        children: Vec<Constraint>,
    },
    /// Every primary key of the queried collection.
    All,
}

/// Index access the translator needs from the surrounding catalog.
pub trait IndexResolver {
    /// Posting bitmap for (attribute, token), with the producer reference
    /// backing cache invalidation. None when the token was never indexed.
    fn attribute_bitmap(
        &self,
        attribute: &str,
        token: &str,
    ) -> Option<(Arc<RoaringBitmap>, DependencyRef)>;

    /// All primary keys of the queried collection.
    fn universe(&self) -> (Arc<RoaringBitmap>, DependencyRef);
}

/// Translate a parsed constraint tree into a formula. Pure and total:
/// every supported constraint kind maps to exactly one constructor and
/// unsupported kinds fail here, never during evaluation. NOT subtrees
/// come out as deferred nodes; run `resolve` before computing.
pub fn translate(constraint: &Constraint, resolver: &dyn IndexResolver) -> Result<Arc<Formula>> {
    match constraint {
        Constraint::And(children) => {
            let translated = children
                .iter()
                .map(|child| translate(child, resolver))
                .collect::<Result<Vec<_>>>()?;
            Ok(Formula::and(translated))
        }
        Constraint::Or(children) => {
            let translated = children
                .iter()
                .map(|child| translate(child, resolver))
                .collect::<Result<Vec<_>>>()?;
            Ok(Formula::or(translated))
        }
        Constraint::Not(inner) => Ok(Formula::deferred_not(translate(inner, resolver)?)),
        Constraint::AttributeEquals { attribute, value } => {
            Ok(attribute_leaf(resolver, attribute, value))
        }
        Constraint::AttributeInSet { attribute, values } => {
            // Canonicalize: sorted, deduplicated tokens, so differently
            // written but logically equal sets build the same formula.
            let mut tokens: Vec<&String> = values.iter().collect();
            tokens.sort();
            tokens.dedup();
            let leaves = tokens
                .into_iter()
                .map(|token| attribute_leaf(resolver, attribute, token))
                .collect();
            Ok(Formula::or(leaves))
        }
        Constraint::PrimaryKeyIn(ids) => {
            let bitmap: RoaringBitmap = ids.iter().copied().collect();
            if bitmap.is_empty() {
                Ok(Formula::empty())
            } else {
                Ok(Formula::leaf(Arc::new(bitmap)))
            }
        }
        Constraint::AttributeInRange { attribute, .. } => Err(Error::new(
            ErrorKind::InvalidInput,
            format!(
                "range constraint on '{}' is not supported by the bitmap algebra",
                attribute
            ),
        )),
        Constraint::UserFilter { label, children } => {
            let translated = children
                .iter()
                .map(|child| translate(child, resolver))
                .collect::<Result<Vec<_>>>()?;
            Ok(Formula::user_filter(label.clone(), Formula::and(translated)))
        }
        Constraint::All => {
            let (bitmap, dep) = resolver.universe();
            Ok(Formula::leaf_with_dep(bitmap, dep))
        }
    }
}

fn attribute_leaf(resolver: &dyn IndexResolver, attribute: &str, token: &str) -> Arc<Formula> {
    match resolver.attribute_bitmap(attribute, token) {
        Some((bitmap, dep)) => Formula::leaf_with_dep(bitmap, dep),
        // Token never indexed: nothing matches. Not an error.
        None => Formula::empty(),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use crate::txn::bitmap::TransactionalBitmap;
    use crate::txn::producer::TransactionalProducer;

    /// In-memory resolver over transactional bitmaps, for tests.
    pub struct StaticResolver {
        pub indexes: HashMap<(String, String), TransactionalBitmap>,
        pub all: TransactionalBitmap,
    }

    impl StaticResolver {
        pub fn new() -> Self {
            StaticResolver {
                indexes: HashMap::new(),
                all: TransactionalBitmap::new(),
            }
        }

        pub fn index(&mut self, attribute: &str, token: &str, ids: &[u32]) {
            let bitmap = TransactionalBitmap::new();
            {
                let mut writer = bitmap.bulk();
                for &id in ids {
                    writer.insert(id);
                }
            }
            {
                let mut writer = self.all.bulk();
                for &id in ids {
                    writer.insert(id);
                }
            }
            self.indexes
                .insert((attribute.to_string(), token.to_string()), bitmap);
        }
    }

    impl IndexResolver for StaticResolver {
        fn attribute_bitmap(
            &self,
            attribute: &str,
            token: &str,
        ) -> Option<(Arc<RoaringBitmap>, DependencyRef)> {
            self.indexes
                .get(&(attribute.to_string(), token.to_string()))
                .map(|bitmap| (bitmap.snapshot(None), bitmap.dependency_ref()))
        }

        fn universe(&self) -> (Arc<RoaringBitmap>, DependencyRef) {
            (self.all.snapshot(None), self.all.dependency_ref())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::StaticResolver;
    use super::*;

    fn resolver() -> StaticResolver {
        let mut resolver = StaticResolver::new();
        resolver.index("brand", "acme", &[1, 2, 3]);
        resolver.index("brand", "zenith", &[4, 5]);
        resolver.index("color", "red", &[2, 4]);
        resolver
    }

    #[test]
    fn equality_translates_to_an_index_leaf() {
        let resolver = resolver();
        let constraint = Constraint::AttributeEquals {
            attribute: "brand".to_string(),
            value: "acme".to_string(),
        };
        let formula = translate(&constraint, &resolver).unwrap();
        let ids: Vec<u32> = formula.compute().unwrap().iter().collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(formula.transactional_ids().len(), 1);
    }

    #[test]
    fn unknown_token_translates_to_empty_not_error() {
        let resolver = resolver();
        let constraint = Constraint::AttributeEquals {
            attribute: "brand".to_string(),
            value: "nonesuch".to_string(),
        };
        let formula = translate(&constraint, &resolver).unwrap();
        assert!(matches!(formula.as_ref(), Formula::Empty));
    }

    #[test]
    fn in_set_is_canonicalized_before_building() {
        let resolver = resolver();
        let shuffled = Constraint::AttributeInSet {
            attribute: "brand".to_string(),
            values: vec!["zenith".to_string(), "acme".to_string(), "zenith".to_string()],
        };
        let sorted = Constraint::AttributeInSet {
            attribute: "brand".to_string(),
            values: vec!["acme".to_string(), "zenith".to_string()],
        };
        let a = translate(&shuffled, &resolver).unwrap();
        let b = translate(&sorted, &resolver).unwrap();
        assert_eq!(a.structural_hash(), b.structural_hash());
    }

    #[test]
    fn range_constraint_fails_at_translation_time() {
        let resolver = resolver();
        let constraint = Constraint::AttributeInRange {
            attribute: "price".to_string(),
            from: 10.0,
            to: 20.0,
        };
        let err = translate(&constraint, &resolver).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[test]
    fn not_translates_to_a_deferred_node() {
        let resolver = resolver();
        let constraint = Constraint::Not(Box::new(Constraint::AttributeEquals {
            attribute: "color".to_string(),
            value: "red".to_string(),
        }));
        let formula = translate(&constraint, &resolver).unwrap();
        assert!(matches!(formula.as_ref(), Formula::DeferredNot { .. }));
    }

    #[test]
    fn user_filter_branch_keeps_its_marker() {
        let resolver = resolver();
        let constraint = Constraint::UserFilter {
            label: "brand".to_string(),
            children: vec![Constraint::AttributeEquals {
                attribute: "brand".to_string(),
                value: "acme".to_string(),
            }],
        };
        let formula = translate(&constraint, &resolver).unwrap();
        match formula.as_ref() {
            Formula::UserFilter { marker, .. } => assert_eq!(marker, "brand"),
            other => panic!("expected user filter, got {:?}", other),
        }
    }
}
