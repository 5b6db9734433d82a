use std::sync::Arc;
use crate::core::error::Result;
use crate::formula::node::Formula;

/// Impact of one facet option on the current result set: how many
/// entities would match if the option were added to the filter.
#[derive(Debug, Clone, PartialEq)]
pub struct FacetCount {
    pub label: String,
    pub count: u64,
}

/// Tree with the user-filter branch carrying `marker` removed, as if the
/// user had cleared that facet group. And/Or constructors canonicalize
/// whatever remains; a tree that consisted of only that branch collapses
/// to the canonical empty set.
pub fn exclude_user_filter(root: &Arc<Formula>, marker: &str) -> Arc<Formula> {
    match root.as_ref() {
        Formula::UserFilter { marker: m, .. } if m == marker => Formula::and(Vec::new()),
        Formula::UserFilter { marker: m, inner } => {
            Formula::user_filter(m.clone(), exclude_user_filter(inner, marker))
        }
        Formula::And { children } => Formula::and(rewrite_children(children, marker)),
        Formula::Or { children } => Formula::or(rewrite_children(children, marker)),
        Formula::Not { universe, negated } => Formula::not(
            exclude_user_filter(universe, marker),
            exclude_user_filter(negated, marker),
        ),
        _ => root.clone(),
    }
}

fn rewrite_children(children: &[Arc<Formula>], marker: &str) -> Vec<Arc<Formula>> {
    children
        .iter()
        .filter(|child| !matches!(child.as_ref(), Formula::UserFilter { marker: m, .. } if m == marker))
        .map(|child| exclude_user_filter(child, marker))
        .collect()
}

/// Tree with `option` unioned into the user-filter branch carrying
/// `marker`, as if the user had toggled that option on. When the group is
/// not filtered yet, the option becomes a new marked branch intersected
/// with the whole tree.
pub fn with_option(root: &Arc<Formula>, marker: &str, option: Arc<Formula>) -> Arc<Formula> {
    let (rewritten, found) = add_option(root, marker, &option);
    if found {
        rewritten
    } else {
        Formula::and(vec![root.clone(), Formula::user_filter(marker, option)])
    }
}

fn add_option(
    node: &Arc<Formula>,
    marker: &str,
    option: &Arc<Formula>,
) -> (Arc<Formula>, bool) {
    match node.as_ref() {
        Formula::UserFilter { marker: m, inner } if m == marker => (
            Formula::user_filter(m.clone(), Formula::or(vec![inner.clone(), option.clone()])),
            true,
        ),
        Formula::UserFilter { marker: m, inner } => {
            let (inner, found) = add_option(inner, marker, option);
            (Formula::user_filter(m.clone(), inner), found)
        }
        Formula::And { children } => {
            let (children, found) = add_option_children(children, marker, option);
            (Formula::and(children), found)
        }
        Formula::Or { children } => {
            let (children, found) = add_option_children(children, marker, option);
            (Formula::or(children), found)
        }
        Formula::Not { universe, negated } => {
            let (universe, found_u) = add_option(universe, marker, option);
            let (negated, found_n) = add_option(negated, marker, option);
            (Formula::not(universe, negated), found_u || found_n)
        }
        _ => (node.clone(), false),
    }
}

fn add_option_children(
    children: &[Arc<Formula>],
    marker: &str,
    option: &Arc<Formula>,
) -> (Vec<Arc<Formula>>, bool) {
    let mut found = false;
    let rewritten = children
        .iter()
        .map(|child| {
            let (child, hit) = add_option(child, marker, option);
            found |= hit;
            child
        })
        .collect();
    (rewritten, found)
}

/// How many results would remain if `option` were added to the facet
/// group identified by `marker`.
pub fn request_impact(root: &Arc<Formula>, marker: &str, option: Arc<Formula>) -> Result<u64> {
    Ok(with_option(root, marker, option).compute()?.len())
}
