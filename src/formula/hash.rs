use xxhash_rust::xxh3::Xxh3;
use crate::formula::node::Formula;
use crate::txn::producer::DependencyRef;

// One seed per node kind, so a leaf and a one-child union over the same
// set can never collide by construction.
const SEED_EMPTY: u64 = 0xc6a4_a793_5bd1_e995;
const SEED_LEAF: u64 = 0xff51_afd7_ed55_8ccd;
const SEED_AND: u64 = 0xc4ce_b9fe_1a85_ec53;
const SEED_OR: u64 = 0x9e37_79b9_7f4a_7c15;
const SEED_NOT: u64 = 0x2545_f491_4f6c_dd1d;
const SEED_DEFERRED: u64 = 0x8538_ecb5_bd45_6ea3;
const SEED_USER_FILTER: u64 = 0x27d4_eb2f_1656_67c5;
const SEED_DEPENDENCY: u64 = 0x1656_67c5_27d4_eb2f;

/// Structural hash of a formula subtree.
///
/// And/Or hash their children order-insensitively: the child hashes are
/// sorted before mixing, so cost-based operand reordering and trees built
/// in a different operand order memoize to the same cache entry. Not and
/// UserFilter operands are not commutative and hash in order. Leaves hash
/// their set contents, which makes two structurally different predicates
/// matching the same ids cache-compatible.
pub fn structural_hash(formula: &Formula) -> u64 {
    match formula {
        Formula::Empty => Xxh3::with_seed(SEED_EMPTY).digest(),
        Formula::Leaf { bitmap, .. } => {
            let mut hasher = Xxh3::with_seed(SEED_LEAF);
            for id in bitmap.iter() {
                hasher.update(&id.to_le_bytes());
            }
            hasher.digest()
        }
        Formula::And { children } => combine_unordered(SEED_AND, children),
        Formula::Or { children } => combine_unordered(SEED_OR, children),
        Formula::Not { universe, negated } => {
            let mut hasher = Xxh3::with_seed(SEED_NOT);
            hasher.update(&structural_hash(universe).to_le_bytes());
            hasher.update(&structural_hash(negated).to_le_bytes());
            hasher.digest()
        }
        Formula::DeferredNot { negated } => {
            let mut hasher = Xxh3::with_seed(SEED_DEFERRED);
            hasher.update(&structural_hash(negated).to_le_bytes());
            hasher.digest()
        }
        Formula::UserFilter { marker, inner } => {
            let mut hasher = Xxh3::with_seed(SEED_USER_FILTER);
            hasher.update(marker.as_bytes());
            hasher.update(&structural_hash(inner).to_le_bytes());
            hasher.digest()
        }
    }
}

fn combine_unordered(seed: u64, children: &[std::sync::Arc<Formula>]) -> u64 {
    let mut hashes: Vec<u64> = children.iter().map(|child| structural_hash(child)).collect();
    hashes.sort_unstable();
    let mut hasher = Xxh3::with_seed(seed);
    for hash in hashes {
        hasher.update(&hash.to_le_bytes());
    }
    hasher.digest()
}

/// Hash of the current committed versions of the given producers. Stale
/// cache entries miss on their own because any committed mutation bumps a
/// version and therefore changes this value.
pub fn dependency_hash(deps: &[DependencyRef]) -> u64 {
    combine_dependency(deps, DependencyRef::current_hash)
}

/// Hash of the versions the producers were at when the references were
/// taken, i.e. when their snapshots were read. Artifacts are stored under
/// this value: a commit landing between snapshot and store then keys the
/// artifact to the state it was actually computed from, and the next
/// live-version lookup misses instead of treating it as current.
pub fn observed_dependency_hash(deps: &[DependencyRef]) -> u64 {
    combine_dependency(deps, DependencyRef::observed_hash)
}

fn combine_dependency(deps: &[DependencyRef], hash_of: impl Fn(&DependencyRef) -> u64) -> u64 {
    let mut ordered: Vec<&DependencyRef> = deps.iter().collect();
    ordered.sort_by_key(|dep| dep.id());
    let mut hasher = Xxh3::with_seed(SEED_DEPENDENCY);
    for dep in ordered {
        hasher.update(&hash_of(dep).to_le_bytes());
    }
    hasher.digest()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::node::leaf_of;
    use crate::txn::bitmap::TransactionalBitmap;
    use crate::txn::context::Txn;
    use crate::txn::producer::TransactionalProducer;

    #[test]
    fn and_hash_is_order_insensitive() {
        let a = leaf_of(&[1, 3, 5]);
        let b = leaf_of(&[3, 5, 7]);
        let forward = Formula::and(vec![a.clone(), b.clone()]);
        let backward = Formula::and(vec![b, a]);
        assert_eq!(structural_hash(&forward), structural_hash(&backward));
    }

    #[test]
    fn node_kinds_with_equal_operands_do_not_collide() {
        let a = leaf_of(&[1, 2]);
        let b = leaf_of(&[3, 4]);
        let and = Formula::and(vec![a.clone(), b.clone()]);
        let or = Formula::or(vec![a.clone(), b.clone()]);
        let not = Formula::not(a.clone(), b.clone());
        assert_ne!(structural_hash(&and), structural_hash(&or));
        assert_ne!(structural_hash(&and), structural_hash(&not));
    }

    #[test]
    fn equal_contents_from_different_predicates_hash_equal() {
        // Two separately built leaves matching the same ids are
        // cache-compatible.
        let a = leaf_of(&[2, 4, 6]);
        let b = leaf_of(&[2, 4, 6]);
        assert_eq!(structural_hash(&a), structural_hash(&b));
    }

    #[test]
    fn dependency_hash_changes_when_any_producer_mutates() {
        let bitmap = TransactionalBitmap::new();
        let deps = vec![bitmap.dependency_ref()];
        let before = dependency_hash(&deps);

        let mut txn = Txn::begin(1);
        bitmap.insert(&mut txn, 10).unwrap();
        txn.commit().unwrap();

        assert_ne!(dependency_hash(&deps), before);
    }

    #[test]
    fn observed_hash_stays_keyed_to_the_snapshot_versions() {
        let bitmap = TransactionalBitmap::new();
        let deps = vec![bitmap.dependency_ref()];
        let at_snapshot = observed_dependency_hash(&deps);
        assert_eq!(at_snapshot, dependency_hash(&deps));

        // A commit after the reference was taken moves the live hash but
        // not the observed one, so an artifact stored under the observed
        // hash can never pass for current state.
        let mut txn = Txn::begin(2);
        bitmap.insert(&mut txn, 10).unwrap();
        txn.commit().unwrap();

        assert_eq!(observed_dependency_hash(&deps), at_snapshot);
        assert_ne!(dependency_hash(&deps), at_snapshot);
    }

    #[test]
    fn dependency_hash_ignores_reference_order() {
        let first = TransactionalBitmap::new();
        let second = TransactionalBitmap::new();
        let forward = vec![first.dependency_ref(), second.dependency_ref()];
        let backward = vec![second.dependency_ref(), first.dependency_ref()];
        assert_eq!(dependency_hash(&forward), dependency_hash(&backward));
    }
}
