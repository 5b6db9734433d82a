use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use parking_lot::RwLock;
use serde::{Serialize, Deserialize};

/// What a counter hands out ids for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SequenceKind {
    EntityPrimaryKey,
    Transaction,
    RecordVersion,
}

/// Identifies one monotonic counter: (catalog, kind, optional entity type).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceKey {
    pub catalog: String,
    pub kind: SequenceKind,
    pub entity_type: Option<String>,
}

impl SequenceKey {
    pub fn new(catalog: impl Into<String>, kind: SequenceKind) -> Self {
        SequenceKey {
            catalog: catalog.into(),
            kind,
            entity_type: None,
        }
    }

    pub fn for_entity_type(
        catalog: impl Into<String>,
        kind: SequenceKind,
        entity_type: impl Into<String>,
    ) -> Self {
        SequenceKey {
            catalog: catalog.into(),
            kind,
            entity_type: Some(entity_type.into()),
        }
    }
}

/// Registry of monotonic counters, owned by the catalog context.
/// Counters are created lazily on first use and never reset.
pub struct SequenceRegistry {
    counters: RwLock<HashMap<SequenceKey, Arc<AtomicU64>>>,
}

impl SequenceRegistry {
    pub fn new() -> Self {
        SequenceRegistry {
            counters: RwLock::new(HashMap::new()),
        }
    }

    fn counter(&self, key: &SequenceKey) -> Arc<AtomicU64> {
        if let Some(counter) = self.counters.read().get(key) {
            return counter.clone();
        }
        let mut counters = self.counters.write();
        counters
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    /// Issue the next value for the counter. Values start at 1 and are
    /// collision-free per key.
    pub fn next(&self, key: &SequenceKey) -> u64 {
        self.counter(key).fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Last issued value, 0 if nothing was issued yet.
    pub fn peek(&self, key: &SequenceKey) -> u64 {
        self.counter(key).load(Ordering::Acquire)
    }

    /// Move the counter past `value` so replayed records never collide
    /// with freshly issued ids. Used during recovery.
    pub fn advance_to(&self, key: &SequenceKey, value: u64) {
        self.counter(key).fetch_max(value, Ordering::SeqCst);
    }
}

impl Default for SequenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_monotonic_and_independent() {
        let registry = SequenceRegistry::new();
        let pk = SequenceKey::for_entity_type("shop", SequenceKind::EntityPrimaryKey, "product");
        let txn = SequenceKey::new("shop", SequenceKind::Transaction);

        assert_eq!(registry.next(&pk), 1);
        assert_eq!(registry.next(&pk), 2);
        assert_eq!(registry.next(&txn), 1);
        assert_eq!(registry.peek(&pk), 2);
    }

    #[test]
    fn advance_to_skips_replayed_range() {
        let registry = SequenceRegistry::new();
        let key = SequenceKey::new("shop", SequenceKind::RecordVersion);

        registry.advance_to(&key, 41);
        assert_eq!(registry.next(&key), 42);

        // Advancing backwards never rewinds the counter
        registry.advance_to(&key, 10);
        assert_eq!(registry.next(&key), 43);
    }

    #[test]
    fn entity_type_discriminator_separates_counters() {
        let registry = SequenceRegistry::new();
        let products =
            SequenceKey::for_entity_type("shop", SequenceKind::EntityPrimaryKey, "product");
        let brands = SequenceKey::for_entity_type("shop", SequenceKind::EntityPrimaryKey, "brand");

        assert_eq!(registry.next(&products), 1);
        assert_eq!(registry.next(&brands), 1);
    }
}
