use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use parking_lot::RwLock;
use crate::core::error::{Error, ErrorKind, Result};
use crate::txn::context::Txn;
use crate::txn::producer::{DependencyRef, OpenLayer, ProducerId, TransactionalProducer};

#[derive(Debug, Clone)]
pub enum MapOp<V> {
    Put(V),
    Remove,
}

/// Transaction-scoped diff over a map: the last operation per key wins.
#[derive(Debug, Clone)]
pub struct MapChanges<K, V> {
    pub entries: HashMap<K, MapOp<V>>,
}

impl<K, V> Default for MapChanges<K, V> {
    fn default() -> Self {
        MapChanges {
            entries: HashMap::new(),
        }
    }
}

struct MapInner<K, V> {
    id: ProducerId,
    version: Arc<AtomicU64>,
    base: RwLock<Arc<HashMap<K, V>>>,
}

/// Keyed store with a per-transaction overlay, used for entity bodies and
/// index dictionaries. Point reads check the overlay first and fall back
/// to the shared base snapshot.
pub struct TransactionalMap<K, V> {
    inner: Arc<MapInner<K, V>>,
}

impl<K, V> Clone for TransactionalMap<K, V> {
    fn clone(&self) -> Self {
        TransactionalMap {
            inner: self.inner.clone(),
        }
    }
}

struct MapOverlay<K, V> {
    producer: TransactionalMap<K, V>,
    changes: MapChanges<K, V>,
}

impl<K, V> OpenLayer for MapOverlay<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn producer_id(&self) -> ProducerId {
        self.producer.producer_id()
    }

    fn prepare(&self) -> Result<()> {
        Ok(())
    }

    fn publish(self: Box<Self>) {
        self.producer.commit_layer(self.changes);
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl<K, V> TransactionalMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        TransactionalMap {
            inner: Arc::new(MapInner {
                id: ProducerId::next(),
                version: Arc::new(AtomicU64::new(0)),
                base: RwLock::new(Arc::new(HashMap::new())),
            }),
        }
    }

    fn changes_mut<'t>(&self, txn: &'t mut Txn) -> Result<&'t mut MapChanges<K, V>> {
        let producer = self.clone();
        let holder = txn.open_layer(self.producer_id(), move || {
            let changes = producer.create_layer();
            Box::new(MapOverlay { producer, changes })
        })?;
        holder
            .as_any_mut()
            .downcast_mut::<MapOverlay<K, V>>()
            .map(|overlay| &mut overlay.changes)
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::Internal,
                    "open layer is not a map overlay".to_string(),
                )
            })
    }

    fn changes<'t>(&self, txn: &'t Txn) -> Option<&'t MapChanges<K, V>> {
        txn.layer(self.inner.id)
            .and_then(|holder| holder.as_any().downcast_ref::<MapOverlay<K, V>>())
            .map(|overlay| &overlay.changes)
    }

    pub fn insert(&self, txn: &mut Txn, key: K, value: V) -> Result<()> {
        self.changes_mut(txn)?
            .entries
            .insert(key, MapOp::Put(value));
        Ok(())
    }

    /// Removing a key absent from the merged view is an invalid mutation.
    pub fn remove(&self, txn: &mut Txn, key: &K) -> Result<()> {
        if !self.contains_key(Some(txn), key) {
            return Err(Error::new(
                ErrorKind::InvalidMutation,
                "key is not present, cannot remove".to_string(),
            ));
        }
        self.changes_mut(txn)?
            .entries
            .insert(key.clone(), MapOp::Remove);
        Ok(())
    }

    pub fn get(&self, txn: Option<&Txn>, key: &K) -> Option<V> {
        if let Some(changes) = txn.and_then(|t| self.changes(t)) {
            match changes.entries.get(key) {
                Some(MapOp::Put(value)) => return Some(value.clone()),
                Some(MapOp::Remove) => return None,
                None => {}
            }
        }
        self.inner.base.read().get(key).cloned()
    }

    pub fn contains_key(&self, txn: Option<&Txn>, key: &K) -> bool {
        if let Some(changes) = txn.and_then(|t| self.changes(t)) {
            match changes.entries.get(key) {
                Some(MapOp::Put(_)) => return true,
                Some(MapOp::Remove) => return false,
                None => {}
            }
        }
        self.inner.base.read().contains_key(key)
    }

    pub fn len(&self, txn: Option<&Txn>) -> usize {
        let base = self.inner.base.read();
        match txn.and_then(|t| self.changes(t)) {
            Some(changes) => {
                let mut len = base.len();
                for (key, op) in &changes.entries {
                    match (op, base.contains_key(key)) {
                        (MapOp::Put(_), false) => len += 1,
                        (MapOp::Remove, true) => len -= 1,
                        _ => {}
                    }
                }
                len
            }
            None => base.len(),
        }
    }

    pub fn is_empty(&self, txn: Option<&Txn>) -> bool {
        self.len(txn) == 0
    }

    /// Committed base snapshot. Overlays of open transactions are not
    /// visible here.
    pub fn snapshot(&self) -> Arc<HashMap<K, V>> {
        self.inner.base.read().clone()
    }

    /// Direct-mutation path for single-threaded bulk load. Not safe for
    /// concurrent writers; transactional writers must use `insert`/`remove`.
    pub fn bulk(&self) -> MapBulkWriter<'_, K, V> {
        MapBulkWriter {
            producer: self,
            mutated: false,
        }
    }
}

/// Guard for the explicit bulk-load mode. Mutates the base directly and
/// bumps the producer version once when dropped.
pub struct MapBulkWriter<'a, K, V> {
    producer: &'a TransactionalMap<K, V>,
    mutated: bool,
}

impl<K, V> MapBulkWriter<'_, K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn insert(&mut self, key: K, value: V) {
        let mut base = self.producer.inner.base.write();
        Arc::make_mut(&mut base).insert(key, value);
        self.mutated = true;
    }

    pub fn remove(&mut self, key: &K) {
        let mut base = self.producer.inner.base.write();
        Arc::make_mut(&mut base).remove(key);
        self.mutated = true;
    }
}

impl<K, V> Drop for MapBulkWriter<'_, K, V> {
    fn drop(&mut self) {
        if self.mutated {
            self.producer.inner.version.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl<K, V> Default for TransactionalMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> TransactionalProducer for TransactionalMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Layer = MapChanges<K, V>;

    fn producer_id(&self) -> ProducerId {
        self.inner.id
    }

    fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    fn create_layer(&self) -> MapChanges<K, V> {
        MapChanges::default()
    }

    fn commit_layer(&self, layer: MapChanges<K, V>) {
        if layer.entries.is_empty() {
            return;
        }
        let mut base = self.inner.base.write();
        let mut merged = (**base).clone();
        for (key, op) in layer.entries {
            match op {
                MapOp::Put(value) => {
                    merged.insert(key, value);
                }
                MapOp::Remove => {
                    merged.remove(&key);
                }
            }
        }
        *base = Arc::new(merged);
        self.inner.version.fetch_add(1, Ordering::SeqCst);
    }

    fn dependency_ref(&self) -> DependencyRef {
        DependencyRef::new(self.inner.id, self.inner.version.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_shadows_base_until_commit() {
        let map: TransactionalMap<String, u64> = TransactionalMap::new();
        map.bulk().insert("a".to_string(), 1);

        let mut txn = Txn::begin(1);
        map.insert(&mut txn, "a".to_string(), 2).unwrap();
        map.insert(&mut txn, "b".to_string(), 3).unwrap();

        assert_eq!(map.get(Some(&txn), &"a".to_string()), Some(2));
        assert_eq!(map.get(None, &"a".to_string()), Some(1));
        assert_eq!(map.len(Some(&txn)), 2);
        assert_eq!(map.len(None), 1);

        txn.commit().unwrap();
        assert_eq!(map.get(None, &"a".to_string()), Some(2));
        assert_eq!(map.get(None, &"b".to_string()), Some(3));
    }

    #[test]
    fn bulk_writer_bumps_the_version_once() {
        let map: TransactionalMap<String, u64> = TransactionalMap::new();
        {
            let mut writer = map.bulk();
            writer.insert("a".to_string(), 1);
            writer.insert("b".to_string(), 2);
            writer.remove(&"a".to_string());
        }
        assert_eq!(map.get(None, &"a".to_string()), None);
        assert_eq!(map.get(None, &"b".to_string()), Some(2));
        assert_eq!(map.version(), 1);
    }

    #[test]
    fn remove_of_missing_key_is_rejected() {
        let map: TransactionalMap<String, u64> = TransactionalMap::new();
        let mut txn = Txn::begin(2);
        let err = map.remove(&mut txn, &"ghost".to_string()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidMutation);
        txn.rollback();
    }

    #[test]
    fn removed_key_is_gone_in_overlay_and_after_commit() {
        let map: TransactionalMap<String, u64> = TransactionalMap::new();
        map.bulk().insert("a".to_string(), 1);

        let mut txn = Txn::begin(3);
        map.remove(&mut txn, &"a".to_string()).unwrap();
        assert_eq!(map.get(Some(&txn), &"a".to_string()), None);
        assert_eq!(map.get(None, &"a".to_string()), Some(1));

        txn.commit().unwrap();
        assert_eq!(map.get(None, &"a".to_string()), None);
    }
}
