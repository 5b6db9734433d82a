use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use parking_lot::RwLock;
use roaring::RoaringBitmap;
use crate::core::error::{Error, ErrorKind, Result};
use crate::txn::context::Txn;
use crate::txn::producer::{DependencyRef, OpenLayer, ProducerId, TransactionalProducer};

/// Transaction-scoped diff over a bitmap: ids added and ids removed.
/// An id is in at most one of the two sets at a time.
#[derive(Debug, Default, Clone)]
pub struct BitmapChanges {
    pub added: RoaringBitmap,
    pub removed: RoaringBitmap,
}

impl BitmapChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

struct BitmapInner {
    id: ProducerId,
    version: Arc<AtomicU64>,
    base: RwLock<Arc<RoaringBitmap>>,
}

/// Sorted integer set with a per-transaction overlay. Readers outside a
/// transaction see the committed base; a transaction sees base + its own
/// layer. Point reads merge in O(1), never rescanning the base.
#[derive(Clone)]
pub struct TransactionalBitmap {
    inner: Arc<BitmapInner>,
}

struct BitmapOverlay {
    producer: TransactionalBitmap,
    changes: BitmapChanges,
}

impl OpenLayer for BitmapOverlay {
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

impl TransactionalBitmap {
    pub fn new() -> Self {
        Self::from_bitmap(RoaringBitmap::new())
    }

    pub fn from_bitmap(bitmap: RoaringBitmap) -> Self {
        TransactionalBitmap {
            inner: Arc::new(BitmapInner {
                id: ProducerId::next(),
                version: Arc::new(AtomicU64::new(0)),
                base: RwLock::new(Arc::new(bitmap)),
            }),
        }
    }

    fn changes_mut<'t>(&self, txn: &'t mut Txn) -> Result<&'t mut BitmapChanges> {
        let producer = self.clone();
        let holder = txn.open_layer(self.producer_id(), move || {
            let changes = producer.create_layer();
            Box::new(BitmapOverlay { producer, changes })
        })?;
        holder
            .as_any_mut()
            .downcast_mut::<BitmapOverlay>()
            .map(|overlay| &mut overlay.changes)
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::Internal,
                    "open layer is not a bitmap overlay".to_string(),
                )
            })
    }

    fn changes<'t>(&self, txn: &'t Txn) -> Option<&'t BitmapChanges> {
        txn.layer(self.inner.id)
            .and_then(|holder| holder.as_any().downcast_ref::<BitmapOverlay>())
            .map(|overlay| &overlay.changes)
    }

    pub fn insert(&self, txn: &mut Txn, id: u32) -> Result<()> {
        let changes = self.changes_mut(txn)?;
        changes.removed.remove(id);
        changes.added.insert(id);
        Ok(())
    }

    /// Removing an id that is not present in the merged view is an
    /// invalid mutation, surfaced immediately and never retried.
    pub fn remove(&self, txn: &mut Txn, id: u32) -> Result<()> {
        if !self.contains(Some(txn), id) {
            return Err(Error::new(
                ErrorKind::InvalidMutation,
                format!("id {} is not present, cannot remove", id),
            ));
        }
        let changes = self.changes_mut(txn)?;
        changes.added.remove(id);
        changes.removed.insert(id);
        Ok(())
    }

    pub fn contains(&self, txn: Option<&Txn>, id: u32) -> bool {
        if let Some(changes) = txn.and_then(|t| self.changes(t)) {
            if changes.removed.contains(id) {
                return false;
            }
            if changes.added.contains(id) {
                return true;
            }
        }
        self.inner.base.read().contains(id)
    }

    pub fn len(&self, txn: Option<&Txn>) -> u64 {
        match txn.and_then(|t| self.changes(t)) {
            Some(changes) if !changes.is_empty() => self.snapshot(txn).len(),
            _ => self.inner.base.read().len(),
        }
    }

    pub fn is_empty(&self, txn: Option<&Txn>) -> bool {
        self.len(txn) == 0
    }

    /// Materialized merged view. Without an open layer this is a cheap
    /// clone of the shared base snapshot.
    pub fn snapshot(&self, txn: Option<&Txn>) -> Arc<RoaringBitmap> {
        let base = self.inner.base.read().clone();
        match txn.and_then(|t| self.changes(t)) {
            Some(changes) if !changes.is_empty() => {
                let mut merged = (*base).clone();
                merged |= &changes.added;
                merged -= &changes.removed;
                Arc::new(merged)
            }
            _ => base,
        }
    }

    /// Direct-mutation path for single-threaded bulk load. Not safe for
    /// concurrent writers; transactional writers must use `insert`/`remove`.
    pub fn bulk(&self) -> BitmapBulkWriter<'_> {
        BitmapBulkWriter {
            producer: self,
            mutated: false,
        }
    }
}

impl Default for TransactionalBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionalProducer for TransactionalBitmap {
    type Layer = BitmapChanges;

    fn producer_id(&self) -> ProducerId {
        self.inner.id
    }

    fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    fn create_layer(&self) -> BitmapChanges {
        BitmapChanges::default()
    }

    fn commit_layer(&self, layer: BitmapChanges) {
        if layer.is_empty() {
            return;
        }
        let mut base = self.inner.base.write();
        let mut merged = (**base).clone();
        merged |= &layer.added;
        merged -= &layer.removed;
        *base = Arc::new(merged);
        self.inner.version.fetch_add(1, Ordering::SeqCst);
    }

    fn dependency_ref(&self) -> DependencyRef {
        DependencyRef::new(self.inner.id, self.inner.version.clone())
    }
}

/// Guard for the explicit bulk-load mode. Mutates the base directly and
/// bumps the producer version once when dropped.
pub struct BitmapBulkWriter<'a> {
    producer: &'a TransactionalBitmap,
    mutated: bool,
}

impl BitmapBulkWriter<'_> {
    pub fn insert(&mut self, id: u32) {
        let mut base = self.producer.inner.base.write();
        Arc::make_mut(&mut base).insert(id);
        self.mutated = true;
    }

    pub fn remove(&mut self, id: u32) {
        let mut base = self.producer.inner.base.write();
        Arc::make_mut(&mut base).remove(id);
        self.mutated = true;
    }
}

impl Drop for BitmapBulkWriter<'_> {
    fn drop(&mut self) {
        if self.mutated {
            self.producer.inner.version.fetch_add(1, Ordering::SeqCst);
        }
    }
}
