use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use parking_lot::RwLock;
use crate::core::error::{Error, ErrorKind, Result};
use crate::txn::context::Txn;
use crate::txn::producer::{DependencyRef, OpenLayer, ProducerId, TransactionalProducer};

/// Tri-state boolean diff: untouched, set to true, or set to false.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlagChange {
    pub value: Option<bool>,
}

struct FlagInner {
    id: ProducerId,
    version: Arc<AtomicU64>,
    base: RwLock<bool>,
}

/// Boolean with a per-transaction overlay, e.g. "index exists" or
/// "entity type enabled" switches read on every query.
#[derive(Clone)]
pub struct TransactionalFlag {
    inner: Arc<FlagInner>,
}

struct FlagOverlay {
    producer: TransactionalFlag,
    change: FlagChange,
}

impl OpenLayer for FlagOverlay {
    fn producer_id(&self) -> ProducerId {
        self.producer.producer_id()
    }

    fn prepare(&self) -> Result<()> {
        Ok(())
    }

    fn publish(self: Box<Self>) {
        self.producer.commit_layer(self.change);
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl TransactionalFlag {
    pub fn new(value: bool) -> Self {
        TransactionalFlag {
            inner: Arc::new(FlagInner {
                id: ProducerId::next(),
                version: Arc::new(AtomicU64::new(0)),
                base: RwLock::new(value),
            }),
        }
    }

    pub fn set(&self, txn: &mut Txn, value: bool) -> Result<()> {
        let producer = self.clone();
        let holder = txn.open_layer(self.producer_id(), move || {
            let change = producer.create_layer();
            Box::new(FlagOverlay { producer, change })
        })?;
        holder
            .as_any_mut()
            .downcast_mut::<FlagOverlay>()
            .map(|overlay| overlay.change.value = Some(value))
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::Internal,
                    "open layer is not a flag overlay".to_string(),
                )
            })
    }

    pub fn get(&self, txn: Option<&Txn>) -> bool {
        let overlay = txn
            .and_then(|t| t.layer(self.inner.id))
            .and_then(|holder| holder.as_any().downcast_ref::<FlagOverlay>())
            .and_then(|overlay| overlay.change.value);
        match overlay {
            Some(value) => value,
            None => *self.inner.base.read(),
        }
    }

    /// Direct-mutation path for single-threaded bulk load. Not safe for
    /// concurrent writers; transactional writers must use `set`.
    pub fn bulk(&self) -> FlagBulkWriter<'_> {
        FlagBulkWriter {
            producer: self,
            mutated: false,
        }
    }
}

/// Guard for the explicit bulk-load mode. Mutates the base directly and
/// bumps the producer version once when dropped.
pub struct FlagBulkWriter<'a> {
    producer: &'a TransactionalFlag,
    mutated: bool,
}

impl FlagBulkWriter<'_> {
    pub fn set(&mut self, value: bool) {
        let mut base = self.producer.inner.base.write();
        if *base != value {
            *base = value;
            self.mutated = true;
        }
    }
}

impl Drop for FlagBulkWriter<'_> {
    fn drop(&mut self) {
        if self.mutated {
            self.producer.inner.version.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl TransactionalProducer for TransactionalFlag {
    type Layer = FlagChange;

    fn producer_id(&self) -> ProducerId {
        self.inner.id
    }

    fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    fn create_layer(&self) -> FlagChange {
        FlagChange::default()
    }

    fn commit_layer(&self, layer: FlagChange) {
        if let Some(value) = layer.value {
            let mut base = self.inner.base.write();
            *base = value;
            self.inner.version.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn dependency_ref(&self) -> DependencyRef {
        DependencyRef::new(self.inner.id, self.inner.version.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncommitted_set_is_invisible_to_outside_readers() {
        let flag = TransactionalFlag::new(false);
        let mut txn = Txn::begin(1);

        flag.set(&mut txn, true).unwrap();
        assert!(flag.get(Some(&txn)));
        assert!(!flag.get(None));

        txn.commit().unwrap();
        assert!(flag.get(None));
    }

    #[test]
    fn bulk_writer_bumps_the_version_once() {
        let flag = TransactionalFlag::new(false);
        {
            let mut writer = flag.bulk();
            writer.set(true);
            writer.set(false);
            writer.set(true);
        }
        assert!(flag.get(None));
        assert_eq!(flag.version(), 1);
    }

    #[test]
    fn last_set_in_transaction_wins() {
        let flag = TransactionalFlag::new(false);
        let mut txn = Txn::begin(2);

        flag.set(&mut txn, true).unwrap();
        flag.set(&mut txn, false).unwrap();
        txn.commit().unwrap();

        assert!(!flag.get(None));
        assert_eq!(flag.version(), 1);
    }
}
