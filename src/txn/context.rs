use std::collections::HashMap;
use tracing::debug;
use crate::core::error::{Error, ErrorKind, Result};
use crate::txn::producer::{OpenLayer, ProducerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    RolledBack,
}

/// Explicit transaction handle. Writes go through `&mut Txn`, so a
/// transaction stays bound to one thread for its whole lifetime and no
/// thread can ever observe another thread's open layers. Commit and
/// rollback consume the handle; a closed transaction cannot be used again.
pub struct Txn {
    pub id: u64,
    state: TxnState,
    layers: HashMap<ProducerId, Box<dyn OpenLayer>>,
    /// Producer ids in first-write order. Layers merge in this order on
    /// commit.
    order: Vec<ProducerId>,
}

impl Txn {
    pub fn begin(id: u64) -> Self {
        Txn {
            id,
            state: TxnState::Active,
            layers: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TxnState::Active
    }

    /// True once any producer opened a layer in this transaction.
    pub fn has_layers(&self) -> bool {
        !self.layers.is_empty()
    }

    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::InvalidState,
                format!("transaction {} is {:?}, not active", self.id, self.state),
            ))
        }
    }

    /// The calling producer's open layer, created lazily on first write.
    pub(crate) fn open_layer<F>(&mut self, id: ProducerId, make: F) -> Result<&mut dyn OpenLayer>
    where
        F: FnOnce() -> Box<dyn OpenLayer>,
    {
        self.ensure_active()?;
        let holder = match self.layers.entry(id) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                self.order.push(id);
                entry.insert(make())
            }
        };
        Ok(holder.as_mut())
    }

    /// The calling producer's open layer, if any. Read paths merge it over
    /// the base; absence means the base view is authoritative.
    pub(crate) fn layer(&self, id: ProducerId) -> Option<&dyn OpenLayer> {
        self.layers.get(&id).map(|holder| holder.as_ref())
    }

    /// Merge every open layer into its producer, in submission order.
    /// Consumes the handle, so stale use is impossible after commit.
    ///
    /// All-or-nothing over the layers: every layer prepares before the
    /// first one publishes, so a rejected commit leaves every producer at
    /// its pre-commit state and the transaction counts as rolled back.
    pub fn commit(mut self) -> Result<()> {
        self.ensure_active()?;
        for id in &self.order {
            if let Some(layer) = self.layers.get(id) {
                if let Err(err) = layer.prepare() {
                    self.state = TxnState::RolledBack;
                    debug!(txn = self.id, "commit rejected, layers discarded");
                    return Err(err);
                }
            }
        }
        let count = self.order.len();
        for id in std::mem::take(&mut self.order) {
            if let Some(layer) = self.layers.remove(&id) {
                layer.publish();
            }
        }
        self.state = TxnState::Committed;
        debug!(txn = self.id, producers = count, "transaction committed");
        Ok(())
    }

    /// Discard all open layers. Base state is untouched.
    pub fn rollback(mut self) {
        self.state = TxnState::RolledBack;
        self.layers.clear();
        self.order.clear();
        debug!(txn = self.id, "transaction rolled back");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::bitmap::TransactionalBitmap;
    use crate::txn::producer::TransactionalProducer;

    struct RejectingLayer {
        id: ProducerId,
    }

    impl OpenLayer for RejectingLayer {
        fn producer_id(&self) -> ProducerId {
            self.id
        }

        fn prepare(&self) -> Result<()> {
            Err(Error::new(
                ErrorKind::InvalidMutation,
                "diff rejected".to_string(),
            ))
        }

        fn publish(self: Box<Self>) {
            unreachable!("rejected layer must never publish");
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    }

    #[test]
    fn rejected_commit_publishes_no_layer_at_all() {
        let bitmap = TransactionalBitmap::new();
        let mut txn = Txn::begin(1);
        bitmap.insert(&mut txn, 7).unwrap();

        let id = ProducerId::next();
        txn.open_layer(id, || Box::new(RejectingLayer { id })).unwrap();

        let err = txn.commit().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidMutation);

        // The bitmap layer preceded the rejected one, yet nothing of it
        // reached the base.
        assert!(!bitmap.contains(None, 7));
        assert_eq!(bitmap.version(), 0);
    }
}
