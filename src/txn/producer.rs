use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use xxhash_rust::xxh3::xxh3_64_with_seed;
use crate::core::error::Result;

/// Producer id generator. Ids only need to be unique within the process;
/// they are mixed with the producer version to form dependency hashes.
static PRODUCER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProducerId(pub u64);

impl ProducerId {
    pub fn next() -> Self {
        ProducerId(PRODUCER_ID_COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

const VERSION_HASH_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// Cheap handle a formula keeps for every transactional structure it read.
/// The version is shared with the producer, so `current_hash` always
/// reflects the latest committed state and stale cache entries miss on
/// their own. The version at construction time is also kept: a reference
/// is created right before the snapshot it describes, so `observed_hash`
/// keys an artifact to the state the computation actually read even when
/// a commit lands mid-query.
#[derive(Debug, Clone)]
pub struct DependencyRef {
    id: ProducerId,
    version: Arc<AtomicU64>,
    observed: u64,
}

impl DependencyRef {
    pub fn new(id: ProducerId, version: Arc<AtomicU64>) -> Self {
        let observed = version.load(Ordering::Acquire);
        DependencyRef {
            id,
            version,
            observed,
        }
    }

    pub fn id(&self) -> ProducerId {
        self.id
    }

    pub fn current_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Version at the time this reference was taken.
    pub fn observed_version(&self) -> u64 {
        self.observed
    }

    /// Hash of (producer id, current committed version). Lookup side of
    /// the cache: a hit means the stored artifact matches present state.
    pub fn current_hash(&self) -> u64 {
        version_hash(self.id, self.current_version())
    }

    /// Hash of (producer id, version at snapshot time). Store side of the
    /// cache: keys an artifact to the state it was computed from.
    pub fn observed_hash(&self) -> u64 {
        version_hash(self.id, self.observed)
    }
}

fn version_hash(id: ProducerId, version: u64) -> u64 {
    let mut buf = [0u8; 16];
    buf[..8].copy_from_slice(&id.0.to_le_bytes());
    buf[8..].copy_from_slice(&version.to_le_bytes());
    xxh3_64_with_seed(&buf, VERSION_HASH_SEED)
}

/// A structure exposing a mutable public view computed by merging an
/// immutable base state with an optional per-transaction layer.
///
/// The base state is never mutated in place while a transaction holds an
/// open layer over it; committing builds a new base snapshot and swaps it
/// in, so readers holding the old snapshot keep a consistent view.
pub trait TransactionalProducer {
    type Layer;

    fn producer_id(&self) -> ProducerId;

    /// Committed version. Incremented by every committed mutation.
    fn version(&self) -> u64;

    /// Fresh, empty diff for one transaction.
    fn create_layer(&self) -> Self::Layer;

    /// Merge the layer into a new immutable base snapshot and bump the
    /// version. Re-reading after commit yields the same merged view as
    /// reading base + layer before commit.
    fn commit_layer(&self, layer: Self::Layer);

    fn dependency_ref(&self) -> DependencyRef;
}

/// Type-erased open layer held by a transaction. Each producer enrolls a
/// holder that knows how to merge its own diff back on commit, so the
/// transaction can commit layers in submission order without knowing the
/// concrete producer types.
///
/// Commit is split in two: the fallible checks run in `prepare` for every
/// layer before any `publish` merges a diff into its base, so a rejected
/// transaction leaves all producers untouched instead of half-merged.
pub trait OpenLayer: Send {
    fn producer_id(&self) -> ProducerId;
    /// Validate the diff against the base. No state changes.
    fn prepare(&self) -> Result<()>;
    /// Merge the diff into the base and bump the version. Infallible;
    /// runs only after every layer in the transaction prepared.
    fn publish(self: Box<Self>);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
