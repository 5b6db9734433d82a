use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use roaring::RoaringBitmap;
use tracing::{debug, info};
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::cache::formula_cache::{CacheStats, FormulaCache};
use crate::cache::payload::{Artifact, CachePayloadHeader, HistogramBucket};
use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::sequence::{SequenceKey, SequenceKind, SequenceRegistry};
use crate::core::types::{AttributeValue, Entity, EntityId};
use crate::formula::facet::{exclude_user_filter, request_impact, FacetCount};
use crate::formula::hash::{dependency_hash, observed_dependency_hash};
use crate::formula::node::Formula;
use crate::formula::resolve::resolve;
use crate::formula::translate::{translate, Constraint, IndexResolver};
use crate::storage::layout::StorageLayout;
use crate::storage::log::RecordKey;
use crate::storage::memtable::MemTable;
use crate::storage::{CompactionStats, SnapshotPin};
use crate::txn::bitmap::TransactionalBitmap;
use crate::txn::context::Txn;
use crate::txn::map::TransactionalMap;
use crate::txn::producer::{DependencyRef, TransactionalProducer};

const SEED_HISTOGRAM_KEY: u64 = 0x68c2_37f1_9a40_115d;
const SEED_FACET_KEY: u64 = 0x2b1e_8a06_d3c4_77e9;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct IndexKey {
    attribute: String,
    token: String,
}

/// Engine facade: owns the transactional producers, the formula cache
/// and the record store, and wires them into the insert/query cycle.
pub struct Catalog {
    name: String,
    config: Config,
    sequences: SequenceRegistry,
    memtable: MemTable,
    cache: FormulaCache,

    /// Every live primary key. Universe of NOT resolution.
    universe: TransactionalBitmap,
    entities: TransactionalMap<EntityId, Entity>,
    /// Posting bitmap per (attribute, token).
    indexes: RwLock<HashMap<IndexKey, TransactionalBitmap>>,

    /// Commits are serialized; readers never take this.
    commit_lock: Mutex<()>,
    /// Readers hold this shared while they snapshot producers; commit
    /// holds it exclusive while layers merge. A query therefore sees the
    /// whole pre-commit state or the whole post-commit state, never the
    /// universe updated with an index still behind.
    publish_lock: RwLock<()>,
}

impl Catalog {
    /// Open a catalog, replaying the record log and rebuilding the
    /// in-memory producers from the surviving entity records.
    pub fn open(name: impl Into<String>, config: Config) -> Result<Self> {
        let name = name.into();
        let layout = StorageLayout::new(config.storage_path.clone())?;
        let memtable = MemTable::open(layout, config.sync_on_flush)?;
        let cache = FormulaCache::new(config.cache_entries);
        let sequences = SequenceRegistry::new();

        let universe = TransactionalBitmap::new();
        let entities: TransactionalMap<EntityId, Entity> = TransactionalMap::new();
        let mut indexes: HashMap<IndexKey, TransactionalBitmap> = HashMap::new();

        let mut recovered = 0usize;
        let mut max_pk: u64 = 0;
        {
            let mut universe_writer = universe.bulk();
            let mut entity_writer = entities.bulk();
            for (_, payload) in memtable.scan_latest()? {
                if payload.is_empty() {
                    // Tombstone: the entity was removed.
                    continue;
                }
                let entity: Entity = bincode::deserialize(&payload)?;
                let pk = entity.id.value();
                max_pk = max_pk.max(u64::from(pk));
                universe_writer.insert(pk);
                for (attribute, value) in &entity.attributes {
                    let key = IndexKey {
                        attribute: attribute.clone(),
                        token: value.token(),
                    };
                    indexes
                        .entry(key)
                        .or_insert_with(TransactionalBitmap::new)
                        .bulk()
                        .insert(pk);
                }
                entity_writer.insert(entity.id, entity);
                recovered += 1;
            }
        }

        sequences.advance_to(
            &SequenceKey::new(name.as_str(), SequenceKind::Transaction),
            memtable.max_txn_id(),
        );
        sequences.advance_to(
            &SequenceKey::new(name.as_str(), SequenceKind::RecordVersion),
            memtable.max_version(),
        );
        sequences.advance_to(
            &SequenceKey::new(name.as_str(), SequenceKind::EntityPrimaryKey),
            max_pk,
        );

        info!(catalog = %name, recovered, "catalog opened");
        Ok(Catalog {
            name,
            config,
            sequences,
            memtable,
            cache,
            universe,
            entities,
            indexes: RwLock::new(indexes),
            commit_lock: Mutex::new(()),
            publish_lock: RwLock::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn begin(&self) -> Txn {
        let id = self
            .sequences
            .next(&SequenceKey::new(self.name.as_str(), SequenceKind::Transaction));
        Txn::begin(id)
    }

    /// Insert a new entity through a transaction: allocates its primary
    /// key, updates the universe, entity map and attribute indexes in
    /// the transaction's layer, and journals the body to the record
    /// store. Invisible outside the transaction until commit.
    pub fn insert_entity(
        &self,
        txn: &mut Txn,
        entity_type: &str,
        attributes: Vec<(String, AttributeValue)>,
    ) -> Result<EntityId> {
        txn.ensure_active()?;
        // Primary keys are catalog-wide: every entity type shares the
        // universe bitmap, so per-type counters would collide.
        let pk = self
            .sequences
            .next(&SequenceKey::new(self.name.as_str(), SequenceKind::EntityPrimaryKey));
        let pk = u32::try_from(pk).map_err(|_| {
            Error::new(
                ErrorKind::InvalidState,
                format!("primary key space for '{}' is exhausted", entity_type),
            )
        })?;
        let id = EntityId::new(pk);

        let mut entity = Entity::new(id, entity_type);
        for (attribute, value) in attributes {
            entity.add_attribute(attribute, value);
        }

        self.universe.insert(txn, pk)?;
        for (attribute, value) in &entity.attributes {
            self.index_bitmap(attribute, &value.token()).insert(txn, pk)?;
        }
        self.entities.insert(txn, id, entity.clone())?;
        self.journal(txn.id, id, bincode::serialize(&entity)?)?;

        debug!(catalog = %self.name, id = pk, entity_type, "entity inserted");
        Ok(id)
    }

    /// Remove an entity through a transaction. Unknown ids report
    /// `NotFound`; journals a tombstone so the removal survives restart.
    pub fn remove_entity(&self, txn: &mut Txn, id: EntityId) -> Result<()> {
        txn.ensure_active()?;
        let entity = self.entities.get(Some(txn), &id).ok_or_else(|| {
            Error::new(
                ErrorKind::NotFound,
                format!("no entity with id {}", id.value()),
            )
        })?;

        self.universe.remove(txn, id.value())?;
        for (attribute, value) in &entity.attributes {
            if let Some(bitmap) = self.lookup_index(attribute, &value.token()) {
                bitmap.remove(txn, id.value())?;
            }
        }
        self.entities.remove(txn, &id)?;
        self.journal(txn.id, id, Vec::new())?;
        Ok(())
    }

    /// Commit a transaction: the journaled records are flushed first so
    /// nothing becomes visible that could not be recovered, then the
    /// open layers merge into the shared base state.
    pub fn commit(&self, txn: Txn) -> Result<()> {
        let _guard = self.commit_lock.lock();
        let txn_id = txn.id;
        self.memtable.flush(txn_id)?;
        {
            // No reader runs while the layers merge, so the producers
            // move to the post-commit state as one unit.
            let _publish = self.publish_lock.write();
            txn.commit()?;
        }
        debug!(catalog = %self.name, txn_id, "transaction committed");
        Ok(())
    }

    /// Discard a transaction: open layers and provisional records both.
    pub fn rollback(&self, txn: Txn) {
        let txn_id = txn.id;
        txn.rollback();
        self.memtable.rollback(txn_id);
        debug!(catalog = %self.name, txn_id, "transaction rolled back");
    }

    pub fn entity(&self, txn: Option<&Txn>, id: EntityId) -> Option<Entity> {
        let _gate = self.publish_lock.read();
        self.entities.get(txn, &id)
    }

    /// Read an entity body straight from the record store, pinning the
    /// directory so compaction cannot pull the version out from under
    /// the read. Surfaces `RecordNotYetWritten` for journaled but
    /// unflushed entities.
    pub fn entity_record(&self, id: EntityId) -> Result<Entity> {
        let _pin: SnapshotPin = self.memtable.pin_snapshot();
        let payload = self.memtable.read(&self.record_key(id))?;
        if payload.is_empty() {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("entity {} was removed", id.value()),
            ));
        }
        Ok(bincode::deserialize(&payload)?)
    }

    pub fn entity_count(&self, txn: Option<&Txn>) -> u64 {
        let _gate = self.publish_lock.read();
        self.universe.len(txn)
    }

    /// Evaluate a constraint to the matching primary-key set.
    ///
    /// Committed-state queries go through the memoization cache; a
    /// query inside a transaction with open layers sees the overlay but
    /// bypasses the cache, since uncommitted state must never produce a
    /// shared artifact.
    pub fn query(&self, txn: Option<&Txn>, constraint: &Constraint) -> Result<Arc<RoaringBitmap>> {
        let _gate = self.publish_lock.read();
        let resolved = self.build(txn, constraint)?;

        if txn.map_or(false, Txn::has_layers) {
            return resolved.compute();
        }

        let structural = resolved.structural_hash();
        let deps = resolved.dependencies();
        if let Some(hit) = self.cache.lookup(structural, dependency_hash(&deps)) {
            if let Some(bitmap) = hit.artifact.as_bitmap() {
                return Ok(Arc::clone(bitmap));
            }
        }

        let result = resolved.compute()?;
        // Stored under the versions the leaf snapshots were taken at, not
        // the live ones, so a commit racing this query cannot label an
        // older result as current.
        self.cache.store(CachePayloadHeader::new(
            structural,
            observed_dependency_hash(&deps),
            deps.iter().map(DependencyRef::id).collect(),
            Artifact::Bitmap(Arc::clone(&result)),
        ));
        Ok(result)
    }

    /// How many results remain if `option` were toggled on inside the
    /// facet group `marker`, given the current `constraint`.
    pub fn facet_impact(
        &self,
        txn: Option<&Txn>,
        constraint: &Constraint,
        marker: &str,
        option: &Constraint,
    ) -> Result<u64> {
        let _gate = self.publish_lock.read();
        let base = self.build(txn, constraint)?;
        let resolver = CatalogResolver { catalog: self, txn };
        let option = translate(option, &resolver)?;
        let option = resolve(&option, Some(&self.universe_leaf(txn)))?;
        request_impact(&base, marker, option)
    }

    /// Per-option match counts for a facet group, computed against the
    /// result set with the group's own branch excluded. Cached as a
    /// facet-summary artifact.
    pub fn facet_counts(
        &self,
        txn: Option<&Txn>,
        constraint: &Constraint,
        marker: &str,
        attribute: &str,
        options: &[String],
    ) -> Result<Vec<FacetCount>> {
        let _gate = self.publish_lock.read();
        let resolved = self.build(txn, constraint)?;
        let baseline = exclude_user_filter(&resolved, marker);

        let cached = txn.map_or(true, |t| !t.has_layers());
        let structural = derived_key(
            baseline.structural_hash(),
            SEED_FACET_KEY,
            attribute,
            options,
        );

        // The counts read the option postings on top of the formula's own
        // leaves, and a first-ever posting for an option only exists after
        // the universe moved; all of them key the invalidation.
        let mut deps = baseline.dependencies();
        deps.push(self.universe.dependency_ref());
        let mut postings = Vec::with_capacity(options.len());
        for option in options {
            let bitmap = self.lookup_index(attribute, option);
            if let Some(bitmap) = &bitmap {
                deps.push(bitmap.dependency_ref());
            }
            postings.push(bitmap);
        }
        deps.sort_by_key(|dep| dep.id());
        deps.dedup_by_key(|dep| dep.id());

        if cached {
            if let Some(hit) = self.cache.lookup(structural, dependency_hash(&deps)) {
                if let Some(summary) = hit.artifact.as_facet_summary() {
                    return Ok(summary.to_vec());
                }
            }
        }

        let base_set = baseline.compute()?;
        let mut counts = Vec::with_capacity(options.len());
        for (option, posting) in options.iter().zip(&postings) {
            let count = match posting {
                Some(bitmap) => base_set.intersection_len(&bitmap.snapshot(txn)),
                None => 0,
            };
            counts.push(FacetCount {
                label: option.clone(),
                count,
            });
        }

        if cached {
            self.cache.store(CachePayloadHeader::new(
                structural,
                observed_dependency_hash(&deps),
                deps.iter().map(DependencyRef::id).collect(),
                Artifact::FacetSummary(counts.clone()),
            ));
        }
        Ok(counts)
    }

    /// Bucketed distribution of a numeric attribute over the result
    /// set. Cached as a histogram artifact; empty buckets are omitted.
    pub fn histogram(
        &self,
        txn: Option<&Txn>,
        constraint: &Constraint,
        attribute: &str,
        bucket_width: f64,
    ) -> Result<Vec<HistogramBucket>> {
        if !(bucket_width > 0.0) {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("bucket width must be positive, got {}", bucket_width),
            ));
        }
        let _gate = self.publish_lock.read();
        let resolved = self.build(txn, constraint)?;

        let cached = txn.map_or(true, |t| !t.has_layers());
        let structural = derived_key(
            resolved.structural_hash(),
            SEED_HISTOGRAM_KEY ^ bucket_width.to_bits(),
            attribute,
            &[],
        );

        // The bucket values come out of the entity map, so it keys the
        // invalidation alongside the formula's own leaves.
        let mut deps = resolved.dependencies();
        deps.push(self.entities.dependency_ref());
        deps.sort_by_key(|dep| dep.id());
        deps.dedup_by_key(|dep| dep.id());

        if cached {
            if let Some(hit) = self.cache.lookup(structural, dependency_hash(&deps)) {
                if let Some(buckets) = hit.artifact.as_histogram() {
                    return Ok(buckets.to_vec());
                }
            }
        }

        let result = resolved.compute()?;
        let mut buckets: HashMap<i64, u64> = HashMap::new();
        for pk in result.iter() {
            let value = self
                .entities
                .get(txn, &EntityId::new(pk))
                .and_then(|entity| entity.get_attribute(attribute).and_then(AttributeValue::as_number));
            if let Some(value) = value {
                let slot = (value / bucket_width).floor() as i64;
                *buckets.entry(slot).or_insert(0) += 1;
            }
        }
        let mut buckets: Vec<HistogramBucket> = buckets
            .into_iter()
            .map(|(slot, count)| HistogramBucket {
                lower: slot as f64 * bucket_width,
                count,
            })
            .collect();
        buckets.sort_by(|a, b| a.lower.total_cmp(&b.lower));

        if cached {
            self.cache.store(CachePayloadHeader::new(
                structural,
                observed_dependency_hash(&deps),
                deps.iter().map(DependencyRef::id).collect(),
                Artifact::Histogram(buckets.clone()),
            ));
        }
        Ok(buckets)
    }

    /// Vacuum the record log, honoring open snapshot pins.
    pub fn compact(&self) -> Result<Option<CompactionStats>> {
        self.memtable.compact(self.config.compaction_min_superseded)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn build(&self, txn: Option<&Txn>, constraint: &Constraint) -> Result<Arc<Formula>> {
        let resolver = CatalogResolver { catalog: self, txn };
        let formula = translate(constraint, &resolver)?;
        resolve(&formula, Some(&self.universe_leaf(txn)))
    }

    fn universe_leaf(&self, txn: Option<&Txn>) -> Arc<Formula> {
        // Reference before snapshot: the observed version must never be
        // ahead of the data the leaf carries.
        let dep = self.universe.dependency_ref();
        Formula::leaf_with_dep(self.universe.snapshot(txn), dep)
    }

    fn record_key(&self, id: EntityId) -> RecordKey {
        RecordKey::new(format!("entity/{}", id.value()))
    }

    fn journal(&self, txn_id: u64, id: EntityId, payload: Vec<u8>) -> Result<()> {
        let version = self
            .sequences
            .next(&SequenceKey::new(self.name.as_str(), SequenceKind::RecordVersion));
        self.memtable
            .write(txn_id, self.record_key(id), version, payload)?;
        Ok(())
    }

    fn index_bitmap(&self, attribute: &str, token: &str) -> TransactionalBitmap {
        let key = IndexKey {
            attribute: attribute.to_string(),
            token: token.to_string(),
        };
        if let Some(existing) = self.indexes.read().get(&key) {
            return existing.clone();
        }
        self.indexes
            .write()
            .entry(key)
            .or_insert_with(TransactionalBitmap::new)
            .clone()
    }

    fn lookup_index(&self, attribute: &str, token: &str) -> Option<TransactionalBitmap> {
        self.indexes
            .read()
            .get(&IndexKey {
                attribute: attribute.to_string(),
                token: token.to_string(),
            })
            .cloned()
    }
}

/// Cache key for derived artifacts (histograms, facet summaries): the
/// formula's structural hash alone would collide with the plain bitmap
/// artifact of the same formula, so the artifact parameters are mixed
/// in under their own seed.
fn derived_key(structural: u64, seed: u64, attribute: &str, options: &[String]) -> u64 {
    let mut bytes = Vec::with_capacity(8 + attribute.len() + options.len() * 8);
    bytes.extend_from_slice(&structural.to_le_bytes());
    bytes.extend_from_slice(attribute.as_bytes());
    for option in options {
        bytes.push(0);
        bytes.extend_from_slice(option.as_bytes());
    }
    xxh3_64_with_seed(&bytes, seed)
}

struct CatalogResolver<'a> {
    catalog: &'a Catalog,
    txn: Option<&'a Txn>,
}

impl IndexResolver for CatalogResolver<'_> {
    fn attribute_bitmap(
        &self,
        attribute: &str,
        token: &str,
    ) -> Option<(Arc<RoaringBitmap>, DependencyRef)> {
        self.catalog.lookup_index(attribute, token).map(|bitmap| {
            let dep = bitmap.dependency_ref();
            (bitmap.snapshot(self.txn), dep)
        })
    }

    fn universe(&self) -> (Arc<RoaringBitmap>, DependencyRef) {
        let dep = self.catalog.universe.dependency_ref();
        (self.catalog.universe.snapshot(self.txn), dep)
    }
}
