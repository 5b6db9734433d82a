pub mod cache;
pub mod catalog;
pub mod core;
pub mod formula;
pub mod storage;
pub mod txn;

/*
┌──────────────────────────────────────────────────────────────────────────────┐
│                          CARDEX STRUCT ARCHITECTURE                          │
└──────────────────────────────────────────────────────────────────────────────┘

┌────────────────────────────────── FACADE ────────────────────────────────────┐
│                                                                              │
│  ┌────────────────────────────────────────────────────────────────────────┐  │
│  │                             struct Catalog                             │  │
│  │  ┌──────────────────────────────────────────────────────────────────┐  │  │
│  │  │ config: Config                       // Engine configuration     │  │  │
│  │  │ sequences: SequenceRegistry          // Monotonic id counters    │  │  │
│  │  │ memtable: MemTable                   // Durable record store     │  │  │
│  │  │ cache: FormulaCache                  // Result memoization       │  │  │
│  │  │ universe: TransactionalBitmap        // All live primary keys    │  │  │
│  │  │ entities: TransactionalMap<Id, _>    // Entity bodies            │  │  │
│  │  │ indexes: HashMap<(attr, token), TransactionalBitmap>             │  │  │
│  │  │ commit_lock: Mutex<()>               // Single committer         │  │  │
│  │  └──────────────────────────────────────────────────────────────────┘  │  │
│  └────────────────────────────────────────────────────────────────────────┘  │
└──────────────────────────────────────────────────────────────────────────────┘

┌─────────────────────────────── TRANSACTION LAYER ────────────────────────────┐
│                                                                              │
│  ┌──────────────────────────┐   ┌─────────────────────────────────────────┐  │
│  │ struct Txn               │   │ producers (shared, copy-on-write base)  │  │
│  │ • id: u64                │   │ • TransactionalBitmap                   │  │
│  │ • state: TxnState        │   │ • TransactionalFlag                     │  │
│  │ • layers: per-producer   │──▶│ • TransactionalMap<K, V>                │  │
│  │   open overlay, merged   │   │ each carries ProducerId + AtomicU64     │  │
│  │   on commit in order     │   │ version feeding dependency hashes       │  │
│  └──────────────────────────┘   └─────────────────────────────────────────┘  │
└──────────────────────────────────────────────────────────────────────────────┘

┌─────────────────────────── FORMULA ALGEBRA + CACHE ──────────────────────────┐
│                                                                              │
│  Constraint ──translate──▶ Formula tree ──resolve──▶ no deferred NOTs        │
│    enum Formula: Empty | Leaf | And | Or | Not | DeferredNot | UserFilter    │
│    compute(): RoaringBitmap set algebra, AND cheapest-first                  │
│    structural_hash() ‖ dependency_hash() ──▶ CacheKey (128 bits)             │
│                                                                              │
│  ┌───────────────────────────────┐  ┌─────────────────────────────────────┐  │
│  │ struct FormulaCache           │  │ enum Artifact                       │  │
│  │ • LruCache<CacheKey, header>  │  │ • Bitmap(Arc<RoaringBitmap>)        │  │
│  │ • hit/miss counters           │  │ • Histogram(Vec<HistogramBucket>)   │  │
│  │ • sweep(live hashes)          │  │ • FacetSummary(Vec<FacetCount>)     │  │
│  └───────────────────────────────┘  └─────────────────────────────────────┘  │
└──────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────── STORAGE LAYER ───────────────────────────────┐
│                                                                              │
│  ┌──────────────────────────────┐  ┌──────────────────────────────────────┐  │
│  │ struct MemTable              │  │ struct RecordLog                     │  │
│  │ • directory: key ─▶ versions │  │ • frames: len | bincode | crc32      │  │
│  │ • provisional until flush    │──▶ • LogEntry::Record / ::Flush         │  │
│  │ • snapshot pins              │  │ • replay tolerates torn tails        │  │
│  │ • compact() ─▶ new generation│  │                                      │  │
│  └──────────────────────────────┘  └──────────────────────────────────────┘  │
└──────────────────────────────────────────────────────────────────────────────┘

Write path:  insert_entity ─▶ txn layer + journal ─▶ commit: flush then merge
Read path:   query ─▶ translate ─▶ resolve ─▶ cache lookup ─▶ compute ─▶ store
*/

pub use crate::catalog::Catalog;
pub use crate::core::config::Config;
pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::core::types::{AttributeValue, Entity, EntityId};
pub use crate::formula::translate::Constraint;
pub use crate::txn::context::{Txn, TxnState};
