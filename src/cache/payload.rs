use std::sync::Arc;
use chrono::{DateTime, Utc};
use roaring::RoaringBitmap;
use crate::formula::facet::FacetCount;
use crate::txn::producer::ProducerId;

/// 128-bit cache identity: structural hash of the formula subtree and
/// hash of the current versions of every producer it read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub structural: u64,
    pub dependency: u64,
}

/// One bucket of a numeric histogram over the result set.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramBucket {
    pub lower: f64,
    pub count: u64,
}

/// Computed artifact kept by the cache. Consumers (histogram cache,
/// facet-summary cache) wrap this core with their own domain types.
#[derive(Debug, Clone)]
pub enum Artifact {
    Bitmap(Arc<RoaringBitmap>),
    Histogram(Vec<HistogramBucket>),
    FacetSummary(Vec<FacetCount>),
}

impl Artifact {
    pub fn as_bitmap(&self) -> Option<&Arc<RoaringBitmap>> {
        match self {
            Artifact::Bitmap(bitmap) => Some(bitmap),
            _ => None,
        }
    }

    pub fn as_facet_summary(&self) -> Option<&[FacetCount]> {
        match self {
            Artifact::FacetSummary(counts) => Some(counts),
            _ => None,
        }
    }

    pub fn as_histogram(&self) -> Option<&[HistogramBucket]> {
        match self {
            Artifact::Histogram(buckets) => Some(buckets),
            _ => None,
        }
    }
}

/// Cached unit: both hashes, the producers the artifact was computed
/// from, and the artifact itself. Two headers with equal hashes always
/// carry equal artifacts; a header whose producers have since mutated is
/// stale, and stale headers never match a live lookup because the live
/// dependency hash has moved on.
#[derive(Debug, Clone)]
pub struct CachePayloadHeader {
    pub record_hash: u64,
    pub dependency_hash: u64,
    pub dependency_ids: Vec<ProducerId>,
    pub artifact: Artifact,
    pub created_at: DateTime<Utc>,
}

impl CachePayloadHeader {
    pub fn new(
        record_hash: u64,
        dependency_hash: u64,
        dependency_ids: Vec<ProducerId>,
        artifact: Artifact,
    ) -> Self {
        CachePayloadHeader {
            record_hash,
            dependency_hash,
            dependency_ids,
            artifact,
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> CacheKey {
        CacheKey {
            structural: self.record_hash,
            dependency: self.dependency_hash,
        }
    }
}
