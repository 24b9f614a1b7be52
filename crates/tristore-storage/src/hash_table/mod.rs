//! Open-addressing hash tables whose buckets hold one `TupleIndex`.
//!
//! Keys are never stored in the table: a bucket points at a triple-list slot
//! and the bucket policy compares the slot's components against the lookup
//! key. Collisions are resolved by linear probing.
//!
//! - `SequentialHashTable`: single writer, `&mut self` mutation
//! - `ParallelHashTable`: lock-free inserts and lookups, cooperative resize

mod parallel;
mod sequential;

pub use parallel::{BucketGuard, ParallelHashTable};
pub use sequential::SequentialHashTable;

use crate::triple_list::TripleList;
use tristore_common::{ResourceComponent, ResourceId, Triple, TupleIndex};

/// Transient bucket value while a writer fills in a freshly claimed bucket.
pub const IN_INSERTION: TupleIndex = TupleIndex(u64::MAX);

/// Outcome of inspecting one bucket during a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketStatus {
    /// The bucket is free; the key is not in the table.
    Empty,
    /// The bucket points at a slot matching the key.
    Contains,
    /// The bucket belongs to another key.
    NotContains,
}

/// Mixes one value into a running hash.
#[inline(always)]
pub fn hash_mix(mut hash: u64, value: u64) -> u64 {
    hash = hash.wrapping_add(value);
    hash = hash.wrapping_add(hash << 10);
    hash ^ (hash >> 6)
}

/// Final avalanche step.
#[inline(always)]
pub fn hash_finish(mut hash: u64) -> u64 {
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash.wrapping_add(hash << 15)
}

/// Hashes a sequence of resource ids.
#[inline(always)]
pub fn hash_resource_ids(ids: &[ResourceId]) -> u64 {
    hash_finish(ids.iter().fold(0, |hash, id| hash_mix(hash, id.0)))
}

/// Interprets bucket contents for one kind of key.
pub trait BucketPolicy: Send + Sync {
    type Key: Copy + Send + Sync;

    /// Hash of a lookup key.
    fn hash_key(&self, key: &Self::Key) -> u64;

    /// Hash of the key stored in a slot; equals `hash_key` of that key.
    fn hash_tuple<L: TripleList + ?Sized>(&self, list: &L, index: TupleIndex) -> u64;

    /// Returns true if the slot's components equal the key.
    fn matches<L: TripleList + ?Sized>(&self, list: &L, index: TupleIndex, key: &Self::Key)
        -> bool;

    /// Name used in save tags and reports.
    fn name(&self) -> String;

    /// Classifies a bucket holding `contents` with respect to `key`.
    #[inline(always)]
    fn bucket_status<L: TripleList + ?Sized>(
        &self,
        list: &L,
        contents: TupleIndex,
        key: &Self::Key,
    ) -> BucketStatus {
        if !contents.is_valid() {
            BucketStatus::Empty
        } else if self.matches(list, contents, key) {
            BucketStatus::Contains
        } else {
            BucketStatus::NotContains
        }
    }
}

/// Keys a bucket by two components of a triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TwoKeysPolicy {
    pub component1: ResourceComponent,
    pub component2: ResourceComponent,
}

impl TwoKeysPolicy {
    pub fn new(component1: ResourceComponent, component2: ResourceComponent) -> Self {
        Self {
            component1,
            component2,
        }
    }
}

impl BucketPolicy for TwoKeysPolicy {
    type Key = (ResourceId, ResourceId);

    #[inline(always)]
    fn hash_key(&self, key: &Self::Key) -> u64 {
        hash_resource_ids(&[key.0, key.1])
    }

    #[inline(always)]
    fn hash_tuple<L: TripleList + ?Sized>(&self, list: &L, index: TupleIndex) -> u64 {
        hash_resource_ids(&[
            list.resource_id(index, self.component1),
            list.resource_id(index, self.component2),
        ])
    }

    #[inline(always)]
    fn matches<L: TripleList + ?Sized>(
        &self,
        list: &L,
        index: TupleIndex,
        key: &Self::Key,
    ) -> bool {
        list.resource_id(index, self.component1) == key.0
            && list.resource_id(index, self.component2) == key.1
    }

    fn name(&self) -> String {
        format!("{}.{}", self.component1, self.component2)
    }
}

/// Keys a bucket by the whole triple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreeKeysPolicy;

impl BucketPolicy for ThreeKeysPolicy {
    type Key = Triple;

    #[inline(always)]
    fn hash_key(&self, key: &Triple) -> u64 {
        hash_resource_ids(key)
    }

    #[inline(always)]
    fn hash_tuple<L: TripleList + ?Sized>(&self, list: &L, index: TupleIndex) -> u64 {
        hash_resource_ids(&list.resource_ids(index))
    }

    #[inline(always)]
    fn matches<L: TripleList + ?Sized>(&self, list: &L, index: TupleIndex, key: &Triple) -> bool {
        list.resource_ids(index) == *key
    }

    fn name(&self) -> String {
        "S.P.O".to_string()
    }
}

/// Position of a search in progress.
#[derive(Debug, Clone, Copy)]
pub struct BucketDescriptor {
    pub hash_code: u64,
    /// Bucket currently inspected; `None` until the search starts.
    bucket: Option<usize>,
    /// Contents of the bucket the search stopped at.
    pub contents: TupleIndex,
}

impl BucketDescriptor {
    pub(crate) fn new(hash_code: u64) -> Self {
        Self {
            hash_code,
            bucket: None,
            contents: TupleIndex::INVALID,
        }
    }

    /// Returns the bucket the search stopped at.
    pub fn bucket(&self) -> Option<usize> {
        self.bucket
    }
}

/// Returns true if `required` does not lie cyclically in `(hole, scan]`,
/// i.e. the entry at `scan` may move back into `hole`.
#[inline]
pub(crate) fn can_fill_hole(hole: usize, scan: usize, required: usize) -> bool {
    if hole <= scan {
        required <= hole || scan < required
    } else {
        required <= hole && scan < required
    }
}
