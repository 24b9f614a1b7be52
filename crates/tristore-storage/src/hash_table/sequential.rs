use super::{can_fill_hole, BucketDescriptor, BucketPolicy, BucketStatus};
use crate::triple_list::TripleList;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{debug, warn};
use tristore_common::{Result, StoreError, TupleIndex};
use tristore_memory::{InputStream, MemoryManager, OutputStream};

const TAG: &str = "SequentialHashTable";

const BUCKET_SIZE: usize = std::mem::size_of::<u64>();

/// Single-writer open-addressing table.
///
/// Resizing happens eagerly in `acquire_bucket`, so a search never observes
/// a table above its load factor.
pub struct SequentialHashTable<P: BucketPolicy> {
    policy: P,
    memory_manager: Arc<MemoryManager>,
    load_factor: f64,
    buckets: Vec<u64>,
    mask: usize,
    used_buckets: usize,
    resize_threshold: usize,
    resize_failed: bool,
}

impl<P: BucketPolicy> SequentialHashTable<P> {
    pub fn new(memory_manager: Arc<MemoryManager>, policy: P, load_factor: f64) -> Self {
        Self {
            policy,
            memory_manager,
            load_factor,
            buckets: Vec::new(),
            mask: 0,
            used_buckets: 0,
            resize_threshold: 0,
            resize_failed: false,
        }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Empties the table and sizes it to `number_of_buckets` (a power of two).
    pub fn initialize(&mut self, number_of_buckets: usize) -> bool {
        if !number_of_buckets.is_power_of_two() {
            return false;
        }
        self.release();
        if !self
            .memory_manager
            .allocate(number_of_buckets * BUCKET_SIZE)
        {
            return false;
        }
        self.buckets = vec![0; number_of_buckets];
        self.mask = number_of_buckets - 1;
        self.used_buckets = 0;
        self.resize_threshold = (number_of_buckets as f64 * self.load_factor) as usize;
        self.resize_failed = false;
        true
    }

    fn release(&mut self) {
        self.memory_manager
            .deallocate(self.buckets.len() * BUCKET_SIZE);
        self.buckets = Vec::new();
    }

    pub fn number_of_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn number_of_used_buckets(&self) -> usize {
        self.used_buckets
    }

    pub fn resize_failed(&self) -> bool {
        self.resize_failed
    }

    /// Bytes held by the bucket array.
    pub fn size_in_bytes(&self) -> usize {
        self.buckets.len() * BUCKET_SIZE
    }

    /// Starts a search for `key`, growing the table first if it is too full.
    pub fn acquire_bucket<L: TripleList + ?Sized>(
        &mut self,
        list: &L,
        key: &P::Key,
    ) -> BucketDescriptor {
        if self.used_buckets > self.resize_threshold {
            self.handle_resize_needed(list);
        }
        BucketDescriptor::new(self.policy.hash_key(key))
    }

    /// Probes from the descriptor's position until the key or an empty
    /// bucket is found. Returns `NotContains` if the whole table was probed.
    pub fn continue_bucket_search<L: TripleList + ?Sized>(
        &self,
        list: &L,
        descriptor: &mut BucketDescriptor,
        key: &P::Key,
    ) -> BucketStatus {
        let start = descriptor
            .bucket
            .unwrap_or(descriptor.hash_code as usize & self.mask);
        let mut bucket = start;
        let mut status;
        loop {
            descriptor.contents = TupleIndex(self.buckets[bucket]);
            status = self.policy.bucket_status(list, descriptor.contents, key);
            if status != BucketStatus::NotContains {
                break;
            }
            bucket = (bucket + 1) & self.mask;
            if bucket == start {
                break;
            }
        }
        descriptor.bucket = Some(bucket);
        status
    }

    /// Looks `key` up without growing the table. Returns `INVALID` if absent.
    pub fn find<L: TripleList + ?Sized>(&self, list: &L, key: &P::Key) -> TupleIndex {
        if self.buckets.is_empty() {
            return TupleIndex::INVALID;
        }
        let mut descriptor = BucketDescriptor::new(self.policy.hash_key(key));
        match self.continue_bucket_search(list, &mut descriptor, key) {
            BucketStatus::Contains => descriptor.contents,
            _ => TupleIndex::INVALID,
        }
    }

    /// Stores `index` in the bucket the search stopped at.
    pub fn set_bucket_contents(&mut self, descriptor: &BucketDescriptor, index: TupleIndex) {
        if let Some(bucket) = descriptor.bucket {
            self.buckets[bucket] = index.0;
        }
    }

    /// Counts a bucket that went from empty to used.
    pub fn acknowledge_insert(&mut self, _descriptor: &BucketDescriptor) {
        self.used_buckets += 1;
    }

    /// Empties the bucket the search stopped at and shifts later entries of
    /// the same probe run back so that every entry stays reachable.
    pub fn delete_bucket<L: TripleList + ?Sized>(
        &mut self,
        list: &L,
        descriptor: &BucketDescriptor,
    ) {
        let Some(mut hole) = descriptor.bucket else {
            return;
        };
        self.buckets[hole] = 0;
        self.used_buckets -= 1;
        let mut scan = (hole + 1) & self.mask;
        loop {
            let contents = TupleIndex(self.buckets[scan]);
            if !contents.is_valid() {
                break;
            }
            let required = self.policy.hash_tuple(list, contents) as usize & self.mask;
            if can_fill_hole(hole, scan, required) {
                self.buckets[hole] = contents.0;
                self.buckets[scan] = 0;
                hole = scan;
            }
            scan = (scan + 1) & self.mask;
        }
    }

    fn handle_resize_needed<L: TripleList + ?Sized>(&mut self, list: &L) {
        if self.resize_failed {
            return;
        }
        let new_number_of_buckets = 2 * self.buckets.len();
        if !self
            .memory_manager
            .allocate(new_number_of_buckets * BUCKET_SIZE)
        {
            warn!(
                table = %self.policy.name(),
                buckets = self.buckets.len(),
                "hash table resize failed"
            );
            self.resize_failed = true;
            return;
        }
        debug!(
            table = %self.policy.name(),
            from = self.buckets.len(),
            to = new_number_of_buckets,
            "resizing sequential hash table"
        );
        let new_mask = new_number_of_buckets - 1;
        let mut new_buckets = vec![0u64; new_number_of_buckets];
        for &contents in self.buckets.iter().filter(|&&contents| contents != 0) {
            let mut bucket = self.policy.hash_tuple(list, TupleIndex(contents)) as usize & new_mask;
            while new_buckets[bucket] != 0 {
                bucket = (bucket + 1) & new_mask;
            }
            new_buckets[bucket] = contents;
        }
        self.release();
        self.buckets = new_buckets;
        self.mask = new_mask;
        self.resize_threshold = (new_number_of_buckets as f64 * self.load_factor) as usize;
    }

    pub fn save<W: Write>(&self, output: &mut OutputStream<W>) -> Result<()> {
        output.write_string(TAG)?;
        output.write_u64(self.buckets.len() as u64)?;
        output.write_u64(self.used_buckets as u64)?;
        output.write_u64(self.resize_threshold as u64)?;
        output.write_bool(self.resize_failed)?;
        output.write_region(self.buckets.iter().copied())
    }

    pub fn load<R: Read>(&mut self, input: &mut InputStream<R>) -> Result<()> {
        input.expect_tag(TAG)?;
        let number_of_buckets = input.read_u64()? as usize;
        let used_buckets = input.read_u64()? as usize;
        let resize_threshold = input.read_u64()? as usize;
        let resize_failed = input.read_bool()?;
        let buckets: Vec<u64> = input.read_region_vec()?;
        if !number_of_buckets.is_power_of_two() || buckets.len() != number_of_buckets {
            return Err(StoreError::invalid_format(
                TAG,
                format!(
                    "{} buckets declared, {} stored",
                    number_of_buckets,
                    buckets.len()
                ),
            ));
        }
        self.release();
        if !self.memory_manager.allocate(number_of_buckets * BUCKET_SIZE) {
            return Err(StoreError::OutOfMemory(format!(
                "cannot hold {} hash buckets",
                number_of_buckets
            )));
        }
        self.buckets = buckets;
        self.mask = number_of_buckets - 1;
        self.used_buckets = used_buckets;
        self.resize_threshold = resize_threshold;
        self.resize_failed = resize_failed;
        Ok(())
    }
}

impl<P: BucketPolicy> Drop for SequentialHashTable<P> {
    fn drop(&mut self) {
        self.release();
    }
}
