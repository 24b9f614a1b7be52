use crate::hash_table::{BucketGuard, BucketStatus, ParallelHashTable, ThreeKeysPolicy};
use crate::triple_list::{ConcurrentTripleList, TripleList};
use std::io::{Read, Write};
use std::sync::Arc;
use tristore_common::{ComponentStatistics, Result, StoreConfig, Triple, TupleIndex, TupleStatus};
use tristore_memory::{
    InputStream, MemoryManager, OutputStream, ThreadContext, ThreadContextRegistry,
};

const TAG: &str = "ThreeKeysManager";

const BUCKET_SIZE: usize = 8;

/// Reservation of the hash-table bucket for one triple.
///
/// Holds the table's shared section; dropping the token releases it. A
/// token for a new triple owns a bucket marked in-insertion, which must be
/// resolved with `update_on_insert` or `abort_insert_token` before release.
pub struct InsertToken<'a> {
    guard: BucketGuard<'a, ThreeKeysPolicy>,
    already_exists: bool,
}

impl InsertToken<'_> {
    /// Returns true if the triple was already stored.
    pub fn already_exists(&self) -> bool {
        self.already_exists
    }

    /// Slot of the stored triple when `already_exists` is true.
    pub fn existing_index(&self) -> TupleIndex {
        if self.already_exists {
            self.guard.contents()
        } else {
            TupleIndex::INVALID
        }
    }
}

/// Maps every stored triple to its slot.
pub struct ThreeKeysManager {
    index: ParallelHashTable<ThreeKeysPolicy>,
}

impl ThreeKeysManager {
    pub fn new(
        memory_manager: Arc<MemoryManager>,
        registry: &ThreadContextRegistry,
        config: &StoreConfig,
    ) -> Result<Self> {
        Ok(Self {
            index: ParallelHashTable::new(
                memory_manager,
                registry,
                ThreeKeysPolicy,
                config.hash_table_load_factor,
                config.number_of_threads,
            )?,
        })
    }

    pub fn initialize(&mut self, number_of_buckets: usize) -> bool {
        self.index.initialize(number_of_buckets)
    }

    pub fn set_number_of_threads(&mut self, number_of_threads: usize) {
        self.index.set_number_of_threads(number_of_threads);
    }

    /// Finds the triple's bucket, claiming it if the triple is new.
    ///
    /// Returns `None` if the table is full and cannot grow.
    pub fn get_insert_token<'a>(
        &'a self,
        context: &'a ThreadContext,
        list: &ConcurrentTripleList,
        triple: &Triple,
    ) -> Option<InsertToken<'a>> {
        let mut guard = self.index.acquire_bucket(context, triple);
        loop {
            match guard.continue_search(list, triple) {
                BucketStatus::Empty => {
                    if guard.start_insertion_conditional() {
                        return Some(InsertToken {
                            guard,
                            already_exists: false,
                        });
                    }
                }
                BucketStatus::Contains => {
                    return Some(InsertToken {
                        guard,
                        already_exists: true,
                    })
                }
                BucketStatus::NotContains => return None,
            }
        }
    }

    /// Frees a claimed bucket after the triple could not be stored.
    pub fn abort_insert_token(&self, token: &mut InsertToken<'_>) {
        if !token.already_exists {
            token.guard.set_contents(TupleIndex::INVALID);
        }
    }

    /// Publishes the slot of a new triple in the claimed bucket.
    pub fn update_on_insert(&self, token: &mut InsertToken<'_>, index: TupleIndex) {
        debug_assert!(!token.already_exists);
        token.guard.set_contents(index);
        token.guard.acknowledge_insert();
    }

    pub fn release_insert_token(&self, token: InsertToken<'_>) {
        drop(token);
    }

    /// Stores `index` for its triple unless the triple is already present.
    ///
    /// Returns whether `index` was stored together with the slot the table
    /// now maps the triple to, or `None` if the table is full.
    pub fn insert_triple(
        &self,
        context: &ThreadContext,
        list: &ConcurrentTripleList,
        index: TupleIndex,
    ) -> Option<(bool, TupleIndex)> {
        let triple = list.resource_ids(index);
        let mut guard = self.index.acquire_bucket(context, &triple);
        loop {
            match guard.continue_search(list, &triple) {
                BucketStatus::Empty => {
                    if guard.start_insertion_conditional() {
                        guard.set_contents(index);
                        guard.acknowledge_insert();
                        return Some((true, index));
                    }
                }
                BucketStatus::Contains => return Some((false, guard.contents())),
                BucketStatus::NotContains => return None,
            }
        }
    }

    fn lookup(
        &self,
        context: &ThreadContext,
        list: &ConcurrentTripleList,
        triple: &Triple,
    ) -> TupleIndex {
        let mut guard = self.index.acquire_bucket(context, triple);
        match guard.continue_search(list, triple) {
            BucketStatus::Contains => guard.contents(),
            _ => TupleIndex::INVALID,
        }
    }

    /// Returns the triple's slot if it is stored and complete.
    pub fn get_triple_index(
        &self,
        context: &ThreadContext,
        list: &ConcurrentTripleList,
        triple: &Triple,
    ) -> TupleIndex {
        let index = self.lookup(context, list, triple);
        if index.is_valid() && list.triple_status(index).is_complete() {
            index
        } else {
            TupleIndex::INVALID
        }
    }

    pub fn contains(
        &self,
        context: &ThreadContext,
        list: &ConcurrentTripleList,
        triple: &Triple,
        mask: TupleStatus,
        expected: TupleStatus,
    ) -> bool {
        let index = self.lookup(context, list, triple);
        index.is_valid() && list.triple_status(index).matches(mask, expected)
    }

    /// 1 if the triple holds as a derived, unmerged fact; 0 otherwise.
    pub fn count_estimate(
        &self,
        context: &ThreadContext,
        list: &ConcurrentTripleList,
        triple: &Triple,
    ) -> usize {
        usize::from(self.contains(
            context,
            list,
            triple,
            TupleStatus::IDB | TupleStatus::IDB_MERGED,
            TupleStatus::IDB,
        ))
    }

    pub fn save<W: Write>(&mut self, output: &mut OutputStream<W>) -> Result<()> {
        output.write_string(TAG)?;
        self.index.save(output)
    }

    pub fn load<R: Read>(&mut self, input: &mut InputStream<R>) -> Result<()> {
        input.expect_tag(TAG)?;
        self.index.load(input)
    }

    pub fn component_statistics(&self, list: &ConcurrentTripleList) -> ComponentStatistics {
        let number_of_buckets = self.index.number_of_buckets();
        let used_buckets = self.index.number_of_used_buckets();
        let size = (number_of_buckets * BUCKET_SIZE) as u64;
        let mut statistics = ComponentStatistics::new(TAG);
        statistics.add_integer_item("Size", size);
        statistics.add_integer_item("Total number of buckets", number_of_buckets as u64);
        statistics.add_integer_item("Number of used buckets", used_buckets as u64);
        if used_buckets != 0 {
            statistics.add_float_item("Bytes per used bucket", size as f64 / used_buckets as f64);
        }
        if number_of_buckets != 0 {
            statistics.add_float_item(
                "Load factor (%)",
                used_buckets as f64 * 100.0 / number_of_buckets as f64,
            );
        }
        let triple_count = list.exact_triple_count(TupleStatus::COMPLETE, TupleStatus::COMPLETE);
        if triple_count != 0 {
            statistics.add_float_item("Bytes per triple", size as f64 / triple_count as f64);
        }
        statistics
    }
}
