use super::{manager_name, ChainScan, ChainStart};
use crate::hash_table::{BucketStatus, ParallelHashTable, TwoKeysPolicy};
use crate::one_key_index::OneKeyIndex;
use crate::triple_list::{ConcurrentTripleList, TripleList};
use std::io::{Read, Write};
use std::sync::Arc;
use tristore_common::{
    ComponentStatistics, ResourceComponent, Result, StoreConfig, Triple, TupleIndex, TupleStatus,
};
use tristore_memory::{
    InputStream, MemoryManager, OutputStream, ThreadContext, ThreadContextRegistry,
};

const KIND: &str = "TwoKeysManagerGroupByTwo";

const BUCKET_SIZE: usize = 8;

/// Indexes triples by C1 and by (C1, C2) through the C1 next pointers.
///
/// The C1 chain of a resource is a sequence of groups, one per C2 value.
/// A new group is pushed onto the chain head; a later triple of an existing
/// group is linked right after the group's first slot. The two-keys hash
/// table maps (C1, C2) to that first slot.
pub struct TwoKeysManagerGroupByTwo {
    component1: ResourceComponent,
    component2: ResourceComponent,
    component3: ResourceComponent,
    one_key_index: OneKeyIndex,
    two_keys_index: ParallelHashTable<TwoKeysPolicy>,
}

impl TwoKeysManagerGroupByTwo {
    pub fn new(
        memory_manager: Arc<MemoryManager>,
        registry: &ThreadContextRegistry,
        config: &StoreConfig,
        components: [ResourceComponent; 3],
    ) -> Result<Self> {
        let [component1, component2, component3] = components;
        Ok(Self {
            component1,
            component2,
            component3,
            one_key_index: OneKeyIndex::new(Arc::clone(&memory_manager), config.max_resource_id),
            two_keys_index: ParallelHashTable::new(
                memory_manager,
                registry,
                TwoKeysPolicy::new(component1, component2),
                config.hash_table_load_factor,
                config.number_of_threads,
            )?,
        })
    }

    pub fn name(&self) -> String {
        manager_name(KIND, self.component1, self.component2)
    }

    pub fn components(&self) -> [ResourceComponent; 3] {
        [self.component1, self.component2, self.component3]
    }

    pub fn initialize(&mut self, number_of_buckets: usize, initial_resources: usize) -> bool {
        self.one_key_index
            .initialize(if initial_resources == 0 { 0 } else { initial_resources + 1 })
            && self.two_keys_index.initialize(number_of_buckets)
    }

    pub fn set_number_of_threads(&mut self, number_of_threads: usize) {
        self.two_keys_index.set_number_of_threads(number_of_threads);
    }

    /// Makes the triple's C1 value addressable ahead of `insert_triple`.
    pub fn reserve_resource(&self, triple: &Triple) -> bool {
        self.one_key_index
            .extend_to_resource_id(self.component1.of(triple))
    }

    /// Returns true once the (C1, C2) table failed to grow; no new group
    /// can be linked after that.
    pub fn is_full(&self) -> bool {
        self.two_keys_index.resize_failed()
    }

    /// Links the slot into its C1 chain. Returns false if memory ran out.
    pub fn insert_triple(
        &self,
        context: &ThreadContext,
        list: &ConcurrentTripleList,
        index: TupleIndex,
        triple: &Triple,
    ) -> bool {
        let value1 = self.component1.of(triple);
        let key = (value1, self.component2.of(triple));
        if !self.one_key_index.extend_to_resource_id(value1) {
            return false;
        }
        let mut guard = self.two_keys_index.acquire_bucket(context, &key);
        let status = loop {
            let status = guard.continue_search(list, &key);
            if status != BucketStatus::Empty || guard.start_insertion_conditional() {
                break status;
            }
        };
        match status {
            BucketStatus::Empty => {
                loop {
                    let head = self.one_key_index.head(value1);
                    list.set_next(index, self.component1, head);
                    if self.one_key_index.set_head_conditional(value1, head, index) {
                        break;
                    }
                }
                guard.set_contents(index);
                guard.acknowledge_insert();
            }
            BucketStatus::Contains => {
                let group_head = guard.contents();
                loop {
                    let after_head = list.next(group_head, self.component1);
                    list.set_next(index, self.component1, after_head);
                    if list.set_next_conditional(group_head, self.component1, after_head, index) {
                        break;
                    }
                }
            }
            BucketStatus::NotContains => return false,
        }
        drop(guard);
        self.one_key_index.increment_triple_count(value1, 1);
        true
    }

    fn group_head(
        &self,
        context: &ThreadContext,
        list: &ConcurrentTripleList,
        triple: &Triple,
    ) -> TupleIndex {
        let key = (self.component1.of(triple), self.component2.of(triple));
        let mut guard = self.two_keys_index.acquire_bucket(context, &key);
        match guard.continue_search(list, &key) {
            BucketStatus::Contains => guard.contents(),
            _ => TupleIndex::INVALID,
        }
    }

    /// Chain of all triples with the pattern's C1 value.
    pub fn first_triple_index_1(&self, triple: &Triple) -> ChainStart {
        ChainStart::unfiltered(
            self.one_key_index.head(self.component1.of(triple)),
            self.component1,
        )
    }

    /// Group of triples with the pattern's C1 and C2 values.
    pub fn first_triple_index_12(
        &self,
        context: &ThreadContext,
        list: &ConcurrentTripleList,
        triple: &Triple,
    ) -> ChainStart {
        ChainStart::filtered(
            self.group_head(context, list, triple),
            self.component1,
            self.component2,
            self.component2.of(triple),
            ChainScan::Grouped,
        )
    }

    /// C1 chain filtered on the pattern's C3 value.
    pub fn first_triple_index_13(&self, triple: &Triple) -> ChainStart {
        ChainStart::filtered(
            self.one_key_index.head(self.component1.of(triple)),
            self.component1,
            self.component3,
            self.component3.of(triple),
            ChainScan::Filtered,
        )
    }

    pub fn count_estimate_1(&self, triple: &Triple) -> usize {
        self.one_key_index.triple_count(self.component1.of(triple))
    }

    /// Walks the (C1, C2) group and counts its slots.
    pub fn count_estimate_12(
        &self,
        context: &ThreadContext,
        list: &ConcurrentTripleList,
        triple: &Triple,
    ) -> usize {
        let value1 = self.component1.of(triple);
        let value2 = self.component2.of(triple);
        let mut count = 0;
        let mut index = self.group_head(context, list, triple);
        while index.is_valid()
            && list.resource_id(index, self.component1) == value1
            && list.resource_id(index, self.component2) == value2
        {
            count += 1;
            index = list.next(index, self.component1);
        }
        count
    }

    pub fn count_estimate_13(&self, triple: &Triple) -> usize {
        self.count_estimate_1(triple)
    }

    pub fn start_updating_statistics(&self) {
        self.one_key_index.clear_counts();
    }

    pub fn update_statistics_for(&self, triple: &Triple) {
        let value1 = self.component1.of(triple);
        if self.one_key_index.extend_to_resource_id(value1) {
            self.one_key_index.increment_triple_count(value1, 1);
        }
    }

    pub fn save<W: Write>(&mut self, output: &mut OutputStream<W>) -> Result<()> {
        output.write_string(&self.name())?;
        self.one_key_index.save(output)?;
        self.two_keys_index.save(output)
    }

    pub fn load<R: Read>(&mut self, input: &mut InputStream<R>) -> Result<()> {
        input.expect_tag(&self.name())?;
        self.one_key_index.load(input)?;
        self.two_keys_index.load(input)
    }

    pub fn component_statistics(&self, list: &ConcurrentTripleList) -> ComponentStatistics {
        let one_key_statistics = self.one_key_index.component_statistics();
        let triple_count = list.exact_triple_count(TupleStatus::COMPLETE, TupleStatus::COMPLETE);
        let number_of_buckets = self.two_keys_index.number_of_buckets();
        let used_buckets = self.two_keys_index.number_of_used_buckets();
        let two_keys_size = (number_of_buckets * BUCKET_SIZE) as u64;
        let aggregate_size = one_key_statistics.integer_value("Size") + two_keys_size;

        let mut statistics = ComponentStatistics::new(self.name());
        statistics.add_integer_item("Two keys index -- size", two_keys_size);
        statistics.add_integer_item("Two keys index -- total buckets", number_of_buckets as u64);
        statistics.add_integer_item("Two keys index -- used buckets", used_buckets as u64);
        if number_of_buckets != 0 {
            statistics.add_float_item(
                "Two keys index -- load factor (%)",
                used_buckets as f64 * 100.0 / number_of_buckets as f64,
            );
        }
        if triple_count != 0 {
            statistics.add_float_item(
                "Two keys index -- used buckets / number of triples (%)",
                used_buckets as f64 * 100.0 / triple_count as f64,
            );
        }
        statistics.add_integer_item("Aggregate size", aggregate_size);
        if triple_count != 0 {
            statistics.add_float_item(
                "Bytes per triple",
                aggregate_size as f64 / triple_count as f64,
            );
        }
        statistics.add_subcomponent(one_key_statistics);
        statistics
    }
}
