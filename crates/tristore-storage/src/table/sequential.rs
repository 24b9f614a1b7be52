//! Single-writer triple table over the sequential list and hash tables.
//!
//! Same layout and routing as `TripleTable`, but every mutation takes
//! `&mut self`, so no thread context or insert token is needed. A new
//! triple is added only after every index has found room for it, so a
//! failed add leaves all indexes untouched.

use super::iterator::{Route, TripleIterator};
use super::pattern::{QueryShape, TriplePattern};
use super::{check_triple, links_exhausted_error, OPS, POS, SPO};
use crate::hash_table::{
    BucketDescriptor, BucketStatus, SequentialHashTable, ThreeKeysPolicy, TwoKeysPolicy,
};
use crate::managers::{manager_name, ChainScan, ChainStart};
use crate::one_key_index::OneKeyIndex;
use crate::triple_list::{SequentialTripleList, TripleList};
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tristore_common::{
    ComponentStatistics, ResourceComponent, Result, StoreConfig, StoreError, Triple, TupleIndex,
    TupleStatus,
};
use tristore_memory::{InputStream, MemoryManager, OutputStream};

const TAG: &str = "SequentialTripleTable";

const BUCKET_SIZE: usize = 8;

/// Where a new slot goes in one chain; found before anything is written.
#[derive(Clone, Copy)]
enum ChainSlot {
    /// Push onto the C1 chain head.
    Head,
    /// Push onto the C1 chain head and record the new (C1, C2) group.
    NewGroup(BucketDescriptor),
    /// Link right after the first slot of an existing group.
    After(TupleIndex),
}

/// One chain-owning index. With a group table it keeps (C1, C2) groups
/// contiguous in the C1 chain; without one it only pushes onto the head.
struct ChainIndex {
    component1: ResourceComponent,
    component2: ResourceComponent,
    component3: ResourceComponent,
    heads: OneKeyIndex,
    groups: Option<SequentialHashTable<TwoKeysPolicy>>,
}

impl ChainIndex {
    fn new(
        memory_manager: Arc<MemoryManager>,
        config: &StoreConfig,
        components: [ResourceComponent; 3],
        grouped: bool,
    ) -> Self {
        let [component1, component2, component3] = components;
        let groups = grouped.then(|| {
            SequentialHashTable::new(
                Arc::clone(&memory_manager),
                TwoKeysPolicy::new(component1, component2),
                config.hash_table_load_factor,
            )
        });
        Self {
            component1,
            component2,
            component3,
            heads: OneKeyIndex::new(memory_manager, config.max_resource_id),
            groups,
        }
    }

    fn name(&self) -> String {
        let kind = if self.groups.is_some() {
            "SequentialGroupByTwo"
        } else {
            "SequentialGroupByOne"
        };
        manager_name(kind, self.component1, self.component2)
    }

    fn initialize(&mut self, number_of_buckets: usize, initial_resources: usize) -> bool {
        let initial_entries = if initial_resources == 0 {
            0
        } else {
            initial_resources + 1
        };
        self.heads.initialize(initial_entries)
            && self
                .groups
                .as_mut()
                .map_or(true, |groups| groups.initialize(number_of_buckets))
    }

    fn reserve_resource(&self, triple: &Triple) -> bool {
        self.heads
            .extend_to_resource_id(self.component1.of(triple))
    }

    /// Finds the slot's place without changing any chain. Returns `None` if
    /// the group table is full.
    fn locate(&mut self, list: &SequentialTripleList, triple: &Triple) -> Option<ChainSlot> {
        let Some(groups) = self.groups.as_mut() else {
            return Some(ChainSlot::Head);
        };
        let key = (self.component1.of(triple), self.component2.of(triple));
        let mut descriptor = groups.acquire_bucket(list, &key);
        match groups.continue_bucket_search(list, &mut descriptor, &key) {
            BucketStatus::Empty => Some(ChainSlot::NewGroup(descriptor)),
            BucketStatus::Contains => Some(ChainSlot::After(descriptor.contents)),
            BucketStatus::NotContains => None,
        }
    }

    fn link(
        &mut self,
        list: &mut SequentialTripleList,
        index: TupleIndex,
        triple: &Triple,
        slot: ChainSlot,
    ) {
        let value1 = self.component1.of(triple);
        match slot {
            ChainSlot::Head | ChainSlot::NewGroup(_) => {
                list.set_next(index, self.component1, self.heads.head(value1));
                self.heads.set_head(value1, index);
            }
            ChainSlot::After(group_head) => {
                let after_head = list.next(group_head, self.component1);
                list.set_next(index, self.component1, after_head);
                list.set_next(group_head, self.component1, index);
            }
        }
        if let (ChainSlot::NewGroup(descriptor), Some(groups)) = (slot, self.groups.as_mut()) {
            groups.set_bucket_contents(&descriptor, index);
            groups.acknowledge_insert(&descriptor);
        }
        self.heads.increment_triple_count(value1, 1);
    }

    fn group_head(&self, list: &SequentialTripleList, triple: &Triple) -> TupleIndex {
        let key = (self.component1.of(triple), self.component2.of(triple));
        self.groups
            .as_ref()
            .map_or(TupleIndex::INVALID, |groups| groups.find(list, &key))
    }

    fn first_triple_index_1(&self, triple: &Triple) -> ChainStart {
        ChainStart::unfiltered(self.heads.head(self.component1.of(triple)), self.component1)
    }

    fn first_triple_index_12(&self, list: &SequentialTripleList, triple: &Triple) -> ChainStart {
        if self.groups.is_some() {
            ChainStart::filtered(
                self.group_head(list, triple),
                self.component1,
                self.component2,
                self.component2.of(triple),
                ChainScan::Grouped,
            )
        } else {
            ChainStart::filtered(
                self.heads.head(self.component1.of(triple)),
                self.component1,
                self.component2,
                self.component2.of(triple),
                ChainScan::Filtered,
            )
        }
    }

    fn first_triple_index_13(&self, triple: &Triple) -> ChainStart {
        ChainStart::filtered(
            self.heads.head(self.component1.of(triple)),
            self.component1,
            self.component3,
            self.component3.of(triple),
            ChainScan::Filtered,
        )
    }

    fn count_estimate_1(&self, triple: &Triple) -> usize {
        self.heads.triple_count(self.component1.of(triple))
    }

    fn count_estimate_12(&self, list: &SequentialTripleList, triple: &Triple) -> usize {
        if self.groups.is_none() {
            return self.count_estimate_1(triple);
        }
        let value1 = self.component1.of(triple);
        let value2 = self.component2.of(triple);
        let mut count = 0;
        let mut index = self.group_head(list, triple);
        while index.is_valid()
            && list.resource_id(index, self.component1) == value1
            && list.resource_id(index, self.component2) == value2
        {
            count += 1;
            index = list.next(index, self.component1);
        }
        count
    }

    fn recount(&self, list: &SequentialTripleList) {
        self.heads.clear_counts();
        let mut index = list.first_triple_index();
        while index.is_valid() {
            let value1 = list.resource_id(index, self.component1);
            if self.heads.extend_to_resource_id(value1) {
                self.heads.increment_triple_count(value1, 1);
            }
            index = list.next_triple_index(index);
        }
    }

    fn save<W: Write>(&self, output: &mut OutputStream<W>) -> Result<()> {
        output.write_string(&self.name())?;
        self.heads.save(output)?;
        match &self.groups {
            Some(groups) => groups.save(output),
            None => Ok(()),
        }
    }

    fn load<R: Read>(&mut self, input: &mut InputStream<R>) -> Result<()> {
        input.expect_tag(&self.name())?;
        self.heads.load(input)?;
        match self.groups.as_mut() {
            Some(groups) => groups.load(input),
            None => Ok(()),
        }
    }

    fn component_statistics(&self) -> ComponentStatistics {
        let heads_statistics = self.heads.component_statistics();
        let mut aggregate_size = heads_statistics.integer_value("Size");
        let mut statistics = ComponentStatistics::new(self.name());
        if let Some(groups) = &self.groups {
            let two_keys_size = (groups.number_of_buckets() * BUCKET_SIZE) as u64;
            aggregate_size += two_keys_size;
            statistics.add_integer_item("Two keys index -- size", two_keys_size);
            statistics.add_integer_item(
                "Two keys index -- used buckets",
                groups.number_of_used_buckets() as u64,
            );
        }
        statistics.add_integer_item("Aggregate size", aggregate_size);
        statistics.add_subcomponent(heads_statistics);
        statistics
    }
}

/// Triple table for single-threaded use, such as building a store from a
/// file before it is shared.
pub struct SequentialTripleTable {
    config: StoreConfig,
    list: SequentialTripleList,
    spo: ChainIndex,
    pos: ChainIndex,
    ops: ChainIndex,
    three_keys: SequentialHashTable<ThreeKeysPolicy>,
}

impl SequentialTripleTable {
    pub fn new(memory_manager: Arc<MemoryManager>, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let mut table = Self {
            list: SequentialTripleList::new(
                Arc::clone(&memory_manager),
                config.max_triple_capacity,
            ),
            spo: ChainIndex::new(Arc::clone(&memory_manager), &config, SPO, true),
            pos: ChainIndex::new(Arc::clone(&memory_manager), &config, POS, false),
            ops: ChainIndex::new(Arc::clone(&memory_manager), &config, OPS, true),
            three_keys: SequentialHashTable::new(
                memory_manager,
                ThreeKeysPolicy,
                config.hash_table_load_factor,
            ),
            config,
        };
        table.initialize(
            table.config.initial_triple_capacity,
            table.config.initial_resource_capacity,
        )?;
        Ok(table)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Drops every triple and sizes the structures for the given capacities.
    pub fn initialize(
        &mut self,
        initial_triple_capacity: usize,
        initial_resource_capacity: usize,
    ) -> Result<()> {
        let number_of_buckets = self.config.hash_table_size(initial_triple_capacity);
        if !self.list.initialize(initial_triple_capacity) {
            warn!(initial_triple_capacity, "cannot allocate the triple list");
            return Err(StoreError::OutOfMemory(
                "cannot initialize the triple list".to_string(),
            ));
        }
        for chains in [&mut self.spo, &mut self.pos, &mut self.ops] {
            if !chains.initialize(number_of_buckets, initial_resource_capacity) {
                return Err(StoreError::OutOfMemory(format!(
                    "cannot initialize {}",
                    chains.name()
                )));
            }
        }
        if !self.three_keys.initialize(number_of_buckets) {
            return Err(StoreError::OutOfMemory(
                "cannot initialize the three keys index".to_string(),
            ));
        }
        debug!(
            initial_triple_capacity,
            initial_resource_capacity, "sequential triple table initialized"
        );
        Ok(())
    }

    pub fn triple_list(&self) -> &SequentialTripleList {
        &self.list
    }

    /// Same contract as `TripleTable::add_tuple`.
    pub fn add_tuple(
        &mut self,
        triple: &Triple,
        delete_status: TupleStatus,
        add_status: TupleStatus,
    ) -> Result<(bool, TupleIndex)> {
        check_triple(triple)?;
        if !(self.spo.reserve_resource(triple)
            && self.pos.reserve_resource(triple)
            && self.ops.reserve_resource(triple))
        {
            warn!(
                ?triple,
                max_resource_id = self.config.max_resource_id,
                "resource id cannot be indexed"
            );
            return Err(StoreError::OutOfMemory(format!(
                "cannot index resources ({} {} {})",
                triple[0], triple[1], triple[2]
            )));
        }

        let mut descriptor = self.three_keys.acquire_bucket(&self.list, triple);
        match self
            .three_keys
            .continue_bucket_search(&self.list, &mut descriptor, triple)
        {
            BucketStatus::Contains => {
                let index = descriptor.contents;
                return Ok((
                    self.update_status(index, delete_status, add_status, TupleStatus::INVALID),
                    index,
                ));
            }
            BucketStatus::NotContains => {
                warn!("three keys index cannot grow");
                return Err(StoreError::OutOfMemory(
                    "the three keys index is full".to_string(),
                ));
            }
            BucketStatus::Empty => {}
        }

        let (Some(spo_slot), Some(pos_slot), Some(ops_slot)) = (
            self.spo.locate(&self.list, triple),
            self.pos.locate(&self.list, triple),
            self.ops.locate(&self.list, triple),
        ) else {
            return Err(links_exhausted_error());
        };
        let index = self.list.add(triple);
        if !index.is_valid() {
            warn!("triple list cannot grow");
            return Err(StoreError::OutOfMemory(
                "the triple list is full".to_string(),
            ));
        }

        self.three_keys.set_bucket_contents(&descriptor, index);
        self.three_keys.acknowledge_insert(&descriptor);
        self.spo.link(&mut self.list, index, triple, spo_slot);
        self.pos.link(&mut self.list, index, triple, pos_slot);
        self.ops.link(&mut self.list, index, triple, ops_slot);
        Ok((
            self.update_status(index, delete_status, add_status, TupleStatus::COMPLETE),
            index,
        ))
    }

    fn update_status(
        &mut self,
        index: TupleIndex,
        delete_status: TupleStatus,
        add_status: TupleStatus,
        complete_status: TupleStatus,
    ) -> bool {
        let mask = delete_status | add_status;
        let existing = self.list.triple_status(index);
        self.list
            .set_triple_status(index, (existing & !mask) | add_status | complete_status);
        (existing & mask) != add_status
    }

    /// Sets the given bits. Returns false if all of them were already set.
    pub fn add_tuple_status(&mut self, index: TupleIndex, status: TupleStatus) -> bool {
        let existing = self.list.triple_status(index);
        let new = existing | status;
        new != existing && self.list.set_triple_status_conditional(index, existing, new)
    }

    /// Clears the given bits. Returns false if none of them was set.
    pub fn delete_tuple_status(&mut self, index: TupleIndex, status: TupleStatus) -> bool {
        let existing = self.list.triple_status(index);
        let new = existing & !status;
        new != existing && self.list.set_triple_status_conditional(index, existing, new)
    }

    pub fn set_tuple_status_conditional(
        &mut self,
        index: TupleIndex,
        expected: TupleStatus,
        status: TupleStatus,
    ) -> bool {
        self.list
            .set_triple_status_conditional(index, expected, status)
    }

    pub fn get_tuple_index(&self, triple: &Triple) -> TupleIndex {
        let index = self.three_keys.find(&self.list, triple);
        if index.is_valid() && self.list.triple_status(index).is_complete() {
            index
        } else {
            TupleIndex::INVALID
        }
    }

    pub fn contains_tuple(&self, triple: &Triple, mask: TupleStatus, expected: TupleStatus) -> bool {
        let index = self.get_tuple_index(triple);
        index.is_valid() && self.list.triple_status(index).matches(mask, expected)
    }

    pub fn get_tuple_status(&self, index: TupleIndex) -> TupleStatus {
        self.list.triple_status(index)
    }

    pub fn get_status_and_tuple_if_complete(
        &self,
        index: TupleIndex,
    ) -> (TupleStatus, Option<Triple>) {
        let status = self.list.triple_status(index);
        let triple = status
            .is_complete()
            .then(|| self.list.resource_ids(index));
        (status, triple)
    }

    pub fn first_free_tuple_index(&self) -> TupleIndex {
        self.list.first_free_triple_index()
    }

    pub fn tuple_count(&self, mask: TupleStatus, expected: TupleStatus) -> usize {
        self.list.exact_triple_count(mask, expected)
    }

    pub fn approximate_tuple_count(&self) -> usize {
        self.list.approximate_triple_count()
    }

    /// Always fails: the sequential list has no shared slot counter.
    pub fn reserve_add_window(&mut self, window_size: usize) -> Result<TupleIndex> {
        self.list.reserve_add_window(window_size)
    }

    pub(crate) fn route(&self, pattern: &TriplePattern) -> Route {
        let key = pattern.key();
        match pattern.shape() {
            QueryShape::Unbound => Route::Scan,
            QueryShape::S => Route::Chain(self.spo.first_triple_index_1(&key)),
            QueryShape::P => Route::Chain(self.pos.first_triple_index_1(&key)),
            QueryShape::SP => Route::Chain(self.spo.first_triple_index_12(&self.list, &key)),
            QueryShape::O => Route::Chain(self.ops.first_triple_index_1(&key)),
            QueryShape::SO => Route::Chain(self.spo.first_triple_index_13(&key)),
            QueryShape::PO => Route::Chain(self.ops.first_triple_index_12(&self.list, &key)),
            QueryShape::SPO => Route::Single(self.get_tuple_index(&key)),
        }
    }

    pub fn query(
        &self,
        pattern: TriplePattern,
        mask: TupleStatus,
        expected: TupleStatus,
    ) -> TripleIterator<'_> {
        TripleIterator::sequential(self, pattern, mask, expected)
    }

    pub fn count_estimate(&self, pattern: &TriplePattern) -> usize {
        let key = pattern.key();
        match pattern.shape() {
            QueryShape::Unbound => self.list.approximate_triple_count(),
            QueryShape::S | QueryShape::SO => self.spo.count_estimate_1(&key),
            QueryShape::P => self.pos.count_estimate_1(&key),
            QueryShape::SP => self.spo.count_estimate_12(&self.list, &key),
            QueryShape::O => self.ops.count_estimate_1(&key),
            QueryShape::PO => self.ops.count_estimate_12(&self.list, &key),
            QueryShape::SPO => usize::from(self.contains_tuple(
                &key,
                TupleStatus::IDB | TupleStatus::IDB_MERGED,
                TupleStatus::IDB,
            )),
        }
    }

    /// Recomputes the per-resource triple counts from the stored triples.
    pub fn update_statistics(&mut self) {
        self.spo.recount(&self.list);
        self.pos.recount(&self.list);
        self.ops.recount(&self.list);
    }

    pub fn save<W: Write>(&self, output: &mut OutputStream<W>) -> Result<()> {
        output.write_string(TAG)?;
        self.list.save(output)?;
        self.spo.save(output)?;
        self.pos.save(output)?;
        self.ops.save(output)?;
        self.three_keys.save(output)?;
        info!(
            slots = self.list.approximate_triple_count(),
            "sequential triple table saved"
        );
        Ok(())
    }

    pub fn load<R: Read>(&mut self, input: &mut InputStream<R>) -> Result<()> {
        input.expect_tag(TAG)?;
        self.list.load(input)?;
        self.spo.load(input)?;
        self.pos.load(input)?;
        self.ops.load(input)?;
        self.three_keys.load(input)?;
        info!(
            slots = self.list.approximate_triple_count(),
            "sequential triple table loaded"
        );
        Ok(())
    }

    pub fn component_statistics(&self) -> ComponentStatistics {
        let list_statistics = TripleList::component_statistics(&self.list);
        let chain_statistics = [
            self.spo.component_statistics(),
            self.pos.component_statistics(),
            self.ops.component_statistics(),
        ];
        let three_keys_size = (self.three_keys.number_of_buckets() * BUCKET_SIZE) as u64;
        let aggregate_size = list_statistics.integer_value("Size")
            + chain_statistics
                .iter()
                .map(|statistics| statistics.integer_value("Aggregate size"))
                .sum::<u64>()
            + three_keys_size;
        let triple_count = self
            .list
            .exact_triple_count(TupleStatus::COMPLETE, TupleStatus::COMPLETE);

        let mut statistics = ComponentStatistics::new(TAG);
        statistics.add_integer_item("Aggregate size", aggregate_size);
        statistics.add_integer_item("Triple count", triple_count as u64);
        statistics.add_integer_item("Three keys index -- size", three_keys_size);
        statistics.add_subcomponent(list_statistics);
        for chain in chain_statistics {
            statistics.add_subcomponent(chain);
        }
        statistics
    }
}
