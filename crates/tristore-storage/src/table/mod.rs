//! The triple table: one concurrent triple list indexed three ways.
//!
//! Layout:
//! - `TwoKeysManagerGroupByTwo(S, P, O)` owns the S next pointers
//! - `TwoKeysManagerGroupByOne(P, O, S)` owns the P next pointers
//! - `TwoKeysManagerGroupByTwo(O, P, S)` owns the O next pointers
//! - `ThreeKeysManager` maps each stored triple to its slot
//!
//! A slot becomes visible to queries when its status gains `COMPLETE`,
//! which happens only after all four indexes know about it.

mod iterator;
mod pattern;
mod sequential;
mod window;

pub use iterator::{TripleIterator, TripleMatch};
pub(crate) use iterator::Route;
pub use pattern::{PatternTerm, QueryShape, TriplePattern};
pub use sequential::SequentialTripleTable;
pub use window::WindowedLoader;

use crate::managers::{ThreeKeysManager, TwoKeysManagerGroupByOne, TwoKeysManagerGroupByTwo};
use crate::triple_list::{ConcurrentTripleList, TripleList};
use crossbeam::queue::SegQueue;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tristore_common::{
    ComponentStatistics, ResourceComponent, Result, StoreConfig, StoreError, Triple, TupleIndex,
    TupleStatus,
};
use tristore_memory::{
    InputStream, MemoryManager, OutputStream, ThreadContext, ThreadContextRegistry,
};

const TAG: &str = "TripleTable-Formatted";

const SPO: [ResourceComponent; 3] = [
    ResourceComponent::S,
    ResourceComponent::P,
    ResourceComponent::O,
];
const POS: [ResourceComponent; 3] = [
    ResourceComponent::P,
    ResourceComponent::O,
    ResourceComponent::S,
];
const OPS: [ResourceComponent; 3] = [
    ResourceComponent::O,
    ResourceComponent::P,
    ResourceComponent::S,
];

/// Rejects triples with an undefined component.
pub(crate) fn check_triple(triple: &Triple) -> Result<()> {
    if triple.iter().all(|id| id.is_valid()) {
        Ok(())
    } else {
        Err(StoreError::InvalidTriple)
    }
}

/// Concurrent store of RDF triples with status flags and pattern lookup.
///
/// All mutating operations except `initialize`, `reindex`,
/// `make_facts_explicit`, `load` and `set_number_of_threads` take `&self`
/// and may run from many threads, each with its own `ThreadContext` taken
/// from the registry the table was built with.
pub struct TripleTable {
    config: StoreConfig,
    list: ConcurrentTripleList,
    spo: TwoKeysManagerGroupByTwo,
    pos: TwoKeysManagerGroupByOne,
    ops: TwoKeysManagerGroupByTwo,
    three_keys: ThreeKeysManager,
    scheduled_for_addition: SegQueue<TupleIndex>,
    scheduled_for_deletion: SegQueue<TupleIndex>,
}

impl TripleTable {
    /// Builds a table and initializes it with the configured capacities.
    pub fn new(
        memory_manager: Arc<MemoryManager>,
        registry: &ThreadContextRegistry,
        config: StoreConfig,
    ) -> Result<Self> {
        config.validate()?;
        let mut table = Self {
            list: ConcurrentTripleList::new(
                Arc::clone(&memory_manager),
                config.max_triple_capacity,
            ),
            spo: TwoKeysManagerGroupByTwo::new(
                Arc::clone(&memory_manager),
                registry,
                &config,
                SPO,
            )?,
            pos: TwoKeysManagerGroupByOne::new(Arc::clone(&memory_manager), &config, POS),
            ops: TwoKeysManagerGroupByTwo::new(
                Arc::clone(&memory_manager),
                registry,
                &config,
                OPS,
            )?,
            three_keys: ThreeKeysManager::new(memory_manager, registry, &config)?,
            scheduled_for_addition: SegQueue::new(),
            scheduled_for_deletion: SegQueue::new(),
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
        if !self.list.initialize(initial_triple_capacity) {
            warn!(initial_triple_capacity, "cannot allocate the triple list");
            return Err(StoreError::OutOfMemory(
                "cannot initialize the triple list".to_string(),
            ));
        }
        self.initialize_indexes(initial_triple_capacity, initial_resource_capacity)?;
        debug!(
            initial_triple_capacity,
            initial_resource_capacity, "triple table initialized"
        );
        Ok(())
    }

    fn initialize_indexes(
        &mut self,
        initial_triple_capacity: usize,
        initial_resource_capacity: usize,
    ) -> Result<()> {
        let number_of_buckets = self.config.hash_table_size(initial_triple_capacity);
        if !self
            .spo
            .initialize(number_of_buckets, initial_resource_capacity)
        {
            return Err(StoreError::OutOfMemory(format!(
                "cannot initialize {}",
                self.spo.name()
            )));
        }
        if !self.pos.initialize(initial_resource_capacity) {
            return Err(StoreError::OutOfMemory(format!(
                "cannot initialize {}",
                self.pos.name()
            )));
        }
        if !self
            .ops
            .initialize(number_of_buckets, initial_resource_capacity)
        {
            return Err(StoreError::OutOfMemory(format!(
                "cannot initialize {}",
                self.ops.name()
            )));
        }
        if !self.three_keys.initialize(number_of_buckets) {
            return Err(StoreError::OutOfMemory(
                "cannot initialize the three keys manager".to_string(),
            ));
        }
        self.scheduled_for_addition = SegQueue::new();
        self.scheduled_for_deletion = SegQueue::new();
        Ok(())
    }

    pub fn set_number_of_threads(&mut self, number_of_threads: usize) {
        self.spo.set_number_of_threads(number_of_threads);
        self.ops.set_number_of_threads(number_of_threads);
        self.three_keys.set_number_of_threads(number_of_threads);
    }

    pub fn triple_list(&self) -> &ConcurrentTripleList {
        &self.list
    }

    /// Adds a triple, or updates the status of the stored copy.
    ///
    /// The slot's status becomes `(status & !(delete | add)) | add`. Returns
    /// whether the bits under `delete | add` changed from their previous
    /// value to `add`, together with the triple's slot. Exactly one of many
    /// concurrent callers adding the same status observes `true`.
    pub fn add_tuple(
        &self,
        context: &ThreadContext,
        triple: &Triple,
        delete_status: TupleStatus,
        add_status: TupleStatus,
    ) -> Result<(bool, TupleIndex)> {
        check_triple(triple)?;
        self.reserve_resources(triple)?;
        let Some(mut token) = self.three_keys.get_insert_token(context, &self.list, triple) else {
            warn!("three keys index cannot grow");
            return Err(StoreError::OutOfMemory(
                "the three keys index is full".to_string(),
            ));
        };
        let (index, complete_status) = if token.already_exists() {
            let index = token.existing_index();
            if let Err(error) = self.check_existing(index) {
                self.three_keys.release_insert_token(token);
                return Err(error);
            }
            (index, TupleStatus::INVALID)
        } else {
            if self.links_exhausted() {
                self.three_keys.abort_insert_token(&mut token);
                self.three_keys.release_insert_token(token);
                return Err(links_exhausted_error());
            }
            let index = self.list.add(triple);
            if !index.is_valid() {
                self.three_keys.abort_insert_token(&mut token);
                self.three_keys.release_insert_token(token);
                warn!("triple list cannot grow");
                return Err(StoreError::OutOfMemory(
                    "the triple list is full".to_string(),
                ));
            }
            self.three_keys.update_on_insert(&mut token, index);
            (index, TupleStatus::COMPLETE)
        };
        self.three_keys.release_insert_token(token);
        if complete_status.is_complete() {
            self.link_new_triple(context, index, triple)?;
        }
        Ok((
            self.update_status(index, delete_status, add_status, complete_status),
            index,
        ))
    }

    /// Makes every id of the triple addressable in the chain heads, so that
    /// linking a new slot cannot fail on the id range.
    pub(crate) fn reserve_resources(&self, triple: &Triple) -> Result<()> {
        if self.spo.reserve_resource(triple)
            && self.pos.reserve_resource(triple)
            && self.ops.reserve_resource(triple)
        {
            Ok(())
        } else {
            warn!(
                ?triple,
                max_resource_id = self.config.max_resource_id,
                "resource id cannot be indexed"
            );
            Err(StoreError::OutOfMemory(format!(
                "cannot index resources ({} {} {})",
                triple[0], triple[1], triple[2]
            )))
        }
    }

    /// Returns true if a group table failed to grow, after which a new
    /// slot might be published but never linked.
    pub(crate) fn links_exhausted(&self) -> bool {
        self.spo.is_full() || self.ops.is_full()
    }

    /// Rejects a stored slot that never became complete while the group
    /// tables are exhausted; such a slot may have failed to link.
    pub(crate) fn check_existing(&self, index: TupleIndex) -> Result<()> {
        if !self.list.triple_status(index).is_complete() && self.links_exhausted() {
            return Err(links_exhausted_error());
        }
        Ok(())
    }

    /// Links a new slot into the three chain-owning managers.
    pub(crate) fn link_new_triple(
        &self,
        context: &ThreadContext,
        index: TupleIndex,
        triple: &Triple,
    ) -> Result<()> {
        if self.spo.insert_triple(context, &self.list, index, triple)
            && self.pos.insert_triple(&self.list, index, triple)
            && self.ops.insert_triple(context, &self.list, index, triple)
        {
            Ok(())
        } else {
            warn!(%index, "cannot link triple into the indexes");
            Err(StoreError::OutOfMemory(format!(
                "cannot index the triple at {}",
                index
            )))
        }
    }

    pub(crate) fn update_status(
        &self,
        index: TupleIndex,
        delete_status: TupleStatus,
        add_status: TupleStatus,
        complete_status: TupleStatus,
    ) -> bool {
        let mask = delete_status | add_status;
        loop {
            let existing = self.list.triple_status(index);
            let new = (existing & !mask) | add_status | complete_status;
            if existing == new || self.list.set_triple_status_conditional(index, existing, new) {
                return (existing & mask) != add_status;
            }
        }
    }

    /// Sets the given bits. Returns false if all of them were already set.
    pub fn add_tuple_status(&self, index: TupleIndex, status: TupleStatus) -> bool {
        loop {
            let existing = self.list.triple_status(index);
            let new = existing | status;
            if existing == new {
                return false;
            }
            if self.list.set_triple_status_conditional(index, existing, new) {
                return true;
            }
        }
    }

    /// Clears the given bits. Returns false if none of them was set.
    pub fn delete_tuple_status(&self, index: TupleIndex, status: TupleStatus) -> bool {
        loop {
            let existing = self.list.triple_status(index);
            let new = existing & !status;
            if existing == new {
                return false;
            }
            if self.list.set_triple_status_conditional(index, existing, new) {
                return true;
            }
        }
    }

    /// In one atomic step, clears `delete_status` if `status & delete_mask
    /// == delete_expected`, then sets `add_status` if the intermediate
    /// status satisfies `status & add_mask == add_expected`. Returns false
    /// if nothing changed.
    #[allow(clippy::too_many_arguments)]
    pub fn delete_add_tuple_status(
        &self,
        index: TupleIndex,
        delete_mask: TupleStatus,
        delete_expected: TupleStatus,
        delete_status: TupleStatus,
        add_mask: TupleStatus,
        add_expected: TupleStatus,
        add_status: TupleStatus,
    ) -> bool {
        loop {
            let existing = self.list.triple_status(index);
            let mut new = existing;
            if new.matches(delete_mask, delete_expected) {
                new &= !delete_status;
            }
            if new.matches(add_mask, add_expected) {
                new |= add_status;
            }
            if existing == new {
                return false;
            }
            if self.list.set_triple_status_conditional(index, existing, new) {
                return true;
            }
        }
    }

    /// Replaces the status only if it is exactly `expected`.
    pub fn set_tuple_status_conditional(
        &self,
        index: TupleIndex,
        expected: TupleStatus,
        status: TupleStatus,
    ) -> bool {
        self.list
            .set_triple_status_conditional(index, expected, status)
    }

    /// Returns the slot of a complete stored triple, or `INVALID`.
    pub fn get_tuple_index(&self, context: &ThreadContext, triple: &Triple) -> TupleIndex {
        self.three_keys
            .get_triple_index(context, &self.list, triple)
    }

    pub fn contains_tuple(
        &self,
        context: &ThreadContext,
        triple: &Triple,
        mask: TupleStatus,
        expected: TupleStatus,
    ) -> bool {
        self.three_keys
            .contains(context, &self.list, triple, mask, expected)
    }

    pub fn get_tuple_status(&self, index: TupleIndex) -> TupleStatus {
        self.list.triple_status(index)
    }

    /// Waits until the slot is complete, then returns its status and triple.
    ///
    /// `index` must have been handed out by this table; otherwise the call
    /// never returns.
    pub fn get_status_and_tuple(&self, index: TupleIndex) -> (TupleStatus, Triple) {
        loop {
            let status = self.list.triple_status(index);
            if status.is_complete() {
                return (status, self.list.resource_ids(index));
            }
            std::hint::spin_loop();
        }
    }

    /// Returns the slot's status, and its triple if the slot is complete.
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

    /// Counts complete triples whose `status & mask == expected` by a scan.
    pub fn tuple_count(&self, mask: TupleStatus, expected: TupleStatus) -> usize {
        self.list.exact_triple_count(mask, expected)
    }

    /// Number of slots handed out, including unfinished and invalidated ones.
    pub fn approximate_tuple_count(&self) -> usize {
        self.list.approximate_triple_count()
    }

    /// Reserves `window_size` consecutive slots and returns the first.
    pub fn reserve_add_window(&self, window_size: usize) -> Result<TupleIndex> {
        if window_size == 0 {
            return Err(StoreError::InvalidParameter {
                name: "window_size".to_string(),
                value: "0".to_string(),
            });
        }
        let start = self.list.reserve_add_window(window_size);
        if !start.is_valid() {
            warn!(window_size, "cannot reserve an add window");
            return Err(StoreError::OutOfMemory(format!(
                "cannot reserve {} triple slots",
                window_size
            )));
        }
        Ok(start)
    }

    /// Returns a single-thread loader that fills reserved windows of slots.
    pub fn windowed_loader<'a>(
        &'a self,
        context: &'a ThreadContext,
        window_size: usize,
    ) -> Result<WindowedLoader<'a>> {
        WindowedLoader::new(self, context, window_size)
    }

    pub(crate) fn route(&self, context: &ThreadContext, pattern: &TriplePattern) -> Route {
        let key = pattern.key();
        match pattern.shape() {
            QueryShape::Unbound => Route::Scan,
            QueryShape::S => Route::Chain(self.spo.first_triple_index_1(&key)),
            QueryShape::P => Route::Chain(self.pos.first_triple_index_1(&key)),
            QueryShape::SP => {
                Route::Chain(self.spo.first_triple_index_12(context, &self.list, &key))
            }
            QueryShape::O => Route::Chain(self.ops.first_triple_index_1(&key)),
            QueryShape::SO => Route::Chain(self.spo.first_triple_index_13(&key)),
            QueryShape::PO => {
                Route::Chain(self.ops.first_triple_index_12(context, &self.list, &key))
            }
            QueryShape::SPO => {
                Route::Single(self.three_keys.get_triple_index(context, &self.list, &key))
            }
        }
    }

    /// Iterates the complete triples matching `pattern` whose status
    /// satisfies `status & mask == expected`.
    pub fn query<'a>(
        &'a self,
        context: &'a ThreadContext,
        pattern: TriplePattern,
        mask: TupleStatus,
        expected: TupleStatus,
    ) -> TripleIterator<'a> {
        TripleIterator::concurrent(self, context, pattern, mask, expected)
    }

    /// Cheap estimate of how many triples `pattern` matches.
    pub fn count_estimate(&self, context: &ThreadContext, pattern: &TriplePattern) -> usize {
        let key = pattern.key();
        match pattern.shape() {
            QueryShape::Unbound => self.list.approximate_triple_count(),
            QueryShape::S => self.spo.count_estimate_1(&key),
            QueryShape::P => self.pos.count_estimate_1(&key),
            QueryShape::SP => self.spo.count_estimate_12(context, &self.list, &key),
            QueryShape::O => self.ops.count_estimate_1(&key),
            QueryShape::SO => self.spo.count_estimate_13(&key),
            QueryShape::PO => self.ops.count_estimate_12(context, &self.list, &key),
            QueryShape::SPO => self.three_keys.count_estimate(context, &self.list, &key),
        }
    }

    /// Adds the triple with `EDB_INS`; queues its slot if the bit was new.
    pub fn schedule_for_addition(&self, context: &ThreadContext, triple: &Triple) -> Result<bool> {
        let (changed, index) =
            self.add_tuple(context, triple, TupleStatus::INVALID, TupleStatus::EDB_INS)?;
        if changed {
            self.scheduled_for_addition.push(index);
        }
        Ok(changed)
    }

    /// Marks a stored triple with `EDB_DEL`; queues its slot if the bit was new.
    pub fn schedule_for_deletion(&self, context: &ThreadContext, triple: &Triple) -> bool {
        let index = self.get_tuple_index(context, triple);
        if index.is_valid() && self.add_tuple_status(index, TupleStatus::EDB_DEL) {
            self.scheduled_for_deletion.push(index);
            true
        } else {
            false
        }
    }

    pub fn scheduled_for_addition_count(&self) -> usize {
        self.scheduled_for_addition.len()
    }

    pub fn scheduled_for_deletion_count(&self) -> usize {
        self.scheduled_for_deletion.len()
    }

    /// Takes every queued addition, in queue order.
    pub fn drain_scheduled_for_addition(&self) -> Vec<TupleIndex> {
        drain_queue(&self.scheduled_for_addition)
    }

    /// Takes every queued deletion, in queue order.
    pub fn drain_scheduled_for_deletion(&self) -> Vec<TupleIndex> {
        drain_queue(&self.scheduled_for_deletion)
    }

    /// Recomputes the per-resource triple counts from the stored triples.
    pub fn update_statistics(&self) {
        self.spo.start_updating_statistics();
        self.pos.start_updating_statistics();
        self.ops.start_updating_statistics();
        let mut index = self.list.first_triple_index();
        while index.is_valid() {
            let triple = self.list.resource_ids(index);
            self.spo.update_statistics_for(&triple);
            self.pos.update_statistics_for(&triple);
            self.ops.update_statistics_for(&triple);
            index = self.list.next_triple_index(index);
        }
    }

    /// Rebuilds every index over the retained triples, compacting them to
    /// the front of the list.
    ///
    /// A triple is retained if it is explicit, or, unless `drop_idb` is
    /// set, derived and not merged. Retained slots keep only their `EDB`
    /// and `IDB` bits. Both schedules are cleared.
    pub fn reindex(&mut self, context: &ThreadContext, drop_idb: bool) -> Result<()> {
        let stored_before = self.list.approximate_triple_count();
        self.initialize_indexes(
            self.config.initial_triple_capacity,
            self.config.initial_resource_capacity,
        )?;
        let mut write_index = self.list.first_write_triple_index();
        let mut read_index = self.list.first_triple_index();
        while read_index.is_valid() {
            let status = self.list.triple_status(read_index);
            let retained = status.contains(TupleStatus::EDB)
                || (!drop_idb
                    && status.matches(
                        TupleStatus::IDB | TupleStatus::IDB_MERGED,
                        TupleStatus::IDB,
                    ));
            if retained {
                let triple = self.list.resource_ids(read_index);
                if read_index > write_index {
                    self.list.add_at(write_index, &triple);
                }
                self.list.set_triple_status(
                    write_index,
                    TupleStatus::COMPLETE | (status & (TupleStatus::EDB | TupleStatus::IDB)),
                );
                self.index_retained_triple(context, write_index, &triple)?;
                write_index = write_index.next();
            }
            read_index = self.list.next_triple_index(read_index);
        }
        self.list.truncate(write_index);
        debug!(
            stored_before,
            retained = self.list.approximate_triple_count(),
            drop_idb,
            "triple table reindexed"
        );
        Ok(())
    }

    fn index_retained_triple(
        &self,
        context: &ThreadContext,
        index: TupleIndex,
        triple: &Triple,
    ) -> Result<()> {
        let Some(mut token) = self.three_keys.get_insert_token(context, &self.list, triple) else {
            warn!("three keys index cannot grow");
            return Err(StoreError::OutOfMemory(
                "the three keys index is full".to_string(),
            ));
        };
        if token.already_exists() {
            return Err(StoreError::Internal(format!(
                "triple at {} is stored twice",
                index
            )));
        }
        self.three_keys.update_on_insert(&mut token, index);
        self.three_keys.release_insert_token(token);
        self.link_new_triple(context, index, triple)
    }

    /// Turns every derived, unmerged triple into an explicit one and drops
    /// all other status bits except `COMPLETE`. Both schedules are cleared.
    pub fn make_facts_explicit(&mut self) {
        self.scheduled_for_addition = SegQueue::new();
        self.scheduled_for_deletion = SegQueue::new();
        let mut index = self.list.first_triple_index();
        while index.is_valid() {
            let status = self.list.triple_status(index);
            let explicit = if status.matches(
                TupleStatus::IDB | TupleStatus::IDB_MERGED,
                TupleStatus::IDB,
            ) {
                TupleStatus::IDB | TupleStatus::EDB
            } else {
                TupleStatus::INVALID
            };
            self.list
                .set_triple_status(index, TupleStatus::COMPLETE | explicit);
            index = self.list.next_triple_index(index);
        }
    }

    pub fn save<W: Write>(&mut self, output: &mut OutputStream<W>) -> Result<()> {
        output.write_string(TAG)?;
        self.list.save(output)?;
        self.spo.save(output)?;
        self.pos.save(output)?;
        self.ops.save(output)?;
        self.three_keys.save(output)?;
        save_queue(&self.scheduled_for_addition, output)?;
        save_queue(&self.scheduled_for_deletion, output)?;
        info!(
            slots = self.list.approximate_triple_count(),
            "triple table saved"
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
        self.scheduled_for_addition = load_queue(input)?;
        self.scheduled_for_deletion = load_queue(input)?;
        info!(
            slots = self.list.approximate_triple_count(),
            "triple table loaded"
        );
        Ok(())
    }

    pub fn component_statistics(&self) -> ComponentStatistics {
        let list_statistics = TripleList::component_statistics(&self.list);
        let spo_statistics = self.spo.component_statistics(&self.list);
        let pos_statistics = self.pos.component_statistics(&self.list);
        let ops_statistics = self.ops.component_statistics(&self.list);
        let three_keys_statistics = self.three_keys.component_statistics(&self.list);
        let aggregate_size = list_statistics.integer_value("Size")
            + spo_statistics.integer_value("Aggregate size")
            + pos_statistics.integer_value("Aggregate size")
            + ops_statistics.integer_value("Aggregate size")
            + three_keys_statistics.integer_value("Size");
        let triple_count = self
            .list
            .exact_triple_count(TupleStatus::COMPLETE, TupleStatus::COMPLETE);

        let mut statistics = ComponentStatistics::new("TripleTable");
        statistics.add_integer_item("Aggregate size", aggregate_size);
        statistics.add_integer_item("Triple count", triple_count as u64);
        if triple_count != 0 {
            statistics.add_float_item(
                "Bytes per triple",
                aggregate_size as f64 / triple_count as f64,
            );
        }
        statistics.add_subcomponent(list_statistics);
        statistics.add_subcomponent(spo_statistics);
        statistics.add_subcomponent(pos_statistics);
        statistics.add_subcomponent(ops_statistics);
        statistics.add_subcomponent(three_keys_statistics);
        statistics
    }
}

pub(crate) fn links_exhausted_error() -> StoreError {
    warn!("two keys index cannot grow");
    StoreError::OutOfMemory("the two keys index is full".to_string())
}

fn drain_queue(queue: &SegQueue<TupleIndex>) -> Vec<TupleIndex> {
    let mut indices = Vec::with_capacity(queue.len());
    while let Some(index) = queue.pop() {
        indices.push(index);
    }
    indices
}

fn save_queue<W: Write>(queue: &SegQueue<TupleIndex>, output: &mut OutputStream<W>) -> Result<()> {
    let indices = drain_queue(queue);
    for index in &indices {
        queue.push(*index);
    }
    output.write_region(indices.iter().map(|index| index.0))
}

fn load_queue<R: Read>(input: &mut InputStream<R>) -> Result<SegQueue<TupleIndex>> {
    let queue = SegQueue::new();
    for index in input.read_region_vec::<u64>()? {
        queue.push(TupleIndex(index));
    }
    Ok(queue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tristore_common::ResourceId;

    fn triple(s: u64, p: u64, o: u64) -> Triple {
        [ResourceId(s), ResourceId(p), ResourceId(o)]
    }

    fn bound(id: u64) -> PatternTerm {
        PatternTerm::Bound(ResourceId(id))
    }

    fn var(variable: u8) -> PatternTerm {
        PatternTerm::Variable(variable)
    }

    fn setup() -> (ThreadContextRegistry, TripleTable) {
        let config = StoreConfig::for_testing();
        let registry = ThreadContextRegistry::new(config.max_objects);
        let table =
            TripleTable::new(Arc::new(MemoryManager::unlimited()), &registry, config).unwrap();
        (registry, table)
    }

    fn collect(
        table: &TripleTable,
        context: &ThreadContext,
        pattern: TriplePattern,
    ) -> Vec<Triple> {
        let mut triples: Vec<Triple> = table
            .query(context, pattern, TupleStatus::INVALID, TupleStatus::INVALID)
            .map(|found| found.triple)
            .collect();
        triples.sort();
        triples
    }

    #[test]
    fn test_add_tuple_reports_status_changes() {
        let (registry, table) = setup();
        let context = registry.register().unwrap();
        let t = triple(1, 2, 3);

        let (added, index) = table
            .add_tuple(&context, &t, TupleStatus::INVALID, TupleStatus::EDB)
            .unwrap();
        assert!(added);
        assert_eq!(index, TupleIndex::FIRST);
        assert_eq!(
            table.get_tuple_status(index),
            TupleStatus::EDB | TupleStatus::COMPLETE
        );

        let (added, again) = table
            .add_tuple(&context, &t, TupleStatus::INVALID, TupleStatus::EDB)
            .unwrap();
        assert!(!added);
        assert_eq!(again, index);

        let (added, _) = table
            .add_tuple(&context, &t, TupleStatus::INVALID, TupleStatus::IDB)
            .unwrap();
        assert!(added);
        assert_eq!(
            table.get_tuple_status(index),
            TupleStatus::EDB | TupleStatus::IDB | TupleStatus::COMPLETE
        );
        assert_eq!(table.first_free_tuple_index(), TupleIndex(2));
    }

    #[test]
    fn test_add_tuple_rejects_undefined_ids() {
        let (registry, table) = setup();
        let context = registry.register().unwrap();
        let result = table.add_tuple(
            &context,
            &triple(1, 0, 3),
            TupleStatus::INVALID,
            TupleStatus::EDB,
        );
        assert!(matches!(result, Err(StoreError::InvalidTriple)));
        assert_eq!(table.approximate_tuple_count(), 0);
    }

    #[test]
    fn test_unindexable_id_is_rejected_before_publishing() {
        let config = StoreConfig {
            max_resource_id: 100,
            ..StoreConfig::for_testing()
        };
        let registry = ThreadContextRegistry::new(config.max_objects);
        let table =
            TripleTable::new(Arc::new(MemoryManager::unlimited()), &registry, config).unwrap();
        let context = registry.register().unwrap();

        for _ in 0..2 {
            let result = table.add_tuple(
                &context,
                &triple(1, 2, 500),
                TupleStatus::INVALID,
                TupleStatus::EDB,
            );
            assert!(matches!(result, Err(StoreError::OutOfMemory(_))));
        }
        assert_eq!(table.approximate_tuple_count(), 0);
        assert_eq!(table.get_tuple_index(&context, &triple(1, 2, 500)), TupleIndex::INVALID);
        assert!(collect(&table, &context, TriplePattern::new(bound(1), var(1), var(2))).is_empty());

        let (added, index) = table
            .add_tuple(&context, &triple(1, 2, 3), TupleStatus::INVALID, TupleStatus::EDB)
            .unwrap();
        assert!(added);
        assert_eq!(index, TupleIndex::FIRST);
        assert_eq!(
            collect(&table, &context, TriplePattern::new(bound(1), bound(2), var(2))),
            vec![triple(1, 2, 3)]
        );
        assert_eq!(table.count_estimate(&context, &TriplePattern::new(var(0), bound(2), var(2))), 1);
    }

    #[test]
    fn test_largest_id_does_not_overflow() {
        let (registry, table) = setup();
        let context = registry.register().unwrap();
        let result = table.add_tuple(
            &context,
            &triple(1, 2, u64::MAX),
            TupleStatus::INVALID,
            TupleStatus::EDB,
        );
        assert!(matches!(result, Err(StoreError::OutOfMemory(_))));
        assert_eq!(table.approximate_tuple_count(), 0);
        assert_eq!(
            table.count_estimate(&context, &TriplePattern::new(var(0), var(1), bound(u64::MAX))),
            0
        );
    }

    #[test]
    fn test_status_updates() {
        let (registry, table) = setup();
        let context = registry.register().unwrap();
        let (_, index) = table
            .add_tuple(&context, &triple(4, 5, 6), TupleStatus::INVALID, TupleStatus::EDB)
            .unwrap();

        assert!(table.add_tuple_status(index, TupleStatus::EDB_DEL));
        assert!(!table.add_tuple_status(index, TupleStatus::EDB_DEL));
        assert!(table.delete_tuple_status(index, TupleStatus::EDB_DEL));
        assert!(!table.delete_tuple_status(index, TupleStatus::EDB_DEL));

        // Clear EDB only if it is set, then add IDB only if EDB is gone.
        assert!(table.delete_add_tuple_status(
            index,
            TupleStatus::EDB,
            TupleStatus::EDB,
            TupleStatus::EDB,
            TupleStatus::EDB,
            TupleStatus::INVALID,
            TupleStatus::IDB,
        ));
        assert_eq!(
            table.get_tuple_status(index),
            TupleStatus::IDB | TupleStatus::COMPLETE
        );

        let current = table.get_tuple_status(index);
        assert!(!table.set_tuple_status_conditional(index, TupleStatus::EDB, TupleStatus::COMPLETE));
        assert!(table.set_tuple_status_conditional(index, current, TupleStatus::COMPLETE));
        assert_eq!(table.get_tuple_status(index), TupleStatus::COMPLETE);
    }

    #[test]
    fn test_status_and_tuple_reads() {
        let (registry, table) = setup();
        let context = registry.register().unwrap();
        let t = triple(7, 8, 9);
        let (_, index) = table
            .add_tuple(&context, &t, TupleStatus::INVALID, TupleStatus::EDB)
            .unwrap();
        assert_eq!(
            table.get_status_and_tuple(index),
            (TupleStatus::EDB | TupleStatus::COMPLETE, t)
        );
        assert_eq!(table.get_status_and_tuple_if_complete(index).1, Some(t));
        assert_eq!(
            table.get_status_and_tuple_if_complete(TupleIndex(50)),
            (TupleStatus::INVALID, None)
        );
        assert_eq!(table.get_tuple_index(&context, &t), index);
        assert!(table.contains_tuple(&context, &t, TupleStatus::EDB, TupleStatus::EDB));
        assert!(!table.contains_tuple(&context, &t, TupleStatus::IDB, TupleStatus::IDB));
        assert_eq!(
            table.get_tuple_index(&context, &triple(9, 8, 7)),
            TupleIndex::INVALID
        );
    }

    #[test]
    fn test_every_query_shape() {
        let (registry, table) = setup();
        let context = registry.register().unwrap();
        let stored = [
            triple(1, 2, 3),
            triple(1, 2, 4),
            triple(1, 5, 3),
            triple(6, 2, 3),
            triple(6, 5, 4),
        ];
        for t in &stored {
            table
                .add_tuple(&context, t, TupleStatus::INVALID, TupleStatus::EDB)
                .unwrap();
        }

        assert_eq!(collect(&table, &context, TriplePattern::all()).len(), 5);
        assert_eq!(
            collect(&table, &context, TriplePattern::new(bound(1), var(1), var(2))),
            vec![triple(1, 2, 3), triple(1, 2, 4), triple(1, 5, 3)]
        );
        assert_eq!(
            collect(&table, &context, TriplePattern::new(var(0), bound(5), var(2))),
            vec![triple(1, 5, 3), triple(6, 5, 4)]
        );
        assert_eq!(
            collect(&table, &context, TriplePattern::new(bound(1), bound(2), var(2))),
            vec![triple(1, 2, 3), triple(1, 2, 4)]
        );
        assert_eq!(
            collect(&table, &context, TriplePattern::new(var(0), var(1), bound(4))),
            vec![triple(1, 2, 4), triple(6, 5, 4)]
        );
        assert_eq!(
            collect(&table, &context, TriplePattern::new(bound(6), var(1), bound(3))),
            vec![triple(6, 2, 3)]
        );
        assert_eq!(
            collect(&table, &context, TriplePattern::new(var(0), bound(2), bound(3))),
            vec![triple(1, 2, 3), triple(6, 2, 3)]
        );
        assert_eq!(
            collect(&table, &context, TriplePattern::from_triple(&triple(6, 5, 4))),
            vec![triple(6, 5, 4)]
        );
        assert!(collect(&table, &context, TriplePattern::from_triple(&triple(6, 5, 3))).is_empty());
        assert!(collect(&table, &context, TriplePattern::new(bound(7), var(1), var(2))).is_empty());
    }

    #[test]
    fn test_query_filters_status_and_restarts() {
        let (registry, table) = setup();
        let context = registry.register().unwrap();
        table
            .add_tuple(&context, &triple(1, 2, 3), TupleStatus::INVALID, TupleStatus::EDB)
            .unwrap();
        table
            .add_tuple(&context, &triple(1, 2, 4), TupleStatus::INVALID, TupleStatus::IDB)
            .unwrap();

        let pattern = TriplePattern::new(bound(1), var(1), var(2));
        let mut iterator = table.query(&context, pattern, TupleStatus::IDB, TupleStatus::IDB);
        let found: Vec<TripleMatch> = iterator.by_ref().collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].triple, triple(1, 2, 4));
        assert!(found[0].status.contains(TupleStatus::IDB));
        assert!(iterator.next().is_none());

        iterator.open();
        assert_eq!(iterator.next().map(|found| found.triple), Some(triple(1, 2, 4)));
        assert_eq!(iterator.pattern(), &pattern);
    }

    #[test]
    fn test_repeated_variable_query() {
        let (registry, table) = setup();
        let context = registry.register().unwrap();
        for t in [triple(3, 2, 3), triple(3, 2, 4), triple(5, 2, 5)] {
            table
                .add_tuple(&context, &t, TupleStatus::INVALID, TupleStatus::EDB)
                .unwrap();
        }
        assert_eq!(
            collect(&table, &context, TriplePattern::new(var(0), bound(2), var(0))),
            vec![triple(3, 2, 3), triple(5, 2, 5)]
        );
    }

    #[test]
    fn test_count_estimates() {
        let (registry, table) = setup();
        let context = registry.register().unwrap();
        for t in [triple(1, 2, 3), triple(1, 2, 4), triple(1, 5, 3)] {
            table
                .add_tuple(&context, &t, TupleStatus::INVALID, TupleStatus::IDB)
                .unwrap();
        }
        let estimate = |pattern: TriplePattern| table.count_estimate(&context, &pattern);
        assert_eq!(estimate(TriplePattern::all()), 3);
        assert_eq!(estimate(TriplePattern::new(bound(1), var(1), var(2))), 3);
        assert_eq!(estimate(TriplePattern::new(bound(1), bound(2), var(2))), 2);
        assert_eq!(estimate(TriplePattern::new(var(0), bound(2), var(2))), 2);
        assert_eq!(estimate(TriplePattern::new(var(0), bound(2), bound(3))), 1);
        assert_eq!(estimate(TriplePattern::from_triple(&triple(1, 5, 3))), 1);
        assert_eq!(estimate(TriplePattern::from_triple(&triple(1, 5, 4))), 0);
    }

    #[test]
    fn test_scheduling() {
        let (registry, table) = setup();
        let context = registry.register().unwrap();
        assert!(table.schedule_for_addition(&context, &triple(1, 2, 3)).unwrap());
        assert!(!table.schedule_for_addition(&context, &triple(1, 2, 3)).unwrap());
        assert!(table.schedule_for_addition(&context, &triple(4, 5, 6)).unwrap());
        assert_eq!(table.scheduled_for_addition_count(), 2);

        assert!(table.schedule_for_deletion(&context, &triple(1, 2, 3)));
        assert!(!table.schedule_for_deletion(&context, &triple(1, 2, 3)));
        assert!(!table.schedule_for_deletion(&context, &triple(7, 8, 9)));

        assert_eq!(
            table.drain_scheduled_for_addition(),
            vec![TupleIndex(1), TupleIndex(2)]
        );
        assert_eq!(table.drain_scheduled_for_deletion(), vec![TupleIndex(1)]);
        assert_eq!(table.scheduled_for_addition_count(), 0);
        assert!(table
            .get_tuple_status(TupleIndex(1))
            .contains(TupleStatus::EDB_INS | TupleStatus::EDB_DEL));
    }

    #[test]
    fn test_update_statistics_recounts() {
        let (registry, table) = setup();
        let context = registry.register().unwrap();
        for t in [triple(1, 2, 3), triple(1, 4, 3), triple(2, 4, 3)] {
            table
                .add_tuple(&context, &t, TupleStatus::INVALID, TupleStatus::EDB)
                .unwrap();
        }
        table.update_statistics();
        let s1 = TriplePattern::new(bound(1), var(1), var(2));
        let o3 = TriplePattern::new(var(0), var(1), bound(3));
        assert_eq!(table.count_estimate(&context, &s1), 2);
        assert_eq!(table.count_estimate(&context, &o3), 3);
    }

    #[test]
    fn test_reindex_compacts_retained_triples() {
        let (registry, mut table) = setup();
        let context = registry.register().unwrap();
        let statuses = [
            (triple(1, 2, 3), TupleStatus::EDB),
            (triple(1, 2, 4), TupleStatus::IDB | TupleStatus::IDB_MERGED),
            (triple(1, 2, 5), TupleStatus::IDB),
            (triple(1, 6, 7), TupleStatus::INVALID),
            (triple(8, 2, 3), TupleStatus::EDB | TupleStatus::EDB_INS),
        ];
        for (t, status) in &statuses {
            table
                .add_tuple(&context, t, TupleStatus::INVALID, *status)
                .unwrap();
        }
        table.schedule_for_addition(&context, &triple(9, 9, 9)).unwrap();

        table.reindex(&context, false).unwrap();
        assert_eq!(table.scheduled_for_addition_count(), 0);
        assert_eq!(table.first_free_tuple_index(), TupleIndex(4));
        assert_eq!(
            collect(&table, &context, TriplePattern::all()),
            vec![triple(1, 2, 3), triple(1, 2, 5), triple(8, 2, 3)]
        );
        let index = table.get_tuple_index(&context, &triple(8, 2, 3));
        assert_eq!(index, TupleIndex(3));
        assert_eq!(
            table.get_tuple_status(index),
            TupleStatus::EDB | TupleStatus::COMPLETE
        );
        assert_eq!(
            collect(&table, &context, TriplePattern::new(bound(1), bound(2), var(2))),
            vec![triple(1, 2, 3), triple(1, 2, 5)]
        );
        assert_eq!(
            table.get_tuple_index(&context, &triple(1, 2, 4)),
            TupleIndex::INVALID
        );

        table.reindex(&context, true).unwrap();
        assert_eq!(
            collect(&table, &context, TriplePattern::all()),
            vec![triple(1, 2, 3), triple(8, 2, 3)]
        );
        assert_eq!(table.tuple_count(TupleStatus::COMPLETE, TupleStatus::COMPLETE), 2);
    }

    #[test]
    fn test_make_facts_explicit() {
        let (registry, mut table) = setup();
        let context = registry.register().unwrap();
        let (_, derived) = table
            .add_tuple(&context, &triple(1, 2, 3), TupleStatus::INVALID, TupleStatus::IDB)
            .unwrap();
        let (_, merged) = table
            .add_tuple(
                &context,
                &triple(1, 2, 4),
                TupleStatus::INVALID,
                TupleStatus::IDB | TupleStatus::IDB_MERGED,
            )
            .unwrap();
        table.schedule_for_addition(&context, &triple(5, 5, 5)).unwrap();

        table.make_facts_explicit();
        assert_eq!(
            table.get_tuple_status(derived),
            TupleStatus::COMPLETE | TupleStatus::EDB | TupleStatus::IDB
        );
        assert_eq!(table.get_tuple_status(merged), TupleStatus::COMPLETE);
        assert_eq!(table.scheduled_for_addition_count(), 0);
    }

    #[test]
    fn test_save_load_round_trip() {
        let (registry, mut table) = setup();
        let context = registry.register().unwrap();
        for s in 1..=20u64 {
            table
                .add_tuple(&context, &triple(s, s % 3 + 1, 7), TupleStatus::INVALID, TupleStatus::EDB)
                .unwrap();
        }
        table.schedule_for_addition(&context, &triple(30, 1, 1)).unwrap();
        table.schedule_for_deletion(&context, &triple(2, 3, 7));

        let mut output = OutputStream::new(Vec::new());
        table.save(&mut output).unwrap();
        let bytes = output.finish().unwrap();
        assert_eq!(table.scheduled_for_addition_count(), 1);

        let (restored_registry, mut restored) = setup();
        restored
            .load(&mut InputStream::new(Cursor::new(bytes)))
            .unwrap();
        let restored_context = restored_registry.register().unwrap();
        assert_eq!(
            collect(&restored, &restored_context, TriplePattern::all()),
            collect(&table, &context, TriplePattern::all())
        );
        assert_eq!(
            collect(
                &restored,
                &restored_context,
                TriplePattern::new(var(0), bound(2), var(2))
            )
            .len(),
            7
        );
        assert_eq!(restored.drain_scheduled_for_addition(), vec![TupleIndex(21)]);
        assert_eq!(restored.drain_scheduled_for_deletion(), vec![TupleIndex(2)]);
    }

    #[test]
    fn test_load_rejects_foreign_stream() {
        let (_registry, mut table) = setup();
        let mut output = OutputStream::new(Vec::new());
        output.write_string("SomethingElse").unwrap();
        let bytes = output.finish().unwrap();
        let result = table.load(&mut InputStream::new(Cursor::new(bytes)));
        assert!(matches!(result, Err(StoreError::InvalidFormat { .. })));
    }

    #[test]
    fn test_component_statistics() {
        let (registry, table) = setup();
        let context = registry.register().unwrap();
        for o in 1..=10u64 {
            table
                .add_tuple(&context, &triple(1, 2, o), TupleStatus::INVALID, TupleStatus::EDB)
                .unwrap();
        }
        let statistics = table.component_statistics();
        assert_eq!(statistics.name(), "TripleTable");
        assert_eq!(statistics.integer_value("Triple count"), 10);
        assert!(statistics.integer_value("Aggregate size") > 0);
        assert!(statistics.float_value("Bytes per triple").is_some());
        assert!(statistics
            .subcomponent("TwoKeysManagerGroupByTwo[S.P]")
            .is_some());
        assert!(statistics
            .subcomponent("TwoKeysManagerGroupByOne[P.O]")
            .is_some());
        assert!(statistics.subcomponent("ThreeKeysManager").is_some());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = StoreConfig {
            number_of_threads: 0,
            ..StoreConfig::for_testing()
        };
        let registry = ThreadContextRegistry::new(16);
        let result = TripleTable::new(Arc::new(MemoryManager::unlimited()), &registry, config);
        assert!(matches!(result, Err(StoreError::InvalidParameter { .. })));
    }
}
