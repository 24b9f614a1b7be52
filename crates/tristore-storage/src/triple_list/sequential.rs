use super::{list_statistics, TripleList};
use std::io::{Read, Write};
use std::sync::Arc;
use tristore_common::{
    ComponentStatistics, ResourceComponent, ResourceId, Result, StoreError, Triple, TupleIndex,
    TupleStatus,
};
use tristore_memory::{InputStream, MemoryManager, OutputStream};

const TAG: &str = "SequentialTripleList";

const BYTES_PER_SLOT: usize = 3 * (8 + 8) + 1;

/// Single-writer triple list backed by plain vectors.
pub struct SequentialTripleList {
    memory_manager: Arc<MemoryManager>,
    max_slots: usize,
    resources: Vec<u64>,
    nexts: Vec<u64>,
    statuses: Vec<u8>,
    first_free: u64,
}

impl SequentialTripleList {
    pub fn new(memory_manager: Arc<MemoryManager>, max_triples: usize) -> Self {
        Self {
            memory_manager,
            max_slots: max_triples.saturating_add(1),
            resources: Vec::new(),
            nexts: Vec::new(),
            statuses: Vec::new(),
            first_free: TupleIndex::FIRST.0,
        }
    }

    /// Drops all slots and pre-allocates room for `initial_triples`.
    pub fn initialize(&mut self, initial_triples: usize) -> bool {
        self.release();
        self.first_free = TupleIndex::FIRST.0;
        initial_triples == 0 || self.ensure_slots(initial_triples + 1)
    }

    fn slot_capacity(&self) -> usize {
        self.statuses.len()
    }

    fn release(&mut self) {
        let bytes = self.slot_capacity() * BYTES_PER_SLOT;
        self.resources = Vec::new();
        self.nexts = Vec::new();
        self.statuses = Vec::new();
        self.memory_manager.deallocate(bytes);
    }

    fn ensure_slots(&mut self, slot_count: usize) -> bool {
        let capacity = self.slot_capacity();
        if slot_count <= capacity {
            return true;
        }
        if slot_count > self.max_slots {
            return false;
        }
        let new_capacity = slot_count.max(capacity * 2).min(self.max_slots);
        if !self
            .memory_manager
            .allocate((new_capacity - capacity) * BYTES_PER_SLOT)
        {
            return false;
        }
        self.resources.resize(3 * new_capacity, 0);
        self.nexts.resize(3 * new_capacity, 0);
        self.statuses.resize(new_capacity, 0);
        true
    }

    #[inline(always)]
    fn offset(index: TupleIndex, component: ResourceComponent) -> usize {
        3 * index.as_usize() + component.index()
    }

    /// Appends a triple and returns its slot, or `INVALID` if memory ran out.
    pub fn add(&mut self, triple: &Triple) -> TupleIndex {
        if !self.ensure_slots(self.first_free as usize + 1) {
            return TupleIndex::INVALID;
        }
        let index = TupleIndex(self.first_free);
        self.first_free += 1;
        self.add_at(index, triple);
        index
    }

    /// Windowed adds need a shared counter, which this list does not have.
    pub fn reserve_add_window(&mut self, _window_size: usize) -> Result<TupleIndex> {
        Err(StoreError::Unsupported(
            "SequentialTripleList does not support windowed additions".to_string(),
        ))
    }

    pub fn add_at(&mut self, index: TupleIndex, triple: &Triple) {
        for component in ResourceComponent::ALL {
            self.resources[Self::offset(index, component)] = component.of(triple).0;
        }
    }

    /// Sets a status and returns the previous one.
    pub fn set_triple_status(&mut self, index: TupleIndex, status: TupleStatus) -> TupleStatus {
        let previous = self.statuses[index.as_usize()];
        self.statuses[index.as_usize()] = status.0;
        TupleStatus(previous)
    }

    /// Sets a status if the slot currently holds `expected`.
    pub fn set_triple_status_conditional(
        &mut self,
        index: TupleIndex,
        expected: TupleStatus,
        status: TupleStatus,
    ) -> bool {
        let slot = &mut self.statuses[index.as_usize()];
        if *slot != expected.0 {
            return false;
        }
        *slot = status.0;
        true
    }

    pub fn set_next(&mut self, index: TupleIndex, component: ResourceComponent, next: TupleIndex) {
        self.nexts[Self::offset(index, component)] = next.0;
    }

    pub fn set_next_conditional(
        &mut self,
        index: TupleIndex,
        component: ResourceComponent,
        expected: TupleIndex,
        next: TupleIndex,
    ) -> bool {
        let slot = &mut self.nexts[Self::offset(index, component)];
        if *slot != expected.0 {
            return false;
        }
        *slot = next.0;
        true
    }

    /// Clears every slot from `new_first_free` on and rewinds the counter.
    pub fn truncate(&mut self, new_first_free: TupleIndex) {
        let start = new_first_free.as_usize();
        let end = self.first_free as usize;
        if start < end {
            self.statuses[start..end].fill(0);
            self.resources[3 * start..3 * end].fill(0);
            self.nexts[3 * start..3 * end].fill(0);
        }
        self.first_free = new_first_free.0;
    }

    pub fn save<W: Write>(&self, output: &mut OutputStream<W>) -> Result<()> {
        let first_free = self.first_free as usize;
        output.write_string(TAG)?;
        output.write_region(self.resources[..3 * first_free.min(self.slot_capacity())].iter().copied())?;
        output.write_region(self.nexts[..3 * first_free.min(self.slot_capacity())].iter().copied())?;
        output.write_region(self.statuses[..first_free.min(self.slot_capacity())].iter().copied())?;
        output.write_u64(self.first_free)
    }

    pub fn load<R: Read>(&mut self, input: &mut InputStream<R>) -> Result<()> {
        input.expect_tag(TAG)?;
        let resources: Vec<u64> = input.read_region_vec()?;
        let nexts: Vec<u64> = input.read_region_vec()?;
        let statuses: Vec<u8> = input.read_region_vec()?;
        let first_free = input.read_u64()?;
        if resources.len() != 3 * statuses.len() || nexts.len() != resources.len() {
            return Err(StoreError::invalid_format(TAG, "region lengths disagree"));
        }
        if first_free < TupleIndex::FIRST.0 || first_free as usize > statuses.len().max(1) {
            return Err(StoreError::invalid_format(
                TAG,
                format!("first free index {} out of range", first_free),
            ));
        }

        self.release();
        if !self.memory_manager.allocate(statuses.len() * BYTES_PER_SLOT) {
            return Err(StoreError::OutOfMemory(format!(
                "cannot hold {} loaded triples",
                statuses.len()
            )));
        }
        self.resources = resources;
        self.nexts = nexts;
        self.statuses = statuses;
        self.first_free = first_free;
        // Keep the slot for the next add addressable.
        if !self.ensure_slots(self.first_free as usize) {
            return Err(StoreError::OutOfMemory("cannot grow loaded list".to_string()));
        }
        Ok(())
    }
}

impl Drop for SequentialTripleList {
    fn drop(&mut self) {
        self.release();
    }
}

impl TripleList for SequentialTripleList {
    #[inline(always)]
    fn resource_id(&self, index: TupleIndex, component: ResourceComponent) -> ResourceId {
        ResourceId(self.resources[Self::offset(index, component)])
    }

    #[inline(always)]
    fn triple_status(&self, index: TupleIndex) -> TupleStatus {
        if index.0 < self.first_free {
            TupleStatus(self.statuses[index.as_usize()])
        } else {
            TupleStatus::INVALID
        }
    }

    #[inline(always)]
    fn next(&self, index: TupleIndex, component: ResourceComponent) -> TupleIndex {
        TupleIndex(self.nexts[Self::offset(index, component)])
    }

    #[inline(always)]
    fn first_free_triple_index(&self) -> TupleIndex {
        TupleIndex(self.first_free)
    }

    fn supports_windowed_adds(&self) -> bool {
        false
    }

    fn component_statistics(&self) -> ComponentStatistics {
        list_statistics(self, TAG, BYTES_PER_SLOT)
    }
}
