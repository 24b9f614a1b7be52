use super::{list_statistics, TripleList};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tristore_common::{
    ComponentStatistics, ResourceComponent, ResourceId, Result, StoreError, Triple, TupleIndex,
    TupleStatus,
};
use tristore_memory::{AtomicRegion, InputStream, MemoryManager, OutputStream};

const TAG: &str = "ConcurrentTripleList";

/// Bytes one slot occupies: three ids, three next pointers and a status.
const BYTES_PER_SLOT: usize = 3 * (8 + 8) + 1;

/// Triple list safe for concurrent appends, reads and status updates.
///
/// Slot indices come from one atomic counter; the backing regions grow in
/// place, so a slot never moves once handed out.
pub struct ConcurrentTripleList {
    resources: AtomicRegion<AtomicU64>,
    nexts: AtomicRegion<AtomicU64>,
    statuses: AtomicRegion<AtomicU8>,
    first_free: AtomicU64,
}

impl ConcurrentTripleList {
    /// Creates an empty list that may hold up to `max_triples` slots.
    pub fn new(memory_manager: Arc<MemoryManager>, max_triples: usize) -> Self {
        let max_slots = max_triples.saturating_add(1);
        Self {
            resources: AtomicRegion::new(Arc::clone(&memory_manager), max_slots.saturating_mul(3)),
            nexts: AtomicRegion::new(Arc::clone(&memory_manager), max_slots.saturating_mul(3)),
            statuses: AtomicRegion::new(memory_manager, max_slots),
            first_free: AtomicU64::new(TupleIndex::FIRST.0),
        }
    }

    /// Drops all slots and pre-allocates room for `initial_triples`.
    pub fn initialize(&mut self, initial_triples: usize) -> bool {
        self.resources.reset();
        self.nexts.reset();
        self.statuses.reset();
        *self.first_free.get_mut() = TupleIndex::FIRST.0;
        initial_triples == 0 || self.ensure_slots(initial_triples + 1)
    }

    fn ensure_slots(&self, slot_count: usize) -> bool {
        self.resources.ensure_end_at_least(3 * slot_count)
            && self.nexts.ensure_end_at_least(3 * slot_count)
            && self.statuses.ensure_end_at_least(slot_count)
    }

    #[inline(always)]
    fn offset(index: TupleIndex, component: ResourceComponent) -> usize {
        3 * index.as_usize() + component.index()
    }

    /// Appends a triple and returns its slot, or `INVALID` if memory ran out.
    ///
    /// The slot's status stays `INVALID` until the caller publishes it.
    pub fn add(&self, triple: &Triple) -> TupleIndex {
        let index = TupleIndex(self.first_free.fetch_add(1, Ordering::AcqRel));
        if !self.ensure_slots(index.as_usize() + 1) {
            self.first_free.fetch_sub(1, Ordering::AcqRel);
            return TupleIndex::INVALID;
        }
        self.add_at(index, triple);
        index
    }

    /// Reserves `window_size` consecutive slots for `add_at` and returns the
    /// first, or `INVALID` if memory ran out.
    pub fn reserve_add_window(&self, window_size: usize) -> TupleIndex {
        let window_end = self.first_free.fetch_add(window_size as u64, Ordering::AcqRel)
            + window_size as u64;
        if !self.ensure_slots(window_end as usize) {
            self.first_free
                .fetch_sub(window_size as u64, Ordering::AcqRel);
            return TupleIndex::INVALID;
        }
        TupleIndex(window_end - window_size as u64)
    }

    /// Writes a triple into a slot obtained from `reserve_add_window`.
    pub fn add_at(&self, index: TupleIndex, triple: &Triple) {
        for component in ResourceComponent::ALL {
            self.resources.store(
                Self::offset(index, component),
                component.of(triple).0,
                Ordering::Release,
            );
        }
    }

    /// Sets a status and returns the previous one.
    pub fn set_triple_status(&self, index: TupleIndex, status: TupleStatus) -> TupleStatus {
        TupleStatus(
            self.statuses
                .slot(index.as_usize())
                .swap(status.0, Ordering::AcqRel),
        )
    }

    /// Sets a status if the slot currently holds `expected`.
    pub fn set_triple_status_conditional(
        &self,
        index: TupleIndex,
        expected: TupleStatus,
        status: TupleStatus,
    ) -> bool {
        self.statuses
            .compare_exchange(index.as_usize(), expected.0, status.0)
    }

    pub fn set_next(&self, index: TupleIndex, component: ResourceComponent, next: TupleIndex) {
        self.nexts
            .store(Self::offset(index, component), next.0, Ordering::Release);
    }

    /// Sets a next pointer if it currently holds `expected`.
    pub fn set_next_conditional(
        &self,
        index: TupleIndex,
        component: ResourceComponent,
        expected: TupleIndex,
        next: TupleIndex,
    ) -> bool {
        self.nexts
            .compare_exchange(Self::offset(index, component), expected.0, next.0)
    }

    /// Clears every slot from `new_first_free` on and rewinds the counter.
    pub fn truncate(&self, new_first_free: TupleIndex) {
        let first_free = self.first_free_triple_index();
        let mut index = new_first_free;
        while index < first_free {
            self.set_triple_status(index, TupleStatus::INVALID);
            self.add_at(index, &[ResourceId::INVALID; 3]);
            for component in ResourceComponent::ALL {
                self.set_next(index, component, TupleIndex::INVALID);
            }
            index = index.next();
        }
        self.first_free.store(new_first_free.0, Ordering::Release);
    }

    pub fn save<W: Write>(&self, output: &mut OutputStream<W>) -> Result<()> {
        let first_free = self.first_free_triple_index().as_usize();
        output.write_string(TAG)?;
        self.resources.save(output, 3 * first_free)?;
        self.nexts.save(output, 3 * first_free)?;
        self.statuses.save(output, first_free)?;
        output.write_u64(first_free as u64)
    }

    pub fn load<R: Read>(&mut self, input: &mut InputStream<R>) -> Result<()> {
        input.expect_tag(TAG)?;
        self.resources.load_from(input)?;
        self.nexts.load_from(input)?;
        self.statuses.load_from(input)?;
        let first_free = input.read_u64()?;
        if first_free < TupleIndex::FIRST.0 {
            return Err(StoreError::invalid_format(TAG, "first free index is 0"));
        }
        if !self.ensure_slots(first_free as usize) {
            return Err(StoreError::OutOfMemory(format!(
                "cannot hold {} loaded triples",
                first_free - 1
            )));
        }
        *self.first_free.get_mut() = first_free;
        Ok(())
    }
}

impl TripleList for ConcurrentTripleList {
    #[inline(always)]
    fn resource_id(&self, index: TupleIndex, component: ResourceComponent) -> ResourceId {
        ResourceId(
            self.resources
                .load(Self::offset(index, component), Ordering::Acquire),
        )
    }

    #[inline(always)]
    fn triple_status(&self, index: TupleIndex) -> TupleStatus {
        if self.statuses.is_before_end(index.as_usize()) {
            TupleStatus(self.statuses.load(index.as_usize(), Ordering::Acquire))
        } else {
            TupleStatus::INVALID
        }
    }

    #[inline(always)]
    fn next(&self, index: TupleIndex, component: ResourceComponent) -> TupleIndex {
        TupleIndex(
            self.nexts
                .load(Self::offset(index, component), Ordering::Acquire),
        )
    }

    #[inline(always)]
    fn first_free_triple_index(&self) -> TupleIndex {
        TupleIndex(self.first_free.load(Ordering::Acquire))
    }

    fn next_triple_index(&self, index: TupleIndex) -> TupleIndex {
        let mut candidate = index.next();
        while candidate < self.first_free_triple_index()
            && self.statuses.is_before_end(candidate.as_usize())
        {
            if self.triple_status(candidate).is_complete()
                && self.resource_id(candidate, ResourceComponent::S).is_valid()
            {
                return candidate;
            }
            candidate = candidate.next();
        }
        TupleIndex::INVALID
    }

    fn supports_windowed_adds(&self) -> bool {
        true
    }

    fn component_statistics(&self) -> ComponentStatistics {
        list_statistics(self, TAG, BYTES_PER_SLOT)
    }
}
