//! Triple lists: append-only slot stores with intrusive next-pointer chains.
//!
//! Every slot holds three resource ids, three next pointers (one per
//! component) and a status byte. Slot 0 is never written, so a next pointer
//! of `TupleIndex::INVALID` terminates a chain.
//!
//! Two variants exist:
//! - `ConcurrentTripleList`: atomics everywhere, mutated through `&self`
//! - `SequentialTripleList`: plain vectors, mutated through `&mut self`
//!
//! Both share the read side through the `TripleList` trait, which is all the
//! hash-table bucket policies and scans need.

mod concurrent;
mod sequential;

pub use concurrent::ConcurrentTripleList;
pub use sequential::SequentialTripleList;

use tristore_common::{
    ComponentStatistics, ResourceComponent, ResourceId, Triple, TupleIndex, TupleStatus,
};

/// Read access to a triple list.
pub trait TripleList: Send + Sync {
    /// Returns one component of the slot.
    fn resource_id(&self, index: TupleIndex, component: ResourceComponent) -> ResourceId;

    /// Returns the slot's triple.
    fn resource_ids(&self, index: TupleIndex) -> Triple {
        [
            self.resource_id(index, ResourceComponent::S),
            self.resource_id(index, ResourceComponent::P),
            self.resource_id(index, ResourceComponent::O),
        ]
    }

    /// Returns the slot's status, `INVALID` for slots past the end.
    fn triple_status(&self, index: TupleIndex) -> TupleStatus;

    /// Returns the next slot sharing this slot's value for `component`.
    fn next(&self, index: TupleIndex, component: ResourceComponent) -> TupleIndex;

    /// Returns the first slot not yet handed out.
    fn first_free_triple_index(&self) -> TupleIndex;

    /// Returns the first slot `add` ever hands out.
    fn first_write_triple_index(&self) -> TupleIndex {
        TupleIndex::FIRST
    }

    /// Returns the first complete slot, or `INVALID` if there is none.
    fn first_triple_index(&self) -> TupleIndex {
        self.next_triple_index(TupleIndex::INVALID)
    }

    /// Returns the first complete slot after `index` whose subject is set.
    fn next_triple_index(&self, index: TupleIndex) -> TupleIndex {
        let first_free = self.first_free_triple_index();
        let mut candidate = index.next();
        while candidate < first_free {
            if self.triple_status(candidate).is_complete()
                && self.resource_id(candidate, ResourceComponent::S).is_valid()
            {
                return candidate;
            }
            candidate = candidate.next();
        }
        TupleIndex::INVALID
    }

    /// Counts complete slots whose `status & mask == expected`.
    fn exact_triple_count(&self, mask: TupleStatus, expected: TupleStatus) -> usize {
        let mut count = 0;
        let mut index = self.first_triple_index();
        while index.is_valid() {
            if self.triple_status(index).matches(mask, expected) {
                count += 1;
            }
            index = self.next_triple_index(index);
        }
        count
    }

    /// Returns the number of slots handed out, including unfinished ones.
    fn approximate_triple_count(&self) -> usize {
        self.first_free_triple_index().as_usize() - 1
    }

    /// Returns true if `reserve_add_window` is available.
    fn supports_windowed_adds(&self) -> bool;

    /// Returns a memory report.
    fn component_statistics(&self) -> ComponentStatistics;
}

/// Builds the report shared by both list variants.
pub(crate) fn list_statistics<L: TripleList + ?Sized>(
    list: &L,
    name: &str,
    bytes_per_slot: usize,
) -> ComponentStatistics {
    let exact = list.exact_triple_count(TupleStatus::COMPLETE, TupleStatus::COMPLETE);
    let size = list.first_free_triple_index().as_usize() * bytes_per_slot;
    let mut statistics = ComponentStatistics::new(name);
    statistics.add_integer_item("Size", size as u64);
    statistics.add_integer_item(
        "Approximate triple count",
        list.approximate_triple_count() as u64,
    );
    statistics.add_integer_item("Exact triple count", exact as u64);
    if exact != 0 {
        statistics.add_integer_item("Bytes per triple", (size / exact) as u64);
    }
    statistics
}
