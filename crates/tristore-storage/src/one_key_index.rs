//! Per-resource chain heads and triple counts.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tristore_common::{ComponentStatistics, ResourceId, Result, TupleIndex};
use tristore_memory::{AtomicRegion, InputStream, MemoryManager, OutputStream};

const TAG: &str = "ConcurrentOneKeyIndex";

/// Direct-addressed array from a resource id to the head of the chain of
/// triples holding that id in one component, plus a triple count per id.
pub struct OneKeyIndex {
    heads: AtomicRegion<AtomicU64>,
    counts: AtomicRegion<AtomicU32>,
}

impl OneKeyIndex {
    pub fn new(memory_manager: Arc<MemoryManager>, max_resource_id: u64) -> Self {
        let max_entries = (max_resource_id as usize).saturating_add(1);
        Self {
            heads: AtomicRegion::new(Arc::clone(&memory_manager), max_entries),
            counts: AtomicRegion::new(memory_manager, max_entries),
        }
    }

    /// Drops every entry and pre-allocates `initial_resources` of them.
    pub fn initialize(&mut self, initial_resources: usize) -> bool {
        self.heads.reset();
        self.counts.reset();
        initial_resources == 0
            || (self.heads.ensure_end_at_least(initial_resources)
                && self.counts.ensure_end_at_least(initial_resources))
    }

    /// Makes `resource_id` addressable. Returns false if memory ran out or
    /// the id lies beyond the index's limit.
    #[inline]
    pub fn extend_to_resource_id(&self, resource_id: ResourceId) -> bool {
        let Some(end) = usize::try_from(resource_id.0)
            .ok()
            .and_then(|id| id.checked_add(1))
        else {
            return false;
        };
        self.heads.ensure_end_at_least(end) && self.counts.ensure_end_at_least(end)
    }

    #[inline]
    pub fn head(&self, resource_id: ResourceId) -> TupleIndex {
        let id = resource_id.0 as usize;
        if self.heads.is_before_end(id) {
            TupleIndex(self.heads.load(id, Ordering::Acquire))
        } else {
            TupleIndex::INVALID
        }
    }

    #[inline]
    pub fn set_head(&self, resource_id: ResourceId, index: TupleIndex) {
        self.heads
            .store(resource_id.0 as usize, index.0, Ordering::Release);
    }

    /// Replaces the head if it still equals `expected`.
    #[inline]
    pub fn set_head_conditional(
        &self,
        resource_id: ResourceId,
        expected: TupleIndex,
        index: TupleIndex,
    ) -> bool {
        self.heads
            .compare_exchange(resource_id.0 as usize, expected.0, index.0)
    }

    pub fn triple_count(&self, resource_id: ResourceId) -> usize {
        let id = resource_id.0 as usize;
        if self.counts.is_before_end(id) {
            self.counts.load(id, Ordering::Acquire) as usize
        } else {
            0
        }
    }

    /// Adds to the count and returns the previous value.
    pub fn increment_triple_count(&self, resource_id: ResourceId, amount: u32) -> usize {
        self.counts
            .slot(resource_id.0 as usize)
            .fetch_add(amount, Ordering::AcqRel) as usize
    }

    /// Subtracts from the count and returns the previous value.
    pub fn decrement_triple_count(&self, resource_id: ResourceId, amount: u32) -> usize {
        self.counts
            .slot(resource_id.0 as usize)
            .fetch_sub(amount, Ordering::AcqRel) as usize
    }

    pub fn clear_counts(&self) {
        self.counts.fill(0, self.counts.end(), 0);
    }

    /// Number of addressable resource ids.
    pub fn end(&self) -> usize {
        self.heads.end()
    }

    pub fn save<W: Write>(&self, output: &mut OutputStream<W>) -> Result<()> {
        output.write_string(TAG)?;
        self.heads.save(output, self.heads.end())?;
        self.counts.save(output, self.counts.end())
    }

    pub fn load<R: Read>(&mut self, input: &mut InputStream<R>) -> Result<()> {
        input.expect_tag(TAG)?;
        self.heads.load_from(input)?;
        self.counts.load_from(input)?;
        Ok(())
    }

    pub fn component_statistics(&self) -> ComponentStatistics {
        let end = self.heads.end();
        let mut used_entries = 0u64;
        let mut sum_of_counts = 0u64;
        let mut max_count = 0u64;
        for id in 0..end {
            let resource_id = ResourceId(id as u64);
            if self.head(resource_id).is_valid() {
                used_entries += 1;
                let count = self.triple_count(resource_id) as u64;
                sum_of_counts += count;
                max_count = max_count.max(count);
            }
        }

        let mut statistics = ComponentStatistics::new(TAG);
        statistics.add_integer_item("Size", (end * (8 + 4)) as u64);
        statistics.add_integer_item("Total number of entries", end as u64);
        statistics.add_integer_item("Number of used entries", used_entries);
        statistics.add_integer_item("The sum of all triple counts", sum_of_counts);
        statistics.add_integer_item("Maximum triple count", max_count);
        if used_entries != 0 {
            statistics.add_integer_item(
                "Average triple count",
                (sum_of_counts as f64 / used_entries as f64 + 0.5) as u64,
            );
        }
        statistics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn new_index() -> OneKeyIndex {
        let mut index = OneKeyIndex::new(Arc::new(MemoryManager::unlimited()), 1 << 20);
        assert!(index.initialize(0));
        index
    }

    #[test]
    fn test_unextended_ids_read_as_empty() {
        let index = new_index();
        assert_eq!(index.head(ResourceId(500)), TupleIndex::INVALID);
        assert_eq!(index.triple_count(ResourceId(500)), 0);
    }

    #[test]
    fn test_heads_and_counts() {
        let index = new_index();
        assert!(index.extend_to_resource_id(ResourceId(10)));
        assert!(index.set_head_conditional(ResourceId(10), TupleIndex::INVALID, TupleIndex(3)));
        assert!(!index.set_head_conditional(ResourceId(10), TupleIndex::INVALID, TupleIndex(4)));
        assert_eq!(index.head(ResourceId(10)), TupleIndex(3));

        assert_eq!(index.increment_triple_count(ResourceId(10), 2), 0);
        assert_eq!(index.decrement_triple_count(ResourceId(10), 1), 2);
        assert_eq!(index.triple_count(ResourceId(10)), 1);

        index.clear_counts();
        assert_eq!(index.triple_count(ResourceId(10)), 0);
        assert_eq!(index.head(ResourceId(10)), TupleIndex(3));
    }

    #[test]
    fn test_extend_beyond_limit_fails() {
        let index = OneKeyIndex::new(Arc::new(MemoryManager::unlimited()), 100);
        assert!(index.extend_to_resource_id(ResourceId(100)));
        assert!(!index.extend_to_resource_id(ResourceId(101)));
    }

    #[test]
    fn test_extend_to_largest_id_fails_cleanly() {
        let index = new_index();
        assert!(!index.extend_to_resource_id(ResourceId(u64::MAX)));
        assert!(!index.extend_to_resource_id(ResourceId(u64::MAX - 1)));
        assert_eq!(index.head(ResourceId(u64::MAX)), TupleIndex::INVALID);
        assert_eq!(index.triple_count(ResourceId(u64::MAX)), 0);
    }

    #[test]
    fn test_save_load_and_statistics() {
        let index = new_index();
        for id in 1..=5u64 {
            assert!(index.extend_to_resource_id(ResourceId(id)));
            index.set_head(ResourceId(id), TupleIndex(id));
            index.increment_triple_count(ResourceId(id), id as u32);
        }

        let mut output = OutputStream::new(Vec::new());
        index.save(&mut output).unwrap();
        let bytes = output.finish().unwrap();

        let mut restored = new_index();
        restored
            .load(&mut InputStream::new(Cursor::new(bytes)))
            .unwrap();
        assert_eq!(restored.head(ResourceId(4)), TupleIndex(4));
        assert_eq!(restored.triple_count(ResourceId(5)), 5);

        let statistics = restored.component_statistics();
        assert_eq!(statistics.integer_value("Number of used entries"), 5);
        assert_eq!(statistics.integer_value("The sum of all triple counts"), 15);
        assert_eq!(statistics.integer_value("Maximum triple count"), 5);
        assert_eq!(statistics.integer_value("Average triple count"), 3);
    }
}
