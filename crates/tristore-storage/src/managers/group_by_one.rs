use super::{manager_name, ChainScan, ChainStart};
use crate::one_key_index::OneKeyIndex;
use crate::triple_list::{ConcurrentTripleList, TripleList};
use std::io::{Read, Write};
use std::sync::Arc;
use tristore_common::{
    ComponentStatistics, ResourceComponent, Result, StoreConfig, Triple, TupleIndex, TupleStatus,
};
use tristore_memory::{InputStream, MemoryManager, OutputStream};

const KIND: &str = "TwoKeysManagerGroupByOne";

/// Indexes triples by C1 only; C2 and C3 lookups filter the C1 chain.
pub struct TwoKeysManagerGroupByOne {
    component1: ResourceComponent,
    component2: ResourceComponent,
    component3: ResourceComponent,
    one_key_index: OneKeyIndex,
}

impl TwoKeysManagerGroupByOne {
    pub fn new(
        memory_manager: Arc<MemoryManager>,
        config: &StoreConfig,
        components: [ResourceComponent; 3],
    ) -> Self {
        let [component1, component2, component3] = components;
        Self {
            component1,
            component2,
            component3,
            one_key_index: OneKeyIndex::new(memory_manager, config.max_resource_id),
        }
    }

    pub fn name(&self) -> String {
        manager_name(KIND, self.component1, self.component2)
    }

    pub fn initialize(&mut self, initial_resources: usize) -> bool {
        self.one_key_index
            .initialize(if initial_resources == 0 { 0 } else { initial_resources + 1 })
    }

    pub fn reserve_resource(&self, triple: &Triple) -> bool {
        self.one_key_index
            .extend_to_resource_id(self.component1.of(triple))
    }

    /// Pushes the slot onto its C1 chain. Returns false if memory ran out.
    pub fn insert_triple(
        &self,
        list: &ConcurrentTripleList,
        index: TupleIndex,
        triple: &Triple,
    ) -> bool {
        let value1 = self.component1.of(triple);
        if !self.one_key_index.extend_to_resource_id(value1) {
            return false;
        }
        loop {
            let head = self.one_key_index.head(value1);
            list.set_next(index, self.component1, head);
            if self.one_key_index.set_head_conditional(value1, head, index) {
                break;
            }
        }
        self.one_key_index.increment_triple_count(value1, 1);
        true
    }

    pub fn first_triple_index_1(&self, triple: &Triple) -> ChainStart {
        ChainStart::unfiltered(
            self.one_key_index.head(self.component1.of(triple)),
            self.component1,
        )
    }

    pub fn first_triple_index_12(&self, triple: &Triple) -> ChainStart {
        self.filtered_chain(triple, self.component2)
    }

    pub fn first_triple_index_13(&self, triple: &Triple) -> ChainStart {
        self.filtered_chain(triple, self.component3)
    }

    fn filtered_chain(&self, triple: &Triple, component: ResourceComponent) -> ChainStart {
        ChainStart::filtered(
            self.one_key_index.head(self.component1.of(triple)),
            self.component1,
            component,
            component.of(triple),
            ChainScan::Filtered,
        )
    }

    pub fn count_estimate_1(&self, triple: &Triple) -> usize {
        self.one_key_index.triple_count(self.component1.of(triple))
    }

    pub fn count_estimate_12(&self, triple: &Triple) -> usize {
        self.count_estimate_1(triple)
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

    pub fn save<W: Write>(&self, output: &mut OutputStream<W>) -> Result<()> {
        output.write_string(&self.name())?;
        self.one_key_index.save(output)
    }

    pub fn load<R: Read>(&mut self, input: &mut InputStream<R>) -> Result<()> {
        input.expect_tag(&self.name())?;
        self.one_key_index.load(input)
    }

    pub fn component_statistics(&self, list: &ConcurrentTripleList) -> ComponentStatistics {
        let one_key_statistics = self.one_key_index.component_statistics();
        let aggregate_size = one_key_statistics.integer_value("Size");
        let mut statistics = ComponentStatistics::new(self.name());
        statistics.add_integer_item("Aggregate size", aggregate_size);
        let triple_count = list.exact_triple_count(TupleStatus::COMPLETE, TupleStatus::COMPLETE);
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::thread;
    use tristore_common::ResourceId;

    const POS: [ResourceComponent; 3] = [
        ResourceComponent::P,
        ResourceComponent::O,
        ResourceComponent::S,
    ];

    fn triple(s: u64, p: u64, o: u64) -> Triple {
        [ResourceId(s), ResourceId(p), ResourceId(o)]
    }

    fn setup() -> (ConcurrentTripleList, TwoKeysManagerGroupByOne) {
        let memory_manager = Arc::new(MemoryManager::unlimited());
        let mut list = ConcurrentTripleList::new(Arc::clone(&memory_manager), 1 << 20);
        assert!(list.initialize(0));
        let mut manager =
            TwoKeysManagerGroupByOne::new(memory_manager, &StoreConfig::for_testing(), POS);
        assert!(manager.initialize(0));
        (list, manager)
    }

    fn chain_len(list: &ConcurrentTripleList, start: ChainStart) -> usize {
        let mut count = 0;
        let mut index = start.head;
        while index.is_valid() {
            let t = list.resource_ids(index);
            if start
                .filter
                .map_or(true, |filter| filter.component.of(&t) == filter.value)
            {
                count += 1;
            }
            index = list.next(index, start.chain);
        }
        count
    }

    #[test]
    fn test_chain_and_filters() {
        let (list, manager) = setup();
        for t in [triple(1, 5, 2), triple(3, 5, 2), triple(1, 5, 4), triple(1, 6, 2)] {
            let index = list.add(&t);
            assert!(manager.insert_triple(&list, index, &t));
        }
        assert_eq!(manager.name(), "TwoKeysManagerGroupByOne[P.O]");
        assert_eq!(chain_len(&list, manager.first_triple_index_1(&triple(0, 5, 0))), 3);
        assert_eq!(chain_len(&list, manager.first_triple_index_12(&triple(0, 5, 2))), 2);
        assert_eq!(chain_len(&list, manager.first_triple_index_13(&triple(1, 5, 0))), 2);
        assert_eq!(manager.count_estimate_12(&triple(0, 5, 2)), 3);
        assert_eq!(manager.first_triple_index_1(&triple(0, 9, 0)).head, TupleIndex::INVALID);
    }

    #[test]
    fn test_concurrent_pushes_lose_nothing() {
        let (list, manager) = setup();
        thread::scope(|scope| {
            for thread_index in 0..4u64 {
                let (list, manager) = (&list, &manager);
                scope.spawn(move || {
                    for i in 0..2_500u64 {
                        let t = triple(thread_index * 10_000 + i + 1, 7, 1);
                        let index = list.add(&t);
                        assert!(manager.insert_triple(list, index, &t));
                    }
                });
            }
        });
        assert_eq!(chain_len(&list, manager.first_triple_index_1(&triple(0, 7, 0))), 10_000);
        assert_eq!(manager.count_estimate_1(&triple(0, 7, 0)), 10_000);
    }

    #[test]
    fn test_save_load() {
        let (list, manager) = setup();
        for s in 1..=5u64 {
            let t = triple(s, 2, 3);
            let index = list.add(&t);
            manager.insert_triple(&list, index, &t);
            list.set_triple_status(index, TupleStatus::COMPLETE);
        }
        let mut output = OutputStream::new(Vec::new());
        manager.save(&mut output).unwrap();
        let bytes = output.finish().unwrap();

        let (_, mut restored) = setup();
        restored
            .load(&mut InputStream::new(Cursor::new(bytes)))
            .unwrap();
        assert_eq!(chain_len(&list, restored.first_triple_index_1(&triple(0, 2, 0))), 5);
        let statistics = restored.component_statistics(&list);
        assert!(statistics.integer_value("Aggregate size") > 0);
        assert!(statistics.float_value("Bytes per triple").is_some());
    }
}
