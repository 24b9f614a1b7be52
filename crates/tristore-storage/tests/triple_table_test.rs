//! Integration tests for the triple table.
//!
//! Covers the concurrency contracts of the storage layer end to end:
//! - Concurrent inserts of distinct triples all become visible
//! - Concurrent inserts of one triple store it once
//! - Status compare-and-swap never loses an update
//! - (S, P) groups enumerate exactly their triples
//! - Save/load through a real file reproduces every slot
//! - Truncation clears exactly the truncated slots

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::tempdir;

use tristore_common::{
    ResourceId, StoreConfig, StoreError, Triple, TupleIndex, TupleStatus,
};
use tristore_memory::{InputStream, MemoryManager, OutputStream, ThreadContextRegistry};
use tristore_storage::{ConcurrentTripleList, PatternTerm, TripleList, TriplePattern, TripleTable};

const THREADS: usize = 8;

fn triple(s: u64, p: u64, o: u64) -> Triple {
    [ResourceId(s), ResourceId(p), ResourceId(o)]
}

fn bound(id: u64) -> PatternTerm {
    PatternTerm::Bound(ResourceId(id))
}

fn var(variable: u8) -> PatternTerm {
    PatternTerm::Variable(variable)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn new_table(config: StoreConfig) -> (ThreadContextRegistry, Arc<TripleTable>) {
    init_tracing();
    let registry = ThreadContextRegistry::new(config.max_objects);
    let table = TripleTable::new(Arc::new(MemoryManager::unlimited()), &registry, config)
        .expect("table builds");
    (registry, Arc::new(table))
}

fn sorted_matches(
    table: &TripleTable,
    registry: &ThreadContextRegistry,
    pattern: TriplePattern,
) -> Vec<Triple> {
    let context = registry.register().unwrap();
    let mut triples: Vec<Triple> = table
        .query(&context, pattern, TupleStatus::INVALID, TupleStatus::INVALID)
        .map(|found| found.triple)
        .collect();
    triples.sort();
    triples
}

// =============================================================================
// Concurrent inserts
// =============================================================================

#[test]
fn test_concurrent_distinct_inserts_all_visible() {
    const PER_THREAD: u64 = 5_000;
    let config = StoreConfig {
        number_of_threads: THREADS,
        ..StoreConfig::for_testing()
    };
    let (registry, table) = new_table(config);

    let handles: Vec<_> = (0..THREADS as u64)
        .map(|thread_index| {
            let registry = registry.clone();
            let table = Arc::clone(&table);
            thread::spawn(move || {
                let context = registry.register().unwrap();
                let mut rng = StdRng::seed_from_u64(thread_index);
                let mut triples: Vec<Triple> = (0..PER_THREAD)
                    .map(|i| triple(thread_index * PER_THREAD + i + 1, i % 13 + 1, i % 101 + 1))
                    .collect();
                triples.shuffle(&mut rng);
                for t in &triples {
                    let (added, index) = table
                        .add_tuple(&context, t, TupleStatus::INVALID, TupleStatus::EDB)
                        .unwrap();
                    assert!(added);
                    assert!(index.is_valid());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let expected = THREADS * PER_THREAD as usize;
    assert_eq!(
        table.tuple_count(TupleStatus::COMPLETE, TupleStatus::COMPLETE),
        expected
    );
    assert_eq!(table.approximate_tuple_count(), expected);

    let context = registry.register().unwrap();
    for thread_index in 0..THREADS as u64 {
        for i in (0..PER_THREAD).step_by(97) {
            let t = triple(thread_index * PER_THREAD + i + 1, i % 13 + 1, i % 101 + 1);
            let index = table.get_tuple_index(&context, &t);
            assert!(index.is_valid(), "missing {:?}", t);
            assert_eq!(
                table
                    .query(
                        &context,
                        TriplePattern::from_triple(&t),
                        TupleStatus::INVALID,
                        TupleStatus::INVALID
                    )
                    .count(),
                1
            );
        }
    }
    assert_eq!(
        table
            .query(
                &context,
                TriplePattern::new(var(0), bound(1), var(2)),
                TupleStatus::EDB,
                TupleStatus::EDB
            )
            .count(),
        table.count_estimate(&context, &TriplePattern::new(var(0), bound(1), var(2)))
    );
}

#[test]
fn test_same_triple_from_many_threads() {
    let (registry, table) = new_table(StoreConfig::for_testing());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let registry = registry.clone();
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let context = registry.register().unwrap();
                barrier.wait();
                table
                    .add_tuple(&context, &triple(5, 6, 7), TupleStatus::INVALID, TupleStatus::EDB)
                    .unwrap()
            })
        })
        .collect();
    let results: Vec<(bool, TupleIndex)> =
        handles.into_iter().map(|handle| handle.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|(added, _)| *added).count(), 1);
    let index = results[0].1;
    assert!(results.iter().all(|(_, other)| *other == index));
    assert_eq!(table.approximate_tuple_count(), 1);
    assert_eq!(
        table.get_tuple_status(index),
        TupleStatus::EDB | TupleStatus::COMPLETE
    );
}

#[test]
fn test_mixed_duplicates_store_each_triple_once() {
    let (registry, table) = new_table(StoreConfig::for_testing());
    let handles: Vec<_> = (0..THREADS as u64)
        .map(|thread_index| {
            let registry = registry.clone();
            let table = Arc::clone(&table);
            thread::spawn(move || {
                let context = registry.register().unwrap();
                let mut rng = StdRng::seed_from_u64(100 + thread_index);
                let mut newly_added = 0usize;
                for _ in 0..4_000 {
                    let t = triple(rng.gen_range(1..=40), rng.gen_range(1..=5), rng.gen_range(1..=10));
                    let (added, _) = table
                        .add_tuple(&context, &t, TupleStatus::INVALID, TupleStatus::EDB)
                        .unwrap();
                    newly_added += usize::from(added);
                }
                newly_added
            })
        })
        .collect();
    let newly_added: usize = handles.into_iter().map(|handle| handle.join().unwrap()).sum();

    let stored = table.tuple_count(TupleStatus::COMPLETE, TupleStatus::COMPLETE);
    assert_eq!(newly_added, stored);
    assert_eq!(table.approximate_tuple_count(), stored);
    let distinct: HashSet<Triple> = sorted_matches(&table, &registry, TriplePattern::all())
        .into_iter()
        .collect();
    assert_eq!(distinct.len(), stored);
}

// =============================================================================
// Status updates
// =============================================================================

#[test]
fn test_status_cas_under_contention() {
    let (registry, table) = new_table(StoreConfig::for_testing());
    let context = registry.register().unwrap();
    let (_, index) = table
        .add_tuple(&context, &triple(1, 1, 1), TupleStatus::INVALID, TupleStatus::EDB)
        .unwrap();
    drop(context);

    let from = TupleStatus::EDB | TupleStatus::COMPLETE;
    let to = TupleStatus::EDB | TupleStatus::IDB | TupleStatus::COMPLETE;
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                table.set_tuple_status_conditional(index, from, to)
            })
        })
        .collect();
    let winners = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);
    assert_eq!(table.get_tuple_status(index), to);
    assert!(!table.set_tuple_status_conditional(index, from, TupleStatus::COMPLETE));

    // Concurrent bit additions must all survive.
    let bits = [
        TupleStatus::EDB_DEL,
        TupleStatus::EDB_INS,
        TupleStatus::IDB_MERGED,
    ];
    let handles: Vec<_> = bits
        .iter()
        .map(|bit| {
            let table = Arc::clone(&table);
            let bit = *bit;
            thread::spawn(move || {
                for _ in 0..1_000 {
                    table.add_tuple_status(index, bit);
                    table.delete_tuple_status(index, bit);
                }
                table.add_tuple_status(index, bit)
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap());
    }
    assert_eq!(
        table.get_tuple_status(index),
        to | TupleStatus::EDB_DEL | TupleStatus::EDB_INS | TupleStatus::IDB_MERGED
    );
}

// =============================================================================
// Chain completeness
// =============================================================================

#[test]
fn test_grouped_chains_enumerate_exactly_their_triples() {
    let (registry, table) = new_table(StoreConfig::for_testing());
    let mut rng = StdRng::seed_from_u64(7);
    let mut all: Vec<Triple> = (0..6_000)
        .map(|_| triple(rng.gen_range(1..=30), rng.gen_range(1..=8), rng.gen_range(1..=500)))
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    all.shuffle(&mut rng);

    let chunks: Vec<Vec<Triple>> = all.chunks(all.len() / 4 + 1).map(<[Triple]>::to_vec).collect();
    let handles: Vec<_> = chunks
        .into_iter()
        .map(|chunk| {
            let registry = registry.clone();
            let table = Arc::clone(&table);
            thread::spawn(move || {
                let context = registry.register().unwrap();
                for t in &chunk {
                    table
                        .add_tuple(&context, t, TupleStatus::INVALID, TupleStatus::EDB)
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut by_sp: HashMap<(ResourceId, ResourceId), Vec<Triple>> = HashMap::new();
    let mut by_op: HashMap<(ResourceId, ResourceId), Vec<Triple>> = HashMap::new();
    for t in &all {
        by_sp.entry((t[0], t[1])).or_default().push(*t);
        by_op.entry((t[2], t[1])).or_default().push(*t);
    }
    for ((s, p), mut expected) in by_sp {
        expected.sort();
        let found = sorted_matches(
            &table,
            &registry,
            TriplePattern::new(PatternTerm::Bound(s), PatternTerm::Bound(p), var(2)),
        );
        assert_eq!(found, expected, "group ({}, {})", s, p);
    }
    for ((o, p), mut expected) in by_op.into_iter().take(200) {
        expected.sort();
        let found = sorted_matches(
            &table,
            &registry,
            TriplePattern::new(var(0), PatternTerm::Bound(p), PatternTerm::Bound(o)),
        );
        assert_eq!(found, expected, "group ({}, {})", o, p);
    }
}

#[test]
fn test_end_to_end_scenario() {
    let (registry, table) = new_table(StoreConfig::for_testing());
    let context = registry.register().unwrap();
    for t in [triple(1, 2, 3), triple(1, 2, 7), triple(2, 2, 3), triple(1, 4, 5)] {
        table
            .add_tuple(&context, &t, TupleStatus::INVALID, TupleStatus::EDB)
            .unwrap();
    }

    assert_eq!(
        sorted_matches(&table, &registry, TriplePattern::new(bound(1), var(1), var(2))),
        vec![triple(1, 2, 3), triple(1, 2, 7), triple(1, 4, 5)]
    );
    assert_eq!(
        sorted_matches(&table, &registry, TriplePattern::new(bound(1), bound(2), var(2))),
        vec![triple(1, 2, 3), triple(1, 2, 7)]
    );
    assert!(sorted_matches(&table, &registry, TriplePattern::new(bound(7), var(1), var(2)))
        .is_empty());
}

// =============================================================================
// Persistence
// =============================================================================

#[test]
fn test_save_load_through_file() {
    let (registry, table) = new_table(StoreConfig::for_testing());
    let mut table = Arc::try_unwrap(table).ok().expect("sole owner");
    let context = registry.register().unwrap();
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..3_000 {
        let t = triple(rng.gen_range(1..=200), rng.gen_range(1..=10), rng.gen_range(1..=200));
        let status = if rng.gen_bool(0.5) {
            TupleStatus::EDB
        } else {
            TupleStatus::IDB
        };
        table
            .add_tuple(&context, &t, TupleStatus::INVALID, status)
            .unwrap();
    }

    let dir = tempdir().unwrap();
    let path = dir.path().join("triples.dat");
    let mut output = OutputStream::new(BufWriter::new(File::create(&path).unwrap()));
    table.save(&mut output).unwrap();
    output.finish().unwrap();

    let (restored_registry, restored) = new_table(StoreConfig::for_testing());
    let mut restored = Arc::try_unwrap(restored).ok().expect("sole owner");
    let mut input = InputStream::new(BufReader::new(File::open(&path).unwrap()));
    restored.load(&mut input).unwrap();

    assert_eq!(restored.first_free_tuple_index(), table.first_free_tuple_index());
    let mut index = TupleIndex::FIRST;
    while index < table.first_free_tuple_index() {
        assert_eq!(
            restored.get_status_and_tuple_if_complete(index),
            table.get_status_and_tuple_if_complete(index)
        );
        assert_eq!(
            restored.triple_list().next_triple_index(index),
            table.triple_list().next_triple_index(index)
        );
        index = index.next();
    }
    for s in [1, 50, 199] {
        let pattern = TriplePattern::new(bound(s), var(1), var(2));
        assert_eq!(
            sorted_matches(&restored, &restored_registry, pattern),
            sorted_matches(&table, &registry, pattern)
        );
    }

    // The restored table keeps accepting inserts.
    let restored_context = restored_registry.register().unwrap();
    let (added, index) = restored
        .add_tuple(&restored_context, &triple(999, 1, 1), TupleStatus::INVALID, TupleStatus::EDB)
        .unwrap();
    assert!(added);
    assert_eq!(index, table.first_free_tuple_index());
}

#[test]
fn test_truncate_is_exact() {
    let list = ConcurrentTripleList::new(Arc::new(MemoryManager::unlimited()), 1 << 16);
    for s in 1..=20u64 {
        let index = list.add(&triple(s, 2, 3));
        list.set_triple_status(index, TupleStatus::COMPLETE | TupleStatus::EDB);
    }
    list.truncate(TupleIndex(8));

    assert_eq!(list.first_free_triple_index(), TupleIndex(8));
    assert_eq!(
        list.exact_triple_count(TupleStatus::COMPLETE, TupleStatus::COMPLETE),
        7
    );
    for slot in 8..=20u64 {
        let index = TupleIndex(slot);
        assert_eq!(list.triple_status(index), TupleStatus::INVALID);
        assert_eq!(list.resource_ids(index), [ResourceId::INVALID; 3]);
    }
    assert_eq!(list.add(&triple(50, 2, 3)), TupleIndex(8));
}

// =============================================================================
// Resource limits and configuration
// =============================================================================

#[test]
fn test_capacity_exhaustion_is_reported() {
    let config = StoreConfig {
        max_triple_capacity: 10,
        ..StoreConfig::for_testing()
    };
    let (registry, table) = new_table(config);
    let context = registry.register().unwrap();
    for s in 1..=10u64 {
        table
            .add_tuple(&context, &triple(s, 1, 1), TupleStatus::INVALID, TupleStatus::EDB)
            .unwrap();
    }
    for _ in 0..2 {
        let result =
            table.add_tuple(&context, &triple(11, 1, 1), TupleStatus::INVALID, TupleStatus::EDB);
        assert!(matches!(result, Err(StoreError::OutOfMemory(_))));
    }
    assert_eq!(table.approximate_tuple_count(), 10);
    assert_eq!(
        table.get_tuple_index(&context, &triple(11, 1, 1)),
        TupleIndex::INVALID
    );
    let (added, _) = table
        .add_tuple(&context, &triple(3, 1, 1), TupleStatus::INVALID, TupleStatus::IDB)
        .unwrap();
    assert!(added);
    assert!(matches!(
        table.reserve_add_window(4),
        Err(StoreError::OutOfMemory(_))
    ));
}

#[test]
fn test_ids_beyond_the_limit_never_corrupt_the_indexes() {
    let config = StoreConfig {
        max_resource_id: 100,
        ..StoreConfig::for_testing()
    };
    let (registry, table) = new_table(config);
    let context = registry.register().unwrap();
    table
        .add_tuple(&context, &triple(1, 2, 3), TupleStatus::INVALID, TupleStatus::EDB)
        .unwrap();

    for bad in [triple(1, 2, 500), triple(101, 2, 3), triple(1, 2, u64::MAX)] {
        for _ in 0..2 {
            let result = table.add_tuple(&context, &bad, TupleStatus::INVALID, TupleStatus::EDB);
            assert!(matches!(result, Err(StoreError::OutOfMemory(_))));
        }
        assert_eq!(table.get_tuple_index(&context, &bad), TupleIndex::INVALID);
    }
    {
        let mut loader = table.windowed_loader(&context, 8).unwrap();
        for _ in 0..2 {
            let result = loader.add_tuple(&triple(4, 2, 700), TupleStatus::INVALID, TupleStatus::EDB);
            assert!(matches!(result, Err(StoreError::OutOfMemory(_))));
        }
        let (added, index) = loader
            .add_tuple(&triple(4, 2, 5), TupleStatus::INVALID, TupleStatus::EDB)
            .unwrap();
        assert!(added);
        assert_eq!(
            table.get_status_and_tuple_if_complete(index),
            (TupleStatus::EDB | TupleStatus::COMPLETE, Some(triple(4, 2, 5)))
        );
    }

    // Every stored slot holds the triple its lookups resolve to.
    let stored = sorted_matches(&table, &registry, TriplePattern::all());
    assert_eq!(stored, vec![triple(1, 2, 3), triple(4, 2, 5)]);
    for t in &stored {
        let index = table.get_tuple_index(&context, t);
        assert_eq!(table.triple_list().resource_ids(index), *t);
    }
    assert_eq!(
        sorted_matches(&table, &registry, TriplePattern::new(var(0), bound(2), var(2))),
        stored
    );
    assert_eq!(
        sorted_matches(&table, &registry, TriplePattern::new(bound(1), var(1), var(2))),
        vec![triple(1, 2, 3)]
    );
    assert_eq!(
        table.tuple_count(TupleStatus::COMPLETE, TupleStatus::COMPLETE),
        2
    );
}

#[test]
fn test_config_round_trips_through_json() {
    let config = StoreConfig {
        initial_triple_capacity: 4096,
        hash_table_initial_size: 2048,
        ..StoreConfig::for_testing()
    };
    let json = serde_json::to_string_pretty(&config).unwrap();
    let parsed: StoreConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.initial_triple_capacity, 4096);
    assert_eq!(parsed.hash_table_initial_size, 2048);

    let (registry, table) = new_table(parsed);
    let context = registry.register().unwrap();
    table
        .add_tuple(&context, &triple(1, 2, 3), TupleStatus::INVALID, TupleStatus::EDB)
        .unwrap();
    assert_eq!(table.config().hash_table_initial_size, 2048);
    assert_eq!(
        table.count_estimate(&context, &TriplePattern::new(var(0), bound(2), var(2))),
        1
    );
}
