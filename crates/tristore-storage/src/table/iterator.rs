//! Restartable iteration over the triples matching a pattern.

use super::pattern::TriplePattern;
use super::sequential::SequentialTripleTable;
use super::TripleTable;
use crate::managers::{ChainFilter, ChainScan, ChainStart};
use crate::triple_list::TripleList;
use tristore_common::{ResourceComponent, Triple, TupleIndex, TupleStatus};
use tristore_memory::ThreadContext;

/// One triple produced by a `TripleIterator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TripleMatch {
    pub index: TupleIndex,
    pub triple: Triple,
    pub status: TupleStatus,
}

/// Entry point chosen for a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    /// Walk a next-pointer chain.
    Chain(ChainStart),
    /// At most one slot can match.
    Single(TupleIndex),
    /// Visit every complete slot of the list.
    Scan,
}

/// Table a `TripleIterator` reads from.
#[derive(Clone, Copy)]
enum Source<'a> {
    Concurrent {
        table: &'a TripleTable,
        context: &'a ThreadContext,
    },
    Sequential(&'a SequentialTripleTable),
}

impl<'a> Source<'a> {
    fn route(&self, pattern: &TriplePattern) -> Route {
        match *self {
            Source::Concurrent { table, context } => table.route(context, pattern),
            Source::Sequential(table) => table.route(pattern),
        }
    }

    fn list(&self) -> &'a dyn TripleList {
        match *self {
            Source::Concurrent { table, .. } => table.triple_list(),
            Source::Sequential(table) => table.triple_list(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Position {
    Chain {
        current: TupleIndex,
        chain: ResourceComponent,
        filter: Option<ChainFilter>,
    },
    Single(TupleIndex),
    Scan(TupleIndex),
    Done,
}

/// Iterator over complete triples matching a pattern and a status filter.
///
/// Created by `TripleTable::query` or `SequentialTripleTable::query`, which
/// open it; `open` rewinds it to the first match, re-reading the indexes.
/// Not shared across threads.
pub struct TripleIterator<'a> {
    source: Source<'a>,
    pattern: TriplePattern,
    mask: TupleStatus,
    expected: TupleStatus,
    position: Position,
}

impl<'a> TripleIterator<'a> {
    pub(crate) fn concurrent(
        table: &'a TripleTable,
        context: &'a ThreadContext,
        pattern: TriplePattern,
        mask: TupleStatus,
        expected: TupleStatus,
    ) -> Self {
        Self::new(Source::Concurrent { table, context }, pattern, mask, expected)
    }

    pub(crate) fn sequential(
        table: &'a SequentialTripleTable,
        pattern: TriplePattern,
        mask: TupleStatus,
        expected: TupleStatus,
    ) -> Self {
        Self::new(Source::Sequential(table), pattern, mask, expected)
    }

    fn new(
        source: Source<'a>,
        pattern: TriplePattern,
        mask: TupleStatus,
        expected: TupleStatus,
    ) -> Self {
        let mut iterator = Self {
            source,
            pattern,
            mask,
            expected,
            position: Position::Done,
        };
        iterator.open();
        iterator
    }

    /// Restarts the iteration from the first matching triple.
    pub fn open(&mut self) {
        self.position = match self.source.route(&self.pattern) {
            Route::Chain(start) => Position::Chain {
                current: start.head,
                chain: start.chain,
                filter: start.filter,
            },
            Route::Single(index) => Position::Single(index),
            Route::Scan => Position::Scan(self.source.list().first_triple_index()),
        };
    }

    pub fn pattern(&self) -> &TriplePattern {
        &self.pattern
    }

    fn accept(&self, index: TupleIndex, triple: Triple) -> Option<TripleMatch> {
        let status = self.source.list().triple_status(index);
        (status.is_complete()
            && status.matches(self.mask, self.expected)
            && self.pattern.matches(&triple))
        .then_some(TripleMatch {
            index,
            triple,
            status,
        })
    }
}

impl Iterator for TripleIterator<'_> {
    type Item = TripleMatch;

    fn next(&mut self) -> Option<TripleMatch> {
        let list = self.source.list();
        loop {
            match self.position {
                Position::Done => return None,
                Position::Single(index) => {
                    self.position = Position::Done;
                    if !index.is_valid() {
                        return None;
                    }
                    return self.accept(index, list.resource_ids(index));
                }
                Position::Scan(current) => {
                    if !current.is_valid() {
                        self.position = Position::Done;
                        return None;
                    }
                    self.position = Position::Scan(list.next_triple_index(current));
                    if let Some(found) = self.accept(current, list.resource_ids(current)) {
                        return Some(found);
                    }
                }
                Position::Chain {
                    current,
                    chain,
                    filter,
                } => {
                    if !current.is_valid() {
                        self.position = Position::Done;
                        return None;
                    }
                    let triple = list.resource_ids(current);
                    if let Some(filter) = filter {
                        if filter.component.of(&triple) != filter.value
                            && filter.scan == ChainScan::Grouped
                        {
                            self.position = Position::Done;
                            return None;
                        }
                    }
                    self.position = Position::Chain {
                        current: list.next(current, chain),
                        chain,
                        filter,
                    };
                    if let Some(found) = self.accept(current, triple) {
                        return Some(found);
                    }
                }
            }
        }
    }
}
