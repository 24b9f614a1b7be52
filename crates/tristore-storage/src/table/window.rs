//! Bulk loading through reserved windows of slots.

use super::{check_triple, links_exhausted_error, TripleTable};
use crate::triple_list::TripleList;
use tracing::warn;
use tristore_common::{ResourceId, Result, StoreError, Triple, TupleIndex, TupleStatus};
use tristore_memory::ThreadContext;

/// Adds triples into consecutive slots reserved in advance.
///
/// Each loader thread owns one; it reserves `window_size` slots at a time
/// and fills them without touching the list's shared counter per triple.
/// A duplicate triple does not consume a slot. Slots left unused when the
/// loader is dropped are written as empty complete slots, which scans skip.
pub struct WindowedLoader<'a> {
    table: &'a TripleTable,
    context: &'a ThreadContext,
    window_size: usize,
    window_start: TupleIndex,
    next: TupleIndex,
    end: TupleIndex,
}

impl<'a> WindowedLoader<'a> {
    pub(crate) fn new(
        table: &'a TripleTable,
        context: &'a ThreadContext,
        window_size: usize,
    ) -> Result<Self> {
        if window_size == 0 {
            return Err(StoreError::InvalidParameter {
                name: "window_size".to_string(),
                value: "0".to_string(),
            });
        }
        let first_free = table.first_free_tuple_index();
        Ok(Self {
            table,
            context,
            window_size,
            window_start: first_free,
            next: first_free,
            end: first_free,
        })
    }

    /// First slot of the current window.
    pub fn window_start(&self) -> TupleIndex {
        self.window_start
    }

    /// Reserved slots not yet filled.
    pub fn remaining(&self) -> usize {
        (self.end.0 - self.next.0) as usize
    }

    /// Same contract as `TripleTable::add_tuple`.
    ///
    /// Once the three keys index holds the slot, the slot is never handed
    /// to another triple, even if linking it fails.
    pub fn add_tuple(
        &mut self,
        triple: &Triple,
        delete_status: TupleStatus,
        add_status: TupleStatus,
    ) -> Result<(bool, TupleIndex)> {
        check_triple(triple)?;
        self.table.reserve_resources(triple)?;
        if self.table.links_exhausted() {
            return Err(links_exhausted_error());
        }
        self.ensure_reservation()?;
        let list = self.table.triple_list();
        list.add_at(self.next, triple);
        let Some((inserted, index)) = self
            .table
            .three_keys
            .insert_triple(self.context, list, self.next)
        else {
            warn!("three keys index cannot grow");
            return Err(StoreError::OutOfMemory(
                "the three keys index is full".to_string(),
            ));
        };
        let complete_status = if inserted {
            self.next = self.next.next();
            self.table.link_new_triple(self.context, index, triple)?;
            TupleStatus::COMPLETE
        } else {
            self.table.check_existing(index)?;
            TupleStatus::INVALID
        };
        Ok((
            self.table
                .update_status(index, delete_status, add_status, complete_status),
            index,
        ))
    }

    fn ensure_reservation(&mut self) -> Result<()> {
        if self.next == self.end {
            let start = self.table.reserve_add_window(self.window_size)?;
            self.window_start = start;
            self.next = start;
            self.end = TupleIndex(start.0 + self.window_size as u64);
        }
        Ok(())
    }

    /// Writes the unused rest of the window as empty complete slots.
    pub fn invalidate_remaining_window(&mut self) {
        let list = self.table.triple_list();
        while self.next < self.end {
            list.add_at(self.next, &[ResourceId::INVALID; 3]);
            list.set_triple_status(self.next, TupleStatus::COMPLETE);
            self.next = self.next.next();
        }
        let first_free = list.first_free_triple_index();
        self.window_start = first_free;
        self.next = first_free;
        self.end = first_free;
    }
}

impl Drop for WindowedLoader<'_> {
    fn drop(&mut self) {
        self.invalidate_remaining_window();
    }
}
