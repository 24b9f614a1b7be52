//! Identifier and status types shared by every tristore layer.
//!
//! - `ResourceId`: interned RDF term identifier
//! - `TupleIndex`: slot handle into a triple list
//! - `TupleStatus`: per-slot visibility/provenance bitmask
//! - `ResourceComponent`: subject/predicate/object position selector

use serde::{Deserialize, Serialize};
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

/// Interned identifier of an RDF term.
///
/// Ids are handed out by an external dictionary; the storage layer only
/// compares and hashes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ResourceId(pub u64);

impl ResourceId {
    /// Reserved id that never names a term.
    pub const INVALID: ResourceId = ResourceId(0);

    /// Returns true if this id names a term.
    #[inline(always)]
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// A stored triple, indexed by `ResourceComponent`.
pub type Triple = [ResourceId; 3];

/// Handle of one slot in a triple list.
///
/// Slot 0 is never written, so `TupleIndex::INVALID` doubles as the
/// end-of-chain marker in next-pointer traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct TupleIndex(pub u64);

impl TupleIndex {
    /// Absent tuple / end of chain.
    pub const INVALID: TupleIndex = TupleIndex(0);

    /// First slot a triple list hands out.
    pub const FIRST: TupleIndex = TupleIndex(1);

    /// Returns true if this is a real slot handle.
    #[inline(always)]
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    /// Returns the slot as an array offset.
    #[inline(always)]
    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }

    /// Returns the following slot.
    #[inline(always)]
    pub fn next(&self) -> TupleIndex {
        TupleIndex(self.0 + 1)
    }
}

impl std::fmt::Display for TupleIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tuple:{}", self.0)
    }
}

/// Bitmask describing a slot's visibility and provenance.
///
/// Several bits may be set at once; a fact can be both explicit and derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TupleStatus(pub u8);

impl TupleStatus {
    /// Slot absent, never written, or fully retracted.
    pub const INVALID: TupleStatus = TupleStatus(0x00);
    /// Explicit fact scheduled for deletion.
    pub const EDB_DEL: TupleStatus = TupleStatus(0x04);
    /// Explicit fact scheduled for insertion.
    pub const EDB_INS: TupleStatus = TupleStatus(0x08);
    /// Explicit (asserted) fact.
    pub const EDB: TupleStatus = TupleStatus(0x10);
    /// Derived fact.
    pub const IDB: TupleStatus = TupleStatus(0x20);
    /// Derived fact folded in by equality reasoning.
    pub const IDB_MERGED: TupleStatus = TupleStatus(0x40);
    /// Slot fully written and visible to queries.
    pub const COMPLETE: TupleStatus = TupleStatus(0x80);

    /// Returns true if every bit of `other` is set.
    #[inline(always)]
    pub fn contains(&self, other: TupleStatus) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if `(self & mask) == expected`.
    #[inline(always)]
    pub fn matches(&self, mask: TupleStatus, expected: TupleStatus) -> bool {
        self.0 & mask.0 == expected.0
    }

    /// Returns true if the slot has been published.
    #[inline(always)]
    pub fn is_complete(&self) -> bool {
        self.contains(Self::COMPLETE)
    }
}

impl BitOr for TupleStatus {
    type Output = TupleStatus;

    fn bitor(self, rhs: TupleStatus) -> TupleStatus {
        TupleStatus(self.0 | rhs.0)
    }
}

impl BitOrAssign for TupleStatus {
    fn bitor_assign(&mut self, rhs: TupleStatus) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for TupleStatus {
    type Output = TupleStatus;

    fn bitand(self, rhs: TupleStatus) -> TupleStatus {
        TupleStatus(self.0 & rhs.0)
    }
}

impl BitAndAssign for TupleStatus {
    fn bitand_assign(&mut self, rhs: TupleStatus) {
        self.0 &= rhs.0;
    }
}

impl Not for TupleStatus {
    type Output = TupleStatus;

    fn not(self) -> TupleStatus {
        TupleStatus(!self.0)
    }
}

impl std::fmt::Display for TupleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Position of a resource within a triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResourceComponent {
    S = 0,
    P = 1,
    O = 2,
}

impl ResourceComponent {
    /// All components in storage order.
    pub const ALL: [ResourceComponent; 3] = [
        ResourceComponent::S,
        ResourceComponent::P,
        ResourceComponent::O,
    ];

    /// Returns the component's offset within a slot.
    #[inline(always)]
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Returns the single-letter name used in tags and reports.
    pub fn name(&self) -> &'static str {
        match self {
            ResourceComponent::S => "S",
            ResourceComponent::P => "P",
            ResourceComponent::O => "O",
        }
    }

    /// Extracts this component from a triple.
    #[inline(always)]
    pub fn of(&self, triple: &Triple) -> ResourceId {
        triple[self.index()]
    }
}

impl std::fmt::Display for ResourceComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
