//! Index managers layered over one `ConcurrentTripleList`.
//!
//! Each component's next pointer belongs to exactly one manager:
//! - `TwoKeysManagerGroupByTwo`: one-key index on C1, hash table on (C1, C2);
//!   triples sharing (C1, C2) sit next to each other in the C1 chain
//! - `TwoKeysManagerGroupByOne`: one-key index on C1 only
//! - `ThreeKeysManager`: hash table on the whole triple, no chain

mod group_by_one;
mod group_by_two;
mod three_keys;

pub use group_by_one::TwoKeysManagerGroupByOne;
pub use group_by_two::TwoKeysManagerGroupByTwo;
pub use three_keys::{InsertToken, ThreeKeysManager};

use tristore_common::{ResourceComponent, ResourceId, TupleIndex};

/// How a chain walk treats slots whose compared component differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainScan {
    /// Matching slots are contiguous; the walk ends at the first mismatch.
    Grouped,
    /// Matching slots are spread over the chain; mismatches are skipped.
    Filtered,
}

/// Restricts a chain walk to slots holding `value` in `component`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainFilter {
    pub component: ResourceComponent,
    pub value: ResourceId,
    pub scan: ChainScan,
}

/// Where a keyed lookup starts walking and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainStart {
    pub head: TupleIndex,
    /// Component whose next pointer links the chain.
    pub chain: ResourceComponent,
    pub filter: Option<ChainFilter>,
}

impl ChainStart {
    pub(crate) fn unfiltered(head: TupleIndex, chain: ResourceComponent) -> Self {
        Self {
            head,
            chain,
            filter: None,
        }
    }

    pub(crate) fn filtered(
        head: TupleIndex,
        chain: ResourceComponent,
        component: ResourceComponent,
        value: ResourceId,
        scan: ChainScan,
    ) -> Self {
        Self {
            head,
            chain,
            filter: Some(ChainFilter {
                component,
                value,
                scan,
            }),
        }
    }
}

/// Name shared by reports and save tags, e.g. `TwoKeysManagerGroupByTwo[S.P]`.
pub(crate) fn manager_name(
    kind: &str,
    component1: ResourceComponent,
    component2: ResourceComponent,
) -> String {
    format!("{}[{}.{}]", kind, component1, component2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_name() {
        assert_eq!(
            manager_name(
                "TwoKeysManagerGroupByTwo",
                ResourceComponent::O,
                ResourceComponent::P
            ),
            "TwoKeysManagerGroupByTwo[O.P]"
        );
    }
}
