//! Points-to sets as computed by a preceding pointer analysis.

use crate::prelude::*;
use derive_more::Deref;
use itertools::Itertools;
use petgraph::graph::NodeIndex;
use std::collections::BTreeSet;

/// A byte offset into a pointed-to memory object.
pub type Offset = u64;

/// A single entry of a points-to set.
///
/// Next to real pointer targets there are two sentinel values:
/// a pointer may be null
/// or it may reference an object whose lifetime has already ended.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub enum PointerTarget {
    /// The pointer may reference the object allocated at the given node,
    /// at the given byte offset into the object.
    Target {
        /// The allocation node of the referenced object.
        node: NodeIndex,
        /// The byte offset into the referenced object.
        offset: Offset,
    },
    /// The pointer may be null.
    Null,
    /// The pointer may reference an object whose lifetime has ended.
    Invalidated,
}

/// The set of values a pointer may hold at a program point.
///
/// The set is ordered so that iteration is deterministic.
/// Entries for the same target node may occur with several offsets;
/// the membership and removal operations below ignore the offset component,
/// since invalidating an object invalidates all pointers into it.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default, Deref)]
pub struct PointsToSet(BTreeSet<PointerTarget>);

impl PointsToSet {
    /// Create an empty points-to set.
    pub fn new() -> PointsToSet {
        PointsToSet(BTreeSet::new())
    }

    /// Insert an entry into the set.
    /// Returns whether the set changed.
    pub fn insert(&mut self, entry: PointerTarget) -> bool {
        self.0.insert(entry)
    }

    /// Insert a real pointer target into the set.
    /// Returns whether the set changed.
    pub fn insert_target(&mut self, node: NodeIndex, offset: Offset) -> bool {
        self.0.insert(PointerTarget::Target { node, offset })
    }

    /// Return whether the set contains the given target node at any offset.
    pub fn points_to_target(&self, node: NodeIndex) -> bool {
        self.0
            .iter()
            .any(|entry| matches!(entry, PointerTarget::Target { node: n, .. } if *n == node))
    }

    /// Remove all entries referencing the given target node, regardless of their offsets.
    /// Returns whether anything was removed.
    pub fn remove_target(&mut self, node: NodeIndex) -> bool {
        let size_before = self.0.len();
        self.0
            .retain(|entry| !matches!(entry, PointerTarget::Target { node: n, .. } if *n == node));
        size_before != self.0.len()
    }

    /// Iterate over the target nodes of all real entries of the set.
    /// Each target node is yielded once, even if it occurs with several offsets.
    pub fn target_nodes(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.0
            .iter()
            .filter_map(|entry| match entry {
                PointerTarget::Target { node, .. } => Some(*node),
                PointerTarget::Null | PointerTarget::Invalidated => None,
            })
            .dedup()
    }

    /// Add the invalidated sentinel to the set.
    /// Returns whether the sentinel was newly added.
    pub fn set_invalidated(&mut self) -> bool {
        self.0.insert(PointerTarget::Invalidated)
    }

    /// Return whether the set contains the invalidated sentinel.
    pub fn has_invalidated(&self) -> bool {
        self.0.contains(&PointerTarget::Invalidated)
    }

    /// Return whether the set contains the null sentinel.
    pub fn has_null(&self) -> bool {
        self.0.contains(&PointerTarget::Null)
    }
}

impl std::fmt::Display for PointsToSet {
    fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        let entries = self
            .0
            .iter()
            .map(|entry| match entry {
                PointerTarget::Target { node, offset } => format!("{}+{}", node.index(), offset),
                PointerTarget::Null => "NULL".to_string(),
                PointerTarget::Invalidated => "INVALIDATED".to_string(),
            })
            .join(", ");
        write!(formatter, "{{ {} }}", entries)
    }
}
