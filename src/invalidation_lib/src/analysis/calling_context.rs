//! A shared, deduplicated tree of calling contexts.
//!
//! A calling context identifies one dynamic call path,
//! given as the chain of call nodes that are currently on the call stack.
//! All contexts of an analysis run live in one prefix tree:
//! two call paths with a common prefix share the context nodes of that prefix,
//! so memory use is bounded by the number of distinct call paths actually explored.
//!
//! The tree is an append-only arena indexed by integer handles.
//! Context nodes are never removed during a run,
//! which keeps the handles stable
//! and makes context equality a simple handle comparison.

use crate::prelude::*;
use petgraph::graph::NodeIndex;
use std::collections::BTreeMap;

/// A handle identifying a calling context within its [`CallingContextTree`].
///
/// Two handles are equal exactly if they denote the same call path.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct ContextId(usize);

impl std::fmt::Display for ContextId {
    fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(formatter, "c{}", self.0)
    }
}

/// A node of the context tree.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct ContextNode {
    /// The call node whose execution produced this context.
    /// `None` exactly for the root context.
    call_site: Option<NodeIndex>,
    /// The context this context was entered from.
    /// The root is its own parent.
    parent: ContextId,
    /// The contexts entered from this context, keyed by their call nodes.
    children: BTreeMap<NodeIndex, ContextId>,
}

/// The prefix tree of all calling contexts of one analysis run.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CallingContextTree {
    nodes: Vec<ContextNode>,
}

impl CallingContextTree {
    /// Create a new context tree containing only the root context.
    pub fn new() -> CallingContextTree {
        CallingContextTree {
            nodes: vec![ContextNode {
                call_site: None,
                parent: ContextId(0),
                children: BTreeMap::new(),
            }],
        }
    }

    /// Get the root context, i.e. the empty call path.
    pub fn root(&self) -> ContextId {
        ContextId(0)
    }

    /// Return whether the given context is the root context.
    pub fn is_root(&self, context: ContextId) -> bool {
        context == self.root()
    }

    /// Extend the given context by one call.
    ///
    /// Returns the unique child context for the given call node,
    /// creating it on first use.
    /// Entering the same call from the same context twice
    /// yields the same context handle.
    pub fn push(&mut self, context: ContextId, call_site: NodeIndex) -> ContextId {
        if let Some(child) = self.nodes[context.0].children.get(&call_site) {
            return *child;
        }
        let child = ContextId(self.nodes.len());
        self.nodes.push(ContextNode {
            call_site: Some(call_site),
            parent: context,
            children: BTreeMap::new(),
        });
        self.nodes[context.0].children.insert(call_site, child);
        child
    }

    /// Leave the topmost call frame of the given context.
    ///
    /// Popping the root context returns the root context itself,
    /// matching a return in the outermost frame of the program.
    pub fn pop(&self, context: ContextId) -> ContextId {
        self.nodes[context.0].parent
    }

    /// Get the call node whose execution produced the given context.
    /// Returns `None` for the root context.
    pub fn call_site(&self, context: ContextId) -> Option<NodeIndex> {
        self.nodes[context.0].call_site
    }

    /// Get the number of contexts in the tree.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Return whether the tree contains only the root context.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Iterate over the given context and its ancestors up to, but excluding, the root.
    /// Yields the call frames from innermost to outermost.
    pub fn frames(&self, context: ContextId) -> impl Iterator<Item = ContextId> + '_ {
        let mut current = context;
        std::iter::from_fn(move || {
            if self.is_root(current) {
                None
            } else {
                let frame = current;
                current = self.pop(current);
                Some(frame)
            }
        })
    }
}

impl Default for CallingContextTree {
    fn default() -> CallingContextTree {
        CallingContextTree::new()
    }
}
