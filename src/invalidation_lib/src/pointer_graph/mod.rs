//! The pointer graph that the analysis operates on.
//!
//! A pointer graph is a directed graph whose nodes are program points,
//! i.e. operations that are relevant for pointer behavior
//! (allocations, deallocations, loads, stores, calls and the like),
//! and whose edges denote possible control flow between these points.
//! Each node belongs to exactly one procedure
//! and carries the points-to set computed for it by a preceding pointer analysis.
//!
//! The graph is built by a front-end that is not part of this crate.
//! The builder methods on [`PointerGraph`] check their immediate preconditions,
//! while [`PointerGraph::validate`] checks the global consistency properties
//! that the analysis relies on,
//! e.g. that every call node is paired with a call-return node.
//!
//! # Interprocedural structure
//!
//! Procedures are connected through three kinds of nodes:
//! * A *call* node knows the procedures it may invoke
//!   and the *call-return* node that execution continues at after the call.
//! * An *entry* node is the unique first node of a procedure.
//! * A *return* node marks an exit of a procedure.
//!   Control flows from there to the call-return node of the invoking call.
//!
//! Note that there is no direct edge from a call node to its call-return node:
//! information only flows through the called procedure.

use crate::prelude::*;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::BTreeMap;

mod points_to;
pub use points_to::{Offset, PointerTarget, PointsToSet};

/// The classification of an allocation node.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum AllocClass {
    /// The object lives on the heap and outlives the allocating call frame.
    Heap,
    /// The object has static lifetime.
    Global,
    /// The object is a local variable of the allocating procedure.
    /// It ceases to exist when the procedure returns.
    Local,
}

/// The kind of operation a program point represents.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub enum NodeKind {
    /// An allocation of a memory object.
    /// The node itself serves as the identity of the allocated object.
    Alloc(AllocClass),
    /// A deallocation.
    /// The first operand is the pointer whose targets get freed.
    Free,
    /// A load through a pointer.
    Load,
    /// A store through a pointer.
    Store,
    /// The unique first node of a procedure.
    Entry,
    /// An exit node of a procedure.
    Return,
    /// A call to one or more procedures.
    Call {
        /// The procedures this call may invoke.
        callees: Vec<Tid>,
        /// The call-return node that execution continues at after the call.
        return_site: Option<NodeIndex>,
    },
    /// The node that the called procedure returns to.
    CallReturn {
        /// The call node this return site belongs to.
        call: NodeIndex,
    },
    /// An operation without pointer-relevant behavior of its own,
    /// e.g. a branch or join point.
    Noop,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            NodeKind::Alloc(AllocClass::Heap) => write!(formatter, "ALLOC(heap)"),
            NodeKind::Alloc(AllocClass::Global) => write!(formatter, "ALLOC(global)"),
            NodeKind::Alloc(AllocClass::Local) => write!(formatter, "ALLOC(local)"),
            NodeKind::Free => write!(formatter, "FREE"),
            NodeKind::Load => write!(formatter, "LOAD"),
            NodeKind::Store => write!(formatter, "STORE"),
            NodeKind::Entry => write!(formatter, "ENTRY"),
            NodeKind::Return => write!(formatter, "RETURN"),
            NodeKind::Call { .. } => write!(formatter, "CALL"),
            NodeKind::CallReturn { .. } => write!(formatter, "CALL_RETURN"),
            NodeKind::Noop => write!(formatter, "NOOP"),
        }
    }
}

/// An identifier for nodes and procedures of a pointer graph.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub struct Tid {
    id: String,
}

impl Tid {
    /// Generate a new identifier from the given ID string.
    pub fn new<T: ToString>(val: T) -> Tid {
        Tid { id: val.to_string() }
    }
}

impl std::fmt::Display for Tid {
    fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(formatter, "{}", self.id)
    }
}

/// A program point of the pointer graph.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct PointerNode {
    /// The identifier of the program point.
    pub tid: Tid,
    /// The operation the program point represents.
    pub kind: NodeKind,
    /// The identifier of the procedure containing the program point.
    pub parent: Tid,
    /// The operands of the operation, given as other program points.
    /// E.g. the pointer operand of a free operation.
    pub operands: Vec<NodeIndex>,
    /// The points-to set of the program point.
    /// Filled in by a preceding pointer analysis,
    /// mutated by the repair pass of the invalidation analysis.
    pub points_to: PointsToSet,
}

impl std::fmt::Display for PointerNode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(formatter, "{} @ {} (proc {})", self.kind, self.tid, self.parent)
    }
}

/// An edge of the pointer graph, denoting possible control flow.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct FlowEdge;

/// A procedure (subgraph) of the pointer graph.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Procedure {
    /// The identifier of the procedure.
    pub tid: Tid,
    /// The entry node of the procedure.
    pub entry: Option<NodeIndex>,
    /// The call nodes that may invoke this procedure.
    pub callers: Vec<NodeIndex>,
    /// The return nodes of this procedure.
    pub returns: Vec<NodeIndex>,
}

/// A points-to graph over whole-program control flow.
///
/// See the module-level documentation for the graph structure.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct PointerGraph {
    graph: DiGraph<PointerNode, FlowEdge>,
    procedures: BTreeMap<Tid, Procedure>,
    entry_procedure: Option<Tid>,
}

impl PointerGraph {
    /// Create a new, empty pointer graph.
    pub fn new() -> PointerGraph {
        PointerGraph::default()
    }

    /// Register a procedure with the given identifier.
    pub fn add_procedure(&mut self, tid: Tid) -> Result<(), Error> {
        if self.procedures.contains_key(&tid) {
            return Err(anyhow!("procedure {} registered twice", tid));
        }
        self.procedures.insert(
            tid.clone(),
            Procedure {
                tid,
                entry: None,
                callers: Vec::new(),
                returns: Vec::new(),
            },
        );
        Ok(())
    }

    /// Designate the procedure that program execution starts in.
    pub fn set_entry_procedure(&mut self, tid: Tid) -> Result<(), Error> {
        if !self.procedures.contains_key(&tid) {
            return Err(anyhow!("unknown entry procedure {}", tid));
        }
        self.entry_procedure = Some(tid);
        Ok(())
    }

    /// Get the identifier of the designated entry procedure, if one is set.
    pub fn entry_procedure(&self) -> Option<&Tid> {
        self.entry_procedure.as_ref()
    }

    /// Add a program point to the given procedure.
    ///
    /// Entry and return nodes are registered in the procedure on the fly.
    /// An allocation node starts out pointing to itself,
    /// since the node serves as the identity of the allocated object.
    /// Call and call-return nodes have to be added
    /// through [`add_call`](Self::add_call) and [`add_call_return`](Self::add_call_return),
    /// so that the pairing between them stays consistent.
    pub fn add_node(&mut self, tid: Tid, kind: NodeKind, parent: &Tid) -> Result<NodeIndex, Error> {
        if matches!(kind, NodeKind::Call { .. } | NodeKind::CallReturn { .. }) {
            return Err(anyhow!(
                "node {} must be added through add_call or add_call_return",
                tid
            ));
        }
        let procedure = self
            .procedures
            .get(parent)
            .ok_or_else(|| anyhow!("unknown procedure {} for node {}", parent, tid))?;
        if matches!(kind, NodeKind::Entry) && procedure.entry.is_some() {
            return Err(anyhow!("procedure {} has more than one entry node", parent));
        }
        let is_alloc = matches!(kind, NodeKind::Alloc(_));
        let index = self.graph.add_node(PointerNode {
            tid,
            kind: kind.clone(),
            parent: parent.clone(),
            operands: Vec::new(),
            points_to: PointsToSet::new(),
        });
        match kind {
            NodeKind::Entry => self.procedures.get_mut(parent).unwrap().entry = Some(index),
            NodeKind::Return => self.procedures.get_mut(parent).unwrap().returns.push(index),
            _ => (),
        }
        if is_alloc {
            self.graph[index].points_to.insert_target(index, 0);
        }
        Ok(index)
    }

    /// Add a call node to the given procedure.
    /// The callees and the paired call-return node get attached separately,
    /// see [`set_callees`](Self::set_callees) and [`add_call_return`](Self::add_call_return).
    pub fn add_call(&mut self, tid: Tid, parent: &Tid) -> Result<NodeIndex, Error> {
        if !self.procedures.contains_key(parent) {
            return Err(anyhow!("unknown procedure {} for call {}", parent, tid));
        }
        Ok(self.graph.add_node(PointerNode {
            tid,
            kind: NodeKind::Call {
                callees: Vec::new(),
                return_site: None,
            },
            parent: parent.clone(),
            operands: Vec::new(),
            points_to: PointsToSet::new(),
        }))
    }

    /// Add the call-return node paired with the given call node.
    pub fn add_call_return(
        &mut self,
        tid: Tid,
        parent: &Tid,
        call: NodeIndex,
    ) -> Result<NodeIndex, Error> {
        if !self.procedures.contains_key(parent) {
            return Err(anyhow!("unknown procedure {} for node {}", parent, tid));
        }
        let index = self.graph.add_node(PointerNode {
            tid,
            kind: NodeKind::CallReturn { call },
            parent: parent.clone(),
            operands: Vec::new(),
            points_to: PointsToSet::new(),
        });
        match &mut self.graph[call].kind {
            NodeKind::Call { return_site, .. } => {
                if return_site.is_some() {
                    return Err(anyhow!("call {} paired with two return sites", call.index()));
                }
                *return_site = Some(index);
            }
            _ => {
                return Err(anyhow!(
                    "node {} paired as return site of a non-call node",
                    index.index()
                ))
            }
        }
        Ok(index)
    }

    /// Set the callees of a call node
    /// and register the call in the caller lists of the callees.
    pub fn set_callees(&mut self, call: NodeIndex, callees: &[Tid]) -> Result<(), Error> {
        for callee in callees {
            if !self.procedures.contains_key(callee) {
                return Err(anyhow!("unknown callee {} of call {}", callee, call.index()));
            }
        }
        match &mut self.graph[call].kind {
            NodeKind::Call {
                callees: known_callees,
                ..
            } => *known_callees = callees.to_vec(),
            _ => return Err(anyhow!("node {} is not a call node", call.index())),
        }
        for callee in callees {
            self.procedures.get_mut(callee).unwrap().callers.push(call);
        }
        Ok(())
    }

    /// Add a control flow edge between two program points.
    /// Adding the same edge twice has no effect.
    pub fn add_edge(&mut self, from: NodeIndex, to: NodeIndex) {
        self.graph.update_edge(from, to, FlowEdge);
    }

    /// Set the operand list of a program point.
    pub fn set_operands(&mut self, node: NodeIndex, operands: Vec<NodeIndex>) {
        self.graph[node].operands = operands;
    }

    /// Get the program point at the given index.
    pub fn node(&self, index: NodeIndex) -> &PointerNode {
        &self.graph[index]
    }

    /// Get the points-to set of the given program point.
    pub fn points_to(&self, index: NodeIndex) -> &PointsToSet {
        &self.graph[index].points_to
    }

    /// Get a mutable reference to the points-to set of the given program point.
    pub fn points_to_mut(&mut self, index: NodeIndex) -> &mut PointsToSet {
        &mut self.graph[index].points_to
    }

    /// Get the structural predecessors of a program point, in edge insertion order.
    pub fn predecessors(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut preds: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .collect();
        preds.reverse();
        preds
    }

    /// Get the structural successors of a program point, in edge insertion order.
    pub fn successors(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut succs: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect();
        succs.reverse();
        succs
    }

    /// Iterate over all program points of the graph, in insertion order.
    pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    /// Get all program points belonging to the given procedure, in insertion order.
    pub fn nodes_of_procedure(&self, tid: &Tid) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|index| self.graph[*index].parent == *tid)
            .collect()
    }

    /// Get the number of program points in the graph.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the procedure with the given identifier.
    pub fn procedure(&self, tid: &Tid) -> Option<&Procedure> {
        self.procedures.get(tid)
    }

    /// Iterate over all procedures of the graph.
    pub fn procedures(&self) -> impl Iterator<Item = &Procedure> + '_ {
        self.procedures.values()
    }

    /// Get the call-return nodes that the given return node may flow to,
    /// i.e. the return sites of all calls that may invoke the returning procedure.
    pub fn return_sites(&self, return_node: NodeIndex) -> Vec<NodeIndex> {
        let parent = &self.graph[return_node].parent;
        let Some(procedure) = self.procedures.get(parent) else {
            return Vec::new();
        };
        procedure
            .callers
            .iter()
            .filter_map(|caller| match &self.graph[*caller].kind {
                NodeKind::Call { return_site, .. } => *return_site,
                _ => None,
            })
            .collect()
    }

    /// Check the global consistency properties that the analysis relies on:
    /// * An entry procedure is designated.
    /// * Every procedure has an entry node of kind `Entry` without structural predecessors.
    /// * Every call node is paired with a call-return node and vice versa.
    /// * All callees of call nodes are registered procedures.
    /// * All operand indices reference nodes of the graph.
    pub fn validate(&self) -> Result<(), Error> {
        let entry_tid = self
            .entry_procedure
            .as_ref()
            .ok_or_else(|| anyhow!("no entry procedure designated"))?;
        if !self.procedures.contains_key(entry_tid) {
            return Err(anyhow!("unknown entry procedure {}", entry_tid));
        }
        for procedure in self.procedures.values() {
            let entry = procedure
                .entry
                .ok_or_else(|| anyhow!("procedure {} has no entry node", procedure.tid))?;
            if !matches!(self.graph[entry].kind, NodeKind::Entry) {
                return Err(anyhow!(
                    "entry node of procedure {} has kind {}",
                    procedure.tid,
                    self.graph[entry].kind
                ));
            }
            if !self.predecessors(entry).is_empty() {
                return Err(anyhow!(
                    "entry node of procedure {} has structural predecessors",
                    procedure.tid
                ));
            }
        }
        for index in self.graph.node_indices() {
            let node = &self.graph[index];
            for operand in &node.operands {
                if operand.index() >= self.graph.node_count() {
                    return Err(anyhow!("node {} has a dangling operand reference", node.tid));
                }
            }
            match &node.kind {
                NodeKind::Call {
                    callees,
                    return_site,
                } => {
                    let return_site = return_site
                        .ok_or_else(|| anyhow!("call {} has no paired return site", node.tid))?;
                    match &self.graph[return_site].kind {
                        NodeKind::CallReturn { call } if *call == index => (),
                        _ => {
                            return Err(anyhow!(
                                "return site pairing of call {} is inconsistent",
                                node.tid
                            ))
                        }
                    }
                    for callee in callees {
                        if !self.procedures.contains_key(callee) {
                            return Err(anyhow!("call {} has unknown callee {}", node.tid, callee));
                        }
                    }
                }
                NodeKind::CallReturn { call } => match &self.graph[*call].kind {
                    NodeKind::Call { return_site, .. } if *return_site == Some(index) => (),
                    _ => {
                        return Err(anyhow!(
                            "call pairing of return site {} is inconsistent",
                            node.tid
                        ))
                    }
                },
                _ => (),
            }
        }
        Ok(())
    }
}
