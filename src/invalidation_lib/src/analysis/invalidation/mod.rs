//! A context-sensitive dataflow analysis detecting invalidated pointers.
//!
//! The analysis runs on a [`PointerGraph`] whose points-to sets
//! have already been computed by a preceding pointer analysis.
//! For every program point, evaluated once per calling context reaching it,
//! it computes the set of memory objects that are certainly invalidated
//! (freed, or local variables of already-returned call frames)
//! and the set of objects that are possibly invalidated on at least one path.
//! Afterwards the points-to sets of the graph are repaired:
//! certainly dangling targets are removed
//! and possibly dangling targets are flagged with the invalidated sentinel.
//!
//! ## How the analysis works
//!
//! The unit of computation is the pair of a program point and a calling context.
//! Starting from the entry procedure with the empty context,
//! a traversal seeds one unit for every reachable pair,
//! entering a fresh context at every call
//! and returning only to the call-return node
//! that is paired with the call on top of the current context.
//! A worklist algorithm then merges each unit's state
//! from its context-consistent predecessors until a fixpoint is reached.
//! Since the merge only ever grows the set of tracked objects
//! and the set of units is finite, the fixpoint exists.
//!
//! At deallocation points the freed objects are classified:
//! if the freed pointer has a unique target, the invalidation is certain,
//! otherwise any one of several objects may be the one actually freed
//! and all of them are only possibly invalidated.
//! At return points all local allocations of the returning procedure
//! become certainly invalidated, since leaving a procedure
//! deallocates all of its non-escaping locals.
//!
//! ## Limitations
//!
//! Recursive call structures and calls without known callees are rejected
//! with a dedicated [`AnalysisError`] variant instead of being approximated,
//! so that an incomplete analysis is distinguishable
//! from an analysis that found no invalidations.
//! The context and round ceilings of the [`Config`] serve as a safety net
//! against excessive call structures; exceeding them also aborts the run.

use crate::analysis::calling_context::{CallingContextTree, ContextId};
use crate::pointer_graph::{AllocClass, NodeKind, PointerGraph};
use crate::prelude::*;
use crate::utils::log::{LogMessage, LogThreadMsg};
use fnv::FnvHashSet;
use petgraph::graph::NodeIndex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

mod repair;
mod state;

pub use state::State;
use state::StateMap;

/// Configurable parameters for the analysis.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub struct Config {
    /// The maximum number of calling contexts the analysis may create.
    /// Exceeding the ceiling aborts the analysis,
    /// since unbounded context growth indicates a call structure
    /// that the analysis cannot handle.
    pub max_contexts: usize,
    /// The maximum number of worklist rounds of the fixpoint computation.
    /// Exceeding the ceiling aborts the analysis instead of returning
    /// a partial result as if it were final.
    pub max_rounds: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_contexts: 65536,
            max_rounds: 100,
        }
    }
}

/// The errors that can abort an analysis run.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub enum AnalysisError {
    /// The pointer graph or the internal bookkeeping violated
    /// a consistency precondition of the analysis.
    /// The result of the run would be meaningless, so no result is returned.
    Internal(String),
    /// The program contains a directly or mutually recursive call structure.
    /// The analysis does not support recursion
    /// and refuses to compute unsound results for it.
    UnsupportedRecursion {
        /// A procedure on the recursive call cycle.
        procedure: Tid,
    },
    /// A call with no known callees was reached.
    UnresolvedCall {
        /// The identifier of the unresolved call node.
        call: Tid,
    },
    /// The context ceiling of the [`Config`] was hit.
    ContextBudgetExceeded {
        /// The procedure whose call structure caused the ceiling to be hit.
        procedure: Tid,
        /// The configured ceiling.
        limit: usize,
    },
    /// The fixpoint did not stabilize within the round ceiling of the [`Config`].
    FixpointBudgetExceeded {
        /// The configured ceiling.
        limit: u64,
    },
}

impl AnalysisError {
    /// Return whether the error denotes an unsupported input shape.
    ///
    /// For unsupported inputs a caller may fall back to a coarser analysis,
    /// whereas internal errors and exceeded budgets indicate
    /// that something is wrong with the input graph or its call structure.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            AnalysisError::UnsupportedRecursion { .. } | AnalysisError::UnresolvedCall { .. }
        )
    }
}

impl std::fmt::Display for AnalysisError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            AnalysisError::Internal(msg) => write!(formatter, "internal analysis error: {}", msg),
            AnalysisError::UnsupportedRecursion { procedure } => write!(
                formatter,
                "recursive call structure involving procedure {} is not supported",
                procedure
            ),
            AnalysisError::UnresolvedCall { call } => {
                write!(formatter, "call {} has no known callees", call)
            }
            AnalysisError::ContextBudgetExceeded { procedure, limit } => write!(
                formatter,
                "call structure of procedure {} exceeds the limit of {} calling contexts",
                procedure, limit
            ),
            AnalysisError::FixpointBudgetExceeded { limit } => write!(
                formatter,
                "fixpoint did not stabilize within {} worklist rounds",
                limit
            ),
        }
    }
}

impl std::error::Error for AnalysisError {}

/// A program point evaluated under a specific calling context.
///
/// This pair, not the bare program point, is the unit the analysis computes facts for:
/// the same point reached through two different call chains
/// gets two independent states.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct AnalysisUnit {
    /// The program point.
    pub node: NodeIndex,
    /// The calling context the point is evaluated under.
    pub context: ContextId,
}

impl AnalysisUnit {
    /// Create a new analysis unit from a program point and a context.
    pub fn new(node: NodeIndex, context: ContextId) -> AnalysisUnit {
        AnalysisUnit { node, context }
    }
}

impl std::fmt::Display for AnalysisUnit {
    fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(formatter, "n{}@{}", self.node.index(), self.context)
    }
}

/// Return whether the kind of a program point forces an own state computation.
/// Points of other kinds with a single predecessor
/// simply pass their predecessor's state through.
fn is_relevant(kind: &NodeKind) -> bool {
    matches!(
        kind,
        NodeKind::Alloc(_)
            | NodeKind::Free
            | NodeKind::Entry
            | NodeKind::Return
            | NodeKind::Call { .. }
            | NodeKind::CallReturn { .. }
    )
}

/// Run the invalidation analysis on the given pointer graph.
///
/// The graph is validated first,
/// then the analysis units are seeded from the entry procedure,
/// the fixpoint over the must/may states is computed
/// and finally the points-to sets of the graph are repaired in place.
///
/// Returns the analysis object granting access to the raw must/may sets,
/// or an error if the graph is malformed,
/// its call structure is unsupported
/// or one of the configured ceilings was exceeded.
/// On error the points-to sets of the graph are left untouched.
pub fn run(
    graph: &mut PointerGraph,
    config: &Config,
    log_sender: crossbeam_channel::Sender<LogThreadMsg>,
) -> Result<InvalidationAnalysis, AnalysisError> {
    graph
        .validate()
        .map_err(|err| AnalysisError::Internal(format!("malformed pointer graph: {}", err)))?;
    let mut driver = Driver::new(graph, config, log_sender.clone());
    driver.seed()?;
    driver.compute()?;
    let Driver {
        contexts,
        states,
        units,
        locals,
        ..
    } = driver;
    let sentinel_count = repair::fix_points_to(graph, &units, &states)?;
    let _ = log_sender.send(LogThreadMsg::Log(
        LogMessage::new_debug(format!(
            "repair pass added the invalidated sentinel to {} points-to sets",
            sentinel_count
        ))
        .source("Invalidation"),
    ));
    Ok(InvalidationAnalysis {
        contexts,
        states,
        units,
        locals,
    })
}

/// The worklist driver of the analysis.
/// It owns all bookkeeping of one run
/// and borrows the pointer graph immutably;
/// the graph is only mutated by the repair pass afterwards.
struct Driver<'a> {
    graph: &'a PointerGraph,
    config: &'a Config,
    log_sender: crossbeam_channel::Sender<LogThreadMsg>,
    contexts: CallingContextTree,
    states: StateMap,
    /// All seeded units in seeding order.
    /// The fixpoint and the repair pass process units in this order,
    /// which makes the analysis deterministic.
    units: Vec<AnalysisUnit>,
    /// The local allocations of each procedure discovered so far.
    locals: BTreeMap<Tid, BTreeSet<NodeIndex>>,
}

impl<'a> Driver<'a> {
    fn new(
        graph: &'a PointerGraph,
        config: &'a Config,
        log_sender: crossbeam_channel::Sender<LogThreadMsg>,
    ) -> Driver<'a> {
        Driver {
            graph,
            config,
            log_sender,
            contexts: CallingContextTree::new(),
            states: StateMap::new(),
            units: Vec::new(),
            locals: BTreeMap::new(),
        }
    }

    fn log_debug(&self, text: String) {
        let _ = self.log_sender.send(LogThreadMsg::Log(
            LogMessage::new_debug(text).source("Invalidation"),
        ));
    }

    /// Seed one analysis unit for every `(point, context)` pair
    /// reachable from the entry procedure under the empty context.
    ///
    /// The traversal is an explicit depth-first search,
    /// so deep graphs cannot overflow the machine stack.
    /// Each unit is visited at most once.
    fn seed(&mut self) -> Result<(), AnalysisError> {
        let graph = self.graph;
        let entry_tid = graph.entry_procedure().ok_or_else(|| {
            AnalysisError::Internal("no entry procedure designated".to_string())
        })?;
        let entry_node = graph
            .procedure(entry_tid)
            .and_then(|procedure| procedure.entry)
            .ok_or_else(|| {
                AnalysisError::Internal(format!("entry procedure {} has no entry node", entry_tid))
            })?;
        let mut stack = vec![AnalysisUnit::new(entry_node, self.contexts.root())];
        let mut visited: FnvHashSet<AnalysisUnit> = FnvHashSet::default();
        while let Some(unit) = stack.pop() {
            if !visited.insert(unit) {
                continue;
            }
            self.states.register(unit);
            self.units.push(unit);
            let successors = self.successor_units(unit)?;
            for successor in successors.into_iter().rev() {
                if !visited.contains(&successor) {
                    stack.push(successor);
                }
            }
        }
        self.log_debug(format!(
            "seeded {} analysis units over {} calling contexts",
            self.units.len(),
            self.contexts.len()
        ));
        Ok(())
    }

    /// Run the round-based fixpoint computation.
    ///
    /// Every queued unit is merged once per round;
    /// the context-consistent reachable sets of all changed units
    /// form the queue of the next round.
    /// The computation stops when a round enqueues nothing.
    fn compute(&mut self) -> Result<(), AnalysisError> {
        let mut queue = self.units.clone();
        let mut rounds = 0u64;
        while !queue.is_empty() {
            rounds += 1;
            if rounds > self.config.max_rounds {
                return Err(AnalysisError::FixpointBudgetExceeded {
                    limit: self.config.max_rounds,
                });
            }
            let mut next_round = Vec::new();
            let mut enqueued: FnvHashSet<AnalysisUnit> = FnvHashSet::default();
            for &unit in &queue {
                if self.process_unit(unit)? {
                    for successor in self.reachable_units(unit)? {
                        if enqueued.insert(successor) {
                            next_round.push(successor);
                        }
                    }
                }
            }
            queue = next_round;
        }
        self.log_debug(format!("fixpoint stabilized after {} rounds", rounds));
        Ok(())
    }

    /// Process a single unit: classify frees, register local allocations,
    /// apply the frame-teardown rule and merge the predecessor states.
    ///
    /// Pass-through units in straight-line code do not merge at all.
    /// Instead their state is aliased to their predecessor's state,
    /// re-resolved on every visit in case the predecessor got aliased itself.
    ///
    /// Returns whether the state of the unit changed.
    fn process_unit(&mut self, unit: AnalysisUnit) -> Result<bool, AnalysisError> {
        let graph = self.graph;
        let node = graph.node(unit.node);

        let structural_preds = graph.predecessors(unit.node);
        if structural_preds.len() == 1 && !is_relevant(&node.kind) {
            let predecessor = AnalysisUnit::new(structural_preds[0], unit.context);
            self.states.set_alias(unit, predecessor)?;
            return Ok(false);
        }

        let mut changed = false;

        if matches!(node.kind, NodeKind::Free) {
            changed |= self.classify_free_targets(unit)?;
        }

        if matches!(node.kind, NodeKind::Alloc(AllocClass::Local)) {
            changed |= self
                .locals
                .entry(node.parent.clone())
                .or_default()
                .insert(unit.node);
        }

        if matches!(node.kind, NodeKind::Return) {
            if let Some(locals) = self.locals.get(&node.parent) {
                let locals: Vec<NodeIndex> = locals.iter().copied().collect();
                let state = self.states.get_owned_mut(unit)?;
                for local in locals {
                    changed |= state.insert_must(AnalysisUnit::new(local, unit.context));
                }
            }
        }

        let predecessor_units = self.predecessor_units(unit)?;
        let mut predecessor_states = Vec::with_capacity(predecessor_units.len());
        for predecessor in predecessor_units {
            predecessor_states.push(self.states.get(predecessor)?.clone());
        }
        let state = self.states.get_owned_mut(unit)?;
        changed |= state.update(&predecessor_states);

        Ok(changed)
    }

    /// Classify the targets freed at a deallocation unit.
    ///
    /// If the points-to set of the freed pointer has exactly one entry,
    /// the target's identity is unambiguous and its invalidation is certain.
    /// With more than one entry any one of the targets
    /// may be the object actually freed,
    /// so all of them are only possibly invalidated.
    /// Freed objects are tagged with the root context,
    /// since heap lifetime is not tied to any call frame.
    fn classify_free_targets(&mut self, unit: AnalysisUnit) -> Result<bool, AnalysisError> {
        let graph = self.graph;
        let node = graph.node(unit.node);
        let pointer = *node.operands.first().ok_or_else(|| {
            AnalysisError::Internal(format!("free node {} has no pointer operand", node.tid))
        })?;
        let points_to = graph.points_to(pointer);
        let entry_count = points_to.len();
        let targets: Vec<NodeIndex> = points_to.target_nodes().collect();
        let root = self.contexts.root();
        let state = self.states.get_owned_mut(unit)?;
        let mut changed = false;
        for target in targets {
            let object = AnalysisUnit::new(target, root);
            changed |= if entry_count == 1 {
                state.insert_must(object)
            } else {
                state.insert_may(object)
            };
        }
        Ok(changed)
    }

    /// Compute the predecessor units of a unit.
    ///
    /// Entry points are preceded by the call that produced the current context,
    /// evaluated under the context with that call popped;
    /// the root context has no caller and therefore no predecessors.
    /// Call-return points are preceded by the return points of the callees,
    /// evaluated under the context with the call pushed.
    /// All other points use their structural predecessors under the same context.
    fn predecessor_units(&mut self, unit: AnalysisUnit) -> Result<Vec<AnalysisUnit>, AnalysisError> {
        let graph = self.graph;
        let node = graph.node(unit.node);
        match &node.kind {
            NodeKind::Entry => {
                if self.contexts.is_root(unit.context) {
                    return Ok(Vec::new());
                }
                let call = self.contexts.call_site(unit.context).ok_or_else(|| {
                    AnalysisError::Internal(format!(
                        "context {} has no producing call", unit.context
                    ))
                })?;
                Ok(vec![AnalysisUnit::new(
                    call,
                    self.contexts.pop(unit.context),
                )])
            }
            NodeKind::CallReturn { call } => {
                let call_node = graph.node(*call);
                let NodeKind::Call { callees, .. } = &call_node.kind else {
                    return Err(AnalysisError::Internal(format!(
                        "return site {} is paired with non-call node {}",
                        node.tid, call_node.tid
                    )));
                };
                let callee_context = self.contexts.push(unit.context, *call);
                let mut predecessors = Vec::new();
                for callee in callees {
                    let procedure = graph.procedure(callee).ok_or_else(|| {
                        AnalysisError::Internal(format!("unknown procedure {}", callee))
                    })?;
                    predecessors.extend(
                        procedure
                            .returns
                            .iter()
                            .map(|&return_node| AnalysisUnit::new(return_node, callee_context)),
                    );
                }
                Ok(predecessors)
            }
            _ => Ok(graph
                .predecessors(unit.node)
                .into_iter()
                .map(|predecessor| AnalysisUnit::new(predecessor, unit.context))
                .collect()),
        }
    }

    /// Compute the successor units of a unit.
    ///
    /// The rules mirror [`predecessor_units`](Self::predecessor_units):
    /// a call continues at the entries of its callees under the pushed context,
    /// a return continues at the call-return node
    /// paired with the call on top of the current context
    /// (or nowhere if the context is the root),
    /// everything else follows the structural successors.
    fn successor_units(&mut self, unit: AnalysisUnit) -> Result<Vec<AnalysisUnit>, AnalysisError> {
        let graph = self.graph;
        let node = graph.node(unit.node);
        match &node.kind {
            NodeKind::Call { callees, .. } => {
                if callees.is_empty() {
                    return Err(AnalysisError::UnresolvedCall {
                        call: node.tid.clone(),
                    });
                }
                self.check_recursion(unit, callees)?;
                let callee_context = self.contexts.push(unit.context, unit.node);
                if self.contexts.len() > self.config.max_contexts {
                    return Err(AnalysisError::ContextBudgetExceeded {
                        procedure: node.parent.clone(),
                        limit: self.config.max_contexts,
                    });
                }
                let mut successors = Vec::new();
                for callee in callees {
                    let entry = graph
                        .procedure(callee)
                        .and_then(|procedure| procedure.entry)
                        .ok_or_else(|| {
                            AnalysisError::Internal(format!(
                                "procedure {} has no entry node",
                                callee
                            ))
                        })?;
                    successors.push(AnalysisUnit::new(entry, callee_context));
                }
                Ok(successors)
            }
            NodeKind::Return => {
                if self.contexts.is_root(unit.context) {
                    return Ok(Vec::new());
                }
                let call = self.contexts.call_site(unit.context).ok_or_else(|| {
                    AnalysisError::Internal(format!(
                        "context {} has no producing call", unit.context
                    ))
                })?;
                let NodeKind::Call { return_site, .. } = &graph.node(call).kind else {
                    return Err(AnalysisError::Internal(format!(
                        "context {} was produced by non-call node {}",
                        unit.context,
                        graph.node(call).tid
                    )));
                };
                let return_site = return_site.ok_or_else(|| {
                    AnalysisError::Internal(format!(
                        "call {} has no paired return site",
                        graph.node(call).tid
                    ))
                })?;
                Ok(vec![AnalysisUnit::new(
                    return_site,
                    self.contexts.pop(unit.context),
                )])
            }
            _ => Ok(graph
                .successors(unit.node)
                .into_iter()
                .map(|successor| AnalysisUnit::new(successor, unit.context))
                .collect()),
        }
    }

    /// Reject calls whose callee is already active on the current context chain.
    fn check_recursion(&self, unit: AnalysisUnit, callees: &[Tid]) -> Result<(), AnalysisError> {
        let graph = self.graph;
        let caller = &graph.node(unit.node).parent;
        for callee in callees {
            if callee == caller {
                return Err(AnalysisError::UnsupportedRecursion {
                    procedure: callee.clone(),
                });
            }
            for frame in self.contexts.frames(unit.context) {
                let call_site = self.contexts.call_site(frame).ok_or_else(|| {
                    AnalysisError::Internal(format!("context {} has no producing call", frame))
                })?;
                if graph.node(call_site).parent == *callee {
                    return Err(AnalysisError::UnsupportedRecursion {
                        procedure: callee.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Compute all units reachable from the given unit
    /// by a breadth-first search that follows the context-consistent
    /// successor rules of [`successor_units`](Self::successor_units).
    /// The unit itself is only part of the result if it lies on a cycle.
    fn reachable_units(&mut self, from: AnalysisUnit) -> Result<Vec<AnalysisUnit>, AnalysisError> {
        let mut reachable = Vec::new();
        let mut visited: FnvHashSet<AnalysisUnit> = FnvHashSet::default();
        let mut queue: VecDeque<AnalysisUnit> = self.successor_units(from)?.into();
        while let Some(unit) = queue.pop_front() {
            if !visited.insert(unit) {
                continue;
            }
            reachable.push(unit);
            for successor in self.successor_units(unit)? {
                if !visited.contains(&successor) {
                    queue.push_back(successor);
                }
            }
        }
        Ok(reachable)
    }
}

/// The result of an analysis run.
///
/// The repaired points-to sets live on the pointer graph itself;
/// this object grants access to the raw must/may sets per analysis unit
/// for diagnostic tooling.
#[derive(Debug)]
pub struct InvalidationAnalysis {
    contexts: CallingContextTree,
    states: StateMap,
    units: Vec<AnalysisUnit>,
    locals: BTreeMap<Tid, BTreeSet<NodeIndex>>,
}

impl InvalidationAnalysis {
    /// Get all analyzed units in the deterministic processing order of the run.
    pub fn units(&self) -> &[AnalysisUnit] {
        &self.units
    }

    /// Get the tree of calling contexts explored by the run.
    pub fn contexts(&self) -> &CallingContextTree {
        &self.contexts
    }

    /// Get the root (empty) calling context.
    pub fn root_context(&self) -> ContextId {
        self.contexts.root()
    }

    /// Iterate over all units of the given program point,
    /// one per calling context it was analyzed under.
    pub fn units_of_node(&self, node: NodeIndex) -> impl Iterator<Item = AnalysisUnit> + '_ {
        self.units.iter().copied().filter(move |unit| unit.node == node)
    }

    /// Get the final state of the given unit,
    /// or `None` if the unit was not part of the analysis.
    pub fn state(&self, unit: AnalysisUnit) -> Option<&State> {
        self.states.get(unit).ok()
    }

    /// Get the local allocations discovered for the given procedure.
    /// Returns `None` if the procedure has no local allocations
    /// or was never visited.
    pub fn local_allocations(&self, procedure: &Tid) -> Option<&BTreeSet<NodeIndex>> {
        self.locals.get(procedure)
    }

    /// Get a compact json-representation of all non-empty states.
    /// Intended for pretty printing and debugging,
    /// not usable for serialization/deserialization.
    pub fn to_json_compact(&self, graph: &PointerGraph) -> serde_json::Value {
        use serde_json::Value;
        let mut state_map = serde_json::Map::new();
        for &unit in &self.units {
            let Some(state) = self.state(unit) else {
                continue;
            };
            if state.is_empty() {
                continue;
            }
            let object_names = |objects: &BTreeSet<AnalysisUnit>| -> Value {
                Value::Array(
                    objects
                        .iter()
                        .map(|object| Value::String(graph.node(object.node).tid.to_string()))
                        .collect(),
                )
            };
            let mut entry = serde_json::Map::new();
            entry.insert("must".to_string(), object_names(state.must()));
            entry.insert("may".to_string(), object_names(state.may()));
            state_map.insert(
                format!("{} @ {}", graph.node(unit.node).tid, unit.context),
                Value::Object(entry),
            );
        }
        Value::Object(state_map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pointer_graph::Tid;
    use crate::utils::log::LogThread;

    fn run_analysis(graph: &mut PointerGraph) -> InvalidationAnalysis {
        run(
            graph,
            &Config::default(),
            LogThread::create_disconnected_sender(),
        )
        .unwrap()
    }

    /// The must and may sets have to be disjoint for every unit.
    fn assert_disjoint_states(analysis: &InvalidationAnalysis) {
        for &unit in analysis.units() {
            let state = analysis.state(unit).unwrap();
            assert!(
                state.must().intersection(state.may()).next().is_none(),
                "must and may of unit {} overlap",
                unit
            );
        }
    }

    fn root_state<'a>(analysis: &'a InvalidationAnalysis, node: NodeIndex) -> &'a State {
        analysis
            .state(AnalysisUnit::new(node, analysis.root_context()))
            .expect("node was analyzed under the root context")
    }

    /// Get the state of a node that was analyzed under exactly one context.
    fn unique_state<'a>(analysis: &'a InvalidationAnalysis, node: NodeIndex) -> &'a State {
        let mut units = analysis.units_of_node(node);
        let unit = units.next().expect("node was analyzed");
        assert!(units.next().is_none(), "node analyzed under several contexts");
        analysis.state(unit).unwrap()
    }

    /// Build a procedure with an entry node and return the entry index.
    fn add_procedure_with_entry(graph: &mut PointerGraph, name: &str) -> NodeIndex {
        let tid = Tid::new(name);
        graph.add_procedure(tid.clone()).unwrap();
        graph
            .add_node(Tid::new(format!("{name}_entry")), NodeKind::Entry, &tid)
            .unwrap()
    }

    #[test]
    fn free_through_unique_pointer_invalidates_for_certain() {
        let mut graph = PointerGraph::new();
        let main = Tid::new("main");
        let entry = add_procedure_with_entry(&mut graph, "main");
        graph.set_entry_procedure(main.clone()).unwrap();
        let alloc = graph
            .add_node(Tid::new("x"), NodeKind::Alloc(AllocClass::Heap), &main)
            .unwrap();
        let free = graph.add_node(Tid::new("free_x"), NodeKind::Free, &main).unwrap();
        let load = graph.add_node(Tid::new("load_x"), NodeKind::Load, &main).unwrap();
        graph.add_edge(entry, alloc);
        graph.add_edge(alloc, free);
        graph.add_edge(free, load);
        graph.set_operands(free, vec![alloc]);
        graph.points_to_mut(load).insert_target(alloc, 0);

        let analysis = run_analysis(&mut graph);
        assert_disjoint_states(&analysis);

        let free_state = root_state(&analysis, free);
        assert!(free_state.must_contains(alloc));
        assert!(!free_state.may_contains(alloc));
        let load_state = root_state(&analysis, load);
        assert!(load_state.must_contains(alloc));
        assert!(!load_state.may_contains(alloc));

        let points_to = graph.points_to(load);
        assert!(points_to.has_invalidated());
        assert!(!points_to.points_to_target(alloc));
    }

    #[test]
    fn free_on_one_branch_only_invalidates_possibly() {
        let mut graph = PointerGraph::new();
        let main = Tid::new("main");
        let entry = add_procedure_with_entry(&mut graph, "main");
        graph.set_entry_procedure(main.clone()).unwrap();
        let alloc = graph
            .add_node(Tid::new("x"), NodeKind::Alloc(AllocClass::Heap), &main)
            .unwrap();
        let load = graph.add_node(Tid::new("load_x"), NodeKind::Load, &main).unwrap();
        let free = graph.add_node(Tid::new("free_x"), NodeKind::Free, &main).unwrap();
        let test_load = graph
            .add_node(Tid::new("test_load"), NodeKind::Load, &main)
            .unwrap();
        graph.add_edge(entry, alloc);
        graph.add_edge(alloc, load);
        graph.add_edge(alloc, free);
        graph.add_edge(load, test_load);
        graph.add_edge(free, test_load);
        graph.set_operands(free, vec![alloc]);
        graph.points_to_mut(load).insert_target(alloc, 0);
        graph.points_to_mut(test_load).insert_target(alloc, 0);

        let analysis = run_analysis(&mut graph);
        assert_disjoint_states(&analysis);

        let free_state = root_state(&analysis, free);
        assert!(free_state.must_contains(alloc));
        let load_state = root_state(&analysis, load);
        assert!(load_state.is_empty());
        let join_state = root_state(&analysis, test_load);
        assert!(!join_state.must_contains(alloc));
        assert!(join_state.may_contains(alloc));

        // The target stays in the points-to set since it may still be valid,
        // but the sentinel marks the possible invalidation.
        let points_to = graph.points_to(test_load);
        assert!(points_to.has_invalidated());
        assert!(points_to.points_to_target(alloc));
        assert!(!graph.points_to(load).has_invalidated());
    }

    #[test]
    fn multi_target_free_invalidates_possibly() {
        let mut graph = PointerGraph::new();
        let main = Tid::new("main");
        let entry = add_procedure_with_entry(&mut graph, "main");
        graph.set_entry_procedure(main.clone()).unwrap();
        let alloc_a = graph
            .add_node(Tid::new("a"), NodeKind::Alloc(AllocClass::Heap), &main)
            .unwrap();
        let alloc_b = graph
            .add_node(Tid::new("b"), NodeKind::Alloc(AllocClass::Heap), &main)
            .unwrap();
        let pointer = graph.add_node(Tid::new("p"), NodeKind::Noop, &main).unwrap();
        let free = graph.add_node(Tid::new("free_p"), NodeKind::Free, &main).unwrap();
        graph.add_edge(entry, alloc_a);
        graph.add_edge(alloc_a, alloc_b);
        graph.add_edge(alloc_b, pointer);
        graph.add_edge(pointer, free);
        graph.set_operands(free, vec![pointer]);
        graph.points_to_mut(pointer).insert_target(alloc_a, 0);
        graph.points_to_mut(pointer).insert_target(alloc_b, 0);

        let analysis = run_analysis(&mut graph);
        assert_disjoint_states(&analysis);

        let free_state = root_state(&analysis, free);
        assert!(free_state.may_contains(alloc_a));
        assert!(free_state.may_contains(alloc_b));
        assert!(!free_state.must_contains(alloc_a));
        assert!(!free_state.must_contains(alloc_b));
    }

    /// Build a program where `main` calls `callee` once:
    /// `main: entry -> call -> call_return -> test_load`.
    /// The callee body between its entry and return node is left to the caller of this helper.
    fn call_skeleton(
        graph: &mut PointerGraph,
    ) -> (NodeIndex, NodeIndex, NodeIndex, NodeIndex, NodeIndex) {
        let main = Tid::new("main");
        let callee = Tid::new("callee");
        let main_entry = add_procedure_with_entry(graph, "main");
        let callee_entry = add_procedure_with_entry(graph, "callee");
        graph.set_entry_procedure(main.clone()).unwrap();
        let call = graph.add_call(Tid::new("call"), &main).unwrap();
        let call_return = graph
            .add_call_return(Tid::new("call_ret"), &main, call)
            .unwrap();
        graph.set_callees(call, &[callee.clone()]).unwrap();
        let test_load = graph
            .add_node(Tid::new("test_load"), NodeKind::Load, &main)
            .unwrap();
        graph.add_edge(main_entry, call);
        graph.add_edge(call_return, test_load);
        (main_entry, callee_entry, call, call_return, test_load)
    }

    #[test]
    fn heap_free_in_callee_reaches_the_caller() {
        let mut graph = PointerGraph::new();
        let (_, callee_entry, _, _, test_load) = call_skeleton(&mut graph);
        let callee = Tid::new("callee");
        let malloc = graph
            .add_node(Tid::new("x"), NodeKind::Alloc(AllocClass::Heap), &callee)
            .unwrap();
        let free = graph.add_node(Tid::new("free_x"), NodeKind::Free, &callee).unwrap();
        let ret = graph.add_node(Tid::new("ret"), NodeKind::Return, &callee).unwrap();
        graph.add_edge(callee_entry, malloc);
        graph.add_edge(malloc, free);
        graph.add_edge(free, ret);
        graph.set_operands(free, vec![malloc]);
        graph.points_to_mut(test_load).insert_target(malloc, 0);

        let analysis = run_analysis(&mut graph);
        assert_disjoint_states(&analysis);

        let load_state = root_state(&analysis, test_load);
        assert!(load_state.must_contains(malloc));
        assert!(!load_state.may_contains(malloc));
        let points_to = graph.points_to(test_load);
        assert!(points_to.has_invalidated());
        assert!(!points_to.points_to_target(malloc));
    }

    #[test]
    fn branch_dependent_free_in_callee_reaches_the_caller_as_possible() {
        let mut graph = PointerGraph::new();
        let (_, callee_entry, _, _, test_load) = call_skeleton(&mut graph);
        let callee = Tid::new("callee");
        let malloc = graph
            .add_node(Tid::new("x"), NodeKind::Alloc(AllocClass::Heap), &callee)
            .unwrap();
        let free = graph.add_node(Tid::new("free_x"), NodeKind::Free, &callee).unwrap();
        let load = graph.add_node(Tid::new("load_x"), NodeKind::Load, &callee).unwrap();
        let ret = graph.add_node(Tid::new("ret"), NodeKind::Return, &callee).unwrap();
        graph.add_edge(callee_entry, malloc);
        graph.add_edge(malloc, load);
        graph.add_edge(malloc, free);
        graph.add_edge(free, load);
        graph.add_edge(load, ret);
        graph.set_operands(free, vec![malloc]);
        graph.points_to_mut(load).insert_target(malloc, 0);
        graph.points_to_mut(test_load).insert_target(malloc, 0);

        let analysis = run_analysis(&mut graph);
        assert_disjoint_states(&analysis);

        let inner_state = unique_state(&analysis, load);
        assert!(!inner_state.must_contains(malloc));
        assert!(inner_state.may_contains(malloc));
        let outer_state = root_state(&analysis, test_load);
        assert!(!outer_state.must_contains(malloc));
        assert!(outer_state.may_contains(malloc));

        assert!(graph.points_to(load).has_invalidated());
        assert!(graph.points_to(load).points_to_target(malloc));
        assert!(graph.points_to(test_load).has_invalidated());
        assert!(graph.points_to(test_load).points_to_target(malloc));
    }

    #[test]
    fn returning_invalidates_the_locals_of_the_callee() {
        let mut graph = PointerGraph::new();
        let (_, callee_entry, _, _, test_load) = call_skeleton(&mut graph);
        let callee = Tid::new("callee");
        let local = graph
            .add_node(Tid::new("l"), NodeKind::Alloc(AllocClass::Local), &callee)
            .unwrap();
        let inner_load = graph
            .add_node(Tid::new("load_l"), NodeKind::Load, &callee)
            .unwrap();
        let ret = graph.add_node(Tid::new("ret"), NodeKind::Return, &callee).unwrap();
        graph.add_edge(callee_entry, local);
        graph.add_edge(local, inner_load);
        graph.add_edge(inner_load, ret);
        graph.points_to_mut(inner_load).insert_target(local, 0);
        graph.points_to_mut(test_load).insert_target(local, 0);

        let analysis = run_analysis(&mut graph);
        assert_disjoint_states(&analysis);

        assert_eq!(
            analysis.local_allocations(&callee),
            Some(&BTreeSet::from([local]))
        );
        // Inside the callee the local is still alive.
        let inner_state = unique_state(&analysis, inner_load);
        assert!(!inner_state.must_contains(local));
        assert!(!inner_state.may_contains(local));
        assert!(!graph.points_to(inner_load).has_invalidated());
        assert!(graph.points_to(inner_load).points_to_target(local));
        // After the return the local is certainly gone.
        let outer_state = root_state(&analysis, test_load);
        assert!(outer_state.must_contains(local));
        assert!(graph.points_to(test_load).has_invalidated());
        assert!(!graph.points_to(test_load).points_to_target(local));
    }

    #[test]
    fn globals_survive_the_callee_frame() {
        let mut graph = PointerGraph::new();
        let main = Tid::new("main");
        let callee = Tid::new("callee");
        let main_entry = add_procedure_with_entry(&mut graph, "main");
        let callee_entry = add_procedure_with_entry(&mut graph, "callee");
        graph.set_entry_procedure(main.clone()).unwrap();
        let global = graph
            .add_node(Tid::new("g"), NodeKind::Alloc(AllocClass::Global), &main)
            .unwrap();
        let call = graph.add_call(Tid::new("call"), &main).unwrap();
        let site = graph.add_call_return(Tid::new("site"), &main, call).unwrap();
        graph.set_callees(call, &[callee.clone()]).unwrap();
        let test_load = graph
            .add_node(Tid::new("test_load"), NodeKind::Load, &main)
            .unwrap();
        graph.add_edge(main_entry, global);
        graph.add_edge(global, call);
        graph.add_edge(site, test_load);
        let store = graph.add_node(Tid::new("store_g"), NodeKind::Store, &callee).unwrap();
        let ret = graph.add_node(Tid::new("ret"), NodeKind::Return, &callee).unwrap();
        graph.add_edge(callee_entry, store);
        graph.add_edge(store, ret);
        graph.set_operands(store, vec![global]);
        graph.points_to_mut(test_load).insert_target(global, 0);

        let analysis = run_analysis(&mut graph);
        assert_disjoint_states(&analysis);

        assert_eq!(analysis.local_allocations(&callee), None);
        let load_state = root_state(&analysis, test_load);
        assert!(!load_state.must_contains(global));
        assert!(!load_state.may_contains(global));
        assert!(!graph.points_to(test_load).has_invalidated());
        assert!(graph.points_to(test_load).points_to_target(global));
    }

    #[test]
    fn straight_line_points_share_their_predecessors_state() {
        let mut graph = PointerGraph::new();
        let main = Tid::new("main");
        let entry = add_procedure_with_entry(&mut graph, "main");
        graph.set_entry_procedure(main.clone()).unwrap();
        let alloc = graph
            .add_node(Tid::new("x"), NodeKind::Alloc(AllocClass::Heap), &main)
            .unwrap();
        let free = graph.add_node(Tid::new("free_x"), NodeKind::Free, &main).unwrap();
        let first = graph.add_node(Tid::new("n1"), NodeKind::Noop, &main).unwrap();
        let second = graph.add_node(Tid::new("n2"), NodeKind::Load, &main).unwrap();
        let third = graph.add_node(Tid::new("n3"), NodeKind::Noop, &main).unwrap();
        graph.add_edge(entry, alloc);
        graph.add_edge(alloc, free);
        graph.add_edge(free, first);
        graph.add_edge(first, second);
        graph.add_edge(second, third);
        graph.set_operands(free, vec![alloc]);

        let analysis = run_analysis(&mut graph);
        assert_disjoint_states(&analysis);

        let free_state = root_state(&analysis, free);
        assert!(free_state.must_contains(alloc));
        assert_eq!(root_state(&analysis, first), free_state);
        assert_eq!(root_state(&analysis, second), free_state);
        assert_eq!(root_state(&analysis, third), free_state);
    }

    #[test]
    fn contexts_keep_call_sites_apart() {
        let mut graph = PointerGraph::new();
        let main = Tid::new("main");
        let callee = Tid::new("callee");
        let main_entry = add_procedure_with_entry(&mut graph, "main");
        let callee_entry = add_procedure_with_entry(&mut graph, "callee");
        graph.set_entry_procedure(main.clone()).unwrap();
        let alloc = graph
            .add_node(Tid::new("x"), NodeKind::Alloc(AllocClass::Heap), &main)
            .unwrap();
        let call_a = graph.add_call(Tid::new("call_a"), &main).unwrap();
        let site_a = graph
            .add_call_return(Tid::new("site_a"), &main, call_a)
            .unwrap();
        let free = graph.add_node(Tid::new("free_x"), NodeKind::Free, &main).unwrap();
        let call_b = graph.add_call(Tid::new("call_b"), &main).unwrap();
        let site_b = graph
            .add_call_return(Tid::new("site_b"), &main, call_b)
            .unwrap();
        graph.set_callees(call_a, &[callee.clone()]).unwrap();
        graph.set_callees(call_b, &[callee.clone()]).unwrap();
        graph.add_edge(main_entry, alloc);
        graph.add_edge(alloc, call_a);
        graph.add_edge(site_a, free);
        graph.add_edge(free, call_b);
        graph.set_operands(free, vec![alloc]);

        let load = graph.add_node(Tid::new("load_x"), NodeKind::Load, &callee).unwrap();
        let ret = graph.add_node(Tid::new("ret"), NodeKind::Return, &callee).unwrap();
        graph.add_edge(callee_entry, load);
        graph.add_edge(load, ret);
        graph.points_to_mut(load).insert_target(alloc, 0);

        let analysis = run_analysis(&mut graph);
        assert_disjoint_states(&analysis);

        // The same load is analyzed once per call site.
        let units: Vec<AnalysisUnit> = analysis.units_of_node(load).collect();
        assert_eq!(units.len(), 2);
        let unit_a = units
            .iter()
            .find(|unit| analysis.contexts().call_site(unit.context) == Some(call_a))
            .unwrap();
        let unit_b = units
            .iter()
            .find(|unit| analysis.contexts().call_site(unit.context) == Some(call_b))
            .unwrap();
        // Before the free nothing is invalidated,
        // after the free the invalidation is certain.
        assert!(analysis.state(*unit_a).unwrap().is_empty());
        assert!(analysis.state(*unit_b).unwrap().must_contains(alloc));
        // Both sites in the caller see their respective callee state.
        assert!(root_state(&analysis, site_a).is_empty());
        assert!(root_state(&analysis, site_b).must_contains(alloc));
        // The shared points-to set of the load carries the repair
        // of the invalidated context.
        assert!(graph.points_to(load).has_invalidated());
        assert!(!graph.points_to(load).points_to_target(alloc));
    }

    #[test]
    fn direct_recursion_is_rejected() {
        let mut graph = PointerGraph::new();
        let main = Tid::new("main");
        let main_entry = add_procedure_with_entry(&mut graph, "main");
        graph.set_entry_procedure(main.clone()).unwrap();
        let call = graph.add_call(Tid::new("rec_call"), &main).unwrap();
        let site = graph.add_call_return(Tid::new("rec_site"), &main, call).unwrap();
        graph.set_callees(call, &[main.clone()]).unwrap();
        let ret = graph.add_node(Tid::new("ret"), NodeKind::Return, &main).unwrap();
        graph.add_edge(main_entry, call);
        graph.add_edge(site, ret);

        let error = run(
            &mut graph,
            &Config::default(),
            LogThread::create_disconnected_sender(),
        )
        .unwrap_err();
        assert_eq!(
            error,
            AnalysisError::UnsupportedRecursion { procedure: main }
        );
        assert!(error.is_unsupported());
    }

    #[test]
    fn mutual_recursion_is_rejected() {
        let mut graph = PointerGraph::new();
        let first = Tid::new("first");
        let second = Tid::new("second");
        let first_entry = add_procedure_with_entry(&mut graph, "first");
        let second_entry = add_procedure_with_entry(&mut graph, "second");
        graph.set_entry_procedure(first.clone()).unwrap();

        let call_second = graph.add_call(Tid::new("call_second"), &first).unwrap();
        let site_second = graph
            .add_call_return(Tid::new("site_second"), &first, call_second)
            .unwrap();
        graph.set_callees(call_second, &[second.clone()]).unwrap();
        let first_ret = graph.add_node(Tid::new("first_ret"), NodeKind::Return, &first).unwrap();
        graph.add_edge(first_entry, call_second);
        graph.add_edge(site_second, first_ret);

        let call_first = graph.add_call(Tid::new("call_first"), &second).unwrap();
        let site_first = graph
            .add_call_return(Tid::new("site_first"), &second, call_first)
            .unwrap();
        graph.set_callees(call_first, &[first.clone()]).unwrap();
        let second_ret = graph
            .add_node(Tid::new("second_ret"), NodeKind::Return, &second)
            .unwrap();
        graph.add_edge(second_entry, call_first);
        graph.add_edge(site_first, second_ret);

        let error = run(
            &mut graph,
            &Config::default(),
            LogThread::create_disconnected_sender(),
        )
        .unwrap_err();
        assert_eq!(
            error,
            AnalysisError::UnsupportedRecursion { procedure: first }
        );
    }

    #[test]
    fn calls_without_callees_are_rejected() {
        let mut graph = PointerGraph::new();
        let main = Tid::new("main");
        let main_entry = add_procedure_with_entry(&mut graph, "main");
        graph.set_entry_procedure(main.clone()).unwrap();
        let call = graph.add_call(Tid::new("blind_call"), &main).unwrap();
        graph
            .add_call_return(Tid::new("blind_site"), &main, call)
            .unwrap();
        graph.add_edge(main_entry, call);

        let error = run(
            &mut graph,
            &Config::default(),
            LogThread::create_disconnected_sender(),
        )
        .unwrap_err();
        assert_eq!(
            error,
            AnalysisError::UnresolvedCall {
                call: Tid::new("blind_call")
            }
        );
        assert!(error.is_unsupported());
    }

    #[test]
    fn context_ceiling_fails_closed() {
        let mut graph = PointerGraph::new();
        let main = Tid::new("main");
        let main_entry = add_procedure_with_entry(&mut graph, "main");
        let callee_entry = add_procedure_with_entry(&mut graph, "callee");
        graph.set_entry_procedure(main.clone()).unwrap();
        let call = graph.add_call(Tid::new("call"), &main).unwrap();
        let _site = graph.add_call_return(Tid::new("site"), &main, call).unwrap();
        graph.set_callees(call, &[Tid::new("callee")]).unwrap();
        let ret = graph
            .add_node(Tid::new("ret"), NodeKind::Return, &Tid::new("callee"))
            .unwrap();
        graph.add_edge(main_entry, call);
        graph.add_edge(callee_entry, ret);

        let config = Config {
            max_contexts: 1,
            ..Config::default()
        };
        let error = run(&mut graph, &config, LogThread::create_disconnected_sender()).unwrap_err();
        assert_eq!(
            error,
            AnalysisError::ContextBudgetExceeded {
                procedure: main,
                limit: 1
            }
        );
        assert!(!error.is_unsupported());
    }

    #[test]
    fn round_ceiling_fails_closed() {
        let mut graph = PointerGraph::new();
        let main = Tid::new("main");
        let entry = add_procedure_with_entry(&mut graph, "main");
        graph.set_entry_procedure(main.clone()).unwrap();
        let noop = graph.add_node(Tid::new("noop"), NodeKind::Noop, &main).unwrap();
        graph.add_edge(entry, noop);

        let config = Config {
            max_rounds: 0,
            ..Config::default()
        };
        let error = run(&mut graph, &config, LogThread::create_disconnected_sender()).unwrap_err();
        assert_eq!(error, AnalysisError::FixpointBudgetExceeded { limit: 0 });
    }

    #[test]
    fn malformed_graphs_are_an_internal_error() {
        let mut graph = PointerGraph::new();
        // No entry procedure designated.
        let error = run(
            &mut graph,
            &Config::default(),
            LogThread::create_disconnected_sender(),
        )
        .unwrap_err();
        assert!(matches!(error, AnalysisError::Internal(_)));
        assert!(!error.is_unsupported());
    }

    #[test]
    fn compact_json_lists_only_nonempty_states() {
        let mut graph = PointerGraph::new();
        let main = Tid::new("main");
        let entry = add_procedure_with_entry(&mut graph, "main");
        graph.set_entry_procedure(main.clone()).unwrap();
        let alloc = graph
            .add_node(Tid::new("x"), NodeKind::Alloc(AllocClass::Heap), &main)
            .unwrap();
        let free = graph.add_node(Tid::new("free_x"), NodeKind::Free, &main).unwrap();
        graph.add_edge(entry, alloc);
        graph.add_edge(alloc, free);
        graph.set_operands(free, vec![alloc]);

        let analysis = run_analysis(&mut graph);
        let json = analysis.to_json_compact(&graph);
        let map = json.as_object().unwrap();
        assert!(map.keys().any(|key| key.starts_with("free_x")));
        assert!(!map.keys().any(|key| key.starts_with("main_entry")));
    }
}
