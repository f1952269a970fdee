//! The must/may lattice of the analysis and the storage for per-unit states.

use super::{AnalysisError, AnalysisUnit};
use crate::prelude::*;
use fnv::FnvHashMap;
use itertools::Itertools;
use petgraph::graph::NodeIndex;
use std::collections::BTreeSet;

/// The dataflow fact attached to one analysis unit.
///
/// `must` holds the objects that are invalidated on every path reaching the unit,
/// `may` holds the objects that are invalidated on at least one such path.
/// The two sets are disjoint at all times:
/// an object whose invalidation becomes certain is moved out of `may`.
/// Objects are represented as analysis units themselves,
/// i.e. the allocation node of the object
/// paired with the context the invalidated object belongs to
/// (the root context for heap objects,
/// the torn-down frame's context for local variables).
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default)]
pub struct State {
    must: BTreeSet<AnalysisUnit>,
    may: BTreeSet<AnalysisUnit>,
}

impl State {
    /// Create a new state with empty must and may sets.
    pub fn new() -> State {
        State::default()
    }

    /// Return whether both sets of the state are empty.
    pub fn is_empty(&self) -> bool {
        self.must.is_empty() && self.may.is_empty()
    }

    /// Get the set of objects that are certainly invalidated at this unit.
    pub fn must(&self) -> &BTreeSet<AnalysisUnit> {
        &self.must
    }

    /// Get the set of objects that are possibly invalidated at this unit.
    pub fn may(&self) -> &BTreeSet<AnalysisUnit> {
        &self.may
    }

    /// Return whether the must set contains the object allocated at the given node,
    /// under any context tag.
    pub fn must_contains(&self, node: NodeIndex) -> bool {
        self.must.iter().any(|unit| unit.node == node)
    }

    /// Return whether the may set contains the object allocated at the given node,
    /// under any context tag.
    pub fn may_contains(&self, node: NodeIndex) -> bool {
        self.may.iter().any(|unit| unit.node == node)
    }

    /// Insert an object into the must set.
    /// If the object was only possibly invalidated before, it is promoted.
    /// Returns whether the state changed.
    pub(super) fn insert_must(&mut self, object: AnalysisUnit) -> bool {
        let promoted = self.may.remove(&object);
        self.must.insert(object) || promoted
    }

    /// Insert an object into the may set,
    /// unless its invalidation is already certain.
    /// Returns whether the state changed.
    pub(super) fn insert_may(&mut self, object: AnalysisUnit) -> bool {
        if self.must.contains(&object) {
            return false;
        }
        self.may.insert(object)
    }

    /// Merge the states of all predecessors of a unit into this state.
    ///
    /// The intersection of the predecessors' must sets joins the must set:
    /// only objects invalidated on every incoming path stay certain.
    /// Everything invalidated on some incoming path joins the may set,
    /// from which the now-certain objects are removed again
    /// to keep the two sets disjoint.
    /// Objects already in the may set survive the merge.
    ///
    /// Returns whether the state changed.
    pub(super) fn update(&mut self, predecessors: &[State]) -> bool {
        let must_size_before = self.must.len();
        let may_before = self.may.clone();

        self.must.extend(Self::must_intersection(predecessors));

        let mut possible = std::mem::take(&mut self.may);
        for predecessor in predecessors {
            possible.extend(predecessor.must.iter().copied());
            possible.extend(predecessor.may.iter().copied());
        }
        self.may = possible.difference(&self.must).copied().collect();

        self.must.len() != must_size_before || self.may != may_before
    }

    /// Compute the intersection of the must sets of the given states.
    /// The empty intersection of zero states is the empty set.
    fn must_intersection(states: &[State]) -> BTreeSet<AnalysisUnit> {
        let Some((first, rest)) = states.split_first() else {
            return BTreeSet::new();
        };
        let mut result = first.must.clone();
        for state in rest {
            result = result.intersection(&state.must).copied().collect();
        }
        result
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            "MUST: {{ {} }} MAY: {{ {} }}",
            self.must.iter().map(|unit| unit.to_string()).join(", "),
            self.may.iter().map(|unit| unit.to_string()).join(", "),
        )
    }
}

/// One slot of the [`StateMap`].
#[derive(Debug, Clone)]
enum StateSlot {
    /// The unit owns its state.
    Owned(State),
    /// The unit shares the state of another unit.
    /// Pass-through units in straight-line code are aliased
    /// to the owner of their predecessor's state
    /// instead of paying for a full merge.
    AliasOf(AnalysisUnit),
}

/// The storage for the states of all analysis units.
///
/// Reads resolve alias slots to the owning unit first,
/// so the state of a pass-through unit
/// is always its predecessor's state by value.
#[derive(Debug, Clone, Default)]
pub(super) struct StateMap {
    slots: FnvHashMap<AnalysisUnit, StateSlot>,
}

impl StateMap {
    /// Create an empty state map.
    pub fn new() -> StateMap {
        StateMap::default()
    }

    /// Register a unit with an owned, empty state.
    /// Registering an already known unit has no effect.
    pub fn register(&mut self, unit: AnalysisUnit) {
        self.slots
            .entry(unit)
            .or_insert_with(|| StateSlot::Owned(State::new()));
    }

    /// Resolve the given unit to the unit owning its state.
    pub fn resolve(&self, unit: AnalysisUnit) -> Result<AnalysisUnit, AnalysisError> {
        let mut current = unit;
        // The alias chain is at most as long as the number of slots.
        for _ in 0..=self.slots.len() {
            match self.slots.get(&current) {
                Some(StateSlot::Owned(_)) => return Ok(current),
                Some(StateSlot::AliasOf(next)) => current = *next,
                None => {
                    return Err(AnalysisError::Internal(format!(
                        "no state registered for analysis unit {unit}"
                    )))
                }
            }
        }
        Err(AnalysisError::Internal(format!(
            "state alias cycle at analysis unit {unit}"
        )))
    }

    /// Get the state of the given unit, resolving aliases.
    pub fn get(&self, unit: AnalysisUnit) -> Result<&State, AnalysisError> {
        let owner = self.resolve(unit)?;
        match self.slots.get(&owner) {
            Some(StateSlot::Owned(state)) => Ok(state),
            _ => Err(AnalysisError::Internal(format!(
                "alias resolution for analysis unit {unit} did not end at an owned state"
            ))),
        }
    }

    /// Get a mutable reference to the state owned by the given unit.
    /// Units whose state is aliased cannot be mutated through this method;
    /// attempting to do so is an internal error.
    pub fn get_owned_mut(&mut self, unit: AnalysisUnit) -> Result<&mut State, AnalysisError> {
        match self.slots.get_mut(&unit) {
            Some(StateSlot::Owned(state)) => Ok(state),
            Some(StateSlot::AliasOf(_)) => Err(AnalysisError::Internal(format!(
                "analysis unit {unit} does not own its state"
            ))),
            None => Err(AnalysisError::Internal(format!(
                "no state registered for analysis unit {unit}"
            ))),
        }
    }

    /// Alias the state of a unit to the state of its predecessor.
    ///
    /// The alias always points at the current owner of the predecessor's state,
    /// so re-aliasing on every visit keeps the indirection one level deep
    /// even if the predecessor itself got aliased in the meantime.
    pub fn set_alias(
        &mut self,
        unit: AnalysisUnit,
        predecessor: AnalysisUnit,
    ) -> Result<(), AnalysisError> {
        let owner = self.resolve(predecessor)?;
        if owner == unit {
            return Err(AnalysisError::Internal(format!(
                "aliasing the state of analysis unit {unit} to itself"
            )));
        }
        self.slots.insert(unit, StateSlot::AliasOf(owner));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::calling_context::CallingContextTree;

    fn unit(node: usize) -> AnalysisUnit {
        AnalysisUnit::new(NodeIndex::new(node), CallingContextTree::new().root())
    }

    #[test]
    fn merge_intersects_must_and_unions_may() {
        let mut left = State::new();
        left.insert_must(unit(1));
        left.insert_must(unit(2));
        let mut right = State::new();
        right.insert_must(unit(2));
        right.insert_may(unit(3));

        let mut state = State::new();
        assert!(state.update(&[left, right]));
        // Only the common must element stays certain.
        assert!(state.must_contains(NodeIndex::new(2)));
        assert!(!state.must_contains(NodeIndex::new(1)));
        // Everything else becomes a possibility.
        assert!(state.may_contains(NodeIndex::new(1)));
        assert!(state.may_contains(NodeIndex::new(3)));
        assert!(!state.may_contains(NodeIndex::new(2)));
    }

    #[test]
    fn merge_promotes_may_elements_into_must() {
        let mut state = State::new();
        state.insert_may(unit(1));
        let mut pred = State::new();
        pred.insert_must(unit(1));

        assert!(state.update(&[pred.clone()]));
        assert!(state.must_contains(NodeIndex::new(1)));
        assert!(!state.may_contains(NodeIndex::new(1)));
        // A second merge with the same predecessor changes nothing.
        assert!(!state.update(&[pred]));
    }

    #[test]
    fn merge_is_monotone() {
        let mut pred = State::new();
        pred.insert_may(unit(1));
        let mut state = State::new();
        state.update(&[pred.clone()]);
        let may_size = state.may().len();

        pred.insert_must(unit(2));
        state.update(&[pred]);
        // must never shrinks and must + may never loses an element.
        assert!(state.must_contains(NodeIndex::new(2)));
        assert!(state.may().len() >= may_size);
        assert!(state.may_contains(NodeIndex::new(1)));
    }

    #[test]
    fn merge_without_predecessors_keeps_the_state() {
        let mut state = State::new();
        state.insert_must(unit(1));
        state.insert_may(unit(2));
        assert!(!state.update(&[]));
        assert!(state.must_contains(NodeIndex::new(1)));
        assert!(state.may_contains(NodeIndex::new(2)));
    }

    #[test]
    fn must_and_may_stay_disjoint() {
        let mut state = State::new();
        state.insert_may(unit(1));
        state.insert_must(unit(1));
        assert!(state.must_contains(NodeIndex::new(1)));
        assert!(!state.may_contains(NodeIndex::new(1)));
        // Inserting into may after the promotion has no effect.
        assert!(!state.insert_may(unit(1)));
        assert!(state.must().intersection(state.may()).next().is_none());
    }

    #[test]
    fn alias_chains_resolve_to_the_owner() {
        let mut states = StateMap::new();
        states.register(unit(1));
        states.register(unit(2));
        states.register(unit(3));
        states.set_alias(unit(2), unit(1)).unwrap();
        // Aliasing to an aliased unit points at the owner directly.
        states.set_alias(unit(3), unit(2)).unwrap();
        assert_eq!(states.resolve(unit(3)).unwrap(), unit(1));

        states
            .get_owned_mut(unit(1))
            .unwrap()
            .insert_must(unit(7));
        assert!(states.get(unit(3)).unwrap().must_contains(NodeIndex::new(7)));
        assert!(states.get_owned_mut(unit(2)).is_err());
    }

    #[test]
    fn unregistered_units_are_an_internal_error() {
        let states = StateMap::new();
        assert!(matches!(
            states.get(unit(1)),
            Err(AnalysisError::Internal(_))
        ));
    }
}
