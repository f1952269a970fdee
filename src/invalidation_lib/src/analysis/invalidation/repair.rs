//! The post-fixpoint pass that repairs points-to sets
//! using the computed must/may sets.

use super::state::{State, StateMap};
use super::{AnalysisError, AnalysisUnit};
use crate::pointer_graph::{PointerGraph, PointsToSet};

/// Remove all targets from the points-to set
/// whose invalidation is certain according to the given state.
/// Returns whether any target was removed.
fn fix_must(points_to: &mut PointsToSet, state: &State) -> bool {
    let mut changed = false;
    for object in state.must() {
        if points_to.points_to_target(object.node) {
            changed |= points_to.remove_target(object.node);
        }
    }
    changed
}

/// Return whether the points-to set contains a target
/// whose invalidation is possible according to the given state.
/// Possibly invalidated targets are not removed,
/// since they might still be valid on some path.
fn fix_may(points_to: &PointsToSet, state: &State) -> bool {
    state
        .may()
        .iter()
        .any(|object| points_to.points_to_target(object.node))
}

/// Repair the points-to sets of all given units.
///
/// For units whose state proves or suggests dangling targets,
/// the certain targets are removed
/// and the invalidated sentinel is added to the points-to set.
/// The sentinel is added at most once per points-to set,
/// so running the pass again on the same states
/// leaves the points-to sets unchanged.
///
/// Returns the number of points-to sets that received the sentinel.
pub(super) fn fix_points_to(
    graph: &mut PointerGraph,
    units: &[AnalysisUnit],
    states: &StateMap,
) -> Result<usize, AnalysisError> {
    let mut sentinel_count = 0;
    for &unit in units {
        let state = states.get(unit)?;
        if state.is_empty() {
            continue;
        }
        let points_to = graph.points_to_mut(unit.node);
        // Both steps run unconditionally so that may-targets
        // are detected even if must-targets were already removed.
        let removed = fix_must(points_to, state);
        let flagged = fix_may(points_to, state);
        if (removed || flagged) && points_to.set_invalidated() {
            sentinel_count += 1;
        }
    }
    Ok(sentinel_count)
}
