/*!
A library for detecting invalidated (dangling) pointers in points-to graphs.

The library implements an interprocedural, context-sensitive dataflow
analysis that runs on top of an already-computed points-to graph.
For every program point, evaluated separately for every calling context
reaching it, the analysis computes two disjoint sets of memory objects:
those that are *definitely* invalidated (freed, or a local variable whose
owning stack frame has returned) and those that are *possibly* invalidated
on at least one path.
Afterwards the points-to information at each point is repaired:
pointer targets proven dangling are removed
and targets that might be dangling are flagged with an invalidated marker,
so that downstream clients can treat them conservatively.

The pointer graph itself is an input:
it is expected to be built by a front-end and annotated with the results
of a preceding pointer analysis before this analysis runs.
The [`pointer_graph`] module provides the graph representation
together with a builder API, which is also used by the tests of this crate.

# Usage

```ignore
use invalidation_lib::analysis::invalidation::{self, Config};
use invalidation_lib::utils::log::LogThread;

let mut graph = /* build the pointer graph and its points-to sets */;
let log_thread = LogThread::spawn(LogThread::collect_all);
let analysis = invalidation::run(&mut graph, &Config::default(), log_thread.get_msg_sender())?;
// The points-to sets of `graph` are now repaired.
// `analysis` grants access to the raw must/may sets per (point, context) pair.
```

The analysis rejects recursive call structures and calls without known
callees with a dedicated error variant instead of computing unsound
results, see [`analysis::invalidation::AnalysisError`].
*/

pub mod analysis;
pub mod pointer_graph;
pub mod utils;

mod prelude {
    pub use anyhow::{anyhow, Error};
    pub use serde::{Deserialize, Serialize};

    pub use crate::pointer_graph::Tid;
}
