//! Pipeline resolution and scheduling for the Trellis engine.
//!
//! Turns a declarative pipeline document into a concrete, ordered,
//! partially-parallel execution plan and drives it to completion:
//! template resolution, strategy expansion, graph building, the run
//! loop, run-level concurrency, failure propagation, and trigger
//! matching. Everything that executes a node's payload lives behind
//! the ports in `trellis-core`.

pub mod dag;
pub mod failure;
pub mod gate;
pub mod matrix;
pub mod scheduler;
pub mod sync;
pub mod template;
pub mod triggers;

pub use dag::{ExecutionGraph, GraphBuilder};
pub use gate::{Admission, ConcurrencyGate};
pub use scheduler::Scheduler;
pub use triggers::TriggerMatcher;
