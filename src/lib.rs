#![deny(missing_docs)]

//! Fine-grained reactive execution engine.
//!
//! Given a program statically classified (by an external compiler) into a
//! tree of reactive units annotated with the state paths each unit reads
//! and writes, the engine re-executes exactly the units whose inputs
//! changed, in a deterministic order, while propagating break/continue/
//! return across nested blocks, loops, and asynchronous boundaries.
//!
//! # Quick Start
//!
//! ```ignore
//! use reflow::{Autorun, DeclKind, Key, QueueScheduler, UnitKind, UnitSpec, Value};
//! use std::sync::Arc;
//!
//! let sched = Arc::new(QueueScheduler::new());
//! let program = Autorun::root(
//!     sched.clone(),
//!     UnitSpec::new(UnitKind::Module).closure(|unit| {
//!         unit.declare(DeclKind::Let, "count", 1, |_| Ok(Value::Number(0.0)))?;
//!         Ok(Value::Undefined)
//!     }),
//! )?;
//!
//! // Mutate observed state; dependent units re-run on the next flush.
//! program.id().set(&[Key::from("count")], Value::Number(1.0))?;
//! sched.flush();
//! ```
//!
//! # Core Types
//!
//! - [`Value`] / [`Key`] - the dynamic state model observed by the engine.
//! - [`Signal`] - observable holder of one state slot, with lazily created
//!   children per dereferenced sub-path.
//! - [`Autorun`] / [`UnitSpec`] - execution units: schedulable nodes owning
//!   a closure, a scope, and flow-control bookkeeping.
//! - [`LoopSpec`] - iterator units reconciling loop rounds incrementally
//!   against live mutations of the iterated collection.
//! - [`Scheduler`] / [`QueueScheduler`] - the run-queue/call-stack contract
//!   the engine consumes, and its reference implementation.
//!
//! # Ordering
//!
//! Every unit carries a lineage path (ancestor positions plus its own
//! slot). Between any two concurrently pending units, lexicographic path
//! order decides execution precedence: ancestors before descendants, lower
//! slots first — never arrival time, which keeps mutation storms
//! deterministic.
//!
//! # Flow control
//!
//! `break`/`continue`/`return` are recorded on the raising unit, absorbed
//! where their target matches (the nearest iteration with the right label,
//! the enclosing function for returns), and hoisted to the parent
//! otherwise. A newly raised command soft-aborts whatever it cuts off — a
//! block's continuation, the later rounds of a loop — and a newly cleared
//! one resumes exactly those units.

// Internal modules
pub(crate) mod arena;
mod error;
mod hash;
mod iter;
mod iter_async;
mod lifecycle;
mod scope;
mod sched;
mod signal;
mod unit;
mod value;

// Core types
pub use arena::{
    Command, FlowKind, FlowSet, ScopeKind, SignalId, SignalKind, UnitId, UnitKind, UnitState,
};
pub use error::{Error, Result};
pub use hash::FastHashBuilder;
pub use iter::{LoopKind, LoopSpec, RoundFactory};
pub use lifecycle::{CleanupKey, Lifecycle};
pub use scope::{DeclKind, Symbol, project};
pub use sched::{QueueScheduler, Report, Scheduler, SchedulerParams};
pub use signal::{Mutation, MutationKind, Signal};
pub use unit::{Autorun, CompletionFn, MutationFilter, UnitClosure, UnitSpec};
pub use value::{Key, ObjectMap, Value};
