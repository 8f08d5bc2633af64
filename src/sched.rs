//! Scheduler contract and the reference queue scheduler.
//!
//! The scheduler owns the run-queue and the active call stack. The engine
//! core only consumes the contract: mutation dispatch hands it batches of
//! units, the re-entrancy guard consults its stack, and unit failures are
//! funneled to its reporting hook. [`QueueScheduler`] is the reference
//! implementation used by embeddings and tests; it drains the queue with
//! fixed-point iteration so cascading re-executions settle within one pass.

use crate::arena::{UnitId, UnitState};
use crate::error::Error;
use crate::hash::FastHashBuilder;
use indexmap::IndexSet;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Scheduler configuration surface.
#[derive(Clone, Copy, Debug, Default)]
pub struct SchedulerParams {
    /// When set, value reads inside a running unit bind a live
    /// subscription; otherwise reads return a detached snapshot.
    pub stateful_function: bool,
}

/// One reported unit failure.
#[derive(Clone, Debug)]
pub struct Report {
    /// Rendered error message.
    pub message: String,
    /// Serials of the failing unit and its nearest named ancestor.
    pub related: Vec<u64>,
}

/// The contract the engine consumes from its owning runtime.
pub trait Scheduler: Send + Sync {
    /// Enqueue units for batched re-execution. Callers pass batches already
    /// in lineage-path order; the queue must preserve it. May be called
    /// reentrantly during an ongoing pass.
    fn schedule(&self, units: &[UnitId]);

    /// Push a unit onto the active call stack.
    fn push_active(&self, unit: UnitId);

    /// Pop the top of the active call stack.
    fn pop_active(&self);

    /// Whether `unit` is anywhere on the active call stack. A unit must
    /// never be rescheduled while it is its own active ancestor.
    fn is_active(&self, unit: UnitId) -> bool;

    /// Report an unrecoverable failure of a scheduled unit.
    fn throw(&self, error: Error, related: &[u64]);

    /// Configuration options.
    fn params(&self) -> SchedulerParams;
}

/// Reference scheduler: an ordered run-queue drained by fixed-point
/// iteration, plus an inspectable error sink.
#[derive(Default)]
pub struct QueueScheduler {
    queue: Mutex<IndexSet<UnitId, FastHashBuilder>>,
    stack: Mutex<Vec<UnitId>>,
    reports: Mutex<Vec<Report>>,
    params: SchedulerParams,
}

impl QueueScheduler {
    /// Scheduler with default params (detached reads).
    pub fn new() -> Self {
        Self::default()
    }

    /// Scheduler with explicit params.
    pub fn with_params(params: SchedulerParams) -> Self {
        Self { params, ..Self::default() }
    }

    /// Process the queue until no unit is pending.
    ///
    /// Uses fixed-point iteration: units executed in one round may schedule
    /// more; the loop keeps draining until quiescent. Within a round,
    /// units run in lineage-path order. Returns the number of executions.
    pub fn flush(&self) -> usize {
        let mut total = 0;
        loop {
            let batch = self.drain_sorted();
            if batch.is_empty() {
                break;
            }
            for unit in batch {
                total += usize::from(self.run_one(unit));
            }
        }
        total
    }

    /// Async twin of [`flush`](Self::flush); awaits units with asynchronous
    /// closures instead of skipping them.
    pub async fn flush_async(&self) -> usize {
        let mut total = 0;
        loop {
            let batch = self.drain_sorted();
            if batch.is_empty() {
                break;
            }
            for unit in batch {
                if !runnable(unit) {
                    continue;
                }
                match unit.execute_async().await {
                    Ok(_) => total += 1,
                    Err(error) => self.report(unit, error),
                }
            }
        }
        total
    }

    /// Number of units currently pending.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Snapshot of reported failures.
    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().clone()
    }

    fn drain_sorted(&self) -> Vec<UnitId> {
        let mut batch: Vec<UnitId> = self.queue.lock().drain(..).collect();
        batch.sort_by_key(|u| u.path());
        batch
    }

    fn run_one(&self, unit: UnitId) -> bool {
        if !runnable(unit) {
            return false;
        }
        if unit.is_async() {
            warn!(unit = unit.serial(), "async unit requires flush_async; skipped");
            return false;
        }
        match unit.execute() {
            Ok(_) => true,
            Err(error) => {
                self.report(unit, error);
                false
            }
        }
    }

    fn report(&self, unit: UnitId, error: Error) {
        let mut related = vec![unit.serial()];
        if let Some(parent) = unit.parent() {
            related.push(parent.serial());
        }
        self.throw(error, &related);
    }
}

/// Only inert (fresh) and resuming units run from the queue; soft-aborted
/// entries are stale, completed entries were satisfied by an earlier round.
fn runnable(unit: UnitId) -> bool {
    matches!(unit.state(), UnitState::Inert | UnitState::Resuming)
}

impl Scheduler for QueueScheduler {
    fn schedule(&self, units: &[UnitId]) {
        let mut queue = self.queue.lock();
        for unit in units {
            queue.insert(*unit);
        }
        debug!(scheduled = units.len(), pending = queue.len(), "schedule");
    }

    fn push_active(&self, unit: UnitId) {
        self.stack.lock().push(unit);
    }

    fn pop_active(&self) {
        self.stack.lock().pop();
    }

    fn is_active(&self, unit: UnitId) -> bool {
        self.stack.lock().contains(&unit)
    }

    fn throw(&self, error: Error, related: &[u64]) {
        warn!(%error, ?related, "unit failure");
        self.reports.lock().push(Report {
            message: error.to_string(),
            related: related.to_vec(),
        });
    }

    fn params(&self) -> SchedulerParams {
        self.params
    }
}
