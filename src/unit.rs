//! Execution units: schedulable nodes owning a closure, a scope, and
//! flow-control bookkeeping.
//!
//! Units form a tree mirroring block/loop/function nesting. Each execution
//! clears the unit's flow-control slots, runs the closure, and diffs the
//! slots against the pre-run snapshot: newly raised commands are absorbed
//! where their label matches (rounds and iterations for break/continue,
//! functions for return) and hoisted to the parent otherwise; newly cleared
//! commands resume whatever they were blocking — a block's downstream
//! continuation, or the later rounds of an iteration ("rightstream").

use crate::arena::{
    Command, FlowKind, FlowSet, ScopeKind, SignalId, SignalMetadata, UnitId, UnitKind,
    UnitMetadata, UnitState, next_serial, signal_arena_insert, unit_arena_insert,
    unit_arena_remove, unit_children, unit_register_child, unit_unregister,
};
use crate::error::{Error, Result};
use crate::hash::FastHashBuilder;
use crate::iter::{IterState, LoopSpec};
use crate::scope::{DeclKind, project};
use crate::sched::Scheduler;
use crate::signal::Mutation;
use crate::value::{Key, Value};
use futures::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64};
use tracing::{debug, trace};

/// A unit body: synchronous, or suspending at scheduler-visible points.
pub enum UnitClosure {
    /// Plain closure; runs to completion on the caller's stack.
    Sync(Box<dyn FnMut(UnitId) -> Result<Value> + Send>),
    /// Asynchronous closure; driven by an async flush.
    Async(Box<dyn FnMut(UnitId) -> BoxFuture<'static, Result<Value>> + Send>),
}

impl UnitClosure {
    /// Wrap a synchronous body.
    pub fn sync(f: impl FnMut(UnitId) -> Result<Value> + Send + 'static) -> Self {
        UnitClosure::Sync(Box::new(f))
    }

    /// Wrap an asynchronous body.
    pub fn async_(
        f: impl FnMut(UnitId) -> BoxFuture<'static, Result<Value>> + Send + 'static,
    ) -> Self {
        UnitClosure::Async(Box::new(f))
    }

    pub(crate) fn is_async(&self) -> bool {
        matches!(self, UnitClosure::Async(_))
    }
}

/// Transform applied to a unit's result; declarations and assignments
/// perform their scope write here so every assignment rides the same
/// schedule/execute/flow machinery as any other statement.
pub type CompletionFn = Box<dyn FnMut(UnitId, Value) -> Result<Value> + Send>;

/// Pre-schedule filter: return `false` to keep a specific mutation from
/// rescheduling the unit.
pub type MutationFilter = Box<dyn Fn(&Mutation) -> bool + Send + Sync>;

/// Declarative description of a unit, produced per construct by the
/// compiler (or by embedding code).
pub struct UnitSpec {
    /// The construct kind.
    pub kind: UnitKind,
    /// Statement label matched by labeled break/continue.
    pub label: Option<String>,
    /// Per-round binding name for loop kinds.
    pub production: Option<String>,
    /// The unit body.
    pub closure: Option<UnitClosure>,
    /// Result transform.
    pub completion: Option<CompletionFn>,
    /// Pre-schedule mutation filter.
    pub filter: Option<MutationFilter>,
    /// Loop description; required for `UnitKind::Iteration`.
    pub loop_spec: Option<LoopSpec>,
}

impl UnitSpec {
    /// Empty spec of the given kind.
    pub fn new(kind: UnitKind) -> Self {
        Self {
            kind,
            label: None,
            production: None,
            closure: None,
            completion: None,
            filter: None,
            loop_spec: None,
        }
    }

    /// Set the statement label.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the per-round binding name.
    pub fn production(mut self, name: impl Into<String>) -> Self {
        self.production = Some(name.into());
        self
    }

    /// Set a synchronous body.
    pub fn closure(mut self, f: impl FnMut(UnitId) -> Result<Value> + Send + 'static) -> Self {
        self.closure = Some(UnitClosure::sync(f));
        self
    }

    /// Set an asynchronous body.
    pub fn closure_async(
        mut self,
        f: impl FnMut(UnitId) -> BoxFuture<'static, Result<Value>> + Send + 'static,
    ) -> Self {
        self.closure = Some(UnitClosure::async_(f));
        self
    }

    /// Set the result transform.
    pub fn completion(
        mut self,
        f: impl FnMut(UnitId, Value) -> Result<Value> + Send + 'static,
    ) -> Self {
        self.completion = Some(Box::new(f));
        self
    }

    /// Set the pre-schedule mutation filter.
    pub fn filter(mut self, f: impl Fn(&Mutation) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Box::new(f));
        self
    }

    /// Attach a loop description.
    pub fn loop_spec(mut self, spec: LoopSpec) -> Self {
        self.loop_spec = Some(spec);
        self
    }

    fn is_async(&self) -> bool {
        self.closure.as_ref().is_some_and(UnitClosure::is_async)
            || self.loop_spec.as_ref().is_some_and(LoopSpec::is_async)
    }
}

/// RAII guard for the scheduler's active call stack. Ensures the unit is
/// popped even if its closure panics.
pub(crate) struct StackGuard {
    sched: Arc<dyn Scheduler>,
}

impl StackGuard {
    pub(crate) fn new(sched: Arc<dyn Scheduler>, unit: UnitId) -> Self {
        sched.push_active(unit);
        Self { sched }
    }
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        self.sched.pop_active();
    }
}

/// Guard that restores a taken-out closure to the arena on drop (even on
/// panic), so the arena lock is never held across user code.
struct ClosureGuard {
    unit: UnitId,
    closure: Option<UnitClosure>,
}

impl Drop for ClosureGuard {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            self.unit.with(|m| *m.closure.lock() = Some(closure));
        }
    }
}

struct CompletionGuard {
    unit: UnitId,
    completion: Option<CompletionFn>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(f) = self.completion.take() {
            self.unit.with(|m| *m.completion.lock() = Some(f));
        }
    }
}

impl UnitId {
    /// Whether the unit (or its loop) carries an asynchronous body.
    pub fn is_async(self) -> bool {
        self.with(|m| m.is_async).unwrap_or(false)
    }

    /// Label of this unit's spec.
    pub(crate) fn unit_label(self) -> Option<String> {
        self.with(|m| m.label.clone()).flatten()
    }

    pub(crate) fn unit_kind(self) -> Option<UnitKind> {
        self.with(|m| m.kind)
    }

    pub(crate) fn label_matches(self, arg: &Value) -> bool {
        match arg {
            Value::String(label) if !label.is_empty() => {
                self.unit_label().as_deref() == Some(label.as_str())
            }
            _ => true,
        }
    }

    /// Build a unit. `inherited_scope` is the lexical parent frame; kinds
    /// that own a scope open a child frame under it.
    pub(crate) fn create(
        context: Option<UnitId>,
        inherited_scope: Option<SignalId>,
        spec: UnitSpec,
        scheduler: Arc<dyn Scheduler>,
        slot_override: Option<u64>,
        round_key: Option<Key>,
    ) -> Result<UnitId> {
        let serial = next_serial();
        let path: Box<[u64]> = match context {
            Some(parent) => {
                let slot =
                    slot_override.unwrap_or_else(|| parent.with(|m| m.next_slot()).unwrap_or(0));
                let mut p = parent.path();
                p.push(slot);
                p.into_boxed_slice()
            }
            None => Box::new([slot_override.unwrap_or(0)]),
        };

        let owns_scope = spec.kind.owns_scope();
        let scope = if owns_scope {
            let scope_kind = match spec.kind {
                UnitKind::Module => ScopeKind::Module,
                UnitKind::Function => ScopeKind::Function,
                UnitKind::Block | UnitKind::Iteration => ScopeKind::Block,
                UnitKind::Round => ScopeKind::Round,
                _ => unreachable!("owns_scope covers scope-opening kinds"),
            };
            signal_arena_insert(SignalMetadata::scope(scope_kind, inherited_scope))
        } else {
            inherited_scope.ok_or(Error::UnitGone)?
        };

        let is_async = spec.is_async();
        let meta = UnitMetadata {
            kind: spec.kind,
            scope,
            owns_scope,
            path,
            serial,
            label: spec.label,
            production: spec.production,
            state: AtomicU8::new(UnitState::Inert as u8),
            closure: Mutex::new(spec.closure),
            completion: Mutex::new(spec.completion),
            flow: Mutex::new(FlowSet::default()),
            memo: Mutex::new(IndexMap::with_hasher(FastHashBuilder)),
            inbox: Mutex::new(Vec::new()),
            filter: spec.filter,
            downstream: Mutex::new(None),
            round_key,
            iter: spec.loop_spec.map(|ls| Mutex::new(IterState::new(ls))),
            is_async,
            next_slot: AtomicU64::new(0),
            scheduler,
            lifecycle: crate::lifecycle::Lifecycle::new(),
        };
        let id = unit_arena_insert(meta);
        if let Some(parent) = context {
            unit_register_child(parent, id);
        }
        trace!(unit = id.index(), serial, kind = ?id.unit_kind(), "unit created");
        Ok(id)
    }

    /// Create a child unit and, for synchronous specs, execute it inline.
    /// Asynchronous specs are enqueued for the next async flush instead.
    pub fn autorun(self, spec: UnitSpec) -> Result<UnitId> {
        let (scope, sched) = self
            .with(|m| (m.scope, m.scheduler.clone()))
            .ok_or(Error::UnitGone)?;
        let run_async = spec.is_async();
        let unit = UnitId::create(Some(self), Some(scope), spec, sched.clone(), None, None)?;
        if run_async {
            sched.schedule(&[unit]);
        } else {
            unit.execute()?;
        }
        Ok(unit)
    }

    /// Create a child unit and enqueue it instead of executing inline; the
    /// scheduler runs it in lineage order. Statement sequences use this so
    /// a block can abort its continuation before the continuation's turn.
    pub fn autorun_deferred(self, spec: UnitSpec) -> Result<UnitId> {
        let (scope, sched) = self
            .with(|m| (m.scope, m.scheduler.clone()))
            .ok_or(Error::UnitGone)?;
        let unit = UnitId::create(Some(self), Some(scope), spec, sched.clone(), None, None)?;
        sched.schedule(&[unit]);
        Ok(unit)
    }

    /// Create a child unit with an asynchronous body and execute it inline.
    pub async fn autorun_async(self, spec: UnitSpec) -> Result<UnitId> {
        let (scope, sched) = self
            .with(|m| (m.scope, m.scheduler.clone()))
            .ok_or(Error::UnitGone)?;
        let unit = UnitId::create(Some(self), Some(scope), spec, sched, None, None)?;
        unit.execute_async().await?;
        Ok(unit)
    }

    fn prepare(self) -> Option<(Arc<dyn Scheduler>, UnitKind, FlowSet)> {
        let (sched, kind, state) =
            self.with(|m| (m.scheduler.clone(), m.kind, m.state()))?;
        if matches!(state, UnitState::Aborted | UnitState::Running) {
            return None;
        }
        // A re-run rebuilds the unit's children and subscriptions from
        // scratch; stale ones are torn down first. Iterations reconcile
        // their rounds instead and keep their iteratee subscription.
        if state == UnitState::Resuming && kind != UnitKind::Iteration {
            for child in unit_children(self) {
                child.abort(true);
            }
            let cleanups = self.with(|m| m.lifecycle.drain_once()).unwrap_or_default();
            for cleanup in cleanups {
                cleanup();
            }
        }
        self.set_state(UnitState::Running);
        let before = self
            .with(|m| {
                m.memo.lock().clear();
                if kind != UnitKind::Iteration {
                    m.inbox.lock().clear();
                }
                std::mem::take(&mut *m.flow.lock())
            })
            .unwrap_or_default();
        Some((sched, kind, before))
    }

    /// Execute this unit synchronously.
    ///
    /// Pushes the unit on the scheduler's call stack, snapshots and clears
    /// the flow slots, runs the closure, applies the completion transform,
    /// then settles flow-control effects against the snapshot. Declaration
    /// and reference errors propagate to the caller; when there is no
    /// direct caller (a scheduled re-run) the scheduler reports them.
    pub fn execute(self) -> Result<Value> {
        let Some((sched, kind, before)) = self.prepare() else {
            return Ok(Value::Undefined);
        };
        if kind == UnitKind::Iteration {
            return crate::iter::run_iteration(self, &sched, before);
        }
        let result = {
            let _stack = StackGuard::new(sched.clone(), self);
            self.run_closure()
        };
        self.conclude(kind, result, before)
    }

    /// Execute this unit, awaiting asynchronous bodies.
    pub async fn execute_async(self) -> Result<Value> {
        let Some((sched, kind, before)) = self.prepare() else {
            return Ok(Value::Undefined);
        };
        if kind == UnitKind::Iteration {
            return if self.is_async() {
                crate::iter_async::run_iteration_async(self, &sched, before).await
            } else {
                crate::iter::run_iteration(self, &sched, before)
            };
        }
        let result = {
            let _stack = StackGuard::new(sched.clone(), self);
            self.run_closure_async().await
        };
        self.conclude(kind, result, before)
    }

    fn run_closure(self) -> Result<Value> {
        let closure = self.with(|m| m.closure.lock().take()).flatten();
        let Some(closure) = closure else {
            return Ok(Value::Undefined);
        };
        let mut guard = ClosureGuard { unit: self, closure: Some(closure) };
        match guard.closure.as_mut().expect("just set") {
            UnitClosure::Sync(f) => f(self),
            UnitClosure::Async(_) => Err(Error::closure("async unit executed synchronously")),
        }
    }

    async fn run_closure_async(self) -> Result<Value> {
        let closure = self.with(|m| m.closure.lock().take()).flatten();
        let Some(closure) = closure else {
            return Ok(Value::Undefined);
        };
        let mut guard = ClosureGuard { unit: self, closure: Some(closure) };
        match guard.closure.as_mut().expect("just set") {
            UnitClosure::Sync(f) => f(self),
            UnitClosure::Async(f) => f(self).await,
        }
    }

    fn conclude(self, kind: UnitKind, result: Result<Value>, before: FlowSet) -> Result<Value> {
        let value = match result {
            Ok(v) => v,
            Err(error) => {
                self.set_state(UnitState::Complete);
                return Err(error);
            }
        };
        // A function's result is the absorbed return value, if one was
        // raised during the body. Marking it endpoint keeps it from
        // hoisting past the function.
        let value = if matches!(kind, UnitKind::Function | UnitKind::Module) {
            self.with(|m| {
                let mut flow = m.flow.lock();
                let returned = flow.get(FlowKind::Return).map(|c| c.arg.clone());
                if returned.is_some() {
                    flow.mark_endpoint(FlowKind::Return);
                }
                returned
            })
            .flatten()
            .unwrap_or(value)
        } else {
            value
        };
        let completed = self.run_completion(value);
        self.set_state(UnitState::Complete);
        let value = completed?;
        let after = self.with(|m| m.flow.lock().clone()).unwrap_or_default();
        self.settle(kind, &before, after);
        Ok(value)
    }

    fn run_completion(self, value: Value) -> Result<Value> {
        let completion = self.with(|m| m.completion.lock().take()).flatten();
        let Some(completion) = completion else {
            return Ok(value);
        };
        let mut guard = CompletionGuard { unit: self, completion: Some(completion) };
        guard.completion.as_mut().expect("just set")(self, value)
    }

    /// Compare post-run flow slots against the pre-run snapshot and
    /// propagate: endpoint absorption for rounds, downstream effects for
    /// blocks, rightstream effects for rounds, then hoist what is left.
    pub(crate) fn settle(self, kind: UnitKind, before: &FlowSet, mut after: FlowSet) {
        let parent = self.parent();

        // Endpoint absorption: a round consumes break/continue aimed at its
        // own iteration; the command is recorded as a breakpoint there and
        // not hoisted.
        if kind == UnitKind::Round
            && let Some(iteration) = parent
        {
            for flow_kind in [FlowKind::Break, FlowKind::Continue] {
                let Some(cmd) = after.get(flow_kind) else { continue };
                if cmd.endpoint || !iteration.label_matches(&cmd.arg) {
                    continue;
                }
                cov_mark::hit!(endpoint_absorbed_at_round);
                let origin = cmd.origin;
                after.mark_endpoint(flow_kind);
                self.with(|m| m.flow.lock().mark_endpoint(flow_kind));
                let round_key = self.with(|m| m.round_key.clone()).flatten();
                crate::iter::record_breakpoint(iteration, flow_kind, round_key, origin);
            }
        }

        // Downstream: a block controls its declared continuation.
        if kind == UnitKind::Block
            && let Some(downstream) = self.with(|m| *m.downstream.lock()).flatten()
        {
            let blocks_now = !after.is_empty();
            let blocked_before = !before.is_empty();
            if blocks_now && !blocked_before {
                cov_mark::hit!(downstream_aborted);
                downstream.abort(false);
            } else if !blocks_now && blocked_before {
                cov_mark::hit!(downstream_resumed);
                downstream.resume();
            }
        }

        // Rightstream: a round controls the rounds after it.
        if kind == UnitKind::Round
            && let Some(iteration) = parent
        {
            let blocks_now = blocks_rightstream(&after);
            let blocked_before = blocks_rightstream(before);
            if blocks_now && !blocked_before {
                cov_mark::hit!(rightstream_aborted);
                for round in crate::iter::rounds_after(iteration, self) {
                    round.abort(false);
                }
            } else if !blocks_now && blocked_before {
                cov_mark::hit!(rightstream_resumed);
                crate::iter::clear_breakpoint_from_round(iteration, self);
                for round in crate::iter::rounds_after(iteration, self) {
                    round.resume();
                }
                // Stale hoisted copies of the cleared commands unblock too.
                for flow_kind in [FlowKind::Break, FlowKind::Return] {
                    if let Some(cmd) = before.get(flow_kind)
                        && after.get(flow_kind).is_none()
                    {
                        iteration.clear_flow_upward(flow_kind, cmd.origin);
                    }
                }
                // With the blockage gone new rounds may need appending.
                if !crate::iter::is_iterating(iteration) {
                    if iteration.state() == UnitState::Complete {
                        iteration.set_state(UnitState::Resuming);
                    }
                    if let Some(sched) = self.with(|m| m.scheduler.clone()) {
                        sched.schedule(&[iteration]);
                    }
                }
            }
        }

        // Hoist every still-pending, unabsorbed command to the parent.
        if let Some(parent) = parent {
            for (flow_kind, cmd) in after.iter() {
                if !cmd.endpoint {
                    parent.apply_flow(flow_kind, cmd.arg.clone(), cmd.origin);
                }
            }
            // Cleared commands that were hoisted on an earlier run are
            // retracted from the ancestor chain. Rounds retract through
            // their rightstream handling; iterations never raise their own
            // commands — their slots only park hoisted ones.
            if !matches!(kind, UnitKind::Round | UnitKind::Iteration) {
                for (flow_kind, cmd) in before.iter() {
                    if after.get(flow_kind).is_none() && !cmd.endpoint {
                        parent.clear_flow_upward(flow_kind, cmd.origin);
                    }
                }
            }
        }
    }

    /// Apply a flow-control command to this unit: absorb it if this unit
    /// is the matching endpoint, otherwise record it and hoist to the
    /// parent, recursively.
    pub(crate) fn apply_flow(self, kind: FlowKind, arg: Value, origin: u64) {
        let Some(unit_kind) = self.unit_kind() else { return };
        match (kind, unit_kind) {
            (FlowKind::Break | FlowKind::Continue, UnitKind::Iteration)
                if self.label_matches(&arg) =>
            {
                cov_mark::hit!(flow_absorbed_at_iteration);
                crate::iter::record_breakpoint(self, kind, None, origin);
            }
            (FlowKind::Return, UnitKind::Function | UnitKind::Module) => {
                self.with(|m| {
                    m.flow.lock().set(kind, Command { arg, endpoint: true, origin });
                });
            }
            _ => {
                self.with(|m| {
                    m.flow
                        .lock()
                        .set(kind, Command { arg: arg.clone(), endpoint: false, origin });
                });
                // A break/return passing through an iteration keeps its
                // pulls blocked durably, across the iteration's own re-runs.
                if unit_kind == UnitKind::Iteration
                    && matches!(kind, FlowKind::Break | FlowKind::Return)
                {
                    crate::iter::mark_blocked(self, kind, origin);
                }
                if let Some(parent) = self.parent() {
                    parent.apply_flow(kind, arg, origin);
                }
            }
        }
    }

    /// Retract a command with matching origin from this unit and its
    /// ancestors, including the breakpoint at the absorbing iteration.
    pub(crate) fn clear_flow_upward(self, kind: FlowKind, origin: u64) {
        let flow_matched = self
            .with(|m| {
                let mut flow = m.flow.lock();
                if flow.get(kind).is_some_and(|c| c.origin == origin) {
                    flow.clear(kind);
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        crate::iter::clear_breakpoint_if_origin(self, kind, origin);
        if flow_matched && let Some(parent) = self.parent() {
            parent.clear_flow_upward(kind, origin);
        }
    }

    fn dispatch_flow(self, kind: FlowKind, arg: Value) {
        let origin = self.serial();
        if self.state() == UnitState::Running {
            // Raised during execution; settled after the run.
            self.with(|m| {
                m.flow.lock().set(kind, Command { arg, endpoint: false, origin });
            });
        } else {
            self.apply_flow(kind, arg, origin);
        }
    }

    /// Raise `break`, optionally labeled.
    pub fn break_(self, label: Option<&str>) {
        let arg = label.map(|l| Value::String(l.to_owned())).unwrap_or_default();
        self.dispatch_flow(FlowKind::Break, arg);
    }

    /// Raise `continue`, optionally labeled.
    pub fn continue_(self, label: Option<&str>) {
        let arg = label.map(|l| Value::String(l.to_owned())).unwrap_or_default();
        self.dispatch_flow(FlowKind::Continue, arg);
    }

    /// Raise `return` with a value.
    pub fn return_(self, value: Value) {
        self.dispatch_flow(FlowKind::Return, value);
    }

    /// Re-arm a soft-aborted unit and hand it back to its scheduler.
    pub(crate) fn resume(self) {
        if self.state() == UnitState::Aborted {
            cov_mark::hit!(unit_resumed);
            self.set_state(UnitState::Resuming);
            if let Some(sched) = self.with(|m| m.scheduler.clone()) {
                sched.schedule(&[self]);
            }
        }
    }

    /// Abort this unit.
    ///
    /// `total == false` is a soft mark: the unit is stale for this pass but
    /// eligible for later resumption. `total == true` is destructive
    /// teardown: children cascade, cleanups run, the owned scope frame and
    /// the arena slot are freed, and the id goes stale.
    pub fn abort(self, total: bool) {
        if !total {
            if self.exists() {
                cov_mark::hit!(soft_abort);
                self.set_state(UnitState::Aborted);
            }
            return;
        }
        if !self.exists() {
            return;
        }
        debug!(unit = self.index(), "unit teardown");
        for child in unit_children(self) {
            child.abort(true);
        }
        crate::iter::teardown(self);
        unit_unregister(self);
        let Some(meta) = unit_arena_remove(self) else { return };
        meta.lifecycle.abort();
        if meta.owns_scope {
            meta.scope.teardown();
        }
    }

    /// Link a continuation unit controlled by this block's flow state.
    pub fn set_downstream(self, continuation: UnitId) {
        self.with(|m| *m.downstream.lock() = Some(continuation));
    }

    /// Read the value at `path` from the scope chain. The first segment is
    /// resolved as a variable name; under `stateful_function` the read
    /// binds a live subscription, otherwise it returns a detached snapshot.
    pub fn get(self, path: &[Key]) -> Result<Value> {
        let (scope, sched) = self
            .with(|m| (m.scope, m.scheduler.clone()))
            .ok_or(Error::UnitGone)?;
        let name = path
            .first()
            .and_then(Key::as_name)
            .ok_or_else(|| Error::Unresolved { name: String::new() })?;
        let frame = scope.resolve(name)?;
        let bind = sched.params().stateful_function.then_some(self);
        Ok(frame.read_path(path, bind))
    }

    /// Like [`get`](Self::get), but an unresolved first segment yields
    /// `Undefined` (used where a type-check hint suppresses the error).
    pub fn get_lenient(self, path: &[Key]) -> Value {
        self.get(path).unwrap_or_default()
    }

    /// Snapshot read that never binds a subscription, regardless of the
    /// scheduler params. Reads that must not retrigger the reader (e.g.
    /// an accumulator on both sides of an assignment) go through here.
    pub fn peek(self, path: &[Key]) -> Result<Value> {
        let scope = self.scope().ok_or(Error::UnitGone)?;
        let name = path
            .first()
            .and_then(Key::as_name)
            .ok_or_else(|| Error::Unresolved { name: String::new() })?;
        Ok(scope.resolve(name)?.read_path(path, None))
    }

    /// Bind and return the signal at `path` without reading it.
    pub fn signal_ref(self, path: &[Key]) -> Result<SignalId> {
        let scope = self.scope().ok_or(Error::UnitGone)?;
        let name = path
            .first()
            .and_then(Key::as_name)
            .ok_or_else(|| Error::Unresolved { name: String::new() })?;
        Ok(scope.resolve(name)?.signal_at(path))
    }

    /// Write the value at `path`. A single-segment path is a variable
    /// assignment and honors `const`; deeper paths mutate through the
    /// binding, which is legal even for constants.
    pub fn set(self, path: &[Key], value: Value) -> Result<()> {
        let scope = self.scope().ok_or(Error::UnitGone)?;
        match path {
            [] => Ok(()),
            [Key::Name(name)] => scope.update(name, value),
            [first, ..] => {
                let name = first
                    .as_name()
                    .ok_or_else(|| Error::Unresolved { name: String::new() })?;
                scope.resolve(name)?.write_path(path, Some(value))
            }
        }
    }

    /// Delete the value at `path`.
    pub fn delete(self, path: &[Key]) -> Result<()> {
        let scope = self.scope().ok_or(Error::UnitGone)?;
        let name = path
            .first()
            .and_then(Key::as_name)
            .ok_or_else(|| Error::Unresolved { name: String::new() })?;
        scope.resolve(name)?.write_path(path, None)
    }

    /// Declare a binding through a specialized child unit whose completion
    /// performs the scope write. `serial` is the declaration-site identity:
    /// re-executions of the same site pass the same serial.
    pub fn declare(
        self,
        kind: DeclKind,
        name: &str,
        serial: u64,
        init: impl FnMut(UnitId) -> Result<Value> + Send + 'static,
    ) -> Result<UnitId> {
        let name = name.to_owned();
        let spec = UnitSpec::new(UnitKind::VarDecl).closure(init).completion(
            move |unit, value| {
                let scope = unit.scope().ok_or(Error::UnitGone)?;
                scope.declare(&name, kind, serial, value.clone())?;
                Ok(value)
            },
        );
        self.autorun(spec)
    }

    /// Assign to a binding through a specialized child unit.
    pub fn assign(
        self,
        name: &str,
        value: impl FnMut(UnitId) -> Result<Value> + Send + 'static,
    ) -> Result<UnitId> {
        let name = name.to_owned();
        let spec = UnitSpec::new(UnitKind::Assignment).closure(value).completion(
            move |unit, value| {
                let scope = unit.scope().ok_or(Error::UnitGone)?;
                scope.update(&name, value.clone())?;
                Ok(value)
            },
        );
        self.autorun(spec)
    }

    /// Declare destructured bindings with a live reader.
    ///
    /// The reader is a child unit subscribed to the source path; whenever
    /// the source changes it recomputes the picked sub-paths (and the rest
    /// projection, minus the excluded keys) and commits them through
    /// `update`. It is torn down with this unit.
    pub fn declare_destructured(
        self,
        kind: DeclKind,
        serial: u64,
        source: Vec<Key>,
        bindings: Vec<(String, Vec<Key>)>,
        rest: Option<(String, Vec<String>)>,
    ) -> Result<UnitId> {
        let names: Vec<String> = bindings
            .iter()
            .map(|(n, _)| n.clone())
            .chain(rest.iter().map(|(n, _)| n.clone()))
            .collect();
        let read_source = source.clone();
        let spec = UnitSpec::new(UnitKind::VarDecl)
            .closure(move |unit| {
                let scope = unit.scope().ok_or(Error::UnitGone)?;
                let name = read_source
                    .first()
                    .and_then(Key::as_name)
                    .ok_or_else(|| Error::Unresolved { name: String::new() })?;
                let frame = scope.resolve(name)?;
                // Readers are live by definition; the subscription does not
                // depend on the stateful_function param.
                Ok(frame.read_path(&read_source, Some(unit)))
            })
            .completion(move |unit, value| {
                let scope = unit.scope().ok_or(Error::UnitGone)?;
                for (name, picks) in &bindings {
                    let picked = project(&value, picks, None)?;
                    commit_binding(scope, name, kind, serial, picked)?;
                }
                if let Some((name, excludes)) = &rest {
                    let picked = project(&value, &[], Some(excludes))?;
                    commit_binding(scope, name, kind, serial, picked)?;
                }
                Ok(value)
            });
        let reader = self.autorun(spec)?;
        // Record the reader on each binding's symbol entry.
        if let Some(scope) = self.scope() {
            for name in names {
                if let Some(mut symbol) = scope.symbol(&name) {
                    symbol.reader = Some(reader);
                    scope.put_symbol(&name, symbol);
                }
            }
        }
        Ok(reader)
    }

    /// Named memo slot: computed once per execution of this unit (or an
    /// ancestor), reused by descendants, invalidated on the next run.
    pub fn memo(
        self,
        name: &'static str,
        compute: impl FnOnce(UnitId) -> Result<Value>,
    ) -> Result<Value> {
        let mut cur = Some(self);
        while let Some(unit) = cur {
            let cached = unit.with(|m| m.memo.lock().get(name).cloned()).flatten();
            if let Some(value) = cached {
                cov_mark::hit!(memo_reused);
                return Ok(value);
            }
            cur = unit.parent();
        }
        let value = compute(self)?;
        self.with(|m| m.memo.lock().insert(name, value.clone()));
        Ok(value)
    }
}

fn commit_binding(
    scope: SignalId,
    name: &str,
    kind: DeclKind,
    serial: u64,
    value: Value,
) -> Result<()> {
    if scope.symbol(name).is_some() {
        // Re-commit from the reader: constants are written through their
        // declaring reader, not rejected.
        match scope.resolve(name) {
            Ok(frame) => frame.write_path(&[Key::from(name)], Some(value)),
            Err(_) => scope.declare(name, kind, serial, value).map(|_| ()),
        }
    } else {
        scope.declare(name, kind, serial, value).map(|_| ())
    }
}

fn blocks_rightstream(flow: &FlowSet) -> bool {
    // A continue only cuts the raising round short; breaks and returns
    // block every later round.
    flow.get(FlowKind::Break).is_some() || flow.get(FlowKind::Return).is_some()
}

/// An owned root execution unit.
///
/// Embedding code creates one per program (or per independently scheduled
/// subtree); dropping it tears the whole unit tree and its scope frames
/// down.
#[derive(Debug)]
pub struct Autorun {
    id: UnitId,
}

impl Autorun {
    /// Create and execute a root unit of the given spec.
    pub fn root(scheduler: Arc<dyn Scheduler>, spec: UnitSpec) -> Result<Self> {
        let id = UnitId::create(None, None, spec, scheduler, None, None)?;
        id.execute()?;
        Ok(Self { id })
    }

    /// Async twin of [`root`](Self::root).
    pub async fn root_async(scheduler: Arc<dyn Scheduler>, spec: UnitSpec) -> Result<Self> {
        let id = UnitId::create(None, None, spec, scheduler, None, None)?;
        id.execute_async().await?;
        Ok(Self { id })
    }

    /// The root unit's id.
    pub fn id(&self) -> UnitId {
        self.id
    }

    /// The root scope frame.
    pub fn scope(&self) -> SignalId {
        self.id.scope().expect("root unit owns its scope")
    }
}

impl Drop for Autorun {
    fn drop(&mut self) {
        self.id.abort(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::QueueScheduler;

    fn module(closure: impl FnMut(UnitId) -> Result<Value> + Send + 'static) -> (Arc<QueueScheduler>, Autorun) {
        let sched = Arc::new(QueueScheduler::new());
        let root = Autorun::root(
            sched.clone(),
            UnitSpec::new(UnitKind::Module).closure(closure),
        )
        .expect("root executes");
        (sched, root)
    }

    #[test]
    fn declarations_land_in_scope() {
        let (_sched, root) = module(|unit| {
            unit.declare(DeclKind::Let, "x", 1, |_| Ok(Value::Number(5.0)))?;
            Ok(Value::Undefined)
        });
        assert_eq!(
            root.scope().state().get(&Key::from("x")),
            Some(&Value::Number(5.0))
        );
    }

    #[test]
    fn const_assignment_surfaces_synchronously() {
        let sched = Arc::new(QueueScheduler::new());
        let result = Autorun::root(
            sched,
            UnitSpec::new(UnitKind::Module).closure(|unit| {
                unit.declare(DeclKind::Const, "x", 1, |_| Ok(Value::Number(1.0)))?;
                unit.assign("x", |_| Ok(Value::Number(2.0)))?;
                Ok(Value::Undefined)
            }),
        );
        assert!(matches!(
            result.unwrap_err(),
            Error::AssignmentToConstant { .. }
        ));
    }

    #[test]
    fn total_abort_is_terminal() {
        let (_sched, root) = module(|_| Ok(Value::Undefined));
        let id = root.id();
        id.abort(true);
        assert!(!id.exists());
        // A second abort of a stale id is harmless.
        id.abort(true);
    }

    #[test]
    fn soft_abort_is_resumable() {
        let (sched, root) = module(|_| Ok(Value::Undefined));
        let id = root.id();
        id.abort(false);
        assert_eq!(id.state(), UnitState::Aborted);

        id.resume();
        assert_eq!(id.state(), UnitState::Resuming);
        assert_eq!(sched.pending(), 1);
        sched.flush();
        assert_eq!(id.state(), UnitState::Complete);
    }

    #[test]
    fn memo_computes_once_per_execution() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let computes = Arc::new(AtomicUsize::new(0));
        let computes_in = computes.clone();
        let (_sched, _root) = module(move |unit| {
            let computes = computes_in.clone();
            for _ in 0..3 {
                unit.memo("cond", |_| {
                    computes.fetch_add(1, Ordering::Relaxed);
                    Ok(Value::Bool(true))
                })?;
            }
            Ok(Value::Undefined)
        });
        assert_eq!(computes.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn return_is_absorbed_by_function() {
        let sched = Arc::new(QueueScheduler::new());
        let root = Autorun::root(
            sched,
            UnitSpec::new(UnitKind::Module).closure(|unit| {
                let func = unit.autorun(UnitSpec::new(UnitKind::Function).closure(|f| {
                    f.return_(Value::Number(42.0));
                    Ok(Value::Undefined)
                }))?;
                let _ = func;
                Ok(Value::Undefined)
            }),
        )
        .unwrap();
        // The return never escaped the function: the module has no pending
        // flow commands.
        assert!(root.id().with(|m| m.flow.lock().is_empty()).unwrap());
    }
}
