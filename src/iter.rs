//! Iterator units: loops whose iterated collection mutates over time.
//!
//! An iteration unit owns an ordered collection of per-iteration child
//! units ("rounds"), kept as a key-addressed map plus a doubly linked
//! order. The initial pass pulls the cursor to exhaustion; afterwards,
//! observed mutations of the iteratee reconcile the round collection
//! incrementally — existing rounds get their production binding updated in
//! place, deleted keys abort exactly their round, and unseen keys append
//! new rounds — without re-running untouched rounds.
//!
//! `for`/`while` loops re-derive their test each step and copy the
//! enclosing scope per round; their round keys are append-only. `for-of`
//! and `for-in` evaluate the iteratee once, subscribe to it, and
//! insert/delete rounds as the collection changes.

use crate::arena::{FlowKind, SignalId, UnitId, UnitKind, UnitState};
use crate::error::{Error, Result};
use crate::hash::FastHashBuilder;
use crate::scope::DeclKind;
use crate::sched::Scheduler;
use crate::signal::MutationKind;
use crate::unit::{StackGuard, UnitClosure, UnitSpec};
use crate::value::{Key, Value};
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::trace;

/// Loop construct variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopKind {
    /// Counted loop with init/test/advance.
    For,
    /// Test-first loop.
    While,
    /// Test-after loop; the first round is unconditional.
    DoWhile,
    /// Iterates the values of a collection.
    ForOf,
    /// Iterates the keys of a collection.
    ForIn,
}

impl LoopKind {
    pub(crate) fn keyed(self) -> bool {
        matches!(self, LoopKind::ForOf | LoopKind::ForIn)
    }
}

/// Factory producing the body closure for one round.
pub type RoundFactory = Box<dyn FnMut(&Key) -> UnitClosure + Send>;

/// Loop description attached to an iteration unit's spec.
pub struct LoopSpec {
    /// Which loop construct this is.
    pub kind: LoopKind,
    /// Scope path of the iterated collection (`for-of`/`for-in`).
    pub iteratee: Option<Vec<Key>>,
    /// Run once before the first pull (`for`).
    pub init: Option<UnitClosure>,
    /// Re-derived before each pull (counted loops).
    pub test: Option<UnitClosure>,
    /// Run after each round (`for`).
    pub advance: Option<UnitClosure>,
    /// Produces each round's body.
    pub round: RoundFactory,
    /// Forces the async execution path even when the step closures are
    /// synchronous (the round bodies may still suspend).
    pub asynchronous: bool,
}

impl LoopSpec {
    /// Loop over the collection at `iteratee`, one round per element.
    pub fn for_of(iteratee: Vec<Key>, round: impl FnMut(&Key) -> UnitClosure + Send + 'static) -> Self {
        Self::bare(LoopKind::ForOf, Some(iteratee), round)
    }

    /// Loop over the keys of the collection at `iteratee`.
    pub fn for_in(iteratee: Vec<Key>, round: impl FnMut(&Key) -> UnitClosure + Send + 'static) -> Self {
        Self::bare(LoopKind::ForIn, Some(iteratee), round)
    }

    /// Counted loop; attach `init`/`test`/`advance` via the builder methods.
    pub fn counted(kind: LoopKind, round: impl FnMut(&Key) -> UnitClosure + Send + 'static) -> Self {
        Self::bare(kind, None, round)
    }

    fn bare(
        kind: LoopKind,
        iteratee: Option<Vec<Key>>,
        round: impl FnMut(&Key) -> UnitClosure + Send + 'static,
    ) -> Self {
        Self {
            kind,
            iteratee,
            init: None,
            test: None,
            advance: None,
            round: Box::new(round),
            asynchronous: false,
        }
    }

    /// Set the init closure.
    pub fn init(mut self, f: UnitClosure) -> Self {
        self.init = Some(f);
        self
    }

    /// Set the test closure.
    pub fn test(mut self, f: UnitClosure) -> Self {
        self.test = Some(f);
        self
    }

    /// Set the advance closure.
    pub fn advance(mut self, f: UnitClosure) -> Self {
        self.advance = Some(f);
        self
    }

    /// Mark the loop as asynchronous (round bodies suspend).
    pub fn asynchronous(mut self) -> Self {
        self.asynchronous = true;
        self
    }

    pub(crate) fn is_async(&self) -> bool {
        self.asynchronous
            || self.init.as_ref().is_some_and(UnitClosure::is_async)
            || self.test.as_ref().is_some_and(UnitClosure::is_async)
            || self.advance.as_ref().is_some_and(UnitClosure::is_async)
    }
}

/// One round's slot in the ordered collection.
pub(crate) struct RoundSlot {
    pub(crate) unit: UnitId,
    pub(crate) prev: Option<Key>,
    pub(crate) next: Option<Key>,
}

/// A break/continue absorbed by an iteration.
#[derive(Clone, Debug)]
pub(crate) struct Breakpoint {
    pub(crate) kind: FlowKind,
    /// Key of the round that raised it, when absorbed at round level.
    pub(crate) round: Option<Key>,
    pub(crate) origin: u64,
}

/// Mutable reconciliation state of an iteration unit.
pub(crate) struct IterState {
    pub(crate) spec: LoopSpec,
    pub(crate) iteratee: Option<SignalId>,
    pub(crate) rounds: IndexMap<Key, RoundSlot, FastHashBuilder>,
    pub(crate) head: Option<Key>,
    pub(crate) tail: Option<Key>,
    /// Next pull position of the bulk cursor.
    pub(crate) cursor: usize,
    /// Lineage ordinal for the next round.
    pub(crate) next_ordinal: u64,
    /// A bulk pass is in flight.
    pub(crate) iterating: bool,
    pub(crate) initialized: bool,
    pub(crate) breakpoint: Option<Breakpoint>,
    /// A break/return hoisted through this iteration toward an outer
    /// target; durable across re-runs, unlike the flow slots.
    pub(crate) blocked_by: Option<(FlowKind, u64)>,
}

impl IterState {
    pub(crate) fn new(spec: LoopSpec) -> Self {
        Self {
            spec,
            iteratee: None,
            rounds: IndexMap::with_hasher(FastHashBuilder),
            head: None,
            tail: None,
            cursor: 0,
            next_ordinal: 0,
            iterating: false,
            initialized: false,
            breakpoint: None,
            blocked_by: None,
        }
    }

    fn link_append(&mut self, key: Key, unit: UnitId) {
        let prev = self.tail.take();
        if let Some(prev_key) = &prev {
            if let Some(slot) = self.rounds.get_mut(prev_key) {
                slot.next = Some(key.clone());
            }
        } else {
            self.head = Some(key.clone());
        }
        self.tail = Some(key.clone());
        self.rounds.insert(key, RoundSlot { unit, prev, next: None });
    }

    fn unlink(&mut self, key: &Key) -> Option<UnitId> {
        let slot = self.rounds.shift_remove(key)?;
        match &slot.prev {
            Some(prev) => {
                if let Some(p) = self.rounds.get_mut(prev) {
                    p.next = slot.next.clone();
                }
            }
            None => self.head = slot.next.clone(),
        }
        match &slot.next {
            Some(next) => {
                if let Some(n) = self.rounds.get_mut(next) {
                    n.prev = slot.prev.clone();
                }
            }
            None => self.tail = slot.prev.clone(),
        }
        Some(slot.unit)
    }

    /// Key of the round at linked-list position `n`.
    fn key_at(&self, n: usize) -> Option<Key> {
        let mut cur = self.head.clone();
        let mut i = 0;
        while let Some(key) = cur {
            if i == n {
                return Some(key);
            }
            cur = self.rounds.get(&key)?.next.clone();
            i += 1;
        }
        None
    }

}

pub(crate) fn with_iter<R>(unit: UnitId, f: impl FnOnce(&mut IterState) -> R) -> Option<R> {
    unit.with(|m| m.iter.as_ref().map(|it| f(&mut it.lock())))
        .flatten()
}

/// Record an absorbed break/continue on an iteration.
pub(crate) fn record_breakpoint(
    iteration: UnitId,
    kind: FlowKind,
    round: Option<Key>,
    origin: u64,
) {
    with_iter(iteration, |it| {
        it.breakpoint = Some(Breakpoint { kind, round, origin });
    });
}

/// Clear the breakpoint if it was raised by `round`. Returns whether a
/// breakpoint was cleared.
pub(crate) fn clear_breakpoint_from_round(iteration: UnitId, round: UnitId) -> bool {
    let key = round.with(|m| m.round_key.clone()).flatten();
    with_iter(iteration, |it| {
        if key.is_some() && it.breakpoint.as_ref().is_some_and(|b| b.round == key) {
            it.breakpoint = None;
            true
        } else {
            false
        }
    })
    .unwrap_or(false)
}

/// Clear an absorbed breakpoint or outer-target block marker whose origin
/// matches a retracted command.
pub(crate) fn clear_breakpoint_if_origin(unit: UnitId, kind: FlowKind, origin: u64) -> bool {
    with_iter(unit, |it| {
        let mut cleared = false;
        if it.breakpoint.as_ref().is_some_and(|b| b.kind == kind && b.origin == origin) {
            it.breakpoint = None;
            cleared = true;
        }
        if it.blocked_by == Some((kind, origin)) {
            it.blocked_by = None;
            cleared = true;
        }
        cleared
    })
    .unwrap_or(false)
}

/// Park a break/return hoisted through an iteration toward an outer
/// target; keeps the iteration's pulls blocked across its own re-runs.
pub(crate) fn mark_blocked(iteration: UnitId, kind: FlowKind, origin: u64) {
    with_iter(iteration, |it| {
        it.blocked_by = Some((kind, origin));
    });
}

/// Whether a bulk pass is currently in flight.
pub(crate) fn is_iterating(iteration: UnitId) -> bool {
    with_iter(iteration, |it| it.iterating).unwrap_or(false)
}

/// The rounds after `round` in iteration order.
pub(crate) fn rounds_after(iteration: UnitId, round: UnitId) -> Vec<UnitId> {
    let Some(start) = round.with(|m| m.round_key.clone()).flatten() else {
        return Vec::new();
    };
    with_iter(iteration, |it| {
        let mut out = Vec::new();
        let mut cur = it.rounds.get(&start).and_then(|s| s.next.clone());
        while let Some(key) = cur {
            let Some(slot) = it.rounds.get(&key) else { break };
            out.push(slot.unit);
            cur = slot.next.clone();
        }
        out
    })
    .unwrap_or_default()
}

/// Drop the round collection on teardown. The round units themselves are
/// children of the iteration and are aborted by the cascading teardown;
/// the iteratee subscription is removed by the unit's lifecycle cleanups.
pub(crate) fn teardown(unit: UnitId) {
    with_iter(unit, |it| {
        it.rounds.clear();
        it.head = None;
        it.tail = None;
        it.breakpoint = None;
        it.iterating = false;
    });
}

/// Whether the iteration must stop pulling: an absorbed break, a break or
/// return parked on the way to an outer target, or one freshly hoisted
/// into the flow slots this pass.
pub(crate) fn is_blocked(iteration: UnitId) -> bool {
    let parked = with_iter(iteration, |it| {
        it.breakpoint.as_ref().is_some_and(|b| b.kind == FlowKind::Break)
            || it.blocked_by.is_some()
    })
    .unwrap_or(false);
    if parked {
        return true;
    }
    iteration
        .with(|m| {
            let flow = m.flow.lock();
            flow.get(FlowKind::Break).is_some() || flow.get(FlowKind::Return).is_some()
        })
        .unwrap_or(false)
}

/// RAII flag for the in-flight bulk pass.
pub(crate) struct IteratingGuard {
    unit: UnitId,
}

impl IteratingGuard {
    pub(crate) fn new(unit: UnitId) -> Self {
        with_iter(unit, |it| it.iterating = true);
        Self { unit }
    }
}

impl Drop for IteratingGuard {
    fn drop(&mut self) {
        with_iter(self.unit, |it| it.iterating = false);
    }
}

/// What seeds a new round's scope.
pub(crate) enum RoundSeed {
    /// Bind the production name to this value (`for-of`/`for-in`).
    Production(Value),
    /// Copy the enclosing scope's state (counted loops).
    CopyScope,
}

/// One pulled step: the round key and its seed.
pub(crate) struct Pulled {
    pub(crate) key: Key,
    pub(crate) seed: RoundSeed,
}

/// Take a loop-step closure out of the iteration state, run it, restore it.
/// `pick` selects which of init/test/advance to run.
pub(crate) fn run_step(
    iteration: UnitId,
    pick: fn(&mut LoopSpec) -> &mut Option<UnitClosure>,
) -> Result<Option<Value>> {
    let Some(mut closure) = with_iter(iteration, |it| pick(&mut it.spec).take()).flatten() else {
        return Ok(None);
    };
    let result = match &mut closure {
        UnitClosure::Sync(f) => f(iteration),
        UnitClosure::Async(_) => Err(Error::closure("async loop step in synchronous pass")),
    };
    with_iter(iteration, |it| *pick(&mut it.spec) = Some(closure));
    result.map(Some)
}

/// Resolve the iteratee path, subscribe the iteration to it, run the init
/// closure. Called once, lazily, before the first pull.
pub(crate) fn initialize(iteration: UnitId) -> Result<()> {
    let (kind, path) = with_iter(iteration, |it| (it.spec.kind, it.spec.iteratee.clone()))
        .ok_or(Error::UnitGone)?;
    if kind.keyed() {
        let path = path.ok_or_else(|| Error::NotIterable { type_name: "undefined" })?;
        let scope = iteration.scope().ok_or(Error::UnitGone)?;
        let name = path
            .first()
            .and_then(Key::as_name)
            .ok_or_else(|| Error::Unresolved { name: String::new() })?;
        let signal = scope.resolve(name)?.signal_at(&path);
        let snapshot = signal.state();
        if !snapshot.is_container() {
            return Err(Error::NotIterable { type_name: snapshot.type_name() });
        }
        signal.subscribe(iteration);
        with_iter(iteration, |it| it.iteratee = Some(signal));
    } else {
        run_step(iteration, |spec| &mut spec.init)?;
    }
    with_iter(iteration, |it| it.initialized = true);
    Ok(())
}

/// Pull the next key/value, or `None` on exhaustion. Never called
/// mid-round; the stop conditions are checked before each pull.
pub(crate) fn pull(iteration: UnitId) -> Result<Option<Pulled>> {
    let (kind, cursor, iteratee) =
        with_iter(iteration, |it| (it.spec.kind, it.cursor, it.iteratee))
            .ok_or(Error::UnitGone)?;
    match kind {
        LoopKind::ForOf | LoopKind::ForIn => {
            let signal = iteratee.ok_or(Error::UnitGone)?;
            let state = signal.state();
            let keys = state.iteration_keys();
            if cursor >= keys.len() {
                return Ok(None);
            }
            let source_key = keys[cursor].clone();
            let pulled = if kind == LoopKind::ForOf {
                let value = state.get(&source_key).cloned().unwrap_or_default();
                let ordinal = with_iter(iteration, |it| {
                    let o = it.next_ordinal;
                    it.next_ordinal += 1;
                    o
                })
                .unwrap_or(0);
                Pulled { key: Key::Index(ordinal as usize), seed: RoundSeed::Production(value) }
            } else {
                let production = match &source_key {
                    Key::Name(name) => Value::String(name.clone()),
                    Key::Index(i) => Value::Number(*i as f64),
                };
                Pulled { key: source_key, seed: RoundSeed::Production(production) }
            };
            with_iter(iteration, |it| it.cursor = cursor + 1);
            Ok(Some(pulled))
        }
        LoopKind::For | LoopKind::While | LoopKind::DoWhile => {
            let unconditional = kind == LoopKind::DoWhile && cursor == 0;
            if !unconditional {
                let test = run_step(iteration, |spec| &mut spec.test)?;
                if let Some(value) = test
                    && !value.truthy()
                {
                    return Ok(None);
                }
            }
            Ok(pull_counted_unchecked(iteration))
        }
    }
}

/// The cursor/ordinal bookkeeping of a counted pull, after the test has
/// already been evaluated (the async variant awaits it separately).
pub(crate) fn pull_counted_unchecked(iteration: UnitId) -> Option<Pulled> {
    let ordinal = with_iter(iteration, |it| {
        it.cursor += 1;
        let o = it.next_ordinal;
        it.next_ordinal += 1;
        o
    })?;
    Some(Pulled { key: Key::Index(ordinal as usize), seed: RoundSeed::CopyScope })
}

/// Build one round: fresh round scope (seeded from the production binding
/// or a copy of the enclosing scope), a body from the round factory, and a
/// slot in the ordered collection.
pub(crate) fn create_round(
    iteration: UnitId,
    sched: &Arc<dyn Scheduler>,
    key: Key,
    seed: RoundSeed,
) -> Result<UnitId> {
    let (scope, production, serial) = iteration
        .with(|m| (m.scope, m.production.clone(), m.serial))
        .ok_or(Error::UnitGone)?;
    let closure = with_iter(iteration, |it| (it.spec.round)(&key)).ok_or(Error::UnitGone)?;
    let ordinal = match &key {
        Key::Index(i) => *i as u64,
        Key::Name(_) => with_iter(iteration, |it| {
            let o = it.next_ordinal;
            it.next_ordinal += 1;
            o
        })
        .unwrap_or(0),
    };

    let mut spec = UnitSpec::new(UnitKind::Round);
    spec.closure = Some(closure);
    let round = UnitId::create(
        Some(iteration),
        Some(scope),
        spec,
        sched.clone(),
        Some(ordinal),
        Some(key.clone()),
    )?;

    let round_scope = round.scope().ok_or(Error::UnitGone)?;
    match seed {
        RoundSeed::Production(value) => {
            if let Some(name) = &production {
                round_scope.declare(name, DeclKind::Let, serial, value)?;
            }
        }
        RoundSeed::CopyScope => {
            round_scope.set_state_raw(scope.state());
            let symbols = scope.with(|m| m.symbols.read().clone()).unwrap_or_default();
            round_scope.with(|m| *m.symbols.write() = symbols);
        }
    }

    with_iter(iteration, |it| it.link_append(key, round));
    Ok(round)
}

/// Bulk pass: pull and execute rounds until exhaustion or a blocking
/// command. Used for the initial run and to resume counted loops.
fn bulk_iterate(iteration: UnitId, sched: &Arc<dyn Scheduler>) -> Result<()> {
    let _guard = IteratingGuard::new(iteration);
    loop {
        if is_blocked(iteration) {
            cov_mark::hit!(iteration_stopped_blocked);
            return Ok(());
        }
        let Some(pulled) = pull(iteration)? else {
            return Ok(());
        };
        let round = create_round(iteration, sched, pulled.key, pulled.seed)?;
        // Round failures are terminal for the round, not for the loop:
        // report and keep pulling, like any other scheduled execution.
        if let Err(error) = round.execute() {
            report_round_failure(sched, round, iteration, error);
        }
        let is_for = with_iter(iteration, |it| it.spec.kind == LoopKind::For).unwrap_or(false);
        if is_for {
            run_step(iteration, |spec| &mut spec.advance)?;
        }
    }
}

pub(crate) fn report_round_failure(
    sched: &Arc<dyn Scheduler>,
    round: UnitId,
    iteration: UnitId,
    error: Error,
) {
    sched.throw(error, &[round.serial(), iteration.serial()]);
}

/// Incremental pass over the observed mutations of a keyed loop's
/// iteratee. Never suspends, so the async variant shares it.
pub(crate) fn reconcile(iteration: UnitId, sched: &Arc<dyn Scheduler>) -> Result<()> {
    let kind = with_iter(iteration, |it| it.spec.kind).ok_or(Error::UnitGone)?;
    debug_assert!(kind.keyed());
    let mutations = iteration
        .with(|m| std::mem::take(&mut *m.inbox.lock()))
        .unwrap_or_default();
    let production = iteration.with(|m| m.production.clone()).flatten();
    let mut to_schedule: Vec<UnitId> = Vec::new();

    for m in &mutations {
        // for-of mutations carry array positions; rounds keep their
        // original keys, so positions translate through the linked order.
        let existing: Option<Key> = match kind {
            LoopKind::ForIn => {
                with_iter(iteration, |it| it.rounds.contains_key(&m.key))
                    .unwrap_or(false)
                    .then(|| m.key.clone())
            }
            _ => match &m.key {
                Key::Index(position) => {
                    with_iter(iteration, |it| it.key_at(*position)).flatten()
                }
                Key::Name(_) => None,
            },
        };

        match (existing, m.kind) {
            (Some(key), MutationKind::Delete) => {
                cov_mark::hit!(round_deleted);
                let unit = with_iter(iteration, |it| it.unlink(&key)).flatten();
                if let Some(unit) = unit {
                    unit.abort(true);
                }
            }
            (Some(key), MutationKind::Set) => {
                let unit = with_iter(iteration, |it| it.rounds.get(&key).map(|s| s.unit))
                    .flatten();
                let Some(unit) = unit else { continue };
                // Update the bound production in place; the round's body
                // subscribers reschedule through the scope signal.
                if kind == LoopKind::ForOf
                    && let (Some(name), Some(scope)) = (&production, unit.scope())
                {
                    scope.write_path(&[Key::from(name.as_str())], Some(m.value.clone()))?;
                }
                if unit.state() == UnitState::Inert {
                    unit.set_state(UnitState::Resuming);
                    to_schedule.push(unit);
                }
            }
            (None, MutationKind::Set) => {
                let live_bulk = is_iterating(iteration) && kind == LoopKind::ForOf;
                if live_bulk {
                    // The in-flight cursor will visit this key.
                    cov_mark::hit!(append_deferred_to_cursor);
                    continue;
                }
                if is_blocked(iteration) {
                    // A standing break holds the cursor short; the key is
                    // picked up by the resume pull when it clears.
                    continue;
                }
                let (key, seed) = match kind {
                    LoopKind::ForOf => {
                        let ordinal = with_iter(iteration, |it| {
                            it.cursor += 1;
                            let o = it.next_ordinal;
                            it.next_ordinal += 1;
                            o
                        })
                        .unwrap_or(0);
                        (Key::Index(ordinal as usize), RoundSeed::Production(m.value.clone()))
                    }
                    _ => {
                        let production = match &m.key {
                            Key::Name(name) => Value::String(name.clone()),
                            Key::Index(i) => Value::Number(*i as f64),
                        };
                        (m.key.clone(), RoundSeed::Production(production))
                    }
                };
                cov_mark::hit!(round_appended);
                let round = create_round(iteration, sched, key, seed)?;
                to_schedule.push(round);
            }
            (None, MutationKind::Delete) => {}
        }
    }

    if !to_schedule.is_empty() {
        trace!(iteration = iteration.index(), rounds = to_schedule.len(), "reconcile batch");
        to_schedule.sort_by_key(|u| u.path());
        sched.schedule(&to_schedule);
    }
    Ok(())
}

/// After a blocking command clears, the cursor may sit short of the
/// collection: pull the remaining keys. No-op while blocked or in flight.
pub(crate) fn resume_pull_if_short(iteration: UnitId, sched: &Arc<dyn Scheduler>) -> Result<()> {
    if is_blocked(iteration) || is_iterating(iteration) {
        return Ok(());
    }
    let Some((cursor, iteratee)) = with_iter(iteration, |it| (it.cursor, it.iteratee)) else {
        return Ok(());
    };
    let Some(signal) = iteratee else { return Ok(()) };
    if cursor < signal.state().iteration_keys().len() {
        cov_mark::hit!(cursor_resumed_after_clear);
        bulk_iterate(iteration, sched)?;
    }
    Ok(())
}

/// Run an iteration unit: the initial pass pulls to exhaustion, re-runs
/// reconcile against the observed mutations. Called from `execute()` after
/// the generic prepare step.
pub(crate) fn run_iteration(
    iteration: UnitId,
    sched: &Arc<dyn Scheduler>,
    before: crate::arena::FlowSet,
) -> Result<Value> {
    let result = {
        let _stack = StackGuard::new(sched.clone(), iteration);
        let initialized = with_iter(iteration, |it| it.initialized).unwrap_or(false);
        let keyed = with_iter(iteration, |it| it.spec.kind.keyed()).unwrap_or(false);
        if !initialized {
            initialize(iteration).and_then(|()| bulk_iterate(iteration, sched))
        } else if keyed {
            reconcile(iteration, sched)
                .and_then(|()| resume_pull_if_short(iteration, sched))
        } else {
            // Counted loops resume the cursor: a changed test input may
            // admit more rounds. Round keys are append-only here.
            iteration.with(|m| m.inbox.lock().clear());
            bulk_iterate(iteration, sched)
        }
    };
    iteration.set_state(UnitState::Complete);
    result?;
    let after = iteration.with(|m| m.flow.lock().clone()).unwrap_or_default();
    iteration.settle(UnitKind::Iteration, &before, after);
    Ok(Value::Undefined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::UnitId;
    use crate::sched::{QueueScheduler, SchedulerParams};
    use crate::unit::Autorun;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn stateful_sched() -> Arc<QueueScheduler> {
        Arc::new(QueueScheduler::with_params(SchedulerParams { stateful_function: true }))
    }

    /// `for (item of items) visits += 1`
    fn counting_loop(
        unit: UnitId,
        visits: Arc<AtomicUsize>,
    ) -> Result<UnitId> {
        let spec = UnitSpec::new(UnitKind::Iteration).production("item").loop_spec(
            LoopSpec::for_of(vec![Key::from("items")], move |_| {
                let visits = visits.clone();
                UnitClosure::sync(move |round| {
                    // Bind the production so mutations re-run this round.
                    round.get(&[Key::from("item")])?;
                    visits.fetch_add(1, Ordering::Relaxed);
                    Ok(Value::Undefined)
                })
            }),
        );
        unit.autorun(spec)
    }

    #[test]
    fn initial_pass_visits_every_element() {
        let visits = Arc::new(AtomicUsize::new(0));
        let visits_in = visits.clone();
        let sched = stateful_sched();
        let _root = Autorun::root(
            sched.clone(),
            UnitSpec::new(UnitKind::Module).closure(move |unit| {
                unit.declare(DeclKind::Let, "items", 1, |_| {
                    Ok([1i64, 2, 3].into_iter().collect())
                })?;
                counting_loop(unit, visits_in.clone())?;
                Ok(Value::Undefined)
            }),
        )
        .unwrap();
        assert_eq!(visits.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn appending_creates_exactly_one_round() {
        let visits = Arc::new(AtomicUsize::new(0));
        let visits_in = visits.clone();
        let sched = stateful_sched();
        let root = Autorun::root(
            sched.clone(),
            UnitSpec::new(UnitKind::Module).closure(move |unit| {
                unit.declare(DeclKind::Let, "items", 1, |_| {
                    Ok([1i64, 2, 3].into_iter().collect())
                })?;
                counting_loop(unit, visits_in.clone())?;
                Ok(Value::Undefined)
            }),
        )
        .unwrap();
        assert_eq!(visits.load(Ordering::Relaxed), 3);

        root.id()
            .set(&[Key::from("items"), Key::Index(3)], Value::Number(4.0))
            .unwrap();
        sched.flush();

        // Only the new round ran; rounds 1..3 were not re-run.
        assert_eq!(visits.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn deleting_a_key_aborts_exactly_its_round() {
        let visits = Arc::new(AtomicUsize::new(0));
        let visits_in = visits.clone();
        let sched = stateful_sched();
        let root = Autorun::root(
            sched.clone(),
            UnitSpec::new(UnitKind::Module).closure(move |unit| {
                unit.declare(DeclKind::Let, "items", 1, |_| {
                    Ok(["a", "b", "c"].into_iter().collect())
                })?;
                counting_loop(unit, visits_in.clone())?;
                Ok(Value::Undefined)
            }),
        )
        .unwrap();
        assert_eq!(visits.load(Ordering::Relaxed), 3);

        let iteration = crate::arena::unit_children(root.id())
            .into_iter()
            .find(|u| u.unit_kind() == Some(UnitKind::Iteration))
            .expect("loop unit");
        let rounds_before: Vec<UnitId> = with_iter(iteration, |it| {
            it.rounds.values().map(|s| s.unit).collect()
        })
        .unwrap();
        assert_eq!(rounds_before.len(), 3);

        root.id().delete(&[Key::from("items"), Key::Index(1)]).unwrap();
        sched.flush();

        // Round for "b" is gone, "a" and "c" intact with unchanged bindings.
        let remaining: Vec<UnitId> = with_iter(iteration, |it| {
            it.rounds.values().map(|s| s.unit).collect()
        })
        .unwrap();
        assert_eq!(remaining, vec![rounds_before[0], rounds_before[2]]);
        assert!(!rounds_before[1].exists());
        assert_eq!(
            rounds_before[0].scope().unwrap().state().get(&Key::from("item")),
            Some(&Value::String("a".into()))
        );
        assert_eq!(
            rounds_before[2].scope().unwrap().state().get(&Key::from("item")),
            Some(&Value::String("c".into()))
        );
        // And nothing re-ran.
        assert_eq!(visits.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn rounds_map_and_links_stay_consistent() {
        let sched = stateful_sched();
        let root = Autorun::root(
            sched.clone(),
            UnitSpec::new(UnitKind::Module).closure(move |unit| {
                unit.declare(DeclKind::Let, "items", 1, |_| {
                    Ok([10i64, 20, 30, 40].into_iter().collect())
                })?;
                let spec = UnitSpec::new(UnitKind::Iteration).production("x").loop_spec(
                    LoopSpec::for_of(vec![Key::from("items")], |_| {
                        UnitClosure::sync(|_| Ok(Value::Undefined))
                    }),
                );
                unit.autorun(spec)?;
                Ok(Value::Undefined)
            }),
        )
        .unwrap();

        let iteration = crate::arena::unit_children(root.id())
            .into_iter()
            .find(|u| u.unit_kind() == Some(UnitKind::Iteration))
            .unwrap();

        root.id().delete(&[Key::from("items"), Key::Index(1)]).unwrap();
        sched.flush();

        with_iter(iteration, |it| {
            // Walk the links forward; every map entry must be visited with
            // matching neighbors.
            let mut seen = 0;
            let mut prev: Option<Key> = None;
            let mut cur = it.head.clone();
            while let Some(key) = cur {
                let slot = it.rounds.get(&key).expect("linked key in map");
                assert_eq!(slot.prev, prev);
                prev = Some(key.clone());
                cur = slot.next.clone();
                seen += 1;
            }
            assert_eq!(seen, it.rounds.len());
            assert_eq!(it.tail, prev);
        })
        .unwrap();
    }

    #[test]
    fn for_in_rounds_track_object_keys() {
        let visited = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let visited_in = visited.clone();
        let sched = stateful_sched();
        let root = Autorun::root(
            sched.clone(),
            UnitSpec::new(UnitKind::Module).closure(move |unit| {
                unit.declare(DeclKind::Let, "obj", 1, |_| {
                    let mut v = Value::object();
                    v.set(&Key::from("a"), Value::Number(1.0));
                    v.set(&Key::from("b"), Value::Number(2.0));
                    Ok(v)
                })?;
                let visited = visited_in.clone();
                let spec = UnitSpec::new(UnitKind::Iteration).production("k").loop_spec(
                    LoopSpec::for_in(vec![Key::from("obj")], move |_| {
                        let visited = visited.clone();
                        UnitClosure::sync(move |round| {
                            let k = round.get(&[Key::from("k")])?;
                            visited.lock().push(k);
                            Ok(Value::Undefined)
                        })
                    }),
                );
                unit.autorun(spec)?;
                Ok(Value::Undefined)
            }),
        )
        .unwrap();
        assert_eq!(
            *visited.lock(),
            vec![Value::String("a".into()), Value::String("b".into())]
        );

        root.id()
            .set(&[Key::from("obj"), Key::from("c")], Value::Number(3.0))
            .unwrap();
        sched.flush();
        assert_eq!(visited.lock().len(), 3);
        assert_eq!(visited.lock()[2], Value::String("c".into()));
    }

    #[test]
    fn counted_loop_copies_scope_per_round() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_in = seen.clone();
        let sched = stateful_sched();
        let _root = Autorun::root(
            sched.clone(),
            UnitSpec::new(UnitKind::Module).closure(move |unit| {
                let seen = seen_in.clone();
                let spec = UnitSpec::new(UnitKind::Iteration).loop_spec(
                    LoopSpec::counted(LoopKind::For, move |_| {
                        let seen = seen.clone();
                        UnitClosure::sync(move |round| {
                            seen.lock().push(round.get(&[Key::from("i")])?);
                            Ok(Value::Undefined)
                        })
                    })
                    .init(UnitClosure::sync(|unit| {
                        let scope = unit.scope().unwrap();
                        scope.declare("i", DeclKind::Let, 77, Value::Number(0.0))?;
                        Ok(Value::Undefined)
                    }))
                    .test(UnitClosure::sync(|unit| {
                        let i = unit.get(&[Key::from("i")])?;
                        Ok(Value::Bool(matches!(i, Value::Number(n) if n < 3.0)))
                    }))
                    .advance(UnitClosure::sync(|unit| {
                        let scope = unit.scope().unwrap();
                        let Value::Number(n) = unit.get(&[Key::from("i")])? else {
                            return Err(Error::closure("i is not a number"));
                        };
                        scope.update("i", Value::Number(n + 1.0))?;
                        Ok(Value::Undefined)
                    })),
                );
                unit.autorun(spec)?;
                Ok(Value::Undefined)
            }),
        )
        .unwrap();
        assert_eq!(
            *seen.lock(),
            vec![Value::Number(0.0), Value::Number(1.0), Value::Number(2.0)]
        );
    }
}
