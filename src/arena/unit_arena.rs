// Unit arena - storage for execution-unit metadata
//
// An execution unit ("autorun") owns a closure plus declarative metadata and
// sits in a tree mirroring block/loop/function nesting. The arena holds the
// per-unit state machine, the flow-control slots, and the lineage path that
// totally orders concurrently pending units.
//
// Parent/child links live in global lock-free maps rather than in the
// metadata itself; tree edits are frequent on reconciliation and the maps
// keep the hot metadata struct small.

use crate::hash::FastHashBuilder;
use crate::iter::IterState;
use crate::lifecycle::Lifecycle;
use crate::sched::Scheduler;
use crate::signal::Mutation;
use crate::unit::{CompletionFn, MutationFilter, UnitClosure};
use crate::value::{Key, Value};
use indexmap::IndexMap;
use papaya::HashMap as PapayaHashMap;
use parking_lot::{Mutex, RwLock};
use slab::Slab;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use super::signal_arena::SignalId;

/// Global unit arena - stores all execution-unit metadata
static UNIT_ARENA: RwLock<Slab<UnitMetadata>> = RwLock::new(Slab::new());

// Global map: UnitId -> parent UnitId
static UNIT_PARENT: LazyLock<PapayaHashMap<UnitId, UnitId>> = LazyLock::new(PapayaHashMap::new);

// Global map: UnitId -> child UnitIds in creation order
static UNIT_CHILDREN: LazyLock<PapayaHashMap<UnitId, RwLock<Vec<UnitId>>>> =
    LazyLock::new(PapayaHashMap::new);

// Monotonic serial source for units and declarations.
static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh serial. Serials identify units in error reports and
/// stamp flow-control commands with their raising unit.
pub fn next_serial() -> u64 {
    NEXT_SERIAL.fetch_add(1, Ordering::Relaxed)
}

/// The construct a unit was compiled from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitKind {
    /// Top-level program unit.
    Module,
    /// Function body; absorbs `return`.
    Function,
    /// Braced block; may carry a downstream continuation.
    Block,
    /// Loop construct owning an ordered collection of rounds.
    Iteration,
    /// One iteration of a loop.
    Round,
    /// `var`/`let`/`const` declaration statement.
    VarDecl,
    /// Assignment statement.
    Assignment,
    /// Any other expression statement.
    Expression,
}

impl UnitKind {
    /// Whether units of this kind open their own scope frame.
    pub(crate) fn owns_scope(self) -> bool {
        matches!(
            self,
            UnitKind::Module
                | UnitKind::Function
                | UnitKind::Block
                | UnitKind::Iteration
                | UnitKind::Round
        )
    }
}

/// Execution-unit states - uses u8 for AtomicU8 compatibility
///
/// Transitions: `Inert -> Running -> Complete`;
/// `Running -> Aborted` (externally cancelled, soft);
/// `Complete -> Resuming -> Running` (rescheduled after an upstream change);
/// `Complete/Aborted -> Inert` (full reset, round recycling).
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitState {
    /// Never run, or fully recycled.
    Inert = 0,
    /// Currently executing.
    Running = 1,
    /// Ran to completion; effects are current.
    Complete = 2,
    /// Rescheduled; will run again in the current or next pass.
    Resuming = 3,
    /// Soft-aborted: stale for this pass, eligible for resumption.
    Aborted = 4,
}

impl UnitState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => UnitState::Inert,
            1 => UnitState::Running,
            2 => UnitState::Complete,
            3 => UnitState::Resuming,
            _ => UnitState::Aborted,
        }
    }
}

/// The three flow-control command channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlowKind {
    /// Terminate the matching iteration.
    Break,
    /// Skip to the next round of the matching iteration.
    Continue,
    /// Unwind to the enclosing function/module with a value.
    Return,
}

impl FlowKind {
    const ALL: [FlowKind; 3] = [FlowKind::Break, FlowKind::Continue, FlowKind::Return];

    fn slot(self) -> usize {
        match self {
            FlowKind::Break => 0,
            FlowKind::Continue => 1,
            FlowKind::Return => 2,
        }
    }
}

/// One raised flow-control command.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    /// Target label for break/continue, return value for return.
    pub arg: Value,
    /// Absorbed at the holding unit; not hoisted further.
    pub endpoint: bool,
    /// Serial of the unit that originally raised the command.
    pub origin: u64,
}

/// Per-unit flow-control slots, one per [`FlowKind`].
///
/// Cleared immediately before each execution and diffed against the pre-run
/// snapshot immediately after, to detect newly raised or newly cleared
/// commands.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FlowSet {
    slots: [Option<Command>; 3],
}

impl FlowSet {
    /// Command currently raised on `kind`, if any.
    pub fn get(&self, kind: FlowKind) -> Option<&Command> {
        self.slots[kind.slot()].as_ref()
    }

    /// Raise or replace the command on `kind`.
    pub fn set(&mut self, kind: FlowKind, cmd: Command) {
        self.slots[kind.slot()] = Some(cmd);
    }

    /// Clear the command on `kind`, returning it.
    pub fn clear(&mut self, kind: FlowKind) -> Option<Command> {
        self.slots[kind.slot()].take()
    }

    /// Mark the command on `kind` as absorbed at the holding unit.
    pub fn mark_endpoint(&mut self, kind: FlowKind) {
        if let Some(cmd) = &mut self.slots[kind.slot()] {
            cmd.endpoint = true;
        }
    }

    /// Whether any command is raised.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Iterate raised commands in `Break`, `Continue`, `Return` order.
    pub fn iter(&self) -> impl Iterator<Item = (FlowKind, &Command)> {
        FlowKind::ALL
            .iter()
            .filter_map(|&kind| self.slots[kind.slot()].as_ref().map(|cmd| (kind, cmd)))
    }
}

/// Metadata for an execution unit stored in the arena.
///
/// A unified struct for every unit kind: plain closure units, iterations and
/// rounds all share the same slots, with `iter` populated only for
/// iterations. The closure is stored directly in the arena and temporarily
/// taken out while it runs, so the arena lock is never held across user code.
pub struct UnitMetadata {
    /// The construct this unit was compiled from. Fixed at creation.
    pub(crate) kind: UnitKind,
    /// The unit's scope frame (own for scope-owning kinds, inherited else).
    pub(crate) scope: SignalId,
    /// Whether `scope` was created by and belongs to this unit.
    pub(crate) owns_scope: bool,
    /// Lineage path: ancestor positions plus own slot. Lexicographic order
    /// over paths is the global execution precedence.
    pub(crate) path: Box<[u64]>,
    /// Stable identity for error reports and command origins.
    pub(crate) serial: u64,
    /// Statement label, matched by labeled break/continue.
    pub(crate) label: Option<String>,
    /// Per-round binding name exposed to loop bodies.
    pub(crate) production: Option<String>,
    /// Lifecycle state machine.
    pub(crate) state: AtomicU8,
    /// The unit body. Taken out of the arena while running.
    pub(crate) closure: Mutex<Option<UnitClosure>>,
    /// Transform applied to the closure's result (declarations and
    /// assignments perform their scope write here).
    pub(crate) completion: Mutex<Option<CompletionFn>>,
    /// Flow-control slots.
    pub(crate) flow: Mutex<FlowSet>,
    /// Named memo slots, populated once per execution.
    pub(crate) memo: Mutex<IndexMap<&'static str, Value, FastHashBuilder>>,
    /// Mutations delivered since the last run; iterations reconcile from
    /// here, other kinds discard on execution.
    pub(crate) inbox: Mutex<Vec<Mutation>>,
    /// Pre-schedule filter; a rejected mutation does not reschedule this
    /// unit.
    pub(crate) filter: Option<MutationFilter>,
    /// Continuation unit declared after a block, aborted/resumed by the
    /// block's flow-control transitions.
    pub(crate) downstream: Mutex<Option<UnitId>>,
    /// For rounds: the round's key in the owning iteration.
    pub(crate) round_key: Option<Key>,
    /// For iterations: rounds, cursor and reconciliation state.
    pub(crate) iter: Option<Mutex<IterState>>,
    /// The closure (or a loop step) suspends; only an async flush may run
    /// this unit.
    pub(crate) is_async: bool,
    /// Slot counter handed to children for path construction.
    pub(crate) next_slot: AtomicU64,
    /// The scheduler that owns this unit's re-execution.
    pub(crate) scheduler: Arc<dyn Scheduler>,
    /// Cleanup registries; subscriptions and readers register here.
    pub(crate) lifecycle: Lifecycle,
}

impl UnitMetadata {
    pub(crate) fn state(&self) -> UnitState {
        UnitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: UnitState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn next_slot(&self) -> u64 {
        self.next_slot.fetch_add(1, Ordering::Relaxed)
    }
}

/// Unique identifier for an execution unit in the arena.
///
/// Zero-cost wrapper around a slab index; stale after teardown, and stale
/// access returns `None` instead of panicking.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct UnitId(u32);

impl UnitId {
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    /// Access the unit metadata with a closure (read-only borrow of the
    /// arena slot). Returns `None` on stale access.
    pub(crate) fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&UnitMetadata) -> R,
    {
        let arena = UNIT_ARENA.read();
        arena.get(self.index()).map(f)
    }

    /// Whether this id still points at a live unit.
    pub fn exists(self) -> bool {
        UNIT_ARENA.read().contains(self.index())
    }

    /// Current lifecycle state, `Aborted` for stale ids.
    pub fn state(self) -> UnitState {
        self.with(UnitMetadata::state).unwrap_or(UnitState::Aborted)
    }

    pub(crate) fn set_state(self, state: UnitState) {
        self.with(|m| m.set_state(state));
    }

    /// The owning parent unit, if any.
    pub fn parent(self) -> Option<UnitId> {
        unit_parent(self)
    }

    /// Stable serial for error reports.
    pub fn serial(self) -> u64 {
        self.with(|m| m.serial).unwrap_or(0)
    }

    /// Clone of the lineage path.
    pub fn path(self) -> Vec<u64> {
        self.with(|m| m.path.to_vec()).unwrap_or_default()
    }

    /// The unit's scope frame.
    pub fn scope(self) -> Option<SignalId> {
        self.with(|m| m.scope)
    }
}

/// Insert unit metadata into the arena and return its ID
pub fn unit_arena_insert(metadata: UnitMetadata) -> UnitId {
    let mut arena = UNIT_ARENA.write();
    let entry = arena.vacant_entry();
    let key = entry.key();
    entry.insert(metadata);
    UnitId::new(key as u32)
}

/// Remove a unit from the arena. Parent/children map entries must have been
/// unregistered first (see `unit_unregister`).
pub fn unit_arena_remove(id: UnitId) -> Option<UnitMetadata> {
    let mut arena = UNIT_ARENA.write();
    if arena.contains(id.index()) {
        Some(arena.remove(id.index()))
    } else {
        None
    }
}

/// Register `child` under `parent` in the global tree maps.
pub fn unit_register_child(parent: UnitId, child: UnitId) {
    {
        let guard = UNIT_PARENT.pin();
        guard.insert(child, parent);
    }
    let guard = UNIT_CHILDREN.pin();
    guard
        .get_or_insert_with(parent, || RwLock::new(Vec::new()))
        .write()
        .push(child);
}

/// Look up a unit's parent.
pub fn unit_parent(id: UnitId) -> Option<UnitId> {
    let guard = UNIT_PARENT.pin();
    guard.get(&id).copied()
}

/// Snapshot of a unit's children in creation order.
pub fn unit_children(id: UnitId) -> Vec<UnitId> {
    let guard = UNIT_CHILDREN.pin();
    guard
        .get(&id)
        .map(|children| children.read().clone())
        .unwrap_or_default()
}

/// Drop a unit's tree-map entries: its parent link, its children list, and
/// its slot in the parent's children list.
pub fn unit_unregister(id: UnitId) {
    let parent = {
        let guard = UNIT_PARENT.pin();
        guard.remove(&id).copied()
    };
    if let Some(parent) = parent {
        let guard = UNIT_CHILDREN.pin();
        if let Some(children) = guard.get(&parent) {
            children.write().retain(|c| *c != id);
        }
    }
    let guard = UNIT_CHILDREN.pin();
    guard.remove(&id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_set_iterates_in_fixed_order() {
        let mut flow = FlowSet::default();
        flow.set(
            FlowKind::Return,
            Command { arg: Value::Null, endpoint: false, origin: 1 },
        );
        flow.set(
            FlowKind::Break,
            Command { arg: Value::Undefined, endpoint: false, origin: 2 },
        );

        let kinds: Vec<FlowKind> = flow.iter().map(|(k, _)| k).collect();
        assert_eq!(kinds, vec![FlowKind::Break, FlowKind::Return]);
    }

    #[test]
    fn clear_empties_a_slot() {
        let mut flow = FlowSet::default();
        flow.set(
            FlowKind::Continue,
            Command { arg: Value::Undefined, endpoint: false, origin: 3 },
        );
        assert!(!flow.is_empty());
        assert!(flow.clear(FlowKind::Continue).is_some());
        assert!(flow.is_empty());
        assert!(flow.clear(FlowKind::Continue).is_none());
    }

    #[test]
    fn serials_are_unique_and_increasing() {
        let a = next_serial();
        let b = next_serial();
        assert!(b > a);
    }
}
