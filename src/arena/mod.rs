// Arena-based storage for reactive node metadata
//
// Two arenas back the engine:
// - Signal arena: SignalMetadata (cached value, children, subscribers, symbols)
// - Unit arena: UnitMetadata (closure, flow-control slots, lineage path)
//
// Both use global static storage behind RwLock. SignalId and UnitId are
// lightweight index newtypes; accessing a removed entry returns None rather
// than panicking, so stale ids held across teardown are harmless.

pub mod signal_arena;
pub mod unit_arena;

pub use signal_arena::{
    ScopeKind, SignalId, SignalKind, SignalMetadata, signal_arena_insert, signal_arena_remove,
};

pub use unit_arena::{
    Command, FlowKind, FlowSet, UnitId, UnitKind, UnitMetadata, UnitState, next_serial,
    unit_arena_insert, unit_arena_remove, unit_children, unit_parent, unit_register_child,
    unit_unregister,
};
