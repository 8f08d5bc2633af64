// Signal arena - storage for signal metadata
//
// A signal is an observable holder of one state slot: a root environment, a
// variable, or an object/array property. Child signals exist only for
// sub-paths some consumer has dereferenced since the last teardown, and a
// signal watches mutations of its value iff it has children and the value is
// a container.
//
// Scopes are signals specialized with a symbol table; the specialization is
// a closed kind variant rather than a separate node family, so the whole
// state tree lives in one arena.

use crate::hash::FastHashBuilder;
use crate::lifecycle::Lifecycle;
use crate::value::{Key, Value};
use indexmap::{IndexMap, IndexSet};
use parking_lot::RwLock;
use slab::Slab;
use std::sync::atomic::{AtomicBool, Ordering};

use super::unit_arena::UnitId;

/// Global signal arena - stores all signal metadata
static SIGNAL_ARENA: RwLock<Slab<SignalMetadata>> = RwLock::new(Slab::new());

/// What kind of state slot a signal holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalKind {
    /// Detached root holder (tests, embedding-owned state).
    Root,
    /// A variable slot inside a scope.
    Variable,
    /// An object/array property reached by dereferencing a parent signal.
    Property,
    /// A lexical environment frame with a symbol table.
    Scope(ScopeKind),
}

/// Which construct a scope frame belongs to. `var` declarations hoist to the
/// nearest `Function`/`Module` frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeKind {
    /// Top-level program frame.
    Module,
    /// Function body frame; a `var` hoisting target.
    Function,
    /// Braced block frame.
    Block,
    /// Per-iteration frame owned by a loop round.
    Round,
}

/// Unique identifier for a signal node in the arena.
///
/// Zero-cost wrapper around a slab index. When a signal is torn down the id
/// goes stale; accessing a stale id returns `None`.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SignalId(u32);

impl SignalId {
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    /// Access the signal metadata with a closure (read-only borrow of the
    /// arena slot).
    ///
    /// Returns `None` if the signal has been removed (stale access).
    pub(crate) fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&SignalMetadata) -> R,
    {
        let arena = SIGNAL_ARENA.read();
        arena.get(self.index()).map(f)
    }

    /// Whether this id still points at a live signal.
    pub fn exists(self) -> bool {
        SIGNAL_ARENA.read().contains(self.index())
    }
}

/// Metadata for a signal stored in the arena.
///
/// The cached `state` is the engine's view of the value; all mutations flow
/// through the explicit accessors in `signal.rs`, which keep the cache and
/// the child signals coherent before dispatching to subscribers.
pub struct SignalMetadata {
    /// What kind of slot this is. Fixed at creation.
    pub(crate) kind: SignalKind,
    /// Owning parent signal; `None` for roots and root scopes.
    pub(crate) context: Option<SignalId>,
    /// This signal's key in its parent's children map.
    pub(crate) key: Option<Key>,
    /// Cached current value of the slot.
    pub(crate) state: RwLock<Value>,
    /// Child signals, one per dereferenced sub-path. Insertion-ordered so
    /// mutation traversal is deterministic.
    pub(crate) children: RwLock<IndexMap<Key, SignalId, FastHashBuilder>>,
    /// Units subscribed to this slot. Insertion-ordered for the mutation
    /// traversal tie-break.
    pub(crate) subscribers: RwLock<IndexSet<UnitId, FastHashBuilder>>,
    /// Symbol table; populated only for `SignalKind::Scope` signals.
    pub(crate) symbols: RwLock<IndexMap<String, crate::scope::Symbol, FastHashBuilder>>,
    /// Whether this signal is actively observing mutations of its value.
    pub(crate) watching: AtomicBool,
    /// Cleanup registries; subscriptions register their removal here.
    pub(crate) lifecycle: Lifecycle,
}

impl SignalMetadata {
    /// Metadata for a detached root holder.
    pub fn root(state: Value) -> Self {
        Self::new(SignalKind::Root, None, None, state)
    }

    /// Metadata for a scope frame. Scope state is an object map of bindings.
    pub fn scope(kind: ScopeKind, context: Option<SignalId>) -> Self {
        Self::new(SignalKind::Scope(kind), context, None, Value::object())
    }

    /// Metadata for a property child of `context` at `key`.
    pub fn property(context: SignalId, key: Key, state: Value) -> Self {
        Self::new(SignalKind::Property, Some(context), Some(key), state)
    }

    fn new(kind: SignalKind, context: Option<SignalId>, key: Option<Key>, state: Value) -> Self {
        Self {
            kind,
            context,
            key,
            state: RwLock::new(state),
            children: RwLock::new(IndexMap::with_hasher(FastHashBuilder)),
            subscribers: RwLock::new(IndexSet::with_hasher(FastHashBuilder)),
            symbols: RwLock::new(IndexMap::with_hasher(FastHashBuilder)),
            watching: AtomicBool::new(false),
            lifecycle: Lifecycle::new(),
        }
    }

    pub(crate) fn is_watching(&self) -> bool {
        self.watching.load(Ordering::Acquire)
    }

    pub(crate) fn set_watching(&self, on: bool) {
        self.watching.store(on, Ordering::Release);
    }
}

/// Insert a signal into the arena and return its ID
pub fn signal_arena_insert(metadata: SignalMetadata) -> SignalId {
    let mut arena = SIGNAL_ARENA.write();
    let entry = arena.vacant_entry();
    let key = entry.key();
    entry.insert(metadata);
    SignalId::new(key as u32)
}

/// Remove a signal from the arena
pub fn signal_arena_remove(id: SignalId) -> Option<SignalMetadata> {
    let mut arena = SIGNAL_ARENA.write();
    if arena.contains(id.index()) {
        Some(arena.remove(id.index()))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_access_returns_none() {
        let id = signal_arena_insert(SignalMetadata::root(Value::Null));
        signal_arena_remove(id);

        assert!(!id.exists());
        assert!(id.with(|_| ()).is_none());
    }
}
