//! Signal behavior: lazy child creation, subscription, refresh, and the
//! mutation dispatch that drives re-execution.
//!
//! A signal holds one state slot and lazily grows a child signal per
//! dereferenced sub-path. Mutations enter through the explicit path
//! accessors ([`SignalId::write_path`]); there is no transparent property
//! interception. The dispatch path refreshes affected children, filters
//! subscribers through the re-entrancy guard and their pre-schedule
//! filters, and hands the survivors to their owning schedulers in lineage
//! order.

use crate::arena::{
    SignalId, SignalMetadata, UnitId, UnitState, signal_arena_insert,
};
use crate::error::{Error, Result};
use crate::sched::Scheduler;
use crate::value::{Key, Value};
use std::sync::Arc;
use tracing::trace;

/// How a single key of a container changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationKind {
    /// Key written (created or replaced).
    Set,
    /// Key removed; array removals shift later elements down.
    Delete,
}

/// One observed change to one key of a container value.
#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    /// The mutated key.
    pub key: Key,
    /// Write or removal.
    pub kind: MutationKind,
    /// The new value (`Undefined` for removals).
    pub value: Value,
}

impl SignalId {
    /// Clone of the cached state.
    pub fn state(self) -> Value {
        self.with(|m| m.state.read().clone()).unwrap_or_default()
    }

    pub(crate) fn set_state_raw(self, value: Value) {
        self.with(|m| *m.state.write() = value);
    }

    /// Whether the signal is actively observing mutations of its value.
    ///
    /// True iff it has at least one child signal and its state is a
    /// container.
    pub fn is_watching(self) -> bool {
        self.with(|m| m.is_watching()).unwrap_or(false)
    }

    /// Number of live subscribers. Stale ids report zero.
    pub fn subscriber_count(self) -> usize {
        self.with(|m| m.subscribers.read().len()).unwrap_or(0)
    }

    /// Return the child signal for `key`, creating it on first dereference.
    ///
    /// The child is seeded from the current state's value at `key`, or
    /// `Undefined` when absent. Creating the first child enables watch mode.
    pub fn child(self, key: &Key) -> SignalId {
        let existing = self.with(|m| m.children.read().get(key).copied()).flatten();
        if let Some(child) = existing {
            return child;
        }
        let seed = self
            .with(|m| m.state.read().get(key).cloned())
            .flatten()
            .unwrap_or_default();
        let child = signal_arena_insert(SignalMetadata::property(self, key.clone(), seed));
        self.with(|m| m.children.write().insert(key.clone(), child));
        self.update_watch();
        child
    }

    /// Walk `path` creating child signals per segment; returns the leaf.
    pub fn signal_at(self, path: &[Key]) -> SignalId {
        let mut cur = self;
        for key in path {
            cur = cur.child(key);
        }
        cur
    }

    /// Dereference `path`, binding `bind` (if given) as a live subscriber of
    /// the leaf signal. Returns a snapshot of the leaf value.
    pub fn read_path(self, path: &[Key], bind: Option<UnitId>) -> Value {
        let leaf = self.signal_at(path);
        if let Some(unit) = bind {
            leaf.subscribe(unit);
        }
        leaf.state()
    }

    /// Register `unit` as a dependent of this signal.
    ///
    /// A single-shot cleanup is registered on the unit that removes the
    /// subscription when the unit is torn down; removing the last
    /// subscriber of a childless signal tears the signal down too.
    pub fn subscribe(self, unit: UnitId) {
        let inserted = self
            .with(|m| m.subscribers.write().insert(unit))
            .unwrap_or(false);
        if inserted {
            let signal = self;
            unit.with(|m| {
                m.lifecycle.once(move || signal.unsubscribe(unit));
            });
        }
    }

    /// Remove `unit` from the subscriber set. If that leaves the signal with
    /// no subscribers and no children, the signal tears itself down.
    pub fn unsubscribe(self, unit: UnitId) {
        let now_empty = self.with(|m| {
            let mut subs = m.subscribers.write();
            subs.swap_remove(&unit);
            subs.is_empty() && m.children.read().is_empty()
        });
        if now_empty == Some(true) && self.with(|m| m.context).flatten().is_some() {
            cov_mark::hit!(signal_self_destroys);
            self.teardown();
        }
    }

    /// Replace the cached state and recursively refresh every child from
    /// the new value, then re-evaluate watch mode (the state may have
    /// flipped between container and primitive).
    pub fn refresh(self, new_state: Value) {
        let kids: Vec<(Key, SignalId)> = self
            .with(|m| {
                *m.state.write() = new_state;
                m.children.read().iter().map(|(k, v)| (k.clone(), *v)).collect()
            })
            .unwrap_or_default();
        for (key, child) in kids {
            let sub = self
                .with(|m| m.state.read().get(&key).cloned())
                .flatten()
                .unwrap_or_default();
            child.refresh(sub);
        }
        self.update_watch();
    }

    pub(crate) fn update_watch(self) {
        self.with(|m| {
            let should = !m.children.read().is_empty() && m.state.read().is_container();
            let was = m.is_watching();
            if was && !should {
                cov_mark::hit!(watch_mode_disabled);
            }
            m.set_watching(should);
        });
    }

    /// Mutate the value at `path` below this signal. `value` of `None`
    /// means deletion. No-op writes (the value at the path is unchanged)
    /// dispatch nothing.
    pub fn write_path(self, path: &[Key], value: Option<Value>) -> Result<()> {
        assert!(!path.is_empty(), "write_path requires a non-empty path");

        // No-op detection against the current cached tree.
        let mut state = self.state();
        {
            let mut probe: &Value = &state;
            let mut reachable = true;
            for key in &path[..path.len() - 1] {
                match probe.get(key) {
                    Some(next) => probe = next,
                    None => {
                        reachable = false;
                        break;
                    }
                }
            }
            if reachable {
                let leaf = probe.get(&path[path.len() - 1]);
                match &value {
                    Some(v) if leaf == Some(v) => {
                        cov_mark::hit!(noop_write_skipped);
                        return Ok(());
                    }
                    None if leaf.is_none() => return Ok(()),
                    _ => {}
                }
            }
        }

        mutate_in(&mut state, path, value.clone())?;
        self.set_state_raw(state);

        // Sync cached states down the existing child-signal chain; the
        // chain ends where no consumer has dereferenced.
        let mut cur = self;
        for key in &path[..path.len() - 1] {
            let Some(next) = cur.with(|m| m.children.read().get(key).copied()).flatten() else {
                return Ok(());
            };
            let sub = cur
                .with(|m| m.state.read().get(key).cloned())
                .flatten()
                .unwrap_or_default();
            next.set_state_raw(sub);
            next.update_watch();
            cur = next;
        }

        let last = path[path.len() - 1].clone();
        let mutation = match value {
            Some(v) => Mutation { key: last, kind: MutationKind::Set, value: v },
            None => Mutation { key: last, kind: MutationKind::Delete, value: Value::Undefined },
        };
        cur.apply_mutations(&[mutation]);
        Ok(())
    }

    /// Dispatch an observed mutation batch.
    ///
    /// For each mutated key with an existing child signal the child is
    /// refreshed from the new state; subscribers of refreshed children and
    /// of this signal itself are collected, minus units on their
    /// scheduler's active call stack and units whose filter rejects the
    /// mutation. Survivors are handed to their owning schedulers in
    /// lineage-path order, mutation traversal order as tie-break.
    pub(crate) fn apply_mutations(self, batch: &[Mutation]) {
        let state = self.state();
        let mut pending: Vec<(UnitId, Arc<dyn Scheduler>)> = Vec::new();

        let consider = |unit: UnitId, m: &Mutation, pending: &mut Vec<(UnitId, Arc<dyn Scheduler>)>| {
            let Some((sched, accepted, st)) = unit.with(|meta| {
                let accepted = meta.filter.as_ref().is_none_or(|f| f(m));
                (meta.scheduler.clone(), accepted, meta.state())
            }) else {
                return;
            };
            if !accepted {
                cov_mark::hit!(filter_rejected_mutation);
                return;
            }
            if sched.is_active(unit) {
                cov_mark::hit!(reentrancy_guard_skip);
                return;
            }
            if st == UnitState::Aborted {
                return;
            }
            unit.with(|meta| meta.inbox.lock().push(m.clone()));
            if !pending.iter().any(|(u, _)| *u == unit) {
                pending.push((unit, sched));
            }
        };

        for m in batch {
            // Array removals shift every later element; treat the trailing
            // keys as part of the batch.
            let shifted: Vec<Key> = if m.kind == MutationKind::Delete
                && matches!(m.key, Key::Index(_))
                && matches!(state, Value::Array(_))
            {
                let Key::Index(from) = m.key else { unreachable!() };
                self.with(|meta| {
                    meta.children
                        .read()
                        .keys()
                        .filter(|k| matches!(k, Key::Index(i) if *i > from))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
            } else {
                Vec::new()
            };

            for key in std::iter::once(&m.key).chain(shifted.iter()) {
                let child = self.with(|meta| meta.children.read().get(key).copied()).flatten();
                let Some(child) = child else { continue };
                let fresh = state.get(key).cloned().unwrap_or_default();
                if child.state() == fresh {
                    continue;
                }
                child.refresh(fresh);
                let subs: Vec<UnitId> = child
                    .with(|meta| meta.subscribers.read().iter().copied().collect())
                    .unwrap_or_default();
                for unit in subs {
                    consider(unit, m, &mut pending);
                }
            }

            let own: Vec<UnitId> = self
                .with(|meta| meta.subscribers.read().iter().copied().collect())
                .unwrap_or_default();
            for unit in own {
                consider(unit, m, &mut pending);
            }
        }

        if pending.is_empty() {
            return;
        }
        trace!(signal = self.index(), units = pending.len(), "dispatching mutation batch");

        // Resuming is only entered from Complete; new (Inert) rounds and
        // already-resuming units keep their state.
        for (unit, _) in &pending {
            if unit.state() == UnitState::Complete {
                unit.set_state(UnitState::Resuming);
            }
        }

        // Group by owning scheduler, keeping lineage order within a group.
        let mut groups: Vec<(usize, Arc<dyn Scheduler>, Vec<UnitId>)> = Vec::new();
        for (unit, sched) in pending {
            let ptr = Arc::as_ptr(&sched) as *const () as usize;
            match groups.iter_mut().find(|(p, _, _)| *p == ptr) {
                Some((_, _, units)) => units.push(unit),
                None => groups.push((ptr, sched, vec![unit])),
            }
        }
        for (_, sched, mut units) in groups {
            units.sort_by_key(|u| u.path());
            sched.schedule(&units);
        }
    }

    /// Tear this signal down: cascade to children, run cleanups, detach
    /// from the parent and free the arena slot.
    pub fn teardown(self) {
        let Some(meta) = crate::arena::signal_arena_remove(self) else {
            return;
        };
        trace!(signal = self.index(), "signal teardown");
        if let (Some(ctx), Some(key)) = (meta.context, meta.key.clone()) {
            ctx.with(|p| p.children.write().shift_remove(&key));
            ctx.update_watch();
        }
        let kids: Vec<SignalId> = meta.children.read().values().copied().collect();
        for child in kids {
            child.teardown();
        }
        meta.lifecycle.abort();
    }
}

fn mutate_in(state: &mut Value, path: &[Key], value: Option<Value>) -> Result<()> {
    let (last, rest) = path.split_last().expect("non-empty path");
    let mut cur = state;
    for key in rest {
        if !cur.is_container() {
            return Err(Error::NotIndexable {
                key: key.to_string(),
                type_name: cur.type_name(),
            });
        }
        if cur.get(key).is_none() {
            cur.set(key, Value::object());
        }
        cur = match (cur, key) {
            (Value::Object(map), Key::Name(name)) => map.get_mut(name).unwrap(),
            (Value::Object(map), Key::Index(i)) => map.get_mut(&i.to_string()).unwrap(),
            (Value::Array(items), Key::Index(i)) => &mut items[*i],
            (cur, key) => {
                return Err(Error::NotIndexable {
                    key: key.to_string(),
                    type_name: cur.type_name(),
                });
            }
        };
    }
    if !cur.is_container() {
        return Err(Error::NotIndexable {
            key: last.to_string(),
            type_name: cur.type_name(),
        });
    }
    match value {
        Some(v) => {
            cur.set(last, v);
        }
        None => {
            cur.delete(last);
        }
    }
    Ok(())
}

/// An owned root state holder.
///
/// Embedding code that wants observable state outside any scope chain (or a
/// test fixture) creates one of these; dropping it tears the whole signal
/// subtree down.
pub struct Signal {
    id: SignalId,
}

impl Signal {
    /// Allocate a root signal holding `state`.
    pub fn new(state: Value) -> Self {
        Self { id: signal_arena_insert(SignalMetadata::root(state)) }
    }

    /// The arena id, for path reads/writes and subscriptions.
    pub fn id(&self) -> SignalId {
        self.id
    }

    /// Write the value at `path`; see [`SignalId::write_path`].
    pub fn set(&self, path: &[Key], value: Value) -> Result<()> {
        self.id.write_path(path, Some(value))
    }

    /// Delete the value at `path`.
    pub fn delete(&self, path: &[Key]) -> Result<()> {
        self.id.write_path(path, None)
    }

    /// Snapshot of the value at `path` without binding a subscription.
    pub fn get(&self, path: &[Key]) -> Value {
        self.id.read_path(path, None)
    }
}

impl Drop for Signal {
    fn drop(&mut self) {
        self.id.teardown();
    }
}

// NOTE: Signal intentionally does not implement Clone. Tearing down on drop
// makes a clone a double-teardown hazard; share the SignalId instead.

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_signals_are_lazy_and_seeded() {
        let root = Signal::new(Value::object());
        root.set(&[Key::from("x")], Value::Number(5.0)).unwrap();

        assert_eq!(root.id().with(|m| m.children.read().len()), Some(0));
        let child = root.id().child(&Key::from("x"));
        assert_eq!(child.state(), Value::Number(5.0));
        assert_eq!(root.id().with(|m| m.children.read().len()), Some(1));
    }

    #[test]
    fn watch_mode_tracks_children_and_container_state() {
        let root = Signal::new(Value::object());
        assert!(!root.id().is_watching());

        root.id().child(&Key::from("a"));
        assert!(root.id().is_watching());

        // A refresh to a primitive must drop watch mode even with children.
        root.id().refresh(Value::Number(1.0));
        assert!(!root.id().is_watching());
    }

    #[test]
    fn refresh_cascades_to_children() {
        let root = Signal::new(Value::object());
        root.set(&[Key::from("obj")], Value::object()).unwrap();
        root.set(&[Key::from("obj"), Key::from("n")], Value::Number(1.0)).unwrap();

        let leaf = root.id().signal_at(&[Key::from("obj"), Key::from("n")]);
        assert_eq!(leaf.state(), Value::Number(1.0));

        let mut replacement = Value::object();
        replacement.set(&Key::from("n"), Value::Number(7.0));
        root.id().child(&Key::from("obj")).refresh(replacement);
        assert_eq!(leaf.state(), Value::Number(7.0));
    }

    #[test]
    fn noop_writes_dispatch_nothing() {
        cov_mark::check!(noop_write_skipped);
        let root = Signal::new(Value::object());
        root.set(&[Key::from("x")], Value::Number(3.0)).unwrap();
        root.set(&[Key::from("x")], Value::Number(3.0)).unwrap();
    }

    #[test]
    fn write_through_primitive_errors() {
        let root = Signal::new(Value::object());
        root.set(&[Key::from("x")], Value::Number(3.0)).unwrap();
        let err = root
            .set(&[Key::from("x"), Key::from("deep")], Value::Null)
            .unwrap_err();
        assert!(matches!(err, Error::NotIndexable { .. }));
    }
}
