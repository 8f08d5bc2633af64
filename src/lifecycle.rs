//! Cleanup registries shared by signals and execution units.
//!
//! Every arena-held resource owns a [`Lifecycle`]: a set of permanent
//! finalizers (run on teardown) and a set of single-shot cleanups (run on
//! teardown or when explicitly fired, whichever comes first — subscriptions
//! register here). Teardown cascades through both and is idempotent.

use crate::hash::FastHashBuilder;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

type Finalizer = Box<dyn FnOnce() + Send>;

/// Handle to a registered single-shot cleanup, used to fire or cancel it
/// before teardown.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CleanupKey(u64);

/// Two cleanup registries plus an aborted flag.
///
/// `always` finalizers run once on [`abort`](Lifecycle::abort) in
/// registration order. `once` cleanups run at most once — either when fired
/// via [`take`](Lifecycle::take) (e.g. a subscription removed early) or
/// during `abort`.
#[derive(Default)]
pub struct Lifecycle {
    always: Mutex<Vec<Finalizer>>,
    once: Mutex<IndexMap<CleanupKey, Finalizer, FastHashBuilder>>,
    aborted: AtomicBool,
}

static NEXT_CLEANUP: AtomicU64 = AtomicU64::new(0);

impl Lifecycle {
    /// Fresh lifecycle with empty registries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `abort` has already run.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Register a permanent finalizer. Runs exactly once, on abort.
    ///
    /// If the lifecycle is already aborted the finalizer runs immediately.
    pub fn on_abort(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_aborted() {
            f();
            return;
        }
        self.always.lock().push(Box::new(f));
    }

    /// Register a single-shot cleanup and return its key.
    ///
    /// If the lifecycle is already aborted the cleanup runs immediately and
    /// the returned key is inert.
    pub fn once(&self, f: impl FnOnce() + Send + 'static) -> CleanupKey {
        let key = CleanupKey(NEXT_CLEANUP.fetch_add(1, Ordering::Relaxed));
        if self.is_aborted() {
            f();
            return key;
        }
        self.once.lock().insert(key, Box::new(f));
        key
    }

    /// Fire a single-shot cleanup early. No-op if it already ran.
    pub fn take(&self, key: CleanupKey) {
        let f = self.once.lock().shift_remove(&key);
        if let Some(f) = f {
            f();
        }
    }

    /// Drop a single-shot cleanup without running it.
    pub fn cancel(&self, key: CleanupKey) {
        self.once.lock().shift_remove(&key);
    }

    /// Fire every pending single-shot cleanup now, keeping the resource
    /// alive. Re-running units drain their previous run's subscriptions
    /// through here before the closure re-establishes them.
    pub fn fire_once_all(&self) {
        for f in self.drain_once() {
            f();
        }
    }

    /// Remove all pending single-shot cleanups without running them, so a
    /// caller holding wider locks can run them after releasing.
    pub(crate) fn drain_once(&self) -> Vec<Box<dyn FnOnce() + Send>> {
        let mut map = self.once.lock();
        map.drain(..).map(|(_, f)| f).collect()
    }

    /// Run every pending cleanup — `once` first, then `always` — and mark
    /// the resource dead. Idempotent; later calls do nothing.
    pub fn abort(&self) {
        if self.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        // Drain under the lock, run outside it: cleanups may re-enter the
        // lifecycle (e.g. a subscription removal registering nothing).
        let once: Vec<Finalizer> = {
            let mut map = self.once.lock();
            map.drain(..).map(|(_, f)| f).collect()
        };
        for f in once {
            f();
        }
        let always: Vec<Finalizer> = std::mem::take(&mut *self.always.lock());
        for f in always {
            f();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn abort_runs_once_then_always_and_is_idempotent() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let lc = Lifecycle::new();

        let o = order.clone();
        lc.on_abort(move || o.lock().push("always"));
        let o = order.clone();
        lc.once(move || o.lock().push("once"));

        lc.abort();
        lc.abort();
        assert_eq!(*order.lock(), vec!["once", "always"]);
    }

    #[test]
    fn take_fires_early_and_not_again_on_abort() {
        let hits = Arc::new(AtomicUsize::new(0));
        let lc = Lifecycle::new();

        let h = hits.clone();
        let key = lc.once(move || {
            h.fetch_add(1, Ordering::Relaxed);
        });

        lc.take(key);
        lc.take(key);
        lc.abort();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn cancel_discards_without_running() {
        let hits = Arc::new(AtomicUsize::new(0));
        let lc = Lifecycle::new();

        let h = hits.clone();
        let key = lc.once(move || {
            h.fetch_add(1, Ordering::Relaxed);
        });

        lc.cancel(key);
        lc.abort();
        assert_eq!(hits.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn registration_after_abort_runs_immediately() {
        let hits = Arc::new(AtomicUsize::new(0));
        let lc = Lifecycle::new();
        lc.abort();

        let h = hits.clone();
        lc.on_abort(move || {
            h.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }
}
