//! Asynchronous iterator units.
//!
//! Identical reconciliation logic to the synchronous variant; the only
//! difference is that steps may suspend. Suspension points are fixed:
//! awaiting the test result, awaiting the init/production evaluation, and
//! awaiting a round's full execution before advancing — never inside
//! arbitrary expression code. That restriction keeps the re-entrancy
//! guarantees of the synchronous engine: the iteration stays on the active
//! call stack across its suspensions, so mutations raised from a suspended
//! round still see the iteration as running.

use crate::arena::{UnitId, UnitKind, UnitState};
use crate::error::Result;
use crate::iter::{
    self, IteratingGuard, LoopKind, LoopSpec, Pulled, create_round, initialize,
    pull, pull_counted_unchecked, with_iter,
};
use crate::sched::Scheduler;
use crate::unit::{StackGuard, UnitClosure};
use crate::value::Value;
use std::sync::Arc;

/// Take a loop-step closure out of the iteration state, run it (awaiting
/// asynchronous bodies), restore it.
async fn run_step_async(
    iteration: UnitId,
    pick: fn(&mut LoopSpec) -> &mut Option<UnitClosure>,
) -> Result<Option<Value>> {
    let Some(mut closure) = with_iter(iteration, |it| pick(&mut it.spec).take()).flatten() else {
        return Ok(None);
    };
    let result = match &mut closure {
        UnitClosure::Sync(f) => f(iteration),
        UnitClosure::Async(f) => f(iteration).await,
    };
    with_iter(iteration, |it| *pick(&mut it.spec) = Some(closure));
    result.map(Some)
}

/// Async twin of the bulk pass: pull and execute rounds until exhaustion
/// or a blocking command, awaiting at the fixed suspension points.
async fn bulk_iterate_async(iteration: UnitId, sched: &Arc<dyn Scheduler>) -> Result<()> {
    let _guard = IteratingGuard::new(iteration);
    loop {
        if iter::is_blocked(iteration) {
            return Ok(());
        }
        let pulled = pull_async(iteration).await?;
        let Some(Pulled { key, seed }) = pulled else {
            return Ok(());
        };
        let round = create_round(iteration, sched, key, seed)?;
        // Round failures are terminal for the round, not for the loop.
        // Boxed: execute_async reaches back here through the iteration
        // dispatch, and async recursion needs an erased future.
        if let Err(error) = Box::pin(round.execute_async()).await {
            iter::report_round_failure(sched, round, iteration, error);
        }
        let is_for = with_iter(iteration, |it| it.spec.kind == LoopKind::For).unwrap_or(false);
        if is_for {
            run_step_async(iteration, |spec| &mut spec.advance).await?;
        }
    }
}

/// Pull the next key/value, awaiting the test for counted loops. Keyed
/// loops pull from the snapshot cursor, which never suspends.
async fn pull_async(iteration: UnitId) -> Result<Option<Pulled>> {
    let Some((kind, cursor)) = with_iter(iteration, |it| (it.spec.kind, it.cursor)) else {
        return Ok(None);
    };
    match kind {
        LoopKind::ForOf | LoopKind::ForIn => pull(iteration),
        LoopKind::For | LoopKind::While | LoopKind::DoWhile => {
            let unconditional = kind == LoopKind::DoWhile && cursor == 0;
            if !unconditional {
                let test = run_step_async(iteration, |spec| &mut spec.test).await?;
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

/// Run an asynchronous iteration unit. Mirrors the synchronous
/// `run_iteration`; keyed reconciliation never suspends (new rounds are
/// scheduled, not executed inline), so it is shared with the sync variant.
pub(crate) async fn run_iteration_async(
    iteration: UnitId,
    sched: &Arc<dyn Scheduler>,
    before: crate::arena::FlowSet,
) -> Result<Value> {
    let result = {
        let _stack = StackGuard::new(sched.clone(), iteration);
        let initialized = with_iter(iteration, |it| it.initialized).unwrap_or(false);
        let keyed = with_iter(iteration, |it| it.spec.kind.keyed()).unwrap_or(false);
        if !initialized {
            match init_async(iteration).await {
                Ok(()) => bulk_iterate_async(iteration, sched).await,
                Err(error) => Err(error),
            }
        } else if keyed {
            match iter::reconcile(iteration, sched) {
                Ok(()) if wants_resume(iteration) => {
                    bulk_iterate_async(iteration, sched).await
                }
                other => other,
            }
        } else {
            iteration.with(|m| m.inbox.lock().clear());
            bulk_iterate_async(iteration, sched).await
        }
    };
    iteration.set_state(UnitState::Complete);
    result?;
    let after = iteration.with(|m| m.flow.lock().clone()).unwrap_or_default();
    iteration.settle(UnitKind::Iteration, &before, after);
    Ok(Value::Undefined)
}

/// After a keyed reconcile, the cursor may still sit short of the
/// collection (a cleared break): worth an async resume pull.
fn wants_resume(iteration: UnitId) -> bool {
    if iter::is_blocked(iteration) || iter::is_iterating(iteration) {
        return false;
    }
    let Some((cursor, iteratee)) = with_iter(iteration, |it| (it.cursor, it.iteratee)) else {
        return false;
    };
    iteratee.is_some_and(|signal| cursor < signal.state().iteration_keys().len())
}

/// Initialization may await the init closure; iteratee resolution itself
/// is a plain scope read.
async fn init_async(iteration: UnitId) -> Result<()> {
    let keyed = with_iter(iteration, |it| it.spec.kind.keyed()).unwrap_or(false);
    if keyed {
        initialize(iteration)
    } else {
        run_step_async(iteration, |spec| &mut spec.init).await?;
        with_iter(iteration, |it| it.initialized = true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::iter::LoopSpec;
    use crate::scope::DeclKind;
    use crate::sched::{QueueScheduler, SchedulerParams};
    use crate::unit::{Autorun, UnitSpec};
    use crate::value::Key;
    use futures::FutureExt;
    use futures::executor::block_on;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn async_rounds_visit_every_element() {
        let visits = Arc::new(AtomicUsize::new(0));
        let visits_in = visits.clone();
        let sched: Arc<QueueScheduler> =
            Arc::new(QueueScheduler::with_params(SchedulerParams { stateful_function: true }));

        let root = block_on(Autorun::root_async(
            sched.clone(),
            UnitSpec::new(UnitKind::Module).closure(move |unit| {
                unit.declare(DeclKind::Let, "items", 1, |_| {
                    Ok([1i64, 2].into_iter().collect())
                })?;
                let visits = visits_in.clone();
                let spec = UnitSpec::new(UnitKind::Iteration).production("item").loop_spec(
                    LoopSpec::for_of(vec![Key::from("items")], move |_| {
                        let visits = visits.clone();
                        UnitClosure::async_(move |round| {
                            let visits = visits.clone();
                            async move {
                                round.get(&[Key::from("item")])?;
                                visits.fetch_add(1, Ordering::Relaxed);
                                Ok(Value::Undefined)
                            }
                            .boxed()
                        })
                    })
                    .asynchronous(),
                );
                // The loop is asynchronous: autorun enqueues it for the
                // async flush instead of executing inline.
                unit.autorun(spec)?;
                Ok(Value::Undefined)
            }),
        ))
        .unwrap();

        assert_eq!(visits.load(Ordering::Relaxed), 0);
        block_on(sched.flush_async());
        assert_eq!(visits.load(Ordering::Relaxed), 2);

        // Appending reconciles exactly one new round, like the sync loop.
        root.id()
            .set(&[Key::from("items"), Key::Index(2)], Value::Number(3.0))
            .unwrap();
        block_on(sched.flush_async());
        assert_eq!(visits.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn async_counted_loop_awaits_the_test() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in = seen.clone();
        let sched: Arc<QueueScheduler> =
            Arc::new(QueueScheduler::with_params(SchedulerParams { stateful_function: true }));

        let _root = block_on(Autorun::root_async(
            sched.clone(),
            UnitSpec::new(UnitKind::Module).closure(move |unit| {
                unit.scope()
                    .unwrap()
                    .declare("n", DeclKind::Let, 9, Value::Number(0.0))?;
                let seen = seen_in.clone();
                let spec = UnitSpec::new(UnitKind::Iteration).loop_spec(
                    LoopSpec::counted(LoopKind::While, move |_| {
                        let seen = seen.clone();
                        UnitClosure::sync(move |round| {
                            let Value::Number(n) = round.get(&[Key::from("n")])? else {
                                return Err(Error::closure("n is not a number"));
                            };
                            seen.fetch_add(n as usize, Ordering::Relaxed);
                            Ok(Value::Undefined)
                        })
                    })
                    .test(UnitClosure::async_(|unit| {
                        async move {
                            let n = unit.get(&[Key::from("n")])?;
                            let proceed = matches!(&n, Value::Number(v) if *v < 2.0);
                            if proceed {
                                let Value::Number(v) = n else { unreachable!() };
                                unit.scope().unwrap().update("n", Value::Number(v + 1.0))?;
                            }
                            Ok(Value::Bool(proceed))
                        }
                        .boxed()
                    })),
                );
                unit.autorun(spec)?;
                Ok(Value::Undefined)
            }),
        ))
        .unwrap();

        block_on(sched.flush_async());
        // The test admitted n = 1 and n = 2, incrementing before each round.
        assert_eq!(seen.load(Ordering::Relaxed), 3);
    }
}
