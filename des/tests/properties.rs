//! Universal properties checked against randomly generated workloads,
//! the same way the upstream `BinaryHeap` is fuzzed by a bytecode of
//! operations: a "plan" is derived from arbitrary input, replayed
//! against the kernel, and an invariant is checked against the
//! replay's own bookkeeping rather than a second implementation.
use std::cell::RefCell;
use std::rc::Rc;

use des::{sleep, Sim};
use quickcheck_macros::quickcheck;

/// A small, bounded plan: each task sleeps for `delays[i] % 8` ticks
/// before recording the time it woke up.
fn run_plan(delays: &[u8]) -> Vec<des::Time> {
    let sim = Sim::new();
    let observed: Rc<RefCell<Vec<des::Time>>> = Rc::new(RefCell::new(Vec::new()));

    for &d in delays {
        let ticks = (d % 8) as u64;
        let observed = observed.clone();
        sim.spawn(
            async move {
                sleep(ticks).await?;
                observed.borrow_mut().push(des::now());
                Ok(())
            },
            None,
            0,
        );
    }

    sim.run(None).unwrap();
    Rc::try_unwrap(observed).unwrap().into_inner()
}

#[quickcheck]
fn time_never_moves_backward(delays: Vec<u8>) -> bool {
    let woke = run_plan(&delays);
    woke.windows(2).all(|w| w[0] <= w[1])
}

#[quickcheck]
fn every_task_is_accounted_for(delays: Vec<u8>) -> bool {
    run_plan(&delays).len() == delays.len()
}

#[quickcheck]
fn replaying_the_same_plan_gives_the_same_schedule(delays: Vec<u8>) -> bool {
    run_plan(&delays) == run_plan(&delays)
}

/// Tasks created before the first `run`/`step_once` all start at tick
/// 0, however long they individually sleep for beyond that.
#[quickcheck]
fn pre_run_tasks_all_observe_tick_zero_as_their_start(count: u8) -> bool {
    let count = (count % 16) as usize;
    let sim = Sim::new();
    let starts: Rc<RefCell<Vec<des::Time>>> = Rc::new(RefCell::new(Vec::new()));
    for _ in 0..count {
        let starts = starts.clone();
        sim.spawn(
            async move {
                starts.borrow_mut().push(des::now());
                Ok(())
            },
            None,
            0,
        );
    }
    sim.run(None).unwrap();
    starts.borrow().iter().all(|&t| t == des::Time(0))
}

/// Cancelling a task that's currently sleeping always resolves it with
/// `Cancelled`, never leaves it stuck or silently "completed".
#[quickcheck]
fn cancelling_a_sleeper_always_completes_as_cancelled(sleep_ticks: u8, cancel_after: u8) -> bool {
    let sim = Sim::new();
    let sleep_ticks = (sleep_ticks % 20) as u64;
    let cancel_after = (cancel_after % 20) as u64;

    let victim = sim.spawn(
        async move {
            sleep(sleep_ticks).await?;
            Ok(())
        },
        None,
        0,
    );
    let target = victim.clone();
    sim.spawn(
        async move {
            sleep(cancel_after).await?;
            target.cancel(None);
            Ok(())
        },
        None,
        0,
    );

    sim.run(None).unwrap();
    // The victim is spawned (and so scheduled) before the canceller, so
    // on a tie at the same wake time the victim's completion is always
    // dispatched first and wins the race.
    match victim.result() {
        Some(Ok(())) => cancel_after >= sleep_ticks,
        Some(Err(des::KernelError::Cancelled(_))) => cancel_after < sleep_ticks,
        _ => false,
    }
}

/// A semaphore's `value()` never goes negative and never exceeds the
/// count of units ever `put` back in, regardless of request order.
#[quickcheck]
fn semaphore_value_stays_within_bounds(ops: Vec<bool>) -> bool {
    let sim = Sim::new();
    let sem = des::Semaphore::new(sim.kernel(), 1, None);
    let within_bounds: Rc<RefCell<bool>> = Rc::new(RefCell::new(true));

    for &is_get in &ops {
        let sem = sem.clone();
        let within_bounds = within_bounds.clone();
        sim.spawn(
            async move {
                if is_get {
                    sem.get(0).await?;
                } else {
                    let _ = sem.put();
                }
                if sem.value() < 0 {
                    *within_bounds.borrow_mut() = false;
                }
                Ok(())
            },
            None,
            0,
        );
    }

    sim.run(None).unwrap();
    *within_bounds.borrow()
}
