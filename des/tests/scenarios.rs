//! Fixed end-to-end scenarios exercising the scheduler, the delta-cycle
//! variables, and every synchronization primitive together.
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use des::{
    all_of, any_of, create_task, now, sleep, Aggregate, Container, Event, Lock, Queue, Semaphore,
    Sim, Singular,
};

#[test]
fn hello_single_task_runs_to_completion() {
    let result = des::run(async { Ok(7) });
    assert_eq!(result.unwrap(), 7);
}

#[test]
fn hello_sleeps_advance_the_clock() {
    let result = des::run(async {
        sleep(10).await?;
        Ok(now())
    });
    assert_eq!(result.unwrap(), des::Time(10));
}

#[test]
fn adder_pairs_putter_and_getter_through_a_queue() {
    let sim = Sim::new();
    let queue: Rc<Queue<i32>> = Rc::new(Queue::new(sim.kernel(), 1));

    let q1 = queue.clone();
    sim.spawn(
        async move {
            for value in [1, 2, 3] {
                sleep(1).await?;
                q1.put(value).await?;
            }
            Ok(())
        },
        Some("putter"),
        0,
    );

    let q2 = queue.clone();
    let total = sim.spawn(
        async move {
            let mut sum = 0;
            for _ in 0..3 {
                sum += q2.get().await?;
            }
            Ok(sum)
        },
        Some("getter"),
        0,
    );

    sim.run(None).unwrap();
    assert_eq!(total.result().unwrap().unwrap(), 6);
}

#[test]
fn event_set_wakes_every_waiter_in_the_same_slot() {
    let sim = Sim::new();
    let event = Event::new(sim.kernel());
    let woken_at: Rc<RefCell<Vec<des::Time>>> = Rc::new(RefCell::new(Vec::new()));

    for _ in 0..3 {
        let event = event.clone();
        let woken_at = woken_at.clone();
        sim.spawn(
            async move {
                event.wait().await?;
                woken_at.borrow_mut().push(now());
                Ok(())
            },
            None,
            0,
        );
    }

    sim.spawn(
        async move {
            sleep(5).await?;
            event.set();
            Ok(())
        },
        Some("setter"),
        0,
    );

    sim.run(None).unwrap();
    let woken = woken_at.borrow();
    assert_eq!(woken.len(), 3);
    assert!(woken.iter().all(|&t| t == des::Time(5)));
}

#[test]
fn cancelling_a_sleeping_task_delivers_cancelled_error() {
    let sim = Sim::new();
    let handle = sim.spawn(
        async move {
            sleep(100).await?;
            Ok(())
        },
        Some("victim"),
        0,
    );
    let victim = handle.clone();
    sim.spawn(
        async move {
            sleep(1).await?;
            victim.cancel(Some("timeout".into()));
            Ok(())
        },
        Some("canceller"),
        0,
    );

    sim.run(None).unwrap();
    let err = handle.result().unwrap().unwrap_err();
    assert!(matches!(err, des::KernelError::Cancelled(Some(msg)) if msg == "timeout"));
}

#[test]
fn semaphore_grants_to_lower_priority_number_first() {
    let sim = Sim::new();
    let sem = Semaphore::new(sim.kernel(), 0, None);
    let order: Rc<RefCell<Vec<i64>>> = Rc::new(RefCell::new(Vec::new()));

    // All three tasks request at time 0 before any unit is available,
    // so they queue up purely on priority (lower number wins).
    for priority in [5, 1, 3] {
        let sem = sem.clone();
        let order = order.clone();
        sim.spawn(
            async move {
                sem.get(priority).await?;
                order.borrow_mut().push(priority);
                Ok(())
            },
            None,
            priority,
        );
    }

    sim.spawn(
        async move {
            sleep(1).await?;
            for _ in 0..3 {
                sem.put().unwrap();
            }
            Ok(())
        },
        Some("releaser"),
        0,
    );

    sim.run(None).unwrap();
    assert_eq!(*order.borrow(), vec![1, 3, 5]);
}

#[test]
fn lock_serializes_critical_sections() {
    let sim = Sim::new();
    let lock = Lock::new(sim.kernel());
    let active: Rc<RefCell<i32>> = Rc::new(RefCell::new(0));
    let max_active: Rc<RefCell<i32>> = Rc::new(RefCell::new(0));

    for _ in 0..4 {
        let lock = lock.clone();
        let active = active.clone();
        let max_active = max_active.clone();
        sim.spawn(
            async move {
                let guard = lock.acquire(0).await?;
                *active.borrow_mut() += 1;
                *max_active.borrow_mut() = (*max_active.borrow()).max(*active.borrow());
                sleep(1).await?;
                *active.borrow_mut() -= 1;
                drop(guard);
                Ok(())
            },
            None,
            0,
        );
    }

    sim.run(None).unwrap();
    assert_eq!(*max_active.borrow(), 1);
}

#[test]
fn delta_cycle_register_file_reads_see_only_committed_values() {
    let sim = Sim::new();
    let reg: Singular<i32> = Singular::new(sim.kernel(), 0);
    let reads: Rc<RefCell<Vec<i32>>> = Rc::new(RefCell::new(Vec::new()));

    // Two writers race to set the register in the same slot; a third
    // task reads it in that same slot before any commit happens.
    let r1 = reg.clone();
    sim.spawn(async move { r1.set(10); Ok(()) }, Some("writer-a"), 0);
    let r2 = reg.clone();
    sim.spawn(async move { r2.set(20); Ok(()) }, Some("writer-b"), 1);

    let r3 = reg.clone();
    let reads2 = reads.clone();
    sim.spawn(
        async move {
            reads2.borrow_mut().push(r3.get());
            Ok(())
        },
        Some("reader"),
        2,
    );

    let r4 = reg.clone();
    sim.spawn(
        async move {
            r4.changed().await?;
            Ok(())
        },
        Some("watcher"),
        0,
    );

    sim.run(None).unwrap();
    // The reader ran before the commit, so it must have seen the
    // initial value regardless of write order.
    assert_eq!(*reads.borrow(), vec![0]);
    assert_eq!(reg.get(), 20);
}

#[test]
fn aggregate_commits_every_touched_key_together() {
    let sim = Sim::new();
    let mut init = HashMap::new();
    init.insert("a", 0);
    init.insert("b", 0);
    let regs: Aggregate<&'static str, i32> = Aggregate::new(sim.kernel(), init);

    let r1 = regs.clone();
    sim.spawn(async move { r1.set("a", 1); Ok(()) }, None, 0);
    let r2 = regs.clone();
    sim.spawn(async move { r2.set("b", 2); Ok(()) }, None, 0);

    let watcher = regs.clone();
    sim.spawn(
        async move {
            watcher
                .changed_when(|_old, new| new.get("a") == Some(&1) && new.get("b") == Some(&2))
                .await?;
            Ok(())
        },
        None,
        0,
    );

    sim.run(None).unwrap();
    assert_eq!(regs.get(&"a"), Some(1));
    assert_eq!(regs.get(&"b"), Some(2));
}

#[test]
fn container_serves_requests_in_arrival_order() {
    let sim = Sim::new();
    let pool = Container::new(sim.kernel(), 0, 10);
    let order: Rc<RefCell<Vec<i64>>> = Rc::new(RefCell::new(Vec::new()));

    for (i, amount) in [(0, 5), (1, 3)] {
        let pool = pool.clone();
        let order = order.clone();
        sim.spawn(
            async move {
                pool.get(amount).await?;
                order.borrow_mut().push(i);
                Ok(())
            },
            None,
            0,
        );
    }

    sim.spawn(
        async move {
            sleep(1).await?;
            pool.put(8).unwrap();
            Ok(())
        },
        Some("filler"),
        0,
    );

    sim.run(None).unwrap();
    assert_eq!(*order.borrow(), vec![0, 1]);
}

#[test]
fn all_of_collects_every_result_in_unblock_order() {
    let result = des::run(async {
        // Submitted 3, 1, 2 but must come back 1, 2, 3: the order each
        // task actually finishes in, not the order it was submitted in.
        let futures: Vec<_> = [3u64, 1, 2]
            .into_iter()
            .map(|n| Box::pin(async move {
                sleep(n).await?;
                Ok(n)
            }) as std::pin::Pin<Box<dyn std::future::Future<Output = des::Result<u64>>>>)
            .collect();
        all_of(futures).await
    });
    assert_eq!(result.unwrap(), vec![1, 2, 3]);
}

#[test]
fn any_of_returns_the_first_finisher_and_cancels_the_rest() {
    let result = des::run(async {
        let futures: Vec<_> = [10u64, 1, 20]
            .into_iter()
            .map(|n| Box::pin(async move {
                sleep(n).await?;
                Ok(n)
            }) as std::pin::Pin<Box<dyn std::future::Future<Output = des::Result<u64>>>>)
            .collect();
        any_of(futures).await
    });
    assert_eq!(result.unwrap(), 1);
}

#[test]
fn create_task_from_within_a_running_task_is_joinable() {
    let result = des::run(async {
        let child = create_task(async { Ok(41) }, Some("child"), 0);
        let v = child.join().await?;
        Ok(v + 1)
    });
    assert_eq!(result.unwrap(), 42);
}
