use super::*;
use crate::test_utils::{Gate, Recorder, poll_until};
use anyhow::Result;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::collections::BTreeSet;
use std::thread;
use std::time::{Duration, Instant};

assert_impl_all!(Branch: Send, Sync);
assert_impl_all!(WaitStrategy: Send, Sync, Copy);

const LONG: Duration = Duration::from_secs(5);

#[rstest]
#[case::lowlatency(WaitStrategy::LowLatency)]
#[case::balance(WaitStrategy::Balance)]
#[case::blocking(WaitStrategy::Blocking)]
fn zero_initial_workers_still_spawns_one(#[case] strategy: WaitStrategy) {
    let branch = Branch::new(0, strategy);
    assert_eq!(branch.num_workers(), 1);
}

#[test]
fn blocking_branch_drains_all_submissions() -> Result<()> {
    // S1: two blocking workers, ten tasks, quiescence within a second.
    let branch = Branch::new(2, WaitStrategy::Blocking);
    let recorder = Recorder::new();

    for i in 0..10 {
        let recorder = recorder.clone();
        branch.submit(move || recorder.push(i));
    }

    assert!(branch.wait_tasks(Duration::from_millis(1000)));

    let seen: BTreeSet<i32> = recorder.snapshot().into_iter().collect();
    assert_eq!(seen, (0..10).collect::<BTreeSet<i32>>());
    Ok(())
}

#[test]
fn single_worker_executes_in_submission_order() {
    let branch = Branch::new(1, WaitStrategy::LowLatency);
    let gate = Gate::new();
    let recorder = Recorder::new();

    // Hold the only worker so the queue builds up in submission order.
    branch.submit(gate.block_task());
    for i in 0..10 {
        let recorder = recorder.clone();
        branch.submit(move || recorder.push(i));
    }

    gate.open();
    assert!(branch.wait_tasks(LONG));
    assert_eq!(recorder.snapshot(), (0..10).collect::<Vec<i32>>());
}

#[test]
fn urgent_jumps_ahead_of_queued_normal() {
    let branch = Branch::new(1, WaitStrategy::LowLatency);
    let gate = Gate::new();
    let recorder = Recorder::new();

    branch.submit(gate.block_task());
    {
        let recorder = recorder.clone();
        branch.submit(move || recorder.push("normal"));
    }
    {
        let recorder = recorder.clone();
        branch.submit_urgent(move || recorder.push("urgent"));
    }

    gate.open();
    assert!(branch.wait_tasks(LONG));
    assert_eq!(recorder.snapshot(), vec!["urgent", "normal"]);
}

#[test]
fn urgent_does_not_preempt_a_running_task() {
    // S2, second timing: the normal task is already executing when the
    // urgent one arrives, so the urgent task finishes second.
    let branch = Branch::new(1, WaitStrategy::LowLatency);
    let started = Gate::new();
    let release = Gate::new();
    let recorder = Recorder::new();

    {
        let started = started.clone();
        let release = release.clone();
        let recorder = recorder.clone();
        branch.submit(move || {
            started.open();
            release.wait();
            recorder.push("normal");
        });
    }

    started.wait();
    {
        let recorder = recorder.clone();
        branch.submit_urgent(move || recorder.push("urgent"));
    }

    release.open();
    assert!(branch.wait_tasks(LONG));
    assert_eq!(recorder.snapshot(), vec!["normal", "urgent"]);
}

#[test]
fn sequence_members_run_in_order_without_interleaving() {
    let branch = Branch::new(1, WaitStrategy::Balance);
    let recorder = Recorder::new();

    let member = |label: &'static str| {
        let recorder = recorder.clone();
        Task::new(move || recorder.push(label))
    };
    branch.submit_sequence(vec![member("a"), member("b"), member("c")]);
    for _ in 0..20 {
        let recorder = recorder.clone();
        branch.submit(move || recorder.push("x"));
    }

    assert!(branch.wait_tasks(LONG));

    let log: String = recorder.snapshot().concat();
    assert!(log.contains("abc"), "sequence interleaved: {log}");
    assert_eq!(log.matches('x').count(), 20);
}

#[test]
fn sequence_stops_at_the_first_panicking_member() {
    let branch = Branch::new(1, WaitStrategy::LowLatency);
    let recorder = Recorder::new();

    let member = |label: &'static str| {
        let recorder = recorder.clone();
        Task::new(move || recorder.push(label))
    };
    branch.submit_sequence(vec![
        member("first"),
        Task::new(|| panic!("mid-sequence failure")),
        member("never"),
    ]);

    assert!(branch.wait_tasks(LONG));
    assert_eq!(recorder.snapshot(), vec!["first"]);
}

#[rstest]
#[case::lowlatency(WaitStrategy::LowLatency)]
#[case::balance(WaitStrategy::Balance)]
#[case::blocking(WaitStrategy::Blocking)]
fn deferred_submission_yields_its_value(#[case] strategy: WaitStrategy) {
    let branch = Branch::new(2, strategy);
    let deferred = branch.submit_deferred(|| 6 * 7);
    assert_eq!(deferred.take(), Ok(42));
}

#[test]
fn deferred_submission_captures_a_panic() {
    let branch = Branch::new(1, WaitStrategy::LowLatency);
    let deferred = branch.submit_deferred(|| -> u32 { panic!("exploded") });
    match deferred.take() {
        Err(TaskError::Panicked(msg)) => assert!(msg.contains("exploded")),
        other => panic!("expected a captured panic, got {other:?}"),
    }
}

#[test]
fn urgent_deferred_jumps_the_queue() {
    let branch = Branch::new(1, WaitStrategy::LowLatency);
    let gate = Gate::new();
    let recorder = Recorder::new();

    branch.submit(gate.block_task());
    {
        let recorder = recorder.clone();
        branch.submit(move || recorder.push("normal"));
    }
    let deferred = {
        let recorder = recorder.clone();
        branch.submit_urgent_deferred(move || {
            recorder.push("urgent");
            1u32
        })
    };

    gate.open();
    assert_eq!(deferred.take(), Ok(1));
    assert!(branch.wait_tasks(LONG));
    assert_eq!(recorder.snapshot(), vec!["urgent", "normal"]);
}

#[rstest]
#[case::lowlatency(WaitStrategy::LowLatency)]
#[case::balance(WaitStrategy::Balance)]
#[case::blocking(WaitStrategy::Blocking)]
fn workers_shrink_cooperatively(#[case] strategy: WaitStrategy) -> Result<()> {
    let branch = Branch::new(4, strategy);
    assert_eq!(branch.num_workers(), 4);

    branch.del_worker()?;
    branch.del_worker()?;

    assert!(
        poll_until(LONG, || branch.num_workers() == 2),
        "workers did not exit: {} left",
        branch.num_workers()
    );
    assert!(branch.wait_tasks(LONG));
    assert_eq!(branch.num_workers(), 2);
    Ok(())
}

#[test]
fn del_worker_on_an_empty_branch_fails() -> Result<()> {
    let branch = Branch::new(1, WaitStrategy::LowLatency);
    branch.del_worker()?;
    assert!(poll_until(LONG, || branch.num_workers() == 0));
    assert_eq!(branch.del_worker(), Err(Error::NoWorkers));
    Ok(())
}

#[test]
fn add_worker_grows_the_pool() {
    let branch = Branch::new(1, WaitStrategy::Blocking);
    branch.add_worker();
    branch.add_worker();
    assert_eq!(branch.num_workers(), 3);
}

#[test]
fn zero_timeout_wait_returns_false_promptly_while_busy() {
    let branch = Branch::new(1, WaitStrategy::Blocking);
    let gate = Gate::new();
    branch.submit(gate.block_task());

    // Give the worker a moment to pop the blocking task.
    assert!(poll_until(LONG, || branch.num_tasks() == 0));

    let start = Instant::now();
    assert!(!branch.wait_tasks(Duration::ZERO));
    assert!(start.elapsed() < Duration::from_millis(500));

    // Phase 2 completed; the protocol is reusable afterwards.
    gate.open();
    assert!(branch.wait_tasks(LONG));
}

#[test]
fn del_worker_during_an_active_wait_is_absorbed() -> Result<()> {
    let branch = Arc::new(Branch::new(2, WaitStrategy::LowLatency));
    let gate = Gate::new();
    branch.submit(gate.block_task());

    let waiter = {
        let branch = Arc::clone(&branch);
        thread::spawn(move || branch.wait_tasks(Branch::WAIT_FOREVER))
    };

    // One worker is busy on the gate, the other parks; the drain cannot
    // finish until the busy worker leaves.
    assert!(poll_until(LONG, || branch.num_tasks() == 0));
    branch.del_worker()?;
    gate.open();

    assert!(waiter.join().unwrap());
    assert_eq!(branch.num_workers(), 1);
    Ok(())
}

#[test]
fn repeated_waits_are_serialized_not_nested() {
    let branch = Arc::new(Branch::new(2, WaitStrategy::Blocking));
    let mut waiters = Vec::new();
    for _ in 0..3 {
        let branch = Arc::clone(&branch);
        waiters.push(thread::spawn(move || branch.wait_tasks(LONG)));
    }
    for waiter in waiters {
        assert!(waiter.join().unwrap());
    }
}

#[rstest]
#[case::lowlatency(WaitStrategy::LowLatency)]
#[case::blocking(WaitStrategy::Blocking)]
fn shutdown_discards_queued_tasks(#[case] strategy: WaitStrategy) {
    let gate = Gate::new();
    let recorder: Recorder<i32> = Recorder::new();

    let branch = Branch::new(2, strategy);
    branch.submit(gate.block_task());
    branch.submit(gate.block_task());

    // Wait until both workers hold a gate task, then queue work that
    // must never run.
    assert!(poll_until(LONG, || branch.num_tasks() == 0));
    for i in 0..5 {
        let recorder = recorder.clone();
        branch.submit(move || recorder.push(i));
    }
    let deferred = branch.submit_deferred(|| 99u32);

    let dropper = thread::spawn(move || drop(branch));
    // Let the drop initiate shutdown (exit requests are issued before it
    // blocks), then release the workers.
    thread::sleep(Duration::from_millis(100));
    gate.open();
    dropper.join().unwrap();

    assert_eq!(recorder.len(), 0);
    assert_eq!(deferred.take(), Err(TaskError::Discarded));
}

#[test]
fn quiescence_observes_an_empty_queue() {
    let branch = Branch::new(3, WaitStrategy::Balance);
    for i in 0..50 {
        branch.submit(move || {
            std::hint::black_box(i);
        });
    }
    assert!(branch.wait_tasks(LONG));
    assert_eq!(branch.num_tasks(), 0);
}
