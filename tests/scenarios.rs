// Copyright (c) 2026 the eventbox authors. Licensed under Apache License, Version 2.0.

//! End-to-end scenarios exercising async/sync/deferred dispatch, the timer
//! service, and shutdown's effect on background threads.

use std::sync::Arc;
use std::time::Duration;

use eventbox::{EventBox, ManualClock, TimerService};
use pretty_assertions::assert_eq;

fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn s1_async_store_then_sync_read() {
    let box_: EventBox<i32> = EventBox::new(0);
    box_.async_call("set", |x| *x = 10).unwrap();
    let value = box_.sync_call("read", |x| *x).unwrap();
    assert_eq!(value, 10);
    box_.shutdown();
}

#[test]
fn s2_deferred_reply_from_a_background_activity() {
    let box_: EventBox<()> = EventBox::new(());
    let box_for_activity = box_.clone();
    let result = box_
        .yield_call("run", move |_state, reply| {
            box_for_activity.start_activity("s2-responder", move |ctx| {
                let _ = ctx.sleep(Duration::from_millis(10));
                reply.invoke(42).unwrap();
            });
        })
        .unwrap();
    assert_eq!(result, 42);
    box_.shutdown();
}

/// Spawns a plain thread that advances `clock` by one second, `ticks` times,
/// sleeping briefly between each tick so the timer worker has a chance to
/// observe each step and fire whatever became due.
fn drive_clock(clock: Arc<ManualClock>, ticks: u32) {
    std::thread::spawn(move || {
        for _ in 0..ticks {
            std::thread::sleep(Duration::from_millis(15));
            clock.advance(Duration::from_secs(1));
        }
    });
}

#[test]
fn s3_timer_sequence_with_a_chained_after() {
    let box_: EventBox<Vec<i32>> = EventBox::new(Vec::new());
    let clock = Arc::new(ManualClock::new());
    let timers = Arc::new(TimerService::with_clock(&box_, clock.clone()));

    timers.timer_after(Duration::from_secs(6), |log: &mut Vec<i32>| log.push(6));
    {
        let chained = Arc::clone(&timers);
        timers.timer_after(Duration::from_secs(2), move |log: &mut Vec<i32>| {
            log.push(2);
            chained.timer_after(Duration::from_secs(1), |log: &mut Vec<i32>| log.push(1));
        });
    }
    timers.timer_after(Duration::from_secs(4), |log: &mut Vec<i32>| log.push(4));

    drive_clock(clock, 8);

    let filled = wait_until(
        || box_.sync_call("len", |log: &mut Vec<i32>| log.len()).unwrap() >= 4,
        Duration::from_secs(3),
    );
    assert!(filled, "not all four alarms fired in time");

    let log = box_.sync_call("read", |log: &mut Vec<i32>| log.clone()).unwrap();
    assert_eq!(log, vec![2, 1, 4, 6]);
    box_.shutdown();
}

#[test]
fn s4_timer_every_interleaves_with_chained_after() {
    let box_: EventBox<Vec<i32>> = EventBox::new(Vec::new());
    let clock = Arc::new(ManualClock::new());
    let timers = Arc::new(TimerService::with_clock(&box_, clock.clone()));

    timers.timer_after(Duration::from_secs(6), |log: &mut Vec<i32>| log.push(6));
    {
        let chained = Arc::clone(&timers);
        timers.timer_every(Duration::from_secs(2), move |log: &mut Vec<i32>| {
            log.push(2);
            chained.timer_after(Duration::from_secs(1), |log: &mut Vec<i32>| log.push(1));
        });
    }
    timers.timer_after(Duration::from_secs(4), |log: &mut Vec<i32>| log.push(4));

    drive_clock(clock, 8);

    let filled = wait_until(
        || box_.sync_call("len", |log: &mut Vec<i32>| log.len()).unwrap() >= 8,
        Duration::from_secs(3),
    );
    assert!(filled, "expected sequence did not fully fire in time");

    let log = box_.sync_call("read", |log: &mut Vec<i32>| log.clone()).unwrap();
    assert_eq!(log, vec![2, 1, 4, 2, 1, 6, 2, 1]);
    box_.shutdown();
}

#[test]
fn s5_cancel_before_due_never_fires() {
    let box_: EventBox<Vec<i32>> = EventBox::new(Vec::new());
    let clock = Arc::new(ManualClock::new());
    let timers = TimerService::with_clock(&box_, clock.clone());

    let alarm = timers.timer_after(Duration::from_secs(2), |log: &mut Vec<i32>| log.push(2));
    assert!(timers.timer_cancel(alarm));
    timers.timer_after(Duration::from_secs(8), |_log: &mut Vec<i32>| {});

    drive_clock(clock, 9);
    std::thread::sleep(Duration::from_millis(200));

    let log = box_.sync_call("read", |log: &mut Vec<i32>| log.clone()).unwrap();
    assert_eq!(log, Vec::<i32>::new());
    box_.shutdown();
}

#[cfg(target_os = "linux")]
fn thread_count() -> usize {
    std::fs::read_dir("/proc/self/task")
        .map(|entries| entries.count())
        .unwrap_or(0)
}

#[test]
#[cfg(target_os = "linux")]
fn s6_shutdown_removes_the_activity_thread() {
    let before = thread_count();

    let box_: EventBox<()> = EventBox::new(());
    let box_for_activity = box_.clone();
    box_.async_call("spawn-forever-sleeper", move |_state| {
        box_for_activity.start_activity("forever-sleeper", |ctx| loop {
            if ctx.sleep(Duration::from_secs(3600)).is_err() {
                return;
            }
        });
    })
    .unwrap();

    // Let the loop thread and the activity thread both come up.
    wait_until(|| thread_count() >= before + 2, Duration::from_secs(1));
    let during = thread_count();
    assert!(during > before, "expected new threads for the loop and the activity");

    box_.shutdown();
    std::thread::sleep(Duration::from_millis(50));

    let settled = wait_until(|| thread_count() <= before, Duration::from_secs(1));
    assert!(settled, "threads were not cleaned up after shutdown");
}
