// Copyright (c) 2026 the eventbox authors. Licensed under Apache License, Version 2.0.

//! The timer service (§4.F): an optional layer on top of an [`EventBox`] and
//! its [`ActivityManager`](crate::activity::ActivityManager) providing
//! one-shot and periodic alarms that fire into the box's internal context.
//!
//! Alarms live in a min-heap ordered by deadline, paired with a tombstone
//! map so cancellation doesn't require a linear scan (`std::collections::
//! BinaryHeap` has no support for removing an arbitrary element). A single
//! background activity, `timer_worker`, sleeps until the soonest deadline and
//! then fires due alarms via an ordinary `sync_call` — the same internal
//! re-entry every other dispatched call uses. The sleep is always woken
//! early through the reload channel whenever the soonest deadline changes,
//! whether because a new alarm was scheduled/cancelled or because the
//! underlying [`Clock`] itself jumped out of band (see [`ManualClock`]) —
//! otherwise a real-time sleep computed against a clock that can skip ahead
//! independently of wall time could sit stale long after its deadline had
//! already passed.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::activity::ActivityContext;
use crate::event_loop::{panic_message, EventBox};

/// A monotonic source of `Instant`s. Production code uses [`SystemClock`];
/// tests use [`ManualClock`] so timer ordering assertions don't depend on
/// real sleeps.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;

    /// Registers `waker` to be signalled whenever this clock's value moves
    /// out of band — i.e. by something other than real time elapsing.
    /// `SystemClock` never needs this (its default no-op is correct:
    /// `now()` only ever advances by wall time, which a real-time sleep
    /// already accounts for). `ManualClock` overrides it so a test driving
    /// the clock by hand wakes the timer worker the same way scheduling a
    /// new alarm does.
    fn register_waker(&self, waker: Sender<()>) {
        let _ = waker;
    }
}

/// The default clock: wraps `Instant::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock a test can advance by hand. `now()` returns a fixed base instant
/// plus however much the test has asked it to advance — real-time sleeps
/// never enter into it. `advance` signals every registered waker so a
/// `timer_worker` sleeping against this clock notices the jump immediately
/// rather than on its next naturally scheduled wakeup.
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
    wakers: Mutex<Vec<Sender<()>>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
            wakers: Mutex::new(Vec::new()),
        }
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        {
            let mut offset = self.offset.lock().unwrap();
            *offset += by;
        }
        self.wakers.lock().unwrap().retain(|waker| waker.send(()).is_ok());
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap()
    }

    fn register_waker(&self, waker: Sender<()>) {
        self.wakers.lock().unwrap().push(waker);
    }
}

/// Identifies one alarm for the lifetime of the [`TimerService`] that
/// created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlarmId(u64);

/// A handle to a scheduled alarm, returned by `timer_after`/`timer_every`
/// and consumed by `timer_cancel`.
#[derive(Debug, Clone, Copy)]
pub struct Alarm {
    id: AlarmId,
}

impl Alarm {
    pub fn id(&self) -> AlarmId {
        self.id
    }
}

struct AlarmEntry<S> {
    period: Option<Duration>,
    callback: Box<dyn FnMut(&mut S) + Send>,
}

/// The soonest-first heap plus its tombstone map.
struct TimerHeap<S> {
    heap: BinaryHeap<Reverse<(Instant, AlarmId)>>,
    entries: HashMap<AlarmId, AlarmEntry<S>>,
}

impl<S> TimerHeap<S> {
    fn new() -> Self {
        Self { heap: BinaryHeap::new(), entries: HashMap::new() }
    }

    /// The soonest *live* deadline, discarding any tombstoned entries found
    /// at the top along the way.
    fn soonest(&mut self) -> Option<Instant> {
        loop {
            match self.heap.peek() {
                Some(Reverse((at, id))) => {
                    if self.entries.contains_key(id) {
                        return Some(*at);
                    }
                    self.heap.pop();
                }
                None => return None,
            }
        }
    }

    fn insert(&mut self, id: AlarmId, at: Instant, period: Option<Duration>, callback: Box<dyn FnMut(&mut S) + Send>) {
        self.heap.push(Reverse((at, id)));
        self.entries.insert(id, AlarmEntry { period, callback });
    }

    fn cancel(&mut self, id: AlarmId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Removes and returns every alarm due at or before `now`, in firing
    /// order (soonest deadline first, ties broken by `AlarmId` — which, since
    /// ids are handed out in insertion order, preserves insertion order for
    /// alarms scheduled at the same instant).
    fn drain_due(&mut self, now: Instant) -> Vec<(AlarmId, Box<dyn FnMut(&mut S) + Send>, Option<Duration>)> {
        let mut due = Vec::new();
        while let Some(Reverse((at, id))) = self.heap.peek().copied() {
            if at > now {
                break;
            }
            self.heap.pop();
            if let Some(entry) = self.entries.remove(&id) {
                due.push((id, entry.callback, entry.period));
            }
        }
        due
    }
}

/// The state shared by every clone of a [`TimerService`] — mirrors how
/// [`EventBox`] itself is a cheap handle around an `Arc<Dispatcher<S>>`.
struct TimerShared<S: Send + 'static> {
    box_: EventBox<S>,
    heap: Mutex<TimerHeap<S>>,
    // `mpsc::Sender` is `Send` but not `Sync` — calls to `timer_after`/
    // `timer_cancel` only take `&self`, so sending needs a lock.
    reload_tx: Mutex<Sender<()>>,
    reload_rx: Mutex<Option<Receiver<()>>>,
    clock: Arc<dyn Clock>,
    started: AtomicBool,
    next_id: AtomicU64,
}

/// Built on top of an [`EventBox<S>`], providing `timer_after`/`timer_every`/
/// `timer_cancel`. The heap lives outside `S`, guarded by its own mutex, so
/// scheduling and cancelling alarms never requires a dispatch round trip;
/// only firing due alarms (which needs `&mut S`) goes through `sync_call`.
/// Cheap to clone — every clone shares the same heap and worker.
pub struct TimerService<S: Send + 'static> {
    shared: Arc<TimerShared<S>>,
}

impl<S: Send + 'static> Clone for TimerService<S> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<S: Send + 'static> TimerService<S> {
    /// Builds a timer service over `box_` using the real wall clock.
    pub fn new(box_: &EventBox<S>) -> Self {
        Self::with_clock(box_, Arc::new(SystemClock))
    }

    /// Builds a timer service using an explicit [`Clock`] — for tests, an
    /// [`ManualClock`].
    pub fn with_clock(box_: &EventBox<S>, clock: Arc<dyn Clock>) -> Self {
        let (reload_tx, reload_rx) = mpsc::channel();
        clock.register_waker(reload_tx.clone());
        Self {
            shared: Arc::new(TimerShared {
                box_: box_.clone(),
                heap: Mutex::new(TimerHeap::new()),
                reload_tx: Mutex::new(reload_tx),
                reload_rx: Mutex::new(Some(reload_rx)),
                clock,
                started: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn next_id(&self) -> AlarmId {
        AlarmId(self.shared.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Starts the single `timer_worker` background activity, the first time
    /// any alarm is scheduled.
    fn ensure_worker_started(&self) {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let reload_rx = self
            .shared
            .reload_rx
            .lock()
            .unwrap()
            .take()
            .expect("timer_worker already took the reload receiver");
        let shared = Arc::clone(&self.shared);
        self.shared.box_.start_activity("timer_worker", move |ctx| {
            timer_worker_loop(ctx, shared, reload_rx);
        });
    }

    /// Schedules `callback` to run once, `delay` from now.
    pub fn timer_after(&self, delay: Duration, callback: impl FnMut(&mut S) + Send + 'static) -> Alarm {
        self.schedule(delay, None, callback)
    }

    /// Schedules `callback` to run every `interval`, starting `interval` from
    /// now.
    pub fn timer_every(&self, interval: Duration, callback: impl FnMut(&mut S) + Send + 'static) -> Alarm {
        self.schedule(interval, Some(interval), callback)
    }

    fn schedule(
        &self,
        delay: Duration,
        period: Option<Duration>,
        callback: impl FnMut(&mut S) + Send + 'static,
    ) -> Alarm {
        self.ensure_worker_started();
        let id = self.next_id();
        let at = self.shared.clock.now() + delay;
        let became_soonest = {
            let mut heap = self.shared.heap.lock().unwrap();
            let old_soonest = heap.soonest();
            heap.insert(id, at, period, Box::new(callback));
            match old_soonest {
                Some(old) => at < old,
                None => true,
            }
        };
        if became_soonest {
            let _ = self.shared.reload_tx.lock().unwrap().send(());
        }
        Alarm { id }
    }

    /// Cancels `alarm`. Returns `false` if it had already fired (one-shot)
    /// or was already cancelled.
    pub fn timer_cancel(&self, alarm: Alarm) -> bool {
        let mut heap = self.shared.heap.lock().unwrap();
        let old_soonest = heap.soonest();
        let removed = heap.cancel(alarm.id);
        if removed {
            let new_soonest = heap.soonest();
            if old_soonest != new_soonest {
                drop(heap);
                let _ = self.shared.reload_tx.lock().unwrap().send(());
            }
        }
        removed
    }
}

fn timer_worker_loop<S: Send + 'static>(ctx: ActivityContext, shared: Arc<TimerShared<S>>, reload_rx: Receiver<()>) {
    // No alarm scheduled: sleep "indefinitely" — woken early the moment one
    // is, via the reload channel.
    const NO_ALARM_SLEEP: Duration = Duration::from_secs(365 * 24 * 60 * 60);

    loop {
        let sleep_for = {
            let mut heap = shared.heap.lock().unwrap();
            match heap.soonest() {
                Some(at) => at.checked_duration_since(shared.clock.now()).unwrap_or(Duration::ZERO),
                None => NO_ALARM_SLEEP,
            }
        };
        match ctx.recv_timeout(&reload_rx, sleep_for) {
            Ok(Some(())) => continue,
            Ok(None) => {
                let shared_for_fire = Arc::clone(&shared);
                let fired = shared.box_.sync_call("timer_fire", move |state| {
                    fire_due_alarms(state, &shared_for_fire);
                });
                if fired.is_err() {
                    // Box shut down from under us; nothing left to serve.
                    return;
                }
            }
            Err(_abort) => return,
        }
    }
}

fn fire_due_alarms<S: Send + 'static>(state: &mut S, shared: &TimerShared<S>) {
    let now = shared.clock.now();
    let due = shared.heap.lock().unwrap().drain_due(now);
    for (id, mut callback, period) in due {
        // Each callback is already removed from the heap before it runs, so
        // a panic here must not stop the rest of this batch from firing —
        // otherwise one bad alarm would silently strand every alarm due in
        // the same tick, periodic ones included, since they'd never be
        // reinserted.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(state)));
        if let Err(payload) = result {
            tracing::error!(alarm_id = ?id, panic = %panic_message(&*payload), "alarm callback panicked, discarding");
        }
        if let Some(period) = period {
            shared.heap.lock().unwrap().insert(id, now + period, Some(period), callback);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventBox;
    use std::sync::Mutex as StdMutex;

    fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn timer_after_fires_once() {
        let box_: EventBox<Vec<i32>> = EventBox::new(Vec::new());
        let clock = Arc::new(ManualClock::new());
        let timers = TimerService::with_clock(&box_, clock.clone());

        timers.timer_after(Duration::from_millis(10), |log| log.push(1));
        clock.advance(Duration::from_secs(1));

        let fired = wait_until(
            || box_.sync_call("len", |log: &mut Vec<i32>| log.len()).unwrap() == 1,
            Duration::from_secs(2),
        );
        assert!(fired, "alarm never fired");
        let log = box_.sync_call("read", |log: &mut Vec<i32>| log.clone()).unwrap();
        assert_eq!(log, vec![1]);
        box_.shutdown();
    }

    #[test]
    fn timer_cancel_before_due_prevents_firing() {
        let box_: EventBox<Vec<i32>> = EventBox::new(Vec::new());
        let clock = Arc::new(ManualClock::new());
        let timers = TimerService::with_clock(&box_, clock.clone());

        let alarm = timers.timer_after(Duration::from_millis(10), |log| log.push(1));
        assert!(timers.timer_cancel(alarm));
        clock.advance(Duration::from_secs(5));
        std::thread::sleep(Duration::from_millis(50));

        let log = box_.sync_call("read", |log: &mut Vec<i32>| log.clone()).unwrap();
        assert!(log.is_empty());
        box_.shutdown();
    }

    #[test]
    fn alarms_fire_in_timestamp_order() {
        let box_: EventBox<Vec<i32>> = EventBox::new(Vec::new());
        let clock = Arc::new(ManualClock::new());
        let timers = TimerService::with_clock(&box_, clock.clone());

        timers.timer_after(Duration::from_secs(6), |log| log.push(6));
        timers.timer_after(Duration::from_secs(2), |log| log.push(2));
        timers.timer_after(Duration::from_secs(4), |log| log.push(4));

        clock.advance(Duration::from_secs(10));
        let got_all = wait_until(
            || box_.sync_call("len", |log: &mut Vec<i32>| log.len()).unwrap() == 3,
            Duration::from_secs(2),
        );
        assert!(got_all, "not all alarms fired");
        let log = box_.sync_call("read", |log: &mut Vec<i32>| log.clone()).unwrap();
        assert_eq!(log, vec![2, 4, 6]);
        box_.shutdown();
    }

    #[test]
    fn timer_every_reschedules_itself() {
        let box_: EventBox<Vec<i32>> = EventBox::new(Vec::new());
        let clock = Arc::new(ManualClock::new());
        let timers = TimerService::with_clock(&box_, clock.clone());
        let fire_count = Arc::new(StdMutex::new(0));
        let fire_count_clone = Arc::clone(&fire_count);

        timers.timer_every(Duration::from_millis(10), move |_log| {
            *fire_count_clone.lock().unwrap() += 1;
        });

        for _ in 0..3 {
            clock.advance(Duration::from_millis(10));
            wait_until(|| *fire_count.lock().unwrap() >= 1, Duration::from_secs(1));
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(*fire_count.lock().unwrap() >= 3, "periodic alarm did not reschedule");
        box_.shutdown();
    }
}
