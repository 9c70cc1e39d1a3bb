// Copyright (c) 2026 the eventbox authors. Licensed under Apache License, Version 2.0.

//! The background activity manager (§4.D): tracks every OS thread a box has
//! spawned for long-running, potentially blocking work, and can abort all of
//! them at once on shutdown without ever taking a lock on the teardown path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::error::EventBoxError;
use crate::options::ActivitySpawner;

struct ActivityEntry {
    name: &'static str,
    abort: Arc<AtomicBool>,
}

/// Tracks every activity an [`EventBox`](crate::EventBox) has started.
pub struct ActivityManager {
    live: Mutex<Vec<Arc<ActivityEntry>>>,
    snapshot: ArcSwap<Vec<Arc<ActivityEntry>>>,
    shutdown: Arc<AtomicBool>,
}

impl ActivityManager {
    pub(crate) fn new(shutdown: Arc<AtomicBool>) -> Self {
        Self {
            live: Mutex::new(Vec::new()),
            snapshot: ArcSwap::from_pointee(Vec::new()),
            shutdown,
        }
    }

    fn publish(&self, live: &[Arc<ActivityEntry>]) {
        self.snapshot.store(Arc::new(live.to_vec()));
    }

    fn remove(&self, entry: &Arc<ActivityEntry>) {
        let mut live = self.live.lock().unwrap();
        live.retain(|e| !Arc::ptr_eq(e, entry));
        self.publish(&live);
    }

    /// Starts a background activity named `name`. `job` runs on a fresh
    /// thread (or via `spawner`, if supplied) and is handed an
    /// [`ActivityContext`] to check for abort at its own suspension points.
    pub(crate) fn start(
        self: &Arc<Self>,
        name: &'static str,
        spawner: Option<Arc<dyn ActivitySpawner>>,
        job: impl FnOnce(ActivityContext) + Send + 'static,
    ) {
        let abort = Arc::new(AtomicBool::new(false));
        let entry = Arc::new(ActivityEntry { name, abort: Arc::clone(&abort) });
        let manager = Arc::clone(self);
        let entry_for_thread = Arc::clone(&entry);

        let run = move || {
            let ctx = ActivityContext { name, abort };
            job(ctx);
            manager.remove(&entry_for_thread);
        };

        {
            let mut live = self.live.lock().unwrap();
            live.push(Arc::clone(&entry));
            self.publish(&live);
        }

        // Re-check after publishing: shutdown may have read the snapshot
        // before this entry was in it and missed injecting abort.
        if self.shutdown.load(Ordering::SeqCst) {
            entry.abort.store(true, Ordering::SeqCst);
        }

        match spawner {
            Some(spawner) => spawner.spawn(name, Box::new(run)),
            None => {
                std::thread::Builder::new()
                    .name(format!("eventbox-activity-{name}"))
                    .spawn(run)
                    .expect("failed to spawn activity thread");
            }
        }
    }

    /// Sets the shutdown flag and injects abort into every currently live
    /// activity, read from the lock-free snapshot.
    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for entry in self.snapshot.load().iter() {
            entry.abort.store(true, Ordering::SeqCst);
        }
    }

    #[cfg(test)]
    pub(crate) fn live_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

/// Handed to a background activity's closure. Exposes the only sanctioned
/// blocking points: [`sleep`](Self::sleep) and
/// [`recv_timeout`](Self::recv_timeout), both of which check the injected
/// abort flag before and after blocking.
pub struct ActivityContext {
    name: &'static str,
    abort: Arc<AtomicBool>,
}

impl ActivityContext {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), EventBoxError> {
        if self.is_aborted() {
            Err(EventBoxError::AbortActivity { activity_name: self.name })
        } else {
            Ok(())
        }
    }

    /// Sleeps for `duration`, or returns early with `AbortActivity` if the
    /// activity is aborted while sleeping. Slices the sleep into small steps
    /// so abort is noticed promptly instead of only after the full duration.
    pub fn sleep(&self, duration: Duration) -> Result<(), EventBoxError> {
        const SLICE: Duration = Duration::from_millis(20);
        self.check()?;
        let mut remaining = duration;
        while remaining > Duration::ZERO {
            let step = remaining.min(SLICE);
            std::thread::sleep(step);
            self.check()?;
            remaining -= step;
        }
        Ok(())
    }

    /// Blocks on `rx` for up to `timeout`. Returns `Ok(Some(value))` if a
    /// message arrived, `Ok(None)` if the deadline passed with nothing
    /// received, or `Err(AbortActivity)` if the activity was aborted before,
    /// during, or after the wait, or `rx`'s sender was dropped.
    pub fn recv_timeout<T>(&self, rx: &Receiver<T>, timeout: Duration) -> Result<Option<T>, EventBoxError> {
        self.check()?;
        match rx.recv_timeout(timeout) {
            Ok(value) => {
                self.check()?;
                Ok(Some(value))
            }
            Err(RecvTimeoutError::Timeout) => {
                self.check()?;
                Ok(None)
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(EventBoxError::AbortActivity { activity_name: self.name })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn start_and_complete_removes_from_live_set() {
        let manager = Arc::new(ActivityManager::new(Arc::new(AtomicBool::new(false))));
        let done = Arc::new(AtomicBool::new(false));
        let done_clone = Arc::clone(&done);
        manager.start("probe", None, move |_ctx| {
            done_clone.store(true, Ordering::SeqCst);
        });

        for _ in 0..200 {
            if done.load(Ordering::SeqCst) && manager.live_count() == 0 {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("activity never completed and cleaned itself up");
    }

    #[test]
    fn shutdown_aborts_sleeping_activity() {
        let manager = Arc::new(ActivityManager::new(Arc::new(AtomicBool::new(false))));
        let aborted = Arc::new(AtomicUsize::new(0));
        let aborted_clone = Arc::clone(&aborted);
        manager.start("sleeper", None, move |ctx| {
            if ctx.sleep(Duration::from_secs(60)).is_err() {
                aborted_clone.store(1, Ordering::SeqCst);
            }
        });
        std::thread::sleep(Duration::from_millis(20));
        manager.shutdown();

        for _ in 0..400 {
            if aborted.load(Ordering::SeqCst) == 1 {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("activity was not aborted by shutdown");
    }

    #[test]
    fn start_after_shutdown_aborts_immediately() {
        let manager = Arc::new(ActivityManager::new(Arc::new(AtomicBool::new(false))));
        manager.shutdown();
        let saw_abort = Arc::new(AtomicBool::new(false));
        let saw_abort_clone = Arc::clone(&saw_abort);
        manager.start("late", None, move |ctx| {
            saw_abort_clone.store(ctx.is_aborted(), Ordering::SeqCst);
        });

        for _ in 0..200 {
            if saw_abort.load(Ordering::SeqCst) {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("activity started after shutdown did not observe abort");
    }
}
