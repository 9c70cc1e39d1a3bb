// Copyright (c) 2026 the eventbox authors. Licensed under Apache License, Version 2.0.

//! Recognized construction options for an [`EventBox`](crate::EventBox) (§6).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Spawns the threads a box's background activities run on.
///
/// The default (`EventBoxOptions::spawner` unset) calls
/// `std::thread::Builder::spawn` directly, one OS thread per activity. A
/// custom spawner lets callers route activities through a shared pool
/// instead.
pub trait ActivitySpawner: Send + Sync {
    /// Runs `job` to completion on some thread. `name` is a hint for
    /// diagnostics (e.g. the OS thread name), not a uniqueness guarantee.
    fn spawn(&self, name: &str, job: Box<dyn FnOnce() + Send + 'static>);
}

/// Construction-time options for an [`EventBox`](crate::EventBox).
#[derive(Clone, Default)]
pub struct EventBoxOptions {
    guard_time: Option<Duration>,
    spawner: Option<Arc<dyn ActivitySpawner>>,
}

impl fmt::Debug for EventBoxOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBoxOptions")
            .field("guard_time", &self.guard_time)
            .field("spawner", &self.spawner.is_some())
            .finish()
    }
}

impl EventBoxOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// If a dispatched job holds the loop thread longer than `guard_time`,
    /// the loop thread emits a `tracing::warn!` once the job finishes.
    #[must_use]
    pub fn with_guard_time(mut self, guard_time: Duration) -> Self {
        self.guard_time = Some(guard_time);
        self
    }

    /// Routes background activities through `spawner` instead of spawning a
    /// raw OS thread per activity.
    #[must_use]
    pub fn with_spawner(mut self, spawner: Arc<dyn ActivitySpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub(crate) fn guard_time(&self) -> Option<Duration> {
        self.guard_time
    }

    pub(crate) fn spawner(&self) -> Option<Arc<dyn ActivitySpawner>> {
        self.spawner.clone()
    }
}
