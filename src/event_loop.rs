// Copyright (c) 2026 the eventbox authors. Licensed under Apache License, Version 2.0.

//! The event loop engine (§4.C): one dedicated thread per [`EventBox`], a job
//! channel feeding it, and the three call disciplines (`async_call`,
//! `sync_call`, `yield_call`) dispatched against it.
//!
//! Every external call and every reentrant internal call funnels through
//! [`Dispatcher`]. Reentrant calls — detected via
//! [`frame::is_internal_to`] — run directly on the calling stack instead of
//! round-tripping through the job channel, which is required for
//! correctness: the loop thread sending itself a job and blocking on its own
//! reply would deadlock.

use std::any::Any;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::activity::{ActivityContext, ActivityManager};
use crate::callable::{AsyncProc, ExternalCallable, SyncProc, YieldProc, YieldReply};
use crate::error::EventBoxError;
use crate::frame::{self, CallKind, FrameMeta, LoopId};
use crate::options::EventBoxOptions;
use crate::reply::{reply_channel, ReplySender};
use crate::sanitize::{OpaqueHandle, WrappedInternal};

thread_local! {
    /// The address of the `&mut S` belonging to the job currently running on
    /// this thread, or 0 if none. Lets a reentrant internal call recover
    /// `&mut S` without it being threaded through as a parameter — callable
    /// wrappers only have `&self`.
    static ACTIVE_STATE_PTR: Cell<usize> = const { Cell::new(0) };
}

/// # Safety
/// `state` must outlive every reentrant call made while it's installed; this
/// holds because it's only installed for the duration of the one job
/// currently executing on this thread, and cleared before that job returns.
unsafe fn set_active_state_ptr<S>(state: &mut S) {
    ACTIVE_STATE_PTR.with(|cell| cell.set(state as *mut S as usize));
}

fn clear_active_state_ptr() {
    ACTIVE_STATE_PTR.with(|cell| cell.set(0));
}

/// # Safety
/// Caller must have already established that this thread is the loop thread
/// of the box whose state this is (via `frame::is_internal_to`), and that a
/// job is currently executing on it.
unsafe fn active_state_mut<S>() -> &'static mut S {
    let ptr = ACTIVE_STATE_PTR.with(Cell::get);
    debug_assert_ne!(ptr, 0, "no active state pointer on this thread");
    &mut *(ptr as *mut S)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

enum Job<S> {
    Run(Box<dyn FnOnce(&mut S) + Send>),
    Shutdown,
}

/// Owns the loop thread and the job channel feeding it. Shared behind an
/// `Arc` by every clone of the owning [`EventBox`] and every callable wrapper
/// it produced.
pub struct Dispatcher<S> {
    pub(crate) loop_id: LoopId,
    // `mpsc::Sender` is `Send` but not `Sync`; every dispatch call reaches
    // this through a shared `Arc<Dispatcher<S>>`, so sending needs a lock.
    job_tx: Mutex<Sender<Job<S>>>,
    shutdown: Arc<AtomicBool>,
    pub(crate) activities: Arc<ActivityManager>,
    pub(crate) options: EventBoxOptions,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Send + 'static> Dispatcher<S> {
    pub(crate) fn spawn(initial_state: S, options: EventBoxOptions) -> Arc<Self> {
        let loop_id = LoopId::next();
        let (job_tx, job_rx) = mpsc::channel::<Job<S>>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let activities = Arc::new(ActivityManager::new(Arc::clone(&shutdown)));
        let guard_time = options.guard_time();

        let activities_for_loop = Arc::clone(&activities);
        let join_handle = thread::Builder::new()
            .name(format!("eventbox-loop-{loop_id}"))
            .spawn(move || run_loop(loop_id, job_rx, initial_state, guard_time, activities_for_loop))
            .expect("failed to spawn eventbox loop thread");

        Arc::new(Self {
            loop_id,
            job_tx: Mutex::new(job_tx),
            shutdown,
            activities,
            options,
            join_handle: Mutex::new(Some(join_handle)),
        })
    }

    fn check_not_shutdown(&self, name: &'static str) -> Result<(), EventBoxError> {
        if self.shutdown.load(Ordering::SeqCst) {
            Err(EventBoxError::Shutdown { call_name: name })
        } else {
            Ok(())
        }
    }

    fn send_job(&self, job: Job<S>, name: &'static str) -> Result<(), EventBoxError> {
        self.job_tx
            .lock()
            .unwrap()
            .send(job)
            .map_err(|_| EventBoxError::Shutdown { call_name: name })
    }

    /// # Safety
    /// Caller must have verified `frame::is_internal_to(self.loop_id)`.
    pub(crate) unsafe fn state_mut_on_loop_thread(&self) -> &mut S {
        active_state_mut::<S>()
    }

    pub fn async_call(
        &self,
        name: &'static str,
        handler: impl FnOnce(&mut S) + Send + 'static,
    ) -> Result<(), EventBoxError> {
        self.dispatch_async(CallKind::Async, name, handler)
    }

    /// `kind` distinguishes a plain named `async_call` from an `AsyncProc`
    /// invocation dispatched on its behalf (see `callable.rs`); both funnel
    /// through here so the distinction only needs to be made once.
    pub(crate) fn dispatch_async(
        &self,
        kind: CallKind,
        name: &'static str,
        handler: impl FnOnce(&mut S) + Send + 'static,
    ) -> Result<(), EventBoxError> {
        if frame::is_internal_to(self.loop_id) {
            let state = unsafe { self.state_mut_on_loop_thread() };
            handler(state);
            return Ok(());
        }
        self.check_not_shutdown(name)?;
        let loop_id = self.loop_id;
        let body: Box<dyn FnOnce(&mut S) + Send> = Box::new(move |state| {
            let meta = FrameMeta { loop_id, kind, name, reply: None };
            frame::with_frame(meta, || {
                tracing::trace!(loop_id = %loop_id, kind = ?kind, name, "dispatching frame");
                if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(state))) {
                    tracing::error!(name, panic = %panic_message(&*payload), "async call handler panicked, discarding");
                }
            });
        });
        self.send_job(Job::Run(body), name)
    }

    pub fn sync_call<R: Send + 'static>(
        &self,
        name: &'static str,
        handler: impl FnOnce(&mut S) -> R + Send + 'static,
    ) -> Result<R, EventBoxError> {
        self.dispatch_sync(CallKind::SyncReply, name, handler)
    }

    /// `kind` distinguishes a plain named `sync_call` from a `SyncProc`
    /// invocation dispatched on its behalf (see `callable.rs`).
    pub(crate) fn dispatch_sync<R: Send + 'static>(
        &self,
        kind: CallKind,
        name: &'static str,
        handler: impl FnOnce(&mut S) -> R + Send + 'static,
    ) -> Result<R, EventBoxError> {
        if frame::is_internal_to(self.loop_id) {
            let state = unsafe { self.state_mut_on_loop_thread() };
            return Ok(handler(state));
        }
        self.check_not_shutdown(name)?;
        let loop_id = self.loop_id;
        let (reply_tx, reply_rx) = reply_channel::<R>();
        let route = reply_tx.route();
        let reply_for_job = reply_tx;
        let body: Box<dyn FnOnce(&mut S) + Send> = Box::new(move |state| {
            let meta = FrameMeta { loop_id, kind, name, reply: Some(route) };
            frame::with_frame(meta, || {
                tracing::trace!(loop_id = %loop_id, kind = ?kind, name, "dispatching frame");
                match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(state))) {
                    Ok(value) => reply_for_job.send_value(value),
                    Err(payload) => reply_for_job.send_panic(payload),
                }
            });
        });
        self.send_job(Job::Run(body), name)?;
        reply_rx.recv_loop()
    }

    pub fn yield_call<R: Send + 'static>(
        &self,
        name: &'static str,
        handler: impl FnOnce(&mut S, YieldReply<R>) + Send + 'static,
    ) -> Result<R, EventBoxError> {
        self.dispatch_yield(CallKind::YieldReply, name, handler)
    }

    /// `kind` distinguishes a plain named `yield_call` from a `YieldProc`
    /// invocation dispatched on its behalf (see `callable.rs`).
    pub(crate) fn dispatch_yield<R: Send + 'static>(
        &self,
        kind: CallKind,
        name: &'static str,
        handler: impl FnOnce(&mut S, YieldReply<R>) + Send + 'static,
    ) -> Result<R, EventBoxError> {
        if frame::is_internal_to(self.loop_id) {
            return Err(EventBoxError::InvalidAccess {
                reason: "yield_call cannot be invoked from internal context — there is no \
                         external caller left to eventually hand the result to",
            });
        }
        self.check_not_shutdown(name)?;
        let loop_id = self.loop_id;
        let (reply_tx, reply_rx) = reply_channel::<R>();
        let route = reply_tx.route();
        let body: Box<dyn FnOnce(&mut S) + Send> = Box::new(move |state| {
            let meta = FrameMeta { loop_id, kind, name, reply: Some(route) };
            frame::with_frame(meta, || {
                tracing::trace!(loop_id = %loop_id, kind = ?kind, name, "dispatching frame");
                let reply_tx_for_handler = reply_tx.clone();
                let reply = YieldReply::new(name, move |value: R| {
                    reply_tx_for_handler.send_value(value);
                    Ok(())
                });
                if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(state, reply))) {
                    reply_tx.send_panic(payload);
                }
            });
        });
        self.send_job(Job::Run(body), name)?;
        reply_rx.recv_loop()
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Abort every live activity immediately rather than waiting for the
        // sentinel below to work through whatever's already queued ahead of
        // it — start_activity bypasses the job queue entirely, so closing
        // that race promptly matters.
        self.activities.shutdown();
        let _ = self.job_tx.lock().unwrap().send(Job::Shutdown);
        if !frame::is_internal_to(self.loop_id) {
            if let Some(handle) = self.join_handle.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

fn run_loop<S>(
    loop_id: LoopId,
    job_rx: Receiver<Job<S>>,
    mut state: S,
    guard_time: Option<Duration>,
    activities: Arc<ActivityManager>,
) {
    while let Ok(job) = job_rx.recv() {
        match job {
            Job::Shutdown => break,
            Job::Run(body) => {
                let start = Instant::now();
                unsafe { set_active_state_ptr(&mut state) };
                body(&mut state);
                clear_active_state_ptr();
                if let Some(guard_time) = guard_time {
                    let elapsed = start.elapsed();
                    if elapsed > guard_time {
                        tracing::warn!(
                            loop_id = %loop_id,
                            elapsed_ms = elapsed.as_millis(),
                            guard_time_ms = guard_time.as_millis(),
                            "job held the loop thread longer than the configured guard time"
                        );
                    }
                }
            }
        }
    }
    activities.shutdown();
    tracing::debug!(loop_id = %loop_id, "loop thread exiting");
}

/// A serialized, actor-style handle around private state `S`. Every call
/// into an `EventBox` — whether a plain dispatch (`async_call`/`sync_call`/
/// `yield_call`) or invocation of a wrapper it produced (`async_proc`/
/// `sync_proc`/`yield_proc`) — runs on the box's single dedicated loop
/// thread, one at a time.
pub struct EventBox<S: Send + 'static> {
    dispatcher: Arc<Dispatcher<S>>,
}

impl<S: Send + 'static> Clone for EventBox<S> {
    fn clone(&self) -> Self {
        Self { dispatcher: Arc::clone(&self.dispatcher) }
    }
}

impl<S: Send + 'static> EventBox<S> {
    /// Builds a box around `initial_state`, spawning its loop thread
    /// immediately with default options.
    pub fn new(initial_state: S) -> Self {
        Self::with_options(initial_state, EventBoxOptions::default())
    }

    /// Builds a box with explicit [`EventBoxOptions`].
    pub fn with_options(initial_state: S, options: EventBoxOptions) -> Self {
        Self { dispatcher: Dispatcher::spawn(initial_state, options) }
    }

    /// Fire-and-forget dispatch: `handler` runs on the loop thread at some
    /// point after this returns (or, called reentrantly, immediately).
    pub fn async_call(
        &self,
        name: &'static str,
        handler: impl FnOnce(&mut S) + Send + 'static,
    ) -> Result<(), EventBoxError> {
        self.dispatcher.async_call(name, handler)
    }

    /// Request/reply dispatch: blocks until `handler` has run on the loop
    /// thread and produced a value.
    pub fn sync_call<R: Send + 'static>(
        &self,
        name: &'static str,
        handler: impl FnOnce(&mut S) -> R + Send + 'static,
    ) -> Result<R, EventBoxError> {
        self.dispatcher.sync_call(name, handler)
    }

    /// Deferred-reply dispatch: blocks until whoever `handler` hands its
    /// [`YieldReply`] to eventually invokes it, possibly from an unrelated
    /// thread much later.
    pub fn yield_call<R: Send + 'static>(
        &self,
        name: &'static str,
        handler: impl FnOnce(&mut S, YieldReply<R>) + Send + 'static,
    ) -> Result<R, EventBoxError> {
        self.dispatcher.yield_call(name, handler)
    }

    /// Wraps an internal fire-and-forget operation as an
    /// [`AsyncProc`] other code can hold and invoke.
    pub fn async_proc(
        &self,
        name: &'static str,
        handler: impl Fn(&mut S) + Send + Sync + 'static,
    ) -> AsyncProc<S> {
        AsyncProc::new(Arc::clone(&self.dispatcher), name, handler)
    }

    /// Wraps an internal request/reply operation as a [`SyncProc`].
    pub fn sync_proc<R: Send + 'static>(
        &self,
        name: &'static str,
        handler: impl Fn(&mut S) -> R + Send + Sync + 'static,
    ) -> SyncProc<S, R> {
        SyncProc::new(Arc::clone(&self.dispatcher), name, handler)
    }

    /// Wraps an internal deferred-reply operation as a [`YieldProc`].
    pub fn yield_proc<R: Send + 'static>(
        &self,
        name: &'static str,
        handler: impl Fn(&mut S, YieldReply<R>) + Send + Sync + 'static,
    ) -> YieldProc<S, R> {
        YieldProc::new(Arc::clone(&self.dispatcher), name, handler)
    }

    /// Wraps a raw external closure as an [`ExternalCallable`] bound to this
    /// box — it may only be invoked from inside a handler running on this
    /// box's own loop thread.
    pub fn wrap_external<A, R, F>(&self, callable: F) -> ExternalCallable<F, A, R>
    where
        A: Send + 'static,
        R: Send + 'static,
        F: FnMut(A) -> R + Send + 'static,
    {
        ExternalCallable::new(callable, self.dispatcher.loop_id)
    }

    /// Wraps `value`, produced inside a handler running on this box's loop
    /// thread, so it can be handed out to an external caller without handing
    /// out a live reference into this box's state. `name` identifies the
    /// wrapper for diagnostics if it's ever forced across the wrong boundary.
    /// Only this same box's loop can ever unwrap it back — see
    /// [`unwrap_internal`](Self::unwrap_internal).
    pub fn wrap_internal<T>(&self, name: &'static str, value: T) -> WrappedInternal<T> {
        WrappedInternal::new(value, self.dispatcher.loop_id, name)
    }

    /// Unwraps `wrapped` back to its raw value if this box's loop produced
    /// it. A value produced by a different box's loop is handed back
    /// unchanged alongside `InvalidBoundary` — its semantics are only
    /// meaningful bound to its producing loop, so forcing it here would
    /// silently do the wrong thing instead.
    pub fn unwrap_internal<T>(&self, wrapped: WrappedInternal<T>) -> Result<T, (WrappedInternal<T>, EventBoxError)> {
        wrapped.try_unwrap(self.dispatcher.loop_id)
    }

    /// Wraps `value` as an [`OpaqueHandle`] safe to hand to external callers:
    /// it carries no way to read or mutate the wrapped value directly, only
    /// to clone and pass the handle itself back around.
    pub fn wrap_opaque<T>(&self, value: T) -> OpaqueHandle<T> {
        OpaqueHandle::new(value, self.dispatcher.loop_id)
    }

    /// Starts a background activity. Its closure is handed an
    /// [`ActivityContext`] exposing the only sanctioned suspension points.
    pub fn start_activity(&self, name: &'static str, job: impl FnOnce(ActivityContext) + Send + 'static) {
        self.dispatcher
            .activities
            .start(name, self.dispatcher.options.spawner(), job);
    }

    /// Sets the shutdown flag, rejects every further inbound call, and aborts
    /// every live background activity. Blocks until the loop thread has
    /// exited, unless called reentrantly from inside a handler running on
    /// this very box (in which case the thread obviously can't join itself —
    /// it exits on its own once the current job finishes).
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.dispatcher.is_shutdown()
    }

    pub(crate) fn dispatcher(&self) -> Arc<Dispatcher<S>> {
        Arc::clone(&self.dispatcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;

    #[test]
    fn async_call_mutates_state_exactly_once() {
        let box_ = EventBox::new(0_i64);
        box_.async_call("increment", |state| *state += 1).unwrap();
        let value = box_.sync_call("read", |state| *state).unwrap();
        assert_eq!(value, 1);
        box_.shutdown();
    }

    #[test]
    fn sync_call_returns_handler_value() {
        let box_ = EventBox::new(String::from("hi"));
        let len = box_.sync_call("len", |state| state.len()).unwrap();
        assert_eq!(len, 2);
        box_.shutdown();
    }

    #[test]
    fn calls_after_shutdown_are_rejected() {
        let box_ = EventBox::new(0_i32);
        box_.shutdown();
        let err = box_.sync_call("read", |state| *state).unwrap_err();
        assert!(matches!(err, EventBoxError::Shutdown { .. }));
    }

    #[test]
    fn yield_proc_invoked_from_its_own_handler_is_invalid_access() {
        let box_: EventBox<i32> = EventBox::new(0);
        let yproc = box_.yield_proc::<i32>("deferred", |_state, reply| {
            reply.invoke(7).unwrap();
        });
        // The closure below itself runs as a sync_call handler — already on
        // the loop thread — so invoking `yproc` from inside it is exactly
        // the internal-context case that must be rejected.
        let result = box_.sync_call("reenter", move |_state| yproc.invoke()).unwrap();
        assert!(matches!(result, Err(EventBoxError::InvalidAccess { .. })));
        box_.shutdown();
    }

    #[test]
    fn handler_panic_is_resumed_on_caller() {
        let box_: EventBox<i32> = EventBox::new(0);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            box_.sync_call::<()>("boom", |_state| panic!("handler blew up"))
        }));
        assert!(result.is_err());
        box_.shutdown();
    }

    #[test]
    fn concurrent_async_calls_serialize() {
        let box_ = EventBox::new(AtomicI64::new(0));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let box_clone = box_.clone();
            handles.push(std::thread::spawn(move || {
                box_clone
                    .async_call("bump", |state| {
                        state.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let total = box_
            .sync_call("read", |state| state.load(Ordering::SeqCst))
            .unwrap();
        assert_eq!(total, 50);
        box_.shutdown();
    }

    #[test]
    fn wrapped_internal_value_unwraps_on_its_producing_box_only() {
        let producer: EventBox<i32> = EventBox::new(0);
        let other: EventBox<i32> = EventBox::new(0);
        let producer_for_handler = producer.clone();

        let wrapped = producer
            .sync_call("snapshot", move |state| {
                producer_for_handler.wrap_internal("snapshot", *state)
            })
            .unwrap();

        let (wrapped, err) = other.unwrap_internal(wrapped).unwrap_err();
        assert!(matches!(err, EventBoxError::InvalidBoundary { .. }));
        assert_eq!(producer.unwrap_internal(wrapped).unwrap(), 0);
        producer.shutdown();
        other.shutdown();
    }

    #[test]
    fn opaque_handle_round_trips_through_an_external_caller() {
        let box_: EventBox<i32> = EventBox::new(42);
        let box_for_handler = box_.clone();
        let handle = box_
            .sync_call("snapshot", move |state| box_for_handler.wrap_opaque(*state))
            .unwrap();
        let same_handle = handle.clone();
        assert_eq!(handle.owner(), same_handle.owner());
        box_.shutdown();
    }
}
