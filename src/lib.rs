// Copyright (c) 2026 the eventbox authors. Licensed under Apache License, Version 2.0.

//! A serialized, actor-style concurrency primitive.
//!
//! An [`EventBox<S>`] owns private state `S` and exactly one dedicated OS
//! thread — its *loop thread* — that is the only thread ever holding a `&mut
//! S`. Every caller, on any other thread, reaches that state through three
//! call disciplines:
//!
//! - [`EventBox::async_call`] — fire-and-forget; the handler runs at some
//!   point after the call returns.
//! - [`EventBox::sync_call`] — request/reply; blocks until the handler has
//!   run and produced a value.
//! - [`EventBox::yield_call`] — deferred reply; blocks until whoever the
//!   handler hands its [`YieldReply`] to actually invokes it, which may
//!   happen much later and from an unrelated thread (commonly a background
//!   activity started with [`EventBox::start_activity`]).
//!
//! Internal code that already runs on a box's own loop thread (inside a
//! handler) can hold and invoke wrapper types — [`AsyncProc`], [`SyncProc`],
//! [`YieldProc`] — produced by [`EventBox::async_proc`]/[`sync_proc`]/
//! [`yield_proc`], and an [`ExternalCallable`] produced by
//! [`EventBox::wrap_external`] lets a handler call back out to external code
//! without ever running that code directly on the loop thread. Mixing up
//! which side of the internal/external boundary a wrapper is meant to be
//! invoked from is rejected with [`EventBoxError::InvalidAccess`] rather than
//! silently doing the wrong thing.
//!
//! [`TimerService`] layers one-shot and periodic alarms on top of a box,
//! backed by a single background activity. [`EventBoxOptions`] configures a
//! guard time for slow handlers and a custom [`ActivitySpawner`] for
//! background activity threads.
//!
//! [`sync_proc`]: EventBox::sync_proc
//! [`yield_proc`]: EventBox::yield_proc

mod activity;
mod callable;
mod error;
mod event_loop;
mod frame;
mod options;
mod reply;
mod sanitize;
mod timer;

pub use activity::ActivityContext;
pub use callable::{AsyncProc, ExternalCallable, SyncProc, YieldProc, YieldReply};
pub use error::EventBoxError;
pub use event_loop::EventBox;
pub use frame::LoopId;
pub use options::{ActivitySpawner, EventBoxOptions};
pub use sanitize::{OpaqueHandle, WrappedInternal};
pub use timer::{Alarm, AlarmId, Clock, ManualClock, SystemClock, TimerService};
