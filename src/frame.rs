// Copyright (c) 2026 the eventbox authors. Licensed under Apache License, Version 2.0.

//! The ephemeral call frame and the thread-local marker that lets callable
//! wrappers tell internal invocations from external ones.
//!
//! Each [`EventBox`](crate::EventBox) owns exactly one dedicated loop thread
//! (see `event_loop.rs`). While that thread is running a dispatched job, it
//! stores a [`FrameMeta`] in the thread-local [`CURRENT_FRAME`]; every other
//! time, including while any other thread runs, the cell is empty. Callable
//! wrappers compare the frame's [`LoopId`] against their own owning loop to
//! decide whether they're being invoked from inside their own handler
//! (direct call, no channel round trip) or from outside it (dispatch).

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::reply::ReplyRoute;

/// Identifies one [`EventBox`](crate::EventBox) for the lifetime of the process.
///
/// Plain counter, no semantic meaning beyond equality — two `LoopId`s are
/// equal iff they name the same box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopId(u64);

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

impl LoopId {
    pub(crate) fn next() -> Self {
        Self(NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The call-frame kinds from the data model, minus `external-callback-return`:
/// that step runs the external callable directly on the external caller's own
/// thread, inside its reply loop (see `reply.rs`), and never dispatches a job
/// onto a loop thread — so no `FrameMeta` is ever created for it, and giving
/// it a `CallKind` here would just be dead data with no construction site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Fire-and-forget named call.
    Async,
    /// Request/reply named call.
    SyncReply,
    /// Deferred-reply named call.
    YieldReply,
    /// Fire-and-forget invocation of an internal object's async proc.
    AsyncProc,
    /// Blocking invocation of an internal object's sync proc.
    SyncProc,
    /// Blocking invocation of an internal object's yield proc.
    YieldProc,
}

/// Metadata for the one in-flight job running on a loop thread.
///
/// Never nested: a loop thread runs exactly one job before clearing this
/// back to `None`, even when that job itself makes reentrant internal calls
/// (those execute directly, without creating a new frame — see
/// `callable.rs`).
#[derive(Clone)]
pub struct FrameMeta {
    pub loop_id: LoopId,
    pub kind: CallKind,
    pub name: &'static str,
    /// Present for `SyncReply`/`YieldReply` frames: the route an internally
    /// invoked external callable posts a [`Callback`](crate::reply::CallbackMsg)
    /// onto. Absent for `Async`/`AsyncProc`/timer fires — there is no
    /// external caller able to run a callback on their behalf, so
    /// `ExternalCallable::invoke` fails with `InvalidAccess` in that case.
    pub reply: Option<ReplyRoute>,
}

thread_local! {
    static CURRENT_FRAME: RefCell<Option<FrameMeta>> = const { RefCell::new(None) };
}

/// Runs `body` with `meta` installed as the active frame for this thread,
/// restoring the previous value (always `None` in practice, since frames
/// never nest) afterwards.
pub(crate) fn with_frame<R>(meta: FrameMeta, body: impl FnOnce() -> R) -> R {
    CURRENT_FRAME.with(|cell| *cell.borrow_mut() = Some(meta));
    let result = body();
    CURRENT_FRAME.with(|cell| *cell.borrow_mut() = None);
    result
}

/// Returns a clone of the active frame on *this* thread, if any.
pub(crate) fn current_frame() -> Option<FrameMeta> {
    CURRENT_FRAME.with(|cell| cell.borrow().clone())
}

/// True if this thread currently has an active frame owned by `loop_id` —
/// i.e. this thread is that box's loop thread, mid-handler.
pub(crate) fn is_internal_to(loop_id: LoopId) -> bool {
    CURRENT_FRAME.with(|cell| matches!(&*cell.borrow(), Some(f) if f.loop_id == loop_id))
}
