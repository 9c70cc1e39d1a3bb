// Copyright (c) 2026 the eventbox authors. Licensed under Apache License, Version 2.0.

//! The reply channel: a bounded mailbox carrying either a terminal value or
//! a [`CallbackMsg`] that the external caller must run on its own thread.
//!
//! `sync_call`/`yield_call`/`sync_proc`/`yield_proc` all resolve to the same
//! shape on the calling side: send a job, then drain this channel with
//! [`ReplyReceiver::recv_loop`] until a terminal value or error arrives.
//! Anything else received in between is a [`CallbackMsg`] — the mechanism
//! the design notes describe for letting an internal handler invoke an
//! external callable without running arbitrary external code on the loop
//! thread itself: the handler posts a `Callback` here and blocks on a
//! secondary oneshot for the result, while this receiver's `recv_loop`
//! (running on the external caller's own thread) sees the `Callback`, runs
//! it, and answers through that secondary oneshot before looping back to
//! wait for the real terminal value.

use std::any::Any;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use crate::error::EventBoxError;

/// A callback an internal handler wants run on the external caller's
/// thread: the external callable plus its already-sanitized arguments,
/// bound into a single type-erased closure at the call site.
pub struct CallbackMsg {
    pub(crate) call: Box<dyn FnOnce() + Send>,
}

/// What a reply channel carries: exactly one terminal value or error, with
/// any number of callbacks preceding it.
enum ReplyMsg<R> {
    Value(R),
    Error(EventBoxError),
    Callback(CallbackMsg),
    /// The handler panicked. Carries the panic payload so it can be resumed
    /// on the external caller's thread — the Rust equivalent of "the
    /// handler's raised exception unwinds past the dispatch wrapper".
    Panicked(Box<dyn Any + Send>),
}

/// A type-erased handle for posting [`CallbackMsg`]s into a specific
/// in-flight frame's reply channel, without that frame's
/// [`FrameMeta`](crate::frame::FrameMeta) needing to be generic over the
/// call's result type.
#[derive(Clone)]
pub struct ReplyRoute {
    post: Arc<dyn Fn(CallbackMsg) + Send + Sync>,
}

impl ReplyRoute {
    pub(crate) fn post_callback(&self, msg: CallbackMsg) {
        (self.post)(msg);
    }
}

/// Sending half of a reply channel, parameterized over the call's result
/// type. The underlying `Sender` is behind an `Arc<Mutex<_>>` rather than
/// cloned per handle: clones of `ReplySender` (and the `ReplyRoute`s and
/// `YieldReply`s built from them) get moved into dispatched jobs that must be
/// `Send`, and wrapping it this way makes that hold regardless of whether
/// `mpsc::Sender` itself is `Sync`.
pub struct ReplySender<R> {
    tx: Arc<Mutex<Sender<ReplyMsg<R>>>>,
}

impl<R> Clone for ReplySender<R> {
    fn clone(&self) -> Self {
        Self { tx: Arc::clone(&self.tx) }
    }
}

/// Receiving half of a reply channel, held by the external caller.
pub struct ReplyReceiver<R> {
    rx: Receiver<ReplyMsg<R>>,
}

/// Creates a fresh reply channel for one dispatched call.
pub fn reply_channel<R>() -> (ReplySender<R>, ReplyReceiver<R>) {
    let (tx, rx) = mpsc::channel();
    (ReplySender { tx: Arc::new(Mutex::new(tx)) }, ReplyReceiver { rx })
}

impl<R: Send + 'static> ReplySender<R> {
    /// Posts the terminal value. Should be called at most once per frame —
    /// enforced by callers (e.g. `YieldProc::invoke`) checking a `replied`
    /// flag before reaching this.
    pub fn send_value(&self, value: R) {
        let _ = self.tx.lock().unwrap().send(ReplyMsg::Value(value));
    }

    /// Posts a terminal error in place of a value.
    pub fn send_error(&self, err: EventBoxError) {
        let _ = self.tx.lock().unwrap().send(ReplyMsg::Error(err));
    }

    /// Posts a caught handler panic, to be resumed on the caller's thread.
    pub fn send_panic(&self, payload: Box<dyn Any + Send>) {
        let _ = self.tx.lock().unwrap().send(ReplyMsg::Panicked(payload));
    }

    /// Returns a type-erased [`ReplyRoute`] that can be stashed in a
    /// [`FrameMeta`](crate::frame::FrameMeta) and used by
    /// `ExternalCallable::invoke` to post callbacks into this same channel.
    pub fn route(&self) -> ReplyRoute {
        let tx = Arc::clone(&self.tx);
        ReplyRoute {
            post: Arc::new(move |msg| {
                let _ = tx.lock().unwrap().send(ReplyMsg::Callback(msg));
            }),
        }
    }
}

impl<R> ReplyReceiver<R> {
    /// Blocks until the terminal value or error arrives, running any
    /// interleaved callbacks on this (the external caller's) thread as they
    /// show up. This is the "reply loop" from the design notes.
    pub fn recv_loop(self) -> Result<R, EventBoxError> {
        loop {
            match self.rx.recv() {
                Ok(ReplyMsg::Value(v)) => return Ok(v),
                Ok(ReplyMsg::Error(e)) => return Err(e),
                Ok(ReplyMsg::Callback(cb)) => (cb.call)(),
                Ok(ReplyMsg::Panicked(payload)) => std::panic::resume_unwind(payload),
                Err(_) => {
                    return Err(EventBoxError::Shutdown {
                        call_name: "<reply channel closed without a terminal value>",
                    })
                }
            }
        }
    }
}
