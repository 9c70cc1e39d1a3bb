// Copyright (c) 2026 the eventbox authors. Licensed under Apache License, Version 2.0.

//! The four callable wrapper kinds from §4.E: three outbound (internal
//! objects wrapped for external invocation) and one inbound (an external
//! closure wrapped for internal invocation).
//!
//! Each outbound wrapper carries a back reference to its owning box's
//! dispatcher. Invocation branches on [`frame::is_internal_to`]: a call
//! arriving while already running on the owning box's loop thread runs the
//! underlying closure directly — required for correctness, since the
//! dedicated loop thread enqueuing a job and blocking on its own reply
//! would deadlock — anything else dispatches through the normal job queue.

use std::sync::{Arc, Mutex};

use crate::error::EventBoxError;
use crate::event_loop::Dispatcher;
use crate::frame::{self, CallKind, LoopId};
use crate::reply::CallbackMsg;

/// Outbound wrapper for a fire-and-forget internal operation. Invocation
/// never blocks the caller.
pub struct AsyncProc<S> {
    dispatcher: Arc<Dispatcher<S>>,
    name: &'static str,
    handler: Arc<dyn Fn(&mut S) + Send + Sync>,
}

impl<S: Send + 'static> AsyncProc<S> {
    pub(crate) fn new(
        dispatcher: Arc<Dispatcher<S>>,
        name: &'static str,
        handler: impl Fn(&mut S) + Send + Sync + 'static,
    ) -> Self {
        Self {
            dispatcher,
            name,
            handler: Arc::new(handler),
        }
    }

    /// Invokes the wrapped proc. Internal-originated calls run directly and
    /// synchronously on the caller's own stack (the lock, i.e. the loop
    /// thread, is already "held" by this thread); external-originated calls
    /// dispatch through `async_call`.
    pub fn invoke(&self) -> Result<(), EventBoxError> {
        if frame::is_internal_to(self.dispatcher.loop_id) {
            (self.handler)(unsafe { self.dispatcher.state_mut_on_loop_thread() });
            return Ok(());
        }
        let handler = Arc::clone(&self.handler);
        self.dispatcher
            .dispatch_async(CallKind::AsyncProc, self.name, move |state| handler(state))
    }
}

/// Outbound wrapper for a request/reply internal operation. Invocation
/// blocks the caller until a value comes back.
pub struct SyncProc<S, R> {
    dispatcher: Arc<Dispatcher<S>>,
    name: &'static str,
    handler: Arc<dyn Fn(&mut S) -> R + Send + Sync>,
}

impl<S: Send + 'static, R: Send + 'static> SyncProc<S, R> {
    pub(crate) fn new(
        dispatcher: Arc<Dispatcher<S>>,
        name: &'static str,
        handler: impl Fn(&mut S) -> R + Send + Sync + 'static,
    ) -> Self {
        Self {
            dispatcher,
            name,
            handler: Arc::new(handler),
        }
    }

    pub fn invoke(&self) -> Result<R, EventBoxError> {
        if frame::is_internal_to(self.dispatcher.loop_id) {
            return Ok((self.handler)(unsafe { self.dispatcher.state_mut_on_loop_thread() }));
        }
        let handler = Arc::clone(&self.handler);
        self.dispatcher
            .dispatch_sync(CallKind::SyncProc, self.name, move |state| handler(state))
    }
}

/// Outbound wrapper for a deferred-reply internal operation. Invocation
/// blocks the caller until the internal handler's reply callable is itself
/// invoked, possibly much later and from an unrelated thread (e.g. a
/// background activity).
pub struct YieldProc<S, R> {
    dispatcher: Arc<Dispatcher<S>>,
    name: &'static str,
    handler: Arc<dyn Fn(&mut S, YieldReply<R>) + Send + Sync>,
}

impl<S: Send + 'static, R: Send + 'static> YieldProc<S, R> {
    pub(crate) fn new(
        dispatcher: Arc<Dispatcher<S>>,
        name: &'static str,
        handler: impl Fn(&mut S, YieldReply<R>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            dispatcher,
            name,
            handler: Arc::new(handler),
        }
    }

    /// Never callable from internal context — there is no external caller
    /// for the engine to eventually hand a value back to, so a yield proc
    /// invoked from inside its own box's handler fails immediately.
    pub fn invoke(&self) -> Result<R, EventBoxError> {
        if frame::is_internal_to(self.dispatcher.loop_id) {
            return Err(EventBoxError::InvalidAccess {
                reason: "a yield proc cannot be invoked from internal context — it has no reply route to send a callback through",
            });
        }
        let handler = Arc::clone(&self.handler);
        self.dispatcher
            .dispatch_yield(CallKind::YieldProc, self.name, move |state, reply| handler(state, reply))
    }
}

/// The "reply callable" a `yield_call`/`YieldProc` handler is given: an
/// async-kind wrapper around the frame's reply sender. Only the first
/// invocation is accepted.
pub struct YieldReply<R> {
    send: Arc<dyn Fn(R) -> Result<(), EventBoxError> + Send + Sync>,
    replied: Arc<Mutex<bool>>,
    call_name: &'static str,
}

impl<R> Clone for YieldReply<R> {
    fn clone(&self) -> Self {
        Self {
            send: Arc::clone(&self.send),
            replied: Arc::clone(&self.replied),
            call_name: self.call_name,
        }
    }
}

impl<R> YieldReply<R> {
    pub(crate) fn new(
        call_name: &'static str,
        send: impl Fn(R) -> Result<(), EventBoxError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            send: Arc::new(send),
            replied: Arc::new(Mutex::new(false)),
            call_name,
        }
    }

    /// Delivers `value` as the deferred call's result. The first invocation
    /// wins; every later one gets `MultipleResults`.
    pub fn invoke(&self, value: R) -> Result<(), EventBoxError> {
        let mut replied = self.replied.lock().unwrap();
        if *replied {
            return Err(EventBoxError::MultipleResults {
                call_name: self.call_name,
            });
        }
        *replied = true;
        (self.send)(value)
    }
}

/// Inbound wrapper for a raw external closure handed into a box. May only be
/// invoked from inside a handler running on its own box's loop thread — an
/// external caller invoking it directly gets `InvalidAccess`.
///
/// Carries `A`/`R` as a `PhantomData` marker rather than just wrapping `F`
/// directly: `invoke`'s argument and return types need to be tied to the
/// struct itself, not just bounded in a where-clause, for the compiler to
/// accept them as constrained.
pub struct ExternalCallable<F, A, R> {
    owner: LoopId,
    callable: Arc<Mutex<F>>,
    _marker: std::marker::PhantomData<fn(A) -> R>,
}

impl<F, A, R> Clone for ExternalCallable<F, A, R> {
    fn clone(&self) -> Self {
        Self {
            owner: self.owner,
            callable: Arc::clone(&self.callable),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<F, A, R> ExternalCallable<F, A, R> {
    pub(crate) fn new(callable: F, owner: LoopId) -> Self {
        Self {
            owner,
            callable: Arc::new(Mutex::new(callable)),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn owner(&self) -> LoopId {
        self.owner
    }
}

impl<A, R, F> ExternalCallable<F, A, R>
where
    A: Send + 'static,
    R: Send + 'static,
    F: FnMut(A) -> R + Send + 'static,
{
    /// Invokes the wrapped closure with `args`.
    ///
    /// Must be called from inside a handler running on this callable's own
    /// box's loop thread — anything else is `InvalidAccess`. On the happy
    /// path this posts a [`CallbackMsg`] into the active frame's reply
    /// route and blocks this (the loop) thread on a secondary oneshot for
    /// the result; the external caller's own `recv_loop` (see `reply.rs`)
    /// is what actually runs `self.callable` on its own thread and answers
    /// the oneshot. If the active frame has no reply route — an
    /// `async_call`, `async_proc_call`, or timer fire with no caller able to
    /// run callbacks — this also fails with `InvalidAccess`.
    pub fn invoke(&self, args: A) -> Result<R, EventBoxError> {
        if !frame::is_internal_to(self.owner) {
            return Err(EventBoxError::InvalidAccess {
                reason: "external callables must be unwrapped and invoked from inside their own box's handler, not called directly from outside",
            });
        }
        let route = frame::current_frame()
            .and_then(|f| f.reply)
            .ok_or(EventBoxError::InvalidAccess {
                reason: "no external caller is available to run this callback — async calls, async procs and timer fires have no reply route",
            })?;

        let (result_tx, result_rx) = std::sync::mpsc::channel::<R>();
        let callable = Arc::clone(&self.callable);
        route.post_callback(CallbackMsg {
            call: Box::new(move || {
                let value = (callable.lock().unwrap())(args);
                let _ = result_tx.send(value);
            }),
        });
        result_rx.recv().map_err(|_| EventBoxError::InvalidAccess {
            reason: "the external caller dropped its reply channel before answering the callback",
        })
    }
}
