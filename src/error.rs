// Copyright (c) 2026 the eventbox authors. Licensed under Apache License, Version 2.0.

//! Error kinds exposed by the crate. See [`EventBoxError`].

/// The five error kinds a caller of an [`EventBox`](crate::EventBox) can observe.
///
/// Every variant carries a [`miette::Diagnostic`] code under the `eventbox::`
/// namespace plus short help text, mirroring how [`thiserror`] and [`miette`]
/// are paired elsewhere for actionable diagnostics.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum EventBoxError {
    /// A yield proc was invoked from internal context, an external callable
    /// was invoked from external context, a callback was issued from a frame
    /// with no reply route, or a wrapper was invoked with a block argument.
    #[error("invalid access: {reason}")]
    #[diagnostic(
        code(eventbox::invalid_access),
        help(
            "Yield procs can only be invoked by external callers; external \
             callables can only be invoked from inside a handler running on \
             their own box's loop thread. See the EventBox docs for the \
             full internal/external table."
        )
    )]
    InvalidAccess {
        /// Human-readable detail of which rule was violated.
        reason: &'static str,
    },

    /// A deferred-reply (`yield_call`) frame's reply route was invoked more
    /// than once. Only the first invocation is accepted.
    #[error("deferred-reply callable invoked more than once for `{call_name}`")]
    #[diagnostic(
        code(eventbox::multiple_results),
        help("Only the first invocation of a yield_call reply callable is accepted.")
    )]
    MultipleResults {
        /// Name of the call whose reply route was double-invoked.
        call_name: &'static str,
    },

    /// Injected into a background activity on shutdown or explicit abort.
    /// Observed inside the activity itself, at its next suspension point.
    #[error("activity `{activity_name}` aborted")]
    #[diagnostic(
        code(eventbox::abort_activity),
        help("This is the normal signal an activity sees on shutdown; treat it as cleanup, not failure.")
    )]
    AbortActivity {
        /// Name of the aborted activity.
        activity_name: &'static str,
    },

    /// Raised for any inbound call made after the box's shutdown flag is set.
    #[error("box is shut down, rejected call to `{call_name}`")]
    #[diagnostic(
        code(eventbox::shutdown),
        help("The box was shut down; no further calls are accepted.")
    )]
    Shutdown {
        /// Name of the call that was rejected.
        call_name: &'static str,
    },

    /// The sanitizer could not preserve a value's semantics across the
    /// internal/external boundary — e.g. a `WrappedInternal` forced to
    /// unwrap from a loop other than the one that produced it.
    #[error("cannot cross the internal/external boundary: {reason}")]
    #[diagnostic(
        code(eventbox::invalid_boundary),
        help(
            "Values wrapped by one box's loop stay opaque handles to every \
             other box; only the producing loop may unwrap them."
        )
    )]
    InvalidBoundary {
        /// Human-readable detail of which boundary rule was violated.
        reason: String,
    },
}
