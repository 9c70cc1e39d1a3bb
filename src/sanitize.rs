// Copyright (c) 2026 the eventbox authors. Licensed under Apache License, Version 2.0.

//! The argument sanitizer: the inbound/outbound rules for values crossing a
//! box's internal/external boundary (§4.A).
//!
//! Rust's static typing already does most of the classification the
//! original dynamic sanitizer needs: a raw closure can only be turned into
//! an [`ExternalCallable`](crate::callable::ExternalCallable) at a call site
//! that expects one, so there is no runtime ambiguity about "is this a
//! callable". The one genuinely runtime rule this module implements is
//! "values wrapped by a different loop stay opaque handles, and a forced
//! unwrap across loops fails with `InvalidBoundary`".

use crate::error::EventBoxError;
use crate::frame::LoopId;
use std::fmt;
use std::sync::Arc;

/// An opaque handle to a value that lives inside a box's state. It carries
/// no way to read or mutate the wrapped value from outside the owning
/// loop — that's the point: raw mutable state never escapes as a direct
/// reference, only as a handle other code can hold, clone, and hand back in.
pub struct OpaqueHandle<T> {
    inner: Arc<T>,
    owner: LoopId,
}

impl<T> Clone for OpaqueHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            owner: self.owner,
        }
    }
}

impl<T> fmt::Debug for OpaqueHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpaqueHandle").field("owner", &self.owner).finish()
    }
}

impl<T> OpaqueHandle<T> {
    pub(crate) fn new(value: T, owner: LoopId) -> Self {
        Self {
            inner: Arc::new(value),
            owner,
        }
    }

    /// The loop that produced this handle.
    pub fn owner(&self) -> LoopId {
        self.owner
    }
}

/// A value created inside a loop that is handed outward, carrying a back
/// reference (its producing [`LoopId`]) and its declared name.
///
/// Mirrors the "Wrapped Internal Object" entry in the data model: the *same*
/// loop that produced it can unwrap it back to the raw value; any other
/// loop — including a different box entirely — must treat it as opaque.
pub struct WrappedInternal<T> {
    value: T,
    producer: LoopId,
    name: &'static str,
}

impl<T> WrappedInternal<T> {
    pub(crate) fn new(value: T, producer: LoopId, name: &'static str) -> Self {
        Self { value, producer, name }
    }

    /// The loop that produced this wrapper.
    pub fn producer(&self) -> LoopId {
        self.producer
    }

    /// Unwraps back to the raw value, but only if `requesting_loop` is the
    /// same loop that produced it. A mismatched loop gets its wrapper back
    /// unchanged plus an `InvalidBoundary` error — the value's semantics
    /// (it's only meaningful bound to its producing loop) cannot be
    /// preserved across that boundary.
    pub fn try_unwrap(self, requesting_loop: LoopId) -> Result<T, (Self, EventBoxError)> {
        if requesting_loop == self.producer {
            Ok(self.value)
        } else {
            let reason = format!("`{}` was wrapped by a different box's loop", self.name);
            Err((self, EventBoxError::InvalidBoundary { reason }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_loop_unwraps() {
        let loop_id = LoopId::next();
        let wrapped = WrappedInternal::new(42_i32, loop_id, "answer");
        assert_eq!(wrapped.try_unwrap(loop_id).ok(), Some(42));
    }

    #[test]
    fn different_loop_stays_opaque() {
        let producer = LoopId::next();
        let other = LoopId::next();
        let wrapped = WrappedInternal::new(42_i32, producer, "answer");
        let (wrapped_back, err) = wrapped.try_unwrap(other).unwrap_err();
        assert!(matches!(err, EventBoxError::InvalidBoundary { .. }));
        assert_eq!(wrapped_back.producer(), producer);
    }

    #[test]
    fn opaque_handle_exposes_no_payload() {
        let loop_id = LoopId::next();
        let handle = OpaqueHandle::new(String::from("secret"), loop_id);
        let cloned = handle.clone();
        assert_eq!(cloned.owner(), loop_id);
    }
}
