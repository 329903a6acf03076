//! Error types for the sync-wait surface.
//!
//! A failure raised inside a task body is captured as a panic payload and
//! carried along the join chain. [`crate::sync_wait`] re-raises it on the
//! submitting thread; [`crate::try_sync_wait`] surfaces it as a
//! [`TaskFailed`] instead.

use std::any::Any;
use std::fmt;

use thiserror::Error;

/// A captured failure from a submitted task tree.
///
/// Wraps the raw panic payload. When several sibling tasks fail
/// concurrently, the first observed payload is kept and the rest are
/// dropped.
#[derive(Error)]
#[error("task failed: {}", self.message())]
pub struct TaskFailed {
    payload: Box<dyn Any + Send + 'static>,
}

impl TaskFailed {
    pub(crate) fn from_payload(payload: Box<dyn Any + Send + 'static>) -> Self {
        Self { payload }
    }

    /// Best-effort extraction of the panic message.
    #[must_use]
    pub fn message(&self) -> &str {
        if let Some(message) = self.payload.downcast_ref::<&'static str>() {
            message
        } else if let Some(message) = self.payload.downcast_ref::<String>() {
            message
        } else {
            "non-string panic payload"
        }
    }

    /// Consumes the error, returning the raw panic payload.
    ///
    /// Suitable for re-raising with [`std::panic::resume_unwind`].
    #[must_use]
    pub fn into_payload(self) -> Box<dyn Any + Send + 'static> {
        self.payload
    }
}

impl fmt::Debug for TaskFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFailed")
            .field("message", &self.message())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_from_static_str() {
        let failed = TaskFailed::from_payload(Box::new("boom"));
        assert_eq!(failed.message(), "boom");
        assert_eq!(failed.to_string(), "task failed: boom");
    }

    #[test]
    fn message_from_string() {
        let failed = TaskFailed::from_payload(Box::new(String::from("kaput")));
        assert_eq!(failed.message(), "kaput");
    }

    #[test]
    fn message_from_opaque_payload() {
        let failed = TaskFailed::from_payload(Box::new(17_u32));
        assert_eq!(failed.message(), "non-string panic payload");
    }

    #[test]
    fn payload_round_trips() {
        let failed = TaskFailed::from_payload(Box::new(17_u32));
        let payload = failed.into_payload();
        assert_eq!(payload.downcast_ref::<u32>(), Some(&17));
    }
}
