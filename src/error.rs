//! Crate-level error and failure types.

use serde::{Deserialize, Serialize};

use crate::message::TraceId;

/// Catch-all failure reason for unexpected errors such as handler panics.
pub const UNKNOWN_REASON: &str = "Unknown";

/// A modelled, recoverable failure returned by handlers, projections, and
/// aggregate state repositories.
///
/// Carries the originating `trace_id` when one is known so callers can
/// correlate the failure with the command or event that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{reason}: {message}")]
pub struct Failure {
    /// Machine-readable reason (e.g. `"InsufficientFunds"`).
    pub reason: String,
    /// Human-readable description.
    pub message: String,
    /// Trace of the message that produced this failure, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
}

impl Failure {
    /// A failure with the given reason and message and no trace.
    pub fn new(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            message: message.into(),
            trace_id: None,
        }
    }

    /// A failure with the [`UNKNOWN_REASON`] catch-all reason.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(UNKNOWN_REASON, message)
    }

    /// Attach the originating trace id.
    pub fn with_trace_id(mut self, trace_id: TraceId) -> Self {
        self.trace_id = Some(trace_id);
        self
    }
}

/// Error returned by message store backends and the [`MessageStore`](crate::MessageStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Disk I/O failure in a file-backed backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A message could not be encoded for persistence.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted log entry could not be decoded.
    #[error("corrupt log entry {entry}: {reason}")]
    Corrupt {
        /// 1-based position of the bad entry in the log.
        entry: usize,
        /// What was wrong with it.
        reason: String,
    },
}

/// Error returned by [`Component`](crate::Component) operations.
#[derive(Debug, thiserror::Error)]
pub enum ComponentError {
    /// The component has been stopped and admits no further messages.
    #[error("component '{0}' is stopped")]
    Stopped(String),

    /// The named channel is not declared on the component.
    #[error("component '{component}' has no {direction} channel named '{channel}'")]
    UnknownChannel {
        /// Component name.
        component: String,
        /// `"input"` or `"output"`.
        direction: &'static str,
        /// Requested channel name.
        channel: String,
    },

    /// A typed message could not be encoded.
    #[error("message encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Error returned by a dispatcher's handler.
///
/// Delivery errors never stop the store's subscription loop; they are
/// reported through `tracing` and, depending on the dispatcher's
/// [`OffsetPolicy`](crate::OffsetPolicy), may still advance the offset.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The handler reported a failure.
    #[error("handler failed: {0}")]
    Handler(String),

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// Forwarding into a component failed.
    #[error(transparent)]
    Component(#[from] ComponentError),
}

impl DispatchError {
    /// Build a [`DispatchError::Handler`] from any displayable error.
    pub fn handler(err: impl std::fmt::Display) -> Self {
        Self::Handler(err.to_string())
    }
}

/// Error returned when loading an aggregate through the store.
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    /// Reading the event history failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Replaying the history failed.
    #[error(transparent)]
    Failure(#[from] Failure),
}

/// Render a panic payload as text.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Run `fut` on its own task so a panic inside it surfaces as `Err` with the
/// panic text instead of unwinding through the caller.
pub(crate) async fn catch_panic<F>(fut: F) -> Result<F::Output, String>
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(output) => Ok(output),
        Err(e) if e.is_panic() => Err(panic_message(e.into_panic())),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::new_trace_id;

    #[test]
    fn failure_displays_reason_and_message() {
        let failure = Failure::new("Overdrawn", "balance would go negative");
        assert_eq!(failure.to_string(), "Overdrawn: balance would go negative");
        assert_eq!(failure.trace_id, None);
    }

    #[test]
    fn failure_unknown_uses_catch_all_reason() {
        let failure = Failure::unknown("boom");
        assert_eq!(failure.reason, UNKNOWN_REASON);
        assert_eq!(failure.message, "boom");
    }

    #[test]
    fn failure_with_trace_id_attaches_trace() {
        let trace = new_trace_id();
        let failure = Failure::new("R", "m").with_trace_id(trace);
        assert_eq!(failure.trace_id, Some(trace));
    }

    #[test]
    fn failure_serde_skips_missing_trace() {
        let json = serde_json::to_string(&Failure::new("R", "m")).expect("serialize");
        assert!(!json.contains("trace_id"));
        let back: Failure = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, Failure::new("R", "m"));
    }

    #[test]
    fn store_error_io_from_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        let err = StoreError::from(io_err);
        assert!(err.to_string().contains("read-only"));
    }

    #[test]
    fn component_error_unknown_channel_display() {
        let err = ComponentError::UnknownChannel {
            component: "pinger".into(),
            direction: "output",
            channel: "pong".into(),
        };
        assert_eq!(
            err.to_string(),
            "component 'pinger' has no output channel named 'pong'"
        );
    }

    #[test]
    fn dispatch_error_handler_from_display() {
        let err = DispatchError::handler("nope");
        assert_eq!(err.to_string(), "handler failed: nope");
    }

    #[test]
    fn panic_message_reads_str_and_string_payloads() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(42u8)), "handler panicked");
    }

    // Errors cross task boundaries through tokio channels and join handles.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<Failure>();
            assert_send_sync::<StoreError>();
            assert_send_sync::<ComponentError>();
            assert_send_sync::<DispatchError>();
            assert_send_sync::<AggregateError>();
        }
    };
}
