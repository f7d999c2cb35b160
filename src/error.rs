//! Error types for remora

use std::time::Duration;

use thiserror::Error;

/// Result type for remora operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for remora
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to launch Chrome
    #[error("Failed to launch Chrome: {0}")]
    Launch(String),

    /// Chrome not found
    #[error("Chrome not found")]
    ChromeNotFound,

    /// Transport error
    #[error("Transport error: {context}")]
    Transport {
        context: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// A command reply carried an error payload. Delivered only to the
    /// caller that issued the command.
    #[error("Protocol error in {method}: {message} (code {code})")]
    Protocol {
        method: String,
        code: i64,
        message: String,
    },

    /// An event referenced a target or frame that the protocol guarantees
    /// should exist. Indicates a tracking bug or desynchronization, fatal
    /// to the subsystem that detected it.
    #[error("Internal consistency error: {0}")]
    InternalConsistency(String),

    /// The session or connection owning a pending command closed before
    /// the reply arrived. Distinct from a per-command protocol error so
    /// callers can tell "browser is gone" from "this command failed."
    #[error("Target closed: {0}")]
    TargetClosed(String),

    /// A navigation wait did not reach its milestones before the
    /// configured deadline.
    #[error("Navigation timeout of {timeout:?} exceeded")]
    NavigationTimeout { timeout: Duration },

    /// The execution context an evaluation was bound to was invalidated by
    /// a new document load. Retry against the new context is the caller's
    /// decision.
    #[error("Execution context destroyed: {0}")]
    ContextDestroyed(String),

    /// The frame a wait or evaluation was registered on got detached.
    #[error("Frame detached: {0}")]
    FrameDetached(String),

    /// Navigation failed outright (net errors, bad scheme)
    #[error("Navigation error: {0}")]
    Navigation(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Decode error (e.g., base64)
    #[error("Decode error: {0}")]
    Decode(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a transport error with context
    pub fn transport(context: impl Into<String>) -> Self {
        Self::Transport {
            context: context.into(),
            source: None,
        }
    }

    /// Create a transport error with IO source
    pub fn transport_io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Transport {
            context: context.into(),
            source: Some(source),
        }
    }

    /// Create a protocol error with full context
    pub fn protocol(method: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self::Protocol {
            method: method.into(),
            code,
            message: message.into(),
        }
    }

    /// Create a target-closed error
    pub fn closed(reason: impl Into<String>) -> Self {
        Self::TargetClosed(reason.into())
    }

    /// True if this failure means the owning session or connection is gone
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::TargetClosed(_))
    }

    /// Convert "Cannot find context" protocol replies into the distinct
    /// stale-context kind, so callers can retry against the new context.
    pub(crate) fn clarify_context(self, frame_id: &str) -> Self {
        match &self {
            Error::Protocol { message, .. } if message.contains("Cannot find context") => {
                Error::ContextDestroyed(frame_id.to_string())
            }
            _ => self,
        }
    }
}
