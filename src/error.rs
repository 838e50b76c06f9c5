//! Error types for resolution and watch failures.

use std::num::ParseIntError;

/// Result type for resolver operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned to callers of the resolver.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The target string could not be parsed.
    #[error("invalid target {target:?}: {reason}")]
    InvalidTarget {
        /// The offending input.
        target: String,
        /// What was wrong with it.
        reason: &'static str,
    },

    /// The API client could not be configured.
    #[error("configuration error: {0}")]
    Config(String),

    /// The kubeconfig auth profile could not be loaded.
    #[error("failed to load kubeconfig auth profile: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    /// The Kubernetes client could not be created.
    #[error("failed to create Kubernetes client: {0}")]
    Kube(#[from] kube::Error),

    /// A change result carried a data-layer or stream termination error.
    #[error(transparent)]
    Watch(#[from] WatchError),

    /// The server sent an `ERROR` watch event.
    #[error("server reported watch error (code {code:?}, reason {reason:?}): {message}")]
    Remote {
        /// HTTP-like status code, if the server supplied one.
        code: Option<i32>,
        /// Machine-readable reason, if the server supplied one.
        reason: Option<String>,
        /// Human-readable message.
        message: String,
    },

    /// The watcher was closed.
    #[error("watcher closed")]
    Closed,
}

impl Error {
    /// Returns `true` if this error signals an intentional shutdown rather than a failure.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Errors carried by a [`ChangeResult`](crate::ChangeResult).
///
/// None of these roll back resolved state; the caller may keep calling
/// [`Watcher::next`](crate::Watcher::next).
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The watch stream framing could not be decoded. The stream is reconnected.
    #[error("unable to decode an event from the watch stream: {0}")]
    Decode(#[source] serde_json::Error),

    /// The server closed the watch stream. The stream is reconnected.
    #[error("EOF during watch stream event decoding")]
    EndOfStream,

    /// The watch stream ended in the middle of an event. The stream is reconnected.
    #[error("unexpected EOF during watch stream event decoding")]
    UnexpectedEndOfStream,

    /// Reading from the connection failed. The stream is reconnected.
    #[error("failed to read the watch stream: {0}")]
    Io(#[source] std::io::Error),

    /// The event carried an unknown `type`.
    #[error("got invalid watch event type: {0:?}")]
    InvalidEventType(String),

    /// The event object could not be decoded for its event type.
    #[error("malformed {event_type} event object: {source}")]
    Object {
        /// The event type that was being decoded.
        event_type: String,
        /// The underlying decode error.
        #[source]
        source: serde_json::Error,
    },

    /// The object's `metadata.resourceVersion` is not a decimal integer.
    #[error("invalid resourceVersion {value:?}: {source}")]
    ResourceVersion {
        /// The raw value.
        value: String,
        /// The parse failure.
        #[source]
        source: ParseIntError,
    },
}

impl WatchError {
    /// Returns `true` if the stream was torn down after this error and will be reconnected.
    #[must_use]
    pub fn is_stream_termination(&self) -> bool {
        matches!(
            self,
            Self::Decode(_) | Self::EndOfStream | Self::UnexpectedEndOfStream | Self::Io(_)
        )
    }
}
