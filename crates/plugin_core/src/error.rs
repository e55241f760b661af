//! Typed errors surfaced by the plugin host.
//!
//! Discovery failures are swallowed at the call site (see [`crate::manifest`]);
//! everything else here is returned to a caller or recorded on a [`crate::job::Job`].

use thiserror::Error;

/// Errors the host can report back to a caller.
#[derive(Debug, Error)]
pub enum HostError {
    /// A manifest was malformed, duplicated, or otherwise unusable.
    #[error("manifest error: {0}")]
    Manifest(String),

    /// Plugin configuration failed schema validation.
    #[error("config validation failed for '{plugin}': {message}")]
    ConfigValidation {
        /// Name of the plugin whose config was rejected.
        plugin: String,
        /// Human-readable validation failure.
        message: String,
    },

    /// Operation referenced a plugin that is not currently loaded.
    #[error("plugin '{0}' is not loaded")]
    NotLoaded(String),

    /// Operation referenced a plugin that is loaded but disabled.
    #[error("plugin '{0}' is disabled")]
    Disabled(String),

    /// The child process failed to spawn or complete its handshake.
    #[error("spawn failed for '{plugin}': {message}")]
    Spawn {
        /// Name of the plugin whose child failed to come up.
        plugin: String,
        /// Underlying cause.
        message: String,
    },

    /// A framing violation, unknown `request_id`, or unexpected child exit
    /// broke the transport. The owning proxy is marked broken.
    #[error("transport error on '{plugin}': {message}")]
    Transport {
        /// Name of the plugin whose proxy broke.
        plugin: String,
        /// Description of the violation.
        message: String,
    },

    /// A single `call` exceeded its timeout. The proxy itself is unaffected.
    #[error("call to '{plugin}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Name of the plugin that did not answer in time.
        plugin: String,
        /// Timeout that was exceeded, in milliseconds.
        timeout_ms: u64,
    },

    /// The child reported a structured error for the request.
    #[error("plugin '{plugin}' reported: {message}")]
    Plugin {
        /// Name of the plugin that raised the error.
        plugin: String,
        /// Message the child attached to its `error` frame.
        message: String,
    },

    /// The queue has been stopped and refuses new submissions.
    #[error("job queue is stopped")]
    QueueClosed,

    /// A job id was not recognised by the queue.
    #[error("unknown job id")]
    UnknownJob,
}

/// Convenience alias used throughout the crate's typed-error surfaces.
pub type HostResult<T> = Result<T, HostError>;
