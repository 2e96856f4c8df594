//! Unified infrastructure error type.

use thiserror::Error as ThisError;

/// The error type returned by fulcrum's fallible startup operations.
///
/// Request-level failures (404, 415, 422, …) are not `Error`s. They travel as
/// [`Failure`](crate::Failure) values and end up as failed
/// [`Envelope`](crate::Envelope)s. This type surfaces infrastructure problems:
/// binding a port, reading configuration, or a middleware factory refusing to
/// start.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("invalid route `{route}`: {reason}")]
    InvalidRoute { route: String, reason: String },

    /// A middleware factory failed while building, e.g. a startup
    /// connectivity check. Aborts server startup.
    #[error("middleware `{middleware}` failed to start: {source}")]
    Startup {
        middleware: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub(crate) fn startup(
        middleware: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Startup { middleware: middleware.into(), source: source.into() }
    }
}
