//! Error types

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias using the crate's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Callback for non-fatal errors raised after startup
pub type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

/// Main error type
///
/// Construction and startup problems surface through this type. Checker
/// failures never do; they are reported per name in the readiness body
/// (see [`CheckError`](crate::checks::CheckError)).
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be loaded or extracted
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// A port outside `[1, 65535]`
    #[error("invalid {name} {port}: must be in [1, 65535]")]
    InvalidPort {
        /// Which setting carried the port (`http_port`, `grpc_port`)
        name: &'static str,
        /// The rejected value
        port: u32,
    },

    /// A timeout that must be non-zero was zero
    #[error("invalid {0}: must be greater than zero")]
    InvalidTimeout(&'static str),

    /// `start` was called on a manager that is already running or has stopped
    #[error("probe responder already started")]
    AlreadyStarted,

    /// Attached binding started before a transport was attached
    #[error("attached {0} binding has no transport: attach it before calling start")]
    NotAttached(&'static str),

    /// The listener could not be bound
    #[error("failed to bind probe listener on {addr}: {source}")]
    Bind {
        /// Address that was requested
        addr: SocketAddr,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The serving loop failed after startup
    #[error("transport error: {0}")]
    Transport(String),

    /// The global tracing subscriber could not be installed
    #[error("tracing initialization failed: {0}")]
    Tracing(String),
}

/// Log a non-fatal error and hand it to the configured callback
pub(crate) fn report_error(handler: Option<&ErrorHandler>, err: Error) {
    tracing::error!(error = %err, "Probe server error");
    if let Some(handler) = handler {
        handler(&err);
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(err: tonic::transport::Error) -> Self {
        Error::Transport(err.to_string())
    }
}
