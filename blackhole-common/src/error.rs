//! Error types shared across the Blackhole crates.

use std::io;

use thiserror::Error;

/// Errors raised while loading or validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Config file {path} does not exist or is not readable: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: io::Error,
    },

    /// A listener entry could not be parsed.
    #[error("Invalid listener '{entry}': {reason}")]
    InvalidListener { entry: String, reason: String },

    /// A directive carries a value outside its permitted range.
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },

    /// TLS listeners are configured without complete material.
    #[error("To use TLS you must supply a listener, certificate file and key file")]
    IncompleteTls,

    /// A TLS material path does not point at a readable file.
    #[error("TLS file {path} does not exist or is not readable")]
    MissingTlsFile { path: String },
}

/// Errors terminating a single client session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Connection-level I/O failure.
    #[error("Connection error: {0}")]
    Connection(#[from] io::Error),

    /// The client stayed silent past the configured timeout.
    #[error("Session timed out after {0} seconds")]
    Timeout(u64),

    /// The TLS handshake or upgrade failed.
    #[error("TLS handshake failed: {0}")]
    Tls(String),

    /// The worker is shutting down.
    #[error("Shutdown requested")]
    Shutdown,
}

impl SessionError {
    /// Returns `true` for terminations the peer caused.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_) | Self::Tls(_))
    }
}

/// Errors terminating a listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The listening socket could not be registered with the runtime.
    #[error("Failed to initialise listener on {address}: {source}")]
    InitFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    /// An accept failure that is not known to be transient.
    #[error("Failed to accept connection: {0}")]
    AcceptFailed(#[from] io::Error),
}

/// Errors fatal to the supervisor process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A listening socket could not be created or bound.
    #[error("Cannot bind to {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    /// A host name in a listener entry did not resolve.
    #[error("Cannot resolve listener address {address}")]
    Unresolvable { address: String },

    /// TLS material failed to load.
    #[error("TLS material error: {0}")]
    Tls(String),

    /// Switching to the configured user or group failed.
    #[error("Cannot drop privileges to {target}: {reason}")]
    PrivilegeDrop { target: String, reason: String },

    /// The pidfile could not be written.
    #[error("Cannot write pidfile {path}: {source}")]
    Pidfile {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Forking a worker failed.
    #[error("Cannot fork worker: {0}")]
    Fork(String),

    /// Signal dispositions could not be installed.
    #[error("Cannot install signal handlers: {0}")]
    Signals(String),
}
