//! Domain errors raised by the plugin framework.
//!
//! All errors use a `thiserror`-derived enum with structured context so
//! callers can inspect the failure programmatically. I/O errors are wrapped
//! in `Arc` to keep the enum cheap to move across threads.
//!
//! The taxonomy deliberately separates three families a caller must be able
//! to tell apart: startup/negotiation failures (never retried, fixed by
//! reconfiguring host or plugin), connection-level faults mid-call, and
//! [`PluginError::Remote`], which carries an error returned by the plugin's
//! own application logic verbatim.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Errors arising from plugin lifecycle, negotiation, and RPC operations.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The plugin subprocess could not be launched.
    #[error("failed to launch plugin command '{command}': {source}")]
    LaunchFailed {
        /// The command that was executed.
        command: String,
        /// Underlying OS error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The plugin did not produce its handshake line within the startup
    /// timeout.
    #[error("timed out after {timeout_secs}s waiting for the plugin handshake")]
    HandshakeTimeout {
        /// Configured startup timeout in seconds.
        timeout_secs: u64,
    },

    /// The handshake line was present but could not be parsed.
    #[error("malformed handshake: {message}")]
    MalformedHandshake {
        /// Description of the field that failed to parse.
        message: String,
    },

    /// The plugin speaks a different core protocol version than the host.
    #[error("incompatible core protocol version: host speaks {expected}, plugin announced {actual}")]
    CoreVersionMismatch {
        /// Core version the host is built against.
        expected: u32,
        /// Core version the plugin announced.
        actual: u32,
    },

    /// Host and plugin share no application protocol version.
    #[error("no compatible protocol version: host supports {host:?}, plugin announced {plugin:?}")]
    NoCompatibleVersion {
        /// Versions declared by the host.
        host: Vec<u32>,
        /// Versions announced by the plugin.
        plugin: Vec<u32>,
    },

    /// The plugin announced a wire protocol the host does not allow.
    #[error("no compatible wire protocol: host allows [{allowed}], plugin announced '{advertised}'")]
    NoCompatibleProtocol {
        /// Comma-separated list of protocols the host accepts.
        allowed: String,
        /// Protocol token the plugin announced.
        advertised: String,
    },

    /// The requested plugin name is absent from the negotiated version's set.
    #[error("plugin '{name}' is not registered for protocol version {version}")]
    UnknownPlugin {
        /// Name that was requested.
        name: String,
        /// Negotiated protocol version whose set was consulted.
        version: u32,
    },

    /// The plugin subprocess exited or the connection dropped unexpectedly.
    #[error("plugin crashed{}", exit_status_suffix(.status))]
    PluginCrashed {
        /// Exit status of the subprocess, when known.
        status: Option<i32>,
    },

    /// A connection-level failure occurred mid-call.
    #[error("transport error: {message}")]
    Transport {
        /// Description of the failure.
        message: String,
        /// Optional underlying I/O error.
        #[source]
        source: Option<Arc<io::Error>>,
    },

    /// The plugin's own logic returned an error, carried back verbatim.
    #[error("remote error: {message}")]
    Remote {
        /// The error message produced by the remote implementation.
        message: String,
    },

    /// The host or serve configuration is invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the invalid configuration.
        message: String,
    },
}

impl PluginError {
    /// Builds a [`PluginError::Transport`] from an I/O error.
    pub fn transport_io(message: impl Into<String>, source: io::Error) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Builds a [`PluginError::Transport`] with no underlying I/O error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Returns `true` for failures of the plugin's application logic, as
    /// opposed to transport, negotiation, or lifecycle faults.
    #[must_use]
    pub const fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

fn exit_status_suffix(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!(" with exit status {code}"),
        None => String::new(),
    }
}
