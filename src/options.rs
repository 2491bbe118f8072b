use std::time::Duration;

use crate::{MAX_HANDSHAKE_SIZE, MAX_PAYLOAD_READ};

/// How strictly the upgrade request headers are matched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HandshakePolicy {
    /// Case-sensitive names, `Upgrade` exactly `websocket` and `Connection` exactly `Upgrade`.
    #[default]
    Strict,
    /// Case-insensitive names and `Upgrade` value, and `Connection` may list several tokens
    /// (`keep-alive, Upgrade`). Matches what browsers actually send.
    Lenient,
}

/// Configuration options for the connections accepted by a server.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use tickws::{HandshakePolicy, Options};
///
/// let options = Options::default()
///     .with_handshake_policy(HandshakePolicy::Lenient)
///     .with_handshake_timeout(Duration::from_secs(5))
///     .with_max_connections(256)
///     .with_utf8();
/// ```
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Maximum allowed payload size for incoming frames, in bytes.
    ///
    /// A frame declaring a larger payload closes the connection.
    ///
    /// Default: 1 MiB as defined in [`MAX_PAYLOAD_READ`]
    pub max_payload_read: Option<usize>,

    /// Maximum size of the HTTP request head.
    ///
    /// Default: 8 KiB as defined in [`MAX_HANDSHAKE_SIZE`]
    pub max_handshake_size: Option<usize>,

    /// Whether text payloads must be valid UTF-8.
    ///
    /// If `false`, invalid sequences are replaced with U+FFFD. If `true`, frames with invalid
    /// UTF-8 are dropped (the connection stays open).
    ///
    /// Default: `false`
    pub check_utf8: bool,

    /// Header matching rules for the upgrade request.
    ///
    /// Default: [`HandshakePolicy::Strict`]
    pub handshake_policy: HandshakePolicy,

    /// Time allowed for the client to send a complete upgrade request.
    ///
    /// Default: none, a client that never finishes its request holds its task forever.
    pub handshake_timeout: Option<Duration>,

    /// Time an open connection may stay silent before it is closed.
    ///
    /// Default: none.
    pub idle_timeout: Option<Duration>,

    /// Maximum number of connections served at once. The accept loop stops accepting while
    /// the limit is reached.
    ///
    /// Default: unbounded.
    pub max_connections: Option<usize>,
}

impl Options {
    /// Sets the maximum allowed payload size for incoming frames.
    pub fn with_max_payload_read(self, size: usize) -> Self {
        Self {
            max_payload_read: Some(size),
            ..self
        }
    }

    /// Sets the maximum size of the upgrade request head.
    pub fn with_max_handshake_size(self, size: usize) -> Self {
        Self {
            max_handshake_size: Some(size),
            ..self
        }
    }

    /// Enables strict UTF-8 validation for incoming text.
    pub fn with_utf8(self) -> Self {
        Self {
            check_utf8: true,
            ..self
        }
    }

    /// Sets the header matching rules for the upgrade request.
    pub fn with_handshake_policy(self, policy: HandshakePolicy) -> Self {
        Self {
            handshake_policy: policy,
            ..self
        }
    }

    /// Closes connections that do not complete the upgrade request within `timeout`.
    pub fn with_handshake_timeout(self, timeout: Duration) -> Self {
        Self {
            handshake_timeout: Some(timeout),
            ..self
        }
    }

    /// Closes open connections that send nothing for `timeout`.
    pub fn with_idle_timeout(self, timeout: Duration) -> Self {
        Self {
            idle_timeout: Some(timeout),
            ..self
        }
    }

    /// Bounds the number of connections served at once.
    pub fn with_max_connections(self, limit: usize) -> Self {
        Self {
            max_connections: Some(limit),
            ..self
        }
    }

    pub(crate) fn payload_limit(&self) -> usize {
        self.max_payload_read.unwrap_or(MAX_PAYLOAD_READ)
    }

    pub(crate) fn handshake_limit(&self) -> usize {
        self.max_handshake_size.unwrap_or(MAX_HANDSHAKE_SIZE)
    }
}
