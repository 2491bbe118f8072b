//! # tickws
//! A minimal WebSocket server (RFC 6455 subset) running directly on raw TCP sockets, built for
//! embedding inside a host application that polls for events once per tick.
//!
//! The server performs the HTTP/1.1 opening handshake itself, decodes masked client frames into
//! text messages and hands connection lifecycle events and messages to a single consumer through
//! a thread-safe queue. Nothing is delivered to application code until the host drains that queue,
//! so callbacks always run on the host's own thread and never concurrently with each other.
//!
//! # Components
//! - [`handshake`]: request head parsing, upgrade validation and the `101 Switching Protocols` reply.
//! - [`frame`]: frame header parsing, the pure [`frame::decode_frame`] and frame serialization.
//! - [`codec`]: streaming `tokio_util` codec built on the frame parser.
//! - [`connection`]: the per-connection state machine (`Handshaking -> Open -> Closed`).
//! - [`dispatcher`]: the multi-producer, single-consumer event queue with a non-blocking drain.
//! - [`server`]: accept loop, [`WebSocketServer`] façade and the [`Handler`] callbacks.
//!
//! # Features
//! - `simd`: validates UTF-8 payloads with `simdutf8` when [`Options::with_utf8`] is enabled.
//! - `json`: enables [`Message::json`] to deserialize message payloads.
//!
//! # Example
//! ```no_run
//! use std::time::Duration;
//! use tickws::{Callbacks, WebSocketServer};
//!
//! #[tokio::main]
//! async fn main() -> tickws::Result<()> {
//!     let mut server = WebSocketServer::new("127.0.0.1", 8080);
//!     server.start().await?;
//!
//!     let mut callbacks = Callbacks::new();
//!     callbacks.on_message(|message| println!("{}: {}", message.connection, message.data));
//!
//!     let mut tick = tokio::time::interval(Duration::from_millis(16));
//!     loop {
//!         tick.tick().await;
//!         server.poll(&mut callbacks);
//!     }
//! }
//! ```
//!
//! # Limitations
//! - Only single, unfragmented text frames are meaningful; other data opcodes are decoded as text.
//! - There is no outbound message API. The only frame the server ever writes is the Close reply.
//! - No read timeouts are applied unless configured through [`Options`].

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod codec;
pub mod connection;
pub mod dispatcher;
pub mod frame;
pub mod handshake;
mod mask;
mod options;
pub mod server;

use thiserror::Error;

pub use connection::{Connection, ConnectionId, ConnectionState};
pub use dispatcher::{Dispatcher, Event, EventSender, Message, MessageId};
pub use frame::{decode_frame, FrameError, OpCode};
pub use handshake::{build_handshake_response, validate_handshake, RequestHeader};
pub use options::{HandshakePolicy, Options};
pub use server::{Callbacks, Handler, WebSocketServer};

/// The maximum allowed payload size for reading, set to 1 MiB.
///
/// Frames declaring a larger payload are rejected and the connection is closed, since the
/// stream cannot be resynchronised past a payload that is never buffered.
pub const MAX_PAYLOAD_READ: usize = 1024 * 1024;

/// The maximum size of an HTTP request head accepted during the handshake, set to 8 KiB.
pub const MAX_HANDSHAKE_SIZE: usize = 8 * 1024;

/// GUID appended to `Sec-WebSocket-Key` before hashing, from RFC 6455 section 1.3.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// A result type for server operations, using [`WebSocketError`] as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Represents errors that can occur while running the server or serving a connection.
///
/// The variants fall into three groups:
///
/// - Handshake rejections, which close the offending connection without a reply
/// - Frame errors, most of which only drop the offending frame
/// - Server and I/O errors (bind failures, lifecycle misuse, socket errors)
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// The request line is missing or its method is not `GET`.
    #[error("Request method must be GET (got {0:?})")]
    InvalidMethod(String),

    /// The request does not carry a `Host` header.
    #[error("Host header is missing")]
    MissingHost,

    /// Indicates that the HTTP "Upgrade" header is either missing or does not contain
    /// the required "websocket" value during connection handshake.
    #[error("Invalid upgrade header")]
    InvalidUpgradeHeader,

    /// Indicates that the HTTP "Connection" header is either missing or does not contain
    /// the required "Upgrade" value during connection handshake.
    #[error("Invalid connection header")]
    InvalidConnectionHeader,

    /// Occurs during handshake when the required "Sec-WebSocket-Key" header is missing from
    /// the client request.
    #[error("Sec-WebSocket-Key header is missing")]
    MissingSecWebSocketKey,

    /// Returned when the "Sec-WebSocket-Version" header is not set to 13 during handshake.
    #[error("Sec-Websocket-Version must be 13")]
    InvalidSecWebsocketVersion,

    /// The request head grew past the configured limit without a terminating blank line.
    #[error("Handshake request exceeds {0} bytes")]
    HandshakeTooLarge(usize),

    /// A configured timeout elapsed while waiting on the peer.
    #[error("Timed out waiting for the peer")]
    Timeout,

    /// The peer closed the stream, or sent a Close frame.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The configured bind address is empty or does not resolve.
    #[error("Invalid bind address: {0}")]
    InvalidAddress(String),

    /// [`WebSocketServer::start`] was called on a server that is already running.
    #[error("Server already started")]
    AlreadyStarted,

    /// A frame could not be decoded.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Wraps standard I/O errors such as connection resets or bind failures.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl WebSocketError {
    /// Returns `true` if the error is a rejected handshake request.
    pub fn is_handshake_rejection(&self) -> bool {
        matches!(
            self,
            Self::InvalidMethod(_)
                | Self::MissingHost
                | Self::InvalidUpgradeHeader
                | Self::InvalidConnectionHeader
                | Self::MissingSecWebSocketKey
                | Self::InvalidSecWebsocketVersion
                | Self::HandshakeTooLarge(_)
        )
    }

    /// Returns `true` if the error ends the connection it occurred on.
    ///
    /// Only malformed single frames are recoverable; everything else either desynchronises
    /// the stream or means the socket is gone.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Frame(err) => err.is_fatal(),
            _ => true,
        }
    }
}
