//! # Connection
//!
//! One accepted client and the task serving it.
//!
//! Each connection walks through `Accepted -> Handshaking -> Open -> Closed`:
//!
//! - **Handshaking**: the request head is read until its terminating blank line, parsed and
//!   validated. A valid request is answered with `101 Switching Protocols`; an invalid one is
//!   logged and the socket is closed without a reply.
//! - **Open**: frames are read and decoded one after another. Every non-empty text is enqueued
//!   as a [`Message`](crate::Message) in the order its frame arrived. A malformed frame is logged
//!   and skipped. A Close frame is answered with a Close frame and ends the connection.
//! - **Closed**: reached on end of stream, a socket error, a fatal frame error, a configured
//!   timeout or server shutdown. A Close event is enqueued if the connection had been opened.
//!
//! The task owns its stream exclusively, so no other task ever reads from or writes to it.
use std::{
    fmt,
    future::Future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::{
    codec::{Framed, FramedParts},
    sync::CancellationToken,
};

use crate::{
    codec::Codec,
    dispatcher::EventSender,
    frame::{Frame, OpCode},
    handshake::{build_handshake_response, read_request_head, RequestHeader},
    Options, Result, WebSocketError,
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier assigned when a connection is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Host-facing description of a connection.
///
/// The socket itself never leaves its task; this is what callbacks get to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub id: ConnectionId,
    /// Remote address, when the transport has one.
    pub peer_addr: Option<SocketAddr>,
}

impl Connection {
    pub fn new(id: ConnectionId, peer_addr: Option<SocketAddr>) -> Self {
        Self { id, peer_addr }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer_addr {
            Some(addr) => write!(f, "{} ({})", self.id, addr),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Handshaking,
    Open,
    Closed,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Any state may close; otherwise states only advance one step.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Accepted, Handshaking) | (Handshaking, Open) | (Accepted | Handshaking | Open, Closed)
        )
    }
}

async fn within<T>(limit: Option<Duration>, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| WebSocketError::Timeout)?,
        None => fut.await,
    }
}

/// Serves one connection from handshake to close.
pub(crate) struct ConnectionHandler<S> {
    stream: S,
    connection: Connection,
    state: ConnectionState,
    options: Arc<Options>,
    events: EventSender,
    shutdown: CancellationToken,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(
        stream: S,
        connection: Connection,
        options: Arc<Options>,
        events: EventSender,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            stream,
            connection,
            state: ConnectionState::Accepted,
            options,
            events,
            shutdown,
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        log::trace!("{}: {:?} -> {:?}", self.connection, self.state, next);
        self.state = next;
    }

    /// Runs the connection to completion and returns its final state.
    pub(crate) async fn run(mut self) -> ConnectionState {
        self.transition(ConnectionState::Handshaking);

        let shutdown = self.shutdown.clone();
        let limit = self.options.handshake_timeout;
        let handshake = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(WebSocketError::ConnectionClosed),
            res = within(limit, self.handshake()) => res,
        };

        let leftover = match handshake {
            Ok(leftover) => leftover,
            Err(err) => {
                if err.is_handshake_rejection() {
                    log::warn!("{}: handshake rejected: {}", self.connection, err);
                } else {
                    log::debug!("{}: handshake failed: {}", self.connection, err);
                }
                let _ = self.stream.shutdown().await;
                self.transition(ConnectionState::Closed);
                return self.state;
            }
        };

        self.transition(ConnectionState::Open);
        log::info!("{}: WebSocket client connected", self.connection);
        self.events.open(&self.connection);

        let Self {
            stream,
            connection,
            options,
            events,
            shutdown,
            ..
        } = self;

        let mut parts = FramedParts::new::<Frame>(stream, Codec::new(options.payload_limit()));
        parts.read_buf = leftover;
        let mut framed = Framed::from_parts(parts);

        serve(&mut framed, &connection, &options, &events, &shutdown).await;

        let _ = framed.get_mut().shutdown().await;
        log::info!("{}: WebSocket client disconnected", connection);
        events.close(&connection);

        ConnectionState::Closed
    }

    /// Reads and validates the upgrade request and writes the reply.
    ///
    /// Returns whatever the client sent after the request head.
    async fn handshake(&mut self) -> Result<BytesMut> {
        let mut buf = BytesMut::with_capacity(1024);
        let head_len =
            read_request_head(&mut self.stream, &mut buf, self.options.handshake_limit()).await?;
        let head = buf.split_to(head_len);

        let request = RequestHeader::parse(&head);
        log::debug!(
            "{}: {} {} HTTP/{}",
            self.connection,
            request.method,
            request.uri,
            request.http_version
        );
        self.options.handshake_policy.validate(&request)?;

        let response = build_handshake_response(&request)?;
        self.stream.write_all(&response).await?;
        self.stream.flush().await?;

        Ok(buf)
    }
}

/// The Open state: decodes frames until the connection ends.
async fn serve<S>(
    framed: &mut Framed<S, Codec>,
    connection: &Connection,
    options: &Options,
    events: &EventSender,
    shutdown: &CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                log::debug!("{}: closing for shutdown", connection);
                let _ = framed.send(Frame::close(Some(1001))).await;
                return;
            }
            next = within(options.idle_timeout, async { framed.next().await.transpose() }) => next,
        };

        let frame = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::debug!("{}: end of stream", connection);
                return;
            }
            Err(err) => {
                log::debug!("{}: read failed: {}", connection, err);
                return;
            }
        };

        if frame.opcode == OpCode::Close {
            log::debug!("{}: close frame received", connection);
            let _ = framed.send(Frame::close(frame.close_code())).await;
            return;
        }

        match frame.into_text(options.check_utf8) {
            Ok(text) if text.is_empty() => {
                log::debug!("{}: empty frame ignored", connection);
            }
            Ok(text) => {
                events.message(connection, text);
            }
            Err(err) => {
                log::warn!("{}: dropping frame: {}", connection, err);
            }
        }
    }
}
