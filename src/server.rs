//! # Server
//!
//! The accept loop and the [`WebSocketServer`] façade the host application talks to.
//!
//! Connections are served on tokio tasks. Their events only reach application code when the
//! host calls [`WebSocketServer::poll`] (or [`WebSocketServer::drain`]) from its own loop, so
//! [`Handler`] methods run on the host's thread, one at a time, in queue order.
use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::Semaphore,
    task::JoinHandle,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    connection::{Connection, ConnectionHandler, ConnectionId},
    dispatcher::{Dispatcher, Event, EventSender, Message},
    Options, Result, WebSocketError,
};

/// Receives server events during [`WebSocketServer::poll`].
///
/// Every method defaults to doing nothing, so implementors only override what they need.
///
/// ```rust
/// use tickws::{Handler, Message};
///
/// #[derive(Default)]
/// struct Chat {
///     lines: Vec<String>,
/// }
///
/// impl Handler for Chat {
///     fn on_message(&mut self, message: &Message) {
///         self.lines.push(format!("{}: {}", message.connection.id, message.data));
///     }
/// }
/// ```
pub trait Handler {
    /// A client completed the handshake.
    fn on_open(&mut self, _connection: &Connection) {}

    /// A client sent a text message.
    fn on_message(&mut self, _message: &Message) {}

    /// A previously opened connection was closed.
    fn on_close(&mut self, _connection: &Connection) {}
}

type ConnectionCallback = Box<dyn FnMut(&Connection)>;
type MessageCallback = Box<dyn FnMut(&Message)>;

/// A [`Handler`] built from closures.
///
/// Any number of closures may be registered per event; they run in registration order.
#[derive(Default)]
pub struct Callbacks {
    open: Vec<ConnectionCallback>,
    message: Vec<MessageCallback>,
    close: Vec<ConnectionCallback>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `f` to run when a connection opens.
    pub fn on_open<F>(&mut self, f: F) -> &mut Self
    where
        F: FnMut(&Connection) + 'static,
    {
        self.open.push(Box::new(f));
        self
    }

    /// Registers `f` to run for every message.
    pub fn on_message<F>(&mut self, f: F) -> &mut Self
    where
        F: FnMut(&Message) + 'static,
    {
        self.message.push(Box::new(f));
        self
    }

    /// Registers `f` to run when a connection closes.
    pub fn on_close<F>(&mut self, f: F) -> &mut Self
    where
        F: FnMut(&Connection) + 'static,
    {
        self.close.push(Box::new(f));
        self
    }
}

impl Handler for Callbacks {
    fn on_open(&mut self, connection: &Connection) {
        self.open.iter_mut().for_each(|f| f(connection));
    }

    fn on_message(&mut self, message: &Message) {
        self.message.iter_mut().for_each(|f| f(message));
    }

    fn on_close(&mut self, connection: &Connection) {
        self.close.iter_mut().for_each(|f| f(connection));
    }
}

/// Delivers one event to `handler`.
pub fn dispatch<H: Handler + ?Sized>(handler: &mut H, event: &Event) {
    match event {
        Event::Open(connection) => handler.on_open(connection),
        Event::Message(message) => handler.on_message(message),
        Event::Close(connection) => handler.on_close(connection),
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(err.kind(), ConnectionAborted | ConnectionReset | Interrupted)
}

/// Accepts connections and spawns one tracked task per connection.
struct AcceptLoop {
    listener: TcpListener,
    options: Arc<Options>,
    events: EventSender,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    limit: Option<Arc<Semaphore>>,
}

impl AcceptLoop {
    async fn run(self) {
        loop {
            let permit = match &self.limit {
                Some(limit) => tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    permit = limit.clone().acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                },
                None => None,
            };

            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(err) if is_transient(&err) => {
                    log::debug!("accept failed: {}", err);
                    continue;
                }
                Err(err) => {
                    log::error!("accept loop stopped: {}", err);
                    break;
                }
            };

            self.spawn(stream, peer_addr, permit);
        }

        log::debug!("accept loop exited");
    }

    fn spawn(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        permit: Option<tokio::sync::OwnedSemaphorePermit>,
    ) {
        if let Err(err) = stream.set_nodelay(true) {
            log::debug!("set_nodelay failed for {}: {}", peer_addr, err);
        }

        let connection = Connection::new(ConnectionId::next(), Some(peer_addr));
        log::debug!("{}: accepted", connection);

        let handler = ConnectionHandler::new(
            stream,
            connection,
            Arc::clone(&self.options),
            self.events.clone(),
            self.shutdown.child_token(),
        );

        self.tracker.spawn(async move {
            handler.run().await;
            drop(permit);
        });
    }
}

/// State that only exists while the server runs.
struct Running {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    accept: JoinHandle<()>,
}

/// A WebSocket server polled from a host loop.
///
/// ```no_run
/// use tickws::{Callbacks, Options, WebSocketServer};
///
/// # async fn run() -> tickws::Result<()> {
/// let mut server = WebSocketServer::new("0.0.0.0", 9001)
///     .with_options(Options::default().with_max_connections(64));
/// server.start().await?;
///
/// let mut callbacks = Callbacks::new();
/// callbacks
///     .on_open(|conn| println!("{} connected", conn))
///     .on_close(|conn| println!("{} left", conn));
///
/// // once per tick
/// server.poll(&mut callbacks);
///
/// server.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct WebSocketServer {
    address: String,
    port: u16,
    options: Arc<Options>,
    dispatcher: Dispatcher,
    running: Option<Running>,
}

impl WebSocketServer {
    /// Creates a server that will listen on `address:port` once started.
    ///
    /// `address` is a dotted-quad or a resolvable host name. Port `0` picks a free port; see
    /// [`local_addr`](Self::local_addr).
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            options: Arc::new(Options::default()),
            dispatcher: Dispatcher::new(),
            running: None,
        }
    }

    /// Sets the options applied to connections accepted after the next [`start`](Self::start).
    pub fn with_options(mut self, options: Options) -> Self {
        self.options = Arc::new(options);
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Binds the listening socket and starts accepting connections in the background.
    ///
    /// Returns the bound address.
    ///
    /// # Errors
    /// - [`WebSocketError::AlreadyStarted`] if the server is running.
    /// - [`WebSocketError::InvalidAddress`] if the address is empty or does not resolve.
    /// - [`WebSocketError::IoError`] if binding fails.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.running.is_some() {
            return Err(WebSocketError::AlreadyStarted);
        }

        let listener = self.bind().await?;
        let local_addr = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let accept = AcceptLoop {
            listener,
            options: Arc::clone(&self.options),
            events: self.dispatcher.sender(),
            tracker: tracker.clone(),
            shutdown: shutdown.clone(),
            limit: self
                .options
                .max_connections
                .map(|limit| Arc::new(Semaphore::new(limit))),
        };

        log::info!("WebSocket server listening on {}", local_addr);

        self.running = Some(Running {
            local_addr,
            shutdown,
            tracker,
            accept: tokio::spawn(accept.run()),
        });

        Ok(local_addr)
    }

    async fn bind(&self) -> Result<TcpListener> {
        if self.address.trim().is_empty() {
            return Err(WebSocketError::InvalidAddress(self.address.clone()));
        }

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((self.address.as_str(), self.port))
            .await
            .map_err(|_| WebSocketError::InvalidAddress(self.address.clone()))?
            .collect();
        if addrs.is_empty() {
            return Err(WebSocketError::InvalidAddress(self.address.clone()));
        }

        TcpListener::bind(&addrs[..]).await.map_err(|err| {
            log::error!("failed to bind {}:{}: {}", self.address, self.port, err);
            err.into()
        })
    }

    /// The bound address, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Removes and returns every queued event without blocking.
    pub fn drain(&mut self) -> Vec<Event> {
        self.dispatcher.drain()
    }

    /// Drains the queue and delivers each event to `handler`, oldest first.
    ///
    /// Never blocks. Returns the number of events delivered.
    pub fn poll<H: Handler + ?Sized>(&mut self, handler: &mut H) -> usize {
        let events = self.dispatcher.drain();
        for event in &events {
            dispatch(handler, event);
        }
        events.len()
    }

    /// Waits up to `timeout` for the next event.
    ///
    /// For hosts that would rather block on the queue than tick.
    pub async fn next_event(&mut self, timeout: Duration) -> Option<Event> {
        self.dispatcher.recv_timeout(timeout).await
    }

    /// Stops accepting, closes every connection and waits for their tasks to finish.
    ///
    /// Every connection that was open gets its Close event queued before this returns. Queued
    /// events stay available to [`poll`](Self::poll). Does nothing if the server is not running.
    pub async fn shutdown(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        running.shutdown.cancel();
        if let Err(err) = running.accept.await {
            log::error!("accept loop panicked: {}", err);
        }

        running.tracker.close();
        running.tracker.wait().await;

        log::info!("WebSocket server on {} stopped", running.local_addr);
    }
}

impl Drop for WebSocketServer {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.shutdown.cancel();
        }
    }
}
