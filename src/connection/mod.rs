//! One physical connection: socket, writer task, read loop, lifecycle.
//!
//! ```text
//!   send() ─► StreamMultiplexer::allocate ─► WriterHandle ─► writer task ─► socket
//!                                                                             │
//!   caller ◄─ PendingRequest ◄─ StreamMultiplexer::resolve ◄─ read loop ◄─────┘
//! ```
//!
//! The read loop is the only reader of the socket and the only caller of
//! `resolve`. Any framing error, I/O error or EOF it hits closes the
//! connection and fails every pending request; nothing is retried in place.
//!
//! # Example
//!
//! ```no_run
//! use cqlwire_client::{Connection, ConnectionConfig, Request};
//!
//! # async fn run() -> cqlwire_client::Result<()> {
//! let addr = "127.0.0.1:9042".parse().unwrap();
//! let conn = Connection::connect(addr, ConnectionConfig::default()).await?;
//! let response = conn.send_request(&Request::query("SELECT now() FROM system.local")).await?;
//! println!("{:?}", response.body);
//! conn.drain().await;
//! # Ok(())
//! # }
//! ```

mod auth;
mod handshake;
mod heartbeat;
mod state;

pub use auth::{AuthProvider, Authenticator, PlainTextAuthProvider};
pub use state::ConnectionState;

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;

use crate::compression::{Compressor, NoCompression, SharedCompressor};
use crate::config::ConnectionConfig;
use crate::error::{Result, WireError};
use crate::multiplexer::StreamMultiplexer;
use crate::protocol::{flags, Frame, FrameBuffer, Header, Opcode, ProtocolVersion};
use crate::request::Request;
use crate::response::{parse_response, Event, Response, ResponseBody};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterHandle};
use state::StateCell;

/// Events buffered for the subscriber before new ones are dropped.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// 64KB read buffer.
const READ_BUFFER_SIZE: usize = 64 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared by the connection handle and its background tasks.
struct Shared {
    version: ProtocolVersion,
    config: ConnectionConfig,
    peer: String,
    mux: Arc<StreamMultiplexer>,
    writer: WriterHandle,
    state: StateCell,
    /// Set once, right before STARTUP.
    compressor: OnceLock<SharedCompressor>,
    started: Instant,
    last_activity_ms: AtomicU64,
    close_reason: Mutex<Option<WireError>>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl Shared {
    fn compressor(&self) -> Option<&dyn Compressor> {
        self.compressor.get().map(|c| &**c)
    }

    fn touch(&self) {
        let ms = self.started.elapsed().as_millis() as u64;
        self.last_activity_ms.store(ms, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    /// Register a background task to abort on close.
    fn track(&self, handle: AbortHandle) {
        let mut tasks = lock(&self.tasks);
        if self.state.get() == ConnectionState::Closed {
            handle.abort();
        } else {
            tasks.push(handle);
        }
    }

    /// Close the connection once too many ids wait on responses that
    /// never came.
    fn check_abandoned(&self) -> Result<()> {
        if !self.mux.is_saturated() {
            return Ok(());
        }
        let reason = WireError::ConnectionAborted(
            format!(
                "{} stream ids abandoned without a response",
                self.mux.abandoned()
            )
            .into(),
        );
        self.fail(reason.clone());
        Err(reason)
    }

    /// Send one frame and wait for its response, whatever the state.
    async fn execute(&self, opcode: Opcode, body: Bytes, timeout: Duration) -> Result<Response> {
        self.check_abandoned()?;
        let pending = self.mux.allocate(timeout)?;
        let stream_id = pending.stream_id();

        let mut frame_flags = 0u8;
        if self.config.use_beta {
            frame_flags |= flags::USE_BETA;
        }
        let body = match self.encode_body(opcode, body, &mut frame_flags) {
            Ok(body) => body,
            Err(e) => {
                pending.release_unsent();
                return Err(e);
            }
        };

        let header = Header::request(self.version, frame_flags, stream_id, opcode, body.len() as u32);
        tracing::trace!(stream_id, ?opcode, len = body.len(), peer = %self.peer, "sending request");
        if let Err(e) = self.writer.send(OutboundFrame::new(&header, body)).await {
            pending.release_unsent();
            return Err(e);
        }
        self.touch();

        let result = pending.wait().await;
        if matches!(result, Err(WireError::Timeout(_))) {
            let _ = self.check_abandoned();
        }
        result
    }

    fn encode_body(&self, opcode: Opcode, body: Bytes, frame_flags: &mut u8) -> Result<Bytes> {
        if u32::try_from(body.len()).is_err() {
            return Err(WireError::InvalidFrame(format!(
                "request body of {} bytes does not fit a frame",
                body.len()
            )));
        }
        match self.compressor.get() {
            // Startup messages always travel uncompressed.
            Some(c) if !matches!(opcode, Opcode::Startup | Opcode::Options) => {
                *frame_flags |= flags::COMPRESSION;
                c.compress(&body)
            }
            _ => Ok(body),
        }
    }

    /// Handle one inbound frame. An error closes the connection.
    fn dispatch(&self, frame: Frame, events: &mpsc::Sender<Event>) -> Result<()> {
        let stream_id = frame.stream_id();
        let response = parse_response(&frame, self.compressor(), self.config.max_frame_length as usize)?;

        if stream_id < 0 {
            match response.body {
                ResponseBody::Event(event) => self.forward_event(event, events),
                other => tracing::warn!(
                    stream_id,
                    kind = other.kind(),
                    peer = %self.peer,
                    "ignoring non-event frame on event stream"
                ),
            }
            return Ok(());
        }

        tracing::trace!(stream_id, kind = response.body.kind(), "response received");
        match self.mux.resolve(stream_id, Ok(response)) {
            Ok(_) => Ok(()),
            Err(WireError::OrphanedResponse(id)) => {
                tracing::warn!(stream_id = id, peer = %self.peer, "discarding orphaned response");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn forward_event(&self, event: Event, events: &mpsc::Sender<Event>) {
        tracing::debug!(?event, peer = %self.peer, "server event");
        match events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(?event, "event subscriber lagging, dropping event");
            }
            // Nobody subscribed.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Close the connection and fail every pending request with `reason`.
    ///
    /// Returns how many requests were aborted; 0 if already closed.
    fn fail(&self, reason: WireError) -> usize {
        if !self.state.transition(ConnectionState::Closed) {
            return 0;
        }
        match &reason {
            WireError::ConnectionClosed => {
                tracing::debug!(peer = %self.peer, "connection closed");
            }
            other => {
                tracing::error!(peer = %self.peer, error = %other, "connection failed");
            }
        }
        *lock(&self.close_reason) = Some(reason.clone());

        let aborted = self.mux.abort_all(reason);
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        aborted
    }
}

/// Single reader of the socket.
async fn read_loop<R>(shared: Arc<Shared>, mut reader: R, events: mpsc::Sender<Event>)
where
    R: AsyncRead + Unpin,
{
    let mut frames =
        FrameBuffer::with_max_frame_length(shared.version, shared.config.max_frame_length);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let reason = 'read: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break WireError::ConnectionAborted("connection closed by peer".into()),
            Ok(n) => n,
            Err(e) => break e.into(),
        };
        shared.touch();

        let batch = match frames.push(&buf[..n]) {
            Ok(batch) => batch,
            Err(e) => break e,
        };
        for frame in batch {
            if let Err(e) = shared.dispatch(frame, &events) {
                break 'read e;
            }
        }
    };

    shared.fail(reason);
}

/// Close the connection if the writer task dies.
async fn watch_writer(shared: Arc<Shared>, task: JoinHandle<Result<()>>) {
    match task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            shared.fail(e);
        }
        Err(e) if e.is_cancelled() => {}
        Err(e) => {
            shared.fail(WireError::DriverInternal(format!("writer task failed: {}", e)));
        }
    }
}

/// Builder for connections.
///
/// The compressor and auth provider are scoped to the connections this
/// builder opens; nothing is process-wide.
#[derive(Debug, Clone)]
pub struct ConnectionBuilder {
    config: ConnectionConfig,
    compressor: SharedCompressor,
    auth_provider: Option<Arc<dyn AuthProvider>>,
}

impl ConnectionBuilder {
    /// Create a builder with `config`, no compression and no authentication.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            compressor: Arc::new(NoCompression),
            auth_provider: None,
        }
    }

    /// Request body compression; used only if the server supports it.
    pub fn compressor(mut self, compressor: SharedCompressor) -> Self {
        self.compressor = compressor;
        self
    }

    /// Provider used when the server asks for authentication.
    pub fn auth_provider(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth_provider = Some(provider);
        self
    }

    /// Open a TCP connection to `addr`.
    pub async fn connect(self, addr: SocketAddr) -> Result<Connection> {
        self.connect_with(addr.to_string(), move || async move {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok::<_, io::Error>(stream)
        })
        .await
    }

    /// Open a connection over streams produced by `connector`.
    ///
    /// `connector` is called again for every protocol version retry.
    pub async fn connect_with<C, Fut, S>(self, peer: impl Into<String>, mut connector: C) -> Result<Connection>
    where
        C: FnMut() -> Fut,
        Fut: Future<Output = io::Result<S>>,
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.config.validate()?;
        let peer = peer.into();
        let mut version = self.config.protocol_version;

        loop {
            let stream = match tokio::time::timeout(self.config.connect_timeout, connector()).await {
                Ok(stream) => stream?,
                Err(_) => {
                    return Err(WireError::Handshake(format!(
                        "connect to {} timed out after {:?}",
                        peer, self.config.connect_timeout
                    )))
                }
            };

            match self.establish(stream, version, peer.clone()).await {
                Err(WireError::UnsupportedProtocolVersion(rejected))
                    if self.config.allow_version_downgrade =>
                {
                    let lower = version
                        .downgrade()
                        .ok_or(WireError::UnsupportedProtocolVersion(rejected))?;
                    tracing::debug!(%peer, from = %version, to = %lower, "protocol version rejected, retrying");
                    version = lower;
                }
                result => return result,
            }
        }
    }

    /// Run the startup exchange over an already open stream. No version
    /// retry is possible on a single stream.
    pub async fn from_stream<S>(self, peer: impl Into<String>, stream: S) -> Result<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.config.validate()?;
        let version = self.config.protocol_version;
        self.establish(stream, version, peer.into()).await
    }

    async fn establish<S>(&self, stream: S, version: ProtocolVersion, peer: String) -> Result<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        tracing::debug!(%peer, %version, "opening connection");
        let (reader, writer) = tokio::io::split(stream);
        let (writer, writer_task) = spawn_writer_task(writer, self.config.writer.clone());
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let shared = Arc::new(Shared {
            version,
            config: self.config.clone(),
            peer,
            mux: Arc::new(StreamMultiplexer::new(self.config.stream_capacity(version))),
            writer,
            state: StateCell::new(),
            compressor: OnceLock::new(),
            started: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            close_reason: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });

        shared.track(writer_task.abort_handle());
        let watcher = tokio::spawn(watch_writer(shared.clone(), writer_task));
        shared.track(watcher.abort_handle());
        let reader = tokio::spawn(read_loop(shared.clone(), reader, events_tx));
        shared.track(reader.abort_handle());

        if let Err(e) =
            handshake::perform(&shared, &self.compressor, self.auth_provider.as_deref()).await
        {
            shared.fail(e.clone());
            return Err(e);
        }
        if !shared.state.transition(ConnectionState::Ready) {
            let reason = lock(&shared.close_reason).clone();
            return Err(reason.unwrap_or(WireError::ConnectionClosed));
        }

        if !self.config.heartbeat_interval.is_zero() {
            let heartbeat = tokio::spawn(heartbeat::run(shared.clone()));
            shared.track(heartbeat.abort_handle());
        }

        tracing::debug!(
            peer = %shared.peer,
            %version,
            compression = shared.compressor().and_then(|c| c.name()),
            "connection ready"
        );
        Ok(Connection {
            shared,
            events: Mutex::new(Some(events_rx)),
        })
    }
}

/// A ready connection to one server.
///
/// Requests may be sent concurrently from many tasks. Dropping the handle
/// closes the connection.
pub struct Connection {
    shared: Arc<Shared>,
    events: Mutex<Option<mpsc::Receiver<Event>>>,
}

impl Connection {
    /// Builder with `config`.
    pub fn builder(config: ConnectionConfig) -> ConnectionBuilder {
        ConnectionBuilder::new(config)
    }

    /// Connect to `addr` without compression or authentication.
    pub async fn connect(addr: SocketAddr, config: ConnectionConfig) -> Result<Self> {
        ConnectionBuilder::new(config).connect(addr).await
    }

    /// Negotiated protocol version.
    #[inline]
    pub fn version(&self) -> ProtocolVersion {
        self.shared.version
    }

    /// Peer label used in logs.
    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// Receiver notified of every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Negotiated compression algorithm, if any.
    pub fn compression(&self) -> Option<&str> {
        self.shared.compressor().and_then(|c| c.name())
    }

    /// Requests awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.shared.mux.in_flight()
    }

    /// Stream ids free for new requests.
    pub fn available_streams(&self) -> usize {
        self.shared.mux.available()
    }

    /// Why the connection closed, once it has.
    pub fn close_reason(&self) -> Option<WireError> {
        lock(&self.shared.close_reason).clone()
    }

    /// Send a raw request body and wait for the response.
    ///
    /// # Errors
    ///
    /// - `ConnectionDraining` / `ConnectionClosed` when not accepting requests
    /// - `ExhaustedStreamIds` when every stream id is in use
    /// - `Timeout` when no response arrives within the request timeout
    /// - `Server` when the server answers with an ERROR
    /// - the connection's failure reason if it dies while waiting
    pub async fn send(&self, opcode: Opcode, body: Bytes) -> Result<Response> {
        self.state().accepts_requests()?;
        self.shared
            .execute(opcode, body, self.shared.config.request_timeout)
            .await?
            .into_result()
    }

    /// Encode and send a typed request.
    pub async fn send_request(&self, request: &Request) -> Result<Response> {
        self.send(request.opcode(), request.encode(self.version())).await
    }

    /// Subscribe this connection to server events.
    ///
    /// Events are delivered to the receiver from [`take_events`](Self::take_events).
    pub async fn register(&self, event_types: &[&str]) -> Result<()> {
        let request = Request::Register {
            events: event_types.iter().map(|s| s.to_string()).collect(),
        };
        let response = self.send_request(&request).await?;
        match response.body {
            ResponseBody::Ready => Ok(()),
            other => Err(WireError::InvalidFrame(format!(
                "unexpected {} in response to REGISTER",
                other.kind()
            ))),
        }
    }

    /// Take the receiver of server-pushed events. Only the first call
    /// returns it.
    pub fn take_events(&self) -> Option<mpsc::Receiver<Event>> {
        lock(&self.events).take()
    }

    /// Stop accepting requests, wait for in-flight ones up to the drain
    /// timeout, then close.
    ///
    /// Returns how many requests were still pending and got aborted.
    pub async fn drain(&self) -> usize {
        match self.state() {
            ConnectionState::Closed => return 0,
            ConnectionState::Draining => {}
            _ => {
                self.shared.state.transition(ConnectionState::Draining);
            }
        }
        tracing::debug!(peer = %self.shared.peer, in_flight = self.in_flight(), "draining connection");

        let timeout = self.shared.config.drain_timeout;
        match tokio::time::timeout(timeout, self.shared.mux.wait_idle()).await {
            Ok(()) => self.shared.fail(WireError::ConnectionClosed),
            Err(_) => {
                tracing::warn!(
                    peer = %self.shared.peer,
                    in_flight = self.in_flight(),
                    "drain timed out, aborting remaining requests"
                );
                self.shared
                    .fail(WireError::ConnectionAborted("drain timed out".into()))
            }
        }
    }

    /// Close now, failing pending requests with `ConnectionClosed`.
    pub fn close(&self) {
        self.shared.fail(WireError::ConnectionClosed);
    }

    /// Wait until the connection is closed.
    pub async fn closed(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.shared.peer)
            .field("version", &self.shared.version)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.fail(WireError::ConnectionClosed);
    }
}
