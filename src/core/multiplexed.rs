use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, instrument, warn};

use crate::core::command;
use crate::core::connection::{Connection, ConnectionReader, ConnectionWriter};
use crate::core::future::Reply;
use crate::proto::frame::Frame;
use crate::{Error, Result};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type Waiter = oneshot::Sender<Result<Frame>>;

/// A request sent to the multiplexer.
struct Request {
    frame: Frame,
    response_tx: Waiter,
}

enum Message {
    /// Frames written back to back, never interleaved with other requests.
    Requests(Vec<Request>),
    /// Frames written right away whatever the flush mode.
    Immediate(Vec<Request>),
    Flush,
    AutoFlush(bool),
    Close,
}

/// Lifecycle of a multiplexed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// The node is being dialed; requests are queued.
    Connecting,
    /// The transport is up.
    Connected,
    /// Dialing or the transport failed.
    Failed(String),
    /// The connection was closed locally.
    Closed,
}

impl ConnectionState {
    /// Returns true once the connection can no longer carry requests.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed(_) | ConnectionState::Closed)
    }
}

/// Options applied when a connection is opened.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Upper bound on dialing the node.
    pub connect_timeout: Duration,
    /// Name sent with `CLIENT SETNAME` right after connecting.
    pub client_name: Option<String>,
    /// Whether each request is written as soon as it is queued.
    pub auto_flush: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            client_name: None,
            auto_flush: true,
        }
    }
}

/// A handle to a multiplexed connection.
///
/// This handle is cheap to clone and can be shared across multiple tasks.
/// Requests are queued synchronously and written in issue order by a
/// background writer task; a reader task matches replies to requests in the
/// same order.
///
/// With auto-flush disabled, queued requests are staged and written together
/// on [`flush`](MultiplexedConnection::flush).
#[derive(Clone)]
pub struct MultiplexedConnection {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    address: String,
    sender: mpsc::UnboundedSender<Message>,
    state: watch::Receiver<ConnectionState>,
    closed: AtomicBool,
    auto_flush: AtomicBool,
}

struct Driver {
    requests: mpsc::UnboundedReceiver<Message>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl MultiplexedConnection {
    /// Opens a connection to `address` (`host:port`).
    ///
    /// Returns immediately; the node is dialed by a background task and
    /// requests issued meanwhile are queued. Dial failures are reported by
    /// [`ready`](MultiplexedConnection::ready) and by every queued request.
    /// Must be called from within a Tokio runtime.
    pub fn open(address: impl Into<String>, options: ConnectOptions) -> Self {
        let address = address.into();
        let (handle, driver) = Self::handle(address.clone(), options.auto_flush);
        tokio::spawn(drive(address, options, driver));
        handle
    }

    /// Multiplexes an already established connection.
    ///
    /// # Arguments
    ///
    /// * `connection` - The underlying connection to multiplex.
    /// * `address` - Address reported by [`address`](MultiplexedConnection::address).
    /// * `auto_flush` - Initial flush mode.
    pub fn new<S>(connection: Connection<S>, address: impl Into<String>, auto_flush: bool) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (handle, driver) = Self::handle(address.into(), auto_flush);
        driver.state.send_replace(ConnectionState::Connected);
        tokio::spawn(serve(connection, auto_flush, driver));
        handle
    }

    fn handle(address: String, auto_flush: bool) -> (Self, Driver) {
        let (sender, requests) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let handle = Self {
            inner: Arc::new(Inner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                address,
                sender,
                state: state_rx,
                closed: AtomicBool::new(false),
                auto_flush: AtomicBool::new(auto_flush),
            }),
        };
        let driver = Driver {
            requests,
            state: Arc::new(state_tx),
        };
        (handle, driver)
    }

    /// Process-unique identifier of this connection.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The `host:port` this connection targets.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Returns true if both handles share the same underlying connection.
    pub fn same_connection(&self, other: &MultiplexedConnection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        if self.inner.closed.load(Ordering::Acquire) {
            return ConnectionState::Closed;
        }
        self.inner.state.borrow().clone()
    }

    /// Returns true if the connection was closed or has failed.
    pub fn is_closed(&self) -> bool {
        self.state().is_terminal()
    }

    /// Waits until dialing finishes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the node could not be reached and
    /// [`Error::ConnectionClosed`] if the connection was closed.
    pub async fn ready(&self) -> Result<()> {
        let mut state = self.inner.state.clone();
        let current = match state.wait_for(|s| *s != ConnectionState::Connecting).await {
            Ok(current) => current.clone(),
            Err(_) => ConnectionState::Closed,
        };
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }
        match current {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Failed(message) => Err(Error::connection(self.address(), message)),
            _ => Err(Error::ConnectionClosed),
        }
    }

    /// Queues one request and returns the pending reply.
    pub fn dispatch(&self, frame: Frame) -> Reply {
        let (response_tx, response_rx) = oneshot::channel();
        self.submit(Message::Requests(vec![Request { frame, response_tx }]));
        Reply::new(response_rx)
    }

    /// Queues several requests that are written contiguously, with no other
    /// request in between.
    pub fn dispatch_batch(&self, frames: Vec<Frame>) -> Vec<Reply> {
        let (requests, replies) = requests(frames);
        self.submit(Message::Requests(requests));
        replies
    }

    /// Writes `frames` contiguously as soon as the writer sees them, even
    /// with auto-flush off. Staged requests stay staged.
    pub(crate) fn dispatch_now(&self, frames: Vec<Frame>) -> Vec<Reply> {
        let (requests, replies) = requests(frames);
        self.submit(Message::Immediate(requests));
        replies
    }

    /// Sends a command to the server and awaits the response.
    #[instrument(skip(self), fields(address = %self.inner.address), level = "debug")]
    pub async fn send_command(&self, frame: Frame) -> Result<Frame> {
        self.dispatch(frame).await
    }

    /// Switches between writing each request immediately and staging
    /// requests until [`flush`](MultiplexedConnection::flush).
    ///
    /// Turning auto-flush back on writes anything staged.
    pub fn set_auto_flush(&self, enabled: bool) {
        self.inner.auto_flush.store(enabled, Ordering::Release);
        let _ = self.inner.sender.send(Message::AutoFlush(enabled));
    }

    /// Returns the current flush mode.
    pub fn is_auto_flush(&self) -> bool {
        self.inner.auto_flush.load(Ordering::Acquire)
    }

    /// Writes every staged request.
    pub fn flush(&self) {
        let _ = self.inner.sender.send(Message::Flush);
    }

    /// Closes the connection. Outstanding requests fail with
    /// [`Error::ConnectionClosed`].
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!(address = %self.inner.address, id = self.inner.id, "closing connection");
            let _ = self.inner.sender.send(Message::Close);
        }
    }

    fn submit(&self, message: Message) {
        if self.inner.closed.load(Ordering::Acquire) {
            fail_message(message, || Error::ConnectionClosed);
            return;
        }
        if let Err(mpsc::error::SendError(message)) = self.inner.sender.send(message) {
            fail_message(message, || self.unavailable());
        }
    }

    fn unavailable(&self) -> Error {
        match &*self.inner.state.borrow() {
            ConnectionState::Failed(message) => Error::connection(self.address(), message),
            _ => Error::ConnectionClosed,
        }
    }
}

impl fmt::Debug for MultiplexedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiplexedConnection")
            .field("id", &self.inner.id)
            .field("address", &self.inner.address)
            .field("state", &self.state())
            .finish()
    }
}

fn requests(frames: Vec<Frame>) -> (Vec<Request>, Vec<Reply>) {
    frames
        .into_iter()
        .map(|frame| {
            let (response_tx, response_rx) = oneshot::channel();
            (Request { frame, response_tx }, Reply::new(response_rx))
        })
        .unzip()
}

fn fail_requests(requests: Vec<Request>, error: impl Fn() -> Error) {
    for request in requests {
        let _ = request.response_tx.send(Err(error()));
    }
}

fn fail_message(message: Message, error: impl Fn() -> Error) {
    if let Message::Requests(requests) | Message::Immediate(requests) = message {
        fail_requests(requests, error);
    }
}

impl Driver {
    fn fail(mut self, address: &str, message: String) {
        warn!(address, %message, "failed to connect");
        self.state
            .send_replace(ConnectionState::Failed(message.clone()));
        self.requests.close();
        while let Ok(pending) = self.requests.try_recv() {
            fail_message(pending, || Error::connection(address, &message));
        }
    }
}

#[instrument(skip(options, driver), level = "debug")]
async fn drive(address: String, options: ConnectOptions, driver: Driver) {
    let connect = TcpStream::connect(address.as_str());
    let stream = match tokio::time::timeout(options.connect_timeout, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return driver.fail(&address, e.to_string()),
        Err(_) => return driver.fail(&address, "connect timed out".to_string()),
    };
    let _ = stream.set_nodelay(true);

    let mut connection = Connection::new(stream);
    if let Some(name) = &options.client_name {
        if let Err(e) = apply_client_name(&mut connection, name).await {
            warn!(error = %e, "failed to set client name");
        }
    }

    debug!("connected");
    driver.state.send_replace(ConnectionState::Connected);
    serve(connection, options.auto_flush, driver).await;
}

async fn apply_client_name<S>(connection: &mut Connection<S>, name: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    connection
        .write_frame(&command::client_setname(name.to_string()).into_frame())
        .await?;
    command::frame_to_ok(connection.read_frame().await?)
}

async fn serve<S>(connection: Connection<S>, auto_flush: bool, driver: Driver)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, writer) = connection.split();
    let (waiter_tx, waiter_rx) = mpsc::unbounded_channel();

    tokio::spawn(run_reader(reader, waiter_rx, driver.state.clone()));
    run_writer(writer, driver, waiter_tx, auto_flush).await;
}

async fn terminated(state: &mut watch::Receiver<ConnectionState>) {
    let _ = state.wait_for(ConnectionState::is_terminal).await;
}

fn finish(state: &watch::Sender<ConnectionState>, next: ConnectionState) {
    state.send_if_modified(|current| {
        if current.is_terminal() {
            return false;
        }
        *current = next;
        true
    });
}

async fn run_writer<S>(
    mut writer: ConnectionWriter<S>,
    driver: Driver,
    waiter_tx: mpsc::UnboundedSender<Waiter>,
    mut auto_flush: bool,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Driver {
        mut requests,
        state,
    } = driver;
    let mut state_rx = state.subscribe();
    let mut staged: Vec<Waiter> = Vec::new();

    loop {
        let message = tokio::select! {
            message = requests.recv() => message,
            _ = terminated(&mut state_rx) => None,
        };
        let Some(message) = message else {
            break;
        };

        let flush_now = match message {
            Message::Requests(batch) => {
                for request in batch {
                    debug!(frame = ?request.frame, "staging frame");
                    writer.stage(&request.frame);
                    staged.push(request.response_tx);
                }
                auto_flush
            }
            Message::Immediate(batch) => {
                let (frames, waiters): (Vec<Frame>, Vec<Waiter>) = batch
                    .into_iter()
                    .map(|request| (request.frame, request.response_tx))
                    .unzip();
                debug!(frames = frames.len(), "writing frames ahead of staged ones");
                if let Err(e) = writer.write_now(&frames).await {
                    error!(error = ?e, "failed to write frames");
                    for tx in waiters {
                        let _ = tx.send(Err(Error::ConnectionClosed));
                    }
                    finish(&state, ConnectionState::Failed(e.to_string()));
                    break;
                }
                for tx in waiters {
                    if let Err(mpsc::error::SendError(tx)) = waiter_tx.send(tx) {
                        let _ = tx.send(Err(Error::ConnectionClosed));
                    }
                }
                false
            }
            Message::Flush => true,
            Message::AutoFlush(enabled) => {
                auto_flush = enabled;
                enabled
            }
            Message::Close => break,
        };

        if !flush_now || staged.is_empty() {
            continue;
        }
        if let Err(e) = writer.flush().await {
            error!(error = ?e, "failed to write frames");
            finish(&state, ConnectionState::Failed(e.to_string()));
            break;
        }
        for tx in staged.drain(..) {
            // Reader is gone.
            if let Err(mpsc::error::SendError(tx)) = waiter_tx.send(tx) {
                let _ = tx.send(Err(Error::ConnectionClosed));
            }
        }
    }

    for tx in staged.drain(..) {
        let _ = tx.send(Err(Error::ConnectionClosed));
    }
    finish(&state, ConnectionState::Closed);
    let _ = writer.shutdown().await;

    requests.close();
    while let Ok(pending) = requests.try_recv() {
        fail_message(pending, || Error::ConnectionClosed);
    }
}

async fn run_reader<S>(
    mut reader: ConnectionReader<S>,
    mut waiter_rx: mpsc::UnboundedReceiver<Waiter>,
    state: Arc<watch::Sender<ConnectionState>>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut state_rx = state.subscribe();
    loop {
        let tx = tokio::select! {
            tx = waiter_rx.recv() => match tx {
                Some(tx) => tx,
                None => break,
            },
            _ = terminated(&mut state_rx) => break,
        };

        let result = tokio::select! {
            result = reader.read_frame() => result,
            _ = terminated(&mut state_rx) => {
                let _ = tx.send(Err(Error::ConnectionClosed));
                break;
            }
        };

        match result {
            Ok(frame) => {
                debug!(?frame, "received frame");
                let _ = tx.send(Ok(frame));
            }
            Err(e) => {
                error!(error = ?e, "failed to read frame");
                finish(&state, ConnectionState::Failed(e.to_string()));
                let _ = tx.send(Err(e));
                break;
            }
        }
    }

    waiter_rx.close();
    while let Ok(tx) = waiter_rx.try_recv() {
        let _ = tx.send(Err(Error::ConnectionClosed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn pair(auto_flush: bool) -> (MultiplexedConnection, Connection<tokio::io::DuplexStream>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let conn = MultiplexedConnection::new(Connection::new(client), "duplex:0", auto_flush);
        (conn, Connection::new(server))
    }

    #[tokio::test]
    async fn test_replies_match_request_order() {
        let (conn, mut peer) = pair(true);
        let first = conn.dispatch(Frame::Integer(1));
        let second = conn.dispatch(Frame::Integer(2));

        for _ in 0..2 {
            let frame = peer.read_frame().await.unwrap();
            peer.write_frame(&frame).await.unwrap();
        }

        assert_eq!(first.await.unwrap(), Frame::Integer(1));
        assert_eq!(second.await.unwrap(), Frame::Integer(2));
    }

    #[tokio::test]
    async fn test_manual_flush_holds_requests() {
        let (conn, mut peer) = pair(false);
        assert!(!conn.is_auto_flush());
        let replies = conn.dispatch_batch(vec![Frame::Integer(1), Frame::Integer(2)]);
        let third = conn.dispatch(Frame::Integer(3));

        let early = tokio::time::timeout(Duration::from_millis(50), peer.read_frame()).await;
        assert!(early.is_err());

        conn.flush();
        for expected in 1..=3 {
            let frame = peer.read_frame().await.unwrap();
            assert_eq!(frame, Frame::Integer(expected));
            peer.write_frame(&frame).await.unwrap();
        }

        let mut values = Vec::new();
        for reply in replies {
            values.push(reply.await.unwrap());
        }
        values.push(third.await.unwrap());
        assert_eq!(
            values,
            vec![Frame::Integer(1), Frame::Integer(2), Frame::Integer(3)]
        );
    }

    #[tokio::test]
    async fn test_dispatch_now_bypasses_staging() {
        let (conn, mut peer) = pair(false);
        let staged = conn.dispatch(Frame::Integer(1));
        let urgent = conn.dispatch_now(vec![Frame::Integer(2), Frame::Integer(3)]);

        for expected in 2..=3 {
            let frame = peer.read_frame().await.unwrap();
            assert_eq!(frame, Frame::Integer(expected));
            peer.write_frame(&frame).await.unwrap();
        }
        let mut values = Vec::new();
        for reply in urgent {
            values.push(reply.await.unwrap());
        }
        assert_eq!(values, vec![Frame::Integer(2), Frame::Integer(3)]);
        assert!(!conn.is_auto_flush());

        let early = tokio::time::timeout(Duration::from_millis(50), peer.read_frame()).await;
        assert!(early.is_err());

        conn.flush();
        let frame = peer.read_frame().await.unwrap();
        assert_eq!(frame, Frame::Integer(1));
        peer.write_frame(&frame).await.unwrap();
        assert_eq!(staged.await.unwrap(), Frame::Integer(1));
    }

    #[tokio::test]
    async fn test_enabling_auto_flush_writes_staged() {
        let (conn, mut peer) = pair(false);
        let reply = conn.dispatch(Frame::Integer(7));
        conn.set_auto_flush(true);

        let frame = peer.read_frame().await.unwrap();
        peer.write_frame(&frame).await.unwrap();
        assert_eq!(reply.await.unwrap(), Frame::Integer(7));
        assert!(conn.is_auto_flush());
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_requests() {
        let (conn, mut peer) = pair(true);
        let reply = conn.dispatch(Frame::Integer(1));
        peer.read_frame().await.unwrap();

        conn.close();
        assert!(conn.is_closed());
        assert!(matches!(reply.await, Err(Error::ConnectionClosed)));
        assert!(matches!(
            conn.dispatch(Frame::Integer(2)).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_dial_failure_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let conn = MultiplexedConnection::open(addr.clone(), ConnectOptions::default());
        let reply = conn.dispatch(Frame::Integer(1));
        match conn.ready().await {
            Err(Error::Connection { address, .. }) => assert_eq!(address, addr),
            other => panic!("Expected Connection error, got {:?}", other),
        }
        assert!(matches!(reply.await, Err(Error::Connection { .. })));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_open_connects_and_sends() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream);
            let frame = conn.read_frame().await.unwrap();
            conn.write_frame(&frame).await.unwrap();
        });

        let conn = MultiplexedConnection::open(addr, ConnectOptions::default());
        let reply = conn.send_command(Frame::bulk("hello")).await.unwrap();
        assert_eq!(reply, Frame::bulk("hello"));
        conn.ready().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_identity() {
        let (a, _peer_a) = pair(true);
        let (b, _peer_b) = pair(true);
        assert_ne!(a.id(), b.id());
        assert!(a.same_connection(&a.clone()));
        assert!(!a.same_connection(&b));
    }
}
