//! A socket session: one TCP connection multiplexing any number of logical
//! requests.
//!
//! The session owns a sender task draining an outbound queue and a receiver
//! task correlating replies to pending entries by request id. Any I/O error
//! on either side is fatal to the session; recovery belongs to the
//! dispatcher above it.

use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{mpsc, oneshot, watch, Mutex as AsyncMutex},
};
use tracing::{debug, warn};

use super::pending::PendingTable;
use crate::{
    callback::BoxedCallback,
    error::{Error, ErrorKind, Result},
    event::{SessionOpenStateChanged, WatcherSet},
    options::{ClientOptions, ServerAddress},
    wire::{next_request_id, Message},
};

const CONNECTION_TRACING_EVENT_TARGET: &str = "mongowire::connection";

/// How deep the outbound queue runs before senders are made to wait.
const OUTBOUND_QUEUE_DEPTH: usize = 128;

/// How often the sweeper looks for pending entries past their deadline.
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

const STATE_OPENING: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_SHUTTING_DOWN: u8 = 2;
const STATE_CLOSED: u8 = 3;

/// The lifecycle state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Opening,
    Open,
    ShuttingDown,
    Closed,
}

enum Outbound {
    /// A complete frame (or back-to-back pair of frames) to put on the wire.
    Frames(Vec<u8>),
    /// Acknowledged once everything queued before it has reached the kernel.
    Flush(oneshot::Sender<()>),
}

/// How a send attempt failed.
pub(crate) enum SendError {
    /// The message never reached the queue; the callback is handed back so
    /// the dispatcher may retry on another session.
    Rejected {
        error: Error,
        callback: BoxedCallback,
    },
    /// The callback was already completed (a concurrent close consumed it).
    Failed(Error),
}

impl std::fmt::Debug for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Rejected { error, .. } => {
                f.debug_tuple("Rejected").field(error).finish()
            }
            SendError::Failed(error) => f.debug_tuple("Failed").field(error).finish(),
        }
    }
}

impl SendError {
    /// Consumes the attempt when no retry will happen, failing the returned
    /// callback so the sink still completes exactly once.
    pub(crate) fn fail(self) -> Error {
        match self {
            SendError::Rejected { error, callback } => {
                callback.fail(error.clone());
                error
            }
            SendError::Failed(error) => error,
        }
    }

    pub(crate) fn error(&self) -> &Error {
        match self {
            SendError::Rejected { error, .. } => error,
            SendError::Failed(error) => error,
        }
    }
}

/// A handle to one open connection. Clones share the underlying session.
#[derive(Clone)]
pub(crate) struct SocketSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    address: ServerAddress,
    state: AtomicU8,
    outbound: mpsc::Sender<Outbound>,
    pending: PendingTable,
    watchers: Mutex<WatcherSet<SessionOpenStateChanged>>,
    /// Serializes id assignment with enqueueing so frames hit the wire in
    /// registration order.
    send_lock: AsyncMutex<()>,
    shutdown: watch::Sender<bool>,
    socket_timeout: Option<Duration>,
}

impl SocketSession {
    /// Opens a TCP connection to `address` and starts the sender, receiver,
    /// and sweeper tasks.
    pub(crate) async fn connect(
        address: ServerAddress,
        options: &ClientOptions,
    ) -> Result<Self> {
        let connect = TcpStream::connect((address.host().to_string(), address.port()));
        let stream = match options.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| Error::from(ErrorKind::OperationTimedOut))??,
            None => connect.await?,
        };
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(SessionInner {
            address,
            state: AtomicU8::new(STATE_OPEN),
            outbound: outbound_tx,
            pending: PendingTable::new(),
            watchers: Mutex::new(WatcherSet::new()),
            send_lock: AsyncMutex::new(()),
            shutdown: shutdown_tx,
            socket_timeout: options.socket_timeout,
        });

        tokio::spawn(sender_task(
            Arc::clone(&inner),
            write_half,
            outbound_rx,
            shutdown_rx.clone(),
        ));
        tokio::spawn(receiver_task(
            Arc::clone(&inner),
            read_half,
            shutdown_rx.clone(),
        ));
        tokio::spawn(sweeper_task(Arc::clone(&inner), shutdown_rx));

        debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            address = %inner.address,
            "session opened"
        );

        Ok(Self { inner })
    }

    /// Assigns a fresh request id, enqueues `message`, and registers
    /// `callback` for the reply. Returns the request id.
    ///
    /// Messages the server never answers (writes without a paired
    /// `getLastError`) complete their callback as soon as they are queued.
    ///
    /// On failure the callback travels back inside the error whenever it has
    /// not been completed, so the dispatcher can retry on another session.
    pub(crate) async fn send(
        &self,
        message: &Message,
        callback: BoxedCallback,
        timeout: Option<Duration>,
    ) -> std::result::Result<i32, SendError> {
        let _guard = self.inner.send_lock.lock().await;

        if let Err(error) = self.sendable() {
            return Err(SendError::Rejected { error, callback });
        }

        let request_id = next_request_id();
        let frame = message.encode(request_id, 0);

        if message.expects_reply() {
            self.inner
                .pending
                .register(request_id, callback, timeout.or(self.inner.socket_timeout));
            if let Err(error) = self.enqueue(Outbound::Frames(frame)).await {
                return Err(match self.inner.pending.complete(request_id) {
                    Some(callback) => SendError::Rejected { error, callback },
                    None => SendError::Failed(error),
                });
            }
        } else {
            match self.enqueue(Outbound::Frames(frame)).await {
                Ok(()) => callback.deliver(Default::default()),
                Err(error) => return Err(SendError::Rejected { error, callback }),
            }
        }

        Ok(request_id)
    }

    /// Sends two messages back to back in one critical section; only the
    /// second is correlated with a reply. Used for write + `getLastError`
    /// pairs.
    pub(crate) async fn send_pair(
        &self,
        first: &Message,
        second: &Message,
        callback: BoxedCallback,
        timeout: Option<Duration>,
    ) -> std::result::Result<i32, SendError> {
        let _guard = self.inner.send_lock.lock().await;

        if let Err(error) = self.sendable() {
            return Err(SendError::Rejected { error, callback });
        }

        let first_id = next_request_id();
        let request_id = next_request_id();
        let mut frames = first.encode(first_id, 0);
        frames.extend_from_slice(&second.encode(request_id, 0));

        self.inner
            .pending
            .register(request_id, callback, timeout.or(self.inner.socket_timeout));
        if let Err(error) = self.enqueue(Outbound::Frames(frames)).await {
            return Err(match self.inner.pending.complete(request_id) {
                Some(callback) => SendError::Rejected { error, callback },
                None => SendError::Failed(error),
            });
        }

        Ok(request_id)
    }

    fn sendable(&self) -> Result<()> {
        match self.state() {
            SessionState::Open => Ok(()),
            SessionState::ShuttingDown => Err(ErrorKind::ShutdownInProgress.into()),
            _ => Err(ErrorKind::ConnectionNotAvailable {
                address: self.inner.address.clone(),
            }
            .into()),
        }
    }

    async fn enqueue(&self, outbound: Outbound) -> Result<()> {
        self.inner.outbound.send(outbound).await.map_err(|_| {
            ErrorKind::ConnectionNotAvailable {
                address: self.inner.address.clone(),
            }
            .into()
        })
    }

    /// Blocks until everything queued so far has been written to the kernel.
    pub(crate) async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Outbound::Flush(tx)).await?;
        rx.await
            .map_err(|_| Error::connection_lost(self.inner.address.to_string()))
    }

    /// Cancels a pending request. The message is already on the wire; the
    /// reply, if any, is discarded when it arrives.
    pub(crate) fn cancel(&self, request_id: i32) {
        self.inner.pending.cancel(request_id);
    }

    /// Closes immediately. Pending entries fail with `CONNECTION_LOST`.
    pub(crate) fn close(&self) {
        self.inner
            .close_with(Error::connection_lost(self.inner.address.to_string()));
    }

    /// Drains or aborts. With `force` false, queued writes are flushed
    /// first; either way, entries still awaiting replies fail with
    /// `SHUTDOWN_IN_PROGRESS`.
    pub(crate) async fn shutdown(&self, force: bool) {
        if !force {
            let _ = self
                .inner
                .state
                .compare_exchange(
                    STATE_OPEN,
                    STATE_SHUTTING_DOWN,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            let _ = self.flush().await;
        }
        self.inner.close_with(ErrorKind::ShutdownInProgress.into());
    }

    pub(crate) fn state(&self) -> SessionState {
        self.inner.state_enum()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Whether no requests are awaiting replies.
    pub(crate) fn is_idle(&self) -> bool {
        self.inner.pending.is_empty()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// The canonical name of the server this session talks to.
    pub(crate) fn server_name(&self) -> String {
        self.inner.address.to_string()
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.inner.address
    }

    /// Registers an observer notified when the session leaves OPEN.
    pub(crate) fn watch(&self) -> mpsc::UnboundedReceiver<SessionOpenStateChanged> {
        let (_, receiver) = self.inner.watchers.lock().unwrap().watch();
        receiver
    }
}

impl SessionInner {
    fn state_enum(&self) -> SessionState {
        match self.state.load(Ordering::SeqCst) {
            STATE_OPENING => SessionState::Opening,
            STATE_OPEN => SessionState::Open,
            STATE_SHUTTING_DOWN => SessionState::ShuttingDown,
            _ => SessionState::Closed,
        }
    }

    /// Transitions to CLOSED once, failing pending entries and notifying
    /// observers. Later calls are no-ops.
    fn close_with(&self, error: Error) {
        let previous = self.state.swap(STATE_CLOSED, Ordering::SeqCst);
        if previous == STATE_CLOSED {
            return;
        }

        // Stops the I/O tasks; dropping the write half closes the socket.
        let _ = self.shutdown.send(true);

        self.pending.fail_all(|| error.clone());

        debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            address = %self.address,
            "session closed"
        );

        self.watchers
            .lock()
            .unwrap()
            .broadcast(&SessionOpenStateChanged {
                address: self.address.clone(),
            });
    }
}

async fn sender_task(
    inner: Arc<SessionInner>,
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Outbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let item = tokio::select! {
            item = outbound.recv() => item,
            _ = shutdown.changed() => None,
        };
        let item = match item {
            Some(item) => item,
            None => break,
        };

        match item {
            Outbound::Frames(frame) => {
                if let Err(e) = write_half.write_all(&frame).await {
                    warn!(
                        target: CONNECTION_TRACING_EVENT_TARGET,
                        address = %inner.address,
                        error = %e,
                        "write failed"
                    );
                    inner.close_with(Error::connection_lost_caused_by(
                        inner.address.to_string(),
                        e,
                    ));
                    break;
                }
            }
            Outbound::Flush(ack) => {
                if write_half.flush().await.is_err() {
                    inner.close_with(Error::connection_lost(inner.address.to_string()));
                    break;
                }
                let _ = ack.send(());
            }
        }
    }
}

async fn receiver_task(
    inner: Arc<SessionInner>,
    mut read_half: OwnedReadHalf,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            next = Message::read_from(&mut read_half) => next,
            _ = shutdown.changed() => return,
        };

        match next {
            Ok((header, Message::Reply(reply))) => {
                match inner.pending.complete(header.response_to) {
                    Some(callback) => callback.deliver(reply),
                    // A reply to a cancelled or timed-out request.
                    None => debug!(
                        target: CONNECTION_TRACING_EVENT_TARGET,
                        address = %inner.address,
                        response_to = header.response_to,
                        "discarding uncorrelated reply"
                    ),
                }
            }
            Ok((header, message)) => {
                warn!(
                    target: CONNECTION_TRACING_EVENT_TARGET,
                    address = %inner.address,
                    op_code = ?message.op_code(),
                    request_id = header.request_id,
                    "unexpected non-reply message; closing session"
                );
                inner.close_with(Error::framing(format!(
                    "server sent a {:?} message",
                    message.op_code()
                )));
                return;
            }
            Err(error) => {
                // Framing or I/O failure: the stream can no longer be
                // trusted to be aligned on a message boundary.
                if inner.state_enum() != SessionState::Closed {
                    warn!(
                        target: CONNECTION_TRACING_EVENT_TARGET,
                        address = %inner.address,
                        error = %error,
                        "receive failed; closing session"
                    );
                    inner.close_with(Error::connection_lost(inner.address.to_string()));
                }
                return;
            }
        }
    }
}

async fn sweeper_task(inner: Arc<SessionInner>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => inner.pending.expire_overdue(Instant::now()),
            _ = shutdown.changed() => return,
        }
    }
}
