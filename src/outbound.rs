//! Host → view command channel.
//!
//! The view opens a WebSocket to this server as soon as it loads. The host
//! pushes `{"type":"eval","id":N,"javascript":...}` frames and blocks until the
//! view answers on the same connection. Requests are strictly single-flight:
//! `send` holds the flight lock for the whole round trip, so concurrent callers
//! queue behind each other instead of racing for the pending slot.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::document::ScriptEvaluator;
use crate::error::{BridgeError, BridgeResult};
use crate::lock;

/// First frame a view sends after the socket opens.
pub const HANDSHAKE: &str = "connect";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// The view closed the socket with a close frame.
    Graceful,
    /// The connection failed or dropped without a close frame.
    Abnormal(String),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum CommandFrame<'a> {
    Eval { id: u64, javascript: &'a str },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ReplyEnvelope {
    Result {
        id: u64,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
}

enum Reply {
    Correlated {
        id: u64,
        outcome: Result<String, String>,
    },
    Raw(String),
}

impl Reply {
    fn parse(text: &str) -> Self {
        match serde_json::from_str::<ReplyEnvelope>(text) {
            Ok(ReplyEnvelope::Result { id, result, error }) => Reply::Correlated {
                id,
                outcome: match error {
                    Some(message) => Err(message),
                    None => Ok(result.unwrap_or_default()),
                },
            },
            Err(_) => Reply::Raw(text.to_string()),
        }
    }
}

struct PendingRequest {
    id: u64,
    reply: SyncSender<Result<String, String>>,
}

struct Peer {
    connection: u64,
    outgoing: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct PeerSlot {
    active: Option<Peer>,
    accepted: u64,
    last_disconnect: Option<Disconnect>,
}

struct ChannelShared {
    peer: Mutex<PeerSlot>,
    peer_changed: Condvar,
    pending: Mutex<Option<PendingRequest>>,
    flight: Mutex<()>,
    next_request: AtomicU64,
    next_connection: AtomicU64,
    timeout: Duration,
}

impl ChannelShared {
    fn attach(&self, outgoing: mpsc::UnboundedSender<Message>) -> u64 {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
        let mut slot = lock(&self.peer);
        if let Some(previous) = slot.active.replace(Peer {
            connection,
            outgoing,
        }) {
            info!(
                target: "outbound",
                previous = previous.connection,
                connection,
                "new view connection replaces the previous one"
            );
            let _ = previous.outgoing.send(Message::Close(None));
            lock(&self.pending).take();
        }
        slot.accepted += 1;
        drop(slot);
        self.peer_changed.notify_all();
        connection
    }

    fn detach(&self, connection: u64, outcome: Disconnect) -> bool {
        let mut slot = lock(&self.peer);
        let is_active = slot
            .active
            .as_ref()
            .is_some_and(|peer| peer.connection == connection);
        if is_active {
            slot.active = None;
            slot.last_disconnect = Some(outcome);
            // Dropping the sender wakes the waiter with `NotConnected`.
            lock(&self.pending).take();
        }
        drop(slot);
        self.peer_changed.notify_all();
        is_active
    }

    fn disconnect_all(&self) {
        let mut slot = lock(&self.peer);
        if let Some(peer) = slot.active.take() {
            let _ = peer.outgoing.send(Message::Close(None));
        }
        lock(&self.pending).take();
        drop(slot);
        self.peer_changed.notify_all();
    }

    fn resolve(&self, text: &str) {
        let reply = Reply::parse(text);
        let mut pending = lock(&self.pending);
        let Some(request) = pending.take() else {
            debug!(target: "outbound", "discarding reply with no pending request");
            return;
        };

        let outcome = match reply {
            Reply::Correlated { id, outcome } if id == request.id => outcome,
            Reply::Correlated { id, .. } => {
                debug!(
                    target: "outbound",
                    expected = request.id,
                    received = id,
                    "discarding stale reply"
                );
                *pending = Some(request);
                return;
            }
            Reply::Raw(text) => Ok(text),
        };

        let _ = request.reply.try_send(outcome);
    }
}

/// Host-side handle to the command channel. Cheap to clone.
#[derive(Clone)]
pub struct CommandChannel {
    shared: Arc<ChannelShared>,
}

impl CommandChannel {
    fn new(timeout: Duration) -> Self {
        Self {
            shared: Arc::new(ChannelShared {
                peer: Mutex::new(PeerSlot::default()),
                peer_changed: Condvar::new(),
                pending: Mutex::new(None),
                flight: Mutex::new(()),
                next_request: AtomicU64::new(0),
                next_connection: AtomicU64::new(0),
                timeout,
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared.peer).active.is_some()
    }

    /// Number of view connections accepted so far.
    pub fn accepted_connections(&self) -> u64 {
        lock(&self.shared.peer).accepted
    }

    pub fn last_disconnect(&self) -> Option<Disconnect> {
        lock(&self.shared.peer).last_disconnect.clone()
    }

    /// Blocks until a view is attached or `timeout` elapses.
    pub fn wait_for_peer(&self, timeout: Duration) -> bool {
        let slot = lock(&self.shared.peer);
        let (slot, _) = self
            .shared
            .peer_changed
            .wait_timeout_while(slot, timeout, |slot| slot.active.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot.active.is_some()
    }

    /// Blocks until no view is attached and returns how the last one left.
    pub fn wait_for_disconnect(&self, timeout: Duration) -> Option<Disconnect> {
        let slot = lock(&self.shared.peer);
        let (slot, _) = self
            .shared
            .peer_changed
            .wait_timeout_while(slot, timeout, |slot| slot.active.is_some())
            .unwrap_or_else(PoisonError::into_inner);
        if slot.active.is_some() {
            None
        } else {
            slot.last_disconnect.clone()
        }
    }

    /// Evaluates `script` in the view and returns its stringified result.
    ///
    /// Blocks the calling thread until the view replies, the view disconnects
    /// (`NotConnected`) or the request timeout elapses (`RequestTimeout`).
    /// Must not be called from the command server's own runtime.
    pub fn send(&self, script: &str) -> BridgeResult<String> {
        let shared = &self.shared;
        let _flight = lock(&shared.flight);

        let id = shared.next_request.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = serde_json::to_string(&CommandFrame::Eval {
            id,
            javascript: script,
        })
        .map_err(BridgeError::malformed)?;

        let (reply_tx, reply_rx) = sync_channel(1);
        {
            let slot = lock(&shared.peer);
            let peer = slot.active.as_ref().ok_or(BridgeError::NotConnected)?;
            *lock(&shared.pending) = Some(PendingRequest {
                id,
                reply: reply_tx,
            });
            if peer.outgoing.send(Message::Text(frame.into())).is_err() {
                lock(&shared.pending).take();
                return Err(BridgeError::NotConnected);
            }
        }

        let received = reply_rx.recv_timeout(shared.timeout);
        lock(&shared.pending).take();

        match received {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(message)) => Err(BridgeError::Script(message)),
            Err(RecvTimeoutError::Timeout) => {
                warn!(target: "outbound", id, timeout = ?shared.timeout, "view did not reply");
                Err(BridgeError::RequestTimeout(shared.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(BridgeError::NotConnected),
        }
    }
}

impl ScriptEvaluator for CommandChannel {
    fn evaluate(&self, script: &str) -> BridgeResult<String> {
        self.send(script)
    }
}

/// The background WebSocket server backing a [`CommandChannel`].
///
/// Runs on its own thread with a dedicated runtime; dropping the server (or
/// calling [`CommandServer::shutdown`]) closes the view connection and fails
/// any in-flight request with `NotConnected`.
pub struct CommandServer {
    addr: SocketAddr,
    channel: CommandChannel,
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CommandServer {
    pub fn start(addr: SocketAddr, request_timeout: Duration) -> BridgeResult<Self> {
        let channel = CommandChannel::new(request_timeout);
        let shared = Arc::clone(&channel.shared);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<io::Result<SocketAddr>>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let thread = thread::Builder::new()
            .name("webbridge-outbound".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                runtime.block_on(serve(addr, shared, ready_tx, shutdown_rx));
            })?;

        let addr = ready_rx
            .recv()
            .map_err(|_| io::Error::other("command server exited during startup"))??;

        Ok(Self {
            addr,
            channel,
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn channel(&self) -> CommandChannel {
        self.channel.clone()
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(target: "outbound", "command server thread panicked");
            }
        }
    }
}

impl Drop for CommandServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve(
    addr: SocketAddr,
    shared: Arc<ChannelShared>,
    ready_tx: std::sync::mpsc::Sender<io::Result<SocketAddr>>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };
    let local_addr = match listener.local_addr() {
        Ok(local_addr) => local_addr,
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };
    let _ = ready_tx.send(Ok(local_addr));
    info!(target: "outbound", %local_addr, "command channel listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    tokio::spawn(handle_connection(Arc::clone(&shared), stream, remote));
                }
                Err(err) => {
                    warn!(target: "outbound", error = %err, "failed to accept view connection");
                }
            },
            _ = &mut shutdown_rx => break,
        }
    }

    shared.disconnect_all();
    info!(target: "outbound", %local_addr, "command channel stopped");
}

async fn handle_connection(shared: Arc<ChannelShared>, stream: TcpStream, remote: SocketAddr) {
    let socket = match tokio_tungstenite::accept_async(stream).await {
        Ok(socket) => socket,
        Err(err) => {
            warn!(target: "outbound", %remote, error = %err, "websocket handshake failed");
            return;
        }
    };
    let (mut sink, mut incoming) = socket.split();
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
    let connection = shared.attach(outgoing_tx);
    info!(target: "outbound", %remote, connection, "view connected");

    let writer = tokio::spawn(async move {
        while let Some(message) = outgoing_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(err) = sink.send(message).await {
                debug!(target: "outbound", error = %err, "failed to write frame");
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut handshake_seen = false;
    let outcome = loop {
        match incoming.next().await {
            Some(Ok(Message::Text(text))) => {
                let text = text.as_str();
                if !handshake_seen && text == HANDSHAKE {
                    handshake_seen = true;
                    debug!(target: "outbound", connection, "view handshake received");
                    continue;
                }
                handshake_seen = true;
                shared.resolve(text);
            }
            Some(Ok(Message::Close(_))) => break Disconnect::Graceful,
            Some(Ok(_)) => {}
            Some(Err(err)) => break Disconnect::Abnormal(err.to_string()),
            None => break Disconnect::Abnormal("connection dropped without a close frame".into()),
        }
    };

    if shared.detach(connection, outcome.clone()) {
        match &outcome {
            Disconnect::Graceful => {
                info!(target: "outbound", %remote, connection, "view disconnected gracefully");
            }
            Disconnect::Abnormal(reason) => {
                warn!(target: "outbound", %remote, connection, %reason, "view connection closed unexpectedly");
            }
        }
    }

    let _ = writer.await;
}
