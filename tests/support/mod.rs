#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use webbridge::document::{encode_reply, DomOp, LocalTree};
use webbridge::outbound::HANDSHAKE;
use webbridge::{BridgeResult, ScriptEvaluator};

/// Stand-in for the browser: applies the DOM operations the host sends to
/// its own copy of the page.
pub struct FakeView {
    markup: Mutex<String>,
    ops: Mutex<Vec<String>>,
}

impl FakeView {
    pub fn new(html: &str) -> Self {
        Self {
            markup: Mutex::new(LocalTree::parse_document(html).serialize()),
            ops: Mutex::new(Vec::new()),
        }
    }

    pub fn markup(&self) -> String {
        self.markup.lock().unwrap().clone()
    }

    /// Names of the operations applied so far, e.g. `appendHtml`.
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn handle(&self, script: &str) -> String {
        let Some(op) = DomOp::from_script(script) else {
            return String::from("undefined");
        };
        let name = serde_json::to_value(&op).unwrap()["op"]
            .as_str()
            .unwrap()
            .to_string();
        self.ops.lock().unwrap().push(name);

        let mut markup = self.markup.lock().unwrap();
        let mut tree = LocalTree::parse_document(&markup);
        let outcome = tree.apply(&op);
        if outcome.is_ok() && tree.changed() {
            *markup = tree.serialize();
        }
        encode_reply(&outcome)
    }
}

impl ScriptEvaluator for FakeView {
    fn evaluate(&self, script: &str) -> BridgeResult<String> {
        Ok(self.handle(script))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    /// `{"type":"result","id":N,"result":...}` like the injected bootstrap.
    Correlated,
    /// The bare result text.
    Raw,
}

enum PeerCommand {
    Close,
    Abort,
}

type Responder = Box<dyn Fn(&str) -> Option<String> + Send>;

/// A view connected to the command channel over a real WebSocket.
pub struct MockPeer {
    commands: mpsc::UnboundedSender<PeerCommand>,
    received: Arc<Mutex<Vec<String>>>,
    thread: Option<JoinHandle<()>>,
}

impl MockPeer {
    /// Connects and answers each eval frame with `respond(javascript)`;
    /// `None` leaves the request unanswered.
    pub fn connect<F>(url: &str, mode: ReplyMode, respond: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + 'static,
    {
        let url = url.to_string();
        let respond: Responder = Box::new(respond);
        let received = Arc::new(Mutex::new(Vec::new()));
        let frames = Arc::clone(&received);
        let (commands, mut command_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let thread = thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async move {
                let (mut socket, _) = connect_async(url.as_str()).await.expect("connect to command channel");
                socket
                    .send(Message::Text(HANDSHAKE.into()))
                    .await
                    .unwrap();
                ready_tx.send(()).unwrap();

                loop {
                    tokio::select! {
                        command = command_rx.recv() => match command {
                            Some(PeerCommand::Abort) => {
                                drop(socket);
                                break;
                            }
                            Some(PeerCommand::Close) | None => {
                                let _ = socket.close(None).await;
                                while let Some(Ok(_)) = socket.next().await {}
                                break;
                            }
                        },
                        message = socket.next() => match message {
                            Some(Ok(Message::Text(text))) => {
                                let text = text.as_str().to_string();
                                frames.lock().unwrap().push(text.clone());
                                let frame: Value = serde_json::from_str(&text).unwrap();
                                let script = frame["javascript"].as_str().unwrap_or_default();
                                if let Some(result) = respond(script) {
                                    let reply = match mode {
                                        ReplyMode::Correlated => json!({
                                            "type": "result",
                                            "id": frame["id"],
                                            "result": result,
                                        })
                                        .to_string(),
                                        ReplyMode::Raw => result,
                                    };
                                    if socket.send(Message::Text(reply.into())).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                            Some(Ok(_)) => {}
                        },
                    }
                }
            });
        });

        ready_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("peer connected");
        Self {
            commands,
            received,
            thread: Some(thread),
        }
    }

    /// Replies with the evaluated script itself.
    pub fn echo(url: &str) -> Self {
        Self::connect(url, ReplyMode::Correlated, |script| Some(script.to_string()))
    }

    /// Serves DOM operations from `view`.
    pub fn serving(url: &str, view: Arc<FakeView>) -> Self {
        Self::connect(url, ReplyMode::Correlated, move |script| {
            Some(view.handle(script))
        })
    }

    /// Raw eval frames received so far.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    /// Closes the socket with a close frame.
    pub fn close(mut self) {
        let _ = self.commands.send(PeerCommand::Close);
        self.join();
    }

    /// Drops the connection without a close frame.
    pub fn abort(mut self) {
        let _ = self.commands.send(PeerCommand::Abort);
        self.join();
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

impl Drop for MockPeer {
    fn drop(&mut self) {
        let _ = self.commands.send(PeerCommand::Close);
        self.join();
    }
}

pub fn command_url(addr: std::net::SocketAddr) -> String {
    format!("ws://{addr}/")
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Flag a host function can raise, for tests that wait on a call.
#[derive(Clone, Default)]
pub struct Flag(Arc<AtomicBool>);

impl Flag {
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
