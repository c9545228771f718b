//! Inbound call channel: the HTTP endpoint page script posts `bridge(...)`
//! calls to. It also serves the assembled page and static resources.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderValue, Method, StatusCode, Uri},
    middleware,
    response::{Html, IntoResponse, Response},
    routing::post,
    Router,
};
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info, trace, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::registry::CallRegistry;

/// Request body posted by the view's `bridge(key, ...params)`.
#[derive(Debug, Deserialize)]
pub struct BridgeRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: String,
    #[serde(default)]
    pub parameters: Vec<Value>,
}

impl BridgeRequest {
    pub fn parse(body: &[u8]) -> BridgeResult<Self> {
        serde_json::from_slice(body).map_err(BridgeError::malformed)
    }
}

/// The page currently published at `GET /`, shared with the window.
#[derive(Debug, Clone, Default)]
pub struct PageSlot(Arc<RwLock<Option<String>>>);

impl PageSlot {
    pub fn publish(&self, html: String) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = Some(html);
    }

    pub fn current(&self) -> Option<String> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[derive(Clone)]
struct InboundState {
    registry: CallRegistry,
    static_root: Arc<PathBuf>,
    page: PageSlot,
}

pub struct InboundServer {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl InboundServer {
    /// Binds `addr` and serves on a dedicated thread until shut down.
    pub fn start(
        addr: SocketAddr,
        registry: CallRegistry,
        static_root: PathBuf,
        page: PageSlot,
    ) -> BridgeResult<Self> {
        let state = InboundState {
            registry,
            static_root: Arc::new(static_root),
            page,
        };
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<io::Result<SocketAddr>>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let thread = thread::Builder::new()
            .name("webbridge-inbound".into())
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
                runtime.block_on(serve(addr, state, ready_tx, shutdown_rx));
            })?;

        let addr = ready_rx
            .recv()
            .map_err(|_| io::Error::other("inbound server exited during startup"))??;

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
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
                warn!(target: "inbound", "inbound server thread panicked");
            }
        }
    }
}

impl Drop for InboundServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve(
    addr: SocketAddr,
    state: InboundState,
    ready_tx: std::sync::mpsc::Sender<io::Result<SocketAddr>>,
    shutdown_rx: oneshot::Receiver<()>,
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
    info!(target: "inbound", addr = %local_addr, "call channel listening");

    let graceful = axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });
    if let Err(err) = graceful.await {
        error!(target: "inbound", error = %err, "inbound server error");
    }
}

fn router(state: InboundState) -> Router {
    Router::new()
        .route("/", post(handle_call).get(serve_page).options(preflight))
        .fallback(serve_static)
        .layer(middleware::map_response(allow_cross_origin))
        .with_state(state)
}

async fn allow_cross_origin(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    response
}

async fn preflight() -> StatusCode {
    StatusCode::OK
}

async fn handle_call(State(state): State<InboundState>, body: Bytes) -> StatusCode {
    let request = match BridgeRequest::parse(&body) {
        Ok(request) => request,
        Err(err) => {
            trace!(target: "inbound", error = %err, "rejected bridge request");
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };
    if request.kind != "bridge" {
        trace!(target: "inbound", kind = %request.kind, "unsupported request type");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    trace!(
        target: "inbound",
        function = %request.function,
        params = request.parameters.len(),
        "bridge call"
    );

    // Host functions may block, e.g. on the command channel.
    let registry = state.registry.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        registry.invoke(&request.function, &request.parameters)
    })
    .await;

    match outcome {
        Ok(Ok(())) => StatusCode::OK,
        Ok(Err(err)) => {
            warn!(target: "inbound", error = %err, "bridge call failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
        Err(err) => {
            error!(target: "inbound", error = %err, "bridge call panicked");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn serve_page(State(state): State<InboundState>) -> Response {
    match state.page.current() {
        Some(html) => Html(html).into_response(),
        None => read_static(&state.static_root, "/index.html").await,
    }
}

async fn serve_static(State(state): State<InboundState>, method: Method, uri: Uri) -> Response {
    match method {
        Method::OPTIONS => StatusCode::OK.into_response(),
        Method::GET | Method::HEAD => read_static(&state.static_root, uri.path()).await,
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

async fn read_static(root: &Path, request_path: &str) -> Response {
    let Some(mut path) = resolve_static(root, request_path) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if tokio::fs::metadata(&path)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
    {
        path.push("index.html");
    }

    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            trace!(target: "inbound", path = %path.display(), "static file");
            ([(header::CONTENT_TYPE, content_type(&path))], bytes).into_response()
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Maps a URL path onto `root`, refusing anything that would escape it.
fn resolve_static(root: &Path, request_path: &str) -> Option<PathBuf> {
    let decoded = percent_decode_str(request_path).decode_utf8().ok()?;
    let mut path = root.to_path_buf();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => return None,
            segment if segment.contains('\\') || segment.contains('\0') => return None,
            segment => path.push(segment),
        }
    }
    Some(path)
}

fn content_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js" | "mjs") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        Some("wasm") => "application/wasm",
        _ => "application/octet-stream",
    }
}
