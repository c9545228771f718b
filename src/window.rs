//! Window lifecycle: `display` assembles the document, `show` brings up both
//! bridge channels, hands the page to a [`ViewHost`] and tears everything down
//! once the host returns.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};
use url::Url;

use crate::config::WindowConfig;
use crate::document::Document;
use crate::error::{BridgeError, BridgeResult};
use crate::inbound::{InboundServer, PageSlot};
use crate::injector::Injection;
use crate::outbound::{CommandChannel, CommandServer, Disconnect};
use crate::registry::{CallRegistry, HostFunction};

/// The assembled page as handed to a [`ViewHost`].
#[derive(Debug, Clone)]
pub struct Page {
    pub title: String,
    pub position: (i32, i32),
    pub size: (u32, u32),
    pub html: String,
    /// Address of the inbound channel; it also serves `html` at `/`.
    pub url: Url,
    pub command_url: Url,
    /// Set when the host side asks the window to close.
    pub closer: WindowCloser,
}

/// Asks a shown window to close. Clones share the request, so a host
/// function can hold one and close its own window.
#[derive(Debug, Clone, Default)]
pub struct WindowCloser {
    requested: Arc<AtomicBool>,
}

impl WindowCloser {
    pub fn close(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Renders a page and runs its event loop. `present` returns when the view
/// is closed or `page.closer` is requested.
pub trait ViewHost {
    fn present(&mut self, page: &Page, channel: &CommandChannel) -> Result<()>;
}

/// What to show, passed to [`Window::display`].
#[derive(Debug, Clone, Default)]
pub struct DisplayOptions {
    pub html: String,
    /// Host functions callable from page script by name.
    pub functions: Vec<HostFunction>,
    /// Raw script fragments added to the bridge script.
    pub scripts: Vec<String>,
}

impl DisplayOptions {
    pub fn html(html: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            ..Self::default()
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let html = std::fs::read_to_string(path)
            .with_context(|| format!("read page {}", path.display()))?;
        Ok(Self::html(html))
    }

    pub fn with_function(mut self, function: HostFunction) -> Self {
        self.functions.push(function);
        self
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.scripts.push(script.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    Created,
    Displayed,
    Running,
    Closed,
}

pub struct Window {
    config: WindowConfig,
    registry: CallRegistry,
    state: WindowState,
    document: Option<Document>,
    functions: Vec<HostFunction>,
    scripts: Vec<String>,
    queued_listeners: Vec<(String, HostFunction)>,
    closer: WindowCloser,
}

impl Window {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            config,
            registry: CallRegistry::new(),
            state: WindowState::Created,
            document: None,
            functions: Vec::new(),
            scripts: Vec::new(),
            queued_listeners: Vec::new(),
            closer: WindowCloser::default(),
        }
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    pub fn state(&self) -> WindowState {
        self.state
    }

    pub fn registry(&self) -> &CallRegistry {
        &self.registry
    }

    /// Handle that closes the window while it is shown, e.g. from a host
    /// function. `show` then tears both channels down and returns.
    pub fn closer(&self) -> WindowCloser {
        self.closer.clone()
    }

    /// Requests close. A request made before `show` makes the view host
    /// return as soon as it starts.
    pub fn close(&self) {
        self.closer.close();
    }

    /// Registers `function` and returns the script expression calling it.
    pub fn register_function(&self, function: &HostFunction) -> String {
        self.registry.bridge_expression(function)
    }

    /// Exposes `function` to page script under its own name.
    pub fn expose(&mut self, function: HostFunction) -> BridgeResult<()> {
        match self.state {
            WindowState::Created | WindowState::Displayed => {
                self.add_function(function);
                Ok(())
            }
            _ => Err(BridgeError::precondition(
                "functions must be exposed before the window is shown",
            )),
        }
    }

    /// Parses the page and records its functions and scripts.
    pub fn display(&mut self, options: DisplayOptions) -> BridgeResult<()> {
        if self.state != WindowState::Created {
            return Err(BridgeError::precondition("window was already displayed"));
        }
        self.document = Some(Document::parse(&options.html, self.registry.clone()));
        for function in options.functions {
            self.add_function(function);
        }
        self.scripts.extend(options.scripts);
        self.state = WindowState::Displayed;
        Ok(())
    }

    fn add_function(&mut self, function: HostFunction) {
        let key = self.registry.register(&function);
        if self.functions.iter().all(|known| known.key() != key) {
            self.functions.push(function);
        }
    }

    pub fn document(&self) -> BridgeResult<Document> {
        self.document
            .clone()
            .ok_or_else(|| BridgeError::precondition("window has not been displayed yet"))
    }

    pub fn evaluate(&self, script: &str) -> BridgeResult<String> {
        self.document()?.evaluate(script)
    }

    /// Calls `function` whenever `event` fires on the document. Listeners
    /// added before `display` are wired by the bridge script.
    pub fn add_event_listener(&mut self, event: &str, function: &HostFunction) -> BridgeResult<()> {
        match (&self.document, self.state) {
            (_, WindowState::Closed) => Err(BridgeError::precondition("window is closed")),
            (None, _) => {
                self.registry.register(function);
                self.queued_listeners
                    .push((event.to_string(), function.clone()));
                Ok(())
            }
            (Some(document), _) => document.add_event_listener(event, function),
        }
    }

    /// Runs the window: starts both channels, injects the bridge, hands the
    /// page to `host` and blocks until it returns.
    pub fn show(&mut self, host: &mut impl ViewHost) -> Result<()> {
        let document = match (self.state, &self.document) {
            (WindowState::Displayed, Some(document)) => document.clone(),
            _ => {
                return Err(BridgeError::precondition(
                    "display must be called once before show",
                )
                .into())
            }
        };
        let bridge = &self.config.bridge;

        let commands = CommandServer::start(bridge.sender_addr(), bridge.request_timeout)
            .context("start command channel")?;
        let page_slot = PageSlot::default();
        let inbound = InboundServer::start(
            bridge.listener_addr(),
            self.registry.clone(),
            bridge.static_root.clone(),
            page_slot.clone(),
        )
        .context("start call channel")?;

        let url = channel_url("http", inbound.addr())?;
        let command_url = channel_url("ws", commands.addr())?;

        let injection = Injection::new(url.clone(), command_url.clone())
            .with_functions(self.functions.iter().cloned())
            .with_scripts(self.scripts.iter().cloned())
            .with_listeners(self.queued_listeners.drain(..))
            .with_css(self.config.css.clone())
            .link_resources(bridge.link_resources);
        let html = injection.apply(&document.markup());

        document.replace_markup(html.clone())?;
        let channel = commands.channel();
        document.go_live(Arc::new(channel.clone()))?;
        page_slot.publish(html.clone());
        self.state = WindowState::Running;

        let page = Page {
            title: self.config.title.clone(),
            position: self.config.position,
            size: self.config.size,
            html,
            url,
            command_url,
            closer: self.closer.clone(),
        };
        info!(target: "window", title = %page.title, url = %page.url, "window running");

        let outcome = host.present(&page, &channel);

        inbound.shutdown();
        commands.shutdown();
        self.state = WindowState::Closed;
        info!(target: "window", title = %page.title, "window closed");
        outcome
    }
}

fn channel_url(scheme: &str, addr: SocketAddr) -> Result<Url> {
    let host = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    let addr = SocketAddr::new(host, addr.port());
    Url::parse(&format!("{scheme}://{addr}/")).with_context(|| format!("build {scheme} url"))
}

/// Serves the page to whatever browser opens its URL. Returns on Ctrl-C, on
/// a close request, or once a view has connected and gone away again.
#[derive(Debug, Clone)]
pub struct BrowserViewHost {
    poll: Duration,
}

impl Default for BrowserViewHost {
    fn default() -> Self {
        Self {
            poll: Duration::from_millis(200),
        }
    }
}

impl ViewHost for BrowserViewHost {
    fn present(&mut self, page: &Page, channel: &CommandChannel) -> Result<()> {
        info!(target: "window", url = %page.url, "open the page in a browser; press Ctrl-C to quit");

        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        thread::Builder::new()
            .name("webbridge-signal".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        warn!(target: "window", error = %err, "cannot watch for Ctrl-C");
                        return;
                    }
                };
                if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
                    let _ = stop_tx.send(());
                }
            })
            .context("spawn signal watcher")?;

        let mut seen_view = false;
        loop {
            match stop_rx.recv_timeout(self.poll) {
                Ok(()) => {
                    info!(target: "window", "interrupted");
                    return Ok(());
                }
                // The watcher could not install a handler; keep tracking the view.
                Err(RecvTimeoutError::Disconnected) => thread::sleep(self.poll),
                Err(RecvTimeoutError::Timeout) => {}
            }

            if page.closer.is_requested() {
                info!(target: "window", "close requested");
                return Ok(());
            }

            if channel.is_connected() {
                seen_view = true;
            } else if seen_view {
                match channel.last_disconnect() {
                    Some(Disconnect::Abnormal(reason)) => {
                        warn!(target: "window", %reason, "view connection lost");
                    }
                    _ => info!(target: "window", "view closed"),
                }
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_requires_display() {
        let window = Window::new(WindowConfig::new("t"));
        assert!(matches!(
            window.document(),
            Err(BridgeError::Precondition(_))
        ));
        assert!(matches!(
            window.evaluate("1"),
            Err(BridgeError::Precondition(_))
        ));
    }

    #[test]
    fn display_only_once() {
        let mut window = Window::new(WindowConfig::new("t"));
        window.display(DisplayOptions::html("<p>a</p>")).unwrap();
        assert_eq!(window.state(), WindowState::Displayed);
        assert!(window.display(DisplayOptions::html("<p>b</p>")).is_err());
    }

    #[test]
    fn show_requires_display() {
        struct Never;
        impl ViewHost for Never {
            fn present(&mut self, _: &Page, _: &CommandChannel) -> Result<()> {
                panic!("must not be presented");
            }
        }
        let mut window = Window::new(WindowConfig::new("t"));
        assert!(window.show(&mut Never).is_err());
    }

    #[test]
    fn listeners_before_display_are_queued() {
        let mut window = Window::new(WindowConfig::new("t"));
        let function = HostFunction::new("loaded", |_| Ok(()));
        window.add_event_listener("DOMContentLoaded", &function).unwrap();
        assert!(window.registry().contains(&function.key()));
        assert_eq!(window.queued_listeners.len(), 1);
    }

    #[test]
    fn functions_are_kept_once_per_key() {
        let mut window = Window::new(WindowConfig::new("t"));
        let greet = HostFunction::new("greet", |_| Ok(()));
        window.expose(greet.clone()).unwrap();
        window
            .display(DisplayOptions::html("<p>a</p>").with_function(greet.clone()))
            .unwrap();
        assert_eq!(window.functions.len(), 1);
        assert_eq!(window.registry().len(), 1);
    }

    #[test]
    fn closer_clones_share_the_request() {
        let window = Window::new(WindowConfig::new("t"));
        let closer = window.closer();
        assert!(!closer.is_requested());
        window.close();
        assert!(closer.is_requested());
    }

    #[test]
    fn unspecified_hosts_become_loopback() {
        let url = channel_url("ws", "0.0.0.0:9000".parse().unwrap()).unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:9000/");
        let url = channel_url("http", "[::]:80".parse().unwrap()).unwrap();
        assert_eq!(url.as_str(), "http://[::1]/");
    }
}
