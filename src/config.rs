use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

pub const DEFAULT_LISTENER_PORT: u16 = 22943;
pub const DEFAULT_SENDER_PORT: u16 = 22944;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Network and runtime settings for the two bridge channels.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub host: IpAddr,
    /// Port of the inbound call channel (view → host).
    pub listener_port: u16,
    /// Port of the outbound command channel (host → view).
    pub sender_port: u16,
    pub request_timeout: Duration,
    /// Directory served by the inbound channel's GET fallback.
    pub static_root: PathBuf,
    /// Insert a `<base>` element so relative URLs load from the inbound server.
    pub link_resources: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listener_port: DEFAULT_LISTENER_PORT,
            sender_port: DEFAULT_SENDER_PORT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            static_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            link_resources: true,
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("WEBBRIDGE_HOST") {
            config.host = host.parse().context("parse WEBBRIDGE_HOST")?;
        }
        if let Ok(port) = std::env::var("WEBBRIDGE_LISTENER_PORT") {
            config.listener_port = port.parse().context("parse WEBBRIDGE_LISTENER_PORT")?;
        }
        if let Ok(port) = std::env::var("WEBBRIDGE_SENDER_PORT") {
            config.sender_port = port.parse().context("parse WEBBRIDGE_SENDER_PORT")?;
        }
        if let Ok(millis) = std::env::var("WEBBRIDGE_TIMEOUT_MS") {
            let millis: u64 = millis.parse().context("parse WEBBRIDGE_TIMEOUT_MS")?;
            config.request_timeout = Duration::from_millis(millis);
        }
        if let Ok(root) = std::env::var("WEBBRIDGE_STATIC_ROOT") {
            config.static_root = PathBuf::from(root);
        }

        Ok(config)
    }

    /// Configuration bound to ephemeral ports, for tests and embedding.
    pub fn ephemeral() -> Self {
        Self {
            listener_port: 0,
            sender_port: 0,
            ..Self::default()
        }
    }

    pub fn listener_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.listener_port)
    }

    pub fn sender_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.sender_port)
    }
}

/// Presentation settings handed to the view host.
#[derive(Debug, Clone)]
pub struct WindowConfig {
    pub title: String,
    pub position: (i32, i32),
    pub size: (u32, u32),
    pub css: Option<String>,
    pub bridge: BridgeConfig,
}

impl WindowConfig {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            position: (300, 300),
            size: (900, 600),
            css: None,
            bridge: BridgeConfig::default(),
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.size = (width, height);
        self
    }

    pub fn with_position(mut self, x: i32, y: i32) -> Self {
        self.position = (x, y);
        self
    }

    pub fn with_css(mut self, css: impl Into<String>) -> Self {
        self.css = Some(css.into());
        self
    }

    pub fn with_css_file(self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let css = std::fs::read_to_string(path)
            .with_context(|| format!("read stylesheet {}", path.display()))?;
        Ok(self.with_css(css))
    }

    pub fn with_bridge(mut self, bridge: BridgeConfig) -> Self {
        self.bridge = bridge;
        self
    }
}
