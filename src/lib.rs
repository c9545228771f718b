// Library exports for embedding and tests

pub mod config;
pub mod document;
pub mod error;
pub mod identity;
pub mod inbound;
pub mod injector;
pub mod outbound;
pub mod registry;
pub mod window;

use std::sync::{Mutex, MutexGuard, PoisonError};

// Re-export commonly used types
pub use config::{BridgeConfig, WindowConfig};
pub use document::{ClassList, Document, ElementHandle, KnownAttribute, ScriptEvaluator};
pub use error::{BridgeError, BridgeResult};
pub use identity::IdentityTag;
pub use inbound::InboundServer;
pub use outbound::{CommandChannel, CommandServer, Disconnect};
pub use registry::{CallRegistry, HostFunction};
pub use window::{
    BrowserViewHost, DisplayOptions, Page, ViewHost, Window, WindowCloser, WindowState,
};

/// Locks `mutex`, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
