use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

use crate::error::BridgeError;

type Callable = dyn Fn(&[Value]) -> anyhow::Result<()> + Send + Sync;

/// A host function the view can call through `bridge(key, ...params)`.
///
/// Clones share the same callable, so they resolve to the same registry key.
#[derive(Clone)]
pub struct HostFunction {
    name: Arc<str>,
    callable: Arc<Callable>,
}

impl HostFunction {
    pub fn new<F>(name: impl Into<String>, callable: F) -> Self
    where
        F: Fn(&[Value]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            callable: Arc::new(callable),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stable key derived from the callable's identity. The registry keeps a
    /// clone alive, so the address cannot be reused while the key is registered.
    pub fn key(&self) -> String {
        let address = Arc::as_ptr(&self.callable) as *const () as usize;
        format!("{}_{address:x}", self.name)
    }

    fn call(&self, params: &[Value]) -> anyhow::Result<()> {
        (self.callable)(params)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("name", &self.name)
            .field("key", &self.key())
            .finish()
    }
}

/// Maps bridge keys to host functions. Cheap to clone; clones share entries.
#[derive(Clone, Default)]
pub struct CallRegistry {
    entries: Arc<RwLock<HashMap<String, HostFunction>>>,
}

impl fmt::Debug for CallRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallRegistry")
            .field("functions", &self.len())
            .finish()
    }
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `function` and returns its key. Registering the same
    /// function again is a no-op that returns the same key.
    pub fn register(&self, function: &HostFunction) -> String {
        let key = function.key();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(key.clone())
            .or_insert_with(|| function.clone());
        key
    }

    /// Registers `function` and returns the script expression that calls it,
    /// suitable for inline handlers such as `onclick`.
    pub fn bridge_expression(&self, function: &HostFunction) -> String {
        let key = self.register(function);
        format!("bridge({})", crate::injector::js_literal(&key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls the function registered under `key` with positional `params`.
    pub fn invoke(&self, key: &str, params: &[Value]) -> Result<(), BridgeError> {
        // Release the lock before calling so the function may register others.
        let function = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownFunction(key.to_string()))?;

        function
            .call(params)
            .map_err(|source| BridgeError::Invocation {
                function: function.name().to_string(),
                source,
            })
    }
}
