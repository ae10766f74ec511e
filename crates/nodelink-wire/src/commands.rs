//! Named commands remote endpoints may invoke.
//!
//! Dispatch is an explicit table keyed by command name; the names are
//! advertised to peers in the local protocol description.

use async_trait::async_trait;
use nodelink_types::EndpointId;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

/// Executes one named command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Run the command for `sender`. An `Err` is reported back as a failure.
    async fn invoke(&self, sender: &EndpointId, arguments: Value) -> Result<Value, String>;
}

/// Registered command handlers by name.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous handler.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(name.into(), handler);
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.get(name).cloned()
    }

    pub fn names(&self) -> BTreeSet<String> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.keys().cloned().collect()
    }

    /// Run `name`, or report that no such command exists.
    pub async fn dispatch(
        &self,
        name: &str,
        sender: &EndpointId,
        arguments: Value,
    ) -> Result<Value, String> {
        match self.get(name) {
            Some(handler) => handler.invoke(sender, arguments).await,
            None => Err(format!("unknown command '{name}'")),
        }
    }
}
