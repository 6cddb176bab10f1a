//! Protocol module registry
//!
//! Handlers are keyed by `(category, message type)`. A category must be added
//! as a module before handlers can be registered under it; registering into a
//! missing module is a logged no-op.

use crate::context::TunnelContext;
use crate::error::HandlerError;
use edgetunnel_proto::{Category, Message, MessageType};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// A message handler
///
/// Handlers run on the inbound loop of the stream the message arrived on, so
/// anything slow (dialing, waiting on a socket) must be spawned.
pub type Handler =
    Arc<dyn Fn(Arc<TunnelContext>, Message) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Wrap an async fn or closure as a [`Handler`]
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Arc<TunnelContext>, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |ctx, msg| Box::pin(f(ctx, msg)))
}

#[derive(Default)]
pub struct ProtocolRegistry {
    modules: RwLock<HashMap<Category, HashMap<MessageType, Handler>>>,
}

impl std::fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolRegistry").finish_non_exhaustive()
    }
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an empty module for `category`; an existing module is kept
    pub async fn add_module(&self, category: Category) {
        let mut modules = self.modules.write().await;
        if modules.contains_key(&category) {
            return;
        }
        modules.insert(category, HashMap::new());
        info!(category = %category, "Protocol module added");
    }

    /// Drop a module and all its handlers
    pub async fn remove_module(&self, category: Category) -> bool {
        let removed = self.modules.write().await.remove(&category).is_some();
        if removed {
            info!(category = %category, "Protocol module removed");
        }
        removed
    }

    pub async fn module_is_loaded(&self, category: Category) -> bool {
        self.modules.read().await.contains_key(&category)
    }

    /// Register `handler` for `(category, msg_type)`, replacing any previous one
    ///
    /// Returns false (and registers nothing) if the module is not loaded.
    pub async fn register_handler(
        &self,
        category: Category,
        msg_type: MessageType,
        handler: Handler,
    ) -> bool {
        let mut modules = self.modules.write().await;
        match modules.get_mut(&category) {
            Some(handlers) => {
                handlers.insert(msg_type, handler);
                true
            }
            None => {
                warn!(
                    category = %category,
                    msg_type = %msg_type,
                    "Module not loaded, handler ignored"
                );
                false
            }
        }
    }

    pub async fn get_handler(&self, category: Category, msg_type: MessageType) -> Option<Handler> {
        self.modules
            .read()
            .await
            .get(&category)
            .and_then(|handlers| handlers.get(&msg_type))
            .cloned()
    }
}
