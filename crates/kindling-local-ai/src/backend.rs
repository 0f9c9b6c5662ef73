//! The chat-backend capability set.

use std::path::Path;

use async_trait::async_trait;

use crate::client::ChatMessage;
use crate::error::LocalAIError;
use crate::server::LocalServer;

/// What an application needs from a chat backend.
///
/// [`LocalServer`] implements it for a locally supervised llama-server;
/// hosted APIs can implement it with a plain HTTP client.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Prepare the backend for use.
    async fn initialize(&self) -> Result<(), LocalAIError>;

    /// Make `model_path` the active model.
    async fn load_model(&self, model_path: &Path) -> Result<(), LocalAIError>;

    /// Models the backend can serve right now.
    async fn list_models(&self) -> Result<Vec<String>, LocalAIError>;

    /// Stream a reply, delivering visible text to `on_partial` in order.
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        on_partial: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<String, LocalAIError>;
}

#[async_trait]
impl ChatBackend for LocalServer {
    async fn initialize(&self) -> Result<(), LocalAIError> {
        LocalServer::initialize(self).await
    }

    async fn load_model(&self, model_path: &Path) -> Result<(), LocalAIError> {
        LocalServer::load_model(self, model_path).await.map(|_| ())
    }

    async fn list_models(&self) -> Result<Vec<String>, LocalAIError> {
        LocalServer::list_models(self).await
    }

    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        on_partial: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<String, LocalAIError> {
        LocalServer::stream_chat(self, messages, |text| on_partial(text)).await
    }
}
