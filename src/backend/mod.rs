//! The generative backend the proxy forwards to.
//!
//! Handlers never talk to a concrete client: they receive an
//! `Arc<dyn Backend>` created once at startup, which keeps the adapter layer
//! testable against scripted backends.

pub mod gemini;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::Result;
use crate::translate::gemini_types::{
    BatchEmbedContentsRequest, BatchEmbedContentsResponse, GenerateContentRequest,
    GenerateContentResponse, ModelInfo,
};

pub use gemini::GeminiClient;

/// Incremental results of a streamed generation, in backend order.
pub type BackendStream = Pin<Box<dyn Stream<Item = Result<GenerateContentResponse>> + Send>>;

#[async_trait]
pub trait Backend: Send + Sync {
    /// One-shot generation.
    async fn generate(&self, model: &str, request: &GenerateContentRequest) -> Result<GenerateContentResponse>;

    /// Streamed generation. Errors opening the stream are returned directly;
    /// errors after that arrive as items.
    async fn stream_generate(&self, model: &str, request: &GenerateContentRequest) -> Result<BackendStream>;

    async fn embed(&self, model: &str, request: &BatchEmbedContentsRequest) -> Result<BatchEmbedContentsResponse>;

    async fn list_models(&self) -> Result<Vec<ModelInfo>>;
}
