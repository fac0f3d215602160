//! The abstract model surface.
//!
//! The engine never speaks HTTP to a provider; it sees this trait only.
//! Adapters translate [`ModelRequest`]s to a concrete wire format out of
//! tree. [`mock::MockModelClient`] is the in-tree implementation used by
//! tests and embedded development.

pub mod mock;
mod stream;
mod types;

pub use stream::{accumulate, ModelStream, StreamEvent};
pub use types::{
    BatchHandle, BatchItemResult, BatchRequestItem, BatchResultItem, ModelMessage, ModelRequest,
    ModelResponse, ToolSpec,
};

use am_domain::Result;

/// A boxed async stream, used for streaming responses and batch results.
pub type BoxStream<'a, T> = std::pin::Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Trait every model adapter must implement.
#[async_trait::async_trait]
pub trait ModelClient: Send + Sync {
    /// Count the tokens of a message list via the provider's endpoint.
    async fn count_tokens(&self, model: &str, messages: &[ModelMessage]) -> Result<u64>;

    /// Open a streaming model call. Events accumulate into a final
    /// response; see [`accumulate`].
    async fn stream(&self, req: ModelRequest) -> Result<ModelStream>;

    /// Submit a batch of requests. Each item carries a caller-supplied
    /// `custom_id` (the engine uses the iteration id).
    async fn submit_batch(&self, requests: Vec<BatchRequestItem>) -> Result<BatchHandle>;

    /// Fetch the current status of a batch.
    async fn get_batch(&self, batch_id: &str) -> Result<BatchHandle>;

    /// Stream the per-request results of an ended batch.
    async fn batch_results(&self, batch_id: &str) -> Result<BoxStream<'static, Result<BatchResultItem>>>;
}
