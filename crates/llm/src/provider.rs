//! LLM provider trait for streaming chat completions
//!
//! Vendor adapters implement `LlmProvider` and translate their wire protocol
//! into [`LlmResultChunk`]s pushed onto a [`Stream`].

use async_trait::async_trait;
use dyn_clone::DynClone;
use streams::Stream;
use tokio_util::sync::CancellationToken;

use crate::{ChatRequest, LlmError, LlmResultChunk};

/// Result type for LLM operations
pub type Result<T> = std::result::Result<T, LlmError>;

/// Trait for streaming LLM providers
///
/// # Example
///
/// ```ignore
/// use llm::{ChatRequest, LlmProvider, LlmResultChunk, Result};
/// use streams::Stream;
/// use tokio_util::sync::CancellationToken;
///
/// #[derive(Clone)]
/// struct MyProvider;
///
/// #[async_trait::async_trait]
/// impl LlmProvider for MyProvider {
///     fn name(&self) -> &str {
///         "my-provider"
///     }
///
///     async fn chat_stream(
///         &self,
///         cancel: &CancellationToken,
///         request: ChatRequest,
///     ) -> Result<Stream<LlmResultChunk>> {
///         let stream = Stream::new(cancel, 16);
///         // spawn a task that sends chunks, then closes the stream
///         Ok(stream)
///     }
/// }
/// ```
#[async_trait]
pub trait LlmProvider: Send + Sync + DynClone {
  /// The name of this provider (for logging/identification)
  fn name(&self) -> &str;

  /// Check if this provider is configured and reachable
  fn is_available(&self) -> bool {
    true
  }

  /// Open a streaming call.
  ///
  /// The returned stream lives under `cancel`: cancelling it must end the
  /// stream. A failure to open is returned here; a failure mid-stream is
  /// delivered through [`Stream::send_error`].
  async fn chat_stream(&self, cancel: &CancellationToken, request: ChatRequest) -> Result<Stream<LlmResultChunk>>;
}

dyn_clone::clone_trait_object!(LlmProvider);
