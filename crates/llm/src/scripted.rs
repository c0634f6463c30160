//! Deterministic in-process provider
//!
//! Plays back a fixed list of steps instead of calling a vendor API. Used by
//! the CLI demo and by every chat runner test.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use streams::{Stream, StreamError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{ChatRequest, FINISH_STOP, LlmError, LlmProvider, LlmResultChunk, Result};

const DEFAULT_STREAM_CAPACITY: usize = 16;

/// One scripted action on the chunk stream
#[derive(Debug, Clone)]
pub enum ScriptStep {
  /// Emit a chunk
  Chunk(LlmResultChunk),
  /// End the stream with an upstream error
  Error(String),
  /// Emit nothing more until the stream is closed or cancelled
  Hang,
}

#[derive(Clone)]
pub struct ScriptedProvider {
  inner: Arc<ScriptedInner>,
}

struct ScriptedInner {
  name: String,
  steps: Vec<ScriptStep>,
  chunk_delay: Option<Duration>,
  open_error: Option<String>,
  capacity: usize,
  available: bool,
  requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
  pub fn new(name: impl Into<String>, steps: Vec<ScriptStep>) -> Self {
    Self {
      inner: Arc::new(ScriptedInner {
        name: name.into(),
        steps,
        chunk_delay: None,
        open_error: None,
        capacity: DEFAULT_STREAM_CAPACITY,
        available: true,
        requests: Mutex::new(Vec::new()),
      }),
    }
  }

  /// Stream `parts` as text deltas, then finish with `stop`.
  pub fn from_text(model: &str, parts: &[&str]) -> Self {
    let mut steps: Vec<ScriptStep> = parts
      .iter()
      .enumerate()
      .map(|(i, part)| ScriptStep::Chunk(LlmResultChunk::text(model, i as u64, *part)))
      .collect();
    steps.push(ScriptStep::Chunk(LlmResultChunk::finish(
      model,
      parts.len() as u64,
      FINISH_STOP,
      None,
    )));
    Self::new("scripted", steps)
  }

  /// A provider whose `chat_stream` fails before producing a stream
  pub fn failing(message: impl Into<String>) -> Self {
    let mut provider = Self::new("scripted", Vec::new());
    provider.with_inner(|inner| inner.open_error = Some(message.into()));
    provider
  }

  /// Sleep before every step
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.with_inner(|inner| inner.chunk_delay = Some(delay));
    self
  }

  /// Buffer size of every chunk stream this provider opens
  pub fn with_capacity(mut self, capacity: usize) -> Self {
    self.with_inner(|inner| inner.capacity = capacity.max(1));
    self
  }

  /// Report the provider as unavailable, so callers refuse to open streams
  pub fn unavailable(mut self) -> Self {
    self.with_inner(|inner| inner.available = false);
    self
  }

  pub fn capacity(&self) -> usize {
    self.inner.capacity
  }

  /// Every request seen so far, oldest first
  pub fn requests(&self) -> Vec<ChatRequest> {
    self.inner.requests.lock().clone()
  }

  pub fn last_request(&self) -> Option<ChatRequest> {
    self.inner.requests.lock().last().cloned()
  }

  fn with_inner(&mut self, f: impl FnOnce(&mut ScriptedInner)) {
    // Builders run before the provider is shared
    if let Some(inner) = Arc::get_mut(&mut self.inner) {
      f(inner);
    }
  }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
  fn name(&self) -> &str {
    &self.inner.name
  }

  fn is_available(&self) -> bool {
    self.inner.available
  }

  async fn chat_stream(&self, cancel: &CancellationToken, request: ChatRequest) -> Result<Stream<LlmResultChunk>> {
    debug!(
      provider = %self.inner.name,
      model = %request.model,
      messages = request.messages.len(),
      "Opening scripted stream"
    );
    self.inner.requests.lock().push(request);

    if cancel.is_cancelled() {
      return Err(LlmError::Cancelled);
    }
    if !self.inner.available {
      return Err(LlmError::Unavailable(self.inner.name.clone()));
    }
    if let Some(message) = &self.inner.open_error {
      return Err(LlmError::Request(message.clone()));
    }

    let stream = Stream::new(cancel, self.inner.capacity);
    tokio::spawn(play(Arc::clone(&self.inner), stream.clone()));
    Ok(stream)
  }
}

async fn play(inner: Arc<ScriptedInner>, stream: Stream<LlmResultChunk>) {
  for step in &inner.steps {
    if let Some(delay) = inner.chunk_delay {
      tokio::select! {
        _ = stream.closed() => return,
        _ = tokio::time::sleep(delay) => {}
      }
    }

    match step {
      ScriptStep::Chunk(chunk) => {
        if let Err(e) = stream.send(chunk.clone()).await {
          trace!(error = %e, "Scripted stream closed by consumer");
          return;
        }
      }
      ScriptStep::Error(message) => {
        let _ = stream.send_error(StreamError::upstream(message));
        return;
      }
      ScriptStep::Hang => {
        stream.closed().await;
        return;
      }
    }
  }

  stream.close_send();
}
