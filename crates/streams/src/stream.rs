//! Bounded, cancellable producer/consumer queue
//!
//! A [`Stream`] is the transport every higher-level component is built on:
//! actor mailboxes, the event bus inbound queue and the per-response chat
//! event feed.
//!
//! # Termination
//!
//! ```text
//!   close_send()          -> buffered items, then Ok(None)
//!   send_error(e)         -> buffered items, then Err(e)
//!   parent cancelled      -> buffered items, then Err(ContextAlreadyDone)
//!   force_close()         -> Ok(None) immediately, buffer discarded
//! ```
//!
//! Every stream owns a child of the caller's [`CancellationToken`]. Closing
//! cancels that child, so a blocked `recv` or `send` wakes immediately, and
//! cancelling the parent tears the stream down without an explicit close.
//! Cancellation never propagates upward.

use std::{
  fmt,
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
};

use parking_lot::{Mutex as SyncMutex, MutexGuard};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
  /// The parent scope was cancelled
  #[error("context already done")]
  ContextAlreadyDone,
  /// The stream was closed by its owner
  #[error("channel closed")]
  ChannelClosed,
  /// Non-blocking send found the buffer full
  #[error("stream buffer is full")]
  Full,
  /// Terminal error reported by the producer
  #[error("{0}")]
  Upstream(String),
}

impl StreamError {
  pub fn upstream(err: impl fmt::Display) -> Self {
    Self::Upstream(err.to_string())
  }
}

/// Liveness of a stream as seen by [`Stream::state`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
  Active,
  Closed,
}

// ============================================================================
// Stream
// ============================================================================

/// A bounded queue with a single-slot terminal error.
///
/// Clones share the same queue. Any number of tasks may send; receiving is
/// serialized so items are observed in send order.
pub struct Stream<T> {
  inner: Arc<Inner<T>>,
}

struct Inner<T> {
  tx: mpsc::Sender<T>,
  rx: Mutex<mpsc::Receiver<T>>,
  close: SyncMutex<CloseState>,
  discard: AtomicBool,
  cancel: CancellationToken,
  capacity: usize,
}

#[derive(Default)]
struct CloseState {
  closed: bool,
  /// Closed because the parent scope was cancelled rather than by the owner
  torn_down: bool,
  error: Option<StreamError>,
}

impl<T> Clone for Stream<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T> fmt::Debug for Stream<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Stream")
      .field("capacity", &self.inner.capacity)
      .field("buffered", &self.len())
      .field("state", &self.state())
      .finish()
  }
}

impl<T> Stream<T> {
  /// Create a stream whose lifetime is bounded by `parent`.
  ///
  /// A zero capacity is rounded up to one.
  pub fn new(parent: &CancellationToken, capacity: usize) -> Self {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);

    Self {
      inner: Arc::new(Inner {
        tx,
        rx: Mutex::new(rx),
        close: SyncMutex::new(CloseState::default()),
        discard: AtomicBool::new(false),
        cancel: parent.child_token(),
        capacity,
      }),
    }
  }

  /// Enqueue an item, waiting for room.
  ///
  /// Fails with `ChannelClosed` once the owner closed the stream and with
  /// `ContextAlreadyDone` once the parent scope was cancelled, even if the
  /// call was already waiting for room.
  pub async fn send(&self, item: T) -> Result<(), StreamError> {
    if self.inner.cancel.is_cancelled() {
      return Err(self.inner.settle());
    }

    tokio::select! {
      biased;

      _ = self.inner.cancel.cancelled() => Err(self.inner.settle()),
      result = self.inner.tx.send(item) => result.map_err(|_| StreamError::ChannelClosed),
    }
  }

  /// Enqueue an item without waiting; `Full` when the buffer has no room.
  pub fn try_send(&self, item: T) -> Result<(), StreamError> {
    if self.inner.cancel.is_cancelled() {
      return Err(self.inner.settle());
    }

    self.inner.tx.try_send(item).map_err(|e| match e {
      mpsc::error::TrySendError::Full(_) => StreamError::Full,
      mpsc::error::TrySendError::Closed(_) => StreamError::ChannelClosed,
    })
  }

  /// Record the terminal error and close the stream.
  ///
  /// Only the first terminal error is kept; later calls fail.
  pub fn send_error(&self, err: StreamError) -> Result<(), StreamError> {
    if self.inner.cancel.is_cancelled() {
      return Err(self.inner.settle());
    }

    if self.inner.close_with(Some(err)) {
      Ok(())
    } else {
      Err(StreamError::ChannelClosed)
    }
  }

  /// Receive the next item.
  ///
  /// `Ok(Some)` carries data, `Ok(None)` means the stream drained to
  /// completion and `Err` is the terminal error. The terminal error is handed
  /// out once; later calls report `Ok(None)`.
  pub async fn recv(&self) -> Result<Option<T>, StreamError> {
    let mut rx = self.inner.rx.lock().await;

    if self.inner.discard.load(Ordering::Acquire) {
      while rx.try_recv().is_ok() {}
      return self.inner.terminus();
    }

    tokio::select! {
      biased;

      item = rx.recv() => match item {
        Some(item) => Ok(Some(item)),
        None => self.inner.terminus(),
      },
      _ = self.inner.cancel.cancelled() => match rx.try_recv() {
        Ok(item) => Ok(Some(item)),
        Err(_) => self.inner.terminus(),
      },
    }
  }

  /// Close the stream for sending. Buffered items remain receivable.
  ///
  /// Returns `true` for the single call that performed the close.
  pub fn close_send(&self) -> bool {
    self.inner.close_with(None)
  }

  /// Close the stream and drop everything still buffered.
  pub fn force_close(&self) {
    self.inner.discard.store(true, Ordering::Release);
    self.inner.close_with(None);
  }

  /// Non-blocking liveness check
  pub fn is_closed(&self) -> bool {
    self.inner.cancel.is_cancelled() || self.inner.lock_close().closed
  }

  pub fn state(&self) -> StreamState {
    if self.is_closed() {
      StreamState::Closed
    } else {
      StreamState::Active
    }
  }

  /// Resolves once the stream is closed or its parent scope is cancelled
  pub async fn closed(&self) {
    self.inner.cancel.cancelled().await
  }

  /// Number of buffered items
  pub fn len(&self) -> usize {
    self.inner.capacity - self.inner.tx.capacity()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn capacity(&self) -> usize {
    self.inner.capacity
  }
}

impl<T: Send + 'static> Stream<T> {
  /// Adapt the receiving side into a [`futures::Stream`] of results,
  /// ending after the terminal item.
  pub fn into_stream(self) -> impl futures::Stream<Item = Result<T, StreamError>> + Send {
    futures::stream::unfold(Some(self), |state| async move {
      let stream = state?;
      match stream.recv().await {
        Ok(Some(item)) => Some((Ok(item), Some(stream))),
        Ok(None) => None,
        Err(e) => Some((Err(e), None)),
      }
    })
  }
}

impl<T> Inner<T> {
  fn lock_close(&self) -> MutexGuard<'_, CloseState> {
    self.close.lock()
  }

  /// Returns `true` if this call transitioned the stream to closed.
  fn close_with(&self, error: Option<StreamError>) -> bool {
    {
      let mut state = self.lock_close();
      if state.closed {
        return false;
      }
      state.closed = true;
      state.error = error;
    }
    // The error is stored before any waiter can observe cancellation
    self.cancel.cancel();
    tracing::trace!("Stream closed");
    true
  }

  /// Account for an observed cancellation and return the error a sender sees.
  fn settle(&self) -> StreamError {
    let mut state = self.lock_close();
    if !state.closed {
      state.closed = true;
      state.torn_down = true;
      state.error = Some(StreamError::ContextAlreadyDone);
    }

    if state.torn_down {
      StreamError::ContextAlreadyDone
    } else {
      StreamError::ChannelClosed
    }
  }

  fn terminus<R>(&self) -> Result<Option<R>, StreamError> {
    self.settle();
    match self.lock_close().error.take() {
      Some(err) => Err(err),
      None => Ok(None),
    }
  }
}
