//! Cancellable streaming primitive shared by the actor, bus and chat crates.

mod stream;

pub use stream::{Stream, StreamError, StreamState};
