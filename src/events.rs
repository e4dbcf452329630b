//! Event registry: routes `EVENT` lines to whoever issued the QUERY or SUGGEST.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result};

/// Inline event handler used by the blocking connection
pub type Callback = Box<dyn FnOnce(Vec<String>) + Send>;

/// Where an event payload goes once it arrives.
pub enum Sink {
  /// Resolves a [`PendingResult`] held by an async caller.
  Deferred(oneshot::Sender<Vec<String>>),
  /// Runs on the thread that reads the event line.
  Callback(Callback),
}

impl Sink {
  pub fn deferred() -> (Self, oneshot::Receiver<Vec<String>>) {
    let (tx, rx) = oneshot::channel();
    (Sink::Deferred(tx), rx)
  }

  pub fn callback<F>(f: F) -> Self
  where
    F: FnOnce(Vec<String>) + Send + 'static,
  {
    Sink::Callback(Box::new(f))
  }

  fn deliver(self, id: &str, payload: Vec<String>) {
    match self {
      Sink::Deferred(tx) => {
        if tx.send(payload).is_err() {
          debug!(event_id = %id, "event result abandoned by caller");
        }
      }
      Sink::Callback(f) => f(payload),
    }
  }
}

impl std::fmt::Debug for Sink {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Sink::Deferred(_) => f.write_str("Sink::Deferred"),
      Sink::Callback(_) => f.write_str("Sink::Callback"),
    }
  }
}

/// Outstanding event waiters keyed by server-issued event id.
#[derive(Debug, Default)]
pub struct EventRegistry {
  waiters: HashMap<String, Sink>,
}

impl EventRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Store `sink` under `id`. A live id being issued twice means the stream
  /// is no longer trustworthy.
  pub fn register(&mut self, id: impl Into<String>, sink: Sink) -> Result<()> {
    let id = id.into();
    if self.waiters.contains_key(&id) {
      return Err(Error::Protocol(format!("duplicate event id {}", id)));
    }
    self.waiters.insert(id, sink);
    Ok(())
  }

  /// Hand `payload` to the waiter for `id` and forget it. Returns `false` for
  /// unknown ids, which are late or duplicate events and get dropped.
  pub fn deliver(&mut self, id: &str, payload: Vec<String>) -> bool {
    match self.waiters.remove(id) {
      Some(sink) => {
        sink.deliver(id, payload);
        true
      }
      None => false,
    }
  }

  pub fn contains(&self, id: &str) -> bool {
    self.waiters.contains_key(id)
  }

  pub fn len(&self) -> usize {
    self.waiters.len()
  }

  pub fn is_empty(&self) -> bool {
    self.waiters.is_empty()
  }

  /// Drop every waiter. Deferred callers observe `ChannelClosed`.
  pub fn clear(&mut self) {
    self.waiters.clear();
  }
}

/// Result of a QUERY or SUGGEST that is still in flight on the server.
///
/// Awaiting it yields the event payload. Dropping it is harmless: the event
/// is still read off the wire and discarded.
#[derive(Debug)]
pub struct PendingResult {
  id: String,
  rx: oneshot::Receiver<Vec<String>>,
}

impl PendingResult {
  pub(crate) fn new(id: String, rx: oneshot::Receiver<Vec<String>>) -> Self {
    Self { id, rx }
  }

  /// Event id the server assigned to this request
  pub fn id(&self) -> &str {
    &self.id
  }
}

impl Future for PendingResult {
  type Output = Result<Vec<String>>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    self
      .rx
      .poll_unpin(cx)
      .map(|res| res.map_err(|_| Error::ChannelClosed))
  }
}
