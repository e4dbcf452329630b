//! Single-in-flight admission for the command wire.
//!
//! Ordinary replies carry no correlation id, so only one command may be
//! waiting for its terminal reply at a time. Callers queue here in arrival
//! order and are granted the wire one by one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};

/// FIFO grant of the wire, backed by a one-permit fair semaphore.
#[derive(Debug)]
pub struct Sequencer {
  wire: Arc<Semaphore>,
  waiting: AtomicUsize,
}

impl Sequencer {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      wire: Arc::new(Semaphore::new(1)),
      waiting: AtomicUsize::new(0),
    })
  }

  /// Wait for the wire. The returned permit releases it on drop. A caller
  /// dropped while queued gives up its place.
  pub async fn acquire(&self) -> Result<Permit> {
    let _queued = Queued::enter(&self.waiting);
    let permit = self
      .wire
      .clone()
      .acquire_owned()
      .await
      .map_err(|_| Error::ChannelClosed)?;
    Ok(Permit { _permit: permit })
  }

  /// Try to take the wire without queueing.
  pub fn try_acquire(&self) -> Option<Permit> {
    let permit = self.wire.clone().try_acquire_owned().ok()?;
    Some(Permit { _permit: permit })
  }

  pub fn is_held(&self) -> bool {
    self.wire.available_permits() == 0
  }

  /// Callers currently queued behind the holder
  pub fn queued(&self) -> usize {
    self.waiting.load(Ordering::SeqCst)
  }
}

/// Exclusive right to talk on the wire.
#[derive(Debug)]
pub struct Permit {
  _permit: OwnedSemaphorePermit,
}

struct Queued<'a>(&'a AtomicUsize);

impl<'a> Queued<'a> {
  fn enter(count: &'a AtomicUsize) -> Self {
    count.fetch_add(1, Ordering::SeqCst);
    Self(count)
  }
}

impl Drop for Queued<'_> {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;

  #[tokio::test]
  async fn test_free_wire_is_granted_immediately() {
    let seq = Sequencer::new();
    let permit = seq.acquire().await.unwrap();
    assert!(seq.is_held());
    assert!(seq.try_acquire().is_none());
    drop(permit);
    assert!(!seq.is_held());
    assert!(seq.try_acquire().is_some());
  }

  #[tokio::test]
  async fn test_waiters_are_granted_in_arrival_order() {
    let seq = Sequencer::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    let active = Arc::new(AtomicUsize::new(0));
    let first = seq.acquire().await.unwrap();

    let waiters = (0..8).map(|i| {
      let seq = seq.clone();
      let order = order.clone();
      let active = active.clone();
      async move {
        let _permit = seq.acquire().await.unwrap();
        assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
        order.lock().unwrap().push(i);
        tokio::task::yield_now().await;
        active.fetch_sub(1, Ordering::SeqCst);
      }
    });

    tokio::join!(
      async {
        tokio::task::yield_now().await;
        assert_eq!(seq.queued(), 8);
        drop(first);
      },
      futures::future::join_all(waiters),
    );

    assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
    assert!(!seq.is_held());
  }

  #[tokio::test]
  async fn test_abandoned_waiter_is_skipped() {
    let seq = Sequencer::new();
    let first = seq.acquire().await.unwrap();

    let abandoned = seq.clone();
    let waiter = tokio::spawn(async move {
      let _permit = abandoned.acquire().await.unwrap();
    });
    tokio::task::yield_now().await;
    assert_eq!(seq.queued(), 1);
    waiter.abort();
    let _ = waiter.await;
    assert_eq!(seq.queued(), 0);

    drop(first);
    assert!(!seq.is_held());
    let _again = seq.acquire().await.unwrap();
    assert!(seq.is_held());
  }
}
